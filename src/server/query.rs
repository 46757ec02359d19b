// Pushdown query compilation for typed tables.
//
// The grammar covers projections and conjunctions of column/argument
// comparisons:
//
// ```text
// query      := '*' | projection (':' predicate)? | predicate
// projection := '{' ident (',' ident)* '}'
// predicate  := term ('&&' term)*
// term       := ident cmp '?' digits
// cmp        := '==' | '!=' | '>=' | '<=' | '>' | '<'
// ```
//
// Argument ordinals are 1-based in the text. Parse failures report the
// offending span as a query error.

use crate::engine::types::{ColumnValue, QueryPlan, RowData, RowDescriptor};
use crate::error::{RemoteError, Result};
use crate::protocol::wire::{get_bool, get_bytes, get_f64, get_i64, get_str, get_u16, get_u64, get_u8};
use bytes::{Buf, BufMut, BytesMut};
use std::cmp::Ordering;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmpOp {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
}

impl CmpOp {
    fn matches(self, ordering: Ordering) -> bool {
        match self {
            CmpOp::Eq => ordering == Ordering::Equal,
            CmpOp::Ne => ordering != Ordering::Equal,
            CmpOp::Ge => ordering != Ordering::Less,
            CmpOp::Le => ordering != Ordering::Greater,
            CmpOp::Gt => ordering == Ordering::Greater,
            CmpOp::Lt => ordering == Ordering::Less,
        }
    }

    fn text(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Ge => ">=",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Lt => "<",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Term {
    pub column: usize,
    pub column_name: String,
    pub op: CmpOp,
    /// Zero-based argument slot.
    pub arg: usize,
}

/// A compiled predicate and projection over one row descriptor.
#[derive(Debug, Clone)]
pub(crate) struct PreparedQuery {
    pub text: String,
    pub projection: Option<Vec<String>>,
    pub terms: Vec<Term>,
    pub arg_count: usize,
}

struct Scanner<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(text: &'a str) -> Self {
        Scanner { text, pos: 0 }
    }

    fn skip_ws(&mut self) {
        while self.pos < self.text.len() && self.text.as_bytes()[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn done(&mut self) -> bool {
        self.skip_ws();
        self.pos >= self.text.len()
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.text.as_bytes().get(self.pos).copied()
    }

    fn eat(&mut self, token: &str) -> bool {
        self.skip_ws();
        if self.text[self.pos..].starts_with(token) {
            self.pos += token.len();
            true
        } else {
            false
        }
    }

    fn ident(&mut self) -> Result<(String, usize, usize)> {
        self.skip_ws();
        let start = self.pos;
        let bytes = self.text.as_bytes();
        while self.pos < bytes.len()
            && (bytes[self.pos].is_ascii_alphanumeric() || bytes[self.pos] == b'_')
        {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(RemoteError::query(
                "expected a column name",
                start as u32,
                (start + 1).min(self.text.len()) as u32,
            ));
        }
        Ok((self.text[start..self.pos].to_string(), start, self.pos))
    }

    fn cmp(&mut self) -> Result<(CmpOp, usize)> {
        self.skip_ws();
        let start = self.pos;
        for (token, op) in [
            ("==", CmpOp::Eq),
            ("!=", CmpOp::Ne),
            (">=", CmpOp::Ge),
            ("<=", CmpOp::Le),
            (">", CmpOp::Gt),
            ("<", CmpOp::Lt),
        ] {
            if self.eat(token) {
                return Ok((op, start));
            }
        }
        Err(RemoteError::query(
            "expected a comparison operator",
            start as u32,
            (start + 2).min(self.text.len()) as u32,
        ))
    }

    fn argument(&mut self) -> Result<usize> {
        self.skip_ws();
        let start = self.pos;
        if !self.eat("?") {
            return Err(RemoteError::query(
                "expected an argument reference",
                start as u32,
                (start + 1).min(self.text.len()) as u32,
            ));
        }
        let digits_start = self.pos;
        let bytes = self.text.as_bytes();
        while self.pos < bytes.len() && bytes[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        let ordinal: usize = self.text[digits_start..self.pos].parse().map_err(|_| {
            RemoteError::query(
                "argument ordinal must be a number",
                start as u32,
                self.pos.max(start + 1) as u32,
            )
        })?;
        if ordinal == 0 {
            return Err(RemoteError::query(
                "argument ordinals are 1-based",
                start as u32,
                self.pos as u32,
            ));
        }
        Ok(ordinal)
    }
}

impl PreparedQuery {
    pub fn parse(descriptor: &RowDescriptor, text: &str) -> Result<PreparedQuery> {
        let mut scanner = Scanner::new(text);
        let mut projection = None;

        if scanner.eat("*") {
            if !scanner.done() {
                let pos = scanner.pos as u32;
                return Err(RemoteError::query(
                    "unexpected trailing input",
                    pos,
                    text.len() as u32,
                ));
            }
            return Ok(PreparedQuery {
                text: text.to_string(),
                projection: None,
                terms: Vec::new(),
                arg_count: 0,
            });
        }

        if scanner.eat("{") {
            let mut columns = Vec::new();
            loop {
                let (name, start, end) = scanner.ident()?;
                if descriptor.column_index(&name).is_none() {
                    return Err(RemoteError::query(
                        format!("no such column: {}", name),
                        start as u32,
                        end as u32,
                    ));
                }
                columns.push(name);
                if scanner.eat(",") {
                    continue;
                }
                if scanner.eat("}") {
                    break;
                }
                let pos = scanner.pos as u32;
                return Err(RemoteError::query(
                    "expected ',' or '}'",
                    pos,
                    pos + 1,
                ));
            }
            projection = Some(columns);
            if scanner.done() {
                return Ok(PreparedQuery {
                    text: text.to_string(),
                    projection,
                    terms: Vec::new(),
                    arg_count: 0,
                });
            }
            if !scanner.eat(":") {
                let pos = scanner.pos as u32;
                return Err(RemoteError::query(
                    "expected ':' before the predicate",
                    pos,
                    pos + 1,
                ));
            }
        }

        let mut terms = Vec::new();
        let mut arg_count = 0usize;
        loop {
            let (name, start, end) = scanner.ident()?;
            let column = descriptor.column_index(&name).ok_or_else(|| {
                RemoteError::query(
                    format!("no such column: {}", name),
                    start as u32,
                    end as u32,
                )
            })?;
            let (op, _) = scanner.cmp()?;
            let ordinal = scanner.argument()?;
            arg_count = arg_count.max(ordinal);
            terms.push(Term {
                column,
                column_name: name,
                op,
                arg: ordinal - 1,
            });
            if scanner.eat("&&") {
                continue;
            }
            break;
        }
        if !scanner.done() {
            let pos = scanner.pos as u32;
            return Err(RemoteError::query(
                "unexpected trailing input",
                pos,
                text.len() as u32,
            ));
        }

        Ok(PreparedQuery {
            text: text.to_string(),
            projection,
            terms,
            arg_count,
        })
    }

    /// Evaluate the predicate against a decoded row.
    pub fn matches(&self, row: &RowData, args: &[Option<ColumnValue>]) -> Result<bool> {
        for term in &self.terms {
            let arg = args.get(term.arg).ok_or_else(|| {
                RemoteError::illegal_state(format!(
                    "query needs {} arguments, got {}",
                    self.arg_count,
                    args.len()
                ))
            })?;
            let value = row.values.get(term.column).and_then(|v| v.as_ref());
            let ok = match (value, arg) {
                (Some(v), Some(a)) => term.op.matches(v.compare(a)),
                (None, None) => term.op == CmpOp::Eq,
                _ => term.op == CmpOp::Ne,
            };
            if !ok {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Build the whitelisted plan tree for this query.
    pub fn plan(&self, table: &str, reverse: bool) -> QueryPlan {
        let scan = QueryPlan::FullScan {
            table: table.to_string(),
            reverse,
        };
        if self.terms.is_empty() {
            return scan;
        }
        let expression = self
            .terms
            .iter()
            .map(|t| format!("{} {} ?{}", t.column_name, t.op.text(), t.arg + 1))
            .collect::<Vec<_>>()
            .join(" && ");
        QueryPlan::Filter {
            expression,
            child: Box::new(scan),
        }
    }

    /// Descriptor of projected rows. Key columns are always retained so the
    /// projected rows stay addressable.
    pub fn projected_descriptor(&self, base: &Arc<RowDescriptor>) -> Arc<RowDescriptor> {
        let Some(projection) = &self.projection else {
            return base.clone();
        };
        let columns = base
            .columns
            .iter()
            .filter(|c| c.key || projection.iter().any(|p| p == &c.name))
            .cloned()
            .collect();
        Arc::new(RowDescriptor::new(columns))
    }

    /// Re-encode a row under the projected descriptor.
    pub fn project(&self, row: &RowData, projected: &Arc<RowDescriptor>) -> RowData {
        if self.projection.is_none() {
            return row.clone();
        }
        let mut out = RowData::new(projected.clone());
        for (idx, col) in projected.columns.iter().enumerate() {
            if let Some(src) = row.descriptor.column_index(&col.name) {
                out.values[idx] = row.values[src].clone();
            }
        }
        out
    }
}

const ARG_NULL: u8 = 0;
const ARG_I64: u8 = 1;
const ARG_U64: u8 = 2;
const ARG_F64: u8 = 3;
const ARG_UTF8: u8 = 4;
const ARG_BYTES: u8 = 5;
const ARG_BOOL: u8 = 6;

/// Encode bound query arguments.
pub(crate) fn encode_args(args: &[Option<ColumnValue>], buf: &mut BytesMut) {
    buf.put_u16_le(args.len() as u16);
    for arg in args {
        match arg {
            None => buf.put_u8(ARG_NULL),
            Some(ColumnValue::Int64(v)) => {
                buf.put_u8(ARG_I64);
                buf.put_u64_le(*v as u64);
            }
            Some(ColumnValue::Uint64(v)) => {
                buf.put_u8(ARG_U64);
                buf.put_u64_le(*v);
            }
            Some(ColumnValue::Float64(v)) => {
                buf.put_u8(ARG_F64);
                buf.put_u64_le(v.to_bits());
            }
            Some(ColumnValue::Utf8(v)) => {
                buf.put_u8(ARG_UTF8);
                buf.put_u32_le(v.len() as u32);
                buf.put_slice(v.as_bytes());
            }
            Some(ColumnValue::Bytes(v)) => {
                buf.put_u8(ARG_BYTES);
                buf.put_u32_le(v.len() as u32);
                buf.put_slice(v);
            }
            Some(ColumnValue::Bool(v)) => {
                buf.put_u8(ARG_BOOL);
                buf.put_u8(*v as u8);
            }
        }
    }
}

pub(crate) fn decode_args(buf: &mut impl Buf) -> Result<Vec<Option<ColumnValue>>> {
    let count = get_u16(buf)? as usize;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        args.push(match get_u8(buf)? {
            ARG_NULL => None,
            ARG_I64 => Some(ColumnValue::Int64(get_i64(buf)?)),
            ARG_U64 => Some(ColumnValue::Uint64(get_u64(buf)?)),
            ARG_F64 => Some(ColumnValue::Float64(get_f64(buf)?)),
            ARG_UTF8 => Some(ColumnValue::Utf8(get_str(buf)?)),
            ARG_BYTES => Some(ColumnValue::Bytes(get_bytes(buf)?)),
            ARG_BOOL => Some(ColumnValue::Bool(get_bool(buf)?)),
            other => {
                return Err(RemoteError::io(format!(
                    "unknown argument discriminator {}",
                    other
                )))
            }
        });
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::{ColumnDef, ColumnType};

    fn descriptor() -> Arc<RowDescriptor> {
        Arc::new(RowDescriptor::new(vec![
            ColumnDef {
                name: "id".to_string(),
                type_code: ColumnType::Int64,
                key: true,
                nullable: false,
            },
            ColumnDef {
                name: "name".to_string(),
                type_code: ColumnType::Utf8,
                key: false,
                nullable: false,
            },
            ColumnDef {
                name: "score".to_string(),
                type_code: ColumnType::Float64,
                key: false,
                nullable: true,
            },
        ]))
    }

    #[test]
    fn test_parse_star() {
        let q = PreparedQuery::parse(&descriptor(), "*").unwrap();
        assert!(q.terms.is_empty());
        assert_eq!(q.arg_count, 0);
    }

    #[test]
    fn test_parse_conjunction() {
        let q = PreparedQuery::parse(&descriptor(), "name == ?1 && score >= ?2").unwrap();
        assert_eq!(q.terms.len(), 2);
        assert_eq!(q.arg_count, 2);
        assert_eq!(q.terms[0].op, CmpOp::Eq);
        assert_eq!(q.terms[1].op, CmpOp::Ge);
    }

    #[test]
    fn test_parse_projection() {
        let q = PreparedQuery::parse(&descriptor(), "{name}: score > ?1").unwrap();
        assert_eq!(q.projection.as_deref(), Some(&["name".to_string()][..]));
        let projected = q.projected_descriptor(&descriptor());
        // Key columns are always retained.
        assert_eq!(projected.columns.len(), 2);
        assert_eq!(projected.columns[0].name, "id");
        assert_eq!(projected.columns[1].name, "name");
    }

    #[test]
    fn test_parse_error_has_span() {
        let err = PreparedQuery::parse(&descriptor(), "bogus == ?1").unwrap_err();
        match err {
            RemoteError::Query { start, end, .. } => {
                assert_eq!(start, 0);
                assert_eq!(end, 5);
            }
            other => panic!("expected a query error, got {}", other),
        }
    }

    #[test]
    fn test_matches() {
        let descriptor = descriptor();
        let q = PreparedQuery::parse(&descriptor, "name == ?1 && score >= ?2").unwrap();
        let mut row = RowData::new(descriptor);
        row.set("id", ColumnValue::Int64(1)).unwrap();
        row.set("name", ColumnValue::Utf8("ada".to_string())).unwrap();
        row.set("score", ColumnValue::Float64(9.5)).unwrap();
        let args = vec![
            Some(ColumnValue::Utf8("ada".to_string())),
            Some(ColumnValue::Float64(9.0)),
        ];
        assert!(q.matches(&row, &args).unwrap());
        let args = vec![
            Some(ColumnValue::Utf8("ada".to_string())),
            Some(ColumnValue::Float64(9.9)),
        ];
        assert!(!q.matches(&row, &args).unwrap());
    }

    #[test]
    fn test_plan_shape() {
        let q = PreparedQuery::parse(&descriptor(), "score > ?1").unwrap();
        match q.plan("people", false) {
            QueryPlan::Filter { expression, child } => {
                assert_eq!(expression, "score > ?1");
                assert!(matches!(*child, QueryPlan::FullScan { .. }));
            }
            other => panic!("unexpected plan {:?}", other),
        }
    }

    #[test]
    fn test_args_round_trip() {
        let args = vec![
            None,
            Some(ColumnValue::Int64(-3)),
            Some(ColumnValue::Utf8("x".to_string())),
            Some(ColumnValue::Bool(true)),
        ];
        let mut buf = BytesMut::new();
        encode_args(&args, &mut buf);
        let mut bytes = buf.freeze();
        assert_eq!(decode_args(&mut bytes).unwrap(), args);
    }
}
