// Compiled per-descriptor row proxies and the server-side table objects.
//
// A row proxy moves binary rows between the wire and the engine without
// intermediate decoding; only partial updates (dirty-column merges) decode,
// patch, and re-encode through the descriptor.

use super::query::PreparedQuery;
use crate::engine::types::{decode_partial, ColumnValue, RowData, RowDescriptor};
use crate::engine::{Index, Transaction, View};
use crate::error::{RemoteError, Result};
use std::sync::Arc;

/// Server-side table: an index interpreted through a row descriptor.
///
/// Derived tables additionally carry the bound query that filters and
/// projects the source rows.
pub(crate) struct ServerTable {
    pub index: Arc<dyn Index>,
    pub descriptor: Arc<RowDescriptor>,
    pub derived: Option<DerivedSpec>,
}

pub(crate) struct DerivedSpec {
    pub source: Arc<RowDescriptor>,
    pub query: PreparedQuery,
    pub args: Vec<Option<ColumnValue>>,
}

impl ServerTable {
    pub fn base(index: Arc<dyn Index>, descriptor: Arc<RowDescriptor>) -> ServerTable {
        ServerTable {
            index,
            descriptor,
            derived: None,
        }
    }

    /// Build the derived table for a bound query against this table.
    pub fn derive(
        &self,
        query: PreparedQuery,
        args: Vec<Option<ColumnValue>>,
    ) -> Result<ServerTable> {
        if self.derived.is_some() {
            return Err(RemoteError::unsupported(
                "cannot derive from a derived table",
            ));
        }
        let projected = query.projected_descriptor(&self.descriptor);
        Ok(ServerTable {
            index: self.index.clone(),
            descriptor: projected,
            derived: Some(DerivedSpec {
                source: self.descriptor.clone(),
                query,
                args,
            }),
        })
    }

    /// The descriptor rows decode with before this table's own filtering.
    fn source_descriptor(&self) -> &Arc<RowDescriptor> {
        match &self.derived {
            Some(spec) => &spec.source,
            None => &self.descriptor,
        }
    }

    /// Collect the rows this table exposes, optionally filtered further by a
    /// scanner query, in key order.
    pub fn scan_rows(
        &self,
        txn: Option<&Arc<dyn Transaction>>,
        extra: Option<(&PreparedQuery, &[Option<ColumnValue>])>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let raw = self.raw_entries(txn)?;
        let needs_decode = self.derived.is_some() || extra.is_some();
        if !needs_decode {
            return Ok(raw);
        }
        let source = self.source_descriptor().clone();
        let mut out = Vec::new();
        for (key, value) in raw {
            let row = RowData::decode(source.clone(), &key, &value)?;
            if let Some(spec) = &self.derived {
                if !spec.query.matches(&row, &spec.args)? {
                    continue;
                }
            }
            if let Some((query, args)) = extra {
                if !query.matches(&row, args)? {
                    continue;
                }
            }
            let projected = match &self.derived {
                Some(spec) => spec.query.project(&row, &self.descriptor),
                None => row,
            };
            out.push((projected.encode_key()?, projected.encode_value()?));
        }
        Ok(out)
    }

    fn raw_entries(
        &self,
        txn: Option<&Arc<dyn Transaction>>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut cursor = self.index.new_cursor(txn.cloned())?;
        cursor.set_autoload(true);
        let mut out = Vec::new();
        let mut result = cursor.first();
        loop {
            result?;
            let Some(key) = cursor.key() else {
                break;
            };
            if let Some(value) = cursor.value().into_option() {
                out.push((key.to_vec(), value));
            }
            result = cursor.next();
        }
        Ok(out)
    }
}

/// A compiled per-descriptor proxy bound to one index.
pub(crate) struct RowProxy {
    pub index: Arc<dyn Index>,
    pub descriptor: Arc<RowDescriptor>,
}

impl RowProxy {
    pub fn new(index: Arc<dyn Index>, descriptor: Arc<RowDescriptor>) -> RowProxy {
        RowProxy { index, descriptor }
    }

    pub fn load(
        &self,
        txn: Option<&Arc<dyn Transaction>>,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        self.index.load(txn, key)
    }

    pub fn exists(&self, txn: Option<&Arc<dyn Transaction>>, key: &[u8]) -> Result<bool> {
        self.index.exists(txn, key)
    }

    pub fn store(
        &self,
        txn: Option<&Arc<dyn Transaction>>,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        self.index.store(txn, key, Some(value))
    }

    pub fn exchange(
        &self,
        txn: Option<&Arc<dyn Transaction>>,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        self.index.exchange(txn, key, Some(value))
    }

    pub fn insert(
        &self,
        txn: Option<&Arc<dyn Transaction>>,
        key: &[u8],
        value: &[u8],
    ) -> Result<bool> {
        self.index.insert(txn, key, Some(value))
    }

    pub fn replace(
        &self,
        txn: Option<&Arc<dyn Transaction>>,
        key: &[u8],
        value: &[u8],
    ) -> Result<bool> {
        self.index.replace(txn, key, Some(value))
    }

    /// Apply a dirty-column patch to an existing row.
    pub fn update(
        &self,
        txn: Option<&Arc<dyn Transaction>>,
        key: &[u8],
        partial: &[u8],
    ) -> Result<bool> {
        Ok(self.patch(txn, key, partial)?.is_some())
    }

    /// Apply a dirty-column patch and return the resulting row value.
    pub fn merge(
        &self,
        txn: Option<&Arc<dyn Transaction>>,
        key: &[u8],
        partial: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        self.patch(txn, key, partial)
    }

    pub fn delete(&self, txn: Option<&Arc<dyn Transaction>>, key: &[u8]) -> Result<bool> {
        self.index.delete(txn, key)
    }

    fn patch(
        &self,
        txn: Option<&Arc<dyn Transaction>>,
        key: &[u8],
        partial: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let Some(current) = self.index.load(txn, key)? else {
            return Ok(None);
        };
        let mut row = RowData::decode(self.descriptor.clone(), key, &current)?;
        for (column, value) in decode_partial(&self.descriptor, partial)? {
            row.values[column] = value;
        }
        let updated = row.encode_value()?;
        if self
            .index
            .update_with_old(txn, key, Some(&current), Some(&updated))?
        {
            Ok(Some(updated))
        } else {
            // Lost a race with a concurrent writer; report no change.
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mem::MemDatabase;
    use crate::engine::types::{encode_partial, ColumnDef, ColumnType};
    use crate::engine::Database;
    use bytes::BytesMut;

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

    fn row(id: i64, name: &str, score: Option<f64>) -> RowData {
        let mut row = RowData::new(descriptor());
        row.set("id", ColumnValue::Int64(id)).unwrap();
        row.set("name", ColumnValue::Utf8(name.to_string())).unwrap();
        if let Some(score) = score {
            row.set("score", ColumnValue::Float64(score)).unwrap();
        }
        row
    }

    #[test]
    fn test_partial_round_trip() {
        let descriptor = descriptor();
        let dirty = vec![(2usize, Some(ColumnValue::Float64(5.5)))];
        let mut buf = BytesMut::new();
        encode_partial(&descriptor, &dirty, &mut buf);
        let decoded = decode_partial(&descriptor, &buf).unwrap();
        assert_eq!(decoded, dirty);
    }

    #[test]
    fn test_proxy_point_ops() {
        let db = MemDatabase::new();
        let index = db.open_index(b"rows").unwrap();
        let proxy = RowProxy::new(index, descriptor());

        let r = row(1, "ada", Some(2.0));
        let key = r.encode_key().unwrap();
        let value = r.encode_value().unwrap();
        assert!(proxy.insert(None, &key, &value).unwrap());
        assert!(proxy.exists(None, &key).unwrap());
        assert_eq!(proxy.load(None, &key).unwrap().unwrap(), value);

        let mut patch = BytesMut::new();
        encode_partial(
            &proxy.descriptor,
            &[(2, Some(ColumnValue::Float64(9.0)))],
            &mut patch,
        );
        assert!(proxy.update(None, &key, &patch).unwrap());
        let loaded = proxy.load(None, &key).unwrap().unwrap();
        let merged = RowData::decode(proxy.descriptor.clone(), &key, &loaded).unwrap();
        assert_eq!(merged.get("score"), Some(&ColumnValue::Float64(9.0)));
        assert_eq!(
            merged.get("name"),
            Some(&ColumnValue::Utf8("ada".to_string()))
        );

        assert!(proxy.delete(None, &key).unwrap());
        assert!(!proxy.exists(None, &key).unwrap());
    }

    #[test]
    fn test_derived_table_filters_and_projects() {
        let db = MemDatabase::new();
        let index = db.open_index(b"drows").unwrap();
        let table = ServerTable::base(index.clone(), descriptor());
        for (id, name, score) in [(1, "ada", 9.0), (2, "bob", 3.0), (3, "cyd", 8.0)] {
            let r = row(id, name, Some(score));
            index
                .store(
                    None,
                    &r.encode_key().unwrap(),
                    Some(&r.encode_value().unwrap()),
                )
                .unwrap();
        }
        let query = PreparedQuery::parse(&descriptor(), "{name}: score >= ?1").unwrap();
        let derived = table
            .derive(query, vec![Some(ColumnValue::Float64(5.0))])
            .unwrap();
        let rows = derived.scan_rows(None, None).unwrap();
        assert_eq!(rows.len(), 2);
        let first = RowData::decode(derived.descriptor.clone(), &rows[0].0, &rows[0].1).unwrap();
        assert_eq!(first.get("name"), Some(&ColumnValue::Utf8("ada".to_string())));
        assert_eq!(first.descriptor.columns.len(), 2);
    }
}
