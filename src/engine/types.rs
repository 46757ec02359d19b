// Core value types shared by the engine interface and the wire codecs.
//
// Every enum here travels as a single byte; unknown bytes decode to the
// documented default so that peers with newer vocabularies stay readable.

use crate::error::{RemoteError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;

/// Lock acquisition mode of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockMode {
    /// No locking at all; reads and writes are unguarded.
    Unsafe = 0,

    /// Reads take no locks and may observe uncommitted values.
    ReadUncommitted = 1,

    /// Reads take a shared lock released as soon as the read returns.
    ReadCommitted = 2,

    /// Reads take and hold a shared lock.
    RepeatableRead = 3,

    /// Reads take and hold an upgradable lock.
    UpgradableRead = 4,
}

impl LockMode {
    /// Decode from a wire byte; unknown values map to the engine default.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => LockMode::Unsafe,
            1 => LockMode::ReadUncommitted,
            2 => LockMode::ReadCommitted,
            3 => LockMode::RepeatableRead,
            _ => LockMode::UpgradableRead,
        }
    }

    /// Whether reads under this mode retain their lock.
    pub fn is_repeatable(self) -> bool {
        matches!(self, LockMode::RepeatableRead | LockMode::UpgradableRead)
    }
}

impl Default for LockMode {
    fn default() -> Self {
        LockMode::UpgradableRead
    }
}

/// Outcome of a lock attempt or of a positional cursor operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LockResult {
    /// The request was malformed for the current owner state.
    Illegal = 0,

    /// The waiting thread was interrupted.
    Interrupted = 1,

    /// The wait gave up after the lock timeout.
    TimedOutLock = 2,

    /// The waiter was chosen as the deadlock victim.
    DeadlockVictim = 3,

    /// A new lock was acquired.
    Acquired = 4,

    /// An owned lock was upgraded.
    Upgraded = 5,

    /// A shared lock was already owned.
    OwnedShared = 6,

    /// An upgradable lock was already owned.
    OwnedUpgradable = 7,

    /// An exclusive lock was already owned.
    OwnedExclusive = 8,

    /// No lock is owned and none was requested.
    Unowned = 9,
}

impl LockResult {
    /// Decode from a wire byte; unknown values map to [`LockResult::Illegal`].
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => LockResult::Interrupted,
            2 => LockResult::TimedOutLock,
            3 => LockResult::DeadlockVictim,
            4 => LockResult::Acquired,
            5 => LockResult::Upgraded,
            6 => LockResult::OwnedShared,
            7 => LockResult::OwnedUpgradable,
            8 => LockResult::OwnedExclusive,
            9 => LockResult::Unowned,
            _ => LockResult::Illegal,
        }
    }

    /// Whether the caller owns the lock after the operation.
    pub fn is_held(self) -> bool {
        matches!(
            self,
            LockResult::Acquired
                | LockResult::Upgraded
                | LockResult::OwnedShared
                | LockResult::OwnedUpgradable
                | LockResult::OwnedExclusive
        )
    }

    /// Whether the lock was owned before the operation ran.
    pub fn already_owned(self) -> bool {
        matches!(
            self,
            LockResult::OwnedShared | LockResult::OwnedUpgradable | LockResult::OwnedExclusive
        )
    }

    pub fn is_timed_out(self) -> bool {
        matches!(self, LockResult::TimedOutLock | LockResult::DeadlockVictim)
    }
}

/// Commit durability of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DurabilityMode {
    /// Commits are durable once the call returns.
    Sync = 0,

    /// Commits are flushed but not synced.
    NoSync = 1,

    /// Commits are buffered without an explicit flush.
    NoFlush = 2,

    /// Commits write no redo at all.
    NoRedo = 3,
}

impl DurabilityMode {
    /// Decode from a wire byte; unknown values map to [`DurabilityMode::Sync`].
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => DurabilityMode::NoSync,
            2 => DurabilityMode::NoFlush,
            3 => DurabilityMode::NoRedo,
            _ => DurabilityMode::Sync,
        }
    }
}

impl Default for DurabilityMode {
    fn default() -> Self {
        DurabilityMode::Sync
    }
}

/// Key ordering of a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeyOrdering {
    Ascending = 0,
    Descending = 1,
    Unspecified = 2,
}

impl KeyOrdering {
    /// Decode from a wire byte; unknown values map to
    /// [`KeyOrdering::Unspecified`].
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => KeyOrdering::Ascending,
            1 => KeyOrdering::Descending,
            _ => KeyOrdering::Unspecified,
        }
    }

    pub fn reverse(self) -> Self {
        match self {
            KeyOrdering::Ascending => KeyOrdering::Descending,
            KeyOrdering::Descending => KeyOrdering::Ascending,
            KeyOrdering::Unspecified => KeyOrdering::Unspecified,
        }
    }
}

/// Time unit for lock timeouts expressed in whole units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TimeUnit {
    Nanoseconds = 0,
    Microseconds = 1,
    Milliseconds = 2,
    Seconds = 3,
    Minutes = 4,
    Hours = 5,
}

impl TimeUnit {
    /// Decode from a wire byte; unknown values map to
    /// [`TimeUnit::Nanoseconds`].
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => TimeUnit::Microseconds,
            2 => TimeUnit::Milliseconds,
            3 => TimeUnit::Seconds,
            4 => TimeUnit::Minutes,
            5 => TimeUnit::Hours,
            _ => TimeUnit::Nanoseconds,
        }
    }

    pub fn to_nanos(self, amount: u64) -> u64 {
        let factor: u64 = match self {
            TimeUnit::Nanoseconds => 1,
            TimeUnit::Microseconds => 1_000,
            TimeUnit::Milliseconds => 1_000_000,
            TimeUnit::Seconds => 1_000_000_000,
            TimeUnit::Minutes => 60 * 1_000_000_000,
            TimeUnit::Hours => 3_600 * 1_000_000_000,
        };
        amount.saturating_mul(factor)
    }

    pub fn from_nanos(self, nanos: u64) -> u64 {
        nanos / self.to_nanos(1)
    }
}

impl From<TimeUnit> for Duration {
    fn from(unit: TimeUnit) -> Duration {
        Duration::from_nanos(unit.to_nanos(1))
    }
}

/// Aggregate engine statistics.
///
/// Versioned fixed-layout record: one version byte followed by the primitive
/// fields in little-endian order. Decoders must accept the version they know
/// and reject anything newer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    pub page_size: u32,
    pub free_pages: u64,
    pub total_pages: u64,
    pub cache_pages: u64,
    pub dirty_pages: u64,
    pub open_indexes: u32,
    pub lock_count: u64,
    pub cursor_count: u64,
    pub transaction_count: u64,
}

impl Stats {
    pub const VERSION: u8 = 1;

    /// Encoded size: version byte plus the fixed field layout.
    pub const ENCODED_LEN: usize = 1 + 4 + 8 * 4 + 4 + 8 * 3;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(Self::VERSION);
        buf.put_u32_le(self.page_size);
        buf.put_u64_le(self.free_pages);
        buf.put_u64_le(self.total_pages);
        buf.put_u64_le(self.cache_pages);
        buf.put_u64_le(self.dirty_pages);
        buf.put_u32_le(self.open_indexes);
        buf.put_u64_le(self.lock_count);
        buf.put_u64_le(self.cursor_count);
        buf.put_u64_le(self.transaction_count);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::ENCODED_LEN {
            return Err(RemoteError::io("truncated stats record"));
        }
        let version = buf.get_u8();
        if version != Self::VERSION {
            return Err(RemoteError::io(format!(
                "unknown stats version {}",
                version
            )));
        }
        Ok(Stats {
            page_size: buf.get_u32_le(),
            free_pages: buf.get_u64_le(),
            total_pages: buf.get_u64_le(),
            cache_pages: buf.get_u64_le(),
            dirty_pages: buf.get_u64_le(),
            open_indexes: buf.get_u32_le(),
            lock_count: buf.get_u64_le(),
            cursor_count: buf.get_u64_le(),
            transaction_count: buf.get_u64_le(),
        })
    }
}

/// Per-index statistics produced by `analyze`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndexStats {
    pub entry_count: u64,
    pub key_bytes: u64,
    pub value_bytes: u64,
    pub free_bytes: u64,
    pub total_bytes: u64,
}

impl IndexStats {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.entry_count);
        buf.put_u64_le(self.key_bytes);
        buf.put_u64_le(self.value_bytes);
        buf.put_u64_le(self.free_bytes);
        buf.put_u64_le(self.total_bytes);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < 40 {
            return Err(RemoteError::io("truncated index stats record"));
        }
        Ok(IndexStats {
            entry_count: buf.get_u64_le(),
            key_bytes: buf.get_u64_le(),
            value_bytes: buf.get_u64_le(),
            free_bytes: buf.get_u64_le(),
            total_bytes: buf.get_u64_le(),
        })
    }
}

/// Column type of a typed row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ColumnType {
    Int64 = 1,
    Uint64 = 2,
    Float64 = 3,
    Utf8 = 4,
    Bytes = 5,
    Bool = 6,
}

impl ColumnType {
    pub fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            1 => ColumnType::Int64,
            2 => ColumnType::Uint64,
            3 => ColumnType::Float64,
            4 => ColumnType::Utf8,
            5 => ColumnType::Bytes,
            6 => ColumnType::Bool,
            other => {
                return Err(RemoteError::io(format!(
                    "unknown column type code {}",
                    other
                )))
            }
        })
    }
}

/// One column of a row descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub type_code: ColumnType,
    pub key: bool,
    pub nullable: bool,
}

/// Binary row-layout descriptor negotiated between the peers.
///
/// The encoded form is canonical and content-addressed: equal descriptors
/// encode to equal bytes, and the encoded bytes are the cache key on both
/// sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowDescriptor {
    pub columns: Vec<ColumnDef>,
}

const COL_FLAG_KEY: u8 = 0b0000_0001;
const COL_FLAG_NULLABLE: u8 = 0b0000_0010;

impl RowDescriptor {
    pub fn new(columns: Vec<ColumnDef>) -> Self {
        RowDescriptor { columns }
    }

    pub fn key_columns(&self) -> impl Iterator<Item = (usize, &ColumnDef)> {
        self.columns.iter().enumerate().filter(|(_, c)| c.key)
    }

    pub fn value_columns(&self) -> impl Iterator<Item = (usize, &ColumnDef)> {
        self.columns.iter().enumerate().filter(|(_, c)| !c.key)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(self.columns.len() as u16);
        for col in &self.columns {
            let mut flags = 0u8;
            if col.key {
                flags |= COL_FLAG_KEY;
            }
            if col.nullable {
                flags |= COL_FLAG_NULLABLE;
            }
            buf.put_u8(flags);
            buf.put_u8(col.type_code as u8);
            buf.put_u16_le(col.name.len() as u16);
            buf.put_slice(col.name.as_bytes());
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(RemoteError::io("truncated row descriptor"));
        }
        let count = buf.get_u16_le() as usize;
        let mut columns = Vec::with_capacity(count);
        for _ in 0..count {
            if buf.remaining() < 4 {
                return Err(RemoteError::io("truncated row descriptor column"));
            }
            let flags = buf.get_u8();
            let type_code = ColumnType::from_u8(buf.get_u8())?;
            let name_len = buf.get_u16_le() as usize;
            if buf.remaining() < name_len {
                return Err(RemoteError::io("truncated row descriptor name"));
            }
            let mut name = vec![0u8; name_len];
            buf.copy_to_slice(&mut name);
            let name = String::from_utf8(name)
                .map_err(|_| RemoteError::io("row descriptor name is not UTF-8"))?;
            columns.push(ColumnDef {
                name,
                type_code,
                key: flags & COL_FLAG_KEY != 0,
                nullable: flags & COL_FLAG_NULLABLE != 0,
            });
        }
        Ok(RowDescriptor { columns })
    }

    /// Canonical encoded bytes, used as the content-addressed cache key.
    pub fn content_key(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// One column value of a row.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Int64(i64),
    Uint64(u64),
    Float64(f64),
    Utf8(String),
    Bytes(Vec<u8>),
    Bool(bool),
}

impl ColumnValue {
    fn type_code(&self) -> ColumnType {
        match self {
            ColumnValue::Int64(_) => ColumnType::Int64,
            ColumnValue::Uint64(_) => ColumnType::Uint64,
            ColumnValue::Float64(_) => ColumnType::Float64,
            ColumnValue::Utf8(_) => ColumnType::Utf8,
            ColumnValue::Bytes(_) => ColumnType::Bytes,
            ColumnValue::Bool(_) => ColumnType::Bool,
        }
    }

    /// Total order consistent with the key encoding.
    pub fn compare(&self, other: &ColumnValue) -> std::cmp::Ordering {
        use std::cmp::Ordering::*;
        match (self, other) {
            (ColumnValue::Int64(a), ColumnValue::Int64(b)) => a.cmp(b),
            (ColumnValue::Uint64(a), ColumnValue::Uint64(b)) => a.cmp(b),
            (ColumnValue::Float64(a), ColumnValue::Float64(b)) => {
                a.partial_cmp(b).unwrap_or(Equal)
            }
            (ColumnValue::Utf8(a), ColumnValue::Utf8(b)) => a.cmp(b),
            (ColumnValue::Bytes(a), ColumnValue::Bytes(b)) => a.cmp(b),
            (ColumnValue::Bool(a), ColumnValue::Bool(b)) => a.cmp(b),
            _ => Equal,
        }
    }
}

/// A materialized row bound to its descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct RowData {
    pub descriptor: Arc<RowDescriptor>,
    /// One slot per descriptor column; `None` is an SQL-style null.
    pub values: Vec<Option<ColumnValue>>,
}

impl RowData {
    pub fn new(descriptor: Arc<RowDescriptor>) -> Self {
        let values = vec![None; descriptor.columns.len()];
        RowData { descriptor, values }
    }

    pub fn set(&mut self, name: &str, value: ColumnValue) -> Result<()> {
        let idx = self
            .descriptor
            .column_index(name)
            .ok_or_else(|| RemoteError::view_constraint(format!("no such column: {}", name)))?;
        self.values[idx] = Some(value);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ColumnValue> {
        let idx = self.descriptor.column_index(name)?;
        self.values[idx].as_ref()
    }

    /// Encode the key columns in declaration order.
    ///
    /// Key encodings preserve the unsigned byte order of the column's natural
    /// order so the engine's ordered views sort typed rows correctly.
    pub fn encode_key(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for (idx, col) in self.descriptor.key_columns() {
            let value = self.values[idx]
                .as_ref()
                .ok_or_else(|| RemoteError::view_constraint("null in key column"))?;
            if value.type_code() != col.type_code {
                return Err(RemoteError::view_constraint(format!(
                    "column {} type mismatch",
                    col.name
                )));
            }
            encode_key_column(value, &mut out)?;
        }
        Ok(out)
    }

    /// Encode the non-key columns in declaration order.
    pub fn encode_value(&self) -> Result<Vec<u8>> {
        let mut out = BytesMut::new();
        for (idx, col) in self.descriptor.value_columns() {
            match &self.values[idx] {
                None if !col.nullable => {
                    return Err(RemoteError::view_constraint(format!(
                        "null in non-nullable column {}",
                        col.name
                    )));
                }
                None => out.put_u8(0),
                Some(value) => {
                    if value.type_code() != col.type_code {
                        return Err(RemoteError::view_constraint(format!(
                            "column {} type mismatch",
                            col.name
                        )));
                    }
                    out.put_u8(1);
                    encode_value_column(value, &mut out);
                }
            }
        }
        Ok(out.to_vec())
    }

    /// Decode a row from its key and value encodings.
    pub fn decode(descriptor: Arc<RowDescriptor>, key: &[u8], value: &[u8]) -> Result<Self> {
        let mut row = RowData::new(descriptor.clone());
        let mut kbuf = key;
        for (idx, col) in descriptor.key_columns() {
            row.values[idx] = Some(decode_key_column(col.type_code, &mut kbuf)?);
        }
        let mut vbuf = value;
        for (idx, col) in descriptor.value_columns() {
            if vbuf.remaining() < 1 {
                return Err(RemoteError::io("truncated row value"));
            }
            row.values[idx] = match vbuf.get_u8() {
                0 => None,
                _ => Some(decode_value_column(col.type_code, &mut vbuf)?),
            };
        }
        Ok(row)
    }
}

fn encode_key_column(value: &ColumnValue, out: &mut Vec<u8>) -> Result<()> {
    match value {
        ColumnValue::Int64(v) => out.extend_from_slice(&((*v as u64) ^ (1 << 63)).to_be_bytes()),
        ColumnValue::Uint64(v) => out.extend_from_slice(&v.to_be_bytes()),
        ColumnValue::Float64(v) => {
            // Total-order encoding: flip the sign bit for positives, all bits
            // for negatives.
            let bits = v.to_bits();
            let ordered = if bits & (1 << 63) == 0 {
                bits ^ (1 << 63)
            } else {
                !bits
            };
            out.extend_from_slice(&ordered.to_be_bytes());
        }
        ColumnValue::Utf8(s) => {
            if s.as_bytes().contains(&0) {
                return Err(RemoteError::view_constraint(
                    "NUL byte in string key column",
                ));
            }
            out.extend_from_slice(s.as_bytes());
            out.push(0);
        }
        ColumnValue::Bytes(b) => {
            out.extend_from_slice(&(b.len() as u16).to_be_bytes());
            out.extend_from_slice(b);
        }
        ColumnValue::Bool(v) => out.push(*v as u8),
    }
    Ok(())
}

fn decode_key_column(type_code: ColumnType, buf: &mut &[u8]) -> Result<ColumnValue> {
    let need = |buf: &&[u8], n: usize| -> Result<()> {
        if buf.len() < n {
            Err(RemoteError::io("truncated row key"))
        } else {
            Ok(())
        }
    };
    Ok(match type_code {
        ColumnType::Int64 => {
            need(buf, 8)?;
            let raw = u64::from_be_bytes(buf[..8].try_into().unwrap());
            buf.advance(8);
            ColumnValue::Int64((raw ^ (1 << 63)) as i64)
        }
        ColumnType::Uint64 => {
            need(buf, 8)?;
            let raw = u64::from_be_bytes(buf[..8].try_into().unwrap());
            buf.advance(8);
            ColumnValue::Uint64(raw)
        }
        ColumnType::Float64 => {
            need(buf, 8)?;
            let ordered = u64::from_be_bytes(buf[..8].try_into().unwrap());
            buf.advance(8);
            let bits = if ordered & (1 << 63) != 0 {
                ordered ^ (1 << 63)
            } else {
                !ordered
            };
            ColumnValue::Float64(f64::from_bits(bits))
        }
        ColumnType::Utf8 => {
            let end = buf
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| RemoteError::io("unterminated string key"))?;
            let s = String::from_utf8(buf[..end].to_vec())
                .map_err(|_| RemoteError::io("string key is not UTF-8"))?;
            buf.advance(end + 1);
            ColumnValue::Utf8(s)
        }
        ColumnType::Bytes => {
            need(buf, 2)?;
            let len = u16::from_be_bytes(buf[..2].try_into().unwrap()) as usize;
            buf.advance(2);
            need(buf, len)?;
            let b = buf[..len].to_vec();
            buf.advance(len);
            ColumnValue::Bytes(b)
        }
        ColumnType::Bool => {
            need(buf, 1)?;
            let v = buf[0] != 0;
            buf.advance(1);
            ColumnValue::Bool(v)
        }
    })
}

fn encode_value_column(value: &ColumnValue, out: &mut BytesMut) {
    match value {
        ColumnValue::Int64(v) => out.put_i64_le(*v),
        ColumnValue::Uint64(v) => out.put_u64_le(*v),
        ColumnValue::Float64(v) => out.put_f64_le(*v),
        ColumnValue::Utf8(s) => {
            out.put_u32_le(s.len() as u32);
            out.put_slice(s.as_bytes());
        }
        ColumnValue::Bytes(b) => {
            out.put_u32_le(b.len() as u32);
            out.put_slice(b);
        }
        ColumnValue::Bool(v) => out.put_u8(*v as u8),
    }
}

fn decode_value_column(type_code: ColumnType, buf: &mut &[u8]) -> Result<ColumnValue> {
    let need = |buf: &&[u8], n: usize| -> Result<()> {
        if buf.len() < n {
            Err(RemoteError::io("truncated row value"))
        } else {
            Ok(())
        }
    };
    Ok(match type_code {
        ColumnType::Int64 => {
            need(buf, 8)?;
            let v = i64::from_le_bytes(buf[..8].try_into().unwrap());
            buf.advance(8);
            ColumnValue::Int64(v)
        }
        ColumnType::Uint64 => {
            need(buf, 8)?;
            let v = u64::from_le_bytes(buf[..8].try_into().unwrap());
            buf.advance(8);
            ColumnValue::Uint64(v)
        }
        ColumnType::Float64 => {
            need(buf, 8)?;
            let v = f64::from_le_bytes(buf[..8].try_into().unwrap());
            buf.advance(8);
            ColumnValue::Float64(v)
        }
        ColumnType::Utf8 => {
            need(buf, 4)?;
            let len = u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize;
            buf.advance(4);
            need(buf, len)?;
            let s = String::from_utf8(buf[..len].to_vec())
                .map_err(|_| RemoteError::io("string value is not UTF-8"))?;
            buf.advance(len);
            ColumnValue::Utf8(s)
        }
        ColumnType::Bytes => {
            need(buf, 4)?;
            let len = u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize;
            buf.advance(4);
            need(buf, len)?;
            let b = buf[..len].to_vec();
            buf.advance(len);
            ColumnValue::Bytes(b)
        }
        ColumnType::Bool => {
            need(buf, 1)?;
            let v = buf[0] != 0;
            buf.advance(1);
            ColumnValue::Bool(v)
        }
    })
}

/// Encode one optional column value behind its presence flag, in the row
/// value-column layout.
pub fn encode_field(value: Option<&ColumnValue>, buf: &mut BytesMut) {
    match value {
        None => buf.put_u8(0),
        Some(v) => {
            buf.put_u8(1);
            encode_value_column(v, buf);
        }
    }
}

/// Decode one optional column value written by [`encode_field`].
pub fn decode_field(type_code: ColumnType, buf: &mut &[u8]) -> Result<Option<ColumnValue>> {
    if buf.remaining() < 1 {
        return Err(RemoteError::io("truncated column value"));
    }
    match buf.get_u8() {
        0 => Ok(None),
        _ => Ok(Some(decode_value_column(type_code, buf)?)),
    }
}

/// Encode a dirty-column set: a bitmap over the value columns followed by
/// each dirty column's field encoding in declaration order.
pub fn encode_partial(
    descriptor: &RowDescriptor,
    dirty: &[(usize, Option<ColumnValue>)],
    buf: &mut BytesMut,
) {
    let value_columns: Vec<usize> = descriptor.value_columns().map(|(idx, _)| idx).collect();
    let mut bitmap = vec![0u8; value_columns.len().div_ceil(8)];
    for (slot, column) in value_columns.iter().enumerate() {
        if dirty.iter().any(|(c, _)| c == column) {
            bitmap[slot / 8] |= 1 << (slot % 8);
        }
    }
    buf.extend_from_slice(&bitmap);
    for column in &value_columns {
        if let Some((_, value)) = dirty.iter().find(|(c, _)| c == column) {
            encode_field(value.as_ref(), buf);
        }
    }
}

/// Decode a dirty-column set written by [`encode_partial`], yielding global
/// column indexes.
pub fn decode_partial(
    descriptor: &RowDescriptor,
    data: &[u8],
) -> Result<Vec<(usize, Option<ColumnValue>)>> {
    let value_columns: Vec<(usize, ColumnType)> = descriptor
        .value_columns()
        .map(|(idx, col)| (idx, col.type_code))
        .collect();
    let bitmap_len = value_columns.len().div_ceil(8);
    if data.len() < bitmap_len {
        return Err(RemoteError::io("truncated dirty-column bitmap"));
    }
    let (bitmap, mut rest) = data.split_at(bitmap_len);
    let mut out = Vec::new();
    for (slot, (column, type_code)) in value_columns.iter().enumerate() {
        if bitmap[slot / 8] & (1 << (slot % 8)) != 0 {
            out.push((*column, decode_field(*type_code, &mut rest)?));
        }
    }
    Ok(out)
}

/// Query-plan tree returned by the plan operations.
///
/// The wire form is a whitelisted object graph: each node is a known
/// discriminator followed by its fields; anything else fails to decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryPlan {
    FullScan {
        table: String,
        reverse: bool,
    },
    RangeScan {
        table: String,
        reverse: bool,
        low: Option<String>,
        high: Option<String>,
    },
    Filter {
        expression: String,
        child: Box<QueryPlan>,
    },
    Sort {
        columns: Vec<String>,
        child: Box<QueryPlan>,
    },
}

const PLAN_FULL_SCAN: u8 = 1;
const PLAN_RANGE_SCAN: u8 = 2;
const PLAN_FILTER: u8 = 3;
const PLAN_SORT: u8 = 4;

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn get_string(buf: &mut impl Buf) -> Result<String> {
    if buf.remaining() < 4 {
        return Err(RemoteError::io("truncated plan string"));
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(RemoteError::io("truncated plan string"));
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw).map_err(|_| RemoteError::io("plan string is not UTF-8"))
}

impl QueryPlan {
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            QueryPlan::FullScan { table, reverse } => {
                buf.put_u8(PLAN_FULL_SCAN);
                put_string(buf, table);
                buf.put_u8(*reverse as u8);
            }
            QueryPlan::RangeScan {
                table,
                reverse,
                low,
                high,
            } => {
                buf.put_u8(PLAN_RANGE_SCAN);
                put_string(buf, table);
                buf.put_u8(*reverse as u8);
                match low {
                    Some(s) => {
                        buf.put_u8(1);
                        put_string(buf, s);
                    }
                    None => buf.put_u8(0),
                }
                match high {
                    Some(s) => {
                        buf.put_u8(1);
                        put_string(buf, s);
                    }
                    None => buf.put_u8(0),
                }
            }
            QueryPlan::Filter { expression, child } => {
                buf.put_u8(PLAN_FILTER);
                put_string(buf, expression);
                child.encode(buf);
            }
            QueryPlan::Sort { columns, child } => {
                buf.put_u8(PLAN_SORT);
                buf.put_u16_le(columns.len() as u16);
                for c in columns {
                    put_string(buf, c);
                }
                child.encode(buf);
            }
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < 1 {
            return Err(RemoteError::io("truncated query plan"));
        }
        Ok(match buf.get_u8() {
            PLAN_FULL_SCAN => QueryPlan::FullScan {
                table: get_string(buf)?,
                reverse: {
                    if buf.remaining() < 1 {
                        return Err(RemoteError::io("truncated query plan"));
                    }
                    buf.get_u8() != 0
                },
            },
            PLAN_RANGE_SCAN => {
                let table = get_string(buf)?;
                if buf.remaining() < 1 {
                    return Err(RemoteError::io("truncated query plan"));
                }
                let reverse = buf.get_u8() != 0;
                let low = if buf.remaining() >= 1 && buf.get_u8() != 0 {
                    Some(get_string(buf)?)
                } else {
                    None
                };
                let high = if buf.remaining() >= 1 && buf.get_u8() != 0 {
                    Some(get_string(buf)?)
                } else {
                    None
                };
                QueryPlan::RangeScan {
                    table,
                    reverse,
                    low,
                    high,
                }
            }
            PLAN_FILTER => QueryPlan::Filter {
                expression: get_string(buf)?,
                child: Box::new(QueryPlan::decode(buf)?),
            },
            PLAN_SORT => {
                if buf.remaining() < 2 {
                    return Err(RemoteError::io("truncated query plan"));
                }
                let count = buf.get_u16_le() as usize;
                let mut columns = Vec::with_capacity(count);
                for _ in 0..count {
                    columns.push(get_string(buf)?);
                }
                QueryPlan::Sort {
                    columns,
                    child: Box::new(QueryPlan::decode(buf)?),
                }
            }
            other => {
                return Err(RemoteError::io(format!(
                    "unknown query plan node {}",
                    other
                )))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_mode_round_trip() {
        for mode in [
            LockMode::Unsafe,
            LockMode::ReadUncommitted,
            LockMode::ReadCommitted,
            LockMode::RepeatableRead,
            LockMode::UpgradableRead,
        ] {
            assert_eq!(LockMode::from_u8(mode as u8), mode);
        }
        // Unknown bytes decode to the default.
        assert_eq!(LockMode::from_u8(99), LockMode::UpgradableRead);
    }

    #[test]
    fn test_lock_result_predicates() {
        assert!(LockResult::Acquired.is_held());
        assert!(LockResult::OwnedExclusive.already_owned());
        assert!(!LockResult::Acquired.already_owned());
        assert!(LockResult::TimedOutLock.is_timed_out());
        assert_eq!(LockResult::from_u8(77), LockResult::Illegal);
    }

    #[test]
    fn test_time_unit_conversions() {
        assert_eq!(TimeUnit::Seconds.to_nanos(2), 2_000_000_000);
        assert_eq!(TimeUnit::Milliseconds.from_nanos(5_000_000), 5);
        assert_eq!(TimeUnit::from_u8(200), TimeUnit::Nanoseconds);
    }

    #[test]
    fn test_stats_idempotent_round_trip() {
        let stats = Stats {
            page_size: 4096,
            free_pages: 10,
            total_pages: 100,
            cache_pages: 50,
            dirty_pages: 3,
            open_indexes: 7,
            lock_count: 12,
            cursor_count: 4,
            transaction_count: 2,
        };
        let mut buf = BytesMut::new();
        stats.encode(&mut buf);
        assert_eq!(buf.len(), Stats::ENCODED_LEN);
        let mut bytes = buf.freeze();
        let decoded = Stats::decode(&mut bytes).unwrap();
        assert_eq!(decoded, stats);

        // Idempotent: a second encode of the decoded record is identical.
        let mut again = BytesMut::new();
        decoded.encode(&mut again);
        let mut first = BytesMut::new();
        stats.encode(&mut first);
        assert_eq!(again, first);
    }

    fn sample_descriptor() -> Arc<RowDescriptor> {
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
    fn test_descriptor_round_trip() {
        let descriptor = sample_descriptor();
        let key = descriptor.content_key();
        let mut buf = key.clone();
        let decoded = RowDescriptor::decode(&mut buf).unwrap();
        assert_eq!(&decoded, descriptor.as_ref());
        // Content addressing: identical descriptors share the key bytes.
        assert_eq!(decoded.content_key(), key);
    }

    #[test]
    fn test_row_round_trip() {
        let descriptor = sample_descriptor();
        let mut row = RowData::new(descriptor.clone());
        row.set("id", ColumnValue::Int64(-42)).unwrap();
        row.set("name", ColumnValue::Utf8("answer".to_string()))
            .unwrap();
        let key = row.encode_key().unwrap();
        let value = row.encode_value().unwrap();
        let decoded = RowData::decode(descriptor, &key, &value).unwrap();
        assert_eq!(decoded, row);
        assert_eq!(decoded.get("score"), None);
    }

    #[test]
    fn test_int_key_order_preserved() {
        let descriptor = sample_descriptor();
        let mut low = RowData::new(descriptor.clone());
        low.set("id", ColumnValue::Int64(-5)).unwrap();
        let mut high = RowData::new(descriptor);
        high.set("id", ColumnValue::Int64(3)).unwrap();
        assert!(low.encode_key().unwrap() < high.encode_key().unwrap());
    }

    #[test]
    fn test_null_key_rejected() {
        let descriptor = sample_descriptor();
        let row = RowData::new(descriptor);
        assert!(row.encode_key().is_err());
    }

    #[test]
    fn test_plan_round_trip() {
        let plan = QueryPlan::Sort {
            columns: vec!["id".to_string()],
            child: Box::new(QueryPlan::Filter {
                expression: "score >= ?1".to_string(),
                child: Box::new(QueryPlan::RangeScan {
                    table: "people".to_string(),
                    reverse: false,
                    low: Some("id >= 10".to_string()),
                    high: None,
                }),
            }),
        };
        let mut buf = BytesMut::new();
        plan.encode(&mut buf);
        let mut bytes = buf.freeze();
        assert_eq!(QueryPlan::decode(&mut bytes).unwrap(), plan);
    }

    #[test]
    fn test_plan_rejects_unknown_node() {
        let mut buf = BytesMut::new();
        buf.put_u8(99);
        let mut bytes = buf.freeze();
        assert!(QueryPlan::decode(&mut bytes).is_err());
    }
}
