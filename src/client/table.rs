// Typed table proxies: point row operations through a compiled
// per-descriptor proxy, forward-only scanner and updater streams, and
// derived tables that re-drive themselves after a reconnect.

use super::session::{Restore, SessionInner};
use super::stub::Stub;
use super::txn::Transaction;
use super::view::{txn_id, Index};
use crate::engine::types::{
    encode_partial, ColumnValue, QueryPlan, RowData, RowDescriptor,
};
use crate::error::{RemoteError, Result};
use crate::protocol::wire::{get_bool, get_bytes, get_opt_bytes, get_u16, get_u64, get_u8};
use crate::protocol::{
    ProxyOp, TableOp, ViewOp, RELAY_ACK, RELAY_STOP, ROW_STREAM_END, SCAN_ORDERED, STATUS_OK,
};
use crate::server::query::encode_args;
use crate::protocol::codec::decode_error;
use crate::transport::Pipe;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tokio::sync::Mutex;

fn put_bytes_arg(msg: &mut BytesMut, bytes: &[u8]) {
    msg.put_u32_le(bytes.len() as u32);
    msg.put_slice(bytes);
}

fn put_str_arg(msg: &mut BytesMut, s: &str) {
    put_bytes_arg(msg, s.as_bytes());
}

/// Build the dirty-column wire form from named columns of a row.
fn partial_of(row: &RowData, dirty: &[&str]) -> Result<Vec<u8>> {
    let mut entries = Vec::with_capacity(dirty.len());
    for name in dirty {
        let idx = row
            .descriptor
            .column_index(name)
            .ok_or_else(|| RemoteError::view_constraint(format!("no such column: {}", name)))?;
        if row.descriptor.columns[idx].key {
            return Err(RemoteError::view_constraint(format!(
                "key column {} cannot be dirty",
                name
            )));
        }
        entries.push((idx, row.values[idx].clone()));
    }
    let mut buf = BytesMut::new();
    encode_partial(&row.descriptor, &entries, &mut buf);
    Ok(buf.to_vec())
}

pub(crate) struct TableInner {
    pub(crate) session: Arc<SessionInner>,
    pub(crate) index: Index,
    pub(crate) descriptor: Arc<RowDescriptor>,
    pub(crate) stub: Stub,
    /// Compiled per-descriptor proxy, lazily created and re-created after a
    /// reconnect (double-checked under the slot lock).
    proxy: Mutex<Option<Arc<ProxyHandle>>>,
}

struct ProxyHandle {
    stub: Stub,
}

/// A remote typed table: an index interpreted through a row descriptor.
#[derive(Clone)]
pub struct Table {
    pub(crate) inner: Arc<TableInner>,
}

impl PartialEq for Table {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Table {
    pub(crate) fn new(
        index: Index,
        descriptor: Arc<RowDescriptor>,
        handle: u64,
        epoch: u64,
    ) -> Table {
        let session = index.inner.view.inner.session.clone();
        let inner = Arc::new(TableInner {
            stub: Stub::new(session.clone(), handle, epoch),
            session: session.clone(),
            index,
            descriptor,
            proxy: Mutex::new(None),
        });
        let restore_arc: Arc<dyn Restore> = inner.clone();
        let weak: std::sync::Weak<dyn Restore> = Arc::downgrade(&restore_arc);
        session.track_restorable(weak);
        Table { inner }
    }

    pub fn descriptor(&self) -> Arc<RowDescriptor> {
        self.inner.descriptor.clone()
    }

    pub fn index(&self) -> &Index {
        &self.inner.index
    }

    /// An empty row bound to this table's descriptor.
    pub fn new_row(&self) -> RowData {
        RowData::new(self.inner.descriptor.clone())
    }

    /// Resolve the compiled row proxy, creating it on first use.
    async fn proxy(&self) -> Result<Arc<ProxyHandle>> {
        {
            let slot = self.inner.proxy.lock().await;
            if let Some(proxy) = slot.as_ref() {
                if proxy.stub.current().await.is_some() {
                    return Ok(proxy.clone());
                }
            }
        }
        let descriptor_bytes = self.inner.descriptor.content_key();
        let mut reply = self
            .inner
            .stub
            .invoke(TableOp::Proxy as u8, |msg| {
                put_bytes_arg(msg, &descriptor_bytes);
            })
            .await?;
        let handle = get_u64(&mut reply)?;
        let epoch = self.inner.session.epoch();

        let mut slot = self.inner.proxy.lock().await;
        if let Some(existing) = slot.as_ref() {
            if existing.stub.current().await.is_some() {
                self.inner.session.spawn_dispose(handle, epoch);
                return Ok(existing.clone());
            }
        }
        let proxy = Arc::new(ProxyHandle {
            stub: Stub::new(self.inner.session.clone(), handle, epoch),
        });
        *slot = Some(proxy.clone());
        Ok(proxy)
    }

    async fn point_op(
        &self,
        op: ProxyOp,
        txn: Option<&Transaction>,
        key: &[u8],
        payload: Option<&[u8]>,
    ) -> Result<Bytes> {
        let proxy = self.proxy().await?;
        let txn_handle = txn_id(&self.inner.session, txn).await?;
        proxy
            .stub
            .invoke(op as u8, |msg| {
                msg.put_u64_le(txn_handle);
                put_bytes_arg(msg, key);
                if let Some(payload) = payload {
                    put_bytes_arg(msg, payload);
                }
            })
            .await
    }

    /// Load the full row for the key columns of `row`.
    pub async fn load(&self, txn: Option<&Transaction>, row: &RowData) -> Result<Option<RowData>> {
        let key = row.encode_key()?;
        let mut reply = self.point_op(ProxyOp::Load, txn, &key, None).await?;
        match get_opt_bytes(&mut reply)? {
            Some(value) => Ok(Some(RowData::decode(
                self.inner.descriptor.clone(),
                &key,
                &value,
            )?)),
            None => Ok(None),
        }
    }

    pub async fn exists(&self, txn: Option<&Transaction>, row: &RowData) -> Result<bool> {
        let key = row.encode_key()?;
        let mut reply = self.point_op(ProxyOp::Exists, txn, &key, None).await?;
        get_bool(&mut reply)
    }

    pub async fn store(&self, txn: Option<&Transaction>, row: &RowData) -> Result<()> {
        let key = row.encode_key()?;
        let value = row.encode_value()?;
        self.point_op(ProxyOp::Store, txn, &key, Some(&value)).await?;
        Ok(())
    }

    pub async fn exchange(
        &self,
        txn: Option<&Transaction>,
        row: &RowData,
    ) -> Result<Option<RowData>> {
        let key = row.encode_key()?;
        let value = row.encode_value()?;
        let mut reply = self
            .point_op(ProxyOp::Exchange, txn, &key, Some(&value))
            .await?;
        match get_opt_bytes(&mut reply)? {
            Some(old) => Ok(Some(RowData::decode(
                self.inner.descriptor.clone(),
                &key,
                &old,
            )?)),
            None => Ok(None),
        }
    }

    pub async fn insert(&self, txn: Option<&Transaction>, row: &RowData) -> Result<bool> {
        let key = row.encode_key()?;
        let value = row.encode_value()?;
        let mut reply = self
            .point_op(ProxyOp::Insert, txn, &key, Some(&value))
            .await?;
        get_bool(&mut reply)
    }

    pub async fn replace(&self, txn: Option<&Transaction>, row: &RowData) -> Result<bool> {
        let key = row.encode_key()?;
        let value = row.encode_value()?;
        let mut reply = self
            .point_op(ProxyOp::Replace, txn, &key, Some(&value))
            .await?;
        get_bool(&mut reply)
    }

    /// Apply the named dirty columns of `row` to the stored row.
    pub async fn update(
        &self,
        txn: Option<&Transaction>,
        row: &RowData,
        dirty: &[&str],
    ) -> Result<bool> {
        let key = row.encode_key()?;
        let partial = partial_of(row, dirty)?;
        let mut reply = self
            .point_op(ProxyOp::Update, txn, &key, Some(&partial))
            .await?;
        get_bool(&mut reply)
    }

    /// Apply the named dirty columns and return the merged row.
    pub async fn merge(
        &self,
        txn: Option<&Transaction>,
        row: &RowData,
        dirty: &[&str],
    ) -> Result<Option<RowData>> {
        let key = row.encode_key()?;
        let partial = partial_of(row, dirty)?;
        let mut reply = self
            .point_op(ProxyOp::Merge, txn, &key, Some(&partial))
            .await?;
        match get_opt_bytes(&mut reply)? {
            Some(merged) => Ok(Some(RowData::decode(
                self.inner.descriptor.clone(),
                &key,
                &merged,
            )?)),
            None => Ok(None),
        }
    }

    pub async fn delete(&self, txn: Option<&Transaction>, row: &RowData) -> Result<bool> {
        let key = row.encode_key()?;
        let mut reply = self.point_op(ProxyOp::Delete, txn, &key, None).await?;
        get_bool(&mut reply)
    }

    /// Open a forward-only scanner over the rows matching `query`.
    pub async fn new_scanner(
        &self,
        txn: Option<&Transaction>,
        query: &str,
        args: &[Option<ColumnValue>],
    ) -> Result<Scanner> {
        let txn_handle = txn_id(&self.inner.session, txn).await?;
        let (pipe, mut reply) = self
            .inner
            .stub
            .invoke_stream(TableOp::NewScanner as u8, |msg| {
                msg.put_u64_le(txn_handle);
                put_str_arg(msg, query);
                encode_args(args, msg);
            })
            .await?;
        let characteristics = get_u8(&mut reply)?;
        Ok(Scanner::new(
            self.inner.session.clone(),
            self.inner.descriptor.clone(),
            pipe,
            characteristics,
        ))
    }

    /// Open an updater over the rows matching `query`.
    pub async fn new_updater(
        &self,
        txn: Option<&Transaction>,
        query: &str,
        args: &[Option<ColumnValue>],
    ) -> Result<Updater> {
        let txn_handle = txn_id(&self.inner.session, txn).await?;
        let (pipe, _reply) = self
            .inner
            .stub
            .invoke_stream(TableOp::NewUpdater as u8, |msg| {
                msg.put_u64_le(txn_handle);
                put_str_arg(msg, query);
                encode_args(args, msg);
            })
            .await?;
        Updater::open(
            self.inner.session.clone(),
            self.inner.descriptor.clone(),
            pipe,
        )
        .await
    }

    /// Validate a query against this table, returning its argument count.
    pub async fn validate(&self, query: &str) -> Result<u16> {
        let mut reply = self
            .inner
            .stub
            .invoke(TableOp::Validate as u8, |msg| {
                put_str_arg(msg, query);
            })
            .await?;
        get_u16(&mut reply)
    }

    async fn plan_op(&self, op: TableOp, query: &str, reverse: bool) -> Result<QueryPlan> {
        let mut reply = self
            .inner
            .stub
            .invoke(op as u8, |msg| {
                put_str_arg(msg, query);
                msg.put_u8(reverse as u8);
            })
            .await?;
        QueryPlan::decode(&mut reply)
    }

    pub async fn scanner_plan(&self, query: &str, reverse: bool) -> Result<QueryPlan> {
        self.plan_op(TableOp::ScannerPlan, query, reverse).await
    }

    pub async fn updater_plan(&self, query: &str, reverse: bool) -> Result<QueryPlan> {
        self.plan_op(TableOp::UpdaterPlan, query, reverse).await
    }

    pub async fn stream_plan(&self, query: &str, reverse: bool) -> Result<QueryPlan> {
        self.plan_op(TableOp::StreamPlan, query, reverse).await
    }

    /// Delete every row of this table, returning the count.
    pub async fn delete_all(&self, txn: Option<&Transaction>) -> Result<u64> {
        let txn_handle = txn_id(&self.inner.session, txn).await?;
        let mut reply = self
            .inner
            .stub
            .invoke(TableOp::DeleteAll as u8, |msg| {
                msg.put_u64_le(txn_handle);
            })
            .await?;
        get_u64(&mut reply)
    }

    pub async fn any_rows(
        &self,
        txn: Option<&Transaction>,
        query: &str,
        args: &[Option<ColumnValue>],
    ) -> Result<bool> {
        let txn_handle = txn_id(&self.inner.session, txn).await?;
        let mut reply = self
            .inner
            .stub
            .invoke(TableOp::AnyRows as u8, |msg| {
                msg.put_u64_le(txn_handle);
                put_str_arg(msg, query);
                encode_args(args, msg);
            })
            .await?;
        get_bool(&mut reply)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        let mut reply = self.inner.stub.invoke(TableOp::IsEmpty as u8, |_| {}).await?;
        get_bool(&mut reply)
    }

    /// Derive a table from a bound query. The result pairs a handle with a
    /// row descriptor returned by the server.
    pub async fn derive(
        &self,
        query: &str,
        args: &[Option<ColumnValue>],
    ) -> Result<DerivedTable> {
        let mut reply = self
            .inner
            .stub
            .invoke(TableOp::Derive as u8, |msg| {
                put_str_arg(msg, query);
                encode_args(args, msg);
            })
            .await?;
        let handle = get_u64(&mut reply)?;
        let descriptor_bytes = get_bytes(&mut reply)?;
        let descriptor = Arc::new(RowDescriptor::decode(&mut descriptor_bytes.as_slice())?);
        let inner = Arc::new(DerivedInner {
            session: self.inner.session.clone(),
            source: self.clone(),
            query: query.to_string(),
            args: args.to_vec(),
            state: Mutex::new(DerivedState {
                stub: Arc::new(Stub::new(
                    self.inner.session.clone(),
                    handle,
                    self.inner.session.epoch(),
                )),
                descriptor,
                broken: None,
            }),
        });
        let restore_arc: Arc<dyn Restore> = inner.clone();
        let weak: std::sync::Weak<dyn Restore> = Arc::downgrade(&restore_arc);
        self.inner.session.track_restorable(weak);
        Ok(DerivedTable { inner })
    }
}

#[async_trait]
impl Restore for TableInner {
    async fn restore(&self, session: &Arc<SessionInner>) -> Result<()> {
        // The index restores before this table: restorables replay in
        // registration order.
        let (stale, _) = self.stub.snapshot().await;
        let epoch = session.epoch();
        let descriptor_bytes = self.descriptor.content_key();
        let result = self
            .index
            .inner
            .view
            .inner
            .stub
            .invoke(ViewOp::AsTable as u8, |msg| {
                put_bytes_arg(msg, &descriptor_bytes);
            })
            .await;
        match result {
            Ok(mut reply) => {
                let handle = get_u64(&mut reply)?;
                self.stub.install_over(stale, handle, epoch).await;
                *self.proxy.lock().await = None;
                Ok(())
            }
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                self.stub.mark_broken(e.to_string()).await;
                Ok(())
            }
        }
    }
}

impl Drop for TableInner {
    fn drop(&mut self) {
        self.stub.dispose_from_drop(&self.session);
    }
}

/// A forward-only stream of typed rows.
pub struct Scanner {
    session: Arc<SessionInner>,
    descriptor: Arc<RowDescriptor>,
    pipe: Option<Pipe>,
    batch: Bytes,
    pending_ack: bool,
    done: bool,
    characteristics: u8,
}

impl Scanner {
    fn new(
        session: Arc<SessionInner>,
        descriptor: Arc<RowDescriptor>,
        pipe: Pipe,
        characteristics: u8,
    ) -> Scanner {
        Scanner {
            session,
            descriptor,
            pipe: Some(pipe),
            batch: Bytes::new(),
            pending_ack: false,
            done: false,
            characteristics,
        }
    }

    pub fn characteristics(&self) -> u8 {
        self.characteristics
    }

    pub fn is_ordered(&self) -> bool {
        self.characteristics & SCAN_ORDERED != 0
    }

    pub fn descriptor(&self) -> Arc<RowDescriptor> {
        self.descriptor.clone()
    }

    /// The next row, or `None` at the end of the stream.
    pub async fn next_row(&mut self) -> Result<Option<RowData>> {
        loop {
            if self.done {
                return Ok(None);
            }
            if self.batch.remaining() > 0 {
                let key = read_len_bytes(&mut self.batch)?;
                let value = read_len_bytes(&mut self.batch)?;
                let row = RowData::decode(self.descriptor.clone(), &key, &value)?;
                return Ok(Some(row));
            }
            self.fetch_batch().await?;
        }
    }

    async fn fetch_batch(&mut self) -> Result<()> {
        let pipe = self
            .pipe
            .as_mut()
            .ok_or_else(RemoteError::closed_stream)?;
        if self.pending_ack {
            pipe.send_raw(Bytes::from_static(&[RELAY_ACK])).await?;
            self.pending_ack = false;
        }
        let len = pipe.read_u32_le().await?;
        if len == ROW_STREAM_END {
            let status = pipe.read_u8().await?;
            self.done = true;
            let pipe = self.pipe.take().expect("pipe present");
            if status == STATUS_OK && pipe.is_clean() {
                self.session.recycle(pipe);
            } else {
                pipe.close().await;
            }
            return Ok(());
        }
        self.batch = pipe.read_exact(len as usize).await?;
        self.pending_ack = true;
        Ok(())
    }

    /// Stop early; the stream's pipe is cancelled at the next batch
    /// boundary and closed.
    pub async fn close(mut self) {
        if let Some(mut pipe) = self.pipe.take() {
            if self.pending_ack {
                let _ = pipe.send_raw(Bytes::from_static(&[RELAY_STOP])).await;
            }
            pipe.close().await;
        }
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        drop(self.pipe.take());
    }
}

fn read_len_bytes(buf: &mut Bytes) -> Result<Vec<u8>> {
    if buf.remaining() < 4 {
        return Err(RemoteError::io("truncated row batch"));
    }
    let len = buf.get_u32_le() as usize;
    if buf.remaining() < len {
        return Err(RemoteError::io("truncated row batch"));
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

/// A forward-only updater over typed rows: the server holds the position
/// and applies dirty-column patches as the client steps.
pub struct Updater {
    session: Arc<SessionInner>,
    descriptor: Arc<RowDescriptor>,
    pipe: Option<Pipe>,
    current: Option<RowData>,
}

impl Updater {
    async fn open(
        session: Arc<SessionInner>,
        descriptor: Arc<RowDescriptor>,
        mut pipe: Pipe,
    ) -> Result<Updater> {
        let current = read_updater_row(&mut pipe, &descriptor).await?;
        Ok(Updater {
            session,
            descriptor,
            pipe: Some(pipe),
            current,
        })
    }

    /// The row at the current position.
    pub fn row(&self) -> Option<&RowData> {
        self.current.as_ref()
    }

    async fn command(&mut self, cmd: u8, payload: Option<&[u8]>) -> Result<Option<&RowData>> {
        let pipe = self
            .pipe
            .as_mut()
            .ok_or_else(RemoteError::closed_stream)?;
        let mut msg = BytesMut::with_capacity(1 + payload.map_or(0, |p| p.len() + 4));
        msg.put_u8(cmd);
        if let Some(payload) = payload {
            msg.put_u32_le(payload.len() as u32);
            msg.put_slice(payload);
        }
        pipe.send_raw(msg.freeze()).await?;
        self.current = read_updater_row(pipe, &self.descriptor).await?;
        Ok(self.current.as_ref())
    }

    /// Advance without modifying the current row.
    pub async fn step(&mut self) -> Result<Option<&RowData>> {
        self.command(crate::protocol::UPDATER_STEP, None).await
    }

    /// Apply the named dirty columns of `row` to the current row, then
    /// advance.
    pub async fn update(&mut self, row: &RowData, dirty: &[&str]) -> Result<Option<&RowData>> {
        let partial = partial_of(row, dirty)?;
        self.command(crate::protocol::UPDATER_UPDATE, Some(&partial))
            .await
    }

    /// Delete the current row, then advance.
    pub async fn delete(&mut self) -> Result<Option<&RowData>> {
        self.command(crate::protocol::UPDATER_DELETE, None).await
    }

    /// End the updater stream; its pipe is recycled.
    pub async fn close(mut self) -> Result<()> {
        if let Some(mut pipe) = self.pipe.take() {
            let mut msg = BytesMut::with_capacity(1);
            msg.put_u8(crate::protocol::UPDATER_CLOSE);
            let sent = pipe.send_raw(msg.freeze()).await;
            if sent.is_ok() && pipe.is_clean() {
                self.session.recycle(pipe);
            } else {
                pipe.close().await;
            }
        }
        Ok(())
    }
}

impl Drop for Updater {
    fn drop(&mut self) {
        drop(self.pipe.take());
    }
}

async fn read_updater_row(
    pipe: &mut Pipe,
    descriptor: &Arc<RowDescriptor>,
) -> Result<Option<RowData>> {
    let status = pipe.read_u8().await?;
    if status != STATUS_OK {
        let len = pipe.read_u32_le().await? as usize;
        let encoded = pipe.read_exact(len).await?;
        let mut cursor = encoded;
        return Err(decode_error(&mut cursor)?);
    }
    if pipe.read_u8().await? == 0 {
        return Ok(None);
    }
    let klen = pipe.read_u32_le().await? as usize;
    let key = pipe.read_exact(klen).await?;
    let vlen = pipe.read_u32_le().await? as usize;
    let value = pipe.read_exact(vlen).await?;
    Ok(Some(RowData::decode(descriptor.clone(), &key, &value)?))
}

struct DerivedState {
    stub: Arc<Stub>,
    descriptor: Arc<RowDescriptor>,
    broken: Option<String>,
}

pub(crate) struct DerivedInner {
    session: Arc<SessionInner>,
    source: Table,
    query: String,
    args: Vec<Option<ColumnValue>>,
    state: Mutex<DerivedState>,
}

/// A table derived from a query: the handle/descriptor pair re-drives
/// itself after a reconnect, and a failed re-derivation leaves a broken
/// proxy whose every operation reports it.
#[derive(Clone)]
pub struct DerivedTable {
    pub(crate) inner: Arc<DerivedInner>,
}

impl DerivedTable {
    async fn current(&self) -> Result<(Arc<Stub>, Arc<RowDescriptor>)> {
        let state = self.inner.state.lock().await;
        if let Some(cause) = &state.broken {
            return Err(RemoteError::illegal_state(format!(
                "unable to restore derived table: {}",
                cause
            )));
        }
        Ok((state.stub.clone(), state.descriptor.clone()))
    }

    pub async fn descriptor(&self) -> Result<Arc<RowDescriptor>> {
        Ok(self.current().await?.1)
    }

    /// Scan the derived rows, optionally narrowed further by `query`.
    pub async fn new_scanner(
        &self,
        txn: Option<&Transaction>,
        query: &str,
        args: &[Option<ColumnValue>],
    ) -> Result<Scanner> {
        let (stub, descriptor) = self.current().await?;
        let txn_handle = txn_id(&self.inner.session, txn).await?;
        let (pipe, mut reply) = stub
            .invoke_stream(TableOp::NewScanner as u8, |msg| {
                msg.put_u64_le(txn_handle);
                put_str_arg(msg, query);
                encode_args(args, msg);
            })
            .await?;
        let characteristics = get_u8(&mut reply)?;
        Ok(Scanner::new(
            self.inner.session.clone(),
            descriptor,
            pipe,
            characteristics,
        ))
    }

    pub async fn any_rows(
        &self,
        txn: Option<&Transaction>,
        query: &str,
        args: &[Option<ColumnValue>],
    ) -> Result<bool> {
        let (stub, _) = self.current().await?;
        let txn_handle = txn_id(&self.inner.session, txn).await?;
        let mut reply = stub
            .invoke(TableOp::AnyRows as u8, |msg| {
                msg.put_u64_le(txn_handle);
                put_str_arg(msg, query);
                encode_args(args, msg);
            })
            .await?;
        get_bool(&mut reply)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        let (stub, _) = self.current().await?;
        let mut reply = stub.invoke(TableOp::IsEmpty as u8, |_| {}).await?;
        get_bool(&mut reply)
    }

    pub async fn delete_all(&self, txn: Option<&Transaction>) -> Result<u64> {
        let (stub, _) = self.current().await?;
        let txn_handle = txn_id(&self.inner.session, txn).await?;
        let mut reply = stub
            .invoke(TableOp::DeleteAll as u8, |msg| {
                msg.put_u64_le(txn_handle);
            })
            .await?;
        get_u64(&mut reply)
    }
}

#[async_trait]
impl Restore for DerivedInner {
    async fn restore(&self, session: &Arc<SessionInner>) -> Result<()> {
        // Re-drive the derivation through the (already restored) source
        // table and install the handle/descriptor pair atomically.
        let epoch = session.epoch();
        let result = self
            .source
            .inner
            .stub
            .invoke(TableOp::Derive as u8, |msg| {
                put_str_arg(msg, &self.query);
                encode_args(&self.args, msg);
            })
            .await;
        let mut state = self.state.lock().await;
        match result {
            Ok(mut reply) => {
                let handle = get_u64(&mut reply)?;
                let descriptor_bytes = get_bytes(&mut reply)?;
                let descriptor =
                    Arc::new(RowDescriptor::decode(&mut descriptor_bytes.as_slice())?);
                state.stub = Arc::new(Stub::new(session.clone(), handle, epoch));
                state.descriptor = descriptor;
                state.broken = None;
                Ok(())
            }
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                state.broken = Some(e.to_string());
                Ok(())
            }
        }
    }
}
