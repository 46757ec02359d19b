// Shared fixtures for the end-to-end tests: a server over the in-memory
// engine, an engine wrapper that counts interesting calls, and a TCP relay
// whose live connection can be severed to exercise reconnects.

use remora::engine::mem::MemDatabase;
use remora::engine::types::{DurabilityMode, Stats};
use remora::engine::{
    CompactionEvents, Database, Handler, Index, IndexDeletion, Snapshot, Sorter, Transaction,
    VerificationEvents, View,
};
use remora::error::Result;
use remora::{Server, ServerConfig};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Start a server over a fresh in-memory engine.
pub async fn start_server(tokens: &[u64]) -> (Server, SocketAddr) {
    let engine: Arc<dyn Database> = Arc::new(MemDatabase::new());
    start_server_with(engine, tokens).await
}

pub async fn start_server_with(
    engine: Arc<dyn Database>,
    tokens: &[u64],
) -> (Server, SocketAddr) {
    let config = ServerConfig::default().with_tokens(tokens);
    let server = Server::bind(engine, config).await.expect("bind server");
    let addr = server.local_addr();
    (server, addr)
}

/// Engine wrapper counting the calls the tests assert on.
pub struct CountingEngine {
    inner: MemDatabase,
    pub open_index_calls: AtomicU64,
}

impl CountingEngine {
    pub fn new() -> Arc<CountingEngine> {
        Arc::new(CountingEngine {
            inner: MemDatabase::new(),
            open_index_calls: AtomicU64::new(0),
        })
    }

    pub fn open_count(&self) -> u64 {
        self.open_index_calls.load(Ordering::Relaxed)
    }
}

impl Database for CountingEngine {
    fn open_index(&self, name: &[u8]) -> Result<Arc<dyn Index>> {
        self.open_index_calls.fetch_add(1, Ordering::Relaxed);
        self.inner.open_index(name)
    }

    fn find_index(&self, name: &[u8]) -> Result<Option<Arc<dyn Index>>> {
        self.inner.find_index(name)
    }

    fn index_by_id(&self, id: u64) -> Result<Option<Arc<dyn Index>>> {
        self.inner.index_by_id(id)
    }

    fn rename_index(&self, index: &dyn Index, new_name: &[u8]) -> Result<()> {
        self.inner.rename_index(index, new_name)
    }

    fn delete_index(&self, index: &dyn Index) -> Result<Arc<dyn IndexDeletion>> {
        self.inner.delete_index(index)
    }

    fn temporary_index(&self) -> Result<Arc<dyn Index>> {
        self.inner.temporary_index()
    }

    fn registry(&self) -> Arc<dyn View> {
        self.inner.registry()
    }

    fn registry_key_map(&self) -> Arc<dyn View> {
        self.inner.registry_key_map()
    }

    fn new_transaction(&self, durability: DurabilityMode) -> Arc<dyn Transaction> {
        self.inner.new_transaction(durability)
    }

    fn bogus(&self) -> Arc<dyn Transaction> {
        self.inner.bogus()
    }

    fn custom_writer(&self, name: &str) -> Result<Arc<dyn Handler>> {
        self.inner.custom_writer(name)
    }

    fn prepare_writer(&self, name: &str) -> Result<Arc<dyn Handler>> {
        self.inner.prepare_writer(name)
    }

    fn new_sorter(&self) -> Arc<dyn Sorter> {
        self.inner.new_sorter()
    }

    fn preallocate(&self, bytes: u64) -> Result<()> {
        self.inner.preallocate(bytes)
    }

    fn set_capacity_limit(&self, bytes: i64) {
        self.inner.set_capacity_limit(bytes)
    }

    fn capacity_limit(&self) -> i64 {
        self.inner.capacity_limit()
    }

    fn begin_snapshot(&self) -> Result<Box<dyn Snapshot>> {
        self.inner.begin_snapshot()
    }

    fn create_cache_primer(&self) -> Result<Vec<u8>> {
        self.inner.create_cache_primer()
    }

    fn apply_cache_primer(&self, data: &[u8]) -> Result<()> {
        self.inner.apply_cache_primer(data)
    }

    fn stats(&self) -> Stats {
        self.inner.stats()
    }

    fn flush(&self) -> Result<()> {
        self.inner.flush()
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }

    fn checkpoint(&self) -> Result<()> {
        self.inner.checkpoint()
    }

    fn compact_file(&self, events: Option<&mut dyn CompactionEvents>, target: f64) -> Result<bool> {
        self.inner.compact_file(events, target)
    }

    fn verify(&self, events: Option<&mut dyn VerificationEvents>) -> Result<bool> {
        self.inner.verify(events)
    }

    fn is_leader(&self) -> bool {
        self.inner.is_leader()
    }

    fn upon_leader(&self, acquired: Box<dyn FnOnce() + Send>, lost: Box<dyn FnOnce() + Send>) {
        self.inner.upon_leader(acquired, lost)
    }

    fn failover(&self) -> Result<()> {
        self.inner.failover()
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }

    fn close_cause(&self, cause: &str) -> Result<()> {
        self.inner.close_cause(cause)
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn shutdown(&self) -> Result<()> {
        self.inner.shutdown()
    }
}

/// A TCP relay in front of the server. Severing kills the live relayed
/// connection so the client observes a dropped transport; the next client
/// connection relays again.
pub struct Relay {
    pub addr: SocketAddr,
    kill_tx: watch::Sender<u64>,
}

impl Relay {
    pub async fn start(target: SocketAddr) -> Relay {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind relay");
        let addr = listener.local_addr().expect("relay addr");
        let (kill_tx, kill_rx) = watch::channel(0u64);
        tokio::spawn(run_relay(listener, target, kill_rx));
        Relay { addr, kill_tx }
    }

    /// Drop every currently relayed connection.
    pub fn sever(&self) {
        self.kill_tx.send_modify(|generation| *generation += 1);
    }
}

async fn run_relay(listener: TcpListener, target: SocketAddr, kill_rx: watch::Receiver<u64>) {
    loop {
        let Ok((client, _)) = listener.accept().await else {
            return;
        };
        let mut kill = kill_rx.clone();
        kill.mark_unchanged();
        tokio::spawn(async move {
            let Ok(upstream) = TcpStream::connect(target).await else {
                return;
            };
            let (mut client_read, mut client_write) = client.into_split();
            let (mut upstream_read, mut upstream_write) = upstream.into_split();
            let forward = async {
                let a = tokio::io::copy(&mut client_read, &mut upstream_write);
                let b = tokio::io::copy(&mut upstream_read, &mut client_write);
                tokio::select! {
                    _ = a => {}
                    _ = b => {}
                }
            };
            tokio::select! {
                _ = forward => {}
                _ = kill.changed() => {}
            }
            // Both halves drop here, severing the relayed session.
        });
    }
}

/// Wait until `check` passes or the deadline hits.
#[allow(dead_code)]
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}
