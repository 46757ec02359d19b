// Remora - remote access layer for a transactional ordered key-value engine
// Core library module

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transport;

pub use client::{
    CompactionObserver, Connector, Cursor, Database, DerivedTable, HandlerProxy, Index,
    IndexDeletion, Scanner, SessionStatus, Snapshot, Sorter, Table, TcpConnector, Transaction,
    Updater, ValueInputStream, ValueOutputStream, VerificationObserver, View,
};
pub use config::{ClientConfig, ServerConfig};
pub use error::{RemoteError, Result};
pub use server::Server;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
