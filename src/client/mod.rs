//! Client side of the remote layer: the session and the stub proxies that
//! expose the engine's native API over the wire.

mod cursor;
mod database;
mod observer;
mod session;
mod snapshot;
mod sorter;
mod stream;
mod stub;
mod table;
mod txn;
mod view;

pub use cursor::Cursor;
pub use database::Database;
pub use observer::{CompactionObserver, VerificationObserver};
pub use session::{Connector, SessionStatus, TcpConnector};
pub use snapshot::Snapshot;
pub use sorter::Sorter;
pub use stream::{ValueInputStream, ValueOutputStream};
pub use table::{DerivedTable, Scanner, Table, Updater};
pub use txn::Transaction;
pub use view::{HandlerProxy, Index, IndexDeletion, View};
