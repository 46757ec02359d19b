//! Framing and transport: one ordered byte stream carrying many logical
//! pipes.
//!
//! A pipe is acquired (opened or taken from the session pool), used for one
//! request/reply exchange or a bulk stream, and then either recycled back to
//! the pool or closed. Recycling is the throughput path; closing is
//! mandatory whenever the peer may still be mid-transfer.

pub mod conn;
pub mod frame;
pub mod pipe;

pub use conn::{BoxedStream, Conn, Duplex, WireStats};
pub use frame::{FrameHeader, FrameKind};
pub use pipe::Pipe;
