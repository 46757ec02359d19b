// Error taxonomy for the remote layer.
//
// Every error kind that may cross the wire carries the trace frames captured
// where it was raised, so a client observes the server-side failure point.

use thiserror::Error;

/// One captured frame of a wire-portable trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    /// Module path of the raising site.
    pub module: String,

    /// Function or operation name.
    pub function: String,

    /// Source line.
    pub line: u32,
}

/// Capture a [`TraceFrame`] at the current location.
///
/// The operation name is given explicitly since Rust has no portable runtime
/// frame introspection; the resulting frames still round-trip the wire with
/// their module/function/line preserved.
#[macro_export]
macro_rules! frame {
    ($op:expr) => {
        $crate::error::TraceFrame {
            module: module_path!().to_string(),
            function: $op.to_string(),
            line: line!(),
        }
    };
}

/// A deadlock participant: the lock another owner holds that closed the cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlockInfo {
    /// Identifier of the index the contended key belongs to.
    pub index_id: u64,

    /// Name of that index, when known.
    pub index_name: Option<Vec<u8>>,

    /// The contended key.
    pub key: Vec<u8>,

    /// Attachment of the owning transaction, when one was set.
    pub owner_attachment: Option<String>,
}

#[derive(Error, Debug, Clone)]
pub enum RemoteError {
    #[error("database is closed")]
    ClosedDatabase { frames: Vec<TraceFrame> },

    #[error("index is closed")]
    ClosedIndex { frames: Vec<TraceFrame> },

    #[error("view is closed")]
    ClosedView { frames: Vec<TraceFrame> },

    #[error("deadlock detected after {nanos_timeout}ns")]
    Deadlock {
        nanos_timeout: u64,
        attachment: String,
        guilty: bool,
        participants: Vec<DeadlockInfo>,
        frames: Vec<TraceFrame>,
    },

    #[error("lock acquisition timed out after {nanos_timeout}ns")]
    LockTimeout {
        nanos_timeout: u64,
        attachment: Option<String>,
        frames: Vec<TraceFrame>,
    },

    #[error("lock failure: {message}")]
    LockFailure {
        message: String,
        frames: Vec<TraceFrame>,
    },

    #[error("view constraint: {message}")]
    ViewConstraint {
        message: String,
        frames: Vec<TraceFrame>,
    },

    #[error("query error at {start}..{end}: {message}")]
    Query {
        message: String,
        start: u32,
        end: u32,
        frames: Vec<TraceFrame>,
    },

    #[error("invalid transaction: {message}")]
    InvalidTransaction {
        message: String,
        frames: Vec<TraceFrame>,
    },

    #[error("unsupported operation: {message}")]
    Unsupported {
        message: String,
        frames: Vec<TraceFrame>,
    },

    #[error("illegal state: {message}")]
    IllegalState {
        message: String,
        frames: Vec<TraceFrame>,
    },

    #[error("IO error: {message}")]
    Io {
        message: String,
        frames: Vec<TraceFrame>,
    },
}

impl RemoteError {
    pub fn closed_database() -> Self {
        RemoteError::ClosedDatabase {
            frames: vec![frame!("closed_database")],
        }
    }

    pub fn closed_index() -> Self {
        RemoteError::ClosedIndex {
            frames: vec![frame!("closed_index")],
        }
    }

    pub fn closed_view() -> Self {
        RemoteError::ClosedView {
            frames: vec![frame!("closed_view")],
        }
    }

    pub fn lock_timeout(nanos_timeout: u64) -> Self {
        RemoteError::LockTimeout {
            nanos_timeout,
            attachment: None,
            frames: vec![frame!("lock_timeout")],
        }
    }

    pub fn lock_failure(message: impl Into<String>) -> Self {
        RemoteError::LockFailure {
            message: message.into(),
            frames: vec![frame!("lock_failure")],
        }
    }

    pub fn view_constraint(message: impl Into<String>) -> Self {
        RemoteError::ViewConstraint {
            message: message.into(),
            frames: vec![frame!("view_constraint")],
        }
    }

    pub fn query(message: impl Into<String>, start: u32, end: u32) -> Self {
        RemoteError::Query {
            message: message.into(),
            start,
            end,
            frames: vec![frame!("query")],
        }
    }

    pub fn invalid_transaction(message: impl Into<String>) -> Self {
        RemoteError::InvalidTransaction {
            message: message.into(),
            frames: vec![frame!("invalid_transaction")],
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        RemoteError::Unsupported {
            message: message.into(),
            frames: vec![frame!("unsupported")],
        }
    }

    pub fn illegal_state(message: impl Into<String>) -> Self {
        RemoteError::IllegalState {
            message: message.into(),
            frames: vec![frame!("illegal_state")],
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        RemoteError::Io {
            message: message.into(),
            frames: vec![frame!("io")],
        }
    }

    /// Error surfaced when an operation races a dropped session.
    pub fn disconnected() -> Self {
        RemoteError::io("session connection lost")
    }

    /// Error surfaced by any operation on a stream whose pipe is gone.
    pub fn closed_stream() -> Self {
        RemoteError::illegal_state("stream is closed")
    }

    /// The trace frames carried by this error.
    pub fn frames(&self) -> &[TraceFrame] {
        match self {
            RemoteError::ClosedDatabase { frames }
            | RemoteError::ClosedIndex { frames }
            | RemoteError::ClosedView { frames }
            | RemoteError::Deadlock { frames, .. }
            | RemoteError::LockTimeout { frames, .. }
            | RemoteError::LockFailure { frames, .. }
            | RemoteError::ViewConstraint { frames, .. }
            | RemoteError::Query { frames, .. }
            | RemoteError::InvalidTransaction { frames, .. }
            | RemoteError::Unsupported { frames, .. }
            | RemoteError::IllegalState { frames, .. }
            | RemoteError::Io { frames, .. } => frames,
        }
    }

    /// Append a propagation frame, preserving the original capture order.
    pub fn with_frame(mut self, frame: TraceFrame) -> Self {
        match &mut self {
            RemoteError::ClosedDatabase { frames }
            | RemoteError::ClosedIndex { frames }
            | RemoteError::ClosedView { frames }
            | RemoteError::Deadlock { frames, .. }
            | RemoteError::LockTimeout { frames, .. }
            | RemoteError::LockFailure { frames, .. }
            | RemoteError::ViewConstraint { frames, .. }
            | RemoteError::Query { frames, .. }
            | RemoteError::InvalidTransaction { frames, .. }
            | RemoteError::Unsupported { frames, .. }
            | RemoteError::IllegalState { frames, .. }
            | RemoteError::Io { frames, .. } => frames.push(frame),
        }
        self
    }

    /// Whether a restorable re-establishment should retry after this error.
    ///
    /// Transport-level failures are transient; every domain or programmer
    /// error is permanent and breaks the proxy instead.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Io { .. })
    }
}

pub type Result<T> = std::result::Result<T, RemoteError>;

impl From<std::io::Error> for RemoteError {
    fn from(e: std::io::Error) -> Self {
        RemoteError::Io {
            message: e.to_string(),
            frames: vec![frame!("from_io")],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_capture() {
        let e = RemoteError::lock_timeout(1_000);
        assert_eq!(e.frames().len(), 1);
        assert_eq!(e.frames()[0].function, "lock_timeout");
        assert!(e.frames()[0].module.contains("error"));
    }

    #[test]
    fn test_with_frame_appends() {
        let e = RemoteError::closed_index().with_frame(frame!("dispatch"));
        assert_eq!(e.frames().len(), 2);
        assert_eq!(e.frames()[1].function, "dispatch");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone");
        let e: RemoteError = io.into();
        assert!(matches!(e, RemoteError::Io { .. }));
        assert!(e.is_transient());
    }

    #[test]
    fn test_domain_errors_not_transient() {
        assert!(!RemoteError::closed_database().is_transient());
        assert!(!RemoteError::query("bad", 0, 3).is_transient());
    }

    #[test]
    fn test_display() {
        let e = RemoteError::query("unexpected token", 4, 9);
        assert_eq!(e.to_string(), "query error at 4..9: unexpected token");
    }
}
