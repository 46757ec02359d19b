//! Wire protocol vocabulary.
//!
//! Every remote handle kind has a capability enum listing its operation
//! selectors. Each selector carries a contract that drives the client stub:
//!
//! - **batched**: written without waiting for a reply; failures are deferred
//!   to the next non-batched call on the same handle.
//! - **no_reply**: flushed and never answered, even on failure.
//! - **disposer**: the stub releases its remote handle after success.
//! - **restorable**: the call is recorded so the stub can be rebuilt after a
//!   session reconnect.
//! - **data**: the result is immutable; the stub fetches it once and caches.
//!
//! Request framing on a pipe: `handle id (u64 LE) | selector (u8) | args`.
//! Reply framing: `status (u8) | result-or-error`. Bulk operations follow the
//! reply with raw streamed bytes described per operation.

pub mod codec;
pub mod handshake;
pub mod wire;

/// Reply status: success, result follows.
pub const STATUS_OK: u8 = 0;

/// Reply status: an encoded error follows.
pub const STATUS_ERR: u8 = 1;

/// First byte written on a freshly opened pipe, identifying its channel use.
pub const CHANNEL_REQUEST: u8 = 1;
pub const CHANNEL_RELAY: u8 = 2;
pub const CHANNEL_CALLBACK: u8 = 3;

/// Value-stream chunk framing: 15-bit length plus a 1-bit end flag.
pub const CHUNK_LEN_MASK: u16 = 0x7FFF;
pub const CHUNK_END_FLAG: u16 = 0x8000;

/// Chunk header announcing a trailing encoded exception.
pub const CHUNK_EXCEPTION: u16 = 0xFFFF;

/// Largest payload of one value-stream chunk.
pub const MAX_CHUNK: usize = 0x7FFE;

/// Row-stream terminator written in place of a key length.
pub const ROW_STREAM_END: u32 = 0xFFFF_FFFF;

/// Byte budget of one row-stream batch between acknowledgements.
pub const ROW_BATCH_BYTES: usize = 64 * 1024;

/// Row-stream characteristics bit: rows arrive in key order.
pub const SCAN_ORDERED: u8 = 1;

/// Updater stream commands.
pub const UPDATER_CLOSE: u8 = 0;
pub const UPDATER_STEP: u8 = 1;
pub const UPDATER_UPDATE: u8 = 2;
pub const UPDATER_DELETE: u8 = 3;

/// Relay stream control bytes.
pub const RELAY_START: u8 = 1;
pub const RELAY_ACK: u8 = 1;
pub const RELAY_STOP: u8 = 0;

/// Relay record id marking an index boundary.
pub const RELAY_INDEX_BOUNDARY: u64 = 0;

/// Method contract annotations attached to an operation selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Contract {
    pub batched: bool,
    pub no_reply: bool,
    pub disposer: bool,
    pub restorable: bool,
    pub data: bool,
}

/// Declares a capability enum: selectors, wire codes, and contracts.
///
/// This is the stub/skeleton generation seam: stubs pick their invoke shape
/// from the contract, and the dispatcher decodes selectors through the
/// generated `from_u8`.
macro_rules! capability {
    ($(#[$meta:meta])* $vis:vis enum $name:ident {
        $($variant:ident = $code:literal $([$($flag:ident),+ $(,)?])? ),+ $(,)?
    }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        $vis enum $name {
            $($variant = $code),+
        }

        impl $name {
            pub fn from_u8(value: u8) -> crate::error::Result<Self> {
                match value {
                    $($code => Ok($name::$variant),)+
                    other => Err(crate::error::RemoteError::io(format!(
                        "unknown {} selector {}",
                        stringify!($name),
                        other
                    ))),
                }
            }

            pub fn contract(self) -> Contract {
                match self {
                    $($name::$variant => Contract {
                        $($($flag: true,)+)?
                        ..Contract::default()
                    },)+
                }
            }
        }
    };
}

capability! {
    /// Operations on the root database handle.
    pub enum DbOp {
        Dispose = 0 [batched],
        OpenIndex = 1 [restorable],
        FindIndex = 2 [restorable],
        IndexById = 3 [restorable],
        RenameIndex = 4,
        DeleteIndex = 5,
        TemporaryIndex = 6,
        Registry = 7 [restorable],
        RegistryKeyMap = 8 [restorable],
        NewTransaction = 9,
        Bogus = 10 [restorable],
        CustomWriter = 11 [restorable],
        PrepareWriter = 12 [restorable],
        NewSorter = 13,
        Preallocate = 14,
        SetCapacityLimit = 15 [batched],
        CapacityLimit = 16,
        BeginSnapshot = 17,
        CreateCachePrimer = 18,
        ApplyCachePrimer = 19,
        Stats = 20,
        Flush = 21,
        Sync = 22,
        Checkpoint = 23,
        CompactFile = 24,
        Verify = 25,
        IsLeader = 26,
        UponLeader = 27 [restorable],
        Failover = 28,
        Close = 29 [disposer],
        CloseCause = 30 [disposer],
        IsClosed = 31,
        Shutdown = 32 [disposer],
    }
}

capability! {
    /// Operations shared by views and indexes; index-only selectors start
    /// at 40 and fail with an unsupported error on plain views.
    pub enum ViewOp {
        Dispose = 0 [batched],
        Ordering = 1 [data],
        NewCursor = 2,
        NewAccessor = 3,
        NewTransaction = 4,
        IsEmpty = 5,
        Count = 6,
        Load = 7,
        Exists = 8,
        Touch = 9,
        Store = 10,
        Exchange = 11,
        Insert = 12,
        Replace = 13,
        Update = 14,
        UpdateWithOld = 15,
        Delete = 16,
        Remove = 17,
        LockShared = 18,
        TryLockShared = 19,
        LockUpgradable = 20,
        TryLockUpgradable = 21,
        LockExclusive = 22,
        TryLockExclusive = 23,
        LockCheck = 24,
        IsUnmodifiable = 25 [data],
        IsModifyAtomic = 26 [data],

        Id = 40 [data],
        Name = 41 [data],
        AsTable = 42,
        Evict = 43,
        Analyze = 44,
        VerifyIndex = 45,
        CloseIndex = 46 [disposer],
        Drop = 47,
        IsClosedIndex = 48,
    }
}

capability! {
    /// Operations on a cursor handle.
    pub enum CursorOp {
        Dispose = 0 [batched],
        Ordering = 1 [data],
        Link = 2 [batched],
        Key = 3,
        Value = 4,
        Autoload = 5 [batched],
        First = 6,
        Last = 7,
        Skip = 8,
        SkipBounded = 9,
        Next = 10,
        NextLe = 11,
        NextLt = 12,
        Previous = 13,
        PreviousGe = 14,
        PreviousGt = 15,
        Find = 16,
        FindGe = 17,
        FindGt = 18,
        FindLe = 19,
        FindLt = 20,
        FindNearby = 21,
        Random = 22,
        Exists = 23,
        Lock = 24,
        Load = 25,
        Store = 26,
        Commit = 27,
        Delete = 28,
        Register = 29,
        Unregister = 30 [batched],
        Copy = 31,
        Reset = 32 [batched, disposer],
        ValueLength = 33,
        SetValueLength = 34,
        ValueRead = 35,
        ValueWrite = 36,
        ValueClear = 37,
        ValueInputStream = 38,
        ValueOutputStream = 39,
    }
}

capability! {
    /// Operations on a transaction handle.
    pub enum TxnOp {
        Dispose = 0 [batched],
        LockMode = 1,
        SetLockMode = 2 [batched],
        LockTimeout = 3,
        SetLockTimeout = 4 [batched],
        Durability = 5,
        SetDurability = 6 [batched],
        Check = 7,
        IsBogus = 8 [data],
        Commit = 9,
        CommitAll = 10 [disposer],
        Enter = 11,
        Exit = 12,
        Reset = 13 [disposer],
        ResetCause = 14 [no_reply, disposer],
        Rollback = 15,
        LockShared = 16,
        TryLockShared = 17,
        LockUpgradable = 18,
        TryLockUpgradable = 19,
        LockExclusive = 20,
        TryLockExclusive = 21,
        LockCheck = 22,
        LastLockedIndex = 23,
        LastLockedKey = 24,
        WasAcquired = 25,
        Unlock = 26,
        UnlockToShared = 27,
        UnlockCombine = 28,
        Id = 29 [data],
        Flush = 30,
    }
}

capability! {
    /// Operations on a table handle (typed row analog of a view).
    pub enum TableOp {
        Dispose = 0 [batched],
        Proxy = 1 [restorable],
        NewScanner = 2,
        NewUpdater = 3,
        Derive = 4 [restorable],
        Validate = 5,
        ScannerPlan = 6,
        UpdaterPlan = 7,
        StreamPlan = 8,
        DeleteAll = 9,
        AnyRows = 10,
        IsEmpty = 11,
    }
}

capability! {
    /// Point row operations on a compiled per-descriptor proxy.
    pub enum ProxyOp {
        Dispose = 0 [batched],
        Load = 1,
        Exists = 2,
        Store = 3,
        Exchange = 4,
        Insert = 5,
        Replace = 6,
        Update = 7,
        Merge = 8,
        Delete = 9,
    }
}

capability! {
    /// Operations on a sorter handle.
    pub enum SorterOp {
        Dispose = 0 [batched],
        Add = 1,
        AddBatch = 2,
        AddAll = 3,
        Finish = 4,
        FinishScan = 5,
        Progress = 6,
        Reset = 7,
    }
}

capability! {
    /// Operations on a snapshot handle.
    pub enum SnapshotOp {
        Dispose = 0 [batched],
        WriteTo = 1 [disposer],
    }
}

capability! {
    /// Operations on a prepared index-deletion handle.
    pub enum DeletionOp {
        Dispose = 0 [batched],
        Run = 1 [disposer],
    }
}

capability! {
    /// Operations on a named durability handler handle.
    pub enum HandlerOp {
        Dispose = 0 [batched],
        Write = 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_round_trip() {
        assert_eq!(DbOp::from_u8(DbOp::OpenIndex as u8).unwrap(), DbOp::OpenIndex);
        assert_eq!(
            CursorOp::from_u8(CursorOp::ValueOutputStream as u8).unwrap(),
            CursorOp::ValueOutputStream
        );
        assert!(DbOp::from_u8(200).is_err());
    }

    #[test]
    fn test_contracts() {
        assert!(TxnOp::SetLockMode.contract().batched);
        assert!(!TxnOp::SetLockMode.contract().no_reply);
        assert!(TxnOp::ResetCause.contract().no_reply);
        assert!(TxnOp::ResetCause.contract().disposer);
        assert!(DbOp::OpenIndex.contract().restorable);
        assert!(ViewOp::Id.contract().data);
        assert_eq!(ViewOp::Load.contract(), Contract::default());
    }

    #[test]
    fn test_dispose_is_batched_everywhere() {
        assert!(DbOp::Dispose.contract().batched);
        assert!(ViewOp::Dispose.contract().batched);
        assert!(CursorOp::Dispose.contract().batched);
        assert!(TxnOp::Dispose.contract().batched);
        assert!(TableOp::Dispose.contract().batched);
        assert!(SorterOp::Dispose.contract().batched);
    }
}
