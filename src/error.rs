//! Error kinds surfaced across the storage engine.

use quick_error::quick_error;
use std::io;

quick_error! {
    /// Every fallible operation in this crate returns `Result<T, Error>`.
    #[derive(Debug)]
    pub enum Error {
        /// Invalid combination of open options, or a malformed partitioned
        /// path.
        Config(msg: String) {
            display("invalid configuration: {}", msg)
        }
        /// A filesystem or mmap syscall failed (open, mmap, truncate,
        /// fallocate, msync, sync_file_range, pwrite, close, unlink,
        /// mkdir, readdir).
        Io(err: io::Error) {
            display("I/O error: {}", err)
            source(err)
            from()
        }
        /// Recovery could not locate a valid overview or rebase page, or a
        /// page header failed its checksum/consistency check.
        Corrupt(msg: String) {
            display("corrupt database: {}", msg)
        }
        /// Commit was aborted by the override-index conflict check. The
        /// caller should retry the transaction.
        TxConflict {
            display("transaction conflict, retry")
        }
        /// `PUT_INSERT` with `LEAVE_EXISTING` semantics found a prior
        /// record for the same key.
        DuplicateKey {
            display("duplicate key")
        }
        /// Operation referenced a table id absent from the overview page.
        TableNotFound(id: String) {
            display("table not found: {}", id)
        }
        /// A new partition id would exceed `PARTID_MAX` and no older
        /// partitions have been dropped.
        OutOfSpace {
            display("no more partition ids available")
        }
        /// Programming-level misuse: cursor used after close, transaction
        /// used after commit/abort, key/value too large, etc.
        Invariant(msg: String) {
            display("invariant violation: {}", msg)
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
