//! Fixed sizes and tuning knobs shared across the storage engine.

/// Page size in bytes. Fixed for the lifetime of a database file.
pub const PAGE_SIZE: usize = 4096;

/// Bytes reserved at the tail of every page for the per-commit streak
/// channel (see `crate::tpio`).
pub const STREAK_SIZE: usize = 40;

/// On-disk size of `page::Header`: id, idOvrTgt, txid (8 bytes each),
/// type + flags (1 byte each), crc32 (4 bytes), 2 bytes padding.
pub const HEADER_SIZE: usize = 8 + 8 + 8 + 1 + 1 + 4 + 2;

/// Bytes available to a page's type-specific body.
pub const BODY_SIZE: usize = PAGE_SIZE - HEADER_SIZE - STREAK_SIZE;

/// Maximum number of (key,value)/(value-only) records a regular leaf may
/// hold before a split is forced, regardless of remaining free space.
pub const MAX_RECORDS_PER_LEAF: usize = 255;

/// Fraction of body space used in leaf-insert split heuristics: once the
/// running packed size of a leaf under construction drops below half the
/// body, the packer switches to a fresh leaf page.
pub const DEFAULT_SPLIT_THRESHOLD: usize = BODY_SIZE / 2;

/// A single key's combined duplicate-run packed size beyond which the
/// key is promoted out of a regular leaf into a `DupKeyLeaf`.
pub const DUPKEY_PROMOTE_THRESHOLD: usize = BODY_SIZE * 2 / 3;

/// Largest key accepted by the B+-tree: keys must leave room for at
/// least two entries per node/leaf.
pub const MAX_KEY_SIZE: usize = BODY_SIZE / 2 - 1;

/// Number of buckets in the override-index hash arrays.
pub const TPIO_NHASH: usize = 64;

/// Max local id within one partition: `1 GiB / PAGE_SIZE`.
pub const PARTITION_MAX_PAGES: u64 = (1u64 << 30) / PAGE_SIZE as u64;

/// Bits reserved for the local id portion of a page id.
pub const PGID_LOCAL_BITS: u32 = 52;

/// Mask selecting the local-id portion of a page id.
pub const PGID_LOCALID_MASK: u64 = (1u64 << PGID_LOCAL_BITS) - 1;

/// Highest partition id that does not collide with `PARTID_INVALID`.
pub const PARTID_MAX: u16 = 0x0FFE;

/// Sentinel partition id.
pub const PARTID_INVALID: u16 = 0xFFFF;

/// Sentinel transaction/version id.
pub const TXID_INVALID: u64 = u64::MAX;

/// Sentinel page id (all components set).
pub const PGID_INVALID: u64 = u64::MAX;

/// Marks a key or value of this length as logically `null` rather than
/// empty (see `crate::buffer`).
pub const NULL_TAG: u16 = 0xFFFF;

/// Default number of live overrides at which a rebase is triggered.
pub const DEFAULT_REBASE_THRESHOLD: usize = 4096;
