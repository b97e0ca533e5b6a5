//! Lookup and insert mode vocabulary shared by the B+-tree and the
//! embedded API.

/// How a lookup should resolve relative to its key when there is no
/// exact match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    /// Require an exact key match.
    Exact,
    /// The match if present, else the nearest preceding key.
    OrPrev,
    /// The match if present, else the nearest following key.
    OrNext,
    /// Strictly the nearest preceding key (step back one from the match).
    Before,
    /// Strictly the nearest following key (step forward one from the match).
    After,
    /// The very first record in the table, ignoring `key`.
    Front,
    /// The very last record in the table, ignoring `key`.
    Back,
}

#[derive(Debug, Clone)]
pub struct Query {
    pub key: Vec<u8>,
    pub qtype: QueryType,
}

impl Query {
    pub fn exact(key: impl Into<Vec<u8>>) -> Query {
        Query { key: key.into(), qtype: QueryType::Exact }
    }

    pub fn front() -> Query {
        Query { key: Vec::new(), qtype: QueryType::Front }
    }

    pub fn back() -> Query {
        Query { key: Vec::new(), qtype: QueryType::Back }
    }
}

/// `put` semantics for duplicate keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutMode {
    /// Always add a new record, allowing duplicate keys.
    Insert,
    /// Overwrite the first matching record; insert if absent.
    Update,
    /// Fail with `DuplicateKey` if a record for this key already exists.
    LeaveExisting,
}
