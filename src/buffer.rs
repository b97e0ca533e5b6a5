//! Three-valued byte buffer used at every I/O boundary: present, SQL-style
//! null, or invalid (no such record). Represented as a plain enum rather
//! than a tagged pointer.

use std::cmp::Ordering;

/// A byte sequence that is either present (`Valid`), SQL-style `Null`, or
/// `Invalid` (meaning "no such record" — distinct from both other states).
///
/// Ordering: `Null < empty Valid < any nonempty Valid`; `Invalid` compares
/// unequal to everything and is never ordered (see `Buf::partial_cmp`).
#[derive(Debug, Clone, Eq)]
pub enum Buf {
    /// Absence of a record entirely (e.g. a failed lookup).
    Invalid,
    /// An explicit SQL-style NULL value.
    Null,
    /// Concrete bytes.
    Valid(Vec<u8>),
}

impl Buf {
    /// Build a valid buffer from any byte-convertible value.
    pub fn valid(bytes: impl Into<Vec<u8>>) -> Buf {
        Buf::Valid(bytes.into())
    }

    /// `true` for `Buf::Valid(_)`, including the empty byte string.
    pub fn is_valid(&self) -> bool {
        matches!(self, Buf::Valid(_))
    }

    /// `true` for `Buf::Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Buf::Null)
    }

    /// `true` for `Buf::Invalid`.
    pub fn is_invalid(&self) -> bool {
        matches!(self, Buf::Invalid)
    }

    /// The underlying bytes, if this is `Valid`.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Buf::Valid(b) => Some(b.as_slice()),
            _ => None,
        }
    }

    /// Byte length for `Valid`, `0` for `Null`, and `0` for `Invalid`.
    /// Callers that need to distinguish absence must check `is_invalid`
    /// first; `len` alone cannot tell `Null` from empty `Valid`.
    pub fn len(&self) -> usize {
        match self {
            Buf::Valid(b) => b.len(),
            Buf::Null | Buf::Invalid => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PartialEq for Buf {
    fn eq(&self, other: &Buf) -> bool {
        match (self, other) {
            (Buf::Invalid, Buf::Invalid) => true,
            (Buf::Null, Buf::Null) => true,
            (Buf::Valid(a), Buf::Valid(b)) => a == b,
            _ => false,
        }
    }
}

/// Total order over keys: shorter byte strings sort before longer ones;
/// equal-length keys compare lexicographically by unsigned byte value
///. `Null` sorts before any `Valid`, including empty.
impl Ord for Buf {
    fn cmp(&self, other: &Buf) -> Ordering {
        match (self, other) {
            (Buf::Null, Buf::Null) => Ordering::Equal,
            (Buf::Null, Buf::Valid(_)) => Ordering::Less,
            (Buf::Valid(_), Buf::Null) => Ordering::Greater,
            (Buf::Valid(a), Buf::Valid(b)) => match a.len().cmp(&b.len()) {
                Ordering::Equal => a.as_slice().cmp(b.as_slice()),
                ord => ord,
            },
            // Invalid is not meaningfully ordered against anything,
            // including itself; treat it as always-equal so sort routines
            // stay total without claiming semantic meaning.
            (Buf::Invalid, Buf::Invalid) => Ordering::Equal,
            (Buf::Invalid, _) => Ordering::Less,
            (_, Buf::Invalid) => Ordering::Greater,
        }
    }
}

impl PartialOrd for Buf {
    fn partial_cmp(&self, other: &Buf) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<&[u8]> for Buf {
    fn from(b: &[u8]) -> Buf {
        Buf::Valid(b.to_vec())
    }
}

impl From<Vec<u8>> for Buf {
    fn from(b: Vec<u8>) -> Buf {
        Buf::Valid(b)
    }
}

impl From<&str> for Buf {
    fn from(s: &str) -> Buf {
        Buf::Valid(s.as_bytes().to_vec())
    }
}

/// Byte-level ordering used directly on raw key slices by the B+-tree
/// (which stores keys packed into pages, not as `Buf`). Kept as a free
/// function so node/leaf code need not allocate a `Buf` per comparison.
pub fn cmp_bytes(a: &[u8], b: &[u8]) -> Ordering {
    match a.len().cmp(&b.len()) {
        Ordering::Equal => a.cmp(b),
        ord => ord,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_sorts_before_empty_and_nonempty() {
        let null = Buf::Null;
        let empty = Buf::valid(vec![]);
        let nonempty = Buf::valid(vec![1]);
        assert!(null < empty);
        assert!(empty < nonempty);
        assert_ne!(null, empty);
    }

    #[test]
    fn shorter_keys_sort_before_longer_regardless_of_bytes() {
        let short = Buf::valid(vec![0xFF]);
        let long = Buf::valid(vec![0x00, 0x00]);
        assert!(short < long);
    }

    #[test]
    fn invalid_is_distinct_from_null_and_empty() {
        assert_ne!(Buf::Invalid, Buf::Null);
        assert_ne!(Buf::Invalid, Buf::valid(vec![]));
    }

    #[test]
    fn byte_cmp_matches_buf_cmp_for_valid() {
        let a = vec![1, 2, 3];
        let b = vec![1, 2, 4];
        assert_eq!(cmp_bytes(&a, &b), Buf::valid(a).cmp(&Buf::valid(b)));
    }
}
