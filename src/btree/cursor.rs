//! Cursor positioning over a table's in-order record sequence.
//!
//! A cursor holds a snapshot of the full in-order sequence
//! (`btree::collect_all`) and an index into it; `next`/`prev` are then
//! just index arithmetic, and a mutation re-snapshots and re-locates by
//! key. This trades re-collecting the whole table on every write (fine at
//! this crate's scale; see DESIGN.md) for not needing a node-stack cursor
//! that migrates across splits.

use crate::buffer::Buf;
use crate::btree::query::{Query, QueryType};

/// Resolves `query` against an already-collected, key-ordered sequence,
/// returning the index of the record it designates.
pub fn position_for(all: &[(Vec<u8>, Buf)], query: &Query) -> Option<usize> {
    if all.is_empty() {
        return None;
    }
    match query.qtype {
        QueryType::Front => Some(0),
        QueryType::Back => Some(all.len() - 1),
        QueryType::Exact => {
            let lb = lower_bound(all, &query.key);
            if lb < all.len() && all[lb].0 == query.key {
                Some(lb)
            } else {
                None
            }
        }
        QueryType::OrPrev => {
            let lb = lower_bound(all, &query.key);
            if lb < all.len() && all[lb].0 == query.key {
                Some(lb)
            } else if lb > 0 {
                Some(lb - 1)
            } else {
                None
            }
        }
        QueryType::OrNext => {
            let lb = lower_bound(all, &query.key);
            if lb < all.len() {
                Some(lb)
            } else {
                None
            }
        }
        QueryType::Before => {
            let lb = lower_bound(all, &query.key);
            if lb > 0 {
                Some(lb - 1)
            } else {
                None
            }
        }
        QueryType::After => {
            let ub = upper_bound(all, &query.key);
            if ub < all.len() {
                Some(ub)
            } else {
                None
            }
        }
    }
}

/// Index of the first record whose key is `>= key`.
fn lower_bound(all: &[(Vec<u8>, Buf)], key: &[u8]) -> usize {
    let mut lo = 0usize;
    let mut hi = all.len();
    while lo < hi {
        let mid = (lo + hi) / 2;
        if crate::buffer::cmp_bytes(&all[mid].0, key) == std::cmp::Ordering::Less {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

/// Index one past the last record whose key is `<= key`.
fn upper_bound(all: &[(Vec<u8>, Buf)], key: &[u8]) -> usize {
    let mut lo = 0usize;
    let mut hi = all.len();
    while lo < hi {
        let mid = (lo + hi) / 2;
        if crate::buffer::cmp_bytes(&all[mid].0, key) == std::cmp::Ordering::Greater {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    lo
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq() -> Vec<(Vec<u8>, Buf)> {
        vec![
            (b"a".to_vec(), Buf::valid(b"1".to_vec())),
            (b"b".to_vec(), Buf::valid(b"2".to_vec())),
            (b"b".to_vec(), Buf::valid(b"3".to_vec())),
            (b"d".to_vec(), Buf::valid(b"4".to_vec())),
        ]
    }

    #[test]
    fn exact_hits_first_duplicate() {
        let all = seq();
        let q = Query::exact(b"b".to_vec());
        assert_eq!(position_for(&all, &q), Some(1));
    }

    #[test]
    fn exact_miss_returns_none() {
        let all = seq();
        let q = Query::exact(b"c".to_vec());
        assert_eq!(position_for(&all, &q), None);
    }

    #[test]
    fn or_prev_falls_back_to_preceding_key() {
        let all = seq();
        let q = Query { key: b"c".to_vec(), qtype: QueryType::OrPrev };
        assert_eq!(position_for(&all, &q), Some(2));
    }

    #[test]
    fn or_next_falls_back_to_following_key() {
        let all = seq();
        let q = Query { key: b"c".to_vec(), qtype: QueryType::OrNext };
        assert_eq!(position_for(&all, &q), Some(3));
    }

    #[test]
    fn before_steps_back_one_from_an_exact_match() {
        let all = seq();
        let q = Query { key: b"b".to_vec(), qtype: QueryType::Before };
        assert_eq!(position_for(&all, &q), Some(0));
    }

    #[test]
    fn after_steps_forward_past_the_last_duplicate() {
        let all = seq();
        let q = Query { key: b"b".to_vec(), qtype: QueryType::After };
        assert_eq!(position_for(&all, &q), Some(3));
    }

    #[test]
    fn front_and_back_ignore_key() {
        let all = seq();
        assert_eq!(position_for(&all, &Query::front()), Some(0));
        assert_eq!(position_for(&all, &Query::back()), Some(3));
    }

    #[test]
    fn empty_table_has_no_positions() {
        let all: Vec<(Vec<u8>, Buf)> = Vec::new();
        assert_eq!(position_for(&all, &Query::front()), None);
        assert_eq!(position_for(&all, &Query::exact(b"x".to_vec())), None);
    }
}
