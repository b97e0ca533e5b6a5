//! B+-tree regular leaf page body.
//!
//! Records are packed head-to-tail from the body start; each is either a
//! full `(key, value)` record or a value-only record that inherits the
//! key of the nearest preceding full record (run-length duplicate
//! encoding). A tail-to-head offset table tags each slot's kind in its
//! high bit, followed by a `{numKVs, sizeFree}` footer.

use crate::constants::{BODY_SIZE, MAX_RECORDS_PER_LEAF, NULL_TAG};
use crate::encode::{decode_u16, encode_u16};
use crate::error::{Error, Result};

const FOOTER_SIZE: usize = 4;
const OFFSET_ENTRY_SIZE: usize = 2;
const VALUE_ONLY_BIT: u16 = 1 << 15;
const OFFSET_MASK: u16 = !VALUE_ONLY_BIT;

/// A decoded record: `key` is `None` for value-only records (caller must
/// scan left to the nearest full record to recover it).
#[derive(Debug, Clone)]
pub struct LeafRecord {
    pub key: Option<Vec<u8>>,
    pub value: crate::buffer::Buf,
}

fn decode_buf(buf: &[u8], len_field: u16) -> crate::buffer::Buf {
    if len_field == NULL_TAG {
        crate::buffer::Buf::Null
    } else {
        crate::buffer::Buf::Valid(buf.to_vec())
    }
}

pub struct LeafView<'a> {
    body: &'a [u8],
}

impl<'a> LeafView<'a> {
    pub fn new(body: &'a [u8]) -> LeafView<'a> {
        LeafView { body }
    }

    fn footer_offset(&self) -> usize {
        BODY_SIZE - FOOTER_SIZE
    }

    pub fn num_kvs(&self) -> usize {
        decode_u16(self.body, self.footer_offset()) as usize
    }

    pub fn size_free(&self) -> usize {
        decode_u16(self.body, self.footer_offset() + 2) as usize
    }

    fn offset_slot(&self, i: usize) -> usize {
        self.footer_offset() - (i + 1) * OFFSET_ENTRY_SIZE
    }

    fn raw_offset(&self, i: usize) -> (usize, bool) {
        let raw = decode_u16(self.body, self.offset_slot(i));
        ((raw & OFFSET_MASK) as usize, raw & VALUE_ONLY_BIT != 0)
    }

    /// Decodes the record at slot `i` without resolving an inherited key.
    /// Returns `(is_full, inline_key, value)`; `inline_key` is only
    /// meaningful when `is_full` is `true` (a value-only record's
    /// `None` means "inherit", not "null").
    fn record_raw(&self, i: usize) -> (bool, Option<Vec<u8>>, crate::buffer::Buf) {
        let (off, value_only) = self.raw_offset(i);
        if value_only {
            let vlen = decode_u16(self.body, off);
            let v = decode_buf(&self.body[off + 2..off + 2 + value_len(vlen)], vlen);
            (false, None, v)
        } else {
            let klen = decode_u16(self.body, off);
            let vlen = decode_u16(self.body, off + 2);
            let kl = value_len(klen);
            let key = if klen == NULL_TAG {
                None
            } else {
                Some(self.body[off + 4..off + 4 + kl].to_vec())
            };
            let vstart = off + 4 + kl;
            let v = decode_buf(&self.body[vstart..vstart + value_len(vlen)], vlen);
            (true, key, v)
        }
    }

    /// Resolves the logical key of slot `i`, scanning left through
    /// value-only records if necessary.
    pub fn key_at(&self, i: usize) -> Option<Vec<u8>> {
        let mut j = i;
        loop {
            let (off, value_only) = self.raw_offset(j);
            if !value_only {
                let klen = decode_u16(self.body, off);
                return if klen == NULL_TAG {
                    None
                } else {
                    Some(self.body[off + 4..off + 4 + value_len(klen)].to_vec())
                };
            }
            if j == 0 {
                unreachable!("value-only record at index 0 violates leaf invariant");
            }
            j -= 1;
        }
    }

    pub fn record_at(&self, i: usize) -> LeafRecord {
        let (is_full, inline_key, value) = self.record_raw(i);
        let key = if is_full { inline_key } else { self.key_at(i) };
        LeafRecord { key, value }
    }

    pub fn is_full(&self, i: usize) -> bool {
        !self.raw_offset(i).1
    }

    pub fn records(&self) -> Vec<(Vec<u8>, crate::buffer::Buf)> {
        (0..self.num_kvs())
            .map(|i| {
                let key = self.key_at(i).unwrap_or_default();
                (key, self.record_at(i).value)
            })
            .collect()
    }

    /// Binary search over resolved keys for `upper_bound`/`lower_bound`
    /// style lookups used by insert/update.
    pub fn lower_bound_index(&self, key: &[u8]) -> usize {
        let n = self.num_kvs();
        let mut lo = 0usize;
        let mut hi = n;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let k = self.key_at(mid).unwrap_or_default();
            if crate::buffer::cmp_bytes(&k, key) == std::cmp::Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Index one past the last record sharing `key` (upper bound).
    pub fn upper_bound_index(&self, key: &[u8]) -> usize {
        let n = self.num_kvs();
        let mut lo = 0usize;
        let mut hi = n;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let k = self.key_at(mid).unwrap_or_default();
            if crate::buffer::cmp_bytes(&k, key) == std::cmp::Ordering::Greater {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        lo
    }

    pub fn find_exact(&self, key: &[u8]) -> Option<usize> {
        let i = self.lower_bound_index(key);
        if i < self.num_kvs() && self.key_at(i).unwrap_or_default() == key {
            Some(i)
        } else {
            None
        }
    }
}

fn value_len(field: u16) -> usize {
    if field == NULL_TAG {
        0
    } else {
        field as usize
    }
}

/// Packed byte size of a full `(key, value)` record.
pub fn full_record_size(key_len: usize, value_len: usize) -> usize {
    4 + key_len + value_len + OFFSET_ENTRY_SIZE
}

/// Packed byte size of a value-only record.
pub fn value_only_record_size(value_len: usize) -> usize {
    2 + value_len + OFFSET_ENTRY_SIZE
}

/// Owning builder used to (re)pack a leaf's ordered record list, e.g.
/// after insert/update/delete or during split.
pub struct LeafBuilder {
    /// `(key, value)` for full records; value-only runs are reconstructed
    /// automatically from consecutive equal keys.
    records: Vec<(Vec<u8>, crate::buffer::Buf)>,
}

impl LeafBuilder {
    pub fn new() -> LeafBuilder {
        LeafBuilder { records: Vec::new() }
    }

    pub fn from_records(records: Vec<(Vec<u8>, crate::buffer::Buf)>) -> LeafBuilder {
        LeafBuilder { records }
    }

    pub fn push(&mut self, key: Vec<u8>, value: crate::buffer::Buf) {
        self.records.push((key, value));
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[(Vec<u8>, crate::buffer::Buf)] {
        &self.records
    }

    /// Packed size this builder would occupy if written as one leaf.
    pub fn packed_size(&self) -> usize {
        let mut size = 0usize;
        let mut prev_key: Option<&[u8]> = None;
        for (k, v) in &self.records {
            let vlen = v.as_bytes().map(|b| b.len()).unwrap_or(0);
            if prev_key == Some(k.as_slice()) {
                size += value_only_record_size(vlen);
            } else {
                size += full_record_size(k.len(), vlen);
            }
            prev_key = Some(k.as_slice());
        }
        size
    }

    /// Greedily packs `self.records[start..]` into one leaf body,
    /// returning how many records were consumed. `thres_split` is the
    /// free-space floor at which packing stops early to leave room in
    /// the *next* leaf; pass `0` to fill the
    /// leaf completely (bulk-append fast path).
    pub fn pack_from(
        records: &[(Vec<u8>, crate::buffer::Buf)],
        start: usize,
        thres_split: usize,
    ) -> Result<(Vec<u8>, usize)> {
        let mut body = vec![0u8; BODY_SIZE];
        let footer_offset = BODY_SIZE - FOOTER_SIZE;
        let mut rec_cursor = 0usize;
        let mut count = 0usize;
        let mut prev_key: Option<&[u8]> = None;
        let mut i = start;
        while i < records.len() {
            if count >= MAX_RECORDS_PER_LEAF {
                break;
            }
            let (k, v) = &records[i];
            let is_dup = prev_key == Some(k.as_slice());
            let vbytes = v.as_bytes();
            let vlen = vbytes.map(|b| b.len()).unwrap_or(0);
            let rec_size = if is_dup {
                value_only_record_size(vlen)
            } else {
                full_record_size(k.len(), vlen)
            };
            let offsets_start_if_added = footer_offset - (count + 1) * OFFSET_ENTRY_SIZE;
            let would_free = offsets_start_if_added as isize - (rec_cursor + rec_size - OFFSET_ENTRY_SIZE) as isize;
            if count > 0 && (would_free < thres_split as isize || rec_cursor + rec_size - OFFSET_ENTRY_SIZE > offsets_start_if_added) {
                break;
            }
            let off_slot = footer_offset - (count + 1) * OFFSET_ENTRY_SIZE;
            if is_dup {
                let vfield = if v.is_null() { NULL_TAG } else { vlen as u16 };
                encode_u16(&mut body, rec_cursor, vfield);
                if let Some(b) = vbytes {
                    body[rec_cursor + 2..rec_cursor + 2 + vlen].copy_from_slice(b);
                }
                encode_u16(&mut body, off_slot, (rec_cursor as u16) | VALUE_ONLY_BIT);
                rec_cursor += 2 + vlen;
            } else {
                encode_u16(&mut body, rec_cursor, k.len() as u16);
                let vfield = if v.is_null() { NULL_TAG } else { vlen as u16 };
                encode_u16(&mut body, rec_cursor + 2, vfield);
                body[rec_cursor + 4..rec_cursor + 4 + k.len()].copy_from_slice(k);
                if let Some(b) = vbytes {
                    body[rec_cursor + 4 + k.len()..rec_cursor + 4 + k.len() + vlen].copy_from_slice(b);
                }
                encode_u16(&mut body, off_slot, rec_cursor as u16);
                rec_cursor += 4 + k.len() + vlen;
            }
            count += 1;
            prev_key = Some(k.as_slice());
            i += 1;
        }
        if count == 0 {
            return Err(Error::Invariant("leaf cannot fit a single record".into()));
        }
        let offsets_start = footer_offset - count * OFFSET_ENTRY_SIZE;
        let size_free = offsets_start.saturating_sub(rec_cursor);
        encode_u16(&mut body, footer_offset, count as u16);
        encode_u16(&mut body, footer_offset + 2, size_free as u16);
        Ok((body, count))
    }
}

impl Default for LeafBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buf;

    #[test]
    fn packs_and_reads_back_simple_records() {
        let recs = vec![
            (b"a".to_vec(), Buf::valid(b"1".to_vec())),
            (b"b".to_vec(), Buf::valid(b"2".to_vec())),
        ];
        let (body, count) = LeafBuilder::pack_from(&recs, 0, 0).unwrap();
        assert_eq!(count, 2);
        let view = LeafView::new(&body);
        assert_eq!(view.num_kvs(), 2);
        assert_eq!(view.key_at(0), Some(b"a".to_vec()));
        assert_eq!(view.key_at(1), Some(b"b".to_vec()));
        assert_eq!(view.record_at(0).value, Buf::valid(b"1".to_vec()));
        assert_eq!(view.record_at(1).value, Buf::valid(b"2".to_vec()));
    }

    #[test]
    fn duplicate_runs_share_inherited_key() {
        let recs = vec![
            (b"d".to_vec(), Buf::valid(b"0".to_vec())),
            (b"d".to_vec(), Buf::valid(b"1".to_vec())),
            (b"d".to_vec(), Buf::valid(b"2".to_vec())),
        ];
        let (body, count) = LeafBuilder::pack_from(&recs, 0, 0).unwrap();
        assert_eq!(count, 3);
        let view = LeafView::new(&body);
        for i in 0..3 {
            assert_eq!(view.key_at(i), Some(b"d".to_vec()));
        }
        assert!(view.is_full(0));
        assert!(!view.is_full(1));
        assert!(!view.is_full(2));
    }

    #[test]
    fn find_exact_locates_key() {
        let recs = vec![
            (b"a".to_vec(), Buf::valid(b"1".to_vec())),
            (b"c".to_vec(), Buf::valid(b"3".to_vec())),
        ];
        let (body, _) = LeafBuilder::pack_from(&recs, 0, 0).unwrap();
        let view = LeafView::new(&body);
        assert_eq!(view.find_exact(b"c"), Some(1));
        assert_eq!(view.find_exact(b"b"), None);
    }

    #[test]
    fn null_and_empty_values_round_trip_distinctly() {
        let recs = vec![
            (b"k1".to_vec(), Buf::Null),
            (b"k2".to_vec(), Buf::valid(vec![])),
        ];
        let (body, _) = LeafBuilder::pack_from(&recs, 0, 0).unwrap();
        let view = LeafView::new(&body);
        assert_eq!(view.record_at(0).value, Buf::Null);
        assert_eq!(view.record_at(1).value, Buf::valid(vec![]));
        assert_ne!(view.record_at(0).value, view.record_at(1).value);
    }
}
