//! Duplicate-key subtree page bodies: `DupKeyLeaf`
//! holds many values for one key; `DupKeyNode` fans out over a subtree of
//! `DupKeyLeaf`/`DupKeyNode` children once a single key's values outgrow
//! one leaf.

use crate::constants::{BODY_SIZE, NULL_TAG};
use crate::encode::{decode_u16, decode_u64, encode_u16, encode_u64};
use crate::error::{Error, Result};
use crate::page::header::PageId;

const DKLEAF_FOOTER_SIZE: usize = 6; // numVs:u16, szKey:u16, sizeFree:u16
const DKLEAF_TERMINATOR: u16 = NULL_TAG;

/// Owning builder/view for a `DupKeyLeaf` body.
pub struct DupKeyLeafView<'a> {
    body: &'a [u8],
}

impl<'a> DupKeyLeafView<'a> {
    pub fn new(body: &'a [u8]) -> DupKeyLeafView<'a> {
        DupKeyLeafView { body }
    }

    fn footer_offset(&self) -> usize {
        BODY_SIZE - DKLEAF_FOOTER_SIZE
    }

    pub fn num_values(&self) -> usize {
        decode_u16(self.body, self.footer_offset()) as usize
    }

    pub fn key_len(&self) -> usize {
        decode_u16(self.body, self.footer_offset() + 2) as usize
    }

    pub fn size_free(&self) -> usize {
        decode_u16(self.body, self.footer_offset() + 4) as usize
    }

    pub fn key(&self) -> Vec<u8> {
        let kl = self.key_len();
        let key_start = self.footer_offset() - kl;
        self.body[key_start..key_start + kl].to_vec()
    }

    /// Iterates stored values in insertion order.
    pub fn values(&self) -> Vec<crate::buffer::Buf> {
        let mut out = Vec::with_capacity(self.num_values());
        let mut cursor = 0usize;
        for _ in 0..self.num_values() {
            let vlen = decode_u16(self.body, cursor);
            if vlen == DKLEAF_TERMINATOR {
                break;
            }
            out.push(crate::buffer::Buf::Valid(
                self.body[cursor + 2..cursor + 2 + vlen as usize].to_vec(),
            ));
            cursor += 2 + vlen as usize;
        }
        out
    }

    pub fn values_end(&self) -> usize {
        let mut cursor = 0usize;
        for _ in 0..self.num_values() {
            let vlen = decode_u16(self.body, cursor);
            cursor += 2 + vlen as usize;
        }
        cursor
    }
}

pub struct DupKeyLeafBuilder {
    key: Vec<u8>,
    values: Vec<Vec<u8>>,
}

impl DupKeyLeafBuilder {
    pub fn new(key: Vec<u8>) -> DupKeyLeafBuilder {
        DupKeyLeafBuilder { key, values: Vec::new() }
    }

    pub fn from_values(key: Vec<u8>, values: Vec<Vec<u8>>) -> DupKeyLeafBuilder {
        DupKeyLeafBuilder { key, values }
    }

    pub fn push(&mut self, value: Vec<u8>) {
        self.values.push(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[Vec<u8>] {
        &self.values
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn packed_size(&self) -> usize {
        DKLEAF_FOOTER_SIZE
            + self.key.len()
            + self.values.iter().map(|v| 2 + v.len()).sum::<usize>()
            + 2 // terminator
    }

    pub fn write(&self, body: &mut [u8]) -> Result<()> {
        if self.packed_size() > BODY_SIZE {
            return Err(Error::Invariant("dupkey leaf overflow".into()));
        }
        for b in body.iter_mut() {
            *b = 0;
        }
        let mut cursor = 0usize;
        for v in &self.values {
            encode_u16(body, cursor, v.len() as u16);
            body[cursor + 2..cursor + 2 + v.len()].copy_from_slice(v);
            cursor += 2 + v.len();
        }
        encode_u16(body, cursor, DKLEAF_TERMINATOR);

        let footer_offset = BODY_SIZE - DKLEAF_FOOTER_SIZE;
        let key_start = footer_offset - self.key.len();
        body[key_start..key_start + self.key.len()].copy_from_slice(&self.key);

        let size_free = key_start.saturating_sub(cursor + 2);
        encode_u16(body, footer_offset, self.values.len() as u16);
        encode_u16(body, footer_offset + 2, self.key.len() as u16);
        encode_u16(body, footer_offset + 4, size_free as u16);
        Ok(())
    }
}

// --- DupKeyNode ---------------------------------------------------------

const DKNODE_FIXED_SIZE: usize = 2 + 2 + 1 + 1; // nPtr, nPtrMax, lvl, has_key
const DKNODE_ENTRY_SIZE: usize = 8 + 2; // ptr, sizeFree

pub struct DupKeyNodeView<'a> {
    body: &'a [u8],
}

impl<'a> DupKeyNodeView<'a> {
    pub fn new(body: &'a [u8]) -> DupKeyNodeView<'a> {
        DupKeyNodeView { body }
    }

    pub fn n_ptr(&self) -> usize {
        decode_u16(self.body, 0) as usize
    }

    pub fn n_ptr_max(&self) -> usize {
        decode_u16(self.body, 2) as usize
    }

    pub fn level(&self) -> u8 {
        self.body[4]
    }

    pub fn has_key(&self) -> bool {
        self.body[5] != 0
    }

    pub fn child(&self, i: usize) -> (PageId, usize) {
        let off = DKNODE_FIXED_SIZE + i * DKNODE_ENTRY_SIZE;
        (decode_u64(self.body, off), decode_u16(self.body, off + 8) as usize)
    }

    pub fn children(&self) -> Vec<(PageId, usize)> {
        (0..self.n_ptr()).map(|i| self.child(i)).collect()
    }

    /// Index of the child with the most free space (`MOSTFREE` policy
    /// used by `DupKeyNode::insert`).
    pub fn most_free_child(&self) -> usize {
        (0..self.n_ptr())
            .max_by_key(|&i| self.child(i).1)
            .unwrap_or(0)
    }

    pub fn key(&self) -> Option<Vec<u8>> {
        if !self.has_key() {
            return None;
        }
        let kl = decode_u16(self.body, BODY_SIZE - 2) as usize;
        let key_start = BODY_SIZE - 2 - kl;
        Some(self.body[key_start..key_start + kl].to_vec())
    }
}

pub struct DupKeyNodeBuilder {
    pub level: u8,
    pub key: Option<Vec<u8>>,
    pub children: Vec<(PageId, usize)>,
}

impl DupKeyNodeBuilder {
    pub fn write(&self, body: &mut [u8]) -> Result<()> {
        let key_area = self.key.as_ref().map(|k| k.len() + 2).unwrap_or(0);
        let needed = DKNODE_FIXED_SIZE + self.children.len() * DKNODE_ENTRY_SIZE + key_area;
        if needed > BODY_SIZE {
            return Err(Error::Invariant("dupkey node overflow".into()));
        }
        for b in body.iter_mut() {
            *b = 0;
        }
        encode_u16(body, 0, self.children.len() as u16);
        encode_u16(body, 2, self.children.len() as u16);
        body[4] = self.level;
        body[5] = self.key.is_some() as u8;
        for (i, (ptr, free)) in self.children.iter().enumerate() {
            let off = DKNODE_FIXED_SIZE + i * DKNODE_ENTRY_SIZE;
            encode_u64(body, off, *ptr);
            encode_u16(body, off + 8, *free as u16);
        }
        if let Some(k) = &self.key {
            let key_start = BODY_SIZE - 2 - k.len();
            body[key_start..key_start + k.len()].copy_from_slice(k);
            encode_u16(body, BODY_SIZE - 2, k.len() as u16);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dupkey_leaf_round_trips_values() {
        let mut b = DupKeyLeafBuilder::new(b"d".to_vec());
        for i in 0..10u8 {
            b.push(vec![i]);
        }
        let mut body = vec![0u8; BODY_SIZE];
        b.write(&mut body).unwrap();
        let view = DupKeyLeafView::new(&body);
        assert_eq!(view.key(), b"d".to_vec());
        assert_eq!(view.num_values(), 10);
        assert_eq!(view.values().len(), 10);
    }

    #[test]
    fn dupkey_node_tracks_most_free_child() {
        let builder = DupKeyNodeBuilder {
            level: 0,
            key: Some(b"d".to_vec()),
            children: vec![(1, 100), (2, 500), (3, 50)],
        };
        let mut body = vec![0u8; BODY_SIZE];
        builder.write(&mut body).unwrap();
        let view = DupKeyNodeView::new(&body);
        assert_eq!(view.most_free_child(), 1);
        assert_eq!(view.key(), Some(b"d".to_vec()));
    }
}
