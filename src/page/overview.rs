//! Overview page / table directory body.
//!
//! Layout: a `u64` layout version, then `(szId:u16, id bytes,
//! rootPgid:u64)` entries, terminated by `0xFFFF`.

use crate::constants::NULL_TAG;
use crate::encode::{decode_u16, decode_u64, encode_u16, encode_u64};
use crate::error::{Error, Result};
use crate::page::header::PageId;

const VER_OFFSET: usize = 0;
const ENTRIES_START: usize = 8;

pub struct OverviewView<'a> {
    body: &'a [u8],
}

impl<'a> OverviewView<'a> {
    pub fn new(body: &'a [u8]) -> OverviewView<'a> {
        OverviewView { body }
    }

    pub fn layout_version(&self) -> u64 {
        decode_u64(self.body, VER_OFFSET)
    }

    /// Iterates `(id, root_pgid, byte_offset_of_root_field)`.
    pub fn entries(&self) -> Vec<(Vec<u8>, PageId, usize)> {
        let mut out = Vec::new();
        let mut cursor = ENTRIES_START;
        loop {
            let sz_id = decode_u16(self.body, cursor);
            if sz_id == NULL_TAG {
                break;
            }
            let id = self.body[cursor + 2..cursor + 2 + sz_id as usize].to_vec();
            let root_offset = cursor + 2 + sz_id as usize;
            let root = decode_u64(self.body, root_offset);
            out.push((id, root, root_offset));
            cursor = root_offset + 8;
        }
        out
    }

    pub fn get_table_root(&self, id: &[u8]) -> Option<PageId> {
        self.entries()
            .into_iter()
            .find(|(eid, _, _)| eid == id)
            .map(|(_, root, _)| root)
    }

    pub fn default_table_root(&self) -> Option<PageId> {
        self.entries().into_iter().next().map(|(_, root, _)| root)
    }
}

pub struct OverviewBuilder {
    pub layout_version: u64,
    pub entries: Vec<(Vec<u8>, PageId)>,
}

impl OverviewBuilder {
    pub fn from_view(view: &OverviewView) -> OverviewBuilder {
        OverviewBuilder {
            layout_version: view.layout_version(),
            entries: view
                .entries()
                .into_iter()
                .map(|(id, root, _)| (id, root))
                .collect(),
        }
    }

    pub fn empty() -> OverviewBuilder {
        OverviewBuilder {
            layout_version: 0,
            entries: Vec::new(),
        }
    }

    /// Overwrites an existing entry, or appends (bumping `layout_version`).
    pub fn set_table_root(&mut self, id: &[u8], pgid: PageId) {
        if let Some(e) = self.entries.iter_mut().find(|(eid, _)| eid == id) {
            e.1 = pgid;
        } else {
            self.entries.push((id.to_vec(), pgid));
            self.layout_version += 1;
        }
    }

    /// Removes an entry, bumping `layout_version` if it existed.
    pub fn drop_table(&mut self, id: &[u8]) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(eid, _)| eid != id);
        if self.entries.len() != before {
            self.layout_version += 1;
            true
        } else {
            false
        }
    }

    pub fn write(&self, body: &mut [u8]) -> Result<()> {
        for b in body.iter_mut() {
            *b = 0;
        }
        encode_u64(body, VER_OFFSET, self.layout_version);
        let mut cursor = ENTRIES_START;
        for (id, root) in &self.entries {
            if id.len() >= NULL_TAG as usize {
                return Err(Error::Invariant("table id too long".into()));
            }
            if cursor + 2 + id.len() + 8 + 2 > body.len() {
                return Err(Error::Invariant("overview page overflow".into()));
            }
            encode_u16(body, cursor, id.len() as u16);
            body[cursor + 2..cursor + 2 + id.len()].copy_from_slice(id);
            encode_u64(body, cursor + 2 + id.len(), *root);
            cursor += 2 + id.len() + 8;
        }
        encode_u16(body, cursor, NULL_TAG);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::BODY_SIZE;

    #[test]
    fn set_then_get_round_trips() {
        let mut b = OverviewBuilder::empty();
        b.set_table_root(b"default", 10);
        b.set_table_root(b"T", 20);
        assert_eq!(b.layout_version, 2);

        let mut body = vec![0u8; BODY_SIZE];
        b.write(&mut body).unwrap();
        let view = OverviewView::new(&body);
        assert_eq!(view.get_table_root(b"default"), Some(10));
        assert_eq!(view.get_table_root(b"T"), Some(20));
        assert_eq!(view.get_table_root(b"missing"), None);
        assert_eq!(view.default_table_root(), Some(10));
    }

    #[test]
    fn drop_table_removes_entry_and_bumps_version() {
        let mut b = OverviewBuilder::empty();
        b.set_table_root(b"T", 1);
        let ver_before = b.layout_version;
        assert!(b.drop_table(b"T"));
        assert!(b.layout_version > ver_before);
        assert!(!b.drop_table(b"T"));
    }
}
