//! Table directory built on top of the overview page body.
//!
//! The overview page itself is just a root pgid known to the caller (by
//! convention, page `0:0`, the first page ever allocated); this
//! module resolves table ids against it through a `TxSession` and keeps a
//! `TableOffCache` so repeated lookups of the same id can skip the linear
//! scan in `page::overview::OverviewView::entries` as long as the layout
//! version hasn't moved.

use crate::error::{Error, Result};
use crate::page::overview::{OverviewBuilder, OverviewView};
use crate::page::{self, PageId, PageType};
use crate::tpio::TxSession;
use std::collections::HashMap;

/// Caches the byte offset of one table id's `rootPgid` field within the
/// overview body, valid only for the `verLayout` it was taken at.
#[derive(Debug, Clone, Copy)]
struct CachedOffset {
    layout_version: u64,
    root_offset: usize,
}

/// Per-`Db` cache of table-id -> overview-body offset.
#[derive(Default)]
pub struct TableOffCache {
    entries: HashMap<Vec<u8>, CachedOffset>,
}

impl TableOffCache {
    pub fn new() -> TableOffCache {
        TableOffCache::default()
    }

    fn lookup(&self, id: &[u8], layout_version: u64) -> Option<usize> {
        self.entries
            .get(id)
            .filter(|c| c.layout_version == layout_version)
            .map(|c| c.root_offset)
    }

    fn remember(&mut self, id: &[u8], layout_version: u64, root_offset: usize) {
        self.entries.insert(
            id.to_vec(),
            CachedOffset { layout_version, root_offset },
        );
    }

    /// Drops every cached offset; used after a rebase replaces the
    /// overview page's physical backing.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Reads `id`'s root pgid out of the overview page at `overview_pgid`,
/// consulting and refreshing `cache`.
pub fn get_table_root(
    tx: &TxSession,
    overview_pgid: PageId,
    cache: &mut TableOffCache,
    id: &[u8],
) -> Result<Option<PageId>> {
    let h = tx.read_page(overview_pgid)?;
    let view = OverviewView::new(h.body());
    let layout_version = view.layout_version();

    if let Some(off) = cache.lookup(id, layout_version) {
        let root = crate::encode::decode_u64(h.body(), off);
        return Ok(Some(root));
    }

    for (eid, root, off) in view.entries() {
        if eid == id {
            cache.remember(id, layout_version, off);
            return Ok(Some(root));
        }
    }
    Ok(None)
}

pub fn default_table_root(tx: &TxSession, overview_pgid: PageId) -> Result<Option<PageId>> {
    let h = tx.read_page(overview_pgid)?;
    Ok(OverviewView::new(h.body()).default_table_root())
}

/// Creates or overwrites `id`'s root pgid, bumping `verLayout` on a new
/// entry. The overview page is itself
/// copy-on-write through `modify_page`, but its logical pgid is stable
/// for the database's lifetime, so the returned pgid always equals
/// `overview_pgid`; callers pass it straight through for symmetry with
/// `drop_table`.
pub fn set_table_root(
    tx: &mut TxSession,
    overview_pgid: PageId,
    cache: &mut TableOffCache,
    id: &[u8],
    root: PageId,
) -> Result<PageId> {
    let h = tx.read_page(overview_pgid)?;
    let mut builder = OverviewBuilder::from_view(&OverviewView::new(h.body()));
    builder.set_table_root(id, root);
    let mut h = tx.modify_page(h)?;
    builder.write(h.body_mut())?;
    tx.write_back(&h);
    cache.entries.retain(|k, _| k == id);
    Ok(h.pgid)
}

/// Removes `id` from the directory. Errors with
/// `TableNotFound` if it was never present.
pub fn drop_table(
    tx: &mut TxSession,
    overview_pgid: PageId,
    cache: &mut TableOffCache,
    id: &[u8],
) -> Result<PageId> {
    let h = tx.read_page(overview_pgid)?;
    let mut builder = OverviewBuilder::from_view(&OverviewView::new(h.body()));
    if !builder.drop_table(id) {
        return Err(Error::TableNotFound(String::from_utf8_lossy(id).into_owned()));
    }
    let mut h = tx.modify_page(h)?;
    builder.write(h.body_mut())?;
    tx.write_back(&h);
    cache.entries.clear();
    Ok(h.pgid)
}

/// Allocates the very first overview page a fresh database needs
pub fn new_overview(tx: &mut TxSession) -> Result<PageId> {
    let mut h = tx.new_page(PageType::Overview)?;
    OverviewBuilder::empty().write(h.body_mut())?;
    tx.write_back(&h);
    Ok(h.pgid)
}

pub fn layout_version(tx: &TxSession, overview_pgid: PageId) -> Result<u64> {
    let h = tx.read_page(overview_pgid)?;
    Ok(OverviewView::new(h.body()).layout_version())
}

/// All `(id, root)` pairs currently in the directory, used by rebase's
/// root walk and by `Db::table_names`.
pub fn all_tables(tx: &TxSession, overview_pgid: PageId) -> Result<Vec<(Vec<u8>, PageId)>> {
    let h = tx.read_page(overview_pgid)?;
    Ok(OverviewView::new(h.body())
        .entries()
        .into_iter()
        .map(|(id, root, _)| (id, root))
        .collect())
}

/// The well-known pgid of the very first page any fresh database
/// allocates: partition 0, local 0.
pub fn bootstrap_pgid() -> PageId {
    page::pgid_make(0, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ovr::ActiveOvr;
    use crate::pagefile::{OpenOptionsPf, PageFile};
    use std::sync::Arc;

    fn open_pf(dir: &tempfile::TempDir) -> Arc<PageFile> {
        let prefix = dir.path().join("db").to_str().unwrap().to_string();
        Arc::new(PageFile::open(&prefix, OpenOptionsPf::default()).unwrap())
    }

    #[test]
    fn set_get_drop_round_trip_through_a_tx() {
        let dir = tempfile::tempdir().unwrap();
        let pf = open_pf(&dir);
        let ovr = Arc::new(ActiveOvr::new(0));
        let mut tx = TxSession::begin(pf, ovr, 0);
        let mut cache = TableOffCache::new();

        let mut overview = new_overview(&mut tx).unwrap();
        overview = set_table_root(&mut tx, overview, &mut cache, b"default", 42).unwrap();
        overview = set_table_root(&mut tx, overview, &mut cache, b"T", 99).unwrap();

        assert_eq!(get_table_root(&tx, overview, &mut cache, b"default").unwrap(), Some(42));
        assert_eq!(get_table_root(&tx, overview, &mut cache, b"T").unwrap(), Some(99));
        assert_eq!(get_table_root(&tx, overview, &mut cache, b"missing").unwrap(), None);

        overview = drop_table(&mut tx, overview, &mut cache, b"T").unwrap();
        assert_eq!(get_table_root(&tx, overview, &mut cache, b"T").unwrap(), None);
        assert!(matches!(
            drop_table(&mut tx, overview, &mut cache, b"T"),
            Err(Error::TableNotFound(_))
        ));
    }

    #[test]
    fn cache_survives_across_reads_at_same_layout_version() {
        let dir = tempfile::tempdir().unwrap();
        let pf = open_pf(&dir);
        let ovr = Arc::new(ActiveOvr::new(0));
        let mut tx = TxSession::begin(pf, ovr, 0);
        let mut cache = TableOffCache::new();

        let mut overview = new_overview(&mut tx).unwrap();
        overview = set_table_root(&mut tx, overview, &mut cache, b"default", 1).unwrap();
        let ver_before = layout_version(&tx, overview).unwrap();

        get_table_root(&tx, overview, &mut cache, b"default").unwrap();
        assert!(cache.lookup(b"default", ver_before).is_some());
    }
}
