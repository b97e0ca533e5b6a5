//! Folding overrides back into a fresh base.
//!
//! Every commit adds one entry to `ActiveOvr`'s committed chain and
//! leaves a fresh physical page behind it; left unchecked both the chain
//! (conflict-scan cost) and the override buckets (lookup cost) grow
//! without bound. `rebase` terminates the chain, walks every table's
//! tree, and for each logical pgid still carrying an override under the
//! chain being folded, copies its current content forward into the
//! fresh `ActiveOvr` under that same logical pgid. Child pointers stored
//! in `Node`/`DupKeyNode` bodies are always logical ids and are never
//! rewritten — only which `ActiveOvr` resolves them changes — so the new
//! index ends up with one flat entry per touched page instead of a long
//! conflict-scan chain, and every subsequent read is O(1) again.
//! `refresh` is the lighter-weight cousin: it doesn't fold anything, it
//! just relocates pages still sitting in an old partition into the
//! active one so that partition can eventually be dropped

use crate::error::Result;
use crate::ovr::{ActiveOvr, CommitMode};
use crate::page::{self, dupkey, node, overview, PageId, PageType};
use crate::pagefile::PageFile;
use crate::tpio::TxSession;
use std::collections::HashSet;
use std::sync::Arc;

/// The outgoing page pointers carried by one page's body, empty for
/// every type but `Node`/`DupKeyNode`.
fn page_children(body: &[u8], page_type: PageType) -> Vec<PageId> {
    match page_type {
        PageType::Node => {
            let view = node::NodeView::new(body);
            let mut out = vec![view.ptr_neg1()];
            out.extend(view.entries().into_iter().map(|e| e.ptr));
            out
        }
        PageType::DupKeyNode => dupkey::DupKeyNodeView::new(body)
            .children()
            .into_iter()
            .map(|(ptr, _)| ptr)
            .collect(),
        _ => Vec::new(),
    }
}

/// Terminates `old_ovr`, folds every table's tree through it, and returns
/// a fresh `ActiveOvr` rooted at the prior tip plus the `unique_page_count`
/// baseline future commits' streak payloads should continue from. The overview page's table roots are folded as part of the same
/// walk. Callers are expected to have already arranged that new writers
/// start using the returned `ActiveOvr` (`Db` swaps its `Arc` under a
/// lock); transactions already in flight against `old_ovr` keep reading
/// correctly since `terminate` only blocks new commits, not lookups.
pub fn rebase(
    pagefile: &Arc<PageFile>,
    old_ovr: &Arc<ActiveOvr>,
    overview_pgid: PageId,
    prior_unique_page_count: u64,
) -> Result<(Arc<ActiveOvr>, u64)> {
    old_ovr.terminate();
    let tip = old_ovr.current_version();
    log::debug!("rebase starting, folding chain at tip version {}", tip);

    let read_tx = TxSession::begin_rebase(pagefile.clone(), old_ovr.clone(), prior_unique_page_count);
    let new_ovr = Arc::new(ActiveOvr::new(tip));
    let mut write_tx = TxSession::begin_rebase(pagefile.clone(), new_ovr.clone(), prior_unique_page_count);

    let mut visited = HashSet::new();
    rewrite_overview(&read_tx, &mut write_tx, overview_pgid, &mut visited)?;

    let new_pages_written = write_tx.modified_count() as u64;
    let outcome = write_tx.commit()?;
    let new_unique_page_count = outcome.map_or(prior_unique_page_count, |o| o.unique_page_count);

    log::debug!("rebase finished, new base version {}, {} page(s) rewritten", tip, new_pages_written);
    Ok((new_ovr, new_unique_page_count))
}

fn rewrite_overview(
    read_tx: &TxSession,
    write_tx: &mut TxSession,
    overview_pgid: PageId,
    visited: &mut HashSet<PageId>,
) -> Result<()> {
    visited.insert(overview_pgid);
    let h = read_tx.read_page(overview_pgid)?;
    let entries = overview::OverviewView::new(h.body()).entries();
    for (_, root, _) in &entries {
        rewrite_subtree(read_tx, write_tx, *root, visited)?;
    }

    // The overview's table-root pointers are logical pgids and never need
    // rewriting; only carry the page itself forward if its own content was
    // overridden (e.g. a table was created/dropped since the last rebase).
    if read_tx.physical_pgid(overview_pgid) != overview_pgid {
        let mut wh = write_tx.modify_page(h)?;
        write_tx.write_back(&wh);
    }
    Ok(())
}

/// Post-order walk of one table's tree: every descendant is folded into
/// `new_ovr` first, then this page's own override (if any) is carried
/// forward. Child pointers are always logical pgids and are never
/// rewritten — what changes across a rebase is which `ActiveOvr` resolves
/// them, not their value, so a page only needs touching here if it was
/// itself overridden under the chain being folded away.
fn rewrite_subtree(
    read_tx: &TxSession,
    write_tx: &mut TxSession,
    pgid: PageId,
    visited: &mut HashSet<PageId>,
) -> Result<()> {
    if !visited.insert(pgid) {
        return Ok(());
    }
    let h = read_tx.read_page(pgid)?;
    let children = page_children(h.body(), h.page_type());
    for child in &children {
        rewrite_subtree(read_tx, write_tx, *child, visited)?;
    }

    if read_tx.physical_pgid(pgid) != pgid {
        let mut wh = write_tx.modify_page(h)?;
        write_tx.write_back(&wh);
    }
    Ok(())
}

/// Forces every leaf/dup-key-leaf still physically backed by a partition
/// `<= partid_threshold` to be re-overridden into the active partition,
/// without folding any override or touching logical identities. Returns
/// the running unique-page count after the relocation commit, or
/// `Ok(None)` if nothing needed relocating (trivial commit).
pub fn refresh(
    pagefile: &Arc<PageFile>,
    ovr: &Arc<ActiveOvr>,
    overview_pgid: PageId,
    partid_threshold: u16,
    prior_unique_page_count: u64,
) -> Result<Option<u64>> {
    let mut tx = TxSession::begin(pagefile.clone(), ovr.clone(), prior_unique_page_count);
    tx.set_commit_mode(CommitMode::Refresh);

    let overview_entries = {
        let h = tx.read_page(overview_pgid)?;
        overview::OverviewView::new(h.body()).entries()
    };

    let mut visited = HashSet::new();
    for (_, root, _) in overview_entries {
        refresh_subtree(&mut tx, root, partid_threshold, &mut visited)?;
    }
    Ok(tx.commit()?.map(|o| o.unique_page_count))
}

fn refresh_subtree(
    tx: &mut TxSession,
    pgid: PageId,
    partid_threshold: u16,
    visited: &mut HashSet<PageId>,
) -> Result<()> {
    if !visited.insert(pgid) {
        return Ok(());
    }
    let h = tx.read_page(pgid)?;
    let children = page_children(h.body(), h.page_type());
    for child in &children {
        refresh_subtree(tx, *child, partid_threshold, visited)?;
    }

    let physical = tx.physical_pgid(pgid);
    if page::pgid_partid(physical) <= partid_threshold {
        let h = tx.read_page(pgid)?;
        let wh = tx.modify_page(h)?;
        tx.write_back(&wh);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buf;
    use crate::btree::{self, PutMode};
    use crate::overview_table;
    use crate::pagefile::OpenOptionsPf;

    fn open_pf(dir: &tempfile::TempDir) -> Arc<PageFile> {
        let prefix = dir.path().join("db").to_str().unwrap().to_string();
        Arc::new(PageFile::open(&prefix, OpenOptionsPf::default()).unwrap())
    }

    #[test]
    fn rebase_preserves_every_record_and_resets_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let pf = open_pf(&dir);
        let mut ovr = Arc::new(ActiveOvr::new(0));
        let mut cache = overview_table::TableOffCache::new();

        let mut tx = TxSession::begin(pf.clone(), ovr.clone(), 0);
        let overview_pgid = overview_table::new_overview(&mut tx).unwrap();
        let mut root = btree::new_empty(&mut tx).unwrap();
        for i in 0..200u32 {
            let k = format!("{:05}", i).into_bytes();
            root = btree::put(&mut tx, root, &k, Buf::valid(vec![7u8; 10]), PutMode::Insert).unwrap();
        }
        overview_table::set_table_root(&mut tx, overview_pgid, &mut cache, b"default", root).unwrap();
        tx.commit().unwrap();

        let mut tx2 = TxSession::begin(pf.clone(), ovr.clone(), 0);
        for i in 0..50u32 {
            let k = format!("{:05}", i).into_bytes();
            root = btree::put(&mut tx2, root, &k, Buf::valid(vec![9u8; 3]), PutMode::Update).unwrap();
        }
        overview_table::set_table_root(&mut tx2, overview_pgid, &mut cache, b"default", root).unwrap();
        tx2.commit().unwrap();

        let (new_ovr, _) = rebase(&pf, &ovr, overview_pgid, 0).unwrap();
        ovr = new_ovr;
        assert!(ovr.ver_base() > 0);

        let tx3 = TxSession::begin(pf.clone(), ovr.clone(), 0);
        let root_after = overview_table::get_table_root(&tx3, overview_pgid, &mut cache, b"default")
            .unwrap()
            .unwrap();
        let all = btree::collect_all(&tx3, root_after).unwrap();
        assert_eq!(all.len(), 200);
        for i in 0..200u32 {
            let expected = if i < 50 { vec![9u8; 3] } else { vec![7u8; 10] };
            assert_eq!(all[i as usize].1, Buf::valid(expected));
        }
    }

    #[test]
    fn refresh_relocates_pages_out_of_an_old_partition() {
        let dir = tempfile::tempdir().unwrap();
        let pf = open_pf(&dir);
        let ovr = Arc::new(ActiveOvr::new(0));

        let mut tx = TxSession::begin(pf.clone(), ovr.clone(), 0);
        let overview_pgid = overview_table::new_overview(&mut tx).unwrap();
        let root = btree::new_empty(&mut tx).unwrap();
        let mut cache = overview_table::TableOffCache::new();
        overview_table::set_table_root(&mut tx, overview_pgid, &mut cache, b"default", root).unwrap();
        tx.commit().unwrap();

        let result = refresh(&pf, &ovr, overview_pgid, 0, 0).unwrap();
        assert!(result.is_none() || result.is_some());
    }
}
