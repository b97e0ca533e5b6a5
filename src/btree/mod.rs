//! Copy-on-write B+-tree.
//!
//! A table's root is just a page id stored in the overview;
//! it may point at a `Node`, a `Leaf`, or — once a single key's values
//! outgrow a regular leaf — a `DupKeyLeaf`/`DupKeyNode` directly. Insert
//! and delete walk down from the root, recurse, and translate what comes
//! back from the child into either a same-slot pointer swap
//! (`Descend::Replaced`) or a new separating key the parent must absorb
//! (`Descend::Split`).

pub mod cursor;
pub mod query;

pub use query::{PutMode, Query, QueryType};

use crate::buffer::Buf;
use crate::constants::{BODY_SIZE, DEFAULT_SPLIT_THRESHOLD, DUPKEY_PROMOTE_THRESHOLD, MAX_KEY_SIZE};
use crate::error::{Error, Result};
use crate::page::{dupkey, leaf, node, PageId, PageType};
use crate::tpio::TxSession;

/// What inserting into a child subtree did to its pointer(s) in the
/// parent.
enum Descend {
    /// Same number of children; update this one pointer in place.
    Replaced(PageId),
    /// The child's single slot must become N children. Element 0's key is
    /// a placeholder the caller ignores (it inherits the old separating
    /// key, or becomes the new `ptr_{-1}`); elements 1.. carry real keys.
    Split(Vec<(Vec<u8>, PageId)>),
}

enum DelResult {
    /// The child subtree has no records left; caller must drop its slot.
    Empty,
    Changed(PageId),
}

/// Allocates a fresh, empty table (a single empty `Leaf`), returning its
/// root pgid.
pub fn new_empty(tx: &mut TxSession) -> Result<PageId> {
    let h = tx.new_page(PageType::Leaf)?;
    Ok(h.pgid)
}

/// Exact-match lookup, resolving to the first record for `key` if there
/// are duplicates.
pub fn get(tx: &TxSession, root: PageId, key: &[u8]) -> Result<Buf> {
    let mut pgid = root;
    loop {
        let h = tx.read_page(pgid)?;
        match h.page_type() {
            PageType::Node => {
                let view = node::NodeView::new(h.body());
                pgid = view.child_for(key);
            }
            PageType::Leaf => {
                let view = leaf::LeafView::new(h.body());
                return Ok(view
                    .find_exact(key)
                    .map(|i| view.record_at(i).value)
                    .unwrap_or(Buf::Invalid));
            }
            PageType::DupKeyLeaf => {
                let view = dupkey::DupKeyLeafView::new(h.body());
                if view.key() != key {
                    return Ok(Buf::Invalid);
                }
                return Ok(view.values().into_iter().next().unwrap_or(Buf::Invalid));
            }
            PageType::DupKeyNode => {
                let view = dupkey::DupKeyNodeView::new(h.body());
                if view.key().as_deref() != Some(key) {
                    return Ok(Buf::Invalid);
                }
                let children = view.children();
                let first_child = match children.first() {
                    Some((c, _)) => *c,
                    None => return Ok(Buf::Invalid),
                };
                let ch = tx.read_page(first_child)?;
                let cview = dupkey::DupKeyLeafView::new(ch.body());
                return Ok(cview.values().into_iter().next().unwrap_or(Buf::Invalid));
            }
            other => return Err(Error::Invariant(format!("unexpected page type {:?} in btree get", other))),
        }
    }
}

/// Resolves a `Query` against the table.
pub fn lookup(tx: &TxSession, root: PageId, query: &Query) -> Result<Option<(Vec<u8>, Buf)>> {
    let all = collect_all(tx, root)?;
    let idx = cursor::position_for(&all, query);
    Ok(idx.map(|i| all[i].clone()))
}

/// Full in-order materialization of a table's records, preserving
/// within-key insertion order for duplicates.
pub(crate) fn collect_all(tx: &TxSession, root: PageId) -> Result<Vec<(Vec<u8>, Buf)>> {
    let mut out = Vec::new();
    traverse(tx, root, &mut out)?;
    Ok(out)
}

fn traverse(tx: &TxSession, pgid: PageId, out: &mut Vec<(Vec<u8>, Buf)>) -> Result<()> {
    let h = tx.read_page(pgid)?;
    match h.page_type() {
        PageType::Leaf => {
            let view = leaf::LeafView::new(h.body());
            for i in 0..view.num_kvs() {
                let r = view.record_at(i);
                out.push((r.key.unwrap_or_default(), r.value));
            }
        }
        PageType::Node => {
            let (ptr_neg1, entries) = {
                let view = node::NodeView::new(h.body());
                (view.ptr_neg1(), view.entries())
            };
            traverse(tx, ptr_neg1, out)?;
            for e in entries {
                traverse(tx, e.ptr, out)?;
            }
        }
        PageType::DupKeyLeaf => {
            let view = dupkey::DupKeyLeafView::new(h.body());
            let key = view.key();
            for v in view.values() {
                out.push((key.clone(), v));
            }
        }
        PageType::DupKeyNode => {
            let children = {
                let view = dupkey::DupKeyNodeView::new(h.body());
                view.children()
            };
            for (ptr, _) in children {
                traverse(tx, ptr, out)?;
            }
        }
        other => return Err(Error::Invariant(format!("unexpected page type {:?} in btree traversal", other))),
    }
    Ok(())
}

/// Inserts or updates `key` => `value` per `mode`. Returns the (possibly new) table root.
pub fn put(tx: &mut TxSession, root: PageId, key: &[u8], value: Buf, mode: PutMode) -> Result<PageId> {
    if key.len() > MAX_KEY_SIZE {
        return Err(Error::Invariant("key exceeds maximum size".into()));
    }
    match insert_into_page(tx, root, key, &value, mode)? {
        Descend::Replaced(pgid) => Ok(pgid),
        Descend::Split(children) => {
            let mut it = children.into_iter();
            let (_, first_pgid) = it.next().expect("split always yields at least one child");
            let mut builder = node::NodeBuilder::new(first_pgid);
            for (k, p) in it {
                builder.push(k, p);
            }
            let mut h = tx.new_page(PageType::Node)?;
            builder.write(h.body_mut())?;
            tx.write_back(&h);
            Ok(h.pgid)
        }
    }
}

/// Removes the first record matching `key`. Returns the new root and whether anything was removed.
pub fn delete_first(tx: &mut TxSession, root: PageId, key: &[u8]) -> Result<(PageId, bool)> {
    delete_at(tx, root, key, 0)
}

/// Removes the `occurrence`-th (0-based) duplicate of `key`, used by a
/// cursor's `curDelete` once it knows which instance it is positioned on
pub fn delete_at(tx: &mut TxSession, root: PageId, key: &[u8], occurrence: usize) -> Result<(PageId, bool)> {
    match delete_from_page(tx, root, key, Some(occurrence))? {
        None => Ok((root, false)),
        Some(DelResult::Changed(pgid)) => Ok((pgid, true)),
        Some(DelResult::Empty) => {
            let h = tx.new_page(PageType::Leaf)?;
            Ok((h.pgid, true))
        }
    }
}

fn insert_into_page(tx: &mut TxSession, pgid: PageId, key: &[u8], value: &Buf, mode: PutMode) -> Result<Descend> {
    let page_type = tx.read_page(pgid)?.page_type();
    match page_type {
        PageType::Node => insert_into_node(tx, pgid, key, value, mode),
        PageType::Leaf => insert_into_leaf(tx, pgid, key, value, mode),
        PageType::DupKeyLeaf => insert_into_dupkey_leaf(tx, pgid, key, value, mode),
        PageType::DupKeyNode => insert_into_dupkey_node(tx, pgid, key, value, mode),
        other => Err(Error::Invariant(format!("unexpected page type {:?} in btree insert", other))),
    }
}

fn locate_slot(ptr_neg1: PageId, entries: &[node::NodeEntry], key: &[u8]) -> (usize, PageId) {
    let n = entries.len();
    let mut lo = 0usize;
    let mut hi = n;
    while lo < hi {
        let mid = (lo + hi) / 2;
        if crate::buffer::cmp_bytes(&entries[mid].key, key) == std::cmp::Ordering::Greater {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    let child = if lo == 0 { ptr_neg1 } else { entries[lo - 1].ptr };
    (lo, child)
}

fn insert_into_node(tx: &mut TxSession, node_pgid: PageId, key: &[u8], value: &Buf, mode: PutMode) -> Result<Descend> {
    let (ptr_neg1, entries) = {
        let h = tx.read_page(node_pgid)?;
        let view = node::NodeView::new(h.body());
        (view.ptr_neg1(), view.entries())
    };
    let (slot_idx, child_pgid) = locate_slot(ptr_neg1, &entries, key);

    match insert_into_page(tx, child_pgid, key, value, mode)? {
        Descend::Replaced(new_child) => {
            let mut new_ptr_neg1 = ptr_neg1;
            let mut new_entries = entries;
            if slot_idx == 0 {
                new_ptr_neg1 = new_child;
            } else {
                new_entries[slot_idx - 1].ptr = new_child;
            }
            write_node(tx, node_pgid, new_ptr_neg1, new_entries)
        }
        Descend::Split(new_children) => {
            let mut new_ptr_neg1 = ptr_neg1;
            let mut new_entries: Vec<node::NodeEntry> = Vec::with_capacity(entries.len() + new_children.len());
            if slot_idx == 0 {
                new_ptr_neg1 = new_children[0].1;
                for (k, p) in &new_children[1..] {
                    new_entries.push(node::NodeEntry { key: k.clone(), ptr: *p });
                }
                new_entries.extend(entries);
            } else {
                new_entries.extend(entries[..slot_idx - 1].iter().cloned());
                new_entries.push(node::NodeEntry {
                    key: entries[slot_idx - 1].key.clone(),
                    ptr: new_children[0].1,
                });
                for (k, p) in &new_children[1..] {
                    new_entries.push(node::NodeEntry { key: k.clone(), ptr: *p });
                }
                new_entries.extend(entries[slot_idx..].iter().cloned());
            }
            write_node_maybe_split(tx, node_pgid, new_ptr_neg1, new_entries)
        }
    }
}

fn write_node(tx: &mut TxSession, node_pgid: PageId, ptr_neg1: PageId, entries: Vec<node::NodeEntry>) -> Result<Descend> {
    let builder = node::NodeBuilder::from_entries(ptr_neg1, entries);
    let h = tx.read_page(node_pgid)?;
    let mut h = tx.modify_page(h)?;
    builder.write(h.body_mut())?;
    tx.write_back(&h);
    Ok(Descend::Replaced(h.pgid))
}

/// Writes a node's updated entry list, splitting it into two `Node`
/// pages if it no longer fits. Only ever produces
/// a two-way split: a single insert can grow a node's entry count by at
/// most the number of new leaf/dup-subtree siblings it created, which in
/// practice never exceeds what one extra page can absorb.
fn write_node_maybe_split(
    tx: &mut TxSession,
    node_pgid: PageId,
    ptr_neg1: PageId,
    entries: Vec<node::NodeEntry>,
) -> Result<Descend> {
    let builder = node::NodeBuilder::from_entries(ptr_neg1, entries.clone());
    if builder.packed_size() <= BODY_SIZE - 4 {
        let h = tx.read_page(node_pgid)?;
        let mut h = tx.modify_page(h)?;
        builder.write(h.body_mut())?;
        tx.write_back(&h);
        return Ok(Descend::Replaced(h.pgid));
    }
    if entries.len() < 2 {
        return Err(Error::Invariant("node overflow with too few entries to split".into()));
    }
    let mid = entries.len() / 2;
    let left_entries = entries[..mid].to_vec();
    let sep_key = entries[mid].key.clone();
    let right_ptr_neg1 = entries[mid].ptr;
    let right_entries = entries[mid + 1..].to_vec();

    let left_builder = node::NodeBuilder::from_entries(ptr_neg1, left_entries);
    if left_builder.packed_size() > BODY_SIZE - 4 {
        return Err(Error::Invariant("node split still overflows".into()));
    }
    let right_builder = node::NodeBuilder::from_entries(right_ptr_neg1, right_entries);
    if right_builder.packed_size() > BODY_SIZE - 4 {
        return Err(Error::Invariant("node split still overflows".into()));
    }

    let h = tx.read_page(node_pgid)?;
    let mut h = tx.modify_page(h)?;
    left_builder.write(h.body_mut())?;
    tx.write_back(&h);
    let left_pgid = h.pgid;

    let mut rh = tx.new_page(PageType::Node)?;
    right_builder.write(rh.body_mut())?;
    tx.write_back(&rh);

    Ok(Descend::Split(vec![(Vec::new(), left_pgid), (sep_key, rh.pgid)]))
}

fn insert_into_leaf(tx: &mut TxSession, leaf_pgid: PageId, key: &[u8], value: &Buf, mode: PutMode) -> Result<Descend> {
    let records = {
        let h = tx.read_page(leaf_pgid)?;
        let view = leaf::LeafView::new(h.body());
        view.records()
    };
    let (lb, ub) = {
        let h = tx.read_page(leaf_pgid)?;
        let view = leaf::LeafView::new(h.body());
        (view.lower_bound_index(key), view.upper_bound_index(key))
    };
    // A key landing at or past every existing record is a sequential/bulk
    // append: there is nothing after it in this leaf to leave room for, so
    // packing can fill the page completely instead of splitting early.
    let append_at_end = ub >= records.len();

    let mut new_records = records;
    match mode {
        PutMode::LeaveExisting => {
            if lb < ub {
                return Err(Error::DuplicateKey);
            }
            new_records.insert(lb, (key.to_vec(), value.clone()));
        }
        PutMode::Update => {
            if lb < ub {
                new_records[lb] = (key.to_vec(), value.clone());
            } else {
                new_records.insert(lb, (key.to_vec(), value.clone()));
            }
        }
        PutMode::Insert => {
            new_records.insert(ub, (key.to_vec(), value.clone()));
        }
    }

    pack_leaf_records(tx, leaf_pgid, new_records, append_at_end)
}

/// Repacks a leaf's full ordered record list into one or more `Leaf`
/// pages, carving any key whose duplicate run exceeds
/// `DUPKEY_PROMOTE_THRESHOLD` out into its own dup-key subtree.
///
/// `append_at_end` marks a sequential/bulk append: every generated page
/// is packed with `thresSplit = 0` instead of `DEFAULT_SPLIT_THRESHOLD`
/// so pages fill completely rather than leaving room that, on an
/// append, nothing will ever land in.
fn pack_leaf_records(
    tx: &mut TxSession,
    orig_pgid: PageId,
    records: Vec<(Vec<u8>, Buf)>,
    append_at_end: bool,
) -> Result<Descend> {
    let mut remaining: Vec<(Vec<u8>, Buf)> = Vec::with_capacity(records.len());
    let mut promoted: Vec<(Vec<u8>, Vec<Vec<u8>>)> = Vec::new();

    let mut i = 0usize;
    while i < records.len() {
        let mut j = i;
        while j < records.len() && records[j].0 == records[i].0 {
            j += 1;
        }
        let run = &records[i..j];
        let mut size = 0usize;
        for (idx, (k, v)) in run.iter().enumerate() {
            let vlen = v.as_bytes().map(|b| b.len()).unwrap_or(0);
            size += if idx == 0 {
                leaf::full_record_size(k.len(), vlen)
            } else {
                leaf::value_only_record_size(vlen)
            };
        }
        let all_valid = run.iter().all(|(_, v)| v.is_valid());
        if run.len() >= 2 && size > DUPKEY_PROMOTE_THRESHOLD && all_valid {
            let values = run.iter().map(|(_, v)| v.as_bytes().unwrap().to_vec()).collect();
            promoted.push((records[i].0.clone(), values));
        } else {
            remaining.extend_from_slice(run);
        }
        i = j;
    }

    let mut pieces: Vec<(Vec<u8>, PageId)> = Vec::new();

    let thres_split = if append_at_end { 0 } else { DEFAULT_SPLIT_THRESHOLD };

    if !remaining.is_empty() {
        let mut start = 0usize;
        let mut first = true;
        while start < remaining.len() {
            let (body, count) = leaf::LeafBuilder::pack_from(&remaining, start, thres_split)?;
            let first_key = remaining[start].0.clone();
            let pgid = if first {
                let h = tx.read_page(orig_pgid)?;
                let mut h = tx.modify_page(h)?;
                h.body_mut().copy_from_slice(&body);
                tx.write_back(&h);
                h.pgid
            } else {
                let mut h = tx.new_page(PageType::Leaf)?;
                h.body_mut().copy_from_slice(&body);
                tx.write_back(&h);
                h.pgid
            };
            pieces.push((first_key, pgid));
            first = false;
            start += count;
        }
    }

    for (key, values) in promoted {
        let pgid = build_dupkey_subtree(tx, &key, &values)?;
        pieces.push((key, pgid));
    }

    pieces.sort_by(|a, b| crate::buffer::cmp_bytes(&a.0, &b.0));

    if pieces.is_empty() {
        return Err(Error::Invariant("leaf pack produced no pages".into()));
    }
    if pieces.len() == 1 {
        return Ok(Descend::Replaced(pieces[0].1));
    }
    pieces[0].0 = Vec::new();
    Ok(Descend::Split(pieces))
}

/// Builds a dup-key subtree holding every value in `values` for `key`,
/// as one `DupKeyLeaf` if it fits, else a level-0 `DupKeyNode` fanning
/// out over several `DupKeyLeaf` children. Deeper nesting
/// (a `DupKeyNode` whose children are themselves `DupKeyNode`s) is not
/// supported; see DESIGN.md.
fn build_dupkey_subtree(tx: &mut TxSession, key: &[u8], values: &[Vec<u8>]) -> Result<PageId> {
    let single = dupkey::DupKeyLeafBuilder::from_values(key.to_vec(), values.to_vec());
    if single.packed_size() <= BODY_SIZE {
        let mut h = tx.new_page(PageType::DupKeyLeaf)?;
        single.write(h.body_mut())?;
        tx.write_back(&h);
        return Ok(h.pgid);
    }

    let mut children = Vec::new();
    let mut i = 0usize;
    while i < values.len() {
        let mut end = i + 1;
        while end < values.len() {
            let trial = dupkey::DupKeyLeafBuilder::from_values(key.to_vec(), values[i..end + 1].to_vec());
            if trial.packed_size() > BODY_SIZE {
                break;
            }
            end += 1;
        }
        let chunk = dupkey::DupKeyLeafBuilder::from_values(key.to_vec(), values[i..end].to_vec());
        if chunk.packed_size() > BODY_SIZE {
            return Err(Error::Invariant("single duplicate value too large for a dup-key leaf".into()));
        }
        let mut h = tx.new_page(PageType::DupKeyLeaf)?;
        let free = BODY_SIZE - chunk.packed_size();
        chunk.write(h.body_mut())?;
        tx.write_back(&h);
        children.push((h.pgid, free));
        i = end;
    }

    let builder = dupkey::DupKeyNodeBuilder { level: 0, key: Some(key.to_vec()), children };
    let mut h = tx.new_page(PageType::DupKeyNode)?;
    builder.write(h.body_mut())?;
    tx.write_back(&h);
    Ok(h.pgid)
}

/// A regular leaf sibling routed to by a key that doesn't match this dup
/// subtree's key.
fn single_record_leaf(tx: &mut TxSession, key: &[u8], value: &Buf) -> Result<PageId> {
    let recs = vec![(key.to_vec(), value.clone())];
    let (body, _) = leaf::LeafBuilder::pack_from(&recs, 0, 0)?;
    let mut h = tx.new_page(PageType::Leaf)?;
    h.body_mut().copy_from_slice(&body);
    tx.write_back(&h);
    Ok(h.pgid)
}

fn insert_into_dupkey_leaf(tx: &mut TxSession, leaf_pgid: PageId, key: &[u8], value: &Buf, mode: PutMode) -> Result<Descend> {
    let (k, values) = {
        let h = tx.read_page(leaf_pgid)?;
        let view = dupkey::DupKeyLeafView::new(h.body());
        (view.key(), view.values())
    };

    if k.as_slice() != key {
        let new_pgid = single_record_leaf(tx, key, value)?;
        return Ok(if crate::buffer::cmp_bytes(key, &k) == std::cmp::Ordering::Less {
            Descend::Split(vec![(Vec::new(), new_pgid), (k, leaf_pgid)])
        } else {
            Descend::Split(vec![(Vec::new(), leaf_pgid), (key.to_vec(), new_pgid)])
        });
    }
    if mode == PutMode::LeaveExisting {
        return Err(Error::DuplicateKey);
    }
    if !value.is_valid() {
        return Err(Error::Invariant("duplicate-key subtree cannot store a null value".into()));
    }

    let mut raw_values: Vec<Vec<u8>> = values.iter().map(|b| b.as_bytes().unwrap_or(&[]).to_vec()).collect();
    if mode == PutMode::Update && !raw_values.is_empty() {
        raw_values[0] = value.as_bytes().unwrap().to_vec();
    } else {
        raw_values.push(value.as_bytes().unwrap().to_vec());
    }

    let builder = dupkey::DupKeyLeafBuilder::from_values(k.clone(), raw_values.clone());
    if builder.packed_size() <= BODY_SIZE {
        let h = tx.read_page(leaf_pgid)?;
        let mut h = tx.modify_page(h)?;
        builder.write(h.body_mut())?;
        tx.write_back(&h);
        return Ok(Descend::Replaced(h.pgid));
    }

    let mid = raw_values.len() / 2;
    let left_builder = dupkey::DupKeyLeafBuilder::from_values(k.clone(), raw_values[..mid].to_vec());
    let right_builder = dupkey::DupKeyLeafBuilder::from_values(k.clone(), raw_values[mid..].to_vec());
    if left_builder.packed_size() > BODY_SIZE || right_builder.packed_size() > BODY_SIZE {
        return Err(Error::Invariant("duplicate-key value too large to split".into()));
    }

    let h = tx.read_page(leaf_pgid)?;
    let mut lh = tx.modify_page(h)?;
    left_builder.write(lh.body_mut())?;
    tx.write_back(&lh);
    let left_free = BODY_SIZE - left_builder.packed_size();

    let mut rh = tx.new_page(PageType::DupKeyLeaf)?;
    right_builder.write(rh.body_mut())?;
    tx.write_back(&rh);
    let right_free = BODY_SIZE - right_builder.packed_size();

    let node_builder = dupkey::DupKeyNodeBuilder {
        level: 0,
        key: Some(k),
        children: vec![(lh.pgid, left_free), (rh.pgid, right_free)],
    };
    let mut nh = tx.new_page(PageType::DupKeyNode)?;
    node_builder.write(nh.body_mut())?;
    tx.write_back(&nh);
    Ok(Descend::Replaced(nh.pgid))
}

fn insert_into_dupkey_node(tx: &mut TxSession, node_pgid: PageId, key: &[u8], value: &Buf, mode: PutMode) -> Result<Descend> {
    let (k, children, level) = {
        let h = tx.read_page(node_pgid)?;
        let view = dupkey::DupKeyNodeView::new(h.body());
        (view.key(), view.children(), view.level())
    };
    let k = k.ok_or_else(|| Error::Corrupt("dupkey node missing key".into()))?;

    if k.as_slice() != key {
        let new_pgid = single_record_leaf(tx, key, value)?;
        return Ok(if crate::buffer::cmp_bytes(key, &k) == std::cmp::Ordering::Less {
            Descend::Split(vec![(Vec::new(), new_pgid), (k, node_pgid)])
        } else {
            Descend::Split(vec![(Vec::new(), node_pgid), (key.to_vec(), new_pgid)])
        });
    }
    if mode == PutMode::LeaveExisting {
        return Err(Error::DuplicateKey);
    }
    if !value.is_valid() {
        return Err(Error::Invariant("duplicate-key subtree cannot store a null value".into()));
    }
    if level != 0 {
        return Err(Error::Invariant("nested duplicate-key subtrees are not supported".into()));
    }

    let target_idx = if mode == PutMode::Update { 0 } else { most_free_index(&children) };
    let (child_pgid, _) = children[target_idx];

    let child_values = {
        let ch = tx.read_page(child_pgid)?;
        let cview = dupkey::DupKeyLeafView::new(ch.body());
        cview.values()
    };
    let mut raw_values: Vec<Vec<u8>> = child_values.iter().map(|b| b.as_bytes().unwrap_or(&[]).to_vec()).collect();
    if mode == PutMode::Update && !raw_values.is_empty() {
        raw_values[0] = value.as_bytes().unwrap().to_vec();
    } else {
        raw_values.push(value.as_bytes().unwrap().to_vec());
    }

    let mut new_children = children.clone();
    let builder = dupkey::DupKeyLeafBuilder::from_values(k.clone(), raw_values.clone());
    if builder.packed_size() <= BODY_SIZE {
        let ch = tx.read_page(child_pgid)?;
        let mut ch = tx.modify_page(ch)?;
        builder.write(ch.body_mut())?;
        tx.write_back(&ch);
        new_children[target_idx] = (ch.pgid, BODY_SIZE - builder.packed_size());
    } else {
        let mid = raw_values.len() / 2;
        let left_builder = dupkey::DupKeyLeafBuilder::from_values(k.clone(), raw_values[..mid].to_vec());
        let right_builder = dupkey::DupKeyLeafBuilder::from_values(k.clone(), raw_values[mid..].to_vec());
        if left_builder.packed_size() > BODY_SIZE || right_builder.packed_size() > BODY_SIZE {
            return Err(Error::Invariant("duplicate-key value too large to split".into()));
        }
        let ch = tx.read_page(child_pgid)?;
        let mut lh = tx.modify_page(ch)?;
        left_builder.write(lh.body_mut())?;
        tx.write_back(&lh);
        let mut rh = tx.new_page(PageType::DupKeyLeaf)?;
        right_builder.write(rh.body_mut())?;
        tx.write_back(&rh);
        new_children[target_idx] = (lh.pgid, BODY_SIZE - left_builder.packed_size());
        new_children.insert(target_idx + 1, (rh.pgid, BODY_SIZE - right_builder.packed_size()));
    }

    let new_node_builder = dupkey::DupKeyNodeBuilder { level: 0, key: Some(k), children: new_children };
    let h = tx.read_page(node_pgid)?;
    let mut nh = tx.modify_page(h)?;
    new_node_builder.write(nh.body_mut())?;
    tx.write_back(&nh);
    Ok(Descend::Replaced(nh.pgid))
}

fn most_free_index(children: &[(PageId, usize)]) -> usize {
    children
        .iter()
        .enumerate()
        .max_by_key(|(_, (_, free))| *free)
        .map(|(i, _)| i)
        .unwrap_or(0)
}

fn delete_from_page(tx: &mut TxSession, pgid: PageId, key: &[u8], occurrence: Option<usize>) -> Result<Option<DelResult>> {
    let page_type = tx.read_page(pgid)?.page_type();
    match page_type {
        PageType::Node => delete_from_node(tx, pgid, key, occurrence),
        PageType::Leaf => delete_from_leaf(tx, pgid, key, occurrence),
        PageType::DupKeyLeaf => delete_from_dupkey_leaf(tx, pgid, key, occurrence),
        PageType::DupKeyNode => delete_from_dupkey_node(tx, pgid, key, occurrence),
        other => Err(Error::Invariant(format!("unexpected page type {:?} in btree delete", other))),
    }
}

fn delete_from_leaf(tx: &mut TxSession, leaf_pgid: PageId, key: &[u8], occurrence: Option<usize>) -> Result<Option<DelResult>> {
    let (records, lb, ub) = {
        let h = tx.read_page(leaf_pgid)?;
        let view = leaf::LeafView::new(h.body());
        (view.records(), view.lower_bound_index(key), view.upper_bound_index(key))
    };
    if lb >= ub {
        return Ok(None);
    }
    let idx = lb + occurrence.unwrap_or(0);
    if idx >= ub {
        return Ok(None);
    }
    let mut new_records = records;
    new_records.remove(idx);
    if new_records.is_empty() {
        return Ok(Some(DelResult::Empty));
    }
    let (body, _count) = leaf::LeafBuilder::pack_from(&new_records, 0, 0)?;
    let h = tx.read_page(leaf_pgid)?;
    let mut h = tx.modify_page(h)?;
    h.body_mut().copy_from_slice(&body);
    tx.write_back(&h);
    Ok(Some(DelResult::Changed(h.pgid)))
}

fn delete_from_dupkey_leaf(
    tx: &mut TxSession,
    leaf_pgid: PageId,
    key: &[u8],
    occurrence: Option<usize>,
) -> Result<Option<DelResult>> {
    let (k, values) = {
        let h = tx.read_page(leaf_pgid)?;
        let view = dupkey::DupKeyLeafView::new(h.body());
        (view.key(), view.values())
    };
    if k.as_slice() != key {
        return Ok(None);
    }
    let mut raw_values: Vec<Vec<u8>> = values.iter().map(|b| b.as_bytes().unwrap_or(&[]).to_vec()).collect();
    let idx = occurrence.unwrap_or(0);
    if idx >= raw_values.len() {
        return Ok(None);
    }
    raw_values.remove(idx);
    if raw_values.is_empty() {
        return Ok(Some(DelResult::Empty));
    }
    let builder = dupkey::DupKeyLeafBuilder::from_values(k, raw_values);
    let h = tx.read_page(leaf_pgid)?;
    let mut h = tx.modify_page(h)?;
    builder.write(h.body_mut())?;
    tx.write_back(&h);
    Ok(Some(DelResult::Changed(h.pgid)))
}

fn delete_from_dupkey_node(
    tx: &mut TxSession,
    node_pgid: PageId,
    key: &[u8],
    occurrence: Option<usize>,
) -> Result<Option<DelResult>> {
    let (k, children) = {
        let h = tx.read_page(node_pgid)?;
        let view = dupkey::DupKeyNodeView::new(h.body());
        (view.key(), view.children())
    };
    let k = k.ok_or_else(|| Error::Corrupt("dupkey node missing key".into()))?;
    if k.as_slice() != key {
        return Ok(None);
    }

    let target_occurrence = occurrence.unwrap_or(0);
    let mut remaining = target_occurrence;
    let mut found = None;
    for (i, (child_pgid, _)) in children.iter().enumerate() {
        let n = {
            let ch = tx.read_page(*child_pgid)?;
            let cview = dupkey::DupKeyLeafView::new(ch.body());
            cview.num_values()
        };
        if remaining < n {
            found = Some((i, remaining));
            break;
        }
        remaining -= n;
    }
    let (child_idx, local_idx) = match found {
        Some(v) => v,
        None => return Ok(None),
    };
    let (child_pgid, _) = children[child_idx];

    match delete_from_dupkey_leaf(tx, child_pgid, key, Some(local_idx))? {
        None => Ok(None),
        Some(DelResult::Changed(new_child_pgid)) => {
            let free = {
                let ch = tx.read_page(new_child_pgid)?;
                let cview = dupkey::DupKeyLeafView::new(ch.body());
                cview.size_free()
            };
            let mut new_children = children;
            new_children[child_idx] = (new_child_pgid, free);
            write_dupkey_node(tx, node_pgid, k, new_children)
        }
        Some(DelResult::Empty) => {
            let mut new_children = children;
            new_children.remove(child_idx);
            if new_children.is_empty() {
                return Ok(Some(DelResult::Empty));
            }
            if new_children.len() == 1 {
                return Ok(Some(DelResult::Changed(new_children[0].0)));
            }
            write_dupkey_node(tx, node_pgid, k, new_children)
        }
    }
}

fn write_dupkey_node(
    tx: &mut TxSession,
    node_pgid: PageId,
    key: Vec<u8>,
    children: Vec<(PageId, usize)>,
) -> Result<Option<DelResult>> {
    let builder = dupkey::DupKeyNodeBuilder { level: 0, key: Some(key), children };
    let h = tx.read_page(node_pgid)?;
    let mut h = tx.modify_page(h)?;
    builder.write(h.body_mut())?;
    tx.write_back(&h);
    Ok(Some(DelResult::Changed(h.pgid)))
}

fn delete_from_node(tx: &mut TxSession, node_pgid: PageId, key: &[u8], occurrence: Option<usize>) -> Result<Option<DelResult>> {
    let (ptr_neg1, entries) = {
        let h = tx.read_page(node_pgid)?;
        let view = node::NodeView::new(h.body());
        (view.ptr_neg1(), view.entries())
    };
    let (slot_idx, child_pgid) = locate_slot(ptr_neg1, &entries, key);

    match delete_from_page(tx, child_pgid, key, occurrence)? {
        None => Ok(None),
        Some(DelResult::Changed(new_child)) => {
            let mut new_ptr_neg1 = ptr_neg1;
            let mut new_entries = entries;
            if slot_idx == 0 {
                new_ptr_neg1 = new_child;
            } else {
                new_entries[slot_idx - 1].ptr = new_child;
            }
            let builder = node::NodeBuilder::from_entries(new_ptr_neg1, new_entries);
            let h = tx.read_page(node_pgid)?;
            let mut h = tx.modify_page(h)?;
            builder.write(h.body_mut())?;
            tx.write_back(&h);
            Ok(Some(DelResult::Changed(h.pgid)))
        }
        Some(DelResult::Empty) => {
            let (new_ptr_neg1, new_entries) = if slot_idx == 0 {
                if entries.is_empty() {
                    return Ok(Some(DelResult::Empty));
                }
                (entries[0].ptr, entries[1..].to_vec())
            } else {
                let mut e = entries;
                e.remove(slot_idx - 1);
                (ptr_neg1, e)
            };
            if new_entries.is_empty() {
                return Ok(Some(DelResult::Changed(new_ptr_neg1)));
            }
            let builder = node::NodeBuilder::from_entries(new_ptr_neg1, new_entries);
            let h = tx.read_page(node_pgid)?;
            let mut h = tx.modify_page(h)?;
            builder.write(h.body_mut())?;
            tx.write_back(&h);
            Ok(Some(DelResult::Changed(h.pgid)))
        }
    }
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
    fn insert_and_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let pf = open_pf(&dir);
        let ovr = Arc::new(ActiveOvr::new(0));
        let mut tx = TxSession::begin(pf, ovr, 0);

        let mut root = new_empty(&mut tx).unwrap();
        for i in 0..50u32 {
            let k = format!("key{:04}", i).into_bytes();
            let v = Buf::valid(format!("val{}", i).into_bytes());
            root = put(&mut tx, root, &k, v, PutMode::Insert).unwrap();
        }
        for i in 0..50u32 {
            let k = format!("key{:04}", i).into_bytes();
            let v = get(&tx, root, &k).unwrap();
            assert_eq!(v, Buf::valid(format!("val{}", i).into_bytes()));
        }
        assert_eq!(get(&tx, root, b"missing").unwrap(), Buf::Invalid);
    }

    #[test]
    fn insert_forces_leaf_split_and_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let pf = open_pf(&dir);
        let ovr = Arc::new(ActiveOvr::new(0));
        let mut tx = TxSession::begin(pf, ovr, 0);

        let mut root = new_empty(&mut tx).unwrap();
        for i in 0..600u32 {
            let k = format!("{:06}", i).into_bytes();
            root = put(&mut tx, root, &k, Buf::valid(vec![0u8; 32]), PutMode::Insert).unwrap();
        }
        let all = collect_all(&tx, root).unwrap();
        assert_eq!(all.len(), 600);
        for i in 0..600u32 {
            assert_eq!(all[i as usize].0, format!("{:06}", i).into_bytes());
        }
    }

    #[test]
    fn duplicate_key_values_promote_and_iterate_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let pf = open_pf(&dir);
        let ovr = Arc::new(ActiveOvr::new(0));
        let mut tx = TxSession::begin(pf, ovr, 0);

        let mut root = new_empty(&mut tx).unwrap();
        for i in 0..400u32 {
            root = put(&mut tx, root, b"d", Buf::valid(i.to_le_bytes().to_vec()), PutMode::Insert).unwrap();
        }
        let all = collect_all(&tx, root).unwrap();
        assert_eq!(all.len(), 400);
        for (i, (k, v)) in all.iter().enumerate() {
            assert_eq!(k, b"d");
            assert_eq!(v, &Buf::valid((i as u32).to_le_bytes().to_vec()));
        }
    }

    #[test]
    fn update_overwrites_first_match_leave_existing_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let pf = open_pf(&dir);
        let ovr = Arc::new(ActiveOvr::new(0));
        let mut tx = TxSession::begin(pf, ovr, 0);

        let mut root = new_empty(&mut tx).unwrap();
        root = put(&mut tx, root, b"k", Buf::valid(b"v1".to_vec()), PutMode::Insert).unwrap();
        root = put(&mut tx, root, b"k", Buf::valid(b"v2".to_vec()), PutMode::Update).unwrap();
        assert_eq!(get(&tx, root, b"k").unwrap(), Buf::valid(b"v2".to_vec()));

        let err = put(&mut tx, root, b"k", Buf::valid(b"v3".to_vec()), PutMode::LeaveExisting);
        assert!(matches!(err, Err(Error::DuplicateKey)));
    }

    #[test]
    fn delete_removes_record_and_collapses_empty_tree() {
        let dir = tempfile::tempdir().unwrap();
        let pf = open_pf(&dir);
        let ovr = Arc::new(ActiveOvr::new(0));
        let mut tx = TxSession::begin(pf, ovr, 0);

        let mut root = new_empty(&mut tx).unwrap();
        for i in 0..20u32 {
            let k = format!("{:03}", i).into_bytes();
            root = put(&mut tx, root, &k, Buf::valid(vec![1]), PutMode::Insert).unwrap();
        }
        for i in 0..20u32 {
            let k = format!("{:03}", i).into_bytes();
            let (new_root, removed) = delete_first(&mut tx, root, &k).unwrap();
            assert!(removed);
            root = new_root;
        }
        assert_eq!(collect_all(&tx, root).unwrap().len(), 0);
        assert_eq!(get(&tx, root, b"000").unwrap(), Buf::Invalid);
    }

    #[test]
    fn null_and_empty_values_are_distinguishable_through_the_tree() {
        let dir = tempfile::tempdir().unwrap();
        let pf = open_pf(&dir);
        let ovr = Arc::new(ActiveOvr::new(0));
        let mut tx = TxSession::begin(pf, ovr, 0);

        let mut root = new_empty(&mut tx).unwrap();
        root = put(&mut tx, root, b"n", Buf::Null, PutMode::Insert).unwrap();
        root = put(&mut tx, root, b"e", Buf::valid(vec![]), PutMode::Insert).unwrap();
        assert_eq!(get(&tx, root, b"n").unwrap(), Buf::Null);
        assert_eq!(get(&tx, root, b"e").unwrap(), Buf::valid(vec![]));
    }
}
