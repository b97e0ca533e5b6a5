//! Embedded database handle: the top-level `Db`, its transactions, and
//! cursors, layered over the B+-tree, override index, and table
//! directory.

use crate::btree::{self, cursor, PutMode, Query, QueryType};
use crate::buffer::Buf;
use crate::constants::DEFAULT_REBASE_THRESHOLD;
use crate::error::{Error, Result};
use crate::overview_table::{self, TableOffCache};
use crate::ovr::{ActiveOvr, CommitMode, LocalOvr};
use crate::page::PageId;
use crate::pagefile::{OpenOptionsPf, PageFile};
use crate::rebase;
use crate::tpio::TxSession;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

bitflags::bitflags! {
    /// Options controlling how `Db::open` behaves.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenOptions: u32 {
        /// Open for read/write; without it every mutating call fails.
        const WRITER = 1 << 0;
        /// Create the partition files if they don't exist yet.
        const CREATE = 1 << 1;
        /// Discard any existing database at this path before opening.
        const TRUNCATE = 1 << 2;
        /// Sync every commit to disk before returning. This crate always
        /// does so; the flag exists for API parity with an optional
        /// group-commit mode this crate doesn't implement (see DESIGN.md).
        const AUTOSYNC = 1 << 3;
        /// Use the partitioned multi-file page store. The only storage
        /// layout this crate implements; accepted for API parity.
        const PARTITIONED = 1 << 4;
        /// Run periodic rebase/compaction on a background helper thread.
        /// Not implemented; callers drive `Db::rebase`/
        /// `Db::compact` explicitly instead.
        const HELPER_THREAD = 1 << 5;
    }
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions::WRITER | OpenOptions::CREATE | OpenOptions::AUTOSYNC | OpenOptions::PARTITIONED
    }
}

/// The table every non-table-qualified `get`/`put`/`del` call addresses.
pub const DEFAULT_TABLE: &[u8] = b"default";

/// Rebuilds `ActiveOvr`'s in-memory committed chain from the persisted
/// page headers left by a previous session. The override index is never
/// itself written to disk; every override page carries `idOvrTgt`/`txid`,
/// which is exactly enough to replay it. A prior `rebase` folds the chain
/// up to its own commit and starts its replacement `ActiveOvr` at that
/// `verWrite`, so recovery must locate the most recent page flagged
/// `TX_REBASE` and only replay triples committed after it — replaying the
/// pre-rebase chain too would resurrect overrides the rebase already
/// folded away.
fn recover_ovr(pagefile: &PageFile) -> Result<ActiveOvr> {
    let (mut triples, ver_base) = pagefile.scan_overrides()?;
    triples.retain(|&(_, _, ver)| ver > ver_base);
    triples.sort_by_key(|&(_, _, ver)| ver);

    let active = ActiveOvr::new(ver_base);
    let mut i = 0;
    while i < triples.len() {
        let ver = triples[i].2;
        let mut j = i;
        let mut local = LocalOvr::new();
        while j < triples.len() && triples[j].2 == ver {
            local.add(triples[j].0, triples[j].1);
            j += 1;
        }
        active.try_commit(&mut local, ver_base, CommitMode::Replay { ver_write: ver })?;
        i = j;
    }
    Ok(active)
}

/// An open database: the partitioned page store, the current override
/// index generation, and the table directory cache.
pub struct Db {
    pagefile: Arc<PageFile>,
    ovr: RwLock<Arc<ActiveOvr>>,
    overview_pgid: PageId,
    table_cache: Mutex<TableOffCache>,
    unique_page_count: AtomicU64,
    writable: bool,
}

impl Db {
    /// Opens (and if requested, creates) the partitioned database rooted
    /// at `path_prefix`.
    pub fn open(path_prefix: &str, options: OpenOptions) -> Result<Db> {
        let pf_opts = OpenOptionsPf {
            writer: options.contains(OpenOptions::WRITER),
            create: options.contains(OpenOptions::CREATE),
            truncate: options.contains(OpenOptions::TRUNCATE),
        };
        let pagefile = Arc::new(PageFile::open(path_prefix, pf_opts)?);
        let overview_pgid = overview_table::bootstrap_pgid();
        let needs_bootstrap = !pagefile.has_any_page();
        let ovr = Arc::new(recover_ovr(&pagefile)?);

        if needs_bootstrap {
            if !options.contains(OpenOptions::WRITER) {
                return Err(Error::Config(
                    "database does not exist and WRITER was not requested".into(),
                ));
            }
            let mut tx = TxSession::begin(pagefile.clone(), ovr.clone(), 0);
            let created = overview_table::new_overview(&mut tx)?;
            if created != overview_pgid {
                return Err(Error::Corrupt(
                    "first page allocated was not the bootstrap pgid".into(),
                ));
            }
            let mut cache = TableOffCache::new();
            let root = btree::new_empty(&mut tx)?;
            overview_table::set_table_root(&mut tx, overview_pgid, &mut cache, DEFAULT_TABLE, root)?;
            tx.commit()?;
        }

        let unique_page_count = pagefile.latest_unique_page_count()?;

        Ok(Db {
            pagefile,
            ovr: RwLock::new(ovr),
            overview_pgid,
            table_cache: Mutex::new(TableOffCache::new()),
            unique_page_count: AtomicU64::new(unique_page_count),
            writable: options.contains(OpenOptions::WRITER),
        })
    }

    /// Unlinks every partition file for `path_prefix`.
    pub fn drop_database(path_prefix: &str) -> Result<()> {
        PageFile::drop_files(path_prefix)
    }

    fn current_ovr(&self) -> Arc<ActiveOvr> {
        self.ovr.read().clone()
    }

    fn require_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(Error::Invariant("database opened read-only".into()))
        }
    }

    /// Begins a new transaction.
    pub fn begin(&self) -> Transaction<'_> {
        let ovr = self.current_ovr();
        let prior = self.unique_page_count.load(Ordering::SeqCst);
        Transaction {
            db: self,
            tx: TxSession::begin(self.pagefile.clone(), ovr, prior),
        }
    }

    /// Non-transactional point read against the default table.
    pub fn get(&self, key: &[u8]) -> Result<Buf> {
        self.get_table(DEFAULT_TABLE, key)
    }

    pub fn get_table(&self, table: &[u8], key: &[u8]) -> Result<Buf> {
        let tx = self.begin();
        tx.get(table, key)
    }

    /// Non-transactional `put`: opens a tx, writes, commits, retrying
    /// transparently on `TxConflict`.
    pub fn put(&self, key: &[u8], value: Buf) -> Result<()> {
        self.put_table(DEFAULT_TABLE, key, value, PutMode::Update)
    }

    pub fn put_table(&self, table: &[u8], key: &[u8], value: Buf, mode: PutMode) -> Result<()> {
        self.require_writable()?;
        loop {
            let mut tx = self.begin();
            tx.put(table, key, value.clone(), mode)?;
            match tx.commit() {
                Ok(()) => return Ok(()),
                Err(Error::TxConflict) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn del(&self, key: &[u8]) -> Result<bool> {
        self.del_table(DEFAULT_TABLE, key)
    }

    pub fn del_table(&self, table: &[u8], key: &[u8]) -> Result<bool> {
        self.require_writable()?;
        loop {
            let mut tx = self.begin();
            let removed = tx.del(table, key)?;
            match tx.commit() {
                Ok(()) => return Ok(removed),
                Err(Error::TxConflict) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Creates a new, empty table.
    pub fn table_create(&self, id: &[u8]) -> Result<()> {
        self.require_writable()?;
        loop {
            let mut tx = self.begin();
            tx.table_create(id)?;
            match tx.commit() {
                Ok(()) => return Ok(()),
                Err(Error::TxConflict) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Drops a table.
    pub fn table_drop(&self, id: &[u8]) -> Result<()> {
        self.require_writable()?;
        loop {
            let mut tx = self.begin();
            tx.table_drop(id)?;
            match tx.commit() {
                Ok(()) => return Ok(()),
                Err(Error::TxConflict) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Every table id currently in the directory.
    pub fn table_names(&self) -> Result<Vec<Vec<u8>>> {
        let tx = self.begin();
        Ok(overview_table::all_tables(&tx.tx, self.overview_pgid)?
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }

    /// Forces a rollover to a fresh partition. When
    /// `do_rebase` is set, folds the override index first so the new
    /// partition starts from a clean base.
    pub fn new_part(&self, do_rebase: bool) -> Result<()> {
        self.require_writable()?;
        if do_rebase {
            self.rebase(true)?;
        }
        let active = self.pagefile.active_partid();
        self.pagefile.rollover(active)
    }

    /// Folds the override index into a fresh base. Without
    /// `force`, a no-op unless the current index holds at least
    /// `DEFAULT_REBASE_THRESHOLD` committed overrides.
    pub fn rebase(&self, force: bool) -> Result<()> {
        self.require_writable()?;
        let mut guard = self.ovr.write();
        if !force && guard.committed_entry_count() < DEFAULT_REBASE_THRESHOLD {
            return Ok(());
        }
        let prior = self.unique_page_count.load(Ordering::SeqCst);
        let (new_ovr, new_prior) = rebase::rebase(&self.pagefile, &guard, self.overview_pgid, prior)?;
        *guard = new_ovr;
        self.unique_page_count.store(new_prior, Ordering::SeqCst);
        self.table_cache.lock().clear();
        Ok(())
    }

    /// Relocates pages still backed by partitions `<= partid_threshold`
    /// into the active partition, then drops those partitions' files
    pub fn compact(&self, partid_threshold: u16) -> Result<()> {
        self.require_writable()?;
        let ovr = self.current_ovr();
        let prior = self.unique_page_count.load(Ordering::SeqCst);
        if let Some(new_count) = rebase::refresh(&self.pagefile, &ovr, self.overview_pgid, partid_threshold, prior)? {
            self.unique_page_count.store(new_count, Ordering::SeqCst);
        }
        self.pagefile.discard_partitions_up_to(partid_threshold)
    }
}

/// A single transaction's handle: reads/writes against a stable snapshot,
/// with table-directory helpers layered over the raw `TxSession`.
pub struct Transaction<'db> {
    db: &'db Db,
    tx: TxSession,
}

impl<'db> Transaction<'db> {
    fn table_root(&self, table: &[u8]) -> Result<PageId> {
        let mut cache = self.db.table_cache.lock();
        overview_table::get_table_root(&self.tx, self.db.overview_pgid, &mut cache, table)?
            .ok_or_else(|| Error::TableNotFound(String::from_utf8_lossy(table).into_owned()))
    }

    fn set_table_root(&mut self, table: &[u8], root: PageId) -> Result<()> {
        let mut cache = self.db.table_cache.lock();
        overview_table::set_table_root(&mut self.tx, self.db.overview_pgid, &mut cache, table, root)?;
        Ok(())
    }

    pub fn get(&self, table: &[u8], key: &[u8]) -> Result<Buf> {
        let root = self.table_root(table)?;
        btree::get(&self.tx, root, key)
    }

    /// Writes `key => value` into `table` per `mode`.
    pub fn put(&mut self, table: &[u8], key: &[u8], value: Buf, mode: PutMode) -> Result<()> {
        let root = self.table_root(table)?;
        let new_root = btree::put(&mut self.tx, root, key, value, mode)?;
        self.set_table_root(table, new_root)
    }

    /// Removes the first record matching `key`.
    pub fn del(&mut self, table: &[u8], key: &[u8]) -> Result<bool> {
        let root = self.table_root(table)?;
        let (new_root, removed) = btree::delete_first(&mut self.tx, root, key)?;
        if removed {
            self.set_table_root(table, new_root)?;
        }
        Ok(removed)
    }

    pub fn table_create(&mut self, id: &[u8]) -> Result<()> {
        let root = btree::new_empty(&mut self.tx)?;
        self.set_table_root(id, root)
    }

    pub fn table_drop(&mut self, id: &[u8]) -> Result<()> {
        let mut cache = self.db.table_cache.lock();
        overview_table::drop_table(&mut self.tx, self.db.overview_pgid, &mut cache, id)?;
        Ok(())
    }

    /// Opens a cursor over `table` positioned at `query`.
    pub fn cursor(&mut self, table: &[u8], query: Query) -> Result<Cursor<'_, 'db>> {
        let root = self.table_root(table)?;
        let all = btree::collect_all(&self.tx, root)?;
        let pos = cursor::position_for(&all, &query);
        Ok(Cursor { tx: self, table: table.to_vec(), pos, all })
    }

    /// Commits this transaction. `Err(Error::TxConflict)`
    /// means a concurrent writer touched an overlapping page first; the
    /// caller should retry against a fresh transaction.
    pub fn commit(self) -> Result<()> {
        if let Some(outcome) = self.tx.commit()? {
            self.db.unique_page_count.store(outcome.unique_page_count, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// A cursor over one table's in-order record sequence, positioned by
/// `Query`. Holds a snapshot of the full sequence
/// (see `crate::btree::cursor`'s doc comment); a write re-snapshots and
/// re-locates by key so later `next`/`prev` keep working off the
/// post-write state.
pub struct Cursor<'tx, 'db> {
    tx: &'tx mut Transaction<'db>,
    table: Vec<u8>,
    all: Vec<(Vec<u8>, Buf)>,
    pos: Option<usize>,
}

impl<'tx, 'db> Cursor<'tx, 'db> {
    /// The record the cursor is currently positioned on, if any.
    pub fn get(&self) -> Option<(&[u8], &Buf)> {
        self.pos.map(|i| (self.all[i].0.as_slice(), &self.all[i].1))
    }

    /// Advances to the next record. Returns `false`
    /// and leaves the cursor unpositioned once the end is passed.
    pub fn next(&mut self) -> bool {
        match self.pos {
            Some(i) if i + 1 < self.all.len() => {
                self.pos = Some(i + 1);
                true
            }
            _ => {
                self.pos = None;
                false
            }
        }
    }

    /// Steps to the preceding record.
    pub fn prev(&mut self) -> bool {
        match self.pos {
            Some(i) if i > 0 => {
                self.pos = Some(i - 1);
                true
            }
            _ => {
                self.pos = None;
                false
            }
        }
    }

    /// Writes through the cursor's current key, then
    /// re-snapshots and re-locates on that key.
    pub fn put(&mut self, value: Buf, mode: PutMode) -> Result<()> {
        let key = self
            .pos
            .map(|i| self.all[i].0.clone())
            .ok_or_else(|| Error::Invariant("cursor not positioned".into()))?;
        self.tx.put(&self.table, &key, value, mode)?;
        self.resnapshot(Query::exact(key))
    }

    /// Deletes the record the cursor is positioned on, identifying which duplicate occurrence it is by
    /// counting equal keys ahead of it in the snapshot, then re-snapshots
    /// positioned just past the deleted record.
    pub fn delete(&mut self) -> Result<()> {
        let i = self.pos.ok_or_else(|| Error::Invariant("cursor not positioned".into()))?;
        let key = self.all[i].0.clone();
        let occurrence = self.all[..i].iter().filter(|(k, _)| *k == key).count();

        let root = self.tx.table_root(&self.table)?;
        let (new_root, removed) = btree::delete_at(&mut self.tx.tx, root, &key, occurrence)?;
        if removed {
            self.tx.set_table_root(&self.table, new_root)?;
        }
        self.resnapshot(Query { key, qtype: QueryType::OrNext })
    }

    fn resnapshot(&mut self, query: Query) -> Result<()> {
        let root = self.tx.table_root(&self.table)?;
        self.all = btree::collect_all(&self.tx.tx, root)?;
        self.pos = cursor::position_for(&self.all, &query);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_db(dir: &tempfile::TempDir) -> Db {
        let prefix = dir.path().join("db").to_str().unwrap().to_string();
        Db::open(&prefix, OpenOptions::default()).unwrap()
    }

    #[test]
    fn put_get_del_round_trip_on_default_table() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        db.put(b"k1", Buf::valid(b"v1".to_vec())).unwrap();
        assert_eq!(db.get(b"k1").unwrap(), Buf::valid(b"v1".to_vec()));
        assert!(db.del(b"k1").unwrap());
        assert_eq!(db.get(b"k1").unwrap(), Buf::Invalid);
    }

    #[test]
    fn reopening_an_existing_database_keeps_its_data() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("db").to_str().unwrap().to_string();
        {
            let db = Db::open(&prefix, OpenOptions::default()).unwrap();
            db.put(b"persisted", Buf::valid(b"yes".to_vec())).unwrap();
        }
        let db = Db::open(&prefix, OpenOptions::WRITER).unwrap();
        assert_eq!(db.get(b"persisted").unwrap(), Buf::valid(b"yes".to_vec()));
    }

    #[test]
    fn opening_a_nonexistent_database_without_create_fails() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("nope").to_str().unwrap().to_string();
        let err = Db::open(&prefix, OpenOptions::WRITER);
        assert!(err.is_err());
    }

    #[test]
    fn table_create_drop_and_table_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        db.table_create(b"orders").unwrap();
        db.put_table(b"orders", b"o1", Buf::valid(b"x".to_vec()), PutMode::Insert).unwrap();
        assert_eq!(db.get_table(b"orders", b"o1").unwrap(), Buf::valid(b"x".to_vec()));
        assert!(db.table_names().unwrap().contains(&b"orders".to_vec()));

        db.table_drop(b"orders").unwrap();
        assert!(matches!(db.get_table(b"orders", b"o1"), Err(Error::TableNotFound(_))));
    }

    #[test]
    fn cursor_front_iterates_every_record_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        for i in 0..10u32 {
            db.put(format!("{:02}", i).as_bytes(), Buf::valid(vec![i as u8])).unwrap();
        }
        let mut tx = db.begin();
        let mut cur = tx.cursor(DEFAULT_TABLE, Query::front()).unwrap();
        assert_eq!(cur.get().unwrap().0, b"00");
        let mut count = 1;
        while cur.next() {
            count += 1;
        }
        assert_eq!(count, 10);
        assert!(cur.get().is_none());
    }

    #[test]
    fn cursor_delete_advances_to_the_next_record() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        for i in 0..5u32 {
            db.put(format!("{:02}", i).as_bytes(), Buf::valid(vec![i as u8])).unwrap();
        }
        let mut tx = db.begin();
        let mut cur = tx.cursor(DEFAULT_TABLE, Query::exact(b"02".to_vec())).unwrap();
        cur.delete().unwrap();
        assert_eq!(cur.get().unwrap().0, b"03");
        tx.commit().unwrap();
        assert_eq!(db.get(b"02").unwrap(), Buf::Invalid);
    }

    #[test]
    fn concurrent_writers_to_the_same_key_conflict_and_retry() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        db.put(b"counter", Buf::valid(0u32.to_le_bytes().to_vec())).unwrap();

        let mut tx_a = db.begin();
        tx_a.put(DEFAULT_TABLE, b"counter", Buf::valid(1u32.to_le_bytes().to_vec()), PutMode::Update)
            .unwrap();

        db.put(b"counter", Buf::valid(2u32.to_le_bytes().to_vec())).unwrap();

        let result = tx_a.commit();
        assert!(matches!(result, Err(Error::TxConflict)));
        assert_eq!(db.get(b"counter").unwrap(), Buf::valid(2u32.to_le_bytes().to_vec()));
    }

    #[test]
    fn rebase_preserves_data_and_read_only_db_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = dir.path().join("db").to_str().unwrap().to_string();
        let db = Db::open(&prefix, OpenOptions::default()).unwrap();
        for i in 0..100u32 {
            db.put(format!("{:04}", i).as_bytes(), Buf::valid(vec![1])).unwrap();
        }
        db.rebase(true).unwrap();
        for i in 0..100u32 {
            assert_eq!(db.get(format!("{:04}", i).as_bytes()).unwrap(), Buf::valid(vec![1]));
        }

        let ro = Db::open(&prefix, OpenOptions::empty()).unwrap();
        assert!(matches!(ro.put(b"x", Buf::valid(vec![1])), Err(Error::Invariant(_))));
    }
}
