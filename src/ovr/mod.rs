//! STM-style override index: per-tx local remapping plus a
//! process-wide committed chain used for snapshot reads and commit-time
//! conflict detection.
//!
//! The committed chain's tip version is advanced by a CAS loop; the
//! structural mutation at merge time (bucket splice + chain push) is done
//! under short-held `parking_lot` locks rather than raw atomic-pointer
//! splicing, so the retry behavior on commit races stays the same while
//! bucket reads take a read lock instead of walking a lock-free list.

mod bloom;

pub use bloom::PgidBloomFilter;

use crate::constants::{PGID_INVALID, TPIO_NHASH};
use crate::error::{Error, Result};
use crate::page::PageId;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

fn bucket_index(pgid: PageId) -> usize {
    (pgid % TPIO_NHASH as u64) as usize
}

/// Where a `searchOvr` hit was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OvrStatus {
    /// Resolved from the tx's own uncommitted local overrides.
    Local,
    /// Resolved from the committed, process-wide chain.
    Global,
    /// No override exists; the caller should read the original pgid.
    None,
}

/// One `(orig -> ovr)` remapping recorded by a tx before commit.
#[derive(Debug, Clone, Copy)]
pub struct OvrEntry {
    pub pgid_orig: PageId,
    pub pgid_ovr: PageId,
}

/// Per-transaction override map: a fixed `TPIO_NHASH`-bucket hash array plus
/// a Bloom-filter summary of touched originals for cheap self-lookup and,
/// at commit, for the conflict-scan fast path.
pub struct LocalOvr {
    buckets: Vec<Vec<OvrEntry>>,
    bloom: PgidBloomFilter,
}

impl LocalOvr {
    pub fn new() -> LocalOvr {
        LocalOvr {
            buckets: (0..TPIO_NHASH).map(|_| Vec::new()).collect(),
            bloom: PgidBloomFilter::new(),
        }
    }

    /// Records `pgid_orig -> pgid_ovr`, or `(orig,
    /// INVALID)` to mean "discarded".
    pub fn add(&mut self, pgid_orig: PageId, pgid_ovr: PageId) {
        let idx = bucket_index(pgid_orig);
        self.buckets[idx].push(OvrEntry { pgid_orig, pgid_ovr });
        self.bloom.insert(pgid_orig);
    }

    /// Newest-first local lookup.
    pub fn search(&self, pgid: PageId) -> Option<PageId> {
        if !self.bloom.may_contain(pgid) {
            return None;
        }
        let idx = bucket_index(pgid);
        self.buckets[idx]
            .iter()
            .rev()
            .find(|e| e.pgid_orig == pgid)
            .map(|e| e.pgid_ovr)
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.is_empty())
    }

    /// Number of distinct original pgids overridden; used for the rebase
    /// trigger threshold when summed across live txs.
    pub fn len(&self) -> usize {
        self.touched_origs().len()
    }

    pub fn touched_origs(&self) -> Vec<PageId> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for bucket in &self.buckets {
            for e in bucket.iter().rev() {
                if seen.insert(e.pgid_orig) {
                    out.push(e.pgid_orig);
                }
            }
        }
        out
    }

    fn dirty_bucket_indices(&self) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    /// REFRESH-mode conflict handling: drops every entry whose original is
    /// in `exclude`, keeping the rest to be merged normally.
    pub fn filter_out(&mut self, exclude: &HashSet<PageId>) {
        for bucket in &mut self.buckets {
            bucket.retain(|e| !exclude.contains(&e.pgid_orig));
        }
        let mut fresh = PgidBloomFilter::new();
        for bucket in &self.buckets {
            for e in bucket {
                fresh.insert(e.pgid_orig);
            }
        }
        self.bloom = fresh;
    }
}

impl Default for LocalOvr {
    fn default() -> Self {
        Self::new()
    }
}

struct GlobalEntry {
    pgid_orig: PageId,
    pgid_ovr: PageId,
    version: u64,
}

/// One link in the committed-tx chain kept purely for commit-time conflict
/// scanning.
struct CommittedTx {
    ver_write: u64,
    prev: Option<Arc<CommittedTx>>,
    bloom: PgidBloomFilter,
    origs: Vec<PageId>,
}

/// How `ActiveOvr::try_commit` should treat a conflicting original pgid
/// found during the backward chain scan.
#[derive(Debug, Clone, Copy)]
pub enum CommitMode {
    /// Abort the whole tx on any conflict.
    Normal,
    /// Drop the conflicting entries and merge the rest.
    Refresh,
    /// Skip the conflict scan entirely and merge at a caller-supplied
    /// version.
    Replay { ver_write: u64 },
}

/// Process-wide committed override index: the hash-bucket array readers
/// consult, plus the conflict-scan chain and commit CAS loop.
pub struct ActiveOvr {
    ver_base: u64,
    tip_ver: AtomicU64,
    chain: Mutex<Option<Arc<CommittedTx>>>,
    buckets: Vec<RwLock<Vec<GlobalEntry>>>,
    terminated: AtomicBool,
}

impl ActiveOvr {
    /// A fresh override index rooted at `ver_base` (no committed overrides
    /// yet); used both at `Db::open` and after a rebase installs a new
    /// base image.
    pub fn new(ver_base: u64) -> ActiveOvr {
        ActiveOvr {
            ver_base,
            tip_ver: AtomicU64::new(ver_base),
            chain: Mutex::new(None),
            buckets: (0..TPIO_NHASH).map(|_| RwLock::new(Vec::new())).collect(),
            terminated: AtomicBool::new(false),
        }
    }

    pub fn ver_base(&self) -> u64 {
        self.ver_base
    }

    /// The highest version a newly opened transaction should read at
    /// (`verRead`): the most recently merged `verWrite`, or `ver_base` if
    /// nothing has committed yet against this index.
    pub fn current_version(&self) -> u64 {
        self.tip_ver.load(Ordering::SeqCst)
    }

    /// Total committed override entries currently held across all
    /// buckets, used by `Db::rebase`'s threshold gate.
    pub fn committed_entry_count(&self) -> usize {
        self.buckets.iter().map(|b| b.read().len()).sum()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Freezes the chain so no further commit succeeds.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    /// Resolves `pgid` against `local` first, then the committed chain,
    /// honoring `ver_read`.
    pub fn search(&self, pgid: PageId, ver_read: u64, local: &LocalOvr) -> (PageId, OvrStatus) {
        if let Some(ovr) = local.search(pgid) {
            return (ovr, OvrStatus::Local);
        }
        let idx = bucket_index(pgid);
        let bucket = self.buckets[idx].read();
        for e in bucket.iter().rev() {
            if e.version > ver_read {
                continue;
            }
            if e.pgid_orig == pgid {
                return (e.pgid_ovr, OvrStatus::Global);
            }
        }
        (pgid, OvrStatus::None)
    }

    /// Attempts to merge `tx`'s local overrides onto the committed chain,
    /// returning the assigned `verWrite`. On `Err(Error::TxConflict)` the caller must retry or
    /// abandon the tx; `tx` is left unmodified in that case.
    pub fn try_commit(&self, tx: &mut LocalOvr, ver_read: u64, mode: CommitMode) -> Result<u64> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(Error::TxConflict);
        }
        if tx.is_empty() {
            return Ok(ver_read);
        }
        let backoff = crossbeam_utils::Backoff::new();
        loop {
            if self.terminated.load(Ordering::SeqCst) {
                return Err(Error::TxConflict);
            }
            let prev_tip = self.tip_ver.load(Ordering::SeqCst);

            if let CommitMode::Replay { ver_write } = mode {
                self.merge(tx, ver_write);
                self.tip_ver.fetch_max(ver_write, Ordering::SeqCst);
                return Ok(ver_write);
            }

            let conflicts = self.scan_conflicts(tx, ver_read);
            if !conflicts.is_empty() {
                match mode {
                    CommitMode::Refresh => {
                        tx.filter_out(&conflicts);
                        if tx.is_empty() {
                            return Ok(ver_read);
                        }
                    }
                    CommitMode::Normal => {
                        log::debug!(
                            "commit conflict: {} orig pgid(s) touched by a newer committer",
                            conflicts.len()
                        );
                        return Err(Error::TxConflict);
                    }
                    CommitMode::Replay { .. } => unreachable!(),
                }
            }

            let ver_write = prev_tip.max(self.ver_base) + 1;
            if self
                .tip_ver
                .compare_exchange(prev_tip, ver_write, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                backoff.spin();
                continue;
            }
            self.merge(tx, ver_write);
            return Ok(ver_write);
        }
    }

    /// Walks the committed chain backward while `ver_write > ver_read`,
    /// returning the set of `tx`'s touched origs that some newer committer
    /// also touched.
    fn scan_conflicts(&self, tx: &LocalOvr, ver_read: u64) -> HashSet<PageId> {
        let origs = tx.touched_origs();
        let mut conflicts = HashSet::new();
        let mut cur = self.chain.lock().clone();
        while let Some(node) = cur {
            if node.ver_write <= ver_read {
                break;
            }
            for &orig in &origs {
                if node.bloom.may_contain(orig) && node.origs.contains(&orig) {
                    conflicts.insert(orig);
                }
            }
            cur = node.prev.clone();
        }
        conflicts
    }

    /// Publishes `tx`'s (possibly filtered) overrides at `ver_write`: push
    /// a conflict-chain link, then splice each dirty bucket.
    fn merge(&self, tx: &LocalOvr, ver_write: u64) {
        let origs = tx.touched_origs();
        if origs.is_empty() {
            return;
        }
        let mut bloom = PgidBloomFilter::new();
        for &o in &origs {
            bloom.insert(o);
        }
        {
            let mut chain = self.chain.lock();
            let node = Arc::new(CommittedTx {
                ver_write,
                prev: chain.clone(),
                bloom,
                origs,
            });
            *chain = Some(node);
        }
        for idx in tx.dirty_bucket_indices() {
            let mut bucket = self.buckets[idx].write();
            for e in &tx.buckets[idx] {
                bucket.push(GlobalEntry {
                    pgid_orig: e.pgid_orig,
                    pgid_ovr: e.pgid_ovr,
                    version: ver_write,
                });
            }
        }
    }
}

/// Sentinel used in place of a real page id to mean "this original was
/// discarded", distinguishing a tombstone from "not overridden at all".
pub fn is_discarded(pgid_ovr: PageId) -> bool {
    pgid_ovr == PGID_INVALID
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_override_round_trips() {
        let mut local = LocalOvr::new();
        local.add(10, 100);
        local.add(20, 200);
        assert_eq!(local.search(10), Some(100));
        assert_eq!(local.search(20), Some(200));
        assert_eq!(local.search(30), None);
    }

    #[test]
    fn commit_publishes_to_global_bucket() {
        let active = ActiveOvr::new(0);
        let ver_read = active.current_version();
        let mut tx = LocalOvr::new();
        tx.add(5, 500);
        let ver_write = active.try_commit(&mut tx, ver_read, CommitMode::Normal).unwrap();
        assert_eq!(ver_write, 1);

        let other_local = LocalOvr::new();
        let (resolved, status) = active.search(5, ver_write, &other_local);
        assert_eq!(resolved, 500);
        assert_eq!(status, OvrStatus::Global);
    }

    #[test]
    fn concurrent_writers_to_same_orig_conflict() {
        let active = ActiveOvr::new(0);
        let ver_read = active.current_version();

        let mut tx_a = LocalOvr::new();
        tx_a.add(7, 701);
        let mut tx_b = LocalOvr::new();
        tx_b.add(7, 702);

        assert!(active.try_commit(&mut tx_a, ver_read, CommitMode::Normal).is_ok());
        let err = active.try_commit(&mut tx_b, ver_read, CommitMode::Normal);
        assert!(matches!(err, Err(Error::TxConflict)));
    }

    #[test]
    fn refresh_mode_filters_conflicts_instead_of_aborting() {
        let active = ActiveOvr::new(0);
        let ver_read = active.current_version();

        let mut tx_a = LocalOvr::new();
        tx_a.add(9, 901);
        active.try_commit(&mut tx_a, ver_read, CommitMode::Normal).unwrap();

        let mut tx_refresh = LocalOvr::new();
        tx_refresh.add(9, 902); // conflicts, will be filtered
        tx_refresh.add(11, 1101); // no conflict, survives
        let result = active.try_commit(&mut tx_refresh, ver_read, CommitMode::Refresh);
        assert!(result.is_ok());

        let local = LocalOvr::new();
        let (resolved, status) = active.search(11, result.unwrap().max(2), &local);
        assert_eq!(resolved, 1101);
        assert_eq!(status, OvrStatus::Global);
    }

    #[test]
    fn terminate_blocks_further_commits() {
        let active = ActiveOvr::new(0);
        active.terminate();
        let mut tx = LocalOvr::new();
        tx.add(1, 2);
        assert!(matches!(
            active.try_commit(&mut tx, 0, CommitMode::Normal),
            Err(Error::TxConflict)
        ));
    }

    #[test]
    fn replay_mode_skips_conflict_check() {
        let active = ActiveOvr::new(0);
        let mut tx_a = LocalOvr::new();
        tx_a.add(3, 300);
        active.try_commit(&mut tx_a, 0, CommitMode::Normal).unwrap();

        let mut tx_b = LocalOvr::new();
        tx_b.add(3, 301);
        let replayed = active
            .try_commit(&mut tx_b, 0, CommitMode::Replay { ver_write: 50 })
            .unwrap();
        assert_eq!(replayed, 50);
        let local = LocalOvr::new();
        assert_eq!(active.search(3, 50, &local).0, 301);
    }
}
