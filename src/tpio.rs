//! Transactional page I/O session: the handle a caller
//! uses for one transaction, sitting atop the override index and the
//! partitioned page file.

use crate::constants::{PGID_INVALID, STREAK_SIZE, TXID_INVALID};
use crate::encode::{decode_u64, encode_u64};
use crate::error::{Error, Result};
use crate::ovr::{ActiveOvr, CommitMode, LocalOvr, OvrStatus};
use crate::page::{self, Flags, Header, PageId, PageType};
use crate::pagefile::PageFile;
use std::collections::HashSet;
use std::sync::Arc;

/// A page handle returned by `read_page`/`new_page`/`modify_page`, carrying
/// mutability/base-ness as explicit fields rather than tagged pointer bits.
pub struct PageHandle {
    /// The logical pgid callers address this page by (stable across
    /// overrides until rebase folds it).
    pub pgid: PageId,
    pub data: Box<[u8]>,
    pub is_mutable: bool,
    pub is_base: bool,
}

impl PageHandle {
    pub fn body(&self) -> &[u8] {
        page::body(&self.data)
    }

    pub fn body_mut(&mut self) -> &mut [u8] {
        page::body_mut(&mut self.data)
    }

    pub fn page_type(&self) -> PageType {
        page::read_header(&self.data).page_type
    }
}

/// Per-commit streak payload: a running unique-page counter
/// and the set of pages this tx learned need old-link fixups at the next
/// rebase.
#[derive(Debug, Clone, Default)]
pub struct StreakPayload {
    pub unique_page_count: u64,
    pub old_link_pages: Vec<PageId>,
}

impl StreakPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 8 + self.old_link_pages.len() * 8);
        out.extend_from_slice(&self.unique_page_count.to_le_bytes());
        out.extend_from_slice(&(self.old_link_pages.len() as u64).to_le_bytes());
        for pgid in &self.old_link_pages {
            out.extend_from_slice(&pgid.to_le_bytes());
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<StreakPayload> {
        if buf.len() < 16 {
            return Err(Error::Corrupt("streak payload truncated".into()));
        }
        let unique_page_count = decode_u64(buf, 0);
        let count = decode_u64(buf, 8) as usize;
        if buf.len() < 16 + count * 8 {
            return Err(Error::Corrupt("streak payload old-link list truncated".into()));
        }
        let mut old_link_pages = Vec::with_capacity(count);
        for i in 0..count {
            old_link_pages.push(decode_u64(buf, 16 + i * 8));
        }
        Ok(StreakPayload { unique_page_count, old_link_pages })
    }
}

/// Result of a non-trivial `TxSession::commit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitOutcome {
    pub ver_write: u64,
    /// Total physically-new pages ever allocated as of this commit; the
    /// baseline the next transaction's streak payload continues from.
    pub unique_page_count: u64,
}

/// One transaction's session: read/modify/discard pages, track what must
/// be written at commit, and drive the override-index commit protocol.
pub struct TxSession {
    pagefile: Arc<PageFile>,
    ovr: Arc<ActiveOvr>,
    local: LocalOvr,
    ver_read: u64,
    ver_write: Option<u64>,
    /// Actual physical pgids written this tx, in first-touched order; sorted
    /// and deduplicated at commit.
    modified: Vec<PageId>,
    modified_set: HashSet<PageId>,
    /// Cache of modified pages' bytes, keyed by their physical pgid,
    /// mutated in place until commit stamps headers and syncs.
    pages: std::collections::HashMap<PageId, Box<[u8]>>,
    old_link_pages: HashSet<PageId>,
    prior_unique_page_count: u64,
    new_page_count: u64,
    commit_mode: CommitMode,
    is_rebase: bool,
}

impl TxSession {
    pub fn begin(
        pagefile: Arc<PageFile>,
        ovr: Arc<ActiveOvr>,
        prior_unique_page_count: u64,
    ) -> TxSession {
        let ver_read = ovr.current_version();
        TxSession {
            pagefile,
            ovr,
            local: LocalOvr::new(),
            ver_read,
            ver_write: None,
            modified: Vec::new(),
            modified_set: HashSet::new(),
            pages: std::collections::HashMap::new(),
            old_link_pages: HashSet::new(),
            prior_unique_page_count,
            new_page_count: 0,
            commit_mode: CommitMode::Normal,
            is_rebase: false,
        }
    }

    /// Begins a rebase tx: refresh-style conflict handling is irrelevant
    /// (the chain is terminated before this is called), but marking it
    /// lets `update_link` behave as the link-rewrite callback instead of
    /// erroring.
    pub fn begin_rebase(pagefile: Arc<PageFile>, ovr: Arc<ActiveOvr>, prior_unique_page_count: u64) -> TxSession {
        let mut tx = TxSession::begin(pagefile, ovr, prior_unique_page_count);
        tx.is_rebase = true;
        tx
    }

    pub fn set_commit_mode(&mut self, mode: CommitMode) {
        self.commit_mode = mode;
    }

    pub fn ver_read(&self) -> u64 {
        self.ver_read
    }

    fn resolve(&self, pgid: PageId) -> (PageId, OvrStatus) {
        self.ovr.search(pgid, self.ver_read, &self.local)
    }

    fn load_bytes(&self, physical: PageId) -> Result<Box<[u8]>> {
        if let Some(buf) = self.pages.get(&physical) {
            return Ok(buf.clone());
        }
        self.pagefile.read_page(physical)
    }

    /// Allocates a brand-new page, owned exclusively by this tx until
    /// commit.
    pub fn new_page(&mut self, page_type: PageType) -> Result<PageHandle> {
        let (pgid, mut buf) = self.pagefile.new_page()?;
        page::init_header(&mut buf, pgid, page_type);
        self.new_page_count += 1;
        self.mark_modified(pgid, buf.clone());
        Ok(PageHandle {
            pgid,
            data: buf,
            is_mutable: true,
            is_base: false,
        })
    }

    /// Resolves `pgid` through the override index and reads its current
    /// content.
    pub fn read_page(&self, pgid: PageId) -> Result<PageHandle> {
        let (physical, status) = self.resolve(pgid);
        if physical == PGID_INVALID {
            return Err(Error::Corrupt(format!("page {} was discarded", pgid)));
        }
        let data = self.load_bytes(physical)?;
        Ok(PageHandle {
            pgid,
            data,
            is_mutable: status == OvrStatus::Local && self.modified_set.contains(&physical),
            is_base: status == OvrStatus::None,
        })
    }

    /// Returns a mutable page for `handle`'s logical pgid: the same page
    /// if it is already this tx's own mutable copy, otherwise a fresh
    /// clone recorded as an override.
    pub fn modify_page(&mut self, handle: PageHandle) -> Result<PageHandle> {
        if handle.is_mutable {
            return Ok(handle);
        }
        let orig = handle.pgid;
        let (pgid, mut buf) = self.pagefile.new_page()?;
        buf.copy_from_slice(&handle.data);
        let mut hdr = page::read_header(&buf);
        hdr.id = pgid;
        hdr.id_ovr_tgt = orig;
        hdr.txid = TXID_INVALID;
        hdr.flags = Flags::empty();
        page::write_header(&mut buf, &hdr);
        self.new_page_count += 1;
        self.local.add(orig, pgid);
        self.mark_modified(pgid, buf.clone());
        Ok(PageHandle {
            pgid: orig,
            data: buf,
            is_mutable: true,
            is_base: false,
        })
    }

    /// Commits a write back into an already-mutable handle (e.g. after
    /// `body_mut()` edits) so it is picked up at commit.
    pub fn write_back(&mut self, handle: &PageHandle) {
        debug_assert!(handle.is_mutable);
        let physical = self.physical_of(handle.pgid);
        self.pages.insert(physical, handle.data.clone());
    }

    /// The physical pgid `logical` currently resolves to, used by
    /// `crate::rebase`'s refresh walk to decide whether a page still lives
    /// in a partition old enough to be worth relocating.
    pub fn physical_pgid(&self, logical: PageId) -> PageId {
        self.resolve(logical).0
    }

    fn physical_of(&self, logical: PageId) -> PageId {
        self.resolve(logical).0
    }

    fn mark_modified(&mut self, physical: PageId, data: Box<[u8]>) {
        if self.modified_set.insert(physical) {
            self.modified.push(physical);
        }
        self.pages.insert(physical, data);
    }

    /// Records `pgid` as discarded: future reads resolve to `PGID_INVALID`
    pub fn discard_page(&mut self, pgid: PageId) {
        self.local.add(pgid, PGID_INVALID);
    }

    /// Marks that `pgid`'s body still references now-stale overridden
    /// children and must be visited by the next rebase.
    pub fn notify_page_w_old_link(&mut self, pgid: PageId) {
        self.old_link_pages.insert(pgid);
    }

    /// Rebase-only: resolves `old` to its final override target. Errors for
    /// a non-rebase tx.
    pub fn update_link(&self, old: PageId) -> Result<PageId> {
        if !self.is_rebase {
            return Err(Error::Invariant("updateLink called on a non-rebase tx".into()));
        }
        Ok(self.resolve(old).0)
    }

    pub fn is_rebase(&self) -> bool {
        self.is_rebase
    }

    /// Number of pages modified so far this tx.
    pub fn modified_count(&self) -> usize {
        self.modified.len()
    }

    pub fn local_overrides_len(&self) -> usize {
        self.local.len()
    }

    /// Commits this session.
    /// Returns the assigned `verWrite` and the running unique-page count,
    /// or `Ok(None)` if nothing was modified (trivial commit).
    pub fn commit(mut self) -> Result<Option<CommitOutcome>> {
        if self.modified.is_empty() {
            return Ok(None);
        }
        let ver_write = self
            .ovr
            .try_commit(&mut self.local, self.ver_read, self.commit_mode)?;
        self.ver_write = Some(ver_write);

        self.modified.sort_unstable();
        self.modified.dedup();
        let first_modified = self.modified[0];

        // The running count isn't final until `write_streak` has allocated
        // any overflow pages it needs, so stripe a placeholder first and
        // patch it in below once `new_page_count` stops moving.
        let payload = StreakPayload {
            unique_page_count: 0,
            old_link_pages: self.old_link_pages.iter().copied().collect(),
        };
        self.write_streak(&payload)?;

        let unique_page_count = self.prior_unique_page_count + self.new_page_count;
        {
            let buf = self.pages.get_mut(&first_modified).expect("modified page must be cached");
            encode_u64(page::streak_mut(buf), 0, unique_page_count);
        }

        let last_idx = self.modified.len() - 1;
        for (i, &pgid) in self.modified.clone().iter().enumerate() {
            let mut buf = self.pages.remove(&pgid).expect("modified page must be cached");
            let mut hdr = page::read_header(&buf);
            hdr.txid = ver_write;
            hdr.flags |= Flags::VALID;
            if i == last_idx {
                hdr.flags |= Flags::END_TX;
                if self.is_rebase {
                    hdr.flags |= Flags::TX_REBASE;
                }
            }
            page::write_header(&mut buf, &hdr);
            page::write_checksum(&mut buf);
            self.pagefile.write_page(pgid, &buf)?;
        }
        self.pagefile.sync_pages(&self.modified)?;
        Ok(Some(CommitOutcome { ver_write, unique_page_count }))
    }

    /// Stripes `payload` across the tail-streak region of each modified
    /// page, in ascending pgid order, allocating `OverflowStreak` pages as
    /// needed.
    fn write_streak(&mut self, payload: &StreakPayload) -> Result<()> {
        let encoded = payload.encode();
        let mut cursor = 0usize;
        let targets = self.modified.clone();
        for &pgid in &targets {
            if cursor >= encoded.len() {
                break;
            }
            let take = (encoded.len() - cursor).min(STREAK_SIZE);
            let mut buf = self.pages.remove(&pgid).expect("modified page must be cached");
            page::streak_mut(&mut buf)[..take].copy_from_slice(&encoded[cursor..cursor + take]);
            self.pages.insert(pgid, buf);
            cursor += take;
        }
        while cursor < encoded.len() {
            let (pgid, mut buf) = self.pagefile.new_page()?;
            page::init_header(&mut buf, pgid, PageType::OverflowStreak);
            let take = (encoded.len() - cursor).min(crate::constants::BODY_SIZE - 4);
            page::overflow::write_overflow_streak(page::body_mut(&mut buf), &encoded[cursor..cursor + take])?;
            self.new_page_count += 1;
            self.mark_modified(pgid, buf);
            cursor += take;
        }
        Ok(())
    }
}
