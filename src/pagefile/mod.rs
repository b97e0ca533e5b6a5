//! Partitioned, append-only, mmap-backed page store.
//!
//! Pages are delivered and written by absolute `PageId`; allocation and
//! partition rollover happen here, below the override index
//! (`crate::ovr`) and the transactional session (`crate::tpio`).

mod partition;

pub use partition::{partition_path, partid_from_path};

use crate::constants::{PAGE_SIZE, PARTID_MAX, PGID_INVALID};
use crate::error::{Error, Result};
use crate::page::{pgid_local, pgid_partid, pgid_make, Flags};
use fs2::FileExt;
use parking_lot::RwLock;
use partition::Partition;
use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, Ordering};

/// Options controlling how a partitioned page file is opened. Mirrors the
/// embedded API's open-option set at the storage layer.
#[derive(Debug, Clone, Copy)]
pub struct OpenOptionsPf {
    pub writer: bool,
    pub create: bool,
    pub truncate: bool,
}

impl Default for OpenOptionsPf {
    fn default() -> Self {
        OpenOptionsPf {
            writer: true,
            create: true,
            truncate: false,
        }
    }
}

pub struct PageFile {
    prefix: String,
    partitions: RwLock<Vec<Partition>>,
    active_partid: AtomicU16,
    lock_file: Option<File>,
}

impl PageFile {
    /// Opens (or creates) the partitioned file set rooted at
    /// `path_prefix`, scanning existing `<prefix>.<partid>.ptnk` files and
    /// recovering the allocation high-water mark.
    pub fn open(path_prefix: &str, opts: OpenOptionsPf) -> Result<PageFile> {
        if opts.truncate {
            for p in Self::scan_partition_paths(path_prefix)? {
                let _ = fs::remove_file(p);
            }
        }

        let lock_file = if opts.writer {
            let lf = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(format!("{}.lock", path_prefix))?;
            lf.lock_exclusive()?;
            Some(lf)
        } else {
            None
        };

        let mut found = Self::scan_partition_paths(path_prefix)?;
        found.sort();

        let mut partitions = Vec::new();
        let mut max_partid = None;
        for path in &found {
            if let Some(partid) = partid_from_path(path_prefix, path) {
                max_partid = Some(max_partid.map_or(partid, |m: u16| m.max(partid)));
            }
        }

        if found.is_empty() {
            if !opts.create {
                return Err(Error::Corrupt(format!(
                    "no partitions found for prefix {}",
                    path_prefix
                )));
            }
            let path = partition_path(path_prefix, 0);
            let part = Partition::open(0, path, opts.writer, true)?;
            part.set_next_local(0);
            partitions.push(part);
            max_partid = Some(0);
        } else {
            for path in found {
                let partid = partid_from_path(path_prefix, &path)
                    .ok_or_else(|| Error::Corrupt(format!("unparsable partition path {:?}", path)))?;
                let writable = opts.writer && Some(partid) == max_partid;
                let part = Partition::open(partid, path, writable, false)?;
                if !writable {
                    part.mark_read_only();
                }
                partitions.push(part);
            }
        }

        let active_partid = max_partid.unwrap_or(0);
        let pf = PageFile {
            prefix: path_prefix.to_string(),
            partitions: RwLock::new(partitions),
            active_partid: AtomicU16::new(active_partid),
            lock_file,
        };

        pf.recover_next_local(active_partid)?;

        log::debug!(
            "opened page file {} ({} partition(s), active {:03x})",
            path_prefix,
            pf.partitions.read().len(),
            active_partid
        );
        Ok(pf)
    }

    fn scan_partition_paths(path_prefix: &str) -> Result<Vec<PathBuf>> {
        let dir = std::path::Path::new(path_prefix)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| std::path::Path::new("."));
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if partid_from_path(path_prefix, &path).is_some() {
                out.push(path);
            }
        }
        Ok(out)
    }

    /// Scans the active partition backward from its high-water mark for
    /// the last page with `flags & VALID`, setting the next-alloc pointer
    /// just past it.
    fn recover_next_local(&self, active_partid: u16) -> Result<()> {
        let partitions = self.partitions.read();
        let part = partitions
            .iter()
            .find(|p| p.id == active_partid)
            .expect("active partition must be present");

        let mapped = part.mapped_pages();
        let mut last_valid_plus_one = 0u64;
        for local in (0..mapped).rev() {
            let raw = match part.read_page(local) {
                Ok(r) => r,
                Err(_) => continue,
            };
            let flags = Flags::from_bits_truncate(raw[crate::page::FLAGS_OFFSET]);
            let txid = crate::encode::decode_u64(&raw, crate::page::TXID_OFFSET);
            if flags.contains(Flags::VALID) && txid != crate::constants::TXID_INVALID {
                last_valid_plus_one = local + 1;
                break;
            }
        }
        part.set_next_local(last_valid_plus_one);
        Ok(())
    }

    /// Allocates a new page id, rolling over to a fresh partition if the
    /// active one is full.
    pub fn new_page(&self) -> Result<(u64, Box<[u8]>)> {
        loop {
            let partid = self.active_partid.load(Ordering::SeqCst);
            let local = {
                let partitions = self.partitions.read();
                let part = partitions.iter().find(|p| p.id == partid).unwrap();
                part.reserve_local()?
            };
            if let Some(local) = local {
                let pgid = pgid_make(partid, local);
                let mut buf = vec![0u8; PAGE_SIZE].into_boxed_slice();
                crate::encode::encode_u64(&mut buf, 0, pgid);
                crate::encode::encode_u64(&mut buf, 8, PGID_INVALID);
                crate::encode::encode_u64(&mut buf, 16, crate::constants::TXID_INVALID);
                return Ok((pgid, buf));
            }
            self.rollover(partid)?;
        }
    }

    /// Forces a rollover to a new partition even if the active one is not
    /// yet full.
    pub fn rollover(&self, expect_active: u16) -> Result<()> {
        let mut partitions = self.partitions.write();
        let cur_active = self.active_partid.load(Ordering::SeqCst);
        if cur_active != expect_active {
            // someone else already rolled over
            return Ok(());
        }
        if let Some(part) = partitions.iter().find(|p| p.id == cur_active) {
            part.mark_read_only();
        }
        let next_id = cur_active.checked_add(1).filter(|&n| n <= PARTID_MAX);
        let next_id = match next_id {
            Some(n) => n,
            None => return Err(Error::OutOfSpace),
        };
        let path = partition_path(&self.prefix, next_id);
        let part = Partition::open(next_id, path, true, true)?;
        part.set_next_local(0);
        partitions.push(part);
        self.active_partid.store(next_id, Ordering::SeqCst);
        log::debug!("rolled over to partition {:03x}", next_id);
        Ok(())
    }

    pub fn read_page(&self, pgid: u64) -> Result<Box<[u8]>> {
        let partid = pgid_partid(pgid);
        let local = pgid_local(pgid);
        let partitions = self.partitions.read();
        let part = partitions
            .iter()
            .find(|p| p.id == partid)
            .ok_or_else(|| Error::Corrupt(format!("no such partition {:03x}", partid)))?;
        part.read_page(local)
    }

    pub fn write_page(&self, pgid: u64, data: &[u8]) -> Result<()> {
        let partid = pgid_partid(pgid);
        let local = pgid_local(pgid);
        let partitions = self.partitions.read();
        let part = partitions
            .iter()
            .find(|p| p.id == partid)
            .ok_or_else(|| Error::Corrupt(format!("no such partition {:03x}", partid)))?;
        part.write_page(local, data)
    }

    /// Syncs one or more contiguous pgid ranges, grouping by partition.
    pub fn sync_pages(&self, pgids: &[u64]) -> Result<()> {
        if pgids.is_empty() {
            return Ok(());
        }
        let partitions = self.partitions.read();
        let mut i = 0;
        while i < pgids.len() {
            let partid = pgid_partid(pgids[i]);
            let mut j = i;
            let mut first = pgid_local(pgids[i]);
            let mut last = first;
            while j + 1 < pgids.len() && pgid_partid(pgids[j + 1]) == partid && pgid_local(pgids[j + 1]) == last + 1 {
                j += 1;
                last = pgid_local(pgids[j]);
            }
            let _ = &mut first;
            let part = partitions
                .iter()
                .find(|p| p.id == partid)
                .ok_or_else(|| Error::Corrupt(format!("no such partition {:03x}", partid)))?;
            part.sync_range(pgid_local(pgids[i]), last)?;
            i = j + 1;
        }
        Ok(())
    }

    /// Unlinks every partition file matching `<prefix>.<3hex>.ptnk`
    pub fn drop_files(path_prefix: &str) -> Result<()> {
        for path in Self::scan_partition_paths(path_prefix)? {
            fs::remove_file(path)?;
        }
        let lock_path = format!("{}.lock", path_prefix);
        let _ = fs::remove_file(lock_path);
        Ok(())
    }

    pub fn active_partid(&self) -> u16 {
        self.active_partid.load(Ordering::SeqCst)
    }

    /// `false` once any partition has ever handed out a local id; used by
    /// `Db::open` to tell a brand-new database apart from an existing one
    pub fn has_any_page(&self) -> bool {
        self.partitions.read().iter().any(|p| p.next_local() > 0)
    }

    /// Scans every mapped page in every partition for ones still carrying
    /// an `id_ovr_tgt`, returning `(orig, ovr, ver_write)` triples plus the
    /// `ver_write` of the most recent page flagged `TX_REBASE`, if any. The
    /// override index itself is never persisted — on a clean restart it is
    /// rebuilt from exactly this information, replaying only the triples
    /// committed after that rebase point.
    pub fn scan_overrides(&self) -> Result<(Vec<(u64, u64, u64)>, u64)> {
        let partitions = self.partitions.read();
        let mut out = Vec::new();
        let mut last_rebase_version = 0u64;
        for part in partitions.iter() {
            for local in 0..part.mapped_pages() {
                let raw = match part.read_page(local) {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                let hdr = crate::page::read_header(&raw);
                if !hdr.flags.contains(Flags::VALID) {
                    continue;
                }
                if hdr.flags.contains(Flags::TX_REBASE) {
                    last_rebase_version = last_rebase_version.max(hdr.txid);
                }
                if !crate::page::pgid_is_invalid(hdr.id_ovr_tgt) {
                    out.push((hdr.id_ovr_tgt, hdr.id, hdr.txid));
                }
            }
        }
        Ok((out, last_rebase_version))
    }

    /// The `unique_page_count` striped into the streak of the most
    /// recently committed tx (the one with the highest `txid`), or `0` if
    /// the database has no committed pages yet. Lets `Db::open` resume its
    /// running unique-page counter without re-walking every table's tree.
    pub fn latest_unique_page_count(&self) -> Result<u64> {
        let partitions = self.partitions.read();
        let mut max_txid: Option<u64> = None;
        for part in partitions.iter() {
            for local in 0..part.mapped_pages() {
                let raw = match part.read_page(local) {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                let hdr = crate::page::read_header(&raw);
                if hdr.flags.contains(Flags::VALID) && hdr.txid != crate::constants::TXID_INVALID {
                    max_txid = Some(max_txid.map_or(hdr.txid, |m| m.max(hdr.txid)));
                }
            }
        }
        let Some(target_txid) = max_txid else {
            return Ok(0);
        };

        let mut best: Option<(u64, Box<[u8]>)> = None;
        for part in partitions.iter() {
            for local in 0..part.mapped_pages() {
                let raw = match part.read_page(local) {
                    Ok(r) => r,
                    Err(_) => continue,
                };
                let hdr = crate::page::read_header(&raw);
                if hdr.flags.contains(Flags::VALID) && hdr.txid == target_txid {
                    if best.as_ref().map_or(true, |(pgid, _)| hdr.id < *pgid) {
                        best = Some((hdr.id, raw));
                    }
                }
            }
        }
        match best {
            Some((_, raw)) => Ok(crate::tpio::StreakPayload::decode(crate::page::streak(&raw))?.unique_page_count),
            None => Ok(0),
        }
    }

    /// Drops every partition whose id is `<= threshold`, used after
    /// compaction once no live snapshot can resolve into them.
    pub fn discard_partitions_up_to(&self, threshold: u16) -> Result<()> {
        let mut partitions = self.partitions.write();
        let active = self.active_partid.load(Ordering::SeqCst);
        let mut kept = Vec::with_capacity(partitions.len());
        let mut to_remove = Vec::new();
        for part in partitions.drain(..) {
            if part.id <= threshold && part.id != active {
                to_remove.push(part.path.clone());
            } else {
                kept.push(part);
            }
        }
        *partitions = kept;
        drop(partitions);
        for path in to_remove {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}
