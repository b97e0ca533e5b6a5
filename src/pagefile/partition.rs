//! A single `<prefix>.<partid>.ptnk` file: an mmap-backed, append-only
//! sequence of fixed-size pages.

use crate::constants::{PAGE_SIZE, PARTITION_MAX_PAGES};
use crate::error::{Error, Result};
use memmap2::MmapMut;
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Number of pages to grow a partition file by each time it runs out of
/// mapped room, amortizing `ftruncate`/remap cost across many allocations.
const GROWTH_CHUNK_PAGES: u64 = 256;

pub struct Partition {
    pub id: u16,
    pub path: PathBuf,
    file: File,
    mmap: RwLock<MmapMut>,
    /// Pages already mapped (>= pages actually allocated).
    mapped_pages: AtomicU64,
    /// Next local id to hand out.
    next_local: AtomicU64,
    expand_lock: Mutex<()>,
    pub read_only: AtomicBool,
}

impl Partition {
    /// Opens or creates the partition file at `path`, mapping at least
    /// `existing_pages` worth of room (0 for a brand-new partition).
    pub fn open(id: u16, path: PathBuf, writable: bool, create: bool) -> Result<Partition> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .create(create)
            .open(&path)?;

        let len = file.metadata()?.len();
        let mapped_pages = if len == 0 {
            if writable {
                file.set_len(GROWTH_CHUNK_PAGES * PAGE_SIZE as u64)?;
                GROWTH_CHUNK_PAGES
            } else {
                0
            }
        } else {
            len / PAGE_SIZE as u64
        };

        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(Partition {
            id,
            path,
            file,
            mmap: RwLock::new(mmap),
            mapped_pages: AtomicU64::new(mapped_pages),
            next_local: AtomicU64::new(len / PAGE_SIZE as u64),
            expand_lock: Mutex::new(()),
            read_only: AtomicBool::new(!writable),
        })
    }

    /// Sets the next-alloc local id, used by recovery to resume after the
    /// last valid page found on a backward scan.
    pub fn set_next_local(&self, next: u64) {
        self.next_local.store(next, Ordering::SeqCst);
    }

    pub fn next_local(&self) -> u64 {
        self.next_local.load(Ordering::SeqCst)
    }

    pub fn mapped_pages(&self) -> u64 {
        self.mapped_pages.load(Ordering::SeqCst)
    }

    /// Reserves the next local id via CAS. Returns `None` once the
    /// partition has reached `PARTITION_MAX_PAGES`.
    pub fn reserve_local(&self) -> Result<Option<u64>> {
        let backoff = crossbeam_utils::Backoff::new();
        loop {
            let cur = self.next_local.load(Ordering::SeqCst);
            if cur >= PARTITION_MAX_PAGES {
                return Ok(None);
            }
            if self
                .next_local
                .compare_exchange_weak(cur, cur + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.ensure_mapped(cur + 1)?;
                return Ok(Some(cur));
            }
            backoff.spin();
        }
    }

    /// `true` once every local id below `PARTITION_MAX_PAGES` has been
    /// handed out.
    pub fn is_full(&self) -> bool {
        self.next_local.load(Ordering::SeqCst) >= PARTITION_MAX_PAGES
    }

    fn ensure_mapped(&self, required_pages: u64) -> Result<()> {
        if self.mapped_pages.load(Ordering::SeqCst) >= required_pages {
            return Ok(());
        }
        let _guard = self.expand_lock.lock();
        if self.mapped_pages.load(Ordering::SeqCst) >= required_pages {
            return Ok(());
        }
        let new_pages = required_pages.max(self.mapped_pages.load(Ordering::SeqCst) + GROWTH_CHUNK_PAGES);
        let new_len = new_pages * PAGE_SIZE as u64;
        self.file.set_len(new_len)?;
        let new_mmap = unsafe { MmapMut::map_mut(&self.file)? };
        *self.mmap.write() = new_mmap;
        self.mapped_pages.store(new_pages, Ordering::SeqCst);
        Ok(())
    }

    /// Copies the page at `local_id` out of the mapping.
    pub fn read_page(&self, local_id: u64) -> Result<Box<[u8]>> {
        let guard = self.mmap.read();
        let offset = (local_id * PAGE_SIZE as u64) as usize;
        if offset + PAGE_SIZE > guard.len() {
            return Err(Error::Corrupt(format!(
                "page {} out of range for partition {}",
                local_id, self.id
            )));
        }
        Ok(guard[offset..offset + PAGE_SIZE].to_vec().into_boxed_slice())
    }

    /// Writes `data` (exactly `PAGE_SIZE` bytes) into the mapping at
    /// `local_id`.
    ///
    /// Safe under the engine's invariant: distinct pages occupy
    /// disjoint byte ranges, and a page is only written by the single tx
    /// that allocated it until that tx commits, so concurrent calls for
    /// different `local_id`s never race, and no reader observes a page
    /// before its commit sync completes.
    pub fn write_page(&self, local_id: u64, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        let guard = self.mmap.read();
        let offset = (local_id * PAGE_SIZE as u64) as usize;
        if offset + PAGE_SIZE > guard.len() {
            return Err(Error::Corrupt(format!(
                "page {} out of range for partition {}",
                local_id, self.id
            )));
        }
        unsafe {
            let dst = guard.as_ptr().add(offset) as *mut u8;
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, PAGE_SIZE);
        }
        Ok(())
    }

    /// Flushes `[first_local, last_local]` (inclusive) to disk, preferring
    /// `sync_file_range` on Linux, falling back to `msync` (via
    /// `memmap2::flush_range`) elsewhere, and `fdatasync` as a last
    /// resort.
    pub fn sync_range(&self, first_local: u64, last_local: u64) -> Result<()> {
        let offset = (first_local * PAGE_SIZE as u64) as usize;
        let len = ((last_local - first_local + 1) * PAGE_SIZE as u64) as usize;
        sync_primitive::sync_range(&self.file, &self.mmap.read(), offset, len)
    }

    pub fn mark_read_only(&self) {
        self.read_only.store(true, Ordering::SeqCst);
    }
}

/// Parses `<prefix>.<3hex>.ptnk` filenames, returning the partition id.
pub fn partid_from_path(prefix: &str, path: &Path) -> Option<u16> {
    let name = path.file_name()?.to_str()?;
    let prefix_name = Path::new(prefix).file_name()?.to_str()?;
    let rest = name.strip_prefix(prefix_name)?;
    let rest = rest.strip_prefix('.')?;
    let rest = rest.strip_suffix(".ptnk")?;
    u16::from_str_radix(rest, 16).ok()
}

pub fn partition_path(prefix: &str, partid: u16) -> PathBuf {
    PathBuf::from(format!("{}.{:03x}.ptnk", prefix, partid))
}

#[cfg(unix)]
mod sync_primitive {
    use memmap2::MmapMut;
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    pub fn sync_range(file: &File, mmap: &MmapMut, offset: usize, len: usize) -> crate::error::Result<()> {
        #[cfg(target_os = "linux")]
        {
            let ret = unsafe {
                libc::sync_file_range(
                    file.as_raw_fd(),
                    offset as libc::off64_t,
                    len as libc::off64_t,
                    libc::SYNC_FILE_RANGE_WAIT_BEFORE
                        | libc::SYNC_FILE_RANGE_WRITE
                        | libc::SYNC_FILE_RANGE_WAIT_AFTER,
                )
            };
            if ret == 0 {
                return Ok(());
            }
            log::debug!(
                "sync_file_range failed ({}), falling back to msync",
                io::Error::last_os_error()
            );
        }
        let _ = file;
        mmap.flush_range(offset, len).map_err(Into::into)
    }
}

#[cfg(not(unix))]
mod sync_primitive {
    use memmap2::MmapMut;
    use std::fs::File;

    pub fn sync_range(file: &File, mmap: &MmapMut, offset: usize, len: usize) -> crate::error::Result<()> {
        let _ = file;
        mmap.flush_range(offset, len).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partid_roundtrips_through_path() {
        let p = partition_path("/tmp/db", 0x1a2);
        assert_eq!(p.file_name().unwrap().to_str().unwrap(), "db.1a2.ptnk");
        assert_eq!(partid_from_path("/tmp/db", &p), Some(0x1a2));
    }

    #[test]
    fn partid_rejects_other_prefixes() {
        let p = PathBuf::from("/tmp/other.001.ptnk");
        assert_eq!(partid_from_path("/tmp/db", &p), None);
    }
}
