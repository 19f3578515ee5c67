//! The shared region primitive.
//!
//! A [`Region`] is a fixed-size byte buffer visible to every cooperating
//! process, plus advisory read/write locks on it. The storage layer performs
//! all region access through this trait; it never holds references into the
//! buffer, so implementations are free to back it with process-local memory
//! ([`HeapRegion`]) or a shared file mapping ([`MmapRegion`]).
//!
//! Region access follows an advisory-lock discipline: callers take `rlock`
//! or `wlock` before `read`/`write` and pair every acquisition with
//! `unlock`. The locks are blocking and untimed.

use std::cell::UnsafeCell;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use fs2::FileExt;
use memmap2::MmapRaw;
use parking_lot::lock_api::RawRwLock as _;
use parking_lot::RawRwLock;

/// Default region capacity in bytes: 100 pages of 4 KiB.
pub const DEFAULT_REGION_CAPACITY: usize = 100 * 4096;

/// Environment variable naming the default region identifier.
pub const REGION_ID_ENV: &str = "PROMETRIC_REGION";

/// Reads the region identifier from the environment, defaulting to 0.
pub fn region_id_from_env() -> u32 {
    std::env::var(REGION_ID_ENV)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

/// A fixed-size byte buffer shared by all cooperating processes, with
/// advisory read/write locks.
///
/// `read` and `write` must stay within `capacity()`; callers are expected to
/// bounds-check against the capacity before issuing them, and to hold the
/// appropriate lock for the access.
pub trait Region: Send + Sync {
    /// The fixed byte capacity, decided when the region was created.
    fn capacity(&self) -> usize;

    /// Copies `dst.len()` bytes starting at `offset` out of the region.
    fn read(&self, offset: usize, dst: &mut [u8]);

    /// Copies `src` into the region starting at `offset`.
    fn write(&self, offset: usize, src: &[u8]);

    /// Takes the shared (read) lock, blocking until acquired.
    fn rlock(&self) -> io::Result<()>;

    /// Takes the exclusive (write) lock, blocking until acquired.
    fn wlock(&self) -> io::Result<()>;

    /// Releases whichever lock the caller holds.
    fn unlock(&self);
}

/// A process-local region.
///
/// Backs single-process deployments and tests. The advisory locks are a raw
/// reader-writer lock, so the locking protocol is identical to the shared
/// implementations even though nothing else can attach.
pub struct HeapRegion {
    data: UnsafeCell<Box<[u8]>>,
    lock: RawRwLock,
    write_locked: AtomicBool,
}

// Safety: the byte buffer is only touched through `read`/`write`, which the
// storage protocol orders under the region's advisory lock.
unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

impl HeapRegion {
    /// Creates a zeroed region of the given capacity.
    pub fn new(capacity: usize) -> HeapRegion {
        HeapRegion {
            data: UnsafeCell::new(vec![0u8; capacity].into_boxed_slice()),
            lock: RawRwLock::INIT,
            write_locked: AtomicBool::new(false),
        }
    }
}

impl Default for HeapRegion {
    fn default() -> HeapRegion {
        HeapRegion::new(DEFAULT_REGION_CAPACITY)
    }
}

impl Region for HeapRegion {
    fn capacity(&self) -> usize {
        // Safety: the length never changes after construction.
        unsafe { (&*self.data.get()).len() }
    }

    fn read(&self, offset: usize, dst: &mut [u8]) {
        assert!(offset + dst.len() <= self.capacity());
        // Safety: in bounds per the assert; concurrent access is ordered by
        // the advisory lock held by the caller.
        unsafe {
            let base = (*self.data.get()).as_ptr();
            ptr::copy_nonoverlapping(base.add(offset), dst.as_mut_ptr(), dst.len());
        }
    }

    fn write(&self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= self.capacity());
        // Safety: as for `read`.
        unsafe {
            let base = (*self.data.get()).as_mut_ptr();
            ptr::copy_nonoverlapping(src.as_ptr(), base.add(offset), src.len());
        }
    }

    fn rlock(&self) -> io::Result<()> {
        self.lock.lock_shared();
        Ok(())
    }

    fn wlock(&self) -> io::Result<()> {
        self.lock.lock_exclusive();
        self.write_locked.store(true, Ordering::Release);
        Ok(())
    }

    fn unlock(&self) {
        // The flag is only set while the exclusive lock is held, so it
        // cannot flip between the load and the release below.
        if self.write_locked.load(Ordering::Acquire) {
            self.write_locked.store(false, Ordering::Release);
            // Safety: paired with the `lock_exclusive` in `wlock`.
            unsafe { self.lock.unlock_exclusive() }
        } else {
            // Safety: paired with the `lock_shared` in `rlock`.
            unsafe { self.lock.unlock_shared() }
        }
    }
}

/// A region backed by a shared file mapping, with flock advisory locks.
///
/// This is the multi-process implementation: every worker opens the same
/// region file and maps it shared. Locks are per file description, so two
/// attachments within one process also exclude each other.
pub struct MmapRegion {
    file: File,
    map: MmapRaw,
    capacity: usize,
    path: PathBuf,
}

impl MmapRegion {
    /// Creates (or truncates to size) the region file at `path` and maps it.
    pub fn create(path: impl AsRef<Path>, capacity: usize) -> io::Result<MmapRegion> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path.as_ref())?;
        file.set_len(capacity as u64)?;
        Self::map(file, path.as_ref().to_owned())
    }

    /// Opens and maps an existing region file; the capacity is its length.
    pub fn open(path: impl AsRef<Path>) -> io::Result<MmapRegion> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        Self::map(file, path.as_ref().to_owned())
    }

    /// Opens the region file for the given identifier, creating it with the
    /// default capacity if it does not exist yet.
    pub fn for_id(id: u32) -> io::Result<MmapRegion> {
        let path = std::env::temp_dir().join(format!("prometric-{id}.region"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        if file.metadata()?.len() == 0 {
            file.set_len(DEFAULT_REGION_CAPACITY as u64)?;
        }
        Self::map(file, path)
    }

    /// Opens the region selected by the `PROMETRIC_REGION` environment
    /// variable (identifier 0 when unset).
    pub fn from_env() -> io::Result<MmapRegion> {
        Self::for_id(region_id_from_env())
    }

    fn map(file: File, path: PathBuf) -> io::Result<MmapRegion> {
        let capacity = file.metadata()?.len() as usize;
        let map = MmapRaw::map_raw(&file)?;
        Ok(MmapRegion {
            file,
            map,
            capacity,
            path,
        })
    }

    /// The path of the backing region file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Region for MmapRegion {
    fn capacity(&self) -> usize {
        self.capacity
    }

    fn read(&self, offset: usize, dst: &mut [u8]) {
        assert!(offset + dst.len() <= self.capacity);
        // Safety: in bounds per the assert; cross-process ordering comes
        // from the advisory flock held by the caller.
        unsafe {
            ptr::copy_nonoverlapping(self.map.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
    }

    fn write(&self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= self.capacity);
        // Safety: as for `read`.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.map.as_mut_ptr().add(offset), src.len());
        }
    }

    fn rlock(&self) -> io::Result<()> {
        self.file.lock_shared()
    }

    fn wlock(&self) -> io::Result<()> {
        self.file.lock_exclusive()
    }

    fn unlock(&self) {
        if let Err(err) = self.file.unlock() {
            log::error!("failed to release region lock on {:?}: {err}", self.path);
        }
    }
}
