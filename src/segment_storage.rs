//! Multi-file backed segment storage.  The segment is one contiguous
//! address range; it is backed by a sequence of block files mapped
//! end to end with `MAP_FIXED` inside a reservation the manager owns.
//! Growing the segment appends a new block file; block sizes follow a
//! doubling policy so the file count stays logarithmic in the segment
//! size.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::ffi::c_void;
use std::path::Path;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use log::debug;
use log::info;
use log::warn;

use crate::config::CHUNK_SIZE;
use crate::error::Error;
use crate::error::Result;
use crate::file_ops;
use crate::map;

fn block_file_name(base_path: &Path, block_no: usize) -> PathBuf {
    let mut name = base_path.as_os_str().to_owned();
    name.push(format!("_block-{}", block_no));
    PathBuf::from(name)
}

/// Serialized by the growth mutex.
struct GrowState {
    num_blocks: usize,
}

pub struct SegmentStorage {
    /// First byte of the segment.  Fixed for the life of the mapping.
    base: NonNull<c_void>,
    /// Bytes of address space reserved for the segment.
    vm_size: usize,
    /// Bytes currently backed by block files.  Monotonic while open.
    current_size: AtomicUsize,
    grow: Mutex<GrowState>,
    base_path: PathBuf,
    read_only: bool,
    /// Whether the filesystem under the datastore supports punching
    /// holes through a shared mapping; probed at create/open.
    free_file_space: bool,
    destroyed: AtomicBool,
}

// The base pointer is only dereferenced through mapping syscalls and
// the documented allocator lock discipline; the struct's own state is
// behind atomics and the growth mutex.
unsafe impl Send for SegmentStorage {}
unsafe impl Sync for SegmentStorage {}

impl SegmentStorage {
    /// Checks whether a segment exists under `base_path`.
    pub fn openable(base_path: &Path) -> bool {
        block_file_name(base_path, 0).exists()
    }

    /// Total size of an existing segment: the sum of its block files.
    pub fn stored_size(base_path: &Path) -> u64 {
        let mut total = 0;
        for block_no in 0.. {
            match file_ops::file_size(&block_file_name(base_path, block_no)) {
                Ok(size) => total += size,
                Err(_) => break,
            }
        }
        total
    }

    /// Creates a fresh segment of `initial_size` bytes (clipped to
    /// the reservation) backed by `{base_path}_block-0`, mapped at
    /// `vm_region`.
    ///
    /// `vm_region` must point at a reservation of at least `vm_size`
    /// bytes, both chunk-aligned.
    #[requires(vm_size % CHUNK_SIZE == 0)]
    #[requires(initial_size > 0 && initial_size % CHUNK_SIZE == 0)]
    pub fn create(
        base_path: &Path,
        vm_size: usize,
        vm_region: NonNull<c_void>,
        initial_size: usize,
    ) -> Result<Self> {
        assert_eq!(vm_region.as_ptr() as usize % CHUNK_SIZE, 0);

        info!("Create a segment with prefix {}", base_path.display());

        let mut storage = SegmentStorage {
            base: vm_region,
            vm_size,
            current_size: AtomicUsize::new(0),
            grow: Mutex::new(GrowState { num_blocks: 0 }),
            base_path: base_path.to_path_buf(),
            read_only: false,
            free_file_space: false,
            destroyed: AtomicBool::new(false),
        };

        let segment_size = vm_size.min(initial_size);
        storage.create_and_map_block(0, 0, segment_size)?;
        storage.current_size.store(segment_size, Ordering::Release);
        storage.grow.lock().expect("grow mutex should not be poisoned").num_blocks = 1;

        storage.free_file_space = probe_file_space_free(base_path);
        Ok(storage)
    }

    /// Maps every existing block file of the segment under
    /// `base_path`, in order, at `vm_region`.
    #[requires(vm_size % CHUNK_SIZE == 0)]
    pub fn open(base_path: &Path, vm_size: usize, vm_region: NonNull<c_void>, read_only: bool) -> Result<Self> {
        assert_eq!(vm_region.as_ptr() as usize % CHUNK_SIZE, 0);

        info!("Open a segment with prefix {}", base_path.display());

        let mut storage = SegmentStorage {
            base: vm_region,
            vm_size,
            current_size: AtomicUsize::new(0),
            grow: Mutex::new(GrowState { num_blocks: 0 }),
            base_path: base_path.to_path_buf(),
            read_only,
            free_file_space: false,
            destroyed: AtomicBool::new(false),
        };

        let mut mapped = 0usize;
        let mut num_blocks = 0usize;
        loop {
            let path = block_file_name(base_path, num_blocks);
            if !path.exists() {
                break;
            }

            let size = file_ops::file_size(&path).map_err(|e| Error::io("stat block file", &path, e))? as usize;
            if size == 0 || size % map::page_size() != 0 {
                return Err(Error::Inconsistent(format!(
                    "block file {} has size {}, not a positive page multiple",
                    path.display(),
                    size
                )));
            }
            if mapped + size > vm_size {
                return Err(Error::CapacityExceeded("existing blocks exceed the reservation"));
            }

            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(!read_only)
                .open(&path)
                .map_err(|e| Error::io("open block file", &path, e))?;
            let at = storage.address_at(mapped);
            map::map_file_fixed(fd_of(&file), at, size, read_only)
                .map_err(|errno| Error::os("map block file", errno))?;

            debug!("Mapped {} ({} bytes) at {:p}", path.display(), size, at.as_ptr());

            mapped += size;
            num_blocks += 1;
        }

        if num_blocks == 0 {
            return Err(Error::Inconsistent(format!(
                "no block files under {}",
                base_path.display()
            )));
        }

        storage.current_size.store(mapped, Ordering::Release);
        storage.grow.lock().expect("grow mutex should not be poisoned").num_blocks = num_blocks;

        if !read_only {
            storage.free_file_space = probe_file_space_free(base_path);
        }
        Ok(storage)
    }

    /// Grows the segment until it is at least `request` bytes.  Each
    /// growth step at least doubles the current size (clipped to the
    /// reservation), so a sequence of extensions creates
    /// logarithmically many block files.
    #[ensures(ret.is_ok() -> self.size() >= request)]
    pub fn extend(&self, request: usize) -> Result<()> {
        if self.read_only {
            return Err(Error::InvalidArgument("cannot extend a read-only segment"));
        }
        if request > self.vm_size {
            return Err(Error::CapacityExceeded("request exceeds the reserved address space"));
        }

        let mut grow = self.grow.lock().expect("grow mutex should not be poisoned");

        let current = self.size();
        if request <= current {
            return Ok(());
        }

        let rounded = round_up(request, CHUNK_SIZE);
        let new_size = rounded.max(current * 2).min(self.vm_size);

        self.create_and_map_block(grow.num_blocks, current, new_size - current)?;
        grow.num_blocks += 1;
        self.current_size.store(new_size, Ordering::Release);
        Ok(())
    }

    /// Flushes the mapped segment out to its block files.  The
    /// mapping is made read-only for the duration so a racing writer
    /// faults instead of racing the writeback.
    pub fn sync(&self, strong: bool) -> Result<()> {
        if self.read_only {
            return Ok(());
        }

        let size = self.size();
        map::protect_read_only(self.base, size).map_err(|errno| Error::os("protect segment read-only", errno))?;
        let result = map::sync_region(self.base, size, strong).map_err(|errno| Error::os("msync segment", errno));
        map::protect_read_write(self.base, size).map_err(|errno| Error::os("restore segment protection", errno))?;
        result
    }

    /// Releases the physical memory and, when the filesystem allows,
    /// the file space behind `[offset, offset + nbytes)`.  The range
    /// must be page-aligned; failure is not fatal, the pages merely
    /// stay allocated.
    pub fn free_region(&self, offset: usize, nbytes: usize) {
        if self.read_only || nbytes == 0 {
            return;
        }
        debug_assert_eq!(offset % map::page_size(), 0);
        debug_assert_eq!(nbytes % map::page_size(), 0);

        if offset + nbytes > self.size() {
            warn!("Ignoring free_region past the end of the segment");
            return;
        }

        let at = self.address_at(offset);
        let result = if self.free_file_space {
            map::uncommit_file_backed_pages(at, nbytes)
        } else {
            map::uncommit_shared_pages(at, nbytes)
        };
        if let Err(errno) = result {
            debug!("free_region({}, {}) failed: errno={}", offset, nbytes, errno);
        }
    }

    /// Tears down the mapping without syncing: the whole range is
    /// overlaid with an inaccessible anonymous mapping, which is much
    /// faster than unmapping a dirty file mapping.  The backing files
    /// are left in place; releasing the reservation is the owner's
    /// job.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        let size = self.size();
        if size > 0 {
            if let Err(errno) = map::overlay_prot_none(self.base, size) {
                warn!("Failed to discard the segment mapping: errno={}", errno);
            }
        }
    }

    pub fn base(&self) -> NonNull<c_void> {
        self.base
    }

    pub fn size(&self) -> usize {
        self.current_size.load(Ordering::Acquire)
    }

    pub fn page_size(&self) -> usize {
        map::page_size()
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    fn address_at(&self, offset: usize) -> NonNull<c_void> {
        debug_assert!(offset <= self.vm_size);
        NonNull::new((self.base.as_ptr() as usize + offset) as *mut c_void).expect("segment addresses are non-null")
    }

    fn create_and_map_block(&self, block_no: usize, at_offset: usize, size: usize) -> Result<()> {
        let path = block_file_name(&self.base_path, block_no);
        info!("Create and extend {} to {} bytes", path.display(), size);

        let file = file_ops::create_file(&path).map_err(|e| Error::io("create block file", &path, e))?;
        file_ops::extend_file(&file, size as u64).map_err(|e| Error::io("extend block file", &path, e))?;

        map::map_file_fixed(fd_of(&file), self.address_at(at_offset), size, false)
            .map_err(|errno| Error::os("map block file", errno))
    }
}

impl Drop for SegmentStorage {
    fn drop(&mut self) {
        if !self.destroyed.load(Ordering::Acquire) {
            let _ = self.sync(true);
            self.destroy();
        }
    }
}

fn fd_of(file: &std::fs::File) -> std::os::unix::io::RawFd {
    use std::os::unix::io::AsRawFd;
    file.as_raw_fd()
}

fn round_up(value: usize, unit: usize) -> usize {
    (value + unit - 1) / unit * unit
}

/// Checks whether a hole punched through a shared mapping actually
/// releases file space here, with a throwaway file next to the
/// datastore.
fn probe_file_space_free(base_path: &Path) -> bool {
    let dir = base_path.parent().unwrap_or_else(|| Path::new("."));
    let size = 2 * map::page_size();

    let result = (|| -> Result<bool> {
        let file = tempfile::tempfile_in(dir).map_err(|e| Error::io("create probe file", dir, e))?;
        file_ops::extend_file(&file, size as u64).map_err(|e| Error::io("extend probe file", dir, e))?;

        let mapping = map::map_file(fd_of(&file), size).map_err(|errno| Error::os("map probe file", errno))?;
        unsafe { std::ptr::write_bytes(mapping.as_ptr() as *mut u8, 0, 1) };

        let supported = map::uncommit_file_backed_pages(mapping, size).is_ok();
        let _ = map::release_region(mapping, size);
        Ok(supported)
    })();

    match result {
        Ok(supported) => {
            debug!("Freeing file space is {}supported here", if supported { "" } else { "not " });
            supported
        }
        Err(error) => {
            warn!("Could not probe for file space freeing: {}", error);
            false
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::CHUNK_SIZE;

    fn reserve(chunks: usize) -> (NonNull<c_void>, usize) {
        let size = chunks * CHUNK_SIZE;
        let at = map::reserve_aligned_region(size, CHUNK_SIZE).expect("reserve should succeed");
        (at, size)
    }

    #[test]
    fn create_write_reopen() {
        let tmp = tempfile::tempdir().expect("tempdir should build");
        let prefix = tmp.path().join("segment");

        let (region, vm_size) = reserve(8);
        {
            let storage = SegmentStorage::create(&prefix, vm_size, region, CHUNK_SIZE).expect("create should succeed");
            assert_eq!(storage.size(), CHUNK_SIZE);

            unsafe { std::ptr::write(storage.base().as_ptr() as *mut u64, 0xfeedface) };
            storage.sync(true).expect("sync should succeed");
            storage.destroy();
        }
        map::release_region(region, vm_size).expect("release should succeed");

        assert!(SegmentStorage::openable(&prefix));
        assert_eq!(SegmentStorage::stored_size(&prefix), CHUNK_SIZE as u64);

        let (region, vm_size) = reserve(8);
        {
            let storage = SegmentStorage::open(&prefix, vm_size, region, true).expect("open should succeed");
            assert_eq!(storage.size(), CHUNK_SIZE);
            assert_eq!(unsafe { std::ptr::read(storage.base().as_ptr() as *const u64) }, 0xfeedface);
        }
        map::release_region(region, vm_size).expect("release should succeed");
    }

    #[test]
    fn extend_doubles_and_clips() {
        let tmp = tempfile::tempdir().expect("tempdir should build");
        let prefix = tmp.path().join("segment");

        let (region, vm_size) = reserve(8);
        let storage = SegmentStorage::create(&prefix, vm_size, region, CHUNK_SIZE).expect("create should succeed");

        // Within the current size: no-op.
        storage.extend(1).expect("extend should succeed");
        assert_eq!(storage.size(), CHUNK_SIZE);

        // One byte over: doubles.
        storage.extend(CHUNK_SIZE + 1).expect("extend should succeed");
        assert_eq!(storage.size(), 2 * CHUNK_SIZE);

        // Big request: grows to the request, clipped to the
        // reservation.
        storage.extend(7 * CHUNK_SIZE).expect("extend should succeed");
        assert_eq!(storage.size(), 7 * CHUNK_SIZE);

        assert!(matches!(
            storage.extend(vm_size + 1),
            Err(Error::CapacityExceeded(_))
        ));
        assert_eq!(storage.size(), 7 * CHUNK_SIZE, "failed extension has no side effects");

        // The far end of the grown segment is writable.
        unsafe {
            std::ptr::write_bytes((storage.base().as_ptr() as usize + 7 * CHUNK_SIZE - 1) as *mut u8, 7, 1);
        }

        drop(storage);
        map::release_region(region, vm_size).expect("release should succeed");
    }

    #[test]
    fn read_only_refuses_writes() {
        let tmp = tempfile::tempdir().expect("tempdir should build");
        let prefix = tmp.path().join("segment");

        let (region, vm_size) = reserve(4);
        drop(SegmentStorage::create(&prefix, vm_size, region, CHUNK_SIZE).expect("create should succeed"));
        map::release_region(region, vm_size).expect("release should succeed");

        let (region, vm_size) = reserve(4);
        let storage = SegmentStorage::open(&prefix, vm_size, region, true).expect("open should succeed");
        assert!(matches!(
            storage.extend(2 * CHUNK_SIZE),
            Err(Error::InvalidArgument(_))
        ));
        drop(storage);
        map::release_region(region, vm_size).expect("release should succeed");
    }

    #[test]
    fn free_region_keeps_contents_elsewhere() {
        let tmp = tempfile::tempdir().expect("tempdir should build");
        let prefix = tmp.path().join("segment");

        let (region, vm_size) = reserve(4);
        let storage = SegmentStorage::create(&prefix, vm_size, region, CHUNK_SIZE).expect("create should succeed");

        let base = storage.base().as_ptr() as *mut u8;
        let page = storage.page_size();
        unsafe {
            std::ptr::write_bytes(base, 1, page);
            std::ptr::write_bytes(base.add(page), 2, page);
        }

        storage.free_region(0, page);

        unsafe {
            // With hole punching the freed page demand-faults back as
            // zeros; with the advisory fallback its contents may
            // survive.  Its neighbour is untouched either way.
            let freed = std::ptr::read(base);
            assert!(freed == 0 || freed == 1, "freed byte was {}", freed);
            assert_eq!(std::ptr::read(base.add(page)), 2);
        }

        drop(storage);
        map::release_region(region, vm_size).expect("release should succeed");
    }
}
