//! Thin wrappers around the virtual memory system calls.  Everything
//! in this module reports failure as the raw errno value; callers fold
//! that into `Error` at the component boundary.
use std::ffi::c_void;
use std::ptr::NonNull;

fn page_size_or_die() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if ret <= 0 {
        panic!("Unable to find page_size: errno={}", errno());
    }

    ret as usize
}

lazy_static::lazy_static! {
    static ref PAGE_SIZE: usize = page_size_or_die();
}

/// Returns the system page size.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Attempts to reserve an *address space* region of `size` bytes.
/// The reservation has no access permissions and no backing store;
/// ranges inside it are activated with the `map_*_fixed` calls.
///
/// The `size` argument must be a multiple of the page size.
pub fn reserve_region(size: usize) -> Result<NonNull<c_void>, i32> {
    assert!(
        size > 0 && (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    let ret = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };

    if ret == libc::MAP_FAILED {
        Err(errno())
    } else {
        Ok(NonNull::new(ret).expect("mmap never returns NULL on success"))
    }
}

/// Reserves a region of `size` bytes whose base is aligned to
/// `alignment`.  Over-reserves by one alignment unit and trims the
/// slop off both ends.
///
/// `alignment` must be a power of two multiple of the page size.
pub fn reserve_aligned_region(size: usize, alignment: usize) -> Result<NonNull<c_void>, i32> {
    assert!(alignment.is_power_of_two() && (alignment % page_size()) == 0);
    assert!(size > 0 && (size % page_size()) == 0);

    let padded = size.checked_add(alignment).expect("reservation overflows");
    let raw = reserve_region(padded)?;

    let base = raw.as_ptr() as usize;
    let aligned = (base + alignment - 1) & !(alignment - 1);

    // Trim the bottom slop, then the top.
    if aligned > base {
        release_region(raw, aligned - base)?;
    }

    let top_slop = padded - (aligned - base) - size;
    if top_slop > 0 {
        let top = NonNull::new((aligned + size) as *mut c_void).expect("must be non-null");
        release_region(top, top_slop)?;
    }

    Ok(NonNull::new(aligned as *mut c_void).expect("aligned base is non-null"))
}

/// Releases a region of `size` bytes starting at `base`.
///
/// The size argument must be a multiple of the page size.
pub fn release_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    assert!(
        (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    if unsafe { libc::munmap(base.as_ptr(), size) } == 0 {
        Ok(())
    } else {
        Err(errno())
    }
}

/// Backs `[base, base + size)` with demand-zero anonymous memory,
/// replacing whatever mapping was there.
pub fn map_anonymous_fixed(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    assert!(size > 0 && (size % page_size()) == 0);
    assert_eq!(base.as_ptr() as usize % page_size(), 0);

    let ret = unsafe {
        libc::mmap(
            base.as_ptr(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
            -1,
            0,
        )
    };

    if ret == libc::MAP_FAILED {
        Err(errno())
    } else {
        Ok(())
    }
}

/// Maps `size` bytes of the file behind `fd` at exactly `base` with a
/// shared mapping, so that stores reach the backing file.
pub fn map_file_fixed(
    fd: std::os::unix::io::RawFd,
    base: NonNull<c_void>,
    size: usize,
    read_only: bool,
) -> Result<(), i32> {
    assert!(size > 0 && (size % page_size()) == 0);
    assert_eq!(base.as_ptr() as usize % page_size(), 0);

    let prot = if read_only {
        libc::PROT_READ
    } else {
        libc::PROT_READ | libc::PROT_WRITE
    };

    let ret = unsafe { libc::mmap(base.as_ptr(), size, prot, libc::MAP_SHARED | libc::MAP_FIXED, fd, 0) };

    if ret == libc::MAP_FAILED {
        Err(errno())
    } else {
        Ok(())
    }
}

/// Maps `size` bytes of the file behind `fd` wherever the kernel
/// likes, shared and writable.  Only used for short-lived probes.
pub fn map_file(fd: std::os::unix::io::RawFd, size: usize) -> Result<NonNull<c_void>, i32> {
    assert!(size > 0 && (size % page_size()) == 0);

    let ret = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };

    if ret == libc::MAP_FAILED {
        Err(errno())
    } else {
        Ok(NonNull::new(ret).expect("mmap never returns NULL on success"))
    }
}

fn protect(base: NonNull<c_void>, size: usize, prot: i32) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }
    assert_eq!(size % page_size(), 0);

    if unsafe { libc::mprotect(base.as_ptr(), size, prot) } == 0 {
        Ok(())
    } else {
        Err(errno())
    }
}

pub fn protect_read_only(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    protect(base, size, libc::PROT_READ)
}

pub fn protect_read_write(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    protect(base, size, libc::PROT_READ | libc::PROT_WRITE)
}

/// Overlays `[base, base + size)` with an inaccessible anonymous
/// mapping.  Discards the contents without syncing them out, which is
/// much faster than `munmap` on a large dirty file mapping.
pub fn overlay_prot_none(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    assert!(size > 0 && (size % page_size()) == 0);

    let ret = unsafe {
        libc::mmap(
            base.as_ptr(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };

    if ret == libc::MAP_FAILED {
        Err(errno())
    } else {
        Ok(())
    }
}

/// Flushes `[base, base + size)` to the backing files.  A strong sync
/// waits for the writeback; a weak one only schedules it.
pub fn sync_region(base: NonNull<c_void>, size: usize, strong: bool) -> Result<(), i32> {
    assert_eq!(size % page_size(), 0);

    let flags = if strong { libc::MS_SYNC } else { libc::MS_ASYNC };
    if unsafe { libc::msync(base.as_ptr(), size, flags) } == 0 {
        Ok(())
    } else {
        Err(errno())
    }
}

/// Returns the pages of a shared file mapping to the kernel and
/// punches the corresponding hole in the backing file.  Falls back to
/// a plain uncommit when the filesystem cannot punch holes.
pub fn uncommit_file_backed_pages(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    assert!(size > 0 && (size % page_size()) == 0);

    #[cfg(target_os = "linux")]
    {
        if unsafe { libc::madvise(base.as_ptr(), size, libc::MADV_REMOVE) } == 0 {
            return Ok(());
        }
    }

    uncommit_shared_pages(base, size)
}

/// Tells the kernel the pages are no longer needed; the file contents
/// are left alone.
pub fn uncommit_shared_pages(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    assert!(size > 0 && (size % page_size()) == 0);

    if unsafe { libc::madvise(base.as_ptr(), size, libc::MADV_DONTNEED) } == 0 {
        Ok(())
    } else {
        Err(errno())
    }
}

#[test]
fn test_page_size() {
    assert_ne!(page_size(), 0);
    assert!(page_size().is_power_of_two());
}

// Reserve an aligned region, activate a few pages, and tear the whole
// thing down.
#[test]
fn smoke_test() {
    fn allocate_and_touch(at: NonNull<c_void>, count: usize) {
        map_anonymous_fixed(at, count).expect("should map");
        unsafe { std::ptr::write_bytes(at.as_ptr() as *mut u8, 42, count) };
    }

    let region_size = 1usize << 21;
    let base = reserve_aligned_region(region_size, region_size).expect("reserve should succeed");

    assert_eq!(base.as_ptr() as usize % region_size, 0);

    allocate_and_touch(base, page_size());

    let tail = NonNull::new((base.as_ptr() as usize + region_size - page_size()) as *mut c_void)
        .expect("Should be non-null");
    allocate_and_touch(tail, page_size());

    release_region(base, region_size).expect("should release everything");
}
