//! Compile-time tuning knobs shared by the allocator kernel.
use static_assertions::const_assert;
use static_assertions::const_assert_eq;

/// Unit of segment management.  The segment is an array of chunks;
/// small objects subdivide one chunk into slots, large objects span
/// whole chunks.  Must be a power of two no smaller than the page
/// size.
pub const CHUNK_SIZE: usize = 1 << 21;

/// Address space reserved per datastore when the caller does not give
/// a capacity hint.
pub const DEFAULT_VM_RESERVE_SIZE: usize = 1 << 43;

/// Hard cap on the size of one segment.
pub const MAX_SEGMENT_SIZE: usize = 1 << 48;

/// Size of the first backing file; later files double the total.
pub const INITIAL_SEGMENT_SIZE: usize = 1 << 28;

/// Smallest object size the allocator hands out; requests below this
/// (including zero) are rounded up.
pub const MIN_OBJECT_SIZE: usize = 8;

/// Objects at least this large have the file space of their slot
/// returned to the filesystem on deallocation.  Ranges smaller than
/// two pages are never worth a hole-punch, so the effective floor is
/// `2 * page_size` regardless of this value.
pub const FREE_SMALL_OBJECT_SIZE_HINT: usize = 1 << 13;

const_assert!(CHUNK_SIZE.is_power_of_two());
const_assert!(MIN_OBJECT_SIZE.is_power_of_two());
const_assert!(MIN_OBJECT_SIZE >= core::mem::size_of::<u64>());
const_assert!(CHUNK_SIZE <= INITIAL_SEGMENT_SIZE);
const_assert!(INITIAL_SEGMENT_SIZE <= DEFAULT_VM_RESERVE_SIZE);
const_assert!(DEFAULT_VM_RESERVE_SIZE <= MAX_SEGMENT_SIZE);
const_assert_eq!(INITIAL_SEGMENT_SIZE % CHUNK_SIZE, 0);
