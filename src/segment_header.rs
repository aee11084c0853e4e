//! The segment header sits at the start of the reserved region,
//! before the allocatable area, and stores the address of the live
//! manager.  Allocator handles embedded in persisted containers reach
//! the manager through this one word, which is rewritten on every
//! open, instead of holding a raw pointer that would go stale with
//! the process.
use crate::config::CHUNK_SIZE;

#[repr(C)]
pub struct SegmentHeader {
    /// Address of the `Manager` currently serving this segment, as a
    /// word.  Only meaningful while the datastore is open.
    manager: usize,
    /// Address the segment's allocatable area is mapped at.
    segment_base: usize,
}

/// The header gets its own chunk-aligned region so the allocatable
/// area starts on a chunk boundary.
pub const SEGMENT_HEADER_SIZE: usize = CHUNK_SIZE;

static_assertions::const_assert!(std::mem::size_of::<SegmentHeader>() <= SEGMENT_HEADER_SIZE);

impl SegmentHeader {
    pub fn initialize(&mut self, manager: *const (), segment_base: *mut u8) {
        self.manager = manager as usize;
        self.segment_base = segment_base as usize;
    }

    pub fn manager(&self) -> *const () {
        self.manager as *const ()
    }

    pub fn segment_base(&self) -> *mut u8 {
        self.segment_base as *mut u8
    }
}
