//! The allocator core: turns byte requests into segment offsets by
//! orchestrating the chunk directory, the bin directory, the per-CPU
//! object cache, and the backing storage.
//!
//! Lock order, outermost first: object-cache mutex, then the owning
//! bin's mutex, then the chunk-directory mutex.  The chunk mutex is
//! never held while taking a bin mutex, and the storage only sees
//! calls from inside this ordering, so there is no cycle.
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

use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use log::info;
use log::warn;

use crate::bin_directory::BinDirectory;
use crate::bins;
use crate::bins::BinNo;
use crate::chunk_directory::ChunkDirectory;
use crate::chunk_directory::ChunkKind;
use crate::chunk_directory::ChunkNo;
use crate::config::CHUNK_SIZE;
use crate::config::FREE_SMALL_OBJECT_SIZE_HINT;
use crate::error::Error;
use crate::error::Result;
use crate::object_cache::ObjectCache;
use crate::segment_storage::SegmentStorage;

const BIN_DIRECTORY_FILE_NAME: &str = "bin_directory";
const CHUNK_DIRECTORY_FILE_NAME: &str = "chunk_directory";

pub struct SegmentAllocator {
    chunk_directory: Mutex<ChunkDirectory>,
    bin_directory: BinDirectory,
    object_cache: ObjectCache,
    storage: Arc<SegmentStorage>,
}

impl SegmentAllocator {
    pub fn new(storage: Arc<SegmentStorage>, capacity: usize) -> Self {
        SegmentAllocator {
            chunk_directory: Mutex::new(ChunkDirectory::new(capacity / CHUNK_SIZE)),
            bin_directory: BinDirectory::new(),
            object_cache: ObjectCache::new(),
            storage,
        }
    }

    /// Allocates `nbytes` and returns the offset of the allocation
    /// from the start of the segment.  Zero-byte requests get the
    /// smallest class, so the offset is real and distinguishable.
    #[ensures(ret.is_ok() -> *ret.as_ref().unwrap() % bins::alignment(bins::bin_of(nbytes).unwrap()) == 0,
              "Offsets are aligned to their class.")]
    pub fn allocate(&self, nbytes: usize) -> Result<usize> {
        let bin_no = bins::bin_of(nbytes).ok_or(Error::CapacityExceeded("request exceeds the maximum size"))?;

        if bins::is_small(bin_no) {
            self.allocate_small(bin_no)
        } else {
            self.allocate_large(bin_no)
        }
    }

    /// Allocates `nbytes` with the offset aligned to `alignment`.
    ///
    /// `alignment` must be a power of two between the minimum object
    /// size and the chunk size, and `nbytes` a multiple of it.
    pub fn allocate_aligned(&self, nbytes: usize, alignment: usize) -> Result<usize> {
        if !alignment.is_power_of_two()
            || alignment < crate::config::MIN_OBJECT_SIZE
            || alignment > CHUNK_SIZE
            || nbytes % alignment != 0
        {
            return Err(Error::InvalidArgument("bad alignment request"));
        }

        // Small classes are powers of two and naturally aligned to
        // their size; large runs start on a chunk boundary.  Rounding
        // the request up to the alignment therefore suffices.
        self.allocate(nbytes.max(alignment))
    }

    /// Releases the allocation at `offset`.
    pub fn deallocate(&self, offset: usize) -> Result<()> {
        let chunk_no = offset / CHUNK_SIZE;

        // The class of a chunk can only change once the chunk is
        // completely empty, and `offset` is still live in it, so this
        // unlocked read is stable.
        let (bin_no, kind) = {
            let chunks = self.lock_chunks();
            (
                match chunks.kind(chunk_no) {
                    ChunkKind::Empty => return Err(Error::InvalidArgument("deallocate in an empty chunk")),
                    ChunkKind::LargeTail => {
                        return Err(Error::InvalidArgument("deallocate does not target a run head"))
                    }
                    _ => chunks.bin_no(chunk_no),
                },
                chunks.kind(chunk_no),
            )
        };

        if bins::is_small(bin_no) {
            debug_assert_eq!(kind, ChunkKind::Small);
            if offset % bins::alignment(bin_no) != 0 {
                return Err(Error::InvalidArgument("offset is not a slot boundary"));
            }

            let cached = self
                .object_cache
                .insert(bin_no, offset, |bin_no, spill| self.deallocate_small_block(bin_no, spill));
            if !cached {
                self.deallocate_small_direct(bin_no, offset)?;
            }
            Ok(())
        } else {
            if offset % CHUNK_SIZE != 0 {
                return Err(Error::InvalidArgument("offset is not a run head"));
            }
            self.deallocate_large(bin_no, chunk_no)
        }
    }

    /// Bytes of segment the chunk directory currently spans.
    pub fn size(&self) -> usize {
        self.lock_chunks().len() * CHUNK_SIZE
    }

    /// Writes the bin and chunk directories under `dir`.  Drains the
    /// object cache first so no transiently cached offset is recorded
    /// as live.
    pub fn serialize(&self, dir: &Path) -> Result<()> {
        self.drain_cache();
        self.bin_directory.serialize(&dir.join(BIN_DIRECTORY_FILE_NAME))?;
        self.lock_chunks().serialize(&dir.join(CHUNK_DIRECTORY_FILE_NAME))
    }

    /// Reloads the bin and chunk directories from `dir`.
    pub fn deserialize(&self, dir: &Path) -> Result<()> {
        self.bin_directory.deserialize(&dir.join(BIN_DIRECTORY_FILE_NAME))?;
        self.lock_chunks().deserialize(&dir.join(CHUNK_DIRECTORY_FILE_NAME))
    }

    /// Logs an occupancy profile of the segment.
    pub fn profile(&self) {
        let chunks = self.lock_chunks();

        info!("[chunk no] [object size] [occupancy %]");
        for chunk_no in 0..chunks.len() {
            match chunks.kind(chunk_no) {
                ChunkKind::Empty => info!("{} 0 0.0", chunk_no),
                ChunkKind::Small => {
                    let bin_no = chunks.bin_no(chunk_no);
                    let slots = bins::num_slots(bin_no);
                    info!(
                        "{} {} {:.2}",
                        chunk_no,
                        bins::object_size(bin_no),
                        chunks.occupied_slots(chunk_no) as f64 / slots as f64 * 100.0,
                    );
                }
                ChunkKind::LargeHead | ChunkKind::LargeTail => {
                    info!("{} {} 100.0", chunk_no, bins::object_size(chunks.bin_no(chunk_no)))
                }
            }
        }
    }

    fn lock_chunks(&self) -> std::sync::MutexGuard<'_, ChunkDirectory> {
        self.chunk_directory.lock().expect("chunk mutex should not be poisoned")
    }

    fn allocate_small(&self, bin_no: BinNo) -> Result<usize> {
        if let Some(offset) = self
            .object_cache
            .get(bin_no, |bin_no, count, out| self.allocate_small_batch(bin_no, count, out))?
        {
            return Ok(offset);
        }

        self.allocate_small_direct(bin_no)
    }

    /// Refills `count` small allocations into `out`, marking as many
    /// slots as possible per lock acquisition.
    fn allocate_small_batch(&self, bin_no: BinNo, count: usize, out: &mut Vec<usize>) -> Result<()> {
        let object_size = bins::object_size(bin_no);
        let mut remaining = count;

        while remaining > 0 {
            let mut bin = self.bin_directory.lock(bin_no);

            if bin.is_empty() {
                let chunk_no = {
                    let mut chunks = self.lock_chunks();
                    let chunk_no = chunks.insert_small(bin_no)?;
                    if let Err(error) = self.storage.extend((chunk_no + 1) * CHUNK_SIZE) {
                        chunks.erase(chunk_no);
                        return Err(error);
                    }
                    chunk_no
                };
                bin.insert(chunk_no);
            }

            let chunk_no = bin.front().expect("the bin was just refilled");

            let mut slots = [0usize; crate::object_cache::CACHE_BLOCK_SIZE];
            let want = remaining.min(slots.len());

            let mut chunks = self.lock_chunks();
            debug_assert!(!chunks.all_slots_marked(chunk_no));
            let marked = chunks.find_and_mark_slots(chunk_no, &mut slots[..want]);
            debug_assert!(marked > 0);

            if chunks.all_slots_marked(chunk_no) {
                drop(chunks);
                bin.pop();
            }

            for &slot_no in &slots[..marked] {
                out.push(chunk_no * CHUNK_SIZE + slot_no * object_size);
            }
            remaining -= marked;
        }

        Ok(())
    }

    /// One small allocation through the bin directory, bypassing the
    /// cache.
    fn allocate_small_direct(&self, bin_no: BinNo) -> Result<usize> {
        let object_size = bins::object_size(bin_no);
        let mut bin = self.bin_directory.lock(bin_no);

        if bin.is_empty() {
            let chunk_no = {
                let mut chunks = self.lock_chunks();
                let chunk_no = chunks.insert_small(bin_no)?;
                if let Err(error) = self.storage.extend((chunk_no + 1) * CHUNK_SIZE) {
                    chunks.erase(chunk_no);
                    return Err(error);
                }
                chunk_no
            };
            bin.insert(chunk_no);
        }

        let chunk_no = bin.front().expect("the bin was just refilled");

        let mut chunks = self.lock_chunks();
        debug_assert!(!chunks.all_slots_marked(chunk_no));
        let slot_no = chunks.find_and_mark_slot(chunk_no);

        // A full chunk leaves the bin directory until a slot frees up.
        if chunks.all_slots_marked(chunk_no) {
            drop(chunks);
            bin.pop();
        }

        Ok(chunk_no * CHUNK_SIZE + slot_no * object_size)
    }

    fn allocate_large(&self, bin_no: BinNo) -> Result<usize> {
        let num_chunks = bins::num_chunks(bin_no);

        let mut chunks = self.lock_chunks();
        let head = chunks.insert_large(bin_no)?;
        if let Err(error) = self.storage.extend((head + num_chunks) * CHUNK_SIZE) {
            chunks.erase(head);
            return Err(error);
        }

        Ok(head * CHUNK_SIZE)
    }

    /// Returns one spilled cache block to the bins.  Failures here
    /// mean an offset was freed twice; there is nothing to unwind, so
    /// log and keep going.
    fn deallocate_small_block(&self, bin_no: BinNo, offsets: &[usize]) {
        for &offset in offsets {
            if let Err(error) = self.deallocate_small_direct(bin_no, offset) {
                warn!("Dropping cached offset {}: {}", offset, error);
            }
        }
    }

    fn deallocate_small_direct(&self, bin_no: BinNo, offset: usize) -> Result<()> {
        let object_size = bins::object_size(bin_no);
        let chunk_no = offset / CHUNK_SIZE;
        let slot_no = (offset % CHUNK_SIZE) / object_size;

        let mut bin = self.bin_directory.lock(bin_no);
        let mut chunks = self.lock_chunks();

        if chunks.kind(chunk_no) != ChunkKind::Small
            || chunks.bin_no(chunk_no) != bin_no
            || !chunks.slot_marked(chunk_no, slot_no)
        {
            return Err(Error::InvalidArgument("offset is not a live small allocation"));
        }

        let was_full = chunks.all_slots_marked(chunk_no);
        chunks.unmark_slot(chunk_no, slot_no);

        if was_full {
            drop(chunks);
            bin.insert(chunk_no);
        } else if chunks.all_slots_unmarked(chunk_no) {
            // The chunk is empty: back to the pool, and its backing
            // pages go back to the filesystem.
            chunks.erase(chunk_no);
            self.storage.free_region(chunk_no * CHUNK_SIZE, CHUNK_SIZE);
            drop(chunks);
            bin.erase(chunk_no);
        } else if let Some((range_begin, range_len)) = free_slot_range(&chunks, chunk_no, slot_no, object_size) {
            drop(chunks);
            self.storage.free_region(range_begin, range_len);
        }

        Ok(())
    }

    fn deallocate_large(&self, bin_no: BinNo, chunk_no: ChunkNo) -> Result<()> {
        let num_chunks = bins::num_chunks(bin_no);

        let mut chunks = self.lock_chunks();
        if chunks.kind(chunk_no) != ChunkKind::LargeHead {
            return Err(Error::InvalidArgument("offset is not a live large allocation"));
        }

        chunks.erase(chunk_no);
        self.storage.free_region(chunk_no * CHUNK_SIZE, num_chunks * CHUNK_SIZE);
        Ok(())
    }

    fn drain_cache(&self) {
        self.object_cache.drain(|bin_no, offsets| self.deallocate_small_block(bin_no, offsets));
    }
}

/// Page-aligned subrange of a freed slot that is safe to return to
/// the filesystem: it may extend over a neighbouring slot boundary
/// only when that neighbour is also free, and it shrinks inward when
/// the neighbour is live.  `None` when the class is too small to be
/// worth a hole-punch.
fn free_slot_range(
    chunks: &ChunkDirectory,
    chunk_no: ChunkNo,
    slot_no: usize,
    object_size: usize,
) -> Option<(usize, usize)> {
    let page_size = crate::map::page_size();
    let min_free_size = (2 * page_size).max(FREE_SMALL_OBJECT_SIZE_HINT);
    if object_size < min_free_size {
        return None;
    }
    debug_assert!(object_size <= CHUNK_SIZE / 2);

    let mut range_begin = chunk_no * CHUNK_SIZE + slot_no * object_size;
    if range_begin % page_size != 0 {
        debug_assert!(slot_no > 0);
        if chunks.slot_marked(chunk_no, slot_no - 1) {
            // The partial head page is shared with a live slot; it is
            // freed when that slot is.
            range_begin = round_up(range_begin, page_size);
        } else {
            range_begin = round_down(range_begin, page_size);
        }
    }

    let mut range_end = chunk_no * CHUNK_SIZE + (slot_no + 1) * object_size;
    if range_end % page_size != 0 {
        debug_assert!((slot_no + 1) * object_size < CHUNK_SIZE);
        if chunks.slot_marked(chunk_no, slot_no + 1) {
            range_end = round_down(range_end, page_size);
        } else {
            range_end = round_up(range_end, page_size);
        }
    }

    if range_begin >= range_end {
        return None;
    }
    debug_assert_eq!(range_begin / CHUNK_SIZE, chunk_no);
    debug_assert_eq!((range_end - 1) / CHUNK_SIZE, chunk_no);
    Some((range_begin, range_end - range_begin))
}

fn round_up(value: usize, unit: usize) -> usize {
    (value + unit - 1) / unit * unit
}

fn round_down(value: usize, unit: usize) -> usize {
    value / unit * unit
}
