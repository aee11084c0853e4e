//! Per-CPU caches of small-object offsets.  Each cache is a per-bin
//! LIFO refilled from (and spilled back to) the segment allocator in
//! fixed-size blocks.  The cache only holds offsets that are already
//! allocated in the chunk directory, so it never changes persistent
//! state; draining it before serialization returns every cached
//! offset through the ordinary deallocation path.
use std::collections::hash_map::DefaultHasher;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Mutex;

use crate::bins;
use crate::bins::BinNo;
use crate::error::Result;

/// Offsets move between the cache and the allocator in blocks of
/// this many.
pub const CACHE_BLOCK_SIZE: usize = 8;

/// Cap on the bytes one cache may hold for one bin.
const MAX_TOTAL_CACHE_SIZE_PER_BIN: usize = 1 << 20;

/// Objects bigger than this bypass the cache entirely.
const MAX_CACHED_OBJECT_SIZE: usize = MAX_TOTAL_CACHE_SIZE_PER_BIN / CACHE_BLOCK_SIZE / 2;

/// Caches per hardware thread; extra slots dilute collisions between
/// threads that hash to the same cache.
const CACHES_PER_CPU: usize = 8;

fn num_cached_bins() -> usize {
    (0..bins::NUM_SMALL_BINS as BinNo)
        .filter(|&bin| bins::object_size(bin) <= MAX_CACHED_OBJECT_SIZE)
        .count()
}

struct LocalCache {
    /// One LIFO of offsets per cached bin.
    per_bin: Vec<Vec<usize>>,
}

impl LocalCache {
    fn new() -> Self {
        LocalCache {
            per_bin: (0..num_cached_bins()).map(|_| Vec::new()).collect(),
        }
    }
}

pub struct ObjectCache {
    table: Vec<Mutex<LocalCache>>,
}

impl ObjectCache {
    pub fn new() -> Self {
        let num_caches = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            * CACHES_PER_CPU;

        ObjectCache {
            table: (0..num_caches).map(|_| Mutex::new(LocalCache::new())).collect(),
        }
    }

    fn cacheable(&self, bin_no: BinNo) -> bool {
        (bin_no as usize) < num_cached_bins()
    }

    fn cache_index(&self) -> usize {
        let mut hasher = DefaultHasher::new();
        current_cpu().hash(&mut hasher);
        (hasher.finish() as usize) % self.table.len()
    }

    /// Pops a cached offset for `bin_no`, refilling one block through
    /// `refill` when the cache runs dry.  Returns `Ok(None)` when the
    /// bin is not cacheable; the caller then goes to the allocator
    /// directly.
    pub fn get(
        &self,
        bin_no: BinNo,
        refill: impl FnOnce(BinNo, usize, &mut Vec<usize>) -> Result<()>,
    ) -> Result<Option<usize>> {
        if !self.cacheable(bin_no) {
            return Ok(None);
        }

        let mut cache = self.table[self.cache_index()].lock().expect("cache mutex should not be poisoned");
        let stack = &mut cache.per_bin[bin_no as usize];

        if stack.is_empty() {
            // Keep whatever a partial refill produced: failing the
            // request while holding usable offsets would leak them.
            let result = refill(bin_no, CACHE_BLOCK_SIZE, stack);
            if stack.is_empty() {
                result?;
                return Ok(None);
            }
        }

        Ok(stack.pop())
    }

    /// Pushes a freed offset for `bin_no`.  When the bin's cache
    /// overflows, one block of the most recently freed offsets is
    /// spilled through `flush`.  Returns false when the bin is not
    /// cacheable and the caller must deallocate directly.
    pub fn insert(&self, bin_no: BinNo, offset: usize, flush: impl FnOnce(BinNo, &[usize])) -> bool {
        if !self.cacheable(bin_no) {
            return false;
        }

        let mut cache = self.table[self.cache_index()].lock().expect("cache mutex should not be poisoned");
        let stack = &mut cache.per_bin[bin_no as usize];
        stack.push(offset);

        if stack.len() * bins::object_size(bin_no) >= MAX_TOTAL_CACHE_SIZE_PER_BIN {
            debug_assert!(stack.len() >= CACHE_BLOCK_SIZE);
            let spill: Vec<usize> = stack.drain(stack.len() - CACHE_BLOCK_SIZE..).collect();
            flush(bin_no, &spill);
        }

        true
    }

    /// Returns every cached offset through `flush`.  Called before
    /// the allocator serializes so that no offset is recorded as live
    /// merely because it sat in a cache.
    pub fn drain(&self, mut flush: impl FnMut(BinNo, &[usize])) {
        for entry in &self.table {
            let mut cache = entry.lock().expect("cache mutex should not be poisoned");
            for (bin_no, stack) in cache.per_bin.iter_mut().enumerate() {
                if !stack.is_empty() {
                    flush(bin_no as BinNo, stack);
                    stack.clear();
                }
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn current_cpu() -> usize {
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu >= 0 {
        cpu as usize
    } else {
        fallback_cpu()
    }
}

#[cfg(not(target_os = "linux"))]
fn current_cpu() -> usize {
    fallback_cpu()
}

fn fallback_cpu() -> usize {
    let mut hasher = DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish() as usize
}

#[cfg(test)]
mod test {
    use super::*;

    // The cache is keyed on the current CPU; pin the test thread so a
    // migration cannot land us in a different cache mid-test.
    #[cfg(target_os = "linux")]
    fn pin_thread() {
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            libc::CPU_SET(0, &mut set);
            libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn pin_thread() {
        // The fallback cache index hashes the thread id, which is
        // already stable.
    }

    #[test]
    fn refills_in_blocks_and_serves_lifo() {
        pin_thread();
        let cache = ObjectCache::new();
        let mut next = 0usize;

        let mut grab = |cache: &ObjectCache| {
            cache
                .get(0, |_bin, count, out| {
                    for _ in 0..count {
                        out.push(next);
                        next += 8;
                    }
                    Ok(())
                })
                .expect("refill should succeed")
                .expect("bin 0 is cacheable")
        };

        // The first pull fills a whole block and serves its top.
        let first = grab(&cache);
        assert_eq!(first, (CACHE_BLOCK_SIZE - 1) * 8);

        // The rest of the block drains without refilling.
        for i in (0..CACHE_BLOCK_SIZE - 1).rev() {
            assert_eq!(grab(&cache), i * 8);
        }
    }

    #[test]
    fn freed_offsets_come_back_first() {
        pin_thread();
        let cache = ObjectCache::new();

        assert!(cache.insert(0, 1234, |_, _| panic!("no overflow expected")));
        let got = cache
            .get(0, |_, _, _| panic!("no refill expected"))
            .expect("get should succeed");
        assert_eq!(got, Some(1234));
    }

    #[test]
    fn uncacheable_bins_pass_through() {
        let cache = ObjectCache::new();
        let big_bin = (bins::NUM_SMALL_BINS - 1) as BinNo;

        assert!(!cache.insert(big_bin, 0, |_, _| panic!("must not flush")));
        assert_eq!(
            cache.get(big_bin, |_, _, _| panic!("must not refill")).expect("should succeed"),
            None
        );
    }

    #[test]
    fn overflow_spills_one_block() {
        pin_thread();
        let cache = ObjectCache::new();
        let bin = (num_cached_bins() - 1) as BinNo;
        let object_size = bins::object_size(bin);
        let cap = MAX_TOTAL_CACHE_SIZE_PER_BIN / object_size;

        let mut spilled: Vec<usize> = Vec::new();
        for i in 0..cap {
            cache.insert(bin, i * object_size, |_, block| spilled.extend_from_slice(block));
        }

        assert_eq!(spilled.len(), CACHE_BLOCK_SIZE, "exactly one block spills at the cap");
        // The spilled block is the most recently freed run.
        assert!(spilled.contains(&((cap - 1) * object_size)));
    }

    #[test]
    fn drain_empties_everything() {
        pin_thread();
        let cache = ObjectCache::new();

        for i in 0..5 {
            cache.insert(0, i * 8, |_, _| panic!("no overflow expected"));
        }
        cache.insert(1, 160, |_, _| panic!("no overflow expected"));

        let mut returned: Vec<(BinNo, usize)> = Vec::new();
        cache.drain(|bin, offsets| {
            for &offset in offsets {
                returned.push((bin, offset));
            }
        });

        assert_eq!(returned.len(), 6);
        cache.drain(|_, _| panic!("drained cache must be empty"));
    }
}
