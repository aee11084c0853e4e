//! Size classes.  Small bins are powers of two from the minimum
//! object size up to half a chunk; their objects share a chunk,
//! subdivided into slots.  Large bins hold one class per chunk count,
//! so a large allocation consumes exactly the chunks it needs.
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

use crate::config::CHUNK_SIZE;
use crate::config::MAX_SEGMENT_SIZE;
use crate::config::MIN_OBJECT_SIZE;

pub type BinNo = u32;

/// Number of small bins: 8, 16, ..., `CHUNK_SIZE / 2`.
pub const NUM_SMALL_BINS: usize = (CHUNK_SIZE.trailing_zeros() - MIN_OBJECT_SIZE.trailing_zeros()) as usize;

pub fn is_small(bin_no: BinNo) -> bool {
    (bin_no as usize) < NUM_SMALL_BINS
}

/// Maps a request to the smallest class that fits.  A zero-byte
/// request maps to bin 0: the caller gets a real, distinguishable
/// allocation that deallocation accepts.  Requests above the maximum
/// segment size have no class.
#[ensures(ret.is_some() -> object_size(ret.unwrap()) >= nbytes,
          "The class covers the request.")]
#[ensures(ret.is_some() -> nbytes <= MAX_SEGMENT_SIZE)]
pub fn bin_of(nbytes: usize) -> Option<BinNo> {
    if nbytes > MAX_SEGMENT_SIZE {
        return None;
    }

    if nbytes <= CHUNK_SIZE / 2 {
        let rounded = nbytes.max(MIN_OBJECT_SIZE).next_power_of_two();
        Some((rounded.trailing_zeros() - MIN_OBJECT_SIZE.trailing_zeros()) as BinNo)
    } else {
        let num_chunks = (nbytes + CHUNK_SIZE - 1) / CHUNK_SIZE;
        Some((NUM_SMALL_BINS + num_chunks - 1) as BinNo)
    }
}

/// The object size served by a class.
pub fn object_size(bin_no: BinNo) -> usize {
    if is_small(bin_no) {
        MIN_OBJECT_SIZE << bin_no
    } else {
        num_chunks(bin_no) * CHUNK_SIZE
    }
}

/// Alignment guaranteed for offsets handed out of a class.
pub fn alignment(bin_no: BinNo) -> usize {
    if is_small(bin_no) {
        object_size(bin_no)
    } else {
        CHUNK_SIZE
    }
}

/// Slots per chunk for a small class.
#[requires(is_small(bin_no))]
#[ensures(ret >= 2, "Even the largest small class splits a chunk in two.")]
pub fn num_slots(bin_no: BinNo) -> usize {
    CHUNK_SIZE / object_size(bin_no)
}

/// Whole chunks consumed by a large class.
#[requires(!is_small(bin_no))]
pub fn num_chunks(bin_no: BinNo) -> usize {
    bin_no as usize - NUM_SMALL_BINS + 1
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn small_bins_cover_powers_of_two() {
        assert_eq!(bin_of(0), Some(0));
        assert_eq!(bin_of(1), Some(0));
        assert_eq!(bin_of(8), Some(0));
        assert_eq!(bin_of(9), Some(1));
        assert_eq!(bin_of(16), Some(1));
        assert_eq!(bin_of(CHUNK_SIZE / 2), Some((NUM_SMALL_BINS - 1) as BinNo));

        for bin in 0..NUM_SMALL_BINS as BinNo {
            assert!(is_small(bin));
            assert_eq!(object_size(bin), MIN_OBJECT_SIZE << bin);
            assert_eq!(bin_of(object_size(bin)), Some(bin));
        }
    }

    #[test]
    fn large_bins_count_chunks() {
        // One byte over half a chunk still needs a whole chunk.
        let first_large = bin_of(CHUNK_SIZE / 2 + 1).expect("should have a class");
        assert!(!is_small(first_large));
        assert_eq!(num_chunks(first_large), 1);
        assert_eq!(object_size(first_large), CHUNK_SIZE);

        // 5 MiB at the default chunk size needs 3 chunks.
        let five_mib = bin_of(5 << 20).expect("should have a class");
        assert_eq!(num_chunks(five_mib), 3);
        assert_eq!(object_size(five_mib), 3 * CHUNK_SIZE);

        assert_eq!(bin_of(CHUNK_SIZE), Some(first_large));
        assert_eq!(bin_of(CHUNK_SIZE + 1).map(num_chunks), Some(2));
    }

    #[test]
    fn oversized_requests_have_no_class() {
        assert_eq!(bin_of(MAX_SEGMENT_SIZE + 1), None);
        assert!(bin_of(MAX_SEGMENT_SIZE).is_some());
    }

    #[test]
    fn alignment_divides_object_size() {
        for &size in &[1usize, 8, 24, 100, 4096, CHUNK_SIZE / 2, CHUNK_SIZE, 5 << 20] {
            let bin = bin_of(size).expect("should have a class");
            assert_eq!(object_size(bin) % alignment(bin), 0);
            assert!(object_size(bin) >= size);
        }
    }
}
