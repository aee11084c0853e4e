//! Slot occupancy bitmap for small chunks.  A chunk with at most 64
//! slots stores its bitmap inline in one word; bigger chunks get a
//! tree of 64-bit blocks in breadth-first layout, where a bit in an
//! inner block is set iff the corresponding child block is full.  The
//! tree makes `find_and_set` O(depth) instead of a linear scan over
//! 2^18 bits.
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

const BITS_PER_BLOCK: usize = 64;
const FULL: u64 = !0u64;

/// The number of managed bits is always a power of two (slots per
/// chunk is `chunk_size / object_size`, both powers of two), so the
/// leaf layer of a tree always fills whole blocks and the spare bits
/// of the *leaf* layer stay zero.  Inner blocks whose trailing bits
/// map past the last child keep those bits pre-set so that a block
/// reads as full exactly when every real child is full.
pub enum MultilayerBitset {
    /// No storage; the chunk is not tracking slots.
    Empty,
    /// Up to 64 slots, stored in place.
    Word(u64),
    /// Breadth-first blocks: root layer first, leaves last.
    Tree(Box<[u64]>),
}

/// Sizes of each layer, root first, for a bit count that needs a tree.
fn layer_sizes(num_bits: usize) -> Vec<usize> {
    debug_assert!(num_bits > BITS_PER_BLOCK);
    debug_assert!(num_bits.is_power_of_two());

    let mut sizes = vec![num_bits / BITS_PER_BLOCK];
    while *sizes.last().expect("never empty") > 1 {
        let above = (sizes.last().expect("never empty") + BITS_PER_BLOCK - 1) / BITS_PER_BLOCK;
        sizes.push(above);
    }

    sizes.reverse();
    sizes
}

fn total_blocks(num_bits: usize) -> usize {
    layer_sizes(num_bits).iter().sum()
}

impl Default for MultilayerBitset {
    fn default() -> Self {
        MultilayerBitset::Empty
    }
}

impl MultilayerBitset {
    /// Allocates storage for `num_bits` bits, all clear.
    #[requires(num_bits >= 2 && num_bits.is_power_of_two())]
    pub fn allocate(num_bits: usize) -> Self {
        if num_bits <= BITS_PER_BLOCK {
            return MultilayerBitset::Word(0);
        }

        let sizes = layer_sizes(num_bits);
        let mut blocks = vec![0u64; sizes.iter().sum()].into_boxed_slice();

        // Pre-set the phantom bits of inner blocks: the last block of
        // a layer may have fewer than 64 children.
        let mut offset = 0;
        for layer in 0..sizes.len() - 1 {
            let children = sizes[layer + 1];
            let spare = children % BITS_PER_BLOCK;
            if spare != 0 {
                blocks[offset + sizes[layer] - 1] |= FULL << spare;
            }
            offset += sizes[layer];
        }

        MultilayerBitset::Tree(blocks)
    }

    /// Releases the storage.  Freeing an already-empty bitset is a
    /// no-op, so matched allocate/free pairs are idempotent.
    pub fn free(&mut self) {
        *self = MultilayerBitset::Empty;
    }

    /// Finds the smallest clear bit, sets it, and returns its index.
    /// Returns `None` when every bit is set.
    #[ensures(ret.is_some() -> ret.unwrap() < num_bits)]
    #[ensures(ret.is_some() -> self.get(num_bits, ret.unwrap()))]
    pub fn find_and_set(&mut self, num_bits: usize) -> Option<usize> {
        match self {
            MultilayerBitset::Empty => panic!("find_and_set on unallocated bitset"),
            MultilayerBitset::Word(word) => {
                let bit = (!*word).trailing_zeros() as usize;
                if bit >= num_bits {
                    return None;
                }
                *word |= 1u64 << bit;
                Some(bit)
            }
            MultilayerBitset::Tree(blocks) => {
                if blocks[0] == FULL {
                    return None;
                }

                let sizes = layer_sizes(num_bits);

                // Walk down, always taking the smallest clear bit.
                let mut offset = 0;
                let mut index = 0usize;
                for size in &sizes {
                    let block = blocks[offset + index];
                    debug_assert_ne!(block, FULL);
                    index = index * BITS_PER_BLOCK + (!block).trailing_zeros() as usize;
                    offset += size;
                }

                let bit = index;

                // Walk back up, marking blocks that became full.
                let mut offset = blocks.len();
                for layer in (0..sizes.len()).rev() {
                    offset -= sizes[layer];
                    let block = &mut blocks[offset + index / BITS_PER_BLOCK];
                    *block |= 1u64 << (index % BITS_PER_BLOCK);
                    if *block != FULL {
                        break;
                    }
                    index /= BITS_PER_BLOCK;
                }

                Some(bit)
            }
        }
    }

    /// Batch form of `find_and_set`: fills `out` with up to
    /// `out.len()` freshly set indices and returns how many were set.
    pub fn find_and_set_many(&mut self, num_bits: usize, out: &mut [usize]) -> usize {
        for (count, slot) in out.iter_mut().enumerate() {
            match self.find_and_set(num_bits) {
                Some(bit) => *slot = bit,
                None => return count,
            }
        }
        out.len()
    }

    /// Clears `bit_no` and propagates "no longer full" up the tree.
    #[requires(bit_no < num_bits)]
    pub fn reset(&mut self, num_bits: usize, bit_no: usize) {
        match self {
            MultilayerBitset::Empty => panic!("reset on unallocated bitset"),
            MultilayerBitset::Word(word) => {
                *word &= !(1u64 << bit_no);
            }
            MultilayerBitset::Tree(blocks) => {
                let sizes = layer_sizes(num_bits);

                let mut index = bit_no;
                let mut offset = blocks.len();
                for layer in (0..sizes.len()).rev() {
                    offset -= sizes[layer];
                    let block = &mut blocks[offset + index / BITS_PER_BLOCK];
                    let was_full = *block == FULL;
                    *block &= !(1u64 << (index % BITS_PER_BLOCK));
                    if !was_full {
                        break;
                    }
                    index /= BITS_PER_BLOCK;
                }
            }
        }
    }

    /// Reads `bit_no`.
    #[requires(bit_no < num_bits)]
    pub fn get(&self, num_bits: usize, bit_no: usize) -> bool {
        match self {
            MultilayerBitset::Empty => panic!("get on unallocated bitset"),
            MultilayerBitset::Word(word) => (*word >> bit_no) & 1 == 1,
            MultilayerBitset::Tree(blocks) => {
                let leaf_offset = blocks.len() - num_bits / BITS_PER_BLOCK;
                (blocks[leaf_offset + bit_no / BITS_PER_BLOCK] >> (bit_no % BITS_PER_BLOCK)) & 1 == 1
            }
        }
    }

    /// Space-separated decimal blocks, breadth-first layer order.
    pub fn serialize(&self, num_bits: usize) -> String {
        match self {
            MultilayerBitset::Empty => panic!("serialize on unallocated bitset"),
            MultilayerBitset::Word(word) => word.to_string(),
            MultilayerBitset::Tree(blocks) => {
                debug_assert_eq!(blocks.len(), total_blocks(num_bits));
                let words: Vec<String> = blocks.iter().map(|b| b.to_string()).collect();
                words.join(" ")
            }
        }
    }

    /// Parses the `serialize` format.  Returns `None` when the input
    /// does not hold exactly the right number of decimal words.
    pub fn deserialize(num_bits: usize, input: &str) -> Option<Self> {
        let mut words = Vec::new();
        for token in input.split_whitespace() {
            words.push(token.parse::<u64>().ok()?);
        }

        if num_bits <= BITS_PER_BLOCK {
            if words.len() != 1 {
                return None;
            }
            return Some(MultilayerBitset::Word(words[0]));
        }

        if words.len() != total_blocks(num_bits) {
            return None;
        }
        Some(MultilayerBitset::Tree(words.into_boxed_slice()))
    }

    /// Population count of the leaf layer; the number of set slots.
    pub fn count_set(&self, num_bits: usize) -> usize {
        match self {
            MultilayerBitset::Empty => 0,
            MultilayerBitset::Word(word) => word.count_ones() as usize,
            MultilayerBitset::Tree(blocks) => {
                let leaf_offset = blocks.len() - num_bits / BITS_PER_BLOCK;
                blocks[leaf_offset..].iter().map(|b| b.count_ones() as usize).sum()
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::collection::vec;
    use proptest::prelude::*;

    #[test]
    fn single_word_fills_in_order() {
        let mut bits = MultilayerBitset::allocate(16);

        for expected in 0..16 {
            assert_eq!(bits.find_and_set(16), Some(expected));
        }
        assert_eq!(bits.find_and_set(16), None);

        bits.reset(16, 5);
        bits.reset(16, 3);
        assert_eq!(bits.find_and_set(16), Some(3), "smallest free index wins");
        assert_eq!(bits.find_and_set(16), Some(5));
        assert_eq!(bits.find_and_set(16), None);
    }

    #[test]
    fn tree_fills_in_order() {
        const BITS: usize = 1 << 13;
        let mut bits = MultilayerBitset::allocate(BITS);

        for expected in 0..BITS {
            assert_eq!(bits.find_and_set(BITS), Some(expected));
        }
        assert_eq!(bits.find_and_set(BITS), None);

        // Free a scattering and watch them come back lowest-first.
        for &bit in &[4096usize, 17, 8000, 63, 64] {
            bits.reset(BITS, bit);
            assert!(!bits.get(BITS, bit));
        }
        assert_eq!(bits.find_and_set(BITS), Some(17));
        assert_eq!(bits.find_and_set(BITS), Some(63));
        assert_eq!(bits.find_and_set(BITS), Some(64));
        assert_eq!(bits.find_and_set(BITS), Some(4096));
        assert_eq!(bits.find_and_set(BITS), Some(8000));
        assert_eq!(bits.find_and_set(BITS), None);
    }

    #[test]
    fn deep_tree_round_trips_through_text() {
        // 2^18 bits is the worst case at the default chunk size:
        // 4096 leaf blocks, a 64-block middle layer, and one root.
        const BITS: usize = 1 << 18;
        let mut bits = MultilayerBitset::allocate(BITS);

        for _ in 0..1000 {
            bits.find_and_set(BITS).expect("should have room");
        }
        bits.reset(BITS, 123);

        let text = bits.serialize(BITS);
        let reloaded = MultilayerBitset::deserialize(BITS, &text).expect("should parse");

        for bit in 0..1100 {
            assert_eq!(bits.get(BITS, bit), reloaded.get(BITS, bit), "bit {}", bit);
        }
        assert_eq!(bits.count_set(BITS), reloaded.count_set(BITS));
    }

    #[test]
    fn deserialize_rejects_wrong_shapes() {
        assert!(MultilayerBitset::deserialize(64, "").is_none());
        assert!(MultilayerBitset::deserialize(64, "1 2").is_none());
        assert!(MultilayerBitset::deserialize(1 << 13, "42").is_none());
        assert!(MultilayerBitset::deserialize(64, "not-a-number").is_none());
        assert!(MultilayerBitset::deserialize(64, "123").is_some());
    }

    #[test]
    fn batch_find_stops_when_full() {
        let mut bits = MultilayerBitset::allocate(8);
        let mut out = [0usize; 12];

        assert_eq!(bits.find_and_set_many(8, &mut out), 8);
        assert_eq!(&out[..8], &[0, 1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(bits.find_and_set_many(8, &mut out), 0);
    }

    // Compare against a naive model under random set/reset traffic.
    proptest! {
        #[test]
        fn matches_naive_model(ops in vec((any::<bool>(), 0usize..512), 1..400)) {
            const BITS: usize = 512;
            let mut bits = MultilayerBitset::allocate(BITS);
            let mut model = [false; BITS];

            for (set, target) in ops {
                if set {
                    let expected = model.iter().position(|&b| !b);
                    let got = bits.find_and_set(BITS);
                    prop_assert_eq!(expected, got);
                    if let Some(bit) = got {
                        model[bit] = true;
                    }
                } else if model[target] {
                    bits.reset(BITS, target);
                    model[target] = false;
                }
            }

            for bit in 0..BITS {
                prop_assert_eq!(model[bit], bits.get(BITS, bit), "bit {}", bit);
            }
            prop_assert_eq!(bits.count_set(BITS), model.iter().filter(|&&b| b).count());
        }
    }
}
