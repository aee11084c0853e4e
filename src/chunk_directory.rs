//! Bookkeeping for every chunk in the segment: whether it is empty,
//! subdivided into small-object slots, or part of a large-object run.
//! The table grows on demand and is serialized to one text line per
//! non-empty chunk at close.
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

use std::io::BufRead;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;

use log::error;

use crate::bins;
use crate::bins::BinNo;
use crate::error::Error;
use crate::error::Result;
use crate::multilayer_bitset::MultilayerBitset;

pub type ChunkNo = usize;
pub type SlotNo = usize;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChunkKind {
    Empty,
    Small,
    LargeHead,
    LargeTail,
}

impl ChunkKind {
    fn to_wire(self) -> u64 {
        match self {
            // Empty chunks are never serialized.
            ChunkKind::Empty => 0,
            ChunkKind::Small => 1,
            ChunkKind::LargeHead => 2,
            ChunkKind::LargeTail => 3,
        }
    }

    fn from_wire(value: u64) -> Option<Self> {
        match value {
            1 => Some(ChunkKind::Small),
            2 => Some(ChunkKind::LargeHead),
            3 => Some(ChunkKind::LargeTail),
            _ => None,
        }
    }
}

struct Entry {
    bin_no: BinNo,
    kind: ChunkKind,
    occupied_slots: u32,
    slot_occupancy: MultilayerBitset,
}

impl Entry {
    fn empty() -> Self {
        Entry {
            bin_no: 0,
            kind: ChunkKind::Empty,
            occupied_slots: 0,
            slot_occupancy: MultilayerBitset::Empty,
        }
    }
}

pub struct ChunkDirectory {
    table: Vec<Entry>,
    max_chunks: usize,
}

impl ChunkDirectory {
    pub fn new(max_chunks: usize) -> Self {
        ChunkDirectory {
            table: Vec::new(),
            max_chunks,
        }
    }

    /// Number of chunks the table currently spans (including interior
    /// empties).  The segment must be at least this many chunks long.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    fn entry_kind(&self, chunk_no: ChunkNo) -> ChunkKind {
        self.table.get(chunk_no).map_or(ChunkKind::Empty, |e| e.kind)
    }

    fn grow_to(&mut self, len: usize) {
        debug_assert!(len <= self.max_chunks);
        while self.table.len() < len {
            self.table.push(Entry::empty());
        }
    }

    /// Claims the lowest-numbered empty chunk for small objects of
    /// class `bin_no` and sizes its slot bitmap.
    #[requires(bins::is_small(bin_no))]
    #[ensures(ret.is_ok() -> self.kind(*ret.as_ref().unwrap()) == ChunkKind::Small)]
    pub fn insert_small(&mut self, bin_no: BinNo) -> Result<ChunkNo> {
        let num_slots = bins::num_slots(bin_no);

        let chunk_no = match self.table.iter().position(|e| e.kind == ChunkKind::Empty) {
            Some(hole) => hole,
            None if self.table.len() < self.max_chunks => {
                self.table.push(Entry::empty());
                self.table.len() - 1
            }
            None => return Err(Error::CapacityExceeded("all chunks are occupied")),
        };

        let entry = &mut self.table[chunk_no];
        entry.bin_no = bin_no;
        entry.kind = ChunkKind::Small;
        entry.occupied_slots = 0;
        entry.slot_occupancy = MultilayerBitset::allocate(num_slots);
        Ok(chunk_no)
    }

    /// Claims the lowest-numbered run of `⌈object_size/chunk_size⌉`
    /// consecutive empty chunks for class `bin_no` and returns the
    /// head.
    #[requires(!bins::is_small(bin_no))]
    pub fn insert_large(&mut self, bin_no: BinNo) -> Result<ChunkNo> {
        let num_chunks = bins::num_chunks(bin_no);
        debug_assert!(num_chunks >= 1);

        let mut run = 0usize;
        let mut head = None;
        for chunk_no in 0..self.max_chunks {
            if self.entry_kind(chunk_no) != ChunkKind::Empty {
                run = 0;
                continue;
            }
            run += 1;
            if run == num_chunks {
                head = Some(chunk_no + 1 - num_chunks);
                break;
            }
        }

        let head = head.ok_or(Error::CapacityExceeded("no chunk run long enough"))?;

        self.grow_to(head + num_chunks);
        self.table[head].bin_no = bin_no;
        self.table[head].kind = ChunkKind::LargeHead;
        for offset in 1..num_chunks {
            self.table[head + offset].bin_no = bin_no;
            self.table[head + offset].kind = ChunkKind::LargeTail;
        }
        Ok(head)
    }

    /// Marks the lowest free slot of small chunk `chunk_no` and
    /// returns its index.  The caller must know a free slot exists.
    #[requires(self.kind(chunk_no) == ChunkKind::Small)]
    #[requires(!self.all_slots_marked(chunk_no))]
    pub fn find_and_mark_slot(&mut self, chunk_no: ChunkNo) -> SlotNo {
        let entry = &mut self.table[chunk_no];
        assert_eq!(entry.kind, ChunkKind::Small);

        let num_slots = bins::num_slots(entry.bin_no);
        let slot = entry
            .slot_occupancy
            .find_and_set(num_slots)
            .expect("caller checked the chunk is not full");
        entry.occupied_slots += 1;
        slot
    }

    /// Batch form of `find_and_mark_slot`: marks up to `out.len()`
    /// free slots and returns how many were marked.  Used by the
    /// object cache to refill a block under one lock acquisition.
    #[requires(self.kind(chunk_no) == ChunkKind::Small)]
    pub fn find_and_mark_slots(&mut self, chunk_no: ChunkNo, out: &mut [SlotNo]) -> usize {
        let entry = &mut self.table[chunk_no];
        assert_eq!(entry.kind, ChunkKind::Small);

        let num_slots = bins::num_slots(entry.bin_no);
        let marked = entry.slot_occupancy.find_and_set_many(num_slots, out);
        entry.occupied_slots += marked as u32;
        marked
    }

    /// Clears a slot previously handed out by `find_and_mark_slot`.
    #[requires(self.kind(chunk_no) == ChunkKind::Small)]
    #[requires(self.slot_marked(chunk_no, slot_no))]
    pub fn unmark_slot(&mut self, chunk_no: ChunkNo, slot_no: SlotNo) {
        let entry = &mut self.table[chunk_no];
        assert_eq!(entry.kind, ChunkKind::Small);
        assert!(entry.occupied_slots > 0);

        let num_slots = bins::num_slots(entry.bin_no);
        entry.slot_occupancy.reset(num_slots, slot_no);
        entry.occupied_slots -= 1;
    }

    /// Returns a chunk (small) or a whole run (large head) to the
    /// empty pool.
    #[ensures(self.kind(chunk_no) == ChunkKind::Empty)]
    pub fn erase(&mut self, chunk_no: ChunkNo) {
        match self.entry_kind(chunk_no) {
            ChunkKind::Empty => (),
            ChunkKind::Small => {
                let entry = &mut self.table[chunk_no];
                entry.kind = ChunkKind::Empty;
                entry.occupied_slots = 0;
                entry.slot_occupancy.free();
            }
            ChunkKind::LargeHead => {
                self.table[chunk_no].kind = ChunkKind::Empty;
                let mut next = chunk_no + 1;
                while next < self.table.len() && self.table[next].kind == ChunkKind::LargeTail {
                    self.table[next].kind = ChunkKind::Empty;
                    next += 1;
                }
            }
            ChunkKind::LargeTail => panic!("erase must target the head of a large run"),
        }
    }

    pub fn kind(&self, chunk_no: ChunkNo) -> ChunkKind {
        self.entry_kind(chunk_no)
    }

    #[requires(self.kind(chunk_no) != ChunkKind::Empty)]
    pub fn bin_no(&self, chunk_no: ChunkNo) -> BinNo {
        self.table[chunk_no].bin_no
    }

    #[requires(self.kind(chunk_no) == ChunkKind::Small)]
    pub fn all_slots_marked(&self, chunk_no: ChunkNo) -> bool {
        let entry = &self.table[chunk_no];
        entry.occupied_slots as usize == bins::num_slots(entry.bin_no)
    }

    #[requires(self.kind(chunk_no) == ChunkKind::Small)]
    pub fn all_slots_unmarked(&self, chunk_no: ChunkNo) -> bool {
        self.table[chunk_no].occupied_slots == 0
    }

    #[requires(self.kind(chunk_no) == ChunkKind::Small)]
    pub fn slot_marked(&self, chunk_no: ChunkNo, slot_no: SlotNo) -> bool {
        let entry = &self.table[chunk_no];
        entry.slot_occupancy.get(bins::num_slots(entry.bin_no), slot_no)
    }

    #[requires(self.kind(chunk_no) == ChunkKind::Small)]
    pub fn occupied_slots(&self, chunk_no: ChunkNo) -> usize {
        self.table[chunk_no].occupied_slots as usize
    }

    /// One line per non-empty chunk:
    /// `chunk_no bin_no kind [occupied_slots bitset...]`.
    pub fn serialize(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path).map_err(|e| Error::io("create chunk directory", path, e))?;
        let mut out = BufWriter::new(file);

        for (chunk_no, entry) in self.table.iter().enumerate() {
            let result = match entry.kind {
                ChunkKind::Empty => continue,
                ChunkKind::Small => writeln!(
                    out,
                    "{} {} {} {} {}",
                    chunk_no,
                    entry.bin_no,
                    entry.kind.to_wire(),
                    entry.occupied_slots,
                    entry.slot_occupancy.serialize(bins::num_slots(entry.bin_no)),
                ),
                ChunkKind::LargeHead | ChunkKind::LargeTail => {
                    writeln!(out, "{} {} {}", chunk_no, entry.bin_no, entry.kind.to_wire())
                }
            };
            result.map_err(|e| Error::io("write chunk directory", path, e))?;
        }

        out.flush().map_err(|e| Error::io("flush chunk directory", path, e))
    }

    /// Rebuilds the table from the `serialize` format, validating
    /// every line; any malformed input fails the whole load.
    pub fn deserialize(&mut self, path: &Path) -> Result<()> {
        let file = std::fs::File::open(path).map_err(|e| Error::io("open chunk directory", path, e))?;
        let reader = std::io::BufReader::new(file);

        let corrupt = |what: &str, line_no: usize| {
            error!("Corrupt chunk directory {}: {} at line {}", path.display(), what, line_no + 1);
            Error::Inconsistent(format!("chunk directory: {} at line {}", what, line_no + 1))
        };

        for (line_no, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| Error::io("read chunk directory", path, e))?;
            if line.trim().is_empty() {
                continue;
            }

            let mut fields = line.split_whitespace();
            let mut next_u64 = |what: &str| -> Result<u64> {
                fields
                    .next()
                    .and_then(|token| token.parse::<u64>().ok())
                    .ok_or_else(|| corrupt(what, line_no))
            };

            let chunk_no = next_u64("chunk number")? as usize;
            let raw_bin = next_u64("bin number")?;
            if raw_bin > u32::MAX as u64 {
                return Err(corrupt("bin number", line_no));
            }
            let bin_no = raw_bin as BinNo;
            let kind = ChunkKind::from_wire(next_u64("chunk kind")?).ok_or_else(|| corrupt("chunk kind", line_no))?;

            if chunk_no >= self.max_chunks {
                return Err(corrupt("chunk number beyond capacity", line_no));
            }
            self.grow_to(chunk_no + 1);
            if self.table[chunk_no].kind != ChunkKind::Empty {
                return Err(corrupt("duplicate chunk number", line_no));
            }

            let entry = &mut self.table[chunk_no];
            entry.bin_no = bin_no;
            entry.kind = kind;

            if kind == ChunkKind::Small {
                if !bins::is_small(bin_no) {
                    return Err(corrupt("large class on a small chunk", line_no));
                }
                let num_slots = bins::num_slots(bin_no);

                let occupied = next_u64("occupied slot count")?;
                if occupied as usize > num_slots {
                    return Err(corrupt("occupied slot count beyond capacity", line_no));
                }

                let rest: Vec<&str> = fields.collect();
                let occupancy = MultilayerBitset::deserialize(num_slots, &rest.join(" "))
                    .ok_or_else(|| corrupt("slot bitmap", line_no))?;
                if occupancy.count_set(num_slots) != occupied as usize {
                    return Err(corrupt("slot bitmap does not match occupied count", line_no));
                }

                let entry = &mut self.table[chunk_no];
                entry.occupied_slots = occupied as u32;
                entry.slot_occupancy = occupancy;
            } else if bins::is_small(bin_no) {
                return Err(corrupt("small class on a large chunk", line_no));
            }
        }

        // A tail must continue a run.
        for chunk_no in 0..self.table.len() {
            if self.table[chunk_no].kind == ChunkKind::LargeTail {
                let prev = chunk_no.checked_sub(1).map(|p| self.table[p].kind);
                if prev != Some(ChunkKind::LargeHead) && prev != Some(ChunkKind::LargeTail) {
                    return Err(corrupt("orphan large tail", chunk_no));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::CHUNK_SIZE;

    #[test]
    fn small_chunks_fill_lowest_first() {
        let mut dir = ChunkDirectory::new(16);

        let a = dir.insert_small(0).expect("should insert");
        let b = dir.insert_small(3).expect("should insert");
        assert_eq!((a, b), (0, 1));

        dir.erase(a);
        let c = dir.insert_small(1).expect("should insert");
        assert_eq!(c, 0, "erased chunk is reused first");
        assert_eq!(dir.bin_no(c), 1);
    }

    #[test]
    fn slot_marking_round_trip() {
        let mut dir = ChunkDirectory::new(4);
        let bin = crate::bins::bin_of(CHUNK_SIZE / 2).expect("largest small class");
        let chunk = dir.insert_small(bin).expect("should insert");

        assert!(dir.all_slots_unmarked(chunk));
        let s0 = dir.find_and_mark_slot(chunk);
        let s1 = dir.find_and_mark_slot(chunk);
        assert_eq!((s0, s1), (0, 1));
        assert!(dir.all_slots_marked(chunk), "two slots fill the largest class");

        dir.unmark_slot(chunk, 0);
        assert!(dir.slot_marked(chunk, 1));
        assert!(!dir.slot_marked(chunk, 0));
        assert_eq!(dir.find_and_mark_slot(chunk), 0);
    }

    #[test]
    fn large_runs_are_contiguous() {
        let mut dir = ChunkDirectory::new(16);
        let three = crate::bins::bin_of(3 * CHUNK_SIZE).expect("three-chunk class");

        let head = dir.insert_large(three).expect("should insert");
        assert_eq!(head, 0);
        assert_eq!(dir.kind(0), ChunkKind::LargeHead);
        assert_eq!(dir.kind(1), ChunkKind::LargeTail);
        assert_eq!(dir.kind(2), ChunkKind::LargeTail);
        assert_eq!(dir.kind(3), ChunkKind::Empty);

        // A second run lands after the first.
        let head2 = dir.insert_large(three).expect("should insert");
        assert_eq!(head2, 3);

        // Freeing the first leaves a hole the next run reuses.
        dir.erase(head);
        assert_eq!(dir.kind(1), ChunkKind::Empty);
        assert_eq!(dir.insert_large(three).expect("should insert"), 0);
    }

    #[test]
    fn runs_skip_too_small_holes() {
        let mut dir = ChunkDirectory::new(16);
        let one = crate::bins::bin_of(CHUNK_SIZE).expect("one-chunk class");
        let two = crate::bins::bin_of(2 * CHUNK_SIZE).expect("two-chunk class");

        let a = dir.insert_large(one).expect("should insert");
        let _b = dir.insert_large(one).expect("should insert");
        let c = dir.insert_large(one).expect("should insert");
        let _d = dir.insert_large(one).expect("should insert");
        dir.erase(a);
        dir.erase(c);

        // Holes at 0 and 2 are one chunk each; a two-chunk run must
        // go to the end.
        assert_eq!(dir.insert_large(two).expect("should insert"), 4);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut dir = ChunkDirectory::new(2);
        let three = crate::bins::bin_of(3 * CHUNK_SIZE).expect("three-chunk class");

        assert!(matches!(dir.insert_large(three), Err(Error::CapacityExceeded(_))));

        dir.insert_small(0).expect("should insert");
        dir.insert_small(0).expect("should insert");
        assert!(matches!(dir.insert_small(0), Err(Error::CapacityExceeded(_))));
    }

    #[test]
    fn serialization_round_trips() {
        let tmp = tempfile::tempdir().expect("tempdir should build");
        let path = tmp.path().join("chunk_directory");

        let mut dir = ChunkDirectory::new(64);
        let small = dir.insert_small(2).expect("should insert");
        for _ in 0..5 {
            dir.find_and_mark_slot(small);
        }
        dir.unmark_slot(small, 3);
        let three = crate::bins::bin_of(3 * CHUNK_SIZE).expect("three-chunk class");
        let large = dir.insert_large(three).expect("should insert");

        dir.serialize(&path).expect("serialize should succeed");

        let mut reloaded = ChunkDirectory::new(64);
        reloaded.deserialize(&path).expect("deserialize should succeed");

        assert_eq!(reloaded.kind(small), ChunkKind::Small);
        assert_eq!(reloaded.bin_no(small), 2);
        assert_eq!(reloaded.occupied_slots(small), 4);
        assert!(!reloaded.slot_marked(small, 3));
        assert!(reloaded.slot_marked(small, 4));
        assert_eq!(reloaded.kind(large), ChunkKind::LargeHead);
        assert_eq!(reloaded.kind(large + 1), ChunkKind::LargeTail);
        assert_eq!(reloaded.kind(large + 2), ChunkKind::LargeTail);

        // The next slot allocated matches the pre-reload state.
        assert_eq!(reloaded.find_and_mark_slot(small), 3);
    }

    #[test]
    fn deserialization_rejects_corruption() {
        let tmp = tempfile::tempdir().expect("tempdir should build");

        // Bin 17 is the largest small class (two slots, one bitmap
        // word), which keeps the fixtures short.
        let cases: &[&str] = &[
            "0 0 9\n",                  // bad kind
            "0 0 1 5\n",                // missing bitmap
            "0 17 1 2 1\n",             // popcount mismatch
            "0 99 1 0 0\n",             // large class on small chunk
            "5 18 3\n",                 // orphan tail
            "0 17 1 0 0\n0 17 1 0 0\n", // duplicate chunk
            "junk\n",
        ];

        for (i, case) in cases.iter().enumerate() {
            let path = tmp.path().join(format!("chunk_directory_{}", i));
            std::fs::write(&path, case).expect("write should succeed");

            let mut dir = ChunkDirectory::new(64);
            assert!(
                matches!(dir.deserialize(&path), Err(Error::Inconsistent(_))),
                "case {} should be rejected: {:?}",
                i,
                case
            );
        }
    }
}
