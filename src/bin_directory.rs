//! Per-size-class directory of small chunks that still have a free
//! slot.  Each bin is guarded by its own mutex; the segment allocator
//! holds that lock across the paired chunk-directory operations, so
//! traffic in different bins never serializes.
//!
//! The in-bin order is LIFO by default (the front is the most
//! recently inserted chunk, which favours locality).  With the
//! `sorted_bins` feature the front is the lowest-numbered chunk,
//! which packs live data toward low addresses.
use std::io::BufRead;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::sync::MutexGuard;

#[cfg(not(feature = "sorted_bins"))]
use std::collections::VecDeque;

#[cfg(feature = "sorted_bins")]
use std::collections::BTreeSet;

use log::error;

use crate::bins;
use crate::bins::BinNo;
use crate::chunk_directory::ChunkNo;
use crate::error::Error;
use crate::error::Result;

#[derive(Default)]
pub struct Bin {
    #[cfg(not(feature = "sorted_bins"))]
    chunks: VecDeque<ChunkNo>,
    #[cfg(feature = "sorted_bins")]
    chunks: BTreeSet<ChunkNo>,
}

impl Bin {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// The bin's current chunk: most recently inserted (LIFO) or
    /// lowest numbered (sorted).
    pub fn front(&self) -> Option<ChunkNo> {
        #[cfg(not(feature = "sorted_bins"))]
        {
            self.chunks.front().copied()
        }
        #[cfg(feature = "sorted_bins")]
        {
            self.chunks.iter().next().copied()
        }
    }

    pub fn insert(&mut self, chunk_no: ChunkNo) {
        #[cfg(not(feature = "sorted_bins"))]
        self.chunks.push_front(chunk_no);
        #[cfg(feature = "sorted_bins")]
        self.chunks.insert(chunk_no);
    }

    /// Drops the front chunk (it became full).
    pub fn pop(&mut self) {
        #[cfg(not(feature = "sorted_bins"))]
        self.chunks.pop_front();
        #[cfg(feature = "sorted_bins")]
        {
            if let Some(first) = self.front() {
                self.chunks.remove(&first);
            }
        }
    }

    /// Removes `chunk_no` wherever it sits (it became empty and goes
    /// back to the chunk pool).
    pub fn erase(&mut self, chunk_no: ChunkNo) -> bool {
        #[cfg(not(feature = "sorted_bins"))]
        {
            if let Some(index) = self.chunks.iter().position(|&c| c == chunk_no) {
                self.chunks.remove(index);
                return true;
            }
            false
        }
        #[cfg(feature = "sorted_bins")]
        {
            self.chunks.remove(&chunk_no)
        }
    }

    fn iter(&self) -> impl Iterator<Item = &ChunkNo> {
        self.chunks.iter()
    }

    #[cfg(not(feature = "sorted_bins"))]
    fn insert_back(&mut self, chunk_no: ChunkNo) {
        self.chunks.push_back(chunk_no);
    }

    #[cfg(feature = "sorted_bins")]
    fn insert_back(&mut self, chunk_no: ChunkNo) {
        self.chunks.insert(chunk_no);
    }
}

pub struct BinDirectory {
    table: Vec<Mutex<Bin>>,
}

impl BinDirectory {
    pub fn new() -> Self {
        let mut table = Vec::with_capacity(bins::NUM_SMALL_BINS);
        table.resize_with(bins::NUM_SMALL_BINS, Default::default);
        BinDirectory { table }
    }

    /// Takes the bin's mutex.  The caller holds the guard across the
    /// chunk-directory calls for chunks owned by this bin; lock order
    /// is always bin before chunk directory.
    pub fn lock(&self, bin_no: BinNo) -> MutexGuard<'_, Bin> {
        assert!(bins::is_small(bin_no));
        self.table[bin_no as usize].lock().expect("bin mutex should not be poisoned")
    }

    /// One `bin_no chunk_no` line per entry, front to back, so the
    /// LIFO order survives a round trip.
    pub fn serialize(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path).map_err(|e| Error::io("create bin directory", path, e))?;
        let mut out = BufWriter::new(file);

        for (bin_no, bin) in self.table.iter().enumerate() {
            let bin = bin.lock().expect("bin mutex should not be poisoned");
            for chunk_no in bin.iter() {
                writeln!(out, "{} {}", bin_no, chunk_no).map_err(|e| Error::io("write bin directory", path, e))?;
            }
        }

        out.flush().map_err(|e| Error::io("flush bin directory", path, e))
    }

    pub fn deserialize(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::open(path).map_err(|e| Error::io("open bin directory", path, e))?;
        let reader = std::io::BufReader::new(file);

        for (line_no, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| Error::io("read bin directory", path, e))?;
            if line.trim().is_empty() {
                continue;
            }

            let mut fields = line.split_whitespace().map(|token| token.parse::<u64>());
            let entry = (fields.next(), fields.next());
            let (bin_no, chunk_no) = match entry {
                (Some(Ok(bin)), Some(Ok(chunk))) if bin < bins::NUM_SMALL_BINS as u64 => {
                    (bin as BinNo, chunk as ChunkNo)
                }
                _ => {
                    error!("Corrupt bin directory {} at line {}", path.display(), line_no + 1);
                    return Err(Error::Inconsistent(format!("bin directory: line {}", line_no + 1)));
                }
            };

            self.lock(bin_no).insert_back(chunk_no);
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[cfg(not(feature = "sorted_bins"))]
    #[test]
    fn front_is_most_recent() {
        let dir = BinDirectory::new();

        {
            let mut bin = dir.lock(1);
            bin.insert(4);
            bin.insert(9);
            bin.insert(2);
            assert_eq!(bin.front(), Some(2));
            bin.pop();
            assert_eq!(bin.front(), Some(9));
        }
    }

    #[cfg(feature = "sorted_bins")]
    #[test]
    fn front_is_lowest() {
        let dir = BinDirectory::new();

        {
            let mut bin = dir.lock(1);
            bin.insert(4);
            bin.insert(9);
            bin.insert(2);
            assert_eq!(bin.front(), Some(2));
            bin.pop();
            assert_eq!(bin.front(), Some(4));
        }
    }

    #[test]
    fn erase_removes_anywhere() {
        let dir = BinDirectory::new();
        let mut bin = dir.lock(0);

        bin.insert(1);
        bin.insert(2);
        bin.insert(3);

        assert!(bin.erase(2));
        assert!(!bin.erase(2));
        #[cfg(not(feature = "sorted_bins"))]
        assert_eq!(bin.front(), Some(3));
        #[cfg(feature = "sorted_bins")]
        assert_eq!(bin.front(), Some(1));
    }

    #[test]
    fn serialization_preserves_order() {
        let tmp = tempfile::tempdir().expect("tempdir should build");
        let path = tmp.path().join("bin_directory");

        let dir = BinDirectory::new();
        {
            let mut bin = dir.lock(0);
            bin.insert(7);
            bin.insert(3);
        }
        dir.lock(5).insert(11);

        dir.serialize(&path).expect("serialize should succeed");

        let reloaded = BinDirectory::new();
        reloaded.deserialize(&path).expect("deserialize should succeed");

        assert_eq!(reloaded.lock(0).front(), Some(3));
        assert_eq!(reloaded.lock(5).front(), Some(11));
        assert!(reloaded.lock(1).is_empty());

        {
            let mut bin = reloaded.lock(0);
            bin.pop();
            assert_eq!(bin.front(), Some(7));
        }
    }

    #[test]
    fn deserialization_rejects_corruption() {
        let tmp = tempfile::tempdir().expect("tempdir should build");

        for (i, case) in ["99 0\n", "0\n", "a b\n"].iter().enumerate() {
            let path = tmp.path().join(format!("bin_directory_{}", i));
            std::fs::write(&path, case).expect("write should succeed");

            let dir = BinDirectory::new();
            assert!(
                matches!(dir.deserialize(&path), Err(Error::Inconsistent(_))),
                "case {:?} should be rejected",
                case
            );
        }
    }
}
