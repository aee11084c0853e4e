//! Permafrost is a file-backed persistent memory allocator: a
//! datastore directory holds a segment (a sequence of sparse block
//! files mapped contiguously) plus the allocator's own metadata, and
//! after a clean close a later process reopens the segment and finds
//! every allocation at the same offset.  Persisted data structures
//! reference each other with self-relative [`OffsetPtr`]s instead of
//! raw pointers, so they survive the segment moving between runs.
mod bin_directory;
mod bins;
mod chunk_directory;
mod config;
mod error;
mod file_ops;
mod manager;
mod map;
mod multilayer_bitset;
mod named_object_directory;
mod object_cache;
mod offset_ptr;
mod segment_allocator;
mod segment_header;
mod segment_storage;

pub use config::CHUNK_SIZE;
pub use config::DEFAULT_VM_RESERVE_SIZE;
pub use config::INITIAL_SEGMENT_SIZE;
pub use config::MAX_SEGMENT_SIZE;
pub use error::Error;
pub use error::Result;
pub use manager::Manager;
pub use manager::DATASTORE_VERSION;
pub use named_object_directory::Entry as NamedObjectEntry;
pub use offset_ptr::OffsetPtr;
pub use segment_header::SegmentHeader;
