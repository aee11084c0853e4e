//! The manager owns one datastore: the segment storage and allocator,
//! the named-object directory, and the management metadata.  It
//! drives the lifecycle (create / open / close / snapshot / copy /
//! remove) and enforces the crash-consistency protocol: the
//! properly-closed mark is removed when a writable open succeeds and
//! written back, last, by a clean close, so a crash leaves the mark
//! absent and the next open refuses the datastore.
use std::ffi::c_void;
use std::path::Path;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::Mutex;

use log::error;
use log::info;
use log::warn;
use serde::Deserialize;
use serde::Serialize;

use crate::config::CHUNK_SIZE;
use crate::config::DEFAULT_VM_RESERVE_SIZE;
use crate::config::INITIAL_SEGMENT_SIZE;
use crate::config::MAX_SEGMENT_SIZE;
use crate::config::MIN_OBJECT_SIZE;
use crate::error::Error;
use crate::error::Result;
use crate::file_ops;
use crate::map;
use crate::named_object_directory::NamedObjectDirectory;
use crate::segment_allocator::SegmentAllocator;
use crate::segment_header::SegmentHeader;
use crate::segment_header::SEGMENT_HEADER_SIZE;
use crate::segment_storage::SegmentStorage;

/// Bumped when the on-disk layout changes; an open refuses any other
/// value.
pub const DATASTORE_VERSION: u64 = 1;

const TOP_DIR_NAME: &str = "permafrost_datastore";
const CORE_DIR_NAME: &str = "core";
const SEGMENT_PREFIX: &str = "segment";
const NAMED_OBJECT_DIRECTORY_FILE_NAME: &str = "named_object_directory";
const MANAGER_METADATA_FILE_NAME: &str = "manager_metadata";
const PROPERLY_CLOSED_MARK_FILE_NAME: &str = "properly_closed_mark";

#[derive(Clone, Serialize, Deserialize)]
struct Metadata {
    version: u64,
    uuid: String,
}

fn top_dir(base: &Path) -> PathBuf {
    base.join(TOP_DIR_NAME)
}

fn core_dir(base: &Path) -> PathBuf {
    top_dir(base).join(CORE_DIR_NAME)
}

fn core_file(base: &Path, name: &str) -> PathBuf {
    core_dir(base).join(name)
}

fn segment_prefix(base: &Path) -> PathBuf {
    core_file(base, SEGMENT_PREFIX)
}

fn read_metadata(base: &Path) -> Result<Metadata> {
    let path = core_file(base, MANAGER_METADATA_FILE_NAME);
    let file = std::fs::File::open(&path).map_err(|e| Error::io("open manager metadata", &path, e))?;
    serde_json::from_reader(std::io::BufReader::new(file)).map_err(|e| {
        error!("Corrupt manager metadata {}: {}", path.display(), e);
        Error::Inconsistent(format!("manager metadata: {}", e))
    })
}

fn write_metadata(base: &Path, metadata: &Metadata) -> Result<()> {
    let path = core_file(base, MANAGER_METADATA_FILE_NAME);
    let file = std::fs::File::create(&path).map_err(|e| Error::io("create manager metadata", &path, e))?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), metadata)
        .map_err(|e| Error::Inconsistent(format!("manager metadata: {}", e)))
}

fn properly_closed(base: &Path) -> bool {
    core_file(base, PROPERLY_CLOSED_MARK_FILE_NAME).exists()
}

fn mark_properly_closed(base: &Path) -> Result<()> {
    let path = core_file(base, PROPERLY_CLOSED_MARK_FILE_NAME);
    std::fs::File::create(&path)
        .map(|_| ())
        .map_err(|e| Error::io("write properly closed mark", &path, e))
}

fn unmark_properly_closed(base: &Path) -> Result<()> {
    let path = core_file(base, PROPERLY_CLOSED_MARK_FILE_NAME);
    std::fs::remove_file(&path).map_err(|e| Error::io("remove properly closed mark", &path, e))
}

pub struct Manager {
    base_dir: PathBuf,
    vm_region: NonNull<c_void>,
    vm_region_size: usize,
    storage: Arc<SegmentStorage>,
    allocator: SegmentAllocator,
    named_objects: Mutex<NamedObjectDirectory>,
    metadata: Metadata,
    read_only: bool,
    closed: bool,
}

// The raw region pointer is only used through the storage mapping;
// every mutable structure is behind a mutex or atomic, per the lock
// discipline documented on the allocator.
unsafe impl Send for Manager {}
unsafe impl Sync for Manager {}

impl Manager {
    // ------------------------- lifecycle -------------------------

    /// Creates a new datastore under `base`, reserving `capacity`
    /// bytes of address space for the segment.  An existing datastore
    /// at the same path is overwritten.
    pub fn create(base: &Path, capacity: usize) -> Result<Box<Manager>> {
        if capacity == 0 {
            return Err(Error::InvalidArgument("capacity must be positive"));
        }
        let capacity = round_up(capacity.min(MAX_SEGMENT_SIZE), CHUNK_SIZE);

        let top = top_dir(base);
        if top.exists() {
            std::fs::remove_dir_all(&top).map_err(|e| Error::io("remove old datastore", &top, e))?;
        }
        let core = core_dir(base);
        std::fs::create_dir_all(&core).map_err(|e| Error::io("create datastore directory", &core, e))?;

        let metadata = Metadata {
            version: DATASTORE_VERSION,
            uuid: uuid::Uuid::new_v4().to_string(),
        };
        write_metadata(base, &metadata)?;

        let (vm_region, vm_region_size) = reserve_region_with_header(capacity)?;
        let segment_base = segment_base_of(vm_region);

        let storage = match SegmentStorage::create(
            &segment_prefix(base),
            capacity,
            segment_base,
            INITIAL_SEGMENT_SIZE.min(capacity),
        ) {
            Ok(storage) => Arc::new(storage),
            Err(error) => {
                let _ = map::release_region(vm_region, vm_region_size);
                return Err(error);
            }
        };

        let mut manager = Box::new(Manager {
            base_dir: base.to_path_buf(),
            vm_region,
            vm_region_size,
            allocator: SegmentAllocator::new(Arc::clone(&storage), capacity),
            storage,
            named_objects: Mutex::new(NamedObjectDirectory::new()),
            metadata,
            read_only: false,
            closed: false,
        });
        manager.install_segment_header();

        info!("Created datastore {} (uuid {})", base.display(), manager.metadata.uuid);
        Ok(manager)
    }

    /// Opens an existing datastore for writing.  Fails when the
    /// previous session did not close cleanly or the on-disk version
    /// does not match.
    pub fn open(base: &Path) -> Result<Box<Manager>> {
        Self::open_impl(base, false, DEFAULT_VM_RESERVE_SIZE)
    }

    /// Like `open`, with an explicit address-space reservation hint.
    /// The hint is grown to fit the existing segment and clipped to
    /// the maximum segment size.
    pub fn open_with_reserve(base: &Path, vm_reserve_hint: usize) -> Result<Box<Manager>> {
        Self::open_impl(base, false, vm_reserve_hint)
    }

    /// Opens an existing datastore read-only.  The properly-closed
    /// mark stays in place, and every mutating API fails.
    pub fn open_read_only(base: &Path) -> Result<Box<Manager>> {
        Self::open_impl(base, true, DEFAULT_VM_RESERVE_SIZE)
    }

    fn open_impl(base: &Path, read_only: bool, vm_reserve_hint: usize) -> Result<Box<Manager>> {
        let metadata = read_metadata(base)?;
        if metadata.version != DATASTORE_VERSION {
            return Err(Error::Inconsistent(format!(
                "datastore version {} does not match supported version {}",
                metadata.version, DATASTORE_VERSION
            )));
        }
        if !properly_closed(base) {
            return Err(Error::Inconsistent(
                "no properly-closed mark: the datastore was not closed cleanly".to_string(),
            ));
        }

        if !SegmentStorage::openable(&segment_prefix(base)) {
            return Err(Error::Inconsistent("datastore has no segment blocks".to_string()));
        }
        let stored = SegmentStorage::stored_size(&segment_prefix(base)) as usize;

        // The mark is consumed by a writable open and recreated at
        // close; a crash in between leaves it absent.
        if !read_only {
            unmark_properly_closed(base)?;
        }

        let capacity = round_up(vm_reserve_hint.max(stored).min(MAX_SEGMENT_SIZE), CHUNK_SIZE);
        let (vm_region, vm_region_size) = match reserve_region_with_header(capacity) {
            Ok(reservation) => reservation,
            Err(error) => {
                if !read_only {
                    let _ = mark_properly_closed(base);
                }
                return Err(error);
            }
        };
        let segment_base = segment_base_of(vm_region);

        let fail = |error: Error, storage: Option<&SegmentStorage>| -> Error {
            // Tear down without syncing, and put the consumed mark
            // back: a failed open must leave the files as they were.
            if let Some(storage) = storage {
                storage.destroy();
            }
            let _ = map::release_region(vm_region, vm_region_size);
            if !read_only {
                let _ = mark_properly_closed(base);
            }
            error
        };

        let storage = match SegmentStorage::open(&segment_prefix(base), capacity, segment_base, read_only) {
            Ok(storage) => Arc::new(storage),
            Err(error) => return Err(fail(error, None)),
        };

        let allocator = SegmentAllocator::new(Arc::clone(&storage), capacity);
        if let Err(error) = allocator.deserialize(&core_dir(base)) {
            return Err(fail(error, Some(&storage)));
        }

        let mut named_objects = NamedObjectDirectory::new();
        if let Err(error) = named_objects.deserialize(&core_file(base, NAMED_OBJECT_DIRECTORY_FILE_NAME)) {
            return Err(fail(error, Some(&storage)));
        }

        let mut manager = Box::new(Manager {
            base_dir: base.to_path_buf(),
            vm_region,
            vm_region_size,
            allocator,
            storage,
            named_objects: Mutex::new(named_objects),
            metadata,
            read_only,
            closed: false,
        });
        manager.install_segment_header();

        info!("Opened datastore {} (uuid {})", base.display(), manager.metadata.uuid);
        Ok(manager)
    }

    /// Closes the datastore: syncs the segment, serializes every
    /// directory, and finally writes the properly-closed mark.  The
    /// mapping and reservation are torn down even if an earlier step
    /// fails; the mark is only written when everything succeeded.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let result = if self.read_only {
            Ok(())
        } else {
            self.serialize_management_data()
                .and_then(|()| mark_properly_closed(&self.base_dir))
        };

        self.storage.destroy();
        if let Err(errno) = map::release_region(self.vm_region, self.vm_region_size) {
            warn!("Failed to release the reservation: errno={}", errno);
        }

        result
    }

    fn serialize_management_data(&self) -> Result<()> {
        self.storage.sync(true)?;
        self.allocator.serialize(&core_dir(&self.base_dir))?;
        self.named_objects
            .lock()
            .expect("named-object mutex should not be poisoned")
            .serialize(&core_file(&self.base_dir, NAMED_OBJECT_DIRECTORY_FILE_NAME))?;
        write_metadata(&self.base_dir, &self.metadata)
    }

    /// Flushes segment data to the backing files.
    pub fn flush(&self, strong: bool) -> Result<()> {
        self.storage.sync(strong)
    }

    /// Copies the datastore to `destination` with a freshly minted
    /// UUID, making the snapshot a distinct datastore.  The live
    /// manager keeps running.
    pub fn snapshot(&self, destination: &Path) -> Result<()> {
        if self.read_only {
            return Err(Error::InvalidArgument("cannot snapshot a read-only datastore"));
        }
        if top_dir(destination).exists() {
            return Err(Error::InvalidArgument("snapshot destination already exists"));
        }

        // Make the on-disk state openable, then clone it.
        self.serialize_management_data()?;
        file_ops::copy_directory_contents(&top_dir(&self.base_dir), &top_dir(destination))
            .map_err(|e| Error::io("copy datastore", destination, e))?;

        let snapshot_metadata = Metadata {
            version: self.metadata.version,
            uuid: uuid::Uuid::new_v4().to_string(),
        };
        write_metadata(destination, &snapshot_metadata)?;
        mark_properly_closed(destination)
    }

    /// Copies a closed datastore, preserving its UUID.  Uses reflink
    /// or sparse-aware copies so holes in the block files survive.
    pub fn copy(source: &Path, destination: &Path) -> Result<()> {
        if !Self::consistent(source) {
            return Err(Error::Inconsistent(format!(
                "{} is not a cleanly closed datastore",
                source.display()
            )));
        }
        if top_dir(destination).exists() {
            return Err(Error::InvalidArgument("copy destination already exists"));
        }

        file_ops::copy_directory_contents(&top_dir(source), &top_dir(destination))
            .map_err(|e| Error::io("copy datastore", destination, e))
    }

    /// Removes the datastore under `base`.  Removing a datastore that
    /// does not exist is not an error.
    pub fn remove(base: &Path) -> Result<()> {
        let top = top_dir(base);
        if !top.exists() {
            return Ok(());
        }
        std::fs::remove_dir_all(&top).map_err(|e| Error::io("remove datastore", &top, e))
    }

    /// Whether the datastore under `base` was closed cleanly and has
    /// a supported version.
    pub fn consistent(base: &Path) -> bool {
        properly_closed(base) && read_metadata(base).map_or(false, |m| m.version == DATASTORE_VERSION)
    }

    pub fn uuid(&self) -> &str {
        &self.metadata.uuid
    }

    pub fn uuid_of(base: &Path) -> Result<String> {
        read_metadata(base).map(|m| m.uuid)
    }

    pub fn version(&self) -> u64 {
        self.metadata.version
    }

    pub fn version_of(base: &Path) -> Result<u64> {
        read_metadata(base).map(|m| m.version)
    }

    // ------------------------- allocation -------------------------

    /// Allocates `nbytes` inside the segment and returns the raw
    /// address.  To survive a reopen the caller must persist the
    /// address as an offset (or through an `OffsetPtr`), not as a raw
    /// pointer.
    pub fn allocate(&self, nbytes: usize) -> Result<*mut u8> {
        self.check_writable()?;
        let offset = self.allocator.allocate(nbytes)?;
        Ok(self.to_address(offset))
    }

    /// `allocate` with an explicit alignment; see
    /// `SegmentAllocator::allocate_aligned` for the argument
    /// contract.
    pub fn allocate_aligned(&self, nbytes: usize, alignment: usize) -> Result<*mut u8> {
        self.check_writable()?;
        let offset = self.allocator.allocate_aligned(nbytes, alignment)?;
        Ok(self.to_address(offset))
    }

    /// Releases an address previously returned by the allocation
    /// APIs.  Null is accepted and ignored.
    pub fn deallocate(&self, address: *mut u8) -> Result<()> {
        self.check_writable()?;
        if address.is_null() {
            return Ok(());
        }
        self.allocator.deallocate(self.to_offset(address)?)
    }

    /// Converts a raw in-segment address to its persistent offset.
    pub fn to_offset(&self, address: *mut u8) -> Result<usize> {
        let base = self.segment_base() as usize;
        let address = address as usize;
        if address < base || address >= base + self.storage.size() {
            return Err(Error::InvalidArgument("address is outside the segment"));
        }
        Ok(address - base)
    }

    /// First byte of the allocatable area.
    pub fn segment_base(&self) -> *mut u8 {
        segment_base_of(self.vm_region).as_ptr() as *mut u8
    }

    /// Bytes of segment currently backed by files.
    pub fn segment_size(&self) -> usize {
        self.storage.size()
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn segment_header(&self) -> &SegmentHeader {
        unsafe { &*(self.vm_region.as_ptr() as *const SegmentHeader) }
    }

    /// Logs an occupancy profile of the segment.
    pub fn profile(&self) {
        self.allocator.profile();
    }

    // ------------------------- named objects -------------------------

    /// Allocates room for `count` values of `T` and registers it
    /// under `name`.  Fails if the name is taken.  The returned
    /// memory is uninitialized; the caller constructs the values.
    pub fn construct<T>(&self, name: &str, count: usize) -> Result<*mut T> {
        self.named_construct(name, count, false)
    }

    /// Like `construct`, but an existing registration is returned
    /// as-is when its count matches (and fails the call when it does
    /// not).
    pub fn find_or_construct<T>(&self, name: &str, count: usize) -> Result<*mut T> {
        self.named_construct(name, count, true)
    }

    /// The unique instance of `T`: a `find_or_construct` keyed on the
    /// type name.
    pub fn construct_unique<T>(&self, count: usize) -> Result<*mut T> {
        self.find_or_construct(std::any::type_name::<T>(), count)
    }

    /// Looks up a named allocation; returns its address and count.
    pub fn find<T>(&self, name: &str) -> Option<(*mut T, usize)> {
        let named = self.named_objects.lock().expect("named-object mutex should not be poisoned");
        named
            .find(name)
            .map(|entry| (self.to_address(entry.offset) as *mut T, entry.length))
    }

    pub fn find_unique<T>(&self) -> Option<(*mut T, usize)> {
        self.find(std::any::type_name::<T>())
    }

    /// Destroys the named allocation: drops `count` values of `T` in
    /// place, deallocates, and unregisters the name.  Returns false
    /// when the name is unknown.
    ///
    /// # Safety
    ///
    /// `T` must be the type the allocation was constructed with, and
    /// all `count` values must be initialized.
    pub unsafe fn destroy<T>(&self, name: &str) -> Result<bool> {
        self.check_writable()?;

        let entry = {
            let mut named = self.named_objects.lock().expect("named-object mutex should not be poisoned");
            match named.erase(name) {
                Some(entry) => entry,
                None => return Ok(false),
            }
        };

        let base: *mut T = self.to_address(entry.offset) as *mut T;
        for index in 0..entry.length {
            std::ptr::drop_in_place(base.add(index));
        }

        self.allocator.deallocate(entry.offset)?;
        Ok(true)
    }

    /// # Safety
    ///
    /// Same contract as `destroy`.
    pub unsafe fn destroy_unique<T>(&self) -> Result<bool> {
        self.destroy::<T>(std::any::type_name::<T>())
    }

    /// Attaches a description to a named allocation.
    pub fn set_description(&self, name: &str, description: &str) -> Result<bool> {
        self.check_writable()?;
        let mut named = self.named_objects.lock().expect("named-object mutex should not be poisoned");
        Ok(named.set_description(name, description))
    }

    /// Snapshot of the named-object table, in insertion order.
    pub fn named_objects(&self) -> Vec<crate::named_object_directory::Entry> {
        let named = self.named_objects.lock().expect("named-object mutex should not be poisoned");
        named.iter().cloned().collect()
    }

    // ------------------------- internals -------------------------

    fn named_construct<T>(&self, name: &str, count: usize, find_existing: bool) -> Result<*mut T> {
        self.check_writable()?;

        let nbytes = std::mem::size_of::<T>()
            .checked_mul(count)
            .ok_or(Error::InvalidArgument("allocation size overflows"))?;

        {
            let named = self.named_objects.lock().expect("named-object mutex should not be poisoned");
            if let Some(entry) = named.find(name) {
                if !find_existing {
                    return Err(Error::InvalidArgument("name is already registered"));
                }
                if entry.length != count {
                    return Err(Error::InvalidArgument("existing object has a different count"));
                }
                return Ok(self.to_address(entry.offset) as *mut T);
            }
        }

        // Allocate without holding the directory mutex: the lock
        // order forbids nesting it with the allocator's.
        let align = std::mem::align_of::<T>();
        let offset = if align > MIN_OBJECT_SIZE {
            self.allocator.allocate_aligned(round_up(nbytes.max(1), align), align)?
        } else {
            self.allocator.allocate(nbytes)?
        };

        let mut named = self.named_objects.lock().expect("named-object mutex should not be poisoned");
        if let Some(entry) = named.find(name) {
            // Another thread registered the name while we allocated.
            let (existing_offset, existing_count) = (entry.offset, entry.length);
            drop(named);
            let _ = self.allocator.deallocate(offset);

            if find_existing && existing_count == count {
                return Ok(self.to_address(existing_offset) as *mut T);
            }
            return Err(Error::InvalidArgument("name is already registered"));
        }

        if !named.insert(name, offset, count, "") {
            drop(named);
            let _ = self.allocator.deallocate(offset);
            return Err(Error::InvalidArgument("offset is already registered"));
        }
        Ok(self.to_address(offset) as *mut T)
    }

    fn check_writable(&self) -> Result<()> {
        if self.closed {
            Err(Error::InvalidArgument("the datastore is closed"))
        } else if self.read_only {
            Err(Error::InvalidArgument("the datastore is open read-only"))
        } else {
            Ok(())
        }
    }

    fn to_address(&self, offset: usize) -> *mut u8 {
        (self.segment_base() as usize + offset) as *mut u8
    }

    fn install_segment_header(&mut self) {
        let manager = self as *const Manager as *const ();
        let segment_base = self.segment_base();
        let header = unsafe { &mut *(self.vm_region.as_ptr() as *mut SegmentHeader) };
        header.initialize(manager, segment_base);
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(error) = self.close() {
                error!("Closing {} on drop failed: {}", self.base_dir.display(), error);
            }
        }
    }
}

fn segment_base_of(vm_region: NonNull<c_void>) -> NonNull<c_void> {
    NonNull::new((vm_region.as_ptr() as usize + SEGMENT_HEADER_SIZE) as *mut c_void)
        .expect("the segment base is non-null")
}

/// Reserves address space for the header plus `capacity` bytes of
/// segment, chunk-aligned.  The header region is immediately backed
/// with anonymous memory; it is never persisted.
fn reserve_region_with_header(capacity: usize) -> Result<(NonNull<c_void>, usize)> {
    let vm_region_size = SEGMENT_HEADER_SIZE + capacity;
    let vm_region = map::reserve_aligned_region(vm_region_size, CHUNK_SIZE)
        .map_err(|errno| Error::os("reserve address space", errno))?;

    if let Err(errno) = map::map_anonymous_fixed(vm_region, SEGMENT_HEADER_SIZE) {
        let _ = map::release_region(vm_region, vm_region_size);
        return Err(Error::os("map segment header", errno));
    }

    Ok((vm_region, vm_region_size))
}

fn round_up(value: usize, unit: usize) -> usize {
    (value + unit - 1) / unit * unit
}
