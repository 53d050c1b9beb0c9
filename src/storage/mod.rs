// Copyright (c) 2024-present, octree-store contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Storage handler: all file I/O of the store.
//!
//! One event-loop thread owns the backing file and the live free-space
//! allocator. Every public operation posts a typed event; completion
//! callbacks run on the storage loop. Bootstrap (open, root-record read,
//! top-level blob reads) happens synchronously on the calling thread before
//! the loop takes over the file handle.

pub mod cache;
pub mod header;
pub mod location;
pub mod request;
pub mod root_index;

pub use cache::BlobCache;
pub use header::{PointCloudHeader, StorageHeader};
pub use location::StorageLocation;
pub use request::ReadHandle;
pub use root_index::{RootIndex, MAGIC_BYTES, ROOT_RECORD_SIZE};

use crate::{
    allocator::BlobAllocator,
    attributes::{AttributesId, AttributesRegistry},
    coding::{Decode, Encode},
    event::{spawn_loop, EventPipe, LoopSignal},
    stop_signal::StopSignal,
    tree::TreeId,
    Slice,
};
use std::{
    fs::File,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc,
    },
};

/// Completion callback of a point-blob write.
pub type WriteDone =
    Box<dyn FnOnce(StorageHeader, AttributesId, crate::Result<Vec<StorageLocation>>) + Send>;

/// Completion callback of a batched tree write.
pub type WriteTreesDone = Box<dyn FnOnce(crate::Result<Vec<(TreeId, StorageLocation)>>) + Send>;

/// Completion callback of a tree-registry write.
pub type WriteRegistryDone = Box<dyn FnOnce(crate::Result<StorageLocation>) + Send>;

/// Completion callback of a root-index commit.
pub type CommitDone = Box<dyn FnOnce(crate::Result<()>) + Send>;

/// Completion callback of a read; receives the result by reference, the
/// buffer itself lives in the [`ReadHandle`].
pub type ReadDone = Box<dyn FnOnce(&crate::Result<Slice>) + Send>;

struct WriteEvent {
    header: StorageHeader,
    attributes_id: AttributesId,
    buffers: Vec<Slice>,
    done: WriteDone,
}

struct WriteTreesEvent {
    trees: Vec<(TreeId, Vec<u8>)>,
    done: WriteTreesDone,
}

struct WriteRegistryEvent {
    blob: Vec<u8>,
    done: WriteRegistryDone,
}

struct CommitEvent {
    tree_registry: StorageLocation,
    old_locations: Vec<StorageLocation>,
    done: CommitDone,
}

struct ReadEvent {
    location: StorageLocation,
    handle: Arc<ReadHandle>,
    done: Option<ReadDone>,
}

enum ControlEvent {
    UpgradeToWrite {
        truncate: bool,
        done: mpsc::SyncSender<crate::Result<()>>,
    },
    Snapshot {
        done: mpsc::SyncSender<(BlobAllocator, RootIndex)>,
    },
}

#[derive(Clone)]
struct StoragePipes {
    write: EventPipe<WriteEvent>,
    write_trees: EventPipe<WriteTreesEvent>,
    write_registry: EventPipe<WriteRegistryEvent>,
    commit: EventPipe<CommitEvent>,
    read: EventPipe<ReadEvent>,
    control: EventPipe<ControlEvent>,
}

impl StoragePipes {
    fn new(signal: &LoopSignal) -> Self {
        Self {
            write: EventPipe::new(signal.clone()),
            write_trees: EventPipe::new(signal.clone()),
            write_registry: EventPipe::new(signal.clone()),
            commit: EventPipe::new(signal.clone()),
            read: EventPipe::new(signal.clone()),
            control: EventPipe::new(signal.clone()),
        }
    }

    fn is_empty(&self) -> bool {
        self.write.is_empty()
            && self.write_trees.is_empty()
            && self.write_registry.is_empty()
            && self.commit.is_empty()
            && self.read.is_empty()
            && self.control.is_empty()
    }
}

/// Result of opening a store file.
pub struct OpenOutcome {
    pub handler: StorageHandler,

    /// Attribute table recovered from the store (empty for a fresh store)
    pub attributes: Arc<AttributesRegistry>,

    /// Serialized tree registry, if the store was complete
    pub tree_registry_blob: Option<Slice>,

    /// `true` if no file existed yet
    pub created: bool,
}

/// Handle to the storage subsystem.
///
/// Cloneable across threads; dropping the last clone shuts the loop down.
pub struct StorageHandler {
    pipes: StoragePipes,
    signal: LoopSignal,
    stop: StopSignal,
    pending: Arc<AtomicUsize>,
    cache: Arc<BlobCache>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl StorageHandler {
    /// Opens a store file, reading the root record and the three top-level
    /// blobs if the file exists.
    ///
    /// The store starts out read-only; call [`Self::upgrade_to_write`]
    /// before issuing writes.
    pub fn open(path: &Path, cache_bytes: u64) -> crate::Result<OpenOutcome> {
        let path: PathBuf = path.into();
        let exists = path.try_exists()?;

        let mut allocator = BlobAllocator::new();
        let mut root = RootIndex::default();
        let mut attributes = AttributesRegistry::new();
        let mut tree_registry_blob = None;
        let mut file = None;

        if exists {
            let f = File::open(&path)?;

            let record = read_blob(&f, StorageLocation::new(0, ROOT_RECORD_SIZE as u32))?;
            root = RootIndex::decode_from(&mut &record[..]).map_err(crate::Error::Decode)?;

            if root.is_complete() {
                let map_blob = read_blob(&f, root.free_space_map)?;
                allocator = BlobAllocator::decode_from(&mut &map_blob[..])
                    .map_err(crate::Error::Decode)?;

                let attributes_blob = read_blob(&f, root.attributes)?;
                attributes = AttributesRegistry::deserialize(&attributes_blob)
                    .map_err(crate::Error::Decode)?;

                tree_registry_blob = Some(read_blob(&f, root.tree_registry)?);
            } else {
                let offset = allocator.register_blob(ROOT_RECORD_SIZE as u64);
                debug_assert_eq!(offset, 0);
            }

            file = Some(f);

            log::debug!(
                "opened store at {path:?}, file size {}",
                allocator.file_size(),
            );
        } else {
            // Reserve the root record of the yet-to-be-created file.
            let offset = allocator.register_blob(ROOT_RECORD_SIZE as u64);
            debug_assert_eq!(offset, 0);

            log::debug!("store at {path:?} does not exist yet");
        }

        let attributes = Arc::new(attributes);
        let cache = Arc::new(BlobCache::with_capacity_bytes(cache_bytes));

        let signal = LoopSignal::new();
        let pipes = StoragePipes::new(&signal);
        let stop = StopSignal::default();
        let pending = Arc::new(AtomicUsize::new(0));

        let state = LoopState {
            path,
            file,
            write_mode: false,
            allocator,
            attributes: attributes.clone(),
            free_space_location: root.free_space_map,
            attributes_location: root.attributes,
            tree_registry_location: root.tree_registry,
            cache: cache.clone(),
        };

        let thread = {
            let pipes = pipes.clone();
            let signal = signal.clone();
            let stop = stop.clone();
            let pending = pending.clone();

            spawn_loop("octree-storage", move || {
                storage_loop(state, &pipes, &signal, &stop, &pending);
            })
        };

        Ok(OpenOutcome {
            handler: Self {
                pipes,
                signal,
                stop,
                pending,
                cache,
                thread: Some(thread),
            },
            attributes,
            tree_registry_blob,
            created: !exists,
        })
    }

    /// Opens the file for writing. Until this is called every write fails
    /// with [`crate::Error::ReadOnly`].
    ///
    /// `truncate` discards all existing content.
    pub fn upgrade_to_write(&self, truncate: bool) -> crate::Result<()> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.post_control(ControlEvent::UpgradeToWrite { truncate, done: tx });
        rx.recv().map_err(|_| crate::Error::Unrecoverable)?
    }

    /// Writes one blob per attribute buffer; the position buffer (index 0)
    /// is prefixed with the serialized `header`.
    pub fn write(
        &self,
        header: StorageHeader,
        attributes_id: AttributesId,
        buffers: Vec<Slice>,
        done: WriteDone,
    ) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.pipes.write.post(WriteEvent {
            header,
            attributes_id,
            buffers,
            done,
        });
    }

    /// Writes one blob per serialized tree.
    pub fn write_trees(&self, trees: Vec<(TreeId, Vec<u8>)>, done: WriteTreesDone) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.pipes.write_trees.post(WriteTreesEvent { trees, done });
    }

    /// Writes the serialized tree registry as a single blob.
    pub fn write_tree_registry(&self, blob: Vec<u8>, done: WriteRegistryDone) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.pipes.write_registry.post(WriteRegistryEvent { blob, done });
    }

    /// Three-phase root-index commit.
    ///
    /// On a deep copy of the live allocator, frees `old_locations` plus the
    /// previous free-space-map and attribute-table blobs, re-registers fresh
    /// serializations of both, writes them, then rewrites the root record.
    /// Only after the record hits the disk is the copy installed as the live
    /// allocator; on any failure the live state stays untouched.
    pub fn write_blob_locations_and_update_header(
        &self,
        tree_registry: StorageLocation,
        old_locations: Vec<StorageLocation>,
        done: CommitDone,
    ) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.pipes.commit.post(CommitEvent {
            tree_registry,
            old_locations,
            done,
        });
    }

    /// Issues a read; `done` (if any) is invoked on the storage loop. The
    /// returned handle supports synchronous [`ReadHandle::wait_for_read`].
    pub fn read(&self, location: StorageLocation, done: Option<ReadDone>) -> Arc<ReadHandle> {
        let handle = Arc::new(ReadHandle::new());

        self.pending.fetch_add(1, Ordering::SeqCst);
        self.pipes.read.post(ReadEvent {
            location,
            handle: handle.clone(),
            done,
        });

        handle
    }

    /// Reads a blob, blocking until the buffer is available.
    pub fn read_sync(&self, location: StorageLocation) -> crate::Result<Slice> {
        self.read(location, None).wait_for_read()
    }

    /// Copies of the live allocator and root index (test introspection and
    /// progress reporting).
    pub fn snapshot(&self) -> crate::Result<(BlobAllocator, RootIndex)> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.post_control(ControlEvent::Snapshot { done: tx });
        rx.recv().map_err(|_| crate::Error::Unrecoverable)
    }

    /// Number of requests posted but not yet completed.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// The blob read cache fronting this store.
    #[must_use]
    pub fn blob_cache(&self) -> &Arc<BlobCache> {
        &self.cache
    }

    fn post_control(&self, event: ControlEvent) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.pipes.control.post(event);
    }
}

impl Drop for StorageHandler {
    fn drop(&mut self) {
        self.stop.send();
        self.signal.notify();

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("storage loop panicked");
            }
        }
    }
}

struct LoopState {
    path: PathBuf,
    file: Option<File>,
    write_mode: bool,
    allocator: BlobAllocator,
    attributes: Arc<AttributesRegistry>,
    free_space_location: StorageLocation,
    attributes_location: StorageLocation,
    tree_registry_location: StorageLocation,
    cache: Arc<BlobCache>,
}

fn storage_loop(
    mut state: LoopState,
    pipes: &StoragePipes,
    signal: &LoopSignal,
    stop: &StopSignal,
    pending: &Arc<AtomicUsize>,
) {
    loop {
        signal.wait();

        loop {
            let mut drained = 0;

            for event in pipes.control.drain() {
                state.handle_control(event);
                drained += 1;
            }
            for event in pipes.write.drain() {
                state.handle_write(event);
                drained += 1;
            }
            for event in pipes.write_trees.drain() {
                state.handle_write_trees(event);
                drained += 1;
            }
            for event in pipes.write_registry.drain() {
                state.handle_write_registry(event);
                drained += 1;
            }
            for event in pipes.commit.drain() {
                state.handle_commit(event);
                drained += 1;
            }
            for event in pipes.read.drain() {
                state.handle_read(event);
                drained += 1;
            }

            if drained == 0 {
                break;
            }

            pending.fetch_sub(drained, Ordering::SeqCst);
        }

        if stop.is_stopped() && pipes.is_empty() {
            log::trace!("storage loop shutting down");
            return;
        }
    }
}

impl LoopState {
    fn file(&self) -> crate::Result<&File> {
        self.file.as_ref().ok_or(crate::Error::ReadOnly)
    }

    fn write_blob_at(&mut self, offset: u64, bytes: &[u8]) -> crate::Result<()> {
        if !self.write_mode {
            return Err(crate::Error::ReadOnly);
        }
        write_all_at(self.file()?, bytes, offset)?;
        Ok(())
    }

    /// Allocates and writes one blob, returning its location.
    fn store_blob(&mut self, bytes: &[u8]) -> crate::Result<StorageLocation> {
        #[allow(clippy::cast_possible_truncation)]
        let location = StorageLocation::new(
            self.allocator.register_blob(bytes.len() as u64),
            bytes.len() as u32,
        );

        if let Err(e) = self.write_blob_at(location.offset, bytes) {
            let freed = self
                .allocator
                .unregister_blob(location.offset, u64::from(location.size));
            debug_assert!(freed);
            return Err(e);
        }

        Ok(location)
    }

    fn release_blob(&mut self, location: StorageLocation) {
        let freed = self
            .allocator
            .unregister_blob(location.offset, u64::from(location.size));
        debug_assert!(freed);
    }

    fn handle_control(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::UpgradeToWrite { truncate, done } => {
                let result = self.upgrade_to_write(truncate);
                let _ = done.send(result);
            }
            ControlEvent::Snapshot { done } => {
                let root = RootIndex {
                    free_space_map: self.free_space_location,
                    attributes: self.attributes_location,
                    tree_registry: self.tree_registry_location,
                };
                let _ = done.send((self.allocator.clone(), root));
            }
        }
    }

    fn upgrade_to_write(&mut self, truncate: bool) -> crate::Result<()> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(truncate)
            .open(&self.path)?;

        if truncate {
            self.allocator = BlobAllocator::new();
            let offset = self.allocator.register_blob(ROOT_RECORD_SIZE as u64);
            debug_assert_eq!(offset, 0);

            self.free_space_location = StorageLocation::default();
            self.attributes_location = StorageLocation::default();
            self.tree_registry_location = StorageLocation::default();
        }

        self.file = Some(file);
        self.write_mode = true;

        // A fresh or truncated store gets its (incomplete) root record right
        // away so the file always starts with the magic.
        if self.free_space_location.is_null() {
            let record = RootIndex::default().encode_into_vec();
            self.write_blob_at(0, &record)?;
        }

        log::debug!("store upgraded to write mode (truncate: {truncate})");

        Ok(())
    }

    fn handle_write(&mut self, event: WriteEvent) {
        let WriteEvent {
            header,
            attributes_id,
            buffers,
            done,
        } = event;

        let mut locations = Vec::with_capacity(buffers.len());
        let mut failure = None;

        for (idx, buffer) in buffers.iter().enumerate() {
            let result = if idx == 0 {
                let mut blob = header.encode_into_vec();
                blob.extend_from_slice(buffer);
                self.store_blob(&blob)
            } else {
                self.store_blob(buffer)
            };

            match result {
                Ok(location) => locations.push(location),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            // Undo the blobs that did get allocated.
            for location in locations.drain(..) {
                self.release_blob(location);
            }
            done(header, attributes_id, Err(e));
        } else {
            done(header, attributes_id, Ok(locations));
        }
    }

    fn handle_write_trees(&mut self, event: WriteTreesEvent) {
        let WriteTreesEvent { trees, done } = event;

        let mut written = Vec::with_capacity(trees.len());
        let mut failure = None;

        for (id, blob) in &trees {
            match self.store_blob(blob) {
                Ok(location) => written.push((*id, location)),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            for (_, location) in written.drain(..) {
                self.release_blob(location);
            }
            done(Err(e));
        } else {
            done(Ok(written));
        }
    }

    fn handle_write_registry(&mut self, event: WriteRegistryEvent) {
        let WriteRegistryEvent { blob, done } = event;
        done(self.store_blob(&blob));
    }

    fn handle_commit(&mut self, event: CommitEvent) {
        let CommitEvent {
            tree_registry,
            old_locations,
            done,
        } = event;

        let result = self.try_commit(tree_registry, &old_locations);

        if result.is_ok() {
            for location in &old_locations {
                self.cache.remove(*location);
            }
        }

        done(result);
    }

    fn try_commit(
        &mut self,
        tree_registry: StorageLocation,
        old_locations: &[StorageLocation],
    ) -> crate::Result<()> {
        if !self.write_mode {
            return Err(crate::Error::ReadOnly);
        }

        // Phase 1: free replaced blobs on a copy of the allocator.
        let mut copy = self.allocator.clone();

        for location in old_locations {
            if !copy.unregister_blob(location.offset, u64::from(location.size)) {
                log::error!("commit: stale location {location} is not a live blob");
                return Err(crate::Error::Unrecoverable);
            }
        }

        for location in [self.free_space_location, self.attributes_location] {
            if !location.is_null()
                && !copy.unregister_blob(location.offset, u64::from(location.size))
            {
                log::error!("commit: previous index blob {location} is not a live blob");
                return Err(crate::Error::Unrecoverable);
            }
        }

        // Phase 2: re-register the attribute table and the (self-referential)
        // free-space map in the copy.
        let attributes_bytes = self.attributes.serialize();
        #[allow(clippy::cast_possible_truncation)]
        let attributes_location = StorageLocation::new(
            copy.register_blob(attributes_bytes.len() as u64),
            attributes_bytes.len() as u32,
        );

        // Registering the map's own blob may shrink its serialization (a free
        // section gets consumed), never grow it; pad back up to the reserved
        // size so the recorded location stays exact.
        let reserved = copy.encode_into_vec().len();
        #[allow(clippy::cast_possible_truncation)]
        let map_location =
            StorageLocation::new(copy.register_blob(reserved as u64), reserved as u32);

        let mut map_bytes = copy.encode_into_vec();
        debug_assert!(map_bytes.len() <= reserved);
        map_bytes.resize(reserved, 0);

        // Phase 3: write both blobs, sync, then the fresh root record.
        self.write_blob_at(attributes_location.offset, &attributes_bytes)?;
        self.write_blob_at(map_location.offset, &map_bytes)?;
        self.file()?.sync_all()?;

        let root = RootIndex {
            free_space_map: map_location,
            attributes: attributes_location,
            tree_registry,
        };
        self.write_blob_at(0, &root.encode_into_vec())?;
        self.file()?.sync_all()?;

        // Install the copy; only now is the old state gone.
        self.allocator = copy;
        self.free_space_location = map_location;
        self.attributes_location = attributes_location;
        self.tree_registry_location = tree_registry;

        log::debug!(
            "committed root index: map {map_location}, attributes {attributes_location}, trees {tree_registry}",
        );

        Ok(())
    }

    fn handle_read(&mut self, event: ReadEvent) {
        let ReadEvent {
            location,
            handle,
            done,
        } = event;

        let result = if let Some(blob) = self.cache.get(location) {
            Ok(blob)
        } else {
            self.read_blob(location).inspect(|blob| {
                self.cache.insert(location, blob.clone());
            })
        };

        if let Some(done) = done {
            done(&result);
        }

        handle.complete(result);
    }

    fn read_blob(&self, location: StorageLocation) -> crate::Result<Slice> {
        let file = self.file()?;
        Ok(read_blob(file, location)?)
    }
}

/// Reads exactly `location.size` bytes at `location.offset` using `pread`.
fn read_blob(file: &File, location: StorageLocation) -> std::io::Result<Slice> {
    let mut buffer = vec![0u8; location.size as usize];
    read_exact_at(file, &mut buffer, location.offset)?;
    Ok(Slice::from(buffer))
}

#[cfg(unix)]
fn read_exact_at(file: &File, buffer: &mut [u8], offset: u64) -> std::io::Result<()> {
    std::os::unix::fs::FileExt::read_exact_at(file, buffer, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, buffer: &mut [u8], offset: u64) -> std::io::Result<()> {
    let mut pos = 0;
    while pos < buffer.len() {
        let read = std::os::windows::fs::FileExt::seek_read(
            file,
            &mut buffer[pos..],
            offset + pos as u64,
        )?;
        if read == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "short read",
            ));
        }
        pos += read;
    }
    Ok(())
}

#[cfg(unix)]
fn write_all_at(file: &File, buffer: &[u8], offset: u64) -> std::io::Result<()> {
    std::os::unix::fs::FileExt::write_all_at(file, buffer, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, buffer: &[u8], offset: u64) -> std::io::Result<()> {
    let mut pos = 0;
    while pos < buffer.len() {
        let written = std::os::windows::fs::FileExt::seek_write(
            file,
            &buffer[pos..],
            offset + pos as u64,
        )?;
        pos += written;
    }
    Ok(())
}

/// Splits a stored point blob into its header and the raw attribute column.
pub fn deserialize_points(blob: &Slice) -> crate::Result<(StorageHeader, Slice)> {
    if blob.len() < StorageHeader::serialized_len() {
        #[allow(clippy::cast_possible_truncation)]
        return Err(crate::Error::BlobSizeMismatch {
            expected: StorageHeader::serialized_len() as u32,
            got: blob.len() as u32,
        });
    }

    let mut reader = &blob[..];
    let header = StorageHeader::decode_from(&mut reader).map_err(crate::Error::Decode)?;
    let data = blob.slice(StorageHeader::serialized_len()..);

    Ok((header, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{PointFormat, ScalarType};
    use crate::input::InputId;
    use crate::morton::{Morton, Morton192};
    use test_log::test;

    fn test_header(point_count: u64) -> StorageHeader {
        StorageHeader::new(
            InputId { data: 0, sub: 0 },
            PointCloudHeader {
                point_count,
                offset: [0.0; 3],
                scale: [0.001; 3],
                min: [0.0; 3],
                max: [1.0; 3],
            },
            Morton192::ZERO,
            Morton::<3>([32_767, 0, 0]),
            PointFormat::new(ScalarType::Morton64, 1),
        )
    }

    #[test]
    fn fresh_store_round_trips_through_commit() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("store.jlp");

        let registry_blob;
        let allocator_before;

        {
            let outcome = StorageHandler::open(&path, 1_000_000)?;
            assert!(outcome.created);

            let storage = outcome.handler;
            storage.upgrade_to_write(false)?;

            let (tx, rx) = std::sync::mpsc::sync_channel(1);
            storage.write(
                test_header(4),
                AttributesId(0),
                vec![Slice::from(vec![1u8; 32])],
                Box::new(move |_, _, result| {
                    let _ = tx.send(result);
                }),
            );
            let locations = rx.recv().expect("write completes")?;
            assert_eq!(locations.len(), 1);
            assert_eq!(locations[0].offset, 128);

            outcome.attributes.intern(crate::Attributes::position_only(
                ScalarType::Morton64,
            ));

            let (tx, rx) = std::sync::mpsc::sync_channel(1);
            storage.write_tree_registry(
                vec![0xAB; 16],
                Box::new(move |result| {
                    let _ = tx.send(result);
                }),
            );
            registry_blob = rx.recv().expect("write completes")?;

            let (tx, rx) = std::sync::mpsc::sync_channel(1);
            storage.write_blob_locations_and_update_header(
                registry_blob,
                vec![],
                Box::new(move |result| {
                    let _ = tx.send(result);
                }),
            );
            rx.recv().expect("commit completes")?;

            allocator_before = storage.snapshot()?.0;
        }

        // Re-open: everything must come back.
        let outcome = StorageHandler::open(&path, 1_000_000)?;
        assert!(!outcome.created);
        assert_eq!(outcome.attributes.len(), 1);

        let blob = outcome.tree_registry_blob.expect("registry blob exists");
        assert_eq!(&*blob, &[0xAB; 16]);

        let (allocator_after, root) = outcome.handler.snapshot()?;
        assert!(root.is_complete());
        assert_eq!(root.tree_registry, registry_blob);
        assert_eq!(allocator_after, allocator_before);

        // The point blob is still readable.
        let stored = outcome
            .handler
            .read_sync(StorageLocation::new(128, (StorageHeader::serialized_len() + 32) as u32))?;
        let (header, data) = deserialize_points(&stored)?;
        assert_eq!(header.public_header.point_count, 4);
        assert_eq!(&*data, &[1u8; 32]);

        Ok(())
    }

    #[test]
    fn writes_fail_before_upgrade() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("store.jlp");

        let outcome = StorageHandler::open(&path, 1_000_000)?;
        let storage = outcome.handler;

        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        storage.write(
            test_header(1),
            AttributesId(0),
            vec![Slice::from(vec![0u8; 8])],
            Box::new(move |_, _, result| {
                let _ = tx.send(result);
            }),
        );

        assert!(matches!(
            rx.recv().expect("write completes"),
            Err(crate::Error::ReadOnly)
        ));

        Ok(())
    }

    #[test]
    fn commit_failure_leaves_live_state_untouched() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("store.jlp");

        let outcome = StorageHandler::open(&path, 1_000_000)?;
        let storage = outcome.handler;
        storage.upgrade_to_write(false)?;

        let before = storage.snapshot()?;

        // Stale location that was never allocated
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        storage.write_blob_locations_and_update_header(
            StorageLocation::new(4096, 16),
            vec![StorageLocation::new(100_000, 50)],
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );

        assert!(rx.recv().expect("commit completes").is_err());
        let after = storage.snapshot()?;
        assert_eq!(before.0, after.0);
        assert_eq!(before.1, after.1);

        Ok(())
    }

    #[test]
    fn read_uses_cache_for_repeat_access() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("store.jlp");

        let outcome = StorageHandler::open(&path, 1_000_000)?;
        let storage = outcome.handler;
        storage.upgrade_to_write(false)?;

        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        storage.write(
            test_header(2),
            AttributesId(0),
            vec![Slice::from(vec![7u8; 16])],
            Box::new(move |_, _, result| {
                let _ = tx.send(result);
            }),
        );
        let locations = rx.recv().expect("write completes")?;

        let first = storage.read_sync(locations[0])?;
        assert_eq!(storage.blob_cache().get(locations[0]), Some(first.clone()));

        let second = storage.read_sync(locations[0])?;
        assert_eq!(first, second);

        Ok(())
    }
}
