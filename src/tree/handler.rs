// Copyright (c) 2024-present, octree-store contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Tree subsystem loop.
//!
//! Owns the tree registry. Insertions, LOD completions, frustum walks and
//! checkpoints arrive as events; LOD generation itself runs on the worker
//! pool and posts back here.

use super::{
    insert,
    lod::{self, LodPendingKey, LodWork},
    serialize::TreeRegistryBlob,
    walker::{self, WalkResult},
    PointsSubset, StoragePointsReader, TreeId, TreePoints, TreeRegistry,
};
use crate::{
    attributes::{AttributesId, AttributesRegistry},
    coding::Encode,
    event::{spawn_loop, EventPipe, LoopSignal},
    pool::ThreadPool,
    stop_signal::StopSignal,
    storage::{StorageHandler, StorageHeader, StorageLocation},
    InputRegistry,
};
use cgmath::Matrix4;
use rustc_hash::FxHashSet;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    mpsc, Arc,
};

struct InsertEvent {
    header: StorageHeader,
    attributes_id: AttributesId,
    locations: Vec<StorageLocation>,
}

struct LodDoneEvent {
    work: LodWork,
    epoch: u64,
    result: crate::Result<(StorageHeader, AttributesId, Vec<StorageLocation>)>,
}

enum ControlEvent {
    Walk {
        view_projection: Box<Matrix4<f64>>,
        done: mpsc::SyncSender<WalkResult>,
    },
    Checkpoint {
        done: mpsc::SyncSender<crate::Result<()>>,
    },
    Status {
        done: mpsc::SyncSender<TreeStatus>,
    },
    PokeLod,
}

/// Snapshot of the tree subsystem's progress.
#[derive(Clone, Debug)]
pub struct TreeStatus {
    pub tree_count: usize,
    pub root: Option<TreeId>,
    pub lod_in_flight: usize,
    pub total_leaf_points: u64,
}

#[derive(Clone)]
struct TreePipes {
    insert: EventPipe<InsertEvent>,
    lod_done: EventPipe<LodDoneEvent>,
    control: EventPipe<ControlEvent>,
}

impl TreePipes {
    fn new(signal: &LoopSignal) -> Self {
        Self {
            insert: EventPipe::new(signal.clone()),
            lod_done: EventPipe::new(signal.clone()),
            control: EventPipe::new(signal.clone()),
        }
    }

    fn is_empty(&self) -> bool {
        self.insert.is_empty() && self.lod_done.is_empty() && self.control.is_empty()
    }
}

/// Handle to the tree subsystem.
pub struct TreeHandler {
    pipes: TreePipes,
    signal: LoopSignal,
    stop: StopSignal,
    pending_inserts: Arc<AtomicUsize>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl TreeHandler {
    /// Spawns the tree loop over a (possibly recovered) registry.
    ///
    /// `prior_blob_locations` are the tree and registry blobs of the last
    /// checkpoint; they are reclaimed when the next checkpoint commits.
    /// Failures of insertions and LOD generations surface on `errors`.
    #[must_use]
    pub fn spawn(
        registry: TreeRegistry,
        storage: Arc<StorageHandler>,
        inputs: Arc<InputRegistry>,
        attributes: Arc<AttributesRegistry>,
        pool: Arc<ThreadPool>,
        prior_blob_locations: Vec<StorageLocation>,
        errors: EventPipe<crate::Error>,
    ) -> Self {
        let signal = LoopSignal::new();
        let pipes = TreePipes::new(&signal);
        let stop = StopSignal::default();
        let pending_inserts = Arc::new(AtomicUsize::new(0));

        let state = LoopState {
            registry,
            storage,
            inputs,
            attributes,
            pool,
            pipes: pipes.clone(),
            epoch: 0,
            lod_pending: FxHashSet::default(),
            reclaimable: Vec::new(),
            prior_blob_locations,
            errors,
        };

        let thread = {
            let pipes = pipes.clone();
            let signal = signal.clone();
            let stop = stop.clone();
            let pending_inserts = pending_inserts.clone();

            spawn_loop("octree-tree", move || {
                tree_loop(state, &pipes, &signal, &stop, &pending_inserts);
            })
        };

        Self {
            pipes,
            signal,
            stop,
            pending_inserts,
            thread: Some(thread),
        }
    }

    /// Queues an insertion of a freshly written batch.
    pub fn insert(
        &self,
        header: StorageHeader,
        attributes_id: AttributesId,
        locations: Vec<StorageLocation>,
    ) {
        self.pending_inserts.fetch_add(1, Ordering::SeqCst);
        self.pipes.insert.post(InsertEvent {
            header,
            attributes_id,
            locations,
        });
    }

    /// Runs a frustum walk on the tree loop and blocks for the result.
    pub fn walk(&self, view_projection: Matrix4<f64>) -> crate::Result<WalkResult> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.pipes.control.post(ControlEvent::Walk {
            view_projection: Box::new(view_projection),
            done: tx,
        });
        rx.recv().map_err(|_| crate::Error::Unrecoverable)
    }

    /// Serializes all trees, the registry and the free-space map, and
    /// commits the root record. Blocks until the commit completed.
    pub fn checkpoint(&self) -> crate::Result<()> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.pipes.control.post(ControlEvent::Checkpoint { done: tx });
        rx.recv().map_err(|_| crate::Error::Unrecoverable)?
    }

    /// Re-evaluates the LOD watermark (after an input finished reading).
    pub fn poke_lod(&self) {
        self.pipes.control.post(ControlEvent::PokeLod);
    }

    /// Progress snapshot, blocking on the tree loop.
    pub fn status(&self) -> crate::Result<TreeStatus> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.pipes.control.post(ControlEvent::Status { done: tx });
        rx.recv().map_err(|_| crate::Error::Unrecoverable)
    }

    /// Number of insertions posted but not yet applied.
    #[must_use]
    pub fn pending_inserts(&self) -> usize {
        self.pending_inserts.load(Ordering::SeqCst)
    }
}

impl Drop for TreeHandler {
    fn drop(&mut self) {
        self.stop.send();
        self.signal.notify();

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("tree loop panicked");
            }
        }
    }
}

struct LoopState {
    registry: TreeRegistry,
    storage: Arc<StorageHandler>,
    inputs: Arc<InputRegistry>,
    attributes: Arc<AttributesRegistry>,
    pool: Arc<ThreadPool>,
    pipes: TreePipes,

    /// Bumped by every insertion; in-flight LOD results from an older epoch
    /// are dropped and their blobs reclaimed.
    epoch: u64,

    lod_pending: FxHashSet<LodPendingKey>,

    /// Blob locations to free at the next checkpoint
    reclaimable: Vec<StorageLocation>,

    /// Tree/registry blobs of the previous checkpoint
    prior_blob_locations: Vec<StorageLocation>,

    /// Cross-subsystem error pipe to the converter loop
    errors: EventPipe<crate::Error>,
}

fn tree_loop(
    mut state: LoopState,
    pipes: &TreePipes,
    signal: &LoopSignal,
    stop: &StopSignal,
    pending_inserts: &Arc<AtomicUsize>,
) {
    loop {
        signal.wait();

        loop {
            let mut drained = false;

            for event in pipes.insert.drain() {
                state.handle_insert(event);
                pending_inserts.fetch_sub(1, Ordering::SeqCst);
                drained = true;
            }
            for event in pipes.lod_done.drain() {
                state.handle_lod_done(event);
                drained = true;
            }
            for event in pipes.control.drain() {
                state.handle_control(event);
                drained = true;
            }

            if !drained {
                break;
            }
        }

        if stop.is_stopped() && pipes.is_empty() && state.lod_pending.is_empty() {
            log::trace!("tree loop shutting down");
            return;
        }
    }
}

impl LoopState {
    fn handle_insert(&mut self, event: InsertEvent) {
        let InsertEvent {
            header,
            attributes_id,
            locations,
        } = event;

        let input_id = header.input_id;

        self.inputs
            .add_storage_locations(input_id, attributes_id, locations);

        let points = TreePoints {
            subset: PointsSubset {
                input_id,
                offset: 0,
                count: header.public_header.point_count,
            },
            morton_min: header.morton_min,
            morton_max: header.morton_max,
            lod_span: header.lod_span,
        };

        self.epoch += 1;

        let result = if let Some(root) = self.registry.root() {
            let reader = StoragePointsReader::new(self.storage.as_ref(), self.inputs.as_ref());
            insert::add_points(&mut self.registry, &reader, root, points)
        } else {
            insert::initialize(&mut self.registry, points);
            Ok(Vec::new())
        };

        match result {
            Ok(stale) => {
                for subset in stale {
                    self.reclaim_chunk(subset.input_id);
                }
            }
            Err(e) => {
                log::error!("tree insertion of {input_id} failed: {e}");
                self.errors.post(e);
            }
        }

        self.inputs.handle_tree_done_with_input(input_id);
        self.maybe_start_lod();
    }

    fn reclaim_chunk(&mut self, input_id: crate::input::InputId) {
        if let Some((_, locations)) = self.inputs.remove_storage_locations(input_id) {
            for location in &locations {
                self.storage.blob_cache().remove(*location);
            }
            self.reclaimable.extend(locations);
        }
    }

    fn handle_lod_done(&mut self, event: LodDoneEvent) {
        let LodDoneEvent {
            work,
            epoch,
            result,
        } = event;

        self.lod_pending.remove(&(work.tree_id, work.level, work.skip));

        match result {
            Ok((header, attributes_id, locations)) => {
                if epoch != self.epoch {
                    // An insertion raced this generation; the node will be
                    // regenerated, the blobs are garbage.
                    log::debug!(
                        "dropping stale lod for {}@{}/{}",
                        work.tree_id,
                        work.level,
                        work.skip,
                    );
                    self.reclaimable.extend(locations);
                } else {
                    self.inputs
                        .add_storage_locations(header.input_id, attributes_id, locations);

                    if lod::graft(&mut self.registry, &work, &header).is_err() {
                        self.reclaim_chunk(header.input_id);
                    }
                }
            }
            Err(e) => {
                log::error!(
                    "lod generation for {}@{}/{} failed: {e}",
                    work.tree_id,
                    work.level,
                    work.skip,
                );
                self.errors.post(e);
            }
        }

        self.maybe_start_lod();
    }

    fn maybe_start_lod(&mut self) {
        let Some(watermark) = self.inputs.get_done_morton() else {
            return;
        };

        let work_items = lod::collect_work(&self.registry, watermark, &self.lod_pending);

        for work in work_items {
            self.lod_pending.insert((work.tree_id, work.level, work.skip));

            let target_input = self.inputs.next_lod_id();
            let epoch = self.epoch;
            let storage = self.storage.clone();
            let inputs = self.inputs.clone();
            let attributes = self.attributes.clone();
            let config = self.registry.config;
            let lod_done = self.pipes.lod_done.clone();

            self.pool.execute(move || {
                let generated =
                    lod::generate(&work, target_input, &storage, &inputs, &attributes, config);

                match generated {
                    Ok((header, attributes_id, buffers)) => {
                        let lod_done = lod_done.clone();
                        let work = work.clone();

                        storage.write(
                            header,
                            attributes_id,
                            buffers,
                            Box::new(move |header, attributes_id, result| {
                                lod_done.post(LodDoneEvent {
                                    work,
                                    epoch,
                                    result: result
                                        .map(|locations| (header, attributes_id, locations)),
                                });
                            }),
                        );
                    }
                    Err(e) => {
                        lod_done.post(LodDoneEvent {
                            work,
                            epoch,
                            result: Err(e),
                        });
                    }
                }
            });
        }
    }

    fn handle_control(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::Walk {
                view_projection,
                done,
            } => {
                let result = walker::walk_tree(&self.registry, &self.inputs, &view_projection);
                let _ = done.send(result);
            }
            ControlEvent::Checkpoint { done } => {
                let result = self.checkpoint();
                let _ = done.send(result);
            }
            ControlEvent::Status { done } => {
                let total_leaf_points = self
                    .registry
                    .iter()
                    .map(super::Tree::leaf_point_count)
                    .sum();

                let _ = done.send(TreeStatus {
                    tree_count: self.registry.len(),
                    root: self.registry.root(),
                    lod_in_flight: self.lod_pending.len(),
                    total_leaf_points,
                });
            }
            ControlEvent::PokeLod => self.maybe_start_lod(),
        }
    }

    /// Serializes trees and registry, then runs the three-phase root-index
    /// commit, reclaiming the previous checkpoint's blobs.
    fn checkpoint(&mut self) -> crate::Result<()> {
        let trees = self
            .registry
            .iter()
            .map(|tree| (tree.id, tree.encode_into_vec()))
            .collect::<Vec<_>>();

        let (tx, rx) = mpsc::sync_channel(1);
        self.storage.write_trees(
            trees,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        let written = rx.recv().map_err(|_| crate::Error::Unrecoverable)??;

        let blob = TreeRegistryBlob {
            config: Some(self.registry.config),
            root: self.registry.root(),
            trees: written.clone(),
            chunk_locations: self.inputs.snapshot_locations(),
        };

        let (tx, rx) = mpsc::sync_channel(1);
        self.storage.write_tree_registry(
            blob.encode_into_vec(),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        let registry_location = rx.recv().map_err(|_| crate::Error::Unrecoverable)??;

        let mut old_locations = std::mem::take(&mut self.reclaimable);
        old_locations.append(&mut self.prior_blob_locations);

        let (tx, rx) = mpsc::sync_channel(1);
        self.storage.write_blob_locations_and_update_header(
            registry_location,
            old_locations,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        rx.recv().map_err(|_| crate::Error::Unrecoverable)??;

        self.prior_blob_locations = written
            .into_iter()
            .map(|(_, location)| location)
            .chain(std::iter::once(registry_location))
            .collect();

        log::debug!(
            "checkpointed {} trees, registry at {registry_location}",
            self.registry.len(),
        );

        Ok(())
    }
}
