// Copyright (c) 2024-present, octree-store contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Reader pipeline: pre-init scan, Morton-ordered admission, bounded
//! read/sort concurrency.
//!
//! Workers run on the shared pool and talk to the converter loop through a
//! typed event pipe; the input registry itself is mutex-protected and
//! updated from the workers directly.

pub mod sorter;
pub mod source;

pub use sorter::{sort_batch, SortedBatch};
pub use source::{AttributeBuffers, InputHeader, InputSource, PreInitInfo, SourceFactory};

use crate::{
    aabb::pos_to_morton,
    attributes::AttributesRegistry,
    event::EventPipe,
    input::{InputId, InputRegistry, NextInput},
    morton::Morton192,
    pool::ThreadPool,
    tree::TreeConfig,
};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

/// Default in-memory batch target, in points.
pub const DEFAULT_BATCH_POINT_TARGET: u32 = 20_000;

/// Events the pipeline posts to the converter loop.
pub enum ReaderEvent {
    PreInitDone {
        id: InputId,
        path: PathBuf,
        result: crate::Result<PreInitInfo>,
    },
    SortedBatch(Box<SortedBatch>),
    SortFailed {
        id: InputId,
        path: PathBuf,
        error: crate::Error,
    },
    ReadingDone {
        id: InputId,
        path: PathBuf,

        /// Budget bytes to release
        weight: u64,
        error: Option<crate::Error>,
    },
}

/// Tunables of the pipeline.
#[derive(Copy, Clone, Debug)]
pub struct ReaderOptions {
    pub batch_point_target: u32,

    /// Byte budget over `approximate_point_count * approximate_point_size`
    /// of in-flight inputs
    pub read_sort_budget: u64,

    pub lattice: TreeConfig,
}

/// The reader pipeline front end.
///
/// `add_file` schedules a pre-init; admission into the read phase happens
/// in Morton order and strictly within the byte budget.
#[derive(Clone)]
pub struct ReaderPipeline {
    factory: Arc<dyn SourceFactory>,
    pool: Arc<ThreadPool>,
    inputs: Arc<InputRegistry>,
    attributes: Arc<AttributesRegistry>,
    events: EventPipe<ReaderEvent>,
    options: ReaderOptions,

    active_size: Arc<AtomicU64>,
    in_flight: Arc<AtomicUsize>,
}

impl ReaderPipeline {
    #[must_use]
    pub fn new(
        factory: Arc<dyn SourceFactory>,
        pool: Arc<ThreadPool>,
        inputs: Arc<InputRegistry>,
        attributes: Arc<AttributesRegistry>,
        events: EventPipe<ReaderEvent>,
        options: ReaderOptions,
    ) -> Self {
        Self {
            factory,
            pool,
            inputs,
            attributes,
            events,
            options,
            active_size: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Registers an input and schedules its pre-init scan.
    pub fn add_file(&self, path: PathBuf) -> InputId {
        let id = self.inputs.register_file(&path);

        let factory = self.factory.clone();
        let events = self.events.clone();
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.in_flight.clone();

        self.pool.execute(move || {
            let result = factory
                .open(&path)
                .and_then(|mut source| source.pre_init());

            events.post(ReaderEvent::PreInitDone { id, path, result });
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        id
    }

    /// Records a pre-init result and schedules the input (converter loop).
    pub fn handle_pre_init_done(&self, id: InputId, info: &PreInitInfo) {
        let input_order = if info.found_aabb_min {
            pos_to_morton(
                self.options.lattice.scale,
                self.options.lattice.offset,
                info.aabb_min,
            )
        } else {
            // Inputs with no known minimum are scheduled last.
            Morton192::MAX
        };

        self.inputs.register_pre_init_result(
            id,
            input_order,
            info.approximate_point_count,
            info.approximate_point_size_bytes,
        );

        self.try_dispatch();
    }

    /// Admits inputs while the budget allows.
    pub fn try_dispatch(&self) {
        loop {
            let active = self.active_size.load(Ordering::SeqCst);
            if active >= self.options.read_sort_budget {
                return;
            }

            let Some(next) = self.inputs.next_input_to_process() else {
                return;
            };

            let weight = input_weight(&next);
            self.active_size.fetch_add(weight, Ordering::SeqCst);

            log::debug!(
                "dispatching input {} ({:?}, ~{} points)",
                next.id,
                next.path,
                next.approximate_point_count,
            );

            self.spawn_read_worker(next, weight);
        }
    }

    /// Bytes of budget freed when an input finishes (converter loop).
    pub fn handle_reading_done(&self, weight: u64) {
        self.active_size.fetch_sub(weight, Ordering::SeqCst);
        self.try_dispatch();
    }

    /// `true` when no worker of this pipeline is running or queued.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) == 0
    }

    fn spawn_read_worker(&self, next: NextInput, weight: u64) {
        let pipeline = self.clone();
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        self.pool.execute(move || {
            let error = pipeline.read_input(&next).err();

            // The budget is released by the converter loop when it drains
            // this event, keeping admission serialized there.
            pipeline.events.post(ReaderEvent::ReadingDone {
                id: next.id,
                path: next.path.clone(),
                weight,
                error,
            });

            pipeline.in_flight.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Runs on a worker: decode batches, hand each to a sort worker.
    fn read_input(&self, next: &NextInput) -> crate::Result<()> {
        let mut source = self.factory.open(&next.path)?;
        let header = self.init_input(next, source.as_mut())?;

        loop {
            let mut buffers = AttributeBuffers::for_attributes(&header.attributes);
            let read = source.read_batch(self.options.batch_point_target, &mut buffers)?;
            if read == 0 {
                return Ok(());
            }

            let chunk = self.inputs.handle_sub_added(next.id);
            self.spawn_sort_worker(chunk, next.path.clone(), &header, buffers);
        }
    }

    fn init_input(
        &self,
        next: &NextInput,
        source: &mut dyn InputSource,
    ) -> crate::Result<InputHeader> {
        let header = source.init()?;

        let source_attributes_id = self.attributes.intern(header.attributes.clone());
        self.inputs
            .handle_input_init(next.id, source_attributes_id, header.public_header);

        Ok(header)
    }

    fn spawn_sort_worker(
        &self,
        chunk: InputId,
        path: PathBuf,
        header: &InputHeader,
        buffers: AttributeBuffers,
    ) {
        let attributes = self.attributes.clone();
        let inputs = self.inputs.clone();
        let events = self.events.clone();
        let options = self.options;
        let header = header.clone();

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.in_flight.clone();

        self.pool.execute(move || {
            let result = sort_batch(
                chunk,
                &header.public_header,
                &header.attributes,
                &buffers,
                &attributes,
                &options.lattice,
            );

            match result {
                Ok(batch) => {
                    inputs.handle_sorted_points(
                        chunk,
                        batch.header.morton_min,
                        batch.header.morton_max,
                    );
                    events.post(ReaderEvent::SortedBatch(Box::new(batch)));
                }
                Err(error) => {
                    events.post(ReaderEvent::SortFailed {
                        id: chunk,
                        path,
                        error,
                    });
                }
            }

            in_flight.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

/// Approximate in-memory weight of an input, as used by the budget.
#[must_use]
pub fn input_weight(next: &NextInput) -> u64 {
    next.approximate_point_count
        .saturating_mul(u64::from(next.approximate_point_size_bytes))
        .max(1)
}
