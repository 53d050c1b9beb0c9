// Copyright (c) 2024-present, octree-store contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Converter facade and master loop.
//!
//! Wires the subsystems together: reader events drive storage writes,
//! storage completions drive tree insertions, completed inputs advance the
//! LOD watermark. A clean shutdown checkpoints trees, the registry, the
//! attribute table and the free-space map before rewriting the root record.

use crate::{
    attributes::AttributesRegistry,
    coding::Decode,
    config::Config,
    event::{spawn_loop, EventPipe, LoopSignal},
    input::InputRegistry,
    pool::ThreadPool,
    reader::{ReaderEvent, ReaderOptions, ReaderPipeline, SourceFactory},
    stop_signal::StopSignal,
    storage::{StorageHandler, StorageLocation},
    tree::{
        handler::TreeHandler,
        serialize::{load_registry, TreeRegistryBlob},
        walker::WalkResult,
        TreeRegistry,
    },
    Slice,
};
use cgmath::Matrix4;
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Condvar, Mutex,
    },
    time::Duration,
};

/// Coarse converter state.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConverterStatus {
    InProgress,
    Completed,
    Error,
}

type ProgressFn = Box<dyn Fn(u64, u64) + Send + Sync>;
type WarningFn = Box<dyn Fn(&Path, &str) + Send + Sync>;
type ErrorFn = Box<dyn Fn(&crate::Error) + Send + Sync>;
type DoneFn = Box<dyn Fn() + Send + Sync>;

/// User-facing callbacks, all optional.
#[derive(Default)]
pub struct RuntimeCallbacks {
    /// `(ingested points, approximate total points)`
    pub progress: Option<ProgressFn>,

    /// Per-input failures (the conversion continues)
    pub warning: Option<WarningFn>,

    /// Global failures
    pub error: Option<ErrorFn>,

    /// All registered inputs are read, inserted and LOD-covered
    pub done: Option<DoneFn>,
}

#[derive(Default)]
struct StatusInner {
    completed: bool,
    errored: bool,
}

struct StatusCell {
    inner: Mutex<StatusInner>,
    changed: Condvar,
}

#[allow(clippy::expect_used)]
impl StatusCell {
    fn new() -> Self {
        Self {
            inner: Mutex::new(StatusInner::default()),
            changed: Condvar::new(),
        }
    }

    fn set_completed(&self, completed: bool) -> bool {
        let mut inner = self.inner.lock().expect("lock is poisoned");
        let transition = completed && !inner.completed;
        inner.completed = completed;
        drop(inner);

        self.changed.notify_all();
        transition
    }

    fn set_errored(&self) {
        let mut inner = self.inner.lock().expect("lock is poisoned");
        inner.errored = true;
        drop(inner);

        self.changed.notify_all();
    }

    fn status(&self) -> ConverterStatus {
        let inner = self.inner.lock().expect("lock is poisoned");
        if inner.errored {
            ConverterStatus::Error
        } else if inner.completed {
            ConverterStatus::Completed
        } else {
            ConverterStatus::InProgress
        }
    }

    fn wait_idle(&self) {
        let mut inner = self.inner.lock().expect("lock is poisoned");
        while !inner.completed && !inner.errored {
            inner = self.changed.wait(inner).expect("lock is poisoned");
        }
    }
}

/// The converter: ingests point-cloud files into the octree store.
pub struct Converter {
    pipeline: ReaderPipeline,
    tree: Arc<TreeHandler>,
    pool: Arc<ThreadPool>,
    storage: Arc<StorageHandler>,
    inputs: Arc<InputRegistry>,
    attributes: Arc<AttributesRegistry>,

    callbacks: Arc<Mutex<RuntimeCallbacks>>,
    status: Arc<StatusCell>,

    /// Guards the window between registering inputs and the idle check
    adding: Arc<AtomicUsize>,

    master_signal: LoopSignal,
    master_stop: StopSignal,
    master_thread: Option<std::thread::JoinHandle<()>>,

    shut_down: bool,
}

impl Converter {
    pub(crate) fn open(config: Config, factory: Arc<dyn SourceFactory>) -> crate::Result<Self> {
        let outcome = StorageHandler::open(&config.path, config.blob_cache_bytes)?;
        outcome.handler.upgrade_to_write(config.truncate)?;

        let storage = Arc::new(outcome.handler);
        let attributes = outcome.attributes;
        let inputs = Arc::new(InputRegistry::new());

        // Recover the forest of a previous run.
        let (tree_registry, prior_blob_locations) = if let Some(blob) = outcome.tree_registry_blob
        {
            let registry_blob = TreeRegistryBlob::decode_from(&mut &blob[..])
                .map_err(crate::Error::Decode)?;

            let registry = load_registry(&storage, &registry_blob, config.tree)?;
            inputs.restore_locations(registry_blob.chunk_locations.clone());

            let (_, root_index) = storage.snapshot()?;
            let mut prior: Vec<StorageLocation> = registry_blob
                .trees
                .iter()
                .map(|(_, location)| *location)
                .collect();
            prior.push(root_index.tree_registry);

            (registry, prior)
        } else {
            (TreeRegistry::new(config.tree), Vec::new())
        };

        let pool = Arc::new(ThreadPool::new(config.worker_threads));

        let master_signal = LoopSignal::new();
        let reader_events = EventPipe::new(master_signal.clone());
        let tree_errors = EventPipe::new(master_signal.clone());

        let tree = Arc::new(TreeHandler::spawn(
            tree_registry,
            storage.clone(),
            inputs.clone(),
            attributes.clone(),
            pool.clone(),
            prior_blob_locations,
            tree_errors.clone(),
        ));

        let pipeline = ReaderPipeline::new(
            factory,
            pool.clone(),
            inputs.clone(),
            attributes.clone(),
            reader_events.clone(),
            ReaderOptions {
                batch_point_target: config.batch_point_target,
                read_sort_budget: config.read_sort_budget,
                lattice: config.tree,
            },
        );

        let callbacks = Arc::new(Mutex::new(RuntimeCallbacks::default()));
        let status = Arc::new(StatusCell::new());
        let adding = Arc::new(AtomicUsize::new(0));
        let master_stop = StopSignal::default();

        let master_thread = {
            let state = MasterState {
                pipeline: pipeline.clone(),
                tree: tree.clone(),
                storage: storage.clone(),
                inputs: inputs.clone(),
                callbacks: callbacks.clone(),
                status: status.clone(),
                adding: adding.clone(),
                ingested: Arc::new(AtomicU64::new(0)),
            };
            let signal = master_signal.clone();
            let stop = master_stop.clone();

            spawn_loop("octree-converter", move || {
                master_loop(&state, &reader_events, &tree_errors, &signal, &stop);
            })
        };

        Ok(Self {
            pipeline,
            tree,
            pool,
            storage,
            inputs,
            attributes,
            callbacks,
            status,
            adding,
            master_signal,
            master_stop,
            master_thread: Some(master_thread),
            shut_down: false,
        })
    }

    /// Installs the user-facing callbacks.
    #[allow(clippy::expect_used)]
    pub fn set_runtime_callbacks(&self, callbacks: RuntimeCallbacks) {
        *self.callbacks.lock().expect("lock is poisoned") = callbacks;
    }

    /// Registers input files for conversion.
    pub fn add_data_files<I, P>(&self, paths: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.adding.fetch_add(1, Ordering::SeqCst);
        self.status.set_completed(false);

        for path in paths {
            let path = path.into();
            let id = self.pipeline.add_file(path.clone());
            log::info!("registered input {id}: {path:?}");
        }

        self.adding.fetch_sub(1, Ordering::SeqCst);
        self.master_signal.notify();
    }

    /// Blocks until every registered input is read, inserted and
    /// LOD-covered (or a global error occurred).
    pub fn wait_idle(&self) {
        self.status.wait_idle();
    }

    /// Current coarse state.
    #[must_use]
    pub fn status(&self) -> ConverterStatus {
        self.status.status()
    }

    /// Runs a frustum walk against the current forest.
    pub fn walk(&self, view_projection: Matrix4<f64>) -> crate::Result<WalkResult> {
        self.tree.walk(view_projection)
    }

    /// Reads a blob for the renderer (served from the blob cache when hot).
    pub fn read_blob(&self, location: StorageLocation) -> crate::Result<Slice> {
        self.storage.read_sync(location)
    }

    /// The interned attribute sets of the store.
    #[must_use]
    pub fn attributes(&self) -> &Arc<AttributesRegistry> {
        &self.attributes
    }

    /// The input registry of the store.
    #[must_use]
    pub fn inputs(&self) -> &Arc<InputRegistry> {
        &self.inputs
    }

    /// Serializes the current forest and rewrites the root record.
    pub fn checkpoint(&self) -> crate::Result<()> {
        self.tree.checkpoint()
    }

    /// Waits for outstanding work, checkpoints and tears the subsystems
    /// down. After this the store file is consistent.
    pub fn shutdown(mut self) -> crate::Result<()> {
        self.shutdown_inner()
    }

    fn shutdown_inner(&mut self) -> crate::Result<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        self.wait_idle();

        self.master_stop.send();
        self.master_signal.notify();
        if let Some(thread) = self.master_thread.take() {
            if thread.join().is_err() {
                log::error!("converter loop panicked");
            }
        }

        // On the error path wait_idle returns early; still drain in-flight
        // requests so no completion callback outlives its subsystem.
        while self.storage.pending_requests() > 0 || self.tree.pending_inserts() > 0 {
            std::thread::sleep(Duration::from_millis(5));
        }

        self.tree.checkpoint()
    }
}

impl Drop for Converter {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown_inner() {
            log::error!("converter shutdown failed: {e}");
        }
    }
}

struct MasterState {
    pipeline: ReaderPipeline,
    tree: Arc<TreeHandler>,
    storage: Arc<StorageHandler>,
    inputs: Arc<InputRegistry>,
    callbacks: Arc<Mutex<RuntimeCallbacks>>,
    status: Arc<StatusCell>,
    adding: Arc<AtomicUsize>,
    ingested: Arc<AtomicU64>,
}

fn master_loop(
    state: &MasterState,
    reader_events: &EventPipe<ReaderEvent>,
    tree_errors: &EventPipe<crate::Error>,
    signal: &LoopSignal,
    stop: &StopSignal,
) {
    loop {
        // Idle transitions (tree insertions finishing, LOD waves draining)
        // have no dedicated event, so the loop also ticks periodically.
        let _ = signal.wait_timeout(Duration::from_millis(25));

        for event in reader_events.drain() {
            state.handle_reader_event(event);
        }

        for error in tree_errors.drain() {
            state.on_global_error(&error);
        }

        state.update_idle();

        if stop.is_stopped() && reader_events.is_empty() && tree_errors.is_empty() {
            log::trace!("converter loop shutting down");
            return;
        }
    }
}

#[allow(clippy::expect_used)]
impl MasterState {
    fn handle_reader_event(&self, event: ReaderEvent) {
        match event {
            ReaderEvent::PreInitDone { id, path, result } => match result {
                Ok(info) => self.pipeline.handle_pre_init_done(id, &info),
                Err(e) => {
                    self.inputs.mark_failed(id);
                    self.warn(&path, &e);
                }
            },

            ReaderEvent::SortedBatch(batch) => {
                let crate::reader::SortedBatch {
                    header,
                    attributes_id,
                    buffers,
                } = *batch;

                self.ingested
                    .fetch_add(header.public_header.point_count, Ordering::SeqCst);

                let tree = self.tree.clone();
                let inputs = self.inputs.clone();
                let status = self.status.clone();
                let callbacks = self.callbacks.clone();

                self.storage.write(
                    header,
                    attributes_id,
                    buffers,
                    Box::new(move |header, attributes_id, result| match result {
                        Ok(locations) => {
                            tree.insert(header, attributes_id, locations);
                        }
                        Err(e) => {
                            log::error!("storage write of {} failed: {e}", header.input_id);
                            inputs.mark_failed(header.input_id);
                            status.set_errored();
                            if let Some(error) =
                                &callbacks.lock().expect("lock is poisoned").error
                            {
                                error(&e);
                            }
                        }
                    }),
                );

                self.progress();
            }

            ReaderEvent::SortFailed { id, path, error } => {
                self.inputs.mark_failed(id);
                self.warn(&path, &error);
            }

            ReaderEvent::ReadingDone {
                id,
                path,
                weight,
                error,
            } => {
                if let Some(e) = error {
                    self.inputs.mark_failed(id);
                    self.warn(&path, &e);
                } else {
                    self.inputs.handle_reading_done(id);
                }

                self.pipeline.handle_reading_done(weight);
                self.tree.poke_lod();
                self.progress();
            }
        }
    }

    fn warn(&self, path: &Path, error: &crate::Error) {
        log::warn!("input {path:?} failed: {error}");
        if let Some(warning) = &self.callbacks.lock().expect("lock is poisoned").warning {
            warning(path, &error.to_string());
        }
    }

    fn on_global_error(&self, error: &crate::Error) {
        self.status.set_errored();
        if let Some(callback) = &self.callbacks.lock().expect("lock is poisoned").error {
            callback(error);
        }
    }

    fn progress(&self) {
        if let Some(progress) = &self.callbacks.lock().expect("lock is poisoned").progress {
            progress(
                self.ingested.load(Ordering::SeqCst),
                self.inputs.approximate_total_points(),
            );
        }
    }

    fn update_idle(&self) {
        let idle = self.adding.load(Ordering::SeqCst) == 0
            && self.pipeline.is_idle()
            && self.tree.pending_inserts() == 0
            && self.storage.pending_requests() == 0
            && self.inputs.all_inserted_into_tree()
            && self
                .tree
                .status()
                .map(|status| status.lod_in_flight == 0)
                .unwrap_or(false);

        if self.status.set_completed(idle) {
            log::info!("conversion idle; all inputs inserted");

            if !self.inputs.is_empty() {
                if let Some(done) = &self.callbacks.lock().expect("lock is poisoned").done {
                    done();
                }
            }
        }
    }
}
