// Copyright (c) 2024-present, octree-store contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    pool::default_worker_count,
    reader::{SourceFactory, DEFAULT_BATCH_POINT_TARGET},
    tree::TreeConfig,
    Converter,
};
use std::{path::PathBuf, sync::Arc};

/// Construction parameters of a store/converter.
///
/// # Examples
///
/// ```no_run
/// # use octree_store::Config;
/// # fn factory() -> std::sync::Arc<dyn octree_store::reader::SourceFactory> { unimplemented!() }
/// let converter = Config::new("clouds.jlp")
///     .node_limit(50_000)
///     .lattice(0.001, [0.0, 0.0, 0.0])
///     .open(factory())?;
/// # Ok::<(), octree_store::Error>(())
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    pub(crate) path: PathBuf,
    pub(crate) tree: TreeConfig,
    pub(crate) worker_threads: usize,
    pub(crate) batch_point_target: u32,
    pub(crate) read_sort_budget: u64,
    pub(crate) blob_cache_bytes: u64,
    pub(crate) truncate: bool,
}

impl Config {
    /// Creates a config for the store file at `path`.
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        let worker_threads = default_worker_count();

        Self {
            path: path.into(),
            tree: TreeConfig::default(),
            worker_threads,
            batch_point_target: DEFAULT_BATCH_POINT_TARGET,
            read_sort_budget: 1024 * 1024 * worker_threads as u64,
            blob_cache_bytes: 64 * 1024 * 1024,
            truncate: false,
        }
    }

    /// Point budget of a tree node before it splits.
    #[must_use]
    pub fn node_limit(mut self, node_limit: u64) -> Self {
        self.tree.node_limit = node_limit;
        self
    }

    /// World scale and offset of the store's fixed lattice.
    #[must_use]
    pub fn lattice(mut self, scale: f64, offset: [f64; 3]) -> Self {
        self.tree.scale = scale;
        self.tree.offset = offset;
        self
    }

    /// Number of worker-pool threads.
    #[must_use]
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = count.max(1);
        self
    }

    /// In-memory point target of one read batch.
    #[must_use]
    pub fn batch_point_target(mut self, points: u32) -> Self {
        self.batch_point_target = points.max(1);
        self
    }

    /// Byte budget of in-flight inputs in the read/sort pipeline.
    #[must_use]
    pub fn read_sort_budget(mut self, bytes: u64) -> Self {
        self.read_sort_budget = bytes.max(1);
        self
    }

    /// Capacity of the blob read cache.
    #[must_use]
    pub fn blob_cache_bytes(mut self, bytes: u64) -> Self {
        self.blob_cache_bytes = bytes;
        self
    }

    /// Discard any existing store content on open.
    #[must_use]
    pub fn truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }

    /// Opens (or creates) the store and spawns the converter subsystems.
    pub fn open(self, factory: Arc<dyn SourceFactory>) -> crate::Result<Converter> {
        Converter::open(self, factory)
    }
}
