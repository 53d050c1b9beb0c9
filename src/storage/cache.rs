// Copyright (c) 2024-present, octree-store contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::location::StorageLocation;
use crate::Slice;
use quick_cache::{sync::Cache as QuickCache, Weighter};

#[derive(Clone)]
struct BlobWeighter;

impl Weighter<(u32, u64), Slice> for BlobWeighter {
    fn weight(&self, _: &(u32, u64), blob: &Slice) -> u64 {
        blob.len() as u64
    }
}

/// In-memory cache of blobs read from the backing file.
///
/// The render path re-reads the same nodes frame after frame; caching by
/// `(file_id, offset)` keeps hot nodes off the disk. Offsets are never
/// recycled while a referencing tree node is alive, so entries are
/// invalidated by eviction or explicit removal on blob deletion.
pub struct BlobCache {
    data: QuickCache<(u32, u64), Slice, BlobWeighter, rustc_hash::FxBuildHasher>,
    capacity: u64,
}

impl BlobCache {
    /// Creates a cache with roughly `bytes` of capacity.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn with_capacity_bytes(bytes: u64) -> Self {
        use quick_cache::sync::DefaultLifecycle;

        let opts = quick_cache::OptionsBuilder::new()
            .weight_capacity(bytes)
            .hot_allocation(0.9)
            .estimated_items_capacity(100_000)
            .build()
            .expect("cache options should be valid");

        #[allow(clippy::default_trait_access)]
        let quick_cache = QuickCache::with_options(
            opts,
            BlobWeighter,
            Default::default(),
            DefaultLifecycle::default(),
        );

        Self {
            data: quick_cache,
            capacity: bytes,
        }
    }

    /// Returns the amount of cached bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.data.weight()
    }

    /// Returns the cache capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn insert(&self, location: StorageLocation, blob: Slice) {
        self.data.insert((location.file_id, location.offset), blob);
    }

    #[must_use]
    pub fn get(&self, location: StorageLocation) -> Option<Slice> {
        self.data.get(&(location.file_id, location.offset))
    }

    /// Drops a blob that is being deleted from the store.
    pub fn remove(&self, location: StorageLocation) {
        self.data.remove(&(location.file_id, location.offset));
    }
}
