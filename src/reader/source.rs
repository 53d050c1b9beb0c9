// Copyright (c) 2024-present, octree-store contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{attributes::Attributes, storage::PointCloudHeader};
use std::path::Path;

/// Result of the cheap pre-scan of an input file.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PreInitInfo {
    /// `true` if the header exposed a bounding-box minimum
    pub found_aabb_min: bool,

    /// World-space AABB minimum (valid when `found_aabb_min`)
    pub aabb_min: [f64; 3],

    pub approximate_point_count: u64,
    pub approximate_point_size_bytes: u8,
}

/// Header produced by a source's `init`, including the source-format
/// attribute schema (the leading attribute is the position column).
#[derive(Clone, Debug)]
pub struct InputHeader {
    pub public_header: PointCloudHeader,
    pub attributes: Attributes,
}

/// One output buffer per attribute, filled by `read_batch`.
#[derive(Debug, Default)]
pub struct AttributeBuffers {
    pub buffers: Vec<Vec<u8>>,
}

impl AttributeBuffers {
    /// Allocates one empty buffer per attribute of the schema.
    #[must_use]
    pub fn for_attributes(attributes: &Attributes) -> Self {
        Self {
            buffers: attributes.attributes.iter().map(|_| Vec::new()).collect(),
        }
    }
}

/// A pluggable point-cloud decoder (the LAS/LAZ reader implements this
/// outside the core).
///
/// Lifecycle: `pre_init` may be called on a fresh instance for the cheap
/// header scan; a second instance is opened for the full `init` /
/// `read_batch` loop.
pub trait InputSource: Send {
    /// Cheap header scan: approximate size and an optional AABB minimum
    /// used for Morton-ordered scheduling.
    fn pre_init(&mut self) -> crate::Result<PreInitInfo>;

    /// Full header read; fills the public header and the attribute schema.
    fn init(&mut self) -> crate::Result<InputHeader>;

    /// Decodes up to `max_points` into one buffer per attribute; returns
    /// the number of points read, 0 when exhausted.
    fn read_batch(&mut self, max_points: u32, out: &mut AttributeBuffers) -> crate::Result<u32>;
}

/// Opens an [`InputSource`] for a path.
pub trait SourceFactory: Send + Sync {
    fn open(&self, path: &Path) -> crate::Result<Box<dyn InputSource>>;
}

impl<F> SourceFactory for F
where
    F: Fn(&Path) -> crate::Result<Box<dyn InputSource>> + Send + Sync,
{
    fn open(&self, path: &Path) -> crate::Result<Box<dyn InputSource>> {
        self(path)
    }
}
