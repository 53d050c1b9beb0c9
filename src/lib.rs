// Copyright (c) 2024-present, octree-store contributors
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! An on-disk, Morton-keyed sparse octree store for massive point clouds.
//!
//! The converter ingests point-cloud inputs (LAS/LAZ decoding is plugged in
//! through the [`reader::InputSource`] trait), Morton-sorts them on a fixed
//! world lattice and writes attribute blobs into a single backing file
//! governed by a page-partitioned free-space allocator. Point references are
//! organized as a forest of five-level octrees keyed by 192-bit Morton
//! codes; coarser levels of detail are synthesized in the background once
//! ingestion passes their cells. A frustum walker serves view-culled reads
//! back to a renderer.
//!
//! ```no_run
//! use octree_store::Config;
//! # fn las_factory() -> std::sync::Arc<dyn octree_store::reader::SourceFactory> {
//! #     unimplemented!()
//! # }
//!
//! let converter = Config::new("clouds.jlp")
//!     .lattice(0.001, [0.0, 0.0, 0.0])
//!     .open(las_factory())?;
//!
//! converter.add_data_files(["a.las", "b.las"]);
//! converter.wait_idle();
//!
//! // Serve a frame
//! let view_projection = cgmath::Matrix4::from_scale(1.0);
//! let draw_groups = converter.walk(view_projection)?;
//!
//! // Clean shutdown rewrites the root index; only then is the file
//! // guaranteed consistent.
//! converter.shutdown()?;
//! # Ok::<(), octree_store::Error>(())
//! ```

#![doc(html_root_url = "https://docs.rs/octree-store/0.1.0")]
#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::all, missing_docs)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![warn(clippy::multiple_crate_versions)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]

#[doc(hidden)]
pub mod aabb;

#[doc(hidden)]
pub mod allocator;

mod attributes;

#[doc(hidden)]
pub mod coding;

mod config;
mod converter;
mod error;

#[doc(hidden)]
pub mod event;

mod format;
mod frustum;

#[doc(hidden)]
pub mod hash;

mod input;

#[doc(hidden)]
pub mod morton;

#[doc(hidden)]
pub mod pool;

pub mod reader;
mod slice;

#[doc(hidden)]
pub mod stop_signal;

pub mod storage;
pub mod tree;

#[doc(hidden)]
pub use {
    allocator::{BlobAllocator, FreeSection, PAGE_SIZE},
    coding::{Decode, DecodeError, Encode, EncodeError},
    event::{EventPipe, LoopSignal},
    pool::ThreadPool,
};

pub use {
    aabb::Aabb,
    attributes::{Attribute, Attributes, AttributesId, AttributesRegistry},
    config::Config,
    converter::{Converter, ConverterStatus, RuntimeCallbacks},
    error::{Error, Result},
    format::{PointFormat, ScalarType},
    frustum::{Containment, Frustum},
    input::{InputId, InputRegistry},
    morton::{Morton, Morton128, Morton192, Morton64},
    slice::Slice,
    storage::{PointCloudHeader, StorageHandler, StorageHeader, StorageLocation},
    tree::{
        walker::{DrawGroup, DrawType, WalkResult},
        Tree, TreeConfig, TreeId, TreeRegistry,
    },
};
