use byteorder::{ByteOrder, LittleEndian};
use octree_store::reader::{
    AttributeBuffers, InputHeader, InputSource, PreInitInfo, SourceFactory,
};
use octree_store::storage::PointCloudHeader;
use octree_store::{Attribute, Attributes, ScalarType};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rustc_hash::FxHashMap;
use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

/// World lattice used by all synthetic clouds.
pub const SCALE: f64 = 0.001;
pub const OFFSET: [f64; 3] = [0.0, 0.0, 0.0];

/// One synthetic input: integer lattice coordinates plus an intensity tag
/// per point.
#[derive(Clone, Debug)]
pub struct SyntheticCloud {
    pub points: Vec<[i32; 3]>,
    pub intensity: Vec<u16>,
}

impl SyntheticCloud {
    #[must_use]
    pub fn new(points: Vec<[i32; 3]>) -> Self {
        let intensity = (0..points.len()).map(|idx| idx as u16).collect();
        Self { points, intensity }
    }

    fn world_min(&self) -> [f64; 3] {
        let mut min = [f64::MAX; 3];
        for point in &self.points {
            for axis in 0..3 {
                min[axis] = min[axis].min(f64::from(point[axis]) * SCALE + OFFSET[axis]);
            }
        }
        min
    }
}

/// Factory serving [`SyntheticCloud`]s by path.
#[derive(Default)]
pub struct SyntheticFactory {
    clouds: Mutex<FxHashMap<PathBuf, SyntheticCloud>>,
}

impl SyntheticFactory {
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_cloud(&self, path: impl Into<PathBuf>, cloud: SyntheticCloud) {
        self.clouds
            .lock()
            .expect("lock is poisoned")
            .insert(path.into(), cloud);
    }
}

impl SourceFactory for SyntheticFactory {
    fn open(&self, path: &Path) -> octree_store::Result<Box<dyn InputSource>> {
        let cloud = self
            .clouds
            .lock()
            .expect("lock is poisoned")
            .get(path)
            .cloned()
            .ok_or_else(|| octree_store::Error::Input {
                path: path.into(),
                message: "file not found".into(),
            })?;

        Ok(Box::new(SyntheticSource { cloud, cursor: 0 }))
    }
}

struct SyntheticSource {
    cloud: SyntheticCloud,
    cursor: usize,
}

impl InputSource for SyntheticSource {
    fn pre_init(&mut self) -> octree_store::Result<PreInitInfo> {
        Ok(PreInitInfo {
            found_aabb_min: true,
            aabb_min: self.cloud.world_min(),
            approximate_point_count: self.cloud.points.len() as u64,
            approximate_point_size_bytes: 14,
        })
    }

    fn init(&mut self) -> octree_store::Result<InputHeader> {
        Ok(InputHeader {
            public_header: PointCloudHeader {
                point_count: self.cloud.points.len() as u64,
                offset: OFFSET,
                scale: [SCALE; 3],
                min: self.cloud.world_min(),
                max: [f64::MAX; 3],
            },
            attributes: Attributes {
                attributes: vec![
                    Attribute::new("xyz", ScalarType::I32, 3),
                    Attribute::new("intensity", ScalarType::U16, 1),
                ],
            },
        })
    }

    fn read_batch(
        &mut self,
        max_points: u32,
        out: &mut AttributeBuffers,
    ) -> octree_store::Result<u32> {
        let remaining = self.cloud.points.len() - self.cursor;
        let count = remaining.min(max_points as usize);

        for idx in self.cursor..self.cursor + count {
            for component in self.cloud.points[idx] {
                let mut bytes = [0u8; 4];
                LittleEndian::write_i32(&mut bytes, component);
                out.buffers[0].extend_from_slice(&bytes);
            }

            let mut bytes = [0u8; 2];
            LittleEndian::write_u16(&mut bytes, self.cloud.intensity[idx]);
            out.buffers[1].extend_from_slice(&bytes);
        }

        self.cursor += count;
        Ok(count as u32)
    }
}

/// A dense cube of lattice points covering Morton codes `0..=32767`
/// (coordinates below 32 per axis). Seeded so runs are reproducible.
#[must_use]
pub fn cube_cloud(count: usize) -> SyntheticCloud {
    let mut points = Vec::with_capacity(count);

    // corners first so the Morton range is pinned
    points.push([0, 0, 0]);
    points.push([31, 31, 31]);

    let mut rng = StdRng::seed_from_u64(0x2545_F491_4F6C_DD1D);
    while points.len() < count {
        points.push([
            rng.random_range(0..32),
            rng.random_range(0..32),
            rng.random_range(0..32),
        ]);
    }

    SyntheticCloud::new(points)
}

/// Loads the persisted forest back from a store file.
#[must_use]
pub fn reload_forest(
    path: &Path,
) -> (
    octree_store::TreeRegistry,
    octree_store::tree::serialize::TreeRegistryBlob,
) {
    let outcome = octree_store::StorageHandler::open(path, 1_000_000).expect("store opens");

    let blob = outcome.tree_registry_blob.expect("store has a registry");

    use octree_store::Decode;
    let registry_blob =
        octree_store::tree::serialize::TreeRegistryBlob::decode_from(&mut &blob[..])
            .expect("registry decodes");

    let registry = octree_store::tree::serialize::load_registry(
        &outcome.handler,
        &registry_blob,
        octree_store::TreeConfig::default(),
    )
    .expect("trees load");

    (registry, registry_blob)
}
