mod common;

use common::{cube_cloud, reload_forest, SyntheticCloud, SyntheticFactory, OFFSET, SCALE};
use octree_store::{Config, ConverterStatus, Morton, Morton192, RuntimeCallbacks};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use test_log::test;

#[test]
fn multi_input_conversion_conserves_points_and_reports_progress(
) -> octree_store::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("store.jlp");

    let factory = SyntheticFactory::shared();
    factory.add_cloud("a.las", cube_cloud(300));
    factory.add_cloud("b.las", cube_cloud(200));
    factory.add_cloud("c.las", cube_cloud(100));

    let converter = Config::new(&path)
        .lattice(SCALE, OFFSET)
        .node_limit(256)
        // small batches exercise the chunking path
        .batch_point_target(128)
        .open(factory.clone())?;

    let progressed = Arc::new(AtomicU64::new(0));
    let done_fired = Arc::new(AtomicBool::new(false));

    converter.set_runtime_callbacks(RuntimeCallbacks {
        progress: Some(Box::new({
            let progressed = progressed.clone();
            move |ingested, _total| {
                progressed.fetch_max(ingested, Ordering::SeqCst);
            }
        })),
        warning: None,
        error: None,
        done: Some(Box::new({
            let done_fired = done_fired.clone();
            move || {
                done_fired.store(true, Ordering::SeqCst);
            }
        })),
    });

    converter.add_data_files(["a.las", "b.las", "c.las"]);
    converter.wait_idle();

    assert_eq!(converter.status(), ConverterStatus::Completed);
    assert!(done_fired.load(Ordering::SeqCst));
    assert_eq!(progressed.load(Ordering::SeqCst), 600);

    // A wide-open view hits everything.
    let view = cgmath::Matrix4::from_scale(1e-6);
    let walk = converter.walk(view)?;
    assert!(!walk.groups.is_empty());

    let drawn: u64 = walk.groups.iter().map(|group| group.draw_size).sum();
    assert!(drawn >= 600, "leaves plus LOD copies are visible");

    // Every referenced buffer is readable.
    for group in &walk.groups {
        for buffer in &group.buffers {
            let blob = converter.read_blob(buffer.location)?;
            assert_eq!(blob.len() as u32, buffer.location.size);
        }
    }

    converter.shutdown()?;

    // Ingested leaf points survive the round trip.
    let (registry, _) = reload_forest(&path);
    let mut total = 0;
    for tree in registry.iter() {
        total += tree.leaf_point_count();
    }
    assert_eq!(total, 600);

    Ok(())
}

#[test]
fn failing_input_surfaces_as_warning_and_conversion_continues(
) -> octree_store::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("store.jlp");

    let factory = SyntheticFactory::shared();
    factory.add_cloud("good.las", cube_cloud(64));
    // "missing.las" is never registered with the factory

    let converter = Config::new(&path)
        .lattice(SCALE, OFFSET)
        .open(factory.clone())?;

    let warnings = Arc::new(AtomicU64::new(0));
    converter.set_runtime_callbacks(RuntimeCallbacks {
        progress: None,
        warning: Some(Box::new({
            let warnings = warnings.clone();
            move |_path, _message| {
                warnings.fetch_add(1, Ordering::SeqCst);
            }
        })),
        error: None,
        done: None,
    });

    converter.add_data_files(["good.las", "missing.las"]);
    converter.wait_idle();

    assert_eq!(warnings.load(Ordering::SeqCst), 1);
    assert_eq!(converter.status(), ConverterStatus::Completed);

    converter.shutdown()?;

    let (registry, _) = reload_forest(&path);
    let tree = registry
        .get(registry.root().expect("forest has a root"))
        .expect("root tree exists");
    assert_eq!(tree.data[0][0].point_count, 64);

    Ok(())
}

#[test]
fn lod_nodes_are_synthesized_for_split_nodes() -> octree_store::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("store.jlp");

    let factory = SyntheticFactory::shared();
    factory.add_cloud("a.las", cube_cloud(256));
    factory.add_cloud("b.las", cube_cloud(256));

    let converter = Config::new(&path)
        .lattice(SCALE, OFFSET)
        .node_limit(256)
        .open(factory.clone())?;

    converter.add_data_files(["a.las", "b.las"]);
    converter.wait_idle();
    converter.shutdown()?;

    let (registry, blob) = reload_forest(&path);
    let tree = registry
        .get(registry.root().expect("forest has a root"))
        .expect("root tree exists");

    // The split root carries a synthetic down-sampled copy of its children.
    assert_ne!(tree.nodes[0][0], 0);
    assert_eq!(tree.data[0][0].data.len(), 1);

    let synthetic = &tree.data[0][0].data[0];
    assert!(synthetic.input_id.is_lod_synthetic());

    // Down-sampled to an eighth of the 512 source points.
    assert_eq!(tree.data[0][0].point_count, 64);

    // The synthetic chunk's Morton column is stored and sorted.
    let entry = blob
        .chunk_locations
        .iter()
        .find(|(id, ..)| *id == synthetic.input_id)
        .expect("synthetic chunk persisted");

    let outcome = octree_store::StorageHandler::open(&path, 1_000_000)?;
    let stored = outcome.handler.read_sync(entry.2[0])?;
    let (header, data) = octree_store::storage::deserialize_points(&stored)?;
    assert_eq!(header.public_header.point_count, 64);

    let column = octree_store::tree::decode_morton_column(&header, &data)?;
    assert!(column.windows(2).all(|pair| pair[0] <= pair[1]));
    assert!(column.first() >= Some(&Morton192::ZERO));
    assert!(column.last() <= Some(&Morton::<3>([32_767, 0, 0])));

    Ok(())
}
