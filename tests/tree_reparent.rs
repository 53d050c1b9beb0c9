mod common;

use common::{reload_forest, SyntheticCloud, SyntheticFactory, OFFSET, SCALE};
use octree_store::{Config, Morton, Morton192};
use rand::{rngs::StdRng, Rng, SeedableRng};
use test_log::test;

/// A cloud inside the magnitude-0 cell starting at lattice x = 512
/// (Morton `2^27 .. 2^27 + 2^15`).
fn offset_cloud(count: usize) -> SyntheticCloud {
    let mut points = vec![[512, 0, 0], [512 + 31, 31, 31]];
    let mut rng = StdRng::seed_from_u64(0x9E37_79B9_7F4A_7C15);
    while points.len() < count {
        points.push([
            512 + rng.random_range(0..32),
            rng.random_range(0..32),
            rng.random_range(0..32),
        ]);
    }
    SyntheticCloud::new(points)
}

#[test]
fn reparent_attaches_old_root_at_nonzero_child_slot() -> octree_store::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("store.jlp");

    let factory = SyntheticFactory::shared();
    factory.add_cloud("offset.las", offset_cloud(64));
    factory.add_cloud("origin.las", common::cube_cloud(64));

    let converter = Config::new(&path)
        .lattice(SCALE, OFFSET)
        .open(factory.clone())?;

    // Two phases pin the insertion order: the offset cloud initializes the
    // root, the origin cloud then forces a reparent.
    converter.add_data_files(["offset.las"]);
    converter.wait_idle();

    converter.add_data_files(["origin.las"]);
    converter.wait_idle();
    converter.shutdown()?;

    let (registry, _) = reload_forest(&path);
    let root = registry.root().expect("forest has a root");
    let tree = registry.get(root).expect("root tree exists");

    // The new root grew one magnitude and covers both clouds.
    assert_eq!(tree.magnitude, 1);
    assert_eq!(tree.morton_min, Morton192::ZERO);
    assert_eq!(tree.morton_max, Morton::<3>([(1 << 30) - 1, 0, 0]));

    // Morton bit 27 is the x bit of LOD 9: the old root hangs at child
    // slot 1, the origin cloud at slot 0.
    assert_eq!(tree.nodes[0][0] & 0b11, 0b11);

    // Both clouds survive as magnitude-0 sub-trees.
    assert_eq!(tree.sub_trees.len(), 2);
    let mut total = 0;
    for sub_id in &tree.sub_trees {
        let sub = registry.get(*sub_id).expect("sub-tree exists");
        assert_eq!(sub.magnitude, 0);
        total += sub.data[0][0].point_count;
    }
    assert_eq!(total, 128);

    // Child order: the slot-0 sub-tree holds the origin cloud.
    let origin_sub = registry
        .get(tree.sub_trees[0])
        .expect("sub-tree exists");
    assert_eq!(origin_sub.morton_min, Morton192::ZERO);

    let offset_sub = registry
        .get(tree.sub_trees[1])
        .expect("sub-tree exists");
    assert_eq!(offset_sub.morton_min, Morton::<3>([1 << 27, 0, 0]));

    Ok(())
}
