mod common;

use common::{cube_cloud, reload_forest, SyntheticFactory, OFFSET, SCALE};
use octree_store::{Config, Morton, Morton192};
use test_log::test;

#[test]
fn node_over_limit_splits_into_children() -> octree_store::Result<()> {
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

    let (registry, _) = reload_forest(&path);
    let tree = registry
        .get(registry.root().expect("forest has a root"))
        .expect("root tree exists");

    // The root node split: child mask set, children materialized below.
    assert_ne!(tree.nodes[0][0], 0);
    assert_eq!(
        tree.nodes[1].len(),
        usize::from(tree.nodes[0][0].count_ones() as u8),
    );

    // Root data is either gone or a synthesized LOD (never leaf input).
    for subset in &tree.data[0][0].data {
        assert!(subset.input_id.is_lod_synthetic());
    }

    // Every leaf subset stays within its child cell (I3) and the leaf
    // points add up.
    let lod = tree.level_lod(0);
    let mut leaf_points = 0;
    for (mask, collection) in tree.nodes[1].iter().zip(&tree.data[1]) {
        if *mask == 0 && !collection.is_empty() {
            leaf_points += collection.point_count;
            assert_eq!(
                collection.morton_min.child_at(lod),
                collection.morton_max.child_at(lod),
            );
        }
    }
    assert_eq!(leaf_points, 512);

    // Skips stay consistent with the child-mask popcounts (I1).
    let mut prefix = 0u32;
    for (idx, mask) in tree.nodes[0].iter().enumerate() {
        assert_eq!(tree.skips[0][idx], prefix);
        prefix += mask.count_ones();
    }

    // The persisted range is still the full cell.
    assert_eq!(tree.morton_min, Morton192::ZERO);
    assert_eq!(tree.morton_max, Morton::<3>([32_767, 0, 0]));

    Ok(())
}
