mod common;

use common::{reload_forest, SyntheticCloud, SyntheticFactory, OFFSET, SCALE};
use octree_store::{Config, Morton, Morton192};
use test_log::test;

#[test]
fn overlapping_batch_is_included_in_the_same_leaf() -> octree_store::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("store.jlp");

    let factory = SyntheticFactory::shared();

    // Morton 0..=32767
    factory.add_cloud(
        "full.las",
        SyntheticCloud::new(vec![[0, 0, 0], [10, 10, 10], [31, 31, 31]]),
    );

    // Morton 16383..=32767 (upper half of the cell)
    factory.add_cloud(
        "upper.las",
        SyntheticCloud::new(vec![[31, 31, 15], [31, 31, 31]]),
    );

    let converter = Config::new(&path)
        .lattice(SCALE, OFFSET)
        .open(factory.clone())?;

    converter.add_data_files(["full.las", "upper.las"]);
    converter.wait_idle();
    converter.shutdown()?;

    let (registry, _) = reload_forest(&path);
    let tree = registry
        .get(registry.root().expect("forest has a root"))
        .expect("root tree exists");

    assert_eq!(tree.magnitude, 0);
    assert_eq!(tree.morton_min, Morton192::ZERO);
    assert_eq!(tree.morton_max, Morton::<3>([32_767, 0, 0]));

    // Still a leaf, now holding two subsets.
    assert_eq!(tree.nodes[0][0], 0);
    assert_eq!(tree.data[0][0].data.len(), 2);
    assert_eq!(tree.data[0][0].point_count, 5);

    // The second subset's range sits inside the first's.
    assert_eq!(tree.data[0][0].morton_min, Morton192::ZERO);
    assert_eq!(tree.data[0][0].morton_max, Morton::<3>([32_767, 0, 0]));

    Ok(())
}
