use octree_store::storage::{PointCloudHeader, StorageHandler, StorageHeader};
use octree_store::{AttributesId, Morton, Morton192, PointFormat, ScalarType, Slice};
use std::sync::mpsc;
use test_log::test;

fn header(data: u32, points: u64) -> StorageHeader {
    StorageHeader::new(
        octree_store::InputId { data, sub: 0 },
        PointCloudHeader {
            point_count: points,
            offset: [0.0; 3],
            scale: [0.001; 3],
            min: [0.0; 3],
            max: [1.0; 3],
        },
        Morton192::ZERO,
        Morton::<3>([4_095, 0, 0]),
        PointFormat::new(ScalarType::Morton64, 1),
    )
}

fn write_blob(storage: &StorageHandler, data: u32, bytes: usize) -> octree_store::Result<Vec<octree_store::StorageLocation>> {
    let (tx, rx) = mpsc::sync_channel(1);
    storage.write(
        header(data, bytes as u64 / 8),
        AttributesId(0),
        vec![Slice::from(vec![data as u8; bytes])],
        Box::new(move |_, _, result| {
            let _ = tx.send(result);
        }),
    );
    rx.recv().expect("write completes")
}

#[test]
fn allocator_state_survives_reopen() -> octree_store::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("store.jlp");

    let snapshot_before;

    {
        let outcome = StorageHandler::open(&path, 1_000_000)?;
        let storage = outcome.handler;
        storage.upgrade_to_write(false)?;

        // N registrations, then free a middle range through the commit.
        let mut locations = vec![];
        for idx in 0..6u32 {
            locations.push(write_blob(&storage, idx, 512 + idx as usize * 64)?);
        }

        let (tx, rx) = mpsc::sync_channel(1);
        storage.write_tree_registry(
            vec![0u8; 24],
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        let registry_location = rx.recv().expect("write completes")?;

        let middle = locations[3].clone();
        let (tx, rx) = mpsc::sync_channel(1);
        storage.write_blob_locations_and_update_header(
            registry_location,
            middle,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        rx.recv().expect("commit completes")?;

        snapshot_before = storage.snapshot()?.0;

        // The freed middle range is reusable.
        assert!(snapshot_before.free_section_count() >= 1);
    }

    let outcome = StorageHandler::open(&path, 1_000_000)?;
    let snapshot_after = outcome.handler.snapshot()?.0;

    use octree_store::Encode;
    assert_eq!(snapshot_after, snapshot_before);
    assert_eq!(
        snapshot_after.encode_into_vec(),
        snapshot_before.encode_into_vec(),
    );
    assert_eq!(snapshot_after.file_size(), snapshot_before.file_size());
    assert_eq!(snapshot_after.page_count(), snapshot_before.page_count());

    Ok(())
}
