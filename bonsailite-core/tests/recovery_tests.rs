// Crash-recovery behavior: committed units survive reopen, incomplete and
// rolled-back units are undone, and any WAL prefix replays to the state of
// its last complete unit.

use bonsailite_core::{
    BincodeCodec, BonsaiKey, BonsaiStorage, BonsaiTree, BucketPointer, StorageConfig, WalRecord,
    WriteAheadLog,
};
use tempfile::TempDir;

type StringTree = BonsaiTree<String, BincodeCodec<String>>;

fn config() -> StorageConfig {
    StorageConfig {
        page_size: 4096,
        bucket_size: 512,
        extension: "bsb".to_string(),
    }
}

fn root_pointer(cfg: &StorageConfig) -> BucketPointer {
    BucketPointer::new(0, cfg.root_bucket_offset())
}

#[test]
fn test_clean_restart_preserves_state() {
    let temp_dir = TempDir::new().unwrap();

    {
        let storage = BonsaiStorage::open(temp_dir.path(), config()).unwrap();
        let tree: StringTree =
            BonsaiTree::create("links", 0, 1, BincodeCodec::new(), storage.clone()).unwrap();
        for k in 1..=100i64 {
            tree.put(BonsaiKey::int(k), &format!("v{}", k)).unwrap();
        }
        tree.flush().unwrap();
    }

    let storage = BonsaiStorage::open(temp_dir.path(), config()).unwrap();
    let tree: StringTree = BonsaiTree::load(
        "links",
        root_pointer(&config()),
        1,
        BincodeCodec::new(),
        storage,
    )
    .unwrap();

    assert_eq!(tree.size().unwrap(), 100);
    for k in 1..=100i64 {
        assert_eq!(
            tree.get(&BonsaiKey::int(k)).unwrap(),
            Some(format!("v{}", k))
        );
    }
}

#[test]
fn test_committed_units_replay_without_cache_flush() {
    let temp_dir = TempDir::new().unwrap();

    {
        let storage = BonsaiStorage::open(temp_dir.path(), config()).unwrap();
        let tree: StringTree =
            BonsaiTree::create("links", 0, 1, BincodeCodec::new(), storage.clone()).unwrap();
        for k in 1..=40i64 {
            tree.put(BonsaiKey::int(k), &format!("v{}", k)).unwrap();
        }
        // Crash: dirty pages never reach disk, only the WAL does
    }

    let storage = BonsaiStorage::open(temp_dir.path(), config()).unwrap();
    let tree: StringTree = BonsaiTree::load(
        "links",
        root_pointer(&config()),
        1,
        BincodeCodec::new(),
        storage,
    )
    .unwrap();

    assert_eq!(tree.size().unwrap(), 40);
    assert_eq!(tree.get(&BonsaiKey::int(17)).unwrap().as_deref(), Some("v17"));
}

#[test]
fn test_s6_crash_before_unit_end_rolls_back() {
    let temp_dir = TempDir::new().unwrap();

    {
        let storage = BonsaiStorage::open(temp_dir.path(), config()).unwrap();
        let tree: StringTree =
            BonsaiTree::create("links", 0, 1, BincodeCodec::new(), storage.clone()).unwrap();
        for k in 1..=5i64 {
            tree.put(BonsaiKey::int(k), &format!("v{}", k)).unwrap();
        }
        tree.flush().unwrap();

        // Open an outer unit; the ten puts nest inside it and the End record
        // is never written
        storage.atomic().start_atomic_operation().unwrap();
        for k in 100..110i64 {
            tree.put(BonsaiKey::int(k), &format!("v{}", k)).unwrap();
        }
        // Crash before endAtomicOperation
    }

    let storage = BonsaiStorage::open(temp_dir.path(), config()).unwrap();
    let tree: StringTree = BonsaiTree::load(
        "links",
        root_pointer(&config()),
        1,
        BincodeCodec::new(),
        storage,
    )
    .unwrap();

    assert_eq!(tree.size().unwrap(), 5);
    for k in 1..=5i64 {
        assert_eq!(
            tree.get(&BonsaiKey::int(k)).unwrap(),
            Some(format!("v{}", k))
        );
    }
    for k in 100..110i64 {
        assert_eq!(tree.get(&BonsaiKey::int(k)).unwrap(), None, "key {} leaked", k);
    }
}

#[test]
fn test_rolled_back_unit_is_undone_on_reopen() {
    let temp_dir = TempDir::new().unwrap();

    {
        let storage = BonsaiStorage::open(temp_dir.path(), config()).unwrap();
        let tree: StringTree =
            BonsaiTree::create("links", 0, 1, BincodeCodec::new(), storage.clone()).unwrap();
        tree.put(BonsaiKey::int(1), &"keep".to_string()).unwrap();

        storage.atomic().start_atomic_operation().unwrap();
        tree.put(BonsaiKey::int(2), &"discard".to_string()).unwrap();
        storage.atomic().end_atomic_operation(true).unwrap();
    }

    let storage = BonsaiStorage::open(temp_dir.path(), config()).unwrap();
    let tree: StringTree = BonsaiTree::load(
        "links",
        root_pointer(&config()),
        1,
        BincodeCodec::new(),
        storage,
    )
    .unwrap();

    assert_eq!(tree.get(&BonsaiKey::int(1)).unwrap().as_deref(), Some("keep"));
    assert_eq!(tree.get(&BonsaiKey::int(2)).unwrap(), None);
    assert_eq!(tree.size().unwrap(), 1);
}

/// Property 8: truncating the WAL at any record boundary and replaying
/// yields the state of the last complete atomic unit before the cut.
#[test]
fn test_wal_prefix_replays_to_last_complete_unit() {
    let base_dir = TempDir::new().unwrap();

    {
        let storage = BonsaiStorage::open(base_dir.path(), config()).unwrap();
        let tree: StringTree =
            BonsaiTree::create("links", 0, 1, BincodeCodec::new(), storage.clone()).unwrap();
        storage.flush().unwrap();
        for k in 1..=20i64 {
            tree.put(BonsaiKey::int(k), &format!("v{}", k)).unwrap();
        }
        // Crash without flushing the cache
    }

    let wal_len = {
        let wal = WriteAheadLog::open(base_dir.path().join("storage.wal")).unwrap();
        wal.records().unwrap().len()
    };
    assert!(wal_len > 20);

    // Cut at a spread of record boundaries past the create unit
    for cut in (4..=wal_len).step_by(7) {
        let work_dir = TempDir::new().unwrap();
        for name in ["storage.wal", "links.bsb", "name_id.map"] {
            std::fs::copy(base_dir.path().join(name), work_dir.path().join(name)).unwrap();
        }

        // Truncate to the first `cut` records
        let truncated: Vec<WalRecord> = {
            let wal_path = work_dir.path().join("storage.wal");
            let wal = WriteAheadLog::open(&wal_path).unwrap();
            let records = wal.records().unwrap();
            drop(wal);
            let end_offset = if cut < records.len() {
                records[cut].0
            } else {
                u64::MAX
            };
            if end_offset != u64::MAX {
                let file = std::fs::OpenOptions::new()
                    .write(true)
                    .open(&wal_path)
                    .unwrap();
                file.set_len(end_offset).unwrap();
            }
            let wal = WriteAheadLog::open(&wal_path).unwrap();
            let remaining = wal.records().unwrap();
            remaining.into_iter().map(|(_, r)| r).collect()
        };

        // Complete put-units in the prefix (the first End closes the create)
        let complete_units = truncated
            .iter()
            .filter(|r| matches!(r, WalRecord::AtomicUnitEnd { rollback: false, .. }))
            .count();
        let expected_keys = complete_units.saturating_sub(1) as i64;

        let storage = BonsaiStorage::open(work_dir.path(), config()).unwrap();
        let tree: StringTree = BonsaiTree::load(
            "links",
            root_pointer(&config()),
            1,
            BincodeCodec::new(),
            storage,
        )
        .unwrap();

        assert_eq!(
            tree.size().unwrap(),
            expected_keys as u64,
            "cut at record {}",
            cut
        );
        for k in 1..=expected_keys {
            assert_eq!(
                tree.get(&BonsaiKey::int(k)).unwrap(),
                Some(format!("v{}", k)),
                "cut at record {}, key {}",
                cut,
                k
            );
        }
        if expected_keys < 20 {
            assert_eq!(
                tree.get(&BonsaiKey::int(expected_keys + 1)).unwrap(),
                None,
                "cut at record {} resurrected key {}",
                cut,
                expected_keys + 1
            );
        }
    }
}

#[test]
fn test_splits_survive_crash_recovery() {
    let temp_dir = TempDir::new().unwrap();

    {
        let storage = BonsaiStorage::open(temp_dir.path(), config()).unwrap();
        let tree: StringTree =
            BonsaiTree::create("links", 0, 1, BincodeCodec::new(), storage.clone()).unwrap();
        // Enough keys to cascade splits through internal levels
        for k in 1..=400i64 {
            tree.put(BonsaiKey::int(k), &format!("v{}", k)).unwrap();
        }
        // Crash without cache flush
    }

    let storage = BonsaiStorage::open(temp_dir.path(), config()).unwrap();
    let tree: StringTree = BonsaiTree::load(
        "links",
        root_pointer(&config()),
        1,
        BincodeCodec::new(),
        storage,
    )
    .unwrap();

    assert_eq!(tree.size().unwrap(), 400);
    assert_eq!(tree.first_key().unwrap(), Some(BonsaiKey::int(1)));
    assert_eq!(tree.last_key().unwrap(), Some(BonsaiKey::int(400)));
    let all = tree
        .get_values_major(&BonsaiKey::int(i64::MIN), true, -1)
        .unwrap();
    assert_eq!(all.len(), 400);
}
