// Property-based tests using proptest
use std::collections::BTreeMap;
use std::sync::Arc;

use bonsailite_core::{
    BincodeCodec, BonsaiKey, BonsaiStorage, BonsaiTree, Document, FieldValue, RecordSerializer,
    StorageConfig,
};
use proptest::prelude::*;
use tempfile::TempDir;

type StringTree = BonsaiTree<String, BincodeCodec<String>>;

fn small_config() -> StorageConfig {
    StorageConfig {
        page_size: 4096,
        bucket_size: 512,
        extension: "bsb".to_string(),
    }
}

fn fresh_tree() -> (TempDir, Arc<BonsaiStorage>, StringTree) {
    let temp_dir = TempDir::new().unwrap();
    let storage = BonsaiStorage::open(temp_dir.path(), small_config()).unwrap();
    let tree = BonsaiTree::create("links", 0, 1, BincodeCodec::new(), storage.clone()).unwrap();
    (temp_dir, storage, tree)
}

#[derive(Debug, Clone)]
enum Op {
    Put(i64, String),
    Remove(i64),
    Get(i64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0i64..200, "[a-z]{0,24}").prop_map(|(k, v)| Op::Put(k, v)),
        (0i64..200).prop_map(Op::Remove),
        (0i64..200).prop_map(Op::Get),
    ]
}

// ========== PROPERTY 1: tree agrees with an in-memory ordered map ==========

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_tree_matches_model(ops in prop::collection::vec(op_strategy(), 1..80)) {
        let (_temp, _storage, tree) = fresh_tree();
        let mut model: BTreeMap<i64, String> = BTreeMap::new();

        for op in &ops {
            match op {
                Op::Put(k, v) => {
                    tree.put(BonsaiKey::int(*k), v).unwrap();
                    model.insert(*k, v.clone());
                }
                Op::Remove(k) => {
                    let removed = tree.remove(&BonsaiKey::int(*k)).unwrap();
                    assert_eq!(removed, model.remove(k));
                }
                Op::Get(k) => {
                    assert_eq!(tree.get(&BonsaiKey::int(*k)).unwrap(), model.get(k).cloned());
                }
            }
        }

        assert_eq!(tree.size().unwrap(), model.len() as u64);

        let scanned = tree.get_values_major(&BonsaiKey::int(i64::MIN), true, -1).unwrap();
        let expected: Vec<String> = model.values().cloned().collect();
        assert_eq!(scanned, expected);

        assert_eq!(
            tree.first_key().unwrap(),
            model.keys().next().map(|k| BonsaiKey::int(*k))
        );
        assert_eq!(
            tree.last_key().unwrap(),
            model.keys().next_back().map(|k| BonsaiKey::int(*k))
        );
    }
}

// ========== PROPERTY 2: insertion order does not matter ==========

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_insertion_order_independent(keys in prop::collection::hash_set(0i64..1000, 1..60)) {
        let mut ascending: Vec<i64> = keys.iter().copied().collect();
        ascending.sort_unstable();
        let descending: Vec<i64> = ascending.iter().rev().copied().collect();

        let (_temp1, _s1, tree1) = fresh_tree();
        for k in &ascending {
            tree1.put(BonsaiKey::int(*k), &format!("v{}", k)).unwrap();
        }
        let (_temp2, _s2, tree2) = fresh_tree();
        for k in &descending {
            tree2.put(BonsaiKey::int(*k), &format!("v{}", k)).unwrap();
        }

        let scan1 = tree1.get_values_major(&BonsaiKey::int(i64::MIN), true, -1).unwrap();
        let scan2 = tree2.get_values_major(&BonsaiKey::int(i64::MIN), true, -1).unwrap();
        assert_eq!(scan1, scan2);
        assert_eq!(tree1.first_key().unwrap(), tree2.first_key().unwrap());
        assert_eq!(tree1.last_key().unwrap(), tree2.last_key().unwrap());
    }
}

// ========== PROPERTY 3: size tracks inserts minus removes ==========

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_size_is_inserts_minus_removes(
        keys in prop::collection::hash_set(0i64..500, 1..80),
        remove_mask in prop::collection::vec(any::<bool>(), 80),
    ) {
        let (_temp, _storage, tree) = fresh_tree();

        let keys: Vec<i64> = keys.into_iter().collect();
        for k in &keys {
            tree.put(BonsaiKey::int(*k), &format!("v{}", k)).unwrap();
        }

        let mut removed = 0u64;
        for (k, flag) in keys.iter().zip(remove_mask.iter()) {
            if *flag {
                assert!(tree.remove(&BonsaiKey::int(*k)).unwrap().is_some());
                removed += 1;
            }
        }

        assert_eq!(tree.size().unwrap(), keys.len() as u64 - removed);
    }
}

// ========== PROPERTY 4: equal-range scans return exact matches ==========

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_equal_range_is_point_lookup(
        keys in prop::collection::hash_set(0i64..300, 1..50),
        probe in 0i64..300,
    ) {
        let (_temp, _storage, tree) = fresh_tree();
        for k in &keys {
            tree.put(BonsaiKey::int(*k), &format!("v{}", k)).unwrap();
        }

        let range = tree
            .get_values_between(&BonsaiKey::int(probe), true, &BonsaiKey::int(probe), true, -1)
            .unwrap();

        if keys.contains(&probe) {
            assert_eq!(range, vec![format!("v{}", probe)]);
        } else {
            assert!(range.is_empty());
        }
    }
}

// ========== PROPERTY 5: record serializer round trip ==========

fn field_value_strategy() -> impl Strategy<Value = FieldValue> {
    prop_oneof![
        Just(FieldValue::Null),
        any::<bool>().prop_map(FieldValue::Bool),
        any::<i64>().prop_map(FieldValue::Int),
        (-1.0e9f64..1.0e9).prop_map(FieldValue::Float),
        "[ -~]{0,32}".prop_map(FieldValue::Str),
    ]
}

proptest! {
    #[test]
    fn prop_record_roundtrip(
        values in prop::collection::vec(field_value_strategy(), 4),
    ) {
        let schema: Vec<String> = (0..4).map(|i| format!("f{}", i)).collect();
        let serializer = RecordSerializer::new(schema.clone());

        let mut doc = Document::new();
        for (field, value) in schema.iter().zip(values.iter()) {
            if *value != FieldValue::Null {
                doc.set(field.clone(), value.clone());
            }
        }

        let line = serializer.to_record(&doc).unwrap();
        let restored = serializer.from_record(&line).unwrap();
        assert_eq!(restored, doc);
    }
}
