//! Joint split/search fuzzing of the B+tree, checked against `std::collections::BTreeMap`

use cidgraph::graph::{GraphStore, Label, PropertyMap, PropertyPath, PropertyValue};
use cidgraph::index::{BPlusTree, IndexDefinition, IndexScope};
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

#[derive(Debug, Clone)]
enum Step {
    Insert(i16, u64),
    Remove(i16, u64),
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (-200i16..200, 0u64..8).prop_map(|(k, id)| Step::Insert(k, id)),
        1 => (-200i16..200, 0u64..8).prop_map(|(k, id)| Step::Remove(k, id)),
    ]
}

fn model_range(model: &BTreeMap<i16, BTreeSet<u64>>, lo: i16, hi: i16) -> Vec<u64> {
    model
        .range(lo..=hi)
        .flat_map(|(_, ids)| ids.iter().copied())
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_every_inserted_key_is_found(
        order in 3usize..9,
        keys in prop::collection::vec(-500i32..500, 1..400)
    ) {
        let mut tree = BPlusTree::new(order);
        for (i, k) in keys.iter().enumerate() {
            tree.insert(*k, i as u64);
        }
        prop_assert!(tree.verify().is_ok());
        for (i, k) in keys.iter().enumerate() {
            prop_assert!(tree.contains(k, i as u64), "key {} (id {}) lost", k, i);
        }
        // Promoted separators are reachable like any other key
        for sep in tree.separators() {
            prop_assert!(tree.get(sep).is_some(), "separator {} not reachable", sep);
        }
        let distinct: BTreeSet<i32> = keys.iter().copied().collect();
        prop_assert_eq!(tree.len(), distinct.len());
        prop_assert_eq!(tree.keys().into_iter().copied().collect::<Vec<_>>(), distinct.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn prop_matches_model_under_mixed_operations(
        order in 3usize..7,
        steps in prop::collection::vec(step(), 1..300),
        lo in -250i16..250,
        span in 0i16..200
    ) {
        let mut tree = BPlusTree::new(order);
        let mut model: BTreeMap<i16, BTreeSet<u64>> = BTreeMap::new();
        for s in &steps {
            match *s {
                Step::Insert(k, id) => {
                    let fresh = model.entry(k).or_default().insert(id);
                    prop_assert_eq!(tree.insert(k, id), fresh);
                }
                Step::Remove(k, id) => {
                    let present = model.get_mut(&k).map(|ids| ids.remove(&id)).unwrap_or(false);
                    if model.get(&k).map(|ids| ids.is_empty()).unwrap_or(false) {
                        model.remove(&k);
                    }
                    prop_assert_eq!(tree.remove(&k, id), present);
                }
            }
        }
        prop_assert!(tree.verify().is_ok());
        for (k, ids) in &model {
            prop_assert_eq!(tree.get(k), Some(ids));
        }
        let hi = lo.saturating_add(span);
        prop_assert_eq!(
            tree.range(Bound::Included(&lo), Bound::Included(&hi)),
            model_range(&model, lo, hi)
        );
    }
}

#[test]
fn test_sequential_inserts_range_search() {
    let mut graph = GraphStore::new();
    let def = IndexDefinition::property("Item", "k");
    graph.create_index(def).unwrap();
    let mut ids = Vec::new();
    for k in 1..=100i64 {
        let mut props = PropertyMap::new();
        props.insert("k".to_string(), PropertyValue::Integer(k));
        ids.push(graph.add_entity(vec![Label::new("Item")], props).unwrap());
    }

    let found = graph
        .index_manager()
        .range_search(
            &IndexScope::Label(Label::new("Item")),
            &PropertyPath::from("k"),
            Bound::Included(&PropertyValue::Integer(40)),
            Bound::Included(&PropertyValue::Integer(60)),
        )
        .unwrap();
    assert_eq!(found.len(), 21);
    let expected: Vec<u64> = ids[39..60].iter().map(|id| id.as_u64()).collect();
    assert_eq!(found, expected);
    graph.index_manager().verify().unwrap();
}
