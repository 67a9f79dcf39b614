use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use filter_stream::dispatch::dispatch_batch;
use filter_stream::wire::{decode_filter_set, encode_filter_set};
use filter_stream::{Filter, FilterRegistry, InboundBatch, StreamError, SubscriberId};

#[derive(Clone, Debug)]
enum Op {
    Add { id: u8, preload: bool },
    Remove { id: u8 },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..6, any::<bool>()).prop_map(|(id, preload)| Op::Add { id, preload }),
        (0u8..8).prop_map(|id| Op::Remove { id }),
    ]
}

fn sub(id: u8) -> SubscriberId {
    SubscriberId::new(format!("sub-{id}"))
}

fn filter_json(id: u8, preload: bool) -> String {
    format!(r#"{{"data_type":"t{id}","query":{{"keyword":["k{id}"]}},"options":{{"preload":{preload}}}}}"#)
}

fn apply(registry: &mut FilterRegistry, model: &mut BTreeMap<SubscriberId, bool>, op: &Op) {
    match *op {
        Op::Add { id, preload } => {
            let filter = Filter::parse(&sub(id), &filter_json(id, preload)).unwrap();
            registry.insert(filter, Arc::new(|_: &InboundBatch| {}));
            for value in model.values_mut() {
                *value = false;
            }
            model.insert(sub(id), preload);
        }
        Op::Remove { id } => {
            let removed = registry.remove(&sub(id));
            assert_eq!(removed, model.remove(&sub(id)).is_some());
            if removed {
                for value in model.values_mut() {
                    *value = false;
                }
            }
        }
    }
}

proptest! {
    #[test]
    fn filters_match_registered_set(ops in prop::collection::vec(arb_op(), 0..40)) {
        let mut registry = FilterRegistry::new();
        let mut model = BTreeMap::new();
        for op in &ops {
            apply(&mut registry, &mut model, op);
        }

        let actual: BTreeMap<SubscriberId, bool> = registry
            .filters()
            .into_iter()
            .map(|f| (f.subscriber_id().unwrap(), f.preload()))
            .collect();
        prop_assert_eq!(actual, model);
        prop_assert_eq!(registry.len(), registry.filters().len());
    }

    #[test]
    fn only_newest_filter_may_preload(ops in prop::collection::vec(arb_op(), 1..40)) {
        let mut registry = FilterRegistry::new();
        let mut model = BTreeMap::new();
        for op in &ops {
            apply(&mut registry, &mut model, op);
        }
        let preloading = registry.filters().iter().filter(|f| f.preload()).count();
        prop_assert!(preloading <= 1);
    }

    #[test]
    fn encoded_filter_set_round_trips(ops in prop::collection::vec(arb_op(), 0..40)) {
        let mut registry = FilterRegistry::new();
        let mut model = BTreeMap::new();
        for op in &ops {
            apply(&mut registry, &mut model, op);
        }

        let filters = registry.filters();
        let encoded = encode_filter_set(&filters).unwrap();
        let decoded = decode_filter_set(&format!("/{encoded}")).unwrap();

        prop_assert_eq!(decoded.len(), filters.len());
        for filter in &filters {
            prop_assert_eq!(decoded.get(&filter.subscriber_id().unwrap()), Some(filter));
        }
    }

    #[test]
    fn batch_reaches_exactly_its_owner(
        registered in prop::collection::btree_set(0u8..10, 1..6),
        target in 0u8..12,
        entities in 1usize..5,
    ) {
        let mut registry = FilterRegistry::new();
        let mut counters = BTreeMap::new();
        for &id in &registered {
            let count = Arc::new(AtomicUsize::new(0));
            let c = count.clone();
            registry.insert(
                Filter::parse(&sub(id), "{}").unwrap(),
                Arc::new(move |batch: &InboundBatch| {
                    assert_eq!(batch.data.len(), entities);
                    c.fetch_add(1, Ordering::SeqCst);
                }),
            );
            counters.insert(id, count);
        }

        let batch = InboundBatch {
            data_type: None,
            data: (0..entities)
                .map(|n| serde_json::json!({ "callback": sub(target).as_str(), "n": n }))
                .collect(),
        };
        let result = dispatch_batch(&registry, &batch);

        if registered.contains(&target) {
            prop_assert_eq!(result, Ok(Some(sub(target))));
        } else {
            prop_assert_eq!(result, Err(StreamError::UnknownSubscriber(sub(target))));
        }
        for (id, count) in &counters {
            let expected = usize::from(*id == target);
            prop_assert_eq!(count.load(Ordering::SeqCst), expected);
        }
    }
}
