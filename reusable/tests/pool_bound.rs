//! The pool bound is process-wide configuration, so this file holds a single test.
use std::sync::Arc;

use reusable::dispatch::enter_worker_region;
use reusable::{
    cached_objects, cached_slots, clear_slot_pool, pooled, CompletionSource, Config,
    PooledFuture,
};

struct Item(usize);

fn gated(gate: &Arc<CompletionSource<()>>, id: usize) -> PooledFuture<Item> {
    let gate = Arc::clone(gate);
    pooled(async move {
        gate.future().await?;
        Ok(Item(id))
    })
}

#[test]
fn pools_never_exceed_max_pool_size() {
    Config::new().with_max_pool_size(4).install().unwrap();
    assert_eq!(Config::current().max_pool_size(), 4);

    // Ten operations in flight at once each hold their own slot.
    let gates: Vec<_> = (0..10).map(|_| Arc::new(CompletionSource::new())).collect();
    let futures: Vec<_> = gates
        .iter()
        .enumerate()
        .map(|(id, gate)| gated(gate, id))
        .collect();
    for gate in &gates {
        enter_worker_region(|| gate.set_result(()).unwrap());
    }
    for (id, fut) in futures.into_iter().enumerate() {
        assert_eq!(fut.wait().unwrap().0, id);
    }
    assert_eq!(cached_slots::<Item>(), 4);
    assert!(cached_objects() >= 4);

    clear_slot_pool::<Item>();
    assert_eq!(cached_slots::<Item>(), 0);

    // Sequential operations keep reusing a single slot.
    let gate = Arc::new(CompletionSource::new());
    for id in 0..10 {
        let fut = gated(&gate, id);
        enter_worker_region(|| gate.set_result(()).unwrap());
        assert_eq!(fut.wait().unwrap().0, id);
        assert_eq!(cached_slots::<Item>(), 1);
    }

    assert!(Config::new().install().unwrap_err().is_invalid_operation());
}
