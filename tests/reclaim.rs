//! Reclamation properties of the hazard manager, driven through its
//! public interface.

use conset::{HazardManager, ThreadRegistry};

#[derive(Default)]
struct Block {
    _payload: [u64; 4],
}

#[test]
fn allocates_fresh_nodes_below_the_retirement_threshold() {
    let registry = ThreadRegistry::new(1);
    let ctx = registry
        .register()
        .unwrap_or_else(|e| panic!("registry: {e}"));
    // threshold = (slots + 1) * threads = 2 retired nodes.
    let manager: HazardManager<Block> = HazardManager::new(1, 1, 0);

    let a = manager.acquire(&ctx);
    let b = manager.acquire(&ctx);
    manager.retire(&ctx, a);
    manager.retire(&ctx, b);

    // Two retired nodes do not exceed the threshold, so nothing may be
    // recycled yet.
    let c = manager.acquire(&ctx);
    assert_ne!(c, a);
    assert_ne!(c, b);
    manager.retire(&ctx, c);
}

#[test]
fn recycles_once_the_pigeonhole_bound_is_reached() {
    let registry = ThreadRegistry::new(1);
    let ctx = registry
        .register()
        .unwrap_or_else(|e| panic!("registry: {e}"));
    let manager: HazardManager<Block> = HazardManager::new(1, 1, 0);

    let mut retired = Vec::new();
    for _ in 0..8 {
        let node = manager.acquire(&ctx);
        retired.push(node);
        manager.retire(&ctx, node);
    }

    // No hazards are published, so the next acquire must recycle one of
    // the retired nodes instead of allocating.
    let node = manager.acquire(&ctx);
    assert!(retired.contains(&node));
    manager.retire(&ctx, node);
}

#[test]
fn a_foreign_hazard_blocks_recycling() {
    let registry = ThreadRegistry::new(2);
    let watcher = registry
        .register()
        .unwrap_or_else(|e| panic!("registry: {e}"));
    let worker = registry
        .register()
        .unwrap_or_else(|e| panic!("registry: {e}"));
    let manager: HazardManager<Block> = HazardManager::new(2, 2, 0);

    let pinned = manager.acquire(&worker);
    manager.publish(&watcher, 0, pinned);
    manager.retire(&worker, pinned);

    // Push the worker far past its threshold; the pinned node must never
    // come back while the watcher's hazard stands.
    for _ in 0..64 {
        let node = manager.acquire(&worker);
        assert_ne!(node, pinned, "recycled a node another thread had published");
        manager.retire(&worker, node);
    }

    manager.release(&watcher, 0);
    let mut recycled = false;
    for _ in 0..64 {
        let node = manager.acquire(&worker);
        if node == pinned {
            recycled = true;
            break;
        }
        manager.retire(&worker, node);
    }
    assert!(recycled, "released node was never recycled");
}

#[test]
fn retiring_null_is_a_no_op() {
    let registry = ThreadRegistry::new(1);
    let ctx = registry
        .register()
        .unwrap_or_else(|e| panic!("registry: {e}"));
    let manager: HazardManager<Block> = HazardManager::new(1, 2, 4);

    manager.retire(&ctx, std::ptr::null_mut());
    let node = manager.acquire(&ctx);
    assert!(!node.is_null());
    manager.retire(&ctx, node);
}
