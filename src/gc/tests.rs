//! Collector tests: registration, roots, mark/sweep, stats

use super::*;
use crate::object::{GcWeak, Tracer};
use std::sync::atomic::AtomicUsize;

/// Graph node with one owning and one non-owning edge
struct Node {
    next: Mutex<Gc<Node>>,
    weak_next: Mutex<GcWeak<Node>>,
    drops: Arc<AtomicUsize>,
}

impl Node {
    fn new(drops: &Arc<AtomicUsize>) -> Self {
        Self {
            next: Mutex::new(Gc::null()),
            weak_next: Mutex::new(GcWeak::null()),
            drops: Arc::clone(drops),
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

impl Traceable for Node {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        tracer.visit(&*self.next.lock());
        tracer.visit_weak(&*self.weak_next.lock());
    }
}

/// Fixed-size leaf payload
struct Blob([u64; 4]);

impl Traceable for Blob {}

struct Exploding;

/// Hands its child to an outside owner the first time it is traced, the
/// way a mutator thread can move a handle between two tracer visits
struct Shedding {
    child: Mutex<Gc<Node>>,
    outside: Arc<Mutex<Vec<Gc<Node>>>>,
}

impl Traceable for Shedding {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        let mut child = self.child.lock();
        tracer.visit(&*child);
        if !child.is_null() {
            self.outside.lock().push(std::mem::take(&mut *child));
        }
    }
}

/// Drops what it owns while holding its field lock inside `trace`, as a
/// mutator reassigning the field during a collection would
struct Releasing {
    owned: Mutex<Gc<Node>>,
}

impl Traceable for Releasing {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        let mut owned = self.owned.lock();
        tracer.visit(&*owned);
        owned.reset();
    }
}

/// Destructor that takes a while
struct SlowDrop;

impl Drop for SlowDrop {
    fn drop(&mut self) {
        std::thread::sleep(Duration::from_millis(80));
    }
}

impl Traceable for SlowDrop {}

impl Traceable for Exploding {
    fn trace(&self, _tracer: &mut Tracer<'_>) {
        panic!("trace exploded");
    }
}

fn manual() -> Collector {
    Collector::initialize(GcConfig::manual()).unwrap()
}

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

#[cfg(test)]
mod registration_tests {
    use super::*;

    #[test]
    fn test_alloc_registers() {
        let gc = manual();
        let a = gc.alloc(1u32).unwrap();
        let _b = gc.alloc(2u32).unwrap();

        assert_eq!(gc.registered_object_count(), 2);
        assert!(gc.is_registered(&a));
    }

    #[test]
    fn test_register_unregister_round_trip() {
        let gc = manual();
        let obj = gc.alloc(1u32).unwrap();
        let before = gc.registered_object_count();

        assert!(gc.unregister_object(&obj));
        assert!(!gc.unregister_object(&obj), "idempotent");
        assert_eq!(gc.registered_object_count(), before - 1);

        assert!(gc.register_object(&obj));
        assert!(!gc.register_object(&obj), "idempotent");
        assert_eq!(gc.registered_object_count(), before);
    }

    #[test]
    fn test_null_handles_are_ignored() {
        let gc = manual();
        let null: Gc<u32> = Gc::null();

        assert!(!gc.register_object(&null));
        assert!(!gc.unregister_object(&null));
        assert!(!gc.add_root_object(&null));
        assert_eq!(gc.registered_object_count(), 0);
    }

    #[test]
    fn test_unregister_also_unroots() {
        let gc = manual();
        let obj = gc.alloc(1u32).unwrap();

        assert!(gc.add_root_object(&obj));
        assert_eq!(gc.root_count(), 1);
        gc.unregister_object(&obj);
        assert_eq!(gc.root_count(), 0);
        assert!(obj.is_valid(), "unregistering does not destroy");
    }

    #[test]
    fn test_dead_object_cannot_be_rooted() {
        let gc = manual();
        let obj = gc.alloc(1u32).unwrap();
        let weak = obj.downgrade();
        drop(obj);

        assert!(!gc.add_root_object(&weak));
        assert_eq!(gc.root_count(), 0);
    }

    #[test]
    fn test_set_root_objects_replaces() {
        let gc = manual();
        let a = gc.alloc(1u32).unwrap();
        let b = gc.alloc(2u32).unwrap();
        let c = gc.alloc(3u32).unwrap();

        gc.add_root_object(&a);
        gc.set_root_objects([&b, &c]);

        assert_eq!(gc.root_count(), 2);
        assert!(!gc.is_root(&a));
        assert!(gc.is_root(&b) && gc.is_root(&c));
    }

    #[test]
    fn test_root_guard_unpins_on_drop() {
        let gc = manual();
        let obj = gc.alloc(1u32).unwrap();

        {
            let guard = gc.root_guard(&obj);
            assert!(guard.is_pinned());
            assert!(gc.is_root(&obj));
        }
        assert!(!gc.is_root(&obj));

        // A guard over an existing root leaves it pinned
        gc.add_root_object(&obj);
        drop(gc.root_guard(&obj));
        assert!(gc.is_root(&obj));
    }

    #[test]
    fn test_heap_limit() {
        let gc = Collector::initialize(GcConfig::manual().with_max_heap_bytes(200)).unwrap();

        let mut held = Vec::new();
        let err = loop {
            match gc.alloc(Blob([0; 4])) {
                Ok(obj) => held.push(obj),
                Err(e) => break e,
            }
        };

        assert!(matches!(err, GcError::AllocationFailed { limit: 200, .. }));
        assert!(!held.is_empty());
        assert!(gc.memory_usage().current_bytes <= 200);

        // Freed bytes become available again
        held.pop();
        assert!(gc.alloc(Blob([0; 4])).is_ok());
    }
}

#[cfg(test)]
mod collection_tests {
    use super::*;

    #[test]
    fn test_collects_unowned_objects() {
        let gc = manual();
        let drops = counter();
        for _ in 0..3 {
            gc.alloc(Node::new(&drops)).unwrap().disown();
        }

        assert_eq!(gc.collect(true), 3);
        assert_eq!(drops.load(Ordering::SeqCst), 3);

        let stats = gc.stats();
        assert_eq!(stats.total_collections, 1);
        assert_eq!(stats.objects_collected, 3);
        assert_eq!(stats.objects_alive, 0);
        assert_eq!(stats.bytes_reclaimed, 3 * std::mem::size_of::<crate::object::GcBox<Node>>() as u64);
        assert!(stats.last_collection_at.is_some());
    }

    #[test]
    fn test_owned_objects_survive() {
        let gc = manual();
        let drops = counter();
        let held = gc.alloc(Node::new(&drops)).unwrap();

        assert_eq!(gc.collect(false), 0);
        assert!(held.is_valid());
        assert!(held.is_marked(), "positive refcount makes it an implicit root");
        assert_eq!(drops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unregistered_objects_are_not_swept() {
        let gc = manual();
        let weak = gc.alloc(1u32).unwrap().disown();
        gc.unregister_object(&weak);

        assert_eq!(gc.collect(true), 0);
        assert!(weak.is_alive());
        assert_eq!(gc.allocated_object_count(), 1);
    }

    #[test]
    fn test_reachability_through_root_chain() {
        let gc = manual();
        let drops = counter();

        let root = gc.alloc(Node::new(&drops)).unwrap();
        let a = gc.alloc(Node::new(&drops)).unwrap();
        let b = gc.alloc(Node::new(&drops)).unwrap();
        *root.get().unwrap().weak_next.lock() = a.downgrade();
        *a.get().unwrap().weak_next.lock() = b.downgrade();
        gc.add_root_object(&root);

        let a = a.disown();
        let b = b.disown();
        assert_eq!(a.ref_count(), 0);

        assert_eq!(gc.collect(true), 0);
        assert!(a.is_alive() && b.is_alive());
        assert!(a.is_marked() && b.is_marked());

        gc.remove_root_object(&root);
        *root.get().unwrap().weak_next.lock() = GcWeak::null();

        assert_eq!(gc.collect(true), 2);
        assert!(!a.is_alive() && !b.is_alive());
        assert!(root.is_valid());
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_deep_chain_marks_iteratively() {
        let gc = manual();
        let drops = counter();

        let head = gc.alloc(Node::new(&drops)).unwrap();
        let mut tail = head.downgrade();
        for _ in 0..50_000 {
            let next = gc.alloc(Node::new(&drops)).unwrap();
            if let Some(t) = tail.get() {
                *t.weak_next.lock() = next.downgrade();
            }
            tail = next.disown();
        }

        assert_eq!(gc.collect(false), 0);
        assert!(tail.is_marked());
    }

    #[test]
    fn test_cycle_survives_refcount_policy() {
        let gc = manual();
        let drops = counter();
        let (a, b) = make_cycle(&gc, &drops);

        assert_eq!(gc.collect(true), 0);
        assert!(a.is_alive() && b.is_alive());
        assert_eq!(a.ref_count(), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cycle_reclaimed_by_external_refcount_policy() {
        let config = GcConfig::manual().with_root_policy(RootPolicy::ExternalRefCount);
        let gc = Collector::initialize(config).unwrap();
        let drops = counter();
        let (a, b) = make_cycle(&gc, &drops);

        assert_eq!(gc.collect(true), 2);
        assert!(!a.is_alive() && !b.is_alive());
        assert_eq!(drops.load(Ordering::SeqCst), 2);
        assert_eq!(gc.allocated_object_count(), 0);
    }

    #[test]
    fn test_external_policy_keeps_externally_held_cycle() {
        let config = GcConfig::manual().with_root_policy(RootPolicy::ExternalRefCount);
        let gc = Collector::initialize(config).unwrap();
        let drops = counter();
        let (a, b) = make_cycle(&gc, &drops);
        let held = a.upgrade().unwrap();

        assert_eq!(gc.collect(true), 0);
        assert!(b.is_alive());

        drop(held);
        assert_eq!(gc.collect(true), 2);
    }

    fn make_cycle(gc: &Collector, drops: &Arc<AtomicUsize>) -> (GcWeak<Node>, GcWeak<Node>) {
        let a = gc.alloc(Node::new(drops)).unwrap();
        let b = gc.alloc(Node::new(drops)).unwrap();
        *a.get().unwrap().next.lock() = b.clone();
        *b.get().unwrap().next.lock() = a.clone();
        (a.downgrade(), b.downgrade())
    }

    #[test]
    fn test_external_policy_keeps_handle_moved_during_collection() {
        let config = GcConfig::manual().with_root_policy(RootPolicy::ExternalRefCount);
        let gc = Collector::initialize(config).unwrap();
        let drops = counter();
        let outside = Arc::new(Mutex::new(Vec::new()));

        let child = gc.alloc(Node::new(&drops)).unwrap();
        let parent = gc
            .alloc(Shedding {
                child: Mutex::new(child),
                outside: Arc::clone(&outside),
            })
            .unwrap();

        assert_eq!(gc.collect(true), 0);

        let moved = outside.lock().pop().unwrap();
        assert!(moved.is_valid());
        assert_eq!(moved.ref_count(), 1);
        assert!(parent.is_valid());
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        drop(moved);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_inside_trace_does_not_deadlock() {
        let gc = manual();
        let drops = counter();
        let owned = gc.alloc(Node::new(&drops)).unwrap();
        let holder = gc
            .alloc(Releasing {
                owned: Mutex::new(owned),
            })
            .unwrap();

        assert_eq!(gc.collect(false), 0);
        assert!(holder.is_valid());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(gc.registered_object_count(), 1);
    }

    #[test]
    fn test_collection_time_excludes_destructors() {
        let gc = manual();
        gc.alloc(SlowDrop).unwrap().disown();

        let start = Instant::now();
        assert_eq!(gc.collect(true), 1);
        assert!(start.elapsed() >= Duration::from_millis(80), "destructor ran inside collect");
        assert!(gc.stats().last_collection_time < Duration::from_millis(80));
    }

    #[test]
    fn test_busy_collector_is_a_no_op() {
        let gc = manual();
        gc.alloc(1u32).unwrap().disown();

        let held = gc.shared.collection_lock.lock();
        assert_eq!(gc.collect(true), 0);
        drop(held);

        assert_eq!(gc.stats().total_collections, 0);
        assert_eq!(gc.collect(true), 1);
    }

    #[test]
    fn test_panicking_trace_is_contained() {
        let gc = manual();
        let _bomb = gc.alloc(Exploding).unwrap();

        assert_eq!(gc.collect(true), 0);
        assert!(!gc.is_collecting());
        assert_eq!(gc.stats().total_collections, 1);

        let err = gc.try_collect(true).unwrap_err();
        assert!(matches!(err, GcError::CollectionPanicked(ref msg) if msg.contains("trace exploded")));
    }
}

#[cfg(test)]
mod policy_tests {
    use super::*;

    fn with_mode(mode: GcMode) -> Collector {
        Collector::initialize(GcConfig::new(mode, 1000, false)).unwrap()
    }

    #[test]
    fn test_trigger_by_mode() {
        assert!(!with_mode(GcMode::Manual).should_trigger_collection());
        assert!(with_mode(GcMode::Automatic).should_trigger_collection());
        assert!(!with_mode(GcMode::Adaptive).should_trigger_collection());
    }

    #[test]
    fn test_adaptive_object_threshold() {
        let gc = with_mode(GcMode::Adaptive);
        let _held: Vec<_> = (0..3).map(|i| gc.alloc(i as u32).unwrap()).collect();

        gc.set_object_count_threshold(2);
        assert!(gc.should_trigger_collection());
        gc.set_object_count_threshold(3);
        assert!(!gc.should_trigger_collection(), "threshold must be exceeded");
    }

    #[test]
    fn test_adaptive_memory_threshold() {
        let gc = with_mode(GcMode::Adaptive);
        let _held = gc.alloc(1u64).unwrap();

        gc.set_memory_threshold(0);
        assert!(gc.should_trigger_collection());
        assert_eq!(gc.memory_threshold(), 0);
    }

    #[test]
    fn test_injected_monitor_drives_trigger() {
        struct Pressure;
        impl MemoryMonitor for Pressure {
            fn usage(&self) -> MemoryUsage {
                MemoryUsage {
                    current_bytes: usize::MAX,
                    ..MemoryUsage::default()
                }
            }
        }

        let config = GcConfig::new(GcMode::Adaptive, 1000, false);
        let gc = Collector::with_monitor(config, Arc::new(Pressure)).unwrap();
        assert!(gc.should_trigger_collection());
    }

    #[test]
    fn test_set_mode_and_interval() {
        let gc = with_mode(GcMode::Manual);
        gc.set_mode(GcMode::Automatic);
        gc.set_collection_interval(Duration::from_millis(250));

        assert_eq!(gc.mode(), GcMode::Automatic);
        assert_eq!(gc.collection_interval(), Duration::from_millis(250));
    }
}

#[cfg(test)]
mod lifecycle_tests {
    use super::*;

    #[test]
    fn test_reset_stats() {
        let gc = manual();
        gc.collect(false);
        gc.collect(false);
        assert_eq!(gc.stats().total_collections, 2);

        gc.reset_stats();
        let stats = gc.stats();
        assert_eq!(stats.total_collections, 0);
        assert_eq!(stats.average_collection_time, Duration::ZERO);
        assert!(stats.last_collection_at.is_none());
    }

    #[test]
    fn test_shutdown_runs_final_collection_and_clears() {
        let gc = manual();
        let drops = counter();
        gc.alloc(Node::new(&drops)).unwrap().disown();
        let held = gc.alloc(Node::new(&drops)).unwrap();
        gc.add_root_object(&held);

        gc.shutdown();

        assert!(gc.is_shutdown());
        assert!(!gc.is_initialized());
        assert_eq!(drops.load(Ordering::SeqCst), 1, "final collection ran");
        assert_eq!(gc.stats().total_collections, 1);
        assert_eq!(gc.registered_object_count(), 0);
        assert_eq!(gc.root_count(), 0);
        assert!(held.is_valid(), "held objects outlive the registry");

        // Idempotent, and collection is disabled afterwards
        gc.shutdown();
        assert_eq!(gc.collect(true), 0);
        assert_eq!(gc.stats().total_collections, 1);
    }

    #[test]
    fn test_handles_outlive_collector() {
        let drops = counter();
        let held = {
            let gc = manual();
            let obj = gc.alloc(Node::new(&drops)).unwrap();
            gc.alloc(Node::new(&drops)).unwrap().disown();
            obj
        };

        assert_eq!(drops.load(Ordering::SeqCst), 1, "only the unowned object went with the collector");
        assert!(held.is_valid());
        assert_eq!(held.ref_count(), 1);
        assert!(held.get().is_some());

        let copy = held.clone();
        assert_eq!(held.ref_count(), 2);
        drop(copy);

        drop(held);
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_average_collection_time() {
        assert_eq!(average_duration(Duration::ZERO, 0), Duration::ZERO);
        assert_eq!(average_duration(Duration::from_millis(30), 3), Duration::from_millis(10));
        // A count that would truncate to zero as u32
        assert_eq!(average_duration(Duration::from_secs(1 << 32), 1 << 32), Duration::from_secs(1));
    }

    #[test]
    fn test_census_tracks_live_types() {
        let gc = manual();
        let a = gc.alloc(1u32).unwrap();
        let _b = gc.alloc(2u32).unwrap();

        let census = gc.census();
        assert_eq!(census.len(), 1);
        assert_eq!(census[0].1.live_objects, 2);

        drop(a);
        assert_eq!(gc.census()[0].1.live_objects, 1);
        assert_eq!(gc.memory_usage().deallocation_count, 1);
    }

    #[test]
    fn test_debug_output() {
        let gc = manual();
        let rendered = format!("{:?}", gc);
        assert!(rendered.contains("Manual"));
    }
}
