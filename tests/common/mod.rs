//! Shared object types for integration tests

#![allow(dead_code)]

use nlib_gc::{Collector, Gc, GcConfig, GcWeak, Traceable, Tracer};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Graph node: owning children plus an optional non-owning link
pub struct Node {
    pub children: Mutex<Vec<Gc<Node>>>,
    pub link: Mutex<GcWeak<Node>>,
    drops: Arc<AtomicUsize>,
}

impl Node {
    pub fn new(drops: &Arc<AtomicUsize>) -> Self {
        Self {
            children: Mutex::new(Vec::new()),
            link: Mutex::new(GcWeak::null()),
            drops: Arc::clone(drops),
        }
    }

    pub fn adopt(&self, child: Gc<Node>) {
        self.children.lock().push(child);
    }

    pub fn link_to(&self, target: &Gc<Node>) {
        *self.link.lock() = target.downgrade();
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

impl Traceable for Node {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        tracer.visit_all(self.children.lock().iter());
        tracer.visit_weak(&*self.link.lock());
    }
}

pub fn drop_counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

pub fn drops(counter: &Arc<AtomicUsize>) -> usize {
    counter.load(Ordering::SeqCst)
}

pub fn manual_collector() -> Collector {
    Collector::initialize(GcConfig::manual()).unwrap()
}
