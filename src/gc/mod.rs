//! Garbage collector - reference counting + tracing for what refcounts miss
//!
//! Design: Hybrid approach:
//! 1. Reference counting (fast path, deterministic, runs without the collector)
//! 2. Mark-sweep over the registry (periodic, reclaims tracer-owned objects)
//! 3. Background worker driven by mode, timer and heap pressure
//!
//! A `Collector` is an owned value. Hosts that want a process-wide instance
//! install one through [`crate::global`].

mod mark_sweep;
mod roots;
mod scheduler;
pub(crate) mod table;

#[cfg(test)]
mod tests;

pub use roots::RootGuard;

use crate::allocator::{MemoryMonitor, MemoryUsage, TypeCensus};
use crate::config::{GcConfig, GcMode, RootPolicy};
use crate::error::{panic_message, GcError, Result};
use crate::logging::{debug, error, info, log_gc_complete, log_gc_mark, log_gc_start, log_gc_sweep, perf, warn};
use crate::object::{Gc, ObjectRef, Traceable};
use parking_lot::Mutex;
use scheduler::{Signal, Worker};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use table::{Heap, ObjectCell};

/// GC statistics for monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GcStats {
    pub total_collections: u64,
    pub objects_collected: u64,
    /// Registered objects at snapshot time
    pub objects_alive: usize,
    pub bytes_reclaimed: u64,
    pub last_collection_time: Duration,
    pub total_collection_time: Duration,
    pub average_collection_time: Duration,
    pub last_collection_at: Option<SystemTime>,
}

/// Counters behind the stats mutex
#[derive(Debug, Default)]
struct StatsBlock {
    total_collections: u64,
    objects_collected: u64,
    bytes_reclaimed: u64,
    last_collection_time: Duration,
    total_collection_time: Duration,
    last_collection_at: Option<SystemTime>,
}

/// What one collection managed before finishing or faulting
#[derive(Debug, Default, Clone, Copy)]
struct Progress {
    collected: usize,
    bytes_reclaimed: usize,
}

/// State shared between the collector handle and its worker thread
pub(crate) struct Shared {
    heap: Arc<Heap>,
    monitor: Option<Arc<dyn MemoryMonitor>>,
    root_policy: RootPolicy,
    mode: AtomicU8,
    interval_ms: AtomicU64,
    memory_threshold: AtomicUsize,
    object_threshold: AtomicUsize,
    slow_collection: Duration,
    /// At most one collection in flight
    collection_lock: Mutex<()>,
    collecting: AtomicBool,
    shutdown: AtomicBool,
    stats: Mutex<StatsBlock>,
}

impl Shared {
    fn new(config: &GcConfig, monitor: Option<Arc<dyn MemoryMonitor>>) -> Self {
        Self {
            heap: Arc::new(Heap::new(config.max_heap_bytes)),
            monitor,
            root_policy: config.root_policy,
            mode: AtomicU8::new(config.mode.as_u8()),
            interval_ms: AtomicU64::new(config.collection_interval_ms),
            memory_threshold: AtomicUsize::new(config.memory_threshold_bytes),
            object_threshold: AtomicUsize::new(config.object_count_threshold),
            slow_collection: Duration::from_millis(config.slow_collection_warn_ms),
            collection_lock: Mutex::new(()),
            collecting: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            stats: Mutex::new(StatsBlock::default()),
        }
    }

    pub(crate) fn mode(&self) -> GcMode {
        GcMode::from_u8(self.mode.load(Ordering::Relaxed))
    }

    pub(crate) fn collection_interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Relaxed).max(1))
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn memory_usage(&self) -> MemoryUsage {
        match &self.monitor {
            Some(monitor) => monitor.usage(),
            None => self.heap.tracker.usage(),
        }
    }

    /// Timer-tick policy: Manual never, Automatic always, Adaptive under pressure
    pub(crate) fn should_trigger_collection(&self) -> bool {
        match self.mode() {
            GcMode::Manual => false,
            GcMode::Automatic => true,
            GcMode::Adaptive => {
                let usage = self.memory_usage().current_bytes;
                let objects = self.heap.objects.lock().registered_count();
                let memory_threshold = self.memory_threshold.load(Ordering::Relaxed);
                let object_threshold = self.object_threshold.load(Ordering::Relaxed);

                let triggered = usage > memory_threshold || objects > object_threshold;
                if triggered {
                    debug!(
                        current_bytes = usage,
                        memory_threshold,
                        objects,
                        object_threshold,
                        "Adaptive collection triggered"
                    );
                }
                triggered
            }
        }
    }

    /// Run one collection unless another is already in flight
    pub(crate) fn collect(&self, force: bool) -> usize {
        self.collect_reporting(force).0
    }

    /// Collect, returning the (possibly partial) count and the panic message
    /// if a phase faulted
    pub(crate) fn collect_reporting(&self, force: bool) -> (usize, Option<String>) {
        let Some(_guard) = self.collection_lock.try_lock() else {
            debug!("Collection already in progress, skipping");
            return (0, None);
        };
        self.collecting.store(true, Ordering::Release);

        let start = Instant::now();
        let mut progress = Progress::default();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run_phases(force, &mut progress)));
        let elapsed = start.elapsed();

        let (swept, fault) = match outcome {
            Ok(swept) => (swept, None),
            Err(payload) => (Vec::new(), Some(panic_message(&*payload))),
        };
        if let Some(message) = &fault {
            error!(error = %message, collected = progress.collected, "Collection aborted");
        }

        self.record(progress, elapsed);

        if elapsed > self.slow_collection {
            warn!(
                duration_ms = elapsed.as_millis() as u64,
                collected = progress.collected,
                "GC collection took significant time"
            );
        }

        self.release_swept(swept);
        self.collecting.store(false, Ordering::Release);

        let alive = self.heap.objects.lock().registered_count();
        log_gc_complete(elapsed.as_micros() as u64, progress.collected, alive);
        (progress.collected, fault)
    }

    /// Mark and sweep; returns the swept cells with their values still alive
    fn run_phases(&self, force: bool, progress: &mut Progress) -> Vec<ObjectCell> {
        {
            let table = self.heap.objects.lock();
            log_gc_start(table.registered_count(), table.root_count(), force);
        }

        let marking = mark_sweep::mark(&self.heap.objects, self.root_policy);
        log_gc_mark(marking.marked);

        let sweep = mark_sweep::sweep(&mut self.heap.objects.lock(), &marking);

        progress.collected = sweep.removed.len();
        progress.bytes_reclaimed = sweep.bytes_reclaimed;

        for cell in &sweep.removed {
            self.heap
                .tracker
                .on_deallocate(cell.header.type_name(), cell.header.size());
        }
        log_gc_sweep(progress.collected, progress.bytes_reclaimed);

        sweep.removed
    }

    /// Destroy swept values. Runs after timing stops and outside the objects
    /// mutex, since their handles may release further objects.
    fn release_swept(&self, swept: Vec<ObjectCell>) {
        if swept.is_empty() {
            return;
        }
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || drop(swept))) {
            error!(error = %panic_message(&*payload), "Destructor panicked while releasing swept objects");
        }
    }

    fn record(&self, progress: Progress, elapsed: Duration) {
        let mut stats = self.stats.lock();
        stats.total_collections += 1;
        stats.objects_collected += progress.collected as u64;
        stats.bytes_reclaimed += progress.bytes_reclaimed as u64;
        stats.last_collection_time = elapsed;
        stats.total_collection_time += elapsed;
        stats.last_collection_at = Some(SystemTime::now());
    }
}

fn average_duration(total: Duration, count: u64) -> Duration {
    if count == 0 {
        return Duration::ZERO;
    }
    let nanos = total.as_nanos() / u128::from(count);
    Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
}

/// Hybrid refcount + mark-sweep collector.
///
/// Dropping the collector shuts it down. Handles outlive it: an object that
/// still has owners when the collector goes away stays alive until its last
/// handle releases it, it just is no longer collected.
pub struct Collector {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl Collector {
    /// Create a collector, spawning the background worker if configured
    pub fn initialize(config: GcConfig) -> Result<Self> {
        Self::build(config, None)
    }

    /// Like [`Collector::initialize`], with heap pressure read from `monitor`
    pub fn with_monitor(config: GcConfig, monitor: Arc<dyn MemoryMonitor>) -> Result<Self> {
        Self::build(config, Some(monitor))
    }

    fn build(config: GcConfig, monitor: Option<Arc<dyn MemoryMonitor>>) -> Result<Self> {
        config.validate()?;

        let shared = Arc::new(Shared::new(&config, monitor));
        let worker = if config.background_collection {
            Some(Worker::spawn(Arc::clone(&shared))?)
        } else {
            None
        };

        info!(
            mode = %config.mode,
            interval_ms = config.collection_interval_ms,
            background = config.background_collection,
            root_policy = ?config.root_policy,
            "Garbage collector initialized"
        );

        Ok(Self {
            shared,
            worker: Mutex::new(worker),
        })
    }

    /// Construct a managed object and register it.
    ///
    /// The returned handle owns the object's first reference.
    pub fn alloc<T: Traceable>(&self, value: T) -> Result<Gc<T>> {
        self.shared.heap.allocate(value)
    }

    /// Add a live object back to the registry. Idempotent.
    pub fn register_object(&self, obj: &impl ObjectRef) -> bool {
        let Some(key) = obj.object_key() else {
            return false;
        };
        self.shared.heap.objects.lock().register(key)
    }

    /// Remove an object from the registry and the root set. Idempotent.
    ///
    /// The object itself stays alive for as long as its refcount says so.
    pub fn unregister_object(&self, obj: &impl ObjectRef) -> bool {
        let Some(key) = obj.object_key() else {
            return false;
        };
        self.shared.heap.objects.lock().unregister(key)
    }

    pub fn is_registered(&self, obj: &impl ObjectRef) -> bool {
        obj.object_key()
            .map_or(false, |key| self.shared.heap.objects.lock().is_registered(key))
    }

    /// Pin an object as always reachable. Invalid objects are ignored.
    pub fn add_root_object(&self, obj: &impl ObjectRef) -> bool {
        let Some(key) = obj.object_key() else {
            return false;
        };
        let added = self.shared.heap.objects.lock().add_root(key);
        if !added {
            debug!(index = key.index(), "Root not added (invalid or already pinned)");
        }
        added
    }

    pub fn remove_root_object(&self, obj: &impl ObjectRef) -> bool {
        let Some(key) = obj.object_key() else {
            return false;
        };
        self.shared.heap.objects.lock().remove_root(key)
    }

    /// Replace the whole root set
    pub fn set_root_objects<'a, R, I>(&self, roots: I)
    where
        R: ObjectRef + 'a,
        I: IntoIterator<Item = &'a R>,
    {
        let keys: Vec<_> = roots.into_iter().filter_map(|r| r.object_key()).collect();
        let mut table = self.shared.heap.objects.lock();
        table.clear_roots();
        for key in keys {
            table.add_root(key);
        }
    }

    pub fn is_root(&self, obj: &impl ObjectRef) -> bool {
        obj.object_key()
            .map_or(false, |key| self.shared.heap.objects.lock().is_root(key))
    }

    /// Pin `obj` until the returned guard drops
    pub fn root_guard(&self, obj: &impl ObjectRef) -> RootGuard {
        RootGuard::new(&self.shared.heap, obj.object_key())
    }

    /// Run a collection on the calling thread and return how many objects it
    /// reclaimed. A call made while another collection runs returns 0.
    pub fn collect(&self, force: bool) -> usize {
        if self.shared.is_shutdown() {
            debug!("Collect requested after shutdown");
            return 0;
        }
        self.shared.collect(force)
    }

    /// Like [`Collector::collect`], but a panic inside a phase is returned as
    /// `GcError::CollectionPanicked` instead of only being logged.
    pub fn try_collect(&self, force: bool) -> Result<usize> {
        if self.shared.is_shutdown() {
            return Ok(0);
        }
        match self.shared.collect_reporting(force) {
            (_, Some(message)) => Err(GcError::CollectionPanicked(message)),
            (collected, None) => Ok(collected),
        }
    }

    /// Ask the background worker to collect now.
    ///
    /// Without a worker this does nothing.
    pub fn collect_async(&self) {
        match self.worker.lock().as_ref() {
            Some(worker) => worker.notify(Signal::Collect),
            None => debug!("Async collection requested without a background worker"),
        }
    }

    pub fn should_trigger_collection(&self) -> bool {
        self.shared.should_trigger_collection()
    }

    pub fn mode(&self) -> GcMode {
        self.shared.mode()
    }

    pub fn set_mode(&self, mode: GcMode) {
        let previous = GcMode::from_u8(self.shared.mode.swap(mode.as_u8(), Ordering::Relaxed));
        if previous != mode {
            info!(from = %previous, to = %mode, "GC mode changed");
            self.nudge_worker();
        }
    }

    pub fn collection_interval(&self) -> Duration {
        Duration::from_millis(self.shared.interval_ms.load(Ordering::Relaxed))
    }

    pub fn set_collection_interval(&self, interval: Duration) {
        let ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        if ms == 0 {
            warn!("Collection interval of 0ms; the worker will wait at least 1ms between ticks");
        }
        self.shared.interval_ms.store(ms, Ordering::Relaxed);
        debug!(interval_ms = ms, "Collection interval changed");
        self.nudge_worker();
    }

    pub fn set_memory_threshold(&self, bytes: usize) {
        self.shared.memory_threshold.store(bytes, Ordering::Relaxed);
    }

    pub fn memory_threshold(&self) -> usize {
        self.shared.memory_threshold.load(Ordering::Relaxed)
    }

    pub fn set_object_count_threshold(&self, count: usize) {
        self.shared.object_threshold.store(count, Ordering::Relaxed);
    }

    pub fn object_count_threshold(&self) -> usize {
        self.shared.object_threshold.load(Ordering::Relaxed)
    }

    pub fn root_policy(&self) -> RootPolicy {
        self.shared.root_policy
    }

    fn nudge_worker(&self) {
        if let Some(worker) = self.worker.lock().as_ref() {
            worker.notify(Signal::Reconfigure);
        }
    }

    /// Snapshot of the collection counters
    pub fn stats(&self) -> GcStats {
        let alive = self.registered_object_count();
        let stats = self.shared.stats.lock();
        let average_collection_time = average_duration(stats.total_collection_time, stats.total_collections);

        GcStats {
            total_collections: stats.total_collections,
            objects_collected: stats.objects_collected,
            objects_alive: alive,
            bytes_reclaimed: stats.bytes_reclaimed,
            last_collection_time: stats.last_collection_time,
            total_collection_time: stats.total_collection_time,
            average_collection_time,
            last_collection_at: stats.last_collection_at,
        }
    }

    pub fn reset_stats(&self) {
        *self.shared.stats.lock() = StatsBlock::default();
        debug!("GC statistics reset");
    }

    pub fn is_collecting(&self) -> bool {
        self.shared.collecting.load(Ordering::Acquire)
    }

    /// True from construction until `shutdown`
    pub fn is_initialized(&self) -> bool {
        !self.shared.is_shutdown()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.is_shutdown()
    }

    pub fn has_background_worker(&self) -> bool {
        self.worker.lock().is_some()
    }

    pub fn registered_object_count(&self) -> usize {
        self.shared.heap.objects.lock().registered_count()
    }

    pub fn root_count(&self) -> usize {
        self.shared.heap.objects.lock().root_count()
    }

    /// Objects alive in the arena, registered or not
    pub fn allocated_object_count(&self) -> usize {
        self.shared.heap.objects.lock().live_count()
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        self.shared.memory_usage()
    }

    /// Live objects and bytes per type, largest first
    pub fn census(&self) -> Vec<(&'static str, TypeCensus)> {
        self.shared.heap.tracker.census()
    }

    /// Stop the worker, run a final collection and clear the registry and
    /// root set. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Garbage collector shutting down");
        let _perf = perf::track("gc_shutdown");

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.stop();
        }

        let collected = self.shared.collect(true);

        let mut table = self.shared.heap.objects.lock();
        let remaining = table.registered_count();
        if remaining > 0 {
            warn!(
                remaining,
                roots = table.root_count(),
                "Objects still registered at shutdown (leaked or pinned)"
            );
        }
        table.clear_sets();
        drop(table);

        info!(final_collected = collected, "Garbage collector shut down");
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("mode", &self.mode())
            .field("registered", &self.registered_object_count())
            .field("roots", &self.root_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
