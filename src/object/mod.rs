//! Managed objects - the per-object state every collected value carries
//!
//! Design: Each managed value lives in a `GcBox` whose header holds:
//! 1. An atomic reference count (fast path, deterministic destruction)
//! 2. A mark bit (owned by the collector during a cycle)
//! 3. A validity flag that flips false exactly once, when teardown starts
//! 4. A process-unique `ObjectId` and the arena `ObjectKey` it occupies
//!
//! Graph edges are discovered through `Traceable`, never by scanning memory.

mod handle;


pub use handle::{Gc, GcRef, GcWeak};

use crate::gc::table::{self, Heap};
use crate::logging::{debug, error, trace};
use std::any::TypeId;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Next identity handed out to a managed object (0 is never used)
static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Refcount value an object is parked at once something has claimed it for
/// destruction. Far enough from zero that stray decrements cannot bring it back.
pub(crate) const DYING: i32 = i32::MIN / 2;
const DYING_THRESHOLD: i32 = i32::MIN / 4;

#[inline]
fn is_dying(count: i32) -> bool {
    count <= DYING_THRESHOLD
}

/// Process-unique, monotonically increasing object identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u64);

impl ObjectId {
    fn next() -> Self {
        Self(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generational arena address of a managed object.
///
/// The generation changes every time a slot is recycled, so a key taken
/// from a destroyed object never resolves to its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl ObjectKey {
    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

/// Anything that names a managed object: owning and non-owning handles
pub trait ObjectRef {
    /// Arena key of the target, `None` for null handles
    fn object_key(&self) -> Option<ObjectKey>;
}

impl<T: ?Sized> ObjectRef for Gc<T> {
    fn object_key(&self) -> Option<ObjectKey> {
        self.key()
    }
}

impl<T: ?Sized> ObjectRef for GcWeak<T> {
    fn object_key(&self) -> Option<ObjectKey> {
        self.key()
    }
}

impl ObjectRef for ObjectKey {
    fn object_key(&self) -> Option<ObjectKey> {
        Some(*self)
    }
}

/// Capability every collected type implements to expose its outgoing edges.
///
/// `trace` must report **every** `Gc` or `GcWeak` the value holds, directly
/// or inside containers. An edge that is not reported is invisible to the
/// collector: the referenced object looks unreachable and may be swept while
/// this value still points at it (its handle then simply reads as invalid).
///
/// The default reports nothing, which is only correct for leaf types.
///
/// `trace` runs on the collecting thread while no collector lock is held, so
/// it may lock the value's own fields even though mutators hold those same
/// locks while cloning, dropping or allocating handles. It should not block
/// on anything a collection waits for, and a value may be traced more than
/// once per collection.
pub trait Traceable: Send + Sync + 'static {
    fn trace(&self, tracer: &mut Tracer<'_>) {
        let _ = tracer;
    }
}

/// Leaf types with no outgoing edges
macro_rules! impl_leaf_traceable {
    ($($ty:ty),* $(,)?) => {
        $(impl Traceable for $ty {})*
    };
}

impl_leaf_traceable!(
    (), bool, char, i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64, String,
    &'static str,
);

/// One outgoing reference reported during tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Edge {
    pub(crate) key: ObjectKey,
    /// Owning edges (`Gc`) contribute to the target's refcount
    pub(crate) owning: bool,
}

/// Edge sink handed to `Traceable::trace`
pub struct Tracer<'a> {
    edges: &'a mut Vec<Edge>,
}

impl<'a> Tracer<'a> {
    pub(crate) fn new(edges: &'a mut Vec<Edge>) -> Self {
        Self { edges }
    }

    /// Report an owning reference
    #[inline]
    pub fn visit<T: ?Sized>(&mut self, gc: &Gc<T>) {
        if let Some(key) = gc.key() {
            self.edges.push(Edge { key, owning: true });
        }
    }

    /// Report a non-owning reference that should still keep its target alive
    #[inline]
    pub fn visit_weak<T: ?Sized>(&mut self, weak: &GcWeak<T>) {
        if let Some(key) = weak.key() {
            self.edges.push(Edge { key, owning: false });
        }
    }

    pub fn visit_all<'g, T, I>(&mut self, handles: I)
    where
        T: ?Sized + 'g,
        I: IntoIterator<Item = &'g Gc<T>>,
    {
        for gc in handles {
            self.visit(gc);
        }
    }

    /// Number of edges reported so far
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

/// Heap cell: header followed by the managed value
pub(crate) struct GcBox<T: ?Sized> {
    pub(crate) header: ObjectHeader,
    pub(crate) value: T,
}

/// Per-object lifetime state
pub struct ObjectHeader {
    ref_count: AtomicI32,
    marked: AtomicBool,
    valid: AtomicBool,
    id: ObjectId,
    key: ObjectKey,
    type_id: TypeId,
    type_name: &'static str,
    size: usize,
    heap: Weak<Heap>,
}

impl ObjectHeader {
    /// Header for a freshly constructed object: the creator owns one reference
    pub(crate) fn new<T: Traceable>(key: ObjectKey, size: usize, heap: Weak<Heap>) -> Self {
        Self {
            ref_count: AtomicI32::new(1),
            marked: AtomicBool::new(false),
            valid: AtomicBool::new(true),
            id: ObjectId::next(),
            key,
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            size,
            heap,
        }
    }

    #[inline]
    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_marked(&self) -> bool {
        self.marked.load(Ordering::Acquire)
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn key(&self) -> ObjectKey {
        self.key
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub(crate) fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Bytes this object occupies on the managed heap
    pub fn size(&self) -> usize {
        self.size
    }

    /// Increment the refcount; refused (returns 0) for objects being torn down
    pub(crate) fn add_ref(&self) -> i32 {
        match self.try_add_ref() {
            Some(count) => count,
            None => {
                error!(object_id = self.id.0, "Attempted to AddRef on invalid object");
                0
            }
        }
    }

    /// Quiet AddRef used by weak upgrades, where a dead target is expected
    pub(crate) fn try_add_ref(&self) -> Option<i32> {
        let mut current = self.ref_count.load(Ordering::Acquire);
        loop {
            if !self.is_valid() || is_dying(current) {
                return None;
            }
            match self.ref_count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    trace!(object_id = self.id.0, ref_count = current + 1, "AddRef");
                    return Some(current + 1);
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Drop one reference, destroying the object when none remain
    pub(crate) fn release(&self) -> i32 {
        self.release_impl(false)
    }

    /// Release issued by a dropping handle; a dead target is not an error there
    pub(crate) fn release_from_drop(&self) -> i32 {
        self.release_impl(true)
    }

    fn release_impl(&self, quiet: bool) -> i32 {
        if !self.is_valid() || is_dying(self.ref_count()) {
            if quiet {
                trace!(object_id = self.id.0, "Handle dropped after object teardown");
            } else {
                error!(object_id = self.id.0, "Attempted to Release on invalid object");
            }
            return 0;
        }

        let remaining = self.ref_count.fetch_sub(1, Ordering::AcqRel) - 1;
        trace!(object_id = self.id.0, ref_count = remaining, "Release");

        if remaining > 0 {
            return remaining;
        }

        // A concurrent upgrade may resurrect the object between the decrement
        // and this claim; in that case it is no longer ours to destroy.
        if self.claim(remaining) && self.invalidate() {
            debug!(object_id = self.id.0, "RefCount reached 0, destroying");
            drop(self.retire());
        }
        0
    }

    /// Give up one reference without destroying; the tracer owns the object after this
    pub(crate) fn disown(&self) {
        if self.is_valid() && !is_dying(self.ref_count()) {
            let remaining = self.ref_count.fetch_sub(1, Ordering::AcqRel) - 1;
            trace!(object_id = self.id.0, ref_count = remaining, "Reference handed to collector");
        }
    }

    /// Park the refcount at `DYING` if it is currently at most `max`
    pub(crate) fn claim(&self, max: i32) -> bool {
        let mut current = self.ref_count.load(Ordering::Acquire);
        loop {
            if current > max || is_dying(current) {
                return false;
            }
            match self.ref_count.compare_exchange_weak(current, DYING, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Flip the validity flag. Only the caller that sees `true` may destroy.
    #[inline]
    pub(crate) fn invalidate(&self) -> bool {
        self.valid.swap(false, Ordering::AcqRel)
    }

    /// Unregister and recycle the slot. The returned box must be dropped by
    /// the caller after every collector lock has been released.
    fn retire(&self) -> Option<Arc<GcBox<dyn Traceable>>> {
        match self.heap.upgrade() {
            Some(heap) => heap.remove(self.key),
            None => table::reclaim_orphan(self.id),
        }
    }

    /// Set the mark bit; returns `true` only on the first transition
    pub(crate) fn mark(&self) -> bool {
        if !self.is_valid() {
            error!(object_id = self.id.0, "Attempted to Mark invalid object");
            return false;
        }
        if self
            .marked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            trace!(target: "gc", object_id = self.id.0, "Marked object");
            true
        } else {
            false
        }
    }

    pub(crate) fn unmark(&self) {
        if !self.is_valid() {
            error!(object_id = self.id.0, "Attempted to UnMark invalid object");
            return;
        }
        self.marked.store(false, Ordering::Release);
    }
}

impl fmt::Debug for ObjectHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectHeader")
            .field("id", &self.id.0)
            .field("type", &self.type_name)
            .field("ref_count", &self.ref_count())
            .field("marked", &self.is_marked())
            .field("valid", &self.is_valid())
            .finish()
    }
}
