//! Object arena - generational slots, registry and root set
//!
//! Every managed object occupies one slot. The slot owns the heap cell
//! (`Arc<GcBox<dyn Traceable>>`); handles only hold `Weak` pointers, so
//! recycling a slot is what actually frees an object.
//!
//! When a heap is dropped, cells that handles still own move to a
//! process-wide orphan table and are freed by their last release.

use crate::allocator::AllocationTracker;
use crate::error::{GcError, Result};
use crate::logging::{debug, trace};
use crate::object::{Gc, GcBox, ObjectHeader, ObjectId, ObjectKey, Traceable};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::mem;
use std::sync::Arc;

pub(crate) type ObjectCell = Arc<GcBox<dyn Traceable>>;

/// Owned objects whose heap is gone
static ORPHANS: Lazy<DashMap<ObjectId, ObjectCell>> = Lazy::new(DashMap::new);

/// Take back an orphaned cell whose refcount reached zero
pub(crate) fn reclaim_orphan(id: ObjectId) -> Option<ObjectCell> {
    ORPHANS.remove(&id).map(|(_, cell)| cell)
}

struct Slot {
    generation: u32,
    entry: Option<ObjectCell>,
}

/// Arena plus the collector's two key sets.
///
/// `registry` and `roots` are both subsets of the live slots; destruction
/// removes a key from all three at once.
pub(crate) struct ObjectTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    registry: HashSet<ObjectKey>,
    roots: HashSet<ObjectKey>,
    live: usize,
}

impl ObjectTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::with_capacity(256),
            free: Vec::new(),
            registry: HashSet::with_capacity(256),
            roots: HashSet::with_capacity(16),
            live: 0,
        }
    }

    /// Pick the slot the next object will occupy
    fn next_key(&mut self) -> Result<ObjectKey> {
        if let Some(&index) = self.free.last() {
            let generation = self.slots[index as usize].generation;
            return Ok(ObjectKey { index, generation });
        }
        let index = u32::try_from(self.slots.len()).map_err(|_| GcError::HeapExhausted)?;
        if index == u32::MAX {
            return Err(GcError::HeapExhausted);
        }
        Ok(ObjectKey { index, generation: 0 })
    }

    /// Store a cell at the key returned by `next_key` and register it
    fn insert(&mut self, key: ObjectKey, cell: ObjectCell) {
        if self.free.last() == Some(&key.index) {
            self.free.pop();
        } else {
            debug_assert_eq!(key.index as usize, self.slots.len());
            self.slots.push(Slot {
                generation: key.generation,
                entry: None,
            });
        }
        self.slots[key.index as usize].entry = Some(cell);
        self.registry.insert(key);
        self.live += 1;
    }

    /// Resolve a key; stale generations resolve to nothing
    pub(crate) fn get(&self, key: ObjectKey) -> Option<&ObjectCell> {
        let slot = self.slots.get(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    /// Vacate a slot, bumping its generation and forgetting the key everywhere.
    /// The caller drops the returned cell once no collector lock is held.
    pub(crate) fn remove(&mut self, key: ObjectKey) -> Option<ObjectCell> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        let cell = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        self.registry.remove(&key);
        self.roots.remove(&key);
        self.live -= 1;
        Some(cell)
    }

    pub(crate) fn register(&mut self, key: ObjectKey) -> bool {
        self.get(key).is_some() && self.registry.insert(key)
    }

    /// Forget an object in the registry and root set; it stays in the arena
    pub(crate) fn unregister(&mut self, key: ObjectKey) -> bool {
        self.roots.remove(&key);
        self.registry.remove(&key)
    }

    pub(crate) fn add_root(&mut self, key: ObjectKey) -> bool {
        match self.get(key) {
            Some(cell) if cell.header.is_valid() => self.roots.insert(key),
            _ => false,
        }
    }

    pub(crate) fn remove_root(&mut self, key: ObjectKey) -> bool {
        self.roots.remove(&key)
    }

    pub(crate) fn clear_roots(&mut self) {
        self.roots.clear();
    }

    /// Empty the registry and root set; objects stay in the arena
    pub(crate) fn clear_sets(&mut self) {
        self.registry.clear();
        self.roots.clear();
    }

    pub(crate) fn is_registered(&self, key: ObjectKey) -> bool {
        self.registry.contains(&key)
    }

    pub(crate) fn is_root(&self, key: ObjectKey) -> bool {
        self.roots.contains(&key)
    }

    pub(crate) fn registry(&self) -> impl Iterator<Item = ObjectKey> + '_ {
        self.registry.iter().copied()
    }

    pub(crate) fn roots(&self) -> impl Iterator<Item = ObjectKey> + '_ {
        self.roots.iter().copied()
    }

    /// Every occupied slot, registered or not
    pub(crate) fn live_cells(&self) -> impl Iterator<Item = &ObjectCell> + '_ {
        self.slots.iter().filter_map(|slot| slot.entry.as_ref())
    }

    pub(crate) fn registered_count(&self) -> usize {
        self.registry.len()
    }

    pub(crate) fn root_count(&self) -> usize {
        self.roots.len()
    }

    pub(crate) fn live_count(&self) -> usize {
        self.live
    }

    /// Empty the arena, handing every cell to the caller
    fn drain_cells(&mut self) -> Vec<ObjectCell> {
        self.registry.clear();
        self.roots.clear();
        self.free.clear();
        self.live = 0;
        self.slots.drain(..).filter_map(|slot| slot.entry).collect()
    }
}

/// Managed heap: the object table behind the objects mutex plus accounting
pub(crate) struct Heap {
    pub(crate) objects: Mutex<ObjectTable>,
    pub(crate) tracker: AllocationTracker,
}

impl Heap {
    pub(crate) fn new(limit: Option<usize>) -> Self {
        Self {
            objects: Mutex::new(ObjectTable::new()),
            tracker: AllocationTracker::new(limit),
        }
    }

    /// Construct a managed object; the returned handle owns its first reference
    pub(crate) fn allocate<T: Traceable>(self: &Arc<Self>, value: T) -> Result<Gc<T>> {
        let size = mem::size_of::<GcBox<T>>();
        if !self.tracker.try_reserve(size) {
            return Err(GcError::AllocationFailed {
                requested: size,
                limit: self.tracker.limit().unwrap_or(0),
            });
        }

        let mut table = self.objects.lock();
        let key = match table.next_key() {
            Ok(key) => key,
            Err(e) => {
                drop(table);
                self.tracker.unreserve(size);
                return Err(e);
            }
        };

        let cell = Arc::new(GcBox {
            header: ObjectHeader::new::<T>(key, size, Arc::downgrade(self)),
            value,
        });
        let handle = Gc::adopt(key, Arc::downgrade(&cell));
        let type_name = cell.header.type_name();
        let id = cell.header.id();
        table.insert(key, cell);
        drop(table);

        self.tracker.on_allocate(type_name, size);
        trace!(object_id = id.get(), type_name, size, "Registered new object");
        Ok(handle)
    }

    /// Remove an object whose refcount hit zero
    pub(crate) fn remove(&self, key: ObjectKey) -> Option<ObjectCell> {
        let cell = self.objects.lock().remove(key)?;
        self.tracker.on_deallocate(cell.header.type_name(), cell.header.size());
        Some(cell)
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let (owned, unowned): (Vec<_>, Vec<_>) = self
            .objects
            .get_mut()
            .drain_cells()
            .into_iter()
            .partition(|cell| cell.header.is_valid() && cell.header.ref_count() > 0);

        if !owned.is_empty() {
            debug!(objects = owned.len(), "Heap dropped while handles still own objects");
        }
        for cell in owned {
            let id = cell.header.id();
            ORPHANS.insert(id, Arc::clone(&cell));
            // Released between the partition and the insert
            if !cell.header.is_valid() {
                drop(ORPHANS.remove(&id));
            }
        }

        // Tracer-owned objects die with their collector
        drop(unowned);
    }
}
