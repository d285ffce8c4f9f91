//! Mark and sweep phases
//!
//! `Traceable::trace` never runs under the objects mutex. A mutator can hold
//! one of its own field locks while a release destroys an object and takes
//! the objects mutex, so the collector only holds that mutex for short table
//! reads and for the final sweep. Marking uses an explicit stack; graph
//! depth never reaches the native call stack.

use super::table::{ObjectCell, ObjectTable};
use crate::config::RootPolicy;
use crate::logging::{debug, trace};
use crate::object::{Edge, ObjectKey, Tracer};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Result of the mark phase
#[derive(Debug, Default)]
pub(crate) struct Marking {
    pub(crate) marked: usize,
    /// Unreachable registered objects, each with the highest refcount at
    /// which it may still be swept
    garbage: Vec<(ObjectKey, i32)>,
}

/// Result of the sweep phase
#[derive(Default)]
pub(crate) struct Sweep {
    /// Cells already removed from the table; drop after unlocking
    pub(crate) removed: Vec<ObjectCell>,
    pub(crate) bytes_reclaimed: usize,
    /// Unmarked objects left alone because something still references them
    pub(crate) survivors: usize,
}

/// Iterative traversal shared by every root source
struct Marker<'h> {
    objects: &'h Mutex<ObjectTable>,
    stack: Vec<ObjectKey>,
    edges: Vec<Edge>,
    marked: usize,
}

impl<'h> Marker<'h> {
    fn new(objects: &'h Mutex<ObjectTable>) -> Self {
        Self {
            objects,
            stack: Vec::with_capacity(64),
            edges: Vec::with_capacity(16),
            marked: 0,
        }
    }

    fn resolve(&self, key: ObjectKey) -> Option<ObjectCell> {
        self.objects.lock().get(key).cloned()
    }

    /// Registered objects not marked so far, with their current refcount
    fn unmarked_registered(&self) -> Vec<(ObjectKey, i32)> {
        let table = self.objects.lock();
        table
            .registry()
            .filter_map(|key| {
                let header = &table.get(key)?.header;
                (header.is_valid() && !header.is_marked()).then(|| (key, header.ref_count()))
            })
            .collect()
    }

    /// Clone the cells behind `keys` so they can be traced unlocked
    fn snapshot(&self, keys: impl IntoIterator<Item = ObjectKey>) -> Vec<(ObjectKey, ObjectCell)> {
        let table = self.objects.lock();
        keys.into_iter()
            .filter_map(|key| table.get(key).map(|cell| (key, Arc::clone(cell))))
            .collect()
    }

    fn mark_from(&mut self, start: ObjectKey) {
        let objects = self.objects;
        self.stack.push(start);

        while let Some(key) = self.stack.pop() {
            let Some(cell) = self.resolve(key) else {
                continue;
            };
            if !cell.header.is_valid() || !cell.header.mark() {
                continue;
            }
            self.marked += 1;

            self.edges.clear();
            cell.value.trace(&mut Tracer::new(&mut self.edges));
            // May be the last reference; its destructor can take the objects lock
            drop(cell);

            let table = objects.lock();
            for edge in &self.edges {
                let unvisited = table
                    .get(edge.key)
                    .map_or(false, |cell| cell.header.is_valid() && !cell.header.is_marked());
                if unvisited {
                    self.stack.push(edge.key);
                }
            }
        }
    }
}

/// Clear marks, then mark everything reachable from explicit and implicit roots
pub(crate) fn mark(objects: &Mutex<ObjectTable>, policy: RootPolicy) -> Marking {
    let roots: Vec<ObjectKey> = {
        let table = objects.lock();
        // Unregistered objects can still be reached through edges, so their
        // marks from a previous cycle are cleared too.
        for cell in table.live_cells() {
            if cell.header.is_valid() {
                cell.header.unmark();
            }
        }
        table.roots().collect()
    };

    let mut marker = Marker::new(objects);

    trace!("Marking from explicit roots");
    for key in roots {
        marker.mark_from(key);
    }

    trace!(?policy, "Marking from implicitly rooted objects");
    let garbage = match policy {
        RootPolicy::RefCount => mark_referenced(&mut marker),
        RootPolicy::ExternalRefCount => trial_deletion(&mut marker),
    };

    Marking {
        marked: marker.marked,
        garbage,
    }
}

/// Every object with a positive refcount is an implicit root
fn mark_referenced(marker: &mut Marker<'_>) -> Vec<(ObjectKey, i32)> {
    let candidates = marker.unmarked_registered();

    if tracing::enabled!(target: "gc", tracing::Level::DEBUG) {
        report_self_rooted(marker, &candidates);
    }

    for &(key, ref_count) in &candidates {
        if ref_count > 0 {
            marker.mark_from(key);
        }
    }

    candidates
        .into_iter()
        .filter(|&(_, ref_count)| ref_count <= 0)
        .map(|(key, _)| (key, 0))
        .collect()
}

/// Trial deletion over the objects the explicit roots did not reach.
///
/// Owning edges between candidates are subtracted from their refcounts;
/// whatever keeps a reference beyond that is held from outside and gets
/// marked with everything it reaches. Rounds repeat until one finds no
/// outside holder, so a handle a mutator moved out of a traced field while
/// a round ran is caught by the next one. Objects registered after the first
/// round are never candidates.
fn trial_deletion(marker: &mut Marker<'_>) -> Vec<(ObjectKey, i32)> {
    let initial: HashSet<ObjectKey> = marker
        .unmarked_registered()
        .into_iter()
        .map(|(key, _)| key)
        .collect();
    let mut rounds = 0usize;

    loop {
        rounds += 1;
        let candidates = marker
            .unmarked_registered()
            .into_iter()
            .map(|(key, _)| key)
            .filter(|key| initial.contains(key));
        let cells = marker.snapshot(candidates);
        let internal = count_internal_refs(&cells, &mut marker.edges);
        let ceiling = |key: &ObjectKey| internal.get(key).copied().unwrap_or(0);

        let held: Vec<ObjectKey> = cells
            .iter()
            .filter(|(key, cell)| cell.header.ref_count() > ceiling(key))
            .map(|(key, _)| *key)
            .collect();

        if held.is_empty() {
            trace!(rounds, candidates = cells.len(), "Trial deletion settled");
            return cells.iter().map(|(key, _)| (*key, ceiling(key))).collect();
        }

        drop(cells);
        for key in held {
            marker.mark_from(key);
        }
    }
}

/// Owning edges each object in `cells` receives from the others
fn count_internal_refs(cells: &[(ObjectKey, ObjectCell)], edges: &mut Vec<Edge>) -> HashMap<ObjectKey, i32> {
    let members: HashSet<ObjectKey> = cells.iter().map(|(key, _)| *key).collect();
    let mut internal = HashMap::with_capacity(cells.len());

    for (_, cell) in cells {
        if !cell.header.is_valid() {
            continue;
        }
        edges.clear();
        cell.value.trace(&mut Tracer::new(edges));
        for edge in edges.iter().filter(|e| e.owning && members.contains(&e.key)) {
            *internal.entry(edge.key).or_insert(0) += 1;
        }
    }

    internal
}

/// Log unmarked objects whose whole refcount comes from other registered
/// objects. Under the literal policy these act as implicit roots, which is
/// how unreachable cycles survive.
fn report_self_rooted(marker: &mut Marker<'_>, candidates: &[(ObjectKey, i32)]) {
    let cells = marker.snapshot(candidates.iter().map(|&(key, _)| key));
    let internal = count_internal_refs(&cells, &mut marker.edges);
    let self_rooted = cells
        .iter()
        .filter(|(key, cell)| {
            let rc = cell.header.ref_count();
            rc > 0 && rc <= internal.get(key).copied().unwrap_or(0)
        })
        .count();

    if self_rooted > 0 {
        debug!(
            target: "gc",
            self_rooted,
            "Objects referenced only by other registered objects are kept as implicit roots"
        );
    }
}

/// Remove every unreachable registered object no outside reference keeps alive
pub(crate) fn sweep(table: &mut ObjectTable, marking: &Marking) -> Sweep {
    let mut sweep = Sweep::default();

    for &(key, ceiling) in &marking.garbage {
        if !table.is_registered(key) {
            continue;
        }
        let Some(cell) = table.get(key) else {
            continue;
        };
        let header = &cell.header;
        if !header.is_valid() || header.is_marked() {
            continue;
        }

        // Claiming parks the refcount so a racing upgrade cannot revive it
        if !(header.claim(ceiling) && header.invalidate()) {
            sweep.survivors += 1;
            continue;
        }

        trace!(object_id = header.id().get(), type_name = header.type_name(), "Sweeping object");
        if let Some(cell) = table.remove(key) {
            sweep.bytes_reclaimed += cell.header.size();
            sweep.removed.push(cell);
        }
    }

    if sweep.survivors > 0 {
        debug!(
            survivors = sweep.survivors,
            "Unreachable objects kept alive by outstanding references"
        );
    }

    sweep
}
