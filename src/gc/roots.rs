//! Scoped root pinning
//!
//! Explicit roots are kept in the object table next to the registry. This
//! module only adds the RAII wrapper.

use super::table::Heap;
use crate::object::ObjectKey;
use std::sync::{Arc, Weak};

/// RAII guard for automatic root registration/unregistration
///
/// Usage:
/// ```ignore
/// let config = collector.alloc(Settings::default())?;
/// let _pin = collector.root_guard(&config);
/// // config is now a GC root
/// // automatically unpinned when _pin drops
/// ```
///
/// A guard only unpins what it pinned: if the object was already a root when
/// the guard was created, dropping the guard leaves it pinned.
#[must_use = "the object is unpinned as soon as the guard is dropped"]
pub struct RootGuard {
    heap: Weak<Heap>,
    key: Option<ObjectKey>,
}

impl RootGuard {
    pub(crate) fn new(heap: &Arc<Heap>, key: Option<ObjectKey>) -> Self {
        let pinned = key.filter(|&k| heap.objects.lock().add_root(k));
        Self {
            heap: Arc::downgrade(heap),
            key: pinned,
        }
    }

    /// Whether this guard added the root (and will remove it)
    pub fn is_pinned(&self) -> bool {
        self.key.is_some()
    }
}

impl Drop for RootGuard {
    #[inline]
    fn drop(&mut self) {
        if let (Some(key), Some(heap)) = (self.key.take(), self.heap.upgrade()) {
            heap.objects.lock().remove_root(key);
        }
    }
}
