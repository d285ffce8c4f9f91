//! Owning and non-owning handles to managed objects
//!
//! `Gc<T>` is the reference-counted owner: clone = AddRef, drop = Release,
//! moves are free. Handles never keep freed memory reachable: they point at
//! the heap cell through a `Weak`, and a cell whose slot has been recycled
//! simply reads as invalid.

use super::{GcBox, ObjectHeader, ObjectId, ObjectKey, Traceable};
use crate::logging::error;
use std::any::TypeId;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::{Arc, Weak};

/// Arena key plus a non-owning pointer to the heap cell
struct GcPtr<T: ?Sized> {
    key: ObjectKey,
    ptr: Weak<GcBox<T>>,
}

impl<T: ?Sized> Clone for GcPtr<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            ptr: self.ptr.clone(),
        }
    }
}

impl<T: ?Sized> GcPtr<T> {
    #[inline]
    fn upgrade(&self) -> Option<Arc<GcBox<T>>> {
        self.ptr.upgrade()
    }
}

/// Reference-counted owning handle to a managed object.
///
/// A handle may be null (`Gc::null()` / `Default`). Accessing the value goes
/// through [`Gc::get`], which yields `None` for null handles and for objects
/// that have already been destroyed.
pub struct Gc<T: ?Sized> {
    inner: Option<GcPtr<T>>,
}

impl<T: ?Sized> Gc<T> {
    pub fn null() -> Self {
        Self { inner: None }
    }

    /// Wrap the creator's reference without an extra AddRef
    pub(crate) fn adopt(key: ObjectKey, ptr: Weak<GcBox<T>>) -> Self {
        Self {
            inner: Some(GcPtr { key, ptr }),
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.inner.is_none()
    }

    /// Non-null and the target has not started teardown
    pub fn is_valid(&self) -> bool {
        self.with_header(|h| h.is_valid()).unwrap_or(false)
    }

    /// Borrow the value. The returned guard keeps the memory alive but holds
    /// no reference count.
    pub fn get(&self) -> Option<GcRef<T>> {
        let cell = self.inner.as_ref()?.upgrade()?;
        if !cell.header.is_valid() {
            return None;
        }
        Some(GcRef { cell })
    }

    /// Arena address, `None` for null handles
    pub fn key(&self) -> Option<ObjectKey> {
        self.inner.as_ref().map(|p| p.key)
    }

    pub fn object_id(&self) -> Option<ObjectId> {
        self.with_header(|h| h.id())
    }

    pub fn type_name(&self) -> Option<&'static str> {
        self.with_header(|h| h.type_name())
    }

    /// Current reference count (0 for null or destroyed targets)
    pub fn ref_count(&self) -> i32 {
        self.with_header(|h| if h.is_valid() { h.ref_count() } else { 0 })
            .unwrap_or(0)
    }

    pub fn is_marked(&self) -> bool {
        self.with_header(|h| h.is_marked()).unwrap_or(false)
    }

    /// Manual AddRef. Each call must be balanced by [`Gc::release`].
    pub fn add_ref(&self) -> i32 {
        match self.with_header(|h| h.add_ref()) {
            Some(count) => count,
            None => {
                self.report_dead("AddRef");
                0
            }
        }
    }

    /// Manual Release, destroying the object when the count reaches zero.
    pub fn release(&self) -> i32 {
        match self.with_header(|h| h.release()) {
            Some(count) => count,
            None => {
                self.report_dead("Release");
                0
            }
        }
    }

    fn report_dead(&self, operation: &'static str) {
        if let Some(key) = self.key() {
            error!(index = key.index(), generation = key.generation(), "Attempted to {} on invalid object", operation);
        }
    }

    /// Release this handle's reference and make it null
    pub fn reset(&mut self) {
        if let Some(p) = self.inner.take() {
            if let Some(cell) = p.upgrade() {
                cell.header.release_from_drop();
            }
        }
    }

    /// Identity comparison; two null handles are equal
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }

    /// Heap cell address, stable for as long as any handle to it exists
    fn addr(&self) -> Option<*const ()> {
        self.inner.as_ref().map(|p| Weak::as_ptr(&p.ptr).cast::<()>())
    }

    /// Non-owning handle to the same object
    pub fn downgrade(&self) -> GcWeak<T> {
        GcWeak {
            inner: self.inner.clone(),
        }
    }

    /// Give this handle's reference to the collector.
    ///
    /// The refcount drops by one but the object is not destroyed even at
    /// zero; from then on it lives as long as marking can reach it.
    pub fn disown(mut self) -> GcWeak<T> {
        let Some(p) = self.inner.take() else {
            return GcWeak::null();
        };
        if let Some(cell) = p.upgrade() {
            cell.header.disown();
        }
        GcWeak { inner: Some(p) }
    }

    /// Rewrap as `U` when the object's concrete type is `U`, adding a
    /// reference. Any other type yields a null handle.
    pub fn downcast<U: Traceable>(&self) -> Gc<U> {
        let Some(p) = self.inner.as_ref() else {
            return Gc::null();
        };
        let Some(cell) = p.upgrade() else {
            return Gc::null();
        };
        if cell.header.type_id() != TypeId::of::<U>() {
            return Gc::null();
        }
        cell.header.add_ref();

        let raw = Weak::into_raw(p.ptr.clone()).cast::<GcBox<U>>();
        // SAFETY: the header's TypeId proves the allocation was created as a
        // `GcBox<U>`; the cast only discards the trait-object metadata.
        let ptr = unsafe { Weak::from_raw(raw) };
        Gc::adopt(p.key, ptr)
    }

    pub(crate) fn with_header<R>(&self, f: impl FnOnce(&ObjectHeader) -> R) -> Option<R> {
        let cell = self.inner.as_ref()?.upgrade()?;
        Some(f(&cell.header))
    }
}

impl<T: Traceable> Gc<T> {
    /// Rewrap as a type-erased handle, adding a reference
    pub fn upcast(&self) -> Gc<dyn Traceable> {
        let mut clone = self.clone();
        match clone.inner.take() {
            Some(p) => {
                let ptr: Weak<GcBox<dyn Traceable>> = p.ptr;
                Gc::adopt(p.key, ptr)
            }
            None => Gc::null(),
        }
    }
}

impl<T: ?Sized> Clone for Gc<T> {
    fn clone(&self) -> Self {
        if let Some(p) = &self.inner {
            if let Some(cell) = p.upgrade() {
                cell.header.add_ref();
            }
        }
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: ?Sized> Drop for Gc<T> {
    #[inline]
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T: ?Sized> Default for Gc<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: ?Sized> PartialEq for Gc<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl<T: ?Sized> Eq for Gc<T> {}

impl<T: ?Sized> Hash for Gc<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().map(|a| a as usize).hash(state);
    }
}

impl<T: ?Sized> fmt::Debug for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.with_header(|h| (h.type_name(), h.id(), h.ref_count(), h.is_valid())) {
            Some((ty, id, rc, valid)) => f
                .debug_struct("Gc")
                .field("type", &ty)
                .field("id", &id.get())
                .field("ref_count", &rc)
                .field("valid", &valid)
                .finish(),
            None if self.is_null() => f.write_str("Gc(null)"),
            None => f.write_str("Gc(dead)"),
        }
    }
}

impl<T: ?Sized> fmt::Display for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.with_header(|h| (short_type_name(h.type_name()), h.id())) {
            Some((ty, id)) => write!(f, "{}(ID: {})", ty, id),
            None => f.write_str("null"),
        }
    }
}

/// `my_crate::scene::Node<u32>` -> `Node<u32>`
fn short_type_name(full: &'static str) -> &'static str {
    let generic_start = full.find('<').unwrap_or(full.len());
    match full[..generic_start].rfind("::") {
        Some(pos) => &full[pos + 2..],
        None => full,
    }
}

/// Non-owning handle: reported as an edge when traced, holds no refcount
pub struct GcWeak<T: ?Sized> {
    inner: Option<GcPtr<T>>,
}

impl<T: ?Sized> GcWeak<T> {
    pub fn null() -> Self {
        Self { inner: None }
    }

    /// Obtain an owning handle if the target is still alive
    pub fn upgrade(&self) -> Option<Gc<T>> {
        let p = self.inner.as_ref()?;
        let cell = p.upgrade()?;
        cell.header.try_add_ref()?;
        Some(Gc {
            inner: Some(p.clone()),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.inner
            .as_ref()
            .and_then(|p| p.upgrade())
            .map(|cell| cell.header.is_valid())
            .unwrap_or(false)
    }

    pub fn key(&self) -> Option<ObjectKey> {
        self.inner.as_ref().map(|p| p.key)
    }

    pub fn object_id(&self) -> Option<ObjectId> {
        let cell = self.inner.as_ref()?.upgrade()?;
        Some(cell.header.id())
    }

    /// Current refcount of the target (0 once destroyed)
    pub fn ref_count(&self) -> i32 {
        self.inner
            .as_ref()
            .and_then(|p| p.upgrade())
            .filter(|cell| cell.header.is_valid())
            .map(|cell| cell.header.ref_count())
            .unwrap_or(0)
    }

    pub fn is_marked(&self) -> bool {
        self.inner
            .as_ref()
            .and_then(|p| p.upgrade())
            .map(|cell| cell.header.is_marked())
            .unwrap_or(false)
    }

    /// Borrow the value without taking a reference
    pub fn get(&self) -> Option<GcRef<T>> {
        let cell = self.inner.as_ref()?.upgrade()?;
        if !cell.header.is_valid() {
            return None;
        }
        Some(GcRef { cell })
    }
}

impl<T: ?Sized> Clone for GcWeak<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: ?Sized> Default for GcWeak<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: ?Sized> fmt::Debug for GcWeak<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.object_id() {
            Some(id) => write!(f, "GcWeak({})", id),
            None => f.write_str("GcWeak(null)"),
        }
    }
}

/// Borrow guard returned by [`Gc::get`] and [`GcWeak::get`]
///
/// A guard keeps the memory alive but holds no reference count, so it does
/// not keep the object alive. In particular, under
/// `RootPolicy::ExternalRefCount` a collection may sweep an object that is
/// only reachable through the guard's value. Moving a `Gc` out of a value
/// borrowed from a `GcWeak` while a collection runs can therefore lose it.
/// Upgrade to a `Gc` first.
pub struct GcRef<T: ?Sized> {
    cell: Arc<GcBox<T>>,
}

impl<T: ?Sized> GcRef<T> {
    pub fn object_id(&self) -> ObjectId {
        self.cell.header.id()
    }

    /// Lifetime state of the borrowed object
    pub fn header(&self) -> &ObjectHeader {
        &self.cell.header
    }
}

impl<T: ?Sized> Deref for GcRef<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.cell.value
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for GcRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
