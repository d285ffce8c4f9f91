//! nlib-gc - Hybrid garbage collector for managed engine objects
//!
//! Objects are reference counted for deterministic, immediate reclamation
//! and additionally traced by a mark-sweep collector that owns whatever the
//! refcounts hand over to it.
//!
//! ```ignore
//! use nlib_gc::{Collector, GcConfig, Traceable, Tracer, Gc};
//!
//! struct Node { next: Gc<Node> }
//!
//! impl Traceable for Node {
//!     fn trace(&self, tracer: &mut Tracer<'_>) {
//!         tracer.visit(&self.next);
//!     }
//! }
//!
//! let gc = Collector::initialize(GcConfig::default())?;
//! let node = gc.alloc(Node { next: Gc::null() })?;
//! ```

pub mod allocator;
pub mod config;
pub mod error;
pub mod gc;
pub mod global;
pub mod logging;
pub mod object;

// Re-export core types
pub use allocator::{AllocationTracker, MemoryMonitor, MemoryUsage, TypeCensus};
pub use config::{GcConfig, GcMode, RootPolicy};
pub use error::{GcError, Result};
pub use gc::{Collector, GcStats, RootGuard};
pub use object::{Gc, GcRef, GcWeak, ObjectHeader, ObjectId, ObjectKey, ObjectRef, Traceable, Tracer};
