//! Process-wide collector slot
//!
//! Optional: libraries should take a `&Collector`. The slot exists for hosts
//! whose subsystems cannot be handed one, and it can be filled only once.

use crate::config::GcConfig;
use crate::error::Result;
use crate::gc::Collector;
use crate::logging::warn;
use once_cell::sync::OnceCell;

static COLLECTOR: OnceCell<Collector> = OnceCell::new();

/// Initialize the process-wide collector.
///
/// A second call logs a warning and returns the existing instance; its
/// `config` is ignored.
pub fn install(config: GcConfig) -> Result<&'static Collector> {
    let mut created = false;
    let collector = COLLECTOR.get_or_try_init(|| {
        created = true;
        Collector::initialize(config)
    })?;

    if !created {
        warn!("Garbage collector already initialized, keeping existing instance");
    }
    Ok(collector)
}

/// The installed collector, if any
pub fn instance() -> Option<&'static Collector> {
    COLLECTOR.get()
}

pub fn is_installed() -> bool {
    COLLECTOR.get().is_some()
}

/// Shut the process-wide collector down. Statics are never dropped, so hosts
/// call this from their exit path.
pub fn shutdown() {
    if let Some(collector) = COLLECTOR.get() {
        collector.shutdown();
    }
}
