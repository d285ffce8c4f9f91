//! Collector error types
//!
//! Only genuine failures live here. Invalid-object usage and re-entrant
//! collection requests are logged and treated as no-ops instead.

use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, GcError>;

#[derive(Debug)]
pub enum GcError {
    /// The heap limit would be exceeded by this allocation
    AllocationFailed { requested: usize, limit: usize },
    /// The arena ran out of addressable slots
    HeapExhausted,
    /// A mark or sweep phase panicked (payload message attached)
    CollectionPanicked(String),
    /// Configuration could not be parsed or validated
    Config(String),
    Io(io::Error),
    /// The background collection thread could not be started
    WorkerSpawn(io::Error),
}

impl fmt::Display for GcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllocationFailed { requested, limit } => {
                write!(
                    f,
                    "Allocation of {} bytes failed: managed heap limit is {} bytes",
                    requested, limit
                )
            }
            Self::HeapExhausted => write!(f, "Managed heap has no free object slots"),
            Self::CollectionPanicked(msg) => write!(f, "Garbage collection aborted: {}", msg),
            Self::Config(msg) => write!(f, "Invalid collector configuration: {}", msg),
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::WorkerSpawn(e) => write!(f, "Failed to start GC background thread: {}", e),
        }
    }
}

impl std::error::Error for GcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) | Self::WorkerSpawn(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for GcError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<toml::de::Error> for GcError {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}

/// Render a caught panic payload for logging
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
