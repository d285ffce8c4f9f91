//! Collector configuration
//!
//! Loaded from TOML (usually a `[gc]` table in the engine config) or built in
//! code, then optionally overlaid with `NLIB_GC_*` environment variables.

use crate::error::{GcError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// When the background worker runs collections on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GcMode {
    /// Only explicit `collect`/`collect_async` calls
    Manual,
    /// Every timer tick
    Automatic,
    /// Timer ticks, but only under memory or object-count pressure
    Adaptive,
}

impl GcMode {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Self::Manual => 0,
            Self::Automatic => 1,
            Self::Adaptive => 2,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Manual,
            1 => Self::Automatic,
            _ => Self::Adaptive,
        }
    }
}

impl fmt::Display for GcMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Manual => "manual",
            Self::Automatic => "automatic",
            Self::Adaptive => "adaptive",
        };
        f.write_str(s)
    }
}

impl FromStr for GcMode {
    type Err = GcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "manual" => Ok(Self::Manual),
            "automatic" | "auto" => Ok(Self::Automatic),
            "adaptive" => Ok(Self::Adaptive),
            other => Err(GcError::Config(format!("unknown gc mode '{}'", other))),
        }
    }
}

/// Which registered objects count as implicit roots during marking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootPolicy {
    /// Any object with a positive refcount is a root. Objects that only keep
    /// each other alive (pure cycles) therefore survive collection.
    RefCount,
    /// Owning edges between registered objects are subtracted first; only
    /// objects referenced from outside the managed graph are roots.
    ExternalRefCount,
}

impl FromStr for RootPolicy {
    type Err = GcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "ref_count" | "refcount" => Ok(Self::RefCount),
            "external_ref_count" | "external" => Ok(Self::ExternalRefCount),
            other => Err(GcError::Config(format!("unknown root policy '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcConfig {
    #[serde(default = "default_mode")]
    pub mode: GcMode,

    #[serde(default = "default_interval_ms")]
    pub collection_interval_ms: u64,

    #[serde(default = "default_true")]
    pub background_collection: bool,

    #[serde(default = "default_memory_threshold")]
    pub memory_threshold_bytes: usize,

    #[serde(default = "default_object_threshold")]
    pub object_count_threshold: usize,

    #[serde(default = "default_root_policy")]
    pub root_policy: RootPolicy,

    #[serde(default)]
    pub max_heap_bytes: Option<usize>,

    #[serde(default = "default_slow_warn_ms")]
    pub slow_collection_warn_ms: u64,
}

fn default_mode() -> GcMode {
    GcMode::Adaptive
}

fn default_interval_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_memory_threshold() -> usize {
    100 * 1024 * 1024
}

fn default_object_threshold() -> usize {
    10_000
}

fn default_root_policy() -> RootPolicy {
    RootPolicy::RefCount
}

fn default_slow_warn_ms() -> u64 {
    10
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            collection_interval_ms: default_interval_ms(),
            background_collection: default_true(),
            memory_threshold_bytes: default_memory_threshold(),
            object_count_threshold: default_object_threshold(),
            root_policy: default_root_policy(),
            max_heap_bytes: None,
            slow_collection_warn_ms: default_slow_warn_ms(),
        }
    }
}

/// Engine config files nest the collector settings under `[gc]`
#[derive(Deserialize)]
struct ConfigFile {
    #[serde(default)]
    gc: Option<GcConfig>,
}

impl GcConfig {
    /// Equivalent of `Initialize(mode, interval, background)`
    pub fn new(mode: GcMode, collection_interval_ms: u64, background_collection: bool) -> Self {
        Self {
            mode,
            collection_interval_ms,
            background_collection,
            ..Self::default()
        }
    }

    /// Single-threaded, explicitly driven collector (tests, tools)
    pub fn manual() -> Self {
        Self::new(GcMode::Manual, 0, false)
    }

    pub fn with_root_policy(mut self, policy: RootPolicy) -> Self {
        self.root_policy = policy;
        self
    }

    pub fn with_max_heap_bytes(mut self, limit: usize) -> Self {
        self.max_heap_bytes = Some(limit);
        self
    }

    pub fn collection_interval(&self) -> Duration {
        Duration::from_millis(self.collection_interval_ms)
    }

    /// Parse either a bare collector table or a file with a `[gc]` section
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(content)?;
        let config = match file.gc {
            Some(gc) => gc,
            None => toml::from_str(content)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Overlay `NLIB_GC_*` environment variables on top of `self`
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(mode) = std::env::var("NLIB_GC_MODE") {
            self.mode = mode.parse()?;
        }
        if let Ok(ms) = std::env::var("NLIB_GC_INTERVAL_MS") {
            self.collection_interval_ms = parse_number(&ms, "NLIB_GC_INTERVAL_MS")?;
        }
        if let Ok(flag) = std::env::var("NLIB_GC_BACKGROUND") {
            self.background_collection = matches!(flag.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Ok(bytes) = std::env::var("NLIB_GC_MEMORY_THRESHOLD") {
            self.memory_threshold_bytes = parse_number(&bytes, "NLIB_GC_MEMORY_THRESHOLD")?;
        }
        if let Ok(policy) = std::env::var("NLIB_GC_ROOT_POLICY") {
            self.root_policy = policy.parse()?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    pub fn validate(&self) -> Result<()> {
        if self.background_collection && self.mode != GcMode::Manual && self.collection_interval_ms == 0 {
            return Err(GcError::Config(
                "collection_interval_ms must be positive for timed background collection".into(),
            ));
        }
        if self.object_count_threshold == 0 {
            return Err(GcError::Config("object_count_threshold must be positive".into()));
        }
        Ok(())
    }
}

fn parse_number<T: FromStr>(value: &str, var: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| GcError::Config(format!("{} expects a number, got '{}'", var, value)))
}
