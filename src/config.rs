//! Engine configuration

use std::path::PathBuf;

/// Environment variable naming the RocksDB data directory
pub const ENV_DATA_DIR: &str = "TABULA_DATA_DIR";

/// Environment variable overriding the smart-rule cascade ceiling
pub const ENV_MAX_TRIGGER_DEPTH: &str = "TABULA_MAX_TRIGGER_DEPTH";

/// Default ceiling for rule-induced cascading updates
pub const DEFAULT_MAX_TRIGGER_DEPTH: usize = 5;

/// Engine configuration
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Maximum smart-rule recursion depth
    pub max_trigger_depth: usize,
    /// RocksDB directory; `None` keeps everything in memory
    pub data_dir: Option<PathBuf>,
    /// Separator used when lookups and SHOW_UNIQUE join strings
    pub list_separator: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_trigger_depth: DEFAULT_MAX_TRIGGER_DEPTH,
            data_dir: None,
            list_separator: ", ".to_string(),
        }
    }
}

impl EngineConfig {
    /// In-memory configuration with defaults
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Persistent configuration rooted at `path`
    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        EngineConfig {
            data_dir: Some(path.into()),
            ..Self::default()
        }
    }

    /// Defaults overridden by `TABULA_DATA_DIR` / `TABULA_MAX_TRIGGER_DEPTH`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(dir) = lookup(ENV_DATA_DIR).filter(|d| !d.trim().is_empty()) {
            config.data_dir = Some(PathBuf::from(dir));
        }

        if let Some(raw) = lookup(ENV_MAX_TRIGGER_DEPTH) {
            match raw.trim().parse::<usize>() {
                Ok(depth) if depth > 0 => config.max_trigger_depth = depth,
                _ => tracing::warn!(
                    value = %raw,
                    "ignoring invalid {}, keeping {}",
                    ENV_MAX_TRIGGER_DEPTH,
                    config.max_trigger_depth
                ),
            }
        }

        config
    }
}
