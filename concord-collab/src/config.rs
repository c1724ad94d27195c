//! Session and server configuration.

use crate::error::ConfigError;

/// Maximum simultaneous participants per document.
pub const DEFAULT_CAPACITY: usize = 10;

/// Per-document session settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Maximum joined participants
    pub capacity: usize,
    /// Operations kept for incremental resync; older history is compacted
    pub retention_threshold: usize,
    /// Verify and checkpoint every N versions (0 disables)
    pub checkpoint_interval: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            retention_threshold: concord_core::DEFAULT_RETENTION,
            checkpoint_interval: 100,
        }
    }
}

impl SessionConfig {
    /// Small thresholds so compaction and checkpoints happen quickly.
    pub fn for_testing() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            retention_threshold: 8,
            checkpoint_interval: 4,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Settings applied to every hosted document
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            session: SessionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `CONCORD_BIND_ADDR`, `CONCORD_CAPACITY`,
    /// `CONCORD_RETENTION` and `CONCORD_CHECKPOINT_INTERVAL`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(addr) = lookup("CONCORD_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(capacity) = parse(&lookup, "CONCORD_CAPACITY")? {
            if capacity == 0 {
                return Err(ConfigError::Invalid {
                    key: "CONCORD_CAPACITY",
                    value: "0".into(),
                });
            }
            config.session.capacity = capacity;
        }
        if let Some(retention) = parse(&lookup, "CONCORD_RETENTION")? {
            config.session.retention_threshold = retention;
        }
        if let Some(interval) = parse(&lookup, "CONCORD_CHECKPOINT_INTERVAL")? {
            config.session.checkpoint_interval = interval;
        }
        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}
