use std::path::PathBuf;
use std::time::Duration;

/// EvictionPolicy orders victims once the cache exceeds its caps.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EvictionPolicy {
    /// Least recently used (the default).
    Lru,
    /// Least frequently used.
    Lfu,
    /// Oldest insertion first.
    Fifo,
}

impl std::str::FromStr for EvictionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LRU" => Ok(Self::Lru),
            "LFU" => Ok(Self::Lfu),
            "FIFO" => Ok(Self::Fifo),
            other => Err(format!("unknown eviction policy {other:?}")),
        }
    }
}

/// CacheConfig is populated from the `CACHE_*` environment, with defaults
/// suited to a single gateway process.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum live entry count.
    pub max_entries: usize,
    /// Maximum total stored bytes.
    pub max_memory_bytes: usize,
    /// Hard TTL applied when the caller doesn't specify one.
    pub default_ttl: Duration,
    pub eviction: EvictionPolicy,
    pub compression: bool,
    /// Values at or above this many serialized bytes are compressed.
    pub compression_threshold: usize,
    /// Snapshot path for flush-on-shutdown persistence.
    pub persistence_path: Option<PathBuf>,
    pub adaptive_ttl: bool,
    pub coalescing: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_memory_bytes: 100 * 1024 * 1024,
            default_ttl: Duration::from_secs(300),
            eviction: EvictionPolicy::Lru,
            compression: false,
            compression_threshold: 10_240,
            persistence_path: None,
            adaptive_ttl: true,
            coalescing: true,
        }
    }
}

impl CacheConfig {
    /// Read the `CACHE_*` environment variables, falling back to defaults
    /// for anything unset or unparseable (unparseable values warn).
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(value) = env_parse::<usize>("CACHE_MAX_SIZE") {
            config.max_entries = value;
        }
        if let Some(value) = env_parse::<usize>("CACHE_MAX_MEMORY_MB") {
            config.max_memory_bytes = value * 1024 * 1024;
        }
        if let Some(value) = env_parse::<u64>("CACHE_DEFAULT_TTL") {
            config.default_ttl = Duration::from_secs(value);
        }
        if let Some(value) = env_parse::<EvictionPolicy>("CACHE_EVICTION_POLICY") {
            config.eviction = value;
        }
        if let Some(value) = env_bool("CACHE_COMPRESSION") {
            config.compression = value;
        }
        if let Some(value) = env_parse::<usize>("CACHE_COMPRESSION_THRESHOLD") {
            config.compression_threshold = value;
        }
        if env_bool("CACHE_PERSISTENCE").unwrap_or(false) {
            config.persistence_path = std::env::var("CACHE_PERSISTENCE_PATH")
                .ok()
                .map(PathBuf::from);
        }
        if let Some(value) = env_bool("CACHE_ADAPTIVE_TTL") {
            config.adaptive_ttl = value;
        }
        if let Some(value) = env_bool("CACHE_REQUEST_COALESCING") {
            config.coalescing = value;
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparseable environment variable");
            None
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!(var = name, value = %raw, "ignoring unparseable boolean");
            None
        }
    }
}
