use std::path::PathBuf;

/// GatewayConfig gathers the recognized environment variables beyond the
/// `CACHE_*` family (which `cache::CacheConfig::from_env` owns).
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    pub queue_persistence_dir: Option<PathBuf>,
    pub status_persistence_dir: Option<PathBuf>,
    /// Key material for the encrypted credential store.
    pub credential_master_key: Option<Vec<u8>>,
    pub debug: bool,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self {
            queue_persistence_dir: std::env::var("QUEUE_PERSISTENCE_DIR")
                .ok()
                .map(PathBuf::from),
            status_persistence_dir: std::env::var("STATUS_PERSISTENCE_DIR")
                .ok()
                .map(PathBuf::from),
            credential_master_key: std::env::var("CREDENTIAL_MASTER_KEY")
                .ok()
                .map(String::into_bytes),
            debug: matches!(
                std::env::var("DEBUG").as_deref(),
                Ok("1") | Ok("true") | Ok("yes") | Ok("on")
            ),
        }
    }

    /// The purge pipeline configuration implied by this environment.
    pub fn purge_config(&self) -> fastpurge::ServiceConfig {
        fastpurge::ServiceConfig {
            queue_persist_dir: self.queue_persistence_dir.clone(),
            status_persist_dir: self.status_persistence_dir.clone(),
            ..fastpurge::ServiceConfig::default()
        }
    }
}
