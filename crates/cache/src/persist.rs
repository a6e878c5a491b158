use crate::entry::Entry;
use crate::{Error, SmartCache};
use anyhow::Context;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(serde::Serialize, serde::Deserialize)]
struct PersistedEntry {
    key: String,
    value: String,
    compressed: bool,
    inserted_at: DateTime<Utc>,
    hard_ttl: Duration,
    soft_ttl: Duration,
    hit_count: u64,
}

impl SmartCache {
    /// Write every entry with remaining hard TTL to the configured
    /// snapshot path. A no-op unless persistence is configured.
    pub fn flush_to_disk(&self) -> Result<usize, Error> {
        let Some(path) = self.config().persistence_path.clone() else {
            return Ok(0);
        };
        let now = Utc::now();

        let persisted: Vec<PersistedEntry> = self.with_store(|store| {
            store
                .entries
                .iter()
                .filter(|(_, entry)| !entry.is_expired(now))
                .map(|(key, entry)| PersistedEntry {
                    key: key.clone(),
                    value: base64::encode(&entry.value),
                    compressed: entry.compressed,
                    inserted_at: entry.inserted_at,
                    hard_ttl: entry.hard_ttl,
                    soft_ttl: entry.soft_ttl,
                    hit_count: entry.hit_count,
                })
                .collect()
        });

        let json = serde_json::to_vec(&persisted)
            .context("serializing cache snapshot")
            .map_err(Error::Persist)?;
        std::fs::write(&path, json)
            .with_context(|| format!("writing cache snapshot {}", path.display()))
            .map_err(Error::Persist)?;

        tracing::info!(path = %path.display(), entries = persisted.len(), "flushed cache snapshot");
        Ok(persisted.len())
    }

    /// Load the snapshot, discarding entries past their hard TTL.
    /// A missing file is an empty snapshot, not an error.
    pub fn load_from_disk(&self) -> Result<usize, Error> {
        let Some(path) = self.config().persistence_path.clone() else {
            return Ok(0);
        };

        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => {
                return Err(Error::Persist(
                    anyhow::Error::new(err)
                        .context(format!("reading cache snapshot {}", path.display())),
                ))
            }
        };
        let persisted: Vec<PersistedEntry> = serde_json::from_slice(&raw)
            .context("parsing cache snapshot")
            .map_err(Error::Persist)?;

        let now = Utc::now();
        let mut loaded = 0;
        self.with_store(|store| {
            for entry in &persisted {
                let Ok(value) = base64::decode(&entry.value) else {
                    continue;
                };
                store.clock += 1;
                let revived = Entry {
                    value: Bytes::from(value),
                    compressed: entry.compressed,
                    inserted_at: entry.inserted_at,
                    hard_ttl: entry.hard_ttl,
                    soft_ttl: entry.soft_ttl,
                    last_access: store.clock,
                    inserted_tick: store.clock,
                    hit_count: entry.hit_count,
                    size_bytes: 0,
                };
                if revived.is_expired(now) {
                    continue;
                }

                let size_bytes = revived.value.len();
                store.total_bytes += size_bytes;
                store.entries.insert(
                    entry.key.clone(),
                    Entry {
                        size_bytes,
                        ..revived
                    },
                );
                loaded += 1;
            }
        });

        tracing::info!(path = %path.display(), entries = loaded, "loaded cache snapshot");
        Ok(loaded)
    }
}

#[cfg(test)]
mod test {
    use crate::{CacheConfig, SmartCache};
    use std::time::Duration;

    #[tokio::test]
    async fn snapshot_round_trips_and_drops_expired() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            persistence_path: Some(dir.path().join("cache.json")),
            ..CacheConfig::default()
        };

        let cache = SmartCache::new(config.clone());
        cache
            .set("t1:k:live", b"live", Some(Duration::from_secs(3600)), None)
            .unwrap();
        cache
            .set("t1:k:dying", b"dying", Some(Duration::from_millis(10)), None)
            .unwrap();
        assert_eq!(cache.flush_to_disk().unwrap(), 2);

        tokio::time::sleep(Duration::from_millis(30)).await;

        let revived = SmartCache::new(config);
        assert_eq!(revived.load_from_disk().unwrap(), 1);
        assert_eq!(revived.get("t1:k:live").unwrap().unwrap().as_ref(), b"live");
        assert_eq!(revived.get("t1:k:dying").unwrap(), None);
    }

    #[test]
    fn persistence_is_a_noop_without_a_path() {
        let cache = SmartCache::new(CacheConfig::default());
        cache.set("t1:k:a", b"a", None, None).unwrap();
        assert_eq!(cache.flush_to_disk().unwrap(), 0);
        assert_eq!(cache.load_from_disk().unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_snapshot_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SmartCache::new(CacheConfig {
            persistence_path: Some(dir.path().join("absent.json")),
            ..CacheConfig::default()
        });
        assert_eq!(cache.load_from_disk().unwrap(), 0);
    }
}
