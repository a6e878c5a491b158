use crate::entry::{compress, decompress, Entry};
use crate::{CacheConfig, Error, EvictionPolicy};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// Rolling window over which per-key hit rates feed the adaptive TTL.
const ADAPTIVE_WINDOW: Duration = Duration::from_secs(60);
const ADAPTIVE_MIN_FACTOR: f64 = 0.5;
const ADAPTIVE_MAX_FACTOR: f64 = 2.0;
// Below this many observations a window says nothing about the key.
const ADAPTIVE_MIN_SAMPLES: u32 = 4;

/// Options for [`SmartCache::get_with_refresh`].
#[derive(Debug, Copy, Clone)]
pub struct RefreshOptions {
    /// Absolute expiry. Entries past it are never served.
    pub hard_ttl: Duration,
    /// Serve-stale threshold; a hit past it triggers a background refresh.
    /// None disables stale serving for this key.
    pub soft_ttl: Option<Duration>,
}

impl RefreshOptions {
    pub fn ttl(hard_ttl: Duration) -> Self {
        Self {
            hard_ttl,
            soft_ttl: None,
        }
    }

    pub fn with_soft_ttl(mut self, soft_ttl: Duration) -> Self {
        self.soft_ttl = Some(soft_ttl);
        self
    }
}

// The result every coalesced caller of one fetch receives.
type FetchOutput = Result<Bytes, Arc<anyhow::Error>>;
type SharedFetch = Shared<BoxFuture<'static, FetchOutput>>;

#[derive(Default)]
struct Stats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    refreshes: AtomicU64,
    coalesced: AtomicU64,
}

/// CacheStats is a point-in-time counters snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub refreshes: u64,
    pub coalesced: u64,
    pub hit_rate: f64,
}

struct AdaptiveState {
    hits: u32,
    misses: u32,
    window_started: DateTime<Utc>,
    factor: f64,
}

impl AdaptiveState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            hits: 0,
            misses: 0,
            window_started: now,
            factor: 1.0,
        }
    }

    fn note(&mut self, hit: bool, now: DateTime<Utc>) {
        if hit {
            self.hits += 1;
        } else {
            self.misses += 1;
        }

        let elapsed = (now - self.window_started).to_std().unwrap_or(Duration::ZERO);
        if elapsed < ADAPTIVE_WINDOW {
            return;
        }

        let total = self.hits + self.misses;
        if total >= ADAPTIVE_MIN_SAMPLES {
            let rate = self.hits as f64 / total as f64;
            if rate >= 0.8 {
                // Hot keys earn a longer effective TTL, up to 2x.
                self.factor = (self.factor * 1.25).min(ADAPTIVE_MAX_FACTOR);
            } else if rate <= 0.2 {
                // Churny keys shrink toward the 0.5x floor.
                self.factor = (self.factor * 0.75).max(ADAPTIVE_MIN_FACTOR);
            } else {
                // Unremarkable keys drift back to the configured TTL.
                self.factor += (1.0 - self.factor) * 0.5;
            }
        }
        self.hits = 0;
        self.misses = 0;
        self.window_started = now;
    }
}

pub(crate) struct Store {
    pub entries: HashMap<String, Entry>,
    pub total_bytes: usize,
    pub clock: u64,
    adaptive: HashMap<String, AdaptiveState>,
}

struct Inner {
    config: CacheConfig,
    store: Mutex<Store>,
    inflight: Mutex<HashMap<String, SharedFetch>>,
    refreshing: Mutex<HashSet<String>>,
    stats: Stats,
    shutdown: CancellationToken,
}

/// SmartCache is the tenant-namespaced read cache: hard and soft TTLs,
/// background refresh, per-key single-flight coalescing, size-bounded
/// eviction, and optional compression.
///
/// Keys must carry a `<tenant>:` prefix; eviction and invalidation never
/// run user code, and fetch failures are never cached.
#[derive(Clone)]
pub struct SmartCache {
    inner: Arc<Inner>,
}

impl SmartCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                store: Mutex::new(Store {
                    entries: HashMap::new(),
                    total_bytes: 0,
                    clock: 0,
                    adaptive: HashMap::new(),
                }),
                inflight: Mutex::new(HashMap::new()),
                refreshing: Mutex::new(HashSet::new()),
                stats: Stats::default(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Serve `key` if present and within its hard TTL.
    pub fn get(&self, key: &str) -> Result<Option<Bytes>, Error> {
        validate_key(key)?;
        let now = Utc::now();

        let found = {
            let mut store = self.inner.store.lock().unwrap();
            store.clock += 1;
            let clock = store.clock;

            let found = match store.entries.get_mut(key) {
                Some(entry) if !entry.is_expired(now) => {
                    entry.last_access = clock;
                    entry.hit_count += 1;
                    Some((entry.value.clone(), entry.compressed))
                }
                _ => None,
            };
            if found.is_none() {
                // Drops the entry when it exists but is past its hard TTL.
                remove_entry(&mut store, key);
            }
            note_adaptive(&mut store, key, found.is_some(), now);
            found
        };

        match found {
            Some((value, compressed)) => {
                self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
                // Decompression happens outside the structural lock.
                let value = if compressed {
                    Bytes::from(decompress(&value).map_err(|_| Error::Corrupt(key.to_string()))?)
                } else {
                    value
                };
                Ok(Some(value))
            }
            None => {
                self.inner.stats.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Store `value` under `key`.
    pub fn set(
        &self,
        key: &str,
        value: &[u8],
        hard_ttl: Option<Duration>,
        soft_ttl: Option<Duration>,
    ) -> Result<(), Error> {
        validate_key(key)?;
        let opts = RefreshOptions {
            hard_ttl: hard_ttl.unwrap_or(self.inner.config.default_ttl),
            soft_ttl,
        };
        self.inner.store_value(key, value, &opts);
        Ok(())
    }

    /// The stale-while-revalidate read path. On a fresh hit the cached
    /// value returns immediately; on a stale hit the cached value returns
    /// while `fetch` refreshes in the background; on a miss concurrent
    /// callers coalesce onto a single `fetch` whose value (or error) they
    /// all share. Failed fetches are never cached.
    pub async fn get_with_refresh<F, Fut>(
        &self,
        key: &str,
        opts: RefreshOptions,
        fetch: F,
    ) -> Result<Bytes, Error>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<Vec<u8>, anyhow::Error>> + Send + 'static,
    {
        validate_key(key)?;
        let now = Utc::now();

        enum Lookup {
            Fresh(Bytes, bool),
            Stale(Bytes, bool),
            Miss,
        }

        let lookup = {
            let mut store = self.inner.store.lock().unwrap();
            store.clock += 1;
            let clock = store.clock;

            let lookup = match store.entries.get_mut(key) {
                Some(entry) if entry.is_expired(now) => Lookup::Miss,
                Some(entry) => {
                    entry.last_access = clock;
                    entry.hit_count += 1;
                    if entry.is_stale(now) {
                        Lookup::Stale(entry.value.clone(), entry.compressed)
                    } else {
                        Lookup::Fresh(entry.value.clone(), entry.compressed)
                    }
                }
                None => Lookup::Miss,
            };
            if matches!(lookup, Lookup::Miss) {
                // Drops the entry when it exists but is past its hard TTL.
                remove_entry(&mut store, key);
            }
            note_adaptive(&mut store, key, !matches!(lookup, Lookup::Miss), now);
            lookup
        };

        match lookup {
            Lookup::Fresh(value, compressed) => {
                self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
                self.decode(key, value, compressed)
            }
            Lookup::Stale(value, compressed) => {
                self.inner.stats.hits.fetch_add(1, Ordering::Relaxed);
                self.spawn_refresh(key, opts, fetch);
                self.decode(key, value, compressed)
            }
            Lookup::Miss => {
                self.inner.stats.misses.fetch_add(1, Ordering::Relaxed);
                if self.inner.config.coalescing {
                    self.fetch_coalesced(key, opts, fetch).await
                } else {
                    let value = fetch().await.map_err(|err| Error::Fetch(Arc::new(err)))?;
                    self.inner.store_value(key, &value, &opts);
                    Ok(Bytes::from(value))
                }
            }
        }
    }

    /// Delete entries matching `pattern`: an exact key, or a prefix
    /// followed by `*`. Returns how many were dropped.
    pub fn invalidate(&self, pattern: &str) -> usize {
        let mut store = self.inner.store.lock().unwrap();
        let victims: Vec<String> = store
            .entries
            .keys()
            .filter(|key| key_matches(key, pattern))
            .cloned()
            .collect();

        for key in &victims {
            remove_entry(&mut store, key);
        }
        if !victims.is_empty() {
            tracing::debug!(pattern, dropped = victims.len(), "invalidated cache entries");
        }
        victims.len()
    }

    /// As [`invalidate`], but yields between batches so large namespaces
    /// don't stall the scheduler.
    pub async fn scan_and_delete(&self, pattern: &str) -> usize {
        const BATCH: usize = 256;

        let victims: Vec<String> = {
            let store = self.inner.store.lock().unwrap();
            store
                .entries
                .keys()
                .filter(|key| key_matches(key, pattern))
                .cloned()
                .collect()
        };

        let mut dropped = 0;
        for chunk in victims.chunks(BATCH) {
            {
                let mut store = self.inner.store.lock().unwrap();
                for key in chunk {
                    // Only count keys still present; a concurrent writer
                    // may have replaced them since the scan.
                    if store.entries.contains_key(key) {
                        remove_entry(&mut store, key);
                        dropped += 1;
                    }
                }
            }
            tokio::task::yield_now().await;
        }
        dropped
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, total_bytes) = {
            let store = self.inner.store.lock().unwrap();
            (store.entries.len(), store.total_bytes)
        };
        let hits = self.inner.stats.hits.load(Ordering::Relaxed);
        let misses = self.inner.stats.misses.load(Ordering::Relaxed);

        CacheStats {
            entries,
            total_bytes,
            hits,
            misses,
            evictions: self.inner.stats.evictions.load(Ordering::Relaxed),
            refreshes: self.inner.stats.refreshes.load(Ordering::Relaxed),
            coalesced: self.inner.stats.coalesced.load(Ordering::Relaxed),
            hit_rate: if hits + misses == 0 {
                0.0
            } else {
                hits as f64 / (hits + misses) as f64
            },
        }
    }

    /// Stop background refreshes. Entries stay readable; a pending refresh
    /// leaves its soft-stale entry intact.
    pub fn stop_refreshes(&self) {
        self.inner.shutdown.cancel();
    }

    pub(crate) fn with_store<R>(&self, f: impl FnOnce(&mut Store) -> R) -> R {
        f(&mut self.inner.store.lock().unwrap())
    }

    fn decode(&self, key: &str, value: Bytes, compressed: bool) -> Result<Bytes, Error> {
        if compressed {
            Ok(Bytes::from(
                decompress(&value).map_err(|_| Error::Corrupt(key.to_string()))?,
            ))
        } else {
            Ok(value)
        }
    }

    fn spawn_refresh<F, Fut>(&self, key: &str, opts: RefreshOptions, fetch: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<Vec<u8>, anyhow::Error>> + Send + 'static,
    {
        // One refresh per key at a time.
        if !self.inner.refreshing.lock().unwrap().insert(key.to_string()) {
            return;
        }

        let inner = self.inner.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                () = inner.shutdown.cancelled() => None,
                result = fetch() => Some(result),
            };

            match outcome {
                Some(Ok(value)) => {
                    inner.store_value(&key, &value, &opts);
                    inner.stats.refreshes.fetch_add(1, Ordering::Relaxed);
                }
                Some(Err(err)) => {
                    // The stale entry stays; it remains servable until its
                    // hard TTL.
                    tracing::warn!(key, error = %err, "background refresh failed");
                }
                None => {
                    tracing::debug!(key, "background refresh cancelled; stale entry left intact");
                }
            }

            // The refresh slot is released on every path.
            inner.refreshing.lock().unwrap().remove(&key);
        });
    }

    async fn fetch_coalesced<F, Fut>(
        &self,
        key: &str,
        opts: RefreshOptions,
        fetch: F,
    ) -> Result<Bytes, Error>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<Vec<u8>, anyhow::Error>> + Send + 'static,
    {
        let shared = {
            let mut inflight = self.inner.inflight.lock().unwrap();
            match inflight.get(key) {
                Some(existing) => {
                    self.inner.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                    existing.clone()
                }
                None => {
                    let inner = self.inner.clone();
                    let key_owned = key.to_string();
                    let future = async move {
                        let output: FetchOutput = match fetch().await {
                            Ok(value) => {
                                inner.store_value(&key_owned, &value, &opts);
                                Ok(Bytes::from(value))
                            }
                            // Failures are shared with every waiter and
                            // never cached.
                            Err(err) => Err(Arc::new(err)),
                        };
                        inner.inflight.lock().unwrap().remove(&key_owned);
                        output
                    }
                    .boxed()
                    .shared();

                    inflight.insert(key.to_string(), future.clone());
                    future
                }
            }
        };

        shared.await.map_err(Error::Fetch)
    }
}

impl Inner {
    /// Compress (if configured), insert, and evict down to the caps.
    /// Never invokes user code.
    fn store_value(&self, key: &str, value: &[u8], opts: &RefreshOptions) {
        let (stored, compressed) = if self.config.compression
            && value.len() >= self.config.compression_threshold
        {
            match compress(value) {
                Ok(packed) if packed.len() < value.len() => (packed, true),
                _ => (value.to_vec(), false),
            }
        } else {
            (value.to_vec(), false)
        };

        let now = Utc::now();
        let mut store = self.store.lock().unwrap();
        store.clock += 1;
        let clock = store.clock;

        let factor = if self.config.adaptive_ttl {
            store
                .adaptive
                .get(key)
                .map(|state| state.factor)
                .unwrap_or(1.0)
        } else {
            1.0
        };
        let hard_ttl = opts.hard_ttl.mul_f64(factor);
        let soft_ttl = opts.soft_ttl.map(|ttl| ttl.mul_f64(factor));

        remove_entry(&mut store, key);
        let size_bytes = stored.len();
        store.total_bytes += size_bytes;
        store.entries.insert(
            key.to_string(),
            Entry {
                value: Bytes::from(stored),
                compressed,
                inserted_at: now,
                hard_ttl,
                soft_ttl: soft_ttl.unwrap_or(hard_ttl),
                last_access: clock,
                inserted_tick: clock,
                hit_count: 0,
                size_bytes,
            },
        );

        self.evict(&mut store);
    }

    fn evict(&self, store: &mut Store) {
        while store.entries.len() > self.config.max_entries
            || store.total_bytes > self.config.max_memory_bytes
        {
            let victim = match self.config.eviction {
                EvictionPolicy::Lru => store
                    .entries
                    .iter()
                    .min_by_key(|(_, e)| e.last_access)
                    .map(|(k, _)| k.clone()),
                EvictionPolicy::Lfu => store
                    .entries
                    .iter()
                    .min_by_key(|(_, e)| (e.hit_count, e.last_access))
                    .map(|(k, _)| k.clone()),
                EvictionPolicy::Fifo => store
                    .entries
                    .iter()
                    .min_by_key(|(_, e)| e.inserted_tick)
                    .map(|(k, _)| k.clone()),
            };

            let Some(victim) = victim else { break };
            remove_entry(store, &victim);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(key = %victim, "evicted cache entry");
        }
    }
}

fn remove_entry(store: &mut Store, key: &str) {
    if let Some(entry) = store.entries.remove(key) {
        store.total_bytes -= entry.size_bytes;
    }
}

fn note_adaptive(store: &mut Store, key: &str, hit: bool, now: DateTime<Utc>) {
    // The side table outlives entries so a key's behavior survives its
    // eviction, but it must not grow without bound.
    if store.adaptive.len() > 4 * store.entries.len().max(1024) {
        let live: HashSet<String> = store.entries.keys().cloned().collect();
        store.adaptive.retain(|key, _| live.contains(key));
    }

    store
        .adaptive
        .entry(key.to_string())
        .or_insert_with(|| AdaptiveState::new(now))
        .note(hit, now);
}

fn key_matches(key: &str, pattern: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

fn validate_key(key: &str) -> Result<(), Error> {
    let Some((tenant, rest)) = key.split_once(':') else {
        return Err(Error::UnprefixedKey(key.to_string()));
    };
    if rest.is_empty() || !models::TENANT_ID_RE.is_match(tenant) {
        return Err(Error::UnprefixedKey(key.to_string()));
    }
    Ok(())
}
