use crate::types::{
    dedup_key, estimated_bytes, priority, OperationStatus, PurgeKind, PurgeOperation,
};
use crate::Error;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use models::{Id, IdGenerator, Network, TenantId};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Identical purges are rejected within this window of first admission.
pub const DEDUP_WINDOW: Duration = Duration::from_secs(300);

/// Configuration of the queue manager.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Per-tenant pending ceiling; past it, enqueue returns a retryable
    /// capacity error instead of growing unbounded.
    pub depth_ceiling: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            depth_ceiling: 10_000,
        }
    }
}

struct QueueState {
    queues: HashMap<TenantId, Vec<PurgeOperation>>,
    /// dedup-key -> admission time, pruned lazily.
    dedup: HashMap<String, DateTime<Utc>>,
}

/// A consolidation suggestion: many pending URL purges against one domain
/// would be cheaper as a single cpcode purge. Advisory only; the queue is
/// never modified.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ConsolidationSuggestion {
    pub domain: String,
    pub url_count: usize,
    pub estimated_seconds_saved: f64,
}

/// QueueManager admits, prioritizes, and hands out purge operations, one
/// queue per tenant.
pub struct QueueManager {
    config: QueueConfig,
    state: Mutex<QueueState>,
    ids: Mutex<IdGenerator>,
}

impl QueueManager {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState {
                queues: HashMap::new(),
                dedup: HashMap::new(),
            }),
            ids: Mutex::new(IdGenerator::new(1)),
        }
    }

    /// Admit one purge. Rejects empty object lists, identical purges
    /// within the dedup window, and tenants at their depth ceiling.
    #[tracing::instrument(skip(self, objects), fields(count = objects.len()), err)]
    pub fn enqueue(
        &self,
        tenant: &TenantId,
        kind: PurgeKind,
        network: Network,
        objects: Vec<String>,
    ) -> Result<Id, Error> {
        self.enqueue_at(tenant, kind, network, objects, Utc::now())
    }

    pub(crate) fn enqueue_at(
        &self,
        tenant: &TenantId,
        kind: PurgeKind,
        network: Network,
        objects: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<Id, Error> {
        if objects.is_empty() {
            return Err(Error::EmptyPurge);
        }

        let key = dedup_key(kind, &objects);
        let mut state = self.state.lock().unwrap();

        let window = ChronoDuration::from_std(DEDUP_WINDOW).expect("window fits");
        state.dedup.retain(|_, admitted| now - *admitted < window);
        if state.dedup.contains_key(&key) {
            return Err(Error::Duplicate { dedup_key: key });
        }

        let queue = state.queues.entry(tenant.clone()).or_default();
        if queue.len() >= self.config.depth_ceiling {
            return Err(Error::Capacity {
                tenant: tenant.clone(),
                depth: queue.len(),
            });
        }

        let id = self.ids.lock().unwrap().next();
        let operation = PurgeOperation {
            id,
            tenant: tenant.clone(),
            kind,
            network,
            priority: priority(kind, objects.len()),
            created_at: now,
            status: OperationStatus::Pending,
            attempts: 0,
            last_attempt: None,
            last_error: None,
            dedup_key: key.clone(),
            estimated_bytes: estimated_bytes(&objects),
            batches: Vec::new(),
            errors: Vec::new(),
            objects,
        };

        queue.push(operation);
        // Stable: equal priorities keep admission order.
        queue.sort_by_key(|op| op.priority);
        state.dedup.insert(key, now);

        tracing::debug!(op = %id, tenant = %tenant, "purge admitted");
        Ok(id)
    }

    /// Tenants which currently have pending work.
    pub fn tenants_with_pending(&self) -> Vec<TenantId> {
        let state = self.state.lock().unwrap();
        let mut tenants: Vec<TenantId> = state
            .queues
            .iter()
            .filter(|(_, queue)| {
                queue
                    .iter()
                    .any(|op| op.status == OperationStatus::Pending)
            })
            .map(|(tenant, _)| tenant.clone())
            .collect();
        tenants.sort();
        tenants
    }

    /// Claim the highest-priority pending operation of `tenant`, marking
    /// it `processing`.
    pub fn claim_next(&self, tenant: &TenantId) -> Option<PurgeOperation> {
        let mut state = self.state.lock().unwrap();
        let queue = state.queues.get_mut(tenant)?;
        let op = queue
            .iter_mut()
            .find(|op| op.status == OperationStatus::Pending)?;

        op.status = OperationStatus::Processing;
        op.attempts += 1;
        op.last_attempt = Some(Utc::now());
        Some(op.clone())
    }

    /// Store back the claimed operation's updated state. Terminal and
    /// in-progress operations leave the queue (the tracker owns them from
    /// here); failed sends revert to pending up to the attempt limit.
    pub fn settle(&self, op: PurgeOperation) -> Option<PurgeOperation> {
        let mut state = self.state.lock().unwrap();
        let queue = state.queues.get_mut(&op.tenant)?;
        let index = queue.iter().position(|queued| queued.id == op.id)?;

        match op.status {
            OperationStatus::Pending | OperationStatus::Processing => {
                queue[index] = op;
                None
            }
            _ => Some(queue.remove(index)),
        }
    }

    /// Queue depth per tenant, for backpressure reporting.
    pub fn depth(&self, tenant: &TenantId) -> usize {
        self.state
            .lock()
            .unwrap()
            .queues
            .get(tenant)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Scan pending URL purges for domains that would consolidate well
    /// into a cpcode purge. Read-only.
    pub fn consolidation_advice(&self, tenant: &TenantId) -> Vec<ConsolidationSuggestion> {
        let state = self.state.lock().unwrap();
        let Some(queue) = state.queues.get(tenant) else {
            return Vec::new();
        };

        let mut per_domain: HashMap<String, usize> = HashMap::new();
        for op in queue {
            if op.status != OperationStatus::Pending || op.kind != PurgeKind::Url {
                continue;
            }
            for object in &op.objects {
                if let Ok(parsed) = url::Url::parse(object) {
                    if let Some(host) = parsed.host_str() {
                        *per_domain.entry(host.to_string()).or_default() += 1;
                    }
                }
            }
        }

        let mut suggestions: Vec<ConsolidationSuggestion> = per_domain
            .into_iter()
            .filter(|(_, count)| *count > 100)
            .map(|(domain, url_count)| ConsolidationSuggestion {
                domain,
                url_count,
                estimated_seconds_saved: 5.0 * (url_count as f64 / 50.0 - 1.0),
            })
            .collect();
        suggestions.sort_by(|a, b| b.url_count.cmp(&a.url_count));
        suggestions
    }

    /// Snapshot every tenant's queue for persistence. Taken under the
    /// queue lock; serialization and writes happen outside it.
    pub fn snapshot(&self) -> HashMap<TenantId, Vec<PurgeOperation>> {
        self.state.lock().unwrap().queues.clone()
    }

    /// Persist every tenant's queue as `<dir>/<tenant>.json`, atomically.
    pub fn persist_to(&self, dir: &std::path::Path) -> Result<usize, Error> {
        let snapshot = self.snapshot();
        let mut written = 0;
        for (tenant, operations) in &snapshot {
            crate::tracker::write_atomically(dir, &format!("{tenant}.json"), operations)
                .map_err(Error::Persist)?;
            written += 1;
        }
        Ok(written)
    }

    /// Reload queues persisted by [`persist_to`]. Unreadable files are
    /// skipped with a warning rather than blocking startup.
    pub fn restore_from(&self, dir: &std::path::Path) -> Result<usize, Error> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => {
                return Err(Error::Persist(
                    anyhow::Error::new(err).context("reading queue directory"),
                ))
            }
        };

        let mut queues: HashMap<TenantId, Vec<PurgeOperation>> = HashMap::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(tenant) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| TenantId::new(stem).ok())
            else {
                continue;
            };

            match std::fs::read(&path)
                .map_err(anyhow::Error::new)
                .and_then(|raw| serde_json::from_slice(&raw).map_err(anyhow::Error::new))
            {
                Ok(operations) => {
                    queues.insert(tenant, operations);
                }
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping unreadable queue file");
                }
            }
        }

        let restored = queues.values().map(Vec::len).sum();
        self.restore(queues);
        Ok(restored)
    }

    /// Restore queues read back from disk. Operations caught mid-send at
    /// shutdown revert to pending and consume an attempt.
    pub fn restore(&self, mut queues: HashMap<TenantId, Vec<PurgeOperation>>) {
        let mut state = self.state.lock().unwrap();
        for (tenant, queue) in queues.drain() {
            let mut queue: Vec<PurgeOperation> = queue
                .into_iter()
                .filter(|op| !op.status.is_terminal())
                .map(|mut op| {
                    if op.status == OperationStatus::Processing {
                        op.status = OperationStatus::Pending;
                        op.attempts += 1;
                    }
                    op
                })
                .collect();
            queue.sort_by_key(|op| op.priority);

            // Re-seed the dedup window so a restart doesn't re-admit
            // recent purges.
            for op in &queue {
                state.dedup.insert(op.dedup_key.clone(), op.created_at);
            }
            state.queues.insert(tenant, queue);
        }
    }
}
