use crate::api::{BackendError, PurgeBackend};
use crate::batch::partition;
use crate::queue::{QueueConfig, QueueManager};
use crate::tracker::StatusTracker;
use crate::types::{BatchState, BatchStatus, OperationStatus, PurgeOperation};
use crate::Error;
use chrono::Utc;
use limits::{SlidingWindow, TokenBucket};
use models::TenantId;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// ServiceConfig tunes the purge pipeline. The defaults implement the
/// documented contract; tests shrink them.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub queue: QueueConfig,
    pub queue_persist_dir: Option<PathBuf>,
    pub status_persist_dir: Option<PathBuf>,
    /// Idle pause between drain passes.
    pub drain_interval: Duration,
    /// Queue snapshot cadence.
    pub persist_interval: Duration,
    /// Terminal-operation retention sweep cadence.
    pub retention_interval: Duration,
    /// Send attempts before an operation is marked failed.
    pub max_attempts: u32,
    /// Sliding-window limit per tenant.
    pub window_limit: usize,
    pub window: Duration,
    /// Auxiliary token bucket for spikes.
    pub bucket_burst: u32,
    pub bucket_refill_per_sec: f64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            queue_persist_dir: None,
            status_persist_dir: None,
            drain_interval: Duration::from_millis(500),
            persist_interval: Duration::from_secs(10),
            retention_interval: Duration::from_secs(3600),
            max_attempts: 3,
            window_limit: 100,
            window: Duration::from_secs(60),
            bucket_burst: 50,
            bucket_refill_per_sec: 100.0 / 60.0,
        }
    }
}

/// Per-tenant admission: the sliding window is the contract, the token
/// bucket absorbs spikes. Tokens are consumed at the moment of send.
pub(crate) struct TenantLimiter {
    pub window: SlidingWindow,
    bucket: TokenBucket,
}

impl TenantLimiter {
    fn new(config: &ServiceConfig) -> Self {
        Self {
            window: SlidingWindow::new(config.window_limit, config.window),
            bucket: TokenBucket::new(config.bucket_burst, config.bucket_refill_per_sec),
        }
    }

    fn ready(&self) -> bool {
        self.window.retry_after().is_zero() && self.bucket.time_to_available(1).is_zero()
    }

    fn try_consume(&self) -> bool {
        self.ready() && self.window.try_acquire() && self.bucket.try_acquire(1)
    }
}

enum SendOutcome {
    /// Every batch was submitted.
    Submitted,
    /// Local limiter or upstream 429: not an attempt, try again later.
    Throttled,
    /// The send failed; consumes an attempt.
    Failed(String),
}

/// PurgeService drives the pipeline: it drains per-tenant queues through
/// the rate limiters and the signed purge endpoint, hands submitted
/// operations to the status tracker, and runs the persistence and
/// retention workers.
pub struct PurgeService {
    queue: Arc<QueueManager>,
    tracker: Arc<StatusTracker>,
    backend: Arc<dyn PurgeBackend>,
    limiters: Mutex<HashMap<TenantId, Arc<TenantLimiter>>>,
    config: ServiceConfig,
    shutdown: CancellationToken,
}

impl PurgeService {
    pub fn new(backend: Arc<dyn PurgeBackend>, config: ServiceConfig) -> Arc<Self> {
        let queue = Arc::new(QueueManager::new(config.queue.clone()));
        let tracker = StatusTracker::new(backend.clone(), config.status_persist_dir.clone());

        Arc::new(Self {
            queue,
            tracker,
            backend,
            limiters: Mutex::new(HashMap::new()),
            config,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.queue
    }

    pub fn tracker(&self) -> &Arc<StatusTracker> {
        &self.tracker
    }

    /// Reload persisted queues and in-flight statuses, then spawn the
    /// drain, persistence, and retention workers.
    pub fn start(self: &Arc<Self>) -> Result<(), Error> {
        if let Some(dir) = &self.config.queue_persist_dir {
            let restored = self.queue.restore_from(dir)?;
            tracing::info!(restored, "restored purge queues");
        }
        let resumed = self.tracker.resume_from_disk()?;
        if resumed > 0 {
            tracing::info!(resumed, "resumed polling in-flight purge operations");
        }

        {
            let service = self.clone();
            tokio::spawn(async move { service.drain_loop().await });
        }
        {
            let service = self.clone();
            tokio::spawn(async move { service.persist_loop().await });
        }
        {
            let service = self.clone();
            tokio::spawn(async move { service.retention_loop().await });
        }
        Ok(())
    }

    /// Stop the workers, halt polling, and take a final queue snapshot.
    pub fn stop(&self) {
        self.shutdown.cancel();
        self.tracker.stop();
        if let Some(dir) = &self.config.queue_persist_dir {
            if let Err(err) = self.queue.persist_to(dir) {
                tracing::error!(error = %err, "final queue snapshot failed");
            }
        }
    }

    async fn drain_loop(self: Arc<Self>) {
        loop {
            // Jitter the pause so replicas don't drain in lockstep.
            let jitter = 0.9 + rand::random::<f64>() * 0.2;
            tokio::select! {
                () = self.shutdown.cancelled() => return,
                () = tokio::time::sleep(self.config.drain_interval.mul_f64(jitter)) => {}
            }
            self.drain_once().await;
        }
    }

    async fn persist_loop(self: Arc<Self>) {
        let Some(dir) = self.config.queue_persist_dir.clone() else {
            return;
        };
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => return,
                () = tokio::time::sleep(self.config.persist_interval) => {}
            }
            if let Err(err) = self.queue.persist_to(&dir) {
                tracing::warn!(error = %err, "periodic queue snapshot failed");
            }
        }
    }

    async fn retention_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => return,
                () = tokio::time::sleep(self.config.retention_interval) => {}
            }
            self.tracker.sweep_retention();
        }
    }

    /// One pass over every tenant with pending work.
    pub(crate) async fn drain_once(&self) {
        eprintln!("DEBUG drain_once start");
        for tenant in self.queue.tenants_with_pending() {
            let limiter = self.limiter(&tenant);
            if !limiter.ready() {
                continue;
            }
            let Some(mut op) = self.queue.claim_next(&tenant) else {
                continue;
            };

            match self.send_operation(&mut op, &limiter).await {
                SendOutcome::Submitted => {
                    op.status = OperationStatus::InProgress;
                    if let Some(op) = self.queue.settle(op) {
                        self.tracker.track(op);
                    }
                }
                SendOutcome::Throttled => {
                    // Not an attempt: hand the claim back untouched.
                    op.status = OperationStatus::Pending;
                    op.attempts = op.attempts.saturating_sub(1);
                    self.queue.settle(op);
                }
                SendOutcome::Failed(error) => {
                    op.push_error(error);
                    if op.attempts >= self.config.max_attempts {
                        op.status = OperationStatus::Failed;
                        tracing::warn!(
                            op = %op.id,
                            tenant = %tenant,
                            attempts = op.attempts,
                            "purge operation exhausted its attempts"
                        );
                        if let Some(op) = self.queue.settle(op) {
                            // Terminal, but submitted batches still finish
                            // polling and can upgrade the outcome.
                            self.tracker.track(op);
                        }
                    } else {
                        op.status = OperationStatus::Pending;
                        self.queue.settle(op);
                    }
                }
            }
        }
    }

    async fn send_operation(
        &self,
        op: &mut PurgeOperation,
        limiter: &TenantLimiter,
    ) -> SendOutcome {
        while !op.unsent_objects().is_empty() {
            eprintln!("DEBUG send_operation loop, unsent={}", op.unsent_objects().len());
            let batch_objects = partition(op.unsent_objects())
                .into_iter()
                .next()
                .expect("non-empty remainder partitions to at least one batch");

            // A token is consumed only now, when the send actually happens.
            if !limiter.try_consume() {
                return SendOutcome::Throttled;
            }

            match self
                .backend
                .submit(&op.tenant, op.kind, op.network, &batch_objects)
                .await
            {
                Ok(receipt) => {
                    op.batches.push(BatchState {
                        purge_id: receipt.purge_id,
                        support_id: receipt.support_id,
                        objects: batch_objects,
                        status: BatchStatus::Pending,
                        estimated_seconds: receipt.estimated_seconds,
                        submitted_at: Utc::now(),
                        completed_at: None,
                        error: None,
                    });
                }
                Err(BackendError::RateLimited { retry_after }) => {
                    tracing::debug!(
                        op = %op.id,
                        ?retry_after,
                        "purge endpoint rate limited; backing off without consuming a retry"
                    );
                    return SendOutcome::Throttled;
                }
                Err(BackendError::Other(err)) => {
                    return SendOutcome::Failed(format!("{err:#}"));
                }
            }
        }
        SendOutcome::Submitted
    }

    fn limiter(&self, tenant: &TenantId) -> Arc<TenantLimiter> {
        self.limiters
            .lock()
            .unwrap()
            .entry(tenant.clone())
            .or_insert_with(|| Arc::new(TenantLimiter::new(&self.config)))
            .clone()
    }

    /// The tenant's current rate-limit window utilization, in [0, 1].
    pub fn rate_limit_utilization(&self, tenant: &TenantId) -> f64 {
        self.limiter(tenant).window.utilization()
    }
}
