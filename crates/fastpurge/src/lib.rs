//! The FastPurge pipeline: admission with deduplication and priorities,
//! size-bounded batching, per-tenant rate limiting, a retrying send worker,
//! crash-safe queue persistence, and a status tracker which polls every
//! asynchronous purge id to completion.

mod api;
mod batch;
mod dashboard;
mod queue;
mod tracker;
mod types;
mod worker;

pub use api::{BackendError, ClientProvider, EdgeBackend, PurgeBackend, PurgePoll, PurgeReceipt};
pub use batch::{partition, MAX_BATCH_BYTES, MAX_BATCH_OBJECTS};
pub use dashboard::TenantDashboard;
pub use queue::{ConsolidationSuggestion, QueueConfig, QueueManager, DEDUP_WINDOW};
pub use tracker::{ProgressCallback, ProgressReport, StatusTracker, RETENTION};
pub use types::{
    dedup_key, BatchState, BatchStatus, OperationStatus, PurgeKind, PurgeOperation,
};
pub use worker::{PurgeService, ServiceConfig};

use models::TenantId;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("a purge requires at least one object")]
    EmptyPurge,
    #[error("an identical purge was admitted within the last five minutes")]
    Duplicate { dedup_key: String },
    #[error("tenant {tenant} purge queue is at capacity ({depth} pending)")]
    Capacity { tenant: TenantId, depth: usize },
    #[error("unknown purge operation {0}")]
    UnknownOperation(models::Id),
    #[error("purge persistence failed")]
    Persist(#[source] anyhow::Error),
}

impl Error {
    /// Capacity pressure is transient; callers may retry after backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Capacity { .. })
    }
}
