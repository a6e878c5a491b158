use crate::types::PurgeKind;
use models::{Network, TenantId};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// The submission acknowledgment from the purge endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeReceipt {
    pub purge_id: String,
    #[serde(default)]
    pub support_id: Option<String>,
    #[serde(default = "default_estimated_seconds")]
    pub estimated_seconds: u32,
    #[serde(default)]
    pub http_status: Option<u16>,
}

fn default_estimated_seconds() -> u32 {
    5
}

/// One poll of an asynchronous purge id.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgePoll {
    pub purge_id: String,
    /// Back-end status string: `Done`, `In-Progress`, or `Unknown`.
    pub status: String,
    #[serde(default)]
    pub completion_time: Option<chrono::DateTime<chrono::Utc>>,
}

/// BackendError separates rate limiting (backed off without consuming a
/// retry) from everything else (which does consume one).
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("purge endpoint rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Duration },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<edgegrid::Error> for BackendError {
    fn from(err: edgegrid::Error) -> Self {
        match err {
            edgegrid::Error::RateLimited { retry_after, .. } => {
                BackendError::RateLimited { retry_after }
            }
            other => BackendError::Other(other.into()),
        }
    }
}

/// PurgeBackend abstracts the purge API so the queue worker and status
/// tracker are testable against a scripted double.
#[async_trait::async_trait]
pub trait PurgeBackend: Send + Sync + 'static {
    async fn submit(
        &self,
        tenant: &TenantId,
        kind: PurgeKind,
        network: Network,
        objects: &[String],
    ) -> Result<PurgeReceipt, BackendError>;

    async fn poll(&self, tenant: &TenantId, purge_id: &str) -> Result<PurgePoll, BackendError>;
}

/// ClientProvider hands out a signed client for a tenant. Implemented by
/// the tenant context layer; injected here so this crate doesn't own
/// credential policy.
pub trait ClientProvider: Send + Sync + 'static {
    fn client_for(&self, tenant: &TenantId) -> Result<edgegrid::Client, anyhow::Error>;
}

impl<F> ClientProvider for F
where
    F: Fn(&TenantId) -> Result<edgegrid::Client, anyhow::Error> + Send + Sync + 'static,
{
    fn client_for(&self, tenant: &TenantId) -> Result<edgegrid::Client, anyhow::Error> {
        self(tenant)
    }
}

/// EdgeBackend is the production backend: signed calls against the
/// invalidation endpoint family.
pub struct EdgeBackend {
    provider: Arc<dyn ClientProvider>,
}

impl EdgeBackend {
    pub fn new(provider: Arc<dyn ClientProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait::async_trait]
impl PurgeBackend for EdgeBackend {
    #[tracing::instrument(skip(self, objects), fields(count = objects.len()))]
    async fn submit(
        &self,
        tenant: &TenantId,
        kind: PurgeKind,
        network: Network,
        objects: &[String],
    ) -> Result<PurgeReceipt, BackendError> {
        let client = self.provider.client_for(tenant)?;
        let request = edgegrid::Request::post(format!("/ccu/v3/invalidate/{kind}/{network}"))
            .json(&serde_json::json!({ "objects": objects }))
            .map_err(anyhow::Error::from)?;

        let receipt: PurgeReceipt = client.send_json(request).await?;
        tracing::debug!(purge_id = %receipt.purge_id, "purge batch accepted");
        Ok(receipt)
    }

    async fn poll(&self, tenant: &TenantId, purge_id: &str) -> Result<PurgePoll, BackendError> {
        let client = self.provider.client_for(tenant)?;
        let request = edgegrid::Request::get(format!("/ccu/v3/purges/{purge_id}"));
        Ok(client.send_json(request).await?)
    }
}
