//! The control-plane gateway: a tool dispatcher over the tenant context
//! layer, smart cache, purge pipeline, and certificate coordinator.

mod config;
mod dispatcher;
mod error;
pub mod tools;

pub use config::GatewayConfig;
pub use dispatcher::{
    AllScopes, ContentBlock, Dispatcher, Scope, ScopePolicy, Tool, ToolContext, ToolFailure,
    ToolRequest, ToolResponse, MAX_RESPONSE_BYTES,
};
pub use error::GatewayError;

use std::sync::Arc;

/// Services is the wired set of process-wide components, constructed once
/// at startup and shared by reference.
pub struct Services {
    pub contexts: Arc<tenancy::ContextManager>,
    pub cache: cache::SmartCache,
    pub purge: Arc<fastpurge::PurgeService>,
    pub certs: Arc<cert_deploy::DeployCoordinator>,
}

impl Services {
    /// Wire the standard production topology: context manager feeding
    /// signed clients to the purge and certificate backends, with the
    /// cache flushing a tenant's namespace on credential rotation.
    pub fn wire(
        contexts: Arc<tenancy::ContextManager>,
        cache: cache::SmartCache,
        purge_config: fastpurge::ServiceConfig,
        cert_config: cert_deploy::CoordinatorConfig,
    ) -> Arc<Self> {
        {
            let cache = cache.clone();
            contexts.on_rotation(Box::new(move |tenant| {
                let flushed = cache.invalidate(&format!("{tenant}:*"));
                tracing::info!(tenant = %tenant, flushed, "flushed cache namespace after rotation");
            }));
        }

        let purge_provider = {
            let contexts = contexts.clone();
            move |tenant: &models::TenantId| {
                contexts.client_for(tenant).map_err(anyhow::Error::new)
            }
        };
        let purge = fastpurge::PurgeService::new(
            Arc::new(fastpurge::EdgeBackend::new(Arc::new(purge_provider))),
            purge_config,
        );

        let cert_provider = {
            let contexts = contexts.clone();
            move |tenant: &models::TenantId| {
                contexts.client_for(tenant).map_err(anyhow::Error::new)
            }
        };
        let certs = cert_deploy::DeployCoordinator::new(
            Arc::new(cert_deploy::EdgeCertBackend::new(Arc::new(cert_provider))),
            cert_config,
        );

        Arc::new(Self {
            contexts,
            cache,
            purge,
            certs,
        })
    }

    /// Start background workers (queue drain, persistence, retention).
    pub fn start(&self) -> Result<(), GatewayError> {
        self.cache
            .load_from_disk()
            .map_err(|err| GatewayError::Internal(err.to_string()))?;
        self.purge
            .start()
            .map_err(|err| GatewayError::Internal(err.to_string()))?;
        Ok(())
    }

    /// Stop workers and flush durable state.
    pub fn shutdown(&self) {
        self.purge.stop();
        self.certs.stop();
        self.cache.stop_refreshes();
        if let Err(err) = self.cache.flush_to_disk() {
            tracing::warn!(error = %err, "cache snapshot failed during shutdown");
        }
    }
}
