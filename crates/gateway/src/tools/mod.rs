//! The registered toolset. Each tool parses its own arguments, invokes
//! the owning component, and returns a JSON document for the dispatcher
//! to render.

use crate::dispatcher::Tool;
use crate::GatewayError;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;

mod certs;
mod properties;
mod purge;
mod tenants;

/// Every tool the gateway serves.
pub fn all() -> Vec<Arc<dyn Tool>> {
    vec![
        Arc::new(tenants::TenantList),
        Arc::new(tenants::TenantSwitch),
        Arc::new(purge::PurgeEnqueue::url()),
        Arc::new(purge::PurgeEnqueue::cpcode()),
        Arc::new(purge::PurgeEnqueue::tag()),
        Arc::new(purge::PurgeStatus),
        Arc::new(purge::PurgeDashboard),
        Arc::new(purge::PurgeConsolidation),
        Arc::new(certs::CertDeploy),
        Arc::new(certs::CertStatus),
        Arc::new(properties::PropertyList),
        Arc::new(properties::PropertyGet),
    ]
}

pub(crate) fn parse_args<T: DeserializeOwned>(
    arguments: serde_json::Value,
) -> Result<T, GatewayError> {
    let arguments = if arguments.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        arguments
    };
    serde_json::from_value(arguments)
        .map_err(|err| GatewayError::validation(format!("invalid arguments: {err}")))
}

/// Arguments for tools that take nothing beyond the optional customer,
/// which the dispatcher has already resolved.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct CommonArgs {
    #[serde(default)]
    #[allow(dead_code)]
    pub customer: Option<String>,
}
