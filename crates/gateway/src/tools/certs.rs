use super::parse_args;
use crate::dispatcher::{Scope, Tool, ToolContext};
use crate::GatewayError;
use cert_deploy::{DeployOptions, EnrollmentId};
use models::Network;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct DeployArgs {
    enrollment: EnrollmentId,
    network: Network,
    #[serde(default)]
    properties: Vec<String>,
    #[serde(default)]
    parallel: bool,
    #[serde(default)]
    rollback_on_failure: bool,
    #[serde(default)]
    #[allow(dead_code)]
    customer: Option<String>,
}

/// `cert.deploy`: admit a deployment run and return immediately; the run
/// continues in the background and is queried with `cert.status`.
pub struct CertDeploy;

#[async_trait::async_trait]
impl Tool for CertDeploy {
    fn name(&self) -> &'static str {
        "cert.deploy"
    }

    fn scopes(&self) -> &'static [Scope] {
        &[Scope::CertWrite]
    }

    async fn invoke(
        &self,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, GatewayError> {
        let args: DeployArgs = parse_args(arguments)?;
        let opts = DeployOptions {
            network: args.network,
            auto_link: args.properties,
            parallel_linking: args.parallel,
            rollback_on_failure: args.rollback_on_failure,
        };

        let accepted = ctx
            .services
            .certs
            .start_deploy(&ctx.tenant, args.enrollment, opts)
            .await?;

        Ok(serde_json::json!({
            "enrollment": args.enrollment,
            "accepted": true,
            "status": accepted.status,
            "progress": accepted.progress,
            "propertyLinks": accepted.property_links.len(),
        }))
    }
}

#[derive(Debug, Deserialize)]
struct StatusArgs {
    enrollment: EnrollmentId,
    #[serde(default)]
    #[allow(dead_code)]
    customer: Option<String>,
}

/// `cert.status`: the queryable state of an enrollment's most recent run.
pub struct CertStatus;

#[async_trait::async_trait]
impl Tool for CertStatus {
    fn name(&self) -> &'static str {
        "cert.status"
    }

    fn scopes(&self) -> &'static [Scope] {
        &[Scope::CertRead]
    }

    async fn invoke(
        &self,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, GatewayError> {
        let args: StatusArgs = parse_args(arguments)?;
        let state = ctx.services.certs.status(args.enrollment).ok_or_else(|| {
            GatewayError::NotFound(format!(
                "no deployment state for enrollment {}",
                args.enrollment
            ))
        })?;
        Ok(serde_json::to_value(state).expect("deployment state serializes"))
    }
}
