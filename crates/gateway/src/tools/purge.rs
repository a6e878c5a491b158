use super::{parse_args, CommonArgs};
use crate::dispatcher::{Scope, Tool, ToolContext};
use crate::GatewayError;
use fastpurge::PurgeKind;
use models::Network;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct EnqueueArgs {
    objects: Vec<String>,
    #[serde(default)]
    network: Option<Network>,
    #[serde(default)]
    #[allow(dead_code)]
    customer: Option<String>,
}

/// `purge.url` / `purge.cpcode` / `purge.tag`: admit a purge into the
/// pipeline and report its queue position.
pub struct PurgeEnqueue {
    name: &'static str,
    kind: PurgeKind,
}

impl PurgeEnqueue {
    pub fn url() -> Self {
        Self {
            name: "purge.url",
            kind: PurgeKind::Url,
        }
    }
    pub fn cpcode() -> Self {
        Self {
            name: "purge.cpcode",
            kind: PurgeKind::Cpcode,
        }
    }
    pub fn tag() -> Self {
        Self {
            name: "purge.tag",
            kind: PurgeKind::Tag,
        }
    }
}

#[async_trait::async_trait]
impl Tool for PurgeEnqueue {
    fn name(&self) -> &'static str {
        self.name
    }

    fn scopes(&self) -> &'static [Scope] {
        &[Scope::PurgeWrite]
    }

    async fn invoke(
        &self,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, GatewayError> {
        let args: EnqueueArgs = parse_args(arguments)?;
        let network = args.network.unwrap_or(Network::Production);

        let op_id = ctx.services.purge.queue().enqueue(
            &ctx.tenant,
            self.kind,
            network,
            args.objects,
        )?;

        Ok(serde_json::json!({
            "operation": op_id,
            "kind": self.kind,
            "network": network,
            "queueDepth": ctx.services.purge.queue().depth(&ctx.tenant),
        }))
    }
}

#[derive(Debug, Deserialize)]
struct StatusArgs {
    operation: String,
    #[serde(default)]
    #[allow(dead_code)]
    customer: Option<String>,
}

/// `purge.status`: progress of one admitted operation.
pub struct PurgeStatus;

#[async_trait::async_trait]
impl Tool for PurgeStatus {
    fn name(&self) -> &'static str {
        "purge.status"
    }

    fn scopes(&self) -> &'static [Scope] {
        &[Scope::PurgeRead]
    }

    async fn invoke(
        &self,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, GatewayError> {
        let args: StatusArgs = parse_args(arguments)?;
        let op_id: models::Id = args
            .operation
            .parse()
            .map_err(|_| GatewayError::validation(format!("invalid operation id {:?}", args.operation)))?;

        let report = ctx.services.purge.tracker().progress(op_id)?;
        if report.tenant != ctx.tenant {
            // Another tenant's operations are invisible, not forbidden.
            return Err(GatewayError::NotFound(format!(
                "unknown purge operation {op_id}"
            )));
        }
        Ok(serde_json::to_value(report).expect("reports serialize"))
    }
}

/// `purge.dashboard`: the tenant's purge activity aggregates.
pub struct PurgeDashboard;

#[async_trait::async_trait]
impl Tool for PurgeDashboard {
    fn name(&self) -> &'static str {
        "purge.dashboard"
    }

    fn scopes(&self) -> &'static [Scope] {
        &[Scope::PurgeRead]
    }

    async fn invoke(
        &self,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, GatewayError> {
        let _: CommonArgs = parse_args(arguments)?;
        let dashboard = ctx.services.purge.dashboard(&ctx.tenant);
        Ok(serde_json::to_value(dashboard).expect("dashboards serialize"))
    }
}

/// `purge.consolidation`: advisory suggestions for pending URL purges.
pub struct PurgeConsolidation;

#[async_trait::async_trait]
impl Tool for PurgeConsolidation {
    fn name(&self) -> &'static str {
        "purge.consolidation"
    }

    fn scopes(&self) -> &'static [Scope] {
        &[Scope::PurgeRead]
    }

    async fn invoke(
        &self,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, GatewayError> {
        let _: CommonArgs = parse_args(arguments)?;
        let suggestions = ctx
            .services
            .purge
            .queue()
            .consolidation_advice(&ctx.tenant);
        Ok(serde_json::json!({ "suggestions": suggestions }))
    }
}
