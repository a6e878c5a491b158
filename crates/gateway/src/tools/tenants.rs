use super::{parse_args, CommonArgs};
use crate::dispatcher::{Scope, Tool, ToolContext};
use crate::GatewayError;
use models::TenantId;
use serde::Deserialize;

/// `tenant.list`: the session's reachable tenants and current context.
pub struct TenantList;

#[async_trait::async_trait]
impl Tool for TenantList {
    fn name(&self) -> &'static str {
        "tenant.list"
    }

    fn scopes(&self) -> &'static [Scope] {
        &[]
    }

    async fn invoke(
        &self,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, GatewayError> {
        let _: CommonArgs = parse_args(arguments)?;
        let session = ctx
            .session
            .as_ref()
            .ok_or_else(|| GatewayError::Unauthorized("tenant.list requires a session".into()))?;

        let configured = ctx.services.contexts.tenants();
        let tenants: Vec<serde_json::Value> = session
            .available
            .iter()
            .map(|tenant| {
                serde_json::json!({
                    "id": tenant,
                    "current": *tenant == session.current,
                    "configured": configured.contains(tenant),
                })
            })
            .collect();

        Ok(serde_json::json!({
            "current": session.current,
            "tenants": tenants,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct SwitchArgs {
    customer: String,
}

/// `tenant.switch`: move the session's current context, subject to
/// authorization.
pub struct TenantSwitch;

#[async_trait::async_trait]
impl Tool for TenantSwitch {
    fn name(&self) -> &'static str {
        "tenant.switch"
    }

    fn scopes(&self) -> &'static [Scope] {
        &[Scope::TenantAdmin]
    }

    async fn invoke(
        &self,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, GatewayError> {
        let args: SwitchArgs = parse_args(arguments)?;
        let target = TenantId::new(&args.customer)
            .map_err(|err| GatewayError::validation(err.to_string()))?;

        let session = ctx
            .services
            .contexts
            .switch_context(ctx.session_id()?, target)
            .await?;

        Ok(serde_json::json!({
            "current": session.current,
            "switched": true,
        }))
    }
}
