use super::{parse_args, CommonArgs};
use crate::dispatcher::{Scope, Tool, ToolContext};
use crate::GatewayError;
use cache::RefreshOptions;
use serde::Deserialize;

/// `property.list`: the tenant's properties, served through the smart
/// cache with stale-while-revalidate.
pub struct PropertyList;

#[async_trait::async_trait]
impl Tool for PropertyList {
    fn name(&self) -> &'static str {
        "property.list"
    }

    fn scopes(&self) -> &'static [Scope] {
        &[Scope::PropertyRead]
    }

    async fn invoke(
        &self,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, GatewayError> {
        let _: CommonArgs = parse_args(arguments)?;
        cached_get(ctx, "properties:all", "/papi/v1/properties", "property.list").await
    }
}

#[derive(Debug, Deserialize)]
struct GetArgs {
    #[serde(rename = "propertyId")]
    property_id: String,
    #[serde(default)]
    #[allow(dead_code)]
    customer: Option<String>,
}

/// `property.get`: one property document, cached per tenant.
pub struct PropertyGet;

#[async_trait::async_trait]
impl Tool for PropertyGet {
    fn name(&self) -> &'static str {
        "property.get"
    }

    fn scopes(&self) -> &'static [Scope] {
        &[Scope::PropertyRead]
    }

    async fn invoke(
        &self,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, GatewayError> {
        let args: GetArgs = parse_args(arguments)?;
        if args.property_id.is_empty() || args.property_id.contains('/') {
            return Err(GatewayError::validation(format!(
                "invalid propertyId {:?}",
                args.property_id
            )));
        }

        let resource = format!("property:{}", args.property_id);
        let path = format!("/papi/v1/properties/{}", args.property_id);
        cached_get(ctx, &resource, &path, "property.get").await
    }
}

/// Read a back-end document through the cache. The fetch runs under the
/// session's credentials for the resolved tenant; concurrent readers of
/// one key coalesce onto a single upstream call.
async fn cached_get(
    ctx: &ToolContext,
    resource: &str,
    path: &str,
    purpose: &str,
) -> Result<serde_json::Value, GatewayError> {
    let key = format!("{}:{resource}", ctx.tenant);
    let config = ctx.services.cache.config();
    let opts = RefreshOptions::ttl(config.default_ttl).with_soft_ttl(config.default_ttl / 2);

    let client = ctx
        .services
        .contexts
        .client(ctx.session_id()?, Some(ctx.tenant.clone()), purpose)
        .await?;
    let path = path.to_string();

    let bytes = ctx
        .services
        .cache
        .get_with_refresh(&key, opts, move || async move {
            let response = client.send(edgegrid::Request::get(path)).await?;
            Ok(response.body.to_vec())
        })
        .await?;

    serde_json::from_slice(&bytes)
        .map_err(|err| GatewayError::Upstream(format!("malformed back-end document: {err}")))
}
