use crate::{GatewayError, Services};
use models::TenantId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tenancy::Session;

/// Response payloads are capped at this many bytes before transport
/// framing; anything larger is truncated with a marker.
pub const MAX_RESPONSE_BYTES: usize = 50 * 1024;

const TRUNCATION_MARKER: &str = "\n… response truncated at 50 KiB";

/// One incoming tool invocation.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolRequest {
    pub tool: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
    #[serde(default)]
    pub session_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ContentBlock {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolResponse {
    pub content: Vec<ContentBlock>,
}

/// The wire form of a failed invocation: a stable code and one sentence.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolFailure {
    pub code: String,
    pub message: String,
}

impl From<GatewayError> for ToolFailure {
    fn from(err: GatewayError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Scope is the unit of tool authorization.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    PurgeRead,
    PurgeWrite,
    CertRead,
    CertWrite,
    PropertyRead,
    TenantAdmin,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PurgeRead => "purge:read",
            Self::PurgeWrite => "purge:write",
            Self::CertRead => "cert:read",
            Self::CertWrite => "cert:write",
            Self::PropertyRead => "property:read",
            Self::TenantAdmin => "tenant:admin",
        }
    }
}

/// ScopePolicy decides which scopes a subject holds. Injected; the
/// default grants everything, mirroring the allow-all authorizer.
pub trait ScopePolicy: Send + Sync {
    fn granted(&self, subject: &str, scope: Scope) -> bool;
}

pub struct AllScopes;

impl ScopePolicy for AllScopes {
    fn granted(&self, _subject: &str, _scope: Scope) -> bool {
        true
    }
}

/// Everything a tool invocation may touch.
pub struct ToolContext {
    pub services: Arc<Services>,
    /// None for public tools invoked without a session.
    pub session: Option<Session>,
    /// The resolved tenant: the `customer` argument, else the session's
    /// current context.
    pub tenant: TenantId,
}

impl ToolContext {
    /// The session id, for operations that need session-scoped clients.
    pub fn session_id(&self) -> Result<&str, GatewayError> {
        self.session
            .as_ref()
            .map(|s| s.id.as_str())
            .ok_or_else(|| GatewayError::Unauthorized("this tool requires a session".to_string()))
    }
}

/// Tool is one dispatchable operation.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn public(&self) -> bool {
        false
    }
    fn scopes(&self) -> &'static [Scope];

    async fn invoke(
        &self,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, GatewayError>;
}

/// Dispatcher parses tool invocations, enforces authentication, scope
/// authorization, and tenant resolution, and formats responses within the
/// payload ceiling.
pub struct Dispatcher {
    services: Arc<Services>,
    scope_policy: Arc<dyn ScopePolicy>,
    tools: HashMap<&'static str, Arc<dyn Tool>>,
    // bearer token -> session id, so repeated invocations don't
    // re-authenticate against the identity provider.
    session_ids: Mutex<HashMap<String, String>>,
}

impl Dispatcher {
    pub fn new(services: Arc<Services>, scope_policy: Arc<dyn ScopePolicy>) -> Self {
        let mut dispatcher = Self {
            services,
            scope_policy,
            tools: HashMap::new(),
            session_ids: Mutex::new(HashMap::new()),
        };
        for tool in crate::tools::all() {
            dispatcher.tools.insert(tool.name(), tool);
        }
        dispatcher
    }

    pub fn tool_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.tools.keys().copied().collect();
        names.sort();
        names
    }

    #[tracing::instrument(skip(self, request), fields(tool = %request.tool))]
    pub async fn dispatch(&self, request: ToolRequest) -> Result<ToolResponse, ToolFailure> {
        match self.dispatch_inner(request).await {
            Ok(response) => Ok(response),
            Err(err) => {
                tracing::debug!(code = err.code(), error = %err, "tool invocation failed");
                Err(err.into())
            }
        }
    }

    async fn dispatch_inner(&self, request: ToolRequest) -> Result<ToolResponse, GatewayError> {
        let tool = self
            .tools
            .get(request.tool.as_str())
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("unknown tool {:?}", request.tool)))?;

        let session = if tool.public() {
            None
        } else {
            let token = request.session_token.as_deref().ok_or_else(|| {
                GatewayError::Unauthorized(format!("tool {:?} requires a session", request.tool))
            })?;
            Some(self.session_for(token).await?)
        };

        if let Some(session) = &session {
            for scope in tool.scopes() {
                if !self.scope_policy.granted(&session.subject, *scope) {
                    return Err(GatewayError::Forbidden(format!(
                        "subject lacks the {} scope",
                        scope.as_str()
                    )));
                }
            }
        }

        let tenant = self.resolve_tenant(&request.arguments, session.as_ref())?;
        let ctx = ToolContext {
            services: self.services.clone(),
            session,
            tenant,
        };

        let value = tool.invoke(&ctx, request.arguments).await?;
        Ok(render(value))
    }

    async fn session_for(&self, token: &str) -> Result<Session, GatewayError> {
        let existing_session_id = self.session_ids.lock().unwrap().get(token).cloned();
        if let Some(session_id) = existing_session_id {
            match self
                .services
                .contexts
                .sessions()
                .snapshot(&session_id)
                .await
            {
                Ok(session) => return Ok(session),
                // Expired or revoked: fall through and re-authenticate.
                Err(_) => {
                    self.session_ids.lock().unwrap().remove(token);
                }
            }
        }

        let session = self.services.contexts.authenticate(token).await?;
        self.session_ids
            .lock()
            .unwrap()
            .insert(token.to_string(), session.id.clone());
        Ok(session)
    }

    fn resolve_tenant(
        &self,
        arguments: &serde_json::Value,
        session: Option<&Session>,
    ) -> Result<TenantId, GatewayError> {
        if let Some(customer) = arguments.get("customer") {
            let customer = customer.as_str().ok_or_else(|| {
                GatewayError::validation("the customer argument must be a string")
            })?;
            return TenantId::new(customer)
                .map_err(|err| GatewayError::validation(err.to_string()));
        }

        match session {
            Some(session) => Ok(session.current.clone()),
            // Public tools without a session fall back to a placeholder
            // tenant; tools that care demand a session instead.
            None => Ok(TenantId::new("public").expect("static tenant id is valid")),
        }
    }
}

/// Format a tool's JSON result as the response text, bounded by the
/// payload ceiling.
fn render(value: serde_json::Value) -> ToolResponse {
    let mut text = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());

    if text.len() > MAX_RESPONSE_BYTES {
        let keep = MAX_RESPONSE_BYTES - TRUNCATION_MARKER.len();
        let cut = (0..=keep).rev().find(|i| text.is_char_boundary(*i)).unwrap_or(0);
        text.truncate(cut);
        text.push_str(TRUNCATION_MARKER);
    }

    ToolResponse {
        content: vec![ContentBlock { text }],
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use models::Network;
    use tenancy::{
        Action, AllowAll, Authorizer, Bundle, ContextManager, CredentialStore, Decision, Identity,
        StaticIdentityProvider,
    };

    fn tenant(s: &str) -> TenantId {
        TenantId::new(s).unwrap()
    }

    struct FixedStore(Vec<Bundle>);
    impl CredentialStore for FixedStore {
        fn load(&self) -> Result<Vec<Bundle>, tenancy::Error> {
            Ok(self.0.clone())
        }
    }

    struct AcceptingPurge;

    #[async_trait::async_trait]
    impl fastpurge::PurgeBackend for AcceptingPurge {
        async fn submit(
            &self,
            _tenant: &TenantId,
            _kind: fastpurge::PurgeKind,
            _network: Network,
            _objects: &[String],
        ) -> Result<fastpurge::PurgeReceipt, fastpurge::BackendError> {
            Ok(fastpurge::PurgeReceipt {
                purge_id: "p-1".to_string(),
                support_id: None,
                estimated_seconds: 1,
                http_status: Some(201),
            })
        }

        async fn poll(
            &self,
            _tenant: &TenantId,
            purge_id: &str,
        ) -> Result<fastpurge::PurgePoll, fastpurge::BackendError> {
            Ok(fastpurge::PurgePoll {
                purge_id: purge_id.to_string(),
                status: "Done".to_string(),
                completion_time: None,
            })
        }
    }

    struct UnusedCert;

    #[async_trait::async_trait]
    impl cert_deploy::CertBackend for UnusedCert {
        async fn enrollment(
            &self,
            _tenant: &TenantId,
            _id: cert_deploy::EnrollmentId,
        ) -> Result<cert_deploy::Enrollment, anyhow::Error> {
            anyhow::bail!("not exercised")
        }
        async fn create_deployment(
            &self,
            _tenant: &TenantId,
            _id: cert_deploy::EnrollmentId,
            _network: Network,
        ) -> Result<u64, anyhow::Error> {
            anyhow::bail!("not exercised")
        }
        async fn deployment_status(
            &self,
            _tenant: &TenantId,
            _id: cert_deploy::EnrollmentId,
            _deployment_id: u64,
        ) -> Result<String, anyhow::Error> {
            anyhow::bail!("not exercised")
        }
        async fn cancel_deployment(
            &self,
            _tenant: &TenantId,
            _id: cert_deploy::EnrollmentId,
            _deployment_id: u64,
        ) -> Result<(), anyhow::Error> {
            anyhow::bail!("not exercised")
        }
        async fn latest_property_version(
            &self,
            _tenant: &TenantId,
            _property_id: &str,
        ) -> Result<u64, anyhow::Error> {
            anyhow::bail!("not exercised")
        }
        async fn property_hostnames(
            &self,
            _tenant: &TenantId,
            _property_id: &str,
            _version: u64,
        ) -> Result<Vec<cert_deploy::PropertyHostname>, anyhow::Error> {
            anyhow::bail!("not exercised")
        }
        async fn update_property_hostnames(
            &self,
            _tenant: &TenantId,
            _property_id: &str,
            _version: u64,
            _hostnames: &[cert_deploy::PropertyHostname],
        ) -> Result<(), anyhow::Error> {
            anyhow::bail!("not exercised")
        }
    }

    fn dispatcher_with_authorizer(authorizer: Arc<dyn Authorizer>) -> Dispatcher {
        let bundle = |name: &str| Bundle {
            tenant: tenant(name),
            environment: models::Environment::Production,
            credentials: Arc::new(edgegrid::Credentials::new(
                "ct",
                "at",
                "cs",
                format!("{name}.example.net"),
            )),
        };
        let store = FixedStore(vec![bundle("t1"), bundle("t2")]);
        let provider = Arc::new(StaticIdentityProvider::default().with(
            "bearer-1",
            Identity {
                subject: "alice".to_string(),
                tenants: vec![tenant("t1"), tenant("t2")],
                expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
            },
        ));
        let contexts = Arc::new(
            ContextManager::new(&store, provider, authorizer, edgegrid::Transport::new()).unwrap(),
        );

        let services = Arc::new(Services {
            contexts,
            cache: cache::SmartCache::new(cache::CacheConfig::default()),
            purge: fastpurge::PurgeService::new(
                Arc::new(AcceptingPurge),
                fastpurge::ServiceConfig::default(),
            ),
            certs: cert_deploy::DeployCoordinator::new(
                Arc::new(UnusedCert),
                cert_deploy::CoordinatorConfig::default(),
            ),
        });
        Dispatcher::new(services, Arc::new(AllScopes))
    }

    fn dispatcher() -> Dispatcher {
        dispatcher_with_authorizer(Arc::new(AllowAll))
    }

    fn request(tool: &str, arguments: serde_json::Value) -> ToolRequest {
        ToolRequest {
            tool: tool.to_string(),
            arguments,
            session_token: Some("bearer-1".to_string()),
        }
    }

    #[tokio::test]
    async fn unknown_tools_are_not_found() {
        let failure = dispatcher()
            .dispatch(request("nope.nothing", serde_json::json!({})))
            .await
            .unwrap_err();
        assert_eq!(failure.code, "not-found");
    }

    #[tokio::test]
    async fn missing_session_token_is_unauthorized() {
        let mut req = request("tenant.list", serde_json::json!({}));
        req.session_token = None;
        let failure = dispatcher().dispatch(req).await.unwrap_err();
        assert_eq!(failure.code, "unauthorized");
    }

    #[tokio::test]
    async fn bad_bearer_token_is_unauthorized() {
        let mut req = request("tenant.list", serde_json::json!({}));
        req.session_token = Some("wrong".to_string());
        let failure = dispatcher().dispatch(req).await.unwrap_err();
        assert_eq!(failure.code, "unauthorized");
    }

    #[tokio::test]
    async fn purge_enqueue_round_trips_and_duplicates_conflict() {
        let dispatcher = dispatcher();

        let response = dispatcher
            .dispatch(request(
                "purge.url",
                serde_json::json!({"objects": ["https://a/"]}),
            ))
            .await
            .unwrap();
        assert!(response.content[0].text.contains("operation"));

        let failure = dispatcher
            .dispatch(request(
                "purge.url",
                serde_json::json!({"objects": ["https://a/"]}),
            ))
            .await
            .unwrap_err();
        assert_eq!(failure.code, "conflict");
    }

    #[tokio::test]
    async fn empty_purges_are_a_validation_error() {
        let failure = dispatcher()
            .dispatch(request("purge.url", serde_json::json!({"objects": []})))
            .await
            .unwrap_err();
        assert_eq!(failure.code, "validation");
    }

    #[tokio::test]
    async fn the_customer_argument_routes_the_tenant() {
        let dispatcher = dispatcher();

        dispatcher
            .dispatch(request(
                "purge.url",
                serde_json::json!({"objects": ["https://b/"], "customer": "t2"}),
            ))
            .await
            .unwrap();

        let response = dispatcher
            .dispatch(request(
                "purge.dashboard",
                serde_json::json!({"customer": "t2"}),
            ))
            .await
            .unwrap();
        let dashboard: serde_json::Value =
            serde_json::from_str(&response.content[0].text).unwrap();
        assert_eq!(dashboard["tenant"], "t2");
        assert_eq!(dashboard["queued"], 1);
    }

    #[tokio::test]
    async fn denied_switches_surface_the_policy_reason() {
        let policy = |_subject: &str, action: Action, resource: &str| {
            if action == Action::SwitchContext && resource == "t2" {
                Decision::deny("alice is scoped to t1")
            } else {
                Decision::Allow
            }
        };
        let dispatcher = dispatcher_with_authorizer(Arc::new(policy));

        let failure = dispatcher
            .dispatch(request(
                "tenant.switch",
                serde_json::json!({"customer": "t2"}),
            ))
            .await
            .unwrap_err();
        assert_eq!(failure.code, "forbidden");
        assert!(failure.message.contains("alice is scoped to t1"));

        // The session still points at t1.
        let response = dispatcher
            .dispatch(request("tenant.list", serde_json::json!({})))
            .await
            .unwrap();
        let listing: serde_json::Value = serde_json::from_str(&response.content[0].text).unwrap();
        assert_eq!(listing["current"], "t1");
    }

    #[test]
    fn render_bounds_the_payload() {
        let small = render(serde_json::json!({"ok": true}));
        assert!(small.content[0].text.contains("\"ok\""));

        let huge = render(serde_json::Value::String("x".repeat(200 * 1024)));
        let text = &huge.content[0].text;
        assert!(text.len() <= MAX_RESPONSE_BYTES);
        assert!(text.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn scope_names_are_stable() {
        assert_eq!(Scope::PurgeWrite.as_str(), "purge:write");
        assert_eq!(Scope::TenantAdmin.as_str(), "tenant:admin");
    }
}
