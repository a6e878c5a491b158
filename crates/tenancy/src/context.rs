use crate::{
    Action, Authorizer, Bundle, CredentialStore, Decision, Error, IdentityProvider, Session,
    SessionManager,
};
use edgegrid::Transport;
use models::TenantId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// Callback invoked after a tenant's bundle is rotated, so dependents can
/// drop credential-sensitive state (the cache flushes the tenant prefix).
pub type RotationHook = Box<dyn Fn(&TenantId) + Send + Sync>;

// Bound on concurrently in-flight signed requests per tenant.
const PER_TENANT_IN_FLIGHT: usize = 16;

type Slot = Arc<RwLock<Bundle>>;

/// ContextManager resolves sessions to tenant contexts and produces signed
/// HTTP clients bound to the right credential bundle for the scope of one
/// operation.
pub struct ContextManager {
    sessions: SessionManager,
    authorizer: Arc<dyn Authorizer>,
    transport: Transport,
    slots: RwLock<HashMap<TenantId, Slot>>,
    semaphores: Mutex<HashMap<TenantId, Arc<tokio::sync::Semaphore>>>,
    rotation_hooks: Mutex<Vec<RotationHook>>,
}

impl ContextManager {
    /// Load every bundle from `store` and stand up the manager.
    pub fn new(
        store: &dyn CredentialStore,
        provider: Arc<dyn IdentityProvider>,
        authorizer: Arc<dyn Authorizer>,
        transport: Transport,
    ) -> Result<Self, Error> {
        let mut slots = HashMap::new();
        for bundle in store.load()? {
            slots.insert(bundle.tenant.clone(), Arc::new(RwLock::new(bundle)));
        }

        Ok(Self {
            sessions: SessionManager::new(provider),
            authorizer,
            transport,
            slots: RwLock::new(slots),
            semaphores: Mutex::new(HashMap::new()),
            rotation_hooks: Mutex::new(Vec::new()),
        })
    }

    pub fn on_rotation(&self, hook: RotationHook) {
        self.rotation_hooks.lock().unwrap().push(hook);
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Every tenant this process holds credentials for.
    pub fn tenants(&self) -> Vec<TenantId> {
        let mut tenants: Vec<_> = self.slots.read().unwrap().keys().cloned().collect();
        tenants.sort();
        tenants
    }

    /// Authenticate a bearer token into a session.
    pub async fn authenticate(&self, bearer: &str) -> Result<Session, Error> {
        self.sessions.authenticate(bearer).await
    }

    /// Move the session's current context to `target`. Concurrent switches
    /// of one session serialize on the session lock.
    #[tracing::instrument(skip(self), err)]
    pub async fn switch_context(
        &self,
        session_id: &str,
        target: TenantId,
    ) -> Result<Session, Error> {
        let shared = self.sessions.get(session_id)?;
        let mut session = shared.lock().await;

        if session.is_expired() {
            return Err(Error::SessionExpired);
        }
        if !session.available.contains(&target) {
            return Err(Error::TenantNotAvailable(target));
        }

        if let Decision::Deny { reason } =
            self.authorizer
                .allow(&session.subject, Action::SwitchContext, target.as_str())
        {
            tracing::warn!(
                target: "audit",
                session = %session.id,
                subject = %session.subject,
                tenant = %target,
                %reason,
                "context switch denied"
            );
            return Err(Error::Forbidden { reason });
        }

        session.current = target;
        tracing::info!(
            target: "audit",
            session = %session.id,
            subject = %session.subject,
            tenant = %session.current,
            "context switched"
        );
        Ok(session.clone())
    }

    /// Produce a signed client for one operation. `tenant` of None uses the
    /// session's current context.
    pub async fn client(
        &self,
        session_id: &str,
        tenant: Option<TenantId>,
        purpose: &str,
    ) -> Result<edgegrid::Client, Error> {
        let session = self.sessions.snapshot(session_id).await?;
        let tenant = tenant.unwrap_or_else(|| session.current.clone());

        if !session.available.contains(&tenant) {
            return Err(Error::TenantNotAvailable(tenant));
        }
        if let Decision::Deny { reason } =
            self.authorizer
                .allow(&session.subject, Action::UseCredentials, tenant.as_str())
        {
            tracing::warn!(
                target: "audit",
                session = %session.id,
                subject = %session.subject,
                tenant = %tenant,
                purpose,
                %reason,
                "credential use denied"
            );
            return Err(Error::Forbidden { reason });
        }

        self.client_for(&tenant)
    }

    /// A signed client outside any session, for background workers whose
    /// authorization was settled at admission time.
    pub fn client_for(&self, tenant: &TenantId) -> Result<edgegrid::Client, Error> {
        let slot = self
            .slots
            .read()
            .unwrap()
            .get(tenant)
            .cloned()
            .ok_or_else(|| Error::UnknownTenant(tenant.clone()))?;
        let credentials = slot.read().unwrap().credentials.clone();

        Ok(edgegrid::Client::new(self.transport.clone(), credentials)
            .with_concurrency(self.semaphore(tenant)))
    }

    /// Atomically replace `tenant`'s bundle, then notify rotation hooks so
    /// credential-sensitive caches flush.
    #[tracing::instrument(skip(self, bundle), err)]
    pub fn rotate(&self, subject: &str, tenant: &TenantId, bundle: Bundle) -> Result<(), Error> {
        if let Decision::Deny { reason } =
            self.authorizer
                .allow(subject, Action::RotateCredentials, tenant.as_str())
        {
            return Err(Error::Forbidden { reason });
        }

        let slot = self
            .slots
            .read()
            .unwrap()
            .get(tenant)
            .cloned()
            .ok_or_else(|| Error::UnknownTenant(tenant.clone()))?;
        *slot.write().unwrap() = bundle;

        tracing::info!(target: "audit", subject, tenant = %tenant, "credentials rotated");

        for hook in self.rotation_hooks.lock().unwrap().iter() {
            hook(tenant);
        }
        Ok(())
    }

    fn semaphore(&self, tenant: &TenantId) -> Arc<tokio::sync::Semaphore> {
        self.semaphores
            .lock()
            .unwrap()
            .entry(tenant.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Semaphore::new(PER_TENANT_IN_FLIGHT)))
            .clone()
    }
}
