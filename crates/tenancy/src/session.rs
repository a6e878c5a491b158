use crate::Error;
use chrono::{DateTime, Utc};
use models::TenantId;
use std::collections::HashMap;
use std::sync::Arc;

/// Identity is what the injected provider asserts about a bearer token.
#[derive(Debug, Clone)]
pub struct Identity {
    pub subject: String,
    pub tenants: Vec<TenantId>,
    pub expires_at: DateTime<Utc>,
}

/// IdentityProvider validates opaque bearer tokens. The gateway never mints
/// tokens itself; deployments inject their provider of choice.
#[async_trait::async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn authenticate(&self, bearer: &str) -> Result<Identity, anyhow::Error>;
}

/// StaticIdentityProvider maps fixed bearer strings to identities.
/// Used by tests and local development stacks.
#[derive(Default)]
pub struct StaticIdentityProvider {
    identities: HashMap<String, Identity>,
}

impl StaticIdentityProvider {
    pub fn with(mut self, bearer: impl Into<String>, identity: Identity) -> Self {
        self.identities.insert(bearer.into(), identity);
        self
    }
}

#[async_trait::async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn authenticate(&self, bearer: &str) -> Result<Identity, anyhow::Error> {
        self.identities
            .get(bearer)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown bearer token"))
    }
}

/// Session is one authenticated remote connection and its tenant reach.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub subject: String,
    pub available: Vec<TenantId>,
    pub current: TenantId,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now()
    }
}

// Sessions are wrapped in an async Mutex so that concurrent context
// switches of one session serialize.
type SharedSession = Arc<tokio::sync::Mutex<Session>>;

/// SessionManager owns the session table: creation on authenticate,
/// destruction on revoke, and expiry sweeps.
pub struct SessionManager {
    provider: Arc<dyn IdentityProvider>,
    sessions: std::sync::Mutex<HashMap<String, SharedSession>>,
}

impl SessionManager {
    pub fn new(provider: Arc<dyn IdentityProvider>) -> Self {
        Self {
            provider,
            sessions: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Validate `bearer` and create a session. The first available tenant
    /// becomes the current context.
    pub async fn authenticate(&self, bearer: &str) -> Result<Session, Error> {
        let identity = self
            .provider
            .authenticate(bearer)
            .await
            .map_err(Error::AuthenticationFailed)?;

        if identity.expires_at < Utc::now() {
            return Err(Error::SessionExpired);
        }
        let Some(current) = identity.tenants.first().cloned() else {
            return Err(Error::Forbidden {
                reason: "identity has no tenant grants".to_string(),
            });
        };

        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            subject: identity.subject,
            available: identity.tenants,
            current,
            expires_at: identity.expires_at,
        };

        tracing::info!(
            target: "audit",
            session = %session.id,
            subject = %session.subject,
            tenants = session.available.len(),
            "session authenticated"
        );

        self.sessions.lock().unwrap().insert(
            session.id.clone(),
            Arc::new(tokio::sync::Mutex::new(session.clone())),
        );
        Ok(session)
    }

    /// Look up a live session, surfacing expiry as unauthorized.
    pub(crate) fn get(&self, session_id: &str) -> Result<SharedSession, Error> {
        let shared = self
            .sessions
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .ok_or(Error::UnknownSession)?;

        // Expiry is checked against the snapshot; the async lock is only
        // taken by mutating paths.
        if shared.try_lock().map(|s| s.is_expired()).unwrap_or(false) {
            self.revoke(session_id);
            return Err(Error::SessionExpired);
        }
        Ok(shared)
    }

    /// A point-in-time copy of the session, for read paths.
    pub async fn snapshot(&self, session_id: &str) -> Result<Session, Error> {
        let shared = self.get(session_id)?;
        let session = shared.lock().await;
        if session.is_expired() {
            return Err(Error::SessionExpired);
        }
        Ok(session.clone())
    }

    pub fn revoke(&self, session_id: &str) {
        if self.sessions.lock().unwrap().remove(session_id).is_some() {
            tracing::info!(target: "audit", session = %session_id, "session revoked");
        }
    }

    /// Drop every expired session. Invoked periodically by the server.
    pub fn sweep(&self) -> usize {
        let mut sessions = self.sessions.lock().unwrap();
        let before = sessions.len();
        sessions.retain(|_, shared| {
            shared
                .try_lock()
                .map(|session| !session.is_expired())
                // A session locked mid-operation survives the sweep.
                .unwrap_or(true)
        });
        before - sessions.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Duration;

    fn tenant(s: &str) -> TenantId {
        TenantId::new(s).unwrap()
    }

    fn provider() -> Arc<StaticIdentityProvider> {
        Arc::new(StaticIdentityProvider::default().with(
            "token-1",
            Identity {
                subject: "alice".to_string(),
                tenants: vec![tenant("t1"), tenant("t2")],
                expires_at: Utc::now() + Duration::hours(1),
            },
        ))
    }

    #[tokio::test]
    async fn authenticate_creates_a_session() {
        let manager = SessionManager::new(provider());

        let session = manager.authenticate("token-1").await.unwrap();
        assert_eq!(session.subject, "alice");
        assert_eq!(session.current, tenant("t1"));
        assert_eq!(session.available.len(), 2);

        let snapshot = manager.snapshot(&session.id).await.unwrap();
        assert_eq!(snapshot.id, session.id);
    }

    #[tokio::test]
    async fn unknown_bearer_is_rejected() {
        let manager = SessionManager::new(provider());
        let err = manager.authenticate("nope").await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed(_)));
    }

    #[tokio::test]
    async fn revoked_sessions_are_gone() {
        let manager = SessionManager::new(provider());
        let session = manager.authenticate("token-1").await.unwrap();

        manager.revoke(&session.id);
        assert!(matches!(
            manager.snapshot(&session.id).await.unwrap_err(),
            Error::UnknownSession
        ));
    }

    #[tokio::test]
    async fn expired_sessions_are_swept() {
        let provider = Arc::new(StaticIdentityProvider::default().with(
            "stale",
            Identity {
                subject: "bob".to_string(),
                tenants: vec![tenant("t1")],
                expires_at: Utc::now() + Duration::milliseconds(50),
            },
        ));
        let manager = SessionManager::new(provider);
        let session = manager.authenticate("stale").await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        assert_eq!(manager.sweep(), 1);
        assert!(matches!(
            manager.snapshot(&session.id).await.unwrap_err(),
            Error::UnknownSession
        ));
    }
}
