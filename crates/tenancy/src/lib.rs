//! The tenant context layer: credential bundles and their stores, remote
//! sessions, the authorization seam, and the context manager which binds an
//! authenticated session to signed HTTP clients.

mod authz;
mod context;
mod session;
mod store;

pub use authz::{Action, AllowAll, Authorizer, Decision};
pub use context::{ContextManager, RotationHook};
pub use session::{Identity, IdentityProvider, Session, SessionManager, StaticIdentityProvider};
pub use store::{Bundle, CredentialStore, IniStore, MasterKey, SecureStore};

use models::TenantId;

/// Error is the failure surface of the tenancy layer. The dispatcher maps
/// each variant onto its error taxonomy: unknown entities are not-found,
/// session problems are unauthorized, denials are forbidden, and store
/// corruption is internal.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown tenant {0}")]
    UnknownTenant(TenantId),
    #[error("tenant {0} is not available to this session")]
    TenantNotAvailable(TenantId),
    #[error("unknown or revoked session")]
    UnknownSession,
    #[error("session is expired")]
    SessionExpired,
    #[error("authentication failed")]
    AuthenticationFailed(#[source] anyhow::Error),
    #[error("authorization denied: {reason}")]
    Forbidden { reason: String },
    #[error("failed to load credential store")]
    Load(#[source] anyhow::Error),
    #[error("credential bundle for {tenant} failed to decrypt")]
    Decrypt { tenant: TenantId },
}
