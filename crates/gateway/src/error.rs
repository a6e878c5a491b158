use std::time::Duration;

/// GatewayError is the dispatcher-level error taxonomy. Every component
/// failure maps onto exactly one kind, which carries a stable short code
/// and a human sentence. Credential material never reaches these
/// messages; component Display impls are already redacting.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("{0}")]
    Upstream(String),
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Timeout(String),
    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    /// The stable short code shown to remote clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not-found",
            Self::Conflict(_) => "conflict",
            Self::RateLimited { .. } => "rate-limited",
            Self::Upstream(_) => "upstream",
            Self::Transient(_) => "transient",
            Self::Timeout(_) => "timeout",
            Self::Internal(_) => "internal",
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

impl From<tenancy::Error> for GatewayError {
    fn from(err: tenancy::Error) -> Self {
        use tenancy::Error::*;
        match &err {
            UnknownTenant(_) | TenantNotAvailable(_) => Self::NotFound(err.to_string()),
            UnknownSession | SessionExpired | AuthenticationFailed(_) => {
                Self::Unauthorized(err.to_string())
            }
            Forbidden { .. } => Self::Forbidden(err.to_string()),
            Load(_) | Decrypt { .. } => Self::Internal(err.to_string()),
        }
    }
}

impl From<fastpurge::Error> for GatewayError {
    fn from(err: fastpurge::Error) -> Self {
        use fastpurge::Error::*;
        match &err {
            EmptyPurge => Self::Validation(err.to_string()),
            Duplicate { .. } => Self::Conflict(err.to_string()),
            Capacity { .. } => Self::RateLimited {
                message: err.to_string(),
                retry_after: Some(Duration::from_secs(10)),
            },
            UnknownOperation(_) => Self::NotFound(err.to_string()),
            Persist(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<cert_deploy::Error> for GatewayError {
    fn from(err: cert_deploy::Error) -> Self {
        use cert_deploy::Error::*;
        match &err {
            AlreadyInFlight(_) => Self::Conflict(err.to_string()),
            NotReady { .. } => Self::Conflict(err.to_string()),
            Upstream(source) => Self::Upstream(format!("{err}: {source:#}")),
        }
    }
}

impl From<cache::Error> for GatewayError {
    fn from(err: cache::Error) -> Self {
        use cache::Error::*;
        match &err {
            UnprefixedKey(_) => Self::Internal(err.to_string()),
            Fetch(_) => Self::Upstream(err.to_string()),
            Corrupt(_) | Persist(_) => Self::Internal(err.to_string()),
        }
    }
}

impl From<edgegrid::Error> for GatewayError {
    fn from(err: edgegrid::Error) -> Self {
        use edgegrid::Error::*;
        match &err {
            BadRequest(_) | InvalidRequest(_) => Self::Validation(err.to_string()),
            Unauthorized(_) => Self::Unauthorized(err.to_string()),
            Forbidden(_) => Self::Forbidden(err.to_string()),
            NotFound(_) => Self::NotFound(err.to_string()),
            Conflict(_) => Self::Conflict(err.to_string()),
            RateLimited { retry_after, .. } => Self::RateLimited {
                message: err.to_string(),
                retry_after: Some(*retry_after),
            },
            Server { .. } | Transport(_) | CircuitOpen { .. } => Self::Transient(err.to_string()),
            Timeout => Self::Timeout(err.to_string()),
            Decode(_) => Self::Upstream(err.to_string()),
        }
    }
}
