//! The certificate deployment coordinator: an event-emitting state machine
//! which drives an enrollment through network deployment and optional
//! property linking, with per-enrollment ordering and optional rollback.

mod api;
mod coordinator;
mod events;
mod types;

pub use api::{
    CertBackend, ClientProvider, EdgeCertBackend, Enrollment, EnrollmentDomain, PropertyHostname,
};
pub use coordinator::{CoordinatorConfig, DeployCoordinator, DeployOptions};
pub use events::{EventHub, EventStream};
pub use types::{
    DeployEvent, DeployStatus, DeploymentState, EnrollmentId, LinkStatus, PropertyLink,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("a deployment is already in flight for enrollment {0}")]
    AlreadyInFlight(EnrollmentId),
    #[error("enrollment {enrollment_id} is not deployable: {reason}")]
    NotReady {
        enrollment_id: EnrollmentId,
        reason: String,
    },
    #[error("certificate back-end call failed")]
    Upstream(#[source] anyhow::Error),
}
