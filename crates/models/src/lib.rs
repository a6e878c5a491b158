mod id;
mod problem;
mod tenant;

pub use id::{Id, IdGenerator};
pub use problem::ProblemDetails;
pub use tenant::{Environment, Network, TenantId, TENANT_ID_RE};
