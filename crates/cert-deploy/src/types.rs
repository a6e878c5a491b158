use chrono::{DateTime, Utc};
use models::Network;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Enrollments are addressed by integer id.
pub type EnrollmentId = u64;

/// DeployStatus is the coordinator's state machine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeployStatus {
    /// Accepted but not yet submitted.
    Pending,
    /// The deployment POST succeeded and an id was assigned.
    Initiated,
    InProgress,
    Deployed,
    Failed,
    RolledBack,
}

impl DeployStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Deployed | Self::Failed | Self::RolledBack)
    }
}

/// LinkStatus tracks one property's certificate reference update.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkStatus {
    Pending,
    Linking,
    Linked,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct PropertyLink {
    pub status: LinkStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// DeploymentState is the queryable record of one deployment run.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentState {
    pub enrollment_id: EnrollmentId,
    pub network: Network,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<u64>,
    pub status: DeployStatus,
    /// 0-100.
    pub progress: u8,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub property_links: BTreeMap<String, PropertyLink>,
    pub errors: Vec<String>,
}

// Error logs keep at most this many entries, trimmed back to half.
const ERROR_LOG_CAP: usize = 50;
const ERROR_LOG_TRIMMED: usize = 25;

impl DeploymentState {
    pub fn new(enrollment_id: EnrollmentId, network: Network) -> Self {
        Self {
            enrollment_id,
            network,
            deployment_id: None,
            status: DeployStatus::Pending,
            progress: 0,
            started_at: Utc::now(),
            ended_at: None,
            property_links: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn push_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
        if self.errors.len() > ERROR_LOG_CAP {
            let excess = self.errors.len() - ERROR_LOG_TRIMMED;
            self.errors.drain(..excess);
        }
    }
}

/// DeployEvent is the ordered per-enrollment event stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum DeployEvent {
    DeploymentStarted {
        enrollment_id: EnrollmentId,
        network: Network,
    },
    DeploymentProgress {
        enrollment_id: EnrollmentId,
        progress: u8,
    },
    DeploymentCompleted {
        enrollment_id: EnrollmentId,
        deployment_id: u64,
    },
    DeploymentFailed {
        enrollment_id: EnrollmentId,
        reason: String,
    },
    PropertyLinking {
        enrollment_id: EnrollmentId,
        property_id: String,
    },
    PropertyLinked {
        enrollment_id: EnrollmentId,
        property_id: String,
        version: u64,
    },
    PropertyLinkFailed {
        enrollment_id: EnrollmentId,
        property_id: String,
        reason: String,
    },
    RollbackStarted {
        enrollment_id: EnrollmentId,
    },
    RollbackCompleted {
        enrollment_id: EnrollmentId,
    },
}
