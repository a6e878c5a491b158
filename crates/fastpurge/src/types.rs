use chrono::{DateTime, Utc};
use models::{Id, Network, TenantId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// PurgeKind selects what the objects of an operation identify.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurgeKind {
    Url,
    Cpcode,
    Tag,
}

impl PurgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Url => "url",
            Self::Cpcode => "cpcode",
            Self::Tag => "tag",
        }
    }
}

impl std::fmt::Display for PurgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PurgeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "url" => Ok(Self::Url),
            "cpcode" => Ok(Self::Cpcode),
            "tag" => Ok(Self::Tag),
            other => Err(format!("unknown purge kind {other:?}")),
        }
    }
}

/// OperationStatus is the queue-and-tracker lifecycle of one operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationStatus {
    /// Admitted, waiting to be drained.
    Pending,
    /// Batches are being submitted.
    Processing,
    /// Every batch is submitted; completion is being polled.
    InProgress,
    /// All batches reached Done.
    Completed,
    /// Some batches completed, others failed.
    Partial,
    /// No batch completed.
    Failed,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Partial | Self::Failed)
    }
}

/// BatchStatus tracks one submitted batch's asynchronous completion.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BatchStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// BatchState is one submitted batch of an operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchState {
    pub purge_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub support_id: Option<String>,
    pub objects: Vec<String>,
    pub status: BatchStatus,
    pub estimated_seconds: u32,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// PurgeOperation is the persistent record of one admitted purge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeOperation {
    pub id: Id,
    pub tenant: TenantId,
    pub kind: PurgeKind,
    pub network: Network,
    pub objects: Vec<String>,
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    pub status: OperationStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub dedup_key: String,
    pub estimated_bytes: usize,
    #[serde(default)]
    pub batches: Vec<BatchState>,
    /// Most recent errors, retained for dashboards after the operation is
    /// terminal.
    #[serde(default)]
    pub errors: Vec<String>,
}

// Error logs keep at most this many entries, trimmed back to half.
const ERROR_LOG_CAP: usize = 50;
const ERROR_LOG_TRIMMED: usize = 25;

impl PurgeOperation {
    /// Objects not yet covered by a submitted batch. Batches are filled
    /// in object order, so the remainder is a suffix.
    pub fn unsent_objects(&self) -> &[String] {
        let sent: usize = self.batches.iter().map(|b| b.objects.len()).sum();
        &self.objects[sent.min(self.objects.len())..]
    }

    /// Record an error, keeping the log bounded.
    pub fn push_error(&mut self, error: impl Into<String>) {
        let error = error.into();
        self.last_error = Some(error.clone());
        self.errors.push(error);
        if self.errors.len() > ERROR_LOG_CAP {
            let excess = self.errors.len() - ERROR_LOG_TRIMMED;
            self.errors.drain(..excess);
        }
    }
}

/// The dedup key: a hash over the kind and the sorted object list, so the
/// same logical purge admits once per window regardless of object order.
pub fn dedup_key(kind: PurgeKind, objects: &[String]) -> String {
    let mut sorted: Vec<&str> = objects.iter().map(String::as_str).collect();
    sorted.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(sorted.join(",").as_bytes());
    hex::encode(hasher.finalize())
}

/// Queue priority: tags drain first, then cpcodes, then URLs, with bulk
/// URL purges last.
pub fn priority(kind: PurgeKind, object_count: usize) -> u8 {
    match kind {
        PurgeKind::Tag => 0,
        PurgeKind::Cpcode => 1,
        PurgeKind::Url if object_count < 100 => 2,
        PurgeKind::Url => 3,
    }
}

/// Estimated serialized size of the object array, used for batch packing
/// and queue accounting.
pub fn estimated_bytes(objects: &[String]) -> usize {
    // Two brackets plus `"<object>",` per element.
    2 + objects.iter().map(|o| o.len() + 3).sum::<usize>()
}
