use crate::api::PurgeBackend;
use crate::types::{BatchStatus, OperationStatus, PurgeOperation};
use crate::Error;
use anyhow::Context;
use chrono::Utc;
use models::{Id, TenantId};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// Polling cadence: tight for the first ten seconds, then relaxed.
const EARLY_POLL_INTERVAL: Duration = Duration::from_secs(1);
const EARLY_POLL_PHASE: Duration = Duration::from_secs(10);
const LATE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Terminal operations older than this are dropped from memory and disk.
pub const RETENTION: Duration = Duration::from_secs(24 * 3600);

/// ProgressReport is a caller-facing view of one operation's progress.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProgressReport {
    pub op_id: Id,
    pub tenant: TenantId,
    pub status: OperationStatus,
    /// 0-100, monotonically non-decreasing until terminal.
    pub progress: u8,
    pub total_batches: usize,
    pub completed_batches: usize,
    pub failed_batches: usize,
    pub processed_objects: usize,
    pub total_objects: usize,
    pub remaining_seconds: u64,
    pub errors: Vec<String>,
}

/// Callbacks are resolved by operation id, never by reference into the
/// tracked state, and are invoked outside the tracker locks.
pub type ProgressCallback = Arc<dyn Fn(ProgressReport) + Send + Sync>;

/// StatusTracker polls every submitted batch's purge id to completion and
/// materializes per-operation progress.
pub struct StatusTracker {
    backend: Arc<dyn PurgeBackend>,
    persist_dir: Option<PathBuf>,
    ops: Mutex<HashMap<Id, PurgeOperation>>,
    callbacks: Mutex<HashMap<Id, Vec<ProgressCallback>>>,
    shutdown: CancellationToken,
}

impl StatusTracker {
    pub fn new(backend: Arc<dyn PurgeBackend>, persist_dir: Option<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            persist_dir,
            ops: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Take ownership of a fully submitted operation and poll its batches
    /// to completion.
    pub fn track(self: &Arc<Self>, op: PurgeOperation) {
        let op_id = op.id;
        self.persist(&op);

        let batches: Vec<(usize, String, u32)> = op
            .batches
            .iter()
            .enumerate()
            .filter(|(_, batch)| !batch.status.is_terminal())
            .map(|(index, batch)| (index, batch.purge_id.clone(), batch.estimated_seconds))
            .collect();
        let tenant = op.tenant.clone();

        self.ops.lock().unwrap().insert(op_id, op);

        for (index, purge_id, estimated_seconds) in batches {
            let tracker = self.clone();
            let tenant = tenant.clone();
            tokio::spawn(async move {
                tracker
                    .poll_batch(op_id, index, tenant, purge_id, estimated_seconds)
                    .await;
            });
        }
    }

    /// Register a progress callback for an operation.
    pub fn subscribe(&self, op_id: Id, callback: ProgressCallback) {
        self.callbacks
            .lock()
            .unwrap()
            .entry(op_id)
            .or_default()
            .push(callback);
    }

    /// The current progress of a tracked operation.
    pub fn progress(&self, op_id: Id) -> Result<ProgressReport, Error> {
        let ops = self.ops.lock().unwrap();
        let op = ops.get(&op_id).ok_or(Error::UnknownOperation(op_id))?;
        Ok(report_for(op))
    }

    /// All operations of one tenant, for dashboards.
    pub fn operations_for(&self, tenant: &TenantId) -> Vec<PurgeOperation> {
        self.ops
            .lock()
            .unwrap()
            .values()
            .filter(|op| &op.tenant == tenant)
            .cloned()
            .collect()
    }

    /// Stop all polling. In-flight batches are left as-is; a restart
    /// resumes them from persisted state.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Drop terminal operations older than the retention window, from
    /// memory and disk. Returns how many were dropped.
    pub fn sweep_retention(&self) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(RETENTION).expect("retention fits");
        let swept: Vec<PurgeOperation> = {
            let mut ops = self.ops.lock().unwrap();
            let victims: Vec<Id> = ops
                .values()
                .filter(|op| op.status.is_terminal() && op.created_at < cutoff)
                .map(|op| op.id)
                .collect();
            victims.iter().filter_map(|id| ops.remove(id)).collect()
        };

        for op in &swept {
            self.callbacks.lock().unwrap().remove(&op.id);
            if let Some(dir) = &self.persist_dir {
                let path = dir.join(format!("{}.json", op.id));
                if let Err(err) = std::fs::remove_file(&path) {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(path = %path.display(), error = %err, "failed to remove retained status file");
                    }
                }
            }
        }
        if !swept.is_empty() {
            tracing::info!(count = swept.len(), "swept retained purge operations");
        }
        swept.len()
    }

    /// Reload persisted operations after a restart and resume polling any
    /// batch that wasn't terminal.
    pub fn resume_from_disk(self: &Arc<Self>) -> Result<usize, Error> {
        let Some(dir) = self.persist_dir.clone() else {
            return Ok(0);
        };
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => {
                return Err(Error::Persist(
                    anyhow::Error::new(err).context("reading status directory"),
                ))
            }
        };

        let mut resumed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let op: PurgeOperation = match std::fs::read(&path)
                .map_err(anyhow::Error::new)
                .and_then(|raw| serde_json::from_slice(&raw).map_err(anyhow::Error::new))
            {
                Ok(op) => op,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "skipping unreadable status file");
                    continue;
                }
            };

            if op.status.is_terminal() {
                // Keep it for dashboards; retention will reap it.
                self.ops.lock().unwrap().insert(op.id, op);
            } else {
                self.track(op);
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    async fn poll_batch(
        self: Arc<Self>,
        op_id: Id,
        index: usize,
        tenant: TenantId,
        purge_id: String,
        estimated_seconds: u32,
    ) {
        let budget = Duration::from_secs(u64::from(estimated_seconds) * 2 + 30)
            .max(Duration::from_secs(60));
        let started = tokio::time::Instant::now();

        loop {
            eprintln!("DEBUG poll_batch loop op={op_id} index={index} elapsed={:?}", started.elapsed());
            if started.elapsed() >= budget {
                self.finish_batch(
                    op_id,
                    index,
                    BatchStatus::Failed,
                    Some(format!("purge {purge_id} exceeded its status poll budget")),
                );
                return;
            }

            let interval = if started.elapsed() < EARLY_POLL_PHASE {
                EARLY_POLL_INTERVAL
            } else {
                LATE_POLL_INTERVAL
            };
            tokio::select! {
                () = self.shutdown.cancelled() => return,
                () = tokio::time::sleep(interval) => {}
            }

            match self.backend.poll(&tenant, &purge_id).await {
                Ok(poll) => match poll.status.as_str() {
                    "Done" => {
                        self.finish_batch(op_id, index, BatchStatus::Completed, None);
                        return;
                    }
                    "Failed" => {
                        self.finish_batch(
                            op_id,
                            index,
                            BatchStatus::Failed,
                            Some(format!("purge {purge_id} reported failure")),
                        );
                        return;
                    }
                    // In-Progress and Unknown both mean keep polling.
                    _ => self.note_batch_progress(op_id, index),
                },
                Err(err) => {
                    tracing::debug!(op = %op_id, purge_id, error = %err, "status poll failed; will retry");
                }
            }
        }
    }

    fn note_batch_progress(&self, op_id: Id, index: usize) {
        let mut ops = self.ops.lock().unwrap();
        if let Some(op) = ops.get_mut(&op_id) {
            if let Some(batch) = op.batches.get_mut(index) {
                if batch.status == BatchStatus::Pending {
                    batch.status = BatchStatus::InProgress;
                }
            }
        }
    }

    /// Apply one batch's terminal state, roll the operation up, persist,
    /// and fire callbacks (outside the lock).
    fn finish_batch(&self, op_id: Id, index: usize, status: BatchStatus, error: Option<String>) {
        let (report, persisted) = {
            let mut ops = self.ops.lock().unwrap();
            let Some(op) = ops.get_mut(&op_id) else {
                return;
            };

            if let Some(batch) = op.batches.get_mut(index) {
                batch.status = status;
                batch.completed_at = Some(Utc::now());
                batch.error = error.clone();
            }
            if let Some(error) = error {
                op.push_error(error);
            }

            let total = op.batches.len();
            let completed = batch_count(op, BatchStatus::Completed);
            let failed = batch_count(op, BatchStatus::Failed);
            if completed + failed == total {
                op.status = if failed == 0 {
                    OperationStatus::Completed
                } else if completed == 0 {
                    OperationStatus::Failed
                } else {
                    OperationStatus::Partial
                };
            }

            (report_for(op), op.clone())
        };

        self.persist(&persisted);

        let listeners: Vec<ProgressCallback> = self
            .callbacks
            .lock()
            .unwrap()
            .get(&op_id)
            .map(|listeners| listeners.to_vec())
            .unwrap_or_default();
        for listener in listeners {
            listener(report.clone());
        }

        if report.status.is_terminal() {
            tracing::info!(
                op = %op_id,
                status = ?report.status,
                completed = report.completed_batches,
                failed = report.failed_batches,
                "purge operation reached a terminal state"
            );
        }
    }

    fn persist(&self, op: &PurgeOperation) {
        let Some(dir) = &self.persist_dir else { return };
        if let Err(err) = write_atomically(dir, &format!("{}.json", op.id), op) {
            tracing::warn!(op = %op.id, error = %err, "failed to persist purge status");
        }
    }
}

fn batch_count(op: &PurgeOperation, status: BatchStatus) -> usize {
    op.batches.iter().filter(|b| b.status == status).count()
}

fn report_for(op: &PurgeOperation) -> ProgressReport {
    let total = op.batches.len();
    let completed = batch_count(op, BatchStatus::Completed);
    let failed = batch_count(op, BatchStatus::Failed);

    let progress = if total == 0 {
        0
    } else {
        ((100 * completed + total / 2) / total) as u8
    };
    let processed_objects = op
        .batches
        .iter()
        .filter(|b| b.status == BatchStatus::Completed)
        .map(|b| b.objects.len())
        .sum();

    // The initial estimate is the slowest batch; they complete in parallel.
    let initial_estimate = op
        .batches
        .iter()
        .map(|b| u64::from(b.estimated_seconds))
        .max()
        .unwrap_or(0);
    let elapsed = op
        .batches
        .iter()
        .map(|b| b.submitted_at)
        .min()
        .map(|earliest| (Utc::now() - earliest).num_seconds().max(0) as u64)
        .unwrap_or(0);

    ProgressReport {
        op_id: op.id,
        tenant: op.tenant.clone(),
        status: op.status,
        progress,
        total_batches: total,
        completed_batches: completed,
        failed_batches: failed,
        processed_objects,
        total_objects: op.objects.len(),
        remaining_seconds: initial_estimate.saturating_sub(elapsed),
        errors: op.errors.clone(),
    }
}

/// Write-temp-then-rename within the target directory.
pub(crate) fn write_atomically<T: serde::Serialize>(
    dir: &std::path::Path,
    file_name: &str,
    value: &T,
) -> Result<(), anyhow::Error> {
    std::fs::create_dir_all(dir).context("creating persistence directory")?;
    let json = serde_json::to_vec_pretty(value).context("serializing")?;

    let mut temp = tempfile::NamedTempFile::new_in(dir).context("creating temp file")?;
    std::io::Write::write_all(&mut temp, &json).context("writing temp file")?;
    temp.persist(dir.join(file_name)).context("renaming into place")?;
    Ok(())
}
