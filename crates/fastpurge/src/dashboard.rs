use crate::types::{BatchStatus, OperationStatus};
use crate::PurgeService;
use chrono::{Duration as ChronoDuration, Utc};
use models::TenantId;

/// TenantDashboard aggregates one tenant's purge activity for display.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TenantDashboard {
    pub tenant: TenantId,
    /// Operations currently queued or being sent.
    pub queued: usize,
    /// Operations being polled toward completion.
    pub active: usize,
    pub completed_today: usize,
    pub failed_today: usize,
    pub success_rate: f64,
    pub failure_rate: f64,
    pub average_completion_seconds: f64,
    pub objects_purged_today: u64,
    /// Sliding-window utilization, in [0, 1].
    pub rate_limit_utilization: f64,
    pub recent_errors: Vec<String>,
}

impl PurgeService {
    /// Derive the tenant's dashboard from queue depth, tracked operations,
    /// and rate-limiter state.
    pub fn dashboard(&self, tenant: &TenantId) -> TenantDashboard {
        let day_ago = Utc::now() - ChronoDuration::hours(24);
        let operations = self.tracker().operations_for(tenant);

        let mut active = 0;
        let mut completed_today = 0;
        let mut failed_today = 0;
        let mut objects_purged_today: u64 = 0;
        let mut completion_seconds: Vec<f64> = Vec::new();
        let mut recent_errors: Vec<String> = Vec::new();

        for op in &operations {
            if !op.status.is_terminal() {
                active += 1;
                continue;
            }
            if op.created_at < day_ago {
                continue;
            }

            match op.status {
                OperationStatus::Completed | OperationStatus::Partial => completed_today += 1,
                OperationStatus::Failed => failed_today += 1,
                _ => (),
            }
            objects_purged_today += op
                .batches
                .iter()
                .filter(|b| b.status == BatchStatus::Completed)
                .map(|b| b.objects.len() as u64)
                .sum::<u64>();

            if let Some(finished) = op.batches.iter().filter_map(|b| b.completed_at).max() {
                completion_seconds.push((finished - op.created_at).num_seconds().max(0) as f64);
            }
            recent_errors.extend(op.errors.iter().rev().take(5).cloned());
        }

        let terminal_today = completed_today + failed_today;
        let (success_rate, failure_rate) = if terminal_today == 0 {
            (1.0, 0.0)
        } else {
            (
                completed_today as f64 / terminal_today as f64,
                failed_today as f64 / terminal_today as f64,
            )
        };
        recent_errors.truncate(10);

        TenantDashboard {
            tenant: tenant.clone(),
            queued: self.queue().depth(tenant),
            active,
            completed_today,
            failed_today,
            success_rate,
            failure_rate,
            average_completion_seconds: if completion_seconds.is_empty() {
                0.0
            } else {
                completion_seconds.iter().sum::<f64>() / completion_seconds.len() as f64
            },
            objects_purged_today,
            rate_limit_utilization: self.rate_limit_utilization(tenant),
            recent_errors,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::{BackendError, PurgeBackend, PurgePoll, PurgeReceipt};
    use crate::types::PurgeKind;
    use crate::ServiceConfig;
    use models::Network;
    use std::sync::Arc;

    struct DoneBackend;

    #[async_trait::async_trait]
    impl PurgeBackend for DoneBackend {
        async fn submit(
            &self,
            _tenant: &TenantId,
            _kind: PurgeKind,
            _network: Network,
            _objects: &[String],
        ) -> Result<PurgeReceipt, BackendError> {
            Ok(PurgeReceipt {
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
        ) -> Result<PurgePoll, BackendError> {
            Ok(PurgePoll {
                purge_id: purge_id.to_string(),
                status: "Done".to_string(),
                completion_time: Some(Utc::now()),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dashboard_reflects_completions() {
        let service = PurgeService::new(Arc::new(DoneBackend), ServiceConfig::default());
        let tenant = TenantId::new("t1").unwrap();

        let op_id = service
            .queue()
            .enqueue(
                &tenant,
                PurgeKind::Url,
                Network::Production,
                vec!["https://a/1".into(), "https://a/2".into()],
            )
            .unwrap();
        service.drain_once().await;

        loop {
            let report = service.tracker().progress(op_id).unwrap();
            if report.status.is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }

        let dashboard = service.dashboard(&tenant);
        assert_eq!(dashboard.queued, 0);
        assert_eq!(dashboard.active, 0);
        assert_eq!(dashboard.completed_today, 1);
        assert_eq!(dashboard.failed_today, 0);
        assert_eq!(dashboard.objects_purged_today, 2);
        assert_eq!(dashboard.success_rate, 1.0);
        assert!(dashboard.recent_errors.is_empty());
    }

    #[tokio::test]
    async fn empty_tenant_has_a_quiet_dashboard() {
        let service = PurgeService::new(Arc::new(DoneBackend), ServiceConfig::default());
        let dashboard = service.dashboard(&TenantId::new("nobody").unwrap());
        assert_eq!(dashboard.queued, 0);
        assert_eq!(dashboard.active, 0);
        assert_eq!(dashboard.success_rate, 1.0);
        assert_eq!(dashboard.average_completion_seconds, 0.0);
    }
}
