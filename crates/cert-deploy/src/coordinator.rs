use crate::api::CertBackend;
use crate::events::{EventHub, EventStream};
use crate::types::{
    DeployEvent, DeployStatus, DeploymentState, EnrollmentId, LinkStatus, PropertyLink,
};
use crate::Error;
use chrono::Utc;
use models::{Network, TenantId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// DeployOptions parameterizes one deployment run.
#[derive(Debug, Clone)]
pub struct DeployOptions {
    pub network: Network,
    /// Properties to link to the enrollment once deployed.
    pub auto_link: Vec<String>,
    /// Link properties concurrently instead of one at a time.
    pub parallel_linking: bool,
    /// Cancel the deployment if it fails (or if every property link
    /// fails). Already-written property links are not reverted.
    pub rollback_on_failure: bool,
}

impl DeployOptions {
    pub fn network(network: Network) -> Self {
        Self {
            network,
            auto_link: Vec::new(),
            parallel_linking: false,
            rollback_on_failure: false,
        }
    }
}

/// CoordinatorConfig carries the polling knobs; tests shrink them.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub poll_interval: Duration,
    pub poll_budget: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            poll_budget: Duration::from_secs(30 * 60),
        }
    }
}

/// DeployCoordinator drives certificate enrollments through network
/// deployment and optional property linking, one active run per
/// enrollment, with ordered events per enrollment.
pub struct DeployCoordinator {
    backend: Arc<dyn CertBackend>,
    events: EventHub,
    config: CoordinatorConfig,
    states: Mutex<HashMap<EnrollmentId, DeploymentState>>,
    in_flight: Mutex<HashSet<EnrollmentId>>,
    shutdown: CancellationToken,
}

impl DeployCoordinator {
    pub fn new(backend: Arc<dyn CertBackend>, config: CoordinatorConfig) -> Arc<Self> {
        Arc::new(Self {
            backend,
            events: EventHub::new(),
            config,
            states: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Subscribe to an enrollment's event stream.
    pub fn subscribe(&self, enrollment_id: EnrollmentId) -> EventStream {
        self.events.subscribe(enrollment_id)
    }

    /// The queryable state of an enrollment's most recent run.
    pub fn status(&self, enrollment_id: EnrollmentId) -> Option<DeploymentState> {
        self.states.lock().unwrap().get(&enrollment_id).cloned()
    }

    /// Stop polling; running deployments fail as cancelled.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Deploy `enrollment_id` to a network and drive it to a terminal
    /// state. At most one active run per enrollment; a second concurrent
    /// attempt is refused.
    #[tracing::instrument(skip(self, opts), fields(network = %opts.network), err)]
    pub async fn deploy(
        &self,
        tenant: &TenantId,
        enrollment_id: EnrollmentId,
        opts: DeployOptions,
    ) -> Result<DeploymentState, Error> {
        // The per-enrollment guard: holders of the slot are the single
        // active run until released below.
        if !self.in_flight.lock().unwrap().insert(enrollment_id) {
            return Err(Error::AlreadyInFlight(enrollment_id));
        }

        let result = match self.prepare(tenant, enrollment_id, &opts).await {
            Ok(state) => Ok(self.finish(tenant, state, &opts).await),
            Err(err) => Err(err),
        };
        self.in_flight.lock().unwrap().remove(&enrollment_id);
        result
    }

    /// As [`deploy`], but return as soon as the run is admitted; the rest
    /// executes in the background and is queried via [`status`] and the
    /// event stream. Admission failures (conflict, preconditions) still
    /// surface synchronously.
    #[tracing::instrument(skip(self, opts), fields(network = %opts.network), err)]
    pub async fn start_deploy(
        self: &Arc<Self>,
        tenant: &TenantId,
        enrollment_id: EnrollmentId,
        opts: DeployOptions,
    ) -> Result<DeploymentState, Error> {
        if !self.in_flight.lock().unwrap().insert(enrollment_id) {
            return Err(Error::AlreadyInFlight(enrollment_id));
        }

        match self.prepare(tenant, enrollment_id, &opts).await {
            Ok(state) => {
                let coordinator = self.clone();
                let tenant = tenant.clone();
                let accepted = state.clone();
                tokio::spawn(async move {
                    coordinator.finish(&tenant, state, &opts).await;
                    coordinator.in_flight.lock().unwrap().remove(&enrollment_id);
                });
                Ok(accepted)
            }
            Err(err) => {
                self.in_flight.lock().unwrap().remove(&enrollment_id);
                Err(err)
            }
        }
    }

    /// Check preconditions and publish the accepted run. Holds no locks
    /// across the enrollment read.
    async fn prepare(
        &self,
        tenant: &TenantId,
        enrollment_id: EnrollmentId,
        opts: &DeployOptions,
    ) -> Result<DeploymentState, Error> {
        // Preconditions are checked before any state is published.
        let enrollment = self
            .backend
            .enrollment(tenant, enrollment_id)
            .await
            .map_err(Error::Upstream)?;
        if !enrollment.all_domains_validated() {
            return Err(Error::NotReady {
                enrollment_id,
                reason: "not all domains on the enrollment are validated".to_string(),
            });
        }
        if !enrollment.is_deployable_status() {
            return Err(Error::NotReady {
                enrollment_id,
                reason: format!(
                    "enrollment status {:?} is not deployable (need active or modified)",
                    enrollment.status
                ),
            });
        }

        let mut state = DeploymentState::new(enrollment_id, opts.network);
        for property_id in &opts.auto_link {
            state.property_links.insert(
                property_id.clone(),
                PropertyLink {
                    status: LinkStatus::Pending,
                    version: None,
                    error: None,
                },
            );
        }
        self.put_state(state.clone());
        self.events.publish(
            enrollment_id,
            DeployEvent::DeploymentStarted {
                enrollment_id,
                network: opts.network,
            },
        );
        Ok(state)
    }

    /// Drive an admitted run to its terminal state.
    async fn finish(
        &self,
        tenant: &TenantId,
        mut state: DeploymentState,
        opts: &DeployOptions,
    ) -> DeploymentState {
        let enrollment_id = state.enrollment_id;

        match self.drive(tenant, &mut state, opts).await {
            Ok(()) => {}
            Err(reason) => {
                state.status = DeployStatus::Failed;
                state.push_error(reason.clone());
                self.events.publish(
                    enrollment_id,
                    DeployEvent::DeploymentFailed {
                        enrollment_id,
                        reason,
                    },
                );
                if opts.rollback_on_failure {
                    self.rollback(tenant, &mut state).await;
                }
            }
        }

        state.ended_at = Some(Utc::now());
        self.put_state(state.clone());
        tracing::info!(
            enrollment = enrollment_id,
            status = ?state.status,
            progress = state.progress,
            "deployment run finished"
        );
        state
    }

    /// Submit and poll the deployment, then link properties. An Err is a
    /// failure reason; the caller owns the failure transition.
    async fn drive(
        &self,
        tenant: &TenantId,
        state: &mut DeploymentState,
        opts: &DeployOptions,
    ) -> Result<(), String> {
        let enrollment_id = state.enrollment_id;

        let deployment_id = self
            .backend
            .create_deployment(tenant, enrollment_id, opts.network)
            .await
            .map_err(|err| format!("deployment submission failed: {err:#}"))?;

        state.deployment_id = Some(deployment_id);
        self.advance(state, DeployStatus::Initiated, 10);
        self.put_state(state.clone());

        // Poll to a terminal deployment status within the budget.
        let started = tokio::time::Instant::now();
        loop {
            if started.elapsed() >= self.config.poll_budget {
                return Err(format!(
                    "deployment did not finish within {:?}",
                    self.config.poll_budget
                ));
            }
            tokio::select! {
                () = self.shutdown.cancelled() => return Err("deployment cancelled".to_string()),
                () = tokio::time::sleep(self.config.poll_interval) => {}
            }

            let status = match self
                .backend
                .deployment_status(tenant, enrollment_id, deployment_id)
                .await
            {
                Ok(status) => status,
                Err(err) => {
                    tracing::debug!(enrollment = enrollment_id, error = %err, "status poll failed; will retry");
                    continue;
                }
            };

            match status.as_str() {
                "active" => {
                    self.advance(state, DeployStatus::Deployed, 100);
                    self.put_state(state.clone());
                    self.events.publish(
                        enrollment_id,
                        DeployEvent::DeploymentCompleted {
                            enrollment_id,
                            deployment_id,
                        },
                    );
                    break;
                }
                "pending" => {
                    self.advance(state, DeployStatus::Initiated, 25);
                    self.put_state(state.clone());
                }
                "in-progress" => {
                    self.advance(state, DeployStatus::InProgress, 75);
                    self.put_state(state.clone());
                }
                "cancelled" => {
                    // Cancellation upstream maps to rolled-back, not failed.
                    state.status = DeployStatus::RolledBack;
                    state.push_error("deployment was cancelled upstream".to_string());
                    self.put_state(state.clone());
                    self.events.publish(
                        enrollment_id,
                        DeployEvent::DeploymentFailed {
                            enrollment_id,
                            reason: "deployment was cancelled upstream".to_string(),
                        },
                    );
                    return Ok(());
                }
                "failed" => return Err("deployment failed upstream".to_string()),
                other => {
                    tracing::debug!(enrollment = enrollment_id, status = other, "unrecognized deployment status");
                }
            }
        }

        if state.status == DeployStatus::Deployed && !opts.auto_link.is_empty() {
            self.link_properties(tenant, state, opts).await;

            // Every link failing is only fatal when rollback is requested.
            let all_failed = state
                .property_links
                .values()
                .all(|link| link.status == LinkStatus::Failed);
            if opts.rollback_on_failure && all_failed {
                return Err("every property link failed".to_string());
            }
        }
        Ok(())
    }

    async fn link_properties(
        &self,
        tenant: &TenantId,
        state: &mut DeploymentState,
        opts: &DeployOptions,
    ) {
        let enrollment_id = state.enrollment_id;
        let total = opts.auto_link.len();

        let outcomes: Vec<(String, Result<u64, String>)> = if opts.parallel_linking {
            let futures: Vec<_> = opts
                .auto_link
                .iter()
                .map(|property_id| {
                    let property_id = property_id.clone();
                    async move {
                        self.events.publish(
                            enrollment_id,
                            DeployEvent::PropertyLinking {
                                enrollment_id,
                                property_id: property_id.clone(),
                            },
                        );
                        let outcome = self
                            .link_one_property(tenant, enrollment_id, &property_id)
                            .await;
                        (property_id, outcome)
                    }
                })
                .collect();
            futures::future::join_all(futures).await
        } else {
            let mut outcomes = Vec::with_capacity(total);
            for property_id in &opts.auto_link {
                self.events.publish(
                    enrollment_id,
                    DeployEvent::PropertyLinking {
                        enrollment_id,
                        property_id: property_id.clone(),
                    },
                );
                let outcome = self
                    .link_one_property(tenant, enrollment_id, property_id)
                    .await;
                outcomes.push((property_id.clone(), outcome));
            }
            outcomes
        };

        let mut completed = 0;
        for (property_id, outcome) in outcomes {
            let link = state
                .property_links
                .get_mut(&property_id)
                .expect("links are seeded before linking");
            match outcome {
                Ok(version) => {
                    completed += 1;
                    link.status = LinkStatus::Linked;
                    link.version = Some(version);
                    self.events.publish(
                        enrollment_id,
                        DeployEvent::PropertyLinked {
                            enrollment_id,
                            property_id,
                            version,
                        },
                    );
                }
                Err(reason) => {
                    link.status = LinkStatus::Failed;
                    link.error = Some(reason.clone());
                    state.push_error(format!("property {property_id}: {reason}"));
                    self.events.publish(
                        enrollment_id,
                        DeployEvent::PropertyLinkFailed {
                            enrollment_id,
                            property_id,
                            reason,
                        },
                    );
                }
            }
        }

        // Linking phase progress: 90 plus the linked share.
        state.progress = 90 + ((10 * completed) / total.max(1)) as u8;
        self.put_state(state.clone());
    }

    async fn link_one_property(
        &self,
        tenant: &TenantId,
        enrollment_id: EnrollmentId,
        property_id: &str,
    ) -> Result<u64, String> {
        let version = self
            .backend
            .latest_property_version(tenant, property_id)
            .await
            .map_err(|err| format!("reading latest version: {err:#}"))?;

        let mut hostnames = self
            .backend
            .property_hostnames(tenant, property_id, version)
            .await
            .map_err(|err| format!("reading hostnames: {err:#}"))?;

        for hostname in &mut hostnames {
            hostname.cert_enrollment_id = Some(enrollment_id);
        }

        self.backend
            .update_property_hostnames(tenant, property_id, version, &hostnames)
            .await
            .map_err(|err| format!("writing hostnames: {err:#}"))?;

        Ok(version)
    }

    async fn rollback(&self, tenant: &TenantId, state: &mut DeploymentState) {
        let enrollment_id = state.enrollment_id;
        let Some(deployment_id) = state.deployment_id else {
            // Nothing was submitted; there is nothing to cancel.
            return;
        };

        self.events
            .publish(enrollment_id, DeployEvent::RollbackStarted { enrollment_id });

        match self
            .backend
            .cancel_deployment(tenant, enrollment_id, deployment_id)
            .await
        {
            Ok(()) => {
                state.status = DeployStatus::RolledBack;
                self.events.publish(
                    enrollment_id,
                    DeployEvent::RollbackCompleted { enrollment_id },
                );
            }
            Err(err) => {
                state.push_error(format!("rollback failed: {err:#}"));
                tracing::error!(enrollment = enrollment_id, error = %err, "rollback failed");
            }
        }
    }

    fn advance(&self, state: &mut DeploymentState, status: DeployStatus, progress: u8) {
        let moved = state.progress != progress || state.status != status;
        state.status = status;
        state.progress = progress;
        if moved {
            self.events.publish(
                state.enrollment_id,
                DeployEvent::DeploymentProgress {
                    enrollment_id: state.enrollment_id,
                    progress,
                },
            );
        }
    }

    fn put_state(&self, state: DeploymentState) {
        self.states
            .lock()
            .unwrap()
            .insert(state.enrollment_id, state);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::{Enrollment, PropertyHostname};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    const ENROLLMENT: EnrollmentId = 10001;

    fn tenant(s: &str) -> TenantId {
        TenantId::new(s).unwrap()
    }

    struct ScriptedCert {
        enrollment_status: &'static str,
        domains_validated: bool,
        statuses: Mutex<VecDeque<&'static str>>,
        failing_properties: Vec<String>,
        cancelled: AtomicBool,
        enrollment_delay: Duration,
    }

    impl ScriptedCert {
        fn with_statuses(statuses: &[&'static str]) -> Arc<Self> {
            Arc::new(Self {
                enrollment_status: "active",
                domains_validated: true,
                statuses: Mutex::new(statuses.iter().copied().collect()),
                failing_properties: Vec::new(),
                cancelled: AtomicBool::new(false),
                enrollment_delay: Duration::ZERO,
            })
        }
    }

    #[async_trait::async_trait]
    impl CertBackend for ScriptedCert {
        async fn enrollment(
            &self,
            _tenant: &TenantId,
            id: EnrollmentId,
        ) -> Result<Enrollment, anyhow::Error> {
            if !self.enrollment_delay.is_zero() {
                tokio::time::sleep(self.enrollment_delay).await;
            }
            Ok(serde_json::from_value(serde_json::json!({
                "enrollmentId": id,
                "status": self.enrollment_status,
                "sans": ["www.example.net"],
                "domains": [
                    {"name": "www.example.net", "validated": self.domains_validated},
                ],
            }))
            .unwrap())
        }

        async fn create_deployment(
            &self,
            _tenant: &TenantId,
            _id: EnrollmentId,
            _network: Network,
        ) -> Result<u64, anyhow::Error> {
            Ok(777)
        }

        async fn deployment_status(
            &self,
            _tenant: &TenantId,
            _id: EnrollmentId,
            _deployment_id: u64,
        ) -> Result<String, anyhow::Error> {
            let mut statuses = self.statuses.lock().unwrap();
            let status = if statuses.len() > 1 {
                statuses.pop_front().unwrap()
            } else {
                *statuses.front().expect("status script is never empty")
            };
            Ok(status.to_string())
        }

        async fn cancel_deployment(
            &self,
            _tenant: &TenantId,
            _id: EnrollmentId,
            _deployment_id: u64,
        ) -> Result<(), anyhow::Error> {
            self.cancelled.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn latest_property_version(
            &self,
            _tenant: &TenantId,
            _property_id: &str,
        ) -> Result<u64, anyhow::Error> {
            Ok(7)
        }

        async fn property_hostnames(
            &self,
            _tenant: &TenantId,
            _property_id: &str,
            _version: u64,
        ) -> Result<Vec<PropertyHostname>, anyhow::Error> {
            Ok(vec![serde_json::from_value(serde_json::json!({
                "cnameFrom": "www.example.net",
                "cnameTo": "www.example.net.edge.example",
            }))
            .unwrap()])
        }

        async fn update_property_hostnames(
            &self,
            _tenant: &TenantId,
            property_id: &str,
            _version: u64,
            hostnames: &[PropertyHostname],
        ) -> Result<(), anyhow::Error> {
            assert!(hostnames
                .iter()
                .all(|h| h.cert_enrollment_id == Some(ENROLLMENT)));
            if self.failing_properties.iter().any(|p| p == property_id) {
                anyhow::bail!("write refused for {property_id}");
            }
            Ok(())
        }
    }

    fn coordinator(backend: Arc<ScriptedCert>) -> Arc<DeployCoordinator> {
        DeployCoordinator::new(
            backend,
            CoordinatorConfig {
                poll_interval: Duration::from_secs(10),
                poll_budget: Duration::from_secs(30 * 60),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_emits_the_documented_event_sequence() {
        let backend = ScriptedCert::with_statuses(&["pending", "in-progress", "active"]);
        let coordinator = coordinator(backend);
        let mut stream = coordinator.subscribe(ENROLLMENT);

        let state = coordinator
            .deploy(
                &tenant("t1"),
                ENROLLMENT,
                DeployOptions {
                    network: Network::Staging,
                    auto_link: vec!["prp_1".to_string(), "prp_2".to_string()],
                    parallel_linking: false,
                    rollback_on_failure: false,
                },
            )
            .await
            .unwrap();

        assert_eq!(state.status, DeployStatus::Deployed);
        assert_eq!(state.progress, 100);
        assert!(state
            .property_links
            .values()
            .all(|link| link.status == LinkStatus::Linked && link.version == Some(7)));

        let events = stream.drain();
        let expected = vec![
            DeployEvent::DeploymentStarted {
                enrollment_id: ENROLLMENT,
                network: Network::Staging,
            },
            DeployEvent::DeploymentProgress { enrollment_id: ENROLLMENT, progress: 10 },
            DeployEvent::DeploymentProgress { enrollment_id: ENROLLMENT, progress: 25 },
            DeployEvent::DeploymentProgress { enrollment_id: ENROLLMENT, progress: 75 },
            DeployEvent::DeploymentProgress { enrollment_id: ENROLLMENT, progress: 100 },
            DeployEvent::DeploymentCompleted {
                enrollment_id: ENROLLMENT,
                deployment_id: 777,
            },
            DeployEvent::PropertyLinking {
                enrollment_id: ENROLLMENT,
                property_id: "prp_1".to_string(),
            },
            DeployEvent::PropertyLinked {
                enrollment_id: ENROLLMENT,
                property_id: "prp_1".to_string(),
                version: 7,
            },
            DeployEvent::PropertyLinking {
                enrollment_id: ENROLLMENT,
                property_id: "prp_2".to_string(),
            },
            DeployEvent::PropertyLinked {
                enrollment_id: ENROLLMENT,
                property_id: "prp_2".to_string(),
                version: 7,
            },
        ];
        assert_eq!(events, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn a_second_concurrent_deployment_is_refused() {
        let backend = Arc::new(ScriptedCert {
            enrollment_status: "active",
            domains_validated: true,
            statuses: Mutex::new(["active"].into_iter().collect()),
            failing_properties: Vec::new(),
            cancelled: AtomicBool::new(false),
            // Keep the first run inside its precondition read while the
            // second attempt arrives.
            enrollment_delay: Duration::from_secs(5),
        });
        let coordinator = coordinator(backend);

        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .deploy(
                        &tenant("t1"),
                        ENROLLMENT,
                        DeployOptions::network(Network::Production),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;

        let second = coordinator
            .deploy(
                &tenant("t1"),
                ENROLLMENT,
                DeployOptions::network(Network::Production),
            )
            .await;
        assert!(matches!(second, Err(Error::AlreadyInFlight(ENROLLMENT))));

        let state = first.await.unwrap().unwrap();
        assert_eq!(state.status, DeployStatus::Deployed);

        // The slot is free again once the first run is done.
        let third = coordinator
            .deploy(
                &tenant("t1"),
                ENROLLMENT,
                DeployOptions::network(Network::Production),
            )
            .await
            .unwrap();
        assert_eq!(third.status, DeployStatus::Deployed);
    }

    #[tokio::test(start_paused = true)]
    async fn unvalidated_domains_refuse_deployment() {
        let backend = Arc::new(ScriptedCert {
            enrollment_status: "active",
            domains_validated: false,
            statuses: Mutex::new(["active"].into_iter().collect()),
            failing_properties: Vec::new(),
            cancelled: AtomicBool::new(false),
            enrollment_delay: Duration::ZERO,
        });
        let err = coordinator(backend)
            .deploy(
                &tenant("t1"),
                ENROLLMENT,
                DeployOptions::network(Network::Staging),
            )
            .await
            .unwrap_err();

        let Error::NotReady { reason, .. } = err else {
            panic!("expected NotReady");
        };
        assert!(reason.contains("validated"));
    }

    #[tokio::test(start_paused = true)]
    async fn non_deployable_status_refuses_deployment() {
        let backend = Arc::new(ScriptedCert {
            enrollment_status: "incomplete",
            domains_validated: true,
            statuses: Mutex::new(["active"].into_iter().collect()),
            failing_properties: Vec::new(),
            cancelled: AtomicBool::new(false),
            enrollment_delay: Duration::ZERO,
        });
        let err = coordinator(backend)
            .deploy(
                &tenant("t1"),
                ENROLLMENT,
                DeployOptions::network(Network::Staging),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotReady { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn upstream_failure_with_rollback_cancels_the_deployment() {
        let backend = ScriptedCert::with_statuses(&["failed"]);
        let coordinator = coordinator(backend.clone());
        let mut stream = coordinator.subscribe(ENROLLMENT);

        let state = coordinator
            .deploy(
                &tenant("t1"),
                ENROLLMENT,
                DeployOptions {
                    network: Network::Production,
                    auto_link: Vec::new(),
                    parallel_linking: false,
                    rollback_on_failure: true,
                },
            )
            .await
            .unwrap();

        assert_eq!(state.status, DeployStatus::RolledBack);
        assert!(backend.cancelled.load(Ordering::SeqCst));
        assert!(state.errors.iter().any(|e| e.contains("failed upstream")));

        let events = stream.drain();
        assert!(events
            .iter()
            .any(|e| matches!(e, DeployEvent::DeploymentFailed { .. })));
        let rollback_started = events
            .iter()
            .position(|e| matches!(e, DeployEvent::RollbackStarted { .. }))
            .unwrap();
        let rollback_completed = events
            .iter()
            .position(|e| matches!(e, DeployEvent::RollbackCompleted { .. }))
            .unwrap();
        assert!(rollback_started < rollback_completed);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_times_out_into_failure() {
        let backend = ScriptedCert::with_statuses(&["pending"]);
        let coordinator = DeployCoordinator::new(
            backend,
            CoordinatorConfig {
                poll_interval: Duration::from_secs(10),
                poll_budget: Duration::from_secs(35),
            },
        );

        let state = coordinator
            .deploy(
                &tenant("t1"),
                ENROLLMENT,
                DeployOptions::network(Network::Staging),
            )
            .await
            .unwrap();

        assert_eq!(state.status, DeployStatus::Failed);
        assert!(state.errors.iter().any(|e| e.contains("did not finish")));
    }

    #[tokio::test(start_paused = true)]
    async fn one_failed_link_does_not_fail_the_deployment() {
        let backend = Arc::new(ScriptedCert {
            enrollment_status: "active",
            domains_validated: true,
            statuses: Mutex::new(["active"].into_iter().collect()),
            failing_properties: vec!["prp_2".to_string()],
            cancelled: AtomicBool::new(false),
            enrollment_delay: Duration::ZERO,
        });
        let coordinator = coordinator(backend.clone());

        let state = coordinator
            .deploy(
                &tenant("t1"),
                ENROLLMENT,
                DeployOptions {
                    network: Network::Production,
                    auto_link: vec!["prp_1".to_string(), "prp_2".to_string()],
                    parallel_linking: false,
                    rollback_on_failure: true,
                },
            )
            .await
            .unwrap();

        // One link survived, so rollback-on-failure does not trigger.
        assert_eq!(state.status, DeployStatus::Deployed);
        assert!(!backend.cancelled.load(Ordering::SeqCst));
        assert_eq!(state.property_links["prp_1"].status, LinkStatus::Linked);
        assert_eq!(state.property_links["prp_2"].status, LinkStatus::Failed);
        assert_eq!(state.progress, 95);
    }

    #[tokio::test(start_paused = true)]
    async fn start_deploy_returns_the_accepted_run_and_finishes_in_the_background() {
        let backend = ScriptedCert::with_statuses(&["in-progress", "active"]);
        let coordinator = coordinator(backend);

        let accepted = coordinator
            .start_deploy(
                &tenant("t1"),
                ENROLLMENT,
                DeployOptions::network(Network::Staging),
            )
            .await
            .unwrap();
        assert_eq!(accepted.status, DeployStatus::Pending);

        // A concurrent attempt is refused while the background run holds
        // the enrollment.
        let second = coordinator
            .start_deploy(
                &tenant("t1"),
                ENROLLMENT,
                DeployOptions::network(Network::Staging),
            )
            .await;
        assert!(matches!(second, Err(Error::AlreadyInFlight(ENROLLMENT))));

        // The background run completes and is visible via status.
        loop {
            let state = coordinator.status(ENROLLMENT).unwrap();
            if state.status.is_terminal() {
                assert_eq!(state.status, DeployStatus::Deployed);
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn all_links_failing_with_rollback_rolls_back() {
        let backend = Arc::new(ScriptedCert {
            enrollment_status: "active",
            domains_validated: true,
            statuses: Mutex::new(["active"].into_iter().collect()),
            failing_properties: vec!["prp_1".to_string(), "prp_2".to_string()],
            cancelled: AtomicBool::new(false),
            enrollment_delay: Duration::ZERO,
        });
        let coordinator = coordinator(backend.clone());

        let state = coordinator
            .deploy(
                &tenant("t1"),
                ENROLLMENT,
                DeployOptions {
                    network: Network::Production,
                    auto_link: vec!["prp_1".to_string(), "prp_2".to_string()],
                    parallel_linking: true,
                    rollback_on_failure: true,
                },
            )
            .await
            .unwrap();

        assert_eq!(state.status, DeployStatus::RolledBack);
        assert!(backend.cancelled.load(Ordering::SeqCst));
    }
}
