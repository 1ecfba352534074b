//! Heartbeat-based robot health monitoring.
//!
//! A periodic sweep marks robots offline after `missed_heartbeats` intervals
//! without a heartbeat, lets the dispatcher recover their jobs, and times out
//! jobs past their deadline.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleetflow_types::config::HealthConfig;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::dispatcher::{DispatchError, FleetDispatcher};
use crate::repository::{CheckpointRepository, JobRepository, WorkflowRepository};

/// What one sweep changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub offline: Vec<String>,
    pub expired: Vec<Uuid>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.offline.is_empty() && self.expired.is_empty()
    }
}

pub struct HealthMonitor<J, W, C>
where
    J: JobRepository,
    W: WorkflowRepository,
    C: CheckpointRepository,
{
    dispatcher: Arc<FleetDispatcher<J, W, C>>,
    config: HealthConfig,
}

impl<J, W, C> HealthMonitor<J, W, C>
where
    J: JobRepository + 'static,
    W: WorkflowRepository + 'static,
    C: CheckpointRepository + 'static,
{
    pub fn new(dispatcher: Arc<FleetDispatcher<J, W, C>>, config: HealthConfig) -> Self {
        Self { dispatcher, config }
    }

    /// How long a robot may stay silent before it is considered lost.
    pub fn offline_after(&self) -> chrono::Duration {
        let secs = self
            .config
            .heartbeat_interval_secs
            .saturating_mul(u64::from(self.config.missed_heartbeats.max(1)));
        chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
    }

    /// Run one health pass as of `now`.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, DispatchError> {
        let mut report = SweepReport::default();
        let cutoff = now - self.offline_after();
        for robot_id in self.dispatcher.stale_robots(cutoff) {
            let reason = format!(
                "no heartbeat for {} intervals",
                self.config.missed_heartbeats
            );
            self.dispatcher.robot_lost(&robot_id, &reason).await?;
            report.offline.push(robot_id);
        }
        report.expired = self.dispatcher.expire_jobs(now).await?;
        Ok(report)
    }

    /// Sweep every heartbeat interval until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let period = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            interval_secs = period.as_secs(),
            missed_heartbeats = self.config.missed_heartbeats,
            "health monitor started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.sweep(Utc::now()).await {
                        Ok(report) if !report.is_empty() => tracing::info!(
                            offline = ?report.offline,
                            expired = report.expired.len(),
                            "health sweep"
                        ),
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "health sweep failed"),
                    }
                }
            }
        }
        tracing::info!("health monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetflow_types::config::FleetConfig;
    use fleetflow_types::job::{JobStatus, JobSubmission};
    use fleetflow_types::protocol::{AgentMessage, DispatcherMessage};
    use fleetflow_types::robot::{RobotRegistration, RobotStatus};
    use tokio::sync::mpsc;

    use crate::fleet::dispatcher::tests::{dispatcher_with, hello_workflow};

    fn registration(id: &str) -> RobotRegistration {
        RobotRegistration {
            robot_id: Some(id.into()),
            name: id.into(),
            capabilities: Default::default(),
            environment: "default".into(),
            tags: Default::default(),
            max_concurrent_jobs: 1,
        }
    }

    #[tokio::test]
    async fn silent_robot_goes_offline_and_its_job_fails() {
        let config = FleetConfig::default();
        let d = dispatcher_with(config.clone());
        let monitor = HealthMonitor::new(Arc::clone(&d), config.health.clone());
        d.register_workflow(hello_workflow()).await.unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        d.register_robot(registration("r1"), tx).await.unwrap();
        rx.recv().await.unwrap();
        let job = d
            .submit(JobSubmission {
                workflow_id: "hello".into(),
                priority: Default::default(),
                required_capabilities: Default::default(),
                environment: "default".into(),
                target_robot_id: None,
                timeout_secs: None,
                variables: Default::default(),
            })
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(DispatcherMessage::Assign { .. })));
        d.on_agent_message("r1", AgentMessage::Accepted { job_id: job.id })
            .await
            .unwrap();

        // Within the grace period nothing happens.
        assert!(monitor.sweep(Utc::now()).await.unwrap().is_empty());

        let later = Utc::now() + monitor.offline_after() + chrono::Duration::seconds(1);
        let report = monitor.sweep(later).await.unwrap();
        assert_eq!(report.offline, vec!["r1".to_string()]);
        assert_eq!(d.robot("r1").unwrap().status, RobotStatus::Offline);
        // No checkpoint was streamed, so the job cannot resume elsewhere.
        assert_eq!(d.get_job(&job.id).await.unwrap().status, JobStatus::Failed);

        // Already offline: not reported twice.
        assert!(monitor.sweep(later).await.unwrap().offline.is_empty());
    }

    #[test]
    fn offline_threshold_is_interval_times_missed() {
        let config = FleetConfig::default();
        let monitor = HealthMonitor::new(dispatcher_with(config.clone()), config.health);
        assert_eq!(monitor.offline_after(), chrono::Duration::seconds(15));
    }
}
