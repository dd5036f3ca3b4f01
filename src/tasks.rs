use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{error, info, instrument};

use crate::services::ControlPlane;
use crate::statistics::{CollectOutcome, StatisticOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Job {
    Heartbeat,
    Collect,
    Statistic,
    Reset,
    RotateIps,
    RotateIpsSoftly,
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Job::Heartbeat => "heartbeat",
            Job::Collect => "collect",
            Job::Statistic => "statistic",
            Job::Reset => "reset",
            Job::RotateIps => "rotate-ips",
            Job::RotateIpsSoftly => "rotate-ips-softly",
        };
        f.write_str(name)
    }
}

/// Removes the job's running mark when the run ends, even on panic.
struct Running<'a> {
    jobs: &'a DashMap<Job, Instant>,
    job: Job,
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.jobs.remove(&self.job);
    }
}

/// Runs the scheduled jobs. A job never overlaps with itself.
pub struct JobRunner {
    plane: Arc<ControlPlane>,
    running: DashMap<Job, Instant>,
}

impl JobRunner {
    pub fn new(plane: Arc<ControlPlane>) -> Self {
        Self {
            plane,
            running: DashMap::new(),
        }
    }

    fn mark_running(&self, job: Job) -> Option<Running<'_>> {
        match self.running.entry(job) {
            Entry::Occupied(started) => {
                info!(
                    job = %job,
                    running_for = ?started.get().elapsed(),
                    "Job still running, skipped."
                );
                None
            }
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                Some(Running {
                    jobs: &self.running,
                    job,
                })
            }
        }
    }

    /// Runs `job` once. Returns `false` if it was skipped because a previous
    /// run of the same job has not finished.
    #[instrument(skip(self))]
    pub async fn run_job(&self, job: Job) -> bool {
        let Some(_running) = self.mark_running(job) else {
            return false;
        };
        let started = Instant::now();
        match job {
            Job::Heartbeat => {
                self.plane.reconciler.heartbeat().await;
            }
            Job::Collect => {
                if let CollectOutcome::Collected { nodes, rows } = self.plane.statistics.collect().await {
                    info!(nodes = nodes, rows = rows, "Counters collected.");
                }
            }
            Job::Statistic => {
                if let StatisticOutcome::Done { consolidated, .. } = self.plane.statistics.statistic().await {
                    info!(consolidated = consolidated, "Statistics consolidated.");
                }
            }
            Job::Reset => {
                if let Err(e) = self.plane.statistics.reset().await {
                    error!(error = %e, "Counter reset failed.");
                }
            }
            Job::RotateIps => {
                let report = self.plane.rotator.rotate_ips().await;
                info!(published = report.published, failed = report.failed, "IP rotation requested.");
            }
            Job::RotateIpsSoftly => {
                let report = self.plane.rotator.rotate_ips_softly().await;
                info!(published = report.published, failed = report.failed, "Soft IP rotation finished.");
            }
        }
        info!(job = %job, elapsed = ?started.elapsed(), "Job finished.");
        true
    }

    /// Starts one loop per scheduled job and returns their handles.
    ///
    /// Each tick spawns the job, so a slow run delays neither the next tick
    /// nor the other jobs. Heartbeat and statistic start right away, reset
    /// only after its first full interval.
    pub fn run_periodic_tasks(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let config = self.plane.config.get();
        let mut schedule = vec![
            (Job::Heartbeat, Duration::from_secs(config.heartbeat_interval), false),
            (Job::Statistic, Duration::from_secs(config.statistic_interval), false),
        ];
        if let Some(reset) = config.reset_interval {
            schedule.push((Job::Reset, Duration::from_secs(reset), true));
        }

        schedule
            .into_iter()
            .map(|(job, period, delayed)| {
                let runner = Arc::clone(self);
                tokio::spawn(async move {
                    info!(job = %job, interval = ?period, "Starting periodic job.");
                    let start = if delayed { Instant::now() + period } else { Instant::now() };
                    let mut interval = time::interval_at(start, period);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    loop {
                        interval.tick().await;
                        let runner = runner.clone();
                        tokio::spawn(async move {
                            runner.run_job(job).await;
                        });
                    }
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigHandle, ServiceConfig};
    use crate::db::enums::{Interface, ServerEdition};
    use crate::db::models::{ManagerSettings, NewNode};
    use crate::statistics::LocalLockService;
    use crate::test_support::{FakeDaemon, RecordingDnsProvider, RecordingPublisher, new_account, test_config};

    async fn runner(daemon: &FakeDaemon, config: ServiceConfig) -> Arc<JobRunner> {
        let plane = Arc::new(ControlPlane::with_parts(
            ConfigHandle::fixed(config),
            Arc::new(daemon.probe()),
            Some(Arc::new(RecordingDnsProvider::default())),
            Arc::new(RecordingPublisher::default()),
            Arc::new(LocalLockService::new()),
        ));
        let node = plane
            .fleet
            .create_node(NewNode {
                name: "a".to_string(),
                public_ip: Some("1.2.3.4".parse().unwrap()),
                private_ip: None,
                location: None,
                is_active: true,
                record_id: None,
                ip_change_webhook: None,
            })
            .await
            .unwrap();
        plane
            .fleet
            .set_manager(
                node.id,
                ManagerSettings {
                    interface: Interface::Localhost,
                    port: daemon.port(),
                    ..ManagerSettings::default()
                },
            )
            .await
            .unwrap();
        let account = plane.fleet.create_account(new_account(8381)).await.unwrap();
        plane.fleet.create_assignment(node.id, account.id, true).await.unwrap();
        Arc::new(JobRunner::new(plane))
    }

    #[tokio::test]
    async fn test_job_does_not_overlap_itself() {
        let daemon = FakeDaemon::start(ServerEdition::Libev).await;
        let runner = runner(&daemon, test_config()).await;
        daemon.set_silent(true);
        // Drop cached pings so the heartbeat has to wait for the daemon.
        for view in runner.plane.store.all_views().await {
            if let Some(client) = runner.plane.reconciler.client_for(&view) {
                client.clear_cache();
            }
        }

        let (first, second, other) = tokio::join!(
            runner.run_job(Job::Heartbeat),
            runner.run_job(Job::Heartbeat),
            runner.run_job(Job::Collect),
        );
        assert!(first);
        assert!(!second);
        assert!(other);
        assert!(runner.running.is_empty());
        assert!(runner.run_job(Job::Heartbeat).await);
    }

    #[tokio::test]
    async fn test_periodic_heartbeat_repairs_drift() {
        let daemon = FakeDaemon::start(ServerEdition::Libev).await;
        let config = ServiceConfig {
            heartbeat_interval: 1,
            cache_timeout: 0,
            ..test_config()
        };
        let runner = runner(&daemon, config).await;
        daemon.clear_ports();

        let handles = runner.run_periodic_tasks();
        assert_eq!(handles.len(), 2);
        tokio::time::sleep(Duration::from_millis(500)).await;
        for handle in handles {
            handle.abort();
        }
        assert!(daemon.has_port(8381));
    }
}
