//! Self-healer: periodic recovery of stalled running jobs.

use chrono::Utc;

use differential_core::{EventKind, JobEvent};
use differential_store::StallSweep;

use crate::state::AppState;

/// Scans for running jobs past their stall threshold every tick; requeues
/// those with attempts left and terminalizes the rest.
pub struct SelfHealer {
    state: AppState,
}

impl SelfHealer {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// One sweep. Separated from [`run`](Self::run) so tests can drive it.
    pub fn tick(&self) -> StallSweep {
        let sweep = match self.state.store.recover_stalled_jobs(
            self.state.config.default_job_timeout_seconds,
            Utc::now(),
        ) {
            Ok(sweep) => sweep,
            Err(e) => {
                tracing::error!(error = %e, "stall sweep failed");
                return StallSweep::default();
            }
        };
        for job in &sweep.requeued {
            self.state.emit(
                JobEvent::job(EventKind::JobStalled, job.cluster_id.clone(), job.id.clone())
                    .with_service(job.service.clone()),
            );
        }
        for job in &sweep.terminalized {
            self.state.emit(
                JobEvent::job(
                    EventKind::JobStalledTerminal,
                    job.cluster_id.clone(),
                    job.id.clone(),
                )
                .with_service(job.service.clone()),
            );
        }
        if !sweep.requeued.is_empty() || !sweep.terminalized.is_empty() {
            tracing::info!(
                requeued = sweep.requeued.len(),
                terminalized = sweep.terminalized.len(),
                "recovered stalled jobs"
            );
        }
        sweep
    }

    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.state.config.healer_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.tick();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;
    use differential_core::{CallConfig, JobStatus};
    use differential_store::{SqliteEventSink, SqliteJobStore};

    use super::*;
    use crate::config::ServerConfig;

    fn temp_store(name: &str) -> SqliteJobStore {
        let path = std::env::temp_dir().join(format!(
            "differential-healer-{}-{}.db",
            name,
            uuid::Uuid::new_v4()
        ));
        SqliteJobStore::new(&path.to_string_lossy()).expect("open store")
    }

    #[test]
    fn tick_emits_stall_events() {
        let store = temp_store("events");
        store.create_cluster("c1", "s1", true).unwrap();
        let cluster = store.get_cluster("c1").unwrap().unwrap();
        store
            .create_job(
                &cluster,
                "orders",
                "create",
                b"{}",
                &CallConfig {
                    timeout_seconds: Some(1),
                    ..CallConfig::default()
                },
                Utc::now() - Duration::seconds(120),
            )
            .unwrap();
        store
            .next_jobs(
                "c1",
                "orders",
                "m1",
                None,
                1,
                Utc::now() - Duration::seconds(60),
            )
            .unwrap();

        let config = ServerConfig {
            default_job_timeout_seconds: 1,
            ..ServerConfig::default()
        };
        let state = AppState::new(
            store.clone(),
            Arc::new(SqliteEventSink::new(store.clone())),
            config,
        );
        let sweep = SelfHealer::new(state).tick();
        assert_eq!(sweep.requeued.len(), 1);
        assert_eq!(
            store
                .count_events("c1", EventKind::JobStalled)
                .unwrap(),
            1
        );

        let job_id = &sweep.requeued[0].id;
        let job = store.get_job("c1", job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
    }
}
