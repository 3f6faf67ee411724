//! Client-side results poller: multiplexes many outstanding call() awaits
//! onto one background task that batches status reads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use differential_core::protocol::BatchStatusRequest;
use differential_core::JobStatusRow;

use crate::api::ControlApi;
use crate::error::ClientError;

#[derive(Clone, Debug)]
pub struct ResultsPollerConfig {
    pub tick: Duration,
    /// Long-poll budget passed on each batch read.
    pub long_poll_timeout_ms: u64,
    pub rate_limit_backoff: Duration,
    /// Consecutive failed cycles before every outstanding job is failed.
    pub max_error_cycles: u32,
    /// Poll cycles a single job may stay outstanding before `JobTimeout`.
    pub max_cycles_per_job: u32,
}

impl Default for ResultsPollerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
            long_poll_timeout_ms: 5_000,
            rate_limit_backoff: Duration::from_secs(5),
            max_error_cycles: 50,
            max_cycles_per_job: 120,
        }
    }
}

struct PendingEntry {
    cycles: u32,
    tx: oneshot::Sender<Result<JobStatusRow, ClientError>>,
}

type PendingMap = HashMap<String, PendingEntry>;

pub struct ResultsPoller {
    pending: Arc<Mutex<PendingMap>>,
    exit: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ResultsPoller {
    /// Spawn the background tick loop.
    pub fn start(control: Arc<dyn ControlApi>, config: ResultsPollerConfig) -> Self {
        let pending: Arc<Mutex<PendingMap>> = Arc::new(Mutex::new(HashMap::new()));
        let exit = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(run_loop(
            control,
            config,
            Arc::clone(&pending),
            Arc::clone(&exit),
        ));
        Self {
            pending,
            exit,
            handle: Mutex::new(Some(handle)),
        }
    }

    fn lock_pending(&self) -> Result<MutexGuard<'_, PendingMap>, ClientError> {
        self.pending
            .lock()
            .map_err(|_| ClientError::Transport("results poller lock poisoned".to_string()))
    }

    /// Register interest in a job and await its terminal status row.
    pub async fn wait_for(&self, job_id: impl Into<String>) -> Result<JobStatusRow, ClientError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.lock_pending()?;
            pending.insert(job_id.into(), PendingEntry { cycles: 0, tx });
        }
        rx.await
            .map_err(|_| ClientError::Transport("results poller stopped".to_string()))?
    }

    /// Outstanding job count, for diagnostics.
    pub fn outstanding(&self) -> usize {
        self.lock_pending().map(|p| p.len()).unwrap_or(0)
    }

    /// Flag the loop to exit and await the in-flight tick.
    pub async fn stop(&self) {
        self.exit.store(true, Ordering::SeqCst);
        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn run_loop(
    control: Arc<dyn ControlApi>,
    config: ResultsPollerConfig,
    pending: Arc<Mutex<PendingMap>>,
    exit: Arc<AtomicBool>,
) {
    let mut error_cycles = 0u32;
    loop {
        if exit.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(config.tick).await;

        let job_ids: Vec<String> = match pending.lock() {
            Ok(map) => map.keys().cloned().collect(),
            Err(_) => break,
        };
        if job_ids.is_empty() {
            continue;
        }

        let request = BatchStatusRequest {
            job_ids,
            long_poll_timeout_ms: Some(config.long_poll_timeout_ms),
        };
        match control.get_job_statuses(&request).await {
            Ok(rows) => {
                error_cycles = 0;
                let Ok(mut map) = pending.lock() else { break };
                for row in rows {
                    if row.status.is_terminal() {
                        if let Some(entry) = map.remove(&row.id) {
                            let _ = entry.tx.send(Ok(row.into()));
                        }
                    }
                }
                let mut timed_out = Vec::new();
                for (id, entry) in map.iter_mut() {
                    entry.cycles += 1;
                    if entry.cycles >= config.max_cycles_per_job {
                        timed_out.push(id.clone());
                    }
                }
                for id in timed_out {
                    if let Some(entry) = map.remove(&id) {
                        let _ = entry.tx.send(Err(ClientError::JobTimeout));
                    }
                }
            }
            Err(ClientError::RateLimited) => {
                tracing::debug!("status poll rate limited, backing off");
                tokio::time::sleep(config.rate_limit_backoff).await;
            }
            Err(e) => {
                error_cycles += 1;
                tracing::warn!(error = %e, cycles = error_cycles, "results poll failed");
                if error_cycles >= config.max_error_cycles {
                    error_cycles = 0;
                    let Ok(mut map) = pending.lock() else { break };
                    for (_, entry) in map.drain() {
                        let _ = entry.tx.send(Err(ClientError::TooManyNetworkErrors));
                    }
                }
            }
        }
    }

    // Release anyone still waiting when the loop winds down.
    if let Ok(mut map) = pending.lock() {
        for (_, entry) in map.drain() {
            let _ = entry
                .tx
                .send(Err(ClientError::Transport("results poller stopped".to_string())));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;

    use differential_core::protocol::{
        BatchStatusRow, ClaimedJobDto, CreateJobRequest, CreateJobResponse, EventIngestItem,
        JobStatusResponse, NextJobsRequest, PersistResultRequest,
    };
    use differential_core::JobStatus;

    use super::*;

    /// Control plane double whose batch reads are scripted per call.
    struct ScriptedControl {
        calls: AtomicU32,
        script: Box<dyn Fn(u32, &BatchStatusRequest) -> Result<Vec<BatchStatusRow>, ClientError> + Send + Sync>,
    }

    impl ScriptedControl {
        fn new(
            script: impl Fn(u32, &BatchStatusRequest) -> Result<Vec<BatchStatusRow>, ClientError>
                + Send
                + Sync
                + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                script: Box::new(script),
            })
        }
    }

    #[async_trait]
    impl ControlApi for ScriptedControl {
        async fn create_job(
            &self,
            _request: &CreateJobRequest,
        ) -> Result<CreateJobResponse, ClientError> {
            Err(ClientError::Transport("not scripted".to_string()))
        }

        async fn next_jobs(
            &self,
            _request: &NextJobsRequest,
        ) -> Result<Vec<ClaimedJobDto>, ClientError> {
            Err(ClientError::Transport("not scripted".to_string()))
        }

        async fn get_job_status(&self, _job_id: &str) -> Result<JobStatusResponse, ClientError> {
            Err(ClientError::Transport("not scripted".to_string()))
        }

        async fn get_job_statuses(
            &self,
            request: &BatchStatusRequest,
        ) -> Result<Vec<BatchStatusRow>, ClientError> {
            let call = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            (self.script)(call, request)
        }

        async fn persist_job_result(
            &self,
            _job_id: &str,
            _request: &PersistResultRequest,
        ) -> Result<(), ClientError> {
            Err(ClientError::Transport("not scripted".to_string()))
        }

        async fn ingest_events(&self, _items: &[EventIngestItem]) -> Result<(), ClientError> {
            Err(ClientError::Transport("not scripted".to_string()))
        }
    }

    fn fast_config() -> ResultsPollerConfig {
        ResultsPollerConfig {
            tick: Duration::from_millis(10),
            long_poll_timeout_ms: 5_000,
            rate_limit_backoff: Duration::from_millis(50),
            max_error_cycles: 3,
            max_cycles_per_job: 10,
        }
    }

    fn success_row(id: &str) -> BatchStatusRow {
        BatchStatusRow {
            id: id.to_string(),
            status: JobStatus::Success,
            result: Some(b"1".to_vec()),
            result_type: Some(differential_core::ResultType::Resolution),
        }
    }

    fn pending_row(id: &str) -> BatchStatusRow {
        BatchStatusRow {
            id: id.to_string(),
            status: JobStatus::Running,
            result: None,
            result_type: None,
        }
    }

    #[tokio::test]
    async fn waits_through_pending_cycles_until_terminal() {
        let control = ScriptedControl::new(|call, request| {
            assert_eq!(request.job_ids, vec!["j1".to_string()]);
            if call < 2 {
                Ok(vec![pending_row("j1")])
            } else {
                Ok(vec![success_row("j1")])
            }
        });
        let poller = ResultsPoller::start(control, fast_config());
        let row = poller.wait_for("j1").await.expect("row");
        assert_eq!(row.status, JobStatus::Success);
        assert_eq!(poller.outstanding(), 0);
        poller.stop().await;
    }

    #[tokio::test]
    async fn consecutive_error_cycles_fail_every_waiter() {
        let control =
            ScriptedControl::new(|_, _| Err(ClientError::Transport("down".to_string())));
        let poller = ResultsPoller::start(control, fast_config());
        let err = poller.wait_for("j1").await.unwrap_err();
        assert!(matches!(err, ClientError::TooManyNetworkErrors));
        poller.stop().await;
    }

    #[tokio::test]
    async fn outstanding_job_times_out_after_max_cycles() {
        let control = ScriptedControl::new(|_, _| Ok(vec![pending_row("j1")]));
        let poller = ResultsPoller::start(control, fast_config());
        let err = poller.wait_for("j1").await.unwrap_err();
        assert!(matches!(err, ClientError::JobTimeout));
        poller.stop().await;
    }

    #[tokio::test]
    async fn stop_releases_waiters() {
        let control = ScriptedControl::new(|_, _| Ok(vec![pending_row("j1")]));
        let poller = Arc::new(ResultsPoller::start(
            control,
            ResultsPollerConfig {
                max_cycles_per_job: 10_000,
                ..fast_config()
            },
        ));
        let waiter = {
            let poller = Arc::clone(&poller);
            tokio::spawn(async move { poller.wait_for("j1").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        poller.stop().await;
        let result = waiter.await.expect("join waiter");
        assert!(matches!(result, Err(ClientError::Transport(_))));
    }
}
