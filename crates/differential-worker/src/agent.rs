//! The polling agent: long-polls the dispatcher, feeds the task queue, and
//! posts results back to the control plane.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use differential_client::{ClientError, ControlApi};
use differential_core::protocol::{ClaimedJobDto, NextJobsRequest, PersistResultRequest};

use crate::env::{DEPLOYMENT_ID_ENV, DEPLOYMENT_PROVIDER_ENV};
use crate::registry::FunctionRegistry;
use crate::task_queue::{ExecutionOutcome, TaskQueue};

/// Provider name that flips the agent into serverless mode.
pub const SERVERLESS_PROVIDER: &str = "lambda";

/// Idle poll cycles a serverless worker tolerates before shutting down.
pub const SERVERLESS_MAX_IDLE_CYCLES: u32 = 2;

const QUIT_SPIN: Duration = Duration::from_millis(500);

#[derive(Clone, Debug)]
pub struct PollingAgentConfig {
    pub service: String,
    /// Maximum in-flight executions; tunable at runtime.
    pub concurrency: usize,
    /// Keepalive budget advertised on each poll; clamped to 5..=20 s.
    pub poll_ttl_seconds: u64,
    /// Minimum poll cadence: each cycle awaits the poll and this sleep
    /// together.
    pub throttle: Duration,
    /// Sleep applied when the queue is at capacity.
    pub idle_tick: Duration,
    pub max_consecutive_errors: u32,
    /// When set, the agent quits after this many consecutive empty polls.
    pub max_idle_cycles: Option<u32>,
    pub deployment_id: Option<String>,
}

impl PollingAgentConfig {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            concurrency: 100,
            poll_ttl_seconds: 20,
            throttle: Duration::from_secs(2),
            idle_tick: Duration::from_secs(2),
            max_consecutive_errors: 10,
            max_idle_cycles: None,
            deployment_id: None,
        }
    }

    /// Apply the worker environment contract: a serverless provider enables
    /// idle shutdown, and the deployment id pins the polls.
    pub fn with_env(self) -> Self {
        let mut envs = HashMap::new();
        for key in [DEPLOYMENT_PROVIDER_ENV, DEPLOYMENT_ID_ENV] {
            if let Ok(value) = std::env::var(key) {
                envs.insert(key.to_string(), value);
            }
        }
        self.apply_env_map(&envs)
    }

    pub fn apply_env_map(mut self, envs: &HashMap<String, String>) -> Self {
        if envs
            .get(DEPLOYMENT_PROVIDER_ENV)
            .map(|v| v.trim() == SERVERLESS_PROVIDER)
            .unwrap_or(false)
        {
            self.max_idle_cycles = Some(SERVERLESS_MAX_IDLE_CYCLES);
        }
        if let Some(deployment_id) = envs
            .get(DEPLOYMENT_ID_ENV)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
        {
            self.deployment_id = Some(deployment_id);
        }
        self
    }
}

pub struct PollingAgent {
    control: Arc<dyn ControlApi>,
    registry: Arc<FunctionRegistry>,
    config: PollingAgentConfig,
    queue: Arc<TaskQueue>,
    machine_id: String,
    concurrency: AtomicUsize,
    active: AtomicBool,
    polling_aborted: AtomicBool,
    cancel_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PollingAgent {
    pub fn new(
        control: Arc<dyn ControlApi>,
        registry: Arc<FunctionRegistry>,
        config: PollingAgentConfig,
    ) -> Arc<Self> {
        let (cancel_tx, _) = watch::channel(false);
        let concurrency = config.concurrency.max(1);
        Arc::new(Self {
            control,
            registry,
            config,
            queue: Arc::new(TaskQueue::new()),
            machine_id: differential_core::fresh_id(),
            concurrency: AtomicUsize::new(concurrency),
            active: AtomicBool::new(false),
            // True until a poll loop actually runs, so quitting an agent
            // that never started does not spin.
            polling_aborted: AtomicBool::new(true),
            cancel_tx,
            handle: Mutex::new(None),
        })
    }

    /// Machine identity minted for this agent instance; carried on every
    /// request as `x-machine-id` by the transport.
    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Adjust the concurrency cap; running tasks are never preempted.
    pub fn set_concurrency(&self, concurrency: usize) {
        self.concurrency.store(concurrency.max(1), Ordering::SeqCst);
    }

    pub fn start(self: &Arc<Self>) {
        if self.active.swap(true, Ordering::SeqCst) {
            return;
        }
        self.polling_aborted.store(false, Ordering::SeqCst);
        let agent = Arc::clone(self);
        let handle = tokio::spawn(async move { agent.run().await });
        if let Ok(mut guard) = self.handle.lock() {
            *guard = Some(handle);
        }
    }

    /// Await the poll loop's own exit (idle shutdown, fatal error).
    pub async fn join(&self) {
        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn run(self: Arc<Self>) {
        let mut cancel_rx = self.cancel_tx.subscribe();
        let mut consecutive_errors = 0u32;
        let mut idle_cycles = 0u32;
        let ttl = self.config.poll_ttl_seconds.clamp(5, 20);

        'poll: loop {
            if !self.active.load(Ordering::SeqCst) {
                break;
            }
            let capacity = self.concurrency.load(Ordering::SeqCst);
            let available = capacity.saturating_sub(self.queue.running_count());
            if available == 0 {
                tokio::select! {
                    _ = cancel_rx.changed() => break 'poll,
                    _ = tokio::time::sleep(self.config.idle_tick) => {}
                }
                continue;
            }

            let request = NextJobsRequest {
                service: self.config.service.clone(),
                limit: Some((available + 1) / 2),
                ttl: Some(ttl),
                deployment_id: self.config.deployment_id.clone(),
                functions: Some(self.registry.projection_for_service(&self.config.service)),
            };
            // The throttle rides alongside the poll so the loop cadence
            // never drops below it.
            let poll = async {
                let (outcome, _) = tokio::join!(
                    self.control.next_jobs(&request),
                    tokio::time::sleep(self.config.throttle)
                );
                outcome
            };
            let outcome = tokio::select! {
                _ = cancel_rx.changed() => break 'poll,
                outcome = poll => outcome,
            };

            match outcome {
                Ok(jobs) => {
                    consecutive_errors = 0;
                    if jobs.is_empty() {
                        idle_cycles += 1;
                        if let Some(max_idle) = self.config.max_idle_cycles {
                            if idle_cycles >= max_idle {
                                tracing::info!(
                                    service = %self.config.service,
                                    idle_cycles,
                                    "no pending work, shutting down"
                                );
                                break;
                            }
                        }
                    } else {
                        idle_cycles = 0;
                        for job in jobs {
                            self.dispatch(job);
                        }
                    }
                }
                Err(ClientError::Unauthorised) => {
                    tracing::error!(service = %self.config.service, "unauthorised, stopping agent");
                    break;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    tracing::warn!(
                        error = %e,
                        consecutive_errors,
                        "job poll failed"
                    );
                    if consecutive_errors >= self.config.max_consecutive_errors {
                        tracing::error!("too many consecutive poll errors, stopping agent");
                        break;
                    }
                }
            }
        }

        self.active.store(false, Ordering::SeqCst);
        self.polling_aborted.store(true, Ordering::SeqCst);
    }

    fn dispatch(&self, job: ClaimedJobDto) {
        let function = self
            .registry
            .get(&job.target_fn)
            .filter(|f| f.service == self.config.service);
        let Some(function) = function else {
            tracing::warn!(job_id = %job.id, target_fn = %job.target_fn, "unknown target function");
            post_result(
                Arc::clone(&self.control),
                job.id,
                ExecutionOutcome::rejection("Function was not registered", 0),
            );
            return;
        };

        let control = Arc::clone(&self.control);
        let job_id = job.id.clone();
        let enqueued = self.queue.add_task(
            Arc::clone(&function.handler),
            job.target_args,
            move |outcome| post_result(control, job_id, outcome),
        );
        if enqueued.is_err() {
            // The claim stays unresulted; the self-healer requeues it.
            tracing::warn!(job_id = %job.id, "task queue closed, leaving job to stall recovery");
        }
    }

    /// Stop polling and drain. Aborts the in-flight poll, refuses new tasks,
    /// spin-waits for the loop to acknowledge, then awaits running tasks.
    pub async fn quit(&self) {
        self.active.store(false, Ordering::SeqCst);
        let _ = self.cancel_tx.send(true);
        self.queue.close();
        while !self.polling_aborted.load(Ordering::SeqCst) {
            tokio::time::sleep(QUIT_SPIN).await;
        }
        self.queue.drain().await;
        self.join().await;
    }
}

/// Post an execution outcome; failures are logged and the job is left for
/// the self-healer.
fn post_result(control: Arc<dyn ControlApi>, job_id: String, outcome: ExecutionOutcome) {
    let request = PersistResultRequest {
        result: outcome.payload,
        result_type: outcome.result_type,
        function_execution_time_ms: Some(outcome.elapsed_ms),
    };
    tokio::spawn(async move {
        if let Err(e) = control.persist_job_result(&job_id, &request).await {
            tracing::warn!(job_id = %job_id, error = %e, "result post failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;

    use differential_core::protocol::{
        BatchStatusRequest, BatchStatusRow, CreateJobRequest, CreateJobResponse, EventIngestItem,
        JobStatusResponse,
    };
    use differential_core::ResultType;

    use super::*;

    /// Control-plane double: scripted poll batches, recorded result posts.
    struct FakePlane {
        polls: AtomicU32,
        batches: Mutex<VecDeque<Result<Vec<ClaimedJobDto>, ClientError>>>,
        posted: Mutex<Vec<(String, PersistResultRequest)>>,
        /// Returned once the scripted batches run out.
        fallback: fn() -> Result<Vec<ClaimedJobDto>, ClientError>,
    }

    impl FakePlane {
        fn new(
            batches: Vec<Result<Vec<ClaimedJobDto>, ClientError>>,
            fallback: fn() -> Result<Vec<ClaimedJobDto>, ClientError>,
        ) -> Arc<Self> {
            Arc::new(Self {
                polls: AtomicU32::new(0),
                batches: Mutex::new(batches.into()),
                posted: Mutex::new(Vec::new()),
                fallback,
            })
        }

        fn posted(&self) -> Vec<(String, PersistResultRequest)> {
            self.posted.lock().unwrap().clone()
        }

        fn poll_count(&self) -> u32 {
            self.polls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ControlApi for FakePlane {
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
            self.polls.fetch_add(1, Ordering::SeqCst);
            match self.batches.lock().unwrap().pop_front() {
                Some(batch) => batch,
                None => (self.fallback)(),
            }
        }

        async fn get_job_status(&self, _job_id: &str) -> Result<JobStatusResponse, ClientError> {
            Err(ClientError::Transport("not scripted".to_string()))
        }

        async fn get_job_statuses(
            &self,
            _request: &BatchStatusRequest,
        ) -> Result<Vec<BatchStatusRow>, ClientError> {
            Ok(Vec::new())
        }

        async fn persist_job_result(
            &self,
            job_id: &str,
            request: &PersistResultRequest,
        ) -> Result<(), ClientError> {
            self.posted
                .lock()
                .unwrap()
                .push((job_id.to_string(), request.clone()));
            Ok(())
        }

        async fn ingest_events(&self, _items: &[EventIngestItem]) -> Result<(), ClientError> {
            Ok(())
        }
    }

    fn fast_config(service: &str) -> PollingAgentConfig {
        let mut config = PollingAgentConfig::new(service);
        config.throttle = Duration::from_millis(10);
        config.idle_tick = Duration::from_millis(10);
        config
    }

    fn greeter_registry() -> Arc<FunctionRegistry> {
        let mut registry = FunctionRegistry::new();
        registry
            .register_fn("greeter", "hello", |_args| async move {
                Ok(b"\"Hello world\"".to_vec())
            })
            .unwrap();
        Arc::new(registry)
    }

    fn job(id: &str, target_fn: &str) -> ClaimedJobDto {
        ClaimedJobDto {
            id: id.to_string(),
            target_fn: target_fn.to_string(),
            target_args: b"{}".to_vec(),
        }
    }

    async fn wait_for_posts(plane: &FakePlane, count: usize) {
        for _ in 0..200 {
            if plane.posted().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {} result posts", count);
    }

    #[tokio::test]
    async fn claimed_job_is_executed_and_resulted() {
        let plane = FakePlane::new(vec![Ok(vec![job("j1", "hello")])], || Ok(Vec::new()));
        let agent = PollingAgent::new(plane.clone(), greeter_registry(), fast_config("greeter"));
        agent.start();
        wait_for_posts(&plane, 1).await;
        agent.quit().await;

        let posted = plane.posted();
        assert_eq!(posted[0].0, "j1");
        assert_eq!(posted[0].1.result_type, ResultType::Resolution);
        assert_eq!(posted[0].1.result, b"\"Hello world\"");
        assert!(posted[0].1.function_execution_time_ms.is_some());
    }

    #[tokio::test]
    async fn unknown_function_gets_a_synthetic_rejection() {
        let plane = FakePlane::new(vec![Ok(vec![job("j1", "ghost")])], || Ok(Vec::new()));
        let agent = PollingAgent::new(plane.clone(), greeter_registry(), fast_config("greeter"));
        agent.start();
        wait_for_posts(&plane, 1).await;
        agent.quit().await;

        let posted = plane.posted();
        assert_eq!(posted[0].1.result_type, ResultType::Rejection);
        let payload: serde_json::Value = serde_json::from_slice(&posted[0].1.result).unwrap();
        assert_eq!(payload["error"], "Function was not registered");
    }

    #[tokio::test]
    async fn serverless_agent_quits_after_idle_cycles() {
        let plane = FakePlane::new(Vec::new(), || Ok(Vec::new()));
        let mut config = fast_config("greeter");
        config.max_idle_cycles = Some(2);
        let agent = PollingAgent::new(plane.clone(), greeter_registry(), config);
        agent.start();
        agent.join().await;
        assert!(!agent.is_active());
        assert_eq!(plane.poll_count(), 2);
    }

    #[tokio::test]
    async fn unauthorised_poll_aborts_the_agent() {
        let plane = FakePlane::new(Vec::new(), || Err(ClientError::Unauthorised));
        let agent = PollingAgent::new(plane.clone(), greeter_registry(), fast_config("greeter"));
        agent.start();
        agent.join().await;
        assert!(!agent.is_active());
        assert_eq!(plane.poll_count(), 1);
    }

    #[tokio::test]
    async fn ten_consecutive_errors_stop_the_agent() {
        let plane = FakePlane::new(Vec::new(), || {
            Err(ClientError::Transport("connection refused".to_string()))
        });
        let agent = PollingAgent::new(plane.clone(), greeter_registry(), fast_config("greeter"));
        agent.start();
        agent.join().await;
        assert_eq!(plane.poll_count(), 10);
    }

    #[tokio::test]
    async fn one_successful_poll_resets_the_error_count() {
        let mut batches: Vec<Result<Vec<ClaimedJobDto>, ClientError>> = Vec::new();
        for _ in 0..9 {
            batches.push(Err(ClientError::Transport("down".to_string())));
        }
        batches.push(Ok(vec![job("j1", "hello")]));
        for _ in 0..9 {
            batches.push(Err(ClientError::Transport("down".to_string())));
        }
        let plane = FakePlane::new(batches, || Ok(Vec::new()));
        let mut config = fast_config("greeter");
        // Quit via idle cycles once the scripted batches run out.
        config.max_idle_cycles = Some(1);
        let agent = PollingAgent::new(plane.clone(), greeter_registry(), config);
        agent.start();
        agent.join().await;
        // 9 errors, 1 claim (resets the count), 9 more errors, then an empty
        // poll quits via the idle limit: the cap of 10 was never hit.
        assert_eq!(plane.poll_count(), 20);
    }

    #[test]
    fn env_contract_enables_serverless_mode() {
        let mut envs = HashMap::new();
        envs.insert(
            DEPLOYMENT_PROVIDER_ENV.to_string(),
            SERVERLESS_PROVIDER.to_string(),
        );
        envs.insert(DEPLOYMENT_ID_ENV.to_string(), "dep-1".to_string());
        let config = PollingAgentConfig::new("greeter").apply_env_map(&envs);
        assert_eq!(config.max_idle_cycles, Some(SERVERLESS_MAX_IDLE_CYCLES));
        assert_eq!(config.deployment_id.as_deref(), Some("dep-1"));

        let config = PollingAgentConfig::new("greeter").apply_env_map(&HashMap::new());
        assert_eq!(config.max_idle_cycles, None);
    }
}
