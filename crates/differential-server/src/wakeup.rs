//! Wake-up notifier: asks a serverless deployment provider to start a worker
//! when a service has pending jobs and no live machines.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use differential_core::{Deployment, EventKind, JobEvent};

use crate::state::AppState;

#[derive(Debug, Error)]
#[error("deployment provider error: {0}")]
pub struct ProviderError(pub String);

/// Provider-specific deployment plumbing. The engine only ever calls
/// `notify`; create/update are exercised by the deployment pipeline, which
/// lives outside this service.
#[async_trait]
pub trait DeploymentProvider: Send + Sync {
    fn name(&self) -> &str;
    /// JSON schema of the provider's deployment configuration, for tooling.
    fn schema(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
    /// Debounce floor between notifications for one deployment.
    fn minimum_notification_interval(&self) -> Duration;
    async fn create(&self, deployment: &Deployment) -> Result<(), ProviderError>;
    async fn update(&self, deployment: &Deployment) -> Result<(), ProviderError>;
    async fn notify(
        &self,
        deployment: &Deployment,
        pending_jobs: u64,
        running_machines: u64,
    ) -> Result<(), ProviderError>;
}

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn DeploymentProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, provider: Arc<dyn DeploymentProvider>) -> Self {
        self.providers.insert(provider.name().to_string(), provider);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn DeploymentProvider>> {
        self.providers.get(name)
    }
}

/// Observes queue depth and machine liveness, debouncing provider wake-ups
/// per deployment.
pub struct WakeupNotifier {
    state: AppState,
    providers: ProviderRegistry,
    last_notified: Mutex<HashMap<String, Instant>>,
}

impl WakeupNotifier {
    pub fn new(state: AppState, providers: ProviderRegistry) -> Self {
        Self {
            state,
            providers,
            last_notified: Mutex::new(HashMap::new()),
        }
    }

    /// One observation pass; returns the deployments notified.
    pub async fn tick(&self) -> Vec<String> {
        let activity = match self.state.store.cluster_activity(
            Utc::now(),
            self.state.config.machine_liveness_horizon_seconds,
        ) {
            Ok(activity) => activity,
            Err(e) => {
                tracing::error!(error = %e, "cluster activity scan failed");
                return Vec::new();
            }
        };

        let mut notified = Vec::new();
        for entry in activity {
            if entry.pending_jobs == 0 || entry.live_machines > 0 {
                continue;
            }
            let deployment = match self
                .state
                .store
                .active_deployment(&entry.cluster_id, &entry.service)
            {
                Ok(Some(deployment)) => deployment,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(error = %e, "active deployment lookup failed");
                    continue;
                }
            };
            let Some(provider) = self.providers.get(&deployment.provider) else {
                tracing::warn!(
                    provider = %deployment.provider,
                    deployment = %deployment.id,
                    "no provider registered for active deployment"
                );
                continue;
            };

            {
                let mut last = self.last_notified.lock().await;
                let now = Instant::now();
                if let Some(at) = last.get(&deployment.id) {
                    if now.duration_since(*at) < provider.minimum_notification_interval() {
                        continue;
                    }
                }
                last.insert(deployment.id.clone(), now);
            }

            match provider
                .notify(&deployment, entry.pending_jobs, entry.live_machines)
                .await
            {
                Ok(()) => {
                    self.state.emit(JobEvent {
                        kind: EventKind::DeploymentNotified,
                        cluster_id: entry.cluster_id.clone(),
                        job_id: None,
                        machine_id: None,
                        deployment_id: Some(deployment.id.clone()),
                        service: Some(entry.service.clone()),
                        meta: Some(serde_json::json!({
                            "pendingJobs": entry.pending_jobs,
                        })),
                        created_at: Utc::now(),
                    });
                    notified.push(deployment.id);
                }
                Err(e) => {
                    tracing::warn!(deployment = %deployment.id, error = %e, "wake-up notify failed");
                }
            }
        }
        notified
    }

    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.state.config.wakeup_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use differential_core::{CallConfig, TracingEventSink};
    use differential_store::SqliteJobStore;

    use super::*;
    use crate::config::ServerConfig;

    struct RecordingProvider {
        notifications: AtomicUsize,
        min_interval: Duration,
    }

    impl RecordingProvider {
        fn new(min_interval: Duration) -> Self {
            Self {
                notifications: AtomicUsize::new(0),
                min_interval,
            }
        }
    }

    #[async_trait]
    impl DeploymentProvider for RecordingProvider {
        fn name(&self) -> &str {
            "mock"
        }

        fn minimum_notification_interval(&self) -> Duration {
            self.min_interval
        }

        async fn create(&self, _deployment: &Deployment) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn update(&self, _deployment: &Deployment) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn notify(
            &self,
            _deployment: &Deployment,
            pending_jobs: u64,
            running_machines: u64,
        ) -> Result<(), ProviderError> {
            assert!(pending_jobs > 0);
            assert_eq!(running_machines, 0);
            self.notifications.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn temp_store(name: &str) -> SqliteJobStore {
        let path = std::env::temp_dir().join(format!(
            "differential-wakeup-{}-{}.db",
            name,
            uuid::Uuid::new_v4()
        ));
        SqliteJobStore::new(&path.to_string_lossy()).expect("open store")
    }

    fn state_with(store: SqliteJobStore) -> AppState {
        AppState::new(store, Arc::new(TracingEventSink), ServerConfig::default())
    }

    #[tokio::test]
    async fn notifies_once_per_debounce_window() {
        let store = temp_store("debounce");
        store.create_cluster("c1", "s1", true).unwrap();
        let cluster = store.get_cluster("c1").unwrap().unwrap();
        store
            .create_job(
                &cluster,
                "orders",
                "create",
                b"{}",
                &CallConfig::default(),
                Utc::now(),
            )
            .unwrap();
        let deployment = store
            .create_deployment("c1", "orders", "mock", Utc::now())
            .unwrap();
        store
            .release_deployment("c1", "orders", &deployment.id)
            .unwrap();

        let provider = Arc::new(RecordingProvider::new(Duration::from_secs(10)));
        let registry = ProviderRegistry::new().register(provider.clone());
        let notifier = WakeupNotifier::new(state_with(store), registry);

        assert_eq!(notifier.tick().await, vec![deployment.id.clone()]);
        // Inside the debounce window nothing fires again.
        assert!(notifier.tick().await.is_empty());
        assert_eq!(provider.notifications.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn live_machines_suppress_wakeup() {
        let store = temp_store("live");
        store.create_cluster("c1", "s1", true).unwrap();
        let cluster = store.get_cluster("c1").unwrap().unwrap();
        store
            .create_job(
                &cluster,
                "orders",
                "create",
                b"{}",
                &CallConfig::default(),
                Utc::now(),
            )
            .unwrap();
        let deployment = store
            .create_deployment("c1", "orders", "mock", Utc::now())
            .unwrap();
        store
            .release_deployment("c1", "orders", &deployment.id)
            .unwrap();
        store
            .record_machine_ping("c1", "m1", Some("orders"), None, None, Utc::now())
            .unwrap();

        let provider = Arc::new(RecordingProvider::new(Duration::from_secs(10)));
        let registry = ProviderRegistry::new().register(provider.clone());
        let notifier = WakeupNotifier::new(state_with(store), registry);
        assert!(notifier.tick().await.is_empty());
        assert_eq!(provider.notifications.load(Ordering::SeqCst), 0);
    }
}
