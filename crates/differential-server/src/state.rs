//! Shared handler state.

use std::sync::Arc;

use differential_core::{EventSink, JobEvent};
use differential_store::SqliteJobStore;

use crate::config::ServerConfig;

#[derive(Clone)]
pub struct AppState {
    pub store: SqliteJobStore,
    pub events: Arc<dyn EventSink>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(store: SqliteJobStore, events: Arc<dyn EventSink>, config: ServerConfig) -> Self {
        Self {
            store,
            events,
            config: Arc::new(config),
        }
    }

    pub fn emit(&self, event: JobEvent) {
        self.events.emit(event);
    }
}
