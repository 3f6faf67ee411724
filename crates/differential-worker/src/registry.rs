//! Process-level function registry.
//!
//! Populated during startup registration, read-only once the agent starts.
//! Function names are unique per registry; a collision is a registration
//! error, not a shadowing.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use differential_core::{FunctionRetryConfig, FunctionSpec};

use crate::error::WorkerError;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Vec<u8>, String>> + Send>>;

/// A registered function body: packed args in, packed result out, error as a
/// message that becomes the rejection payload.
pub type Handler = Arc<dyn Fn(Vec<u8>) -> HandlerFuture + Send + Sync>;

pub struct RegisteredFunction {
    pub name: String,
    pub service: String,
    pub handler: Handler,
    pub idempotent: Option<bool>,
    pub retry_config: Option<FunctionRetryConfig>,
}

#[derive(Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, RegisteredFunction>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, function: RegisteredFunction) -> Result<(), WorkerError> {
        if self.functions.contains_key(&function.name) {
            return Err(WorkerError::AlreadyRegistered(function.name));
        }
        self.functions.insert(function.name.clone(), function);
        Ok(())
    }

    /// Convenience registration for a plain async closure.
    pub fn register_fn<F, Fut>(
        &mut self,
        service: impl Into<String>,
        name: impl Into<String>,
        handler: F,
    ) -> Result<(), WorkerError>
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>, String>> + Send + 'static,
    {
        self.register(RegisteredFunction {
            name: name.into(),
            service: service.into(),
            handler: Arc::new(move |args| Box::pin(handler(args))),
            idempotent: None,
            retry_config: None,
        })
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredFunction> {
        self.functions.get(name)
    }

    /// The projection sent to the dispatcher on every poll: names plus the
    /// per-function metadata the control plane stores as the service
    /// definition.
    pub fn projection_for_service(&self, service: &str) -> Vec<FunctionSpec> {
        let mut specs: Vec<FunctionSpec> = self
            .functions
            .values()
            .filter(|f| f.service == service)
            .map(|f| FunctionSpec {
                name: f.name.clone(),
                idempotent: f.idempotent,
                rate: None,
                cache_ttl_seconds: None,
                retry_config: f.retry_config.clone(),
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
