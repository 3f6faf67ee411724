//! Service definitions: the per-cluster catalogue of registered functions.
//!
//! Workers upsert their definition on every successful poll; admission and
//! the wake-up notifier read it. Definitions are advisory metadata, not an
//! execution gate.

use serde::{Deserialize, Serialize};

/// Rate hint for a function (enforcement is a control-plane concern).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRate {
    /// Window unit, e.g. "minute" or "hour".
    pub per: String,
    pub limit: u32,
}

/// Stall-retry configuration a worker declares for a function.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionRetryConfig {
    pub retry_count_on_stall: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub predictive_retries_on_rejection: bool,
}

/// One registered function inside a service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSpec {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotent: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<FunctionRate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_ttl_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_config: Option<FunctionRetryConfig>,
}

impl FunctionSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            idempotent: None,
            rate: None,
            cache_ttl_seconds: None,
            retry_config: None,
        }
    }
}

/// The function set a service exposes within one cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub name: String,
    pub functions: Vec<FunctionSpec>,
}

impl ServiceDefinition {
    pub fn function(&self, name: &str) -> Option<&FunctionSpec> {
        self.functions.iter().find(|f| f.name == name)
    }
}
