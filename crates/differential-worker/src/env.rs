//! Worker environment contract.

/// Shared cluster secret the worker authenticates with.
pub const API_SECRET_ENV: &str = "DIFFERENTIAL_API_SECRET";

/// Deployment this worker instance was started from, if any.
pub const DEPLOYMENT_ID_ENV: &str = "DIFFERENTIAL_DEPLOYMENT_ID";

/// Provider that started this worker. When it names the serverless provider,
/// the agent enables idle shutdown.
pub const DEPLOYMENT_PROVIDER_ENV: &str = "DIFFERENTIAL_DEPLOYMENT_PROVIDER";

pub fn api_secret() -> Option<String> {
    std::env::var(API_SECRET_ENV)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
