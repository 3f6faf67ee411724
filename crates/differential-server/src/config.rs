//! Control-plane configuration from the environment.

use std::collections::HashMap;
use std::time::Duration;

/// Stall threshold applied when a job carries no timeout of its own.
pub const DEFAULT_JOB_TIMEOUT_SECONDS: u64 = 30;

/// A machine counts as live when it pinged within this horizon.
pub const MACHINE_LIVENESS_HORIZON_SECONDS: u64 = 90;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub default_job_timeout_seconds: u64,
    pub machine_liveness_horizon_seconds: u64,
    pub healer_interval: Duration,
    pub wakeup_interval: Duration,
    /// Base URL deployments advertise for bundle uploads; the signer itself
    /// lives outside this service.
    pub package_upload_base: Option<String>,
    pub default_deployment_provider: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:4000".to_string(),
            default_job_timeout_seconds: DEFAULT_JOB_TIMEOUT_SECONDS,
            machine_liveness_horizon_seconds: MACHINE_LIVENESS_HORIZON_SECONDS,
            healer_interval: Duration::from_secs(5),
            wakeup_interval: Duration::from_secs(5),
            package_upload_base: None,
            default_deployment_provider: "lambda".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let mut envs = HashMap::new();
        for key in [
            "DIFFERENTIAL_SERVER_ADDR",
            "DIFFERENTIAL_JOB_TIMEOUT_SECONDS",
            "DIFFERENTIAL_UPLOAD_BASE_URL",
            "DIFFERENTIAL_DEPLOYMENT_PROVIDER",
        ] {
            if let Ok(value) = std::env::var(key) {
                envs.insert(key.to_string(), value);
            }
        }
        Self::from_env_map(&envs)
    }

    fn from_env_map(envs: &HashMap<String, String>) -> Self {
        let mut config = Self::default();
        if let Some(addr) = non_empty(envs.get("DIFFERENTIAL_SERVER_ADDR")) {
            config.listen_addr = addr;
        }
        if let Some(timeout) = non_empty(envs.get("DIFFERENTIAL_JOB_TIMEOUT_SECONDS")) {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.default_job_timeout_seconds = seconds.max(1);
            }
        }
        config.package_upload_base = non_empty(envs.get("DIFFERENTIAL_UPLOAD_BASE_URL"));
        if let Some(provider) = non_empty(envs.get("DIFFERENTIAL_DEPLOYMENT_PROVIDER")) {
            config.default_deployment_provider = provider;
        }
        config
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_apply() {
        let mut envs = HashMap::new();
        envs.insert(
            "DIFFERENTIAL_SERVER_ADDR".to_string(),
            "0.0.0.0:8080".to_string(),
        );
        envs.insert(
            "DIFFERENTIAL_JOB_TIMEOUT_SECONDS".to_string(),
            "120".to_string(),
        );
        let config = ServerConfig::from_env_map(&envs);
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.default_job_timeout_seconds, 120);
        assert_eq!(config.package_upload_base, None);
    }

    #[test]
    fn malformed_timeout_keeps_the_default() {
        let mut envs = HashMap::new();
        envs.insert(
            "DIFFERENTIAL_JOB_TIMEOUT_SECONDS".to_string(),
            "soon".to_string(),
        );
        let config = ServerConfig::from_env_map(&envs);
        assert_eq!(
            config.default_job_timeout_seconds,
            DEFAULT_JOB_TIMEOUT_SECONDS
        );
    }
}
