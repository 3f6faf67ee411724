//! Store configuration resolved from the environment.

use std::collections::HashMap;

/// Where the job store lives. Resolved once at startup; the health check
/// opens the database so a bad path fails the boot, not the first request.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub sqlite_db_path: String,
}

impl StoreConfig {
    pub fn from_env(default_sqlite_db_path: &str) -> Self {
        let mut envs = HashMap::new();
        for key in ["DIFFERENTIAL_SQLITE_DB"] {
            if let Ok(value) = std::env::var(key) {
                envs.insert(key.to_string(), value);
            }
        }
        Self::from_env_map(default_sqlite_db_path, &envs)
    }

    fn from_env_map(default_sqlite_db_path: &str, envs: &HashMap<String, String>) -> Self {
        let sqlite_db_path = envs
            .get("DIFFERENTIAL_SQLITE_DB")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| default_sqlite_db_path.to_string());
        Self { sqlite_db_path }
    }

    /// Open the database once so startup fails loudly on a bad path.
    pub fn startup_health_check(&self) -> Result<(), String> {
        crate::sqlite::SqliteJobStore::new(&self.sqlite_db_path)
            .map(|_| ())
            .map_err(|e| {
                format!(
                    "store health check failed for DIFFERENTIAL_SQLITE_DB='{}': {}",
                    self.sqlite_db_path, e
                )
            })
    }
}
