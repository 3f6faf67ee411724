//! SQLite-backed job store.
//!
//! One connection behind a mutex; every multi-statement mutation runs in a
//! transaction. Claim contention surfaces as zero-row conditional updates,
//! which the claim loop skips, so concurrent polls never observe the same
//! attempt of a job.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension};
use sha2::{Digest, Sha256};

use differential_core::{
    CallConfig, ClaimedJob, Cluster, Deployment, DeploymentStatus, EventKind, EventSink, Job,
    JobEvent, JobResult, JobStatus, JobStatusRow, ResultType, ServiceDefinition, StoreError,
};

pub const SCHEMA_VERSION: i64 = 3;

/// Synthetic rejection payload for jobs that stall with no attempts left.
const STALL_PAYLOAD: &[u8] = br#"{"error":"stalled: no attempts remaining"}"#;

#[derive(Clone, Debug)]
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

/// Admission result: the surviving job id, and whether this call inserted it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Admission {
    pub id: String,
    pub created: bool,
}

/// A job touched by a stall sweep, with enough context to emit events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StalledJob {
    pub id: String,
    pub cluster_id: String,
    pub service: String,
}

/// Outcome of one self-heal pass.
#[derive(Clone, Debug, Default)]
pub struct StallSweep {
    pub requeued: Vec<StalledJob>,
    pub terminalized: Vec<StalledJob>,
}

/// Pending-work snapshot for one `(cluster, service)`, read by the wake-up
/// notifier. Passing this view around keeps the notifier off the store's
/// internals.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterActivity {
    pub cluster_id: String,
    pub service: String,
    pub pending_jobs: u64,
    pub live_machines: u64,
}

impl SqliteJobStore {
    pub fn new(db_path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)
            .map_err(|e| StoreError::storage("open sqlite job store", e))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Storage("sqlite job store lock poisoned".to_string()))
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        ensure_migration_table(&conn)?;
        let current = current_schema_version(&conn)?;
        if current > SCHEMA_VERSION {
            return Err(StoreError::Storage(format!(
                "sqlite schema version {} is newer than supported {}",
                current, SCHEMA_VERSION
            )));
        }
        if current < 1 {
            apply_migration_v1(&conn)?;
            record_migration(&conn, 1, "baseline_job_tables")?;
        }
        if current < 2 {
            apply_migration_v2(&conn)?;
            record_migration(&conn, 2, "deployments")?;
        }
        if current < 3 {
            apply_migration_v3(&conn)?;
            record_migration(&conn, 3, "job_deployment_pin")?;
        }
        Ok(())
    }

    // ----- clusters -----

    pub fn create_cluster(
        &self,
        cluster_id: &str,
        secret: &str,
        operational: bool,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO clusters
             (id, secret_hash, operational, predictive_retries_enabled, auto_retry_stalled_jobs, created_at_ms)
             VALUES (?1, ?2, ?3, 0, 1, ?4)
             ON CONFLICT(id) DO UPDATE SET secret_hash = excluded.secret_hash,
                                           operational = excluded.operational",
            params![cluster_id, secret_digest(secret), operational, dt_to_ms(Utc::now())],
        )
        .map_err(|e| StoreError::storage("create cluster", e))?;
        Ok(())
    }

    /// Resolve a cluster from its shared secret; this is the bearer-auth path.
    pub fn cluster_by_secret(&self, secret: &str) -> Result<Option<Cluster>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, secret_hash, operational, predictive_retries_enabled, auto_retry_stalled_jobs
             FROM clusters WHERE secret_hash = ?1",
            params![secret_digest(secret)],
            map_cluster_row,
        )
        .optional()
        .map_err(|e| StoreError::storage("resolve cluster by secret", e))
    }

    pub fn get_cluster(&self, cluster_id: &str) -> Result<Option<Cluster>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, secret_hash, operational, predictive_retries_enabled, auto_retry_stalled_jobs
             FROM clusters WHERE id = ?1",
            params![cluster_id],
            map_cluster_row,
        )
        .optional()
        .map_err(|e| StoreError::storage("get cluster", e))
    }

    // ----- admission -----

    /// Admit a job. Cache-keyed admission probes for a fresh successful
    /// resolution first; idempotency-key collisions return the surviving row.
    pub fn create_job(
        &self,
        cluster: &Cluster,
        service: &str,
        target_fn: &str,
        target_args: &[u8],
        config: &CallConfig,
        now: DateTime<Utc>,
    ) -> Result<Admission, StoreError> {
        if !cluster.operational {
            return Err(StoreError::Forbidden(format!(
                "cluster {} is not operational",
                cluster.id
            )));
        }
        if target_fn.trim().is_empty() {
            return Err(StoreError::InvalidArgument(
                "targetFn must not be empty".to_string(),
            ));
        }
        if service.trim().is_empty() {
            return Err(StoreError::InvalidArgument(
                "service must not be empty".to_string(),
            ));
        }

        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::storage("begin admission tx", e))?;

        if let (Some(cache_key), Some(ttl)) = (&config.cache_key, config.cache_ttl_seconds) {
            let fresh_after = dt_to_ms(now) - (ttl as i64) * 1000;
            let cached: Option<String> = tx
                .query_row(
                    "SELECT id FROM jobs
                     WHERE cluster_id = ?1 AND service = ?2 AND target_fn = ?3
                       AND cache_key = ?4 AND status = 'success'
                       AND result_type = 'resolution' AND resulted_at_ms >= ?5
                     ORDER BY resulted_at_ms DESC, id DESC
                     LIMIT 1",
                    params![cluster.id, service, target_fn, cache_key, fresh_after],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| StoreError::storage("probe job cache", e))?;
            if let Some(id) = cached {
                tx.commit()
                    .map_err(|e| StoreError::storage("commit cache-hit admission", e))?;
                return Ok(Admission { id, created: false });
            }
        }

        let id = config
            .execution_id
            .clone()
            .unwrap_or_else(differential_core::fresh_id);
        let idempotency_key = config.idempotency_key.clone().unwrap_or_else(|| id.clone());
        let inserted = match tx.execute(
            "INSERT INTO jobs
             (id, cluster_id, service, target_fn, target_args, status, idempotency_key,
              cache_key, remaining_attempts, timeout_interval_seconds,
              predictive_retries_on_rejection, deployment_id, created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
             ON CONFLICT(cluster_id, target_fn, idempotency_key) DO NOTHING",
            params![
                id,
                cluster.id,
                service,
                target_fn,
                target_args,
                idempotency_key,
                config.cache_key,
                config.initial_attempts() as i64,
                config.timeout_seconds.map(|v| v as i64),
                config.predictive_retries_on_rejection.unwrap_or(false),
                config.deployment_id,
                dt_to_ms(now)
            ],
        ) {
            Ok(changed) => changed == 1,
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                return Err(StoreError::Conflict(format!(
                    "job id already exists: {}",
                    id
                )));
            }
            Err(e) => return Err(StoreError::storage("insert job", e)),
        };

        let surviving_id = if inserted {
            id
        } else {
            // Idempotency-key collision: the existing row wins, whatever its
            // state. The caller gets its id back.
            tx.query_row(
                "SELECT id FROM jobs
                 WHERE cluster_id = ?1 AND target_fn = ?2 AND idempotency_key = ?3",
                params![cluster.id, target_fn, idempotency_key],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::storage("read surviving job for idempotency key", e))?
        };

        tx.commit()
            .map_err(|e| StoreError::storage("commit admission tx", e))?;
        Ok(Admission {
            id: surviving_id,
            created: inserted,
        })
    }

    // ----- dispatch -----

    /// Claim up to `limit` jobs for a polling machine. Selection is id order
    /// (creation order); each row transitions atomically to `running` with
    /// its attempt spent, or is skipped if another poll got there first.
    pub fn next_jobs(
        &self,
        cluster_id: &str,
        service: &str,
        machine_id: &str,
        deployment_id: Option<&str>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedJob>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::storage("begin claim tx", e))?;

        let mut candidates: Vec<ClaimedJob> = Vec::new();
        {
            let mut stmt = tx
                .prepare(
                    "SELECT id, target_fn, target_args FROM jobs
                     WHERE cluster_id = ?1 AND service = ?2
                       AND status IN ('pending', 'failure')
                       AND remaining_attempts > 0
                       AND (deployment_id IS NULL OR deployment_id = ?3)
                     ORDER BY id ASC
                     LIMIT ?4",
                )
                .map_err(|e| StoreError::storage("prepare claim candidates", e))?;
            let rows = stmt
                .query_map(
                    params![cluster_id, service, deployment_id, limit as i64],
                    |row| {
                        Ok(ClaimedJob {
                            id: row.get(0)?,
                            target_fn: row.get(1)?,
                            target_args: row.get(2)?,
                        })
                    },
                )
                .map_err(|e| StoreError::storage("query claim candidates", e))?;
            for row in rows {
                candidates.push(row.map_err(|e| StoreError::storage("scan claim candidate", e))?);
            }
        }

        let mut claimed = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let changed = tx
                .execute(
                    "UPDATE jobs
                     SET status = 'running',
                         remaining_attempts = remaining_attempts - 1,
                         last_retrieved_at_ms = ?2,
                         updated_at_ms = ?2,
                         executing_machine_id = ?3
                     WHERE id = ?1
                       AND status IN ('pending', 'failure')
                       AND remaining_attempts > 0",
                    params![candidate.id, dt_to_ms(now), machine_id],
                )
                .map_err(|e| StoreError::storage("claim job", e))?;
            if changed == 1 {
                claimed.push(candidate);
            }
        }

        tx.commit()
            .map_err(|e| StoreError::storage("commit claim tx", e))?;
        Ok(claimed)
    }

    // ----- machines -----

    pub fn record_machine_ping(
        &self,
        cluster_id: &str,
        machine_id: &str,
        service: Option<&str>,
        ip: Option<&str>,
        deployment_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO machines (id, cluster_id, service, ip, deployment_id, last_ping_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id, cluster_id) DO UPDATE SET
               service = excluded.service,
               ip = COALESCE(excluded.ip, machines.ip),
               deployment_id = excluded.deployment_id,
               last_ping_at_ms = excluded.last_ping_at_ms",
            params![
                machine_id,
                cluster_id,
                service,
                ip,
                deployment_id,
                dt_to_ms(now)
            ],
        )
        .map_err(|e| StoreError::storage("record machine ping", e))?;
        Ok(())
    }

    pub fn live_machine_count(
        &self,
        cluster_id: &str,
        service: &str,
        now: DateTime<Utc>,
        horizon_seconds: u64,
    ) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let cutoff = dt_to_ms(now) - (horizon_seconds as i64) * 1000;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM machines
                 WHERE cluster_id = ?1 AND service = ?2 AND last_ping_at_ms >= ?3",
                params![cluster_id, service, cutoff],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::storage("count live machines", e))?;
        Ok(count.max(0) as u64)
    }

    // ----- service definitions -----

    pub fn upsert_service_definition(
        &self,
        cluster_id: &str,
        definition: &ServiceDefinition,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let payload = serde_json::to_string(definition)
            .map_err(|e| StoreError::storage("encode service definition", e))?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO service_definitions (cluster_id, service, definition, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(cluster_id, service) DO UPDATE SET
               definition = excluded.definition,
               updated_at_ms = excluded.updated_at_ms",
            params![cluster_id, definition.name, payload, dt_to_ms(now)],
        )
        .map_err(|e| StoreError::storage("upsert service definition", e))?;
        Ok(())
    }

    pub fn get_service_definition(
        &self,
        cluster_id: &str,
        service: &str,
    ) -> Result<Option<ServiceDefinition>, StoreError> {
        let conn = self.lock()?;
        let payload: Option<String> = conn
            .query_row(
                "SELECT definition FROM service_definitions
                 WHERE cluster_id = ?1 AND service = ?2",
                params![cluster_id, service],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::storage("get service definition", e))?;
        match payload {
            Some(payload) => serde_json::from_str(&payload)
                .map(Some)
                .map_err(|e| StoreError::storage("decode service definition", e)),
            None => Ok(None),
        }
    }

    // ----- results -----

    /// Persist an execution result. Only a `running` job transitions; a job
    /// that already terminated absorbs the re-post as a no-op (`Ok(false)`)
    /// and never reopens.
    pub fn persist_result(
        &self,
        cluster_id: &str,
        job_id: &str,
        result: &JobResult,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::storage("begin result tx", e))?;

        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM jobs WHERE id = ?1 AND cluster_id = ?2",
                params![job_id, cluster_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::storage("read job for result", e))?;
        let Some(status) = status else {
            return Err(StoreError::NotFound(format!("unknown job: {}", job_id)));
        };
        match JobStatus::from_str(&status) {
            Some(JobStatus::Success) => {
                // Already terminated; the repeated post is absorbed.
                tx.commit()
                    .map_err(|e| StoreError::storage("commit no-op result tx", e))?;
                return Ok(false);
            }
            Some(JobStatus::Running) => {}
            Some(other) => {
                return Err(StoreError::Conflict(format!(
                    "job {} is {}, not running",
                    job_id, other
                )));
            }
            None => {
                return Err(StoreError::Storage(format!(
                    "job {} has unknown status '{}'",
                    job_id, status
                )));
            }
        }

        tx.execute(
            "UPDATE jobs
             SET status = 'success',
                 result = ?2,
                 result_type = ?3,
                 resulted_at_ms = ?4,
                 updated_at_ms = ?4,
                 function_execution_time_ms = ?5,
                 executing_machine_id = NULL
             WHERE id = ?1",
            params![
                job_id,
                result.result,
                result.result_type.as_str(),
                dt_to_ms(now),
                result.function_execution_time_ms.map(|v| v as i64)
            ],
        )
        .map_err(|e| StoreError::storage("persist job result", e))?;
        tx.commit()
            .map_err(|e| StoreError::storage("commit result tx", e))?;
        Ok(true)
    }

    // ----- status reads -----

    pub fn get_job_status(
        &self,
        cluster_id: &str,
        job_id: &str,
    ) -> Result<Option<JobStatusRow>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, status, result, result_type FROM jobs
             WHERE id = ?1 AND cluster_id = ?2",
            params![job_id, cluster_id],
            map_status_row,
        )
        .optional()
        .map_err(|e| StoreError::storage("get job status", e))
    }

    /// Batched status read. Unknown ids are silently omitted; rows never
    /// cross the cluster boundary.
    pub fn get_job_statuses(
        &self,
        cluster_id: &str,
        job_ids: &[String],
    ) -> Result<Vec<JobStatusRow>, StoreError> {
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;
        let placeholders = vec!["?"; job_ids.len()].join(", ");
        let sql = format!(
            "SELECT id, status, result, result_type FROM jobs
             WHERE cluster_id = ? AND id IN ({})
             ORDER BY id ASC",
            placeholders
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| StoreError::storage("prepare batched status read", e))?;
        let bind = std::iter::once(cluster_id.to_string()).chain(job_ids.iter().cloned());
        let rows = stmt
            .query_map(params_from_iter(bind), map_status_row)
            .map_err(|e| StoreError::storage("query batched statuses", e))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| StoreError::storage("scan status row", e))?);
        }
        Ok(out)
    }

    /// Full row read, mostly for diagnostics and tests.
    pub fn get_job(&self, cluster_id: &str, job_id: &str) -> Result<Option<Job>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, cluster_id, service, target_fn, target_args, status, result,
                    result_type, idempotency_key, cache_key, remaining_attempts,
                    timeout_interval_seconds, predictive_retries_on_rejection,
                    executing_machine_id, deployment_id, created_at_ms, updated_at_ms,
                    last_retrieved_at_ms, resulted_at_ms, function_execution_time_ms
             FROM jobs WHERE id = ?1 AND cluster_id = ?2",
            params![job_id, cluster_id],
            map_job_row,
        )
        .optional()
        .map_err(|e| StoreError::storage("get job", e))
    }

    // ----- stall recovery -----

    /// Requeue running jobs whose last claim exceeded their timeout, and
    /// terminalize those with no attempts left. Idempotent within a window:
    /// requeued rows are no longer `running`, so a second pass skips them.
    pub fn recover_stalled_jobs(
        &self,
        default_timeout_seconds: u64,
        now: DateTime<Utc>,
    ) -> Result<StallSweep, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::storage("begin stall sweep tx", e))?;

        let mut stalled: Vec<(StalledJob, u32)> = Vec::new();
        {
            let mut stmt = tx
                .prepare(
                    "SELECT id, cluster_id, service, remaining_attempts FROM jobs
                     WHERE status = 'running'
                       AND last_retrieved_at_ms IS NOT NULL
                       AND last_retrieved_at_ms
                           + MAX(COALESCE(timeout_interval_seconds, ?1), ?1) * 1000 <= ?2",
                )
                .map_err(|e| StoreError::storage("prepare stall scan", e))?;
            let rows = stmt
                .query_map(
                    params![default_timeout_seconds as i64, dt_to_ms(now)],
                    |row| {
                        Ok((
                            StalledJob {
                                id: row.get(0)?,
                                cluster_id: row.get(1)?,
                                service: row.get(2)?,
                            },
                            row.get::<_, i64>(3)?.max(0) as u32,
                        ))
                    },
                )
                .map_err(|e| StoreError::storage("query stalled jobs", e))?;
            for row in rows {
                stalled.push(row.map_err(|e| StoreError::storage("scan stalled job", e))?);
            }
        }

        let mut sweep = StallSweep::default();
        for (job, remaining_attempts) in stalled {
            if remaining_attempts > 0 {
                // The attempt was spent at claim time; requeue without
                // touching the counter.
                tx.execute(
                    "UPDATE jobs
                     SET status = 'pending', executing_machine_id = NULL, updated_at_ms = ?2
                     WHERE id = ?1 AND status = 'running'",
                    params![job.id, dt_to_ms(now)],
                )
                .map_err(|e| StoreError::storage("requeue stalled job", e))?;
                sweep.requeued.push(job);
            } else {
                tx.execute(
                    "UPDATE jobs
                     SET status = 'success',
                         result = ?2,
                         result_type = 'rejection',
                         resulted_at_ms = ?3,
                         updated_at_ms = ?3,
                         executing_machine_id = NULL
                     WHERE id = ?1 AND status = 'running'",
                    params![job.id, STALL_PAYLOAD, dt_to_ms(now)],
                )
                .map_err(|e| StoreError::storage("terminalize stalled job", e))?;
                sweep.terminalized.push(job);
            }
        }

        tx.commit()
            .map_err(|e| StoreError::storage("commit stall sweep tx", e))?;
        Ok(sweep)
    }

    // ----- activity (wake-up input) -----

    /// Services with pending work, alongside their live-machine counts.
    pub fn cluster_activity(
        &self,
        now: DateTime<Utc>,
        machine_horizon_seconds: u64,
    ) -> Result<Vec<ClusterActivity>, StoreError> {
        let conn = self.lock()?;
        let mut pending: Vec<(String, String, i64)> = Vec::new();
        {
            let mut stmt = conn
                .prepare(
                    "SELECT cluster_id, service, COUNT(*) FROM jobs
                     WHERE status = 'pending'
                     GROUP BY cluster_id, service",
                )
                .map_err(|e| StoreError::storage("prepare pending depth scan", e))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
                .map_err(|e| StoreError::storage("query pending depth", e))?;
            for row in rows {
                pending.push(row.map_err(|e| StoreError::storage("scan pending depth", e))?);
            }
        }

        let cutoff = dt_to_ms(now) - (machine_horizon_seconds as i64) * 1000;
        let mut out = Vec::with_capacity(pending.len());
        for (cluster_id, service, depth) in pending {
            let live: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM machines
                     WHERE cluster_id = ?1 AND service = ?2 AND last_ping_at_ms >= ?3",
                    params![cluster_id, service, cutoff],
                    |row| row.get(0),
                )
                .map_err(|e| StoreError::storage("count machines for activity", e))?;
            out.push(ClusterActivity {
                cluster_id,
                service,
                pending_jobs: depth.max(0) as u64,
                live_machines: live.max(0) as u64,
            });
        }
        Ok(out)
    }

    // ----- deployments -----

    pub fn create_deployment(
        &self,
        cluster_id: &str,
        service: &str,
        provider: &str,
        now: DateTime<Utc>,
    ) -> Result<Deployment, StoreError> {
        let deployment = Deployment {
            id: differential_core::fresh_id(),
            cluster_id: cluster_id.to_string(),
            service: service.to_string(),
            provider: provider.to_string(),
            status: DeploymentStatus::Uploading,
            created_at: now,
        };
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO deployments (id, cluster_id, service, provider, status, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, 'uploading', ?5)",
            params![
                deployment.id,
                cluster_id,
                service,
                provider,
                dt_to_ms(now)
            ],
        )
        .map_err(|e| StoreError::storage("insert deployment", e))?;
        Ok(deployment)
    }

    /// Promote a deployment to `active`, demoting any current active one for
    /// the same `(cluster, service)` in the same transaction.
    pub fn release_deployment(
        &self,
        cluster_id: &str,
        service: &str,
        deployment_id: &str,
    ) -> Result<Deployment, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::storage("begin release tx", e))?;

        let exists: Option<String> = tx
            .query_row(
                "SELECT id FROM deployments
                 WHERE id = ?1 AND cluster_id = ?2 AND service = ?3",
                params![deployment_id, cluster_id, service],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::storage("read deployment for release", e))?;
        if exists.is_none() {
            return Err(StoreError::NotFound(format!(
                "unknown deployment: {}",
                deployment_id
            )));
        }

        tx.execute(
            "UPDATE deployments SET status = 'inactive'
             WHERE cluster_id = ?1 AND service = ?2 AND status = 'active'",
            params![cluster_id, service],
        )
        .map_err(|e| StoreError::storage("demote active deployment", e))?;
        tx.execute(
            "UPDATE deployments SET status = 'active' WHERE id = ?1",
            params![deployment_id],
        )
        .map_err(|e| StoreError::storage("promote deployment", e))?;

        let released = tx
            .query_row(
                "SELECT id, cluster_id, service, provider, status, created_at_ms
                 FROM deployments WHERE id = ?1",
                params![deployment_id],
                map_deployment_row,
            )
            .map_err(|e| StoreError::storage("read released deployment", e))?;
        tx.commit()
            .map_err(|e| StoreError::storage("commit release tx", e))?;
        Ok(released)
    }

    pub fn active_deployment(
        &self,
        cluster_id: &str,
        service: &str,
    ) -> Result<Option<Deployment>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, cluster_id, service, provider, status, created_at_ms
             FROM deployments
             WHERE cluster_id = ?1 AND service = ?2 AND status = 'active'",
            params![cluster_id, service],
            map_deployment_row,
        )
        .optional()
        .map_err(|e| StoreError::storage("get active deployment", e))
    }

    pub fn get_deployment(
        &self,
        cluster_id: &str,
        deployment_id: &str,
    ) -> Result<Option<Deployment>, StoreError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, cluster_id, service, provider, status, created_at_ms
             FROM deployments WHERE id = ?1 AND cluster_id = ?2",
            params![deployment_id, cluster_id],
            map_deployment_row,
        )
        .optional()
        .map_err(|e| StoreError::storage("get deployment", e))
    }

    // ----- events -----

    pub fn append_event(&self, event: &JobEvent) -> Result<(), StoreError> {
        let meta = match &event.meta {
            Some(meta) => Some(
                serde_json::to_string(meta)
                    .map_err(|e| StoreError::storage("encode event meta", e))?,
            ),
            None => None,
        };
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO events
             (kind, cluster_id, job_id, machine_id, deployment_id, service, meta, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.kind.as_str(),
                event.cluster_id,
                event.job_id,
                event.machine_id,
                event.deployment_id,
                event.service,
                meta,
                dt_to_ms(event.created_at)
            ],
        )
        .map_err(|e| StoreError::storage("append event", e))?;
        Ok(())
    }

    pub fn count_events(&self, cluster_id: &str, kind: EventKind) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM events WHERE cluster_id = ?1 AND kind = ?2",
                params![cluster_id, kind.as_str()],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::storage("count events", e))?;
        Ok(count.max(0) as u64)
    }
}

/// Durable event sink backed by the store's `events` table. Emission never
/// fails the caller; write errors are logged and dropped.
#[derive(Clone)]
pub struct SqliteEventSink {
    store: SqliteJobStore,
}

impl SqliteEventSink {
    pub fn new(store: SqliteJobStore) -> Self {
        Self { store }
    }
}

impl EventSink for SqliteEventSink {
    fn emit(&self, event: JobEvent) {
        if let Err(e) = self.store.append_event(&event) {
            tracing::warn!(kind = event.kind.as_str(), error = %e, "dropping event");
        }
    }
}

fn secret_digest(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}

fn map_cluster_row(row: &rusqlite::Row) -> rusqlite::Result<Cluster> {
    Ok(Cluster {
        id: row.get(0)?,
        secret_hash: row.get(1)?,
        operational: row.get(2)?,
        predictive_retries_enabled: row.get(3)?,
        auto_retry_stalled_jobs: row.get(4)?,
    })
}

fn map_status_row(row: &rusqlite::Row) -> rusqlite::Result<JobStatusRow> {
    let status: String = row.get(1)?;
    let result_type: Option<String> = row.get(3)?;
    Ok(JobStatusRow {
        id: row.get(0)?,
        status: JobStatus::from_str(&status).unwrap_or(JobStatus::Pending),
        result: row.get(2)?,
        result_type: result_type.as_deref().and_then(ResultType::from_str),
    })
}

fn map_deployment_row(row: &rusqlite::Row) -> rusqlite::Result<Deployment> {
    let status: String = row.get(4)?;
    Ok(Deployment {
        id: row.get(0)?,
        cluster_id: row.get(1)?,
        service: row.get(2)?,
        provider: row.get(3)?,
        status: DeploymentStatus::from_str(&status).unwrap_or(DeploymentStatus::Inactive),
        created_at: ms_to_dt(row.get(5)?),
    })
}

fn map_job_row(row: &rusqlite::Row) -> rusqlite::Result<Job> {
    let status: String = row.get(5)?;
    let result_type: Option<String> = row.get(7)?;
    Ok(Job {
        id: row.get(0)?,
        cluster_id: row.get(1)?,
        service: row.get(2)?,
        target_fn: row.get(3)?,
        target_args: row.get(4)?,
        status: JobStatus::from_str(&status).unwrap_or(JobStatus::Pending),
        result: row.get(6)?,
        result_type: result_type.as_deref().and_then(ResultType::from_str),
        idempotency_key: row.get(8)?,
        cache_key: row.get(9)?,
        remaining_attempts: row.get::<_, i64>(10)?.max(0) as u32,
        timeout_interval_seconds: row.get::<_, Option<i64>>(11)?.map(|v| v.max(0) as u64),
        predictive_retries_on_rejection: row.get(12)?,
        executing_machine_id: row.get(13)?,
        deployment_id: row.get(14)?,
        created_at: ms_to_dt(row.get(15)?),
        updated_at: ms_to_dt(row.get(16)?),
        last_retrieved_at: row.get::<_, Option<i64>>(17)?.map(ms_to_dt),
        resulted_at: row.get::<_, Option<i64>>(18)?.map(ms_to_dt),
        function_execution_time_ms: row.get::<_, Option<i64>>(19)?.map(|v| v.max(0) as u64),
    })
}

fn ensure_migration_table(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
          version INTEGER PRIMARY KEY,
          name TEXT NOT NULL,
          applied_at_ms INTEGER NOT NULL
        );
        "#,
    )
    .map_err(|e| StoreError::storage("init migration table", e))
}

fn current_schema_version(conn: &Connection) -> Result<i64, StoreError> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )
    .map_err(|e| StoreError::storage("read schema version", e))
}

fn record_migration(conn: &Connection, version: i64, name: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO schema_migrations (version, name, applied_at_ms) VALUES (?1, ?2, ?3)",
        params![version, name, dt_to_ms(Utc::now())],
    )
    .map_err(|e| StoreError::storage("record migration", e))?;
    Ok(())
}

fn apply_migration_v1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS clusters (
          id TEXT PRIMARY KEY,
          secret_hash TEXT NOT NULL UNIQUE,
          operational INTEGER NOT NULL DEFAULT 1,
          predictive_retries_enabled INTEGER NOT NULL DEFAULT 0,
          auto_retry_stalled_jobs INTEGER NOT NULL DEFAULT 1,
          created_at_ms INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS jobs (
          id TEXT NOT NULL UNIQUE,
          cluster_id TEXT NOT NULL,
          service TEXT NOT NULL,
          target_fn TEXT NOT NULL,
          target_args BLOB NOT NULL,
          status TEXT NOT NULL,
          result BLOB,
          result_type TEXT,
          idempotency_key TEXT NOT NULL,
          cache_key TEXT,
          remaining_attempts INTEGER NOT NULL,
          timeout_interval_seconds INTEGER,
          predictive_retries_on_rejection INTEGER NOT NULL DEFAULT 0,
          executing_machine_id TEXT,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL,
          last_retrieved_at_ms INTEGER,
          resulted_at_ms INTEGER,
          function_execution_time_ms INTEGER,
          PRIMARY KEY (cluster_id, target_fn, idempotency_key)
        );
        CREATE INDEX IF NOT EXISTS idx_jobs_cluster_service_status
          ON jobs (cluster_id, service, status);
        CREATE INDEX IF NOT EXISTS idx_jobs_cache
          ON jobs (cluster_id, service, target_fn, cache_key);
        CREATE TABLE IF NOT EXISTS machines (
          id TEXT NOT NULL,
          cluster_id TEXT NOT NULL,
          service TEXT,
          ip TEXT,
          deployment_id TEXT,
          last_ping_at_ms INTEGER NOT NULL,
          PRIMARY KEY (id, cluster_id)
        );
        CREATE TABLE IF NOT EXISTS service_definitions (
          cluster_id TEXT NOT NULL,
          service TEXT NOT NULL,
          definition TEXT NOT NULL,
          updated_at_ms INTEGER NOT NULL,
          PRIMARY KEY (cluster_id, service)
        );
        CREATE TABLE IF NOT EXISTS events (
          event_id INTEGER PRIMARY KEY AUTOINCREMENT,
          kind TEXT NOT NULL,
          cluster_id TEXT NOT NULL,
          job_id TEXT,
          machine_id TEXT,
          deployment_id TEXT,
          service TEXT,
          meta TEXT,
          created_at_ms INTEGER NOT NULL
        );
        "#,
    )
    .map_err(|e| StoreError::storage("apply migration v1", e))
}

fn apply_migration_v2(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS deployments (
          id TEXT PRIMARY KEY,
          cluster_id TEXT NOT NULL,
          service TEXT NOT NULL,
          provider TEXT NOT NULL,
          status TEXT NOT NULL,
          created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_deployments_cluster_service
          ON deployments (cluster_id, service, status);
        "#,
    )
    .map_err(|e| StoreError::storage("apply migration v2", e))
}

fn apply_migration_v3(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        ALTER TABLE jobs ADD COLUMN deployment_id TEXT;
        CREATE INDEX IF NOT EXISTS idx_jobs_deployment ON jobs (deployment_id);
        "#,
    )
    .map_err(|e| StoreError::storage("apply migration v3", e))
}
