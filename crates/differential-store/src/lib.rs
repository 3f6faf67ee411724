//! Durable job store: the only correctness-critical shared resource in the
//! platform. Every dispatch and result mutation goes through one SQLite
//! connection, so claims are serialized and contention shows up as zero-row
//! conditional updates that the claim loop skips.

pub mod config;
pub mod sqlite;

pub use config::StoreConfig;
pub use sqlite::{
    Admission, ClusterActivity, SqliteEventSink, SqliteJobStore, StallSweep, StalledJob,
    SCHEMA_VERSION,
};
