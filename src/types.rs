//! Core types for sql-extractor

use crate::error::EventError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Database connection a query runs against
///
/// `info` is passed to the remote agent untouched; its shape depends on `driver`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    /// Driver name understood by the remote agent (e.g. "postgres")
    pub driver: String,
    /// Driver-specific connection parameters
    #[serde(default)]
    pub info: serde_json::Map<String, serde_json::Value>,
}

/// One named SQL query to execute and capture during a batch
#[derive(Clone, Debug)]
pub struct Job {
    /// Name of the query, unique within a batch; also the artifact file name
    pub name: String,
    /// Connection the query runs against
    pub connection: Arc<Connection>,
    /// SQL text as read from disk
    pub sql: String,
    /// File the query was read from, if any
    pub file: Option<PathBuf>,
    /// When the job was scheduled
    pub scheduled_at: DateTime<Utc>,
    /// When a worker started executing the job
    pub started_at: Option<DateTime<Utc>>,
    /// When the job's pipeline finished
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a job scheduled now
    pub fn new(
        name: impl Into<String>,
        connection: Arc<Connection>,
        sql: impl Into<String>,
    ) -> Self {
        Self::scheduled_at(name, connection, sql, Utc::now())
    }

    /// Create a job with an explicit schedule timestamp
    pub fn scheduled_at(
        name: impl Into<String>,
        connection: Arc<Connection>,
        sql: impl Into<String>,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            connection,
            sql: sql.into(),
            file: None,
            scheduled_at,
            started_at: None,
            completed_at: None,
        }
    }

    /// Record that a worker picked the job up
    pub fn mark_started(&mut self) {
        self.started_at = Some(Utc::now().max(self.scheduled_at));
    }

    /// Record that the job's pipeline finished
    pub fn mark_completed(&mut self) {
        let floor = self.started_at.unwrap_or(self.scheduled_at);
        self.completed_at = Some(Utc::now().max(floor));
    }

    /// SQL with surrounding whitespace and one trailing `;` removed
    pub fn normalized_sql(&self) -> &str {
        let sql = self.sql.trim();
        sql.strip_suffix(';').unwrap_or(sql)
    }
}

/// Lifecycle of a single batch
///
/// A batch only ever moves forward: `Idle → Running → Draining → Done`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchState {
    /// Dispatcher constructed, nothing started
    Idle,
    /// Cache directory created and workers pulling jobs
    Running,
    /// Every job handed to a worker, waiting for workers to return
    Draining,
    /// All workers returned and the batch-ended event was emitted
    Done,
}

/// Result of handing one artifact to storage
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadOutcome {
    /// Bucket the artifact was (or would have been) written to
    pub bucket: String,
    /// Resolved object key
    pub key: String,
    /// Upload failure, if any
    pub error: Option<EventError>,
}

/// Per-job outcome surfaced to the caller of a batch
#[derive(Clone, Debug)]
pub struct JobOutcome {
    /// Job name
    pub name: String,
    /// Bytes copied from the agent's response stream
    pub bytes: u64,
    /// Time spent fetching and writing
    pub elapsed: Duration,
    /// Local artifact path
    pub cache_file: PathBuf,
    /// Fetch or write failure, if any
    pub error: Option<EventError>,
    /// Upload result when storage is configured and the extract succeeded
    pub upload: Option<UploadOutcome>,
    /// When a worker started the job
    pub started_at: Option<DateTime<Utc>>,
    /// When the job's pipeline finished
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobOutcome {
    /// Whether the extract itself succeeded
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Summary of one scheduler run
#[derive(Clone, Debug)]
pub struct BatchReport {
    /// Correlation id shared by every event of the run
    pub correlation_id: String,
    /// Run start time
    pub started_at: DateTime<Utc>,
    /// Run end time
    pub ended_at: DateTime<Utc>,
    /// Per-run cache directory
    pub cache_dir: PathBuf,
    /// Outcomes of every job a worker processed, in completion order
    pub jobs: Vec<JobOutcome>,
}

impl BatchReport {
    /// Number of jobs whose extract failed
    pub fn failed(&self) -> usize {
        self.jobs.iter().filter(|j| !j.succeeded()).count()
    }
}
