//! # sql-extractor
//!
//! Batch scheduler for SQL extracts.
//!
//! A batch takes a list of named SQL queries, executes each one through a remote
//! query-execution agent, streams the result into a local cache file (optionally
//! gzip-compressed), optionally uploads the file to object storage and publishes
//! lifecycle events along the way.
//!
//! ## Design
//!
//! - **Bounded parallelism**: a fixed worker pool pulls jobs from a small bounded queue
//! - **Failure isolation**: a failing query never aborts the rest of the batch
//! - **Cooperative cancellation**: one [`CancellationToken`] stops new work and aborts
//!   in-flight requests
//! - **Pluggable collaborators**: storage and event delivery sit behind the [`Storage`]
//!   and [`EventPublisher`] traits
//!
//! ## Quick Start
//!
//! ```no_run
//! use sql_extractor::{Config, LogPublisher, Runner};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file("extract.yaml")?;
//!     let runner = Runner::new(config, Arc::new(LogPublisher));
//!
//!     let report = runner.run_once(&CancellationToken::new()).await?;
//!     println!("{} queries, {} failed", report.jobs.len(), report.failed());
//!
//!     Ok(())
//! }
//! ```
//!
//! [`CancellationToken`]: tokio_util::sync::CancellationToken

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Batch dispatcher and worker pool
pub mod dispatcher;
/// Error types
pub mod error;
/// Lifecycle events and publishers
pub mod events;
/// Remote query-execution client
pub mod fetch;
/// Per-job fetch-and-write pipeline
pub mod pipeline;
/// Query discovery
pub mod queries;
/// Retry logic with fixed backoff
pub mod retry;
/// Object storage for finished extracts
pub mod storage;
/// One-off and cron-scheduled runs
pub mod trigger;
/// Core types
pub mod types;

// Re-export commonly used types
pub use config::{Config, OutputFormat};
pub use dispatcher::Dispatcher;
pub use error::{Error, ErrorKind, EventError, Result};
pub use events::{
    BroadcastPublisher, Event, EventPayload, EventPublisher, LogPublisher, WebhookPublisher,
};
pub use fetch::FetchClient;
pub use storage::{ObjectStoreStorage, Storage, StoredObject};
pub use trigger::{Runner, cancel_on_signal, next_fire, parse_schedule, wait_for_signal};
pub use types::{BatchReport, BatchState, Connection, Job, JobOutcome};
