//! Running batches once or on a cron schedule
//!
//! Every run builds a fresh [`Dispatcher`] and re-reads the configured queries, so
//! query files added between scheduled runs are picked up.

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};
use crate::events::EventPublisher;
use crate::fetch::FetchClient;
use crate::storage::Storage;
use crate::types::BatchReport;
use chrono::{DateTime, Local};
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Runs batches for one configuration
pub struct Runner {
    config: Arc<Config>,
    publisher: Arc<dyn EventPublisher>,
    storage: Option<Arc<dyn Storage>>,
    http: reqwest::Client,
}

impl Runner {
    /// Create a runner publishing lifecycle events to `publisher`
    pub fn new(config: Config, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            config: Arc::new(config),
            publisher,
            storage: None,
            http: reqwest::Client::new(),
        }
    }

    /// Upload finished extracts to `storage`
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Configuration every run uses
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run on the configured cron schedule, or exactly once when none is set
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        match &self.config.schedule.cron {
            Some(expression) => {
                info!(schedule = %expression, "schedule found");
                self.run_scheduled(expression, cancel).await
            }
            None => {
                info!("no schedule specified, running one extract");
                self.run_once(cancel).await.map(|_| ())
            }
        }
    }

    /// Read the configured queries and run them as one batch
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<BatchReport> {
        let jobs = self.config.read_jobs()?;

        let fetch = FetchClient::with_client(self.http.clone(), &self.config);
        let mut dispatcher =
            Dispatcher::new(Arc::clone(&self.config), Arc::clone(&self.publisher))
                .with_fetch_client(fetch);
        if let Some(storage) = &self.storage {
            dispatcher = dispatcher.with_storage(Arc::clone(storage));
        }

        let report = dispatcher.execute(jobs, cancel).await?;
        info!(
            correlation_id = %report.correlation_id,
            jobs = report.jobs.len(),
            failed = report.failed(),
            elapsed_ms = (report.ended_at - report.started_at).num_milliseconds(),
            "extract finished"
        );
        Ok(report)
    }

    /// Run a batch at every upcoming time of `expression` until cancelled
    ///
    /// A run that fails to start is logged and the schedule carries on.
    pub async fn run_scheduled(
        &self,
        expression: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let schedule = parse_schedule(expression)?;

        while let Some(next) = next_fire(&schedule, Local::now()) {
            let wait = (next - Local::now()).to_std().unwrap_or(Duration::ZERO);
            info!(next = %next.to_rfc3339(), "waiting for next scheduled run");

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("schedule cancelled");
                    return Ok(());
                }
                _ = tokio::time::sleep(wait) => {}
            }

            match self.run_once(cancel).await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => error!(error = %e, "scheduled run aborted"),
                Err(e) => warn!(error = %e, "scheduled run failed"),
            }

            if cancel.is_cancelled() {
                return Ok(());
            }
        }

        warn!(schedule = %expression, "schedule has no upcoming times");
        Ok(())
    }
}

/// First fire time of `schedule` strictly after `now`
///
/// Times that passed while a long run was in progress are skipped, not caught up.
pub fn next_fire(schedule: &Schedule, now: DateTime<Local>) -> Option<DateTime<Local>> {
    schedule.after(&now).next()
}

/// Parse a cron expression
///
/// Accepts the classic five-field form (minute precision) as well as the six- and
/// seven-field forms with seconds and year.
pub fn parse_schedule(expression: &str) -> Result<Schedule> {
    let expression = expression.trim();
    let normalized = if expression.split_whitespace().count() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    };

    Schedule::from_str(&normalized)
        .map_err(|e| Error::Schedule(format!("invalid cron expression {expression:?}: {e}")))
}

/// Cancel `cancel` once a termination signal arrives
pub async fn cancel_on_signal(cancel: CancellationToken) {
    tokio::select! {
        _ = wait_for_signal() => {
            info!("shutting down");
            cancel.cancel();
        }
        _ = cancel.cancelled() => {}
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C on non-unix platforms)
#[cfg(unix)]
pub async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "Could not register signal handlers, using ctrl_c fallback");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C signal");
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl+C signal");
        }
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C on non-unix platforms)
#[cfg(not(unix))]
pub async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C signal");
        }
        Err(e) => {
            error!(error = %e, "Failed to listen for Ctrl+C signal");
            std::future::pending::<()>().await;
        }
    }
}
