//! Batch dispatcher: runs one batch of jobs through a bounded worker pool.
//!
//! A batch moves through `Idle → Running → Draining → Done`:
//!
//! 1. **Idle → Running**: the run's cache directory is created (failure aborts the
//!    batch before any job runs), a correlation id is generated and `batch-started`
//!    is published.
//! 2. **Running**: a fixed number of workers pull jobs one at a time from a bounded
//!    queue (capacity = 2 × workers) and run each through the pipeline, publishing
//!    `extract-started`/`extract-ended` and, when storage is configured and the
//!    extract succeeded, `extract-upload-started`/`extract-upload-ended`.
//! 3. **Draining**: the queue is closed; workers finish what they claimed.
//! 4. **Done**: `batch-ended` is published and, when both storage and purge are
//!    configured, the run's cache directory is removed.
//!
//! Job failures never abort the batch. Cancellation is cooperative: workers stop
//! claiming jobs, and jobs in flight abort at their next suspension point.

use crate::config::Config;
use crate::error::{Error, EventError, Result};
use crate::events::{EventPayload, EventPublisher};
use crate::fetch::FetchClient;
use crate::pipeline::{cache_file_name, run_pipeline};
use crate::storage::Storage;
use crate::types::{BatchReport, BatchState, Job, JobOutcome, UploadOutcome};
use chrono::{SecondsFormat, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};


/// Runs a single batch; construct a fresh dispatcher for every run
pub struct Dispatcher {
    config: Arc<Config>,
    fetch: FetchClient,
    storage: Option<Arc<dyn Storage>>,
    publisher: Arc<dyn EventPublisher>,
    state: BatchState,
}

impl Dispatcher {
    /// Create a dispatcher for one run
    pub fn new(config: Arc<Config>, publisher: Arc<dyn EventPublisher>) -> Self {
        let fetch = FetchClient::new(&config);
        Self {
            config,
            fetch,
            storage: None,
            publisher,
            state: BatchState::Idle,
        }
    }

    /// Hand finished extracts to `storage`
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Use a specific fetch client (e.g. one sharing an HTTP connection pool)
    pub fn with_fetch_client(mut self, fetch: FetchClient) -> Self {
        self.fetch = fetch;
        self
    }

    /// Current state of the batch
    pub fn state(&self) -> BatchState {
        self.state
    }

    fn transition(&mut self, next: BatchState) {
        debug!(from = ?self.state, to = ?next, "batch state transition");
        self.state = next;
    }

    /// Run `jobs` to completion
    ///
    /// Returns an error only when the batch cannot start (the dispatcher was already
    /// used, job names collide, or the cache directory cannot be created). Individual
    /// job failures are reported through events and the returned [`BatchReport`].
    pub async fn execute(
        &mut self,
        jobs: Vec<Job>,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        if self.state != BatchState::Idle {
            return Err(Error::Other(
                "dispatcher already ran a batch; create a new one per run".into(),
            ));
        }
        check_unique_names(&jobs)?;

        let started_at = Utc::now();
        let run_name = started_at.to_rfc3339_opts(SecondsFormat::Secs, true);
        let cache_dir = self.config.cache.path.join(&run_name);

        if let Err(source) = tokio::fs::create_dir(&cache_dir).await {
            self.transition(BatchState::Done);
            return Err(Error::CacheDir {
                path: cache_dir,
                source,
            });
        }

        let correlation_id = uuid::Uuid::new_v4().to_string();
        let ctx = Arc::new(WorkerContext {
            config: Arc::clone(&self.config),
            fetch: self.fetch.clone(),
            storage: self.storage.clone(),
            publisher: Arc::clone(&self.publisher),
            correlation_id: correlation_id.clone(),
            run_name,
            cache_dir: cache_dir.clone(),
            cancel: cancel.clone(),
        });

        let workers = self.config.worker_count();
        info!(
            correlation_id = %correlation_id,
            jobs = jobs.len(),
            workers,
            cache_dir = ?cache_dir,
            "starting batch"
        );
        ctx.publish(EventPayload::BatchStarted {});
        self.transition(BatchState::Running);
        let batch_start = Instant::now();

        let (tx, rx) = mpsc::channel::<Job>(workers * 2);
        let queue = Arc::new(Mutex::new(rx));

        let handles: Vec<_> = (0..workers)
            .map(|id| {
                let ctx = Arc::clone(&ctx);
                let queue = Arc::clone(&queue);
                tokio::spawn(
                    run_worker(id, ctx, queue).instrument(info_span!("worker", id)),
                )
            })
            .collect();
        // Workers own the receiving side; once they all stop, sends fail instead of blocking
        drop(queue);

        // Blocks while the queue is full; cancellation is observed by the workers
        for job in jobs {
            if let Err(mpsc::error::SendError(job)) = tx.send(job).await {
                warn!(job = %job.name, "workers stopped, remaining jobs not dispatched");
                break;
            }
        }
        drop(tx);
        self.transition(BatchState::Draining);

        let mut outcomes = Vec::new();
        for result in futures::future::join_all(handles).await {
            match result {
                Ok(worker_outcomes) => outcomes.extend(worker_outcomes),
                Err(e) => error!(error = %e, "worker task failed"),
            }
        }

        self.transition(BatchState::Done);
        let ended_at = Utc::now();
        ctx.publish(EventPayload::BatchEnded {
            duration: batch_start.elapsed(),
        });

        let failed = outcomes.iter().filter(|o| !o.succeeded()).count();
        info!(
            correlation_id = %correlation_id,
            completed = outcomes.len(),
            failed,
            "batch done"
        );

        if self.storage.is_some() && self.config.cache.purge {
            purge_dir(&cache_dir).await;
        }

        Ok(BatchReport {
            correlation_id,
            started_at,
            ended_at,
            cache_dir,
            jobs: outcomes,
        })
    }
}

fn check_unique_names(jobs: &[Job]) -> Result<()> {
    let mut seen = HashSet::with_capacity(jobs.len());
    for job in jobs {
        if !seen.insert(job.name.as_str()) {
            return Err(Error::config(
                "queries",
                format!("duplicate query name {}", job.name),
            ));
        }
    }
    Ok(())
}

/// Read-only state shared by the workers of one batch
struct WorkerContext {
    config: Arc<Config>,
    fetch: FetchClient,
    storage: Option<Arc<dyn Storage>>,
    publisher: Arc<dyn EventPublisher>,
    correlation_id: String,
    run_name: String,
    cache_dir: PathBuf,
    cancel: CancellationToken,
}

impl WorkerContext {
    fn publish(&self, payload: EventPayload) {
        self.publisher
            .publish(&self.config.events.topic, &self.correlation_id, payload);
    }
}

async fn run_worker(
    id: usize,
    ctx: Arc<WorkerContext>,
    queue: Arc<Mutex<mpsc::Receiver<Job>>>,
) -> Vec<JobOutcome> {
    let mut outcomes = Vec::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                info!(worker = id, "stopping worker (cancelled)");
                break;
            }
            job = next_job(&queue) => job,
        };

        let Some(job) = next else {
            debug!(worker = id, "stopping worker (queue drained)");
            break;
        };

        outcomes.push(process_job(&ctx, job).await);
    }

    outcomes
}

async fn next_job(queue: &Mutex<mpsc::Receiver<Job>>) -> Option<Job> {
    queue.lock().await.recv().await
}

async fn process_job(ctx: &WorkerContext, mut job: Job) -> JobOutcome {
    let file_name = cache_file_name(&job.name, ctx.config.format);
    let cache_file = ctx.cache_dir.join(&file_name);
    let path_suffix = format!("{}/{}", ctx.run_name, file_name);

    job.mark_started();
    info!(job = %job.name, "executing query");
    ctx.publish(EventPayload::ExtractStarted {
        query: job.name.clone(),
    });

    let start = Instant::now();
    let result = run_pipeline(&ctx.fetch, &ctx.config, &job, &cache_file, &ctx.cancel).await;
    let elapsed = start.elapsed();
    job.mark_completed();

    let (bytes, error) = match result {
        Ok(output) => {
            info!(
                job = %job.name,
                bytes = output.bytes,
                elapsed_ms = elapsed.as_millis(),
                "finished query"
            );
            (output.bytes, None)
        }
        Err(e) => {
            warn!(job = %job.name, error = %e, "query failed");
            (0, Some(EventError::from(&e)))
        }
    };

    ctx.publish(EventPayload::ExtractEnded {
        query: job.name.clone(),
        bytes,
        duration: elapsed,
        error: error.clone(),
    });

    let upload = match (&error, &ctx.storage) {
        (None, Some(storage)) => {
            Some(upload(ctx, storage.as_ref(), &job, &cache_file, &path_suffix).await)
        }
        _ => None,
    };

    if upload.is_some() && ctx.config.cache.purge {
        purge_file(&cache_file).await;
    }

    JobOutcome {
        name: job.name,
        bytes,
        elapsed,
        cache_file,
        error,
        upload,
        started_at: job.started_at,
        completed_at: job.completed_at,
    }
}

async fn upload(
    ctx: &WorkerContext,
    storage: &dyn Storage,
    job: &Job,
    cache_file: &Path,
    path_suffix: &str,
) -> UploadOutcome {
    let location = storage.location(path_suffix);
    info!(job = %job.name, bucket = %location.bucket, key = %location.key, "uploading extract");
    ctx.publish(EventPayload::ExtractUploadStarted {
        query: job.name.clone(),
        bucket: location.bucket.clone(),
        key: location.key.clone(),
    });

    let start = Instant::now();
    let result = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => Err(Error::Cancelled),
        stored = storage.put(path_suffix, cache_file) => stored,
    };
    let duration = start.elapsed();

    let (stored, error) = match result {
        Ok(stored) => (stored, None),
        Err(e) => {
            warn!(job = %job.name, key = %location.key, error = %e, "upload failed");
            (location, Some(EventError::from(&e)))
        }
    };

    ctx.publish(EventPayload::ExtractUploadEnded {
        query: job.name.clone(),
        bucket: stored.bucket.clone(),
        key: stored.key.clone(),
        duration,
        error: error.clone(),
    });

    UploadOutcome {
        bucket: stored.bucket,
        key: stored.key,
        error,
    }
}

async fn purge_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(?path, "removed cached extract"),
        Err(e) => warn!(?path, error = %e, "failed to remove cached extract"),
    }
}

async fn purge_dir(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => debug!(?path, "removed run cache directory"),
        Err(e) => warn!(?path, error = %e, "failed to remove run cache directory"),
    }
}
