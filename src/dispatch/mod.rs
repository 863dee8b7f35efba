//! Bounded worker pool.
//!
//! A feeder task pushes job ids `1..=total_jobs` into a bounded MPMC
//! channel, `concurrency` workers pull from it and run a [`JobHandler`],
//! and a closer task drops the last result sender once every worker has
//! exited so the aggregator's read loop terminates.
//!
//! Cancellation is best effort: a worker that observes it, whether waiting
//! for a job or while the job runs, exits without emitting a result.

pub mod device;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, warn};

use crate::error::{Error, Result};
use crate::telemetry::{metrics, spans};

pub use device::RoutineDispatcher;

pub type Job = u64;

/// Outcome of one job, emitted once per job a worker completes.
#[derive(Debug)]
pub struct WorkerResult {
    pub worker_id: usize,
    pub job: Job,
    pub error: Option<Error>,
}

/// The per-job action.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job, cancel: &CancellationToken) -> Result<()>;
}

/// Tally of a finished [`WorkerPool::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSummary {
    /// Jobs requested.
    pub total_jobs: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl PoolSummary {
    /// Jobs that produced a result. Lower than `total_jobs` only after
    /// cancellation.
    pub fn completed(&self) -> u64 {
        self.succeeded + self.failed
    }
}

pub struct WorkerPool {
    concurrency: usize,
    handler: Arc<dyn JobHandler>,
}

impl WorkerPool {
    pub fn new(concurrency: usize, handler: Arc<dyn JobHandler>) -> Result<Self> {
        if concurrency == 0 {
            return Err(Error::Config(
                "worker pool concurrency must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            concurrency,
            handler,
        })
    }

    /// Start the feeder, workers and closer; return the result stream.
    ///
    /// The receiver yields `None` once every worker has exited.
    pub fn spawn(
        &self,
        cancel: CancellationToken,
        total_jobs: u64,
    ) -> mpsc::Receiver<WorkerResult> {
        let capacity = channel_capacity(total_jobs);
        let (job_tx, job_rx) = flume::bounded::<Job>(capacity);
        let (result_tx, result_rx) = mpsc::channel(capacity);

        let feeder_cancel = cancel.clone();
        tokio::spawn(
            async move {
                for job in 1..=total_jobs {
                    tokio::select! {
                        biased;
                        _ = feeder_cancel.cancelled() => {
                            debug!(next_job = job, "feeder cancelled");
                            break;
                        }
                        sent = job_tx.send_async(job) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
                // Dropping job_tx closes the source; workers drain and exit.
            }
            .instrument(tracing::debug_span!("pool.feeder")),
        );

        let workers = TaskTracker::new();
        for worker_id in 1..=self.concurrency {
            workers.spawn(worker(
                worker_id,
                job_rx.clone(),
                result_tx.clone(),
                Arc::clone(&self.handler),
                cancel.clone(),
            ));
        }
        workers.close();
        drop(job_rx);

        tokio::spawn(async move {
            workers.wait().await;
            drop(result_tx);
        });

        result_rx
    }

    /// Run `total_jobs` jobs to completion and tally the results.
    ///
    /// Fails with [`Error::Aggregate`] if any job failed.
    pub async fn run(&self, cancel: CancellationToken, total_jobs: u64) -> Result<PoolSummary> {
        let started = Instant::now();
        info!(total_jobs, concurrency = self.concurrency, "worker pool starting");

        let mut results = self.spawn(cancel.clone(), total_jobs);
        let mut summary = PoolSummary {
            total_jobs,
            ..PoolSummary::default()
        };

        while let Some(result) = results.recv().await {
            match &result.error {
                None => summary.succeeded += 1,
                Some(e) => {
                    warn!(worker_id = result.worker_id, job = result.job, error = %e, "job failed");
                    summary.failed += 1;
                }
            }
        }

        metrics::operation_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "pool.run")],
        );
        info!(
            total_jobs,
            succeeded = summary.succeeded,
            failed = summary.failed,
            cancelled = cancel.is_cancelled(),
            "worker pool finished"
        );

        if summary.failed > 0 {
            return Err(Error::Aggregate {
                failed: summary.failed,
                total: total_jobs,
            });
        }
        Ok(summary)
    }
}

/// Room for every job, within what a tokio channel can hold.
fn channel_capacity(total_jobs: u64) -> usize {
    usize::try_from(total_jobs)
        .unwrap_or(usize::MAX)
        .clamp(1, Semaphore::MAX_PERMITS)
}

async fn worker(
    worker_id: usize,
    jobs: flume::Receiver<Job>,
    results: mpsc::Sender<WorkerResult>,
    handler: Arc<dyn JobHandler>,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = jobs.recv_async() => match job {
                Ok(job) => job,
                Err(_) => break,
            },
        };

        let span = spans::start_job_span(worker_id, job);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = handler.handle(job, &cancel).instrument(span) => Some(result),
        };
        let Some(result) = outcome else {
            debug!(worker_id, job, "job abandoned on cancellation");
            break;
        };

        metrics::pool_jobs().add(
            1,
            &[KeyValue::new("result", if result.is_ok() { "ok" } else { "error" })],
        );

        let result = WorkerResult {
            worker_id,
            job,
            error: result.err(),
        };
        if results.send(result).await.is_err() {
            break;
        }
    }
    debug!(worker_id, "worker exited");
}
