//! Fixed-size pool that drains the transcode job queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::pipeline::PipelineContext;
use crate::queue::{Job, JobDisposition, JobQueueStore, QueueResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub completed: u64,
    pub requeued: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    requeued: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            completed: self.completed.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone)]
pub struct WorkerPool {
    context: Arc<PipelineContext>,
    jobs: JobQueueStore,
    pool_size: usize,
    poll_interval: Duration,
    counters: Arc<Counters>,
}

impl WorkerPool {
    pub fn new(
        context: Arc<PipelineContext>,
        jobs: JobQueueStore,
        pool_size: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            context,
            jobs,
            pool_size: pool_size.max(1),
            poll_interval,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    /// Runs until `shutdown` flips to true. A job in progress is finished
    /// before its worker exits.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> QueueResult<WorkerStats> {
        self.jobs.recover_running()?;
        info!(workers = self.pool_size, "worker pool started");
        let mut workers = JoinSet::new();
        for worker_id in 0..self.pool_size {
            let pool = self.clone();
            let mut shutdown = shutdown.clone();
            workers.spawn(async move {
                loop {
                    if *shutdown.borrow() {
                        break;
                    }
                    match pool.jobs.claim_next() {
                        Ok(Some(job)) => pool.process(worker_id, job).await,
                        Ok(None) => {
                            tokio::select! {
                                _ = tokio::time::sleep(pool.poll_interval) => {}
                                changed = shutdown.changed() => {
                                    if changed.is_err() {
                                        break;
                                    }
                                }
                            }
                        }
                        Err(err) => {
                            error!(worker_id, error = %err, "failed to claim job");
                            tokio::time::sleep(pool.poll_interval).await;
                        }
                    }
                }
                debug!(worker_id, "worker stopped");
            });
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "worker task aborted");
            }
        }
        let stats = self.stats();
        info!(?stats, "worker pool stopped");
        Ok(stats)
    }

    /// Processes queued jobs, including requeued retries, until none are
    /// left.
    pub async fn run_until_idle(&self) -> QueueResult<WorkerStats> {
        let mut workers = JoinSet::new();
        for worker_id in 0..self.pool_size {
            let pool = self.clone();
            workers.spawn(async move {
                while let Some(job) = pool.jobs.claim_next()? {
                    pool.process(worker_id, job).await;
                }
                QueueResult::Ok(())
            });
        }
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(result) => result?,
                Err(err) => error!(error = %err, "worker task aborted"),
            }
        }
        Ok(self.stats())
    }

    async fn process(&self, worker_id: usize, job: Job) {
        info!(
            worker_id,
            job_id = job.id,
            session_id = %job.session_id,
            attempt = job.attempts,
            "job claimed"
        );
        let context = Arc::clone(&self.context);
        let jobs = self.jobs.clone();
        let job_id = job.id;
        let session_id = job.session_id.clone();
        // The run gets its own task so a panic surfaces as a JoinError here.
        let handle = tokio::spawn(async move {
            let reporter = move |percent: u8| {
                if let Err(err) = jobs.update_progress(job_id, percent) {
                    warn!(job_id, percent, error = %err, "progress update failed");
                }
            };
            context.run(&session_id, &reporter).await
        });

        let (reason, retryable) = match handle.await {
            Ok(Ok(report)) => {
                if let Err(err) = self.jobs.complete(job.id) {
                    error!(job_id = job.id, error = %err, "failed to complete job");
                }
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                debug!(job_id = job.id, skipped = report.skipped, "job completed");
                return;
            }
            Ok(Err(err)) => (err.to_string(), err.is_retryable()),
            Err(join) => (format!("worker crashed: {join}"), true),
        };

        match self.jobs.fail(job.id, &reason, retryable) {
            Ok(JobDisposition::Requeued) => {
                self.counters.requeued.fetch_add(1, Ordering::Relaxed);
            }
            Ok(JobDisposition::Failed) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                if let Err(err) = self.context.sessions.mark_failed(&job.session_id, &reason) {
                    error!(session_id = %job.session_id, error = %err, "failed to mark session failed");
                }
            }
            Err(err) => error!(job_id = job.id, error = %err, "failed to record job failure"),
        }
    }
}
