//! Wires the stores, pipeline and worker pool from configuration.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::chunk_store::ChunkStore;
use crate::config::IvcapConfig;
use crate::coordinator::Coordinator;
use crate::error::ConfigError;
use crate::exec::CommandExecutor;
use crate::http::{router, AppState};
use crate::merger::{FfprobeProbe, Merger};
use crate::pipeline::PipelineContext;
use crate::queue::{JobQueueStore, QueueError};
use crate::session::{SessionError, SqliteSessionStore};
use crate::transcoder::{TranscodeSettings, Transcoder};
use crate::worker::{WorkerPool, WorkerStats};

pub type ServerResult<T> = Result<T, ServerError>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("http server error: {0}")]
    Serve(#[source] std::io::Error),
    #[error("worker pool task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// The server-side components built from one configuration.
#[derive(Clone)]
pub struct Services {
    pub coordinator: Coordinator,
    pub workers: WorkerPool,
}

impl Services {
    pub fn from_config(
        config: &IvcapConfig,
        executor: Arc<dyn CommandExecutor>,
    ) -> ServerResult<Self> {
        let sessions = SqliteSessionStore::builder()
            .path(config.sessions_db())
            .build()?;
        sessions.initialize()?;
        let jobs = JobQueueStore::builder().path(config.jobs_db()).build()?;
        jobs.initialize()?;

        let chunks = ChunkStore::new(config.staging_dir())
            .with_max_fragment_bytes(config.server.max_fragment_bytes);
        let probe = FfprobeProbe::new(
            Arc::clone(&executor),
            &config.transcode.ffprobe,
            Duration::from_secs(config.merge.probe_timeout_seconds),
        );
        let merger = Merger::new(chunks.clone(), Arc::new(probe), config.merge.gap_policy)
            .with_file_stem(&config.merge.merged_file_stem);
        let transcoder = Transcoder::new(
            TranscodeSettings::from(&config.transcode),
            executor,
            config.output_dir(),
            config.server.public_base_url()?,
        );

        let context = Arc::new(PipelineContext {
            sessions: sessions.clone(),
            chunks: chunks.clone(),
            merger,
            transcoder,
        });
        let workers = WorkerPool::new(
            context,
            jobs.clone(),
            config.worker.pool_size,
            config.worker.poll_interval(),
        );
        let coordinator = Coordinator::new(sessions, chunks, jobs, config.worker.max_job_attempts);
        Ok(Self {
            coordinator,
            workers,
        })
    }
}

/// Serves the ingest routes and runs the worker pool until `shutdown`
/// resolves. Workers finish their current job before returning.
pub async fn serve<S>(config: &IvcapConfig, services: Services, shutdown: S) -> ServerResult<WorkerStats>
where
    S: Future<Output = ()> + Send + 'static,
{
    let address = config.server.bind_address.clone();
    let listener = TcpListener::bind(&address)
        .await
        .map_err(|source| ServerError::Bind {
            address: address.clone(),
            source,
        })?;
    info!(address = %address, "ingest server listening");

    let (stop_tx, stop_rx) = watch::channel(false);
    let workers = services.workers.clone();
    let worker_task = tokio::spawn(async move { workers.run(stop_rx).await });

    let app = router(
        AppState {
            coordinator: services.coordinator,
        },
        config.server.max_fragment_bytes,
    );
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(ServerError::Serve);

    let _ = stop_tx.send(true);
    let stats = worker_task.await??;
    served?;
    info!(?stats, "ingest server stopped");
    Ok(stats)
}
