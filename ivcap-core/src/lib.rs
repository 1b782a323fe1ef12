pub mod chunk_store;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod exec;
pub mod fragment;
pub mod http;
pub mod merger;
pub mod pipeline;
pub mod queue;
pub mod recorder;
pub mod retry;
pub mod server;
pub mod session;
pub mod sqlite;
pub mod transcoder;
pub mod uploader;
pub mod worker;

pub use chunk_store::{ChunkStore, ChunkStoreError, ChunkStoreResult, StoredFragment};
pub use config::{load_config, IvcapConfig};
pub use coordinator::{
    Coordinator, CoordinatorError, CreateSessionRequest, FinalizeOutcome, FinalizeRequest,
    SessionView,
};
pub use error::{ConfigError, Result};
pub use exec::{CommandExecutor, SystemCommandExecutor};
pub use fragment::{Fragment, FragmentAck, FragmentSink};
pub use http::{router, ApiError, AppState};
pub use merger::{
    ContainerKind, FfprobeProbe, GapPolicy, MediaProbe, MergeError, MergeReport, Merger,
    ProbeSummary,
};
pub use pipeline::{PipelineContext, PipelineError, PipelineReport, ProgressReporter};
pub use queue::{
    EnqueueOutcome, Job, JobDisposition, JobFilter, JobQueueStore, JobQueueStoreBuilder,
    JobRequest, JobStatus, JobSummary, QueueError, QueueResult,
};
pub use recorder::{
    CaptureDevice, Recorder, RecorderError, RecorderSettings, RecorderState, RecordingHandle,
    RecordingSummary,
};
pub use retry::{RetryExhausted, RetryOutcome, RetryPolicy};
pub use server::{serve, ServerError, Services};
pub use session::{
    Session, SessionError, SessionFilter, SessionStatus, SqliteSessionStore,
    SqliteSessionStoreBuilder,
};
pub use transcoder::{TranscodeError, TranscodeOutcome, TranscodeSettings, Transcoder};
pub use uploader::{
    DrainReport, FragmentRecord, FragmentStatus, FragmentTransport, HttpIngestClient,
    UploadError, UploadProgress, Uploader, UploaderSettings,
};
pub use worker::{WorkerPool, WorkerStats};
