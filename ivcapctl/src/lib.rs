use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use ivcap_core::{
    load_config, CreateSessionRequest, FinalizeRequest, Fragment, HttpIngestClient, IvcapConfig,
    Job, JobFilter, JobQueueStore, JobStatus, Services, Session, SessionFilter, SessionStatus,
    SqliteSessionStore, SystemCommandExecutor, UploadError, Uploader, UploaderSettings,
};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ivcap_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session store error: {0}")]
    Session(#[from] ivcap_core::SessionError),
    #[error("job queue error: {0}")]
    Queue(#[from] ivcap_core::QueueError),
    #[error("upload error: {0}")]
    Upload(#[from] UploadError),
    #[error("server error: {0}")]
    Server(#[from] ivcap_core::ServerError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("required resource missing: {0}")]
    MissingResource(String),
    #[error("session {session_id} failed: {reason}")]
    SessionFailed { session_id: String, reason: String },
    #[error("timed out waiting for session {0}")]
    WaitTimedOut(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Interview capture ingest control interface", long_about = None)]
pub struct Cli {
    /// Path to ivcap.toml
    #[arg(long, default_value = "configs/ivcap.toml")]
    pub config: PathBuf,
    /// Overrides paths.base_dir
    #[arg(long)]
    pub base_dir: Option<PathBuf>,
    /// Alternative path for sessions.sqlite
    #[arg(long)]
    pub sessions_db: Option<PathBuf>,
    /// Alternative path for jobs.sqlite
    #[arg(long)]
    pub jobs_db: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs the ingest server and the transcode workers
    Serve,
    /// Uploads a directory of recorded fragments as one session
    Upload(UploadArgs),
    /// Inspects recorded sessions
    #[command(subcommand)]
    Session(SessionCommands),
    /// Inspects and maintains the transcode job queue
    #[command(subcommand)]
    Jobs(JobCommands),
    /// Checks config, databases and media tools
    Health,
    /// Prints shell completions
    Completions(CompletionArgs),
}

#[derive(Args, Debug)]
pub struct UploadArgs {
    /// Directory whose files are uploaded in name order as fragments 0..n
    pub dir: PathBuf,
    /// Owner of the session
    #[arg(long)]
    pub user: String,
    /// Reuse this session id instead of letting the server pick one
    #[arg(long)]
    pub session_id: Option<String>,
    /// Overrides uploader.endpoint
    #[arg(long)]
    pub endpoint: Option<String>,
    /// Poll until the session is ready or failed
    #[arg(long, default_value_t = false)]
    pub wait: bool,
    /// Give up waiting after this many seconds
    #[arg(long, default_value_t = 600)]
    pub wait_timeout: u64,
}

#[derive(Subcommand, Debug)]
pub enum SessionCommands {
    /// Shows one session
    Show(SessionShowArgs),
    /// Lists sessions
    List(SessionListArgs),
}

#[derive(Args, Debug)]
pub struct SessionShowArgs {
    pub session_id: String,
}

#[derive(Args, Debug)]
pub struct SessionListArgs {
    /// Filter by status
    #[arg(long)]
    pub status: Option<String>,
    /// Filter by owner
    #[arg(long)]
    pub user: Option<String>,
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Subcommand, Debug)]
pub enum JobCommands {
    /// Lists jobs
    List(JobListArgs),
    /// Counts jobs per status
    Summary,
    /// Requeues jobs left running by a crashed worker
    Recover,
    /// Deletes finished jobs older than the given age
    Cleanup(JobCleanupArgs),
}

#[derive(Args, Debug)]
pub struct JobListArgs {
    #[arg(long)]
    pub status: Option<String>,
    #[arg(long)]
    pub session_id: Option<String>,
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct JobCleanupArgs {
    #[arg(long, default_value_t = 7)]
    pub older_than_days: i64,
}

#[derive(Args, Debug)]
pub struct CompletionArgs {
    #[arg(value_enum)]
    pub shell: Shell,
}

pub async fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions(args) = &cli.command {
        let mut command = Cli::command();
        clap_complete::generate(args.shell, &mut command, "ivcapctl", &mut io::stdout());
        return Ok(());
    }

    let context = AppContext::new(&cli)?;
    match &cli.command {
        Commands::Serve => context.serve().await?,
        Commands::Upload(args) => {
            let report = context.upload(args).await?;
            render(&report, cli.format)?;
        }
        Commands::Session(SessionCommands::Show(args)) => {
            let session = context.session_show(&args.session_id)?;
            render(&session, cli.format)?;
        }
        Commands::Session(SessionCommands::List(args)) => {
            let sessions = context.session_list(args)?;
            render(&sessions, cli.format)?;
        }
        Commands::Jobs(JobCommands::List(args)) => {
            let jobs = context.job_list(args)?;
            render(&jobs, cli.format)?;
        }
        Commands::Jobs(JobCommands::Summary) => {
            let summary = context.job_summary()?;
            render(&summary, cli.format)?;
        }
        Commands::Jobs(JobCommands::Recover) => {
            let recovered = context.jobs()?.recover_running()?;
            render(&Affected::new("recovered", recovered), cli.format)?;
        }
        Commands::Jobs(JobCommands::Cleanup(args)) => {
            let removed = context
                .jobs()?
                .cleanup_finished(chrono::Duration::days(args.older_than_days))?;
            render(&Affected::new("removed", removed), cli.format)?;
        }
        Commands::Health => {
            let report = context.health_check();
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::MissingResource(
                    "one or more health checks failed".to_string(),
                ));
            }
        }
        Commands::Completions(_) => {}
    }
    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
struct AppContext {
    config: IvcapConfig,
    config_path: PathBuf,
    sessions_db: PathBuf,
    jobs_db: PathBuf,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let mut config = load_config(&cli.config)?;
        if let Some(base) = &cli.base_dir {
            config.paths.base_dir = base.display().to_string();
        }
        let sessions_db = cli
            .sessions_db
            .clone()
            .unwrap_or_else(|| config.sessions_db());
        let jobs_db = cli.jobs_db.clone().unwrap_or_else(|| config.jobs_db());
        Ok(Self {
            config,
            config_path: cli.config.clone(),
            sessions_db,
            jobs_db,
        })
    }

    async fn serve(&self) -> Result<()> {
        let services = Services::from_config(&self.config, Arc::new(SystemCommandExecutor))?;
        let shutdown = async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
            }
        };
        let stats = ivcap_core::serve(&self.config, services, shutdown).await?;
        info!(
            completed = stats.completed,
            requeued = stats.requeued,
            failed = stats.failed,
            "server exited"
        );
        Ok(())
    }

    async fn upload(&self, args: &UploadArgs) -> Result<UploadReport> {
        let files = fragment_files(&args.dir)?;
        if files.is_empty() {
            return Err(AppError::MissingResource(format!(
                "no fragment files in {}",
                args.dir.display()
            )));
        }
        let mut section = self.config.uploader.clone();
        if let Some(endpoint) = &args.endpoint {
            section.endpoint = endpoint.clone();
        }
        let client = HttpIngestClient::from_config(&section)?;
        let session = client
            .create_session(&CreateSessionRequest {
                session_id: args.session_id.clone(),
                user_id: args.user.clone(),
            })
            .await?;
        info!(session_id = %session.session_id, fragments = files.len(), "uploading session");

        let uploader = Uploader::new(
            Arc::new(client.clone()),
            UploaderSettings::from(&section),
        );
        for (index, path) in files.iter().enumerate() {
            let payload = tokio::fs::read(path).await?;
            uploader.enqueue(Fragment::new(&session.session_id, index as u64, payload))?;
        }
        let drained = uploader.drain().await;
        let outcome = client
            .finalize(
                &session.session_id,
                &FinalizeRequest {
                    user_id: args.user.clone(),
                    failed_fragments: drained.failed(),
                },
            )
            .await?;

        let mut report = UploadReport {
            session_id: session.session_id.clone(),
            fragments: drained.total,
            uploaded: drained.uploaded,
            failed_indices: drained.failed_indices,
            bytes: drained.bytes_transferred,
            job_id: outcome.job_id,
            status: outcome.status,
            playback_url: None,
        };
        if args.wait {
            let finished = wait_for_session(
                &client,
                &session.session_id,
                Duration::from_secs(args.wait_timeout),
            )
            .await?;
            report.status = finished.status;
            report.playback_url = finished.playback_url;
        }
        Ok(report)
    }

    fn sessions(&self) -> Result<SqliteSessionStore> {
        ensure_exists(&self.sessions_db)?;
        Ok(SqliteSessionStore::builder()
            .path(&self.sessions_db)
            .read_only(true)
            .create_if_missing(false)
            .build()?)
    }

    fn jobs(&self) -> Result<JobQueueStore> {
        ensure_exists(&self.jobs_db)?;
        Ok(JobQueueStore::builder()
            .path(&self.jobs_db)
            .create_if_missing(false)
            .build()?)
    }

    fn session_show(&self, session_id: &str) -> Result<SessionDetail> {
        let session = self.sessions()?.get(session_id)?;
        let jobs = self.jobs()?.list(&JobFilter {
            session_id: Some(session_id.to_string()),
            ..JobFilter::default()
        })?;
        Ok(SessionDetail { session, jobs })
    }

    fn session_list(&self, args: &SessionListArgs) -> Result<SessionList> {
        let status = args
            .status
            .as_deref()
            .map(str::parse::<SessionStatus>)
            .transpose()?;
        let rows = self.sessions()?.list(&SessionFilter {
            status,
            user_id: args.user.clone(),
            limit: Some(args.limit),
        })?;
        Ok(SessionList { rows })
    }

    fn job_list(&self, args: &JobListArgs) -> Result<JobList> {
        let status = args
            .status
            .as_deref()
            .map(str::parse::<JobStatus>)
            .transpose()?;
        let rows = self.jobs()?.list(&JobFilter {
            status,
            session_id: args.session_id.clone(),
            limit: Some(args.limit),
        })?;
        Ok(JobList { rows })
    }

    fn job_summary(&self) -> Result<JobCounts> {
        let summary = self.jobs()?.summary()?;
        let counts = summary
            .counts
            .iter()
            .map(|(status, count)| (status.to_string(), *count))
            .collect();
        Ok(JobCounts { counts })
    }

    fn health_check(&self) -> Vec<HealthEntry> {
        let mut results = vec![self.check_path("ivcap.toml", &self.config_path)];
        results.push(check_database("sessions.sqlite", &self.sessions_db));
        results.push(check_database("jobs.sqlite", &self.jobs_db));
        results.push(check_directory("staging", &self.config.staging_dir()));
        results.push(check_directory("output", &self.config.output_dir()));
        results.push(check_tool("ffmpeg", &self.config.transcode.ffmpeg));
        results.push(check_tool("ffprobe", &self.config.transcode.ffprobe));
        results
    }

    fn check_path(&self, name: &str, path: &Path) -> HealthEntry {
        if path.exists() {
            HealthEntry::ok(name, format!("{}", path.display()))
        } else {
            HealthEntry::error(name, format!("{} missing", path.display()))
        }
    }
}

/// Regular files of `dir` in upload order: numeric stems by value, then the
/// rest by name.
fn fragment_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort_by_cached_key(|path| {
        let number = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.parse::<u64>().ok());
        (number.is_none(), number, path.clone())
    });
    Ok(files)
}

async fn wait_for_session(
    client: &HttpIngestClient,
    session_id: &str,
    limit: Duration,
) -> Result<Session> {
    let poll = async {
        loop {
            let session = client.session(session_id).await?;
            match session.status {
                SessionStatus::Ready => return Ok(session),
                SessionStatus::Failed => {
                    return Err(AppError::SessionFailed {
                        session_id: session.session_id,
                        reason: session.failure_reason.unwrap_or_default(),
                    })
                }
                _ => tokio::time::sleep(Duration::from_secs(2)).await,
            }
        }
    };
    tokio::time::timeout(limit, poll)
        .await
        .map_err(|_| AppError::WaitTimedOut(session_id.to_string()))?
}

fn ensure_exists(path: &Path) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(AppError::MissingResource(format!(
            "database missing: {}",
            path.display()
        )))
    }
}

fn check_directory(name: &str, path: &Path) -> HealthEntry {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => HealthEntry::ok(name, format!("{}", path.display())),
        Ok(_) => HealthEntry::warn(name, format!("{} is not a directory", path.display())),
        Err(_) => HealthEntry::warn(name, format!("{} not found", path.display())),
    }
}

fn check_database(name: &str, path: &Path) -> HealthEntry {
    if !path.exists() {
        return HealthEntry::warn(name, format!("{} not found", path.display()));
    }
    match Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY) {
        Ok(conn) => {
            let pragma: rusqlite::Result<String> =
                conn.query_row("PRAGMA integrity_check;", [], |row| row.get(0));
            match pragma {
                Ok(result) if result.eq_ignore_ascii_case("ok") => {
                    HealthEntry::ok(name, "integrity ok")
                }
                Ok(result) => HealthEntry::warn(name, format!("integrity_check: {result}")),
                Err(err) => HealthEntry::warn(name, format!("error: {err}")),
            }
        }
        Err(err) => HealthEntry::error(name, format!("failed to open: {err}")),
    }
}

fn check_tool(name: &str, program: &str) -> HealthEntry {
    match std::process::Command::new(program).arg("-version").output() {
        Ok(output) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout);
            HealthEntry::ok(name, version.lines().next().unwrap_or(program).to_string())
        }
        Ok(output) => HealthEntry::error(
            name,
            format!("{program} exited with status {:?}", output.status.code()),
        ),
        Err(err) => HealthEntry::error(name, format!("{program} not runnable: {err}")),
    }
}

#[derive(Debug, Serialize)]
pub struct UploadReport {
    pub session_id: String,
    pub fragments: u64,
    pub uploaded: u64,
    pub failed_indices: Vec<u64>,
    pub bytes: u64,
    pub job_id: Option<i64>,
    pub status: SessionStatus,
    pub playback_url: Option<String>,
}

impl DisplayFallback for UploadReport {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "session {} | {}/{} fragments | {} bytes | status={}",
            self.session_id, self.uploaded, self.fragments, self.bytes, self.status
        )];
        if !self.failed_indices.is_empty() {
            lines.push(format!("failed fragments: {:?}", self.failed_indices));
        }
        if let Some(job) = self.job_id {
            lines.push(format!("job #{job}"));
        }
        if let Some(url) = &self.playback_url {
            lines.push(format!("playback: {url}"));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct SessionDetail {
    pub session: Session,
    pub jobs: Vec<Job>,
}

impl DisplayFallback for SessionDetail {
    fn display(&self) -> String {
        let mut lines = vec![session_line(&self.session)];
        if let Some(reason) = &self.session.failure_reason {
            lines.push(format!("  failure: {reason}"));
        }
        if let Some(url) = &self.session.playback_url {
            lines.push(format!("  playback: {url}"));
        }
        for job in &self.jobs {
            lines.push(format!("  {}", job_line(job)));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct SessionList {
    pub rows: Vec<Session>,
}

impl DisplayFallback for SessionList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "no sessions".to_string();
        }
        self.rows
            .iter()
            .map(session_line)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn session_line(session: &Session) -> String {
    let duration = session
        .duration_s
        .map(|v| format!("{v:.1}s"))
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{} | user={} | status={} | fragments={} failed={} | segments={} | dur={}",
        session.session_id,
        session.user_id,
        session.status,
        session.fragments_received,
        session.failed_fragments,
        session.segment_count,
        duration
    )
}

#[derive(Debug, Serialize)]
pub struct JobList {
    pub rows: Vec<Job>,
}

impl DisplayFallback for JobList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "queue empty".to_string();
        }
        self.rows.iter().map(job_line).collect::<Vec<_>>().join("\n")
    }
}

fn job_line(job: &Job) -> String {
    let mut line = format!(
        "#{} session={} status={} progress={}% attempts={}/{}",
        job.id, job.session_id, job.status, job.progress, job.attempts, job.max_attempts
    );
    if let Some(reason) = &job.failure_reason {
        line.push_str(&format!(" reason={reason}"));
    }
    line
}

#[derive(Debug, Serialize)]
pub struct JobCounts {
    pub counts: HashMap<String, i64>,
}

impl DisplayFallback for JobCounts {
    fn display(&self) -> String {
        if self.counts.is_empty() {
            return "queue empty".to_string();
        }
        let mut entries: Vec<_> = self.counts.iter().collect();
        entries.sort();
        entries
            .into_iter()
            .map(|(status, count)| format!("  - {status}: {count}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct Affected {
    pub action: &'static str,
    pub count: usize,
}

impl Affected {
    fn new(action: &'static str, count: usize) -> Self {
        Self { action, count }
    }
}

impl DisplayFallback for Affected {
    fn display(&self) -> String {
        format!("{} {} job(s)", self.action, self.count)
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        self.iter()
            .map(|entry| format!("[{}] {}: {}", entry.status, entry.name, entry.detail))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
