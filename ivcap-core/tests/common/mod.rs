#![allow(dead_code)]

use std::collections::HashSet;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Output};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tempfile::TempDir;
use tokio::process::Command;

use ivcap_core::coordinator::CoordinatorError;
use ivcap_core::{
    load_config, CommandExecutor, Coordinator, Fragment, FragmentAck, FragmentTransport,
    IvcapConfig, RetryPolicy, Services, UploadError, UploaderSettings,
};

pub const EBML_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];
/// The fake tools treat this many bytes of merged input as one second.
pub const BYTES_PER_SECOND: usize = 200;
pub const FRAGMENT_SECONDS: usize = 5;

pub fn fixture_config() -> IvcapConfig {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../configs/ivcap.toml");
    load_config(path).expect("load config")
}

/// Payload of `seconds` of fake media; index 0 carries the WebM header.
pub fn fragment_payload(index: u64, seconds: usize) -> Bytes {
    let len = seconds * BYTES_PER_SECOND;
    let mut payload = BytesMut::with_capacity(len);
    if index == 0 {
        payload.put_slice(&EBML_MAGIC);
    }
    while payload.len() < len {
        payload.put_u8((index % 251) as u8);
    }
    payload.freeze()
}

fn exit(code: i32, stdout: Vec<u8>, stderr: &str) -> Output {
    Output {
        status: ExitStatus::from_raw(code << 8),
        stdout,
        stderr: stderr.as_bytes().to_vec(),
    }
}

/// Stands in for ffprobe and ffmpeg. Durations derive from the input size.
#[derive(Default)]
pub struct FakeMediaTools {
    pub encoder_failures: AtomicU32,
    pub encoder_panics: AtomicU32,
    pub encodes: AtomicU32,
    pub no_video: std::sync::atomic::AtomicBool,
    pub last_input: Mutex<Vec<u8>>,
}

impl FakeMediaTools {
    pub fn last_input(&self) -> Vec<u8> {
        self.last_input.lock().unwrap().clone()
    }

    pub fn encodes(&self) -> u32 {
        self.encodes.load(Ordering::SeqCst)
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    fn probe(&self, args: &[String]) -> std::io::Result<Output> {
        let input = args.last().expect("probe input");
        let size = std::fs::metadata(input)?.len() as f64;
        let mut streams = vec![serde_json::json!({"codec_type": "audio"})];
        if !self.no_video.load(Ordering::SeqCst) {
            streams.push(serde_json::json!({"codec_type": "video"}));
        }
        let body = serde_json::json!({
            "streams": streams,
            "format": {
                "format_name": "matroska,webm",
                "duration": format!("{:.6}", size / BYTES_PER_SECOND as f64),
            }
        });
        Ok(exit(0, serde_json::to_vec(&body).unwrap(), ""))
    }

    fn encode(&self, args: &[String]) -> std::io::Result<Output> {
        self.encodes.fetch_add(1, Ordering::SeqCst);
        if Self::take(&self.encoder_panics) {
            panic!("encoder crashed");
        }
        if Self::take(&self.encoder_failures) {
            return Ok(exit(1, Vec::new(), "Conversion failed!"));
        }
        let value_of = |flag: &str| {
            args.iter()
                .position(|arg| arg == flag)
                .and_then(|pos| args.get(pos + 1))
                .expect("flag present")
                .clone()
        };
        let input = std::fs::read(value_of("-i"))?;
        let segment: f64 = value_of("-hls_time").parse().expect("numeric hls_time");
        *self.last_input.lock().unwrap() = input.clone();

        let playlist = PathBuf::from(args.last().expect("playlist path"));
        let dir = playlist.parent().expect("output dir").to_path_buf();
        let mut remaining = input.len() as f64 / BYTES_PER_SECOND as f64;
        let mut body = format!("#EXTM3U\n#EXT-X-VERSION:6\n#EXT-X-TARGETDURATION:{segment}\n");
        let mut index = 0;
        while remaining > 1e-9 {
            let duration = remaining.min(segment);
            let name = format!("segment_{index:05}.ts");
            std::fs::write(dir.join(&name), format!("ts-{index}"))?;
            body.push_str(&format!("#EXTINF:{duration:.6},\n{name}\n"));
            remaining -= duration;
            index += 1;
        }
        body.push_str("#EXT-X-ENDLIST\n");
        std::fs::write(&playlist, body)?;
        Ok(exit(0, Vec::new(), ""))
    }
}

#[async_trait]
impl CommandExecutor for FakeMediaTools {
    async fn run(&self, command: &mut Command) -> std::io::Result<Output> {
        let std = command.as_std();
        let program = std.get_program().to_string_lossy().into_owned();
        let args: Vec<String> = std
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        if program.ends_with("ffprobe") {
            self.probe(&args)
        } else if program.ends_with("ffmpeg") {
            self.encode(&args)
        } else {
            Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("unexpected program {program}"),
            ))
        }
    }
}

/// A full server side rooted in a temporary directory.
pub struct Harness {
    pub dir: TempDir,
    pub config: IvcapConfig,
    pub services: Services,
    pub tools: Arc<FakeMediaTools>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut IvcapConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = fixture_config();
        config.paths.base_dir = dir.path().to_string_lossy().into_owned();
        config.worker.pool_size = 2;
        adjust(&mut config);
        let tools = Arc::new(FakeMediaTools::default());
        let services = Services::from_config(&config, tools.clone()).expect("build services");
        Self {
            dir,
            config,
            services,
            tools,
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.services.coordinator
    }

    pub fn transport(&self) -> Arc<InProcessTransport> {
        Arc::new(InProcessTransport::new(self.coordinator().clone()))
    }
}

/// Delivers fragments straight into a coordinator, optionally refusing
/// some indices the way an unreachable server would.
pub struct InProcessTransport {
    coordinator: Coordinator,
    refuse: HashSet<u64>,
    pub deliveries: AtomicU32,
}

impl InProcessTransport {
    pub fn new(coordinator: Coordinator) -> Self {
        Self {
            coordinator,
            refuse: HashSet::new(),
            deliveries: AtomicU32::new(0),
        }
    }

    pub fn refusing(mut self, indices: impl IntoIterator<Item = u64>) -> Self {
        self.refuse.extend(indices);
        self
    }
}

#[async_trait]
impl FragmentTransport for InProcessTransport {
    async fn deliver(&self, fragment: &Fragment) -> Result<FragmentAck, UploadError> {
        self.deliveries.fetch_add(1, Ordering::SeqCst);
        if self.refuse.contains(&fragment.index) {
            return Err(UploadError::Http {
                status: 503,
                body: "ingest unavailable".into(),
            });
        }
        self.coordinator
            .accept_fragment(&fragment.session_id, fragment.index, fragment.payload.clone())
            .await
            .map_err(|err: CoordinatorError| UploadError::Http {
                status: 500,
                body: err.to_string(),
            })
    }
}

pub fn fast_uploader_settings(max_concurrent: usize) -> UploaderSettings {
    UploaderSettings {
        max_concurrent,
        retry: RetryPolicy::new(3, Duration::from_millis(1)),
    }
}
