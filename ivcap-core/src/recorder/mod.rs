//! Client-side capture: turns a live device into fixed-interval fragments.

mod error;
mod format;
mod mixer;
mod state;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::RecorderSection;
use crate::fragment::{Fragment, FragmentSink};

pub use error::{AudioError, RecorderError, RecorderResult};
pub use format::{container_extension, negotiate, NegotiatedFormat, GENERIC_FALLBACK_FORMAT};
pub use mixer::{
    mix_frames, select_audio_track, AudioSource, MixGains, MixHealth, MixedAudioSource, PcmFormat,
    PcmFrame,
};
pub use state::{RecorderEvent, RecorderState};

#[cfg(test)]
pub(crate) use mixer::testing::ScriptedAudio;

/// A live capture + encoder pair (camera/microphone feeding a container muxer).
#[async_trait]
pub trait CaptureDevice: Send {
    fn supports_format(&self, mime_type: &str) -> bool;

    /// Hands over the device's own microphone track, if it has one.
    fn take_primary_audio(&mut self) -> Option<Box<dyn AudioSource>>;

    async fn start(
        &mut self,
        format: &NegotiatedFormat,
        audio: Option<Box<dyn AudioSource>>,
    ) -> RecorderResult<()>;

    /// Encoded bytes as they become available, `Ok(None)` once the capture
    /// track has ended. Must be cancel-safe.
    async fn next_data(&mut self) -> RecorderResult<Option<Bytes>>;

    /// Stops capture and returns whatever the encoder still had buffered.
    async fn stop(&mut self) -> RecorderResult<Bytes>;
}

#[derive(Debug, Clone)]
pub struct RecorderSettings {
    pub fragment_interval: Duration,
    pub preferred_formats: Vec<String>,
    pub fallback_format: String,
    pub mix_secondary_audio: bool,
    pub gains: MixGains,
    pub secondary_audio_timeout: Duration,
}

impl From<&RecorderSection> for RecorderSettings {
    fn from(section: &RecorderSection) -> Self {
        Self {
            fragment_interval: section.fragment_interval(),
            preferred_formats: section.preferred_formats.clone(),
            fallback_format: section.fallback_format.clone(),
            mix_secondary_audio: section.mix_secondary_audio,
            gains: MixGains {
                primary: section.primary_gain,
                secondary: section.secondary_gain,
            },
            secondary_audio_timeout: section.secondary_audio_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordingSummary {
    pub session_id: String,
    pub fragments: u64,
    pub bytes: u64,
    pub format: String,
    pub mixed_audio: bool,
    /// The secondary input was dropped mid-recording.
    pub audio_degraded: bool,
}

#[derive(Debug, Clone)]
pub struct Recorder {
    settings: RecorderSettings,
}

impl Recorder {
    pub fn new(settings: RecorderSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &RecorderSettings {
        &self.settings
    }

    /// Negotiates a format, wires the audio graph and starts emitting
    /// fragments into `sink` from a background task.
    pub async fn start<D>(
        &self,
        session_id: impl Into<String>,
        mut device: D,
        secondary_audio: Option<Box<dyn AudioSource>>,
        sink: Arc<dyn FragmentSink>,
    ) -> RecorderResult<RecordingHandle>
    where
        D: CaptureDevice + 'static,
    {
        let session_id = session_id.into();
        let state = RecorderState::Idle.apply(RecorderEvent::Start)?;

        let format = negotiate(
            &self.settings.preferred_formats,
            &self.settings.fallback_format,
            |mime| device.supports_format(mime),
        );

        let primary = device.take_primary_audio();
        let secondary = if self.settings.mix_secondary_audio {
            secondary_audio
        } else {
            None
        };
        let (audio, mix_health) = match primary {
            Some(primary) => {
                let (track, health) = select_audio_track(
                    primary,
                    secondary,
                    self.settings.gains,
                    self.settings.secondary_audio_timeout,
                );
                (Some(track), health)
            }
            None => (None, None),
        };
        let mixed_audio = mix_health.is_some();

        device.start(&format, audio).await?;
        info!(session_id = %session_id, format = %format.mime_type, mixed_audio, "recording started");

        let (state_tx, state_rx) = watch::channel(state);
        let (stop_tx, stop_rx) = oneshot::channel();
        let emitter = FragmentEmitter {
            session_id: session_id.clone(),
            next_index: 0,
            bytes: 0,
            sink,
        };
        let run = RecordingLoop {
            device,
            emitter,
            state: state_tx,
            interval: self.settings.fragment_interval,
            format: format.mime_type.clone(),
            mix_health,
        };
        let task = tokio::spawn(run.run(stop_rx));

        Ok(RecordingHandle {
            session_id,
            format,
            mixed_audio,
            state: state_rx,
            stop_tx: Some(stop_tx),
            task,
        })
    }
}

pub struct RecordingHandle {
    session_id: String,
    format: NegotiatedFormat,
    mixed_audio: bool,
    state: watch::Receiver<RecorderState>,
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<RecorderResult<RecordingSummary>>,
}

impl fmt::Debug for RecordingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingHandle")
            .field("session_id", &self.session_id)
            .field("format", &self.format)
            .field("mixed_audio", &self.mixed_audio)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl RecordingHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn format(&self) -> &NegotiatedFormat {
        &self.format
    }

    pub fn mixed_audio(&self) -> bool {
        self.mixed_audio
    }

    pub fn state(&self) -> RecorderState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RecorderState> {
        self.state.clone()
    }

    /// Normal end of a recording: flush the tail as a final fragment.
    pub async fn stop(mut self) -> RecorderResult<RecordingSummary> {
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(());
        }
        self.task.await?
    }

    /// Waits for the capture to end on its own (track ended or device error).
    pub async fn wait(mut self) -> RecorderResult<RecordingSummary> {
        let stop = self.stop_tx.take();
        let result = (&mut self.task).await;
        drop(stop);
        result?
    }
}

struct FragmentEmitter {
    session_id: String,
    next_index: u64,
    bytes: u64,
    sink: Arc<dyn FragmentSink>,
}

impl FragmentEmitter {
    fn emit(&mut self, buffer: &mut BytesMut) {
        if buffer.is_empty() {
            return;
        }
        let payload = buffer.split().freeze();
        let index = self.next_index;
        let size = payload.len() as u64;
        self.next_index += 1;
        self.bytes += size;
        debug!(session_id = %self.session_id, index, bytes = size, "fragment ready");
        if let Err(err) = self
            .sink
            .submit(Fragment::new(self.session_id.clone(), index, payload))
        {
            warn!(error = %err, "fragment dropped");
        }
    }
}

struct RecordingLoop<D> {
    device: D,
    emitter: FragmentEmitter,
    state: watch::Sender<RecorderState>,
    interval: Duration,
    format: String,
    mix_health: Option<MixHealth>,
}

impl<D: CaptureDevice> RecordingLoop<D> {
    async fn run(mut self, mut stop_rx: oneshot::Receiver<()>) -> RecorderResult<RecordingSummary> {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buffer = BytesMut::new();

        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = ticker.tick() => self.emitter.emit(&mut buffer),
                data = self.device.next_data() => match data {
                    Ok(Some(bytes)) => buffer.extend_from_slice(&bytes),
                    Ok(None) => {
                        info!(session_id = %self.emitter.session_id, "capture track ended");
                        break;
                    }
                    Err(err) => return Err(self.fail(&mut buffer, err)),
                },
            }
        }

        self.advance(RecorderEvent::Stop)?;
        match self.device.stop().await {
            Ok(tail) => buffer.extend_from_slice(&tail),
            Err(err) => return Err(self.fail(&mut buffer, err)),
        }
        self.emitter.emit(&mut buffer);
        self.advance(RecorderEvent::Flushed)?;
        info!(
            session_id = %self.emitter.session_id,
            fragments = self.emitter.next_index,
            bytes = self.emitter.bytes,
            "recording stopped"
        );
        Ok(self.summary())
    }

    /// Captured bytes are still valid after a device error, so they are
    /// emitted before the recorder enters its error state.
    fn fail(&mut self, buffer: &mut BytesMut, err: RecorderError) -> RecorderError {
        warn!(session_id = %self.emitter.session_id, error = %err, "capture device failed");
        self.emitter.emit(buffer);
        if let Err(transition) = self.advance(RecorderEvent::DeviceFailed) {
            warn!(error = %transition, "recorder already terminal");
        }
        err
    }

    fn advance(&self, event: RecorderEvent) -> RecorderResult<()> {
        let current = *self.state.borrow();
        let next = current.apply(event)?;
        self.state.send_replace(next);
        Ok(())
    }

    fn summary(&self) -> RecordingSummary {
        RecordingSummary {
            session_id: self.emitter.session_id.clone(),
            fragments: self.emitter.next_index,
            bytes: self.emitter.bytes,
            format: self.format.clone(),
            mixed_audio: self.mix_health.is_some(),
            audio_degraded: self
                .mix_health
                .as_ref()
                .is_some_and(MixHealth::degraded),
        }
    }
}
