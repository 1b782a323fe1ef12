//! Two-input audio graph: the candidate's microphone plus an external voice
//! track, summed into the single track handed to the encoder.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{info, warn};

use super::error::AudioError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl fmt::Display for PcmFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Hz/{}ch", self.sample_rate, self.channels)
    }
}

/// Interleaved signed 16-bit samples.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PcmFrame {
    pub samples: Vec<i16>,
}

impl PcmFrame {
    pub fn new(samples: Vec<i16>) -> Self {
        Self { samples }
    }
}

#[async_trait]
pub trait AudioSource: Send {
    fn format(&self) -> PcmFormat;

    /// `Ok(None)` once the track has ended.
    async fn next_frame(&mut self) -> Result<Option<PcmFrame>, AudioError>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixGains {
    pub primary: f32,
    pub secondary: f32,
}

impl Default for MixGains {
    fn default() -> Self {
        Self {
            primary: 1.0,
            secondary: 1.0,
        }
    }
}

/// Sums two frames sample by sample with saturation. The shorter frame is
/// treated as silence past its end.
pub fn mix_frames(primary: &PcmFrame, secondary: &PcmFrame, gains: MixGains) -> PcmFrame {
    let len = primary.samples.len().max(secondary.samples.len());
    let mut samples = Vec::with_capacity(len);
    for i in 0..len {
        let a = primary.samples.get(i).copied().unwrap_or(0) as f32 * gains.primary;
        let b = secondary.samples.get(i).copied().unwrap_or(0) as f32 * gains.secondary;
        let mixed = (a + b).round().clamp(i16::MIN as f32, i16::MAX as f32);
        samples.push(mixed as i16);
    }
    PcmFrame { samples }
}

/// Shared view of a mixed track; set once the secondary input has been
/// dropped because of a failure or a stall.
#[derive(Debug, Clone, Default)]
pub struct MixHealth(Arc<AtomicBool>);

impl MixHealth {
    pub fn degraded(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn mark_degraded(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

pub struct MixedAudioSource {
    primary: Box<dyn AudioSource>,
    secondary: Option<Box<dyn AudioSource>>,
    gains: MixGains,
    secondary_timeout: Duration,
    health: MixHealth,
}

impl fmt::Debug for MixedAudioSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MixedAudioSource")
            .field("format", &self.primary.format())
            .field("gains", &self.gains)
            .field("mixing", &self.secondary.is_some())
            .field("degraded", &self.health.degraded())
            .finish()
    }
}

impl MixedAudioSource {
    /// Fails (handing both sources back) when the layouts cannot be summed.
    /// A secondary frame that takes longer than `secondary_timeout` drops the
    /// secondary input for the rest of the recording.
    pub fn try_new(
        primary: Box<dyn AudioSource>,
        secondary: Box<dyn AudioSource>,
        gains: MixGains,
        secondary_timeout: Duration,
    ) -> Result<Self, (AudioError, Box<dyn AudioSource>, Box<dyn AudioSource>)> {
        let (p, s) = (primary.format(), secondary.format());
        if p != s {
            let error = AudioError::FormatMismatch {
                primary: p.to_string(),
                secondary: s.to_string(),
            };
            return Err((error, primary, secondary));
        }
        Ok(Self {
            primary,
            secondary: Some(secondary),
            gains,
            secondary_timeout,
            health: MixHealth::default(),
        })
    }

    pub fn health(&self) -> MixHealth {
        self.health.clone()
    }

    fn degrade(&mut self) {
        self.secondary = None;
        self.health.mark_degraded();
    }
}

#[async_trait]
impl AudioSource for MixedAudioSource {
    fn format(&self) -> PcmFormat {
        self.primary.format()
    }

    async fn next_frame(&mut self) -> Result<Option<PcmFrame>, AudioError> {
        let Some(primary) = self.primary.next_frame().await? else {
            return Ok(None);
        };
        let Some(secondary) = self.secondary.as_mut() else {
            return Ok(Some(primary));
        };
        match timeout(self.secondary_timeout, secondary.next_frame()).await {
            Ok(Ok(Some(frame))) => Ok(Some(mix_frames(&primary, &frame, self.gains))),
            Ok(Ok(None)) => {
                info!("secondary audio track ended; continuing with primary only");
                self.secondary = None;
                Ok(Some(primary))
            }
            Ok(Err(err)) => {
                warn!(error = %err, "secondary audio failed; degrading to primary only");
                self.degrade();
                Ok(Some(primary))
            }
            Err(_) => {
                warn!(
                    wait = ?self.secondary_timeout,
                    "secondary audio stalled; degrading to primary only"
                );
                self.degrade();
                Ok(Some(primary))
            }
        }
    }
}

/// Builds the track handed to the encoder. Mixing problems never abort the
/// recording: the primary stream is returned alone instead. The health handle
/// is present only when the secondary input is actually mixed in.
pub fn select_audio_track(
    primary: Box<dyn AudioSource>,
    secondary: Option<Box<dyn AudioSource>>,
    gains: MixGains,
    secondary_timeout: Duration,
) -> (Box<dyn AudioSource>, Option<MixHealth>) {
    let Some(secondary) = secondary else {
        return (primary, None);
    };
    match MixedAudioSource::try_new(primary, secondary, gains, secondary_timeout) {
        Ok(mixed) => {
            let health = mixed.health();
            (Box::new(mixed), Some(health))
        }
        Err((err, primary, _secondary)) => {
            warn!(error = %err, "audio mixing unavailable; recording primary stream only");
            (primary, None)
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedAudio;
    use super::*;

    const STEREO_48K: PcmFormat = PcmFormat {
        sample_rate: 48_000,
        channels: 2,
    };
    const FRAME_WAIT: Duration = Duration::from_millis(40);

    fn frame(samples: &[i16]) -> Result<PcmFrame, AudioError> {
        Ok(PcmFrame::new(samples.to_vec()))
    }

    #[test]
    fn mixing_saturates_instead_of_wrapping() {
        let a = PcmFrame::new(vec![30_000, -30_000, 10]);
        let b = PcmFrame::new(vec![10_000, -10_000]);
        let mixed = mix_frames(&a, &b, MixGains::default());
        assert_eq!(mixed.samples, vec![i16::MAX, i16::MIN, 10]);
    }

    #[test]
    fn gains_scale_each_input() {
        let a = PcmFrame::new(vec![100, 200]);
        let b = PcmFrame::new(vec![100, 200]);
        let mixed = mix_frames(
            &a,
            &b,
            MixGains {
                primary: 1.0,
                secondary: 0.5,
            },
        );
        assert_eq!(mixed.samples, vec![150, 300]);
    }

    #[tokio::test]
    async fn mismatched_formats_fall_back_to_primary() {
        let primary = ScriptedAudio::new(STEREO_48K, vec![frame(&[1, 2])]);
        let secondary = ScriptedAudio::new(
            PcmFormat {
                sample_rate: 16_000,
                channels: 1,
            },
            vec![frame(&[5])],
        );
        let (mut track, health) = select_audio_track(
            Box::new(primary),
            Some(Box::new(secondary)),
            MixGains::default(),
            FRAME_WAIT,
        );
        assert!(health.is_none());
        let first = track.next_frame().await.unwrap().unwrap();
        assert_eq!(first.samples, vec![1, 2]);
    }

    #[tokio::test]
    async fn secondary_failure_mid_stream_degrades() {
        let primary = ScriptedAudio::new(
            STEREO_48K,
            vec![frame(&[10, 10]), frame(&[20, 20]), frame(&[30, 30])],
        );
        let secondary = ScriptedAudio::new(
            STEREO_48K,
            vec![
                frame(&[1, 1]),
                Err(AudioError::Source("remote peer dropped".into())),
            ],
        );
        let mut mixed = MixedAudioSource::try_new(
            Box::new(primary),
            Box::new(secondary),
            MixGains::default(),
            FRAME_WAIT,
        )
        .map_err(|(err, _, _)| err)
        .unwrap();
        let health = mixed.health();

        assert_eq!(mixed.next_frame().await.unwrap().unwrap().samples, vec![11, 11]);
        assert!(!health.degraded());
        assert_eq!(mixed.next_frame().await.unwrap().unwrap().samples, vec![20, 20]);
        assert!(health.degraded());
        assert_eq!(mixed.next_frame().await.unwrap().unwrap().samples, vec![30, 30]);
        assert!(mixed.next_frame().await.unwrap().is_none());
    }

    /// Never yields a frame and never fails.
    struct StalledAudio(PcmFormat);

    #[async_trait]
    impl AudioSource for StalledAudio {
        fn format(&self) -> PcmFormat {
            self.0
        }

        async fn next_frame(&mut self) -> Result<Option<PcmFrame>, AudioError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_secondary_is_dropped_after_one_frame_wait() {
        let primary = ScriptedAudio::new(STEREO_48K, vec![frame(&[7, 7]), frame(&[8, 8])]);
        let (mut track, health) = select_audio_track(
            Box::new(primary),
            Some(Box::new(StalledAudio(STEREO_48K))),
            MixGains::default(),
            FRAME_WAIT,
        );
        let health = health.expect("formats agree, so the track is mixed");

        let started = tokio::time::Instant::now();
        let first = tokio::time::timeout(Duration::from_secs(30), track.next_frame())
            .await
            .expect("primary frame is not held back by the stalled input")
            .unwrap()
            .unwrap();
        assert_eq!(first.samples, vec![7, 7]);
        let waited = started.elapsed();
        assert!(waited >= FRAME_WAIT && waited < Duration::from_secs(1));
        assert!(health.degraded());

        let second = track.next_frame().await.unwrap().unwrap();
        assert_eq!(second.samples, vec![8, 8]);
        assert_eq!(started.elapsed(), waited);
    }
}
