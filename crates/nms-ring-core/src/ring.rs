//! Ring player: audible alert for a flushed aggregation window.
//!
//! Sound selection is two-tier. If the operator dropped a `customRing.*`
//! file next to the executable, that file plays for every alert and
//! severity-based selection is bypassed entirely. Otherwise the player
//! synthesizes a chime whose pitch and beep count rise with the grade.
//!
//! Playback is synchronous: `play` returns when the sound has finished.
//! A minimum-threshold gate turns low-grade alerts into no-ops.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rodio::source::{SineWave, Source, Zero};
use rodio::{Decoder, OutputStream, Sink};
use tracing::{debug, error, info};

use crate::aggregate::Notify;
use crate::level::Severity;
use crate::types::ProxyError;

/// Override file names probed next to the executable, in priority order.
const CUSTOM_RING_NAMES: [&str; 3] = ["customRing.ogg", "customRing.wav", "customRing.mp3"];

const BEEP_DURATION: Duration = Duration::from_millis(180);
const BEEP_GAP: Duration = Duration::from_millis(90);
const BEEP_VOLUME: f32 = 0.25;

/// What `play` would emit for a given level. Factored out of playback so the
/// selection policy is testable without an audio device.
#[derive(Debug, Clone, PartialEq)]
pub enum RingSound {
    /// The operator-supplied override file.
    Override(PathBuf),
    /// Synthesized chime: `beeps` tones at `freq_hz`.
    Chime { freq_hz: f32, beeps: u32 },
}

pub struct RingPlayer {
    threshold: Severity,
    custom: Option<CustomRing>,
}

struct CustomRing {
    path: PathBuf,
    bytes: Vec<u8>,
}

impl RingPlayer {
    pub fn new(threshold: Severity) -> Self {
        Self {
            threshold,
            custom: None,
        }
    }

    /// Probe `dir` for an override ring file. First hit in priority order
    /// (ogg, wav, mp3) wins.
    pub fn probe_custom_ring(dir: &Path) -> Option<PathBuf> {
        CUSTOM_RING_NAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.is_file())
    }

    /// Install an override ring. The extension must be one of ogg/wav/mp3
    /// and the file must decode; both failures are fatal at startup.
    pub fn set_custom_ring(&mut self, path: &Path) -> Result<(), ProxyError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        if !matches!(ext.as_str(), "ogg" | "wav" | "mp3") {
            return Err(ProxyError::UnsupportedFormat(path.display().to_string()));
        }

        let bytes = std::fs::read(path)
            .map_err(|e| ProxyError::Playback(format!("cannot read {}: {e}", path.display())))?;
        // Validate now so a broken file fails the startup, not the first alert.
        Decoder::new(Cursor::new(bytes.clone()))
            .map_err(|e| ProxyError::Playback(format!("cannot decode {}: {e}", path.display())))?;

        info!(path = %path.display(), "custom ring installed");
        self.custom = Some(CustomRing {
            path: path.to_path_buf(),
            bytes,
        });
        Ok(())
    }

    pub fn is_custom_ring_set(&self) -> bool {
        self.custom.is_some()
    }

    /// The sound `play(level)` would emit, or `None` below the threshold.
    pub fn select_sound(&self, level: Severity) -> Option<RingSound> {
        if level < self.threshold {
            return None;
        }
        if let Some(custom) = &self.custom {
            return Some(RingSound::Override(custom.path.clone()));
        }
        Some(RingSound::Chime {
            freq_hz: chime_freq(level),
            beeps: chime_beeps(level),
        })
    }

    /// Play the alert for `level`. No-op below the threshold; otherwise
    /// blocks until playback completes.
    pub fn play(&self, level: Severity) -> Result<(), ProxyError> {
        let Some(sound) = self.select_sound(level) else {
            debug!(%level, threshold = %self.threshold, "below threshold, not ringing");
            return Ok(());
        };

        let (_stream, handle) = OutputStream::try_default()
            .map_err(|e| ProxyError::Playback(format!("no audio output: {e}")))?;
        let sink = Sink::try_new(&handle)
            .map_err(|e| ProxyError::Playback(format!("cannot open sink: {e}")))?;

        match sound {
            RingSound::Override(_) => {
                // Decodability was checked at startup; a failure here means
                // the device, not the file.
                let bytes = self.custom.as_ref().map(|c| c.bytes.clone()).unwrap_or_default();
                let source = Decoder::new(Cursor::new(bytes))
                    .map_err(|e| ProxyError::Playback(format!("decode failed: {e}")))?;
                sink.append(source);
            }
            RingSound::Chime { freq_hz, beeps } => {
                for i in 0..beeps {
                    if i > 0 {
                        sink.append(Zero::<f32>::new(1, 44_100).take_duration(BEEP_GAP));
                    }
                    sink.append(
                        SineWave::new(freq_hz)
                            .take_duration(BEEP_DURATION)
                            .amplify(BEEP_VOLUME),
                    );
                }
            }
        }

        sink.sleep_until_end();
        Ok(())
    }
}

/// Chime pitch rises with the grade: E sits at 440 Hz, SSS near the top of
/// the scale.
fn chime_freq(level: Severity) -> f32 {
    440.0 + 110.0 * f32::from(level.rank())
}

/// High grades beep more.
fn chime_beeps(level: Severity) -> u32 {
    match level {
        Severity::E | Severity::D | Severity::C | Severity::B | Severity::A => 1,
        Severity::S => 2,
        Severity::Ss | Severity::SsPlus => 3,
        Severity::Sss => 4,
    }
}

/// The aggregator rings through this adapter; playback failures end up in
/// the log, not in the flush loop's control flow.
impl Notify for RingPlayer {
    fn notify(&self, level: Severity) {
        if let Err(e) = self.play(level) {
            error!(error = %e, %level, "ring playback failed");
        }
    }
}

/// Convenience for the binary: probe and install in one step.
pub fn init_player(threshold: Severity, exe_dir: Option<&Path>) -> Result<Arc<RingPlayer>, ProxyError> {
    let mut player = RingPlayer::new(threshold);
    if let Some(dir) = exe_dir {
        if let Some(path) = RingPlayer::probe_custom_ring(dir) {
            player.set_custom_ring(&path)?;
        }
    }
    Ok(Arc::new(player))
}
