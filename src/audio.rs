//! Host audio streams: 8 kHz, mono, signed 16-bit little-endian PCM.
//!
//! Streams are opened by the bridge workers on their own threads and never
//! cross threads afterwards, so only the backend has to be `Send + Sync`.

use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use tracing::debug;

use crate::config::Config;
use crate::errors::AudioError;

pub const SAMPLE_RATE: u32 = 8000;
pub const CHANNELS: u8 = 1;

/// Speaker side: PCM coming from the phone.
pub trait PlaybackStream {
    fn write(&mut self, pcm: &[u8]) -> Result<(), AudioError>;
    /// Block until queued audio has been played.
    fn drain(&mut self) -> Result<(), AudioError>;
}

/// Microphone side: PCM going to the phone.
pub trait CaptureStream {
    /// Fill `pcm` completely, blocking as needed.
    fn read(&mut self, pcm: &mut [u8]) -> Result<(), AudioError>;
}

pub trait AudioBackend: Send + Sync {
    fn open_playback(&self) -> Result<Box<dyn PlaybackStream>, AudioError>;
    fn open_capture(&self) -> Result<Box<dyn CaptureStream>, AudioError>;
}

// ── PulseAudio ────────────────────────────────────────────────────────────────

const APP_NAME: &str = "hfp-bridge";
const PLAYBACK_NAME: &str = "Phone Audio";
const CAPTURE_NAME: &str = "PC Microphone";

/// [`AudioBackend`] on the PulseAudio simple API (also served by PipeWire).
#[derive(Debug, Clone, Default)]
pub struct PulseAudio {
    /// Server to connect to; `None` uses the default.
    pub server: Option<String>,
}

impl PulseAudio {
    pub fn for_config(config: &Config) -> Self {
        Self {
            server: config.pulse_server.clone(),
        }
    }

    fn spec() -> Spec {
        Spec {
            format: Format::S16le,
            channels: CHANNELS,
            rate: SAMPLE_RATE,
        }
    }

    fn open(&self, dir: Direction, stream: &'static str) -> Result<Simple, AudioError> {
        let spec = Self::spec();
        if !spec.is_valid() {
            return Err(AudioError::StreamOpen {
                what: stream,
                reason: "invalid sample spec".into(),
            });
        }
        debug!(stream, "opening PulseAudio stream");
        Simple::new(
            self.server.as_deref(),
            APP_NAME,
            dir,
            None,
            stream,
            &spec,
            None,
            None,
        )
        .map_err(|e| AudioError::StreamOpen {
            what: stream,
            reason: format!("{e}"),
        })
    }
}

impl AudioBackend for PulseAudio {
    fn open_playback(&self) -> Result<Box<dyn PlaybackStream>, AudioError> {
        Ok(Box::new(PulsePlayback(self.open(Direction::Playback, PLAYBACK_NAME)?)))
    }

    fn open_capture(&self) -> Result<Box<dyn CaptureStream>, AudioError> {
        Ok(Box::new(PulseCapture(self.open(Direction::Record, CAPTURE_NAME)?)))
    }
}

struct PulsePlayback(Simple);

impl PlaybackStream for PulsePlayback {
    fn write(&mut self, pcm: &[u8]) -> Result<(), AudioError> {
        self.0.write(pcm).map_err(|e| AudioError::StreamIo {
            what: PLAYBACK_NAME,
            reason: format!("{e}"),
        })
    }

    fn drain(&mut self) -> Result<(), AudioError> {
        self.0.drain().map_err(|e| AudioError::StreamIo {
            what: PLAYBACK_NAME,
            reason: format!("{e}"),
        })
    }
}

struct PulseCapture(Simple);

impl CaptureStream for PulseCapture {
    fn read(&mut self, pcm: &mut [u8]) -> Result<(), AudioError> {
        self.0.read(pcm).map_err(|e| AudioError::StreamIo {
            what: CAPTURE_NAME,
            reason: format!("{e}"),
        })
    }
}

// ── PCM helpers ───────────────────────────────────────────────────────────────

/// Little-endian bytes to samples. A trailing odd byte is ignored.
pub fn bytes_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

/// Write `samples` back over the start of `bytes`.
pub fn samples_to_bytes(samples: &[i16], bytes: &mut [u8]) {
    for (dst, s) in bytes.chunks_exact_mut(2).zip(samples) {
        dst.copy_from_slice(&s.to_le_bytes());
    }
}
