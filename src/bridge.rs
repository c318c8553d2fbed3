//! The two audio workers of an open SCO link.
//!
//! Playback: SCO → (render FIFO) → speaker.
//! Capture:  microphone → (echo canceller) → SCO, in MTU-sized chunks.
//!
//! Both check the shared running flag every iteration; `ScoChannel::close`
//! flips it and shuts the socket down to wake a blocked `recv`.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::aec::{EchoCancellation, AEC_FRAME_BYTES};
use crate::audio::{self, AudioBackend};
use crate::link::ScoLink;
use crate::ui::Notifier;

/// Largest SCO packet read in one go.
pub const PLAYBACK_BUF: usize = 240;

const SEND_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Everything a worker needs; cloned per worker.
#[derive(Clone)]
pub struct BridgeContext {
    pub link: Arc<dyn ScoLink>,
    pub running: Arc<AtomicBool>,
    pub aec: Arc<EchoCancellation>,
    pub audio: Arc<dyn AudioBackend>,
    pub notifier: Notifier,
    pub mtu: usize,
    /// Host audio streams currently held by workers.
    pub open_streams: Arc<AtomicUsize>,
}

impl BridgeContext {
    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureExit {
    /// Asked to stop, or the microphone failed.
    Stopped,
    /// The phone dropped the link; the whole channel should close.
    PeerClosed,
}

/// Counts a held host audio stream for as long as it lives.
struct StreamGuard(Arc<AtomicUsize>);

impl StreamGuard {
    fn new(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count.clone())
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn run_playback(ctx: &BridgeContext) {
    let mut out = match ctx.audio.open_playback() {
        Ok(s) => s,
        Err(e) => {
            ctx.notifier.log(format!("Speaker unavailable: {e}"));
            return;
        }
    };
    let guard = StreamGuard::new(&ctx.open_streams);
    let mut buf = [0u8; PLAYBACK_BUF];
    let mut reason = "stopped";

    while ctx.running() {
        let n = match ctx.link.recv(&mut buf) {
            Ok(0) => {
                reason = "link closed";
                break;
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if ctx.running() {
                    debug!("SCO recv failed: {e}");
                }
                reason = "link closed";
                break;
            }
        };
        if !ctx.running() {
            break;
        }

        let pcm = &buf[..n];
        if ctx.aec.is_enabled() {
            ctx.aec.push_render(&audio::bytes_to_samples(pcm));
        }
        if let Err(e) = out.write(pcm) {
            warn!("{e}");
            reason = "speaker write failed";
            break;
        }
    }

    if let Err(e) = out.drain() {
        debug!("{e}");
    }
    drop(out);
    drop(guard);
    ctx.notifier.log(format!("Phone audio playback ended ({reason})"));
}

pub fn run_capture(ctx: &BridgeContext) -> CaptureExit {
    let mut mic = match ctx.audio.open_capture() {
        Ok(s) => s,
        Err(e) => {
            ctx.notifier.log(format!("Microphone unavailable: {e}"));
            return CaptureExit::Stopped;
        }
    };
    let guard = StreamGuard::new(&ctx.open_streams);
    let mtu = ctx.mtu.max(2);
    let mut exit = CaptureExit::Stopped;

    'frames: while ctx.running() {
        let cancel = ctx.aec.is_enabled();
        let mut frame = vec![0u8; if cancel { AEC_FRAME_BYTES } else { mtu }];

        if let Err(e) = mic.read(&mut frame) {
            warn!("{e}");
            break;
        }
        if !ctx.running() {
            break;
        }

        if cancel {
            let mut samples = audio::bytes_to_samples(&frame);
            ctx.aec.cancel(&mut samples);
            audio::samples_to_bytes(&samples, &mut frame);
        }

        for chunk in frame.chunks(mtu) {
            match send_chunk(ctx, chunk) {
                SendResult::Sent | SendResult::Dropped => {}
                SendResult::PeerClosed => {
                    exit = CaptureExit::PeerClosed;
                    break 'frames;
                }
                SendResult::Stopped => break 'frames,
            }
        }
    }

    drop(mic);
    drop(guard);
    let reason = match exit {
        CaptureExit::PeerClosed => "remote closed",
        CaptureExit::Stopped => "stopped",
    };
    ctx.notifier.log(format!("Microphone capture ended ({reason})"));
    exit
}

enum SendResult {
    Sent,
    Dropped,
    PeerClosed,
    Stopped,
}

fn send_chunk(ctx: &BridgeContext, chunk: &[u8]) -> SendResult {
    let mut retried = false;
    loop {
        match ctx.link.send(chunk) {
            Ok(_) => return SendResult::Sent,
            // Our own shutdown looks like a dead peer; don't report it as one.
            Err(_) if !ctx.running() => return SendResult::Stopped,
            Err(e) if is_peer_closed(&e) => return SendResult::PeerClosed,
            Err(e) if retried => {
                debug!("SCO send dropped a chunk: {e}");
                return SendResult::Dropped;
            }
            Err(_) => {
                retried = true;
                thread::sleep(SEND_RETRY_DELAY);
            }
        }
    }
}

pub fn is_peer_closed(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{CaptureStream, PlaybackStream};
    use crate::config::AecSettings;
    use crate::errors::AudioError;
    use crate::ui::NullSink;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Wire {
        sent: Mutex<Vec<Vec<u8>>>,
        fail_with: Mutex<Option<io::ErrorKind>>,
    }

    impl ScoLink for Wire {
        fn recv(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
        fn send(&self, data: &[u8]) -> io::Result<usize> {
            if let Some(kind) = *self.fail_with.lock() {
                return Err(io::Error::from(kind));
            }
            self.sent.lock().push(data.to_vec());
            Ok(data.len())
        }
        fn mtu(&self) -> Option<u16> {
            Some(48)
        }
        fn shutdown(&self) {}
    }

    struct Mic {
        frames: usize,
        running: Arc<AtomicBool>,
    }

    impl CaptureStream for Mic {
        fn read(&mut self, pcm: &mut [u8]) -> Result<(), AudioError> {
            pcm.fill(1);
            self.frames -= 1;
            if self.frames == 0 {
                self.running.store(false, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    struct Backend {
        running: Arc<AtomicBool>,
    }

    impl AudioBackend for Backend {
        fn open_playback(&self) -> Result<Box<dyn PlaybackStream>, AudioError> {
            Err(AudioError::StreamOpen { what: "speaker", reason: "none".into() })
        }
        fn open_capture(&self) -> Result<Box<dyn CaptureStream>, AudioError> {
            Ok(Box::new(Mic { frames: 3, running: self.running.clone() }))
        }
    }

    fn context(wire: Arc<Wire>, mtu: usize) -> BridgeContext {
        let running = Arc::new(AtomicBool::new(true));
        BridgeContext {
            link: wire,
            running: running.clone(),
            aec: Arc::new(EchoCancellation::new(&AecSettings::default())),
            audio: Arc::new(Backend { running }),
            notifier: Notifier::new(Arc::new(NullSink)),
            mtu,
            open_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[test]
    fn capture_sends_one_mtu_per_frame_without_aec() {
        let wire = Arc::new(Wire::default());
        let ctx = context(wire.clone(), 48);
        // Third frame flips running before it is sent.
        assert_eq!(run_capture(&ctx), CaptureExit::Stopped);
        let sent = wire.sent.lock();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|c| c.len() == 48));
        assert_eq!(ctx.open_streams.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn aec_frames_are_split_at_mtu() {
        let wire = Arc::new(Wire::default());
        let mut ctx = context(wire.clone(), 60);
        ctx.aec = Arc::new(EchoCancellation::new(&AecSettings {
            force_disable: false,
            ..AecSettings::default()
        }));
        ctx.aec.init();
        run_capture(&ctx);
        let sent = wire.sent.lock();
        let sizes: Vec<usize> = sent.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![60, 60, 40, 60, 60, 40]);
    }

    #[test]
    fn broken_pipe_reports_peer_closed() {
        let wire = Arc::new(Wire::default());
        *wire.fail_with.lock() = Some(io::ErrorKind::BrokenPipe);
        let ctx = context(wire, 48);
        assert_eq!(run_capture(&ctx), CaptureExit::PeerClosed);
    }

    #[test]
    fn transient_send_error_drops_chunk_and_continues() {
        let wire = Arc::new(Wire::default());
        *wire.fail_with.lock() = Some(io::ErrorKind::WouldBlock);
        let ctx = context(wire.clone(), 48);
        assert_eq!(run_capture(&ctx), CaptureExit::Stopped);
        assert!(wire.sent.lock().is_empty());
    }

    #[test]
    fn playback_without_speaker_returns() {
        let ctx = context(Arc::new(Wire::default()), 48);
        run_playback(&ctx);
        assert_eq!(ctx.open_streams.load(Ordering::SeqCst), 0);
    }
}
