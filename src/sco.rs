//! SCO audio channel: at most one open link, with its two bridge workers.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::aec::{AecStatus, EchoCancellation};
use crate::audio::AudioBackend;
use crate::bluetooth::{AudioSubsystem, BdAddr};
use crate::bridge::{self, BridgeContext, CaptureExit};
use crate::config::Timing;
use crate::errors::AudioError;
use crate::link::{LinkConnector, ScoLink};
use crate::ui::Notifier;
use crate::worker;

/// MTU assumed when the socket does not report one.
pub const DEFAULT_SCO_MTU: usize = 48;

const REPLACE_SETTLE: Duration = Duration::from_millis(100);

pub struct ScoChannel {
    connector: Arc<dyn LinkConnector>,
    audio_system: Arc<dyn AudioSubsystem>,
    audio: Arc<dyn AudioBackend>,
    aec: Arc<EchoCancellation>,
    notifier: Notifier,
    timing: Timing,
    /// Serializes open and close.
    ops: Mutex<()>,
    active: Mutex<Option<ActiveSco>>,
    generation: AtomicU64,
    open_streams: Arc<AtomicUsize>,
}

struct ActiveSco {
    generation: u64,
    link: Arc<dyn ScoLink>,
    running: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl ScoChannel {
    pub fn new(
        connector: Arc<dyn LinkConnector>,
        audio_system: Arc<dyn AudioSubsystem>,
        audio: Arc<dyn AudioBackend>,
        aec: Arc<EchoCancellation>,
        notifier: Notifier,
        timing: Timing,
    ) -> Self {
        Self {
            connector,
            audio_system,
            audio,
            aec,
            notifier,
            timing,
            ops: Mutex::new(()),
            active: Mutex::new(None),
            generation: AtomicU64::new(0),
            open_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn is_open(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Connect the audio link and start bridging. Any previous link is
    /// fully torn down first.
    pub fn open(self: &Arc<Self>, addr: BdAddr) -> Result<(), AudioError> {
        let _op = self.ops.lock();
        self.open_locked(addr)
    }

    /// Open unless a link is already up. Returns whether it opened one.
    pub fn ensure_open(self: &Arc<Self>, addr: BdAddr) -> Result<bool, AudioError> {
        let _op = self.ops.lock();
        if self.is_open() {
            return Ok(false);
        }
        self.open_locked(addr).map(|()| true)
    }

    fn open_locked(self: &Arc<Self>, addr: BdAddr) -> Result<(), AudioError> {
        if self.close_locked(Some("Previous SCO link closed")) {
            thread::sleep(REPLACE_SETTLE);
        }

        let link = self.connect(addr)?;
        let mtu = link
            .mtu()
            .map(usize::from)
            .filter(|&m| m > 0)
            .unwrap_or(DEFAULT_SCO_MTU);

        match self.aec.init() {
            AecStatus::Active => info!("echo cancellation active"),
            AecStatus::ForceDisabled => debug!("echo cancellation force-disabled"),
            AecStatus::Unavailable(reason) => {
                self.notifier.log(format!("Echo cancellation unavailable: {reason}"));
            }
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let running = Arc::new(AtomicBool::new(true));
        let ctx = BridgeContext {
            link: link.clone(),
            running: running.clone(),
            aec: self.aec.clone(),
            audio: self.audio.clone(),
            notifier: self.notifier.clone(),
            mtu,
            open_streams: self.open_streams.clone(),
        };

        let workers = match self.spawn_workers(ctx, generation) {
            Ok(w) => w,
            Err(e) => {
                running.store(false, Ordering::SeqCst);
                link.shutdown();
                self.aec.shutdown();
                return Err(AudioError::Socket(e));
            }
        };

        *self.active.lock() = Some(ActiveSco {
            generation,
            link,
            running,
            workers,
        });
        self.notifier.log(format!("SCO audio connected (MTU {mtu})"));
        Ok(())
    }

    /// Stop the workers and release the link. Returns `false`, doing nothing
    /// at all, when no link was open.
    pub fn close(&self, reason: Option<&str>) -> bool {
        let _op = self.ops.lock();
        self.close_locked(reason)
    }

    fn close_generation(&self, generation: u64, reason: &str) {
        let _op = self.ops.lock();
        let current = self.active.lock().as_ref().map(|a| a.generation);
        if current == Some(generation) {
            self.close_locked(Some(reason));
        }
    }

    fn close_locked(&self, reason: Option<&str>) -> bool {
        let Some(active) = self.active.lock().take() else {
            return false;
        };

        active.running.store(false, Ordering::SeqCst);
        thread::sleep(self.timing.sco_grace());
        active.link.shutdown();

        let deadline = Instant::now() + self.timing.sco_release_wait();
        while self.open_streams.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        for handle in active.workers {
            worker::join_bounded(handle, self.timing.join_timeout(), "SCO worker");
        }

        self.aec.shutdown();
        if let Some(reason) = reason {
            self.notifier.log(reason);
        }
        true
    }

    fn connect(&self, addr: BdAddr) -> Result<Arc<dyn ScoLink>, AudioError> {
        match self.connector.connect_sco(addr) {
            Ok(link) => Ok(link),
            Err(e) if is_link_busy(&e) => {
                self.notifier
                    .log(format!("SCO link busy ({e}); asking the audio server to release it"));
                self.audio_system.release_sco_claim();
                thread::sleep(self.timing.sco_busy_retry());
                self.connector.connect_sco(addr).map_err(AudioError::LinkBusy)
            }
            Err(e) => Err(AudioError::Socket(e)),
        }
    }

    fn spawn_workers(
        self: &Arc<Self>,
        ctx: BridgeContext,
        generation: u64,
    ) -> io::Result<Vec<JoinHandle<()>>> {
        let playback_ctx = ctx.clone();
        let playback = worker::spawn("sco-playback", move || bridge::run_playback(&playback_ctx))?;

        let weak = Arc::downgrade(self);
        let capture = worker::spawn("sco-capture", move || {
            if bridge::run_capture(&ctx) != CaptureExit::PeerClosed {
                return;
            }
            // close() joins this thread, so hand it to another one.
            let Some(channel) = weak.upgrade() else { return };
            let spawned = worker::spawn("sco-close", move || {
                channel.close_generation(generation, "SCO closed (remote closed)");
            });
            if let Err(e) = spawned {
                debug!("could not spawn SCO close thread: {e}");
            }
        });

        // On failure the caller shuts the link down, which ends playback.
        Ok(vec![playback, capture?])
    }
}

impl Drop for ScoChannel {
    fn drop(&mut self) {
        self.close_locked(None);
    }
}

pub fn is_link_busy(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EMLINK) | Some(libc::EBUSY))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_errors() {
        assert!(is_link_busy(&io::Error::from_raw_os_error(libc::EBUSY)));
        assert!(is_link_busy(&io::Error::from_raw_os_error(libc::EMLINK)));
        assert!(!is_link_busy(&io::Error::from_raw_os_error(libc::ECONNREFUSED)));
    }
}
