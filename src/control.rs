//! RFCOMM control channels.
//!
//! Two slots per phone: the long-lived *listener* (incoming calls, in-call
//! indicators) and a *dialer* opened only when there is no listener to dial
//! through. Each slot has at most one link and one reader thread. Commands
//! issued from other threads pause the reader, take the I/O lock, run their
//! exchange and resume it, so a reply is never split between two readers.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::at::{self, DialResponse};
use crate::bluetooth::BdAddr;
use crate::config::Timing;
use crate::errors::HfpError;
use crate::link::{self, ControlLink, LinkConnector};
use crate::slc::{self, Profile};
use crate::ui::Notifier;
use crate::worker;

const PAUSED_POLL: Duration = Duration::from_millis(100);
const READ_BUF: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Listener,
    Dialer,
}

impl Role {
    fn label(self) -> &'static str {
        match self {
            Role::Listener => "listener",
            Role::Dialer => "dialer",
        }
    }
}

/// Whether a reader keeps going after a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Receives everything the reader threads see.
pub trait ChunkHandler: Send + Sync {
    fn on_chunk(&self, role: Role, chunk: &[u8]) -> Flow;
    /// The link died (or never came up) while it was meant to be running.
    fn on_link_lost(&self, role: Role);
    /// Listener finished its handshake.
    fn on_listener_ready(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialOutcome {
    Confirmed,
    /// Phone said something we don't recognize; assume the call is placed.
    Tentative(String),
}

fn classify(reply: &[u8]) -> Result<DialOutcome, HfpError> {
    match at::classify_dial(reply) {
        DialResponse::Accepted => Ok(DialOutcome::Confirmed),
        DialResponse::Rejected(why) => Err(HfpError::DialRejected(why)),
        DialResponse::Unrecognized(text) => Ok(DialOutcome::Tentative(text)),
    }
}

// ── Channel slot ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct Channel {
    link: Mutex<Option<Arc<dyn ControlLink>>>,
    io: Mutex<()>,
    pauses: AtomicUsize,
    running: AtomicBool,
    ready: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    fn current(&self) -> Option<Arc<dyn ControlLink>> {
        self.link.lock().clone()
    }

    fn is_current(&self, link: &Arc<dyn ControlLink>) -> bool {
        self.link
            .lock()
            .as_ref()
            .is_some_and(|l| same_link(l, link))
    }

    fn alive(&self, link: &Arc<dyn ControlLink>) -> bool {
        self.running.load(Ordering::SeqCst) && self.is_current(link)
    }

    /// Drop `link` from the slot if it is still the installed one.
    fn release(&self, link: &Arc<dyn ControlLink>) {
        let mut slot = self.link.lock();
        if slot.as_ref().is_some_and(|l| same_link(l, link)) {
            *slot = None;
            self.running.store(false, Ordering::SeqCst);
            self.ready.store(false, Ordering::SeqCst);
        }
        link.shutdown();
    }

    fn paused(&self) -> bool {
        self.pauses.load(Ordering::SeqCst) > 0
    }
}

fn same_link(a: &Arc<dyn ControlLink>, b: &Arc<dyn ControlLink>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

// ── Manager ───────────────────────────────────────────────────────────────────

pub struct ControlManager {
    connector: Arc<dyn LinkConnector>,
    timing: Timing,
    notifier: Notifier,
    listener: Arc<Channel>,
    dialer: Arc<Channel>,
}

impl ControlManager {
    pub fn new(connector: Arc<dyn LinkConnector>, timing: Timing, notifier: Notifier) -> Self {
        Self {
            connector,
            timing,
            notifier,
            listener: Arc::new(Channel::default()),
            dialer: Arc::new(Channel::default()),
        }
    }

    pub fn listener_running(&self) -> bool {
        self.listener.running.load(Ordering::SeqCst)
    }

    /// Handshake done and the listener can carry commands.
    pub fn listener_ready(&self) -> bool {
        self.listener.ready.load(Ordering::SeqCst) && self.listener.current().is_some()
    }

    pub fn has_dialer(&self) -> bool {
        self.dialer.current().is_some()
    }

    /// Connect, handshake and monitor incoming-call events on a background
    /// thread. Connection failures are reported once, never retried here.
    pub fn start_listener(
        &self,
        addr: BdAddr,
        channel: u8,
        handler: Weak<dyn ChunkHandler>,
    ) -> Result<(), HfpError> {
        let chan = self.listener.clone();
        if chan.running.swap(true, Ordering::SeqCst) {
            debug!("listener already running");
            return Ok(());
        }
        self.reap(&chan);

        let connector = self.connector.clone();
        let timing = self.timing.clone();
        let notifier = self.notifier.clone();
        let spawned = worker::spawn("hfp-listener", move || {
            run_listener(&chan, &*connector, addr, channel, &timing, &notifier, &handler);
        });

        match spawned {
            Ok(handle) => {
                *self.listener.thread.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.listener.running.store(false, Ordering::SeqCst);
                Err(HfpError::Io(e))
            }
        }
    }

    /// `ATD` through the running listener, pausing its reader meanwhile.
    ///
    /// `placed` runs with the classified outcome and the raw reply before the
    /// reader resumes, so later indicators are judged against its effects.
    pub fn dial_via_listener(
        &self,
        number: &str,
        placed: impl FnOnce(&DialOutcome, &[u8]),
    ) -> Result<DialOutcome, HfpError> {
        if !self.listener_ready() {
            return Err(HfpError::NoControlChannel);
        }
        self.exclusive(&self.listener, |link| -> Result<DialOutcome, HfpError> {
            let reply = link::exchange(link, &at::dial(number), self.timing.dial_response(), at::is_dial_response)?;
            debug!(reply = %at::preview(&reply, 80), "ATD via listener");
            let outcome = classify(&reply)?;
            placed(&outcome, &reply);
            Ok(outcome)
        })
        .ok_or(HfpError::NoControlChannel)?
    }

    /// `ATD` on a new channel with a strict handshake. On success the channel
    /// stays open with its own monitor; on failure it is closed.
    ///
    /// `placed` runs before the monitor starts. If it returns [`Flow::Stop`]
    /// the call is already over and the channel is closed instead.
    pub fn dial_fresh(
        &self,
        addr: BdAddr,
        channel: u8,
        number: &str,
        handler: Weak<dyn ChunkHandler>,
        placed: impl FnOnce(&DialOutcome, &[u8]) -> Flow,
    ) -> Result<DialOutcome, HfpError> {
        self.close_dialer();

        let link = self.connector.connect_control(addr, channel)?;
        let attempt = (|| -> Result<(DialOutcome, Vec<u8>), HfpError> {
            slc::perform_slc(&*link, Profile::Dialer, self.timing.at_response())?;
            let reply = link::exchange(
                &*link,
                &at::dial(number),
                self.timing.dial_response(),
                at::is_dial_response,
            )?;
            debug!(reply = %at::preview(&reply, 80), "ATD via dialer");
            Ok((classify(&reply)?, reply))
        })();

        let (outcome, reply) = match attempt {
            Ok(o) => o,
            Err(e) => {
                link.shutdown();
                return Err(e);
            }
        };

        let chan = self.dialer.clone();
        *chan.link.lock() = Some(link.clone());
        chan.running.store(true, Ordering::SeqCst);
        chan.ready.store(true, Ordering::SeqCst);

        if placed(&outcome, &reply) == Flow::Stop {
            chan.release(&link);
            debug!("call ended before the dialer monitor started");
            return Ok(outcome);
        }

        let poll = self.timing.listener_poll();
        let notifier = self.notifier.clone();
        let monitor_link = link.clone();
        let spawned = worker::spawn("hfp-dialer", move || {
            monitor(&chan, &monitor_link, Role::Dialer, poll, &notifier, &handler);
        });
        match spawned {
            Ok(handle) => {
                *self.dialer.thread.lock() = Some(handle);
                Ok(outcome)
            }
            Err(e) => {
                self.dialer.release(&link);
                Err(HfpError::Io(e))
            }
        }
    }

    /// Send a command on the listener if it is up, else on the dialer, and
    /// hand the reply to `on_reply` before that channel's reader resumes.
    pub fn send_command<T>(
        &self,
        command: &str,
        on_reply: impl FnOnce(Role, &[u8]) -> T,
    ) -> Result<T, HfpError> {
        let (role, chan) = if self.listener_ready() {
            (Role::Listener, &self.listener)
        } else if self.has_dialer() {
            (Role::Dialer, &self.dialer)
        } else {
            return Err(HfpError::NoControlChannel);
        };

        self.exclusive(chan, |link| -> Result<T, HfpError> {
            let reply = link::exchange(link, command, self.timing.command_response(), at::is_final_response)?;
            debug!(role = role.label(), command = command.trim_end(), reply = %at::preview(&reply, 80), "command");
            Ok(on_reply(role, &reply))
        })
        .ok_or(HfpError::NoControlChannel)?
    }

    pub fn close_dialer(&self) {
        self.close_channel(&self.dialer, Role::Dialer);
    }

    pub fn stop_listener(&self) {
        self.close_channel(&self.listener, Role::Listener);
    }

    /// Close everything. Safe to call repeatedly and from any thread.
    pub fn stop(&self) {
        self.stop_listener();
        self.close_dialer();
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    /// Run `f` with the reader of `chan` paused and the I/O lock held.
    fn exclusive<T>(&self, chan: &Channel, f: impl FnOnce(&dyn ControlLink) -> T) -> Option<T> {
        let link = chan.current()?;
        chan.pauses.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.timing.pause_settle());
        let out = {
            let _io = chan.io.lock();
            f(&*link)
        };
        chan.pauses.fetch_sub(1, Ordering::SeqCst);
        Some(out)
    }

    fn close_channel(&self, chan: &Channel, role: Role) {
        chan.running.store(false, Ordering::SeqCst);
        chan.ready.store(false, Ordering::SeqCst);
        let link = chan.link.lock().take();
        let had_link = link.is_some();
        if let Some(link) = link {
            link.shutdown();
        }
        let thread = chan.thread.lock().take();
        if let Some(handle) = thread {
            worker::join_bounded(handle, self.timing.join_timeout(), role.label());
        }
        if had_link {
            debug!("{} channel closed", role.label());
        }
    }

    /// Join a listener thread that already ended on its own.
    fn reap(&self, chan: &Channel) {
        let finished = chan.thread.lock().take();
        if let Some(handle) = finished {
            worker::join_bounded(handle, self.timing.join_timeout(), "listener");
        }
    }
}

impl Drop for ControlManager {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Reader threads ────────────────────────────────────────────────────────────

fn run_listener(
    chan: &Channel,
    connector: &dyn LinkConnector,
    addr: BdAddr,
    channel: u8,
    timing: &Timing,
    notifier: &Notifier,
    handler: &Weak<dyn ChunkHandler>,
) {
    let link = match connector.connect_control(addr, channel) {
        Ok(l) => l,
        Err(e) => {
            notifier.log(format!("Listener could not connect to {addr} channel {channel}: {e}"));
            let wanted = chan.running.swap(false, Ordering::SeqCst);
            if wanted {
                lost(handler, Role::Listener);
            }
            return;
        }
    };

    *chan.link.lock() = Some(link.clone());
    if !chan.running.load(Ordering::SeqCst) {
        chan.release(&link);
        return;
    }

    match slc::perform_slc(&*link, Profile::Listener, timing.at_response()) {
        Ok(_) => {}
        Err(e) => {
            let wanted = chan.alive(&link);
            chan.release(&link);
            if wanted {
                notifier.log(format!("Listener handshake failed: {e}"));
                lost(handler, Role::Listener);
            }
            return;
        }
    }

    if !chan.alive(&link) {
        return;
    }
    chan.ready.store(true, Ordering::SeqCst);
    notifier.log("Listening for calls");
    if let Some(h) = handler.upgrade() {
        h.on_listener_ready();
    }

    monitor(chan, &link, Role::Listener, timing.listener_poll(), notifier, handler);
}

/// Read chunks until stopped, told to stop, or the link dies.
fn monitor(
    chan: &Channel,
    link: &Arc<dyn ControlLink>,
    role: Role,
    poll: Duration,
    notifier: &Notifier,
    handler: &Weak<dyn ChunkHandler>,
) {
    let mut buf = [0u8; READ_BUF];

    let dropped = loop {
        if !chan.alive(link) {
            break false;
        }
        if chan.paused() {
            thread::sleep(PAUSED_POLL);
            continue;
        }

        let read = {
            let _io = chan.io.lock();
            if chan.paused() {
                continue;
            }
            link.recv_timeout(&mut buf, poll)
        };

        match read {
            Ok(None) => {}
            Ok(Some(0)) => break true,
            Ok(Some(n)) => {
                let Some(h) = handler.upgrade() else {
                    break false;
                };
                debug!(role = role.label(), data = %at::preview(&buf[..n], 120), "rx");
                if h.on_chunk(role, &buf[..n]) == Flow::Stop {
                    break false;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                if chan.alive(link) {
                    warn!(role = role.label(), "control read failed: {e}");
                }
                break true;
            }
        }
    };

    let wanted = dropped && chan.alive(link);
    chan.release(link);
    if wanted {
        notifier.log(format!("Control channel ({}) disconnected", role.label()));
        lost(handler, role);
    }
}

fn lost(handler: &Weak<dyn ChunkHandler>, role: Role) {
    if let Some(h) = handler.upgrade() {
        h.on_link_lost(role);
    }
}
