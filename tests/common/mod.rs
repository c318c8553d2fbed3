//! In-memory stand-ins for the phone, the Bluetooth stack and the host audio
//! server.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use hfp_bridge::audio::{AudioBackend, CaptureStream, PlaybackStream};
use hfp_bridge::bluetooth::{
    AdapterService, AudioSubsystem, BdAddr, ChannelDiscovery, ConnectionState,
};
use hfp_bridge::call::CallState;
use hfp_bridge::config::{Config, Timing};
use hfp_bridge::contacts::ContactsLookup;
use hfp_bridge::errors::AudioError;
use hfp_bridge::link::{ControlLink, LinkConnector, ScoLink};
use hfp_bridge::session::{Collaborators, Session};
use hfp_bridge::ui::{UiEvent, UiSink};

pub const PHONE: &str = "AA:BB:CC:DD:EE:FF";

pub fn phone_addr() -> BdAddr {
    BdAddr::parse(PHONE).unwrap()
}

pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

// ── Control link ──────────────────────────────────────────────────────────────

/// A phone's AT interface: replies to commands by prefix and lets the test
/// inject unsolicited chunks.
#[derive(Default)]
pub struct ScriptedLink {
    rules: Mutex<Vec<(String, String)>>,
    inbox: Mutex<VecDeque<Vec<u8>>>,
    arrived: Condvar,
    sent: Mutex<Vec<String>>,
    closed: AtomicBool,
    writes_broken: AtomicBool,
    pub shutdowns: AtomicUsize,
}

impl ScriptedLink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A phone that confirms every handshake step.
    pub fn phone() -> Arc<Self> {
        let link = Self::new();
        link.respond("AT+BRSF", "\r\n+BRSF: 871\r\n\r\nOK\r\n");
        link.respond("AT+CIND=?", "\r\n+CIND: (\"call\",(0,1)),(\"callsetup\",(0-3))\r\n\r\nOK\r\n");
        link.respond("AT+CIND?", "\r\n+CIND: 0,0\r\n\r\nOK\r\n");
        link.respond("AT+CMER", "\r\nOK\r\n");
        link.respond("AT+NREC", "\r\nOK\r\n");
        link.respond("AT+CLIP", "\r\nOK\r\n");
        link
    }

    /// Reply to commands starting with `prefix`. Later rules for the same
    /// prefix replace earlier ones.
    pub fn respond(&self, prefix: &str, reply: &str) {
        let mut rules = self.rules.lock();
        rules.retain(|(p, _)| p != prefix);
        rules.push((prefix.to_string(), reply.to_string()));
    }

    pub fn silence(&self, prefix: &str) {
        self.rules.lock().retain(|(p, _)| p != prefix);
    }

    /// Deliver one chunk as a single read.
    pub fn push(&self, chunk: &str) {
        self.inbox.lock().push_back(chunk.as_bytes().to_vec());
        self.arrived.notify_all();
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn was_sent(&self, command: &str) -> bool {
        self.sent.lock().iter().any(|c| c == command)
    }

    /// The phone hangs up the RFCOMM link.
    pub fn close_remote(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.arrived.notify_all();
    }

    /// Writes fail from now on while reads keep working.
    pub fn break_writes(&self) {
        self.writes_broken.store(true, Ordering::SeqCst);
    }

    pub fn is_shut(&self) -> bool {
        self.shutdowns.load(Ordering::SeqCst) > 0
    }
}

impl ControlLink for ScriptedLink {
    fn send(&self, data: &[u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) || self.writes_broken.load(Ordering::SeqCst) {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        let command = String::from_utf8_lossy(data).into_owned();
        let reply = self
            .rules
            .lock()
            .iter()
            .find(|(p, _)| command.starts_with(p.as_str()))
            .map(|(_, r)| r.clone());
        self.sent.lock().push(command);
        if let Some(reply) = reply {
            self.push(&reply);
        }
        Ok(data.len())
    }

    fn recv_timeout(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        let deadline = Instant::now() + timeout;
        let mut inbox = self.inbox.lock();
        loop {
            if let Some(mut chunk) = inbox.pop_front() {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    inbox.push_front(chunk.split_off(n));
                }
                return Ok(Some(n));
            }
            if self.closed.load(Ordering::SeqCst) {
                return Ok(Some(0));
            }
            if self.arrived.wait_until(&mut inbox, deadline).timed_out()
                && inbox.is_empty()
                && !self.closed.load(Ordering::SeqCst)
            {
                return Ok(None);
            }
        }
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        self.arrived.notify_all();
    }
}

// ── SCO link ──────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeSco {
    shut: Mutex<bool>,
    woke: Condvar,
    peer_gone: AtomicBool,
    pub sent_bytes: AtomicUsize,
    pub shutdowns: AtomicUsize,
}

impl FakeSco {
    /// Subsequent sends fail as if the phone dropped the link.
    pub fn drop_from_peer(&self) {
        self.peer_gone.store(true, Ordering::SeqCst);
    }
}

impl ScoLink for FakeSco {
    fn recv(&self, _buf: &mut [u8]) -> io::Result<usize> {
        let mut shut = self.shut.lock();
        while !*shut {
            self.woke.wait(&mut shut);
        }
        Ok(0)
    }

    fn send(&self, data: &[u8]) -> io::Result<usize> {
        if *self.shut.lock() || self.peer_gone.load(Ordering::SeqCst) {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        self.sent_bytes.fetch_add(data.len(), Ordering::SeqCst);
        Ok(data.len())
    }

    fn mtu(&self) -> Option<u16> {
        Some(48)
    }

    fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        *self.shut.lock() = true;
        self.woke.notify_all();
    }
}

// ── Connector ─────────────────────────────────────────────────────────────────

/// Hands out queued control links in order; every SCO connect gets a fresh
/// [`FakeSco`] unless an error is queued.
#[derive(Default)]
pub struct FakeConnector {
    controls: Mutex<VecDeque<Arc<ScriptedLink>>>,
    sco_errors: Mutex<VecDeque<i32>>,
    sco_delay: Mutex<Duration>,
    pub scos: Mutex<Vec<Arc<FakeSco>>>,
    pub control_connects: AtomicUsize,
    pub sco_connects: AtomicUsize,
}

impl FakeConnector {
    pub fn queue_control(&self, link: Arc<ScriptedLink>) {
        self.controls.lock().push_back(link);
    }

    pub fn fail_next_sco(&self, errno: i32) {
        self.sco_errors.lock().push_back(errno);
    }

    /// Every SCO connect takes `delay`, like a slow baseband.
    pub fn slow_sco(&self, delay: Duration) {
        *self.sco_delay.lock() = delay;
    }

    pub fn sco_connects(&self) -> usize {
        self.sco_connects.load(Ordering::SeqCst)
    }

    pub fn control_connects(&self) -> usize {
        self.control_connects.load(Ordering::SeqCst)
    }

    pub fn last_sco(&self) -> Option<Arc<FakeSco>> {
        self.scos.lock().last().cloned()
    }
}

impl LinkConnector for FakeConnector {
    fn connect_control(&self, _addr: BdAddr, _channel: u8) -> io::Result<Arc<dyn ControlLink>> {
        self.control_connects.fetch_add(1, Ordering::SeqCst);
        match self.controls.lock().pop_front() {
            Some(link) => Ok(link),
            None => Err(io::Error::from(io::ErrorKind::ConnectionRefused)),
        }
    }

    fn connect_sco(&self, _addr: BdAddr) -> io::Result<Arc<dyn ScoLink>> {
        self.sco_connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.sco_delay.lock();
        thread::sleep(delay);
        if let Some(errno) = self.sco_errors.lock().pop_front() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        let sco = Arc::new(FakeSco::default());
        self.scos.lock().push(sco.clone());
        Ok(sco)
    }
}

// ── Host audio ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeAudio;

struct Speaker;

impl PlaybackStream for Speaker {
    fn write(&mut self, _pcm: &[u8]) -> Result<(), AudioError> {
        Ok(())
    }
    fn drain(&mut self) -> Result<(), AudioError> {
        Ok(())
    }
}

/// Real-time-ish microphone: one buffer every 5 ms.
struct Microphone;

impl CaptureStream for Microphone {
    fn read(&mut self, pcm: &mut [u8]) -> Result<(), AudioError> {
        thread::sleep(Duration::from_millis(5));
        pcm.fill(0);
        Ok(())
    }
}

impl AudioBackend for FakeAudio {
    fn open_playback(&self) -> Result<Box<dyn PlaybackStream>, AudioError> {
        Ok(Box::new(Speaker))
    }
    fn open_capture(&self) -> Result<Box<dyn CaptureStream>, AudioError> {
        Ok(Box::new(Microphone))
    }
}

#[derive(Default)]
pub struct FakeAudioServer {
    pub releases: AtomicUsize,
}

impl AudioSubsystem for FakeAudioServer {
    fn release_sco_claim(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Adapter, discovery, contacts ──────────────────────────────────────────────

pub struct FakeAdapter {
    pub state: Mutex<ConnectionState>,
}

impl AdapterService for FakeAdapter {
    fn device_address(&self) -> Option<BdAddr> {
        Some(phone_addr())
    }
    fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }
}

pub struct FixedChannel(pub Option<u8>);

impl ChannelDiscovery for FixedChannel {
    fn find_hfp_channel(&self, _addr: BdAddr) -> Option<u8> {
        self.0
    }
}

pub struct Contacts(pub Vec<(&'static str, &'static str)>);

impl ContactsLookup for Contacts {
    fn lookup_name(&self, number: &str) -> Option<String> {
        self.0
            .iter()
            .find(|(n, _)| *n == number)
            .map(|(_, name)| name.to_string())
    }
}

// ── UI sink ───────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<UiEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<UiEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub fn count(&self, pred: impl Fn(&UiEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }

    pub fn call_changes(&self) -> usize {
        self.count(|e| matches!(e, UiEvent::CallChanged(_)))
    }

    pub fn logged(&self, text: &str) -> usize {
        self.count(|e| matches!(e, UiEvent::Log(m) if m.contains(text)))
    }
}

impl UiSink for RecordingSink {
    fn post(&self, event: UiEvent) {
        self.events.lock().push(event);
    }
}

// ── Session harness ───────────────────────────────────────────────────────────

pub struct Harness {
    pub session: Session,
    pub connector: Arc<FakeConnector>,
    pub adapter: Arc<FakeAdapter>,
    pub audio_server: Arc<FakeAudioServer>,
    pub sink: Arc<RecordingSink>,
}

pub fn test_config() -> Config {
    Config {
        device: Some(PHONE.to_string()),
        timing: Timing::immediate(),
        ..Config::default()
    }
}

pub fn harness(state: ConnectionState) -> Harness {
    harness_with_contacts(state, Vec::new())
}

pub fn harness_with_contacts(
    state: ConnectionState,
    contacts: Vec<(&'static str, &'static str)>,
) -> Harness {
    let connector = Arc::new(FakeConnector::default());
    let adapter = Arc::new(FakeAdapter { state: Mutex::new(state) });
    let audio_server = Arc::new(FakeAudioServer::default());
    let sink = Arc::new(RecordingSink::default());

    let collab = Collaborators {
        adapter: adapter.clone(),
        discovery: Arc::new(FixedChannel(None)),
        connector: connector.clone(),
        audio: Arc::new(FakeAudio),
        audio_system: audio_server.clone(),
        contacts: Arc::new(Contacts(contacts)),
        ui: sink.clone(),
    };
    Harness {
        session: Session::new(test_config(), collab),
        connector,
        adapter,
        audio_server,
        sink,
    }
}

impl Harness {
    /// Start the listener on `link` and wait for its handshake.
    pub fn listen(&self, link: &Arc<ScriptedLink>) {
        self.connector.queue_control(link.clone());
        self.session.start_listener().unwrap();
        assert!(
            wait_until(Duration::from_secs(2), || self.sink.logged("Listening for calls") > 0),
            "listener never became ready: {:?}",
            self.sink.events()
        );
    }

    pub fn wait_state(&self, state: CallState) -> bool {
        wait_until(Duration::from_secs(2), || self.session.call_state() == state)
    }
}
