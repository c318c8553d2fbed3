//! One phone session: control channels, call state, SCO audio and echo
//! cancellation wired together.
//!
//! [`Session`] is the only thing front-ends talk to. Its methods block (they
//! do socket I/O) and may be called from any thread; everything it learns
//! from the phone is reported through the [`UiSink`].

use std::path::Path;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::aec::EchoCancellation;
use crate::at::{self, Signals};
use crate::audio::{AudioBackend, PulseAudio};
use crate::bluetooth::{
    AdapterService, AudioSubsystem, BdAddr, Bluetoothctl, ChannelDiscovery, ConnectionState,
    Pactl, Sdptool, DEFAULT_HFP_CHANNEL,
};
use crate::call::{self, CallHooks, CallMachine, CallSnapshot, CallState};
use crate::config::Config;
use crate::contacts::{ContactBook, ContactsLookup, NoContacts};
use crate::control::{ChunkHandler, ControlManager, DialOutcome, Flow, Role};
use crate::errors::HfpError;
use crate::link::LinkConnector;
use crate::phone;
use crate::ringer::Ringer;
use crate::sco::ScoChannel;
use crate::socket::BluezConnector;
use crate::ui::{Notifier, UiEvent, UiSink};

/// Everything outside the core a session depends on.
pub struct Collaborators {
    pub adapter: Arc<dyn AdapterService>,
    pub discovery: Arc<dyn ChannelDiscovery>,
    pub connector: Arc<dyn LinkConnector>,
    pub audio: Arc<dyn AudioBackend>,
    pub audio_system: Arc<dyn AudioSubsystem>,
    pub contacts: Arc<dyn ContactsLookup>,
    pub ui: Arc<dyn UiSink>,
}

impl Collaborators {
    /// BlueZ sockets, bluetoothctl, sdptool, PulseAudio and pactl.
    pub fn system(config: &Config, ui: Arc<dyn UiSink>) -> Result<Self, HfpError> {
        let device = config.device.as_deref().map(BdAddr::parse).transpose()?;
        Ok(Self {
            adapter: Arc::new(Bluetoothctl { device }),
            discovery: Arc::new(Sdptool),
            connector: Arc::new(BluezConnector),
            audio: Arc::new(PulseAudio::for_config(config)),
            audio_system: Arc::new(Pactl),
            contacts: load_contacts(config.contacts.as_deref()),
            ui,
        })
    }
}

fn load_contacts(path: Option<&Path>) -> Arc<dyn ContactsLookup> {
    let Some(path) = path else {
        return Arc::new(NoContacts);
    };
    match ContactBook::load(path) {
        Ok(book) => Arc::new(book),
        Err(e) => {
            warn!("contacts file {} unreadable: {e}", path.display());
            Arc::new(NoContacts)
        }
    }
}

pub struct Session {
    core: Arc<Core>,
}

impl Session {
    pub fn new(config: Config, collab: Collaborators) -> Self {
        let notifier = Notifier::new(collab.ui.clone());
        let aec = Arc::new(EchoCancellation::new(&config.aec));
        let sco = Arc::new(ScoChannel::new(
            collab.connector.clone(),
            collab.audio_system.clone(),
            collab.audio.clone(),
            aec,
            notifier.clone(),
            config.timing.clone(),
        ));
        let control = ControlManager::new(
            collab.connector.clone(),
            config.timing.clone(),
            notifier.clone(),
        );

        let core = Arc::new_cyclic(|me| Core {
            adapter: collab.adapter,
            discovery: collab.discovery,
            contacts: collab.contacts,
            ringer: Ringer::new(notifier.clone()),
            notifier,
            config,
            call: CallMachine::new(),
            control,
            sco,
            device: Mutex::new(None),
            pending_dial: Mutex::new(None),
            me: me.clone(),
        });
        Self { core }
    }

    /// Open the incoming-call listener. Returns once its thread is running;
    /// connect and handshake results arrive as log events.
    pub fn start_listener(&self) -> Result<(), HfpError> {
        self.core.start_listener()
    }

    pub fn listener_running(&self) -> bool {
        self.core.control.listener_running()
    }

    /// Dial `target` (plain number or `tel:` URI) once the listener has
    /// finished its handshake; immediately if it already has.
    pub fn queue_dial(&self, target: &str) -> Result<(), HfpError> {
        let number = phone::parse_dial_target(target)?;
        *self.core.pending_dial.lock() = Some(number.clone());

        // Whoever takes the number dials it: us, or the listener on ready.
        if self.core.control.listener_ready() {
            let pending = self.core.pending_dial.lock().take();
            return match pending {
                Some(number) => self.core.dial(&number),
                None => Ok(()),
            };
        }
        self.core
            .notifier
            .log(format!("Will dial {number} once the phone link is up"));
        Ok(())
    }

    pub fn dial(&self, target: &str) -> Result<(), HfpError> {
        self.core.dial(target)
    }

    pub fn answer(&self) -> Result<(), HfpError> {
        self.core.answer()
    }

    pub fn reject(&self) -> Result<(), HfpError> {
        self.core.reject()
    }

    pub fn hangup(&self) -> Result<(), HfpError> {
        self.core.hangup()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.core.call.snapshot()
    }

    pub fn call_state(&self) -> CallState {
        self.core.call.state()
    }

    pub fn audio_open(&self) -> bool {
        self.core.sco.is_open()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.core.adapter.connection_state()
    }

    /// Close every channel and return to Idle. Idempotent.
    pub fn shutdown(&self) {
        self.core.shutdown();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.core.shutdown();
    }
}

// ── Core ──────────────────────────────────────────────────────────────────────

struct Core {
    config: Config,
    adapter: Arc<dyn AdapterService>,
    discovery: Arc<dyn ChannelDiscovery>,
    contacts: Arc<dyn ContactsLookup>,
    notifier: Notifier,
    call: CallMachine,
    control: ControlManager,
    sco: Arc<ScoChannel>,
    ringer: Ringer,
    /// Address the current channels were opened against.
    device: Mutex<Option<BdAddr>>,
    pending_dial: Mutex<Option<String>>,
    me: Weak<Core>,
}

impl Core {
    fn handler(&self) -> Weak<dyn ChunkHandler> {
        self.me.clone()
    }

    fn ensure_connected(&self) -> Result<(), HfpError> {
        match self.adapter.connection_state() {
            ConnectionState::Connected => Ok(()),
            other => Err(HfpError::NotConnected(other.label().to_string())),
        }
    }

    fn resolve_device(&self) -> Result<BdAddr, HfpError> {
        let addr = match self.config.device.as_deref() {
            Some(s) => BdAddr::parse(s)?,
            None => self.adapter.device_address().ok_or(HfpError::NoDevice)?,
        };
        *self.device.lock() = Some(addr);
        Ok(addr)
    }

    fn channel_for(&self, addr: BdAddr) -> u8 {
        if let Some(ch) = self.config.channel {
            return ch;
        }
        match self.discovery.find_hfp_channel(addr) {
            Some(ch) => ch,
            None => {
                debug!("no HFP channel from SDP, using {DEFAULT_HFP_CHANNEL}");
                DEFAULT_HFP_CHANNEL
            }
        }
    }

    fn start_listener(&self) -> Result<(), HfpError> {
        self.ensure_connected()?;
        let addr = self.resolve_device()?;
        let channel = self.channel_for(addr);
        self.notifier
            .log(format!("Starting call listener on {addr} channel {channel}"));
        self.control.start_listener(addr, channel, self.handler())
    }

    fn dial(&self, target: &str) -> Result<(), HfpError> {
        let number = phone::parse_dial_target(target)?;
        self.ensure_connected()?;
        let state = self.call.state();
        if state != CallState::Idle {
            return Err(HfpError::InvalidState { op: "dial", state });
        }
        let addr = self.resolve_device()?;

        self.notifier.log(format!("Dialing {number}"));
        if self.control.listener_ready() {
            self.control.dial_via_listener(&number, |outcome, reply| {
                self.call_placed(Role::Listener, &number, outcome, reply);
            })?;
        } else {
            let channel = self.channel_for(addr);
            self.control.dial_fresh(addr, channel, &number, self.handler(), |outcome, reply| {
                self.call_placed(Role::Dialer, &number, outcome, reply)
            })?;
        }
        self.ensure_audio();
        Ok(())
    }

    /// The phone took the `ATD`. Runs before the channel's reader sees
    /// anything newer than `reply`.
    fn call_placed(&self, role: Role, number: &str, outcome: &DialOutcome, reply: &[u8]) -> Flow {
        if let DialOutcome::Tentative(text) = outcome {
            self.notifier
                .log(format!("Unrecognized dial response ({text}); assuming the call is placed"));
        }
        let name = self.contacts.lookup_name(number);
        self.call.set_caller(number, name.as_deref());
        self.call.transition(CallState::Outgoing, self);
        self.forward(role, reply)
    }

    fn answer(&self) -> Result<(), HfpError> {
        let state = self.call.state();
        if state != CallState::Ringing {
            return Err(HfpError::InvalidState { op: "answer", state });
        }
        let sent = self.control.send_command(at::ANSWER, |role, reply| {
            if Signals::scan(reply).error {
                warn!("phone answered ATA with ERROR, continuing");
            }
            self.notifier.log("Call answered");
            self.call.transition(CallState::Active, self);
            self.forward(role, reply);
        });
        if let Err(e) = sent {
            self.control_lost(&e);
            return Err(e);
        }
        self.ensure_audio();
        Ok(())
    }

    fn reject(&self) -> Result<(), HfpError> {
        let state = self.call.state();
        if !matches!(state, CallState::Ringing | CallState::Outgoing) {
            return Err(HfpError::InvalidState { op: "reject", state });
        }
        self.end_call("Call rejected")
    }

    fn hangup(&self) -> Result<(), HfpError> {
        let state = self.call.state();
        if !matches!(state, CallState::Active | CallState::Outgoing) {
            return Err(HfpError::InvalidState { op: "hang up", state });
        }
        self.end_call("Call ended")
    }

    fn end_call(&self, msg: &str) -> Result<(), HfpError> {
        let sent = self.control.send_command(at::HANG_UP, |role, reply| {
            self.notifier.log(msg);
            self.call.transition(CallState::Idle, self);
            self.forward(role, reply);
            role
        });
        match sent {
            Ok(Role::Dialer) => self.control.close_dialer(),
            Ok(Role::Listener) => {}
            Err(e) => {
                self.control_lost(&e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// A command could not reach the phone: the call can no longer be
    /// steered, so end it locally.
    fn control_lost(&self, e: &HfpError) {
        self.notifier.log(format!("Call control lost: {e}"));
        self.call.transition(CallState::Idle, self);
        self.control.close_dialer();
    }

    /// Dispatch whatever arrived alongside a command reply.
    fn forward(&self, role: Role, reply: &[u8]) -> Flow {
        let rest = at::unsolicited(reply);
        if rest.iter().all(u8::is_ascii_whitespace) {
            return Flow::Continue;
        }
        self.on_chunk(role, &rest)
    }

    fn shutdown(&self) {
        self.pending_dial.lock().take();
        self.control.stop();
        self.call.transition(CallState::Idle, self);
        self.sco.close(None);
        self.ringer.stop();
    }

    /// Open SCO for the current call. A call that ended while the link was
    /// coming up gets it closed again.
    fn ensure_audio(&self) {
        if self.call.state() == CallState::Idle {
            return;
        }
        let Some(addr) = *self.device.lock() else {
            warn!("no device address for SCO");
            return;
        };
        if let Err(e) = self.sco.ensure_open(addr) {
            self.notifier.log(format!("Audio link failed: {e}"));
            return;
        }
        if self.call.state() == CallState::Idle {
            self.sco.close(Some("SCO audio closed"));
        }
    }

    fn caller_label(number: &str, name: Option<&str>) -> String {
        match name {
            Some(name) => format!("{name} ({number})"),
            None => number.to_string(),
        }
    }
}

impl CallHooks for Core {
    fn start_alert(&self) {
        self.ringer.start();
    }

    fn stop_alert(&self) {
        self.ringer.stop();
    }

    fn raise_window(&self) {
        self.notifier.post(UiEvent::Raise);
    }

    fn teardown_audio(&self) {
        self.sco.close(Some("SCO audio closed"));
    }

    fn call_changed(&self, snapshot: CallSnapshot) {
        self.notifier.post(UiEvent::CallChanged(snapshot));
    }
}

impl ChunkHandler for Core {
    fn on_chunk(&self, role: Role, chunk: &[u8]) -> Flow {
        let signals = Signals::scan(chunk);
        let mut ended = false;

        if let Some(caller) = signals.clip.then(|| at::parse_clip(chunk)).flatten() {
            let name = caller
                .name
                .clone()
                .or_else(|| self.contacts.lookup_name(&caller.number));
            self.call.set_caller(&caller.number, name.as_deref());
            self.notifier.log(format!(
                "Caller: {}",
                Self::caller_label(&caller.number, name.as_deref())
            ));
            if self.call.state() == CallState::Ringing {
                self.call.refresh(self);
            } else {
                self.call.transition(CallState::Ringing, self);
            }
        }

        if signals.ring && self.call.state() != CallState::Ringing {
            self.notifier.log("Incoming call");
            self.call.transition(CallState::Ringing, self);
        }

        for (indicator, value) in at::parse_all_ciev(chunk) {
            let action = call::decide_indicator(self.call.state(), indicator, value);
            if let Some(note) = action.note {
                self.notifier.log(note);
            }
            if let Some(target) = action.target {
                if self.call.transition(target, self) && target == CallState::Idle {
                    ended = true;
                }
            }
            if action.wants_audio {
                self.ensure_audio();
            }
        }

        // With an indicator in the same chunk the indicator is authoritative.
        let terminal = signals.call_ended() || (role == Role::Listener && signals.error);
        if terminal && !signals.ciev && self.call.state() != CallState::Idle {
            self.notifier
                .log(format!("Call ended ({})", at::preview(chunk, 40)));
            self.call.transition(CallState::Idle, self);
            ended = true;
        }

        if role == Role::Dialer && ended {
            Flow::Stop
        } else {
            Flow::Continue
        }
    }

    fn on_link_lost(&self, role: Role) {
        match role {
            Role::Listener => {
                if !self.control.has_dialer() && self.call.state() != CallState::Idle {
                    self.call.transition(CallState::Idle, self);
                }
                self.notifier.post(UiEvent::ListenerLost);
            }
            Role::Dialer => {
                if !self.control.listener_ready() && self.call.state() != CallState::Idle {
                    self.notifier.log("Call control lost");
                    self.call.transition(CallState::Idle, self);
                }
            }
        }
    }

    fn on_listener_ready(&self) {
        let pending = self.pending_dial.lock().take();
        if let Some(number) = pending {
            if let Err(e) = self.dial(&number) {
                self.notifier.log(format!("Queued dial failed: {e}"));
            }
        }
    }
}
