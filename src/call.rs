//! Call lifecycle.
//!
//! ```text
//! Idle ─► Ringing ─► Active ─► Idle      incoming
//! Idle ─► Outgoing ─► Active ─► Idle     outgoing
//! any  ─► Idle                           abort / error
//! ```
//!
//! State only changes through [`CallMachine::transition`]; side effects of a
//! transition (alert, window raise, audio teardown, redraw) go through
//! [`CallHooks`] so the machine itself does no I/O.

use std::fmt;

use parking_lot::Mutex;

use crate::at;

/// Display caps on caller info.
pub const MAX_NUMBER_CHARS: usize = 63;
pub const MAX_NAME_CHARS: usize = 127;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallState {
    #[default]
    Idle,
    Ringing,
    Outgoing,
    Active,
}

impl CallState {
    pub fn label(&self) -> &'static str {
        match self {
            CallState::Idle     => "idle",
            CallState::Ringing  => "ringing",
            CallState::Outgoing => "outgoing",
            CallState::Active   => "active",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Everything a call display needs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallSnapshot {
    pub state: CallState,
    pub number: Option<String>,
    pub name: Option<String>,
}

/// Side effects of state changes.
pub trait CallHooks {
    fn start_alert(&self);
    fn stop_alert(&self);
    fn raise_window(&self);
    /// Must be idempotent.
    fn teardown_audio(&self);
    fn call_changed(&self, snapshot: CallSnapshot);
}

#[derive(Debug, Default)]
pub struct CallMachine {
    inner: Mutex<CallSnapshot>,
}

impl CallMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CallState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.inner.lock().clone()
    }

    /// Record caller identity without changing state.
    pub fn set_caller(&self, number: &str, name: Option<&str>) {
        let mut g = self.inner.lock();
        g.number = Some(bounded(number, MAX_NUMBER_CHARS)).filter(|n| !n.is_empty());
        g.name = name
            .map(|n| bounded(n, MAX_NAME_CHARS))
            .filter(|n| !n.is_empty());
    }

    /// Move to `new`. Returns `false` (and does nothing) when already there.
    pub fn transition(&self, new: CallState, hooks: &dyn CallHooks) -> bool {
        let (old, snapshot) = {
            let mut g = self.inner.lock();
            if g.state == new {
                return false;
            }
            let old = g.state;
            g.state = new;
            if new == CallState::Idle {
                g.number = None;
                g.name = None;
            }
            (old, g.clone())
        };

        if old == CallState::Ringing {
            hooks.stop_alert();
        }
        match new {
            CallState::Ringing => {
                hooks.start_alert();
                hooks.raise_window();
            }
            CallState::Idle => hooks.teardown_audio(),
            CallState::Outgoing | CallState::Active => {}
        }
        hooks.call_changed(snapshot);
        true
    }

    /// Redraw without a state change.
    pub fn refresh(&self, hooks: &dyn CallHooks) {
        hooks.call_changed(self.snapshot());
    }
}

fn bounded(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

// ── Indicator decisions ───────────────────────────────────────────────────────

/// What a `+CIEV` means given the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndicatorAction {
    pub target: Option<CallState>,
    /// Open the SCO link now if it is not open yet.
    pub wants_audio: bool,
    pub note: Option<&'static str>,
}

/// Map `+CIEV: <indicator>,<value>` onto the state machine.
///
/// `callsetup=0` only ends the call when no call became active: the setup
/// indicator also clears when an outgoing call is answered.
pub fn decide_indicator(current: CallState, indicator: i32, value: i32) -> IndicatorAction {
    let none = IndicatorAction::default();
    match (indicator, value) {
        (at::IND_CALL, 1) => IndicatorAction {
            target: Some(CallState::Active),
            wants_audio: true,
            note: Some("Call active"),
        },
        (at::IND_CALL, 0) if current != CallState::Idle => IndicatorAction {
            target: Some(CallState::Idle),
            note: Some("Call ended"),
            ..none
        },
        (at::IND_CALL_SETUP, 0) if current != CallState::Active => IndicatorAction {
            target: Some(CallState::Idle),
            note: matches!(current, CallState::Outgoing | CallState::Ringing)
                .then_some("Call setup cleared"),
            ..none
        },
        (at::IND_CALL_SETUP, 1) => IndicatorAction {
            target: Some(CallState::Ringing),
            note: (current != CallState::Ringing).then_some("Incoming call"),
            ..none
        },
        (at::IND_CALL_SETUP, 2 | 3) => IndicatorAction {
            target: Some(CallState::Outgoing),
            wants_audio: true,
            note: (current != CallState::Outgoing).then_some("Outgoing call"),
        },
        _ => none,
    }
}
