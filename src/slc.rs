//! Service Level Connection handshake.
//!
//! `AT+BRSF` → `AT+CIND=?` → `AT+CIND?` → `AT+CMER` (one fallback retry)
//! → `AT+NREC=0` → `AT+CLIP=1` (listener only).
//!
//! The dialer needs a confirmed channel before it risks `ATD`, so a missing
//! `OK` on the first three steps aborts it. The listener is a long-lived
//! best-effort session and carries on through a noisy handshake; phones
//! differ in how strictly they answer.

use std::time::Duration;

use tracing::{debug, warn};

use crate::at;
use crate::errors::SlcError;
use crate::link::{self, ControlLink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// Outbound call on a fresh channel.
    Dialer,
    /// Permanent incoming-call listener.
    Listener,
}

impl Profile {
    /// `AT+BRSF` feature bitmask we advertise.
    pub fn features(self) -> u32 {
        match self {
            Profile::Dialer => 0,
            Profile::Listener => 1,
        }
    }

    fn strict(self) -> bool {
        self == Profile::Dialer
    }
}

/// Steps that completed without a recognizable `OK`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SlcReport {
    pub unconfirmed: Vec<&'static str>,
}

pub fn perform_slc(
    link: &dyn ControlLink,
    profile: Profile,
    timeout: Duration,
) -> Result<SlcReport, SlcError> {
    let mut report = SlcReport::default();
    let brsf = at::brsf(profile.features());

    let required: [(&'static str, &str); 3] = [
        ("AT+BRSF", brsf.as_str()),
        ("AT+CIND=?", at::CIND_TEST),
        ("AT+CIND?", at::CIND_READ),
    ];
    for (label, command) in required {
        let reply = step(link, label, command, timeout)?;
        if !confirmed(&reply) {
            if profile.strict() {
                return Err(SlcError::Rejected {
                    command: label,
                    response: at::preview(&reply, 80),
                });
            }
            report.unconfirmed.push(label);
        }
    }

    let reply = step(link, "AT+CMER", at::CMER_ENABLE, timeout)?;
    if !confirmed(&reply) {
        debug!("AT+CMER=3,0,0,1 not confirmed, falling back");
        let reply = step(link, "AT+CMER", at::CMER_FALLBACK, timeout)?;
        if !confirmed(&reply) {
            report.unconfirmed.push("AT+CMER");
        }
    }

    best_effort(link, at::NREC_DISABLE, timeout);
    if profile == Profile::Listener {
        best_effort(link, at::CLIP_ENABLE, timeout);
    }

    if !report.unconfirmed.is_empty() {
        warn!(?profile, steps = ?report.unconfirmed, "SLC steps unconfirmed, continuing");
    }
    Ok(report)
}

fn step(
    link: &dyn ControlLink,
    label: &'static str,
    command: &str,
    timeout: Duration,
) -> Result<Vec<u8>, SlcError> {
    let reply = link::exchange(link, command, timeout, at::is_final_response)
        .map_err(|source| SlcError::Transport { command: label, source })?;
    debug!(command = label, reply = %at::preview(&reply, 80), "SLC step");
    Ok(reply)
}

fn best_effort(link: &dyn ControlLink, command: &str, timeout: Duration) {
    let _ = link::exchange(link, command, timeout, at::is_final_response);
}

fn confirmed(reply: &[u8]) -> bool {
    at::contains(reply, b"OK")
}
