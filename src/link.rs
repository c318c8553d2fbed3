//! Transport seams: the control (RFCOMM) and audio (SCO) links the core
//! drives, and the connector that opens them. `socket.rs` has the BlueZ
//! implementations; tests plug in scripted fakes.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bluetooth::BdAddr;

/// A connected RFCOMM stream carrying AT lines.
///
/// Methods take `&self` so one thread can block in `recv_timeout` while
/// another writes a command or calls `shutdown` to wake it.
pub trait ControlLink: Send + Sync {
    fn send(&self, data: &[u8]) -> io::Result<usize>;

    /// `Ok(None)` on timeout, `Ok(Some(0))` when the peer closed.
    fn recv_timeout(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>>;

    /// Wake any blocked reader; further I/O fails. Idempotent.
    fn shutdown(&self);
}

/// A connected SCO socket carrying 8 kHz / 16-bit / mono PCM.
pub trait ScoLink: Send + Sync {
    /// Blocking receive; `Ok(0)` once the link is shut down or closed.
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn send(&self, data: &[u8]) -> io::Result<usize>;

    /// Negotiated MTU, if the stack reports one.
    fn mtu(&self) -> Option<u16>;

    /// Wake any blocked reader; further I/O fails. Idempotent.
    fn shutdown(&self);
}

/// Opens links to a phone.
pub trait LinkConnector: Send + Sync {
    fn connect_control(&self, addr: BdAddr, channel: u8) -> io::Result<Arc<dyn ControlLink>>;

    fn connect_sco(&self, addr: BdAddr) -> io::Result<Arc<dyn ScoLink>>;
}

// ── Command exchange ──────────────────────────────────────────────────────────

/// Send `command` and collect the reply until `done` accepts the bytes read
/// so far or `timeout` expires.
///
/// Silence is not an error: an empty buffer comes back on timeout. A link
/// that closes before any byte arrived is.
pub fn exchange(
    link: &dyn ControlLink,
    command: &str,
    timeout: Duration,
    done: fn(&[u8]) -> bool,
) -> io::Result<Vec<u8>> {
    link.send(command.as_bytes())?;
    read_until(link, timeout, done)
}

pub fn read_until(
    link: &dyn ControlLink,
    timeout: Duration,
    done: fn(&[u8]) -> bool,
) -> io::Result<Vec<u8>> {
    let deadline = Instant::now() + timeout;
    let mut reply = Vec::new();
    let mut buf = [0u8; 512];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match link.recv_timeout(&mut buf, remaining) {
            Ok(Some(0)) if reply.is_empty() => {
                return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "link closed"));
            }
            Ok(Some(0)) => break,
            Ok(Some(n)) => {
                reply.extend_from_slice(&buf[..n]);
                if done(&reply) {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if reply.is_empty() => return Err(e),
            Err(_) => break,
        }
    }
    Ok(reply)
}
