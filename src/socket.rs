//! Raw BlueZ RFCOMM and SCO sockets using libc.
//!
//! AF_BLUETOOTH + SOCK_STREAM + BTPROTO_RFCOMM for the AT channel,
//! AF_BLUETOOTH + SOCK_SEQPACKET + BTPROTO_SCO for voice.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::bluetooth::BdAddr;
use crate::link::{ControlLink, LinkConnector, ScoLink};

// Bluetooth socket constants (from <bluetooth/bluetooth.h>, <bluetooth/rfcomm.h>
// and <bluetooth/sco.h>)
const AF_BLUETOOTH: i32 = 31;
const BTPROTO_RFCOMM: i32 = 3;
const BTPROTO_SCO: i32 = 2;
const SOL_BLUETOOTH: i32 = 274;
const BT_VOICE: i32 = 11;
const BT_VOICE_CVSD_16BIT: u16 = 0x0060;
const SOL_SCO: i32 = 17;
const SCO_OPTIONS: i32 = 0x01;

#[repr(C)]
struct SockaddrRc {
    rc_family: u16,
    rc_bdaddr: [u8; 6],
    rc_channel: u8,
}

#[repr(C)]
struct SockaddrSco {
    sco_family: u16,
    sco_bdaddr: [u8; 6],
}

#[repr(C)]
struct BtVoice {
    setting: u16,
}

#[repr(C)]
#[derive(Default)]
struct ScoOptions {
    mtu: u16,
}

// ── Owned descriptor ──────────────────────────────────────────────────────────

/// A socket fd closed on drop. `shutdown` may be called from any thread and
/// wakes readers blocked on the fd without racing the close.
struct Fd {
    fd: RawFd,
    shut: AtomicBool,
}

impl Fd {
    fn socket(kind: i32, proto: i32) -> io::Result<Self> {
        let fd = unsafe { libc::socket(AF_BLUETOOTH, kind, proto) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd, shut: AtomicBool::new(false) })
    }

    fn connect<T>(&self, addr: &T) -> io::Result<()> {
        let ret = unsafe {
            libc::connect(
                self.fd,
                addr as *const T as *const libc::sockaddr,
                std::mem::size_of::<T>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn send(&self, data: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::send(
                self.fd,
                data.as_ptr() as *const libc::c_void,
                data.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// `Ok(false)` on timeout.
    fn poll_readable(&self, timeout: Duration) -> io::Result<bool> {
        let mut pfd = libc::pollfd { fd: self.fd, events: libc::POLLIN, revents: 0 };
        let ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        let ret = unsafe { libc::poll(&mut pfd, 1, ms) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ret > 0)
    }

    fn shutdown(&self) {
        if !self.shut.swap(true, Ordering::SeqCst) {
            unsafe {
                libc::shutdown(self.fd, libc::SHUT_RDWR);
            }
        }
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        self.shutdown();
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ── RFCOMM ────────────────────────────────────────────────────────────────────

/// A connected RFCOMM socket to a phone's HFP Audio Gateway.
pub struct RfcommSocket {
    fd: Fd,
}

impl RfcommSocket {
    pub fn connect(addr: BdAddr, channel: u8) -> io::Result<Self> {
        let fd = Fd::socket(libc::SOCK_STREAM, BTPROTO_RFCOMM)?;
        let sa = SockaddrRc {
            rc_family: AF_BLUETOOTH as u16,
            rc_bdaddr: addr.to_bluez(),
            rc_channel: channel,
        };
        fd.connect(&sa)?;
        debug!(%addr, channel, "RFCOMM connected");
        Ok(Self { fd })
    }
}

impl ControlLink for RfcommSocket {
    fn send(&self, data: &[u8]) -> io::Result<usize> {
        self.fd.send(data)
    }

    fn recv_timeout(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        if !self.fd.poll_readable(timeout)? {
            return Ok(None);
        }
        self.fd.recv(buf).map(Some)
    }

    fn shutdown(&self) {
        self.fd.shutdown();
    }
}

// ── SCO ───────────────────────────────────────────────────────────────────────

/// A connected SCO voice socket.
pub struct ScoSocket {
    fd: Fd,
    mtu: Option<u16>,
}

impl ScoSocket {
    pub fn connect(addr: BdAddr) -> io::Result<Self> {
        let fd = Fd::socket(libc::SOCK_SEQPACKET, BTPROTO_SCO)?;

        // Some stacks don't support it; the default air mode still works.
        let voice = BtVoice { setting: BT_VOICE_CVSD_16BIT };
        let ret = unsafe {
            libc::setsockopt(
                fd.fd,
                SOL_BLUETOOTH,
                BT_VOICE,
                &voice as *const BtVoice as *const libc::c_void,
                std::mem::size_of::<BtVoice>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            info!("SCO voice setting: {}", io::Error::last_os_error());
        }

        let sa = SockaddrSco {
            sco_family: AF_BLUETOOTH as u16,
            sco_bdaddr: addr.to_bluez(),
        };
        fd.connect(&sa)?;

        let mut opts = ScoOptions::default();
        let mut len = std::mem::size_of::<ScoOptions>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                fd.fd,
                SOL_SCO,
                SCO_OPTIONS,
                &mut opts as *mut ScoOptions as *mut libc::c_void,
                &mut len,
            )
        };
        let mtu = (ret == 0 && opts.mtu > 0).then_some(opts.mtu);

        Ok(Self { fd, mtu })
    }
}

impl ScoLink for ScoSocket {
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.fd.recv(buf)
    }

    fn send(&self, data: &[u8]) -> io::Result<usize> {
        self.fd.send(data)
    }

    fn mtu(&self) -> Option<u16> {
        self.mtu
    }

    fn shutdown(&self) {
        self.fd.shutdown();
    }
}

// ── Connector ─────────────────────────────────────────────────────────────────

/// [`LinkConnector`] opening real BlueZ sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct BluezConnector;

impl LinkConnector for BluezConnector {
    fn connect_control(&self, addr: BdAddr, channel: u8) -> io::Result<Arc<dyn ControlLink>> {
        Ok(Arc::new(RfcommSocket::connect(addr, channel)?))
    }

    fn connect_sco(&self, addr: BdAddr) -> io::Result<Arc<dyn ScoLink>> {
        Ok(Arc::new(ScoSocket::connect(addr)?))
    }
}
