//! Bluetooth collaborators for Linux (BlueZ / PipeWire / PulseAudio) focused.
//!
//! The HFP core only needs three things from the rest of the system:
//!
//!   ① the phone's address and whether it is connected  ([`AdapterService`])
//!   ② the RFCOMM channel of the phone's HFP Audio Gateway  ([`ChannelDiscovery`])
//!   ③ a way to make the audio server let go of the SCO link  ([`AudioSubsystem`])
//!
//! The default implementations shell out to `bluetoothctl`, `sdptool` and
//! `pactl` rather than talking D-Bus; pairing is left to the desktop.

use std::fmt;
use std::str::FromStr;

use crate::errors::HfpError;

// ── Types ─────────────────────────────────────────────────────────────────────

/// A Bluetooth device address.
///
/// Stored in display order (`AA:BB:…` → `[0xAA, 0xBB, …]`); [`BdAddr::to_bluez`]
/// gives the reversed byte order BlueZ socket addresses use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BdAddr([u8; 6]);

impl BdAddr {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Parse `XX:XX:XX:XX:XX:XX` (or `XX_XX_…` as PipeWire writes it).
    pub fn parse(s: &str) -> Result<Self, HfpError> {
        let parts: Vec<&str> = s.trim().split([':', '_']).collect();
        if parts.len() != 6 {
            return Err(HfpError::InvalidAddress(s.to_string()));
        }
        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.len() != 2 {
                return Err(HfpError::InvalidAddress(s.to_string()));
            }
            bytes[i] = u8::from_str_radix(part, 16)
                .map_err(|_| HfpError::InvalidAddress(s.to_string()))?;
        }
        Ok(Self(bytes))
    }

    pub fn to_bluez(self) -> [u8; 6] {
        let mut b = self.0;
        b.reverse();
        b
    }
}

impl FromStr for BdAddr {
    type Err = HfpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// Where the phone is in the pairing/connection lifecycle. Owned by the
/// surrounding application; the core only refuses to work unless `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Discoverable,
    Pairing,
    Paired,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Idle         => "idle",
            ConnectionState::Discoverable => "discoverable",
            ConnectionState::Pairing      => "pairing",
            ConnectionState::Paired       => "paired",
            ConnectionState::Connecting   => "connecting",
            ConnectionState::Connected    => "connected",
            ConnectionState::Error        => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ── Collaborator traits ───────────────────────────────────────────────────────

/// The Bluetooth adapter as seen by the core: read-only.
pub trait AdapterService: Send + Sync {
    fn device_address(&self) -> Option<BdAddr>;
    fn connection_state(&self) -> ConnectionState;
}

/// SDP lookup of the phone's HFP Audio Gateway RFCOMM channel.
pub trait ChannelDiscovery: Send + Sync {
    fn find_hfp_channel(&self, addr: BdAddr) -> Option<u8>;
}

/// Channel used when discovery yields nothing.
pub const DEFAULT_HFP_CHANNEL: u8 = 3;

/// The host audio server, which may hold the phone's SCO link itself.
pub trait AudioSubsystem: Send + Sync {
    /// Ask the audio server to drop its claim on the SCO link.
    fn release_sco_claim(&self);
}

// ── Public API ────────────────────────────────────────────────────────────────

/// [`AdapterService`] backed by `bluetoothctl`.
///
/// With a configured address it reports that device; otherwise it picks the
/// first device bluetoothctl lists as connected.
#[derive(Debug, Clone, Default)]
pub struct Bluetoothctl {
    pub device: Option<BdAddr>,
}

impl AdapterService for Bluetoothctl {
    fn device_address(&self) -> Option<BdAddr> {
        self.device.or_else(inner::first_connected_device)
    }

    fn connection_state(&self) -> ConnectionState {
        match self.device_address() {
            Some(addr) => inner::device_state(addr),
            None => ConnectionState::Idle,
        }
    }
}

/// [`ChannelDiscovery`] backed by `sdptool search HFAG`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sdptool;

impl ChannelDiscovery for Sdptool {
    fn find_hfp_channel(&self, addr: BdAddr) -> Option<u8> {
        inner::find_hfp_channel(addr)
    }
}

/// [`AudioSubsystem`] backed by `pactl`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pactl;

impl AudioSubsystem for Pactl {
    fn release_sco_claim(&self) {
        inner::unload_bluez_device_module();
    }
}

// ── Output parsing (platform independent) ─────────────────────────────────────

/// Connection state from `bluetoothctl info <MAC>` output.
pub fn parse_info_state(text: &str) -> ConnectionState {
    if text.contains("not available") {
        return ConnectionState::Idle;
    }
    let mut paired = false;
    let mut connected = false;
    for line in text.lines() {
        let t = line.trim();
        if let Some(v) = t.strip_prefix("Paired:") {
            paired = v.trim() == "yes";
        }
        if let Some(v) = t.strip_prefix("Connected:") {
            connected = v.trim() == "yes";
        }
    }
    match (paired, connected) {
        (_, true)     => ConnectionState::Connected,
        (true, false) => ConnectionState::Paired,
        _             => ConnectionState::Idle,
    }
}

/// Addresses from `bluetoothctl devices …` output (`Device <MAC> <name>`).
pub fn parse_device_list(text: &str) -> Vec<BdAddr> {
    text.lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            if cols.next()? != "Device" { return None; }
            BdAddr::parse(cols.next()?).ok()
        })
        .collect()
}

/// RFCOMM channel of the first record in `sdptool search` output.
pub fn parse_sdp_channel(text: &str) -> Option<u8> {
    let mut in_rfcomm = false;
    for line in text.lines() {
        let t = line.trim();
        if t.starts_with("\"RFCOMM\"") {
            in_rfcomm = true;
            continue;
        }
        if in_rfcomm {
            if let Some(rest) = t.strip_prefix("Channel:") {
                if let Ok(ch) = rest.trim().parse::<u8>() {
                    if ch != 0 { return Some(ch); }
                }
            }
            if t.starts_with('"') { in_rfcomm = false; }
        }
    }
    None
}

// ── Linux implementation ──────────────────────────────────────────────────────

#[cfg(target_os = "linux")]
mod inner {
    use super::{parse_device_list, parse_info_state, parse_sdp_channel, BdAddr, ConnectionState};
    use std::process::Command;

    use tracing::{debug, info};

    pub fn device_state(addr: BdAddr) -> ConnectionState {
        let out = run("bluetoothctl", &["info", &addr.to_string()]);
        if out.is_empty() {
            return ConnectionState::Error;
        }
        parse_info_state(&String::from_utf8_lossy(&out))
    }

    pub fn first_connected_device() -> Option<BdAddr> {
        // BlueZ ≥ 5.65 filters for us; older versions need a per-device check.
        let out = run("bluetoothctl", &["devices", "Connected"]);
        if let Some(addr) = parse_device_list(&String::from_utf8_lossy(&out)).into_iter().next() {
            return Some(addr);
        }
        let all = run("bluetoothctl", &["devices"]);
        parse_device_list(&String::from_utf8_lossy(&all))
            .into_iter()
            .find(|addr| device_state(*addr) == ConnectionState::Connected)
    }

    pub fn find_hfp_channel(addr: BdAddr) -> Option<u8> {
        let out = run("sdptool", &["search", "--bdaddr", &addr.to_string(), "HFAG"]);
        let channel = parse_sdp_channel(&String::from_utf8_lossy(&out));
        match channel {
            Some(ch) => info!(%addr, channel = ch, "HFP-AG channel found"),
            None => debug!(%addr, "SDP lookup yielded no HFP-AG channel"),
        }
        channel
    }

    pub fn unload_bluez_device_module() {
        let ok = Command::new("pactl")
            .args(["unload-module", "module-bluez5-device"])
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        debug!(ok, "pactl unload-module module-bluez5-device");
    }

    pub fn run(cmd: &str, args: &[&str]) -> Vec<u8> {
        Command::new(cmd)
            .args(args)
            .output()
            .map(|o| o.stdout)
            .unwrap_or_default()
    }
}

// ── Non-Linux stub ─────────────────────────────────────────────────────────────

#[cfg(not(target_os = "linux"))]
mod inner {
    use super::{BdAddr, ConnectionState};

    pub fn device_state(_addr: BdAddr) -> ConnectionState { ConnectionState::Error }

    pub fn first_connected_device() -> Option<BdAddr> { None }

    pub fn find_hfp_channel(_addr: BdAddr) -> Option<u8> { None }

    pub fn unload_bluez_device_module() {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trips_through_display() {
        let addr = BdAddr::parse("a4:93:40:A0:87:57").unwrap();
        assert_eq!(addr.to_string(), "A4:93:40:A0:87:57");
        assert_eq!(addr.to_bluez(), [0x57, 0x87, 0xA0, 0x40, 0x93, 0xA4]);
        assert_eq!(BdAddr::parse("A4_93_40_A0_87_57").unwrap(), addr);
    }

    #[test]
    fn bad_addresses() {
        for s in ["", "A4:93:40:A0:87", "A4:93:40:A0:87:5G", "A4:93:40:A0:87:575"] {
            assert!(BdAddr::parse(s).is_err(), "{s}");
        }
    }

    #[test]
    fn info_state() {
        let text = "Device AA:BB:CC:DD:EE:FF (public)\n\tName: Pixel\n\tPaired: yes\n\tTrusted: yes\n\tConnected: yes\n";
        assert_eq!(parse_info_state(text), ConnectionState::Connected);
        let text = "\tPaired: yes\n\tConnected: no\n";
        assert_eq!(parse_info_state(text), ConnectionState::Paired);
        assert_eq!(
            parse_info_state("Device AA:BB:CC:DD:EE:FF not available\n"),
            ConnectionState::Idle
        );
    }

    #[test]
    fn device_list() {
        let text = "Device AA:BB:CC:DD:EE:FF Pixel 7\nController 00:11:22:33:44:55 laptop\nDevice 11:22:33:44:55:66 Buds\n";
        let list = parse_device_list(text);
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].to_string(), "11:22:33:44:55:66");
    }

    #[test]
    fn sdp_channel() {
        let text = "\
Searching for HFAG on AA:BB:CC:DD:EE:FF ...
Service Name: Voice Gateway
Service RecHandle: 0x10003
Service Class ID List:
  \"Handsfree Audio Gateway\" (0x111f)
  \"Generic Audio\" (0x1203)
Protocol Descriptor List:
  \"L2CAP\" (0x0100)
  \"RFCOMM\" (0x0003)
    Channel: 13
Profile Descriptor List:
";
        assert_eq!(parse_sdp_channel(text), Some(13));
        assert_eq!(parse_sdp_channel("Searching for HFAG ...\n"), None);
    }
}
