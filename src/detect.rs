// ─────────────────────────────────────────────────────────────────────────────
//  esp32-flasher :: detect  -  serial port / ESP device detection
//
//  Heuristic only. Ports come from `serialport::available_ports()`; each one
//  is matched first against a static USB VID:PID table, then, failing that,
//  against description keywords (case-insensitive). A port matching neither
//  is dropped. Nothing here speaks the ROM bootloader protocol, so a
//  similarly-named non-ESP adapter will happily show up as a candidate.
//
//  Reachability is an open/close check done last. It is advisory: an
//  openable port is not proof of a flashable target, and a busy port may
//  still be the right one.
// ─────────────────────────────────────────────────────────────────────────────

use std::time::Duration;

use log::{debug, info, trace};
use serialport::SerialPortType;

use crate::error::{FlashError, Result};

const PROBE_BAUD: u32 = 115_200;
const PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// Label for ports whose exact chip cannot be known from USB ids alone.
pub const GENERIC_FAMILY: &str = "ESP32";

/// Raw facts about one OS serial port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortInfo {
    pub port:          String,
    pub description:   Option<String>,
    pub vid:           Option<u16>,
    pub pid:           Option<u16>,
    pub serial_number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCandidate {
    pub port:        String,
    pub description: String,
    /// Best-effort family label, never protocol-verified.
    pub chip_family: &'static str,
    /// USB vendor id, 0 when the port is not USB.
    pub vid:         u16,
    pub pid:         u16,
    pub matched_by:  MatchKind,
    pub reachable:   bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    UsbId,
    Keyword,
}

// ─────────────────────────────────────────────────────────────────────────────
//  Known identifiers
// ─────────────────────────────────────────────────────────────────────────────

/// (VID, PID, bridge, family)
static USB_IDS: &[(u16, u16, &str, &str)] = &[
    // ── Silicon Labs CP210x ───────────────────────────────────────────────
    (0x10C4, 0xEA60, "CP2102/CP2109", GENERIC_FAMILY),
    (0x10C4, 0xEA70, "CP2105",        GENERIC_FAMILY),
    (0x10C4, 0xEA71, "CP2108",        GENERIC_FAMILY),
    // ── WCH ───────────────────────────────────────────────────────────────
    (0x1A86, 0x7523, "CH340",         GENERIC_FAMILY),
    (0x1A86, 0x5523, "CH341",         GENERIC_FAMILY),
    (0x1A86, 0x55D4, "CH9102",        GENERIC_FAMILY),
    // ── FTDI ──────────────────────────────────────────────────────────────
    (0x0403, 0x6001, "FT232R",        GENERIC_FAMILY),
    (0x0403, 0x6010, "FT2232",        GENERIC_FAMILY),
    (0x0403, 0x6011, "FT4232H",       GENERIC_FAMILY),
    (0x0403, 0x6014, "FT232H",        GENERIC_FAMILY),
    (0x0403, 0x6015, "FT-X",          GENERIC_FAMILY),
    // ── Espressif native USB ──────────────────────────────────────────────
    (0x303A, 0x1001, "native USB",    "ESP32-S2"),
    (0x303A, 0x0002, "native USB DFU","ESP32-S2"),
    (0x303A, 0x0003, "native USB",    "ESP32-S3"),
    (0x303A, 0x0004, "native USB",    "ESP32-C3"),
];

/// Lowercase substrings of port descriptions or names seen on ESP boards.
static KEYWORDS: &[&str] = &[
    "cp210x",
    "usb to uart bridge",
    "ch340",
    "usb-serial",
    "usb serial",
    "esp32",
    "slab_usbtouart",
    "usbserial",
    "wchusbserial",
    "ttyusb",
];

// ─────────────────────────────────────────────────────────────────────────────
//  Public API
// ─────────────────────────────────────────────────────────────────────────────

/// Every serial port the OS reports, unfiltered.
pub fn list_all_ports() -> Vec<PortInfo> {
    let ports = match serialport::available_ports() {
        Ok(p) => p,
        Err(e) => {
            debug!("detect: failed to enumerate serial ports: {e}");
            return Vec::new();
        }
    };

    let mut out: Vec<PortInfo> = ports
        .into_iter()
        .map(|p| {
            let mut info = PortInfo { port: p.port_name, ..PortInfo::default() };
            if let SerialPortType::UsbPort(usb) = p.port_type {
                trace!("detect: {} is USB {:04X}:{:04X}", info.port, usb.vid, usb.pid);
                info.vid = Some(usb.vid);
                info.pid = Some(usb.pid);
                info.serial_number = usb.serial_number;
                info.description = match (usb.manufacturer, usb.product) {
                    (Some(m), Some(p)) => Some(format!("{m} {p}")),
                    (m, p) => m.or(p),
                };
            }
            info
        })
        .collect();

    out.sort_by(|a, b| a.port.cmp(&b.port));
    out
}

/// Candidate ESP devices, each checked for reachability.
pub fn scan() -> Vec<DeviceCandidate> {
    let found: Vec<DeviceCandidate> = list_all_ports()
        .iter()
        .filter_map(classify)
        .map(|mut c| {
            c.reachable = is_reachable(&c.port);
            c
        })
        .collect();
    info!("detect: {} candidate device(s)", found.len());
    found
}

/// Match one port against the id table, then the keyword list.
pub fn classify(info: &PortInfo) -> Option<DeviceCandidate> {
    let description = info.description.clone().unwrap_or_default();

    if let (Some(vid), Some(pid)) = (info.vid, info.pid) {
        if let Some((_, _, bridge, family)) = USB_IDS.iter().find(|(v, p, _, _)| *v == vid && *p == pid) {
            return Some(DeviceCandidate {
                port: info.port.clone(),
                description: if description.is_empty() { (*bridge).to_owned() } else { description },
                chip_family: *family,
                vid: info.vid.unwrap_or(0),
                pid: info.pid.unwrap_or(0),
                matched_by: MatchKind::UsbId,
                reachable: false,
            });
        }
    }

    let haystack = format!("{} {}", description, info.port).to_lowercase();
    if KEYWORDS.iter().any(|k| haystack.contains(k)) {
        return Some(DeviceCandidate {
            port: info.port.clone(),
            description,
            chip_family: GENERIC_FAMILY,
            vid: info.vid.unwrap_or(0),
            pid: info.pid.unwrap_or(0),
            matched_by: MatchKind::Keyword,
            reachable: false,
        });
    }

    trace!("detect: {} does not look like an ESP device", info.port);
    None
}

/// Open and close the port. `true` only says nothing else holds it.
pub fn is_reachable(port: &str) -> bool {
    match serialport::new(port, PROBE_BAUD).timeout(PROBE_TIMEOUT).open() {
        Ok(_) => true,
        Err(e) => {
            debug!("detect: cannot open {port}: {e}");
            false
        }
    }
}

/// Pick the port to flash.
///
/// An explicit port always wins. Otherwise a single candidate is used, or the
/// `preferred` one (usually the last port used) when several are present.
pub fn choose_port(candidates: &[DeviceCandidate], explicit: Option<&str>, preferred: Option<&str>) -> Result<String> {
    if let Some(p) = explicit {
        return Ok(p.to_owned());
    }
    match candidates {
        [] => Err(FlashError::NoDeviceDetected),
        [only] => Ok(only.port.clone()),
        many => {
            if let Some(c) = preferred.and_then(|p| many.iter().find(|c| c.port == p)) {
                return Ok(c.port.clone());
            }
            Err(FlashError::AmbiguousDevice(
                many.iter().map(|c| c.port.as_str()).collect::<Vec<_>>().join(", "),
            ))
        }
    }
}
