//! SDP generation and SAP announcements (RFC 2974).
//!
//! One background thread announces every Live slot to the SAP group on a
//! jittered interval, withdraws sessions that leave Live with a deletion
//! packet, and withdraws everything on shutdown.

use std::collections::HashMap;
use std::env;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::SlotConfig;
use crate::net;
use crate::{AES67_CHANNELS, AES67_SAMPLE_RATE};

/// Well-known SAP group and port (RFC 2974 administered scope).
pub const SAP_GROUP: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(224, 2, 127, 254), 9875);

/// Default announce interval and its jitter bound.
pub const SAP_INTERVAL: Duration = Duration::from_secs(30);
pub const SAP_JITTER: Duration = Duration::from_secs(3);

pub const PTP_GMID_ENV: &str = "PTP_GMID";
pub const PTP_DOMAIN_ENV: &str = "PTP_DOMAIN";

/// SAP flags byte: version 1, IPv4 origin, announce.
const SAP_FLAGS_ANNOUNCE: u8 = 0x20;
/// Same, with the message-type bit set: deletion.
const SAP_FLAGS_DELETE: u8 = 0x24;

/// Which of a slot's two flows an SDP describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpFlavor {
    /// The announced AES67 flow (L24, payload type 98).
    Aes67,
    /// The on-demand monitor flow (L16, payload type 11, port + 2).
    Monitor,
}

/// PTP reference identity carried in SDP. Purely declarative; the bridge
/// never disciplines its clock to it.
#[derive(Debug, Clone, Default)]
pub struct PtpClock {
    pub gmid: Option<String>,
    pub domain: u32,
}

impl PtpClock {
    /// Read `PTP_GMID` / `PTP_DOMAIN` from the environment.
    pub fn from_env() -> Self {
        let gmid = env::var(PTP_GMID_ENV)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let domain = env::var(PTP_DOMAIN_ENV)
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);
        Self { gmid, domain }
    }
}

/// Build the SDP text for one flow of a slot. CRLF line endings throughout.
pub fn build_sdp(
    cfg: &SlotConfig,
    flavor: SdpFlavor,
    origin: Ipv4Addr,
    ptp: &PtpClock,
) -> String {
    let (port, payload_type, codec, name_suffix) = match flavor {
        SdpFlavor::Aes67 => (cfg.mcast_port, 98, "L24", ""),
        SdpFlavor::Monitor => (cfg.monitor_port(), 11, "L16", " (Monitor L16)"),
    };
    let name = format!("{}{}", cfg.effective_stream_name(), name_suffix);

    let mut lines = vec![
        "v=0".to_string(),
        format!("o=- {} 0 IN IP4 {}", cfg.ssrc, origin),
        format!("s={name}"),
        format!("c=IN IP4 {}/32", cfg.mcast_ip),
        "t=0 0".to_string(),
        "a=recvonly".to_string(),
        format!("a=clock-domain:PTPv2 {}", ptp.domain),
        format!("m=audio {port} RTP/AVP {payload_type}"),
        format!("a=rtpmap:{payload_type} {codec}/{AES67_SAMPLE_RATE}/{AES67_CHANNELS}"),
        "a=ptime:1".to_string(),
        "a=mediaclk:direct=0".to_string(),
    ];
    if let Some(gmid) = &ptp.gmid {
        lines.push(format!(
            "a=ts-refclk:ptp=IEEE1588-2008:{gmid}:{}",
            ptp.domain
        ));
    }
    lines.push(String::new());
    lines.join("\r\n")
}

/// Serialize a SAP announcement for an SDP body.
pub fn sap_announce_packet(origin: Ipv4Addr, sdp: &str) -> Vec<u8> {
    sap_packet(SAP_FLAGS_ANNOUNCE, origin, sdp)
}

/// Serialize a SAP deletion for a previously announced SDP body.
pub fn sap_delete_packet(origin: Ipv4Addr, sdp: &str) -> Vec<u8> {
    sap_packet(SAP_FLAGS_DELETE, origin, sdp)
}

fn sap_packet(flags: u8, origin: Ipv4Addr, sdp: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + 16 + sdp.len());
    buf.push(flags);
    buf.push(0); // authentication length
    buf.extend_from_slice(&message_id_hash(sdp.as_bytes()).to_be_bytes());
    buf.extend_from_slice(&origin.octets());
    buf.extend_from_slice(b"application/sdp\0");
    buf.extend_from_slice(sdp.as_bytes());
    buf
}

/// 16-bit message id hash over the SDP body (CRC-16/CCITT-FALSE). Stable
/// for a given SDP so receivers can match announce and delete.
fn message_id_hash(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Announcer options; the group is configurable because deployments differ
/// (Dante Controller listens on 239.255.255.255 rather than the RFC group).
#[derive(Debug, Clone)]
pub struct SapOptions {
    pub group: SocketAddrV4,
    pub interval: Duration,
    pub jitter: Duration,
}

impl Default for SapOptions {
    fn default() -> Self {
        Self {
            group: SAP_GROUP,
            interval: SAP_INTERVAL,
            jitter: SAP_JITTER,
        }
    }
}

/// Provides the announcer with the configs of currently-Live slots.
pub type LiveSnapshot = Box<dyn Fn() -> Vec<SlotConfig> + Send>;

/// Background SAP announcer thread handle.
pub struct SapAnnouncer {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SapAnnouncer {
    pub fn spawn(snapshot: LiveSnapshot, options: SapOptions) -> Self {
        let cancel = Arc::new(AtomicBool::new(false));
        let thread_cancel = cancel.clone();
        let handle = thread::spawn(move || announce_loop(snapshot, options, thread_cancel));
        Self {
            cancel,
            handle: Some(handle),
        }
    }
}

impl Drop for SapAnnouncer {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn announce_loop(snapshot: LiveSnapshot, options: SapOptions, cancel: Arc<AtomicBool>) {
    let iface = net::pick_multicast_iface();
    let origin = iface.as_ref().map(|i| i.ip).unwrap_or(Ipv4Addr::UNSPECIFIED);
    let socket = match net::create_sap_socket(iface.map(|i| i.ip)) {
        Ok(socket) => socket,
        Err(e) => {
            warn!(error = %e, "sap socket setup failed, announcements disabled");
            return;
        }
    };
    info!(group = %options.group, origin = %origin, "sap announcer running");

    // slot id -> last announced SDP, kept so deletions carry the same body
    // (and therefore the same message id hash) as the announcement.
    let mut announced: HashMap<u8, String> = HashMap::new();
    let mut next_announce = Instant::now();

    while !cancel.load(Ordering::SeqCst) {
        let live = snapshot();

        // Withdraw sessions that left Live since the last pass.
        let gone: Vec<u8> = announced
            .keys()
            .copied()
            .filter(|id| !live.iter().any(|cfg| cfg.slot_id == *id))
            .collect();
        for slot_id in gone {
            if let Some(sdp) = announced.remove(&slot_id) {
                let _ = socket.send_to(&sap_delete_packet(origin, &sdp), options.group);
                debug!(slot = slot_id, "sap deletion sent");
            }
        }

        if Instant::now() >= next_announce {
            let ptp = PtpClock::from_env();
            for cfg in &live {
                let sdp = build_sdp(cfg, SdpFlavor::Aes67, origin, &ptp);
                match socket.send_to(&sap_announce_packet(origin, &sdp), options.group) {
                    Ok(_) => {
                        announced.insert(cfg.slot_id, sdp);
                    }
                    Err(e) => warn!(slot = cfg.slot_id, error = %e, "sap send failed"),
                }
            }
            next_announce = Instant::now() + jittered(options.interval, options.jitter);
        }

        thread::sleep(Duration::from_millis(200));
    }

    // Graceful withdrawal on shutdown.
    for (_, sdp) in announced.drain() {
        let _ = socket.send_to(&sap_delete_packet(origin, &sdp), options.group);
    }
}

fn jittered(interval: Duration, jitter: Duration) -> Duration {
    let j = jitter.as_secs_f64();
    let offset = if j > 0.0 {
        rand::thread_rng().gen_range(-j..=j)
    } else {
        0.0
    };
    Duration::from_secs_f64((interval.as_secs_f64() + offset).max(0.2))
}
