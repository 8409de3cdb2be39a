//! Per-slot pipeline: ingestion worker, state machine and counters.
//!
//! One dedicated thread per slot runs ingest -> format gate -> repack ->
//! packetize -> send. No mutex sits in the audio path; the control side
//! reads state through a small lock and counters through atomics.

pub mod chunker;
pub mod rtp;

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::SlotConfig;
use crate::error::SourceError;
use crate::net;
use crate::source::{FrameSource, SourceSystem};
use chunker::{FormatGate, FrameChunker};
use rtp::{PcmEncoding, RtpPacketBuilder};

/// Slot lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SlotState {
    Idle,
    Starting,
    Live,
    Stopping,
    Failed,
}

/// Snapshot of a slot's state and counters.
#[derive(Debug, Clone, Serialize)]
pub struct SlotStatus {
    pub state: SlotState,
    /// Diagnostic message; empty while Live.
    pub message: String,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub last_send_unix_ns: u64,
    pub frames_received: u64,
    pub underruns: u64,
    pub param_mismatch_count: u64,
    pub send_errors: u64,
}

impl SlotStatus {
    pub fn idle() -> Self {
        Self {
            state: SlotState::Idle,
            message: String::new(),
            packets_sent: 0,
            bytes_sent: 0,
            last_send_unix_ns: 0,
            frames_received: 0,
            underruns: 0,
            param_mismatch_count: 0,
            send_errors: 0,
        }
    }
}

/// Engine timing knobs. Defaults match production behavior; tests shrink
/// them to keep the suite fast.
#[derive(Debug, Clone)]
pub struct EngineTuning {
    /// Bound on the discovery lookup when opening the frame source.
    pub source_open: Duration,
    /// Frame read timeout; also how promptly cancellation is observed.
    pub frame_read: Duration,
    /// Start-to-Live watchdog.
    pub start_watchdog: Duration,
    /// How long `stop()` waits for the worker before abandoning it.
    pub stop_grace: Duration,
    /// Consecutive send failures beyond this fail the slot.
    pub max_consecutive_send_errors: u32,
}

impl Default for EngineTuning {
    fn default() -> Self {
        Self {
            source_open: Duration::from_secs(1),
            frame_read: Duration::from_secs(1),
            start_watchdog: Duration::from_secs(5),
            stop_grace: Duration::from_secs(2),
            max_consecutive_send_errors: 100,
        }
    }
}

/// Counters tracked with atomics (no locking in the audio path).
#[derive(Default)]
struct Counters {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    last_send_unix_ns: AtomicU64,
    frames_received: AtomicU64,
    underruns: AtomicU64,
    param_mismatch_count: AtomicU64,
    send_errors: AtomicU64,
}

struct EngineShared {
    cancel: AtomicBool,
    status: Mutex<(SlotState, String)>,
    counters: Counters,
}

impl EngineShared {
    fn new(state: SlotState) -> Self {
        Self {
            cancel: AtomicBool::new(false),
            status: Mutex::new((state, String::new())),
            counters: Counters::default(),
        }
    }

    fn set_state(&self, state: SlotState, message: &str) {
        let mut guard = self.status.lock();
        *guard = (state, message.to_string());
    }

    fn state(&self) -> SlotState {
        self.status.lock().0
    }
}

/// One running (or failed) slot pipeline.
///
/// Created by `start`, torn down by `stop` or drop. The slot manager keeps
/// at most one engine per slot id alive at a time.
pub struct SlotEngine {
    slot_id: u8,
    shared: Arc<EngineShared>,
    worker: Option<JoinHandle<()>>,
    stop_grace: Duration,
}

impl SlotEngine {
    /// Open the frame source and both flow sockets, seed the RTP counters,
    /// and spawn the ingestion worker. Startup errors yield an engine
    /// already in `Failed`; the watchdog covers everything after spawn.
    pub fn start(
        cfg: &SlotConfig,
        system: &dyn SourceSystem,
        iface: Option<Ipv4Addr>,
        tuning: &EngineTuning,
    ) -> SlotEngine {
        let started_at = Instant::now();
        let shared = Arc::new(EngineShared::new(SlotState::Starting));
        info!(slot = cfg.slot_id, source = ?cfg.ndi_source_name, "slot starting");

        let Some(source_name) = cfg.ndi_source_name.as_deref() else {
            return Self::failed_with(cfg.slot_id, shared, tuning, "source not found");
        };

        let source = match system.open(source_name, tuning.source_open) {
            Ok(source) => source,
            Err(SourceError::NotFound(name)) => {
                return Self::failed_with(
                    cfg.slot_id,
                    shared,
                    tuning,
                    &format!("source not found: {name}"),
                );
            }
            Err(e) => {
                return Self::failed_with(cfg.slot_id, shared, tuning, &e.to_string());
            }
        };

        let flows = match Self::open_flows(cfg, iface) {
            Ok(flows) => flows,
            Err(e) => {
                return Self::failed_with(
                    cfg.slot_id,
                    shared,
                    tuning,
                    &format!("socket bind failed: {e}"),
                );
            }
        };

        let worker_shared = shared.clone();
        let worker_tuning = tuning.clone();
        let slot_id = cfg.slot_id;
        let worker = thread::spawn(move || {
            run_worker(slot_id, worker_shared, source, flows, worker_tuning, started_at);
        });

        SlotEngine {
            slot_id: cfg.slot_id,
            shared,
            worker: Some(worker),
            stop_grace: tuning.stop_grace,
        }
    }

    /// An engine that failed before its worker could exist (e.g. the
    /// configured outbound interface is missing).
    pub fn failed(slot_id: u8, message: &str) -> SlotEngine {
        Self::failed_with(
            slot_id,
            Arc::new(EngineShared::new(SlotState::Starting)),
            &EngineTuning::default(),
            message,
        )
    }

    fn failed_with(
        slot_id: u8,
        shared: Arc<EngineShared>,
        tuning: &EngineTuning,
        message: &str,
    ) -> SlotEngine {
        warn!(slot = slot_id, error = message, "slot failed to start");
        shared.set_state(SlotState::Failed, message);
        SlotEngine {
            slot_id,
            shared,
            worker: None,
            stop_grace: tuning.stop_grace,
        }
    }

    fn open_flows(cfg: &SlotConfig, iface: Option<Ipv4Addr>) -> std::io::Result<Vec<Flow>> {
        let aes67 = Flow {
            socket: net::create_rtp_socket(iface)?,
            dest: SocketAddrV4::new(cfg.mcast_ip, cfg.mcast_port),
            builder: RtpPacketBuilder::seeded(PcmEncoding::L24, cfg.ssrc),
        };
        let monitor = Flow {
            socket: net::create_rtp_socket(iface)?,
            dest: SocketAddrV4::new(cfg.mcast_ip, cfg.monitor_port()),
            builder: RtpPacketBuilder::seeded(PcmEncoding::L16, cfg.ssrc),
        };
        Ok(vec![aes67, monitor])
    }

    pub fn slot_id(&self) -> u8 {
        self.slot_id
    }

    pub fn state(&self) -> SlotState {
        self.shared.state()
    }

    pub fn is_idle(&self) -> bool {
        self.state() == SlotState::Idle
    }

    /// Lock-light snapshot of state plus counters.
    pub fn status(&self) -> SlotStatus {
        let (state, message) = self.shared.status.lock().clone();
        let c = &self.shared.counters;
        SlotStatus {
            state,
            message,
            packets_sent: c.packets_sent.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            last_send_unix_ns: c.last_send_unix_ns.load(Ordering::Relaxed),
            frames_received: c.frames_received.load(Ordering::Relaxed),
            underruns: c.underruns.load(Ordering::Relaxed),
            param_mismatch_count: c.param_mismatch_count.load(Ordering::Relaxed),
            send_errors: c.send_errors.load(Ordering::Relaxed),
        }
    }

    /// Stop the pipeline and return once the slot is Idle.
    ///
    /// Signals the worker, waits up to the stop grace for it to exit, then
    /// abandons the handle; the worker observes the cancel flag within one
    /// frame-read timeout and drops its sockets on the way out. Idempotent
    /// from any state.
    pub fn stop(&mut self) {
        if self.state() == SlotState::Idle {
            return;
        }
        self.shared.set_state(SlotState::Stopping, "");
        self.shared.cancel.store(true, Ordering::SeqCst);

        if let Some(handle) = self.worker.take() {
            let deadline = Instant::now() + self.stop_grace;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!(slot = self.slot_id, "worker did not exit within grace, abandoning");
            }
        }

        self.shared.set_state(SlotState::Idle, "");
        info!(slot = self.slot_id, "slot stopped");
    }
}

impl Drop for SlotEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One RTP flow: a send socket, its destination and its packet builder.
struct Flow {
    socket: UdpSocket,
    dest: SocketAddrV4,
    builder: RtpPacketBuilder,
}

fn unix_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Ingestion worker: the only thread touching this slot's source, chunker
/// and sockets. Pacing is governed by frame arrival, not a timer.
fn run_worker(
    slot_id: u8,
    shared: Arc<EngineShared>,
    mut source: Box<dyn FrameSource>,
    mut flows: Vec<Flow>,
    tuning: EngineTuning,
    started_at: Instant,
) {
    let mut gate = FormatGate::default();
    let mut chunker = FrameChunker::new();
    let mut live = false;
    let mut consecutive_send_errors: u32 = 0;
    let counters = &shared.counters;

    let fail = |message: &str| {
        // A cancelled worker is being stopped; don't fight stop() over the
        // final state.
        if shared.cancel.load(Ordering::SeqCst) {
            return;
        }
        warn!(slot = slot_id, error = message, "slot failed");
        shared.set_state(SlotState::Failed, message);
    };

    loop {
        if shared.cancel.load(Ordering::SeqCst) {
            return;
        }
        if !live && started_at.elapsed() > tuning.start_watchdog {
            fail("receiver did not connect");
            return;
        }

        let frame = match source.next_frame(tuning.frame_read) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                // Timeout. While live this is missing audio; while starting
                // the watchdog above decides.
                if live {
                    counters.underruns.fetch_add(1, Ordering::Relaxed);
                }
                continue;
            }
            Err(e) => {
                debug!(slot = slot_id, error = %e, "frame source terminated");
                fail("source disconnected");
                return;
            }
        };

        counters.frames_received.fetch_add(1, Ordering::Relaxed);
        if let Err(message) = gate.check(&frame) {
            counters.param_mismatch_count.fetch_add(1, Ordering::Relaxed);
            fail(&message);
            return;
        }

        chunker.push(&frame);
        while let Some(chunk) = chunker.next_chunk() {
            for flow in flows.iter_mut() {
                let packet = flow.builder.build_packet(&chunk);
                match flow.socket.send_to(packet, flow.dest) {
                    Ok(n) => {
                        counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                        counters.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                        counters.last_send_unix_ns.store(unix_ns(), Ordering::Relaxed);
                        consecutive_send_errors = 0;
                        if !live && !shared.cancel.load(Ordering::SeqCst) {
                            live = true;
                            shared.set_state(SlotState::Live, "");
                            info!(slot = slot_id, "slot live");
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        // Send buffer full: drop the packet, RTP never
                        // retransmits.
                        counters.send_errors.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        counters.send_errors.fetch_add(1, Ordering::Relaxed);
                        consecutive_send_errors += 1;
                        debug!(slot = slot_id, error = %e, "packet send failed");
                        if consecutive_send_errors > tuning.max_consecutive_send_errors {
                            fail("excessive send errors");
                            return;
                        }
                    }
                }
            }
        }
    }
}
