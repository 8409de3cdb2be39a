//! Shared test harness: scripted frame sources standing in for NDI, and
//! UDP helpers for watching the bridge's flows on loopback.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::UdpSocket;
use std::sync::Mutex;
use std::time::Duration;

use ndi_aes67_bridge::error::SourceError;
use ndi_aes67_bridge::{FrameSource, SourceFrame, SourceSystem};

/// What a scripted source does once its queued frames run out.
pub enum Tail {
    /// Behave like a quiet but connected source: time out forever.
    Silent,
    /// Keep yielding clones of one frame, loosely paced, forever.
    Repeat(SourceFrame),
    /// Fail terminally, as a receiver whose source vanished would.
    Disconnect,
}

pub struct ScriptedSource {
    frames: VecDeque<SourceFrame>,
    tail: Tail,
    pace: Duration,
}

impl ScriptedSource {
    pub fn new(frames: Vec<SourceFrame>, tail: Tail) -> Self {
        Self::paced(frames, Duration::ZERO, tail)
    }

    /// Like `new`, but each queued frame is delayed by `pace` to mimic a
    /// real-time source.
    pub fn paced(frames: Vec<SourceFrame>, pace: Duration, tail: Tail) -> Self {
        Self {
            frames: frames.into(),
            tail,
            pace,
        }
    }

    /// A source that connects but never produces audio.
    pub fn never() -> Self {
        Self::new(Vec::new(), Tail::Silent)
    }
}

impl FrameSource for ScriptedSource {
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<SourceFrame>, SourceError> {
        if let Some(frame) = self.frames.pop_front() {
            if !self.pace.is_zero() {
                std::thread::sleep(self.pace);
            }
            return Ok(Some(frame));
        }
        match &self.tail {
            Tail::Silent => {
                std::thread::sleep(timeout);
                Ok(None)
            }
            Tail::Repeat(frame) => {
                std::thread::sleep(Duration::from_millis(1));
                Ok(Some(frame.clone()))
            }
            Tail::Disconnect => Err(SourceError::Disconnected),
        }
    }
}

/// Source system whose "network" is a map of scripted sources. Each `open`
/// consumes the next script queued under that name.
#[derive(Default)]
pub struct ScriptedSystem {
    scripts: Mutex<HashMap<String, VecDeque<ScriptedSource>>>,
}

impl ScriptedSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, name: &str, source: ScriptedSource) {
        self.scripts
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .push_back(source);
    }
}

impl SourceSystem for ScriptedSystem {
    fn list_sources(&self) -> Vec<String> {
        let mut names: Vec<String> = self.scripts.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    fn refresh_sources(&self) -> Vec<String> {
        self.list_sources()
    }

    fn open(
        &self,
        name: &str,
        _deadline: Duration,
    ) -> Result<Box<dyn FrameSource>, SourceError> {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(name).and_then(VecDeque::pop_front) {
            Some(source) => Ok(Box::new(source)),
            None => Err(SourceError::NotFound(name.to_string())),
        }
    }
}

/// A constant-value interleaved stereo frame at 48 kHz.
pub fn tone_frame(samples_per_channel: usize, value: f32) -> SourceFrame {
    SourceFrame::interleaved(48_000, 2, vec![value; samples_per_channel * 2])
}

/// `count` frames of `samples_per_channel` stereo frames each.
pub fn tone_frames(count: usize, samples_per_channel: usize) -> Vec<SourceFrame> {
    (0..count).map(|_| tone_frame(samples_per_channel, 0.25)).collect()
}

/// Bind listeners for a slot's AES67 and monitor flows on loopback.
/// Returns (aes67 socket, monitor socket, base port).
pub fn bind_flow_pair() -> (UdpSocket, UdpSocket, u16) {
    for _ in 0..64 {
        let base = 20_000 + (rand::random::<u16>() % 20_000) * 2;
        let aes67 = match UdpSocket::bind(("127.0.0.1", base)) {
            Ok(s) => s,
            Err(_) => continue,
        };
        let monitor = match UdpSocket::bind(("127.0.0.1", base + 2)) {
            Ok(s) => s,
            Err(_) => continue,
        };
        for s in [&aes67, &monitor] {
            s.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        }
        return (aes67, monitor, base);
    }
    panic!("no free loopback port pair");
}

/// Receive datagrams until the socket stays quiet for its read timeout.
pub fn drain_packets(socket: &UdpSocket) -> Vec<Vec<u8>> {
    let mut packets = Vec::new();
    let mut buf = [0u8; 2048];
    while let Ok((n, _)) = socket.recv_from(&mut buf) {
        packets.push(buf[..n].to_vec());
    }
    packets
}

pub fn rtp_seq(packet: &[u8]) -> u16 {
    u16::from_be_bytes([packet[2], packet[3]])
}

pub fn rtp_timestamp(packet: &[u8]) -> u32 {
    u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]])
}

pub fn rtp_ssrc(packet: &[u8]) -> u32 {
    u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]])
}

pub fn rtp_payload_type(packet: &[u8]) -> u8 {
    packet[1] & 0x7F
}
