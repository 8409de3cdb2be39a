//! NDI to AES67 bridge core.
//!
//! Bridges up to four NDI audio sources onto AES67 RTP multicast flows:
//! - Input: NDI audio frames (48kHz, stereo, 32-bit float)
//! - Output: L24 RTP at a 1 ms packet cadence, plus an L16 monitor flow,
//!   announced via SAP/SDP for AES67/Dante receivers
//!
//! The HTTP control surface, web UI and OS networking are collaborators;
//! they drive the [`SlotManager`] and nothing else.

pub mod config;
pub mod error;
pub mod manager;
pub mod net;
pub mod pipeline;
pub mod sap;
pub mod source;

pub use config::{SlotConfig, SystemConfig, MONITOR_PORT_OFFSET, SLOT_COUNT};
pub use error::{ConfigError, SourceError};
pub use manager::{BridgeOptions, BridgeStatus, SlotManager};
pub use pipeline::chunker::AudioChunk;
pub use pipeline::{EngineTuning, SlotEngine, SlotState, SlotStatus};
pub use sap::{PtpClock, SapOptions, SdpFlavor};
pub use source::{FrameSource, SampleLayout, SourceFrame, SourceSystem};

/// AES67 audio format: 48 kHz, stereo, linear PCM.
pub const AES67_SAMPLE_RATE: u32 = 48_000;
pub const AES67_CHANNELS: u16 = 2;

/// Frames per RTP packet: 1 ms at 48 kHz.
pub const FRAMES_PER_PACKET: usize = 48;

/// Interleaved samples per chunk (both channels).
pub const SAMPLES_PER_CHUNK: usize = FRAMES_PER_PACKET * 2;
