//! Frame source seam: the contract between the bridge and whatever feeds it
//! audio. The production implementation wraps the NDI receiver (see
//! [`ndi`], feature-gated); tests substitute scripted sources.

use std::time::Duration;

use crate::error::SourceError;

#[cfg(feature = "ndi")]
pub mod ndi;

/// Sample ordering inside [`SourceFrame::data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleLayout {
    /// Frame-major: `[l0, r0, l1, r1, ..]`.
    Interleaved,
    /// Channel-major with a stride of `samples_per_channel`:
    /// `[l0, l1, .., r0, r1, ..]`. Any SDK row stride has been stripped.
    Planar,
}

/// One audio frame as delivered by a source adapter.
///
/// The buffer is an owned copy; dropping the frame never touches adapter
/// internals.
#[derive(Debug, Clone)]
pub struct SourceFrame {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples_per_channel: usize,
    pub layout: SampleLayout,
    pub data: Vec<f32>,
}

impl SourceFrame {
    /// Build an interleaved frame. `data.len()` must be a whole number of
    /// frames of `channels` samples.
    pub fn interleaved(sample_rate: u32, channels: u16, data: Vec<f32>) -> Self {
        debug_assert_eq!(data.len() % channels.max(1) as usize, 0);
        let samples_per_channel = data.len() / channels.max(1) as usize;
        Self {
            sample_rate,
            channels,
            samples_per_channel,
            layout: SampleLayout::Interleaved,
            data,
        }
    }

    /// Build a channel-major frame with stride `samples_per_channel`.
    pub fn planar(sample_rate: u32, channels: u16, data: Vec<f32>) -> Self {
        debug_assert_eq!(data.len() % channels.max(1) as usize, 0);
        let samples_per_channel = data.len() / channels.max(1) as usize;
        Self {
            sample_rate,
            channels,
            samples_per_channel,
            layout: SampleLayout::Planar,
            data,
        }
    }
}

/// A connected receiver yielding audio frames.
///
/// `Ok(None)` is the timeout sentinel - nothing arrived within `timeout`,
/// call again. `Err` is terminal: the slot engine treats it as source lost.
pub trait FrameSource: Send {
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<SourceFrame>, SourceError>;
}

/// Discovery plus receiver construction.
///
/// One instance is shared by the slot manager and injected into every slot
/// engine; implementations must be safe to call from the control threads
/// and the per-slot workers concurrently.
pub trait SourceSystem: Send + Sync {
    /// Names of currently known sources.
    fn list_sources(&self) -> Vec<String>;

    /// Re-run discovery, then list.
    fn refresh_sources(&self) -> Vec<String>;

    /// Establish a receiver for a named source. `deadline` bounds the
    /// discovery lookup, not frame arrival - the engine's start watchdog
    /// covers that.
    fn open(&self, name: &str, deadline: Duration) -> Result<Box<dyn FrameSource>, SourceError>;
}
