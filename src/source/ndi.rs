//! NDI-backed frame source built on grafton-ndi.
//!
//! The receiver keeps an owned copy of the source name (and the `Source`
//! it was opened from) alive for its whole life. The underlying SDK holds
//! pointers into the source description; freeing that storage while the
//! receiver exists is a known crash class.

use std::time::Duration;

use grafton_ndi::{
    Finder, FinderOptions, Receiver, ReceiverBandwidth, ReceiverOptions, Source, NDI,
};
use tracing::debug;

use crate::error::SourceError;
use crate::source::{FrameSource, SampleLayout, SourceFrame, SourceSystem};

/// Shared NDI runtime handle used for discovery and receiver creation.
pub struct NdiSourceSystem {
    ndi: NDI,
}

impl NdiSourceSystem {
    pub fn new() -> Result<Self, SourceError> {
        let ndi = NDI::new().map_err(|e| SourceError::Init(e.to_string()))?;
        Ok(Self { ndi })
    }

    fn discover(&self, wait_ms: u32) -> Result<Vec<Source>, SourceError> {
        let options = FinderOptions::builder().show_local_sources(true).build();
        let finder =
            Finder::new(&self.ndi, &options).map_err(|e| SourceError::Init(e.to_string()))?;
        finder.wait_for_sources(wait_ms);
        finder
            .get_sources(0)
            .map_err(|e| SourceError::Init(e.to_string()))
    }

    fn sources_sorted(&self, wait_ms: u32) -> Vec<String> {
        let mut names: Vec<String> = self
            .discover(wait_ms)
            .map(|sources| sources.into_iter().map(|s| s.name).collect())
            .unwrap_or_default();
        names.sort();
        names.dedup();
        names
    }
}

impl SourceSystem for NdiSourceSystem {
    fn list_sources(&self) -> Vec<String> {
        self.sources_sorted(250)
    }

    fn refresh_sources(&self) -> Vec<String> {
        self.sources_sorted(1000)
    }

    fn open(&self, name: &str, deadline: Duration) -> Result<Box<dyn FrameSource>, SourceError> {
        let wait_ms = deadline.as_millis().min(u32::MAX as u128) as u32;
        let sources = self.discover(wait_ms)?;
        let source = sources
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| SourceError::NotFound(name.to_string()))?;

        // The builder copies the source description; `source_name` below
        // keeps our own copy for diagnostics and for the receiver label.
        let source_name = name.to_string();
        let receiver = ReceiverOptions::builder(source)
            .bandwidth(ReceiverBandwidth::AudioOnly)
            .name(format!("aes67-bridge-{source_name}"))
            .build(&self.ndi)
            .map_err(|e| SourceError::Init(e.to_string()))?;

        debug!(source = %source_name, "ndi receiver created");
        Ok(Box::new(NdiFrameSource {
            receiver,
            source_name,
        }))
    }
}

/// One connected NDI audio receiver.
pub struct NdiFrameSource {
    receiver: Receiver,
    #[allow(dead_code)]
    source_name: String,
}

impl FrameSource for NdiFrameSource {
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<SourceFrame>, SourceError> {
        let timeout_ms = timeout.as_millis().min(u32::MAX as u128) as u32;
        let frame = self
            .receiver
            .capture_audio(timeout_ms)
            .map_err(|e| SourceError::Terminal(e.to_string()))?;

        let Some(frame) = frame else {
            return Ok(None);
        };

        let channels = frame.num_channels.max(0) as u16;
        let samples_per_channel = frame.num_samples.max(0) as usize;
        if channels == 0 || samples_per_channel == 0 {
            // Empty frames happen around connection churn; skip them.
            return Ok(None);
        }

        // NDI delivers planar f32 with a per-channel row stride; copy each
        // channel out so downstream sees a dense channel-major buffer.
        let mut data = Vec::with_capacity(channels as usize * samples_per_channel);
        for ch in 0..channels as usize {
            match frame.channel_data(ch) {
                Some(channel) if channel.len() >= samples_per_channel => {
                    data.extend_from_slice(&channel[..samples_per_channel]);
                }
                _ => return Ok(None),
            }
        }

        Ok(Some(SourceFrame {
            sample_rate: frame.sample_rate.max(0) as u32,
            channels,
            samples_per_channel,
            layout: SampleLayout::Planar,
            data,
        }))
    }
}
