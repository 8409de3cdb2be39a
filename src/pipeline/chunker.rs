//! Format gate and repacker: turns arbitrarily sized source frames into
//! exact 48-frame interleaved stereo chunks.

use crate::source::{SampleLayout, SourceFrame};
use crate::{AES67_CHANNELS, AES67_SAMPLE_RATE, SAMPLES_PER_CHUNK};

/// One millisecond of interleaved stereo audio at 48 kHz: the unit both
/// packetizers consume.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    samples: [f32; SAMPLES_PER_CHUNK],
}

impl AudioChunk {
    pub fn from_samples(samples: [f32; SAMPLES_PER_CHUNK]) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }
}

/// Validates stream parameters against the fixed bridge target.
///
/// Checked on the first frame and re-checked whenever parameters change;
/// there is no automatic conversion.
#[derive(Debug, Default)]
pub struct FormatGate {
    seen: Option<(u32, u16)>,
}

impl FormatGate {
    /// Accept or reject a frame's parameters. The error string is the
    /// slot's failure message.
    pub fn check(&mut self, frame: &SourceFrame) -> Result<(), String> {
        let params = (frame.sample_rate, frame.channels);
        if self.seen == Some(params) {
            return Ok(());
        }
        self.seen = Some(params);
        if frame.sample_rate != AES67_SAMPLE_RATE || frame.channels != AES67_CHANNELS {
            return Err(format!(
                "unsupported format: {}Hz/{}ch",
                frame.sample_rate, frame.channels
            ));
        }
        Ok(())
    }
}

/// Repacker holding the residual between frame boundaries.
///
/// Residual length stays below one chunk (96 interleaved samples) between
/// frames; it is discarded on pipeline stop by dropping the chunker.
#[derive(Debug, Default)]
pub struct FrameChunker {
    residual: Vec<f32>,
}

impl FrameChunker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a validated frame, converting planar data to interleaved.
    pub fn push(&mut self, frame: &SourceFrame) {
        let channels = frame.channels as usize;
        let spc = frame.samples_per_channel;
        self.residual.reserve(spc * channels);
        match frame.layout {
            SampleLayout::Interleaved => {
                self.residual.extend_from_slice(&frame.data[..spc * channels]);
            }
            SampleLayout::Planar => {
                for i in 0..spc {
                    for ch in 0..channels {
                        self.residual.push(frame.data[ch * spc + i]);
                    }
                }
            }
        }
    }

    /// Detach the next full chunk, if one is buffered.
    pub fn next_chunk(&mut self) -> Option<AudioChunk> {
        if self.residual.len() < SAMPLES_PER_CHUNK {
            return None;
        }
        let mut samples = [0.0f32; SAMPLES_PER_CHUNK];
        samples.copy_from_slice(&self.residual[..SAMPLES_PER_CHUNK]);
        self.residual.drain(..SAMPLES_PER_CHUNK);
        Some(AudioChunk { samples })
    }

    /// Interleaved samples currently buffered (always < 96 after draining).
    pub fn residual_len(&self) -> usize {
        self.residual.len()
    }
}
