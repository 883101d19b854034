use crate::adapter::{AudioFormat, OutputSite, SinkError};
use hound::{SampleFormat, WavSpec, WavWriter};
use log::{debug, info};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

/// Collects PCM in memory, optionally simulating a host abort after `abort_after` bytes
#[derive(Debug, Default)]
pub struct MemorySite {
    pub pcm: Vec<u8>,
    pub abort_after: Option<usize>,
}

impl MemorySite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort_after(bytes: usize) -> Self {
        Self {
            pcm: Vec::new(),
            abort_after: Some(bytes),
        }
    }
}

impl OutputSite for MemorySite {
    fn write(&mut self, pcm: &[u8]) -> Result<usize, SinkError> {
        self.pcm.extend_from_slice(pcm);
        Ok(pcm.len())
    }

    fn abort_requested(&self) -> bool {
        self.abort_after
            .is_some_and(|limit| self.pcm.len() >= limit)
    }
}

/// Writes 16-bit PCM chunks into a WAV file
pub struct WavFileSite {
    writer: Option<WavWriter<BufWriter<File>>>,
    path: PathBuf,
    // Odd trailing byte from a chunk that split a sample
    carry: Option<u8>,
    samples: u64,
}

impl WavFileSite {
    pub fn create(path: impl AsRef<Path>, format: AudioFormat) -> Result<Self, SinkError> {
        let spec = WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample: format.bits_per_sample,
            sample_format: SampleFormat::Int,
        };

        let path = path.as_ref().to_path_buf();
        let writer = WavWriter::create(&path, spec)
            .map_err(|e| SinkError::Failed(format!("failed to create {}: {}", path.display(), e)))?;

        debug!("📁 Writing audio to {}", path.display());
        Ok(Self {
            writer: Some(writer),
            path,
            carry: None,
            samples: 0,
        })
    }

    pub fn samples_written(&self) -> u64 {
        self.samples
    }

    /// Flush the header and close the file
    pub fn finalize(mut self) -> Result<u64, SinkError> {
        if let Some(writer) = self.writer.take() {
            writer
                .finalize()
                .map_err(|e| SinkError::Failed(e.to_string()))?;
        }
        if self.carry.is_some() {
            log::warn!("⚠️ Dropping trailing half sample in {}", self.path.display());
        }
        info!(
            "💾 Saved {} samples to {}",
            self.samples,
            self.path.display()
        );
        Ok(self.samples)
    }
}

impl OutputSite for WavFileSite {
    fn write(&mut self, pcm: &[u8]) -> Result<usize, SinkError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| SinkError::Failed("WAV file already finalized".into()))?;

        let mut bytes = pcm;
        if let Some(low) = self.carry.take() {
            if let Some((&high, rest)) = bytes.split_first() {
                writer
                    .write_sample(i16::from_le_bytes([low, high]))
                    .map_err(|e| SinkError::Failed(e.to_string()))?;
                self.samples += 1;
                bytes = rest;
            } else {
                self.carry = Some(low);
            }
        }

        let mut pairs = bytes.chunks_exact(2);
        for pair in &mut pairs {
            writer
                .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                .map_err(|e| SinkError::Failed(e.to_string()))?;
            self.samples += 1;
        }
        if let [odd] = pairs.remainder() {
            self.carry = Some(*odd);
        }

        Ok(pcm.len())
    }

    fn abort_requested(&self) -> bool {
        false
    }
}
