//! Host-facing speech engine.
//!
//! The host (a speech platform plugin, the CLI, a test) talks to the bridge
//! only through [`SpeechEngine`]: configure a voice, ask for the output format,
//! and speak a list of text fragments into an [`OutputSite`].

use crate::error::{Result, SpeakError};
use bridge_protocol::{
    BridgeClient, CancellationToken, ClientConfig, StreamEnd, Transport, VoiceId,
};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

pub const SAMPLE_RATE: u32 = 24000;
pub const BITS_PER_SAMPLE: u16 = 16;
pub const NUM_CHANNELS: u16 = 1;

/// Attribute key holding the voice id in a host voice profile
pub const VOICE_ID_ATTRIBUTE: &str = "VoiceId";

/// PCM format declared to the host before any audio is written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub channels: u16,
}

impl AudioFormat {
    pub fn block_align(&self) -> u16 {
        self.channels * self.bits_per_sample / 8
    }

    pub fn avg_bytes_per_sec(&self) -> u32 {
        self.sample_rate * u32::from(self.block_align())
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            bits_per_sample: BITS_PER_SAMPLE,
            channels: NUM_CHANNELS,
        }
    }
}

/// What the host wants done with a fragment of text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentAction {
    Speak,
    Silence,
    SpellOut,
    Pronounce,
    Bookmark,
    Section,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextFragment {
    pub action: FragmentAction,
    pub text: String,
}

impl TextFragment {
    pub fn speak(text: impl Into<String>) -> Self {
        Self {
            action: FragmentAction::Speak,
            text: text.into(),
        }
    }

    pub fn silence() -> Self {
        Self {
            action: FragmentAction::Silence,
            text: String::new(),
        }
    }
}

/// Voice selection handed over by the host (e.g. a registry voice token)
#[derive(Debug, Clone, Default)]
pub struct VoiceProfile {
    pub name: String,
    pub attributes: HashMap<String, String>,
}

impl VoiceProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_voice_id(mut self, voice_id: impl Into<String>) -> Self {
        self.attributes
            .insert(VOICE_ID_ATTRIBUTE.to_string(), voice_id.into());
        self
    }

    pub fn voice_id(&self) -> Option<&str> {
        self.attributes.get(VOICE_ID_ATTRIBUTE).map(String::as_str)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The host stopped audio output; treat like an abort
    #[error("Audio output stopped by host")]
    Stopped,

    #[error("Audio output failed: {0}")]
    Failed(String),
}

/// Host audio output for one speak call
pub trait OutputSite {
    /// Write PCM in the declared format, returning how many bytes were accepted
    fn write(&mut self, pcm: &[u8]) -> std::result::Result<usize, SinkError>;

    /// Whether the host has asked to stop speaking
    fn abort_requested(&self) -> bool;
}

/// Result of a speak call that did not fail
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SpeakReport {
    pub bytes_written: u64,
    pub chunks: u32,
    /// The host aborted; only audio delivered before the abort was written
    pub aborted: bool,
}

/// Narrow entry points a speech host drives
pub trait SpeechEngine {
    fn configure(&mut self, profile: &VoiceProfile) -> Result<()>;

    fn output_format(&self) -> AudioFormat;

    fn speak(&mut self, fragments: &[TextFragment], site: &mut dyn OutputSite)
        -> Result<SpeakReport>;
}

/// Join the text of every speakable fragment, skipping silence and other directives
pub fn collect_speakable_text(fragments: &[TextFragment]) -> String {
    fragments
        .iter()
        .filter(|f| f.action == FragmentAction::Speak && !f.text.is_empty())
        .map(|f| f.text.as_str())
        .collect()
}

/// Speech engine that streams audio from the model server over the bridge
pub struct BridgeEngine<C> {
    connect: C,
    client_config: ClientConfig,
    voice_id: VoiceId,
}

impl<C, T> BridgeEngine<C>
where
    C: FnMut() -> T,
    T: Transport,
{
    /// `connect` builds a fresh, unconnected transport for every request
    pub fn new(connect: C, client_config: ClientConfig) -> Self {
        Self {
            connect,
            client_config,
            voice_id: VoiceId::default(),
        }
    }

    pub fn voice_id(&self) -> &VoiceId {
        &self.voice_id
    }
}

impl<C, T> SpeechEngine for BridgeEngine<C>
where
    C: FnMut() -> T,
    T: Transport,
{
    fn configure(&mut self, profile: &VoiceProfile) -> Result<()> {
        let voice = profile.voice_id().unwrap_or_default();
        self.voice_id =
            VoiceId::new(voice).map_err(|e| SpeakError::InvalidArgument(e.to_string()))?;

        info!(
            "🗣️ Configured voice profile '{}' (voice id '{}')",
            profile.name, self.voice_id
        );
        Ok(())
    }

    fn output_format(&self) -> AudioFormat {
        AudioFormat::default()
    }

    fn speak(
        &mut self,
        fragments: &[TextFragment],
        site: &mut dyn OutputSite,
    ) -> Result<SpeakReport> {
        let text = collect_speakable_text(fragments);
        if text.is_empty() {
            debug!("Nothing to speak in {} fragments", fragments.len());
            return Ok(SpeakReport::default());
        }

        let cancel = CancellationToken::new();
        let mut client = BridgeClient::with_config((self.connect)(), self.client_config.clone());
        let mut report = SpeakReport::default();
        let mut sink_error = None;

        let result = client.stream_synthesis(
            &text,
            &self.voice_id,
            |chunk| {
                if cancel.is_cancelled() {
                    return;
                }
                if site.abort_requested() {
                    debug!("🛑 Host requested abort");
                    cancel.cancel();
                    return;
                }
                match site.write(chunk) {
                    Ok(written) => {
                        report.bytes_written += written as u64;
                        report.chunks += 1;
                    }
                    Err(SinkError::Stopped) => {
                        debug!("🛑 Host audio stopped");
                        cancel.cancel();
                    }
                    Err(SinkError::Failed(reason)) => {
                        sink_error = Some(reason);
                        cancel.cancel();
                    }
                }
            },
            &cancel,
        );

        if let Some(reason) = sink_error {
            warn!("❌ Audio sink failed after {} bytes: {}", report.bytes_written, reason);
            return Err(SpeakError::Sink(reason));
        }

        match result {
            Ok(summary) => {
                report.aborted = summary.end == StreamEnd::Cancelled;
                info!(
                    "🔊 Spoke {} bytes in {} chunks{}",
                    report.bytes_written,
                    report.chunks,
                    if report.aborted { " (aborted)" } else { "" }
                );
                Ok(report)
            }
            Err(e) => {
                warn!("❌ Speak failed after {} bytes: {}", report.bytes_written, e);
                Err(e.into())
            }
        }
    }
}
