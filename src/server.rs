//! Reference implementation of the model server side of the bridge.
//!
//! Serves one connection at a time: read a request, stream chunk frames from a
//! [`Synthesizer`], then finish with end-of-stream or an error frame. Used by the
//! `mock_tts_server` binary and by the integration tests.

use bridge_protocol::protocol::{encode_chunk, encode_end_of_stream};
use bridge_protocol::transport::write_full;
use bridge_protocol::{
    Endpoint, ErrorCode, ErrorFrame, RequestFlags, RequestReadError, SynthesisRequest,
    TransportError, MAX_CHUNK_SIZE,
};
use log::{debug, error, info, warn};
use std::f32::consts::PI;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};

use crate::adapter::SAMPLE_RATE;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Endpoint {0} cannot be served by this server")]
    UnsupportedEndpoint(String),
}

/// Failure inside the speech model
#[derive(Error, Debug)]
#[error("{0}")]
pub struct SynthesisError(pub String);

/// Error raised while handing audio to the client
#[derive(Error, Debug)]
pub enum EmitError {
    #[error("Client disconnected: {0}")]
    Disconnected(#[from] TransportError),

    #[error("Synthesizer produced an invalid chunk: {0}")]
    InvalidChunk(String),
}

/// Receives PCM from the synthesizer and frames it onto the wire
pub trait AudioEmitter {
    fn emit(&mut self, pcm: &[u8]) -> Result<(), EmitError>;
}

/// The speech model behind the server
pub trait Synthesizer: Send {
    /// Voice keys in preference order; the first is the default
    fn voices(&self) -> Vec<String>;

    /// Generate 16-bit mono PCM at 24 kHz for `text`, emitting it incrementally
    fn synthesize(
        &mut self,
        text: &str,
        voice: &str,
        out: &mut dyn AudioEmitter,
    ) -> Result<(), SynthesisFailure>;
}

/// Why synthesis stopped early
#[derive(Error, Debug)]
pub enum SynthesisFailure {
    #[error(transparent)]
    Model(#[from] SynthesisError),

    #[error(transparent)]
    Emit(#[from] EmitError),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub endpoint: Endpoint,
    /// Trailing silence appended unless the request sets `NO_SILENCE_PAD`
    pub silence_pad: Duration,
    pub max_chunk_size: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::well_known(),
            silence_pad: Duration::from_millis(300),
            max_chunk_size: MAX_CHUNK_SIZE,
        }
    }
}

/// Clean up text the way the model expects it
pub fn normalize_text(text: &str) -> String {
    let mut text = text
        .trim()
        .replace("\r\n", " ")
        .replace('\n', " ")
        .replace(['\u{2018}', '\u{2019}'], "'")
        .replace(['\u{201C}', '\u{201D}'], "\"");

    if let Some(last) = text.chars().last() {
        if !".!?,:;".contains(last) {
            text.push('.');
        }
    }
    text
}

/// Match a requested voice id against the available voices.
///
/// Empty selects the default, then exact match, then case-insensitive substring.
pub fn resolve_voice(requested: &str, voices: &[String]) -> Option<String> {
    if requested.is_empty() {
        return voices.first().cloned();
    }
    if let Some(exact) = voices.iter().find(|v| v.as_str() == requested) {
        return Some(exact.clone());
    }
    let needle = requested.to_lowercase();
    voices
        .iter()
        .find(|v| v.to_lowercase().contains(&needle))
        .cloned()
}

struct FrameEmitter<'a, S: Write> {
    stream: &'a mut S,
    max_chunk_size: u32,
    chunks: u32,
}

impl<S: Write> AudioEmitter for FrameEmitter<'_, S> {
    fn emit(&mut self, pcm: &[u8]) -> Result<(), EmitError> {
        // Empty output yields no frames; a zero-length frame would end the stream
        for piece in pcm.chunks(self.max_chunk_size as usize) {
            let frame = encode_chunk(piece, self.max_chunk_size)
                .map_err(|e| EmitError::InvalidChunk(e.to_string()))?;
            write_full(&mut *self.stream, &frame)?;
            self.chunks += 1;
        }
        Ok(())
    }
}

fn send_error<S: Write>(stream: &mut S, code: ErrorCode, message: &str) {
    warn!("⚠️ Rejecting request with {}: {}", code, message);
    if let Err(e) = write_full(stream, &ErrorFrame::new(code, message).to_bytes()) {
        debug!("Could not deliver error frame: {}", e);
    }
}

/// Serve exactly one request on an accepted connection
pub fn handle_client<S, Y>(stream: &mut S, synthesizer: &mut Y, config: &ServerConfig)
where
    S: Read + Write,
    Y: Synthesizer + ?Sized,
{
    let request = match SynthesisRequest::read_from(stream) {
        Ok(request) => request,
        Err(RequestReadError::Transport(e)) => {
            debug!("🔌 Client left before sending a request: {}", e);
            return;
        }
        Err(RequestReadError::Protocol(e)) => {
            send_error(stream, ErrorCode::Unknown, &e.to_string());
            return;
        }
    };

    let preview: String = request.text.chars().take(40).collect();
    info!(
        "📥 Request: '{}'{} (voice='{}', flags=0x{:08X})",
        preview,
        if request.text.chars().count() > 40 { "..." } else { "" },
        request.voice_id,
        request.flags.0
    );

    if request.text.is_empty() {
        send_error(stream, ErrorCode::EmptyText, "Empty text length");
        return;
    }

    let text = normalize_text(&request.text);
    if text.is_empty() {
        send_error(stream, ErrorCode::EmptyText, "Text is empty after normalization");
        return;
    }

    let voices = synthesizer.voices();
    let Some(voice) = resolve_voice(request.voice_id.as_str(), &voices) else {
        send_error(
            stream,
            ErrorCode::InvalidVoice,
            &format!(
                "Voice '{}' not found. Available: {}",
                request.voice_id,
                voices.join(", ")
            ),
        );
        return;
    };

    let mut emitter = FrameEmitter {
        stream: &mut *stream,
        max_chunk_size: config.max_chunk_size,
        chunks: 0,
    };

    match synthesizer.synthesize(&text, &voice, &mut emitter) {
        Ok(()) => {}
        Err(SynthesisFailure::Emit(e)) => {
            info!("🔌 Stopped generating after {} chunks: {}", emitter.chunks, e);
            return;
        }
        Err(SynthesisFailure::Model(e)) => {
            error!("❌ Synthesis failed: {}", e);
            send_error(stream, ErrorCode::ModelError, &e.0);
            return;
        }
    }

    if !request.flags.contains(RequestFlags::NO_SILENCE_PAD) && !config.silence_pad.is_zero() {
        let samples = (SAMPLE_RATE as u128 * config.silence_pad.as_millis() / 1000) as usize;
        if let Err(e) = emitter.emit(&vec![0u8; samples * 2]) {
            info!("🔌 Client left during silence padding: {}", e);
            return;
        }
    }

    let chunks = emitter.chunks;
    if let Err(e) = write_full(stream, &encode_end_of_stream()) {
        info!("🔌 Client left before end of stream: {}", e);
        return;
    }
    info!("✅ Sent {} chunks", chunks);
}

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

enum Accepted {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Listener {
    fn bind(endpoint: &Endpoint) -> Result<(Self, Endpoint), ServerError> {
        match endpoint {
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr)?;
                let local = listener.local_addr()?;
                listener.set_nonblocking(true)?;
                Ok((Listener::Tcp(listener), Endpoint::Tcp(local)))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                let listener = UnixListener::bind(path)?;
                listener.set_nonblocking(true)?;
                Ok((Listener::Unix(listener), endpoint.clone()))
            }
            #[allow(unreachable_patterns)]
            other => Err(ServerError::UnsupportedEndpoint(other.to_string())),
        }
    }

    fn accept(&self) -> io::Result<Accepted> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept()?;
                stream.set_nonblocking(false)?;
                stream.set_nodelay(true)?;
                Ok(Accepted::Tcp(stream))
            }
            #[cfg(unix)]
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept()?;
                stream.set_nonblocking(false)?;
                Ok(Accepted::Unix(stream))
            }
        }
    }
}

/// Listens on an endpoint and serves requests sequentially
pub struct SynthesisServer<Y: Synthesizer> {
    config: ServerConfig,
    synthesizer: Y,
    should_stop: Arc<AtomicBool>,
}

impl<Y: Synthesizer + 'static> SynthesisServer<Y> {
    pub fn new(config: ServerConfig, synthesizer: Y) -> Self {
        Self {
            config,
            synthesizer,
            should_stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that stops the accept loop when set
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.should_stop.clone()
    }

    /// Bind and serve until the stop flag is set (blocking)
    pub fn run(mut self) -> Result<(), ServerError> {
        let (listener, local) = Listener::bind(&self.config.endpoint)?;
        self.serve(listener, local);
        Ok(())
    }

    /// Bind, then serve on a background thread. The server stops when the handle is dropped.
    pub fn start_background(mut self) -> Result<ServerHandle, ServerError> {
        let (listener, local) = Listener::bind(&self.config.endpoint)?;
        let should_stop = self.should_stop.clone();
        let endpoint = local.clone();

        let thread = thread::spawn(move || self.serve(listener, local));

        Ok(ServerHandle {
            endpoint,
            should_stop,
            thread: Some(thread),
        })
    }

    fn serve(&mut self, listener: Listener, local: Endpoint) {
        info!("🎵 Model server listening on {}", local);
        info!("🗣️ Available voices: {}", self.synthesizer.voices().join(", "));

        while !self.should_stop.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok(Accepted::Tcp(mut stream)) => {
                    handle_client(&mut stream, &mut self.synthesizer, &self.config);
                }
                #[cfg(unix)]
                Ok(Accepted::Unix(mut stream)) => {
                    handle_client(&mut stream, &mut self.synthesizer, &self.config);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    // No connections available, sleep briefly
                    thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                    thread::sleep(Duration::from_millis(50));
                }
            }
        }

        #[cfg(unix)]
        {
            if let Endpoint::Unix(path) = &local {
                let _ = std::fs::remove_file(path);
            }
        }
        info!("🛑 Model server on {} stopped", local);
    }
}

/// Running background server; stops and joins on drop
pub struct ServerHandle {
    pub endpoint: Endpoint,
    should_stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ServerHandle {
    pub fn stop(&mut self) {
        self.should_stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Stand-in model: one short sine tone per word, pitch chosen by voice
pub struct ToneSynthesizer {
    voices: Vec<String>,
    word_duration: Duration,
}

impl ToneSynthesizer {
    pub fn new(voices: Vec<String>, word_duration: Duration) -> Self {
        Self {
            voices,
            word_duration,
        }
    }

    fn frequency(&self, voice: &str) -> f32 {
        let index = self.voices.iter().position(|v| v == voice).unwrap_or(0);
        220.0 * (1.0 + index as f32 * 0.25)
    }
}

impl Default for ToneSynthesizer {
    fn default() -> Self {
        Self::new(
            vec![
                "en-Carter_man".to_string(),
                "en-Emma_woman".to_string(),
                "en-Davis_man".to_string(),
            ],
            Duration::from_millis(150),
        )
    }
}

impl Synthesizer for ToneSynthesizer {
    fn voices(&self) -> Vec<String> {
        self.voices.clone()
    }

    fn synthesize(
        &mut self,
        text: &str,
        voice: &str,
        out: &mut dyn AudioEmitter,
    ) -> Result<(), SynthesisFailure> {
        let frequency = self.frequency(voice);
        let samples = (SAMPLE_RATE as u128 * self.word_duration.as_millis() / 1000) as usize;

        for word in text.split_whitespace() {
            let mut pcm = Vec::with_capacity(samples * 2);
            for i in 0..samples {
                let t = i as f32 / SAMPLE_RATE as f32;
                let fade = 1.0 - i as f32 / samples as f32;
                let value = (2.0 * PI * frequency * t).sin() * fade * 0.5;
                pcm.extend_from_slice(&((value * i16::MAX as f32) as i16).to_le_bytes());
            }
            debug!("🎶 '{}' -> {} bytes", word, pcm.len());
            out.emit(&pcm)?;
        }
        Ok(())
    }
}
