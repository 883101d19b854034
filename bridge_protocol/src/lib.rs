//! # Bridge Protocol
//!
//! Framed streaming protocol and blocking client for talking to the local
//! text-to-speech model server.
//!
//! This crate provides:
//! - Wire format definitions (request, chunk, end-of-stream and error frames)
//! - An exact-count transport over a local socket or named pipe
//! - A client that turns one request into an ordered stream of PCM chunks
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use bridge_protocol::{BridgeClient, CancellationToken, Endpoint, LocalSocketTransport, VoiceId};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = LocalSocketTransport::new(Endpoint::well_known());
//! let mut client = BridgeClient::new(transport);
//! let cancel = CancellationToken::new();
//!
//! let mut pcm = Vec::new();
//! let summary = client.stream_synthesis(
//!     "Hello world",
//!     &VoiceId::new("Carter")?,
//!     |chunk| pcm.extend_from_slice(chunk),
//!     &cancel,
//! )?;
//!
//! println!("Received {} chunks, {} bytes", summary.chunks, summary.bytes);
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod client;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use cancel::CancellationToken;
pub use client::{
    BridgeClient, BridgeError, ChunkStream, ClientConfig, ClientState, StreamEnd, StreamSummary,
};
pub use protocol::{
    ErrorCode, ErrorFrame, FrameHeader, ProtocolError, RequestFlags, RequestReadError,
    SynthesisRequest, VoiceId, MAX_CHUNK_SIZE, TRANSPORT_BUFFER_SIZE,
};
pub use transport::{Endpoint, LocalSocketTransport, Transport, TransportError};
