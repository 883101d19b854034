use crate::transport::{read_full, TransportError};
use std::fmt;
use std::io::{self, Read};
use thiserror::Error;

/// Buffer size the model server allocates for its end of the channel
pub const TRANSPORT_BUFFER_SIZE: u32 = 65536;

/// Largest data chunk a well-behaved server may send in one frame
pub const MAX_CHUNK_SIZE: u32 = TRANSPORT_BUFFER_SIZE * 10;

/// Length prefix announcing an error frame instead of audio
pub const ERROR_MARKER: u32 = 0xFFFF_FFFF;

/// Length prefix announcing the end of the stream
pub const END_OF_STREAM: u32 = 0;

pub const VOICE_ID_LEN: usize = 32;
pub const ERROR_MESSAGE_LEN: usize = 256;

/// Upper bound the server side accepts for a request's text field (4 MiB)
pub const MAX_REQUEST_TEXT_BYTES: u32 = 4 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Chunk length {length} exceeds maximum of {max} bytes")]
    OversizedChunk { length: u32, max: u32 },

    #[error("Text of {0} bytes does not fit a 32-bit length field")]
    TextTooLong(usize),

    #[error("Invalid voice id: {0}")]
    InvalidVoiceId(String),

    #[error("Text is not valid UTF-16LE")]
    InvalidText,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Fixed-width, null-padded ASCII voice selector
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct VoiceId(String);

impl VoiceId {
    /// Build a voice id, truncating to the 32-byte wire width
    pub fn new(id: &str) -> Result<Self, ProtocolError> {
        if !id.is_ascii() {
            return Err(ProtocolError::InvalidVoiceId(format!(
                "'{}' contains non-ASCII characters",
                id
            )));
        }
        if id.contains('\0') {
            return Err(ProtocolError::InvalidVoiceId(format!(
                "'{}' contains a NUL byte",
                id.escape_default()
            )));
        }

        let truncated = if id.len() > VOICE_ID_LEN {
            log::warn!(
                "⚠️ Voice id '{}' is longer than {} bytes, truncating",
                id,
                VOICE_ID_LEN
            );
            &id[..VOICE_ID_LEN]
        } else {
            id
        };

        Ok(VoiceId(truncated.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn to_field(&self) -> [u8; VOICE_ID_LEN] {
        let mut field = [0u8; VOICE_ID_LEN];
        field[..self.0.len()].copy_from_slice(self.0.as_bytes());
        field
    }

    fn from_field(field: &[u8; VOICE_ID_LEN]) -> Result<Self, ProtocolError> {
        let end = field
            .iter()
            .rposition(|&b| b != 0)
            .map(|pos| pos + 1)
            .unwrap_or(0);
        let id = std::str::from_utf8(&field[..end])
            .map_err(|_| ProtocolError::InvalidVoiceId("voice id field is not ASCII".into()))?;
        VoiceId::new(id)
    }
}

impl fmt::Display for VoiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request flags. The client always sends `NONE`; the rest are server extensions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestFlags(pub u32);

impl RequestFlags {
    pub const NONE: RequestFlags = RequestFlags(0);
    /// Ask the server not to append trailing silence
    pub const NO_SILENCE_PAD: RequestFlags = RequestFlags(0x0000_0001);

    pub fn contains(self, other: RequestFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// One "speak this text" request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice_id: VoiceId,
    pub flags: RequestFlags,
}

/// The request as written on the wire: length prefix, text, then voice id + flags
pub struct EncodedRequest {
    pub header: [u8; 4],
    pub text: Vec<u8>,
    pub trailer: [u8; VOICE_ID_LEN + 4],
}

impl SynthesisRequest {
    pub fn new(text: impl Into<String>, voice_id: VoiceId) -> Self {
        Self {
            text: text.into(),
            voice_id,
            flags: RequestFlags::NONE,
        }
    }

    /// Serialize into the three pieces the client writes in sequence
    pub fn encode_parts(&self) -> Result<EncodedRequest, ProtocolError> {
        let text: Vec<u8> = self
            .text
            .encode_utf16()
            .flat_map(|unit| unit.to_le_bytes())
            .collect();
        let text_len = u32::try_from(text.len()).map_err(|_| ProtocolError::TextTooLong(text.len()))?;

        let mut trailer = [0u8; VOICE_ID_LEN + 4];
        trailer[..VOICE_ID_LEN].copy_from_slice(&self.voice_id.to_field());
        trailer[VOICE_ID_LEN..].copy_from_slice(&self.flags.0.to_le_bytes());

        Ok(EncodedRequest {
            header: text_len.to_le_bytes(),
            text,
            trailer,
        })
    }

    /// Serialize into a single contiguous buffer
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let parts = self.encode_parts()?;
        let mut bytes = Vec::with_capacity(4 + parts.text.len() + parts.trailer.len());
        bytes.extend_from_slice(&parts.header);
        bytes.extend_from_slice(&parts.text);
        bytes.extend_from_slice(&parts.trailer);
        Ok(bytes)
    }

    /// Read one request from the server side of a connection.
    ///
    /// A text field over `MAX_REQUEST_TEXT_BYTES` is discarded without being
    /// buffered, so the sender finishes its request and can read the rejection.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, RequestReadError> {
        let mut header = [0u8; 4];
        read_full(reader, &mut header)?;
        let text_len = u32::from_le_bytes(header);

        if text_len > MAX_REQUEST_TEXT_BYTES {
            let remaining = u64::from(text_len) + (VOICE_ID_LEN + 4) as u64;
            let discarded = io::copy(&mut reader.by_ref().take(remaining), &mut io::sink())
                .map_err(TransportError::Io)?;
            if discarded < remaining {
                return Err(TransportError::Broken.into());
            }
            return Err(ProtocolError::InvalidRequest(format!(
                "text length {} exceeds {} bytes",
                text_len, MAX_REQUEST_TEXT_BYTES
            ))
            .into());
        }

        let mut text = vec![0u8; text_len as usize];
        read_full(reader, &mut text)?;

        let mut trailer = [0u8; VOICE_ID_LEN + 4];
        read_full(reader, &mut trailer)?;

        Ok(SynthesisRequest::from_parts(&text, &trailer)?)
    }

    fn from_parts(text: &[u8], trailer: &[u8; VOICE_ID_LEN + 4]) -> Result<Self, ProtocolError> {
        if text.len() % 2 != 0 {
            return Err(ProtocolError::InvalidText);
        }
        let units: Vec<u16> = text
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let text = String::from_utf16(&units).map_err(|_| ProtocolError::InvalidText)?;

        let mut voice_field = [0u8; VOICE_ID_LEN];
        voice_field.copy_from_slice(&trailer[..VOICE_ID_LEN]);
        let voice_id = VoiceId::from_field(&voice_field)?;

        let flags = RequestFlags(u32::from_le_bytes([
            trailer[VOICE_ID_LEN],
            trailer[VOICE_ID_LEN + 1],
            trailer[VOICE_ID_LEN + 2],
            trailer[VOICE_ID_LEN + 3],
        ]));

        Ok(SynthesisRequest {
            text,
            voice_id,
            flags,
        })
    }
}

/// Failure while reading a request off the wire
#[derive(Error, Debug)]
pub enum RequestReadError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// What a response length prefix announces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameHeader {
    Chunk(u32),
    EndOfStream,
    Error,
}

impl FrameHeader {
    /// Classify a length prefix without allocating anything for it
    pub fn parse(prefix: [u8; 4], max_chunk_size: u32) -> Result<Self, ProtocolError> {
        match u32::from_le_bytes(prefix) {
            END_OF_STREAM => Ok(FrameHeader::EndOfStream),
            ERROR_MARKER => Ok(FrameHeader::Error),
            length if length <= max_chunk_size => Ok(FrameHeader::Chunk(length)),
            length => Err(ProtocolError::OversizedChunk {
                length,
                max: max_chunk_size,
            }),
        }
    }
}

/// Application error codes carried in an error frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    EmptyText,
    InvalidVoice,
    ModelError,
    Unknown,
    Other(u32),
}

impl From<u32> for ErrorCode {
    fn from(code: u32) -> Self {
        match code {
            1 => ErrorCode::EmptyText,
            2 => ErrorCode::InvalidVoice,
            3 => ErrorCode::ModelError,
            99 => ErrorCode::Unknown,
            other => ErrorCode::Other(other),
        }
    }
}

impl From<ErrorCode> for u32 {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::EmptyText => 1,
            ErrorCode::InvalidVoice => 2,
            ErrorCode::ModelError => 3,
            ErrorCode::Unknown => 99,
            ErrorCode::Other(other) => other,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::EmptyText => write!(f, "empty text (1)"),
            ErrorCode::InvalidVoice => write!(f, "voice not found (2)"),
            ErrorCode::ModelError => write!(f, "model error (3)"),
            ErrorCode::Unknown => write!(f, "unknown error (99)"),
            ErrorCode::Other(code) => write!(f, "unrecognized error ({})", code),
        }
    }
}

/// Body of an error frame (everything after the marker)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFrame {
    pub code: ErrorCode,
    pub message: String,
}

pub const ERROR_BODY_LEN: usize = 4 + ERROR_MESSAGE_LEN;

impl ErrorFrame {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Encode marker, code and the NUL-padded message buffer
    pub fn to_bytes(&self) -> Vec<u8> {
        // Leave room for at least one NUL terminator
        let mut end = self.message.len().min(ERROR_MESSAGE_LEN - 1);
        while !self.message.is_char_boundary(end) {
            end -= 1;
        }

        let mut bytes = Vec::with_capacity(4 + ERROR_BODY_LEN);
        bytes.extend_from_slice(&ERROR_MARKER.to_le_bytes());
        bytes.extend_from_slice(&u32::from(self.code).to_le_bytes());
        bytes.extend_from_slice(&self.message.as_bytes()[..end]);
        bytes.resize(4 + ERROR_BODY_LEN, 0);
        bytes
    }

    /// Decode the body that follows the marker
    pub fn from_body(body: &[u8; ERROR_BODY_LEN]) -> Self {
        let code = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
        let message = &body[4..];
        let end = message
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(message.len());

        Self {
            code: ErrorCode::from(code),
            message: String::from_utf8_lossy(&message[..end]).into_owned(),
        }
    }
}

/// Encode a data chunk frame. Empty chunks are rejected since they read as a terminator.
pub fn encode_chunk(data: &[u8], max_chunk_size: u32) -> Result<Vec<u8>, ProtocolError> {
    let length = u32::try_from(data.len()).unwrap_or(u32::MAX);
    if data.is_empty() {
        return Err(ProtocolError::InvalidRequest(
            "an empty chunk would terminate the stream".into(),
        ));
    }
    if length > max_chunk_size || length == ERROR_MARKER {
        return Err(ProtocolError::OversizedChunk {
            length,
            max: max_chunk_size,
        });
    }

    let mut bytes = Vec::with_capacity(4 + data.len());
    bytes.extend_from_slice(&length.to_le_bytes());
    bytes.extend_from_slice(data);
    Ok(bytes)
}

pub fn encode_end_of_stream() -> [u8; 4] {
    END_OF_STREAM.to_le_bytes()
}
