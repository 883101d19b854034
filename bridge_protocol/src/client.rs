use crate::cancel::CancellationToken;
use crate::protocol::{
    ErrorCode, ErrorFrame, FrameHeader, ProtocolError, SynthesisRequest, VoiceId, ERROR_BODY_LEN,
    MAX_CHUNK_SIZE,
};
use crate::transport::{Transport, TransportError};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Terminal failure of one exchange
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Server error {code}: {message}")]
    Server { code: ErrorCode, message: String },
}

/// Where the client is in its request/response exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Connecting,
    Sending,
    Receiving,
    Completed,
    ProtocolError,
    ApplicationError,
    Cancelled,
    TransportFailed,
}

impl ClientState {
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            ClientState::Idle | ClientState::Connecting | ClientState::Sending | ClientState::Receiving
        )
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long to wait for the server endpoint to become available
    pub connect_timeout: Duration,
    /// Largest chunk accepted before the stream is treated as corrupt
    pub max_chunk_size: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            max_chunk_size: MAX_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StreamEnd {
    Completed,
    Cancelled,
}

/// Non-error outcome of a streaming request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamSummary {
    pub end: StreamEnd,
    pub chunks: u32,
    pub bytes: u64,
}

/// Blocking client for the model server. Every request uses a fresh connection.
pub struct BridgeClient<T: Transport> {
    transport: T,
    config: ClientConfig,
    state: ClientState,
}

impl<T: Transport> BridgeClient<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, ClientConfig::default())
    }

    pub fn with_config(transport: T, config: ClientConfig) -> Self {
        Self {
            transport,
            config,
            state: ClientState::Idle,
        }
    }

    /// Current state, or the terminal state of the last request
    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Connect and send the request, then hand back an iterator over the audio chunks
    pub fn open_stream(
        &mut self,
        text: &str,
        voice_id: &VoiceId,
    ) -> Result<ChunkStream<'_, T>, BridgeError> {
        let request = SynthesisRequest::new(text, voice_id.clone());
        // Encode before touching the connection so a bad request never opens one
        let encoded = request.encode_parts().map_err(|e| {
            self.state = ClientState::ProtocolError;
            BridgeError::from(e)
        })?;

        self.state = ClientState::Connecting;
        if let Err(e) = self.transport.connect(self.config.connect_timeout) {
            warn!("⚠️ Could not reach model server: {}", e);
            return Err(self.fail(ClientState::TransportFailed, e.into()));
        }

        self.state = ClientState::Sending;
        debug!(
            "📤 Sending request: {} chars, voice '{}'",
            text.chars().count(),
            voice_id
        );
        let sent = self
            .transport
            .write_exact(&encoded.header)
            .and_then(|_| self.transport.write_exact(&encoded.text))
            .and_then(|_| self.transport.write_exact(&encoded.trailer));
        if let Err(e) = sent {
            error!("❌ Failed to send request: {}", e);
            return Err(self.fail(ClientState::TransportFailed, e.into()));
        }

        self.state = ClientState::Receiving;
        Ok(ChunkStream {
            client: self,
            chunks: 0,
            bytes: 0,
        })
    }

    /// Run one full exchange, handing each audio chunk to `on_chunk` in stream order.
    ///
    /// `cancel` is checked before every frame read. Cancellation is reported as
    /// `StreamEnd::Cancelled`, not as an error. The connection is closed on every path.
    pub fn stream_synthesis<F>(
        &mut self,
        text: &str,
        voice_id: &VoiceId,
        mut on_chunk: F,
        cancel: &CancellationToken,
    ) -> Result<StreamSummary, BridgeError>
    where
        F: FnMut(&[u8]),
    {
        let mut stream = self.open_stream(text, voice_id)?;

        loop {
            if cancel.is_cancelled() {
                return Ok(stream.cancel());
            }

            match stream.next() {
                Some(Ok(chunk)) => on_chunk(&chunk),
                Some(Err(e)) => return Err(e),
                None => return Ok(stream.summary(StreamEnd::Completed)),
            }
        }
    }

    fn fail(&mut self, state: ClientState, err: BridgeError) -> BridgeError {
        self.state = state;
        self.transport.close();
        err
    }

    fn finish(&mut self, state: ClientState) {
        self.state = state;
        self.transport.close();
    }

    fn read_frame(&mut self) -> Result<Frame, BridgeError> {
        let mut prefix = [0u8; 4];
        self.transport.read_exact(&mut prefix)?;

        match FrameHeader::parse(prefix, self.config.max_chunk_size)? {
            FrameHeader::EndOfStream => Ok(Frame::EndOfStream),
            FrameHeader::Error => {
                let mut body = [0u8; ERROR_BODY_LEN];
                self.transport.read_exact(&mut body)?;
                Ok(Frame::Error(ErrorFrame::from_body(&body)))
            }
            FrameHeader::Chunk(length) => {
                let mut data = vec![0u8; length as usize];
                self.transport.read_exact(&mut data)?;
                Ok(Frame::Chunk(data))
            }
        }
    }
}

enum Frame {
    Chunk(Vec<u8>),
    EndOfStream,
    Error(ErrorFrame),
}

/// Audio chunks of one in-flight response. Dropping it closes the connection.
pub struct ChunkStream<'a, T: Transport> {
    client: &'a mut BridgeClient<T>,
    chunks: u32,
    bytes: u64,
}

impl<T: Transport> ChunkStream<'_, T> {
    /// Stop reading and close the connection
    pub fn cancel(mut self) -> StreamSummary {
        if !self.client.state.is_terminal() {
            warn!(
                "🛑 Request cancelled after {} chunks ({} bytes)",
                self.chunks, self.bytes
            );
            self.client.finish(ClientState::Cancelled);
        }
        self.summary(StreamEnd::Cancelled)
    }

    pub fn chunks_received(&self) -> u32 {
        self.chunks
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes
    }

    fn summary(&mut self, end: StreamEnd) -> StreamSummary {
        StreamSummary {
            end,
            chunks: self.chunks,
            bytes: self.bytes,
        }
    }
}

impl<T: Transport> Iterator for ChunkStream<'_, T> {
    type Item = Result<Vec<u8>, BridgeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.client.state != ClientState::Receiving {
            return None;
        }

        match self.client.read_frame() {
            Ok(Frame::Chunk(data)) => {
                self.chunks += 1;
                self.bytes += data.len() as u64;
                debug!("📥 Chunk {}: {} bytes", self.chunks, data.len());
                Some(Ok(data))
            }
            Ok(Frame::EndOfStream) => {
                info!(
                    "✅ Stream complete: {} chunks, {} bytes",
                    self.chunks, self.bytes
                );
                self.client.finish(ClientState::Completed);
                None
            }
            Ok(Frame::Error(frame)) => {
                warn!("❌ Server error {}: {}", frame.code, frame.message);
                self.client.finish(ClientState::ApplicationError);
                Some(Err(BridgeError::Server {
                    code: frame.code,
                    message: frame.message,
                }))
            }
            Err(e) => {
                let state = match e {
                    BridgeError::Protocol(_) => {
                        error!("❌ Protocol violation: {}", e);
                        ClientState::ProtocolError
                    }
                    _ => {
                        error!("❌ Transport failure while receiving: {}", e);
                        ClientState::TransportFailed
                    }
                };
                self.client.finish(state);
                Some(Err(e))
            }
        }
    }
}

impl<T: Transport> Drop for ChunkStream<'_, T> {
    fn drop(&mut self) {
        if !self.client.state.is_terminal() {
            debug!("🔌 Chunk stream dropped mid-response");
            self.client.finish(ClientState::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_chunk, encode_end_of_stream, TRANSPORT_BUFFER_SIZE};
    use crate::transport::{read_full, write_full};
    use std::io::{self, Cursor, Read};
    use std::rc::Rc;
    use std::cell::RefCell;

    /// Hands back the scripted response a few bytes at a time
    struct Trickle {
        data: Cursor<Vec<u8>>,
        step: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.step);
            self.data.read(&mut buf[..n])
        }
    }

    #[derive(Default)]
    struct Record {
        written: Vec<u8>,
        bytes_read: usize,
        closes: usize,
        connects: usize,
    }

    /// In-memory transport replaying a canned server response
    struct ScriptedTransport {
        response: Trickle,
        connected: bool,
        refuse_connect: bool,
        record: Rc<RefCell<Record>>,
    }

    impl ScriptedTransport {
        fn new(response: Vec<u8>, step: usize) -> (Self, Rc<RefCell<Record>>) {
            let record = Rc::new(RefCell::new(Record::default()));
            let transport = Self {
                response: Trickle {
                    data: Cursor::new(response),
                    step,
                },
                connected: false,
                refuse_connect: false,
                record: record.clone(),
            };
            (transport, record)
        }
    }

    impl Transport for ScriptedTransport {
        fn connect(&mut self, timeout: Duration) -> Result<(), TransportError> {
            if self.refuse_connect {
                return Err(TransportError::ConnectTimeout {
                    endpoint: "scripted".into(),
                    timeout,
                });
            }
            if !self.connected {
                self.record.borrow_mut().connects += 1;
                self.connected = true;
            }
            Ok(())
        }

        fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
            if !self.connected {
                return Err(TransportError::NotConnected);
            }
            read_full(&mut self.response, buf)?;
            self.record.borrow_mut().bytes_read += buf.len();
            Ok(())
        }

        fn write_exact(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
            if !self.connected {
                return Err(TransportError::NotConnected);
            }
            write_full(&mut self.record.borrow_mut().written, bytes)
        }

        fn close(&mut self) {
            if self.connected {
                self.record.borrow_mut().closes += 1;
            }
            self.connected = false;
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    fn response(chunks: &[&[u8]], tail: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for chunk in chunks {
            bytes.extend(encode_chunk(chunk, MAX_CHUNK_SIZE).unwrap());
        }
        bytes.extend_from_slice(tail);
        bytes
    }

    fn voice(id: &str) -> VoiceId {
        VoiceId::new(id).unwrap()
    }

    fn collect(
        client: &mut BridgeClient<ScriptedTransport>,
        cancel: &CancellationToken,
    ) -> (Vec<Vec<u8>>, Result<StreamSummary, BridgeError>) {
        let mut delivered = Vec::new();
        let result = client.stream_synthesis(
            "Hello world",
            &voice("Carter"),
            |chunk| delivered.push(chunk.to_vec()),
            cancel,
        );
        (delivered, result)
    }

    #[test]
    fn test_chunks_then_terminator() {
        let _ = env_logger::builder().is_test(true).try_init();

        for n in [0usize, 1, 5] {
            let payloads: Vec<Vec<u8>> = (0..n).map(|i| vec![i as u8; 100 + i]).collect();
            let refs: Vec<&[u8]> = payloads.iter().map(|p| p.as_slice()).collect();
            let (transport, record) = ScriptedTransport::new(response(&refs, &encode_end_of_stream()), 7);
            let mut client = BridgeClient::new(transport);

            let (delivered, result) = collect(&mut client, &CancellationToken::new());
            let summary = result.unwrap();

            assert_eq!(delivered, payloads);
            assert_eq!(summary.end, StreamEnd::Completed);
            assert_eq!(summary.chunks as usize, n);
            assert_eq!(
                summary.bytes,
                payloads.iter().map(|p| p.len() as u64).sum::<u64>()
            );
            assert_eq!(client.state(), ClientState::Completed);
            assert_eq!(record.borrow().closes, 1);
            assert!(!client.transport().is_connected());
        }
    }

    #[test]
    fn test_request_is_written_in_wire_format() {
        let (transport, record) = ScriptedTransport::new(encode_end_of_stream().to_vec(), 4);
        let mut client = BridgeClient::new(transport);
        collect(&mut client, &CancellationToken::new()).1.unwrap();

        let expected = SynthesisRequest::new("Hello world", voice("Carter"))
            .to_bytes()
            .unwrap();
        assert_eq!(record.borrow().written, expected);
    }

    #[test]
    fn test_error_frames_map_to_codes() {
        let cases = [
            (1u32, ErrorCode::EmptyText),
            (2, ErrorCode::InvalidVoice),
            (3, ErrorCode::ModelError),
            (42, ErrorCode::Other(42)),
        ];

        for (raw, expected) in cases {
            let frame = ErrorFrame::new(ErrorCode::from(raw), "boom").to_bytes();
            // A frame after the error must never be consumed
            let mut tail = frame.clone();
            tail.extend(encode_chunk(&[9; 16], MAX_CHUNK_SIZE).unwrap());
            let (transport, record) = ScriptedTransport::new(response(&[&[1, 2]], &tail), 5);
            let mut client = BridgeClient::new(transport);

            let (delivered, result) = collect(&mut client, &CancellationToken::new());
            match result {
                Err(BridgeError::Server { code, message }) => {
                    assert_eq!(code, expected);
                    assert_eq!(message, "boom");
                }
                other => panic!("expected server error, got {:?}", other),
            }
            assert_eq!(delivered, vec![vec![1, 2]]);
            assert_eq!(record.borrow().bytes_read, 4 + 2 + frame.len());
            assert_eq!(client.state(), ClientState::ApplicationError);
            assert_eq!(record.borrow().closes, 1);
        }
    }

    #[test]
    fn test_oversized_prefix_is_rejected_without_reading_payload() {
        let bad = (TRANSPORT_BUFFER_SIZE * 10 + 1).to_le_bytes();
        let (transport, record) = ScriptedTransport::new(bad.to_vec(), 4);
        let mut client = BridgeClient::new(transport);

        let (delivered, result) = collect(&mut client, &CancellationToken::new());
        assert!(matches!(
            result,
            Err(BridgeError::Protocol(ProtocolError::OversizedChunk { .. }))
        ));
        assert!(delivered.is_empty());
        assert_eq!(record.borrow().bytes_read, 4);
        assert_eq!(client.state(), ClientState::ProtocolError);
        assert_eq!(record.borrow().closes, 1);
    }

    #[test]
    fn test_configured_chunk_bound() {
        let config = ClientConfig {
            max_chunk_size: 8,
            ..ClientConfig::default()
        };
        let (transport, _) = ScriptedTransport::new(response(&[&[0; 9]], &[]), 4);
        let mut client = BridgeClient::with_config(transport, config);
        let (_, result) = collect(&mut client, &CancellationToken::new());
        assert!(matches!(result, Err(BridgeError::Protocol(_))));
    }

    #[test]
    fn test_cancel_before_first_read() {
        let (transport, record) =
            ScriptedTransport::new(response(&[&[1; 10]], &encode_end_of_stream()), 4);
        let mut client = BridgeClient::new(transport);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (delivered, result) = collect(&mut client, &cancel);
        let summary = result.unwrap();
        assert_eq!(summary.end, StreamEnd::Cancelled);
        assert!(delivered.is_empty());
        assert_eq!(record.borrow().bytes_read, 0);
        assert_eq!(client.state(), ClientState::Cancelled);
        assert_eq!(record.borrow().closes, 1);
    }

    #[test]
    fn test_cancel_mid_stream_keeps_delivered_chunks() {
        let (transport, record) = ScriptedTransport::new(
            response(&[&[1; 10], &[2; 10], &[3; 10]], &encode_end_of_stream()),
            3,
        );
        let mut client = BridgeClient::new(transport);
        let cancel = CancellationToken::new();
        let mut delivered = Vec::new();

        let summary = client
            .stream_synthesis(
                "Hello",
                &voice("Carter"),
                |chunk| {
                    delivered.push(chunk.to_vec());
                    if delivered.len() == 2 {
                        cancel.cancel();
                    }
                },
                &cancel,
            )
            .unwrap();

        assert_eq!(summary.end, StreamEnd::Cancelled);
        assert_eq!(summary.chunks, 2);
        assert_eq!(summary.bytes, 20);
        assert_eq!(delivered, vec![vec![1; 10], vec![2; 10]]);
        assert_eq!(record.borrow().bytes_read, 2 * (4 + 10));
        assert_eq!(record.borrow().closes, 1);
    }

    #[test]
    fn test_connect_failure() {
        let (mut transport, record) = ScriptedTransport::new(Vec::new(), 4);
        transport.refuse_connect = true;
        let mut client = BridgeClient::new(transport);

        let (_, result) = collect(&mut client, &CancellationToken::new());
        assert!(matches!(
            result,
            Err(BridgeError::Transport(TransportError::ConnectTimeout { .. }))
        ));
        assert_eq!(client.state(), ClientState::TransportFailed);
        assert!(record.borrow().written.is_empty());
    }

    #[test]
    fn test_server_hangup_mid_chunk() {
        let mut bytes = 100u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0; 40]);
        let (transport, record) = ScriptedTransport::new(bytes, 16);
        let mut client = BridgeClient::new(transport);

        let (delivered, result) = collect(&mut client, &CancellationToken::new());
        assert!(matches!(
            result,
            Err(BridgeError::Transport(TransportError::Broken))
        ));
        assert!(delivered.is_empty());
        assert_eq!(client.state(), ClientState::TransportFailed);
        assert_eq!(record.borrow().closes, 1);
    }

    #[test]
    fn test_iterator_interface_and_early_drop() {
        let (transport, record) = ScriptedTransport::new(
            response(&[&[5; 3], &[6; 3]], &encode_end_of_stream()),
            2,
        );
        let mut client = BridgeClient::new(transport);

        {
            let mut stream = client.open_stream("Hi", &voice("")).unwrap();
            assert_eq!(stream.next().unwrap().unwrap(), vec![5; 3]);
            assert_eq!(stream.bytes_received(), 3);
        }

        assert_eq!(client.state(), ClientState::Cancelled);
        assert_eq!(record.borrow().closes, 1);
    }

    #[test]
    fn test_client_can_serve_sequential_requests() {
        let mut script = encode_end_of_stream().to_vec();
        script.extend(response(&[&[7; 4]], &encode_end_of_stream()));
        let (transport, record) = ScriptedTransport::new(script, 64);
        let mut client = BridgeClient::new(transport);

        let first: Vec<_> = client
            .open_stream("one", &voice("a"))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        let second: Vec<_> = client
            .open_stream("two", &voice("a"))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        assert!(first.is_empty());
        assert_eq!(second, vec![vec![7; 4]]);
        assert_eq!(record.borrow().connects, 2);
        assert_eq!(record.borrow().closes, 2);
    }
}
