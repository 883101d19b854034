//! End-to-end tests: speech engine and bridge client against a live model server

use bridge_protocol::{
    BridgeClient, ClientConfig, ClientState, Endpoint, LocalSocketTransport, Transport, VoiceId,
    MAX_CHUNK_SIZE,
};
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use voice_bridge::server::{AudioEmitter, SynthesisError, SynthesisFailure};
use voice_bridge::{
    BridgeEngine, MemorySite, ServerConfig, ServerHandle, SpeakError, SpeechEngine,
    SynthesisServer, Synthesizer, TextFragment, VoiceProfile,
};

/// Synthesizer that replays fixed chunks and records what it was asked to say
#[derive(Clone)]
struct Scripted {
    chunks: Vec<usize>,
    delay: Duration,
    fail: Option<String>,
    requests: Arc<Mutex<Vec<(String, String)>>>,
    emitted: Arc<AtomicUsize>,
}

impl Scripted {
    fn new(chunks: Vec<usize>) -> Self {
        Self {
            chunks,
            delay: Duration::ZERO,
            fail: None,
            requests: Arc::new(Mutex::new(Vec::new())),
            emitted: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Synthesizer for Scripted {
    fn voices(&self) -> Vec<String> {
        vec!["en-Carter_man".to_string(), "en-Emma_woman".to_string()]
    }

    fn synthesize(
        &mut self,
        text: &str,
        voice: &str,
        out: &mut dyn AudioEmitter,
    ) -> Result<(), SynthesisFailure> {
        self.requests
            .lock()
            .unwrap()
            .push((text.to_string(), voice.to_string()));

        for (i, &len) in self.chunks.iter().enumerate() {
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            out.emit(&vec![(i % 251) as u8; len])?;
            self.emitted.fetch_add(1, Ordering::SeqCst);
        }

        match &self.fail {
            Some(reason) => Err(SynthesisError(reason.clone()).into()),
            None => Ok(()),
        }
    }
}

fn start_server(synthesizer: Scripted, silence_ms: u64) -> ServerHandle {
    let config = ServerConfig {
        endpoint: Endpoint::Tcp("127.0.0.1:0".parse().unwrap()),
        silence_pad: Duration::from_millis(silence_ms),
        max_chunk_size: MAX_CHUNK_SIZE,
    };
    SynthesisServer::new(config, synthesizer)
        .start_background()
        .unwrap()
}

fn engine_for(
    endpoint: &Endpoint,
    voice: &str,
) -> BridgeEngine<impl FnMut() -> LocalSocketTransport> {
    let endpoint = endpoint.clone();
    let config = ClientConfig {
        connect_timeout: Duration::from_secs(5),
        ..ClientConfig::default()
    };
    let mut engine = BridgeEngine::new(move || LocalSocketTransport::new(endpoint.clone()), config);
    engine
        .configure(&VoiceProfile::new("test").with_voice_id(voice))
        .unwrap();
    engine
}

#[test_log::test]
fn test_hello_world_streams_all_audio() {
    let synth = Scripted::new(vec![4000, 3000]);
    let requests = synth.requests.clone();
    let server = start_server(synth, 0);

    let mut engine = engine_for(&server.endpoint, "Carter");
    let mut site = MemorySite::new();
    let report = engine
        .speak(&[TextFragment::speak("Hello world")], &mut site)
        .unwrap();

    assert_eq!(report.bytes_written, 7000);
    assert_eq!(report.chunks, 2);
    assert!(!report.aborted);
    assert_eq!(site.pcm.len(), 7000);
    assert!(site.pcm[..4000].iter().all(|&b| b == 0));
    assert!(site.pcm[4000..].iter().all(|&b| b == 1));

    let requests = requests.lock().unwrap();
    assert_eq!(
        requests.as_slice(),
        &[("Hello world.".to_string(), "en-Carter_man".to_string())]
    );
}

#[test_log::test]
fn test_silence_padding_is_appended() {
    let server = start_server(Scripted::new(vec![100]), 300);

    let mut engine = engine_for(&server.endpoint, "");
    let mut site = MemorySite::new();
    let report = engine
        .speak(&[TextFragment::speak("Pad me")], &mut site)
        .unwrap();

    // 300ms of 24kHz 16-bit mono silence
    assert_eq!(report.bytes_written, 100 + 14400);
    assert!(site.pcm[100..].iter().all(|&b| b == 0));
}

#[test_log::test]
fn test_server_errors_map_to_host_errors() {
    let mut synth = Scripted::new(vec![500]);
    synth.fail = Some("CUDA out of memory".to_string());
    let server = start_server(synth, 0);

    let mut site = MemorySite::new();

    let err = engine_for(&server.endpoint, "Carter")
        .speak(&[TextFragment::speak("  \r\n ")], &mut site)
        .unwrap_err();
    assert!(matches!(err, SpeakError::InvalidArgument(_)), "{:?}", err);

    let err = engine_for(&server.endpoint, "Bob")
        .speak(&[TextFragment::speak("Hello")], &mut site)
        .unwrap_err();
    match err {
        SpeakError::VoiceNotFound(message) => {
            assert!(message.contains("Bob"));
            assert!(message.contains("en-Emma_woman"));
        }
        other => panic!("expected VoiceNotFound, got {:?}", other),
    }

    let err = engine_for(&server.endpoint, "Emma")
        .speak(&[TextFragment::speak("Hello")], &mut site)
        .unwrap_err();
    assert!(
        matches!(&err, SpeakError::EngineFailure(m) if m == "CUDA out of memory"),
        "{:?}",
        err
    );
}

#[test_log::test]
fn test_host_abort_stops_server_generation() {
    let mut synth = Scripted::new(vec![4800; 200]);
    synth.delay = Duration::from_millis(5);
    let emitted = synth.emitted.clone();
    let server = start_server(synth, 0);

    let mut engine = engine_for(&server.endpoint, "");
    let mut site = MemorySite::abort_after(1);
    let report = engine
        .speak(&[TextFragment::speak("A very long story")], &mut site)
        .unwrap();

    assert!(report.aborted);
    assert_eq!(report.chunks, 1);
    assert_eq!(site.pcm.len(), 4800);

    // The server notices the closed connection on a later write and gives up
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut last = emitted.load(Ordering::SeqCst);
    loop {
        thread::sleep(Duration::from_millis(100));
        let now = emitted.load(Ordering::SeqCst);
        if now == last || Instant::now() > deadline {
            break;
        }
        last = now;
    }
    assert!(last < 200, "server kept generating: {} chunks", last);

    // And is ready for the next client
    let mut site = MemorySite::new();
    let result = engine.speak(&[TextFragment::speak("Again")], &mut site);
    assert!(result.is_ok());
}

#[test_log::test]
fn test_chunk_stream_over_live_server() {
    let server = start_server(Scripted::new(vec![10, 20, 30]), 0);

    let mut client = BridgeClient::new(LocalSocketTransport::new(server.endpoint.clone()));
    let voice = VoiceId::new("en-Emma_woman").unwrap();

    let lengths: Vec<usize> = client
        .open_stream("Count to three", &voice)
        .unwrap()
        .map(|chunk| chunk.unwrap().len())
        .collect();

    assert_eq!(lengths, vec![10, 20, 30]);
    assert_eq!(client.state(), ClientState::Completed);
    assert!(!client.transport().is_connected());
}

#[test_log::test]
fn test_connect_times_out_without_server() {
    // Reserve a port, then free it so nothing is listening
    let port = TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let endpoint = Endpoint::Tcp(([127, 0, 0, 1], port).into());

    let config = ClientConfig {
        connect_timeout: Duration::from_millis(200),
        ..ClientConfig::default()
    };
    let mut engine = BridgeEngine::new(move || LocalSocketTransport::new(endpoint.clone()), config);

    let started = Instant::now();
    let mut site = MemorySite::new();
    let err = engine
        .speak(&[TextFragment::speak("Anyone there?")], &mut site)
        .unwrap_err();

    assert!(matches!(err, SpeakError::Timeout(_)), "{:?}", err);
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(site.pcm.is_empty());
}

#[cfg(unix)]
#[test_log::test]
fn test_client_waits_for_late_unix_server() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = Endpoint::Unix(dir.path().join("vibevoice.sock"));

    let client_endpoint = endpoint.clone();
    let client = thread::spawn(move || {
        let mut engine = engine_for(&client_endpoint, "Carter");
        let mut site = MemorySite::new();
        engine
            .speak(&[TextFragment::speak("Wait for it")], &mut site)
            .map(|report| report.bytes_written)
    });

    thread::sleep(Duration::from_millis(200));
    let config = ServerConfig {
        endpoint,
        silence_pad: Duration::ZERO,
        max_chunk_size: MAX_CHUNK_SIZE,
    };
    let _server = SynthesisServer::new(config, Scripted::new(vec![1234]))
        .start_background()
        .unwrap();

    assert_eq!(client.join().unwrap().unwrap(), 1234);
}
