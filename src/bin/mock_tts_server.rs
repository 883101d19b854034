use bridge_protocol::{Endpoint, MAX_CHUNK_SIZE};
use clap::Parser;
use log::info;
use std::sync::atomic::Ordering;
use std::time::Duration;
use voice_bridge::{ServerConfig, SynthesisServer, ToneSynthesizer};

#[derive(Parser, Debug)]
#[command(name = "mock_tts_server")]
#[command(about = "Mock model server that answers speak requests with sine tones")]
struct Args {
    /// Endpoint to listen on (default: the well-known local socket)
    #[arg(short, long)]
    endpoint: Option<Endpoint>,

    /// Comma-separated voice names, the first is the default
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "en-Carter_man,en-Emma_woman,en-Davis_man"
    )]
    voices: Vec<String>,

    /// Silence appended after each utterance (in milliseconds)
    #[arg(long, default_value = "300")]
    silence_ms: u64,

    /// Tone length generated per word (in milliseconds)
    #[arg(long, default_value = "150")]
    chunk_ms: u64,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();
    info!("🚀 Starting mock TTS server with args: {:?}", args);

    let config = ServerConfig {
        endpoint: args.endpoint.unwrap_or_else(Endpoint::well_known),
        silence_pad: Duration::from_millis(args.silence_ms),
        max_chunk_size: MAX_CHUNK_SIZE,
    };
    let synthesizer = ToneSynthesizer::new(args.voices, Duration::from_millis(args.chunk_ms));
    let server = SynthesisServer::new(config, synthesizer);

    // Handle Ctrl+C gracefully
    let should_stop = server.stop_flag();
    ctrlc::set_handler(move || {
        info!("🛑 Received Ctrl+C, shutting down...");
        should_stop.store(true, Ordering::SeqCst);
    })?;

    server.run()?;
    info!("🛑 Mock TTS server stopped");

    Ok(())
}
