use anyhow::Context;
use bridge_protocol::{Endpoint, LocalSocketTransport};
use clap::Parser;
use log::info;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use voice_bridge::{
    load_config, BridgeEngine, SpeakReport, SpeechEngine, TextFragment, VoiceProfile,
    WavFileSite,
};

#[derive(Parser, Debug)]
#[command(name = "voice-bridge")]
#[command(about = "Speak text through the local model server and save the audio as WAV")]
struct Args {
    /// Text to synthesize
    #[arg(short, long)]
    text: String,

    /// Voice id (empty selects the server default)
    #[arg(short, long)]
    voice: Option<String>,

    /// Output WAV file (24kHz mono s16le)
    #[arg(short, long, default_value = "output.wav")]
    output: PathBuf,

    /// Server endpoint, e.g. tcp://127.0.0.1:50061 or a socket path
    #[arg(short, long)]
    endpoint: Option<Endpoint>,

    /// How long to wait for the server to appear (milliseconds)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Summary<'a> {
    output: &'a PathBuf,
    voice: &'a str,
    samples: u64,
    duration_secs: f64,
    #[serde(flatten)]
    report: SpeakReport,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();
    info!("🚀 Starting voice-bridge with args: {:?}", args);

    let mut config = load_config()?;
    if let Some(endpoint) = args.endpoint {
        config.endpoint = endpoint;
    }
    if let Some(timeout) = args.timeout_ms {
        config.connect_timeout = Duration::from_millis(timeout);
    }

    let endpoint = config.endpoint.clone();
    let mut engine = BridgeEngine::new(
        move || LocalSocketTransport::new(endpoint.clone()),
        config.client_config(),
    );

    let voice = args
        .voice
        .or_else(|| config.default_voice.clone())
        .unwrap_or_default();
    engine.configure(&VoiceProfile::new("cli").with_voice_id(voice.as_str()))?;

    let format = engine.output_format();
    let mut site =
        WavFileSite::create(&args.output, format).context("Failed to open output file")?;

    let report = engine.speak(&[TextFragment::speak(args.text)], &mut site)?;
    let samples = site.finalize().context("Failed to finish WAV file")?;

    let summary = Summary {
        output: &args.output,
        voice: &voice,
        samples,
        duration_secs: samples as f64 / format.sample_rate as f64,
        report,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "✅ Wrote {} bytes in {} chunks ({:.2}s) to {}{}",
            report.bytes_written,
            report.chunks,
            summary.duration_secs,
            args.output.display(),
            if report.aborted { " (aborted)" } else { "" }
        );
    }

    Ok(())
}
