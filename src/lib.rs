pub mod adapter;
pub mod config;
pub mod error;
pub mod server;
pub mod sink;

pub use adapter::{
    AudioFormat, BridgeEngine, FragmentAction, OutputSite, SinkError, SpeakReport, SpeechEngine,
    TextFragment, VoiceProfile,
};
pub use config::{load_config, BridgeConfig, ConfigError};
pub use error::{Result, SpeakError};
pub use server::{ServerConfig, ServerHandle, Synthesizer, SynthesisServer, ToneSynthesizer};
pub use sink::{MemorySite, WavFileSite};
