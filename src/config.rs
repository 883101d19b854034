use bridge_protocol::{ClientConfig, Endpoint, TRANSPORT_BUFFER_SIZE};
use std::env;
use std::time::Duration;
use thiserror::Error;

pub const ENDPOINT_VAR: &str = "VIBEVOICE_ENDPOINT";
pub const CONNECT_TIMEOUT_VAR: &str = "VIBEVOICE_CONNECT_TIMEOUT_MS";
pub const BUFFER_SIZE_VAR: &str = "VIBEVOICE_BUFFER_SIZE";
pub const VOICE_VAR: &str = "VIBEVOICE_VOICE";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {reason}")]
    InvalidValue { var: String, reason: String },
}

/// Settings for reaching the model server
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub endpoint: Endpoint,
    pub connect_timeout: Duration,
    /// Server-side channel buffer size; chunks above 10x this are rejected
    pub buffer_size: u32,
    /// Voice used when the host profile does not name one
    pub default_voice: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::well_known(),
            connect_timeout: Duration::from_secs(30),
            buffer_size: TRANSPORT_BUFFER_SIZE,
            default_voice: None,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists (for development)
        dotenvy::dotenv().ok();

        Self::from_lookup(|var| env::var(var).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(endpoint) = lookup(ENDPOINT_VAR) {
            config.endpoint = endpoint.parse().map_err(|reason| ConfigError::InvalidValue {
                var: ENDPOINT_VAR.to_string(),
                reason,
            })?;
        }

        if let Some(timeout) = lookup(CONNECT_TIMEOUT_VAR) {
            let millis = parse_number(CONNECT_TIMEOUT_VAR, &timeout)?;
            config.connect_timeout = Duration::from_millis(millis);
        }

        if let Some(size) = lookup(BUFFER_SIZE_VAR) {
            let size = parse_number(BUFFER_SIZE_VAR, &size)?;
            config.buffer_size = u32::try_from(size)
                .ok()
                .filter(|&s| s > 0 && s.checked_mul(10).is_some())
                .ok_or_else(|| ConfigError::InvalidValue {
                    var: BUFFER_SIZE_VAR.to_string(),
                    reason: format!("{} is out of range", size),
                })?;
        }

        config.default_voice = lookup(VOICE_VAR).filter(|v| !v.trim().is_empty());

        Ok(config)
    }

    /// Largest chunk the client accepts from the server
    pub fn max_chunk_size(&self) -> u32 {
        self.buffer_size.saturating_mul(10)
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            connect_timeout: self.connect_timeout,
            max_chunk_size: self.max_chunk_size(),
        }
    }
}

fn parse_number(var: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|e| ConfigError::InvalidValue {
            var: var.to_string(),
            reason: format!("'{}' is not a number: {}", value, e),
        })
}

/// Load configuration with helpful error messages
pub fn load_config() -> Result<BridgeConfig, ConfigError> {
    match BridgeConfig::from_env() {
        Ok(config) => {
            log::info!(
                "Loaded bridge configuration: endpoint {}, timeout {:?}",
                config.endpoint,
                config.connect_timeout
            );
            Ok(config)
        }
        Err(e) => {
            log::error!("Configuration error: {}", e);
            Err(e)
        }
    }
}
