//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;
use voxline_types::AgentProfile;
use voxline_voice::{LlmConfig, SttConfig, TtsConfig};

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Reply generation endpoint.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Speech synthesis endpoint.
    #[serde(default)]
    pub tts: TtsConfig,

    /// Speech recognition endpoint.
    #[serde(default)]
    pub stt: SttConfig,

    /// Per-call pipeline tuning.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Call statistics settings.
    #[serde(default)]
    pub stats: StatsConfig,

    /// Agent profiles selectable per call.
    #[serde(default)]
    pub agents: Vec<AgentProfile>,

    /// Profile used when a call does not name one. Defaults to the first
    /// configured agent.
    #[serde(default)]
    pub default_agent: Option<String>,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "voxline_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Tuning for the per-call conversation pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Normalized RMS level at or above which an inbound frame counts as
    /// caller speech. `0.0` treats every inbound frame as speech.
    #[serde(default)]
    pub speech_rms_threshold: f32,

    /// Inbound events buffered between the socket reader and the session.
    #[serde(default = "default_inbound_channel_capacity")]
    pub inbound_channel_capacity: usize,
}

/// Call statistics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StatsConfig {
    /// Cost charged per minute of call time.
    #[serde(default)]
    pub cost_per_minute: f64,

    /// Number of finished calls kept in the `callsOverTime` history.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_inbound_channel_capacity() -> usize {
    256
}

fn default_history_limit() -> usize {
    100
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            speech_rms_threshold: 0.0,
            inbound_channel_capacity: default_inbound_channel_capacity(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            cost_per_minute: 0.0,
            history_limit: default_history_limit(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// The file parsed but describes an unusable setup.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.tts.frame_ms == 0 {
            return Err(ConfigError::Invalid("tts.frame_ms must be positive".to_string()));
        }
        if self.pipeline.inbound_channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.inbound_channel_capacity must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.pipeline.speech_rms_threshold) {
            return Err(ConfigError::Invalid(
                "pipeline.speech_rms_threshold must be between 0.0 and 1.0".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate agent id: {}",
                    agent.id
                )));
            }
        }
        if let Some(default) = &self.default_agent {
            if !self.agents.iter().any(|a| &a.id == default) {
                return Err(ConfigError::Invalid(format!(
                    "default_agent {} is not a configured agent",
                    default
                )));
            }
        }
        Ok(())
    }
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `VOXLINE_HOST` overrides `server.host`
/// - `VOXLINE_PORT` overrides `server.port`
/// - `VOXLINE_LOG_LEVEL` overrides `logging.level`
/// - `VOXLINE_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `VOXLINE_LLM_API_KEY`, `VOXLINE_TTS_API_KEY`, `VOXLINE_STT_API_KEY`
///   override the endpoint credentials
/// - `VOXLINE_LLM_MODEL` overrides `llm.model`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed, or
/// if the resulting configuration is invalid.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    // Environment variable overrides
    if let Ok(host) = std::env::var("VOXLINE_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Ok(port) = std::env::var("VOXLINE_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Ok(level) = std::env::var("VOXLINE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("VOXLINE_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Ok(key) = std::env::var("VOXLINE_LLM_API_KEY") {
        config.llm.api_key = key;
    }
    if let Ok(key) = std::env::var("VOXLINE_TTS_API_KEY") {
        config.tts.api_key = key;
    }
    if let Ok(key) = std::env::var("VOXLINE_STT_API_KEY") {
        config.stt.api_key = key;
    }
    if let Ok(model) = std::env::var("VOXLINE_LLM_MODEL") {
        config.llm.model = model;
    }

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn missing_file_uses_defaults() {
        let config = load_config(Some("/nonexistent/voxline.toml")).unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.tts.frame_ms, 20);
        assert!(config.agents.is_empty());
        assert_eq!(config.stats.history_limit, 100);
    }

    #[test]
    fn parses_agents_and_pipeline_sections() {
        let file = write_config(
            r#"
            default_agent = "support"

            [pipeline]
            speech_rms_threshold = 0.02

            [stats]
            cost_per_minute = 0.05

            [[agents]]
            id = "sales"
            prompt = "Sell."

            [[agents]]
            id = "support"
            voice = "alloy"
            end_of_speech_timeout_ms = 800
            "#,
        );
        let config = load_config(file.path().to_str()).unwrap();
        assert_eq!(config.agents.len(), 2);
        assert_eq!(config.default_agent.as_deref(), Some("support"));
        assert_eq!(config.agents[1].end_of_speech_timeout_ms, 800);
        assert!((config.pipeline.speech_rms_threshold - 0.02).abs() < f32::EPSILON);
        assert!((config.stats.cost_per_minute - 0.05).abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_default_agent_is_rejected() {
        let file = write_config(
            r#"
            default_agent = "ghost"

            [[agents]]
            id = "sales"
            "#,
        );
        match load_config(file.path().to_str()) {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("ghost")),
            other => panic!("expected Invalid, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn zero_frame_duration_is_rejected() {
        let file = write_config("[tts]\nframe_ms = 0\n");
        assert!(matches!(
            load_config(file.path().to_str()),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let file = write_config("[server\nport = 1");
        assert!(matches!(
            load_config(file.path().to_str()),
            Err(ConfigError::Parse(_))
        ));
    }
}
