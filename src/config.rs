//! Configuration management for ChatRelay
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.

use crate::error::{Result, RelayError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure for ChatRelay
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// HTTP listener settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream completion endpoint settings
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Default generation parameters applied when a client omits them
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Conversation persistence settings
    #[serde(default)]
    pub storage: StorageConfig,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind
    #[serde(default = "default_port")]
    pub port: u16,

    /// Seconds a stream session may wait for its `/stream` request before
    /// it is discarded
    #[serde(default = "default_stream_claim_timeout")]
    pub stream_claim_timeout_seconds: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_stream_claim_timeout() -> u64 {
    300
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            stream_claim_timeout_seconds: default_stream_claim_timeout(),
        }
    }
}

/// Upstream completion endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Chat completions URL
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Model identifier sent with every request
    #[serde(default = "default_model")]
    pub model: String,

    /// TCP connect timeout in seconds. Reads are never timed out.
    #[serde(default)]
    pub connect_timeout_seconds: Option<u64>,

    /// Fallback file holding the API key when the environment has none
    #[serde(default = "default_api_key_file")]
    pub api_key_file: PathBuf,
}

fn default_api_url() -> String {
    "https://api.hyperbolic.xyz/v1/chat/completions".to_string()
}

fn default_model() -> String {
    "deepseek-ai/DeepSeek-R1-Zero".to_string()
}

fn default_api_key_file() -> PathBuf {
    PathBuf::from(".hyperbolic_api_key")
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            model: default_model(),
            connect_timeout_seconds: None,
            api_key_file: default_api_key_file(),
        }
    }
}

/// Generation parameter defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Nucleus sampling threshold
    #[serde(default = "default_top_p")]
    pub top_p: f64,

    /// Maximum output tokens
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_temperature() -> f64 {
    0.1
}

fn default_top_p() -> f64 {
    0.9
}

fn default_max_tokens() -> u32 {
    100
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: default_top_p(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// Conversation persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding one `<id>.json` file per conversation
    #[serde(default = "default_conversations_dir")]
    pub conversations_dir: PathBuf,
}

fn default_conversations_dir() -> PathBuf {
    PathBuf::from("conversations")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            conversations_dir: default_conversations_dir(),
        }
    }
}

impl Config {
    /// Load configuration from file, environment, and CLI
    ///
    /// A missing file is not an error; defaults are used instead.
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli);

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("Failed to read config file: {}", e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| RelayError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) {
        if let Ok(host) = std::env::var("CHATRELAY_HOST") {
            self.server.host = host;
        }

        if let Ok(port) = std::env::var("CHATRELAY_PORT") {
            if let Ok(value) = port.parse() {
                self.server.port = value;
            } else {
                tracing::warn!("Invalid CHATRELAY_PORT: {}", port);
            }
        }

        if let Ok(api_url) = std::env::var("CHATRELAY_API_URL") {
            self.upstream.api_url = api_url;
        }

        if let Ok(model) = std::env::var("CHATRELAY_MODEL") {
            self.upstream.model = model;
        }

        if let Ok(dir) = std::env::var("CHATRELAY_CONVERSATIONS_DIR") {
            self.storage.conversations_dir = PathBuf::from(dir);
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) {
        if cli.verbose {
            tracing::debug!("Verbose mode enabled");
        }

        if let crate::cli::Commands::Serve {
            host,
            port,
            data_dir,
        } = &cli.command
        {
            if let Some(host) = host {
                self.server.host = host.clone();
            }
            if let Some(port) = port {
                self.server.port = *port;
            }
            if let Some(dir) = data_dir {
                self.storage.conversations_dir = dir.clone();
            }
        }
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `RelayError::Config` describing the first invalid field
    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            return Err(RelayError::Config("server.host cannot be empty".to_string()).into());
        }

        if self.server.port == 0 {
            return Err(
                RelayError::Config("server.port must be greater than 0".to_string()).into(),
            );
        }

        if self.server.stream_claim_timeout_seconds == 0 {
            return Err(RelayError::Config(
                "server.stream_claim_timeout_seconds must be greater than 0".to_string(),
            )
            .into());
        }

        let url = url::Url::parse(&self.upstream.api_url).map_err(|e| {
            RelayError::Config(format!(
                "upstream.api_url is not a valid URL ({}): {}",
                self.upstream.api_url, e
            ))
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(RelayError::Config(format!(
                "upstream.api_url must use http or https, got {}",
                url.scheme()
            ))
            .into());
        }

        if self.upstream.model.trim().is_empty() {
            return Err(RelayError::Config("upstream.model cannot be empty".to_string()).into());
        }

        if !(0.0..=2.0).contains(&self.generation.temperature) {
            return Err(RelayError::Config(
                "generation.temperature must be between 0.0 and 2.0".to_string(),
            )
            .into());
        }

        if self.generation.top_p <= 0.0 || self.generation.top_p > 1.0 {
            return Err(RelayError::Config(
                "generation.top_p must be greater than 0.0 and at most 1.0".to_string(),
            )
            .into());
        }

        if self.generation.max_tokens == 0 {
            return Err(RelayError::Config(
                "generation.max_tokens must be greater than 0".to_string(),
            )
            .into());
        }

        if self.storage.conversations_dir.as_os_str().is_empty() {
            return Err(RelayError::Config(
                "storage.conversations_dir cannot be empty".to_string(),
            )
            .into());
        }

        Ok(())
    }
}
