use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Directory holding `records.json` and `vectors.bin`.
    pub dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: None,
            dims: None,
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    /// How many recent messages to request per channel window.
    #[serde(default = "default_messages_per_channel")]
    pub messages_per_channel: usize,
    /// Messages shorter than this are not worth indexing.
    #[serde(default = "default_min_message_length")]
    pub min_message_length: usize,
    /// Stored text is truncated to this many chars before embedding.
    #[serde(default = "default_max_embed_chars")]
    pub max_embed_chars: usize,
    /// Bound on a single channel fetch so one stuck source cannot stall
    /// a multi-channel run.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            messages_per_channel: default_messages_per_channel(),
            min_message_length: default_min_message_length(),
            max_embed_chars: default_max_embed_chars(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

fn default_messages_per_channel() -> usize {
    200
}
fn default_min_message_length() -> usize {
    10
}
fn default_max_embed_chars() -> usize {
    4000
}
fn default_fetch_timeout_secs() -> u64 {
    30
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate embedding
    match config.embedding.provider.as_str() {
        "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be openai or ollama.",
            other
        ),
    }

    if config.embedding.model.is_none() {
        anyhow::bail!(
            "embedding.model must be specified for provider '{}'",
            config.embedding.provider
        );
    }

    if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
        anyhow::bail!(
            "embedding.dims must be > 0 for provider '{}'",
            config.embedding.provider
        );
    }

    // Validate ingest
    if config.ingest.messages_per_channel == 0 {
        anyhow::bail!("ingest.messages_per_channel must be > 0");
    }

    if config.ingest.max_embed_chars == 0 {
        anyhow::bail!("ingest.max_embed_chars must be > 0");
    }

    Ok(config)
}
