//! Embedding generation with content-hash caching.
//!
//! Defines the [`EmbeddingBackend`] trait and concrete implementations:
//! - **[`OpenAiBackend`]** — calls the OpenAI embeddings API with retry and backoff.
//! - **[`OllamaBackend`]** — calls a local Ollama instance's `/api/embed` endpoint.
//!
//! On top of a backend sits [`EmbeddingGenerator`], which caches vectors by
//! a SHA-256 digest of the exact input text and sends only cache misses
//! remotely, combined into one request per batch. The cache is an
//! optimization, never a source of truth: losing it affects cost, not
//! correctness.
//!
//! # Retry Strategy
//!
//! The remote backends use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;
use crate::error::{EngineError, Result};

/// Trait for remote embedding backends.
///
/// `embed` returns one slot per input text, in input order. A `None` slot
/// marks an item the remote reported no embedding for (malformed or
/// missing response entry); a transport-level failure that loses the whole
/// request is an `Err`.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// Embed a batch of texts in one remote call.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>>;
}

/// Create the appropriate [`EmbeddingBackend`] based on configuration.
///
/// # Errors
///
/// Returns an error for unknown provider names or if the backend cannot
/// be initialized (missing model, dims, or API key).
pub fn create_backend(config: &EmbeddingConfig) -> anyhow::Result<Box<dyn EmbeddingBackend>> {
    match config.provider.as_str() {
        "openai" => Ok(Box::new(OpenAiBackend::new(config)?)),
        "ollama" => Ok(Box::new(OllamaBackend::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ OpenAI Backend ============

/// Embedding backend using the OpenAI API.
///
/// Calls the `POST /v1/embeddings` endpoint with the configured model.
/// Requires the `OPENAI_API_KEY` environment variable to be set.
pub struct OpenAiBackend {
    model: String,
    dims: usize,
    max_retries: u32,
    timeout: Duration,
}

impl OpenAiBackend {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI backend"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI backend"))?;

        if std::env::var("OPENAI_API_KEY").is_err() {
            bail!("OPENAI_API_KEY environment variable not set");
        }

        Ok(Self {
            model,
            dims,
            max_retries: config.max_retries,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }
}

#[async_trait]
impl EmbeddingBackend for OpenAiBackend {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| EngineError::Generation {
            failed: (0..texts.len()).collect(),
            reason: "OPENAI_API_KEY not set".to_string(),
        })?;

        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| generation_error(texts.len(), e))?;

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = client
                .post("https://api.openai.com/v1/embeddings")
                .header("Authorization", format!("Bearer {}", api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| generation_error(texts.len(), e))?;
                        return parse_openai_response(&json, texts.len());
                    }

                    // Rate limited or server error — retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(format!("OpenAI API error {}: {}", status, body_text));
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    let body_text = response.text().await.unwrap_or_default();
                    return Err(EngineError::Generation {
                        failed: (0..texts.len()).collect(),
                        reason: format!("OpenAI API error {}: {}", status, body_text),
                    });
                }
                Err(e) => {
                    last_err = Some(e.to_string());
                    continue;
                }
            }
        }

        Err(EngineError::Generation {
            failed: (0..texts.len()).collect(),
            reason: last_err.unwrap_or_else(|| "embedding failed after retries".to_string()),
        })
    }
}

fn generation_error(count: usize, err: impl std::fmt::Display) -> EngineError {
    EngineError::Generation {
        failed: (0..count).collect(),
        reason: err.to_string(),
    }
}

/// Parse the OpenAI embeddings API response JSON.
///
/// Response entries carry an `index` field; slots are filled by index so
/// a missing or malformed entry fails only that item, not the batch.
fn parse_openai_response(
    json: &serde_json::Value,
    expected: usize,
) -> Result<Vec<Option<Vec<f32>>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EngineError::Generation {
            failed: (0..expected).collect(),
            reason: "invalid OpenAI response: missing data array".to_string(),
        })?;

    let mut slots: Vec<Option<Vec<f32>>> = vec![None; expected];

    for (pos, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);

        if index >= expected {
            continue;
        }

        if let Some(embedding) = item.get("embedding").and_then(|e| e.as_array()) {
            let vec: Vec<f32> = embedding
                .iter()
                .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                .collect();
            slots[index] = Some(vec);
        }
    }

    Ok(slots)
}

// ============ Ollama Backend ============

/// Embedding backend using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default:
/// `http://localhost:11434`). Requires Ollama to be running with an
/// embedding model pulled (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaBackend {
    model: String,
    dims: usize,
    url: String,
    max_retries: u32,
    timeout: Duration,
}

impl OllamaBackend {
    pub fn new(config: &EmbeddingConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama backend"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama backend"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            model,
            dims,
            url,
            max_retries: config.max_retries,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }
}

#[async_trait]
impl EmbeddingBackend for OllamaBackend {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>> {
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| generation_error(texts.len(), e))?;

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = client
                .post(format!("{}/api/embed", self.url))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| generation_error(texts.len(), e))?;
                        return parse_ollama_response(&json, texts.len());
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(format!("Ollama API error {}: {}", status, body_text));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    return Err(EngineError::Generation {
                        failed: (0..texts.len()).collect(),
                        reason: format!("Ollama API error {}: {}", status, body_text),
                    });
                }
                Err(e) => {
                    last_err = Some(format!(
                        "Ollama connection error (is Ollama running at {}?): {}",
                        self.url, e
                    ));
                    continue;
                }
            }
        }

        Err(EngineError::Generation {
            failed: (0..texts.len()).collect(),
            reason: last_err.unwrap_or_else(|| "Ollama embedding failed after retries".to_string()),
        })
    }
}

fn parse_ollama_response(
    json: &serde_json::Value,
    expected: usize,
) -> Result<Vec<Option<Vec<f32>>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| EngineError::Generation {
            failed: (0..expected).collect(),
            reason: "invalid Ollama response: missing embeddings array".to_string(),
        })?;

    let mut slots: Vec<Option<Vec<f32>>> = vec![None; expected];

    for (pos, embedding) in embeddings.iter().enumerate().take(expected) {
        if let Some(arr) = embedding.as_array() {
            let vec: Vec<f32> = arr.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect();
            slots[pos] = Some(vec);
        }
    }

    Ok(slots)
}

// ============ Generator ============

/// Result of a batch embedding request.
///
/// `vectors` is order-preserving, one slot per input text; `failed` lists
/// the indexes whose slot is `None`. Callers decide whether partial
/// success is acceptable.
#[derive(Debug)]
pub struct EmbeddingBatch {
    pub vectors: Vec<Option<Vec<f32>>>,
    pub failed: Vec<usize>,
}

impl EmbeddingBatch {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Caching front for an [`EmbeddingBackend`].
///
/// Vectors are cached by a SHA-256 digest of the exact input text for the
/// process lifetime. On batch calls only cache misses are sent remotely,
/// combined into a single request.
pub struct EmbeddingGenerator {
    backend: Box<dyn EmbeddingBackend>,
    cache: RwLock<HashMap<String, Vec<f32>>>,
}

impl EmbeddingGenerator {
    pub fn new(backend: Box<dyn EmbeddingBackend>) -> Self {
        Self {
            backend,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn model_name(&self) -> &str {
        self.backend.model_name()
    }

    pub fn dims(&self) -> usize {
        self.backend.dims()
    }

    /// Generate an embedding for a single text.
    ///
    /// # Errors
    ///
    /// Empty text is rejected; remote failure surfaces as
    /// [`EngineError::Generation`].
    pub async fn generate(&self, text: &str) -> Result<Vec<f32>> {
        if text.is_empty() {
            return Err(EngineError::Generation {
                failed: vec![0],
                reason: "cannot embed empty text".to_string(),
            });
        }

        let key = hash_text(text);
        if let Some(cached) = self.cache.read().unwrap().get(&key) {
            debug!("embedding cache hit");
            return Ok(cached.clone());
        }

        let slots = self.backend.embed(&[text.to_string()]).await?;
        match slots.into_iter().next().flatten() {
            Some(vector) => {
                self.cache.write().unwrap().insert(key, vector.clone());
                debug!(dims = vector.len(), "generated embedding");
                Ok(vector)
            }
            None => Err(EngineError::Generation {
                failed: vec![0],
                reason: "backend returned no embedding".to_string(),
            }),
        }
    }

    /// Generate embeddings for a batch of texts.
    ///
    /// Cached texts never touch the network; misses go out in one combined
    /// request. Per-item failures are flagged in the returned batch.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Generation`] only when every requested item
    /// failed; any partial success is an `Ok` with `failed` populated.
    pub async fn generate_batch(&self, texts: &[String]) -> Result<EmbeddingBatch> {
        if texts.is_empty() {
            return Ok(EmbeddingBatch {
                vectors: Vec::new(),
                failed: Vec::new(),
            });
        }

        let mut vectors: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut failed: Vec<usize> = Vec::new();
        let mut misses: Vec<(usize, String)> = Vec::new();

        {
            let cache = self.cache.read().unwrap();
            for (i, text) in texts.iter().enumerate() {
                if text.is_empty() {
                    failed.push(i);
                    continue;
                }
                match cache.get(&hash_text(text)) {
                    Some(cached) => vectors[i] = Some(cached.clone()),
                    None => misses.push((i, text.clone())),
                }
            }
        }

        if !misses.is_empty() {
            let miss_texts: Vec<String> = misses.iter().map(|(_, t)| t.clone()).collect();
            debug!(count = miss_texts.len(), "embedding batch cache misses");

            match self.backend.embed(&miss_texts).await {
                Ok(slots) => {
                    let mut cache = self.cache.write().unwrap();
                    for ((original, text), slot) in misses.iter().zip(slots.into_iter()) {
                        match slot {
                            Some(vector) => {
                                cache.insert(hash_text(text), vector.clone());
                                vectors[*original] = Some(vector);
                            }
                            None => failed.push(*original),
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "embedding batch call failed");
                    failed.extend(misses.iter().map(|(i, _)| *i));
                }
            }
        }

        failed.sort_unstable();

        if failed.len() == texts.len() {
            return Err(EngineError::Generation {
                failed,
                reason: "all items in batch failed".to_string(),
            });
        }

        Ok(EmbeddingBatch { vectors, failed })
    }

    pub fn cache_len(&self) -> usize {
        self.cache.read().unwrap().len()
    }

    pub fn clear_cache(&self) {
        self.cache.write().unwrap().clear();
    }
}

/// SHA-256 hex digest of the exact input text, used as the cache key.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
