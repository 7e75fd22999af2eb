//! Channel ingestion pipeline: fetch → filter → embed → commit.
//!
//! Each `ingest` call fetches one channel's recent window, filters it down
//! to indexable messages, embeds the survivors in one batch, and commits
//! the successes to the index. The contract is best effort: per-item
//! embedding failures are logged and excluded, and the returned count
//! reflects what actually landed. `ingest_all` additionally isolates
//! per-source fetch failures so one dead channel cannot abort the rest.
//!
//! The ingester holds no state of its own between calls; everything
//! durable lives in the [`VectorIndex`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::IngestConfig;
use crate::embedding::EmbeddingGenerator;
use crate::error::{EngineError, Result};
use crate::index::VectorIndex;
use crate::models::{RawMessage, Record, SourceChannel};
use crate::source::MessageSource;

pub struct CorpusIngester {
    source: Arc<dyn MessageSource>,
    embeddings: Arc<EmbeddingGenerator>,
    index: Arc<VectorIndex>,
    config: IngestConfig,
}

struct PreparedMessage {
    id: String,
    content: String,
    metadata: HashMap<String, String>,
}

impl CorpusIngester {
    pub fn new(
        source: Arc<dyn MessageSource>,
        embeddings: Arc<EmbeddingGenerator>,
        index: Arc<VectorIndex>,
        config: IngestConfig,
    ) -> Self {
        Self {
            source,
            embeddings,
            index,
            config,
        }
    }

    /// Ingest one channel's recent window. Returns how many records landed.
    ///
    /// # Errors
    ///
    /// [`EngineError::Fetch`] if the source is unreachable or times out;
    /// [`EngineError::Generation`] only when every message in the embedding
    /// batch failed. Partial embedding failure is logged, not raised.
    pub async fn ingest(&self, source_id: &str, display_name: &str) -> Result<usize> {
        info!(channel = display_name, id = source_id, "ingesting channel");

        let fetch = self
            .source
            .fetch_recent_window(source_id, self.config.messages_per_channel);
        let messages = tokio::time::timeout(
            Duration::from_secs(self.config.fetch_timeout_secs),
            fetch,
        )
        .await
        .map_err(|_| {
            EngineError::Fetch(format!(
                "fetch of {} timed out after {}s",
                source_id, self.config.fetch_timeout_secs
            ))
        })??;

        if messages.is_empty() {
            debug!(channel = display_name, "no messages in window");
            return Ok(0);
        }

        let prepared = self.prepare_messages(&messages, source_id, display_name);
        if prepared.is_empty() {
            debug!(channel = display_name, "no indexable messages in window");
            return Ok(0);
        }

        let contents: Vec<String> = prepared.iter().map(|m| m.content.clone()).collect();
        let batch = self.embeddings.generate_batch(&contents).await?;

        if !batch.is_complete() {
            let skipped: Vec<&str> = batch
                .failed
                .iter()
                .map(|&i| prepared[i].id.as_str())
                .collect();
            warn!(
                channel = display_name,
                skipped = ?skipped,
                "embedding failed for some messages; committing the rest"
            );
        }

        let records: Vec<Record> = prepared
            .into_iter()
            .zip(batch.vectors.into_iter())
            .filter_map(|(msg, slot)| {
                slot.map(|embedding| Record::new(msg.id, msg.content, embedding, msg.metadata))
            })
            .collect();

        let count = self.index.add_batch(records)?;
        info!(channel = display_name, count, "ingested channel");
        Ok(count)
    }

    /// Ingest several channels independently.
    ///
    /// A failure in one channel is caught and reported as a zero count for
    /// that channel; the remaining channels are always processed.
    pub async fn ingest_all(&self, sources: &[SourceChannel]) -> HashMap<String, usize> {
        let mut results = HashMap::new();

        for channel in sources {
            match self.ingest(&channel.id, &channel.display_name).await {
                Ok(count) => {
                    results.insert(channel.id.clone(), count);
                }
                Err(e) => {
                    warn!(
                        channel = %channel.display_name,
                        error = %e,
                        "channel ingestion failed"
                    );
                    results.insert(channel.id.clone(), 0);
                }
            }
        }

        let total: usize = results.values().sum();
        info!(total, channels = sources.len(), "ingestion run complete");
        results
    }

    /// Filter a raw window down to indexable messages and attach metadata.
    ///
    /// Drops structural messages, messages below the configured minimum
    /// length, and messages that are solely one bracketed reference (a
    /// bare link or mention). Surviving text is truncated to
    /// `max_embed_chars` on a char boundary.
    fn prepare_messages(
        &self,
        messages: &[RawMessage],
        source_id: &str,
        display_name: &str,
    ) -> Vec<PreparedMessage> {
        let mut prepared = Vec::new();

        for msg in messages {
            if msg.is_structural {
                continue;
            }

            let text = msg.text.trim();
            if text.chars().count() < self.config.min_message_length {
                continue;
            }

            if text.starts_with('<') && text.ends_with('>') {
                continue;
            }

            let content: String = text.chars().take(self.config.max_embed_chars).collect();

            let mut metadata = HashMap::new();
            metadata.insert("channel".to_string(), source_id.to_string());
            metadata.insert("channel_name".to_string(), display_name.to_string());
            metadata.insert(
                "author".to_string(),
                msg.author.clone().unwrap_or_else(|| "unknown".to_string()),
            );
            metadata.insert(
                "timestamp".to_string(),
                format_display_ts(&msg.native_ts),
            );
            metadata.insert("ts".to_string(), msg.native_ts.clone());

            prepared.push(PreparedMessage {
                id: format!("{}_{}", source_id, msg.native_ts),
                content,
                metadata,
            });
        }

        prepared
    }
}

/// Convert a native epoch timestamp (e.g. `"1726000000.000100"`) into an
/// ISO display form; an unparsable timestamp is passed through as is.
fn format_display_ts(native_ts: &str) -> String {
    native_ts
        .parse::<f64>()
        .ok()
        .and_then(|ts| chrono::DateTime::from_timestamp(ts.trunc() as i64, 0))
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| native_ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;

    use crate::embedding::EmbeddingBackend;

    struct MockSource {
        windows: HashMap<String, Vec<RawMessage>>,
    }

    #[async_trait]
    impl MessageSource for MockSource {
        async fn fetch_recent_window(
            &self,
            source_id: &str,
            _max_count: usize,
        ) -> Result<Vec<RawMessage>> {
            self.windows
                .get(source_id)
                .cloned()
                .ok_or_else(|| EngineError::Fetch(format!("no such channel: {source_id}")))
        }

        async fn list_available_sources(&self) -> Result<Vec<SourceChannel>> {
            Ok(self
                .windows
                .keys()
                .map(|id| SourceChannel {
                    id: id.clone(),
                    display_name: id.clone(),
                })
                .collect())
        }
    }

    struct MockBackend {
        fail_texts: HashSet<String>,
    }

    #[async_trait]
    impl EmbeddingBackend for MockBackend {
        fn model_name(&self) -> &str {
            "mock"
        }

        fn dims(&self) -> usize {
            4
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    if self.fail_texts.contains(t) {
                        None
                    } else {
                        // Deterministic pseudo-embedding from byte content.
                        let mut v = [0.0f32; 4];
                        for (i, b) in t.bytes().enumerate() {
                            v[i % 4] += b as f32;
                        }
                        Some(v.to_vec())
                    }
                })
                .collect())
        }
    }

    fn msg(text: &str, ts: &str) -> RawMessage {
        RawMessage {
            text: text.to_string(),
            author: Some("U1".to_string()),
            native_ts: ts.to_string(),
            is_structural: false,
        }
    }

    fn build(
        windows: HashMap<String, Vec<RawMessage>>,
        fail_texts: &[&str],
    ) -> (tempfile::TempDir, CorpusIngester, Arc<VectorIndex>) {
        let tmp = tempfile::TempDir::new().unwrap();
        let index = Arc::new(VectorIndex::open(tmp.path()).unwrap());
        let embeddings = Arc::new(EmbeddingGenerator::new(Box::new(MockBackend {
            fail_texts: fail_texts.iter().map(|t| t.to_string()).collect(),
        })));
        let ingester = CorpusIngester::new(
            Arc::new(MockSource { windows }),
            embeddings,
            index.clone(),
            IngestConfig::default(),
        );
        (tmp, ingester, index)
    }

    #[tokio::test]
    async fn test_filter_skips_structural_short_and_bracketed() {
        let mut structural = msg("a structural message that is long enough", "1");
        structural.is_structural = true;

        let windows = HashMap::from([(
            "C1".to_string(),
            vec![
                structural,
                msg("short", "2"),
                msg("<https://example.com/a-link-with-no-commentary>", "3"),
                msg("the deploy to staging failed again", "4"),
            ],
        )]);
        let (_tmp, ingester, index) = build(windows, &[]);

        let count = ingester.ingest("C1", "general").await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(index.len(), 1);

        let record = index.get("C1_4").unwrap();
        assert_eq!(record.content, "the deploy to staging failed again");
        assert_eq!(record.metadata.get("channel_name").unwrap(), "general");
        assert_eq!(record.metadata.get("author").unwrap(), "U1");
        assert_eq!(record.metadata.get("ts").unwrap(), "4");
    }

    #[tokio::test]
    async fn test_reingestion_is_idempotent() {
        let windows = HashMap::from([(
            "C1".to_string(),
            vec![
                msg("the deploy to staging failed again", "1726000000.000100"),
                msg("rollback completed without incident", "1726000060.000200"),
            ],
        )]);
        let (_tmp, ingester, index) = build(windows, &[]);

        let first = ingester.ingest("C1", "general").await.unwrap();
        let second = ingester.ingest("C1", "general").await.unwrap();

        assert_eq!(first, 2);
        assert_eq!(second, 2);
        // Overwrites, not duplicates.
        assert_eq!(index.len(), 2);
    }

    #[tokio::test]
    async fn test_partial_embedding_failure_commits_the_rest() {
        let windows = HashMap::from([(
            "C1".to_string(),
            vec![
                msg("first message long enough to index", "1"),
                msg("second message that will fail remotely", "2"),
                msg("third message long enough to index", "3"),
            ],
        )]);
        let (_tmp, ingester, index) =
            build(windows, &["second message that will fail remotely"]);

        let count = ingester.ingest("C1", "general").await.unwrap();
        assert_eq!(count, 2);
        assert!(index.get("C1_1").is_some());
        assert!(index.get("C1_2").is_none());
        assert!(index.get("C1_3").is_some());
    }

    #[tokio::test]
    async fn test_ingest_all_isolates_fetch_failures() {
        let windows = HashMap::from([(
            "C1".to_string(),
            vec![msg("a perfectly indexable message", "1")],
        )]);
        let (_tmp, ingester, index) = build(windows, &[]);

        let channels = vec![
            SourceChannel {
                id: "C1".to_string(),
                display_name: "general".to_string(),
            },
            SourceChannel {
                id: "C404".to_string(),
                display_name: "ghost".to_string(),
            },
        ];

        let results = ingester.ingest_all(&channels).await;
        assert_eq!(results.get("C1"), Some(&1));
        assert_eq!(results.get("C404"), Some(&0));
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn test_long_text_truncated_before_embedding() {
        let long = "x".repeat(10_000);
        let windows = HashMap::from([("C1".to_string(), vec![msg(&long, "1")])]);

        let tmp = tempfile::TempDir::new().unwrap();
        let index = Arc::new(VectorIndex::open(tmp.path()).unwrap());
        let embeddings = Arc::new(EmbeddingGenerator::new(Box::new(MockBackend {
            fail_texts: HashSet::new(),
        })));
        let ingester = CorpusIngester::new(
            Arc::new(MockSource { windows }),
            embeddings,
            index.clone(),
            IngestConfig {
                max_embed_chars: 100,
                ..IngestConfig::default()
            },
        );

        ingester.ingest("C1", "general").await.unwrap();
        assert_eq!(index.get("C1_1").unwrap().content.chars().count(), 100);
    }

    #[test]
    fn test_format_display_ts() {
        assert_eq!(format_display_ts("0"), "1970-01-01T00:00:00Z");
        assert_eq!(format_display_ts("not-a-ts"), "not-a-ts");
    }
}
