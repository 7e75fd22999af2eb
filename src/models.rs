//! Core data types that flow through the ingestion and retrieval pipeline.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A record stored in the vector index.
///
/// `id` is derived deterministically from the source channel and the
/// message's native timestamp, so re-ingesting the same window overwrites
/// rather than duplicates. `score` is populated only on search results and
/// is never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(skip)]
    pub score: Option<f32>,
}

impl Record {
    pub fn new(
        id: impl Into<String>,
        content: impl Into<String>,
        embedding: Vec<f32>,
        metadata: HashMap<String, String>,
    ) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            embedding,
            metadata,
            score: None,
        }
    }
}

/// Raw message produced by a [`MessageSource`](crate::source::MessageSource)
/// before filtering and normalization.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub text: String,
    /// Author id, if the source reports one.
    pub author: Option<String>,
    /// The source's native timestamp string (e.g. Slack's `"1726000000.000100"`).
    pub native_ts: String,
    /// System/structural messages (joins, topic changes) are not authored
    /// content and are skipped by the ingester.
    pub is_structural: bool,
}

/// A channel (or other message window) that can be ingested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceChannel {
    pub id: String,
    pub display_name: String,
}

/// A single hit returned from the retrieval facade.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub content: String,
    pub channel: String,
    pub channel_name: String,
    pub author: String,
    pub timestamp: String,
    pub score: f32,
}

impl SearchHit {
    /// Build a hit view from a scored index record. Missing metadata keys
    /// degrade to `"unknown"` rather than failing the search.
    pub fn from_record(record: &Record) -> Self {
        let get = |key: &str| {
            record
                .metadata
                .get(key)
                .cloned()
                .unwrap_or_else(|| "unknown".to_string())
        };
        Self {
            content: record.content.clone(),
            channel: get("channel"),
            channel_name: get("channel_name"),
            author: get("author"),
            timestamp: record.metadata.get("timestamp").cloned().unwrap_or_default(),
            score: record.score.unwrap_or(0.0),
        }
    }
}
