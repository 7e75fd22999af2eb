//! Retrieval facade: the surface external collaborators call.
//!
//! Pure composition over [`EmbeddingGenerator`], [`VectorIndex`], and
//! [`CorpusIngester`]. Search never propagates an error across the facade
//! boundary; failures come back as an empty hit list with an error
//! indicator so callers that do not expect errors stay safe.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::Config;
use crate::embedding::{create_backend, EmbeddingBackend, EmbeddingGenerator};
use crate::error::Result;
use crate::index::VectorIndex;
use crate::ingest::CorpusIngester;
use crate::models::{SearchHit, SourceChannel};
use crate::source::{MessageSource, SlackSource};

/// Outcome of a facade search: hits plus an error indicator instead of a
/// thrown error.
#[derive(Debug)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    pub error: Option<String>,
}

pub struct RetrievalEngine {
    embeddings: Arc<EmbeddingGenerator>,
    index: Arc<VectorIndex>,
    ingester: CorpusIngester,
    source: Arc<dyn MessageSource>,
}

impl RetrievalEngine {
    /// Build the engine from configuration: Slack source, remote embedding
    /// backend, and the persisted index under the storage directory.
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let backend = create_backend(&config.embedding)?;
        let source: Arc<dyn MessageSource> =
            Arc::new(SlackSource::new(config.ingest.fetch_timeout_secs)?);
        Self::from_parts(source, backend, config)
    }

    /// Build the engine from explicit collaborators (tests, other sources).
    pub fn from_parts(
        source: Arc<dyn MessageSource>,
        backend: Box<dyn EmbeddingBackend>,
        config: &Config,
    ) -> anyhow::Result<Self> {
        let embeddings = Arc::new(EmbeddingGenerator::new(backend));
        let index = Arc::new(VectorIndex::open(&config.storage.dir)?);
        let ingester = CorpusIngester::new(
            source.clone(),
            embeddings.clone(),
            index.clone(),
            config.ingest.clone(),
        );

        Ok(Self {
            embeddings,
            index,
            ingester,
            source,
        })
    }

    /// Search the corpus for the `k` messages most similar to `query`,
    /// optionally restricted to one channel id.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        channel_filter: Option<&str>,
    ) -> SearchResponse {
        debug!(query, k, "retrieval search");

        let query_vec = match self.embeddings.generate(query).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "query embedding failed");
                return SearchResponse {
                    hits: Vec::new(),
                    error: Some(e.to_string()),
                };
            }
        };

        let filter = channel_filter.map(|channel| {
            HashMap::from([("channel".to_string(), channel.to_string())])
        });

        let hits = self
            .index
            .search(&query_vec, k, filter.as_ref())
            .iter()
            .map(SearchHit::from_record)
            .collect();

        SearchResponse { hits, error: None }
    }

    /// Ingest one channel's recent window; returns how many records landed.
    pub async fn ingest(&self, source_id: &str, display_name: &str) -> Result<usize> {
        self.ingester.ingest(source_id, display_name).await
    }

    /// Ingest several channels with per-channel fault isolation.
    pub async fn ingest_all(&self, sources: &[SourceChannel]) -> HashMap<String, usize> {
        self.ingester.ingest_all(sources).await
    }

    /// Enumerate the channels available for ingestion.
    pub async fn list_sources(&self) -> Result<Vec<SourceChannel>> {
        self.source.list_available_sources().await
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    pub fn embeddings(&self) -> &EmbeddingGenerator {
        &self.embeddings
    }
}
