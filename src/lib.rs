//! # Channel Recall
//!
//! Semantic retrieval over chat channel history.
//!
//! Raw conversational history vastly exceeds a language model's prompt
//! budget. Channel Recall compresses an append-only corpus of short
//! messages into a durable vector index that answers "find the K most
//! semantically related messages" quickly, survives process restarts, and
//! tolerates partial failures during ingestion (a failed remote call never
//! corrupts the index or duplicates content).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────────┐   ┌─────────────────┐
//! │ MessageSource │──▶│ CorpusIngester │──▶│   VectorIndex    │
//! │ (Slack API)   │   │ filter + embed │   │ records.json +  │
//! └──────────────┘   └───────┬────────┘   │ vectors.bin     │
//!                            │            └────────┬────────┘
//!                    ┌───────▼────────┐            │
//!                    │ EmbeddingGen   │   ┌────────▼────────┐
//!                    │ cache + remote │◀──│ RetrievalEngine │
//!                    └────────────────┘   │    (facade)     │
//!                                         └─────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn run() -> anyhow::Result<()> {
//! use channel_recall::config::load_config;
//! use channel_recall::retrieval::RetrievalEngine;
//!
//! let config = load_config(std::path::Path::new("recall.toml"))?;
//! let engine = RetrievalEngine::new(&config)?;
//!
//! let channels = engine.list_sources().await?;
//! engine.ingest_all(&channels).await;
//!
//! let response = engine.search("database migration", 5, None).await;
//! for hit in response.hits {
//!     println!("[{}] {}: {}", hit.channel_name, hit.author, hit.content);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`embedding`] | Cached embedding generation over remote backends |
//! | [`index`] | Durable cosine vector index |
//! | [`source`] | Message-source trait and Slack implementation |
//! | [`ingest`] | Channel ingestion pipeline |
//! | [`retrieval`] | Public facade |
//! | [`error`] | Error taxonomy |

pub mod config;
pub mod embedding;
pub mod error;
pub mod index;
pub mod ingest;
pub mod models;
pub mod retrieval;
pub mod source;

pub use error::{EngineError, Result};
pub use models::{Record, SearchHit, SourceChannel};
pub use retrieval::{RetrievalEngine, SearchResponse};
