//! Message-source abstraction and the Slack Web API implementation.
//!
//! The engine only depends on the [`MessageSource`] trait; [`SlackSource`]
//! is the production implementation over `conversations.history` and
//! `conversations.list`.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::models::{RawMessage, SourceChannel};

/// A collaborator that can produce recent message windows.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Fetch up to `max_count` recent messages from one channel, newest first.
    async fn fetch_recent_window(&self, source_id: &str, max_count: usize)
        -> Result<Vec<RawMessage>>;

    /// List the channels available for ingestion.
    async fn list_available_sources(&self) -> Result<Vec<SourceChannel>>;
}

const SLACK_API_BASE: &str = "https://slack.com/api";

/// Slack Web API message source.
///
/// Requires the `SLACK_BOT_TOKEN` environment variable. Only channels the
/// bot is a member of are listed.
pub struct SlackSource {
    token: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct HistoryResponse {
    ok: bool,
    error: Option<String>,
    #[serde(default)]
    messages: Vec<HistoryMessage>,
}

#[derive(Deserialize)]
struct HistoryMessage {
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    ts: String,
}

#[derive(Deserialize)]
struct ListResponse {
    ok: bool,
    error: Option<String>,
    #[serde(default)]
    channels: Vec<ListChannel>,
}

#[derive(Deserialize)]
struct ListChannel {
    id: String,
    name: String,
    #[serde(default)]
    is_member: bool,
}

impl SlackSource {
    pub fn new(timeout_secs: u64) -> anyhow::Result<Self> {
        let token = std::env::var("SLACK_BOT_TOKEN")
            .map_err(|_| anyhow::anyhow!("SLACK_BOT_TOKEN environment variable not set"))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self { token, client })
    }
}

#[async_trait]
impl MessageSource for SlackSource {
    async fn fetch_recent_window(
        &self,
        source_id: &str,
        max_count: usize,
    ) -> Result<Vec<RawMessage>> {
        let resp = self
            .client
            .get(format!("{}/conversations.history", SLACK_API_BASE))
            .bearer_auth(&self.token)
            .query(&[("channel", source_id), ("limit", &max_count.to_string())])
            .send()
            .await
            .map_err(|e| EngineError::Fetch(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(EngineError::Fetch(format!(
                "conversations.history returned HTTP {}",
                status
            )));
        }

        let body: HistoryResponse = resp
            .json()
            .await
            .map_err(|e| EngineError::Fetch(e.to_string()))?;

        if !body.ok {
            return Err(EngineError::Fetch(format!(
                "conversations.history failed: {}",
                body.error.unwrap_or_else(|| "unknown error".to_string())
            )));
        }

        Ok(body
            .messages
            .into_iter()
            .map(|m| RawMessage {
                is_structural: m.subtype.is_some(),
                text: m.text,
                author: m.user,
                native_ts: m.ts,
            })
            .collect())
    }

    async fn list_available_sources(&self) -> Result<Vec<SourceChannel>> {
        let resp = self
            .client
            .get(format!("{}/conversations.list", SLACK_API_BASE))
            .bearer_auth(&self.token)
            .query(&[
                ("types", "public_channel,private_channel"),
                ("exclude_archived", "true"),
                ("limit", "100"),
            ])
            .send()
            .await
            .map_err(|e| EngineError::Fetch(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(EngineError::Fetch(format!(
                "conversations.list returned HTTP {}",
                status
            )));
        }

        let body: ListResponse = resp
            .json()
            .await
            .map_err(|e| EngineError::Fetch(e.to_string()))?;

        if !body.ok {
            return Err(EngineError::Fetch(format!(
                "conversations.list failed: {}",
                body.error.unwrap_or_else(|| "unknown error".to_string())
            )));
        }

        Ok(body
            .channels
            .into_iter()
            .filter(|c| c.is_member)
            .map(|c| SourceChannel {
                id: c.id,
                display_name: c.name,
            })
            .collect())
    }
}
