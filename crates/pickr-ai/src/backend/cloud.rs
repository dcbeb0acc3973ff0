//! Remote, metered backend with concurrent batch dispatch.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pickr_core::{BackendKind, BatchRequest, ChatMessage, ChatOptions, CloudConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::wire::OllamaClient;
use super::{BackendError, BatchObserver, BatchResult, ChatBackend, dispatch_gated};
use crate::scheduler::FairBatchScheduler;

/// Cloud backend. Batches run up to `parallelism` requests at once, and the
/// whole batch holds the shared [`FairBatchScheduler`] gate.
pub struct CloudBackend {
    client: OllamaClient,
    parallelism: usize,
    scheduler: Arc<FairBatchScheduler>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSearchResult {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Deserialize)]
struct WebSearchResponse {
    #[serde(default)]
    results: Vec<WebSearchResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebPage {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub links: Vec<String>,
}

impl CloudBackend {
    pub fn new(
        config: &CloudConfig,
        scheduler: Arc<FairBatchScheduler>,
    ) -> Result<Self, BackendError> {
        let client = OllamaClient::new(
            &config.host,
            Some(config.api_key.clone()),
            &config.model,
            Duration::from_secs(config.timeout_secs),
        )?;
        Ok(Self {
            client,
            parallelism: config.parallelism.max(1),
            scheduler,
        })
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Search the web through the cloud API.
    pub async fn web_search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<WebSearchResult>, BackendError> {
        self.require_key()?;
        let body = json!({ "query": query, "max_results": max_results });
        let resp: WebSearchResponse = self.client.post_json("/api/web_search", &body).await?;
        info!(query, count = resp.results.len(), "web search complete");
        Ok(resp.results)
    }

    /// Fetch one page's title, text content, and links.
    pub async fn web_fetch(&self, url: &str) -> Result<WebPage, BackendError> {
        self.require_key()?;
        self.client
            .post_json("/api/web_fetch", &json!({ "url": url }))
            .await
    }

    fn require_key(&self) -> Result<(), BackendError> {
        if self.client.has_api_key() {
            Ok(())
        } else {
            Err(BackendError::MissingApiKey(BackendKind::Cloud))
        }
    }
}

#[async_trait]
impl ChatBackend for CloudBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cloud
    }

    fn model(&self) -> &str {
        self.client.model()
    }

    async fn check_status(&self) -> Result<(), BackendError> {
        self.require_key()?;
        self.client.tags().await.map(|_| ())
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<String, BackendError> {
        self.client.chat(messages, options).await
    }

    async fn chat_batch(
        &self,
        requests: Vec<BatchRequest>,
        observer: &dyn BatchObserver,
    ) -> Vec<BatchResult> {
        dispatch_gated(&self.scheduler, requests, self.parallelism, observer, |request| async move {
            self.client.chat(&request.messages, &request.options).await
        })
        .await
    }
}
