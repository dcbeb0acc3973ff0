//! Ollama chat API over HTTP, shared by the cloud and local backends.

use std::time::Duration;

use pickr_core::{ChatMessage, ChatOptions};
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;

use super::BackendError;

pub(crate) struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OllamaClient {
    /// `base_url` should be like `http://localhost:11434`; a trailing slash is dropped.
    pub(crate) fn new(
        base_url: &str,
        api_key: Option<String>,
        model: &str,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.is_empty()),
            model: model.to_string(),
        })
    }

    pub(crate) fn model(&self) -> &str {
        &self.model
    }

    pub(crate) fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    /// List installed models; used as the health probe.
    pub(crate) async fn tags(&self) -> Result<Vec<String>, BackendError> {
        let url = format!("{}/api/tags", self.base_url);
        let resp = self.authorize(self.client.get(&url)).send().await?;
        let v: Value = read_json(resp).await?;
        Ok(model_names(&v))
    }

    pub(crate) async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<String, BackendError> {
        let url = format!("{}/api/chat", self.base_url);
        let body = chat_body(&self.model, messages, options);
        debug!(model = %self.model, messages = messages.len(), json = options.json, "chat request");

        let resp = self.authorize(self.client.post(&url)).json(&body).send().await?;
        let v: Value = read_json(resp).await?;
        match extract_content(&v) {
            Some(content) if !content.trim().is_empty() => Ok(content),
            _ => Err(BackendError::EmptyResponse),
        }
    }

    /// POST a JSON body to `path` and decode the reply.
    pub(crate) async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
    ) -> Result<T, BackendError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.authorize(self.client.post(&url)).json(body).send().await?;
        read_json(resp).await
    }
}

async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, BackendError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(BackendError::Server {
            status: status.as_u16(),
            body,
        });
    }
    let bytes = resp.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Request body for `/api/chat` with streaming disabled.
pub(crate) fn chat_body(model: &str, messages: &[ChatMessage], options: &ChatOptions) -> Value {
    let mut body = json!({
        "model": model,
        "messages": messages,
        "stream": false,
    });
    if options.json {
        body["format"] = json!("json");
    }
    if let Some(t) = options.temperature {
        body["options"] = json!({ "temperature": t });
    }
    body
}

/// Assistant text from an Ollama reply, or from an OpenAI-style reply.
pub(crate) fn extract_content(v: &Value) -> Option<String> {
    v.get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .or_else(|| {
            v.get("choices")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("message"))
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_str())
        })
        .map(|s| s.to_string())
}

fn model_names(v: &Value) -> Vec<String> {
    v.get("models")
        .and_then(|m| m.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|m| {
                    m.get("name")
                        .and_then(|s| s.as_str())
                        .or_else(|| m.get("model").and_then(|s| s.as_str()))
                })
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}
