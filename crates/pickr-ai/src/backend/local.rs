//! On-premises backend. One request at a time; batches use the sequential default.

use std::time::Duration;

use async_trait::async_trait;
use pickr_core::{BackendKind, ChatMessage, ChatOptions, LocalConfig};
use tracing::debug;

use super::wire::OllamaClient;
use super::{BackendError, ChatBackend};

pub struct LocalBackend {
    client: OllamaClient,
}

impl LocalBackend {
    pub fn new(config: &LocalConfig) -> Result<Self, BackendError> {
        let client = OllamaClient::new(
            &config.endpoint,
            None,
            &config.model,
            Duration::from_secs(config.timeout_secs),
        )?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ChatBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn model(&self) -> &str {
        self.client.model()
    }

    /// Reachable and the configured model is installed.
    async fn check_status(&self) -> Result<(), BackendError> {
        let models = self.client.tags().await?;
        let wanted = self.client.model();
        let installed = models
            .iter()
            .any(|m| m == wanted || m.split(':').next() == Some(wanted));
        debug!(model = wanted, installed, available = models.len(), "local status");
        if installed {
            Ok(())
        } else {
            Err(BackendError::Server {
                status: 404,
                body: format!("model {wanted} is not installed"),
            })
        }
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<String, BackendError> {
        self.client.chat(messages, options).await
    }
}
