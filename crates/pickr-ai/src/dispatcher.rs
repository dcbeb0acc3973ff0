//! One `ask` / `ask_batch` surface over whichever backend is active.
//!
//! State moves `Uninitialized → CloudActive | LocalActive`, or to
//! `Unavailable` when neither backend passes its health check. The active
//! backend only changes through [`UnifiedDispatcher::ensure_ready`] and the
//! `switch_to_*` methods, each of which health-checks before committing.

use std::sync::{Arc, PoisonError, RwLock};

use pickr_core::{BackendConfig, BackendKind, BatchRequest, ChatMessage, ChatOptions};
use thiserror::Error;
use tracing::{info, warn};

use crate::backend::{
    BackendError, BatchObserver, BatchResult, ChatBackend, CloudBackend, LocalBackend, NoopObserver,
};
use crate::scheduler::FairBatchScheduler;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("dispatcher used before ensure_ready selected a backend")]
    NotReady,
    #[error("no backend available (cloud: {cloud}; local: {local})")]
    Unavailable { cloud: String, local: String },
    #[error("{0} backend is not configured")]
    NotConfigured(BackendKind),
    #[error("{kind} backend failed health check: {source}")]
    Unhealthy {
        kind: BackendKind,
        #[source]
        source: BackendError,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Uninitialized,
    CloudActive,
    LocalActive,
    Unavailable,
}

struct Active {
    state: DispatcherState,
    backend: Option<Arc<dyn ChatBackend>>,
}

pub struct UnifiedDispatcher {
    cloud: Option<Arc<dyn ChatBackend>>,
    local: Option<Arc<dyn ChatBackend>>,
    prefer: BackendKind,
    active: RwLock<Active>,
}

impl UnifiedDispatcher {
    /// Build from already-constructed backends, preferring cloud.
    pub fn new(cloud: Option<Arc<dyn ChatBackend>>, local: Option<Arc<dyn ChatBackend>>) -> Self {
        Self {
            cloud,
            local,
            prefer: BackendKind::Cloud,
            active: RwLock::new(Active {
                state: DispatcherState::Uninitialized,
                backend: None,
            }),
        }
    }

    pub fn with_preference(mut self, prefer: BackendKind) -> Self {
        self.prefer = prefer;
        self
    }

    /// Build the HTTP backends described by `config`.
    ///
    /// The cloud backend shares `scheduler` with every other cloud caller.
    pub fn from_config(
        config: &BackendConfig,
        scheduler: Arc<FairBatchScheduler>,
    ) -> Result<Self, BackendError> {
        let cloud = match &config.cloud {
            Some(c) => Some(Arc::new(CloudBackend::new(c, scheduler)?) as Arc<dyn ChatBackend>),
            None => None,
        };
        let local = match &config.local {
            Some(c) => Some(Arc::new(LocalBackend::new(c)?) as Arc<dyn ChatBackend>),
            None => None,
        };
        Ok(Self::new(cloud, local).with_preference(config.prefer))
    }

    pub fn state(&self) -> DispatcherState {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    pub fn active_kind(&self) -> Option<BackendKind> {
        match self.state() {
            DispatcherState::CloudActive => Some(BackendKind::Cloud),
            DispatcherState::LocalActive => Some(BackendKind::Local),
            _ => None,
        }
    }

    /// Classification batch size suited to the active (or preferred) backend.
    pub fn default_batch_size(&self) -> usize {
        self.active_kind()
            .unwrap_or(self.prefer)
            .default_batch_size()
    }

    fn configured(&self, kind: BackendKind) -> Option<&Arc<dyn ChatBackend>> {
        match kind {
            BackendKind::Cloud => self.cloud.as_ref(),
            BackendKind::Local => self.local.as_ref(),
        }
    }

    fn commit(&self, state: DispatcherState, backend: Option<Arc<dyn ChatBackend>>) {
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        active.state = state;
        active.backend = backend;
    }

    async fn probe(&self, kind: BackendKind) -> Result<Arc<dyn ChatBackend>, DispatchError> {
        let backend = self
            .configured(kind)
            .ok_or(DispatchError::NotConfigured(kind))?;
        backend
            .check_status()
            .await
            .map_err(|source| DispatchError::Unhealthy { kind, source })?;
        Ok(Arc::clone(backend))
    }

    /// Select a backend: the preferred one if healthy, otherwise the other.
    ///
    /// Returns the already-active backend without re-probing.
    pub async fn ensure_ready(&self) -> Result<BackendKind, DispatchError> {
        if let Some(kind) = self.active_kind() {
            return Ok(kind);
        }

        let preferred = self.prefer;
        let first = match self.probe(preferred).await {
            Ok(backend) => {
                self.activate(preferred, backend);
                return Ok(preferred);
            }
            Err(e) => e,
        };
        warn!(
            backend = %preferred,
            error = %first,
            "preferred backend unavailable, trying fallback"
        );

        let fallback = preferred.other();
        match self.probe(fallback).await {
            Ok(backend) => {
                self.activate(fallback, backend);
                Ok(fallback)
            }
            Err(second) => {
                self.commit(DispatcherState::Unavailable, None);
                let (cloud, local) = match preferred {
                    BackendKind::Cloud => (first, second),
                    BackendKind::Local => (second, first),
                };
                Err(DispatchError::Unavailable {
                    cloud: cloud.to_string(),
                    local: local.to_string(),
                })
            }
        }
    }

    fn activate(&self, kind: BackendKind, backend: Arc<dyn ChatBackend>) {
        info!(backend = %kind, model = backend.model(), "backend active");
        let state = match kind {
            BackendKind::Cloud => DispatcherState::CloudActive,
            BackendKind::Local => DispatcherState::LocalActive,
        };
        self.commit(state, Some(backend));
    }

    pub async fn switch_to_cloud(&self) -> Result<(), DispatchError> {
        self.switch_to(BackendKind::Cloud).await
    }

    pub async fn switch_to_local(&self) -> Result<(), DispatchError> {
        self.switch_to(BackendKind::Local).await
    }

    /// Health-check `kind` and make it active. On failure nothing changes.
    pub async fn switch_to(&self, kind: BackendKind) -> Result<(), DispatchError> {
        let backend = self.probe(kind).await?;
        self.activate(kind, backend);
        Ok(())
    }

    fn current(&self) -> Result<Arc<dyn ChatBackend>, DispatchError> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .backend
            .clone()
            .ok_or(DispatchError::NotReady)
    }

    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<String, DispatchError> {
        let backend = self.current()?;
        Ok(backend.chat(messages, options).await?)
    }

    /// Single prompt with an optional system instruction.
    pub async fn ask(
        &self,
        system: Option<&str>,
        prompt: &str,
        options: &ChatOptions,
    ) -> Result<String, DispatchError> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(prompt));
        self.chat(&messages, options).await
    }

    pub async fn chat_batch(
        &self,
        requests: Vec<BatchRequest>,
    ) -> Result<Vec<BatchResult>, DispatchError> {
        self.chat_batch_observed(requests, &NoopObserver).await
    }

    /// Like [`chat_batch`](Self::chat_batch), notifying `observer` per completion.
    pub async fn chat_batch_observed(
        &self,
        requests: Vec<BatchRequest>,
        observer: &dyn BatchObserver,
    ) -> Result<Vec<BatchResult>, DispatchError> {
        let backend = self.current()?;
        Ok(backend.chat_batch(requests, observer).await)
    }

    /// One request per prompt, all sharing `system` and `options`.
    ///
    /// Result ids are the prompt indices.
    pub async fn ask_batch(
        &self,
        system: Option<&str>,
        prompts: &[String],
        options: &ChatOptions,
    ) -> Result<Vec<BatchResult>, DispatchError> {
        let requests = prompts
            .iter()
            .enumerate()
            .map(|(i, prompt)| {
                let mut messages = Vec::with_capacity(2);
                if let Some(system) = system {
                    messages.push(ChatMessage::system(system));
                }
                messages.push(ChatMessage::user(prompt.as_str()));
                BatchRequest::new(i.to_string(), messages, options.clone())
            })
            .collect();
        self.chat_batch(requests).await
    }
}
