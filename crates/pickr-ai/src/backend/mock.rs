//! In-process backends for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use pickr_core::{BackendKind, ChatMessage, ChatOptions};

use super::{BackendError, ChatBackend};

type Responder = Box<dyn Fn(&[ChatMessage]) -> Option<String> + Send + Sync>;

/// Backend that answers from a script.
///
/// Each call takes the next queued reply; when the queue is empty the
/// responder (if any) is consulted. Every call's messages are recorded.
pub struct ScriptedBackend {
    kind: BackendKind,
    healthy: AtomicBool,
    replies: Mutex<VecDeque<Result<String, String>>>,
    responder: Option<Responder>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScriptedBackend {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            healthy: AtomicBool::new(true),
            replies: Mutex::new(VecDeque::new()),
            responder: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue a successful reply.
    pub fn with_reply(self, reply: impl Into<String>) -> Self {
        lock(&self.replies).push_back(Ok(reply.into()));
        self
    }

    /// Queue a failed call.
    pub fn with_failure(self, message: impl Into<String>) -> Self {
        lock(&self.replies).push_back(Err(message.into()));
        self
    }

    /// Answer calls computed from their messages once the queue is drained.
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&[ChatMessage]) -> Option<String> + Send + Sync + 'static,
    {
        self.responder = Some(Box::new(responder));
        self
    }

    pub fn unhealthy(self) -> Self {
        self.healthy.store(false, Ordering::SeqCst);
        self
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Messages of every call so far, in call order.
    pub fn calls(&self) -> Vec<Vec<ChatMessage>> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn model(&self) -> &str {
        "scripted"
    }

    async fn check_status(&self) -> Result<(), BackendError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::Server {
                status: 503,
                body: "scripted backend marked unhealthy".to_string(),
            })
        }
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        _options: &ChatOptions,
    ) -> Result<String, BackendError> {
        lock(&self.calls).push(messages.to_vec());
        let queued = lock(&self.replies).pop_front();
        match queued {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(body)) => Err(BackendError::Server { status: 500, body }),
            None => self
                .responder
                .as_ref()
                .and_then(|r| r(messages))
                .ok_or(BackendError::EmptyResponse),
        }
    }
}

/// Backend that is healthy but fails every chat call.
pub struct FailingBackend {
    pub kind: BackendKind,
}

#[async_trait]
impl ChatBackend for FailingBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn model(&self) -> &str {
        "failing"
    }

    async fn check_status(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn chat(
        &self,
        _messages: &[ChatMessage],
        _options: &ChatOptions,
    ) -> Result<String, BackendError> {
        Err(BackendError::Server {
            status: 500,
            body: "backend failed (mock)".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NoopObserver;
    use pickr_core::BatchRequest;

    #[tokio::test]
    async fn queue_then_responder() {
        let backend = ScriptedBackend::new(BackendKind::Local)
            .with_reply("first")
            .with_failure("boom")
            .with_responder(|msgs| Some(format!("echo {}", msgs[0].content)));

        let opts = ChatOptions::default();
        let msgs = [ChatMessage::user("x")];
        assert_eq!(backend.chat(&msgs, &opts).await.unwrap(), "first");
        assert!(backend.chat(&msgs, &opts).await.is_err());
        assert_eq!(backend.chat(&msgs, &opts).await.unwrap(), "echo x");
        assert_eq!(backend.call_count(), 3);
    }

    #[tokio::test]
    async fn sequential_batch_keeps_order() {
        let backend = ScriptedBackend::new(BackendKind::Local)
            .with_responder(|msgs| Some(msgs[0].content.to_uppercase()));
        let requests = ["a", "b", "c"]
            .iter()
            .map(|s| BatchRequest::new(*s, vec![ChatMessage::user(*s)], ChatOptions::default()))
            .collect();

        let results = backend.chat_batch(requests, &NoopObserver).await;
        let out: Vec<String> = results.into_iter().map(|r| r.response.unwrap()).collect();
        assert_eq!(out, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn health_can_be_toggled() {
        let backend = ScriptedBackend::new(BackendKind::Cloud).unhealthy();
        assert!(backend.check_status().await.is_err());
        backend.set_healthy(true);
        assert!(backend.check_status().await.is_ok());

        let failing = FailingBackend {
            kind: BackendKind::Local,
        };
        assert!(failing.check_status().await.is_ok());
        assert!(failing.chat(&[], &ChatOptions::default()).await.is_err());
    }
}
