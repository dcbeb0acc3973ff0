//! Backend clients: one uniform chat surface over each model environment.

mod cloud;
mod local;
#[cfg(test)]
mod mock;
mod wire;

pub use cloud::{CloudBackend, WebPage, WebSearchResult};
pub use local::LocalBackend;
#[cfg(test)]
pub(crate) use mock::{FailingBackend, ScriptedBackend};

use std::future::Future;

use async_trait::async_trait;
use futures::StreamExt;
use pickr_core::{BackendKind, BatchRequest, ChatMessage, ChatOptions};
use thiserror::Error;

use crate::scheduler::FairBatchScheduler;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {body}")]
    Server { status: u16, body: String },
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("model returned no content")]
    EmptyResponse,
    #[error("no API key configured for {0} backend")]
    MissingApiKey(BackendKind),
}

/// Outcome of one [`BatchRequest`], carrying the request's `id`.
#[derive(Debug)]
pub struct BatchResult {
    pub id: String,
    pub response: Result<String, BackendError>,
}

/// Notified as each request of a batch completes, in completion order.
///
/// `index` is the request's position in the submitted batch.
pub trait BatchObserver: Send + Sync {
    fn on_complete(&self, index: usize, result: &BatchResult);
}

/// Observer that ignores completions.
pub struct NoopObserver;

impl BatchObserver for NoopObserver {
    fn on_complete(&self, _index: usize, _result: &BatchResult) {}
}

/// The capability set every backend provides.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn model(&self) -> &str;

    /// Succeeds when the backend is reachable and usable.
    async fn check_status(&self) -> Result<(), BackendError>;

    async fn chat(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<String, BackendError>;

    /// Run every request and return results in request order.
    ///
    /// The default runs requests strictly one at a time.
    async fn chat_batch(
        &self,
        requests: Vec<BatchRequest>,
        observer: &dyn BatchObserver,
    ) -> Vec<BatchResult> {
        let mut results = Vec::with_capacity(requests.len());
        for (index, request) in requests.into_iter().enumerate() {
            let response = self.chat(&request.messages, &request.options).await;
            let result = BatchResult {
                id: request.id,
                response,
            };
            observer.on_complete(index, &result);
            results.push(result);
        }
        results
    }
}

/// Run a batch under the scheduler gate with up to `parallelism` requests in flight.
///
/// The gate is held for the whole batch. Completions may arrive in any order;
/// the returned vector is index-aligned with `requests`.
pub async fn dispatch_gated<F, Fut>(
    scheduler: &FairBatchScheduler,
    requests: Vec<BatchRequest>,
    parallelism: usize,
    observer: &dyn BatchObserver,
    call: F,
) -> Vec<BatchResult>
where
    F: Fn(BatchRequest) -> Fut,
    Fut: Future<Output = Result<String, BackendError>>,
{
    if requests.is_empty() {
        return Vec::new();
    }

    let total = requests.len();
    let _permit = scheduler.acquire().await;
    tracing::debug!(requests = total, parallelism, "dispatching gated batch");

    let mut slots: Vec<Option<BatchResult>> = (0..total).map(|_| None).collect();
    let mut in_flight = futures::stream::iter(requests.into_iter().enumerate().map(
        |(index, request)| {
            let id = request.id.clone();
            let pending = call(request);
            async move {
                let result = BatchResult {
                    id,
                    response: pending.await,
                };
                (index, result)
            }
        },
    ))
    .buffer_unordered(parallelism.max(1));

    while let Some((index, result)) = in_flight.next().await {
        observer.on_complete(index, &result);
        slots[index] = Some(result);
    }

    slots.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    fn requests(prefix: &str, n: usize) -> Vec<BatchRequest> {
        (0..n)
            .map(|i| {
                BatchRequest::new(
                    format!("{prefix}{i}"),
                    vec![ChatMessage::user(format!("{prefix}{i}"))],
                    ChatOptions::default(),
                )
            })
            .collect()
    }

    #[derive(Debug)]
    struct Event {
        id: String,
        started: Instant,
        finished: Instant,
    }

    async fn record(
        log: &Mutex<Vec<Event>>,
        request: BatchRequest,
        delay_ms: u64,
    ) -> Result<String, BackendError> {
        let started = Instant::now();
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        let finished = Instant::now();
        log.lock().unwrap().push(Event {
            id: request.id.clone(),
            started,
            finished,
        });
        Ok(request.id)
    }

    #[tokio::test]
    async fn results_are_index_aligned_despite_completion_order() {
        let scheduler = FairBatchScheduler::new();
        let log = Mutex::new(Vec::new());

        // Later requests finish first.
        let results = dispatch_gated(&scheduler, requests("r", 4), 4, &NoopObserver, |req| {
            let delay = 40 - 10 * req.id[1..].parse::<u64>().unwrap();
            record(&log, req, delay)
        })
        .await;

        let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["r0", "r1", "r2", "r3"]);
        let echoed: Vec<String> = results.into_iter().map(|r| r.response.unwrap()).collect();
        assert_eq!(echoed, vec!["r0", "r1", "r2", "r3"]);

        let finish_order: Vec<String> =
            log.lock().unwrap().iter().map(|e| e.id.clone()).collect();
        assert_eq!(finish_order[0], "r3");
    }

    #[tokio::test]
    async fn concurrent_callers_are_serialised_batch_by_batch() {
        let scheduler = Arc::new(FairBatchScheduler::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let caller_a = dispatch_gated(&scheduler, requests("a", 3), 3, &NoopObserver, |req| {
            record(&log, req, 20)
        });
        let caller_b = dispatch_gated(&scheduler, requests("b", 3), 3, &NoopObserver, |req| {
            record(&log, req, 5)
        });
        let (a, b) = tokio::join!(caller_a, caller_b);
        assert_eq!(a.len(), 3);
        assert_eq!(b.len(), 3);

        let events = log.lock().unwrap();
        let last_a_finish = events
            .iter()
            .filter(|e| e.id.starts_with('a'))
            .map(|e| e.finished)
            .max()
            .unwrap();
        let first_b_start = events
            .iter()
            .filter(|e| e.id.starts_with('b'))
            .map(|e| e.started)
            .min()
            .unwrap();
        assert!(
            last_a_finish <= first_b_start,
            "caller B dispatched before caller A's batch finished"
        );
        assert!(!scheduler.is_locked());
    }

    #[tokio::test]
    async fn parallelism_bounds_requests_in_flight() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let scheduler = FairBatchScheduler::new();
        let current = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        let results = dispatch_gated(&scheduler, requests("p", 6), 2, &NoopObserver, |req| {
            let (current, peak) = (&current, &peak);
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, BackendError>(req.id)
            }
        })
        .await;

        assert_eq!(results.len(), 6);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn observer_sees_every_completion() {
        struct Count(Mutex<Vec<usize>>);
        impl BatchObserver for Count {
            fn on_complete(&self, index: usize, _result: &BatchResult) {
                self.0.lock().unwrap().push(index);
            }
        }

        let scheduler = FairBatchScheduler::new();
        let log = Mutex::new(Vec::new());
        let observer = Count(Mutex::new(Vec::new()));
        dispatch_gated(&scheduler, requests("o", 5), 3, &observer, |req| {
            record(&log, req, 1)
        })
        .await;

        let mut seen = observer.0.into_inner().unwrap();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn empty_batch_does_not_take_gate() {
        let scheduler = FairBatchScheduler::new();
        let _held = scheduler.acquire().await;
        let results = dispatch_gated(&scheduler, Vec::new(), 4, &NoopObserver, |_req| async {
            Ok::<_, BackendError>(String::new())
        })
        .await;
        assert!(results.is_empty());
    }
}
