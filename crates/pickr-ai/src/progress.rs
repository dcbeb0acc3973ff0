//! Progress events as a stream.
//!
//! A pipeline reports through [`ProgressReporter`]; the caller consumes the
//! matching [`ProgressStream`]. Events never go backwards, repeats are
//! suppressed, and [`ProgressReporter::finish`] makes the last event equal
//! the total on every exit path.

use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use futures::Stream;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::backend::{BatchObserver, BatchResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

/// Create a connected reporter/stream pair.
pub fn channel() -> (ProgressReporter, ProgressStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ProgressReporter {
            tx,
            last: Mutex::new(None),
        },
        ProgressStream { rx },
    )
}

pub struct ProgressReporter {
    tx: mpsc::UnboundedSender<Progress>,
    last: Mutex<Option<usize>>,
}

impl ProgressReporter {
    /// Emit `completed` of `total`, unless it would not advance.
    pub fn report(&self, completed: usize, total: usize) {
        let completed = completed.min(total);
        let mut last = self.last.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if last.is_some_and(|prev| completed <= prev) {
            return;
        }
        *last = Some(completed);
        // A dropped stream just means nobody is listening.
        let _ = self.tx.send(Progress { completed, total });
    }

    /// Emit the terminal `total` event if it has not been sent yet.
    pub fn finish(&self, total: usize) {
        self.report(total, total);
    }
}

pub struct ProgressStream {
    rx: mpsc::UnboundedReceiver<Progress>,
}

impl Stream for ProgressStream {
    type Item = Progress;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Progress>> {
        self.rx.poll_recv(cx)
    }
}

/// Turns per-request completions into item-level progress.
///
/// `sizes[i]` is the number of items carried by request `i`.
pub(crate) struct ChunkProgress<'a> {
    sizes: Vec<usize>,
    base: usize,
    done: AtomicUsize,
    total: usize,
    reporter: Option<&'a ProgressReporter>,
}

impl<'a> ChunkProgress<'a> {
    pub(crate) fn new(sizes: Vec<usize>, reporter: Option<&'a ProgressReporter>) -> Self {
        let total = sizes.iter().sum();
        Self {
            sizes,
            base: 0,
            done: AtomicUsize::new(0),
            total,
            reporter,
        }
    }

    /// Count `base` items as finished before any request completes.
    pub(crate) fn with_base(mut self, base: usize) -> Self {
        self.base = base;
        self.total += base;
        self
    }
}

impl BatchObserver for ChunkProgress<'_> {
    fn on_complete(&self, index: usize, _result: &BatchResult) {
        let size = self.sizes.get(index).copied().unwrap_or(0);
        let done = self.done.fetch_add(size, Ordering::SeqCst) + size;
        if let Some(reporter) = self.reporter {
            reporter.report(self.base + done, self.total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn suppresses_regressions_and_repeats() {
        let (reporter, stream) = channel();
        reporter.report(3, 10);
        reporter.report(2, 10);
        reporter.report(3, 10);
        reporter.report(7, 10);
        reporter.finish(10);
        reporter.finish(10);
        drop(reporter);

        let seen: Vec<usize> = stream.map(|p| p.completed).collect().await;
        assert_eq!(seen, vec![3, 7, 10]);
    }

    #[tokio::test]
    async fn finish_on_empty_input_emits_zero_of_zero() {
        let (reporter, stream) = channel();
        reporter.finish(0);
        drop(reporter);

        let seen: Vec<Progress> = stream.collect().await;
        assert_eq!(
            seen,
            vec![Progress {
                completed: 0,
                total: 0
            }]
        );
    }

    #[tokio::test]
    async fn chunk_progress_counts_items_not_requests() {
        let (reporter, stream) = channel();
        let observer = ChunkProgress::new(vec![3, 3, 1], Some(&reporter));
        let ok = |id: &str| BatchResult {
            id: id.to_string(),
            response: Ok(String::new()),
        };
        observer.on_complete(2, &ok("2"));
        observer.on_complete(0, &ok("0"));
        observer.on_complete(1, &ok("1"));
        drop(observer);
        drop(reporter);

        let seen: Vec<usize> = stream.map(|p| p.completed).collect().await;
        assert_eq!(seen, vec![1, 4, 7]);
    }

    #[test]
    fn reporting_without_listener_is_harmless() {
        let (reporter, stream) = channel();
        drop(stream);
        reporter.report(1, 2);
        reporter.finish(2);
    }
}
