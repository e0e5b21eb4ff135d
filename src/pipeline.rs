//! Composable pipeline stages over bounded channels.
//!
//! Every stage is a spawned task that reads from one or more bounded
//! [`mpsc`] receivers and writes into bounded senders. A full downstream queue
//! suspends the producer, which is the only flow control in the pipeline.
//! A stage's output closes once its inputs are closed and all of its work has
//! finished, because that is when the last sender is dropped.
//!
//! ```text
//!                ┌──▶ matched ───────────────────────┐
//! input ─▶ separate                                  join ─▶ counter ─▶ …
//!                └──▶ unmatched ─▶ divide ─▶ [N workers] ─▶ join ──┘
//! ```

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::error::StageError;

/// Collects stage errors from any number of stages.
///
/// The queue is unbounded so reporting never blocks a stage: errors are only
/// drained once the whole pipeline has finished. When bound to a manifest
/// builder, the index of every dropped item is also forwarded as a gap so the
/// builder does not wait for it.
#[derive(Debug, Clone)]
pub struct ErrorSink {
    errors: mpsc::UnboundedSender<StageError>,
    gaps: Option<mpsc::UnboundedSender<u64>>,
}

impl ErrorSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StageError>) {
        let (errors, rx) = mpsc::unbounded_channel();
        (Self { errors, gaps: None }, rx)
    }

    /// A sink that also reports dropped indices to `gaps`.
    pub fn with_gaps(&self, gaps: mpsc::UnboundedSender<u64>) -> Self {
        Self {
            errors: self.errors.clone(),
            gaps: Some(gaps),
        }
    }

    pub fn report(&self, err: StageError) {
        tracing::warn!(error = %err, "stage error");
        if let (Some(gaps), Some(index)) = (&self.gaps, err.index()) {
            let _ = gaps.send(index);
        }
        let _ = self.errors.send(err);
    }
}

/// Applies an async, fallible step to every item.
///
/// `Ok(None)` drops the item silently, `Err` drops it and reports the error.
/// Items are processed one at a time, in order.
pub fn transform<T, U, F, Fut>(
    mut input: mpsc::Receiver<T>,
    errors: ErrorSink,
    depth: usize,
    mut f: F,
) -> mpsc::Receiver<U>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnMut(T) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Option<U>, StageError>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(depth);
    tokio::spawn(async move {
        while let Some(item) = input.recv().await {
            match f(item).await {
                Ok(Some(out)) => {
                    if tx.send(out).await.is_err() {
                        tracing::debug!("downstream closed, stopping stage");
                        break;
                    }
                }
                Ok(None) => {}
                Err(err) => errors.report(err),
            }
        }
    });
    rx
}

/// Applies a synchronous, infallible step to every item.
pub fn map<T, U, F>(mut input: mpsc::Receiver<T>, depth: usize, mut f: F) -> mpsc::Receiver<U>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnMut(T) -> U + Send + 'static,
{
    let (tx, rx) = mpsc::channel(depth);
    tokio::spawn(async move {
        while let Some(item) = input.recv().await {
            if tx.send(f(item)).await.is_err() {
                break;
            }
        }
    });
    rx
}

/// Splits one stream in two: `(matching, rest)`.
///
/// Each item goes to exactly one side, and keeps its relative order there.
pub fn separate<T, F>(
    mut input: mpsc::Receiver<T>,
    depth: usize,
    mut predicate: F,
) -> (mpsc::Receiver<T>, mpsc::Receiver<T>)
where
    T: Send + 'static,
    F: FnMut(&T) -> bool + Send + 'static,
{
    let (yes_tx, yes_rx) = mpsc::channel(depth);
    let (no_tx, no_rx) = mpsc::channel(depth);
    tokio::spawn(async move {
        while let Some(item) = input.recv().await {
            let side = if predicate(&item) { &yes_tx } else { &no_tx };
            if side.send(item).await.is_err() {
                tracing::debug!("separate: one side closed early");
            }
        }
    });
    (yes_rx, no_rx)
}

/// Spreads one stream across `n` outputs.
///
/// Each output pulls its next item from the shared input as soon as it has
/// room, so a slow consumer does not hold up the others. Every output queues
/// up to `depth` items, so up to `n * depth` items sit between the input and
/// the consumers.
pub fn divide<T>(input: mpsc::Receiver<T>, n: usize, depth: usize) -> Vec<mpsc::Receiver<T>>
where
    T: Send + 'static,
{
    let input = Arc::new(Mutex::new(input));
    (0..n)
        .map(|_| {
            let input = Arc::clone(&input);
            let (tx, rx) = mpsc::channel(depth);
            tokio::spawn(async move {
                loop {
                    // reserve first, so no item is taken off the input without
                    // a place to put it
                    let Ok(permit) = tx.reserve().await else {
                        break;
                    };
                    let Some(item) = input.lock().await.recv().await else {
                        break;
                    };
                    permit.send(item);
                }
            });
            rx
        })
        .collect()
}

/// Merges streams in arrival order. Closes once every input has closed.
pub fn join<T>(inputs: Vec<mpsc::Receiver<T>>, depth: usize) -> mpsc::Receiver<T>
where
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel(depth);
    for mut input in inputs {
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(item) = input.recv().await {
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });
    }
    rx
}

/// Passes items through unchanged, emitting one event per item on the side.
///
/// The side channel is unbounded so a slow counter never stalls the data path.
pub fn counter<T, C, F>(
    mut input: mpsc::Receiver<T>,
    depth: usize,
    mut count: F,
) -> (mpsc::Receiver<T>, mpsc::UnboundedReceiver<C>)
where
    T: Send + 'static,
    C: Send + 'static,
    F: FnMut(&T) -> C + Send + 'static,
{
    let (tx, rx) = mpsc::channel(depth);
    let (count_tx, count_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(item) = input.recv().await {
            let _ = count_tx.send(count(&item));
            if tx.send(item).await.is_err() {
                break;
            }
        }
    });
    (rx, count_rx)
}

/// Feeds an iterator into a new bounded stream.
pub fn feed<I>(items: I, depth: usize) -> mpsc::Receiver<I::Item>
where
    I: IntoIterator + Send + 'static,
    I::IntoIter: Send,
    I::Item: Send + 'static,
{
    let (tx, rx) = mpsc::channel(depth);
    tokio::spawn(async move {
        for item in items {
            if tx.send(item).await.is_err() {
                break;
            }
        }
    });
    rx
}

/// Drains a stream into a `Vec`.
pub async fn collect<T>(mut input: mpsc::Receiver<T>) -> Vec<T> {
    let mut items = Vec::new();
    while let Some(item) = input.recv().await {
        items.push(item);
    }
    items
}
