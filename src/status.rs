use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::chunker::Chunk;
use crate::output::OutputSink;

/// One chunk reached the manifest builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Count {
    pub skipped: bool,
    pub size: u64,
}

impl Count {
    pub fn of(chunk: &Chunk) -> Self {
        Self {
            skipped: chunk.skipped,
            size: chunk.size,
        }
    }
}

/// Progress of one upload session.
///
/// Only the counting task writes these; everyone else takes snapshots.
#[derive(Debug)]
pub struct Status {
    total: u64,
    completed: AtomicU64,
    skipped: AtomicU64,
    bytes: AtomicU64,
    start: Instant,
}

impl Status {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            completed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    fn record(&self, count: Count) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if count.skipped {
            self.skipped.fetch_add(1, Ordering::Relaxed);
        } else {
            self.bytes.fetch_add(count.size, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            elapsed: self.start.elapsed(),
            total: self.total,
            completed: self.completed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusSnapshot {
    pub elapsed: Duration,
    pub total: u64,
    /// Uploaded or skipped.
    pub completed: u64,
    pub skipped: u64,
    /// Bytes uploaded, not counting skipped chunks.
    pub bytes: u64,
}

impl StatusSnapshot {
    pub fn chunks_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.completed as f64 / secs
    }
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Completed {}/{} chunks ({} skipped), uploaded {} bytes in {:.1?} ({:.2} chunks/s)",
            self.completed,
            self.total,
            self.skipped,
            self.bytes,
            self.elapsed,
            self.chunks_per_second(),
        )
    }
}

/// Drains `counts` into `status` until the stream closes.
pub fn spawn_counter(status: Arc<Status>, mut counts: mpsc::UnboundedReceiver<Count>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(count) = counts.recv().await {
            status.record(count);
        }
    })
}

/// Writes a snapshot every `interval`, and a final one once `stop` fires.
pub fn spawn_reporter(
    status: Arc<Status>,
    output: OutputSink,
    interval: Duration,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if !interval.is_zero() {
            let mut ticks = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticks.tick() => output.line(status.snapshot()),
                }
            }
        } else {
            stop.cancelled().await;
        }
        output.line(status.snapshot());
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counter_tallies_events() {
        let status = Arc::new(Status::new(3));
        let (tx, rx) = mpsc::unbounded_channel();
        let counter = spawn_counter(Arc::clone(&status), rx);

        tx.send(Count { skipped: false, size: 10 }).unwrap();
        tx.send(Count { skipped: true, size: 10 }).unwrap();
        tx.send(Count { skipped: false, size: 4 }).unwrap();
        drop(tx);
        counter.await.unwrap();

        let snapshot = status.snapshot();
        assert_eq!(snapshot.total, 3);
        assert_eq!(snapshot.completed, 3);
        assert_eq!(snapshot.skipped, 1);
        assert_eq!(snapshot.bytes, 14);
    }

    #[tokio::test(start_paused = true)]
    async fn reporter_prints_periodically_and_at_the_end() {
        let status = Arc::new(Status::new(10));
        let (output, captured) = OutputSink::capture();
        let stop = CancellationToken::new();
        let reporter = spawn_reporter(
            Arc::clone(&status),
            output,
            Duration::from_secs(60),
            stop.clone(),
        );

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert_eq!(captured.lines().len(), 2);

        stop.cancel();
        reporter.await.unwrap();
        let lines = captured.lines();
        assert_eq!(lines.len(), 3);
        assert!(lines[2].starts_with("Completed 0/10 chunks (0 skipped)"));
    }
}
