//! Manifest documents and the index-ordering manifest builder.
//!
//! Segments finish uploading in any order, but the store concatenates them in
//! the order a manifest lists them. The builder therefore buffers arrivals in a
//! min-heap keyed by chunk index and only emits an entry once every lower index
//! has been emitted or is known never to arrive (a *gap*).

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::mem;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::chunker::Chunk;
use crate::digest::Digest;
use crate::error::StageError;
use crate::pipeline::ErrorSink;

/// A reference to one durable segment or sub-manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// `<container>/<object>`
    pub path: String,
    #[serde(rename = "etag", alias = "digest")]
    pub digest: Digest,
    #[serde(rename = "size_bytes", alias = "size")]
    pub size: u64,
}

pub fn serialize_manifest(entries: &[ManifestEntry]) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(entries)
}

pub fn parse_manifest(document: &[u8]) -> Result<Vec<ManifestEntry>, serde_json::Error> {
    serde_json::from_slice(document)
}

/// A full manifest's worth of entries.
#[derive(Debug, PartialEq, Eq)]
pub struct ManifestBatch {
    pub index: u64,
    pub entries: Vec<ManifestEntry>,
}

impl ManifestBatch {
    /// Total bytes of the logical object this batch describes.
    pub fn size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    pub fn into_chunk(self) -> Result<Chunk, StageError> {
        let size = self.size();
        let document = serialize_manifest(&self.entries).map_err(|source| StageError::Serialize {
            index: self.index,
            source,
        })?;
        Ok(Chunk {
            data: Some(document),
            ..Chunk::new(self.index, 0, size)
        })
    }
}

struct Pending {
    index: u64,
    entry: Option<ManifestEntry>,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.index.cmp(&other.index)
    }
}

/// Reorders entries by index and cuts them into batches of `limit`.
pub struct ManifestBuilder {
    limit: usize,
    next_index: u64,
    pending: BinaryHeap<Reverse<Pending>>,
    entries: Vec<ManifestEntry>,
    batches: u64,
}

impl ManifestBuilder {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            next_index: 0,
            pending: BinaryHeap::new(),
            entries: Vec::new(),
            batches: 0,
        }
    }

    /// Records the entry for `index`.
    pub fn insert(&mut self, index: u64, entry: ManifestEntry) {
        self.enqueue(index, Some(entry));
    }

    /// Records that `index` will never arrive.
    pub fn skip(&mut self, index: u64) {
        self.enqueue(index, None);
    }

    fn enqueue(&mut self, index: u64, entry: Option<ManifestEntry>) {
        if index < self.next_index {
            tracing::warn!(index, "manifest entry arrived after its position was passed");
            return;
        }
        self.pending.push(Reverse(Pending { index, entry }));
    }

    /// Number of arrivals waiting for a lower index.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Advances over everything that is now in order, returning a batch once
    /// `limit` entries have accumulated. Call until it returns `None`.
    pub fn next_batch(&mut self) -> Option<ManifestBatch> {
        while self.entries.len() < self.limit {
            match self.pending.peek() {
                Some(Reverse(next)) if next.index == self.next_index => {}
                _ => break,
            }
            let Reverse(next) = self.pending.pop()?;
            self.next_index += 1;
            self.entries.extend(next.entry);
        }
        (self.entries.len() >= self.limit).then(|| self.take_batch())
    }

    /// Flushes everything left, in index order, even across indices that
    /// never arrived. Produces one empty batch if nothing was ever emitted.
    pub fn finish(mut self) -> Vec<ManifestBatch> {
        let mut batches = Vec::new();
        while let Some(Reverse(next)) = self.pending.pop() {
            self.next_index = next.index + 1;
            self.entries.extend(next.entry);
            if self.entries.len() >= self.limit {
                batches.push(self.take_batch());
            }
        }
        if !self.entries.is_empty() || self.batches == 0 {
            batches.push(self.take_batch());
        }
        batches
    }

    fn take_batch(&mut self) -> ManifestBatch {
        let batch = ManifestBatch {
            index: self.batches,
            entries: mem::take(&mut self.entries),
        };
        self.batches += 1;
        batch
    }
}

/// Turns a stream of durable chunks into a stream of manifest chunks.
///
/// `gaps` delivers indices that were excluded or dropped upstream. With
/// `max_batches` set, batches beyond it are not emitted and a
/// [`StageError::TooManyManifests`] is reported instead.
pub fn build_manifests(
    mut input: mpsc::Receiver<Chunk>,
    mut gaps: mpsc::UnboundedReceiver<u64>,
    errors: ErrorSink,
    limit: usize,
    max_batches: Option<u64>,
    depth: usize,
) -> mpsc::Receiver<Chunk> {
    let (tx, rx) = mpsc::channel(depth);
    tokio::spawn(async move {
        let mut builder = ManifestBuilder::new(limit);
        let mut entries_seen = 0u64;
        let mut overflowed = false;
        let mut ready = Vec::new();

        loop {
            tokio::select! {
                biased;
                Some(index) = gaps.recv() => builder.skip(index),
                chunk = input.recv() => {
                    let Some(chunk) = chunk else { break };
                    match chunk.digest.clone() {
                        Some(digest) => {
                            entries_seen += 1;
                            builder.insert(chunk.index, ManifestEntry {
                                path: chunk.path(),
                                digest,
                                size: chunk.size,
                            });
                        }
                        None => {
                            tracing::warn!(index = chunk.index, "chunk reached the manifest without a digest");
                            builder.skip(chunk.index);
                        }
                    }
                }
            }
            while let Some(batch) = builder.next_batch() {
                ready.push(batch);
            }
            for batch in ready.drain(..) {
                if max_batches.is_some_and(|max| batch.index >= max) {
                    overflowed = true;
                    continue;
                }
                if !emit(&tx, &errors, batch).await {
                    return;
                }
            }
        }

        // everything upstream has finished, so all gaps are already queued
        while let Ok(index) = gaps.try_recv() {
            builder.skip(index);
        }
        for batch in builder.finish() {
            if max_batches.is_some_and(|max| batch.index >= max) {
                overflowed = true;
                continue;
            }
            if !emit(&tx, &errors, batch).await {
                return;
            }
        }
        if overflowed {
            errors.report(StageError::TooManyManifests {
                count: entries_seen,
                limit: limit as u64,
            });
        }
    });
    rx
}

/// Returns `false` once downstream has gone away.
async fn emit(tx: &mpsc::Sender<Chunk>, errors: &ErrorSink, batch: ManifestBatch) -> bool {
    tracing::debug!(index = batch.index, entries = batch.entries.len(), "manifest batch complete");
    match batch.into_chunk() {
        Ok(chunk) => tx.send(chunk).await.is_ok(),
        Err(err) => {
            errors.report(err);
            true
        }
    }
}
