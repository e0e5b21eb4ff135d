//! The chunk-level stages of an upload session.
//!
//! Each function takes a stream of [`Chunk`]s and returns the stream of
//! processed chunks, spawning the task that does the work. See
//! [`crate::pipeline`] for the primitives they are built from.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};

use crate::backend::Destination;
use crate::chunker::Chunk;
use crate::digest::{Digest, HashAlgorithm};
use crate::error::StageError;
use crate::output::OutputSink;
use crate::pipeline::{self, ErrorSink};
use crate::retry::RetryStrategy;
use crate::source::Source;

/// A deterministic object name pattern.
///
/// `{index}` is replaced by the zero-padded (4 digits) chunk index and `{size}`
/// by the chunk size in bytes. `{object}` is inserted last, so placeholders
/// inside the object name are kept as they are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameTemplate {
    template: String,
    object: String,
}

impl NameTemplate {
    pub fn new(template: &str, object: &str) -> Self {
        Self {
            template: template.to_owned(),
            object: object.to_owned(),
        }
    }

    pub fn render(&self, index: u64, size: u64) -> String {
        self.template
            .replace("{index}", &format!("{index:04}"))
            .replace("{size}", &size.to_string())
            .replace("{object}", &self.object)
    }
}

pub fn namer(input: mpsc::Receiver<Chunk>, template: NameTemplate, depth: usize) -> mpsc::Receiver<Chunk> {
    pipeline::map(input, depth, move |mut chunk: Chunk| {
        chunk.object = template.render(chunk.index, chunk.size);
        chunk
    })
}

pub fn containerizer(
    input: mpsc::Receiver<Chunk>,
    container: String,
    depth: usize,
) -> mpsc::Receiver<Chunk> {
    pipeline::map(input, depth, move |mut chunk: Chunk| {
        chunk.container.clone_from(&container);
        chunk
    })
}

/// Writes `Uploading manifest: <path>` for every manifest passing through.
pub fn announce(input: mpsc::Receiver<Chunk>, output: OutputSink, depth: usize) -> mpsc::Receiver<Chunk> {
    pipeline::map(input, depth, move |chunk: Chunk| {
        tracing::info!(path = %chunk.path(), "uploading manifest");
        output.line(format_args!("Uploading manifest: {}", chunk.path()));
        chunk
    })
}

/// Writes `Preparing chunk <index> (<object>)` for every chunk passing through.
pub fn preparing(input: mpsc::Receiver<Chunk>, output: OutputSink, depth: usize) -> mpsc::Receiver<Chunk> {
    pipeline::map(input, depth, move |chunk: Chunk| {
        output.line(format_args!("Preparing chunk {} ({})", chunk.index, chunk.object));
        chunk
    })
}

pub fn read_data<S: Source>(
    input: mpsc::Receiver<Chunk>,
    source: Arc<S>,
    errors: ErrorSink,
    depth: usize,
) -> mpsc::Receiver<Chunk> {
    pipeline::transform(input, errors, depth, move |mut chunk: Chunk| {
        let source = Arc::clone(&source);
        async move {
            let data = source
                .read_at(chunk.offset, chunk.size)
                .await
                .map_err(|source| StageError::Read {
                    index: chunk.index,
                    offset: chunk.offset,
                    len: chunk.size,
                    source,
                })?;
            chunk.data = Some(data);
            Ok(Some(chunk))
        }
    })
}

pub fn hash_data(
    input: mpsc::Receiver<Chunk>,
    algorithm: HashAlgorithm,
    errors: ErrorSink,
    depth: usize,
) -> mpsc::Receiver<Chunk> {
    pipeline::transform(input, errors, depth, move |mut chunk: Chunk| async move {
        let index = chunk.index;
        let data = chunk.data.take().ok_or_else(|| StageError::Hash {
            index,
            reason: "chunk data was never read".into(),
        })?;
        let (data, digest) = tokio::task::spawn_blocking(move || {
            let digest = algorithm.digest(&data);
            (data, digest)
        })
        .await
        .map_err(|err| StageError::Hash {
            index,
            reason: err.to_string(),
        })?;
        chunk.data = Some(data);
        chunk.digest = Some(digest);
        Ok(Some(chunk))
    })
}

/// Uploads with `n` workers, each handling one chunk at a time.
///
/// Every put holds one of `permits` while it is outstanding. Manifest uploads
/// draw from the same semaphore, so it caps all puts of a session.
/// Each worker has one chunk in hand and at most one queued in front of it.
pub fn upload_pool<D: Destination>(
    input: mpsc::Receiver<Chunk>,
    n: usize,
    destination: Arc<D>,
    retry: Arc<dyn RetryStrategy>,
    permits: Arc<Semaphore>,
    errors: ErrorSink,
) -> mpsc::Receiver<Chunk> {
    let done = pipeline::divide(input, n, 1)
        .into_iter()
        .map(|stream| {
            upload_data(
                stream,
                Arc::clone(&destination),
                Arc::clone(&retry),
                Arc::clone(&permits),
                errors.clone(),
                1,
            )
        })
        .collect();
    pipeline::join(done, n)
}

/// Puts every chunk, verifies the returned digest, and releases its data.
pub fn upload_data<D: Destination>(
    input: mpsc::Receiver<Chunk>,
    destination: Arc<D>,
    retry: Arc<dyn RetryStrategy>,
    permits: Arc<Semaphore>,
    errors: ErrorSink,
    depth: usize,
) -> mpsc::Receiver<Chunk> {
    pipeline::transform(input, errors, depth, move |mut chunk: Chunk| {
        let destination = Arc::clone(&destination);
        let retry = Arc::clone(&retry);
        let permits = Arc::clone(&permits);
        async move {
            let (Some(data), Some(local)) = (chunk.data.take(), chunk.digest.clone()) else {
                return Err(StageError::Hash {
                    index: chunk.index,
                    reason: "chunk reached upload without data or digest".into(),
                });
            };
            let remote = put_with_retry(&*destination, &*retry, &permits, &chunk, &data, false).await?;
            if remote != local {
                return Err(StageError::DigestMismatch {
                    index: chunk.index,
                    path: chunk.path(),
                    local,
                    remote,
                });
            }
            tracing::debug!(index = chunk.index, path = %chunk.path(), "chunk uploaded");
            Ok(Some(chunk))
        }
    })
}

/// Puts every manifest document. The manifest takes the digest the store
/// reports, since stores compute it over the referenced segments.
pub fn upload_manifests<D: Destination>(
    input: mpsc::Receiver<Chunk>,
    destination: Arc<D>,
    retry: Arc<dyn RetryStrategy>,
    permits: Arc<Semaphore>,
    errors: ErrorSink,
    depth: usize,
) -> mpsc::Receiver<Chunk> {
    pipeline::transform(input, errors, depth, move |mut chunk: Chunk| {
        let destination = Arc::clone(&destination);
        let retry = Arc::clone(&retry);
        let permits = Arc::clone(&permits);
        async move {
            let document = chunk.data.take().unwrap_or_default();
            let digest = put_with_retry(&*destination, &*retry, &permits, &chunk, &document, true).await?;
            chunk.digest = Some(digest);
            Ok(Some(chunk))
        }
    })
}

async fn put_with_retry<D: Destination>(
    destination: &D,
    retry: &dyn RetryStrategy,
    permits: &Semaphore,
    chunk: &Chunk,
    data: &[u8],
    manifest: bool,
) -> Result<Digest, StageError> {
    let mut failures = 0;
    loop {
        // held for one attempt only, never across the retry pause
        let permit = permits.acquire().await.map_err(|err| StageError::Upload {
            index: chunk.index,
            path: chunk.path(),
            attempts: failures,
            source: err.into(),
        })?;
        let result = if manifest {
            destination
                .put_manifest(&chunk.container, &chunk.object, data)
                .await
        } else {
            destination.put(&chunk.container, &chunk.object, data).await
        };
        drop(permit);
        let err = match result {
            Ok(digest) => return Ok(digest),
            Err(err) => err,
        };

        failures += 1;
        let Some(delay) = retry.next_delay(failures) else {
            return Err(StageError::Upload {
                index: chunk.index,
                path: chunk.path(),
                attempts: failures,
                source: anyhow::Error::new(err),
            });
        };
        tracing::warn!(
            path = %chunk.path(),
            attempt = failures,
            error = %err,
            "put failed, retrying in {delay:?}"
        );
        tokio::time::sleep(delay).await;
    }
}
