//! Wires the stages into one upload session.
//!
//! ```text
//! plan ─▶ namer ─▶ containerizer ─▶ membership ─▶ separate ─┬─ present ────────────────────┐
//!                                                           └─ missing ─▶ read ─▶ hash ─▶ pool ─┴▶ join ─▶ counter
//!   ─▶ manifests (pass 1) ─▶ namer ─▶ containerizer ─▶ announce ─▶ upload
//!   ─▶ manifests (pass 2) ─▶ namer ─▶ containerizer ─▶ announce ─▶ upload ─▶ drained here
//! ```
//!
//! Excluded indices never enter the plan stream; they are handed to the first
//! manifest builder as gaps, together with the index of every chunk a stage
//! dropped.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::backend::Destination;
use crate::chunker::{max_chunks, Chunk, ChunkPlan, MAX_CHUNK_SIZE};
use crate::config::{UploadConfig, MANIFEST_NAME_TEMPLATE, TOP_MANIFEST_NAME_TEMPLATE};
use crate::error::{ConfigError, StageError, UploadError};
use crate::manifest::build_manifests;
use crate::membership::Membership;
use crate::output::OutputSink;
use crate::pipeline::{self, ErrorSink};
use crate::retry::RetryStrategy;
use crate::source::Source;
use crate::stages::{self, NameTemplate};
use crate::status::{self, Count, Status};

#[cfg(test)]
mod tests;

/// What an upload session did.
#[derive(Debug)]
pub struct UploadOutcome {
    /// `<container>/<object>` of the top-level manifest, if it was uploaded.
    pub manifest_path: Option<String>,
    pub total_chunks: u64,
    pub uploaded_chunks: u64,
    /// Already present at the destination.
    pub skipped_chunks: u64,
    pub excluded_chunks: u64,
    pub bytes_uploaded: u64,
    pub elapsed: Duration,
    /// Everything that was dropped along the way.
    pub errors: Vec<StageError>,
}

impl UploadOutcome {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty() && self.manifest_path.is_some()
    }

    /// Fails if any stage dropped an item.
    pub fn into_result(self) -> Result<Self, UploadError> {
        if self.errors.is_empty() {
            Ok(self)
        } else {
            Err(UploadError::Incomplete(self.errors))
        }
    }
}

/// Uploads one source as a segmented object.
pub struct Uploader<D, S> {
    destination: Arc<D>,
    source: Arc<S>,
    config: UploadConfig,
    plan: ChunkPlan,
    retry: Arc<dyn RetryStrategy>,
    output: OutputSink,
}

impl<D: Destination, S: Source> Uploader<D, S> {
    /// Validates the session setup. Nothing is read or sent yet.
    pub fn new(
        destination: Arc<D>,
        source: S,
        config: UploadConfig,
        output: OutputSink,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let plan = ChunkPlan::new(source.len(), config.chunk_size).ok_or(ConfigError::ChunkSize {
            size: config.chunk_size,
            max: MAX_CHUNK_SIZE,
        })?;
        let max = max_chunks(config.segment_limit);
        if plan.count() > max {
            return Err(ConfigError::TooManyChunks {
                count: plan.count(),
                max,
                limit: config.segment_limit,
            });
        }

        Ok(Self {
            destination,
            source: Arc::new(source),
            retry: Arc::new(config.retry.clone()),
            config,
            plan,
            output,
        })
    }

    /// Replaces the retry policy from the configuration.
    pub fn with_retry_strategy(mut self, strategy: impl RetryStrategy) -> Self {
        self.retry = Arc::new(strategy);
        self
    }

    pub fn plan(&self) -> &ChunkPlan {
        &self.plan
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    /// Uploads every chunk not in `exclude`.
    ///
    /// With `only_missing`, chunks whose object is already listed in the
    /// container are skipped. Stage failures do not stop the session, they
    /// are written to the output and returned in the outcome.
    pub async fn upload(&self, exclude: &HashSet<u64>) -> UploadOutcome {
        let membership = if self.config.only_missing {
            match self.destination.list(&self.config.container).await {
                Ok(objects) => Membership::from_listing(objects),
                Err(err) => {
                    tracing::warn!(error = %err, "listing the container failed");
                    self.output.line(format_args!(
                        "Problem getting existing chunk names from object storage: {err}"
                    ));
                    Membership::Nothing
                }
            }
        } else {
            Membership::Nothing
        };
        self.run(membership, exclude).await
    }

    /// Like [`Uploader::upload`], but chunks listed in a manifest saved by an
    /// earlier session are skipped without asking the destination.
    pub async fn upload_from_previous(
        &self,
        document: &[u8],
        exclude: &HashSet<u64>,
    ) -> Result<UploadOutcome, UploadError> {
        let membership = Membership::from_manifest(document).map_err(UploadError::InvalidManifest)?;
        self.output.line("Restoring from saved manifest");
        tracing::info!(entries = membership.len(), "restoring from saved manifest");
        Ok(self.run(membership, exclude).await)
    }

    async fn run(&self, membership: Membership, exclude: &HashSet<u64>) -> UploadOutcome {
        let config = &self.config;
        let depth = config.queue_depth;
        let limit = usize::try_from(config.segment_limit).unwrap_or(usize::MAX);
        let started = Instant::now();
        // one permit per outstanding put, segments and manifests alike
        let permits = Arc::new(Semaphore::new(config.max_uploaders));

        let (errors, mut error_rx) = ErrorSink::new();
        let (chunk_gaps, chunk_gap_rx) = mpsc::unbounded_channel();
        let (manifest_gaps, manifest_gap_rx) = mpsc::unbounded_channel();
        let chunk_errors = errors.with_gaps(chunk_gaps.clone());
        let manifest_errors = errors.with_gaps(manifest_gaps);

        let count = self.plan.count();
        let exclude: HashSet<u64> = exclude.iter().copied().filter(|&i| i < count).collect();
        for &index in &exclude {
            let _ = chunk_gaps.send(index);
        }
        drop(chunk_gaps);
        let excluded_chunks = exclude.len() as u64;

        tracing::info!(
            container = %config.container,
            object = %config.object,
            chunks = count,
            excluded = excluded_chunks,
            uploaders = config.max_uploaders,
            "starting upload"
        );

        let progress = Arc::new(Status::new(count - excluded_chunks));
        let stop_reporter = CancellationToken::new();
        let reporter = status::spawn_reporter(
            Arc::clone(&progress),
            self.output.clone(),
            config.status_interval,
            stop_reporter.clone(),
        );

        // segments
        let chunks = pipeline::feed(
            self.plan.chunks().filter(move |c| !exclude.contains(&c.index)),
            depth,
        );
        let chunks = stages::namer(
            chunks,
            NameTemplate::new(&config.chunk_name_template, &config.object),
            depth,
        );
        let chunks = stages::containerizer(chunks, config.container.clone(), depth);
        let resume = membership.is_resume();
        let chunks = pipeline::map(chunks, depth, move |chunk| membership.mark(chunk));
        let (present, missing) = pipeline::separate(chunks, depth, |chunk: &Chunk| chunk.skipped);

        let missing = if resume {
            stages::preparing(missing, self.output.clone(), depth)
        } else {
            missing
        };
        let missing = stages::read_data(missing, Arc::clone(&self.source), chunk_errors.clone(), depth);
        let missing = stages::hash_data(missing, config.hash_algorithm, chunk_errors.clone(), depth);
        let uploaded = stages::upload_pool(
            missing,
            config.max_uploaders,
            Arc::clone(&self.destination),
            Arc::clone(&self.retry),
            Arc::clone(&permits),
            chunk_errors,
        );

        let chunks = pipeline::join(vec![present, uploaded], depth);
        let (chunks, counts) = pipeline::counter(chunks, depth, Count::of);
        let counter = status::spawn_counter(Arc::clone(&progress), counts);

        // layer-1 manifests
        let manifests = build_manifests(chunks, chunk_gap_rx, manifest_errors.clone(), limit, None, depth);
        let manifests = self.upload_manifest_level(
            manifests,
            MANIFEST_NAME_TEMPLATE,
            Arc::clone(&permits),
            manifest_errors,
        );

        // top-level manifest
        let top = build_manifests(manifests, manifest_gap_rx, errors.clone(), limit, Some(1), depth);
        let top = self.upload_manifest_level(top, TOP_MANIFEST_NAME_TEMPLATE, permits, errors);

        let top = pipeline::collect(top).await;
        let manifest_path = top.first().map(Chunk::path);

        // every stage has finished once the last stream closed, so this ends
        let mut stage_errors = Vec::new();
        while let Some(err) = error_rx.recv().await {
            self.output.line(&err);
            stage_errors.push(err);
        }

        if let Err(err) = counter.await {
            tracing::error!(error = %err, "status counter failed");
        }
        stop_reporter.cancel();
        if let Err(err) = reporter.await {
            tracing::error!(error = %err, "status reporter failed");
        }

        let snapshot = progress.snapshot();
        let outcome = UploadOutcome {
            manifest_path,
            total_chunks: count,
            uploaded_chunks: snapshot.completed - snapshot.skipped,
            skipped_chunks: snapshot.skipped,
            excluded_chunks,
            bytes_uploaded: snapshot.bytes,
            elapsed: started.elapsed(),
            errors: stage_errors,
        };
        tracing::info!(
            manifest = ?outcome.manifest_path,
            uploaded = outcome.uploaded_chunks,
            skipped = outcome.skipped_chunks,
            errors = outcome.errors.len(),
            elapsed = ?outcome.elapsed,
            "upload finished"
        );
        outcome
    }

    fn upload_manifest_level(
        &self,
        manifests: mpsc::Receiver<Chunk>,
        template: &str,
        permits: Arc<Semaphore>,
        errors: ErrorSink,
    ) -> mpsc::Receiver<Chunk> {
        let depth = self.config.queue_depth;
        let manifests = stages::namer(manifests, NameTemplate::new(template, &self.config.object), depth);
        let manifests = stages::containerizer(manifests, self.config.container.clone(), depth);
        let manifests = stages::announce(manifests, self.output.clone(), depth);
        stages::upload_manifests(
            manifests,
            Arc::clone(&self.destination),
            Arc::clone(&self.retry),
            permits,
            errors,
            depth,
        )
    }
}
