//! Error types for upload sessions.
//!
//! Configuration problems are reported synchronously, before a pipeline is
//! built. Everything that goes wrong while chunks are in flight is a
//! [`StageError`]: it is collected on the session's error queue, the offending
//! item is dropped, and the rest of the pipeline keeps draining.

use std::io;

use crate::digest::Digest;

/// Invalid session setup. No I/O has happened when one of these is returned.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("container name cannot be empty")]
    EmptyContainer,

    #[error("object name cannot be empty")]
    EmptyObject,

    #[error("chunk size must be between 1 byte and {max} bytes, got {size}")]
    ChunkSize { size: u64, max: u64 },

    #[error("unable to upload with {0} uploaders (minimum 1 required)")]
    Uploaders(usize),

    #[error("queue depth must be at least 1")]
    QueueDepth,

    #[error("segment limit must be at least 1")]
    SegmentLimit,

    #[error("retry policy must allow at least one attempt")]
    RetryAttempts,

    #[error("chunk name template {0:?} must contain an `{{index}}` placeholder")]
    NameTemplate(String),

    /// Chunk objects would overwrite manifest objects.
    #[error("chunk name template {0:?} can produce the name of a manifest")]
    ManifestNameClash(String),

    /// The file needs more segments than two manifest levels can reference.
    #[error("file needs {count} chunks, but at most {max} can be referenced ({limit} per manifest)")]
    TooManyChunks { count: u64, max: u64, limit: u64 },
}

/// A failure while processing a single chunk or manifest.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("failed to read chunk {index} ({len} bytes at offset {offset}): {source}")]
    Read {
        index: u64,
        offset: u64,
        len: u64,
        #[source]
        source: io::Error,
    },

    #[error("failed to hash chunk {index}: {reason}")]
    Hash { index: u64, reason: String },

    #[error("failed to upload {path} after {attempts} attempts: {source}")]
    Upload {
        index: u64,
        path: String,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    /// The backend stored something other than what was sent.
    #[error("digest mismatch for {path}: local {local}, remote {remote}")]
    DigestMismatch {
        index: u64,
        path: String,
        local: Digest,
        remote: Digest,
    },

    #[error("failed to serialize manifest {index}: {source}")]
    Serialize {
        index: u64,
        #[source]
        source: serde_json::Error,
    },

    #[error("{count} layer-1 manifests exceed the limit of {limit} per manifest")]
    TooManyManifests { count: u64, limit: u64 },
}

impl StageError {
    /// The index of the item this error dropped from the stream, if any.
    pub fn index(&self) -> Option<u64> {
        match self {
            Self::Read { index, .. }
            | Self::Hash { index, .. }
            | Self::Upload { index, .. }
            | Self::DigestMismatch { index, .. }
            | Self::Serialize { index, .. } => Some(*index),
            Self::TooManyManifests { .. } => None,
        }
    }
}

/// Session-level failures.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("unable to parse previous manifest: {0}")]
    InvalidManifest(#[source] serde_json::Error),

    /// The session ran to completion, but some items were dropped.
    #[error("upload finished with {} errors", .0.len())]
    Incomplete(Vec<StageError>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_errors_carry_the_dropped_index() {
        let err = StageError::Read {
            index: 7,
            offset: 70,
            len: 10,
            source: io::Error::from(io::ErrorKind::UnexpectedEof),
        };
        assert_eq!(err.index(), Some(7));
        assert!(err.to_string().starts_with("failed to read chunk 7"));

        let err = StageError::TooManyManifests {
            count: 1001,
            limit: 1000,
        };
        assert_eq!(err.index(), None);
    }

    #[test]
    fn config_errors_render() {
        let err = ConfigError::NameTemplate("{object}-chunk".into());
        assert_eq!(
            err.to_string(),
            "chunk name template \"{object}-chunk\" must contain an `{index}` placeholder"
        );
    }
}
