//! Uploads large files to object storage as static large objects.
//!
//! The file is cut into fixed-size chunks, each stored as its own segment
//! object. Manifests list the segments in file order, so the store can serve
//! them back as one logical object. Because a manifest can reference only a
//! limited number of segments, there are always two levels: layer-1 manifests
//! over the segments, and one top-level manifest over those.
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use std::collections::HashSet;
//! use std::sync::Arc;
//!
//! use slo_uploader::{FileSource, FsDestination, HashAlgorithm, OutputSink, UploadConfig, Uploader};
//!
//! let config = UploadConfig::builder("backups", "disk.img")
//!     .chunk_size(64 * 1024 * 1024)
//!     .max_uploaders(8)
//!     .only_missing(true)
//!     .build()?;
//! let destination = Arc::new(FsDestination::new("/srv/objects", HashAlgorithm::Blake3));
//! let source = FileSource::open("disk.img")?;
//!
//! let uploader = Uploader::new(destination, source, config, OutputSink::stdout())?;
//! let outcome = uploader.upload(&HashSet::new()).await.into_result()?;
//! println!("uploaded {:?}", outcome.manifest_path);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod chunker;
pub mod config;
pub mod digest;
pub mod error;
pub mod manifest;
pub mod membership;
pub mod output;
pub mod pipeline;
pub mod retry;
pub mod source;
pub mod stages;
pub mod status;
pub mod uploader;

pub use backend::fs_impl::FsDestination;
pub use backend::mem_impl::MemDestination;
pub use backend::{Destination, ObjectInfo};
pub use config::UploadConfig;
pub use digest::{Digest, HashAlgorithm};
pub use error::{ConfigError, StageError, UploadError};
pub use output::OutputSink;
pub use retry::{RetryPolicy, RetryStrategy};
pub use source::{FileSource, Source};
pub use uploader::{UploadOutcome, Uploader};
