use std::num::NonZeroUsize;
use std::thread::available_parallelism;
use std::time::Duration;

use serde::Deserialize;

use crate::chunker::MAX_CHUNK_SIZE;
use crate::digest::HashAlgorithm;
use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use crate::stages::NameTemplate;

pub const DEFAULT_CHUNK_NAME_TEMPLATE: &str = "{object}-chunk-{index}-size-{size}";

/// Names of the layer-1 manifests.
pub const MANIFEST_NAME_TEMPLATE: &str = "{object}-manifest-{index}";

/// The top-level manifest is stored under the object name itself.
pub const TOP_MANIFEST_NAME_TEMPLATE: &str = "{object}";

/// Object stores cap the number of segments a single manifest may list.
pub const DEFAULT_SEGMENT_LIMIT: u64 = 1000;

/// Settings of one upload session.
///
/// Deserializes from e.g. JSON with only `container`, `object` and
/// `chunk_size` required; durations are given in milliseconds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UploadConfig {
    pub container: String,
    pub object: String,
    pub chunk_size: u64,
    #[serde(default = "default_uploaders")]
    pub max_uploaders: usize,
    /// Skip chunks whose object already exists in the container.
    #[serde(default)]
    pub only_missing: bool,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(
        rename = "status_interval_ms",
        with = "duration_ms",
        default = "default_status_interval"
    )]
    pub status_interval: Duration,
    /// Capacity of every queue between two stages.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Entries per manifest.
    #[serde(default = "default_segment_limit")]
    pub segment_limit: u64,
    #[serde(default)]
    pub hash_algorithm: HashAlgorithm,
    #[serde(default = "default_chunk_name_template")]
    pub chunk_name_template: String,
}

fn default_uploaders() -> usize {
    available_parallelism().map_or(1, NonZeroUsize::get)
}

fn default_status_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_queue_depth() -> usize {
    1
}

fn default_segment_limit() -> u64 {
    DEFAULT_SEGMENT_LIMIT
}

fn default_chunk_name_template() -> String {
    DEFAULT_CHUNK_NAME_TEMPLATE.into()
}

impl UploadConfig {
    pub fn builder(container: impl Into<String>, object: impl Into<String>) -> UploadConfigBuilder {
        UploadConfigBuilder {
            config: UploadConfig {
                container: container.into(),
                object: object.into(),
                chunk_size: 1000 * 1000 * 1000,
                max_uploaders: default_uploaders(),
                only_missing: false,
                retry: RetryPolicy::default(),
                status_interval: default_status_interval(),
                queue_depth: default_queue_depth(),
                segment_limit: DEFAULT_SEGMENT_LIMIT,
                hash_algorithm: HashAlgorithm::default(),
                chunk_name_template: default_chunk_name_template(),
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.container.is_empty() {
            return Err(ConfigError::EmptyContainer);
        }
        if self.object.is_empty() {
            return Err(ConfigError::EmptyObject);
        }
        if !(1..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(ConfigError::ChunkSize {
                size: self.chunk_size,
                max: MAX_CHUNK_SIZE,
            });
        }
        if self.max_uploaders < 1 {
            return Err(ConfigError::Uploaders(self.max_uploaders));
        }
        if self.queue_depth < 1 {
            return Err(ConfigError::QueueDepth);
        }
        if self.segment_limit < 1 {
            return Err(ConfigError::SegmentLimit);
        }
        if self.retry.max_attempts < 1 {
            return Err(ConfigError::RetryAttempts);
        }
        if !self.chunk_name_template.contains("{index}") {
            return Err(ConfigError::NameTemplate(self.chunk_name_template.clone()));
        }
        if self.chunk_names_clash() {
            return Err(ConfigError::ManifestNameClash(self.chunk_name_template.clone()));
        }
        Ok(())
    }

    /// Whether a chunk could be named like one of the manifests.
    ///
    /// Placeholders only ever render to digits, so a few short and long
    /// samples show every shape a chunk name can take.
    fn chunk_names_clash(&self) -> bool {
        let template = NameTemplate::new(&self.chunk_name_template, &self.object);
        [0, 9_999, 10_000].into_iter().any(|index| {
            [1, 1_234, self.chunk_size]
                .into_iter()
                .any(|size| is_manifest_name(&template.render(index, size), &self.object))
        })
    }
}

/// Matches names rendered from [`MANIFEST_NAME_TEMPLATE`] and
/// [`TOP_MANIFEST_NAME_TEMPLATE`].
fn is_manifest_name(name: &str, object: &str) -> bool {
    let Some(rest) = name.strip_prefix(object) else {
        return false;
    };
    if rest.is_empty() {
        return true;
    }
    rest.strip_prefix("-manifest-")
        .is_some_and(|index| index.len() >= 4 && index.bytes().all(|b| b.is_ascii_digit()))
}

pub struct UploadConfigBuilder {
    config: UploadConfig,
}

impl UploadConfigBuilder {
    pub fn chunk_size(mut self, chunk_size: u64) -> Self {
        self.config.chunk_size = chunk_size;
        self
    }

    pub fn max_uploaders(mut self, max_uploaders: usize) -> Self {
        self.config.max_uploaders = max_uploaders;
        self
    }

    pub fn only_missing(mut self, only_missing: bool) -> Self {
        self.config.only_missing = only_missing;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn status_interval(mut self, interval: Duration) -> Self {
        self.config.status_interval = interval;
        self
    }

    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.config.queue_depth = depth;
        self
    }

    pub fn segment_limit(mut self, limit: u64) -> Self {
        self.config.segment_limit = limit;
        self
    }

    pub fn hash_algorithm(mut self, algorithm: HashAlgorithm) -> Self {
        self.config.hash_algorithm = algorithm;
        self
    }

    pub fn chunk_name_template(mut self, template: impl Into<String>) -> Self {
        self.config.chunk_name_template = template.into();
        self
    }

    pub fn build(self) -> Result<UploadConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// (De)serializes a [`Duration`] as whole milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
