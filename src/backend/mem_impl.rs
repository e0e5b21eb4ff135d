use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{Destination, ObjectInfo};
use crate::digest::{Digest, HashAlgorithm};
use crate::manifest::parse_manifest;

#[derive(Debug, thiserror::Error)]
pub enum MemError {
    #[error("injected put failure")]
    Injected,

    #[error("injected listing failure")]
    ListingUnavailable,

    #[error("manifest document is invalid: {0}")]
    InvalidManifest(#[from] serde_json::Error),

    #[error("manifest references missing object {0}")]
    MissingSegment(String),
}

#[derive(Debug)]
struct StoredObject {
    data: Vec<u8>,
    digest: Digest,
    manifest: bool,
}

/// An in-memory object store.
///
/// Besides storing objects it keeps the bookkeeping tests need: how many
/// segment bytes were written, and how many puts were outstanding at once.
/// Latency and failures can be injected to exercise retries and out-of-order
/// completion.
pub struct MemDestination {
    algorithm: HashAlgorithm,
    objects: RwLock<HashMap<(String, String), StoredObject>>,
    put_latency_ms: (u64, u64),
    rng: Mutex<StdRng>,
    failures_left: AtomicU32,
    corrupt: bool,
    listing_fails: bool,

    segment_bytes: AtomicU64,
    puts: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl Default for MemDestination {
    fn default() -> Self {
        Self::new(HashAlgorithm::default())
    }
}

impl MemDestination {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self {
            algorithm,
            objects: Default::default(),
            put_latency_ms: (0, 0),
            rng: Mutex::new(StdRng::seed_from_u64(0)),
            failures_left: AtomicU32::new(0),
            corrupt: false,
            listing_fails: false,
            segment_bytes: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Sleep a random duration in `[min_ms, max_ms]` inside every put.
    pub fn put_latency(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.put_latency_ms = (min_ms, max_ms);
        self
    }

    pub fn seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    /// Fail the next `n` puts.
    pub fn failing_puts(self, n: u32) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    /// Report a digest that does not match what was stored.
    pub fn corrupting(mut self) -> Self {
        self.corrupt = true;
        self
    }

    pub fn failing_listing(mut self) -> Self {
        self.listing_fails = true;
        self
    }

    /// Stores an object directly, bypassing the put bookkeeping.
    pub fn insert(&self, container: &str, object: &str, data: &[u8]) {
        let stored = StoredObject {
            data: data.to_vec(),
            digest: self.algorithm.digest(data),
            manifest: false,
        };
        self.objects
            .write()
            .expect("lock poisoned")
            .insert(key(container, object), stored);
    }

    pub fn object_names(&self, container: &str) -> Vec<String> {
        let objects = self.objects.read().expect("lock poisoned");
        let mut names: Vec<_> = objects
            .keys()
            .filter(|(c, _)| c == container)
            .map(|(_, o)| o.clone())
            .collect();
        names.sort();
        names
    }

    /// The raw bytes stored under a name (for manifests, the document).
    pub fn raw(&self, container: &str, object: &str) -> Option<Vec<u8>> {
        let objects = self.objects.read().expect("lock poisoned");
        objects
            .get(&key(container, object))
            .map(|o| o.data.clone())
    }

    /// What a client would download: manifests are expanded recursively into
    /// the concatenation of the segments they list.
    pub fn contents(&self, container: &str, object: &str) -> Result<Option<Vec<u8>>, MemError> {
        let objects = self.objects.read().expect("lock poisoned");
        let Some(stored) = objects.get(&key(container, object)) else {
            return Ok(None);
        };
        let mut out = Vec::new();
        expand(&objects, stored, &mut out)?;
        Ok(Some(out))
    }

    /// Bytes of all segment (non-manifest) puts.
    pub fn segment_bytes_put(&self) -> u64 {
        self.segment_bytes.load(Ordering::SeqCst)
    }

    pub fn puts(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn peak_concurrent_puts(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    async fn store(
        &self,
        container: &str,
        object: &str,
        data: &[u8],
        manifest: bool,
    ) -> Result<Digest, MemError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let result = self.store_inner(container, object, data, manifest).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn store_inner(
        &self,
        container: &str,
        object: &str,
        data: &[u8],
        manifest: bool,
    ) -> Result<Digest, MemError> {
        self.delay().await;
        self.puts.fetch_add(1, Ordering::SeqCst);

        let injected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(MemError::Injected);
        }
        if manifest {
            parse_manifest(data)?;
        } else {
            self.segment_bytes
                .fetch_add(data.len() as u64, Ordering::SeqCst);
        }

        let digest = self.algorithm.digest(data);
        tracing::debug!(container, object, size = data.len(), "storing object in memory");
        let stored = StoredObject {
            data: data.to_vec(),
            digest: digest.clone(),
            manifest,
        };
        self.objects
            .write()
            .expect("lock poisoned")
            .insert(key(container, object), stored);

        if self.corrupt {
            return Ok(self.algorithm.digest(b"corrupted"));
        }
        Ok(digest)
    }

    async fn delay(&self) {
        let (min, max) = self.put_latency_ms;
        if max == 0 {
            return;
        }
        let ms = self.rng.lock().expect("lock poisoned").random_range(min..=max);
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

fn key(container: &str, object: &str) -> (String, String) {
    (container.to_owned(), object.to_owned())
}

fn expand(
    objects: &HashMap<(String, String), StoredObject>,
    stored: &StoredObject,
    out: &mut Vec<u8>,
) -> Result<(), MemError> {
    if !stored.manifest {
        out.extend_from_slice(&stored.data);
        return Ok(());
    }
    for entry in parse_manifest(&stored.data)? {
        let (container, object) = entry.path.split_once('/').unwrap_or(("", entry.path.as_str()));
        let segment = objects
            .get(&key(container, object))
            .ok_or_else(|| MemError::MissingSegment(entry.path.clone()))?;
        expand(objects, segment, out)?;
    }
    Ok(())
}

#[async_trait::async_trait]
impl Destination for MemDestination {
    type Error = MemError;

    async fn list(&self, container: &str) -> Result<Vec<ObjectInfo>, MemError> {
        if self.listing_fails {
            return Err(MemError::ListingUnavailable);
        }
        let objects = self.objects.read().expect("lock poisoned");
        Ok(objects
            .iter()
            .filter(|((c, _), _)| c == container)
            .map(|((_, name), stored)| ObjectInfo {
                name: name.clone(),
                digest: stored.digest.clone(),
            })
            .collect())
    }

    async fn put(&self, container: &str, object: &str, data: &[u8]) -> Result<Digest, MemError> {
        self.store(container, object, data, false).await
    }

    async fn put_manifest(
        &self,
        container: &str,
        object: &str,
        document: &[u8],
    ) -> Result<Digest, MemError> {
        self.store(container, object, document, true).await
    }
}
