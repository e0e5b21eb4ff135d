use std::collections::HashSet;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use super::*;
use crate::backend::fs_impl::FsDestination;
use crate::backend::mem_impl::MemDestination;
use crate::digest::HashAlgorithm;
use crate::manifest::{parse_manifest, serialize_manifest, ManifestEntry};
use crate::output::CapturedOutput;
use crate::retry::RetryPolicy;
use crate::source::FileSource;

const FILE_SIZE: usize = 1024;

fn random_file(len: usize) -> Vec<u8> {
    let mut data = vec![0; len];
    StdRng::seed_from_u64(0x5eed).fill_bytes(&mut data);
    data
}

fn config(chunk_size: u64) -> UploadConfig {
    UploadConfig::builder("container", "object")
        .chunk_size(chunk_size)
        .max_uploaders(1)
        .retry(RetryPolicy::fixed(3, Duration::ZERO))
        .build()
        .unwrap()
}

fn uploader<S: Source>(
    dest: &Arc<MemDestination>,
    source: S,
    config: UploadConfig,
) -> (Uploader<MemDestination, S>, CapturedOutput) {
    let (output, captured) = OutputSink::capture();
    let uploader = Uploader::new(Arc::clone(dest), source, config, output).unwrap();
    (uploader, captured)
}

fn none() -> HashSet<u64> {
    HashSet::new()
}

fn reassembled(dest: &MemDestination) -> Vec<u8> {
    dest.contents("container", "object").unwrap().unwrap()
}

/// A source that remembers which offsets were read.
#[derive(Clone)]
struct RecordingSource {
    data: Vec<u8>,
    reads: Arc<Mutex<Vec<u64>>>,
}

#[async_trait::async_trait]
impl Source for RecordingSource {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_at(&self, offset: u64, len: u64) -> io::Result<Vec<u8>> {
        self.reads.lock().unwrap().push(offset);
        self.data.read_at(offset, len).await
    }
}

#[tokio::test]
async fn uploads_and_reassembles() {
    let file = random_file(FILE_SIZE);
    let dest = Arc::new(MemDestination::default());
    let (uploader, captured) = uploader(&dest, file.clone(), config(10));
    assert_eq!(uploader.plan().count(), 103);

    let outcome = uploader.upload(&none()).await;
    assert!(outcome.is_complete(), "{:?}", outcome.errors);
    assert_eq!(outcome.manifest_path.as_deref(), Some("container/object"));
    assert_eq!(outcome.total_chunks, 103);
    assert_eq!(outcome.uploaded_chunks, 103);
    assert_eq!(outcome.skipped_chunks, 0);
    assert_eq!(outcome.bytes_uploaded, FILE_SIZE as u64);

    assert_eq!(reassembled(&dest), file);
    assert_eq!(dest.segment_bytes_put(), FILE_SIZE as u64);

    let names = dest.object_names("container");
    assert_eq!(names.len(), 103 + 2);
    assert!(names.contains(&"object-chunk-0000-size-10".to_string()));
    assert!(names.contains(&"object-chunk-0102-size-4".to_string()));
    assert!(names.contains(&"object-manifest-0000".to_string()));

    let output = captured.contents();
    assert!(output.contains("Uploading manifest: container/object-manifest-0000"));
    assert!(output.contains("Uploading manifest: container/object\n"));
    assert!(output.contains("Completed 103/103 chunks (0 skipped)"));
}

#[tokio::test]
async fn chunk_size_dividing_the_file() {
    let file = random_file(FILE_SIZE);
    let dest = Arc::new(MemDestination::default());
    let (uploader, _) = uploader(&dest, file.clone(), config(FILE_SIZE as u64 / 2));

    let outcome = uploader.upload(&none()).await;
    assert!(outcome.is_complete());
    assert_eq!(reassembled(&dest), file);

    let top = parse_manifest(&dest.raw("container", "object").unwrap()).unwrap();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].path, "container/object-manifest-0000");
    assert_eq!(top[0].size, FILE_SIZE as u64);

    let layer = parse_manifest(&dest.raw("container", "object-manifest-0000").unwrap()).unwrap();
    let paths: Vec<_> = layer.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(
        paths,
        [
            "container/object-chunk-0000-size-512",
            "container/object-chunk-0001-size-512",
        ]
    );
    assert_eq!(layer[1].digest, HashAlgorithm::Blake3.digest(&file[512..]));
}

#[tokio::test]
async fn only_missing_skips_listed_chunks_without_reading_them() {
    let file = random_file(FILE_SIZE);
    let dest = Arc::new(MemDestination::default());
    dest.insert("container", "object-chunk-0000-size-10", &file[..10]);

    let source = RecordingSource {
        data: file.clone(),
        reads: Default::default(),
    };
    let config = UploadConfig {
        only_missing: true,
        ..config(10)
    };
    let (uploader, _) = uploader(&dest, source.clone(), config);

    let outcome = uploader.upload(&none()).await;
    assert!(outcome.is_complete());
    assert_eq!(outcome.skipped_chunks, 1);
    assert_eq!(outcome.uploaded_chunks, 102);
    assert_eq!(outcome.bytes_uploaded, FILE_SIZE as u64 - 10);
    assert_eq!(dest.segment_bytes_put(), FILE_SIZE as u64 - 10);

    let reads = source.reads.lock().unwrap().clone();
    assert_eq!(reads.len(), 102);
    assert!(!reads.contains(&0));

    // the skipped chunk is still part of the object
    assert_eq!(reassembled(&dest), file);
}

#[tokio::test]
async fn listing_failure_uploads_everything() {
    let file = random_file(FILE_SIZE);
    let dest = Arc::new(MemDestination::default().failing_listing());
    let config = UploadConfig {
        only_missing: true,
        ..config(100)
    };
    let (uploader, captured) = uploader(&dest, file.clone(), config);

    let outcome = uploader.upload(&none()).await;
    assert!(outcome.is_complete());
    assert_eq!(outcome.skipped_chunks, 0);
    assert_eq!(reassembled(&dest), file);
    assert!(captured
        .contents()
        .contains("Problem getting existing chunk names from object storage: injected listing failure"));
}

#[tokio::test]
async fn excluded_chunks_are_neither_read_nor_listed() {
    let file = random_file(FILE_SIZE);
    let dest = Arc::new(MemDestination::default());
    let source = RecordingSource {
        data: file.clone(),
        reads: Default::default(),
    };
    let (uploader, _) = uploader(&dest, source.clone(), config(10));

    let outcome = uploader.upload(&HashSet::from([0, 5000])).await;
    assert!(outcome.is_complete());
    assert_eq!(outcome.excluded_chunks, 1);
    assert_eq!(outcome.uploaded_chunks, 102);
    assert_eq!(dest.segment_bytes_put(), FILE_SIZE as u64 - 10);
    assert!(!source.reads.lock().unwrap().contains(&0));

    let names = dest.object_names("container");
    assert!(!names.contains(&"object-chunk-0000-size-10".to_string()));
    assert_eq!(reassembled(&dest), &file[10..]);

    let layer = parse_manifest(&dest.raw("container", "object-manifest-0000").unwrap()).unwrap();
    assert_eq!(layer.len(), 102);
    assert_eq!(layer[0].path, "container/object-chunk-0001-size-10");
}

#[tokio::test]
async fn resumes_from_a_saved_manifest() {
    let file = random_file(FILE_SIZE);
    let dest = Arc::new(MemDestination::default());
    dest.insert("container", "object-chunk-0000-size-10", &file[..10]);
    let previous = serialize_manifest(&[ManifestEntry {
        path: "container/object-chunk-0000-size-10".into(),
        digest: HashAlgorithm::Blake3.digest(&file[..10]),
        size: 10,
    }])
    .unwrap();

    let (uploader, captured) = uploader(&dest, file.clone(), config(10));
    let outcome = uploader.upload_from_previous(&previous, &none()).await.unwrap();
    assert!(outcome.is_complete());
    assert_eq!(outcome.skipped_chunks, 1);
    assert_eq!(dest.segment_bytes_put(), FILE_SIZE as u64 - 10);
    assert_eq!(reassembled(&dest), file);

    let output = captured.contents();
    assert!(output.contains("Restoring from saved manifest"));
    assert!(output.contains("Preparing chunk 1 (object-chunk-0001-size-10)"));
    assert!(!output.contains("Preparing chunk 0 "));
}

#[tokio::test]
async fn resumes_from_an_empty_manifest() {
    let file = random_file(FILE_SIZE);
    let dest = Arc::new(MemDestination::default());
    let (uploader, captured) = uploader(&dest, file.clone(), config(100));

    let outcome = uploader.upload_from_previous(b"[]", &none()).await.unwrap();
    assert!(outcome.is_complete());
    assert_eq!(outcome.uploaded_chunks, 11);
    assert_eq!(reassembled(&dest), file);

    let output = captured.contents();
    assert!(output.contains("Restoring from saved manifest"));
    assert!(output.contains("Preparing chunk 0 (object-chunk-0000-size-100)"));
}

#[tokio::test]
async fn rejects_an_unparsable_saved_manifest() {
    let dest = Arc::new(MemDestination::default());
    let (uploader, _) = uploader(&dest, random_file(FILE_SIZE), config(10));

    let result = uploader.upload_from_previous(b"{not a manifest", &none()).await;
    assert!(matches!(result, Err(UploadError::InvalidManifest(_))));
    assert_eq!(dest.puts(), 0);
}

#[tokio::test]
async fn out_of_order_completion_keeps_manifest_order() {
    let file = random_file(FILE_SIZE);
    let dest = Arc::new(MemDestination::default().put_latency(0, 20).seed(7));
    let config = UploadConfig {
        max_uploaders: 8,
        segment_limit: 16,
        ..config(10)
    };
    let (uploader, _) = uploader(&dest, file.clone(), config);

    let outcome = uploader.upload(&none()).await;
    assert!(outcome.is_complete());
    assert!(dest.peak_concurrent_puts() <= 8);
    assert_eq!(reassembled(&dest), file);

    // 103 chunks in manifests of 16
    let top = parse_manifest(&dest.raw("container", "object").unwrap()).unwrap();
    assert_eq!(top.len(), 7);
    assert_eq!(top[6].path, "container/object-manifest-0006");
    assert_eq!(top[6].size, 6 * 10 + 4);
    for (i, entry) in top.iter().enumerate() {
        let layer = parse_manifest(&dest.raw("container", &entry.path[10..]).unwrap()).unwrap();
        let first = format!("container/object-chunk-{:04}-size-10", i * 16);
        assert_eq!(layer[0].path, first);
        assert_eq!(layer.iter().map(|e| e.size).sum::<u64>(), entry.size);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_puts_never_exceed_the_uploader_count() {
    let file = random_file(FILE_SIZE);
    let dest = Arc::new(MemDestination::default().put_latency(1, 5));
    let config = UploadConfig {
        max_uploaders: 3,
        queue_depth: 4,
        ..config(10)
    };
    let (uploader, _) = uploader(&dest, file.clone(), config);

    assert!(uploader.upload(&none()).await.is_complete());
    assert!(dest.peak_concurrent_puts() <= 3);
    assert_eq!(reassembled(&dest), file);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn manifest_puts_count_against_the_uploader_limit() {
    let file = random_file(FILE_SIZE);
    let dest = Arc::new(MemDestination::default().put_latency(1, 20).seed(3));
    let config = UploadConfig {
        segment_limit: 11,
        queue_depth: 4,
        ..config(10)
    };
    let (uploader, _) = uploader(&dest, file.clone(), config);

    let outcome = uploader.upload(&none()).await;
    assert!(outcome.is_complete(), "{:?}", outcome.errors);
    // 103 segments, 10 layer-1 manifests and the top-level one
    assert_eq!(dest.puts(), 114);
    assert_eq!(dest.peak_concurrent_puts(), 1);
    assert_eq!(reassembled(&dest), file);
}

#[tokio::test]
async fn object_names_with_placeholders_are_stored_verbatim() {
    let file = random_file(FILE_SIZE);
    let dest = Arc::new(MemDestination::default());
    let config = UploadConfig {
        object: "backup-{index}".into(),
        ..config(100)
    };
    let (uploader, _) = uploader(&dest, file.clone(), config);

    let outcome = uploader.upload(&none()).await;
    assert_eq!(outcome.manifest_path.as_deref(), Some("container/backup-{index}"));
    assert_eq!(dest.contents("container", "backup-{index}").unwrap().unwrap(), file);

    let names = dest.object_names("container");
    assert!(names.contains(&"backup-{index}-chunk-0000-size-100".to_string()));
    assert!(names.contains(&"backup-{index}-chunk-0010-size-24".to_string()));
    assert!(names.contains(&"backup-{index}-manifest-0000".to_string()));
    assert_eq!(names.len(), 13);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let file = random_file(FILE_SIZE);
    let dest = Arc::new(MemDestination::default().failing_puts(2));
    let (uploader, _) = uploader(&dest, file.clone(), config(10));

    let outcome = uploader.upload(&none()).await;
    assert!(outcome.is_complete());
    assert_eq!(reassembled(&dest), file);
    // 103 segments, 2 manifests, 2 failed attempts
    assert_eq!(dest.puts(), 103 + 2 + 2);
}

#[tokio::test]
async fn exhausted_retries_drop_the_chunk_and_keep_going() {
    let file = random_file(FILE_SIZE);
    let dest = Arc::new(MemDestination::default().failing_puts(3));
    let (uploader, captured) = uploader(&dest, file.clone(), config(10));

    let outcome = uploader.upload(&none()).await;
    assert!(!outcome.is_complete());
    assert_eq!(outcome.manifest_path.as_deref(), Some("container/object"));
    assert_eq!(outcome.uploaded_chunks, 102);
    assert_eq!(outcome.errors.len(), 1);
    assert!(matches!(
        outcome.errors[0],
        StageError::Upload { index: 0, attempts: 3, .. }
    ));
    assert_eq!(reassembled(&dest), &file[10..]);
    assert!(captured
        .contents()
        .contains("failed to upload container/object-chunk-0000-size-10 after 3 attempts"));

    let Err(UploadError::Incomplete(errors)) = outcome.into_result() else {
        panic!("expected an incomplete upload");
    };
    assert_eq!(errors.len(), 1);
}

#[tokio::test]
async fn digest_mismatches_are_reported() {
    let dest = Arc::new(MemDestination::default().corrupting());
    let (uploader, _) = uploader(&dest, random_file(FILE_SIZE), config(100));

    let outcome = uploader.upload(&none()).await;
    assert_eq!(outcome.errors.len(), 11);
    assert!(outcome
        .errors
        .iter()
        .all(|err| matches!(err, StageError::DigestMismatch { .. })));
    // one attempt per chunk, then the two manifests
    assert_eq!(dest.puts(), 11 + 2);

    let top = parse_manifest(&dest.raw("container", "object").unwrap()).unwrap();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].size, 0);
    assert!(parse_manifest(&dest.raw("container", "object-manifest-0000").unwrap())
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn zero_byte_source_uploads_empty_manifests() {
    let dest = Arc::new(MemDestination::default());
    let (uploader, _) = uploader(&dest, Vec::<u8>::new(), config(10));

    let outcome = uploader.upload(&none()).await;
    assert!(outcome.is_complete());
    assert_eq!(outcome.total_chunks, 0);
    assert_eq!(dest.segment_bytes_put(), 0);
    assert_eq!(dest.object_names("container"), ["object", "object-manifest-0000"]);
    assert!(reassembled(&dest).is_empty());
}

#[test]
fn rejects_invalid_setups() {
    let dest = Arc::new(MemDestination::default());
    let new = |config: UploadConfig| {
        Uploader::new(Arc::clone(&dest), random_file(FILE_SIZE), config, OutputSink::discard()).err()
    };

    assert!(matches!(
        new(UploadConfig { chunk_size: 0, ..config(10) }),
        Some(ConfigError::ChunkSize { size: 0, .. })
    ));
    assert!(matches!(
        new(UploadConfig { max_uploaders: 0, ..config(10) }),
        Some(ConfigError::Uploaders(0))
    ));
    assert!(matches!(
        new(UploadConfig { container: String::new(), ..config(10) }),
        Some(ConfigError::EmptyContainer)
    ));
    assert!(matches!(
        new(UploadConfig { object: String::new(), ..config(10) }),
        Some(ConfigError::EmptyObject)
    ));
    // 103 chunks, but two levels of 10 only reach 100
    assert!(matches!(
        new(UploadConfig { segment_limit: 10, ..config(10) }),
        Some(ConfigError::TooManyChunks { count: 103, max: 100, limit: 10 })
    ));
    assert!(new(UploadConfig { segment_limit: 11, ..config(10) }).is_none());
    assert_eq!(dest.puts(), 0);
}

#[tokio::test]
async fn uploads_a_file_into_a_directory() {
    let file = random_file(FILE_SIZE);
    let mut local = tempfile::tempfile().unwrap();
    local.write_all(&file).unwrap();
    let source = FileSource::new(local).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let dest = Arc::new(FsDestination::new(dir.path(), HashAlgorithm::Blake3));
    let uploader = Uploader::new(Arc::clone(&dest), source, config(100), OutputSink::discard()).unwrap();

    let outcome = uploader.upload(&none()).await;
    assert!(outcome.is_complete());

    let container = dir.path().join("container");
    let mut rebuilt = Vec::new();
    let top = parse_manifest(&std::fs::read(container.join("object")).unwrap()).unwrap();
    for layer in top {
        let layer = std::fs::read(dir.path().join(&layer.path)).unwrap();
        for segment in parse_manifest(&layer).unwrap() {
            rebuilt.extend(std::fs::read(dir.path().join(&segment.path)).unwrap());
        }
    }
    assert_eq!(rebuilt, file);

    // a second pass over the same directory skips everything
    let config = UploadConfig {
        only_missing: true,
        ..config(100)
    };
    let source = FileSource::new({
        let mut local = tempfile::tempfile().unwrap();
        local.write_all(&file).unwrap();
        local
    })
    .unwrap();
    let uploader = Uploader::new(Arc::clone(&dest), source, config, OutputSink::discard()).unwrap();
    let outcome = uploader.upload(&none()).await;
    assert!(outcome.is_complete());
    assert_eq!(outcome.skipped_chunks, 11);
    assert_eq!(outcome.bytes_uploaded, 0);
}

#[derive(Debug)]
struct NeverRetry;

impl RetryStrategy for NeverRetry {
    fn next_delay(&self, _failures: u32) -> Option<Duration> {
        None
    }
}

#[tokio::test]
async fn custom_retry_strategy_replaces_the_policy() {
    let dest = Arc::new(MemDestination::default().failing_puts(1));
    let (uploader, _) = uploader(&dest, random_file(FILE_SIZE), config(100));
    let uploader = uploader.with_retry_strategy(NeverRetry);

    let outcome = uploader.upload(&none()).await;
    assert_eq!(outcome.errors.len(), 1);
    assert!(matches!(
        outcome.errors[0],
        StageError::Upload { index: 0, attempts: 1, .. }
    ));
    assert_eq!(outcome.uploaded_chunks, 10);
}
