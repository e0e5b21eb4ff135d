//! Which chunks are already durable at the destination.

use std::collections::HashMap;

use crate::backend::ObjectInfo;
use crate::chunker::Chunk;
use crate::digest::Digest;
use crate::manifest::{parse_manifest, ManifestEntry};

#[derive(Debug, Default)]
pub enum Membership {
    /// Everything gets uploaded.
    #[default]
    Nothing,
    /// A live listing of the container, by object name.
    Listing(HashMap<String, Digest>),
    /// The entries of a manifest saved by an earlier session, by path.
    Previous(HashMap<String, ManifestEntry>),
}

impl Membership {
    pub fn from_listing(objects: Vec<ObjectInfo>) -> Self {
        Self::Listing(objects.into_iter().map(|o| (o.name, o.digest)).collect())
    }

    pub fn from_manifest(document: &[u8]) -> Result<Self, serde_json::Error> {
        let entries = parse_manifest(document)?;
        Ok(Self::Previous(
            entries.into_iter().map(|e| (e.path.clone(), e)).collect(),
        ))
    }

    pub fn is_resume(&self) -> bool {
        matches!(self, Self::Previous(_))
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Nothing => 0,
            Self::Listing(objects) => objects.len(),
            Self::Previous(entries) => entries.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Marks `chunk` as skipped if it is already present, taking over the
    /// digest (and for saved manifests, the size) recorded for it.
    pub fn mark(&self, mut chunk: Chunk) -> Chunk {
        match self {
            Self::Nothing => {}
            Self::Listing(objects) => {
                if let Some(digest) = objects.get(&chunk.object) {
                    chunk.digest = Some(digest.clone());
                    chunk.skipped = true;
                }
            }
            Self::Previous(entries) => {
                if let Some(entry) = entries.get(&chunk.path()) {
                    chunk.digest = Some(entry.digest.clone());
                    chunk.size = entry.size;
                    chunk.skipped = true;
                }
            }
        }
        if chunk.skipped {
            tracing::debug!(index = chunk.index, object = %chunk.object, "chunk already present");
        }
        chunk
    }
}
