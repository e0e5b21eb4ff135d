use std::io;
use std::path::{Path, PathBuf};

use super::{Destination, ObjectInfo};
use crate::digest::{Digest, HashAlgorithm};

/// A destination that keeps each container as a directory and each object as
/// a file inside it.
///
/// Manifests are stored as their JSON document. Object names must not contain
/// path separators.
#[derive(Debug, Clone)]
pub struct FsDestination {
    root: PathBuf,
    algorithm: HashAlgorithm,
}

impl FsDestination {
    pub fn new(root: impl Into<PathBuf>, algorithm: HashAlgorithm) -> Self {
        Self {
            root: root.into(),
            algorithm,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, container: &str, object: &str) -> io::Result<PathBuf> {
        for name in [container, object] {
            if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid object name {name:?}"),
                ));
            }
        }
        Ok(self.root.join(container).join(object))
    }
}

#[async_trait::async_trait]
impl Destination for FsDestination {
    type Error = io::Error;

    async fn list(&self, container: &str) -> io::Result<Vec<ObjectInfo>> {
        let dir = self.root.join(container);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => return Err(err),
        };

        let mut objects = vec![];
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            // an interrupted write leaves its temporary file behind
            if name.starts_with('.') {
                continue;
            }
            let data = tokio::fs::read(entry.path()).await?;
            let algorithm = self.algorithm;
            let digest = tokio::task::spawn_blocking(move || algorithm.digest(&data))
                .await
                .map_err(io::Error::other)?;
            objects.push(ObjectInfo { name, digest });
        }
        Ok(objects)
    }

    async fn put(&self, container: &str, object: &str, data: &[u8]) -> io::Result<Digest> {
        let path = self.object_path(container, object)?;
        let dir = self.root.join(container);
        tokio::fs::create_dir_all(&dir).await?;

        // write to a temporary name first so a listing never sees a partial object
        let tmp = dir.join(format!(".{object}.partial"));
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!(path = %path.display(), size = data.len(), "wrote object");

        let data = data.to_vec();
        let algorithm = self.algorithm;
        tokio::task::spawn_blocking(move || algorithm.digest(&data))
            .await
            .map_err(io::Error::other)
    }
}
