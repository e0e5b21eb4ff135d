use crate::digest::Digest;

pub mod fs_impl;
pub mod mem_impl;

/// An entry of a container listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub name: String,
    pub digest: Digest,
}

/// The object store segments and manifests are written to.
///
/// Writes are idempotent: putting an object name again replaces it.
#[async_trait::async_trait]
pub trait Destination: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn list(&self, container: &str) -> Result<Vec<ObjectInfo>, Self::Error>;

    /// Stores `data` and returns the digest the store computed over it.
    async fn put(
        &self,
        container: &str,
        object: &str,
        data: &[u8],
    ) -> Result<Digest, Self::Error>;

    /// Stores a serialized manifest document.
    ///
    /// Stores that materialize a logical object from its manifest (rather than
    /// storing the document verbatim) hook in here.
    async fn put_manifest(
        &self,
        container: &str,
        object: &str,
        document: &[u8],
    ) -> Result<Digest, Self::Error> {
        self.put(container, object, document).await
    }
}
