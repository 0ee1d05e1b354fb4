//! Content Repositories
//!
//! A repository is a read view onto content-addressed bytes: the local
//! sharded store on disk, or another fetchurl server reached over HTTP.
//! The fetch service consults repositories by `(algorithm, hash)` and never
//! sees where the bytes actually live.

pub mod local;
pub mod upstream;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use crate::error::Result;
use crate::hashing::Algorithm;

pub use local::{LocalStore, StoreWriter};
pub use upstream::UpstreamRepository;

/// Stream of content bytes.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Content returned by a repository or source: the raw byte stream plus the
/// length the peer committed to. Verification is the caller's concern.
pub struct RemoteContent {
    pub stream: ByteStream,
    pub len: u64,
}

impl std::fmt::Debug for RemoteContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteContent")
            .field("len", &self.len)
            .finish()
    }
}

/// Read port onto a content-addressed repository.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Check whether the repository holds the content.
    async fn exists(&self, algo: Algorithm, hash: &str) -> Result<bool>;

    /// Open the content for reading. `Ok(None)` means the repository does
    /// not hold it (including any upstream refusal); only transport-level
    /// surprises surface as errors.
    async fn fetch(&self, algo: Algorithm, hash: &str) -> Result<Option<RemoteContent>>;
}
