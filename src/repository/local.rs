//! Local Repository
//!
//! Sharded on-disk content store. Files live at `{root}/{algo}/{hh}/{hash}`
//! where `hh` is the first two hex characters, keeping any single
//! directory's entry count bounded. Writes go to `put-*` temp files inside
//! the root (so the final rename never crosses filesystems) and are renamed
//! into place only after the caller verified the digest.
//!
//! Invariant: a file exists at a final path iff its bytes hash to its name.
//! Partially-written temps never share a final path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::eviction::manager::EvictionManager;
use crate::hashing::{Algorithm, Hasher};
use crate::repository::RemoteContent;
use crate::singleflight::{self, FillTable, Flight};

/// Local filesystem-backed content store.
///
/// Integrates with the eviction manager to track sizes and access recency.
pub struct LocalStore {
    root: PathBuf,
    eviction: Option<Arc<EvictionManager>>,
    fills: FillTable,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>, eviction: Option<Arc<EvictionManager>>) -> Self {
        Self {
            root: root.into(),
            eviction,
            fills: FillTable::new(),
        }
    }

    /// Cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative store key for a digest: `{algo}/{hh}/{hash}`.
    pub fn key(algo: Algorithm, hash: &str) -> String {
        format!("{}/{}/{}", algo, &hash[..2], hash)
    }

    fn final_path(&self, algo: Algorithm, hash: &str) -> PathBuf {
        self.root
            .join(algo.as_str())
            .join(&hash[..2])
            .join(hash)
    }

    /// Check whether the content is committed.
    pub async fn exists(&self, algo: Algorithm, hash: &str) -> Result<bool> {
        match tokio::fs::metadata(self.final_path(algo, hash)).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Open committed content for reading, returning the file and its size.
    ///
    /// Notifies the eviction manager so recency tracking stays current.
    pub async fn open_read(&self, algo: Algorithm, hash: &str) -> Result<(tokio::fs::File, u64)> {
        let file = tokio::fs::File::open(self.final_path(algo, hash)).await?;
        let size = file.metadata().await?.len();
        if let Some(eviction) = &self.eviction {
            eviction.touch(&Self::key(algo, hash));
        }
        Ok((file, size))
    }

    /// Begin writing new content. Bytes accumulate in a temp file inside the
    /// cache root; nothing is visible until [`StoreWriter::commit`].
    pub async fn begin_write(&self, algo: Algorithm, hash: &str) -> Result<StoreWriter> {
        tokio::fs::create_dir_all(&self.root).await?;
        let temp = NamedTempFile::with_prefix_in("put-", &self.root)?;
        let file = tokio::fs::File::from_std(temp.as_file().try_clone()?);
        Ok(StoreWriter {
            temp: Some(temp),
            file,
            final_path: self.final_path(algo, hash),
            key: Self::key(algo, hash),
            eviction: self.eviction.clone(),
            written: 0,
        })
    }

    /// Enumerate committed entries as `(relative_key, size)`.
    ///
    /// Used once at startup to seed eviction accounting. Stray files in the
    /// root (temp files, the link database) are not entries.
    pub fn walk(&self) -> Result<Vec<(String, u64)>> {
        let mut entries = Vec::new();
        let algos = match std::fs::read_dir(&self.root) {
            Ok(iter) => iter,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };

        for algo_dir in algos {
            let algo_dir = algo_dir?;
            if !algo_dir.file_type()?.is_dir() {
                continue;
            }
            let algo_name = algo_dir.file_name();
            for shard_dir in std::fs::read_dir(algo_dir.path())? {
                let shard_dir = shard_dir?;
                if !shard_dir.file_type()?.is_dir() {
                    continue;
                }
                let shard_name = shard_dir.file_name();
                for entry in std::fs::read_dir(shard_dir.path())? {
                    let entry = entry?;
                    let meta = entry.metadata()?;
                    if !meta.is_file() {
                        continue;
                    }
                    let key = format!(
                        "{}/{}/{}",
                        algo_name.to_string_lossy(),
                        shard_name.to_string_lossy(),
                        entry.file_name().to_string_lossy()
                    );
                    entries.push((key, meta.len()));
                }
            }
        }
        Ok(entries)
    }

    /// Delete a committed entry by relative key. Absent files are not an
    /// error: eviction may race a concurrent delete.
    pub fn delete(&self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.root.join(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Store content produced by `fetch` under `(algo, hash)` if missing.
    ///
    /// At most one concurrent fill runs per digest; peers wait for the
    /// leader and then observe the committed file. The digest is verified
    /// before commit, so a lying source never lands in the store.
    pub async fn fill_with<F, Fut>(&self, algo: Algorithm, hash: &str, fetch: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<RemoteContent>>,
    {
        let guard = match self.fills.join(&Self::key(algo, hash)) {
            Flight::Leader(guard) => guard,
            Flight::Follower(outcome) => {
                debug!(algo = %algo, hash, "waiting on in-flight fill");
                singleflight::wait(outcome).await;
                return match self.exists(algo, hash).await? {
                    true => Ok(()),
                    false => Err(Error::NotFound {
                        algo: algo.to_string(),
                        hash: hash.to_string(),
                    }),
                };
            }
        };

        // Double-check after winning the flight: another leader may have
        // committed between our miss and the join.
        if self.exists(algo, hash).await? {
            guard.complete(true);
            return Ok(());
        }

        let result = self.fill_leader(algo, hash, fetch).await;
        guard.complete(result.is_ok());
        result
    }

    async fn fill_leader<F, Fut>(&self, algo: Algorithm, hash: &str, fetch: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<RemoteContent>>,
    {
        let content = fetch().await?;
        let expected_len = content.len;
        let mut stream = content.stream;

        let mut writer = self.begin_write(algo, hash).await?;
        let mut hasher = Hasher::new(algo);

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            writer.write_all(&chunk).await?;
        }

        let actual = hasher.finish();
        if actual != hash {
            warn!(algo = %algo, expected = hash, actual = %actual, "refusing to store mismatched content");
            return Err(Error::HashMismatch {
                expected: hash.to_string(),
                actual,
            });
        }
        if writer.written() != expected_len {
            return Err(Error::Internal(format!(
                "size mismatch: expected {expected_len}, wrote {}",
                writer.written()
            )));
        }

        let size = writer.commit().await?;
        info!(algo = %algo, hash, size, "stored content");
        Ok(())
    }
}

/// In-progress write to the local store.
///
/// The temp file is removed automatically on every non-commit exit path.
pub struct StoreWriter {
    temp: Option<NamedTempFile>,
    file: tokio::fs::File,
    final_path: PathBuf,
    key: String,
    eviction: Option<Arc<EvictionManager>>,
    written: u64,
}

impl StoreWriter {
    /// Append bytes to the temp file.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.file.write_all(buf).await?;
        self.written += buf.len() as u64;
        Ok(())
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Atomically publish the temp file at its final path and notify
    /// eviction accounting. Returns the committed size.
    pub async fn commit(mut self) -> Result<u64> {
        self.file.flush().await?;
        if let Some(parent) = self.final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp = self
            .temp
            .take()
            .ok_or_else(|| Error::Internal("store writer already committed".into()))?;
        temp.persist(&self.final_path)
            .map_err(|e| Error::Io(e.error))?;
        if let Some(eviction) = &self.eviction {
            eviction.add(&self.key, self.written);
        }
        Ok(self.written)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    const CONTENT: &[u8] = b"test content";
    const CONTENT_SHA256: &str = "6ae8a75555209fd6c44157c0aed8016e763ff435a19cf186f76863140143ff72";

    fn store(dir: &tempfile::TempDir) -> LocalStore {
        LocalStore::new(dir.path(), None)
    }

    fn content_stream(data: &'static [u8]) -> RemoteContent {
        RemoteContent {
            stream: Box::pin(stream::once(async move {
                Ok(bytes::Bytes::from_static(data))
            })),
            len: data.len() as u64,
        }
    }

    #[tokio::test]
    async fn test_write_commit_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        let mut writer = store
            .begin_write(Algorithm::Sha256, CONTENT_SHA256)
            .await
            .unwrap();
        writer.write_all(CONTENT).await.unwrap();
        let size = writer.commit().await.unwrap();
        assert_eq!(size, CONTENT.len() as u64);

        assert!(store.exists(Algorithm::Sha256, CONTENT_SHA256).await.unwrap());

        let (mut file, size) = store
            .open_read(Algorithm::Sha256, CONTENT_SHA256)
            .await
            .unwrap();
        assert_eq!(size, CONTENT.len() as u64);

        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut file, &mut buf)
            .await
            .unwrap();
        assert_eq!(buf, CONTENT);
    }

    #[tokio::test]
    async fn test_sharded_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        let mut writer = store
            .begin_write(Algorithm::Sha256, CONTENT_SHA256)
            .await
            .unwrap();
        writer.write_all(CONTENT).await.unwrap();
        writer.commit().await.unwrap();

        let expected = dir
            .path()
            .join("sha256")
            .join(&CONTENT_SHA256[..2])
            .join(CONTENT_SHA256);
        assert!(expected.is_file());
    }

    #[tokio::test]
    async fn test_uncommitted_temp_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        let mut writer = store
            .begin_write(Algorithm::Sha256, CONTENT_SHA256)
            .await
            .unwrap();
        writer.write_all(b"partial bytes").await.unwrap();
        drop(writer);

        assert!(!store.exists(Algorithm::Sha256, CONTENT_SHA256).await.unwrap());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("put-"))
            .collect();
        assert!(leftovers.is_empty(), "temp files must not outlive the writer");
    }

    #[tokio::test]
    async fn test_walk_enumerates_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        let mut writer = store
            .begin_write(Algorithm::Sha256, CONTENT_SHA256)
            .await
            .unwrap();
        writer.write_all(CONTENT).await.unwrap();
        writer.commit().await.unwrap();

        // A stray root-level file (the link DB) is not an entry.
        std::fs::write(dir.path().join("links.db"), b"sqlite").unwrap();

        let entries = store.walk().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0],
            (
                LocalStore::key(Algorithm::Sha256, CONTENT_SHA256),
                CONTENT.len() as u64
            )
        );
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        let mut writer = store
            .begin_write(Algorithm::Sha256, CONTENT_SHA256)
            .await
            .unwrap();
        writer.write_all(CONTENT).await.unwrap();
        writer.commit().await.unwrap();

        let key = LocalStore::key(Algorithm::Sha256, CONTENT_SHA256);
        store.delete(&key).unwrap();
        assert!(!store.exists(Algorithm::Sha256, CONTENT_SHA256).await.unwrap());
        // Second delete of the same key is fine.
        store.delete(&key).unwrap();
    }

    #[tokio::test]
    async fn test_fill_with_verifies_digest() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        let err = store
            .fill_with(Algorithm::Sha256, CONTENT_SHA256, || async {
                Ok(content_stream(b"wrong content"))
            })
            .await
            .unwrap_err();
        assert!(err.is_hash_mismatch());
        assert!(!store.exists(Algorithm::Sha256, CONTENT_SHA256).await.unwrap());

        store
            .fill_with(Algorithm::Sha256, CONTENT_SHA256, || async {
                Ok(content_stream(CONTENT))
            })
            .await
            .unwrap();
        assert!(store.exists(Algorithm::Sha256, CONTENT_SHA256).await.unwrap());
    }

    #[tokio::test]
    async fn test_fill_with_skips_fetch_on_hit() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        let mut writer = store
            .begin_write(Algorithm::Sha256, CONTENT_SHA256)
            .await
            .unwrap();
        writer.write_all(CONTENT).await.unwrap();
        writer.commit().await.unwrap();

        store
            .fill_with(Algorithm::Sha256, CONTENT_SHA256, || async {
                panic!("fetch must not run for committed content")
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_fill_with_propagates_fetch_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        let err = store
            .fill_with(Algorithm::Sha256, CONTENT_SHA256, || async {
                Err(crate::error::Error::HttpStatus { code: 502 })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::HttpStatus { code: 502 }));
    }

    #[tokio::test]
    async fn test_fill_with_single_flight() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalStore::new(dir.path(), None));
        let fetches = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let fetches = Arc::clone(&fetches);
            handles.push(tokio::spawn(async move {
                store
                    .fill_with(Algorithm::Sha256, CONTENT_SHA256, move || async move {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        Ok(content_stream(CONTENT))
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(fetches.load(Ordering::SeqCst), 1, "only the leader fetches");
        assert!(store.exists(Algorithm::Sha256, CONTENT_SHA256).await.unwrap());
    }
}
