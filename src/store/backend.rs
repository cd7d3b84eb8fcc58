//! Cache Backend Abstraction
//!
//! The remote cache is file based: a save uploads a staged file under a key,
//! a restore downloads the entry into a staging directory. Keys are
//! immutable once written.
//!
//! Implementations:
//! - `InMemoryCache`: unit tests
//! - `LocalFsCache`: directory-backed, for development; publishes with a
//!   no-clobber link so concurrent writers of one key cannot both succeed
//! - `SimulatedCache`: fault injection wrapper (see `simulated.rs`)

use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

/// File name used for restored entries inside a staging directory
pub const RESTORED_FILE: &str = "restored.json";

pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = IoResult<T>> + Send + 'a>>;

pub trait CacheBackend: Send + Sync + 'static {
    /// Upload `staged` under `key`.
    ///
    /// Fails with `ErrorKind::AlreadyExists` when the key is taken.
    fn save<'a>(&'a self, key: &'a str, staged: &'a Path) -> BackendFuture<'a, ()>;

    /// Download the entry for `key` into `staging_dir`.
    ///
    /// `Ok(None)` is a clean miss.
    fn restore<'a>(&'a self, key: &'a str, staging_dir: &'a Path)
        -> BackendFuture<'a, Option<PathBuf>>;

    fn exists<'a>(&'a self, key: &'a str) -> BackendFuture<'a, bool>;
}

impl<T: CacheBackend + ?Sized> CacheBackend for Arc<T> {
    fn save<'a>(&'a self, key: &'a str, staged: &'a Path) -> BackendFuture<'a, ()> {
        (**self).save(key, staged)
    }

    fn restore<'a>(
        &'a self,
        key: &'a str,
        staging_dir: &'a Path,
    ) -> BackendFuture<'a, Option<PathBuf>> {
        (**self).restore(key, staging_dir)
    }

    fn exists<'a>(&'a self, key: &'a str) -> BackendFuture<'a, bool> {
        (**self).exists(key)
    }
}

fn already_exists(key: &str) -> IoError {
    IoError::new(ErrorKind::AlreadyExists, format!("cache entry exists: {}", key))
}

// ============================================================================
// InMemoryCache - For tests
// ============================================================================

/// In-memory cache; clones share entries
#[derive(Debug, Clone, Default)]
pub struct InMemoryCache {
    entries: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.read().get(key).cloned()
    }

    /// Write raw bytes under a key, bypassing staging (for tests)
    pub fn insert_raw(&self, key: &str, bytes: Vec<u8>) {
        self.entries.write().insert(key.to_string(), bytes);
    }
}

impl CacheBackend for InMemoryCache {
    fn save<'a>(&'a self, key: &'a str, staged: &'a Path) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let data = tokio::fs::read(staged).await?;
            let mut entries = self.entries.write();
            if entries.contains_key(key) {
                return Err(already_exists(key));
            }
            entries.insert(key.to_string(), data);
            Ok(())
        })
    }

    fn restore<'a>(
        &'a self,
        key: &'a str,
        staging_dir: &'a Path,
    ) -> BackendFuture<'a, Option<PathBuf>> {
        Box::pin(async move {
            let data = self.entries.read().get(key).cloned();
            match data {
                Some(data) => {
                    let path = staging_dir.join(RESTORED_FILE);
                    tokio::fs::write(&path, data).await?;
                    Ok(Some(path))
                }
                None => Ok(None),
            }
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> BackendFuture<'a, bool> {
        Box::pin(async move { Ok(self.entries.read().contains_key(key)) })
    }
}

// ============================================================================
// LocalFsCache - For development
// ============================================================================

/// Directory-backed cache, one file per key
#[derive(Debug, Clone)]
pub struct LocalFsCache {
    base_path: PathBuf,
}

impl LocalFsCache {
    pub fn new(base_path: PathBuf) -> Self {
        LocalFsCache { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Keys contain ':', which is not portable in file names
    fn full_path(&self, key: &str) -> PathBuf {
        let mut name = String::with_capacity(key.len() + 8);
        for c in key.chars() {
            match c {
                '%' => name.push_str("%25"),
                ':' => name.push_str("%3A"),
                '/' => name.push_str("%2F"),
                '\\' => name.push_str("%5C"),
                c => name.push(c),
            }
        }
        name.push_str(".json");
        self.base_path.join(name)
    }
}

impl CacheBackend for LocalFsCache {
    fn save<'a>(&'a self, key: &'a str, staged: &'a Path) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let base = self.base_path.clone();
            let path = self.full_path(key);
            let staged = staged.to_path_buf();
            let published =
                tokio::task::spawn_blocking(move || publish_noclobber(&base, &staged, &path))
                    .await
                    .map_err(IoError::other)?;
            match published {
                Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(already_exists(key)),
                other => other,
            }
        })
    }

    fn restore<'a>(
        &'a self,
        key: &'a str,
        staging_dir: &'a Path,
    ) -> BackendFuture<'a, Option<PathBuf>> {
        Box::pin(async move {
            let path = self.full_path(key);
            let target = staging_dir.join(RESTORED_FILE);
            match tokio::fs::copy(&path, &target).await {
                Ok(_) => Ok(Some(target)),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e),
            }
        })
    }

    fn exists<'a>(&'a self, key: &'a str) -> BackendFuture<'a, bool> {
        Box::pin(async move { tokio::fs::try_exists(self.full_path(key)).await })
    }
}

/// Copy `staged` into a uniquely named file under `base`, then link it to
/// `target` only if `target` does not exist. Concurrent writers of one key
/// race on the final step, which the filesystem decides atomically.
fn publish_noclobber(base: &Path, staged: &Path, target: &Path) -> IoResult<()> {
    std::fs::create_dir_all(base)?;
    let mut tmp = tempfile::Builder::new()
        .prefix(".upload-")
        .suffix(".tmp")
        .tempfile_in(base)?;
    let mut source = std::fs::File::open(staged)?;
    std::io::copy(&mut source, tmp.as_file_mut())?;
    tmp.as_file().sync_all()?;
    // The temp file is removed when the error drops
    tmp.persist_noclobber(target).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn staged(dir: &Path, bytes: &[u8]) -> PathBuf {
        let path = dir.join("staged.json");
        tokio::fs::write(&path, bytes).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_inmemory_save_restore() {
        let dir = tempfile::tempdir().unwrap();
        let cache = InMemoryCache::new();
        let file = staged(dir.path(), b"{\"a\":1}").await;

        cache.save("p:r:events:v1.0.0:2024-01-01", &file).await.unwrap();
        assert!(cache.exists("p:r:events:v1.0.0:2024-01-01").await.unwrap());

        let restored = cache
            .restore("p:r:events:v1.0.0:2024-01-01", dir.path())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(std::fs::read(restored).unwrap(), b"{\"a\":1}");
    }

    #[tokio::test]
    async fn test_inmemory_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = InMemoryCache::new();
        assert!(cache.restore("missing", dir.path()).await.unwrap().is_none());
        assert!(!cache.exists("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_inmemory_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let cache = InMemoryCache::new();
        let file = staged(dir.path(), b"first").await;
        cache.save("k", &file).await.unwrap();

        let file = staged(dir.path(), b"second").await;
        let err = cache.save("k", &file).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(cache.get("k").unwrap(), b"first");
    }

    #[tokio::test]
    async fn test_localfs_roundtrip() {
        let root = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let cache = LocalFsCache::new(root.path().join("cache"));
        let key = "p:acme_widgets:aggregated:v1.0.0:2024-03-01";

        assert!(cache.restore(key, work.path()).await.unwrap().is_none());

        let file = staged(work.path(), b"payload").await;
        cache.save(key, &file).await.unwrap();
        assert!(cache.exists(key).await.unwrap());

        let err = cache.save(key, &file).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        let restored = cache.restore(key, work.path()).await.unwrap().unwrap();
        assert_eq!(std::fs::read(restored).unwrap(), b"payload");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_localfs_concurrent_same_key_saves_one_winner() {
        let root = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let cache = Arc::new(LocalFsCache::new(root.path().join("cache")));
        let first = staged(work.path(), b"first").await;
        let second = work.path().join("second.json");
        tokio::fs::write(&second, b"second").await.unwrap();

        for round in 0..100 {
            let key = format!("p:acme_widgets:events:v1.0.0:{}", round);
            let a = {
                let (cache, key, file) = (cache.clone(), key.clone(), first.clone());
                tokio::spawn(async move { cache.save(&key, &file).await })
            };
            let b = {
                let (cache, key, file) = (cache.clone(), key.clone(), second.clone());
                tokio::spawn(async move { cache.save(&key, &file).await })
            };
            let results = [a.await.unwrap(), b.await.unwrap()];

            let winners = results.iter().filter(|r| r.is_ok()).count();
            assert_eq!(winners, 1, "round {}", round);
            let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
            assert_eq!(loser.kind(), ErrorKind::AlreadyExists, "round {}", round);

            let stored = std::fs::read(cache.full_path(&key)).unwrap();
            let expected: &[u8] = if results[0].is_ok() { b"first" } else { b"second" };
            assert_eq!(stored, expected, "round {}", round);
        }

        // Only published entries remain; no temp files leak
        let names: Vec<String> = std::fs::read_dir(root.path().join("cache"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 100);
        assert!(names.iter().all(|n| n.ends_with(".json")));
    }

    #[test]
    fn test_localfs_file_names_are_distinct() {
        let cache = LocalFsCache::new(PathBuf::from("/cache"));
        assert_ne!(cache.full_path("a:b_c"), cache.full_path("a_b:c"));
        assert_ne!(cache.full_path("a%3Ab"), cache.full_path("a:b"));
        assert_eq!(cache.full_path("a:b").parent(), Some(Path::new("/cache")));
    }

    #[tokio::test]
    async fn test_arc_backend_delegates() {
        let dir = tempfile::tempdir().unwrap();
        let cache: Arc<dyn CacheBackend> = Arc::new(InMemoryCache::new());
        let file = staged(dir.path(), b"x").await;
        cache.save("k", &file).await.unwrap();
        assert!(cache.exists("k").await.unwrap());
    }
}
