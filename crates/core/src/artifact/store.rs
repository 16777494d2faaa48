//! File system artifact cache.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::error::StorageError;
use super::types::{
    artifact_file_name, is_safe_task_id, parse_artifact_file_name, Artifact, ArtifactKind,
    CacheEntry, CacheStats,
};
use crate::config::StorageConfig;
use crate::metrics::{ARTIFACT_BYTES_STORED, CACHE_EVICTIONS};

const HASH_BUFFER_SIZE: usize = 64 * 1024;
const PART_SUFFIX: &str = "part";

/// Cache limits for the artifact store.
#[derive(Debug, Clone)]
pub struct ArtifactStoreConfig {
    pub download_dir: PathBuf,
    pub max_bytes: u64,
    /// Entries younger than this are never evicted for size.
    pub min_retention: Duration,
    /// Entries older than this are purged by [`ArtifactStore::sweep_expired`].
    pub max_age: Duration,
}

impl From<&StorageConfig> for ArtifactStoreConfig {
    fn from(storage: &StorageConfig) -> Self {
        Self {
            download_dir: storage.download_dir.clone(),
            max_bytes: storage.max_cache_bytes(),
            min_retention: storage.min_retention(),
            max_age: storage.max_age(),
        }
    }
}

#[derive(Debug, Default)]
struct CacheIndex {
    entries: HashMap<String, CacheEntry>,
    total_bytes: u64,
}

impl CacheIndex {
    fn insert(&mut self, key: String, entry: CacheEntry) -> Option<CacheEntry> {
        self.total_bytes += entry.artifact.size;
        let previous = self.entries.insert(key, entry);
        if let Some(ref old) = previous {
            self.total_bytes = self.total_bytes.saturating_sub(old.artifact.size);
        }
        previous
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let removed = self.entries.remove(key);
        if let Some(ref entry) = removed {
            self.total_bytes = self.total_bytes.saturating_sub(entry.artifact.size);
        }
        removed
    }
}

/// Content-hashed, size-bounded cache of downloaded artifacts.
///
/// All mutations go through one async mutex so concurrent tasks cannot race
/// each other's index updates.
pub struct ArtifactStore {
    config: ArtifactStoreConfig,
    index: Mutex<CacheIndex>,
}

impl ArtifactStore {
    pub fn new(config: ArtifactStoreConfig) -> Self {
        Self {
            config,
            index: Mutex::new(CacheIndex::default()),
        }
    }

    pub fn config(&self) -> &ArtifactStoreConfig {
        &self.config
    }

    /// Final path for an artifact of `kind` belonging to `task_id`.
    ///
    /// Fails for ids that would resolve outside the download directory.
    pub fn path_for(&self, task_id: &str, kind: ArtifactKind) -> Result<PathBuf, StorageError> {
        if !is_safe_task_id(task_id) {
            return Err(StorageError::UnsafeTaskId(task_id.to_string()));
        }
        Ok(self
            .config
            .download_dir
            .join(artifact_file_name(task_id, kind)))
    }

    /// Write `bytes` as the artifact for `task_id`, then evict if over budget.
    pub async fn materialize(
        &self,
        task_id: &str,
        kind: ArtifactKind,
        bytes: &[u8],
    ) -> Result<Artifact, StorageError> {
        self.materialize_at(task_id, kind, bytes, Utc::now()).await
    }

    /// [`Self::materialize`] at an explicit clock reading.
    pub async fn materialize_at(
        &self,
        task_id: &str,
        kind: ArtifactKind,
        bytes: &[u8],
        now: DateTime<Utc>,
    ) -> Result<Artifact, StorageError> {
        let mut index = self.index.lock().await;

        let destination = self.path_for(task_id, kind)?;
        self.ensure_dir().await?;
        let staging = destination.with_extension(format!("{}.{}", kind.extension(), PART_SUFFIX));

        write_file(&staging, bytes).await?;
        if let Err(error) = fs::rename(&staging, &destination).await {
            let _ = fs::remove_file(&staging).await;
            return Err(StorageError::MoveFailed {
                source: staging,
                destination,
                error,
            });
        }

        let artifact = Artifact {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            task_id: task_id.to_string(),
            path: destination,
            size: bytes.len() as u64,
            hash: format!("{:x}", Sha256::digest(bytes)),
            fetched_at: now,
        };

        self.record(&mut index, artifact.clone(), now);
        self.evict_locked(&mut index, now).await;

        Ok(artifact)
    }

    /// Move an already-downloaded file into the cache.
    ///
    /// Used for REST side fetches, which stream to disk instead of memory.
    pub async fn adopt(
        &self,
        task_id: &str,
        kind: ArtifactKind,
        staged: &Path,
    ) -> Result<Artifact, StorageError> {
        let now = Utc::now();
        let mut index = self.index.lock().await;

        let destination = self.path_for(task_id, kind)?;
        self.ensure_dir().await?;
        let (size, hash) = hash_file(staged).await?;

        if !try_atomic_move(staged, &destination).await.map_err(|error| {
            StorageError::MoveFailed {
                source: staged.to_path_buf(),
                destination: destination.clone(),
                error,
            }
        })? {
            // Different filesystem: copy, then drop the staged file.
            fs::copy(staged, &destination)
                .await
                .map_err(|error| StorageError::MoveFailed {
                    source: staged.to_path_buf(),
                    destination: destination.clone(),
                    error,
                })?;
            if let Err(e) = fs::remove_file(staged).await {
                warn!("Failed to remove staged file {:?}: {}", staged, e);
            }
        }

        let artifact = Artifact {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            task_id: task_id.to_string(),
            path: destination,
            size,
            hash,
            fetched_at: now,
        };

        self.record(&mut index, artifact.clone(), now);
        self.evict_locked(&mut index, now).await;

        Ok(artifact)
    }

    fn record(&self, index: &mut CacheIndex, artifact: Artifact, now: DateTime<Utc>) {
        let key = artifact_file_name(&artifact.task_id, artifact.kind);
        let kind = artifact.kind.to_string();
        ARTIFACT_BYTES_STORED
            .with_label_values(&[kind.as_str()])
            .inc_by(artifact.size);
        info!(
            task_id = %artifact.task_id,
            kind = %artifact.kind,
            size = artifact.size,
            "Stored artifact {:?}",
            artifact.path
        );
        if let Some(old) = index.insert(
            key,
            CacheEntry {
                artifact,
                last_access: now,
            },
        ) {
            debug!("Superseded artifact {} ({})", old.artifact.id, old.artifact.hash);
        }
    }

    /// Look up an artifact and refresh its recency.
    pub async fn get(&self, task_id: &str, kind: ArtifactKind) -> Option<Artifact> {
        self.get_at(task_id, kind, Utc::now()).await
    }

    /// [`Self::get`] at an explicit clock reading.
    pub async fn get_at(
        &self,
        task_id: &str,
        kind: ArtifactKind,
        now: DateTime<Utc>,
    ) -> Option<Artifact> {
        let mut index = self.index.lock().await;
        let entry = index.entries.get_mut(&artifact_file_name(task_id, kind))?;
        entry.last_access = now;
        Some(entry.artifact.clone())
    }

    /// Evict least-recently-accessed entries until the cache fits its budget.
    pub async fn evict(&self) -> usize {
        self.evict_at(Utc::now()).await
    }

    /// [`Self::evict`] at an explicit clock reading.
    pub async fn evict_at(&self, now: DateTime<Utc>) -> usize {
        let mut index = self.index.lock().await;
        self.evict_locked(&mut index, now).await
    }

    async fn evict_locked(&self, index: &mut CacheIndex, now: DateTime<Utc>) -> usize {
        if index.total_bytes <= self.config.max_bytes {
            return 0;
        }

        let floor = ChronoDuration::from_std(self.config.min_retention)
            .unwrap_or_else(|_| ChronoDuration::zero());

        let mut candidates: Vec<(DateTime<Utc>, String)> = index
            .entries
            .iter()
            .filter(|(_, entry)| now - entry.artifact.fetched_at >= floor)
            .map(|(key, entry)| (entry.last_access, key.clone()))
            .collect();
        candidates.sort();

        let mut evicted = 0;
        for (_, key) in candidates {
            if index.total_bytes <= self.config.max_bytes {
                break;
            }
            if self.delete_entry(index, &key, "budget").await {
                evicted += 1;
            }
        }

        if index.total_bytes > self.config.max_bytes {
            debug!(
                total_bytes = index.total_bytes,
                budget = self.config.max_bytes,
                "Cache over budget, remaining entries are within the retention floor"
            );
        }

        evicted
    }

    /// Remove every entry older than the configured max age, plus stale
    /// `.part` files left behind by interrupted writes.
    pub async fn sweep_expired(&self) -> Result<usize, StorageError> {
        self.sweep_expired_at(Utc::now()).await
    }

    /// [`Self::sweep_expired`] at an explicit clock reading.
    pub async fn sweep_expired_at(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut index = self.index.lock().await;
        let max_age =
            ChronoDuration::from_std(self.config.max_age).unwrap_or_else(|_| ChronoDuration::weeks(5200));

        let expired: Vec<String> = index
            .entries
            .iter()
            .filter(|(_, entry)| now - entry.artifact.fetched_at > max_age)
            .map(|(key, _)| key.clone())
            .collect();

        let mut removed = 0;
        for key in expired {
            if self.delete_entry(&mut index, &key, "expired").await {
                removed += 1;
            }
        }

        removed += self.remove_stale_parts(now, max_age).await?;

        if removed > 0 {
            info!("Cache sweep removed {} files", removed);
        }
        Ok(removed)
    }

    async fn remove_stale_parts(
        &self,
        now: DateTime<Utc>,
        max_age: ChronoDuration,
    ) -> Result<usize, StorageError> {
        let mut dir = match fs::read_dir(&self.config.download_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StorageError::read_failed(&self.config.download_dir, e)),
        };

        let mut removed = 0;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(PART_SUFFIX) {
                continue;
            }
            let modified: DateTime<Utc> = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(time) => time.into(),
                Err(_) => continue,
            };
            if now - modified > max_age && fs::remove_file(&path).await.is_ok() {
                debug!("Removed stale partial file {:?}", path);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn delete_entry(&self, index: &mut CacheIndex, key: &str, reason: &str) -> bool {
        let Some(entry) = index.entries.get(key) else {
            return false;
        };
        let path = entry.artifact.path.clone();
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!("Failed to evict {:?}: {}", path, e);
                return false;
            }
        }
        index.remove(key);
        CACHE_EVICTIONS.with_label_values(&[reason]).inc();
        debug!(reason, "Evicted {:?}", path);
        true
    }

    /// Index artifacts already present in the download directory.
    ///
    /// File modification time stands in for `fetched_at` and `last_access`.
    pub async fn load_existing(&self) -> Result<usize, StorageError> {
        let mut index = self.index.lock().await;
        let mut dir = match fs::read_dir(&self.config.download_dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StorageError::read_failed(&self.config.download_dir, e)),
        };

        let mut loaded = 0;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let Some((task_id, kind)) = parse_artifact_file_name(&path) else {
                continue;
            };
            let modified: DateTime<Utc> = entry
                .metadata()
                .await
                .and_then(|m| m.modified())
                .map(Into::into)
                .unwrap_or_else(|_| Utc::now());
            let (size, hash) = hash_file(&path).await?;

            let key = artifact_file_name(&task_id, kind);
            index.insert(
                key,
                CacheEntry {
                    artifact: Artifact {
                        id: uuid::Uuid::new_v4().to_string(),
                        kind,
                        task_id,
                        path,
                        size,
                        hash,
                        fetched_at: modified,
                    },
                    last_access: modified,
                },
            );
            loaded += 1;
        }

        if loaded > 0 {
            info!(
                "Indexed {} existing artifacts ({} bytes)",
                loaded, index.total_bytes
            );
        }
        Ok(loaded)
    }

    pub async fn stats(&self) -> CacheStats {
        let index = self.index.lock().await;
        CacheStats {
            entries: index.entries.len(),
            total_bytes: index.total_bytes,
            budget_bytes: self.config.max_bytes,
        }
    }

    async fn ensure_dir(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.config.download_dir)
            .await
            .map_err(|source| StorageError::DirectoryCreationFailed {
                path: self.config.download_dir.clone(),
                source,
            })
    }
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let mut file = File::create(path)
        .await
        .map_err(|e| StorageError::write_failed(path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| StorageError::write_failed(path, e))?;
    file.sync_all()
        .await
        .map_err(|e| StorageError::write_failed(path, e))?;
    Ok(())
}

/// Size and hex SHA-256 of a file, streamed.
async fn hash_file(path: &Path) -> Result<(u64, String), StorageError> {
    let file = File::open(path)
        .await
        .map_err(|e| StorageError::read_failed(path, e))?;
    let mut reader = BufReader::with_capacity(HASH_BUFFER_SIZE, file);
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    let mut hasher = Sha256::new();
    let mut total = 0u64;

    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .await
            .map_err(|e| StorageError::read_failed(path, e))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
        total += bytes_read as u64;
    }

    Ok((total, format!("{:x}", hasher.finalize())))
}

/// Rename, reporting `false` when source and destination are on different filesystems.
async fn try_atomic_move(source: &Path, destination: &Path) -> Result<bool, std::io::Error> {
    match fs::rename(source, destination).await {
        Ok(()) => Ok(true),
        Err(e) => {
            if e.kind() == std::io::ErrorKind::CrossesDevices || e.raw_os_error() == Some(18) {
                Ok(false)
            } else {
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MB: u64 = 1024 * 1024;

    fn store(dir: &TempDir, max_bytes: u64) -> ArtifactStore {
        ArtifactStore::new(ArtifactStoreConfig {
            download_dir: dir.path().join("downloads"),
            max_bytes,
            min_retention: Duration::from_secs(10),
            max_age: Duration::from_secs(24 * 3600),
        })
    }

    #[tokio::test]
    async fn test_materialize_writes_named_file() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, MB);

        let artifact = store
            .materialize("task-1", ArtifactKind::Mesh, b"glTF-binary")
            .await
            .unwrap();

        assert_eq!(artifact.path, dir.path().join("downloads/task-1_output.glb"));
        assert_eq!(artifact.size, 11);
        assert_eq!(artifact.hash, format!("{:x}", Sha256::digest(b"glTF-binary")));
        assert_eq!(std::fs::read(&artifact.path).unwrap(), b"glTF-binary");
        assert!(!dir.path().join("downloads/task-1_output.glb.part").exists());

        let stats = store.stats().await;
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.total_bytes, 11);
    }

    #[tokio::test]
    async fn test_refetch_supersedes_entry() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, MB);

        let first = store
            .materialize("task-1", ArtifactKind::Video, b"old video")
            .await
            .unwrap();
        let second = store
            .materialize("task-1", ArtifactKind::Video, b"new")
            .await
            .unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(first.path, second.path);
        assert_eq!(std::fs::read(&second.path).unwrap(), b"new");
        let stats = store.stats().await;
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.total_bytes, 3);
        assert_eq!(
            store.get("task-1", ArtifactKind::Video).await.unwrap().id,
            second.id
        );
    }

    #[tokio::test]
    async fn test_eviction_is_lru_and_respects_retention_floor() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 20);
        let t0 = Utc::now();

        let a = store
            .materialize_at("a", ArtifactKind::Mesh, &[0u8; 8], t0)
            .await
            .unwrap();
        let b = store
            .materialize_at("b", ArtifactKind::Mesh, &[0u8; 8], t0)
            .await
            .unwrap();
        // Touch `a` so `b` becomes least recently used.
        store
            .get_at("a", ArtifactKind::Mesh, t0 + ChronoDuration::seconds(1))
            .await
            .unwrap();

        // Over budget, but everything is younger than the floor.
        let c = store
            .materialize_at("c", ArtifactKind::Mesh, &[0u8; 8], t0 + ChronoDuration::seconds(2))
            .await
            .unwrap();
        assert_eq!(store.stats().await.total_bytes, 24);
        assert!(a.path.exists() && b.path.exists() && c.path.exists());

        // Past the floor for a and b, not for c.
        let evicted = store.evict_at(t0 + ChronoDuration::seconds(11)).await;
        assert_eq!(evicted, 1);
        assert!(!b.path.exists());
        assert!(a.path.exists());
        assert!(c.path.exists());
        assert_eq!(store.stats().await.total_bytes, 16);
        assert!(store.get("b", ArtifactKind::Mesh).await.is_none());
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_regardless_of_budget() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, MB);
        let t0 = Utc::now() - ChronoDuration::hours(30);

        let old = store
            .materialize_at("old", ArtifactKind::Mesh, b"x", t0)
            .await
            .unwrap();
        let fresh = store
            .materialize("fresh", ArtifactKind::Mesh, b"y")
            .await
            .unwrap();

        let removed = store.sweep_expired().await.unwrap();
        assert_eq!(removed, 1);
        assert!(!old.path.exists());
        assert!(fresh.path.exists());
        assert_eq!(store.stats().await.entries, 1);
    }

    #[tokio::test]
    async fn test_traversing_task_ids_are_refused() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, MB);

        let err = store
            .materialize("../escaped", ArtifactKind::Mesh, b"glTF")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::UnsafeTaskId(id) if id == "../escaped"));
        assert!(!dir.path().join("escaped_output.glb").exists());
        assert!(!dir.path().join("downloads").exists());

        let staged = dir.path().join("staged.bin");
        std::fs::write(&staged, b"mesh").unwrap();
        let err = store
            .adopt("nested/id", ArtifactKind::Video, &staged)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::UnsafeTaskId(_)));
        assert!(staged.exists());
        assert_eq!(store.stats().await.entries, 0);
    }

    #[tokio::test]
    async fn test_adopt_moves_staged_file() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, MB);
        let staged = dir.path().join("staged.bin");
        std::fs::write(&staged, b"mesh from rest").unwrap();

        let artifact = store
            .adopt("task-9", ArtifactKind::Mesh, &staged)
            .await
            .unwrap();

        assert!(!staged.exists());
        assert_eq!(artifact.size, 14);
        assert_eq!(std::fs::read(&artifact.path).unwrap(), b"mesh from rest");
    }

    #[tokio::test]
    async fn test_load_existing_indexes_artifacts_only() {
        let dir = TempDir::new().unwrap();
        let downloads = dir.path().join("downloads");
        std::fs::create_dir_all(&downloads).unwrap();
        std::fs::write(downloads.join("t1_output.glb"), b"1234").unwrap();
        std::fs::write(downloads.join("t1_output.mp4"), b"56").unwrap();
        std::fs::write(downloads.join("readme.txt"), b"ignored").unwrap();

        let store = store(&dir, MB);
        assert_eq!(store.load_existing().await.unwrap(), 2);
        let stats = store.stats().await;
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.total_bytes, 6);
        let video = store.get("t1", ArtifactKind::Video).await.unwrap();
        assert_eq!(video.size, 2);
    }

    #[tokio::test]
    async fn test_load_existing_missing_dir() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, MB);
        assert_eq!(store.load_existing().await.unwrap(), 0);
    }
}
