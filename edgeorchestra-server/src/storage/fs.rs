//! A filesystem-backed [`ModelStorage`].
//!
//! Blobs live at `<root>/<sha256[0..2]>/<sha256>`, written to a temporary
//! sibling first and renamed into place so readers never observe a partial
//! artifact. Pin references are kept in memory; blob history is protected by
//! the retention horizon, not by pins.

use std::{
    collections::{BTreeSet, HashMap},
    path::PathBuf,
    str::FromStr,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;

use edgeorchestra_core::ModelId;

use crate::storage::{ModelStat, ModelStorage, StorageResult};

#[derive(Clone)]
pub struct FsModelStore {
    root: PathBuf,
    pins: Arc<Mutex<HashMap<ModelId, BTreeSet<String>>>>,
}

impl FsModelStore {
    /// Opens a store rooted at `root`, creating the directory if needed.
    pub async fn new(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            pins: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn blob_path(&self, id: &ModelId) -> PathBuf {
        self.root.join(&id.as_str()[..2]).join(id.as_str())
    }

    fn is_pinned(&self, id: &ModelId) -> bool {
        self.pins
            .lock()
            .unwrap()
            .get(id)
            .map_or(false, |refs| !refs.is_empty())
    }
}

#[async_trait]
impl ModelStorage for FsModelStore {
    /// See [`ModelStorage::put_model`].
    async fn put_model(&mut self, bytes: &[u8]) -> StorageResult<ModelId> {
        let id = ModelId::digest(bytes);
        let path = self.blob_path(&id);
        if fs::metadata(&path).await.is_ok() {
            // Content addressing makes duplicate puts a no-op.
            return Ok(id);
        }
        let dir = path.parent().expect("blob path always has a shard parent");
        fs::create_dir_all(dir).await?;
        let tmp = dir.join(format!("{}.tmp-{}", id.as_str(), std::process::id()));
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &path).await?;
        Ok(id)
    }

    /// See [`ModelStorage::model`].
    async fn model(&mut self, id: &ModelId) -> StorageResult<Option<Vec<u8>>> {
        match fs::read(self.blob_path(id)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// See [`ModelStorage::model_stat`].
    async fn model_stat(&mut self, id: &ModelId) -> StorageResult<Option<ModelStat>> {
        match fs::metadata(self.blob_path(id)).await {
            Ok(meta) => {
                let created = meta
                    .modified()
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                Ok(Some(ModelStat {
                    size: meta.len(),
                    created_at: DateTime::<Utc>::from(created),
                }))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// See [`ModelStorage::pin_model`].
    async fn pin_model(&mut self, id: &ModelId, reference: &str) -> StorageResult<()> {
        self.pins
            .lock()
            .unwrap()
            .entry(id.clone())
            .or_default()
            .insert(reference.to_string());
        Ok(())
    }

    /// See [`ModelStorage::unpin_model`].
    async fn unpin_model(&mut self, id: &ModelId, reference: &str) -> StorageResult<()> {
        let mut pins = self.pins.lock().unwrap();
        if let Some(refs) = pins.get_mut(id) {
            refs.remove(reference);
            if refs.is_empty() {
                pins.remove(id);
            }
        }
        Ok(())
    }

    /// See [`ModelStorage::collect_garbage`].
    async fn collect_garbage(&mut self, retention: Duration) -> StorageResult<Vec<ModelId>> {
        let cutoff = SystemTime::now() - retention;
        let mut collected = Vec::new();

        let mut shards = fs::read_dir(&self.root).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut blobs = fs::read_dir(shard.path()).await?;
            while let Some(blob) = blobs.next_entry().await? {
                let id = match blob
                    .file_name()
                    .to_str()
                    .and_then(|name| ModelId::from_str(name).ok())
                {
                    Some(id) => id,
                    // Temp files and strays are not ours to collect.
                    None => continue,
                };
                if self.is_pinned(&id) {
                    continue;
                }
                let meta = blob.metadata().await?;
                let age_exceeded = meta
                    .modified()
                    .map(|modified| modified < cutoff)
                    .unwrap_or(false);
                if age_exceeded {
                    fs::remove_file(blob.path()).await?;
                    collected.push(id);
                }
            }
        }
        Ok(collected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_shards_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FsModelStore::new(dir.path()).await.unwrap();

        let id = store.put_model(b"artifact").await.unwrap();
        let expected = dir.path().join(&id.as_str()[..2]).join(id.as_str());
        assert!(expected.exists());
        assert_eq!(store.model(&id).await.unwrap().unwrap(), b"artifact");
    }

    #[tokio::test]
    async fn test_duplicate_put_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FsModelStore::new(dir.path()).await.unwrap();
        let first = store.put_model(b"same").await.unwrap();
        let second = store.put_model(b"same").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_stat_reports_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FsModelStore::new(dir.path()).await.unwrap();
        let id = store.put_model(b"12345").await.unwrap();
        let stat = store.model_stat(&id).await.unwrap().unwrap();
        assert_eq!(stat.size, 5);
        assert!(store
            .model_stat(&ModelId::digest(b"missing"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_gc_removes_only_unpinned_expired() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FsModelStore::new(dir.path()).await.unwrap();
        let pinned = store.put_model(b"pinned").await.unwrap();
        let loose = store.put_model(b"loose").await.unwrap();
        store.pin_model(&pinned, "job:a").await.unwrap();

        let collected = store.collect_garbage(Duration::from_secs(0)).await.unwrap();
        assert_eq!(collected, vec![loose.clone()]);
        assert!(store.model(&loose).await.unwrap().is_none());
        assert!(store.model(&pinned).await.unwrap().is_some());

        // A generous retention keeps even unpinned blobs.
        store.unpin_model(&pinned, "job:a").await.unwrap();
        assert!(store
            .collect_garbage(Duration::from_secs(3600))
            .await
            .unwrap()
            .is_empty());
    }
}
