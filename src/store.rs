//! Durable blob storage for result snapshots and the shared heartbeat store.

use crate::liveness::NodeStatus;
use crate::WarcannonError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), WarcannonError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, WarcannonError>;
}

/// Upsert-by-instance heartbeat records plus a full scan.
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn put_status(&self, status: &NodeStatus) -> Result<(), WarcannonError>;

    async fn scan(&self) -> Result<Vec<NodeStatus>, WarcannonError>;
}

pub fn status_key(prefix: &str, instance_id: &str) -> String {
    format!("{}/{}.json", prefix.trim_end_matches('/'), instance_id)
}

#[derive(Default)]
struct MemoryStoreState {
    objects: BTreeMap<String, (Vec<u8>, String)>,
    statuses: BTreeMap<String, NodeStatus>,
    failing_puts: usize,
    put_calls: usize,
}

/// In-process store for tests and local runs.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryStoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryStoreState>, WarcannonError> {
        self.state
            .lock()
            .map_err(|_| WarcannonError::Storage("memory store lock poisoned".to_string()))
    }

    /// The next `count` blob puts fail.
    pub fn fail_next_puts(&self, count: usize) -> Result<(), WarcannonError> {
        self.lock()?.failing_puts = count;
        Ok(())
    }

    pub fn keys(&self) -> Result<Vec<String>, WarcannonError> {
        Ok(self.lock()?.objects.keys().cloned().collect())
    }

    pub fn object(&self, key: &str) -> Result<Option<Vec<u8>>, WarcannonError> {
        Ok(self.lock()?.objects.get(key).map(|(b, _)| b.clone()))
    }

    pub fn put_calls(&self) -> Result<usize, WarcannonError> {
        Ok(self.lock()?.put_calls)
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), WarcannonError> {
        let mut state = self.lock()?;
        state.put_calls += 1;
        if state.failing_puts > 0 {
            state.failing_puts -= 1;
            return Err(WarcannonError::Storage(format!("injected put failure for {}", key)));
        }
        state.objects.insert(key.to_string(), (bytes, content_type.to_string()));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, WarcannonError> {
        self.lock()?
            .objects
            .get(key)
            .map(|(b, _)| b.clone())
            .ok_or_else(|| WarcannonError::Storage(format!("no such key {}", key)))
    }
}

#[async_trait]
impl StatusStore for MemoryStore {
    async fn put_status(&self, status: &NodeStatus) -> Result<(), WarcannonError> {
        self.lock()?.statuses.insert(status.instance_id.clone(), status.clone());
        Ok(())
    }

    async fn scan(&self) -> Result<Vec<NodeStatus>, WarcannonError> {
        Ok(self.lock()?.statuses.values().cloned().collect())
    }
}

/// Directory-backed store. Keys map to relative paths under `root`.
pub struct LocalStore {
    root: PathBuf,
    status_prefix: String,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>, status_prefix: &str) -> Self {
        Self {
            root: root.into(),
            status_prefix: status_prefix.to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, WarcannonError> {
        let relative = Path::new(key);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(WarcannonError::Storage(format!("key escapes store root: {}", key)));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for LocalStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<(), WarcannonError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write then rename so readers never see a partial object.
        let tmp = path.with_extension("partial");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, WarcannonError> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| WarcannonError::Storage(format!("read {}: {}", path.display(), e)))
    }
}

#[async_trait]
impl StatusStore for LocalStore {
    async fn put_status(&self, status: &NodeStatus) -> Result<(), WarcannonError> {
        let bytes = serde_json::to_vec(status)?;
        self.put(&status_key(&self.status_prefix, &status.instance_id), bytes, "application/json")
            .await
    }

    async fn scan(&self) -> Result<Vec<NodeStatus>, WarcannonError> {
        let dir = self.root.join(&self.status_prefix);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut statuses = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<NodeStatus>(&bytes) {
                Ok(status) => statuses.push(status),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable status record"),
            }
        }
        statuses.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(statuses)
    }
}
