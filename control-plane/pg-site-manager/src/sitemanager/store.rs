use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::types::SiteManagerStatus;
use crate::error::Result;

/// Durable home of a [`SiteManagerStatus`] record.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Returns the stored record, or the empty record if none was written yet.
    async fn load(&self) -> Result<SiteManagerStatus>;
    async fn save(&self, status: &SiteManagerStatus) -> Result<()>;
}

#[derive(Clone, Default)]
pub struct MemoryStatusStore {
    inner: Arc<RwLock<SiteManagerStatus>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(status: SiteManagerStatus) -> Self {
        Self {
            inner: Arc::new(RwLock::new(status)),
        }
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn load(&self) -> Result<SiteManagerStatus> {
        Ok(self.inner.read().await.clone())
    }

    async fn save(&self, status: &SiteManagerStatus) -> Result<()> {
        *self.inner.write().await = status.clone();
        Ok(())
    }
}

/// JSON file on local disk; backs the pre-configure record, which only has
/// to outlive a request, not the pod.
#[derive(Clone, Debug)]
pub struct FileStatusStore {
    path: PathBuf,
}

impl FileStatusStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl StatusStore for FileStatusStore {
    async fn load(&self) -> Result<SiteManagerStatus> {
        match tokio::fs::read(&self.path).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(SiteManagerStatus::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, status: &SiteManagerStatus) -> Result<()> {
        // Written beside the target and renamed over it, so readers never see
        // a partial record.
        let raw = serde_json::to_vec(status)?;
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sitemanager::types::{Mode, TransitionStatus};

    #[tokio::test]
    async fn file_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStatusStore::new(dir.path().join("status.json"));
        assert_eq!(store.load().await.unwrap(), SiteManagerStatus::default());
    }

    #[tokio::test]
    async fn file_store_persists_between_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let status = SiteManagerStatus::new(Mode::Standby, TransitionStatus::Done);
        FileStatusStore::new(&path).save(&status).await.unwrap();

        let reopened = FileStatusStore::new(&path);
        assert_eq!(reopened.load().await.unwrap(), status);
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"status\":\"done\""));
    }

    #[tokio::test]
    async fn file_store_replaces_record_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let store = FileStatusStore::new(&path);
        let first = SiteManagerStatus::new(Mode::Active, TransitionStatus::Done);
        store.save(&first).await.unwrap();
        assert!(!store.temp_path().exists());

        // A write interrupted before the rename leaves the old record readable.
        std::fs::write(store.temp_path(), b"{\"mode\":\"stan").unwrap();
        assert_eq!(store.load().await.unwrap(), first);

        let second = SiteManagerStatus::new(Mode::Standby, TransitionStatus::Running);
        store.save(&second).await.unwrap();
        assert_eq!(store.load().await.unwrap(), second);
        assert!(!store.temp_path().exists());
    }

    #[tokio::test]
    async fn file_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        std::fs::write(&path, b"not json").unwrap();
        assert!(FileStatusStore::new(&path).load().await.is_err());
    }

    #[tokio::test]
    async fn memory_store_round_trips() {
        let store = MemoryStatusStore::new();
        let status = SiteManagerStatus::new(Mode::Active, TransitionStatus::Failed);
        store.save(&status).await.unwrap();
        assert_eq!(store.load().await.unwrap(), status);
    }
}
