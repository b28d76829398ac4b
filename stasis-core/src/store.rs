// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Backing store for jobs, checkpoints, hosts and GPU controllers.
//!
//! Read-your-writes per key, no cross-key transactions. [`MemoryStore`]
//! keeps records in process; [`LocalStore`] keeps one JSON file per record.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::api::{Checkpoint, ControllerRecord, Host, JobRecord};
use crate::error::StoreError;
use crate::types::{ControllerId, JobId};

#[async_trait]
pub trait Store: Send + Sync {
    async fn put_job(&self, job: &JobRecord) -> Result<(), StoreError>;
    /// All jobs when `ids` is empty.
    async fn list_jobs(&self, ids: &[JobId]) -> Result<Vec<JobRecord>, StoreError>;
    async fn delete_job(&self, id: &JobId) -> Result<(), StoreError>;

    async fn put_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError>;
    /// Checkpoints owned by any of `jids`; all when empty.
    async fn list_checkpoints(&self, jids: &[JobId]) -> Result<Vec<Checkpoint>, StoreError>;
    async fn delete_checkpoint(&self, id: &str) -> Result<(), StoreError>;

    async fn put_host(&self, host: &Host) -> Result<(), StoreError>;
    async fn list_hosts(&self) -> Result<Vec<Host>, StoreError>;

    async fn put_controller(&self, controller: &ControllerRecord) -> Result<(), StoreError>;
    async fn list_controllers(&self) -> Result<Vec<ControllerRecord>, StoreError>;
    async fn delete_controller(&self, id: &ControllerId) -> Result<(), StoreError>;
}

/// In-process store.
#[derive(Default)]
pub struct MemoryStore {
    jobs: DashMap<JobId, JobRecord>,
    checkpoints: DashMap<String, Checkpoint>,
    hosts: DashMap<String, Host>,
    controllers: DashMap<ControllerId, ControllerRecord>,
}

impl MemoryStore {
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        self.jobs.insert(job.jid.clone(), job.clone());
        Ok(())
    }

    async fn list_jobs(&self, ids: &[JobId]) -> Result<Vec<JobRecord>, StoreError> {
        Ok(self
            .jobs
            .iter()
            .filter(|e| ids.is_empty() || ids.contains(e.key()))
            .map(|e| e.value().clone())
            .collect())
    }

    async fn delete_job(&self, id: &JobId) -> Result<(), StoreError> {
        self.jobs.remove(id);
        Ok(())
    }

    async fn put_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        self.checkpoints
            .insert(checkpoint.id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn list_checkpoints(&self, jids: &[JobId]) -> Result<Vec<Checkpoint>, StoreError> {
        Ok(self
            .checkpoints
            .iter()
            .filter(|e| jids.is_empty() || jids.contains(&e.value().jid))
            .map(|e| e.value().clone())
            .collect())
    }

    async fn delete_checkpoint(&self, id: &str) -> Result<(), StoreError> {
        self.checkpoints.remove(id);
        Ok(())
    }

    async fn put_host(&self, host: &Host) -> Result<(), StoreError> {
        self.hosts.insert(host.id.clone(), host.clone());
        Ok(())
    }

    async fn list_hosts(&self) -> Result<Vec<Host>, StoreError> {
        Ok(self.hosts.iter().map(|e| e.value().clone()).collect())
    }

    async fn put_controller(&self, controller: &ControllerRecord) -> Result<(), StoreError> {
        self.controllers
            .insert(controller.id.clone(), controller.clone());
        Ok(())
    }

    async fn list_controllers(&self) -> Result<Vec<ControllerRecord>, StoreError> {
        Ok(self.controllers.iter().map(|e| e.value().clone()).collect())
    }

    async fn delete_controller(&self, id: &ControllerId) -> Result<(), StoreError> {
        self.controllers.remove(id);
        Ok(())
    }
}

/// One JSON file per record under `<root>/<kind>/<id>.json`.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for kind in ["jobs", "checkpoints", "hosts", "gpu_controllers"] {
            let dir = root.join(kind);
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|source| StoreError::Io { path: dir, source })?;
        }
        tracing::debug!(root = %root.display(), "Local store opened");
        Ok(Self { root })
    }

    fn path(&self, kind: &str, id: &str) -> PathBuf {
        self.root.join(kind).join(format!("{}.json", id))
    }

    async fn put<T: Serialize + Sync>(&self, kind: &str, id: &str, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(value).map_err(|e| StoreError::Encoding {
            key: format!("{}/{}", kind, id),
            reason: e.to_string(),
        })?;
        let path = self.path(kind, id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|source| StoreError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| StoreError::Io { path, source })
    }

    async fn list<T: DeserializeOwned>(&self, kind: &str) -> Result<Vec<T>, StoreError> {
        let dir = self.root.join(kind);
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?;

        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_record(&path).await {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable record"),
            }
        }
        Ok(records)
    }

    async fn delete(&self, kind: &str, id: &str) -> Result<(), StoreError> {
        let path = self.path(kind, id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }
}

async fn read_record<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    serde_json::from_slice(&bytes).map_err(|e| StoreError::Encoding {
        key: path.display().to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl Store for LocalStore {
    async fn put_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        self.put("jobs", job.jid.as_str(), job).await
    }

    async fn list_jobs(&self, ids: &[JobId]) -> Result<Vec<JobRecord>, StoreError> {
        let jobs: Vec<JobRecord> = self.list("jobs").await?;
        Ok(jobs
            .into_iter()
            .filter(|j| ids.is_empty() || ids.contains(&j.jid))
            .collect())
    }

    async fn delete_job(&self, id: &JobId) -> Result<(), StoreError> {
        self.delete("jobs", id.as_str()).await
    }

    async fn put_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        self.put("checkpoints", &checkpoint.id, checkpoint).await
    }

    async fn list_checkpoints(&self, jids: &[JobId]) -> Result<Vec<Checkpoint>, StoreError> {
        let checkpoints: Vec<Checkpoint> = self.list("checkpoints").await?;
        Ok(checkpoints
            .into_iter()
            .filter(|c| jids.is_empty() || jids.contains(&c.jid))
            .collect())
    }

    async fn delete_checkpoint(&self, id: &str) -> Result<(), StoreError> {
        self.delete("checkpoints", id).await
    }

    async fn put_host(&self, host: &Host) -> Result<(), StoreError> {
        self.put("hosts", &host.id, host).await
    }

    async fn list_hosts(&self) -> Result<Vec<Host>, StoreError> {
        self.list("hosts").await
    }

    async fn put_controller(&self, controller: &ControllerRecord) -> Result<(), StoreError> {
        self.put("gpu_controllers", controller.id.as_str(), controller)
            .await
    }

    async fn list_controllers(&self) -> Result<Vec<ControllerRecord>, StoreError> {
        self.list("gpu_controllers").await
    }

    async fn delete_controller(&self, id: &ControllerId) -> Result<(), StoreError> {
        self.delete("gpu_controllers", id.as_str()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ProcessState;
    use tempfile::TempDir;

    fn job(id: &str) -> JobRecord {
        JobRecord {
            jid: JobId::new(id).unwrap(),
            type_tag: "process".to_string(),
            state: ProcessState::default(),
            details: Default::default(),
            log: None,
        }
    }

    fn checkpoint(id: &str, jid: &str) -> Checkpoint {
        Checkpoint {
            id: id.to_string(),
            jid: JobId::new(jid).unwrap(),
            path: PathBuf::from("/tmp/img"),
            time_ms: 1,
            size: 0,
        }
    }

    async fn exercise(store: &dyn Store) {
        store.put_job(&job("j1")).await.unwrap();
        store.put_job(&job("j2")).await.unwrap();
        assert_eq!(store.list_jobs(&[]).await.unwrap().len(), 2);
        assert_eq!(
            store
                .list_jobs(&[JobId::new("j2").unwrap()])
                .await
                .unwrap()
                .len(),
            1
        );

        store.put_checkpoint(&checkpoint("c1", "j1")).await.unwrap();
        store.put_checkpoint(&checkpoint("c2", "j2")).await.unwrap();
        let owned = store
            .list_checkpoints(&[JobId::new("j1").unwrap()])
            .await
            .unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].id, "c1");

        store.delete_job(&JobId::new("j1").unwrap()).await.unwrap();
        store.delete_job(&JobId::new("j1").unwrap()).await.unwrap();
        assert_eq!(store.list_jobs(&[]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise(&MemoryStore::default()).await;
    }

    #[tokio::test]
    async fn test_local_store() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::open(tmp.path()).await.unwrap();
        exercise(&store).await;

        // Survives reopening.
        let reopened = LocalStore::open(tmp.path()).await.unwrap();
        assert_eq!(reopened.list_jobs(&[]).await.unwrap().len(), 1);
    }
}
