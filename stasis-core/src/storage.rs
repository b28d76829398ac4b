// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Checkpoint image storage selection.
//!
//! Local directories are handled here. Directories written as
//! `scheme://...` belong to a storage plugin registered under that scheme.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::api::{DumpRequest, DumpResponse, RestoreRequest, RestoreResponse};
use crate::error::{StasisError, StasisResult};
use crate::pipeline::{adapter, Adapter, Handler};
use crate::plugins::{Feature, PluginRegistry};

/// Where checkpoint images live.
pub trait Storage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create (or validate) an image directory for a new dump.
    fn prepare_dump(&self, dir: &str, name: &str) -> StasisResult<PathBuf>;

    /// Validate that an image directory exists for a restore.
    fn prepare_restore(&self, path: &Path) -> StasisResult<PathBuf>;

    /// Size in bytes of a stored checkpoint.
    fn size(&self, path: &Path) -> u64;
}

/// Storage plugins, keyed by URL scheme instead of workload type.
pub const STORAGE: Feature<Arc<dyn Storage>> = Feature::new("Storage");

/// Plain local filesystem.
#[derive(Debug, Default, Clone)]
pub struct LocalStorage;

impl Storage for LocalStorage {
    fn name(&self) -> &'static str {
        "local"
    }

    fn prepare_dump(&self, dir: &str, name: &str) -> StasisResult<PathBuf> {
        let path = Path::new(dir).join(name);
        if path.exists() {
            return Err(StasisError::invalid_argument(format!(
                "image directory already exists: {}",
                path.display()
            )));
        }
        std::fs::create_dir_all(&path).map_err(|e| StasisError::Io {
            context: "creating image directory",
            source: e,
        })?;
        Ok(path)
    }

    fn prepare_restore(&self, path: &Path) -> StasisResult<PathBuf> {
        if !path.is_dir() {
            return Err(StasisError::not_found(format!(
                "image directory not found: {}",
                path.display()
            )));
        }
        Ok(path.to_path_buf())
    }

    fn size(&self, path: &Path) -> u64 {
        dir_size(path)
    }
}

/// Total size of regular files below `path`.
pub fn dir_size(path: &Path) -> u64 {
    let Ok(metadata) = std::fs::symlink_metadata(path) else {
        return 0;
    };
    if metadata.is_file() {
        return metadata.len();
    }
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .map(|entry| dir_size(&entry.path()))
        .sum()
}

fn scheme(location: &str) -> Option<&str> {
    location.split_once("://").map(|(scheme, _)| scheme)
}

fn resolve(plugins: &PluginRegistry, location: &str) -> StasisResult<Arc<dyn Storage>> {
    match scheme(location) {
        None => Ok(Arc::new(LocalStorage)),
        Some(scheme) => plugins.lookup(&STORAGE, scheme).map_err(|e| {
            StasisError::unimplemented(format!("no storage for '{}://': {}", scheme, e))
        }),
    }
}

/// Picks the storage for the dump directory and creates the image directory.
pub fn select_dump_storage() -> Adapter<DumpRequest, DumpResponse> {
    adapter(|next: Handler<DumpRequest, DumpResponse>| {
        Handler::<DumpRequest, DumpResponse>::new(move |mut opts, req, resp| {
            let next = next.clone();
            Box::pin(async move {
                let storage = resolve(&opts.plugins, &req.dir)?;
                let path = storage.prepare_dump(&req.dir, &req.name)?;
                req.criu.images_dir = path.clone();
                resp.path = path.clone();
                opts.storage = Some(storage.clone());

                let result = next.call(opts, req, resp).await;
                if result.is_err() {
                    if let Err(e) = std::fs::remove_dir_all(&path) {
                        tracing::debug!(path = %path.display(), error = %e, "Failed to remove image directory");
                    }
                    return result;
                }

                resp.size = storage.size(&path);
                result
            })
        })
    })
}

/// Picks the storage for the restore path and checks it exists.
pub fn select_restore_storage() -> Adapter<RestoreRequest, RestoreResponse> {
    adapter(|next: Handler<RestoreRequest, RestoreResponse>| {
        Handler::<RestoreRequest, RestoreResponse>::new(move |mut opts, req, resp| {
            let next = next.clone();
            Box::pin(async move {
                let location = req.path.to_string_lossy().to_string();
                let storage = resolve(&opts.plugins, &location)?;
                let path = storage.prepare_restore(&req.path)?;
                req.criu.images_dir = path;
                opts.storage = Some(storage);
                next.call(opts, req, resp).await
            })
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_prepare_dump_creates_dir() {
        let tmp = TempDir::new().unwrap();
        let storage = LocalStorage;
        let dir = tmp.path().to_string_lossy().to_string();

        let path = storage.prepare_dump(&dir, "dump-process-1").unwrap();
        assert!(path.is_dir());
        assert!(storage.prepare_dump(&dir, "dump-process-1").is_err());
    }

    #[test]
    fn test_dir_size() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.img"), vec![0u8; 100]).unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("sub/b.img"), vec![0u8; 28]).unwrap();
        assert_eq!(dir_size(tmp.path()), 128);
    }

    #[test]
    fn test_restore_missing_dir() {
        let err = LocalStorage
            .prepare_restore(Path::new("/nonexistent/image"))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::StatusKind::NotFound);
    }

    #[test]
    fn test_scheme() {
        assert_eq!(scheme("s3://bucket/dir"), Some("s3"));
        assert_eq!(scheme("/var/lib/stasis"), None);
    }
}
