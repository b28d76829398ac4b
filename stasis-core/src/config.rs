// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! YAML configuration parser with strict schema validation.
//!
//! Every section is optional and falls back to the defaults below. Any
//! invalid field results in a HardValidationError that prevents startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{HardValidationError, StasisError, StasisResult};
use crate::gpu::FreezeType;
use crate::types::ShmSize;

/// Raw daemon section as parsed from YAML (before validation).
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDaemonConfig {
    #[serde(default)]
    host_id: Option<String>,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    metrics_port: Option<u16>,
    #[serde(default = "default_state_dir")]
    state_dir: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_state_dir() -> String {
    "/var/lib/stasis".to_string()
}

impl Default for RawDaemonConfig {
    fn default() -> Self {
        Self {
            host_id: None,
            log_level: default_log_level(),
            metrics_port: None,
            state_dir: default_state_dir(),
        }
    }
}

/// Raw GPU section.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawGpuConfig {
    #[serde(default)]
    controller_binary: Option<String>,
    #[serde(default)]
    interception_library: Option<String>,
    #[serde(default = "default_sock_dir")]
    sock_dir: String,
    #[serde(default = "default_lock_dir")]
    lock_dir: String,
    #[serde(default = "default_log_dir")]
    log_dir: String,
    #[serde(default = "default_shm_size_mb")]
    shm_size_mb: u64,
    #[serde(default)]
    pool_size: usize,
    #[serde(default = "default_freeze_type")]
    freeze_type: String,
    #[serde(default = "default_true")]
    parallel_dump: bool,
    #[serde(default = "default_true")]
    parallel_restore: bool,
    #[serde(default)]
    ld_library_path: Option<String>,
}

fn default_sock_dir() -> String {
    "/run/stasis".to_string()
}

fn default_lock_dir() -> String {
    "/dev/shm".to_string()
}

fn default_log_dir() -> String {
    "/var/log/stasis".to_string()
}

fn default_shm_size_mb() -> u64 {
    8 * 1024 // 8 GiB
}

fn default_freeze_type() -> String {
    "ipc".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for RawGpuConfig {
    fn default() -> Self {
        Self {
            controller_binary: None,
            interception_library: None,
            sock_dir: default_sock_dir(),
            lock_dir: default_lock_dir(),
            log_dir: default_log_dir(),
            shm_size_mb: default_shm_size_mb(),
            pool_size: 0,
            freeze_type: default_freeze_type(),
            parallel_dump: true,
            parallel_restore: true,
            ld_library_path: None,
        }
    }
}

/// Raw job registry section.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawJobsConfig {
    #[serde(default = "default_log_dir")]
    log_dir: String,
    #[serde(default = "default_sync_interval_secs")]
    sync_interval_secs: u64,
    #[serde(default = "default_retry_interval_secs")]
    retry_interval_secs: u64,
}

fn default_sync_interval_secs() -> u64 {
    10
}

fn default_retry_interval_secs() -> u64 {
    1
}

impl Default for RawJobsConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            sync_interval_secs: default_sync_interval_secs(),
            retry_interval_secs: default_retry_interval_secs(),
        }
    }
}

/// Raw checkpoint section.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCheckpointConfig {
    #[serde(default = "default_checkpoint_dir")]
    dir: String,
}

fn default_checkpoint_dir() -> String {
    "/tmp".to_string()
}

impl Default for RawCheckpointConfig {
    fn default() -> Self {
        Self {
            dir: default_checkpoint_dir(),
        }
    }
}

/// Raw CRIU section.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCriuConfig {
    #[serde(default)]
    binary: Option<String>,
    #[serde(default)]
    leave_running: bool,
}

/// Raw root configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    daemon: RawDaemonConfig,
    #[serde(default)]
    gpu: RawGpuConfig,
    #[serde(default)]
    jobs: RawJobsConfig,
    #[serde(default)]
    checkpoint: RawCheckpointConfig,
    #[serde(default)]
    criu: RawCriuConfig,
}

/// Validated daemon settings.
#[derive(Debug, Clone)]
pub struct DaemonSettings {
    /// Overrides the host identity read from the machine id.
    pub host_id: Option<String>,
    pub log_level: String,
    pub metrics_port: Option<u16>,
    /// Directory of the local JSON backing store.
    pub state_dir: PathBuf,
}

/// Validated GPU settings.
#[derive(Debug, Clone)]
pub struct GpuConfig {
    /// GPU support is disabled when no controller binary is configured.
    pub controller_binary: Option<PathBuf>,
    pub interception_library: Option<PathBuf>,
    pub sock_dir: PathBuf,
    pub lock_dir: PathBuf,
    pub log_dir: PathBuf,
    pub shm_size: ShmSize,
    /// Target number of FREE controllers; 0 spawns on demand.
    pub pool_size: usize,
    pub freeze_type: FreezeType,
    pub parallel_dump: bool,
    pub parallel_restore: bool,
    pub ld_library_path: Option<String>,
}

/// Validated job registry settings.
#[derive(Debug, Clone)]
pub struct JobsConfig {
    pub log_dir: PathBuf,
    pub sync_interval: Duration,
    pub retry_interval: Duration,
}

/// Validated checkpoint settings.
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    pub dir: PathBuf,
}

/// Validated CRIU settings.
#[derive(Debug, Clone)]
pub struct CriuConfig {
    pub binary: Option<PathBuf>,
    pub leave_running: bool,
}

/// Complete validated configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub daemon: DaemonSettings,
    pub gpu: GpuConfig,
    pub jobs: JobsConfig,
    pub checkpoint: CheckpointConfig,
    pub criu: CriuConfig,
}

/// Configuration loader with strict validation.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a YAML file.
    pub fn load_file(path: impl AsRef<Path>) -> StasisResult<DaemonConfig> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(StasisError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| StasisError::Io {
            context: "reading config file",
            source: e,
        })?;

        Self::load_string(&content)
    }

    /// Load and validate configuration from a YAML string.
    /// An empty document yields the defaults.
    pub fn load_string(content: &str) -> StasisResult<DaemonConfig> {
        let raw: RawConfig = if content.trim().is_empty() {
            RawConfig::default()
        } else {
            serde_yaml::from_str(content).map_err(|e| StasisError::ConfigParse {
                message: format!("YAML parse error: {}", e),
            })?
        };

        Self::validate(raw)
    }

    /// Built-in defaults, as if an empty file had been loaded.
    pub fn defaults() -> StasisResult<DaemonConfig> {
        Self::validate(RawConfig::default())
    }

    fn validate(raw: RawConfig) -> StasisResult<DaemonConfig> {
        Ok(DaemonConfig {
            daemon: Self::validate_daemon(raw.daemon)?,
            gpu: Self::validate_gpu(raw.gpu)?,
            jobs: Self::validate_jobs(raw.jobs)?,
            checkpoint: CheckpointConfig {
                dir: non_empty_path("checkpoint.dir", raw.checkpoint.dir)?,
            },
            criu: CriuConfig {
                binary: raw.criu.binary.map(PathBuf::from),
                leave_running: raw.criu.leave_running,
            },
        })
    }

    fn validate_daemon(raw: RawDaemonConfig) -> StasisResult<DaemonSettings> {
        if let Some(host_id) = &raw.host_id {
            if host_id.trim().is_empty() {
                return Err(HardValidationError::InvalidFieldValue {
                    field: "daemon.host_id",
                    value: host_id.clone(),
                    reason: "Host ID cannot be blank".to_string(),
                }
                .into());
            }
        }

        if raw.metrics_port == Some(0) {
            return Err(HardValidationError::InvalidFieldValue {
                field: "daemon.metrics_port",
                value: "0".to_string(),
                reason: "Port 0 is reserved and cannot be used".to_string(),
            }
            .into());
        }

        Ok(DaemonSettings {
            host_id: raw.host_id,
            log_level: raw.log_level,
            metrics_port: raw.metrics_port,
            state_dir: non_empty_path("daemon.state_dir", raw.state_dir)?,
        })
    }

    fn validate_gpu(raw: RawGpuConfig) -> StasisResult<GpuConfig> {
        let shm_size = ShmSize::from_mb(raw.shm_size_mb).map_err(|e| {
            HardValidationError::InvalidFieldValue {
                field: "gpu.shm_size_mb",
                value: raw.shm_size_mb.to_string(),
                reason: e.to_string(),
            }
        })?;

        if raw.pool_size > 64 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "gpu.pool_size",
                value: raw.pool_size.to_string(),
                reason: "Must be between 0 and 64".to_string(),
            }
            .into());
        }

        let freeze_type = raw.freeze_type.parse::<FreezeType>().map_err(|reason| {
            HardValidationError::InvalidFieldValue {
                field: "gpu.freeze_type",
                value: raw.freeze_type.clone(),
                reason,
            }
        })?;

        Ok(GpuConfig {
            controller_binary: raw.controller_binary.map(PathBuf::from),
            interception_library: raw.interception_library.map(PathBuf::from),
            sock_dir: non_empty_path("gpu.sock_dir", raw.sock_dir)?,
            lock_dir: non_empty_path("gpu.lock_dir", raw.lock_dir)?,
            log_dir: non_empty_path("gpu.log_dir", raw.log_dir)?,
            shm_size,
            pool_size: raw.pool_size,
            freeze_type,
            parallel_dump: raw.parallel_dump,
            parallel_restore: raw.parallel_restore,
            ld_library_path: raw.ld_library_path,
        })
    }

    fn validate_jobs(raw: RawJobsConfig) -> StasisResult<JobsConfig> {
        if raw.sync_interval_secs == 0 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "jobs.sync_interval_secs",
                value: "0".to_string(),
                reason: "Sync interval must be greater than 0".to_string(),
            }
            .into());
        }

        if raw.retry_interval_secs == 0 || raw.retry_interval_secs > raw.sync_interval_secs {
            return Err(HardValidationError::InvalidFieldValue {
                field: "jobs.retry_interval_secs",
                value: raw.retry_interval_secs.to_string(),
                reason: "Retry interval must be between 1 and the sync interval".to_string(),
            }
            .into());
        }

        Ok(JobsConfig {
            log_dir: non_empty_path("jobs.log_dir", raw.log_dir)?,
            sync_interval: Duration::from_secs(raw.sync_interval_secs),
            retry_interval: Duration::from_secs(raw.retry_interval_secs),
        })
    }
}

fn non_empty_path(field: &'static str, value: String) -> Result<PathBuf, HardValidationError> {
    if value.trim().is_empty() {
        return Err(HardValidationError::MissingRequiredField {
            field,
            context: "configuration".to_string(),
        });
    }
    Ok(PathBuf::from(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_CONFIG: &str = r#"
daemon:
  host_id: node-a
  log_level: debug
  metrics_port: 9464
  state_dir: /var/lib/stasis

gpu:
  controller_binary: /usr/local/lib/stasis/gpu-controller
  shm_size_mb: 100
  pool_size: 2
  freeze_type: nccl
  parallel_dump: false

jobs:
  sync_interval_secs: 5

checkpoint:
  dir: /var/lib/stasis/checkpoints
"#;

    #[test]
    fn test_valid_config() {
        let config = ConfigLoader::load_string(VALID_CONFIG).unwrap();
        assert_eq!(config.daemon.host_id.as_deref(), Some("node-a"));
        assert_eq!(config.daemon.metrics_port, Some(9464));
        assert_eq!(config.gpu.shm_size.mb(), 100);
        assert_eq!(config.gpu.pool_size, 2);
        assert_eq!(config.gpu.freeze_type, FreezeType::Nccl);
        assert!(!config.gpu.parallel_dump);
        assert!(config.gpu.parallel_restore);
        assert_eq!(config.jobs.sync_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_defaults_applied() {
        let config = ConfigLoader::load_string("").unwrap();
        assert!(config.gpu.controller_binary.is_none());
        assert_eq!(config.gpu.shm_size.mb(), 8192);
        assert_eq!(config.gpu.lock_dir, PathBuf::from("/dev/shm"));
        assert_eq!(config.jobs.retry_interval, Duration::from_secs(1));
        assert_eq!(config.checkpoint.dir, PathBuf::from("/tmp"));
        assert!(!config.criu.leave_running);
    }

    #[test]
    fn test_invalid_shm_size() {
        let yaml = "gpu:\n  shm_size_mb: 0\n";
        assert!(ConfigLoader::load_string(yaml).is_err());
    }

    #[test]
    fn test_invalid_freeze_type() {
        let yaml = "gpu:\n  freeze_type: magic\n";
        assert!(ConfigLoader::load_string(yaml).is_err());
    }

    #[test]
    fn test_retry_longer_than_sync() {
        let yaml = "jobs:\n  sync_interval_secs: 2\n  retry_interval_secs: 5\n";
        assert!(ConfigLoader::load_string(yaml).is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = "gpu:\n  shm_size: 100\n";
        assert!(ConfigLoader::load_string(yaml).is_err());
    }

    #[test]
    fn test_missing_file() {
        let result = ConfigLoader::load_file("/nonexistent/stasis.yaml");
        assert!(matches!(result, Err(StasisError::ConfigNotFound { .. })));
    }
}
