// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Newtype wrappers for validated inputs.
//!
//! All types validate their invariants at creation time.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::HardValidationError;

/// Minimum GPU shared memory size: 1 MiB
const MIN_SHM_SIZE: u64 = 1024 * 1024;
/// Maximum GPU shared memory size: 256 GiB
const MAX_SHM_SIZE: u64 = 256 * 1024 * 1024 * 1024;

/// Validated job identifier.
/// Must be non-empty, alphanumeric with hyphens/underscores, max 64 chars.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    /// Create a new JobId with validation.
    pub fn new(id: impl Into<String>) -> Result<Self, HardValidationError> {
        let id = id.into();

        if id.is_empty() {
            return Err(HardValidationError::InvalidFieldValue {
                field: "jid",
                value: id,
                reason: "Job ID cannot be empty".to_string(),
            });
        }

        if id.len() > 64 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "jid",
                value: id.clone(),
                reason: format!("Job ID too long: {} chars (max 64)", id.len()),
            });
        }

        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(HardValidationError::InvalidFieldValue {
                field: "jid",
                value: id,
                reason:
                    "Job ID must contain only alphanumeric characters, hyphens, and underscores"
                        .to_string(),
            });
        }

        Ok(Self(id))
    }

    /// Generate a fresh identifier for jobs started without one.
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("job-{}", &uuid[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for JobId {
    type Error = HardValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.0
    }
}

/// GPU controller identifier, also embedded in the controller's address,
/// shared memory and booking file names.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ControllerId(String);

impl ControllerId {
    pub fn new(id: impl Into<String>) -> Result<Self, HardValidationError> {
        let id = id.into();
        if id.is_empty()
            || !id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(HardValidationError::InvalidFieldValue {
                field: "controller_id",
                value: id,
                reason: "Controller ID must be a non-empty file-name safe token".to_string(),
            });
        }
        Ok(Self(id))
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ControllerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for ControllerId {
    type Error = HardValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ControllerId> for String {
    fn from(id: ControllerId) -> Self {
        id.0
    }
}

/// Validated GPU shared memory size in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct ShmSize(u64);

impl ShmSize {
    pub fn new(bytes: u64) -> Result<Self, HardValidationError> {
        if !(MIN_SHM_SIZE..=MAX_SHM_SIZE).contains(&bytes) {
            return Err(HardValidationError::ShmSizeOutOfBounds {
                size_bytes: bytes,
                min: MIN_SHM_SIZE,
                max: MAX_SHM_SIZE,
            });
        }
        Ok(Self(bytes))
    }

    pub fn from_mb(mb: u64) -> Result<Self, HardValidationError> {
        Self::new(mb.saturating_mul(1024 * 1024))
    }

    pub fn bytes(&self) -> u64 {
        self.0
    }

    pub fn mb(&self) -> u64 {
        self.0 / (1024 * 1024)
    }
}

impl fmt::Display for ShmSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}MiB", self.mb())
    }
}

impl TryFrom<u64> for ShmSize {
    type Error = HardValidationError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ShmSize> for u64 {
    fn from(size: ShmSize) -> Self {
        size.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_valid() {
        assert!(JobId::new("my-job").is_ok());
        assert!(JobId::new("job_123").is_ok());
    }

    #[test]
    fn test_job_id_invalid() {
        assert!(JobId::new("").is_err());
        assert!(JobId::new("a".repeat(65)).is_err());
        assert!(JobId::new("job with spaces").is_err());
        assert!(JobId::new("../escape").is_err());
    }

    #[test]
    fn test_generated_job_id_is_valid() {
        let id = JobId::generate();
        assert!(JobId::new(id.as_str()).is_ok());
        assert_ne!(id, JobId::generate());
    }

    #[test]
    fn test_controller_id() {
        let id = ControllerId::generate();
        assert!(ControllerId::new(id.to_string()).is_ok());
        assert!(ControllerId::new("a/b").is_err());
    }

    #[test]
    fn test_shm_size() {
        assert!(ShmSize::from_mb(0).is_err());
        let size = ShmSize::from_mb(100).unwrap();
        assert_eq!(size.bytes(), 100 * 1024 * 1024);
        assert_eq!(size.to_string(), "100MiB");
    }

    #[test]
    fn test_job_id_serde() {
        let id: JobId = serde_json::from_str("\"j1\"").unwrap();
        assert_eq!(id.as_str(), "j1");
        assert!(serde_json::from_str::<JobId>("\"\"").is_err());
    }
}
