// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Controller wire protocol.
//!
//! One newline-terminated JSON request per connection, answered by one
//! newline-terminated JSON reply. The socket path is read from the
//! controller's address file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use super::FreezeType;
use crate::error::GpuError;
use crate::types::ControllerId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Request {
    Info,
    Attach { pid: u32 },
    Freeze { freeze_type: FreezeType },
    Unfreeze { freeze_type: FreezeType },
    Dump { dir: PathBuf },
    Restore { dir: PathBuf },
    HealthCheck,
}

impl Request {
    pub const fn op(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Attach { .. } => "attach",
            Self::Freeze { .. } => "freeze",
            Self::Unfreeze { .. } => "unfreeze",
            Self::Dump { .. } => "dump",
            Self::Restore { .. } => "restore",
            Self::HealthCheck => "health",
        }
    }
}

/// What a controller reports about itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerInfo {
    pub pid: u32,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub attached_pid: u32,
    pub shm_size: u64,
    #[serde(default)]
    pub shm_name: String,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    #[serde(default)]
    pub driver_version: String,
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(default)]
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    #[serde(default)]
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub info: Option<ControllerInfo>,
    #[serde(default)]
    pub health: Option<HealthReport>,
}

impl Reply {
    pub fn ok() -> Self {
        Self {
            ok: true,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// An open channel to one controller.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn call(&self, request: Request) -> std::io::Result<Reply>;
}

/// Opens connections; swapped for an in-process fake in tests.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        id: &ControllerId,
        address: &Path,
    ) -> Result<Arc<dyn Connection>, GpuError>;
}

#[derive(Debug, Default, Clone)]
pub struct UnixConnector;

#[async_trait]
impl Connector for UnixConnector {
    async fn connect(
        &self,
        id: &ControllerId,
        address: &Path,
    ) -> Result<Arc<dyn Connection>, GpuError> {
        // Probe once so an unreachable controller fails here, not mid-dump.
        UnixStream::connect(address)
            .await
            .map_err(|e| GpuError::Rpc {
                op: "connect",
                id: id.to_string(),
                message: format!("{}: {}", address.display(), e),
            })?;

        Ok(Arc::new(UnixConnection {
            socket: address.to_path_buf(),
        }))
    }
}

struct UnixConnection {
    socket: PathBuf,
}

#[async_trait]
impl Connection for UnixConnection {
    async fn call(&self, request: Request) -> std::io::Result<Reply> {
        let stream = UnixStream::connect(&self.socket).await?;
        let (read_half, mut write_half) = stream.into_split();

        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');
        write_half.write_all(&line).await?;
        write_half.flush().await?;

        let mut reader = BufReader::new(read_half);
        let mut response = String::new();
        if reader.read_line(&mut response).await? == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "controller closed the connection without replying",
            ));
        }

        Ok(serde_json::from_str(response.trim_end())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::net::UnixListener;

    #[test]
    fn test_request_encoding() {
        let json = serde_json::to_string(&Request::Freeze {
            freeze_type: FreezeType::Nccl,
        })
        .unwrap();
        assert_eq!(json, r#"{"method":"freeze","freeze_type":"nccl"}"#);

        let json = serde_json::to_string(&Request::Info).unwrap();
        assert_eq!(json, r#"{"method":"info"}"#);
    }

    #[tokio::test]
    async fn test_unix_round_trip() {
        let tmp = TempDir::new().unwrap();
        let socket = tmp.path().join("ctl.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        tokio::spawn(async move {
            // First accept is the connect probe.
            let _ = listener.accept().await.unwrap();
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut line = String::new();
            BufReader::new(read_half).read_line(&mut line).await.unwrap();
            let request: Request = serde_json::from_str(line.trim_end()).unwrap();
            assert_eq!(request, Request::HealthCheck);

            let mut reply = serde_json::to_vec(&Reply::failed("no devices")).unwrap();
            reply.push(b'\n');
            write_half.write_all(&reply).await.unwrap();
        });

        let id = ControllerId::generate();
        let connection = UnixConnector.connect(&id, &socket).await.unwrap();
        let reply = connection.call(Request::HealthCheck).await.unwrap();
        assert!(!reply.ok);
        assert_eq!(reply.error.as_deref(), Some("no devices"));
    }

    #[tokio::test]
    async fn test_connect_missing_socket() {
        let id = ControllerId::generate();
        let err = UnixConnector
            .connect(&id, Path::new("/nonexistent/ctl.sock"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, GpuError::Rpc { op: "connect", .. }));
    }
}
