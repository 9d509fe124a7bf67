//! Wire-facing and persisted data types shared across the gateway and the
//! remote agent.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A resumable remote session descriptor, persisted into `HostConfig` so a
/// later `connect` can rebind without redeploying.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActiveSession {
    pub session_id: String,
    pub remote_dir: String,
    pub remote_port: u16,
    pub local_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

/// Persisted configuration for one registered host. Immutable after
/// registration except for the `active_session` fields, which `RemoteHost`
/// updates across setup/teardown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub name: String,
    pub ssh_target: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_key_path: Option<PathBuf>,
    #[serde(default = "default_remote_port")]
    pub remote_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_session: Option<ActiveSession>,
}

pub fn default_ssh_port() -> u16 {
    22
}

pub fn default_remote_port() -> u16 {
    8765
}

impl HostConfig {
    pub fn new(name: impl Into<String>, ssh_target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ssh_target: ssh_target.into(),
            ssh_port: default_ssh_port(),
            ssh_key_path: None,
            remote_port: default_remote_port(),
            local_port: None,
            auth_token: None,
            workspace: None,
            active_session: None,
        }
    }
}

/// In-memory connection state of a `RemoteHost`, surfaced by `HostManager::list`
/// for diagnostics only; it is not part of the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Recovering,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Recovering => write!(f, "recovering"),
            ConnectionState::Failed => write!(f, "failed"),
        }
    }
}

/// A directory entry returned by `list_dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    pub size: u64,
    pub mtime: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    File,
    Dir,
    Symlink,
    Other,
}

/// Client→server RPC frames, tagged on `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum RpcRequest {
    Exec {
        #[serde(rename = "requestId")]
        request_id: String,
        command: String,
        #[serde(rename = "workingDir", skip_serializing_if = "Option::is_none")]
        working_dir: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout: Option<u64>,
    },
    ReadFile {
        #[serde(rename = "requestId")]
        request_id: String,
        path: String,
    },
    WriteFile {
        #[serde(rename = "requestId")]
        request_id: String,
        path: String,
        content: String,
    },
    EditFile {
        #[serde(rename = "requestId")]
        request_id: String,
        path: String,
        #[serde(rename = "oldText")]
        old_text: String,
        #[serde(rename = "newText")]
        new_text: String,
    },
    ListDir {
        #[serde(rename = "requestId")]
        request_id: String,
        path: String,
    },
    /// Compares a file's on-host content against `content` without
    /// transferring the full file back when it already matches.
    CompareFile {
        #[serde(rename = "requestId")]
        request_id: String,
        path: String,
        content: String,
    },
    Ping,
    Close,
    Shutdown,
}

impl RpcRequest {
    /// The `requestId` carried by this frame, if it has one. `ping`/`close`/
    /// `shutdown` are untyped and never go through the idempotency layer.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            RpcRequest::Exec { request_id, .. }
            | RpcRequest::ReadFile { request_id, .. }
            | RpcRequest::WriteFile { request_id, .. }
            | RpcRequest::EditFile { request_id, .. }
            | RpcRequest::ListDir { request_id, .. }
            | RpcRequest::CompareFile { request_id, .. } => Some(request_id),
            RpcRequest::Ping | RpcRequest::Close | RpcRequest::Shutdown => None,
        }
    }
}

/// The first frame on every connection: `{"token": "..."}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthFrame {
    pub token: Option<String>,
}

/// Server→client RPC frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum RpcResponse {
    Authenticated,
    Result {
        #[serde(rename = "requestId")]
        request_id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        entries: Option<Vec<DirEntry>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        bytes: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        identical: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        diff: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(rename = "exitCode", skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    Pong,
    ShutdownAck,
    Error {
        #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        code: String,
        message: String,
    },
}

impl RpcResponse {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            RpcResponse::Result { request_id, .. } => Some(request_id),
            RpcResponse::Error { request_id, .. } => request_id.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_config_defaults() {
        let cfg = HostConfig::new("web1", "deploy@example.com");
        assert_eq!(cfg.ssh_port, 22);
        assert_eq!(cfg.remote_port, 8765);
        assert!(cfg.active_session.is_none());
    }

    #[test]
    fn rpc_request_round_trips_through_json() {
        let req = RpcRequest::Exec {
            request_id: "abc".into(),
            command: "printf hello".into(),
            working_dir: None,
            timeout: Some(30),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"type\":\"exec\""));
        let back: RpcRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.request_id(), Some("abc"));
    }

    #[test]
    fn rpc_response_error_request_id_is_optional() {
        let resp = RpcResponse::Error {
            request_id: None,
            code: "Unauthorized".into(),
            message: "bad token".into(),
        };
        assert_eq!(resp.request_id(), None);
    }
}
