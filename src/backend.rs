//! `ExecutionBackendRouter`: the single place a caller decides local vs.
//! remote execution. Individual tools receive an `ExecutionBackend` and never
//! branch on `host` themselves.
//!
//! `ExecutionBackend` is an enum over two variants, each wrapping a concrete
//! backend type with one match arm per method, rather than a trait object.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{GatewayError, GatewayResult};
use crate::host_manager::HostManager;
use crate::model::{DirEntry, RpcRequest, RpcResponse};
use crate::remote_host::RemoteHost;

/// Common result shape for `exec`, shared by both backends.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct WriteOutput {
    pub success: bool,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct CompareOutput {
    pub identical: bool,
    pub diff: Option<String>,
}

/// `resolve(host?) -> ExecutionBackend`. The only place a caller decides
/// local vs. remote; individual tools just hold the resolved backend.
pub struct ExecutionBackendRouter {
    host_manager: Arc<HostManager>,
}

impl ExecutionBackendRouter {
    pub fn new(host_manager: Arc<HostManager>) -> Self {
        Self { host_manager }
    }

    pub async fn resolve(&self, host: Option<&str>) -> GatewayResult<ExecutionBackend> {
        match host {
            None => Ok(ExecutionBackend::Local(LocalBackend::new())),
            Some(h) if h.is_empty() => Ok(ExecutionBackend::Local(LocalBackend::new())),
            Some(h) => {
                let remote_host = self
                    .host_manager
                    .get_or_connect(h)
                    .await
                    .map_err(|e| GatewayError::HostNotFound(format!("{}: {}", h, e)))?;
                Ok(ExecutionBackend::Remote(RemoteBackend::new(remote_host)))
            }
        }
    }
}

/// Façade in front of `LocalBackend`/`RemoteBackend` - the only type callers
/// hold after resolving a backend.
pub enum ExecutionBackend {
    Local(LocalBackend),
    Remote(RemoteBackend),
}

impl ExecutionBackend {
    pub async fn exec(&self, command: &str, working_dir: Option<&str>, timeout: Option<Duration>) -> GatewayResult<ExecOutput> {
        match self {
            ExecutionBackend::Local(b) => b.exec(command, working_dir, timeout).await,
            ExecutionBackend::Remote(b) => b.exec(command, working_dir, timeout).await,
        }
    }

    pub async fn read_file(&self, path: &str) -> GatewayResult<String> {
        match self {
            ExecutionBackend::Local(b) => b.read_file(path).await,
            ExecutionBackend::Remote(b) => b.read_file(path).await,
        }
    }

    pub async fn write_file(&self, path: &str, content: &str) -> GatewayResult<WriteOutput> {
        match self {
            ExecutionBackend::Local(b) => b.write_file(path, content).await,
            ExecutionBackend::Remote(b) => b.write_file(path, content).await,
        }
    }

    pub async fn edit_file(&self, path: &str, old_text: &str, new_text: &str) -> GatewayResult<()> {
        match self {
            ExecutionBackend::Local(b) => b.edit_file(path, old_text, new_text).await,
            ExecutionBackend::Remote(b) => b.edit_file(path, old_text, new_text).await,
        }
    }

    pub async fn list_dir(&self, path: &str) -> GatewayResult<Vec<DirEntry>> {
        match self {
            ExecutionBackend::Local(b) => b.list_dir(path).await,
            ExecutionBackend::Remote(b) => b.list_dir(path).await,
        }
    }

    pub async fn compare_file(&self, path: &str, content: &str) -> GatewayResult<CompareOutput> {
        match self {
            ExecutionBackend::Local(b) => b.compare_file(path, content).await,
            ExecutionBackend::Remote(b) => b.compare_file(path, content).await,
        }
    }
}

/// Executes directly on the gateway's own host, bypassing SSH entirely. Kept
/// minimal: just enough to make the backend interface callable end to end
/// when no `--host` is given.
pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        Self
    }

    pub async fn exec(&self, command: &str, working_dir: Option<&str>, timeout: Option<Duration>) -> GatewayResult<ExecOutput> {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(command);
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let child = cmd.spawn().map_err(GatewayError::from)?;
        let deadline = timeout.unwrap_or(Duration::from_secs(60));

        match tokio::time::timeout(deadline, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&output.stderr));
                Ok(ExecOutput {
                    success: output.status.success(),
                    output: combined,
                    error: None,
                    exit_code: output.status.code(),
                })
            }
            Ok(Err(e)) => Err(GatewayError::from(e)),
            Err(_) => Err(GatewayError::Timeout(command.to_string())),
        }
    }

    pub async fn read_file(&self, path: &str) -> GatewayResult<String> {
        let path = path.to_string();
        tokio::task::spawn_blocking(move || crate::agent::files::read_file(&path))
            .await
            .map_err(|e| GatewayError::Other(e.to_string()))?
    }

    pub async fn write_file(&self, path: &str, content: &str) -> GatewayResult<WriteOutput> {
        let path = path.to_string();
        let content = content.to_string();
        let bytes = tokio::task::spawn_blocking(move || crate::agent::files::write_file(&path, &content))
            .await
            .map_err(|e| GatewayError::Other(e.to_string()))??;
        Ok(WriteOutput { success: true, bytes })
    }

    pub async fn edit_file(&self, path: &str, old_text: &str, new_text: &str) -> GatewayResult<()> {
        let path = path.to_string();
        let old_text = old_text.to_string();
        let new_text = new_text.to_string();
        tokio::task::spawn_blocking(move || crate::agent::files::edit_file(&path, &old_text, &new_text))
            .await
            .map_err(|e| GatewayError::Other(e.to_string()))?
    }

    pub async fn list_dir(&self, path: &str) -> GatewayResult<Vec<DirEntry>> {
        let path = path.to_string();
        tokio::task::spawn_blocking(move || crate::agent::files::list_dir(&path))
            .await
            .map_err(|e| GatewayError::Other(e.to_string()))?
    }

    pub async fn compare_file(&self, path: &str, content: &str) -> GatewayResult<CompareOutput> {
        let path = path.to_string();
        let content = content.to_string();
        let outcome = tokio::task::spawn_blocking(move || crate::agent::files::compare_file(&path, &content))
            .await
            .map_err(|e| GatewayError::Other(e.to_string()))??;
        Ok(CompareOutput { identical: outcome.identical, diff: outcome.diff })
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Routes every call through `RemoteHost::rpc`, translating `RpcResponse`
/// back into the common result shapes.
pub struct RemoteBackend {
    host: Arc<RemoteHost>,
}

impl RemoteBackend {
    pub fn new(host: Arc<RemoteHost>) -> Self {
        Self { host }
    }

    pub async fn exec(&self, command: &str, working_dir: Option<&str>, timeout: Option<Duration>) -> GatewayResult<ExecOutput> {
        let req = RpcRequest::Exec {
            request_id: uuid::Uuid::new_v4().to_string(),
            command: command.to_string(),
            working_dir: working_dir.map(str::to_string),
            timeout: timeout.map(|d| d.as_secs()),
        };
        match self.host.rpc(req, timeout).await? {
            RpcResponse::Result { success, output, error, exit_code, .. } => Ok(ExecOutput {
                success,
                output: output.unwrap_or_default(),
                error,
                exit_code,
            }),
            other => Err(unexpected(other)),
        }
    }

    pub async fn read_file(&self, path: &str) -> GatewayResult<String> {
        let req = RpcRequest::ReadFile {
            request_id: uuid::Uuid::new_v4().to_string(),
            path: path.to_string(),
        };
        match self.host.rpc(req, None).await? {
            RpcResponse::Result { success: true, content: Some(content), .. } => Ok(content),
            RpcResponse::Result { success: false, error, .. } => Err(GatewayError::NotFound(error.unwrap_or_default())),
            other => Err(unexpected(other)),
        }
    }

    pub async fn write_file(&self, path: &str, content: &str) -> GatewayResult<WriteOutput> {
        let req = RpcRequest::WriteFile {
            request_id: uuid::Uuid::new_v4().to_string(),
            path: path.to_string(),
            content: content.to_string(),
        };
        match self.host.rpc(req, None).await? {
            RpcResponse::Result { success: true, bytes: Some(bytes), .. } => Ok(WriteOutput { success: true, bytes }),
            RpcResponse::Result { success: false, error, .. } => Err(GatewayError::IoError(error.unwrap_or_default())),
            other => Err(unexpected(other)),
        }
    }

    pub async fn edit_file(&self, path: &str, old_text: &str, new_text: &str) -> GatewayResult<()> {
        let req = RpcRequest::EditFile {
            request_id: uuid::Uuid::new_v4().to_string(),
            path: path.to_string(),
            old_text: old_text.to_string(),
            new_text: new_text.to_string(),
        };
        match self.host.rpc(req, None).await? {
            RpcResponse::Result { success: true, .. } => Ok(()),
            RpcResponse::Result { success: false, error, .. } => Err(classify_edit_error(error.unwrap_or_default())),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_dir(&self, path: &str) -> GatewayResult<Vec<DirEntry>> {
        let req = RpcRequest::ListDir {
            request_id: uuid::Uuid::new_v4().to_string(),
            path: path.to_string(),
        };
        match self.host.rpc(req, None).await? {
            RpcResponse::Result { success: true, entries: Some(entries), .. } => Ok(entries),
            RpcResponse::Result { success: false, error, .. } => Err(GatewayError::NotFound(error.unwrap_or_default())),
            other => Err(unexpected(other)),
        }
    }

    pub async fn compare_file(&self, path: &str, content: &str) -> GatewayResult<CompareOutput> {
        let req = RpcRequest::CompareFile {
            request_id: uuid::Uuid::new_v4().to_string(),
            path: path.to_string(),
            content: content.to_string(),
        };
        match self.host.rpc(req, None).await? {
            RpcResponse::Result { success: true, identical: Some(identical), diff, .. } => {
                Ok(CompareOutput { identical, diff })
            }
            RpcResponse::Result { success: false, error, .. } => Err(GatewayError::NotFound(error.unwrap_or_default())),
            other => Err(unexpected(other)),
        }
    }
}

fn classify_edit_error(message: String) -> GatewayError {
    if message.contains("appears") {
        GatewayError::NotUnique(message)
    } else {
        GatewayError::NotFound(message)
    }
}

fn unexpected(resp: RpcResponse) -> GatewayError {
    match resp {
        RpcResponse::Error { code, message, .. } => GatewayError::Other(format!("{}: {}", code, message)),
        other => GatewayError::Other(format!("unexpected response: {:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_exec_reports_true_exit_code() {
        let backend = LocalBackend::new();
        let out = backend.exec("exit 7", None, Some(Duration::from_secs(5))).await.unwrap();
        assert!(!out.success);
        assert_eq!(out.exit_code, Some(7));
    }

    #[tokio::test]
    async fn local_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.txt");
        let path_str = path.to_str().unwrap();

        let backend = LocalBackend::new();
        let write = backend.write_file(path_str, "A").await.unwrap();
        assert_eq!(write.bytes, 1);
        assert_eq!(backend.read_file(path_str).await.unwrap(), "A");

        backend.edit_file(path_str, "A", "BBB").await.unwrap();
        assert_eq!(backend.read_file(path_str).await.unwrap(), "BBB");

        let same = backend.compare_file(path_str, "BBB").await.unwrap();
        assert!(same.identical);
        let different = backend.compare_file(path_str, "CCC").await.unwrap();
        assert!(!different.identical);
        assert!(different.diff.unwrap().contains("+CCC"));
    }

    #[test]
    fn classify_edit_error_distinguishes_ambiguous_from_missing() {
        assert_eq!(classify_edit_error("'A' appears 2 times in x".into()).code(), "NotUnique");
        assert_eq!(classify_edit_error("'A' not found in x".into()).code(), "NotFound");
    }

    #[tokio::test]
    async fn router_resolves_to_local_when_host_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = crate::registry::HostRegistry::load_from(dir.path().join("hosts.json")).unwrap();
        let manager = Arc::new(HostManager::new(registry));
        let router = ExecutionBackendRouter::new(manager);

        let backend = router.resolve(None).await.unwrap();
        assert!(matches!(backend, ExecutionBackend::Local(_)));

        let backend = router.resolve(Some("")).await.unwrap();
        assert!(matches!(backend, ExecutionBackend::Local(_)));
    }

    #[tokio::test]
    async fn router_resolving_unknown_host_fails() {
        let dir = tempfile::tempdir().unwrap();
        let registry = crate::registry::HostRegistry::load_from(dir.path().join("hosts.json")).unwrap();
        let manager = Arc::new(HostManager::new(registry));
        let router = ExecutionBackendRouter::new(manager);

        let err = router.resolve(Some("nope")).await.unwrap_err();
        assert_eq!(err.code(), "HostNotFound");
    }
}
