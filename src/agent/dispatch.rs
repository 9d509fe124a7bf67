//! §4.8 RemoteAgent dispatcher: routes one connection's frames through the
//! idempotency layer (`idempotency.rs`) to the exec/file handlers.

use std::path::PathBuf;
use std::sync::Arc;

use crate::agent::executor::SessionExecutor;
use crate::agent::files;
use crate::agent::idempotency::{IdempotencyCache, Lookup};
use crate::error::GatewayError;
use crate::logging::agent_log;
use crate::model::{RpcRequest, RpcResponse};

pub struct Dispatcher {
    executor: Arc<SessionExecutor>,
    cache: IdempotencyCache,
    session_dir: PathBuf,
}

impl Dispatcher {
    pub fn new(executor: Arc<SessionExecutor>, session_dir: PathBuf) -> Self {
        Self {
            executor,
            cache: IdempotencyCache::new(),
            session_dir,
        }
    }

    /// Handles one request frame, returning the response to send back.
    /// `ping`/`close`/`shutdown` bypass the idempotency layer entirely
    /// (`spec.md` §4.8 - they carry no `requestId`).
    pub async fn handle(&self, req: RpcRequest) -> RpcResponse {
        let Some(request_id) = req.request_id().map(str::to_string) else {
            return self.handle_untagged(req).await;
        };

        let fingerprint = IdempotencyCache::fingerprint(&req);
        match self.cache.begin(&request_id, &fingerprint).await {
            Lookup::Cached(resp) => resp,
            Lookup::Await(rx) => match IdempotencyCache::join(rx).await {
                Ok(resp) => resp,
                Err(e) => error_response(Some(request_id), &GatewayError::Other(e.to_string())),
            },
            Lookup::Conflict => {
                agent_log(
                    &self.session_dir,
                    "dispatch",
                    &format!("requestId {} reused with a different payload", request_id),
                );
                error_response(Some(request_id.clone()), &GatewayError::RequestIdConflict(request_id))
            }
            Lookup::Fresh(tx) => {
                let resp = self.run(req, &request_id).await;
                self.cache.complete(&request_id, tx, resp.clone()).await;
                resp
            }
        }
    }

    async fn handle_untagged(&self, req: RpcRequest) -> RpcResponse {
        match req {
            RpcRequest::Ping => RpcResponse::Pong,
            RpcRequest::Shutdown => {
                self.executor.shutdown().await;
                RpcResponse::ShutdownAck
            }
            RpcRequest::Close => RpcResponse::Pong,
            other => error_response(None, &GatewayError::Other(format!("unreachable untagged request: {:?}", other.request_id()))),
        }
    }

    async fn run(&self, req: RpcRequest, request_id: &str) -> RpcResponse {
        match req {
            RpcRequest::Exec { command, working_dir, timeout, .. } => {
                match self.executor.exec(&command, working_dir.as_deref(), timeout).await {
                    Ok(outcome) => RpcResponse::Result {
                        request_id: request_id.to_string(),
                        success: outcome.success,
                        output: Some(outcome.output),
                        content: None,
                        entries: None,
                        bytes: None,
                        identical: None,
                        diff: None,
                        error: outcome.error,
                        exit_code: outcome.exit_code,
                    },
                    Err(e) => result_error(request_id, e.to_string()),
                }
            }
            RpcRequest::ReadFile { path, .. } => match files::read_file(&path) {
                Ok(content) => RpcResponse::Result {
                    request_id: request_id.to_string(),
                    success: true,
                    output: None,
                    content: Some(content),
                    entries: None,
                    bytes: None,
                    identical: None,
                    diff: None,
                    error: None,
                    exit_code: None,
                },
                Err(e) => result_error(request_id, e.to_string()),
            },
            RpcRequest::WriteFile { path, content, .. } => match files::write_file(&path, &content) {
                Ok(bytes) => RpcResponse::Result {
                    request_id: request_id.to_string(),
                    success: true,
                    output: None,
                    content: None,
                    entries: None,
                    bytes: Some(bytes),
                    identical: None,
                    diff: None,
                    error: None,
                    exit_code: None,
                },
                Err(e) => result_error(request_id, e.to_string()),
            },
            RpcRequest::EditFile { path, old_text, new_text, .. } => {
                match files::edit_file(&path, &old_text, &new_text) {
                    Ok(()) => RpcResponse::Result {
                        request_id: request_id.to_string(),
                        success: true,
                        output: None,
                        content: None,
                        entries: None,
                        bytes: None,
                        identical: None,
                        diff: None,
                        error: None,
                        exit_code: None,
                    },
                    Err(e) => result_error(request_id, e.to_string()),
                }
            }
            RpcRequest::ListDir { path, .. } => match files::list_dir(&path) {
                Ok(entries) => RpcResponse::Result {
                    request_id: request_id.to_string(),
                    success: true,
                    output: None,
                    content: None,
                    entries: Some(entries),
                    bytes: None,
                    identical: None,
                    diff: None,
                    error: None,
                    exit_code: None,
                },
                Err(e) => result_error(request_id, e.to_string()),
            },
            RpcRequest::CompareFile { path, content, .. } => match files::compare_file(&path, &content) {
                Ok(outcome) => RpcResponse::Result {
                    request_id: request_id.to_string(),
                    success: true,
                    output: None,
                    content: None,
                    entries: None,
                    bytes: None,
                    identical: Some(outcome.identical),
                    diff: outcome.diff,
                    error: None,
                    exit_code: None,
                },
                Err(e) => result_error(request_id, e.to_string()),
            },
            RpcRequest::Ping | RpcRequest::Close | RpcRequest::Shutdown => {
                unreachable!("untagged requests are routed through handle_untagged")
            }
        }
    }
}

/// Application errors are returned as a failed result, not an RPC-level
/// error frame (`spec.md` §7).
fn result_error(request_id: &str, message: String) -> RpcResponse {
    RpcResponse::Result {
        request_id: request_id.to_string(),
        success: false,
        output: None,
        content: None,
        entries: None,
        bytes: None,
        identical: None,
        diff: None,
        error: Some(message),
        exit_code: None,
    }
}

fn error_response(request_id: Option<String>, err: &GatewayError) -> RpcResponse {
    RpcResponse::Error {
        request_id,
        code: err.code().to_string(),
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::executor::SessionExecutor;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(SessionExecutor::new(false, std::env::temp_dir())), std::env::temp_dir())
    }

    #[tokio::test]
    async fn ping_bypasses_idempotency_layer() {
        let d = dispatcher();
        assert!(matches!(d.handle(RpcRequest::Ping).await, RpcResponse::Pong));
        assert!(matches!(d.handle(RpcRequest::Ping).await, RpcResponse::Pong));
    }

    #[tokio::test]
    async fn exec_result_carries_request_id() {
        let d = dispatcher();
        let req = RpcRequest::Exec {
            request_id: "r1".into(),
            command: "printf hello".into(),
            working_dir: None,
            timeout: Some(5),
        };
        let resp = d.handle(req).await;
        match resp {
            RpcResponse::Result { request_id, success, output, exit_code, .. } => {
                assert_eq!(request_id, "r1");
                assert!(success);
                assert_eq!(output.unwrap(), "hello");
                assert_eq!(exit_code, Some(0));
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn repeated_request_id_with_same_payload_is_deduped() {
        let d = dispatcher();
        let req = || RpcRequest::Exec {
            request_id: "r1".into(),
            command: "printf hello".into(),
            working_dir: None,
            timeout: Some(5),
        };
        let first = d.handle(req()).await;
        let second = d.handle(req()).await;
        assert_eq!(format!("{:?}", first), format!("{:?}", second));
    }

    #[tokio::test]
    async fn repeated_request_id_with_different_payload_conflicts() {
        let d = dispatcher();
        let first = RpcRequest::Exec {
            request_id: "r1".into(),
            command: "printf hello".into(),
            working_dir: None,
            timeout: Some(5),
        };
        let second = RpcRequest::Exec {
            request_id: "r1".into(),
            command: "printf bye".into(),
            working_dir: None,
            timeout: Some(5),
        };
        d.handle(first).await;
        let resp = d.handle(second).await;
        match resp {
            RpcResponse::Error { code, .. } => assert_eq!(code, "RequestIdConflict"),
            other => panic!("expected RequestIdConflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn request_id_conflict_is_logged() {
        let dir = tempfile::tempdir().unwrap();
        let d = Dispatcher::new(
            Arc::new(SessionExecutor::new(false, std::env::temp_dir())),
            dir.path().to_path_buf(),
        );
        let first = RpcRequest::Exec {
            request_id: "r1".into(),
            command: "printf hello".into(),
            working_dir: None,
            timeout: Some(5),
        };
        let second = RpcRequest::Exec {
            request_id: "r1".into(),
            command: "printf bye".into(),
            working_dir: None,
            timeout: Some(5),
        };
        d.handle(first).await;
        d.handle(second).await;

        let log = std::fs::read_to_string(dir.path().join("remote_server.log")).unwrap();
        assert!(log.contains("requestId r1 reused with a different payload"));
    }

    #[tokio::test]
    async fn edit_file_not_found_is_returned_as_application_error() {
        let d = dispatcher();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.txt").to_str().unwrap().to_string();
        std::fs::write(&path, "hello").unwrap();

        let req = RpcRequest::EditFile {
            request_id: "r1".into(),
            path,
            old_text: "missing".into(),
            new_text: "x".into(),
        };
        match d.handle(req).await {
            RpcResponse::Result { success, error, .. } => {
                assert!(!success);
                assert!(error.unwrap().contains("not found"));
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }
}
