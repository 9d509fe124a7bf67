//! The error taxonomy surfaced to the router layer.
//!
//! Internal plumbing keeps using `anyhow::Result` with `.context(...)`;
//! this enum exists at the boundaries that callers branch on (CLI output,
//! `ExecutionBackendRouter`, `RemoteHost::rpc`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("host not found: {0}")]
    HostNotFound(String),

    #[error("host already exists: {0}")]
    AlreadyExists(String),

    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("remote server unresponsive: {0}")]
    RemoteServerUnresponsive(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("readiness timeout: {0}")]
    ReadinessTimeout(String),

    #[error("timeout waiting for response to request {0}")]
    Timeout(String),

    #[error("request id {0} reused with a different payload")]
    RequestIdConflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not unique: {0}")]
    NotUnique(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("{0}")]
    Other(String),
}

impl GatewayError {
    /// The wire-level error code used in `RpcResponse::Error.code` and in
    /// CLI diagnostics.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::HostNotFound(_) => "HostNotFound",
            GatewayError::AlreadyExists(_) => "AlreadyExists",
            GatewayError::NetworkUnreachable(_) => "NetworkUnreachable",
            GatewayError::RemoteServerUnresponsive(_) => "RemoteServerUnresponsive",
            GatewayError::Unauthorized(_) => "Unauthorized",
            GatewayError::ReadinessTimeout(_) => "ReadinessTimeout",
            GatewayError::Timeout(_) => "Timeout",
            GatewayError::RequestIdConflict(_) => "RequestIdConflict",
            GatewayError::NotFound(_) => "NotFound",
            GatewayError::NotUnique(_) => "NotUnique",
            GatewayError::IoError(_) => "IOError",
            GatewayError::Other(_) => "Error",
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        GatewayError::IoError(e.to_string())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_matches_spec_names() {
        assert_eq!(GatewayError::HostNotFound("x".into()).code(), "HostNotFound");
        assert_eq!(GatewayError::RequestIdConflict("r".into()).code(), "RequestIdConflict");
        assert_eq!(GatewayError::NotUnique("old".into()).code(), "NotUnique");
    }
}
