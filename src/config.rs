//! Process-wide tunables, read from environment variables with hard-coded
//! defaults. Mirrors `session_daemon/server.rs`'s
//! `PLANNING_SESSIOND_STALE_SECS` pattern: a private constant for the
//! default, a small accessor that checks the environment first.

const DEFAULT_SSH_CONNECT_TIMEOUT_SECS: u64 = 20;
const DEFAULT_READINESS_TIMEOUT_SECS: u64 = 60;
const DEFAULT_RPC_TIMEOUT_SECS: u64 = 60;
const DEFAULT_SHUTDOWN_ACK_TIMEOUT_SECS: u64 = 5;
const DEFAULT_SHUTDOWN_CLEANUP_WAIT_SECS: u64 = 2;
const DEFAULT_SIGTERM_GRACE_SECS: u64 = 1;
const DEFAULT_SESSION_DIR_PREFIX: &str = "hostbridge";

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Bound on establishing the SSH transport (`SshTunnel::open`).
pub fn ssh_connect_timeout_secs() -> u64 {
    env_u64("HOSTBRIDGE_SSH_CONNECT_TIMEOUT_SECS", DEFAULT_SSH_CONNECT_TIMEOUT_SECS)
}

/// Bound on the launcher's readiness poll during bootstrap.
pub fn readiness_timeout_secs() -> u64 {
    env_u64("HOSTBRIDGE_READINESS_TIMEOUT_SECS", DEFAULT_READINESS_TIMEOUT_SECS)
}

/// Default per-call RPC deadline (`WireClient::call`); callers may override
/// this for a single long-running `exec`.
pub fn default_rpc_timeout_secs() -> u64 {
    env_u64("HOSTBRIDGE_RPC_TIMEOUT_SECS", DEFAULT_RPC_TIMEOUT_SECS)
}

/// How long `teardown` waits for `shutdown_ack` before falling back to a
/// forceful stop.
pub fn shutdown_ack_timeout_secs() -> u64 {
    env_u64("HOSTBRIDGE_SHUTDOWN_ACK_TIMEOUT_SECS", DEFAULT_SHUTDOWN_ACK_TIMEOUT_SECS)
}

/// Extra grace period after a successful `shutdown_ack` before proceeding to
/// remove the session directory.
pub fn shutdown_cleanup_wait_secs() -> u64 {
    env_u64("HOSTBRIDGE_SHUTDOWN_CLEANUP_WAIT_SECS", DEFAULT_SHUTDOWN_CLEANUP_WAIT_SECS)
}

/// Grace period between SIGTERM and SIGKILL in the forceful teardown path.
pub fn sigterm_grace_secs() -> u64 {
    env_u64("HOSTBRIDGE_SIGTERM_GRACE_SECS", DEFAULT_SIGTERM_GRACE_SECS)
}

/// Prefix used for on-host session directories: `/tmp/<prefix>-<sessionId>/`.
pub fn session_dir_prefix() -> String {
    std::env::var("HOSTBRIDGE_SESSION_DIR_PREFIX")
        .unwrap_or_else(|_| DEFAULT_SESSION_DIR_PREFIX.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn falls_back_to_default_when_unset() {
        std::env::remove_var("HOSTBRIDGE_READINESS_TIMEOUT_SECS");
        assert_eq!(readiness_timeout_secs(), DEFAULT_READINESS_TIMEOUT_SECS);
    }

    #[test]
    #[serial_test::serial]
    fn honors_env_override() {
        std::env::set_var("HOSTBRIDGE_READINESS_TIMEOUT_SECS", "5");
        assert_eq!(readiness_timeout_secs(), 5);
        std::env::remove_var("HOSTBRIDGE_READINESS_TIMEOUT_SECS");
    }

    #[test]
    #[serial_test::serial]
    fn ignores_unparseable_override() {
        std::env::set_var("HOSTBRIDGE_RPC_TIMEOUT_SECS", "not-a-number");
        assert_eq!(default_rpc_timeout_secs(), DEFAULT_RPC_TIMEOUT_SECS);
        std::env::remove_var("HOSTBRIDGE_RPC_TIMEOUT_SECS");
    }
}
