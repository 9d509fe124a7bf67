//! `RemoteHost`: owns one tunnel, one wire client, and at most one resumable
//! session; serializes its own RPCs and recovers a dropped transport without
//! redeploying.
//!
//! Built on `host/server.rs`'s explicit-state-transition shape, and on
//! `agent_deployer.rs`'s shutdown sequence (`systemctl stop`, `fuser -k`)
//! adapted from systemd-managed to directly-PID-managed, since this gateway
//! has no service manager on the remote host.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::bootstrap::{self, shell_quote};
use crate::config;
use crate::error::{GatewayError, GatewayResult};
use crate::logging::{gateway_log, gateway_warn};
use crate::model::{ActiveSession, ConnectionState, HostConfig, RpcRequest, RpcResponse};
use crate::tunnel::{self, SshTunnel};
use crate::wire::WireClient;

/// Runtime descriptor of the live remote session, as distinct from the
/// persisted `ActiveSession` record `HostRegistry` holds.
#[derive(Debug, Clone)]
pub struct RemoteSession {
    pub session_id: String,
    pub remote_dir: String,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

struct Transport {
    tunnel: SshTunnel,
    wire: WireClient,
}

struct Inner {
    transport: Option<Transport>,
    session: Option<RemoteSession>,
    state: ConnectionState,
}

/// One named remote host's live connection, owned by `HostManager`.
pub struct RemoteHost {
    config: HostConfig,
    inner: Mutex<Inner>,
}

impl RemoteHost {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                transport: None,
                session: None,
                state: ConnectionState::Disconnected,
            }),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    /// Idempotent: a no-op if a transport is already held.
    /// Allocates a fresh `sessionId`, stages and launches the remote agent,
    /// and opens an authenticated wire. Returns the `ActiveSession` record
    /// for the caller (`HostManager`) to persist.
    pub async fn setup(&self) -> Result<ActiveSession> {
        let mut inner = self.inner.lock().await;
        if let (Some(transport), Some(session)) = (&inner.transport, &inner.session) {
            return Ok(self.active_session_from(session, transport));
        }

        let session_id = random_session_id();
        let tunnel = SshTunnel::open(&self.config)
            .await
            .context("NetworkUnreachable: failed to open SSH tunnel")?;

        let outcome = bootstrap::bootstrap(&self.config, &session_id, true)
            .await
            .context("bootstrap failed")?;

        let wire = WireClient::connect(tunnel.local_port(), self.config.auth_token.as_deref())
            .await
            .context("RemoteServerUnresponsive: failed to authenticate wire connection")?;

        let session = RemoteSession {
            session_id: session_id.clone(),
            remote_dir: outcome.remote_dir.clone(),
            pid: outcome.pid,
            started_at: Utc::now(),
        };

        let active = ActiveSession {
            session_id,
            remote_dir: outcome.remote_dir,
            remote_port: self.config.remote_port,
            local_port: tunnel.local_port(),
            auth_token: self.config.auth_token.clone(),
        };

        inner.transport = Some(Transport { tunnel, wire });
        inner.session = Some(session);
        inner.state = ConnectionState::Connected;

        gateway_log("remote_host", &format!("{}: setup complete ({})", self.config.name, active.session_id));
        Ok(active)
    }

    /// Rebinds to a previously recorded session without redeploying: opens a
    /// fresh tunnel to the same `remotePort`, opens wire with the recorded
    /// token, and confirms liveness with a `ping`. Used by `HostManager`'s
    /// resume-then-deploy before falling back to `setup()`.
    pub async fn resume(&self, active: &ActiveSession) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let mut resume_config = self.config.clone();
        resume_config.remote_port = active.remote_port;

        let tunnel = SshTunnel::open(&resume_config)
            .await
            .context("NetworkUnreachable: failed to reopen SSH tunnel for resume")?;
        let wire = WireClient::connect(tunnel.local_port(), active.auth_token.as_deref())
            .await
            .context("RemoteServerUnresponsive: failed to authenticate resumed wire connection")?;

        let pong = wire
            .call(RpcRequest::Ping, Some(Duration::from_secs(10)))
            .await
            .context("RemoteServerUnresponsive: resumed session did not answer ping")?;
        if !matches!(pong, RpcResponse::Pong) {
            anyhow::bail!("RemoteServerUnresponsive: unexpected reply to resume ping");
        }

        let session = RemoteSession {
            session_id: active.session_id.clone(),
            remote_dir: active.remote_dir.clone(),
            pid: None,
            started_at: Utc::now(),
        };

        inner.transport = Some(Transport { tunnel, wire });
        inner.session = Some(session);
        inner.state = ConnectionState::Connected;

        gateway_log("remote_host", &format!("{}: resumed session {}", self.config.name, active.session_id));
        Ok(())
    }

    /// Serialized per host via `inner`'s lock; on transport
    /// failure, one recovery attempt is made and the same request retried
    /// before surfacing a typed error.
    pub async fn rpc(&self, req: RpcRequest, deadline: Option<Duration>) -> GatewayResult<RpcResponse> {
        let mut inner = self.inner.lock().await;

        let Some(transport) = inner.transport.as_ref() else {
            return Err(GatewayError::NetworkUnreachable(format!("{} is not connected", self.config.name)));
        };
        let first_attempt = transport.wire.call(req.clone(), deadline).await;

        match first_attempt {
            Ok(resp) => Ok(resp),
            Err(e) => {
                gateway_warn(
                    "remote_host",
                    &format!("{}: rpc failed, attempting transport recovery: {}", self.config.name, e),
                );
                inner.state = ConnectionState::Recovering;

                if let Err(recover_err) = self.recover_transport_locked(&mut inner).await {
                    inner.state = ConnectionState::Failed;
                    gateway_warn(
                        "remote_host",
                        &format!("{}: transport recovery failed: {}", self.config.name, recover_err),
                    );
                    return Err(classify_recovery_failure(&recover_err));
                }

                let retry = match inner.transport.as_ref() {
                    Some(transport) => transport.wire.call(req, deadline).await,
                    None => unreachable!("recover_transport_locked always leaves a transport on success"),
                };
                match retry {
                    Ok(resp) => {
                        inner.state = ConnectionState::Connected;
                        Ok(resp)
                    }
                    Err(e) => {
                        inner.state = ConnectionState::Failed;
                        gateway_warn(
                            "remote_host",
                            &format!("{}: retry after recovery also failed: {}", self.config.name, e),
                        );
                        Err(GatewayError::RemoteServerUnresponsive(e.to_string()))
                    }
                }
            }
        }
    }

    /// Tears down wire + tunnel and re-establishes both against the same
    /// remote session directory, without redeploying or allocating a new
    /// `sessionId`.
    async fn recover_transport_locked(&self, inner: &mut Inner) -> Result<()> {
        let session = inner
            .session
            .as_ref()
            .context("no active session to recover")?
            .clone();

        if let Some(mut transport) = inner.transport.take() {
            transport.tunnel.close();
        }

        let mut recover_config = self.config.clone();
        recover_config.remote_port = self.config.remote_port;

        let tunnel = SshTunnel::open(&recover_config)
            .await
            .context("NetworkUnreachable: failed to reopen tunnel during recovery")?;
        let wire = WireClient::connect(tunnel.local_port(), self.config.auth_token.as_deref())
            .await
            .context("RemoteServerUnresponsive: failed to re-authenticate during recovery")?;

        inner.transport = Some(Transport { tunnel, wire });
        inner.session = Some(session);
        Ok(())
    }

    /// Small RPC used by `HostManager::connect` for active
    /// verification. A cheap tunnel probe runs first so a transport that has
    /// plainly died (listener gone) fails fast instead of waiting out a full
    /// RPC timeout on a socket nothing will ever answer.
    pub async fn ping(&self) -> bool {
        {
            let inner = self.inner.lock().await;
            match &inner.transport {
                Some(transport) if transport.tunnel.probe().await => {}
                _ => return false,
            }
        }
        matches!(
            self.rpc(RpcRequest::Ping, Some(Duration::from_secs(10))).await,
            Ok(RpcResponse::Pong)
        )
    }

    /// Best-effort at every step; `active_session` is only
    /// cleared by the caller once this returns `Ok`.
    pub async fn teardown(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;

        let (transport, session) = match (inner.transport.take(), inner.session.take()) {
            (Some(t), Some(s)) => (t, s),
            _ => {
                inner.state = ConnectionState::Disconnected;
                return Ok(());
            }
        };

        let graceful = tokio::time::timeout(
            Duration::from_secs(config::shutdown_ack_timeout_secs()),
            transport.wire.call(RpcRequest::Shutdown, Some(Duration::from_secs(config::shutdown_ack_timeout_secs()))),
        )
        .await;

        let acked = matches!(graceful, Ok(Ok(RpcResponse::ShutdownAck)));
        if acked {
            tokio::time::sleep(Duration::from_secs(config::shutdown_cleanup_wait_secs())).await;
        } else {
            gateway_warn(
                "remote_host",
                &format!("{}: graceful shutdown not acked, forcing stop", self.config.name),
            );
            self.force_stop(&session).await?;
        }

        self.remove_session_dir(&session).await?;

        let mut transport = transport;
        transport.tunnel.close();

        inner.state = ConnectionState::Disconnected;
        gateway_log("remote_host", &format!("{}: teardown complete", self.config.name));
        Ok(())
    }

    /// SIGTERM, grace period, SIGKILL by pid; then `fuser -k` the port; then
    /// kill the multiplexer session. Each step best-effort.
    async fn force_stop(&self, session: &RemoteSession) -> Result<()> {
        let config = self.config.clone();
        let session = session.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let ssh = tunnel::handshake(&config.ssh_target, config.ssh_port, config.ssh_key_path.as_deref())
                .context("failed to open SSH session for force-stop")?;

            if let Some(pid) = session.pid {
                let _ = bootstrap::exec(&ssh, &format!("kill -TERM {} 2>/dev/null; true", pid));
                std::thread::sleep(Duration::from_secs(config::sigterm_grace_secs()));
                let _ = bootstrap::exec(&ssh, &format!("kill -KILL {} 2>/dev/null; true", pid));
            }
            let _ = bootstrap::exec(&ssh, &format!("fuser -k {}/tcp 2>/dev/null; true", config.remote_port));
            let _ = bootstrap::exec(&ssh, "tmux kill-session -t nanobot 2>/dev/null; true");
            Ok(())
        })
        .await
        .context("force-stop task panicked")??;
        Ok(())
    }

    async fn remove_session_dir(&self, session: &RemoteSession) -> Result<()> {
        let config = self.config.clone();
        let remote_dir = session.remote_dir.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let ssh = tunnel::handshake(&config.ssh_target, config.ssh_port, config.ssh_key_path.as_deref())
                .context("failed to open SSH session to remove session directory")?;
            bootstrap::exec(&ssh, &format!("rm -rf '{}'", shell_quote(&remote_dir)))
                .context("failed to remove remote session directory")?;
            Ok(())
        })
        .await
        .context("session directory removal task panicked")??;
        Ok(())
    }

    fn active_session_from(&self, session: &RemoteSession, transport: &Transport) -> ActiveSession {
        ActiveSession {
            session_id: session.session_id.clone(),
            remote_dir: session.remote_dir.clone(),
            remote_port: self.config.remote_port,
            local_port: transport.tunnel.local_port(),
            auth_token: self.config.auth_token.clone(),
        }
    }
}

fn classify_recovery_failure(err: &anyhow::Error) -> GatewayError {
    if err.to_string().contains("NetworkUnreachable") {
        GatewayError::NetworkUnreachable(err.to_string())
    } else {
        GatewayError::RemoteServerUnresponsive(err.to_string())
    }
}

fn random_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..8).map(|_| std::char::from_digit(rng.gen_range(0..16), 16).unwrap()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_session_id_is_eight_hex_chars() {
        let id = random_session_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn classify_recovery_failure_prefers_network_unreachable() {
        let err = anyhow::anyhow!("NetworkUnreachable: could not reopen tunnel");
        assert_eq!(classify_recovery_failure(&err).code(), "NetworkUnreachable");
        let err = anyhow::anyhow!("wire auth failed");
        assert_eq!(classify_recovery_failure(&err).code(), "RemoteServerUnresponsive");
    }

    #[tokio::test]
    async fn fresh_host_starts_disconnected() {
        let host = RemoteHost::new(HostConfig::new("web1", "deploy@example.com"));
        assert_eq!(host.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn rpc_without_transport_fails_network_unreachable() {
        let host = RemoteHost::new(HostConfig::new("web1", "deploy@example.com"));
        let err = host.rpc(RpcRequest::Ping, None).await.unwrap_err();
        assert_eq!(err.code(), "NetworkUnreachable");
    }

    #[tokio::test]
    async fn teardown_without_session_is_a_noop() {
        let host = RemoteHost::new(HostConfig::new("web1", "deploy@example.com"));
        host.teardown().await.unwrap();
        assert_eq!(host.state().await, ConnectionState::Disconnected);
    }
}
