//! `HostManager`: a pool of `RemoteHost`s keyed by name, with resume-then-deploy
//! connect semantics and eager/lazy connect paths.
//!
//! The liveness-check-before-reuse shape mirrors a registry of live
//! connections keyed by id (as in `agent_registry.rs`'s
//! `wait_for_agent_connection`), with the in-memory bookkeeping laid out like
//! a `HashMap<String, SessionRecord>` session table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{Mutex, RwLock};

use crate::logging::{gateway_log, gateway_warn};
use crate::model::HostConfig;
use crate::registry::HostRegistry;
use crate::remote_host::RemoteHost;

/// How a `connect`/`get_or_connect` call was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Already connected; verified with a `ping`.
    AlreadyConnected,
    /// Rebound to a previously recorded session without redeploying.
    Resumed,
    /// No resumable session, or resume failed; a fresh `setup()` ran.
    Deployed,
}

/// One row of `HostManager::list()`.
pub struct HostListEntry {
    pub config: HostConfig,
    pub connected: bool,
    /// `true` when a persisted `active_session` exists but this host has no
    /// live in-memory connection and its SSH endpoint did not answer a quick
    /// reachability probe; diagnostic only, never auto-cleared.
    pub stale: bool,
}

pub struct HostManager {
    registry: RwLock<HostRegistry>,
    connections: Mutex<HashMap<String, Arc<RemoteHost>>>,
    /// Per-host lock serializing `resume_then_deploy`. Without it, two
    /// concurrent `connect`/`get_or_connect` calls for the same name both
    /// pass the "absent from `connections`" check, both run a full
    /// `setup()`, and both `insert`, leaking the loser's tunnel/session.
    /// Holding this lock across the whole check-then-insert sequence keeps
    /// at most one live `RemoteHost` per name (spec.md §8.1).
    connect_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl HostManager {
    pub fn new(registry: HostRegistry) -> Self {
        Self {
            registry: RwLock::new(registry),
            connections: Mutex::new(HashMap::new()),
            connect_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the per-host lock used to serialize connect attempts for
    /// `name`, creating one if this is the first call for that name.
    async fn connect_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.connect_locks
            .lock()
            .await
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Writes to the registry; does not connect.
    pub async fn add_host(&self, config: HostConfig) -> Result<()> {
        self.registry.write().await.add(config)
    }

    /// Disconnects if present, then removes from the registry. The config
    /// entry is only deleted once no `active_session` remains (i.e.
    /// `teardown` succeeded); a failed teardown leaves the entry so a later
    /// attempt can still clean it up.
    pub async fn remove_host(&self, name: &str) -> Result<()> {
        if self.connections.lock().await.contains_key(name) {
            self.disconnect(name).await?;
        }

        let mut registry = self.registry.write().await;
        let cfg = registry.get(name).with_context(|| format!("host not found: {}", name))?;
        if cfg.active_session.is_some() {
            anyhow::bail!(
                "cannot remove host '{}': an active session is still persisted (teardown did not complete)",
                name
            );
        }
        registry.remove(name)
    }

    /// Explicit user-requested connect.
    pub async fn connect(&self, name: &str) -> Result<ConnectOutcome> {
        let lock = self.connect_lock(name).await;
        let _guard = lock.lock().await;

        let mut connections = self.connections.lock().await;

        if let Some(host) = connections.get(name).cloned() {
            if host.ping().await {
                return Ok(ConnectOutcome::AlreadyConnected);
            }
            gateway_warn("host_manager", &format!("{}: ping failed on connected host, reconnecting", name));
            connections.remove(name);
            drop(connections);
            let _ = host.teardown().await;
            return self.resume_then_deploy(name).await;
        }
        drop(connections);

        self.resume_then_deploy(name).await
    }

    /// Implicit connect used by the router. Trusts `RemoteHost::rpc`'s own
    /// auto-heal instead of pinging first.
    pub async fn get_or_connect(&self, name: &str) -> Result<Arc<RemoteHost>> {
        if let Some(host) = self.connections.lock().await.get(name).cloned() {
            return Ok(host);
        }

        let lock = self.connect_lock(name).await;
        let _guard = lock.lock().await;

        // Re-check now that we hold the per-host lock: whoever held it
        // before us (if anyone) may have already finished connecting.
        if let Some(host) = self.connections.lock().await.get(name).cloned() {
            return Ok(host);
        }

        self.resume_then_deploy(name).await?;
        self.connections
            .lock()
            .await
            .get(name)
            .cloned()
            .with_context(|| format!("host '{}' vanished immediately after connecting", name))
    }

    /// Attempts to rebind to `config.active_session` first; on any failure
    /// (tunnel, auth, or ping) falls back to a fresh `setup()`, which
    /// allocates a new session id. A failing resume never clears the
    /// persisted `active_session`; only a successful `teardown` does.
    async fn resume_then_deploy(&self, name: &str) -> Result<ConnectOutcome> {
        let config = self
            .registry
            .read()
            .await
            .get(name)
            .cloned()
            .with_context(|| format!("host not found: {}", name))?;

        let host = Arc::new(RemoteHost::new(config.clone()));

        if let Some(active) = &config.active_session {
            match host.resume(active).await {
                Ok(()) => {
                    self.connections.lock().await.insert(name.to_string(), host);
                    gateway_log("host_manager", &format!("{}: resumed session {}", name, active.session_id));
                    return Ok(ConnectOutcome::Resumed);
                }
                Err(e) => {
                    gateway_warn(
                        "host_manager",
                        &format!("{}: resume failed ({}), falling back to a fresh setup", name, e),
                    );
                }
            }
        }

        let active = host.setup().await.context("setup failed")?;
        self.registry.write().await.save_session(name, active)?;
        self.connections.lock().await.insert(name.to_string(), host);
        Ok(ConnectOutcome::Deployed)
    }

    /// Tears down and removes from `connections`. The persisted
    /// `active_session` is cleared only if `teardown` succeeds.
    pub async fn disconnect(&self, name: &str) -> Result<()> {
        let host = self.connections.lock().await.remove(name);
        let Some(host) = host else { return Ok(()) };

        let result = host.teardown().await;
        if result.is_ok() {
            self.registry.write().await.clear_session(name)?;
        }
        result
    }

    /// Lists every registered host with its live connection state.
    pub async fn list(&self) -> Vec<HostListEntry> {
        let registry = self.registry.read().await;
        let connections = self.connections.lock().await;

        let mut entries = Vec::new();
        for config in registry.list() {
            let connected = connections.contains_key(&config.name);
            let stale = !connected && config.active_session.is_some() && !probe_reachable(&config.ssh_target, config.ssh_port).await;
            entries.push(HostListEntry {
                config: config.clone(),
                connected,
                stale,
            });
        }
        entries
    }
}

/// Cheap reachability probe for `list()`'s `stale` diagnostic: a raw TCP
/// connect to the SSH port, bounded so a dead host doesn't stall the listing.
async fn probe_reachable(ssh_target: &str, ssh_port: u16) -> bool {
    let Some((_, host)) = ssh_target.split_once('@') else {
        return false;
    };
    tokio::time::timeout(Duration::from_secs(2), tokio::net::TcpStream::connect((host, ssh_port)))
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(name: &str) -> HostConfig {
        HostConfig::new(name, "deploy@example.com")
    }

    #[tokio::test]
    async fn add_host_persists_to_registry() {
        let dir = tempdir().unwrap();
        let registry = HostRegistry::load_from(dir.path().join("hosts.json")).unwrap();
        let manager = HostManager::new(registry);

        manager.add_host(sample("web1")).await.unwrap();
        let entries = manager.list().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].config.name, "web1");
        assert!(!entries[0].connected);
    }

    #[tokio::test]
    async fn remove_host_without_active_session_succeeds() {
        let dir = tempdir().unwrap();
        let registry = HostRegistry::load_from(dir.path().join("hosts.json")).unwrap();
        let manager = HostManager::new(registry);

        manager.add_host(sample("web1")).await.unwrap();
        manager.remove_host("web1").await.unwrap();
        assert!(manager.list().await.is_empty());
    }

    #[tokio::test]
    async fn remove_host_with_active_session_and_no_live_connection_is_refused() {
        let dir = tempdir().unwrap();
        let registry = HostRegistry::load_from(dir.path().join("hosts.json")).unwrap();
        let manager = HostManager::new(registry);
        manager.add_host(sample("web1")).await.unwrap();

        manager
            .registry
            .write()
            .await
            .save_session(
                "web1",
                crate::model::ActiveSession {
                    session_id: "abc12345".into(),
                    remote_dir: "/tmp/hostbridge-abc12345/".into(),
                    remote_port: 8765,
                    local_port: 54321,
                    auth_token: None,
                },
            )
            .unwrap();

        let err = manager.remove_host("web1").await.unwrap_err();
        assert!(err.to_string().contains("active session"));
    }

    #[tokio::test]
    async fn disconnect_of_unknown_host_is_a_noop() {
        let dir = tempdir().unwrap();
        let registry = HostRegistry::load_from(dir.path().join("hosts.json")).unwrap();
        let manager = HostManager::new(registry);
        manager.disconnect("nope").await.unwrap();
    }
}
