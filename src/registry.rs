//! `HostRegistry`: the persisted map of `HostConfig`s.
//!
//! Save is atomic (temp file in the same directory, fsync, rename). A corrupt
//! registry file is preserved with a `.bak` suffix and load starts from empty
//! rather than failing outright, mirroring `session_daemon/server.rs::load_from_disk`'s
//! tolerance for a previous instance's leftovers.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::logging::{gateway_log, gateway_warn};
use crate::model::{ActiveSession, HostConfig};
use crate::paths;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct RegistryFile {
    #[serde(default)]
    hosts: HashMap<String, HostConfig>,
}

/// In-memory, file-backed registry of `HostConfig`s.
///
/// Not thread-safe on its own; `HostManager` guards access with a
/// `tokio::sync::RwLock`.
pub struct HostRegistry {
    path: PathBuf,
    hosts: HashMap<String, HostConfig>,
}

impl HostRegistry {
    /// Loads the registry from the default path (`~/.hostbridge/hosts.json`),
    /// creating an empty one if the file does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from(paths::registry_path()?)
    }

    pub fn load_from(path: PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self {
                path,
                hosts: HashMap::new(),
            });
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read registry {}", path.display()))?;

        match serde_json::from_str::<RegistryFile>(&content) {
            Ok(file) => Ok(Self {
                path,
                hosts: file.hosts,
            }),
            Err(e) => {
                let bak_path = path.with_extension("json.bak");
                gateway_warn(
                    "registry",
                    &format!(
                        "corrupt registry at {}: {}; preserving as {} and starting empty",
                        path.display(),
                        e,
                        bak_path.display()
                    ),
                );
                let _ = fs::copy(&path, &bak_path);
                Ok(Self {
                    path,
                    hosts: HashMap::new(),
                })
            }
        }
    }

    /// Atomically persists the registry: write to a sibling temp file, fsync,
    /// rename over the destination.
    pub fn save(&self) -> Result<()> {
        let parent = self
            .path
            .parent()
            .context("registry path has no parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;

        let file = RegistryFile {
            hosts: self.hosts.clone(),
        };
        let json = serde_json::to_string_pretty(&file).context("failed to serialize registry")?;

        let tmp_path = parent.join(format!(".hosts.json.tmp.{}", std::process::id()));
        {
            let mut tmp = fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .with_context(|| format!("failed to create {}", tmp_path.display()))?;
            tmp.lock_exclusive()
                .context("failed to lock registry temp file")?;
            tmp.write_all(json.as_bytes())
                .context("failed to write registry temp file")?;
            tmp.sync_all().context("failed to fsync registry temp file")?;
        }
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename registry into {}", self.path.display()))?;
        gateway_log("registry", &format!("saved {} host(s)", self.hosts.len()));
        Ok(())
    }

    /// Fails with `AlreadyExists` if the name is taken.
    pub fn add(&mut self, config: HostConfig) -> Result<()> {
        if self.hosts.contains_key(&config.name) {
            anyhow::bail!("host already exists: {}", config.name);
        }
        self.hosts.insert(config.name.clone(), config);
        self.save()
    }

    /// Removes a host by name.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        if self.hosts.remove(name).is_none() {
            anyhow::bail!("host not found: {}", name);
        }
        self.save()
    }

    pub fn get(&self, name: &str) -> Option<&HostConfig> {
        self.hosts.get(name)
    }

    pub fn list(&self) -> Vec<&HostConfig> {
        let mut hosts: Vec<&HostConfig> = self.hosts.values().collect();
        hosts.sort_by(|a, b| a.name.cmp(&b.name));
        hosts
    }

    /// Persists a resumable session descriptor onto the host's config.
    pub fn save_session(&mut self, name: &str, session: ActiveSession) -> Result<()> {
        let cfg = self
            .hosts
            .get_mut(name)
            .with_context(|| format!("host not found: {}", name))?;
        cfg.active_session = Some(session);
        self.save()
    }

    /// Clears the persisted session; only ever called after a *successful*
    /// teardown.
    pub fn clear_session(&mut self, name: &str) -> Result<()> {
        let cfg = self
            .hosts
            .get_mut(name)
            .with_context(|| format!("host not found: {}", name))?;
        cfg.active_session = None;
        self.save()
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(name: &str) -> HostConfig {
        HostConfig::new(name, "deploy@example.com")
    }

    #[test]
    fn add_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let mut reg = HostRegistry::load_from(dir.path().join("hosts.json")).unwrap();
        reg.add(sample("web1")).unwrap();
        assert_eq!(reg.get("web1").unwrap().ssh_target, "deploy@example.com");
    }

    #[test]
    fn add_duplicate_name_fails() {
        let dir = tempdir().unwrap();
        let mut reg = HostRegistry::load_from(dir.path().join("hosts.json")).unwrap();
        reg.add(sample("web1")).unwrap();
        assert!(reg.add(sample("web1")).is_err());
    }

    #[test]
    fn remove_missing_fails() {
        let dir = tempdir().unwrap();
        let mut reg = HostRegistry::load_from(dir.path().join("hosts.json")).unwrap();
        assert!(reg.remove("nope").is_err());
    }

    #[test]
    fn save_then_reload_persists_hosts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hosts.json");
        {
            let mut reg = HostRegistry::load_from(path.clone()).unwrap();
            reg.add(sample("web1")).unwrap();
            reg.add(sample("web2")).unwrap();
        }
        let reg2 = HostRegistry::load_from(path).unwrap();
        assert_eq!(reg2.list().len(), 2);
    }

    #[test]
    fn corrupt_file_is_preserved_and_load_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hosts.json");
        fs::write(&path, b"not json at all {{{").unwrap();

        let reg = HostRegistry::load_from(path.clone()).unwrap();
        assert!(reg.list().is_empty());

        let bak = path.with_extension("json.bak");
        assert!(bak.exists());
    }

    #[test]
    fn save_session_then_clear_round_trips() {
        let dir = tempdir().unwrap();
        let mut reg = HostRegistry::load_from(dir.path().join("hosts.json")).unwrap();
        reg.add(sample("web1")).unwrap();

        let session = ActiveSession {
            session_id: "abc12345".into(),
            remote_dir: "/tmp/hostbridge-abc12345/".into(),
            remote_port: 8765,
            local_port: 54321,
            auth_token: Some("tok".into()),
        };
        reg.save_session("web1", session.clone()).unwrap();
        assert_eq!(reg.get("web1").unwrap().active_session.as_ref().unwrap().session_id, "abc12345");

        reg.clear_session("web1").unwrap();
        assert!(reg.get("web1").unwrap().active_session.is_none());
    }

    #[test]
    fn failed_resume_does_not_clear_active_session() {
        // Invariant: a resume attempt that fails leaves the
        // persisted activeSession in place. This is enforced by callers never
        // invoking clear_session() on a failed resume; modeled here by
        // asserting clear_session is the only path that removes it.
        let dir = tempdir().unwrap();
        let mut reg = HostRegistry::load_from(dir.path().join("hosts.json")).unwrap();
        reg.add(sample("web1")).unwrap();
        let session = ActiveSession {
            session_id: "abc12345".into(),
            remote_dir: "/tmp/hostbridge-abc12345/".into(),
            remote_port: 8765,
            local_port: 54321,
            auth_token: None,
        };
        reg.save_session("web1", session).unwrap();
        // Simulate a failed resume: nothing calls clear_session.
        assert!(reg.get("web1").unwrap().active_session.is_some());
    }
}
