//! Centralized home-based storage paths for gateway persistence.
//!
//! Everything the gateway keeps across runs lives under `~/.hostbridge/`:
//! - `hosts.json`: the host registry
//! - `gateway.log`: debug log
//!
//! On-host paths (inside a remote session directory) are computed
//! separately by `bootstrap.rs` since they live on the remote filesystem,
//! not the gateway's.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

const HOSTBRIDGE_DIR: &str = ".hostbridge";

/// Returns `~/.hostbridge/`, creating it if it doesn't exist.
pub fn hostbridge_home_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("could not determine home directory")?;
    let dir = home.join(HOSTBRIDGE_DIR);
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;
    Ok(dir)
}

/// Returns the host registry file path: `~/.hostbridge/hosts.json`.
///
/// Honors `HOSTBRIDGE_REGISTRY_PATH` when set, the same env-var override
/// pattern used for the other ambient tunables in `config.rs`.
pub fn registry_path() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("HOSTBRIDGE_REGISTRY_PATH") {
        return Ok(PathBuf::from(p));
    }
    Ok(hostbridge_home_dir()?.join("hosts.json"))
}

/// Returns the gateway debug log path: `~/.hostbridge/gateway.log`.
pub fn gateway_log_path() -> Result<PathBuf> {
    Ok(hostbridge_home_dir()?.join("gateway.log"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[serial_test::serial]
    fn registry_path_honors_env_override() {
        let guard = std::env::var("HOSTBRIDGE_REGISTRY_PATH").ok();
        std::env::set_var("HOSTBRIDGE_REGISTRY_PATH", "/tmp/custom-hosts.json");
        assert_eq!(
            registry_path().unwrap(),
            PathBuf::from("/tmp/custom-hosts.json")
        );
        match guard {
            Some(v) => std::env::set_var("HOSTBRIDGE_REGISTRY_PATH", v),
            None => std::env::remove_var("HOSTBRIDGE_REGISTRY_PATH"),
        }
    }
}
