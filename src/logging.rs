//! Shared debug logging for gateway and remote-agent components: no logging
//! framework, just tagged lines appended to a small file (`daemon_log.rs`'s
//! idiom), mirrored to stderr for warnings and errors. A `gateway_log(component,
//! msg)` helper writes to `~/.hostbridge/gateway.log`.

use std::io::Write;

use crate::paths;

/// Appends a timestamped, tagged line to `~/.hostbridge/gateway.log`.
///
/// The `component` identifies the source (e.g. `"tunnel"`, `"wire"`,
/// `"bootstrap"`) to aid debugging. Failures to write the log are silently
/// ignored; logging must never be a reason an RPC fails.
pub fn gateway_log(component: &str, msg: &str) {
    if let Ok(log_path) = paths::gateway_log_path() {
        if let Ok(mut file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
        {
            let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            let _ = writeln!(file, "[{}] [{}] {}", now, component, msg);
        }
    }
}

/// Same as `gateway_log`, plus a mirrored stderr line. Used for conditions an
/// operator should notice without tailing the log file.
pub fn gateway_warn(component: &str, msg: &str) {
    eprintln!("[hostbridge] [{}] {}", component, msg);
    gateway_log(component, &format!("WARN {}", msg));
}

pub fn gateway_error(component: &str, msg: &str) {
    eprintln!("[hostbridge] [{}] ERROR: {}", component, msg);
    gateway_log(component, &format!("ERROR {}", msg));
}

/// Logging helper for the remote-agent process. It has no access to the
/// gateway's home directory (it runs on a different host), so it logs to a
/// file inside its own session directory instead.
pub fn agent_log(session_dir: &std::path::Path, component: &str, msg: &str) {
    let log_path = session_dir.join("remote_server.log");
    if let Ok(mut file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let _ = writeln!(file, "[{}] [{}] {}", now, component, msg);
    }
}
