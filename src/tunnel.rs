//! `SshTunnel`: a local-to-remote TCP forward held open for the lifetime
//! of one `RemoteHost`.
//!
//! `ssh2`'s API is synchronous; the whole handshake and the per-connection
//! forwarding loop run on blocking threads via `tokio::task::spawn_blocking`,
//! the same wrapper the sibling example repo uses in
//! `localplatform-backup-server/backup-server-rs/src/services/agent_deployer.rs`
//! to keep `ssh2` off the async executor.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use crate::logging::{gateway_log, gateway_warn};
use crate::model::HostConfig;

/// A single local-to-remote port forward, owned by one `RemoteHost`.
///
/// `open()` binds an ephemeral local listener and spawns a blocking accept
/// loop that forwards each connection through the SSH session to
/// `127.0.0.1:<remote_port>` on the target host.
pub struct SshTunnel {
    local_port: u16,
    stop: Arc<AtomicBool>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl SshTunnel {
    /// Fails with a `NetworkUnreachable`-
    /// flavored error if the SSH transport cannot be established within
    /// `config::ssh_connect_timeout_secs()`.
    pub async fn open(config: &HostConfig) -> Result<Self> {
        let ssh_target = config.ssh_target.clone();
        let ssh_port = config.ssh_port;
        let ssh_key_path = config.ssh_key_path.clone();
        let remote_port = config.remote_port;
        let timeout_secs = crate::config::ssh_connect_timeout_secs();

        let session = tokio::time::timeout(
            std::time::Duration::from_secs(timeout_secs),
            tokio::task::spawn_blocking(move || {
                handshake(&ssh_target, ssh_port, ssh_key_path.as_deref())
            }),
        )
        .await
        .context("timed out establishing SSH transport")?
        .context("SSH handshake task panicked")??;

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind ephemeral local port")?;
        let local_port = listener.local_addr()?.port();

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let std_listener = listener.into_std()?;
        std_listener.set_nonblocking(false)?;

        let join = std::thread::spawn(move || {
            accept_loop(std_listener, session, remote_port, thread_stop);
        });

        gateway_log(
            "tunnel",
            &format!(
                "opened local:{} -> {}:{} (remote 127.0.0.1:{})",
                local_port, config.ssh_target, ssh_port, remote_port
            ),
        );

        Ok(Self {
            local_port,
            stop,
            join: Some(join),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// A cheap liveness check. Attempts a short TCP connect
    /// to the forwarded local port; the tunnel thread holds it open only
    /// while the SSH session is alive, so a refused connection means the
    /// transport has already died.
    pub async fn probe(&self) -> bool {
        tokio::net::TcpStream::connect(("127.0.0.1", self.local_port))
            .await
            .is_ok()
    }

    /// Idempotent: guarantees release of the listening
    /// socket and the forwarding thread.
    pub fn close(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // Unblock the accept() call with a throwaway local connection.
        let _ = std::net::TcpStream::connect(("127.0.0.1", self.local_port));
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
        gateway_log("tunnel", &format!("closed local:{}", self.local_port));
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens and authenticates a plain SSH session against `ssh_target`. Shared
/// with `bootstrap.rs`, which needs its own session (exec + SFTP) separate
/// from the tunnel's forwarding session.
pub(crate) fn handshake(
    ssh_target: &str,
    ssh_port: u16,
    ssh_key_path: Option<&std::path::Path>,
) -> Result<ssh2::Session> {
    let (user, host) = ssh_target
        .split_once('@')
        .context("ssh_target must be of the form user@host")?;

    let tcp = TcpStream::connect((host, ssh_port))
        .with_context(|| format!("failed to reach {}:{}", host, ssh_port))?;
    let mut session = ssh2::Session::new().context("failed to create SSH session")?;
    session.set_tcp_stream(tcp);
    session.handshake().context("SSH handshake failed")?;

    authenticate(&session, user, ssh_key_path)?;

    if !session.authenticated() {
        anyhow::bail!("SSH authentication failed for {}", ssh_target);
    }

    Ok(session)
}

fn authenticate(session: &ssh2::Session, user: &str, key_path: Option<&std::path::Path>) -> Result<()> {
    if let Some(key_path) = key_path {
        session
            .userauth_pubkey_file(user, None, key_path, None)
            .with_context(|| format!("pubkey auth with {} failed", key_path.display()))?;
        return Ok(());
    }

    // No explicit key configured: try the running ssh-agent first, then the
    // conventional ~/.ssh/id_ed25519 / id_rsa locations. No interactive
    // password prompting.
    if session.userauth_agent(user).is_ok() && session.authenticated() {
        return Ok(());
    }

    if let Some(home) = dirs::home_dir() {
        for candidate in ["id_ed25519", "id_rsa", "id_ecdsa"] {
            let path = home.join(".ssh").join(candidate);
            if path.exists() && session.userauth_pubkey_file(user, None, &path, None).is_ok() {
                return Ok(());
            }
        }
    }

    anyhow::bail!("no usable SSH key found in agent or ~/.ssh for user {}", user);
}

fn accept_loop(
    listener: std::net::TcpListener,
    session: ssh2::Session,
    remote_port: u16,
    stop: Arc<AtomicBool>,
) {
    // libssh2 multiplexes every channel over one underlying TCP socket, so
    // concurrent forwarding threads must serialize their calls into the
    // session even though each owns a logically distinct channel. The
    // session is put into non-blocking mode once so a held lock is never
    // blocked on remote I/O.
    session.set_blocking(false);
    let session = Arc::new(std::sync::Mutex::new(session));

    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        let (local_stream, _) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) => {
                gateway_warn("tunnel", &format!("accept failed: {}", e));
                continue;
            }
        };
        if stop.load(Ordering::SeqCst) {
            return;
        }

        let session = session.clone();
        std::thread::spawn(move || forward(local_stream, session, remote_port));
    }
}

/// Bridges one accepted local connection and its SSH channel. The session is
/// shared with every other forwarded connection on this tunnel, so each read
/// or write acquires `session_lock` only for the duration of that one
/// non-blocking call.
fn forward(mut local: std::net::TcpStream, session_lock: Arc<std::sync::Mutex<ssh2::Session>>, remote_port: u16) {
    if local.set_nonblocking(true).is_err() {
        return;
    }

    let mut channel = {
        let session = session_lock.lock().unwrap();
        match open_channel_nonblocking(&session, remote_port) {
            Ok(c) => c,
            Err(e) => {
                gateway_warn("tunnel", &format!("failed to open direct-tcpip channel: {}", e));
                return;
            }
        }
    };

    let mut buf = [0u8; 16 * 1024];
    loop {
        let mut made_progress = false;

        match local.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                made_progress = true;
                let mut sent = 0;
                loop {
                    let session = session_lock.lock().unwrap();
                    match channel.write(&buf[sent..n]) {
                        Ok(0) if sent < n => {}
                        Ok(w) => sent += w,
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                        Err(_) => return,
                    }
                    drop(session);
                    if sent >= n {
                        break;
                    }
                    std::thread::sleep(std::time::Duration::from_millis(2));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(_) => break,
        }

        {
            let _session = session_lock.lock().unwrap();
            match channel.read(&mut buf) {
                Ok(0) => {
                    if channel.eof() {
                        break;
                    }
                }
                Ok(n) => {
                    made_progress = true;
                    if local.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => break,
            }
            if channel.eof() {
                break;
            }
        }

        if !made_progress {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
    }

    let _ = channel.close();
}

fn open_channel_nonblocking(session: &ssh2::Session, remote_port: u16) -> Result<ssh2::Channel> {
    loop {
        match session.channel_direct_tcpip("127.0.0.1", remote_port as u32, None) {
            Ok(channel) => return Ok(channel),
            Err(e) if e.code() == ssh2::ErrorCode::Session(-37) => {
                // LIBSSH2_ERROR_EAGAIN: retry the open once I/O is ready.
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authenticate_requires_nonexistent_key_to_fail() {
        // Exercises the "explicit key path that doesn't exist" branch without
        // needing a live SSH server: ssh2 will fail to read the key file.
        let session = ssh2::Session::new().unwrap();
        let missing = PathBuf::from("/nonexistent/id_rsa_for_tests");
        let result = authenticate(&session, "deploy", Some(missing.as_path()));
        assert!(result.is_err());
    }

    #[test]
    fn ssh_target_without_at_sign_is_rejected() {
        let result = handshake("no-at-sign-host", 22, None);
        assert!(result.is_err());
    }
}
