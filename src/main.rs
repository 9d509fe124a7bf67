mod agent;
mod backend;
mod bootstrap;
mod cli;
mod config;
mod error;
mod host_manager;
mod logging;
mod model;
mod paths;
mod registry;
mod remote_host;
mod tunnel;
mod wire;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use crate::backend::ExecutionBackendRouter;
use crate::cli::{Cli, Command};
use crate::host_manager::HostManager;
use crate::logging::{agent_log, gateway_error, gateway_log};
use crate::model::HostConfig;
use crate::registry::HostRegistry;

/// The commit this binary was built from, baked in by `build.rs`. Logged at
/// startup on both sides of a connection; the remote agent is this same
/// binary re-exec'd, so a build mismatch between gateway and agent shows up
/// immediately in `remote_server.log`, the same "record what's running"
/// purpose the teacher's `git_sha` fields serve for connected containers.
pub const BUILD_SHA: &str = env!("HOSTBRIDGE_GIT_SHA");

fn main() -> Result<()> {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    if cli.remote_agent {
        return run_remote_agent(&cli).await;
    }

    let Some(command) = cli.command else {
        eprintln!("no subcommand given; run with --help for usage");
        std::process::exit(2);
    };

    gateway_log("main", &format!("hostbridge {} starting", BUILD_SHA));
    let registry = HostRegistry::load().context("failed to load host registry")?;
    let manager = Arc::new(HostManager::new(registry));
    let router = ExecutionBackendRouter::new(manager.clone());

    let result = run_command(command, manager, router).await;
    if let Err(e) = &result {
        gateway_error("main", &format!("{:#}", e));
    }
    result
}

/// This binary is staged onto the remote host by `bootstrap.rs` and
/// re-exec'd with `--remote-agent --port <P> [--token <T>] [--no-tmux]`.
async fn run_remote_agent(cli: &Cli) -> Result<()> {
    let port = cli.port.context("--remote-agent requires --port")?;
    let session_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."));

    agent_log(&session_dir, "main", &format!("remote agent {} starting on port {}", BUILD_SHA, port));

    agent::server::run(agent::server::AgentOptions {
        port,
        auth_token: cli.token.clone(),
        enable_tmux: !cli.no_tmux,
        session_dir,
    })
    .await
}

async fn run_command(command: Command, manager: Arc<HostManager>, router: ExecutionBackendRouter) -> Result<()> {
    match command {
        Command::AddHost { name, ssh_target, ssh_port, ssh_key, remote_port, auth_token, workspace } => {
            let mut config = HostConfig::new(name.clone(), ssh_target);
            if let Some(p) = ssh_port {
                config.ssh_port = p;
            }
            config.ssh_key_path = ssh_key;
            if let Some(p) = remote_port {
                config.remote_port = p;
            }
            config.auth_token = auth_token;
            config.workspace = workspace;

            manager.add_host(config).await.context("failed to add host")?;
            println!("added host '{}'", name);
            Ok(())
        }

        Command::RemoveHost { name } => {
            manager.remove_host(&name).await.context("failed to remove host")?;
            println!("removed host '{}'", name);
            Ok(())
        }

        Command::Connect { name } => {
            let outcome = manager.connect(&name).await.context("connect failed")?;
            match outcome {
                host_manager::ConnectOutcome::AlreadyConnected => println!("'{}' is already connected", name),
                host_manager::ConnectOutcome::Resumed => println!("resumed existing session on '{}'", name),
                host_manager::ConnectOutcome::Deployed => println!("connected to '{}' (new session)", name),
            }
            Ok(())
        }

        Command::Disconnect { name } => {
            manager.disconnect(&name).await.context("disconnect failed")?;
            println!("disconnected '{}'", name);
            Ok(())
        }

        Command::ListHosts => {
            let entries = manager.list().await;
            if entries.is_empty() {
                println!("no hosts registered");
                return Ok(());
            }
            println!("{:<20} {:<28} {:<12} {}", "NAME", "SSH TARGET", "CONNECTED", "NOTE");
            for entry in entries {
                let note = if entry.stale { "stale session on disk" } else { "" };
                println!(
                    "{:<20} {:<28} {:<12} {}",
                    entry.config.name,
                    entry.config.ssh_target,
                    entry.connected,
                    note
                );
            }
            Ok(())
        }

        Command::Exec { host, command, working_dir, timeout } => {
            let backend = router.resolve(host.as_deref()).await?;
            let command = command.join(" ");
            let result = backend
                .exec(&command, working_dir.as_deref(), timeout.map(Duration::from_secs))
                .await?;
            print!("{}", result.output);
            if let Some(err) = &result.error {
                eprintln!("error: {}", err);
            }
            if !result.success {
                std::process::exit(result.exit_code.unwrap_or(1));
            }
            Ok(())
        }

        Command::ReadFile { host, path } => {
            let backend = router.resolve(host.as_deref()).await?;
            let content = backend.read_file(&path).await?;
            print!("{}", content);
            Ok(())
        }

        Command::WriteFile { host, path, content } => {
            let backend = router.resolve(host.as_deref()).await?;
            let result = backend.write_file(&path, &content).await?;
            println!("wrote {} bytes to {}", result.bytes, path);
            Ok(())
        }

        Command::EditFile { host, path, old_text, new_text } => {
            let backend = router.resolve(host.as_deref()).await?;
            backend.edit_file(&path, &old_text, &new_text).await?;
            println!("edited {}", path);
            Ok(())
        }

        Command::ListDir { host, path } => {
            let backend = router.resolve(host.as_deref()).await?;
            let entries = backend.list_dir(&path).await?;
            for entry in entries {
                println!("{:<8} {:>10}  {}", format!("{:?}", entry.entry_type).to_lowercase(), entry.size, entry.name);
            }
            Ok(())
        }

        Command::CompareFile { host, path, content } => {
            let backend = router.resolve(host.as_deref()).await?;
            let result = backend.compare_file(&path, &content).await?;
            if result.identical {
                println!("identical");
            } else {
                print!("{}", result.diff.unwrap_or_default());
            }
            Ok(())
        }
    }
}
