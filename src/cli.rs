//! The gateway's command-line surface, built on `#[derive(Parser)]` and
//! `#[command(version)]`, with subcommands since the gateway exposes a
//! handful of independent operations rather than one top-level workflow. The
//! hidden `--remote-agent` flag is this binary's internal dispatch mode: one
//! compiled binary, two run modes selected by a flag the launcher sets.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "hostbridge")]
#[command(about = "Remote host execution gateway: SSH-tunneled shell and file RPCs")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Internal: re-exec this binary as the on-host remote agent. Set by
    /// the launcher script generated in `bootstrap.rs`, never by a user.
    #[arg(long, hide = true)]
    pub remote_agent: bool,

    #[arg(long, hide = true)]
    pub port: Option<u16>,

    #[arg(long, hide = true)]
    pub token: Option<String>,

    #[arg(long, hide = true)]
    pub no_tmux: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Register a host in the registry without connecting to it.
    AddHost {
        name: String,
        /// `user@host`
        ssh_target: String,
        #[arg(long)]
        ssh_port: Option<u16>,
        #[arg(long)]
        ssh_key: Option<PathBuf>,
        #[arg(long)]
        remote_port: Option<u16>,
        #[arg(long)]
        auth_token: Option<String>,
        #[arg(long)]
        workspace: Option<String>,
    },
    /// Tear down (if connected) and remove a host from the registry.
    RemoveHost { name: String },
    /// Explicitly connect to a registered host.
    Connect { name: String },
    /// Tear down a host's live session.
    Disconnect { name: String },
    /// List every registered host and its live connection state.
    ListHosts,
    /// Run a command, optionally on a remote host.
    Exec {
        #[arg(long)]
        host: Option<String>,
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
        #[arg(long)]
        working_dir: Option<String>,
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Read a file, optionally on a remote host.
    ReadFile {
        #[arg(long)]
        host: Option<String>,
        path: String,
    },
    /// Write a file, optionally on a remote host.
    WriteFile {
        #[arg(long)]
        host: Option<String>,
        path: String,
        content: String,
    },
    /// Edit a file by unique-match substitution, optionally on a remote host.
    EditFile {
        #[arg(long)]
        host: Option<String>,
        path: String,
        old_text: String,
        new_text: String,
    },
    /// List a directory, optionally on a remote host.
    ListDir {
        #[arg(long)]
        host: Option<String>,
        path: String,
    },
    /// Compare a file's on-host content against given content, optionally on
    /// a remote host.
    CompareFile {
        #[arg(long)]
        host: Option<String>,
        path: String,
        content: String,
    },
}
