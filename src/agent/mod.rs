//! The on-host remote agent (`spec.md` §4.8–§4.9): the process this binary
//! re-execs itself as on the remote host via `--remote-agent`.

pub mod dispatch;
pub mod executor;
pub mod files;
pub mod idempotency;
pub mod server;
