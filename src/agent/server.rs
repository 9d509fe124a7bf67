//! §4.8 RemoteAgent transport: a loopback WebSocket server accepting one
//! client at a time.
//!
//! Built directly on `tokio_tungstenite::accept_async` over a plain
//! `TcpListener`, matching "a small... remote agent" - there is a single
//! upgrade endpoint here, so pulling in an HTTP framework (as
//! `localplatform-backup-server`'s agent does with axum) would be structure
//! without a reason.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::Message;

use crate::agent::dispatch::Dispatcher;
use crate::agent::executor::SessionExecutor;
use crate::logging::agent_log;
use crate::model::{AuthFrame, RpcRequest, RpcResponse};

pub struct AgentOptions {
    pub port: u16,
    pub auth_token: Option<String>,
    pub enable_tmux: bool,
    pub session_dir: PathBuf,
}

/// Runs the remote agent until a `shutdown` RPC is received on some
/// connection, or the process is killed externally.
pub async fn run(opts: AgentOptions) -> Result<()> {
    let executor = Arc::new(SessionExecutor::new(opts.enable_tmux, opts.session_dir.clone()));
    let listener = TcpListener::bind(("127.0.0.1", opts.port))
        .await
        .with_context(|| format!("failed to bind 127.0.0.1:{}", opts.port))?;

    let busy = Arc::new(AtomicBool::new(false));
    let shutdown = Arc::new(Notify::new());
    let auth_token = Arc::new(opts.auth_token);
    let session_dir = opts.session_dir.clone();

    agent_log(&session_dir, "server", &format!("listening on 127.0.0.1:{}", opts.port));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("accept failed")?;

                if busy.swap(true, Ordering::SeqCst) {
                    agent_log(&session_dir, "server", &format!("refusing extra connection from {}", peer));
                    drop(stream);
                    continue;
                }

                let executor = executor.clone();
                let busy = busy.clone();
                let shutdown = shutdown.clone();
                let auth_token = auth_token.clone();
                let session_dir = session_dir.clone();

                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, executor, auth_token.as_deref(), shutdown, session_dir.clone()).await {
                        agent_log(&session_dir, "server", &format!("connection from {} ended: {}", peer, e));
                    }
                    busy.store(false, Ordering::SeqCst);
                });
            }
            _ = shutdown.notified() => {
                agent_log(&session_dir, "server", "shutdown requested, exiting");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    executor: Arc<SessionExecutor>,
    auth_token: Option<&str>,
    shutdown: Arc<Notify>,
    session_dir: PathBuf,
) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(stream).await.context("WebSocket upgrade failed")?;
    let (mut sink, mut source) = ws.split();

    let auth_frame = match source.next().await {
        Some(Ok(Message::Text(text))) => serde_json::from_str::<AuthFrame>(&text).context("malformed auth frame")?,
        _ => {
            let _ = sink.send(close_unauthorized("missing auth frame")).await;
            return Ok(());
        }
    };

    if auth_token.is_some() && auth_frame.token.as_deref() != auth_token {
        agent_log(&session_dir, "server", "rejecting connection: token mismatch");
        let _ = sink.send(close_unauthorized("token mismatch")).await;
        return Ok(());
    }

    let authed = serde_json::to_string(&RpcResponse::Authenticated)?;
    sink.send(Message::Text(authed.into())).await.context("failed to send authenticated reply")?;

    let dispatcher = Dispatcher::new(executor.clone(), session_dir.clone());

    while let Some(msg) = source.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                agent_log(&session_dir, "server", &format!("read error: {}", e));
                break;
            }
        };

        let text = match msg {
            Message::Text(t) => t.to_string(),
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => continue,
        };

        let req: RpcRequest = match serde_json::from_str(&text) {
            Ok(r) => r,
            Err(e) => {
                let err = RpcResponse::Error {
                    request_id: None,
                    code: "ProtocolError".to_string(),
                    message: format!("malformed frame: {}", e),
                };
                let _ = sink.send(Message::Text(serde_json::to_string(&err)?.into())).await;
                continue;
            }
        };

        let is_close = matches!(req, RpcRequest::Close);
        let is_shutdown = matches!(req, RpcRequest::Shutdown);

        let resp = dispatcher.handle(req).await;
        let json = serde_json::to_string(&resp)?;
        sink.send(Message::Text(json.into())).await.context("failed to write response frame")?;

        if is_close {
            break;
        }
        if is_shutdown {
            shutdown.notify_one();
            break;
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    Ok(())
}

fn close_unauthorized(reason: &str) -> Message {
    Message::Close(Some(tokio_tungstenite::tungstenite::protocol::CloseFrame {
        code: tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::Policy,
        reason: reason.to_string().into(),
    }))
}
