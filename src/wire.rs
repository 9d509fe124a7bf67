//! `WireClient`: frames RPC requests over a WebSocket opened through the SSH
//! tunnel, correlates responses by `requestId`, and enforces per-call
//! deadlines.
//!
//! Built on `tokio-tungstenite`, the same crate `backup-agent/src/ws/client.rs`
//! uses for its own reverse-WebSocket client loop. Request/response
//! correlation uses a `HashMap<String, oneshot::Sender<RpcResponse>>` behind a
//! `tokio::sync::Mutex` - the same "shared map behind a mutex" shape used for
//! the in-memory registries elsewhere in this crate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config;
use crate::logging::{gateway_log, gateway_warn};
use crate::model::{AuthFrame, RpcRequest, RpcResponse};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

struct Pending {
    waiters: Mutex<HashMap<String, oneshot::Sender<RpcResponse>>>,
}

/// One authenticated WebSocket connection to a remote agent.
pub struct WireClient {
    sink: Mutex<WsSink>,
    pending: Arc<Pending>,
    _reader: tokio::task::JoinHandle<()>,
}

impl WireClient {
    /// Connects to `ws://127.0.0.1:<local_port>` (the tunnel's local end),
    /// sends the auth frame, and waits for `authenticated` or a close.
    pub async fn connect(local_port: u16, auth_token: Option<&str>) -> Result<Self> {
        let url = format!("ws://127.0.0.1:{}", local_port);
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .context("failed to open WebSocket to remote agent")?;
        let (mut sink, mut source) = ws_stream.split();

        let auth = AuthFrame {
            token: auth_token.map(|s| s.to_string()),
        };
        let auth_json = serde_json::to_string(&auth)?;
        sink.send(Message::Text(auth_json.into()))
            .await
            .context("failed to send auth frame")?;

        let auth_reply = tokio::time::timeout(Duration::from_secs(10), source.next())
            .await
            .context("timed out waiting for authentication reply")?
            .context("connection closed before authentication")?
            .context("WebSocket error while authenticating")?;

        match auth_reply {
            Message::Text(text) => {
                let resp: RpcResponse = serde_json::from_str(&text).context("malformed auth reply")?;
                match resp {
                    RpcResponse::Authenticated => {}
                    RpcResponse::Error { code, message, .. } => {
                        anyhow::bail!("Unauthorized: {} ({})", message, code);
                    }
                    other => anyhow::bail!("unexpected reply to auth frame: {:?}", other),
                }
            }
            Message::Close(frame) => {
                anyhow::bail!("Unauthorized: server closed connection during auth: {:?}", frame);
            }
            other => anyhow::bail!("unexpected auth reply frame type: {:?}", other),
        }

        let pending = Arc::new(Pending {
            waiters: Mutex::new(HashMap::new()),
        });
        let reader = tokio::spawn(read_loop(source, pending.clone()));

        gateway_log("wire", &format!("authenticated on ws://127.0.0.1:{}", local_port));

        Ok(Self {
            sink: Mutex::new(sink),
            pending,
            _reader: reader,
        })
    }

    /// Sends `req` and waits for its correlated response, bounded by
    /// `deadline` (defaults to `config::default_rpc_timeout_secs()`).
    ///
    /// Expiry fails with a timeout error and stops waiting locally, but does
    /// **not** close the underlying connection.
    pub async fn call(&self, req: RpcRequest, deadline: Option<Duration>) -> Result<RpcResponse> {
        let deadline = deadline.unwrap_or_else(|| Duration::from_secs(config::default_rpc_timeout_secs()));

        if let Some(request_id) = req.request_id() {
            let (tx, rx) = oneshot::channel();
            {
                let mut waiters = self.pending.waiters.lock().await;
                waiters.insert(request_id.to_string(), tx);
            }

            if let Err(e) = self.send(&req).await {
                let mut waiters = self.pending.waiters.lock().await;
                waiters.remove(request_id);
                return Err(e);
            }

            match tokio::time::timeout(deadline, rx).await {
                Ok(Ok(resp)) => Ok(resp),
                Ok(Err(_)) => anyhow::bail!("connection closed while awaiting response to {}", request_id),
                Err(_) => {
                    let mut waiters = self.pending.waiters.lock().await;
                    waiters.remove(request_id);
                    anyhow::bail!("Timeout: no response to request {} within {:?}", request_id, deadline)
                }
            }
        } else {
            // ping/close/shutdown carry no requestId; these are handled with
            // type-tagged, not id-correlated, replies.
            self.send(&req).await?;
            self.await_untyped(&req, deadline).await
        }
    }

    async fn send(&self, req: &RpcRequest) -> Result<()> {
        let json = serde_json::to_string(req).context("failed to serialize RPC request")?;
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(json.into()))
            .await
            .context("failed to write RPC request to WebSocket")
    }

    /// `ping` -> `pong`, `shutdown` -> `shutdown_ack` (bounded separately by
    /// the caller's deadline), `close` has no reply.
    async fn await_untyped(&self, req: &RpcRequest, deadline: Duration) -> Result<RpcResponse> {
        if matches!(req, RpcRequest::Close) {
            return Ok(RpcResponse::Pong);
        }

        let (tx, rx) = oneshot::channel();
        let key = match req {
            RpcRequest::Ping => "__ping__",
            RpcRequest::Shutdown => "__shutdown__",
            _ => unreachable!("exec/read_file/write_file/edit_file/list_dir all carry a requestId"),
        };
        {
            let mut waiters = self.pending.waiters.lock().await;
            waiters.insert(key.to_string(), tx);
        }
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => anyhow::bail!("connection closed while awaiting {} reply", key),
            Err(_) => {
                let mut waiters = self.pending.waiters.lock().await;
                waiters.remove(key);
                anyhow::bail!("Timeout: no reply for {}", key)
            }
        }
    }

    /// Closes the sink half; the reader task exits once the peer closes too.
    pub async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
    }
}

async fn read_loop(mut source: WsSource, pending: Arc<Pending>) {
    while let Some(msg) = source.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                gateway_warn("wire", &format!("read error: {}", e));
                break;
            }
        };

        let text = match msg {
            Message::Text(t) => t.to_string(),
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => continue,
        };

        let resp: RpcResponse = match serde_json::from_str(&text) {
            Ok(r) => r,
            Err(e) => {
                gateway_warn("wire", &format!("malformed response frame: {} ({})", e, text));
                continue;
            }
        };

        let key = match &resp {
            RpcResponse::Result { request_id, .. } => request_id.clone(),
            RpcResponse::Error { request_id: Some(id), .. } => id.clone(),
            RpcResponse::Pong => "__ping__".to_string(),
            RpcResponse::ShutdownAck => "__shutdown__".to_string(),
            RpcResponse::Authenticated | RpcResponse::Error { request_id: None, .. } => {
                gateway_warn("wire", "unsolicited response with no requestId, ignoring");
                continue;
            }
        };

        let mut waiters = pending.waiters.lock().await;
        if let Some(tx) = waiters.remove(&key) {
            let _ = tx.send(resp);
        } else {
            gateway_warn("wire", &format!("unsolicited response for {}, ignoring", key));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_distinguishes_typed_frames() {
        let req = RpcRequest::Ping;
        assert_eq!(req.request_id(), None);
        let req = RpcRequest::ReadFile {
            request_id: "r1".into(),
            path: "/tmp/x".into(),
        };
        assert_eq!(req.request_id(), Some("r1"));
    }
}
