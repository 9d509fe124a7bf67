//! Per-connection idempotency cache (`spec.md` §3 `IdempotencyEntry`, §4.8).
//!
//! A `requestId` sent twice with the same payload returns the first result
//! without re-executing the handler; sent twice with a different payload it
//! fails with `RequestIdConflict`. The cache lives for the lifetime of one
//! WebSocket connection; a new connection starts with an empty cache
//! (`spec.md` §5, §9 Open Question 2).

use std::collections::HashMap;

use sha2::{Digest, Sha256};
use tokio::sync::{watch, Mutex};

use crate::error::{GatewayError, GatewayResult};
use crate::model::{RpcRequest, RpcResponse};

enum Slot {
    InFlight(watch::Receiver<Option<RpcResponse>>),
    Done(RpcResponse),
}

struct Entry {
    fingerprint: String,
    slot: Slot,
}

/// What the dispatcher should do with a given `(requestId, request)` pair.
pub enum Lookup {
    /// No prior record; caller must run the handler and call `complete`.
    Fresh(watch::Sender<Option<RpcResponse>>),
    /// Already finished; replay this response verbatim.
    Cached(RpcResponse),
    /// Someone else is running the same request right now; the receiver
    /// resolves once they finish.
    Await(watch::Receiver<Option<RpcResponse>>),
    /// Same id, different payload.
    Conflict,
}

#[derive(Default)]
pub struct IdempotencyCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl IdempotencyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fingerprints everything in `req` except `requestId` so that retries of
    /// the exact same call dedupe, but a reused id with different arguments
    /// is caught (`spec.md` §4.8).
    pub fn fingerprint(req: &RpcRequest) -> String {
        let mut value = serde_json::to_value(req).unwrap_or(serde_json::Value::Null);
        if let Some(obj) = value.as_object_mut() {
            obj.remove("requestId");
        }
        let canonical = serde_json::to_string(&value).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub async fn begin(&self, request_id: &str, fingerprint: &str) -> Lookup {
        let mut entries = self.entries.lock().await;
        match entries.get(request_id) {
            None => {
                let (tx, rx) = watch::channel(None);
                entries.insert(
                    request_id.to_string(),
                    Entry {
                        fingerprint: fingerprint.to_string(),
                        slot: Slot::InFlight(rx),
                    },
                );
                Lookup::Fresh(tx)
            }
            Some(entry) if entry.fingerprint != fingerprint => Lookup::Conflict,
            Some(Entry { slot: Slot::Done(resp), .. }) => Lookup::Cached(resp.clone()),
            Some(Entry { slot: Slot::InFlight(rx), .. }) => Lookup::Await(rx.clone()),
        }
    }

    /// Waits for the in-flight owner to finish and returns its response.
    pub async fn join(mut rx: watch::Receiver<Option<RpcResponse>>) -> GatewayResult<RpcResponse> {
        loop {
            if let Some(resp) = rx.borrow().clone() {
                return Ok(resp);
            }
            if rx.changed().await.is_err() {
                return Err(GatewayError::Other("idempotency owner dropped before completing".into()));
            }
        }
    }

    /// Records the final result and wakes up anyone waiting on it.
    pub async fn complete(&self, request_id: &str, tx: watch::Sender<Option<RpcResponse>>, resp: RpcResponse) {
        let _ = tx.send(Some(resp.clone()));
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(request_id) {
            entry.slot = Slot::Done(resp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec(id: &str, cmd: &str) -> RpcRequest {
        RpcRequest::Exec {
            request_id: id.into(),
            command: cmd.into(),
            working_dir: None,
            timeout: None,
        }
    }

    #[test]
    fn fingerprint_ignores_request_id() {
        let a = IdempotencyCache::fingerprint(&exec("a", "echo hi"));
        let b = IdempotencyCache::fingerprint(&exec("b", "echo hi"));
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_differs_on_payload() {
        let a = IdempotencyCache::fingerprint(&exec("a", "echo hi"));
        let b = IdempotencyCache::fingerprint(&exec("a", "echo bye"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn fresh_then_conflict_on_different_payload() {
        let cache = IdempotencyCache::new();
        let fp1 = IdempotencyCache::fingerprint(&exec("r1", "echo hi"));
        let fp2 = IdempotencyCache::fingerprint(&exec("r1", "echo bye"));

        match cache.begin("r1", &fp1).await {
            Lookup::Fresh(_) => {}
            _ => panic!("expected Fresh"),
        }
        assert!(matches!(cache.begin("r1", &fp2).await, Lookup::Conflict));
    }

    #[tokio::test]
    async fn replay_returns_cached_response_without_rerunning() {
        let cache = IdempotencyCache::new();
        let fp = IdempotencyCache::fingerprint(&exec("r1", "echo hi"));

        let tx = match cache.begin("r1", &fp).await {
            Lookup::Fresh(tx) => tx,
            _ => panic!("expected Fresh"),
        };
        let resp = RpcResponse::Result {
            request_id: "r1".into(),
            success: true,
            output: Some("hi\n".into()),
            content: None,
            entries: None,
            bytes: None,
            identical: None,
            diff: None,
            error: None,
            exit_code: Some(0),
        };
        cache.complete("r1", tx, resp.clone()).await;

        match cache.begin("r1", &fp).await {
            Lookup::Cached(cached) => assert_eq!(cached.request_id(), Some("r1")),
            _ => panic!("expected Cached"),
        }
    }

    #[tokio::test]
    async fn concurrent_callers_await_the_same_result() {
        let cache = IdempotencyCache::new();
        let fp = IdempotencyCache::fingerprint(&exec("r1", "echo hi"));

        let tx = match cache.begin("r1", &fp).await {
            Lookup::Fresh(tx) => tx,
            _ => panic!("expected Fresh"),
        };
        let rx = match cache.begin("r1", &fp).await {
            Lookup::Await(rx) => rx,
            _ => panic!("expected Await"),
        };

        let resp = RpcResponse::Result {
            request_id: "r1".into(),
            success: true,
            output: Some("hi\n".into()),
            content: None,
            entries: None,
            bytes: None,
            identical: None,
            diff: None,
            error: None,
            exit_code: Some(0),
        };
        cache.complete("r1", tx, resp.clone()).await;

        let joined = IdempotencyCache::join(rx).await.unwrap();
        assert_eq!(joined.request_id(), Some("r1"));
    }
}
