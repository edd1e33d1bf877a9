// crates/keygate-server/src/proxy/mod.rs
// Subprocess bridge: owns the MCP helper child and its stdio protocol

pub mod dispatch;
pub mod registry;

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};
use crate::proxy::registry::ToolRegistry;
use crate::secrets::resolver::ChildToolCaller;

/// MCP protocol version sent in the initialize handshake.
const PROTOCOL_VERSION: &str = "2024-11-05";

/// Per-subscriber notification buffer. A subscriber whose buffer is full
/// misses messages rather than stalling the reader.
const SUBSCRIBER_CAPACITY: usize = 64;

/// Buffered child responses. Only one RPC is ever outstanding, so this only
/// absorbs unsolicited responses from a misbehaving child.
const RESPONSE_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    NotStarted,
    Starting,
    Running,
    Stopped,
}

/// The write half plus the response stream, locked together: holding the
/// lock across write-then-receive is what enforces strict request/response
/// pairing on the line-delimited pipe.
struct RpcChannel {
    stdin: ChildStdin,
    responses: mpsc::Receiver<Value>,
}

/// Bridge to the MCP helper subprocess.
///
/// Exactly one reader task consumes child stdout: lines carrying an `id` are
/// responses, everything else is a notification fanned out to subscribers.
/// Callers serialize through one async mutex, so at most one request is ever
/// in flight to the child. The child is never restarted here; the
/// operational layer restarts the whole process instead.
pub struct McpProxy {
    registry: Arc<ToolRegistry>,
    state: StdMutex<ProxyState>,
    rpc_channel: Mutex<Option<RpcChannel>>,
    subscribers: StdMutex<HashMap<u64, mpsc::Sender<Value>>>,
    next_subscriber: AtomicU64,
    next_request_id: AtomicI64,
    child: StdMutex<Option<Child>>,
}

impl McpProxy {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            state: StdMutex::new(ProxyState::NotStarted),
            rpc_channel: Mutex::new(None),
            subscribers: StdMutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
            next_request_id: AtomicI64::new(1),
            child: StdMutex::new(None),
        }
    }

    pub fn state(&self) -> ProxyState {
        *lock(&self.state)
    }

    pub fn is_running(&self) -> bool {
        self.state() == ProxyState::Running
    }

    /// Spawn the helper binary, install the stdio pump, and perform the MCP
    /// initialize handshake. A failed handshake is logged but leaves the
    /// proxy usable for gateway-only tools; a failed spawn is an error the
    /// caller should treat as fatal.
    pub async fn start(self: &Arc<Self>, binary: &str) -> Result<()> {
        *lock(&self.state) = ProxyState::Starting;
        info!(binary = %binary, "Starting MCP helper subprocess");

        let mut child = Command::new(binary)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| GatewayError::Subprocess(format!("failed to spawn {binary}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| GatewayError::Subprocess("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::Subprocess("child stdout unavailable".into()))?;

        let (response_tx, response_rx) = mpsc::channel(RESPONSE_CAPACITY);
        let proxy = self.clone();
        tokio::spawn(async move {
            proxy.read_loop(stdout, response_tx).await;
        });

        *self.rpc_channel.lock().await = Some(RpcChannel {
            stdin,
            responses: response_rx,
        });
        *lock(&self.child) = Some(child);
        *lock(&self.state) = ProxyState::Running;

        match tokio::time::timeout(Duration::from_secs(10), self.initialize()).await {
            Ok(Ok(())) => info!("MCP helper initialized"),
            Ok(Err(e)) => warn!(error = %e, "MCP initialize handshake failed, serving gateway tools only"),
            Err(_) => warn!("MCP initialize handshake timed out, serving gateway tools only"),
        }
        Ok(())
    }

    /// The single reader: classify every stdout line and route it.
    async fn read_loop(
        self: Arc<Self>,
        stdout: tokio::process::ChildStdout,
        response_tx: mpsc::Sender<Value>,
    ) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let msg: Value = match serde_json::from_str(line) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(error = %e, "Discarding non-JSON line from child");
                            continue;
                        }
                    };
                    debug!(
                        id = %msg.get("id").unwrap_or(&serde_json::Value::Null),
                        method = msg.get("method").and_then(serde_json::Value::as_str).unwrap_or(""),
                        "Child message"
                    );
                    if msg.get("id").is_some() {
                        // Response: deliver to the single blocked caller.
                        if response_tx.send(msg).await.is_err() {
                            return;
                        }
                    } else {
                        broadcast(&self.subscribers, msg);
                    }
                }
                Ok(None) => {
                    info!("Child stdout closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Child read error");
                    break;
                }
            }
        }
        // Dropping response_tx closes the channel; in-flight and future
        // RPCs fail fast with "subprocess closed".
        *lock(&self.state) = ProxyState::Stopped;
    }

    async fn initialize(&self) -> Result<()> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": self.next_id(),
            "method": "initialize",
            "params": {
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "keygate",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            },
        });
        let response = self.rpc(&request).await?;
        if response.get("error").is_some() {
            return Err(GatewayError::Subprocess(format!(
                "initialize rejected: {}",
                response["error"]
            )));
        }
        self.notify(&json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await
    }

    /// One serialized request/response exchange with the child. The channel
    /// lock is intentionally held across the write and the receive.
    pub async fn rpc(&self, request: &Value) -> Result<Value> {
        let mut guard = self.rpc_channel.lock().await;
        let channel = guard
            .as_mut()
            .ok_or_else(|| GatewayError::Subprocess("subprocess closed".into()))?;

        let mut line = serde_json::to_vec(request)?;
        line.push(b'\n');
        channel
            .stdin
            .write_all(&line)
            .await
            .map_err(|e| GatewayError::Subprocess(format!("child write failed: {e}")))?;
        channel
            .stdin
            .flush()
            .await
            .map_err(|e| GatewayError::Subprocess(format!("child flush failed: {e}")))?;

        match channel.responses.recv().await {
            Some(response) => Ok(response),
            None => {
                *guard = None;
                Err(GatewayError::Subprocess("subprocess closed".into()))
            }
        }
    }

    /// Fire-and-forget notification to the child (no response expected).
    pub async fn notify(&self, notification: &Value) -> Result<()> {
        let mut guard = self.rpc_channel.lock().await;
        let channel = guard
            .as_mut()
            .ok_or_else(|| GatewayError::Subprocess("subprocess closed".into()))?;
        let mut line = serde_json::to_vec(notification)?;
        line.push(b'\n');
        channel
            .stdin
            .write_all(&line)
            .await
            .map_err(|e| GatewayError::Subprocess(format!("child write failed: {e}")))?;
        channel
            .stdin
            .flush()
            .await
            .map_err(|e| GatewayError::Subprocess(format!("child flush failed: {e}")))
    }

    /// Forward a request to the child, intercepting `tools/list` results to
    /// append the gateway-native tools.
    pub async fn forward(&self, request: &Value) -> Result<Value> {
        let response = self.rpc(request).await?;
        Ok(self.registry.inject(response))
    }

    /// Register an SSE subscriber for child notifications.
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<Value>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        lock(&self.subscribers).insert(id, tx);
        debug!(subscriber = id, "SSE subscriber registered");
        (id, rx)
    }

    /// Unregister a subscriber; dropping its sender ends the stream.
    pub fn unsubscribe(&self, id: u64) {
        lock(&self.subscribers).remove(&id);
        debug!(subscriber = id, "SSE subscriber unregistered");
    }

    /// Close child stdin, then terminate the child.
    pub async fn stop(&self) {
        *self.rpc_channel.lock().await = None;
        let child = lock(&self.child).take();
        if let Some(mut child) = child {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        *lock(&self.state) = ProxyState::Stopped;
        info!("MCP helper subprocess stopped");
    }

    pub fn next_id(&self) -> i64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Non-blocking fanout: a full subscriber drops the message.
fn broadcast(subscribers: &StdMutex<HashMap<u64, mpsc::Sender<Value>>>, msg: Value) {
    let subs = lock(subscribers);
    for (id, tx) in subs.iter() {
        if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(msg.clone()) {
            debug!(subscriber = *id, "Subscriber full, dropping notification");
        }
    }
}

#[async_trait]
impl ChildToolCaller for McpProxy {
    /// Call one child tool and flatten its text content, the contract the
    /// resolver's sops/kdbx sources consume.
    async fn call_tool(&self, name: &str, args: Value) -> std::result::Result<String, String> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": self.next_id(),
            "method": "tools/call",
            "params": {"name": name, "arguments": args},
        });
        let response = self.rpc(&request).await.map_err(|e| e.to_string())?;
        if let Some(error) = response.get("error") {
            return Err(error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("tool call failed")
                .to_string());
        }
        Ok(extract_text(&response["result"]))
    }
}

/// Join the text parts of an MCP tool result.
pub fn extract_text(result: &Value) -> String {
    result
        .get("content")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy() -> Arc<McpProxy> {
        Arc::new(McpProxy::new(Arc::new(ToolRegistry::new())))
    }

    #[test]
    fn test_extract_text() {
        let result = json!({
            "content": [
                {"type": "text", "text": "one"},
                {"type": "image", "data": "ignored"},
                {"type": "text", "text": "two"},
            ]
        });
        assert_eq!(extract_text(&result), "one\ntwo");
        assert_eq!(extract_text(&json!({})), "");
    }

    #[tokio::test]
    async fn test_rpc_before_start_fails_fast() {
        let p = proxy();
        let err = p.rpc(&json!({"id": 1})).await.unwrap_err();
        assert!(err.to_string().contains("subprocess closed"));
        assert_eq!(p.state(), ProxyState::NotStarted);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rpc_round_trip_through_cat() {
        // `cat` echoes each request line back; the echo carries the id and
        // is classified as the response.
        let p = proxy();
        p.start("cat").await.unwrap();
        assert!(p.is_running());

        let request = json!({"jsonrpc": "2.0", "id": 42, "method": "ping"});
        let response = p.rpc(&request).await.unwrap();
        assert_eq!(response["id"], 42);
        assert_eq!(response["method"], "ping");

        p.stop().await;
        assert_eq!(p.state(), ProxyState::Stopped);
        assert!(p.rpc(&request).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_serialized_rpc_under_concurrency() {
        let p = proxy();
        p.start("cat").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..10u64 {
            let p = p.clone();
            handles.push(tokio::spawn(async move {
                let req = json!({"jsonrpc": "2.0", "id": i, "method": "ping"});
                let resp = p.rpc(&req).await.unwrap();
                // The mutex pairs each write with the very next response
                // line, so every caller sees its own id echoed back.
                assert_eq!(resp["id"], json!(i));
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        p.stop().await;
    }

    #[tokio::test]
    async fn test_notifications_broadcast_to_subscribers() {
        let p = proxy();
        let (id, mut rx) = p.subscribe();

        broadcast(
            &p.subscribers,
            json!({"jsonrpc": "2.0", "method": "notifications/progress"}),
        );
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg["method"], "notifications/progress");

        p.unsubscribe(id);
        broadcast(&p.subscribers, json!({"method": "x"}));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_full_subscriber_drops_messages() {
        let p = proxy();
        let (_id, mut rx) = p.subscribe();
        for i in 0..(SUBSCRIBER_CAPACITY + 10) {
            broadcast(&p.subscribers, json!({"seq": i}));
        }
        // The first CAPACITY messages survive; the overflow was dropped.
        let mut received = 0;
        while let Ok(msg) = rx.try_recv() {
            assert!(msg["seq"].as_u64().unwrap() < SUBSCRIBER_CAPACITY as u64);
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_CAPACITY);
    }
}
