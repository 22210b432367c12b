//! JSON-RPC transports for tool-server control sessions.
//!
//! Three flavors share one trait:
//!
//! - [`ChildProcessTransport`]: newline-delimited JSON over a child's stdio.
//! - [`WebSocketTransport`]: one message per text frame.
//! - [`HttpTransport`]: one POST per message, JSON or SSE response.
//!
//! Stream transports run a reader task that routes responses to waiting
//! callers by request id; server-initiated traffic is logged and ignored.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};
use crate::tools::manifest::{SocketKind, ToolServerConfig, ToolTransport};

/// A bidirectional JSON-RPC channel to one tool server.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Send a request (which must carry a numeric `id`) and return the
    /// matching response object.
    async fn request(&self, message: Value) -> Result<Value>;

    /// Send a notification; no response is expected.
    async fn notify(&self, message: Value) -> Result<()>;

    /// Release the underlying resources. Must be idempotent.
    async fn close(&self);
}

/// Opens transports for tool-server configurations.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Open a transport for `config`.
    async fn open(&self, config: &ToolServerConfig) -> Result<Arc<dyn RpcTransport>>;
}

/// Connector for the real command, websocket and HTTP transports.
#[derive(Debug, Clone, Default)]
pub struct DefaultConnector {
    http: reqwest::Client,
}

#[async_trait]
impl TransportConnector for DefaultConnector {
    async fn open(&self, config: &ToolServerConfig) -> Result<Arc<dyn RpcTransport>> {
        match &config.transport {
            ToolTransport::Command { command, args } => Ok(Arc::new(
                ChildProcessTransport::spawn(&config.name, command, args, &config.env)?,
            )),
            ToolTransport::Socket {
                kind: SocketKind::WebSocket,
                url,
            } => {
                let url = parse_endpoint(&config.name, url, &["ws", "wss"])?;
                Ok(Arc::new(
                    WebSocketTransport::connect(&config.name, url.as_str()).await?,
                ))
            }
            ToolTransport::Socket {
                kind: SocketKind::Http,
                url,
            } => {
                let url = parse_endpoint(&config.name, url, &["http", "https"])?;
                Ok(Arc::new(HttpTransport::new(self.http.clone(), url.as_str())))
            }
        }
    }
}

/// Parse a socket endpoint and check its scheme.
fn parse_endpoint(name: &str, raw: &str, schemes: &[&str]) -> Result<url::Url> {
    let url = url::Url::parse(raw)
        .map_err(|e| BridgeError::Tool(format!("{name}: invalid url {raw:?}: {e}")))?;
    if !schemes.contains(&url.scheme()) {
        return Err(BridgeError::Tool(format!(
            "{name}: unsupported scheme {:?} (expected {})",
            url.scheme(),
            schemes.join(" or ")
        )));
    }
    Ok(url)
}

// ── Response routing ──────────────────────────────────────────

type Pending = Arc<std::sync::Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

fn request_id(message: &Value) -> Result<u64> {
    message
        .get("id")
        .and_then(Value::as_u64)
        .ok_or_else(|| BridgeError::Tool("JSON-RPC request without numeric id".into()))
}

/// A caller waiting on one request id. Dropping it removes the id from the
/// pending map, so a caller that gives up (timeout, write error) leaves
/// nothing behind.
struct PendingRequest {
    pending: Pending,
    id: u64,
    rx: oneshot::Receiver<Value>,
}

impl PendingRequest {
    async fn response(mut self, server: &str) -> Result<Value> {
        (&mut self.rx)
            .await
            .map_err(|_| BridgeError::Tool(format!("{server}: connection closed before response")))
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        unregister(&self.pending, self.id);
    }
}

fn register(pending: &Pending, id: u64) -> PendingRequest {
    let (tx, rx) = oneshot::channel();
    pending
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .insert(id, tx);
    PendingRequest {
        pending: Arc::clone(pending),
        id,
        rx,
    }
}

fn unregister(pending: &Pending, id: u64) {
    pending
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .remove(&id);
}

/// Hand an inbound message to whoever is waiting for it.
fn route(server: &str, pending: &Pending, raw: &str) {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            debug!(server, error = %e, "ignoring non-JSON line from tool server");
            return;
        }
    };
    let is_response = value.get("result").is_some() || value.get("error").is_some();
    let id = value.get("id").and_then(Value::as_u64);
    match (is_response, id) {
        (true, Some(id)) => {
            let waiter = pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .remove(&id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(value);
                }
                None => debug!(server, id, "response for unknown request id"),
            }
        }
        _ => {
            let method = value.get("method").and_then(Value::as_str).unwrap_or("?");
            debug!(server, method, "ignoring server-initiated message");
        }
    }
}

/// Drop every waiter so blocked callers see the channel close.
fn fail_all(pending: &Pending) {
    pending
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clear();
}

// ── Child process ─────────────────────────────────────────────

/// JSON-RPC over a spawned child's stdin/stdout.
pub struct ChildProcessTransport {
    name: String,
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    pending: Pending,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ChildProcessTransport {
    /// Spawn `command` and start routing its stdout.
    ///
    /// The program is resolved on `PATH` with `which` first so a missing
    /// binary produces a clear error.
    pub fn spawn(
        name: &str,
        command: &str,
        args: &[String],
        env: &std::collections::BTreeMap<String, String>,
    ) -> Result<Self> {
        let program = which::which(command)
            .map_err(|e| BridgeError::Tool(format!("{name}: command {command:?} not found: {e}")))?;

        let mut child = tokio::process::Command::new(&program)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BridgeError::Tool(format!("{name}: spawn failed: {e}")))?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Tool(format!("{name}: child stdout unavailable")))?;

        if let Some(stderr) = child.stderr.take() {
            let server = name.to_owned();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %server, "{line}");
                }
            });
        }

        let pending: Pending = Arc::default();
        let reader = {
            let pending = Arc::clone(&pending);
            let server = name.to_owned();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            let line = line.trim();
                            if !line.is_empty() {
                                route(&server, &pending, line);
                            }
                        }
                        Ok(None) => {
                            debug!(server = %server, "tool server stdout closed");
                            break;
                        }
                        Err(e) => {
                            warn!(server = %server, error = %e, "tool server stdout read failed");
                            break;
                        }
                    }
                }
                fail_all(&pending);
            })
        };

        Ok(Self {
            name: name.to_owned(),
            stdin: Mutex::new(stdin),
            child: Mutex::new(Some(child)),
            pending,
            reader: std::sync::Mutex::new(Some(reader)),
        })
    }

    async fn write(&self, message: &Value) -> Result<()> {
        let mut line = serde_json::to_string(message)
            .map_err(|e| BridgeError::Tool(format!("{}: encode failed: {e}", self.name)))?;
        line.push('\n');
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| BridgeError::Tool(format!("{}: transport closed", self.name)))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl RpcTransport for ChildProcessTransport {
    async fn request(&self, message: Value) -> Result<Value> {
        let id = request_id(&message)?;
        let waiter = register(&self.pending, id);
        self.write(&message).await?;
        waiter.response(&self.name).await
    }

    async fn notify(&self, message: Value) -> Result<()> {
        self.write(&message).await
    }

    async fn close(&self) {
        // Closing stdin first lets well-behaved servers exit on their own.
        self.stdin.lock().await.take();
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.start_kill() {
                debug!(server = %self.name, error = %e, "kill failed (already exited?)");
            }
            let _ = tokio::time::timeout(Duration::from_secs(2), child.wait()).await;
        }
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = reader {
            handle.abort();
        }
        fail_all(&self.pending);
    }
}

// ── WebSocket ─────────────────────────────────────────────────

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// JSON-RPC over a websocket, one message per text frame.
pub struct WebSocketTransport {
    name: String,
    sink: Mutex<Option<SplitSink<WsStream, Message>>>,
    pending: Pending,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketTransport {
    /// Connect to `url` and start routing inbound frames.
    pub async fn connect(name: &str, url: &str) -> Result<Self> {
        let (stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| BridgeError::Tool(format!("{name}: websocket connect failed: {e}")))?;
        let (sink, mut read) = stream.split();

        let pending: Pending = Arc::default();
        let reader = {
            let pending = Arc::clone(&pending);
            let server = name.to_owned();
            tokio::spawn(async move {
                while let Some(msg) = read.next().await {
                    match msg {
                        Ok(Message::Text(text)) => route(&server, &pending, &text.to_string()),
                        Ok(Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            warn!(server = %server, error = %e, "websocket read failed");
                            break;
                        }
                    }
                }
                fail_all(&pending);
            })
        };

        Ok(Self {
            name: name.to_owned(),
            sink: Mutex::new(Some(sink)),
            pending,
            reader: std::sync::Mutex::new(Some(reader)),
        })
    }

    async fn write(&self, message: &Value) -> Result<()> {
        let mut guard = self.sink.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| BridgeError::Tool(format!("{}: transport closed", self.name)))?;
        sink.send(Message::Text(message.to_string()))
            .await
            .map_err(|e| BridgeError::Tool(format!("{}: websocket send failed: {e}", self.name)))
    }
}

#[async_trait]
impl RpcTransport for WebSocketTransport {
    async fn request(&self, message: Value) -> Result<Value> {
        let id = request_id(&message)?;
        let waiter = register(&self.pending, id);
        self.write(&message).await?;
        waiter.response(&self.name).await
    }

    async fn notify(&self, message: Value) -> Result<()> {
        self.write(&message).await
    }

    async fn close(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = reader {
            handle.abort();
        }
        fail_all(&self.pending);
    }
}

// ── HTTP ──────────────────────────────────────────────────────

const SESSION_HEADER: &str = "mcp-session-id";

/// JSON-RPC over HTTP POST.
///
/// Responses may be plain JSON or a `text/event-stream` body carrying the
/// response in a `data:` line. A session id handed out by the server is
/// echoed on every later request.
pub struct HttpTransport {
    http: reqwest::Client,
    url: String,
    session_id: std::sync::Mutex<Option<String>>,
}

impl HttpTransport {
    /// Transport posting to `url`.
    pub fn new(http: reqwest::Client, url: &str) -> Self {
        Self {
            http,
            url: url.to_owned(),
            session_id: std::sync::Mutex::new(None),
        }
    }

    async fn post(&self, message: &Value) -> Result<reqwest::Response> {
        let mut builder = self
            .http
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .json(message);
        let session = self
            .session_id
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        if let Some(session) = session {
            builder = builder.header(SESSION_HEADER, session);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| BridgeError::Tool(format!("{}: request failed: {e}", self.url)))?;
        if !response.status().is_success() {
            return Err(BridgeError::Tool(format!(
                "{}: HTTP {}",
                self.url,
                response.status().as_u16()
            )));
        }
        if let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self
                .session_id
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(id.to_owned());
        }
        Ok(response)
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn request(&self, message: Value) -> Result<Value> {
        let id = request_id(&message)?;
        let response = self.post(&message).await?;
        let is_sse = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));
        let body = response
            .text()
            .await
            .map_err(|e| BridgeError::Tool(format!("{}: body read failed: {e}", self.url)))?;

        if is_sse {
            return body
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .filter_map(|data| serde_json::from_str::<Value>(data.trim()).ok())
                .find(|v| v.get("id").and_then(Value::as_u64) == Some(id))
                .ok_or_else(|| {
                    BridgeError::Tool(format!("{}: no response for request {id}", self.url))
                });
        }
        serde_json::from_str(&body)
            .map_err(|e| BridgeError::Tool(format!("{}: malformed response: {e}", self.url)))
    }

    async fn notify(&self, message: Value) -> Result<()> {
        self.post(&message).await.map(|_| ())
    }

    async fn close(&self) {
        self.session_id
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn endpoints_are_checked_before_connecting() {
        assert!(parse_endpoint("s", "ws://localhost:9000/mcp", &["ws", "wss"]).is_ok());
        assert!(parse_endpoint("s", "http://localhost:9000", &["ws", "wss"]).is_err());
        assert!(parse_endpoint("s", "~/sock", &["http", "https"]).is_err());
    }

    #[test]
    fn route_delivers_responses_by_id() {
        let pending: Pending = Arc::default();
        let mut waiter = register(&pending, 7);
        route("t", &pending, r#"{"jsonrpc":"2.0","id":7,"result":{}}"#);
        let value = waiter.rx.try_recv().unwrap();
        assert_eq!(value["id"], 7);
        assert!(pending.lock().unwrap().is_empty());
    }

    #[test]
    fn route_ignores_notifications_and_noise() {
        let pending: Pending = Arc::default();
        let mut waiter = register(&pending, 1);
        route("t", &pending, "not json");
        route("t", &pending, r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#);
        route("t", &pending, r#"{"jsonrpc":"2.0","id":1,"method":"sampling/create"}"#);
        assert!(waiter.rx.try_recv().is_err());
        assert_eq!(pending.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn timed_out_request_leaves_no_waiter() {
        let pending: Pending = Arc::default();
        let waiter = register(&pending, 3);
        let outcome =
            tokio::time::timeout(Duration::from_millis(10), waiter.response("t")).await;
        assert!(outcome.is_err(), "no response was routed");
        assert!(pending.lock().unwrap().is_empty());

        // A late reply for the abandoned id is ignored.
        route("t", &pending, r#"{"jsonrpc":"2.0","id":3,"result":{}}"#);
        assert!(pending.lock().unwrap().is_empty());
    }

    #[test]
    fn request_without_id_is_rejected() {
        assert!(request_id(&json!({"method": "x"})).is_err());
    }

    #[tokio::test]
    async fn http_transport_echoes_session_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header(SESSION_HEADER, "abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 2,
                "result": {}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(SESSION_HEADER, "abc")
                    .set_body_json(json!({"jsonrpc":"2.0","id":1,"result":{}})),
            )
            .mount(&server)
            .await;

        let transport = HttpTransport::new(reqwest::Client::new(), &server.uri());
        let first = transport
            .request(json!({"jsonrpc":"2.0","id":1,"method":"initialize"}))
            .await
            .unwrap();
        assert_eq!(first["id"], 1);
        let second = transport
            .request(json!({"jsonrpc":"2.0","id":2,"method":"ping"}))
            .await
            .unwrap();
        assert_eq!(second["id"], 2);
    }

    #[tokio::test]
    async fn http_transport_reads_event_stream_bodies() {
        let server = MockServer::start().await;
        let body =
            "event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":5,\"result\":{\"ok\":true}}\n\n";
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let transport = HttpTransport::new(reqwest::Client::new(), &server.uri());
        let value = transport
            .request(json!({"jsonrpc":"2.0","id":5,"method":"ping"}))
            .await
            .unwrap();
        assert_eq!(value["result"]["ok"], true);
    }

    #[tokio::test]
    async fn http_error_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let transport = HttpTransport::new(reqwest::Client::new(), &server.uri());
        assert!(transport.notify(json!({"jsonrpc":"2.0","method":"x"})).await.is_err());
    }

    #[tokio::test]
    async fn missing_command_fails_to_spawn() {
        let result = ChildProcessTransport::spawn(
            "ghost",
            "voxbridge-no-such-binary-xyz",
            &[],
            &Default::default(),
        );
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn child_process_round_trip() {
        let args = vec![
            "-c".to_owned(),
            r#"while read -r _; do echo '{"jsonrpc":"2.0","id":3,"result":{}}'; done"#.to_owned(),
        ];
        let transport =
            ChildProcessTransport::spawn("sh", "sh", &args, &Default::default()).unwrap();
        let response = tokio::time::timeout(
            Duration::from_secs(5),
            transport.request(json!({"jsonrpc": "2.0", "id": 3, "method": "ping"})),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(response["id"], 3);
        transport.close().await;
        transport.close().await;
        assert!(transport.notify(json!({"method": "x"})).await.is_err());
    }
}
