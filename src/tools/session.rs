//! Control session to one tool server.
//!
//! Lifecycle: `Disconnected → Connecting → Connected → Closing → Closed`,
//! with `Failed` recorded when a connect attempt does not complete. A
//! connected session sends a `ping` at a fixed interval until it is closed
//! or its cancellation token fires. Probe failures are logged; nothing
//! reconnects automatically.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ToolsConfig;
use crate::error::{BridgeError, Result};
use crate::tools::manifest::ToolServerConfig;
use crate::tools::transport::{RpcTransport, TransportConnector};

/// Protocol revision sent in `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Never connected.
    Disconnected,
    /// Transport opening or handshake in flight.
    Connecting,
    /// Handshake complete; probes running.
    Connected,
    /// `close()` in progress.
    Closing,
    /// Released. Terminal.
    Closed,
    /// The last connect attempt failed.
    Failed,
}

/// Timeouts and intervals for a session.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// Bound on transport open plus handshake.
    pub connect_timeout: Duration,
    /// Interval between liveness probes.
    pub probe_interval: Duration,
    /// Bound on a single request after connect.
    pub call_timeout: Duration,
}

impl From<&ToolsConfig> for SessionSettings {
    fn from(config: &ToolsConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(config.connect_timeout_secs.max(1)),
            probe_interval: Duration::from_secs(config.probe_interval_secs.max(1)),
            call_timeout: Duration::from_secs(config.call_timeout_secs.max(1)),
        }
    }
}

/// A tool advertised by a server.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteTool {
    /// Name as known to the server.
    pub name: String,
    /// Description for the model.
    pub description: String,
    /// JSON Schema of the arguments.
    pub input_schema: Value,
}

/// Result of a `tools/call`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    /// Concatenated text content.
    pub text: String,
    /// The server flagged the call as failed.
    pub is_error: bool,
}

struct Inner {
    state: SessionState,
    transport: Option<Arc<dyn RpcTransport>>,
    probe: Option<JoinHandle<()>>,
}

/// Client side of one tool server's control session.
pub struct ControlSession {
    config: ToolServerConfig,
    settings: SessionSettings,
    connector: Arc<dyn TransportConnector>,
    cancel: CancellationToken,
    next_id: Arc<AtomicU64>,
    inner: tokio::sync::Mutex<Inner>,
}

impl ControlSession {
    /// A disconnected session. `cancel` stops the probe loop.
    pub fn new(
        config: ToolServerConfig,
        settings: SessionSettings,
        connector: Arc<dyn TransportConnector>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            settings,
            connector,
            cancel,
            next_id: Arc::new(AtomicU64::new(1)),
            inner: tokio::sync::Mutex::new(Inner {
                state: SessionState::Disconnected,
                transport: None,
                probe: None,
            }),
        }
    }

    /// Server name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// Open the transport, run the handshake and start liveness probes.
    ///
    /// Connecting an already connected session is a no-op. A closed session
    /// cannot be reopened.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Tool`] if the transport cannot be opened, the
    /// handshake fails, or the connect timeout elapses. The state is then
    /// `Failed`.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            match inner.state {
                SessionState::Connected => return Ok(()),
                SessionState::Connecting => {
                    return Err(BridgeError::Tool(format!(
                        "{}: connect already in progress",
                        self.name()
                    )));
                }
                SessionState::Closing | SessionState::Closed => {
                    return Err(BridgeError::Tool(format!("{}: session closed", self.name())));
                }
                SessionState::Disconnected | SessionState::Failed => {
                    inner.state = SessionState::Connecting;
                }
            }
        }

        let attempt =
            tokio::time::timeout(self.settings.connect_timeout, self.open_and_handshake());
        let outcome = match attempt.await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Tool(format!(
                "{}: connect timed out after {:?}",
                self.name(),
                self.settings.connect_timeout
            ))),
        };

        let mut inner = self.inner.lock().await;
        match outcome {
            Ok(transport) if inner.state == SessionState::Connecting => {
                inner.probe = Some(self.spawn_probe(Arc::clone(&transport)));
                inner.transport = Some(transport);
                inner.state = SessionState::Connected;
                info!(server = %self.name(), "tool session connected");
                Ok(())
            }
            Ok(transport) => {
                // Closed while the handshake was in flight.
                transport.close().await;
                Err(BridgeError::Tool(format!(
                    "{}: closed during connect",
                    self.name()
                )))
            }
            Err(e) => {
                if inner.state == SessionState::Connecting {
                    inner.state = SessionState::Failed;
                }
                Err(e)
            }
        }
    }

    async fn open_and_handshake(&self) -> Result<Arc<dyn RpcTransport>> {
        let transport = self.connector.open(&self.config).await?;
        let init = rpc_request(
            &self.next_id,
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        );
        let handshake = async {
            let response = transport.request(init).await?;
            let result = into_result(self.name(), "initialize", response)?;
            debug!(
                server = %self.name(),
                protocol = result
                    .get("protocolVersion")
                    .and_then(|v| v.as_str())
                    .unwrap_or("?"),
                "initialize accepted"
            );
            transport
                .notify(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
                .await
        };
        match handshake.await {
            Ok(()) => Ok(transport),
            Err(e) => {
                transport.close().await;
                Err(e)
            }
        }
    }

    fn spawn_probe(&self, transport: Arc<dyn RpcTransport>) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        let interval = self.settings.probe_interval;
        let timeout = self.settings.call_timeout;
        let next_id = Arc::clone(&self.next_id);
        let name = self.config.name.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; the handshake just proved liveness.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(server = %name, "probe loop cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        let ping = rpc_request(&next_id, "ping", json!({}));
                        match tokio::time::timeout(timeout, transport.request(ping)).await {
                            Ok(Ok(response)) => match into_result(&name, "ping", response) {
                                Ok(_) => debug!(server = %name, "probe ok"),
                                Err(e) => warn!(server = %name, error = %e, "probe rejected"),
                            },
                            Ok(Err(e)) => warn!(server = %name, error = %e, "probe failed"),
                            Err(_) => warn!(server = %name, "probe timed out"),
                        }
                    }
                }
            }
        })
    }

    async fn transport(&self) -> Result<Arc<dyn RpcTransport>> {
        let inner = self.inner.lock().await;
        match (&inner.state, &inner.transport) {
            (SessionState::Connected, Some(t)) => Ok(Arc::clone(t)),
            (state, _) => Err(BridgeError::Tool(format!(
                "{}: session not connected ({state:?})",
                self.name()
            ))),
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let transport = self.transport().await?;
        let request = rpc_request(&self.next_id, method, params);
        let response = tokio::time::timeout(self.settings.call_timeout, transport.request(request))
            .await
            .map_err(|_| BridgeError::Tool(format!("{}: {method} timed out", self.name())))??;
        into_result(self.name(), method, response)
    }

    /// Send one liveness probe now.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is not connected or the probe fails.
    pub async fn ping(&self) -> Result<()> {
        self.call("ping", json!({})).await.map(|_| ())
    }

    /// List every tool the server offers, following pagination cursors.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is not connected or the request fails.
    pub async fn list_tools(&self) -> Result<Vec<RemoteTool>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        let mut seen = HashSet::new();
        loop {
            let params = match &cursor {
                Some(c) => json!({ "cursor": c }),
                None => json!({}),
            };
            let result = self.call("tools/list", params).await?;
            if let Some(items) = result.get("tools").and_then(Value::as_array) {
                for item in items {
                    let Some(name) = item.get("name").and_then(Value::as_str) else {
                        continue;
                    };
                    tools.push(RemoteTool {
                        name: name.to_owned(),
                        description: item
                            .get("description")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_owned(),
                        input_schema: item
                            .get("inputSchema")
                            .cloned()
                            .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                    });
                }
            }
            match result.get("nextCursor").and_then(Value::as_str) {
                Some(next) if !next.is_empty() => {
                    if !seen.insert(next.to_owned()) {
                        warn!(server = %self.name(), cursor = next, "tool listing cursor repeated");
                        break;
                    }
                    cursor = Some(next.to_owned());
                }
                _ => break,
            }
        }
        Ok(tools)
    }

    /// Invoke a tool.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is not connected or the request fails.
    /// A tool that runs but reports failure is not an error; see
    /// [`ToolOutput::is_error`].
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolOutput> {
        let result = self
            .call("tools/call", json!({ "name": name, "arguments": arguments }))
            .await?;
        let text = result
            .get("content")
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();
        Ok(ToolOutput {
            text,
            is_error: result
                .get("isError")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }

    /// Stop probes and release the transport. Idempotent; safe on sessions
    /// that never connected.
    pub async fn close(&self) {
        let (transport, probe) = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                SessionState::Closing | SessionState::Closed => return,
                SessionState::Disconnected | SessionState::Failed => {
                    inner.state = SessionState::Closed;
                    return;
                }
                SessionState::Connecting | SessionState::Connected => {
                    inner.state = SessionState::Closing;
                }
            }
            (inner.transport.take(), inner.probe.take())
        };

        if let Some(probe) = probe {
            probe.abort();
            let _ = probe.await;
        }
        if let Some(transport) = transport {
            transport.close().await;
        }
        self.inner.lock().await.state = SessionState::Closed;
        info!(server = %self.name(), "tool session closed");
    }
}

fn rpc_request(next_id: &AtomicU64, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": next_id.fetch_add(1, Ordering::Relaxed),
        "method": method,
        "params": params,
    })
}

/// Unwrap a JSON-RPC response into its `result`.
fn into_result(server: &str, method: &str, mut response: Value) -> Result<Value> {
    if let Some(error) = response.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(BridgeError::Tool(format!(
            "{server}: {method} failed ({code}): {message}"
        )));
    }
    Ok(response
        .get_mut("result")
        .map(Value::take)
        .unwrap_or(Value::Null))
}
