//! Pool of connected tool-server sessions.
//!
//! Every enabled server is connected concurrently and independently; a
//! server that fails to connect is logged and left out. Tools are exposed to
//! the model as `server__tool`.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{BridgeError, Result};
use crate::llm::ToolDefinition;
use crate::tools::manifest::ToolServerConfig;
use crate::tools::session::{ControlSession, SessionSettings, ToolOutput};
use crate::tools::transport::TransportConnector;

/// Separator between server and tool in exposed names.
pub const NAME_SEPARATOR: &str = "__";

/// Connected sessions plus the exposed-name index.
pub struct ToolSessionPool {
    sessions: Vec<Arc<ControlSession>>,
    /// Exposed name → (session index, server-side tool name).
    index: RwLock<HashMap<String, (usize, String)>>,
}

impl ToolSessionPool {
    /// An empty pool.
    pub fn empty() -> Self {
        Self {
            sessions: Vec::new(),
            index: RwLock::new(HashMap::new()),
        }
    }

    /// Connect every enabled server concurrently.
    ///
    /// Disabled servers are skipped. Failures are logged per server and
    /// never abort the others. Each session's probe loop is bound to a child
    /// of `cancel`.
    pub async fn connect_all(
        servers: &[ToolServerConfig],
        settings: SessionSettings,
        connector: Arc<dyn TransportConnector>,
        cancel: &CancellationToken,
    ) -> Self {
        let mut tasks = JoinSet::new();
        for (order, server) in servers.iter().enumerate() {
            if !server.enabled {
                info!(server = %server.name, "tool server disabled; skipping");
                continue;
            }
            let session = Arc::new(ControlSession::new(
                server.clone(),
                settings,
                Arc::clone(&connector),
                cancel.child_token(),
            ));
            tasks.spawn(async move {
                let outcome = session.connect().await;
                (order, session, outcome)
            });
        }

        let mut connected = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((order, session, Ok(()))) => connected.push((order, session)),
                Ok((_, session, Err(e))) => {
                    warn!(
                        server = %session.name(),
                        error = %e,
                        "tool server unavailable; skipping"
                    );
                    session.close().await;
                }
                Err(e) => warn!(error = %e, "tool connect task failed"),
            }
        }
        // Keep manifest (name) order regardless of which connect finished first.
        connected.sort_by_key(|(order, _)| *order);

        info!(
            connected = connected.len(),
            configured = servers.len(),
            "tool sessions ready"
        );
        Self {
            sessions: connected.into_iter().map(|(_, s)| s).collect(),
            index: RwLock::new(HashMap::new()),
        }
    }

    /// Number of connected sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is connected.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Names of connected servers.
    pub fn server_names(&self) -> Vec<String> {
        self.sessions.iter().map(|s| s.name().to_owned()).collect()
    }

    /// Gather tool definitions from every session and rebuild the index.
    ///
    /// A session whose listing fails contributes no tools.
    pub async fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions = Vec::new();
        let mut index = HashMap::new();
        for (i, session) in self.sessions.iter().enumerate() {
            let tools = match session.list_tools().await {
                Ok(tools) => tools,
                Err(e) => {
                    warn!(server = %session.name(), error = %e, "tools/list failed");
                    continue;
                }
            };
            for tool in tools {
                let exposed = exposed_name(session.name(), &tool.name);
                index.insert(exposed.clone(), (i, tool.name.clone()));
                definitions.push(ToolDefinition {
                    name: exposed,
                    description: tool.description,
                    parameters: tool.input_schema,
                });
            }
        }
        *self
            .index
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = index;
        definitions
    }

    /// Call a tool by its exposed name with JSON-encoded arguments.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Tool`] for unknown tools, malformed arguments,
    /// or a failed request.
    pub async fn call(&self, exposed: &str, arguments: &str) -> Result<ToolOutput> {
        let (session, tool) = self.lookup(exposed)?;
        let arguments: Value = if arguments.trim().is_empty() {
            Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_str(arguments)
                .map_err(|e| BridgeError::Tool(format!("{exposed}: bad arguments: {e}")))?
        };
        session.call_tool(&tool, arguments).await
    }

    fn lookup(&self, exposed: &str) -> Result<(Arc<ControlSession>, String)> {
        let indexed = self
            .index
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(exposed)
            .cloned();
        if let Some((i, tool)) = indexed
            && let Some(session) = self.sessions.get(i)
        {
            return Ok((Arc::clone(session), tool));
        }
        // Not listed yet: fall back to splitting the name.
        let (server, tool) = exposed
            .split_once(NAME_SEPARATOR)
            .ok_or_else(|| BridgeError::Tool(format!("unknown tool {exposed:?}")))?;
        self.sessions
            .iter()
            .find(|s| s.name() == server)
            .map(|s| (Arc::clone(s), tool.to_owned()))
            .ok_or_else(|| BridgeError::Tool(format!("unknown tool server {server:?}")))
    }

    /// Close every session concurrently.
    pub async fn close_all(&self) {
        futures_util::future::join_all(self.sessions.iter().map(|s| s.close())).await;
    }
}

/// `server__tool`, restricted to the characters function names allow.
pub fn exposed_name(server: &str, tool: &str) -> String {
    let clean = |s: &str| -> String {
        s.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    };
    format!("{}{NAME_SEPARATOR}{}", clean(server), clean(tool))
}
