//! Tool-server manifest loader.
//!
//! Reads `mcp.json`-style manifests from up to three places and merges them
//! into one sorted list of [`ToolServerConfig`]. Accepted file shapes:
//!
//! ```json
//! { "mcpServers": { "files": { "command": "~/bin/files-mcp", "args": ["--stdio"] } } }
//! ```
//!
//! or a bare `{ "<name>": { ... } }` map. A socket server is written either as
//! `{"transport": {"type": "ws", "url": "..."}}` or with `type`/`url` at the
//! top level of the entry.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::bridge_dirs;
use crate::config::ToolsConfig;

/// Kind of socket a tool server listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    /// `ws://` / `wss://`, one JSON-RPC message per text frame.
    WebSocket,
    /// `http://` / `https://`, one JSON-RPC message per POST.
    Http,
}

/// How to reach a tool server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolTransport {
    /// Spawn a child process and speak JSON-RPC over its stdio.
    Command {
        /// Program to run.
        command: String,
        /// Arguments.
        args: Vec<String>,
    },
    /// Connect to a listening server.
    Socket {
        /// Socket flavor.
        kind: SocketKind,
        /// Endpoint URL.
        url: String,
    },
}

/// One merged tool-server entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolServerConfig {
    /// Unique server name.
    pub name: String,
    /// How to reach the server.
    pub transport: ToolTransport,
    /// Disabled entries are kept but never connected.
    pub enabled: bool,
    /// Extra environment for command transports.
    pub env: BTreeMap<String, String>,
}

/// Where manifests are read from.
#[derive(Debug, Clone, Default)]
pub struct ManifestSources {
    /// Explicit manifest; when set nothing else is read.
    pub override_path: Option<PathBuf>,
    /// Workspace-scoped manifest.
    pub workspace: Option<PathBuf>,
    /// User-scoped manifest.
    pub user: Option<PathBuf>,
}

impl ManifestSources {
    /// Standard locations for the given tool configuration.
    pub fn from_config(config: &ToolsConfig) -> Self {
        Self {
            override_path: config.config_path.clone(),
            workspace: config
                .workspace_dir
                .as_deref()
                .map(bridge_dirs::workspace_manifest_file),
            user: Some(bridge_dirs::user_manifest_file()),
        }
    }

    /// Files to read, lowest priority first.
    fn ordered(&self) -> Vec<&Path> {
        if let Some(path) = &self.override_path {
            return vec![path.as_path()];
        }
        [self.user.as_deref(), self.workspace.as_deref()]
            .into_iter()
            .flatten()
            .collect()
    }
}

/// Merges manifests into the effective tool-server set.
#[derive(Debug, Clone)]
pub struct ManifestLoader {
    sources: ManifestSources,
    home: Option<PathBuf>,
}

impl ManifestLoader {
    /// Loader over `sources`, expanding `~` against the user's home.
    pub fn new(sources: ManifestSources) -> Self {
        Self {
            sources,
            home: dirs::home_dir(),
        }
    }

    /// Use a specific home directory for `~` expansion.
    #[must_use]
    pub fn with_home(mut self, home: Option<PathBuf>) -> Self {
        self.home = home;
        self
    }

    /// Read every source and merge.
    ///
    /// Missing files contribute nothing. Unreadable or malformed files are
    /// logged and skipped. The result is sorted by name.
    pub fn load(&self) -> Vec<ToolServerConfig> {
        let mut merged: BTreeMap<String, ToolServerConfig> = BTreeMap::new();
        for path in self.sources.ordered() {
            for server in self.read_file(path) {
                if merged.contains_key(&server.name) {
                    debug!(
                        name = %server.name,
                        path = %path.display(),
                        "manifest entry overridden"
                    );
                }
                merged.insert(server.name.clone(), server);
            }
        }
        merged.into_values().collect()
    }

    fn read_file(&self, path: &Path) -> Vec<ToolServerConfig> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no tool manifest");
                return Vec::new();
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read tool manifest; skipping");
                return Vec::new();
            }
        };
        match parse_manifest(&bytes, self.home.as_deref()) {
            Ok(servers) => servers,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "malformed tool manifest; skipping");
                Vec::new()
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct EntryFile {
    #[serde(default)]
    transport: Option<TransportFile>,
    #[serde(rename = "type", default)]
    typ: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct TransportFile {
    #[serde(rename = "type", default)]
    typ: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
}

/// Parse one manifest document.
///
/// A document that is not a JSON object is an error. Individual entries
/// that cannot be interpreted are logged and dropped.
pub fn parse_manifest(
    bytes: &[u8],
    home: Option<&Path>,
) -> Result<Vec<ToolServerConfig>, serde_json::Error> {
    let root: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(bytes)?;
    let servers = match root.get("mcpServers").cloned() {
        Some(serde_json::Value::Object(map)) => map,
        Some(serde_json::Value::Null) => serde_json::Map::new(),
        Some(_) => {
            return Err(serde::de::Error::custom("\"mcpServers\" must be an object"));
        }
        None => root,
    };

    let mut out = Vec::with_capacity(servers.len());
    for (name, value) in servers {
        let entry: EntryFile = match serde_json::from_value(value) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(%name, error = %e, "skipping malformed tool server entry");
                continue;
            }
        };
        match normalize_entry(&name, entry, home) {
            Some(server) => out.push(server),
            None => warn!(%name, "tool server entry has neither command nor url; skipping"),
        }
    }
    Ok(out)
}

fn normalize_entry(name: &str, entry: EntryFile, home: Option<&Path>) -> Option<ToolServerConfig> {
    let expand = |s: &str| bridge_dirs::expand_home_with(s.trim(), home);

    let (typ, url, command, args) = match entry.transport {
        Some(t) => (
            t.typ.or(entry.typ),
            t.url.or(entry.url),
            t.command.or(entry.command),
            if t.args.is_empty() { entry.args } else { t.args },
        ),
        None => (entry.typ, entry.url, entry.command, entry.args),
    };
    let typ = typ.map(|t| t.trim().to_ascii_lowercase());
    let url = url.map(|u| expand(&u)).filter(|u| !u.is_empty());
    let command = command.map(|c| expand(&c)).filter(|c| !c.is_empty());

    let socket_requested = matches!(
        typ.as_deref(),
        Some("ws" | "wss" | "websocket" | "http" | "https" | "sse" | "streamable-http")
    );

    let transport = match (command, url) {
        (Some(command), _) if !socket_requested => ToolTransport::Command {
            command,
            args: args.iter().map(|a| expand(a)).collect(),
        },
        (_, Some(url)) => ToolTransport::Socket {
            kind: socket_kind(typ.as_deref(), &url),
            url,
        },
        (Some(command), None) => ToolTransport::Command {
            command,
            args: args.iter().map(|a| expand(a)).collect(),
        },
        (None, None) => return None,
    };

    Some(ToolServerConfig {
        name: name.to_owned(),
        transport,
        enabled: entry.enabled.unwrap_or(true),
        env: entry
            .env
            .into_iter()
            .map(|(k, v)| (k, bridge_dirs::expand_home_with(&v, home)))
            .collect(),
    })
}

fn socket_kind(typ: Option<&str>, url: &str) -> SocketKind {
    match typ {
        Some("ws" | "wss" | "websocket") => SocketKind::WebSocket,
        Some(_) => SocketKind::Http,
        None if url.starts_with("ws://") || url.starts_with("wss://") => SocketKind::WebSocket,
        None => SocketKind::Http,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    const HOME: &str = "/home/ada";

    fn parse(json: &str) -> Vec<ToolServerConfig> {
        parse_manifest(json.as_bytes(), Some(Path::new(HOME))).unwrap()
    }

    #[test]
    fn wrapped_and_bare_shapes_are_equivalent() {
        let wrapped = parse(r#"{"mcpServers":{"files":{"command":"files-mcp"}}}"#);
        let bare = parse(r#"{"files":{"command":"files-mcp"}}"#);
        assert_eq!(wrapped, bare);
        assert_eq!(wrapped[0].name, "files");
        assert!(wrapped[0].enabled);
    }

    #[test]
    fn command_args_env_and_url_are_home_expanded() {
        let servers = parse(
            r#"{"a":{"command":"~/bin/a","args":["--root","~/data","~bob"],"env":{"CACHE":"~/.cache"}},
                "b":{"type":"http","url":"~/sock"}}"#,
        );
        let a = servers.iter().find(|s| s.name == "a").unwrap();
        assert_eq!(
            a.transport,
            ToolTransport::Command {
                command: "/home/ada/bin/a".into(),
                args: vec!["--root".into(), "/home/ada/data".into(), "~bob".into()],
            }
        );
        assert_eq!(a.env["CACHE"], "/home/ada/.cache");
        let b = servers.iter().find(|s| s.name == "b").unwrap();
        assert!(matches!(
            &b.transport,
            ToolTransport::Socket { url, .. } if url == "/home/ada/sock"
        ));
    }

    #[test]
    fn nested_transport_and_top_level_type_agree() {
        let nested = parse(r#"{"s":{"transport":{"type":"ws","url":"ws://h:1/mcp"}}}"#);
        let flat = parse(r#"{"s":{"type":"ws","url":"ws://h:1/mcp"}}"#);
        assert_eq!(nested, flat);
        assert_eq!(
            nested[0].transport,
            ToolTransport::Socket {
                kind: SocketKind::WebSocket,
                url: "ws://h:1/mcp".into()
            }
        );
    }

    #[test]
    fn socket_kind_falls_back_to_scheme() {
        let servers = parse(r#"{"w":{"url":"wss://x"},"h":{"url":"https://x"}}"#);
        let kind_of = |name: &str| {
            match &servers.iter().find(|s| s.name == name).unwrap().transport {
                ToolTransport::Socket { kind, .. } => Some(*kind),
                ToolTransport::Command { .. } => None,
            }
        };
        assert_eq!(kind_of("w"), Some(SocketKind::WebSocket));
        assert_eq!(kind_of("h"), Some(SocketKind::Http));
    }

    #[test]
    fn disabled_entries_are_kept() {
        let servers = parse(r#"{"off":{"command":"x","enabled":false}}"#);
        assert_eq!(servers.len(), 1);
        assert!(!servers[0].enabled);
    }

    #[test]
    fn unusable_entries_are_dropped() {
        let servers = parse(r#"{"empty":{},"bad":{"args":"nope"},"ok":{"command":"x"}}"#);
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].name, "ok");
    }

    #[test]
    fn non_object_document_is_an_error() {
        assert!(parse_manifest(b"[1,2]", None).is_err());
        assert!(parse_manifest(br#"{"mcpServers":[]}"#, None).is_err());
    }

    fn write(dir: &Path, rel: &str, body: &str) -> PathBuf {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn workspace_overrides_user_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let user = write(
            dir.path(),
            "user/mcp.json",
            r#"{"mcpServers":{"shared":{"command":"user-cmd","env":{"A":"1"}},"u":{"command":"u"}}}"#,
        );
        let ws = write(
            dir.path(),
            "ws/.voxbridge/mcp.json",
            r#"{"mcpServers":{"shared":{"url":"http://ws"}}}"#,
        );
        let loader = ManifestLoader::new(ManifestSources {
            override_path: None,
            workspace: Some(ws),
            user: Some(user),
        });
        let servers = loader.load();
        let names: Vec<_> = servers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["shared", "u"]);
        // Full replacement: nothing from the user entry survives.
        assert!(servers[0].env.is_empty());
        assert!(matches!(servers[0].transport, ToolTransport::Socket { .. }));
    }

    #[test]
    fn override_path_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let user = write(dir.path(), "user.json", r#"{"u":{"command":"u"}}"#);
        let explicit = write(dir.path(), "explicit.json", r#"{"e":{"command":"e"}}"#);
        let loader = ManifestLoader::new(ManifestSources {
            override_path: Some(explicit),
            workspace: None,
            user: Some(user),
        });
        let servers = loader.load();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].name, "e");
    }

    #[test]
    fn missing_and_malformed_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let broken = write(dir.path(), "broken.json", "{ not json");
        let loader = ManifestLoader::new(ManifestSources {
            override_path: None,
            workspace: Some(broken),
            user: Some(dir.path().join("absent.json")),
        });
        assert!(loader.load().is_empty());
        assert!(ManifestLoader::new(ManifestSources::default()).load().is_empty());
    }
}
