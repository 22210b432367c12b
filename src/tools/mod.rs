//! Tool servers: manifest loading, control sessions and the session pool.

pub mod manifest;
pub mod pool;
pub mod session;
pub mod transport;

pub use manifest::{ManifestLoader, ManifestSources, SocketKind, ToolServerConfig, ToolTransport};
pub use pool::ToolSessionPool;
pub use session::{ControlSession, SessionSettings, SessionState, ToolOutput};
pub use transport::{DefaultConnector, RpcTransport, TransportConnector};
