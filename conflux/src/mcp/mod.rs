//! Model Context Protocol (MCP) integration.
//!
//! Handles identify tool servers (HTTP or STDIO child processes);
//! connections are pooled process-wide and keyed by endpoint and auth
//! class; tool catalogs are cached with a TTL; arguments are validated
//! against each tool's schema before invocation.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use conflux::mcp;
//!
//! let weather = mcp::http("http://localhost:8080/mcp");
//! let local = mcp::stdio("python", &["server.py"]);
//! let tools = mcp::discover_tools(&[weather, local]).await?;
//! ```

mod auth;
mod discovery;
mod handle;
pub mod mock;
mod pool;
mod runtime;
mod schema;
mod transport;

pub use auth::{AuthManager, HttpTokenFetcher, TokenFetcher, TokenGrant};
pub use discovery::{DiscoveryCache, MAX_TOOL_NAME_LEN, ToolDefinition};
pub use handle::{McpAuth, McpHandle, TransportConfig, http, stdio};
pub use pool::{AuthClass, ConnectionPool, PoolConfig, PoolKey, PooledConnection};
pub use runtime::{McpRuntime, discover_tools};
pub use schema::SchemaValidator;
pub use transport::{Connector, McpTransport, RawTool, RmcpConnector};
