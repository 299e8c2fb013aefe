//! In-memory MCP servers for testing.
//!
//! [`MockServer`] scripts a tool catalog and per-tool handlers;
//! [`MockConnector`] hands out transports for registered endpoints while
//! counting connections and recording the auth header each connection was
//! built with. No sockets, no child processes.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{Error, Result};

use super::handle::TransportConfig;
use super::transport::{Connector, McpTransport, RawTool};

type ToolHandler = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

/// One recorded tool invocation.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    /// Raw tool name.
    pub name: String,
    /// Arguments the tool was invoked with.
    pub arguments: Value,
    /// Auth header of the connection that carried the call.
    pub auth_header: Option<String>,
}

/// A scriptable in-memory MCP server.
#[derive(Default)]
pub struct MockServer {
    tools: Mutex<Vec<RawTool>>,
    handlers: Mutex<HashMap<String, ToolHandler>>,
    list_calls: AtomicUsize,
    calls: Mutex<Vec<RecordedCall>>,
}

impl std::fmt::Debug for MockServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockServer")
            .field("tools", &self.tools.lock().len())
            .finish_non_exhaustive()
    }
}

impl MockServer {
    /// Create an empty server.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a tool with an argument schema and a handler.
    pub fn add_tool(
        &self,
        name: &str,
        schema: Value,
        handler: impl Fn(Value) -> Result<Value> + Send + Sync + 'static,
    ) {
        self.tools.lock().push(RawTool {
            name: name.to_string(),
            description: Some(format!("mock tool {name}")),
            input_schema: Some(schema),
        });
        self.handlers
            .lock()
            .insert(name.to_string(), Arc::new(handler));
    }

    /// Register a tool that echoes a fixed value.
    pub fn add_fixed_tool(&self, name: &str, schema: Value, result: Value) {
        self.add_tool(name, schema, move |_| Ok(result.clone()));
    }

    /// How many times `list_tools` hit this server.
    #[must_use]
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Every recorded tool invocation, in arrival order.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }
}

/// Transport bound to a [`MockServer`] plus the auth header it was
/// connected with.
struct MockTransport {
    server: Arc<MockServer>,
    auth_header: Option<String>,
}

#[async_trait::async_trait]
impl McpTransport for MockTransport {
    async fn list_tools(&self) -> Result<Vec<RawTool>> {
        self.server.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.server.tools.lock().clone())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        self.server.calls.lock().push(RecordedCall {
            name: name.to_string(),
            arguments: arguments.clone(),
            auth_header: self.auth_header.clone(),
        });
        let handler = self
            .server
            .handlers
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::mcp_tool(name, "no such tool"))?;
        handler(arguments)
    }

    async fn close(&self) {}
}

/// Connector resolving endpoints to registered [`MockServer`]s.
#[derive(Default)]
pub struct MockConnector {
    servers: Mutex<HashMap<String, Arc<MockServer>>>,
    connects: AtomicUsize,
    fail_connects: Mutex<HashMap<String, usize>>,
}

impl std::fmt::Debug for MockConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConnector")
            .field("servers", &self.servers.lock().len())
            .finish_non_exhaustive()
    }
}

impl MockConnector {
    /// Create an empty connector.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a server under an endpoint descriptor (URL for HTTP,
    /// `command args…` for STDIO).
    pub fn register(&self, descriptor: &str, server: Arc<MockServer>) {
        self.servers.lock().insert(descriptor.to_string(), server);
    }

    /// Make the next `n` connection attempts to `descriptor` fail.
    pub fn fail_next_connects(&self, descriptor: &str, n: usize) {
        self.fail_connects.lock().insert(descriptor.to_string(), n);
    }

    /// Number of transports constructed so far.
    #[must_use]
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        config: &TransportConfig,
        auth_header: Option<&str>,
    ) -> Result<Arc<dyn McpTransport>> {
        let descriptor = config.descriptor();

        {
            let mut failures = self.fail_connects.lock();
            if let Some(remaining) = failures.get_mut(&descriptor) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::mcp_connection(format!(
                        "scripted connect failure for '{descriptor}'"
                    )));
                }
            }
        }

        let server = self
            .servers
            .lock()
            .get(&descriptor)
            .cloned()
            .ok_or_else(|| {
                Error::mcp_connection(format!("no mock server registered for '{descriptor}'"))
            })?;

        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockTransport {
            server,
            auth_header: auth_header.map(ToString::to_string),
        }))
    }
}
