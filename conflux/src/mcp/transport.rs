//! MCP transport contract and the rmcp-backed default implementation.
//!
//! The runtime only depends on [`McpTransport`] (list tools, call tool,
//! close) and [`Connector`] (construct a connected transport for an
//! endpoint). The default [`RmcpConnector`] speaks the protocol through the
//! `rmcp` crate: streamable HTTP for remote servers and a child process for
//! STDIO servers. Auth headers are scoped to the connection they were
//! issued for; nothing process-global is mutated.

use std::sync::Arc;

use rmcp::{
    ServiceExt,
    model::{CallToolRequestParams, ClientCapabilities, Implementation, InitializeRequestParams},
    service::ServerSink,
    transport::{
        StreamableHttpClientTransport, child_process::TokioChildProcess,
        streamable_http_client::StreamableHttpClientTransportConfig,
    },
};
use parking_lot::Mutex;
use rmcp::service::RunningServiceCancellationToken;
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};

use super::handle::TransportConfig;

/// A tool as reported by a server, before qualification.
#[derive(Debug, Clone)]
pub struct RawTool {
    /// Server-side tool name.
    pub name: String,
    /// Human-readable description.
    pub description: Option<String>,
    /// JSON-schema for the tool arguments.
    pub input_schema: Option<Value>,
}

/// A live connection to an MCP server.
#[async_trait::async_trait]
pub trait McpTransport: Send + Sync {
    /// List the tools the server exposes.
    async fn list_tools(&self) -> Result<Vec<RawTool>>;

    /// Invoke a tool by its raw (unqualified) name.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value>;

    /// Release the underlying resources. Errors are reported but callers
    /// treat close as best-effort.
    async fn close(&self);
}

/// Constructs connected transports. The pool calls this on cache misses;
/// tests substitute an in-memory implementation.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Connect to the endpoint, performing the initial handshake.
    /// `auth_header` is the full `Authorization` header value, when the
    /// endpoint requires one.
    async fn connect(
        &self,
        config: &TransportConfig,
        auth_header: Option<&str>,
    ) -> Result<Arc<dyn McpTransport>>;
}

/// Default connector backed by the `rmcp` client.
#[derive(Debug, Clone, Copy, Default)]
pub struct RmcpConnector;

impl RmcpConnector {
    fn client_info() -> InitializeRequestParams {
        InitializeRequestParams {
            meta: None,
            protocol_version: Default::default(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: "conflux".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
        }
    }
}

#[async_trait::async_trait]
impl Connector for RmcpConnector {
    async fn connect(
        &self,
        config: &TransportConfig,
        auth_header: Option<&str>,
    ) -> Result<Arc<dyn McpTransport>> {
        let service = match config {
            TransportConfig::Http { url } => {
                let mut cfg = StreamableHttpClientTransportConfig::with_uri(url.as_str());
                if let Some(header) = auth_header {
                    cfg.auth_header = Some(header.to_string());
                }
                let transport = StreamableHttpClientTransport::from_config(cfg);
                Self::client_info().serve(transport).await.map_err(|e| {
                    Error::mcp_connection(format!("connect to '{url}' failed: {e}"))
                })?
            }
            TransportConfig::Stdio { command, args, env } => {
                let mut cmd = tokio::process::Command::new(command);
                cmd.args(args);
                if let Some(vars) = env {
                    cmd.envs(vars);
                }
                // Child diagnostics surface on the host's stderr.
                cmd.stderr(std::process::Stdio::inherit());

                let transport = TokioChildProcess::new(cmd).map_err(|e| {
                    Error::mcp_misconfigured(format!("spawn '{command}' failed: {e}"))
                })?;
                Self::client_info().serve(transport).await.map_err(|e| {
                    Error::mcp_connection(format!("initialize '{command}' failed: {e}"))
                })?
            }
        };

        debug!(endpoint = %config.descriptor(), "connected MCP transport");

        let sink = service.peer().clone();
        let cancel = service.cancellation_token();
        // Keep the service alive in the background; `close` cancels it.
        let task = tokio::spawn(async move {
            let _ = service.waiting().await;
        });

        Ok(Arc::new(RmcpTransport {
            sink,
            cancel: Mutex::new(Some(cancel)),
            task,
        }))
    }
}

/// rmcp-backed transport. Calls go through the cloned peer sink so
/// concurrent tool invocations on one connection do not serialize.
struct RmcpTransport {
    sink: ServerSink,
    cancel: Mutex<Option<RunningServiceCancellationToken>>,
    task: tokio::task::JoinHandle<()>,
}

#[async_trait::async_trait]
impl McpTransport for RmcpTransport {
    async fn list_tools(&self) -> Result<Vec<RawTool>> {
        let listed = self
            .sink
            .list_tools(Default::default())
            .await
            .map_err(|e| Error::mcp_connection(format!("list tools failed: {e}")))?;
        Ok(listed
            .tools
            .into_iter()
            .map(|t| RawTool {
                name: t.name.to_string(),
                description: t.description.map(|d| d.to_string()),
                input_schema: Some(Value::Object((*t.input_schema).clone())),
            })
            .collect())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        let args_map = match arguments {
            Value::Object(map) => Some(map),
            Value::Null => None,
            other => {
                return Err(Error::validation(
                    name,
                    format!("arguments must be an object, got {other}"),
                ));
            }
        };

        let result = self
            .sink
            .call_tool(CallToolRequestParams {
                meta: None,
                name: name.to_string().into(),
                arguments: args_map,
                task: None,
            })
            .await
            .map_err(|e| Error::mcp_connection(format!("call '{name}' failed: {e}")))?;

        if result.is_error.unwrap_or(false) {
            let detail = serde_json::to_string(&result.content).unwrap_or_default();
            return Err(Error::mcp_tool(name, detail));
        }

        // Prefer the structured payload; fall back to the content blocks.
        if let Some(structured) = result.structured_content {
            return Ok(structured);
        }
        serde_json::to_value(&result.content)
            .map_err(|e| Error::mcp_tool(name, format!("unserializable result: {e}")))
    }

    async fn close(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
    }
}

impl Drop for RmcpTransport {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
        self.task.abort();
    }
}
