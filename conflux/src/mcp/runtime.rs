//! Process-wide MCP runtime: pool, auth, discovery, and validation.
//!
//! One [`McpRuntime`] is shared by every agent in the process by default;
//! tests build isolated runtimes around an in-memory connector.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result, mcp_provider_tag};

use super::auth::AuthManager;
use super::discovery::{DiscoveryCache, ToolDefinition, qualify};
use super::handle::{McpAuth, McpHandle, TransportConfig};
use super::pool::{ConnectionPool, PoolConfig};
use super::schema::SchemaValidator;
use super::transport::{Connector, RmcpConnector};

static GLOBAL: OnceLock<Arc<McpRuntime>> = OnceLock::new();

/// The shared MCP machinery behind every tool operation.
pub struct McpRuntime {
    pool: ConnectionPool,
    auth: AuthManager,
    discovery: DiscoveryCache,
    validator: SchemaValidator,
}

impl std::fmt::Debug for McpRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpRuntime")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl Default for McpRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl McpRuntime {
    /// Runtime backed by the default rmcp connector.
    #[must_use]
    pub fn new() -> Self {
        Self::with_connector(Arc::new(RmcpConnector))
    }

    /// Runtime backed by a custom connector (used by tests).
    #[must_use]
    pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
        Self {
            pool: ConnectionPool::new(connector, PoolConfig::default()),
            auth: AuthManager::new(),
            discovery: DiscoveryCache::default(),
            validator: SchemaValidator::new(),
        }
    }

    /// Swap in a custom auth manager (used by tests).
    #[must_use]
    pub fn with_auth(mut self, auth: AuthManager) -> Self {
        self.auth = auth;
        self
    }

    /// The process-wide runtime shared by agents without an override.
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new())))
    }

    /// The connection pool.
    #[must_use]
    pub const fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// The schema validator.
    #[must_use]
    pub const fn validator(&self) -> &SchemaValidator {
        &self.validator
    }

    /// Resolve the effective auth for a handle: per-handle auth wins over
    /// the agent-level URL map; STDIO endpoints ignore auth entirely.
    #[must_use]
    pub fn effective_auth<'a>(
        handle: &'a McpHandle,
        agent_auth: &'a HashMap<String, McpAuth>,
    ) -> Option<&'a McpAuth> {
        match &handle.transport {
            TransportConfig::Stdio { .. } => None,
            TransportConfig::Http { url } => {
                handle.auth.as_ref().or_else(|| agent_auth.get(url))
            }
        }
    }

    /// Discover tools across handles, serving fresh catalogs from the TTL
    /// cache. A failure on any handle invalidates that handle's cache and
    /// propagates as a retryable connection error.
    pub async fn discover_tools(
        &self,
        handles: &[McpHandle],
        agent_auth: &HashMap<String, McpAuth>,
    ) -> Result<Vec<ToolDefinition>> {
        let mut catalog = Vec::new();
        for handle in handles {
            if let Some(cached) = self.discovery.get(&handle.id) {
                catalog.extend(cached);
                continue;
            }

            let listed = self.list_tools(handle, agent_auth).await.map_err(|e| {
                self.discovery.invalidate(&handle.id);
                e.with_provider(mcp_provider_tag(&handle.id, handle.transport.url()))
            })?;

            debug!(handle = %handle.id, tools = listed.len(), "discovered tools");
            self.discovery.put(&handle.id, listed.clone());
            catalog.extend(listed);
        }
        Ok(catalog)
    }

    async fn list_tools(
        &self,
        handle: &McpHandle,
        agent_auth: &HashMap<String, McpAuth>,
    ) -> Result<Vec<ToolDefinition>> {
        let auth = Self::effective_auth(handle, agent_auth);
        let header = self.header_for(auth).await?;
        let conn = self.pool.acquire(handle, auth, header.as_deref()).await?;
        let raw = conn.list_tools().await?;
        Ok(qualify(handle, raw))
    }

    /// Invoke a tool by raw name on the given handle, going through auth
    /// and the pool. The pool slot is released even when the call fails.
    pub async fn call_tool(
        &self,
        handle: &McpHandle,
        raw_name: &str,
        arguments: Value,
        agent_auth: &HashMap<String, McpAuth>,
    ) -> Result<Value> {
        let auth = Self::effective_auth(handle, agent_auth);
        let header = self.header_for(auth).await?;
        let conn = self.pool.acquire(handle, auth, header.as_deref()).await?;
        conn.call_tool(raw_name, arguments)
            .await
            .map_err(|e| e.with_provider(mcp_provider_tag(&handle.id, handle.transport.url())))
    }

    async fn header_for(&self, auth: Option<&McpAuth>) -> Result<Option<String>> {
        match auth {
            Some(auth) => Ok(Some(self.auth.authorization_header(auth).await?)),
            None => Ok(None),
        }
    }

    /// Tear down the pool. Cleanup failures are swallowed; shutdown always
    /// completes.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

/// Discover tools across handles using the process-wide runtime.
pub async fn discover_tools(handles: &[McpHandle]) -> Result<Vec<ToolDefinition>> {
    McpRuntime::global()
        .discover_tools(handles, &HashMap::new())
        .await
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::mcp::handle;
    use crate::mcp::mock::{MockConnector, MockServer};

    fn runtime_with_server(url: &str) -> (Arc<MockServer>, McpRuntime) {
        let server = MockServer::new();
        server.add_fixed_tool(
            "weather",
            json!({"type": "object", "properties": {"city": {"type": "string"}}}),
            json!({"forecast": "sunny"}),
        );
        let connector = MockConnector::new();
        connector.register(url, Arc::clone(&server));
        (server, McpRuntime::with_connector(connector))
    }

    #[tokio::test]
    async fn discovery_within_ttl_skips_transport() {
        let (server, runtime) = runtime_with_server("http://w/mcp");
        let handles = [handle::http("http://w/mcp")];

        let first = runtime.discover_tools(&handles, &HashMap::new()).await.unwrap();
        let second = runtime.discover_tools(&handles, &HashMap::new()).await.unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(second[0].name, first[0].name);
        assert_eq!(server.list_calls(), 1);
    }

    #[tokio::test]
    async fn discovery_failure_is_retryable_and_invalidates() {
        let server = MockServer::new();
        server.add_fixed_tool("t", json!({"type": "object"}), json!(null));
        let connector = MockConnector::new();
        connector.register("http://w/mcp", server);
        connector.fail_next_connects("http://w/mcp", 1);
        let runtime = McpRuntime::with_connector(Arc::clone(&connector));
        let handles = [handle::http("http://w/mcp")];

        let err = runtime
            .discover_tools(&handles, &HashMap::new())
            .await
            .unwrap_err();
        assert!(err.retryable());

        // Next attempt reaches the (now healthy) transport.
        let tools = runtime.discover_tools(&handles, &HashMap::new()).await.unwrap();
        assert_eq!(tools.len(), 1);
    }

    #[tokio::test]
    async fn call_tool_releases_pool_slot() {
        let (_, runtime) = runtime_with_server("http://w/mcp");
        let handle = handle::http("http://w/mcp");

        let out = runtime
            .call_tool(&handle, "weather", json!({"city": "SF"}), &HashMap::new())
            .await
            .unwrap();
        assert_eq!(out, json!({"forecast": "sunny"}));
        assert_eq!(runtime.pool().busy_total(), 0);
    }

    #[tokio::test]
    async fn per_handle_auth_overrides_agent_map() {
        let handle = handle::http("http://w/mcp").bearer("handle-token");
        let mut agent_auth = HashMap::new();
        agent_auth.insert(
            "http://w/mcp".to_string(),
            McpAuth::Bearer {
                token: "agent-token".to_string(),
            },
        );

        let auth = McpRuntime::effective_auth(&handle, &agent_auth).unwrap();
        assert!(matches!(auth, McpAuth::Bearer { token } if token == "handle-token"));
    }

    #[tokio::test]
    async fn stdio_ignores_auth() {
        let handle = handle::stdio("python", &["srv.py"]).bearer("tok");
        let agent_auth = HashMap::new();
        assert!(McpRuntime::effective_auth(&handle, &agent_auth).is_none());
    }
}
