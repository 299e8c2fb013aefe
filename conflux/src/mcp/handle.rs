//! MCP server handles.
//!
//! A handle is a value object identifying a tool server (HTTP URL or STDIO
//! child process) plus optional auth. Handle ids are derived
//! deterministically from the endpoint so that the same URL always yields
//! the same id, and are kept short so the qualified `<id>.<tool>` name fits
//! the LLM tool-name length budget.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Authentication configuration for an MCP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum McpAuth {
    /// Static bearer token, attached as `Authorization: Bearer <token>`.
    Bearer {
        /// The token value.
        token: String,
    },
    /// OAuth2 client-credentials grant against a token endpoint.
    #[serde(rename_all = "camelCase")]
    OAuth2 {
        /// OAuth client id.
        client_id: String,
        /// OAuth client secret.
        client_secret: String,
        /// Token endpoint URL.
        token_endpoint: String,
    },
}

/// Transport configuration for an MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "transport")]
pub enum TransportConfig {
    /// Remote server speaking plain JSON over a streamable HTTP session.
    Http {
        /// Server URL.
        url: String,
    },
    /// Local child process speaking the framed protocol on its stdio.
    #[serde(rename_all = "camelCase")]
    Stdio {
        /// Command to execute.
        command: String,
        /// Command arguments.
        args: Vec<String>,
        /// Extra environment variables for the child.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        env: Option<HashMap<String, String>>,
    },
}

impl TransportConfig {
    /// A stable descriptor for pool keying and diagnostics.
    #[must_use]
    pub fn descriptor(&self) -> String {
        match self {
            Self::Http { url } => url.clone(),
            Self::Stdio { command, args, .. } => {
                format!("{command} {}", args.join(" "))
            }
        }
    }

    /// The endpoint URL for HTTP transports.
    #[must_use]
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Http { url } => Some(url),
            Self::Stdio { .. } => None,
        }
    }
}

/// A handle to an MCP tool server.
///
/// Created via [`http`] or [`stdio`]. Handles are cheap to clone and carry
/// no live connection; connections are owned by the process-wide pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpHandle {
    /// Deterministic short id (`mcp_<8-hex>` / `mcp_stdio_<8-hex>`).
    pub id: String,
    /// Endpoint transport configuration.
    #[serde(flatten)]
    pub transport: TransportConfig,
    /// Per-handle auth; overrides agent-level auth for this endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<McpAuth>,
}

impl McpHandle {
    /// Attach authentication to this handle.
    #[must_use]
    pub fn with_auth(mut self, auth: McpAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Attach a static bearer token.
    #[must_use]
    pub fn bearer(self, token: impl Into<String>) -> Self {
        self.with_auth(McpAuth::Bearer {
            token: token.into(),
        })
    }

    /// Attach OAuth2 client-credentials auth.
    #[must_use]
    pub fn oauth2(
        self,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        token_endpoint: impl Into<String>,
    ) -> Self {
        self.with_auth(McpAuth::OAuth2 {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token_endpoint: token_endpoint.into(),
        })
    }
}

/// Create a handle for a remote HTTP MCP server.
#[must_use]
pub fn http(url: impl Into<String>) -> McpHandle {
    let url = url.into();
    McpHandle {
        id: format!("mcp_{}", short_hash(&url)),
        transport: TransportConfig::Http { url },
        auth: None,
    }
}

/// Create a handle for a local STDIO MCP server process.
#[must_use]
pub fn stdio(command: impl Into<String>, args: &[&str]) -> McpHandle {
    let command = command.into();
    let args: Vec<String> = args.iter().map(|a| (*a).to_string()).collect();
    let fingerprint = format!("{command} {}", args.join(" "));
    McpHandle {
        id: format!("mcp_stdio_{}", short_hash(&fingerprint)),
        transport: TransportConfig::Stdio {
            command,
            args,
            env: None,
        },
        auth: None,
    }
}

/// 8-hex-digit deterministic hash of the endpoint fingerprint.
fn short_hash(input: &str) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    input.hash(&mut hasher);
    format!("{:08x}", hasher.finish() as u32)
}
