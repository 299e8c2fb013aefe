//! Error types for the conflux runtime.
//!
//! Every failure is normalized into an [`Error`] carrying an [`ErrorKind`]
//! and [`ErrorMeta`]. The retry engine consults [`Error::retryable`] to
//! decide whether another attempt is allowed.

use std::fmt;

/// A type alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

type BoxedCause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// An attempt exceeded its per-attempt timeout.
    Timeout,
    /// Tool-call arguments failed JSON-schema validation.
    Validation,
    /// The LLM backend failed.
    Llm,
    /// Connecting to or talking to an MCP server failed.
    McpConnection,
    /// The MCP server executed the tool and reported a failure.
    McpTool,
    /// All retry attempts were exhausted.
    RetryExhausted,
    /// A second `run()` was attempted while one was in progress.
    AgentConcurrency,
    /// Invalid configuration detected before any I/O.
    Configuration,
}

impl ErrorKind {
    /// The stable name of this error kind.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Timeout => "TimeoutError",
            Self::Validation => "ValidationError",
            Self::Llm => "LLMError",
            Self::McpConnection => "MCPConnectionError",
            Self::McpTool => "MCPToolError",
            Self::RetryExhausted => "RetryExhaustedError",
            Self::AgentConcurrency => "AgentConcurrencyError",
            Self::Configuration => "ConfigurationError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Metadata attached to every error.
#[derive(Debug, Clone, Default)]
pub struct ErrorMeta {
    /// Identifier of the step that failed, when known.
    pub step_id: Option<String>,
    /// Provider tag: `llm:<model>`, the LLM handle id, or `mcp:<host>`.
    pub provider: Option<String>,
    /// Backend request id, when the provider surfaced one.
    pub request_id: Option<String>,
    /// Whether the retry engine may attempt the operation again.
    pub retryable: bool,
}

/// The error type for all conflux operations.
#[derive(Debug, thiserror::Error)]
#[error("{}: {message}", kind.name())]
pub struct Error {
    kind: ErrorKind,
    message: String,
    meta: ErrorMeta,
    #[source]
    source: Option<BoxedCause>,
}

impl Error {
    fn new(kind: ErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            meta: ErrorMeta {
                retryable,
                ..ErrorMeta::default()
            },
            source: None,
        }
    }

    /// A per-attempt timeout fired. Retryable.
    #[must_use]
    pub fn timeout(ms: u64) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("operation timed out after {ms}ms"),
            true,
        )
    }

    /// Tool arguments failed schema validation. Non-retryable.
    #[must_use]
    pub fn validation(tool: &str, message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Validation,
            format!("invalid arguments for tool '{tool}': {}", message.into()),
            false,
        )
    }

    /// An LLM call failed. Retryability follows the HTTP status: 5xx, 429,
    /// and 408 are retryable; anything else is not.
    #[must_use]
    pub fn llm(message: impl Into<String>, status: Option<u16>) -> Self {
        let retryable = status.is_some_and(|s| s >= 500 || s == 429 || s == 408);
        Self::new(ErrorKind::Llm, message, retryable)
    }

    /// An LLM transport-level failure (no HTTP status). Retryable.
    #[must_use]
    pub fn llm_transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Llm, message, true)
    }

    /// An MCP connection-level failure. Retryable.
    #[must_use]
    pub fn mcp_connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::McpConnection, message, true)
    }

    /// An MCP connection failure caused by misconfiguration. Non-retryable.
    #[must_use]
    pub fn mcp_misconfigured(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::McpConnection, message, false)
    }

    /// The MCP server reported a tool-level failure. Non-retryable: a tool
    /// failure is a semantic result, not a transient fault.
    #[must_use]
    pub fn mcp_tool(tool: &str, message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::McpTool,
            format!("tool '{tool}' failed: {}", message.into()),
            false,
        )
    }

    /// All retry attempts were exhausted. Terminal; wraps the last cause.
    #[must_use]
    pub fn retry_exhausted(attempts: u32, last: Self) -> Self {
        let mut err = Self::new(
            ErrorKind::RetryExhausted,
            format!("all {attempts} attempts failed: {last}"),
            false,
        );
        err.meta.step_id.clone_from(&last.meta.step_id);
        err.meta.provider.clone_from(&last.meta.provider);
        err.source = Some(Box::new(last));
        err
    }

    /// A second concurrent `run()` was attempted. Terminal.
    #[must_use]
    pub fn agent_concurrency() -> Self {
        Self::new(
            ErrorKind::AgentConcurrency,
            "agent is already running; concurrent run() is not allowed",
            false,
        )
    }

    /// Invalid configuration. Terminal, detected before any I/O.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message, false)
    }

    /// Attach the underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<BoxedCause>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Tag the error with the step it occurred in.
    #[must_use]
    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.meta.step_id = Some(step_id.into());
        self
    }

    /// Tag the error with its provider (`llm:<model>` or `mcp:<host>`).
    #[must_use]
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.meta.provider = Some(provider.into());
        self
    }

    /// Tag the error with a backend request id.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.meta.request_id = Some(request_id.into());
        self
    }

    /// The classification of this error.
    #[inline]
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The human-readable message, without the kind prefix.
    #[inline]
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The error metadata.
    #[inline]
    #[must_use]
    pub const fn meta(&self) -> &ErrorMeta {
        &self.meta
    }

    /// Whether the retry engine may attempt the operation again.
    #[inline]
    #[must_use]
    pub const fn retryable(&self) -> bool {
        self.meta.retryable
    }
}

/// Derive a provider tag for an MCP endpoint: the URL host when it parses,
/// otherwise `mcp:<id>`.
#[must_use]
pub(crate) fn mcp_provider_tag(id: &str, endpoint: Option<&str>) -> String {
    endpoint
        .and_then(|e| url::Url::parse(e).ok())
        .and_then(|u| u.host_str().map(|h| format!("mcp:{h}")))
        .unwrap_or_else(|| format!("mcp:{id}"))
}
