//! Agent-level options and per-run configuration.

use std::collections::HashMap;
use std::sync::Arc;

use crate::llm::SharedLlm;
use crate::mcp::{McpAuth, McpRuntime};
use crate::telemetry::SharedTelemetry;

use super::result::StepResult;
use super::retry::RetryPolicy;

/// Options shared by every step of an agent. Per-step overrides take
/// precedence over these.
#[derive(Clone, Default)]
pub struct AgentOptions {
    /// Default LLM for steps that do not name one.
    pub llm: Option<SharedLlm>,
    /// System instructions prefixed to every LLM prompt.
    pub instructions: Option<String>,
    /// Default per-attempt timeout, in seconds.
    pub timeout: Option<f64>,
    /// Default retry policy.
    pub retry: Option<RetryPolicy>,
    /// Character cap for context fragments.
    pub context_max_chars: Option<usize>,
    /// Number of trailing tool results carried in context fragments.
    pub context_max_tool_results: Option<usize>,
    /// Agent-level auth, keyed by endpoint URL. Per-handle auth wins.
    pub mcp_auth: HashMap<String, McpAuth>,
    /// Hop limit for the automatic tool-calling loop.
    pub max_tool_iterations: Option<u32>,
    /// Force sequential execution of batched tool calls.
    pub disable_parallel_tool_execution: bool,
    /// Agent name, used in telemetry tags.
    pub name: Option<String>,
    /// Telemetry observer; defaults to no-op.
    pub telemetry: Option<SharedTelemetry>,
    /// MCP runtime override; defaults to the process-wide runtime.
    pub runtime: Option<Arc<McpRuntime>>,
}

impl std::fmt::Debug for AgentOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentOptions")
            .field("name", &self.name)
            .field("has_llm", &self.llm.is_some())
            .field("timeout", &self.timeout)
            .field("max_tool_iterations", &self.max_tool_iterations)
            .finish_non_exhaustive()
    }
}

impl AgentOptions {
    /// Create empty options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default LLM.
    #[must_use]
    pub fn with_llm(mut self, llm: impl Into<SharedLlm>) -> Self {
        self.llm = Some(llm.into());
        self
    }

    /// Set system instructions.
    #[must_use]
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Set the default per-attempt timeout in seconds.
    #[must_use]
    pub const fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    /// Set the default retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Cap context fragments at `chars` characters.
    #[must_use]
    pub const fn with_context_max_chars(mut self, chars: usize) -> Self {
        self.context_max_chars = Some(chars);
        self
    }

    /// Carry the last `count` tool results in context fragments.
    #[must_use]
    pub const fn with_context_max_tool_results(mut self, count: usize) -> Self {
        self.context_max_tool_results = Some(count);
        self
    }

    /// Attach agent-level auth for an endpoint URL.
    #[must_use]
    pub fn with_mcp_auth(mut self, url: impl Into<String>, auth: McpAuth) -> Self {
        self.mcp_auth.insert(url.into(), auth);
        self
    }

    /// Set the tool-loop hop limit.
    #[must_use]
    pub const fn with_max_tool_iterations(mut self, iterations: u32) -> Self {
        self.max_tool_iterations = Some(iterations);
        self
    }

    /// Force sequential execution of batched tool calls.
    #[must_use]
    pub const fn without_parallel_tools(mut self) -> Self {
        self.disable_parallel_tool_execution = true;
        self
    }

    /// Name the agent.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Attach a telemetry observer.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: SharedTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Use a dedicated MCP runtime instead of the process-wide one.
    #[must_use]
    pub fn with_runtime(mut self, runtime: Arc<McpRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }
}

/// Provenance attached to every streamed token chunk.
#[derive(Debug, Clone)]
pub struct TokenMeta {
    /// Index of the step the chunk belongs to.
    pub step_index: usize,
    /// Id of the LLM handle that produced it.
    pub llm_id: String,
    /// Model name.
    pub model: String,
}

/// Step-completion callback.
pub type OnStep = Arc<dyn Fn(&StepResult, usize) + Send + Sync>;
/// Token-chunk callback.
pub type OnToken = Arc<dyn Fn(&str, &TokenMeta) + Send + Sync>;

/// Per-run callbacks for [`Agent::run_with`](crate::agent::Agent::run_with)
/// and [`Agent::stream_with`](crate::agent::Agent::stream_with).
#[derive(Clone, Default)]
pub struct RunConfig {
    /// Invoked after each step completes, with the step index.
    pub on_step: Option<OnStep>,
    /// Invoked for every streamed token chunk.
    pub on_token: Option<OnToken>,
}

impl std::fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunConfig")
            .field("on_step", &self.on_step.is_some())
            .field("on_token", &self.on_token.is_some())
            .finish()
    }
}

impl RunConfig {
    /// Create an empty config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step-completion callback.
    #[must_use]
    pub fn on_step(mut self, callback: impl Fn(&StepResult, usize) + Send + Sync + 'static) -> Self {
        self.on_step = Some(Arc::new(callback));
        self
    }

    /// Register a token-chunk callback.
    #[must_use]
    pub fn on_token(mut self, callback: impl Fn(&str, &TokenMeta) + Send + Sync + 'static) -> Self {
        self.on_token = Some(Arc::new(callback));
        self
    }
}
