//! Convenience re-exports of the common surface.
//!
//! ```rust,ignore
//! use conflux::prelude::*;
//! ```

pub use crate::agent::{
    Agent, AgentBuilder, AgentOptions, AutoStep, LlmStep, McpStep, Program, RetryPolicy,
    RunConfig, Step, StepResult, TokenMeta, ToolCallRecord, agent,
};
pub use crate::error::{Error, ErrorKind, ErrorMeta, Result};
pub use crate::llm::{LlmHandle, LlmTurn, MockLlm, MockTurn, SharedLlm, TokenUsage, ToolCallRequest};
pub use crate::mcp::{self, McpAuth, McpHandle, McpRuntime, ToolDefinition, discover_tools};
pub use crate::telemetry::{NoopTelemetry, TelemetryObserver, TracingTelemetry};
