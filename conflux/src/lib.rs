#![cfg_attr(docsrs, feature(doc_cfg))]
//! Conflux is a Rust library for orchestrating declaratively-composed,
//! multi-step workflows over LLM backends and MCP tool servers.
//!
//! A program is built with the fluent [`agent`] builder from typed steps:
//! plain LLM calls, explicit tool invocations, automatic tool selection,
//! and nested control flow (`parallel`, `branch`, `switch`, `while`,
//! `for_each`, `retry_until`, sub-agent runs). Execution returns a
//! structured history of per-step outcomes with timings and aggregate
//! totals.
//!
//! Provider SDKs stay outside the crate behind the
//! [`LlmHandle`](llm::LlmHandle) contract; tool servers are reached over
//! pooled MCP connections (streamable HTTP or STDIO child processes) with
//! bearer or OAuth2 client-credentials auth.

pub mod agent;
pub mod error;
pub mod llm;
pub mod mcp;
pub mod prelude;
pub mod telemetry;

pub use agent::{
    Agent, AgentBuilder, AgentOptions, RetryPolicy, RunConfig, Step, StepResult, TokenMeta,
    ToolCallRecord, agent,
};
pub use error::{Error, ErrorKind, ErrorMeta, Result};
pub use mcp::{McpAuth, McpHandle, ToolDefinition, discover_tools};
