//! The LLM capability contract.
//!
//! Provider SDKs live outside this crate; the runtime only depends on the
//! [`LlmHandle`] trait. A handle supplies single-shot completion, streamed
//! completion, tool-augmented generation, and last-call token usage.

mod mock;

pub use mock::{MockLlm, MockTurn};

use std::sync::Arc;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::mcp::ToolDefinition;

/// A shared, dynamically-dispatched LLM handle.
pub type SharedLlm = Arc<dyn LlmHandle>;

/// A lazily-produced sequence of completion chunks.
pub type TokenStream = BoxStream<'static, Result<String>>;

/// One tool invocation requested by the LLM.
///
/// `name` is the qualified `<handleId>.<tool>` name from the catalog the
/// model was shown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Qualified tool name.
    pub name: String,
    /// Arguments as a JSON object.
    pub arguments: Value,
}

impl ToolCallRequest {
    /// Create a tool call request.
    #[must_use]
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}

/// The outcome of one tool-augmented generation turn.
#[derive(Debug, Clone, Default)]
pub struct LlmTurn {
    /// Textual content, when the model produced any.
    pub content: Option<String>,
    /// Tool calls the model wants executed. Empty means the turn is final.
    pub tool_calls: Vec<ToolCallRequest>,
}

impl LlmTurn {
    /// A final turn carrying only text.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    /// A turn requesting tool invocations.
    #[must_use]
    pub fn tools(tool_calls: Vec<ToolCallRequest>) -> Self {
        Self {
            content: None,
            tool_calls,
        }
    }
}

/// Token usage reported by the backend for the most recent call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    /// Tokens consumed by the prompt.
    pub input_tokens: u64,
    /// Tokens produced by the completion.
    pub output_tokens: u64,
    /// Input plus output.
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Create a usage record; `total_tokens` is derived.
    #[must_use]
    pub const fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}

/// An LLM backend capable of completion, streaming, and tool-augmented
/// generation.
///
/// Implementations wrap a provider SDK client; the runtime assumes nothing
/// beyond these four operations and the identity accessors.
#[async_trait::async_trait]
pub trait LlmHandle: Send + Sync {
    /// Stable identifier for this handle, used in provider tags.
    fn id(&self) -> &str;

    /// The model name, e.g. `gpt-4o-mini`.
    fn model(&self) -> &str;

    /// Single-shot completion.
    async fn generate(&self, prompt: &str) -> Result<String>;

    /// Streamed completion. The stream is finite and non-restartable.
    async fn generate_stream(&self, prompt: &str) -> Result<TokenStream>;

    /// Tool-augmented generation against a qualified tool catalog.
    async fn generate_with_tools(
        &self,
        prompt: &str,
        tools: &[ToolDefinition],
    ) -> Result<LlmTurn>;

    /// Token usage of the most recent call, when the backend reports it.
    fn usage(&self) -> Option<TokenUsage>;
}

/// Provider tag for an LLM handle: the handle id when set, else
/// `llm:<model>`.
#[must_use]
pub(crate) fn llm_provider_tag(llm: &dyn LlmHandle) -> String {
    if llm.id().is_empty() {
        format!("llm:{}", llm.model())
    } else {
        llm.id().to_string()
    }
}
