//! Scriptable mock LLM for testing.
//!
//! [`MockLlm`] plays back a fixed script of turns, records every prompt it
//! sees, and can delay individual turns to exercise timeout paths. No real
//! API calls are made.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::mcp::ToolDefinition;

use super::{LlmHandle, LlmTurn, TokenStream, TokenUsage, ToolCallRequest};

/// One scripted reply.
#[derive(Debug, Clone)]
pub struct MockTurn {
    reply: LlmTurn,
    delay: Option<Duration>,
    fail: Option<u16>,
}

impl MockTurn {
    /// A plain text reply.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            reply: LlmTurn::text(content),
            delay: None,
            fail: None,
        }
    }

    /// A reply requesting tool calls.
    #[must_use]
    pub fn tool_calls(calls: Vec<ToolCallRequest>) -> Self {
        Self {
            reply: LlmTurn::tools(calls),
            delay: None,
            fail: None,
        }
    }

    /// A reply that fails with the given HTTP status.
    #[must_use]
    pub fn failure(status: u16) -> Self {
        Self {
            reply: LlmTurn::default(),
            delay: None,
            fail: Some(status),
        }
    }

    /// Sleep for `delay` before replying.
    #[must_use]
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// A mock LLM that replays a script of [`MockTurn`]s in order.
///
/// The last turn repeats once the script is exhausted. Every prompt passed
/// to any generation method is recorded and available via
/// [`MockLlm::prompts`].
pub struct MockLlm {
    id: String,
    model: String,
    script: Vec<MockTurn>,
    cursor: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    usage: Mutex<Option<TokenUsage>>,
}

impl std::fmt::Debug for MockLlm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockLlm")
            .field("model", &self.model)
            .field("script", &self.script.len())
            .finish_non_exhaustive()
    }
}

impl MockLlm {
    /// Create a mock from a turn script.
    #[must_use]
    pub fn new(script: Vec<MockTurn>) -> Self {
        Self {
            id: String::new(),
            model: "mock-model".to_string(),
            script,
            cursor: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            usage: Mutex::new(None),
        }
    }

    /// Create a mock replying with the given texts in order.
    #[must_use]
    pub fn texts(replies: &[&str]) -> Self {
        Self::new(replies.iter().map(|r| MockTurn::text(*r)).collect())
    }

    /// Override the handle id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Override the model name.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Report fixed token usage after every call.
    #[must_use]
    pub fn with_usage(self, usage: TokenUsage) -> Self {
        *self.usage.lock() = Some(usage);
        self
    }

    /// Every prompt seen so far, in call order.
    #[must_use]
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    /// Number of generation calls made so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    async fn next_turn(&self, prompt: &str) -> Result<LlmTurn> {
        self.prompts.lock().push(prompt.to_string());
        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        let turn = self
            .script
            .get(index.min(self.script.len().saturating_sub(1)))
            .cloned()
            .unwrap_or_else(|| MockTurn::text("No response"));

        if let Some(delay) = turn.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(status) = turn.fail {
            return Err(Error::llm(format!("mock failure (status {status})"), Some(status)));
        }
        Ok(turn.reply)
    }
}

#[async_trait::async_trait]
impl LlmHandle for MockLlm {
    fn id(&self) -> &str {
        &self.id
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let turn = self.next_turn(prompt).await?;
        Ok(turn.content.unwrap_or_default())
    }

    async fn generate_stream(&self, prompt: &str) -> Result<TokenStream> {
        let content = self.generate(prompt).await?;
        // Chunk on whitespace boundaries to exercise reassembly.
        let chunks: Vec<Result<String>> = content
            .split_inclusive(' ')
            .map(|c| Ok(c.to_string()))
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn generate_with_tools(
        &self,
        prompt: &str,
        _tools: &[ToolDefinition],
    ) -> Result<LlmTurn> {
        self.next_turn(prompt).await
    }

    fn usage(&self) -> Option<TokenUsage> {
        *self.usage.lock()
    }
}

/// Convenience: wrap a mock in the shared handle type.
impl From<MockLlm> for Arc<dyn LlmHandle> {
    fn from(mock: MockLlm) -> Self {
        Arc::new(mock)
    }
}

/// Convenience: tests often keep an `Arc<MockLlm>` to inspect recorded
/// prompts after the run.
impl From<Arc<MockLlm>> for Arc<dyn LlmHandle> {
    fn from(mock: Arc<MockLlm>) -> Self {
        mock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replays_script_in_order() {
        let llm = MockLlm::texts(&["first", "second"]);
        assert_eq!(llm.generate("a").await.unwrap(), "first");
        assert_eq!(llm.generate("b").await.unwrap(), "second");
        // Last turn repeats after exhaustion.
        assert_eq!(llm.generate("c").await.unwrap(), "second");
        assert_eq!(llm.prompts(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn stream_reassembles_to_full_content() {
        let llm = MockLlm::texts(&["hello streaming world"]);
        let mut stream = llm.generate_stream("p").await.unwrap();
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            out.push_str(&chunk.unwrap());
        }
        assert_eq!(out, "hello streaming world");
    }

    #[tokio::test]
    async fn failure_turn_maps_status() {
        let llm = MockLlm::new(vec![MockTurn::failure(429), MockTurn::text("ok")]);
        let err = llm.generate("p").await.unwrap_err();
        assert!(err.retryable());
        assert_eq!(llm.generate("p").await.unwrap(), "ok");
    }
}
