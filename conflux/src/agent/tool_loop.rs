//! The automatic tool-calling loop.
//!
//! Given a prompt and a set of tool servers, the loop discovers the
//! qualified tool catalog, then alternates between tool-augmented LLM turns
//! and tool execution until the model produces a final answer or the hop
//! limit is reached. Multiple tool calls in one turn may run concurrently
//! under a conservative heuristic; results are always recorded in the order
//! the model emitted the calls.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::llm::{SharedLlm, ToolCallRequest};
use crate::mcp::{McpAuth, McpHandle, McpRuntime, ToolDefinition};
use crate::telemetry::SharedTelemetry;

use super::result::ToolCallRecord;

/// Default hop limit for the loop.
pub const DEFAULT_MAX_TOOL_ITERATIONS: u32 = 4;

/// Canonical output when no tools could be discovered.
pub const NO_TOOLS_OUTPUT: &str = "No tools available";

/// What the loop produced.
#[derive(Debug, Default)]
pub(crate) struct ToolLoopOutcome {
    pub llm_output: Option<String>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub llm_ms: u64,
}

pub(crate) struct ToolLoop<'a> {
    pub llm: &'a SharedLlm,
    pub runtime: &'a Arc<McpRuntime>,
    pub agent_auth: &'a HashMap<String, McpAuth>,
    pub max_iterations: u32,
    pub disable_parallel: bool,
    pub telemetry: &'a SharedTelemetry,
}

impl ToolLoop<'_> {
    /// Run the loop to completion.
    pub async fn run(&self, prompt: &str, handles: &[McpHandle]) -> Result<ToolLoopOutcome> {
        let catalog = self
            .runtime
            .discover_tools(handles, self.agent_auth)
            .await?;
        if catalog.is_empty() {
            debug!("no tools discovered; short-circuiting");
            return Ok(ToolLoopOutcome {
                llm_output: Some(NO_TOOLS_OUTPUT.to_string()),
                tool_calls: Vec::new(),
                llm_ms: 0,
            });
        }

        let mut outcome = ToolLoopOutcome::default();
        let mut working = prompt.to_string();

        for round in 0..self.max_iterations {
            let started = Instant::now();
            self.telemetry.counter("llm.call", 1);
            let turn = self.llm.generate_with_tools(&working, &catalog).await?;
            let elapsed = started.elapsed().as_millis() as u64;
            outcome.llm_ms += elapsed;
            self.telemetry.duration("llm.duration", elapsed);
            self.record_usage();

            if turn.tool_calls.is_empty() {
                outcome.llm_output = turn.content;
                return Ok(outcome);
            }

            debug!(round, calls = turn.tool_calls.len(), "executing tool batch");
            outcome.llm_output = turn.content;
            let records = self.execute_batch(&catalog, &turn.tool_calls).await?;

            working.push_str("\n\n[Tool results]\n");
            for record in &records {
                let serialized = serde_json::to_string(&record.result)
                    .unwrap_or_else(|_| "<unserializable>".to_string());
                working.push_str(&format!("- {} -> {serialized}\n", record.name));
            }
            outcome.tool_calls.extend(records);
        }

        // Hop limit reached; keep whatever content the last turn produced.
        Ok(outcome)
    }

    /// Execute one batch of requested calls, preserving emission order in
    /// the returned records.
    async fn execute_batch(
        &self,
        catalog: &[ToolDefinition],
        calls: &[ToolCallRequest],
    ) -> Result<Vec<ToolCallRecord>> {
        let mut resolved = Vec::with_capacity(calls.len());
        for call in calls {
            let def = catalog.iter().find(|d| d.name == call.name).ok_or_else(|| {
                Error::mcp_tool(&call.name, "not in the discovered catalog")
            })?;
            self.runtime
                .validator()
                .validate(&call.name, &def.parameters, &call.arguments)?;
            resolved.push((def, call));
        }

        let concurrent = !self.disable_parallel && batch_is_parallelizable(calls);
        if concurrent {
            let futures: Vec<_> = resolved
                .into_iter()
                .map(|(def, call)| self.invoke(def, call))
                .collect();
            futures::future::join_all(futures)
                .await
                .into_iter()
                .collect()
        } else {
            let mut records = Vec::with_capacity(resolved.len());
            for (def, call) in resolved {
                records.push(self.invoke(def, call).await?);
            }
            Ok(records)
        }
    }

    async fn invoke(
        &self,
        def: &ToolDefinition,
        call: &ToolCallRequest,
    ) -> Result<ToolCallRecord> {
        self.telemetry.counter("mcp.call", 1);
        let started = Instant::now();
        let result = self
            .runtime
            .call_tool(
                &def.handle,
                def.raw_name(),
                call.arguments.clone(),
                self.agent_auth,
            )
            .await?;
        Ok(ToolCallRecord {
            name: call.name.clone(),
            endpoint: def.handle.transport.descriptor(),
            result,
            ms: started.elapsed().as_millis() as u64,
        })
    }

    fn record_usage(&self) {
        if let Some(usage) = self.llm.usage() {
            self.telemetry.counter("llm.tokens.input", usage.input_tokens);
            self.telemetry.counter("llm.tokens.output", usage.output_tokens);
            self.telemetry.counter("llm.tokens.total", usage.total_tokens);
            self.telemetry.counter("agent.tokens", usage.total_tokens);
        }
    }
}

/// Conservative heuristic deciding whether a batch may run concurrently:
/// every call names the same tool, every call carries a non-empty ID-like
/// top-level argument, and the IDs are pairwise distinct. Only top-level
/// keys are examined.
pub(crate) fn batch_is_parallelizable(calls: &[ToolCallRequest]) -> bool {
    if calls.len() < 2 {
        return false;
    }
    let first = &calls[0].name;
    if !calls.iter().all(|c| &c.name == first) {
        return false;
    }

    let mut seen = HashSet::with_capacity(calls.len());
    for call in calls {
        let Some(object) = call.arguments.as_object() else {
            return false;
        };
        let Some(id) = object.iter().find(|(k, _)| is_id_like(k)).map(|(_, v)| v) else {
            return false;
        };
        let key = match id {
            Value::String(s) if !s.is_empty() => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return false,
        };
        if !seen.insert(key) {
            return false;
        }
    }
    true
}

fn is_id_like(key: &str) -> bool {
    key.eq_ignore_ascii_case("id") || key.to_ascii_lowercase().ends_with("id")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn call(name: &str, args: Value) -> ToolCallRequest {
        ToolCallRequest::new(name, args)
    }

    #[test]
    fn single_call_is_sequential() {
        assert!(!batch_is_parallelizable(&[call("a.t", json!({"id": "1"}))]));
    }

    #[test]
    fn distinct_ids_on_same_tool_parallelize() {
        assert!(batch_is_parallelizable(&[
            call("a.t", json!({"id": "1"})),
            call("a.t", json!({"id": "2"})),
        ]));
        assert!(batch_is_parallelizable(&[
            call("a.t", json!({"userId": 7})),
            call("a.t", json!({"userId": 8})),
        ]));
    }

    #[test]
    fn mixed_tools_stay_sequential() {
        assert!(!batch_is_parallelizable(&[
            call("a.t", json!({"id": "1"})),
            call("a.u", json!({"id": "2"})),
        ]));
    }

    #[test]
    fn missing_or_duplicate_ids_stay_sequential() {
        assert!(!batch_is_parallelizable(&[
            call("a.t", json!({"city": "SF"})),
            call("a.t", json!({"city": "NY"})),
        ]));
        assert!(!batch_is_parallelizable(&[
            call("a.t", json!({"id": "1"})),
            call("a.t", json!({"id": "1"})),
        ]));
        assert!(!batch_is_parallelizable(&[
            call("a.t", json!({"id": ""})),
            call("a.t", json!({"id": "2"})),
        ]));
    }

    #[test]
    fn only_top_level_keys_are_inspected() {
        assert!(!batch_is_parallelizable(&[
            call("a.t", json!({"query": {"id": "1"}})),
            call("a.t", json!({"query": {"id": "2"}})),
        ]));
    }
}
