//! Per-step results and run aggregation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One tool invocation made during a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    /// Qualified tool name.
    pub name: String,
    /// Endpoint descriptor of the server that ran the tool.
    pub endpoint: String,
    /// The tool result.
    pub result: Value,
    /// Wall time of the invocation.
    pub ms: u64,
}

/// The outcome of one executed step.
///
/// `duration_ms` covers only the successful attempt; failed attempts that
/// were retried are excluded. `llm_ms` is always `<= duration_ms`.
/// Aggregated totals appear only on the final element of a completed
/// [`Agent::run`](crate::agent::Agent::run).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    /// The prompt the LLM actually saw, including any context fragment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Final textual output of the step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_output: Option<String>,
    /// Handle id of the MCP server, for explicit tool steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mcp: Option<String>,
    /// Tool invocations made during the step. Always present (possibly
    /// empty) for automatic tool-selection steps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRecord>>,
    /// Keyed results of a map-form parallel step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel: Option<BTreeMap<String, StepResult>>,
    /// Index-ordered results of a list-form parallel step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_results: Option<Vec<StepResult>>,
    /// Wall time of the successful attempt.
    pub duration_ms: u64,
    /// Time spent inside LLM calls during the successful attempt.
    pub llm_ms: u64,
    /// Sum of `duration_ms` across the run. Final element only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_duration_ms: Option<u64>,
    /// Sum of `llm_ms` across the run. Final element only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_llm_ms: Option<u64>,
    /// Sum of tool-call time across the run. Final element only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_mcp_ms: Option<u64>,
}

impl StepResult {
    /// Tool-call time in this step, including nested parallel children.
    #[must_use]
    pub fn mcp_ms(&self) -> u64 {
        let own: u64 = self
            .tool_calls
            .iter()
            .flatten()
            .map(|c| c.ms)
            .sum();
        let list: u64 = self
            .parallel_results
            .iter()
            .flatten()
            .map(Self::mcp_ms)
            .sum();
        let map: u64 = self.parallel.iter().flat_map(BTreeMap::values).map(Self::mcp_ms).sum();
        own + list + map
    }
}

/// Stamp aggregate totals on the final element of a completed run.
pub(crate) fn stamp_totals(results: &mut [StepResult]) {
    let total_duration: u64 = results.iter().map(|r| r.duration_ms).sum();
    let total_llm: u64 = results.iter().map(|r| r.llm_ms).sum();
    let total_mcp: u64 = results.iter().map(StepResult::mcp_ms).sum();
    if let Some(last) = results.last_mut() {
        last.total_duration_ms = Some(total_duration);
        last.total_llm_ms = Some(total_llm);
        last.total_mcp_ms = Some(total_mcp);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn call(ms: u64) -> ToolCallRecord {
        ToolCallRecord {
            name: "mcp_00000000.t".to_string(),
            endpoint: "http://a/mcp".to_string(),
            result: json!("ok"),
            ms,
        }
    }

    #[test]
    fn mcp_ms_recurses_into_parallel_children() {
        let child = StepResult {
            tool_calls: Some(vec![call(5), call(7)]),
            ..StepResult::default()
        };
        let wrapper = StepResult {
            parallel_results: Some(vec![child.clone()]),
            parallel: Some(BTreeMap::from([("a".to_string(), child)])),
            ..StepResult::default()
        };
        assert_eq!(wrapper.mcp_ms(), 24);
    }

    #[test]
    fn totals_land_on_last_element_only() {
        let mut results = vec![
            StepResult {
                duration_ms: 10,
                llm_ms: 4,
                ..StepResult::default()
            },
            StepResult {
                duration_ms: 20,
                llm_ms: 6,
                tool_calls: Some(vec![call(3)]),
                ..StepResult::default()
            },
        ];
        stamp_totals(&mut results);

        assert!(results[0].total_duration_ms.is_none());
        assert_eq!(results[1].total_duration_ms, Some(30));
        assert_eq!(results[1].total_llm_ms, Some(10));
        assert_eq!(results[1].total_mcp_ms, Some(3));
    }

    #[test]
    fn serializes_camel_case_and_skips_empty() {
        let result = StepResult {
            llm_output: Some("hi".to_string()),
            duration_ms: 12,
            llm_ms: 8,
            ..StepResult::default()
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["llmOutput"], "hi");
        assert_eq!(json["durationMs"], 12);
        assert!(json.get("toolCalls").is_none());
        assert!(json.get("totalDurationMs").is_none());
    }
}
