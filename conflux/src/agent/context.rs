//! Context compaction.
//!
//! Builds a bounded textual fragment from the immediately preceding step's
//! result. Fragments are not accumulated across steps; multi-step coherence
//! is the model's responsibility given the compacted snapshot.

use super::result::StepResult;

/// Default character cap for a context fragment.
pub const DEFAULT_CONTEXT_MAX_CHARS: usize = 20480;
/// Default number of trailing tool results included.
pub const DEFAULT_CONTEXT_MAX_TOOL_RESULTS: usize = 8;

const HEADER: &str = "\n\n[Context from previous steps]\n";
const UNSERIALIZABLE: &str = "<unserializable>";

/// Build the context fragment for the step following `prev`. Returns an
/// empty string when there is nothing to carry over.
#[must_use]
pub fn build_fragment(prev: Option<&StepResult>, max_chars: usize, max_tool_results: usize) -> String {
    let Some(prev) = prev else {
        return String::new();
    };

    let mut chunks: Vec<String> = Vec::new();
    if let Some(output) = prev.llm_output.as_deref() {
        if !output.is_empty() {
            chunks.push(format!("Previous LLM answer:\n{output}\n"));
        }
    }

    if let Some(calls) = prev.tool_calls.as_deref() {
        if !calls.is_empty() {
            chunks.push("Previous tool results:\n".to_string());
            let skip = calls.len().saturating_sub(max_tool_results);
            for call in &calls[skip..] {
                let serialized = serde_json::to_string(&call.result)
                    .unwrap_or_else(|_| UNSERIALIZABLE.to_string());
                chunks.push(format!("- {} -> {serialized}\n", call.name));
            }
        }
    }

    if chunks.is_empty() {
        return String::new();
    }

    let mut fragment = String::from(HEADER);
    for chunk in chunks {
        if fragment.len() + chunk.len() > max_chars {
            break;
        }
        fragment.push_str(&chunk);
    }
    fragment
}
