//! Single-step execution.
//!
//! Dispatches one leaf step (LLM, explicit tool call, or automatic tool
//! selection) under the step's retry policy and per-attempt timeout, and
//! annotates the result with timings. `duration_ms` covers only the
//! attempt that succeeded.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use tracing::debug;

use crate::error::{Error, Result};
use crate::llm::{SharedLlm, llm_provider_tag};
use crate::mcp::McpRuntime;
use crate::telemetry::SharedTelemetry;

use super::context;
use super::options::{AgentOptions, OnToken, TokenMeta};
use super::result::{StepResult, ToolCallRecord};
use super::retry::{RetryPolicy, run_with_retry};
use super::step::{AutoStep, LlmStep, McpStep, StepConfig};
use super::tool_loop::{DEFAULT_MAX_TOOL_ITERATIONS, ToolLoop};

/// Everything a leaf step needs to execute.
pub(crate) struct ExecCtx<'a> {
    pub options: &'a AgentOptions,
    pub runtime: &'a Arc<McpRuntime>,
    pub telemetry: &'a SharedTelemetry,
    pub on_token: Option<&'a OnToken>,
    pub step_index: usize,
}

impl ExecCtx<'_> {
    fn step_id(&self) -> String {
        format!("step-{}", self.step_index)
    }

    fn effective_timeout(&self, config: &StepConfig) -> Option<std::time::Duration> {
        config
            .timeout
            .or(self.options.timeout)
            .map(std::time::Duration::from_secs_f64)
    }

    fn effective_retry(&self, config: &StepConfig) -> RetryPolicy {
        config.retry.or(self.options.retry).unwrap_or_default()
    }

    fn fragment(&self, config: &StepConfig, prev: Option<&StepResult>) -> String {
        let max_chars = config
            .context_max_chars
            .or(self.options.context_max_chars)
            .unwrap_or(context::DEFAULT_CONTEXT_MAX_CHARS);
        let max_tools = config
            .context_max_tool_results
            .or(self.options.context_max_tool_results)
            .unwrap_or(context::DEFAULT_CONTEXT_MAX_TOOL_RESULTS);
        context::build_fragment(prev, max_chars, max_tools)
    }

    fn resolve_llm<'b>(&'b self, step_llm: Option<&'b SharedLlm>) -> Result<&'b SharedLlm> {
        step_llm.or(self.options.llm.as_ref()).ok_or_else(|| {
            Error::configuration(format!("{} has no LLM configured", self.step_id()))
        })
    }

    /// Compose the prompt the model will see: instructions prefix, then the
    /// user prompt with the context fragment appended.
    fn compose_prompt(
        &self,
        instructions: Option<&str>,
        prompt: &str,
        fragment: &str,
    ) -> String {
        let instructions = instructions.or(self.options.instructions.as_deref());
        match instructions {
            Some(prefix) => format!("{prefix}\n\n{prompt}{fragment}"),
            None => format!("{prompt}{fragment}"),
        }
    }
}

/// Execute an LLM-only step.
pub(crate) async fn execute_llm(
    step: &LlmStep,
    prev: Option<&StepResult>,
    ctx: &ExecCtx<'_>,
) -> Result<StepResult> {
    let llm = ctx.resolve_llm(step.llm.as_ref())?;
    let fragment = ctx.fragment(&step.config, prev);
    let prompt = ctx.compose_prompt(step.instructions.as_deref(), &step.prompt, &fragment);
    let policy = ctx.effective_retry(&step.config);
    let timeout = ctx.effective_timeout(&step.config);

    run_with_retry(&policy, timeout, ctx.telemetry, &ctx.step_id(), |attempt| {
        let prompt = prompt.clone();
        async move {
            debug!(step = ctx.step_index, attempt, "LLM step attempt");
            let started = Instant::now();
            ctx.telemetry.span_start("llm.generate", &[("model", llm.model().to_string())]);
            ctx.telemetry.counter("llm.call", 1);

            let generated = generate(llm, &prompt, ctx).await;
            let llm_ms = started.elapsed().as_millis() as u64;
            ctx.telemetry.span_end("llm.generate", generated.is_ok());
            ctx.telemetry.duration("llm.duration", llm_ms);

            let output = generated.map_err(|e| {
                e.with_step(ctx.step_id()).with_provider(llm_provider_tag(&**llm))
            })?;
            record_usage(llm, ctx.telemetry);

            Ok(StepResult {
                prompt: Some(prompt),
                llm_output: Some(output),
                duration_ms: started.elapsed().as_millis() as u64,
                llm_ms,
                ..StepResult::default()
            })
        }
    })
    .await
}

/// Execute an explicit tool invocation, with its optional preceding LLM
/// turn.
pub(crate) async fn execute_mcp(
    step: &McpStep,
    prev: Option<&StepResult>,
    ctx: &ExecCtx<'_>,
) -> Result<StepResult> {
    let fragment = ctx.fragment(&step.config, prev);
    let policy = ctx.effective_retry(&step.config);
    let timeout = ctx.effective_timeout(&step.config);

    run_with_retry(&policy, timeout, ctx.telemetry, &ctx.step_id(), |attempt| {
        let fragment = fragment.clone();
        async move {
            debug!(step = ctx.step_index, attempt, tool = %step.tool, "explicit MCP step attempt");
            let started = Instant::now();
            let mut llm_ms = 0;
            let mut llm_output = None;
            let mut seen_prompt = None;

            if let Some(prompt) = &step.prompt {
                let llm = ctx.resolve_llm(step.llm.as_ref())?;
                let prompt = ctx.compose_prompt(None, prompt, &fragment);
                let llm_started = Instant::now();
                ctx.telemetry.counter("llm.call", 1);
                let output = llm.generate(&prompt).await.map_err(|e| {
                    e.with_step(ctx.step_id()).with_provider(llm_provider_tag(&**llm))
                })?;
                llm_ms = llm_started.elapsed().as_millis() as u64;
                ctx.telemetry.duration("llm.duration", llm_ms);
                record_usage(llm, ctx.telemetry);
                llm_output = Some(output);
                seen_prompt = Some(prompt);
            }

            let qualified = format!("{}.{}", step.mcp.id, step.tool);
            let catalog = ctx
                .runtime
                .discover_tools(std::slice::from_ref(&step.mcp), &ctx.options.mcp_auth)
                .await
                .map_err(|e| e.with_step(ctx.step_id()))?;
            let def = catalog
                .iter()
                .find(|d| d.name == qualified)
                .ok_or_else(|| {
                    Error::mcp_tool(&qualified, "not exposed by the server").with_step(ctx.step_id())
                })?;
            ctx.runtime
                .validator()
                .validate(&qualified, &def.parameters, &step.args)
                .map_err(|e| e.with_step(ctx.step_id()))?;

            ctx.telemetry.span_start("mcp.call", &[("tool", qualified.clone())]);
            ctx.telemetry.counter("mcp.call", 1);
            let call_started = Instant::now();
            let invoked = ctx
                .runtime
                .call_tool(&step.mcp, &step.tool, step.args.clone(), &ctx.options.mcp_auth)
                .await;
            ctx.telemetry.span_end("mcp.call", invoked.is_ok());
            let result = invoked.map_err(|e| e.with_step(ctx.step_id()))?;

            let record = ToolCallRecord {
                name: qualified,
                endpoint: step.mcp.transport.descriptor(),
                result,
                ms: call_started.elapsed().as_millis() as u64,
            };

            Ok(StepResult {
                prompt: seen_prompt,
                llm_output,
                mcp: Some(step.mcp.id.clone()),
                tool_calls: Some(vec![record]),
                duration_ms: started.elapsed().as_millis() as u64,
                llm_ms,
                ..StepResult::default()
            })
        }
    })
    .await
}

/// Execute an automatic tool-selection step.
pub(crate) async fn execute_auto(
    step: &AutoStep,
    prev: Option<&StepResult>,
    ctx: &ExecCtx<'_>,
) -> Result<StepResult> {
    let llm = ctx.resolve_llm(step.llm.as_ref())?;
    let fragment = ctx.fragment(&step.config, prev);
    let prompt = ctx.compose_prompt(None, &step.prompt, &fragment);
    let policy = ctx.effective_retry(&step.config);
    let timeout = ctx.effective_timeout(&step.config);
    let max_iterations = step
        .max_tool_iterations
        .or(ctx.options.max_tool_iterations)
        .unwrap_or(DEFAULT_MAX_TOOL_ITERATIONS);

    run_with_retry(&policy, timeout, ctx.telemetry, &ctx.step_id(), |attempt| {
        let prompt = prompt.clone();
        async move {
            debug!(step = ctx.step_index, attempt, "auto tool step attempt");
            let started = Instant::now();
            let tool_loop = ToolLoop {
                llm,
                runtime: ctx.runtime,
                agent_auth: &ctx.options.mcp_auth,
                max_iterations,
                disable_parallel: ctx.options.disable_parallel_tool_execution,
                telemetry: ctx.telemetry,
            };
            let outcome = tool_loop
                .run(&prompt, &step.mcps)
                .await
                .map_err(|e| e.with_step(ctx.step_id()))?;

            Ok(StepResult {
                prompt: Some(prompt),
                llm_output: outcome.llm_output,
                tool_calls: Some(outcome.tool_calls),
                duration_ms: started.elapsed().as_millis() as u64,
                llm_ms: outcome.llm_ms,
                ..StepResult::default()
            })
        }
    })
    .await
}

/// Generate, streaming through the token callback when one is registered.
async fn generate(llm: &SharedLlm, prompt: &str, ctx: &ExecCtx<'_>) -> Result<String> {
    let Some(on_token) = ctx.on_token else {
        return llm.generate(prompt).await;
    };

    let meta = TokenMeta {
        step_index: ctx.step_index,
        llm_id: llm.id().to_string(),
        model: llm.model().to_string(),
    };
    let mut stream = llm.generate_stream(prompt).await?;
    let mut output = String::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        on_token(&chunk, &meta);
        output.push_str(&chunk);
    }
    Ok(output)
}

fn record_usage(llm: &SharedLlm, telemetry: &SharedTelemetry) {
    if let Some(usage) = llm.usage() {
        telemetry.counter("llm.tokens.input", usage.input_tokens);
        telemetry.counter("llm.tokens.output", usage.output_tokens);
        telemetry.counter("llm.tokens.total", usage.total_tokens);
        telemetry.counter("agent.tokens", usage.total_tokens);
    }
}
