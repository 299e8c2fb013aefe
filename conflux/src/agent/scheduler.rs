//! Control-flow interpretation.
//!
//! A program is executed by a single dispatch function over the [`Step`]
//! variant. Control-flow constructs run their bodies as ephemeral
//! sub-programs sharing the parent's options; their results are appended
//! linearly to the history, except `parallel`, which folds its children
//! into one keyed or index-ordered result.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, try_join_all};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::mcp::McpRuntime;
use crate::telemetry::SharedTelemetry;

use super::executor::{ExecCtx, execute_auto, execute_llm, execute_mcp};
use super::options::{AgentOptions, RunConfig};
use super::result::StepResult;
use super::step::{
    HookFn, ParallelBranches, ParallelStep, Program, RetryUntilStep, Step, SwitchStep, WhileStep,
};

/// Safety bound for `while` loops that do not set `max_iterations`.
pub(crate) const DEFAULT_WHILE_MAX_ITERATIONS: u32 = 100;

/// Immutable per-run context shared across the whole program tree.
pub(crate) struct RunCtx<'a> {
    pub options: &'a AgentOptions,
    pub runtime: &'a Arc<McpRuntime>,
    pub telemetry: &'a SharedTelemetry,
    pub config: &'a RunConfig,
    /// Cooperative stop flag; set when the consumer goes away.
    pub cancel: &'a AtomicBool,
}

/// Mutable state threaded through a program.
#[derive(Default)]
pub(crate) struct RunState {
    /// Every result produced, in program order. This is what `run` returns.
    pub history: Vec<StepResult>,
    /// Results visible to the context compactor; cleared by `ResetHistory`.
    pub context: Vec<StepResult>,
    /// Monotonic step counter for ids and callbacks.
    pub step_index: usize,
}

impl RunState {
    fn append(&mut self, result: StepResult, ctx: &RunCtx<'_>) {
        ctx.telemetry.duration("step.duration", result.duration_ms);
        self.history.push(result.clone());
        self.context.push(result);
        self.step_index += 1;
        if let Some(on_step) = &ctx.config.on_step {
            let index = self.history.len() - 1;
            on_step(&self.history[index], index);
        }
    }
}

/// Execute a program, appending results to `state`.
pub(crate) fn run_program<'a>(
    steps: &'a [Step],
    ctx: &'a RunCtx<'a>,
    state: &'a mut RunState,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        for step in steps {
            if ctx.cancel.load(Ordering::SeqCst) {
                debug!("run cancelled; stopping before next step");
                return Ok(());
            }

            // Factories resolve exactly once, immediately before dispatch.
            let resolved;
            let step = match step {
                Step::Factory(factory) => {
                    resolved = factory(&state.history);
                    if matches!(resolved, Step::Factory(_)) {
                        return Err(Error::configuration(
                            "a step factory returned another factory",
                        ));
                    }
                    &resolved
                }
                other => other,
            };

            run_hook("pre", step.config().and_then(|c| c.pre.as_ref()), state, ctx);
            ctx.telemetry.counter("workflow.steps", 1);
            ctx.telemetry
                .span_start("step.execute", &[("kind", step.kind_name().to_string())]);

            let outcome = dispatch(step, ctx, state).await;

            ctx.telemetry.span_end("step.execute", outcome.is_ok());
            run_hook("post", step.config().and_then(|c| c.post.as_ref()), state, ctx);
            outcome?;
        }
        Ok(())
    })
}

async fn dispatch(step: &Step, ctx: &RunCtx<'_>, state: &mut RunState) -> Result<()> {
    match step {
        Step::Llm(llm_step) => {
            let result = execute_llm(llm_step, state.context.last(), &exec_ctx(ctx, state)).await?;
            state.append(result, ctx);
            Ok(())
        }
        Step::McpExplicit(mcp_step) => {
            let result = execute_mcp(mcp_step, state.context.last(), &exec_ctx(ctx, state)).await?;
            state.append(result, ctx);
            Ok(())
        }
        Step::McpAuto(auto_step) => {
            let result = execute_auto(auto_step, state.context.last(), &exec_ctx(ctx, state)).await?;
            state.append(result, ctx);
            Ok(())
        }
        Step::Parallel(parallel) => run_parallel(parallel, ctx, state).await,
        Step::Branch(branch) => {
            let taken = (branch.condition)(&state.history);
            debug!(taken, "branch evaluated");
            let program = if taken { &branch.when_true } else { &branch.when_false };
            run_program(program, ctx, state).await
        }
        Step::Switch(switch) => run_switch(switch, ctx, state).await,
        Step::While(while_step) => run_while(while_step, ctx, state).await,
        Step::ForEach(for_each) => {
            for item in &for_each.items {
                let program = (for_each.body)(item, Program::new());
                run_program(&program.steps, ctx, state).await?;
            }
            Ok(())
        }
        Step::RetryUntil(retry_until) => run_retry_until(retry_until, ctx, state).await,
        Step::RunSubAgent(sub) => run_sub_agent(sub.agent.as_ref(), ctx, state).await,
        Step::ResetHistory => {
            state.context.clear();
            Ok(())
        }
        Step::Factory(_) => Err(Error::configuration(
            "a step factory returned another factory",
        )),
    }
}

fn exec_ctx<'a>(ctx: &'a RunCtx<'a>, state: &RunState) -> ExecCtx<'a> {
    ExecCtx {
        options: ctx.options,
        runtime: ctx.runtime,
        telemetry: ctx.telemetry,
        on_token: ctx.config.on_token.as_ref(),
        step_index: state.step_index,
    }
}

/// Run parallel siblings concurrently and fold them into one result.
///
/// Siblings never share mutable state: each child gets a clone of the
/// current history and context. The first error aborts the batch; sibling
/// futures are dropped, which cancels them at their next suspension point.
async fn run_parallel(
    parallel: &ParallelStep,
    ctx: &RunCtx<'_>,
    state: &mut RunState,
) -> Result<()> {
    let started = Instant::now();
    // Children stream tokens but do not fire per-step callbacks; only the
    // folded result is appended to the parent history.
    let quiet = RunConfig {
        on_step: None,
        on_token: ctx.config.on_token.clone(),
    };
    let child_ctx = RunCtx {
        options: ctx.options,
        runtime: ctx.runtime,
        telemetry: ctx.telemetry,
        config: &quiet,
        cancel: ctx.cancel,
    };

    async fn run_child(
        child: &Step,
        child_ctx: &RunCtx<'_>,
        state: &RunState,
    ) -> Result<StepResult> {
        let steps = std::slice::from_ref(child);
        let mut child_state = RunState {
            history: state.history.clone(),
            context: state.context.clone(),
            step_index: state.step_index,
        };
        let base = child_state.history.len();
        run_program(steps, child_ctx, &mut child_state).await?;
        // A control-flow child may append several results; its last one
        // stands for the branch.
        Ok(child_state.history.drain(base..).next_back().unwrap_or_default())
    }

    let mut result = StepResult::default();
    match &parallel.branches {
        ParallelBranches::List(children) => {
            let outcomes = try_join_all(children.iter().map(|child| run_child(child, &child_ctx, state))).await?;
            result.llm_ms = outcomes.iter().map(|r| r.llm_ms).max().unwrap_or(0);
            result.parallel_results = Some(outcomes);
        }
        ParallelBranches::Map(children) => {
            let keys: Vec<&String> = children.keys().collect();
            let outcomes = try_join_all(children.values().map(|child| run_child(child, &child_ctx, state))).await?;
            let folded: BTreeMap<String, StepResult> = keys
                .into_iter()
                .cloned()
                .zip(outcomes)
                .collect();
            result.llm_ms = folded.values().map(|r| r.llm_ms).max().unwrap_or(0);
            result.parallel = Some(folded);
        }
    }
    result.duration_ms = (started.elapsed().as_millis() as u64).max(result.llm_ms);
    state.append(result, ctx);
    Ok(())
}

async fn run_switch(switch: &SwitchStep, ctx: &RunCtx<'_>, state: &mut RunState) -> Result<()> {
    let selected = (switch.selector)(&state.history);
    debug!(case = %selected, "switch evaluated");
    if let Some(program) = switch.cases.get(&selected) {
        return run_program(program, ctx, state).await;
    }
    if let Some(default) = &switch.default {
        return run_program(default, ctx, state).await;
    }
    // No case, no default: the construct yields zero results.
    Ok(())
}

async fn run_while(while_step: &WhileStep, ctx: &RunCtx<'_>, state: &mut RunState) -> Result<()> {
    let max_iterations = while_step
        .max_iterations
        .unwrap_or(DEFAULT_WHILE_MAX_ITERATIONS);
    let deadline = while_step
        .timeout
        .map(|seconds| Instant::now() + Duration::from_secs_f64(seconds));

    let mut iterations = 0;
    while iterations < max_iterations {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                debug!(iterations, "while loop hit its total timeout");
                break;
            }
        }
        if !(while_step.condition)(&state.history) {
            break;
        }
        run_program(&while_step.body, ctx, state).await?;
        iterations += 1;
    }
    Ok(())
}

async fn run_retry_until(
    retry_until: &RetryUntilStep,
    ctx: &RunCtx<'_>,
    state: &mut RunState,
) -> Result<()> {
    let attempts = retry_until.max_attempts.max(1);
    for attempt in 1..=attempts {
        run_program(&retry_until.body, ctx, state).await?;

        let accepted = state
            .history
            .last()
            .is_some_and(|last| (retry_until.success)(last));
        if accepted {
            return Ok(());
        }
        if attempt == attempts {
            return Err(Error::retry_exhausted(
                attempts,
                Error::configuration("retryUntil predicate never accepted the result"),
            ));
        }

        ctx.telemetry.counter("workflow.retry", 1);
        if let Some(factor) = retry_until.backoff {
            let ms = 1000.0 * factor.powi(attempt.saturating_sub(1) as i32);
            tokio::time::sleep(Duration::from_millis(ms.max(0.0) as u64)).await;
        }
    }
    Ok(())
}

/// Run a pre-built agent inline. The child executes against its own
/// options with a fresh context history; its results are appended to the
/// parent's history and context, and its errors propagate unchanged.
async fn run_sub_agent(
    agent: &super::Agent,
    ctx: &RunCtx<'_>,
    state: &mut RunState,
) -> Result<()> {
    let parent = ctx.options.name.as_deref().unwrap_or("agent");
    let child = agent.options().name.as_deref().unwrap_or("agent");
    ctx.telemetry.span_start(
        "agent.run",
        &[("parent", parent.to_string()), ("agent", child.to_string())],
    );

    let sub_runtime = agent.resolved_runtime();
    let sub_ctx = RunCtx {
        options: agent.options(),
        runtime: &sub_runtime,
        telemetry: ctx.telemetry,
        config: ctx.config,
        cancel: ctx.cancel,
    };
    let mut sub_state = RunState {
        history: Vec::new(),
        context: Vec::new(),
        step_index: state.step_index,
    };

    let outcome = run_program(agent.program(), &sub_ctx, &mut sub_state).await;
    ctx.telemetry.span_end("agent.run", outcome.is_ok());
    outcome?;

    state.step_index = sub_state.step_index;
    for result in sub_state.history {
        ctx.telemetry.duration("step.duration", result.duration_ms);
        state.history.push(result.clone());
        state.context.push(result);
        if let Some(on_step) = &ctx.config.on_step {
            let index = state.history.len() - 1;
            on_step(&state.history[index], index);
        }
    }
    Ok(())
}

fn run_hook(
    phase: &str,
    hook: Option<&Arc<HookFn>>,
    state: &RunState,
    ctx: &RunCtx<'_>,
) {
    let Some(hook) = hook else { return };
    if let Err(error) = hook(&state.history) {
        // Hook failures never change step outcomes.
        warn!(phase, %error, "step hook failed");
        ctx.telemetry.counter("error", 1);
    }
}
