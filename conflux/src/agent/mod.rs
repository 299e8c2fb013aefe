//! The agent: program construction and execution.
//!
//! An [`AgentBuilder`] accumulates a program of [`Step`]s; [`Agent::run`]
//! executes a snapshot of it end-to-end and returns the per-step history,
//! while [`Agent::stream`] yields each result as it completes.
//!
//! # Example
//!
//! ```rust,ignore
//! use conflux::{agent, mcp, AgentOptions};
//!
//! let history = agent(AgentOptions::new().with_llm(my_llm))
//!     .then("Summarize the incident report")
//!     .then(AutoStep::new("File a ticket about it", vec![mcp::http("http://tools/mcp")]))
//!     .run()
//!     .await?;
//! ```

mod builder;
mod context;
mod executor;
mod options;
mod result;
mod retry;
mod scheduler;
mod step;
mod tool_loop;

pub use builder::{AgentBuilder, agent};
pub use context::{DEFAULT_CONTEXT_MAX_CHARS, DEFAULT_CONTEXT_MAX_TOOL_RESULTS};
pub use options::{AgentOptions, OnStep, OnToken, RunConfig, TokenMeta};
pub use result::{StepResult, ToolCallRecord};
pub use retry::{DEFAULT_RETRIES, RetryPolicy};
pub use step::{
    AutoStep, BranchStep, ForEachStep, HistoryPredicate, HistorySelector, HookFn, LlmStep,
    McpStep, ParallelBranches, ParallelStep, Program, ResultPredicate, RetryUntilStep, Step,
    StepConfig, StepFactory, SubAgentStep, WhileStep,
};
pub use tool_loop::{DEFAULT_MAX_TOOL_ITERATIONS, NO_TOOLS_OUTPUT};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::Stream;
use tracing::{info, instrument};

use crate::error::{Error, Result};
use crate::mcp::McpRuntime;
use crate::telemetry::{NoopTelemetry, SharedTelemetry};

use result::stamp_totals;
use scheduler::{RunCtx, RunState, run_program};

/// An executable agent: an immutable program plus shared options.
///
/// A single agent refuses re-entrant runs; build separate agents (or clone
/// the builder) to run the same program concurrently.
pub struct Agent {
    options: AgentOptions,
    program: Vec<Step>,
    running: AtomicBool,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.options.name)
            .field("steps", &self.program.len())
            .finish_non_exhaustive()
    }
}

struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Agent {
    /// Start building an agent.
    #[must_use]
    pub fn builder(options: AgentOptions) -> AgentBuilder {
        AgentBuilder::new(options)
    }

    /// The agent's name, when set.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.options.name.as_deref()
    }

    pub(crate) fn options(&self) -> &AgentOptions {
        &self.options
    }

    pub(crate) fn program(&self) -> &[Step] {
        &self.program
    }

    pub(crate) fn resolved_runtime(&self) -> Arc<McpRuntime> {
        self.options
            .runtime
            .clone()
            .unwrap_or_else(McpRuntime::global)
    }

    fn resolved_telemetry(&self) -> SharedTelemetry {
        self.options
            .telemetry
            .clone()
            .unwrap_or_else(|| Arc::new(NoopTelemetry))
    }

    /// Execute the program and return the full history, with aggregate
    /// totals stamped on the final element.
    #[instrument(skip(self), fields(agent = self.options.name.as_deref().unwrap_or("agent")))]
    pub async fn run(&self) -> Result<Vec<StepResult>> {
        self.run_with(RunConfig::new()).await
    }

    /// [`run`](Self::run) with per-run callbacks.
    pub async fn run_with(&self, config: RunConfig) -> Result<Vec<StepResult>> {
        let cancel = AtomicBool::new(false);
        let mut history = self.execute(&config, &cancel).await?;
        stamp_totals(&mut history);
        Ok(history)
    }

    /// Execute the program, yielding each step result as it completes.
    /// Streamed results carry no aggregate totals.
    pub fn stream(self: Arc<Self>) -> impl Stream<Item = Result<StepResult>> + use<> {
        self.stream_with(RunConfig::new())
    }

    /// [`stream`](Self::stream) with per-run callbacks.
    pub fn stream_with(
        self: Arc<Self>,
        config: RunConfig,
    ) -> impl Stream<Item = Result<StepResult>> + use<> {
        let agent = self;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Result<StepResult>>();
        let cancel = Arc::new(AtomicBool::new(false));

        let sender = tx.clone();
        let sender_cancel = Arc::clone(&cancel);
        let user_on_step = config.on_step.clone();
        let streaming_config = RunConfig {
            on_step: Some(Arc::new(move |result: &StepResult, index: usize| {
                if let Some(user) = &user_on_step {
                    user(result, index);
                }
                if sender.send(Ok(result.clone())).is_err() {
                    // Consumer dropped the stream; stop at the next step.
                    sender_cancel.store(true, Ordering::SeqCst);
                }
            })),
            on_token: config.on_token,
        };

        tokio::spawn(async move {
            if let Err(error) = agent.execute(&streaming_config, &cancel).await {
                let _ = tx.send(Err(error));
            }
        });

        async_stream::stream! {
            while let Some(item) = rx.recv().await {
                yield item;
            }
        }
    }

    async fn execute(&self, config: &RunConfig, cancel: &AtomicBool) -> Result<Vec<StepResult>> {
        // Fail fast on contradictory configuration, before any I/O.
        if let Some(retry) = &self.options.retry {
            retry.validate()?;
        }
        validate_program(&self.program)?;

        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::agent_concurrency());
        }
        let _guard = RunGuard(&self.running);

        let telemetry = self.resolved_telemetry();
        let runtime = self.resolved_runtime();
        let name = self.options.name.clone().unwrap_or_else(|| "agent".into());
        telemetry.span_start("agent.run", &[("agent", name.clone())]);
        telemetry.counter("agent.execution", 1);
        info!(agent = %name, steps = self.program.len(), "starting run");

        // Snapshot: steps appended after this point do not affect the run.
        let program = self.program.clone();
        let ctx = RunCtx {
            options: &self.options,
            runtime: &runtime,
            telemetry: &telemetry,
            config,
            cancel,
        };
        let mut state = RunState::default();
        let outcome = run_program(&program, &ctx, &mut state).await;

        telemetry.span_end("agent.run", outcome.is_ok());
        match outcome {
            Ok(()) => {
                info!(agent = %name, results = state.history.len(), "run complete");
                Ok(state.history)
            }
            Err(error) => Err(error),
        }
    }
}

/// Reject contradictory per-step configuration anywhere in the program.
fn validate_program(steps: &[Step]) -> Result<()> {
    for step in steps {
        if let Some(config) = step.config() {
            if let Some(retry) = &config.retry {
                retry.validate()?;
            }
        }
        match step {
            Step::Parallel(parallel) => match &parallel.branches {
                ParallelBranches::List(children) => validate_program(children)?,
                ParallelBranches::Map(children) => {
                    for child in children.values() {
                        validate_program(std::slice::from_ref(child))?;
                    }
                }
            },
            Step::Branch(branch) => {
                validate_program(&branch.when_true)?;
                validate_program(&branch.when_false)?;
            }
            Step::Switch(switch) => {
                for case in switch.cases.values() {
                    validate_program(case)?;
                }
                if let Some(default) = &switch.default {
                    validate_program(default)?;
                }
            }
            Step::While(while_step) => validate_program(&while_step.body)?,
            Step::RetryUntil(retry_until) => validate_program(&retry_until.body)?,
            Step::RunSubAgent(sub) => validate_program(sub.agent.program())?,
            _ => {}
        }
    }
    Ok(())
}
