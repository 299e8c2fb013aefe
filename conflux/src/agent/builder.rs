//! Fluent builder for agents.

use std::sync::Arc;

use futures::Stream;
use serde_json::Value;

use crate::error::Result;

use super::options::{AgentOptions, RunConfig};
use super::result::StepResult;
use super::step::{Program, Step};
use super::Agent;

/// Start building an agent.
///
/// # Example
///
/// ```rust,ignore
/// let history = agent(AgentOptions::new().with_llm(llm))
///     .then("First prompt")
///     .then("Second prompt")
///     .run()
///     .await?;
/// ```
#[must_use]
pub fn agent(options: AgentOptions) -> AgentBuilder {
    AgentBuilder::new(options)
}

/// Accumulates a program of steps; construction is pure, execution happens
/// in [`run`](AgentBuilder::run) / [`stream`](AgentBuilder::stream).
#[derive(Debug, Default)]
pub struct AgentBuilder {
    options: AgentOptions,
    program: Program,
}

impl AgentBuilder {
    /// Create a builder with the given options.
    #[must_use]
    pub fn new(options: AgentOptions) -> Self {
        Self {
            options,
            program: Program::new(),
        }
    }

    /// Append a step.
    #[must_use]
    pub fn then(mut self, step: impl Into<Step>) -> Self {
        self.program = self.program.then(step);
        self
    }

    /// Append a deferred step resolved from the history at dispatch time.
    #[must_use]
    pub fn then_with(
        mut self,
        f: impl Fn(&[StepResult]) -> Step + Send + Sync + 'static,
    ) -> Self {
        self.program = self.program.then_with(f);
        self
    }

    /// Clear the context history at this point. The returned history is
    /// unaffected.
    #[must_use]
    pub fn reset_history(mut self) -> Self {
        self.program = self.program.reset_history();
        self
    }

    /// Run sibling steps concurrently; results arrive index-ordered.
    #[must_use]
    pub fn parallel(mut self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.program = self.program.parallel(steps);
        self
    }

    /// Run keyed sibling steps concurrently; results arrive keyed.
    #[must_use]
    pub fn parallel_map(mut self, steps: impl IntoIterator<Item = (String, Step)>) -> Self {
        self.program = self.program.parallel_map(steps);
        self
    }

    /// Execute one of two sub-programs depending on the history.
    #[must_use]
    pub fn branch(
        mut self,
        condition: impl Fn(&[StepResult]) -> bool + Send + Sync + 'static,
        when_true: impl FnOnce(Program) -> Program,
        when_false: impl FnOnce(Program) -> Program,
    ) -> Self {
        self.program = self.program.branch(condition, when_true, when_false);
        self
    }

    /// Dispatch on a selector value over a case map.
    #[must_use]
    pub fn switch(
        mut self,
        selector: impl Fn(&[StepResult]) -> String + Send + Sync + 'static,
        cases: impl IntoIterator<Item = (String, Program)>,
        default: Option<Program>,
    ) -> Self {
        self.program = self.program.switch(selector, cases, default);
        self
    }

    /// Repeat a body while the condition holds, bounded by `max_iterations`.
    #[must_use]
    pub fn while_loop(
        mut self,
        condition: impl Fn(&[StepResult]) -> bool + Send + Sync + 'static,
        body: impl FnOnce(Program) -> Program,
        max_iterations: u32,
    ) -> Self {
        self.program = self.program.while_loop(condition, body, max_iterations);
        self
    }

    /// Run the body once per item, sequentially.
    #[must_use]
    pub fn for_each(
        mut self,
        items: impl IntoIterator<Item = Value>,
        body: impl Fn(&Value, Program) -> Program + Send + Sync + 'static,
    ) -> Self {
        self.program = self.program.for_each(items, body);
        self
    }

    /// Re-run the body until the predicate accepts its last result.
    #[must_use]
    pub fn retry_until(
        mut self,
        body: impl FnOnce(Program) -> Program,
        success: impl Fn(&StepResult) -> bool + Send + Sync + 'static,
        max_attempts: u32,
        backoff: Option<f64>,
    ) -> Self {
        self.program = self.program.retry_until(body, success, max_attempts, backoff);
        self
    }

    /// Run a pre-built agent inline, appending its results.
    #[must_use]
    pub fn run_agent(mut self, agent: Arc<Agent>) -> Self {
        self.program = self.program.run_agent(agent);
        self
    }

    /// Number of steps accumulated so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.program.len()
    }

    /// Whether no steps have been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.program.is_empty()
    }

    /// Finish building, producing a reusable [`Agent`].
    #[must_use]
    pub fn build(self) -> Agent {
        Agent {
            options: self.options,
            program: self.program.steps,
            running: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Build and run, returning the full history.
    pub async fn run(self) -> Result<Vec<StepResult>> {
        self.build().run().await
    }

    /// Build and run with per-run callbacks.
    pub async fn run_with(self, config: RunConfig) -> Result<Vec<StepResult>> {
        self.build().run_with(config).await
    }

    /// Build and stream step results as they complete.
    pub fn stream(self) -> impl Stream<Item = Result<StepResult>> {
        Arc::new(self.build()).stream()
    }

    /// Build and stream with per-run callbacks.
    pub fn stream_with(self, config: RunConfig) -> impl Stream<Item = Result<StepResult>> {
        Arc::new(self.build()).stream_with(config)
    }
}
