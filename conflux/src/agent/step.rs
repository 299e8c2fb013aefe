//! The step data model.
//!
//! A program is a list of [`Step`]s: LLM calls, explicit tool invocations,
//! automatic tool selection, and nested control-flow constructs. Steps are
//! immutable once built; `run()` executes a snapshot, so appending to a
//! builder never affects an in-flight run.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::llm::SharedLlm;
use crate::mcp::McpHandle;

use super::Agent;
use super::result::StepResult;
use super::retry::RetryPolicy;

/// Hook invoked before or after a step. Errors are logged, never fatal.
pub type HookFn =
    dyn Fn(&[StepResult]) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>
        + Send
        + Sync;

/// Predicate over the history so far.
pub type HistoryPredicate = dyn Fn(&[StepResult]) -> bool + Send + Sync;

/// Selector over the history so far, for `switch`.
pub type HistorySelector = dyn Fn(&[StepResult]) -> String + Send + Sync;

/// Step factory, resolved once immediately before dispatch.
pub type StepFactory = dyn Fn(&[StepResult]) -> Step + Send + Sync;

/// Predicate over a single step result, for `retry_until`.
pub type ResultPredicate = dyn Fn(&StepResult) -> bool + Send + Sync;

/// Per-step overrides and hooks.
#[derive(Clone, Default)]
pub struct StepConfig {
    /// Per-attempt timeout in seconds; overrides the agent default.
    pub timeout: Option<f64>,
    /// Retry policy; overrides the agent default.
    pub retry: Option<RetryPolicy>,
    /// Context fragment character cap override.
    pub context_max_chars: Option<usize>,
    /// Context fragment tool-result count override.
    pub context_max_tool_results: Option<usize>,
    /// Hook run before the step.
    pub pre: Option<Arc<HookFn>>,
    /// Hook run after the step.
    pub post: Option<Arc<HookFn>>,
}

impl std::fmt::Debug for StepConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepConfig")
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("pre", &self.pre.is_some())
            .field("post", &self.post.is_some())
            .finish_non_exhaustive()
    }
}

/// An LLM-only step.
#[derive(Clone)]
pub struct LlmStep {
    /// The user prompt.
    pub prompt: String,
    /// LLM override for this step.
    pub llm: Option<SharedLlm>,
    /// Instructions override for this step.
    pub instructions: Option<String>,
    /// Overrides and hooks.
    pub config: StepConfig,
}

impl LlmStep {
    /// Create an LLM step.
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            llm: None,
            instructions: None,
            config: StepConfig::default(),
        }
    }

    /// Use a specific LLM for this step.
    #[must_use]
    pub fn with_llm(mut self, llm: impl Into<SharedLlm>) -> Self {
        self.llm = Some(llm.into());
        self
    }

    /// Use specific instructions for this step.
    #[must_use]
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Per-attempt timeout in seconds.
    #[must_use]
    pub const fn with_timeout(mut self, seconds: f64) -> Self {
        self.config.timeout = Some(seconds);
        self
    }

    /// Retry policy for this step.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = Some(retry);
        self
    }

    /// Hook run before the step.
    #[must_use]
    pub fn pre(
        mut self,
        hook: impl Fn(&[StepResult]) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.config.pre = Some(Arc::new(hook));
        self
    }

    /// Hook run after the step.
    #[must_use]
    pub fn post(
        mut self,
        hook: impl Fn(&[StepResult]) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.config.post = Some(Arc::new(hook));
        self
    }
}

/// An explicit tool invocation, optionally preceded by a brief LLM turn.
#[derive(Clone)]
pub struct McpStep {
    /// The tool server.
    pub mcp: McpHandle,
    /// Raw tool name on that server.
    pub tool: String,
    /// Tool arguments.
    pub args: Value,
    /// LLM for the optional preceding turn.
    pub llm: Option<SharedLlm>,
    /// Prompt for the optional preceding turn.
    pub prompt: Option<String>,
    /// Overrides and hooks.
    pub config: StepConfig,
}

impl McpStep {
    /// Create an explicit tool-call step.
    #[must_use]
    pub fn new(mcp: McpHandle, tool: impl Into<String>, args: Value) -> Self {
        Self {
            mcp,
            tool: tool.into(),
            args,
            llm: None,
            prompt: None,
            config: StepConfig::default(),
        }
    }

    /// Add a brief LLM turn before the tool call.
    #[must_use]
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    /// Use a specific LLM for the preceding turn.
    #[must_use]
    pub fn with_llm(mut self, llm: impl Into<SharedLlm>) -> Self {
        self.llm = Some(llm.into());
        self
    }

    /// Per-attempt timeout in seconds.
    #[must_use]
    pub const fn with_timeout(mut self, seconds: f64) -> Self {
        self.config.timeout = Some(seconds);
        self
    }

    /// Retry policy for this step.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = Some(retry);
        self
    }
}

/// Automatic tool selection across one or more tool servers.
#[derive(Clone)]
pub struct AutoStep {
    /// The user prompt.
    pub prompt: String,
    /// Tool servers to discover and call across.
    pub mcps: Vec<McpHandle>,
    /// LLM override for this step.
    pub llm: Option<SharedLlm>,
    /// Hop limit override for the tool loop.
    pub max_tool_iterations: Option<u32>,
    /// Overrides and hooks.
    pub config: StepConfig,
}

impl AutoStep {
    /// Create an automatic tool-selection step.
    #[must_use]
    pub fn new(prompt: impl Into<String>, mcps: Vec<McpHandle>) -> Self {
        Self {
            prompt: prompt.into(),
            mcps,
            llm: None,
            max_tool_iterations: None,
            config: StepConfig::default(),
        }
    }

    /// Use a specific LLM for this step.
    #[must_use]
    pub fn with_llm(mut self, llm: impl Into<SharedLlm>) -> Self {
        self.llm = Some(llm.into());
        self
    }

    /// Hop limit for this step's tool loop.
    #[must_use]
    pub const fn with_max_tool_iterations(mut self, iterations: u32) -> Self {
        self.max_tool_iterations = Some(iterations);
        self
    }

    /// Per-attempt timeout in seconds.
    #[must_use]
    pub const fn with_timeout(mut self, seconds: f64) -> Self {
        self.config.timeout = Some(seconds);
        self
    }

    /// Retry policy for this step.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = Some(retry);
        self
    }
}

/// The branches of a parallel step.
#[derive(Clone)]
pub enum ParallelBranches {
    /// Index-ordered list form.
    List(Vec<Step>),
    /// Keyed map form.
    Map(BTreeMap<String, Step>),
}

/// Concurrent execution of sibling steps.
#[derive(Clone)]
pub struct ParallelStep {
    /// The sibling steps.
    pub branches: ParallelBranches,
    /// Hooks.
    pub config: StepConfig,
}

/// Two-way branch on a history predicate.
#[derive(Clone)]
pub struct BranchStep {
    /// Predicate over the history so far.
    pub condition: Arc<HistoryPredicate>,
    /// Sub-program when the predicate holds.
    pub when_true: Vec<Step>,
    /// Sub-program otherwise.
    pub when_false: Vec<Step>,
    /// Hooks.
    pub config: StepConfig,
}

/// Multi-way dispatch on a selector value.
#[derive(Clone)]
pub struct SwitchStep {
    /// Selector over the history so far.
    pub selector: Arc<HistorySelector>,
    /// Case map, matched by equality.
    pub cases: BTreeMap<String, Vec<Step>>,
    /// Fallback when no case matches.
    pub default: Option<Vec<Step>>,
    /// Hooks.
    pub config: StepConfig,
}

/// Condition-guarded loop.
#[derive(Clone)]
pub struct WhileStep {
    /// Checked before each iteration.
    pub condition: Arc<HistoryPredicate>,
    /// Loop body.
    pub body: Vec<Step>,
    /// Iteration cap; unset falls back to a bounded safety default.
    pub max_iterations: Option<u32>,
    /// Total loop timeout in seconds.
    pub timeout: Option<f64>,
    /// Hooks.
    pub config: StepConfig,
}

/// Sequential iteration over a list of items.
#[derive(Clone)]
pub struct ForEachStep {
    /// Items to iterate.
    pub items: Vec<Value>,
    /// Body builder, invoked with each item.
    pub body: Arc<dyn Fn(&Value, Program) -> Program + Send + Sync>,
    /// Hooks.
    pub config: StepConfig,
}

/// Retry a body until a predicate accepts its last result.
#[derive(Clone)]
pub struct RetryUntilStep {
    /// The body program.
    pub body: Vec<Step>,
    /// Accepts the body's last result.
    pub success: Arc<ResultPredicate>,
    /// Attempt cap.
    pub max_attempts: u32,
    /// Backoff factor over a 1-second base between attempts.
    pub backoff: Option<f64>,
    /// Hooks.
    pub config: StepConfig,
}

/// Inline invocation of a pre-built agent.
#[derive(Clone)]
pub struct SubAgentStep {
    /// The agent to run.
    pub agent: Arc<Agent>,
    /// Hooks.
    pub config: StepConfig,
}

/// One unit of a program.
#[derive(Clone)]
pub enum Step {
    /// LLM call only.
    Llm(LlmStep),
    /// Direct tool invocation.
    McpExplicit(McpStep),
    /// Automatic tool selection.
    McpAuto(AutoStep),
    /// Concurrent siblings.
    Parallel(ParallelStep),
    /// Two-way branch.
    Branch(BranchStep),
    /// Multi-way dispatch.
    Switch(SwitchStep),
    /// Condition-guarded loop.
    While(WhileStep),
    /// Sequential iteration.
    ForEach(ForEachStep),
    /// Retry body until a predicate accepts.
    RetryUntil(RetryUntilStep),
    /// Inline sub-agent run.
    RunSubAgent(SubAgentStep),
    /// Clear the context history (the returned history is unaffected).
    ResetHistory,
    /// Deferred step, resolved against the history at dispatch time.
    Factory(Arc<StepFactory>),
}

impl Step {
    /// Build a deferred step from the history at dispatch time.
    #[must_use]
    pub fn factory(f: impl Fn(&[StepResult]) -> Step + Send + Sync + 'static) -> Self {
        Self::Factory(Arc::new(f))
    }

    /// Short name of the step kind, used for step ids and telemetry.
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Llm(_) => "llm",
            Self::McpExplicit(_) => "mcp",
            Self::McpAuto(_) => "auto",
            Self::Parallel(_) => "parallel",
            Self::Branch(_) => "branch",
            Self::Switch(_) => "switch",
            Self::While(_) => "while",
            Self::ForEach(_) => "forEach",
            Self::RetryUntil(_) => "retryUntil",
            Self::RunSubAgent(_) => "subAgent",
            Self::ResetHistory => "resetHistory",
            Self::Factory(_) => "factory",
        }
    }

    /// The step's config, when the kind carries one.
    #[must_use]
    pub const fn config(&self) -> Option<&StepConfig> {
        match self {
            Self::Llm(s) => Some(&s.config),
            Self::McpExplicit(s) => Some(&s.config),
            Self::McpAuto(s) => Some(&s.config),
            Self::Parallel(s) => Some(&s.config),
            Self::Branch(s) => Some(&s.config),
            Self::Switch(s) => Some(&s.config),
            Self::While(s) => Some(&s.config),
            Self::ForEach(s) => Some(&s.config),
            Self::RetryUntil(s) => Some(&s.config),
            Self::RunSubAgent(s) => Some(&s.config),
            Self::ResetHistory | Self::Factory(_) => None,
        }
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Step").field(&self.kind_name()).finish()
    }
}

impl std::fmt::Debug for LlmStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmStep")
            .field("prompt", &self.prompt)
            .field("has_llm", &self.llm.is_some())
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for McpStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpStep")
            .field("mcp", &self.mcp.id)
            .field("tool", &self.tool)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for AutoStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoStep")
            .field("prompt", &self.prompt)
            .field("mcps", &self.mcps.len())
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for ParallelBranches {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::List(steps) => f.debug_tuple("List").field(&steps.len()).finish(),
            Self::Map(steps) => f.debug_tuple("Map").field(&steps.len()).finish(),
        }
    }
}

impl std::fmt::Debug for ParallelStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelStep")
            .field("branches", &self.branches)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for BranchStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchStep")
            .field("when_true", &self.when_true.len())
            .field("when_false", &self.when_false.len())
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for SwitchStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwitchStep")
            .field("cases", &self.cases.keys().collect::<Vec<_>>())
            .field("has_default", &self.default.is_some())
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for WhileStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhileStep")
            .field("max_iterations", &self.max_iterations)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for ForEachStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForEachStep")
            .field("items", &self.items.len())
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for RetryUntilStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryUntilStep")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for SubAgentStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubAgentStep")
            .field("agent", &self.agent.name())
            .finish_non_exhaustive()
    }
}

impl From<LlmStep> for Step {
    fn from(step: LlmStep) -> Self {
        Self::Llm(step)
    }
}

impl From<McpStep> for Step {
    fn from(step: McpStep) -> Self {
        Self::McpExplicit(step)
    }
}

impl From<AutoStep> for Step {
    fn from(step: AutoStep) -> Self {
        Self::McpAuto(step)
    }
}

/// A plain string is a prompt-only LLM step.
impl From<&str> for Step {
    fn from(prompt: &str) -> Self {
        Self::Llm(LlmStep::new(prompt))
    }
}

impl From<String> for Step {
    fn from(prompt: String) -> Self {
        Self::Llm(LlmStep::new(prompt))
    }
}

/// An append-only list of steps, used for sub-programs inside control-flow
/// constructs. [`AgentBuilder`](crate::agent::AgentBuilder) wraps one for
/// the top level.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub(crate) steps: Vec<Step>,
}

impl Program {
    /// Create an empty program.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step.
    #[must_use]
    pub fn then(mut self, step: impl Into<Step>) -> Self {
        self.steps.push(step.into());
        self
    }

    /// Append a deferred step resolved from the history at dispatch time.
    #[must_use]
    pub fn then_with(mut self, f: impl Fn(&[StepResult]) -> Step + Send + Sync + 'static) -> Self {
        self.steps.push(Step::factory(f));
        self
    }

    /// Clear the context history at this point.
    #[must_use]
    pub fn reset_history(mut self) -> Self {
        self.steps.push(Step::ResetHistory);
        self
    }

    /// Run sibling steps concurrently, collecting index-ordered results.
    #[must_use]
    pub fn parallel(mut self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.steps.push(Step::Parallel(ParallelStep {
            branches: ParallelBranches::List(steps.into_iter().collect()),
            config: StepConfig::default(),
        }));
        self
    }

    /// Run keyed sibling steps concurrently, collecting keyed results.
    #[must_use]
    pub fn parallel_map(mut self, steps: impl IntoIterator<Item = (String, Step)>) -> Self {
        self.steps.push(Step::Parallel(ParallelStep {
            branches: ParallelBranches::Map(steps.into_iter().collect()),
            config: StepConfig::default(),
        }));
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
        self.steps.push(Step::Branch(BranchStep {
            condition: Arc::new(condition),
            when_true: when_true(Program::new()).steps,
            when_false: when_false(Program::new()).steps,
            config: StepConfig::default(),
        }));
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
        self.steps.push(Step::Switch(SwitchStep {
            selector: Arc::new(selector),
            cases: cases
                .into_iter()
                .map(|(key, program)| (key, program.steps))
                .collect(),
            default: default.map(|program| program.steps),
            config: StepConfig::default(),
        }));
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
        self.steps.push(Step::While(WhileStep {
            condition: Arc::new(condition),
            body: body(Program::new()).steps,
            max_iterations: Some(max_iterations),
            timeout: None,
            config: StepConfig::default(),
        }));
        self
    }

    /// Run the body once per item, sequentially.
    #[must_use]
    pub fn for_each(
        mut self,
        items: impl IntoIterator<Item = Value>,
        body: impl Fn(&Value, Program) -> Program + Send + Sync + 'static,
    ) -> Self {
        self.steps.push(Step::ForEach(ForEachStep {
            items: items.into_iter().collect(),
            body: Arc::new(body),
            config: StepConfig::default(),
        }));
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
        self.steps.push(Step::RetryUntil(RetryUntilStep {
            body: body(Program::new()).steps,
            success: Arc::new(success),
            max_attempts,
            backoff,
            config: StepConfig::default(),
        }));
        self
    }

    /// Run a pre-built agent inline, appending its results.
    #[must_use]
    pub fn run_agent(mut self, agent: Arc<Agent>) -> Self {
        self.steps.push(Step::RunSubAgent(SubAgentStep {
            agent,
            config: StepConfig::default(),
        }));
        self
    }

    /// Append a raw step value.
    #[must_use]
    pub fn push(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the program has no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
