//! End-to-end tests for the conflux runtime, driven by scripted mocks.

#![allow(clippy::unwrap_used, clippy::panic, clippy::clone_on_ref_ptr)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;

use conflux::mcp::mock::{MockConnector, MockServer};
use conflux::mcp::{AuthManager, TokenFetcher, TokenGrant};
use conflux::prelude::*;

fn llm_of(texts: &[&str]) -> Arc<MockLlm> {
    Arc::new(MockLlm::texts(texts))
}

fn options_with(llm: &Arc<MockLlm>) -> AgentOptions {
    AgentOptions::new().with_llm(Arc::clone(llm))
}

/// A runtime wired to one in-memory server exposing `add` and `echo`.
fn tool_runtime(url: &str) -> (Arc<MockServer>, Arc<McpRuntime>) {
    let server = MockServer::new();
    server.add_tool(
        "add",
        json!({
            "type": "object",
            "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
            "required": ["a", "b"]
        }),
        |args| {
            let sum = args["a"].as_f64().unwrap() + args["b"].as_f64().unwrap();
            Ok(json!(sum))
        },
    );
    server.add_tool(
        "echo",
        json!({"type": "object", "properties": {"id": {"type": "string"}}}),
        |args| Ok(args["id"].clone()),
    );
    let connector = MockConnector::new();
    connector.register(url, Arc::clone(&server));
    (server, Arc::new(McpRuntime::with_connector(connector)))
}

// ---------------------------------------------------------------------------
// Scenario: simple LLM chains
// ---------------------------------------------------------------------------

#[tokio::test]
async fn llm_chain_threads_context_and_aggregates() {
    let llm = llm_of(&["r1", "r2"]);
    let results = agent(options_with(&llm))
        .then("a")
        .then("b")
        .run()
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].llm_output.as_deref(), Some("r1"));
    assert_eq!(results[1].llm_output.as_deref(), Some("r2"));

    // The second prompt is "b" followed by a context block carrying "r1".
    let second_prompt = results[1].prompt.as_deref().unwrap();
    assert!(second_prompt.starts_with('b'));
    assert!(second_prompt.contains("[Context from previous steps]"));
    assert!(second_prompt.contains("Previous LLM answer:\nr1"));

    // Aggregates only on the final element.
    assert!(results[0].total_duration_ms.is_none());
    assert!(results[1].total_duration_ms.is_some());
    assert!(results[1].total_llm_ms.is_some());
    assert!(results[1].total_mcp_ms.is_some());

    // llmMs never exceeds durationMs.
    for result in &results {
        assert!(result.llm_ms <= result.duration_ms);
    }
}

#[tokio::test]
async fn instructions_prefix_the_prompt() {
    let llm = llm_of(&["out"]);
    agent(options_with(&llm).with_instructions("Be terse."))
        .then("question")
        .run()
        .await
        .unwrap();

    let prompt = &llm.prompts()[0];
    assert!(prompt.starts_with("Be terse.\n\nquestion"));
}

#[tokio::test]
async fn reset_history_clears_context_between_steps() {
    let llm = llm_of(&["r1", "r2"]);
    let results = agent(options_with(&llm))
        .then("a")
        .reset_history()
        .then("b")
        .run()
        .await
        .unwrap();

    // The returned vector still has both results,
    assert_eq!(results.len(), 2);
    // but the second prompt saw no context fragment.
    assert_eq!(llm.prompts()[1], "b");
}

#[tokio::test]
async fn step_factory_sees_prior_history() {
    let llm = llm_of(&["r1", "r2"]);
    let results = agent(options_with(&llm))
        .then("a")
        .then_with(|history| {
            let prev = history[0].llm_output.clone().unwrap_or_default();
            Step::from(LlmStep::new(format!("follow-up to {prev}")))
        })
        .run()
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert!(results[1].prompt.as_deref().unwrap().starts_with("follow-up to r1"));
}

// ---------------------------------------------------------------------------
// Scenario: explicit MCP steps
// ---------------------------------------------------------------------------

#[tokio::test]
async fn explicit_tool_call_records_invocation() {
    let (server, runtime) = tool_runtime("http://tools/mcp");
    let handle = mcp::http("http://tools/mcp");

    let results = agent(AgentOptions::new().with_runtime(runtime))
        .then(McpStep::new(handle.clone(), "add", json!({"a": 2, "b": 3})))
        .run()
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].mcp.as_deref(), Some(handle.id.as_str()));
    let calls = results[0].tool_calls.as_deref().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].name, format!("{}.add", handle.id));
    assert_eq!(calls[0].endpoint, "http://tools/mcp");
    assert_eq!(calls[0].result, json!(5.0));
    assert_eq!(server.calls().len(), 1);
}

#[tokio::test]
async fn schema_violation_fails_without_retry_or_invocation() {
    let (server, runtime) = tool_runtime("http://tools/mcp");
    let handle = mcp::http("http://tools/mcp");

    let err = agent(AgentOptions::new().with_runtime(runtime))
        .then(
            McpStep::new(handle, "add", json!({"a": "x", "b": 1}))
                .with_retry(RetryPolicy { retries: Some(3), delay: None, backoff: None }),
        )
        .run()
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(!err.retryable());
    // Non-retryable: exactly one attempt, and the tool itself never ran.
    assert!(server.calls().is_empty());
}

// ---------------------------------------------------------------------------
// Scenario: automatic tool selection
// ---------------------------------------------------------------------------

fn weather_runtime(url: &str) -> (Arc<MockServer>, Arc<McpRuntime>) {
    let server = MockServer::new();
    server.add_tool(
        "weather",
        json!({
            "type": "object",
            "properties": {"city": {"type": "string"}},
            "required": ["city"]
        }),
        |args| Ok(json!(format!("forecast for {}", args["city"].as_str().unwrap()))),
    );
    let connector = MockConnector::new();
    connector.register(url, Arc::clone(&server));
    (server, Arc::new(McpRuntime::with_connector(connector)))
}

#[tokio::test]
async fn auto_step_runs_tool_then_adopts_final_answer() {
    let (server, runtime) = weather_runtime("http://weather/mcp");
    let handle = mcp::http("http://weather/mcp");
    let qualified = format!("{}.weather", handle.id);

    let llm = Arc::new(MockLlm::new(vec![
        MockTurn::tool_calls(vec![ToolCallRequest::new(
            qualified.clone(),
            json!({"city": "SF"}),
        )]),
        MockTurn::text("sunny"),
    ]));

    let results = agent(
        AgentOptions::new()
            .with_llm(Arc::clone(&llm))
            .with_runtime(runtime),
    )
    .then(AutoStep::new("What's the weather in SF?", vec![handle]))
    .run()
    .await
    .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].llm_output.as_deref(), Some("sunny"));
    let calls = results[0].tool_calls.as_deref().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].name, qualified);
    assert_eq!(calls[0].result, json!("forecast for SF"));

    // The second LLM turn saw the tool results section.
    assert!(llm.prompts()[1].contains("[Tool results]"));
    assert!(server.calls().len() == 1);
}

#[tokio::test]
async fn auto_step_without_tools_short_circuits() {
    let connector = MockConnector::new();
    connector.register("http://empty/mcp", MockServer::new());
    let runtime = Arc::new(McpRuntime::with_connector(connector));
    let llm = llm_of(&["never used"]);

    let results = agent(options_with(&llm).with_runtime(runtime))
        .then(AutoStep::new("anything", vec![mcp::http("http://empty/mcp")]))
        .run()
        .await
        .unwrap();

    assert_eq!(results[0].llm_output.as_deref(), Some("No tools available"));
    assert_eq!(results[0].tool_calls.as_deref().unwrap().len(), 0);
    assert_eq!(llm.calls(), 0);
}

#[tokio::test]
async fn auto_step_hop_limit_bounds_the_loop() {
    let (_, runtime) = weather_runtime("http://weather/mcp");
    let handle = mcp::http("http://weather/mcp");
    let qualified = format!("{}.weather", handle.id);

    // The model asks for a tool on every turn and never concludes.
    let llm = Arc::new(MockLlm::new(vec![MockTurn::tool_calls(vec![
        ToolCallRequest::new(qualified, json!({"city": "SF"})),
    ])]));

    let results = agent(
        AgentOptions::new()
            .with_llm(Arc::clone(&llm))
            .with_runtime(runtime)
            .with_max_tool_iterations(2),
    )
    .then(AutoStep::new("loop forever", vec![handle]))
    .run()
    .await
    .unwrap();

    assert_eq!(llm.calls(), 2);
    assert_eq!(results[0].tool_calls.as_deref().unwrap().len(), 2);
}

#[tokio::test]
async fn batched_tool_calls_preserve_emission_order() {
    let (server, runtime) = tool_runtime("http://tools/mcp");
    let handle = mcp::http("http://tools/mcp");
    let qualified = format!("{}.echo", handle.id);

    // Two calls to the same tool with distinct ids: eligible for the
    // conservative concurrent path.
    let llm = Arc::new(MockLlm::new(vec![
        MockTurn::tool_calls(vec![
            ToolCallRequest::new(qualified.clone(), json!({"id": "second"})),
            ToolCallRequest::new(qualified.clone(), json!({"id": "first"})),
        ]),
        MockTurn::text("done"),
    ]));

    let results = agent(
        AgentOptions::new()
            .with_llm(Arc::clone(&llm))
            .with_runtime(runtime),
    )
    .then(AutoStep::new("echo twice", vec![handle]))
    .run()
    .await
    .unwrap();

    let calls = results[0].tool_calls.as_deref().unwrap();
    assert_eq!(calls.len(), 2);
    // Records follow the order the model emitted the calls.
    assert_eq!(calls[0].result, json!("second"));
    assert_eq!(calls[1].result, json!("first"));
    assert_eq!(server.calls().len(), 2);
}

// ---------------------------------------------------------------------------
// Scenario: control flow
// ---------------------------------------------------------------------------

#[tokio::test]
async fn parallel_map_keeps_both_branches() {
    let llm_a = llm_of(&["answer A"]);
    let llm_b = llm_of(&["answer B"]);

    let results = agent(AgentOptions::new())
        .parallel_map([
            (
                "a".to_string(),
                Step::from(LlmStep::new("A").with_llm(Arc::clone(&llm_a))),
            ),
            (
                "b".to_string(),
                Step::from(LlmStep::new("B").with_llm(Arc::clone(&llm_b))),
            ),
        ])
        .run()
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    let parallel = results[0].parallel.as_ref().unwrap();
    assert_eq!(parallel["a"].llm_output.as_deref(), Some("answer A"));
    assert_eq!(parallel["b"].llm_output.as_deref(), Some("answer B"));
}

#[tokio::test]
async fn parallel_list_preserves_index_order() {
    // The first branch finishes last; index order must hold regardless.
    let slow = Arc::new(MockLlm::new(vec![
        MockTurn::text("one").after(Duration::from_millis(40)),
    ]));
    let fast = llm_of(&["two"]);

    let results = agent(AgentOptions::new())
        .parallel([
            Step::from(LlmStep::new("1").with_llm(Arc::clone(&slow))),
            Step::from(LlmStep::new("2").with_llm(Arc::clone(&fast))),
        ])
        .run()
        .await
        .unwrap();

    let branches = results[0].parallel_results.as_deref().unwrap();
    assert_eq!(branches.len(), 2);
    assert_eq!(branches[0].llm_output.as_deref(), Some("one"));
    assert_eq!(branches[1].llm_output.as_deref(), Some("two"));
    assert!(results[0].llm_ms <= results[0].duration_ms);
}

#[tokio::test]
async fn parallel_failure_aborts_the_batch() {
    let bad = Arc::new(MockLlm::new(vec![MockTurn::failure(400)]));
    let good = llm_of(&["fine"]);

    let err = agent(AgentOptions::new())
        .parallel([
            Step::from(LlmStep::new("1").with_llm(Arc::clone(&bad))),
            Step::from(LlmStep::new("2").with_llm(Arc::clone(&good))),
        ])
        .run()
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Llm);
}

#[tokio::test]
async fn branch_executes_exactly_one_arm() {
    let llm = llm_of(&["first", "taken"]);
    let results = agent(options_with(&llm))
        .then("start")
        .branch(
            |history| history[0].llm_output.as_deref() == Some("first"),
            |p| p.then("true arm"),
            |p| p.then("false arm"),
        )
        .run()
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert!(llm.prompts()[1].starts_with("true arm"));
}

#[tokio::test]
async fn switch_matches_case_then_default_then_nothing() {
    let llm = llm_of(&["blue", "case hit"]);
    let results = agent(options_with(&llm))
        .then("pick a color")
        .switch(
            |history| history[0].llm_output.clone().unwrap_or_default(),
            [
                ("blue".to_string(), Program::new().then("blue path")),
                ("red".to_string(), Program::new().then("red path")),
            ],
            None,
        )
        .run()
        .await
        .unwrap();
    assert_eq!(results.len(), 2);

    // Selector misses and no default: the construct yields zero results.
    let llm = llm_of(&["green"]);
    let results = agent(options_with(&llm))
        .then("pick a color")
        .switch(
            |history| history[0].llm_output.clone().unwrap_or_default(),
            [("blue".to_string(), Program::new().then("blue path"))],
            None,
        )
        .run()
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
}

#[tokio::test]
async fn while_loop_stops_at_max_iterations() {
    let llm = llm_of(&["tick"]);
    let results = agent(options_with(&llm))
        .while_loop(|_| true, |p| p.then("again"), 3)
        .run()
        .await
        .unwrap();

    assert_eq!(results.len(), 3);
}

#[tokio::test]
async fn for_each_runs_body_per_item_in_order() {
    let llm = llm_of(&["done"]);
    let results = agent(options_with(&llm))
        .for_each(
            [json!("alpha"), json!("beta")],
            |item, program| program.then(format!("process {item}")),
        )
        .run()
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert!(llm.prompts()[0].starts_with("process \"alpha\""));
    assert!(llm.prompts()[1].contains("process \"beta\""));
}

#[tokio::test]
async fn retry_until_reruns_body_until_accepted() {
    let llm = llm_of(&["no", "no", "yes"]);
    let results = agent(options_with(&llm))
        .retry_until(
            |p| p.then("try"),
            |last| last.llm_output.as_deref() == Some("yes"),
            5,
            None,
        )
        .run()
        .await
        .unwrap();

    assert_eq!(results.len(), 3);
    assert_eq!(results[2].llm_output.as_deref(), Some("yes"));
}

#[tokio::test]
async fn retry_until_exhaustion_is_an_error() {
    let llm = llm_of(&["never"]);
    let err = agent(options_with(&llm))
        .retry_until(|p| p.then("try"), |_| false, 2, None)
        .run()
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::RetryExhausted);
}

#[tokio::test]
async fn sub_agent_results_are_inlined() {
    let child_llm = llm_of(&["child answer"]);
    let child = Arc::new(
        agent(options_with(&child_llm).with_name("child"))
            .then("child task")
            .build(),
    );

    let parent_llm = llm_of(&["parent answer"]);
    let results = agent(options_with(&parent_llm).with_name("parent"))
        .then("parent task")
        .run_agent(child)
        .run()
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[1].llm_output.as_deref(), Some("child answer"));
    assert!(results[1].total_duration_ms.is_some());
}

#[tokio::test]
async fn hook_failures_never_change_outcomes() {
    let llm = llm_of(&["ok"]);
    let results = agent(options_with(&llm))
        .then(
            LlmStep::new("guarded")
                .pre(|_| Err("pre hook exploded".into()))
                .post(|_| Err("post hook exploded".into())),
        )
        .run()
        .await
        .unwrap();

    assert_eq!(results[0].llm_output.as_deref(), Some("ok"));
}

// ---------------------------------------------------------------------------
// Scenario: auth
// ---------------------------------------------------------------------------

struct CountingFetcher {
    fetches: AtomicUsize,
}

#[async_trait::async_trait]
impl TokenFetcher for CountingFetcher {
    async fn fetch(&self, _id: &str, _secret: &str, _endpoint: &str) -> Result<TokenGrant> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(TokenGrant {
            access_token: format!("oauth-token-{n}"),
            expires_in: 3600,
        })
    }
}

#[tokio::test]
async fn oauth_token_is_issued_once_across_steps() {
    let server = MockServer::new();
    server.add_fixed_tool("ping", json!({"type": "object"}), json!("pong"));
    let connector = MockConnector::new();
    connector.register("http://secure/mcp", Arc::clone(&server));

    let fetcher = Arc::new(CountingFetcher {
        fetches: AtomicUsize::new(0),
    });
    let runtime = Arc::new(
        McpRuntime::with_connector(connector)
            .with_auth(AuthManager::with_fetcher(Arc::clone(&fetcher))),
    );

    let handle = mcp::http("http://secure/mcp").oauth2(
        "client",
        "secret",
        "http://auth.example/token",
    );

    let results = agent(AgentOptions::new().with_runtime(runtime))
        .then(McpStep::new(handle.clone(), "ping", json!({})))
        .then(McpStep::new(handle, "ping", json!({})))
        .run()
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);

    let calls = server.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].auth_header.as_deref(), Some("Bearer oauth-token-0"));
    assert_eq!(calls[0].auth_header, calls[1].auth_header);
}

// ---------------------------------------------------------------------------
// Scenario: reliability
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn timeout_then_recovery_keeps_only_successful_attempt() {
    let llm = Arc::new(MockLlm::new(vec![
        MockTurn::text("slow").after(Duration::from_secs(2)),
        MockTurn::text("ok"),
    ]));

    let results = agent(AgentOptions::new().with_llm(Arc::clone(&llm)))
        .then(
            LlmStep::new("hurry")
                .with_timeout(1.0)
                .with_retry(RetryPolicy { retries: Some(2), delay: None, backoff: None }),
        )
        .run()
        .await
        .unwrap();

    assert_eq!(results[0].llm_output.as_deref(), Some("ok"));
    assert_eq!(llm.calls(), 2);
    // durationMs reflects only the successful attempt, not the timed-out one.
    assert!(results[0].duration_ms < 1000);
}

#[tokio::test]
async fn non_retryable_llm_failure_surfaces_with_meta() {
    let llm = Arc::new(MockLlm::new(vec![MockTurn::failure(400)]));
    let err = agent(AgentOptions::new().with_llm(Arc::clone(&llm)))
        .then("doomed")
        .run()
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Llm);
    assert!(!err.retryable());
    assert_eq!(err.meta().step_id.as_deref(), Some("step-0"));
    assert_eq!(err.meta().provider.as_deref(), Some("llm:mock-model"));
    assert_eq!(llm.calls(), 1);
}

#[tokio::test]
async fn conflicting_retry_config_fails_before_any_io() {
    let llm = llm_of(&["never"]);
    let err = agent(options_with(&llm))
        .then(LlmStep::new("x").with_retry(RetryPolicy {
            retries: None,
            delay: Some(1.0),
            backoff: Some(2.0),
        }))
        .run()
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(llm.calls(), 0);
}

// ---------------------------------------------------------------------------
// Scenario: drivers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_run_is_refused() {
    let llm = Arc::new(MockLlm::new(vec![
        MockTurn::text("slow").after(Duration::from_millis(100)),
    ]));
    let shared = Arc::new(agent(AgentOptions::new().with_llm(Arc::clone(&llm))).then("work").build());

    let first = {
        let agent = Arc::clone(&shared);
        tokio::spawn(async move { agent.run().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = shared.run().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AgentConcurrency);

    // The original run is unaffected.
    let results = first.await.unwrap().unwrap();
    assert_eq!(results[0].llm_output.as_deref(), Some("slow"));

    // And the gate reopens afterwards.
    assert!(shared.run().await.is_ok());
}

#[tokio::test]
async fn stream_yields_steps_without_aggregates() {
    let llm = llm_of(&["r1", "r2"]);
    let stream = agent(options_with(&llm)).then("a").then("b").stream();
    let collected: Vec<_> = stream.collect().await;

    assert_eq!(collected.len(), 2);
    let last = collected[1].as_ref().unwrap();
    assert_eq!(last.llm_output.as_deref(), Some("r2"));
    assert!(last.total_duration_ms.is_none());
}

#[tokio::test]
async fn callbacks_fire_per_step_and_per_token() {
    let llm = llm_of(&["streamed output here"]);
    let steps_seen = Arc::new(AtomicUsize::new(0));
    let tokens_seen = Arc::new(AtomicUsize::new(0));

    let steps = Arc::clone(&steps_seen);
    let tokens = Arc::clone(&tokens_seen);
    let config = RunConfig::new()
        .on_step(move |_result, _index| {
            steps.fetch_add(1, Ordering::SeqCst);
        })
        .on_token(move |chunk, meta| {
            assert!(!chunk.is_empty());
            assert_eq!(meta.model, "mock-model");
            tokens.fetch_add(1, Ordering::SeqCst);
        });

    let results = agent(options_with(&llm))
        .then("talk")
        .run_with(config)
        .await
        .unwrap();

    assert_eq!(results[0].llm_output.as_deref(), Some("streamed output here"));
    assert_eq!(steps_seen.load(Ordering::SeqCst), 1);
    assert_eq!(tokens_seen.load(Ordering::SeqCst), 3);
}

// ---------------------------------------------------------------------------
// Determinism
// ---------------------------------------------------------------------------

#[tokio::test]
async fn handle_ids_are_deterministic_and_short() {
    let a = mcp::http("http://tools.example.com/mcp");
    let b = mcp::http("http://tools.example.com/mcp");
    assert_eq!(a.id, b.id);
    assert_eq!(a.id.len(), 12);

    let (_, runtime) = tool_runtime("http://tools/mcp");
    let handle = mcp::http("http://tools/mcp");
    let tools = runtime
        .discover_tools(&[handle], &HashMap::new())
        .await
        .unwrap();
    for tool in &tools {
        assert!(tool.name.len() <= 64);
    }
}

#[tokio::test]
async fn discovery_is_cached_within_ttl() {
    let (server, runtime) = tool_runtime("http://tools/mcp");
    let handles = [mcp::http("http://tools/mcp")];

    let first = runtime.discover_tools(&handles, &HashMap::new()).await.unwrap();
    let second = runtime.discover_tools(&handles, &HashMap::new()).await.unwrap();

    let names =
        |tools: &[ToolDefinition]| tools.iter().map(|t| t.name.clone()).collect::<Vec<_>>();
    assert_eq!(names(&first), names(&second));
    assert_eq!(server.list_calls(), 1);
}
