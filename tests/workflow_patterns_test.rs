//! End-to-end workflow pattern execution through the fabric facade.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use weft::{
    AgentConfig, AgentId, CompletionRequest, CompletionResponse, ConcurrencyLimit, Fabric,
    FabricConfig, FabricError, LlmClient, LlmError, ScriptedClient, TokenUsage, WorkflowError,
    WorkflowEvent, WorkflowStatus,
};

fn agent(id: &str) -> AgentId {
    AgentId::try_new(id.to_string()).unwrap()
}

async fn fabric_with(
    dir: &TempDir,
    llm: Arc<dyn LlmClient>,
    concurrency: usize,
) -> Arc<Fabric> {
    let config = FabricConfig::builder()
        .store_path(dir.path().join("workflows.db"))
        .concurrency_limit(ConcurrencyLimit::try_new(concurrency).unwrap())
        .build()
        .unwrap();
    Fabric::new(config, llm).await.unwrap()
}

async fn register(fabric: &Fabric, ids: &[&str]) {
    for id in ids {
        fabric
            .create_agent(agent(id), AgentConfig::new(id, &format!("you are {id}")))
            .await
            .unwrap();
    }
}

async fn drain_to_terminal(events: &mut mpsc::Receiver<WorkflowEvent>) -> Vec<WorkflowEvent> {
    let mut seen = Vec::new();
    let deadline = tokio::time::timeout(Duration::from_secs(30), async {
        while let Some(event) = events.recv().await {
            let terminal = matches!(
                event,
                WorkflowEvent::Completed { .. }
                    | WorkflowEvent::Failed { .. }
                    | WorkflowEvent::Cancelled
                    | WorkflowEvent::TimedOut { .. }
            );
            seen.push(event);
            if terminal {
                break;
            }
        }
    });
    deadline.await.expect("workflow should reach a terminal event");
    seen
}

fn terminal_output(events: &[WorkflowEvent]) -> String {
    match events.last() {
        Some(WorkflowEvent::Completed { output, .. }) => output.clone(),
        other => panic!("expected completion, got {other:?}"),
    }
}

/// Client that tracks the high-water mark of concurrent completions.
struct GaugeClient {
    current: AtomicUsize,
    peak: AtomicUsize,
    latency: Duration,
}

impl GaugeClient {
    fn new(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            latency,
        })
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for GaugeClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        self.current.fetch_sub(1, Ordering::SeqCst);

        let who = request
            .messages
            .first()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(CompletionResponse {
            content: format!("result from {who}"),
            tool_calls: Vec::new(),
            usage: TokenUsage::zero(),
        })
    }

    fn model_name(&self) -> &str {
        "gauge"
    }
}

#[test_log::test(tokio::test)]
async fn test_should_cap_concurrent_llm_calls_when_fork_join_fans_out() {
    let dir = TempDir::new().unwrap();
    let gauge = GaugeClient::new(Duration::from_millis(100));
    let fabric = fabric_with(&dir, gauge.clone(), 2).await;
    register(&fabric, &["v1", "v2", "v3", "v4", "v5"]).await;

    let doc = json!({
        "type": "fork_join",
        "agent_ids": ["v1", "v2", "v3", "v4", "v5"],
        "prompt": "report in",
        "merge_strategy": "concatenate",
    });
    let (_, mut events) = fabric.run_workflow(&doc, "").await.unwrap();
    let seen = drain_to_terminal(&mut events).await;
    let output = terminal_output(&seen);

    // All five results are merged...
    for member in ["v1", "v2", "v3", "v4", "v5"] {
        assert!(output.contains(&format!("### {member}")), "missing {member}");
    }
    // ...and at no instant were more than two calls in flight.
    assert!(
        gauge.peak() <= 2,
        "llm concurrency exceeded the limit: {}",
        gauge.peak()
    );

    fabric.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_should_return_validation_error_naming_topic_when_debate_lacks_it() {
    let dir = TempDir::new().unwrap();
    let fabric = fabric_with(&dir, ScriptedClient::echo(), 2).await;
    register(&fabric, &["a", "b"]).await;

    let doc = json!({
        "type": "debate",
        "rounds": 3,
        "agent_ids": ["a", "b"],
    });
    let err = fabric.run_workflow(&doc, "x").await.unwrap_err();
    match err {
        FabricError::Workflow(WorkflowError::Validation { field, .. }) => {
            assert_eq!(field, "topic");
        }
        other => panic!("expected validation error, got {other:?}"),
    }

    // Nothing was activated: only the two standing agents exist.
    assert_eq!(fabric.list_agents().await.len(), 2);

    fabric.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_should_route_to_selected_branch_when_classifier_labels_input() {
    let dir = TempDir::new().unwrap();
    let llm = ScriptedClient::with_responses(vec![
        Ok(CompletionResponse {
            content: "medium".to_string(),
            tool_calls: Vec::new(),
            usage: TokenUsage::zero(),
        }),
        Ok(CompletionResponse {
            content: "handled by b".to_string(),
            tool_calls: Vec::new(),
            usage: TokenUsage::zero(),
        }),
    ]);
    let fabric = fabric_with(&dir, llm, 2).await;
    register(&fabric, &["clf", "a", "b", "c"]).await;

    let doc = json!({
        "type": "conditional",
        "classifier": "clf",
        "branches": {"simple": "a", "medium": "b", "complex": "c"},
    });
    let (_, mut events) = fabric.run_workflow(&doc, "x").await.unwrap();
    let seen = drain_to_terminal(&mut events).await;
    assert_eq!(terminal_output(&seen), "handled by b");

    fabric.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_should_thread_output_through_stages_when_pipeline_runs() {
    let dir = TempDir::new().unwrap();
    let fabric = fabric_with(&dir, ScriptedClient::echo(), 2).await;
    register(&fabric, &["draft", "polish"]).await;

    let doc = json!({
        "type": "pipeline",
        "initial_prompt": "Write a haiku about queues.",
        "stages": [{"agent": "draft"}, {"agent": "polish"}],
    });
    let (workflow_id, mut events) = fabric.run_workflow(&doc, "").await.unwrap();
    let seen = drain_to_terminal(&mut events).await;

    let stages = seen
        .iter()
        .filter(|e| matches!(e, WorkflowEvent::StageStarted { .. }))
        .count();
    assert_eq!(stages, 2);

    // The echo client nests each stage's framing, so stage 2 saw stage
    // 1's output.
    let output = terminal_output(&seen);
    assert!(output.starts_with("echo: echo:"));

    match fabric.get_workflow_status(workflow_id).await.unwrap() {
        WorkflowStatus::Completed { .. } => {}
        other => panic!("expected completed status, got {other:?}"),
    }

    fabric.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_should_pick_most_common_answer_when_fork_join_merges_by_vote() {
    let dir = TempDir::new().unwrap();
    let llm = ScriptedClient::with_responses(vec![
        Ok(CompletionResponse {
            content: "YES".to_string(),
            tool_calls: Vec::new(),
            usage: TokenUsage::zero(),
        }),
        Ok(CompletionResponse {
            content: "yes.".to_string(),
            tool_calls: Vec::new(),
            usage: TokenUsage::zero(),
        }),
        Ok(CompletionResponse {
            content: "no".to_string(),
            tool_calls: Vec::new(),
            usage: TokenUsage::zero(),
        }),
    ]);
    let fabric = fabric_with(&dir, llm, 2).await;
    register(&fabric, &["v1", "v2", "v3"]).await;

    let doc = json!({
        "type": "fork_join",
        "agent_ids": ["v1", "v2", "v3"],
        "prompt": "ship it?",
        "merge_strategy": "vote",
    });
    let (_, mut events) = fabric.run_workflow(&doc, "").await.unwrap();
    let seen = drain_to_terminal(&mut events).await;
    assert_eq!(terminal_output(&seen), "yes");

    fabric.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_should_tolerate_failures_when_min_successes_met() {
    let dir = TempDir::new().unwrap();
    let llm = ScriptedClient::with_responses(vec![
        Err(LlmError::Provider {
            message: "flaky".to_string(),
        }),
        Ok(CompletionResponse {
            content: "alpha view".to_string(),
            tool_calls: Vec::new(),
            usage: TokenUsage::zero(),
        }),
        Ok(CompletionResponse {
            content: "beta view".to_string(),
            tool_calls: Vec::new(),
            usage: TokenUsage::zero(),
        }),
    ]);
    let fabric = fabric_with(&dir, llm, 1).await;
    register(&fabric, &["v1", "v2", "v3"]).await;

    let doc = json!({
        "type": "fork_join",
        "agent_ids": ["v1", "v2", "v3"],
        "prompt": "analyse",
        "merge_strategy": "concatenate",
        "min_successes": 2,
    });
    let (_, mut events) = fabric.run_workflow(&doc, "").await.unwrap();
    let seen = drain_to_terminal(&mut events).await;
    let output = terminal_output(&seen);
    assert!(output.contains("alpha view") || output.contains("beta view"));

    let failures = seen
        .iter()
        .filter(|e| matches!(e, WorkflowEvent::AgentFailed { .. }))
        .count();
    assert_eq!(failures, 1);

    fabric.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_should_aggregate_verdicts_when_swarm_votes_by_majority() {
    let dir = TempDir::new().unwrap();
    let llm = ScriptedClient::with_responses(vec![
        Ok(CompletionResponse {
            content: r#"{"verdict": "approve", "confidence": 0.9}"#.to_string(),
            tool_calls: Vec::new(),
            usage: TokenUsage::zero(),
        }),
        Ok(CompletionResponse {
            content: r#"{"verdict": "approve", "confidence": 0.8}"#.to_string(),
            tool_calls: Vec::new(),
            usage: TokenUsage::zero(),
        }),
        Ok(CompletionResponse {
            content: r#"{"verdict": "reject", "confidence": 0.9}"#.to_string(),
            tool_calls: Vec::new(),
            usage: TokenUsage::zero(),
        }),
    ]);
    let fabric = fabric_with(&dir, llm, 2).await;
    register(&fabric, &["v1", "v2", "v3"]).await;

    let doc = json!({
        "type": "swarm",
        "agent_ids": ["v1", "v2", "v3"],
        "prompt": "should we merge this change?",
        "strategy": "majority",
        "confidence_threshold": 0.6,
    });
    let (_, mut events) = fabric.run_workflow(&doc, "").await.unwrap();
    let seen = drain_to_terminal(&mut events).await;
    assert_eq!(terminal_output(&seen), "approve");

    fabric.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_should_run_all_rounds_when_debate_configured() {
    let dir = TempDir::new().unwrap();
    let fabric = fabric_with(&dir, ScriptedClient::echo(), 2).await;
    register(&fabric, &["optimist", "skeptic", "mod"]).await;

    let doc = json!({
        "type": "debate",
        "topic": "monolith or microservices",
        "rounds": 2,
        "agent_ids": ["optimist", "skeptic"],
        "moderator": "mod",
    });
    let (_, mut events) = fabric.run_workflow(&doc, "").await.unwrap();
    let seen = drain_to_terminal(&mut events).await;

    let rounds = seen
        .iter()
        .filter(|e| matches!(e, WorkflowEvent::RoundCompleted { .. }))
        .count();
    assert_eq!(rounds, 2);

    // 2 debaters x 2 rounds, plus the moderator synthesis at the end.
    let completions = seen
        .iter()
        .filter(|e| matches!(e, WorkflowEvent::AgentCompleted { .. }))
        .count();
    assert_eq!(completions, 4);
    assert!(!terminal_output(&seen).is_empty());

    fabric.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_should_converse_through_queue_and_bus_when_event_driven() {
    let dir = TempDir::new().unwrap();
    let fabric = fabric_with(&dir, ScriptedClient::echo(), 2).await;
    register(&fabric, &["hub", "spoke"]).await;

    let doc = json!({
        "name": "ops",
        "entrypoint": "hub",
        "agents": [{"id": "hub"}, {"id": "spoke"}],
        "communication": {"mode": "hub_and_spoke"},
        "max_rounds": 2,
    });
    let (_, mut events) = fabric.run_workflow(&doc, "triage the incident").await.unwrap();
    let seen = drain_to_terminal(&mut events).await;

    let output = terminal_output(&seen);
    assert!(output.contains("triage the incident"));

    // Workflow members are torn down shortly after completion, leaving
    // only the two standing agents.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while fabric.list_agents().await.len() != 2 {
        assert!(
            tokio::time::Instant::now() < deadline,
            "composite ids were not deregistered"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fabric.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_should_discard_partial_results_when_workflow_cancelled() {
    let dir = TempDir::new().unwrap();
    let gauge = GaugeClient::new(Duration::from_millis(300));
    let fabric = fabric_with(&dir, gauge, 2).await;
    register(&fabric, &["slow"]).await;

    let doc = json!({
        "type": "pipeline",
        "initial_prompt": "think hard",
        "stages": [
            {"agent": "slow"}, {"agent": "slow"}, {"agent": "slow"},
            {"agent": "slow"}, {"agent": "slow"},
        ],
    });
    let (workflow_id, mut events) = fabric.run_workflow(&doc, "").await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    fabric.cancel_workflow(workflow_id).unwrap();

    let seen = drain_to_terminal(&mut events).await;
    assert!(matches!(seen.last(), Some(WorkflowEvent::Cancelled)));
    match fabric.get_workflow_status(workflow_id).await.unwrap() {
        WorkflowStatus::Cancelled => {}
        other => panic!("expected cancelled status, got {other:?}"),
    }

    fabric.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_should_time_out_workflow_when_budget_exceeded() {
    let dir = TempDir::new().unwrap();
    let gauge = GaugeClient::new(Duration::from_millis(400));
    let fabric = fabric_with(&dir, gauge, 2).await;
    register(&fabric, &["slow"]).await;

    let doc = json!({
        "type": "pipeline",
        "timeout_seconds": 1,
        "initial_prompt": "think hard",
        "stages": [
            {"agent": "slow"}, {"agent": "slow"}, {"agent": "slow"},
            {"agent": "slow"}, {"agent": "slow"},
        ],
    });
    let (workflow_id, mut events) = fabric.run_workflow(&doc, "").await.unwrap();
    let seen = drain_to_terminal(&mut events).await;
    assert!(matches!(
        seen.last(),
        Some(WorkflowEvent::TimedOut { timeout_seconds: 1 })
    ));
    match fabric.get_workflow_status(workflow_id).await.unwrap() {
        WorkflowStatus::TimedOut { .. } => {}
        other => panic!("expected timed-out status, got {other:?}"),
    }

    fabric.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_should_open_circuit_when_token_limit_failures_repeat() {
    let dir = TempDir::new().unwrap();
    let limit = || {
        Err(LlmError::OutputTokenLimit {
            model: "scripted".to_string(),
        })
    };
    let llm = ScriptedClient::with_responses(vec![limit(), limit(), limit(), limit()]);
    let fabric = fabric_with(&dir, llm, 2).await;
    register(&fabric, &["writer"]).await;

    let doc = json!({
        "type": "pipeline",
        "initial_prompt": "write a novel",
        "stages": [{"agent": "writer"}],
    });
    let (_, mut events) = fabric.run_workflow(&doc, "").await.unwrap();
    let seen = drain_to_terminal(&mut events).await;
    match seen.last() {
        Some(WorkflowEvent::Failed { error }) => {
            assert!(error.contains("circuit breaker"), "unexpected error: {error}");
        }
        other => panic!("expected failure, got {other:?}"),
    }

    fabric.shutdown().await;
}
