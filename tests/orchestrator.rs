use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use overlay_agent::history::HistoryLog;
use overlay_agent::interaction::{ConfirmRequest, PlanProposal, Resolution};
use overlay_agent::llm::{
    AdapterKind, AdapterRegistry, EventSink, Message, MessageRole, ProviderAdapter, RawEvent, Script,
    ScriptStep, ScriptedAdapter, StreamConfig,
};
use overlay_agent::normalized::{NormalizedEvent, ResultSubtype, event_name};
use overlay_agent::runtime::{AgentServices, RunManager, RunRequest, RunSettings};
use overlay_agent::session::SessionStore;
use overlay_agent::undo::UndoCoordinator;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::broadcast;

struct Harness {
    _dir: TempDir,
    services: Arc<AgentServices>,
    runs: RunManager,
}

fn harness(adapters: AdapterRegistry) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let settings = RunSettings {
        project_dir: dir.path().to_path_buf(),
        dev_server_port: Some(5173),
        default_provider: "api".to_string(),
        default_model: None,
        confirm_commands: false,
        command_timeout: Duration::from_secs(5),
        locale: None,
    };
    let services = AgentServices::new(
        adapters,
        SessionStore::in_memory(),
        HistoryLog::default(),
        UndoCoordinator::git(vec![".overlay-agent".to_string()]),
        settings,
    )
    .shared();
    let runs = RunManager::new(Arc::clone(&services));
    Harness {
        _dir: dir,
        services,
        runs,
    }
}

fn single(kind: AdapterKind, script: Script) -> (ScriptedAdapter, Harness) {
    let adapter = ScriptedAdapter::new(kind, "test-model").with_turn(script);
    let h = harness(AdapterRegistry::new().with("api", Arc::new(adapter.clone())));
    (adapter, h)
}

async fn next_event(rx: &mut broadcast::Receiver<NormalizedEvent>) -> NormalizedEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

async fn until_done(rx: &mut broadcast::Receiver<NormalizedEvent>) -> Vec<NormalizedEvent> {
    let mut events = Vec::new();
    loop {
        let event = next_event(rx).await;
        let done = matches!(event, NormalizedEvent::Done { .. });
        events.push(event);
        if done {
            return events;
        }
    }
}

fn kinds(events: &[NormalizedEvent]) -> Vec<&'static str> {
    events.iter().map(event_name).collect()
}

fn result_of(events: &[NormalizedEvent]) -> &overlay_agent::normalized::RunResult {
    events
        .iter()
        .find_map(|e| match e {
            NormalizedEvent::Result(r) => Some(r),
            _ => None,
        })
        .expect("no result event")
}

#[tokio::test]
async fn test_ordinary_tools_are_forwarded_one_to_one() {
    let script = Script::events([
        RawEvent::TextDelta { text: "Reading".into() },
        RawEvent::ToolCall {
            id: "t1".into(),
            name: "read_file".into(),
            input: json!({ "path": "src/App.tsx" }),
        },
        RawEvent::ToolResult {
            id: "t1".into(),
            name: "read_file".into(),
            output: "export default App".into(),
            is_error: false,
        },
        RawEvent::FinishStep,
        RawEvent::Usage { input_tokens: 120, output_tokens: 30 },
        RawEvent::Finish,
    ])
    .resolving(vec![Message::assistant("Done reading")]);
    let (_adapter, h) = single(AdapterKind::ToolAugmented, script);
    let mut rx = h.runs.subscribe();

    h.runs.start(RunRequest::prompt("look at the app")).await.unwrap();
    let events = until_done(&mut rx).await;

    assert_eq!(kinds(&events), vec!["text", "tool_use", "tool_result", "result", "done"]);
    let result = result_of(&events);
    assert_eq!(result.subtype, ResultSubtype::Success);
    assert!(!result.is_error);
    assert_eq!(result.num_turns, 1);
    assert_eq!(result.input_tokens, Some(120));
    assert_eq!(result.output_tokens, Some(30));

    let messages = h.services.session.messages().await;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[1].content, "Done reading");
    assert!(!h.services.gate.is_paused());
}

#[tokio::test]
async fn test_plan_pauses_the_run_and_approval_starts_a_follow_up() {
    let script = Script::events([
        RawEvent::TextDelta { text: "Planning".into() },
        RawEvent::ToolCall {
            id: "p1".into(),
            name: "propose_plan".into(),
            input: json!({ "plan": "# Add login\n1. Form\n2. Session" }),
        },
        RawEvent::TextDelta { text: "must not show".into() },
        RawEvent::ToolCall {
            id: "t2".into(),
            name: "write_file".into(),
            input: json!({ "path": "a.txt", "content": "x" }),
        },
    ])
    .then(ScriptStep::WaitForCancel)
    .resolving(vec![Message::assistant("Proposed a plan")]);
    let (adapter, h) = single(AdapterKind::ToolAugmented, script);
    let mut rx = h.runs.subscribe();

    h.runs.start(RunRequest::prompt("add login")).await.unwrap();
    let events = until_done(&mut rx).await;

    assert_eq!(kinds(&events), vec!["text", "plan", "result", "done"]);
    let NormalizedEvent::Plan { plan_id, plan_title, plan_content } = &events[1] else {
        panic!("expected a plan event");
    };
    assert_eq!(plan_title, "Add login");
    assert_eq!(plan_content, "1. Form\n2. Session");
    assert_eq!(result_of(&events).subtype, ResultSubtype::WaitingForInput);
    assert!(!h.services.gate.is_paused());

    // Messages produced before the pause are still captured.
    let messages = h.services.session.messages().await;
    assert_eq!(messages.last().unwrap().content, "Proposed a plan");
    assert_eq!(h.services.interactions.plans.pending().len(), 1);

    h.runs.approve_plan(plan_id).await.unwrap();
    let follow_up = until_done(&mut rx).await;
    assert_eq!(result_of(&follow_up).subtype, ResultSubtype::Success);

    let calls = adapter.calls();
    assert_eq!(calls.len(), 2);
    let prompt = &calls[1].messages.last().unwrap().content;
    assert!(prompt.contains("Add login"));
    assert!(prompt.contains("Implement"));
    assert!(h.services.interactions.plans.pending().is_empty());
    assert!(h.runs.approve_plan(plan_id).await.is_err());
}

#[tokio::test]
async fn test_question_pauses_and_answers_continue() {
    let script = Script::events([RawEvent::ToolCall {
        id: "q1".into(),
        name: "AskUserQuestion".into(),
        input: json!({ "questions": [{ "question": "Which color?", "options": [{ "label": "Blue" }] }] }),
    }])
    .then(ScriptStep::WaitForCancel);
    let (adapter, h) = single(AdapterKind::SelfContained, script);
    let mut rx = h.runs.subscribe();

    h.runs.start(RunRequest::prompt("restyle the header")).await.unwrap();
    let events = until_done(&mut rx).await;
    assert_eq!(kinds(&events), vec!["question", "result", "done"]);
    let NormalizedEvent::Question { question_id, questions } = &events[0] else {
        panic!("expected a question event");
    };
    assert_eq!(questions[0].question, "Which color?");

    h.runs
        .answer_question(question_id, json!(["Blue"]))
        .await
        .unwrap();
    until_done(&mut rx).await;

    let calls = adapter.calls();
    let prompt = &calls[1].messages.last().unwrap().content;
    assert!(prompt.contains("Which color?"));
    assert!(prompt.contains("Blue"));
    assert!(prompt.contains("restyle the header"));
}

#[tokio::test]
async fn test_native_plan_mode_buffers_text_until_exit() {
    let script = Script::events([
        RawEvent::ToolCall { id: "e".into(), name: "EnterPlanMode".into(), input: json!({}) },
        RawEvent::TextDelta { text: "# Refactor\nSplit the router".into() },
        RawEvent::ToolCall { id: "x".into(), name: "ExitPlanMode".into(), input: json!({}) },
        RawEvent::ToolResult { id: "x".into(), name: "ExitPlanMode".into(), output: "ok".into(), is_error: false },
    ])
    .then(ScriptStep::WaitForCancel);
    let (_adapter, h) = single(AdapterKind::SelfContained, script);
    let mut rx = h.runs.subscribe();

    h.runs.start(RunRequest::prompt("refactor")).await.unwrap();
    let events = until_done(&mut rx).await;

    assert_eq!(kinds(&events), vec!["plan", "result", "done"]);
    assert!(matches!(
        &events[0],
        NormalizedEvent::Plan { plan_title, plan_content, .. }
            if plan_title == "Refactor" && plan_content == "Split the router"
    ));
}

#[tokio::test]
async fn test_new_run_supersedes_without_terminal_events() {
    let adapter = ScriptedAdapter::new(AdapterKind::ToolAugmented, "test-model")
        .with_turn(Script::events([RawEvent::TextDelta { text: "first".into() }]).then(ScriptStep::WaitForCancel))
        .with_turn(Script::events([RawEvent::TextDelta { text: "second".into() }, RawEvent::Finish]));
    let h = harness(AdapterRegistry::new().with("api", Arc::new(adapter.clone())));
    let mut rx = h.runs.subscribe();

    h.runs.start(RunRequest::prompt("one")).await.unwrap();
    assert!(matches!(next_event(&mut rx).await, NormalizedEvent::Text { text, .. } if text == "first"));

    h.runs.start(RunRequest::prompt("two")).await.unwrap();
    let events = until_done(&mut rx).await;

    assert_eq!(kinds(&events), vec!["text", "result", "done"]);
    assert_eq!(events.iter().filter(|e| matches!(e, NormalizedEvent::Result(_))).count(), 1);
    assert!(!h.services.gate.is_paused());
}

#[tokio::test]
async fn test_cancel_emits_done_only() {
    let script = Script::events([RawEvent::TextDelta { text: "working".into() }]).then(ScriptStep::WaitForCancel);
    let (_adapter, h) = single(AdapterKind::SelfContained, script);
    let mut rx = h.runs.subscribe();

    h.runs.start(RunRequest::prompt("go")).await.unwrap();
    next_event(&mut rx).await;
    assert!(h.runs.is_running().await);

    assert!(h.runs.cancel().await);
    let events = until_done(&mut rx).await;
    assert!(matches!(&events[..], [NormalizedEvent::Done { message }] if message == "Cancelled"));
    assert!(!h.runs.is_running().await);
    assert!(!h.runs.cancel().await);
    assert!(!h.services.gate.is_paused());
}

/// First call issues a slow file write that ignores cancellation; later
/// calls finish immediately.
#[derive(Debug, Default)]
struct SlowWriteAdapter {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl ProviderAdapter for SlowWriteAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::ToolAugmented
    }

    fn default_model(&self) -> &str {
        "slow-model"
    }

    async fn stream_response(
        &self,
        sink: EventSink,
        _messages: Vec<Message>,
        config: StreamConfig,
    ) -> anyhow::Result<Vec<Message>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            sink.send(RawEvent::ToolCall {
                id: "w1".into(),
                name: "write_file".into(),
                input: json!({ "path": "x.txt", "content": "done" }),
            })
            .await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            tokio::fs::write(config.project_dir.join("x.txt"), "done").await?;
            return Ok(Vec::new());
        }
        sink.send(RawEvent::Finish).await;
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_superseding_lets_in_flight_tool_call_finish() {
    let h = harness(AdapterRegistry::new().with("api", Arc::new(SlowWriteAdapter::default())));
    let project_dir = h.services.settings.project_dir.clone();
    let mut rx = h.runs.subscribe();

    h.runs.start(RunRequest::prompt("write it")).await.unwrap();
    assert!(matches!(next_event(&mut rx).await, NormalizedEvent::ToolUse { tool, .. } if tool == "write_file"));

    h.runs.start(RunRequest::prompt("next")).await.unwrap();
    assert_eq!(std::fs::read_to_string(project_dir.join("x.txt")).unwrap(), "done");

    let events = until_done(&mut rx).await;
    assert_eq!(kinds(&events), vec!["result", "done"]);
}

fn pending_plan() -> PlanProposal {
    PlanProposal {
        title: "Plan".into(),
        content: "Steps".into(),
        prompt: "go".into(),
        provider: "api".into(),
        model: "test-model".into(),
    }
}

fn pending_confirm() -> ConfirmRequest {
    ConfirmRequest {
        tool_name: "run_command".into(),
        summary: "npm install".into(),
        details: None,
    }
}

#[tokio::test]
async fn test_cancel_rejects_pending_interactions() {
    let script = Script::events([RawEvent::TextDelta { text: "working".into() }]).then(ScriptStep::WaitForCancel);
    let (_adapter, h) = single(AdapterKind::ToolAugmented, script);
    let mut rx = h.runs.subscribe();

    h.runs.start(RunRequest::prompt("go")).await.unwrap();
    next_event(&mut rx).await;
    let confirm = h.services.interactions.confirms.register(pending_confirm());
    let plan = h.services.interactions.plans.register(pending_plan());

    assert!(h.runs.cancel().await);

    let confirmed = tokio::time::timeout(Duration::from_secs(5), confirm.outcome)
        .await
        .expect("confirm waiter still blocked")
        .unwrap();
    assert_eq!(confirmed, Resolution::Rejected);
    assert_eq!(plan.outcome.await.unwrap(), Resolution::Rejected);
    assert!(h.services.interactions.confirms.pending().is_empty());
    assert!(h.services.interactions.plans.pending().is_empty());
}

#[tokio::test]
async fn test_superseding_rejects_pending_confirm() {
    let adapter = ScriptedAdapter::new(AdapterKind::ToolAugmented, "test-model")
        .with_turn(Script::events([RawEvent::TextDelta { text: "first".into() }]).then(ScriptStep::WaitForCancel))
        .with_turn(Script::events([RawEvent::Finish]));
    let h = harness(AdapterRegistry::new().with("api", Arc::new(adapter.clone())));
    let mut rx = h.runs.subscribe();

    h.runs.start(RunRequest::prompt("one")).await.unwrap();
    next_event(&mut rx).await;
    let confirm = h.services.interactions.confirms.register(pending_confirm());

    h.runs.start(RunRequest::prompt("two")).await.unwrap();

    let confirmed = tokio::time::timeout(Duration::from_secs(5), confirm.outcome)
        .await
        .expect("confirm waiter still blocked")
        .unwrap();
    assert_eq!(confirmed, Resolution::Rejected);
    assert!(
        h.services
            .interactions
            .confirms
            .resolve(&confirm.id, Resolution::Approved(serde_json::Value::Null))
            .is_none()
    );
}

#[tokio::test]
async fn test_adapter_failure_reports_error() {
    let script = Script::default().then(ScriptStep::Fail("provider unavailable".into()));
    let (_adapter, h) = single(AdapterKind::ToolAugmented, script);
    let mut rx = h.runs.subscribe();

    h.runs.start(RunRequest::prompt("go")).await.unwrap();
    let events = until_done(&mut rx).await;

    assert_eq!(kinds(&events), vec!["error", "result", "done"]);
    assert!(matches!(&events[0], NormalizedEvent::Error { message } if message == "provider unavailable"));
    let result = result_of(&events);
    assert_eq!(result.subtype, ResultSubtype::ErrorDuringExecution);
    assert!(result.is_error);
    assert!(!h.services.gate.is_paused());
}

#[tokio::test]
async fn test_adapter_panic_still_cleans_up() {
    let script = Script::default().then(ScriptStep::Panic("adapter bug".into()));
    let (_adapter, h) = single(AdapterKind::ToolAugmented, script);
    let mut rx = h.runs.subscribe();

    h.runs.start(RunRequest::prompt("go")).await.unwrap();
    let events = until_done(&mut rx).await;

    assert_eq!(kinds(&events), vec!["error", "result", "done"]);
    assert!(!h.services.gate.is_paused());
}

#[tokio::test]
async fn test_backend_tool_errors_are_hidden_for_self_contained_runs() {
    let script = Script::events([
        RawEvent::ToolCall { id: "b".into(), name: "Bash".into(), input: json!({ "command": "npm test" }) },
        RawEvent::ToolResult { id: "b".into(), name: "Bash".into(), output: "exit 1".into(), is_error: true },
        RawEvent::Finish,
    ]);
    let (_adapter, h) = single(AdapterKind::SelfContained, script);
    let mut rx = h.runs.subscribe();

    h.runs.start(RunRequest::prompt("test")).await.unwrap();
    let events = until_done(&mut rx).await;

    assert_eq!(kinds(&events), vec!["tool_use", "result", "done"]);
}

#[tokio::test]
async fn test_confirm_events_are_relayed() {
    let script = Script::events([
        RawEvent::ConfirmRequested {
            confirm_id: "c1".into(),
            tool_name: "run_command".into(),
            summary: "npm install".into(),
            details: None,
        },
        RawEvent::ConfirmResolved {
            confirm_id: "c1".into(),
            tool_name: "run_command".into(),
            summary: "npm install".into(),
            approved: false,
        },
        RawEvent::Finish,
    ]);
    let (_adapter, h) = single(AdapterKind::ToolAugmented, script);
    let mut rx = h.runs.subscribe();

    h.runs.start(RunRequest::prompt("install")).await.unwrap();
    let events = until_done(&mut rx).await;

    assert_eq!(kinds(&events), vec!["confirm", "confirm_resolved", "result", "done"]);
    assert!(matches!(
        &events[1],
        NormalizedEvent::ConfirmResolved { resolved: true, approved: false, .. }
    ));
}

#[tokio::test]
async fn test_switching_to_self_contained_provider_resets_history() {
    let api = ScriptedAdapter::new(AdapterKind::ToolAugmented, "gpt")
        .with_turn(Script::events([RawEvent::Finish]).resolving(vec![Message::assistant("hi")]));
    let cli = ScriptedAdapter::new(AdapterKind::SelfContained, "agent-cli");
    let h = harness(
        AdapterRegistry::new()
            .with("api", Arc::new(api.clone()))
            .with("cli", Arc::new(cli.clone())),
    );
    let mut rx = h.runs.subscribe();

    h.runs.start(RunRequest::prompt("one")).await.unwrap();
    until_done(&mut rx).await;
    assert_eq!(h.services.session.messages().await.len(), 2);

    h.runs
        .start(RunRequest {
            provider: Some("cli".into()),
            ..RunRequest::prompt("two")
        })
        .await
        .unwrap();
    until_done(&mut rx).await;

    let api_call = &api.calls()[0];
    assert!(api_call.system_prompt.is_some());
    assert!(api_call.tool_names.contains(&"read_file"));
    assert_eq!(api_call.model, "gpt");

    let cli_call = &cli.calls()[0];
    assert!(cli_call.system_prompt.is_none());
    assert!(cli_call.tool_names.is_empty());
    assert_eq!(cli_call.messages, vec![Message::user("two")]);
}

#[tokio::test]
async fn test_orphaned_user_message_is_dropped_before_next_run() {
    let adapter = ScriptedAdapter::new(AdapterKind::ToolAugmented, "test-model")
        .with_turn(Script::default().then(ScriptStep::Fail("network down".into())));
    let h = harness(AdapterRegistry::new().with("api", Arc::new(adapter.clone())));
    let mut rx = h.runs.subscribe();

    h.runs.start(RunRequest::prompt("first")).await.unwrap();
    until_done(&mut rx).await;
    assert_eq!(h.services.session.messages().await, vec![Message::user("first")]);

    h.runs.start(RunRequest::prompt("second")).await.unwrap();
    until_done(&mut rx).await;

    assert_eq!(adapter.calls()[1].messages, vec![Message::user("second")]);
}

#[tokio::test]
async fn test_unknown_provider_is_refused() {
    let (_adapter, h) = single(AdapterKind::ToolAugmented, Script::default());
    let err = h
        .runs
        .start(RunRequest {
            provider: Some("nope".into()),
            ..RunRequest::prompt("go")
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("nope"));
    assert!(!h.runs.is_running().await);
}

#[tokio::test]
async fn test_history_keeps_durable_events_only() {
    let script = Script::events([
        RawEvent::ReasoningStart,
        RawEvent::TextDelta { text: "Hel".into() },
        RawEvent::TextDelta { text: "lo".into() },
        RawEvent::ReasoningEnd,
        RawEvent::Finish,
    ]);
    let (_adapter, h) = single(AdapterKind::ToolAugmented, script);
    let mut rx = h.runs.subscribe();

    h.runs.start(RunRequest::prompt("greet")).await.unwrap();
    let events = until_done(&mut rx).await;
    assert_eq!(kinds(&events), vec!["status", "text", "text", "result", "done"]);

    let history: Vec<_> = h.services.history.entries().into_iter().map(|e| e.event).collect();
    assert_eq!(kinds(&history), vec!["text", "result"]);
    assert!(matches!(&history[0], NormalizedEvent::Text { text, .. } if text == "Hello"));
}
