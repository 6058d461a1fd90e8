//! Single-command flow: classify, gate, route, dispatch, respond.

mod common;

use std::time::Duration;

use common::{backbone, MockAgent, Recorder, ScriptedModel};
use orchestration::events::{
    ORCHESTRATOR_CLARIFICATION, ORCHESTRATOR_ERROR, ORCHESTRATOR_RESPONSE, UI_ERROR,
    UI_NOTIFICATION, UI_UPDATE, VOICE_SPEAK,
};
use orchestration::llm::LlmError;
use orchestration::payload;
use orchestration::router::LLM_BREAKER;

const FETCH_UNREAD: &str =
    r#"{"action":"fetch","target":"mail","parameters":{"filter":"unread"},"confidence":0.9}"#;

/// Emit a marker and wait for it; everything published earlier has then
/// been delivered.
async fn flush(bus: &orchestration::EventBus) {
    let marker = Recorder::on(bus, "test.flush");
    bus.emit("test.flush", payload! {}).unwrap();
    marker.wait_for(1).await;
}

#[tokio::test]
async fn test_confident_intent_reaches_agent_and_user() {
    let mail = MockAgent::new("mail");
    let bb = backbone(ScriptedModel::replying(&[FETCH_UNREAD]), vec![mail.clone()]);
    let responses = Recorder::on(&bb.bus, ORCHESTRATOR_RESPONSE);
    let updates = Recorder::on(&bb.bus, UI_UPDATE);
    let speech = Recorder::on(&bb.bus, VOICE_SPEAK);

    bb.router.process_intent("check my unread mail", "session-1").await;

    let response = &responses.wait_for(1).await[0];
    assert_eq!(response.payload["success"], true);
    assert_eq!(response.payload["target"], "mail");
    assert_eq!(response.payload["action"], "fetch");
    assert_eq!(response.payload["context_id"], "session-1");
    assert!(response.str_field("request_id").is_some());

    updates.wait_for(1).await;
    speech.wait_for(1).await;

    let calls = mail.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "fetch");
    // Routing metadata is stripped before the agent sees the parameters.
    assert_eq!(calls[0].1, payload! { "filter" => "unread" });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while bb.store.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "interaction never persisted");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    bb.bus.stop().await;
}

#[tokio::test]
async fn test_low_confidence_asks_for_clarification_instead_of_routing() {
    let mail = MockAgent::new("mail");
    let model = ScriptedModel::replying(&[
        r#"{"action": "fetch", "target": "mail", "parameters": {}, "confidence": 0.4}"#,
    ]);
    let bb = backbone(model, vec![mail.clone()]);
    let routed = Recorder::on(&bb.bus, "agent.*");
    let clarifications = Recorder::on(&bb.bus, ORCHESTRATOR_CLARIFICATION);
    let notifications = Recorder::on(&bb.bus, UI_NOTIFICATION);

    bb.router.process_intent("do the thing with the stuff", "session-2").await;
    flush(&bb.bus).await;

    let clarification = &clarifications.events()[0];
    assert_eq!(clarification.payload["input"], "do the thing with the stuff");
    assert_eq!(clarification.payload["confidence"], 0.4);
    assert_eq!(notifications.events()[0].payload["title"], "Clarification Needed");

    assert_eq!(routed.len(), 0);
    assert!(mail.calls().is_empty());
    assert!(bb.store.is_empty());
    bb.bus.stop().await;
}

#[tokio::test]
async fn test_unparseable_classification_is_treated_as_low_confidence() {
    let bb = backbone(ScriptedModel::replying(&["I am not sure"]), vec![MockAgent::new("mail")]);
    let routed = Recorder::on(&bb.bus, "agent.*");
    let clarifications = Recorder::on(&bb.bus, ORCHESTRATOR_CLARIFICATION);

    bb.router.process_intent("???", "session-3").await;
    flush(&bb.bus).await;

    assert_eq!(clarifications.len(), 1);
    assert_eq!(routed.len(), 0);
    bb.bus.stop().await;
}

#[tokio::test]
async fn test_unknown_target_is_reported_and_not_routed() {
    let model = ScriptedModel::replying(&[
        r#"{"action": "create", "target": "calendar", "parameters": {}, "confidence": 0.95}"#,
    ]);
    let bb = backbone(model, vec![MockAgent::new("mail")]);
    let routed = Recorder::on(&bb.bus, "agent.*");
    let errors = Recorder::on(&bb.bus, ORCHESTRATOR_ERROR);
    let notifications = Recorder::on(&bb.bus, UI_NOTIFICATION);
    let speech = Recorder::on(&bb.bus, VOICE_SPEAK);

    bb.router.process_intent("add a meeting tomorrow", "session-4").await;

    let error = &errors.wait_for(1).await[0];
    assert_eq!(error.payload["kind"], "unknown_target");
    assert_eq!(error.payload["input"], "add a meeting tomorrow");
    flush(&bb.bus).await;
    assert_eq!(routed.len(), 0);

    let notification = &notifications.events()[0];
    assert_eq!(notification.payload["title"], "Command Failed");
    assert_eq!(notification.payload["kind"], "unknown_target");
    let spoken = speech.events();
    assert_eq!(spoken.len(), 1);
    assert!(spoken[0].str_field("text").unwrap().contains("calendar"));
    bb.bus.stop().await;
}

#[tokio::test]
async fn test_model_failure_surfaces_as_dependency_error() {
    let model = ScriptedModel::new([Err(LlmError::Unavailable("connection refused".into()))]);
    let bb = backbone(model, vec![MockAgent::new("mail")]);
    let errors = Recorder::on(&bb.bus, ORCHESTRATOR_ERROR);
    let notifications = Recorder::on(&bb.bus, UI_NOTIFICATION);
    let speech = Recorder::on(&bb.bus, VOICE_SPEAK);

    bb.router.process_intent("check my mail", "session-5").await;

    let error = &errors.wait_for(1).await[0];
    assert_eq!(error.payload["kind"], "dependency_failed");
    assert!(error.payload["error"].as_str().unwrap().contains("connection refused"));
    flush(&bb.bus).await;
    assert_eq!(notifications.events()[0].payload["kind"], "dependency_failed");
    assert_eq!(speech.len(), 1);
    bb.bus.stop().await;
}

#[tokio::test]
async fn test_open_model_circuit_is_reported_to_the_user() {
    let model = ScriptedModel::replying(&[FETCH_UNREAD]);
    let bb = backbone(model.clone(), vec![MockAgent::new("mail")]);
    let llm = bb.breakers.get_or_create(LLM_BREAKER);
    for _ in 0..5 {
        let _ = llm.call(|| async { Err::<(), _>("model down") }).await;
    }
    let errors = Recorder::on(&bb.bus, ORCHESTRATOR_ERROR);
    let notifications = Recorder::on(&bb.bus, UI_NOTIFICATION);
    let speech = Recorder::on(&bb.bus, VOICE_SPEAK);

    bb.router.process_intent("check my unread mail", "session-8").await;

    let error = &errors.wait_for(1).await[0];
    assert_eq!(error.payload["kind"], "circuit_open");
    flush(&bb.bus).await;
    assert_eq!(notifications.events()[0].payload["kind"], "circuit_open");
    assert_eq!(speech.len(), 1);
    // The open circuit never let the request reach the model.
    assert!(model.prompts().is_empty());
    bb.bus.stop().await;
}

#[tokio::test]
async fn test_agent_failure_becomes_ui_error() {
    let mail = MockAgent::failing_on("mail", &["fetch"]);
    let bb = backbone(ScriptedModel::replying(&[FETCH_UNREAD]), vec![mail]);
    let ui_errors = Recorder::on(&bb.bus, UI_ERROR);
    let updates = Recorder::on(&bb.bus, UI_UPDATE);
    let speech = Recorder::on(&bb.bus, VOICE_SPEAK);

    bb.router.process_intent("check my unread mail", "session-6").await;

    let error = &ui_errors.wait_for(1).await[0];
    assert_eq!(error.payload["success"], false);
    assert_eq!(error.payload["error"], "fetch failed");
    flush(&bb.bus).await;
    assert_eq!(updates.len(), 0);
    assert_eq!(speech.events()[0].payload["text"], "mail failed: fetch failed");
    bb.bus.stop().await;
}

#[tokio::test]
async fn test_previous_commands_feed_the_next_prompt() {
    let model = ScriptedModel::replying(&[FETCH_UNREAD, FETCH_UNREAD]);
    let bb = backbone(model.clone(), vec![MockAgent::new("mail")]);
    let responses = Recorder::on(&bb.bus, ORCHESTRATOR_RESPONSE);

    bb.router.process_intent("check my unread mail", "session-7").await;
    responses.wait_for(1).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while bb.store.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "interaction never persisted");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    bb.router.process_intent("and again", "session-7").await;
    responses.wait_for(2).await;

    let prompts = model.prompts();
    assert!(prompts[0].contains("(none)"));
    assert!(prompts[1].contains("User: check my unread mail"));
    assert!(prompts[1].contains("Current command: and again"));
    bb.bus.stop().await;
}
