//! Failure isolation across the backbone: bus backpressure and handler
//! faults, circuit breaker lifecycle, middleware short-circuits.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{backbone, backbone_with, BackboneOptions, MockAgent, Recorder, ScriptedModel};
use orchestration::agents::dispatch::agent_breaker_name;
use orchestration::events::{handler_fn, EventBus, EventBusError, ORCHESTRATOR_RESPONSE};
use orchestration::middleware::{AuthConfig, MiddlewareConfig, MiddlewareStack, RateLimitConfig};
use orchestration::payload;
use orchestration::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState};

#[tokio::test]
async fn test_bus_delivers_in_publish_order_despite_faulty_handlers() {
    let bus = EventBus::new(100).shared();
    bus.subscribe(
        "orders.*",
        handler_fn(|_| async { Err(anyhow::anyhow!("handler exploded")) }),
    );
    bus.subscribe(
        "orders.created",
        handler_fn(|_| async {
            if true {
                panic!("handler panicked");
            }
            Ok(())
        }),
    );
    let seen = Recorder::on(&bus, "orders.*");
    bus.start();

    for i in 0..20 {
        let topic = if i % 2 == 0 { "orders.created" } else { "orders.shipped" };
        bus.emit(topic, payload! { "seq" => i }).unwrap();
    }

    let events = seen.wait_for(20).await;
    let seqs: Vec<i64> = events.iter().map(|e| e.payload["seq"].as_i64().unwrap()).collect();
    assert_eq!(seqs, (0..20).collect::<Vec<_>>());
    assert!(bus.is_running());
    bus.stop().await;
}

#[tokio::test]
async fn test_full_queue_rejects_instead_of_blocking() {
    let bus = EventBus::new(3);
    for _ in 0..3 {
        bus.emit("load.tick", payload! {}).unwrap();
    }
    let err = bus.emit("load.tick", payload! {}).unwrap_err();
    assert!(matches!(err, EventBusError::QueueFull { capacity: 3, .. }));
    assert_eq!(bus.stats().queue_size, 3);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_lifecycle_never_skips_half_open() {
    let breaker = CircuitBreaker::new("llm", CircuitBreakerConfig::new(2, 2, 10));
    let counter = AtomicUsize::new(0);
    let calls = &counter;
    let fail = move || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Err::<(), _>("down")
    };
    let succeed = move || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok::<_, &str>(())
    };

    let _ = breaker.call(fail).await;
    assert_eq!(breaker.state(), CircuitState::Closed);
    let _ = breaker.call(fail).await;
    assert_eq!(breaker.state(), CircuitState::Open);

    let rejected = breaker.call(succeed).await.unwrap_err();
    assert!(matches!(rejected, CircuitError::Open { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    tokio::time::advance(Duration::from_secs(11)).await;
    breaker.call(succeed).await.unwrap();
    assert_eq!(breaker.state(), CircuitState::HalfOpen);

    // A trial failure sends the circuit straight back to open.
    let _ = breaker.call(fail).await;
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::advance(Duration::from_secs(11)).await;
    breaker.call(succeed).await.unwrap();
    breaker.call(succeed).await.unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.snapshot().failure_count, 0);
}

#[tokio::test]
async fn test_failing_agent_trips_its_breaker() {
    let mail = MockAgent::failing_on("mail", &["fetch"]);
    let bb = backbone(ScriptedModel::replying(&[]), vec![mail.clone()]);
    let responses = Recorder::on(&bb.bus, ORCHESTRATOR_RESPONSE);

    for _ in 0..6 {
        bb.bus.emit("agent.mail.fetch", payload! {}).unwrap();
    }
    let events = responses.wait_for(6).await;

    assert!(events.iter().all(|e| e.payload["success"] == false));
    assert_eq!(mail.calls().len(), 5);
    assert!(events[5].payload["error"].as_str().unwrap().contains("is open"));
    assert_eq!(bb.breakers.open_circuits(), vec![agent_breaker_name("mail")]);
    bb.bus.stop().await;
}

#[tokio::test]
async fn test_unauthenticated_request_never_reaches_agent() {
    let mail = MockAgent::new("mail");
    let config = MiddlewareConfig {
        auth: AuthConfig {
            required_topics: vec!["agent.mail.*".to_string()],
            tokens: vec!["s3cret".to_string()],
        },
        ..MiddlewareConfig::default()
    };
    let built = MiddlewareStack::production(&config);
    let metrics = built.metrics.clone().unwrap();
    let options = BackboneOptions {
        stack: built.stack,
        ..BackboneOptions::default()
    };
    let bb = backbone_with(ScriptedModel::replying(&[]), vec![mail.clone()], options);
    let responses = Recorder::on(&bb.bus, ORCHESTRATOR_RESPONSE);

    bb.bus.emit("agent.mail.fetch", payload! {}).unwrap();
    bb.bus
        .emit("agent.mail.fetch", payload! { "auth_token" => "s3cret" })
        .unwrap();

    let events = responses.wait_for(2).await;
    assert_eq!(events[0].payload["success"], false);
    assert!(events[0].payload["error"]
        .as_str()
        .unwrap()
        .contains("Authentication required"));
    assert_eq!(events[1].payload["success"], true);
    assert_eq!(mail.calls().len(), 1);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot["agent.mail.fetch"].count, 2);
    bb.bus.stop().await;
}

#[tokio::test]
async fn test_rate_limit_short_circuits_per_client() {
    let mail = MockAgent::new("mail");
    let config = MiddlewareConfig {
        rate_limit: RateLimitConfig {
            max_requests: 2,
            window_seconds: 60,
        },
        ..MiddlewareConfig::default()
    };
    let options = BackboneOptions {
        stack: MiddlewareStack::production(&config).stack,
        ..BackboneOptions::default()
    };
    let bb = backbone_with(ScriptedModel::replying(&[]), vec![mail.clone()], options);
    let responses = Recorder::on(&bb.bus, ORCHESTRATOR_RESPONSE);

    // Distinct payloads so the cache layer does not answer.
    for i in 0..3 {
        bb.bus
            .emit("agent.mail.fetch", payload! { "client_id" => "desk", "page" => i })
            .unwrap();
    }
    bb.bus
        .emit("agent.mail.fetch", payload! { "client_id" => "phone" })
        .unwrap();

    let events = responses.wait_for(4).await;
    let outcomes: Vec<bool> = events.iter().map(|e| e.payload["success"] == true).collect();
    assert_eq!(outcomes, vec![true, true, false, true]);
    assert!(events[2].payload["error"].as_str().unwrap().contains("Rate limit exceeded"));
    assert_eq!(mail.calls().len(), 3);
    bb.bus.stop().await;
}

#[tokio::test]
async fn test_repeated_request_is_served_from_cache() {
    let mail = MockAgent::new("mail");
    let options = BackboneOptions {
        stack: MiddlewareStack::production(&MiddlewareConfig::default()).stack,
        ..BackboneOptions::default()
    };
    let bb = backbone_with(ScriptedModel::replying(&[]), vec![mail.clone()], options);
    let responses = Recorder::on(&bb.bus, ORCHESTRATOR_RESPONSE);

    for request in ["r1", "r2"] {
        bb.bus
            .emit(
                "agent.mail.fetch",
                payload! { "filter" => "unread", "request_id" => request },
            )
            .unwrap();
    }

    let events = responses.wait_for(2).await;
    assert!(events.iter().all(|e| e.payload["success"] == true));
    assert_eq!(events[1].payload["request_id"], "r2");
    assert_eq!(mail.calls().len(), 1);
    bb.bus.stop().await;
}

#[tokio::test]
async fn test_repeated_send_is_not_served_from_cache() {
    let chat = MockAgent::new("chat");
    let options = BackboneOptions {
        stack: MiddlewareStack::production(&MiddlewareConfig::default()).stack,
        ..BackboneOptions::default()
    };
    let bb = backbone_with(ScriptedModel::replying(&[]), vec![chat.clone()], options);
    let responses = Recorder::on(&bb.bus, ORCHESTRATOR_RESPONSE);

    for request in ["r1", "r2"] {
        bb.bus
            .emit(
                "agent.chat.send",
                payload! { "channel" => "general", "text" => "hi", "request_id" => request },
            )
            .unwrap();
    }

    let events = responses.wait_for(2).await;
    assert!(events.iter().all(|e| e.payload["success"] == true));
    assert_eq!(chat.calls().len(), 2);
    bb.bus.stop().await;
}

#[tokio::test]
async fn test_bus_stop_rejects_later_publishes() {
    let bus = Arc::new(EventBus::new(10));
    bus.start();
    bus.stop().await;
    assert!(!bus.is_running());
    assert!(matches!(
        bus.emit("late.event", payload! {}),
        Err(EventBusError::Stopped { .. })
    ));
}
