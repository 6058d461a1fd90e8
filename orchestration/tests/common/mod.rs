//! Shared fixtures: scripted model, recording agents, and a wired-up backbone.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use orchestration::agents::{Agent, AgentDispatcher, AgentRegistry, AgentResponse, SharedAgents};
use orchestration::context::{ContextStore, InMemoryContextStore};
use orchestration::coordinator::{CoordinatorConfig, MultiAgentCoordinator};
use orchestration::events::{handler_fn, Event, EventBus, Payload, SharedEventBus};
use orchestration::llm::{LanguageModel, LlmError, LlmResult};
use orchestration::middleware::MiddlewareStack;
use orchestration::payload;
use orchestration::resilience::{CircuitBreakerConfig, CircuitBreakerManager, SharedBreakers};
use orchestration::router::{IntentRouter, RouterConfig};

/// Language model that replays canned responses in order.
pub struct ScriptedModel {
    responses: Mutex<VecDeque<LlmResult<String>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new<I>(responses: I) -> Arc<Self>
    where
        I: IntoIterator<Item = LlmResult<String>>,
    {
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().collect()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn replying(responses: &[&str]) -> Arc<Self> {
        Self::new(responses.iter().map(|r| Ok(r.to_string())))
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn generate(&self, prompt: &str, _system: &str) -> LlmResult<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(LlmError::EmptyResponse))
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

/// Agent that records calls and fails the actions it is told to fail.
pub struct MockAgent {
    name: String,
    failing: Vec<String>,
    delay: Option<Duration>,
    calls: Mutex<Vec<(String, Payload)>>,
}

impl MockAgent {
    pub fn new(name: &str) -> Arc<Self> {
        Self::build(name, &[], None)
    }

    pub fn failing_on(name: &str, actions: &[&str]) -> Arc<Self> {
        Self::build(name, actions, None)
    }

    pub fn slow(name: &str, delay: Duration) -> Arc<Self> {
        Self::build(name, &[], Some(delay))
    }

    fn build(name: &str, failing: &[&str], delay: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            failing: failing.iter().map(|s| s.to_string()).collect(),
            delay,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<(String, Payload)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Agent for MockAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle_intent(&self, action: &str, params: Payload) -> AgentResponse {
        self.calls
            .lock()
            .unwrap()
            .push((action.to_string(), params));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.iter().any(|a| a == action) {
            return AgentResponse::failure(&self.name, format!("{action} failed"));
        }
        AgentResponse::ok(
            &self.name,
            payload! { "output" => format!("{}:{}", self.name, action) },
        )
    }
}

/// Events seen on a topic, in delivery order.
#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<Event>>>);

impl Recorder {
    pub fn on(bus: &EventBus, topic: &str) -> Self {
        let recorder = Self::default();
        let sink = Arc::clone(&recorder.0);
        bus.subscribe(
            topic,
            handler_fn(move |event| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().unwrap().push(event);
                    Ok(())
                }
            }),
        );
        recorder
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    /// Wait until at least `n` events arrived.
    pub async fn wait_for(&self, n: usize) -> Vec<Event> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.len() < n {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {n} events, saw {}",
                self.len()
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.events()
    }
}

/// Every backbone component, attached to one started bus.
pub struct Backbone {
    pub bus: SharedEventBus,
    pub breakers: SharedBreakers,
    pub agents: SharedAgents,
    pub store: Arc<InMemoryContextStore>,
    pub router: Arc<IntentRouter>,
    pub coordinator: Arc<MultiAgentCoordinator>,
    pub dispatcher: Arc<AgentDispatcher>,
}

pub struct BackboneOptions {
    pub stack: MiddlewareStack,
    pub coordinator: CoordinatorConfig,
}

impl Default for BackboneOptions {
    fn default() -> Self {
        Self {
            stack: MiddlewareStack::development().stack,
            coordinator: CoordinatorConfig::default(),
        }
    }
}

pub fn backbone(llm: Arc<dyn LanguageModel>, agents: Vec<Arc<MockAgent>>) -> Backbone {
    backbone_with(llm, agents, BackboneOptions::default())
}

pub fn backbone_with(
    llm: Arc<dyn LanguageModel>,
    agents: Vec<Arc<MockAgent>>,
    options: BackboneOptions,
) -> Backbone {
    let bus = EventBus::new(1000).shared();
    let breakers = CircuitBreakerManager::new(CircuitBreakerConfig::default()).shared();
    let agents = agents
        .into_iter()
        .fold(AgentRegistry::new(), |registry, agent| registry.with(agent))
        .shared();
    let store = Arc::new(InMemoryContextStore::default());

    let router = Arc::new(IntentRouter::new(
        Arc::clone(&bus),
        Arc::clone(&llm),
        Arc::clone(&store) as Arc<dyn ContextStore>,
        Arc::clone(&agents),
        Arc::clone(&breakers),
        RouterConfig::default(),
    ));
    let coordinator = Arc::new(MultiAgentCoordinator::new(
        Arc::clone(&bus),
        Arc::clone(&router),
        llm,
        Arc::clone(&agents),
        Arc::clone(&breakers),
        options.coordinator,
    ));
    let dispatcher = Arc::new(AgentDispatcher::new(
        Arc::clone(&bus),
        Arc::clone(&agents),
        Arc::clone(&breakers),
        options.stack,
    ));

    dispatcher.attach();
    router.attach();
    coordinator.attach();
    bus.start();

    Backbone {
        bus,
        breakers,
        agents,
        store,
        router,
        coordinator,
        dispatcher,
    }
}
