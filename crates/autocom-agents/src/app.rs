//! Composition root: builds every backbone component from one config and
//! wires them onto a single event bus.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use orchestration::agents::{AgentDispatcher, SharedAgents};
use orchestration::config::OrchestrationConfig;
use orchestration::context::{ContextStore, JsonlContextStore};
use orchestration::coordinator::{MultiAgentCoordinator, MultiStepCommand};
use orchestration::events::{
    handler_fn, Event, EventBus, EventHandler, SharedEventBus, ORCHESTRATOR_ERROR, UI_ERROR,
    UI_NOTIFICATION, UI_UPDATE, VOICE_SPEAK,
};
use orchestration::health::{
    AgentHealthCheck, AggregateHealth, CircuitBreakerHealthCheck, ContextStoreHealthCheck,
    EventBusHealthCheck, HealthCheckManager, LanguageModelHealthCheck,
};
use orchestration::llm::{LanguageModel, OpenAiCompatibleClient};
use orchestration::middleware::{MetricsMiddleware, MiddlewareStack};
use orchestration::payload;
use orchestration::resilience::{CircuitBreakerManager, SharedBreakers};
use orchestration::router::IntentRouter;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agents::loopback_registry;

const SETTLE_TOPIC: &str = "app.settle";
const SETTLE_ROUNDS: usize = 16;

/// Prints user-facing events (`ui.*`, `voice.speak`, orchestrator outcomes).
pub struct ConsoleSink;

impl ConsoleSink {
    pub fn render(event: &Event) -> String {
        let field = |key: &str| event.str_field(key).unwrap_or_default();
        match event.topic.as_str() {
            UI_NOTIFICATION => format!("[{}] {}", field("title"), field("body")),
            VOICE_SPEAK => format!("(speaks) {}", field("text")),
            UI_UPDATE => {
                let data = event.payload.get("data").cloned().unwrap_or(Value::Null);
                format!("[{}] {}", field("agent_name"), data)
            }
            UI_ERROR | ORCHESTRATOR_ERROR => format!("error: {}", field("error")),
            _ => format!("{}: {}", event.topic, Value::Object(event.payload.clone())),
        }
    }
}

#[async_trait]
impl EventHandler for ConsoleSink {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        println!("{}", Self::render(event));
        Ok(())
    }
}

/// Fully wired assistant backbone.
pub struct App {
    pub config: OrchestrationConfig,
    pub bus: SharedEventBus,
    pub breakers: SharedBreakers,
    pub agents: SharedAgents,
    pub router: Arc<IntentRouter>,
    pub coordinator: Arc<MultiAgentCoordinator>,
    pub health: Arc<HealthCheckManager>,
    pub metrics: Option<Arc<MetricsMiddleware>>,
    settled: AsyncMutex<mpsc::UnboundedReceiver<bool>>,
    shutdown: CancellationToken,
    monitor: Option<JoinHandle<()>>,
}

impl App {
    /// Build with the configured HTTP model client and JSONL history file.
    pub fn build(config: OrchestrationConfig) -> Result<Self> {
        let llm = OpenAiCompatibleClient::new(config.llm.clone())
            .context("Failed to build language model client")?;
        let store = JsonlContextStore::new(config.context.path.clone());
        Ok(Self::build_with(config, Arc::new(llm), Arc::new(store)))
    }

    pub fn build_with(
        config: OrchestrationConfig,
        llm: Arc<dyn LanguageModel>,
        store: Arc<dyn ContextStore>,
    ) -> Self {
        let bus = EventBus::with_config(&config.event_bus).shared();
        let breakers = CircuitBreakerManager::new(config.circuit_breaker.clone()).shared();
        let agents = loopback_registry(&config.agents.names).shared();
        let built = MiddlewareStack::from_config(&config.middleware);

        let router = Arc::new(IntentRouter::new(
            Arc::clone(&bus),
            Arc::clone(&llm),
            Arc::clone(&store),
            Arc::clone(&agents),
            Arc::clone(&breakers),
            config.router.clone(),
        ));
        let coordinator = Arc::new(MultiAgentCoordinator::new(
            Arc::clone(&bus),
            Arc::clone(&router),
            Arc::clone(&llm),
            Arc::clone(&agents),
            Arc::clone(&breakers),
            config.coordinator.clone(),
        ));
        let dispatcher = Arc::new(AgentDispatcher::new(
            Arc::clone(&bus),
            Arc::clone(&agents),
            Arc::clone(&breakers),
            built.stack,
        ));

        let health = HealthCheckManager::new(&config.health).shared();
        health.register(Arc::new(EventBusHealthCheck::new(Arc::clone(&bus))));
        health.register(Arc::new(LanguageModelHealthCheck::new(llm)));
        health.register(Arc::new(ContextStoreHealthCheck::new(store)));
        health.register(Arc::new(CircuitBreakerHealthCheck::new(Arc::clone(&breakers))));
        for (_, agent) in agents.iter() {
            health.register(Arc::new(AgentHealthCheck::new(Arc::clone(agent))));
        }

        dispatcher.attach();
        router.attach();
        coordinator.attach();

        let sink: Arc<dyn EventHandler> = Arc::new(ConsoleSink);
        for topic in [UI_NOTIFICATION, UI_UPDATE, UI_ERROR, VOICE_SPEAK, ORCHESTRATOR_ERROR] {
            bus.subscribe(topic, Arc::clone(&sink));
        }

        // The marker handler runs alone on the dispatch loop, so an empty
        // queue at that point means everything published earlier is done.
        let (idle_tx, idle_rx) = mpsc::unbounded_channel();
        let weak_bus = Arc::downgrade(&bus);
        bus.subscribe(
            SETTLE_TOPIC,
            handler_fn(move |_| {
                let idle = weak_bus
                    .upgrade()
                    .map_or(true, |bus| bus.stats().queue_size == 0);
                let _ = idle_tx.send(idle);
                async { Ok(()) }
            }),
        );

        info!(
            agents = ?agents.names(),
            middleware = ?config.middleware.profile,
            model = %config.llm.model,
            "Assistant backbone assembled"
        );

        Self {
            config,
            bus,
            breakers,
            agents,
            router,
            coordinator,
            health,
            metrics: built.metrics,
            settled: AsyncMutex::new(idle_rx),
            shutdown: CancellationToken::new(),
            monitor: None,
        }
    }

    pub fn start(&self) {
        self.bus.start();
    }

    /// Run health checks in the background until shutdown.
    pub fn start_health_monitor(&mut self) {
        if self.monitor.is_some() {
            return;
        }
        let interval = Duration::from_secs(self.config.health.interval_secs.max(1));
        self.monitor = Some(self.health.spawn_periodic(interval, self.shutdown.clone()));
    }

    /// Classify and route one command, then wait for its events to play out.
    pub async fn process(&self, input: &str, context_id: &str) {
        self.router.process_intent(input, context_id).await;
        self.settle().await;
    }

    pub async fn run_multi_step(&self, command: &str, context_id: &str) -> MultiStepCommand {
        let cmd = self.coordinator.execute_multi_step(command, context_id).await;
        self.settle().await;
        cmd
    }

    pub async fn check_health(&self) -> AggregateHealth {
        self.health.check_all().await
    }

    /// Wait until the bus has delivered everything published so far,
    /// including events published by the handlers of those events.
    pub async fn settle(&self) {
        let limit = Duration::from_secs(self.config.event_bus.handler_timeout_secs.max(1));
        let mut idle = self.settled.lock().await;
        while idle.try_recv().is_ok() {}
        for _ in 0..SETTLE_ROUNDS {
            if let Err(e) = self.bus.emit(SETTLE_TOPIC, payload! {}) {
                warn!(error = %e, "Could not settle event bus");
                return;
            }
            match tokio::time::timeout(limit, idle.recv()).await {
                Ok(Some(true)) => return,
                Ok(Some(false)) => continue,
                Ok(None) | Err(_) => {
                    warn!("Timed out waiting for event bus to settle");
                    return;
                }
            }
        }
        warn!(rounds = SETTLE_ROUNDS, "Event bus still busy after settling");
    }

    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(monitor) = self.monitor.take() {
            if let Err(e) = monitor.await {
                warn!(error = %e, "Health monitor terminated abnormally");
            }
        }
        self.bus.stop().await;
        if let Some(metrics) = &self.metrics {
            for (topic, m) in metrics.snapshot() {
                info!(
                    topic = %topic,
                    count = m.count,
                    errors = m.errors,
                    avg_ms = m.avg_time.as_millis() as u64,
                    "Topic metrics"
                );
            }
        }
        info!("Assistant backbone stopped");
    }
}
