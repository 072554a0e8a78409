//! The explicit engine registry every command context is opened against.
//!
//! Holds the configuration and every external collaborator. There is no
//! process-wide state: two registries in one process are two engines.

use crate::config::EngineConfig;
use crate::definition::provider::DefinitionProvider;
use crate::events::{NotificationSink, TracingSink};
use crate::expression::{DefaultExpressionEvaluator, ExpressionEvaluator};
use crate::job::handlers::{AsyncContinuationHandler, JobHandler, TimerEventHandler};
use crate::store::EntityStore;
use crate::types::{Timestamp, Variables};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

// ─── Clock ────────────────────────────────────────────────────

pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        crate::types::now_ms()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: i64) -> Timestamp {
        self.now.fetch_add(ms, Ordering::SeqCst) + ms
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

// ─── Service task behaviors ───────────────────────────────────

/// Input handed to a service task behavior.
#[derive(Debug, Clone)]
pub struct ServiceTaskCall {
    pub case_id: Uuid,
    pub plan_item_id: Uuid,
    pub definition_id: String,
    pub task_type: String,
    pub variables: Variables,
}

/// User code bound to a service task type. Returned variables are merged
/// into the case before the task completes.
#[async_trait]
pub trait ServiceTaskBehavior: Send + Sync {
    async fn execute(&self, call: &ServiceTaskCall) -> anyhow::Result<Variables>;
}

// ─── Registry ─────────────────────────────────────────────────

pub struct EngineRegistry {
    pub config: EngineConfig,
    pub definitions: Arc<dyn DefinitionProvider>,
    pub store: Arc<dyn EntityStore>,
    pub evaluator: Arc<dyn ExpressionEvaluator>,
    pub sink: Arc<dyn NotificationSink>,
    pub clock: Arc<dyn Clock>,
    job_handlers: HashMap<String, Arc<dyn JobHandler>>,
    service_tasks: HashMap<String, Arc<dyn ServiceTaskBehavior>>,
}

impl EngineRegistry {
    pub fn builder(
        definitions: Arc<dyn DefinitionProvider>,
        store: Arc<dyn EntityStore>,
    ) -> EngineRegistryBuilder {
        EngineRegistryBuilder {
            config: EngineConfig::default(),
            definitions,
            store,
            evaluator: Arc::new(DefaultExpressionEvaluator),
            sink: Arc::new(TracingSink),
            clock: Arc::new(SystemClock),
            job_handlers: HashMap::new(),
            service_tasks: HashMap::new(),
        }
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn job_handler(&self, handler_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.job_handlers.get(handler_type).cloned()
    }

    pub fn service_task(&self, task_type: &str) -> Option<Arc<dyn ServiceTaskBehavior>> {
        self.service_tasks.get(task_type).cloned()
    }
}

pub struct EngineRegistryBuilder {
    config: EngineConfig,
    definitions: Arc<dyn DefinitionProvider>,
    store: Arc<dyn EntityStore>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    sink: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    job_handlers: HashMap<String, Arc<dyn JobHandler>>,
    service_tasks: HashMap<String, Arc<dyn ServiceTaskBehavior>>,
}

impl EngineRegistryBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Registers a job handler, replacing any handler of the same type.
    pub fn job_handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.job_handlers
            .insert(handler.handler_type().to_string(), handler);
        self
    }

    pub fn service_task(
        mut self,
        task_type: impl Into<String>,
        behavior: Arc<dyn ServiceTaskBehavior>,
    ) -> Self {
        self.service_tasks.insert(task_type.into(), behavior);
        self
    }

    pub fn build(mut self) -> Arc<EngineRegistry> {
        let builtins: [Arc<dyn JobHandler>; 2] =
            [Arc::new(TimerEventHandler), Arc::new(AsyncContinuationHandler)];
        for handler in builtins {
            self.job_handlers
                .entry(handler.handler_type().to_string())
                .or_insert(handler);
        }
        Arc::new(EngineRegistry {
            config: self.config,
            definitions: self.definitions,
            store: self.store,
            evaluator: self.evaluator,
            sink: self.sink,
            clock: self.clock,
            job_handlers: self.job_handlers,
            service_tasks: self.service_tasks,
        })
    }
}
