//! Shared test rig: an in-memory engine on a manual clock.
#![allow(dead_code)]

use caseflow_core::definition::yaml::load_case_yaml;
use caseflow_core::events::LifecycleEvent;
use caseflow_core::registry::EngineRegistryBuilder;
use caseflow_core::types::{PlanItemInstance, PlanItemState, Variables};
use caseflow_core::{
    CaseEngine, EngineConfig, EngineRegistry, ManualClock, MemoryDefinitionProvider, MemorySink,
    MemoryStore, ServiceTaskBehavior, ServiceTaskCall,
};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

pub const START: i64 = 1_700_000_000_000;

pub struct Rig {
    pub engine: CaseEngine,
    pub clock: Arc<ManualClock>,
    pub sink: Arc<MemorySink>,
    pub store: Arc<MemoryStore>,
    pub provider: Arc<MemoryDefinitionProvider>,
}

impl Rig {
    pub fn new(models: &[&str]) -> Self {
        Self::with(models, |b| b)
    }

    pub fn with(
        models: &[&str],
        configure: impl FnOnce(EngineRegistryBuilder) -> EngineRegistryBuilder,
    ) -> Self {
        let provider = Arc::new(MemoryDefinitionProvider::new());
        for yaml in models {
            let def = load_case_yaml(yaml).expect("model parses");
            provider.deploy(def).expect("model deploys");
        }
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(START));
        let sink = Arc::new(MemorySink::new());
        let engine = build_engine(&provider, &store, &clock, &sink, "test-node", configure);
        Self {
            engine,
            clock,
            sink,
            store,
            provider,
        }
    }

    /// Another engine on the same store, definitions, clock and sink, as a
    /// second executor node would see them.
    pub fn peer(
        &self,
        node_id: &str,
        configure: impl FnOnce(EngineRegistryBuilder) -> EngineRegistryBuilder,
    ) -> CaseEngine {
        build_engine(
            &self.provider,
            &self.store,
            &self.clock,
            &self.sink,
            node_id,
            configure,
        )
    }

    /// Most recent instance of a plan item definition.
    pub async fn item(&self, case_id: Uuid, definition_id: &str) -> PlanItemInstance {
        self.engine
            .plan_items_by_definition(case_id, definition_id)
            .await
            .expect("query")
            .pop()
            .unwrap_or_else(|| panic!("no instance of '{}'", definition_id))
    }

    pub async fn state(&self, case_id: Uuid, definition_id: &str) -> PlanItemState {
        self.item(case_id, definition_id).await.state
    }

    /// Lifecycle event names delivered so far, in order.
    pub fn event_names(&self) -> Vec<&'static str> {
        self.sink.events().iter().map(LifecycleEvent::name).collect()
    }
}

fn build_engine(
    provider: &Arc<MemoryDefinitionProvider>,
    store: &Arc<MemoryStore>,
    clock: &Arc<ManualClock>,
    sink: &Arc<MemorySink>,
    node_id: &str,
    configure: impl FnOnce(EngineRegistryBuilder) -> EngineRegistryBuilder,
) -> CaseEngine {
    let config = EngineConfig {
        node_id: node_id.to_string(),
        ..EngineConfig::default()
    };
    let builder = EngineRegistry::builder(provider.clone(), store.clone())
        .config(config)
        .clock(clock.clone())
        .sink(sink.clone());
    CaseEngine::new(configure(builder).build())
}

pub fn vars(value: Value) -> Variables {
    value
        .as_object()
        .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

/// Service task behavior that fails its first `failures` calls.
pub struct FlakyTask {
    failures: usize,
    pub calls: AtomicUsize,
    output: Variables,
}

impl FlakyTask {
    pub fn new(failures: usize, output: Variables) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicUsize::new(0),
            output,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ServiceTaskBehavior for FlakyTask {
    async fn execute(&self, call: &ServiceTaskCall) -> anyhow::Result<Variables> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            anyhow::bail!("{} unavailable (call {})", call.task_type, n + 1);
        }
        Ok(self.output.clone())
    }
}
