//! caseflow-core: a case management runtime.
//!
//! Case instances are trees of plan items (stages, tasks, milestones, event
//! listeners) driven by a per-kind state machine. Sentries wire them
//! together: an on-part waits for a standard event of another item, an
//! if-part checks case variables. Every state change happens inside a
//! command; the command's agenda runs the follow-up work and the command
//! context flushes everything it touched in one versioned batch.
//!
//! ```text
//! CaseEngine ─► CommandExecutor ─► CommandContext ─► Agenda ─► plan_item / sentry / behavior
//!                                        │
//!                                        └─ flush ─► EntityStore
//! JobExecutor ─► acquire_jobs ─► JobHandler ─► (same command context)
//! ```

pub mod agenda;
pub mod behavior;
pub mod command;
pub mod config;
pub mod context;
pub mod definition;
pub mod engine;
pub mod entity;
pub mod error;
pub mod events;
pub mod expression;
pub mod job;
pub mod lifecycle;
pub mod plan_item;
pub mod registry;
pub mod sentry;
pub mod store;
pub mod store_memory;
pub mod subscription;
pub mod timer;
pub mod types;

pub use command::{Command, CommandExecutor, CommandOutcome};
pub use config::EngineConfig;
pub use definition::provider::{DefinitionProvider, MemoryDefinitionProvider};
pub use definition::CaseDefinition;
pub use engine::CaseEngine;
pub use error::{EngineError, StoreError};
pub use events::{LifecycleEvent, MemorySink, NotificationSink, TransitionRecord};
pub use registry::{Clock, EngineRegistry, ManualClock, ServiceTaskBehavior, ServiceTaskCall};
pub use store::EntityStore;
pub use store_memory::MemoryStore;
