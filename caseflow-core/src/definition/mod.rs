//! Case definitions: the static graph a case instance is driven by.
//!
//! Definitions are authored as YAML (`yaml`), checked by `validate`, and
//! served to the engine by a [`DefinitionProvider`](provider::DefinitionProvider).
//! Plan items nest: a `Stage` owns its children. After parsing, `prepare()`
//! assigns declaration indices (pre-order) and builds an id → path index so
//! lookups never walk the whole tree.

pub mod provider;
pub mod validate;
pub mod yaml;

use crate::types::{PlanItemKind, StandardEvent};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A versioned case definition. `plan_model` is the root stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseDefinition {
    pub key: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub name: Option<String>,
    pub plan_model: PlanItemDefinition,
    #[serde(skip)]
    paths: HashMap<String, Vec<usize>>,
}

fn default_version() -> u32 {
    1
}

/// One plan item of the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanItemDefinition {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub body: PlanItemBody,
    #[serde(default)]
    pub entry_criteria: Vec<SentryDefinition>,
    #[serde(default)]
    pub exit_criteria: Vec<SentryDefinition>,
    /// A required item blocks stage completion until it completes.
    #[serde(default)]
    pub required: bool,
    /// Enter `Enabled` and wait for an explicit start.
    #[serde(default)]
    pub manual_activation: bool,
    #[serde(default)]
    pub repetition: Option<RepetitionRule>,
    #[serde(default)]
    pub parent_completion_rule: ParentCompletionRule,
    /// Pre-order position in the model; fixes sentry firing order.
    #[serde(skip)]
    pub declaration_index: usize,
}

/// Kind-specific part of a plan item definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum PlanItemBody {
    Stage {
        #[serde(default)]
        children: Vec<PlanItemDefinition>,
    },
    HumanTask {
        #[serde(default)]
        assignee: Option<String>,
    },
    ServiceTask {
        task_type: String,
        /// Run through the job executor instead of inside the command.
        #[serde(default, rename = "async")]
        is_async: bool,
        #[serde(default)]
        retries: Option<u32>,
    },
    Milestone,
    EventListener {
        event: String,
    },
    TimerEventListener {
        /// ISO 8601 duration (`PT5M`) or cycle (`R3/PT10S`).
        timer: String,
    },
}

/// Entry or exit guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentryDefinition {
    pub id: String,
    #[serde(default)]
    pub on_parts: Vec<OnPartDefinition>,
    #[serde(default)]
    pub if_part: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnPartDefinition {
    /// Definition id of the plan item whose event is awaited.
    pub source: String,
    pub event: StandardEvent,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepetitionRule {
    /// Evaluated against case variables; absent means "always".
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub max_instance_count: Option<u32>,
}

/// How a child counts towards its stage's auto-completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParentCompletionRule {
    #[default]
    Default,
    Ignore,
    IgnoreIfAvailable,
    IgnoreIfAvailableOrEnabled,
    IgnoreAfterFirstCompletion,
}

/// Whether a sentry guards entry into or exit from its plan item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SentryRole {
    Entry,
    Exit,
}

impl PlanItemBody {
    pub fn kind(&self) -> PlanItemKind {
        match self {
            PlanItemBody::Stage { .. } => PlanItemKind::Stage,
            PlanItemBody::HumanTask { .. } => PlanItemKind::HumanTask,
            PlanItemBody::ServiceTask { .. } => PlanItemKind::ServiceTask,
            PlanItemBody::Milestone => PlanItemKind::Milestone,
            PlanItemBody::EventListener { .. } => PlanItemKind::EventListener,
            PlanItemBody::TimerEventListener { .. } => PlanItemKind::TimerEventListener,
        }
    }
}

impl PlanItemDefinition {
    pub fn kind(&self) -> PlanItemKind {
        self.body.kind()
    }

    pub fn children(&self) -> &[PlanItemDefinition] {
        match &self.body {
            PlanItemBody::Stage { children } => children,
            _ => &[],
        }
    }

    pub fn is_repeatable(&self) -> bool {
        self.repetition.is_some()
    }

    /// Sentries of the given role, in declaration order.
    pub fn sentries(&self, role: SentryRole) -> &[SentryDefinition] {
        match role {
            SentryRole::Entry => &self.entry_criteria,
            SentryRole::Exit => &self.exit_criteria,
        }
    }

    /// Finds a sentry by id on either side.
    pub fn sentry(&self, sentry_id: &str) -> Option<(SentryRole, usize, &SentryDefinition)> {
        if let Some((i, s)) = self
            .entry_criteria
            .iter()
            .enumerate()
            .find(|(_, s)| s.id == sentry_id)
        {
            return Some((SentryRole::Entry, i, s));
        }
        self.exit_criteria
            .iter()
            .enumerate()
            .find(|(_, s)| s.id == sentry_id)
            .map(|(i, s)| (SentryRole::Exit, i, s))
    }
}

impl CaseDefinition {
    pub fn new(key: impl Into<String>, version: u32, plan_model: PlanItemDefinition) -> Self {
        let mut def = Self {
            key: key.into(),
            version,
            name: None,
            plan_model,
            paths: HashMap::new(),
        };
        def.prepare();
        def
    }

    /// Assign declaration indices and rebuild the lookup index.
    ///
    /// Must be called after deserialization; `parse_case_yaml` does it.
    pub fn prepare(&mut self) {
        let mut paths = HashMap::new();
        let mut counter = 0usize;
        assign_indices(&mut self.plan_model, Vec::new(), &mut counter, &mut paths);
        self.paths = paths;
    }

    pub fn item(&self, id: &str) -> Option<&PlanItemDefinition> {
        let path = self.paths.get(id)?;
        let mut current = &self.plan_model;
        for &i in path {
            current = current.children().get(i)?;
        }
        Some(current)
    }

    /// Iterate every plan item, root first, in declaration order.
    pub fn items(&self) -> Vec<&PlanItemDefinition> {
        let mut out = Vec::new();
        let mut stack = vec![&self.plan_model];
        while let Some(item) = stack.pop() {
            out.push(item);
            for child in item.children().iter().rev() {
                stack.push(child);
            }
        }
        out
    }
}

fn assign_indices(
    item: &mut PlanItemDefinition,
    path: Vec<usize>,
    counter: &mut usize,
    paths: &mut HashMap<String, Vec<usize>>,
) {
    item.declaration_index = *counter;
    *counter += 1;
    paths.insert(item.id.clone(), path.clone());
    if let PlanItemBody::Stage { children } = &mut item.body {
        for (i, child) in children.iter_mut().enumerate() {
            let mut child_path = path.clone();
            child_path.push(i);
            assign_indices(child, child_path, counter, paths);
        }
    }
}
