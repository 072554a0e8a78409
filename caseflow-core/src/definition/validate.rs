use super::*;
use crate::timer::parse_timer;
use std::collections::HashSet;

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub rule: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.rule, self.message)
    }
}

fn push(errors: &mut Vec<ValidationError>, rule: &str, message: String) {
    errors.push(ValidationError {
        rule: rule.to_string(),
        message,
    });
}

/// Validate a prepared CaseDefinition. Returns all errors found.
pub fn validate_definition(def: &CaseDefinition) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let items = def.items();

    // D1: Plan item ids must be unique
    let mut seen = HashSet::new();
    for item in &items {
        if !seen.insert(item.id.as_str()) {
            push(&mut errors, "D1", format!("Duplicate plan item id: {}", item.id));
        }
    }

    // D2: The plan model is a stage without guards or repetition
    let root = &def.plan_model;
    if root.kind() != PlanItemKind::Stage {
        push(
            &mut errors,
            "D2",
            format!("Plan model '{}' must be a Stage, found {:?}", root.id, root.kind()),
        );
    }
    if !root.entry_criteria.is_empty()
        || root.is_repeatable()
        || root.manual_activation
    {
        push(
            &mut errors,
            "D2",
            format!(
                "Plan model '{}' cannot have entry criteria, repetition or manual activation",
                root.id
            ),
        );
    }

    // D3: Sentry ids must be unique across the model
    let mut sentry_ids = HashSet::new();
    for item in &items {
        for sentry in item.entry_criteria.iter().chain(item.exit_criteria.iter()) {
            if !sentry_ids.insert(sentry.id.as_str()) {
                push(&mut errors, "D3", format!("Duplicate sentry id: {}", sentry.id));
            }

            // D4: A sentry needs at least an on-part or an if-part
            if sentry.on_parts.is_empty() && sentry.if_part.is_none() {
                push(
                    &mut errors,
                    "D4",
                    format!("Sentry '{}' on '{}' has neither on-parts nor if-part", sentry.id, item.id),
                );
            }

            // D5: On-part sources reference existing plan items
            for on_part in &sentry.on_parts {
                if !seen.contains(on_part.source.as_str()) {
                    push(
                        &mut errors,
                        "D5",
                        format!(
                            "Sentry '{}' references unknown source '{}'",
                            sentry.id, on_part.source
                        ),
                    );
                }
            }
        }
    }

    for item in &items {
        match &item.body {
            // D6: Literal timer expressions must parse
            PlanItemBody::TimerEventListener { timer } if !timer.trim_start().starts_with("${") => {
                if let Err(e) = parse_timer(timer) {
                    push(
                        &mut errors,
                        "D6",
                        format!("Timer '{}' on '{}' is invalid: {}", timer, item.id, e),
                    );
                }
            }
            // D7: Service tasks and event listeners need a binding name
            PlanItemBody::ServiceTask { task_type, .. } if task_type.trim().is_empty() => {
                push(&mut errors, "D7", format!("ServiceTask '{}' has no task_type", item.id));
            }
            PlanItemBody::EventListener { event } if event.trim().is_empty() => {
                push(&mut errors, "D7", format!("EventListener '{}' has no event", item.id));
            }
            _ => {}
        }

        // D8: Manual activation only makes sense for work items
        if item.manual_activation
            && !matches!(
                item.kind(),
                PlanItemKind::Stage | PlanItemKind::HumanTask | PlanItemKind::ServiceTask
            )
        {
            push(
                &mut errors,
                "D8",
                format!("{:?} '{}' cannot use manual activation", item.kind(), item.id),
            );
        }
    }

    errors
}
