//! Rule declarations and their compiled, immutable form.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// EntityScope
// ---------------------------------------------------------------------------

/// What kind of entity a rule diagnoses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityScope {
    #[serde(alias = "STAGE")]
    Stage,
    #[serde(alias = "PIPELINE")]
    Pipeline,
    #[serde(alias = "REST")]
    Rest,
    /// Any scope this engine does not know about.
    #[serde(other)]
    Unknown,
}

impl fmt::Display for EntityScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityScope::Stage => "stage",
            EntityScope::Pipeline => "pipeline",
            EntityScope::Rest => "rest",
            EntityScope::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// RuleDefinition
// ---------------------------------------------------------------------------

/// Summary and description templates; both may contain `${...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub summary: String,
    #[serde(default)]
    pub description: String,
}

/// A rule as declared in a rule file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleDefinition {
    pub uuid: String,
    pub entity: EntityScope,
    /// Load-time gates, evaluated once against build and environment variables.
    #[serde(default)]
    pub preconditions: Vec<String>,
    /// Match-time predicates, AND-ed in order.
    #[serde(default)]
    pub conditions: Vec<String>,
    pub message: MessageTemplate,
}

impl RuleDefinition {
    pub fn new(uuid: impl Into<String>, entity: EntityScope, summary: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            entity,
            preconditions: Vec::new(),
            conditions: Vec::new(),
            message: MessageTemplate {
                summary: summary.into(),
                description: String::new(),
            },
        }
    }

    /// Shorthand for a stage-scoped rule.
    pub fn stage(uuid: impl Into<String>, summary: impl Into<String>) -> Self {
        Self::new(uuid, EntityScope::Stage, summary)
    }

    pub fn with_precondition(mut self, precondition: impl Into<String>) -> Self {
        self.preconditions.push(precondition.into());
        self
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.conditions.push(condition.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.message.description = description.into();
        self
    }
}

// ---------------------------------------------------------------------------
// CompiledRule
// ---------------------------------------------------------------------------

/// A rule that passed compilation. Immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledRule {
    uuid: String,
    entity: EntityScope,
    preconditions: Vec<String>,
    conditions: Vec<String>,
    message: MessageTemplate,
}

impl CompiledRule {
    pub(crate) fn new(definition: RuleDefinition) -> Self {
        Self {
            uuid: definition.uuid,
            entity: definition.entity,
            preconditions: definition.preconditions,
            conditions: definition.conditions,
            message: definition.message,
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn entity(&self) -> EntityScope {
        self.entity
    }

    pub fn preconditions(&self) -> &[String] {
        &self.preconditions
    }

    pub fn conditions(&self) -> &[String] {
        &self.conditions
    }

    pub fn message(&self) -> &MessageTemplate {
        &self.message
    }
}

// ---------------------------------------------------------------------------
// ScopeRegistry
// ---------------------------------------------------------------------------

/// Compiled rules grouped by scope, each group in declaration order.
#[derive(Debug, Clone, Default)]
pub struct ScopeRegistry {
    rules: HashMap<EntityScope, Vec<CompiledRule>>,
}

impl ScopeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, rule: CompiledRule) {
        self.rules.entry(rule.entity).or_default().push(rule);
    }

    pub fn rules(&self, scope: EntityScope) -> &[CompiledRule] {
        self.rules.get(&scope).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.rules.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
