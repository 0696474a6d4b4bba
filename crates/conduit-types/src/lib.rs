//! Shared types, errors, issues and records for the Conduit dataflow engine.
//!
//! This crate provides the foundational types used across all other Conduit crates:
//! - `ConduitError`: unified error taxonomy
//! - `Issue` / `Issues`: structured validation problems
//! - `Record` / `StageOutput`: the data exchanged between stages
//! - [`config`]: the pipeline configuration document and stage descriptors

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod config;

pub use config::{
    ConfigDefinition, ConfigEntry, OnRecordError, PipelineConfiguration, PipelineInfo,
    StageConfiguration, StageDefinition, StageKind, StageSystemConfig,
};

/// Unified error type for all Conduit subsystems.
#[derive(Debug, thiserror::Error)]
pub enum ConduitError {
    // === Expression Errors ===
    #[error("Expression parse error at line {line}, col {col}: {message}")]
    Parse {
        line: usize,
        col: usize,
        message: String,
    },

    #[error("Failed to evaluate '{expression}': {message}")]
    Expression { expression: String, message: String },

    // === Pipeline Errors ===
    #[error("Pipeline validation failed: {0}")]
    Validation(String),

    #[error("Cannot load stage '{library}::{stage}': {message}")]
    StageLoad {
        library: String,
        stage: String,
        message: String,
    },

    #[error("Stage '{instance_name}' failed: {message}")]
    StageExecution {
        instance_name: String,
        message: String,
        issues: Vec<Issue>,
    },

    #[error("Pipeline cannot run: {issues}")]
    PipelineRuntime { issues: Issues },

    #[error("Invalid pipeline state: expected {expected}, was {actual}")]
    InvalidState { expected: String, actual: String },

    #[error("Failed to release isolation context of stage '{instance_name}': {message}")]
    Release {
        instance_name: String,
        message: String,
    },

    #[error("Pipeline run was cancelled")]
    Cancelled,

    // === Diagnostic Errors ===
    #[error("Rule '{rule}' is invalid: {message}")]
    Rule { rule: String, message: String },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl ConduitError {
    /// Returns `true` if the error is transient and the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConduitError::Cancelled | ConduitError::Io(_))
    }

    /// Returns `true` if the error is permanent and retrying will not help.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConduitError::Validation(_)
                | ConduitError::Parse { .. }
                | ConduitError::PipelineRuntime { .. }
                | ConduitError::StageLoad { .. }
        )
    }

    /// The issues carried by a lifecycle failure, if any.
    pub fn issues(&self) -> &[Issue] {
        match self {
            ConduitError::StageExecution { issues, .. } => issues,
            ConduitError::PipelineRuntime { issues } => issues.as_slice(),
            _ => &[],
        }
    }
}

/// A convenience alias for `Result<T, ConduitError>`.
pub type Result<T> = std::result::Result<T, ConduitError>;

// ---------------------------------------------------------------------------
// Issue: a structured validation problem
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub severity: Severity,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_name: Option<String>,
}

impl Issue {
    /// An error-severity issue about the pipeline as a whole.
    pub fn pipeline(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            code: code.into(),
            message: message.into(),
            instance_name: None,
            config_name: None,
        }
    }

    /// An error-severity issue attributed to one stage instance.
    pub fn stage(
        instance_name: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            instance_name: Some(instance_name.into()),
            ..Self::pipeline(code, message)
        }
    }

    pub fn with_config(mut self, config_name: impl Into<String>) -> Self {
        self.config_name = Some(config_name.into());
        self
    }

    pub fn warning(mut self) -> Self {
        self.severity = Severity::Warning;
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if let Some(ref stage) = self.instance_name {
            write!(f, " [{stage}")?;
            if let Some(ref config) = self.config_name {
                write!(f, ".{config}")?;
            }
            write!(f, "]")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Ordered collection of issues.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Issues {
    issues: Vec<Issue>,
}

impl Issues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, issue: Issue) {
        self.issues.push(issue);
    }

    pub fn extend(&mut self, issues: impl IntoIterator<Item = Issue>) {
        self.issues.extend(issues);
    }

    /// `true` when any issue (error or warning) is present.
    pub fn has_issues(&self) -> bool {
        !self.issues.is_empty()
    }

    pub fn has_errors(&self) -> bool {
        self.issues.iter().any(Issue::is_error)
    }

    pub fn len(&self) -> usize {
        self.issues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Issue> {
        self.issues.iter()
    }

    pub fn as_slice(&self) -> &[Issue] {
        &self.issues
    }

    /// Issues not attributed to any stage.
    pub fn pipeline_issues(&self) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(|i| i.instance_name.is_none())
    }

    /// Issues attributed to the given stage instance.
    pub fn stage_issues<'a>(&'a self, instance_name: &'a str) -> impl Iterator<Item = &'a Issue> {
        self.issues
            .iter()
            .filter(move |i| i.instance_name.as_deref() == Some(instance_name))
    }

    pub fn into_vec(self) -> Vec<Issue> {
        self.issues
    }
}

impl From<Vec<Issue>> for Issues {
    fn from(issues: Vec<Issue>) -> Self {
        Self { issues }
    }
}

impl IntoIterator for Issues {
    type Item = Issue;
    type IntoIter = std::vec::IntoIter<Issue>;

    fn into_iter(self) -> Self::IntoIter {
        self.issues.into_iter()
    }
}

impl<'a> IntoIterator for &'a Issues {
    type Item = &'a Issue;
    type IntoIter = std::slice::Iter<'a, Issue>;

    fn into_iter(self) -> Self::IntoIter {
        self.issues.iter()
    }
}

impl fmt::Display for Issues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.issues.iter().map(ToString::to_string).collect();
        write!(f, "{}", rendered.join("; "))
    }
}

// ---------------------------------------------------------------------------
// Record: one unit of data flowing through the pipeline
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordError {
    pub stage: String,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordHeader {
    pub source_id: String,
    pub stage_creator: String,
    #[serde(default)]
    pub stages_path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RecordError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub header: RecordHeader,
    pub value: serde_json::Value,
}

impl Record {
    /// Create a record produced by `stage`.
    pub fn new(
        source_id: impl Into<String>,
        stage: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        let stage = stage.into();
        Self {
            header: RecordHeader {
                source_id: source_id.into(),
                stage_creator: stage.clone(),
                stages_path: vec![stage],
                error: None,
            },
            value,
        }
    }

    /// Look up a field using a JSON pointer such as `/customer/id`.
    pub fn get(&self, pointer: &str) -> Option<&serde_json::Value> {
        self.value.pointer(pointer)
    }

    /// Note that `stage` has handled this record.
    pub fn touch(&mut self, stage: &str) {
        self.header.stages_path.push(stage.to_string());
    }

    /// Mark this record as failed by `stage`.
    pub fn with_error(
        mut self,
        stage: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        self.header.error = Some(RecordError {
            stage: stage.into(),
            code: code.into(),
            message: message.into(),
        });
        self
    }
}

// ---------------------------------------------------------------------------
// StageOutput: what one stage produced during a run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageOutput {
    pub instance_name: String,
    #[serde(default)]
    pub records: Vec<Record>,
    #[serde(default)]
    pub error_records: Vec<Record>,
    #[serde(default)]
    pub stage_errors: Vec<String>,
}

impl StageOutput {
    pub fn new(instance_name: impl Into<String>) -> Self {
        Self {
            instance_name: instance_name.into(),
            ..Self::default()
        }
    }

    pub fn with_records(mut self, records: Vec<Record>) -> Self {
        self.records = records;
        self
    }
}
