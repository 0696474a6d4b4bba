//! Stage plugin trait and the context handed to stages at init.

use std::sync::Arc;

use conduit_el::{ContextBuilder, ElEvaluator, Evaluator, Value, Variables};
use conduit_types::config::JsonMap;
use conduit_types::{
    Issue, Record, Result, StageConfiguration, StageDefinition, StageSystemConfig,
};

/// Issue code reported when a configuration value cannot be resolved.
pub const CONFIG_EVAL_ERROR: &str = "CONTAINER_0110";

// ---------------------------------------------------------------------------
// Stage trait
// ---------------------------------------------------------------------------

/// A pluggable processing step: source, processor or target.
pub trait Stage: Send {
    /// Prepare the stage. Problems are returned as issues, never raised.
    fn init(&mut self, ctx: &InitContext<'_>) -> Vec<Issue>;

    /// Process one batch. Sources receive an empty batch.
    fn process(&mut self, batch: Batch) -> Result<BatchOutput>;

    /// Free resources acquired in `init`.
    fn destroy(&mut self) {}
}

/// Records handed to a stage.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub records: Vec<Record>,
    /// Upper bound on records a source should produce.
    pub max_size: usize,
}

impl Batch {
    pub fn new(records: Vec<Record>, max_size: usize) -> Self {
        Self { records, max_size }
    }
}

/// What a stage produced for one batch.
#[derive(Debug, Clone, Default)]
pub struct BatchOutput {
    pub records: Vec<Record>,
    pub error_records: Vec<Record>,
    pub stage_errors: Vec<String>,
}

impl BatchOutput {
    pub fn records(records: Vec<Record>) -> Self {
        Self {
            records,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// InitContext
// ---------------------------------------------------------------------------

/// Everything a stage may consult while initializing.
pub struct InitContext<'a> {
    pub definition: &'a StageDefinition,
    pub configuration: &'a StageConfiguration,
    pub system: &'a StageSystemConfig,
    pub constants: &'a JsonMap,
    pub evaluator: Arc<dyn Evaluator>,
}

impl InitContext<'_> {
    pub fn instance_name(&self) -> &str {
        &self.configuration.instance_name
    }

    /// Resolve a configuration value: the configured entry or the declared
    /// default, with string values rendered as templates against the
    /// pipeline constants.
    pub fn config(&self, name: &str) -> Result<Option<serde_json::Value>> {
        let raw = self.configuration.config(name).cloned().or_else(|| {
            self.definition
                .config_definition(name)
                .and_then(|d| d.default_value.clone())
        });
        match raw {
            Some(serde_json::Value::String(text)) if text.contains("${") => {
                let mut vars = constant_variables(self.constants);
                let rendered = self.evaluator.eval_template(&text, &mut vars)?;
                Ok(Some(serde_json::Value::String(rendered)))
            }
            other => Ok(other),
        }
    }

    /// Like [`InitContext::config`] but turning failures and absence into an issue.
    pub fn require_config(&self, name: &str) -> std::result::Result<serde_json::Value, Issue> {
        match self.config(name) {
            Ok(Some(value)) if !value.is_null() => Ok(value),
            Ok(_) => Err(Issue::stage(
                self.instance_name(),
                CONFIG_EVAL_ERROR,
                format!("configuration '{name}' is required"),
            )
            .with_config(name)),
            Err(e) => Err(self.config_issue(name, e.to_string())),
        }
    }

    pub fn config_issue(&self, name: &str, message: impl Into<String>) -> Issue {
        Issue::stage(self.instance_name(), CONFIG_EVAL_ERROR, message).with_config(name)
    }
}

/// Pipeline constants exposed to configuration expressions by name.
pub fn constant_variables(constants: &JsonMap) -> Variables {
    constants
        .iter()
        .fold(ContextBuilder::new(), |builder, (name, value)| {
            builder.with_json(name.as_str(), value)
        })
        .build()
}

// ---------------------------------------------------------------------------
// record: functions
// ---------------------------------------------------------------------------

/// Variable holding the record under evaluation.
pub const RECORD_VAR: &str = "record";

/// Evaluator with `record:value(path)` and `record:exists(path)` registered.
pub fn record_evaluator() -> ElEvaluator {
    ElEvaluator::new()
        .with_function("record:value", record_value)
        .with_function("record:exists", record_exists)
}

/// Variables for evaluating an expression against one record.
pub fn record_variables(record: &Record, constants: &JsonMap) -> Variables {
    ContextBuilder::from_variables(constant_variables(constants))
        .with_json(RECORD_VAR, &record.value)
        .build()
}

fn lookup_record<'v>(
    args: &[Value],
    vars: &'v Variables,
) -> std::result::Result<Option<&'v Value>, String> {
    let [Value::String(path)] = args else {
        return Err("expected a single field path such as '/a/b'".to_string());
    };
    let mut current = match vars.get(RECORD_VAR) {
        Some(root) => root,
        None => return Ok(None),
    };
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current = match current {
            Value::Map(map) => match map.get(segment) {
                Some(v) => v,
                None => return Ok(None),
            },
            Value::List(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(v) => v,
                None => return Ok(None),
            },
            _ => return Ok(None),
        };
    }
    Ok(Some(current))
}

fn record_value(args: &[Value], vars: &mut Variables) -> std::result::Result<Value, String> {
    Ok(lookup_record(args, vars)?.cloned().unwrap_or_default())
}

fn record_exists(args: &[Value], vars: &mut Variables) -> std::result::Result<Value, String> {
    Ok(Value::Bool(lookup_record(args, vars)?.is_some()))
}
