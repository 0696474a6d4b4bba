use std::collections::BTreeMap;
use std::sync::Arc;

use conduit_el::Evaluator;
use conduit_types::config::JsonMap;
use conduit_types::{Issue, Result};

use crate::stage::{record_variables, Batch, BatchOutput, InitContext, Stage};

pub const FILTER_REJECTED: &str = "FILTER_01";
pub const FILTER_EVAL_ERROR: &str = "FILTER_02";

/// Passes every record through unchanged.
#[derive(Debug, Default)]
pub struct Identity;

impl Stage for Identity {
    fn init(&mut self, _ctx: &InitContext<'_>) -> Vec<Issue> {
        vec![]
    }

    fn process(&mut self, batch: Batch) -> Result<BatchOutput> {
        Ok(BatchOutput::records(batch.records))
    }
}

/// Keeps records for which `condition` holds.
#[derive(Default)]
pub struct ExpressionFilter {
    instance_name: String,
    condition: String,
    constants: JsonMap,
    evaluator: Option<Arc<dyn Evaluator>>,
}

impl Stage for ExpressionFilter {
    fn init(&mut self, ctx: &InitContext<'_>) -> Vec<Issue> {
        self.instance_name = ctx.instance_name().to_string();
        self.constants = ctx.constants.clone();
        self.evaluator = Some(Arc::clone(&ctx.evaluator));

        // the raw text is kept; `config` would render the template away
        match ctx.configuration.config("condition") {
            Some(serde_json::Value::String(condition)) if !condition.trim().is_empty() => {
                self.condition = condition.clone();
                vec![]
            }
            _ => vec![ctx.config_issue("condition", "'condition' must be a non-empty expression")],
        }
    }

    fn process(&mut self, batch: Batch) -> Result<BatchOutput> {
        let Some(evaluator) = self.evaluator.as_ref() else {
            return Err(conduit_types::ConduitError::InvalidState {
                expected: "initialized".into(),
                actual: "uninitialized".into(),
            });
        };

        let mut out = BatchOutput::default();
        for record in batch.records {
            let mut vars = record_variables(&record, &self.constants);
            match evaluator.eval_bool(&self.condition, &mut vars) {
                Ok(true) => out.records.push(record),
                Ok(false) => out.error_records.push(record.with_error(
                    &self.instance_name,
                    FILTER_REJECTED,
                    format!("record does not satisfy '{}'", self.condition),
                )),
                Err(e) => {
                    tracing::debug!(stage = %self.instance_name, error = %e, "Filter condition failed");
                    out.error_records.push(record.with_error(
                        &self.instance_name,
                        FILTER_EVAL_ERROR,
                        e.to_string(),
                    ));
                }
            }
        }
        Ok(out)
    }
}

/// Renames top-level fields according to the `renames` map.
#[derive(Debug, Default)]
pub struct FieldRenamer {
    renames: BTreeMap<String, String>,
}

impl Stage for FieldRenamer {
    fn init(&mut self, ctx: &InitContext<'_>) -> Vec<Issue> {
        let value = match ctx.config("renames") {
            Ok(value) => value.unwrap_or_default(),
            Err(e) => return vec![ctx.config_issue("renames", e.to_string())],
        };
        if value.is_null() {
            return vec![];
        }
        match serde_json::from_value::<BTreeMap<String, String>>(value) {
            Ok(renames) => {
                self.renames = renames;
                vec![]
            }
            Err(e) => vec![ctx.config_issue(
                "renames",
                format!("'renames' must map field names to field names: {e}"),
            )],
        }
    }

    fn process(&mut self, batch: Batch) -> Result<BatchOutput> {
        let mut records = batch.records;
        for record in &mut records {
            if let serde_json::Value::Object(fields) = &mut record.value {
                for (from, to) in &self.renames {
                    if let Some(value) = fields.remove(from) {
                        fields.insert(to.clone(), value);
                    }
                }
            }
        }
        Ok(BatchOutput::records(records))
    }
}
