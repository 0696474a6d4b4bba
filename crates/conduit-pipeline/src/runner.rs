//! Sequential stage execution with per-stage output capture.

use std::collections::HashMap;
use std::time::Instant;

use conduit_el::Evaluator;
use conduit_types::config::JsonMap;
use conduit_types::{
    ConduitError, Issue, OnRecordError, Record, Result, StageKind, StageOutput,
};
use serde::{Deserialize, Serialize};

use crate::bean::StageBean;
use crate::events::PipelineEvent;
use crate::pipeline::PipelineOptions;
use crate::stage::{record_variables, Batch};

/// Error record code: a required field is missing.
pub const REQUIRED_FIELDS_MISSING: &str = "CONTAINER_0050";
/// Error record code: a record precondition did not hold.
pub const PRECONDITION_FAILED: &str = "CONTAINER_0051";
/// Issue code for errors a stage reported alongside its output.
pub const STAGE_REPORTED_ERROR: &str = "CONTAINER_0052";
/// Issue code for a failed stage.
pub const STAGE_FAILED: &str = "CONTAINER_0053";

// ---------------------------------------------------------------------------
// StageOverrides
// ---------------------------------------------------------------------------

/// Recorded stage outputs used instead of running the stage (preview mode).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<StageOutput>", into = "Vec<StageOutput>")]
pub struct StageOverrides {
    outputs: HashMap<String, StageOutput>,
}

impl StageOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, output: StageOutput) {
        self.outputs.insert(output.instance_name.clone(), output);
    }

    pub fn with(mut self, output: StageOutput) -> Self {
        self.insert(output);
        self
    }

    pub fn get(&self, instance_name: &str) -> Option<&StageOutput> {
        self.outputs.get(instance_name)
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Parse a JSON array of stage outputs.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

impl From<Vec<StageOutput>> for StageOverrides {
    fn from(outputs: Vec<StageOutput>) -> Self {
        outputs.into_iter().collect()
    }
}

impl From<StageOverrides> for Vec<StageOutput> {
    fn from(overrides: StageOverrides) -> Self {
        let mut outputs: Vec<StageOutput> = overrides.outputs.into_values().collect();
        outputs.sort_by(|a, b| a.instance_name.cmp(&b.instance_name));
        outputs
    }
}

impl FromIterator<StageOutput> for StageOverrides {
    fn from_iter<I: IntoIterator<Item = StageOutput>>(iter: I) -> Self {
        let mut overrides = Self::new();
        for output in iter {
            overrides.insert(output);
        }
        overrides
    }
}

// ---------------------------------------------------------------------------
// PipelineRunner
// ---------------------------------------------------------------------------

/// Shared, read-only inputs of one run.
pub(crate) struct RunContext<'a> {
    pub options: &'a PipelineOptions,
    pub evaluator: &'a dyn Evaluator,
    pub constants: &'a JsonMap,
}

/// Drives records through the stage chain and captures what each stage produced.
#[derive(Debug, Default)]
pub struct PipelineRunner {
    outputs: Vec<StageOutput>,
    issues: Vec<Issue>,
}

impl PipelineRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captured output of every stage that ran, in execution order.
    pub fn outputs(&self) -> &[StageOutput] {
        &self.outputs
    }

    pub fn output(&self, instance_name: &str) -> Option<&StageOutput> {
        self.outputs.iter().find(|o| o.instance_name == instance_name)
    }

    /// Issues accumulated while running (stage-reported errors).
    pub fn issues(&self) -> &[Issue] {
        &self.issues
    }

    pub(crate) fn run(
        &mut self,
        ctx: &RunContext<'_>,
        beans: &mut [StageBean],
        error_bean: Option<&mut StageBean>,
        overrides: &StageOverrides,
    ) -> Result<()> {
        self.outputs.clear();
        self.issues.clear();

        let mut input: Vec<Record> = Vec::new();
        let mut pending_errors: Vec<Record> = Vec::new();

        for bean in beans.iter_mut() {
            if ctx.options.cancel.is_cancelled() {
                tracing::info!(stage = bean.instance_name(), "Pipeline run cancelled");
                return Err(ConduitError::Cancelled);
            }

            let output = match overrides.get(bean.instance_name()) {
                Some(recorded) => {
                    ctx.options.events.emit(PipelineEvent::StageOverridden {
                        instance_name: bean.instance_name().to_string(),
                        records: recorded.records.len(),
                    });
                    StageOutput {
                        instance_name: bean.instance_name().to_string(),
                        ..recorded.clone()
                    }
                }
                None => self.process_stage(ctx, bean, std::mem::take(&mut input))?,
            };

            ctx.options.telemetry.record_stage(
                &output.instance_name,
                output.records.len(),
                output.error_records.len(),
            );
            self.collect_stage_errors(&output);

            match bean.system_configs().on_record_error {
                _ if output.error_records.is_empty() => {}
                OnRecordError::Discard => {
                    tracing::debug!(
                        stage = bean.instance_name(),
                        count = output.error_records.len(),
                        "Discarding error records"
                    );
                }
                OnRecordError::ToError => pending_errors.extend(output.error_records.iter().cloned()),
                OnRecordError::StopPipeline => {
                    let first = output.error_records[0]
                        .header
                        .error
                        .as_ref()
                        .map(|e| format!("{}: {}", e.code, e.message))
                        .unwrap_or_default();
                    let message = format!(
                        "{} error record(s) with onRecordError=STOP_PIPELINE ({first})",
                        output.error_records.len()
                    );
                    self.outputs.push(output);
                    return Err(self.fail(ctx, bean.instance_name(), message));
                }
            }

            input = output.records.clone();
            self.outputs.push(output);
        }

        if let Some(bean) = error_bean {
            self.run_error_stage(ctx, bean, pending_errors, overrides)?;
        } else if !pending_errors.is_empty() {
            tracing::debug!(count = pending_errors.len(), "No error stage configured; dropping error records");
        }
        Ok(())
    }

    fn run_error_stage(
        &mut self,
        ctx: &RunContext<'_>,
        bean: &mut StageBean,
        errors: Vec<Record>,
        overrides: &StageOverrides,
    ) -> Result<()> {
        let output = match overrides.get(bean.instance_name()) {
            Some(recorded) => StageOutput {
                instance_name: bean.instance_name().to_string(),
                ..recorded.clone()
            },
            None if errors.is_empty() => return Ok(()),
            None => self.process_stage(ctx, bean, errors)?,
        };
        ctx.options
            .telemetry
            .record_stage(&output.instance_name, output.records.len(), 0);
        self.outputs.push(output);
        Ok(())
    }

    fn process_stage(
        &mut self,
        ctx: &RunContext<'_>,
        bean: &mut StageBean,
        records: Vec<Record>,
    ) -> Result<StageOutput> {
        let instance_name = bean.instance_name().to_string();
        ctx.options.events.emit(PipelineEvent::StageStarted {
            instance_name: instance_name.clone(),
            input_records: records.len(),
        });
        let started = Instant::now();

        let (records, mut rejected) = if bean.definition().kind == StageKind::Source {
            (records, Vec::new())
        } else {
            check_preconditions(ctx, bean, records)
        };

        let batch = Batch::new(records, ctx.options.batch_size);
        let produced = match bean.stage_mut().process(batch) {
            Ok(produced) => produced,
            Err(e) => return Err(self.fail(ctx, &instance_name, e.to_string())),
        };

        let mut output = StageOutput::new(&instance_name).with_records(produced.records);
        if bean.definition().kind != StageKind::Source {
            for record in &mut output.records {
                record.touch(&instance_name);
            }
        }
        rejected.extend(produced.error_records);
        output.error_records = rejected;
        output.stage_errors = produced.stage_errors;

        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::debug!(
            stage = %instance_name,
            records = output.records.len(),
            error_records = output.error_records.len(),
            duration_ms,
            "Stage completed"
        );
        ctx.options.events.emit(PipelineEvent::StageCompleted {
            instance_name,
            records: output.records.len(),
            error_records: output.error_records.len(),
            duration_ms,
        });
        Ok(output)
    }

    fn collect_stage_errors(&mut self, output: &StageOutput) {
        self.issues.extend(output.stage_errors.iter().map(|message| {
            Issue::stage(&output.instance_name, STAGE_REPORTED_ERROR, message.clone())
        }));
    }

    fn fail(&mut self, ctx: &RunContext<'_>, instance_name: &str, message: String) -> ConduitError {
        tracing::error!(stage = instance_name, error = %message, "Stage failed");
        ctx.options.events.emit(PipelineEvent::StageFailed {
            instance_name: instance_name.to_string(),
            error: message.clone(),
        });
        self.issues
            .push(Issue::stage(instance_name, STAGE_FAILED, message.clone()));
        ConduitError::StageExecution {
            instance_name: instance_name.to_string(),
            message,
            issues: self.issues.clone(),
        }
    }
}

/// Split records into those satisfying the stage's required fields and
/// record preconditions, and error records for the rest.
fn check_preconditions(
    ctx: &RunContext<'_>,
    bean: &StageBean,
    records: Vec<Record>,
) -> (Vec<Record>, Vec<Record>) {
    let system = bean.system_configs();
    if system.required_fields.is_empty() && system.record_preconditions.is_empty() {
        return (records, Vec::new());
    }
    let instance_name = bean.instance_name();

    let mut accepted = Vec::with_capacity(records.len());
    let mut rejected = Vec::new();
    'records: for record in records {
        let missing: Vec<&str> = system
            .required_fields
            .iter()
            .map(String::as_str)
            .filter(|field| record.get(&field_pointer(field)).is_none())
            .collect();
        if !missing.is_empty() {
            rejected.push(record.with_error(
                instance_name,
                REQUIRED_FIELDS_MISSING,
                format!("Required fields missing: {}", missing.join(", ")),
            ));
            continue;
        }

        for precondition in &system.record_preconditions {
            let mut vars = record_variables(&record, ctx.constants);
            let message = match ctx.evaluator.eval_bool(precondition, &mut vars) {
                Ok(true) => continue,
                Ok(false) => format!("Unsatisfied precondition '{precondition}'"),
                Err(e) => format!("Failed to evaluate precondition '{precondition}': {e}"),
            };
            rejected.push(record.with_error(instance_name, PRECONDITION_FAILED, message));
            continue 'records;
        }
        accepted.push(record);
    }
    (accepted, rejected)
}

fn field_pointer(field: &str) -> String {
    if field.starts_with('/') {
        field.to_string()
    } else {
        format!("/{field}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn overrides_load_from_json_array() {
        let overrides = StageOverrides::from_json_str(
            r#"[{"instanceName": "src", "records": [
                {"header": {"sourceId": "r1", "stageCreator": "src"}, "value": {"a": 1}}
            ]}]"#,
        )
        .unwrap();
        assert_eq!(overrides.len(), 1);
        let src = overrides.get("src").unwrap();
        assert_eq!(src.records[0].value, json!({"a": 1}));
        assert!(overrides.get("other").is_none());
    }

    #[test]
    fn overrides_serialize_sorted_by_instance() {
        let overrides = StageOverrides::new()
            .with(StageOutput::new("b"))
            .with(StageOutput::new("a"));
        let value = serde_json::to_value(&overrides).unwrap();
        assert_eq!(value[0]["instanceName"], "a");
        assert_eq!(value[1]["instanceName"], "b");
    }

    #[test]
    fn field_pointer_accepts_both_forms() {
        assert_eq!(field_pointer("a/b"), "/a/b");
        assert_eq!(field_pointer("/a"), "/a");
    }
}
