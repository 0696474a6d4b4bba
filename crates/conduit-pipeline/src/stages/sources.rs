use conduit_types::{Issue, Record, Result};

use crate::stage::{Batch, BatchOutput, InitContext, Stage};

/// Source emitting the records configured under `records`.
#[derive(Debug, Default)]
pub struct RawSource {
    instance_name: String,
    records: Vec<serde_json::Value>,
}

impl Stage for RawSource {
    fn init(&mut self, ctx: &InitContext<'_>) -> Vec<Issue> {
        self.instance_name = ctx.instance_name().to_string();
        match ctx.require_config("records") {
            Ok(serde_json::Value::Array(records)) => {
                self.records = records;
                vec![]
            }
            Ok(other) => vec![ctx.config_issue(
                "records",
                format!("'records' must be a JSON array, got {other}"),
            )],
            Err(issue) => vec![issue],
        }
    }

    fn process(&mut self, batch: Batch) -> Result<BatchOutput> {
        let limit = if batch.max_size == 0 {
            self.records.len()
        } else {
            batch.max_size
        };
        let records = self
            .records
            .iter()
            .take(limit)
            .enumerate()
            .map(|(i, value)| {
                Record::new(
                    format!("{}::{i}", self.instance_name),
                    &self.instance_name,
                    value.clone(),
                )
            })
            .collect();
        Ok(BatchOutput::records(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::record_evaluator;
    use conduit_types::config::JsonMap;
    use conduit_types::{ConfigDefinition, StageConfiguration, StageDefinition, StageKind, StageSystemConfig};
    use serde_json::json;
    use std::sync::Arc;

    fn init(records: serde_json::Value) -> (RawSource, Vec<Issue>) {
        let definition = StageDefinition::new("dev", "raw_source", "1", StageKind::Source)
            .with_config(ConfigDefinition::required("records"));
        let configuration =
            StageConfiguration::new("src", "dev", "raw_source", "1").with_config("records", records);
        let ctx = InitContext {
            definition: &definition,
            configuration: &configuration,
            system: &StageSystemConfig::default(),
            constants: &JsonMap::new(),
            evaluator: Arc::new(record_evaluator()),
        };
        let mut stage = RawSource::default();
        let issues = stage.init(&ctx);
        (stage, issues)
    }

    #[test]
    fn emits_configured_records_with_ids() {
        let (mut stage, issues) = init(json!([{"a": 1}, {"a": 2}]));
        assert!(issues.is_empty());
        let out = stage.process(Batch::default()).unwrap();
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.records[1].header.source_id, "src::1");
        assert_eq!(out.records[0].value, json!({"a": 1}));
    }

    #[test]
    fn batch_size_caps_output() {
        let (mut stage, _) = init(json!([1, 2, 3]));
        let out = stage.process(Batch::new(vec![], 2)).unwrap();
        assert_eq!(out.records.len(), 2);
    }

    #[test]
    fn non_array_is_an_issue() {
        let (_, issues) = init(json!("nope"));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].config_name.as_deref(), Some("records"));
    }
}
