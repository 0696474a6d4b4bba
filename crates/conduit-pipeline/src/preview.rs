//! Preview executor: one init/run/destroy cycle with optional stage overrides.

use conduit_types::{ConduitError, Issue, Issues, Result, StageOutput};
use serde::Serialize;

use crate::pipeline::Pipeline;
use crate::runner::StageOverrides;

/// What a preview run produced.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewPipelineOutput {
    pub issues: Issues,
    pub outputs: Vec<StageOutput>,
    pub destroy_warnings: Vec<Issue>,
}

pub struct PreviewPipeline {
    pipeline: Pipeline,
    issues: Issues,
}

impl PreviewPipeline {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            issues: Issues::new(),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn issues(&self) -> &Issues {
        &self.issues
    }

    pub fn validate_configs(&mut self) -> Vec<Issue> {
        self.pipeline.validate_configs()
    }

    pub fn run(&mut self) -> Result<PreviewPipelineOutput> {
        self.run_with_overrides(&StageOverrides::default())
    }

    /// Init and run the pipeline, then always destroy it.
    ///
    /// Init issues abort the preview with [`ConduitError::PipelineRuntime`].
    pub fn run_with_overrides(&mut self, overrides: &StageOverrides) -> Result<PreviewPipelineOutput> {
        if let Err(e) = self.pipeline.telemetry().register() {
            tracing::warn!(error = %e, "Failed to register pipeline metrics");
        }

        let init_issues = self.pipeline.init();
        let result = if init_issues.is_empty() {
            self.pipeline.run(overrides)
        } else {
            self.issues.extend(init_issues);
            Err(ConduitError::PipelineRuntime {
                issues: self.issues.clone(),
            })
        };

        let destroy_warnings = self.pipeline.destroy();
        result?;

        Ok(PreviewPipelineOutput {
            issues: self.issues.clone(),
            outputs: self.pipeline.runner().outputs().to_vec(),
            destroy_warnings,
        })
    }

    pub fn destroy(&mut self) -> Vec<Issue> {
        self.pipeline.destroy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::{dev_library, DEV_LIBRARY, DEV_VERSION};
    use conduit_types::{PipelineConfiguration, Record, StageConfiguration};
    use serde_json::json;
    use std::sync::Arc;
    use uuid::Uuid;

    fn preview(stages: Vec<StageConfiguration>) -> PreviewPipeline {
        let config = PipelineConfiguration::new(Uuid::new_v4(), stages);
        PreviewPipeline::new(Pipeline::with_library(config, Arc::new(dev_library())))
    }

    fn dev(instance: &str, stage: &str) -> StageConfiguration {
        StageConfiguration::new(instance, DEV_LIBRARY, stage, DEV_VERSION)
    }

    #[test]
    fn preview_captures_every_stage() {
        let mut preview = preview(vec![
            dev("src", "raw_source").with_config("records", json!([{"x": 1}])),
            dev("id", "identity"),
            dev("out", "trash"),
        ]);
        let output = preview.run().unwrap();
        let names: Vec<&str> = output.outputs.iter().map(|o| o.instance_name.as_str()).collect();
        assert_eq!(names, vec!["src", "id", "out"]);
        assert_eq!(output.outputs[1].records[0].header.stages_path, vec!["src", "id"]);
        assert!(output.destroy_warnings.is_empty());
    }

    #[test]
    fn override_replaces_stage_output() {
        let mut preview = preview(vec![
            dev("src", "raw_source").with_config("records", json!([{"x": 1}])),
            dev("id", "identity"),
            dev("out", "trash"),
        ]);
        let recorded = StageOutput::new("src").with_records(vec![
            Record::new("r1", "src", json!({"x": 10})),
            Record::new("r2", "src", json!({"x": 20})),
        ]);
        let output = preview
            .run_with_overrides(&StageOverrides::new().with(recorded))
            .unwrap();
        assert_eq!(output.outputs[1].records.len(), 2);
        assert_eq!(output.outputs[1].records[1].value, json!({"x": 20}));
    }

    #[test]
    fn init_issues_become_runtime_error() {
        let mut preview = preview(vec![dev("src", "raw_source"), dev("out", "trash")]);
        let err = preview.run().unwrap_err();
        match err {
            ConduitError::PipelineRuntime { issues } => {
                assert_eq!(issues.len(), 1);
                assert_eq!(issues.as_slice()[0].config_name.as_deref(), Some("records"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(preview.issues().len(), 1);
        assert!(preview.pipeline().beans().is_empty());
    }
}
