//! Pipeline configuration validation: rules and issues.
//!
//! Each [`ValidationRule`] inspects the configuration document against the
//! stage library. Call [`validate`] for the full report or
//! [`validate_or_raise`] to fail on the first error-severity issue.

use std::collections::HashSet;

use conduit_types::config::CURRENT_SCHEMA_VERSION;
use conduit_types::{
    ConduitError, Issue, Issues, PipelineConfiguration, StageConfiguration, StageKind,
    StageSystemConfig,
};

use crate::library::StageLibrary;

pub const EMPTY_PIPELINE: &str = "VALIDATION_0001";
pub const UNSUPPORTED_SCHEMA: &str = "VALIDATION_0002";
pub const DUPLICATE_INSTANCE: &str = "VALIDATION_0003";
pub const UNKNOWN_STAGE: &str = "VALIDATION_0004";
pub const FIRST_NOT_SOURCE: &str = "VALIDATION_0005";
pub const EXTRA_SOURCE: &str = "VALIDATION_0006";
pub const LAST_NOT_TARGET: &str = "VALIDATION_0007";
pub const TARGET_NOT_LAST: &str = "VALIDATION_0008";
pub const MISSING_CONFIG: &str = "VALIDATION_0009";
pub const UNKNOWN_CONFIG: &str = "VALIDATION_0010";
pub const BAD_SYSTEM_CONFIG: &str = "VALIDATION_0011";
pub const BAD_ERROR_STAGE: &str = "VALIDATION_0012";
pub const BAD_EXPRESSION: &str = "VALIDATION_0013";

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub issues: Issues,
    pub previewable: bool,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        !self.issues.has_errors()
    }
}

// ---------------------------------------------------------------------------
// ValidationRule trait
// ---------------------------------------------------------------------------

pub trait ValidationRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, config: &PipelineConfiguration, library: &StageLibrary) -> Vec<Issue>;
}

fn all_stages(config: &PipelineConfiguration) -> impl Iterator<Item = &StageConfiguration> {
    config.stages().iter().chain(config.error_stage())
}

fn known_stages<'a>(
    config: &'a PipelineConfiguration,
    library: &'a StageLibrary,
) -> impl Iterator<Item = (&'a StageConfiguration, &'a conduit_types::StageDefinition)> {
    all_stages(config).filter_map(move |s| library.definition_for(s).map(|d| (s, d)))
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct EmptyPipelineRule;
impl ValidationRule for EmptyPipelineRule {
    fn name(&self) -> &str { "empty_pipeline" }
    fn apply(&self, config: &PipelineConfiguration, _library: &StageLibrary) -> Vec<Issue> {
        if config.stages().is_empty() {
            vec![Issue::pipeline(EMPTY_PIPELINE, "The pipeline has no stages")]
        } else {
            vec![]
        }
    }
}

struct SchemaVersionRule;
impl ValidationRule for SchemaVersionRule {
    fn name(&self) -> &str { "schema_version" }
    fn apply(&self, config: &PipelineConfiguration, _library: &StageLibrary) -> Vec<Issue> {
        if config.schema_version() > CURRENT_SCHEMA_VERSION {
            vec![Issue::pipeline(
                UNSUPPORTED_SCHEMA,
                format!(
                    "Schema version {} is newer than the supported version {}",
                    config.schema_version(),
                    CURRENT_SCHEMA_VERSION
                ),
            )]
        } else {
            vec![]
        }
    }
}

struct UniqueInstanceNamesRule;
impl ValidationRule for UniqueInstanceNamesRule {
    fn name(&self) -> &str { "unique_instance_names" }
    fn apply(&self, config: &PipelineConfiguration, _library: &StageLibrary) -> Vec<Issue> {
        let mut seen = HashSet::new();
        all_stages(config)
            .filter(|s| !seen.insert(s.instance_name.as_str()))
            .map(|s| {
                Issue::stage(
                    &s.instance_name,
                    DUPLICATE_INSTANCE,
                    format!("Instance name '{}' is used by more than one stage", s.instance_name),
                )
            })
            .collect()
    }
}

struct StageExistsRule;
impl ValidationRule for StageExistsRule {
    fn name(&self) -> &str { "stage_exists" }
    fn apply(&self, config: &PipelineConfiguration, library: &StageLibrary) -> Vec<Issue> {
        all_stages(config)
            .filter(|s| library.definition_for(s).is_none())
            .map(|s| {
                Issue::stage(
                    &s.instance_name,
                    UNKNOWN_STAGE,
                    format!(
                        "Stage '{}::{}' version '{}' is not in the stage library",
                        s.library, s.stage_name, s.stage_version
                    ),
                )
            })
            .collect()
    }
}

struct StageOrderRule;
impl ValidationRule for StageOrderRule {
    fn name(&self) -> &str { "stage_order" }
    fn apply(&self, config: &PipelineConfiguration, library: &StageLibrary) -> Vec<Issue> {
        let kinds: Vec<(&StageConfiguration, StageKind)> = config
            .stages()
            .iter()
            .filter_map(|s| library.definition_for(s).map(|d| (s, d.kind)))
            .collect();
        let Some(&(first, first_kind)) = kinds.first() else {
            return vec![];
        };
        let last_index = kinds.len() - 1;

        let mut issues = Vec::new();
        if first_kind != StageKind::Source {
            issues.push(Issue::stage(
                &first.instance_name,
                FIRST_NOT_SOURCE,
                format!("The first stage must be a source, found a {first_kind}"),
            ));
        }
        for (i, (stage, kind)) in kinds.iter().enumerate().skip(1) {
            match kind {
                StageKind::Source => issues.push(Issue::stage(
                    &stage.instance_name,
                    EXTRA_SOURCE,
                    "A pipeline can only have one source, placed first",
                )),
                StageKind::Target if i != last_index => issues.push(Issue::stage(
                    &stage.instance_name,
                    TARGET_NOT_LAST,
                    "Targets produce no records and must be the last stage",
                )),
                _ => {}
            }
        }
        let (last, last_kind) = kinds[last_index];
        if last_index > 0 && last_kind == StageKind::Processor {
            issues.push(
                Issue::stage(
                    &last.instance_name,
                    LAST_NOT_TARGET,
                    "The pipeline ends in a processor; its records are not written anywhere",
                )
                .warning(),
            );
        }
        issues
    }
}

struct RequiredConfigsRule;
impl ValidationRule for RequiredConfigsRule {
    fn name(&self) -> &str { "required_configs" }
    fn apply(&self, config: &PipelineConfiguration, library: &StageLibrary) -> Vec<Issue> {
        let mut issues = Vec::new();
        for (stage, definition) in known_stages(config, library) {
            for def in definition.config_definitions.iter().filter(|d| d.required) {
                let present = stage.config(&def.name).is_some_and(|v| !v.is_null())
                    || def.default_value.as_ref().is_some_and(|v| !v.is_null());
                if !present {
                    issues.push(
                        Issue::stage(
                            &stage.instance_name,
                            MISSING_CONFIG,
                            format!("Configuration '{}' is required", def.name),
                        )
                        .with_config(&def.name),
                    );
                }
            }
        }
        issues
    }
}

struct UnknownConfigsRule;
impl ValidationRule for UnknownConfigsRule {
    fn name(&self) -> &str { "unknown_configs" }
    fn apply(&self, config: &PipelineConfiguration, library: &StageLibrary) -> Vec<Issue> {
        let mut issues = Vec::new();
        for (stage, definition) in known_stages(config, library) {
            for entry in stage.user_configs() {
                if definition.config_definition(&entry.name).is_none() {
                    issues.push(
                        Issue::stage(
                            &stage.instance_name,
                            UNKNOWN_CONFIG,
                            format!(
                                "Configuration '{}' is not declared by {}",
                                entry.name,
                                definition.qualified_name()
                            ),
                        )
                        .with_config(&entry.name)
                        .warning(),
                    );
                }
            }
        }
        issues
    }
}

struct SystemConfigsRule;
impl ValidationRule for SystemConfigsRule {
    fn name(&self) -> &str { "system_configs" }
    fn apply(&self, config: &PipelineConfiguration, _library: &StageLibrary) -> Vec<Issue> {
        all_stages(config)
            .filter_map(|s| {
                StageSystemConfig::from_entries(&s.instance_name, &s.configuration)
                    .err()
                    .map(|e| Issue::stage(&s.instance_name, BAD_SYSTEM_CONFIG, e.to_string()))
            })
            .collect()
    }
}

struct ErrorStageRule;
impl ValidationRule for ErrorStageRule {
    fn name(&self) -> &str { "error_stage" }
    fn apply(&self, config: &PipelineConfiguration, library: &StageLibrary) -> Vec<Issue> {
        let Some(stage) = config.error_stage() else {
            return vec![];
        };
        match library.definition_for(stage) {
            // reported by stage_exists
            None => vec![],
            Some(def) if !def.error_stage_capable => vec![Issue::stage(
                &stage.instance_name,
                BAD_ERROR_STAGE,
                format!("{} cannot be used as an error stage", def.qualified_name()),
            )],
            Some(_) => vec![],
        }
    }
}

/// Parse-check a predicate: bare, or a single `${...}`.
fn check_predicate(text: &str) -> conduit_types::Result<()> {
    if text.trim_start().starts_with("${") {
        conduit_el::parse_template(text).map(|_| ())
    } else {
        conduit_el::parse_expression(text).map(|_| ())
    }
}

fn collect_templates<'a>(value: &'a serde_json::Value, out: &mut Vec<&'a str>) {
    match value {
        serde_json::Value::String(s) if s.contains("${") => out.push(s),
        serde_json::Value::Array(items) => items.iter().for_each(|v| collect_templates(v, out)),
        serde_json::Value::Object(map) => map.values().for_each(|v| collect_templates(v, out)),
        _ => {}
    }
}

struct ExpressionSyntaxRule;
impl ValidationRule for ExpressionSyntaxRule {
    fn name(&self) -> &str { "expression_syntax" }
    fn apply(&self, config: &PipelineConfiguration, _library: &StageLibrary) -> Vec<Issue> {
        let mut issues = Vec::new();

        for entry in config.configuration() {
            let mut texts = Vec::new();
            collect_templates(&entry.value, &mut texts);
            for text in texts {
                if let Err(e) = conduit_el::parse_template(text) {
                    issues.push(
                        Issue::pipeline(BAD_EXPRESSION, format!("Invalid expression '{text}': {e}"))
                            .with_config(&entry.name),
                    );
                }
            }
        }

        for stage in all_stages(config) {
            for entry in stage.user_configs() {
                let mut texts = Vec::new();
                collect_templates(&entry.value, &mut texts);
                for text in texts {
                    if let Err(e) = conduit_el::parse_template(text) {
                        issues.push(
                            Issue::stage(
                                &stage.instance_name,
                                BAD_EXPRESSION,
                                format!("Invalid expression '{text}': {e}"),
                            )
                            .with_config(&entry.name),
                        );
                    }
                }
            }
            if let Ok(system) = StageSystemConfig::from_entries(&stage.instance_name, &stage.configuration) {
                for precondition in &system.record_preconditions {
                    if let Err(e) = check_predicate(precondition) {
                        issues.push(
                            Issue::stage(
                                &stage.instance_name,
                                BAD_EXPRESSION,
                                format!("Invalid record precondition '{precondition}': {e}"),
                            )
                            .with_config(conduit_types::config::RECORD_PRECONDITIONS_CONFIG),
                        );
                    }
                }
            }
        }
        issues
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub fn default_rules() -> Vec<Box<dyn ValidationRule>> {
    vec![
        Box::new(EmptyPipelineRule),
        Box::new(SchemaVersionRule),
        Box::new(UniqueInstanceNamesRule),
        Box::new(StageExistsRule),
        Box::new(StageOrderRule),
        Box::new(RequiredConfigsRule),
        Box::new(UnknownConfigsRule),
        Box::new(SystemConfigsRule),
        Box::new(ErrorStageRule),
        Box::new(ExpressionSyntaxRule),
    ]
}

/// Run all built-in rules. Never allocates stage instances.
///
/// The pipeline stays previewable when every error is attributed to a
/// target stage, since preview can substitute target output.
pub fn validate(config: &PipelineConfiguration, library: &StageLibrary) -> ValidationReport {
    let mut issues = Issues::new();
    for rule in default_rules() {
        let found = rule.apply(config, library);
        if !found.is_empty() {
            tracing::debug!(rule = rule.name(), count = found.len(), "Validation rule reported issues");
        }
        issues.extend(found);
    }

    let is_target = |name: &str| {
        config
            .stage(name)
            .and_then(|s| library.definition_for(s))
            .is_some_and(|d| d.kind == StageKind::Target)
    };
    let previewable = issues
        .iter()
        .filter(|i| i.is_error())
        .all(|i| i.instance_name.as_deref().is_some_and(&is_target));

    ValidationReport {
        issues,
        previewable,
    }
}

/// Run all rules; return `Err` if any error-severity issue is found.
pub fn validate_or_raise(
    config: &PipelineConfiguration,
    library: &StageLibrary,
) -> conduit_types::Result<ValidationReport> {
    let report = validate(config, library);
    if report.issues.has_errors() {
        let messages: Vec<String> = report
            .issues
            .iter()
            .filter(|i| i.is_error())
            .map(ToString::to_string)
            .collect();
        return Err(ConduitError::Validation(messages.join("; ")));
    }
    Ok(report)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::{dev_library, Trash};
    use conduit_types::{ConfigDefinition, StageDefinition};
    use conduit_types::config::{ON_RECORD_ERROR_CONFIG, RECORD_PRECONDITIONS_CONFIG};
    use serde_json::json;
    use uuid::Uuid;

    fn source() -> StageConfiguration {
        StageConfiguration::new("src", "dev", "raw_source", "1").with_config("records", json!([]))
    }

    fn trash(name: &str) -> StageConfiguration {
        StageConfiguration::new(name, "dev", "trash", "1")
    }

    fn pipeline(stages: Vec<StageConfiguration>) -> PipelineConfiguration {
        PipelineConfiguration::new(Uuid::nil(), stages)
    }

    fn codes(report: &ValidationReport) -> Vec<&str> {
        report.issues.iter().map(|i| i.code.as_str()).collect()
    }

    #[test]
    fn valid_pipeline_passes() {
        let report = validate(&pipeline(vec![source(), trash("out")]), &dev_library());
        assert!(report.issues.is_empty(), "unexpected: {:?}", report.issues);
        assert!(report.previewable);
        assert!(report.is_valid());
    }

    #[test]
    fn empty_pipeline_error() {
        let report = validate(&pipeline(vec![]), &dev_library());
        assert_eq!(codes(&report), vec![EMPTY_PIPELINE]);
        assert!(!report.previewable);
    }

    #[test]
    fn newer_schema_rejected() {
        let config = pipeline(vec![source(), trash("out")])
            .with_schema_version(CURRENT_SCHEMA_VERSION + 1);
        let report = validate(&config, &dev_library());
        assert!(codes(&report).contains(&UNSUPPORTED_SCHEMA));
    }

    #[test]
    fn duplicate_instance_names() {
        let report = validate(&pipeline(vec![source(), trash("src")]), &dev_library());
        assert!(codes(&report).contains(&DUPLICATE_INSTANCE));
    }

    #[test]
    fn unknown_stage_reported() {
        let stages = vec![source(), StageConfiguration::new("x", "dev", "nope", "1")];
        let report = validate(&pipeline(stages), &dev_library());
        let issue = report.issues.iter().find(|i| i.code == UNKNOWN_STAGE).unwrap();
        assert_eq!(issue.instance_name.as_deref(), Some("x"));
    }

    #[test]
    fn stage_order_rules() {
        let stages = vec![
            StageConfiguration::new("p", "dev", "identity", "1"),
            source(),
            trash("t1"),
            StageConfiguration::new("p2", "dev", "identity", "1"),
        ];
        let report = validate(&pipeline(stages), &dev_library());
        let found = codes(&report);
        assert!(found.contains(&FIRST_NOT_SOURCE));
        assert!(found.contains(&EXTRA_SOURCE));
        assert!(found.contains(&TARGET_NOT_LAST));
        let last = report.issues.iter().find(|i| i.code == LAST_NOT_TARGET).unwrap();
        assert!(!last.is_error());
    }

    #[test]
    fn missing_required_config() {
        let stages = vec![StageConfiguration::new("src", "dev", "raw_source", "1"), trash("out")];
        let report = validate(&pipeline(stages), &dev_library());
        let issue = report.issues.iter().find(|i| i.code == MISSING_CONFIG).unwrap();
        assert_eq!(issue.config_name.as_deref(), Some("records"));
        assert!(!report.previewable);
    }

    #[test]
    fn unknown_config_is_warning() {
        let stages = vec![source().with_config("bogus", json!(1)), trash("out")];
        let report = validate(&pipeline(stages), &dev_library());
        assert_eq!(codes(&report), vec![UNKNOWN_CONFIG]);
        assert!(report.is_valid());
    }

    #[test]
    fn system_entries_are_not_unknown_configs() {
        let stages = vec![
            source(),
            StageConfiguration::new("p", "dev", "identity", "1")
                .with_config(ON_RECORD_ERROR_CONFIG, json!("DISCARD")),
            trash("out"),
        ];
        let report = validate(&pipeline(stages), &dev_library());
        assert!(report.issues.is_empty(), "unexpected: {:?}", report.issues);
    }

    #[test]
    fn bad_system_config() {
        let stages = vec![
            source(),
            trash("out").with_config(ON_RECORD_ERROR_CONFIG, json!("EXPLODE")),
        ];
        let report = validate(&pipeline(stages), &dev_library());
        assert!(codes(&report).contains(&BAD_SYSTEM_CONFIG));
    }

    #[test]
    fn error_stage_must_be_capable() {
        let config = pipeline(vec![source(), trash("out")]).with_error_stage(trash("err"));
        let report = validate(&config, &dev_library());
        assert!(codes(&report).contains(&BAD_ERROR_STAGE));

        let config = pipeline(vec![source(), trash("out")])
            .with_error_stage(StageConfiguration::new("err", "dev", "to_error", "1"));
        assert!(validate(&config, &dev_library()).issues.is_empty());
    }

    #[test]
    fn expression_syntax_checked() {
        let stages = vec![
            source(),
            StageConfiguration::new("f", "dev", "expression_filter", "1")
                .with_config("condition", json!("${record:value('/a') >}"))
                .with_config(RECORD_PRECONDITIONS_CONFIG, json!(["record:exists('/a') &&"])),
            trash("out"),
        ];
        let report = validate(&pipeline(stages), &dev_library());
        let bad: Vec<_> = report.issues.iter().filter(|i| i.code == BAD_EXPRESSION).collect();
        assert_eq!(bad.len(), 2, "got {:?}", report.issues);
    }

    #[test]
    fn target_errors_keep_pipeline_previewable() {
        let mut library = dev_library();
        library.register(
            StageDefinition::new("test", "http_target", "1", StageKind::Target)
                .with_config(ConfigDefinition::required("url")),
            |_| Ok(Box::new(Trash)),
        );
        let config = pipeline(vec![
            source(),
            StageConfiguration::new("out", "test", "http_target", "1"),
        ]);
        let report = validate(&config, &library);
        assert!(!report.is_valid());
        assert!(report.previewable);
    }

    #[test]
    fn validate_or_raise_behaviour() {
        assert!(validate_or_raise(&pipeline(vec![source(), trash("out")]), &dev_library()).is_ok());
        let err = validate_or_raise(&pipeline(vec![]), &dev_library()).unwrap_err();
        assert!(matches!(err, ConduitError::Validation(_)));
    }
}
