//! The diagnostic engine: compiles a rule set once, then matches stage
//! failures against it.

use std::error::Error;
use std::fmt;
use std::sync::Arc;

use conduit_el::{ContextBuilder, ElEvaluator, Evaluator, Value, Variables};
use serde::{Deserialize, Serialize};

use crate::context::{DoctorContext, ErrorCode, FailureDescription, StageContext};
use crate::rule::{CompiledRule, EntityScope, RuleDefinition, ScopeRegistry};

/// How a failing rule precondition is treated at load time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreconditionPolicy {
    /// The first false or failing precondition excludes the rule.
    #[default]
    Enforce,
    /// A false or failing precondition is logged and skipped; the rule is
    /// always compiled. Matches the historical rule engine.
    Lenient,
}

/// One remediation hint produced by a matching rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticMessage {
    pub summary: String,
    pub description: String,
}

/// Counts from compiling a rule set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadStats {
    pub declared: usize,
    pub accepted: usize,
    pub out_of_scope: usize,
    pub excluded: usize,
}

/// Compiled rule set plus the evaluator used to match failures against it.
///
/// Immutable after construction; share it behind an `Arc` and call the
/// `on_stage_*` methods from any thread.
pub struct DoctorEngine {
    registry: ScopeRegistry,
    evaluator: Arc<dyn Evaluator>,
    stats: LoadStats,
}

impl DoctorEngine {
    pub fn new(context: &DoctorContext, rules: Vec<RuleDefinition>, policy: PreconditionPolicy) -> Self {
        Self::with_evaluator(context, rules, policy, Arc::new(ElEvaluator::new()))
    }

    pub fn with_evaluator(
        context: &DoctorContext,
        rules: Vec<RuleDefinition>,
        policy: PreconditionPolicy,
        evaluator: Arc<dyn Evaluator>,
    ) -> Self {
        let mut registry = ScopeRegistry::new();
        let mut stats = LoadStats {
            declared: rules.len(),
            ..LoadStats::default()
        };

        for rule in rules {
            tracing::trace!(rule = %rule.uuid, "Loading rule");
            if rule.entity != EntityScope::Stage {
                tracing::debug!(rule = %rule.uuid, scope = %rule.entity, "Skipping rule outside the stage scope");
                stats.out_of_scope += 1;
                continue;
            }

            let mut vars = context.variables();
            if !preconditions_hold(evaluator.as_ref(), &rule, &mut vars, policy) {
                stats.excluded += 1;
                continue;
            }
            registry.insert(CompiledRule::new(rule));
            stats.accepted += 1;
        }

        tracing::info!("Loaded diagnostic engine with {} rules", stats.accepted);
        Self {
            registry,
            evaluator,
            stats,
        }
    }

    /// Compiled stage rules, in declaration order.
    pub fn rules(&self) -> &[CompiledRule] {
        self.registry.rules(EntityScope::Stage)
    }

    pub fn registry(&self) -> &ScopeRegistry {
        &self.registry
    }

    pub fn stats(&self) -> LoadStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.rules().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules().is_empty()
    }

    /// Diagnose a stage failure reported as an error value.
    pub fn on_stage_error(
        &self,
        stage: &StageContext<'_>,
        error: &(dyn Error + 'static),
    ) -> Vec<DiagnosticMessage> {
        self.on_stage(stage, &FailureDescription::from_error(error))
    }

    /// Diagnose a stage failure reported as an error code with arguments.
    pub fn on_stage_code(
        &self,
        stage: &StageContext<'_>,
        code: &dyn ErrorCode,
        args: &[Value],
    ) -> Vec<DiagnosticMessage> {
        self.on_stage(stage, &FailureDescription::from_code(code, args))
    }

    /// Diagnose a stage failure reported as a bare message.
    pub fn on_stage_message(&self, stage: &StageContext<'_>, message: &str) -> Vec<DiagnosticMessage> {
        self.on_stage(stage, &FailureDescription::from_message(message))
    }

    fn on_stage(&self, stage: &StageContext<'_>, failure: &FailureDescription) -> Vec<DiagnosticMessage> {
        let mut vars = failure.seed(stage.seed(ContextBuilder::new())).build();

        let mut messages = Vec::new();
        for rule in self.rules() {
            vars.reset_free();
            if !self.conditions_match(rule, &mut vars) {
                tracing::trace!(rule = rule.uuid(), "Rule did not match");
                continue;
            }
            tracing::trace!(rule = rule.uuid(), "Rule matched");
            if let Some(message) = self.render(rule, &mut vars) {
                messages.push(message);
            }
        }
        messages
    }

    fn conditions_match(&self, rule: &CompiledRule, vars: &mut Variables) -> bool {
        for condition in rule.conditions() {
            match self.evaluator.eval_bool(condition, vars) {
                Ok(true) => {}
                Ok(false) => return false,
                Err(e) => {
                    tracing::error!(rule = rule.uuid(), condition = %condition, error = %e, "Failed to evaluate rule condition");
                    return false;
                }
            }
        }
        true
    }

    fn render(&self, rule: &CompiledRule, vars: &mut Variables) -> Option<DiagnosticMessage> {
        let template = rule.message();
        let summary = self.evaluator.eval_template(&template.summary, vars);
        let description = self.evaluator.eval_template(&template.description, vars);
        match (summary, description) {
            (Ok(summary), Ok(description)) => Some(DiagnosticMessage {
                summary,
                description,
            }),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!(rule = rule.uuid(), error = %e, "Failed to evaluate rule message");
                None
            }
        }
    }
}

impl fmt::Debug for DoctorEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DoctorEngine")
            .field("registry", &self.registry)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

fn preconditions_hold(
    evaluator: &dyn Evaluator,
    rule: &RuleDefinition,
    vars: &mut Variables,
    policy: PreconditionPolicy,
) -> bool {
    for precondition in &rule.preconditions {
        tracing::trace!(rule = %rule.uuid, precondition = %precondition, "Evaluating precondition");
        let failure = match evaluator.eval_bool(precondition, vars) {
            Ok(true) => continue,
            Ok(false) => None,
            Err(e) => Some(e),
        };
        match (&failure, policy) {
            (None, PreconditionPolicy::Enforce) => {
                tracing::debug!(rule = %rule.uuid, precondition = %precondition, "Precondition failed; excluding rule");
                return false;
            }
            (Some(e), PreconditionPolicy::Enforce) => {
                tracing::error!(rule = %rule.uuid, precondition = %precondition, error = %e, "Precondition failed; excluding rule");
                return false;
            }
            (_, PreconditionPolicy::Lenient) => {
                tracing::debug!(rule = %rule.uuid, precondition = %precondition, "Precondition failed; ignored under lenient policy");
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BuildInfo;
    use conduit_types::{StageConfiguration, StageDefinition, StageKind};
    use serde_json::json;

    fn context() -> DoctorContext {
        DoctorContext::new(BuildInfo::new("5.2.0"))
    }

    fn stage() -> (StageDefinition, StageConfiguration) {
        (
            StageDefinition::new("jdbc", "query", "3", StageKind::Source),
            StageConfiguration::new("q1", "jdbc", "query", "3").with_config("table", json!("orders")),
        )
    }

    fn diagnose(engine: &DoctorEngine, message: &str) -> Vec<DiagnosticMessage> {
        let (definition, configuration) = stage();
        engine.on_stage_message(&StageContext::new(&definition, &configuration), message)
    }

    fn summaries(messages: &[DiagnosticMessage]) -> Vec<&str> {
        messages.iter().map(|m| m.summary.as_str()).collect()
    }

    #[test]
    fn always_matching_rule_yields_one_message() {
        let engine = DoctorEngine::new(
            &context(),
            vec![RuleDefinition::stage("r1", "Always matches").with_condition("1==1")],
            PreconditionPolicy::Enforce,
        );
        assert_eq!(summaries(&diagnose(&engine, "anything")), vec!["Always matches"]);
    }

    #[test]
    fn only_the_matching_rule_contributes() {
        let engine = DoctorEngine::new(
            &context(),
            vec![
                RuleDefinition::stage("r1", "First").with_condition("false"),
                RuleDefinition::stage("r2", "Second"),
            ],
            PreconditionPolicy::Enforce,
        );
        assert_eq!(summaries(&diagnose(&engine, "boom")), vec!["Second"]);
    }

    #[test]
    fn duplicates_are_kept() {
        let engine = DoctorEngine::new(
            &context(),
            vec![RuleDefinition::stage("a", "Dup"), RuleDefinition::stage("b", "Dup")],
            PreconditionPolicy::Enforce,
        );
        assert_eq!(summaries(&diagnose(&engine, "x")), vec!["Dup", "Dup"]);
    }

    #[test]
    fn templates_see_issue_and_stage() {
        let engine = DoctorEngine::new(
            &context(),
            vec![RuleDefinition::stage("r1", "Table ${stage.config.table} is locked")
                .with_condition("str:contains(issue.message, 'lock')")
                .with_description("Stage ${stage.definition.name} reported: ${issue.message}")],
            PreconditionPolicy::Enforce,
        );
        let messages = diagnose(&engine, "table lock timeout");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].summary, "Table orders is locked");
        assert_eq!(messages[0].description, "Stage query reported: table lock timeout");
        assert!(diagnose(&engine, "connection refused").is_empty());
    }

    #[test]
    fn condition_error_only_disqualifies_its_rule() {
        let engine = DoctorEngine::new(
            &context(),
            vec![
                RuleDefinition::stage("bad", "Never").with_condition("nope:missing()"),
                RuleDefinition::stage("bad-template", "${1 +}"),
                RuleDefinition::stage("good", "Still here"),
            ],
            PreconditionPolicy::Enforce,
        );
        assert_eq!(summaries(&diagnose(&engine, "x")), vec!["Still here"]);
    }

    #[test]
    fn arithmetic_overflow_only_disqualifies_its_rule() {
        let engine = DoctorEngine::new(
            &context(),
            vec![
                RuleDefinition::stage("overflow", "Never").with_condition("(-9223372036854775807 - 1) % -1 == 0"),
                RuleDefinition::stage("good", "Still here"),
            ],
            PreconditionPolicy::Enforce,
        );
        assert_eq!(summaries(&diagnose(&engine, "x")), vec!["Still here"]);
    }

    #[test]
    fn custom_evaluator_is_used_for_preconditions_and_conditions() {
        struct Refusing;
        impl Evaluator for Refusing {
            fn eval_value(&self, _: &str, _: &mut Variables) -> conduit_types::Result<Value> {
                Ok(Value::Null)
            }
            fn eval_bool(&self, _: &str, _: &mut Variables) -> conduit_types::Result<bool> {
                Ok(false)
            }
            fn eval_template(&self, template: &str, _: &mut Variables) -> conduit_types::Result<String> {
                Ok(template.to_string())
            }
            fn check_template(&self, _: &str) -> conduit_types::Result<()> {
                Ok(())
            }
        }

        let engine = DoctorEngine::with_evaluator(
            &context(),
            vec![
                RuleDefinition::stage("gated", "Gated").with_precondition("true"),
                RuleDefinition::stage("conditional", "Conditional").with_condition("true"),
                RuleDefinition::stage("plain", "Plain ${text}"),
            ],
            PreconditionPolicy::Enforce,
            Arc::new(Refusing),
        );
        assert_eq!(engine.stats().excluded, 1);
        assert_eq!(summaries(&diagnose(&engine, "x")), vec!["Plain ${text}"]);
    }

    #[test]
    fn out_of_scope_rules_are_dropped() {
        let engine = DoctorEngine::new(
            &context(),
            vec![
                RuleDefinition::new("p", EntityScope::Pipeline, "Pipeline"),
                RuleDefinition::new("u", EntityScope::Unknown, "Unknown"),
                RuleDefinition::stage("s", "Stage"),
            ],
            PreconditionPolicy::Enforce,
        );
        assert_eq!(engine.len(), 1);
        assert_eq!(engine.stats().out_of_scope, 2);
        assert_eq!(summaries(&diagnose(&engine, "x")), vec!["Stage"]);
    }

    #[test]
    fn enforce_policy_excludes_rules_with_failing_preconditions() {
        let rules = vec![
            RuleDefinition::stage("old", "Old").with_precondition("version:isAtLeast(build.version, '6.0')"),
            RuleDefinition::stage("err", "Err").with_precondition("${1 / 'x'}"),
            RuleDefinition::stage("new", "New").with_precondition("version:isAtLeast(build.version, '5.0')"),
        ];
        let engine = DoctorEngine::new(&context(), rules, PreconditionPolicy::Enforce);
        assert_eq!(summaries(&diagnose(&engine, "x")), vec!["New"]);
        assert_eq!(engine.stats().excluded, 2);
    }

    #[test]
    fn lenient_policy_keeps_rules_with_failing_preconditions() {
        let rules = vec![
            RuleDefinition::stage("old", "Old").with_precondition("false"),
            RuleDefinition::stage("err", "Err").with_precondition("${1 / 'x'}"),
        ];
        let engine = DoctorEngine::new(&context(), rules, PreconditionPolicy::Lenient);
        assert_eq!(summaries(&diagnose(&engine, "x")), vec!["Old", "Err"]);
        assert_eq!(engine.stats().excluded, 0);
    }

    #[test]
    fn free_variables_do_not_leak_between_rules() {
        let engine = DoctorEngine::new(
            &context(),
            vec![
                RuleDefinition::stage("set", "Set")
                    .with_condition("var:set('seen', true)"),
                RuleDefinition::stage("check", "Leaked").with_condition("var:has('seen')"),
            ],
            PreconditionPolicy::Enforce,
        );
        assert_eq!(summaries(&diagnose(&engine, "x")), vec!["Set"]);
    }

    #[test]
    fn repeated_calls_are_deterministic() {
        let engine = DoctorEngine::new(
            &context(),
            vec![
                RuleDefinition::stage("a", "A ${issue.message}"),
                RuleDefinition::stage("b", "B").with_condition("issue.kind == 'message'"),
            ],
            PreconditionPolicy::Enforce,
        );
        let first = diagnose(&engine, "m");
        for _ in 0..5 {
            assert_eq!(diagnose(&engine, "m"), first);
        }
    }

    #[test]
    fn error_codes_expose_code_and_args() {
        let engine = DoctorEngine::new(
            &context(),
            vec![RuleDefinition::stage("code", "Check host ${issue.args[0]}")
                .with_condition("issue.error_code == 'JDBC_06'")],
            PreconditionPolicy::Enforce,
        );
        let (definition, configuration) = stage();
        let code = conduit_types::Issue::pipeline("JDBC_06", "Failed to connect to {}");
        let messages = engine.on_stage_code(
            &StageContext::new(&definition, &configuration),
            &code,
            &[Value::from("db.local")],
        );
        assert_eq!(summaries(&messages), vec!["Check host db.local"]);
    }

    #[test]
    fn engine_is_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<DoctorEngine>();
    }
}
