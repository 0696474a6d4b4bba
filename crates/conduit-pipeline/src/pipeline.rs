//! Pipeline lifecycle orchestrator.
//!
//! A [`Pipeline`] walks one configuration through its lifecycle:
//! validate, init, run and destroy. Every stage instance created at init is
//! owned by a [`StageBean`] and released exactly once at teardown, including
//! when init reports issues, the run fails, or the pipeline is dropped early.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use conduit_el::Evaluator;
use conduit_types::{
    ConduitError, Issue, PipelineConfiguration, Result, StageConfiguration, StageSystemConfig,
};

use crate::bean::StageBean;
use crate::events::{EventEmitter, PipelineEvent};
use crate::library::{LibraryLoader, StageLibrary, StageLoader};
use crate::runner::{PipelineRunner, RunContext, StageOverrides};
use crate::stage::{record_evaluator, CONFIG_EVAL_ERROR};
use crate::telemetry::{MetricsRegistry, Telemetry};
use crate::validation::validate;

/// Issue code: the pipeline is not in a state that allows the operation.
pub const INVALID_STATE: &str = "CONTAINER_0100";
/// Issue code: a stage could not be instantiated.
pub const STAGE_LOAD_FAILED: &str = "CONTAINER_0101";
/// Issue code: a stage isolation context could not be released.
pub const RELEASE_FAILED: &str = "CONTAINER_0102";
/// Issue code: a stage panicked while being destroyed.
pub const DESTROY_FAILED: &str = "CONTAINER_0103";

pub const DEFAULT_BATCH_SIZE: usize = 1000;

// ---------------------------------------------------------------------------
// PipelineState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Unvalidated,
    Validated,
    Initialized,
    Running,
    Finished,
    Failed,
    Destroyed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Unvalidated => "unvalidated",
            PipelineState::Validated => "validated",
            PipelineState::Initialized => "initialized",
            PipelineState::Running => "running",
            PipelineState::Finished => "finished",
            PipelineState::Failed => "failed",
            PipelineState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// CancelToken / PipelineOptions
// ---------------------------------------------------------------------------

/// Shared flag checked by the runner before each stage.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Run-time knobs of a pipeline.
#[derive(Clone)]
pub struct PipelineOptions {
    pub cancel: CancelToken,
    /// Maximum records a source produces per batch; 0 means unbounded.
    pub batch_size: usize,
    pub telemetry: Arc<dyn Telemetry>,
    pub events: EventEmitter,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            cancel: CancelToken::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            telemetry: Arc::new(MetricsRegistry::new()),
            events: EventEmitter::default(),
        }
    }
}

impl PipelineOptions {
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }
}

impl fmt::Debug for PipelineOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineOptions")
            .field("cancel", &self.cancel)
            .field("batch_size", &self.batch_size)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct Pipeline {
    config: PipelineConfiguration,
    library: Arc<StageLibrary>,
    loader: Arc<dyn StageLoader>,
    evaluator: Arc<dyn Evaluator>,
    beans: Vec<StageBean>,
    error_bean: Option<StageBean>,
    state: PipelineState,
    runner: PipelineRunner,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfiguration,
        library: Arc<StageLibrary>,
        loader: Arc<dyn StageLoader>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            config,
            library,
            loader,
            evaluator: Arc::new(record_evaluator()),
            beans: Vec::new(),
            error_bean: None,
            state: PipelineState::Unvalidated,
            runner: PipelineRunner::new(),
            options,
        }
    }

    /// Pipeline loading stages straight from `library`, with default options.
    pub fn with_library(config: PipelineConfiguration, library: Arc<StageLibrary>) -> Self {
        let loader = Arc::new(LibraryLoader::new(Arc::clone(&library)));
        Self::new(config, library, loader, PipelineOptions::default())
    }

    /// Replace the evaluator used for stage configs and record preconditions.
    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Check the configuration document without instantiating any stage.
    ///
    /// Records the outcome on the configuration; callable in any state.
    pub fn validate_configs(&mut self) -> Vec<Issue> {
        let report = validate(&self.config, &self.library);
        let clean = !report.issues.has_errors();
        self.config
            .set_validation(report.issues.clone(), report.previewable);
        if clean && self.state == PipelineState::Unvalidated {
            self.transition(PipelineState::Validated);
        }
        report.issues.into_vec()
    }

    /// Instantiate and initialize every stage, error stage last.
    ///
    /// Problems come back as issues. Stages created before a failure are kept
    /// so that [`Pipeline::destroy`] releases them.
    pub fn init(&mut self) -> Vec<Issue> {
        if !matches!(
            self.state,
            PipelineState::Unvalidated | PipelineState::Validated
        ) {
            return vec![Issue::pipeline(
                INVALID_STATE,
                format!("cannot initialize a pipeline that is {}", self.state),
            )];
        }

        let mut issues = Vec::new();
        for conf in self.config.stages() {
            if let Some(bean) = load_bean(self.loader.as_ref(), conf, &mut issues) {
                self.beans.push(bean);
            }
        }
        if let Some(conf) = self.config.error_stage() {
            self.error_bean = load_bean(self.loader.as_ref(), conf, &mut issues);
        }

        let constants = self.config.constants();
        for bean in self.beans.iter_mut().chain(self.error_bean.as_mut()) {
            let found = bean.init_stage(constants, Arc::clone(&self.evaluator));
            if !found.is_empty() {
                tracing::debug!(stage = bean.instance_name(), count = found.len(), "Stage init reported issues");
            }
            issues.extend(found);
        }

        self.options.events.emit(PipelineEvent::PipelineInitialized {
            pipeline_id: self.config.uuid(),
            stage_count: self.beans.len() + usize::from(self.error_bean.is_some()),
            issue_count: issues.len(),
        });
        if issues.is_empty() {
            self.transition(PipelineState::Initialized);
        } else {
            self.transition(PipelineState::Failed);
        }
        issues
    }

    /// Run every stage in order. Stages with an entry in `overrides` are not
    /// processed; their recorded output is used instead.
    pub fn run(&mut self, overrides: &StageOverrides) -> Result<()> {
        if self.state != PipelineState::Initialized {
            return Err(ConduitError::InvalidState {
                expected: PipelineState::Initialized.to_string(),
                actual: self.state.to_string(),
            });
        }
        self.transition(PipelineState::Running);

        let ctx = RunContext {
            options: &self.options,
            evaluator: self.evaluator.as_ref(),
            constants: self.config.constants(),
        };
        let result = self
            .runner
            .run(&ctx, &mut self.beans, self.error_bean.as_mut(), overrides);

        match &result {
            Ok(()) => {
                tracing::info!(
                    pipeline = %self.config.uuid(),
                    stages = self.runner.outputs().len(),
                    "Pipeline run finished"
                );
                self.transition(PipelineState::Finished);
            }
            Err(e) => {
                self.options.events.emit(PipelineEvent::PipelineFailed {
                    pipeline_id: self.config.uuid(),
                    error: e.to_string(),
                });
                self.transition(PipelineState::Failed);
            }
        }
        result
    }

    /// Destroy every stage and release its isolation context exactly once.
    ///
    /// Release failures are logged and returned as warnings. Calling this
    /// again is a no-op.
    pub fn destroy(&mut self) -> Vec<Issue> {
        let beans: Vec<StageBean> = self
            .beans
            .drain(..)
            .chain(self.error_bean.take())
            .collect();
        if beans.is_empty() && self.state == PipelineState::Destroyed {
            return vec![];
        }

        let released = beans.len();
        let mut warnings = Vec::new();
        for mut bean in beans {
            let instance_name = bean.instance_name().to_string();
            // a panicking plugin must not keep the remaining handles from being released
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| bean.destroy_stage())) {
                let message = panic_message(panic.as_ref());
                tracing::warn!(stage = %instance_name, error = %message, "Stage panicked while being destroyed");
                warnings.push(Issue::stage(&instance_name, DESTROY_FAILED, message).warning());
            }
            if let Err(e) = bean.release_isolation() {
                tracing::warn!(stage = %instance_name, error = %e, "Failed to release stage isolation context");
                warnings.push(Issue::stage(&instance_name, RELEASE_FAILED, e.to_string()).warning());
            }
        }

        self.options.events.emit(PipelineEvent::PipelineDestroyed {
            pipeline_id: self.config.uuid(),
            released,
            at: chrono::Utc::now(),
        });
        self.transition(PipelineState::Destroyed);
        warnings
    }

    fn transition(&mut self, to: PipelineState) {
        tracing::debug!(pipeline = %self.config.uuid(), from = %self.state, to = %to, "Pipeline state change");
        self.state = to;
    }

    // -- Accessors ----------------------------------------------------------

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn configuration(&self) -> &PipelineConfiguration {
        &self.config
    }

    pub fn library(&self) -> &Arc<StageLibrary> {
        &self.library
    }

    /// Stages currently owned by the pipeline, in execution order.
    pub fn beans(&self) -> &[StageBean] {
        &self.beans
    }

    pub fn error_bean(&self) -> Option<&StageBean> {
        self.error_bean.as_ref()
    }

    pub fn runner(&self) -> &PipelineRunner {
        &self.runner
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn telemetry(&self) -> &Arc<dyn Telemetry> {
        &self.options.telemetry
    }

    pub fn events(&self) -> &EventEmitter {
        &self.options.events
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.options.cancel
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if !self.beans.is_empty() || self.error_bean.is_some() {
            let _ = self.destroy();
        }
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("uuid", &self.config.uuid())
            .field("state", &self.state)
            .field("beans", &self.beans)
            .field("error_bean", &self.error_bean)
            .finish_non_exhaustive()
    }
}

fn load_bean(
    loader: &dyn StageLoader,
    conf: &StageConfiguration,
    issues: &mut Vec<Issue>,
) -> Option<StageBean> {
    let system = match StageSystemConfig::from_entries(&conf.instance_name, &conf.configuration) {
        Ok(system) => system,
        Err(e) => {
            issues.push(Issue::stage(&conf.instance_name, CONFIG_EVAL_ERROR, e.to_string()));
            StageSystemConfig::default()
        }
    };
    match loader.load(conf) {
        Ok(loaded) => Some(StageBean::new(loaded, conf.clone(), system)),
        Err(e) => {
            tracing::debug!(stage = %conf.instance_name, error = %e, "Stage load failed");
            issues.push(Issue::stage(&conf.instance_name, STAGE_LOAD_FAILED, e.to_string()));
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "stage panicked".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::{dev_library, DEV_LIBRARY, DEV_VERSION};
    use serde_json::json;
    use uuid::Uuid;

    fn dev(instance: &str, stage: &str) -> StageConfiguration {
        StageConfiguration::new(instance, DEV_LIBRARY, stage, DEV_VERSION)
    }

    fn config() -> PipelineConfiguration {
        PipelineConfiguration::new(
            Uuid::new_v4(),
            vec![
                dev("src", "raw_source").with_config("records", json!([{"a": 1}, {"a": 2}])),
                dev("out", "trash"),
            ],
        )
    }

    #[test]
    fn state_display_is_lowercase() {
        assert_eq!(PipelineState::Initialized.to_string(), "initialized");
        assert_eq!(PipelineState::Destroyed.to_string(), "destroyed");
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn full_lifecycle_walks_states() {
        let mut pipeline = Pipeline::with_library(config(), Arc::new(dev_library()));
        assert_eq!(pipeline.state(), PipelineState::Unvalidated);

        assert!(pipeline.validate_configs().is_empty());
        assert_eq!(pipeline.state(), PipelineState::Validated);
        assert!(pipeline.configuration().is_valid());

        assert!(pipeline.init().is_empty());
        assert_eq!(pipeline.state(), PipelineState::Initialized);
        assert_eq!(pipeline.beans().len(), 2);

        pipeline.run(&StageOverrides::default()).unwrap();
        assert_eq!(pipeline.state(), PipelineState::Finished);
        assert_eq!(pipeline.runner().output("src").unwrap().records.len(), 2);

        assert!(pipeline.destroy().is_empty());
        assert_eq!(pipeline.state(), PipelineState::Destroyed);
        assert!(pipeline.beans().is_empty());
    }

    #[test]
    fn run_requires_initialized_state() {
        let mut pipeline = Pipeline::with_library(config(), Arc::new(dev_library()));
        let err = pipeline.run(&StageOverrides::default()).unwrap_err();
        assert!(matches!(err, ConduitError::InvalidState { .. }));
    }

    #[test]
    fn init_twice_is_an_issue() {
        let mut pipeline = Pipeline::with_library(config(), Arc::new(dev_library()));
        assert!(pipeline.init().is_empty());
        let issues = pipeline.init();
        assert_eq!(issues[0].code, INVALID_STATE);
    }

    #[test]
    fn unknown_stage_is_reported_not_raised() {
        let config = PipelineConfiguration::new(
            Uuid::new_v4(),
            vec![dev("src", "missing"), dev("out", "trash")],
        );
        let mut pipeline = Pipeline::with_library(config, Arc::new(dev_library()));
        let issues = pipeline.init();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].code, STAGE_LOAD_FAILED);
        assert_eq!(pipeline.state(), PipelineState::Failed);
        // the stage that did load is still owned until teardown
        assert_eq!(pipeline.beans().len(), 1);
    }

    struct CountingEvaluator {
        inner: conduit_el::ElEvaluator,
        predicates: std::sync::atomic::AtomicUsize,
    }

    impl Evaluator for CountingEvaluator {
        fn eval_value(&self, expression: &str, vars: &mut conduit_el::Variables) -> Result<conduit_el::Value> {
            self.inner.eval_value(expression, vars)
        }

        fn eval_bool(&self, expression: &str, vars: &mut conduit_el::Variables) -> Result<bool> {
            self.predicates.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.inner.eval_bool(expression, vars)
        }

        fn eval_template(&self, template: &str, vars: &mut conduit_el::Variables) -> Result<String> {
            self.inner.eval_template(template, vars)
        }

        fn check_template(&self, template: &str) -> Result<()> {
            self.inner.check_template(template)
        }
    }

    #[test]
    fn record_preconditions_go_through_the_configured_evaluator() {
        let config = PipelineConfiguration::new(
            Uuid::new_v4(),
            vec![
                dev("src", "raw_source").with_config("records", json!([{"a": 1}, {"a": 2}])),
                dev("out", "trash").with_config(
                    conduit_types::config::RECORD_PRECONDITIONS_CONFIG,
                    json!(["${record:value('/a') > 0}"]),
                ),
            ],
        );
        let evaluator = Arc::new(CountingEvaluator {
            inner: record_evaluator(),
            predicates: Default::default(),
        });
        let mut pipeline = Pipeline::with_library(config, Arc::new(dev_library()))
            .with_evaluator(evaluator.clone());

        assert!(pipeline.init().is_empty());
        pipeline.run(&StageOverrides::default()).unwrap();
        assert_eq!(evaluator.predicates.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn destroy_is_idempotent() {
        let mut pipeline = Pipeline::with_library(config(), Arc::new(dev_library()));
        pipeline.init();
        pipeline.destroy();
        assert!(pipeline.destroy().is_empty());
        assert_eq!(pipeline.state(), PipelineState::Destroyed);
    }
}
