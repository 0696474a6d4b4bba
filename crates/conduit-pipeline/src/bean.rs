//! Stage wrapper owning one instantiated plugin and its isolation handle.

use std::sync::Arc;

use conduit_el::Evaluator;
use conduit_types::config::JsonMap;
use conduit_types::{Issue, Result, StageConfiguration, StageDefinition, StageSystemConfig};

use crate::library::{LoadedStage, ReleaseHandle};
use crate::stage::{InitContext, Stage};

/// One stage instance of a running pipeline.
///
/// Created at init, consumed exactly once at teardown by
/// [`StageBean::release_isolation`].
pub struct StageBean {
    definition: StageDefinition,
    configuration: StageConfiguration,
    system: StageSystemConfig,
    stage: Box<dyn Stage>,
    release: ReleaseHandle,
    initialized: bool,
}

impl StageBean {
    pub fn new(
        loaded: LoadedStage,
        configuration: StageConfiguration,
        system: StageSystemConfig,
    ) -> Self {
        Self {
            definition: loaded.definition,
            configuration,
            system,
            stage: loaded.stage,
            release: loaded.release,
            initialized: false,
        }
    }

    pub fn instance_name(&self) -> &str {
        &self.configuration.instance_name
    }

    pub fn definition(&self) -> &StageDefinition {
        &self.definition
    }

    pub fn configuration(&self) -> &StageConfiguration {
        &self.configuration
    }

    pub fn system_configs(&self) -> &StageSystemConfig {
        &self.system
    }

    pub fn stage(&self) -> &dyn Stage {
        self.stage.as_ref()
    }

    pub fn stage_mut(&mut self) -> &mut dyn Stage {
        self.stage.as_mut()
    }

    /// Run `Stage::init`. Teardown owes a `destroy` from here on, even if
    /// init reported issues.
    pub(crate) fn init_stage(&mut self, constants: &JsonMap, evaluator: Arc<dyn Evaluator>) -> Vec<Issue> {
        let ctx = InitContext {
            definition: &self.definition,
            configuration: &self.configuration,
            system: &self.system,
            constants,
            evaluator,
        };
        self.initialized = true;
        self.stage.init(&ctx)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Call `Stage::destroy` if `init` was reached.
    pub(crate) fn destroy_stage(&mut self) {
        if std::mem::take(&mut self.initialized) {
            self.stage.destroy();
        }
    }

    /// Free the isolation context. Consumes the bean.
    pub fn release_isolation(self) -> Result<()> {
        let Self { stage, release, .. } = self;
        drop(stage);
        release.release()
    }
}

impl std::fmt::Debug for StageBean {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageBean")
            .field("instance_name", &self.configuration.instance_name)
            .field("definition", &self.definition.qualified_name())
            .field("initialized", &self.initialized)
            .finish()
    }
}
