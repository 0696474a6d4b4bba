//! Pipeline lifecycle: stage plugins, configuration validation, the
//! orchestrator and runner, preview execution, events and telemetry.
//!
//! ```no_run
//! use std::sync::Arc;
//! use conduit_pipeline::{dev_library, Pipeline, StageOverrides};
//! use conduit_types::PipelineConfiguration;
//!
//! # fn main() -> conduit_types::Result<()> {
//! let config = PipelineConfiguration::from_path("pipeline.json")?;
//! let mut pipeline = Pipeline::with_library(config, Arc::new(dev_library()));
//! if pipeline.init().is_empty() {
//!     pipeline.run(&StageOverrides::default())?;
//! }
//! pipeline.destroy();
//! # Ok(())
//! # }
//! ```

pub mod bean;
pub mod events;
pub mod library;
pub mod pipeline;
pub mod preview;
pub mod runner;
pub mod stage;
pub mod stages;
pub mod telemetry;
pub mod validation;

pub use bean::StageBean;
pub use events::{EventEmitter, PipelineEvent};
pub use library::{
    IsolationTracker, LibraryLoader, LoadedStage, ReleaseHandle, StageFactory, StageLibrary,
    StageLoader,
};
pub use pipeline::{CancelToken, Pipeline, PipelineOptions, PipelineState};
pub use preview::{PreviewPipeline, PreviewPipelineOutput};
pub use runner::{PipelineRunner, StageOverrides};
pub use stage::{record_evaluator, record_variables, Batch, BatchOutput, InitContext, Stage};
pub use stages::{dev_library, register_dev_stages};
pub use telemetry::{MetricsRegistry, StageCounters, Telemetry};
pub use validation::{validate, validate_or_raise, ValidationReport, ValidationRule};
