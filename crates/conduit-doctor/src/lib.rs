//! Rule-based diagnostics for stage failures.
//!
//! Rules are compiled once into a [`DoctorEngine`]; each stage failure is
//! then matched against every compiled rule in declaration order, producing
//! zero or more [`DiagnosticMessage`]s.

pub mod context;
pub mod engine;
pub mod loader;
pub mod rule;

pub use context::{BuildInfo, DoctorContext, ErrorCode, StageContext};
pub use engine::{DiagnosticMessage, DoctorEngine, LoadStats, PreconditionPolicy};
pub use loader::{load_rules_from_dir, load_rules_from_path, load_rules_from_str};
pub use rule::{CompiledRule, EntityScope, MessageTemplate, RuleDefinition, ScopeRegistry};
