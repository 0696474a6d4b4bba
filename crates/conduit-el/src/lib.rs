//! Expression language for Conduit stage configuration and diagnostic rules.
//!
//! Two evaluation modes share one grammar:
//! - bare expressions (`issue.error_code == 'JDBC_06' && !empty stage.config.table`)
//!   used for predicates, optionally wrapped as `${...}`;
//! - templates (`Table ${stage.config.table} is missing`) used for messages,
//!   where plain text renders as itself.
//!
//! # Example
//! ```
//! use conduit_el::{ContextBuilder, ElEvaluator, Evaluator};
//!
//! let mut vars = ContextBuilder::new().with("build.version", "3.2.1").build();
//! let el = ElEvaluator::new();
//! assert!(el.eval_bool("version:isAtLeast(build.version, '3.0')", &mut vars).unwrap());
//! assert_eq!(
//!     el.eval_template("running ${build.version}", &mut vars).unwrap(),
//!     "running 3.2.1"
//! );
//! ```

pub mod ast;
mod eval;
pub mod functions;
mod parser;
mod value;
mod variables;

pub use eval::{ElEvaluator, Evaluator};
pub use functions::{ElFunction, FunctionTable};
pub use parser::{parse_expression, parse_template};
pub use value::Value;
pub use variables::{ContextBuilder, Variables};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn evaluator_is_shareable_as_trait_object() {
        let el: Arc<dyn Evaluator> = Arc::new(ElEvaluator::new());
        let handle = {
            let el = Arc::clone(&el);
            std::thread::spawn(move || el.eval_bool("2 > 1", &mut Variables::new()))
        };
        assert!(handle.join().unwrap().unwrap());
    }

    #[test]
    fn parse_errors_report_position() {
        let err = parse_expression("a &&\n  ").unwrap_err();
        assert!(matches!(err, conduit_types::ConduitError::Parse { .. }));
    }
}
