//! Expression evaluator contract.
//!
//! The embedded expression sub-language is an external collaborator. The
//! engine hands it the short-named input view, the workflow's requirement
//! list, and a context value (`self` in the expression language), and takes
//! back an arbitrary JSON value.

use std::time::Duration;

use serde_json::Value;

use conflux_types::Requirement;

use crate::error::WorkflowError;
use crate::value::ValueMap;

/// Evaluation knobs forwarded from the runtime context.
#[derive(Debug, Clone, Default)]
pub struct EvalOptions {
    /// Emit evaluator-side debug output.
    pub debug: bool,
    /// Expose the evaluator's console stream.
    pub console: bool,
    /// Abort evaluation after this long.
    pub timeout: Option<Duration>,
}

/// External expression engine.
pub trait ExpressionEvaluator {
    /// Evaluates `expression` with the given inputs view and context value.
    fn eval(
        &self,
        expression: &str,
        inputs: &ValueMap,
        requirements: &[Requirement],
        context: Option<&Value>,
        options: &EvalOptions,
    ) -> Result<Value, WorkflowError>;
}
