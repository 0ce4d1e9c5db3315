//! Engine error taxonomy.

use thiserror::Error;

/// Everything that can go wrong while constructing or driving a workflow.
///
/// Routing errors surface at step readiness, scatter errors at dispatch, and
/// `Validation`/`FeatureNotDeclared` at workflow construction. Collaborator
/// failures (expression engine, filesystem) pass through the last two
/// variants.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("connected source '{source_name}' on parameter '{sink}' does not exist")]
    UnknownSource { source_name: String, sink: String },

    #[error("type mismatch between source '{source_name}' ({source_type}) and sink '{sink}' ({sink_type})")]
    TypeMismatch {
        source_name: String,
        source_type: String,
        sink: String,
        sink_type: String,
    },

    #[error("workflow contains multiple inbound links to parameter '{sink}' but MultipleInputFeatureRequirement is not declared")]
    MultipleInputsUnsupported { sink: String },

    #[error("value for '{0}' not specified")]
    MissingValue(String),

    #[error("all sources for '{0}' are null")]
    AllNull(String),

    #[error("expected only one source for '{sink}' to be non-null, got {observed}")]
    MultipleNonNull { sink: String, observed: String },

    #[error("unrecognized linkMerge policy '{0}'")]
    UnknownLinkMerge(String),

    #[error("conditional 'when' must evaluate to 'true' or 'false', got {0}")]
    ConditionalTypeError(String),

    #[error("must specify scatterMethod when scattering over multiple inputs")]
    ScatterMethodRequired,

    #[error("scatter parameter '{key}' does not correspond to an input parameter of step '{step}'")]
    ScatterKeyUnknown { key: String, step: String },

    #[error("length of input arrays must be equal when performing dotproduct scatter")]
    ScatterLengthMismatch,

    #[error("workflow uses {feature} but it is not declared in requirements")]
    FeatureNotDeclared { feature: String },

    #[error("workflow input '{0}' has no binding and no default value")]
    MissingWorkflowInput(String),

    #[error("invalid workflow definition: {0}")]
    Validation(String),

    #[error("expression evaluation failed: {0}")]
    Expression(String),

    #[error("filesystem access failed: {0}")]
    Io(#[from] std::io::Error),
}
