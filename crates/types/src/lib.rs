//! # Conflux Shared Types
//!
//! Strongly typed schema definitions for the conflux workflow engine. The
//! structures here describe a parsed and validated workflow document — the
//! engine crate consumes them; it never parses documents itself.
//!
//! The schema preserves authoring order (via [`indexmap::IndexMap`] where
//! field order matters) so downstream surfaces can render parameters and
//! steps in a predictable sequence.

pub mod workflow;

pub use workflow::compat::can_assign;
pub use workflow::{
    CompoundType, LinkMerge, Parameter, PickValue, Requirement, RunTarget, ScatterMethod, SchemaType, StepDefinition,
    WorkflowDefinition, features, has_requirement,
};
