//! Workflow schema definitions.
//!
//! A workflow document arrives at the engine as a [`WorkflowDefinition`]: a
//! directed acyclic graph of [`StepDefinition`]s wired together by parameter
//! ids. Every I/O port is a [`Parameter`] carrying a declared [`SchemaType`]
//! plus optional transport directives (sources, link-merge, pick-value, a
//! `valueFrom` expression). Type compatibility between connected ports lives
//! in [`compat`].

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod compat;

/// Declared type of a workflow or step parameter.
///
/// Union types are plain lists of alternatives; `"Any"` is the wildcard name
/// and `"null"` the unit name, matching the authoring language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SchemaType {
    /// Primitive or named type: `"int"`, `"string"`, `"File"`, `"Any"`, `"null"`.
    Name(String),
    /// Union of alternatives; a value conforms when any arm conforms.
    Union(Vec<SchemaType>),
    /// Array or record descriptor.
    Compound(CompoundType),
}

/// Structured type descriptors, tagged the way the authoring language tags them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CompoundType {
    /// Homogeneous array of `items`.
    Array {
        /// Element type.
        items: Box<SchemaType>,
    },
    /// Record with named, typed fields in authoring order.
    Record {
        /// Field name to field type.
        fields: IndexMap<String, SchemaType>,
    },
}

impl SchemaType {
    /// Named type shorthand.
    pub fn name(name: impl Into<String>) -> Self {
        SchemaType::Name(name.into())
    }

    /// Array-of-`items` shorthand.
    pub fn array(items: SchemaType) -> Self {
        SchemaType::Compound(CompoundType::Array { items: Box::new(items) })
    }

    /// Returns true for the `"Any"` wildcard.
    pub fn is_any(&self) -> bool {
        matches!(self, SchemaType::Name(name) if name == "Any")
    }

    /// Returns true when this type admits a null value (the `"null"` name or
    /// a union with a `"null"` arm).
    pub fn is_nullable(&self) -> bool {
        match self {
            SchemaType::Name(name) => name == "null",
            SchemaType::Union(arms) => arms.iter().any(SchemaType::is_nullable),
            SchemaType::Compound(_) => false,
        }
    }

    /// Wraps this type in one array level, as scatter declarations do.
    pub fn wrapped_in_array(&self) -> Self {
        SchemaType::array(self.clone())
    }
}

impl Default for SchemaType {
    fn default() -> Self {
        SchemaType::Name("Any".to_string())
    }
}

/// Policy for combining multiple inbound links into one sink binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkMerge {
    /// Each source contributes one element to the merged list.
    MergeNested,
    /// Array-valued sources are spliced into the merged list; scalars append.
    MergeFlattened,
}

/// Post-merge null-filtering policy for a sink binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PickValue {
    /// Bind the first non-null element; all-null is an error.
    FirstNonNull,
    /// Bind the only non-null element; zero or several is an error.
    OnlyNonNull,
    /// Bind the list with nulls removed.
    AllNonNull,
}

/// Combinator used when a step scatters over more than one input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScatterMethod {
    /// Pairwise over equal-length arrays.
    #[serde(rename = "dotproduct")]
    DotProduct,
    /// Full cross-product with one output nesting level per axis.
    #[serde(rename = "nested_crossproduct")]
    NestedCrossProduct,
    /// Full cross-product flattened into a single output level.
    #[serde(rename = "flat_crossproduct")]
    FlatCrossProduct,
}

/// A named, typed workflow or step I/O port.
///
/// `source`/`output_source` name the upstream ids this sink reads from;
/// which list applies depends on whether the parameter is a step input or a
/// workflow output. The `not_connected`/`used_by_step` markers are internal:
/// they flag step sinks with no corresponding embedded-process parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    /// Fully qualified parameter id, e.g. `"main/step1/threshold"`.
    pub id: String,
    /// Declared type.
    #[serde(rename = "type", default)]
    pub schema: SchemaType,
    /// Value bound when no source produces one.
    #[serde(default)]
    pub default: Option<Value>,
    /// Upstream ids feeding a step input.
    #[serde(default)]
    pub source: Vec<String>,
    /// Upstream ids feeding a workflow output.
    #[serde(default)]
    pub output_source: Vec<String>,
    /// How multiple sources combine.
    #[serde(default)]
    pub link_merge: Option<LinkMerge>,
    /// Post-merge null filter.
    #[serde(default)]
    pub pick_value: Option<PickValue>,
    /// Expression applied to the bound value after merging.
    #[serde(default)]
    pub value_from: Option<String>,
    /// Request the leading bytes of a File value be pre-loaded.
    #[serde(default)]
    pub load_contents: bool,
    /// Sink has no matching parameter on the embedded process.
    #[serde(default)]
    pub not_connected: bool,
    /// Unconnected sink is still referenced by a `valueFrom`/`when` text.
    #[serde(default)]
    pub used_by_step: bool,
}

impl Parameter {
    /// A parameter with the given id and type and no transport directives.
    pub fn new(id: impl Into<String>, schema: SchemaType) -> Self {
        Self {
            id: id.into(),
            schema,
            ..Default::default()
        }
    }

    /// Single upstream source shorthand.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source.push(source.into());
        self
    }
}

impl Default for Parameter {
    fn default() -> Self {
        Self {
            id: String::new(),
            schema: SchemaType::default(),
            default: None,
            source: Vec::new(),
            output_source: Vec::new(),
            link_merge: None,
            pick_value: None,
            value_from: None,
            load_contents: false,
            not_connected: false,
            used_by_step: false,
        }
    }
}

/// A declared workflow requirement.
///
/// The engine only interprets the feature classes in [`features`]; anything
/// else is carried opaquely for the expression evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    /// Requirement class name, e.g. `"ScatterFeatureRequirement"`.
    pub class: String,
    /// Class-specific payload, opaque to the engine.
    #[serde(default)]
    pub payload: Value,
}

impl Requirement {
    /// A payload-free requirement of the given class.
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            payload: Value::Null,
        }
    }
}

/// Feature-requirement class names the engine gates on.
pub mod features {
    /// Enables more than one source per sink.
    pub const MULTIPLE_INPUT: &str = "MultipleInputFeatureRequirement";
    /// Enables `valueFrom` on step inputs.
    pub const STEP_INPUT_EXPRESSION: &str = "StepInputExpressionRequirement";
    /// Enables nested workflow steps.
    pub const SUBWORKFLOW: &str = "SubworkflowFeatureRequirement";
    /// Enables `scatter`.
    pub const SCATTER: &str = "ScatterFeatureRequirement";
}

/// Returns true when `class` appears in the requirement list.
pub fn has_requirement(requirements: &[Requirement], class: &str) -> bool {
    requirements.iter().any(|requirement| requirement.class == class)
}

/// What a step runs: an external process reference or an inline sub-workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunTarget {
    /// Reference resolved through the process loader.
    Reference(String),
    /// Nested workflow embedded in the document.
    Inline(Box<WorkflowDefinition>),
}

/// One node of the workflow graph, binding an inner process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Fully qualified step id, e.g. `"main/align"`.
    pub id: String,
    /// The inner process.
    pub run: RunTarget,
    /// Sink parameters wiring upstream state into the process.
    #[serde(rename = "in", default)]
    pub inputs: Vec<Parameter>,
    /// Short names of embedded-process outputs this step exposes.
    #[serde(rename = "out", default)]
    pub outputs: Vec<String>,
    /// Step-local requirements, merged over the workflow's.
    #[serde(default)]
    pub requirements: Vec<Requirement>,
    /// Input ids to fan out over, one shard per element.
    #[serde(default)]
    pub scatter: Vec<String>,
    /// Combinator when more than one axis is scattered.
    #[serde(default)]
    pub scatter_method: Option<ScatterMethod>,
    /// Boolean expression gating execution.
    #[serde(default)]
    pub when: Option<String>,
}

/// A complete parsed workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Fully qualified workflow id.
    pub id: String,
    /// Workflow input parameters.
    #[serde(default)]
    pub inputs: Vec<Parameter>,
    /// Workflow output parameters; their `output_source` lists name the
    /// step outputs they collect.
    #[serde(default)]
    pub outputs: Vec<Parameter>,
    /// Steps in authoring order. Execution order is data-driven.
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
    /// Declared requirements, inherited by every step.
    #[serde(default)]
    pub requirements: Vec<Requirement>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn schema_type_round_trips_through_json() {
        let schema = SchemaType::Union(vec![
            SchemaType::name("null"),
            SchemaType::array(SchemaType::name("int")),
        ]);

        let encoded = serde_json::to_value(&schema).expect("serialize schema");
        assert_eq!(encoded, json!(["null", {"type": "array", "items": "int"}]));

        let decoded: SchemaType = serde_json::from_value(encoded).expect("deserialize schema");
        assert_eq!(decoded, schema);
    }

    #[test]
    fn scatter_method_uses_authoring_names() {
        let encoded = serde_json::to_value(ScatterMethod::NestedCrossProduct).expect("serialize");
        assert_eq!(encoded, json!("nested_crossproduct"));
        let encoded = serde_json::to_value(ScatterMethod::DotProduct).expect("serialize");
        assert_eq!(encoded, json!("dotproduct"));
    }

    #[test]
    fn nullable_detection_sees_union_arms() {
        assert!(SchemaType::name("null").is_nullable());
        assert!(SchemaType::Union(vec![SchemaType::name("null"), SchemaType::name("File")]).is_nullable());
        assert!(!SchemaType::array(SchemaType::name("null")).is_nullable());
    }

    #[test]
    fn requirement_lookup_matches_by_class() {
        let requirements = vec![Requirement::new(features::SCATTER)];
        assert!(has_requirement(&requirements, features::SCATTER));
        assert!(!has_requirement(&requirements, features::SUBWORKFLOW));
    }

    #[test]
    fn parameter_defaults_leave_markers_clear() {
        let parameter = Parameter::new("wf/x", SchemaType::name("int")).with_source("wf/source/x");
        assert_eq!(parameter.source, vec!["wf/source/x"]);
        assert!(!parameter.not_connected);
        assert!(!parameter.load_contents);
    }
}
