//! Workflow steps.
//!
//! A [`WorkflowStep`] binds a step definition to its embedded process. At
//! construction it merges the step's sink list with the process's declared
//! parameters, validates the wiring, enforces feature requirements, and
//! rewrites parameter schemas for scatter. At run time it translates between
//! the workflow's fully qualified ids and the process's short names.

use std::fmt;
use std::rc::Rc;

use tracing::info;

use conflux_types::{Parameter, Requirement, RunTarget, ScatterMethod, SchemaType, StepDefinition, features, has_requirement};

use crate::context::{LoadingContext, RuntimeContext};
use crate::error::WorkflowError;
use crate::process::{JobSource, OutputCallback, Process};
use crate::state::ProcessStatus;
use crate::value::{ValueMap, shortname};
use crate::workflow::Workflow;

/// A node of the workflow graph, ready to dispatch.
pub struct WorkflowStep {
    id: String,
    name: String,
    inputs: Vec<Parameter>,
    outputs: Vec<Parameter>,
    requirements: Vec<Requirement>,
    scatter: Vec<String>,
    scatter_method: Option<ScatterMethod>,
    when: Option<String>,
    embedded: Rc<dyn Process>,
}

impl fmt::Debug for WorkflowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowStep").field("id", &self.id).field("name", &self.name).finish()
    }
}

impl WorkflowStep {
    /// Builds a step from its definition, resolving the run target and
    /// validating the wiring against the embedded process.
    pub fn new(definition: &StepDefinition, loading: &LoadingContext) -> Result<Self, WorkflowError> {
        let loading = loading.nested(&definition.requirements);

        let embedded: Rc<dyn Process> = match &definition.run {
            RunTarget::Inline(workflow) => {
                if !has_requirement(&loading.requirements, features::SUBWORKFLOW) {
                    return Err(WorkflowError::FeatureNotDeclared {
                        feature: features::SUBWORKFLOW.to_string(),
                    });
                }
                Rc::new(Workflow::new(workflow, &loading)?)
            }
            reference @ RunTarget::Reference(_) => {
                let factory = loading
                    .factory
                    .as_ref()
                    .ok_or_else(|| WorkflowError::Validation(format!("step '{}' has no process loader configured", definition.id)))?;
                factory.load(reference, &loading)?
            }
        };

        let (inputs, outputs) = merge_parameters(definition, embedded.as_ref())?;

        let mut step = Self {
            id: definition.id.clone(),
            name: format!("step {}", shortname(&definition.id)),
            inputs,
            outputs,
            requirements: loading.requirements,
            scatter: definition.scatter.clone(),
            scatter_method: definition.scatter_method,
            when: definition.when.clone(),
            embedded,
        };
        step.apply_scatter_schemas()?;
        Ok(step)
    }

    /// Display name, `step <short id>`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Scattered input ids, in declaration order.
    pub fn scatter(&self) -> &[String] {
        &self.scatter
    }

    /// Combinator; dot-product when unset over a single axis.
    pub fn scatter_method(&self) -> Option<ScatterMethod> {
        self.scatter_method
    }

    /// The `when` gate, if any.
    pub fn when(&self) -> Option<&str> {
        self.when.as_deref()
    }

    /// Rewrites declared schemas for scatter: scattered inputs become
    /// arrays, outputs wrap once per nesting level.
    fn apply_scatter_schemas(&mut self) -> Result<(), WorkflowError> {
        if self.scatter.is_empty() {
            return Ok(());
        }
        if !has_requirement(&self.requirements, features::SCATTER) {
            return Err(WorkflowError::FeatureNotDeclared {
                feature: features::SCATTER.to_string(),
            });
        }
        if self.scatter_method.is_none() && self.scatter.len() != 1 {
            return Err(WorkflowError::ScatterMethodRequired);
        }
        for key in &self.scatter {
            let input = self
                .inputs
                .iter_mut()
                .find(|parameter| parameter.id == *key)
                .ok_or_else(|| WorkflowError::ScatterKeyUnknown {
                    key: key.clone(),
                    step: self.id.clone(),
                })?;
            input.schema = input.schema.wrapped_in_array();
        }

        let nesting = if self.scatter_method == Some(ScatterMethod::NestedCrossProduct) {
            self.scatter.len()
        } else {
            1
        };
        for _ in 0..nesting {
            for output in &mut self.outputs {
                output.schema = output.schema.wrapped_in_array();
            }
        }
        Ok(())
    }
}

/// Merges the step's sink list and exposed outputs with the embedded
/// process's parameter lists, by short name.
fn merge_parameters(definition: &StepDefinition, embedded: &dyn Process) -> Result<(Vec<Parameter>, Vec<Parameter>), WorkflowError> {
    let mut inputs = Vec::with_capacity(definition.inputs.len());
    let mut bound = Vec::new();

    for sink in &definition.inputs {
        let mut parameter = sink.clone();
        let short = shortname(&sink.id);
        match embedded.inputs().iter().find(|tool| shortname(&tool.id) == short) {
            Some(tool) => {
                parameter.schema = tool.schema.clone();
                // A step-level default overrides the tool's.
                if parameter.default.is_none() {
                    parameter.default = tool.default.clone();
                }
                if !parameter.load_contents {
                    parameter.load_contents = tool.load_contents;
                }
                bound.push(short.to_string());
            }
            None => {
                parameter.schema = SchemaType::name("Any");
                parameter.not_connected = true;
                parameter.used_by_step = used_by_step(definition, short);
            }
        }
        inputs.push(parameter);
    }

    let mut outputs = Vec::with_capacity(definition.outputs.len());
    for out in &definition.outputs {
        let tool = embedded
            .outputs()
            .iter()
            .find(|tool| shortname(&tool.id) == out.as_str())
            .ok_or_else(|| {
                let known: Vec<&str> = embedded.outputs().iter().map(|tool| shortname(&tool.id)).collect();
                WorkflowError::Validation(format!(
                    "workflow step output '{out}' does not correspond to a tool output (expected one of '{}')",
                    known.join("', '")
                ))
            })?;
        let mut parameter = tool.clone();
        parameter.id = format!("{}/{out}", definition.id);
        outputs.push(parameter);
    }

    let mut missing = Vec::new();
    for tool in embedded.inputs() {
        let short = shortname(&tool.id);
        if !bound.iter().any(|name| name == short) && !tool.schema.is_nullable() && tool.default.is_none() {
            missing.push(short.to_string());
        }
    }
    if !missing.is_empty() {
        return Err(WorkflowError::Validation(format!(
            "step '{}' is missing required parameter(s) '{}'",
            definition.id,
            missing.join("', '")
        )));
    }

    Ok((inputs, outputs))
}

/// Whether an unconnected sink's short name is referenced from any
/// `valueFrom` or from the step's `when` text.
fn used_by_step(definition: &StepDefinition, short_input: &str) -> bool {
    let needle = format!("inputs.{short_input}");
    let in_value_from = definition
        .inputs
        .iter()
        .filter_map(|sink| sink.value_from.as_deref())
        .any(|expression| expression.contains(&needle));
    let in_when = definition.when.as_deref().is_some_and(|expression| expression.contains(&needle));
    in_value_from || in_when
}

impl Process for WorkflowStep {
    fn inputs(&self) -> &[Parameter] {
        &self.inputs
    }

    fn outputs(&self) -> &[Parameter] {
        &self.outputs
    }

    fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    fn job(&self, joborder: ValueMap, callback: OutputCallback, ctx: &RuntimeContext) -> Result<Box<dyn JobSource>, WorkflowError> {
        info!(step = %self.name, "start");
        let child_ctx = ctx.for_part(self.name.clone(), shortname(&self.id).to_string());

        if let Some(recorder) = &child_ctx.provenance {
            recorder.step_started(shortname(&self.id), ctx.part_of.as_deref());
        }

        let mut inner_order = ValueMap::new();
        for parameter in &self.inputs {
            if parameter.not_connected {
                continue;
            }
            let value = joborder
                .get(&parameter.id)
                .cloned()
                .ok_or_else(|| WorkflowError::MissingValue(parameter.id.clone()))?;
            inner_order.insert(shortname(&parameter.id).to_string(), value);
        }

        let outputs = self.outputs.clone();
        let step_id = self.id.clone();
        let provenance = child_ctx.provenance.clone();
        let translate: OutputCallback = Rc::new(move |jobout, status| {
            let mut status = status;
            let mut mapped = ValueMap::new();
            for output in &outputs {
                let field = shortname(&output.id);
                match jobout.get(field) {
                    Some(value) => {
                        mapped.insert(output.id.clone(), value.clone());
                    }
                    None => status = ProcessStatus::PermanentFail,
                }
            }
            if let Some(recorder) = &provenance {
                recorder.step_finished(shortname(&step_id), status);
            }
            callback(mapped, status);
        });

        self.embedded.job(inner_order, translate, &child_ctx)
    }
}
