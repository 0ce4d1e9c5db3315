//! Workflow construction and the process entry point.
//!
//! [`Workflow::new`] turns a [`WorkflowDefinition`] into an executable
//! process: it builds every [`WorkflowStep`] (resolving run targets through
//! the loader), and hands the collected parameter lists to the static
//! checker so link errors surface before anything runs. The [`Process`]
//! implementation starts a [`WorkflowJob`] per run.

use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;
use tracing::debug;

use conflux_types::{Parameter, Requirement, WorkflowDefinition};

use crate::context::{LoadingContext, RuntimeContext};
use crate::driver::WorkflowJob;
use crate::error::WorkflowError;
use crate::process::{JobSource, OutputCallback, Process};
use crate::step::WorkflowStep;
use crate::value::{ValueMap, shortname};

/// An executable workflow.
pub struct Workflow {
    name: String,
    inputs: Rc<Vec<Parameter>>,
    outputs: Rc<Vec<Parameter>>,
    requirements: Rc<Vec<Requirement>>,
    steps: Vec<Rc<WorkflowStep>>,
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow").field("name", &self.name).finish()
    }
}

impl Workflow {
    /// Builds a workflow, resolving steps and running the static checker.
    pub fn new(definition: &WorkflowDefinition, loading: &LoadingContext) -> Result<Self, WorkflowError> {
        let loading = loading.nested(&definition.requirements);

        let mut steps = Vec::with_capacity(definition.steps.len());
        for step_definition in &definition.steps {
            steps.push(Rc::new(WorkflowStep::new(step_definition, &loading)?));
        }

        if loading.do_validate
            && let Some(checker) = &loading.checker
        {
            let mut step_inputs = Vec::new();
            let mut step_outputs = Vec::new();
            let mut param_to_step = IndexMap::new();
            for step in &steps {
                step_inputs.extend_from_slice(step.inputs());
                step_outputs.extend_from_slice(step.outputs());
                for parameter in step.inputs().iter().chain(step.outputs()) {
                    param_to_step.insert(parameter.id.clone(), step.id().to_string());
                }
            }
            checker.check(&definition.inputs, &definition.outputs, &step_inputs, &step_outputs, &param_to_step)?;
        }

        let workflow = Self {
            name: format!("workflow {}", shortname(&definition.id)),
            inputs: Rc::new(definition.inputs.clone()),
            outputs: Rc::new(definition.outputs.clone()),
            requirements: Rc::new(loading.requirements),
            steps,
        };
        debug!(workflow = %workflow.name, steps = workflow.steps.len(), "initialized");
        Ok(workflow)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn workflow_outputs(&self) -> &Rc<Vec<Parameter>> {
        &self.outputs
    }

    pub(crate) fn requirement_list(&self) -> &Rc<Vec<Requirement>> {
        &self.requirements
    }

    pub(crate) fn steps(&self) -> &[Rc<WorkflowStep>] {
        &self.steps
    }
}

impl Process for Workflow {
    fn inputs(&self) -> &[Parameter] {
        &self.inputs
    }

    fn outputs(&self) -> &[Parameter] {
        &self.outputs
    }

    fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    /// Starts a run. `joborder` is keyed by input short names; the callback
    /// fires exactly once when the workflow terminates.
    fn job(&self, joborder: ValueMap, callback: OutputCallback, ctx: &RuntimeContext) -> Result<Box<dyn JobSource>, WorkflowError> {
        Ok(Box::new(WorkflowJob::new(self, joborder, callback, ctx)?))
    }
}
