//! The workflow driver.
//!
//! A [`WorkflowJob`] owns the state map and the per-step runtimes for one
//! run. It is itself a [`JobSource`]: each `pull_next` advances the
//! cooperative main loop — polling steps for readiness, draining their job
//! sequences round-robin, and detecting quiescence — and hands pending jobs
//! to the caller one at a time. Receive-output callbacks run on the driver's
//! thread between pulls, so state mutation never races job production.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use conflux_types::{Parameter, Requirement, ScatterMethod, features, has_requirement};

use crate::context::{OnError, RuntimeContext};
use crate::error::WorkflowError;
use crate::fs::CONTENT_LIMIT;
use crate::process::{EmptySource, JobPoll, JobSource, OutputCallback, Process};
use crate::provenance::ProvenanceRecorder;
use crate::router::{self, ResolveOptions, SourceField};
use crate::scatter::{self, PostScatterHook};
use crate::state::{ProcessStatus, WorkflowState, WorkflowStateItem};
use crate::step::WorkflowStep;
use crate::value::{ValueMap, expand_directory_listings, has_class, short_view, shortname};
use crate::workflow::Workflow;

/// Mutable per-run state of one step. Owned exclusively by the driver;
/// the shared `completed` flag is the only piece callbacks may touch.
struct StepRuntime {
    step: Rc<WorkflowStep>,
    submitted: bool,
    sequence: Option<Box<dyn JobSource>>,
    shared: Rc<StepShared>,
}

struct StepShared {
    completed: Cell<bool>,
}

struct RunState {
    state: WorkflowState,
    status: ProcessStatus,
    made_progress: bool,
    did_callback: bool,
    completed_steps: usize,
}

/// State reachable from receive-output callbacks.
struct DriverShared {
    name: String,
    outputs: Rc<Vec<Parameter>>,
    requirements: Rc<Vec<Requirement>>,
    total_steps: usize,
    final_callback: OutputCallback,
    provenance: Option<Rc<dyn ProvenanceRecorder>>,
    run: RefCell<RunState>,
}

impl DriverShared {
    fn supports_multiple(&self) -> bool {
        has_requirement(&self.requirements, features::MULTIPLE_INPUT)
    }

    fn all_completed(&self) -> bool {
        self.run.borrow().completed_steps == self.total_steps
    }

    fn mark_step_completed(&self, step_shared: &StepShared) {
        if !step_shared.completed.get() {
            step_shared.completed.set(true);
            self.run.borrow_mut().completed_steps += 1;
        }
    }

    /// Binds a completed step's outputs into the state map and escalates the
    /// workflow status on failure. Fires final collection when this was the
    /// last outstanding step.
    fn receive_output(&self, step: &WorkflowStep, step_shared: &StepShared, jobout: ValueMap, status: ProcessStatus) {
        let all_done = {
            let mut run = self.run.borrow_mut();
            let mut status = status;
            for output in step.outputs() {
                match jobout.get(&output.id) {
                    Some(value) => {
                        run.state
                            .bind(output.id.clone(), WorkflowStateItem::new(output.clone(), value.clone(), status));
                    }
                    None => {
                        error!(step = %step.name(), output = %output.id, "output is missing expected field");
                        status = ProcessStatus::PermanentFail;
                    }
                }
            }
            if status.is_terminal_ok() {
                info!(step = %step.name(), status = ?status, "completed");
            } else {
                run.status.escalate(status);
                warn!(step = %step.name(), status = ?status, "completed");
            }
            if !step_shared.completed.get() {
                step_shared.completed.set(true);
                run.completed_steps += 1;
            }
            run.made_progress = true;
            run.completed_steps == self.total_steps
        };
        if all_done {
            self.do_output_callback();
        }
    }

    /// Collects the final workflow output with partial resolution and fires
    /// the output callback exactly once. Collection errors escalate the run
    /// to permanent failure but never suppress the callback.
    fn do_output_callback(&self) {
        {
            let mut run = self.run.borrow_mut();
            if run.did_callback {
                return;
            }
            run.did_callback = true;
        }
        let options = ResolveOptions {
            allow_partial: true,
            supports_multiple: self.supports_multiple(),
            shorten_ids: true,
        };
        let resolved = {
            let run = self.run.borrow();
            router::resolve(&run.state, &self.outputs, SourceField::OutputSource, options)
        };
        let (outputs, status) = match resolved {
            Ok(Some(outputs)) => (outputs, self.run.borrow().status),
            Ok(None) => (ValueMap::new(), self.run.borrow().status),
            Err(err) => {
                error!(workflow = %self.name, error = %err, "cannot collect workflow output");
                let mut run = self.run.borrow_mut();
                run.status.escalate(ProcessStatus::PermanentFail);
                (ValueMap::new(), run.status)
            }
        };
        if let Some(recorder) = &self.provenance {
            recorder.workflow_outputs(&self.name, &outputs, status);
        }
        info!(workflow = %self.name, status = ?status, "completed");
        (self.final_callback)(outputs, status);
    }
}

fn step_callback(shared: &Rc<DriverShared>, runtime: &StepRuntime) -> OutputCallback {
    let shared = Rc::clone(shared);
    let step = Rc::clone(&runtime.step);
    let step_shared = Rc::clone(&runtime.shared);
    Rc::new(move |jobout, status| shared.receive_output(&step, &step_shared, jobout, status))
}

/// One run of a workflow, advanced cooperatively by the caller.
pub struct WorkflowJob {
    shared: Rc<DriverShared>,
    steps: Vec<StepRuntime>,
    ctx: RuntimeContext,
    cursor: usize,
    in_pass: bool,
    finished: bool,
}

impl WorkflowJob {
    /// Seeds the state map from the job order and randomizes step iteration
    /// order. `joborder` is keyed by input short names.
    pub(crate) fn new(
        workflow: &Workflow,
        joborder: ValueMap,
        callback: OutputCallback,
        ctx: &RuntimeContext,
    ) -> Result<Self, WorkflowError> {
        let name = workflow.name().to_string();
        info!(workflow = %name, "start");
        if ctx.debug {
            debug!(workflow = %name, inputs = %serde_json::to_string(&joborder).unwrap_or_default(), "inputs");
        }

        let mut state = WorkflowState::new();
        for input in workflow.inputs() {
            let short = shortname(&input.id);
            let value = joborder
                .get(short)
                .cloned()
                .or_else(|| input.default.clone())
                .ok_or_else(|| WorkflowError::MissingWorkflowInput(input.id.clone()))?;
            state.bind(
                input.id.clone(),
                WorkflowStateItem::new(input.clone(), value, ProcessStatus::Success),
            );
        }
        for step in workflow.steps() {
            for output in step.outputs() {
                state.declare(output.id.clone());
            }
        }

        let mut steps: Vec<StepRuntime> = workflow
            .steps()
            .iter()
            .map(|step| StepRuntime {
                step: Rc::clone(step),
                submitted: false,
                sequence: None,
                shared: Rc::new(StepShared {
                    completed: Cell::new(false),
                }),
            })
            .collect();
        // Shuffled iteration smokes out authoring-order dependencies.
        let mut rng: StdRng = match ctx.shuffle_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        steps.shuffle(&mut rng);

        let shared = Rc::new(DriverShared {
            name,
            outputs: Rc::clone(workflow.workflow_outputs()),
            requirements: Rc::clone(workflow.requirement_list()),
            total_steps: steps.len(),
            final_callback: callback,
            provenance: ctx.provenance.clone(),
            run: RefCell::new(RunState {
                state,
                status: ProcessStatus::Success,
                made_progress: false,
                did_callback: false,
                completed_steps: 0,
            }),
        });

        Ok(Self {
            shared,
            steps,
            ctx: ctx.clone(),
            cursor: 0,
            in_pass: false,
            finished: false,
        })
    }

    /// Attempts to start a step: resolves its inputs, prepares the
    /// post-scatter hook, and dispatches directly or through the scatter
    /// engine. `Ok(None)` means not ready this round.
    fn try_make_job(&self, runtime: &StepRuntime) -> Result<Option<Box<dyn JobSource>>, WorkflowError> {
        if runtime.submitted {
            return Ok(None);
        }
        let step = Rc::clone(&runtime.step);

        let resolved = {
            let run = self.shared.run.borrow();
            let options = ResolveOptions {
                allow_partial: false,
                supports_multiple: self.shared.supports_multiple(),
                shorten_ids: false,
            };
            router::resolve(&run.state, step.inputs(), SourceField::Source, options)?
        };
        let Some(inputobj) = resolved else {
            debug!(workflow = %self.shared.name, step = %step.name(), "job step not ready");
            return Ok(None);
        };
        info!(workflow = %self.shared.name, step = %step.name(), "starting");

        let value_from: Vec<(String, String)> = step
            .inputs()
            .iter()
            .filter_map(|parameter| parameter.value_from.clone().map(|expression| (parameter.id.clone(), expression)))
            .collect();
        if !value_from.is_empty() && !has_requirement(&self.shared.requirements, features::STEP_INPUT_EXPRESSION) {
            return Err(WorkflowError::FeatureNotDeclared {
                feature: features::STEP_INPUT_EXPRESSION.to_string(),
            });
        }
        let load_contents: Vec<String> = step
            .inputs()
            .iter()
            .filter(|parameter| parameter.load_contents)
            .map(|parameter| parameter.id.clone())
            .collect();

        let callback = step_callback(&self.shared, runtime);
        let hook = self.post_scatter_hook(&step, value_from, load_contents);

        let source: Box<dyn JobSource> = if !step.scatter().is_empty() {
            scatter::warn_on_empty_axes(step.name(), &inputobj, step.scatter());
            let process: Rc<dyn Process> = Rc::clone(&step) as Rc<dyn Process>;
            match step.scatter_method().unwrap_or(ScatterMethod::DotProduct) {
                ScatterMethod::DotProduct => scatter::dotproduct(process, inputobj, step.scatter(), hook, callback, &self.ctx)?,
                ScatterMethod::NestedCrossProduct => {
                    scatter::nested_crossproduct(process, inputobj, step.scatter(), hook, callback, &self.ctx)?
                }
                ScatterMethod::FlatCrossProduct => {
                    scatter::flat_crossproduct(process, inputobj, step.scatter(), hook, callback, &self.ctx)?
                }
            }
        } else {
            match hook(inputobj)? {
                Some(evaluated) => {
                    if self.ctx.debug {
                        debug!(step = %step.name(), inputs = %serde_json::to_string(&evaluated).unwrap_or_default(), "evaluated job input");
                    }
                    match step.job(evaluated, callback, &self.ctx) {
                        Ok(source) => source,
                        Err(err) => {
                            // A failed job producer still counts the step as
                            // done; the run surfaces the permanent failure.
                            error!(workflow = %self.shared.name, step = %step.name(), error = %err, "unhandled exception starting step");
                            self.shared.run.borrow_mut().status.escalate(ProcessStatus::PermanentFail);
                            self.shared.mark_step_completed(&runtime.shared);
                            Box::new(EmptySource)
                        }
                    }
                }
                None => {
                    info!(workflow = %self.shared.name, step = %step.name(), "will be skipped");
                    let nulls: ValueMap = step.outputs().iter().map(|output| (output.id.clone(), Value::Null)).collect();
                    callback(nulls, ProcessStatus::Skipped);
                    Box::new(EmptySource)
                }
            }
        };
        Ok(Some(source))
    }

    /// Builds the per-shard evaluation hook: `loadContents` pre-loading,
    /// directory-listing expansion, `valueFrom`, then the `when` gate.
    fn post_scatter_hook(&self, step: &Rc<WorkflowStep>, value_from: Vec<(String, String)>, load_contents: Vec<String>) -> PostScatterHook {
        let evaluator = self.ctx.evaluator.clone();
        let fs = Rc::clone(&self.ctx.fs_access);
        let options = self.ctx.eval_options();
        let requirements = Rc::clone(&self.shared.requirements);
        let when = step.when().map(str::to_string);
        let step_name = step.name().to_string();

        Rc::new(move |mut io: ValueMap| -> Result<Option<ValueMap>, WorkflowError> {
            for key in &load_contents {
                if let Some(value) = io.get_mut(key)
                    && has_class(value, "File")
                    && value.get("contents").is_none()
                {
                    let location = value
                        .get("location")
                        .and_then(Value::as_str)
                        .ok_or_else(|| WorkflowError::Validation(format!("File value for '{key}' has no location")))?
                        .to_string();
                    let contents = fs.read_contents(&location, CONTENT_LIMIT)?;
                    if let Value::Object(fields) = value {
                        fields.insert("contents".to_string(), Value::String(contents));
                    }
                }
            }

            let evaluated = if value_from.is_empty() {
                io
            } else {
                let evaluator = evaluator
                    .as_ref()
                    .ok_or_else(|| WorkflowError::Expression("no expression evaluator configured for valueFrom".to_string()))?;
                for (key, _) in &value_from {
                    if let Some(value) = io.get_mut(key) {
                        expand_directory_listings(value, fs.as_ref())?;
                    }
                }
                let inputs_view = short_view(&io);
                let mut evaluated = io.clone();
                for (key, expression) in &value_from {
                    let context = io.get(key).cloned().unwrap_or(Value::Null);
                    let result = evaluator.eval(expression, &inputs_view, &requirements, Some(&context), &options)?;
                    evaluated.insert(key.clone(), result);
                }
                evaluated
            };

            if let Some(when_expression) = &when {
                let evaluator = evaluator
                    .as_ref()
                    .ok_or_else(|| WorkflowError::Expression("no expression evaluator configured for 'when'".to_string()))?;
                let inputs_view = short_view(&evaluated);
                let context = Value::Object(inputs_view.iter().map(|(key, value)| (key.clone(), value.clone())).collect());
                match evaluator.eval(when_expression, &inputs_view, &requirements, Some(&context), &options)? {
                    Value::Bool(true) => {}
                    Value::Bool(false) => {
                        debug!(step = %step_name, "conditional evaluated to false");
                        return Ok(None);
                    }
                    other => return Err(WorkflowError::ConditionalTypeError(other.to_string())),
                }
            }
            Ok(Some(evaluated))
        })
    }
}

impl JobSource for WorkflowJob {
    fn pull_next(&mut self) -> Result<JobPoll, WorkflowError> {
        if self.finished {
            return Ok(JobPoll::Finished);
        }
        loop {
            if !self.in_pass {
                if self.shared.all_completed() {
                    break;
                }
                self.shared.run.borrow_mut().made_progress = false;
                self.cursor = 0;
                self.in_pass = true;
            }

            while self.cursor < self.steps.len() {
                if self.ctx.on_error == OnError::Stop && self.shared.run.borrow().status != ProcessStatus::Success {
                    self.cursor = self.steps.len();
                    break;
                }
                let index = self.cursor;

                if !self.steps[index].submitted {
                    match self.try_make_job(&self.steps[index]) {
                        Ok(Some(source)) => {
                            let runtime = &mut self.steps[index];
                            runtime.sequence = Some(source);
                            runtime.submitted = true;
                        }
                        Ok(None) => {}
                        Err(err) => {
                            error!(workflow = %self.shared.name, step = %self.steps[index].step.name(), error = %err, "cannot make job");
                            self.shared.run.borrow_mut().status.escalate(ProcessStatus::PermanentFail);
                        }
                    }
                }

                let mut release = false;
                if let Some(sequence) = self.steps[index].sequence.as_mut() {
                    loop {
                        if self.ctx.on_error == OnError::Stop && self.shared.run.borrow().status != ProcessStatus::Success {
                            break;
                        }
                        match sequence.pull_next() {
                            Ok(JobPoll::Ready(job)) => {
                                self.shared.run.borrow_mut().made_progress = true;
                                return Ok(JobPoll::Ready(job));
                            }
                            Ok(JobPoll::Stalled) => break,
                            Ok(JobPoll::Finished) => {
                                release = true;
                                break;
                            }
                            Err(err) => {
                                error!(workflow = %self.shared.name, error = %err, "cannot make job");
                                self.shared.run.borrow_mut().status.escalate(ProcessStatus::PermanentFail);
                                release = true;
                                break;
                            }
                        }
                    }
                }
                // Completed steps drop their sequence to release retained
                // closures and temporaries.
                if release || self.steps[index].shared.completed.get() {
                    self.steps[index].sequence = None;
                }
                self.cursor += 1;
            }

            self.in_pass = false;
            if self.shared.all_completed() {
                break;
            }
            let (made_progress, status) = {
                let run = self.shared.run.borrow();
                (run.made_progress, run.status)
            };
            if !made_progress {
                if status != ProcessStatus::Success {
                    break;
                }
                return Ok(JobPoll::Stalled);
            }
        }

        if !self.shared.run.borrow().did_callback {
            self.shared.do_output_callback();
        }
        self.finished = true;
        Ok(JobPoll::Finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::LoadingContext;
    use crate::process::{CallbackJob, OnceSource, ProcessFactory};
    use conflux_types::{RunTarget, SchemaType, StepDefinition, WorkflowDefinition};
    use serde_json::json;

    /// Tool copying `x` to `y`.
    struct CopyTool {
        inputs: Vec<Parameter>,
        outputs: Vec<Parameter>,
    }

    impl CopyTool {
        fn new() -> Self {
            Self {
                inputs: vec![Parameter::new("copy/x", SchemaType::name("int"))],
                outputs: vec![Parameter::new("copy/y", SchemaType::name("int"))],
            }
        }
    }

    impl Process for CopyTool {
        fn inputs(&self) -> &[Parameter] {
            &self.inputs
        }

        fn outputs(&self) -> &[Parameter] {
            &self.outputs
        }

        fn job(&self, joborder: ValueMap, callback: OutputCallback, _ctx: &RuntimeContext) -> Result<Box<dyn JobSource>, WorkflowError> {
            let mut outputs = ValueMap::new();
            outputs.insert("y".to_string(), joborder.get("x").cloned().unwrap_or(Value::Null));
            Ok(Box::new(OnceSource::new(Box::new(CallbackJob::new(
                "copy",
                callback,
                outputs,
                ProcessStatus::Success,
            )))))
        }
    }

    struct CopyFactory;

    impl ProcessFactory for CopyFactory {
        fn load(&self, _target: &RunTarget, _loading: &LoadingContext) -> Result<Rc<dyn Process>, WorkflowError> {
            Ok(Rc::new(CopyTool::new()))
        }
    }

    fn copy_workflow() -> WorkflowDefinition {
        let mut output = Parameter::new("wf/result", SchemaType::name("int"));
        output.output_source.push("wf/copy/y".to_string());
        WorkflowDefinition {
            id: "wf".to_string(),
            inputs: vec![Parameter::new("wf/x", SchemaType::name("int"))],
            outputs: vec![output],
            steps: vec![StepDefinition {
                id: "wf/copy".to_string(),
                run: RunTarget::Reference("copy.cwl".to_string()),
                inputs: vec![Parameter::new("wf/copy/x", SchemaType::name("Any")).with_source("wf/x")],
                outputs: vec!["y".to_string()],
                requirements: Vec::new(),
                scatter: Vec::new(),
                scatter_method: None,
                when: None,
            }],
            requirements: Vec::new(),
        }
    }

    fn loading() -> LoadingContext {
        LoadingContext {
            factory: Some(Rc::new(CopyFactory)),
            ..Default::default()
        }
    }

    fn drive(workflow: &Workflow, joborder: ValueMap, ctx: &RuntimeContext) -> Option<(ValueMap, ProcessStatus)> {
        let result: Rc<RefCell<Option<(ValueMap, ProcessStatus)>>> = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&result);
        let callback: OutputCallback = Rc::new(move |outputs, status| {
            *sink.borrow_mut() = Some((outputs, status));
        });
        let mut source = workflow.job(joborder, callback, ctx).expect("start workflow");
        loop {
            match source.pull_next().expect("pull") {
                JobPoll::Ready(mut job) => job.run(ctx).expect("run job"),
                JobPoll::Stalled => panic!("workflow stalled under inline execution"),
                JobPoll::Finished => break,
            }
        }
        result.borrow_mut().take()
    }

    #[test]
    fn missing_workflow_input_fails_at_start() {
        let workflow = Workflow::new(&copy_workflow(), &loading()).expect("build workflow");
        let callback: OutputCallback = Rc::new(|_, _| {});
        let ctx = RuntimeContext::default();

        let error = workflow.job(ValueMap::new(), callback, &ctx).err().expect("must fail");
        assert!(matches!(error, WorkflowError::MissingWorkflowInput(id) if id == "wf/x"));
    }

    #[test]
    fn workflow_input_defaults_seed_the_state() {
        let mut definition = copy_workflow();
        definition.inputs[0].default = Some(json!(5));
        let workflow = Workflow::new(&definition, &loading()).expect("build workflow");

        let ctx = RuntimeContext::default();
        let (outputs, status) = drive(&workflow, ValueMap::new(), &ctx).expect("callback fired");
        assert_eq!(status, ProcessStatus::Success);
        assert_eq!(outputs.get("result"), Some(&json!(5)));
    }

    #[test]
    fn final_callback_fires_for_an_empty_workflow() {
        let definition = WorkflowDefinition {
            id: "empty".to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            steps: Vec::new(),
            requirements: Vec::new(),
        };
        let workflow = Workflow::new(&definition, &loading()).expect("build workflow");

        let ctx = RuntimeContext::default();
        let (outputs, status) = drive(&workflow, ValueMap::new(), &ctx).expect("callback fired");
        assert!(outputs.is_empty());
        assert_eq!(status, ProcessStatus::Success);
    }

    #[test]
    fn seeded_runs_are_reproducible() {
        let workflow = Workflow::new(&copy_workflow(), &loading()).expect("build workflow");
        let ctx = RuntimeContext {
            shuffle_seed: Some(42),
            ..Default::default()
        };

        let mut joborder = ValueMap::new();
        joborder.insert("x".to_string(), json!(3));
        let first = drive(&workflow, joborder.clone(), &ctx).expect("callback fired");
        let second = drive(&workflow, joborder, &ctx).expect("callback fired");
        assert_eq!(first.0, second.0);
        assert_eq!(first.1, second.1);
    }
}
