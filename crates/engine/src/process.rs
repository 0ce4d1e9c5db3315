//! Process and job contracts.
//!
//! A [`Process`] is anything a step can run: a command-line tool, an
//! expression tool, an operation, or a nested workflow. Asking a process for
//! work yields a [`JobSource`] — a lazy, possibly-stalling producer the
//! caller polls with [`JobSource::pull_next`]. Jobs are opaque to the engine;
//! the caller executes each one, and the job's output callback fires before
//! the next pull.
//!
//! Tool execution itself lives outside this crate. Implementations here are
//! limited to the plumbing every executor needs: [`CallbackJob`],
//! [`OnceSource`], and [`EmptySource`].

use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use conflux_types::{Parameter, Requirement, RunTarget};

use crate::context::{LoadingContext, RuntimeContext};
use crate::error::WorkflowError;
use crate::state::ProcessStatus;
use crate::value::ValueMap;

/// Callback receiving a process's outputs and final status.
///
/// Fires exactly once per process run (per shard, for scattered steps).
pub type OutputCallback = Rc<dyn Fn(ValueMap, ProcessStatus)>;

/// One pull from a lazy job sequence.
pub enum JobPoll {
    /// A job ready to hand to the caller.
    Ready(Job),
    /// Nothing can be produced until upstream state advances.
    Stalled,
    /// The sequence is exhausted.
    Finished,
}

/// A lazy producer of pending jobs.
///
/// `pull_next` never blocks: it either hands out a job, signals a cooperative
/// stall, or reports exhaustion. Errors abort the sequence.
pub trait JobSource {
    fn pull_next(&mut self) -> Result<JobPoll, WorkflowError>;
}

impl fmt::Debug for dyn JobSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<dyn JobSource>")
    }
}

/// A unit of executable work produced by a process.
///
/// The engine never runs jobs; the caller does, and implementations invoke
/// their output callback before `run` returns.
pub trait WorkUnit {
    /// Display name for logs and run events.
    fn name(&self) -> &str;

    /// Execute the unit.
    fn run(&mut self, ctx: &RuntimeContext) -> Result<(), WorkflowError>;
}

/// Boxed work unit handed across the engine boundary.
pub type Job = Box<dyn WorkUnit>;

/// An executable process.
pub trait Process {
    /// Declared input parameters.
    fn inputs(&self) -> &[Parameter];

    /// Declared output parameters.
    fn outputs(&self) -> &[Parameter];

    /// Requirements in effect for this process.
    fn requirements(&self) -> &[Requirement] {
        &[]
    }

    /// Starts a run over `joborder`, reporting through `callback`.
    fn job(&self, joborder: ValueMap, callback: OutputCallback, ctx: &RuntimeContext) -> Result<Box<dyn JobSource>, WorkflowError>;
}

/// Resolves a step's `run` reference to a process.
pub trait ProcessFactory {
    fn load(&self, target: &RunTarget, loading: &LoadingContext) -> Result<Rc<dyn Process>, WorkflowError>;
}

/// Compile-time verification of data links, invoked once per workflow
/// construction.
pub trait StaticChecker {
    fn check(
        &self,
        workflow_inputs: &[Parameter],
        workflow_outputs: &[Parameter],
        step_inputs: &[Parameter],
        step_outputs: &[Parameter],
        param_to_step: &IndexMap<String, String>,
    ) -> Result<(), WorkflowError>;
}

/// A job that only delivers pre-computed outputs when run.
pub struct CallbackJob {
    name: String,
    callback: OutputCallback,
    outputs: ValueMap,
    status: ProcessStatus,
}

impl CallbackJob {
    pub fn new(name: impl Into<String>, callback: OutputCallback, outputs: ValueMap, status: ProcessStatus) -> Self {
        Self {
            name: name.into(),
            callback,
            outputs,
            status,
        }
    }
}

impl WorkUnit for CallbackJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, _ctx: &RuntimeContext) -> Result<(), WorkflowError> {
        (self.callback)(self.outputs.clone(), self.status);
        Ok(())
    }
}

/// Yields a single job, then finishes.
pub struct OnceSource(Option<Job>);

impl OnceSource {
    pub fn new(job: Job) -> Self {
        Self(Some(job))
    }
}

impl JobSource for OnceSource {
    fn pull_next(&mut self) -> Result<JobPoll, WorkflowError> {
        Ok(match self.0.take() {
            Some(job) => JobPoll::Ready(job),
            None => JobPoll::Finished,
        })
    }
}

/// Finishes immediately. Skipped steps hand this back so the driver still
/// observes a well-formed sequence.
pub struct EmptySource;

impl JobSource for EmptySource {
    fn pull_next(&mut self) -> Result<JobPoll, WorkflowError> {
        Ok(JobPoll::Finished)
    }
}
