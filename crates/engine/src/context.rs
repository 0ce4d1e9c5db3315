//! Loading- and run-time configuration.
//!
//! `LoadingContext` travels through workflow construction (requirement
//! inheritance, process resolution, static checking); `RuntimeContext`
//! travels through execution (failure policy, collaborator handles, naming).
//! Both are cheap to clone — collaborators are shared behind `Rc`.

use std::rc::Rc;
use std::time::Duration;

use conflux_types::Requirement;

use crate::eval::{EvalOptions, ExpressionEvaluator};
use crate::fs::{FsAccess, StdFsAccess};
use crate::process::{ProcessFactory, StaticChecker};
use crate::provenance::ProvenanceRecorder;

/// Policy applied when a step or shard fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnError {
    /// Stop producing new jobs once any failure is observed.
    #[default]
    Stop,
    /// Run every step to completion and report the worst status.
    Continue,
}

/// Configuration consulted while building a `Workflow` from its definition.
#[derive(Clone)]
pub struct LoadingContext {
    /// Requirements inherited from the enclosing document or parent workflow.
    pub requirements: Vec<Requirement>,
    /// Resolves `run` references to processes. Required whenever a step's
    /// run target is a reference rather than an inline workflow.
    pub factory: Option<Rc<dyn ProcessFactory>>,
    /// Compile-time link checker, invoked once per workflow construction.
    pub checker: Option<Rc<dyn StaticChecker>>,
    /// Skip the static checker when false.
    pub do_validate: bool,
}

impl Default for LoadingContext {
    fn default() -> Self {
        Self {
            requirements: Vec::new(),
            factory: None,
            checker: None,
            do_validate: true,
        }
    }
}

impl LoadingContext {
    /// Child context for a nested workflow: same collaborators, requirements
    /// extended by the parent's.
    pub fn nested(&self, requirements: &[Requirement]) -> Self {
        let mut child = self.clone();
        child.requirements.extend_from_slice(requirements);
        child
    }
}

/// Configuration consulted while driving a workflow run.
#[derive(Clone)]
pub struct RuntimeContext {
    /// Failure policy; `Stop` is the default.
    pub on_error: OnError,
    /// Emit evaluator debug output and verbose job dumps.
    pub debug: bool,
    /// Expose the evaluator's console stream.
    pub console: bool,
    /// Expression evaluation timeout.
    pub eval_timeout: Option<Duration>,
    /// Expression engine; required only when a workflow uses `valueFrom` or
    /// `when`.
    pub evaluator: Option<Rc<dyn ExpressionEvaluator>>,
    /// Filesystem collaborator for `loadContents` and directory listings.
    pub fs_access: Rc<dyn FsAccess>,
    /// Optional lineage recorder.
    pub provenance: Option<Rc<dyn ProvenanceRecorder>>,
    /// Name of the enclosing run, for logging and provenance linkage.
    pub part_of: Option<String>,
    /// Short name assigned to the current process by its parent.
    pub name: Option<String>,
    /// Seed for the driver's step-order shuffle; entropy when unset.
    pub shuffle_seed: Option<u64>,
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self {
            on_error: OnError::Stop,
            debug: false,
            console: false,
            eval_timeout: None,
            evaluator: None,
            fs_access: Rc::new(StdFsAccess),
            provenance: None,
            part_of: None,
            name: None,
            shuffle_seed: None,
        }
    }
}

impl RuntimeContext {
    /// Child context for work dispatched under `part_of` with the given
    /// short name.
    pub fn for_part(&self, part_of: impl Into<String>, name: impl Into<String>) -> Self {
        let mut child = self.clone();
        child.part_of = Some(part_of.into());
        child.name = Some(name.into());
        child
    }

    /// Evaluation knobs derived from this context.
    pub fn eval_options(&self) -> EvalOptions {
        EvalOptions {
            debug: self.debug,
            console: self.console,
            timeout: self.eval_timeout,
        }
    }
}
