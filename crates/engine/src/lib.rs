//! # Conflux Engine
//!
//! The workflow execution core: given a parsed, validated workflow graph
//! (see `conflux-types`) and an input binding, the engine drives the graph
//! to completion — resolving per-step inputs from upstream state, gating on
//! `when` conditionals, scattering over array inputs, collecting step
//! outputs back into the workflow state, and emitting a final output.
//!
//! ## Key pieces
//!
//! - **[`workflow::Workflow`]**: constructs the executable graph and is the
//!   run entry point (`Process::job`).
//! - **[`driver::WorkflowJob`]**: the cooperative scheduler. A lazy job
//!   source the caller polls; receive-output callbacks mutate the state map
//!   between pulls.
//! - **[`router`]**: pure resolution of parameter lists against the state
//!   map, with link-merge, pick-value, and union-aware type checks.
//! - **[`scatter`]**: dot-product and cross-product fan-out with shard
//!   collection back into shaped arrays.
//! - **[`harness`]**: an async pump executing jobs inline and streaming
//!   lifecycle events.
//!
//! Tool execution, document parsing, the expression language, and
//! provenance capture are external collaborators reached through the traits
//! in [`process`], [`eval`], [`fs`], and [`provenance`].

pub mod context;
pub mod driver;
pub mod error;
pub mod eval;
pub mod fs;
pub mod harness;
pub mod process;
pub mod provenance;
pub mod router;
pub mod scatter;
pub mod state;
pub mod step;
pub mod value;
pub mod workflow;

pub use context::{LoadingContext, OnError, RuntimeContext};
pub use error::WorkflowError;
pub use eval::{EvalOptions, ExpressionEvaluator};
pub use fs::{CONTENT_LIMIT, FsAccess, StdFsAccess};
pub use harness::{RunControl, RunEvent, RunStatus, drive_workflow};
pub use process::{CallbackJob, EmptySource, Job, JobPoll, JobSource, OnceSource, OutputCallback, Process, ProcessFactory, StaticChecker, WorkUnit};
pub use provenance::ProvenanceRecorder;
pub use router::{ResolveOptions, SourceField, resolve};
pub use state::{ProcessStatus, WorkflowState, WorkflowStateItem};
pub use step::WorkflowStep;
pub use value::{ValueMap, shortname};
pub use workflow::Workflow;
