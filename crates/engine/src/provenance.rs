//! Provenance collaborator contract.
//!
//! Recording is entirely optional: the engine calls these hooks only when a
//! recorder is present on the runtime context, and treats the recorder as
//! opaque. Step events carry the parent workflow name so recorders can
//! rebuild the run tree without the engine holding back-references.

use crate::state::ProcessStatus;
use crate::value::ValueMap;

/// Sink for run lineage events.
pub trait ProvenanceRecorder {
    /// A step began producing jobs under `parent`.
    fn step_started(&self, name: &str, parent: Option<&str>);

    /// A step finished with the given status.
    fn step_finished(&self, name: &str, status: ProcessStatus);

    /// A workflow produced its final output mapping.
    fn workflow_outputs(&self, name: &str, outputs: &ValueMap, status: ProcessStatus);
}
