//! Workflow runtime state.
//!
//! The driver owns one [`WorkflowState`] per run: a mapping from parameter id
//! to either a bound [`WorkflowStateItem`] or an *unset* placeholder. Every
//! workflow input is bound at start; every step output is declared unset at
//! start and bound exactly once, by the receive-output path of the step that
//! produces it.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use conflux_types::Parameter;

/// Final status of a process, shard, or the workflow itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProcessStatus {
    Success,
    Skipped,
    TemporaryFail,
    PermanentFail,
}

impl ProcessStatus {
    /// True for the statuses that count as an orderly completion.
    pub fn is_terminal_ok(self) -> bool {
        matches!(self, ProcessStatus::Success | ProcessStatus::Skipped)
    }

    /// Sticky escalation: once permanent failure is recorded, no later
    /// observation can improve the status.
    pub fn escalate(&mut self, observed: ProcessStatus) {
        if *self != ProcessStatus::PermanentFail {
            *self = observed;
        }
    }
}

/// A bound value in the workflow state.
#[derive(Debug, Clone)]
pub struct WorkflowStateItem {
    /// The parameter descriptor the value was produced for.
    pub parameter: Parameter,
    /// The value itself; File/Directory values stay opaque.
    pub value: Value,
    /// Status of the producing step (or `Success` for workflow inputs).
    pub status: ProcessStatus,
}

impl WorkflowStateItem {
    pub fn new(parameter: Parameter, value: Value, status: ProcessStatus) -> Self {
        Self { parameter, value, status }
    }
}

/// One lookup in the state map.
pub enum StateEntry<'a> {
    /// The id is not a state key at all; reading it is a wiring error.
    Unknown,
    /// Declared but not yet produced.
    Unset,
    /// Produced, with the given item.
    Bound(&'a WorkflowStateItem),
}

/// The per-run state map.
#[derive(Default)]
pub struct WorkflowState {
    entries: IndexMap<String, Option<WorkflowStateItem>>,
}

impl WorkflowState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares `id` as a known key with no value yet.
    pub fn declare(&mut self, id: impl Into<String>) {
        self.entries.entry(id.into()).or_insert(None);
    }

    /// Binds `id` to `item`, replacing an unset placeholder.
    pub fn bind(&mut self, id: impl Into<String>, item: WorkflowStateItem) {
        self.entries.insert(id.into(), Some(item));
    }

    /// Looks up `id`, distinguishing unknown keys from unset ones.
    pub fn entry(&self, id: &str) -> StateEntry<'_> {
        match self.entries.get(id) {
            None => StateEntry::Unknown,
            Some(None) => StateEntry::Unset,
            Some(Some(item)) => StateEntry::Bound(item),
        }
    }

    /// Number of known keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
