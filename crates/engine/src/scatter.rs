//! Scatter dispatch and collection.
//!
//! A scattered step expands one job object into N shard jobs along its
//! scatter axes and collects shard outputs back into arrays of matching
//! shape. Three combinators are supported: dot-product (pairwise over
//! equal-length arrays), nested cross-product (one output nesting level per
//! axis, built from a chain of collectors), and flat cross-product (a single
//! collector sized by the product of the axis lengths).
//!
//! Shards run cooperatively: [`ParallelShards`] round-robins over the shard
//! job sources, forwarding jobs upward and stalling when every shard stalls.

use std::cell::RefCell;
use std::rc::Rc;

use serde_json::Value;
use tracing::{error, warn};

use crate::context::{OnError, RuntimeContext};
use crate::error::WorkflowError;
use crate::process::{JobPoll, JobSource, OutputCallback, Process};
use crate::state::ProcessStatus;
use crate::value::ValueMap;

/// Per-shard hook applied to a shard's job object before dispatch.
///
/// Returning `Ok(None)` completes the shard immediately as skipped.
pub type PostScatterHook = Rc<dyn Fn(ValueMap) -> Result<Option<ValueMap>, WorkflowError>>;

/// Collects shard outputs into pre-sized destination arrays.
///
/// Each output id owns one slot vector; shard `index` writes only slot
/// `index`, so completions never clash. The collector *arms* when its total
/// is sealed: the upstream callback fires exactly once, as soon as the
/// sealed total has been reached.
#[derive(Clone)]
pub struct ShardCollector {
    inner: Rc<RefCell<CollectorState>>,
}

struct CollectorState {
    dest: Vec<(String, Vec<Value>)>,
    shard_done: Vec<bool>,
    completed: usize,
    total: Option<usize>,
    status: ProcessStatus,
    callback: OutputCallback,
}

impl ShardCollector {
    /// A collector with one `size`-slot destination per output id.
    pub fn new(output_ids: Vec<String>, size: usize, callback: OutputCallback) -> Self {
        let dest = output_ids.into_iter().map(|id| (id, vec![Value::Null; size])).collect();
        Self {
            inner: Rc::new(RefCell::new(CollectorState {
                dest,
                shard_done: vec![false; size],
                completed: 0,
                total: None,
                status: ProcessStatus::Success,
                callback,
            })),
        }
    }

    /// Records shard `index`'s outputs and status.
    pub fn receive(&self, index: usize, outputs: ValueMap, status: ProcessStatus) {
        let fire = {
            let mut state = self.inner.borrow_mut();
            for (key, slots) in &mut state.dest {
                if let Some(value) = outputs.get(key.as_str()) {
                    slots[index] = value.clone();
                }
            }
            if let Some(done) = state.shard_done.get_mut(index) {
                *done = true;
            }
            if status != ProcessStatus::Success {
                state.status.escalate(status);
            }
            state.completed += 1;
            state.total == Some(state.completed)
        };
        if fire {
            self.fire();
        }
    }

    /// Seals the shard count; fires at once when everything already landed
    /// (including the zero-shard case).
    pub fn seal_total(&self, total: usize) {
        let fire = {
            let mut state = self.inner.borrow_mut();
            state.total = Some(total);
            state.completed == total
        };
        if fire {
            self.fire();
        }
    }

    /// Output callback bound to shard `index`.
    pub fn curried(&self, index: usize) -> OutputCallback {
        let collector = self.clone();
        Rc::new(move |outputs, status| collector.receive(index, outputs, status))
    }

    /// True once the sealed total has been reached.
    pub fn is_finished(&self) -> bool {
        let state = self.inner.borrow();
        state.total == Some(state.completed)
    }

    /// True once shard `index` has delivered its outputs.
    pub fn shard_done(&self, index: usize) -> bool {
        self.inner.borrow().shard_done.get(index).copied().unwrap_or(false)
    }

    /// Aggregate status over the shards observed so far.
    pub fn status(&self) -> ProcessStatus {
        self.inner.borrow().status
    }

    fn fire(&self) {
        let (outputs, status, callback) = {
            let state = self.inner.borrow();
            let outputs: ValueMap = state
                .dest
                .iter()
                .map(|(id, slots)| (id.clone(), Value::Array(slots.clone())))
                .collect();
            (outputs, state.status, Rc::clone(&state.callback))
        };
        callback(outputs, status);
    }
}

/// Round-robin driver over shard job sources.
///
/// Scans the shards; each non-exhausted shard is pulled until it stalls,
/// and every job is forwarded upward immediately. A full scan without
/// progress yields a cooperative stall. Under fail-fast, a non-ok aggregate
/// status halts the scan.
pub struct ParallelShards {
    shards: Vec<Option<Box<dyn JobSource>>>,
    collector: ShardCollector,
    on_error: OnError,
    cursor: usize,
    made_progress: bool,
}

impl ParallelShards {
    fn new(shards: Vec<Option<Box<dyn JobSource>>>, collector: ShardCollector, on_error: OnError) -> Self {
        Self {
            shards,
            collector,
            on_error,
            cursor: 0,
            made_progress: false,
        }
    }

    fn restart_scan(&mut self) {
        self.cursor = 0;
        self.made_progress = false;
    }
}

impl JobSource for ParallelShards {
    fn pull_next(&mut self) -> Result<JobPoll, WorkflowError> {
        loop {
            if self.collector.is_finished() {
                return Ok(JobPoll::Finished);
            }
            if self.cursor >= self.shards.len() {
                let progressed = self.made_progress;
                self.restart_scan();
                if !progressed {
                    return Ok(JobPoll::Stalled);
                }
                continue;
            }
            if self.on_error == OnError::Stop && !self.collector.status().is_terminal_ok() {
                self.restart_scan();
                return Ok(JobPoll::Stalled);
            }

            let index = self.cursor;
            if self.collector.shard_done(index) {
                // Completed shard; release its producer.
                self.shards[index] = None;
            }
            let Some(shard) = self.shards[index].as_mut() else {
                self.cursor += 1;
                continue;
            };
            match shard.pull_next() {
                Ok(JobPoll::Ready(job)) => {
                    self.made_progress = true;
                    return Ok(JobPoll::Ready(job));
                }
                Ok(JobPoll::Stalled) => {
                    if self.made_progress {
                        self.restart_scan();
                    } else {
                        self.cursor += 1;
                    }
                }
                Ok(JobPoll::Finished) => {
                    self.shards[index] = None;
                    if self.made_progress {
                        self.restart_scan();
                    } else {
                        self.cursor += 1;
                    }
                }
                Err(err) => {
                    error!(shard = index, error = %err, "cannot make scatter job");
                    self.shards[index] = None;
                    self.collector.receive(index, ValueMap::new(), ProcessStatus::PermanentFail);
                    self.cursor += 1;
                }
            }
        }
    }
}

fn axis_len(joborder: &ValueMap, key: &str) -> Result<usize, WorkflowError> {
    joborder
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::len)
        .ok_or_else(|| WorkflowError::Validation(format!("scatter input '{key}' is not an array")))
}

fn shard_order(joborder: &ValueMap, key: &str, index: usize) -> ValueMap {
    let mut shard = joborder.clone();
    let element = joborder
        .get(key)
        .and_then(Value::as_array)
        .and_then(|items| items.get(index))
        .cloned()
        .unwrap_or(Value::Null);
    shard.insert(key.to_string(), element);
    shard
}

fn output_ids(process: &dyn Process) -> Vec<String> {
    process.outputs().iter().map(|parameter| parameter.id.clone()).collect()
}

/// Dispatches a leaf shard: the post-scatter hook runs first, and a `None`
/// result completes the shard as skipped without producing jobs.
fn leaf_shard(
    process: &Rc<dyn Process>,
    shard: ValueMap,
    hook: &PostScatterHook,
    collector: &ShardCollector,
    index: usize,
    ctx: &RuntimeContext,
) -> Result<Option<Box<dyn JobSource>>, WorkflowError> {
    match hook(shard)? {
        Some(evaluated) => Ok(Some(process.job(evaluated, collector.curried(index), ctx)?)),
        None => {
            collector.curried(index)(ValueMap::new(), ProcessStatus::Skipped);
            Ok(None)
        }
    }
}

/// Pairwise scatter over equal-length arrays.
pub fn dotproduct(
    process: Rc<dyn Process>,
    joborder: ValueMap,
    scatter_keys: &[String],
    hook: PostScatterHook,
    callback: OutputCallback,
    ctx: &RuntimeContext,
) -> Result<Box<dyn JobSource>, WorkflowError> {
    let mut length = None;
    for key in scatter_keys {
        let len = axis_len(&joborder, key)?;
        match length {
            None => length = Some(len),
            Some(expected) if expected != len => return Err(WorkflowError::ScatterLengthMismatch),
            Some(_) => {}
        }
    }
    let length = length.ok_or_else(|| WorkflowError::Validation("scatter requires at least one axis".to_string()))?;

    let collector = ShardCollector::new(output_ids(process.as_ref()), length, callback);
    let mut shards = Vec::with_capacity(length);
    for index in 0..length {
        let mut shard = joborder.clone();
        for key in scatter_keys {
            let element = joborder[key.as_str()].as_array().and_then(|items| items.get(index)).cloned();
            shard.insert(key.clone(), element.unwrap_or(Value::Null));
        }
        shards.push(leaf_shard(&process, shard, &hook, &collector, index, ctx)?);
    }
    collector.seal_total(length);
    Ok(Box::new(ParallelShards::new(shards, collector, ctx.on_error)))
}

/// Cross-product scatter whose output nests once per axis.
pub fn nested_crossproduct(
    process: Rc<dyn Process>,
    joborder: ValueMap,
    scatter_keys: &[String],
    hook: PostScatterHook,
    callback: OutputCallback,
    ctx: &RuntimeContext,
) -> Result<Box<dyn JobSource>, WorkflowError> {
    let key = &scatter_keys[0];
    let length = axis_len(&joborder, key)?;

    let collector = ShardCollector::new(output_ids(process.as_ref()), length, callback);
    let mut shards = Vec::with_capacity(length);
    for index in 0..length {
        let shard = shard_order(&joborder, key, index);
        if scatter_keys.len() == 1 {
            shards.push(leaf_shard(&process, shard, &hook, &collector, index, ctx)?);
        } else {
            shards.push(Some(nested_crossproduct(
                Rc::clone(&process),
                shard,
                &scatter_keys[1..],
                Rc::clone(&hook),
                collector.curried(index),
                ctx,
            )?));
        }
    }
    collector.seal_total(length);
    Ok(Box::new(ParallelShards::new(shards, collector, ctx.on_error)))
}

fn crossproduct_size(joborder: &ValueMap, scatter_keys: &[String]) -> Result<usize, WorkflowError> {
    let length = axis_len(joborder, &scatter_keys[0])?;
    if scatter_keys.len() == 1 {
        return Ok(length);
    }
    let mut total = 0;
    for _ in 0..length {
        total += crossproduct_size(joborder, &scatter_keys[1..])?;
    }
    Ok(total)
}

/// Cross-product scatter flattened into one output level.
pub fn flat_crossproduct(
    process: Rc<dyn Process>,
    joborder: ValueMap,
    scatter_keys: &[String],
    hook: PostScatterHook,
    callback: OutputCallback,
    ctx: &RuntimeContext,
) -> Result<Box<dyn JobSource>, WorkflowError> {
    let total = crossproduct_size(&joborder, scatter_keys)?;
    let collector = ShardCollector::new(output_ids(process.as_ref()), total, callback);
    let (shards, placed) = flat_crossproduct_shards(&process, &joborder, scatter_keys, &hook, &collector, 0, ctx)?;
    collector.seal_total(placed);
    Ok(Box::new(ParallelShards::new(shards, collector, ctx.on_error)))
}

type ShardList = Vec<Option<Box<dyn JobSource>>>;

fn flat_crossproduct_shards(
    process: &Rc<dyn Process>,
    joborder: &ValueMap,
    scatter_keys: &[String],
    hook: &PostScatterHook,
    collector: &ShardCollector,
    start_index: usize,
    ctx: &RuntimeContext,
) -> Result<(ShardList, usize), WorkflowError> {
    let key = &scatter_keys[0];
    let length = axis_len(joborder, key)?;
    let mut shards = ShardList::new();
    let mut put = start_index;
    for index in 0..length {
        let shard = shard_order(joborder, key, index);
        if scatter_keys.len() == 1 {
            shards.push(leaf_shard(process, shard, hook, collector, put, ctx)?);
            put += 1;
        } else {
            let (nested, next) = flat_crossproduct_shards(process, &shard, &scatter_keys[1..], hook, collector, put, ctx)?;
            put = next;
            shards.extend(nested);
        }
    }
    Ok((shards, put))
}

/// Logs the empty-axis notice; the caller still builds the (zero-shard)
/// scatter so all outputs come back as empty arrays with success.
pub fn warn_on_empty_axes(step_name: &str, joborder: &ValueMap, scatter_keys: &[String]) {
    let empty: Vec<&str> = scatter_keys
        .iter()
        .filter(|key| {
            joborder
                .get(key.as_str())
                .and_then(Value::as_array)
                .is_some_and(Vec::is_empty)
        })
        .map(|key| crate::value::shortname(key))
        .collect();
    if !empty.is_empty() {
        warn!(
            step = %step_name,
            inputs = %empty.join("', '"),
            "scattering over empty input; all outputs will be empty"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RuntimeContext;
    use crate::process::{CallbackJob, OnceSource};
    use conflux_types::{Parameter, SchemaType};
    use serde_json::json;
    use std::cell::RefCell;

    /// Test process multiplying `a * b`, reporting under `product/out`.
    struct MultiplyProcess {
        inputs: Vec<Parameter>,
        outputs: Vec<Parameter>,
    }

    impl MultiplyProcess {
        fn new() -> Self {
            Self {
                inputs: vec![
                    Parameter::new("product/a", SchemaType::name("int")),
                    Parameter::new("product/b", SchemaType::name("int")),
                ],
                outputs: vec![Parameter::new("product/out", SchemaType::name("int"))],
            }
        }
    }

    impl Process for MultiplyProcess {
        fn inputs(&self) -> &[Parameter] {
            &self.inputs
        }

        fn outputs(&self) -> &[Parameter] {
            &self.outputs
        }

        fn job(
            &self,
            joborder: ValueMap,
            callback: OutputCallback,
            _ctx: &RuntimeContext,
        ) -> Result<Box<dyn JobSource>, WorkflowError> {
            let a = joborder["product/a"].as_i64().unwrap_or(0);
            let b = joborder["product/b"].as_i64().unwrap_or(0);
            let mut outputs = ValueMap::new();
            outputs.insert("product/out".to_string(), json!(a * b));
            Ok(Box::new(OnceSource::new(Box::new(CallbackJob::new(
                "multiply",
                callback,
                outputs,
                ProcessStatus::Success,
            )))))
        }
    }

    fn identity_hook() -> PostScatterHook {
        Rc::new(|io| Ok(Some(io)))
    }

    fn capture() -> (Rc<RefCell<Option<(ValueMap, ProcessStatus)>>>, OutputCallback) {
        let cell: Rc<RefCell<Option<(ValueMap, ProcessStatus)>>> = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&cell);
        let callback: OutputCallback = Rc::new(move |outputs, status| {
            *sink.borrow_mut() = Some((outputs, status));
        });
        (cell, callback)
    }

    fn drain(mut source: Box<dyn JobSource>, ctx: &RuntimeContext) {
        loop {
            match source.pull_next().expect("pull") {
                JobPoll::Ready(mut job) => job.run(ctx).expect("run job"),
                JobPoll::Stalled => panic!("scatter stalled with inline execution"),
                JobPoll::Finished => break,
            }
        }
    }

    fn order(pairs: &[(&str, Value)]) -> ValueMap {
        pairs.iter().map(|(key, value)| (key.to_string(), value.clone())).collect()
    }

    #[test]
    fn dotproduct_pairs_equal_length_axes() {
        let process: Rc<dyn Process> = Rc::new(MultiplyProcess::new());
        let (result, callback) = capture();
        let ctx = RuntimeContext::default();
        let joborder = order(&[("product/a", json!([1, 2, 3])), ("product/b", json!([10, 20, 30]))]);
        let keys = vec!["product/a".to_string(), "product/b".to_string()];

        let source = dotproduct(process, joborder, &keys, identity_hook(), callback, &ctx).expect("build scatter");
        drain(source, &ctx);

        let (outputs, status) = result.borrow_mut().take().expect("collector fired");
        assert_eq!(status, ProcessStatus::Success);
        assert_eq!(outputs.get("product/out"), Some(&json!([10, 40, 90])));
    }

    #[test]
    fn dotproduct_rejects_mismatched_lengths() {
        let process: Rc<dyn Process> = Rc::new(MultiplyProcess::new());
        let (_, callback) = capture();
        let ctx = RuntimeContext::default();
        let joborder = order(&[("product/a", json!([1, 2, 3])), ("product/b", json!([10, 20]))]);
        let keys = vec!["product/a".to_string(), "product/b".to_string()];

        let error = dotproduct(process, joborder, &keys, identity_hook(), callback, &ctx).expect_err("must fail");
        assert!(matches!(error, WorkflowError::ScatterLengthMismatch));
    }

    #[test]
    fn nested_crossproduct_nests_once_per_axis() {
        let process: Rc<dyn Process> = Rc::new(MultiplyProcess::new());
        let (result, callback) = capture();
        let ctx = RuntimeContext::default();
        let joborder = order(&[("product/a", json!([1, 2])), ("product/b", json!([10, 20, 30]))]);
        let keys = vec!["product/a".to_string(), "product/b".to_string()];

        let source = nested_crossproduct(process, joborder, &keys, identity_hook(), callback, &ctx).expect("build scatter");
        drain(source, &ctx);

        let (outputs, status) = result.borrow_mut().take().expect("collector fired");
        assert_eq!(status, ProcessStatus::Success);
        assert_eq!(outputs.get("product/out"), Some(&json!([[10, 20, 30], [20, 40, 60]])));
    }

    #[test]
    fn flat_crossproduct_produces_one_level() {
        let process: Rc<dyn Process> = Rc::new(MultiplyProcess::new());
        let (result, callback) = capture();
        let ctx = RuntimeContext::default();
        let joborder = order(&[("product/a", json!([1, 2])), ("product/b", json!([10, 20, 30]))]);
        let keys = vec!["product/a".to_string(), "product/b".to_string()];

        let source = flat_crossproduct(process, joborder, &keys, identity_hook(), callback, &ctx).expect("build scatter");
        drain(source, &ctx);

        let (outputs, status) = result.borrow_mut().take().expect("collector fired");
        assert_eq!(status, ProcessStatus::Success);
        assert_eq!(outputs.get("product/out"), Some(&json!([10, 20, 30, 20, 40, 60])));
    }

    #[test]
    fn empty_axis_completes_immediately_with_empty_outputs() {
        let process: Rc<dyn Process> = Rc::new(MultiplyProcess::new());
        let (result, callback) = capture();
        let ctx = RuntimeContext::default();
        let joborder = order(&[("product/a", json!([])), ("product/b", json!([]))]);
        let keys = vec!["product/a".to_string(), "product/b".to_string()];

        let source = dotproduct(process, joborder, &keys, identity_hook(), callback, &ctx).expect("build scatter");
        drain(source, &ctx);

        let (outputs, status) = result.borrow_mut().take().expect("collector fired");
        assert_eq!(status, ProcessStatus::Success);
        assert_eq!(outputs.get("product/out"), Some(&json!([])));
    }

    #[test]
    fn skipping_hook_yields_null_slots_and_single_callback() {
        let process: Rc<dyn Process> = Rc::new(MultiplyProcess::new());
        let fired: Rc<RefCell<Vec<(ValueMap, ProcessStatus)>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&fired);
        let callback: OutputCallback = Rc::new(move |outputs, status| sink.borrow_mut().push((outputs, status)));
        let ctx = RuntimeContext::default();
        let joborder = order(&[("product/a", json!([1, 2])), ("product/b", json!([5, 5]))]);
        let keys = vec!["product/a".to_string(), "product/b".to_string()];

        // Skip every shard: the collector must still fire exactly once.
        let hook: PostScatterHook = Rc::new(|_| Ok(None));
        let source = dotproduct(process, joborder, &keys, hook, callback, &ctx).expect("build scatter");
        drain(source, &ctx);

        let calls = fired.borrow();
        assert_eq!(calls.len(), 1, "collector fired more than once");
        let (outputs, status) = &calls[0];
        assert_eq!(*status, ProcessStatus::Skipped);
        assert_eq!(outputs.get("product/out"), Some(&json!([null, null])));
    }

    #[test]
    fn shard_failure_escalates_the_aggregate_status() {
        struct FailSecondProcess(MultiplyProcess);

        impl Process for FailSecondProcess {
            fn inputs(&self) -> &[Parameter] {
                self.0.inputs()
            }

            fn outputs(&self) -> &[Parameter] {
                self.0.outputs()
            }

            fn job(
                &self,
                joborder: ValueMap,
                callback: OutputCallback,
                ctx: &RuntimeContext,
            ) -> Result<Box<dyn JobSource>, WorkflowError> {
                if joborder["product/a"] == json!(2) {
                    let job = CallbackJob::new("fail", callback, ValueMap::new(), ProcessStatus::PermanentFail);
                    return Ok(Box::new(OnceSource::new(Box::new(job))));
                }
                self.0.job(joborder, callback, ctx)
            }
        }

        let process: Rc<dyn Process> = Rc::new(FailSecondProcess(MultiplyProcess::new()));
        let (result, callback) = capture();
        let ctx = RuntimeContext {
            on_error: OnError::Continue,
            ..Default::default()
        };
        let joborder = order(&[("product/a", json!([1, 2, 3])), ("product/b", json!([10, 10, 10]))]);
        let keys = vec!["product/a".to_string()];

        let source = dotproduct(process, joborder, &keys, identity_hook(), callback, &ctx).expect("build scatter");
        drain(source, &ctx);

        let (outputs, status) = result.borrow_mut().take().expect("collector fired");
        assert_eq!(status, ProcessStatus::PermanentFail);
        assert_eq!(outputs.get("product/out"), Some(&json!([10, null, 30])));
    }
}
