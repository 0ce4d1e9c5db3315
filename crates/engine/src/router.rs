//! Value routing between state and parameter lists.
//!
//! [`resolve`] is the single entry point: given the current state map and a
//! parameter list, it either produces a fully bound input object, reports
//! *not ready* (some upstream value is still unset), or fails with a wiring
//! error. It is pure — the state map is never mutated — so the driver can
//! poll it every round without side effects.

use serde_json::Value;

use conflux_types::{LinkMerge, Parameter, PickValue, SchemaType, can_assign};

use crate::error::WorkflowError;
use crate::state::{StateEntry, WorkflowState, WorkflowStateItem};
use crate::value::{ValueMap, shortname};

/// Which transport list a resolution reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceField {
    /// Step inputs read `source`.
    Source,
    /// Workflow outputs read `outputSource`.
    OutputSource,
}

impl SourceField {
    fn of<'a>(self, parameter: &'a Parameter) -> &'a [String] {
        match self {
            SourceField::Source => &parameter.source,
            SourceField::OutputSource => &parameter.output_source,
        }
    }
}

/// Knobs for one resolution pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions {
    /// Include unset and non-ok sources instead of reporting not-ready.
    /// Used for final output collection on quiescence.
    pub allow_partial: bool,
    /// `MultipleInputFeatureRequirement` is declared.
    pub supports_multiple: bool,
    /// Key the result by parameter short names (workflow outputs).
    pub shorten_ids: bool,
}

/// Resolves `parameters` against `state`.
///
/// Returns `Ok(None)` when some source is not yet produced and
/// `allow_partial` is off. Never mutates `state`.
pub fn resolve(
    state: &WorkflowState,
    parameters: &[Parameter],
    source_field: SourceField,
    options: ResolveOptions,
) -> Result<Option<ValueMap>, WorkflowError> {
    let mut bound = ValueMap::new();

    for parameter in parameters {
        let iid = if options.shorten_ids {
            shortname(&parameter.id).to_string()
        } else {
            parameter.id.clone()
        };

        let connections = source_field.of(parameter);
        if !connections.is_empty() {
            if connections.len() > 1 && !options.supports_multiple {
                return Err(WorkflowError::MultipleInputsUnsupported {
                    sink: parameter.id.clone(),
                });
            }
            // An undeclared policy on a multi-source sink merges nested.
            let link_merge = parameter.link_merge.or_else(|| {
                if connections.len() > 1 {
                    Some(LinkMerge::MergeNested)
                } else {
                    None
                }
            });

            for source in connections {
                match state.entry(source) {
                    StateEntry::Unknown => {
                        return Err(WorkflowError::UnknownSource {
                            source_name: source.clone(),
                            sink: parameter.id.clone(),
                        });
                    }
                    StateEntry::Unset => {
                        if !options.allow_partial {
                            return Ok(None);
                        }
                    }
                    StateEntry::Bound(item) => {
                        if item.status.is_terminal_ok() || options.allow_partial {
                            let matched = match_types(
                                &parameter.schema,
                                &item.parameter.schema,
                                item,
                                &iid,
                                &mut bound,
                                link_merge,
                                parameter.value_from.is_some(),
                            );
                            if !matched {
                                return Err(WorkflowError::TypeMismatch {
                                    source_name: source.clone(),
                                    source_type: describe(&item.parameter.schema),
                                    sink: parameter.id.clone(),
                                    sink_type: describe(&parameter.schema),
                                });
                            }
                        } else {
                            return Ok(None);
                        }
                    }
                }
            }
        }

        if let Some(policy) = parameter.pick_value
            && let Some(Value::Array(merged)) = bound.get(&iid)
        {
            let picked = apply_pick_value(policy, merged, &parameter.id)?;
            bound.insert(iid.clone(), picked);
        }

        if bound.get(&iid).is_none_or(Value::is_null)
            && let Some(default) = &parameter.default
        {
            bound.insert(iid.clone(), default.clone());
        }

        if !bound.contains_key(&iid) {
            if parameter.value_from.is_some() || options.allow_partial {
                bound.insert(iid.clone(), Value::Null);
            } else {
                return Err(WorkflowError::MissingValue(parameter.id.clone()));
            }
        }
    }

    Ok(Some(bound))
}

/// Type-directed merge of one source into the binding under construction.
///
/// Union sinks accept when any arm accepts; union sources accept when any
/// arm can be narrowed against the sink. With a link-merge policy in effect
/// the value lands on a list under `iid`; otherwise assignability (or a
/// pending `valueFrom`, which defers typing) admits a deep copy.
fn match_types(
    sink_type: &SchemaType,
    source_type: &SchemaType,
    item: &WorkflowStateItem,
    iid: &str,
    bound: &mut ValueMap,
    link_merge: Option<LinkMerge>,
    has_value_from: bool,
) -> bool {
    if let SchemaType::Union(arms) = sink_type {
        return arms
            .iter()
            .any(|arm| match_types(arm, source_type, item, iid, bound, link_merge, has_value_from));
    }
    if let SchemaType::Union(arms) = source_type {
        return arms
            .iter()
            .any(|arm| match_types(sink_type, arm, item, iid, bound, link_merge, has_value_from));
    }

    if let Some(policy) = link_merge {
        let slot = bound.entry(iid.to_string()).or_insert_with(|| Value::Array(Vec::new()));
        let Value::Array(list) = slot else {
            return false;
        };
        match policy {
            LinkMerge::MergeNested => list.push(item.value.clone()),
            LinkMerge::MergeFlattened => match &item.value {
                Value::Array(items) => list.extend(items.iter().cloned()),
                other => list.push(other.clone()),
            },
        }
        return true;
    }

    if has_value_from || sink_type.is_any() || can_assign(source_type, sink_type) {
        bound.insert(iid.to_string(), item.value.clone());
        return true;
    }
    false
}

fn apply_pick_value(policy: PickValue, merged: &[Value], sink: &str) -> Result<Value, WorkflowError> {
    match policy {
        PickValue::FirstNonNull => merged
            .iter()
            .find(|value| !value.is_null())
            .cloned()
            .ok_or_else(|| WorkflowError::AllNull(shortname(sink).to_string())),
        PickValue::OnlyNonNull => {
            let mut non_null = merged.iter().filter(|value| !value.is_null());
            let first = non_null
                .next()
                .ok_or_else(|| WorkflowError::AllNull(shortname(sink).to_string()))?;
            if non_null.next().is_some() {
                return Err(WorkflowError::MultipleNonNull {
                    sink: shortname(sink).to_string(),
                    observed: Value::Array(merged.to_vec()).to_string(),
                });
            }
            Ok(first.clone())
        }
        PickValue::AllNonNull => Ok(Value::Array(merged.iter().filter(|value| !value.is_null()).cloned().collect())),
    }
}

fn describe(schema: &SchemaType) -> String {
    serde_json::to_string(schema).unwrap_or_else(|_| "<unprintable>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ProcessStatus;
    use conflux_types::PickValue;
    use serde_json::json;

    fn bound_state(entries: &[(&str, SchemaType, Value)]) -> WorkflowState {
        let mut state = WorkflowState::new();
        for (id, schema, value) in entries {
            state.bind(
                *id,
                WorkflowStateItem::new(Parameter::new(*id, schema.clone()), value.clone(), ProcessStatus::Success),
            );
        }
        state
    }

    fn sink(id: &str, schema: SchemaType, source: &str) -> Parameter {
        Parameter::new(id, schema).with_source(source)
    }

    #[test]
    fn resolves_single_source_by_assignment() {
        let state = bound_state(&[("wf/x", SchemaType::name("int"), json!(7))]);
        let params = vec![sink("wf/step/x", SchemaType::name("int"), "wf/x")];

        let resolved = resolve(&state, &params, SourceField::Source, ResolveOptions::default())
            .expect("resolve")
            .expect("ready");
        assert_eq!(resolved.get("wf/step/x"), Some(&json!(7)));
    }

    #[test]
    fn reports_not_ready_while_a_source_is_unset() {
        let mut state = WorkflowState::new();
        state.declare("wf/pending");
        let params = vec![sink("wf/step/x", SchemaType::name("int"), "wf/pending")];

        let resolved = resolve(&state, &params, SourceField::Source, ResolveOptions::default()).expect("resolve");
        assert!(resolved.is_none());
    }

    #[test]
    fn unknown_sources_are_wiring_errors() {
        let state = WorkflowState::new();
        let params = vec![sink("wf/step/x", SchemaType::name("int"), "wf/ghost")];

        let error = resolve(&state, &params, SourceField::Source, ResolveOptions::default()).expect_err("must fail");
        assert!(matches!(error, WorkflowError::UnknownSource { source_name, .. } if source_name == "wf/ghost"));
    }

    #[test]
    fn type_mismatch_is_reported_with_both_types() {
        let state = bound_state(&[("wf/x", SchemaType::name("string"), json!("seven"))]);
        let params = vec![sink("wf/step/x", SchemaType::name("int"), "wf/x")];

        let error = resolve(&state, &params, SourceField::Source, ResolveOptions::default()).expect_err("must fail");
        assert!(matches!(error, WorkflowError::TypeMismatch { .. }));
    }

    #[test]
    fn value_from_defers_type_checking() {
        let state = bound_state(&[("wf/x", SchemaType::name("string"), json!("seven"))]);
        let mut parameter = sink("wf/step/x", SchemaType::name("int"), "wf/x");
        parameter.value_from = Some("$(self)".to_string());

        let resolved = resolve(&state, &[parameter], SourceField::Source, ResolveOptions::default())
            .expect("resolve")
            .expect("ready");
        assert_eq!(resolved.get("wf/step/x"), Some(&json!("seven")));
    }

    #[test]
    fn multiple_sources_require_the_feature() {
        let state = bound_state(&[
            ("wf/a", SchemaType::name("int"), json!(1)),
            ("wf/b", SchemaType::name("int"), json!(2)),
        ]);
        let mut parameter = sink("wf/step/x", SchemaType::array(SchemaType::name("int")), "wf/a");
        parameter.source.push("wf/b".to_string());

        let error = resolve(&state, &[parameter.clone()], SourceField::Source, ResolveOptions::default()).expect_err("must fail");
        assert!(matches!(error, WorkflowError::MultipleInputsUnsupported { .. }));

        let options = ResolveOptions {
            supports_multiple: true,
            ..Default::default()
        };
        let resolved = resolve(&state, &[parameter], SourceField::Source, options)
            .expect("resolve")
            .expect("ready");
        assert_eq!(resolved.get("wf/step/x"), Some(&json!([1, 2])));
    }

    #[test]
    fn merge_flattened_splices_array_sources() {
        let state = bound_state(&[
            ("wf/a", SchemaType::array(SchemaType::name("int")), json!([1, 2])),
            ("wf/b", SchemaType::name("int"), json!(3)),
        ]);
        let mut parameter = sink("wf/step/x", SchemaType::array(SchemaType::name("int")), "wf/a");
        parameter.source.push("wf/b".to_string());
        parameter.link_merge = Some(LinkMerge::MergeFlattened);

        let options = ResolveOptions {
            supports_multiple: true,
            ..Default::default()
        };
        let resolved = resolve(&state, &[parameter], SourceField::Source, options)
            .expect("resolve")
            .expect("ready");
        assert_eq!(resolved.get("wf/step/x"), Some(&json!([1, 2, 3])));
    }

    #[test]
    fn union_source_narrows_against_the_sink() {
        let union = SchemaType::Union(vec![SchemaType::name("null"), SchemaType::name("int")]);
        let state = bound_state(&[("wf/x", union, json!(5))]);
        let params = vec![sink("wf/step/x", SchemaType::name("int"), "wf/x")];

        let resolved = resolve(&state, &params, SourceField::Source, ResolveOptions::default())
            .expect("resolve")
            .expect("ready");
        assert_eq!(resolved.get("wf/step/x"), Some(&json!(5)));
    }

    #[test]
    fn pick_value_first_non_null_takes_the_first_binding() {
        let state = bound_state(&[
            ("wf/a", SchemaType::name("null"), Value::Null),
            ("wf/b", SchemaType::name("int"), json!(9)),
        ]);
        let mut parameter = sink("wf/step/x", SchemaType::name("int"), "wf/a");
        parameter.source.push("wf/b".to_string());
        parameter.pick_value = Some(PickValue::FirstNonNull);
        // Sink type must admit each source; unions make that explicit.
        parameter.schema = SchemaType::Union(vec![SchemaType::name("null"), SchemaType::name("int")]);

        let options = ResolveOptions {
            supports_multiple: true,
            ..Default::default()
        };
        let resolved = resolve(&state, &[parameter], SourceField::Source, options)
            .expect("resolve")
            .expect("ready");
        assert_eq!(resolved.get("wf/step/x"), Some(&json!(9)));
    }

    #[test]
    fn pick_value_only_non_null_rejects_two_bindings() {
        let state = bound_state(&[
            ("wf/a", SchemaType::name("int"), json!(1)),
            ("wf/b", SchemaType::name("int"), json!(2)),
        ]);
        let mut parameter = sink("wf/step/x", SchemaType::name("int"), "wf/a");
        parameter.source.push("wf/b".to_string());
        parameter.pick_value = Some(PickValue::OnlyNonNull);

        let options = ResolveOptions {
            supports_multiple: true,
            ..Default::default()
        };
        let error = resolve(&state, &[parameter], SourceField::Source, options).expect_err("must fail");
        assert!(matches!(error, WorkflowError::MultipleNonNull { .. }));
    }

    #[test]
    fn pick_value_all_non_null_filters_nulls() {
        let state = bound_state(&[
            ("wf/a", SchemaType::name("null"), Value::Null),
            ("wf/b", SchemaType::name("int"), json!(2)),
        ]);
        let mut parameter = sink("wf/step/x", SchemaType::array(SchemaType::name("int")), "wf/a");
        parameter.source.push("wf/b".to_string());
        parameter.pick_value = Some(PickValue::AllNonNull);

        let options = ResolveOptions {
            supports_multiple: true,
            ..Default::default()
        };
        let resolved = resolve(&state, &[parameter], SourceField::Source, options)
            .expect("resolve")
            .expect("ready");
        assert_eq!(resolved.get("wf/step/x"), Some(&json!([2])));
    }

    #[test]
    fn skipped_sources_fall_back_to_the_sink_default() {
        let mut state = WorkflowState::new();
        state.bind(
            "wf/branch/out",
            WorkflowStateItem::new(
                Parameter::new("wf/branch/out", SchemaType::name("int")),
                Value::Null,
                ProcessStatus::Skipped,
            ),
        );
        let mut parameter = sink("wf/step/x", SchemaType::name("int"), "wf/branch/out");
        parameter.default = Some(json!(42));

        let resolved = resolve(&state, &[parameter], SourceField::Source, ResolveOptions::default())
            .expect("resolve")
            .expect("ready");
        assert_eq!(resolved.get("wf/step/x"), Some(&json!(42)));
    }

    #[test]
    fn missing_value_without_default_or_value_from_is_an_error() {
        let state = WorkflowState::new();
        let params = vec![Parameter::new("wf/step/x", SchemaType::name("int"))];

        let error = resolve(&state, &params, SourceField::Source, ResolveOptions::default()).expect_err("must fail");
        assert!(matches!(error, WorkflowError::MissingValue(id) if id == "wf/step/x"));
    }

    #[test]
    fn allow_partial_binds_null_for_unproduced_sources() {
        let mut state = WorkflowState::new();
        state.declare("wf/late/out");
        let mut parameter = Parameter::new("wf/out", SchemaType::name("int"));
        parameter.output_source.push("wf/late/out".to_string());

        let options = ResolveOptions {
            allow_partial: true,
            shorten_ids: true,
            ..Default::default()
        };
        let resolved = resolve(&state, &[parameter], SourceField::OutputSource, options).expect("resolve");
        assert_eq!(resolved.expect("ready").get("out"), Some(&Value::Null));
    }
}
