//! Structural type compatibility between connected ports.
//!
//! `can_assign` answers whether a value of the source type may flow into a
//! sink of the declared type. The rules mirror the authoring language:
//! `"Any"` is a wildcard in either position, a union source matches when any
//! arm can be narrowed against the sink, a union sink matches when any arm
//! accepts the source, arrays and records recurse structurally, and numeric
//! names widen (`int` → `long` → `float` → `double`) but never narrow.

use super::{CompoundType, SchemaType};

/// Returns true when a value of type `src` may be assigned to a sink of
/// type `sink`.
pub fn can_assign(src: &SchemaType, sink: &SchemaType) -> bool {
    if src.is_any() || sink.is_any() {
        return true;
    }
    match (src, sink) {
        (SchemaType::Union(arms), _) => arms.iter().any(|arm| can_assign(arm, sink)),
        (_, SchemaType::Union(arms)) => arms.iter().any(|arm| can_assign(src, arm)),
        (SchemaType::Compound(CompoundType::Array { items: src_items }), SchemaType::Compound(CompoundType::Array { items: sink_items })) => {
            can_assign(src_items, sink_items)
        }
        (
            SchemaType::Compound(CompoundType::Record { fields: src_fields }),
            SchemaType::Compound(CompoundType::Record { fields: sink_fields }),
        ) => sink_fields.iter().all(|(name, sink_field)| {
            src_fields
                .get(name)
                .is_some_and(|src_field| can_assign(src_field, sink_field))
        }),
        (SchemaType::Name(src_name), SchemaType::Name(sink_name)) => src_name == sink_name || widens(src_name, sink_name),
        _ => false,
    }
}

/// Decimal widening order for the numeric names.
fn widens(src: &str, sink: &str) -> bool {
    fn rank(name: &str) -> Option<u8> {
        match name {
            "int" => Some(0),
            "long" => Some(1),
            "float" => Some(2),
            "double" => Some(3),
            _ => None,
        }
    }
    matches!((rank(src), rank(sink)), (Some(src_rank), Some(sink_rank)) if src_rank <= sink_rank)
}
