use hostpool_domain::Query;
use hostpool_query::ParameterRegistry;

use crate::inspector::InspectorSet;

/// Compose the store query for a sanitised request.
///
/// Each inspector contributes its `hard_filter`; the sub-queries merge
/// field-wise. Fields no inspector claims pass through verbatim, except the
/// pipeline intrinsics, which are consumed before the store sees them.
pub fn compose_hard_filter(inspectors: &InspectorSet, query: &Query) -> Query {
    let mut composed = Query::new();
    for inspector in inspectors.iter() {
        composed.merge(inspector.hard_filter(query));
    }

    let claimed = inspectors.claimed_fields();
    for (field, term) in query.iter() {
        if composed.contains(field)
            || claimed.iter().any(|c| c == field)
            || ParameterRegistry::intrinsic_fields().contains(&field.as_str())
        {
            continue;
        }
        composed.insert(field.clone(), term.clone());
    }
    composed
}

/// Run the query through every inspector's `provision_filter`, in
/// registration order, before provisioner selection.
pub fn apply_provision_filters(inspectors: &InspectorSet, query: Query) -> Query {
    inspectors
        .iter()
        .fold(query, |query, inspector| inspector.provision_filter(query))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspector::default_inspectors;
    use hostpool_domain::{Op, Term, Value};

    #[test]
    fn intrinsics_never_reach_the_store() {
        let mut q = Query::new();
        q.insert("count", Term::Value(Value::Int(2)));
        q.insert("reserve-duration", Term::Value(Value::Int(600)));
        q.insert("cpu-arch", Term::Value(Value::Str("x86_64".into())));
        let filter = compose_hard_filter(&default_inspectors(), &q);
        assert!(!filter.contains("count"));
        assert!(!filter.contains("reserve-duration"));
        assert!(filter.contains("cpu-arch"));
    }

    #[test]
    fn unclaimed_fields_pass_through() {
        let mut q = Query::new();
        q.insert("status", Term::Value(Value::Str("ready".into())));
        q.insert("magic", Term::Value(Value::Str("abc".into())));
        let filter = compose_hard_filter(&default_inspectors(), &q);
        assert_eq!(filter.plain_str("status"), Some("ready"));
        assert_eq!(filter.plain_str("magic"), Some("abc"));
    }

    #[test]
    fn whiteboard_is_filtered_by_nobody() {
        let mut q = Query::new();
        q.insert("whiteboard", Term::Value(Value::Str("mine".into())));
        let filter = compose_hard_filter(&default_inspectors(), &q);
        // Claimed by the meta inspector, whose filter is empty on purpose.
        assert!(!filter.contains("whiteboard"));
    }

    #[test]
    fn composition_is_commutative_for_disjoint_inspectors() {
        let mut q = Query::new();
        q.insert("cpu-arch", Term::Value(Value::Str("x86_64".into())));
        q.insert("memory-total_size", Term::op(Op::Gte, Value::Int(8192)));
        q.insert("disk-number", Term::op(Op::Gte, Value::Int(2)));

        let forward = compose_hard_filter(&default_inspectors(), &q);

        let mut reversed = InspectorSet::new();
        reversed
            .register(std::sync::Arc::new(crate::meta::MetaInspector))
            .register(std::sync::Arc::new(crate::tag::TagInspector))
            .register(std::sync::Arc::new(crate::numa::NumaInspector))
            .register(std::sync::Arc::new(crate::disk::DiskInspector))
            .register(std::sync::Arc::new(crate::memory::MemoryInspector))
            .register(std::sync::Arc::new(crate::cpu::CpuInspector))
            .register(std::sync::Arc::new(crate::core::CoreInspector));
        let backward = compose_hard_filter(&reversed, &q);

        assert_eq!(forward, backward);
    }
}
