use std::collections::BTreeMap;

use hostpool_domain::{Query, Term, Value};
use tracing::warn;

use crate::error::QueryError;
use crate::params::{ParamDescriptor, ParameterMap};

/// Sanitise a compiled query in place against a set of parameter
/// declarations.
///
/// - every declared leaf is coerced to its declared type;
/// - an operator the parameter does not allow fails validation;
/// - a bare value is wrapped in `$eq` when the parameter requires an
///   operator;
/// - absent parameters with a default are injected;
/// - undeclared fields pass through untouched, with a warning.
pub fn sanitize(query: &mut Query, parameters: &ParameterMap) -> Result<(), QueryError> {
    let mut sanitized: BTreeMap<String, Term> = BTreeMap::new();

    for (field, term) in std::mem::take(&mut query.0) {
        let Some(descriptor) = parameters.get(&field) else {
            warn!(field = %field, "unknown query parameter passed through");
            sanitized.insert(field, term);
            continue;
        };
        sanitized.insert(field.clone(), sanitize_term(&field, term, descriptor)?);
    }

    // Defaults for declared-but-absent parameters.
    let partial = Query(sanitized);
    let mut result = partial;
    for (name, descriptor) in parameters {
        if result.contains(name) {
            continue;
        }
        if let Some(default) = &descriptor.default {
            let value = default.resolve(&result);
            let term = if descriptor.allows_bare() {
                Term::Value(value)
            } else {
                Term::eq(value)
            };
            result.insert(name.clone(), term);
        }
    }

    *query = result;
    Ok(())
}

fn sanitize_term(
    field: &str,
    term: Term,
    descriptor: &ParamDescriptor,
) -> Result<Term, QueryError> {
    match term {
        Term::Value(value) => {
            let value = coerce(field, value, descriptor)?;
            if descriptor.allows_bare() {
                Ok(Term::Value(value))
            } else {
                Ok(Term::eq(value))
            }
        }
        Term::Ops(ops) => {
            let mut out = BTreeMap::new();
            for (op, value) in ops {
                if !descriptor.allows_op(op) {
                    return Err(QueryError::Validate(format!(
                        "operator {} not allowed for '{}'",
                        op, field
                    )));
                }
                // `$in` compares against a list regardless of the leaf type.
                let value = if op == hostpool_domain::Op::In {
                    match value {
                        Value::StrList(l) => Value::StrList(l),
                        Value::Str(s) => Value::StrList(vec![s]),
                        other => {
                            return Err(QueryError::Validate(format!(
                                "operator $in for '{}' needs a list, got {}",
                                field,
                                other.type_name()
                            )))
                        }
                    }
                } else {
                    coerce(field, value, descriptor)?
                };
                out.insert(op, value);
            }
            Ok(Term::Ops(out))
        }
    }
}

fn coerce(field: &str, value: Value, descriptor: &ParamDescriptor) -> Result<Value, QueryError> {
    descriptor
        .value_type
        .coerce(value)
        .map_err(|e| QueryError::Validate(format!("bad value for '{}': {}", field, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::OpKind;
    use crate::registry::ParameterRegistry;
    use hostpool_domain::{Op, ValueType};

    fn parameters() -> ParameterMap {
        let mut map = ParameterRegistry::with_intrinsics().parameters().clone();
        map.insert(
            "memory-total_size".to_string(),
            ParamDescriptor::new(ValueType::Int).ops([
                OpKind::Eq,
                OpKind::Gte,
                OpKind::Lte,
            ]),
        );
        map.insert(
            "cpu-arch".to_string(),
            ParamDescriptor::new(ValueType::Str).ops([OpKind::Bare, OpKind::Eq, OpKind::In]),
        );
        map
    }

    #[test]
    fn coerces_declared_types() {
        let mut q = Query::new();
        q.insert("memory-total_size", Term::op(Op::Gte, Value::Str("8192".into())));
        sanitize(&mut q, &parameters()).unwrap();
        match q.get("memory-total_size").unwrap() {
            Term::Ops(ops) => assert_eq!(ops.get(&Op::Gte), Some(&Value::Int(8192))),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn wraps_bare_value_when_operator_required() {
        let mut q = Query::new();
        q.insert("memory-total_size", Term::Value(Value::Str("4096".into())));
        sanitize(&mut q, &parameters()).unwrap();
        assert_eq!(
            q.get("memory-total_size").unwrap().as_plain(),
            Some(&Value::Int(4096))
        );
        assert!(matches!(q.get("memory-total_size").unwrap(), Term::Ops(_)));
    }

    #[test]
    fn rejects_disallowed_operator() {
        let mut q = Query::new();
        q.insert("cpu-arch", Term::op(Op::Gt, Value::Str("x86_64".into())));
        assert!(matches!(
            sanitize(&mut q, &parameters()),
            Err(QueryError::Validate(_))
        ));
    }

    #[test]
    fn injects_defaults() {
        let mut q = Query::new();
        sanitize(&mut q, &parameters()).unwrap();
        assert_eq!(q.plain_i64("count"), Some(1));
        assert_eq!(q.plain_i64("reserve-duration"), Some(86400));
        // No default declared for lifetime.
        assert!(!q.contains("lifetime"));
    }

    #[test]
    fn unknown_parameter_passes_through() {
        let mut q = Query::new();
        q.insert("whiteboard-color", Term::Value(Value::Str("blue".into())));
        sanitize(&mut q, &parameters()).unwrap();
        assert_eq!(q.plain_str("whiteboard-color"), Some("blue"));
    }

    #[test]
    fn in_accepts_scalar_as_single_element_list() {
        let mut q = Query::new();
        q.insert("cpu-arch", Term::op(Op::In, Value::Str("x86_64".into())));
        sanitize(&mut q, &parameters()).unwrap();
        match q.get("cpu-arch").unwrap() {
            Term::Ops(ops) => assert_eq!(
                ops.get(&Op::In),
                Some(&Value::StrList(vec!["x86_64".into()]))
            ),
            other => panic!("unexpected {:?}", other),
        }
    }
}
