use std::collections::BTreeSet;

use hostpool_domain::ValueType;
use serde_json::json;
use tracing::error;

use crate::error::QueryError;
use crate::params::{
    ModuleKind, OpKind, ParamDescriptor, ParamSource, ParameterMap,
};

/// Merged parameter schema contributed by the pipeline itself, inspectors,
/// provisioners and tasks. Built once at broker construction; the merge
/// enforces cross-module consistency.
#[derive(Debug, Default)]
pub struct ParameterRegistry {
    parameters: ParameterMap,
}

impl ParameterRegistry {
    /// A registry pre-seeded with the pipeline-intrinsic parameters.
    pub fn with_intrinsics() -> ParameterRegistry {
        let mut registry = ParameterRegistry::default();
        let intrinsics: ParameterMap = [
            (
                "count".to_string(),
                ParamDescriptor::new(ValueType::Int)
                    .bare_only()
                    .default_value(1i64)
                    .describe("How many machines the request applies to."),
            ),
            (
                "magic".to_string(),
                ParamDescriptor::new(ValueType::Str)
                    .ops([OpKind::Bare, OpKind::Eq, OpKind::In])
                    .describe(
                        "Stable opaque machine identifier. The literals 'new' and \
                         'noprovision' alter request-deduplication behaviour.",
                    ),
            ),
            (
                "reserve-duration".to_string(),
                ParamDescriptor::new(ValueType::Int)
                    .bare_only()
                    .default_value(86400i64)
                    .describe("How long a reservation holds the machine, in seconds."),
            ),
            (
                "lifetime".to_string(),
                ParamDescriptor::new(ValueType::Int)
                    .bare_only()
                    .describe(
                        "Require the machine to stay valid at least this many seconds \
                         from now.",
                    ),
            ),
        ]
        .into_iter()
        .collect();
        registry
            .merge(ModuleKind::Pipeline, "pipeline", &intrinsics)
            .expect("intrinsic parameters are consistent");
        registry
    }

    /// Field names consumed by the pipeline before a query reaches the
    /// store. `lifetime` is consumed by the core inspector's filter rewrite.
    pub fn intrinsic_fields() -> &'static [&'static str] {
        &["count", "reserve-duration", "lifetime"]
    }

    /// Merge one module's declarations into the registry.
    ///
    /// Rules:
    /// - `value_type` must agree; a conflict rejects that parameter (logged),
    ///   the rest of the module still registers.
    /// - `ops` union within the same module kind; across kinds the superset
    ///   wins when one side contains the other, and an empty intersection is
    ///   fatal.
    /// - `default`/`description` are first-writer-wins unless the later
    ///   declaration sets the override flag.
    pub fn merge(
        &mut self,
        kind: ModuleKind,
        module: &str,
        declarations: &ParameterMap,
    ) -> Result<(), QueryError> {
        for (name, incoming) in declarations {
            let source = ParamSource {
                kind,
                module: module.to_string(),
            };

            let Some(existing) = self.parameters.get_mut(name) else {
                let mut descriptor = incoming.clone();
                descriptor.sources = vec![source];
                self.parameters.insert(name.clone(), descriptor);
                continue;
            };

            if existing.value_type != incoming.value_type {
                error!(
                    parameter = %name,
                    existing = existing.value_type.name(),
                    incoming = incoming.value_type.name(),
                    module = %module,
                    "conflicting parameter type; declaration rejected"
                );
                continue;
            }

            existing.ops = merge_ops(
                name,
                existing.ops.as_ref(),
                existing.sources.iter().any(|s| s.kind == kind),
                incoming.ops.as_ref(),
            )?;

            if incoming.override_meta || existing.default.is_none() {
                if incoming.default.is_some() {
                    existing.default = incoming.default.clone();
                }
            }
            if incoming.override_meta || existing.description.is_empty() {
                if !incoming.description.is_empty() {
                    existing.description = incoming.description;
                }
            }
            existing.sources.push(source);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ParamDescriptor> {
        self.parameters.get(name)
    }

    pub fn parameters(&self) -> &ParameterMap {
        &self.parameters
    }

    /// The public parameter schema served by `/parameters`.
    pub fn schema(&self) -> serde_json::Value {
        let mut out = serde_json::Map::new();
        for (name, descriptor) in &self.parameters {
            let ops: serde_json::Value = match &descriptor.ops {
                None => serde_json::Value::Null,
                Some(ops) => json!(ops
                    .iter()
                    .map(|op| format!("{:?}", op).to_lowercase())
                    .collect::<Vec<_>>()),
            };
            let default = descriptor.default.as_ref().map(|d| match d {
                crate::params::ParamDefault::Value(v) => {
                    serde_json::to_value(v).unwrap_or(serde_json::Value::Null)
                }
                crate::params::ParamDefault::Derived(_) => json!("function"),
            });
            out.insert(
                name.clone(),
                json!({
                    "type": descriptor.value_type.name(),
                    "ops": ops,
                    "default": default,
                    "description": descriptor.description,
                    "source": descriptor
                        .sources
                        .iter()
                        .map(|s| json!({"kind": s.kind.to_string(), "name": s.module}))
                        .collect::<Vec<_>>(),
                }),
            );
        }
        serde_json::Value::Object(out)
    }
}

fn merge_ops(
    name: &str,
    existing: Option<&BTreeSet<OpKind>>,
    same_kind: bool,
    incoming: Option<&BTreeSet<OpKind>>,
) -> Result<Option<BTreeSet<OpKind>>, QueryError> {
    match (existing, incoming) {
        (None, None) => Ok(None),
        (Some(a), None) => Ok(Some(a.clone())),
        (None, Some(b)) => Ok(Some(b.clone())),
        (Some(a), Some(b)) => {
            if same_kind {
                return Ok(Some(a.union(b).copied().collect()));
            }
            if a.is_subset(b) {
                Ok(Some(b.clone()))
            } else if b.is_subset(a) {
                Ok(Some(a.clone()))
            } else if a.intersection(b).next().is_none() {
                Err(QueryError::Config(format!(
                    "parameter '{}' declared with disjoint operator sets",
                    name
                )))
            } else {
                // Overlapping but incomparable; keep the union and flag it.
                error!(
                    parameter = %name,
                    "operator sets overlap without containment; using the union"
                );
                Ok(Some(a.union(b).copied().collect()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostpool_domain::Value;

    fn decl(value_type: ValueType, ops: &[OpKind]) -> ParamDescriptor {
        ParamDescriptor::new(value_type).ops(ops.iter().copied())
    }

    #[test]
    fn intrinsics_always_present() {
        let registry = ParameterRegistry::with_intrinsics();
        assert!(registry.get("count").is_some());
        assert!(registry.get("magic").is_some());
        assert!(registry.get("reserve-duration").is_some());
        assert!(registry.get("lifetime").is_some());
    }

    #[test]
    fn same_kind_ops_union() {
        let mut registry = ParameterRegistry::default();
        let a: ParameterMap = [("p".to_string(), decl(ValueType::Int, &[OpKind::Eq]))]
            .into_iter()
            .collect();
        let b: ParameterMap = [("p".to_string(), decl(ValueType::Int, &[OpKind::Gte]))]
            .into_iter()
            .collect();
        registry.merge(ModuleKind::Inspector, "cpu", &a).unwrap();
        registry.merge(ModuleKind::Inspector, "numa", &b).unwrap();
        let ops = registry.get("p").unwrap().ops.clone().unwrap();
        assert!(ops.contains(&OpKind::Eq) && ops.contains(&OpKind::Gte));
    }

    #[test]
    fn cross_kind_superset_wins() {
        let mut registry = ParameterRegistry::default();
        let inspector: ParameterMap = [(
            "p".to_string(),
            decl(ValueType::Int, &[OpKind::Eq, OpKind::Gte, OpKind::Lte]),
        )]
        .into_iter()
        .collect();
        let provisioner: ParameterMap =
            [("p".to_string(), decl(ValueType::Int, &[OpKind::Eq]))]
                .into_iter()
                .collect();
        registry
            .merge(ModuleKind::Inspector, "memory", &inspector)
            .unwrap();
        registry
            .merge(ModuleKind::Provisioner, "lab", &provisioner)
            .unwrap();
        let ops = registry.get("p").unwrap().ops.clone().unwrap();
        assert_eq!(ops.len(), 3);
    }

    #[test]
    fn cross_kind_disjoint_ops_fatal() {
        let mut registry = ParameterRegistry::default();
        let a: ParameterMap = [("p".to_string(), decl(ValueType::Int, &[OpKind::Eq]))]
            .into_iter()
            .collect();
        let b: ParameterMap = [("p".to_string(), decl(ValueType::Int, &[OpKind::Gte]))]
            .into_iter()
            .collect();
        registry.merge(ModuleKind::Inspector, "a", &a).unwrap();
        assert!(registry.merge(ModuleKind::Provisioner, "b", &b).is_err());
    }

    #[test]
    fn type_conflict_rejects_parameter_keeps_first() {
        let mut registry = ParameterRegistry::default();
        let a: ParameterMap = [("p".to_string(), decl(ValueType::Int, &[OpKind::Eq]))]
            .into_iter()
            .collect();
        let b: ParameterMap = [("p".to_string(), decl(ValueType::Str, &[OpKind::Eq]))]
            .into_iter()
            .collect();
        registry.merge(ModuleKind::Inspector, "a", &a).unwrap();
        registry.merge(ModuleKind::Inspector, "b", &b).unwrap();
        assert_eq!(registry.get("p").unwrap().value_type, ValueType::Int);
        assert_eq!(registry.get("p").unwrap().sources.len(), 1);
    }

    #[test]
    fn default_is_first_writer_wins_without_override() {
        let mut registry = ParameterRegistry::default();
        let a: ParameterMap = [(
            "p".to_string(),
            ParamDescriptor::new(ValueType::Int).default_value(1i64),
        )]
        .into_iter()
        .collect();
        let b: ParameterMap = [(
            "p".to_string(),
            ParamDescriptor::new(ValueType::Int).default_value(2i64),
        )]
        .into_iter()
        .collect();
        registry.merge(ModuleKind::Inspector, "a", &a).unwrap();
        registry.merge(ModuleKind::Inspector, "b", &b).unwrap();
        match registry.get("p").unwrap().default.as_ref().unwrap() {
            crate::params::ParamDefault::Value(v) => assert_eq!(v, &Value::Int(1)),
            other => panic!("unexpected default {:?}", other),
        }
    }

    #[test]
    fn schema_lists_sources() {
        let registry = ParameterRegistry::with_intrinsics();
        let schema = registry.schema();
        assert_eq!(schema["count"]["type"], "int");
        assert_eq!(schema["count"]["source"][0]["kind"], "pipeline");
    }
}
