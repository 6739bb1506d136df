use async_trait::async_trait;
use hostpool_domain::{Query, Term, Value, ValueType};
use hostpool_query::{OpKind, ParamDescriptor, ParameterMap};
use hostpool_store::MachineHandle;

use crate::error::InspectError;
use crate::inspector::{flat_filter, Inspector};
use crate::shell::RemoteShell;

/// CPU identity and feature flags, from `lscpu`.
pub struct CpuInspector;

impl CpuInspector {
    /// Turn the 1G-hugepage convenience knob into the cpu flag that actually
    /// implements it.
    fn rewrite_hugepage(query: &mut Query) {
        let wants_hugepage = query
            .plain("hugepage-1g")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if query.remove("hugepage-1g").is_none() || !wants_hugepage {
            return;
        }
        let mut flags = match query.remove("cpu-flags") {
            Some(Term::Value(Value::StrList(flags))) => flags,
            Some(Term::Value(Value::Str(flag))) => vec![flag],
            _ => Vec::new(),
        };
        if !flags.iter().any(|f| f == "pdpe1gb") {
            flags.push("pdpe1gb".to_string());
        }
        query.insert("cpu-flags", Term::Value(Value::StrList(flags)));
    }
}

#[async_trait]
impl Inspector for CpuInspector {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn parameters(&self) -> ParameterMap {
        [
            (
                "cpu-arch".to_string(),
                ParamDescriptor::new(ValueType::Str)
                    .ops([OpKind::Bare, OpKind::Eq, OpKind::In])
                    .describe("CPU architecture, e.g. x86_64, aarch64."),
            ),
            (
                "cpu-vendor".to_string(),
                ParamDescriptor::new(ValueType::Str)
                    .ops([OpKind::Bare, OpKind::Eq, OpKind::In])
                    .describe("CPU vendor: Intel, AMD, IBM."),
            ),
            (
                "cpu-model".to_string(),
                ParamDescriptor::new(ValueType::Str)
                    .ops([OpKind::Bare, OpKind::Eq, OpKind::In])
                    .describe("CPU model, a code name like sandybridge or an integer id."),
            ),
            (
                "cpu-flags".to_string(),
                ParamDescriptor::new(ValueType::StrList)
                    .ops([OpKind::Bare, OpKind::Eq, OpKind::In])
                    .describe("CPU feature flags the machine must have."),
            ),
            (
                "hugepage-1g".to_string(),
                ParamDescriptor::new(ValueType::Bool)
                    .bare_only()
                    .describe("Require 1G hugepage support (the pdpe1gb cpu flag)."),
            ),
        ]
        .into_iter()
        .collect()
    }

    async fn inspect(
        &self,
        machine: &mut MachineHandle,
        shell: &dyn RemoteShell,
    ) -> Result<(), InspectError> {
        let output = shell.run("lscpu").await?;
        let fields = output.kv_lines();
        let missing = |key: &str| InspectError::Command {
            command: "lscpu".to_string(),
            message: format!("no '{}' in output", key),
        };

        let arch = fields.get("Architecture").ok_or_else(|| missing("Architecture"))?;
        machine.set_now("cpu-arch", arch.as_str()).await?;
        if let Some(vendor) = fields.get("Vendor ID") {
            machine.set_now("cpu-vendor", vendor.as_str()).await?;
        }
        if let Some(model) = fields.get("Model") {
            machine.set_now("cpu-model", model.as_str()).await?;
        }
        if let Some(flags) = fields.get("Flags") {
            let flags: Vec<String> = flags.split_whitespace().map(str::to_string).collect();
            machine.set_now("cpu-flags", flags).await?;
        }
        Ok(())
    }

    fn hard_filter(&self, query: &Query) -> Query {
        let mut query = query.clone();
        Self::rewrite_hugepage(&mut query);
        flat_filter(&self.parameters(), &query)
    }

    fn provision_filter(&self, mut query: Query) -> Query {
        Self::rewrite_hugepage(&mut query);
        query
    }
}
