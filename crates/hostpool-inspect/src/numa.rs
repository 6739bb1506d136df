use async_trait::async_trait;
use hostpool_domain::ValueType;
use hostpool_query::{OpKind, ParamDescriptor, ParameterMap};
use hostpool_store::MachineHandle;

use crate::error::InspectError;
use crate::inspector::Inspector;
use crate::shell::RemoteShell;

/// NUMA topology, from `lscpu`.
pub struct NumaInspector;

#[async_trait]
impl Inspector for NumaInspector {
    fn name(&self) -> &'static str {
        "numa"
    }

    fn parameters(&self) -> ParameterMap {
        [(
            "numa-node_number".to_string(),
            ParamDescriptor::new(ValueType::Int)
                .ops([OpKind::Bare, OpKind::Eq, OpKind::Gte, OpKind::Lte])
                .describe("How many NUMA nodes the machine has."),
        )]
        .into_iter()
        .collect()
    }

    async fn inspect(
        &self,
        machine: &mut MachineHandle,
        shell: &dyn RemoteShell,
    ) -> Result<(), InspectError> {
        let output = shell.run("lscpu").await?;
        if let Some(nodes) = output
            .kv_lines()
            .get("NUMA node(s)")
            .and_then(|v| v.parse::<i64>().ok())
        {
            machine.set_now("numa-node_number", nodes).await?;
        }
        Ok(())
    }
}
