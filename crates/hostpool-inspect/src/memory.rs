use async_trait::async_trait;
use hostpool_domain::ValueType;
use hostpool_query::{OpKind, ParamDescriptor, ParameterMap};
use hostpool_store::MachineHandle;

use crate::error::InspectError;
use crate::inspector::Inspector;
use crate::shell::RemoteShell;

/// Total memory, from `/proc/meminfo`.
pub struct MemoryInspector;

#[async_trait]
impl Inspector for MemoryInspector {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn parameters(&self) -> ParameterMap {
        [(
            "memory-total_size".to_string(),
            ParamDescriptor::new(ValueType::Int)
                .ops([OpKind::Bare, OpKind::Eq, OpKind::Gte, OpKind::Lte])
                .describe("Memory size in MB."),
        )]
        .into_iter()
        .collect()
    }

    async fn inspect(
        &self,
        machine: &mut MachineHandle,
        shell: &dyn RemoteShell,
    ) -> Result<(), InspectError> {
        let output = shell.run("cat /proc/meminfo").await?;
        let total_kb = output
            .kv_lines()
            .get("MemTotal")
            .and_then(|v| v.trim_end_matches(" kB").trim().parse::<i64>().ok())
            .ok_or_else(|| InspectError::Command {
                command: "cat /proc/meminfo".to_string(),
                message: "no parsable MemTotal in output".to_string(),
            })?;
        machine
            .set_now("memory-total_size", total_kb / 1024)
            .await?;
        Ok(())
    }
}
