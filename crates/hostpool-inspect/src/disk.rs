use async_trait::async_trait;
use hostpool_domain::ValueType;
use hostpool_query::{OpKind, ParamDescriptor, ParameterMap};
use hostpool_store::MachineHandle;

use crate::error::InspectError;
use crate::inspector::Inspector;
use crate::shell::RemoteShell;

/// Physical disk count and total capacity, from `lsblk`.
pub struct DiskInspector;

#[async_trait]
impl Inspector for DiskInspector {
    fn name(&self) -> &'static str {
        "disk"
    }

    fn parameters(&self) -> ParameterMap {
        [
            (
                "disk-total_size".to_string(),
                ParamDescriptor::new(ValueType::Int)
                    .ops([OpKind::Bare, OpKind::Eq, OpKind::Gte, OpKind::Lte])
                    .describe("Disk total size in MB."),
            ),
            (
                "disk-number".to_string(),
                ParamDescriptor::new(ValueType::Int)
                    .ops([OpKind::Bare, OpKind::Eq, OpKind::Gte, OpKind::Lte])
                    .describe("Physical disk count."),
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
        // TYPE then SIZE in bytes, one device per line.
        let output = shell.run("lsblk -b -d -n -o TYPE,SIZE").await?;
        let mut count = 0i64;
        let mut total_bytes = 0i64;
        for line in output.stdout.lines() {
            let mut parts = line.split_whitespace();
            let (Some(kind), Some(size)) = (parts.next(), parts.next()) else {
                continue;
            };
            if kind != "disk" {
                continue;
            }
            let Ok(bytes) = size.parse::<i64>() else {
                continue;
            };
            count += 1;
            total_bytes += bytes;
        }
        machine
            .set_now("disk-total_size", total_bytes / (1024 * 1024))
            .await?;
        machine.set_now("disk-number", count).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::{ExecOutput, RemoteExec, ScriptedExec};
    use hostpool_domain::{Query, Value};
    use hostpool_store::{MachineStore, MemoryStore};
    use std::sync::Arc;

    #[tokio::test]
    async fn sums_disks_and_ignores_partitions() {
        let store = Arc::new(MemoryStore::new());
        let mut handle = hostpool_store::MachineHandle::create(store.clone());
        handle.stage("hostname", "h1").unwrap();
        handle.save().await.unwrap();

        let exec = ScriptedExec::new(vec![(
            "lsblk".to_string(),
            ExecOutput::ok("disk 107374182400\npart 1073741824\ndisk 53687091200\n"),
        )]);
        let shell = exec.connect("h1").await.unwrap();
        DiskInspector.inspect(&mut handle, shell.as_ref()).await.unwrap();

        let stored = store.find_one(&Query::new()).await.unwrap().unwrap();
        assert_eq!(stored.field("disk-number"), Some(Value::Int(2)));
        assert_eq!(
            stored.field("disk-total_size"),
            Some(Value::Int((107374182400i64 + 53687091200) / (1024 * 1024)))
        );
    }
}
