use async_trait::async_trait;
use hostpool_domain::{Value, ValueType};
use hostpool_query::{OpKind, ParamDescriptor, ParameterMap};
use hostpool_store::MachineHandle;

use crate::error::InspectError;
use crate::inspector::Inspector;
use crate::shell::RemoteShell;

/// Free-form machine tags. Nothing to observe remotely; the inspector only
/// guarantees the field exists.
pub struct TagInspector;

#[async_trait]
impl Inspector for TagInspector {
    fn name(&self) -> &'static str {
        "tag"
    }

    fn parameters(&self) -> ParameterMap {
        [(
            "tags".to_string(),
            ParamDescriptor::new(ValueType::StrList)
                .ops([OpKind::Bare, OpKind::Eq, OpKind::In])
                .describe("Tag the machine for easier managing."),
        )]
        .into_iter()
        .collect()
    }

    async fn inspect(
        &self,
        machine: &mut MachineHandle,
        _shell: &dyn RemoteShell,
    ) -> Result<(), InspectError> {
        machine
            .set_default_now("tags", Value::StrList(Vec::new()))
            .await?;
        Ok(())
    }
}
