use async_trait::async_trait;
use hostpool_domain::{Query, ValueType};
use hostpool_query::{ParamDescriptor, ParameterMap};
use hostpool_store::MachineHandle;

use crate::error::InspectError;
use crate::inspector::Inspector;
use crate::shell::RemoteShell;

/// Whiteboard text attached to machines by their users.
pub struct MetaInspector;

#[async_trait]
impl Inspector for MetaInspector {
    fn name(&self) -> &'static str {
        "meta"
    }

    fn parameters(&self) -> ParameterMap {
        [(
            "whiteboard".to_string(),
            ParamDescriptor::new(ValueType::Str)
                .describe("Additional free-text info for each machine."),
        )]
        .into_iter()
        .collect()
    }

    async fn inspect(
        &self,
        machine: &mut MachineHandle,
        _shell: &dyn RemoteShell,
    ) -> Result<(), InspectError> {
        machine.set_default_now("whiteboard", "").await?;
        Ok(())
    }

    /// Free-form whiteboard text cannot select stored machines; filter
    /// nothing.
    fn hard_filter(&self, _query: &Query) -> Query {
        Query::new()
    }
}
