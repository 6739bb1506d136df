use std::sync::Arc;

use async_trait::async_trait;
use hostpool_domain::TaskKind;
use hostpool_inspect::{perform_check, InspectorSet, RemoteExec};

use crate::error::TaskError;
use crate::task::{TaskBody, TaskCtx};

/// Re-runs the inspector pipeline over its machines. Status only changes on
/// the failure path, via the inspectors' own handling.
pub struct InspectTask {
    inspectors: Arc<InspectorSet>,
    exec: Arc<dyn RemoteExec>,
}

impl InspectTask {
    pub fn new(inspectors: Arc<InspectorSet>, exec: Arc<dyn RemoteExec>) -> InspectTask {
        InspectTask { inspectors, exec }
    }
}

#[async_trait]
impl TaskBody for InspectTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Inspect
    }

    async fn routine(&self, ctx: &mut TaskCtx) -> Result<(), TaskError> {
        for machine in &mut ctx.machines {
            if ctx.cancel.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            perform_check(machine, self.exec.as_ref(), &self.inspectors).await?;
        }
        Ok(())
    }
}
