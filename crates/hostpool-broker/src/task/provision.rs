use std::sync::Arc;

use async_trait::async_trait;
use hostpool_domain::{MachineStatus, TaskKind};
use hostpool_inspect::{perform_check, InspectorSet, RemoteExec};
use hostpool_provision::Provisioner;
use hostpool_query::sanitize;

use crate::error::TaskError;
use crate::task::{TaskBody, TaskCtx};

/// Drives a provisioner to fulfil a query, then inspects and releases the
/// machines as `ready`.
pub struct ProvisionTask {
    provisioner: Arc<dyn Provisioner>,
    inspectors: Arc<InspectorSet>,
    exec: Arc<dyn RemoteExec>,
}

impl ProvisionTask {
    pub fn new(
        provisioner: Arc<dyn Provisioner>,
        inspectors: Arc<InspectorSet>,
        exec: Arc<dyn RemoteExec>,
    ) -> ProvisionTask {
        ProvisionTask {
            provisioner,
            inspectors,
            exec,
        }
    }

    /// Inspect every machine the provisioner produced and release the
    /// healthy ones.
    async fn check_and_release(&self, ctx: &mut TaskCtx) -> Result<(), TaskError> {
        if ctx.cancel.is_cancelled() {
            // A cancelled provision does not release machines; the external
            // job was already cancelled by the provisioner.
            return Err(TaskError::Cancelled);
        }
        for machine in &mut ctx.machines {
            let healthy = perform_check(machine, self.exec.as_ref(), &self.inspectors).await?;
            if healthy && machine.status() != MachineStatus::Failed {
                machine.stage_status(MachineStatus::Ready)?;
                machine.save().await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TaskBody for ProvisionTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Provision
    }

    async fn on_start(&self, ctx: &mut TaskCtx, resumed: bool) -> Result<(), TaskError> {
        if resumed {
            return Ok(());
        }
        for machine in &mut ctx.machines {
            machine.stage("provisioner", self.provisioner.name())?;
            machine.stage_status(MachineStatus::Preparing)?;
            machine.save().await?;
        }
        Ok(())
    }

    async fn routine(&self, ctx: &mut TaskCtx) -> Result<(), TaskError> {
        let mut query = ctx.query.clone();
        sanitize(&mut query, &self.provisioner.parameters())?;
        self.provisioner
            .provision(&mut ctx.machines, &query, &ctx.cancel)
            .await?;
        self.check_and_release(ctx).await
    }

    async fn resume(&self, ctx: &mut TaskCtx) -> Result<(), TaskError> {
        let mut query = ctx.query.clone();
        sanitize(&mut query, &self.provisioner.parameters())?;
        self.provisioner
            .resume(&mut ctx.machines, &query, &ctx.cancel)
            .await?;
        self.check_and_release(ctx).await
    }
}
