use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hostpool_domain::{MachineStatus, TaskKind};
use hostpool_provision::ProvisionerRegistry;
use hostpool_store::MachineHandle;
use tracing::{error, warn};

use crate::error::TaskError;
use crate::task::{TaskBody, TaskCtx};

const TEARDOWN_ATTEMPTS: u32 = 5;

/// Releases machines back to their providers, then deletes the records.
///
/// Machines are grouped by provisioner and each group torn down through its
/// own back end; a group whose provider keeps rejecting the teardown leaves
/// its machines `failed` for the dead sweep.
pub struct TeardownTask {
    provisioners: Arc<ProvisionerRegistry>,
}

impl TeardownTask {
    pub fn new(provisioners: Arc<ProvisionerRegistry>) -> TeardownTask {
        TeardownTask { provisioners }
    }
}

#[async_trait]
impl TaskBody for TeardownTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Teardown
    }

    async fn on_start(&self, ctx: &mut TaskCtx, _resumed: bool) -> Result<(), TaskError> {
        for machine in &mut ctx.machines {
            if machine.status() == MachineStatus::Teardown {
                continue;
            }
            let _ = machine.stage_status(MachineStatus::Teardown);
            if let Err(e) = machine.save().await {
                // Typically a failed record without a hostname; it still
                // gets deleted below.
                warn!(machine = %machine.magic(), error = %e, "could not enter teardown status");
            }
        }
        Ok(())
    }

    async fn routine(&self, ctx: &mut TaskCtx) -> Result<(), TaskError> {
        // Group per provisioner; the groups own the handles until every
        // provider call is done, then the context takes them back.
        let mut groups: BTreeMap<String, Vec<MachineHandle>> = BTreeMap::new();
        for machine in std::mem::take(&mut ctx.machines) {
            let provisioner = machine
                .machine()
                .provisioner
                .clone()
                .unwrap_or_default();
            groups.entry(provisioner).or_default().push(machine);
        }

        let mut failed_provider = None;
        for (name, group) in groups.iter_mut() {
            if name.is_empty() {
                // Never provisioned; nothing to release externally.
                continue;
            }
            let Some(provisioner) = self.provisioners.get(name) else {
                error!(provisioner = %name, "no such provisioner registered; deleting records anyway");
                continue;
            };

            let mut delay = Duration::from_secs(1);
            let mut succeeded = false;
            for attempt in 1..=TEARDOWN_ATTEMPTS {
                match provisioner.teardown(group, &ctx.query).await {
                    Ok(()) => {
                        succeeded = true;
                        break;
                    }
                    Err(e) => {
                        warn!(
                            provisioner = %name,
                            attempt,
                            error = %e,
                            "teardown rejected, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
            if !succeeded {
                failed_provider = Some(name.clone());
                break;
            }
        }

        ctx.machines = groups.into_values().flatten().collect();
        if let Some(name) = failed_provider {
            return Err(TaskError::Teardown(name));
        }

        for machine in &mut ctx.machines {
            machine.delete().await?;
        }
        Ok(())
    }
}
