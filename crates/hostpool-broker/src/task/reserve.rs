use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hostpool_domain::{MachineStatus, TaskKind, Value};
use hostpool_inspect::{perform_check, InspectorSet, RemoteExec};
use tracing::debug;

use crate::error::TaskError;
use crate::task::{TaskBody, TaskCtx};

pub const DEFAULT_RESERVE_DURATION: i64 = 86400;

/// Holds machines `reserved` for a bounded time, then (or on release)
/// re-inspects them and returns them to `ready`.
///
/// `meta.reserve-start_time` is the authoritative reservation clock: resume
/// after a restart recomputes the remaining time from it, independent of
/// when provisioning happened.
pub struct ReserveTask {
    duration: i64,
    inspectors: Arc<InspectorSet>,
    exec: Arc<dyn RemoteExec>,
}

impl ReserveTask {
    pub fn new(
        duration: i64,
        inspectors: Arc<InspectorSet>,
        exec: Arc<dyn RemoteExec>,
    ) -> ReserveTask {
        ReserveTask {
            duration: duration.max(0),
            inspectors,
            exec,
        }
    }

    /// Sleep the given seconds, waking early on release.
    async fn hold(&self, ctx: &TaskCtx, seconds: i64) {
        if seconds <= 0 {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(seconds as u64)) => {
                debug!(task = %ctx.uuid, "reservation elapsed");
            }
            _ = ctx.cancel.cancelled() => {
                debug!(task = %ctx.uuid, "reservation released early");
            }
        }
    }
}

#[async_trait]
impl TaskBody for ReserveTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Reserve
    }

    async fn on_start(&self, ctx: &mut TaskCtx, resumed: bool) -> Result<(), TaskError> {
        if resumed {
            return Ok(());
        }
        for machine in &mut ctx.machines {
            machine.stage("meta.reserve-start_time", Utc::now())?;
            machine.stage_status(MachineStatus::Reserved)?;
            machine.save().await?;
        }
        Ok(())
    }

    async fn routine(&self, ctx: &mut TaskCtx) -> Result<(), TaskError> {
        self.hold(ctx, self.duration).await;
        Ok(())
    }

    async fn resume(&self, ctx: &mut TaskCtx) -> Result<(), TaskError> {
        let started = ctx
            .machines
            .iter()
            .filter_map(|m| {
                m.machine()
                    .field("meta.reserve-start_time")
                    .as_ref()
                    .and_then(Value::as_time)
            })
            .min()
            .unwrap_or_else(Utc::now);
        let elapsed = (Utc::now() - started).num_seconds();
        let remaining = self.duration - elapsed;
        debug!(task = %ctx.uuid, elapsed, remaining, "resuming reservation");
        self.hold(ctx, remaining).await;
        Ok(())
    }

    /// Wake or release: inspect and hand the machines back to the pool.
    async fn on_success(&self, ctx: &mut TaskCtx) -> Result<(), TaskError> {
        for machine in &mut ctx.machines {
            perform_check(machine, self.exec.as_ref(), &self.inspectors).await?;
            if machine.status() == MachineStatus::Failed {
                continue;
            }
            machine.stage_unset("meta.reserve-start_time");
            machine.stage_status(MachineStatus::Ready)?;
            machine.save().await?;
        }
        Ok(())
    }
}
