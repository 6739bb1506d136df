use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hostpool_domain::{MachineStatus, Op, Query, TaskKind, Term, Value};
use hostpool_provision::ProvisionerRegistry;
use hostpool_store::{Ident, MachineHandle, MachineStore};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::BrokerError;
use crate::task::{TaskEngine, TeardownTask};

/// Periodic pool hygiene: tears down expired machines and reaps orphans
/// whose owning task died before cleanup.
pub struct HouseKeeper {
    store: Arc<dyn MachineStore>,
    engine: Arc<TaskEngine>,
    provisioners: Arc<ProvisionerRegistry>,
    interval: Duration,
}

impl HouseKeeper {
    pub fn new(
        store: Arc<dyn MachineStore>,
        engine: Arc<TaskEngine>,
        provisioners: Arc<ProvisionerRegistry>,
        interval: Duration,
    ) -> HouseKeeper {
        HouseKeeper {
            store,
            engine,
            provisioners,
            interval,
        }
    }

    /// Start both sweeps on independent jittered timers. They stop when the
    /// token fires.
    pub fn spawn(self: &Arc<Self>, cancel: &CancellationToken) {
        let keeper = self.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(jittered(keeper.interval)) => {}
                }
                if let Err(e) = keeper.expiry_sweep().await {
                    warn!(error = %e, "expiry sweep failed");
                }
            }
        });

        let keeper = self.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(jittered(keeper.interval)) => {}
                }
                if let Err(e) = keeper.dead_sweep().await {
                    warn!(error = %e, "dead sweep failed");
                }
            }
        });
    }

    /// Tear down every machine whose `expire_time` has passed. Waits for the
    /// batch up to one sweep interval, then leaves the rest to finish
    /// asynchronously.
    pub async fn expiry_sweep(&self) -> Result<usize, BrokerError> {
        let mut query = Query::new();
        query.insert("expire_time", Term::op(Op::Lte, Value::Time(Utc::now())));
        let machines = self.store.find_all(&query, None).await?;

        let mut entries = Vec::new();
        for machine in machines {
            if machine
                .tasks
                .values()
                .any(|d| d.kind == TaskKind::Teardown)
            {
                continue;
            }
            info!(machine = %machine.magic, hostname = ?machine.hostname, "machine expired");
            let handle = MachineHandle::attach(self.store.clone(), machine);
            let body = Arc::new(TeardownTask::new(self.provisioners.clone()));
            match self
                .engine
                .start(body, vec![handle], Query::new(), None)
                .await
            {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(error = %e, "failed to start teardown for expired machine"),
            }
        }

        let started = entries.len();
        let deadline = tokio::time::Instant::now() + self.interval;
        for entry in entries {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            let _ = tokio::time::timeout(remaining, entry.wait()).await;
        }
        Ok(started)
    }

    /// Delete machines that no task owns and that are not serving the pool.
    /// These are orphans left behind by a crashed task.
    pub async fn dead_sweep(&self) -> Result<usize, BrokerError> {
        let machines = self.store.find_all(&Query::new(), None).await?;
        let mut reaped = 0;
        for machine in machines {
            if !machine.tasks.is_empty() || machine.status == MachineStatus::Ready {
                continue;
            }
            info!(
                machine = %machine.magic,
                status = %machine.status,
                "reaping dead machine"
            );
            self.store
                .delete(&Ident::Magic(machine.magic.clone()))
                .await?;
            reaped += 1;
        }
        Ok(reaped)
    }
}

fn jittered(interval: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..=interval.as_millis().max(1) as u64 / 10);
    interval + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use hostpool_store::MemoryStore;

    fn keeper(store: Arc<MemoryStore>) -> (Arc<HouseKeeper>, Arc<TaskEngine>) {
        let store: Arc<dyn MachineStore> = store;
        let engine = TaskEngine::new(store.clone());
        let mut registry = ProvisionerRegistry::new();
        registry.register(Arc::new(hostpool_provision::LocalProvisioner::new()));
        let keeper = Arc::new(HouseKeeper::new(
            store,
            engine.clone(),
            Arc::new(registry),
            Duration::from_secs(60),
        ));
        (keeper, engine)
    }

    async fn insert_machine(
        store: &Arc<MemoryStore>,
        status: MachineStatus,
        expired: bool,
    ) -> String {
        let mut handle = MachineHandle::create(store.clone() as Arc<dyn MachineStore>);
        handle.stage("hostname", "h1.example.com").unwrap();
        handle.stage("provisioner", "local").unwrap();
        handle
            .stage("start_time", Utc::now() - ChronoDuration::seconds(7200))
            .unwrap();
        handle.stage("lifespan", 3600i64).unwrap();
        let expire = if expired {
            Utc::now() - ChronoDuration::seconds(3600)
        } else {
            Utc::now() + ChronoDuration::seconds(3600)
        };
        handle.stage("expire_time", expire).unwrap();
        handle.stage_status(status).unwrap();
        handle.save().await.unwrap();
        handle.magic().to_string()
    }

    #[tokio::test]
    async fn expiry_sweep_tears_down_expired_machines() {
        let store = Arc::new(MemoryStore::new());
        let (keeper, engine) = keeper(store.clone());

        insert_machine(&store, MachineStatus::Ready, true).await;
        insert_machine(&store, MachineStatus::Ready, false).await;

        let started = keeper.expiry_sweep().await.unwrap();
        assert_eq!(started, 1);
        // The sweep waited for the batch; the expired machine is gone.
        assert!(engine.is_empty());
        let remaining = store.find_all(&Query::new(), None).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].status, MachineStatus::Ready);
    }

    #[tokio::test]
    async fn dead_sweep_reaps_orphans_only() {
        let store = Arc::new(MemoryStore::new());
        let (keeper, _engine) = keeper(store.clone());

        insert_machine(&store, MachineStatus::Failed, false).await;
        let ready = insert_machine(&store, MachineStatus::Ready, false).await;

        let reaped = keeper.dead_sweep().await.unwrap();
        assert_eq!(reaped, 1);
        let remaining = store.find_all(&Query::new(), None).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].magic, ready);
    }

    #[tokio::test]
    async fn dead_sweep_never_touches_owned_machines() {
        let store = Arc::new(MemoryStore::new());
        let (keeper, _engine) = keeper(store.clone());

        let mut handle = MachineHandle::create(store.clone() as Arc<dyn MachineStore>);
        handle.stage_status(MachineStatus::Failed).unwrap();
        handle
            .stage_attach_task(
                uuid::Uuid::new_v4(),
                &hostpool_domain::TaskDescriptor {
                    kind: TaskKind::Provision,
                    status: hostpool_domain::TaskStatus::Running,
                    query: Query::new(),
                },
            )
            .unwrap();
        handle.save().await.unwrap();

        let reaped = keeper.dead_sweep().await.unwrap();
        assert_eq!(reaped, 0);
        assert_eq!(store.find_all(&Query::new(), None).await.unwrap().len(), 1);
    }
}
