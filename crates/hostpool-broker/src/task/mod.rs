pub mod inspect;
pub mod provision;
pub mod reserve;
pub mod teardown;

pub use inspect::InspectTask;
pub use provision::ProvisionTask;
pub use reserve::ReserveTask;
pub use teardown::TeardownTask;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hostpool_domain::{Machine, MachineStatus, Query, TaskDescriptor, TaskKind, TaskStatus};
use hostpool_store::{MachineHandle, MachineStore, StoreError, UpdateDoc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::TaskError;

/// Everything a task routine gets to work with. The machines are owned by
/// the task for its whole lifetime; other parties coordinate through the
/// store.
pub struct TaskCtx {
    pub uuid: Uuid,
    pub query: Query,
    pub machines: Vec<MachineHandle>,
    pub cancel: CancellationToken,
    pub store: Arc<dyn MachineStore>,
}

/// A task variety: the forward routine, the restart-resumption routine, and
/// the hooks around them.
///
/// Hook order is strictly `on_start` → routine → `on_success` (on Ok), with
/// every machine side-effect durable before the engine detaches the task
/// descriptor. Failures anywhere mark every owned machine failed.
#[async_trait]
pub trait TaskBody: Send + Sync + 'static {
    fn kind(&self) -> TaskKind;

    /// Runs synchronously inside [`TaskEngine::start`], before the routine
    /// is spawned. `resumed` is true when the task was rebuilt from stored
    /// descriptors; state already written before the restart must not be
    /// reapplied.
    async fn on_start(&self, _ctx: &mut TaskCtx, _resumed: bool) -> Result<(), TaskError> {
        Ok(())
    }

    async fn routine(&self, ctx: &mut TaskCtx) -> Result<(), TaskError>;

    /// Body used when the task is reconstructed after a restart.
    async fn resume(&self, ctx: &mut TaskCtx) -> Result<(), TaskError> {
        self.routine(ctx).await
    }

    async fn on_success(&self, _ctx: &mut TaskCtx) -> Result<(), TaskError> {
        Ok(())
    }

    /// Whether this task may not share a machine with `other`. All tasks are
    /// exclusive unless a variety overrides this.
    fn conflict_with(&self, _other: TaskKind) -> bool {
        true
    }
}

/// Handle to an in-flight task.
pub struct TaskEntry {
    pub uuid: Uuid,
    pub kind: TaskKind,
    pub query: Query,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

impl TaskEntry {
    /// Request the routine to abort at its next suspension point.
    /// Idempotent; does not itself mutate machine state.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until the task has fully settled (hooks ran, descriptors
    /// detached).
    pub async fn wait(&self) {
        let mut done = self.done.clone();
        if *done.borrow() {
            return;
        }
        while done.changed().await.is_ok() {
            if *done.borrow() {
                return;
            }
        }
    }
}

/// The process-wide table of in-flight tasks.
///
/// The in-machine descriptors are the durable truth; this table only tracks
/// the live routines so they can be cancelled and awaited.
pub struct TaskEngine {
    store: Arc<dyn MachineStore>,
    tasks: Mutex<HashMap<Uuid, Arc<TaskEntry>>>,
}

impl TaskEngine {
    pub fn new(store: Arc<dyn MachineStore>) -> Arc<TaskEngine> {
        Arc::new(TaskEngine {
            store,
            tasks: Mutex::new(HashMap::new()),
        })
    }

    pub fn get(&self, uuid: &Uuid) -> Option<Arc<TaskEntry>> {
        self.tasks.lock().expect("task table poisoned").get(uuid).cloned()
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.tasks.lock().expect("task table poisoned").contains_key(uuid)
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().expect("task table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The live task entries attached to a machine. Descriptors whose task
    /// no longer exists in this process are dropped from the stored record.
    pub async fn live_tasks(&self, machine: &Machine) -> Vec<Arc<TaskEntry>> {
        let mut live = Vec::new();
        let mut dead = Vec::new();
        for uuid in machine.tasks.keys() {
            match self.get(uuid) {
                Some(entry) => live.push(entry),
                None => dead.push(*uuid),
            }
        }
        if !dead.is_empty() {
            let mut update = UpdateDoc::default();
            for uuid in &dead {
                error!(machine = %machine.magic, task = %uuid, "dropping dead task descriptor");
                update = update.unset(format!("tasks.{}", uuid));
            }
            if let Err(e) = self
                .store
                .atomic_update(&hostpool_store::Ident::Magic(machine.magic.clone()), &update)
                .await
            {
                warn!(machine = %machine.magic, error = %e, "failed to drop dead task descriptors");
            }
        }
        live
    }

    /// Run a task over a set of machines.
    ///
    /// Attaches the descriptor to every machine (skipping ones that already
    /// carry it, which keeps restarts idempotent), runs `on_start`
    /// synchronously, then spawns the routine. The returned entry can be
    /// awaited or cancelled; the broker decides which.
    pub async fn start(
        self: &Arc<Self>,
        body: Arc<dyn TaskBody>,
        machines: Vec<MachineHandle>,
        query: Query,
        resume_from: Option<Uuid>,
    ) -> Result<Arc<TaskEntry>, TaskError> {
        let resumed = resume_from.is_some();
        let uuid = resume_from.unwrap_or_else(Uuid::new_v4);
        let kind = body.kind();
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);

        let mut ctx = TaskCtx {
            uuid,
            query: query.clone(),
            machines,
            cancel: cancel.clone(),
            store: self.store.clone(),
        };

        // Registered before the first await so a concurrent reader never
        // mistakes this task's descriptors for dead ones.
        let entry = Arc::new(TaskEntry {
            uuid,
            kind,
            query: query.clone(),
            cancel,
            done: done_rx,
        });
        self.tasks
            .lock()
            .expect("task table poisoned")
            .insert(uuid, entry.clone());

        let descriptor = TaskDescriptor {
            kind,
            status: TaskStatus::Running,
            query,
        };
        let startup: Result<(), TaskError> = 'setup: {
            for machine in &mut ctx.machines {
                if let Err(e) = machine.stage_attach_task(uuid, &descriptor) {
                    break 'setup Err(e.into());
                }
                if let Err(e) = machine.save().await {
                    break 'setup Err(e.into());
                }
            }
            debug!(task = %uuid, kind = %kind, machines = ctx.machines.len(), resumed, "task starting");
            body.on_start(&mut ctx, resumed).await
        };
        if let Err(e) = startup {
            warn!(task = %uuid, error = %e, "task failed during startup");
            for machine in &mut ctx.machines {
                machine.stage_detach_task(&uuid);
                if let Err(save_err) = machine.save().await {
                    warn!(machine = %machine.magic(), error = %save_err, "failed to detach task");
                }
            }
            self.tasks.lock().expect("task table poisoned").remove(&uuid);
            let _ = done_tx.send(true);
            return Err(e);
        }

        let engine = self.clone();
        tokio::spawn(async move {
            let result = if resumed {
                body.resume(&mut ctx).await
            } else {
                body.routine(&mut ctx).await
            };
            let result = match result {
                Ok(()) => body.on_success(&mut ctx).await,
                Err(e) => Err(e),
            };

            match &result {
                Ok(()) => info!(task = %uuid, kind = %kind, "task succeeded"),
                Err(e) => {
                    warn!(task = %uuid, kind = %kind, error = %e, "task failed");
                    for machine in &mut ctx.machines {
                        if machine.status() == MachineStatus::Deleted {
                            continue;
                        }
                        if let Err(store_err) = machine.mark_failed(&e.to_string()).await {
                            error!(
                                machine = %machine.magic(),
                                error = %store_err,
                                "failed to mark machine failed"
                            );
                        }
                    }
                }
            }

            // All machine side-effects are durable; now drop ownership.
            for machine in &mut ctx.machines {
                if machine.status() == MachineStatus::Deleted {
                    continue;
                }
                machine.stage_detach_task(&uuid);
                match machine.save().await {
                    Ok(()) => {}
                    Err(StoreError::Conflict(_)) => {}
                    Err(e) => {
                        error!(machine = %machine.magic(), error = %e, "failed to detach task")
                    }
                }
            }
            engine.tasks.lock().expect("task table poisoned").remove(&uuid);
            let _ = done_tx.send(true);
            debug!(task = %uuid, "task done and removed");
        });

        Ok(entry)
    }
}
