use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use hostpool_domain::{Machine, Op, Query, TaskKind, Term, Value};
use hostpool_inspect::{apply_provision_filters, compose_hard_filter, InspectorSet, RemoteExec};
use hostpool_provision::ProvisionerRegistry;
use hostpool_query::{
    parse_json_query, parse_request_args, parse_query, sanitize, ModuleKind, ParameterRegistry,
    QueryError,
};
use hostpool_store::{MachineHandle, MachineStore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::BrokerError;
use crate::housekeeper::HouseKeeper;
use crate::magic::Magic;
use crate::task::{
    InspectTask, ProvisionTask, ReserveTask, TaskBody, TaskEngine, TeardownTask,
};

/// The machine-pool broker: composes the store, the inspector pipeline, the
/// provisioner registry and the task engine into the public operations.
pub struct Broker {
    store: Arc<dyn MachineStore>,
    engine: Arc<TaskEngine>,
    inspectors: Arc<InspectorSet>,
    provisioners: Arc<ProvisionerRegistry>,
    exec: Arc<dyn RemoteExec>,
    parameters: ParameterRegistry,
}

impl Broker {
    /// Wire the broker together and compute the merged parameter schema.
    /// Every inspector and provisioner must be registered before this point.
    pub fn new(
        store: Arc<dyn MachineStore>,
        inspectors: InspectorSet,
        provisioners: ProvisionerRegistry,
        exec: Arc<dyn RemoteExec>,
    ) -> Result<Broker, QueryError> {
        let mut parameters = ParameterRegistry::with_intrinsics();
        for (name, declarations) in inspectors.declarations() {
            parameters.merge(ModuleKind::Inspector, name, &declarations)?;
        }
        for provisioner in provisioners.iter() {
            parameters.merge(
                ModuleKind::Provisioner,
                provisioner.name(),
                &provisioner.parameters(),
            )?;
        }

        Ok(Broker {
            engine: TaskEngine::new(store.clone()),
            store,
            inspectors: Arc::new(inspectors),
            provisioners: Arc::new(provisioners),
            exec,
            parameters,
        })
    }

    pub fn store(&self) -> &Arc<dyn MachineStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<TaskEngine> {
        &self.engine
    }

    /// The public parameter schema, for `/parameters`.
    pub fn parameter_schema(&self) -> serde_json::Value {
        self.parameters.schema()
    }

    /// Name → display map, for `/provisioners`.
    pub fn provisioner_display(&self) -> BTreeMap<String, String> {
        self.provisioners.display()
    }

    /// Compile flat request arguments (URL query string) into a sanitised
    /// query.
    pub fn compile_args<'a, I>(&self, args: I) -> Result<Query, QueryError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let nested = parse_request_args(args)?;
        let mut query = parse_query(&nested)?;
        sanitize(&mut query, self.parameters.parameters())?;
        Ok(query)
    }

    /// Compile a JSON request body into a sanitised query.
    pub fn compile_json(&self, body: &serde_json::Value) -> Result<Query, QueryError> {
        let mut query = parse_json_query(body)?;
        sanitize(&mut query, self.parameters.parameters())?;
        Ok(query)
    }

    fn count(query: &Query) -> usize {
        query.plain_i64("count").unwrap_or(1).max(1) as usize
    }

    async fn find_by_magics(&self, magics: &[String]) -> Result<Vec<Machine>, BrokerError> {
        let mut query = Query::new();
        query.insert(
            "magic",
            Term::op(Op::In, Value::StrList(magics.to_vec())),
        );
        Ok(self.store.find_all(&query, None).await?)
    }

    /// Return the machines matching a sanitised query, via the composed
    /// inspector filter.
    pub async fn query(
        &self,
        query: &Query,
        limit: Option<usize>,
    ) -> Result<Vec<Machine>, BrokerError> {
        let filter = compose_hard_filter(&self.inspectors, query);
        Ok(self.store.find_all(&filter, limit).await?)
    }

    /// Allocate new machines for the query through the cheapest available
    /// provisioner.
    ///
    /// The timeout bounds only the synchronous wait; the provision task
    /// keeps running and the machines are returned in whatever state they
    /// reached.
    pub async fn provision(
        &self,
        query: &Query,
        timeout: Option<Duration>,
        magic: Option<&Magic>,
    ) -> Result<Vec<Machine>, BrokerError> {
        let mut query = query.clone();
        if let Some(magic) = magic {
            if !magic.allow_provision(&query) {
                return Err(BrokerError::ProvisionNotAllowed);
            }
            if let Some(machines) = magic.pre_query(&self.store, &mut query).await? {
                return Ok(machines);
            }
        }

        let count = Self::count(&query);
        let query = apply_provision_filters(&self.inspectors, query);
        let provisioner = self
            .provisioners
            .find_available(&query)
            .ok_or(BrokerError::NoProvisioner)?;
        info!(
            provisioner = provisioner.name(),
            count, "provisioning new machines"
        );

        let mut machines: Vec<MachineHandle> = (0..count)
            .map(|_| MachineHandle::create(self.store.clone()))
            .collect();
        if let Some(magic) = magic {
            magic.pre_provision(&mut machines, &query);
        }
        for machine in &mut machines {
            machine.save().await?;
        }
        let magics: Vec<String> = machines.iter().map(|m| m.magic().to_string()).collect();

        let body = Arc::new(ProvisionTask::new(
            provisioner,
            self.inspectors.clone(),
            self.exec.clone(),
        ));
        let entry = self.engine.start(body, machines, query, None).await?;
        match timeout {
            Some(timeout) => {
                let _ = tokio::time::timeout(timeout, entry.wait()).await;
            }
            None => entry.wait().await,
        }

        self.find_by_magics(&magics).await
    }

    /// Reserve matching machines for `reserve-duration` seconds. Rejects
    /// when any matching machine is already owned by an incompatible task.
    pub async fn reserve(&self, query: &Query) -> Result<Vec<Machine>, BrokerError> {
        let machines = self.query(query, Some(Self::count(query))).await?;
        if machines.is_empty() {
            return Ok(Vec::new());
        }
        for machine in &machines {
            if !self.engine.live_tasks(machine).await.is_empty() {
                return Err(BrokerError::TaskConflict(
                    machine
                        .hostname
                        .clone()
                        .unwrap_or_else(|| machine.magic.clone()),
                ));
            }
        }

        let duration = query
            .plain_i64("reserve-duration")
            .unwrap_or(crate::task::reserve::DEFAULT_RESERVE_DURATION);
        let magics: Vec<String> = machines.iter().map(|m| m.magic.clone()).collect();
        let handles = machines
            .into_iter()
            .map(|m| MachineHandle::attach(self.store.clone(), m))
            .collect();
        let body = Arc::new(ReserveTask::new(
            duration,
            self.inspectors.clone(),
            self.exec.clone(),
        ));
        // Detached: the reservation outlives this request.
        self.engine.start(body, handles, query.clone(), None).await?;

        self.find_by_magics(&magics).await
    }

    /// Cancel the reservations on matching machines. Returns only the
    /// machines that actually had one.
    pub async fn release(&self, query: &Query) -> Result<Vec<Machine>, BrokerError> {
        let machines = self.query(query, None).await?;
        let mut released = Vec::new();
        for machine in machines {
            let mut had_reservation = false;
            for entry in self.engine.live_tasks(&machine).await {
                if entry.kind == TaskKind::Reserve {
                    entry.cancel();
                    had_reservation = true;
                }
            }
            if had_reservation {
                released.push(machine);
            }
        }
        Ok(released)
    }

    /// Cancel everything attached to the matching machines, then tear them
    /// down through their provisioners. Waits for the teardown to settle.
    pub async fn teardown(&self, query: &Query) -> Result<Vec<Machine>, BrokerError> {
        let machines = self.query(query, None).await?;
        if machines.is_empty() {
            return Err(BrokerError::NoMachineMatched);
        }

        for machine in &machines {
            for entry in self.engine.live_tasks(machine).await {
                entry.cancel();
                entry.wait().await;
            }
        }

        // Re-read: the cancelled tasks have finished mutating.
        let magics: Vec<String> = machines.iter().map(|m| m.magic.clone()).collect();
        let current = self.find_by_magics(&magics).await?;
        let handles: Vec<MachineHandle> = current
            .into_iter()
            .map(|m| MachineHandle::attach(self.store.clone(), m))
            .collect();
        if !handles.is_empty() {
            let body = Arc::new(TeardownTask::new(self.provisioners.clone()));
            let entry = self
                .engine
                .start(body, handles, query.clone(), None)
                .await?;
            entry.wait().await;
        }
        Ok(machines)
    }

    /// Query-or-provision-then-reserve: the blocking "just give me a
    /// machine" operation.
    pub async fn request(
        &self,
        query: &Query,
        magic: Option<&Magic>,
    ) -> Result<Vec<Machine>, BrokerError> {
        let mut query = query.clone();
        if let Some(magic) = magic {
            if let Some(machines) = magic.pre_query(&self.store, &mut query).await? {
                return Ok(machines);
            }
        }

        let mut ready_query = query.clone();
        ready_query.insert_default("status", Term::Value(Value::Str("ready".into())));

        let available = self.query(&ready_query, Some(Self::count(&query))).await?;
        if available.is_empty() {
            self.provision(&query, None, magic).await?;
        }
        let reserved = self.reserve(&ready_query).await?;
        Ok(reserved)
    }

    /// Re-run the inspector pipeline over matching machines, detached.
    pub async fn inspect(&self, query: &Query) -> Result<Vec<Machine>, BrokerError> {
        let machines = self.query(query, None).await?;
        if machines.is_empty() {
            return Ok(machines);
        }
        let handles = machines
            .iter()
            .map(|m| MachineHandle::attach(self.store.clone(), m.clone()))
            .collect();
        let body = Arc::new(InspectTask::new(
            self.inspectors.clone(),
            self.exec.clone(),
        ));
        self.engine.start(body, handles, query.clone(), None).await?;
        Ok(machines)
    }

    /// Delete matching machine records outright, without provider teardown.
    pub async fn forget(&self, query: &Query) -> Result<Vec<Machine>, BrokerError> {
        let machines = self.query(query, None).await?;
        for machine in &machines {
            let mut handle = MachineHandle::attach(self.store.clone(), machine.clone());
            handle.delete().await?;
        }
        Ok(machines)
    }

    /// Rebuild and restart every task recorded in machine documents. The
    /// store is the only source; this is the whole restart recovery path.
    pub async fn resume_tasks(&self) -> Result<usize, BrokerError> {
        let machines = self.store.find_all(&Query::new(), None).await?;
        let mut grouped: BTreeMap<Uuid, (TaskKind, Query, Vec<Machine>)> = BTreeMap::new();
        for machine in machines {
            for (uuid, descriptor) in &machine.tasks {
                grouped
                    .entry(*uuid)
                    .or_insert_with(|| (descriptor.kind, descriptor.query.clone(), Vec::new()))
                    .2
                    .push(machine.clone());
            }
        }

        let mut resumed = 0;
        for (uuid, (kind, query, machines)) in grouped {
            if self.engine.contains(&uuid) {
                continue;
            }
            let mut handles: Vec<MachineHandle> = machines
                .iter()
                .map(|m| MachineHandle::attach(self.store.clone(), m.clone()))
                .collect();

            let body: Arc<dyn TaskBody> = match kind {
                TaskKind::Provision => {
                    let provisioner = machines
                        .iter()
                        .find_map(|m| m.provisioner.clone())
                        .and_then(|name| self.provisioners.get(&name));
                    match provisioner {
                        Some(provisioner) => Arc::new(ProvisionTask::new(
                            provisioner,
                            self.inspectors.clone(),
                            self.exec.clone(),
                        )),
                        None => {
                            warn!(task = %uuid, "cannot resume provision task: unknown provisioner");
                            for handle in &mut handles {
                                let _ = handle
                                    .mark_failed("provision task could not be resumed")
                                    .await;
                                handle.stage_detach_task(&uuid);
                                let _ = handle.save().await;
                            }
                            continue;
                        }
                    }
                }
                TaskKind::Inspect => Arc::new(InspectTask::new(
                    self.inspectors.clone(),
                    self.exec.clone(),
                )),
                TaskKind::Reserve => {
                    let duration = query
                        .plain_i64("reserve-duration")
                        .unwrap_or(crate::task::reserve::DEFAULT_RESERVE_DURATION);
                    Arc::new(ReserveTask::new(
                        duration,
                        self.inspectors.clone(),
                        self.exec.clone(),
                    ))
                }
                TaskKind::Teardown => Arc::new(TeardownTask::new(self.provisioners.clone())),
            };

            match self.engine.start(body, handles, query, Some(uuid)).await {
                Ok(_) => {
                    info!(task = %uuid, kind = %kind, "task resumed after restart");
                    resumed += 1;
                }
                Err(e) => warn!(task = %uuid, error = %e, "failed to resume task"),
            }
        }
        Ok(resumed)
    }

    /// Start the house-keeper sweeps with the given interval.
    pub fn spawn_housekeeper(&self, interval: Duration, cancel: &CancellationToken) {
        let keeper = Arc::new(HouseKeeper::new(
            self.store.clone(),
            self.engine.clone(),
            self.provisioners.clone(),
            interval,
        ));
        keeper.spawn(cancel);
    }
}
