use std::sync::Arc;

use async_trait::async_trait;
use hostpool_domain::Query;
use hostpool_query::ParameterMap;
use hostpool_store::MachineHandle;
use tracing::{info, warn};

use crate::error::InspectError;
use crate::shell::{RemoteExec, RemoteShell};

/// A hardware probe: declares the parameters it can observe on a machine,
/// how to select stored machines for them, and how to populate them over a
/// remote shell.
#[async_trait]
pub trait Inspector: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn parameters(&self) -> ParameterMap;

    /// Populate machine attributes from the open shell. Attribute writes go
    /// through the handle's atomic operations so concurrent readers see the
    /// durable post-image.
    async fn inspect(
        &self,
        machine: &mut MachineHandle,
        shell: &dyn RemoteShell,
    ) -> Result<(), InspectError>;

    /// The sub-query selecting already-present machines that satisfy this
    /// inspector's parameters. Pure; defaults to passing through the terms
    /// for every declared parameter.
    fn hard_filter(&self, query: &Query) -> Query {
        flat_filter(&self.parameters(), query)
    }

    /// Rewrite the query before it reaches a provisioner. Pure; defaults to
    /// the identity.
    fn provision_filter(&self, query: Query) -> Query {
        query
    }
}

/// Passthrough filter over an inspector's declared parameters.
pub fn flat_filter(parameters: &ParameterMap, query: &Query) -> Query {
    let mut out = Query::new();
    for name in parameters.keys() {
        if let Some(term) = query.get(name) {
            out.insert(name.clone(), term.clone());
        }
    }
    out
}

/// Every registered inspector, in registration order. The order is the
/// inspection order; the core inspector must be first.
#[derive(Clone, Default)]
pub struct InspectorSet {
    inspectors: Vec<Arc<dyn Inspector>>,
}

impl InspectorSet {
    pub fn new() -> InspectorSet {
        InspectorSet::default()
    }

    pub fn register(&mut self, inspector: Arc<dyn Inspector>) -> &mut Self {
        self.inspectors.push(inspector);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Inspector>> {
        self.inspectors.iter()
    }

    /// Parameter declarations per inspector, for the registry merge.
    pub fn declarations(&self) -> Vec<(&'static str, ParameterMap)> {
        self.inspectors
            .iter()
            .map(|i| (i.name(), i.parameters()))
            .collect()
    }

    /// Every parameter name any inspector declares.
    pub fn claimed_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = self
            .inspectors
            .iter()
            .flat_map(|i| i.parameters().keys().cloned().collect::<Vec<_>>())
            .collect();
        fields.sort();
        fields.dedup();
        fields
    }
}

/// The built-in inspector stack, core first.
pub fn default_inspectors() -> InspectorSet {
    let mut set = InspectorSet::new();
    set.register(Arc::new(crate::core::CoreInspector))
        .register(Arc::new(crate::cpu::CpuInspector))
        .register(Arc::new(crate::memory::MemoryInspector))
        .register(Arc::new(crate::disk::DiskInspector))
        .register(Arc::new(crate::numa::NumaInspector))
        .register(Arc::new(crate::tag::TagInspector))
        .register(Arc::new(crate::meta::MetaInspector));
    set
}

/// Open one fresh shell to the machine and run every inspector in
/// registration order.
///
/// Transport and probe failures mark the machine failed and return
/// `Ok(false)`; they never propagate. Only store errors bubble up.
pub async fn perform_check(
    machine: &mut MachineHandle,
    exec: &dyn RemoteExec,
    inspectors: &InspectorSet,
) -> Result<bool, InspectError> {
    let Some(hostname) = machine.hostname().map(str::to_string) else {
        machine.mark_failed("machine has no hostname to inspect").await?;
        return Ok(false);
    };

    let shell = match exec.connect(&hostname).await {
        Ok(shell) => shell,
        Err(e) => {
            warn!(machine = %machine.magic(), hostname = %hostname, error = %e, "inspection transport failed");
            machine.mark_failed(&e.to_string()).await?;
            return Ok(false);
        }
    };

    for inspector in inspectors.iter() {
        if let Err(e) = inspector.inspect(machine, shell.as_ref()).await {
            match e {
                InspectError::Store(store) => return Err(InspectError::Store(store)),
                other => {
                    warn!(
                        machine = %machine.magic(),
                        inspector = inspector.name(),
                        error = %other,
                        "inspection failed"
                    );
                    machine.mark_failed(&other.to_string()).await?;
                    return Ok(false);
                }
            }
        }
    }
    info!(machine = %machine.magic(), hostname = %hostname, "inspection complete");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::ScriptedExec;
    use hostpool_domain::MachineStatus;
    use hostpool_store::{MachineStore, MemoryStore};

    async fn ready_handle(store: Arc<MemoryStore>) -> MachineHandle {
        let mut handle = MachineHandle::create(store);
        handle.stage("hostname", "h1.example.com").unwrap();
        handle.stage_status(MachineStatus::Preparing).unwrap();
        handle.stage("lifespan", 86400i64).unwrap();
        handle
            .stage("start_time", chrono::Utc::now())
            .unwrap();
        handle.save().await.unwrap();
        handle
    }

    #[tokio::test]
    async fn perform_check_populates_attributes() {
        let store = Arc::new(MemoryStore::new());
        let mut handle = ready_handle(store.clone()).await;
        let exec = ScriptedExec::small_vm();
        let healthy = perform_check(&mut handle, &exec, &default_inspectors())
            .await
            .unwrap();
        assert!(healthy);
        let stored = store
            .find_one(&Query::new())
            .await
            .unwrap()
            .expect("machine present");
        assert_eq!(
            stored.field("cpu-arch"),
            Some(hostpool_domain::Value::Str("x86_64".into()))
        );
        assert_eq!(
            stored.field("memory-total_size"),
            Some(hostpool_domain::Value::Int(16384))
        );
        assert!(stored.expire_time.is_some());
    }

    #[tokio::test]
    async fn transport_failure_marks_failed_without_error() {
        let store = Arc::new(MemoryStore::new());
        let mut handle = ready_handle(store.clone()).await;
        let exec = ScriptedExec::unreachable();
        let healthy = perform_check(&mut handle, &exec, &default_inspectors())
            .await
            .unwrap();
        assert!(!healthy);
        assert_eq!(handle.status(), MachineStatus::Failed);
        assert!(handle.machine().failure_message.is_some());
    }
}
