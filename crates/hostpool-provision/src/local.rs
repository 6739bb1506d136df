use async_trait::async_trait;
use chrono::{Duration, Utc};
use hostpool_domain::{Query, Value, ValueType};
use hostpool_query::{OpKind, ParamDescriptor, ParameterMap};
use hostpool_store::MachineHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ProvisionError;
use crate::provisioner::Provisioner;

const DEFAULT_LIFESPAN: i64 = 86400;

/// A stub provisioner that fulfils queries instantly with synthetic hosts.
///
/// - Hostnames are derived from the machine magic (`local-<prefix>.pool.invalid`).
/// - Requested attributes are echoed back onto the machine so the result
///   matches its own query.
/// - Performs no external I/O. Serves tests and development.
#[derive(Debug, Default, Clone)]
pub struct LocalProvisioner;

impl LocalProvisioner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Provisioner for LocalProvisioner {
    fn name(&self) -> &'static str {
        "local"
    }

    fn parameters(&self) -> ParameterMap {
        [
            (
                "hostname".to_string(),
                ParamDescriptor::new(ValueType::Str)
                    .ops([OpKind::Bare, OpKind::Eq, OpKind::In]),
            ),
            (
                "cpu-arch".to_string(),
                ParamDescriptor::new(ValueType::Str)
                    .ops([OpKind::Bare, OpKind::Eq, OpKind::In]),
            ),
            (
                "memory-total_size".to_string(),
                ParamDescriptor::new(ValueType::Int)
                    .ops([OpKind::Bare, OpKind::Eq, OpKind::Gte, OpKind::Lte]),
            ),
            (
                "system-type".to_string(),
                ParamDescriptor::new(ValueType::Str)
                    .ops([OpKind::Bare, OpKind::Eq, OpKind::In]),
            ),
            (
                "lifespan".to_string(),
                ParamDescriptor::new(ValueType::Int)
                    .ops([OpKind::Bare, OpKind::Eq, OpKind::Gte, OpKind::Lte]),
            ),
        ]
        .into_iter()
        .collect()
    }

    fn available(&self, _query: &Query) -> bool {
        true
    }

    fn cost(&self, _query: &Query) -> f64 {
        1.0
    }

    async fn provision(
        &self,
        machines: &mut [MachineHandle],
        query: &Query,
        _cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        let lifespan = query
            .plain_i64("lifespan")
            .or_else(|| {
                query.get("lifespan").and_then(|t| match t {
                    hostpool_domain::Term::Ops(ops) => {
                        ops.values().next().and_then(Value::as_i64)
                    }
                    _ => None,
                })
            })
            .unwrap_or(DEFAULT_LIFESPAN);
        let arch = query.plain_str("cpu-arch").unwrap_or("x86_64").to_string();
        let memory = query
            .get("memory-total_size")
            .and_then(|t| match t {
                hostpool_domain::Term::Value(v) => v.as_i64(),
                hostpool_domain::Term::Ops(ops) => ops.values().next().and_then(Value::as_i64),
            })
            .unwrap_or(8192);

        for machine in machines.iter_mut() {
            let hostname = format!("local-{}.pool.invalid", &machine.magic()[..8]);
            debug!(machine = %machine.magic(), hostname = %hostname, "LocalProvisioner: provision");
            let start = Utc::now();
            machine.stage("hostname", hostname)?;
            machine.stage("start_time", start)?;
            machine.stage("lifespan", lifespan)?;
            machine.stage("expire_time", start + Duration::seconds(lifespan))?;
            machine.stage("cpu-arch", arch.as_str())?;
            machine.stage("memory-total_size", memory)?;
            machine.stage("system-type", "vm")?;
            machine.save().await?;
        }
        Ok(())
    }

    async fn teardown(
        &self,
        machines: &mut [MachineHandle],
        _query: &Query,
    ) -> Result<(), ProvisionError> {
        for machine in machines.iter() {
            debug!(machine = %machine.magic(), "LocalProvisioner: teardown");
        }
        Ok(())
    }

    async fn is_teardown(
        &self,
        _machines: &[MachineHandle],
        _query: &Query,
    ) -> Result<bool, ProvisionError> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostpool_domain::{MachineStatus, Op, Term};
    use hostpool_store::{MachineStore, MemoryStore};
    use std::sync::Arc;

    #[tokio::test]
    async fn provision_fills_required_fields() {
        let store = Arc::new(MemoryStore::new());
        let mut machines = vec![MachineHandle::create(store.clone())];
        machines[0].stage_status(MachineStatus::New).unwrap();
        machines[0].save().await.unwrap();

        let mut query = Query::new();
        query.insert("cpu-arch", Term::Value(Value::Str("aarch64".into())));
        query.insert("memory-total_size", Term::op(Op::Gte, Value::Int(16384)));

        LocalProvisioner::new()
            .provision(&mut machines, &query, &CancellationToken::new())
            .await
            .unwrap();

        let stored = store.find_one(&Query::new()).await.unwrap().unwrap();
        assert!(stored.hostname.is_some());
        assert!(stored.start_time.is_some());
        assert_eq!(stored.field("cpu-arch"), Some(Value::Str("aarch64".into())));
        assert_eq!(stored.field("memory-total_size"), Some(Value::Int(16384)));
        assert!(stored.matches(&query));
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let mut machines = vec![MachineHandle::create(store)];
        machines[0].save().await.unwrap();
        let p = LocalProvisioner::new();
        p.teardown(&mut machines, &Query::new()).await.unwrap();
        p.teardown(&mut machines, &Query::new()).await.unwrap();
        assert!(p.is_teardown(&machines, &Query::new()).await.unwrap());
    }
}
