use async_trait::async_trait;
use chrono::{Duration, Utc};
use hostpool_domain::{Op, Query, Term, Value, ValueType};
use hostpool_query::{OpKind, ParamDescriptor, ParameterMap};
use hostpool_store::MachineHandle;
use tracing::error;

use crate::error::InspectError;
use crate::inspector::{flat_filter, Inspector};
use crate::shell::RemoteShell;

/// Fields every valid pool machine must carry once provisioned.
const MANDATORY_FIELDS: &[&str] = &["magic", "status", "hostname", "lifespan", "start_time"];

/// First inspector in the stack: maintains the expiry invariant, validates
/// mandatory fields and reconciles `system-type` with what the provisioner
/// claimed.
pub struct CoreInspector;

#[async_trait]
impl Inspector for CoreInspector {
    fn name(&self) -> &'static str {
        "core"
    }

    fn parameters(&self) -> ParameterMap {
        [
            (
                "system-type".to_string(),
                ParamDescriptor::new(ValueType::Str)
                    .ops([OpKind::Bare, OpKind::Eq, OpKind::In])
                    .describe("Machine type: baremetal, vm, maybe container."),
            ),
            (
                "hostname".to_string(),
                ParamDescriptor::new(ValueType::Str)
                    .ops([OpKind::Bare, OpKind::Eq, OpKind::In])
                    .describe("Hostname usable for ssh connect."),
            ),
            (
                "lifespan".to_string(),
                ParamDescriptor::new(ValueType::Int)
                    .ops([OpKind::Bare, OpKind::Eq, OpKind::Gte, OpKind::Lte])
                    .describe("How long the machine stays valid after start_time, in seconds."),
            ),
            (
                "start_time".to_string(),
                ParamDescriptor::new(ValueType::Time)
                    .ops([OpKind::Bare, OpKind::Eq, OpKind::Gte, OpKind::Lte])
                    .describe("When provisioning began; with lifespan determines expiry."),
            ),
            (
                "expire_time".to_string(),
                ParamDescriptor::new(ValueType::Time)
                    .ops([OpKind::Bare, OpKind::Eq, OpKind::Gte, OpKind::Lte])
                    .describe("When the machine expires."),
            ),
        ]
        .into_iter()
        .collect()
    }

    async fn inspect(
        &self,
        machine: &mut MachineHandle,
        shell: &dyn RemoteShell,
    ) -> Result<(), InspectError> {
        let cpuinfo = shell.run("cat /proc/cpuinfo").await?;
        let flags = cpuinfo
            .kv_lines()
            .get("flags")
            .cloned()
            .unwrap_or_default();

        if flags.split_whitespace().any(|f| f == "hypervisor") {
            match machine.machine().field("system-type") {
                None => machine.set_now("system-type", "vm").await?,
                Some(Value::Str(s)) if s == "baremetal" => {
                    error!(
                        machine = %machine.magic(),
                        hostname = ?machine.hostname(),
                        "machine reports the hypervisor flag but the provisioner marked it baremetal"
                    );
                }
                _ => {}
            }
        }

        if machine.machine().expire_time.is_none() {
            if let Some(start_time) = machine.machine().start_time {
                let lifespan = machine.machine().lifespan;
                machine
                    .set_now("expire_time", start_time + Duration::seconds(lifespan))
                    .await?;
            }
        }

        for field in MANDATORY_FIELDS {
            if machine.machine().field(field).is_none() {
                error!(
                    machine = %machine.magic(),
                    field = %field,
                    "machine record is missing a mandatory field"
                );
            }
        }
        Ok(())
    }

    fn hard_filter(&self, query: &Query) -> Query {
        let mut out = flat_filter(&self.parameters(), query);

        // A bare lifespan means "at least this long", not exact equality.
        if let Some(Term::Value(v)) = out.get("lifespan").cloned() {
            out.insert("lifespan", Term::op(Op::Gte, v));
        }

        // `lifetime` is relative to now; select on the absolute expiry.
        if let Some(seconds) = query.plain_i64("lifetime") {
            out.insert(
                "expire_time",
                Term::op(Op::Gte, Value::Time(Utc::now() + Duration::seconds(seconds))),
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_lifespan_becomes_lower_bound() {
        let mut q = Query::new();
        q.insert("lifespan", Term::Value(Value::Int(3600)));
        let filter = CoreInspector.hard_filter(&q);
        assert_eq!(filter.get("lifespan"), Some(&Term::op(Op::Gte, Value::Int(3600))));
    }

    #[test]
    fn lifetime_rewrites_to_expire_time_bound() {
        let mut q = Query::new();
        q.insert("lifetime", Term::Value(Value::Int(7200)));
        let filter = CoreInspector.hard_filter(&q);
        assert!(!filter.contains("lifetime"));
        match filter.get("expire_time") {
            Some(Term::Ops(ops)) => {
                let bound = ops.get(&Op::Gte).and_then(Value::as_time).unwrap();
                let expected = Utc::now() + Duration::seconds(7200);
                assert!((bound - expected).num_seconds().abs() < 5);
            }
            other => panic!("unexpected filter {:?}", other),
        }
    }

    #[test]
    fn filter_is_pure_passthrough_otherwise() {
        let mut q = Query::new();
        q.insert("hostname", Term::eq("h1"));
        q.insert("cpu-arch", Term::eq("x86_64"));
        let filter = CoreInspector.hard_filter(&q);
        assert!(filter.contains("hostname"));
        assert!(!filter.contains("cpu-arch"));
    }
}
