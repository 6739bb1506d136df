use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;
use crate::query::{Op, Query, Term};
use crate::value::{from_value, to_value, Value};

// ── Status state machine ──────────────────────────────────────────────────────

/// Lifecycle state of a pooled machine.
///
/// Transitions:
///   New → Preparing → Ready ↔ Reserved
///   Ready → Teardown → Deleted
///   any non-terminal → Failed (task failure)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    #[default]
    New,
    Preparing,
    Ready,
    Reserved,
    Teardown,
    Failed,
    Deleted,
}

impl MachineStatus {
    /// Statuses in which a machine must carry a hostname. `Preparing` is
    /// exempt: it is entered before the provisioner has assigned one.
    pub fn needs_hostname(&self) -> bool {
        matches!(
            self,
            MachineStatus::Ready | MachineStatus::Reserved | MachineStatus::Teardown
        )
    }
}

impl std::fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MachineStatus::New => "new",
            MachineStatus::Preparing => "preparing",
            MachineStatus::Ready => "ready",
            MachineStatus::Reserved => "reserved",
            MachineStatus::Teardown => "teardown",
            MachineStatus::Failed => "failed",
            MachineStatus::Deleted => "deleted",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for MachineStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(MachineStatus::New),
            "preparing" => Ok(MachineStatus::Preparing),
            "ready" => Ok(MachineStatus::Ready),
            "reserved" => Ok(MachineStatus::Reserved),
            "teardown" => Ok(MachineStatus::Teardown),
            "failed" => Ok(MachineStatus::Failed),
            "deleted" => Ok(MachineStatus::Deleted),
            other => Err(DomainError::InvalidStatus(other.to_string())),
        }
    }
}

// ── Task descriptors ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Provision,
    Inspect,
    Reserve,
    Teardown,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskKind::Provision => "provision",
            TaskKind::Inspect => "inspect",
            TaskKind::Reserve => "reserve",
            TaskKind::Teardown => "teardown",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

/// The durable task record embedded in every machine the task owns.
/// This embedding is the only task state that survives a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    #[serde(rename = "type")]
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub query: Query,
}

// ── Machine ───────────────────────────────────────────────────────────────────

/// A pooled machine record.
///
/// Reserved fields are typed; everything an inspector observes lands in the
/// flattened `attrs` map, and provisioner/task scratch in `meta`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub magic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default)]
    pub status: MachineStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lifespan: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tasks: BTreeMap<Uuid, TaskDescriptor>,
    #[serde(default)]
    pub meta: BTreeMap<String, Value>,
    #[serde(
        rename = "failure-message",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub failure_message: Option<String>,
    #[serde(flatten)]
    pub attrs: BTreeMap<String, Value>,
}

impl Machine {
    /// A blank record with a freshly assigned magic.
    pub fn new() -> Machine {
        Machine {
            magic: Uuid::new_v4().to_string(),
            hostname: None,
            status: MachineStatus::New,
            provisioner: None,
            start_time: None,
            lifespan: 0,
            expire_time: None,
            tasks: BTreeMap::new(),
            meta: BTreeMap::new(),
            failure_message: None,
            attrs: BTreeMap::new(),
        }
    }

    /// Reject invalid status values and machines missing a hostname in a
    /// status that requires one. Called on every save.
    pub fn self_check(&self) -> Result<(), DomainError> {
        if self.status.needs_hostname() && self.hostname.is_none() {
            return Err(DomainError::MissingField {
                status: self.status.to_string(),
                field: "hostname".to_string(),
            });
        }
        Ok(())
    }

    /// Read a (possibly dotted) field path as a [`Value`].
    pub fn field(&self, path: &str) -> Option<Value> {
        match path {
            "magic" => Some(Value::Str(self.magic.clone())),
            "hostname" => self.hostname.clone().map(Value::Str),
            "status" => Some(Value::Str(self.status.to_string())),
            "provisioner" => self.provisioner.clone().map(Value::Str),
            "start_time" => self.start_time.map(Value::Time),
            "lifespan" => Some(Value::Int(self.lifespan)),
            "expire_time" => self.expire_time.map(Value::Time),
            "failure-message" => self.failure_message.clone().map(Value::Str),
            _ => {
                if let Some(rest) = path.strip_prefix("meta.") {
                    lookup_nested(&self.meta, rest)
                } else if path == "meta" {
                    Some(Value::Map(self.meta.clone()))
                } else {
                    lookup_nested(&self.attrs, path)
                }
            }
        }
    }

    /// Write a (possibly dotted) field path. Reserved paths are parsed into
    /// their typed representation; `tasks.<uuid>` expects a serialized
    /// [`TaskDescriptor`].
    pub fn set_field(&mut self, path: &str, value: Value) -> Result<(), DomainError> {
        match path {
            "magic" => {
                self.magic = expect_str(path, value)?;
            }
            "hostname" => {
                self.hostname = Some(expect_str(path, value)?);
            }
            "status" => {
                self.status = expect_str(path, value)?.parse()?;
            }
            "provisioner" => {
                self.provisioner = Some(expect_str(path, value)?);
            }
            "start_time" => {
                self.start_time = Some(expect_time(path, &value)?);
            }
            "lifespan" => {
                self.lifespan = value.as_i64().ok_or_else(|| DomainError::Coercion {
                    got: value.type_name().to_string(),
                    wanted: "int".to_string(),
                })?;
            }
            "expire_time" => {
                self.expire_time = Some(expect_time(path, &value)?);
            }
            "failure-message" => {
                self.failure_message = Some(expect_str(path, value)?);
            }
            _ => {
                if let Some(uuid) = path.strip_prefix("tasks.") {
                    let uuid: Uuid =
                        uuid.parse()
                            .map_err(|_| DomainError::InvalidPath(path.to_string()))?;
                    let descriptor =
                        from_value(&value).map_err(|e| DomainError::InvalidTaskDescriptor {
                            path: path.to_string(),
                            message: e.to_string(),
                        })?;
                    self.tasks.insert(uuid, descriptor);
                } else if let Some(rest) = path.strip_prefix("meta.") {
                    insert_nested(&mut self.meta, rest, value);
                } else if path == "tasks" || path == "meta" {
                    return Err(DomainError::InvalidPath(path.to_string()));
                } else {
                    insert_nested(&mut self.attrs, path, value);
                }
            }
        }
        Ok(())
    }

    /// Remove a field; no-op when absent. Reserved scalar fields revert to
    /// their empty state.
    pub fn unset_field(&mut self, path: &str) {
        match path {
            "hostname" => self.hostname = None,
            "provisioner" => self.provisioner = None,
            "start_time" => self.start_time = None,
            "expire_time" => self.expire_time = None,
            "failure-message" => self.failure_message = None,
            "lifespan" => self.lifespan = 0,
            _ => {
                if let Some(uuid) = path.strip_prefix("tasks.") {
                    if let Ok(uuid) = uuid.parse::<Uuid>() {
                        self.tasks.remove(&uuid);
                    }
                } else if let Some(rest) = path.strip_prefix("meta.") {
                    remove_nested(&mut self.meta, rest);
                } else {
                    remove_nested(&mut self.attrs, path);
                }
            }
        }
    }

    /// Whether this machine satisfies every term of a sanitised query.
    /// Fields the machine does not carry never match.
    pub fn matches(&self, query: &Query) -> bool {
        query.iter().all(|(field, term)| {
            let Some(actual) = self.field(field) else {
                return false;
            };
            match term {
                Term::Value(wanted) => actual.loose_eq(wanted),
                Term::Ops(ops) => ops.iter().all(|(op, wanted)| match op {
                    Op::Eq => actual.loose_eq(wanted),
                    Op::In => match wanted {
                        Value::StrList(candidates) => match &actual {
                            Value::Str(s) => candidates.iter().any(|c| c == s),
                            Value::StrList(have) => {
                                have.iter().any(|h| candidates.iter().any(|c| c == h))
                            }
                            _ => false,
                        },
                        other => actual.loose_eq(other),
                    },
                    Op::Lt => actual.compare(wanted) == Some(std::cmp::Ordering::Less),
                    Op::Lte => matches!(
                        actual.compare(wanted),
                        Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
                    ),
                    Op::Gt => actual.compare(wanted) == Some(std::cmp::Ordering::Greater),
                    Op::Gte => matches!(
                        actual.compare(wanted),
                        Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
                    ),
                }),
            }
        })
    }

    /// Attach a task descriptor, returning false when already present.
    pub fn attach_task(&mut self, uuid: Uuid, descriptor: TaskDescriptor) -> bool {
        if self.tasks.contains_key(&uuid) {
            return false;
        }
        self.tasks.insert(uuid, descriptor);
        true
    }

    pub fn detach_task(&mut self, uuid: &Uuid) -> Option<TaskDescriptor> {
        self.tasks.remove(uuid)
    }

    /// Serialized task descriptor as a [`Value`] for journalled updates.
    pub fn task_value(descriptor: &TaskDescriptor) -> Result<Value, DomainError> {
        to_value(descriptor)
    }
}

impl Default for Machine {
    fn default() -> Self {
        Machine::new()
    }
}

fn expect_str(path: &str, value: Value) -> Result<String, DomainError> {
    match value {
        Value::Str(s) => Ok(s),
        other => Err(DomainError::Coercion {
            got: format!("{} for {}", other.type_name(), path),
            wanted: "str".to_string(),
        }),
    }
}

fn expect_time(path: &str, value: &Value) -> Result<DateTime<Utc>, DomainError> {
    value.as_time().ok_or_else(|| DomainError::Coercion {
        got: format!("{} for {}", value.type_name(), path),
        wanted: "time".to_string(),
    })
}

fn lookup_nested(map: &BTreeMap<String, Value>, path: &str) -> Option<Value> {
    if let Some(v) = map.get(path) {
        return Some(v.clone());
    }
    let (head, rest) = path.split_once('.')?;
    match map.get(head) {
        Some(Value::Map(inner)) => lookup_nested(inner, rest),
        _ => None,
    }
}

fn insert_nested(map: &mut BTreeMap<String, Value>, path: &str, value: Value) {
    map.insert(path.to_string(), value);
}

fn remove_nested(map: &mut BTreeMap<String, Value>, path: &str) {
    map.remove(path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Op;

    fn ready_machine() -> Machine {
        let mut m = Machine::new();
        m.hostname = Some("h1.example.com".into());
        m.status = MachineStatus::Ready;
        m.lifespan = 86400;
        m.attrs
            .insert("cpu-arch".into(), Value::Str("x86_64".into()));
        m.attrs.insert("memory-total_size".into(), Value::Int(16384));
        m.attrs.insert(
            "cpu-flags".into(),
            Value::StrList(vec!["vmx".into(), "pdpe1gb".into()]),
        );
        m
    }

    #[test]
    fn self_check_requires_hostname_when_ready() {
        let mut m = Machine::new();
        m.status = MachineStatus::Ready;
        assert!(m.self_check().is_err());
        m.hostname = Some("h1".into());
        assert!(m.self_check().is_ok());
    }

    #[test]
    fn preparing_does_not_require_hostname_yet() {
        let mut m = Machine::new();
        m.status = MachineStatus::Preparing;
        assert!(m.self_check().is_ok());
    }

    #[test]
    fn new_machine_passes_self_check() {
        assert!(Machine::new().self_check().is_ok());
    }

    #[test]
    fn field_reads_reserved_and_attr_paths() {
        let mut m = ready_machine();
        m.meta.insert("lab-job_id".into(), Value::Str("J:12".into()));
        assert_eq!(m.field("status"), Some(Value::Str("ready".into())));
        assert_eq!(m.field("cpu-arch"), Some(Value::Str("x86_64".into())));
        assert_eq!(m.field("meta.lab-job_id"), Some(Value::Str("J:12".into())));
        assert_eq!(m.field("nonexistent"), None);
    }

    #[test]
    fn set_field_parses_status() {
        let mut m = ready_machine();
        m.set_field("status", Value::Str("reserved".into())).unwrap();
        assert_eq!(m.status, MachineStatus::Reserved);
        assert!(m.set_field("status", Value::Str("busted".into())).is_err());
    }

    #[test]
    fn set_field_round_trips_task_descriptor() {
        let mut m = ready_machine();
        let uuid = Uuid::new_v4();
        let desc = TaskDescriptor {
            kind: TaskKind::Reserve,
            status: TaskStatus::Running,
            query: Query::new(),
        };
        let value = Machine::task_value(&desc).unwrap();
        m.set_field(&format!("tasks.{}", uuid), value).unwrap();
        assert_eq!(m.tasks.get(&uuid), Some(&desc));
        m.unset_field(&format!("tasks.{}", uuid));
        assert!(m.tasks.is_empty());
    }

    #[test]
    fn matches_comparison_operators() {
        let m = ready_machine();

        let mut q = Query::new();
        q.insert("memory-total_size", Term::op(Op::Gte, Value::Int(8192)));
        q.insert("cpu-arch", Term::Value(Value::Str("x86_64".into())));
        assert!(m.matches(&q));

        let mut q = Query::new();
        q.insert("memory-total_size", Term::op(Op::Gt, Value::Int(16384)));
        assert!(!m.matches(&q));
    }

    #[test]
    fn matches_in_and_list_membership() {
        let m = ready_machine();

        let mut q = Query::new();
        q.insert(
            "hostname",
            Term::op(
                Op::In,
                Value::StrList(vec!["h1.example.com".into(), "10.0.0.4".into()]),
            ),
        );
        assert!(m.matches(&q));

        let mut q = Query::new();
        q.insert("cpu-flags", Term::Value(Value::Str("pdpe1gb".into())));
        assert!(m.matches(&q));
    }

    #[test]
    fn missing_field_never_matches() {
        let m = ready_machine();
        let mut q = Query::new();
        q.insert("numa-node_number", Term::op(Op::Gte, Value::Int(2)));
        assert!(!m.matches(&q));
    }

    #[test]
    fn machine_json_round_trip_keeps_attrs_flat() {
        let m = ready_machine();
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["cpu-arch"], serde_json::json!("x86_64"));
        let back: Machine = serde_json::from_value(json).unwrap();
        assert_eq!(back, m);
    }
}
