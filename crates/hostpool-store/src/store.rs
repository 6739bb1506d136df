use async_trait::async_trait;
use hostpool_domain::{Machine, Query, Value};

use crate::error::StoreError;

/// How a machine is addressed for updates and deletes. `magic` is preferred;
/// `hostname` is the fallback for records addressed by their provisioned
/// identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ident {
    Magic(String),
    Hostname(String),
}

impl Ident {
    pub fn of(machine: &Machine) -> Ident {
        if !machine.magic.is_empty() {
            Ident::Magic(machine.magic.clone())
        } else {
            Ident::Hostname(machine.hostname.clone().unwrap_or_default())
        }
    }

    pub fn selects(&self, machine: &Machine) -> bool {
        match self {
            Ident::Magic(magic) => &machine.magic == magic,
            Ident::Hostname(hostname) => machine.hostname.as_deref() == Some(hostname),
        }
    }
}

impl std::fmt::Display for Ident {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ident::Magic(m) => write!(f, "magic={}", m),
            Ident::Hostname(h) => write!(f, "hostname={}", h),
        }
    }
}

/// One atomic multi-field update. Operations apply in order: sets, unsets,
/// then increments.
#[derive(Debug, Clone, Default)]
pub struct UpdateDoc {
    pub set: Vec<(String, Value)>,
    pub unset: Vec<String>,
    pub inc: Vec<(String, i64)>,
}

impl UpdateDoc {
    pub fn set(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.push((path.into(), value.into()));
        self
    }

    pub fn unset(mut self, path: impl Into<String>) -> Self {
        self.unset.push(path.into());
        self
    }

    pub fn inc(mut self, path: impl Into<String>, by: i64) -> Self {
        self.inc.push((path.into(), by));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty() && self.inc.is_empty()
    }
}

/// Apply an update document to a machine record. Shared by every backend so
/// the dotted-path semantics cannot drift between them.
pub fn apply_update(machine: &mut Machine, update: &UpdateDoc) -> Result<(), StoreError> {
    for (path, value) in &update.set {
        machine.set_field(path, value.clone())?;
    }
    for path in &update.unset {
        machine.unset_field(path);
    }
    for (path, by) in &update.inc {
        let current = machine.field(path).and_then(|v| v.as_i64()).unwrap_or(0);
        machine.set_field(path, Value::Int(current + by))?;
    }
    Ok(())
}

/// Persistent keyed collection of machine records with atomic field updates
/// and a unique index on `magic`.
#[async_trait]
pub trait MachineStore: Send + Sync + 'static {
    async fn find_all(
        &self,
        query: &Query,
        limit: Option<usize>,
    ) -> Result<Vec<Machine>, StoreError>;

    async fn find_one(&self, query: &Query) -> Result<Option<Machine>, StoreError>;

    async fn insert(&self, machine: &Machine) -> Result<(), StoreError>;

    /// Apply `update` atomically and return the post-image. A missing target
    /// is a [`StoreError::Conflict`].
    async fn atomic_update(
        &self,
        ident: &Ident,
        update: &UpdateDoc,
    ) -> Result<Machine, StoreError>;

    async fn delete(&self, ident: &Ident) -> Result<(), StoreError>;
}
