use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hostpool_domain::{Machine, Query};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::store::{apply_update, Ident, MachineStore, UpdateDoc};

#[derive(Debug, Default)]
struct Inner {
    /// Keyed by magic; the unique index.
    machines: HashMap<String, Machine>,
}

/// In-memory implementation of [`MachineStore`].
///
/// All data is lost on process exit. Suitable for tests and development.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    fn get_mut(&mut self, ident: &Ident) -> Option<&mut Machine> {
        match ident {
            Ident::Magic(magic) => self.machines.get_mut(magic),
            Ident::Hostname(hostname) => self
                .machines
                .values_mut()
                .find(|m| m.hostname.as_deref() == Some(hostname)),
        }
    }
}

#[async_trait]
impl MachineStore for MemoryStore {
    async fn find_all(
        &self,
        query: &Query,
        limit: Option<usize>,
    ) -> Result<Vec<Machine>, StoreError> {
        let guard = self.inner.read().await;
        let mut out: Vec<Machine> = guard
            .machines
            .values()
            .filter(|m| m.matches(query))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.magic.cmp(&b.magic));
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn find_one(&self, query: &Query) -> Result<Option<Machine>, StoreError> {
        Ok(self.find_all(query, Some(1)).await?.into_iter().next())
    }

    async fn insert(&self, machine: &Machine) -> Result<(), StoreError> {
        machine.self_check()?;
        let mut guard = self.inner.write().await;
        if guard.machines.contains_key(&machine.magic) {
            return Err(StoreError::DuplicateMagic(machine.magic.clone()));
        }
        guard.machines.insert(machine.magic.clone(), machine.clone());
        Ok(())
    }

    async fn atomic_update(
        &self,
        ident: &Ident,
        update: &UpdateDoc,
    ) -> Result<Machine, StoreError> {
        let mut guard = self.inner.write().await;
        let machine = guard
            .get_mut(ident)
            .ok_or_else(|| StoreError::Conflict(ident.to_string()))?;
        apply_update(machine, update)?;
        Ok(machine.clone())
    }

    async fn delete(&self, ident: &Ident) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        match ident {
            Ident::Magic(magic) => {
                guard.machines.remove(magic);
            }
            Ident::Hostname(hostname) => {
                guard
                    .machines
                    .retain(|_, m| m.hostname.as_deref() != Some(hostname));
            }
        }
        Ok(())
    }
}
