use std::sync::Arc;

use hostpool_domain::{Machine, MachineStatus, TaskDescriptor, Value};
use tracing::warn;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::{Ident, MachineStore, UpdateDoc};

#[derive(Debug, Clone)]
enum JournalOp {
    Set(String, Value),
    Unset(String),
}

/// A machine snapshot paired with its store and an update journal.
///
/// Staged mutations apply to the local snapshot immediately and are flushed
/// by [`save`](MachineHandle::save) as one atomic multi-field update. The
/// `*_now` operations bypass the journal and reflect the durable post-image
/// back into the snapshot.
pub struct MachineHandle {
    store: Arc<dyn MachineStore>,
    machine: Machine,
    journal: Vec<JournalOp>,
    persisted: bool,
}

impl MachineHandle {
    /// A fresh, unsaved machine (status `new`, fresh magic).
    pub fn create(store: Arc<dyn MachineStore>) -> MachineHandle {
        MachineHandle {
            store,
            machine: Machine::new(),
            journal: Vec::new(),
            persisted: false,
        }
    }

    /// Wrap an existing record loaded from the store.
    pub fn attach(store: Arc<dyn MachineStore>, machine: Machine) -> MachineHandle {
        MachineHandle {
            store,
            machine,
            journal: Vec::new(),
            persisted: true,
        }
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn magic(&self) -> &str {
        &self.machine.magic
    }

    pub fn hostname(&self) -> Option<&str> {
        self.machine.hostname.as_deref()
    }

    pub fn status(&self) -> MachineStatus {
        self.machine.status
    }

    fn ident(&self) -> Ident {
        Ident::of(&self.machine)
    }

    /// Stage a field write: applied locally now, durable at the next `save`.
    pub fn stage(&mut self, path: &str, value: impl Into<Value>) -> Result<(), StoreError> {
        let value = value.into();
        self.machine.set_field(path, value.clone())?;
        self.journal.push(JournalOp::Set(path.to_string(), value));
        Ok(())
    }

    pub fn stage_unset(&mut self, path: &str) {
        self.machine.unset_field(path);
        self.journal.push(JournalOp::Unset(path.to_string()));
    }

    pub fn stage_status(&mut self, status: MachineStatus) -> Result<(), StoreError> {
        self.stage("status", Value::Str(status.to_string()))
    }

    /// Stage a task descriptor attach; false when the uuid is already
    /// present (resume idempotence).
    pub fn stage_attach_task(
        &mut self,
        uuid: Uuid,
        descriptor: &TaskDescriptor,
    ) -> Result<bool, StoreError> {
        if self.machine.tasks.contains_key(&uuid) {
            return Ok(false);
        }
        let value = Machine::task_value(descriptor)?;
        self.stage(&format!("tasks.{}", uuid), value)?;
        Ok(true)
    }

    pub fn stage_detach_task(&mut self, uuid: &Uuid) {
        if self.machine.tasks.contains_key(uuid) {
            self.stage_unset(&format!("tasks.{}", uuid));
        }
    }

    /// Flush the journal as one atomic update (or insert the record when it
    /// has never been saved) and adopt the post-image.
    pub async fn save(&mut self) -> Result<(), StoreError> {
        if !self.persisted {
            self.machine.self_check()?;
            self.store.insert(&self.machine).await?;
            self.persisted = true;
            self.journal.clear();
            return Ok(());
        }
        if self.journal.is_empty() {
            return Ok(());
        }
        self.machine.self_check()?;
        let mut update = UpdateDoc::default();
        for op in self.journal.drain(..) {
            match op {
                JournalOp::Set(path, value) => update.set.push((path, value)),
                JournalOp::Unset(path) => update.unset.push(path),
            }
        }
        self.machine = self.store.atomic_update(&self.ident(), &update).await?;
        Ok(())
    }

    /// Immediate atomic single-field set, bypassing the journal.
    pub async fn set_now(&mut self, path: &str, value: impl Into<Value>) -> Result<(), StoreError> {
        let update = UpdateDoc::default().set(path, value);
        self.machine = self.store.atomic_update(&self.ident(), &update).await?;
        self.persisted = true;
        Ok(())
    }

    /// Immediate set only when the field is currently absent.
    pub async fn set_default_now(
        &mut self,
        path: &str,
        value: impl Into<Value>,
    ) -> Result<(), StoreError> {
        if self.machine.field(path).is_none() {
            self.set_now(path, value).await?;
        }
        Ok(())
    }

    pub async fn inc_now(&mut self, path: &str, by: i64) -> Result<(), StoreError> {
        let update = UpdateDoc::default().inc(path, by);
        self.machine = self.store.atomic_update(&self.ident(), &update).await?;
        Ok(())
    }

    /// Re-read the durable record, discarding any staged journal entries.
    pub async fn refresh(&mut self) -> Result<(), StoreError> {
        if !self.journal.is_empty() {
            warn!(
                machine = %self.magic(),
                staged = self.journal.len(),
                "refresh discards staged updates"
            );
            self.journal.clear();
        }
        self.machine = self
            .store
            .atomic_update(&self.ident(), &UpdateDoc::default())
            .await?;
        Ok(())
    }

    /// Mark the machine failed with a message, atomically.
    pub async fn mark_failed(&mut self, message: &str) -> Result<(), StoreError> {
        self.journal.clear();
        let update = UpdateDoc::default()
            .set("status", Value::Str(MachineStatus::Failed.to_string()))
            .set("failure-message", Value::Str(message.to_string()));
        match self.store.atomic_update(&self.ident(), &update).await {
            Ok(machine) => {
                self.machine = machine;
                Ok(())
            }
            Err(StoreError::Conflict(ident)) => {
                // Already reaped; nothing left to mark.
                warn!(machine = %ident, "machine vanished while marking failed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Delete the record from the store; the local snapshot becomes
    /// `deleted`.
    pub async fn delete(&mut self) -> Result<(), StoreError> {
        self.store.delete(&self.ident()).await?;
        self.machine.status = MachineStatus::Deleted;
        self.machine.tasks.clear();
        self.persisted = false;
        self.journal.clear();
        Ok(())
    }
}

impl std::fmt::Debug for MachineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineHandle")
            .field("magic", &self.machine.magic)
            .field("hostname", &self.machine.hostname)
            .field("status", &self.machine.status)
            .field("staged", &self.journal.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use hostpool_domain::Query;

    #[tokio::test]
    async fn staged_updates_flush_once() {
        let store = Arc::new(MemoryStore::new());
        let mut handle = MachineHandle::create(store.clone());
        handle.stage("hostname", "h1.example.com").unwrap();
        handle.stage_status(MachineStatus::Ready).unwrap();
        handle.stage("cpu-arch", "x86_64").unwrap();
        handle.save().await.unwrap();

        let stored = store.find_one(&Query::new()).await.unwrap().unwrap();
        assert_eq!(stored.status, MachineStatus::Ready);
        assert_eq!(stored.field("cpu-arch"), Some(Value::Str("x86_64".into())));

        // Journal is clear; a further save is a no-op.
        handle.save().await.unwrap();
    }

    #[tokio::test]
    async fn set_now_bypasses_journal_and_adopts_post_image() {
        let store = Arc::new(MemoryStore::new());
        let mut handle = MachineHandle::create(store.clone());
        handle.save().await.unwrap();

        handle.set_now("meta.lab-job_id", "J:7").await.unwrap();
        let stored = store.find_one(&Query::new()).await.unwrap().unwrap();
        assert_eq!(stored.meta.get("lab-job_id"), Some(&Value::Str("J:7".into())));
        assert_eq!(
            handle.machine().meta.get("lab-job_id"),
            Some(&Value::Str("J:7".into()))
        );
    }

    #[tokio::test]
    async fn attach_task_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let mut handle = MachineHandle::create(store.clone());
        handle.save().await.unwrap();

        let uuid = Uuid::new_v4();
        let descriptor = TaskDescriptor {
            kind: hostpool_domain::TaskKind::Reserve,
            status: hostpool_domain::TaskStatus::Running,
            query: Query::new(),
        };
        assert!(handle.stage_attach_task(uuid, &descriptor).unwrap());
        assert!(!handle.stage_attach_task(uuid, &descriptor).unwrap());
        handle.save().await.unwrap();

        let stored = store.find_one(&Query::new()).await.unwrap().unwrap();
        assert_eq!(stored.tasks.len(), 1);
    }

    #[tokio::test]
    async fn mark_failed_on_reaped_machine_is_quiet() {
        let store = Arc::new(MemoryStore::new());
        let mut handle = MachineHandle::create(store.clone());
        handle.save().await.unwrap();
        store
            .delete(&Ident::Magic(handle.magic().to_string()))
            .await
            .unwrap();
        handle.mark_failed("boom").await.unwrap();
    }
}
