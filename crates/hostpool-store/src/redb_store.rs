use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use hostpool_domain::{Machine, Query};
use redb::{Database, ReadableTable, TableDefinition};

use crate::error::StoreError;
use crate::store::{apply_update, Ident, MachineStore, UpdateDoc};

const MACHINES: TableDefinition<&str, &[u8]> = TableDefinition::new("machines");

/// Persistent machine store backed by a redb database file, keyed by magic.
///
/// All records survive process restarts; task state rides inside the machine
/// documents, so this file is the whole recovery source.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (or create) a redb database at `path`.
    ///
    /// Parent directories are created automatically.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Internal(e.to_string()))?;
        }
        let db = Database::create(path).map_err(|e| StoreError::Internal(e.to_string()))?;
        {
            let wtxn = db
                .begin_write()
                .map_err(|e| StoreError::Internal(e.to_string()))?;
            wtxn.open_table(MACHINES)
                .map_err(|e| StoreError::Internal(e.to_string()))?;
            wtxn.commit()
                .map_err(|e| StoreError::Internal(e.to_string()))?;
        }
        Ok(Self { db: Arc::new(db) })
    }

    fn scan(&self) -> Result<Vec<Machine>, StoreError> {
        let rtxn = self
            .db
            .begin_read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let table = rtxn
            .open_table(MACHINES)
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let mut out = Vec::new();
        for entry in table
            .iter()
            .map_err(|e| StoreError::Internal(e.to_string()))?
        {
            let (_k, v) = entry.map_err(|e| StoreError::Internal(e.to_string()))?;
            out.push(serde_json::from_slice(v.value())?);
        }
        Ok(out)
    }

    fn resolve_magic(&self, ident: &Ident) -> Result<Option<String>, StoreError> {
        match ident {
            Ident::Magic(magic) => Ok(Some(magic.clone())),
            Ident::Hostname(_) => Ok(self
                .scan()?
                .into_iter()
                .find(|m| ident.selects(m))
                .map(|m| m.magic)),
        }
    }
}

#[async_trait]
impl MachineStore for RedbStore {
    async fn find_all(
        &self,
        query: &Query,
        limit: Option<usize>,
    ) -> Result<Vec<Machine>, StoreError> {
        let mut out: Vec<Machine> = self
            .scan()?
            .into_iter()
            .filter(|m| m.matches(query))
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
        let bytes = serde_json::to_vec(machine)?;
        let wtxn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        {
            let mut table = wtxn
                .open_table(MACHINES)
                .map_err(|e| StoreError::Internal(e.to_string()))?;
            let exists = table
                .get(machine.magic.as_str())
                .map_err(|e| StoreError::Internal(e.to_string()))?
                .is_some();
            if exists {
                return Err(StoreError::DuplicateMagic(machine.magic.clone()));
            }
            table
                .insert(machine.magic.as_str(), bytes.as_slice())
                .map_err(|e| StoreError::Internal(e.to_string()))?;
        }
        wtxn.commit()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn atomic_update(
        &self,
        ident: &Ident,
        update: &UpdateDoc,
    ) -> Result<Machine, StoreError> {
        let magic = self
            .resolve_magic(ident)?
            .ok_or_else(|| StoreError::Conflict(ident.to_string()))?;

        let wtxn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let machine = {
            let mut table = wtxn
                .open_table(MACHINES)
                .map_err(|e| StoreError::Internal(e.to_string()))?;
            let mut machine: Machine = match table
                .get(magic.as_str())
                .map_err(|e| StoreError::Internal(e.to_string()))?
            {
                Some(guard) => serde_json::from_slice(guard.value())?,
                None => return Err(StoreError::Conflict(ident.to_string())),
            };
            apply_update(&mut machine, update)?;
            let bytes = serde_json::to_vec(&machine)?;
            table
                .insert(magic.as_str(), bytes.as_slice())
                .map_err(|e| StoreError::Internal(e.to_string()))?;
            machine
        };
        wtxn.commit()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(machine)
    }

    async fn delete(&self, ident: &Ident) -> Result<(), StoreError> {
        let Some(magic) = self.resolve_magic(ident)? else {
            return Ok(());
        };
        let wtxn = self
            .db
            .begin_write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        {
            let mut table = wtxn
                .open_table(MACHINES)
                .map_err(|e| StoreError::Internal(e.to_string()))?;
            table
                .remove(magic.as_str())
                .map_err(|e| StoreError::Internal(e.to_string()))?;
        }
        wtxn.commit()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostpool_domain::{MachineStatus, Value};
    use tempfile::TempDir;

    fn machine(hostname: &str) -> Machine {
        let mut m = Machine::new();
        m.hostname = Some(hostname.to_string());
        m.status = MachineStatus::Ready;
        m.attrs
            .insert("cpu-arch".into(), Value::Str("x86_64".into()));
        m
    }

    fn open_store(dir: &TempDir) -> RedbStore {
        RedbStore::open(&dir.path().join("pool.redb")).unwrap()
    }

    #[tokio::test]
    async fn insert_and_find() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.insert(&machine("h1")).await.unwrap();
        let all = store.find_all(&Query::new(), None).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn persistence_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pool.redb");
        let m = machine("h1");
        {
            let store = RedbStore::open(&path).unwrap();
            store.insert(&m).await.unwrap();
        }
        {
            let store = RedbStore::open(&path).unwrap();
            let all = store.find_all(&Query::new(), None).await.unwrap();
            assert_eq!(all.len(), 1, "records should survive store reopen");
            assert_eq!(all[0].magic, m.magic);
        }
    }

    #[tokio::test]
    async fn duplicate_magic_rejected() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let m = machine("h1");
        store.insert(&m).await.unwrap();
        assert!(matches!(
            store.insert(&m).await,
            Err(StoreError::DuplicateMagic(_))
        ));
    }

    #[tokio::test]
    async fn atomic_update_persists_post_image() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let m = machine("h1");
        store.insert(&m).await.unwrap();

        let update = UpdateDoc::default().set("meta.lab-job_id", Value::Str("J:42".into()));
        let post = store
            .atomic_update(&Ident::Magic(m.magic.clone()), &update)
            .await
            .unwrap();
        assert_eq!(post.meta.get("lab-job_id"), Some(&Value::Str("J:42".into())));

        let again = store
            .find_one(&Query::new())
            .await
            .unwrap()
            .expect("machine present");
        assert_eq!(again.meta.get("lab-job_id"), Some(&Value::Str("J:42".into())));
    }

    #[tokio::test]
    async fn delete_then_update_conflicts() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let m = machine("h1");
        store.insert(&m).await.unwrap();
        store.delete(&Ident::Magic(m.magic.clone())).await.unwrap();
        let update = UpdateDoc::default().set("lifespan", Value::Int(1));
        assert!(matches!(
            store.atomic_update(&Ident::Magic(m.magic), &update).await,
            Err(StoreError::Conflict(_))
        ));
    }
}
