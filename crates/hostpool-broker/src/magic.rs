use std::sync::Arc;

use hostpool_domain::{Machine, Op, Query, Term, Value};
use hostpool_store::{MachineHandle, MachineStore, StoreError};
use sha2::{Digest, Sha256};
use tracing::debug;

const LAST_REQUEST_HASH: &str = "last_request_hash";
const LAST_MACHINE_MAGICS: &str = "last_machine_magics";

/// Per-client session storage, provided by the HTTP layer. Values are opaque
/// strings; the deduplicator owns the schema of what it stores.
pub trait Session: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
}

/// Stable hash of a sanitised query: SHA-256 over its canonical JSON
/// (map ordering is already deterministic).
pub fn query_hash(query: &Query) -> String {
    let json = serde_json::to_string(query).unwrap_or_default();
    format!("{:x}", Sha256::digest(json.as_bytes()))
}

/// The request deduplicator.
///
/// Browsers and impatient scripts resubmit identical requests while the
/// first provision is still running; without this memo every retry would
/// start another provisioning job.
pub struct Magic {
    session: Arc<dyn Session>,
}

impl Magic {
    pub fn new(session: Arc<dyn Session>) -> Magic {
        Magic { session }
    }

    /// Consult the memo before querying or provisioning.
    ///
    /// Removes the `magic` key from the query while hashing. The literal
    /// `new` forces a fresh allocation (and is consumed); any other value is
    /// reinserted so it can filter the store or gate provisioning.
    pub async fn pre_query(
        &self,
        store: &Arc<dyn MachineStore>,
        query: &mut Query,
    ) -> Result<Option<Vec<Machine>>, StoreError> {
        let magic_term = query.remove("magic");
        let magic_literal = magic_term
            .as_ref()
            .and_then(Term::as_plain)
            .and_then(Value::as_str)
            .map(str::to_string);

        if magic_literal.as_deref() == Some("new") {
            debug!("magic=new bypasses request deduplication");
            return Ok(None);
        }

        let hash = query_hash(query);
        let last_hash = self.session.get(LAST_REQUEST_HASH);
        let magics: Vec<String> = self
            .session
            .get(LAST_MACHINE_MAGICS)
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();

        if last_hash.as_deref() == Some(hash.as_str()) && !magics.is_empty() {
            let mut memo_query = Query::new();
            memo_query.insert("magic", Term::op(Op::In, Value::StrList(magics)));
            let machines = store.find_all(&memo_query, None).await?;
            if !machines.is_empty() {
                debug!(count = machines.len(), "request deduplicated to prior machines");
                return Ok(Some(machines));
            }
        }

        self.session.set(LAST_REQUEST_HASH, hash);
        if let Some(term) = magic_term {
            query.insert("magic", term);
        }
        Ok(None)
    }

    /// Remember which machines this session's provision produced.
    pub fn pre_provision(&self, machines: &mut [MachineHandle], _query: &Query) {
        let magics: Vec<String> = machines.iter().map(|m| m.magic().to_string()).collect();
        if let Ok(raw) = serde_json::to_string(&magics) {
            self.session.set(LAST_MACHINE_MAGICS, raw);
        }
    }

    /// `magic=noprovision` asks for lookup only.
    pub fn allow_provision(&self, query: &Query) -> bool {
        query.plain_str("magic") != Some("noprovision")
    }
}
