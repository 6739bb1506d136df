pub mod error;
pub mod handle;
pub mod memory;
pub mod redb_store;
pub mod store;

pub use error::StoreError;
pub use handle::MachineHandle;
pub use memory::MemoryStore;
pub use redb_store::RedbStore;
pub use store::{apply_update, Ident, MachineStore, UpdateDoc};
