pub mod broker;
pub mod error;
pub mod housekeeper;
pub mod magic;
pub mod task;

pub use broker::Broker;
pub use error::{BrokerError, TaskError};
pub use housekeeper::HouseKeeper;
pub use magic::{query_hash, Magic, Session};
pub use task::{TaskBody, TaskCtx, TaskEngine, TaskEntry};
