pub mod error;
pub mod machine;
pub mod query;
pub mod value;

pub use error::DomainError;
pub use machine::{Machine, MachineStatus, TaskDescriptor, TaskKind, TaskStatus};
pub use query::{Op, Query, Term};
pub use value::{from_value, to_value, Value, ValueType};
