pub mod compose;
pub mod core;
pub mod cpu;
pub mod disk;
pub mod error;
pub mod inspector;
pub mod memory;
pub mod meta;
pub mod numa;
pub mod shell;
pub mod ssh;
pub mod tag;

pub use compose::{apply_provision_filters, compose_hard_filter};
pub use error::InspectError;
pub use inspector::{default_inspectors, perform_check, Inspector, InspectorSet};
pub use shell::{ExecOutput, RemoteExec, RemoteShell, ScriptedExec};
pub use ssh::SshExec;
