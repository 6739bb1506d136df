use thiserror::Error;

#[derive(Debug, Error)]
pub enum InspectError {
    /// Failed to open or use the remote shell.
    #[error("transport error on {hostname}: {message}")]
    Transport { hostname: String, message: String },

    /// A probe command returned something unusable.
    #[error("command '{command}' failed: {message}")]
    Command { command: String, message: String },

    #[error("machine has no hostname to inspect")]
    NoHostname,

    #[error("store error: {0}")]
    Store(#[from] hostpool_store::StoreError),
}
