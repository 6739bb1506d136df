use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid machine status: {0}")]
    InvalidStatus(String),

    #[error("machine in status {status} must have field \"{field}\"")]
    MissingField { status: String, field: String },

    #[error("cannot coerce {got} into {wanted}")]
    Coercion { got: String, wanted: String },

    #[error("invalid field path: {0}")]
    InvalidPath(String),

    #[error("invalid task descriptor for {path}: {message}")]
    InvalidTaskDescriptor { path: String, message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
