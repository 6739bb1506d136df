use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Insert would violate the unique index on `magic`.
    #[error("machine with magic '{0}' already exists")]
    DuplicateMagic(String),

    /// An atomic update targeted a machine that is no longer present,
    /// usually a race with the house-keeper.
    #[error("machine {0} no longer exists")]
    Conflict(String),

    #[error("invalid machine record: {0}")]
    Domain(#[from] hostpool_domain::DomainError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal store error: {0}")]
    Internal(String),
}
