use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The back end rejected the job after all submission retries.
    #[error("job submission failed: {0}")]
    Submit(String),

    /// The external provider could not fulfil the request.
    #[error("provisioning failed: {0}")]
    External(String),

    #[error("provisioning cancelled")]
    Cancelled,

    #[error("query not acceptable: {0}")]
    Validate(#[from] hostpool_query::QueryError),

    #[error("store error: {0}")]
    Store(#[from] hostpool_store::StoreError),
}
