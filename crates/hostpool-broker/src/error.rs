use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task cancelled")]
    Cancelled,

    #[error("provision failed: {0}")]
    Provision(#[from] hostpool_provision::ProvisionError),

    #[error("inspection failed: {0}")]
    Inspect(#[from] hostpool_inspect::InspectError),

    #[error("teardown failed via provisioner '{0}'")]
    Teardown(String),

    #[error("query error: {0}")]
    Query(#[from] hostpool_query::QueryError),

    #[error("store error: {0}")]
    Store(#[from] hostpool_store::StoreError),
}

#[derive(Debug, Error)]
pub enum BrokerError {
    /// No provisioner reports itself available for the query.
    #[error("no provisioner can fulfil this query")]
    NoProvisioner,

    /// The request carried `magic=noprovision`.
    #[error("provisioning is not allowed for this request")]
    ProvisionNotAllowed,

    #[error("no machine matched the query")]
    NoMachineMatched,

    /// The machine is already owned by an incompatible task.
    #[error("machine {0} is busy with another task")]
    TaskConflict(String),

    #[error(transparent)]
    Query(#[from] hostpool_query::QueryError),

    #[error(transparent)]
    Store(#[from] hostpool_store::StoreError),

    #[error(transparent)]
    Task(#[from] TaskError),
}
