use async_trait::async_trait;
use hostpool_domain::Query;
use hostpool_query::ParameterMap;
use hostpool_store::MachineHandle;
use tokio_util::sync::CancellationToken;

use crate::error::ProvisionError;

/// A back end that acquires and releases external hosts.
///
/// `available` and `cost` are cheap and must not fail: a query a provisioner
/// cannot validate simply makes it unavailable. The async operations take
/// the owning task's cancellation token and must abort the external job when
/// it fires.
#[async_trait]
pub trait Provisioner: Send + Sync + 'static {
    /// Stable identifier stored in `machine.provisioner`.
    fn name(&self) -> &'static str;

    fn parameters(&self) -> ParameterMap;

    fn available(&self, query: &Query) -> bool;

    /// Expected provisioning cost in seconds. Infinity means unavailable.
    fn cost(&self, query: &Query) -> f64;

    /// Fulfil the query. On success every machine carries `hostname`,
    /// `cpu-arch`, `start_time` and whatever provider scratch it needs in
    /// `meta`.
    async fn provision(
        &self,
        machines: &mut [MachineHandle],
        query: &Query,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError>;

    /// Re-attach to an external job already recorded in machine `meta`,
    /// after a broker restart. Defaults to provisioning from scratch.
    async fn resume(
        &self,
        machines: &mut [MachineHandle],
        query: &Query,
        cancel: &CancellationToken,
    ) -> Result<(), ProvisionError> {
        self.provision(machines, query, cancel).await
    }

    /// Release the machines. Idempotent; may be called repeatedly for the
    /// same machine.
    async fn teardown(
        &self,
        machines: &mut [MachineHandle],
        query: &Query,
    ) -> Result<(), ProvisionError>;

    /// Whether the external resource has already been released on the
    /// provider side.
    async fn is_teardown(
        &self,
        machines: &[MachineHandle],
        query: &Query,
    ) -> Result<bool, ProvisionError>;
}
