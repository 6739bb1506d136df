use std::sync::Arc;

use hostpool_broker::Broker;
use trust_dns_resolver::TokioAsyncResolver;

use crate::session::SessionLayer;

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
    pub sessions: Arc<SessionLayer>,
    /// Reverse-DNS resolver for the peer-identity callbacks. Absent in
    /// tests; the raw peer IP is still matched.
    pub resolver: Option<Arc<TokioAsyncResolver>>,
}
