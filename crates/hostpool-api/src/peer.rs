use std::net::IpAddr;

use tracing::debug;
use trust_dns_resolver::TokioAsyncResolver;

/// Candidate hostnames for the requesting peer: the raw IP plus whatever
/// reverse DNS knows it as. Machines are matched on any of them.
pub async fn resolve_peer_hostnames(
    resolver: Option<&TokioAsyncResolver>,
    addr: IpAddr,
) -> Vec<String> {
    let mut candidates = vec![addr.to_string()];
    let Some(resolver) = resolver else {
        return candidates;
    };
    match resolver.reverse_lookup(addr).await {
        Ok(lookup) => {
            for name in lookup.iter() {
                let name = name.to_utf8();
                let name = name.trim_end_matches('.').to_string();
                if !candidates.contains(&name) {
                    candidates.push(name);
                }
            }
        }
        Err(e) => debug!(peer = %addr, error = %e, "reverse lookup failed"),
    }
    candidates
}
