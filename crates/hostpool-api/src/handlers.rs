use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Query as UrlQuery, State};
use axum::Extension;
use axum::Json;
use hostpool_broker::Magic;
use hostpool_domain::{Machine, Op, Query, Term, Value};
use serde_json::{json, Value as JsonValue};

use crate::error::ApiError;
use crate::peer::resolve_peer_hostnames;
use crate::session::SessionData;
use crate::state::AppState;

/// How long `/machines/provision` blocks before handing back still-preparing
/// machines.
const PROVISION_WAIT: Duration = Duration::from_secs(5);

fn machines_json(machines: &[Machine]) -> Json<JsonValue> {
    Json(serde_json::to_value(machines).unwrap_or_else(|_| json!([])))
}

fn compile_url(state: &AppState, args: &[(String, String)]) -> Result<Query, ApiError> {
    Ok(state
        .broker
        .compile_args(args.iter().map(|(k, v)| (k.as_str(), v.as_str())))?)
}

pub async fn index() -> Json<JsonValue> {
    Json(json!({
        "message": "hostpool working.",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn parameters(State(state): State<AppState>) -> Json<JsonValue> {
    Json(state.broker.parameter_schema())
}

pub async fn provisioners(State(state): State<AppState>) -> Json<JsonValue> {
    Json(json!(state.broker.provisioner_display()))
}

pub async fn machines_get(
    State(state): State<AppState>,
    UrlQuery(args): UrlQuery<Vec<(String, String)>>,
) -> Result<Json<JsonValue>, ApiError> {
    let query = compile_url(&state, &args)?;
    let machines = state.broker.query(&query, None).await?;
    Ok(machines_json(&machines))
}

pub async fn machines_delete(
    State(state): State<AppState>,
    UrlQuery(args): UrlQuery<Vec<(String, String)>>,
) -> Result<Json<JsonValue>, ApiError> {
    let query = compile_url(&state, &args)?;
    let machines = state.broker.forget(&query).await?;
    Ok(machines_json(&machines))
}

pub async fn machines_provision(
    State(state): State<AppState>,
    Extension(session): Extension<Arc<SessionData>>,
    Json(body): Json<JsonValue>,
) -> Result<Json<JsonValue>, ApiError> {
    let query = state.broker.compile_json(&body)?;
    let magic = Magic::new(session);
    let machines = state
        .broker
        .provision(&query, Some(PROVISION_WAIT), Some(&magic))
        .await?;
    Ok(machines_json(&machines))
}

pub async fn machines_teardown(
    State(state): State<AppState>,
    Json(body): Json<JsonValue>,
) -> Result<Json<JsonValue>, ApiError> {
    let query = state.broker.compile_json(&body)?;
    let machines = state.broker.teardown(&query).await?;
    Ok(machines_json(&machines))
}

pub async fn machines_release(
    State(state): State<AppState>,
    Json(body): Json<JsonValue>,
) -> Result<Json<JsonValue>, ApiError> {
    let query = state.broker.compile_json(&body)?;
    let machines = state.broker.release(&query).await?;
    Ok(machines_json(&machines))
}

async fn request_inner(
    state: &AppState,
    session: Arc<SessionData>,
    query: Query,
) -> Result<Json<JsonValue>, ApiError> {
    let magic = Magic::new(session);
    let machines = state.broker.request(&query, Some(&magic)).await?;
    if machines.is_empty() {
        return Err(ApiError::not_found(
            "failed to find or provision a machine",
        ));
    }
    Ok(machines_json(&machines))
}

pub async fn machines_request_get(
    State(state): State<AppState>,
    Extension(session): Extension<Arc<SessionData>>,
    UrlQuery(args): UrlQuery<Vec<(String, String)>>,
) -> Result<Json<JsonValue>, ApiError> {
    let query = compile_url(&state, &args)?;
    request_inner(&state, session, query).await
}

pub async fn machines_request_post(
    State(state): State<AppState>,
    Extension(session): Extension<Arc<SessionData>>,
    Json(body): Json<JsonValue>,
) -> Result<Json<JsonValue>, ApiError> {
    let query = state.broker.compile_json(&body)?;
    request_inner(&state, session, query).await
}

// ── Peer-identity callbacks ───────────────────────────────────────────────────

async fn peer_query(state: &AppState, addr: SocketAddr) -> (Query, Vec<String>) {
    let candidates =
        resolve_peer_hostnames(state.resolver.as_deref(), addr.ip()).await;
    let mut query = Query::new();
    query.insert(
        "hostname",
        Term::op(Op::In, Value::StrList(candidates.clone())),
    );
    (query, candidates)
}

fn no_peer_machine(candidates: &[String]) -> ApiError {
    ApiError::bad_request(format!(
        "can't find a machine with any of the hostnames {:?}",
        candidates
    ))
}

pub async fn describ_me(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Json<JsonValue>, ApiError> {
    let (query, candidates) = peer_query(&state, addr).await;
    let machines = state.broker.query(&query, None).await?;
    if machines.is_empty() {
        return Err(no_peer_machine(&candidates));
    }
    Ok(machines_json(&machines))
}

pub async fn release_me(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Json<JsonValue>, ApiError> {
    let (query, candidates) = peer_query(&state, addr).await;
    let machines = state.broker.release(&query).await?;
    if machines.is_empty() {
        return Err(no_peer_machine(&candidates));
    }
    Ok(machines_json(&machines))
}

pub async fn tear_me_down(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Json<JsonValue>, ApiError> {
    let (query, candidates) = peer_query(&state, addr).await;
    let machines = match state.broker.teardown(&query).await {
        Ok(machines) => machines,
        Err(hostpool_broker::BrokerError::NoMachineMatched) => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    if machines.is_empty() {
        return Err(no_peer_machine(&candidates));
    }
    Ok(machines_json(&machines))
}
