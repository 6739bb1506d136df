use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::session::session_middleware;
use crate::state::AppState;

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::index))
        .route("/parameters", get(handlers::parameters))
        .route("/provisioners", get(handlers::provisioners))
        // Machines
        .route(
            "/machines",
            get(handlers::machines_get).delete(handlers::machines_delete),
        )
        .route("/machines/provision", post(handlers::machines_provision))
        .route("/machines/teardown", post(handlers::machines_teardown))
        .route("/machines/release", post(handlers::machines_release))
        .route(
            "/machines/request",
            get(handlers::machines_request_get).post(handlers::machines_request_post),
        )
        // Peer-identity callbacks
        .route("/release_me", get(handlers::release_me))
        .route("/describ_me", get(handlers::describ_me))
        .route("/tear_me_down", get(handlers::tear_me_down))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            session_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::header::{CONTENT_TYPE, COOKIE, SET_COOKIE};
    use axum::http::{Method, Request, StatusCode};
    use hostpool_broker::Broker;
    use hostpool_domain::MachineStatus;
    use hostpool_inspect::{default_inspectors, ScriptedExec};
    use hostpool_provision::{LocalProvisioner, ProvisionerRegistry};
    use hostpool_store::{MachineHandle, MachineStore, MemoryStore};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tower::util::ServiceExt;

    fn test_state() -> (AppState, Arc<dyn MachineStore>) {
        let store: Arc<dyn MachineStore> = Arc::new(MemoryStore::new());
        let mut provisioners = ProvisionerRegistry::new();
        provisioners.register(Arc::new(LocalProvisioner::new()));
        let broker = Broker::new(
            store.clone(),
            default_inspectors(),
            provisioners,
            Arc::new(ScriptedExec::small_vm()),
        )
        .unwrap();
        (
            AppState {
                broker: Arc::new(broker),
                sessions: Arc::new(crate::session::SessionLayer::new("test-secret")),
                resolver: None,
            },
            store,
        )
    }

    fn test_app() -> (Router, Arc<dyn MachineStore>) {
        let (state, store) = test_state();
        (build_app(state), store)
    }

    async fn insert_ready(store: &Arc<dyn MachineStore>, hostname: &str) {
        let mut handle = MachineHandle::create(store.clone());
        handle.stage("hostname", hostname).unwrap();
        handle.stage("provisioner", "local").unwrap();
        handle.stage("start_time", chrono::Utc::now()).unwrap();
        handle.stage("lifespan", 86400i64).unwrap();
        handle.stage("cpu-arch", "x86_64").unwrap();
        handle.stage_status(MachineStatus::Ready).unwrap();
        handle.save().await.unwrap();
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn provision_body() -> Body {
        Body::from(
            serde_json::json!({
                "cpu-arch": "x86_64",
                "memory-total_size": {"$gte": 8192},
                "count": 1,
            })
            .to_string(),
        )
    }

    #[tokio::test]
    async fn index_reports_version() {
        let (app, _) = test_app();
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert!(json["message"].as_str().unwrap().contains("working"));
        assert!(json["version"].is_string());
    }

    #[tokio::test]
    async fn parameters_schema_served() {
        let (app, _) = test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/parameters")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["count"]["type"], "int");
        assert_eq!(json["cpu-arch"]["type"], "str");
    }

    #[tokio::test]
    async fn provisioners_listed() {
        let (app, _) = test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/provisioners")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["local"], "local");
    }

    #[tokio::test]
    async fn machines_query_by_url_args() {
        let (app, store) = test_app();
        insert_ready(&store, "h1.example.com").await;

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/machines?hostname=h1.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json.as_array().unwrap().len(), 1);
        assert_eq!(json[0]["hostname"], "h1.example.com");

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/machines?hostname=ghost.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json.as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn malformed_query_is_400() {
        let (app, _) = test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/machines?cpu-num:wat=1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn provision_returns_machine_and_sets_session_cookie() {
        let (app, _) = test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/machines/provision")
                    .header(CONTENT_TYPE, "application/json")
                    .body(provision_body())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(SET_COOKIE));
        let json = body_json(response).await;
        let machines = json.as_array().unwrap();
        assert_eq!(machines.len(), 1);
        assert!(machines[0]["magic"].is_string());
        assert_eq!(machines[0]["provisioner"], "local");
        let status = machines[0]["status"].as_str().unwrap();
        assert!(status == "preparing" || status == "ready");
    }

    #[tokio::test]
    async fn repeated_provision_same_session_is_deduplicated() {
        let (app, _) = test_app();
        let first = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/machines/provision")
                    .header(CONTENT_TYPE, "application/json")
                    .body(provision_body())
                    .unwrap(),
            )
            .await
            .unwrap();
        let cookie = first.headers()[SET_COOKIE].to_str().unwrap().to_string();
        let cookie = cookie.split(';').next().unwrap().to_string();
        let first_magic = body_json(first).await[0]["magic"]
            .as_str()
            .unwrap()
            .to_string();

        // Same session: same machine comes back.
        let second = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/machines/provision")
                    .header(CONTENT_TYPE, "application/json")
                    .header(COOKIE, cookie.clone())
                    .body(provision_body())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            body_json(second).await[0]["magic"].as_str().unwrap(),
            first_magic
        );

        // A different session provisions its own machine.
        let other = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/machines/provision")
                    .header(CONTENT_TYPE, "application/json")
                    .body(provision_body())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_ne!(
            body_json(other).await[0]["magic"].as_str().unwrap(),
            first_magic
        );

        // magic=new within the first session also bypasses the memo.
        let fresh = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/machines/provision")
                    .header(CONTENT_TYPE, "application/json")
                    .header(COOKIE, cookie)
                    .body(Body::from(
                        serde_json::json!({
                            "cpu-arch": "x86_64",
                            "memory-total_size": {"$gte": 8192},
                            "count": 1,
                            "magic": "new",
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_ne!(
            body_json(fresh).await[0]["magic"].as_str().unwrap(),
            first_magic
        );
    }

    #[tokio::test]
    async fn noprovision_yields_406() {
        let (app, _) = test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/machines/provision")
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        serde_json::json!({"cpu-arch": "x86_64", "magic": "noprovision"})
                            .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
    }

    #[tokio::test]
    async fn request_then_release_round_trip() {
        let (app, store) = test_app();
        insert_ready(&store, "h1.example.com").await;

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/machines/request")
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        serde_json::json!({"hostname": "h1.example.com"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json[0]["status"], "reserved");

        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/machines/release")
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        serde_json::json!({"hostname": "h1.example.com"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn request_without_match_or_provisioner_is_406() {
        let (state, _) = test_state();
        // No provisioner at all: request can neither find nor provision.
        let store: Arc<dyn MachineStore> = Arc::new(MemoryStore::new());
        let broker = Broker::new(
            store,
            default_inspectors(),
            ProvisionerRegistry::new(),
            Arc::new(ScriptedExec::small_vm()),
        )
        .unwrap();
        let app = build_app(AppState {
            broker: Arc::new(broker),
            ..state
        });

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/machines/request?hostname=ghost.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_ACCEPTABLE);
    }

    #[tokio::test]
    async fn delete_machines_removes_records() {
        let (app, store) = test_app();
        insert_ready(&store, "h1.example.com").await;
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::DELETE)
                    .uri("/machines?hostname=h1.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let remaining = store
            .find_all(&hostpool_domain::Query::new(), None)
            .await
            .unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn describ_me_matches_peer_by_ip() {
        let (app, store) = test_app();
        insert_ready(&store, "10.0.0.4").await;

        let mut request = Request::builder()
            .uri("/describ_me")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 4], 40000))));
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json[0]["hostname"], "10.0.0.4");
    }

    #[tokio::test]
    async fn describ_me_unknown_peer_is_400() {
        let (app, _) = test_app();
        let mut request = Request::builder()
            .uri("/describ_me")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 1], 40000))));
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn tear_me_down_tears_down_peer_machine() {
        let (app, store) = test_app();
        insert_ready(&store, "10.0.0.7").await;

        let mut request = Request::builder()
            .uri("/tear_me_down")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 7], 40000))));
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let remaining = store
            .find_all(&hostpool_domain::Query::new(), None)
            .await
            .unwrap();
        assert!(remaining.is_empty());
    }
}
