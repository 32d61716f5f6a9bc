//! Integration tests for the Admin HTTP Surface, driven through
//! `tower::ServiceExt::oneshot` without binding a real socket, exercising
//! routes directly the same way the handler-level unit tests do.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use std::sync::Arc;
use tower::ServiceExt;
use tunnel_server::admin::admin_router;
use tunnel_server::app_state::AppState;
use tunnel_server::deps::{Deps, NullTokenValidator};
use tunnel_server::model::{Tunnel, TunnelStatus};
use tunnel_server::persistence::{InMemoryPersistence, PersistenceAdapter};
use uuid::Uuid;

fn sample_tunnel(id: Uuid) -> Tunnel {
    let now = chrono::Utc::now();
    Tunnel {
        id,
        subdomain: "abc".into(),
        protocol: tunnel_protocol::TunnelProtocol::Http,
        local_url: "http://localhost:3000".into(),
        public_url: "https://abc.example.test".into(),
        custom_domain: None,
        owner_user_id: None,
        status: TunnelStatus::Active,
        allocated_port: None,
        created_at: now,
        last_active_at: now,
        active_since: Some(now),
    }
}

async fn test_state() -> (AppState, Uuid) {
    let persistence = Arc::new(InMemoryPersistence::new());
    let id = Uuid::new_v4();
    persistence.save_tunnel(&sample_tunnel(id)).await.unwrap();
    let deps = Deps::new(
        tunnel_server::config::Config::default(),
        persistence,
        Arc::new(NullTokenValidator),
    );
    (AppState::new(deps), id)
}

#[tokio::test]
async fn list_tunnels_returns_saved_rows() {
    let (state, id) = test_state().await;
    let router = admin_router().with_state(state);

    let response = router
        .oneshot(Request::builder().uri("/api/tunnels").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let tunnels: Vec<Tunnel> = serde_json::from_slice(&body).unwrap();
    assert_eq!(tunnels.len(), 1);
    assert_eq!(tunnels[0].id, id);
}

#[tokio::test]
async fn get_unknown_tunnel_is_404() {
    let (state, _id) = test_state().await;
    let router = admin_router().with_state(state);

    let response = router
        .oneshot(
            Request::builder()
                .uri(format!("/api/tunnels/{}", Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn disconnect_without_active_session_is_503() {
    let (state, id) = test_state().await;
    let router = admin_router().with_state(state);

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/api/tunnels/{id}/disconnect"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn replay_of_unknown_request_is_404() {
    let (state, id) = test_state().await;
    let router = admin_router().with_state(state);

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/api/tunnels/{id}/requests/{}/replay", Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
