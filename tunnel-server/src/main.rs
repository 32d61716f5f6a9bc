//! Public edge server entry point: control-plane handshake, public
//! HTTP proxy, and the admin read surface on separate listeners (the
//! admin surface stays internal-only).

use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tunnel_server::app_state::AppState;
use tunnel_server::config::Config;
use tunnel_server::deps::{Deps, NullTokenValidator};
use tunnel_server::persistence::InMemoryPersistence;
use tunnel_server::{admin, control, proxy_http};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "tunnel_server=info".into()))
        .init();

    let config = Config::default();
    let persistence = Arc::new(InMemoryPersistence::new());
    let deps = Deps::new(config.clone(), persistence, Arc::new(NullTokenValidator));
    let state = AppState::new(deps);

    let public_app = Router::new()
        .route("/tunnel", get(control::handle_handshake))
        .fallback(proxy_http::handle_public_request)
        .with_state(state.clone());

    let admin_app = admin::admin_router()
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let public_addr = config.listen_addr;
    let admin_addr = config.admin_listen_addr;

    info!(%public_addr, "public edge listening");
    info!(%admin_addr, "admin surface listening");

    let public_listener = tokio::net::TcpListener::bind(public_addr).await?;
    let admin_listener = tokio::net::TcpListener::bind(admin_addr).await?;

    let public_server = axum::serve(public_listener, public_app.into_make_service_with_connect_info::<SocketAddr>());
    let admin_server = axum::serve(admin_listener, admin_app);

    tokio::try_join!(
        async { public_server.await.map_err(anyhow::Error::from) },
        async { admin_server.await.map_err(anyhow::Error::from) },
    )?;

    Ok(())
}
