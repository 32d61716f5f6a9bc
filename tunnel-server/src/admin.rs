//! Admin HTTP Surface: the minimal internal JSON endpoints
//! the (out-of-scope) frontend consumes for listing tunnels and
//! inspecting/replaying captured requests. Every handler returns
//! `Result<Json<_>, ServiceError>` — `ServiceError`'s `IntoResponse`
//! impl (see `error.rs`) turns a rejection into the right status code
//! and a `{"error": "..."}` body.

use crate::app_state::AppState;
use crate::error::{ServiceError, ServiceResult};
use crate::model::{RequestId, RequestRecordFilter, Tunnel, TunnelId};
use crate::persistence::Page;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

pub fn admin_router() -> Router<AppState> {
    Router::new()
        .route("/api/tunnels", get(list_tunnels))
        .route("/api/tunnels/{id}", get(get_tunnel))
        .route("/api/tunnels/{id}/disconnect", post(disconnect_tunnel))
        .route("/api/tunnels/{id}/requests", get(list_requests))
        .route("/api/tunnels/{id}/requests/{request_id}", get(get_request))
        .route("/api/tunnels/{id}/requests/{request_id}/replay", post(replay_request))
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    #[serde(default)]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

async fn list_tunnels(State(state): State<AppState>, Query(page): Query<PageQuery>) -> ServiceResult<Json<Vec<Tunnel>>> {
    let tunnels = state
        .deps
        .persistence
        .list_all_tunnels(Page {
            offset: page.offset,
            limit: page.limit,
        })
        .await?;
    Ok(Json(tunnels))
}

async fn get_tunnel(State(state): State<AppState>, Path(id): Path<TunnelId>) -> ServiceResult<Json<Tunnel>> {
    let tunnel = state
        .deps
        .persistence
        .get_tunnel(id)
        .await?
        .ok_or(ServiceError::TunnelRecordNotFound)?;
    Ok(Json(tunnel))
}

async fn disconnect_tunnel(State(state): State<AppState>, Path(id): Path<TunnelId>) -> ServiceResult<Json<serde_json::Value>> {
    let session = state.registry.lookup_by_id(id).ok_or(ServiceError::TunnelDisconnected)?;
    session.terminate("admin disconnect").await;
    Ok(Json(serde_json::json!({ "disconnected": true })))
}

#[derive(Debug, Deserialize)]
struct RequestsQuery {
    method: Option<String>,
    path: Option<String>,
    #[serde(default)]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

async fn list_requests(
    State(state): State<AppState>,
    Path(id): Path<TunnelId>,
    Query(query): Query<RequestsQuery>,
) -> ServiceResult<Json<Vec<crate::model::RequestRecord>>> {
    let records = state
        .request_log
        .list(
            id,
            RequestRecordFilter {
                method: query.method,
                path: query.path,
                limit: query.limit,
                offset: query.offset,
            },
        )
        .await?;
    Ok(Json(records))
}

async fn get_request(
    State(state): State<AppState>,
    Path((tunnel_id, request_id)): Path<(TunnelId, RequestId)>,
) -> ServiceResult<Json<crate::model::RequestRecord>> {
    let record = state.request_log.get(tunnel_id, request_id).await?;
    Ok(Json(record))
}

async fn replay_request(
    State(state): State<AppState>,
    Path((tunnel_id, request_id)): Path<(TunnelId, RequestId)>,
) -> ServiceResult<Json<crate::model::RequestRecord>> {
    let record = state
        .request_log
        .replay(&state.registry, &state.deps, tunnel_id, request_id)
        .await?;
    Ok(Json(record))
}
