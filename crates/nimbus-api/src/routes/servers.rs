use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use nimbus_compute::CreateServer;
use uuid::Uuid;

use crate::dto::{CreateServerRequest, ServerResponse};
use crate::error::ApiError;
use crate::state::AppState;

pub async fn list_servers(State(state): State<AppState>) -> Json<Vec<ServerResponse>> {
    Json(
        state
            .compute
            .list()
            .into_iter()
            .map(ServerResponse::from)
            .collect(),
    )
}

pub async fn get_server(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ServerResponse>, ApiError> {
    Ok(Json(state.compute.get(id)?.into()))
}

/// Accepts the build; the server is returned in `BUILD` and becomes
/// `ACTIVE` once the guest is up.
pub async fn create_server(
    State(state): State<AppState>,
    payload: Result<Json<CreateServerRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ServerResponse>), ApiError> {
    let Json(req) = payload?;
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("server name must not be empty".into()));
    }

    let server = state.compute.create(CreateServer {
        name: req.name,
        flavor_id: req.flavor_id,
        image_id: req.image_id,
    })?;
    Ok((StatusCode::ACCEPTED, Json(server.into())))
}

pub async fn delete_server(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.compute.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
