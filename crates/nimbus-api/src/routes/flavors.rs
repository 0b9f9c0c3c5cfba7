use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use nimbus_compute::models::{Flavor, NewFlavor};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

pub async fn list_flavors(State(state): State<AppState>) -> Json<Vec<Flavor>> {
    Json(state.compute.catalog().list_flavors())
}

pub async fn get_flavor(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Flavor>, ApiError> {
    Ok(Json(state.compute.catalog().get_flavor(id)?))
}

pub async fn create_flavor(
    State(state): State<AppState>,
    payload: Result<Json<NewFlavor>, JsonRejection>,
) -> Result<(StatusCode, Json<Flavor>), ApiError> {
    let Json(req) = payload?;
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("flavor name must not be empty".into()));
    }
    if req.vcpus == 0 || req.memory_mb == 0 {
        return Err(ApiError::BadRequest(
            "flavor needs at least one vCPU and some memory".into(),
        ));
    }

    let flavor = state.compute.catalog().create_flavor(req)?;
    tracing::info!(flavor_id = %flavor.id, name = %flavor.name, "flavor created");
    Ok((StatusCode::CREATED, Json(flavor)))
}
