use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::http::header::LOCATION;
use axum::response::{IntoResponse, Response};
use nimbus_compute::models::{Image, NewImage};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

pub async fn list_images(State(state): State<AppState>) -> Json<Vec<Image>> {
    Json(state.compute.catalog().list_images())
}

pub async fn get_image(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Image>, ApiError> {
    Ok(Json(state.compute.catalog().get_image(id)?))
}

/// Register an operator image.
pub async fn create_image(
    State(state): State<AppState>,
    payload: Result<Json<NewImage>, JsonRejection>,
) -> Result<(StatusCode, Json<Image>), ApiError> {
    let Json(req) = payload?;
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("image name must not be empty".into()));
    }

    let image = state.compute.catalog().register_image(req);
    tracing::info!(image_id = %image.id, name = %image.name, "image registered");
    Ok((StatusCode::CREATED, Json(image)))
}

pub async fn delete_image(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.compute.delete_image(id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Image bytes live in the image store; send the client there.
pub async fn image_file(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let caps = &state.capabilities;
    let store = caps
        .image_store_url
        .as_deref()
        .filter(|_| caps.supports_redirect)
        .ok_or(ApiError::NotFound)?;
    let image = state.compute.catalog().get_image(id)?;

    let location = format!("{}/{}", store.trim_end_matches('/'), image.id);
    Ok((StatusCode::FOUND, [(LOCATION, location)]).into_response())
}
