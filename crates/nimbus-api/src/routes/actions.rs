use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use nimbus_compute::models::Server;
use uuid::Uuid;

use crate::dto::{ServerAction, ServerResponse};
use crate::error::ApiError;
use crate::state::AppState;

/// `POST /servers/{id}/action`.
///
/// Reboot, rebuild and resize answer 202 while the server is in flight.
/// The other actions complete before answering 200, except `createImage`,
/// which answers 201 with the new image.
pub async fn server_action(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    payload: Result<Json<ServerAction>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(action) = payload?;
    let compute = &state.compute;

    let response = match action {
        ServerAction::Reboot { kind } => accepted(compute.reboot(id, kind)?),
        ServerAction::Rebuild { image_id } => accepted(compute.rebuild(id, image_id)?),
        ServerAction::Resize { flavor_id } => accepted(compute.resize(id, flavor_id)?),
        ServerAction::ConfirmResize => done(compute.confirm_resize(id).await?),
        ServerAction::RevertResize => done(compute.revert_resize(id).await?),
        ServerAction::Pause => done(compute.pause(id).await?),
        ServerAction::Unpause => done(compute.unpause(id).await?),
        ServerAction::Suspend => done(compute.suspend(id).await?),
        ServerAction::Resume => done(compute.resume(id).await?),
        ServerAction::Stop => done(compute.stop(id).await?),
        ServerAction::Start => done(compute.start(id).await?),
        ServerAction::CreateImage { name } => {
            if name.trim().is_empty() {
                return Err(ApiError::BadRequest("image name must not be empty".into()));
            }
            let image = compute.create_image(id, name).await?;
            // The image list changed underneath the catalog cache.
            state.cache.clear();
            (StatusCode::CREATED, Json(image)).into_response()
        }
    };
    Ok(response)
}

fn accepted(server: Server) -> Response {
    (StatusCode::ACCEPTED, Json(ServerResponse::from(server))).into_response()
}

fn done(server: Server) -> Response {
    (StatusCode::OK, Json(ServerResponse::from(server))).into_response()
}
