use axum::Json;
use axum::extract::State;

use crate::dto::HostUsageResponse;
use crate::state::AppState;

pub async fn usage(State(state): State<AppState>) -> Json<HostUsageResponse> {
    let compute = &state.compute;
    Json(HostUsageResponse::new(
        compute.tracker().capacity(),
        compute.usage(),
        compute.list().len(),
    ))
}
