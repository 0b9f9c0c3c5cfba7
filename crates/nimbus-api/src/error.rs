use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use nimbus_compute::Error as ComputeError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Compute(#[from] ComputeError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Compute(e) => compute_status(e),
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

fn compute_status(e: &ComputeError) -> StatusCode {
    match e {
        ComputeError::ServerNotFound(_)
        | ComputeError::FlavorNotFound(_)
        | ComputeError::ImageNotFound(_) => StatusCode::NOT_FOUND,
        ComputeError::InvalidStateTransition { .. }
        | ComputeError::ServerBusy(_)
        | ComputeError::DuplicateFlavor(_) => StatusCode::CONFLICT,
        ComputeError::IncompatibleImage { .. } | ComputeError::InvalidResize(_) => {
            StatusCode::BAD_REQUEST
        }
        ComputeError::ImageReadOnly(_) => StatusCode::FORBIDDEN,
        ComputeError::InsufficientCapacity(_) | ComputeError::AddressPoolExhausted => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        ComputeError::Driver(_) => StatusCode::BAD_GATEWAY,
    }
}
