pub mod actions;
pub mod flavors;
pub mod host;
pub mod images;
pub mod servers;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};

use crate::capabilities::capabilities_middleware;
use crate::state::AppState;

pub fn api_router(state: AppState) -> Router {
    Router::new()
        // Flavors
        .route(
            "/flavors",
            get(flavors::list_flavors).post(flavors::create_flavor),
        )
        .route("/flavors/{id}", get(flavors::get_flavor))
        // Images
        .route("/images", get(images::list_images).post(images::create_image))
        .route(
            "/images/{id}",
            get(images::get_image).delete(images::delete_image),
        )
        .route("/images/{id}/file", get(images::image_file))
        // Servers
        .route(
            "/servers",
            get(servers::list_servers).post(servers::create_server),
        )
        .route(
            "/servers/{id}",
            get(servers::get_server).delete(servers::delete_server),
        )
        .route("/servers/{id}/action", post(actions::server_action))
        // Host
        .route("/host/usage", get(host::usage))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            capabilities_middleware,
        ))
        .with_state(state)
}
