use std::sync::Arc;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Request, StatusCode, header};
use http_body_util::BodyExt;
use nimbus_compute::ComputeService;
use nimbus_compute::LifecycleConfig;
use nimbus_compute::ServerState;
use nimbus_compute::addresses::AddressPool;
use nimbus_compute::catalog::{Catalog, CatalogSeed};
use nimbus_compute::tracker::{HostCapacity, ResourceTracker};
use nimbus_infra::simulated::SimulatedDriver;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

use crate::config::ProviderCapabilities;
use crate::routes::api_router;
use crate::state::AppState;

pub struct TestApp {
    pub router: Router,
    pub compute: ComputeService,
    pub driver: Arc<SimulatedDriver>,
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn json<T: DeserializeOwned>(&self) -> T {
        serde_json::from_slice(&self.body).unwrap()
    }
}

impl TestApp {
    pub fn new(capabilities: ProviderCapabilities) -> Self {
        let driver = Arc::new(SimulatedDriver::new());
        let compute = ComputeService::new(
            Catalog::from_seed(CatalogSeed::builtin()).unwrap(),
            driver.clone(),
            ResourceTracker::new(HostCapacity::default()),
            AddressPool::new("10.0.0.0/24".parse().unwrap()),
            LifecycleConfig::default(),
        );
        let router = api_router(AppState::new(compute.clone(), capabilities));
        Self {
            router,
            compute,
            driver,
        }
    }

    pub async fn send(&self, req: Request<Body>) -> TestResponse {
        let response = self.router.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        TestResponse {
            status,
            headers,
            body,
        }
    }

    pub fn flavor_id(&self, name: &str) -> Uuid {
        self.compute
            .catalog()
            .list_flavors()
            .into_iter()
            .find(|f| f.name == name)
            .unwrap()
            .id
    }

    pub async fn first_image(&self) -> Value {
        let images: Vec<Value> = self.send(get("/images")).await.json();
        images[0].clone()
    }

    /// Create an `m1.small` server and wait until it is active.
    pub async fn create_server(&self) -> Value {
        let image = self.first_image().await;
        let response = self
            .send(post_json(
                "/servers",
                serde_json::json!({
                    "name": "web-1",
                    "flavor_id": self.flavor_id("m1.small"),
                    "image_id": image["id"],
                }),
            ))
            .await;
        assert_eq!(response.status, StatusCode::ACCEPTED);

        let server: Value = response.json();
        let id = Uuid::parse_str(server["id"].as_str().unwrap()).unwrap();
        self.compute
            .wait_for_state(id, ServerState::Active)
            .await
            .unwrap();
        server
    }
}

pub fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

pub fn delete(uri: &str) -> Request<Body> {
    Request::delete(uri).body(Body::empty()).unwrap()
}

pub fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}
