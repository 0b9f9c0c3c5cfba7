//! Typed Rust client for the nimbus compute API.
//!
//! Honors the provider's optional HTTP behaviors: 203 answers count as
//! success, GETs are revalidated with `If-None-Match` against a local
//! ETag cache, redirects are followed, and the correlation id of the last
//! response is kept for logging.

mod types;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{ETAG, IF_NONE_MATCH};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use uuid::Uuid;

pub use types::*;

pub const DEFAULT_REQUEST_ID_HEADER: &str = "x-compute-request-id";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("compute api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("compute api {endpoint} returned {status}: {body}")]
    Api {
        endpoint: &'static str,
        status: StatusCode,
        body: String,
    },

    #[error("compute api response could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("server {id} did not reach {status} within {timeout:?}")]
    Timeout {
        id: Uuid,
        status: String,
        timeout: Duration,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Response body kept for ETag revalidation.
#[derive(Clone)]
struct Cached {
    etag: String,
    body: Vec<u8>,
}

/// Client for the compute REST API.
#[derive(Clone)]
pub struct ComputeClient {
    base_url: String,
    http: reqwest::Client,
    request_id_header: String,
    etags: Arc<Mutex<HashMap<String, Cached>>>,
    last_request_id: Arc<Mutex<Option<String>>>,
}

impl ComputeClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            http: reqwest::Client::new(),
            request_id_header: DEFAULT_REQUEST_ID_HEADER.into(),
            etags: Arc::default(),
            last_request_id: Arc::default(),
        }
    }

    /// Read correlation ids from `header` instead of the default.
    pub fn with_request_id_header(mut self, header: impl Into<String>) -> Self {
        self.request_id_header = header.into();
        self
    }

    /// Correlation id of the most recent response, if the provider sent one.
    pub fn last_request_id(&self) -> Option<String> {
        self.last_request_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn etags(&self) -> MutexGuard<'_, HashMap<String, Cached>> {
        self.etags.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_request_id(&self, resp: &reqwest::Response) {
        let id = resp
            .headers()
            .get(self.request_id_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        if id.is_some() {
            *self
                .last_request_id
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = id;
        }
    }

    /// Any 2xx, including 203 from a cache-serving provider, is success.
    async fn check(resp: reqwest::Response, endpoint: &'static str) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api {
                endpoint,
                status,
                body,
            });
        }
        Ok(resp)
    }

    /// Conditional GET: revalidates a cached body and reuses it on 304.
    async fn get_json<T: DeserializeOwned>(&self, path: &str, endpoint: &'static str) -> Result<T> {
        let url = self.url(path);
        let cached = self.etags().get(&url).cloned();

        let mut req = self.http.get(&url);
        if let Some(cached) = &cached {
            req = req.header(IF_NONE_MATCH, cached.etag.as_str());
        }
        let resp = req.send().await?;
        self.record_request_id(&resp);

        if resp.status() == StatusCode::NOT_MODIFIED {
            if let Some(cached) = cached {
                return Ok(serde_json::from_slice(&cached.body)?);
            }
            return Err(Error::Api {
                endpoint,
                status: StatusCode::NOT_MODIFIED,
                body: "not modified without a cached body".into(),
            });
        }

        let resp = Self::check(resp, endpoint).await?;
        let etag = resp
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = resp.bytes().await?.to_vec();
        let value = serde_json::from_slice(&body)?;

        match etag {
            Some(etag) => {
                self.etags().insert(url, Cached { etag, body });
            }
            None => {
                self.etags().remove(&url);
            }
        }
        Ok(value)
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        endpoint: &'static str,
    ) -> Result<T> {
        let resp = self.http.post(self.url(path)).json(body).send().await?;
        self.record_request_id(&resp);

        Self::check(resp, endpoint)
            .await?
            .json()
            .await
            .map_err(Error::from)
    }

    async fn delete(&self, path: &str, endpoint: &'static str) -> Result<()> {
        let resp = self.http.delete(self.url(path)).send().await?;
        self.record_request_id(&resp);

        Self::check(resp, endpoint).await?;
        Ok(())
    }

    async fn action<T: DeserializeOwned>(
        &self,
        id: Uuid,
        body: Value,
        endpoint: &'static str,
    ) -> Result<T> {
        self.post_json(&format!("/servers/{id}/action"), &body, endpoint)
            .await
    }

    // ── Flavors ──────────────────────────────────────────────────────

    pub async fn list_flavors(&self) -> Result<Vec<Flavor>> {
        self.get_json("/flavors", "list flavors").await
    }

    pub async fn get_flavor(&self, id: Uuid) -> Result<Flavor> {
        self.get_json(&format!("/flavors/{id}"), "get flavor").await
    }

    pub async fn create_flavor(&self, req: &CreateFlavorRequest) -> Result<Flavor> {
        self.post_json("/flavors", req, "create flavor").await
    }

    // ── Images ───────────────────────────────────────────────────────

    pub async fn list_images(&self) -> Result<Vec<Image>> {
        self.get_json("/images", "list images").await
    }

    pub async fn get_image(&self, id: Uuid) -> Result<Image> {
        self.get_json(&format!("/images/{id}"), "get image").await
    }

    pub async fn create_image(&self, req: &CreateImageRequest) -> Result<Image> {
        self.post_json("/images", req, "create image").await
    }

    pub async fn delete_image(&self, id: Uuid) -> Result<()> {
        self.delete(&format!("/images/{id}"), "delete image").await
    }

    /// Download image contents, following the provider's redirect to the
    /// image store.
    pub async fn download_image(&self, id: Uuid) -> Result<Vec<u8>> {
        let resp = self
            .http
            .get(self.url(&format!("/images/{id}/file")))
            .send()
            .await?;
        self.record_request_id(&resp);

        let bytes = Self::check(resp, "download image").await?.bytes().await?;
        Ok(bytes.to_vec())
    }

    // ── Servers ──────────────────────────────────────────────────────

    pub async fn list_servers(&self) -> Result<Vec<Server>> {
        self.get_json("/servers", "list servers").await
    }

    pub async fn get_server(&self, id: Uuid) -> Result<Server> {
        self.get_json(&format!("/servers/{id}"), "get server").await
    }

    pub async fn create_server(&self, req: &CreateServerRequest) -> Result<Server> {
        self.post_json("/servers", req, "create server").await
    }

    pub async fn delete_server(&self, id: Uuid) -> Result<()> {
        self.delete(&format!("/servers/{id}"), "delete server").await
    }

    /// Poll until the server shows `status`.
    pub async fn wait_for_status(
        &self,
        id: Uuid,
        status: &str,
        poll: Duration,
        timeout: Duration,
    ) -> Result<Server> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let server = self.get_server(id).await?;
            if server.status == status {
                return Ok(server);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout {
                    id,
                    status: status.to_owned(),
                    timeout,
                });
            }
            tokio::time::sleep(poll).await;
        }
    }

    // ── Server actions ───────────────────────────────────────────────

    pub async fn reboot(&self, id: Uuid, kind: RebootType) -> Result<Server> {
        self.action(id, json!({ "reboot": { "type": kind } }), "reboot")
            .await
    }

    pub async fn rebuild(&self, id: Uuid, image_id: Uuid) -> Result<Server> {
        self.action(id, json!({ "rebuild": { "image_id": image_id } }), "rebuild")
            .await
    }

    pub async fn resize(&self, id: Uuid, flavor_id: Uuid) -> Result<Server> {
        self.action(id, json!({ "resize": { "flavor_id": flavor_id } }), "resize")
            .await
    }

    pub async fn confirm_resize(&self, id: Uuid) -> Result<Server> {
        self.action(id, json!({ "confirmResize": null }), "confirm resize")
            .await
    }

    pub async fn revert_resize(&self, id: Uuid) -> Result<Server> {
        self.action(id, json!({ "revertResize": null }), "revert resize")
            .await
    }

    pub async fn pause(&self, id: Uuid) -> Result<Server> {
        self.action(id, json!({ "pause": null }), "pause").await
    }

    pub async fn unpause(&self, id: Uuid) -> Result<Server> {
        self.action(id, json!({ "unpause": null }), "unpause").await
    }

    pub async fn suspend(&self, id: Uuid) -> Result<Server> {
        self.action(id, json!({ "suspend": null }), "suspend").await
    }

    pub async fn resume(&self, id: Uuid) -> Result<Server> {
        self.action(id, json!({ "resume": null }), "resume").await
    }

    pub async fn stop(&self, id: Uuid) -> Result<Server> {
        self.action(id, json!({ "os-stop": null }), "stop").await
    }

    pub async fn start(&self, id: Uuid) -> Result<Server> {
        self.action(id, json!({ "os-start": null }), "start").await
    }

    /// Capture the server's disk as a custom image.
    pub async fn snapshot_server(&self, id: Uuid, name: &str) -> Result<Image> {
        self.action(id, json!({ "createImage": { "name": name } }), "create server image")
            .await
    }

    // ── Host ─────────────────────────────────────────────────────────

    pub async fn host_usage(&self) -> Result<HostUsage> {
        self.get_json("/host/usage", "host usage").await
    }
}
