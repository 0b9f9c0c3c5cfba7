//! Provider capability layer.
//!
//! Conditional GET, the catalog response cache and correlation ids are
//! applied here around every route, switched by [`ProviderCapabilities`].
//!
//! [`ProviderCapabilities`]: crate::config::ProviderCapabilities

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::header::{CONTENT_LENGTH, ETAG, IF_NONE_MATCH};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http_body_util::BodyExt;
use nimbus_infra::types::checksum;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// Reads under these prefixes are served from the response cache.
const CACHED_PREFIXES: [&str; 2] = ["/flavors", "/images"];

#[derive(Clone)]
struct CachedResponse {
    headers: HeaderMap,
    body: Bytes,
}

#[derive(Default)]
struct Entries {
    /// Bumped on every clear.
    generation: u64,
    by_key: HashMap<String, CachedResponse>,
}

/// Catalog responses keyed by path and query.
#[derive(Clone, Default)]
pub struct ResponseCache {
    entries: Arc<Mutex<Entries>>,
}

impl ResponseCache {
    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&self, key: &str) -> Option<CachedResponse> {
        self.lock().by_key.get(key).cloned()
    }

    fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Store `entry` unless the cache was cleared since `generation` was
    /// read; a read racing a write must not outlive it.
    fn insert(&self, key: String, entry: CachedResponse, generation: u64) {
        let mut entries = self.lock();
        if entries.generation == generation {
            entries.by_key.insert(key, entry);
        }
    }

    pub fn clear(&self) {
        let mut entries = self.lock();
        entries.generation += 1;
        entries.by_key.clear();
    }
}

pub async fn capabilities_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let caps = state.capabilities.clone();
    let request_id = req
        .headers()
        .get(&caps.request_id_header)
        .cloned()
        .or_else(|| HeaderValue::from_str(&Uuid::new_v4().to_string()).ok());
    let if_none_match = req.headers().get(IF_NONE_MATCH).cloned();
    let method = req.method().clone();
    let catalog = is_catalog(req.uri().path());

    let mut response = if catalog && method == Method::GET {
        let key = req
            .uri()
            .path_and_query()
            .map_or_else(|| req.uri().path().to_owned(), |pq| pq.as_str().to_owned());
        cached(&state, key, req, next).await
    } else {
        let response = next.run(req).await;
        if catalog {
            state.cache.clear();
        }
        response
    };

    if caps.supports_etag
        && method == Method::GET
        && matches!(
            response.status(),
            StatusCode::OK | StatusCode::NON_AUTHORITATIVE_INFORMATION
        )
    {
        response = with_etag(response, if_none_match.as_ref()).await;
    }

    if let Some(id) = request_id {
        response
            .headers_mut()
            .insert(caps.request_id_header.clone(), id);
    }
    response
}

fn is_catalog(path: &str) -> bool {
    CACHED_PREFIXES.iter().any(|prefix| {
        path.strip_prefix(prefix)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
    })
}

async fn cached(state: &AppState, key: String, req: Request, next: Next) -> Response {
    if let Some(hit) = state.cache.get(&key) {
        let mut response = Response::new(Body::from(hit.body));
        *response.status_mut() = if state.capabilities.supports_cache_203 {
            StatusCode::NON_AUTHORITATIVE_INFORMATION
        } else {
            StatusCode::OK
        };
        *response.headers_mut() = hit.headers;
        return response;
    }

    let generation = state.cache.generation();
    let response = next.run(req).await;
    if response.status() != StatusCode::OK {
        return response;
    }

    let (parts, body) = response.into_parts();
    let body = match buffer(body).await {
        Ok(body) => body,
        Err(e) => return e.into_response(),
    };
    state.cache.insert(
        key,
        CachedResponse {
            headers: parts.headers.clone(),
            body: body.clone(),
        },
        generation,
    );
    Response::from_parts(parts, Body::from(body))
}

/// Tag the response with a strong ETag over its body, or answer 304 when
/// the client already holds it.
async fn with_etag(response: Response, if_none_match: Option<&HeaderValue>) -> Response {
    let (mut parts, body) = response.into_parts();
    let body = match buffer(body).await {
        Ok(body) => body,
        Err(e) => return e.into_response(),
    };

    let tag = format!("\"{}\"", checksum(&[&body[..]]));
    let Ok(etag) = HeaderValue::from_str(&tag) else {
        return Response::from_parts(parts, Body::from(body));
    };
    parts.headers.insert(ETAG, etag);

    let matched = if_none_match
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| {
            v.split(',')
                .map(str::trim)
                .any(|candidate| candidate == "*" || candidate == tag)
        });
    if matched {
        parts.status = StatusCode::NOT_MODIFIED;
        parts.headers.remove(CONTENT_LENGTH);
        return Response::from_parts(parts, Body::empty());
    }

    Response::from_parts(parts, Body::from(body))
}

async fn buffer(body: Body) -> Result<Bytes, ApiError> {
    body.collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| ApiError::Internal(format!("failed to buffer response: {e}")))
}

#[cfg(test)]
mod tests {
    use axum::http::header::LOCATION;

    use super::*;
    use crate::config::ProviderCapabilities;
    use crate::test_support::{TestApp, get, post_json};

    #[test]
    fn catalog_prefixes_match_whole_segments() {
        assert!(is_catalog("/flavors"));
        assert!(is_catalog("/images/abc/file"));
        assert!(!is_catalog("/flavorsx"));
        assert!(!is_catalog("/servers"));
    }

    #[test]
    fn read_started_before_a_write_is_not_cached() {
        let cache = ResponseCache::default();
        let entry = CachedResponse {
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"[]"),
        };

        let before_write = cache.generation();
        cache.clear();
        cache.insert("/flavors".into(), entry.clone(), before_write);
        assert!(cache.get("/flavors").is_none());

        cache.insert("/flavors".into(), entry, cache.generation());
        assert!(cache.get("/flavors").is_some());
    }

    #[tokio::test]
    async fn repeated_catalog_read_is_served_from_cache() {
        let app = TestApp::new(ProviderCapabilities::default());

        let first = app.send(get("/flavors")).await;
        let second = app.send(get("/flavors")).await;

        assert_eq!(first.status, StatusCode::OK);
        assert_eq!(second.status, StatusCode::NON_AUTHORITATIVE_INFORMATION);
        assert_eq!(first.body, second.body);
        assert_eq!(first.headers.get(ETAG), second.headers.get(ETAG));
    }

    #[tokio::test]
    async fn cache_hits_answer_200_without_203_support() {
        let app = TestApp::new(ProviderCapabilities {
            supports_cache_203: false,
            ..ProviderCapabilities::default()
        });

        app.send(get("/images")).await;
        let second = app.send(get("/images")).await;
        assert_eq!(second.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn catalog_writes_invalidate_cache() {
        let app = TestApp::new(ProviderCapabilities::default());
        app.send(get("/flavors")).await;

        let created = app
            .send(post_json(
                "/flavors",
                serde_json::json!({"name": "c1.huge", "vcpus": 16, "memory_mb": 65536, "disk_gb": 500}),
            ))
            .await;
        assert_eq!(created.status, StatusCode::CREATED);

        let listed = app.send(get("/flavors")).await;
        assert_eq!(listed.status, StatusCode::OK);
        let names: Vec<String> = listed.json::<Vec<serde_json::Value>>()
            .iter()
            .map(|f| f["name"].as_str().unwrap_or_default().to_owned())
            .collect();
        assert!(names.contains(&"c1.huge".to_owned()));
    }

    #[tokio::test]
    async fn matching_if_none_match_returns_304() {
        let app = TestApp::new(ProviderCapabilities::default());
        let server = app.create_server().await;
        let uri = format!("/servers/{}", server["id"].as_str().unwrap());

        let first = app.send(get(&uri)).await;
        let etag = first.headers.get(ETAG).cloned().unwrap();
        assert!(etag.to_str().unwrap().starts_with('"'));

        let mut req = get(&uri);
        req.headers_mut().insert(IF_NONE_MATCH, etag.clone());
        let second = app.send(req).await;
        assert_eq!(second.status, StatusCode::NOT_MODIFIED);
        assert!(second.body.is_empty());
        assert_eq!(second.headers.get(ETAG), Some(&etag));

        let mut req = get(&uri);
        req.headers_mut()
            .insert(IF_NONE_MATCH, HeaderValue::from_static("\"stale\""));
        assert_eq!(app.send(req).await.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn etags_can_be_disabled() {
        let app = TestApp::new(ProviderCapabilities {
            supports_etag: false,
            ..ProviderCapabilities::default()
        });
        let response = app.send(get("/flavors")).await;
        assert!(response.headers.get(ETAG).is_none());
    }

    #[tokio::test]
    async fn request_id_is_generated_or_propagated() {
        let app = TestApp::new(ProviderCapabilities::default());

        let generated = app.send(get("/servers")).await;
        let id = generated.headers.get("x-compute-request-id").unwrap();
        assert!(Uuid::parse_str(id.to_str().unwrap()).is_ok());

        let mut req = get("/servers");
        req.headers_mut()
            .insert("x-compute-request-id", HeaderValue::from_static("req-42"));
        let echoed = app.send(req).await;
        assert_eq!(echoed.headers.get("x-compute-request-id").unwrap(), "req-42");

        // Errors carry it too.
        let missing = app.send(get(&format!("/servers/{}", Uuid::new_v4()))).await;
        assert_eq!(missing.status, StatusCode::NOT_FOUND);
        assert!(missing.headers.contains_key("x-compute-request-id"));
    }

    #[tokio::test]
    async fn image_file_redirects_to_store_when_enabled() {
        let app = TestApp::new(ProviderCapabilities {
            supports_redirect: true,
            image_store_url: Some("https://images.example.com/store/".into()),
            ..ProviderCapabilities::default()
        });
        let image = app.first_image().await;
        let id = image["id"].as_str().unwrap();

        let response = app.send(get(&format!("/images/{id}/file"))).await;
        assert_eq!(response.status, StatusCode::FOUND);
        assert_eq!(
            response.headers.get(LOCATION).unwrap(),
            format!("https://images.example.com/store/{id}").as_str()
        );
    }

    #[tokio::test]
    async fn image_file_is_missing_without_redirect_support() {
        let app = TestApp::new(ProviderCapabilities::default());
        let image = app.first_image().await;
        let id = image["id"].as_str().unwrap();

        let response = app.send(get(&format!("/images/{id}/file"))).await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }
}
