use super::classify::Policy;
use super::upstream::{FetchRequest, FetchResponse, Upstream, UpstreamError};
use super::Gateway;
use axum::body::Bytes;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use std::sync::Arc;

const OFFLINE_MESSAGE: &str = "Network unavailable, check your connection and try again";

const OFFLINE_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="UTF-8">
<title>Offline</title>
<style>
body { font-family: sans-serif; display: flex; justify-content: center; align-items: center; height: 100vh; margin: 0; }
.container { text-align: center; padding: 40px; }
</style>
</head>
<body>
<div class="container">
<h1>Offline</h1>
<p>The network connection is unavailable.</p>
<p>Check your connection and try again.</p>
<button onclick="location.reload()">Reload</button>
</div>
</body>
</html>
"#;

impl<U: Upstream> Gateway<U> {
    pub async fn handle(self: &Arc<Self>, request: FetchRequest) -> FetchResponse {
        // Nothing active yet: behave as a plain proxy
        let Some(namespace) = self.lifecycle.active_namespace() else {
            return self.pass_through(request).await;
        };

        match self.classifier.classify(request.path()) {
            Policy::NetworkFirst => self.network_first(&namespace, request).await,
            Policy::CacheFirst => self.cache_first(&namespace, request).await,
            Policy::PassThrough => self.pass_through(request).await,
        }
    }

    async fn network_first(&self, namespace: &str, request: FetchRequest) -> FetchResponse {
        let key = request.cache_key().to_string();
        let is_read = request.is_read();

        let fetched = match self.upstream.fetch(request).await {
            Ok(response) if is_read => self.store_and_return(namespace, &key, response).await,
            other => other,
        };
        match fetched {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("Network request for {} failed, trying cache: {}", key, e);
                if is_read {
                    if let Some(cached) = self.lookup(namespace, &key) {
                        return cached;
                    }
                }
                offline_json()
            }
        }
    }

    async fn cache_first(self: &Arc<Self>, namespace: &str, request: FetchRequest) -> FetchResponse {
        let key = request.cache_key().to_string();
        let is_read = request.is_read();

        if is_read {
            if let Some(cached) = self.lookup(namespace, &key) {
                self.spawn_refresh(namespace.to_string(), request);
                return cached;
            }
        }

        let navigation = request.is_navigation();
        let fetched = match self.upstream.fetch(request).await {
            Ok(response) if is_read => self.store_and_return(namespace, &key, response).await,
            other => other,
        };
        match fetched {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Cache-first fetch for {} failed: {}", key, e);
                if navigation {
                    offline_page()
                } else {
                    bad_gateway()
                }
            }
        }
    }

    async fn pass_through(&self, request: FetchRequest) -> FetchResponse {
        let uri = request.uri.clone();
        match self.upstream.fetch(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Upstream request for {} failed: {}", uri, e);
                bad_gateway()
            }
        }
    }

    /// Refetch a cached entry in the background; failures are ignored
    fn spawn_refresh(self: &Arc<Self>, namespace: String, request: FetchRequest) {
        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            let key = request.cache_key().to_string();
            match gateway.upstream.fetch(request).await {
                Ok(response) if response.is_success() => {
                    if let Err(e) = gateway.store_and_return(&namespace, &key, response).await {
                        tracing::debug!("Background refresh of {} failed: {}", key, e);
                    }
                }
                Ok(response) => {
                    tracing::debug!("Background refresh of {} returned {}", key, response.status);
                }
                Err(e) => tracing::debug!("Background refresh of {} failed: {}", key, e),
            }
        });
    }

    fn lookup(&self, namespace: &str, key: &str) -> Option<FetchResponse> {
        let cached = match self.store.get(namespace, key) {
            Ok(cached) => cached,
            Err(e) => {
                tracing::warn!("Cache read for {} failed: {}", key, e);
                None
            }
        };
        self.record_lookup(cached.is_some());
        cached.map(FetchResponse::from_cached)
    }

    /// Buffer and store a successful read. Failed and oversized responses
    /// stream through untouched.
    async fn store_and_return(
        &self,
        namespace: &str,
        key: &str,
        response: FetchResponse,
    ) -> Result<FetchResponse, UpstreamError> {
        if !response.is_success() {
            return Ok(response);
        }
        if !response.fits_cache() {
            tracing::debug!("Not caching {}: body too large", key);
            return Ok(response);
        }
        let (response, body) = response.buffered().await?;
        self.store_response(namespace, key, &response, &body);
        Ok(response)
    }

    fn store_response(&self, namespace: &str, key: &str, response: &FetchResponse, body: &Bytes) {
        // The namespace may have been replaced while the request was in flight
        if self.lifecycle.active_namespace().as_deref() != Some(namespace) {
            return;
        }
        if let Err(e) = self.store.put(namespace, &response.to_cached(key, body)) {
            tracing::warn!("Cache write for {} failed: {}", key, e);
        }
    }
}

fn synthesized(status: StatusCode, content_type: &'static str, body: Bytes) -> FetchResponse {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    FetchResponse::full(status, headers, body)
}

fn json_failure(status: StatusCode, value: serde_json::Value) -> FetchResponse {
    synthesized(status, "application/json", Bytes::from(value.to_string()))
}

pub(super) fn offline_json() -> FetchResponse {
    json_failure(
        StatusCode::SERVICE_UNAVAILABLE,
        serde_json::json!({
            "success": false,
            "message": OFFLINE_MESSAGE,
            "offline": true,
        }),
    )
}

pub(super) fn offline_page() -> FetchResponse {
    synthesized(
        StatusCode::SERVICE_UNAVAILABLE,
        "text/html; charset=utf-8",
        Bytes::from_static(OFFLINE_PAGE.as_bytes()),
    )
}

pub(super) fn bad_gateway() -> FetchResponse {
    json_failure(
        StatusCode::BAD_GATEWAY,
        serde_json::json!({
            "success": false,
            "message": "Upstream unavailable",
        }),
    )
}
