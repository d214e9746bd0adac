//! Requests forwarded to the upstream storage API / static UI server

use crate::storage::CachedResponse;
use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use std::future::Future;
use thiserror::Error;

/// Headers that describe a single hop and are never forwarded or stored
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// Marks responses served from the cache
pub const CACHE_HEADER: &str = "x-shelf-cache";

/// Largest response body held in memory to be written to the cache (64MB).
/// Larger responses are streamed to the client and not cached.
pub const MAX_CACHED_BODY_BYTES: usize = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("upstream unreachable: {0}")]
    Unreachable(String),
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid upstream url: {0}")]
    InvalidUrl(String),
    #[error("response body failed: {0}")]
    Body(#[from] axum::Error),
}

#[derive(Debug)]
pub struct FetchRequest {
    pub method: Method,
    /// Path plus query, also the cache key
    pub uri: String,
    pub headers: HeaderMap,
    /// Streamed to upstream as it arrives
    pub body: Body,
}

impl FetchRequest {
    pub fn get(uri: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            uri: uri.into(),
            headers: HeaderMap::new(),
            body: Body::empty(),
        }
    }

    /// Whether the client declared a body to forward
    pub fn has_body(&self) -> bool {
        self.headers.contains_key(header::TRANSFER_ENCODING)
            || content_length(&self.headers).is_some_and(|len| len > 0)
    }

    pub fn path(&self) -> &str {
        self.uri.split('?').next().unwrap_or("/")
    }

    pub fn cache_key(&self) -> &str {
        &self.uri
    }

    /// Only GET requests are looked up in or written to the cache
    pub fn is_read(&self) -> bool {
        self.method == Method::GET
    }

    /// A top-level page load rather than a subresource or API call
    pub fn is_navigation(&self) -> bool {
        let header_str = |name: &str| {
            self.headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_ascii_lowercase()
        };
        header_str("sec-fetch-dest") == "document"
            || header_str(header::ACCEPT.as_str()).contains("text/html")
    }
}

#[derive(Debug)]
pub struct FetchResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
}

impl FetchResponse {
    /// A response whose whole body is already in memory
    pub fn full(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: Body::from(body.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// False when the declared length is too large to buffer for the cache.
    /// Responses without a length are attempted.
    pub fn fits_cache(&self) -> bool {
        content_length(&self.headers).map_or(true, |len| len <= MAX_CACHED_BODY_BYTES as u64)
    }

    /// Read the whole body, returning it alongside a replayable response
    pub async fn buffered(self) -> Result<(Self, Bytes), UpstreamError> {
        let body = axum::body::to_bytes(self.body, MAX_CACHED_BODY_BYTES).await?;
        let response = Self::full(self.status, self.headers, body.clone());
        Ok((response, body))
    }

    pub fn to_cached(&self, key: &str, body: &Bytes) -> CachedResponse {
        let headers = self
            .headers
            .iter()
            .filter(|(name, _)| name.as_str() != CACHE_HEADER)
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        CachedResponse {
            key: key.to_string(),
            status: self.status.as_u16(),
            headers,
            body: body.to_vec(),
            stored_at: Utc::now(),
        }
    }

    /// Rebuild a response from the cache, tagged with the cache header
    pub fn from_cached(cached: CachedResponse) -> Self {
        let mut headers = HeaderMap::new();
        for (name, value) in &cached.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }

        if !headers.contains_key(header::CONTENT_TYPE) {
            let path = cached.key.split('?').next().unwrap_or("/");
            let mime = mime_guess::from_path(path).first_or_octet_stream();
            if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
        }
        headers.insert(
            HeaderName::from_static(CACHE_HEADER),
            HeaderValue::from_static("hit"),
        );

        Self::full(
            StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK),
            headers,
            cached.body,
        )
    }
}

impl IntoResponse for FetchResponse {
    fn into_response(self) -> Response {
        (self.status, self.headers, self.body).into_response()
    }
}

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Where intercepted requests are forwarded
pub trait Upstream: Send + Sync + 'static {
    fn fetch(
        &self,
        request: FetchRequest,
    ) -> impl Future<Output = Result<FetchResponse, UpstreamError>> + Send;
}

pub struct HttpUpstream {
    base_url: String,
    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new(base_url: &str) -> Result<Self, UpstreamError> {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(UpstreamError::InvalidUrl(base_url.to_string()));
        }
        // Redirects go back to the browser untouched
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn send(&self, request: FetchRequest) -> Result<FetchResponse, UpstreamError> {
        let url = format!("{}{}", self.base_url, request.uri);
        let has_body = request.has_body();
        let mut headers = request.headers;
        strip_hop_by_hop(&mut headers);

        let mut builder = self.client.request(request.method, &url).headers(headers);
        if has_body {
            builder = builder.body(reqwest::Body::wrap_stream(request.body.into_data_stream()));
        }
        let response = builder
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    UpstreamError::Unreachable(e.to_string())
                } else {
                    UpstreamError::Transport(e)
                }
            })?;

        let status = response.status();
        let mut headers = response.headers().clone();
        strip_hop_by_hop(&mut headers);
        let body = Body::from_stream(response.bytes_stream());

        Ok(FetchResponse { status, headers, body })
    }
}

impl Upstream for HttpUpstream {
    fn fetch(
        &self,
        request: FetchRequest,
    ) -> impl Future<Output = Result<FetchResponse, UpstreamError>> + Send {
        self.send(request)
    }
}
