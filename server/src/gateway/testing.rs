//! In-memory upstream for gateway tests

use super::upstream::{FetchRequest, FetchResponse, Upstream, UpstreamError};
use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub struct FakeUpstream {
    pages: Mutex<HashMap<String, &'static str>>,
    received: Mutex<Vec<(String, Bytes)>>,
    offline: AtomicBool,
    calls: AtomicUsize,
}

impl FakeUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, uri: &str, body: &'static str) -> Self {
        self.set(uri, body);
        self
    }

    pub fn set(&self, uri: &str, body: &'static str) {
        self.pages.lock().unwrap().insert(uri.to_string(), body);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Non-empty request bodies seen so far, with their uri
    pub fn received(&self) -> Vec<(String, Bytes)> {
        self.received.lock().unwrap().clone()
    }
}

impl Upstream for FakeUpstream {
    fn fetch(
        &self,
        request: FetchRequest,
    ) -> impl Future<Output = Result<FetchResponse, UpstreamError>> + Send {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let offline = self.offline.load(Ordering::SeqCst);
        let page = self.pages.lock().unwrap().get(&request.uri).copied();
        async move {
            if offline {
                return Err(UpstreamError::Unreachable("connection refused".to_string()));
            }
            let body = axum::body::to_bytes(request.body, usize::MAX).await?;
            if !body.is_empty() {
                self.received.lock().unwrap().push((request.uri, body));
            }
            Ok(match page {
                Some(body) => FetchResponse::full(StatusCode::OK, HeaderMap::new(), body),
                None => FetchResponse::full(StatusCode::NOT_FOUND, HeaderMap::new(), "not found"),
            })
        }
    }
}
