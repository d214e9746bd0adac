//! Gateway control channel and cache statistics

use super::error::AppError;
use super::upstream::Upstream;
use super::Gateway;
use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    ClearCache,
    SkipWaiting,
}

impl ControlMessage {
    pub fn parse(body: &[u8]) -> Result<Self, AppError> {
        serde_json::from_slice(body)
            .map_err(|e| AppError::BadRequest(format!("Unknown control message: {}", e)))
    }
}

pub async fn control<U: Upstream>(
    State(gateway): State<Arc<Gateway<U>>>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    match ControlMessage::parse(&body)? {
        ControlMessage::ClearCache => {
            gateway.lifecycle().clear_all()?;
            Ok(Json(serde_json::json!({ "success": true })))
        }
        ControlMessage::SkipWaiting => {
            let active = gateway.lifecycle().activate()?;
            Ok(Json(serde_json::json!({ "success": true, "active": active })))
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceStats {
    pub name: String,
    pub entries: u64,
    pub bytes: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub active: Option<String>,
    pub waiting: Option<String>,
    pub namespaces: Vec<NamespaceStats>,
    pub entries: u64,
    pub bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: String,
}

pub fn hit_rate(hits: u64, misses: u64) -> String {
    let total = hits + misses;
    if total == 0 {
        return "0.00%".to_string();
    }
    format!("{:.2}%", hits as f64 * 100.0 / total as f64)
}

pub async fn stats<U: Upstream>(
    State(gateway): State<Arc<Gateway<U>>>,
) -> Result<Json<CacheStats>, AppError> {
    let mut namespaces = Vec::new();
    for name in gateway.store.namespaces()? {
        let usage = gateway.store.usage(&name)?;
        namespaces.push(NamespaceStats {
            name,
            entries: usage.entries,
            bytes: usage.bytes,
        });
    }

    let (hits, misses) = gateway.lookup_counts();
    Ok(Json(CacheStats {
        active: gateway.lifecycle().active_namespace(),
        waiting: gateway.lifecycle().waiting_namespace(),
        entries: namespaces.iter().map(|n| n.entries).sum(),
        bytes: namespaces.iter().map(|n| n.bytes).sum(),
        namespaces,
        hits,
        misses,
        hit_rate: hit_rate(hits, misses),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::classify::Classifier;
    use crate::gateway::lifecycle::CacheLifecycle;
    use crate::gateway::router;
    use crate::gateway::testing::FakeUpstream;
    use crate::storage::CacheStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;

    async fn app(skip_waiting: bool) -> (TempDir, Arc<Gateway<FakeUpstream>>) {
        let temp = tempdir().unwrap();
        let store = Arc::new(CacheStore::new(temp.path()).unwrap());
        let lifecycle = CacheLifecycle::open(store.clone()).unwrap();
        let upstream = FakeUpstream::new()
            .with("/", "<html>home</html>")
            .with("/index.html", "<html>home</html>");
        lifecycle
            .install("v1.0.0", &upstream, &["/".to_string()])
            .await
            .unwrap();
        if skip_waiting {
            lifecycle.activate().unwrap();
        }
        let gateway = Gateway::new(store, lifecycle, upstream, Classifier::new(Vec::new()));
        (temp, Arc::new(gateway))
    }

    async fn send(
        gateway: &Arc<Gateway<FakeUpstream>>,
        method: &str,
        uri: &str,
        body: &str,
    ) -> (StatusCode, Bytes) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = router(gateway.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, body)
    }

    fn json(body: &Bytes) -> serde_json::Value {
        serde_json::from_slice(body).unwrap()
    }

    #[test]
    fn test_parse_control_message() {
        assert_eq!(
            ControlMessage::parse(br#"{"type":"CLEAR_CACHE"}"#).unwrap(),
            ControlMessage::ClearCache
        );
        assert_eq!(
            ControlMessage::parse(br#"{"type":"SKIP_WAITING","extra":1}"#).unwrap(),
            ControlMessage::SkipWaiting
        );
        assert!(ControlMessage::parse(br#"{"type":"REBOOT"}"#).is_err());
        assert!(ControlMessage::parse(b"not json").is_err());
    }

    #[test]
    fn test_hit_rate() {
        assert_eq!(hit_rate(0, 0), "0.00%");
        assert_eq!(hit_rate(1, 2), "33.33%");
        assert_eq!(hit_rate(4, 0), "100.00%");
    }

    #[tokio::test]
    async fn test_clear_cache_message() {
        let (_temp, gateway) = app(true).await;
        let (status, body) =
            send(&gateway, "POST", "/__shelf/control", r#"{"type":"CLEAR_CACHE"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body), serde_json::json!({ "success": true }));
        assert!(gateway.store.namespaces().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_message_rejected() {
        let (_temp, gateway) = app(true).await;
        let (status, body) =
            send(&gateway, "POST", "/__shelf/control", r#"{"type":"REBOOT"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json(&body)["success"], false);
    }

    #[tokio::test]
    async fn test_skip_waiting_message() {
        let (_temp, gateway) = app(false).await;
        assert_eq!(gateway.lifecycle().active_namespace(), None);

        let (status, body) =
            send(&gateway, "POST", "/__shelf/control", r#"{"type":"SKIP_WAITING"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["active"], "shelf-v1.0.0");
        assert_eq!(
            gateway.lifecycle().active_namespace().as_deref(),
            Some("shelf-v1.0.0")
        );
    }

    #[tokio::test]
    async fn test_request_body_reaches_upstream() {
        let (_temp, gateway) = app(true).await;
        let (status, _) = send(&gateway, "PUT", "/api/storage/upload", "chunk of a large file").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(
            gateway.upstream.received(),
            vec![(
                "/api/storage/upload".to_string(),
                Bytes::from_static(b"chunk of a large file")
            )]
        );
    }

    #[tokio::test]
    async fn test_stats_after_traffic() {
        let (_temp, gateway) = app(true).await;

        // Precached by install, so this is a hit
        let (status, body) = send(&gateway, "GET", "/", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Bytes::from_static(b"<html>home</html>"));
        // Miss, then stored
        send(&gateway, "GET", "/index.html", "").await;

        let (status, body) = send(&gateway, "GET", "/__shelf/stats", "").await;
        assert_eq!(status, StatusCode::OK);
        let stats = json(&body);
        assert_eq!(stats["active"], "shelf-v1.0.0");
        assert_eq!(stats["hits"], 1);
        assert_eq!(stats["misses"], 1);
        assert_eq!(stats["hitRate"], "50.00%");
        assert_eq!(stats["namespaces"][0]["name"], "shelf-v1.0.0");
        assert!(stats["entries"].as_u64().unwrap() >= 2);
    }
}
