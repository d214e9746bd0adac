//! Versioned cache namespaces
//!
//! A deployment installs its version into a fresh namespace, then activates
//! it. Activation deletes every other namespace, so exactly one version is
//! ever served.

use super::upstream::{FetchRequest, Upstream};
use crate::storage::{CacheError, CacheStore};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

pub const NAMESPACE_PREFIX: &str = "shelf-";

/// File under the cache root naming the active namespace
const ACTIVE_MARKER: &str = "ACTIVE";

pub fn namespace_for(version: &str) -> String {
    format!("{}{}", NAMESPACE_PREFIX, version)
}

#[derive(Debug, Default)]
struct Versions {
    active: Option<String>,
    waiting: Option<String>,
}

pub struct CacheLifecycle {
    store: Arc<CacheStore>,
    versions: RwLock<Versions>,
}

impl CacheLifecycle {
    /// Restore the active namespace recorded by a previous run
    pub fn open(store: Arc<CacheStore>) -> Result<Self, CacheError> {
        let marker = marker_path(&store);
        let mut versions = Versions::default();

        if marker.exists() {
            let name = fs::read_to_string(&marker)?.trim().to_string();
            if !name.is_empty() && store.has_namespace(&name).unwrap_or(false) {
                tracing::info!("Resuming cache namespace {}", name);
                versions.active = Some(name);
            }
        }

        Ok(Self {
            store,
            versions: RwLock::new(versions),
        })
    }

    pub fn active_namespace(&self) -> Option<String> {
        self.read().active.clone()
    }

    pub fn waiting_namespace(&self) -> Option<String> {
        self.read().waiting.clone()
    }

    /// Create the namespace for `version` and precache `assets` into it.
    /// Failed assets are logged and skipped. Returns the namespace name.
    pub async fn install<U: Upstream>(
        &self,
        version: &str,
        upstream: &U,
        assets: &[String],
    ) -> Result<String, CacheError> {
        let namespace = namespace_for(version);
        self.store.open(&namespace)?;
        tracing::info!("Installing cache {}", namespace);

        let mut cached = 0;
        for asset in assets {
            match upstream.fetch(FetchRequest::get(asset.as_str())).await {
                Ok(response) if response.is_success() => {
                    let (response, body) = match response.buffered().await {
                        Ok(buffered) => buffered,
                        Err(e) => {
                            tracing::warn!("Precache {} failed: {}", asset, e);
                            continue;
                        }
                    };
                    self.store.put(&namespace, &response.to_cached(asset, &body))?;
                    cached += 1;
                }
                Ok(response) => {
                    tracing::warn!("Precache {} failed: upstream returned {}", asset, response.status);
                }
                Err(e) => tracing::warn!("Precache {} failed: {}", asset, e),
            }
        }
        tracing::info!("Precached {}/{} assets into {}", cached, assets.len(), namespace);

        let mut versions = self.write();
        if versions.active.as_deref() == Some(namespace.as_str()) {
            versions.waiting = None;
        } else {
            versions.waiting = Some(namespace.clone());
        }
        Ok(namespace)
    }

    /// Promote the waiting namespace and delete all others. Returns the
    /// namespace now active.
    pub fn activate(&self) -> Result<Option<String>, CacheError> {
        let mut versions = self.write();
        let Some(namespace) = versions.waiting.take() else {
            return Ok(versions.active.clone());
        };

        for name in self.store.namespaces()? {
            if name != namespace {
                tracing::info!("Deleting old cache {}", name);
                self.store.delete_namespace(&name)?;
            }
        }
        fs::write(marker_path(&self.store), &namespace)?;

        tracing::info!("Activated cache {}", namespace);
        versions.active = Some(namespace);
        Ok(versions.active.clone())
    }

    /// Purge every namespace. The active version keeps its name and
    /// refills as requests come in.
    pub fn clear_all(&self) -> Result<usize, CacheError> {
        let _versions = self.write();
        let mut cleared = 0;
        for name in self.store.namespaces()? {
            if self.store.delete_namespace(&name)? {
                cleared += 1;
            }
        }
        tracing::info!("Cleared {} cache namespaces", cleared);
        Ok(cleared)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Versions> {
        self.versions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Versions> {
        self.versions.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn marker_path(store: &CacheStore) -> PathBuf {
    store.base_path().join(ACTIVE_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::FakeUpstream;
    use tempfile::tempdir;

    fn assets(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_install_precaches_and_waits() {
        let temp = tempdir().unwrap();
        let store = Arc::new(CacheStore::new(temp.path()).unwrap());
        let lifecycle = CacheLifecycle::open(store.clone()).unwrap();
        let upstream = FakeUpstream::new().with("/", "<html>root</html>");

        let namespace = lifecycle
            .install("v1.0.0", &upstream, &assets(&["/", "/missing.ico"]))
            .await
            .unwrap();

        assert_eq!(namespace, "shelf-v1.0.0");
        assert_eq!(lifecycle.waiting_namespace().as_deref(), Some("shelf-v1.0.0"));
        assert_eq!(lifecycle.active_namespace(), None);
        // The missing asset is skipped, not fatal
        assert!(store.get(&namespace, "/").unwrap().is_some());
        assert!(store.get(&namespace, "/missing.ico").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_activate_deletes_other_namespaces() {
        let temp = tempdir().unwrap();
        let store = Arc::new(CacheStore::new(temp.path()).unwrap());
        store.open("shelf-v0.9.0").unwrap();
        store.open("unrelated").unwrap();

        let lifecycle = CacheLifecycle::open(store.clone()).unwrap();
        let upstream = FakeUpstream::new();
        lifecycle.install("v1.0.0", &upstream, &[]).await.unwrap();

        assert_eq!(lifecycle.activate().unwrap().as_deref(), Some("shelf-v1.0.0"));
        assert_eq!(store.namespaces().unwrap(), vec!["shelf-v1.0.0"]);
        assert_eq!(lifecycle.waiting_namespace(), None);

        // Nothing waiting: activation is a no-op
        assert_eq!(lifecycle.activate().unwrap().as_deref(), Some("shelf-v1.0.0"));
    }

    #[tokio::test]
    async fn test_active_version_survives_restart() {
        let temp = tempdir().unwrap();
        let store = Arc::new(CacheStore::new(temp.path()).unwrap());
        let upstream = FakeUpstream::new();

        let lifecycle = CacheLifecycle::open(store.clone()).unwrap();
        lifecycle.install("v1.0.0", &upstream, &[]).await.unwrap();
        lifecycle.activate().unwrap();
        drop(lifecycle);

        let reopened = CacheLifecycle::open(store.clone()).unwrap();
        assert_eq!(reopened.active_namespace().as_deref(), Some("shelf-v1.0.0"));

        // A new version waits while the old one keeps serving
        reopened.install("v2.0.0", &upstream, &[]).await.unwrap();
        assert_eq!(reopened.active_namespace().as_deref(), Some("shelf-v1.0.0"));
        assert_eq!(reopened.waiting_namespace().as_deref(), Some("shelf-v2.0.0"));

        // Reinstalling the active version does not leave it waiting
        reopened.install("v1.0.0", &upstream, &[]).await.unwrap();
        assert_eq!(reopened.waiting_namespace(), None);
    }

    #[tokio::test]
    async fn test_clear_all() {
        let temp = tempdir().unwrap();
        let store = Arc::new(CacheStore::new(temp.path()).unwrap());
        let lifecycle = CacheLifecycle::open(store.clone()).unwrap();
        let upstream = FakeUpstream::new().with("/index.html", "<html></html>");
        lifecycle
            .install("v1.0.0", &upstream, &assets(&["/index.html"]))
            .await
            .unwrap();
        lifecycle.activate().unwrap();

        assert_eq!(lifecycle.clear_all().unwrap(), 1);
        assert!(store.namespaces().unwrap().is_empty());
        assert_eq!(lifecycle.active_namespace().as_deref(), Some("shelf-v1.0.0"));
    }
}
