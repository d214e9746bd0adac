use super::keys::{is_valid_namespace, key_hash};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Corrupt cache entry: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("Invalid namespace name: {0}")]
    InvalidNamespace(String),
}

/// A stored upstream response
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub key: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub stored_at: DateTime<Utc>,
}

/// On-disk sidecar describing a cached body
#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    key: String,
    status: u16,
    headers: Vec<(String, String)>,
    stored_at: DateTime<Utc>,
}

/// Entry count and byte total of one namespace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NamespaceUsage {
    pub entries: u64,
    pub bytes: u64,
}

/// Versioned response cache on disk.
///
/// Layout: `<base>/<namespace>/<hash[..2]>/<hash>.{json,body}`. Every
/// namespace is an independent directory, so dropping one is a single
/// recursive delete.
pub struct CacheStore {
    base_path: PathBuf,
}

impl CacheStore {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, CacheError> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn namespace_path(&self, namespace: &str) -> Result<PathBuf, CacheError> {
        if !is_valid_namespace(namespace) {
            return Err(CacheError::InvalidNamespace(namespace.to_string()));
        }
        Ok(self.base_path.join(namespace))
    }

    /// Storage path for a key, without extension (sharded by first 2 chars)
    fn entry_path(&self, namespace: &str, key: &str) -> Result<PathBuf, CacheError> {
        let hash = key_hash(key);
        Ok(self.namespace_path(namespace)?.join(&hash[..2]).join(hash))
    }

    /// Create a namespace if it does not exist yet
    pub fn open(&self, namespace: &str) -> Result<(), CacheError> {
        fs::create_dir_all(self.namespace_path(namespace)?)?;
        Ok(())
    }

    /// All namespaces currently on disk, sorted by name
    pub fn namespaces(&self) -> Result<Vec<String>, CacheError> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.base_path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if is_valid_namespace(name) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn has_namespace(&self, namespace: &str) -> Result<bool, CacheError> {
        Ok(self.namespace_path(namespace)?.is_dir())
    }

    /// Delete a namespace and every entry in it. Returns false if it did not
    /// exist.
    pub fn delete_namespace(&self, namespace: &str) -> Result<bool, CacheError> {
        let path = self.namespace_path(namespace)?;
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&path)?;
        tracing::debug!("Deleted cache namespace {}", namespace);
        Ok(true)
    }

    /// Store a response, replacing any previous entry for the same key
    pub fn put(&self, namespace: &str, response: &CachedResponse) -> Result<(), CacheError> {
        let path = self.entry_path(namespace, &response.key)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let meta = EntryMeta {
            key: response.key.clone(),
            status: response.status,
            headers: response.headers.clone(),
            stored_at: response.stored_at,
        };

        // Body first, then the sidecar; an entry only counts once its
        // sidecar exists
        write_atomic(&path.with_extension("body"), &response.body)?;
        write_atomic(&path.with_extension("json"), &serde_json::to_vec(&meta)?)?;

        tracing::debug!(
            "Cached {} in {} ({} bytes)",
            response.key,
            namespace,
            response.body.len()
        );
        Ok(())
    }

    /// Look up a key; `None` when the namespace or entry is missing
    pub fn get(&self, namespace: &str, key: &str) -> Result<Option<CachedResponse>, CacheError> {
        let path = self.entry_path(namespace, key)?;
        let meta_path = path.with_extension("json");
        let body_path = path.with_extension("body");

        if !meta_path.exists() || !body_path.exists() {
            return Ok(None);
        }

        let meta: EntryMeta = serde_json::from_slice(&fs::read(&meta_path)?)?;
        if meta.key != key {
            // Hash collision, treat as a miss
            return Ok(None);
        }

        let mut body = Vec::new();
        File::open(&body_path)?.read_to_end(&mut body)?;

        Ok(Some(CachedResponse {
            key: meta.key,
            status: meta.status,
            headers: meta.headers,
            body,
            stored_at: meta.stored_at,
        }))
    }

    pub fn usage(&self, namespace: &str) -> Result<NamespaceUsage, CacheError> {
        let path = self.namespace_path(namespace)?;
        let mut usage = NamespaceUsage::default();
        if !path.exists() {
            return Ok(usage);
        }

        for entry in walkdir::WalkDir::new(&path).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            match entry.path().extension().and_then(|e| e.to_str()) {
                Some("json") => usage.entries += 1,
                Some("body") => usage.bytes += entry.metadata().map(|m| m.len()).unwrap_or(0),
                _ => {}
            }
        }

        Ok(usage)
    }
}

fn write_atomic(path: &Path, content: &[u8]) -> Result<(), CacheError> {
    let mut temp_path = path.as_os_str().to_owned();
    temp_path.push(".tmp");
    let temp_path = PathBuf::from(temp_path);
    {
        let mut file = File::create(&temp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
    }
    fs::rename(&temp_path, path)?;
    Ok(())
}
