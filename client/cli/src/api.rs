use crate::error::{ApiError, ListingError};
use crate::listing::{
    FileDescriptor, FolderDescriptor, ListPage, ListRequest, ListingBackend, PageCursor,
};
use chrono::{DateTime, Utc};
use indicatif::ProgressBar;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio_stream::{Stream, StreamExt};

pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

// --- Envelope ---

/// Every storage API response is wrapped in this envelope
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
    #[serde(default)]
    success: bool,
}

// --- Listing types ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ListFilesRequest<'a> {
    bucket_name: &'a str,
    prefix: &'a str,
    delimiter: String,
    page_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    continuation_token: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListFilesData {
    #[serde(default)]
    folders: Vec<FolderInfo>,
    #[serde(default)]
    files: Vec<ObjectInfo>,
    pagination: Option<PaginationInfo>,
    // Older backends put pagination at the top level
    #[serde(default)]
    is_truncated: Option<bool>,
    #[serde(default)]
    next_continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FolderInfo {
    key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectInfo {
    pub key: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub last_modified: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaginationInfo {
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_continuation_token: Option<String>,
}

impl From<ObjectInfo> for FileDescriptor {
    fn from(info: ObjectInfo) -> Self {
        FileDescriptor {
            last_modified: info.last_modified.as_ref().and_then(parse_timestamp),
            size: info.size.unwrap_or(0),
            key: info.key,
        }
    }
}

impl From<ListFilesData> for ListPage {
    fn from(data: ListFilesData) -> Self {
        let (has_more, next) = match data.pagination {
            Some(p) => (p.has_more, p.next_continuation_token),
            None => (
                data.is_truncated.unwrap_or(false),
                data.next_continuation_token,
            ),
        };
        ListPage {
            folders: data
                .folders
                .into_iter()
                .map(|f| FolderDescriptor { key: f.key })
                .collect(),
            files: data.files.into_iter().map(FileDescriptor::from).collect(),
            has_more,
            next_cursor: next.filter(|t| !t.is_empty()).map(PageCursor),
        }
    }
}

/// Timestamps arrive as RFC 3339 strings or epoch milliseconds
fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        serde_json::Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}

// --- Other operations ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchDeleteRequest<'a> {
    bucket_name: &'a str,
    object_keys: &'a [String],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    #[serde(default)]
    pub files: Vec<ObjectInfo>,
    #[serde(default)]
    pub total_found: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderSize {
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub file_count: u64,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/storage{}", self.base_url, path)
    }

    /// Unwrap the response envelope; `success=false` becomes `ApiError::Api`.
    async fn read_envelope<T: DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<Option<T>, ApiError> {
        let status = resp.status();
        let body = resp.text().await?;
        let envelope: Envelope<T> = match serde_json::from_str(&body) {
            Ok(env) => env,
            Err(_) if !status.is_success() => {
                return Err(ApiError::Status {
                    status: status.as_u16(),
                    body,
                })
            }
            Err(e) => return Err(e.into()),
        };
        if envelope.success {
            Ok(envelope.data)
        } else {
            Err(ApiError::api(
                envelope
                    .message
                    .unwrap_or_else(|| format!("request failed ({})", status)),
            ))
        }
    }

    async fn require_data<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ApiError> {
        Self::read_envelope(resp)
            .await?
            .ok_or_else(|| ApiError::api("response contained no data"))
    }

    pub async fn backend_info(&self) -> Result<serde_json::Value, ApiError> {
        let resp = self.client.get(self.url("/backend")).send().await?;
        Ok(Self::read_envelope(resp).await?.unwrap_or_default())
    }

    pub async fn list_buckets(&self) -> Result<Vec<String>, ApiError> {
        let resp = self.client.get(self.url("/buckets")).send().await?;
        Ok(Self::read_envelope(resp).await?.unwrap_or_default())
    }

    pub async fn list_files(&self, request: &ListRequest) -> Result<ListPage, ApiError> {
        let body = ListFilesRequest {
            bucket_name: &request.bucket,
            prefix: &request.prefix,
            delimiter: request.delimiter.to_string(),
            page_size: request.page_size,
            continuation_token: request.cursor.as_ref().map(|c| c.0.as_str()),
        };
        let resp = self
            .client
            .post(self.url("/files/list"))
            .json(&body)
            .send()
            .await?;
        let data: ListFilesData = Self::require_data(resp).await?;
        Ok(data.into())
    }

    /// Upload a local file. Without `object_key` the backend names it after
    /// the file.
    pub async fn upload(
        &self,
        bucket: &str,
        file: &Path,
        object_key: Option<&str>,
    ) -> Result<(), ApiError> {
        let source = tokio::fs::File::open(file).await?;
        let len = source.metadata().await?.len();
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload".to_string());
        // Streamed from disk; the declared length keeps the form sized
        let part = reqwest::multipart::Part::stream_with_length(reqwest::Body::from(source), len)
            .file_name(file_name);
        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("bucketName", bucket.to_string());
        if let Some(key) = object_key {
            form = form.text("objectKey", key.to_string());
        }
        let resp = self
            .client
            .post(self.url("/upload"))
            .multipart(form)
            .send()
            .await?;
        Self::read_envelope::<serde_json::Value>(resp).await?;
        Ok(())
    }

    /// Stream an object to `dest`, returning the number of bytes written
    pub async fn download(
        &self,
        bucket: &str,
        key: &str,
        dest: &Path,
        progress: &ProgressBar,
    ) -> Result<u64, ApiError> {
        let resp = self
            .client
            .get(self.url("/download"))
            .query(&[("bucketName", bucket), ("objectKey", key)])
            .send()
            .await?;
        if !resp.status().is_success() {
            // Failures still come back as an envelope
            Self::read_envelope::<serde_json::Value>(resp).await?;
            return Err(ApiError::api("download failed"));
        }
        if let Some(len) = resp.content_length() {
            progress.set_length(len);
        }
        save_stream(dest, resp.bytes_stream(), progress).await
    }

    pub async fn delete(&self, bucket: &str, key: &str) -> Result<(), ApiError> {
        let resp = self
            .client
            .delete(self.url("/files"))
            .query(&[("bucketName", bucket), ("objectKey", key)])
            .send()
            .await?;
        Self::read_envelope::<serde_json::Value>(resp).await?;
        Ok(())
    }

    pub async fn delete_batch(&self, bucket: &str, keys: &[String]) -> Result<(), ApiError> {
        let resp = self
            .client
            .delete(self.url("/files/batch"))
            .json(&BatchDeleteRequest {
                bucket_name: bucket,
                object_keys: keys,
            })
            .send()
            .await?;
        Self::read_envelope::<serde_json::Value>(resp).await?;
        Ok(())
    }

    /// `folder_path` must end with the delimiter
    pub async fn create_folder(&self, bucket: &str, folder_path: &str) -> Result<(), ApiError> {
        let resp = self
            .client
            .post(self.url("/folder"))
            .query(&[("bucketName", bucket), ("folderPath", folder_path)])
            .send()
            .await?;
        Self::read_envelope::<serde_json::Value>(resp).await?;
        Ok(())
    }

    pub async fn search(
        &self,
        bucket: &str,
        keyword: &str,
        prefix: &str,
        max_results: u32,
    ) -> Result<SearchResult, ApiError> {
        let max = max_results.to_string();
        let resp = self
            .client
            .get(self.url("/search"))
            .query(&[
                ("bucketName", bucket),
                ("keyword", keyword),
                ("prefix", prefix),
                ("maxResults", max.as_str()),
            ])
            .send()
            .await?;
        Self::require_data(resp).await
    }

    pub async fn folder_size(&self, bucket: &str, prefix: &str) -> Result<FolderSize, ApiError> {
        let resp = self
            .client
            .get(self.url("/folder/size"))
            .query(&[("bucketName", bucket), ("prefix", prefix)])
            .send()
            .await?;
        Self::require_data(resp).await
    }
}

impl ListingBackend for ApiClient {
    fn list_page(
        &self,
        request: ListRequest,
    ) -> impl Future<Output = Result<ListPage, ListingError>> + Send {
        async move { Ok(self.list_files(&request).await?) }
    }
}

// --- Downloads ---

fn partial_path(dest: &Path) -> PathBuf {
    let mut partial = dest.as_os_str().to_owned();
    partial.push(".part");
    PathBuf::from(partial)
}

/// Write `chunks` to `dest` through a `.part` sibling. `dest` is replaced
/// only after the last chunk is on disk; on failure it is left untouched and
/// the partial file is removed.
pub async fn save_stream<S, C, E>(
    dest: &Path,
    chunks: S,
    progress: &ProgressBar,
) -> Result<u64, ApiError>
where
    S: Stream<Item = Result<C, E>>,
    C: AsRef<[u8]>,
    E: Into<ApiError>,
{
    let partial = partial_path(dest);
    let result = match write_chunks(&partial, chunks, progress).await {
        Ok(written) => tokio::fs::rename(&partial, dest)
            .await
            .map(|_| written)
            .map_err(ApiError::from),
        Err(e) => Err(e),
    };
    if result.is_err() {
        if let Err(e) = tokio::fs::remove_file(&partial).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("could not remove {}: {}", partial.display(), e);
            }
        }
    }
    result
}

async fn write_chunks<S, C, E>(
    path: &Path,
    chunks: S,
    progress: &ProgressBar,
) -> Result<u64, ApiError>
where
    S: Stream<Item = Result<C, E>>,
    C: AsRef<[u8]>,
    E: Into<ApiError>,
{
    tokio::pin!(chunks);
    let mut out = tokio::fs::File::create(path).await?;
    let mut written = 0u64;
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(Into::<ApiError>::into)?;
        let bytes = chunk.as_ref();
        out.write_all(bytes).await?;
        written += bytes.len() as u64;
        progress.set_position(written);
    }
    out.flush().await?;
    out.sync_all().await?;
    Ok(written)
}
