//! Google Cloud Storage driver over the JSON API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::DateTime;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tidepool_io::{ReadSource, StorageError, StorageResult, WriteSink};
use tracing::debug;

use crate::driver::{ReadLimit, ReadOptions, StorageDriver, WriteOptions};
use crate::http::{uri_encode, HttpBody, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
use crate::info::{Features, InfoLevel, StorageInfo, StorageType};

/// Resumable upload chunks must be a multiple of this size.
pub const GCS_CHUNK_GRANULE: usize = 256 * 1024;

const UPLOAD_ID_HEADER: &str = "x-guploader-uploadid";

/// GCS connection settings.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcsConfig {
    /// Bucket name.
    pub bucket: String,
    /// API endpoint (scheme and host).
    pub endpoint: String,
    /// OAuth bearer token.
    pub token: String,
    /// Upload chunk size; content that fits in one chunk is sent as a single media upload.
    pub chunk_size: usize,
    /// Request timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for GcsConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            endpoint: "https://storage.googleapis.com".to_string(),
            token: String::new(),
            chunk_size: 16 * GCS_CHUNK_GRANULE,
            timeout_ms: 60_000,
        }
    }
}

impl std::fmt::Debug for GcsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcsConfig")
            .field("bucket", &self.bucket)
            .field("endpoint", &self.endpoint)
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct GcsObject {
    name: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    updated: Option<String>,
}

impl GcsObject {
    fn size(&self) -> u64 {
        self.size.as_deref().and_then(|s| s.parse().ok()).unwrap_or_default()
    }

    fn time_modified(&self) -> i64 {
        self.updated
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.timestamp())
            .unwrap_or_default()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GcsList {
    #[serde(default)]
    items: Vec<GcsObject>,
    #[serde(default)]
    prefixes: Vec<String>,
    next_page_token: Option<String>,
}

#[derive(Debug)]
struct GcsInner {
    transport: Arc<dyn HttpTransport>,
    bucket: String,
    token: String,
    chunk_size: usize,
}

/// Driver for a GCS bucket.
#[derive(Debug, Clone)]
pub struct GcsStorage {
    inner: Arc<GcsInner>,
}

fn name_of(path: &str) -> &str {
    path.trim_start_matches('/')
}

fn parse_json<T: for<'de> Deserialize<'de>>(body: &[u8], context: &str) -> StorageResult<T> {
    serde_json::from_slice(body)
        .map_err(|e| StorageError::Format(format!("{}: invalid json response: {}", context, e)))
}

impl GcsStorage {
    /// Driver talking to the configured endpoint.
    pub fn new(config: &GcsConfig) -> StorageResult<Self> {
        if config.chunk_size % GCS_CHUNK_GRANULE != 0 {
            return Err(StorageError::Config(format!(
                "gcs chunk size {} is not a multiple of {}",
                config.chunk_size, GCS_CHUNK_GRANULE
            )));
        }
        let transport =
            ReqwestTransport::new(config.endpoint.clone(), Duration::from_millis(config.timeout_ms))?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Driver over any transport.
    pub fn with_transport(config: &GcsConfig, transport: Arc<dyn HttpTransport>) -> StorageResult<Self> {
        if config.bucket.is_empty() {
            return Err(StorageError::Config("gcs bucket is not set".to_string()));
        }
        if config.chunk_size == 0 {
            return Err(StorageError::Config("gcs chunk size must be positive".to_string()));
        }
        Ok(Self {
            inner: Arc::new(GcsInner {
                transport,
                bucket: config.bucket.clone(),
                token: config.token.clone(),
                chunk_size: config.chunk_size,
            }),
        })
    }

    fn object_path(&self, name: &str) -> String {
        format!("/storage/v1/b/{}/o/{}", self.inner.bucket, uri_encode(name))
    }

    fn list_path(&self) -> String {
        format!("/storage/v1/b/{}/o", self.inner.bucket)
    }

    fn upload_path(&self) -> String {
        format!("/upload/storage/v1/b/{}/o", self.inner.bucket)
    }

    async fn send(&self, request: HttpRequest) -> StorageResult<HttpResponse> {
        let request = request.header("authorization", format!("Bearer {}", self.inner.token));
        let method = request.method.clone();
        let path = request.path.clone();
        let response = self.inner.transport.send(request).await?;
        debug!(method = %method, path = %path, status = response.status, "gcs request");
        Ok(response)
    }

    async fn expect_success(&self, request: HttpRequest, context: &str) -> StorageResult<HttpResponse> {
        let response = self.send(request).await?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(response.into_error(context).await)
        }
    }

    async fn list_all(&self, prefix: &str, delimiter: bool) -> StorageResult<GcsList> {
        let mut result = GcsList::default();
        let mut token: Option<String> = None;
        loop {
            let mut request = HttpRequest::new(Method::GET, self.list_path());
            if !prefix.is_empty() {
                request = request.query("prefix", prefix);
            }
            if delimiter {
                request = request.query("delimiter", "/");
            }
            if let Some(token) = token.as_deref() {
                request = request.query("pageToken", token);
            }
            let context = format!("unable to list prefix '{}'", prefix);
            let response = self.expect_success(request, &context).await?;
            let page: GcsList = parse_json(&response.body.bytes().await?, &context)?;
            result.items.extend(page.items);
            result.prefixes.extend(page.prefixes);
            token = page.next_page_token;
            if token.is_none() {
                break;
            }
        }
        Ok(result)
    }

    fn prefix_of(path: &str) -> String {
        let name = name_of(path);
        if name.is_empty() {
            String::new()
        } else {
            format!("{}/", name)
        }
    }
}

#[async_trait]
impl StorageDriver for GcsStorage {
    fn kind(&self) -> &'static str {
        "gcs"
    }

    fn features(&self) -> Features {
        Features::empty()
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        Ok(self.info(path, InfoLevel::Exists, false).await?.exists)
    }

    async fn path_exists(&self, path: &str) -> StorageResult<bool> {
        let prefix = Self::prefix_of(path);
        if prefix.is_empty() {
            return Ok(true);
        }
        let request = HttpRequest::new(Method::GET, self.list_path())
            .query("prefix", prefix.as_str())
            .query("maxResults", "1");
        let context = format!("unable to list prefix '{}'", prefix);
        let response = self.expect_success(request, &context).await?;
        let page: GcsList = parse_json(&response.body.bytes().await?, &context)?;
        Ok(!page.items.is_empty())
    }

    async fn info(&self, path: &str, level: InfoLevel, _follow_link: bool) -> StorageResult<StorageInfo> {
        let request = HttpRequest::new(Method::GET, self.object_path(name_of(path)))
            .query("fields", "name,size,updated");
        let response = self.send(request).await?;
        if response.status == 404 {
            return Ok(StorageInfo::missing(path));
        }
        let context = format!("unable to get info for path/file '{}'", path);
        if !response.is_success() {
            return Err(response.into_error(&context).await);
        }
        let object: GcsObject = parse_json(&response.body.bytes().await?, &context)?;
        Ok(StorageInfo {
            name: path.to_string(),
            exists: true,
            kind: StorageType::File,
            size: object.size(),
            time_modified: object.time_modified(),
            ..StorageInfo::default()
        }
        .truncate(level))
    }

    async fn list(&self, path: &str, level: InfoLevel) -> StorageResult<Option<Vec<StorageInfo>>> {
        let prefix = Self::prefix_of(path);
        let list = self.list_all(&prefix, true).await?;
        let strip = |name: &str| name.get(prefix.len()..).unwrap_or_default().to_string();

        let mut result = Vec::new();
        for object in &list.items {
            let name = strip(&object.name);
            if name.is_empty() {
                continue;
            }
            result.push(
                StorageInfo {
                    name,
                    exists: true,
                    kind: StorageType::File,
                    size: object.size(),
                    time_modified: object.time_modified(),
                    ..StorageInfo::default()
                }
                .truncate(level),
            );
        }
        for common in &list.prefixes {
            result.push(
                StorageInfo {
                    name: strip(common).trim_end_matches('/').to_string(),
                    exists: true,
                    kind: StorageType::Path,
                    ..StorageInfo::default()
                }
                .truncate(level),
            );
        }
        Ok(Some(result))
    }

    fn new_read(&self, path: &str, options: &ReadOptions) -> StorageResult<Box<dyn ReadSource>> {
        Ok(Box::new(GcsRead {
            storage: self.clone(),
            path: path.to_string(),
            options: options.clone(),
            body: None,
            pending: Bytes::new(),
            limit: ReadLimit::new(options.limit),
        }))
    }

    fn new_write(&self, path: &str, _options: &WriteOptions) -> StorageResult<Box<dyn WriteSink>> {
        Ok(Box::new(GcsWrite {
            storage: self.clone(),
            path: path.to_string(),
            buffer: Vec::new(),
            upload_id: None,
            uploaded: 0,
        }))
    }

    fn write_options(&self, mut options: WriteOptions) -> WriteOptions {
        options.atomic = true;
        options.create_path = true;
        options.sync_file = true;
        options.sync_path = true;
        options.mode_file = Some(0);
        options.mode_path = Some(0);
        options
    }

    async fn move_file(&self, _source: &str, _destination: &str, _options: &WriteOptions) -> StorageResult<bool> {
        Ok(false)
    }

    async fn path_create(&self, _path: &str, _error_on_exists: bool, _no_parent_create: bool, _mode: u32) -> StorageResult<()> {
        Ok(())
    }

    async fn path_remove(&self, path: &str, _recurse: bool) -> StorageResult<bool> {
        let list = self.list_all(&Self::prefix_of(path), false).await?;
        for object in list.items {
            let request = HttpRequest::new(Method::DELETE, self.object_path(&object.name));
            self.expect_success(request, &format!("unable to remove '/{}'", object.name))
                .await?;
        }
        Ok(true)
    }

    async fn path_sync(&self, _path: &str) -> StorageResult<()> {
        Ok(())
    }

    async fn remove(&self, path: &str, error_on_missing: bool) -> StorageResult<()> {
        let request = HttpRequest::new(Method::DELETE, self.object_path(name_of(path)));
        let response = self.send(request).await?;
        if response.status == 404 && !error_on_missing {
            return Ok(());
        }
        if !response.is_success() {
            return Err(response.into_error(&format!("unable to remove '{}'", path)).await);
        }
        Ok(())
    }
}

/// `alt=media` download of one object.
#[derive(Debug)]
struct GcsRead {
    storage: GcsStorage,
    path: String,
    options: ReadOptions,
    body: Option<HttpBody>,
    pending: Bytes,
    limit: ReadLimit,
}

#[async_trait]
impl ReadSource for GcsRead {
    async fn open(&mut self) -> StorageResult<bool> {
        let mut request =
            HttpRequest::new(Method::GET, self.storage.object_path(name_of(&self.path)))
                .query("alt", "media");
        if self.options.offset > 0 {
            request = request.header("range", format!("bytes={}-", self.options.offset));
        }
        let response = self.storage.send(request).await?;
        match response.status {
            404 if self.options.ignore_missing => return Ok(false),
            404 => {
                return Err(StorageError::MissingTarget(format!(
                    "unable to open missing file '{}' for read",
                    self.path
                )));
            }
            416 => self.body = Some(HttpBody::Full(None)),
            _ if response.is_success() => self.body = Some(response.body),
            _ => {
                return Err(response
                    .into_error(&format!("unable to open file '{}' for read", self.path))
                    .await);
            }
        }
        Ok(true)
    }

    async fn read(&mut self, buf: &mut [u8]) -> StorageResult<usize> {
        loop {
            if self.limit.exhausted() {
                return Ok(0);
            }
            if !self.pending.is_empty() {
                let n = self.limit.allow(buf.len().min(self.pending.len()));
                buf[..n].copy_from_slice(&self.pending.split_to(n));
                self.limit.consume(n);
                return Ok(n);
            }
            let Some(body) = self.body.as_mut() else {
                return Ok(0);
            };
            match body.chunk().await? {
                Some(chunk) => self.pending = chunk,
                None => return Ok(0),
            }
        }
    }

    async fn close(&mut self) -> StorageResult<()> {
        self.body = None;
        self.pending = Bytes::new();
        Ok(())
    }
}

/// Media upload when the content fits in one chunk, resumable upload otherwise.
#[derive(Debug)]
struct GcsWrite {
    storage: GcsStorage,
    path: String,
    buffer: Vec<u8>,
    upload_id: Option<String>,
    uploaded: u64,
}

impl GcsWrite {
    async fn upload_chunk(&mut self, last: bool) -> StorageResult<()> {
        let name = name_of(&self.path).to_string();
        let upload_id = match self.upload_id.clone() {
            Some(id) => id,
            None => {
                let request = HttpRequest::new(Method::POST, self.storage.upload_path())
                    .query("uploadType", "resumable")
                    .query("name", name.as_str());
                let context = format!("unable to start resumable upload for '{}'", self.path);
                let response = self.storage.expect_success(request, &context).await?;
                let id = response
                    .header_value(UPLOAD_ID_HEADER)
                    .ok_or_else(|| StorageError::Format(format!("{}: no upload id returned", context)))?
                    .to_string();
                debug!(path = %self.path, upload_id = %id, "resumable upload started");
                self.upload_id = Some(id.clone());
                id
            }
        };

        let chunk = std::mem::take(&mut self.buffer);
        let start = self.uploaded;
        let end = start + chunk.len() as u64;
        let total = if last { end.to_string() } else { "*".to_string() };
        let range = if chunk.is_empty() {
            format!("bytes */{}", total)
        } else {
            format!("bytes {}-{}/{}", start, end - 1, total)
        };
        let request = HttpRequest::new(Method::PUT, self.storage.upload_path())
            .query("uploadType", "resumable")
            .query("upload_id", upload_id.as_str())
            .header("content-range", range)
            .body(chunk);
        let response = self.storage.send(request).await?;
        // 308 acknowledges an intermediate chunk
        let accepted = if last { response.is_success() } else { response.status == 308 };
        if !accepted {
            return Err(response
                .into_error(&format!("unable to upload chunk at {} of '{}'", start, self.path))
                .await);
        }
        self.uploaded = end;
        Ok(())
    }
}

#[async_trait]
impl WriteSink for GcsWrite {
    async fn open(&mut self) -> StorageResult<()> {
        self.buffer.clear();
        self.upload_id = None;
        self.uploaded = 0;
        Ok(())
    }

    async fn write(&mut self, mut data: &[u8]) -> StorageResult<()> {
        let chunk_size = self.storage.inner.chunk_size;
        while !data.is_empty() {
            if self.buffer.len() == chunk_size {
                self.upload_chunk(false).await?;
            }
            let take = (chunk_size - self.buffer.len()).min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            data = &data[take..];
        }
        Ok(())
    }

    async fn close(&mut self) -> StorageResult<()> {
        if self.upload_id.is_some() {
            self.upload_chunk(true).await?;
            debug!(path = %self.path, bytes = self.uploaded, "resumable upload complete");
            return Ok(());
        }
        let request = HttpRequest::new(Method::POST, self.storage.upload_path())
            .query("uploadType", "media")
            .query("name", name_of(&self.path))
            .body(std::mem::take(&mut self.buffer));
        self.storage
            .expect_success(request, &format!("unable to write '{}'", self.path))
            .await?;
        Ok(())
    }
}
