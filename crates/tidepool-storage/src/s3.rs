//! S3 object store driver.
//!
//! Keys are absolute paths without the leading slash. There are no real directories: a path
//! exists when at least one key lives under it, and creating or syncing a path does nothing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tidepool_io::{ReadSource, StorageError, StorageResult, WriteSink};
use tracing::{debug, trace, warn};

use crate::driver::{ReadLimit, ReadOptions, StorageDriver, WriteOptions};
use crate::http::{uri_encode_path, HttpBody, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
use crate::info::{Features, InfoLevel, StorageInfo, StorageType};
use crate::s3_auth::{S3Credentials, S3Signer};
use crate::s3_xml::{element, elements, required, XmlBuilder};

/// Smallest part S3 accepts for every part but the last.
pub const S3_PART_SIZE_MIN: usize = 5 * 1024 * 1024;

/// How the bucket appears in request URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum S3UriStyle {
    /// `bucket.endpoint/key`.
    #[default]
    Host,
    /// `endpoint/bucket/key`.
    Path,
}

/// S3 connection settings.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    /// Bucket name.
    pub bucket: String,
    /// Service endpoint host.
    pub endpoint: String,
    /// Port, when not the scheme default.
    pub port: Option<u16>,
    /// Region used for signing.
    pub region: String,
    /// Bucket addressing.
    pub uri_style: S3UriStyle,
    /// Use https.
    pub tls: bool,
    /// Access key id.
    pub access_key: String,
    /// Secret access key.
    pub secret_key: String,
    /// Session token for temporary credentials.
    pub security_token: Option<String>,
    /// Size of each multipart upload part; also the largest single PUT.
    pub part_size: usize,
    /// Request timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            endpoint: "s3.amazonaws.com".to_string(),
            port: None,
            region: "us-east-1".to_string(),
            uri_style: S3UriStyle::Host,
            tls: true,
            access_key: String::new(),
            secret_key: String::new(),
            security_token: None,
            part_size: S3_PART_SIZE_MIN,
            timeout_ms: 60_000,
        }
    }
}

impl std::fmt::Debug for S3Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Config")
            .field("bucket", &self.bucket)
            .field("endpoint", &self.endpoint)
            .field("port", &self.port)
            .field("region", &self.region)
            .field("uri_style", &self.uri_style)
            .field("tls", &self.tls)
            .field("access_key", &self.access_key)
            .field("part_size", &self.part_size)
            .finish()
    }
}

impl S3Config {
    fn host(&self) -> String {
        let host = match self.uri_style {
            S3UriStyle::Host => format!("{}.{}", self.bucket, self.endpoint),
            S3UriStyle::Path => self.endpoint.clone(),
        };
        match self.port {
            Some(port) => format!("{}:{}", host, port),
            None => host,
        }
    }

    fn validate(&self) -> StorageResult<()> {
        if self.bucket.is_empty() {
            return Err(StorageError::Config("s3 bucket is not set".to_string()));
        }
        if self.part_size == 0 {
            return Err(StorageError::Config("s3 part size must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct S3Inner {
    transport: Arc<dyn HttpTransport>,
    signer: S3Signer,
    host: String,
    bucket_path: String,
    part_size: usize,
}

/// One entry of a bucket listing.
#[derive(Debug, Clone, PartialEq, Eq)]
enum S3Entry {
    Object { key: String, size: u64, modified: i64 },
    Prefix(String),
}

/// Driver for an S3 bucket.
#[derive(Debug, Clone)]
pub struct S3Storage {
    inner: Arc<S3Inner>,
}

fn key_of(path: &str) -> &str {
    path.trim_start_matches('/')
}

fn parse_http_date(value: &str) -> i64 {
    DateTime::parse_from_rfc2822(value)
        .map(|t| t.timestamp())
        .unwrap_or_default()
}

fn parse_iso_date(value: &str) -> i64 {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.timestamp())
        .unwrap_or_default()
}

impl S3Storage {
    /// Driver talking to the configured endpoint over https/http.
    pub fn new(config: &S3Config) -> StorageResult<Self> {
        config.validate()?;
        let scheme = if config.tls { "https" } else { "http" };
        let transport = ReqwestTransport::new(
            format!("{}://{}", scheme, config.host()),
            Duration::from_millis(config.timeout_ms),
        )?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Driver over any transport.
    pub fn with_transport(config: &S3Config, transport: Arc<dyn HttpTransport>) -> StorageResult<Self> {
        config.validate()?;
        let signer = S3Signer::new(
            S3Credentials {
                access_key: config.access_key.clone(),
                secret_key: config.secret_key.clone(),
                security_token: config.security_token.clone(),
            },
            config.region.clone(),
        );
        let bucket_path = match config.uri_style {
            S3UriStyle::Host => String::new(),
            S3UriStyle::Path => format!("/{}", config.bucket),
        };
        Ok(Self {
            inner: Arc::new(S3Inner {
                transport,
                signer,
                host: config.host(),
                bucket_path,
                part_size: config.part_size,
            }),
        })
    }

    fn object_path(&self, key: &str) -> String {
        format!("{}/{}", self.inner.bucket_path, uri_encode_path(key))
    }

    fn bucket_root(&self) -> String {
        format!("{}/", self.inner.bucket_path)
    }

    async fn send(&self, mut request: HttpRequest) -> StorageResult<HttpResponse> {
        self.inner.signer.sign(&mut request, &self.inner.host, Utc::now());
        let method = request.method.clone();
        let path = request.path.clone();
        let response = self.inner.transport.send(request).await?;
        debug!(method = %method, path = %path, status = response.status, "s3 request");
        Ok(response)
    }

    async fn expect_success(
        &self,
        request: HttpRequest,
        context: impl FnOnce() -> String,
    ) -> StorageResult<HttpResponse> {
        let response = self.send(request).await?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(response.into_error(&context()).await)
        }
    }

    async fn list_all(&self, prefix: &str, delimiter: bool) -> StorageResult<Vec<S3Entry>> {
        let mut entries = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut request = HttpRequest::new(Method::GET, self.bucket_root()).query("list-type", "2");
            if !prefix.is_empty() {
                request = request.query("prefix", prefix);
            }
            if delimiter {
                request = request.query("delimiter", "/");
            }
            if let Some(token) = token.as_deref() {
                request = request.query("continuation-token", token);
            }
            let response = self
                .expect_success(request, || format!("unable to list prefix '{}'", prefix))
                .await?;
            let body = response.body.bytes().await?;
            let xml = String::from_utf8_lossy(&body);

            for contents in elements(&xml, "Contents") {
                let key = required(contents, "Key", "list")?;
                let size = element(contents, "Size")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_default();
                let modified = element(contents, "LastModified")
                    .map(|s| parse_iso_date(&s))
                    .unwrap_or_default();
                entries.push(S3Entry::Object { key, size, modified });
            }
            for common in elements(&xml, "CommonPrefixes") {
                entries.push(S3Entry::Prefix(required(common, "Prefix", "list")?));
            }

            let truncated = element(&xml, "IsTruncated").as_deref() == Some("true");
            token = element(&xml, "NextContinuationToken");
            trace!(prefix, entries = entries.len(), truncated, "s3 list page");
            if !truncated || token.is_none() {
                break;
            }
        }
        Ok(entries)
    }

    fn prefix_of(path: &str) -> String {
        let key = key_of(path);
        if key.is_empty() {
            String::new()
        } else {
            format!("{}/", key)
        }
    }
}

#[async_trait]
impl StorageDriver for S3Storage {
    fn kind(&self) -> &'static str {
        "s3"
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
        let request = HttpRequest::new(Method::GET, self.bucket_root())
            .query("list-type", "2")
            .query("prefix", prefix.as_str())
            .query("max-keys", "1");
        let response = self
            .expect_success(request, || format!("unable to list prefix '{}'", prefix))
            .await?;
        let body = response.body.bytes().await?;
        Ok(!elements(&String::from_utf8_lossy(&body), "Key").is_empty())
    }

    async fn info(&self, path: &str, level: InfoLevel, _follow_link: bool) -> StorageResult<StorageInfo> {
        let request = HttpRequest::new(Method::HEAD, self.object_path(key_of(path)));
        let response = self.send(request).await?;
        if response.status == 404 {
            return Ok(StorageInfo::missing(path));
        }
        if !response.is_success() {
            return Err(response
                .into_error(&format!("unable to get info for path/file '{}'", path))
                .await);
        }
        let info = StorageInfo {
            name: path.to_string(),
            exists: true,
            kind: StorageType::File,
            size: response
                .header_value("content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            time_modified: response
                .header_value("last-modified")
                .map(parse_http_date)
                .unwrap_or_default(),
            ..StorageInfo::default()
        };
        Ok(info.truncate(level))
    }

    async fn list(&self, path: &str, level: InfoLevel) -> StorageResult<Option<Vec<StorageInfo>>> {
        let prefix = Self::prefix_of(path);
        let mut result = Vec::new();
        for entry in self.list_all(&prefix, true).await? {
            let info = match entry {
                S3Entry::Object { key, size, modified } => StorageInfo {
                    name: key[prefix.len().min(key.len())..].to_string(),
                    exists: true,
                    kind: StorageType::File,
                    size,
                    time_modified: modified,
                    ..StorageInfo::default()
                },
                S3Entry::Prefix(key) => StorageInfo {
                    name: key[prefix.len().min(key.len())..]
                        .trim_end_matches('/')
                        .to_string(),
                    exists: true,
                    kind: StorageType::Path,
                    ..StorageInfo::default()
                },
            };
            // a zero-length marker object named like the prefix itself
            if info.name.is_empty() {
                continue;
            }
            result.push(info.truncate(level));
        }
        Ok(Some(result))
    }

    fn new_read(&self, path: &str, options: &ReadOptions) -> StorageResult<Box<dyn ReadSource>> {
        Ok(Box::new(S3Read {
            storage: self.clone(),
            path: path.to_string(),
            options: options.clone(),
            body: None,
            pending: Bytes::new(),
            limit: ReadLimit::new(options.limit),
        }))
    }

    fn new_write(&self, path: &str, _options: &WriteOptions) -> StorageResult<Box<dyn WriteSink>> {
        Ok(Box::new(S3Write {
            storage: self.clone(),
            path: path.to_string(),
            buffer: Vec::with_capacity(self.inner.part_size),
            upload_id: None,
            etags: Vec::new(),
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
        let prefix = Self::prefix_of(path);
        for entry in self.list_all(&prefix, false).await? {
            if let S3Entry::Object { key, .. } = entry {
                let request = HttpRequest::new(Method::DELETE, self.object_path(&key));
                self.expect_success(request, || format!("unable to remove '/{}'", key))
                    .await?;
            }
        }
        Ok(true)
    }

    async fn path_sync(&self, _path: &str) -> StorageResult<()> {
        Ok(())
    }

    async fn remove(&self, path: &str, error_on_missing: bool) -> StorageResult<()> {
        if error_on_missing && !self.exists(path).await? {
            return Err(StorageError::MissingTarget(format!(
                "unable to remove missing file '{}'",
                path
            )));
        }
        let request = HttpRequest::new(Method::DELETE, self.object_path(key_of(path)));
        self.expect_success(request, || format!("unable to remove '{}'", path))
            .await?;
        Ok(())
    }
}

/// Ranged GET of one object.
#[derive(Debug)]
struct S3Read {
    storage: S3Storage,
    path: String,
    options: ReadOptions,
    body: Option<HttpBody>,
    pending: Bytes,
    limit: ReadLimit,
}

impl S3Read {
    fn missing(&self) -> StorageResult<bool> {
        if self.options.ignore_missing {
            Ok(false)
        } else {
            Err(StorageError::MissingTarget(format!(
                "unable to open missing file '{}' for read",
                self.path
            )))
        }
    }
}

#[async_trait]
impl ReadSource for S3Read {
    async fn open(&mut self) -> StorageResult<bool> {
        let object = self.storage.object_path(key_of(&self.path));
        if self.limit.exhausted() {
            let response = self.storage.send(HttpRequest::new(Method::HEAD, object)).await?;
            if response.status == 404 {
                return self.missing();
            }
            if !response.is_success() {
                return Err(response
                    .into_error(&format!("unable to open file '{}' for read", self.path))
                    .await);
            }
            self.body = Some(HttpBody::Full(None));
            return Ok(true);
        }

        let mut request = HttpRequest::new(Method::GET, object);
        if self.options.offset > 0 || self.options.limit.is_some() {
            let end = self
                .options
                .limit
                .map(|limit| (self.options.offset + limit - 1).to_string())
                .unwrap_or_default();
            request = request.header("range", format!("bytes={}-{}", self.options.offset, end));
        }
        let response = self.storage.send(request).await?;
        match response.status {
            404 => return self.missing(),
            // offset at or past the end of the object
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
            if !self.pending.is_empty() {
                let n = self.limit.allow(buf.len().min(self.pending.len()));
                let chunk = self.pending.split_to(n);
                buf[..n].copy_from_slice(&chunk);
                self.limit.consume(n);
                return Ok(n);
            }
            if self.limit.exhausted() {
                return Ok(0);
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

/// Buffered upload: a single PUT when everything fits in one part, otherwise a multipart upload
/// started lazily when a full part has to make room for more data. A multipart upload that is not
/// completed is aborted when the writer is dropped.
#[derive(Debug)]
struct S3Write {
    storage: S3Storage,
    path: String,
    buffer: Vec<u8>,
    upload_id: Option<String>,
    etags: Vec<String>,
}

impl S3Write {
    async fn upload_part(&mut self) -> StorageResult<()> {
        let object = self.storage.object_path(key_of(&self.path));
        let upload_id = match self.upload_id.clone() {
            Some(id) => id,
            None => {
                let request = HttpRequest::new(Method::POST, object.clone()).query("uploads", "");
                let response = self
                    .storage
                    .expect_success(request, || {
                        format!("unable to initiate multipart upload for '{}'", self.path)
                    })
                    .await?;
                let body = response.body.bytes().await?;
                let id = required(&String::from_utf8_lossy(&body), "UploadId", "initiate multipart upload")?;
                debug!(path = %self.path, upload_id = %id, "multipart upload started");
                self.upload_id = Some(id.clone());
                id
            }
        };

        let part_number = self.etags.len() + 1;
        let body = Bytes::from(std::mem::take(&mut self.buffer));
        let request = HttpRequest::new(Method::PUT, object)
            .query("partNumber", part_number.to_string())
            .query("uploadId", upload_id.as_str())
            .body(body);
        let response = self
            .storage
            .expect_success(request, || {
                format!("unable to upload part {} of '{}'", part_number, self.path)
            })
            .await?;
        let etag = response
            .header_value("etag")
            .ok_or_else(|| {
                StorageError::Format(format!(
                    "no etag returned for part {} of '{}'",
                    part_number, self.path
                ))
            })?
            .to_string();
        self.etags.push(etag);
        self.buffer.reserve(self.storage.inner.part_size);
        Ok(())
    }
}

#[async_trait]
impl WriteSink for S3Write {
    async fn open(&mut self) -> StorageResult<()> {
        self.buffer.clear();
        self.upload_id = None;
        self.etags.clear();
        Ok(())
    }

    async fn write(&mut self, mut data: &[u8]) -> StorageResult<()> {
        let part_size = self.storage.inner.part_size;
        while !data.is_empty() {
            if self.buffer.len() == part_size {
                self.upload_part().await?;
            }
            let take = (part_size - self.buffer.len()).min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            data = &data[take..];
        }
        Ok(())
    }

    async fn close(&mut self) -> StorageResult<()> {
        let object = self.storage.object_path(key_of(&self.path));
        let Some(upload_id) = self.upload_id.clone() else {
            let request = HttpRequest::new(Method::PUT, object).body(std::mem::take(&mut self.buffer));
            self.storage
                .expect_success(request, || format!("unable to write '{}'", self.path))
                .await?;
            return Ok(());
        };

        if !self.buffer.is_empty() {
            self.upload_part().await?;
        }
        let mut xml = XmlBuilder::new();
        xml.open("CompleteMultipartUpload");
        for (idx, etag) in self.etags.iter().enumerate() {
            xml.open("Part")
                .elem_u64("PartNumber", idx as u64 + 1)
                .elem("ETag", etag)
                .close("Part");
        }
        xml.close("CompleteMultipartUpload");

        let request = HttpRequest::new(Method::POST, object)
            .query("uploadId", upload_id.as_str())
            .body(xml.finish());
        let response = self
            .storage
            .expect_success(request, || {
                format!("unable to complete multipart upload for '{}'", self.path)
            })
            .await?;
        // S3 can report a failed completion inside a 200 response
        let body = response.body.bytes().await?;
        let body = String::from_utf8_lossy(&body);
        if !elements(&body, "Error").is_empty() {
            return Err(StorageError::Service(format!(
                "unable to complete multipart upload for '{}': {}",
                self.path,
                body.trim()
            )));
        }
        debug!(path = %self.path, parts = self.etags.len(), "multipart upload complete");
        self.upload_id = None;
        Ok(())
    }
}

impl S3Storage {
    async fn abort_upload(&self, path: &str, upload_id: &str) -> StorageResult<()> {
        let request = HttpRequest::new(Method::DELETE, self.object_path(key_of(path)))
            .query("uploadId", upload_id);
        self.expect_success(request, || {
            format!("unable to abort multipart upload for '{}'", path)
        })
        .await?;
        debug!(path, upload_id, "multipart upload aborted");
        Ok(())
    }
}

impl Drop for S3Write {
    fn drop(&mut self) {
        let Some(upload_id) = self.upload_id.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(path = %self.path, upload_id = %upload_id, "no runtime to abort multipart upload");
            return;
        };
        let storage = self.storage.clone();
        let path = std::mem::take(&mut self.path);
        runtime.spawn(async move {
            if let Err(e) = storage.abort_upload(&path, &upload_id).await {
                warn!(path = %path, upload_id = %upload_id, error = %e, "multipart upload left open");
            }
        });
    }
}
