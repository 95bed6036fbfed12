//! In-memory S3 service for driver tests.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Method;
use tidepool_io::StorageResult;

use crate::http::{HttpRequest, HttpResponse, HttpTransport};
use crate::s3_xml::{element, elements, XmlBuilder};

const LAST_MODIFIED: &str = "Wed, 12 Oct 2009 17:50:00 GMT";
const LAST_MODIFIED_ISO: &str = "2009-10-12T17:50:00.000Z";

#[derive(Debug, Default)]
struct MockState {
    objects: BTreeMap<String, Vec<u8>>,
    uploads: HashMap<String, BTreeMap<u32, Vec<u8>>>,
    completed: HashMap<String, Vec<u32>>,
    next_upload: u64,
    requests: Vec<(Method, String, bool)>,
}

/// Bucket kept in memory, speaking just enough of the S3 REST API for the driver.
#[derive(Debug)]
pub struct MockS3 {
    state: Mutex<MockState>,
    page_size: usize,
}

impl MockS3 {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            page_size: 1000,
        }
    }

    /// Limit list pages to `page_size` entries.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().objects.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.lock().objects.keys().cloned().collect()
    }

    /// Requests seen with `method`.
    pub fn count(&self, method: &str) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|(m, _, _)| m.as_str() == method)
            .count()
    }

    /// Part numbers listed by the completion of `key`'s multipart upload.
    pub fn completed_parts(&self, key: &str) -> Vec<u32> {
        self.state
            .lock()
            .completed
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Multipart uploads started and neither completed nor aborted.
    pub fn open_uploads(&self) -> usize {
        self.state.lock().uploads.len()
    }

    /// True when every request carried a signature.
    pub fn all_signed(&self) -> bool {
        self.state.lock().requests.iter().all(|(_, _, signed)| *signed)
    }

    fn key(request: &HttpRequest) -> String {
        let path = request.path.trim_start_matches('/');
        urlencoding::decode(path)
            .map(|p| p.into_owned())
            .unwrap_or_else(|_| path.to_string())
    }

    fn list(&self, state: &MockState, request: &HttpRequest) -> HttpResponse {
        let prefix = request.query_value("prefix").unwrap_or_default();
        let delimiter = request.query_value("delimiter");
        let after = request.query_value("continuation-token");
        let max_keys = request
            .query_value("max-keys")
            .and_then(|v| v.parse().ok())
            .unwrap_or(usize::MAX)
            .min(self.page_size);

        // (sort key, is prefix)
        let mut entries: Vec<(String, bool)> = Vec::new();
        for key in state.objects.keys().filter(|k| k.starts_with(prefix)) {
            let rest = &key[prefix.len()..];
            match delimiter.and_then(|d| rest.find(d).map(|idx| (d, idx))) {
                Some((d, idx)) => {
                    let common = format!("{}{}", prefix, &rest[..idx + d.len()]);
                    if entries.last().map(|(k, _)| k) != Some(&common) {
                        entries.push((common, true));
                    }
                }
                None => entries.push((key.clone(), false)),
            }
        }
        entries.retain(|(k, _)| after.map_or(true, |a| k.as_str() > a));

        let truncated = entries.len() > max_keys;
        entries.truncate(max_keys);

        let mut xml = XmlBuilder::new();
        xml.header();
        xml.open("ListBucketResult xmlns=\"http://s3.amazonaws.com/doc/2006-03-01/\"");
        xml.elem("Prefix", prefix);
        xml.elem("IsTruncated", if truncated { "true" } else { "false" });
        for (key, is_prefix) in &entries {
            if *is_prefix {
                xml.open("CommonPrefixes").elem("Prefix", key).close("CommonPrefixes");
            } else {
                let size = state.objects.get(key).map_or(0, |v| v.len() as u64);
                xml.open("Contents")
                    .elem("Key", key)
                    .elem_u64("Size", size)
                    .elem("LastModified", LAST_MODIFIED_ISO)
                    .close("Contents");
            }
        }
        if truncated {
            if let Some((last, _)) = entries.last() {
                xml.elem("NextContinuationToken", last);
            }
        }
        xml.close("ListBucketResult");
        HttpResponse::new(200, xml.finish())
    }

    fn get(state: &MockState, key: &str, request: &HttpRequest) -> HttpResponse {
        let Some(data) = state.objects.get(key) else {
            return HttpResponse::new(404, "<Error><Code>NoSuchKey</Code></Error>");
        };
        let Some(range) = request
            .header_value("range")
            .and_then(|r| r.strip_prefix("bytes="))
        else {
            return HttpResponse::new(200, data.clone());
        };
        let (start, end) = range.split_once('-').unwrap_or((range, ""));
        let start: usize = start.parse().unwrap_or(0);
        if start >= data.len() {
            return HttpResponse::new(416, "");
        }
        let end = end
            .parse::<usize>()
            .map(|e| (e + 1).min(data.len()))
            .unwrap_or(data.len());
        HttpResponse::new(206, data[start..end].to_vec())
    }

    fn complete(state: &mut MockState, key: &str, upload_id: &str, body: &str) -> HttpResponse {
        let Some(parts) = state.uploads.remove(upload_id) else {
            return HttpResponse::new(404, "<Error><Code>NoSuchUpload</Code></Error>");
        };
        let mut content = Vec::new();
        let mut numbers = Vec::new();
        for part in elements(body, "Part") {
            let number: u32 = element(part, "PartNumber")
                .and_then(|n| n.parse().ok())
                .unwrap_or_default();
            let etag = element(part, "ETag").unwrap_or_default();
            match parts.get(&number) {
                Some(data) if etag == format!("\"etag-{}\"", number) => {
                    content.extend_from_slice(data);
                    numbers.push(number);
                }
                _ => return HttpResponse::new(200, "<Error><Code>InvalidPart</Code></Error>"),
            }
        }
        state.objects.insert(key.to_string(), content);
        state.completed.insert(key.to_string(), numbers);
        HttpResponse::new(200, "<CompleteMultipartUploadResult/>")
    }
}

#[async_trait]
impl HttpTransport for MockS3 {
    async fn send(&self, request: HttpRequest) -> StorageResult<HttpResponse> {
        let mut state = self.state.lock();
        let signed = request
            .header_value("authorization")
            .is_some_and(|a| a.starts_with("AWS4-HMAC-SHA256 "));
        state
            .requests
            .push((request.method.clone(), request.path.clone(), signed));
        if !signed {
            return Ok(HttpResponse::new(403, "<Error><Code>AccessDenied</Code></Error>"));
        }

        let key = Self::key(&request);
        let response = match request.method {
            Method::GET if request.query_value("list-type") == Some("2") => {
                self.list(&state, &request)
            }
            Method::GET => Self::get(&state, &key, &request),
            Method::HEAD => match state.objects.get(&key) {
                Some(data) => HttpResponse::new(200, "")
                    .header("content-length", data.len().to_string())
                    .header("last-modified", LAST_MODIFIED),
                None => HttpResponse::new(404, ""),
            },
            Method::PUT => match request.query_value("uploadId") {
                Some(upload_id) => {
                    let number: u32 = request
                        .query_value("partNumber")
                        .and_then(|n| n.parse().ok())
                        .unwrap_or_default();
                    match state.uploads.get_mut(upload_id) {
                        Some(parts) => {
                            parts.insert(number, request.body.to_vec());
                            HttpResponse::new(200, "").header("ETag", format!("\"etag-{}\"", number))
                        }
                        None => HttpResponse::new(404, "<Error><Code>NoSuchUpload</Code></Error>"),
                    }
                }
                None => {
                    state.objects.insert(key, request.body.to_vec());
                    HttpResponse::new(200, "")
                }
            },
            Method::POST if request.query_value("uploads").is_some() => {
                state.next_upload += 1;
                let upload_id = format!("upload-{}", state.next_upload);
                state.uploads.insert(upload_id.clone(), BTreeMap::new());
                let mut xml = XmlBuilder::new();
                xml.open("InitiateMultipartUploadResult")
                    .elem("Key", &key)
                    .elem("UploadId", &upload_id)
                    .close("InitiateMultipartUploadResult");
                HttpResponse::new(200, xml.finish())
            }
            Method::POST => match request.query_value("uploadId") {
                Some(upload_id) => {
                    let body = String::from_utf8_lossy(&request.body).into_owned();
                    Self::complete(&mut state, &key, upload_id, &body)
                }
                None => HttpResponse::new(400, ""),
            },
            Method::DELETE => match request.query_value("uploadId") {
                Some(upload_id) => match state.uploads.remove(upload_id) {
                    Some(_) => HttpResponse::new(204, ""),
                    None => HttpResponse::new(404, "<Error><Code>NoSuchUpload</Code></Error>"),
                },
                None => {
                    state.objects.remove(&key);
                    HttpResponse::new(204, "")
                }
            },
            _ => HttpResponse::new(405, ""),
        };
        Ok(response)
    }
}
