//! AWS Signature Version 4 request signing.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::http::HttpRequest;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const SERVICE: &str = "s3";

/// Access credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct S3Credentials {
    /// Access key id.
    pub access_key: String,
    /// Secret access key.
    pub secret_key: String,
    /// Session token for temporary credentials.
    pub security_token: Option<String>,
}

impl std::fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

fn hmac(key: &[u8], data: &str) -> Vec<u8> {
    // any key length is valid for HMAC
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac accepts keys of any length"),
    };
    mac.update(data.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// Hex sha256 of a payload.
pub fn payload_hash(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Signs requests for one region.
#[derive(Debug, Clone)]
pub struct S3Signer {
    credentials: S3Credentials,
    region: String,
}

impl S3Signer {
    /// Create a signer.
    pub fn new(credentials: S3Credentials, region: impl Into<String>) -> Self {
        Self {
            credentials,
            region: region.into(),
        }
    }

    fn signing_key(&self, date: &str) -> Vec<u8> {
        let key = hmac(
            format!("AWS4{}", self.credentials.secret_key).as_bytes(),
            date,
        );
        let key = hmac(&key, &self.region);
        let key = hmac(&key, SERVICE);
        hmac(&key, "aws4_request")
    }

    /// Add `host`, `x-amz-date`, `x-amz-content-sha256`, the session token when present, and
    /// the `authorization` header. Every header already on the request is signed.
    pub fn sign(&self, request: &mut HttpRequest, host: &str, now: DateTime<Utc>) {
        let datetime = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        request.set_header("host", host);
        request.set_header("x-amz-date", datetime.as_str());
        if request.header_value("x-amz-content-sha256").is_none() {
            request.set_header("x-amz-content-sha256", payload_hash(&request.body));
        }
        if let Some(token) = self.credentials.security_token.as_deref() {
            request.set_header("x-amz-security-token", token);
        }

        let mut headers: Vec<(String, String)> = request
            .headers
            .iter()
            .filter(|(name, _)| name != "authorization")
            .map(|(name, value)| (name.to_ascii_lowercase(), value.trim().to_string()))
            .collect();
        headers.sort();
        let canonical_headers: String = headers
            .iter()
            .map(|(name, value)| format!("{}:{}\n", name, value))
            .collect();
        let signed_headers = headers
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let content_hash = request
            .header_value("x-amz-content-sha256")
            .unwrap_or_default()
            .to_string();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            request.method,
            request.path,
            request.query_string(),
            canonical_headers,
            signed_headers,
            content_hash
        );
        let scope = format!("{}/{}/{}/aws4_request", date, self.region, SERVICE);
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            datetime,
            scope,
            payload_hash(canonical_request.as_bytes())
        );
        let signature = hex::encode(hmac(&self.signing_key(&date), &string_to_sign));

        request.set_header(
            "authorization",
            format!(
                "{} Credential={}/{}, SignedHeaders={}, Signature={}",
                ALGORITHM, self.credentials.access_key, scope, signed_headers, signature
            ),
        );
    }
}
