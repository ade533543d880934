//! S3-compatible [`ObjectStore`] over `reqwest`, signed with AWS Signature V4.
//!
//! Path-style addressing (`<endpoint>/<bucket>/<key>`) is used throughout so
//! the client works against AWS as well as self-hosted S3 implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use regex::Regex;
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::{debug, info};

use crate::config::CdnConfig;
use crate::contract::{
    CompletedPart, ObjectHeaders, ObjectLocation, ObjectStore, PutObject, StoreError, UploadPart,
};

type HmacSha256 = Hmac<Sha256>;

/// Access key pair for the object store.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
        }
    }

    /// Reads `AWS_ACCESS_KEY` (or `AWS_ACCESS_KEY_ID`) and `AWS_SECRET_ACCESS_KEY`.
    pub fn from_env() -> Option<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY")
            .or_else(|_| std::env::var("AWS_ACCESS_KEY_ID"))
            .ok()
            .filter(|v| !v.is_empty())?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .ok()
            .filter(|v| !v.is_empty())?;
        Some(Self {
            access_key_id,
            secret_access_key,
        })
    }
}

/// Percent-encodes per the SigV4 rules; `/` is kept when `keep_slash` is set.
pub fn uri_encode(input: &str, keep_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b'/' if keep_slash => out.push('/'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &str) -> Vec<u8> {
    // HMAC accepts keys of any length; the error arm is unreachable.
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        return Vec::new();
    };
    mac.update(data.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// The parts of a request covered by a SigV4 signature.
#[derive(Debug, Clone)]
pub struct CanonicalRequest<'a> {
    pub method: &'a str,
    /// Already URI-encoded path.
    pub uri: &'a str,
    /// Unencoded query pairs; they are encoded and sorted here.
    pub query: &'a [(String, String)],
    /// Lowercase header names with trimmed values.
    pub headers: &'a [(String, String)],
    pub payload_hash: &'a str,
}

impl CanonicalRequest<'_> {
    pub fn canonical_query(&self) -> String {
        let mut pairs: Vec<(String, String)> = self
            .query
            .iter()
            .map(|(k, v)| (uri_encode(k, false), uri_encode(v, false)))
            .collect();
        pairs.sort();
        pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    fn sorted_headers(&self) -> Vec<(String, String)> {
        let mut headers: Vec<(String, String)> = self
            .headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.trim().to_string()))
            .collect();
        headers.sort();
        headers
    }

    pub fn signed_headers(&self) -> String {
        self.sorted_headers()
            .into_iter()
            .map(|(k, _)| k)
            .collect::<Vec<_>>()
            .join(";")
    }

    pub fn to_canonical_string(&self) -> String {
        let canonical_headers: String = self
            .sorted_headers()
            .iter()
            .map(|(k, v)| format!("{k}:{v}\n"))
            .collect();
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            self.method,
            self.uri,
            self.canonical_query(),
            canonical_headers,
            self.signed_headers(),
            self.payload_hash
        )
    }
}

/// Computes the `Authorization` header value for `request`.
pub fn authorization(
    credentials: &Credentials,
    region: &str,
    service: &str,
    at: &DateTime<Utc>,
    request: &CanonicalRequest<'_>,
) -> String {
    let amz_date = at.format("%Y%m%dT%H%M%SZ").to_string();
    let date = at.format("%Y%m%d").to_string();
    let scope = format!("{date}/{region}/{service}/aws4_request");
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
        sha256_hex(request.to_canonical_string().as_bytes())
    );

    let k_date = hmac_sha256(format!("AWS4{}", credentials.secret_access_key).as_bytes(), &date);
    let k_region = hmac_sha256(&k_date, region);
    let k_service = hmac_sha256(&k_region, service);
    let k_signing = hmac_sha256(&k_service, "aws4_request");
    let signature = hex::encode(hmac_sha256(&k_signing, &string_to_sign));

    format!(
        "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={}, Signature={signature}",
        credentials.access_key_id,
        request.signed_headers()
    )
}

fn xml_unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Text content of every `<tag>` element in `body`.
fn xml_values(body: &str, tag: &str) -> Result<Vec<String>, StoreError> {
    let pattern = format!("<{0}>([^<]*)</{0}>", regex::escape(tag));
    let regex = Regex::new(&pattern).map_err(|e| StoreError::Protocol(e.to_string()))?;
    Ok(regex
        .captures_iter(body)
        .map(|c| xml_unescape(&c[1]))
        .collect())
}

pub struct S3Client {
    http: reqwest::Client,
    endpoint: Url,
    region: String,
    credentials: Credentials,
}

impl S3Client {
    pub fn new(
        config: &CdnConfig,
        credentials: Credentials,
        proxy: Option<&str>,
    ) -> Result<Self, StoreError> {
        let endpoint = Url::parse(&config.store_endpoint).map_err(|e| {
            StoreError::Protocol(format!("invalid store endpoint {}: {e}", config.store_endpoint))
        })?;
        if endpoint.host_str().is_none() {
            return Err(StoreError::Protocol(format!(
                "store endpoint {} has no host",
                config.store_endpoint
            )));
        }
        let mut builder = reqwest::Client::builder().timeout(config.publish.request_timeout);
        if let Some(proxy) = proxy.filter(|p| !p.is_empty()) {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| StoreError::Transport(format!("invalid proxy {proxy}: {e}")))?;
            builder = builder.proxy(proxy);
            info!("Routing object store traffic through configured proxy");
        }
        let http = builder
            .build()
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        info!(
            endpoint = %endpoint,
            region = %config.region,
            access_key_id = %credentials.access_key_id,
            "Initialised S3 client"
        );
        Ok(Self {
            http,
            endpoint,
            region: config.region.clone(),
            credentials,
        })
    }

    fn host(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    fn canonical_uri(bucket: &str, key: &str) -> String {
        if key.is_empty() {
            format!("/{}", uri_encode(bucket, false))
        } else {
            format!("/{}/{}", uri_encode(bucket, false), uri_encode(key, true))
        }
    }

    async fn send(
        &self,
        method: Method,
        location: &ObjectLocation,
        query: Vec<(String, String)>,
        extra_headers: Vec<(&'static str, String)>,
        body: Vec<u8>,
    ) -> Result<reqwest::Response, StoreError> {
        let uri = Self::canonical_uri(&location.bucket, &location.key);
        let payload_hash = sha256_hex(&body);
        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let signed = vec![
            ("host".to_string(), self.host()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        let canonical = CanonicalRequest {
            method: method.as_str(),
            uri: &uri,
            query: &query,
            headers: &signed,
            payload_hash: &payload_hash,
        };
        let auth = authorization(&self.credentials, &self.region, "s3", &now, &canonical);

        let origin = self.endpoint.as_str().trim_end_matches('/');
        let query_string = canonical.canonical_query();
        let url = if query_string.is_empty() {
            format!("{origin}{uri}")
        } else {
            format!("{origin}{uri}?{query_string}")
        };

        let mut request = self
            .http
            .request(method.clone(), url.as_str())
            .header("x-amz-date", amz_date)
            .header("x-amz-content-sha256", payload_hash)
            .header(reqwest::header::AUTHORIZATION, auth);
        for (name, value) in extra_headers {
            request = request.header(name, value);
        }

        debug!(method = %method, url = %url, bytes = body.len(), "Sending object store request");
        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(StoreError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }

    async fn text(response: reqwest::Response) -> Result<String, StoreError> {
        response
            .text()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))
    }
}

#[async_trait]
impl ObjectStore for S3Client {
    async fn list_keys(&self, bucket: String, prefix: String) -> Result<Vec<String>, StoreError> {
        let location = ObjectLocation::new(bucket, "");
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("prefix".to_string(), prefix.clone()),
            ];
            if let Some(t) = token.take() {
                query.push(("continuation-token".to_string(), t));
            }
            let response = self.send(Method::GET, &location, query, vec![], vec![]).await?;
            let body = Self::text(response).await?;
            keys.extend(xml_values(&body, "Key")?);

            let truncated = xml_values(&body, "IsTruncated")?
                .first()
                .is_some_and(|v| v == "true");
            if !truncated {
                break;
            }
            match xml_values(&body, "NextContinuationToken")?.into_iter().next() {
                Some(next) => token = Some(next),
                None => {
                    return Err(StoreError::Protocol(
                        "truncated listing without continuation token".to_string(),
                    ))
                }
            }
        }
        debug!(prefix = %prefix, count = keys.len(), "Listed remote keys");
        Ok(keys)
    }

    async fn put_object(&self, request: PutObject) -> Result<(), StoreError> {
        self.send(
            Method::PUT,
            &request.location,
            vec![],
            vec![
                ("cache-control", request.headers.cache_control),
                ("content-type", request.headers.content_type),
            ],
            request.body,
        )
        .await?;
        Ok(())
    }

    async fn create_multipart_upload(
        &self,
        location: ObjectLocation,
        headers: ObjectHeaders,
    ) -> Result<String, StoreError> {
        let response = self
            .send(
                Method::POST,
                &location,
                vec![("uploads".to_string(), String::new())],
                vec![
                    ("cache-control", headers.cache_control),
                    ("content-type", headers.content_type),
                ],
                vec![],
            )
            .await?;
        let body = Self::text(response).await?;
        xml_values(&body, "UploadId")?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Protocol("missing UploadId in response".to_string()))
    }

    async fn upload_part(&self, request: UploadPart) -> Result<CompletedPart, StoreError> {
        let response = self
            .send(
                Method::PUT,
                &request.location,
                vec![
                    ("partNumber".to_string(), request.part_number.to_string()),
                    ("uploadId".to_string(), request.upload_id.clone()),
                ],
                vec![],
                request.body,
            )
            .await?;
        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| StoreError::Protocol("missing ETag for uploaded part".to_string()))?;
        Ok(CompletedPart {
            part_number: request.part_number,
            etag: etag.to_string(),
        })
    }

    async fn complete_multipart_upload(
        &self,
        location: ObjectLocation,
        upload_id: String,
        parts: Vec<CompletedPart>,
    ) -> Result<(), StoreError> {
        let mut body = String::from("<CompleteMultipartUpload>");
        for part in &parts {
            body.push_str(&format!(
                "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
                part.part_number,
                xml_escape(&part.etag)
            ));
        }
        body.push_str("</CompleteMultipartUpload>");
        let response = self
            .send(
                Method::POST,
                &location,
                vec![("uploadId".to_string(), upload_id)],
                vec![("content-type", "application/xml".to_string())],
                body.into_bytes(),
            )
            .await?;
        // S3 can report a failed completion inside a 200 response.
        let text = Self::text(response).await?;
        if text.contains("<Error>") {
            return Err(StoreError::Status {
                status: 200,
                body: text,
            });
        }
        Ok(())
    }

    async fn abort_multipart_upload(
        &self,
        location: ObjectLocation,
        upload_id: String,
    ) -> Result<(), StoreError> {
        self.send(
            Method::DELETE,
            &location,
            vec![("uploadId".to_string(), upload_id)],
            vec![],
            vec![],
        )
        .await?;
        Ok(())
    }

    async fn delete_object(&self, location: ObjectLocation) -> Result<(), StoreError> {
        self.send(Method::DELETE, &location, vec![], vec![], vec![])
            .await?;
        Ok(())
    }
}
