//! Amazon S3 source.
//!
//! Project patterns look like `s3://bucket/invoices/**/*.pdf`. The literal
//! key prefix before the first glob segment (`invoices/`) is sent as the
//! `ListObjectsV2` prefix; the full glob is then applied to each key.
//!
//! Requests use the S3 REST API directly with AWS Signature V4, signed with
//! `hmac` + `sha2`. Credentials come from `AWS_ACCESS_KEY_ID`,
//! `AWS_SECRET_ACCESS_KEY` and optionally `AWS_SESSION_TOKEN`.
//!
//! ```toml
//! [sources.s3]
//! region = "eu-central-1"
//! # endpoint_url = "http://localhost:9000"   # MinIO, path-style
//! ```
//!
//! Listing etags are the S3 ETags. They only describe the listing; the OCR
//! cache key is always the SHA-256 from [`SourceProvider::checksum`].

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use mrkr_core::error::SourceError;
use mrkr_core::models::{ProviderKind, SourceFile};

use crate::config::S3SourceConfig;
use crate::raster::{PageImage, Rasterizer};
use crate::source::{rasterize_uri, SourceProvider};
use crate::source_fs::{build_matcher, literal_prefix};

type HmacSha256 = Hmac<Sha256>;

pub struct S3Provider {
    config: S3SourceConfig,
    raster: Rasterizer,
    client: reqwest::Client,
}

impl S3Provider {
    pub fn new(config: S3SourceConfig, raster: Rasterizer) -> Self {
        Self {
            config,
            raster,
            client: reqwest::Client::new(),
        }
    }
}

/// `s3://bucket/key-or-glob` split into bucket and key part.
#[derive(Debug, PartialEq, Eq)]
pub struct S3Location<'a> {
    pub bucket: &'a str,
    pub key: &'a str,
}

pub fn parse_s3_uri(uri: &str) -> Result<S3Location<'_>> {
    let rest = uri
        .strip_prefix("s3://")
        .with_context(|| format!("not an s3:// uri: {}", uri))?;
    let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        bail!("missing bucket in {}", uri);
    }
    Ok(S3Location { bucket, key })
}

// ============ AWS Credentials ============

struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

// ============ Signed requests ============

/// Where requests for `bucket` go: `(scheme, host, path prefix)`.
///
/// AWS uses virtual-hosted addressing; custom endpoints use path-style.
fn endpoint_for(config: &S3SourceConfig, bucket: &str) -> (String, String, String) {
    match &config.endpoint_url {
        Some(endpoint) => {
            let scheme = if endpoint.starts_with("http://") {
                "http"
            } else {
                "https"
            };
            let host = endpoint
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string();
            (scheme.to_string(), host, format!("/{}", uri_encode(bucket)))
        }
        None => (
            "https".to_string(),
            format!("{}.s3.{}.amazonaws.com", bucket, config.region),
            String::new(),
        ),
    }
}

/// `k=v` pairs, URI-encoded and sorted, as SigV4 and the request URL want them.
fn canonical_query(query: &[(&str, String)]) -> String {
    let mut pairs: Vec<(String, String)> = query
        .iter()
        .map(|(k, v)| (uri_encode(k), uri_encode(v)))
        .collect();
    pairs.sort();
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// SigV4 headers for an empty-bodied S3 GET, `Authorization` included.
fn sign_get(
    creds: &AwsCredentials,
    region: &str,
    host: &str,
    canonical_uri: &str,
    canonical_query: &str,
    now: DateTime<Utc>,
) -> Vec<(&'static str, String)> {
    let date_stamp = now.format("%Y%m%d").to_string();
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let payload_hash = hex_sha256(b"");

    // Already in the lexical order SigV4 requires.
    let mut signed: Vec<(&'static str, String)> = vec![
        ("host", host.to_string()),
        ("x-amz-content-sha256", payload_hash.clone()),
        ("x-amz-date", amz_date.clone()),
    ];
    if let Some(token) = &creds.session_token {
        signed.push(("x-amz-security-token", token.clone()));
    }

    let header_names = signed.iter().map(|(k, _)| *k).collect::<Vec<_>>().join(";");
    let header_block: String = signed.iter().map(|(k, v)| format!("{}:{}\n", k, v)).collect();
    let canonical_request = format!(
        "GET\n{}\n{}\n{}\n{}\n{}",
        canonical_uri, canonical_query, header_block, header_names, payload_hash
    );

    let scope = format!("{}/{}/s3/aws4_request", date_stamp, region);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        scope,
        hex_sha256(canonical_request.as_bytes())
    );
    let key = derive_signing_key(&creds.secret_access_key, &date_stamp, region, "s3");
    let signature = hex_hmac_sha256(&key, string_to_sign.as_bytes());

    // `host` is set by reqwest from the URL.
    let mut headers: Vec<(&'static str, String)> = signed.into_iter().skip(1).collect();
    headers.push((
        "authorization",
        format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            creds.access_key_id, scope, header_names, signature
        ),
    ));
    headers
}

impl S3Provider {
    /// GET `key` (may be empty, for bucket-level calls) with `query` params.
    async fn signed_get(
        &self,
        creds: &AwsCredentials,
        bucket: &str,
        key: &str,
        query: &[(&str, String)],
    ) -> Result<reqwest::Response> {
        let (scheme, host, base_path) = endpoint_for(&self.config, bucket);
        let path = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        let canonical_uri = format!("{}/{}", base_path, path);
        let query = canonical_query(query);

        let mut url = format!("{}://{}{}", scheme, host, canonical_uri);
        if !query.is_empty() {
            url = format!("{}?{}", url, query);
        }

        let headers = sign_get(
            creds,
            &self.config.region,
            &host,
            &canonical_uri,
            &query,
            Utc::now(),
        );
        headers
            .into_iter()
            .fold(self.client.get(&url), |req, (name, value)| req.header(name, value))
            .send()
            .await
            .with_context(|| format!("S3 request failed: s3://{}/{}", bucket, key))
    }

    /// List every object under `prefix`, following continuation tokens.
    async fn list_objects(
        &self,
        creds: &AwsCredentials,
        bucket: &str,
        prefix: &str,
    ) -> Result<Vec<S3Object>> {
        let mut objects = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut query = vec![("list-type", "2".to_string())];
            if !prefix.is_empty() {
                query.push(("prefix", prefix.to_string()));
            }
            if let Some(token) = &continuation_token {
                query.push(("continuation-token", token.clone()));
            }

            let resp = self.signed_get(creds, bucket, "", &query).await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                bail!(
                    "S3 ListObjectsV2 failed (HTTP {}): {}",
                    status,
                    body.chars().take(500).collect::<String>()
                );
            }

            let page = parse_list_page(&resp.text().await?)?;
            objects.extend(page.objects);

            match page.next_token {
                Some(token) if page.truncated => continuation_token = Some(token),
                _ => break,
            }
        }

        Ok(objects)
    }
}

#[async_trait]
impl SourceProvider for S3Provider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::S3
    }

    #[instrument(level = "debug", skip(self))]
    async fn list_files(&self, pattern: &str) -> Result<Vec<SourceFile>> {
        let location = parse_s3_uri(pattern)?;
        let creds = AwsCredentials::from_env()?;
        let prefix = literal_prefix(location.key);
        let matcher = build_matcher(location.key)?;

        let objects = self.list_objects(&creds, location.bucket, prefix).await?;
        debug!(count = objects.len(), prefix, "Listed S3 objects");

        let mut files: Vec<SourceFile> = objects
            .into_iter()
            .filter(|obj| matcher.is_match(&obj.key))
            .map(|obj| SourceFile {
                name: obj.key.rsplit('/').next().unwrap_or(&obj.key).to_string(),
                uri: format!("s3://{}/{}", location.bucket, obj.key),
                etag: obj.etag,
            })
            .collect();
        files.sort_by(|a, b| a.uri.cmp(&b.uri));
        Ok(files)
    }

    async fn read(&self, uri: &str) -> Result<Vec<u8>> {
        let location = parse_s3_uri(uri)?;
        let creds = AwsCredentials::from_env()?;
        let resp = self
            .signed_get(&creds, location.bucket, location.key, &[])
            .await?;

        match resp.status() {
            s if s.is_success() => Ok(resp.bytes().await?.to_vec()),
            StatusCode::NOT_FOUND => Err(SourceError::NotFound {
                uri: uri.to_string(),
            }
            .into()),
            status => bail!("S3 GetObject failed (HTTP {}) for {}", status, uri),
        }
    }

    async fn to_images(&self, uri: &str) -> Result<Vec<PageImage>> {
        rasterize_uri(self, &self.raster, uri).await
    }
}

// ============ AWS SigV4 Helpers ============

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

/// Derive the AWS SigV4 signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode per RFC 3986, leaving `A-Z a-z 0-9 - _ . ~` as-is.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

// ============ XML Parsing ============

#[derive(Debug)]
struct S3Object {
    key: String,
    /// Stripped of surrounding quotes.
    etag: String,
}

/// One `ListObjectsV2` response page.
#[derive(Debug, Default)]
struct ListPage {
    objects: Vec<S3Object>,
    truncated: bool,
    next_token: Option<String>,
}

/// Parse a `ListObjectsV2` page. Text is XML-unescaped, so a key listed
/// as `R&amp;D/a.pdf` comes back as `R&D/a.pdf`. Directory placeholder keys
/// (ending in `/`) are skipped.
fn parse_list_page(xml: &str) -> Result<ListPage> {
    let mut reader = Reader::from_str(xml);
    let mut page = ListPage::default();
    let mut in_contents = false;
    let mut key = String::new();
    let mut etag = String::new();
    let mut text = String::new();

    loop {
        match reader
            .read_event()
            .context("malformed ListObjectsV2 response")?
        {
            Event::Start(e) => {
                text.clear();
                if e.local_name().as_ref() == b"Contents" {
                    in_contents = true;
                    key.clear();
                    etag.clear();
                }
            }
            Event::Text(t) => {
                text.push_str(&t.unescape().context("bad text in ListObjectsV2 response")?);
            }
            Event::End(e) => {
                match (in_contents, e.local_name().as_ref()) {
                    (true, b"Key") => key = std::mem::take(&mut text),
                    (true, b"ETag") => etag = text.trim_matches('"').to_string(),
                    (true, b"Contents") => {
                        in_contents = false;
                        if !key.is_empty() && !key.ends_with('/') {
                            page.objects.push(S3Object {
                                key: std::mem::take(&mut key),
                                etag: std::mem::take(&mut etag),
                            });
                        }
                    }
                    (false, b"IsTruncated") => page.truncated = text.trim() == "true",
                    (false, b"NextContinuationToken") => {
                        page.next_token = Some(std::mem::take(&mut text))
                    }
                    _ => {}
                }
                text.clear();
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(page)
}
