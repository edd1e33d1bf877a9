// crates/keygate-server/src/objectstore.rs
// Minimal S3-compatible object-store client with SigV4 signing

use aws_credential_types::Credentials;
use aws_sigv4::http_request::{
    PayloadChecksumKind, SignableBody, SignableRequest, SigningSettings, sign,
};
use aws_sigv4::sign::v4;
use aws_smithy_runtime_api::client::identity::Identity;
use reqwest::header::HeaderMap;
use serde::Deserialize;

use crate::config::ApertureS3Config;
use crate::error::{GatewayError, Result};

/// Client for `ListObjectsV2`, `GetObject` and `PutObject` against an
/// S3-compatible store.
///
/// Requests are signed with SigV4 when access credentials are configured and
/// sent unsigned otherwise (public or IAM-fronted buckets). URL style follows
/// the endpoint: virtual-hosted against AWS proper, path-style when an
/// explicit endpoint is configured.
pub struct ObjectStoreClient {
    client: reqwest::Client,
    bucket: String,
    region: String,
    endpoint: String,
    credentials: Option<Credentials>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListBucketResult {
    #[serde(default)]
    contents: Vec<ListEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListEntry {
    key: String,
    #[serde(default)]
    size: u64,
}

/// One listed object.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
}

impl ObjectStoreClient {
    pub fn new(client: reqwest::Client, config: &ApertureS3Config) -> Self {
        let credentials = if !config.access_key.is_empty() && !config.secret_key.is_empty() {
            Some(Credentials::new(
                config.access_key.clone(),
                config.secret_key.clone(),
                None,
                None,
                "keygate-config",
            ))
        } else {
            None
        };
        Self {
            client,
            bucket: config.bucket.clone(),
            region: if config.region.is_empty() {
                "us-east-1".to_string()
            } else {
                config.region.clone()
            },
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            credentials,
        }
    }

    /// List keys under `prefix`, strictly after `start_after`, in
    /// lexicographic order (the store's native ordering).
    pub async fn list_objects(&self, prefix: &str, start_after: &str) -> Result<Vec<ObjectInfo>> {
        let mut query = format!("list-type=2&prefix={}", urlencoding::encode(prefix));
        if !start_after.is_empty() {
            query.push_str(&format!("&start-after={}", urlencoding::encode(start_after)));
        }
        let url = format!("{}?{}", self.object_url(""), query);

        let headers = self.sign_headers("GET", &url, b"")?;
        let resp = self.client.get(&url).headers(headers).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(GatewayError::ObjectStore(format!(
                "list returned {status}: {}",
                truncate(&body, 200)
            )));
        }

        let parsed: ListBucketResult = quick_xml::de::from_str(&body)
            .map_err(|e| GatewayError::ObjectStore(format!("bad list response: {e}")))?;
        Ok(parsed
            .contents
            .into_iter()
            .map(|c| ObjectInfo {
                key: c.key,
                size: c.size,
            })
            .collect())
    }

    /// Download one object.
    pub async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        let url = self.object_url(key);
        let headers = self.sign_headers("GET", &url, b"")?;
        let resp = self.client.get(&url).headers(headers).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(GatewayError::ObjectStore(format!(
                "get {key} returned {status}"
            )));
        }
        Ok(resp.bytes().await?.to_vec())
    }

    /// Upload one object.
    pub async fn put_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()> {
        let url = self.object_url(key);
        let mut headers = self.sign_headers("PUT", &url, &body)?;
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            content_type
                .parse()
                .map_err(|_| GatewayError::InvalidInput(format!("bad content type {content_type}")))?,
        );
        let resp = self
            .client
            .put(&url)
            .headers(headers)
            .body(body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(GatewayError::ObjectStore(format!(
                "put {key} returned {status}"
            )));
        }
        Ok(())
    }

    /// Virtual-hosted URL without an explicit endpoint, path-style with one.
    fn object_url(&self, key: &str) -> String {
        let key = key.trim_start_matches('/');
        if self.endpoint.is_empty() {
            format!(
                "https://{}.s3.{}.amazonaws.com/{}",
                self.bucket, self.region, key
            )
        } else {
            format!("{}/{}/{}", self.endpoint, self.bucket, key)
        }
    }

    /// SigV4 headers for a request, or an empty map when unsigned.
    fn sign_headers(&self, method: &str, url: &str, body: &[u8]) -> Result<HeaderMap> {
        let mut out = HeaderMap::new();
        let credentials = match &self.credentials {
            Some(c) => c.clone(),
            None => return Ok(out),
        };

        let parsed = reqwest::Url::parse(url)
            .map_err(|e| GatewayError::ObjectStore(format!("bad url {url}: {e}")))?;
        let host = match parsed.port() {
            Some(port) => format!("{}:{}", parsed.host_str().unwrap_or_default(), port),
            None => parsed.host_str().unwrap_or_default().to_string(),
        };

        let identity: Identity = credentials.into();
        let mut settings = SigningSettings::default();
        settings.payload_checksum_kind = PayloadChecksumKind::XAmzSha256;
        let params = v4::SigningParams::builder()
            .identity(&identity)
            .region(&self.region)
            .name("s3")
            .time(std::time::SystemTime::now())
            .settings(settings)
            .build()
            .map_err(|e| GatewayError::ObjectStore(format!("signing params: {e}")))?
            .into();

        let host_headers = [("host", host.as_str())];
        let signable = SignableRequest::new(
            method,
            url,
            host_headers.iter().map(|(k, v)| (*k, *v)),
            SignableBody::Bytes(body),
        )
        .map_err(|e| GatewayError::ObjectStore(format!("signable request: {e}")))?;

        let (instructions, _signature) = sign(signable, &params)
            .map_err(|e| GatewayError::ObjectStore(format!("signing failed: {e}")))?
            .into_parts();

        let mut request = http::Request::builder()
            .method(method)
            .uri(url)
            .body(())
            .map_err(|e| GatewayError::ObjectStore(format!("request build: {e}")))?;
        instructions.apply_to_request_http1x(&mut request);

        for (name, value) in request.headers() {
            out.insert(name.clone(), value.clone());
        }
        Ok(out)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(endpoint: &str, keys: bool) -> ApertureS3Config {
        ApertureS3Config {
            bucket: "usage".into(),
            region: "eu-central-1".into(),
            prefix: "exports/".into(),
            endpoint: endpoint.into(),
            access_key: if keys { "AKID".into() } else { String::new() },
            secret_key: if keys { "SECRET".into() } else { String::new() },
        }
    }

    #[test]
    fn test_virtual_hosted_url_without_endpoint() {
        let client = ObjectStoreClient::new(reqwest::Client::new(), &config("", false));
        assert_eq!(
            client.object_url("exports/a.ndjson"),
            "https://usage.s3.eu-central-1.amazonaws.com/exports/a.ndjson"
        );
    }

    #[test]
    fn test_path_style_url_with_endpoint() {
        let client =
            ObjectStoreClient::new(reqwest::Client::new(), &config("http://minio:9000/", false));
        assert_eq!(
            client.object_url("exports/a.ndjson"),
            "http://minio:9000/usage/exports/a.ndjson"
        );
    }

    #[test]
    fn test_unsigned_when_no_credentials() {
        let client = ObjectStoreClient::new(reqwest::Client::new(), &config("", false));
        let headers = client
            .sign_headers("GET", "https://usage.s3.eu-central-1.amazonaws.com/", b"")
            .unwrap();
        assert!(headers.is_empty());
    }

    #[test]
    fn test_signed_headers_present_with_credentials() {
        let client = ObjectStoreClient::new(reqwest::Client::new(), &config("", true));
        let headers = client
            .sign_headers("GET", "https://usage.s3.eu-central-1.amazonaws.com/?list-type=2", b"")
            .unwrap();
        assert!(headers.contains_key("authorization"));
        assert!(headers.contains_key("x-amz-date"));
        assert!(headers.contains_key("x-amz-content-sha256"));
        let auth = headers["authorization"].to_str().unwrap();
        assert!(auth.starts_with("AWS4-HMAC-SHA256"));
        assert!(auth.contains("eu-central-1/s3/aws4_request"));
    }

    #[test]
    fn test_parse_list_response() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>usage</Name>
  <Prefix>exports/</Prefix>
  <KeyCount>2</KeyCount>
  <IsTruncated>false</IsTruncated>
  <Contents>
    <Key>exports/2026-07-31.ndjson</Key>
    <LastModified>2026-07-31T23:59:01.000Z</LastModified>
    <Size>2048</Size>
  </Contents>
  <Contents>
    <Key>exports/2026-08-01.ndjson</Key>
    <LastModified>2026-08-01T00:59:01.000Z</LastModified>
    <Size>4096</Size>
  </Contents>
</ListBucketResult>"#;
        let parsed: ListBucketResult = quick_xml::de::from_str(xml).unwrap();
        assert_eq!(parsed.contents.len(), 2);
        assert_eq!(parsed.contents[0].key, "exports/2026-07-31.ndjson");
        assert_eq!(parsed.contents[1].size, 4096);
    }

    #[test]
    fn test_parse_empty_list_response() {
        let xml = r#"<ListBucketResult><KeyCount>0</KeyCount><IsTruncated>false</IsTruncated></ListBucketResult>"#;
        let parsed: ListBucketResult = quick_xml::de::from_str(xml).unwrap();
        assert!(parsed.contents.is_empty());
    }
}
