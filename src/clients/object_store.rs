//! S3-compatible object store client

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{StatusCode, Url};
use tracing::{debug, info};

use super::sigv4::{self, Credentials};
use crate::error::{Error, Result};
use crate::options::ObjectStoreOptions;

/// Service name used in errors and logs
pub const SERVICE: &str = "object-store";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Region signed for when none is configured
pub const DEFAULT_REGION: &str = "us-east-1";

/// Operations the controller manager needs from the object store
#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    /// Bucket all objects live in
    fn bucket(&self) -> &str;

    /// Addressable URL of an object
    fn object_url(&self, key: &str) -> String;

    /// Check that the bucket is reachable with the configured credentials
    async fn ping(&self) -> Result<()>;
}

/// Build the object store client when an endpoint is configured.
///
/// Returns `Ok(None)` when the service is not configured.
pub async fn build(opts: Option<&ObjectStoreOptions>) -> Result<Option<Arc<dyn ObjectStoreClient>>> {
    let Some(opts) = opts.filter(|o| !o.endpoint.trim().is_empty()) else {
        debug!("Object store not configured");
        return Ok(None);
    };

    let client = S3Client::new(opts)?;
    client.ping().await.map_err(|e| match e {
        e @ Error::OptionalClient { .. } => e,
        other => Error::optional_client(SERVICE, other.to_string()),
    })?;

    info!(endpoint = %client.endpoint, bucket = %client.bucket, "Connected to object store");
    Ok(Some(Arc::new(client)))
}

/// S3-compatible implementation of [`ObjectStoreClient`]
#[derive(Debug, Clone)]
pub struct S3Client {
    endpoint: Url,
    bucket: String,
    region: String,
    force_path_style: bool,
    credentials: Option<Credentials>,
    http: reqwest::Client,
}

impl S3Client {
    /// Create a client without contacting the service
    pub fn new(opts: &ObjectStoreOptions) -> Result<Self> {
        let raw = opts.endpoint.trim();
        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else if opts.disable_ssl {
            format!("http://{}", raw)
        } else {
            format!("https://{}", raw)
        };

        let endpoint = Url::parse(&with_scheme).map_err(|e| {
            Error::optional_client(SERVICE, format!("invalid endpoint '{}': {}", raw, e))
        })?;
        if !matches!(endpoint.scheme(), "http" | "https") || endpoint.host_str().is_none() {
            return Err(Error::optional_client(
                SERVICE,
                format!("invalid endpoint '{}': expected an http(s) URL", raw),
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::optional_client(SERVICE, e.to_string()))?;

        // Anonymous access when no key is configured
        let credentials = (!opts.access_key_id.is_empty()).then(|| Credentials {
            access_key_id: opts.access_key_id.clone(),
            secret_access_key: opts.secret_access_key.clone(),
            session_token: Some(opts.session_token.clone()).filter(|t| !t.is_empty()),
        });

        Ok(Self {
            endpoint,
            bucket: opts.bucket.clone(),
            region: opts.region.trim().to_string(),
            force_path_style: opts.force_path_style,
            credentials,
            http,
        })
    }

    /// Region requests are signed for
    pub fn region(&self) -> &str {
        if self.region.is_empty() {
            DEFAULT_REGION
        } else {
            &self.region
        }
    }

    fn bucket_url(&self) -> String {
        let scheme = self.endpoint.scheme();
        let host = self.endpoint.host_str().unwrap_or_default();
        let authority = match self.endpoint.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        if self.bucket.is_empty() {
            format!("{}://{}", scheme, authority)
        } else if self.force_path_style {
            format!("{}://{}/{}", scheme, authority, self.bucket)
        } else {
            format!("{}://{}.{}", scheme, self.bucket, authority)
        }
    }
}

#[async_trait]
impl ObjectStoreClient for S3Client {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.bucket_url(), key.trim_start_matches('/'))
    }

    async fn ping(&self) -> Result<()> {
        let url = Url::parse(&self.bucket_url())
            .map_err(|e| Error::optional_client(SERVICE, format!("invalid bucket URL: {}", e)))?;

        let mut request = self.http.head(url.clone());
        if let Some(credentials) = &self.credentials {
            let headers = sigv4::sign("HEAD", &url, self.region(), credentials, Utc::now())
                .map_err(|e| Error::optional_client(SERVICE, format!("cannot sign request: {}", e)))?;
            for (name, value) in headers {
                request = request.header(name, value);
            }
        }

        let status = request.send().await?.status();
        debug!(status = %status, signed = self.credentials.is_some(), "Object store answered HEAD bucket");

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::optional_client(
                SERVICE,
                format!("access to bucket '{}' denied ({})", self.bucket, status),
            )),
            StatusCode::NOT_FOUND if !self.bucket.is_empty() => Err(Error::optional_client(
                SERVICE,
                format!("bucket '{}' does not exist", self.bucket),
            )),
            s if s.is_server_error() => Err(Error::optional_client(
                SERVICE,
                format!("endpoint answered {}", status),
            )),
            _ => Ok(()),
        }
    }
}
