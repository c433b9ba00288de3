//! Purges objects from an nginx replica through its management endpoint.
//!
//! The management server exposes a `/purge` location backed by the cache-purge module. When a
//! path is purged with `preserve_path`, the cache key is the request path itself and the object is
//! purged at `/purge<path>`. Otherwise cache keys are prefixed with the request scheme, so both
//! `/purge/http<path>` and `/purge/https<path>` are purged. Compressed and identity
//! representations are cached under distinct keys, so every location is requested once per
//! `Accept-Encoding` variant.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use bytes::Bytes;
use http::{header, Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Empty};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use purger_core::{CacheError, CacheManager};
use std::time::Duration;
use tracing::{debug, trace};

const PURGE_LOCATION: &str = "/purge";

const SCHEMES: [&str; 2] = ["http", "https"];

const ENCODINGS: [&str; 2] = ["gzip", "identity"];

/// Upstream error bodies are truncated to this many bytes in error messages.
const MAX_ERROR_BODY: usize = 256;

#[derive(Clone, Debug)]
pub struct NginxManager {
    client: Client<HttpConnector, Empty<Bytes>>,
    timeout: Duration,
}

// === impl NginxManager ===

impl NginxManager {
    /// Builds a manager whose purge requests each fail after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self { client, timeout }
    }

    async fn purge(&self, uri: Uri, encoding: &'static str) -> Result<bool, CacheError> {
        let req = Request::builder()
            .method(Method::GET)
            .uri(uri.clone())
            .header(header::ACCEPT_ENCODING, encoding)
            .body(Empty::new())
            .map_err(|error| CacheError::Validation(error.to_string()))?;

        let rsp = tokio::time::timeout(self.timeout, self.client.request(req))
            .await
            .map_err(|_| {
                CacheError::Transport(format!(
                    "timed out after {:?} purging {uri}",
                    self.timeout
                ))
            })?
            .map_err(|error| CacheError::Transport(format!("failed to purge {uri}: {error}")))?;

        let status = rsp.status();
        trace!(%uri, encoding, %status);
        match status {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let body = match tokio::time::timeout(self.timeout, rsp.into_body().collect()).await
                {
                    Ok(Ok(body)) => body.to_bytes(),
                    _ => Bytes::new(),
                };
                let body = &body[..body.len().min(MAX_ERROR_BODY)];
                Err(CacheError::Upstream(format!(
                    "unexpected status code {} purging {uri}: {}",
                    status.as_u16(),
                    String::from_utf8_lossy(body).trim()
                )))
            }
        }
    }
}

#[async_trait::async_trait]
impl CacheManager for NginxManager {
    async fn purge_cache(
        &self,
        host: &str,
        path: &str,
        port: i32,
        preserve_path: bool,
    ) -> Result<bool, CacheError> {
        let uris = purge_uris(host, port, path, preserve_path)?;

        let mut purged = false;
        for encoding in ENCODINGS {
            for uri in &uris {
                if self.purge(uri.clone(), encoding).await? {
                    purged = true;
                }
            }
        }

        debug!(%host, port, %path, purged);
        Ok(purged)
    }
}

/// Builds the management endpoint locations that purge `path` on `host:port`.
fn purge_uris(
    host: &str,
    port: i32,
    path: &str,
    preserve_path: bool,
) -> Result<Vec<Uri>, CacheError> {
    let port = u16::try_from(port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| CacheError::Validation(format!("invalid management port {port}")))?;

    // IPv6 addresses must be bracketed in an authority.
    let authority = if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    let sep = if path.starts_with('/') { "" } else { "/" };

    let paths = if preserve_path {
        vec![format!("{PURGE_LOCATION}{sep}{path}")]
    } else {
        SCHEMES
            .iter()
            .map(|scheme| format!("{PURGE_LOCATION}/{scheme}{sep}{path}"))
            .collect()
    };

    paths
        .into_iter()
        .map(|p| {
            format!("http://{authority}{p}")
                .parse::<Uri>()
                .map_err(|error| CacheError::Validation(format!("invalid path {path:?}: {error}")))
        })
        .collect()
}
