//! The purger's HTTP API.
//!
//! ```text
//! GET  /healthcheck
//! GET  /
//! GET  /metrics
//! POST /resources/:instance/purge       {"path": "...", "preserve_path": bool}
//! POST /resources/:instance/purge/bulk  [{"path": "...", "preserve_path": bool}, ...]
//! ```
//!
//! Both purge routes respond with `PurgeCacheBulkResult` JSON: a single object for a single purge
//! and an array, in request order, for a bulk purge.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod metrics;
pub mod server;

pub use self::{metrics::ApiMetrics, server::Server};

use bytes::Bytes;
use futures::{future, prelude::*};
use http::{header, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Limited};
use prometheus_client::registry::Registry;
use purger_core::{
    CacheManager, Error, ListPods, PurgeCacheArgs, PurgeCacheBulkResult, Purger,
};
use serde::Serialize;
use std::{convert::Infallible, panic::AssertUnwindSafe, sync::Arc, time::Instant};
use tracing::{debug, error, info, info_span, Instrument};

pub type Body = http_body_util::Full<Bytes>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const BANNER: &str = "Reverse proxy cache purger";

/// Request bodies larger than this are rejected.
const MAX_BODY_BYTES: usize = 1024 * 1024;

const OPENMETRICS_CONTENT_TYPE: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Serves purge requests against a [`Purger`].
pub struct Api<L, C> {
    purger: Arc<Purger<L, C>>,
    metrics: ApiMetrics,
    registry: Option<Arc<Registry>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Route<'a> {
    Banner,
    Healthcheck,
    Metrics,
    Purge(&'a str),
    PurgeBulk(&'a str),
    Unknown,
}

#[derive(Serialize)]
struct Message {
    message: String,
}

// === impl Api ===

impl<L, C> Api<L, C>
where
    L: ListPods + Send + Sync + 'static,
    C: CacheManager + 'static,
{
    pub fn new(purger: Purger<L, C>, metrics: ApiMetrics) -> Self {
        Self {
            purger: Arc::new(purger),
            metrics,
            registry: None,
        }
    }

    /// Exposes `registry` at `/metrics`.
    pub fn with_registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    async fn handle<B>(&self, req: Request<B>) -> Response<Body>
    where
        B: hyper::body::Body + Send,
        B::Error: Into<BoxError>,
    {
        let (parts, body) = req.into_parts();
        match (Route::parse(parts.uri.path()), parts.method) {
            (Route::Banner, Method::GET) => text(StatusCode::OK, BANNER),
            (Route::Healthcheck, Method::GET) => text(StatusCode::OK, "OK"),
            (Route::Metrics, Method::GET) => self.metrics_response(),
            (Route::Purge(instance), Method::POST) => self.purge(instance, body).await,
            (Route::PurgeBulk(instance), Method::POST) => self.purge_bulk(instance, body).await,
            (Route::Unknown, _) => empty(StatusCode::NOT_FOUND),
            (_, _) => empty(StatusCode::METHOD_NOT_ALLOWED),
        }
    }

    async fn purge<B>(&self, instance: &str, body: B) -> Response<Body>
    where
        B: hyper::body::Body + Send,
        B::Error: Into<BoxError>,
    {
        let args = match read_json::<PurgeCacheArgs, _>(instance, body).await {
            Ok(args) => args,
            Err(rsp) => return rsp,
        };

        let outcome = self.purger.purge_cache(instance, &args).await;
        self.metrics.purge(&outcome);
        let status = match &outcome {
            Ok(_) => StatusCode::OK,
            Err(Error::Validation(message)) => return text(StatusCode::BAD_REQUEST, message),
            Err(Error::NotFound(_)) => StatusCode::NOT_FOUND,
            Err(Error::Upstream { .. }) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        json(status, &PurgeCacheBulkResult::new(args.path, &outcome))
    }

    async fn purge_bulk<B>(&self, instance: &str, body: B) -> Response<Body>
    where
        B: hyper::body::Body + Send,
        B::Error: Into<BoxError>,
    {
        let args_list = match read_json::<Vec<PurgeCacheArgs>, _>(instance, body).await {
            Ok(args) => args,
            Err(rsp) => return rsp,
        };

        let mut status = StatusCode::OK;
        let mut results = Vec::with_capacity(args_list.len());
        for args in args_list {
            let outcome = self.purger.purge_cache(instance, &args).await;
            self.metrics.purge(&outcome);
            if outcome.is_err() {
                status = StatusCode::INTERNAL_SERVER_ERROR;
            }
            results.push(PurgeCacheBulkResult::new(args.path, &outcome));
        }
        json(status, &results)
    }

    fn metrics_response(&self) -> Response<Body> {
        let Some(registry) = self.registry.as_ref() else {
            return empty(StatusCode::NOT_FOUND);
        };

        let mut buf = String::new();
        if let Err(error) = prometheus_client::encoding::text::encode(&mut buf, registry) {
            error!(%error, "Failed to encode metrics");
            return empty(StatusCode::INTERNAL_SERVER_ERROR);
        }
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, OPENMETRICS_CONTENT_TYPE)
            .body(Body::from(buf))
            .expect("metrics response must be valid")
    }
}

impl<L, C> Clone for Api<L, C> {
    fn clone(&self) -> Self {
        Self {
            purger: self.purger.clone(),
            metrics: self.metrics.clone(),
            registry: self.registry.clone(),
        }
    }
}

impl<L, C, B> tower::Service<Request<B>> for Api<L, C>
where
    L: ListPods + Send + Sync + 'static,
    C: CacheManager + 'static,
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Infallible>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let api = self.clone();
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let span = info_span!("request", %method, %path);
        Box::pin(
            async move {
                let start = Instant::now();
                let route = Route::parse(&path).name();
                let rsp = match AssertUnwindSafe(api.handle(req)).catch_unwind().await {
                    Ok(rsp) => rsp,
                    Err(_) => {
                        error!("Request handler panicked");
                        text(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
                    }
                };

                let elapsed = start.elapsed();
                info!(status = rsp.status().as_u16(), ?elapsed, "Handled request");
                api.metrics.request(route, &method, rsp.status(), elapsed);
                Ok(rsp)
            }
            .instrument(span),
        )
    }
}

// === impl Route ===

impl<'a> Route<'a> {
    fn parse(path: &'a str) -> Self {
        match path {
            "/" => return Self::Banner,
            "/healthcheck" => return Self::Healthcheck,
            "/metrics" => return Self::Metrics,
            _ => {}
        }

        let Some(rest) = path.strip_prefix("/resources/") else {
            return Self::Unknown;
        };
        if let Some(instance) = rest.strip_suffix("/purge/bulk") {
            if !instance.contains('/') {
                return Self::PurgeBulk(instance);
            }
        }
        if let Some(instance) = rest.strip_suffix("/purge") {
            if !instance.contains('/') {
                return Self::Purge(instance);
            }
        }
        Self::Unknown
    }

    /// The route's label in request metrics.
    fn name(&self) -> &'static str {
        match self {
            Self::Banner => "/",
            Self::Healthcheck => "/healthcheck",
            Self::Metrics => "/metrics",
            Self::Purge(_) => "/resources/:instance/purge",
            Self::PurgeBulk(_) => "/resources/:instance/purge/bulk",
            Self::Unknown => "unknown",
        }
    }
}

/// Validates the instance and decodes a non-empty JSON request body.
async fn read_json<T, B>(instance: &str, body: B) -> Result<T, Response<Body>>
where
    T: serde::de::DeserializeOwned,
    B: hyper::body::Body,
    B::Error: Into<BoxError>,
{
    if instance.is_empty() {
        return Err(text(StatusCode::BAD_REQUEST, "instance is required"));
    }

    let bytes = match Limited::new(body, MAX_BODY_BYTES).collect().await {
        Ok(body) => body.to_bytes(),
        Err(error) => {
            debug!(%error, "Failed to read request body");
            return Err(message(
                StatusCode::BAD_REQUEST,
                format!("failed to read request body: {error}"),
            ));
        }
    };
    if bytes.is_empty() {
        return Err(message(
            StatusCode::BAD_REQUEST,
            "Request body can't be empty",
        ));
    }

    serde_json::from_slice(&bytes).map_err(|error| {
        debug!(%error, "Failed to decode request body");
        message(StatusCode::BAD_REQUEST, error.to_string())
    })
}

fn json<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    let bytes = match serde_json::to_vec(body) {
        Ok(bytes) => bytes,
        Err(error) => {
            error!(%error, "Failed to encode response");
            return empty(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("json response must be valid")
}

fn message(status: StatusCode, message: impl Into<String>) -> Response<Body> {
    json(
        status,
        &Message {
            message: message.into(),
        },
    )
}

fn text(status: StatusCode, body: impl Into<String>) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(body.into()))
        .expect("text response must be valid")
}

fn empty(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::default())
        .expect("empty response must be valid")
}
