use bytes::Bytes;
use http::{header, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::{body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use purger_core::{CacheError, CacheManager};
use purger_nginx::NginxManager;
use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;

type Seen = Arc<Mutex<Vec<(String, String)>>>;

/// Serves a fake management endpoint that answers each purge with `respond(path)`.
async fn serve(respond: fn(&str) -> StatusCode) -> (SocketAddr, Seen) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Seen::default();

    let requests = seen.clone();
    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let requests = requests.clone();
            tokio::spawn(async move {
                let svc = service_fn(move |req: Request<Incoming>| {
                    let requests = requests.clone();
                    async move {
                        let encoding = req
                            .headers()
                            .get(header::ACCEPT_ENCODING)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        let path = req
                            .uri()
                            .path_and_query()
                            .map(ToString::to_string)
                            .unwrap_or_default();
                        let status = respond(&path);
                        requests.lock().push((path, encoding));
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(status)
                                .body(Full::new(Bytes::from_static(b"some nginx error\n")))
                                .unwrap(),
                        )
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), svc)
                    .await;
            });
        }
    });

    (addr, seen)
}

fn manager() -> NginxManager {
    NginxManager::new(Duration::from_secs(5))
}

fn seen(requests: &Seen) -> Vec<(String, String)> {
    requests.lock().clone()
}

fn req(path: &str, encoding: &str) -> (String, String) {
    (path.to_string(), encoding.to_string())
}

#[tokio::test(flavor = "multi_thread")]
async fn purges_preserved_path_for_each_encoding() {
    let (addr, requests) = serve(|path| match path {
        "/purge/index.html" => StatusCode::OK,
        _ => StatusCode::NOT_FOUND,
    })
    .await;

    let hit = manager()
        .purge_cache("127.0.0.1", "/index.html", addr.port().into(), true)
        .await
        .expect("purge must succeed");
    assert!(hit);
    assert_eq!(
        seen(&requests),
        [
            req("/purge/index.html", "gzip"),
            req("/purge/index.html", "identity"),
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn purges_every_scheme_when_path_is_not_preserved() {
    let (addr, requests) = serve(|path| match path {
        "/purge/https/index.html" => StatusCode::OK,
        _ => StatusCode::NOT_FOUND,
    })
    .await;

    let hit = manager()
        .purge_cache("127.0.0.1", "/index.html", addr.port().into(), false)
        .await
        .expect("purge must succeed");
    assert!(hit);
    assert_eq!(
        seen(&requests),
        [
            req("/purge/http/index.html", "gzip"),
            req("/purge/https/index.html", "gzip"),
            req("/purge/http/index.html", "identity"),
            req("/purge/https/index.html", "identity"),
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn not_found_is_a_miss() {
    let (addr, _) = serve(|_| StatusCode::NOT_FOUND).await;

    let hit = manager()
        .purge_cache("127.0.0.1", "/index.html", addr.port().into(), true)
        .await
        .expect("purge must succeed");
    assert!(!hit);
}

#[tokio::test(flavor = "multi_thread")]
async fn unexpected_status_is_an_upstream_error() {
    let (addr, _) = serve(|_| StatusCode::INTERNAL_SERVER_ERROR).await;

    let error = manager()
        .purge_cache("127.0.0.1", "/index.html", addr.port().into(), true)
        .await
        .expect_err("purge must fail");
    assert!(matches!(error, CacheError::Upstream(_)), "{error:?}");
    assert_eq!(
        error.to_string(),
        format!(
            "unexpected status code 500 purging http://127.0.0.1:{}/purge/index.html: some nginx error",
            addr.port()
        )
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_pods_are_transport_errors() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let error = manager()
        .purge_cache("127.0.0.1", "/index.html", addr.port().into(), true)
        .await
        .expect_err("purge must fail");
    assert!(matches!(error, CacheError::Transport(_)), "{error:?}");
}
