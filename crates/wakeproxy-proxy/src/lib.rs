//! The admission path: one listener per configured port, each forwarding
//! every request to a single backend destination through a
//! [`wakeproxy_process::ProcessController`], which blocks the request
//! until the backend is up.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Bytes, Body};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderName, StatusCode};
use axum::response::Response;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use wakeproxy_process::ProcessController;

/// How long a listener keeps draining in-flight connections after
/// cancellation before giving up and closing anyway.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct ProxyState<C> {
    destination: Url,
    client: reqwest::Client,
    controller: Arc<C>,
}

/// Binds `listen_port`, forwarding every request on it to `destination`
/// via `controller`. Runs until `cancellation` fires, then drains
/// in-flight connections for up to five seconds before returning.
pub async fn serve_port<C>(
    listen_port: u16,
    destination: Url,
    controller: Arc<C>,
    client: reqwest::Client,
    cancellation: CancellationToken,
) -> std::io::Result<()>
where
    C: ProcessController + Send + Sync + 'static,
{
    let addr = SocketAddr::from(([0, 0, 0, 0], listen_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, %destination, "listener bound");

    let state = ProxyState {
        destination,
        client,
        controller,
    };
    let app = Router::new()
        .fallback(forward::<C>)
        .with_state(state)
        .into_make_service_with_connect_info::<SocketAddr>();

    let shutdown_token = cancellation.clone();
    let serve_fut = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown_token.cancelled().await });

    tokio::select! {
        result = serve_fut => result,
        _ = async { cancellation.cancelled().await; tokio::time::sleep(SHUTDOWN_GRACE).await } => {
            warn!(%addr, "graceful shutdown window elapsed, closing listener");
            Ok(())
        }
    }
}

async fn forward<C>(
    State(state): State<ProxyState<C>>,
    connect_info: ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response
where
    C: ProcessController + Send + Sync + 'static,
{
    let (parts, body) = req.into_parts();
    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => return bad_gateway(format!("failed to read request body: {e}")),
    };

    let mut url = state.destination.clone();
    url.set_path(parts.uri.path());
    url.set_query(parts.uri.query());

    let mut builder = state.client.request(parts.method.clone(), url);
    for (name, value) in parts.headers.iter() {
        if name == axum::http::header::HOST {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder = builder
        .header("x-forwarded-for", connect_info.0.ip().to_string())
        .header("x-forwarded-proto", "http");
    if let Some(forwarded_host) = parts
        .headers
        .get(axum::http::header::HOST)
        .and_then(|h| h.to_str().ok())
    {
        builder = builder.header("x-forwarded-host", forwarded_host);
    }
    let request = builder.body(body_bytes);

    let (tx, rx) = tokio::sync::oneshot::channel();
    let job = async move {
        let outcome = request.send().await;
        let _ = tx.send(outcome);
    };

    if let Err(e) = state.controller.exec(job).await {
        return bad_gateway(format!("backend unavailable: {e}"));
    }

    match rx.await {
        Ok(Ok(resp)) => response_from_reqwest(resp),
        Ok(Err(e)) => bad_gateway(format!("request to backend failed: {e}")),
        Err(_) => bad_gateway("proxied request was dropped before completing"),
    }
}

fn response_from_reqwest(resp: reqwest::Response) -> Response {
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = Body::from_stream(resp.bytes_stream());

    let mut builder = Response::builder().status(status);
    if let Some(response_headers) = builder.headers_mut() {
        *response_headers = headers;
    }
    builder
        .body(body)
        .unwrap_or_else(|_| bad_gateway("failed to construct proxied response"))
}

fn bad_gateway(message: impl Into<String>) -> Response {
    let message = message.into();
    warn!(%message, "returning 502 to client");
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header(HeaderName::from_static("content-type"), "text/plain")
        .body(Body::from(Bytes::from(message)))
        .expect("a fixed-shape 502 response always builds")
}
