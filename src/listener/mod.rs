mod insert;

use std::convert::Infallible;
use std::io::Read;

use bytes::Bytes;
use flate2::read::GzDecoder;
use http_body_util::{BodyExt, Full};
use hyper::header::{CONTENT_ENCODING, CONTENT_TYPE, HeaderValue};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use nanoserde::SerJson;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::form_urlencoded;

use crate::collector::{CollectError, Collector};
use crate::sender::Sender;

use insert::{Insert, parse};

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind listener on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

#[derive(SerJson)]
struct StatusBody {
    status: String,
    buffered_keys: usize,
    in_flight: usize,
}

pub async fn bind(port: u16) -> Result<TcpListener, ListenerError> {
    TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|source| ListenerError::Bind { port, source })
}

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body.into()));
    *resp.status_mut() = status;
    resp
}

fn query_param<B>(req: &Request<B>) -> Option<String> {
    form_urlencoded::parse(req.uri().query()?.as_bytes())
        .find(|(k, _)| k == "query")
        .map(|(_, v)| v.into_owned())
}

fn is_gzip<B>(req: &Request<B>) -> bool {
    req.headers()
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("gzip"))
}

/// Read the statement and rows out of an intake request.
async fn read_insert<B>(req: Request<B>) -> Result<Insert, (StatusCode, String)>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
{
    let query = query_param(&req);
    let gzip = is_gzip(&req);

    let body = req
        .collect()
        .await
        .map(|c| c.to_bytes())
        .map_err(|_| (StatusCode::BAD_REQUEST, "failed to read body".to_owned()))?;

    let body = if gzip {
        let mut decoded = Vec::new();
        GzDecoder::new(&body[..])
            .read_to_end(&mut decoded)
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid gzip body: {e}")))?;
        Bytes::from(decoded)
    } else {
        body
    };

    parse(query.as_deref(), body).map_err(|reason| (StatusCode::BAD_REQUEST, reason.to_owned()))
}

async fn intake<B, S>(req: Request<B>, collector: &Collector<S>) -> Response<Full<Bytes>>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    S: Sender,
{
    let insert = match read_insert(req).await {
        Ok(insert) => insert,
        Err((status, reason)) => {
            warn!(reason, "insert request rejected");
            return response(status, reason);
        }
    };

    let rows = insert.rows.len();
    match collector.add_rows(&insert.key, insert.rows) {
        Ok(()) => {
            debug!(key = %insert.key, rows, "rows accepted");
            response(StatusCode::OK, Bytes::new())
        }
        Err(CollectError::Closed) => response(StatusCode::SERVICE_UNAVAILABLE, "shutting down"),
        Err(e @ CollectError::InvalidPayload(_)) => response(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

fn status<S: Sender>(collector: &Collector<S>) -> Response<Full<Bytes>> {
    let body = StatusBody {
        status: "ok".to_owned(),
        buffered_keys: collector.len(),
        in_flight: collector.in_flight(),
    };
    let mut resp = response(StatusCode::OK, body.serialize_json());
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

async fn handle<B, S>(
    req: Request<B>,
    collector: Collector<S>,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
    S: Sender,
{
    let path = req.uri().path().to_owned();
    let method = req.method().clone();

    let resp = match (path.as_str(), &method) {
        ("/", &Method::POST | &Method::GET) => intake(req, &collector).await,
        ("/status", &Method::GET) => status(&collector),
        ("/version", &Method::GET) => response(
            StatusCode::OK,
            concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION")),
        ),
        ("/" | "/status" | "/version", _) => {
            warn!(%method, path, "method not allowed");
            response(StatusCode::METHOD_NOT_ALLOWED, Bytes::new())
        }
        _ => {
            debug!(path, "unknown path");
            response(StatusCode::NOT_FOUND, Bytes::new())
        }
    };
    Ok(resp)
}

/// Accept connections until cancelled, feeding every insert into `collector`.
pub async fn serve<S: Sender>(listener: TcpListener, collector: Collector<S>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                let stream = match result {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        continue;
                    }
                };
                let collector = collector.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(req, collector.clone()));
                    let _ = Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
            _ = cancel.cancelled() => {
                break;
            }
        }
    }
}
