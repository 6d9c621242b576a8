use std::convert::Infallible;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use tokio::net::TcpListener;
use url::form_urlencoded;

#[derive(Debug, Clone)]
pub struct Insert {
    pub query: String,
    pub body: Bytes,
}

struct State {
    status: AtomicU16,
    delay_ms: AtomicU64,
    inserts: Mutex<Vec<Insert>>,
}

/// Stand-in ClickHouse server recording every insert it receives.
pub struct Backend {
    pub url: String,
    state: Arc<State>,
}

impl Backend {
    pub async fn start(status: StatusCode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        let state = Arc::new(State {
            status: AtomicU16::new(status.as_u16()),
            delay_ms: AtomicU64::new(0),
            inserts: Mutex::new(Vec::new()),
        });

        let server_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = Arc::clone(&server_state);
                tokio::spawn(async move {
                    let service = service_fn(move |req| record(req, Arc::clone(&state)));
                    let _ = Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { url, state }
    }

    pub fn set_status(&self, status: StatusCode) {
        self.state.status.store(status.as_u16(), Ordering::SeqCst);
    }

    /// Hold every response for `delay` before answering.
    pub fn set_delay(&self, delay: Duration) {
        self.state
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn inserts(&self) -> Vec<Insert> {
        self.state.inserts.lock().unwrap().clone()
    }

    /// Poll until at least `n` inserts have been accepted.
    pub async fn wait_for_inserts(&self, n: usize, timeout: Duration) -> Vec<Insert> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let inserts = self.inserts();
            if inserts.len() >= n {
                return inserts;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("expected {n} inserts within {timeout:?}, got {inserts:?}");
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

async fn record(
    req: Request<hyper::body::Incoming>,
    state: Arc<State>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let query = req
        .uri()
        .query()
        .and_then(|q| {
            form_urlencoded::parse(q.as_bytes())
                .find(|(k, _)| k == "query")
                .map(|(_, v)| v.into_owned())
        })
        .unwrap_or_default();
    let body = req
        .into_body()
        .collect()
        .await
        .map(|c| c.to_bytes())
        .unwrap_or_default();

    let delay = state.delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    let status = StatusCode::from_u16(state.status.load(Ordering::SeqCst)).unwrap();
    if status.is_success() {
        state.inserts.lock().unwrap().push(Insert { query, body });
    }
    Ok(Response::builder()
        .status(status)
        .body(Full::new(Bytes::from_static(b"Ok.\n")))
        .unwrap())
}

/// Address nothing listens on.
pub fn unreachable_server() -> String {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    format!("http://127.0.0.1:{port}/")
}
