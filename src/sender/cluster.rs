use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use flate2::write::GzEncoder;
use reqwest::Client;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use super::{PendingGuard, SendError, Sender, dump_on_failure};
use crate::batch::Batch;
use crate::config::{Compression, Config};
use crate::dumper::FileDumper;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Up,
    Down { since: Instant },
}

struct Health {
    status: Status,
    /// Last ticket handed to an attempt.
    issued: u64,
    /// Ticket of the attempt whose outcome set `status`.
    applied: u64,
}

/// One backend server and its health.
///
/// Selection and outcome recording both go through the `health` lock. Each
/// attempt gets a ticket at selection time and its outcome only applies if no
/// later-started attempt has already reported, so a slow stale failure cannot
/// knock down an endpoint a newer attempt just proved healthy (and the reverse).
pub struct Endpoint {
    url: Url,
    health: Mutex<Health>,
}

impl Endpoint {
    pub(super) fn new(url: Url) -> Self {
        Self {
            url,
            health: Mutex::new(Health {
                status: Status::Up,
                issued: 0,
                applied: 0,
            }),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn status(&self) -> Status {
        self.lock().status
    }

    fn lock(&self) -> MutexGuard<'_, Health> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ticket for a new attempt, or `None` while the endpoint is cooling down.
    pub(super) fn begin_attempt(&self, now: Instant, down_timeout: Duration) -> Option<u64> {
        let mut health = self.lock();
        if let Status::Down { since } = health.status
            && now.saturating_duration_since(since) < down_timeout
        {
            return None;
        }
        health.issued += 1;
        Some(health.issued)
    }

    /// Returns `true` if this success brought the endpoint back from Down.
    pub(super) fn record_success(&self, ticket: u64) -> bool {
        let mut health = self.lock();
        if ticket <= health.applied {
            return false;
        }
        health.applied = ticket;
        let recovered = matches!(health.status, Status::Down { .. });
        health.status = Status::Up;
        recovered
    }

    pub(super) fn record_failure(&self, ticket: u64, now: Instant) {
        let mut health = self.lock();
        if ticket <= health.applied {
            return;
        }
        health.applied = ticket;
        health.status = Status::Down { since: now };
    }
}

/// Sends batches to a ClickHouse cluster over the HTTP interface, trying
/// endpoints in registration order and skipping those cooling down.
pub struct ClusterSender {
    endpoints: Vec<Endpoint>,
    client: Client,
    down_timeout: Duration,
    compression: Compression,
    dumper: Option<Arc<FileDumper>>,
    pending: AtomicUsize,
}

impl ClusterSender {
    pub fn new(config: &Config) -> Result<Self, SendError> {
        let client = Client::builder()
            .timeout(config.send_timeout)
            .build()
            .map_err(SendError::Client)?;

        Ok(Self {
            endpoints: Vec::new(),
            client,
            down_timeout: config.down_timeout,
            compression: config.compression,
            dumper: None,
            pending: AtomicUsize::new(0),
        })
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    fn encode(&self, batch: &Batch) -> Result<Bytes, SendError> {
        let content = batch.content();
        match self.compression {
            Compression::None => Ok(content),
            Compression::Gzip => Ok(Bytes::from(compress_gzip(&content)?)),
        }
    }

    async fn transmit(&self, endpoint: &Endpoint, query: &str, body: Bytes) -> Result<(), SendError> {
        let mut url = endpoint.url().clone();
        url.query_pairs_mut().append_pair("query", query);

        let mut req = self.client.post(url).body(body);
        if self.compression == Compression::Gzip {
            req = req.header("content-encoding", "gzip");
        }

        let failure = |reason: String| SendError::EndpointFailure {
            server: endpoint.url().to_string(),
            reason,
        };

        let resp = req.send().await.map_err(|e| failure(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(failure(format!("HTTP {status}: {}", body.trim())))
    }
}

impl Sender for ClusterSender {
    fn add_server(&mut self, address: &str) -> Result<(), SendError> {
        let url = Url::parse(address).map_err(|_| SendError::InvalidAddress(address.to_owned()))?;
        debug!(server = %url, "registered endpoint");
        self.endpoints.push(Endpoint::new(url));
        Ok(())
    }

    fn set_dumper(&mut self, dumper: Arc<FileDumper>) {
        self.dumper = Some(dumper);
    }

    async fn deliver(&self, batch: Batch) -> Result<(), SendError> {
        let _pending = PendingGuard::new(&self.pending);
        let outcome = self.try_deliver(&batch).await;
        dump_on_failure(self.dumper.as_deref(), &batch, outcome).await
    }

    async fn try_deliver<'a>(&'a self, batch: &'a Batch) -> Result<(), SendError> {
        let body = self.encode(batch)?;
        let mut tried = Vec::new();

        for endpoint in &self.endpoints {
            let Some(ticket) = endpoint.begin_attempt(Instant::now(), self.down_timeout) else {
                continue;
            };
            match self.transmit(endpoint, batch.key(), body.clone()).await {
                Ok(()) => {
                    if endpoint.record_success(ticket) {
                        info!(server = %endpoint.url(), "endpoint is back up");
                    }
                    debug!(
                        server = %endpoint.url(),
                        key = batch.key(),
                        rows = batch.row_count(),
                        "batch delivered"
                    );
                    return Ok(());
                }
                Err(e) => {
                    endpoint.record_failure(ticket, Instant::now());
                    warn!(
                        error = %e,
                        server = %endpoint.url(),
                        down_for_s = self.down_timeout.as_secs(),
                        "delivery attempt failed, marking endpoint down"
                    );
                    tried.push(endpoint.url().to_string());
                }
            }
        }

        Err(SendError::ClusterExhausted {
            tried,
            dumped_to: None,
        })
    }

    fn len(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(data)?;
    encoder.finish()
}
