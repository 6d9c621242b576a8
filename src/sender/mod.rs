mod cluster;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use thiserror::Error;
use tracing::{error, warn};

use crate::batch::Batch;
use crate::dumper::{DumpError, FileDumper};

pub use cluster::{ClusterSender, Endpoint, Status};

#[derive(Debug, Error)]
pub enum SendError {
    #[error("invalid server address: {0}")]
    InvalidAddress(String),

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("delivery to {server} failed: {reason}")]
    EndpointFailure { server: String, reason: String },

    #[error("no endpoint accepted the batch (tried: [{}])", .tried.join(", "))]
    ClusterExhausted {
        tried: Vec<String>,
        dumped_to: Option<PathBuf>,
    },

    #[error("no endpoint accepted the batch and dumping it failed: {source}")]
    DumpFailed {
        tried: Vec<String>,
        #[source]
        source: DumpError,
    },

    #[error("gzip compression failed: {0}")]
    Compression(#[from] std::io::Error),
}

/// Delivery of flushed batches to the database.
///
/// `deliver` owns escalation: it returns an error only once every viable
/// endpoint has failed, and by then the batch has already been handed to the
/// configured dumper. `try_deliver` performs the same attempts without that
/// escalation and is what dump replay uses.
pub trait Sender: Send + Sync + 'static {
    fn add_server(&mut self, address: &str) -> Result<(), SendError>;

    fn set_dumper(&mut self, dumper: Arc<FileDumper>);

    fn deliver(&self, batch: Batch) -> impl Future<Output = Result<(), SendError>> + Send + '_;

    fn try_deliver<'a>(
        &'a self,
        batch: &'a Batch,
    ) -> impl Future<Output = Result<(), SendError>> + Send + 'a;

    /// Number of `deliver` calls currently in progress.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hand an undeliverable batch to the dumper and build the error `deliver` reports.
pub async fn escalate(
    dumper: Option<&FileDumper>,
    batch: &Batch,
    tried: Vec<String>,
) -> SendError {
    let Some(dumper) = dumper else {
        error!(
            key = batch.key(),
            rows = batch.row_count(),
            bytes = batch.size_bytes(),
            "no dumper configured, batch dropped"
        );
        return SendError::ClusterExhausted {
            tried,
            dumped_to: None,
        };
    };

    match dumper.dump(batch).await {
        Ok(path) => {
            warn!(
                key = batch.key(),
                rows = batch.row_count(),
                path = %path.display(),
                "batch undeliverable, dumped to disk"
            );
            SendError::ClusterExhausted {
                tried,
                dumped_to: Some(path),
            }
        }
        Err(source) => {
            error!(
                error = %source,
                key = batch.key(),
                rows = batch.row_count(),
                bytes = batch.size_bytes(),
                "failed to dump undeliverable batch, data lost"
            );
            SendError::DumpFailed { tried, source }
        }
    }
}

/// Turn the outcome of `try_deliver` into the outcome of `deliver`. Any
/// failure, including one before an endpoint was tried, escalates the batch.
pub async fn dump_on_failure(
    dumper: Option<&FileDumper>,
    batch: &Batch,
    outcome: Result<(), SendError>,
) -> Result<(), SendError> {
    let tried = match outcome {
        Ok(()) => return Ok(()),
        Err(SendError::ClusterExhausted { tried, .. }) => tried,
        Err(e) => {
            error!(error = %e, key = batch.key(), "batch could not be prepared for sending");
            Vec::new()
        }
    };
    Err(escalate(dumper, batch, tried).await)
}

/// Counts one in-progress `deliver` call for as long as it lives.
pub struct PendingGuard<'a>(&'a AtomicUsize);

impl<'a> PendingGuard<'a> {
    pub fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
