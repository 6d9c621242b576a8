use std::time::Duration;

use thiserror::Error;
use tokio::time;
use tracing::{error, info};

use crate::collector::Collector;
use crate::dumper::FileDumper;
use crate::sender::{self, SendError, Sender};

/// How often the drain loop re-checks for quiescence after a wait round.
const SETTLE_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum DrainError {
    #[error("drain did not complete within {0:?}")]
    ShutdownTimeout(Duration),
}

/// Stop intake, flush every buffer and wait until both the collector and the
/// sender are idle.
///
/// If `timeout` elapses first, outstanding deliveries are aborted and every
/// row not yet delivered, buffered or in flight, goes to `dumper` instead.
/// `ShutdownTimeout` is returned either way and the caller exits non-zero.
pub async fn drain<S: Sender>(
    collector: &Collector<S>,
    dumper: Option<&FileDumper>,
    timeout: Duration,
) -> Result<(), DrainError> {
    collector.close();
    let flushed = collector.flush_all();
    info!(flushed, in_flight = collector.in_flight(), "draining");

    match time::timeout(timeout, settle(collector)).await {
        Ok(()) => {
            info!("drain complete");
            Ok(())
        }
        Err(_) => {
            let abandoned = collector.abandon();
            let batches = abandoned.len();
            let mut dumped = 0;
            for batch in &abandoned {
                let outcome = sender::escalate(dumper, batch, Vec::new()).await;
                if let SendError::ClusterExhausted { dumped_to: Some(_), .. } = outcome {
                    dumped += 1;
                }
            }
            error!(
                batches,
                dumped,
                lost = batches - dumped,
                dump_dir = ?dumper.map(FileDumper::path),
                "drain timed out, undelivered batches spilled"
            );
            Err(DrainError::ShutdownTimeout(timeout))
        }
    }
}

async fn settle<S: Sender>(collector: &Collector<S>) {
    loop {
        collector.wait_flush().await;
        if collector.is_idle() && collector.sender().is_empty() {
            return;
        }
        // Rows that raced in before close() or a delivery still unwinding.
        collector.flush_all();
        time::sleep(SETTLE_INTERVAL).await;
    }
}
