use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{Semaphore, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::batch::Batch;
use crate::config::Config;
use crate::sender::Sender;

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("invalid payload: {0}")]
    InvalidPayload(&'static str),

    #[error("collector is closed to new payloads")]
    Closed,
}

/// Rows accumulated for one key since its last flush.
pub struct PendingBuffer {
    rows: Vec<Bytes>,
    first_row_at: Option<SystemTime>,
    last_flush: Instant,
}

impl PendingBuffer {
    fn new(now: Instant) -> Self {
        Self {
            rows: Vec::new(),
            first_row_at: None,
            last_flush: now,
        }
    }

    fn push(&mut self, payload: Bytes) {
        if self.rows.is_empty() {
            self.first_row_at = Some(SystemTime::now());
        }
        self.rows.push(payload);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Move the accumulated rows out as a batch, leaving this buffer empty.
    /// Each set of rows can only be detached once.
    fn detach(&mut self, key: &str, now: Instant) -> Option<Batch> {
        self.last_flush = now;
        if self.rows.is_empty() {
            return None;
        }
        let rows = std::mem::take(&mut self.rows);
        let created_at = self.first_row_at.take().unwrap_or_else(SystemTime::now);
        Some(Batch::new(key, rows, created_at))
    }
}

/// Everything behind the single mutex, so adds and flush-detach on any key
/// are mutually exclusive and the in-flight count moves in the same critical
/// section as the rows it accounts for.
struct CollectorState {
    buffers: HashMap<String, PendingBuffer>,
    closed: bool,
    /// Detached batches whose delivery task has not finished, by delivery id.
    deliveries: HashMap<u64, Delivery>,
    next_delivery: u64,
}

struct Delivery {
    batch: Batch,
    task: Option<AbortHandle>,
}

fn lock_state(state: &Mutex<CollectorState>) -> MutexGuard<'_, CollectorState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Groups payloads by target query and hands full or aged buffers to a `Sender`.
///
/// State sits behind a `std::sync::Mutex` that is never held across `.await`.
/// Deliveries run on spawned tasks, so `add` never waits on I/O.
pub struct Collector<S: Sender> {
    state: Arc<Mutex<CollectorState>>,
    sender: Arc<S>,
    flush_count: usize,
    flush_interval: Duration,
    permits: Arc<Semaphore>,
    in_flight: Arc<watch::Sender<usize>>,
}

impl<S: Sender> Clone for Collector<S> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            sender: Arc::clone(&self.sender),
            flush_count: self.flush_count,
            flush_interval: self.flush_interval,
            permits: Arc::clone(&self.permits),
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

impl<S: Sender> Collector<S> {
    pub fn new(sender: Arc<S>, flush_count: usize, flush_interval: Duration, max_in_flight: usize) -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(CollectorState {
                buffers: HashMap::new(),
                closed: false,
                deliveries: HashMap::new(),
                next_delivery: 0,
            })),
            sender,
            flush_count: flush_count.max(1),
            flush_interval,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            in_flight: Arc::new(in_flight),
        }
    }

    pub fn from_config(sender: Arc<S>, config: &Config) -> Self {
        Self::new(
            sender,
            config.flush_count,
            config.flush_interval,
            config.max_in_flight,
        )
    }

    fn lock(&self) -> MutexGuard<'_, CollectorState> {
        lock_state(&self.state)
    }

    /// Append `payload` to the buffer for `key`; a buffer reaching the flush
    /// count is detached and delivered in the background.
    pub fn add(&self, key: &str, payload: Bytes) -> Result<(), CollectError> {
        self.add_rows(key, vec![payload])
    }

    /// Append all `rows` for `key` in one critical section. Either every row
    /// is buffered or none is. The buffer is detached each time it reaches
    /// the flush count, so one call may produce several batches.
    pub fn add_rows(&self, key: &str, rows: Vec<Bytes>) -> Result<(), CollectError> {
        if key.is_empty() {
            return Err(CollectError::InvalidPayload("empty key"));
        }
        if rows.is_empty() {
            return Err(CollectError::InvalidPayload("no rows"));
        }
        if rows.iter().any(Bytes::is_empty) {
            return Err(CollectError::InvalidPayload("empty payload"));
        }

        let deliveries = {
            let mut state = self.lock();
            if state.closed {
                return Err(CollectError::Closed);
            }
            let now = Instant::now();
            let buffer = state
                .buffers
                .entry(key.to_owned())
                .or_insert_with(|| PendingBuffer::new(now));
            let mut batches = Vec::new();
            for row in rows {
                buffer.push(row);
                if buffer.len() >= self.flush_count {
                    batches.extend(buffer.detach(key, now));
                }
            }
            self.register(&mut state, batches)
        };

        for (id, batch) in deliveries {
            debug!(key, rows = batch.row_count(), "flush count reached");
            self.spawn_delivery(id, batch);
        }
        Ok(())
    }

    /// Flush every non-empty buffer whose last flush is at least one interval old.
    /// Returns the number of batches handed to the sender.
    pub fn flush_expired(&self) -> usize {
        let interval = self.flush_interval;
        let batches = {
            let mut state = self.lock();
            let now = Instant::now();
            let batches = detach_where(&mut state, now, |buffer| {
                now.saturating_duration_since(buffer.last_flush) >= interval
            });
            // Idle keys are recreated lazily on their next add.
            state.buffers.retain(|_, buffer| {
                !buffer.is_empty() || now.saturating_duration_since(buffer.last_flush) < interval
            });
            self.register(&mut state, batches)
        };
        self.spawn_all(batches)
    }

    /// Flush every non-empty buffer regardless of count or age.
    pub fn flush_all(&self) -> usize {
        let batches = {
            let mut state = self.lock();
            let batches = detach_where(&mut state, Instant::now(), |_| true);
            self.register(&mut state, batches)
        };
        self.spawn_all(batches)
    }

    /// Record detached batches as in flight. Must run under the same lock
    /// that detached them.
    fn register(&self, state: &mut CollectorState, batches: Vec<Batch>) -> Vec<(u64, Batch)> {
        let registered = batches
            .into_iter()
            .map(|batch| {
                let id = state.next_delivery;
                state.next_delivery += 1;
                let delivery = Delivery {
                    batch: batch.clone(),
                    task: None,
                };
                state.deliveries.insert(id, delivery);
                (id, batch)
            })
            .collect();
        self.in_flight.send_replace(state.deliveries.len());
        registered
    }

    fn spawn_all(&self, batches: Vec<(u64, Batch)>) -> usize {
        let count = batches.len();
        for (id, batch) in batches {
            self.spawn_delivery(id, batch);
        }
        count
    }

    /// Deliver one registered batch on its own task. The task unregisters it
    /// when it finishes, is aborted, or panics.
    fn spawn_delivery(&self, id: u64, batch: Batch) {
        let sender = Arc::clone(&self.sender);
        let permits = Arc::clone(&self.permits);
        let in_flight = InFlight {
            id,
            state: Arc::clone(&self.state),
            count: Arc::clone(&self.in_flight),
        };

        let task = tokio::spawn(async move {
            let _permit = permits.acquire_owned().await.ok();
            if !in_flight.is_registered() {
                return;
            }
            let key = batch.key().to_owned();
            let rows = batch.row_count();
            if let Err(e) = sender.deliver(batch).await {
                error!(error = %e, key = %key, rows, "batch delivery failed");
            }
        });

        if let Some(delivery) = self.lock().deliveries.get_mut(&id) {
            delivery.task = Some(task.abort_handle());
        }
    }

    /// Run `flush_expired` every flush interval until cancelled.
    pub fn spawn_ticker(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let collector = self.clone();
        tokio::spawn(async move {
            let period = collector.flush_interval;
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let flushed = collector.flush_expired();
                        if flushed > 0 {
                            debug!(flushed, "flush interval elapsed");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }

    /// Wait until every batch handed to the sender so far has finished
    /// delivery (success or escalation to the dumper).
    pub async fn wait_flush(&self) {
        let mut rx = self.in_flight.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Reject further `add` calls.
    pub fn close(&self) {
        self.lock().closed = true;
    }

    /// Close, then take back every row not yet delivered: buffered rows and
    /// batches still held by delivery tasks. Those tasks are aborted, so each
    /// returned batch has exactly one owner, the caller.
    pub fn abandon(&self) -> Vec<Batch> {
        let mut state = self.lock();
        state.closed = true;
        let mut batches: Vec<Batch> = state
            .deliveries
            .drain()
            .map(|(_, delivery)| {
                if let Some(task) = delivery.task {
                    task.abort();
                }
                delivery.batch
            })
            .collect();
        batches.extend(detach_where(&mut state, Instant::now(), |_| true));
        self.in_flight.send_replace(0);
        batches.sort_by_key(Batch::created_at);
        batches
    }

    /// Number of keys holding buffered rows.
    pub fn len(&self) -> usize {
        self.lock().buffers.values().filter(|b| !b.is_empty()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Batches handed to the sender whose delivery has not finished.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// No buffered rows and no delivery in flight, observed at one instant.
    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.deliveries.is_empty() && state.buffers.values().all(PendingBuffer::is_empty)
    }

    pub fn sender(&self) -> &Arc<S> {
        &self.sender
    }
}

fn detach_where(
    state: &mut CollectorState,
    now: Instant,
    due: impl Fn(&PendingBuffer) -> bool,
) -> Vec<Batch> {
    let mut batches = Vec::new();
    for (key, buffer) in state.buffers.iter_mut() {
        if buffer.is_empty() || !due(buffer) {
            continue;
        }
        if let Some(batch) = buffer.detach(key, now) {
            batches.push(batch);
        }
    }
    batches
}

/// Unregisters a delivery when its task ends, including by abort or panic.
struct InFlight {
    id: u64,
    state: Arc<Mutex<CollectorState>>,
    count: Arc<watch::Sender<usize>>,
}

impl InFlight {
    /// False once the batch has been taken back by `Collector::abandon`.
    fn is_registered(&self) -> bool {
        lock_state(&self.state).deliveries.contains_key(&self.id)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut state = lock_state(&self.state);
        state.deliveries.remove(&self.id);
        self.count.send_replace(state.deliveries.len());
    }
}
