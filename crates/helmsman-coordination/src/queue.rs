//! WorkQueue — persistent at-least-once FIFO with leased consumption.
//!
//! Messages are appended with a monotonic sequence number and claimed by
//! workers under a per-message lease. A worker heartbeats its lease while
//! the handler runs; if the worker dies, the lease expires and the
//! message becomes claimable again. Successful handling acks (deletes)
//! the message, a failed handler leaves it for redelivery.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableTable, ReadableTableMetadata};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{CoordinationError, CoordinationResult};
use crate::tables::{QUEUE, QUEUE_LEASES, QUEUE_META};

macro_rules! map_err {
    ($variant:ident) => {
        |e| CoordinationError::$variant(e.to_string())
    };
}

const SEQ_KEY: &str = "next";

/// Result returned by a queue handler. `Err` leaves the message for
/// redelivery once its lease expires.
pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

type BoxFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// Handler invoked for each claimed message.
pub type QueueHandler = Arc<dyn Fn(Vec<u8>) -> BoxFuture + Send + Sync>;

/// Worker-pool tuning.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Per-message invisibility lease.
    pub lock: Duration,
    /// Sleep when the queue is empty.
    pub backoff: Duration,
    /// Sleep between consecutive messages on one worker.
    pub throttle: Duration,
    /// Number of worker tasks.
    pub threads: usize,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            lock: Duration::from_secs(60),
            backoff: Duration::from_millis(200),
            throttle: Duration::from_millis(200),
            threads: 1,
        }
    }
}

/// Persistent FIFO work queue sharing the coordination database.
#[derive(Clone)]
pub struct WorkQueue {
    db: Arc<Database>,
}

impl WorkQueue {
    pub(crate) fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Append a message; returns its sequence number.
    pub fn enqueue(&self, payload: &[u8]) -> CoordinationResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let seq;
        {
            let mut meta = txn.open_table(QUEUE_META).map_err(map_err!(Table))?;
            seq = meta
                .get(SEQ_KEY)
                .map_err(map_err!(Read))?
                .map(|g| g.value())
                .unwrap_or(0);
            meta.insert(SEQ_KEY, seq + 1).map_err(map_err!(Write))?;

            let mut queue = txn.open_table(QUEUE).map_err(map_err!(Table))?;
            queue.insert(seq, payload).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(seq, bytes = payload.len(), "message enqueued");
        Ok(seq)
    }

    /// Claim the oldest message without a live lease, leasing it for
    /// `lock`. Returns `None` when nothing is claimable.
    pub fn claim(&self, lock: Duration) -> CoordinationResult<Option<(u64, Vec<u8>)>> {
        let now = now_millis();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let claimed;
        {
            let queue = txn.open_table(QUEUE).map_err(map_err!(Table))?;
            let mut leases = txn.open_table(QUEUE_LEASES).map_err(map_err!(Table))?;

            let mut found = None;
            for entry in queue.iter().map_err(map_err!(Read))? {
                let (seq, payload) = entry.map_err(map_err!(Read))?;
                let seq = seq.value();
                let leased = leases
                    .get(seq)
                    .map_err(map_err!(Read))?
                    .map(|g| g.value() > now)
                    .unwrap_or(false);
                if !leased {
                    found = Some((seq, payload.value().to_vec()));
                    break;
                }
            }

            if let Some((seq, _)) = &found {
                let expiry = now + lock.as_millis() as u64;
                leases.insert(*seq, expiry).map_err(map_err!(Write))?;
            }
            claimed = found;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(claimed)
    }

    /// Extend the lease on a claimed message (heartbeat).
    pub fn extend(&self, seq: u64, lock: Duration) -> CoordinationResult<()> {
        let expiry = now_millis() + lock.as_millis() as u64;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut leases = txn.open_table(QUEUE_LEASES).map_err(map_err!(Table))?;
            leases.insert(seq, expiry).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Acknowledge (delete) a handled message. Returns true if it existed.
    pub fn ack(&self, seq: u64) -> CoordinationResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut queue = txn.open_table(QUEUE).map_err(map_err!(Table))?;
            existed = queue.remove(seq).map_err(map_err!(Write))?.is_some();
            let mut leases = txn.open_table(QUEUE_LEASES).map_err(map_err!(Table))?;
            leases.remove(seq).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(seq, "message acked");
        Ok(existed)
    }

    /// Number of messages currently persisted (leased or not).
    pub fn len(&self) -> CoordinationResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let queue = txn.open_table(QUEUE).map_err(map_err!(Table))?;
        queue.len().map_err(map_err!(Read))
    }

    pub fn is_empty(&self) -> CoordinationResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Spawn `options.threads` workers feeding claimed messages to
    /// `handler`. Workers stop when `shutdown` flips to true.
    pub fn consume(
        &self,
        handler: QueueHandler,
        options: ConsumerOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        info!(threads = options.threads, lock_ms = options.lock.as_millis() as u64, "queue workers starting");
        (0..options.threads.max(1))
            .map(|worker| {
                let queue = self.clone();
                let handler = Arc::clone(&handler);
                let options = options.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    run_worker(worker, queue, handler, options, shutdown).await;
                })
            })
            .collect()
    }
}

async fn run_worker(
    worker: usize,
    queue: WorkQueue,
    handler: QueueHandler,
    options: ConsumerOptions,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker, "queue worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        let claimed = match queue.claim(options.lock) {
            Ok(claimed) => claimed,
            Err(e) => {
                error!(worker, error = %e, "queue claim failed");
                None
            }
        };

        match claimed {
            Some((seq, payload)) => {
                // Heartbeat the lease at half-period while the handler runs.
                let heartbeat_queue = queue.clone();
                let lock = options.lock;
                let (stop_tx, mut stop_rx) = watch::channel(false);
                let heartbeat = tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = tokio::time::sleep(lock / 2) => {
                                if let Err(e) = heartbeat_queue.extend(seq, lock) {
                                    warn!(seq, error = %e, "lease heartbeat failed");
                                }
                            }
                            _ = stop_rx.changed() => break,
                        }
                    }
                });

                let result = handler(payload).await;
                let _ = stop_tx.send(true);
                let _ = heartbeat.await;

                match result {
                    Ok(()) => {
                        if let Err(e) = queue.ack(seq) {
                            error!(worker, seq, error = %e, "failed to ack message");
                        }
                    }
                    Err(e) => {
                        warn!(worker, seq, error = %e, "handler failed, message will be redelivered");
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(options.throttle) => {}
                    _ = shutdown.changed() => break,
                }
            }
            None => {
                tokio::select! {
                    _ = tokio::time::sleep(options.backoff) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
    }
    debug!(worker, "queue worker stopped");
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CoordinationStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_queue() -> WorkQueue {
        CoordinationStore::open_in_memory("helmsman").unwrap().queue()
    }

    #[test]
    fn enqueue_claim_ack_in_order() {
        let queue = test_queue();
        queue.enqueue(b"first").unwrap();
        queue.enqueue(b"second").unwrap();

        let (seq1, payload1) = queue.claim(Duration::from_secs(60)).unwrap().unwrap();
        assert_eq!(payload1, b"first");

        // The lease hides the first message; the second is next.
        let (seq2, payload2) = queue.claim(Duration::from_secs(60)).unwrap().unwrap();
        assert_eq!(payload2, b"second");
        assert!(seq2 > seq1);

        // Everything leased — nothing claimable.
        assert!(queue.claim(Duration::from_secs(60)).unwrap().is_none());

        assert!(queue.ack(seq1).unwrap());
        assert!(queue.ack(seq2).unwrap());
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn expired_lease_allows_redelivery() {
        let queue = test_queue();
        queue.enqueue(b"job").unwrap();

        let (seq, _) = queue.claim(Duration::from_millis(0)).unwrap().unwrap();
        // Zero-length lease: immediately claimable again.
        let (seq_again, payload) = queue.claim(Duration::from_secs(60)).unwrap().unwrap();
        assert_eq!(seq, seq_again);
        assert_eq!(payload, b"job");
    }

    #[test]
    fn extend_keeps_lease_alive() {
        let queue = test_queue();
        queue.enqueue(b"job").unwrap();

        let (seq, _) = queue.claim(Duration::from_millis(0)).unwrap().unwrap();
        queue.extend(seq, Duration::from_secs(60)).unwrap();
        assert!(queue.claim(Duration::from_secs(60)).unwrap().is_none());
    }

    #[test]
    fn ack_unknown_is_false() {
        let queue = test_queue();
        assert!(!queue.ack(42).unwrap());
    }

    #[tokio::test]
    async fn consume_handles_and_acks() {
        let queue = test_queue();
        queue.enqueue(b"one").unwrap();
        queue.enqueue(b"two").unwrap();

        let handled = Arc::new(AtomicUsize::new(0));
        let handled_in_handler = Arc::clone(&handled);
        let handler: QueueHandler = Arc::new(move |_payload| {
            let handled = Arc::clone(&handled_in_handler);
            Box::pin(async move {
                handled.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let options = ConsumerOptions {
            lock: Duration::from_secs(5),
            backoff: Duration::from_millis(10),
            throttle: Duration::from_millis(1),
            threads: 2,
        };
        let workers = queue.consume(handler, options, shutdown_rx);

        // Wait for both messages to drain.
        for _ in 0..200 {
            if queue.is_empty().unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(queue.is_empty().unwrap());
        assert_eq!(handled.load(Ordering::SeqCst), 2);

        let _ = shutdown_tx.send(true);
        for worker in workers {
            let _ = worker.await;
        }
    }

    #[tokio::test]
    async fn failed_handler_leaves_message() {
        let queue = test_queue();
        queue.enqueue(b"poison").unwrap();

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_in_handler = Arc::clone(&attempts);
        let handler: QueueHandler = Arc::new(move |_payload| {
            let attempts = Arc::clone(&attempts_in_handler);
            Box::pin(async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err("boom".into())
            })
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let options = ConsumerOptions {
            // Short lease so the failed message is redelivered quickly.
            lock: Duration::from_millis(20),
            backoff: Duration::from_millis(5),
            throttle: Duration::from_millis(1),
            threads: 1,
        };
        let workers = queue.consume(handler, options, shutdown_rx);

        for _ in 0..200 {
            if attempts.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Redelivered at least once, never acked.
        assert!(attempts.load(Ordering::SeqCst) >= 2);
        assert!(!queue.is_empty().unwrap());

        let _ = shutdown_tx.send(true);
        for worker in workers {
            let _ = worker.await;
        }
    }
}
