//! Background batching of item persistence.
//!
//! Publishing must never wait on storage, so the request path only
//! enqueues. A single worker drains the add and delete queues on a
//! timer, a bounded batch per tick. Failed writes go back to the tail of
//! their queue and are retried on a later tick, indefinitely; the
//! requester never hears about persistence trouble.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::backend::PubSubBackend;
use crate::node::PublishedItem;

struct Worker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Queues of item writes and deletes, drained periodically.
pub struct ItemBatcher {
    to_add: Mutex<VecDeque<PublishedItem>>,
    to_delete: Mutex<VecDeque<PublishedItem>>,
    backend: Arc<dyn PubSubBackend>,
    batch_size: usize,
    flush_interval: Mutex<Duration>,
    worker: Mutex<Option<Worker>>,
}

impl ItemBatcher {
    /// Create a batcher over the given backend.
    pub fn new(backend: Arc<dyn PubSubBackend>, flush_interval: Duration, batch_size: usize) -> Self {
        Self {
            to_add: Mutex::new(VecDeque::new()),
            to_delete: Mutex::new(VecDeque::new()),
            backend,
            batch_size,
            flush_interval: Mutex::new(flush_interval),
            worker: Mutex::new(None),
        }
    }

    /// Queue an item for durable storage.
    pub fn queue_add(&self, item: PublishedItem) {
        self.to_add.lock().expect("queue lock").push_back(item);
    }

    /// Queue an item for deletion from storage.
    ///
    /// When the item is still waiting in the add queue it never reached
    /// storage, so the pending add is cancelled instead.
    pub fn queue_remove(&self, item: PublishedItem) {
        let mut to_add = self.to_add.lock().expect("queue lock");
        if let Some(index) = to_add.iter().position(|queued| *queued == item) {
            to_add.remove(index);
            return;
        }
        drop(to_add);
        self.to_delete.lock().expect("queue lock").push_back(item);
    }

    /// Drop every queued operation for the given items, both directions.
    /// Used when a node disappears and its storage rows go with it.
    pub fn cancel_items(&self, items: &[PublishedItem]) {
        self.to_add
            .lock()
            .expect("queue lock")
            .retain(|queued| !items.contains(queued));
        self.to_delete
            .lock()
            .expect("queue lock")
            .retain(|queued| !items.contains(queued));
    }

    /// Number of adds waiting to be flushed.
    pub fn pending_adds(&self) -> usize {
        self.to_add.lock().expect("queue lock").len()
    }

    /// Number of deletes waiting to be flushed.
    pub fn pending_deletes(&self) -> usize {
        self.to_delete.lock().expect("queue lock").len()
    }

    fn drain_batch(queue: &Mutex<VecDeque<PublishedItem>>, batch_size: usize) -> Vec<PublishedItem> {
        let mut queue = queue.lock().expect("queue lock");
        let count = queue.len().min(batch_size);
        queue.drain(..count).collect()
    }

    /// Flush one batch from each queue, re-queueing failures.
    pub async fn flush(&self) {
        for item in Self::drain_batch(&self.to_delete, self.batch_size) {
            if !self.backend.remove_published_item(&item).await {
                warn!(node = %item.node_id, item = %item.id, "item delete failed, re-queueing");
                self.to_delete.lock().expect("queue lock").push_back(item);
            }
        }
        for item in Self::drain_batch(&self.to_add, self.batch_size) {
            if !self.backend.create_published_item(&item).await {
                warn!(node = %item.node_id, item = %item.id, "item write failed, re-queueing");
                self.to_add.lock().expect("queue lock").push_back(item);
            }
        }
    }

    /// Start (or restart) the periodic flush worker.
    pub fn spawn(self: &Arc<Self>) {
        let token = CancellationToken::new();
        let worker_token = token.clone();
        let batcher = Arc::clone(self);
        let period = *self.flush_interval.lock().expect("interval lock");

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick of a tokio interval fires immediately; skip
            // it so the first flush happens one full period after start.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => batcher.flush().await,
                    _ = worker_token.cancelled() => break,
                }
            }
            debug!("item batcher worker stopped");
        });

        let mut worker = self.worker.lock().expect("worker lock");
        if let Some(previous) = worker.take() {
            previous.token.cancel();
            previous.handle.abort();
        }
        *worker = Some(Worker { token, handle });
    }

    /// Change the flush period, rescheduling the running worker.
    pub fn set_flush_interval(self: &Arc<Self>, period: Duration) {
        {
            let mut interval = self.flush_interval.lock().expect("interval lock");
            if *interval == period {
                return;
            }
            *interval = period;
        }
        let running = self.worker.lock().expect("worker lock").is_some();
        if running {
            self.spawn();
        }
    }

    /// Stop the worker and drain both queues once, without retry.
    pub async fn shutdown(&self) {
        let worker = self.worker.lock().expect("worker lock").take();
        if let Some(worker) = worker {
            worker.token.cancel();
            if let Err(join_error) = worker.handle.await {
                if !join_error.is_cancelled() {
                    error!(error = %join_error, "item batcher worker failed");
                }
            }
        }

        let deletes: Vec<_> = self.to_delete.lock().expect("queue lock").drain(..).collect();
        for item in deletes {
            self.backend.remove_published_item(&item).await;
        }
        let adds: Vec<_> = self.to_add.lock().expect("queue lock").drain(..).collect();
        for item in adds {
            self.backend.create_published_item(&item).await;
        }
    }
}
