//! The per-connection sequential worker.
//!
//! Exactly one named OS thread per connection drains a bounded job channel
//! in FIFO order.  Every operation that touches the backing store's cursor
//! (query advances, mutations, sessions) is submitted here, so the store is
//! accessed by one logical thread of control at a time.
//!
//! Completion results for query advances are posted as [`WorkerEvent`]
//! messages on the connection's event queue and applied by the coordinator's
//! pump; the worker thread never calls back into the coordinator.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, SyncSender, sync_channel};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use fetchmux_core::{ItemType, LockLevel, OrderedMutex, StoreError, StoreResult};

use crate::events::WorkerEvent;
use crate::store::BackingStore;

enum Job {
    /// Pull the next chunk of `ItemType` into the store cache and post the
    /// result to the event queue.
    Advance(ItemType),
    /// Arbitrary store operation; the submitter blocks on a reply channel
    /// inside the closure.
    Run(Box<dyn FnOnce(&dyn BackingStore) + Send>),
    Shutdown,
}

pub struct SequentialWorker {
    sender: SyncSender<Job>,
    handle: OrderedMutex<Option<JoinHandle<()>>>,
}

impl SequentialWorker {
    /// Spawn the worker thread for `store`, posting advance completions to
    /// `events`.
    #[must_use]
    pub fn spawn(
        store: Arc<dyn BackingStore>,
        events: Sender<WorkerEvent>,
        queue_capacity: usize,
    ) -> Self {
        let (tx, rx) = sync_channel(queue_capacity.max(1));
        let handle = std::thread::Builder::new()
            .name("fetchmux-worker".into())
            .spawn(move || drain_loop(&rx, &store, &events))
            .expect("failed to spawn fetchmux worker thread");
        Self {
            sender: tx,
            handle: OrderedMutex::new(LockLevel::WorkerHandle, Some(handle)),
        }
    }

    /// Queue a query advance.  Fire-and-forget: the completion arrives on the
    /// event queue.
    pub fn submit_advance(&self, item_type: ItemType) {
        if self.sender.send(Job::Advance(item_type)).is_err() {
            warn!("advance submitted after worker shutdown; dropped");
        }
    }

    /// Run `op` on the worker thread and block until it finishes, preserving
    /// submission order relative to queued advances.
    pub fn run_blocking<T, F>(&self, op: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn BackingStore) -> T + Send + 'static,
    {
        let (reply_tx, reply_rx) = sync_channel(1);
        let job = Job::Run(Box::new(move |store| {
            // Receiver gone means the submitter stopped waiting; nothing to do.
            let _ = reply_tx.send(op(store));
        }));
        self.sender
            .send(job)
            .map_err(|_| StoreError::ConnectionClosed)?;
        reply_rx.recv().map_err(|_| StoreError::ConnectionClosed)
    }

    /// Stop accepting work, drain what is queued, and join the thread.
    /// Idempotent.
    pub fn close(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = self.sender.send(Job::Shutdown);
            if handle.join().is_err() {
                warn!("fetchmux worker thread panicked during shutdown");
            }
        }
    }
}

impl Drop for SequentialWorker {
    fn drop(&mut self) {
        self.close();
    }
}

fn drain_loop(rx: &Receiver<Job>, store: &Arc<dyn BackingStore>, events: &Sender<WorkerEvent>) {
    debug!("fetchmux worker started");
    while let Ok(job) = rx.recv() {
        match job {
            Job::Advance(item_type) => {
                let result = store.advance_query(&item_type);
                // Receiver gone means the connection is shutting down.
                let _ = events.send(WorkerEvent::QueryAdvanced { item_type, result });
            }
            Job::Run(op) => op(store.as_ref()),
            Job::Shutdown => break,
        }
    }
    debug!("fetchmux worker stopped");
}
