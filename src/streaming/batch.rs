//! Batch loader: pending list, periodic processor and retry policy
//!
//! Consumers add requests to a priority-sorted pending list. A periodic tick
//! takes up to `max_batch_size` of the highest-priority items, bounded by
//! `max_concurrent` executing items, and for each one acquires a rendering
//! context before handing the load to the [`LoadQueue`]. Retryable failures
//! go back to the pending list with decayed priority.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::asset::AssetLocator;
use crate::core::CancelHandle;
use crate::core::config::BatchConfig;
use crate::core::error::LoadError;
use crate::render::context::{CleanupFn, ContextLease, ContextManager};
use crate::streaming::load_queue::{LoadOperation, LoadQueue};

/// One request as seen by the operation factory
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub id: String,
    pub locator: AssetLocator,
    pub priority: f32,
    /// Retries already made
    pub attempts: u32,
}

/// Builds the load operation for an item; called again for every retry
pub type OperationFactory<T> = Arc<dyn Fn(&BatchItem) -> LoadOperation<T> + Send + Sync>;

/// Called with the item id when its context is reclaimed by the manager
pub type CleanupHook = Arc<dyn Fn(&str) + Send + Sync>;

/// A successful load together with the context it was admitted under.
/// Dropping the lease returns the context.
#[derive(Debug)]
pub struct BatchOutput<T> {
    pub value: T,
    pub lease: ContextLease,
    /// Total attempts including the successful one
    pub attempts: u32,
}

type Callback<T> = oneshot::Sender<Result<BatchOutput<T>, LoadError>>;

struct PendingItem<T> {
    item: BatchItem,
    callback: Callback<T>,
}

struct ActiveItem {
    generation: u64,
    cancel: CancelHandle,
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    processed: u64,
    succeeded: u64,
    failed: u64,
    retried: u64,
    removed: u64,
}

struct BatchState<T> {
    /// Highest priority first, ties in arrival order
    pending: Vec<PendingItem<T>>,
    active: HashMap<String, ActiveItem>,
    next_generation: u64,
    counters: Counters,
}

impl<T> BatchState<T> {
    fn insert_pending(&mut self, pending: PendingItem<T>) {
        let priority = pending.item.priority;
        let index = self
            .pending
            .iter()
            .position(|p| p.item.priority < priority)
            .unwrap_or(self.pending.len());
        self.pending.insert(index, pending);
    }

    fn remove_pending(&mut self, id: &str) -> Option<PendingItem<T>> {
        let index = self.pending.iter().position(|p| p.item.id == id)?;
        Some(self.pending.remove(index))
    }
}

/// Snapshot of batch loader state
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchStats {
    pub pending: usize,
    pub active: usize,
    pub max_batch_size: usize,
    pub max_concurrent: usize,
    pub processed_total: u64,
    pub succeeded_total: u64,
    pub failed_total: u64,
    pub retried_total: u64,
    pub removed_total: u64,
}

/// Resolves when a batched request finishes for good
pub struct BatchTicket<T> {
    id: String,
    rx: oneshot::Receiver<Result<BatchOutput<T>, LoadError>>,
}

impl<T> BatchTicket<T> {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl<T> Future for BatchTicket<T> {
    type Output = Result<BatchOutput<T>, LoadError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(result) => {
                Poll::Ready(result.unwrap_or_else(|_| Err(LoadError::Aborted(this.id.clone()))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

struct BatchShared<T> {
    me: Weak<BatchShared<T>>,
    config: BatchConfig,
    contexts: ContextManager,
    queue: LoadQueue<T>,
    factory: OperationFactory<T>,
    cleanup: Option<CleanupHook>,
    state: Mutex<BatchState<T>>,
    processor: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> BatchShared<T> {
    fn lock(&self) -> MutexGuard<'_, BatchState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Acquire a context, then run the load. The lease comes back only on
    /// success; every other path drops it before returning.
    async fn attempt(&self, item: &BatchItem, cancel: &CancelHandle) -> Result<(T, ContextLease), LoadError> {
        let on_cleanup = self.cleanup.clone().map(|hook| {
            let id = item.id.clone();
            Box::new(move || hook(&id)) as CleanupFn
        });
        let admission = self
            .contexts
            .request_context(&item.id, item.priority, on_cleanup)?;
        let mut lease = tokio::select! {
            lease = admission.into_lease() => lease?,
            _ = cancel.cancelled() => return Err(LoadError::Aborted(item.id.clone())),
        };

        let handle = self
            .queue
            .queue_load(&item.id, item.priority, (self.factory)(item))?;
        let result = tokio::select! {
            result = handle => result,
            lost = lease.revoked() => {
                self.queue.abort(&item.id);
                Err(lost)
            }
            _ = cancel.cancelled() => {
                self.queue.abort(&item.id);
                Err(LoadError::Aborted(item.id.clone()))
            }
        };
        result.map(|value| (value, lease))
    }

    async fn execute(self: Arc<Self>, mut item: BatchItem, callback: Callback<T>, generation: u64, cancel: CancelHandle) {
        let result = self.attempt(&item, &cancel).await;

        let mut state = self.lock();
        let still_active = state
            .active
            .get(&item.id)
            .is_some_and(|a| a.generation == generation);
        if still_active {
            state.active.remove(&item.id);
        }

        match result {
            Ok((value, lease)) => {
                state.counters.succeeded += 1;
                drop(state);
                let output = BatchOutput {
                    value,
                    lease,
                    attempts: item.attempts + 1,
                };
                // A consumer that went away drops the output, releasing the lease
                let _ = callback.send(Ok(output));
            }
            Err(err)
                if still_active
                    && !cancel.is_cancelled()
                    && err.is_retryable()
                    && item.attempts < self.config.retry_attempts =>
            {
                item.attempts += 1;
                item.priority -= self.config.priority_decay;
                state.counters.retried += 1;
                log::info!(
                    "Retrying '{}' after {} (attempt {}, priority {:.2})",
                    item.id,
                    err.kind(),
                    item.attempts + 1,
                    item.priority
                );
                state.insert_pending(PendingItem { item, callback });
            }
            Err(err) => {
                let err = if cancel.is_cancelled() {
                    LoadError::Aborted(item.id.clone())
                } else {
                    err
                };
                if !err.is_control_state() {
                    state.counters.failed += 1;
                    log::warn!(
                        "Load '{}' failed after {} attempts: {}",
                        item.id,
                        item.attempts + 1,
                        err
                    );
                }
                drop(state);
                let _ = callback.send(Err(err));
            }
        }
    }

    fn process_tick(&self) -> usize {
        let mut starts = Vec::new();
        {
            let mut state = self.lock();
            let capacity = self.config.max_concurrent.saturating_sub(state.active.len());
            let budget = self.config.max_batch_size.min(capacity);

            let mut index = 0;
            while starts.len() < budget && index < state.pending.len() {
                // Items whose id is still executing wait for a later tick
                if state.active.contains_key(&state.pending[index].item.id) {
                    index += 1;
                    continue;
                }
                let pending = state.pending.remove(index);
                let generation = state.next_generation;
                state.next_generation += 1;
                let cancel = CancelHandle::new();
                state.active.insert(
                    pending.item.id.clone(),
                    ActiveItem {
                        generation,
                        cancel: cancel.clone(),
                    },
                );
                state.counters.processed += 1;
                starts.push((pending, generation, cancel));
            }
        }

        let started = starts.len();
        if started > 0 {
            log::debug!("Batch tick started {} items", started);
        }
        let Some(shared) = self.me.upgrade() else {
            return 0;
        };
        for (pending, generation, cancel) in starts {
            let shared = shared.clone();
            tokio::spawn(shared.execute(pending.item, pending.callback, generation, cancel));
        }
        started
    }
}

/// Aggregates load requests into bounded batches. Clones share the same state.
pub struct BatchLoader<T> {
    shared: Arc<BatchShared<T>>,
}

impl<T> Clone for BatchLoader<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> BatchLoader<T> {
    pub fn new(
        config: BatchConfig,
        contexts: ContextManager,
        queue: LoadQueue<T>,
        factory: OperationFactory<T>,
    ) -> Self {
        Self::with_cleanup(config, contexts, queue, factory, None)
    }

    /// Like [`new`](Self::new), with a hook run when a granted context is
    /// reclaimed from an item
    pub fn with_cleanup(
        config: BatchConfig,
        contexts: ContextManager,
        queue: LoadQueue<T>,
        factory: OperationFactory<T>,
        cleanup: Option<CleanupHook>,
    ) -> Self {
        let shared = Arc::new_cyclic(|me| BatchShared {
            me: me.clone(),
            config,
            contexts,
            queue,
            factory,
            cleanup,
            state: Mutex::new(BatchState {
                pending: Vec::new(),
                active: HashMap::new(),
                next_generation: 0,
                counters: Counters::default(),
            }),
            processor: Mutex::new(None),
        });
        Self { shared }
    }

    /// Add a request, replacing any pending request with the same id. The
    /// replaced request's ticket resolves `Aborted`.
    pub fn add_to_batch(&self, id: &str, locator: AssetLocator, priority: f32) -> BatchTicket<T> {
        let (tx, rx) = oneshot::channel();
        let replaced = {
            let mut state = self.shared.lock();
            let replaced = state.remove_pending(id);
            state.insert_pending(PendingItem {
                item: BatchItem {
                    id: id.to_string(),
                    locator,
                    priority,
                    attempts: 0,
                },
                callback: tx,
            });
            replaced
        };
        if let Some(replaced) = replaced {
            log::debug!("Replaced pending request '{}'", id);
            let _ = replaced.callback.send(Err(LoadError::Aborted(id.to_string())));
        }
        BatchTicket {
            id: id.to_string(),
            rx,
        }
    }

    /// Remove `id` from the pending list and cancel it if executing
    pub fn remove_from_batch(&self, id: &str) -> bool {
        let (pending, active) = {
            let mut state = self.shared.lock();
            let pending = state.remove_pending(id);
            let active = state.active.remove(id);
            if pending.is_some() || active.is_some() {
                state.counters.removed += 1;
            }
            (pending, active)
        };
        if let Some(pending) = &pending {
            log::debug!("Removed pending request '{}'", pending.item.id);
        }
        let found = pending.is_some() || active.is_some();
        if let Some(pending) = pending {
            let _ = pending.callback.send(Err(LoadError::Aborted(id.to_string())));
        }
        if let Some(active) = active {
            active.cancel.cancel();
        }
        found
    }

    /// Start up to one batch of pending items. Returns how many started.
    pub fn process_tick(&self) -> usize {
        self.shared.process_tick()
    }

    /// Run `process_tick` on the configured interval until stopped
    pub fn spawn_processor(&self) {
        let mut processor = self.shared.processor.lock().unwrap_or_else(|e| e.into_inner());
        if processor.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let me = self.shared.me.clone();
        let period = self.shared.config.process_interval();
        *processor = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(shared) = me.upgrade() else {
                    break;
                };
                shared.process_tick();
            }
        }));
        log::debug!("Batch processor started ({:?} interval)", period);
    }

    pub fn stop_processor(&self) {
        let mut processor = self.shared.processor.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = processor.take() {
            handle.abort();
        }
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.shared.lock().pending.iter().any(|p| p.item.id == id)
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.shared.lock().active.contains_key(id)
    }

    /// Pending ids with their current priority, in processing order
    pub fn pending_items(&self) -> Vec<(String, f32)> {
        self.shared
            .lock()
            .pending
            .iter()
            .map(|p| (p.item.id.clone(), p.item.priority))
            .collect()
    }

    pub fn stats(&self) -> BatchStats {
        let state = self.shared.lock();
        BatchStats {
            pending: state.pending.len(),
            active: state.active.len(),
            max_batch_size: self.shared.config.max_batch_size,
            max_concurrent: self.shared.config.max_concurrent,
            processed_total: state.counters.processed,
            succeeded_total: state.counters.succeeded,
            failed_total: state.counters.failed,
            retried_total: state.counters.retried,
            removed_total: state.counters.removed,
        }
    }

    /// Abort every pending and executing request
    pub fn reset(&self) {
        let (pending, active) = {
            let mut state = self.shared.lock();
            let pending = std::mem::take(&mut state.pending);
            let active: Vec<_> = state.active.drain().map(|(_, a)| a).collect();
            state.counters = Counters::default();
            (pending, active)
        };
        for p in pending {
            let _ = p.callback.send(Err(LoadError::Aborted(p.item.id)));
        }
        for a in active {
            a.cancel.cancel();
        }
        log::info!("Batch loader reset");
    }
}

impl<T> Drop for BatchShared<T> {
    fn drop(&mut self) {
        if let Some(handle) = self
            .processor
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}
