//! Bounded-concurrency load queue
//!
//! At most `max_concurrent_loads` operations run at once and at most one
//! request per asset identity is registered at a time. Ready requests start
//! in priority order. An identity that failed repeatedly inside the failure
//! window is parked for the breaker delay before it may start.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::asset::BoxFuture;
use crate::core::CancelHandle;
use crate::core::config::QueueConfig;
use crate::core::error::LoadError;
use crate::core::timer::{Debouncer, DelayedTask};
use crate::render::monitor::MemoryPressure;
use crate::streaming::history::{HistoryTable, LoadHistory};
use crate::streaming::priority::PriorityQueue;

/// A deferred load. Receives the cancellation handle of its request.
pub type LoadOperation<T> =
    Box<dyn FnOnce(CancelHandle) -> BoxFuture<'static, Result<T, LoadError>> + Send + 'static>;

/// Lifecycle of a registered request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoadState {
    /// Parked by the per-identity breaker
    Delayed,
    Queued,
    Loading,
}

struct Entry<T> {
    generation: u64,
    state: LoadState,
    priority: f32,
    cancel: CancelHandle,
    op: Option<LoadOperation<T>>,
    result_tx: Option<oneshot::Sender<Result<T, LoadError>>>,
    delay: Option<DelayedTask>,
}

/// A load ready to be spawned, taken out under the lock
struct Start<T> {
    id: String,
    generation: u64,
    cancel: CancelHandle,
    op: LoadOperation<T>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    completed: u64,
    failed: u64,
    aborted: u64,
    delayed: u64,
}

struct QueueState<T> {
    entries: HashMap<String, Entry<T>>,
    ready: PriorityQueue<(String, u64)>,
    /// Generations currently executing
    active: HashSet<u64>,
    max_concurrent: usize,
    history: HistoryTable,
    next_generation: u64,
    counters: Counters,
}

impl<T> QueueState<T> {
    /// Pop ready requests while capacity allows, marking each attempt
    fn take_ready(&mut self, now: Instant) -> Vec<Start<T>> {
        let mut starts = Vec::new();
        while self.active.len() < self.max_concurrent {
            let Some((_, (id, generation))) = self.ready.pop() else {
                break;
            };
            let Some(entry) = self
                .entries
                .get_mut(&id)
                .filter(|e| e.generation == generation && e.state == LoadState::Queued)
            else {
                continue;
            };
            let Some(op) = entry.op.take() else {
                continue;
            };
            entry.state = LoadState::Loading;
            self.active.insert(generation);
            self.history.record_attempt(&id, now);
            log::debug!("Starting load '{}' ({}/{} active)", id, self.active.len(), self.max_concurrent);
            starts.push(Start {
                cancel: entry.cancel.clone(),
                id,
                generation,
                op,
            });
        }
        starts
    }
}

/// Snapshot of queue state
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub delayed: usize,
    pub active: usize,
    pub max_concurrent: usize,
    pub completed_total: u64,
    pub failed_total: u64,
    pub aborted_total: u64,
    pub delayed_total: u64,
    pub tracked_histories: usize,
}

struct QueueShared<T> {
    me: Weak<QueueShared<T>>,
    config: QueueConfig,
    state: Mutex<QueueState<T>>,
    drain: Debouncer,
}

impl<T: Send + 'static> QueueShared<T> {
    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn spawn_all(&self, starts: Vec<Start<T>>) {
        for start in starts {
            let me = self.me.clone();
            tokio::spawn(async move {
                let Start { id, generation, cancel, op } = start;
                let load = op(cancel.clone());
                let result = tokio::select! {
                    result = load => result,
                    _ = cancel.cancelled() => Err(LoadError::Aborted(id.clone())),
                };
                if let Some(shared) = me.upgrade() {
                    shared.complete(&id, generation, result);
                }
            });
        }
    }

    fn drain_now(&self) {
        let starts = self.lock().take_ready(Instant::now());
        self.spawn_all(starts);
    }

    fn promote(&self, id: &str, generation: u64) {
        let starts = {
            let mut state = self.lock();
            let Some(entry) = state
                .entries
                .get_mut(id)
                .filter(|e| e.generation == generation && e.state == LoadState::Delayed)
            else {
                return;
            };
            entry.state = LoadState::Queued;
            entry.delay = None;
            let priority = entry.priority;
            state.ready.push(priority, (id.to_string(), generation));
            log::debug!("Delayed load '{}' is ready", id);
            state.take_ready(Instant::now())
        };
        self.spawn_all(starts);
    }

    fn complete(&self, id: &str, generation: u64, result: Result<T, LoadError>) {
        {
            let mut state = self.lock();
            let was_active = state.active.remove(&generation);
            let current = state
                .entries
                .get(id)
                .is_some_and(|e| e.generation == generation);

            // An aborted request was already removed and answered
            if was_active && current {
                if let Some(mut entry) = state.entries.remove(id) {
                    match &result {
                        Ok(_) => {
                            state.history.record_success(id);
                            state.counters.completed += 1;
                        }
                        Err(LoadError::Aborted(_)) => state.counters.aborted += 1,
                        Err(err) => {
                            state.history.record_failure(id);
                            state.counters.failed += 1;
                            log::debug!("Load '{}' failed: {}", id, err);
                        }
                    }
                    if let Some(tx) = entry.result_tx.take() {
                        let _ = tx.send(result);
                    }
                }
            }
        }

        let me = self.me.clone();
        self.drain.schedule(move || {
            if let Some(shared) = me.upgrade() {
                shared.drain_now();
            }
        });
    }
}

/// Resolves with the outcome of a queued load
pub struct LoadHandle<T> {
    id: String,
    cancel: CancelHandle,
    rx: oneshot::Receiver<Result<T, LoadError>>,
}

impl<T> LoadHandle<T> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Handle that aborts this load's I/O when cancelled
    pub fn cancel_handle(&self) -> &CancelHandle {
        &self.cancel
    }
}

impl<T> Future for LoadHandle<T> {
    type Output = Result<T, LoadError>;

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

/// Priority load queue with a per-identity circuit breaker.
/// Clones share the same state.
pub struct LoadQueue<T> {
    shared: Arc<QueueShared<T>>,
}

impl<T> Clone for LoadQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> LoadQueue<T> {
    pub fn new(config: QueueConfig) -> Self {
        let shared = Arc::new_cyclic(|me| QueueShared {
            me: me.clone(),
            state: Mutex::new(QueueState {
                entries: HashMap::new(),
                ready: PriorityQueue::new(),
                active: HashSet::new(),
                max_concurrent: config.max_concurrent_loads,
                history: HistoryTable::new(&config),
                next_generation: 0,
                counters: Counters::default(),
            }),
            drain: Debouncer::new(config.drain_delay()),
            config,
        });
        Self { shared }
    }

    /// Register a load for `id`. Fails fast with `DuplicateInFlight` while
    /// another request for `id` is delayed, queued or loading.
    pub fn queue_load(
        &self,
        id: &str,
        priority: f32,
        op: LoadOperation<T>,
    ) -> Result<LoadHandle<T>, LoadError> {
        let shared = &self.shared;
        let (handle, starts) = {
            let mut state = shared.lock();
            if state.entries.contains_key(id) {
                return Err(LoadError::DuplicateInFlight(id.to_string()));
            }

            let now = Instant::now();
            state.history.prune(now);
            let generation = state.next_generation;
            state.next_generation += 1;
            let cancel = CancelHandle::new();
            let (tx, rx) = oneshot::channel();

            let mut entry = Entry {
                generation,
                state: LoadState::Queued,
                priority,
                cancel: cancel.clone(),
                op: Some(op),
                result_tx: Some(tx),
                delay: None,
            };

            if let Some(delay) = state.history.breaker_delay(id, now) {
                let failures = state.history.get(id).map_or(0, |h| h.failures);
                log::warn!("Load '{}' delayed {:?} after {} recent failures", id, delay, failures);
                let me = shared.me.clone();
                let delayed_id = id.to_string();
                entry.state = LoadState::Delayed;
                entry.delay = Some(DelayedTask::spawn(delay, move || {
                    if let Some(shared) = me.upgrade() {
                        shared.promote(&delayed_id, generation);
                    }
                }));
                state.counters.delayed += 1;
            } else {
                state.ready.push(priority, (id.to_string(), generation));
            }
            state.entries.insert(id.to_string(), entry);

            let handle = LoadHandle {
                id: id.to_string(),
                cancel,
                rx,
            };
            (handle, state.take_ready(now))
        };
        shared.spawn_all(starts);
        Ok(handle)
    }

    /// Cancel the request for `id` wherever it is. Its handle resolves
    /// `Aborted` and its load history is left untouched.
    pub fn abort(&self, id: &str) -> bool {
        let starts = {
            let mut state = self.shared.lock();
            let Some(mut entry) = state.entries.remove(id) else {
                return false;
            };
            entry.cancel.cancel();
            if let Some(mut delay) = entry.delay.take() {
                delay.cancel();
            }
            let generation = entry.generation;
            state.ready.remove_where(|(_, g)| *g == generation);
            state.active.remove(&generation);
            state.counters.aborted += 1;
            if let Some(tx) = entry.result_tx.take() {
                let _ = tx.send(Err(LoadError::Aborted(id.to_string())));
            }
            log::debug!("Aborted load '{}' ({:?})", id, entry.state);
            state.take_ready(Instant::now())
        };
        self.shared.spawn_all(starts);
        true
    }

    pub fn is_in_flight(&self, id: &str) -> bool {
        self.shared.lock().entries.contains_key(id)
    }

    pub fn load_state(&self, id: &str) -> Option<LoadState> {
        self.shared.lock().entries.get(id).map(|e| e.state)
    }

    pub fn history(&self, id: &str) -> Option<LoadHistory> {
        self.shared.lock().history.get(id)
    }

    pub fn max_concurrent(&self) -> usize {
        self.shared.lock().max_concurrent
    }

    /// Set concurrency within the configured bounds
    pub fn set_max_concurrent(&self, max: usize) -> usize {
        let config = &self.shared.config;
        let clamped = max.clamp(config.min_concurrent_loads, config.max_concurrent_loads);
        let starts = {
            let mut state = self.shared.lock();
            if state.max_concurrent != clamped {
                log::info!("Load concurrency {} -> {}", state.max_concurrent, clamped);
            }
            state.max_concurrent = clamped;
            state.take_ready(Instant::now())
        };
        self.shared.spawn_all(starts);
        clamped
    }

    /// Lower concurrency to the floor under high pressure, restore it under low
    pub fn apply_memory_pressure(&self, pressure: MemoryPressure) -> usize {
        match pressure {
            MemoryPressure::High => self.set_max_concurrent(self.shared.config.min_concurrent_loads),
            MemoryPressure::Low => self.set_max_concurrent(self.shared.config.max_concurrent_loads),
            MemoryPressure::Normal => self.max_concurrent(),
        }
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.shared.lock();
        let count = |s: LoadState| state.entries.values().filter(|e| e.state == s).count();
        QueueStats {
            queued: count(LoadState::Queued),
            delayed: count(LoadState::Delayed),
            active: state.active.len(),
            max_concurrent: state.max_concurrent,
            completed_total: state.counters.completed,
            failed_total: state.counters.failed,
            aborted_total: state.counters.aborted,
            delayed_total: state.counters.delayed,
            tracked_histories: state.history.len(),
        }
    }

    /// Abort everything and forget all histories
    pub fn reset(&self) {
        self.shared.drain.cancel();
        let mut state = self.shared.lock();
        for (id, mut entry) in state.entries.drain() {
            entry.cancel.cancel();
            if let Some(tx) = entry.result_tx.take() {
                let _ = tx.send(Err(LoadError::Aborted(id)));
            }
        }
        state.ready.clear();
        state.active.clear();
        state.history.clear();
        state.max_concurrent = self.shared.config.max_concurrent_loads;
        state.counters = Counters::default();
        log::info!("Load queue reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn sleeping_op(ms: u64, value: u32) -> LoadOperation<u32> {
        Box::new(move |_cancel| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(value)
            })
        })
    }

    fn failing_op() -> LoadOperation<u32> {
        Box::new(|_cancel| Box::pin(async { Err(LoadError::Decode("bad face".into())) }))
    }

    fn recording_op(log: Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> LoadOperation<u32> {
        Box::new(move |_cancel| {
            Box::pin(async move {
                log.lock().unwrap().push(name);
                Ok(0)
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let queue = LoadQueue::new(QueueConfig::default());
        let a = queue.queue_load("a", 1.0, sleeping_op(100, 1)).unwrap();
        let b = queue.queue_load("b", 1.0, sleeping_op(100, 2)).unwrap();
        let c = queue.queue_load("c", 1.0, sleeping_op(100, 3)).unwrap();

        let stats = queue.stats();
        assert_eq!(stats.active, 2);
        assert_eq!(stats.queued, 1);
        assert_eq!(queue.load_state("c"), Some(LoadState::Queued));

        assert_eq!(a.await, Ok(1));
        assert_eq!(b.await, Ok(2));
        assert_eq!(c.await, Ok(3));
        assert_eq!(queue.stats().completed_total, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_rejected_while_in_flight() {
        let queue = LoadQueue::new(QueueConfig::default());
        let first = queue.queue_load("fig", 1.0, sleeping_op(50, 1)).unwrap();
        let err = queue.queue_load("fig", 9.0, sleeping_op(50, 2)).err();
        assert_eq!(err, Some(LoadError::DuplicateInFlight("fig".into())));

        assert_eq!(first.await, Ok(1));
        assert!(queue.queue_load("fig", 1.0, sleeping_op(50, 3)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_requests_start_by_priority() {
        let queue = LoadQueue::new(QueueConfig {
            max_concurrent_loads: 1,
            ..Default::default()
        });
        let order = Arc::new(Mutex::new(Vec::new()));
        let blocker = queue.queue_load("blocker", 1.0, sleeping_op(100, 0)).unwrap();
        let handles: Vec<_> = [("low", 1.0), ("high", 5.0), ("mid", 3.0)]
            .into_iter()
            .map(|(name, p)| queue.queue_load(name, p, recording_op(order.clone(), name)).unwrap())
            .collect();

        blocker.await.unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["high", "mid", "low"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_failures_delay_next_attempt() {
        let queue = LoadQueue::new(QueueConfig::default());
        for _ in 0..3 {
            let result = queue.queue_load("x", 1.0, failing_op()).unwrap().await;
            assert!(matches!(result, Err(LoadError::Decode(_))));
        }
        assert_eq!(queue.history("x").unwrap().failures, 3);

        let queued_at = Instant::now();
        let started_at = Arc::new(Mutex::new(None));
        let started = started_at.clone();
        let handle = queue
            .queue_load(
                "x",
                1.0,
                Box::new(move |_cancel| {
                    Box::pin(async move {
                        *started.lock().unwrap() = Some(Instant::now());
                        Ok(7)
                    })
                }),
            )
            .unwrap();
        assert_eq!(queue.load_state("x"), Some(LoadState::Delayed));

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert!(started_at.lock().unwrap().is_none());

        assert_eq!(handle.await, Ok(7));
        let started = started_at.lock().unwrap().unwrap();
        assert!(started.duration_since(queued_at) >= Duration::from_secs(5));
        assert_eq!(queue.history("x").unwrap().failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_queued_allows_requeue() {
        let queue = LoadQueue::new(QueueConfig {
            max_concurrent_loads: 1,
            ..Default::default()
        });
        let _blocker = queue.queue_load("blocker", 1.0, sleeping_op(1_000, 0)).unwrap();
        let queued = queue.queue_load("c", 1.0, sleeping_op(10, 1)).unwrap();

        assert!(queue.abort("c"));
        assert_eq!(queued.await, Err(LoadError::Aborted("c".into())));
        assert!(queue.queue_load("c", 1.0, sleeping_op(10, 2)).is_ok());
        assert_eq!(queue.stats().queued, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_loading_cancels_io() {
        let queue: LoadQueue<u32> = LoadQueue::new(QueueConfig::default());
        let observed = Arc::new(AtomicBool::new(false));
        let flag = observed.clone();
        let handle = queue
            .queue_load(
                "slow",
                1.0,
                Box::new(move |cancel| {
                    Box::pin(async move {
                        cancel.cancelled().await;
                        flag.store(true, Ordering::SeqCst);
                        Err(LoadError::Aborted("slow".into()))
                    })
                }),
            )
            .unwrap();
        let cancel = handle.cancel_handle().clone();
        tokio::task::yield_now().await;
        assert_eq!(queue.stats().active, 1);

        assert!(queue.abort("slow"));
        assert!(cancel.is_cancelled());
        assert_eq!(queue.stats().active, 0);
        assert_eq!(handle.await, Err(LoadError::Aborted("slow".into())));
        assert_eq!(queue.history("slow").unwrap().failures, 0);
        assert!(!queue.abort("slow"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_pressure_adjusts_concurrency() {
        let queue: LoadQueue<u32> = LoadQueue::new(QueueConfig::default());
        assert_eq!(queue.apply_memory_pressure(MemoryPressure::High), 1);
        assert_eq!(queue.apply_memory_pressure(MemoryPressure::Normal), 1);
        assert_eq!(queue.apply_memory_pressure(MemoryPressure::Low), 2);
        assert_eq!(queue.set_max_concurrent(10), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_aborts_everything() {
        let queue = LoadQueue::new(QueueConfig::default());
        let a = queue.queue_load("a", 1.0, sleeping_op(1_000, 1)).unwrap();
        let _ = queue.queue_load("b", 1.0, failing_op()).unwrap().await;

        queue.reset();
        assert_eq!(a.await, Err(LoadError::Aborted("a".into())));
        assert_eq!(queue.stats(), QueueStats {
            max_concurrent: 2,
            ..Default::default()
        });
        assert!(queue.history("b").is_none());
    }
}
