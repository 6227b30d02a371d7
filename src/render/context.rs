//! Rendering context admission
//!
//! Tracks active GPU rendering contexts against a dynamic ceiling. Requests
//! are granted immediately when a slot is free, otherwise queued by priority
//! (ties keep arrival order) and granted as slots come back. A circuit breaker
//! stops context creation after creation storms or reported creation errors.
//!
//! All bookkeeping happens inside one synchronous critical section per call,
//! so "is a slot free, then take it" can never interleave with another
//! request. Callbacks, grant deliveries and lease drops run after the lock is
//! released.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::core::config::ContextConfig;
use crate::core::error::LoadError;
use crate::core::timer::DelayedTask;
use crate::render::monitor::MemoryPressure;
use crate::streaming::priority::PriorityQueue;

/// Invoked when the manager reclaims a slot from its holder (eviction,
/// context loss or reset). Not invoked on a normal release.
pub type CleanupFn = Box<dyn FnOnce() + Send + 'static>;

/// Why the circuit breaker opened
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum BreakerTrip {
    CreationRate,
    CreationError,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotState {
    Active,
    /// Released by its holder, still counted until the cooldown ends
    Cooling,
}

struct Slot {
    id: String,
    token: u64,
    priority: f32,
    created_at: Instant,
    state: SlotState,
    on_cleanup: Option<CleanupFn>,
    revoke: Option<oneshot::Sender<()>>,
}

type GrantSender = oneshot::Sender<Result<ContextLease, LoadError>>;

struct Waiter {
    id: String,
    enqueued_at: Instant,
    on_cleanup: Option<CleanupFn>,
    grant: GrantSender,
}

#[derive(Clone, Copy, Debug, Default)]
struct Counters {
    granted: u64,
    queued: u64,
    rejected: u64,
    expired: u64,
    evicted: u64,
    lost: u64,
    breaker_trips: u64,
}

/// Work deferred until the state lock is dropped
#[derive(Default)]
struct Effects {
    grants: Vec<(GrantSender, Result<ContextLease, LoadError>)>,
    cleanups: Vec<CleanupFn>,
}

impl Effects {
    fn run(self) {
        for (tx, result) in self.grants {
            // An undeliverable lease is dropped here, which releases its slot
            let _ = tx.send(result);
        }
        for cleanup in self.cleanups {
            cleanup();
        }
    }
}

struct AdmissionState {
    config: ContextConfig,
    slots: Vec<Slot>,
    waiting: PriorityQueue<Waiter>,
    max_contexts: usize,
    creations: VecDeque<Instant>,
    breaker_until: Option<Instant>,
    breaker_reason: Option<BreakerTrip>,
    last_creation_error: Option<Instant>,
    next_token: u64,
    counters: Counters,
}

impl AdmissionState {
    fn new(config: ContextConfig) -> Self {
        Self {
            max_contexts: config.initial_max_contexts,
            config,
            slots: Vec::new(),
            waiting: PriorityQueue::new(),
            creations: VecDeque::new(),
            breaker_until: None,
            breaker_reason: None,
            last_creation_error: None,
            next_token: 0,
            counters: Counters::default(),
        }
    }

    /// Whether `id` holds an active slot or is waiting for one
    fn holds(&self, id: &str) -> bool {
        self.slots.iter().any(|s| s.id == id && s.state == SlotState::Active)
            || self.waiting.iter().any(|w| w.id == id)
    }

    /// Remaining open time, closing the breaker once it has elapsed
    fn breaker_remaining(&mut self, now: Instant) -> Option<Duration> {
        let until = self.breaker_until?;
        if now < until {
            return Some(until - now);
        }
        self.breaker_until = None;
        self.breaker_reason = None;
        log::info!("Context circuit breaker closed");
        None
    }

    fn rate_limited(&self, now: Instant) -> bool {
        self.last_creation_error
            .is_some_and(|t| now.duration_since(t) < self.config.error_rate_limit())
    }

    fn can_create(&mut self, now: Instant) -> bool {
        self.slots.len() < self.max_contexts
            && self.breaker_remaining(now).is_none()
            && !self.rate_limited(now)
    }

    fn trip(&mut self, now: Instant, cooldown: Duration, reason: BreakerTrip) {
        let until = now + cooldown;
        self.breaker_until = Some(self.breaker_until.map_or(until, |t| t.max(until)));
        self.breaker_reason = Some(reason);
        self.counters.breaker_trips += 1;
        log::warn!("Context circuit breaker opened ({:?}) for {:?}", reason, cooldown);
    }

    fn prune_creations(&mut self, now: Instant) {
        let window = self.config.creation_window();
        while self.creations.front().is_some_and(|t| now.duration_since(*t) >= window) {
            self.creations.pop_front();
        }
    }

    fn record_creation(&mut self, now: Instant) {
        self.creations.push_back(now);
        self.prune_creations(now);
        if self.creations.len() > self.config.max_creations_per_window {
            let cooldown = self.config.rate_trip_cooldown();
            self.trip(now, cooldown, BreakerTrip::CreationRate);
        }
    }

    fn grant(
        &mut self,
        manager: &Weak<ContextShared>,
        id: String,
        priority: f32,
        on_cleanup: Option<CleanupFn>,
        now: Instant,
    ) -> ContextLease {
        let token = self.next_token;
        self.next_token += 1;
        let (revoke_tx, revoke_rx) = oneshot::channel();
        self.slots.push(Slot {
            id: id.clone(),
            token,
            priority,
            created_at: now,
            state: SlotState::Active,
            on_cleanup,
            revoke: Some(revoke_tx),
        });
        debug_assert!(self.slots.len() <= self.max_contexts);
        self.counters.granted += 1;
        self.record_creation(now);
        log::debug!(
            "Granted context to '{}' (priority {:.2}, {}/{} in use)",
            id,
            priority,
            self.slots.len(),
            self.max_contexts
        );

        ContextLease {
            id,
            token,
            manager: manager.clone(),
            revoked: Some(revoke_rx),
            lost: false,
            released: false,
        }
    }

    /// Fail waiters that timed out and drop those whose caller went away
    fn expire_waiting(&mut self, now: Instant, effects: &mut Effects) {
        let timeout = self.config.queue_timeout();
        let expired = self
            .waiting
            .remove_where(|w| w.grant.is_closed() || now.duration_since(w.enqueued_at) >= timeout);
        for waiter in expired {
            if waiter.grant.is_closed() {
                continue;
            }
            self.counters.expired += 1;
            log::debug!("Context request '{}' expired after {:?}", waiter.id, timeout);
            effects
                .grants
                .push((waiter.grant, Err(LoadError::ContextExhausted(waiter.id))));
        }
    }

    /// Grant waiting requests in priority order while slots are available
    fn drain(&mut self, manager: &Weak<ContextShared>, now: Instant, effects: &mut Effects) {
        self.expire_waiting(now, effects);
        while !self.waiting.is_empty() && self.can_create(now) {
            let Some((priority, waiter)) = self.waiting.pop() else {
                break;
            };
            if waiter.grant.is_closed() {
                continue;
            }
            let lease = self.grant(manager, waiter.id, priority, waiter.on_cleanup, now);
            effects.grants.push((waiter.grant, Ok(lease)));
        }
    }

    /// Move the matching active slot into cooldown and return its token
    fn begin_release(&mut self, matches: impl Fn(&Slot) -> bool) -> Option<u64> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.state == SlotState::Active && matches(s))?;
        slot.state = SlotState::Cooling;
        slot.on_cleanup = None;
        slot.revoke = None;
        log::debug!("Released context '{}', cooling down", slot.id);
        Some(slot.token)
    }

    /// Take a slot away from its holder
    fn reclaim(&mut self, index: usize, effects: &mut Effects) -> Slot {
        let mut slot = self.slots.remove(index);
        if let Some(revoke) = slot.revoke.take() {
            let _ = revoke.send(());
        }
        if let Some(cleanup) = slot.on_cleanup.take() {
            effects.cleanups.push(cleanup);
        }
        slot
    }

    fn set_max_contexts(
        &mut self,
        max: usize,
        manager: &Weak<ContextShared>,
        now: Instant,
        effects: &mut Effects,
    ) -> usize {
        let clamped = max.clamp(self.config.min_contexts, self.config.hard_max_contexts);
        let previous = self.max_contexts;
        self.max_contexts = clamped;
        if clamped != previous {
            log::info!("Context ceiling {} -> {}", previous, clamped);
        }

        // Cooling slots go first, then the lowest priority, newest first
        while self.slots.len() > clamped {
            let victim = self
                .slots
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    (a.state == SlotState::Active)
                        .cmp(&(b.state == SlotState::Active))
                        .then(a.priority.total_cmp(&b.priority))
                        .then(b.created_at.cmp(&a.created_at))
                })
                .map(|(i, _)| i);
            let Some(index) = victim else {
                break;
            };
            let slot = self.reclaim(index, effects);
            if slot.state == SlotState::Active {
                self.counters.evicted += 1;
                log::warn!("Evicted context '{}' (priority {:.2})", slot.id, slot.priority);
            }
        }

        if clamped > previous {
            self.drain(manager, now, effects);
        }
        clamped
    }

    /// Next instant at which waiting requests may be granted or expire
    fn next_wake(&self, now: Instant) -> Option<Instant> {
        if self.waiting.is_empty() {
            return None;
        }
        let timeout = self.config.queue_timeout();
        let expiry = self.waiting.iter().map(|w| w.enqueued_at + timeout).min();
        let unblock = if self.slots.len() < self.max_contexts {
            let rate_limit_end = self
                .last_creation_error
                .map(|t| t + self.config.error_rate_limit());
            [self.breaker_until, rate_limit_end]
                .into_iter()
                .flatten()
                .filter(|t| *t > now)
                .max()
        } else {
            None
        };
        match (expiry, unblock) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn stats(&mut self, now: Instant) -> ContextStats {
        self.prune_creations(now);
        let breaker_remaining = self.breaker_remaining(now);
        let cooling = self
            .slots
            .iter()
            .filter(|s| s.state == SlotState::Cooling)
            .count();
        ContextStats {
            active: self.slots.len(),
            cooling,
            max_contexts: self.max_contexts,
            hard_max_contexts: self.config.hard_max_contexts,
            waiting: self.waiting.len(),
            breaker_open: breaker_remaining.is_some(),
            breaker_reason: self.breaker_reason,
            breaker_retry_after_ms: breaker_remaining.map_or(0, |d| d.as_millis() as u64),
            rate_limited: self.rate_limited(now),
            creations_in_window: self.creations.len(),
            granted_total: self.counters.granted,
            queued_total: self.counters.queued,
            rejected_total: self.counters.rejected,
            expired_total: self.counters.expired,
            evicted_total: self.counters.evicted,
            lost_total: self.counters.lost,
            breaker_trips: self.counters.breaker_trips,
        }
    }
}

/// Snapshot of admission state
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ContextStats {
    /// Slots counted against the ceiling, including cooling ones
    pub active: usize,
    pub cooling: usize,
    pub max_contexts: usize,
    pub hard_max_contexts: usize,
    pub waiting: usize,
    pub breaker_open: bool,
    pub breaker_reason: Option<BreakerTrip>,
    pub breaker_retry_after_ms: u64,
    pub rate_limited: bool,
    pub creations_in_window: usize,
    pub granted_total: u64,
    pub queued_total: u64,
    pub rejected_total: u64,
    pub expired_total: u64,
    pub evicted_total: u64,
    pub lost_total: u64,
    pub breaker_trips: u64,
}

struct ContextShared {
    me: Weak<ContextShared>,
    config: ContextConfig,
    state: Mutex<AdmissionState>,
    wake: Mutex<Option<DelayedTask>>,
}

impl ContextShared {
    fn lock(&self) -> MutexGuard<'_, AdmissionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run one critical section, then reschedule the wake timer and apply
    /// deferred effects outside the lock
    fn with_state<R>(&self, f: impl FnOnce(&mut AdmissionState, Instant, &mut Effects) -> R) -> R {
        let now = Instant::now();
        let mut effects = Effects::default();
        let (result, wake) = {
            let mut state = self.lock();
            let result = f(&mut state, now, &mut effects);
            (result, state.next_wake(now))
        };
        self.schedule_wake(wake);
        effects.run();
        result
    }

    fn schedule_wake(&self, at: Option<Instant>) {
        let mut wake = self.wake.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mut task) = wake.take() {
            task.cancel();
        }
        let Some(at) = at else {
            return;
        };
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let me = self.me.clone();
        *wake = Some(DelayedTask::spawn(at.saturating_duration_since(Instant::now()), move || {
            if let Some(shared) = me.upgrade() {
                shared.drain();
            }
        }));
    }

    fn drain(&self) {
        self.with_state(|state, now, effects| state.drain(&self.me, now, effects));
    }

    fn release_where(&self, matches: impl Fn(&Slot) -> bool) -> bool {
        let token = self.with_state(|state, _, _| state.begin_release(matches));
        match token {
            Some(token) => {
                self.schedule_cooldown(token);
                true
            }
            None => false,
        }
    }

    fn schedule_cooldown(&self, token: u64) {
        let cooldown = self.config.release_cooldown();
        if cooldown.is_zero() || tokio::runtime::Handle::try_current().is_err() {
            self.finish_release(token);
            return;
        }
        let me = self.me.clone();
        DelayedTask::spawn(cooldown, move || {
            if let Some(shared) = me.upgrade() {
                shared.finish_release(token);
            }
        })
        .detach();
    }

    fn finish_release(&self, token: u64) {
        self.with_state(|state, now, effects| {
            // The slot may already be gone after an eviction or reset
            if let Some(index) = state.slots.iter().position(|s| s.token == token) {
                state.slots.remove(index);
            }
            state.drain(&self.me, now, effects);
        });
    }
}

/// Outcome of an admission request
pub enum Admission {
    Granted(ContextLease),
    Queued(AdmissionTicket),
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted(_))
    }

    /// Wait for the lease, resolving immediately if already granted
    pub async fn into_lease(self) -> Result<ContextLease, LoadError> {
        match self {
            Admission::Granted(lease) => Ok(lease),
            Admission::Queued(ticket) => ticket.granted().await,
        }
    }
}

/// A queued admission request. Dropping it withdraws the request.
pub struct AdmissionTicket {
    id: String,
    rx: oneshot::Receiver<Result<ContextLease, LoadError>>,
}

impl AdmissionTicket {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait until the request is granted, expired or aborted
    pub async fn granted(self) -> Result<ContextLease, LoadError> {
        let Self { id, rx } = self;
        rx.await.unwrap_or_else(|_| Err(LoadError::Aborted(id)))
    }
}

/// An admitted rendering context. The slot is released when the lease is
/// released or dropped.
pub struct ContextLease {
    id: String,
    token: u64,
    manager: Weak<ContextShared>,
    revoked: Option<oneshot::Receiver<()>>,
    lost: bool,
    released: bool,
}

impl ContextLease {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Resolves with `ContextLost` if the manager takes the slot back.
    /// Never resolves for a lease that keeps its slot.
    pub async fn revoked(&mut self) -> LoadError {
        if !self.lost {
            match self.revoked.as_mut() {
                Some(rx) => {
                    let signal = rx.await;
                    self.revoked = None;
                    match signal {
                        Ok(()) => self.lost = true,
                        Err(_) => std::future::pending::<()>().await,
                    }
                }
                None => std::future::pending::<()>().await,
            }
        }
        LoadError::ContextLost(self.id.clone())
    }

    pub fn is_revoked(&mut self) -> bool {
        if !self.lost
            && let Some(rx) = self.revoked.as_mut()
            && rx.try_recv().is_ok()
        {
            self.lost = true;
            self.revoked = None;
        }
        self.lost
    }

    /// Return the slot; it frees after the release cooldown
    pub fn release(mut self) {
        self.release_slot();
    }

    fn release_slot(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        if let Some(shared) = self.manager.upgrade() {
            let token = self.token;
            shared.release_where(|s| s.token == token);
        }
    }
}

impl Drop for ContextLease {
    fn drop(&mut self) {
        self.release_slot();
    }
}

impl std::fmt::Debug for ContextLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextLease")
            .field("id", &self.id)
            .field("token", &self.token)
            .field("lost", &self.lost)
            .finish()
    }
}

/// Admission manager for rendering contexts. Clones share the same state.
#[derive(Clone)]
pub struct ContextManager {
    shared: Arc<ContextShared>,
}

impl ContextManager {
    pub fn new(config: ContextConfig) -> Self {
        let shared = Arc::new_cyclic(|me| ContextShared {
            me: me.clone(),
            state: Mutex::new(AdmissionState::new(config.clone())),
            config,
            wake: Mutex::new(None),
        });
        Self { shared }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.shared.config
    }

    /// Request a slot. Granted synchronously when one is free, the breaker is
    /// closed and no higher-priority request is waiting; otherwise queued.
    pub fn request_context(
        &self,
        id: &str,
        priority: f32,
        on_cleanup: Option<CleanupFn>,
    ) -> Result<Admission, LoadError> {
        let me = &self.shared.me;
        self.shared.with_state(|state, now, effects| {
            if state.holds(id) {
                return Err(LoadError::DuplicateInFlight(id.to_string()));
            }
            state.expire_waiting(now, effects);

            let outranked = state.waiting.peek_priority().is_some_and(|p| p >= priority);
            if !outranked && state.can_create(now) {
                let lease = state.grant(me, id.to_string(), priority, on_cleanup, now);
                return Ok(Admission::Granted(lease));
            }

            if state.waiting.len() >= state.config.max_queue_len {
                state.counters.rejected += 1;
                log::debug!("Context queue full, rejecting '{}'", id);
                return Err(LoadError::ContextExhausted(id.to_string()));
            }

            let (tx, rx) = oneshot::channel();
            state.waiting.push(
                priority,
                Waiter {
                    id: id.to_string(),
                    enqueued_at: now,
                    on_cleanup,
                    grant: tx,
                },
            );
            state.counters.queued += 1;
            log::debug!(
                "Queued context request '{}' (priority {:.2}, {} waiting)",
                id,
                priority,
                state.waiting.len()
            );
            // Free slots go to whoever ranks highest, possibly this request
            state.drain(me, now, effects);

            Ok(Admission::Queued(AdmissionTicket {
                id: id.to_string(),
                rx,
            }))
        })
    }

    /// Request a slot without queueing
    pub fn try_request_context(&self, id: &str, priority: f32) -> Result<ContextLease, LoadError> {
        let me = &self.shared.me;
        self.shared.with_state(|state, now, _| {
            if state.holds(id) {
                return Err(LoadError::DuplicateInFlight(id.to_string()));
            }
            if let Some(retry_after) = state.breaker_remaining(now) {
                state.counters.rejected += 1;
                return Err(LoadError::CircuitOpen {
                    id: id.to_string(),
                    retry_after,
                });
            }
            if !state.waiting.is_empty() || !state.can_create(now) {
                state.counters.rejected += 1;
                return Err(LoadError::ContextExhausted(id.to_string()));
            }
            Ok(state.grant(me, id.to_string(), priority, None, now))
        })
    }

    /// Release the active slot held by `id`. The slot stays counted until the
    /// release cooldown ends, then the queue drains.
    pub fn release_context(&self, id: &str) -> bool {
        self.shared.release_where(|s| s.id == id)
    }

    /// Withdraw a waiting request. The waiter's ticket resolves `Aborted`.
    pub fn cancel_request(&self, id: &str) -> bool {
        self.shared.with_state(|state, _, effects| {
            let removed = state.waiting.remove_where(|w| w.id == id);
            let found = !removed.is_empty();
            for waiter in removed {
                effects.grants.push((waiter.grant, Err(LoadError::Aborted(waiter.id))));
            }
            found
        })
    }

    pub fn can_create_context(&self) -> bool {
        self.shared.with_state(|state, now, _| state.can_create(now))
    }

    /// Record a failed context creation: opens the breaker and rate-limits
    /// further creation
    pub fn report_creation_error(&self) {
        self.shared.with_state(|state, now, _| {
            state.last_creation_error = Some(now);
            let cooldown = state.config.error_trip_cooldown();
            state.trip(now, cooldown, BreakerTrip::CreationError);
        });
    }

    /// Driver-level loss of the context held by `id`. The slot is freed
    /// immediately and the holder's lease is revoked.
    pub fn report_context_lost(&self, id: &str) -> bool {
        let me = &self.shared.me;
        self.shared.with_state(|state, now, effects| {
            let Some(index) = state
                .slots
                .iter()
                .position(|s| s.id == id && s.state == SlotState::Active)
            else {
                return false;
            };
            state.reclaim(index, effects);
            state.counters.lost += 1;
            log::warn!("Rendering context lost for '{}'", id);
            state.drain(me, now, effects);
            true
        })
    }

    /// Set the ceiling within `[min_contexts, hard_max_contexts]`, evicting
    /// the lowest-priority slots if it drops below the active count
    pub fn set_max_contexts(&self, max: usize) -> usize {
        let me = &self.shared.me;
        self.shared
            .with_state(|state, now, effects| state.set_max_contexts(max, me, now, effects))
    }

    /// Lower the ceiling by one under high pressure, recover it by one toward
    /// the initial ceiling under low pressure
    pub fn apply_memory_pressure(&self, pressure: MemoryPressure) -> usize {
        let me = &self.shared.me;
        self.shared.with_state(|state, now, effects| {
            let current = state.max_contexts;
            let target = match pressure {
                MemoryPressure::High => current.saturating_sub(1),
                MemoryPressure::Low if current < state.config.initial_max_contexts => current + 1,
                _ => current,
            };
            if target == current {
                return current;
            }
            state.set_max_contexts(target, me, now, effects)
        })
    }

    pub fn max_contexts(&self) -> usize {
        self.shared.lock().max_contexts
    }

    pub fn active_contexts(&self) -> usize {
        self.shared.lock().slots.len()
    }

    pub fn waiting(&self) -> usize {
        self.shared.lock().waiting.len()
    }

    pub fn stats(&self) -> ContextStats {
        self.shared.with_state(|state, now, _| state.stats(now))
    }

    /// Reclaim every slot, abort every waiter and restore the initial ceiling
    pub fn reset(&self) {
        self.shared.with_state(|state, _, effects| {
            while !state.slots.is_empty() {
                state.reclaim(0, effects);
            }
            for waiter in state.waiting.drain_ordered() {
                effects.grants.push((waiter.grant, Err(LoadError::Aborted(waiter.id))));
            }
            state.max_contexts = state.config.initial_max_contexts;
            state.creations.clear();
            state.breaker_until = None;
            state.breaker_reason = None;
            state.last_creation_error = None;
            state.counters = Counters::default();
        });
        log::info!("Context manager reset");
    }
}
