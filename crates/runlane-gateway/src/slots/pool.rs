//! Keyed counting pool with single-use reservations.
//!
//! A [`SlotPool`] tracks, per key, how many runs are *pending* (reserved but
//! not yet registered) and *active* (registered and running). A reservation
//! is admitted only while `active + pending < capacity`, so the sum never
//! exceeds the cap the caller checked against.
//!
//! Every [`Reservation`] decrements its counter exactly once: explicitly via
//! [`Reservation::release`] / [`SlotPool::release`], or implicitly on drop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

/// Snapshot of a key's usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotUsage {
    pub active: usize,
    pub pending: usize,
    pub total: usize,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counter {
    active: usize,
    pending: usize,
}

struct PoolInner {
    name: String,
    counters: Mutex<HashMap<String, Counter>>,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Counter>> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Process-wide keyed slot pool. Cloning shares the same counters.
#[derive(Clone)]
pub struct SlotPool {
    inner: Arc<PoolInner>,
}

impl SlotPool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                counters: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Reserve one slot for `key` if `active + pending < capacity`.
    ///
    /// Denial leaves the counters untouched.
    pub fn try_reserve(&self, key: &str, capacity: usize) -> Option<Reservation> {
        let mut counters = self.inner.lock();
        let counter = counters.get(key).copied().unwrap_or_default();
        if counter.active + counter.pending >= capacity {
            debug!(
                pool = %self.inner.name,
                key,
                active = counter.active,
                pending = counter.pending,
                capacity,
                "Slot reservation denied"
            );
            return None;
        }
        counters.entry(key.to_string()).or_default().pending += 1;
        drop(counters);

        Some(Reservation {
            pool: Arc::clone(&self.inner),
            key: key.to_string(),
            state: ReservationState::Pending,
        })
    }

    /// Account an already-running run, e.g. one rehydrated from storage.
    ///
    /// Restored runs are active immediately and are not capped.
    pub fn restore(&self, key: &str) -> Reservation {
        self.inner.lock().entry(key.to_string()).or_default().active += 1;
        Reservation {
            pool: Arc::clone(&self.inner),
            key: key.to_string(),
            state: ReservationState::Active,
        }
    }

    /// Release a reservation held against this pool.
    ///
    /// Returns `true` if this call released the slot. Reservations issued by
    /// another pool are left alone.
    pub fn release(&self, reservation: &mut Reservation) -> bool {
        if !Arc::ptr_eq(&self.inner, &reservation.pool) {
            return false;
        }
        reservation.release()
    }

    pub fn usage(&self, key: &str) -> SlotUsage {
        let counter = self.inner.lock().get(key).copied().unwrap_or_default();
        SlotUsage {
            active: counter.active,
            pending: counter.pending,
            total: counter.active + counter.pending,
        }
    }

    /// Keys that currently hold at least one slot.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReservationState {
    Pending,
    Active,
    Released,
}

/// A single-use slot token bound to one pool and key.
pub struct Reservation {
    pool: Arc<PoolInner>,
    key: String,
    state: ReservationState,
}

impl Reservation {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn pool_name(&self) -> &str {
        &self.pool.name
    }

    pub fn is_released(&self) -> bool {
        self.state == ReservationState::Released
    }

    pub fn is_active(&self) -> bool {
        self.state == ReservationState::Active
    }

    /// Move the slot from pending to active once the run is registered.
    pub fn commit(&mut self) {
        if self.state != ReservationState::Pending {
            return;
        }
        let mut counters = self.pool.lock();
        let counter = counters.entry(self.key.clone()).or_default();
        counter.pending = counter.pending.saturating_sub(1);
        counter.active += 1;
        self.state = ReservationState::Active;
    }

    /// Give the slot back. Later calls are no-ops and return `false`.
    pub fn release(&mut self) -> bool {
        let previous = self.state;
        if previous == ReservationState::Released {
            return false;
        }
        self.state = ReservationState::Released;

        let mut counters = self.pool.lock();
        if let Some(counter) = counters.get_mut(&self.key) {
            match previous {
                ReservationState::Pending => counter.pending = counter.pending.saturating_sub(1),
                ReservationState::Active => counter.active = counter.active.saturating_sub(1),
                ReservationState::Released => {}
            }
            if counter.active == 0 && counter.pending == 0 {
                counters.remove(&self.key);
            }
        }
        true
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservation")
            .field("pool", &self.pool.name)
            .field("key", &self.key)
            .field("state", &self.state)
            .finish()
    }
}
