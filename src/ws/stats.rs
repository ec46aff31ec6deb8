//! Process-wide statistics of websocket connections.
//!
//! Closed connection ids are cached and deduplicated so that repeated close
//! calls for the same connection do not skew the totals. [`reset`] exists to
//! make tests deterministic.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};

use once_cell::sync::Lazy;
use uuid::Uuid;

const DEFAULT_CLOSED_CACHE_SIZE: usize = 100;

static STATS: Lazy<Mutex<State>> = Lazy::new(|| Mutex::new(State::new()));

/// Snapshot of the websocket connection counters.
#[non_exhaustive]
#[derive(Debug, Clone, Default)]
pub struct WebsocketStats {
    pub total_active_connections: usize,
    pub total_closed_connections: u64,
    pub active_connection_ids: Vec<Uuid>,
}

struct State {
    active: HashSet<Uuid>,
    closed: VecDeque<Uuid>,
    total_closed: u64,
    max_closed_cache_size: usize,
}

impl State {
    fn new() -> Self {
        Self {
            active: HashSet::new(),
            closed: VecDeque::with_capacity(DEFAULT_CLOSED_CACHE_SIZE),
            total_closed: 0,
            max_closed_cache_size: DEFAULT_CLOSED_CACHE_SIZE,
        }
    }

    fn add_closed(&mut self, id: Uuid) {
        self.active.remove(&id);

        // Duplicate close calls for the same connection do not count.
        if self.closed.contains(&id) {
            return;
        }

        self.total_closed += 1;
        while self.closed.len() >= self.max_closed_cache_size.max(1) {
            self.closed.pop_front();
        }
        if self.max_closed_cache_size > 0 {
            self.closed.push_back(id);
        }
    }

    fn shrink_to(&mut self, cap: usize) {
        self.max_closed_cache_size = cap;
        while self.closed.len() > cap {
            self.closed.pop_front();
        }
    }
}

fn lock() -> std::sync::MutexGuard<'static, State> {
    // Counter state has no inconsistent intermediate state, so a poisoned
    // lock is recoverable.
    STATS.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Record a newly opened connection.
pub fn add_active_connection(id: Uuid) {
    lock().active.insert(id);
}

/// Record a closed connection. Duplicate calls for the same id are ignored.
pub fn add_closed_connection(id: Uuid) {
    lock().add_closed(id);
}

/// Snapshot the current counters.
#[must_use]
pub fn get_stats() -> WebsocketStats {
    let state = lock();
    WebsocketStats {
        total_active_connections: state.active.len(),
        total_closed_connections: state.total_closed,
        active_connection_ids: state.active.iter().copied().collect(),
    }
}

/// Reset all counters and caches.
pub fn reset() {
    let mut state = lock();
    *state = State::new();
}

/// Change the closed-id cache capacity, keeping the newest entries when
/// shrinking.
pub fn set_max_closed_cache_size(cap: usize) {
    lock().shrink_to(cap);
}

/// Number of closed ids currently cached, exposed for tests.
#[must_use]
pub fn closed_cache_len() -> usize {
    lock().closed.len()
}
