//! Load and health ledger
//!
//! One [`Ledger`] value owned by the service and passed explicitly to the
//! router, range engine, and maintenance loop. Three tables, one lock each,
//! never held across an await:
//!
//! - `work_loads`: in-flight streaming operations per session
//! - `blacklist`: sessions cooling off after an error or flood wait
//! - `blind`: `(message, session)` pairs the session cannot observe yet
//!
//! Expiries are advisory. The router removes stale entries lazily while
//! selecting; the maintenance loop sweeps whatever routing never touched.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::{MessageId, SessionId};

/// Default cool-off for a session after a transport error.
pub const BLACKLIST_DEFAULT: Duration = Duration::from_secs(60);

/// How long a session stays blind to one message after `NotYetVisible`.
pub const BLIND_TTL: Duration = Duration::from_secs(30);

/// The composite routing ledger.
#[derive(Default)]
pub struct Ledger {
    work_loads: Mutex<BTreeMap<SessionId, usize>>,
    blacklist: Mutex<HashMap<SessionId, Instant>>,
    blind: Mutex<HashMap<(MessageId, SessionId), Instant>>,
}

impl Ledger {
    /// Empty ledger with no registered sessions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session with a zeroed in-flight counter.
    ///
    /// Called on every successful session start, including restarts.
    pub fn register(&self, id: SessionId) {
        self.work_loads.lock().unwrap().insert(id, 0);
    }

    /// Increment the in-flight counter for `id`.
    pub fn increment(&self, id: SessionId) {
        *self.work_loads.lock().unwrap().entry(id).or_insert(0) += 1;
    }

    /// Decrement the in-flight counter for `id`.
    ///
    /// A decrement below zero means a balance bug somewhere; it is clamped
    /// and logged rather than wrapped.
    pub fn decrement(&self, id: SessionId) {
        let mut loads = self.work_loads.lock().unwrap();
        match loads.get_mut(&id) {
            Some(count) if *count > 0 => *count -= 1,
            _ => warn!(session = id, "work load decrement below zero"),
        }
    }

    /// Ids currently present in the work-load table, with their counts.
    pub fn loads(&self) -> Vec<(SessionId, usize)> {
        self.work_loads
            .lock()
            .unwrap()
            .iter()
            .map(|(id, count)| (*id, *count))
            .collect()
    }

    /// In-flight count for one session, `None` if unregistered.
    pub fn load_of(&self, id: SessionId) -> Option<usize> {
        self.work_loads.lock().unwrap().get(&id).copied()
    }

    /// Sorted snapshot of the work-load table, for `/status`.
    pub fn snapshot(&self) -> BTreeMap<SessionId, usize> {
        self.work_loads.lock().unwrap().clone()
    }

    /// Sum of all in-flight counters.
    pub fn total_load(&self) -> usize {
        self.work_loads.lock().unwrap().values().sum()
    }

    /// Put a session on the blacklist for `duration`.
    pub fn ban(&self, id: SessionId, duration: Duration) {
        self.blacklist
            .lock()
            .unwrap()
            .insert(id, Instant::now() + duration);
    }

    /// Whether `id` is cooling off at `now`, expiring the entry in place.
    pub fn is_banned(&self, id: SessionId, now: Instant) -> bool {
        let mut blacklist = self.blacklist.lock().unwrap();
        match blacklist.get(&id) {
            Some(expiry) if now < *expiry => true,
            Some(_) => {
                blacklist.remove(&id);
                false
            }
            None => false,
        }
    }

    /// Blacklist expiry for `id`, if any. Used by tests and diagnostics.
    pub fn ban_expiry(&self, id: SessionId) -> Option<Instant> {
        self.blacklist.lock().unwrap().get(&id).copied()
    }

    /// Mark `id` blind to `message_id` for `duration`.
    pub fn mark_blind(&self, message_id: MessageId, id: SessionId, duration: Duration) {
        self.blind
            .lock()
            .unwrap()
            .insert((message_id, id), Instant::now() + duration);
    }

    /// Whether `id` is blind to `message_id` at `now`, expiring in place.
    pub fn is_blind(&self, message_id: MessageId, id: SessionId, now: Instant) -> bool {
        let mut blind = self.blind.lock().unwrap();
        match blind.get(&(message_id, id)) {
            Some(expiry) if now < *expiry => true,
            Some(_) => {
                blind.remove(&(message_id, id));
                false
            }
            None => false,
        }
    }

    /// Drop every expired blacklist and blind entry.
    ///
    /// Routing already expires what it touches; this catches entries for
    /// messages nobody requests anymore.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        self.blacklist
            .lock()
            .unwrap()
            .retain(|_, expiry| now < *expiry);
        self.blind.lock().unwrap().retain(|_, expiry| now < *expiry);
    }
}

/// Per-request touch-list guaranteeing counter balance.
///
/// Every session id borrowed during a request (initial selection plus any
/// failovers) is incremented at most once here and decremented exactly once
/// when the guard drops. Drop runs on success, error, and client-disconnect
/// paths alike, so long-running counters never drift.
pub struct LedgerGuard {
    ledger: Arc<Ledger>,
    touched: Vec<SessionId>,
}

impl LedgerGuard {
    /// New guard with an empty touch-list.
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self {
            ledger,
            touched: Vec::new(),
        }
    }

    /// Borrow a session for this request, incrementing its counter.
    ///
    /// Borrowing an id already on the touch-list is a no-op, so a request
    /// that fails back to an earlier session stays balanced.
    pub fn borrow(&mut self, id: SessionId) {
        if !self.touched.contains(&id) {
            self.ledger.increment(id);
            self.touched.push(id);
        }
    }

    /// Ids borrowed so far, in borrow order.
    pub fn touched(&self) -> &[SessionId] {
        &self.touched
    }
}

impl Drop for LedgerGuard {
    fn drop(&mut self) {
        for id in &self.touched {
            self.ledger.decrement(*id);
        }
    }
}
