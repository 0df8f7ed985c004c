//! Per-target usage bookkeeping.
//!
//! Each target owns a [`UsageState`] holding bounded request and cost
//! histories plus the timestamps the availability gate needs. The
//! [`UsageLedger`] keeps one state per target in a [`DashMap`], so writers
//! for different targets never contend and writers for the same target are
//! serialized by the shard lock.
//!
//! # Window approximation
//!
//! Histories are fixed-capacity rings, not true time windows. Once more than
//! `capacity` events fall inside a window the oldest are already gone and
//! window queries under-report. With the default capacity of 100, a target
//! receiving more than 100 requests per minute reports at most 100 for its
//! per-minute window, so an `rpm_limit` above the capacity is never enforced.
//!
//! # Reservations
//!
//! Completed requests only land in the histories once their response comes
//! back. Until then an admitted request holds a [`Reservation`] that counts
//! one pending request plus whatever cost it claimed, and the gate adds those
//! to the window totals.

use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Error classes tracked per target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// HTTP 429
    TooManyRequests,
    /// HTTP 500
    InternalError,
    /// HTTP 502
    BadGateway,
    /// HTTP 503
    ServiceUnavailable,
    /// HTTP 403
    Forbidden,
    /// Connection-level failure, no status code
    Transport,
    /// Any other non-200 status
    Other,
}

impl ErrorClass {
    /// Classes that may carry a cooldown, in the order the gate checks them.
    pub const COOLDOWN_CLASSES: [ErrorClass; 5] = [
        ErrorClass::TooManyRequests,
        ErrorClass::InternalError,
        ErrorClass::BadGateway,
        ErrorClass::ServiceUnavailable,
        ErrorClass::Forbidden,
    ];

    /// Classify a non-200 HTTP status.
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => ErrorClass::TooManyRequests,
            500 => ErrorClass::InternalError,
            502 => ErrorClass::BadGateway,
            503 => ErrorClass::ServiceUnavailable,
            403 => ErrorClass::Forbidden,
            _ => ErrorClass::Other,
        }
    }

    /// Whether a delivery failing with this class is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorClass::Other)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::TooManyRequests => "429",
            ErrorClass::InternalError => "500",
            ErrorClass::BadGateway => "502",
            ErrorClass::ServiceUnavailable => "503",
            ErrorClass::Forbidden => "403",
            ErrorClass::Transport => "transport",
            ErrorClass::Other => "other",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed-capacity history; pushing past capacity evicts the oldest entry.
#[derive(Debug, Clone)]
pub struct BoundedHistory<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedHistory<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: T) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Newest entry.
    pub fn back(&self) -> Option<&T> {
        self.entries.back()
    }

    /// Entries from oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.entries.iter()
    }
}

fn within(window: Duration, at: Instant, now: Instant) -> bool {
    now.saturating_duration_since(at) <= window
}

/// Mutable usage state of one target.
#[derive(Debug, Clone)]
pub struct UsageState {
    requests: BoundedHistory<Instant>,
    costs: BoundedHistory<(u64, Instant)>,
    last_used: Option<Instant>,
    last_admitted: Option<Instant>,
    last_errors: HashMap<ErrorClass, Instant>,
    pending_requests: usize,
    pending_cost: u64,
    successes: u64,
    failures: u64,
}

impl UsageState {
    pub fn new(capacity: usize) -> Self {
        Self {
            requests: BoundedHistory::new(capacity),
            costs: BoundedHistory::new(capacity),
            last_used: None,
            last_admitted: None,
            last_errors: HashMap::new(),
            pending_requests: 0,
            pending_cost: 0,
            successes: 0,
            failures: 0,
        }
    }

    /// Most recent request: the later of the newest completed request and
    /// the last admission handed out by the selector.
    pub fn last_request(&self) -> Option<Instant> {
        match (self.requests.back().copied(), self.last_admitted) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    /// Last successful use, `None` if the target never succeeded.
    pub fn last_used(&self) -> Option<Instant> {
        self.last_used
    }

    /// Last occurrence of `class`.
    pub fn last_error(&self, class: ErrorClass) -> Option<Instant> {
        self.last_errors.get(&class).copied()
    }

    pub fn successes(&self) -> u64 {
        self.successes
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Admitted requests whose delivery has not settled yet.
    pub fn pending_requests(&self) -> usize {
        self.pending_requests
    }

    /// Cost claimed by pending requests.
    pub fn pending_cost(&self) -> u64 {
        self.pending_cost
    }

    /// Requests recorded within `[now - window, now]`.
    ///
    /// Bounded by the history capacity, see the module docs.
    pub fn count_in_window(&self, window: Duration, now: Instant) -> usize {
        self.requests
            .iter()
            .rev()
            .take_while(|at| within(window, **at, now))
            .count()
    }

    /// Sum of costs recorded within `[now - window, now]`.
    pub fn cost_in_window(&self, window: Duration, now: Instant) -> u64 {
        self.costs
            .iter()
            .rev()
            .take_while(|(_, at)| within(window, *at, now))
            .map(|(cost, _)| *cost)
            .sum()
    }

    fn record_success(&mut self, cost: u64, now: Instant) {
        // Keep the histories non-decreasing even if callers race on `now`.
        let now = self.requests.back().map_or(now, |last| now.max(*last));
        self.requests.push(now);
        self.costs.push((cost, now));
        self.last_used = Some(now);
        self.successes += 1;
    }

    fn record_failure(&mut self, class: ErrorClass, now: Instant) {
        self.last_errors.insert(class, now);
        self.failures += 1;
    }

    fn record_admission(&mut self, now: Instant) {
        self.last_admitted = Some(self.last_admitted.map_or(now, |last| now.max(last)));
    }

    fn release(&mut self, cost: u64) {
        self.pending_requests = self.pending_requests.saturating_sub(1);
        self.pending_cost = self.pending_cost.saturating_sub(cost);
    }
}

/// Concurrent per-target usage ledger.
#[derive(Debug)]
pub struct UsageLedger {
    states: DashMap<String, UsageState>,
    capacity: usize,
}

impl UsageLedger {
    /// Create a ledger with an empty state for each target id.
    pub fn new<'a>(ids: impl IntoIterator<Item = &'a str>, capacity: usize) -> Self {
        let states = DashMap::new();
        for id in ids {
            states.insert(id.to_string(), UsageState::new(capacity));
        }
        Self { states, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Record a successful delivery costing `cost` units.
    pub fn record_success(&self, id: &str, cost: u64) {
        self.record_success_at(id, cost, Instant::now());
    }

    pub fn record_success_at(&self, id: &str, cost: u64, now: Instant) {
        self.with_state_mut(id, |state| state.record_success(cost, now));
        tracing::debug!(target_id = %id, cost, "Recorded success");
    }

    /// Record a failed delivery of the given class.
    pub fn record_failure(&self, id: &str, class: ErrorClass) {
        self.record_failure_at(id, class, Instant::now());
    }

    pub fn record_failure_at(&self, id: &str, class: ErrorClass, now: Instant) {
        self.with_state_mut(id, |state| state.record_failure(class, now));
        tracing::debug!(target_id = %id, class = %class, "Recorded failure");
    }

    /// Record that the selector handed `id` out to a request.
    pub fn record_admission(&self, id: &str) {
        self.record_admission_at(id, Instant::now());
    }

    pub fn record_admission_at(&self, id: &str, now: Instant) {
        self.with_state_mut(id, |state| state.record_admission(now));
    }

    /// Record an admission for `id` and hold a pending request slot until
    /// the returned reservation settles or is dropped.
    pub fn reserve_at(self: &Arc<Self>, id: &str, now: Instant) -> Reservation {
        let previous_admission = self.with_state_mut(id, |state| {
            let previous = state.last_admitted;
            state.record_admission(now);
            state.pending_requests += 1;
            previous
        });
        Reservation {
            ledger: Arc::clone(self),
            id: id.to_string(),
            admitted_at: now,
            previous_admission,
            cost: 0,
            settled: AtomicBool::new(false),
        }
    }

    pub fn count_in_window(&self, id: &str, window: Duration, now: Instant) -> usize {
        self.with_state(id, |state| state.count_in_window(window, now))
    }

    pub fn cost_in_window(&self, id: &str, window: Duration, now: Instant) -> u64 {
        self.with_state(id, |state| state.cost_in_window(window, now))
    }

    pub fn last_used(&self, id: &str) -> Option<Instant> {
        self.with_state(id, |state| state.last_used())
    }

    /// Run `f` against the state of `id`.
    ///
    /// Unknown ids read as a fresh, never-used state.
    pub fn with_state<R>(&self, id: &str, f: impl FnOnce(&UsageState) -> R) -> R {
        match self.states.get(id) {
            Some(entry) => f(entry.value()),
            None => f(&UsageState::new(self.capacity)),
        }
    }

    /// Copy of the current state of `id`.
    pub fn snapshot(&self, id: &str) -> UsageState {
        self.with_state(id, UsageState::clone)
    }

    fn with_state_mut<R>(&self, id: &str, f: impl FnOnce(&mut UsageState) -> R) -> R {
        let mut entry = self
            .states
            .entry(id.to_string())
            .or_insert_with(|| UsageState::new(self.capacity));
        f(entry.value_mut())
    }
}

/// In-flight claim on one target's request and cost windows.
///
/// Dropping the reservation releases whatever it still holds.
#[derive(Debug)]
pub struct Reservation {
    ledger: Arc<UsageLedger>,
    id: String,
    admitted_at: Instant,
    previous_admission: Option<Instant>,
    cost: u64,
    settled: AtomicBool,
}

impl Reservation {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Cost claimed so far.
    pub fn cost(&self) -> u64 {
        self.cost
    }

    /// Claim `cost` more units if `check` accepts the state it sees.
    ///
    /// The check and the claim run under the target's shard lock, so two
    /// concurrent claims cannot jointly push a window past its ceiling.
    pub fn claim_cost<E>(
        &mut self,
        cost: u64,
        check: impl FnOnce(&UsageState) -> Result<(), E>,
    ) -> Result<(), E> {
        self.ledger.with_state_mut(&self.id, |state| -> Result<(), E> {
            check(state)?;
            state.pending_cost = state.pending_cost.saturating_add(cost);
            Ok(())
        })?;
        self.cost = self.cost.saturating_add(cost);
        Ok(())
    }

    /// Record a failed attempt against the reserved target.
    pub fn record_failure(&self, class: ErrorClass) {
        self.ledger.record_failure(&self.id, class);
    }

    /// Record the delivery as a success and release the claim in one step.
    pub fn settle_success(&self, now: Instant) {
        let release = !self.settled.swap(true, Ordering::AcqRel);
        self.ledger.with_state_mut(&self.id, |state| {
            if release {
                state.release(self.cost);
            }
            state.record_success(self.cost, now);
        });
        tracing::debug!(target_id = %self.id, cost = self.cost, "Recorded success");
    }

    /// Hand the slot back unused. The admission is undone too unless a
    /// later one has replaced it.
    pub fn revoke(self) {
        if self.settled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.ledger.with_state_mut(&self.id, |state| {
            state.release(self.cost);
            if state.last_admitted == Some(self.admitted_at) {
                state.last_admitted = self.previous_admission;
            }
        });
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !*self.settled.get_mut() {
            let cost = self.cost;
            self.ledger.with_state_mut(&self.id, |state| state.release(cost));
        }
    }
}
