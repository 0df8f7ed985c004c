//! Target selection algorithms.

use rand::seq::SliceRandom;
use rand::Rng;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::ledger::{Reservation, UsageLedger};
use crate::config::{ConfigError, TargetConfig};

/// Selection algorithm, fixed when the dispatcher is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// Strict rotation through the target list.
    RoundRobin,
    /// Uniform pick, ignoring weights.
    Random,
    /// Pick proportional to weight.
    WeightedRandom,
    /// Least recently successful target; never-used targets first.
    LeastUsed,
    /// Lowest ratio of recent requests to effective capacity.
    DynamicLeastLoad,
    /// Lowest liveness-probe round trip.
    LowestLatency,
}

impl Algorithm {
    pub const ALL: [Algorithm; 6] = [
        Algorithm::RoundRobin,
        Algorithm::Random,
        Algorithm::WeightedRandom,
        Algorithm::LeastUsed,
        Algorithm::DynamicLeastLoad,
        Algorithm::LowestLatency,
    ];

    /// Configuration tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::RoundRobin => "round_robin",
            Algorithm::Random => "random",
            Algorithm::WeightedRandom => "weighted_random",
            Algorithm::LeastUsed => "least_used",
            Algorithm::DynamicLeastLoad => "dynamic_least_load",
            Algorithm::LowestLatency => "lowest_latency",
        }
    }
}

impl FromStr for Algorithm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Algorithm::ALL
            .into_iter()
            .find(|algorithm| algorithm.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownAlgorithm(s.to_string()))
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable selection state, only touched inside the selection critical section.
#[derive(Debug, Default)]
pub struct SelectionState {
    cursor: usize,
}

/// Result of one selection attempt.
#[derive(Debug)]
pub enum SelectionOutcome {
    /// The candidate passed the availability gate and holds a reservation.
    Admitted {
        target: Arc<TargetConfig>,
        reservation: Reservation,
    },
    /// The candidate was refused by the gate.
    Denied {
        target: Arc<TargetConfig>,
        reason: super::gate::DenyReason,
    },
    /// No candidate could be produced (no targets configured).
    NoCandidate,
}

/// Produces candidate targets according to a fixed [`Algorithm`].
#[derive(Debug, Clone, Copy)]
pub struct Selector {
    algorithm: Algorithm,
}

impl Selector {
    pub fn new(algorithm: Algorithm) -> Self {
        Self { algorithm }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Whether this selector needs fresh probe latencies before each pick.
    pub fn needs_probe(&self) -> bool {
        self.algorithm == Algorithm::LowestLatency
    }

    /// Pick a candidate. Returns `None` only for an empty target list.
    ///
    /// `latencies` is aligned with `targets` and only read by
    /// [`Algorithm::LowestLatency`].
    pub fn select<R: Rng>(
        &self,
        state: &mut SelectionState,
        targets: &[Arc<TargetConfig>],
        ledger: &UsageLedger,
        latencies: Option<&[Option<Duration>]>,
        now: Instant,
        rng: &mut R,
    ) -> Option<Arc<TargetConfig>> {
        let picked = match self.algorithm {
            Algorithm::RoundRobin => round_robin(targets, &mut state.cursor),
            Algorithm::Random => targets.choose(rng),
            Algorithm::WeightedRandom => weighted_random(targets, rng),
            Algorithm::LeastUsed => least_used(targets, ledger),
            Algorithm::DynamicLeastLoad => least_load(targets, ledger, now),
            Algorithm::LowestLatency => lowest_latency(targets, latencies.unwrap_or(&[])),
        };
        picked.cloned()
    }
}

/// Return `targets[cursor]` and advance the cursor.
pub fn round_robin<'a>(
    targets: &'a [Arc<TargetConfig>],
    cursor: &mut usize,
) -> Option<&'a Arc<TargetConfig>> {
    if targets.is_empty() {
        return None;
    }
    let index = *cursor % targets.len();
    *cursor = (index + 1) % targets.len();
    targets.get(index)
}

/// Draw `r` in `[0, total)` and walk the targets subtracting weights.
pub fn weighted_random<'a, R: Rng>(
    targets: &'a [Arc<TargetConfig>],
    rng: &mut R,
) -> Option<&'a Arc<TargetConfig>> {
    let total: f64 = targets.iter().map(|t| t.weight).sum();
    if !total.is_finite() || total <= 0.0 {
        return targets.first();
    }
    let mut r = rng.gen_range(0.0..total);
    for target in targets {
        r -= target.weight;
        if r <= 0.0 {
            return Some(target);
        }
    }
    // Float rounding can leave a sliver of `r`; it belongs to the last target.
    targets.last()
}

/// Target with the oldest last success; never-used targets sort first.
pub fn least_used<'a>(
    targets: &'a [Arc<TargetConfig>],
    ledger: &UsageLedger,
) -> Option<&'a Arc<TargetConfig>> {
    targets.iter().min_by_key(|t| ledger.last_used(&t.id))
}

/// Load of a target: requests in its window, pending ones included, over
/// `min(rps * 60, rpm)`.
///
/// A zero effective limit yields infinite load. Because a limit of zero
/// also means "disabled" to the gate, a target with either limit disabled
/// is never preferred by this algorithm while another target has finite load.
pub fn target_load(target: &TargetConfig, ledger: &UsageLedger, now: Instant) -> f64 {
    let effective_limit = (target.rps_limit * 60.0).min(target.rpm_limit as f64);
    if effective_limit <= 0.0 {
        return f64::INFINITY;
    }
    let requests = ledger.with_state(&target.id, |usage| {
        usage.count_in_window(target.load_window, now) + usage.pending_requests()
    });
    requests as f64 / effective_limit
}

/// Minimum-load target; ties go to the earliest target in the list.
pub fn least_load<'a>(
    targets: &'a [Arc<TargetConfig>],
    ledger: &UsageLedger,
    now: Instant,
) -> Option<&'a Arc<TargetConfig>> {
    targets
        .iter()
        .map(|t| (t, target_load(t, ledger, now)))
        .min_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(t, _)| t)
}

/// Target with the smallest measured round trip; failed probes count as infinite.
pub fn lowest_latency<'a>(
    targets: &'a [Arc<TargetConfig>],
    latencies: &[Option<Duration>],
) -> Option<&'a Arc<TargetConfig>> {
    targets
        .iter()
        .enumerate()
        .min_by_key(|(i, _)| latencies.get(*i).copied().flatten().unwrap_or(Duration::MAX))
        .map(|(_, t)| t)
}
