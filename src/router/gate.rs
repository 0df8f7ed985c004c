//! Availability gate: may a target accept a new request right now?
//!
//! The gate is a pure function of the target's policy, its usage state and
//! the current instant. Rules are evaluated in a fixed order and the first
//! violation is reported; the order only affects which reason is reported.

use std::time::Duration;
use tokio::time::Instant;

use super::ledger::{ErrorClass, UsageLedger, UsageState};
use crate::config::TargetConfig;

/// Window used by the per-minute request and cost ceilings.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// The constraint a target violated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DenyReason {
    RequestsPerSecond { limit: f64, remaining: Duration },
    RequestsPerMinute { count: usize, limit: u32 },
    CostPerMinute { cost: u64, limit: u64 },
    MinRequestInterval { remaining: Duration },
    SuccessInterval { remaining: Duration },
    Cooldown { class: ErrorClass, remaining: Duration },
    /// Pre-flight check: the request itself would push the window over the ceiling.
    CostCeiling { window_cost: u64, request_cost: u64, limit: u64 },
}

impl DenyReason {
    /// Short machine-readable constraint name.
    pub fn constraint(&self) -> &'static str {
        match self {
            DenyReason::RequestsPerSecond { .. } => "rps_limit",
            DenyReason::RequestsPerMinute { .. } => "rpm_limit",
            DenyReason::CostPerMinute { .. } => "tpm_limit",
            DenyReason::MinRequestInterval { .. } => "min_request_interval",
            DenyReason::SuccessInterval { .. } => "success_interval",
            DenyReason::Cooldown { .. } => "cooldown",
            DenyReason::CostCeiling { .. } => "cost_ceiling",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::RequestsPerSecond { limit, remaining } => write!(
                f,
                "RPS limit {} reached, next slot in {}ms",
                limit,
                remaining.as_millis()
            ),
            DenyReason::RequestsPerMinute { count, limit } => {
                write!(f, "RPM limit reached ({}/{})", count, limit)
            }
            DenyReason::CostPerMinute { cost, limit } => {
                write!(f, "cost-per-minute limit reached ({}/{})", cost, limit)
            }
            DenyReason::MinRequestInterval { remaining } => write!(
                f,
                "minimum request interval not elapsed ({}ms left)",
                remaining.as_millis()
            ),
            DenyReason::SuccessInterval { remaining } => write!(
                f,
                "success interval not elapsed ({}ms left)",
                remaining.as_millis()
            ),
            DenyReason::Cooldown { class, remaining } => write!(
                f,
                "cooling down after {} ({}ms left)",
                class,
                remaining.as_millis()
            ),
            DenyReason::CostCeiling {
                window_cost,
                request_cost,
                limit,
            } => write!(
                f,
                "request cost {} on top of {} would exceed {} per minute",
                request_cost, window_cost, limit
            ),
        }
    }
}

/// Gate verdict.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Admit,
    Deny(DenyReason),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admit)
    }

    pub fn reason(&self) -> Option<DenyReason> {
        match self {
            Admission::Admit => None,
            Admission::Deny(reason) => Some(*reason),
        }
    }
}

/// Time left until `elapsed` reaches `required`, if it has not yet.
fn shortfall(since: Instant, now: Instant, required: Duration) -> Option<Duration> {
    let elapsed = now.saturating_duration_since(since);
    (elapsed < required).then(|| required - elapsed)
}

/// Decide whether `target` may accept a request at `now`.
///
/// Limits and intervals configured as zero are skipped. Pending requests and
/// their claimed cost count toward the per-minute ceilings.
pub fn check(target: &TargetConfig, usage: &UsageState, now: Instant) -> Admission {
    let last_request = usage.last_request();

    if target.rps_limit > 0.0 {
        if let Some(last) = last_request {
            let gap = Duration::try_from_secs_f64(1.0 / target.rps_limit).unwrap_or(Duration::MAX);
            if let Some(remaining) = shortfall(last, now, gap) {
                return Admission::Deny(DenyReason::RequestsPerSecond {
                    limit: target.rps_limit,
                    remaining,
                });
            }
        }
    }

    if target.rpm_limit > 0 {
        let count = usage.count_in_window(RATE_WINDOW, now) + usage.pending_requests();
        if count >= target.rpm_limit as usize {
            return Admission::Deny(DenyReason::RequestsPerMinute {
                count,
                limit: target.rpm_limit,
            });
        }
    }

    if target.tpm_limit > 0 {
        let cost = usage
            .cost_in_window(RATE_WINDOW, now)
            .saturating_add(usage.pending_cost());
        if cost >= target.tpm_limit {
            return Admission::Deny(DenyReason::CostPerMinute {
                cost,
                limit: target.tpm_limit,
            });
        }
    }

    if !target.min_request_interval.is_zero() {
        if let Some(remaining) =
            last_request.and_then(|last| shortfall(last, now, target.min_request_interval))
        {
            return Admission::Deny(DenyReason::MinRequestInterval { remaining });
        }
    }

    if !target.success_interval.is_zero() {
        if let Some(remaining) = usage
            .last_used()
            .and_then(|last| shortfall(last, now, target.success_interval))
        {
            return Admission::Deny(DenyReason::SuccessInterval { remaining });
        }
    }

    for class in ErrorClass::COOLDOWN_CLASSES {
        let (Some(cooldown), Some(at)) = (target.cooldowns.get(class), usage.last_error(class))
        else {
            continue;
        };
        // A cooldown too long to represent never ends.
        let remaining = match at.checked_add(cooldown) {
            Some(until) => until.saturating_duration_since(now),
            None => Duration::MAX,
        };
        if !remaining.is_zero() {
            return Admission::Deny(DenyReason::Cooldown { class, remaining });
        }
    }

    Admission::Admit
}

/// [`check`] against the ledger's current state for `target`.
pub fn is_available(target: &TargetConfig, ledger: &UsageLedger, now: Instant) -> Admission {
    ledger.with_state(&target.id, |usage| check(target, usage, now))
}

/// Pre-flight cost check for a request about to be sent to `target`.
///
/// Refuses when the request would push the per-minute cost window, pending
/// claims included, strictly past the ceiling. Targets without a ceiling
/// always pass.
pub fn check_cost_ceiling(
    target: &TargetConfig,
    usage: &UsageState,
    request_cost: u64,
    now: Instant,
) -> Result<(), DenyReason> {
    if target.tpm_limit == 0 {
        return Ok(());
    }
    let window_cost = usage
        .cost_in_window(RATE_WINDOW, now)
        .saturating_add(usage.pending_cost());
    if window_cost.saturating_add(request_cost) > target.tpm_limit {
        return Err(DenyReason::CostCeiling {
            window_cost,
            request_cost,
            limit: target.tpm_limit,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    fn ledger_for(target: &TargetConfig) -> Arc<UsageLedger> {
        Arc::new(UsageLedger::new([target.id.as_str()], 100))
    }

    fn verdict(target: &TargetConfig, ledger: &UsageLedger, now: Instant) -> Admission {
        is_available(target, ledger, now)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_target_admitted_with_defaults() {
        let target = TargetConfig::new("fresh");
        let ledger = ledger_for(&target);
        assert_eq!(verdict(&target, &ledger, Instant::now()), Admission::Admit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rps_denies_immediate_second_request() {
        let target = TargetConfig {
            rps_limit: 1.0,
            ..TargetConfig::unlimited("rps")
        };
        let ledger = ledger_for(&target);
        ledger.record_success(&target.id, 1);

        let denied = verdict(&target, &ledger, Instant::now());
        assert!(matches!(
            denied,
            Admission::Deny(DenyReason::RequestsPerSecond { .. })
        ));

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(!verdict(&target, &ledger, Instant::now()).is_admitted());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(verdict(&target, &ledger, Instant::now()), Admission::Admit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rps_counts_admissions() {
        let target = TargetConfig {
            rps_limit: 1.0,
            ..TargetConfig::unlimited("rps")
        };
        let ledger = ledger_for(&target);
        ledger.record_admission(&target.id);
        assert!(!verdict(&target, &ledger, Instant::now()).is_admitted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rpm_boundary() {
        let target = TargetConfig {
            rpm_limit: 3,
            ..TargetConfig::unlimited("rpm")
        };
        let ledger = ledger_for(&target);
        for _ in 0..2 {
            ledger.record_success(&target.id, 0);
        }
        assert_eq!(verdict(&target, &ledger, Instant::now()), Admission::Admit);

        ledger.record_success(&target.id, 0);
        assert_eq!(
            verdict(&target, &ledger, Instant::now()),
            Admission::Deny(DenyReason::RequestsPerMinute { count: 3, limit: 3 })
        );

        // The window slides: a minute and a moment later the target frees up.
        tokio::time::advance(RATE_WINDOW + Duration::from_millis(1)).await;
        assert_eq!(verdict(&target, &ledger, Instant::now()), Admission::Admit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cost_per_minute_boundary() {
        let target = TargetConfig {
            tpm_limit: 100,
            ..TargetConfig::unlimited("tpm")
        };
        let ledger = ledger_for(&target);
        ledger.record_success(&target.id, 99);
        assert!(verdict(&target, &ledger, Instant::now()).is_admitted());

        ledger.record_success(&target.id, 1);
        assert_eq!(
            verdict(&target, &ledger, Instant::now()),
            Admission::Deny(DenyReason::CostPerMinute {
                cost: 100,
                limit: 100
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cost_ceiling_precheck() {
        let target = TargetConfig {
            tpm_limit: 100,
            ..TargetConfig::unlimited("tpm")
        };
        let ledger = ledger_for(&target);
        ledger.record_success(&target.id, 95);
        let usage = ledger.snapshot(&target.id);
        let now = Instant::now();

        assert_eq!(
            check_cost_ceiling(&target, &usage, 10, now),
            Err(DenyReason::CostCeiling {
                window_cost: 95,
                request_cost: 10,
                limit: 100
            })
        );
        assert_eq!(check_cost_ceiling(&target, &usage, 5, now), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cost_ceiling_disabled() {
        let target = TargetConfig::unlimited("free");
        let usage = UsageState::new(10);
        assert_eq!(
            check_cost_ceiling(&target, &usage, u64::MAX, Instant::now()),
            Ok(())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_request_interval() {
        let target = TargetConfig {
            min_request_interval: Duration::from_millis(300),
            ..TargetConfig::unlimited("mrr")
        };
        let ledger = ledger_for(&target);
        ledger.record_success(&target.id, 0);

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(
            verdict(&target, &ledger, Instant::now()),
            Admission::Deny(DenyReason::MinRequestInterval {
                remaining: Duration::from_millis(200)
            })
        );

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(verdict(&target, &ledger, Instant::now()).is_admitted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_interval_ignores_failures() {
        let target = TargetConfig {
            success_interval: Duration::from_millis(500),
            ..TargetConfig::unlimited("sri")
        };
        let ledger = ledger_for(&target);
        ledger.record_failure(&target.id, ErrorClass::Other);
        assert!(verdict(&target, &ledger, Instant::now()).is_admitted());

        ledger.record_success(&target.id, 0);
        assert!(matches!(
            verdict(&target, &ledger, Instant::now()),
            Admission::Deny(DenyReason::SuccessInterval { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_429_cooldown_exact_duration() {
        let mut target = TargetConfig::unlimited("cool");
        target.cooldowns.too_many_requests = Duration::from_secs(60);
        let ledger = ledger_for(&target);
        ledger.record_failure(&target.id, ErrorClass::TooManyRequests);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(
            verdict(&target, &ledger, Instant::now()),
            Admission::Deny(DenyReason::Cooldown {
                class: ErrorClass::TooManyRequests,
                remaining: Duration::from_secs(1)
            })
        );

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(verdict(&target, &ledger, Instant::now()), Admission::Admit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_cooldown_never_expires() {
        let mut target = TargetConfig::unlimited("forever");
        target.cooldowns.too_many_requests = Duration::MAX;
        let ledger = ledger_for(&target);
        ledger.record_failure(&target.id, ErrorClass::TooManyRequests);

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(
            verdict(&target, &ledger, Instant::now()),
            Admission::Deny(DenyReason::Cooldown {
                class: ErrorClass::TooManyRequests,
                remaining: Duration::MAX
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_requests_count_toward_rpm() {
        let target = TargetConfig {
            rpm_limit: 2,
            ..TargetConfig::unlimited("rpm")
        };
        let ledger = ledger_for(&target);
        let now = Instant::now();
        ledger.record_success_at(&target.id, 0, now);
        let reservation = ledger.reserve_at(&target.id, now);

        assert_eq!(
            verdict(&target, &ledger, now),
            Admission::Deny(DenyReason::RequestsPerMinute { count: 2, limit: 2 })
        );
        drop(reservation);
        assert!(verdict(&target, &ledger, now).is_admitted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_cost_counts_toward_ceiling() {
        let target = TargetConfig {
            tpm_limit: 100,
            ..TargetConfig::unlimited("tpm")
        };
        let ledger = ledger_for(&target);
        let now = Instant::now();
        let mut first = ledger.reserve_at(&target.id, now);
        first
            .claim_cost(60, |usage| check_cost_ceiling(&target, usage, 60, now))
            .unwrap();

        let mut second = ledger.reserve_at(&target.id, now);
        assert_eq!(
            second.claim_cost(60, |usage| check_cost_ceiling(&target, usage, 60, now)),
            Err(DenyReason::CostCeiling {
                window_cost: 60,
                request_cost: 60,
                limit: 100
            })
        );
        assert_eq!(ledger.snapshot(&target.id).pending_cost(), 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_has_no_cooldown() {
        let target = TargetConfig::new("transport");
        let ledger = ledger_for(&target);
        ledger.record_failure(&target.id, ErrorClass::Transport);
        assert_eq!(verdict(&target, &ledger, Instant::now()), Admission::Admit);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_cooldown_disables_class() {
        let mut target = TargetConfig::unlimited("nocool");
        target.cooldowns.service_unavailable = Duration::ZERO;
        let ledger = ledger_for(&target);
        ledger.record_failure(&target.id, ErrorClass::ServiceUnavailable);
        assert!(verdict(&target, &ledger, Instant::now()).is_admitted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rule_order_reports_first_violation() {
        let mut target = TargetConfig {
            rps_limit: 1.0,
            rpm_limit: 1,
            ..TargetConfig::unlimited("order")
        };
        target.cooldowns.forbidden = Duration::from_secs(15);
        let ledger = ledger_for(&target);
        ledger.record_success(&target.id, 0);
        ledger.record_failure(&target.id, ErrorClass::Forbidden);

        let reason = verdict(&target, &ledger, Instant::now()).reason().unwrap();
        assert_eq!(reason.constraint(), "rps_limit");
    }

    #[tokio::test(start_paused = true)]
    async fn test_verdict_is_idempotent() {
        let target = TargetConfig {
            rpm_limit: 2,
            ..TargetConfig::new("idem")
        };
        let ledger = ledger_for(&target);
        ledger.record_success(&target.id, 10);
        ledger.record_failure(&target.id, ErrorClass::BadGateway);

        let now = Instant::now();
        let first = verdict(&target, &ledger, now);
        for _ in 0..10 {
            assert_eq!(verdict(&target, &ledger, now), first);
        }
    }
}
