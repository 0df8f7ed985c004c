//! Request dispatch: selection, admission, delivery.
//!
//! The [`Dispatcher`] owns every piece of shared state a request touches:
//! the target registry, the usage ledger, the selector cursor, the delivery
//! limiter and the transport. Handlers hold it behind an `Arc`.

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::retry::{retry_with_backoff, AttemptRecord, Classify, RetryError, RetryPolicy};
use super::transport::{BackendTransport, OutboundRequest, TransportError};
use crate::config::{BalancerConfig, TargetConfig};
use crate::error::{Error, Result};
use crate::router::{
    gate, Admission, CharEstimator, CostEstimator, DenyReason, ErrorClass, Reservation,
    SelectionOutcome, SelectionState, Selector, TargetRegistry, UsageLedger, RATE_WINDOW,
};

/// Selection attempts before a round reports "no target".
pub const SELECTION_ATTEMPTS: u32 = 3;
/// Pause between selection attempts within one round.
pub const SELECTION_RETRY_DELAY: Duration = Duration::from_millis(100);
/// Pause between rounds while no target is available.
pub const NO_TARGET_WAIT: Duration = Duration::from_secs(1);

/// A successful delivery.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Target that served the request
    pub target: Arc<TargetConfig>,
    /// Parsed response body
    pub body: Value,
    /// Failed attempts that preceded the success
    pub attempts: Vec<AttemptRecord>,
    /// Estimated cost recorded against the target
    pub cost: u64,
}

/// A target the gate admitted, with the reservation that keeps its slot.
#[derive(Debug)]
pub struct Admitted {
    target: Arc<TargetConfig>,
    reservation: Reservation,
}

impl Admitted {
    pub fn target(&self) -> &Arc<TargetConfig> {
        &self.target
    }
}

/// Point-in-time view of one target, for the `/targets` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct TargetStatus {
    pub id: String,
    pub endpoint: String,
    pub model: String,
    pub weight: f64,
    pub requests_last_minute: usize,
    pub cost_last_minute: u64,
    pub in_flight: usize,
    pub successes: u64,
    pub failures: u64,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Failure of a single delivery attempt.
#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("{0}")]
    Transport(#[from] TransportError),
}

impl Classify for AttemptError {
    fn error_class(&self) -> ErrorClass {
        match self {
            AttemptError::Status { status, .. } => ErrorClass::from_status(*status),
            AttemptError::Transport(_) => ErrorClass::Transport,
        }
    }
}

/// A 200 reply. A malformed body ends the retry loop without counting as
/// a failed attempt.
#[derive(Debug)]
enum Completion {
    Body(Value),
    Malformed(String),
}

/// Routes requests to admitted targets and delivers them.
pub struct Dispatcher {
    registry: Arc<TargetRegistry>,
    ledger: Arc<UsageLedger>,
    selector: Selector,
    selection: Mutex<SelectionState>,
    limiter: Arc<Semaphore>,
    transport: Arc<dyn BackendTransport>,
    estimator: Arc<dyn CostEstimator>,
    max_wait: Duration,
    probe_timeout: Duration,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("targets", &self.registry.len())
            .field("algorithm", &self.selector.algorithm())
            .field("max_wait", &self.max_wait)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        registry: TargetRegistry,
        balancer: &BalancerConfig,
        transport: Arc<dyn BackendTransport>,
    ) -> Self {
        let ledger = UsageLedger::new(registry.ids(), balancer.history_capacity);
        Self {
            registry: Arc::new(registry),
            ledger: Arc::new(ledger),
            selector: Selector::new(balancer.algorithm),
            selection: Mutex::new(SelectionState::default()),
            limiter: Arc::new(Semaphore::new(balancer.concurrency_limit.max(1))),
            transport,
            estimator: Arc::new(CharEstimator::default()),
            max_wait: balancer.max_wait,
            probe_timeout: balancer.probe_timeout,
        }
    }

    /// Replace the default character-based cost estimator.
    pub fn with_cost_estimator(mut self, estimator: Arc<dyn CostEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn registry(&self) -> &TargetRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }

    pub fn selector(&self) -> Selector {
        self.selector
    }

    /// Permits currently free in the delivery limiter.
    pub fn available_permits(&self) -> usize {
        self.limiter.available_permits()
    }

    /// Route one chat-completion payload to an admitted target.
    pub async fn process_request(
        &self,
        request: &Value,
        cancel: &CancellationToken,
    ) -> Result<Delivery> {
        self.process_request_tracked(request, cancel, Arc::new(Mutex::new(Vec::new())))
            .await
    }

    /// Like [`Dispatcher::process_request`], with failed attempts pushed into
    /// a caller-owned vec that outlives a cancelled future.
    pub async fn process_request_tracked(
        &self,
        request: &Value,
        cancel: &CancellationToken,
        attempts: Arc<Mutex<Vec<AttemptRecord>>>,
    ) -> Result<Delivery> {
        if !request.is_object() {
            return Err(Error::BadRequest(
                "request body must be a JSON object".to_string(),
            ));
        }
        if self.registry.is_empty() {
            tracing::warn!("No targets configured, refusing request");
            return Err(Error::NoTargetAvailable {
                waited: Duration::ZERO,
            });
        }

        let mut waited = Duration::ZERO;
        loop {
            let selected = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                selected = self.select_admitted_target() => selected,
            };

            if let Some(admitted) = selected {
                return self
                    .deliver_tracked(admitted, request, cancel, attempts)
                    .await;
            }

            if waited >= self.max_wait {
                tracing::warn!(waited_ms = waited.as_millis() as u64, "No target became available");
                return Err(Error::NoTargetAvailable { waited });
            }

            let pause = NO_TARGET_WAIT.min(self.max_wait - waited);
            tracing::debug!(
                waited_ms = waited.as_millis() as u64,
                pause_ms = pause.as_millis() as u64,
                "All targets busy, waiting"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(pause) => {}
            }
            waited += pause;
        }
    }

    /// Try up to [`SELECTION_ATTEMPTS`] times to find a target the gate admits.
    ///
    /// The admitted target has its admission recorded and a pending request
    /// reserved before this returns.
    pub async fn select_admitted_target(&self) -> Option<Admitted> {
        for attempt in 1..=SELECTION_ATTEMPTS {
            let latencies = if self.selector.needs_probe() {
                Some(self.probe_latencies().await)
            } else {
                None
            };

            match self.try_select(latencies.as_deref()) {
                SelectionOutcome::Admitted {
                    target,
                    reservation,
                } => {
                    tracing::info!(
                        target_id = %target.id,
                        algorithm = %self.selector.algorithm(),
                        attempt,
                        "Selected target"
                    );
                    return Some(Admitted {
                        target,
                        reservation,
                    });
                }
                SelectionOutcome::Denied { target, reason } => {
                    tracing::debug!(
                        target_id = %target.id,
                        constraint = reason.constraint(),
                        reason = %reason,
                        attempt,
                        "Target not available"
                    );
                }
                SelectionOutcome::NoCandidate => return None,
            }

            if attempt < SELECTION_ATTEMPTS {
                tokio::time::sleep(SELECTION_RETRY_DELAY).await;
            }
        }
        None
    }

    /// One select → gate → admit pass inside the selection critical section.
    pub fn try_select(&self, latencies: Option<&[Option<Duration>]>) -> SelectionOutcome {
        let mut state = self.selection.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();

        let Some(target) = self.selector.select(
            &mut state,
            self.registry.targets(),
            &self.ledger,
            latencies,
            now,
            &mut rand::thread_rng(),
        ) else {
            return SelectionOutcome::NoCandidate;
        };

        match gate::is_available(&target, &self.ledger, now) {
            Admission::Admit => {
                let reservation = self.ledger.reserve_at(&target.id, now);
                SelectionOutcome::Admitted {
                    target,
                    reservation,
                }
            }
            Admission::Deny(reason) => SelectionOutcome::Denied { target, reason },
        }
    }

    /// Probe every target concurrently; failures and timeouts yield `None`.
    pub async fn probe_latencies(&self) -> Vec<Option<Duration>> {
        let probes = self.registry.targets().iter().map(|target| async move {
            let start = Instant::now();
            match tokio::time::timeout(self.probe_timeout, self.transport.probe(target.probe_url()))
                .await
            {
                Ok(Ok(())) => Some(start.elapsed()),
                Ok(Err(e)) => {
                    tracing::debug!(target_id = %target.id, error = %e, "Liveness probe failed");
                    None
                }
                Err(_) => {
                    tracing::debug!(target_id = %target.id, "Liveness probe timed out");
                    None
                }
            }
        });
        futures::future::join_all(probes).await
    }

    /// Deliver `request` to a target returned by
    /// [`Dispatcher::select_admitted_target`].
    ///
    /// The request's estimated cost is checked against the target's cost
    /// ceiling before anything is sent.
    pub async fn deliver(
        &self,
        admitted: Admitted,
        request: &Value,
        cancel: &CancellationToken,
    ) -> Result<Delivery> {
        self.deliver_tracked(admitted, request, cancel, Arc::new(Mutex::new(Vec::new())))
            .await
    }

    /// Current usage and gate verdict for every target.
    pub fn target_statuses(&self) -> Vec<TargetStatus> {
        let now = Instant::now();
        self.registry
            .targets()
            .iter()
            .map(|target| {
                self.ledger.with_state(&target.id, |usage| {
                    let verdict = gate::check(target, usage, now);
                    TargetStatus {
                        id: target.id.clone(),
                        endpoint: target.endpoint(),
                        model: target.model.clone(),
                        weight: target.weight,
                        requests_last_minute: usage.count_in_window(RATE_WINDOW, now),
                        cost_last_minute: usage.cost_in_window(RATE_WINDOW, now),
                        in_flight: usage.pending_requests(),
                        successes: usage.successes(),
                        failures: usage.failures(),
                        available: verdict.is_admitted(),
                        blocked_by: verdict.reason().map(|r| r.constraint().to_string()),
                        reason: verdict.reason().map(|r| r.to_string()),
                    }
                })
            })
            .collect()
    }

    async fn deliver_tracked(
        &self,
        admitted: Admitted,
        request: &Value,
        cancel: &CancellationToken,
        attempts: Arc<Mutex<Vec<AttemptRecord>>>,
    ) -> Result<Delivery> {
        let Admitted {
            target,
            mut reservation,
        } = admitted;

        let prepared = build_request(&target, request).and_then(|outbound| {
            let cost = self.estimator.estimate(&outbound.payload);
            claim_cost(&target, &mut reservation, cost).map(|()| outbound)
        });
        let outbound = match prepared {
            Ok(outbound) => outbound,
            Err(e) => {
                // Nothing was sent, so the slot goes back to the target.
                reservation.revoke();
                return Err(e);
            }
        };

        self.send_with_retries(target, Arc::new(reservation), outbound, cancel, attempts)
            .await
    }

    async fn send_with_retries(
        &self,
        target: Arc<TargetConfig>,
        reservation: Arc<Reservation>,
        outbound: OutboundRequest,
        cancel: &CancellationToken,
        attempts: Arc<Mutex<Vec<AttemptRecord>>>,
    ) -> Result<Delivery> {
        let cost = reservation.cost();
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            permit = self.limiter.clone().acquire_owned() => permit
                .map_err(|_| Error::Internal("delivery limiter closed".to_string()))?,
        };
        let permit = Arc::new(permit);
        let outbound = Arc::new(outbound);

        tracing::debug!(
            target_id = %target.id,
            url = %outbound.url,
            cost,
            "Delivering request"
        );

        let policy = RetryPolicy::for_target(&target);
        let result = retry_with_backoff(&target.id, policy, attempts.clone(), cancel, |attempt| {
            let transport = self.transport.clone();
            let outbound = outbound.clone();
            let permit = permit.clone();
            let reservation = reservation.clone();
            async move {
                // The attempt records its own outcome, even if the caller
                // stops waiting for it.
                let task = tokio::spawn(async move {
                    let _permit = permit;
                    send_once(transport.as_ref(), &reservation, &outbound, attempt).await
                });
                task.await.unwrap_or_else(|e| {
                    Err(AttemptError::Transport(TransportError::Other(format!(
                        "delivery task failed: {}",
                        e
                    ))))
                })
            }
        })
        .await;

        let recorded = attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match result {
            Ok(Completion::Body(body)) => Ok(Delivery {
                target,
                body,
                attempts: recorded,
                cost,
            }),
            Ok(Completion::Malformed(message)) => Err(Error::InvalidResponse {
                target: target.id.clone(),
                message,
            }),
            Err(RetryError::Cancelled) => Err(Error::Cancelled),
            Err(RetryError::NonRetryable(AttemptError::Status { status, body })) => {
                Err(Error::NonRetryableUpstream {
                    target: target.id.clone(),
                    status,
                    body,
                })
            }
            Err(RetryError::NonRetryable(error)) => Err(Error::Internal(error.to_string())),
            Err(RetryError::Exhausted { error, attempts }) => Err(Error::DeliveryExhausted {
                target: target.id.clone(),
                attempts,
                last_error: error.to_string(),
            }),
        }
    }
}

/// Claim `cost` on the reservation, refusing when it would break the
/// target's cost ceiling.
fn claim_cost(target: &TargetConfig, reservation: &mut Reservation, cost: u64) -> Result<()> {
    let now = Instant::now();
    let verdict =
        reservation.claim_cost(cost, |usage| gate::check_cost_ceiling(target, usage, cost, now));

    match verdict {
        Ok(()) => Ok(()),
        Err(reason @ DenyReason::CostCeiling {
            window_cost,
            request_cost,
            limit,
        }) => {
            tracing::warn!(
                target_id = %target.id,
                constraint = reason.constraint(),
                reason = %reason,
                "Request refused by cost ceiling"
            );
            Err(Error::CostCeilingExceeded {
                target: target.id.clone(),
                window_cost,
                request_cost,
                limit,
            })
        }
        Err(other) => Err(Error::Internal(format!(
            "unexpected cost check result for target '{}': {}",
            target.id, other
        ))),
    }
}

/// Build the outbound request: endpoint, injected model, auth headers.
fn build_request(target: &TargetConfig, request: &Value) -> Result<OutboundRequest> {
    let mut payload = request.clone();
    let Some(object) = payload.as_object_mut() else {
        return Err(Error::BadRequest(
            "request body must be a JSON object".to_string(),
        ));
    };
    object.insert("model".to_string(), Value::String(target.model.clone()));

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    let user_agent = HeaderValue::from_str(&target.user_agent).map_err(|e| {
        Error::Internal(format!(
            "Target '{}' has an invalid user_agent: {}",
            target.id, e
        ))
    })?;
    headers.insert(USER_AGENT, user_agent);

    if let Some(api_key) = &target.api_key {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", api_key.expose_secret()))
            .map_err(|_| {
                Error::Internal(format!(
                    "Target '{}' has an API key that is not a valid header value",
                    target.id
                ))
            })?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }

    Ok(OutboundRequest {
        url: target.endpoint(),
        headers,
        payload,
    })
}

/// One transport call plus its ledger bookkeeping.
async fn send_once(
    transport: &dyn BackendTransport,
    reservation: &Reservation,
    request: &OutboundRequest,
    attempt: u32,
) -> std::result::Result<Completion, AttemptError> {
    let target = reservation.id();
    match transport.send(request).await {
        Ok(response) if response.status == 200 => {
            reservation.settle_success(Instant::now());
            match serde_json::from_str(&response.body) {
                Ok(body) => Ok(Completion::Body(body)),
                Err(e) => {
                    tracing::error!(target_id = %target, error = %e, "Target returned invalid JSON");
                    Ok(Completion::Malformed(e.to_string()))
                }
            }
        }
        Ok(response) => {
            let class = ErrorClass::from_status(response.status);
            reservation.record_failure(class);
            tracing::warn!(
                target_id = %target,
                status = response.status,
                class = %class,
                attempt,
                "Target returned error status"
            );
            Err(AttemptError::Status {
                status: response.status,
                body: response.body,
            })
        }
        Err(e) => {
            reservation.record_failure(ErrorClass::Transport);
            tracing::warn!(target_id = %target, error = %e, attempt, "Failed to reach target");
            Err(AttemptError::Transport(e))
        }
    }
}
