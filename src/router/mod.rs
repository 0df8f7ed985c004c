//! Target selection and admission control.
//!
//! This module decides which backend target a request goes to:
//! - `registry`: the configured targets
//! - `ledger`: per-target request, cost and error bookkeeping
//! - `gate`: whether a target may take a request right now
//! - `selector`: the selection algorithms
//! - `cost`: request cost estimation

pub mod cost;
pub mod gate;
pub mod ledger;
mod registry;
pub mod selector;

pub use cost::{CharEstimator, CostEstimator};
pub use gate::{Admission, DenyReason, RATE_WINDOW};
pub use ledger::{BoundedHistory, ErrorClass, Reservation, UsageLedger, UsageState};
pub use registry::{validate_targets, TargetRegistry};
pub use selector::{Algorithm, SelectionOutcome, SelectionState, Selector};
