//! Registry of configured targets.

use std::collections::HashSet;
use std::sync::Arc;

use crate::config::{ConfigError, TargetConfig};

/// Validate a target list: ids present and unique, weights positive.
pub fn validate_targets(targets: &[TargetConfig]) -> Result<(), ConfigError> {
    let mut seen = HashSet::with_capacity(targets.len());
    for (index, target) in targets.iter().enumerate() {
        if target.id.trim().is_empty() {
            return Err(ConfigError::MissingId { index });
        }
        if !seen.insert(target.id.as_str()) {
            return Err(ConfigError::DuplicateTarget(target.id.clone()));
        }
        if !target.weight.is_finite() || target.weight <= 0.0 {
            return Err(ConfigError::InvalidWeight {
                target: target.id.clone(),
                weight: target.weight,
            });
        }
        if target.max_retries == 0 {
            return Err(ConfigError::Validation(format!(
                "Target '{}' has max_retries = 0; at least one attempt is required",
                target.id
            )));
        }
    }
    Ok(())
}

/// Ordered, read-only set of targets.
///
/// Built once at startup; lookups need no locking.
#[derive(Debug, Clone)]
pub struct TargetRegistry {
    targets: Vec<Arc<TargetConfig>>,
}

impl TargetRegistry {
    pub fn new(targets: Vec<TargetConfig>) -> Result<Self, ConfigError> {
        validate_targets(&targets)?;
        Ok(Self {
            targets: targets.into_iter().map(Arc::new).collect(),
        })
    }

    /// Targets in configuration order.
    pub fn targets(&self) -> &[Arc<TargetConfig>] {
        &self.targets
    }

    pub fn get(&self, id: &str) -> Option<&Arc<TargetConfig>> {
        self.targets.iter().find(|t| t.id == id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.targets.iter().map(|t| t.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
