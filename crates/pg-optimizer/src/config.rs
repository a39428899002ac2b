// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Optimizer configuration.
//!
//! The configuration is an explicit value passed to every optimization, so
//! independent optimizations (for example for several clusters) can run side
//! by side with different settings.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OptimizerError, Result};

/// Tuning knobs for the placement optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Cap on a device's target as a multiple of its ideal share.
    /// One extra slot of rounding headroom is always added on top.
    pub slack_bound: f64,

    /// Relative widening of each domain's imbalance bound when re-optimizing
    /// after a topology change. Larger values trade balance for less movement.
    pub movement_tolerance: f64,

    /// How many slots of movement one unit of relative imbalance on the
    /// smallest device is worth. Values below 1.0 make the solver keep PGs in
    /// place whenever the tolerance allows.
    pub balance_weight: f64,

    /// Weight of the per-domain imbalance terms relative to the global bound.
    pub domain_balance_weight: f64,

    /// Fractional targets within this distance of an integer are snapped to it.
    pub rounding_epsilon: f64,

    /// Upper bound on a single optimization run by the async entry points.
    pub solver_timeout_ms: u64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            slack_bound: 1.1,
            movement_tolerance: 0.01,
            balance_weight: 0.5,
            domain_balance_weight: 0.001,
            rounding_epsilon: 1e-6,
            solver_timeout_ms: 30_000,
        }
    }
}

impl OptimizerConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            OptimizerError::invalid_options(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed or validated.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| OptimizerError::invalid_options(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every knob is in its usable range.
    ///
    /// # Errors
    ///
    /// Returns [`OptimizerError::InvalidOptions`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        if !(self.slack_bound.is_finite() && self.slack_bound >= 1.0) {
            return Err(OptimizerError::invalid_options("slack_bound must be >= 1.0"));
        }
        if !(self.movement_tolerance.is_finite() && self.movement_tolerance >= 0.0) {
            return Err(OptimizerError::invalid_options("movement_tolerance must be >= 0"));
        }
        if !(self.balance_weight.is_finite() && self.balance_weight > 0.0) {
            return Err(OptimizerError::invalid_options("balance_weight must be > 0"));
        }
        if !(self.domain_balance_weight.is_finite() && self.domain_balance_weight >= 0.0) {
            return Err(OptimizerError::invalid_options("domain_balance_weight must be >= 0"));
        }
        if !(self.rounding_epsilon > 0.0 && self.rounding_epsilon < 0.5) {
            return Err(OptimizerError::invalid_options("rounding_epsilon must be in (0, 0.5)"));
        }
        if self.solver_timeout_ms == 0 {
            return Err(OptimizerError::invalid_options("solver_timeout_ms must be > 0"));
        }
        Ok(())
    }

    /// Solver timeout as a [`Duration`].
    #[must_use]
    pub fn solver_timeout(&self) -> Duration {
        Duration::from_millis(self.solver_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = OptimizerConfig::default();
        assert_eq!(config.slack_bound, 1.1);
        assert_eq!(config.movement_tolerance, 0.01);
        assert_eq!(config.solver_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = OptimizerConfig::parse(
            r#"
            movement_tolerance = 0.05
            solver_timeout_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.movement_tolerance, 0.05);
        assert_eq!(config.solver_timeout_ms, 500);
        assert_eq!(config.slack_bound, 1.1);
    }

    #[test]
    fn test_parse_rejects_bad_values() {
        assert!(OptimizerConfig::parse("slack_bound = 0.5").is_err());
        assert!(OptimizerConfig::parse("balance_weight = 0.0").is_err());
        assert!(OptimizerConfig::parse("solver_timeout_ms = 0").is_err());
        assert!(OptimizerConfig::parse("slack_bound = \"wide\"").is_err());
    }
}
