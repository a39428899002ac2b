// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Error types for placement optimization.

use thiserror::Error;

use crate::topology::DeviceId;

/// Result type for optimizer operations.
pub type Result<T> = std::result::Result<T, OptimizerError>;

/// Structural problems with a supplied topology.
///
/// Any of these aborts the call; no partially flattened topology is returned.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TopologyError {
    /// A node carries no level.
    #[error("topology node has no level")]
    MissingLevel,

    /// A top-level node is not at the level flattening starts from.
    #[error("top-level node at level {found}, expected level {expected}")]
    TopLevelMismatch {
        /// Level found on the node.
        found: u32,
        /// Level flattening starts from.
        expected: u32,
    },

    /// A child node is not strictly below its parent.
    #[error("node at level {found} is not below its parent at level {parent}")]
    NotBelowParent {
        /// Level found on the child.
        found: u32,
        /// Level of the parent.
        parent: u32,
    },

    /// A device leaf is not at the leaf level.
    #[error("device {id} is at level {level}, leaves must be at level {max_level}")]
    LeafLevelMismatch {
        /// Device identifier.
        id: DeviceId,
        /// Level of the leaf.
        level: u32,
        /// Required leaf level.
        max_level: u32,
    },

    /// A domain node reaches the leaf level without being a device.
    #[error("domain node at level {level} cannot hold children at or past leaf level {max_level}")]
    DomainAtLeafLevel {
        /// Level of the domain node.
        level: u32,
        /// Leaf level.
        max_level: u32,
    },

    /// A device leaf has no weight.
    #[error("device {0} has no weight")]
    MissingWeight(DeviceId),

    /// A device weight is not usable.
    #[error("device {id} has invalid weight {weight}")]
    InvalidWeight {
        /// Device identifier.
        id: DeviceId,
        /// Offending weight.
        weight: f64,
    },

    /// The same device appears twice.
    #[error("device {0} appears more than once in the topology")]
    DuplicateDevice(DeviceId),

    /// The topology document could not be decoded.
    #[error("malformed topology document: {0}")]
    Malformed(String),
}

/// Failures of the linear program solver.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SolverError {
    /// The program has no feasible point even after every relaxation.
    #[error("no feasible placement")]
    Infeasible,

    /// The solver failed for numerical or internal reasons.
    #[error("solver failure: {0}")]
    Numerical(String),
}

/// Errors returned by the optimizer entry points.
#[derive(Debug, Error)]
pub enum OptimizerError {
    /// Malformed topology.
    #[error("invalid topology: {0}")]
    Topology(#[from] TopologyError),

    /// Solver failure.
    #[error(transparent)]
    Solver(#[from] SolverError),

    /// Options that cannot describe a placement.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// The solve did not finish in time.
    #[error("solver timed out after {timeout_ms}ms")]
    SolverTimeout {
        /// Configured timeout.
        timeout_ms: u64,
    },

    /// The worker running the optimization failed.
    #[error("internal error: {0}")]
    Internal(String),
}

impl OptimizerError {
    /// Create an invalid options error.
    pub fn invalid_options(message: impl Into<String>) -> Self {
        Self::InvalidOptions(message.into())
    }

    /// Returns true if retrying, possibly with a relaxed configuration, may succeed.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::SolverTimeout { .. } | Self::Solver(SolverError::Numerical(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TopologyError::LeafLevelMismatch { id: 7, level: 2, max_level: 3 };
        assert!(err.to_string().contains("device 7"));
        assert!(err.to_string().contains("level 3"));

        let err = OptimizerError::from(SolverError::Infeasible);
        assert_eq!(err.to_string(), "no feasible placement");
    }

    #[test]
    fn test_recoverable() {
        assert!(OptimizerError::SolverTimeout { timeout_ms: 10 }.is_recoverable());
        assert!(OptimizerError::from(SolverError::Numerical("nan".into())).is_recoverable());
        assert!(!OptimizerError::from(SolverError::Infeasible).is_recoverable());
        assert!(!OptimizerError::from(TopologyError::MissingLevel).is_recoverable());
        assert!(!OptimizerError::invalid_options("pg_size").is_recoverable());
    }
}
