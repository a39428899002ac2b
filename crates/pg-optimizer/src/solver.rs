// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Solving placement programs.
//!
//! The simplex solver is deterministic: identical programs (same variables in
//! the same order) yield identical solutions, which the change reconciler
//! relies on to avoid spurious movement.

use std::collections::BTreeMap;
use std::time::Instant;

use metrics::histogram;
use tracing::{debug, warn};

use crate::error::SolverError;
use crate::problem::{LpProblem, Relaxation};
use crate::topology::{DeviceId, DeviceLayout};

/// Continuous solution of a placement program.
#[derive(Debug, Clone)]
pub(crate) struct FractionalTarget {
    /// Desired slot count per device, in layout order.
    pub targets: Vec<f64>,
    /// Relative imbalance reached in each domain.
    pub domain_imbalance: Vec<f64>,
    /// Largest relative imbalance of any device.
    pub imbalance: f64,
    /// Objective value of the program.
    pub objective: f64,
    /// Relaxation the program was solved under.
    pub relaxation: Relaxation,
}

impl FractionalTarget {
    /// Targets keyed by device id.
    pub(crate) fn by_device(&self, layout: &DeviceLayout) -> BTreeMap<DeviceId, f64> {
        self.targets.iter().enumerate().map(|(d, &target)| (layout.id(d), target)).collect()
    }
}

/// Solve a single program.
pub(crate) fn solve(lp: LpProblem) -> Result<FractionalTarget, SolverError> {
    let started = Instant::now();
    let solution = lp.problem.solve().map_err(|e| match e {
        microlp::Error::Infeasible => SolverError::Infeasible,
        other => SolverError::Numerical(other.to_string()),
    })?;
    let elapsed = started.elapsed();
    histogram!("pgopt_solve_duration_seconds").record(elapsed.as_secs_f64());

    let targets: Vec<f64> = lp.x.iter().map(|&x| solution[x].max(0.0)).collect();
    if targets.iter().any(|t| !t.is_finite()) {
        return Err(SolverError::Numerical("non-finite device target".into()));
    }
    let domain_imbalance = lp.t_domain.iter().map(|&t| solution[t].max(0.0)).collect();
    let imbalance = solution[lp.t].max(0.0);
    let objective = solution.objective();

    debug!(
        variables = lp.x.len() + lp.t_domain.len() + lp.kept.len() + 1,
        relaxation = ?lp.relaxation,
        imbalance,
        objective,
        elapsed_us = elapsed.as_micros() as u64,
        "Solved placement program"
    );

    Ok(FractionalTarget {
        targets,
        domain_imbalance,
        imbalance,
        objective,
        relaxation: lp.relaxation,
    })
}

/// Solve, loosening the program one relaxation step at a time while it is
/// infeasible.
pub(crate) fn solve_relaxed<F>(start: Relaxation, build: F) -> Result<FractionalTarget, SolverError>
where
    F: Fn(Relaxation) -> LpProblem,
{
    let mut relaxation = start;
    loop {
        match solve(build(relaxation)) {
            Err(SolverError::Infeasible) => match relaxation.next() {
                Some(next) => {
                    warn!(from = ?relaxation, to = ?next, "Placement program infeasible, relaxing");
                    relaxation = next;
                }
                None => return Err(SolverError::Infeasible),
            },
            other => return other,
        }
    }
}
