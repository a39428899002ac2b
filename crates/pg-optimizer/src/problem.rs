// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Linear program construction.
//!
//! Each usable device gets a variable `x_d`: its share of the
//! `pg_count * pg_size` replica slots. Imbalance is measured relative to the
//! device's ideal proportional share `ideal_d = slots * w_d / W`:
//!
//! ```text
//! |x_d - ideal_d| <= t_D * ideal_d     for every device d in domain D
//! t_D <= t
//! sum(x_d) = slots
//! sum(x_d for d in D) <= domain_limit * pg_count
//! 0 <= x_d <= pg_count
//! ```
//!
//! Initial placement minimizes `t + eps * sum(t_D)`. Change re-optimization
//! boxes each `x_d` around the balanced optimum and minimizes the slots that
//! cannot stay on the device they occupied before.

use microlp::{ComparisonOp, LinearExpr, OptimizationDirection, Problem, Variable};
use serde::{Deserialize, Serialize};

use crate::config::OptimizerConfig;
use crate::topology::DeviceLayout;

/// How far the program was relaxed to stay feasible.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relaxation {
    /// All constraints in force.
    #[default]
    Strict,
    /// The per-device slack cap was dropped.
    WithoutSlack,
    /// Failure-domain caps were dropped as well.
    WithoutDomainSeparation,
}

impl Relaxation {
    /// The next, looser level, if any.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Strict => Some(Self::WithoutSlack),
            Self::WithoutSlack => Some(Self::WithoutDomainSeparation),
            Self::WithoutDomainSeparation => None,
        }
    }
}

/// Why no placement can be computed at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum Infeasibility {
    /// The topology has no device with positive weight.
    NoDevices,
    /// Fewer usable devices than replicas per PG.
    TooFewDevices {
        /// Replicas per PG.
        needed: usize,
        /// Usable devices.
        available: usize,
    },
}

impl std::fmt::Display for Infeasibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoDevices => write!(f, "no device with positive weight"),
            Self::TooFewDevices { needed, available } => {
                write!(f, "not enough devices: need {needed}, have {available}")
            }
        }
    }
}

/// Check whether any placement is possible on this layout.
pub(crate) fn check_capacity(layout: &DeviceLayout, pg_size: usize) -> Option<Infeasibility> {
    if layout.device_count() == 0 || layout.total_weight() <= 0.0 {
        return Some(Infeasibility::NoDevices);
    }
    if layout.device_count() < pg_size {
        return Some(Infeasibility::TooFewDevices {
            needed: pg_size,
            available: layout.device_count(),
        });
    }
    None
}

/// Balanced solution an incremental program is anchored to.
#[derive(Debug, Clone)]
pub(crate) struct ChangeAnchor<'a> {
    /// Per-domain imbalance reached by the balanced program.
    pub domain_imbalance: &'a [f64],
    /// Slots each device held in the previous assignment.
    pub previous: &'a [usize],
}

/// A built program together with the handles needed to read a solution.
pub(crate) struct LpProblem {
    pub problem: Problem,
    pub x: Vec<Variable>,
    pub t_domain: Vec<Variable>,
    pub t: Variable,
    pub kept: Vec<Variable>,
    pub relaxation: Relaxation,
}

/// Translates a device layout into linear programs.
pub(crate) struct ProblemBuilder<'a> {
    layout: &'a DeviceLayout,
    config: &'a OptimizerConfig,
    pg_count: usize,
    slots: f64,
    ideal: Vec<f64>,
    domain_limit: usize,
}

impl<'a> ProblemBuilder<'a> {
    /// Create a builder. The layout must have passed [`check_capacity`].
    pub(crate) fn new(
        layout: &'a DeviceLayout,
        pg_size: usize,
        pg_count: usize,
        config: &'a OptimizerConfig,
    ) -> Self {
        let slots = (pg_count * pg_size) as f64;
        let total_weight = layout.total_weight();
        let ideal = (0..layout.device_count())
            .map(|d| slots * layout.weight(d) / total_weight)
            .collect();
        let domains = layout.domain_count().max(1);
        let domain_limit = if domains >= pg_size { 1 } else { pg_size.div_ceil(domains) };
        Self { layout, config, pg_count, slots, ideal, domain_limit }
    }

    /// Ideal proportional share of every device.
    #[cfg(test)]
    pub(crate) fn ideal(&self) -> &[f64] {
        &self.ideal
    }

    /// Returns true if there are fewer domains than replicas per PG.
    pub(crate) fn is_degraded(&self) -> bool {
        self.domain_limit > 1
    }

    /// Replicas of one PG a domain may hold under the given relaxation.
    pub(crate) fn domain_limit(&self, relaxation: Relaxation) -> usize {
        match relaxation {
            Relaxation::WithoutDomainSeparation => usize::MAX,
            _ => self.domain_limit,
        }
    }

    /// Program for placement from scratch.
    pub(crate) fn initial(&self, relaxation: Relaxation) -> LpProblem {
        let mut problem = Problem::new(OptimizationDirection::Minimize);
        let pg_count = self.pg_count as f64;

        let x = (0..self.layout.device_count())
            .map(|d| {
                let mut upper = pg_count;
                if relaxation == Relaxation::Strict {
                    upper = upper.min(self.ideal[d] * self.config.slack_bound + 1.0);
                }
                problem.add_var(0.0, (0.0, upper))
            })
            .collect();
        let t_domain = (0..self.layout.domain_count())
            .map(|_| problem.add_var(self.config.domain_balance_weight, (0.0, f64::INFINITY)))
            .collect();
        let t = problem.add_var(1.0, (0.0, f64::INFINITY));

        let mut lp = LpProblem { problem, x, t_domain, t, kept: Vec::new(), relaxation };
        self.add_balance_constraints(&mut lp);
        lp
    }

    /// Program for re-optimization after a topology change.
    ///
    /// Every device is boxed to the integers around the balanced optimum,
    /// widened by the movement tolerance, and the objective counts previous
    /// slots that cannot be kept.
    pub(crate) fn change(&self, relaxation: Relaxation, anchor: &ChangeAnchor<'_>) -> LpProblem {
        let mut problem = Problem::new(OptimizationDirection::Minimize);
        let pg_count = self.pg_count as f64;
        let tolerance = self.config.movement_tolerance;

        let x = (0..self.layout.device_count())
            .map(|d| {
                let bound = anchor.domain_imbalance[self.layout.domain_of(d)] + tolerance;
                let ideal = self.ideal[d];
                let lower = ((ideal * (1.0 - bound)).ceil() - 1.0).max(0.0);
                let upper = ((ideal * (1.0 + bound)).floor() + 1.0).min(pg_count);
                problem.add_var(0.0, (lower.min(upper), upper))
            })
            .collect::<Vec<_>>();

        let smallest_ideal = self.ideal.iter().copied().fold(f64::INFINITY, f64::min);
        let balance = self.config.balance_weight * smallest_ideal;
        let t_domain = (0..self.layout.domain_count())
            .map(|_| {
                problem.add_var(balance * self.config.domain_balance_weight, (0.0, f64::INFINITY))
            })
            .collect();
        let t = problem.add_var(balance, (0.0, f64::INFINITY));

        let kept = anchor
            .previous
            .iter()
            .zip(&x)
            .map(|(&previous, &x_d)| {
                let k = problem.add_var(-1.0, (0.0, previous as f64));
                problem.add_constraint(&[(k, 1.0), (x_d, -1.0)], ComparisonOp::Le, 0.0);
                k
            })
            .collect();

        let mut lp = LpProblem { problem, x, t_domain, t, kept, relaxation };
        self.add_balance_constraints(&mut lp);
        lp
    }

    fn add_balance_constraints(&self, lp: &mut LpProblem) {
        let mut total = LinearExpr::empty();
        for &x_d in &lp.x {
            total.add(x_d, 1.0);
        }
        lp.problem.add_constraint(total, ComparisonOp::Eq, self.slots);

        let limit = self.domain_limit(lp.relaxation);
        if limit < usize::MAX {
            let cap = (limit * self.pg_count) as f64;
            for domain in 0..self.layout.domain_count() {
                let members = self.layout.domain_devices(domain);
                if members.len() as f64 * self.pg_count as f64 <= cap {
                    continue;
                }
                let mut sum = LinearExpr::empty();
                for &d in members {
                    sum.add(lp.x[d], 1.0);
                }
                lp.problem.add_constraint(sum, ComparisonOp::Le, cap);
            }
        }

        for (d, &x_d) in lp.x.iter().enumerate() {
            let ideal = self.ideal[d];
            let t_d = lp.t_domain[self.layout.domain_of(d)];
            lp.problem.add_constraint(&[(x_d, 1.0), (t_d, -ideal)], ComparisonOp::Le, ideal);
            lp.problem.add_constraint(&[(x_d, 1.0), (t_d, ideal)], ComparisonOp::Ge, ideal);
        }
        for &t_d in &lp.t_domain {
            lp.problem.add_constraint(&[(t_d, 1.0), (lp.t, -1.0)], ComparisonOp::Le, 0.0);
        }
    }
}
