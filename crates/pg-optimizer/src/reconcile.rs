// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Change re-optimization against a previous assignment.
//!
//! A reconciliation walks four stages and keeps no state across calls:
//!
//! ```text
//! Diff      map previous rows onto the new layout, count held slots
//! Target    balanced program, then a movement program boxed around it
//! Reassign  round with held counts as tie-break, rebuild rows keeping
//!           every previous device the quotas still allow
//! Finalize  rows plus the target they were built from
//! ```

use tracing::debug;

use crate::config::OptimizerConfig;
use crate::error::{Result, SolverError};
use crate::integerize::{round_targets, RowPlanner};
use crate::problem::{ChangeAnchor, ProblemBuilder, Relaxation};
use crate::solver::{solve_relaxed, FractionalTarget};
use crate::topology::{DeviceId, DeviceIdx, DeviceLayout};

/// Result of a reconciliation.
#[derive(Debug)]
pub(crate) struct Reconciled {
    /// New rows, one per PG.
    pub rows: Vec<Vec<DeviceIdx>>,
    /// Fractional target the rows were rounded from.
    pub target: FractionalTarget,
    /// PGs whose rows differ from the previous ones.
    pub touched: usize,
}

/// Previous assignment projected onto the current layout.
#[derive(Debug)]
struct Diff {
    /// Previous rows, truncated to `pg_size`. Replicas on devices that are
    /// gone (or repeated within a row) are `None`.
    rows: Vec<Vec<Option<DeviceIdx>>>,
    /// Slots each device held.
    held: Vec<usize>,
    /// Replicas that must move no matter what.
    invalid: usize,
}

/// Re-optimizes an assignment after a topology change.
pub(crate) struct ChangeReconciler<'a> {
    layout: &'a DeviceLayout,
    config: &'a OptimizerConfig,
    pg_size: usize,
    pg_count: usize,
}

impl<'a> ChangeReconciler<'a> {
    pub(crate) fn new(
        layout: &'a DeviceLayout,
        config: &'a OptimizerConfig,
        pg_size: usize,
        pg_count: usize,
    ) -> Self {
        Self { layout, config, pg_size, pg_count }
    }

    /// Compute new rows for `prev_pgs` on the current layout.
    ///
    /// PGs beyond `prev_pgs.len()` start empty; previous PGs beyond
    /// `pg_count` are dropped.
    pub(crate) fn reconcile(&self, prev_pgs: &[Vec<DeviceId>]) -> Result<Reconciled> {
        let builder = ProblemBuilder::new(self.layout, self.pg_size, self.pg_count, self.config);

        let diff = self.diff(prev_pgs);
        let target = self.target(&builder, &diff)?;
        let rows = self.reassign(&builder, &diff, &target)?;

        let touched = rows
            .iter()
            .zip(&diff.rows)
            .filter(|(new, old)| {
                new.len() != old.len() || new.iter().zip(old.iter()).any(|(&n, &o)| Some(n) != o)
            })
            .count();
        debug!(
            pg_count = self.pg_count,
            invalid_replicas = diff.invalid,
            touched,
            relaxation = ?target.relaxation,
            objective = target.objective,
            "Reconciled placement"
        );
        Ok(Reconciled { rows, target, touched })
    }

    fn diff(&self, prev_pgs: &[Vec<DeviceId>]) -> Diff {
        let mut held = vec![0; self.layout.device_count()];
        let mut invalid = 0;
        let rows = (0..self.pg_count)
            .map(|pg| {
                let Some(prev) = prev_pgs.get(pg) else {
                    return Vec::new();
                };
                let mut row = Vec::with_capacity(self.pg_size);
                for &id in prev.iter().take(self.pg_size) {
                    match self.layout.lookup(id) {
                        Some(d) if !row.contains(&Some(d)) => {
                            held[d] += 1;
                            row.push(Some(d));
                        }
                        _ => {
                            invalid += 1;
                            row.push(None);
                        }
                    }
                }
                row
            })
            .collect();
        Diff { rows, held, invalid }
    }

    fn target(
        &self,
        builder: &ProblemBuilder<'_>,
        diff: &Diff,
    ) -> std::result::Result<FractionalTarget, SolverError> {
        let balanced = solve_relaxed(Relaxation::Strict, |r| builder.initial(r))?;
        let anchor =
            ChangeAnchor { domain_imbalance: &balanced.domain_imbalance, previous: &diff.held };
        solve_relaxed(balanced.relaxation, |r| builder.change(r, &anchor))
    }

    fn reassign(
        &self,
        builder: &ProblemBuilder<'_>,
        diff: &Diff,
        target: &FractionalTarget,
    ) -> Result<Vec<Vec<DeviceIdx>>> {
        let limit = builder.domain_limit(target.relaxation);
        let quotas = round_targets(
            self.layout,
            &target.targets,
            self.pg_count,
            self.pg_count * self.pg_size,
            limit,
            self.config.rounding_epsilon,
            Some(diff.held.as_slice()),
        );
        let mut planner = RowPlanner::new(self.layout, quotas, self.pg_size, self.pg_count, limit);
        planner.expect_keeps(&diff.rows);
        diff.rows.iter().map(|prev| planner.next_row(prev)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integerize::integerize;
    use crate::solver::solve;
    use crate::topology::OsdTree;

    fn tree(hosts: usize, per_host: usize) -> OsdTree {
        let mut tree = OsdTree::new();
        for h in 0..hosts {
            for i in 0..per_host {
                tree.insert_device(format!("host{h}"), (h * per_host + i) as DeviceId, 1.0).unwrap();
            }
        }
        tree
    }

    fn initial(layout: &DeviceLayout, pg_size: usize, pg_count: usize) -> Vec<Vec<DeviceId>> {
        let config = OptimizerConfig::default();
        let builder = ProblemBuilder::new(layout, pg_size, pg_count, &config);
        let target = solve(builder.initial(Relaxation::Strict)).unwrap();
        integerize(layout, &target.targets, pg_size, pg_count, 1, config.rounding_epsilon)
            .unwrap()
            .into_iter()
            .map(|row| row.into_iter().map(|d| layout.id(d)).collect())
            .collect()
    }

    fn to_ids(layout: &DeviceLayout, rows: &[Vec<DeviceIdx>]) -> Vec<Vec<DeviceId>> {
        rows.iter().map(|row| row.iter().map(|&d| layout.id(d)).collect()).collect()
    }

    #[test]
    fn test_unchanged_topology_keeps_everything() {
        let layout = DeviceLayout::new(&tree(4, 3));
        let prev = initial(&layout, 3, 128);
        let config = OptimizerConfig::default();

        let reconciled = ChangeReconciler::new(&layout, &config, 3, 128).reconcile(&prev).unwrap();
        assert_eq!(reconciled.touched, 0);
        assert_eq!(to_ids(&layout, &reconciled.rows), prev);
    }

    #[test]
    fn test_removed_device_replicas_are_replaced() {
        let before = tree(4, 3);
        let prev = initial(&DeviceLayout::new(&before), 3, 128);

        let mut after = before.clone();
        after.remove_device(0);
        let layout = DeviceLayout::new(&after);
        let config = OptimizerConfig::default();
        let reconciled = ChangeReconciler::new(&layout, &config, 3, 128).reconcile(&prev).unwrap();

        let rows = to_ids(&layout, &reconciled.rows);
        let had_device: usize = prev.iter().filter(|row| row.contains(&0)).count();
        assert!(rows.iter().all(|row| !row.contains(&0)));
        assert!(reconciled.touched >= had_device);
        for (new, old) in rows.iter().zip(&prev) {
            for (slot, id) in old.iter().enumerate() {
                if *id != 0 && new.contains(id) {
                    assert_eq!(new[slot], *id, "kept replica changed slot");
                }
            }
        }
    }

    #[test]
    fn test_pg_count_override() {
        let layout = DeviceLayout::new(&tree(3, 2));
        let prev = initial(&layout, 3, 16);
        let config = OptimizerConfig::default();

        let grown = ChangeReconciler::new(&layout, &config, 3, 32).reconcile(&prev).unwrap();
        assert_eq!(grown.rows.len(), 32);
        assert!(grown.rows.iter().all(|row| row.len() == 3));

        let shrunk = ChangeReconciler::new(&layout, &config, 3, 8).reconcile(&prev).unwrap();
        assert_eq!(shrunk.rows.len(), 8);
    }
}
