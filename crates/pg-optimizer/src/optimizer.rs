// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Optimizer entry points.
//!
//! [`Optimizer`] carries its configuration explicitly, so several
//! optimizations with different settings can run concurrently.

use std::time::Instant;

use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::OptimizerConfig;
use crate::error::{OptimizerError, Result};
use crate::integerize::integerize;
use crate::problem::{check_capacity, Infeasibility, ProblemBuilder, Relaxation};
use crate::reconcile::ChangeReconciler;
use crate::solver::{solve_relaxed, FractionalTarget};
use crate::stats::{PlacementStats, StatsCollector};
use crate::topology::{DeviceId, DeviceIdx, DeviceLayout, OsdTree, Topology};

/// Options for placement from scratch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialOptions {
    /// Weighted topology, flat or nested.
    pub osd_tree: Topology,
    /// Replicas per PG.
    #[serde(default = "default_pg_size")]
    pub pg_size: usize,
    /// Number of PGs.
    pub pg_count: usize,
}

/// Options for re-optimization after a topology change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeOptions {
    /// Previous assignment, one device list per PG.
    pub prev_pgs: Vec<Vec<DeviceId>>,
    /// New weighted topology, flat or nested.
    pub osd_tree: Topology,
    /// Replicas per PG.
    #[serde(default = "default_pg_size")]
    pub pg_size: usize,
    /// Number of PGs; defaults to `prev_pgs.len()`.
    #[serde(default)]
    pub pg_count: Option<usize>,
}

/// Replica count used when options leave `pg_size` out.
pub const DEFAULT_PG_SIZE: usize = 3;

fn default_pg_size() -> usize {
    DEFAULT_PG_SIZE
}

/// Assignment produced by an optimization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizeResult {
    /// Devices of every PG. All empty when no placement was possible.
    pub int_pgs: Vec<Vec<DeviceId>>,
    /// Statistics for the assignment.
    pub stats: PlacementStats,
}

/// PG placement optimizer.
#[derive(Debug, Clone, Default)]
pub struct Optimizer {
    config: OptimizerConfig,
}

impl Optimizer {
    /// Create an optimizer.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: OptimizerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Compute a placement from scratch.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid options, a malformed topology or a
    /// solver failure. Topologies that cannot hold any placement are not an
    /// error; see [`PlacementStats::infeasible`].
    pub fn optimize_initial(&self, options: InitialOptions) -> Result<OptimizeResult> {
        let InitialOptions { osd_tree, pg_size, pg_count } = options;
        validate_shape(pg_size, pg_count)?;
        let tree = osd_tree.into_flat()?;
        let layout = DeviceLayout::new(&tree);
        counter!("pgopt_optimizations_total", "mode" => "initial").increment(1);

        if let Some(reason) = check_capacity(&layout, pg_size) {
            return Ok(infeasible(&tree, pg_size, pg_count, None, reason));
        }

        let start = Instant::now();
        let builder = ProblemBuilder::new(&layout, pg_size, pg_count, &self.config);
        warn_if_degraded(&builder, &layout, pg_size);
        let target = solve_relaxed(Relaxation::Strict, |r| builder.initial(r))?;
        let rows = integerize(
            &layout,
            &target.targets,
            pg_size,
            pg_count,
            builder.domain_limit(target.relaxation),
            self.config.rounding_epsilon,
        )?;

        let int_pgs = to_ids(&layout, rows);
        let stats = finish(&tree, &layout, pg_size, &int_pgs, None, &target);
        info!(
            mode = "initial",
            devices = layout.device_count(),
            domains = layout.domain_count(),
            pg_count,
            pg_size,
            imbalance = stats.imbalance,
            degraded_pgs = stats.degraded_pgs.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Computed initial placement"
        );
        Ok(OptimizeResult { int_pgs, stats })
    }

    /// Recompute a placement after a topology change, moving as little as
    /// possible.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid options, a malformed topology or a
    /// solver failure.
    pub fn optimize_change(&self, options: ChangeOptions) -> Result<OptimizeResult> {
        let ChangeOptions { prev_pgs, osd_tree, pg_size, pg_count } = options;
        let pg_count = pg_count.unwrap_or(prev_pgs.len());
        validate_shape(pg_size, pg_count)?;
        let tree = osd_tree.into_flat()?;
        let layout = DeviceLayout::new(&tree);
        counter!("pgopt_optimizations_total", "mode" => "change").increment(1);

        if let Some(reason) = check_capacity(&layout, pg_size) {
            return Ok(infeasible(&tree, pg_size, pg_count, Some(prev_pgs.as_slice()), reason));
        }

        let start = Instant::now();
        let builder = ProblemBuilder::new(&layout, pg_size, pg_count, &self.config);
        warn_if_degraded(&builder, &layout, pg_size);
        let reconciled =
            ChangeReconciler::new(&layout, &self.config, pg_size, pg_count).reconcile(&prev_pgs)?;

        let int_pgs = to_ids(&layout, reconciled.rows);
        let prev = Some(prev_pgs.as_slice());
        let stats = finish(&tree, &layout, pg_size, &int_pgs, prev, &reconciled.target);
        counter!("pgopt_pgs_moved_total").increment(stats.moved_pgs as u64);
        info!(
            mode = "change",
            devices = layout.device_count(),
            domains = layout.domain_count(),
            pg_count,
            pg_size,
            moved_pgs = stats.moved_pgs,
            moved_slots = stats.moved_slots,
            touched = reconciled.touched,
            degraded_pgs = stats.degraded_pgs.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Computed changed placement"
        );
        Ok(OptimizeResult { int_pgs, stats })
    }

    /// [`Self::optimize_initial`] on the blocking pool, bounded by the
    /// configured solver timeout.
    ///
    /// # Errors
    ///
    /// As [`Self::optimize_initial`], plus [`OptimizerError::SolverTimeout`].
    pub async fn optimize_initial_async(&self, options: InitialOptions) -> Result<OptimizeResult> {
        let optimizer = self.clone();
        self.run_blocking(move || optimizer.optimize_initial(options)).await
    }

    /// [`Self::optimize_change`] on the blocking pool, bounded by the
    /// configured solver timeout.
    ///
    /// # Errors
    ///
    /// As [`Self::optimize_change`], plus [`OptimizerError::SolverTimeout`].
    pub async fn optimize_change_async(&self, options: ChangeOptions) -> Result<OptimizeResult> {
        let optimizer = self.clone();
        self.run_blocking(move || optimizer.optimize_change(options)).await
    }

    async fn run_blocking<F>(&self, job: F) -> Result<OptimizeResult>
    where
        F: FnOnce() -> Result<OptimizeResult> + Send + 'static,
    {
        let timeout = self.config.solver_timeout();
        match tokio::time::timeout(timeout, tokio::task::spawn_blocking(job)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(OptimizerError::Internal(format!("optimizer task failed: {e}"))),
            Err(_) => {
                warn!(timeout_ms = self.config.solver_timeout_ms, "Placement optimization timed out");
                Err(OptimizerError::SolverTimeout { timeout_ms: self.config.solver_timeout_ms })
            }
        }
    }
}

/// Compute a placement from scratch with the default configuration.
///
/// # Errors
///
/// See [`Optimizer::optimize_initial`].
pub fn optimize_initial(options: InitialOptions) -> Result<OptimizeResult> {
    Optimizer::default().optimize_initial(options)
}

/// Recompute a placement after a topology change with the default
/// configuration.
///
/// # Errors
///
/// See [`Optimizer::optimize_change`].
pub fn optimize_change(options: ChangeOptions) -> Result<OptimizeResult> {
    Optimizer::default().optimize_change(options)
}

fn validate_shape(pg_size: usize, pg_count: usize) -> Result<()> {
    if pg_size == 0 {
        return Err(OptimizerError::invalid_options("pg_size must be positive"));
    }
    if pg_count == 0 {
        return Err(OptimizerError::invalid_options("pg_count must be positive"));
    }
    Ok(())
}

fn warn_if_degraded(builder: &ProblemBuilder<'_>, layout: &DeviceLayout, pg_size: usize) {
    if builder.is_degraded() {
        warn!(
            domains = layout.domain_count(),
            pg_size,
            "Fewer failure domains than replicas, placement will be degraded"
        );
    }
}

fn to_ids(layout: &DeviceLayout, rows: Vec<Vec<DeviceIdx>>) -> Vec<Vec<DeviceId>> {
    rows.into_iter().map(|row| row.into_iter().map(|d| layout.id(d)).collect()).collect()
}

fn finish(
    tree: &OsdTree,
    layout: &DeviceLayout,
    pg_size: usize,
    int_pgs: &[Vec<DeviceId>],
    prev_pgs: Option<&[Vec<DeviceId>]>,
    target: &FractionalTarget,
) -> PlacementStats {
    let targets = target.by_device(layout);
    let mut stats =
        StatsCollector::new(tree, pg_size).collect_with_targets(int_pgs, prev_pgs, Some(&targets));
    stats.imbalance = target.imbalance;
    stats.relaxation = target.relaxation;
    if target.relaxation == Relaxation::WithoutDomainSeparation {
        warn!("Failure-domain separation dropped to find a placement");
    }
    gauge!("pgopt_degraded_pgs").set(stats.degraded_pgs.len() as f64);
    stats
}

fn infeasible(
    tree: &OsdTree,
    pg_size: usize,
    pg_count: usize,
    prev_pgs: Option<&[Vec<DeviceId>]>,
    reason: Infeasibility,
) -> OptimizeResult {
    warn!(%reason, pg_size, pg_count, "No feasible placement, returning empty assignment");
    counter!("pgopt_infeasible_total").increment(1);

    let int_pgs = vec![Vec::new(); pg_count];
    let mut stats = StatsCollector::new(tree, pg_size).collect(&int_pgs, prev_pgs);
    stats.infeasible = true;
    stats.infeasibility = Some(reason);
    OptimizeResult { int_pgs, stats }
}
