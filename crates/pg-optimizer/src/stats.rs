// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Placement statistics.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::problem::{Infeasibility, Relaxation};
use crate::topology::{DeviceId, DeviceLayout, OsdTree};

/// Load of a single device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStats {
    /// Device identifier.
    pub id: DeviceId,
    /// Failure domain the device belongs to.
    pub domain: String,
    /// Relative capacity.
    pub weight: f64,
    /// Replica slots assigned.
    pub slots: usize,
    /// Proportional share of all slots.
    pub ideal_slots: f64,
    /// Fractional target the assignment was rounded from.
    pub target: f64,
    /// `slots / ideal_slots`; 1.0 is perfect balance.
    pub utilization: f64,
}

/// Summary of an assignment and its movement from the previous one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlacementStats {
    /// Number of PGs.
    pub pg_count: usize,
    /// Replicas per PG.
    pub pg_size: usize,
    /// Replica slots assigned.
    pub total_slots: usize,
    /// PGs whose device set changed.
    pub moved_pgs: usize,
    /// Replicas placed on a device their PG did not use before.
    pub moved_slots: usize,
    /// `moved_pgs / pg_count`.
    pub moved_fraction: f64,
    /// Per-device load, in domain then id order.
    pub devices: Vec<DeviceStats>,
    /// Worst ratio of ideal to assigned slots over all loaded devices.
    ///
    /// The fullest device fills up first, so this is the fraction of raw
    /// capacity usable before any device runs out.
    pub space_efficiency: f64,
    /// Indices of PGs spanning fewer than `pg_size` failure domains.
    pub degraded_pgs: Vec<usize>,
    /// Sum over PGs of `pg_size` minus the failure domains spanned.
    pub lost_separations: usize,
    /// Largest relative deviation from the ideal share in the target.
    pub imbalance: f64,
    /// Relaxation the target was solved under.
    pub relaxation: Relaxation,
    /// No placement was possible.
    pub infeasible: bool,
    /// Why no placement was possible.
    pub infeasibility: Option<Infeasibility>,
    /// The topology has fewer failure domains than `pg_size`.
    pub degraded: bool,
}

/// Computes [`PlacementStats`] for an assignment.
///
/// Usable on its own to evaluate any assignment against a topology, for
/// example one loaded from storage.
#[derive(Debug, Clone, Copy)]
pub struct StatsCollector<'a> {
    tree: &'a OsdTree,
    pg_size: usize,
}

impl<'a> StatsCollector<'a> {
    /// Create a collector for `tree`.
    #[must_use]
    pub fn new(tree: &'a OsdTree, pg_size: usize) -> Self {
        Self { tree, pg_size }
    }

    /// Collect statistics for `int_pgs`, measuring movement from `prev_pgs`.
    ///
    /// Only PGs present in both assignments count towards movement.
    #[must_use]
    pub fn collect(
        &self,
        int_pgs: &[Vec<DeviceId>],
        prev_pgs: Option<&[Vec<DeviceId>]>,
    ) -> PlacementStats {
        self.collect_with_targets(int_pgs, prev_pgs, None)
    }

    pub(crate) fn collect_with_targets(
        &self,
        int_pgs: &[Vec<DeviceId>],
        prev_pgs: Option<&[Vec<DeviceId>]>,
        targets: Option<&BTreeMap<DeviceId, f64>>,
    ) -> PlacementStats {
        let layout = DeviceLayout::new(self.tree);
        let pg_count = int_pgs.len();
        let total_slots: usize = int_pgs.iter().map(Vec::len).sum();

        let mut slots = vec![0usize; layout.device_count()];
        for &id in int_pgs.iter().flatten() {
            if let Some(d) = layout.lookup(id) {
                slots[d] += 1;
            }
        }

        let total_weight = layout.total_weight();
        let devices: Vec<DeviceStats> = (0..layout.device_count())
            .map(|d| {
                let id = layout.id(d);
                let ideal_slots = (pg_count * self.pg_size) as f64 * layout.weight(d) / total_weight;
                DeviceStats {
                    id,
                    domain: layout.domain_name(layout.domain_of(d)).to_owned(),
                    weight: layout.weight(d),
                    slots: slots[d],
                    ideal_slots,
                    target: targets.and_then(|t| t.get(&id).copied()).unwrap_or(ideal_slots),
                    utilization: slots[d] as f64 / ideal_slots,
                }
            })
            .collect();
        let space_efficiency = devices
            .iter()
            .filter(|dev| dev.slots > 0)
            .map(|dev| dev.ideal_slots / dev.slots as f64)
            .fold(None, |acc: Option<f64>, e| Some(acc.map_or(e, |a| a.min(e))))
            .unwrap_or(0.0);

        let mut degraded_pgs = Vec::new();
        let mut lost_separations = 0;
        for (pg, row) in int_pgs.iter().enumerate() {
            if row.is_empty() {
                continue;
            }
            // A device missing from the tree counts as a domain of its own.
            let spanned: HashSet<Result<&str, DeviceId>> =
                row.iter().map(|&id| self.tree.domain_of(id).ok_or(id)).collect();
            let lost = self.pg_size.saturating_sub(spanned.len());
            if lost > 0 {
                degraded_pgs.push(pg);
                lost_separations += lost;
            }
        }

        let (moved_pgs, moved_slots) = prev_pgs.map_or((0, 0), |prev| movement(prev, int_pgs));
        let moved_fraction = if pg_count == 0 { 0.0 } else { moved_pgs as f64 / pg_count as f64 };

        PlacementStats {
            pg_count,
            pg_size: self.pg_size,
            total_slots,
            moved_pgs,
            moved_slots,
            moved_fraction,
            devices,
            space_efficiency,
            degraded_pgs,
            lost_separations,
            degraded: layout.domain_count() < self.pg_size,
            ..PlacementStats::default()
        }
    }
}

/// Count PGs whose device set changed, and replicas landing on new devices.
fn movement(prev: &[Vec<DeviceId>], next: &[Vec<DeviceId>]) -> (usize, usize) {
    let mut moved_pgs = 0;
    let mut moved_slots = 0;
    for (old, new) in prev.iter().zip(next) {
        let old: HashSet<DeviceId> = old.iter().copied().collect();
        let new: HashSet<DeviceId> = new.iter().copied().collect();
        if old != new {
            moved_pgs += 1;
            moved_slots += new.difference(&old).count();
        }
    }
    (moved_pgs, moved_slots)
}
