// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Conversion of fractional targets into an integral assignment.
//!
//! Two steps:
//!
//! 1. Rounding. Domain totals are rounded first with the largest remainder
//!    method, then the devices inside each domain. Every device ends within
//!    one slot of its target and domain caps survive the rounding.
//! 2. Row assembly. PGs are filled one row at a time from the remaining
//!    quotas. A row may hold a device at most once and a domain at most
//!    `domain_limit` times.
//!
//! Row assembly never dead-ends. With `r` rows left, a device whose remaining
//! quota equals `r` must appear in the current row, and a domain must
//! contribute at least `remaining - limit * (r - 1)` slots. Any row honouring
//! these floors leaves a state that can still be completed, so the planner is
//! free to follow preferences (such as keeping a PG where it was) for
//! everything else.
//!
//! Free slots go first to domains that still have spare quota and the fewest
//! future rows able to take it. Among equal candidates the device least often
//! placed together with the row's current members wins, which spreads every
//! device's peers over the whole cluster.

use std::cmp::Reverse;
use std::collections::HashMap;

use crate::error::{OptimizerError, Result};
use crate::topology::{DeviceIdx, DeviceLayout, DomainIdx};

/// Round `targets` to integer slot counts summing to `slots`.
///
/// `previous` holds the slots each device had before; on equal remainders,
/// devices that held more than their floor win the extra slot.
pub(crate) fn round_targets(
    layout: &DeviceLayout,
    targets: &[f64],
    pg_count: usize,
    slots: usize,
    domain_limit: usize,
    epsilon: f64,
    previous: Option<&[usize]>,
) -> Vec<usize> {
    let domain_targets: Vec<f64> = (0..layout.domain_count())
        .map(|dom| layout.domain_devices(dom).iter().map(|&d| targets[d]).sum())
        .collect();
    let domain_caps: Vec<usize> = (0..layout.domain_count())
        .map(|dom| domain_limit.min(layout.domain_devices(dom).len()).saturating_mul(pg_count))
        .collect();
    let domain_previous: Option<Vec<usize>> = previous.map(|held| {
        (0..layout.domain_count())
            .map(|dom| layout.domain_devices(dom).iter().map(|&d| held[d]).sum())
            .collect()
    });
    let domain_quotas = largest_remainder(
        &domain_targets,
        &domain_caps,
        slots,
        epsilon,
        domain_previous.as_deref(),
    );

    let mut quotas = vec![0; layout.device_count()];
    for (dom, &quota) in domain_quotas.iter().enumerate() {
        let members = layout.domain_devices(dom);
        let values: Vec<f64> = members.iter().map(|&d| targets[d]).collect();
        let caps = vec![pg_count; members.len()];
        let held: Option<Vec<usize>> =
            previous.map(|held| members.iter().map(|&d| held[d]).collect());
        let counts = largest_remainder(&values, &caps, quota, epsilon, held.as_deref());
        for (&d, count) in members.iter().zip(counts) {
            quotas[d] = count;
        }
    }
    quotas
}

/// Largest remainder rounding of `values` to integers summing to `total`,
/// each bounded by its cap.
fn largest_remainder(
    values: &[f64],
    caps: &[usize],
    total: usize,
    epsilon: f64,
    previous: Option<&[usize]>,
) -> Vec<usize> {
    let snapped: Vec<f64> = values
        .iter()
        .map(|&v| {
            let v = v.max(0.0);
            let nearest = v.round();
            if (v - nearest).abs() <= epsilon {
                nearest
            } else {
                v
            }
        })
        .collect();

    let mut counts: Vec<usize> =
        snapped.iter().zip(caps).map(|(&v, &cap)| (v.floor() as usize).min(cap)).collect();

    // Remainders are compared in units of epsilon so near-equal values tie.
    let rank: Vec<i64> =
        snapped.iter().map(|&v| ((v - v.floor()) / epsilon).round() as i64).collect();
    let held_more: Vec<bool> = (0..values.len())
        .map(|i| previous.is_some_and(|held| held[i] > counts[i]))
        .collect();
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by_key(|&i| (Reverse(rank[i]), Reverse(held_more[i]), i));

    let mut assigned: usize = counts.iter().sum();
    while assigned < total {
        let before = assigned;
        for &i in &order {
            if assigned == total {
                break;
            }
            if counts[i] < caps[i] {
                counts[i] += 1;
                assigned += 1;
            }
        }
        if assigned == before {
            break;
        }
    }
    while assigned > total {
        let before = assigned;
        for &i in order.iter().rev() {
            if assigned == total {
                break;
            }
            if counts[i] > 0 {
                counts[i] -= 1;
                assigned -= 1;
            }
        }
        if assigned == before {
            break;
        }
    }
    counts
}

/// Builds PG rows from integer quotas.
pub(crate) struct RowPlanner<'a> {
    layout: &'a DeviceLayout,
    pg_size: usize,
    domain_limit: usize,
    remaining: Vec<usize>,
    domain_remaining: Vec<usize>,
    /// Future rows that would like to keep each device.
    pending: Vec<usize>,
    domain_pending: Vec<usize>,
    /// Free slots each domain could still take in future rows.
    open: Vec<usize>,
    /// How often two devices shared a row, keyed by `(lower, higher)` index.
    pairs: HashMap<(DeviceIdx, DeviceIdx), u32>,
    rows_left: usize,
}

impl<'a> RowPlanner<'a> {
    /// Create a planner for `pg_count` rows drawing from `quotas`.
    pub(crate) fn new(
        layout: &'a DeviceLayout,
        quotas: Vec<usize>,
        pg_size: usize,
        pg_count: usize,
        domain_limit: usize,
    ) -> Self {
        let mut domain_remaining = vec![0; layout.domain_count()];
        for (d, &quota) in quotas.iter().enumerate() {
            domain_remaining[layout.domain_of(d)] += quota;
        }
        let mut planner = Self {
            layout,
            pg_size,
            domain_limit: domain_limit.clamp(1, pg_size.max(1)),
            remaining: quotas,
            domain_remaining,
            pending: vec![0; layout.device_count()],
            domain_pending: vec![0; layout.domain_count()],
            open: Vec::new(),
            pairs: HashMap::new(),
            rows_left: pg_count,
        };
        planner.open = planner.open_slots(&[]).into_iter().map(|cap| cap * pg_count).collect();
        planner
    }

    /// Register the previous rows that later calls to [`Self::next_row`]
    /// will try to keep.
    pub(crate) fn expect_keeps(&mut self, rows: &[Vec<Option<DeviceIdx>>]) {
        for &d in rows.iter().flatten().flatten() {
            self.pending[d] += 1;
            self.domain_pending[self.layout.domain_of(d)] += 1;
        }
        let mut open = vec![0; self.layout.domain_count()];
        for row in rows {
            for (open, cap) in open.iter_mut().zip(self.open_slots(row)) {
                *open += cap;
            }
        }
        self.open = open;
    }

    /// Free slots of a row, after its kept devices, that each domain could take.
    fn open_slots(&self, previous: &[Option<DeviceIdx>]) -> Vec<usize> {
        let mut kept = vec![0usize; self.layout.domain_count()];
        let mut holes = self.pg_size;
        for &d in previous.iter().take(self.pg_size).flatten() {
            kept[self.layout.domain_of(d)] += 1;
            holes -= 1;
        }
        kept.iter()
            .enumerate()
            .map(|(dom, &k)| {
                let members = self.layout.domain_devices(dom).len();
                self.domain_limit.saturating_sub(k).min(holes).min(members.saturating_sub(k))
            })
            .collect()
    }

    /// Assemble the next row, keeping devices of `previous` in their slots
    /// where possible.
    pub(crate) fn next_row(&mut self, previous: &[Option<DeviceIdx>]) -> Result<Vec<DeviceIdx>> {
        if self.rows_left == 0 {
            return Err(OptimizerError::Internal("no rows left to assemble".into()));
        }
        for &d in previous.iter().flatten() {
            let domain = self.layout.domain_of(d);
            self.pending[d] = self.pending[d].saturating_sub(1);
            self.domain_pending[domain] = self.domain_pending[domain].saturating_sub(1);
        }

        let open_here = self.open_slots(previous);
        let rows_left = self.rows_left;
        let limit = self.domain_limit;
        let mut row: Vec<Option<DeviceIdx>> = vec![None; self.pg_size];
        let mut per_domain = vec![0usize; self.layout.domain_count()];

        for (slot, &prev) in previous.iter().enumerate().take(self.pg_size) {
            let Some(d) = prev else { continue };
            let domain = self.layout.domain_of(d);
            if self.remaining[d] == 0 || per_domain[domain] >= limit || row.contains(&Some(d)) {
                continue;
            }
            row[slot] = Some(d);
            per_domain[domain] += 1;
        }

        let floor: Vec<usize> = self
            .domain_remaining
            .iter()
            .map(|&remaining| remaining.saturating_sub(limit * (rows_left - 1)))
            .collect();
        let forced: Vec<DeviceIdx> = (0..self.layout.device_count())
            .filter(|&d| self.remaining[d] == rows_left && !row.contains(&Some(d)))
            .collect();
        let mut unplaced_forced = vec![0usize; self.layout.domain_count()];
        for &d in &forced {
            unplaced_forced[self.layout.domain_of(d)] += 1;
        }

        // Drop kept devices that would crowd out mandatory picks.
        loop {
            let crowded =
                (0..per_domain.len()).find(|&dom| per_domain[dom] + unplaced_forced[dom] > limit);
            let demand: usize = (0..per_domain.len())
                .map(|dom| (per_domain[dom] + unplaced_forced[dom]).max(floor[dom]))
                .sum();
            if crowded.is_none() && demand <= self.pg_size {
                break;
            }
            let evict = row
                .iter()
                .enumerate()
                .filter_map(|(slot, d)| d.map(|d| (slot, d)))
                .filter(|&(_, d)| {
                    let domain = self.layout.domain_of(d);
                    self.remaining[d] != rows_left
                        && match crowded {
                            Some(dom) => dom == domain,
                            None => per_domain[domain] + unplaced_forced[domain] > floor[domain],
                        }
                })
                .min_by_key(|&(_, d)| (self.spare(d), d));
            let Some((slot, d)) = evict else {
                return Err(OptimizerError::Internal(
                    "kept devices conflict with required picks".into(),
                ));
            };
            row[slot] = None;
            per_domain[self.layout.domain_of(d)] -= 1;
        }

        for d in forced {
            place(&mut row, d)?;
            per_domain[self.layout.domain_of(d)] += 1;
        }

        for dom in 0..per_domain.len() {
            while per_domain[dom] < floor[dom] {
                let d = self.best_device(dom, &row).ok_or_else(|| {
                    OptimizerError::Internal(format!("domain {dom} cannot meet its floor"))
                })?;
                place(&mut row, d)?;
                per_domain[dom] += 1;
            }
        }

        // Domains with spare quota and the fewest open slots left come first.
        while row.contains(&None) {
            let (domain, d) = (0..per_domain.len())
                .filter(|&dom| per_domain[dom] < limit)
                .filter_map(|dom| self.best_device(dom, &row).map(|d| (dom, d)))
                .max_by_key(|&(dom, d)| {
                    let spare = self.domain_spare(dom);
                    (
                        Reverse(per_domain[dom]),
                        spare > 0,
                        Reverse(self.open[dom] as i64 - spare),
                        spare,
                        Reverse(self.affinity(d, &row)),
                        self.domain_remaining[dom],
                        Reverse(dom),
                    )
                })
                .ok_or_else(|| OptimizerError::Internal("ran out of quota".into()))?;
            place(&mut row, d)?;
            per_domain[domain] += 1;
        }

        let row: Vec<DeviceIdx> = row.into_iter().flatten().collect();
        for &d in &row {
            self.remaining[d] -= 1;
            self.domain_remaining[self.layout.domain_of(d)] -= 1;
        }
        for (i, &a) in row.iter().enumerate() {
            for &b in &row[i + 1..] {
                *self.pairs.entry((a.min(b), a.max(b))).or_default() += 1;
            }
        }
        for (open, cap) in self.open.iter_mut().zip(open_here) {
            *open = open.saturating_sub(cap);
        }
        self.rows_left -= 1;
        Ok(row)
    }

    /// How often `d` already shared a row with the members of `row`.
    fn affinity(&self, d: DeviceIdx, row: &[Option<DeviceIdx>]) -> u64 {
        row.iter()
            .flatten()
            .map(|&m| self.pairs.get(&(d.min(m), d.max(m))).copied().map_or(0, u64::from))
            .sum()
    }

    /// Quota left after honouring future keeps.
    fn spare(&self, d: DeviceIdx) -> i64 {
        self.remaining[d] as i64 - self.pending[d] as i64
    }

    fn domain_spare(&self, domain: DomainIdx) -> i64 {
        self.domain_remaining[domain] as i64 - self.domain_pending[domain] as i64
    }

    fn best_device(&self, domain: DomainIdx, row: &[Option<DeviceIdx>]) -> Option<DeviceIdx> {
        self.layout
            .domain_devices(domain)
            .iter()
            .copied()
            .filter(|&d| self.remaining[d] > 0 && !row.contains(&Some(d)))
            .max_by_key(|&d| {
                (self.spare(d), Reverse(self.affinity(d, row)), self.remaining[d], Reverse(d))
            })
    }
}

fn place(row: &mut [Option<DeviceIdx>], d: DeviceIdx) -> Result<()> {
    let slot = row
        .iter()
        .position(Option::is_none)
        .ok_or_else(|| OptimizerError::Internal("row overfilled".into()))?;
    row[slot] = Some(d);
    Ok(())
}

/// Round `targets` and assemble `pg_count` rows from scratch.
pub(crate) fn integerize(
    layout: &DeviceLayout,
    targets: &[f64],
    pg_size: usize,
    pg_count: usize,
    domain_limit: usize,
    epsilon: f64,
) -> Result<Vec<Vec<DeviceIdx>>> {
    let quotas =
        round_targets(layout, targets, pg_count, pg_count * pg_size, domain_limit, epsilon, None);
    let mut planner = RowPlanner::new(layout, quotas, pg_size, pg_count, domain_limit);
    (0..pg_count).map(|_| planner.next_row(&[])).collect()
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use super::*;
    use crate::topology::OsdTree;

    fn layout(domains: &[usize]) -> DeviceLayout {
        let mut tree = OsdTree::new();
        let mut id = 0;
        for (i, &devices) in domains.iter().enumerate() {
            for _ in 0..devices {
                tree.insert_device(format!("host{i}"), id, 1.0).unwrap();
                id += 1;
            }
        }
        DeviceLayout::new(&tree)
    }

    fn counts(layout: &DeviceLayout, rows: &[Vec<DeviceIdx>]) -> Vec<usize> {
        let mut counts = vec![0; layout.device_count()];
        for &d in rows.iter().flatten() {
            counts[d] += 1;
        }
        counts
    }

    #[test]
    fn test_largest_remainder_reconciles_total() {
        let counts = largest_remainder(&[1.5, 1.5, 1.0], &[10, 10, 10], 4, 1e-6, None);
        assert_eq!(counts, vec![2, 1, 1]);

        let held = [1, 2, 1];
        let counts = largest_remainder(&[1.5, 1.5, 1.0], &[10, 10, 10], 4, 1e-6, Some(&held[..]));
        assert_eq!(counts, vec![1, 2, 1]);

        let counts = largest_remainder(&[2.9999999, 1.0000001], &[10, 10], 4, 1e-6, None);
        assert_eq!(counts, vec![3, 1]);
    }

    #[test]
    fn test_largest_remainder_respects_caps() {
        let counts = largest_remainder(&[2.6, 2.4, 1.0], &[2, 3, 3], 6, 1e-6, None);
        assert_eq!(counts.iter().sum::<usize>(), 6);
        assert!(counts[0] <= 2);
    }

    #[test]
    fn test_round_targets_within_one() {
        let layout = layout(&[3, 2, 2]);
        let targets = [10.4, 10.3, 10.3, 15.5, 15.5, 15.0, 15.0];
        let quotas = round_targets(&layout, &targets, 40, 92, 1, 1e-6, None);
        assert_eq!(quotas.iter().sum::<usize>(), 92);
        for (q, t) in quotas.iter().zip(targets) {
            assert!((*q as f64 - t).abs() < 1.0, "{q} vs {t}");
        }
    }

    #[test]
    fn test_rows_are_separated_and_match_quotas() {
        let layout = layout(&[3, 3, 3, 3]);
        let targets = vec![64.0; 12];
        let rows = integerize(&layout, &targets, 3, 256, 1, 1e-6).unwrap();
        assert_eq!(rows.len(), 256);
        for row in &rows {
            let domains: HashSet<_> = row.iter().map(|&d| layout.domain_of(d)).collect();
            assert_eq!(domains.len(), 3);
        }
        assert_eq!(counts(&layout, &rows), vec![64; 12]);
    }

    #[test]
    fn test_rows_spread_peers() {
        let layout = layout(&[3, 3, 3, 3]);
        let rows = integerize(&layout, &[64.0; 12], 3, 256, 1, 1e-6).unwrap();

        let mut sets: HashMap<Vec<DeviceIdx>, usize> = HashMap::new();
        let mut pairs: HashMap<(DeviceIdx, DeviceIdx), usize> = HashMap::new();
        for row in &rows {
            let mut set = row.clone();
            set.sort_unstable();
            *sets.entry(set).or_default() += 1;
            for (i, &a) in row.iter().enumerate() {
                for &b in &row[i + 1..] {
                    *pairs.entry((a.min(b), a.max(b))).or_default() += 1;
                }
            }
        }
        assert!(sets.len() >= 64, "only {} distinct rows", sets.len());
        assert!(sets.values().all(|&n| n <= 8));

        // Every device shares rows with all nine devices outside its domain.
        assert_eq!(pairs.len(), 12 * 9 / 2);
        assert!(pairs.values().all(|&n| (10..=20).contains(&n)), "{pairs:?}");
    }

    #[test]
    fn test_tight_domains_are_forced() {
        // Three domains with pg_size 3: every row needs every domain.
        let layout = layout(&[1, 2, 3]);
        let targets = [8.0, 4.0, 4.0, 3.0, 3.0, 2.0];
        let rows = integerize(&layout, &targets, 3, 8, 1, 1e-6).unwrap();
        for row in &rows {
            let domains: HashSet<_> = row.iter().map(|&d| layout.domain_of(d)).collect();
            assert_eq!(domains.len(), 3);
        }
        assert_eq!(counts(&layout, &rows), vec![8, 4, 4, 3, 3, 2]);
    }

    #[test]
    fn test_degraded_rows_span_every_domain() {
        let layout = layout(&[4, 4]);
        let targets = vec![24.0; 8];
        let rows = integerize(&layout, &targets, 3, 64, 2, 1e-6).unwrap();
        for row in &rows {
            let devices: HashSet<_> = row.iter().collect();
            let domains: HashSet<_> = row.iter().map(|&d| layout.domain_of(d)).collect();
            assert_eq!(devices.len(), 3);
            assert_eq!(domains.len(), 2);
        }
        assert_eq!(counts(&layout, &rows), vec![24; 8]);
    }

    #[test]
    fn test_planner_keeps_previous_rows() {
        let layout = layout(&[2, 2, 2]);
        let previous: Vec<Vec<Option<DeviceIdx>>> = vec![
            vec![Some(0), Some(2), Some(4)],
            vec![Some(5), Some(1), Some(3)],
            vec![Some(0), Some(3), Some(5)],
            vec![Some(4), Some(2), Some(1)],
        ];
        let quotas = vec![2, 2, 2, 2, 2, 2];
        let mut planner = RowPlanner::new(&layout, quotas, 3, 4, 1);
        planner.expect_keeps(&previous);
        for prev in &previous {
            let row = planner.next_row(prev).unwrap();
            let expected: Vec<_> = prev.iter().flatten().copied().collect();
            assert_eq!(row, expected);
        }
    }

    #[test]
    fn test_planner_replaces_missing_devices_in_place() {
        let layout = layout(&[1, 1, 1, 1]);
        let previous: Vec<Vec<Option<DeviceIdx>>> =
            vec![vec![Some(0), None, Some(2)], vec![Some(1), Some(2), None]];
        let quotas = vec![1, 2, 2, 1];
        let mut planner = RowPlanner::new(&layout, quotas, 3, 2, 1);
        planner.expect_keeps(&previous);

        let first = planner.next_row(&previous[0]).unwrap();
        assert_eq!(first[0], 0);
        assert_eq!(first[2], 2);
        let second = planner.next_row(&previous[1]).unwrap();
        assert_eq!(second[0], 1);
        assert_eq!(second[1], 2);

        let rows = vec![first, second];
        assert_eq!(counts(&layout, &rows), vec![1, 2, 2, 1]);
    }
}
