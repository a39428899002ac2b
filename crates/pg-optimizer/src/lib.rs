// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Placement group distribution across weighted failure domains.
//!
//! This crate computes which devices hold the replicas of every placement
//! group (PG) so that:
//! - replicas of one PG sit in distinct failure domains
//! - each device carries load proportional to its weight
//! - after a topology change, as few PGs as possible move
//!
//! # Architecture
//!
//! ```text
//!  Topology ──flatten──▶ OsdTree ──▶ DeviceLayout
//!                                        │
//!                                        ▼
//!                                  ProblemBuilder ──▶ linear program
//!                                        │
//!                                        ▼
//!                                     Solver ──▶ fractional targets
//!                                        │
//!                  ┌─────────────────────┴─────────────────────┐
//!                  ▼                                           ▼
//!             Integerizer                               ChangeReconciler
//!          (initial placement)                    (previous assignment known)
//!                  └─────────────────────┬─────────────────────┘
//!                                        ▼
//!                           int_pgs ──▶ StatsCollector
//! ```
//!
//! The solver relaxes the program step by step when a topology cannot meet
//! every constraint. Clusters with fewer failure domains than replicas get a
//! degraded placement instead of an error.
//!
//! # Usage
//!
//! ```
//! use pg_optimizer::{optimize_change, optimize_initial, ChangeOptions, InitialOptions, OsdTree};
//!
//! let mut tree = OsdTree::new();
//! for host in 0..4u64 {
//!     for osd in 0..3u64 {
//!         tree.insert_device(format!("host{host}"), host * 3 + osd, 1.0).unwrap();
//!     }
//! }
//!
//! let initial = optimize_initial(InitialOptions {
//!     osd_tree: tree.clone().into(),
//!     pg_size: 3,
//!     pg_count: 256,
//! })
//! .unwrap();
//! assert!(initial.stats.devices.iter().all(|d| d.slots.abs_diff(64) <= 1));
//!
//! tree.insert_device("host0", 12, 1.0).unwrap();
//! let changed = optimize_change(ChangeOptions {
//!     prev_pgs: initial.int_pgs,
//!     osd_tree: tree.into(),
//!     pg_size: 3,
//!     pg_count: None,
//! })
//! .unwrap();
//! println!("moved {} PGs", changed.stats.moved_pgs);
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod error;
mod integerize;
pub mod optimizer;
pub mod problem;
mod reconcile;
mod solver;
pub mod stats;
pub mod topology;

pub use config::OptimizerConfig;
pub use error::{OptimizerError, Result, SolverError, TopologyError};
pub use optimizer::{
    optimize_change, optimize_initial, ChangeOptions, InitialOptions, OptimizeResult, Optimizer,
    DEFAULT_PG_SIZE,
};
pub use problem::{Infeasibility, Relaxation};
pub use stats::{DeviceStats, PlacementStats, StatsCollector};
pub use topology::{flatten_into, flatten_tree, DeviceId, OsdTree, Topology, TopologyNode};
