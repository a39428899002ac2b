// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Failure-domain topology.
//!
//! The optimizer consumes a flat map from top-level failure domain to the
//! weighted devices inside it ([`OsdTree`]). Callers holding a nested tree of
//! racks, hosts and devices convert it with [`flatten_tree`], which validates
//! the whole tree once and names every top-level subtree `domN`.
//!
//! ```text
//! level 1        dom1                 dom2
//!               /    \               /    \
//! level 2    host    host         host    host
//!            /  \    /  \         /  \    /  \
//! level 3  osd1 osd2 osd3 osd4  osd5 osd6 osd7 osd8
//! ```

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::TopologyError;

/// Unique identifier for a storage device (OSD).
pub type DeviceId = u64;

/// A node of a nested failure-domain tree.
///
/// Levels and weights are optional only so that documents missing them can be
/// decoded and rejected with a precise [`TopologyError`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TopologyNode {
    /// A storage device (leaf).
    Device {
        /// Level of the leaf; must equal the leaf level.
        level: Option<u32>,
        /// Device identifier.
        id: DeviceId,
        /// Relative capacity.
        #[serde(alias = "size")]
        weight: Option<f64>,
    },
    /// A failure domain grouping sub-domains or devices.
    Domain {
        /// Level of the domain.
        level: Option<u32>,
        /// Nested nodes.
        children: Vec<TopologyNode>,
    },
}

impl TopologyNode {
    /// Create a device leaf.
    #[must_use]
    pub fn device(level: u32, id: DeviceId, weight: f64) -> Self {
        Self::Device { level: Some(level), id, weight: Some(weight) }
    }

    /// Create a domain node.
    #[must_use]
    pub fn domain(level: u32, children: Vec<TopologyNode>) -> Self {
        Self::Domain { level: Some(level), children }
    }

    fn level(&self) -> Result<u32, TopologyError> {
        match self {
            Self::Device { level, .. } | Self::Domain { level, .. } => {
                level.ok_or(TopologyError::MissingLevel)
            }
        }
    }
}

/// Flat topology: top-level domain name to device weights.
///
/// Devices with weight zero are allowed and simply cannot hold data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OsdTree {
    domains: BTreeMap<String, BTreeMap<DeviceId, f64>>,
}

impl OsdTree {
    /// Create an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from a domain map, validating it.
    ///
    /// # Errors
    ///
    /// Returns an error for negative or non-finite weights and for devices
    /// listed under more than one domain.
    pub fn from_domains(
        domains: BTreeMap<String, BTreeMap<DeviceId, f64>>,
    ) -> Result<Self, TopologyError> {
        let tree = Self { domains };
        tree.validate()?;
        Ok(tree)
    }

    /// Decode a flat tree from JSON, e.g. `{"host1": {"1": 3.5, "2": 3.5}}`.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or fails validation.
    pub fn from_json(json: &str) -> Result<Self, TopologyError> {
        let tree: Self =
            serde_json::from_str(json).map_err(|e| TopologyError::Malformed(e.to_string()))?;
        tree.validate()?;
        Ok(tree)
    }

    /// Validate weights and device uniqueness.
    ///
    /// # Errors
    ///
    /// Returns the first structural problem found.
    pub fn validate(&self) -> Result<(), TopologyError> {
        let mut seen = HashMap::new();
        for (domain, devices) in &self.domains {
            for (&id, &weight) in devices {
                if !weight.is_finite() || weight < 0.0 {
                    return Err(TopologyError::InvalidWeight { id, weight });
                }
                if seen.insert(id, domain).is_some() {
                    return Err(TopologyError::DuplicateDevice(id));
                }
            }
        }
        Ok(())
    }

    /// Add or replace a device in a domain, creating the domain if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the weight is unusable or the device already lives
    /// in another domain.
    pub fn insert_device(
        &mut self,
        domain: impl Into<String>,
        id: DeviceId,
        weight: f64,
    ) -> Result<(), TopologyError> {
        if !weight.is_finite() || weight < 0.0 {
            return Err(TopologyError::InvalidWeight { id, weight });
        }
        let domain = domain.into();
        if self.domain_of(id).is_some_and(|current| current != domain) {
            return Err(TopologyError::DuplicateDevice(id));
        }
        self.domains.entry(domain).or_default().insert(id, weight);
        Ok(())
    }

    /// Remove a device, returning its weight. Domains left empty are kept.
    pub fn remove_device(&mut self, id: DeviceId) -> Option<f64> {
        self.domains.values_mut().find_map(|devices| devices.remove(&id))
    }

    /// Insert a whole domain, replacing any domain with the same name.
    ///
    /// # Errors
    ///
    /// Returns an error if the resulting tree is invalid; the tree is left
    /// unchanged in that case.
    pub fn insert_domain(
        &mut self,
        name: impl Into<String>,
        devices: BTreeMap<DeviceId, f64>,
    ) -> Result<(), TopologyError> {
        let name = name.into();
        let previous = self.domains.insert(name.clone(), devices);
        if let Err(e) = self.validate() {
            match previous {
                Some(devices) => self.domains.insert(name, devices),
                None => self.domains.remove(&name),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Remove a domain and its devices.
    pub fn remove_domain(&mut self, name: &str) -> Option<BTreeMap<DeviceId, f64>> {
        self.domains.remove(name)
    }

    /// Devices of a domain.
    #[must_use]
    pub fn domain(&self, name: &str) -> Option<&BTreeMap<DeviceId, f64>> {
        self.domains.get(name)
    }

    /// All domains in name order.
    #[must_use]
    pub fn domains(&self) -> &BTreeMap<String, BTreeMap<DeviceId, f64>> {
        &self.domains
    }

    /// Name of the domain holding a device.
    #[must_use]
    pub fn domain_of(&self, id: DeviceId) -> Option<&str> {
        self.domains
            .iter()
            .find(|(_, devices)| devices.contains_key(&id))
            .map(|(name, _)| name.as_str())
    }

    /// Number of devices, including zero-weight ones.
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.domains.values().map(BTreeMap::len).sum()
    }

    /// Sum of all device weights.
    #[must_use]
    pub fn total_weight(&self) -> f64 {
        self.domains.values().flat_map(BTreeMap::values).sum()
    }

    /// Returns true if the tree has no devices.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.device_count() == 0
    }
}

/// Topology as supplied by a caller: already flat, or nested.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Topology {
    /// A flat domain map.
    Flat(OsdTree),
    /// A nested tree to flatten at `level`, with leaves at `max_level`.
    Nested {
        /// Top-level nodes.
        tree: Vec<TopologyNode>,
        /// Level of the top-level nodes, which become the failure domains.
        level: u32,
        /// Level of the device leaves.
        max_level: u32,
    },
}

impl Topology {
    /// Resolve to a flat tree.
    ///
    /// # Errors
    ///
    /// Returns a structural error if a nested tree is malformed.
    pub fn into_flat(self) -> Result<OsdTree, TopologyError> {
        match self {
            Self::Flat(tree) => {
                tree.validate()?;
                Ok(tree)
            }
            Self::Nested { tree, level, max_level } => flatten_tree(&tree, level, max_level),
        }
    }
}

// Untagged enums buffer their input, and buffered map keys stay strings, so
// device ids of a flat tree are parsed by hand here.
#[derive(Deserialize)]
#[serde(untagged)]
enum TopologyRepr {
    Nested { tree: Vec<TopologyNode>, level: u32, max_level: u32 },
    Flat(BTreeMap<String, BTreeMap<String, f64>>),
}

impl<'de> Deserialize<'de> for Topology {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match TopologyRepr::deserialize(deserializer)? {
            TopologyRepr::Nested { tree, level, max_level } => {
                Ok(Self::Nested { tree, level, max_level })
            }
            TopologyRepr::Flat(raw) => {
                let mut domains = BTreeMap::new();
                for (name, devices) in raw {
                    let mut parsed = BTreeMap::new();
                    for (id, weight) in devices {
                        let id = id.parse::<DeviceId>().map_err(|_| {
                            serde::de::Error::custom(format!("invalid device id {id:?}"))
                        })?;
                        parsed.insert(id, weight);
                    }
                    domains.insert(name, parsed);
                }
                Ok(Self::Flat(OsdTree { domains }))
            }
        }
    }
}

impl From<OsdTree> for Topology {
    fn from(tree: OsdTree) -> Self {
        Self::Flat(tree)
    }
}

/// Flatten a nested tree into a fresh [`OsdTree`].
///
/// Every node in `nodes` must be at `level`; each becomes one failure domain
/// named `dom1`, `dom2`, ... in order. Leaves must sit at `max_level` and
/// children must be strictly below their parents.
///
/// # Errors
///
/// Returns a structural error for the first malformed node; nothing is
/// returned in that case.
pub fn flatten_tree(
    nodes: &[TopologyNode],
    level: u32,
    max_level: u32,
) -> Result<OsdTree, TopologyError> {
    let mut tree = OsdTree::new();
    flatten_into(&mut tree, nodes, level, max_level)?;
    Ok(tree)
}

/// Flatten a nested tree into an existing accumulator.
///
/// Domain numbering continues after the names already present. On error the
/// accumulator is left unchanged.
///
/// # Errors
///
/// Returns a structural error for the first malformed node.
pub fn flatten_into(
    acc: &mut OsdTree,
    nodes: &[TopologyNode],
    level: u32,
    max_level: u32,
) -> Result<(), TopologyError> {
    let mut staged = acc.clone();
    let mut next = acc.domains.len() + 1;
    for node in nodes {
        let found = node.level()?;
        if found != level {
            return Err(TopologyError::TopLevelMismatch { found, expected: level });
        }
        let mut devices = BTreeMap::new();
        collect_leaves(node, max_level, &mut devices)?;

        let mut name = format!("dom{next}");
        while staged.domains.contains_key(&name) {
            next += 1;
            name = format!("dom{next}");
        }
        next += 1;
        for &id in devices.keys() {
            if staged.domain_of(id).is_some() {
                return Err(TopologyError::DuplicateDevice(id));
            }
        }
        staged.domains.insert(name, devices);
    }
    *acc = staged;
    Ok(())
}

fn collect_leaves(
    node: &TopologyNode,
    max_level: u32,
    out: &mut BTreeMap<DeviceId, f64>,
) -> Result<(), TopologyError> {
    let level = node.level()?;
    match node {
        TopologyNode::Device { id, weight, .. } => {
            if level != max_level {
                return Err(TopologyError::LeafLevelMismatch { id: *id, level, max_level });
            }
            let weight = weight.ok_or(TopologyError::MissingWeight(*id))?;
            if !weight.is_finite() || weight <= 0.0 {
                return Err(TopologyError::InvalidWeight { id: *id, weight });
            }
            if out.insert(*id, weight).is_some() {
                return Err(TopologyError::DuplicateDevice(*id));
            }
        }
        TopologyNode::Domain { children, .. } => {
            if level >= max_level {
                return Err(TopologyError::DomainAtLeafLevel { level, max_level });
            }
            for child in children {
                let found = child.level()?;
                if found <= level {
                    return Err(TopologyError::NotBelowParent { found, parent: level });
                }
                collect_leaves(child, max_level, out)?;
            }
        }
    }
    Ok(())
}

/// Index of a device inside a [`DeviceLayout`].
pub(crate) type DeviceIdx = usize;

/// Index of a domain inside a [`DeviceLayout`].
pub(crate) type DomainIdx = usize;

/// Dense, ordered view of the devices able to hold data.
///
/// Devices are ordered by domain name, then by id. This order fixes the LP
/// variable order and every tie-break downstream, which keeps results
/// reproducible for identical input.
#[derive(Debug, Clone)]
pub(crate) struct DeviceLayout {
    domains: Vec<String>,
    domain_devices: Vec<Vec<DeviceIdx>>,
    ids: Vec<DeviceId>,
    weights: Vec<f64>,
    domain_of: Vec<DomainIdx>,
    index: HashMap<DeviceId, DeviceIdx>,
}

impl DeviceLayout {
    /// Build the layout, skipping zero-weight devices and empty domains.
    pub(crate) fn new(tree: &OsdTree) -> Self {
        let mut layout = Self {
            domains: Vec::new(),
            domain_devices: Vec::new(),
            ids: Vec::new(),
            weights: Vec::new(),
            domain_of: Vec::new(),
            index: HashMap::new(),
        };
        for (name, devices) in tree.domains() {
            let usable: Vec<_> = devices.iter().filter(|&(_, &w)| w > 0.0).collect();
            if usable.is_empty() {
                continue;
            }
            let domain = layout.domains.len();
            layout.domains.push(name.clone());
            let mut members = Vec::with_capacity(usable.len());
            for (&id, &weight) in usable {
                let idx = layout.ids.len();
                layout.ids.push(id);
                layout.weights.push(weight);
                layout.domain_of.push(domain);
                layout.index.insert(id, idx);
                members.push(idx);
            }
            layout.domain_devices.push(members);
        }
        layout
    }

    pub(crate) fn device_count(&self) -> usize {
        self.ids.len()
    }

    pub(crate) fn domain_count(&self) -> usize {
        self.domains.len()
    }

    pub(crate) fn total_weight(&self) -> f64 {
        self.weights.iter().sum()
    }

    pub(crate) fn id(&self, idx: DeviceIdx) -> DeviceId {
        self.ids[idx]
    }

    pub(crate) fn weight(&self, idx: DeviceIdx) -> f64 {
        self.weights[idx]
    }

    pub(crate) fn domain_of(&self, idx: DeviceIdx) -> DomainIdx {
        self.domain_of[idx]
    }

    pub(crate) fn domain_name(&self, domain: DomainIdx) -> &str {
        &self.domains[domain]
    }

    pub(crate) fn domain_devices(&self, domain: DomainIdx) -> &[DeviceIdx] {
        &self.domain_devices[domain]
    }

    pub(crate) fn lookup(&self, id: DeviceId) -> Option<DeviceIdx> {
        self.index.get(&id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host(level: u32, ids: &[DeviceId]) -> TopologyNode {
        TopologyNode::domain(level, ids.iter().map(|&id| TopologyNode::device(3, id, 3.0)).collect())
    }

    fn crush_tree() -> Vec<TopologyNode> {
        vec![
            TopologyNode::domain(1, vec![host(2, &[1, 2]), host(2, &[3, 4])]),
            TopologyNode::domain(1, vec![host(2, &[5, 6]), host(2, &[7, 8])]),
            TopologyNode::domain(1, vec![host(2, &[9, 10]), host(2, &[11, 12])]),
        ]
    }

    #[test]
    fn test_flatten_names_top_level_domains() {
        let tree = flatten_tree(&crush_tree(), 1, 3).unwrap();
        assert_eq!(tree.domains().len(), 3);
        assert_eq!(tree.device_count(), 12);
        let dom2: Vec<_> = tree.domain("dom2").unwrap().keys().copied().collect();
        assert_eq!(dom2, vec![5, 6, 7, 8]);
        assert_eq!(tree.domain_of(12), Some("dom3"));
        assert!((tree.total_weight() - 36.0).abs() < 1e-9);
    }

    #[test]
    fn test_flatten_into_continues_numbering() {
        let mut acc = flatten_tree(&crush_tree()[..1], 1, 3).unwrap();
        flatten_into(&mut acc, &crush_tree()[1..], 1, 3).unwrap();
        let names: Vec<_> = acc.domains().keys().cloned().collect();
        assert_eq!(names, vec!["dom1", "dom2", "dom3"]);
    }

    #[test]
    fn test_flatten_rejects_leaf_above_max_level() {
        let nodes = vec![TopologyNode::domain(1, vec![TopologyNode::device(2, 1, 1.0)])];
        assert_eq!(
            flatten_tree(&nodes, 1, 3),
            Err(TopologyError::LeafLevelMismatch { id: 1, level: 2, max_level: 3 })
        );
    }

    #[test]
    fn test_flatten_rejects_missing_weight_and_level() {
        let json = r#"[{"level": 1, "children": [{"level": 2, "id": 4}]}]"#;
        let nodes: Vec<TopologyNode> = serde_json::from_str(json).unwrap();
        assert_eq!(flatten_tree(&nodes, 1, 2), Err(TopologyError::MissingWeight(4)));

        let json = r#"[{"children": [{"level": 2, "id": 4, "size": 1}]}]"#;
        let nodes: Vec<TopologyNode> = serde_json::from_str(json).unwrap();
        assert_eq!(flatten_tree(&nodes, 1, 2), Err(TopologyError::MissingLevel));
    }

    #[test]
    fn test_flatten_rejects_non_positive_weight() {
        let nodes = vec![TopologyNode::domain(1, vec![TopologyNode::device(2, 9, 0.0)])];
        assert!(matches!(
            flatten_tree(&nodes, 1, 2),
            Err(TopologyError::InvalidWeight { id: 9, .. })
        ));
    }

    #[test]
    fn test_flatten_rejects_duplicates_and_bad_nesting() {
        let nodes = vec![host(1, &[1]), host(1, &[1])];
        assert_eq!(flatten_tree(&nodes, 1, 3), Err(TopologyError::DuplicateDevice(1)));

        let nodes = vec![TopologyNode::domain(2, vec![TopologyNode::domain(2, vec![])])];
        assert_eq!(
            flatten_tree(&nodes, 2, 3),
            Err(TopologyError::NotBelowParent { found: 2, parent: 2 })
        );

        let nodes = vec![TopologyNode::domain(3, vec![])];
        assert_eq!(
            flatten_tree(&nodes, 3, 3),
            Err(TopologyError::DomainAtLeafLevel { level: 3, max_level: 3 })
        );
    }

    #[test]
    fn test_flatten_error_leaves_accumulator_untouched() {
        let mut acc = flatten_tree(&crush_tree()[..1], 1, 3).unwrap();
        let before = acc.clone();
        let bad = vec![TopologyNode::domain(1, vec![TopologyNode::device(3, 1, 1.0)])];
        assert!(flatten_into(&mut acc, &bad, 1, 3).is_err());
        assert_eq!(acc, before);
    }

    #[test]
    fn test_top_level_leaf_is_its_own_domain() {
        let nodes = vec![TopologyNode::device(1, 42, 2.0)];
        let tree = flatten_tree(&nodes, 1, 1).unwrap();
        assert_eq!(tree.domain_of(42), Some("dom1"));
    }

    #[test]
    fn test_osd_tree_json_and_edits() {
        let mut tree = OsdTree::from_json(r#"{"100": {"7": 3.6}, "300": {"10": 3.4, "11": 3.4}}"#)
            .unwrap();
        assert_eq!(tree.device_count(), 3);
        tree.insert_device("500", 8, 3.5).unwrap();
        assert_eq!(tree.domain_of(8), Some("500"));
        assert_eq!(tree.insert_device("100", 8, 1.0), Err(TopologyError::DuplicateDevice(8)));
        assert_eq!(tree.remove_device(8), Some(3.5));
        assert!(tree.remove_domain("100").is_some());
        assert_eq!(tree.device_count(), 2);

        assert!(OsdTree::from_json(r#"{"a": {"1": -1.0}}"#).is_err());
        assert!(OsdTree::from_json(r#"{"a": {"1": 1.0}, "b": {"1": 1.0}}"#).is_err());
    }

    #[test]
    fn test_insert_domain_rolls_back_on_error() {
        let mut tree = OsdTree::new();
        tree.insert_device("a", 1, 1.0).unwrap();
        let clash: BTreeMap<_, _> = [(1, 2.0)].into_iter().collect();
        assert!(tree.insert_domain("b", clash).is_err());
        assert!(tree.domain("b").is_none());
    }

    #[test]
    fn test_layout_skips_zero_weight() {
        let mut tree = OsdTree::new();
        tree.insert_device("b", 3, 1.0).unwrap();
        tree.insert_device("a", 2, 0.0).unwrap();
        tree.insert_device("a", 1, 2.0).unwrap();
        tree.insert_device("c", 4, 0.0).unwrap();

        let layout = DeviceLayout::new(&tree);
        assert_eq!(layout.device_count(), 2);
        assert_eq!(layout.domain_count(), 2);
        assert_eq!(layout.id(0), 1);
        assert_eq!(layout.domain_name(layout.domain_of(1)), "b");
        assert_eq!(layout.lookup(2), None);
        assert!((layout.total_weight() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_nested_topology_json() {
        let json = r#"{"tree": [{"level": 1, "children": [{"level": 2, "id": 1, "size": 3}]}],
                       "level": 1, "max_level": 2}"#;
        let topology: Topology = serde_json::from_str(json).unwrap();
        let tree = topology.into_flat().unwrap();
        assert_eq!(tree.domain_of(1), Some("dom1"));

        let flat: Topology = serde_json::from_str(r#"{"host1": {"7": 3.5}}"#).unwrap();
        assert_eq!(flat.into_flat().unwrap().domain_of(7), Some("host1"));
        assert!(serde_json::from_str::<Topology>(r#"{"host1": {"osd7": 3.5}}"#).is_err());
    }
}
