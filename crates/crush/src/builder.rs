//! Map construction and sealing.
//!
//! The semantic builder populates a [`CrushMap`] through the mutators here,
//! then calls [`CrushMap::finalize`] exactly once. Finalize recomputes every
//! piece of derived state (summed weights, list prefix sums, tree node
//! arrays, straw lengths), validates the structural invariants, and leaves
//! the map ready for encoding; afterwards the map is treated as read-only.

use std::collections::BTreeMap;

use crate::error::{CrushError, Result};
use crate::types::{BucketAlgorithm, BucketData, CrushBucket, CrushMap, CrushRule, CrushRuleMask, CrushRuleStep, RuleOp, RuleType};

impl CrushMap {
    /// Extend the device id space to `[0, n)`
    pub fn set_max_devices(&mut self, n: i32) {
        self.max_devices = n;
        self.device_offload.resize(n.max(0) as usize, 0);
    }

    /// Register a hierarchy level name
    pub fn set_type_name(&mut self, level: i32, name: &str) {
        self.type_names.insert(level, name.to_string());
    }

    /// Register a device or bucket name
    pub fn set_item_name(&mut self, id: i32, name: &str) {
        self.names.insert(id, name.to_string());
    }

    /// Register a rule name
    pub fn set_rule_name(&mut self, rule_id: u32, name: &str) {
        self.rule_names.insert(rule_id, name.to_string());
    }

    /// Set a device's offload fraction (16.16, at most 0x10000)
    pub fn set_offload(&mut self, id: i32, offload: u32) -> Result<()> {
        if offload > 0x10000 {
            return Err(CrushError::InvalidOffload(offload));
        }
        if id < 0 || id >= self.max_devices {
            return Err(CrushError::ItemNotFound(id));
        }
        self.device_offload[id as usize] = offload;
        Ok(())
    }

    /// Add a bucket at a caller-chosen negative id.
    ///
    /// `items` and `weights` are parallel; holes are item 0 with weight 0.
    /// Derived state is placeholder until `finalize` runs.
    pub fn add_bucket(
        &mut self,
        id: i32,
        alg: BucketAlgorithm,
        bucket_type: i32,
        items: &[i32],
        weights: &[u32],
    ) -> Result<()> {
        if id >= 0 {
            return Err(CrushError::InvalidBucketId(id));
        }
        debug_assert_eq!(items.len(), weights.len());
        let slot = (-1 - id) as usize;
        if slot >= self.buckets.len() {
            self.buckets.resize(slot + 1, None);
        }
        if self.buckets[slot].is_some() {
            return Err(CrushError::BucketIdInUse(id));
        }

        let weight = sum_weights(id, weights)?;
        let data = match alg {
            BucketAlgorithm::Uniform => BucketData::Uniform { item_weight: 0 },
            BucketAlgorithm::List => BucketData::List { sum_weights: Vec::new() },
            BucketAlgorithm::Tree => BucketData::Tree { num_nodes: 0, node_weights: Vec::new() },
            BucketAlgorithm::Straw => BucketData::Straw { straws: Vec::new() },
        };
        self.buckets[slot] = Some(CrushBucket {
            id,
            bucket_type,
            alg,
            hash: 0,
            weight,
            size: items.len() as u32,
            items: items.to_vec(),
            weights: weights.to_vec(),
            data,
        });
        Ok(())
    }

    /// Append a rule with `step_count` NOOP placeholder steps; returns the
    /// new rule id
    pub fn add_rule(
        &mut self,
        step_count: usize,
        pool: u8,
        rule_type: RuleType,
        min_size: u8,
        max_size: u8,
    ) -> u32 {
        let rule_id = self.rules.len() as u32;
        self.rules.push(Some(CrushRule {
            mask: CrushRuleMask { pool, rule_type, min_size, max_size },
            steps: vec![
                CrushRuleStep { op: RuleOp::Noop, arg1: 0, arg2: 0 };
                step_count
            ],
        }));
        rule_id
    }

    /// Overwrite one step of a rule
    pub fn set_rule_step(
        &mut self,
        rule_id: u32,
        step: usize,
        op: RuleOp,
        arg1: i32,
        arg2: i32,
    ) -> Result<()> {
        let rule = self
            .rules
            .get_mut(rule_id as usize)
            .and_then(|r| r.as_mut())
            .ok_or(CrushError::RuleNotFound(rule_id))?;
        let slot = rule
            .steps
            .get_mut(step)
            .ok_or(CrushError::RuleNotFound(rule_id))?;
        *slot = CrushRuleStep { op, arg1, arg2 };
        Ok(())
    }

    pub fn set_rule_step_take(&mut self, rule_id: u32, step: usize, item: i32) -> Result<()> {
        self.set_rule_step(rule_id, step, RuleOp::Take, item, 0)
    }

    pub fn set_rule_step_choose_firstn(
        &mut self,
        rule_id: u32,
        step: usize,
        n: i32,
        item_type: i32,
    ) -> Result<()> {
        self.set_rule_step(rule_id, step, RuleOp::ChooseFirstN, n, item_type)
    }

    pub fn set_rule_step_choose_indep(
        &mut self,
        rule_id: u32,
        step: usize,
        n: i32,
        item_type: i32,
    ) -> Result<()> {
        self.set_rule_step(rule_id, step, RuleOp::ChooseIndep, n, item_type)
    }

    pub fn set_rule_step_choose_leaf_firstn(
        &mut self,
        rule_id: u32,
        step: usize,
        n: i32,
        item_type: i32,
    ) -> Result<()> {
        self.set_rule_step(rule_id, step, RuleOp::ChooseLeafFirstN, n, item_type)
    }

    pub fn set_rule_step_choose_leaf_indep(
        &mut self,
        rule_id: u32,
        step: usize,
        n: i32,
        item_type: i32,
    ) -> Result<()> {
        self.set_rule_step(rule_id, step, RuleOp::ChooseLeafIndep, n, item_type)
    }

    pub fn set_rule_step_emit(&mut self, rule_id: u32, step: usize) -> Result<()> {
        self.set_rule_step(rule_id, step, RuleOp::Emit, 0, 0)
    }

    /// Seal the map: recompute derived state and validate invariants.
    pub fn finalize(&mut self) -> Result<()> {
        self.check_names()?;
        self.check_children()?;

        for slot in 0..self.buckets.len() {
            let Some(bucket) = &self.buckets[slot] else { continue };
            let summed = sum_weights(bucket.id, &bucket.weights)?;
            if bucket.weight != summed {
                return Err(CrushError::WeightMismatch {
                    bucket: bucket.id,
                    stored: bucket.weight,
                    summed,
                });
            }
            let data = match bucket.alg {
                BucketAlgorithm::Uniform => BucketData::Uniform {
                    item_weight: bucket.weights.first().copied().unwrap_or(0),
                },
                BucketAlgorithm::List => BucketData::List {
                    sum_weights: prefix_sums(&bucket.weights),
                },
                BucketAlgorithm::Tree => {
                    let node_weights = build_tree_nodes(&bucket.weights);
                    BucketData::Tree {
                        num_nodes: node_weights.len() as u32,
                        node_weights,
                    }
                }
                BucketAlgorithm::Straw => BucketData::Straw {
                    straws: calc_straws(&bucket.weights),
                },
            };
            if let Some(bucket) = &mut self.buckets[slot] {
                bucket.weight = summed;
                bucket.data = data;
            }
        }

        self.check_rules()?;
        Ok(())
    }

    /// Name tables must be injective: a name maps back to exactly one id.
    fn check_names(&self) -> Result<()> {
        let mut seen: BTreeMap<&str, i32> = BTreeMap::new();
        for (&id, name) in &self.names {
            if let Some(&first) = seen.get(name.as_str()) {
                return Err(CrushError::DuplicateName {
                    name: name.clone(),
                    first,
                    second: id,
                });
            }
            seen.insert(name, id);
        }
        let mut seen: BTreeMap<&str, i32> = BTreeMap::new();
        for (&id, name) in &self.rule_names {
            if let Some(&first) = seen.get(name.as_str()) {
                return Err(CrushError::DuplicateName {
                    name: name.clone(),
                    first,
                    second: id as i32,
                });
            }
            seen.insert(name, id as i32);
        }
        Ok(())
    }

    /// Every child must exist, sit strictly below its bucket's level, and
    /// have at most one parent. Only true holes (empty slots, which read as
    /// item 0 with weight 0) are exempt; a real item weighted to zero is
    /// still a child and still validated.
    fn check_children(&self) -> Result<()> {
        let mut parent: BTreeMap<i32, i32> = BTreeMap::new();
        for bucket in self.buckets.iter().flatten() {
            for (pos, &item) in bucket.items.iter().enumerate() {
                if item == 0 && bucket.weights[pos] == 0 {
                    continue;
                }
                if item >= self.max_devices {
                    return Err(CrushError::ItemNotFound(item));
                }
                let item_level = if item >= 0 {
                    0
                } else {
                    self.get_bucket(item)?.bucket_type
                };
                if item_level >= bucket.bucket_type {
                    return Err(CrushError::LevelViolation {
                        bucket: bucket.id,
                        item,
                        item_level,
                        bucket_level: bucket.bucket_type,
                    });
                }
                if let Some(&other) = parent.get(&item) {
                    if other != bucket.id {
                        return Err(CrushError::MultipleParents {
                            item,
                            first: other,
                            second: bucket.id,
                        });
                    }
                }
                parent.insert(item, bucket.id);
            }
        }
        Ok(())
    }

    /// A rule must TAKE before it CHOOSEs and must EMIT at least once.
    fn check_rules(&self) -> Result<()> {
        for (rule_id, rule) in self.rules.iter().enumerate() {
            let Some(rule) = rule else { continue };
            let rule_id = rule_id as u32;
            let mut took = false;
            let mut emitted = false;
            for step in &rule.steps {
                match step.op {
                    RuleOp::Take => took = true,
                    RuleOp::Emit => emitted = true,
                    RuleOp::ChooseFirstN
                    | RuleOp::ChooseIndep
                    | RuleOp::ChooseLeafFirstN
                    | RuleOp::ChooseLeafIndep => {
                        if !took {
                            return Err(CrushError::ChooseBeforeTake(rule_id));
                        }
                    }
                    RuleOp::Noop => {}
                }
            }
            if !emitted {
                return Err(CrushError::MissingEmit(rule_id));
            }
        }
        Ok(())
    }
}

/// Fixed-point sum with a 64-bit accumulator
fn sum_weights(bucket: i32, weights: &[u32]) -> Result<u32> {
    let total: u64 = weights.iter().map(|&w| w as u64).sum();
    u32::try_from(total).map_err(|_| CrushError::WeightOverflow(bucket))
}

/// Cumulative weight at each list position
fn prefix_sums(weights: &[u32]) -> Vec<u32> {
    let mut sums = Vec::with_capacity(weights.len());
    let mut total = 0u32;
    for &w in weights {
        total += w;
        sums.push(total);
    }
    sums
}

/// Bits needed to address `size` leaves in the implicit tree
fn tree_depth(size: usize) -> u32 {
    if size == 0 {
        return 0;
    }
    let mut depth = 1;
    let mut t = size - 1;
    while t != 0 {
        t >>= 1;
        depth += 1;
    }
    depth
}

fn node_height(node: usize) -> u32 {
    node.trailing_zeros()
}

fn node_parent(node: usize) -> usize {
    let h = node_height(node);
    (node | (1 << (h + 1))) & !(1 << h)
}

/// Build the in-order subtree-weight array for a tree bucket.
///
/// Leaf `p` sits at node `2p + 1`; internal nodes hold the summed weight of
/// their subtree; node 0 is unused padding.
fn build_tree_nodes(weights: &[u32]) -> Vec<u32> {
    if weights.is_empty() {
        return Vec::new();
    }
    let depth = tree_depth(weights.len());
    let num_nodes = 1usize << depth;
    let mut nodes = vec![0u32; num_nodes];
    for (p, &w) in weights.iter().enumerate() {
        let mut node = 2 * p + 1;
        nodes[node] = w;
        for _ in 1..depth {
            node = node_parent(node);
            nodes[node] += w;
        }
    }
    nodes
}

/// Compute straw lengths for a straw bucket.
///
/// Items are visited in ascending weight order; each distinct weight class
/// scales the running straw so that the expected win probability of every
/// item is proportional to its weight. Zero-weight items draw straws of
/// length zero and can never win.
fn calc_straws(weights: &[u32]) -> Vec<u32> {
    let size = weights.len();
    let mut straws = vec![0u32; size];
    let mut order: Vec<usize> = (0..size).collect();
    order.sort_by_key(|&i| weights[i]);

    let mut numleft = size as i64;
    let mut straw = 1.0f64;
    let mut wbelow = 0.0f64;
    let mut lastw = 0.0f64;

    let mut i = 0;
    while i < size {
        if weights[order[i]] == 0 {
            i += 1;
            continue;
        }
        straws[order[i]] = (straw * 65536.0) as u32;
        i += 1;
        if i == size {
            break;
        }
        if weights[order[i]] == weights[order[i - 1]] {
            continue;
        }
        wbelow += (weights[order[i - 1]] as f64 - lastw) * numleft as f64;
        for j in i..size {
            if weights[order[j]] == weights[order[i]] {
                numleft -= 1;
            } else {
                break;
            }
        }
        let wnext = numleft as f64 * (weights[order[i]] as f64 - weights[order[i - 1]] as f64);
        let pbelow = wbelow / (wbelow + wnext);
        straw *= (1.0 / pbelow).powf(1.0 / numleft as f64);
        lastw = weights[order[i - 1]] as f64;
    }
    straws
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_level_map() -> CrushMap {
        let mut map = CrushMap::new();
        map.set_max_devices(3);
        map.set_type_name(0, "device");
        map.set_type_name(1, "host");
        map.set_item_name(0, "osd0");
        map.set_item_name(1, "osd1");
        map.set_item_name(2, "osd2");
        map.add_bucket(
            -1,
            BucketAlgorithm::Straw,
            1,
            &[0, 1, 2],
            &[0x10000, 0x20000, 0x10000],
        )
        .unwrap();
        map.set_item_name(-1, "host0");
        map
    }

    #[test]
    fn test_finalize_sums_weights() {
        let mut map = two_level_map();
        map.finalize().unwrap();
        assert_eq!(map.get_bucket(-1).unwrap().weight, 0x40000);
    }

    #[test]
    fn test_finalize_straw_lengths() {
        let mut map = two_level_map();
        map.finalize().unwrap();
        let bucket = map.get_bucket(-1).unwrap();
        let BucketData::Straw { straws } = &bucket.data else {
            panic!("expected straw data");
        };
        assert_eq!(straws.len(), 3);
        // equal-weight items share a straw; the heavier item draws longer
        assert_eq!(straws[0], straws[2]);
        assert!(straws[1] > straws[0]);
        assert_eq!(straws[0], 0x10000);
    }

    #[test]
    fn test_zero_weight_straw() {
        let mut map = CrushMap::new();
        map.set_max_devices(2);
        map.set_type_name(1, "host");
        map.set_item_name(0, "osd0");
        map.set_item_name(1, "osd1");
        map.add_bucket(-1, BucketAlgorithm::Straw, 1, &[0, 1], &[0, 0x10000])
            .unwrap();
        map.set_item_name(-1, "host0");
        map.finalize().unwrap();
        let BucketData::Straw { straws } = &map.get_bucket(-1).unwrap().data else {
            panic!("expected straw data");
        };
        assert_eq!(straws[0], 0);
        assert!(straws[1] > 0);
    }

    #[test]
    fn test_list_prefix_sums() {
        let mut map = CrushMap::new();
        map.set_max_devices(3);
        map.set_type_name(1, "host");
        map.add_bucket(
            -1,
            BucketAlgorithm::List,
            1,
            &[0, 1, 2],
            &[0x8000, 0x10000, 0x4000],
        )
        .unwrap();
        map.set_item_name(-1, "l0");
        map.finalize().unwrap();
        let BucketData::List { sum_weights } = &map.get_bucket(-1).unwrap().data else {
            panic!("expected list data");
        };
        assert_eq!(sum_weights, &[0x8000, 0x18000, 0x1c000]);
    }

    #[test]
    fn test_tree_nodes() {
        // 3 leaves -> depth 3, 8 nodes, leaves at 1/3/5, root at 4
        let nodes = build_tree_nodes(&[0x10000, 0x20000, 0x30000]);
        assert_eq!(nodes.len(), 8);
        assert_eq!(nodes[1], 0x10000);
        assert_eq!(nodes[3], 0x20000);
        assert_eq!(nodes[5], 0x30000);
        assert_eq!(nodes[2], 0x30000); // parent of leaves 0 and 1
        assert_eq!(nodes[6], 0x30000); // parent of leaf 2 (right subtree)
        assert_eq!(nodes[4], 0x60000); // root
    }

    #[test]
    fn test_tree_depth() {
        assert_eq!(tree_depth(0), 0);
        assert_eq!(tree_depth(1), 1);
        assert_eq!(tree_depth(2), 2);
        assert_eq!(tree_depth(3), 3);
        assert_eq!(tree_depth(4), 3);
        assert_eq!(tree_depth(5), 4);
    }

    #[test]
    fn test_level_violation() {
        let mut map = CrushMap::new();
        map.set_max_devices(1);
        map.add_bucket(-1, BucketAlgorithm::Straw, 1, &[0], &[0x10000])
            .unwrap();
        map.set_item_name(-1, "host0");
        // a level-1 bucket containing another level-1 bucket is illegal
        map.add_bucket(-2, BucketAlgorithm::Straw, 1, &[-1], &[0x10000])
            .unwrap();
        map.set_item_name(-2, "host1");
        assert!(matches!(
            map.finalize(),
            Err(CrushError::LevelViolation { .. })
        ));
    }

    #[test]
    fn test_zero_weight_child_still_validated() {
        let mut map = CrushMap::new();
        map.set_max_devices(1);
        map.add_bucket(-1, BucketAlgorithm::Straw, 1, &[0], &[0x10000])
            .unwrap();
        map.set_item_name(-1, "host0");
        // a same-level child stays illegal even when weighted to zero
        map.add_bucket(-2, BucketAlgorithm::Straw, 1, &[-1], &[0])
            .unwrap();
        map.set_item_name(-2, "host1");
        assert!(matches!(
            map.finalize(),
            Err(CrushError::LevelViolation { .. })
        ));
    }

    #[test]
    fn test_zero_weight_unknown_item_rejected() {
        let mut map = CrushMap::new();
        map.set_max_devices(1);
        map.add_bucket(-1, BucketAlgorithm::Straw, 1, &[5], &[0])
            .unwrap();
        map.set_item_name(-1, "host0");
        assert!(matches!(map.finalize(), Err(CrushError::ItemNotFound(5))));
    }

    #[test]
    fn test_rule_validation() {
        let mut map = CrushMap::new();
        map.set_max_devices(1);
        map.add_bucket(-1, BucketAlgorithm::Straw, 1, &[0], &[0x10000])
            .unwrap();
        map.set_item_name(-1, "root");

        let r = map.add_rule(2, 0, RuleType::Replicated, 1, 10);
        map.set_rule_step_choose_firstn(r, 0, 1, 0).unwrap();
        map.set_rule_step_emit(r, 1).unwrap();
        assert!(matches!(
            map.finalize(),
            Err(CrushError::ChooseBeforeTake(0))
        ));

        map.rules.clear();
        let r = map.add_rule(2, 0, RuleType::Replicated, 1, 10);
        map.set_rule_step_take(r, 0, -1).unwrap();
        map.set_rule_step_choose_firstn(r, 1, 1, 0).unwrap();
        assert!(matches!(map.finalize(), Err(CrushError::MissingEmit(0))));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut map = CrushMap::new();
        map.set_max_devices(2);
        map.set_item_name(0, "osd0");
        map.set_item_name(1, "osd0");
        assert!(matches!(
            map.finalize(),
            Err(CrushError::DuplicateName { .. })
        ));
    }

    #[test]
    fn test_offload_range() {
        let mut map = CrushMap::new();
        map.set_max_devices(1);
        map.set_offload(0, 0x4000).unwrap();
        assert_eq!(map.get_device_offload(0), 0x4000);
        assert!(map.set_offload(0, 0x10001).is_err());
        assert!(map.set_offload(5, 0).is_err());
    }
}
