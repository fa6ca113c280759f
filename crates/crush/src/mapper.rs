//! CRUSH rule execution.
//!
//! Walks a rule's steps over a working set of map nodes, descending through
//! buckets with [`bucket_choose`] until items of the requested type are
//! found. Collisions and offloaded devices are retried with an incremented
//! try index, bounded by a total-tries budget; exhaustion emits fewer items
//! than requested rather than failing.

use crate::bucket::bucket_choose;
use crate::error::Result;
use crate::hash::crush_hash32_2;
use crate::types::{CrushMap, RuleOp};

/// Retry budget per selected replica
const CHOOSE_TOTAL_TRIES: u32 = 19;

/// Whether a device should be rejected for input `x`.
///
/// Offload 0 always accepts, 0x10000 always rejects; fractions reject
/// pseudo-randomly in proportion so partial drains stay deterministic per
/// input key.
fn is_out(map: &CrushMap, item: i32, x: u32) -> bool {
    if item < 0 || item >= map.max_devices {
        return true;
    }
    let offload = map.device_offload[item as usize];
    if offload == 0 {
        return false;
    }
    if offload >= 0x10000 {
        return true;
    }
    let hash = crush_hash32_2(x, item as u32);
    (hash & 0xffff) < offload
}

/// Evaluate a rule: map input `x` to an ordered list of device ids.
///
/// Convenience wrapper over [`crush_do_rule`].
pub fn place(map: &CrushMap, rule_id: u32, input_key: u32, replica_count: usize) -> Result<Vec<i32>> {
    let mut result = Vec::new();
    crush_do_rule(map, rule_id, input_key, &mut result, replica_count)?;
    Ok(result)
}

/// Execute a CRUSH rule, appending up to `result_max` device ids to
/// `result`
pub fn crush_do_rule(
    map: &CrushMap,
    rule_id: u32,
    x: u32,
    result: &mut Vec<i32>,
    result_max: usize,
) -> Result<()> {
    let rule = map.get_rule(rule_id)?;

    result.clear();

    // working set of current selections
    let mut work: Vec<i32> = Vec::new();
    let mut scratch: Vec<i32> = Vec::new();

    for step in &rule.steps {
        match step.op {
            RuleOp::Take => {
                work.clear();
                work.push(step.arg1);
            }

            RuleOp::ChooseFirstN | RuleOp::ChooseLeafFirstN => {
                let recurse_to_leaf = step.op == RuleOp::ChooseLeafFirstN;
                let numrep = if step.arg1 == 0 {
                    result_max as i32
                } else if step.arg1 > 0 {
                    step.arg1
                } else {
                    // negative n asks for result_max + n replicas
                    (result_max as i32) + step.arg1
                };
                let item_type = step.arg2;

                scratch.clear();
                for &item in &work {
                    choose_firstn(
                        map,
                        item,
                        x,
                        numrep.max(0) as usize,
                        item_type,
                        recurse_to_leaf,
                        &mut scratch,
                    )?;
                }
                work.clone_from(&scratch);
            }

            RuleOp::Emit => {
                for &item in &work {
                    if result.len() < result_max {
                        result.push(item);
                    }
                }
                work.clear();
            }

            RuleOp::ChooseIndep | RuleOp::ChooseLeafIndep => {
                tracing::warn!("Unsupported CRUSH rule operation: {:?}", step.op);
            }

            RuleOp::Noop => {}
        }
    }

    Ok(())
}

/// Select `numrep` distinct items of `item_type` under `bucket_id`.
///
/// Each replica restarts the descent from the take point; a rejected pick
/// (collision, offloaded device, dead-end bucket) retries the whole descent
/// with the try counter folded into the replica index.
fn choose_firstn(
    map: &CrushMap,
    bucket_id: i32,
    x: u32,
    numrep: usize,
    item_type: i32,
    recurse_to_leaf: bool,
    out: &mut Vec<i32>,
) -> Result<()> {
    tracing::debug!(
        "choose_firstn: bucket_id={}, numrep={}, item_type={}, recurse_to_leaf={}",
        bucket_id,
        numrep,
        item_type,
        recurse_to_leaf
    );

    // taking a device directly is legal when the step asks for devices
    if bucket_id >= 0 {
        if item_type == 0 && !is_out(map, bucket_id, x) && !out.contains(&bucket_id) {
            out.push(bucket_id);
        }
        return Ok(());
    }

    let bucket = map.get_bucket(bucket_id)?;

    // intermediate picks accepted so far; keeps chooseleaf replicas in
    // distinct subtrees even though `out` only collects devices
    let mut chosen: Vec<i32> = Vec::new();

    for rep in 0..numrep {
        let mut found = false;

        'tries: for ftotal in 0..CHOOSE_TOTAL_TRIES {
            // r' = r + f_total
            let r = rep as u32 + ftotal;
            let mut current_bucket = bucket;

            loop {
                let item = match bucket_choose(current_bucket, x, r) {
                    Some(item) => item,
                    None => continue 'tries,
                };

                let item_level = if item >= 0 {
                    0
                } else {
                    match map.get_bucket(item) {
                        Ok(b) => b.bucket_type,
                        Err(_) => continue 'tries,
                    }
                };

                if item_level != item_type {
                    if item >= 0 {
                        // a device where an inner type was requested
                        continue 'tries;
                    }
                    current_bucket = map.get_bucket(item)?;
                    continue;
                }

                if out.contains(&item) || chosen.contains(&item) {
                    continue 'tries;
                }

                if item >= 0 && is_out(map, item, x) {
                    continue 'tries;
                }

                if recurse_to_leaf && item < 0 {
                    let before_len = out.len();
                    choose_firstn(map, item, x, 1, 0, true, out)?;
                    if out.len() > before_len {
                        chosen.push(item);
                        found = true;
                        break 'tries;
                    }
                    continue 'tries;
                }

                chosen.push(item);
                out.push(item);
                found = true;
                break 'tries;
            }
        }

        if !found {
            tracing::debug!(
                "choose_firstn: no item for replica {} of bucket {} after {} tries",
                rep,
                bucket_id,
                CHOOSE_TOTAL_TRIES
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BucketAlgorithm, RuleType};

    /// Two hosts of two devices each under one straw root
    fn test_map() -> CrushMap {
        let mut map = CrushMap::new();
        map.set_max_devices(4);
        map.set_type_name(0, "device");
        map.set_type_name(1, "host");
        map.set_type_name(2, "root");
        for i in 0..4 {
            map.set_item_name(i, &format!("osd{}", i));
        }
        map.add_bucket(-1, BucketAlgorithm::Straw, 1, &[0, 1], &[0x10000, 0x10000])
            .unwrap();
        map.set_item_name(-1, "host0");
        map.add_bucket(-2, BucketAlgorithm::Straw, 1, &[2, 3], &[0x10000, 0x10000])
            .unwrap();
        map.set_item_name(-2, "host1");
        map.add_bucket(-3, BucketAlgorithm::Straw, 2, &[-1, -2], &[0x20000, 0x20000])
            .unwrap();
        map.set_item_name(-3, "root");

        let r = map.add_rule(3, 0, RuleType::Replicated, 1, 10);
        map.set_rule_step_take(r, 0, -3).unwrap();
        map.set_rule_step_choose_leaf_firstn(r, 1, 0, 1).unwrap();
        map.set_rule_step_emit(r, 2).unwrap();

        map.finalize().unwrap();
        map
    }

    #[test]
    fn test_is_out() {
        let mut map = test_map();
        map.set_offload(1, 0x10000).unwrap();

        assert!(!is_out(&map, 0, 123));
        assert!(is_out(&map, 1, 123));
        // out of the device id space entirely
        assert!(is_out(&map, 10, 123));
        assert!(is_out(&map, -1, 123));
    }

    #[test]
    fn test_place_distinct_devices() {
        let map = test_map();
        for x in 0..32 {
            let devices = place(&map, 0, x, 2).unwrap();
            assert!(devices.len() <= 2);
            for &d in &devices {
                assert!((0..4).contains(&d));
            }
            if devices.len() == 2 {
                assert_ne!(devices[0], devices[1]);
                // chooseleaf over hosts puts replicas on different hosts
                assert_ne!(devices[0] / 2, devices[1] / 2);
            }
        }
    }

    #[test]
    fn test_place_deterministic() {
        let map = test_map();
        assert_eq!(
            place(&map, 0, 42, 2).unwrap(),
            place(&map, 0, 42, 2).unwrap()
        );
    }

    #[test]
    fn test_offloaded_device_avoided() {
        let mut map = test_map();
        map.set_offload(2, 0x10000).unwrap();
        map.set_offload(3, 0x10000).unwrap();
        for x in 0..32 {
            let devices = place(&map, 0, x, 2).unwrap();
            for &d in &devices {
                assert!(d == 0 || d == 1, "offloaded device {} placed", d);
            }
        }
    }

    #[test]
    fn test_unknown_rule() {
        let map = test_map();
        assert!(place(&map, 9, 1, 2).is_err());
    }
}
