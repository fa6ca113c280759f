//! Semantic builder: syntax tree -> populated, finalized CrushMap.
//!
//! All cross-referencing state lives in a [`CompileContext`] that exists for
//! one compile invocation: name/id registries for items, types and rules,
//! the bucket-id reservation set from the pre-scan, and the device offloads
//! collected for application after finalize.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crush::{BucketAlgorithm, CrushMap, RuleType};
use tracing::info;

use crate::ast::{BucketDecl, Decl, DeviceDecl, OffloadSpec, Program, RuleDecl, StepKind, TypeDecl};
use crate::error::{CompileError, Result};
use crate::parser;

/// 16.16 fixed-point scale shared with the map library
const FIXED_ONE: f64 = 65536.0;

/// Compile DSL source text into a finalized map
pub fn compile(source: &str) -> Result<CrushMap> {
    let program = parser::parse(source)?;
    compile_program(&program)
}

/// Compile an already-parsed program
pub fn compile_program(program: &Program) -> Result<CrushMap> {
    let mut ctx = CompileContext::default();
    let mut map = CrushMap::new();

    ctx.prescan(program)?;
    for decl in &program.decls {
        match decl {
            Decl::Device(d) => ctx.device(&mut map, d)?,
            Decl::BucketType(t) => ctx.bucket_type(&mut map, t)?,
            Decl::Bucket(b) => ctx.bucket(&mut map, b)?,
            Decl::Rule(r) => ctx.rule(&mut map, r)?,
        }
    }

    map.finalize()?;
    for (&id, &offload) in &ctx.device_offload {
        map.set_offload(id, offload)?;
    }
    Ok(map)
}

#[derive(Default)]
struct CompileContext {
    item_id: HashMap<String, i32>,
    id_item: HashMap<i32, String>,
    /// summed weight of every defined bucket, for default item weights
    item_weight: HashMap<i32, u32>,
    type_id: HashMap<String, i32>,
    rule_id: HashMap<String, u32>,
    /// offloads applied after finalize, in device order
    device_offload: BTreeMap<i32, u32>,
    /// explicit bucket ids seen by the pre-scan
    reserved_ids: BTreeSet<i32>,
}

fn to_fixed(value: f64) -> u32 {
    (value * FIXED_ONE).round() as u32
}

impl CompileContext {
    /// Record every explicitly assigned bucket id so auto-assignment can
    /// avoid them; two buckets claiming the same id is diagnosed here.
    fn prescan(&mut self, program: &Program) -> Result<()> {
        for decl in &program.decls {
            let Decl::Bucket(bucket) = decl else { continue };
            let Some(id) = bucket.id else { continue };
            if id == 0 {
                continue;
            }
            let Ok(id32) = i32::try_from(id) else { continue };
            if id32 < 0 && !self.reserved_ids.insert(id32) {
                return Err(CompileError::DuplicateBucketId(id));
            }
        }
        Ok(())
    }

    fn device(&mut self, map: &mut CrushMap, decl: &DeviceDecl) -> Result<()> {
        let id = i32::try_from(decl.id)
            .ok()
            .filter(|&v| v >= 0)
            .ok_or(CompileError::DeviceIdRange(decl.id))?;
        if self.item_id.contains_key(&decl.name) {
            return Err(CompileError::DuplicateDevice(decl.name.clone()));
        }
        if self.id_item.contains_key(&id) {
            return Err(CompileError::DuplicateDeviceId(decl.id));
        }

        map.set_item_name(id, &decl.name);
        self.item_id.insert(decl.name.clone(), id);
        self.id_item.insert(id, decl.name.clone());

        if let Some(spec) = decl.offload {
            let offload = match spec {
                OffloadSpec::Offload(v) => v,
                OffloadSpec::Load(v) => 1.0 - v,
                OffloadSpec::Down => 1.0,
            };
            if !(0.0..=1.0).contains(&offload) {
                return Err(CompileError::IllegalOffload {
                    id: decl.id,
                    name: decl.name.clone(),
                    value: offload,
                });
            }
            self.device_offload.insert(id, to_fixed(offload));
            info!("device {} {} offload {}", id, decl.name, offload);
        } else {
            info!("device {} {}", id, decl.name);
        }

        if id >= map.max_devices {
            map.set_max_devices(id + 1);
        }
        Ok(())
    }

    fn bucket_type(&mut self, map: &mut CrushMap, decl: &TypeDecl) -> Result<()> {
        let level =
            i32::try_from(decl.level).map_err(|_| CompileError::TypeLevelRange(decl.level))?;
        info!("type {} {}", level, decl.name);
        self.type_id.insert(decl.name.clone(), level);
        map.set_type_name(level, &decl.name);
        Ok(())
    }

    fn bucket(&mut self, map: &mut CrushMap, decl: &BucketDecl) -> Result<()> {
        let level = *self
            .type_id
            .get(&decl.type_name)
            .ok_or_else(|| CompileError::UnknownType(decl.type_name.clone()))?;
        if level <= 0 {
            return Err(CompileError::BucketAtDeviceLevel(decl.name.clone()));
        }
        if self.item_id.contains_key(&decl.name) {
            return Err(CompileError::DuplicateItem(decl.name.clone()));
        }
        let alg = match decl.alg.as_deref() {
            None => return Err(CompileError::MissingAlg(decl.name.clone())),
            Some("uniform") => BucketAlgorithm::Uniform,
            Some("list") => BucketAlgorithm::List,
            Some("tree") => BucketAlgorithm::Tree,
            Some("straw") => BucketAlgorithm::Straw,
            Some(other) => return Err(CompileError::UnknownAlg(other.to_string())),
        };

        // first pass: claimed positions and the slot-array size
        let mut used_positions: BTreeSet<i64> = BTreeSet::new();
        let mut seen_names: BTreeSet<&str> = BTreeSet::new();
        let mut max_pos: i64 = -1;
        for item in &decl.items {
            if !seen_names.insert(item.name.as_str()) {
                return Err(CompileError::DuplicateBucketItem {
                    bucket: decl.name.clone(),
                    item: item.name.clone(),
                });
            }
            if let Some(pos) = item.pos {
                if pos < 0 {
                    return Err(CompileError::IllegalPos {
                        bucket: decl.name.clone(),
                        item: item.name.clone(),
                        pos,
                    });
                }
                if !used_positions.insert(pos) {
                    return Err(CompileError::PosOccupied {
                        bucket: decl.name.clone(),
                        item: item.name.clone(),
                        pos,
                    });
                }
                max_pos = max_pos.max(pos);
            }
        }
        let size = (decl.items.len() as i64).max(max_pos + 1) as usize;

        // second pass: place items; implicit positions scan past every
        // claimed slot so user-specified positions stay untouched
        let mut items = vec![0i32; size];
        let mut weights = vec![0u32; size];
        let mut curpos: i64 = 0;
        for item in &decl.items {
            let item_id = *self.item_id.get(&item.name).ok_or_else(|| {
                CompileError::UnknownItem {
                    bucket: decl.name.clone(),
                    item: item.name.clone(),
                }
            })?;
            let weight = match item.weight {
                Some(w) => {
                    if !w.is_finite() || w < 0.0 || w * FIXED_ONE > u32::MAX as f64 {
                        return Err(CompileError::IllegalWeight {
                            bucket: decl.name.clone(),
                            item: item.name.clone(),
                            value: w,
                        });
                    }
                    to_fixed(w)
                }
                None => self.item_weight.get(&item_id).copied().unwrap_or(0x10000),
            };
            let pos = match item.pos {
                Some(p) => p,
                None => {
                    while used_positions.contains(&curpos) {
                        curpos += 1;
                    }
                    let p = curpos;
                    curpos += 1;
                    p
                }
            } as usize;
            items[pos] = item_id;
            weights[pos] = weight;
        }

        // explicit id, or the first unused negative id not reserved by a
        // later bucket
        let id = match decl.id {
            Some(v) if v != 0 => {
                let id32 = i32::try_from(v).ok().filter(|&x| x < 0).ok_or_else(|| {
                    CompileError::BucketIdNotNegative {
                        bucket: decl.name.clone(),
                        id: v,
                    }
                })?;
                if self.id_item.contains_key(&id32) {
                    return Err(CompileError::DuplicateBucketId(v));
                }
                id32
            }
            _ => {
                let mut id = -1;
                while self.reserved_ids.contains(&id) || self.id_item.contains_key(&id) {
                    id -= 1;
                }
                id
            }
        };

        map.add_bucket(id, alg, level, &items, &weights)?;
        map.set_item_name(id, &decl.name);

        let summed = map.get_bucket(id)?.weight;
        self.id_item.insert(id, decl.name.clone());
        self.item_id.insert(decl.name.clone(), id);
        self.item_weight.insert(id, summed);
        info!(
            "bucket {} ({}) {} items and weight {}",
            decl.name,
            id,
            size,
            summed as f64 / FIXED_ONE
        );
        Ok(())
    }

    fn rule(&mut self, map: &mut CrushMap, decl: &RuleDecl) -> Result<()> {
        let label = decl.name.clone().unwrap_or_default();
        if let Some(name) = &decl.name {
            if self.rule_id.contains_key(name) {
                return Err(CompileError::DuplicateRuleName(name.clone()));
            }
        }

        let rule_type = match decl.rule_type.as_str() {
            "replicated" => RuleType::Replicated,
            "raid4" => RuleType::Raid4,
            other => return Err(CompileError::UnknownRuleType(other.to_string())),
        };
        let mask_field = |field: &'static str, value: i64| -> Result<u8> {
            u8::try_from(value).map_err(|_| CompileError::RuleMaskRange {
                rule: label.clone(),
                field,
                value,
            })
        };
        let pool = mask_field("pool", decl.pool)?;
        let min_size = mask_field("min_size", decl.min_size)?;
        let max_size = mask_field("max_size", decl.max_size)?;

        let rule_id = map.add_rule(decl.steps.len(), pool, rule_type, min_size, max_size);
        if let Some(name) = &decl.name {
            map.set_rule_name(rule_id, name);
            self.rule_id.insert(name.clone(), rule_id);
        }
        info!("rule {} ({}) {} steps", label, rule_id, decl.steps.len());

        for (step_index, step) in decl.steps.iter().enumerate() {
            match &step.kind {
                StepKind::Take { item } => {
                    let item_id =
                        *self
                            .item_id
                            .get(item)
                            .ok_or_else(|| CompileError::UnknownStepItem {
                                rule: label.clone(),
                                item: item.clone(),
                            })?;
                    map.set_rule_step_take(rule_id, step_index, item_id)?;
                }
                StepKind::Choose { leaf, firstn, n, type_name } => {
                    let item_type = *self.type_id.get(type_name).ok_or_else(|| {
                        CompileError::UnknownStepType {
                            rule: label.clone(),
                            type_name: type_name.clone(),
                        }
                    })?;
                    let n = i32::try_from(*n).map_err(|_| CompileError::StepArgRange {
                        rule: label.clone(),
                        value: *n,
                    })?;
                    match (leaf, firstn) {
                        (false, true) => {
                            map.set_rule_step_choose_firstn(rule_id, step_index, n, item_type)?
                        }
                        (false, false) => {
                            map.set_rule_step_choose_indep(rule_id, step_index, n, item_type)?
                        }
                        (true, true) => map.set_rule_step_choose_leaf_firstn(
                            rule_id, step_index, n, item_type,
                        )?,
                        (true, false) => map.set_rule_step_choose_leaf_indep(
                            rule_id, step_index, n, item_type,
                        )?,
                    }
                }
                StepKind::Emit => map.set_rule_step_emit(rule_id, step_index)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crush::RuleOp;

    #[test]
    fn test_offload_values() {
        let map = compile(
            "device 3 osd3 offload 0.250\n\
             device 4 osd4 load 0.750\n\
             device 5 osd5 down\n",
        )
        .unwrap();
        assert_eq!(map.get_device_offload(3), 0x4000);
        assert_eq!(map.get_device_offload(4), 0x4000);
        assert_eq!(map.get_device_offload(5), 0x10000);
        assert_eq!(map.get_device_offload(0), 0);
        assert_eq!(map.max_devices, 6);
    }

    #[test]
    fn test_offload_out_of_range() {
        let err = compile("device 6 osd6 offload 1.5\n").unwrap_err();
        assert!(matches!(err, CompileError::IllegalOffload { .. }));
    }

    #[test]
    fn test_position_collision() {
        let err = compile(
            "device 0 a\ndevice 1 b\ntype 1 host\n\
             host h { alg straw item a pos 2 item b pos 2 }\n",
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::PosOccupied { pos: 2, .. }));
    }

    #[test]
    fn test_auto_assigned_bucket_id() {
        let map = compile(
            "device 0 a\ndevice 1 b\ndevice 2 c\ntype 1 host\n\
             host h1 { id -1 alg straw item a }\n\
             host h2 { id -2 alg straw item b }\n\
             host h3 { alg straw item c }\n",
        )
        .unwrap();
        assert_eq!(map.item_name(-3), Some("h3"));
        assert!(map.bucket_exists(-3));
    }

    #[test]
    fn test_auto_assignment_avoids_reserved_ids() {
        // the auto bucket precedes an explicit -3; the pre-scan steers
        // auto-assignment around it
        let map = compile(
            "device 0 a\ndevice 1 b\ndevice 2 c\ndevice 3 d\ntype 1 host\n\
             host h1 { id -1 alg straw item a }\n\
             host h2 { id -2 alg straw item b }\n\
             host h3 { alg straw item c }\n\
             host h4 { id -3 alg straw item d }\n",
        )
        .unwrap();
        assert_eq!(map.item_name(-3), Some("h4"));
        assert_eq!(map.item_name(-4), Some("h3"));
    }

    #[test]
    fn test_duplicate_explicit_bucket_id() {
        let err = compile(
            "device 0 a\ndevice 1 b\ntype 1 host\n\
             host h1 { id -3 alg straw item a }\n\
             host h2 { id -3 alg straw item b }\n",
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::DuplicateBucketId(-3)));
    }

    #[test]
    fn test_forward_reference_rejected() {
        let err = compile(
            "device 0 a\ntype 1 host\ntype 2 root\n\
             root r { alg straw item h }\n\
             host h { alg straw item a }\n",
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::UnknownItem { .. }));
    }

    #[test]
    fn test_default_weights() {
        // devices default to 1.0; buckets default to their summed weight
        let map = compile(
            "device 0 a\ndevice 1 b\ndevice 2 c\ntype 1 host\ntype 2 root\n\
             host h { id -1 alg straw item a item b weight 2.500 }\n\
             root r { id -2 alg straw item h item c }\n",
        )
        .unwrap();
        let host = map.get_bucket(-1).unwrap();
        assert_eq!(host.weights, vec![0x10000, 0x28000]);
        assert_eq!(host.weight, 0x38000);
        let root = map.get_bucket(-2).unwrap();
        assert_eq!(root.weights, vec![0x38000, 0x10000]);
    }

    #[test]
    fn test_rule_translation() {
        let map = compile(
            "device 0 a\ntype 0 device\ntype 1 host\ntype 2 root\n\
             host h { id -1 alg straw item a }\n\
             root r { id -2 alg straw item h }\n\
             rule data { pool 0 type replicated min_size 1 max_size 10\n\
             step take r step chooseleaf firstn 3 type host step emit }\n",
        )
        .unwrap();
        let rule = map.get_rule(0).unwrap();
        assert_eq!(rule.mask.pool, 0);
        assert_eq!(rule.mask.rule_type, RuleType::Replicated);
        assert_eq!(rule.mask.min_size, 1);
        assert_eq!(rule.mask.max_size, 10);
        assert_eq!(rule.steps.len(), 3);
        assert_eq!(rule.steps[0].op, RuleOp::Take);
        assert_eq!(rule.steps[0].arg1, -2);
        assert_eq!(rule.steps[1].op, RuleOp::ChooseLeafFirstN);
        assert_eq!(rule.steps[1].arg1, 3);
        assert_eq!(rule.steps[1].arg2, 1);
        assert_eq!(rule.steps[2].op, RuleOp::Emit);
        assert_eq!(map.rule_name(0), Some("data"));
    }

    #[test]
    fn test_implicit_positions_skip_claimed_slots() {
        let map = compile(
            "device 0 a\ndevice 1 b\ndevice 2 c\ntype 1 host\n\
             host h { id -1 alg straw item a pos 1 item b item c }\n",
        )
        .unwrap();
        let bucket = map.get_bucket(-1).unwrap();
        // b takes slot 0, a claimed slot 1, c continues at slot 2
        assert_eq!(bucket.items, vec![1, 0, 2]);
    }

    #[test]
    fn test_hole_from_explicit_pos() {
        let map = compile(
            "device 0 a\ndevice 1 b\ntype 1 host\n\
             host h { id -1 alg straw item a pos 0 item b pos 3 }\n",
        )
        .unwrap();
        let bucket = map.get_bucket(-1).unwrap();
        assert_eq!(bucket.size, 4);
        assert_eq!(bucket.items, vec![0, 0, 0, 1]);
        assert_eq!(bucket.weights, vec![0x10000, 0, 0, 0x10000]);
    }

    #[test]
    fn test_unknown_alg() {
        let err = compile("device 0 a\ntype 1 host\nhost h { alg chacha item a }\n").unwrap_err();
        assert!(matches!(err, CompileError::UnknownAlg(_)));
    }

    #[test]
    fn test_unknown_bucket_type() {
        let err = compile("device 0 a\nrack h { alg straw item a }\n").unwrap_err();
        assert!(matches!(err, CompileError::UnknownType(_)));
    }

    #[test]
    fn test_rule_mask_range() {
        let err = compile(
            "device 0 a\ntype 1 host\nhost h { id -1 alg straw item a }\n\
             rule r { pool 300 type replicated min_size 1 max_size 10 step take h step emit }\n",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CompileError::RuleMaskRange { field: "pool", value: 300, .. }
        ));
    }

    #[test]
    fn test_duplicate_rule_name() {
        let err = compile(
            "device 0 a\ntype 1 host\nhost h { id -1 alg straw item a }\n\
             rule r { pool 0 type replicated min_size 1 max_size 10 step take h step emit }\n\
             rule r { pool 1 type replicated min_size 1 max_size 10 step take h step emit }\n",
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::DuplicateRuleName(_)));
    }
}
