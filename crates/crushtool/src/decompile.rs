//! CrushMap -> DSL text.
//!
//! The emitted program recompiles to a byte-identical map: every bucket id
//! is explicit, item positions are emitted wherever the algorithm (or a
//! hole left by a zero-weight slot) makes layout significant, and
//! fixed-point values print with enough digits to reparse to the same bits.

use crush::{BucketAlgorithm, CrushMap, RuleOp, RuleType};

/// Render a map as DSL source text
pub fn decompile(map: &CrushMap) -> String {
    let mut out = String::new();
    out.push_str("# begin crush map\n\n");

    out.push_str("# devices\n");
    for id in 0..map.max_devices {
        // devices a map never named carry no information a recompile
        // could need; emitting them would invent names
        let Some(name) = map.item_name(id) else { continue };
        out.push_str(&format!("device {} {}", id, name));
        let offload = map.get_device_offload(id);
        if offload != 0 {
            out.push_str(&format!(" offload {}", fixed(offload)));
        }
        out.push('\n');
    }

    out.push_str("\n# types\n");
    for (&level, name) in &map.type_names {
        out.push_str(&format!("type {} {}\n", level, name));
    }

    out.push_str("\n# buckets\n");
    // children before parents: levels strictly decrease downward, so
    // ascending level order always recompiles
    let mut bucket_ids: Vec<i32> = map
        .buckets
        .iter()
        .flatten()
        .map(|bucket| bucket.id)
        .collect();
    bucket_ids.sort_by_key(|&id| {
        let level = map.get_bucket(id).map(|b| b.bucket_type).unwrap_or(0);
        (level, std::cmp::Reverse(id))
    });
    for id in bucket_ids {
        let Ok(bucket) = map.get_bucket(id) else { continue };

        out.push_str(&format!(
            "{} {} {{\n",
            type_name(map, bucket.bucket_type),
            item_name(map, id)
        ));
        out.push_str(&format!("\tid {}\t\t# do not change unnecessarily\n", id));
        out.push_str(&format!("\talg {}", bucket.alg.name()));
        let mut dopos = false;
        match bucket.alg {
            BucketAlgorithm::Uniform => {
                out.push_str(&format!(
                    "\t# do not change bucket size ({}) unnecessarily",
                    bucket.size
                ));
                dopos = true;
            }
            BucketAlgorithm::List => {
                out.push_str("\t# add new items at the end; do not change order unnecessarily");
            }
            BucketAlgorithm::Tree => {
                out.push_str("\t# do not change pos for existing items unnecessarily");
                dopos = true;
            }
            BucketAlgorithm::Straw => {}
        }
        out.push('\n');

        for (pos, (&item, &weight)) in bucket.items.iter().zip(&bucket.weights).enumerate() {
            if item == 0 && weight == 0 {
                // unoccupied slot; later items must pin their positions
                dopos = true;
                continue;
            }
            if weight == 0 {
                dopos = true;
            }
            out.push_str(&format!(
                "\titem {} weight {}",
                item_name(map, item),
                fixed(weight)
            ));
            if dopos {
                out.push_str(&format!(" pos {}", pos));
            }
            out.push('\n');
        }
        out.push_str("}\n");
    }

    out.push_str("\n# rules\n");
    for rule_id in 0..map.max_rules() {
        let Ok(rule) = map.get_rule(rule_id) else { continue };

        match map.rule_name(rule_id) {
            Some(name) => out.push_str(&format!("rule {} {{\n", name)),
            None => out.push_str("rule {\n"),
        }
        out.push_str(&format!("\tpool {}\n", rule.mask.pool));
        out.push_str(match rule.mask.rule_type {
            RuleType::Replicated => "\ttype replicated\n",
            RuleType::Raid4 => "\ttype raid4\n",
        });
        out.push_str(&format!("\tmin_size {}\n", rule.mask.min_size));
        out.push_str(&format!("\tmax_size {}\n", rule.mask.max_size));
        for step in &rule.steps {
            match step.op {
                RuleOp::Noop => out.push_str("\tstep noop\n"),
                RuleOp::Take => {
                    out.push_str(&format!("\tstep take {}\n", item_name(map, step.arg1)))
                }
                RuleOp::Emit => out.push_str("\tstep emit\n"),
                RuleOp::ChooseFirstN => out.push_str(&format!(
                    "\tstep choose firstn {} type {}\n",
                    step.arg1,
                    type_name(map, step.arg2)
                )),
                RuleOp::ChooseIndep => out.push_str(&format!(
                    "\tstep choose indep {} type {}\n",
                    step.arg1,
                    type_name(map, step.arg2)
                )),
                RuleOp::ChooseLeafFirstN => out.push_str(&format!(
                    "\tstep chooseleaf firstn {} type {}\n",
                    step.arg1,
                    type_name(map, step.arg2)
                )),
                RuleOp::ChooseLeafIndep => out.push_str(&format!(
                    "\tstep chooseleaf indep {} type {}\n",
                    step.arg1,
                    type_name(map, step.arg2)
                )),
            }
        }
        out.push_str("}\n");
    }

    out.push_str("\n# end crush map\n");
    out
}

/// 16.16 fixed-point as text; five decimals round-trip every representable
/// value through the compiler's rounding conversion
fn fixed(value: u32) -> String {
    format!("{:.5}", value as f64 / 65536.0)
}

fn item_name(map: &CrushMap, id: i32) -> String {
    match map.item_name(id) {
        Some(name) => name.to_string(),
        None if id >= 0 => format!("device{}", id),
        None => format!("bucket{}", -1 - id),
    }
}

fn type_name(map: &CrushMap, level: i32) -> String {
    match map.type_name(level) {
        Some(name) => name.to_string(),
        None if level == 0 => "device".to_string(),
        None => format!("type{}", level),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::compile;

    fn recompiled_bytes_match(source: &str) {
        let map = compile(source).unwrap();
        let text = decompile(&map);
        let map2 = compile(&text).unwrap_or_else(|e| {
            panic!("decompiled output failed to compile: {}\n{}", e, text)
        });
        assert_eq!(map2.encode(), map.encode(), "decompiled text:\n{}", text);
    }

    #[test]
    fn test_minimal_roundtrip() {
        recompiled_bytes_match(
            "device 0 osd0\ntype 0 device\ntype 1 root\n\
             root r { id -1 alg straw item osd0 weight 1.000 }\n\
             rule data { pool 0 type replicated min_size 1 max_size 10 \
             step take r step choose firstn 0 type device step emit }\n",
        );
    }

    #[test]
    fn test_roundtrip_all_algorithms() {
        recompiled_bytes_match(
            "device 0 a\ndevice 1 b\ndevice 2 c\ndevice 3 d\n\
             device 4 e\ndevice 5 f\ndevice 6 g\ndevice 7 h\n\
             type 0 device\ntype 1 host\ntype 2 root\n\
             host h1 { id -1 alg uniform item a item b }\n\
             host h2 { id -2 alg list item c item d weight 2.000 }\n\
             host h3 { id -3 alg tree item e item f weight 0.500 }\n\
             host h4 { id -4 alg straw item g item h }\n\
             root r { id -5 alg straw item h1 item h2 item h3 item h4 }\n\
             rule data { pool 0 type replicated min_size 1 max_size 10 \
             step take r step chooseleaf firstn 0 type host step emit }\n",
        );
    }

    #[test]
    fn test_roundtrip_offloads_and_holes() {
        recompiled_bytes_match(
            "device 0 a\ndevice 1 b offload 0.250\ndevice 2 c down\ndevice 3 d load 0.125\n\
             type 0 device\ntype 1 host\n\
             host h1 { id -1 alg straw item a item b pos 4 item c item d }\n",
        );
    }

    #[test]
    fn test_hole_forces_explicit_pos() {
        // straw bucket, five items, the one at pos 2 weighted to zero
        let map = compile(
            "device 0 a\ndevice 1 b\ndevice 2 c\ndevice 3 d\ndevice 4 e\n\
             type 0 device\ntype 1 host\n\
             host h1 { id -1 alg straw item a item b item c weight 0.000 item d item e }\n",
        )
        .unwrap();
        let text = decompile(&map);
        assert!(text.contains("item c weight 0.00000 pos 2"));
        assert!(text.contains("item d weight 1.00000 pos 3"));
        assert!(text.contains("item e weight 1.00000 pos 4"));
        // items before the hole keep implicit positions
        assert!(text.contains("item a weight 1.00000\n"));

        let map2 = compile(&text).unwrap();
        assert_eq!(map2.encode(), map.encode());
    }

    #[test]
    fn test_uniform_and_tree_always_pin_positions() {
        let map = compile(
            "device 0 a\ndevice 1 b\ntype 0 device\ntype 1 host\n\
             host h1 { id -1 alg uniform item a item b }\n\
             host h2 { id -2 alg tree item a pos 0 item b pos 1 }\n",
        );
        // device a cannot live in two buckets
        assert!(map.is_err());

        let map = compile(
            "device 0 a\ndevice 1 b\ndevice 2 c\ndevice 3 d\ntype 0 device\ntype 1 host\n\
             host h1 { id -1 alg uniform item a item b }\n\
             host h2 { id -2 alg tree item c item d }\n",
        )
        .unwrap();
        let text = decompile(&map);
        assert!(text.contains("item a weight 1.00000 pos 0"));
        assert!(text.contains("item b weight 1.00000 pos 1"));
        assert!(text.contains("item c weight 1.00000 pos 0"));
        assert!(text.contains("item d weight 1.00000 pos 1"));
    }

    #[test]
    fn test_sparse_device_ids_roundtrip() {
        recompiled_bytes_match(
            "device 3 osd3\ndevice 7 osd7 offload 0.50000\n\
             type 0 device\ntype 1 host\n\
             host h1 { id -1 alg straw item osd3 item osd7 }\n",
        );
    }

    #[test]
    fn test_fixed_point_precision_survives() {
        // 0.33333 is not a clean binary fraction; five printed decimals
        // must reparse to the identical fixed-point value
        recompiled_bytes_match(
            "device 0 a\ndevice 1 b\ntype 0 device\ntype 1 host\n\
             host h1 { id -1 alg straw item a weight 0.33333 item b weight 2.71828 }\n",
        );
    }

    #[test]
    fn test_unnamed_rule_roundtrip() {
        recompiled_bytes_match(
            "device 0 a\ntype 0 device\ntype 1 host\n\
             host h1 { id -1 alg straw item a }\n\
             rule { pool 2 type raid4 min_size 1 max_size 4 step take h1 step emit }\n",
        );
    }
}
