//! Binary decoding of a CRUSH map.
//!
//! The decoder is strict: every declared count is checked against the
//! remaining input before it is trusted, name-table keys must arrive in
//! ascending order, and trailing bytes after the last table are an error.
//! Strictness is what makes `encode(decode(b)) == b` hold for every input
//! the decoder accepts.

use bytes::{Buf, Bytes};
use std::collections::BTreeMap;

use crate::encode::{CRUSH_MAGIC, FORMAT_VERSION};
use crate::error::{CrushError, Result};
use crate::types::{BucketAlgorithm, BucketData, CrushBucket, CrushMap, CrushRule, CrushRuleMask, CrushRuleStep, RuleOp, RuleType};

// A bucket larger than this is corrupt input, not a real hierarchy
const MAX_BUCKET_SIZE: u32 = 65536;

#[inline]
fn decode_u8(buf: &mut impl Buf, context: &str) -> Result<u8> {
    if buf.remaining() < 1 {
        return Err(CrushError::Decode(format!(
            "Insufficient bytes for u8 ({}): need 1, have {}",
            context,
            buf.remaining()
        )));
    }
    Ok(buf.get_u8())
}

#[inline]
fn decode_u16(buf: &mut impl Buf, context: &str) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(CrushError::Decode(format!(
            "Insufficient bytes for u16 ({}): need 2, have {}",
            context,
            buf.remaining()
        )));
    }
    Ok(buf.get_u16_le())
}

#[inline]
fn decode_u32(buf: &mut impl Buf, context: &str) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(CrushError::Decode(format!(
            "Insufficient bytes for u32 ({}): need 4, have {}",
            context,
            buf.remaining()
        )));
    }
    Ok(buf.get_u32_le())
}

#[inline]
fn decode_i32(buf: &mut impl Buf, context: &str) -> Result<i32> {
    if buf.remaining() < 4 {
        return Err(CrushError::Decode(format!(
            "Insufficient bytes for i32 ({}): need 4, have {}",
            context,
            buf.remaining()
        )));
    }
    Ok(buf.get_i32_le())
}

/// Check that `count` items of `item_size` bytes can still be read
fn check_capacity(buf: &impl Buf, count: u32, item_size: usize, context: &str) -> Result<()> {
    let needed = (count as usize)
        .checked_mul(item_size)
        .ok_or_else(|| CrushError::Decode(format!("Count overflow ({}): {}", context, count)))?;
    if buf.remaining() < needed {
        return Err(CrushError::Decode(format!(
            "Declared size exceeds remaining bytes ({}): need {}, have {}",
            context,
            needed,
            buf.remaining()
        )));
    }
    Ok(())
}

impl CrushMap {
    /// Decode a CRUSH map from its binary form
    pub fn decode(data: &mut Bytes) -> Result<Self> {
        let magic = decode_u32(data, "magic number")?;
        if magic != CRUSH_MAGIC {
            return Err(CrushError::Decode(format!(
                "Invalid CRUSH magic: {:#x}, expected {:#x}",
                magic, CRUSH_MAGIC
            )));
        }
        let version = decode_u32(data, "format version")?;
        if version != FORMAT_VERSION {
            return Err(CrushError::Decode(format!(
                "Unsupported format version: {}, expected {}",
                version, FORMAT_VERSION
            )));
        }

        let mut map = CrushMap::new();

        let max_devices = decode_i32(data, "max_devices")?;
        if max_devices < 0 {
            return Err(CrushError::Decode(format!(
                "Negative max_devices: {}",
                max_devices
            )));
        }
        check_capacity(data, max_devices as u32, 4, "device offloads")?;
        map.max_devices = max_devices;
        map.device_offload = Vec::with_capacity(max_devices as usize);
        for i in 0..max_devices {
            map.device_offload
                .push(decode_u32(data, &format!("device {} offload", i))?);
        }

        let max_buckets = decode_i32(data, "max_buckets")?;
        if max_buckets < 0 {
            return Err(CrushError::Decode(format!(
                "Negative max_buckets: {}",
                max_buckets
            )));
        }
        check_capacity(data, max_buckets as u32, 4, "bucket slots")?;
        map.buckets = Vec::with_capacity(max_buckets as usize);
        for slot in 0..max_buckets {
            let alg = decode_u32(data, &format!("bucket {} algorithm", slot))?;
            if alg == 0 {
                map.buckets.push(None);
                continue;
            }
            let bucket = decode_bucket(data, alg)?;
            if bucket.id != -1 - slot {
                return Err(CrushError::Decode(format!(
                    "Bucket id {} does not match slot {}",
                    bucket.id, slot
                )));
            }
            map.buckets.push(Some(bucket));
        }

        let max_rules = decode_u32(data, "max_rules")?;
        check_capacity(data, max_rules, 4, "rule slots")?;
        map.rules = Vec::with_capacity(max_rules as usize);
        for slot in 0..max_rules {
            let exists = decode_u32(data, &format!("rule {} existence flag", slot))?;
            if exists == 0 {
                map.rules.push(None);
                continue;
            }
            map.rules.push(Some(decode_rule(data)?));
        }

        map.type_names = decode_i32_string_map(data, "type names")?;
        map.names = decode_i32_string_map(data, "item names")?;
        map.rule_names = decode_u32_string_map(data, "rule names")?;

        if data.remaining() != 0 {
            return Err(CrushError::Decode(format!(
                "{} trailing bytes after map",
                data.remaining()
            )));
        }

        Ok(map)
    }
}

fn decode_bucket(data: &mut Bytes, alg: u32) -> Result<CrushBucket> {
    let id = decode_i32(data, "bucket id")?;
    let bucket_type = decode_u16(data, "bucket type")?;
    let alg_byte = decode_u8(data, "bucket alg")?;
    let hash = decode_u8(data, "bucket hash")?;
    let weight = decode_u32(data, "bucket weight")?;
    let size = decode_u32(data, "bucket size")?;

    if alg_byte as u32 != alg {
        return Err(CrushError::Decode(format!(
            "Algorithm mismatch: slot header says {}, bucket says {}",
            alg, alg_byte
        )));
    }
    let algorithm = BucketAlgorithm::try_from(alg_byte)?;

    if size > MAX_BUCKET_SIZE {
        return Err(CrushError::Decode(format!("Bucket size too large: {}", size)));
    }

    check_capacity(data, size, 8, "bucket items and weights")?;
    let mut items = Vec::with_capacity(size as usize);
    for i in 0..size {
        items.push(decode_i32(data, &format!("bucket item {}", i))?);
    }
    let mut weights = Vec::with_capacity(size as usize);
    for i in 0..size {
        weights.push(decode_u32(data, &format!("bucket item weight {}", i))?);
    }

    let bucket_data = match algorithm {
        BucketAlgorithm::Uniform => {
            let item_weight = decode_u32(data, "uniform bucket item_weight")?;
            BucketData::Uniform { item_weight }
        }
        BucketAlgorithm::List => {
            check_capacity(data, size, 4, "list bucket sum_weights")?;
            let mut sum_weights = Vec::with_capacity(size as usize);
            for i in 0..size {
                sum_weights.push(decode_u32(data, &format!("list bucket sum_weight {}", i))?);
            }
            BucketData::List { sum_weights }
        }
        BucketAlgorithm::Tree => {
            let num_nodes = decode_u32(data, "tree bucket num_nodes")?;
            check_capacity(data, num_nodes, 4, "tree bucket node_weights")?;
            let mut node_weights = Vec::with_capacity(num_nodes as usize);
            for i in 0..num_nodes {
                node_weights.push(decode_u32(data, &format!("tree bucket node_weight {}", i))?);
            }
            BucketData::Tree { num_nodes, node_weights }
        }
        BucketAlgorithm::Straw => {
            check_capacity(data, size, 4, "straw bucket straws")?;
            let mut straws = Vec::with_capacity(size as usize);
            for i in 0..size {
                straws.push(decode_u32(data, &format!("straw bucket straw {}", i))?);
            }
            BucketData::Straw { straws }
        }
    };

    Ok(CrushBucket {
        id,
        bucket_type: bucket_type as i32,
        alg: algorithm,
        hash,
        weight,
        size,
        items,
        weights,
        data: bucket_data,
    })
}

fn decode_rule(data: &mut Bytes) -> Result<CrushRule> {
    let step_count = decode_u32(data, "rule step count")?;
    let pool = decode_u8(data, "rule mask pool")?;
    let rule_type = RuleType::try_from(decode_u8(data, "rule mask type")?)?;
    let min_size = decode_u8(data, "rule mask min_size")?;
    let max_size = decode_u8(data, "rule mask max_size")?;

    check_capacity(data, step_count, 12, "rule steps")?;
    let mut steps = Vec::with_capacity(step_count as usize);
    for i in 0..step_count {
        let op = decode_u32(data, &format!("rule step {} op", i))?;
        let arg1 = decode_i32(data, &format!("rule step {} arg1", i))?;
        let arg2 = decode_i32(data, &format!("rule step {} arg2", i))?;
        steps.push(CrushRuleStep {
            op: RuleOp::try_from(op)?,
            arg1,
            arg2,
        });
    }

    Ok(CrushRule {
        mask: CrushRuleMask { pool, rule_type, min_size, max_size },
        steps,
    })
}

fn decode_i32_string_map(data: &mut Bytes, context: &str) -> Result<BTreeMap<i32, String>> {
    let len = decode_u32(data, context)?;
    let mut map = BTreeMap::new();
    let mut last_key: Option<i32> = None;
    for i in 0..len {
        let key = decode_i32(data, &format!("{} key {}", context, i))?;
        if let Some(last) = last_key {
            if key <= last {
                return Err(CrushError::Decode(format!(
                    "{}: keys not strictly ascending ({} after {})",
                    context, key, last
                )));
            }
        }
        last_key = Some(key);
        map.insert(key, decode_string(data, context)?);
    }
    Ok(map)
}

fn decode_u32_string_map(data: &mut Bytes, context: &str) -> Result<BTreeMap<u32, String>> {
    let len = decode_u32(data, context)?;
    let mut map = BTreeMap::new();
    let mut last_key: Option<u32> = None;
    for i in 0..len {
        let key = decode_u32(data, &format!("{} key {}", context, i))?;
        if let Some(last) = last_key {
            if key <= last {
                return Err(CrushError::Decode(format!(
                    "{}: keys not strictly ascending ({} after {})",
                    context, key, last
                )));
            }
        }
        last_key = Some(key);
        map.insert(key, decode_string(data, context)?);
    }
    Ok(map)
}

fn decode_string(data: &mut Bytes, context: &str) -> Result<String> {
    let len = decode_u32(data, context)?;
    if data.remaining() < len as usize {
        return Err(CrushError::Decode(format!(
            "Declared size exceeds remaining bytes ({} string): need {}, have {}",
            context,
            len,
            data.remaining()
        )));
    }
    let mut bytes = vec![0u8; len as usize];
    data.copy_to_slice(&mut bytes);
    String::from_utf8(bytes)
        .map_err(|e| CrushError::Decode(format!("Invalid UTF-8 in {}: {}", context, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_map() -> CrushMap {
        let mut map = CrushMap::new();
        map.set_max_devices(4);
        map.set_type_name(0, "device");
        map.set_type_name(1, "host");
        map.set_type_name(2, "root");
        for i in 0..4 {
            map.set_item_name(i, &format!("osd{}", i));
        }
        map.add_bucket(
            -1,
            BucketAlgorithm::Straw,
            1,
            &[0, 1],
            &[0x10000, 0x10000],
        )
        .unwrap();
        map.set_item_name(-1, "host0");
        map.add_bucket(
            -2,
            BucketAlgorithm::Tree,
            1,
            &[2, 3],
            &[0x10000, 0x8000],
        )
        .unwrap();
        map.set_item_name(-2, "host1");
        map.add_bucket(
            -3,
            BucketAlgorithm::List,
            2,
            &[-1, -2],
            &[0x20000, 0x18000],
        )
        .unwrap();
        map.set_item_name(-3, "root");

        let r = map.add_rule(3, 0, RuleType::Replicated, 1, 10);
        map.set_rule_step_take(r, 0, -3).unwrap();
        map.set_rule_step_choose_leaf_firstn(r, 1, 0, 1).unwrap();
        map.set_rule_step_emit(r, 2).unwrap();
        map.set_rule_name(r, "data");

        map.finalize().unwrap();
        map.set_offload(3, 0x4000).unwrap();
        map
    }

    #[test]
    fn test_roundtrip_identity() {
        let map = sample_map();
        let encoded = map.encode();
        let mut cursor = encoded.clone();
        let decoded = CrushMap::decode(&mut cursor).unwrap();
        assert_eq!(decoded, map);
        // re-encoding the decoded map reproduces the bytes exactly
        assert_eq!(decoded.encode(), encoded);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef, 1, 0, 0, 0]);
        assert!(matches!(
            CrushMap::decode(&mut bytes),
            Err(CrushError::Decode(_))
        ));
    }

    #[test]
    fn test_bad_version() {
        let map = sample_map();
        let mut bytes = map.encode().to_vec();
        bytes[4] = 99;
        let mut cursor = Bytes::from(bytes);
        let err = CrushMap::decode(&mut cursor).unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn test_truncation_rejected() {
        let map = sample_map();
        let encoded = map.encode();
        // every proper prefix must fail cleanly
        for cut in [4usize, 8, 12, 20, encoded.len() / 2, encoded.len() - 1] {
            let mut cursor = encoded.slice(0..cut);
            assert!(
                CrushMap::decode(&mut cursor).is_err(),
                "prefix of {} bytes decoded",
                cut
            );
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let map = sample_map();
        let mut bytes = map.encode().to_vec();
        bytes.push(0);
        let mut cursor = Bytes::from(bytes);
        let err = CrushMap::decode(&mut cursor).unwrap_err();
        assert!(err.to_string().contains("trailing"));
    }

    #[test]
    fn test_oversized_count_rejected() {
        let map = sample_map();
        let mut bytes = map.encode().to_vec();
        // inflate max_devices far beyond the buffer
        bytes[8..12].copy_from_slice(&0x7fff_ffffu32.to_le_bytes());
        let mut cursor = Bytes::from(bytes);
        assert!(CrushMap::decode(&mut cursor).is_err());
    }
}
