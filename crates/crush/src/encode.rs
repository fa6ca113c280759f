//! Binary encoding of a CRUSH map.
//!
//! The wire form is a fixed-order concatenation: header, device offloads,
//! bucket slots (algorithm tag doubles as the presence flag), rule slots,
//! then the three name tables. All integers are little-endian; name tables
//! are emitted in ascending key order so the output is a pure function of
//! the map.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

use crate::types::{BucketData, CrushBucket, CrushMap, CrushRule};

/// Magic number leading every encoded map
pub const CRUSH_MAGIC: u32 = 0x00010000;

/// Pinned format version; decoders reject anything else
pub const FORMAT_VERSION: u32 = 1;

impl CrushMap {
    /// Encode the map to its binary form
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        buf.put_u32_le(CRUSH_MAGIC);
        buf.put_u32_le(FORMAT_VERSION);

        buf.put_i32_le(self.max_devices);
        for &offload in &self.device_offload {
            buf.put_u32_le(offload);
        }

        buf.put_i32_le(self.buckets.len() as i32);
        for slot in &self.buckets {
            match slot {
                None => buf.put_u32_le(0),
                Some(bucket) => encode_bucket(&mut buf, bucket),
            }
        }

        buf.put_u32_le(self.rules.len() as u32);
        for slot in &self.rules {
            match slot {
                None => buf.put_u32_le(0),
                Some(rule) => {
                    buf.put_u32_le(1);
                    encode_rule(&mut buf, rule);
                }
            }
        }

        encode_i32_string_map(&mut buf, &self.type_names);
        encode_i32_string_map(&mut buf, &self.names);
        encode_u32_string_map(&mut buf, &self.rule_names);

        buf.freeze()
    }
}

fn encode_bucket(buf: &mut BytesMut, bucket: &CrushBucket) {
    buf.put_u32_le(bucket.alg as u32);

    buf.put_i32_le(bucket.id);
    buf.put_u16_le(bucket.bucket_type as u16);
    buf.put_u8(bucket.alg as u8);
    buf.put_u8(bucket.hash);
    buf.put_u32_le(bucket.weight);
    buf.put_u32_le(bucket.size);

    for &item in &bucket.items {
        buf.put_i32_le(item);
    }
    for &weight in &bucket.weights {
        buf.put_u32_le(weight);
    }

    match &bucket.data {
        BucketData::Uniform { item_weight } => {
            buf.put_u32_le(*item_weight);
        }
        BucketData::List { sum_weights } => {
            for &w in sum_weights {
                buf.put_u32_le(w);
            }
        }
        BucketData::Tree { num_nodes, node_weights } => {
            buf.put_u32_le(*num_nodes);
            for &w in node_weights {
                buf.put_u32_le(w);
            }
        }
        BucketData::Straw { straws } => {
            for &s in straws {
                buf.put_u32_le(s);
            }
        }
    }
}

fn encode_rule(buf: &mut BytesMut, rule: &CrushRule) {
    buf.put_u32_le(rule.steps.len() as u32);
    buf.put_u8(rule.mask.pool);
    buf.put_u8(rule.mask.rule_type as u8);
    buf.put_u8(rule.mask.min_size);
    buf.put_u8(rule.mask.max_size);
    for step in &rule.steps {
        buf.put_u32_le(step.op as u32);
        buf.put_i32_le(step.arg1);
        buf.put_i32_le(step.arg2);
    }
}

fn encode_i32_string_map(buf: &mut BytesMut, map: &BTreeMap<i32, String>) {
    buf.put_u32_le(map.len() as u32);
    for (&key, value) in map {
        buf.put_i32_le(key);
        buf.put_u32_le(value.len() as u32);
        buf.put_slice(value.as_bytes());
    }
}

fn encode_u32_string_map(buf: &mut BytesMut, map: &BTreeMap<u32, String>) {
    buf.put_u32_le(map.len() as u32);
    for (&key, value) in map {
        buf.put_u32_le(key);
        buf.put_u32_le(value.len() as u32);
        buf.put_slice(value.as_bytes());
    }
}
