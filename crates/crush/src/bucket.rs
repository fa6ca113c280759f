//! Per-bucket item selection.
//!
//! Each algorithm draws from the derived state computed at finalize time:
//! UNIFORM needs nothing beyond the item count, LIST its cumulative
//! weights, TREE its node array, STRAW its straw lengths.

use crate::hash::{crush_hash32_3, crush_hash32_4};
use crate::types::{BucketAlgorithm, BucketData, CrushBucket};

/// Select an item from a bucket for input `x`, replica/try index `r`
pub fn bucket_choose(bucket: &CrushBucket, x: u32, r: u32) -> Option<i32> {
    if bucket.size == 0 {
        return None;
    }

    match bucket.alg {
        BucketAlgorithm::Uniform => bucket_uniform_choose(bucket, x, r),
        BucketAlgorithm::List => bucket_list_choose(bucket, x, r),
        BucketAlgorithm::Tree => bucket_tree_choose(bucket, x, r),
        BucketAlgorithm::Straw => bucket_straw_choose(bucket, x, r),
    }
}

/// Uniform selection: hash modulo size
fn bucket_uniform_choose(bucket: &CrushBucket, x: u32, r: u32) -> Option<i32> {
    let hash = crush_hash32_3(x, bucket.id as u32, r);
    let index = (hash % bucket.size) as usize;
    Some(bucket.items[index])
}

/// List selection: walk newest to oldest, accept an item when its weight
/// covers the scaled draw against the cumulative weight from that position
fn bucket_list_choose(bucket: &CrushBucket, x: u32, r: u32) -> Option<i32> {
    let BucketData::List { sum_weights } = &bucket.data else {
        return None;
    };

    for i in (0..bucket.size as usize).rev() {
        let mut w = crush_hash32_4(x, bucket.items[i] as u32, r, bucket.id as u32) as u64;
        w &= 0xffff;
        w = w.wrapping_mul(sum_weights[i] as u64);
        w >>= 16;

        if w < bucket.weights[i] as u64 {
            return Some(bucket.items[i]);
        }
    }

    Some(bucket.items[0])
}

/// Tree selection: descend the in-order node array, at each internal node
/// sending the draw left or right in proportion to the subtree weights
fn bucket_tree_choose(bucket: &CrushBucket, x: u32, r: u32) -> Option<i32> {
    let BucketData::Tree { num_nodes, node_weights } = &bucket.data else {
        return None;
    };
    if *num_nodes < 2 {
        return None;
    }

    // root sits at the middle of the in-order numbering; odd = leaf
    let mut node = (*num_nodes >> 1) as usize;
    while node & 1 == 0 {
        let w = node_weights[node];
        if w == 0 {
            return None;
        }
        let t = (crush_hash32_4(x, node as u32, r, bucket.id as u32) as u64 * w as u64) >> 32;

        let half = 1usize << (node.trailing_zeros() - 1);
        let left = node - half;
        if t < node_weights[left] as u64 {
            node = left;
        } else {
            node = node + half;
        }
    }

    bucket.items.get(node >> 1).copied()
}

/// Straw selection: every item draws `hash * straw_length`; longest wins
fn bucket_straw_choose(bucket: &CrushBucket, x: u32, r: u32) -> Option<i32> {
    let BucketData::Straw { straws } = &bucket.data else {
        return None;
    };

    let mut high = 0usize;
    let mut high_draw = 0u64;

    for (i, &straw) in straws.iter().enumerate().take(bucket.size as usize) {
        let mut draw = crush_hash32_3(x, bucket.items[i] as u32, r) as u64;
        draw &= 0xffff;
        draw = draw.wrapping_mul(straw as u64);

        if i == 0 || draw > high_draw {
            high = i;
            high_draw = draw;
        }
    }

    Some(bucket.items[high])
}
