//! Online partitioning of a frozen operation graph into connected groups,
//! with discovery of structurally repeated blocks.

pub mod group;
pub mod patterns;
pub mod repeated;
pub mod snapshot;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
pub enum AvoidKind {
    Op,
    Pattern,
}

/// Forbid an operation or a named pattern from being placed on a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Avoid {
    pub kind: AvoidKind,
    pub pattern: String,
    pub device: String,
}

/// Carve the groups matching a named pattern out under a user tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Isolate {
    pub pattern: String,
    pub tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassContext {
    /// Lower bound on group count; merge passes stop once reached.
    pub min_graph_size: usize,
    /// Minimum number of instances for a repeat class to be kept.
    pub keep_blocks: usize,
    /// Minimum per-group layer count for a repeat class to be kept.
    pub keep_block_size: usize,
    pub avoids: Vec<Avoid>,
    pub isolates: Vec<Isolate>,
    pub nofolds: Vec<String>,
    /// Tensor axes along which downstream parallel-matmul fusion is allowed.
    /// Stored opaquely for the later rewrite stages.
    pub pmm_dims: BTreeSet<i64>,
}

impl Default for PassContext {
    fn default() -> Self {
        Self {
            min_graph_size: 10,
            keep_blocks: 10,
            keep_block_size: 10,
            avoids: Vec::new(),
            isolates: Vec::new(),
            nofolds: Vec::new(),
            pmm_dims: BTreeSet::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PartitionError {
    #[error(
        "Tried to merge repeated groups with different sizes of producers and consumers: {prods} vs {conss}"
    )]
    MergeVectorMismatch { prods: usize, conss: usize },
    #[error("Tried to merge repeated groups which overlap")]
    OverlappingMerge,
    #[error("Merged repeated groups incorrectly: producers and consumers overlap")]
    PostMergeOverlap,
    #[error(
        "Tried to merge repeated triangles with different sizes of producers and consumers: {prods} vs {conss}"
    )]
    TriangleVectorMismatch { prods: usize, conss: usize },
    #[error(
        "Incorrect number of second order interconnects during triangle merge: got {got}, expected {expected}"
    )]
    SecondOrderInterconnectMismatch { got: usize, expected: usize },
    #[error("Couldn't match repeated blocks properly (node archetype): got {got}, expected {expected}")]
    ArchetypeInstanceMismatch { got: usize, expected: usize },
    #[error("Couldn't match repeated blocks properly (count of archetypes): got {got}, expected {expected}")]
    ArchetypeCountMismatch { got: usize, expected: usize },
}
