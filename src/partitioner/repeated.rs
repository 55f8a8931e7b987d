//! Shared repeat tokens. Groups that are structural repeats of each other
//! point at the same token; only identity matters until cleanup, when the
//! token is filled with the archetype table of its block.

use crate::op_graph::MetaDesc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
pub struct RepeatId(pub(crate) usize);

impl RepeatId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// One entry in a node's archetype path: a repeat token the hosting group was
/// stamped with, or a record of the merge that absorbed the node. The merge
/// marks keep two same-descriptor layers of one group apart, since the side
/// and kind of fuse they arrived through differ.
#[derive(Debug, Clone, Copy, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
pub enum ReptrackMark {
    Token(RepeatId),
    /// Absorbed as a producer into its consumer.
    FusedProducer,
    /// Absorbed as a consumer into its producer.
    FusedConsumer,
    /// Absorbed into a sibling input group.
    FusedSibling,
}

/// One layer position within a repeated block: the structural descriptor of
/// the node plus the path of merge marks and repeat tokens it accumulated
/// while the block grew. Equal archetypes identify corresponding layers
/// across instances.
#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub struct Archetype {
    pub desc: MetaDesc,
    pub reptrack: Vec<ReptrackMark>,
}

#[derive(Debug)]
pub struct Repeated {
    open_for_merge: bool,
    archetypes: Vec<Archetype>,
}

impl Repeated {
    fn new() -> Self {
        Self {
            open_for_merge: true,
            archetypes: Vec::new(),
        }
    }

    pub fn open_for_merge(&self) -> bool {
        self.open_for_merge
    }

    /// Withdraw the token's block from further growth attempts.
    pub fn exclude(&mut self) {
        self.open_for_merge = false;
    }

    pub fn archetypes(&self) -> &[Archetype] {
        &self.archetypes
    }

    pub(crate) fn set_archetypes(&mut self, archetypes: Vec<Archetype>) {
        self.archetypes = archetypes;
    }
}

/// Arena of repeat tokens. Handles are indices, so token identity and the
/// rendered block ids are stable across runs.
#[derive(Debug, Default)]
pub struct RepeatPool {
    pool: Vec<Repeated>,
}

impl RepeatPool {
    pub fn new() -> Self {
        Self { pool: Vec::new() }
    }

    pub fn alloc(&mut self) -> RepeatId {
        self.pool.push(Repeated::new());
        RepeatId(self.pool.len() - 1)
    }

    pub fn get(&self, id: RepeatId) -> &Repeated {
        &self.pool[id.0]
    }

    pub fn get_mut(&mut self, id: RepeatId) -> &mut Repeated {
        &mut self.pool[id.0]
    }

    /// Human-readable block id for a token, used as the key of the layer-match
    /// table handed downstream.
    pub fn repeated_id(&self, id: RepeatId) -> String {
        format!("rep_{}", id.0)
    }
}
