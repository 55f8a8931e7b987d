//! Groups and the group-level DAG.
//!
//! A [`Group`] owns a set of operation nodes that will become one subgraph.
//! The [`GroupDag`] mirrors data dependencies between groups and carries the
//! merge primitives; every merge keeps the DAG acyclic, keeps edges free of
//! duplicates and self-loops, and keeps the node-to-group map current.

use crate::op_graph::{MetaDesc, OpNodeId};
use crate::partitioner::repeated::{RepeatId, ReptrackMark};
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::stable_graph::StableDiGraph;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

pub type GroupHandle = petgraph::stable_graph::NodeIndex;

/// One element of a meta-interconnect: a single operation-level edge crossing
/// a group boundary, described by the structural descriptors of its endpoints
/// and the port pair it runs over. Sorted sequences of these are the canonical
/// key for deciding whether two group boundaries look the same.
#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub struct MetaInterconnect {
    pub src_desc: MetaDesc,
    pub src_port: usize,
    pub dst_port: usize,
    pub dst_desc: MetaDesc,
}

#[derive(Debug, Clone)]
pub struct Group {
    id: usize,
    initial: OpNodeId,
    content: BTreeSet<OpNodeId>,
    frozen: bool,
    no_fold: bool,
    avoided_devices: BTreeSet<String>,
    isolated_tag: Option<String>,
    special_tags: Vec<String>,
    repeated: Option<RepeatId>,
    reptrack: BTreeMap<OpNodeId, Vec<ReptrackMark>>,
}

impl Group {
    pub(crate) fn new(id: usize, initial: OpNodeId) -> Self {
        Self {
            id,
            initial,
            content: BTreeSet::from([initial]),
            frozen: false,
            no_fold: false,
            avoided_devices: BTreeSet::new(),
            isolated_tag: None,
            special_tags: Vec::new(),
            repeated: None,
            reptrack: BTreeMap::from([(initial, Vec::new())]),
        }
    }

    pub fn get_id(&self) -> usize {
        self.id
    }

    /// The node this group was created around. Survives merges.
    pub fn get_initial_node(&self) -> OpNodeId {
        self.initial
    }

    pub fn get_content(&self) -> &BTreeSet<OpNodeId> {
        &self.content
    }

    pub fn size(&self) -> usize {
        self.content.len()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// A frozen group refuses all further merges.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_no_fold(&self) -> bool {
        self.no_fold
    }

    pub fn set_no_fold(&mut self) {
        self.no_fold = true;
    }

    pub fn avoided_devices(&self) -> &BTreeSet<String> {
        &self.avoided_devices
    }

    pub fn avoid(&mut self, device: &str) {
        self.avoided_devices.insert(device.to_string());
    }

    pub fn isolated_tag(&self) -> Option<&str> {
        self.isolated_tag.as_deref()
    }

    /// Tag the group as isolated. The tag also joins the special tags, so
    /// isolated groups only pair up with equally isolated ones during
    /// repeated-block discovery.
    pub fn isolate(&mut self, tag: &str) {
        self.isolated_tag = Some(tag.to_string());
        if !self.special_tags.iter().any(|t| t == tag) {
            self.special_tags.push(tag.to_string());
        }
    }

    pub fn special_tags(&self) -> &[String] {
        &self.special_tags
    }

    pub fn repeated(&self) -> Option<RepeatId> {
        self.repeated
    }

    /// Point the group at a repeat token. Setting a token appends it to the
    /// reptrack of every node in the content; clearing leaves the tracks
    /// untouched.
    pub fn set_repeated(&mut self, rep: Option<RepeatId>) {
        self.repeated = rep;
        if let Some(rep) = rep {
            for node in &self.content {
                self.reptrack
                    .entry(*node)
                    .or_default()
                    .push(ReptrackMark::Token(rep));
            }
        }
    }

    pub fn get_reptrack(&self, node: OpNodeId) -> &[ReptrackMark] {
        self.reptrack.get(&node).map(Vec::as_slice).unwrap_or(&[])
    }

    fn absorb(&mut self, other: Group, mark: ReptrackMark) {
        self.content.extend(other.content.iter().copied());
        self.avoided_devices.extend(other.avoided_devices);
        for tag in other.special_tags {
            if !self.special_tags.contains(&tag) {
                self.special_tags.push(tag);
            }
        }
        self.no_fold |= other.no_fold;
        // every absorbed node records which side of the fuse it came from,
        // so archetype matching can tell equal-descriptor layers apart later
        for (node, mut track) in other.reptrack {
            track.push(mark);
            self.reptrack.insert(node, track);
        }
    }
}

#[derive(Debug, Default)]
pub struct GroupDag {
    graph: StableDiGraph<Group, ()>,
    node_to_group: HashMap<OpNodeId, GroupHandle>,
}

impl GroupDag {
    pub(crate) fn new() -> Self {
        Self {
            graph: StableDiGraph::new(),
            node_to_group: HashMap::new(),
        }
    }

    pub(crate) fn add_group(&mut self, group: Group) -> GroupHandle {
        let initial = group.get_initial_node();
        let handle = self.graph.add_node(group);
        self.node_to_group.insert(initial, handle);
        handle
    }

    pub fn contains(&self, handle: GroupHandle) -> bool {
        self.graph.contains_node(handle)
    }

    pub fn group(&self, handle: GroupHandle) -> &Group {
        self.graph
            .node_weight(handle)
            .expect("group handle must be live")
    }

    pub fn group_mut(&mut self, handle: GroupHandle) -> &mut Group {
        self.graph
            .node_weight_mut(handle)
            .expect("group handle must be live")
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Live group handles in creation order.
    pub fn nodes(&self) -> Vec<GroupHandle> {
        self.graph.node_indices().collect()
    }

    /// A topological order over the live groups. Recompute after merges; a
    /// merge invalidates previously taken orders.
    pub fn sorted(&self) -> Vec<GroupHandle> {
        toposort(&self.graph, None).expect("group graph must stay acyclic")
    }

    pub fn producers(&self, handle: GroupHandle) -> Vec<GroupHandle> {
        self.graph
            .neighbors_directed(handle, Direction::Incoming)
            .collect()
    }

    pub fn consumers(&self, handle: GroupHandle) -> Vec<GroupHandle> {
        self.graph
            .neighbors_directed(handle, Direction::Outgoing)
            .collect()
    }

    pub fn edges(&self) -> Vec<(GroupHandle, GroupHandle)> {
        self.graph
            .edge_indices()
            .filter_map(|e| self.graph.edge_endpoints(e))
            .collect()
    }

    pub fn get_group_of(&self, node: OpNodeId) -> Option<GroupHandle> {
        self.node_to_group.get(&node).copied()
    }

    pub(crate) fn link(&mut self, from: GroupHandle, to: GroupHandle) {
        if self.graph.find_edge(from, to).is_none() {
            self.graph.add_edge(from, to, ());
        }
    }

    /// Would merging `from` and `to` close a cycle? True iff some path
    /// `from -> .. -> to` exists besides the direct edge.
    pub fn has_cycle(&self, from: GroupHandle, to: GroupHandle) -> bool {
        let mut stack: Vec<GroupHandle> = self
            .graph
            .neighbors_directed(from, Direction::Outgoing)
            .filter(|&n| n != to)
            .collect();
        let mut seen: HashSet<GroupHandle> = stack.iter().copied().collect();
        seen.insert(from);
        while let Some(next) = stack.pop() {
            if next == to {
                return true;
            }
            for succ in self.graph.neighbors_directed(next, Direction::Outgoing) {
                if seen.insert(succ) {
                    stack.push(succ);
                }
            }
        }
        false
    }

    /// Absorb a producer of `group` into it. `group` survives and keeps its id.
    pub(crate) fn fuse(&mut self, group: GroupHandle, producer: GroupHandle) {
        self.merge_into(group, producer, ReptrackMark::FusedProducer);
    }

    /// Absorb a consumer of `group` into it. `group` survives and keeps its id.
    pub(crate) fn fuse_with(&mut self, group: GroupHandle, consumer: GroupHandle) {
        self.merge_into(group, consumer, ReptrackMark::FusedConsumer);
    }

    /// Merge two producers of a common consumer into one sibling group. The
    /// first one survives.
    pub(crate) fn fuse_inputs(&mut self, first: GroupHandle, second: GroupHandle) {
        self.merge_into(first, second, ReptrackMark::FusedSibling);
    }

    fn merge_into(&mut self, survivor: GroupHandle, consumed: GroupHandle, mark: ReptrackMark) {
        debug_assert_ne!(survivor, consumed);
        let producers: Vec<GroupHandle> = self
            .graph
            .neighbors_directed(consumed, Direction::Incoming)
            .collect();
        let consumers: Vec<GroupHandle> = self
            .graph
            .neighbors_directed(consumed, Direction::Outgoing)
            .collect();
        let consumed_group = self
            .graph
            .remove_node(consumed)
            .expect("consumed group handle must be live");
        for producer in producers {
            if producer != survivor {
                self.link(producer, survivor);
            }
        }
        for consumer in consumers {
            if consumer != survivor {
                self.link(survivor, consumer);
            }
        }
        for node in consumed_group.get_content() {
            self.node_to_group.insert(*node, survivor);
        }
        self.graph
            .node_weight_mut(survivor)
            .expect("surviving group handle must be live")
            .absorb(consumed_group, mark);
    }
}
