#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use tensor_partition::Snapshot;
use tensor_partition::dtype::DType;
use tensor_partition::op_graph::{MetaDesc, OpGraph, OpNodeId, PortDesc};
use tensor_partition::partitioner::PassContext;

pub fn f32_port(shape: &[u64]) -> PortDesc {
    PortDesc {
        dtype: DType::F32,
        shape: shape.to_vec(),
    }
}

pub fn ctx(min_graph_size: usize, keep_blocks: usize, keep_block_size: usize) -> PassContext {
    PassContext {
        min_graph_size,
        keep_blocks,
        keep_block_size,
        ..Default::default()
    }
}

/// Parameter -> kinds[0] -> .. -> kinds[n-1] -> output. Returns the compute
/// node ids in order.
pub fn chain(graph: &mut OpGraph, prefix: &str, kinds: &[&str], shape: &[u64]) -> Vec<OpNodeId> {
    let param = graph.add_parameter(&format!("{prefix}_in"), f32_port(shape));
    let mut ids = Vec::new();
    let mut prev = param;
    for (i, &kind) in kinds.iter().enumerate() {
        let id = graph
            .add_compute(&format!("{prefix}_{i}"), kind, &[(prev, 0)], &[f32_port(shape)])
            .unwrap();
        ids.push(id);
        prev = id;
    }
    graph.add_output(&format!("{prefix}_out"), prev, 0).unwrap();
    ids
}

/// The final partition as a set of node-id sets.
pub fn group_contents(snapshot: &Snapshot) -> BTreeSet<BTreeSet<OpNodeId>> {
    let dag = snapshot.get_graph();
    dag.nodes()
        .into_iter()
        .map(|handle| dag.group(handle).get_content().clone())
        .collect()
}

/// Structural invariants that must hold after every pass.
pub fn check_invariants(snapshot: &Snapshot) {
    let model = snapshot.get_model();
    let dag = snapshot.get_graph();

    // Group contents partition exactly the operational nodes
    let operational: BTreeSet<OpNodeId> = model
        .ordered_nodes()
        .filter(|&node| snapshot.is_operational(node))
        .collect();
    let mut covered: BTreeSet<OpNodeId> = BTreeSet::new();
    for handle in dag.nodes() {
        let content = dag.group(handle).get_content();
        assert!(!content.is_empty(), "group must be non-empty");
        for &node in content {
            assert!(covered.insert(node), "node owned by two groups");
        }
    }
    assert_eq!(covered, operational, "groups must cover operational nodes");

    // Acyclic: a topological order must exist
    let order = dag.sorted();
    assert_eq!(order.len(), dag.node_count());

    // Every group edge is backed by at least one node-level edge
    for (from, to) in dag.edges() {
        let to_content = dag.group(to).get_content();
        let backed = dag.group(from).get_content().iter().any(|&node| {
            snapshot
                .get_node_consumers(node)
                .map(|consumers| consumers.iter().any(|c| to_content.contains(c)))
                .unwrap_or(false)
        });
        assert!(backed, "group edge without node-level dependency");
    }

    // The node-to-group map points at the owning group
    for &node in &operational {
        let handle = snapshot.get_group_of(node).expect("operational node mapped");
        assert!(
            dag.group(handle).get_content().contains(&node),
            "node-to-group map out of date"
        );
    }

    // Repeat classes agree on avoided devices and special tags
    let mut classes: BTreeMap<_, Vec<_>> = BTreeMap::new();
    for handle in dag.nodes() {
        if let Some(rep) = dag.group(handle).repeated() {
            classes.entry(rep).or_default().push(handle);
        }
    }
    for (_, members) in classes {
        let first = dag.group(members[0]);
        for &other in &members[1..] {
            let group = dag.group(other);
            assert_eq!(group.avoided_devices(), first.avoided_devices());
            assert_eq!(group.special_tags(), first.special_tags());
        }
    }
}

/// Full repeat-class compatibility: members also agree on the content
/// descriptor multiset. Holds in the structured scenarios; checked there.
pub fn check_repeat_class_descriptors(snapshot: &Snapshot) {
    let model = snapshot.get_model();
    let dag = snapshot.get_graph();
    let mut classes: BTreeMap<_, Vec<_>> = BTreeMap::new();
    for handle in dag.nodes() {
        if let Some(rep) = dag.group(handle).repeated() {
            classes.entry(rep).or_default().push(handle);
        }
    }
    for (_, members) in classes {
        let descs = |handle| -> Vec<MetaDesc> {
            let mut descs: Vec<MetaDesc> = dag
                .group(handle)
                .get_content()
                .iter()
                .map(|&node| model.meta_desc(node))
                .collect();
            descs.sort();
            descs
        };
        let first = descs(members[0]);
        for &other in &members[1..] {
            assert_eq!(descs(other), first, "repeat class descriptor mismatch");
        }
    }
}

/// Everything the partitioning publishes, in comparable form.
pub fn fingerprint(
    snapshot: &Snapshot,
) -> (
    BTreeSet<BTreeSet<OpNodeId>>,
    BTreeSet<BTreeSet<BTreeSet<OpNodeId>>>,
    BTreeMap<String, Vec<BTreeSet<String>>>,
) {
    let dag = snapshot.get_graph();
    let mut classes: BTreeMap<_, BTreeSet<BTreeSet<OpNodeId>>> = BTreeMap::new();
    for handle in dag.nodes() {
        if let Some(rep) = dag.group(handle).repeated() {
            classes
                .entry(rep)
                .or_default()
                .insert(dag.group(handle).get_content().clone());
        }
    }
    (
        group_contents(snapshot),
        classes.into_values().collect(),
        snapshot.get_matches().clone(),
    )
}
