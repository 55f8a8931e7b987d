mod common;

use common::{chain, check_invariants, ctx, f32_port, group_contents};
use std::collections::BTreeSet;
use tensor_partition::Snapshot;
use tensor_partition::op_graph::OpGraph;
use tensor_partition::partitioner::PassContext;

#[test]
fn test_single_op_yields_single_group() {
    let mut graph = OpGraph::new();
    let ids = chain(&mut graph, "g", &["Relu"], &[4]);

    let mut snapshot = Snapshot::new(graph, PassContext::default());
    snapshot.run().unwrap();

    assert_eq!(snapshot.graph_size(), 1);
    let handle = snapshot.get_group_of(ids[0]).unwrap();
    let group = snapshot.get_graph().group(handle);
    assert_eq!(group.get_content(), &BTreeSet::from([ids[0]]));
    assert_eq!(group.repeated(), None);
    assert!(snapshot.get_matches().is_empty());
    check_invariants(&snapshot);
}

#[test]
fn test_chain_collapses_into_one_group() {
    let mut graph = OpGraph::new();
    let ids = chain(&mut graph, "c", &["Relu", "Relu", "Relu", "Relu"], &[4]);

    let mut snapshot = Snapshot::new(graph, ctx(1, 10, 10));
    snapshot.build_graph();
    assert_eq!(snapshot.graph_size(), 4);
    snapshot.repeat(Snapshot::collect_lhf).unwrap();

    assert_eq!(snapshot.graph_size(), 1);
    let handle = snapshot.get_group_of(ids[0]).unwrap();
    let group = snapshot.get_graph().group(handle);
    assert_eq!(
        group.get_content(),
        &ids.iter().copied().collect::<BTreeSet<_>>()
    );
    // chains collapse left to right into the downstream group, which keeps
    // its id and initial node
    assert_eq!(group.get_id(), 3);
    assert_eq!(group.get_initial_node(), ids[3]);
    check_invariants(&snapshot);
}

#[test]
fn test_min_graph_size_gates_merging() {
    let mut graph = OpGraph::new();
    chain(&mut graph, "c", &["Relu", "Relu", "Relu", "Relu"], &[4]);

    let mut snapshot = Snapshot::new(graph, ctx(4, 10, 10));
    snapshot.build_graph();
    snapshot.repeat(Snapshot::collect_lhf).unwrap();
    assert_eq!(snapshot.graph_size(), 4);

    // the in-pass gate holds as well when the pass is invoked directly
    snapshot.collect_lhf().unwrap();
    assert_eq!(snapshot.graph_size(), 4);

    snapshot.fuse_remnants_extended().unwrap();
    assert_eq!(snapshot.graph_size(), 4);
    check_invariants(&snapshot);
}

#[test]
fn test_convert_from_constant_is_not_grouped() {
    let mut graph = OpGraph::new();
    let weight = graph.add_constant("w", f32_port(&[4]));
    let convert = graph
        .add_compute("cvt", "Convert", &[(weight, 0)], &[f32_port(&[4])])
        .unwrap();
    let param = graph.add_parameter("x", f32_port(&[4]));
    let mul = graph
        .add_compute("mul", "Multiply", &[(param, 0), (convert, 0)], &[f32_port(&[4])])
        .unwrap();
    graph.add_output("y", mul, 0).unwrap();

    let mut snapshot = Snapshot::new(graph, PassContext::default());
    snapshot.build_graph();

    assert_eq!(snapshot.graph_size(), 1);
    assert!(snapshot.get_group_of(convert).is_none());
    // the producer index still knows about the folded-away convert
    assert!(snapshot.get_node_producers(mul).unwrap().contains(&convert));
    check_invariants(&snapshot);
}

#[test]
fn test_fuse_remnants_converges_on_diamond() {
    let mut graph = OpGraph::new();
    let param = graph.add_parameter("x", f32_port(&[4]));
    let a = graph
        .add_compute("a", "Abs", &[(param, 0)], &[f32_port(&[4])])
        .unwrap();
    let b = graph
        .add_compute("b", "Relu", &[(a, 0)], &[f32_port(&[4])])
        .unwrap();
    let c = graph
        .add_compute("c", "Sigmoid", &[(a, 0)], &[f32_port(&[4])])
        .unwrap();
    let d = graph
        .add_compute("d", "Add", &[(b, 0), (c, 0)], &[f32_port(&[4])])
        .unwrap();
    graph.add_output("y", d, 0).unwrap();

    let mut snapshot = Snapshot::new(graph, ctx(1, 10, 10));
    snapshot.build_graph();

    // no straight lines here
    snapshot.repeat(Snapshot::collect_lhf).unwrap();
    assert_eq!(snapshot.graph_size(), 4);

    let before = snapshot.graph_size();
    snapshot.repeat(Snapshot::fuse_remnants).unwrap();
    assert!(snapshot.graph_size() <= before);
    assert_eq!(snapshot.graph_size(), 1);

    let handle = snapshot.get_group_of(a).unwrap();
    assert_eq!(
        snapshot.get_graph().group(handle).get_content(),
        &BTreeSet::from([a, b, c, d])
    );
    check_invariants(&snapshot);
}

#[test]
fn test_fuse_inputs_merges_sibling_producers() {
    let mut graph = OpGraph::new();
    let x = graph.add_parameter("x", f32_port(&[4]));
    let y = graph.add_parameter("y", f32_port(&[4]));
    let a = graph
        .add_compute("a", "Abs", &[(x, 0)], &[f32_port(&[4])])
        .unwrap();
    let b = graph
        .add_compute("b", "Relu", &[(y, 0)], &[f32_port(&[4])])
        .unwrap();
    let c = graph
        .add_compute("c", "Add", &[(a, 0), (b, 0)], &[f32_port(&[4])])
        .unwrap();
    graph.add_output("z", c, 0).unwrap();

    let mut snapshot = Snapshot::new(graph, ctx(1, 10, 10));
    snapshot.build_graph();
    snapshot.fuse_inputs().unwrap();

    assert_eq!(snapshot.graph_size(), 2);
    let contents = group_contents(&snapshot);
    assert!(contents.contains(&BTreeSet::from([a, b])));
    assert!(contents.contains(&BTreeSet::from([c])));
    check_invariants(&snapshot);
}

#[test]
fn test_fuse_remnants_extended_is_idempotent() {
    let mut graph = OpGraph::new();
    let param = graph.add_parameter("x", f32_port(&[4]));
    let mut tails = Vec::new();
    for i in 0..3 {
        let a = graph
            .add_compute(&format!("a{i}"), "Abs", &[(param, 0)], &[f32_port(&[4])])
            .unwrap();
        let b = graph
            .add_compute(&format!("b{i}"), "Relu", &[(a, 0)], &[f32_port(&[4])])
            .unwrap();
        tails.push(b);
    }
    let joined = graph
        .add_compute(
            "join",
            "Concat",
            &[(tails[0], 0), (tails[1], 0), (tails[2], 0)],
            &[f32_port(&[12])],
        )
        .unwrap();
    graph.add_output("y", joined, 0).unwrap();

    let mut snapshot = Snapshot::new(graph, ctx(2, 10, 10));
    snapshot.build_graph();
    snapshot.repeat(Snapshot::collect_lhf).unwrap();
    snapshot.fuse_remnants_extended().unwrap();

    let settled = group_contents(&snapshot);
    snapshot.fuse_remnants_extended().unwrap();
    assert_eq!(group_contents(&snapshot), settled);
    check_invariants(&snapshot);
}

#[test]
fn test_frozen_group_refuses_all_merges() {
    let mut graph = OpGraph::new();
    let ids = chain(&mut graph, "c", &["Abs", "Relu", "Tanh"], &[4]);

    let mut snapshot = Snapshot::new(graph, ctx(1, 10, 10));
    snapshot.build_graph();
    let middle = snapshot.get_group_of(ids[1]).unwrap();
    snapshot.get_graph_mut().group_mut(middle).freeze();

    snapshot.repeat(Snapshot::collect_lhf).unwrap();
    snapshot.fuse_remnants_extended().unwrap();

    assert_eq!(snapshot.graph_size(), 3);
    check_invariants(&snapshot);
}
