//! Pattern-driven node annotation.
//!
//! Matchers tag nodes through the [`NodeMetadata`] channel; the snapshot then
//! folds the tags into the hosting groups. The built-in matchers recognize
//! connected runs of operation kinds, which is enough for the directive
//! patterns the partitioner accepts. Hosts with richer matching plug in their
//! own [`PatternMatcher`] implementations.

use crate::op_graph::{NodeRole, OpGraph, OpNodeId};

pub trait PatternMatcher {
    fn run_on_graph(&self, graph: &mut OpGraph);
}

/// An ordered set of matchers applied in one scan over the model.
#[derive(Default)]
pub struct GraphRewrite {
    matchers: Vec<Box<dyn PatternMatcher>>,
}

impl GraphRewrite {
    pub fn new() -> Self {
        Self {
            matchers: Vec::new(),
        }
    }

    pub fn add_matcher(&mut self, matcher: Box<dyn PatternMatcher>) {
        self.matchers.push(matcher);
    }

    pub fn run_on_graph(&self, graph: &mut OpGraph) {
        for matcher in &self.matchers {
            matcher.run_on_graph(graph);
        }
    }
}

#[derive(Debug, Clone)]
enum MatchAction {
    Avoid(String),
    Isolate(String),
}

impl MatchAction {
    fn apply(&self, graph: &mut OpGraph, id: OpNodeId) {
        let Some(node) = graph.get_node_mut(id) else {
            return;
        };
        match self {
            MatchAction::Avoid(device) => {
                node.metadata.avoided_devices.insert(device.clone());
            }
            MatchAction::Isolate(tag) => {
                node.metadata.isolate_tag = Some(tag.clone());
            }
        }
    }
}

/// Matches connected runs of operation kinds and tags every node on the run.
struct ChainPattern {
    kinds: &'static [&'static str],
    action: MatchAction,
}

impl PatternMatcher for ChainPattern {
    fn run_on_graph(&self, graph: &mut OpGraph) {
        for chain in find_kind_chains(graph, self.kinds) {
            for id in chain {
                self.action.apply(graph, id);
            }
        }
    }
}

/// Tags every compute node whose kind belongs to a fixed set.
struct KindSetPattern {
    kinds: &'static [&'static str],
    action: MatchAction,
}

impl PatternMatcher for KindSetPattern {
    fn run_on_graph(&self, graph: &mut OpGraph) {
        let matched: Vec<OpNodeId> = graph
            .ordered_nodes()
            .filter(|&id| {
                let node = graph.node(id);
                node.role == NodeRole::Compute && self.kinds.contains(&node.kind.as_str())
            })
            .collect();
        for id in matched {
            self.action.apply(graph, id);
        }
    }
}

fn find_kind_chains(graph: &OpGraph, kinds: &[&str]) -> Vec<Vec<OpNodeId>> {
    let mut chains = Vec::new();
    let heads: Vec<OpNodeId> = graph
        .ordered_nodes()
        .filter(|&id| {
            let node = graph.node(id);
            node.role == NodeRole::Compute && node.kind == kinds[0]
        })
        .collect();
    for head in heads {
        let mut chain = vec![head];
        let mut complete = true;
        for want in &kinds[1..] {
            let current = *chain.last().expect("chain starts non-empty");
            let mut next = None;
            'ports: for port in 0..graph.node(current).outputs.len() {
                for &(reader, _) in graph.port_readers(current, port) {
                    let node = graph.node(reader);
                    if node.role == NodeRole::Compute
                        && node.kind == *want
                        && !chain.contains(&reader)
                    {
                        next = Some(reader);
                        break 'ports;
                    }
                }
            }
            match next {
                Some(id) => chain.push(id),
                None => {
                    complete = false;
                    break;
                }
            }
        }
        if complete {
            chains.push(chain);
        }
    }
    chains
}

const RMS_NORM: &[&str] = &["Power", "ReduceMean", "Add", "Sqrt", "Divide", "Multiply"];
const SWISH_MULT_XMM: &[&str] = &["Sigmoid", "Multiply", "MatMul"];
const DEQUANT_MATMUL_CW: &[&str] = &["Convert", "Multiply", "MatMul"];
const DEQUANT_MATMUL_GQ: &[&str] = &["Convert", "Multiply", "Reshape", "MatMul"];
const ADDITIONAL_COMPUTE: &[&str] = &["Gather", "Select", "Softmax"];

pub fn rms_norm_avoid(device: &str) -> Box<dyn PatternMatcher> {
    Box::new(ChainPattern {
        kinds: RMS_NORM,
        action: MatchAction::Avoid(device.to_string()),
    })
}

pub fn rms_norm(tag: &str) -> Box<dyn PatternMatcher> {
    Box::new(ChainPattern {
        kinds: RMS_NORM,
        action: MatchAction::Isolate(tag.to_string()),
    })
}

pub fn swish_mult_xmm(tag: &str) -> Box<dyn PatternMatcher> {
    Box::new(ChainPattern {
        kinds: SWISH_MULT_XMM,
        action: MatchAction::Isolate(tag.to_string()),
    })
}

pub fn dequant_matmul_cw(tag: &str) -> Box<dyn PatternMatcher> {
    Box::new(ChainPattern {
        kinds: DEQUANT_MATMUL_CW,
        action: MatchAction::Isolate(tag.to_string()),
    })
}

pub fn dequant_matmul_gq(tag: &str) -> Box<dyn PatternMatcher> {
    Box::new(ChainPattern {
        kinds: DEQUANT_MATMUL_GQ,
        action: MatchAction::Isolate(tag.to_string()),
    })
}

pub fn additional_compute(tag: &str) -> Box<dyn PatternMatcher> {
    Box::new(KindSetPattern {
        kinds: ADDITIONAL_COMPUTE,
        action: MatchAction::Isolate(tag.to_string()),
    })
}
