//! In-memory source model the partitioner operates on.
//!
//! An [`OpGraph`] is an append-only, topologically ordered store of tensor
//! operation nodes. Producers must be inserted before their consumers, so the
//! insertion order doubles as a topological order. Every node carries per-port
//! element-type/shape metadata and a mutable [`NodeMetadata`] channel that
//! pattern rewriters tag through.

use crate::dtype::DType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, thiserror::Error)]
pub enum OpGraphError {
    #[error("Node \"{name}\" references unknown producer node {node:?}")]
    UnknownProducer { node: OpNodeId, name: String },
    #[error("Node \"{name}\" reads output port {port} of \"{producer}\", which has only {ports} ports")]
    PortOutOfRange {
        name: String,
        producer: String,
        port: usize,
        ports: usize,
    },
}

#[derive(Debug, Clone, Copy, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
pub struct OpNodeId(pub(crate) usize);

impl OpNodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Parameter,
    Constant,
    Compute,
    Output,
}

/// Element type and shape of one output port.
#[derive(Debug, Clone, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
pub struct PortDesc {
    pub dtype: DType,
    pub shape: Vec<u64>,
}

/// One ordered input port: which node produces the value, and on which of its
/// output ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpInput {
    pub source: OpNodeId,
    pub port: usize,
}

/// Mutable annotation channel on a node. Pattern matchers write here; the
/// partitioner folds the annotations into the hosting groups.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub avoided_devices: BTreeSet<String>,
    pub isolate_tag: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpNode {
    pub name: String,
    pub kind: String,
    pub role: NodeRole,
    pub inputs: Vec<OpInput>,
    pub outputs: Vec<PortDesc>,
    pub metadata: NodeMetadata,
}

/// Structural descriptor of a node: operation kind plus the element type and
/// shape of every input and output port. Two nodes with equal descriptors are
/// interchangeable for repeated-block matching.
#[derive(Debug, Clone, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
pub struct MetaDesc {
    pub kind: String,
    pub inputs: Vec<PortDesc>,
    pub outputs: Vec<PortDesc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpGraph {
    nodes: Vec<OpNode>,
    // readers[node][output port] -> (consumer, consumer input index), in insertion order
    readers: Vec<Vec<Vec<(OpNodeId, usize)>>>,
}

impl OpGraph {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            readers: Vec::new(),
        }
    }

    pub fn add_node(&mut self, node: OpNode) -> Result<OpNodeId, OpGraphError> {
        for input in &node.inputs {
            let Some(producer) = self.nodes.get(input.source.0) else {
                return Err(OpGraphError::UnknownProducer {
                    node: input.source,
                    name: node.name.clone(),
                });
            };
            if input.port >= producer.outputs.len() {
                return Err(OpGraphError::PortOutOfRange {
                    name: node.name.clone(),
                    producer: producer.name.clone(),
                    port: input.port,
                    ports: producer.outputs.len(),
                });
            }
        }
        Ok(self.insert_node(node))
    }

    fn insert_node(&mut self, node: OpNode) -> OpNodeId {
        let id = OpNodeId(self.nodes.len());
        self.readers.push(vec![Vec::new(); node.outputs.len()]);
        for (index, input) in node.inputs.iter().enumerate() {
            self.readers[input.source.0][input.port].push((id, index));
        }
        self.nodes.push(node);
        id
    }

    pub fn add_parameter(&mut self, name: &str, desc: PortDesc) -> OpNodeId {
        self.insert_node(OpNode {
            name: name.to_string(),
            kind: "Parameter".to_string(),
            role: NodeRole::Parameter,
            inputs: Vec::new(),
            outputs: vec![desc],
            metadata: NodeMetadata::default(),
        })
    }

    pub fn add_constant(&mut self, name: &str, desc: PortDesc) -> OpNodeId {
        self.insert_node(OpNode {
            name: name.to_string(),
            kind: "Constant".to_string(),
            role: NodeRole::Constant,
            inputs: Vec::new(),
            outputs: vec![desc],
            metadata: NodeMetadata::default(),
        })
    }

    pub fn add_compute(
        &mut self,
        name: &str,
        kind: &str,
        inputs: &[(OpNodeId, usize)],
        outputs: &[PortDesc],
    ) -> Result<OpNodeId, OpGraphError> {
        self.add_node(OpNode {
            name: name.to_string(),
            kind: kind.to_string(),
            role: NodeRole::Compute,
            inputs: inputs
                .iter()
                .map(|&(source, port)| OpInput { source, port })
                .collect(),
            outputs: outputs.to_vec(),
            metadata: NodeMetadata::default(),
        })
    }

    pub fn add_output(
        &mut self,
        name: &str,
        source: OpNodeId,
        port: usize,
    ) -> Result<OpNodeId, OpGraphError> {
        self.add_node(OpNode {
            name: name.to_string(),
            kind: "Result".to_string(),
            role: NodeRole::Output,
            inputs: vec![OpInput { source, port }],
            outputs: Vec::new(),
            metadata: NodeMetadata::default(),
        })
    }

    /// Node handles in topological (insertion) order.
    pub fn ordered_nodes(&self) -> impl Iterator<Item = OpNodeId> + '_ {
        (0..self.nodes.len()).map(OpNodeId)
    }

    pub fn get_node(&self, id: OpNodeId) -> Option<&OpNode> {
        self.nodes.get(id.0)
    }

    pub fn get_node_mut(&mut self, id: OpNodeId) -> Option<&mut OpNode> {
        self.nodes.get_mut(id.0)
    }

    /// Panicking accessor for handles that came out of this graph.
    pub fn node(&self, id: OpNodeId) -> &OpNode {
        &self.nodes[id.0]
    }

    /// Everything reading the given output port, as (consumer, input index).
    pub fn port_readers(&self, id: OpNodeId, port: usize) -> &[(OpNodeId, usize)] {
        &self.readers[id.0][port]
    }

    pub fn meta_desc(&self, id: OpNodeId) -> MetaDesc {
        let node = self.node(id);
        MetaDesc {
            kind: node.kind.clone(),
            inputs: node
                .inputs
                .iter()
                .map(|input| self.node(input.source).outputs[input.port].clone())
                .collect(),
            outputs: node.outputs.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_port(shape: &[u64]) -> PortDesc {
        PortDesc {
            dtype: DType::F32,
            shape: shape.to_vec(),
        }
    }

    #[test]
    fn test_meta_desc_resolves_input_ports() {
        let mut graph = OpGraph::new();
        let param = graph.add_parameter("x", f32_port(&[2, 3]));
        let relu = graph
            .add_compute("relu", "Relu", &[(param, 0)], &[f32_port(&[2, 3])])
            .unwrap();
        let desc = graph.meta_desc(relu);
        assert_eq!(desc.kind, "Relu");
        assert_eq!(desc.inputs, vec![f32_port(&[2, 3])]);
        assert_eq!(desc.outputs, vec![f32_port(&[2, 3])]);
    }

    #[test]
    fn test_port_readers_track_consumers() {
        let mut graph = OpGraph::new();
        let param = graph.add_parameter("x", f32_port(&[4]));
        let a = graph
            .add_compute("a", "Abs", &[(param, 0)], &[f32_port(&[4])])
            .unwrap();
        let b = graph
            .add_compute("b", "Relu", &[(param, 0)], &[f32_port(&[4])])
            .unwrap();
        assert_eq!(graph.port_readers(param, 0), &[(a, 0), (b, 0)]);
    }

    #[test]
    fn test_add_compute_rejects_bad_port() {
        let mut graph = OpGraph::new();
        let param = graph.add_parameter("x", f32_port(&[4]));
        let result = graph.add_compute("a", "Abs", &[(param, 1)], &[f32_port(&[4])]);
        assert!(matches!(result, Err(OpGraphError::PortOutOfRange { .. })));
    }
}
