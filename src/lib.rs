pub mod dtype;
pub mod op_graph;
pub mod partitioner;

pub use dtype::DType;
pub use op_graph::{OpGraph, OpGraphError, OpNode, OpNodeId};
pub use partitioner::snapshot::Snapshot;
pub use partitioner::{PartitionError, PassContext};
