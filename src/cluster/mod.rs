mod node;

#[cfg(test)]
pub(crate) use node::test_utils;

pub use node::Node;
pub use node::NodeCapacity;
pub use node::NodeDescriptor;
pub use node::NodeId;
pub use node::NodeStatus;
pub use node::PartitionId;
pub use node::ResourceMetrics;
