mod commands;
mod distribution;
mod placement;
mod rebalance;

pub use commands::decode_cluster_command;
pub use commands::encode_cluster_command;
pub use commands::ClusterCommand;
pub use commands::CommandReplicator;
pub use commands::NodeJoinMsg;
pub use commands::NodeLeaveMsg;
pub use commands::PartitionAssignMsg;
pub use commands::PartitionSyncMsg;
pub use commands::PartitionTransferMsg;
pub use commands::StateUpdateMsg;
pub use distribution::spawn_command_applier;
pub use distribution::DistributionManager;
pub use distribution::DistributionManagerConfig;
pub use distribution::NodeFailureError;
pub use placement::select_targets;
pub use placement::PlacementCandidate;
pub use placement::PlacementError;
pub use rebalance::compute_plan;
pub use rebalance::ideal_counts;
pub use rebalance::MoveOperation;
pub use rebalance::RebalancePlan;
