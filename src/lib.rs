mod background;
mod cluster;
mod consensus;
mod coordinator;
mod health;
mod manager;
mod options;
mod recovery;
mod replication;
mod runtime;
mod transport;
mod grpc {
    include!("../generated/cluster.rs");
}

pub use cluster::NodeCapacity;
pub use cluster::NodeDescriptor;
pub use cluster::NodeId;
pub use cluster::NodeStatus;
pub use cluster::PartitionId;
pub use cluster::ResourceMetrics;
pub use consensus::AppendCommandError;
pub use consensus::ConsensusClient;
pub use consensus::ConsensusStatus;
pub use consensus::EntryKey;
pub use consensus::LogIndex;
pub use consensus::RoleSnapshot;
pub use consensus::Term;
pub use coordinator::ClusterCoordinator;
pub use coordinator::ClusterStateSnapshot;
pub use health::Alert;
pub use health::AlertSeverity;
pub use health::ClusterHealth;
pub use health::HealthLevel;
pub use health::NodeHealth;
pub use manager::DistributionManager;
pub use manager::NodeFailureError;
pub use options::Options;
pub use recovery::BackupError;
pub use recovery::BackupManifest;
pub use recovery::BackupState;
pub use replication::InMemoryPartitionStore;
pub use replication::PartitionStore;
pub use replication::ReplicaSet;
pub use replication::SyncStatus;
pub use runtime::start_grpc_member;
pub use runtime::start_in_memory_member;
pub use runtime::Member;
pub use runtime::MemberConfig;
pub use runtime::MemberInfo;
pub use runtime::StartMemberError;
pub use transport::Envelope;
pub use transport::InMemoryHub;
pub use transport::MessageKind;
pub use transport::NetworkTransport;
