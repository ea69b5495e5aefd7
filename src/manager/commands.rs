use crate::cluster::{NodeDescriptor, NodeId, PartitionId};
use crate::consensus::{AppendCommandError, ConsensusClient};
use crate::replication::SyncStatus;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Cluster mutations modeled as single-writer command objects. Every
/// cluster-wide intent is replicated through the consensus log and applied
/// off the commit stream, so mutations are ordered operations rather than
/// ad hoc multi-lock sequences. Applies must be idempotent: the member that
/// initiated a command applies it locally and again via the stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ClusterCommand {
    RegisterNode { descriptor: NodeDescriptor },
    DeregisterNode { node: NodeId },
    AssignPartition { partition: PartitionId, nodes: Vec<NodeId> },
    MovePartition { partition: PartitionId, source: NodeId, target: NodeId },
    MarkNodeFailed { node: NodeId },
}

pub fn encode_cluster_command(command: &ClusterCommand) -> Result<Bytes, serde_json::Error> {
    serde_json::to_vec(command).map(Bytes::from)
}

pub fn decode_cluster_command(data: &Bytes) -> Result<ClusterCommand, serde_json::Error> {
    serde_json::from_slice(data)
}

/// Replicates cluster commands through the consensus engine before they are
/// applied. Success means the command committed on a majority.
pub struct CommandReplicator {
    logger: slog::Logger,
    client: ConsensusClient,
}

impl CommandReplicator {
    pub fn new(logger: slog::Logger, client: ConsensusClient) -> Self {
        CommandReplicator { logger, client }
    }

    pub async fn replicate(&self, command: &ClusterCommand) -> bool {
        let data = match encode_cluster_command(command) {
            Ok(data) => data,
            Err(e) => {
                slog::error!(self.logger, "Failed to encode cluster command: {:?}", e);
                return false;
            }
        };

        match self.client.append_command(data).await {
            Ok(key) => {
                slog::debug!(self.logger, "Command committed at {:?}", key);
                true
            }
            Err(AppendCommandError::LeaderRedirect { leader }) => {
                slog::info!(
                    self.logger,
                    "Not the coordination leader; redirect mutation to {:?}",
                    leader,
                );
                false
            }
            Err(e) => {
                slog::warn!(self.logger, "Command replication failed: {:?}", e);
                false
            }
        }
    }
}

// Membership and partition-management wire payloads.

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeJoinMsg {
    pub descriptor: NodeDescriptor,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeLeaveMsg {
    pub node: NodeId,
}

/// Lightweight change notice; receivers pull a full snapshot if the version
/// is ahead of theirs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateUpdateMsg {
    pub version: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartitionAssignMsg {
    pub partition: PartitionId,
    pub nodes: Vec<NodeId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartitionTransferMsg {
    pub partition: PartitionId,
    pub source: NodeId,
    pub target: NodeId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartitionSyncMsg {
    pub partition: PartitionId,
    pub node: NodeId,
    pub status: SyncStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trip() {
        let command = ClusterCommand::AssignPartition {
            partition: PartitionId::new("p1"),
            nodes: vec![NodeId::new("n1"), NodeId::new("n2")],
        };

        let bytes = encode_cluster_command(&command).unwrap();
        match decode_cluster_command(&bytes).unwrap() {
            ClusterCommand::AssignPartition { partition, nodes } => {
                assert_eq!(partition, PartitionId::new("p1"));
                assert_eq!(nodes.len(), 2);
            }
            other => panic!("Decoded wrong command: {:?}", other),
        }
    }
}
