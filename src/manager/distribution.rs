use crate::cluster::{Node, NodeCapacity, NodeDescriptor, NodeId, NodeStatus, PartitionId, ResourceMetrics};
use crate::consensus::CommitStream;
use crate::coordinator::ClusterCoordinator;
use crate::health::{ClusterHealth, HealthMonitor};
use crate::manager::commands::{
    decode_cluster_command, ClusterCommand, CommandReplicator, NodeJoinMsg, NodeLeaveMsg,
    PartitionAssignMsg, PartitionTransferMsg, StateUpdateMsg,
};
use crate::manager::placement::{select_targets, PlacementCandidate};
use crate::manager::rebalance::{compute_plan, RebalancePlan};
use crate::recovery::{RecoveryManager, RecoveryResponseMsg};
use crate::replication::{PartitionStore, ReplicaSet, ReplicationManager};
use crate::transport::{encode_payload, MessageKind, NetworkTransport};
use bytes::Bytes;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

#[derive(Debug, thiserror::Error)]
pub enum NodeFailureError {
    #[error("Unknown node {0:?}")]
    UnknownNode(NodeId),

    #[error("Partitions with no usable recovery source: {partitions:?}")]
    Unrecoverable { partitions: Vec<PartitionId> },
}

pub struct DistributionManagerConfig {
    pub logger: slog::Logger,
    pub coordinator: Arc<ClusterCoordinator>,
    pub replication: Arc<ReplicationManager>,
    pub recovery: Arc<RecoveryManager>,
    pub health: Arc<HealthMonitor>,
    /// Membership and partition announcements go out here when present.
    pub transport: Option<Arc<dyn NetworkTransport>>,
    /// Cluster mutations replicate through consensus when present; a
    /// standalone manager applies them directly.
    pub replicator: Option<CommandReplicator>,
    pub default_replication_factor: usize,
}

/// Top-level orchestrator and the only mutator of cluster-wide intent.
/// Registration, placement, rebalancing, and failure handling compose the
/// coordinator, replication, recovery, and health components; agreement is
/// delegated to the consensus engine via the command replicator.
pub struct DistributionManager {
    logger: slog::Logger,
    nodes: RwLock<HashMap<NodeId, Arc<Mutex<Node>>>>,
    coordinator: Arc<ClusterCoordinator>,
    replication: Arc<ReplicationManager>,
    recovery: Arc<RecoveryManager>,
    health: Arc<HealthMonitor>,
    transport: Option<Arc<dyn NetworkTransport>>,
    replicator: Option<CommandReplicator>,
    default_replication_factor: usize,
    // In-flight rebalance plan; the cursor survives a failed pass so the
    // next call resumes instead of replanning.
    rebalance_plan: Mutex<Option<RebalancePlan>>,
}

impl DistributionManager {
    pub fn new(config: DistributionManagerConfig) -> Self {
        DistributionManager {
            logger: config.logger,
            nodes: RwLock::new(HashMap::new()),
            coordinator: config.coordinator,
            replication: config.replication,
            recovery: config.recovery,
            health: config.health,
            transport: config.transport,
            replicator: config.replicator,
            default_replication_factor: config.default_replication_factor,
            rebalance_plan: Mutex::new(None),
        }
    }

    pub fn coordinator(&self) -> &Arc<ClusterCoordinator> {
        &self.coordinator
    }

    pub fn replication(&self) -> &Arc<ReplicationManager> {
        &self.replication
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// False if the node is already registered.
    pub async fn register_node(&self, id: NodeId, capacity: NodeCapacity) -> bool {
        if self.node_arc(&id).is_some() {
            slog::warn!(self.logger, "Node {:?} is already registered", id);
            return false;
        }

        let descriptor = NodeDescriptor {
            id: id.clone(),
            capacity,
            status: NodeStatus::Active,
        };
        if !self
            .replicate_command(&ClusterCommand::RegisterNode {
                descriptor: descriptor.clone(),
            })
            .await
        {
            return false;
        }

        self.apply_register(descriptor.clone());
        slog::info!(self.logger, "Registered node {:?}", descriptor.id);
        self.broadcast_message(MessageKind::NodeJoin, &NodeJoinMsg { descriptor })
            .await;
        true
    }

    /// Drains the node's partitions onto survivors, then removes it.
    pub async fn deregister_node(&self, id: NodeId) -> bool {
        let node_arc = match self.node_arc(&id) {
            Some(node_arc) => node_arc,
            None => {
                slog::warn!(self.logger, "Cannot deregister unknown node {:?}", id);
                return false;
            }
        };

        let owned = {
            let node = node_arc.lock().expect("node mutex poison");
            let mut owned: Vec<PartitionId> = node.partitions().into_iter().collect();
            owned.sort();
            owned
        };

        for partition in owned {
            if !self.move_partition_off(&partition, &id).await {
                slog::error!(
                    self.logger,
                    "Deregistration of {:?} halted: could not move {:?}",
                    id,
                    partition,
                );
                return false;
            }
        }

        if !self
            .replicate_command(&ClusterCommand::DeregisterNode { node: id.clone() })
            .await
        {
            return false;
        }
        self.apply_deregister(&id);
        slog::info!(self.logger, "Deregistered node {:?}", id);
        self.broadcast_message(MessageKind::NodeLeave, &NodeLeaveMsg { node: id })
            .await;
        true
    }

    /// Place a partition on `node_ids`, padded with additionally-selected
    /// nodes (ascending load, descending free storage, rack/datacenter
    /// diverse) until the replication factor is met.
    pub async fn assign_partition(
        &self,
        partition: PartitionId,
        node_ids: Vec<NodeId>,
        replication_factor: Option<usize>,
    ) -> bool {
        let factor = replication_factor.unwrap_or(self.default_replication_factor);
        if factor < 1 {
            slog::error!(self.logger, "Replication factor must be at least 1");
            return false;
        }

        let mut assigned: Vec<NodeId> = Vec::new();
        let mut used_racks = HashSet::new();
        let mut used_datacenters = HashSet::new();
        for id in node_ids {
            match self.node_arc(&id) {
                Some(node_arc) => {
                    let node = node_arc.lock().expect("node mutex poison");
                    used_racks.insert(node.capacity().rack_id.clone());
                    used_datacenters.insert(node.capacity().datacenter_id.clone());
                }
                None => {
                    slog::error!(
                        self.logger,
                        "Cannot assign {:?}: unknown node {:?}",
                        partition,
                        id,
                    );
                    return false;
                }
            }
            assigned.push(id);
        }

        if assigned.len() < factor {
            let exclude: HashSet<NodeId> = assigned.iter().cloned().collect();
            let candidates = self.placement_candidates(&exclude, None);
            match select_targets(candidates, &used_racks, &used_datacenters, factor - assigned.len()) {
                Ok(extra) => assigned.extend(extra),
                Err(e) => {
                    slog::error!(self.logger, "Cannot assign {:?}: {}", partition, e);
                    return false;
                }
            }
        }

        if !self
            .replicate_command(&ClusterCommand::AssignPartition {
                partition: partition.clone(),
                nodes: assigned.clone(),
            })
            .await
        {
            return false;
        }

        self.apply_assign(&partition, &assigned);
        slog::info!(self.logger, "Assigned {:?} to {:?}", partition, assigned);
        self.broadcast_message(
            MessageKind::PartitionAssign,
            &PartitionAssignMsg {
                partition,
                nodes: assigned,
            },
        )
        .await;
        true
    }

    /// Move partitions from overloaded onto underloaded nodes until every
    /// active node is within one partition of ideal. Returns false if a move
    /// failed; completed moves stay in place and the plan cursor persists
    /// for the next call.
    pub async fn rebalance_cluster(&self) -> bool {
        let mut plan = {
            let mut guard = self.rebalance_plan.lock().expect("rebalance plan mutex poison");
            match guard.take() {
                Some(plan) => {
                    slog::info!(
                        self.logger,
                        "Resuming rebalance plan at move {}/{}",
                        plan.cursor,
                        plan.moves.len(),
                    );
                    plan
                }
                None => compute_plan(&self.active_distribution()),
            }
        };

        while !plan.is_complete() {
            let move_op = plan.moves[plan.cursor].clone();

            // Idempotency: skip moves that already took effect.
            let locations = self.coordinator.get_partition_locations(&move_op.partition);
            if locations.contains(&move_op.target) || !locations.contains(&move_op.source) {
                plan.cursor += 1;
                continue;
            }

            if !self
                .execute_move(&move_op.partition, &move_op.source, &move_op.target)
                .await
            {
                slog::error!(
                    self.logger,
                    "Rebalance halted at move {}/{}",
                    plan.cursor,
                    plan.moves.len(),
                );
                *self.rebalance_plan.lock().expect("rebalance plan mutex poison") = Some(plan);
                return false;
            }
            plan.cursor += 1;
        }

        let version = self.coordinator.version();
        self.broadcast_message(MessageKind::StateUpdate, &StateUpdateMsg { version })
            .await;
        true
    }

    /// Mark the node failed and restore each of its partitions onto a new
    /// home from a healthy replica. Partitions with no usable source are
    /// surfaced in the error, never dropped silently; the failed node is
    /// removed only once everything it held has been reassigned.
    pub async fn handle_node_failure(&self, failed: &NodeId) -> Result<(), NodeFailureError> {
        let node_arc = self
            .node_arc(failed)
            .ok_or_else(|| NodeFailureError::UnknownNode(failed.clone()))?;

        {
            let mut node = node_arc.lock().expect("node mutex poison");
            node.set_status(NodeStatus::Failed);
        }
        self.health.set_node_status(failed, NodeStatus::Failed);
        self.coordinator.update_node_status(failed, NodeStatus::Failed);
        self.replicate_command(&ClusterCommand::MarkNodeFailed {
            node: failed.clone(),
        })
        .await;
        slog::warn!(self.logger, "Node {:?} marked failed; recovering its partitions", failed);

        let owned = {
            let node = node_arc.lock().expect("node mutex poison");
            let mut owned: Vec<PartitionId> = node.partitions().into_iter().collect();
            owned.sort();
            owned
        };

        let mut unrecoverable = Vec::new();
        for partition in owned {
            if !self.recover_partition(&partition, failed, &node_arc).await {
                unrecoverable.push(partition);
            }
        }

        if unrecoverable.is_empty() {
            self.apply_deregister(failed);
            Ok(())
        } else {
            Err(NodeFailureError::Unrecoverable {
                partitions: unrecoverable,
            })
        }
    }

    async fn recover_partition(
        &self,
        partition: &PartitionId,
        failed: &NodeId,
        failed_arc: &Arc<Mutex<Node>>,
    ) -> bool {
        // Healthy replicas still on active nodes are the candidate sources.
        let sources: Vec<NodeId> = self
            .replication
            .healthy_holders(partition, failed)
            .into_iter()
            .filter(|holder| {
                self.node_arc(holder)
                    .map(|arc| arc.lock().expect("node mutex poison").status().is_active())
                    .unwrap_or(false)
            })
            .collect();
        if sources.is_empty() {
            slog::error!(
                self.logger,
                "Partition {:?} has no healthy replica; unrecoverable",
                partition,
            );
            return false;
        }

        let holders: HashSet<NodeId> = self
            .coordinator
            .get_partition_locations(partition)
            .into_iter()
            .collect();
        let mut exclude = holders.clone();
        exclude.insert(failed.clone());
        let (used_racks, used_datacenters) = self.domains_of(&holders, failed);
        let candidates = self.placement_candidates(&exclude, None);
        let target = match select_targets(candidates, &used_racks, &used_datacenters, 1) {
            Ok(mut targets) => targets.remove(0),
            Err(e) => {
                slog::error!(self.logger, "No recovery target for {:?}: {}", partition, e);
                return false;
            }
        };

        // Try replica sources until one restores cleanly; only when all are
        // exhausted is the partition reported unrecoverable.
        let mut restored_from = None;
        for source in &sources {
            match self.recovery.restore_from_replica(partition, source, &target) {
                Ok(_) => {
                    restored_from = Some(source.clone());
                    break;
                }
                Err(e) => {
                    slog::warn!(
                        self.logger,
                        "Restore of {:?} from {:?} failed: {}",
                        partition,
                        source,
                        e,
                    );
                }
            }
        }
        let restored_from = match restored_from {
            Some(restored_from) => restored_from,
            None => {
                slog::error!(
                    self.logger,
                    "All replica sources for {:?} exhausted; unrecoverable",
                    partition,
                );
                return false;
            }
        };

        self.replication.replace_replica(partition, failed, &target);
        {
            let mut node = failed_arc.lock().expect("node mutex poison");
            node.remove_partition(partition);
        }
        if let Some(target_arc) = self.node_arc(&target) {
            let mut node = target_arc.lock().expect("node mutex poison");
            node.add_partition(partition.clone());
        }
        let mut locations: Vec<NodeId> = self
            .coordinator
            .get_partition_locations(partition)
            .into_iter()
            .filter(|n| n != failed)
            .collect();
        if !locations.contains(&target) {
            locations.push(target.clone());
        }
        self.coordinator
            .update_partition_location(partition.clone(), locations);

        slog::info!(
            self.logger,
            "Recovered {:?} onto {:?} from replica {:?}",
            partition,
            target,
            restored_from,
        );
        self.broadcast_message(
            MessageKind::RecoveryResponse,
            &RecoveryResponseMsg {
                partition: partition.clone(),
                restored_onto: target,
                success: true,
            },
        )
        .await;
        true
    }

    // Collaborator API read side.

    pub fn get_partition_locations(&self, partition: &PartitionId) -> Vec<NodeId> {
        self.coordinator.get_partition_locations(partition)
    }

    pub fn get_cluster_health(&self) -> ClusterHealth {
        self.health.get_cluster_health()
    }

    pub fn get_replication_status(&self) -> HashMap<PartitionId, ReplicaSet> {
        self.replication.all_replica_sets()
    }

    pub fn owned_partitions(&self, node: &NodeId) -> Vec<PartitionId> {
        match self.node_arc(node) {
            Some(node_arc) => {
                let node = node_arc.lock().expect("node mutex poison");
                let mut owned: Vec<PartitionId> = node.partitions().into_iter().collect();
                owned.sort();
                owned
            }
            None => Vec::new(),
        }
    }

    pub fn node_descriptor(&self, node: &NodeId) -> Option<NodeDescriptor> {
        self.node_arc(node)
            .map(|node_arc| node_arc.lock().expect("node mutex poison").descriptor())
    }

    /// Metric ingestion; a report also refreshes the node's heartbeat.
    pub fn update_node_metrics(&self, node: &NodeId, metrics: ResourceMetrics) {
        if let Some(node_arc) = self.node_arc(node) {
            let mut record = node_arc.lock().expect("node mutex poison");
            record.update_metrics(metrics);
            record.record_heartbeat();
        }
        self.health.update_node_metrics(node, metrics);
    }

    /// Apply a committed cluster command. Must stay idempotent: the
    /// initiating member applies commands both directly and via the commit
    /// stream.
    pub fn apply_command(&self, command: ClusterCommand) {
        match command {
            ClusterCommand::RegisterNode { descriptor } => self.apply_register(descriptor),
            ClusterCommand::DeregisterNode { node } => self.apply_deregister(&node),
            ClusterCommand::AssignPartition { partition, nodes } => {
                self.apply_assign(&partition, &nodes)
            }
            ClusterCommand::MovePartition {
                partition,
                source,
                target,
            } => self.apply_move(&partition, &source, &target),
            ClusterCommand::MarkNodeFailed { node } => {
                if let Some(node_arc) = self.node_arc(&node) {
                    node_arc
                        .lock()
                        .expect("node mutex poison")
                        .set_status(NodeStatus::Failed);
                }
                self.health.set_node_status(&node, NodeStatus::Failed);
                self.coordinator.update_node_status(&node, NodeStatus::Failed);
            }
        }
    }

    fn apply_register(&self, descriptor: NodeDescriptor) {
        {
            let mut nodes = self.nodes.write().expect("nodes rwlock poison");
            if nodes.contains_key(&descriptor.id) {
                return;
            }
            nodes.insert(
                descriptor.id.clone(),
                Arc::new(Mutex::new(Node::new(
                    descriptor.id.clone(),
                    descriptor.capacity.clone(),
                ))),
            );
        }
        self.coordinator.add_node(descriptor.clone());
        self.health.register_node(descriptor.id);
    }

    fn apply_deregister(&self, id: &NodeId) {
        {
            let mut nodes = self.nodes.write().expect("nodes rwlock poison");
            nodes.remove(id);
        }
        self.coordinator.remove_node(id);
        self.health.forget_node(id);
    }

    fn apply_assign(&self, partition: &PartitionId, assigned: &[NodeId]) {
        // Idempotency: an assignment that already took effect is a no-op.
        let mut desired: Vec<NodeId> = assigned.to_vec();
        desired.sort();
        if self.coordinator.get_partition_locations(partition) == desired {
            return;
        }

        let store = self.replication.store();
        for id in assigned {
            if let Some(node_arc) = self.node_arc(id) {
                let mut node = node_arc.lock().expect("node mutex poison");
                node.add_partition(partition.clone());
            }
            // Materialize an empty copy so byte-level transfer and backup
            // have something to operate on before the data path fills it.
            if let Ok(None) = store.partition_len(id, partition) {
                if let Err(e) = store.write_all(id, partition, Bytes::new()) {
                    slog::warn!(self.logger, "Could not materialize {:?} on {:?}: {:?}", partition, id, e);
                }
            }
        }

        if let Err(e) = self.replication.setup_replication(partition.clone(), assigned) {
            slog::error!(self.logger, "Replication setup for {:?} failed: {}", partition, e);
        }
        self.coordinator
            .update_partition_location(partition.clone(), assigned.to_vec());
    }

    fn apply_move(&self, partition: &PartitionId, source: &NodeId, target: &NodeId) {
        if let Some(node_arc) = self.node_arc(source) {
            node_arc
                .lock()
                .expect("node mutex poison")
                .remove_partition(partition);
        }
        if let Some(node_arc) = self.node_arc(target) {
            node_arc
                .lock()
                .expect("node mutex poison")
                .add_partition(partition.clone());
        }

        let mut locations: Vec<NodeId> = self
            .coordinator
            .get_partition_locations(partition)
            .into_iter()
            .filter(|n| n != source)
            .collect();
        if !locations.contains(target) {
            locations.push(target.clone());
        }
        self.coordinator
            .update_partition_location(partition.clone(), locations);
    }

    async fn move_partition_off(&self, partition: &PartitionId, source: &NodeId) -> bool {
        let holders: HashSet<NodeId> = self
            .coordinator
            .get_partition_locations(partition)
            .into_iter()
            .collect();
        let mut exclude = holders.clone();
        exclude.insert(source.clone());
        let (used_racks, used_datacenters) = self.domains_of(&holders, source);

        let candidates = self.placement_candidates(&exclude, None);
        let target = match select_targets(candidates, &used_racks, &used_datacenters, 1) {
            Ok(mut targets) => targets.remove(0),
            Err(e) => {
                slog::error!(self.logger, "No target to move {:?} off {:?}: {}", partition, source, e);
                return false;
            }
        };

        self.execute_move(partition, source, &target).await
    }

    async fn execute_move(&self, partition: &PartitionId, source: &NodeId, target: &NodeId) -> bool {
        // Admission check on the receiver before bytes move.
        match self.node_arc(target) {
            Some(target_arc) => {
                let target_node = target_arc.lock().expect("node mutex poison");
                if !target_node.can_accept_partition(None) {
                    slog::error!(
                        self.logger,
                        "Target {:?} cannot accept {:?}",
                        target,
                        partition,
                    );
                    return false;
                }
            }
            None => {
                slog::error!(self.logger, "Target {:?} is not registered", target);
                return false;
            }
        }

        if let Err(e) = self.replication.transfer_partition(partition, source, target) {
            slog::error!(
                self.logger,
                "Transfer of {:?} from {:?} to {:?} failed: {}",
                partition,
                source,
                target,
                e,
            );
            return false;
        }

        self.apply_move(partition, source, target);

        // The bytes moved regardless; a failed metadata replication is
        // logged and reconciled by the next state update.
        if !self
            .replicate_command(&ClusterCommand::MovePartition {
                partition: partition.clone(),
                source: source.clone(),
                target: target.clone(),
            })
            .await
        {
            slog::warn!(
                self.logger,
                "Move of {:?} applied locally but the command did not commit",
                partition,
            );
        }
        self.broadcast_message(
            MessageKind::PartitionTransfer,
            &PartitionTransferMsg {
                partition: partition.clone(),
                source: source.clone(),
                target: target.clone(),
            },
        )
        .await;
        true
    }

    fn node_arc(&self, id: &NodeId) -> Option<Arc<Mutex<Node>>> {
        self.nodes.read().expect("nodes rwlock poison").get(id).cloned()
    }

    fn placement_candidates(
        &self,
        exclude: &HashSet<NodeId>,
        size_hint: Option<u64>,
    ) -> Vec<PlacementCandidate> {
        let nodes = self.nodes.read().expect("nodes rwlock poison");
        nodes
            .iter()
            .filter(|(id, _)| !exclude.contains(*id))
            .filter_map(|(id, node_arc)| {
                let node = node_arc.lock().expect("node mutex poison");
                if !node.can_accept_partition(size_hint) {
                    return None;
                }
                Some(PlacementCandidate {
                    id: id.clone(),
                    load: node.load(),
                    free_storage_bytes: node.free_storage_bytes(),
                    rack_id: node.capacity().rack_id.clone(),
                    datacenter_id: node.capacity().datacenter_id.clone(),
                })
            })
            .collect()
    }

    fn domains_of(
        &self,
        holders: &HashSet<NodeId>,
        exclude: &NodeId,
    ) -> (HashSet<String>, HashSet<String>) {
        let mut racks = HashSet::new();
        let mut datacenters = HashSet::new();
        for holder in holders {
            if holder == exclude {
                continue;
            }
            if let Some(node_arc) = self.node_arc(holder) {
                let node = node_arc.lock().expect("node mutex poison");
                racks.insert(node.capacity().rack_id.clone());
                datacenters.insert(node.capacity().datacenter_id.clone());
            }
        }
        (racks, datacenters)
    }

    fn active_distribution(&self) -> HashMap<NodeId, Vec<PartitionId>> {
        let nodes = self.nodes.read().expect("nodes rwlock poison");
        nodes
            .iter()
            .filter_map(|(id, node_arc)| {
                let node = node_arc.lock().expect("node mutex poison");
                if !node.status().is_active() {
                    return None;
                }
                let mut owned: Vec<PartitionId> = node.partitions().into_iter().collect();
                owned.sort();
                Some((id.clone(), owned))
            })
            .collect()
    }

    async fn replicate_command(&self, command: &ClusterCommand) -> bool {
        match &self.replicator {
            Some(replicator) => replicator.replicate(command).await,
            None => true,
        }
    }

    async fn broadcast_message<T: Serialize>(&self, kind: MessageKind, payload: &T) {
        let transport = match &self.transport {
            Some(transport) => transport.clone(),
            None => return,
        };
        let payload = match encode_payload(payload) {
            Ok(payload) => payload,
            Err(e) => {
                slog::error!(self.logger, "Failed to encode '{}' payload: {:?}", kind, e);
                return;
            }
        };

        let local = transport.local_node_id().clone();
        let targets: Vec<NodeId> = {
            let nodes = self.nodes.read().expect("nodes rwlock poison");
            nodes.keys().filter(|id| **id != local).cloned().collect()
        };

        let results = transport.broadcast(kind, payload, &targets).await;
        for (target, delivered) in results {
            if !delivered {
                slog::debug!(self.logger, "Broadcast '{}' to {:?} not delivered", kind, target);
            }
        }
    }
}

/// Consume committed cluster commands and apply them to the local manager.
/// This is the state-machine side of the single-writer mutation path.
pub fn spawn_command_applier(
    logger: slog::Logger,
    mut commit_stream: CommitStream,
    manager: Arc<DistributionManager>,
) {
    tokio::task::spawn(async move {
        while let Some(entry) = commit_stream.next().await {
            match decode_cluster_command(&entry.data) {
                Ok(command) => manager.apply_command(command),
                Err(e) => {
                    slog::warn!(logger, "Uninterpretable committed entry {:?}: {:?}", entry.key, e);
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::test_utils::capacity_on_rack;
    use chrono::Duration;
    use std::path::PathBuf;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("lakegrid-dm-{}-{:016x}", tag, rand::random::<u64>()));
        dir
    }

    fn test_manager(tag: &str) -> Arc<DistributionManager> {
        let logger = test_logger();
        let store = Arc::new(crate::replication::InMemoryPartitionStore::new());
        let coordinator = Arc::new(ClusterCoordinator::new(logger.clone()));
        let replication = Arc::new(ReplicationManager::new(logger.clone(), store.clone()));
        let recovery = Arc::new(RecoveryManager::new(
            logger.clone(),
            temp_dir(tag),
            store,
            Duration::days(7),
        ));
        let health = Arc::new(crate::health::HealthMonitor::new(
            logger.clone(),
            crate::health::HealthMonitorConfig::default(),
        ));

        Arc::new(DistributionManager::new(DistributionManagerConfig {
            logger,
            coordinator,
            replication,
            recovery,
            health,
            transport: None,
            replicator: None,
            default_replication_factor: 3,
        }))
    }

    fn node(id: &str) -> NodeId {
        NodeId::new(id)
    }

    fn partition(id: &str) -> PartitionId {
        PartitionId::new(id)
    }

    #[tokio::test]
    async fn duplicate_registration_is_refused() {
        let dm = test_manager("dup");
        assert!(dm.register_node(node("n1"), capacity_on_rack("r1", "dc1")).await);
        assert!(!dm.register_node(node("n1"), capacity_on_rack("r1", "dc1")).await);
    }

    #[tokio::test]
    async fn assignment_spreads_across_racks() {
        let dm = test_manager("racks");
        dm.register_node(node("n1"), capacity_on_rack("r1", "dc1")).await;
        dm.register_node(node("n2"), capacity_on_rack("r1", "dc1")).await;
        dm.register_node(node("n3"), capacity_on_rack("r2", "dc1")).await;
        dm.register_node(node("n4"), capacity_on_rack("r3", "dc1")).await;

        assert!(dm.assign_partition(partition("p1"), vec![], Some(3)).await);

        let locations = dm.get_partition_locations(&partition("p1"));
        assert_eq!(locations.len(), 3);
        let racks: HashSet<String> = locations
            .iter()
            .map(|id| dm.node_descriptor(id).unwrap().capacity.rack_id)
            .collect();
        assert_eq!(racks.len(), 3);
    }

    #[tokio::test]
    async fn assignment_pads_given_nodes_to_replication_factor() {
        let dm = test_manager("pad");
        dm.register_node(node("n1"), capacity_on_rack("r1", "dc1")).await;
        dm.register_node(node("n2"), capacity_on_rack("r2", "dc1")).await;
        dm.register_node(node("n3"), capacity_on_rack("r3", "dc1")).await;

        assert!(
            dm.assign_partition(partition("p1"), vec![node("n1")], Some(3))
                .await
        );

        let locations = dm.get_partition_locations(&partition("p1"));
        assert_eq!(
            locations,
            vec![node("n1"), node("n2"), node("n3")]
        );
        // The first listed node became primary.
        let replica_set = dm.get_replication_status().remove(&partition("p1")).unwrap();
        assert_eq!(replica_set.primary, node("n1"));
    }

    #[tokio::test]
    async fn assignment_fails_without_enough_nodes() {
        let dm = test_manager("few");
        dm.register_node(node("n1"), capacity_on_rack("r1", "dc1")).await;

        assert!(!dm.assign_partition(partition("p1"), vec![], Some(3)).await);
        assert!(dm.get_partition_locations(&partition("p1")).is_empty());
    }

    #[tokio::test]
    async fn rebalance_converges_to_even_distribution() {
        let dm = test_manager("rebalance");
        dm.register_node(node("n1"), capacity_on_rack("r1", "dc1")).await;
        dm.register_node(node("n2"), capacity_on_rack("r1", "dc1")).await;
        dm.register_node(node("n3"), capacity_on_rack("r1", "dc1")).await;

        for i in 0..10 {
            assert!(
                dm.assign_partition(partition(&format!("p{:02}", i)), vec![node("n1")], Some(1))
                    .await
            );
        }
        assert_eq!(dm.owned_partitions(&node("n1")).len(), 10);

        assert!(dm.rebalance_cluster().await);

        let mut counts: Vec<usize> = ["n1", "n2", "n3"]
            .iter()
            .map(|id| dm.owned_partitions(&node(id)).len())
            .collect();
        counts.sort();
        assert_eq!(counts, vec![3, 3, 4]);
    }

    #[tokio::test]
    async fn deregistration_drains_partitions_to_survivors() {
        let dm = test_manager("drain");
        dm.register_node(node("n1"), capacity_on_rack("r1", "dc1")).await;
        dm.register_node(node("n2"), capacity_on_rack("r2", "dc1")).await;

        dm.assign_partition(partition("p1"), vec![node("n1")], Some(1)).await;
        assert!(dm.deregister_node(node("n1")).await);

        assert!(dm.node_descriptor(&node("n1")).is_none());
        assert_eq!(dm.get_partition_locations(&partition("p1")), vec![node("n2")]);
        assert_eq!(dm.owned_partitions(&node("n2")).len(), 1);
    }

    #[tokio::test]
    async fn node_failure_restores_from_healthy_replica() {
        let dm = test_manager("failure");
        dm.register_node(node("n1"), capacity_on_rack("r1", "dc1")).await;
        dm.register_node(node("n2"), capacity_on_rack("r2", "dc1")).await;
        dm.register_node(node("n3"), capacity_on_rack("r3", "dc1")).await;

        dm.assign_partition(partition("p1"), vec![node("n1")], Some(3)).await;
        // Replicas have caught up.
        dm.replication().mark_synced(&partition("p1"), &node("n2"));
        dm.replication().mark_synced(&partition("p1"), &node("n3"));

        // A fourth node joins, then the primary dies.
        dm.register_node(node("n4"), capacity_on_rack("r4", "dc1")).await;
        dm.handle_node_failure(&node("n1")).await.unwrap();

        let locations = dm.get_partition_locations(&partition("p1"));
        assert_eq!(locations, vec![node("n2"), node("n3"), node("n4")]);
        // The failed node is gone entirely.
        assert!(dm.node_descriptor(&node("n1")).is_none());
    }

    #[tokio::test]
    async fn failure_with_no_healthy_replica_is_surfaced() {
        let dm = test_manager("unrecoverable");
        dm.register_node(node("n1"), capacity_on_rack("r1", "dc1")).await;
        dm.register_node(node("n2"), capacity_on_rack("r2", "dc1")).await;

        // Factor 1: no replicas exist at all.
        dm.assign_partition(partition("p1"), vec![node("n1")], Some(1)).await;

        let err = dm.handle_node_failure(&node("n1")).await.unwrap_err();
        match err {
            NodeFailureError::Unrecoverable { partitions } => {
                assert_eq!(partitions, vec![partition("p1")])
            }
            other => panic!("Expected unrecoverable, got {:?}", other),
        }
        // The node record survives for operator inspection.
        assert_eq!(
            dm.node_descriptor(&node("n1")).unwrap().status,
            NodeStatus::Failed
        );
    }

    #[tokio::test]
    async fn failure_of_unknown_node_is_an_error() {
        let dm = test_manager("unknown");
        assert!(matches!(
            dm.handle_node_failure(&node("ghost")).await,
            Err(NodeFailureError::UnknownNode(_))
        ));
    }
}
