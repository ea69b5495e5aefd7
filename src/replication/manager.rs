use crate::cluster::{NodeId, PartitionId};
use crate::health::HealthLevel;
use crate::replication::store::{copy_partition, PartitionStore};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Synced,
    Syncing,
    Failed,
}

/// Public snapshot of one partition's replication record.
#[derive(Clone, Debug, Serialize)]
pub struct ReplicaSet {
    pub primary: NodeId,
    pub replicas: Vec<NodeId>,
    pub sync_status: HashMap<NodeId, SyncStatus>,
    pub version: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct ReplicationHealthReport {
    pub status: HealthLevel,
    pub healthy_replicas: Vec<NodeId>,
    pub outdated_replicas: Vec<NodeId>,
}

/// Primary-to-replica sync push.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicatePush {
    pub partition: PartitionId,
    pub version: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicateAckMsg {
    pub partition: PartitionId,
    pub node: NodeId,
    pub version: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum SetupReplicationError {
    #[error("Replication requires at least one node")]
    NoNodes,
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("No replication record for partition {0:?}")]
    UnknownPartition(PartitionId),

    #[error("Node {source_node:?} does not hold partition {partition:?}")]
    SourceDoesNotHold {
        partition: PartitionId,
        source_node: NodeId,
    },

    #[error("Byte transfer failed")]
    Io(#[from] io::Error),
}

struct PartitionReplication {
    primary: NodeId,
    replicas: HashSet<NodeId>,
    sync_status: HashMap<NodeId, SyncStatus>,
    last_sync: HashMap<NodeId, DateTime<Utc>>,
    version: u64,
}

impl PartitionReplication {
    fn holds(&self, node: &NodeId) -> bool {
        self.primary == *node || self.replicas.contains(node)
    }
}

/// Tracks primary/replica assignment per partition and drives data movement
/// through the partition store. The only mutator of replication state.
pub struct ReplicationManager {
    logger: slog::Logger,
    store: Arc<dyn PartitionStore>,
    state: Mutex<HashMap<PartitionId, PartitionReplication>>,
    // A replica whose last sync is older than this is reported outdated.
    outdated_after: Duration,
}

impl ReplicationManager {
    pub fn new(logger: slog::Logger, store: Arc<dyn PartitionStore>) -> Self {
        ReplicationManager {
            logger,
            store,
            state: Mutex::new(HashMap::new()),
            outdated_after: Duration::hours(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn PartitionStore> {
        &self.store
    }

    /// First node is the primary; the rest start as syncing replicas.
    pub fn setup_replication(
        &self,
        partition: PartitionId,
        nodes: &[NodeId],
    ) -> Result<(), SetupReplicationError> {
        let (primary, replicas) = match nodes.split_first() {
            Some(split) => split,
            None => return Err(SetupReplicationError::NoNodes),
        };

        let now = Utc::now();
        let mut sync_status = HashMap::new();
        let mut last_sync = HashMap::new();
        sync_status.insert(primary.clone(), SyncStatus::Synced);
        last_sync.insert(primary.clone(), now);
        for replica in replicas {
            sync_status.insert(replica.clone(), SyncStatus::Syncing);
            last_sync.insert(replica.clone(), now);
        }

        let mut state = self.state.lock().expect("ReplicationManager.setup mutex poison");
        state.insert(
            partition.clone(),
            PartitionReplication {
                primary: primary.clone(),
                replicas: replicas.iter().cloned().collect(),
                sync_status,
                last_sync,
                version: 1,
            },
        );
        slog::info!(
            self.logger,
            "Replication for {:?}: primary {:?}, replicas {:?}",
            partition,
            primary,
            replicas,
        );

        Ok(())
    }

    /// Move one partition's bytes from `source` to `target` and update the
    /// replica set. Admission (capacity, status) is checked by the caller,
    /// which owns the node records.
    pub fn transfer_partition(
        &self,
        partition: &PartitionId,
        source: &NodeId,
        target: &NodeId,
    ) -> Result<(), TransferError> {
        // Verify source actually holds the partition before moving bytes.
        {
            let state = self.state.lock().expect("ReplicationManager.transfer mutex poison");
            let record = state
                .get(partition)
                .ok_or_else(|| TransferError::UnknownPartition(partition.clone()))?;
            if !record.holds(source) {
                return Err(TransferError::SourceDoesNotHold {
                    partition: partition.clone(),
                    source_node: source.clone(),
                });
            }
        }

        // Byte copy happens outside the state lock; transfers of different
        // partitions interleave freely.
        let copied = copy_partition(self.store.as_ref(), partition, source, target)?;
        self.store.remove(source, partition)?;

        let mut state = self.state.lock().expect("ReplicationManager.transfer mutex poison");
        let record = state
            .get_mut(partition)
            .ok_or_else(|| TransferError::UnknownPartition(partition.clone()))?;

        if record.primary == *source {
            record.primary = target.clone();
        } else {
            record.replicas.remove(source);
            record.replicas.insert(target.clone());
        }
        record.sync_status.remove(source);
        record.last_sync.remove(source);
        record.sync_status.insert(target.clone(), SyncStatus::Synced);
        record.last_sync.insert(target.clone(), Utc::now());
        record.version += 1;

        slog::info!(
            self.logger,
            "Transferred {:?} ({} bytes) from {:?} to {:?} (v{})",
            partition,
            copied,
            source,
            target,
            record.version,
        );

        Ok(())
    }

    /// Swap a lost replica for a freshly restored one without moving bytes
    /// (recovery already wrote them).
    pub fn replace_replica(&self, partition: &PartitionId, lost: &NodeId, replacement: &NodeId) {
        let mut state = self.state.lock().expect("ReplicationManager.replace mutex poison");
        let record = match state.get_mut(partition) {
            Some(record) => record,
            None => return,
        };

        if record.primary == *lost {
            record.primary = replacement.clone();
        } else {
            record.replicas.remove(lost);
            record.replicas.insert(replacement.clone());
        }
        record.sync_status.remove(lost);
        record.last_sync.remove(lost);
        record.sync_status.insert(replacement.clone(), SyncStatus::Synced);
        record.last_sync.insert(replacement.clone(), Utc::now());
        record.version += 1;
    }

    pub fn mark_synced(&self, partition: &PartitionId, node: &NodeId) {
        self.set_sync_status(partition, node, SyncStatus::Synced);
    }

    /// A failed replica is re-synced on the next health cycle; the write
    /// that triggered the failure is not failed unless no healthy replica
    /// remains.
    pub fn mark_failed(&self, partition: &PartitionId, node: &NodeId) {
        self.set_sync_status(partition, node, SyncStatus::Failed);
    }

    fn set_sync_status(&self, partition: &PartitionId, node: &NodeId, status: SyncStatus) {
        let mut state = self.state.lock().expect("ReplicationManager.sync mutex poison");
        if let Some(record) = state.get_mut(partition) {
            if record.holds(node) {
                record.sync_status.insert(node.clone(), status);
                if status == SyncStatus::Synced {
                    record.last_sync.insert(node.clone(), Utc::now());
                }
            }
        }
    }

    pub fn check_replication_health(&self, partition: &PartitionId) -> Option<ReplicationHealthReport> {
        self.check_replication_health_at(partition, Utc::now())
    }

    pub(crate) fn check_replication_health_at(
        &self,
        partition: &PartitionId,
        now: DateTime<Utc>,
    ) -> Option<ReplicationHealthReport> {
        let state = self.state.lock().expect("ReplicationManager.health mutex poison");
        let record = state.get(partition)?;

        let mut healthy = Vec::new();
        let mut outdated = Vec::new();
        for (node, status) in &record.sync_status {
            if *status == SyncStatus::Synced {
                healthy.push(node.clone());
            }
            if let Some(last_sync) = record.last_sync.get(node) {
                if now.signed_duration_since(*last_sync) > self.outdated_after {
                    outdated.push(node.clone());
                }
            }
        }
        healthy.sort();
        outdated.sort();

        let status = if healthy.len() >= 2 {
            HealthLevel::Healthy
        } else {
            HealthLevel::Degraded
        };

        Some(ReplicationHealthReport {
            status,
            healthy_replicas: healthy,
            outdated_replicas: outdated,
        })
    }

    /// Holders of a partition that are currently synced, excluding `exclude`.
    /// This is the candidate source list for recovery.
    pub fn healthy_holders(&self, partition: &PartitionId, exclude: &NodeId) -> Vec<NodeId> {
        let state = self.state.lock().expect("ReplicationManager.holders mutex poison");
        let record = match state.get(partition) {
            Some(record) => record,
            None => return Vec::new(),
        };

        let mut holders: Vec<NodeId> = record
            .sync_status
            .iter()
            .filter(|(node, status)| **status == SyncStatus::Synced && *node != exclude)
            .map(|(node, _)| node.clone())
            .collect();
        holders.sort();
        holders
    }

    pub fn replica_set(&self, partition: &PartitionId) -> Option<ReplicaSet> {
        let state = self.state.lock().expect("ReplicationManager.replica_set mutex poison");
        state.get(partition).map(Self::snapshot)
    }

    pub fn all_replica_sets(&self) -> HashMap<PartitionId, ReplicaSet> {
        let state = self.state.lock().expect("ReplicationManager.all mutex poison");
        state
            .iter()
            .map(|(partition, record)| (partition.clone(), Self::snapshot(record)))
            .collect()
    }

    fn snapshot(record: &PartitionReplication) -> ReplicaSet {
        let mut replicas: Vec<NodeId> = record.replicas.iter().cloned().collect();
        replicas.sort();
        ReplicaSet {
            primary: record.primary.clone(),
            replicas,
            sync_status: record.sync_status.clone(),
            version: record.version,
        }
    }

    /// Drop the record when a partition is deleted or all replicas are gone.
    pub fn remove_partition(&self, partition: &PartitionId) {
        let mut state = self.state.lock().expect("ReplicationManager.remove mutex poison");
        state.remove(partition);
    }

    #[cfg(test)]
    pub(crate) fn set_last_sync_for_test(
        &self,
        partition: &PartitionId,
        node: &NodeId,
        at: DateTime<Utc>,
    ) {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.get_mut(partition) {
            record.last_sync.insert(node.clone(), at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::store::InMemoryPartitionStore;
    use bytes::Bytes;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn manager_with_store() -> (ReplicationManager, Arc<InMemoryPartitionStore>) {
        let store = Arc::new(InMemoryPartitionStore::new());
        let manager = ReplicationManager::new(test_logger(), store.clone());
        (manager, store)
    }

    fn node(id: &str) -> NodeId {
        NodeId::new(id)
    }

    #[test]
    fn setup_marks_primary_synced_and_replicas_syncing() {
        let (manager, _) = manager_with_store();
        let p = PartitionId::new("p1");
        manager
            .setup_replication(p.clone(), &[node("n1"), node("n2"), node("n3")])
            .unwrap();

        let set = manager.replica_set(&p).unwrap();
        assert_eq!(set.primary, node("n1"));
        assert_eq!(set.replicas, vec![node("n2"), node("n3")]);
        assert_eq!(set.sync_status.get(&node("n1")), Some(&SyncStatus::Synced));
        assert_eq!(set.sync_status.get(&node("n2")), Some(&SyncStatus::Syncing));
        assert_eq!(set.version, 1);
    }

    #[test]
    fn setup_with_no_nodes_is_an_error() {
        let (manager, _) = manager_with_store();
        assert!(manager
            .setup_replication(PartitionId::new("p1"), &[])
            .is_err());
    }

    #[test]
    fn transfer_moves_bytes_and_repoints_primary() {
        let (manager, store) = manager_with_store();
        let p = PartitionId::new("p1");
        manager
            .setup_replication(p.clone(), &[node("n1"), node("n2")])
            .unwrap();
        store
            .write_all(&node("n1"), &p, Bytes::from_static(b"payload"))
            .unwrap();

        manager.transfer_partition(&p, &node("n1"), &node("n3")).unwrap();

        let set = manager.replica_set(&p).unwrap();
        assert_eq!(set.primary, node("n3"));
        assert_eq!(set.version, 2);
        assert_eq!(
            store.read_all(&node("n3"), &p).unwrap().unwrap(),
            Bytes::from_static(b"payload")
        );
        assert!(store.read_all(&node("n1"), &p).unwrap().is_none());
    }

    #[test]
    fn transfer_of_replica_swaps_replica_set() {
        let (manager, store) = manager_with_store();
        let p = PartitionId::new("p1");
        manager
            .setup_replication(p.clone(), &[node("n1"), node("n2")])
            .unwrap();
        store
            .write_all(&node("n2"), &p, Bytes::from_static(b"copy"))
            .unwrap();

        manager.transfer_partition(&p, &node("n2"), &node("n4")).unwrap();

        let set = manager.replica_set(&p).unwrap();
        assert_eq!(set.primary, node("n1"));
        assert_eq!(set.replicas, vec![node("n4")]);
    }

    #[test]
    fn transfer_from_non_holder_is_refused() {
        let (manager, store) = manager_with_store();
        let p = PartitionId::new("p1");
        manager.setup_replication(p.clone(), &[node("n1")]).unwrap();
        store
            .write_all(&node("n9"), &p, Bytes::from_static(b"stray"))
            .unwrap();

        let err = manager
            .transfer_partition(&p, &node("n9"), &node("n2"))
            .unwrap_err();
        assert!(matches!(err, TransferError::SourceDoesNotHold { .. }));
    }

    #[test]
    fn health_requires_two_synced_replicas() {
        let (manager, _) = manager_with_store();
        let p = PartitionId::new("p1");
        manager
            .setup_replication(p.clone(), &[node("n1"), node("n2"), node("n3")])
            .unwrap();

        let report = manager.check_replication_health(&p).unwrap();
        assert_eq!(report.status, HealthLevel::Degraded);
        assert_eq!(report.healthy_replicas, vec![node("n1")]);

        manager.mark_synced(&p, &node("n2"));
        let report = manager.check_replication_health(&p).unwrap();
        assert_eq!(report.status, HealthLevel::Healthy);
        assert_eq!(report.healthy_replicas, vec![node("n1"), node("n2")]);
    }

    #[test]
    fn stale_last_sync_is_reported_outdated() {
        let (manager, _) = manager_with_store();
        let p = PartitionId::new("p1");
        manager
            .setup_replication(p.clone(), &[node("n1"), node("n2")])
            .unwrap();
        manager.mark_synced(&p, &node("n2"));

        let two_hours_ago = Utc::now() - Duration::hours(2);
        manager.set_last_sync_for_test(&p, &node("n2"), two_hours_ago);

        let report = manager.check_replication_health(&p).unwrap();
        assert_eq!(report.outdated_replicas, vec![node("n2")]);
    }

    #[test]
    fn failed_replica_is_excluded_from_healthy_holders() {
        let (manager, _) = manager_with_store();
        let p = PartitionId::new("p1");
        manager
            .setup_replication(p.clone(), &[node("n1"), node("n2"), node("n3")])
            .unwrap();
        manager.mark_synced(&p, &node("n2"));
        manager.mark_synced(&p, &node("n3"));
        manager.mark_failed(&p, &node("n3"));

        assert_eq!(manager.healthy_holders(&p, &node("n1")), vec![node("n2")]);
    }
}
