use crate::background::{self, Stopper};
use crate::cluster::{NodeDescriptor, NodeId, NodeStatus, PartitionId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Serializable snapshot published to subscribers on every state change.
#[derive(Clone, Debug, Serialize)]
pub struct ClusterStateSnapshot {
    pub version: u64,
    pub last_update: DateTime<Utc>,
    pub nodes: Vec<NodeDescriptor>,
    pub partition_locations: HashMap<PartitionId, Vec<NodeId>>,
}

struct ClusterState {
    nodes: HashMap<NodeId, NodeDescriptor>,
    partition_locations: HashMap<PartitionId, HashSet<NodeId>>,
    // Monotonic; subscribers use it to detect staleness, not for ordering
    // across partitions.
    version: u64,
    last_update: DateTime<Utc>,
}

/// Authoritative, versioned, in-memory view of the cluster. A passive state
/// holder: the distribution manager and its collaborators notify it, it
/// never initiates work. Subscribers get snapshots over bounded channels;
/// a slow subscriber loses notifications rather than stalling a mutation.
pub struct ClusterCoordinator {
    logger: slog::Logger,
    state: Mutex<ClusterState>,
    subscribers: Mutex<Vec<mpsc::Sender<ClusterStateSnapshot>>>,
}

pub struct CleanupLoopHandle {
    _stopper: Stopper,
}

impl ClusterCoordinator {
    pub fn new(logger: slog::Logger) -> Self {
        ClusterCoordinator {
            logger,
            state: Mutex::new(ClusterState {
                nodes: HashMap::new(),
                partition_locations: HashMap::new(),
                version: 0,
                last_update: Utc::now(),
            }),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn add_node(&self, descriptor: NodeDescriptor) {
        self.mutate(|state| {
            state.nodes.insert(descriptor.id.clone(), descriptor);
        });
    }

    pub fn update_node_status(&self, node: &NodeId, status: NodeStatus) {
        self.mutate(|state| {
            if let Some(descriptor) = state.nodes.get_mut(node) {
                descriptor.status = status;
            }
        });
    }

    /// Remove a node and prune it from every partition's location set,
    /// dropping location entries that become empty.
    pub fn remove_node(&self, node: &NodeId) {
        self.mutate(|state| {
            state.nodes.remove(node);
            state.partition_locations.retain(|_, locations| {
                locations.remove(node);
                !locations.is_empty()
            });
        });
    }

    pub fn update_partition_location(&self, partition: PartitionId, nodes: Vec<NodeId>) {
        self.mutate(|state| {
            state
                .partition_locations
                .insert(partition, nodes.into_iter().collect());
        });
    }

    pub fn remove_partition(&self, partition: &PartitionId) {
        self.mutate(|state| {
            state.partition_locations.remove(partition);
        });
    }

    /// Descriptors of the nodes currently holding a partition.
    pub fn get_partition_nodes(&self, partition: &PartitionId) -> Vec<NodeDescriptor> {
        let state = self.state.lock().expect("ClusterCoordinator.state mutex poison");
        match state.partition_locations.get(partition) {
            Some(locations) => {
                let mut nodes: Vec<NodeDescriptor> = locations
                    .iter()
                    .filter_map(|node| state.nodes.get(node).cloned())
                    .collect();
                nodes.sort_by(|a, b| a.id.cmp(&b.id));
                nodes
            }
            None => Vec::new(),
        }
    }

    pub fn get_partition_locations(&self, partition: &PartitionId) -> Vec<NodeId> {
        let state = self.state.lock().expect("ClusterCoordinator.state mutex poison");
        match state.partition_locations.get(partition) {
            Some(locations) => {
                let mut nodes: Vec<NodeId> = locations.iter().cloned().collect();
                nodes.sort();
                nodes
            }
            None => Vec::new(),
        }
    }

    pub fn known_node(&self, node: &NodeId) -> bool {
        let state = self.state.lock().expect("ClusterCoordinator.state mutex poison");
        state.nodes.contains_key(node)
    }

    pub fn version(&self) -> u64 {
        let state = self.state.lock().expect("ClusterCoordinator.state mutex poison");
        state.version
    }

    pub fn snapshot(&self) -> ClusterStateSnapshot {
        let state = self.state.lock().expect("ClusterCoordinator.state mutex poison");
        Self::snapshot_of(&state)
    }

    /// Subscribe to state change notifications. The channel is bounded;
    /// missed snapshots are recoverable via `snapshot()` since every
    /// snapshot carries the full state and a version.
    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<ClusterStateSnapshot> {
        let (tx, rx) = mpsc::channel(capacity);
        self.subscribers
            .lock()
            .expect("ClusterCoordinator.subscribers mutex poison")
            .push(tx);
        rx
    }

    /// Every location entry must reference known nodes. Entries referencing
    /// now-unknown nodes are pruned, never silently ignored. Returns the
    /// number of pruned references.
    pub fn cleanup_unknown_locations(&self) -> usize {
        let mut pruned = 0usize;
        self.mutate(|state| {
            let nodes = &state.nodes;
            state.partition_locations.retain(|_, locations| {
                let before = locations.len();
                locations.retain(|node| nodes.contains_key(node));
                pruned += before - locations.len();
                !locations.is_empty()
            });
        });

        if pruned > 0 {
            slog::warn!(
                self.logger,
                "Pruned {} partition-location references to unknown nodes",
                pruned,
            );
        }
        pruned
    }

    /// Background loop re-checking the location invariant.
    pub fn spawn_cleanup_loop(self: &Arc<Self>, interval: tokio::time::Duration) -> CleanupLoopHandle {
        let (stopper, stop_check) = background::stop_signal();
        let coordinator = self.clone();

        tokio::task::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if stop_check.should_stop() {
                    return;
                }
                coordinator.cleanup_unknown_locations();
            }
        });

        CleanupLoopHandle { _stopper: stopper }
    }

    fn mutate<F: FnOnce(&mut ClusterState)>(&self, apply: F) {
        let snapshot = {
            let mut state = self.state.lock().expect("ClusterCoordinator.state mutex poison");
            apply(&mut state);
            state.version += 1;
            state.last_update = Utc::now();
            Self::snapshot_of(&state)
        };

        self.publish(snapshot);
    }

    fn snapshot_of(state: &ClusterState) -> ClusterStateSnapshot {
        let mut nodes: Vec<NodeDescriptor> = state.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));

        ClusterStateSnapshot {
            version: state.version,
            last_update: state.last_update,
            nodes,
            partition_locations: state
                .partition_locations
                .iter()
                .map(|(partition, locations)| {
                    let mut nodes: Vec<NodeId> = locations.iter().cloned().collect();
                    nodes.sort();
                    (partition.clone(), nodes)
                })
                .collect(),
        }
    }

    fn publish(&self, snapshot: ClusterStateSnapshot) {
        let mut subscribers = self
            .subscribers
            .lock()
            .expect("ClusterCoordinator.subscribers mutex poison");

        subscribers.retain(|subscriber| !subscriber.is_closed());
        for subscriber in subscribers.iter() {
            if let Err(mpsc::error::TrySendError::Full(_)) = subscriber.try_send(snapshot.clone()) {
                slog::debug!(
                    self.logger,
                    "Subscriber queue full, dropping state notification v{}",
                    snapshot.version,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::test_utils::test_capacity;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn descriptor(id: &str) -> NodeDescriptor {
        NodeDescriptor {
            id: NodeId::new(id),
            capacity: test_capacity(),
            status: NodeStatus::Active,
        }
    }

    #[test]
    fn every_mutation_bumps_the_version() {
        let c = ClusterCoordinator::new(test_logger());
        assert_eq!(c.version(), 0);

        c.add_node(descriptor("n1"));
        assert_eq!(c.version(), 1);
        c.update_partition_location(PartitionId::new("p1"), vec![NodeId::new("n1")]);
        assert_eq!(c.version(), 2);
        c.remove_node(&NodeId::new("n1"));
        assert_eq!(c.version(), 3);
    }

    #[test]
    fn remove_node_prunes_location_sets() {
        let c = ClusterCoordinator::new(test_logger());
        c.add_node(descriptor("n1"));
        c.add_node(descriptor("n2"));
        c.update_partition_location(
            PartitionId::new("p1"),
            vec![NodeId::new("n1"), NodeId::new("n2")],
        );
        c.update_partition_location(PartitionId::new("p2"), vec![NodeId::new("n1")]);

        c.remove_node(&NodeId::new("n1"));

        assert_eq!(
            c.get_partition_locations(&PartitionId::new("p1")),
            vec![NodeId::new("n2")]
        );
        // p2's only holder is gone; the entry disappears.
        assert!(c.get_partition_locations(&PartitionId::new("p2")).is_empty());
    }

    #[test]
    fn partition_nodes_returns_descriptors() {
        let c = ClusterCoordinator::new(test_logger());
        c.add_node(descriptor("n1"));
        c.add_node(descriptor("n2"));
        c.update_partition_location(
            PartitionId::new("p1"),
            vec![NodeId::new("n2"), NodeId::new("n1")],
        );

        let nodes = c.get_partition_nodes(&PartitionId::new("p1"));
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].id, NodeId::new("n1"));
    }

    #[tokio::test]
    async fn subscribers_receive_versioned_snapshots() {
        let c = ClusterCoordinator::new(test_logger());
        let mut rx = c.subscribe(8);

        c.add_node(descriptor("n1"));
        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.version, 1);
        assert_eq!(snapshot.nodes.len(), 1);

        c.update_partition_location(PartitionId::new("p1"), vec![NodeId::new("n1")]);
        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.version, 2);
        assert_eq!(
            snapshot.partition_locations.get(&PartitionId::new("p1")),
            Some(&vec![NodeId::new("n1")])
        );
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_block_mutations() {
        let c = ClusterCoordinator::new(test_logger());
        let mut rx = c.subscribe(1);

        // Far more mutations than the subscriber queue holds.
        for i in 0..10 {
            c.add_node(descriptor(&format!("n{}", i)));
        }
        assert_eq!(c.version(), 10);

        // Subscriber still gets the earliest undropped snapshot.
        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.version, 1);
    }

    #[test]
    fn cleanup_prunes_unknown_node_references() {
        let c = ClusterCoordinator::new(test_logger());
        c.add_node(descriptor("n1"));
        // n-ghost was never added as a node.
        c.update_partition_location(
            PartitionId::new("p1"),
            vec![NodeId::new("n1"), NodeId::new("n-ghost")],
        );

        let pruned = c.cleanup_unknown_locations();
        assert_eq!(pruned, 1);
        assert_eq!(
            c.get_partition_locations(&PartitionId::new("p1")),
            vec![NodeId::new("n1")]
        );
    }
}
