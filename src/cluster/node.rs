use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// NodeId identifies one cluster member.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        NodeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// PartitionId identifies a unit of data placed on one or more nodes.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PartitionId(String);

impl PartitionId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        PartitionId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Active,
    Degraded,
    Unhealthy,
    Failed,
}

impl NodeStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, NodeStatus::Active)
    }
}

/// Provisioned capacity of a node, supplied at registration time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeCapacity {
    pub storage_bytes: u64,
    pub memory_bytes: u64,
    pub cpu_cores: u32,
    pub network_bandwidth_mbps: u64,
    pub max_partitions: usize,
    pub rack_id: String,
    pub datacenter_id: String,
    pub zone: String,
}

/// Point-in-time resource usage. cpu/memory/disk are percentages in [0, 100];
/// network_io and iops are raw gauges.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetrics {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
    pub network_io: f64,
    pub iops: f64,
}

/// Serializable snapshot of a node for coordinator state and membership
/// messages. Deliberately excludes the live partition set; partition
/// placement is the coordinator's record, not the node's.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub id: NodeId,
    pub capacity: NodeCapacity,
    pub status: NodeStatus,
}

const HEALTHY_HEARTBEAT_AGE_SECS: i64 = 30;
const HEALTHY_RESOURCE_LIMIT: f64 = 90.0;
const ADMISSION_RESOURCE_LIMIT: f64 = 80.0;

/// In-memory record of one cluster member. Owned by the distribution manager
/// and mutated under a per-node lock; accessors that expose collections
/// return copies.
pub struct Node {
    id: NodeId,
    capacity: NodeCapacity,
    status: NodeStatus,
    partitions: HashSet<PartitionId>,
    metrics: ResourceMetrics,
    last_heartbeat: DateTime<Utc>,
}

impl Node {
    pub fn new(id: NodeId, capacity: NodeCapacity) -> Self {
        Node {
            id,
            capacity,
            status: NodeStatus::Active,
            partitions: HashSet::new(),
            metrics: ResourceMetrics::default(),
            last_heartbeat: Utc::now(),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn capacity(&self) -> &NodeCapacity {
        &self.capacity
    }

    pub fn status(&self) -> NodeStatus {
        self.status
    }

    pub fn set_status(&mut self, status: NodeStatus) {
        self.status = status;
    }

    /// Returns false if the partition was already present.
    pub fn add_partition(&mut self, partition: PartitionId) -> bool {
        self.partitions.insert(partition)
    }

    /// Returns false if the partition was not present.
    pub fn remove_partition(&mut self, partition: &PartitionId) -> bool {
        self.partitions.remove(partition)
    }

    pub fn has_partition(&self, partition: &PartitionId) -> bool {
        self.partitions.contains(partition)
    }

    /// Copy of the owned partition set.
    pub fn partitions(&self) -> HashSet<PartitionId> {
        self.partitions.clone()
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn metrics(&self) -> ResourceMetrics {
        self.metrics
    }

    pub fn update_metrics(&mut self, metrics: ResourceMetrics) {
        self.metrics = metrics;
    }

    pub fn record_heartbeat(&mut self) {
        self.last_heartbeat = Utc::now();
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        self.last_heartbeat
    }

    /// Weighted load score in [0, 1]: cpu 0.3, memory 0.3, disk 0.2,
    /// partition-count ratio 0.2.
    pub fn load(&self) -> f64 {
        let partition_ratio = if self.capacity.max_partitions == 0 {
            1.0
        } else {
            self.partitions.len() as f64 / self.capacity.max_partitions as f64
        };

        (self.metrics.cpu / 100.0) * 0.3
            + (self.metrics.memory / 100.0) * 0.3
            + (self.metrics.disk / 100.0) * 0.2
            + partition_ratio * 0.2
    }

    /// Storage not yet consumed, derived from the disk usage percentage.
    pub fn free_storage_bytes(&self) -> u64 {
        let used = (self.metrics.disk / 100.0) * self.capacity.storage_bytes as f64;
        self.capacity.storage_bytes.saturating_sub(used as u64)
    }

    pub fn is_healthy(&self) -> bool {
        self.is_healthy_at(Utc::now())
    }

    pub(crate) fn is_healthy_at(&self, now: DateTime<Utc>) -> bool {
        let heartbeat_fresh =
            now.signed_duration_since(self.last_heartbeat) <= Duration::seconds(HEALTHY_HEARTBEAT_AGE_SECS);

        heartbeat_fresh
            && self.status == NodeStatus::Active
            && self.metrics.cpu < HEALTHY_RESOURCE_LIMIT
            && self.metrics.memory < HEALTHY_RESOURCE_LIMIT
            && self.metrics.disk < HEALTHY_RESOURCE_LIMIT
    }

    /// Admission check for new placements. Stricter than `is_healthy`: a node
    /// may be healthy but too full to take more work.
    pub fn can_accept_partition(&self, size_hint_bytes: Option<u64>) -> bool {
        if !self.status.is_active() {
            return false;
        }
        if self.partitions.len() >= self.capacity.max_partitions {
            return false;
        }
        if self.metrics.cpu >= ADMISSION_RESOURCE_LIMIT
            || self.metrics.memory >= ADMISSION_RESOURCE_LIMIT
            || self.metrics.disk >= ADMISSION_RESOURCE_LIMIT
        {
            return false;
        }
        if let Some(size) = size_hint_bytes {
            if self.free_storage_bytes() < size {
                return false;
            }
        }

        true
    }

    pub fn descriptor(&self) -> NodeDescriptor {
        NodeDescriptor {
            id: self.id.clone(),
            capacity: self.capacity.clone(),
            status: self.status,
        }
    }
}
