use crate::cluster::NodeId;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;

/// Closed set of wire message kinds. Dispatch and the proto boundary match on
/// this exhaustively; adding a kind is a compile-time-visible change.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum MessageKind {
    // Membership
    NodeJoin,
    NodeLeave,
    StateUpdate,
    // Partition management
    PartitionAssign,
    PartitionTransfer,
    PartitionSync,
    // Health
    HealthCheck,
    HealthReport,
    Alert,
    // Consensus
    VoteRequest,
    VoteResponse,
    ReplicateRequest,
    ReplicateResponse,
    // Recovery
    RecoveryRequest,
    RecoveryResponse,
    // Data replication
    Replicate,
    ReplicateAck,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::NodeJoin => "node_join",
            MessageKind::NodeLeave => "node_leave",
            MessageKind::StateUpdate => "state_update",
            MessageKind::PartitionAssign => "partition_assign",
            MessageKind::PartitionTransfer => "partition_transfer",
            MessageKind::PartitionSync => "partition_sync",
            MessageKind::HealthCheck => "health_check",
            MessageKind::HealthReport => "health_report",
            MessageKind::Alert => "alert",
            MessageKind::VoteRequest => "vote_request",
            MessageKind::VoteResponse => "vote_response",
            MessageKind::ReplicateRequest => "replicate_request",
            MessageKind::ReplicateResponse => "replicate_response",
            MessageKind::RecoveryRequest => "recovery_request",
            MessageKind::RecoveryResponse => "recovery_response",
            MessageKind::Replicate => "replicate",
            MessageKind::ReplicateAck => "replicate_ack",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Transport-agnostic message envelope. Payloads are serde-encoded by the
/// owning component; the envelope carries them opaquely.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub id: String,
    pub kind: MessageKind,
    pub source: NodeId,
    pub target: NodeId,
    pub payload: Bytes,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(kind: MessageKind, source: NodeId, target: NodeId, payload: Bytes) -> Self {
        Envelope {
            id: random_envelope_id(),
            kind,
            source,
            target,
            payload,
            timestamp: Utc::now(),
        }
    }
}

fn random_envelope_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

pub fn encode_payload<T: Serialize>(value: &T) -> Result<Bytes, serde_json::Error> {
    serde_json::to_vec(value).map(Bytes::from)
}

pub fn decode_payload<T: DeserializeOwned>(payload: &Bytes) -> Result<T, serde_json::Error> {
    serde_json::from_slice(payload)
}
