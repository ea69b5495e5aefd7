use crate::cluster::NodeId;
use crate::consensus::log::{LogIndex, Term};
use serde::{Deserialize, Serialize};

/// Broadcast by a candidate at the start of an election.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate: NodeId,
    pub last_log_index: Option<LogIndex>,
    pub last_log_term: Option<Term>,
}

/// One voter's answer. Carries the voter's term so a stale candidate can
/// step down even on a rejection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: Term,
    pub from: NodeId,
    pub granted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireLogEntry {
    pub term: Term,
    pub data: Vec<u8>,
}

/// Leader-to-follower log replication; an empty entry list is a heartbeat.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicateRequest {
    pub term: Term,
    pub leader: NodeId,
    pub prev_log_index: Option<LogIndex>,
    pub prev_log_term: Option<Term>,
    pub entries: Vec<WireLogEntry>,
    pub leader_commit: Option<LogIndex>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicateResponse {
    pub term: Term,
    pub from: NodeId,
    pub outcome: ReplicateOutcome,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ReplicateOutcome {
    /// The follower's log now matches through `replicated_through`. None
    /// means the request carried nothing and the follower log is empty at
    /// the probed position.
    Success { replicated_through: Option<LogIndex> },
    /// The follower lacks the previous entry the leader assumed; the leader
    /// should rewind and retry.
    MissingPrevious,
    /// The sender's term is behind; it must step down.
    StaleTerm { current_term: Term },
}
