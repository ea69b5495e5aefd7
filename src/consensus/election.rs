use crate::cluster::NodeId;
use crate::consensus::actor::{ConsensusClient, LeaderTick, RoleSnapshot};
use crate::consensus::log::{LogIndex, Term};
use crate::consensus::timer::{FollowerTimerHandle, LeaderTimerHandle};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tokio::time::Duration;

#[derive(Clone)]
pub(crate) struct ElectionConfig {
    pub my_node_id: NodeId,
    pub leader_heartbeat_interval: Duration,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
}

pub(crate) enum CurrentLeader {
    Me,
    Other(NodeId),
    Unknown,
}

/// ElectionState holds the state specific to the stage in an election and the
/// mechanics of each transition. It is NOT responsible for validating terms,
/// logs, or membership; the engine decides "when", this type does "what".
pub(crate) struct ElectionState {
    state: State,
    config: ElectionConfig,
    actor_client: ConsensusClient,
}

impl ElectionState {
    pub(crate) fn new_follower(config: ElectionConfig, actor_client: ConsensusClient) -> Self {
        let initial_state = State::Follower(FollowerState::new(
            config.election_timeout_min,
            config.election_timeout_max,
            actor_client.clone(),
        ));

        ElectionState {
            state: initial_state,
            config,
            actor_client,
        }
    }

    pub(crate) fn transition_to_follower(&mut self, new_leader: Option<NodeId>) {
        self.state = State::Follower(FollowerState::with_leader(
            new_leader,
            self.config.election_timeout_min,
            self.config.election_timeout_max,
            self.actor_client.clone(),
        ));
    }

    /// Returns the number of votes held after voting for ourselves (always 1).
    pub(crate) fn transition_to_candidate_and_vote_for_self(&mut self) -> usize {
        let mut cs = CandidateState::new(
            self.config.election_timeout_min,
            self.config.election_timeout_max,
            self.actor_client.clone(),
        );
        let votes = cs.add_received_vote(self.config.my_node_id.clone());

        self.state = State::Candidate(cs);
        votes
    }

    pub(crate) fn transition_to_leader(
        &mut self,
        term: Term,
        peer_ids: HashSet<NodeId>,
        last_log_index: Option<LogIndex>,
    ) {
        let next = last_log_index.map(|i| i.plus(1)).unwrap_or_else(|| LogIndex::new(0));

        let mut peers = HashMap::with_capacity(peer_ids.len());
        for peer_id in peer_ids {
            let timer = LeaderTimerHandle::spawn_timer_task(
                self.config.leader_heartbeat_interval,
                self.actor_client.clone(),
                LeaderTick {
                    peer: peer_id.clone(),
                    term,
                },
            );
            peers.insert(peer_id, PeerProgress::new(timer, next));
        }

        self.state = State::Leader(LeaderState { peers });
    }

    pub(crate) fn current_leader(&self) -> CurrentLeader {
        match &self.state {
            State::Leader(_) => CurrentLeader::Me,
            State::Candidate(_) => CurrentLeader::Unknown,
            State::Follower(FollowerState { leader: Some(leader), .. }) => {
                CurrentLeader::Other(leader.clone())
            }
            State::Follower(FollowerState { leader: None, .. }) => CurrentLeader::Unknown,
        }
    }

    pub(crate) fn role_snapshot(&self) -> RoleSnapshot {
        match &self.state {
            State::Leader(_) => RoleSnapshot::Leader,
            State::Candidate(_) => RoleSnapshot::Candidate,
            State::Follower(_) => RoleSnapshot::Follower,
        }
    }

    pub(crate) fn reset_timeout_if_follower(&self) {
        if let State::Follower(fs) = &self.state {
            fs.reset_timeout();
        }
    }

    pub(crate) fn set_leader_if_unknown(&mut self, leader: &NodeId) {
        if let State::Follower(fs) = &mut self.state {
            if fs.leader.is_none() {
                fs.leader.replace(leader.clone());
            }
        }
    }

    /// A same-term replicate request proves a leader exists for this term;
    /// a candidate observing one abandons its election.
    pub(crate) fn step_down_if_candidate(&mut self, leader: &NodeId) {
        if let State::Candidate(_) = &self.state {
            self.transition_to_follower(Some(leader.clone()));
        }
    }

    /// Returns the vote count after adding, or None if no longer candidate.
    pub(crate) fn add_vote_if_candidate(&mut self, vote_from: NodeId) -> Option<usize> {
        if let State::Candidate(cs) = &mut self.state {
            Some(cs.add_received_vote(vote_from))
        } else {
            None
        }
    }

    pub(crate) fn leader_peers_mut(&mut self) -> Option<&mut HashMap<NodeId, PeerProgress>> {
        if let State::Leader(ls) = &mut self.state {
            Some(&mut ls.peers)
        } else {
            None
        }
    }
}

impl fmt::Debug for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            State::Leader(_) => write!(f, "Leader"),
            State::Candidate(_) => write!(f, "Candidate"),
            State::Follower(FollowerState { leader: Some(leader), .. }) => {
                write!(f, "Follower(Leader={:?})", leader)
            }
            State::Follower(FollowerState { leader: None, .. }) => write!(f, "Follower(Leader=None)"),
        }
    }
}

enum State {
    Leader(LeaderState),
    Candidate(CandidateState),
    Follower(FollowerState),
}

struct LeaderState {
    peers: HashMap<NodeId, PeerProgress>,
}

struct CandidateState {
    received_votes_from: HashSet<NodeId>,
    _election_timeout: FollowerTimerHandle,
}

struct FollowerState {
    leader: Option<NodeId>,
    election_timeout: FollowerTimerHandle,
}

impl CandidateState {
    fn new(min_timeout: Duration, max_timeout: Duration, actor_client: ConsensusClient) -> Self {
        CandidateState {
            received_votes_from: HashSet::with_capacity(3),
            _election_timeout: FollowerTimerHandle::spawn_timer_task(min_timeout, max_timeout, actor_client),
        }
    }

    /// Returns the number of unique votes held after adding `vote_from`.
    fn add_received_vote(&mut self, vote_from: NodeId) -> usize {
        self.received_votes_from.insert(vote_from);
        self.received_votes_from.len()
    }
}

impl FollowerState {
    fn new(min_timeout: Duration, max_timeout: Duration, actor_client: ConsensusClient) -> Self {
        Self::with_leader(None, min_timeout, max_timeout, actor_client)
    }

    fn with_leader(
        leader: Option<NodeId>,
        min_timeout: Duration,
        max_timeout: Duration,
        actor_client: ConsensusClient,
    ) -> Self {
        FollowerState {
            leader,
            election_timeout: FollowerTimerHandle::spawn_timer_task(min_timeout, max_timeout, actor_client),
        }
    }

    fn reset_timeout(&self) {
        self.election_timeout.reset_timeout();
    }
}

/// Leader-side replication progress for one peer.
pub(crate) struct PeerProgress {
    // Held to keep heartbeats flowing to this peer.
    heartbeat_timer: LeaderTimerHandle,

    // Index of the next entry to send (leader last log index + 1 at
    // election time).
    next: LogIndex,
    // Highest index known replicated on the peer. Ratchets forward only,
    // which keeps duplicated or reordered responses harmless.
    matched: Option<LogIndex>,
}

impl PeerProgress {
    fn new(heartbeat_timer: LeaderTimerHandle, next: LogIndex) -> Self {
        PeerProgress {
            heartbeat_timer,
            next,
            matched: None,
        }
    }

    pub(crate) fn next_and_previous(&self) -> (LogIndex, Option<LogIndex>) {
        (self.next, self.next.checked_minus(1))
    }

    pub(crate) fn matched(&self) -> Option<LogIndex> {
        self.matched
    }

    /// Record a successful replicate response that confirmed the peer's log
    /// through `replicated_through`. Stale confirmations are ignored.
    pub(crate) fn record_success(&mut self, replicated_through: Option<LogIndex>) {
        let confirmed = match replicated_through {
            // Pure heartbeat against an empty prefix; nothing to learn.
            None => return,
            Some(index) => index,
        };

        if matches!(self.matched, Some(m) if confirmed <= m) {
            return;
        }

        self.matched.replace(confirmed);
        let new_next = confirmed.plus(1);
        if new_next > self.next {
            self.next = new_next;
        }
    }

    /// The peer is missing the previous entry we probed with; walk back one.
    pub(crate) fn rewind(&mut self, logger: &slog::Logger) {
        if self.matched.is_some() {
            // A rewind after any confirmed match means the peer returned
            // garbage. Don't corrupt our tracking over it.
            slog::warn!(logger, "Ignoring log rewind after a confirmed match");
            return;
        }

        match self.next.checked_minus(1) {
            Some(new_next) => self.next = new_next,
            None => slog::warn!(logger, "Can't rewind peer log, already at start"),
        }
    }

    pub(crate) fn reset_heartbeat_timer(&self) {
        self.heartbeat_timer.reset_heartbeat_timer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn progress(next: u64) -> PeerProgress {
        let (client, _rx) = ConsensusClient::new(10);
        let timer = LeaderTimerHandle::spawn_timer_task(
            Duration::from_secs(3600),
            client,
            LeaderTick {
                peer: NodeId::new("p"),
                term: Term::new(1),
            },
        );
        PeerProgress::new(timer, LogIndex::new(next))
    }

    #[tokio::test]
    async fn success_ratchets_matched_and_next() {
        let mut p = progress(0);
        p.record_success(Some(LogIndex::new(4)));
        assert_eq!(p.matched(), Some(LogIndex::new(4)));
        assert_eq!(p.next_and_previous().0, LogIndex::new(5));

        // Duplicate and stale confirmations change nothing.
        p.record_success(Some(LogIndex::new(4)));
        p.record_success(Some(LogIndex::new(2)));
        assert_eq!(p.matched(), Some(LogIndex::new(4)));
        assert_eq!(p.next_and_previous().0, LogIndex::new(5));
    }

    #[tokio::test]
    async fn heartbeat_success_learns_nothing() {
        let mut p = progress(0);
        p.record_success(None);
        assert_eq!(p.matched(), None);
        assert_eq!(p.next_and_previous().0, LogIndex::new(0));
    }

    #[tokio::test]
    async fn rewind_walks_back_until_log_start() {
        let logger = test_logger();
        let mut p = progress(2);
        p.rewind(&logger);
        assert_eq!(p.next_and_previous(), (LogIndex::new(1), Some(LogIndex::new(0))));
        p.rewind(&logger);
        assert_eq!(p.next_and_previous(), (LogIndex::new(0), None));
        // Already at the start; stays put.
        p.rewind(&logger);
        assert_eq!(p.next_and_previous(), (LogIndex::new(0), None));
    }

    #[tokio::test]
    async fn rewind_after_match_is_refused() {
        let logger = test_logger();
        let mut p = progress(0);
        p.record_success(Some(LogIndex::new(3)));
        p.rewind(&logger);
        assert_eq!(p.next_and_previous().0, LogIndex::new(4));
    }
}
