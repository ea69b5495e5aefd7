use crate::cluster::NodeId;
use crate::consensus::actor::{ConsensusClient, ConsensusStatus, LeaderTick};
use crate::consensus::commit_stream::CommitStreamPublisher;
use crate::consensus::election::{CurrentLeader, ElectionConfig, ElectionState};
use crate::consensus::log::{ConsensusLog, LogEntry, LogIndex, LogStore, Term};
use crate::consensus::messages::{
    ReplicateOutcome, ReplicateRequest, ReplicateResponse, VoteRequest, VoteResponse, WireLogEntry,
};
use crate::consensus::EntryKey;
use crate::transport::{encode_payload, Envelope, MessageKind, NetworkTransport};
use bytes::Bytes;
use serde::Serialize;
use std::cmp;
use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Duration;

const MAX_ENTRIES_PER_REQUEST: usize = 32;

pub struct EngineConfig<S: LogStore> {
    pub logger: slog::Logger,
    pub my_node_id: NodeId,
    /// All cluster members, including this one.
    pub members: HashSet<NodeId>,
    pub log_store: S,
    pub transport: Arc<dyn NetworkTransport>,
    pub commit_stream_publisher: CommitStreamPublisher,
    pub actor_client: ConsensusClient,
    pub leader_heartbeat_interval: Duration,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum AppendCommandError {
    #[error("Not leader; redirect to {leader:?}")]
    LeaderRedirect { leader: NodeId },

    // Retryable with backoff; an election is likely in progress.
    #[error("No known leader")]
    NoLeader,

    #[error("Failed to persist log entry")]
    LocalIoError(#[from] io::Error),

    #[error("Lost leadership before the entry committed")]
    LeadershipLost,

    #[error("Entry was overwritten by a newer leader before committing")]
    Superseded,

    #[error("Consensus engine has exited")]
    EngineExited,
}

/// One cluster member's consensus protocol instance. Never called directly;
/// the `EngineActor` event loop serializes every handler, which is what makes
/// each state-check-then-mutate atomic.
pub struct ConsensusEngine<S: LogStore> {
    logger: slog::Logger,
    my_node_id: NodeId,
    members: HashSet<NodeId>,
    peers: Vec<NodeId>,
    term_state: LocalTermState,
    election: ElectionState,
    log: ConsensusLog<S>,
    transport: Arc<dyn NetworkTransport>,
    // Append callbacks waiting for their entry to commit.
    pending: Vec<PendingCommit>,
}

struct PendingCommit {
    index: LogIndex,
    term: Term,
    callback: oneshot::Sender<Result<EntryKey, AppendCommandError>>,
}

impl<S: LogStore> ConsensusEngine<S> {
    pub fn new(config: EngineConfig<S>) -> Result<Self, io::Error> {
        let my_node_id = config.my_node_id;
        let peers: Vec<NodeId> = config
            .members
            .iter()
            .filter(|m| **m != my_node_id)
            .cloned()
            .collect();

        let election = ElectionState::new_follower(
            ElectionConfig {
                my_node_id: my_node_id.clone(),
                leader_heartbeat_interval: config.leader_heartbeat_interval,
                election_timeout_min: config.election_timeout_min,
                election_timeout_max: config.election_timeout_max,
            },
            config.actor_client,
        );
        let log = ConsensusLog::new(config.logger.clone(), config.log_store, config.commit_stream_publisher)?;

        Ok(ConsensusEngine {
            logger: config.logger,
            my_node_id: my_node_id.clone(),
            members: config.members,
            peers,
            term_state: LocalTermState::new(my_node_id),
            election,
            log,
            transport: config.transport,
            pending: Vec::new(),
        })
    }

    pub(crate) fn handle_append_command(
        &mut self,
        data: Bytes,
        callback: oneshot::Sender<Result<EntryKey, AppendCommandError>>,
    ) {
        match self.election.current_leader() {
            CurrentLeader::Me => { /* carry on */ }
            CurrentLeader::Other(leader) => {
                let _ = callback.send(Err(AppendCommandError::LeaderRedirect { leader }));
                return;
            }
            CurrentLeader::Unknown => {
                let _ = callback.send(Err(AppendCommandError::NoLeader));
                return;
            }
        }

        // Persist locally before acknowledging anything; the durable store
        // flushes before `append` returns.
        let term = self.term_state.current_term();
        let index = match self.log.append(LogEntry { term, data }) {
            Ok(index) => index,
            Err(e) => {
                let _ = callback.send(Err(e.into()));
                return;
            }
        };
        self.pending.push(PendingCommit { index, term, callback });

        // Eagerly replicate instead of waiting out the heartbeat interval.
        let peer_ids: Vec<NodeId> = match self.election.leader_peers_mut() {
            Some(peers) => peers.keys().cloned().collect(),
            None => Vec::new(),
        };
        for peer in peer_ids {
            self.handle_leader_tick(LeaderTick { peer, term });
        }

        // A single-member cluster commits without any peer traffic.
        self.advance_commit_as_leader();
    }

    pub(crate) fn handle_vote_request(&mut self, request: VoteRequest) {
        if !self.members.contains(&request.candidate) {
            slog::info!(
                self.logger,
                "Ignoring vote request from non-member {:?}",
                request.candidate
            );
            return;
        }

        let mut granted = false;
        if request.term >= self.term_state.current_term() {
            // > If RPC request or response contains term T > currentTerm:
            // > set currentTerm = T, convert to follower (§5.1)
            if self.term_state.store_term_if_increased(request.term) {
                self.election.transition_to_follower(None);
                self.fail_all_pending(|| AppendCommandError::LeadershipLost);
                slog::info!(
                    self.logger,
                    "Observed increased term in vote request. Election state: {:?}",
                    self.election,
                );
            }

            // > If votedFor is null or candidateId, and candidate's log is at
            // > least as up-to-date as receiver's log, grant vote (§5.2, §5.4)
            if self.is_candidate_log_up_to_date(request.last_log_term, request.last_log_index) {
                granted = self
                    .term_state
                    .record_vote(request.term, request.candidate.clone());
                if !granted {
                    slog::info!(
                        self.logger,
                        "Not granting vote. Already voted for {:?} this term.",
                        self.term_state.voted_for(),
                    );
                }
            } else {
                slog::info!(self.logger, "Not granting vote. Candidate log is out of date.");
            }
        } else {
            slog::info!(self.logger, "Not granting vote. Candidate term is out of date.");
        }

        if granted {
            slog::info!(
                self.logger,
                "Voting for {:?} in term {:?}",
                request.candidate,
                request.term
            );
        }

        // Rejections still carry our current term so a stale candidate can
        // step down.
        let response = VoteResponse {
            term: self.term_state.current_term(),
            from: self.my_node_id.clone(),
            granted,
        };
        self.send_message(MessageKind::VoteResponse, &request.candidate, &response);
    }

    fn is_candidate_log_up_to_date(
        &self,
        candidate_last_term: Option<Term>,
        candidate_last_index: Option<LogIndex>,
    ) -> bool {
        let candidate_last = match (candidate_last_term, candidate_last_index) {
            (Some(term), Some(index)) => Some((term, index)),
            _ => None,
        };

        // > If the logs have last entries with different terms, then the log
        // > with the later term is more up-to-date. If the logs end with the
        // > same term, then whichever log is longer is more up-to-date.
        match (self.log.latest_entry(), candidate_last) {
            (None, None) => true,
            (None, Some(_)) => true,
            (Some(_), None) => false,
            (Some((my_term, my_index)), Some((candidate_term, candidate_index))) => {
                if candidate_term > my_term {
                    true
                } else if candidate_term < my_term {
                    false
                } else {
                    candidate_index >= my_index
                }
            }
        }
    }

    pub(crate) fn handle_vote_response(&mut self, response: VoteResponse) {
        let current_term = self.term_state.current_term();
        if response.term > current_term {
            self.term_state.store_term_if_increased(response.term);
            self.election.transition_to_follower(None);
            self.fail_all_pending(|| AppendCommandError::LeadershipLost);
            slog::info!(
                self.logger,
                "Observed increased term in vote response. Election state: {:?}",
                self.election,
            );
            return;
        }
        if response.term < current_term {
            slog::debug!(
                self.logger,
                "Ignoring vote response for outdated term {:?}; current term {:?}",
                response.term,
                current_term,
            );
            return;
        }

        if !response.granted {
            slog::info!(
                self.logger,
                "Vote not granted by {:?} for term {:?}",
                response.from,
                response.term
            );
            return;
        }

        let votes = match self.election.add_vote_if_candidate(response.from) {
            Some(votes) => votes,
            None => {
                slog::info!(
                    self.logger,
                    "Received vote for term {:?} after leaving candidate state: {:?}",
                    response.term,
                    self.election,
                );
                return;
            }
        };

        let num_members = self.members.len();
        slog::info!(self.logger, "Received {}/{} votes for term {:?}", votes, num_members, response.term);

        if votes >= Self::majority_count(num_members) {
            let last_log_index = self.log.latest_entry().map(|(_, index)| index);
            let peer_set: HashSet<NodeId> = self.peers.iter().cloned().collect();
            self.election.transition_to_leader(current_term, peer_set, last_log_index);
            slog::info!(self.logger, "Won election for term {:?}", current_term);
        }
    }

    pub(crate) fn handle_follower_timeout(&mut self) {
        // Record the self-vote in term state before transitioning.
        let new_term = self.term_state.increment_term_and_vote_for_self();
        let votes = self.election.transition_to_candidate_and_vote_for_self();
        slog::info!(
            self.logger,
            "No leader contact. Starting election for term {:?}. Election state: {:?}",
            new_term,
            self.election,
        );

        if votes >= Self::majority_count(self.members.len()) {
            // Single-member cluster; the self-vote is a majority.
            let last_log_index = self.log.latest_entry().map(|(_, index)| index);
            self.election.transition_to_leader(new_term, HashSet::new(), last_log_index);
            slog::info!(self.logger, "Won uncontested election for term {:?}", new_term);
            return;
        }

        let (last_log_term, last_log_index) = match self.log.latest_entry() {
            None => (None, None),
            Some((term, index)) => (Some(term), Some(index)),
        };
        let request = VoteRequest {
            term: new_term,
            candidate: self.my_node_id.clone(),
            last_log_index,
            last_log_term,
        };
        for peer in self.peers.clone() {
            self.send_message(MessageKind::VoteRequest, &peer, &request);
        }
    }

    pub(crate) fn handle_replicate_request(&mut self, request: ReplicateRequest) {
        if !self.members.contains(&request.leader) {
            slog::info!(
                self.logger,
                "Ignoring replicate request from non-member {:?}",
                request.leader
            );
            return;
        }

        // > Reply false if term < currentTerm (§5.1)
        let current_term = self.term_state.current_term();
        if request.term < current_term {
            self.respond_replicate(
                &request.leader,
                ReplicateOutcome::StaleTerm {
                    current_term,
                },
            );
            return;
        }

        if self.term_state.store_term_if_increased(request.term) {
            self.election.transition_to_follower(Some(request.leader.clone()));
            self.fail_all_pending(|| AppendCommandError::LeadershipLost);
        } else {
            // Same term: a live leader exists, so a candidacy is over.
            self.election.step_down_if_candidate(&request.leader);
            self.election.set_leader_if_unknown(&request.leader);
        }
        self.election.reset_timeout_if_follower();

        let prev = match (request.prev_log_term, request.prev_log_index) {
            (Some(term), Some(index)) => Some((term, index)),
            (None, None) => None,
            _ => {
                slog::warn!(self.logger, "Malformed replicate request: half a previous entry");
                return;
            }
        };

        // > Reply false if log doesn't contain an entry at prevLogIndex
        // > whose term matches prevLogTerm (§5.3)
        if let Some((prev_term, prev_index)) = prev {
            match self.log.read(prev_index) {
                Ok(Some(entry)) if entry.term == prev_term => {}
                Ok(_) => {
                    self.respond_replicate(&request.leader, ReplicateOutcome::MissingPrevious);
                    return;
                }
                Err(e) => {
                    slog::error!(self.logger, "Log read failure at {:?}: {:?}", prev_index, e);
                    return;
                }
            }
        }

        // > If an existing entry conflicts with a new one (same index but
        // > different terms), delete the existing entry and all that follow
        // > it (§5.3). Append any new entries not already in the log.
        let mut next_index = match prev {
            None => LogIndex::new(0),
            Some((_, prev_index)) => prev_index.plus(1),
        };
        for new_entry in &request.entries {
            let existing = match self.log.read(next_index) {
                Ok(existing) => existing,
                Err(e) => {
                    slog::error!(self.logger, "Log read failure at {:?}: {:?}", next_index, e);
                    return;
                }
            };

            if let Some(existing) = existing {
                if existing.term == new_entry.term {
                    next_index = next_index.plus(1);
                    continue;
                }
                if let Err(e) = self.log.truncate_from(next_index) {
                    slog::error!(self.logger, "Log truncate failure at {:?}: {:?}", next_index, e);
                    return;
                }
            }

            let appended = match self.log.append(LogEntry {
                term: new_entry.term,
                data: Bytes::from(new_entry.data.clone()),
            }) {
                Ok(appended) => appended,
                Err(e) => {
                    slog::error!(self.logger, "Log append failure: {:?}", e);
                    return;
                }
            };
            if appended != next_index {
                slog::error!(
                    self.logger,
                    "Appended entry landed at {:?}, expected {:?}",
                    appended,
                    next_index,
                );
                return;
            }
            next_index = next_index.plus(1);
        }

        // > If leaderCommit > commitIndex, set
        // > commitIndex = min(leaderCommit, index of last new entry) (§5.3)
        if let Some(leader_commit) = request.leader_commit {
            if let Some((_, last_local_index)) = self.log.latest_entry() {
                let new_commit_index = cmp::min(leader_commit, last_local_index);
                if self.log.ratchet_commit_forward(new_commit_index) {
                    self.log.apply_all_committed();
                }
            }
        }

        let replicated_through = match (prev, request.entries.len() as u64) {
            (None, 0) => None,
            (None, n) => Some(LogIndex::new(n - 1)),
            (Some((_, prev_index)), n) => Some(prev_index.plus(n)),
        };
        self.respond_replicate(
            &request.leader,
            ReplicateOutcome::Success { replicated_through },
        );
    }

    fn respond_replicate(&self, leader: &NodeId, outcome: ReplicateOutcome) {
        let response = ReplicateResponse {
            term: self.term_state.current_term(),
            from: self.my_node_id.clone(),
            outcome,
        };
        self.send_message(MessageKind::ReplicateResponse, leader, &response);
    }

    pub(crate) fn handle_replicate_response(&mut self, response: ReplicateResponse) {
        if let ReplicateOutcome::StaleTerm { current_term } = &response.outcome {
            if self.term_state.store_term_if_increased(*current_term) {
                self.election.transition_to_follower(None);
                self.fail_all_pending(|| AppendCommandError::LeadershipLost);
                slog::warn!(
                    self.logger,
                    "Peer {:?} reported newer term {:?}. Stepped down to follower.",
                    response.from,
                    current_term,
                );
            }
            return;
        }

        let current_term = self.term_state.current_term();
        if response.term != current_term {
            slog::debug!(
                self.logger,
                "Ignoring replicate response for term {:?}; current term {:?}",
                response.term,
                current_term,
            );
            return;
        }

        let mut needs_commit_check = false;
        let mut retry_peer: Option<NodeId> = None;
        {
            let peers = match self.election.leader_peers_mut() {
                Some(peers) => peers,
                None => {
                    slog::info!(self.logger, "Replicate response arrived but no longer leader");
                    return;
                }
            };
            let progress = match peers.get_mut(&response.from) {
                Some(progress) => progress,
                None => {
                    slog::warn!(
                        self.logger,
                        "Peer {:?} missing from leader state",
                        response.from
                    );
                    return;
                }
            };

            match &response.outcome {
                ReplicateOutcome::Success { replicated_through } => {
                    progress.record_success(*replicated_through);
                    needs_commit_check = true;

                    // > If last log index >= nextIndex for a follower: send
                    // > AppendEntries RPC with log entries starting at nextIndex
                    let (next, _) = progress.next_and_previous();
                    if let Some((_, last_log_index)) = self.log.latest_entry() {
                        if last_log_index >= next {
                            retry_peer = Some(response.from.clone());
                        }
                    }
                }
                ReplicateOutcome::MissingPrevious => {
                    progress.rewind(&self.logger);
                    retry_peer = Some(response.from.clone());
                }
                ReplicateOutcome::StaleTerm { .. } => { /* handled above */ }
            }
        }

        if needs_commit_check {
            self.advance_commit_as_leader();
        }
        if let Some(peer) = retry_peer {
            self.handle_leader_tick(LeaderTick {
                peer,
                term: current_term,
            });
        }
    }

    pub(crate) fn handle_leader_tick(&mut self, tick: LeaderTick) {
        let current_term = self.term_state.current_term();
        if tick.term != current_term {
            slog::debug!(
                self.logger,
                "Ignoring leader tick for term {:?}; current term {:?}",
                tick.term,
                current_term,
            );
            return;
        }

        let request;
        {
            let peers = match self.election.leader_peers_mut() {
                Some(peers) => peers,
                None => {
                    slog::debug!(self.logger, "Leader tick while not leader");
                    return;
                }
            };
            let progress = match peers.get_mut(&tick.peer) {
                Some(progress) => progress,
                None => {
                    slog::error!(self.logger, "Peer {:?} missing from leader state", tick.peer);
                    return;
                }
            };

            let (next, prev) = progress.next_and_previous();
            let prev_meta = match prev {
                None => None,
                Some(prev_index) => match self.log.read(prev_index) {
                    Ok(Some(entry)) => Some((entry.term, prev_index)),
                    Ok(None) => {
                        slog::error!(
                            self.logger,
                            "Tracked index {:?} for peer {:?} is missing from the log",
                            prev_index,
                            tick.peer,
                        );
                        return;
                    }
                    Err(e) => {
                        slog::error!(self.logger, "Log read failure at {:?}: {:?}", prev_index, e);
                        return;
                    }
                },
            };

            let mut entries = Vec::new();
            let mut read_index = next;
            while entries.len() < MAX_ENTRIES_PER_REQUEST {
                match self.log.read(read_index) {
                    Ok(Some(entry)) => {
                        entries.push(WireLogEntry {
                            term: entry.term,
                            data: entry.data.to_vec(),
                        });
                        read_index = read_index.plus(1);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        slog::error!(self.logger, "Log read failure at {:?}: {:?}", read_index, e);
                        return;
                    }
                }
            }

            progress.reset_heartbeat_timer();
            request = ReplicateRequest {
                term: current_term,
                leader: self.my_node_id.clone(),
                prev_log_index: prev_meta.map(|(_, index)| index),
                prev_log_term: prev_meta.map(|(term, _)| term),
                entries,
                leader_commit: self.log.commit_index(),
            };
        }

        self.send_message(MessageKind::ReplicateRequest, &tick.peer, &request);
    }

    /// > If there exists an N such that N > commitIndex, a majority of
    /// > matchIndex[i] >= N, and log[N].term == currentTerm:
    /// > set commitIndex = N (§5.3, §5.4)
    fn advance_commit_as_leader(&mut self) {
        let matched: Vec<Option<LogIndex>> = match self.election.leader_peers_mut() {
            Some(peers) => peers.values().map(|progress| progress.matched()).collect(),
            None => return,
        };

        let tentative = if matched.is_empty() {
            // No peers: our own log is the majority.
            self.log.latest_entry().map(|(_, index)| index)
        } else {
            Self::cluster_commit_index(matched)
        };
        let tentative = match tentative {
            Some(tentative) => tentative,
            None => return,
        };

        match self
            .log
            .ratchet_commit_if_term_matches(tentative, self.term_state.current_term())
        {
            Ok(true) => {
                self.log.apply_all_committed();
                self.resolve_pending();
            }
            Ok(false) => {}
            Err(e) => {
                slog::warn!(
                    self.logger,
                    "IO failure while confirming commit index {:?}: {:?}",
                    tentative,
                    e,
                );
            }
        }
    }

    /// The highest index replicated on a strict majority of the cluster,
    /// given every peer's matched index. We are always at the tail of the
    /// sorted array because our own log is the same or longest; taking the
    /// len/2'th element from the sorted peer list accounts for our implicit
    /// match. When in doubt, read the unit tests.
    fn cluster_commit_index(mut peers_matched_indexes: Vec<Option<LogIndex>>) -> Option<LogIndex> {
        peers_matched_indexes.sort();

        let quorum_idx = peers_matched_indexes.len() / 2;
        peers_matched_indexes.remove(quorum_idx)
    }

    fn majority_count(num_members: usize) -> usize {
        (num_members / 2) + 1
    }

    fn resolve_pending(&mut self) {
        let commit_index = match self.log.commit_index() {
            Some(commit_index) => commit_index,
            None => return,
        };

        let mut still_waiting = Vec::new();
        for pending in self.pending.drain(..) {
            if pending.index > commit_index {
                still_waiting.push(pending);
                continue;
            }

            // The position committed; confirm the entry is still ours and
            // was not replaced by a newer leader's entry.
            let result = match self.log.read(pending.index) {
                Ok(Some(entry)) if entry.term == pending.term => Ok(EntryKey {
                    term: pending.term,
                    index: pending.index,
                }),
                _ => Err(AppendCommandError::Superseded),
            };
            let _ = pending.callback.send(result);
        }
        self.pending = still_waiting;
    }

    fn fail_all_pending<F: Fn() -> AppendCommandError>(&mut self, make_error: F) {
        for pending in self.pending.drain(..) {
            let _ = pending.callback.send(Err(make_error()));
        }
    }

    fn send_message<T: Serialize>(&self, kind: MessageKind, target: &NodeId, payload: &T) {
        let payload_bytes = match encode_payload(payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                slog::error!(self.logger, "Failed to encode '{}' payload: {:?}", kind, e);
                return;
            }
        };
        let envelope = Envelope::new(kind, self.my_node_id.clone(), target.clone(), payload_bytes);

        let transport = self.transport.clone();
        let logger = self.logger.clone();
        tokio::task::spawn(async move {
            if !transport.send(envelope).await {
                slog::debug!(logger, "Failed to deliver '{}' message", kind);
            }
        });
    }

    pub(crate) fn status(&self) -> ConsensusStatus {
        let leader = match self.election.current_leader() {
            CurrentLeader::Me => Some(self.my_node_id.clone()),
            CurrentLeader::Other(leader) => Some(leader),
            CurrentLeader::Unknown => None,
        };

        ConsensusStatus {
            term: self.term_state.current_term(),
            role: self.election.role_snapshot(),
            leader,
            commit_index: self.log.commit_index(),
            last_applied: self.log.last_applied(),
        }
    }
}

/// Term and vote state for this member. The consensus paper calls for this to
/// be durable; like the log's in-memory twin, this is volatile and a restart
/// rejoins the cluster at term 0, catching up from whatever leader exists.
struct LocalTermState {
    current_term: Term,
    voted_for: Option<NodeId>,
    my_node_id: NodeId,
}

impl LocalTermState {
    fn new(my_node_id: NodeId) -> Self {
        LocalTermState {
            current_term: Term::new(0),
            voted_for: None,
            my_node_id,
        }
    }

    fn current_term(&self) -> Term {
        self.current_term
    }

    fn voted_for(&self) -> Option<&NodeId> {
        self.voted_for.as_ref()
    }

    /// Set current term to `new_term` iff it is larger, clearing the vote.
    /// Returns true if state was mutated.
    fn store_term_if_increased(&mut self, new_term: Term) -> bool {
        if new_term <= self.current_term {
            false
        } else {
            self.current_term = new_term;
            self.voted_for = None;
            true
        }
    }

    /// Record a vote for `candidate` in `term`. Grants iff `term` is the
    /// current term and we are unvoted or already voted for this candidate
    /// (which makes duplicate vote requests idempotent).
    fn record_vote(&mut self, term: Term, candidate: NodeId) -> bool {
        if term != self.current_term {
            return false;
        }
        match &self.voted_for {
            None => {
                self.voted_for = Some(candidate);
                true
            }
            Some(already) => *already == candidate,
        }
    }

    /// Returns the new term. Used when transitioning to candidate.
    fn increment_term_and_vote_for_self(&mut self) -> Term {
        self.current_term.incr();
        self.voted_for = Some(self.my_node_id.clone());

        self.current_term
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::actor::RoleSnapshot;
    use crate::consensus::log::InMemoryLogStore;
    use crate::consensus::{create_commit_stream, CommitStream};
    use crate::transport::{decode_payload, InMemoryHub, HANDLER_CHANNEL_CAPACITY};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    struct TestMember {
        engine: ConsensusEngine<InMemoryLogStore>,
        commit_stream: CommitStream,
        // Keep the actor channel open so timer sends don't error out.
        _actor_rx: mpsc::Receiver<crate::consensus::actor::Event>,
    }

    /// Engine wired to an in-memory hub, with election timers parked far in
    /// the future so tests drive every transition by hand.
    fn test_member(hub: &Arc<InMemoryHub>, me: &str, members: &[&str]) -> TestMember {
        let transport = Arc::new(hub.join(NodeId::new(me)));
        let (actor_client, actor_rx) = ConsensusClient::new(HANDLER_CHANNEL_CAPACITY);
        let (publisher, commit_stream) = create_commit_stream();

        let engine = ConsensusEngine::new(EngineConfig {
            logger: test_logger(),
            my_node_id: NodeId::new(me),
            members: members.iter().map(|m| NodeId::new(*m)).collect(),
            log_store: InMemoryLogStore::new(),
            transport,
            commit_stream_publisher: publisher,
            actor_client,
            leader_heartbeat_interval: Duration::from_secs(3600),
            election_timeout_min: Duration::from_secs(3600),
            election_timeout_max: Duration::from_secs(7200),
        })
        .unwrap();

        TestMember {
            engine,
            commit_stream,
            _actor_rx: actor_rx,
        }
    }

    /// Register a listener for one message kind at a (possibly passive) hub
    /// member.
    fn listen(
        hub: &Arc<InMemoryHub>,
        node: &str,
        kind: MessageKind,
    ) -> mpsc::Receiver<crate::transport::Envelope> {
        let transport = hub.join(NodeId::new(node));
        let (tx, rx) = mpsc::channel(HANDLER_CHANNEL_CAPACITY);
        transport.register_handler(kind, tx);
        rx
    }

    fn wire_entry(term: u64, data: &str) -> WireLogEntry {
        WireLogEntry {
            term: Term::new(term),
            data: data.as_bytes().to_vec(),
        }
    }

    fn replicate_request(
        term: u64,
        leader: &str,
        prev: Option<(u64, u64)>,
        entries: Vec<WireLogEntry>,
        leader_commit: Option<u64>,
    ) -> ReplicateRequest {
        ReplicateRequest {
            term: Term::new(term),
            leader: NodeId::new(leader),
            prev_log_index: prev.map(|(_, i)| LogIndex::new(i)),
            prev_log_term: prev.map(|(t, _)| Term::new(t)),
            entries,
            leader_commit: leader_commit.map(LogIndex::new),
        }
    }

    #[test]
    fn cluster_commit_index_majority_arithmetic() {
        fn opt(v: i64) -> Option<LogIndex> {
            if v < 0 {
                None
            } else {
                Some(LogIndex::new(v as u64))
            }
        }
        fn run(expected: i64, matches: Vec<i64>) {
            let matches = matches.into_iter().map(opt).collect();
            assert_eq!(
                opt(expected),
                ConsensusEngine::<InMemoryLogStore>::cluster_commit_index(matches)
            );
        }

        // 3-member cluster (2 peers)
        run(-1, vec![-1, -1]);
        run(9, vec![-1, 9]);
        run(9, vec![8, 9]);

        // 4-member cluster
        run(-1, vec![-1, -1, -1]);
        run(-1, vec![-1, -1, 9]);
        run(8, vec![-1, 8, 9]);
        run(8, vec![7, 8, 9]);

        // 5-member cluster
        run(-1, vec![-1, -1, -1, -1]);
        run(-1, vec![-1, -1, -1, 9]);
        run(8, vec![-1, -1, 8, 9]);
        run(8, vec![-1, 7, 8, 9]);
        run(8, vec![6, 7, 8, 9]);

        // 7-member cluster
        run(-1, vec![-1, -1, -1, -1, -1, -1]);
        run(-1, vec![-1, -1, -1, -1, 8, 9]);
        run(7, vec![-1, -1, -1, 7, 8, 9]);
        run(7, vec![4, 5, 6, 7, 8, 9]);

        // Ordering doesn't matter
        run(9, vec![9, 8]);
        run(8, vec![7, 9, 8]);
        run(7, vec![9, 8, -1, -1, 7]);
    }

    #[tokio::test]
    async fn grants_vote_once_per_term() {
        let hub = InMemoryHub::new(test_logger());
        let mut member = test_member(&hub, "n1", &["n1", "n2", "n3"]);
        let mut n2_responses = listen(&hub, "n2", MessageKind::VoteResponse);
        let mut n3_responses = listen(&hub, "n3", MessageKind::VoteResponse);

        member.engine.handle_vote_request(VoteRequest {
            term: Term::new(1),
            candidate: NodeId::new("n2"),
            last_log_index: None,
            last_log_term: None,
        });
        let response: VoteResponse =
            decode_payload(&n2_responses.recv().await.unwrap().payload).unwrap();
        assert!(response.granted);
        assert_eq!(response.term, Term::new(1));

        // Same term, different candidate: refused.
        member.engine.handle_vote_request(VoteRequest {
            term: Term::new(1),
            candidate: NodeId::new("n3"),
            last_log_index: None,
            last_log_term: None,
        });
        let response: VoteResponse =
            decode_payload(&n3_responses.recv().await.unwrap().payload).unwrap();
        assert!(!response.granted);

        // Duplicate request from the original candidate: idempotent grant.
        member.engine.handle_vote_request(VoteRequest {
            term: Term::new(1),
            candidate: NodeId::new("n2"),
            last_log_index: None,
            last_log_term: None,
        });
        let response: VoteResponse =
            decode_payload(&n2_responses.recv().await.unwrap().payload).unwrap();
        assert!(response.granted);
    }

    #[tokio::test]
    async fn refuses_vote_for_out_of_date_log() {
        let hub = InMemoryHub::new(test_logger());
        let mut member = test_member(&hub, "n1", &["n1", "n2", "n3"]);
        let mut n2_responses = listen(&hub, "n2", MessageKind::VoteResponse);

        // Give n1 a log entry via replication.
        member.engine.handle_replicate_request(replicate_request(
            1,
            "n3",
            None,
            vec![wire_entry(1, "a")],
            None,
        ));

        // Candidate with an empty log loses to our non-empty log.
        member.engine.handle_vote_request(VoteRequest {
            term: Term::new(2),
            candidate: NodeId::new("n2"),
            last_log_index: None,
            last_log_term: None,
        });
        let response: VoteResponse =
            decode_payload(&n2_responses.recv().await.unwrap().payload).unwrap();
        assert!(!response.granted);
        // The higher term still took effect.
        assert_eq!(member.engine.status().term, Term::new(2));
    }

    #[tokio::test]
    async fn commit_index_is_monotonic_under_duplicated_and_reordered_delivery() {
        let hub = InMemoryHub::new(test_logger());
        let mut member = test_member(&hub, "n1", &["n1", "n2", "n3"]);

        let full = replicate_request(
            1,
            "n2",
            None,
            vec![wire_entry(1, "a"), wire_entry(1, "b"), wire_entry(1, "c")],
            Some(2),
        );
        let stale = replicate_request(1, "n2", None, vec![wire_entry(1, "a")], Some(0));

        member.engine.handle_replicate_request(full.clone());
        assert_eq!(member.engine.status().commit_index, Some(LogIndex::new(2)));

        // Older request delivered late, then the full one duplicated.
        member.engine.handle_replicate_request(stale);
        assert_eq!(member.engine.status().commit_index, Some(LogIndex::new(2)));
        member.engine.handle_replicate_request(full);
        assert_eq!(member.engine.status().commit_index, Some(LogIndex::new(2)));
    }

    #[tokio::test]
    async fn conflicting_suffix_is_truncated() {
        let hub = InMemoryHub::new(test_logger());
        let mut member = test_member(&hub, "n1", &["n1", "n2", "n3"]);

        member.engine.handle_replicate_request(replicate_request(
            1,
            "n2",
            None,
            vec![wire_entry(1, "a"), wire_entry(1, "b")],
            None,
        ));

        // A newer leader overwrites index 1 onward.
        member.engine.handle_replicate_request(replicate_request(
            2,
            "n3",
            Some((1, 0)),
            vec![wire_entry(2, "B"), wire_entry(2, "C")],
            Some(2),
        ));

        let status = member.engine.status();
        assert_eq!(status.term, Term::new(2));
        assert_eq!(status.commit_index, Some(LogIndex::new(2)));

        // Committed data observed through the stream reflects the new suffix.
        let first = member.commit_stream.next().await.unwrap();
        assert_eq!(first.data, Bytes::from_static(b"a"));
        let second = member.commit_stream.next().await.unwrap();
        assert_eq!(second.data, Bytes::from_static(b"B"));
        let third = member.commit_stream.next().await.unwrap();
        assert_eq!(third.data, Bytes::from_static(b"C"));
    }

    #[tokio::test]
    async fn missing_previous_entry_is_rejected() {
        let hub = InMemoryHub::new(test_logger());
        let mut member = test_member(&hub, "n1", &["n1", "n2", "n3"]);
        let mut leader_rx = listen(&hub, "n2", MessageKind::ReplicateResponse);

        member.engine.handle_replicate_request(replicate_request(
            1,
            "n2",
            Some((1, 4)),
            vec![wire_entry(1, "z")],
            None,
        ));

        let response: ReplicateResponse =
            decode_payload(&leader_rx.recv().await.unwrap().payload).unwrap();
        assert!(matches!(response.outcome, ReplicateOutcome::MissingPrevious));
    }

    #[tokio::test]
    async fn append_command_requires_leadership() {
        let hub = InMemoryHub::new(test_logger());
        let mut member = test_member(&hub, "n1", &["n1", "n2", "n3"]);

        let (tx, rx) = oneshot::channel();
        member
            .engine
            .handle_append_command(Bytes::from_static(b"cmd"), tx);
        assert!(matches!(rx.await.unwrap(), Err(AppendCommandError::NoLeader)));

        // After learning of a leader, the error carries redirect info.
        member
            .engine
            .handle_replicate_request(replicate_request(1, "n2", None, vec![], None));
        let (tx, rx) = oneshot::channel();
        member
            .engine
            .handle_append_command(Bytes::from_static(b"cmd"), tx);
        match rx.await.unwrap() {
            Err(AppendCommandError::LeaderRedirect { leader }) => {
                assert_eq!(leader, NodeId::new("n2"))
            }
            other => panic!("Expected redirect, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn election_and_commit_full_cycle() {
        let hub = InMemoryHub::new(test_logger());
        let mut member = test_member(&hub, "n1", &["n1", "n2", "n3"]);
        let mut n2_requests = listen(&hub, "n2", MessageKind::ReplicateRequest);

        // Election: timeout makes us candidate; one granted vote is a
        // majority of 3 with our self-vote.
        member.engine.handle_follower_timeout();
        assert_eq!(member.engine.status().role, RoleSnapshot::Candidate);

        member.engine.handle_vote_response(VoteResponse {
            term: Term::new(1),
            from: NodeId::new("n2"),
            granted: true,
        });
        let status = member.engine.status();
        assert_eq!(status.role, RoleSnapshot::Leader);
        assert_eq!(status.leader, Some(NodeId::new("n1")));

        // Append a command; it replicates to peers eagerly.
        let (tx, rx) = oneshot::channel();
        member
            .engine
            .handle_append_command(Bytes::from_static(b"cmd"), tx);

        let request: ReplicateRequest =
            decode_payload(&n2_requests.recv().await.unwrap().payload).unwrap();
        assert_eq!(request.term, Term::new(1));
        assert_eq!(request.entries.len(), 1);

        // One follower confirming gives a majority; the entry commits and
        // the append callback resolves.
        member.engine.handle_replicate_response(ReplicateResponse {
            term: Term::new(1),
            from: NodeId::new("n2"),
            outcome: ReplicateOutcome::Success {
                replicated_through: Some(LogIndex::new(0)),
            },
        });

        let key = rx.await.unwrap().unwrap();
        assert_eq!(key.index, LogIndex::new(0));
        assert_eq!(member.engine.status().commit_index, Some(LogIndex::new(0)));

        let committed = member.commit_stream.next().await.unwrap();
        assert_eq!(committed.data, Bytes::from_static(b"cmd"));
    }

    #[tokio::test]
    async fn stale_leader_steps_down_on_newer_term_response() {
        let hub = InMemoryHub::new(test_logger());
        let mut member = test_member(&hub, "n1", &["n1", "n2", "n3"]);

        member.engine.handle_follower_timeout();
        member.engine.handle_vote_response(VoteResponse {
            term: Term::new(1),
            from: NodeId::new("n2"),
            granted: true,
        });
        assert_eq!(member.engine.status().role, RoleSnapshot::Leader);

        // An uncommitted append is in flight when leadership is lost.
        let (tx, rx) = oneshot::channel();
        member
            .engine
            .handle_append_command(Bytes::from_static(b"cmd"), tx);

        member.engine.handle_replicate_response(ReplicateResponse {
            term: Term::new(1),
            from: NodeId::new("n3"),
            outcome: ReplicateOutcome::StaleTerm {
                current_term: Term::new(5),
            },
        });

        let status = member.engine.status();
        assert_eq!(status.role, RoleSnapshot::Follower);
        assert_eq!(status.term, Term::new(5));
        assert!(matches!(
            rx.await.unwrap(),
            Err(AppendCommandError::LeadershipLost)
        ));
    }

    #[tokio::test]
    async fn candidate_steps_down_for_same_term_leader() {
        let hub = InMemoryHub::new(test_logger());
        let mut member = test_member(&hub, "n1", &["n1", "n2", "n3"]);

        member.engine.handle_follower_timeout();
        assert_eq!(member.engine.status().role, RoleSnapshot::Candidate);

        // A leader already won this term.
        member
            .engine
            .handle_replicate_request(replicate_request(1, "n2", None, vec![], None));

        let status = member.engine.status();
        assert_eq!(status.role, RoleSnapshot::Follower);
        assert_eq!(status.leader, Some(NodeId::new("n2")));
    }
}
