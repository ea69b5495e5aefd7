use crate::cluster::NodeId;
use crate::consensus::engine::{AppendCommandError, ConsensusEngine};
use crate::consensus::log::{LogIndex, LogStore, Term};
use crate::consensus::messages::{ReplicateRequest, ReplicateResponse, VoteRequest, VoteResponse};
use crate::consensus::EntryKey;
use crate::transport::{decode_payload, Envelope, MessageKind};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

/// Everything the consensus engine reacts to. All state transitions flow
/// through one event loop, so state-check-then-mutate is naturally atomic.
#[derive(Debug)]
pub enum Event {
    // Leader: persist locally, replicate, resolve the callback on commit.
    // Candidate/Follower: reject with redirect info.
    AppendCommand(Bytes, oneshot::Sender<Result<EntryKey, AppendCommandError>>),

    // Any role: maybe grant a vote; send a vote_response envelope back.
    VoteRequest(VoteRequest),

    // Candidate: count the vote, maybe become leader.
    // Other roles: discard (stale).
    VoteResponse(VoteResponse),

    // Follower: append/truncate per the leader's view, advance commit.
    // Candidate/Leader: step down first if the term justifies it.
    ReplicateRequest(ReplicateRequest),

    // Leader: advance per-peer progress and maybe the commit index.
    // Other roles: discard.
    ReplicateResponse(ReplicateResponse),

    // Follower/Candidate: start a new election.
    FollowerTimeout,

    // Leader: send the owed heartbeat/entries to one peer.
    LeaderTick(LeaderTick),

    GetStatus(oneshot::Sender<ConsensusStatus>),
}

#[derive(Clone, Debug)]
pub struct LeaderTick {
    pub peer: NodeId,
    pub term: Term,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RoleSnapshot {
    Follower,
    Candidate,
    Leader,
}

/// Point-in-time view of one member's consensus state.
#[derive(Clone, Debug)]
pub struct ConsensusStatus {
    pub term: Term,
    pub role: RoleSnapshot,
    pub leader: Option<NodeId>,
    pub commit_index: Option<LogIndex>,
    pub last_applied: Option<LogIndex>,
}

/// Cloneable client for talking to the engine's event loop.
#[derive(Clone)]
pub struct ConsensusClient {
    sender: mpsc::Sender<Event>,
}

impl ConsensusClient {
    pub(crate) fn new(buffer_size: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer_size);
        (ConsensusClient { sender: tx }, rx)
    }

    /// Append a command to the replicated log. Resolves once the entry is
    /// committed (majority replicated), not merely enqueued.
    pub async fn append_command(&self, data: Bytes) -> Result<EntryKey, AppendCommandError> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::AppendCommand(data, tx)).await;

        rx.await.unwrap_or(Err(AppendCommandError::EngineExited))
    }

    /// None if the engine has stopped.
    pub async fn status(&self) -> Option<ConsensusStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::GetStatus(tx)).await;

        rx.await.ok()
    }

    pub(crate) async fn vote_request(&self, request: VoteRequest) {
        self.send(Event::VoteRequest(request)).await;
    }

    pub(crate) async fn vote_response(&self, response: VoteResponse) {
        self.send(Event::VoteResponse(response)).await;
    }

    pub(crate) async fn replicate_request(&self, request: ReplicateRequest) {
        self.send(Event::ReplicateRequest(request)).await;
    }

    pub(crate) async fn replicate_response(&self, response: ReplicateResponse) {
        self.send(Event::ReplicateResponse(response)).await;
    }

    pub(crate) async fn follower_timeout(&self) {
        self.send(Event::FollowerTimeout).await;
    }

    pub(crate) async fn leader_tick(&self, tick: LeaderTick) {
        self.send(Event::LeaderTick(tick)).await;
    }

    async fn send(&self, event: Event) {
        // A closed channel means the engine stopped; callers observe that
        // through their own callbacks (or not at all, for notifications).
        let _ = self.sender.send(event).await;
    }
}

/// EngineActor owns the engine and serializes every event against it.
pub struct EngineActor<S: LogStore> {
    receiver: mpsc::Receiver<Event>,
    engine: ConsensusEngine<S>,
}

impl<S: LogStore> EngineActor<S> {
    pub fn new(receiver: mpsc::Receiver<Event>, engine: ConsensusEngine<S>) -> Self {
        EngineActor { receiver, engine }
    }

    pub async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            self.handle_event(event);
        }
    }

    // Must NOT be async. Long running work is spawned onto other tasks and
    // comes back as another event.
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::AppendCommand(data, callback) => {
                self.engine.handle_append_command(data, callback);
            }
            Event::VoteRequest(request) => {
                self.engine.handle_vote_request(request);
            }
            Event::VoteResponse(response) => {
                self.engine.handle_vote_response(response);
            }
            Event::ReplicateRequest(request) => {
                self.engine.handle_replicate_request(request);
            }
            Event::ReplicateResponse(response) => {
                self.engine.handle_replicate_response(response);
            }
            Event::FollowerTimeout => {
                self.engine.handle_follower_timeout();
            }
            Event::LeaderTick(tick) => {
                self.engine.handle_leader_tick(tick);
            }
            Event::GetStatus(callback) => {
                let _ = callback.send(self.engine.status());
            }
        }
    }
}

/// Pump inbound consensus envelopes from a transport handler channel into
/// the engine's event loop. Malformed payloads are logged and dropped; the
/// sender will retry or time out.
pub fn spawn_message_pump(
    logger: slog::Logger,
    mut receiver: mpsc::Receiver<Envelope>,
    client: ConsensusClient,
) {
    tokio::task::spawn(async move {
        while let Some(envelope) = receiver.recv().await {
            match envelope.kind {
                MessageKind::VoteRequest => match decode_payload::<VoteRequest>(&envelope.payload) {
                    Ok(request) => client.vote_request(request).await,
                    Err(e) => slog::warn!(logger, "Malformed vote_request payload: {:?}", e),
                },
                MessageKind::VoteResponse => match decode_payload::<VoteResponse>(&envelope.payload) {
                    Ok(response) => client.vote_response(response).await,
                    Err(e) => slog::warn!(logger, "Malformed vote_response payload: {:?}", e),
                },
                MessageKind::ReplicateRequest => {
                    match decode_payload::<ReplicateRequest>(&envelope.payload) {
                        Ok(request) => client.replicate_request(request).await,
                        Err(e) => slog::warn!(logger, "Malformed replicate_request payload: {:?}", e),
                    }
                }
                MessageKind::ReplicateResponse => {
                    match decode_payload::<ReplicateResponse>(&envelope.payload) {
                        Ok(response) => client.replicate_response(response).await,
                        Err(e) => slog::warn!(logger, "Malformed replicate_response payload: {:?}", e),
                    }
                }
                other => {
                    slog::warn!(logger, "Consensus pump received unrelated kind '{}'", other);
                }
            }
        }
    });
}
