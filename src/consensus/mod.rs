mod actor;
mod commit_stream;
mod election;
mod engine;
mod log;
mod messages;
mod timer;

pub use actor::spawn_message_pump;
pub use actor::ConsensusClient;
pub use actor::Event;
pub use actor::ConsensusStatus;
pub use actor::EngineActor;
pub use actor::RoleSnapshot;
pub use commit_stream::create_commit_stream;
pub use commit_stream::CommitStream;
pub use commit_stream::CommittedEntry;
pub use commit_stream::EntryKey;
pub use engine::AppendCommandError;
pub use engine::ConsensusEngine;
pub use engine::EngineConfig;
pub use log::FileLogStore;
pub use log::InMemoryLogStore;
pub use log::LogEntry;
pub use log::LogIndex;
pub use log::LogStore;
pub use log::Term;
pub use messages::ReplicateOutcome;
pub use messages::ReplicateRequest;
pub use messages::ReplicateResponse;
pub use messages::VoteRequest;
pub use messages::VoteResponse;
pub use messages::WireLogEntry;

pub use commit_stream::CommitStreamPublisher;
