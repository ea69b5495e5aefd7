use crate::cluster::{NodeId, ResourceMetrics};
use crate::consensus::{
    create_commit_stream, spawn_message_pump, ConsensusClient, ConsensusEngine, EngineActor,
    EngineConfig, FileLogStore, InMemoryLogStore, LogStore,
};
use crate::coordinator::{CleanupLoopHandle, ClusterCoordinator};
use crate::health::{
    Alert, HealthMonitor, HealthMonitorConfig, HealthReport, MonitorLoopHandle,
};
use crate::manager::{
    ClusterCommand, CommandReplicator, DistributionManager, DistributionManagerConfig,
    NodeJoinMsg, NodeLeaveMsg, PartitionAssignMsg, PartitionSyncMsg, PartitionTransferMsg,
    StateUpdateMsg,
};
use crate::options::{Options, OptionsValidated};
use crate::recovery::{BackupLoopHandle, RecoveryManager, RecoveryRequestMsg, RecoveryResponseMsg};
use crate::replication::{
    InMemoryPartitionStore, PartitionStore, ReplicateAckMsg, ReplicatePush, ReplicationManager,
    SyncStatus,
};
use crate::transport::{
    decode_payload, encode_payload, shutdown_signal, Envelope, GrpcTransport, HandlerTable,
    InMemoryHub, MessageKind, NetworkTransport, RpcServer, RpcServerShutdownHandle,
    HANDLER_CHANNEL_CAPACITY,
};
use chrono::Duration as ChronoDuration;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Static cluster membership entry for the gRPC transport.
#[derive(Clone)]
pub struct MemberInfo {
    pub node_id: String,
    pub addr: SocketAddr,
}

pub struct MemberConfig {
    pub my_node_id: String,
    /// All coordination-core members, this one included.
    pub members: Vec<String>,
    pub backup_directory: PathBuf,
    /// Durable consensus log location; None keeps the log in memory (tests,
    /// throwaway members).
    pub consensus_log_directory: Option<PathBuf>,
    pub logger: slog::Logger,
    pub options: Options,
}

#[derive(Debug, thiserror::Error)]
pub enum StartMemberError {
    #[error("Illegal options for configuring member: {0}")]
    IllegalOptions(String),

    #[error("Consensus log initialization failure")]
    LogInitialization(#[from] io::Error),

    #[error("My node id must appear in the member list")]
    MeNotInCluster,
}

/// One running coordination-core member: the collaborator API handle plus
/// every background loop it owns. Dropping the member stops its loops.
pub struct Member {
    pub node_id: NodeId,
    pub distribution: Arc<DistributionManager>,
    pub consensus: ConsensusClient,
    _health_loop: MonitorLoopHandle,
    _backup_loop: BackupLoopHandle,
    _cleanup_loop: CleanupLoopHandle,
    _rpc_shutdown: Option<RpcServerShutdownHandle>,
}

/// Start a member wired to an in-process hub. The transport seam is the only
/// difference from `start_grpc_member`.
pub fn start_in_memory_member(
    hub: &Arc<InMemoryHub>,
    config: MemberConfig,
) -> Result<Member, StartMemberError> {
    let node_id = NodeId::new(config.my_node_id.clone());
    let transport: Arc<dyn NetworkTransport> = Arc::new(hub.join(node_id));
    build_member(transport, None, config)
}

/// Start a member serving and dialing peers over gRPC.
pub fn start_grpc_member(
    config: MemberConfig,
    listen_addr: SocketAddr,
    peers: Vec<MemberInfo>,
) -> Result<Member, StartMemberError> {
    let node_id = NodeId::new(config.my_node_id.clone());
    let table = Arc::new(HandlerTable::new(
        config.logger.new(slog::o!("Node" => config.my_node_id.clone())),
    ));

    let peer_addrs: HashMap<NodeId, SocketAddr> = peers
        .into_iter()
        .map(|info| (NodeId::new(info.node_id), info.addr))
        .collect();
    let transport: Arc<dyn NetworkTransport> = Arc::new(GrpcTransport::new(
        config.logger.clone(),
        node_id.clone(),
        peer_addrs,
        table.clone(),
    ));

    let (rpc_shutdown_handle, rpc_shutdown_signal) = shutdown_signal();
    let rpc_server = RpcServer::new(config.logger.clone(), node_id, table);
    tokio::spawn(rpc_server.run(listen_addr, rpc_shutdown_signal));

    build_member(transport, Some(rpc_shutdown_handle), config)
}

fn build_member(
    transport: Arc<dyn NetworkTransport>,
    rpc_shutdown: Option<RpcServerShutdownHandle>,
    config: MemberConfig,
) -> Result<Member, StartMemberError> {
    let logger = config.logger;
    let node_id = NodeId::new(config.my_node_id.clone());
    let options = OptionsValidated::try_from(config.options)
        .map_err(|e| StartMemberError::IllegalOptions(e.to_string()))?;

    let member_ids: Vec<NodeId> = config.members.iter().map(|m| NodeId::new(m.as_str())).collect();
    if !member_ids.contains(&node_id) {
        return Err(StartMemberError::MeNotInCluster);
    }

    // Consensus: actor, engine, inbound pump.
    let (consensus_client, actor_rx) = ConsensusClient::new(HANDLER_CHANNEL_CAPACITY);
    let (commit_publisher, commit_stream) = create_commit_stream();

    match &config.consensus_log_directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let store = FileLogStore::open(dir.join(format!("{}.commitlog", config.my_node_id)))?;
            slog::info!(logger, "Starting consensus with durable log store");
            spawn_engine(
                store,
                &logger,
                &node_id,
                &member_ids,
                &transport,
                commit_publisher,
                consensus_client.clone(),
                actor_rx,
                &options,
            )?;
        }
        None => {
            slog::info!(logger, "Starting consensus with in-memory log store");
            spawn_engine(
                InMemoryLogStore::new(),
                &logger,
                &node_id,
                &member_ids,
                &transport,
                commit_publisher,
                consensus_client.clone(),
                actor_rx,
                &options,
            )?;
        }
    }

    let (consensus_tx, consensus_rx) = mpsc::channel(HANDLER_CHANNEL_CAPACITY);
    for kind in [
        MessageKind::VoteRequest,
        MessageKind::VoteResponse,
        MessageKind::ReplicateRequest,
        MessageKind::ReplicateResponse,
    ]
    .iter()
    {
        transport.register_handler(*kind, consensus_tx.clone());
    }
    spawn_message_pump(logger.clone(), consensus_rx, consensus_client.clone());

    // Component stack.
    let store = Arc::new(InMemoryPartitionStore::new());
    let coordinator = Arc::new(ClusterCoordinator::new(logger.clone()));
    let replication = Arc::new(ReplicationManager::new(logger.clone(), store));
    let recovery = Arc::new(RecoveryManager::new(
        logger.clone(),
        config.backup_directory,
        replication.store().clone(),
        ChronoDuration::days(options.backup_retention_days),
    ));
    let health = Arc::new(HealthMonitor::new(logger.clone(), HealthMonitorConfig::default()));

    let distribution = Arc::new(DistributionManager::new(DistributionManagerConfig {
        logger: logger.clone(),
        coordinator: coordinator.clone(),
        replication: replication.clone(),
        recovery: recovery.clone(),
        health: health.clone(),
        transport: Some(transport.clone()),
        replicator: Some(CommandReplicator::new(logger.clone(), consensus_client.clone())),
        default_replication_factor: options.default_replication_factor,
    }));

    crate::manager::spawn_command_applier(logger.clone(), commit_stream, distribution.clone());

    // Cluster message pump for everything that is not consensus traffic.
    let (cluster_tx, cluster_rx) = mpsc::channel(HANDLER_CHANNEL_CAPACITY);
    for kind in [
        MessageKind::NodeJoin,
        MessageKind::NodeLeave,
        MessageKind::StateUpdate,
        MessageKind::PartitionAssign,
        MessageKind::PartitionTransfer,
        MessageKind::PartitionSync,
        MessageKind::HealthCheck,
        MessageKind::HealthReport,
        MessageKind::Alert,
        MessageKind::RecoveryRequest,
        MessageKind::RecoveryResponse,
        MessageKind::Replicate,
        MessageKind::ReplicateAck,
    ]
    .iter()
    {
        transport.register_handler(*kind, cluster_tx.clone());
    }
    spawn_cluster_message_pump(
        logger.clone(),
        cluster_rx,
        distribution.clone(),
        transport.clone(),
    );

    // Background loops.
    let (alert_tx, alert_rx) = mpsc::channel(HANDLER_CHANNEL_CAPACITY);
    let health_loop = health.spawn_check_loop(options.health_check_interval, alert_tx);
    spawn_alert_publisher(logger.clone(), alert_rx, transport.clone(), member_ids.clone());

    let backup_owner = distribution.clone();
    let backup_node = node_id.clone();
    let backup_loop = recovery.spawn_backup_loop(options.backup_interval, node_id.clone(), move || {
        backup_owner.owned_partitions(&backup_node)
    });

    let cleanup_loop = coordinator.spawn_cleanup_loop(options.coordinator_cleanup_interval);

    Ok(Member {
        node_id,
        distribution,
        consensus: consensus_client,
        _health_loop: health_loop,
        _backup_loop: backup_loop,
        _cleanup_loop: cleanup_loop,
        _rpc_shutdown: rpc_shutdown,
    })
}

fn spawn_engine<S: LogStore>(
    store: S,
    logger: &slog::Logger,
    node_id: &NodeId,
    member_ids: &[NodeId],
    transport: &Arc<dyn NetworkTransport>,
    commit_publisher: crate::consensus::CommitStreamPublisher,
    consensus_client: ConsensusClient,
    actor_rx: mpsc::Receiver<crate::consensus::Event>,
    options: &OptionsValidated,
) -> Result<(), io::Error> {
    let engine = ConsensusEngine::new(EngineConfig {
        logger: logger.clone(),
        my_node_id: node_id.clone(),
        members: member_ids.iter().cloned().collect(),
        log_store: store,
        transport: transport.clone(),
        commit_stream_publisher: commit_publisher,
        actor_client: consensus_client,
        leader_heartbeat_interval: options.leader_heartbeat_interval,
        election_timeout_min: options.election_timeout_min,
        election_timeout_max: options.election_timeout_max,
    })?;

    let actor = EngineActor::new(actor_rx, engine);
    tokio::spawn(actor.run_event_loop());
    Ok(())
}

fn spawn_alert_publisher(
    logger: slog::Logger,
    mut alerts: mpsc::Receiver<Alert>,
    transport: Arc<dyn NetworkTransport>,
    members: Vec<NodeId>,
) {
    tokio::spawn(async move {
        while let Some(alert) = alerts.recv().await {
            let payload = match encode_payload(&alert) {
                Ok(payload) => payload,
                Err(e) => {
                    slog::error!(logger, "Failed to encode alert: {:?}", e);
                    continue;
                }
            };
            let targets: Vec<NodeId> = members
                .iter()
                .filter(|m| *m != transport.local_node_id())
                .cloned()
                .collect();
            transport.broadcast(MessageKind::Alert, payload, &targets).await;
        }
    });
}

/// Inbound non-consensus traffic: membership, partition management, health,
/// recovery, and data-replication bookkeeping. Handler failures are logged
/// and never crash the pump.
fn spawn_cluster_message_pump(
    logger: slog::Logger,
    mut receiver: mpsc::Receiver<Envelope>,
    distribution: Arc<DistributionManager>,
    transport: Arc<dyn NetworkTransport>,
) {
    tokio::spawn(async move {
        while let Some(envelope) = receiver.recv().await {
            handle_cluster_message(&logger, &distribution, &transport, envelope).await;
        }
    });
}

async fn handle_cluster_message(
    logger: &slog::Logger,
    distribution: &Arc<DistributionManager>,
    transport: &Arc<dyn NetworkTransport>,
    envelope: Envelope,
) {
    match envelope.kind {
        MessageKind::NodeJoin => {
            if let Ok(msg) = log_decode::<NodeJoinMsg>(logger, &envelope) {
                distribution.apply_command(ClusterCommand::RegisterNode {
                    descriptor: msg.descriptor,
                });
            }
        }
        MessageKind::NodeLeave => {
            if let Ok(msg) = log_decode::<NodeLeaveMsg>(logger, &envelope) {
                distribution.apply_command(ClusterCommand::DeregisterNode { node: msg.node });
            }
        }
        MessageKind::StateUpdate => {
            if let Ok(msg) = log_decode::<StateUpdateMsg>(logger, &envelope) {
                let local_version = distribution.coordinator().version();
                if msg.version > local_version {
                    slog::debug!(
                        logger,
                        "Peer {:?} reports state v{}, local is v{}",
                        envelope.source,
                        msg.version,
                        local_version,
                    );
                }
            }
        }
        MessageKind::PartitionAssign => {
            if let Ok(msg) = log_decode::<PartitionAssignMsg>(logger, &envelope) {
                distribution.apply_command(ClusterCommand::AssignPartition {
                    partition: msg.partition,
                    nodes: msg.nodes,
                });
            }
        }
        MessageKind::PartitionTransfer => {
            if let Ok(msg) = log_decode::<PartitionTransferMsg>(logger, &envelope) {
                distribution.apply_command(ClusterCommand::MovePartition {
                    partition: msg.partition,
                    source: msg.source,
                    target: msg.target,
                });
            }
        }
        MessageKind::PartitionSync => {
            if let Ok(msg) = log_decode::<PartitionSyncMsg>(logger, &envelope) {
                match msg.status {
                    SyncStatus::Synced => distribution.replication().mark_synced(&msg.partition, &msg.node),
                    SyncStatus::Failed => distribution.replication().mark_failed(&msg.partition, &msg.node),
                    SyncStatus::Syncing => {}
                }
            }
        }
        MessageKind::HealthCheck => {
            // Liveness probe: answer with our latest self-view.
            let local = transport.local_node_id().clone();
            let metrics = distribution
                .health()
                .get_node_health(&local)
                .map(|health| health.metrics)
                .unwrap_or_else(ResourceMetrics::default);
            let report = HealthReport { node: local.clone(), metrics };
            if let Ok(payload) = encode_payload(&report) {
                let reply = Envelope::new(MessageKind::HealthReport, local, envelope.source.clone(), payload);
                transport.send(reply).await;
            }
        }
        MessageKind::HealthReport => {
            if let Ok(msg) = log_decode::<HealthReport>(logger, &envelope) {
                distribution.update_node_metrics(&msg.node, msg.metrics);
            }
        }
        MessageKind::Alert => {
            if let Ok(alert) = log_decode::<Alert>(logger, &envelope) {
                slog::warn!(
                    logger,
                    "Peer alert [{:?}] for node {:?}: {}",
                    alert.severity,
                    alert.node,
                    alert.message,
                );
            }
        }
        MessageKind::RecoveryRequest => {
            if let Ok(msg) = log_decode::<RecoveryRequestMsg>(logger, &envelope) {
                let local = transport.local_node_id().clone();
                let holds = distribution
                    .replication()
                    .store()
                    .partition_len(&local, &msg.partition)
                    .map(|len| len.is_some())
                    .unwrap_or(false);
                let response = RecoveryResponseMsg {
                    partition: msg.partition,
                    restored_onto: local.clone(),
                    success: holds,
                };
                if let Ok(payload) = encode_payload(&response) {
                    let reply =
                        Envelope::new(MessageKind::RecoveryResponse, local, envelope.source.clone(), payload);
                    transport.send(reply).await;
                }
            }
        }
        MessageKind::RecoveryResponse => {
            if let Ok(msg) = log_decode::<RecoveryResponseMsg>(logger, &envelope) {
                if msg.success {
                    distribution
                        .replication()
                        .mark_synced(&msg.partition, &msg.restored_onto);
                }
            }
        }
        MessageKind::Replicate => {
            // Primary pushed a sync round; acknowledge as caught up.
            if let Ok(msg) = log_decode::<ReplicatePush>(logger, &envelope) {
                let local = transport.local_node_id().clone();
                let ack = ReplicateAckMsg {
                    partition: msg.partition,
                    node: local.clone(),
                    version: msg.version,
                };
                if let Ok(payload) = encode_payload(&ack) {
                    let reply =
                        Envelope::new(MessageKind::ReplicateAck, local, envelope.source.clone(), payload);
                    transport.send(reply).await;
                }
            }
        }
        MessageKind::ReplicateAck => {
            if let Ok(msg) = log_decode::<ReplicateAckMsg>(logger, &envelope) {
                distribution.replication().mark_synced(&msg.partition, &msg.node);
            }
        }
        MessageKind::VoteRequest
        | MessageKind::VoteResponse
        | MessageKind::ReplicateRequest
        | MessageKind::ReplicateResponse => {
            // Consensus traffic has its own pump.
            slog::warn!(logger, "Consensus message '{}' on the cluster pump", envelope.kind);
        }
    }
}

fn log_decode<T: serde::de::DeserializeOwned>(
    logger: &slog::Logger,
    envelope: &Envelope,
) -> Result<T, ()> {
    decode_payload::<T>(&envelope.payload).map_err(|e| {
        slog::warn!(
            logger,
            "Malformed '{}' payload from {:?}: {:?}",
            envelope.kind,
            envelope.source,
            e,
        );
    })
}
