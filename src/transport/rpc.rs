use crate::cluster::NodeId;
use crate::grpc::grpc_cluster_client::GrpcClusterClient;
use crate::grpc::grpc_cluster_server::{GrpcCluster, GrpcClusterServer};
use crate::grpc::{
    ProtoEnvelope, ProtoExchangeAck, ProtoHealthCheckReply, ProtoHealthCheckReq, ProtoMessageKind,
};
use crate::transport::{Envelope, HandlerTable, MessageKind, NetworkTransport};
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, Mutex};
use tonic::transport::{Channel, Endpoint, Server};
use tonic::{Request, Response, Status};

pub fn shutdown_signal() -> (RpcServerShutdownHandle, RpcServerShutdownSignal) {
    let (tx, rx) = oneshot::channel();

    (RpcServerShutdownHandle { _tx: tx }, RpcServerShutdownSignal { rx })
}

pub struct RpcServerShutdownHandle {
    _tx: oneshot::Sender<()>,
}

pub struct RpcServerShutdownSignal {
    rx: oneshot::Receiver<()>,
}

impl Future for RpcServerShutdownSignal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let rx = Pin::new(&mut self.rx);

        match rx.poll(cx) {
            Poll::Pending => Poll::Pending,
            // We don't care if oneshot Sender sent value or dropped
            Poll::Ready(_) => Poll::Ready(()),
        }
    }
}

/// RpcServer accepts envelopes from peers over gRPC and feeds the local
/// dispatch table. `Health` answers process liveness only.
pub struct RpcServer {
    logger: slog::Logger,
    local: NodeId,
    table: Arc<HandlerTable>,
}

impl RpcServer {
    pub fn new(logger: slog::Logger, local: NodeId, table: Arc<HandlerTable>) -> Self {
        RpcServer { logger, local, table }
    }

    pub async fn run(self, socket_addr: SocketAddr, shutdown_signal: RpcServerShutdownSignal) {
        let logger = self.logger.clone();
        slog::info!(logger, "Listening on '{:?}'", socket_addr);

        let result = Server::builder()
            .add_service(GrpcClusterServer::new(self))
            .serve_with_shutdown(socket_addr, shutdown_signal)
            .await;

        slog::info!(logger, "Server run() has exited: {:?}", result);
    }
}

#[async_trait::async_trait]
impl GrpcCluster for RpcServer {
    async fn exchange(
        &self,
        rpc_request_wrapped: Request<ProtoEnvelope>,
    ) -> Result<Response<ProtoExchangeAck>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);

        let envelope = convert_envelope_from_proto(rpc_request)?;
        let accepted = self.table.dispatch(envelope);

        Ok(Response::new(ProtoExchangeAck { accepted }))
    }

    async fn health(
        &self,
        _rpc_request: Request<ProtoHealthCheckReq>,
    ) -> Result<Response<ProtoHealthCheckReply>, Status> {
        Ok(Response::new(ProtoHealthCheckReply {
            status: "ok".to_string(),
            node_id: self.local.as_str().to_string(),
            timestamp_ms: Utc::now().timestamp_millis(),
        }))
    }
}

/// Per-member gRPC transport. Peer clients are connected lazily and cached;
/// a failed call drops the cached connection so the next send reconnects.
pub struct GrpcTransport {
    logger: slog::Logger,
    local: NodeId,
    peer_addrs: HashMap<NodeId, SocketAddr>,
    clients: Mutex<HashMap<NodeId, GrpcClusterClient<Channel>>>,
    // Shared with the RpcServer: inbound envelopes land here.
    table: Arc<HandlerTable>,
}

impl GrpcTransport {
    pub fn new(
        logger: slog::Logger,
        local: NodeId,
        peer_addrs: HashMap<NodeId, SocketAddr>,
        table: Arc<HandlerTable>,
    ) -> Self {
        GrpcTransport {
            logger,
            local,
            peer_addrs,
            clients: Mutex::new(HashMap::new()),
            table,
        }
    }

    async fn client_for(&self, peer: &NodeId) -> Option<GrpcClusterClient<Channel>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(peer) {
            return Some(client.clone());
        }

        let addr = self.peer_addrs.get(peer)?;
        let endpoint = match Endpoint::from_shared(format!("http://{}", addr)) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                slog::error!(self.logger, "Bad endpoint for peer {:?}: {:?}", peer, e);
                return None;
            }
        };
        match endpoint.connect().await {
            Ok(connection) => {
                let client = GrpcClusterClient::new(connection);
                clients.insert(peer.clone(), client.clone());
                Some(client)
            }
            Err(e) => {
                slog::warn!(self.logger, "Failed to connect to peer {:?}: {:?}", peer, e);
                None
            }
        }
    }

    async fn drop_client(&self, peer: &NodeId) {
        self.clients.lock().await.remove(peer);
    }
}

#[async_trait::async_trait]
impl NetworkTransport for GrpcTransport {
    fn local_node_id(&self) -> &NodeId {
        &self.local
    }

    async fn send(&self, envelope: Envelope) -> bool {
        let target = envelope.target.clone();
        let mut client = match self.client_for(&target).await {
            Some(client) => client,
            None => return false,
        };

        let rpc_request = convert_envelope_to_proto(envelope);
        slog::debug!(self.logger, "ClientWire - {:?}", rpc_request);

        match client.exchange(rpc_request).await {
            Ok(rpc_reply) => rpc_reply.into_inner().accepted,
            Err(rpc_status) => {
                slog::warn!(
                    self.logger,
                    "Exchange with {:?} failed: {:?}",
                    target,
                    rpc_status
                );
                self.drop_client(&target).await;
                false
            }
        }
    }

    fn register_handler(&self, kind: MessageKind, handler: mpsc::Sender<Envelope>) {
        self.table.register(kind, handler);
    }
}

fn convert_kind_to_proto(kind: MessageKind) -> ProtoMessageKind {
    match kind {
        MessageKind::NodeJoin => ProtoMessageKind::NodeJoin,
        MessageKind::NodeLeave => ProtoMessageKind::NodeLeave,
        MessageKind::StateUpdate => ProtoMessageKind::StateUpdate,
        MessageKind::PartitionAssign => ProtoMessageKind::PartitionAssign,
        MessageKind::PartitionTransfer => ProtoMessageKind::PartitionTransfer,
        MessageKind::PartitionSync => ProtoMessageKind::PartitionSync,
        MessageKind::HealthCheck => ProtoMessageKind::HealthCheck,
        MessageKind::HealthReport => ProtoMessageKind::HealthReport,
        MessageKind::Alert => ProtoMessageKind::Alert,
        MessageKind::VoteRequest => ProtoMessageKind::VoteRequest,
        MessageKind::VoteResponse => ProtoMessageKind::VoteResponse,
        MessageKind::ReplicateRequest => ProtoMessageKind::ReplicateRequest,
        MessageKind::ReplicateResponse => ProtoMessageKind::ReplicateResponse,
        MessageKind::RecoveryRequest => ProtoMessageKind::RecoveryRequest,
        MessageKind::RecoveryResponse => ProtoMessageKind::RecoveryResponse,
        MessageKind::Replicate => ProtoMessageKind::Replicate,
        MessageKind::ReplicateAck => ProtoMessageKind::ReplicateAck,
    }
}

fn convert_kind_from_proto(kind: ProtoMessageKind) -> Option<MessageKind> {
    match kind {
        ProtoMessageKind::Unspecified => None,
        ProtoMessageKind::NodeJoin => Some(MessageKind::NodeJoin),
        ProtoMessageKind::NodeLeave => Some(MessageKind::NodeLeave),
        ProtoMessageKind::StateUpdate => Some(MessageKind::StateUpdate),
        ProtoMessageKind::PartitionAssign => Some(MessageKind::PartitionAssign),
        ProtoMessageKind::PartitionTransfer => Some(MessageKind::PartitionTransfer),
        ProtoMessageKind::PartitionSync => Some(MessageKind::PartitionSync),
        ProtoMessageKind::HealthCheck => Some(MessageKind::HealthCheck),
        ProtoMessageKind::HealthReport => Some(MessageKind::HealthReport),
        ProtoMessageKind::Alert => Some(MessageKind::Alert),
        ProtoMessageKind::VoteRequest => Some(MessageKind::VoteRequest),
        ProtoMessageKind::VoteResponse => Some(MessageKind::VoteResponse),
        ProtoMessageKind::ReplicateRequest => Some(MessageKind::ReplicateRequest),
        ProtoMessageKind::ReplicateResponse => Some(MessageKind::ReplicateResponse),
        ProtoMessageKind::RecoveryRequest => Some(MessageKind::RecoveryRequest),
        ProtoMessageKind::RecoveryResponse => Some(MessageKind::RecoveryResponse),
        ProtoMessageKind::Replicate => Some(MessageKind::Replicate),
        ProtoMessageKind::ReplicateAck => Some(MessageKind::ReplicateAck),
    }
}

fn convert_envelope_to_proto(envelope: Envelope) -> ProtoEnvelope {
    ProtoEnvelope {
        id: envelope.id,
        kind: convert_kind_to_proto(envelope.kind) as i32,
        source: envelope.source.into_inner(),
        target: envelope.target.into_inner(),
        payload: envelope.payload.to_vec(),
        timestamp_ms: envelope.timestamp.timestamp_millis(),
    }
}

fn convert_envelope_from_proto(rpc_request: ProtoEnvelope) -> Result<Envelope, Status> {
    let proto_kind = ProtoMessageKind::from_i32(rpc_request.kind)
        .ok_or_else(|| Status::invalid_argument("Unknown message kind"))?;
    let kind = convert_kind_from_proto(proto_kind)
        .ok_or_else(|| Status::invalid_argument("Unspecified message kind"))?;

    let timestamp = Utc
        .timestamp_millis_opt(rpc_request.timestamp_ms)
        .single()
        .ok_or_else(|| Status::invalid_argument("Bad timestamp"))?;

    Ok(Envelope {
        id: rpc_request.id,
        kind,
        source: NodeId::new(rpc_request.source),
        target: NodeId::new(rpc_request.target),
        payload: Bytes::from(rpc_request.payload),
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_conversion_round_trips() {
        let kinds = [
            MessageKind::NodeJoin,
            MessageKind::NodeLeave,
            MessageKind::StateUpdate,
            MessageKind::PartitionAssign,
            MessageKind::PartitionTransfer,
            MessageKind::PartitionSync,
            MessageKind::HealthCheck,
            MessageKind::HealthReport,
            MessageKind::Alert,
            MessageKind::VoteRequest,
            MessageKind::VoteResponse,
            MessageKind::ReplicateRequest,
            MessageKind::ReplicateResponse,
            MessageKind::RecoveryRequest,
            MessageKind::RecoveryResponse,
            MessageKind::Replicate,
            MessageKind::ReplicateAck,
        ];

        for kind in kinds.iter() {
            let proto = convert_kind_to_proto(*kind);
            assert_eq!(convert_kind_from_proto(proto), Some(*kind));
        }
    }

    #[test]
    fn envelope_conversion_round_trips() {
        let envelope = Envelope::new(
            MessageKind::VoteRequest,
            NodeId::new("n1"),
            NodeId::new("n2"),
            Bytes::from_static(b"{}"),
        );
        let id = envelope.id.clone();

        let proto = convert_envelope_to_proto(envelope);
        let back = convert_envelope_from_proto(proto).unwrap();

        assert_eq!(back.id, id);
        assert_eq!(back.kind, MessageKind::VoteRequest);
        assert_eq!(back.source, NodeId::new("n1"));
        assert_eq!(back.target, NodeId::new("n2"));
        assert_eq!(back.payload, Bytes::from_static(b"{}"));
    }
}
