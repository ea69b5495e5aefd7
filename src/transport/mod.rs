mod envelope;
mod handler_table;
mod in_memory;
mod rpc;

pub use envelope::decode_payload;
pub use envelope::encode_payload;
pub use envelope::Envelope;
pub use envelope::MessageKind;
pub use handler_table::HandlerTable;
pub use in_memory::InMemoryHub;
pub use in_memory::InMemoryNetwork;
pub use rpc::shutdown_signal;
pub use rpc::GrpcTransport;
pub use rpc::RpcServer;
pub use rpc::RpcServerShutdownHandle;
pub use rpc::RpcServerShutdownSignal;

use crate::cluster::NodeId;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Handler channels are bounded; a slow consumer loses messages rather than
/// stalling the dispatch path.
pub const HANDLER_CHANNEL_CAPACITY: usize = 64;

/// Message-passing seam between cluster members. Point-to-point send,
/// broadcast-to-set, and per-kind handler registration. The transport does
/// not retry; retry policy belongs to the caller.
#[async_trait::async_trait]
pub trait NetworkTransport: Send + Sync {
    fn local_node_id(&self) -> &NodeId;

    /// Deliver one envelope. `true` means accepted-for-dispatch at the
    /// target, not an application-level ack.
    async fn send(&self, envelope: Envelope) -> bool;

    /// Register a handler channel for one message kind. Every inbound
    /// envelope of that kind is offered to every registered handler.
    fn register_handler(&self, kind: MessageKind, handler: mpsc::Sender<Envelope>);

    /// Send the same payload to each target, as independent envelopes.
    async fn broadcast(
        &self,
        kind: MessageKind,
        payload: Bytes,
        targets: &[NodeId],
    ) -> HashMap<NodeId, bool> {
        let mut results = HashMap::with_capacity(targets.len());
        for target in targets {
            let envelope = Envelope::new(
                kind,
                self.local_node_id().clone(),
                target.clone(),
                payload.clone(),
            );
            let delivered = self.send(envelope).await;
            results.insert(target.clone(), delivered);
        }

        results
    }
}
