use crate::cluster::NodeId;
use crate::transport::{Envelope, HandlerTable, MessageKind, NetworkTransport};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// In-process message hub. Each joined member gets its own dispatch table;
/// `send` routes an envelope to the target member's table. Used by tests and
/// single-process clusters; the gRPC transport is the multi-process twin
/// behind the same trait.
pub struct InMemoryHub {
    logger: slog::Logger,
    members: Mutex<HashMap<NodeId, Arc<HandlerTable>>>,
    // Members currently cut off from the network. Anything sent by or to
    // them is dropped, which is how tests simulate a network partition.
    unreachable: Mutex<HashSet<NodeId>>,
}

impl InMemoryHub {
    pub fn new(logger: slog::Logger) -> Arc<Self> {
        Arc::new(InMemoryHub {
            logger,
            members: Mutex::new(HashMap::new()),
            unreachable: Mutex::new(HashSet::new()),
        })
    }

    /// Join the hub as `node`, returning that member's transport handle.
    pub fn join(self: &Arc<Self>, node: NodeId) -> InMemoryNetwork {
        let table = Arc::new(HandlerTable::new(
            self.logger.new(slog::o!("Node" => format!("{:?}", node))),
        ));

        self.members
            .lock()
            .expect("InMemoryHub.join() mutex poison")
            .insert(node.clone(), table.clone());

        InMemoryNetwork {
            local: node,
            hub: self.clone(),
            table,
        }
    }

    /// Simulate a network partition around `node`.
    pub fn disconnect(&self, node: &NodeId) {
        self.unreachable
            .lock()
            .expect("InMemoryHub.disconnect() mutex poison")
            .insert(node.clone());
    }

    pub fn reconnect(&self, node: &NodeId) {
        self.unreachable
            .lock()
            .expect("InMemoryHub.reconnect() mutex poison")
            .remove(node);
    }

    fn is_unreachable(&self, node: &NodeId) -> bool {
        self.unreachable
            .lock()
            .expect("InMemoryHub.is_unreachable() mutex poison")
            .contains(node)
    }

    fn deliver(&self, envelope: Envelope) -> bool {
        if self.is_unreachable(&envelope.source) || self.is_unreachable(&envelope.target) {
            return false;
        }

        let table = {
            let members = self.members.lock().expect("InMemoryHub.deliver() mutex poison");
            members.get(&envelope.target).cloned()
        };

        match table {
            Some(table) => table.dispatch(envelope),
            None => {
                slog::debug!(self.logger, "Send to unknown member {:?}", envelope.target);
                false
            }
        }
    }
}

pub struct InMemoryNetwork {
    local: NodeId,
    hub: Arc<InMemoryHub>,
    table: Arc<HandlerTable>,
}

#[async_trait::async_trait]
impl NetworkTransport for InMemoryNetwork {
    fn local_node_id(&self) -> &NodeId {
        &self.local
    }

    async fn send(&self, envelope: Envelope) -> bool {
        self.hub.deliver(envelope)
    }

    fn register_handler(&self, kind: MessageKind, handler: mpsc::Sender<Envelope>) {
        self.table.register(kind, handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::HANDLER_CHANNEL_CAPACITY;
    use bytes::Bytes;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[tokio::test]
    async fn point_to_point_delivery() {
        let hub = InMemoryHub::new(test_logger());
        let a = hub.join(NodeId::new("a"));
        let b = hub.join(NodeId::new("b"));

        let (tx, mut rx) = mpsc::channel(HANDLER_CHANNEL_CAPACITY);
        b.register_handler(MessageKind::HealthCheck, tx);

        let envelope = Envelope::new(
            MessageKind::HealthCheck,
            NodeId::new("a"),
            NodeId::new("b"),
            Bytes::new(),
        );
        assert!(a.send(envelope).await);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.source, NodeId::new("a"));
        assert_eq!(received.kind, MessageKind::HealthCheck);
    }

    #[tokio::test]
    async fn send_to_unknown_member_fails() {
        let hub = InMemoryHub::new(test_logger());
        let a = hub.join(NodeId::new("a"));

        let envelope = Envelope::new(
            MessageKind::HealthCheck,
            NodeId::new("a"),
            NodeId::new("ghost"),
            Bytes::new(),
        );
        assert!(!a.send(envelope).await);
    }

    #[tokio::test]
    async fn broadcast_reports_per_target_delivery() {
        let hub = InMemoryHub::new(test_logger());
        let a = hub.join(NodeId::new("a"));
        let b = hub.join(NodeId::new("b"));
        let c = hub.join(NodeId::new("c"));

        let (tx_b, _rx_b) = mpsc::channel(HANDLER_CHANNEL_CAPACITY);
        b.register_handler(MessageKind::StateUpdate, tx_b);
        let (tx_c, _rx_c) = mpsc::channel(HANDLER_CHANNEL_CAPACITY);
        c.register_handler(MessageKind::StateUpdate, tx_c);

        hub.disconnect(&NodeId::new("c"));

        let results = a
            .broadcast(
                MessageKind::StateUpdate,
                Bytes::new(),
                &[NodeId::new("b"), NodeId::new("c")],
            )
            .await;

        assert_eq!(results.get(&NodeId::new("b")), Some(&true));
        assert_eq!(results.get(&NodeId::new("c")), Some(&false));
    }

    #[tokio::test]
    async fn partitioned_member_cannot_send() {
        let hub = InMemoryHub::new(test_logger());
        let a = hub.join(NodeId::new("a"));
        let b = hub.join(NodeId::new("b"));

        let (tx, mut rx) = mpsc::channel(HANDLER_CHANNEL_CAPACITY);
        b.register_handler(MessageKind::HealthCheck, tx);

        hub.disconnect(&NodeId::new("a"));
        let envelope = Envelope::new(
            MessageKind::HealthCheck,
            NodeId::new("a"),
            NodeId::new("b"),
            Bytes::new(),
        );
        assert!(!a.send(envelope).await);

        hub.reconnect(&NodeId::new("a"));
        let envelope = Envelope::new(
            MessageKind::HealthCheck,
            NodeId::new("a"),
            NodeId::new("b"),
            Bytes::new(),
        );
        assert!(a.send(envelope).await);
        assert!(rx.recv().await.is_some());
    }
}
