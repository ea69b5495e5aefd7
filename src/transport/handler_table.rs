use crate::transport::{Envelope, MessageKind};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Per-member dispatch table: message kind to registered handler channels.
///
/// Dispatch is bounded fire-and-forget. A handler whose channel is full or
/// closed loses the message; that is logged, never propagated, so one slow
/// consumer cannot stall the transport loop.
pub struct HandlerTable {
    logger: slog::Logger,
    handlers: Mutex<HashMap<MessageKind, Vec<mpsc::Sender<Envelope>>>>,
}

impl HandlerTable {
    pub fn new(logger: slog::Logger) -> Self {
        HandlerTable {
            logger,
            handlers: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, kind: MessageKind, handler: mpsc::Sender<Envelope>) {
        let mut handlers = self.handlers.lock().expect("HandlerTable.register() mutex poison");
        handlers.entry(kind).or_insert_with(Vec::new).push(handler);
    }

    /// Offer the envelope to every handler registered for its kind. Returns
    /// true if at least one handler accepted it.
    pub fn dispatch(&self, envelope: Envelope) -> bool {
        let mut handlers = self.handlers.lock().expect("HandlerTable.dispatch() mutex poison");

        let registered = match handlers.get_mut(&envelope.kind) {
            Some(registered) if !registered.is_empty() => registered,
            _ => {
                slog::debug!(
                    self.logger,
                    "No handler registered for inbound '{}' message {}",
                    envelope.kind,
                    envelope.id,
                );
                return false;
            }
        };

        // Closed handlers are pruned as they are discovered.
        registered.retain(|handler| !handler.is_closed());

        let mut accepted = 0;
        for handler in registered.iter() {
            match handler.try_send(envelope.clone()) {
                Ok(()) => accepted += 1,
                Err(mpsc::error::TrySendError::Full(dropped)) => {
                    slog::warn!(
                        self.logger,
                        "Handler queue full, dropping '{}' message {}",
                        dropped.kind,
                        dropped.id,
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Raced with the retain above. Pruned next dispatch.
                }
            }
        }

        accepted > 0
    }
}
