//! Typed publish/subscribe over a room transport

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, trace, warn};

use crate::protocol::{decode, encode, PeerId, SyncMessage};

use super::error::NetworkError;
use super::listeners::{ListenerId, ListenerRegistry};
use super::transport::{Transport, TransportEvent};

/// A decoded message together with its sender
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub from: PeerId,
    pub message: SyncMessage,
}

/// Message counters
#[derive(Debug, Clone, Default)]
pub struct BusStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    /// Payloads dropped because they failed to decode
    pub messages_malformed: u64,
}

/// Typed message layer on top of a [`Transport`]
pub struct MessageBus {
    transport: Arc<dyn Transport>,
    listeners: ListenerRegistry<Inbound>,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    messages_malformed: AtomicU64,
}

impl MessageBus {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            listeners: ListenerRegistry::new("message"),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_malformed: AtomicU64::new(0),
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.transport.local_peer_id()
    }

    /// Send to one peer, or to everyone when `target` is `None`
    pub fn send(&self, message: &SyncMessage, target: Option<PeerId>) -> Result<(), NetworkError> {
        let payload = encode(message)?;
        match target {
            Some(peer) => self.transport.send(&payload, peer)?,
            None => self.transport.broadcast(&payload)?,
        }
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        trace!("Sent {} ({} bytes)", message.kind(), payload.len());
        Ok(())
    }

    pub fn broadcast(&self, message: &SyncMessage) -> Result<(), NetworkError> {
        self.send(message, None)
    }

    pub fn subscribe<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&Inbound) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.listeners.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Decode a raw payload and fan it out; malformed payloads are dropped
    pub fn dispatch_raw(&self, from: PeerId, payload: &str) -> usize {
        match decode(payload) {
            Ok(message) => self.dispatch(&Inbound { from, message }),
            Err(e) => {
                self.messages_malformed.fetch_add(1, Ordering::Relaxed);
                warn!("Dropping malformed message from {}: {}", from, e);
                0
            }
        }
    }

    /// Fan a decoded message out to every listener
    pub fn dispatch(&self, inbound: &Inbound) -> usize {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        trace!("Dispatching {} from {}", inbound.message.kind(), inbound.from);
        self.listeners.emit(inbound)
    }

    /// Pump transport messages into the bus until the transport closes
    pub fn start_receive_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let bus = self.clone();
        let mut rx = self.transport.subscribe();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(TransportEvent::Message { from, payload }) => {
                        bus.dispatch_raw(from, &payload);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Message bus lagged, skipped {} events", skipped);
                    }
                    Err(RecvError::Closed) => {
                        debug!("Transport closed, stopping receive loop");
                        break;
                    }
                }
            }
        })
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_malformed: self.messages_malformed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::LoopbackHub;
    use crate::protocol::RoomCode;
    use parking_lot::Mutex;

    #[tokio::test]
    async fn test_dispatch_raw_drops_malformed() {
        let hub = LoopbackHub::new();
        let bus = MessageBus::new(hub.connect());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe(move |inbound| {
            sink.lock().push(inbound.message.kind());
            Ok(())
        });

        let peer = PeerId::new_v4();
        assert_eq!(bus.dispatch_raw(peer, r#"{"x":1}"#), 0);
        assert_eq!(bus.dispatch_raw(peer, r#"{"type":"level-up","level":3}"#), 1);

        assert_eq!(*seen.lock(), vec!["level-up"]);
        assert_eq!(bus.stats().messages_malformed, 1);
        assert_eq!(bus.stats().messages_received, 1);
    }

    #[tokio::test]
    async fn test_receive_loop_delivers_remote_messages() {
        let hub = LoopbackHub::new();
        let host = MessageBus::new(hub.connect());
        let guest = MessageBus::new(hub.connect());
        let code = RoomCode::parse("ABCD").unwrap();
        host.transport.join(&code).unwrap();
        guest.transport.join(&code).unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        guest.subscribe(move |inbound| {
            tx.send(inbound.clone())?;
            Ok(())
        });
        let handle = guest.start_receive_loop();

        host.broadcast(&SyncMessage::RoomClear { room_id: 4 }).unwrap();

        let inbound = rx.recv().await.unwrap();
        assert_eq!(inbound.from, host.local_peer_id());
        assert_eq!(inbound.message, SyncMessage::RoomClear { room_id: 4 });
        handle.abort();
    }
}
