//! In-memory room transport
//!
//! Keeps both peers in one process without touching the network stack.
//! Used by the `demo` command and by tests, which can also drop a peer to
//! simulate a lost connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::protocol::{PeerId, RoomCode, MAX_PEERS_PER_ROOM};

use super::error::NetworkError;
use super::transport::{Transport, TransportEvent, EVENT_CHANNEL_CAPACITY};

#[derive(Default)]
struct HubState {
    rooms: HashMap<RoomCode, Vec<PeerId>>,
    membership: HashMap<PeerId, RoomCode>,
    peers: HashMap<PeerId, broadcast::Sender<TransportEvent>>,
}

impl HubState {
    fn notify(&self, peer: &PeerId, event: TransportEvent) {
        if let Some(tx) = self.peers.get(peer) {
            // No receivers is fine
            let _ = tx.send(event);
        }
    }

    fn room_mates(&self, peer: &PeerId) -> Vec<PeerId> {
        self.membership
            .get(peer)
            .and_then(|code| self.rooms.get(code))
            .map(|members| members.iter().copied().filter(|p| p != peer).collect())
            .unwrap_or_default()
    }

    fn remove_from_room(&mut self, peer: &PeerId) -> Option<RoomCode> {
        let code = self.membership.remove(peer)?;
        let mates = match self.rooms.get_mut(&code) {
            Some(members) => {
                members.retain(|p| p != peer);
                members.clone()
            }
            None => Vec::new(),
        };
        for mate in &mates {
            self.notify(mate, TransportEvent::PeerLeft(*peer));
        }
        if mates.is_empty() {
            self.rooms.remove(&code);
            debug!("Loopback room {} removed (empty)", code);
        }
        Some(code)
    }
}

/// Shared in-memory room registry
#[derive(Default)]
pub struct LoopbackHub {
    state: Mutex<HubState>,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a transport endpoint with a fresh peer ID
    pub fn connect(self: &Arc<Self>) -> Arc<LoopbackTransport> {
        let peer_id = Uuid::new_v4();
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        self.state.lock().peers.insert(peer_id, tx.clone());
        Arc::new(LoopbackTransport {
            hub: self.clone(),
            peer_id,
            events: tx,
            join_calls: AtomicUsize::new(0),
        })
    }

    /// Simulate a network drop: the peer vanishes from its room without
    /// calling `leave`, and its room mates observe `PeerLeft`.
    pub fn drop_peer(&self, peer_id: PeerId) {
        let mut state = self.state.lock();
        if let Some(code) = state.remove_from_room(&peer_id) {
            debug!("Loopback dropped peer {} from room {}", peer_id, code);
            let remaining = state.rooms.get(&code).cloned().unwrap_or_default();
            for mate in remaining {
                state.notify(&peer_id, TransportEvent::PeerLeft(mate));
            }
        }
    }

    /// Number of peers currently in a room
    pub fn room_size(&self, room_code: &RoomCode) -> usize {
        self.state
            .lock()
            .rooms
            .get(room_code)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

/// One peer's endpoint on a [`LoopbackHub`]
pub struct LoopbackTransport {
    hub: Arc<LoopbackHub>,
    peer_id: PeerId,
    events: broadcast::Sender<TransportEvent>,
    join_calls: AtomicUsize,
}

impl LoopbackTransport {
    /// How many times `join` has been called on this endpoint
    pub fn join_calls(&self) -> usize {
        self.join_calls.load(Ordering::SeqCst)
    }
}

impl Transport for LoopbackTransport {
    fn local_peer_id(&self) -> PeerId {
        self.peer_id
    }

    fn join(&self, room_code: &RoomCode) -> Result<(), NetworkError> {
        self.join_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.hub.state.lock();

        if state.membership.get(&self.peer_id) == Some(room_code) {
            return Ok(());
        }
        let full = state
            .rooms
            .get(room_code)
            .is_some_and(|members| members.len() >= MAX_PEERS_PER_ROOM);
        if full {
            return Err(NetworkError::RoomFull);
        }
        state.remove_from_room(&self.peer_id);

        let members = state.rooms.entry(room_code.clone()).or_default();
        let existing = members.clone();
        members.push(self.peer_id);
        state.membership.insert(self.peer_id, room_code.clone());

        for mate in &existing {
            state.notify(mate, TransportEvent::PeerJoined(self.peer_id));
            state.notify(&self.peer_id, TransportEvent::PeerJoined(*mate));
        }
        debug!("Loopback peer {} joined room {}", self.peer_id, room_code);
        Ok(())
    }

    fn leave(&self) {
        let mut state = self.hub.state.lock();
        if let Some(code) = state.remove_from_room(&self.peer_id) {
            debug!("Loopback peer {} left room {}", self.peer_id, code);
        }
    }

    fn send(&self, payload: &str, target: PeerId) -> Result<(), NetworkError> {
        let state = self.hub.state.lock();
        if !state.room_mates(&self.peer_id).contains(&target) {
            return Err(NetworkError::Transport(format!(
                "peer {} is not in this room",
                target
            )));
        }
        state.notify(
            &target,
            TransportEvent::Message {
                from: self.peer_id,
                payload: payload.to_string(),
            },
        );
        trace!("Loopback sent {} bytes to {}", payload.len(), target);
        Ok(())
    }

    fn broadcast(&self, payload: &str) -> Result<(), NetworkError> {
        let state = self.hub.state.lock();
        if !state.membership.contains_key(&self.peer_id) {
            return Err(NetworkError::NotConnected);
        }
        for mate in state.room_mates(&self.peer_id) {
            state.notify(
                &mate,
                TransportEvent::Message {
                    from: self.peer_id,
                    payload: payload.to_string(),
                },
            );
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        let mut state = self.hub.state.lock();
        state.remove_from_room(&self.peer_id);
        state.peers.remove(&self.peer_id);
    }
}
