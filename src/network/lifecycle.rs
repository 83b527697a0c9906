//! Connection lifecycle for a two-peer room session
//!
//! ```text
//! [*] --> Disconnected
//! Disconnected --> Connecting: host_session() / join_session()
//! Connecting --> Waiting: host entered room
//! Connecting --> Connected: peer joined
//! Connecting --> Disconnected: join timeout / room full
//! Waiting --> Connected: guest joined
//! Connected --> Waiting: guest left (host)
//! Connected --> Reconnecting: host left (guest)
//! Reconnecting --> Connected: peer joined again
//! Reconnecting --> Disconnected: attempts exhausted
//! * --> Disconnected: disconnect()
//! ```
//!
//! Every return to `Disconnected` records a [`DisconnectCause`].

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::protocol::{PeerId, Role, RoomCode, DEFAULT_ROOM_CODE_LEN};

use super::error::NetworkError;
use super::listeners::{ListenerId, ListenerRegistry};
use super::transport::{Transport, TransportEvent};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ConnectionState {
    /// Not in a room
    #[default]
    Disconnected = 0,
    /// Entering a room
    Connecting = 1,
    /// In a room, waiting for the other peer
    Waiting = 2,
    /// Both peers present
    Connected = 3,
    /// Lost the host, trying to get back in
    Reconnecting = 4,
}

impl ConnectionState {
    /// Convert from u8 value
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Waiting,
            3 => Self::Connected,
            4 => Self::Reconnecting,
            _ => Self::Disconnected,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (_, Disconnected)
                | (Disconnected, Connecting)
                | (Connecting, Waiting)
                | (Connecting, Connected)
                | (Waiting, Connected)
                | (Connected, Waiting)
                | (Connected, Reconnecting)
                | (Reconnecting, Connected)
        )
    }
}

/// The room this peer is part of
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSession {
    pub room_code: RoomCode,
    pub local_role: Role,
    pub local_peer_id: PeerId,
    pub remote_peer_id: Option<PeerId>,
}

/// Peer presence notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    Joined(PeerId),
    Left(PeerId),
}

/// Why the last session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    /// `disconnect()` was called
    Requested,
    /// No host answered within the join timeout
    JoinTimeout,
    /// The room already held two peers
    RoomFull,
    /// The guest ran out of reconnection attempts
    ReconnectExhausted,
    /// The transport refused to enter the room
    TransportFailed,
}

impl DisconnectCause {
    /// The error this ending amounts to; `None` for a deliberate leave
    pub fn error(&self) -> Option<NetworkError> {
        match self {
            Self::Requested => None,
            Self::JoinTimeout => Some(NetworkError::ConnectionTimeout),
            Self::RoomFull => Some(NetworkError::RoomFull),
            Self::ReconnectExhausted => Some(NetworkError::ReconnectExhausted),
            Self::TransportFailed => Some(NetworkError::Transport(
                "transport refused the room".to_string(),
            )),
        }
    }
}

/// Lifecycle timing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// How long `join_session` waits for the host (default: 15s)
    #[serde(with = "duration_ms")]
    pub join_timeout: Duration,
    /// Reconnection attempts before giving up (default: 5)
    pub reconnect_attempts: u32,
    /// Delay before each reconnection attempt (default: 2s)
    #[serde(with = "duration_ms")]
    pub reconnect_delay: Duration,
    /// How long each attempt waits for the host (default: 10s)
    #[serde(with = "duration_ms")]
    pub reconnect_wait: Duration,
    /// Length of generated room codes
    pub room_code_len: usize,
}

impl LifecycleConfig {
    /// Validate and normalize the configuration
    pub fn validated(self) -> Self {
        Self {
            join_timeout: self.join_timeout.max(Duration::from_millis(100)),
            reconnect_attempts: self.reconnect_attempts,
            reconnect_delay: self.reconnect_delay,
            reconnect_wait: self.reconnect_wait.max(Duration::from_millis(100)),
            room_code_len: self.room_code_len.clamp(
                crate::protocol::MIN_ROOM_CODE_LEN,
                crate::protocol::MAX_ROOM_CODE_LEN,
            ),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(15),
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(2),
            reconnect_wait: Duration::from_secs(10),
            room_code_len: DEFAULT_ROOM_CODE_LEN,
        }
    }
}

/// Serde helper storing durations as integer milliseconds
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

struct Shared {
    transport: Arc<dyn Transport>,
    config: LifecycleConfig,
    state: AtomicU8,
    session: Mutex<Option<RoomSession>>,
    /// Set before any deliberate leave so retry loops stand down
    intentional: AtomicBool,
    reconnect_attempt: AtomicU32,
    cause: Mutex<Option<DisconnectCause>>,
    state_listeners: ListenerRegistry<ConnectionState>,
    peer_listeners: ListenerRegistry<PeerEvent>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state();
        if prev == next {
            return;
        }
        if !prev.can_transition_to(next) {
            warn!("Ignoring invalid transition {:?} -> {:?}", prev, next);
            return;
        }
        self.state.store(next as u8, Ordering::SeqCst);
        info!("Connection state {:?} -> {:?}", prev, next);
        self.state_listeners.emit(&next);
    }

    fn role(&self) -> Option<Role> {
        self.session.lock().as_ref().map(|s| s.local_role)
    }

    fn on_peer_joined(&self, peer: PeerId) {
        if peer == self.transport.local_peer_id() {
            return;
        }
        {
            let mut session = self.session.lock();
            let Some(session) = session.as_mut() else {
                return;
            };
            if session.remote_peer_id == Some(peer) && self.state().is_connected() {
                debug!("Peer {} already present", peer);
                return;
            }
            session.remote_peer_id = Some(peer);
        }
        self.reconnect_attempt.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);
        self.peer_listeners.emit(&PeerEvent::Joined(peer));
    }

    /// Forget the remote peer if `peer` is it; returns whether it was
    fn take_remote(&self, peer: PeerId) -> bool {
        match self.session.lock().as_mut() {
            Some(session) if session.remote_peer_id == Some(peer) => {
                session.remote_peer_id = None;
                true
            }
            _ => false,
        }
    }

    fn teardown(&self, cause: DisconnectCause) {
        self.transport.leave();
        *self.session.lock() = None;
        *self.cause.lock() = Some(cause);
        self.reconnect_attempt.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);
    }

    /// Start a new session attempt
    fn begin(&self) {
        self.intentional.store(false, Ordering::SeqCst);
        *self.cause.lock() = None;
        self.set_state(ConnectionState::Connecting);
    }

    /// Bounded retry loop run by a guest that lost its host.
    /// Returns true once the host is back.
    async fn reconnect(&self, rx: &mut broadcast::Receiver<TransportEvent>) -> bool {
        let Some(room_code) = self.session.lock().as_ref().map(|s| s.room_code.clone()) else {
            return false;
        };
        self.set_state(ConnectionState::Reconnecting);

        let attempts = self.config.reconnect_attempts;
        for attempt in 1..=attempts {
            if self.intentional.load(Ordering::SeqCst) {
                return false;
            }
            self.reconnect_attempt.store(attempt, Ordering::SeqCst);
            info!(
                "Reconnect attempt {}/{} to room {} in {:?}",
                attempt, attempts, room_code, self.config.reconnect_delay
            );
            sleep(self.config.reconnect_delay).await;
            if self.intentional.load(Ordering::SeqCst) {
                return false;
            }

            self.transport.leave();
            // Presence queued before this rejoin describes the old membership
            *rx = rx.resubscribe();
            if let Err(e) = self.transport.join(&room_code) {
                warn!("Reconnect attempt {} failed: {}", attempt, e);
                continue;
            }

            let local = self.transport.local_peer_id();
            match timeout(self.config.reconnect_wait, wait_for_peer(rx, local)).await {
                Ok(Handshake::Peer(peer)) => {
                    if self.intentional.load(Ordering::SeqCst) {
                        return false;
                    }
                    info!("Reconnected to {} on attempt {}", peer, attempt);
                    self.on_peer_joined(peer);
                    return true;
                }
                Ok(Handshake::RoomFull) => {
                    warn!("Reconnect attempt {}: room {} is full", attempt, room_code);
                }
                Ok(Handshake::Closed) => {
                    warn!("Transport closed while reconnecting");
                    break;
                }
                Err(_) => warn!("Reconnect attempt {} timed out", attempt),
            }
        }

        if self.intentional.load(Ordering::SeqCst) {
            return false;
        }
        error!("Giving up on room {} after {} attempts", room_code, attempts);
        self.teardown(DisconnectCause::ReconnectExhausted);
        false
    }
}

/// How waiting for the remote peer ended
enum Handshake {
    Peer(PeerId),
    RoomFull,
    Closed,
}

/// Wait for a remote peer to appear in the room
async fn wait_for_peer(rx: &mut broadcast::Receiver<TransportEvent>, local: PeerId) -> Handshake {
    loop {
        match rx.recv().await {
            Ok(TransportEvent::PeerJoined(peer)) if peer != local => return Handshake::Peer(peer),
            Ok(TransportEvent::RoomFull(_)) => return Handshake::RoomFull,
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Lifecycle lagged, skipped {} events", skipped);
            }
            Err(RecvError::Closed) => return Handshake::Closed,
        }
    }
}

fn cause_of(error: &NetworkError) -> DisconnectCause {
    match error {
        NetworkError::RoomFull => DisconnectCause::RoomFull,
        _ => DisconnectCause::TransportFailed,
    }
}

/// Watches transport presence events for the lifetime of a session
async fn supervise(shared: Arc<Shared>, mut rx: broadcast::Receiver<TransportEvent>) {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!("Lifecycle lagged, skipped {} events", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        if shared.intentional.load(Ordering::SeqCst) {
            break;
        }

        match event {
            TransportEvent::PeerJoined(peer) => shared.on_peer_joined(peer),
            TransportEvent::PeerLeft(peer) => {
                if !shared.take_remote(peer) {
                    debug!("Ignoring departure of unknown peer {}", peer);
                    continue;
                }
                shared.peer_listeners.emit(&PeerEvent::Left(peer));

                match shared.role() {
                    Some(Role::Host) => {
                        info!("Guest {} left, waiting for it to return", peer);
                        shared.set_state(ConnectionState::Waiting);
                    }
                    Some(Role::Guest) => {
                        warn!("Lost connection to host {}", peer);
                        if !shared.reconnect(&mut rx).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
            TransportEvent::RoomFull(code) => debug!("Relay reports room {} full", code),
            TransportEvent::Message { .. } => {}
        }
    }
    debug!("Lifecycle supervisor stopped");
}

/// Owns the room session and its connection state machine
pub struct ConnectionLifecycle {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ConnectionLifecycle {
    pub fn new(transport: Arc<dyn Transport>, config: LifecycleConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                config: config.validated(),
                state: AtomicU8::new(ConnectionState::Disconnected as u8),
                session: Mutex::new(None),
                intentional: AtomicBool::new(false),
                reconnect_attempt: AtomicU32::new(0),
                cause: Mutex::new(None),
                state_listeners: ListenerRegistry::new("connection-state"),
                peer_listeners: ListenerRegistry::new("peer"),
            }),
            supervisor: Mutex::new(None),
        }
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn session(&self) -> Option<RoomSession> {
        self.shared.session.lock().clone()
    }

    pub fn role(&self) -> Option<Role> {
        self.shared.role()
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.shared.transport.local_peer_id()
    }

    /// Current reconnection attempt (0 when not reconnecting)
    pub fn reconnect_attempt(&self) -> u32 {
        self.shared.reconnect_attempt.load(Ordering::SeqCst)
    }

    /// Why the last session ended; `None` while one is open or before the first
    pub fn disconnect_cause(&self) -> Option<DisconnectCause> {
        *self.shared.cause.lock()
    }

    /// Subscribe to state changes
    pub fn subscribe<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&ConnectionState) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.state_listeners.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.shared.state_listeners.unsubscribe(id)
    }

    /// Subscribe to peer joined/left notifications
    pub fn subscribe_peers<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&PeerEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.peer_listeners.subscribe(handler)
    }

    pub fn unsubscribe_peers(&self, id: ListenerId) -> bool {
        self.shared.peer_listeners.unsubscribe(id)
    }

    /// Open a room as host and return its code
    ///
    /// The state settles on `Waiting`; it becomes `Connected` once a guest joins.
    pub async fn host_session(&self) -> Result<RoomCode, NetworkError> {
        if self.state() != ConnectionState::Disconnected {
            return Err(NetworkError::AlreadyConnected);
        }
        let shared = &self.shared;
        let room_code = RoomCode::generate(shared.config.room_code_len);
        shared.begin();

        let rx = shared.transport.subscribe();
        *shared.session.lock() = Some(RoomSession {
            room_code: room_code.clone(),
            local_role: Role::Host,
            local_peer_id: shared.transport.local_peer_id(),
            remote_peer_id: None,
        });
        if let Err(e) = shared.transport.join(&room_code) {
            warn!("Failed to open room {}: {}", room_code, e);
            shared.teardown(cause_of(&e));
            return Err(e);
        }

        info!("Hosting room {}", room_code);
        shared.set_state(ConnectionState::Waiting);
        self.spawn_supervisor(rx);
        Ok(room_code)
    }

    /// Join a host's room as guest
    ///
    /// The code is validated before the transport is touched.
    pub async fn join_session(&self, room_code: &str) -> Result<(), NetworkError> {
        let room_code = RoomCode::parse(room_code)?;
        if self.state() != ConnectionState::Disconnected {
            return Err(NetworkError::AlreadyConnected);
        }
        let shared = &self.shared;
        shared.begin();

        let local = shared.transport.local_peer_id();
        // One receiver for the handshake and the supervisor, so nothing is seen twice
        let mut rx = shared.transport.subscribe();
        *shared.session.lock() = Some(RoomSession {
            room_code: room_code.clone(),
            local_role: Role::Guest,
            local_peer_id: local,
            remote_peer_id: None,
        });
        if let Err(e) = shared.transport.join(&room_code) {
            warn!("Failed to join room {}: {}", room_code, e);
            shared.teardown(cause_of(&e));
            return Err(e);
        }

        info!("Joining room {}", room_code);
        match timeout(shared.config.join_timeout, wait_for_peer(&mut rx, local)).await {
            Ok(Handshake::Peer(peer)) if !shared.intentional.load(Ordering::SeqCst) => {
                shared.on_peer_joined(peer);
                self.spawn_supervisor(rx);
                Ok(())
            }
            Ok(Handshake::Peer(_)) => Err(NetworkError::NotConnected),
            Ok(Handshake::RoomFull) => {
                warn!("Room {} is full", room_code);
                shared.teardown(DisconnectCause::RoomFull);
                Err(NetworkError::RoomFull)
            }
            Ok(Handshake::Closed) | Err(_) => {
                warn!("No host answered in room {}", room_code);
                shared.teardown(DisconnectCause::JoinTimeout);
                Err(NetworkError::ConnectionTimeout)
            }
        }
    }

    /// Leave the room deliberately
    pub fn disconnect(&self) {
        // Flag first so an in-flight retry loop stands down
        self.shared.intentional.store(true, Ordering::SeqCst);
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
        self.shared.teardown(DisconnectCause::Requested);
    }

    fn spawn_supervisor(&self, rx: broadcast::Receiver<TransportEvent>) {
        let handle = tokio::spawn(supervise(self.shared.clone(), rx));
        if let Some(previous) = self.supervisor.lock().replace(handle) {
            previous.abort();
        }
    }
}

impl Drop for ConnectionLifecycle {
    fn drop(&mut self) {
        self.shared.intentional.store(true, Ordering::SeqCst);
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
    }
}
