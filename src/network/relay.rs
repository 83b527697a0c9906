//! WebSocket room relay: server and client transport
//!
//! The relay groups peers by room code, forwards opaque payloads between
//! them and announces arrivals and departures. Clients redial a dropped
//! socket and rejoin their room.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::protocol::{PeerId, RelayFrame, RoomCode, MAX_PEERS_PER_ROOM};

use super::error::NetworkError;
use super::transport::{Transport, TransportEvent, EVENT_CHANNEL_CAPACITY};

type Outbox = mpsc::UnboundedSender<RelayFrame>;

/// Room state on the server
#[derive(Default)]
struct Room {
    peers: HashMap<PeerId, Outbox>,
}

impl Room {
    fn send_others(&self, sender: &PeerId, frame: RelayFrame) {
        for (peer, outbox) in &self.peers {
            if peer != sender {
                let _ = outbox.send(frame.clone());
            }
        }
    }
}

type Rooms = Arc<RwLock<HashMap<RoomCode, Room>>>;

/// Room relay server
#[derive(Clone, Default)]
pub struct RelayServer {
    rooms: Rooms,
}

impl RelayServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept plain WebSocket connections on `addr` forever
    pub async fn run(&self, addr: &str) -> Result<(), NetworkError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| NetworkError::Relay(format!("Bind failed: {}", e)))?;

        info!("Relay server listening on {}", addr);

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    info!("New relay connection from {}", peer_addr);
                    let server = self.clone();
                    tokio::spawn(async move {
                        match accept_async(stream).await {
                            Ok(ws_stream) => {
                                if let Err(e) = server.serve(ws_stream).await {
                                    warn!("Connection error: {}", e);
                                }
                            }
                            Err(e) => warn!("WebSocket accept failed for {}: {}", peer_addr, e),
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }

    /// Serve one established WebSocket (plain or TLS) until it closes
    pub async fn serve<S>(&self, ws_stream: WebSocketStream<S>) -> Result<(), NetworkError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut write, mut read) = ws_stream.split();
        let (outbox, mut inbox) = mpsc::unbounded_channel::<RelayFrame>();
        let mut membership: Option<(RoomCode, PeerId)> = None;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<RelayFrame>(&text) {
                                Ok(frame) => {
                                    self.process_frame(frame, &outbox, &mut membership).await;
                                }
                                Err(e) => {
                                    warn!("Invalid relay frame: {}", e);
                                    let _ = outbox.send(RelayFrame::Error {
                                        message: "Invalid frame".to_string(),
                                    });
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            warn!("WebSocket error: {}", e);
                            break;
                        }
                        _ => {}
                    }
                }

                frame = inbox.recv() => {
                    if let Some(frame) = frame {
                        let json = serde_json::to_string(&frame)?;
                        if write.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        if let Some((code, peer_id)) = membership.take() {
            self.leave_room(&code, &peer_id, &outbox).await;
        }
        Ok(())
    }

    /// Number of open rooms
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    async fn process_frame(
        &self,
        frame: RelayFrame,
        outbox: &Outbox,
        membership: &mut Option<(RoomCode, PeerId)>,
    ) {
        match frame {
            RelayFrame::Join { room_code, peer_id } => {
                let rooms = self.rooms.read().await;

                // Repeated join on the same connection: re-announce the room
                if matches!(membership, Some((code, peer)) if *code == room_code && *peer == peer_id) {
                    if let Some(room) = rooms.get(&room_code) {
                        let existing: Vec<PeerId> =
                            room.peers.keys().copied().filter(|p| *p != peer_id).collect();
                        let _ = outbox.send(RelayFrame::Joined {
                            room_code,
                            peers: existing,
                        });
                        return;
                    }
                }
                drop(rooms);

                if let Some((code, old_peer)) = membership.take() {
                    self.leave_room(&code, &old_peer, outbox).await;
                }

                let mut rooms = self.rooms.write().await;
                let room = rooms.entry(room_code.clone()).or_default();
                if room.peers.len() >= MAX_PEERS_PER_ROOM && !room.peers.contains_key(&peer_id) {
                    warn!("Peer {} refused, room {} is full", peer_id, room_code);
                    let _ = outbox.send(RelayFrame::RoomFull { room_code });
                    return;
                }

                let existing: Vec<PeerId> =
                    room.peers.keys().copied().filter(|p| *p != peer_id).collect();
                room.peers.insert(peer_id, outbox.clone());
                room.send_others(&peer_id, RelayFrame::PeerJoined { peer_id });
                let _ = outbox.send(RelayFrame::Joined {
                    room_code: room_code.clone(),
                    peers: existing,
                });

                info!("Peer {} joined room {}", peer_id, room_code);
                *membership = Some((room_code, peer_id));
            }

            RelayFrame::Leave => {
                if let Some((code, peer_id)) = membership.take() {
                    self.leave_room(&code, &peer_id, outbox).await;
                }
            }

            RelayFrame::Send { to, payload } => {
                let Some((code, from)) = membership.as_ref() else {
                    let _ = outbox.send(RelayFrame::Error {
                        message: "Not in a room".to_string(),
                    });
                    return;
                };
                let rooms = self.rooms.read().await;
                let Some(room) = rooms.get(code) else {
                    return;
                };
                let frame = RelayFrame::Deliver {
                    from: *from,
                    payload,
                };
                match to {
                    Some(target) => match room.peers.get(&target) {
                        Some(target_outbox) if target != *from => {
                            let _ = target_outbox.send(frame);
                        }
                        _ => debug!("Dropping frame for unknown peer {}", target),
                    },
                    None => room.send_others(from, frame),
                }
            }

            // Server -> client frames, ignore if received
            _ => {}
        }
    }

    async fn leave_room(&self, code: &RoomCode, peer_id: &PeerId, outbox: &Outbox) {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(code) else {
            return;
        };
        // A newer connection may have taken over this peer ID
        let owned = room
            .peers
            .get(peer_id)
            .is_some_and(|current| current.same_channel(outbox));
        if !owned {
            return;
        }

        room.peers.remove(peer_id);
        room.send_others(peer_id, RelayFrame::PeerLeft { peer_id: *peer_id });
        info!("Peer {} left room {}", peer_id, code);

        if room.peers.is_empty() {
            rooms.remove(code);
            info!("Room {} removed (empty)", code);
        }
    }
}

/// Attempts made to restore a dropped relay connection
const REDIAL_ATTEMPTS: u32 = 5;
/// Pause between redial attempts
const REDIAL_DELAY: Duration = Duration::from_secs(1);

enum Outbound {
    Frame(RelayFrame),
    /// Close the socket without leaving the room
    Close,
}

/// One live websocket to the relay
struct Link {
    generation: u64,
    outgoing: mpsc::UnboundedSender<Outbound>,
    tasks: Vec<JoinHandle<()>>,
}

struct ClientInner {
    url: String,
    peer_id: PeerId,
    events: broadcast::Sender<TransportEvent>,
    /// Room to be in; survives socket loss so a redial can rejoin it
    room: Mutex<Option<RoomCode>>,
    link: Mutex<Option<Link>>,
    generation: AtomicU64,
    dialing: AtomicBool,
}

impl ClientInner {
    fn push(&self, frame: RelayFrame) -> Result<(), NetworkError> {
        let link = self.link.lock();
        let Some(link) = link.as_ref() else {
            return Err(NetworkError::Relay("Connection closed".to_string()));
        };
        link.outgoing
            .send(Outbound::Frame(frame))
            .map_err(|_| NetworkError::Relay("Connection closed".to_string()))
    }

    fn push_join(&self) {
        let Some(room_code) = self.room.lock().clone() else {
            return;
        };
        if let Err(e) = self.push(RelayFrame::Join {
            room_code,
            peer_id: self.peer_id,
        }) {
            warn!("Failed to rejoin after redial: {}", e);
        }
    }

    /// Start reader and writer tasks for a fresh socket
    fn install<S>(self: &Arc<Self>, ws_stream: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (mut write, mut read) = ws_stream.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Outbound>();

        let writer = tokio::spawn(async move {
            while let Some(outbound) = outgoing_rx.recv().await {
                let frame = match outbound {
                    Outbound::Frame(frame) => frame,
                    Outbound::Close => break,
                };
                let json = match serde_json::to_string(&frame) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Failed to serialize relay frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    warn!("Relay send failed: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        let weak = Arc::downgrade(self);
        let events = self.events.clone();
        let reader = tokio::spawn(async move {
            let mut remotes: HashSet<PeerId> = HashSet::new();
            while let Some(msg) = read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Relay receive failed: {}", e);
                        break;
                    }
                };
                let frame = match serde_json::from_str::<RelayFrame>(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Invalid relay frame: {}", e);
                        continue;
                    }
                };
                trace!("Relay frame: {:?}", frame);

                let event = match frame {
                    RelayFrame::Joined { room_code, peers } => {
                        debug!("Joined relay room {} with {} peers", room_code, peers.len());
                        for peer in peers {
                            remotes.insert(peer);
                            let _ = events.send(TransportEvent::PeerJoined(peer));
                        }
                        continue;
                    }
                    RelayFrame::PeerJoined { peer_id } => {
                        remotes.insert(peer_id);
                        TransportEvent::PeerJoined(peer_id)
                    }
                    RelayFrame::PeerLeft { peer_id } => {
                        remotes.remove(&peer_id);
                        TransportEvent::PeerLeft(peer_id)
                    }
                    RelayFrame::Deliver { from, payload } => TransportEvent::Message { from, payload },
                    RelayFrame::RoomFull { room_code } => TransportEvent::RoomFull(room_code),
                    RelayFrame::Error { message } => {
                        warn!("Relay error: {}", message);
                        continue;
                    }
                    _ => continue,
                };
                let _ = events.send(event);
            }

            if let Some(inner) = weak.upgrade() {
                inner.link_closed(generation, remotes);
            }
        });

        *self.link.lock() = Some(Link {
            generation,
            outgoing,
            tasks: vec![writer, reader],
        });
        debug!("Relay link {} established to {}", generation, self.url);
    }

    fn link_closed(self: &Arc<Self>, generation: u64, remotes: HashSet<PeerId>) {
        {
            let mut link = self.link.lock();
            if link.as_ref().map(|l| l.generation) != Some(generation) {
                return;
            }
            *link = None;
        }
        info!("Relay connection closed");
        for peer in remotes {
            let _ = self.events.send(TransportEvent::PeerLeft(peer));
        }
        if self.room.lock().is_some() {
            self.spawn_redial();
        }
    }

    /// Reconnect in the background and rejoin the current room
    fn spawn_redial(self: &Arc<Self>) {
        if self.dialing.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(self);
        let url = self.url.clone();

        tokio::spawn(async move {
            for attempt in 1..=REDIAL_ATTEMPTS {
                let result = connect_async(url.as_str()).await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match result {
                    Ok((ws_stream, _)) => {
                        inner.install(ws_stream);
                        inner.dialing.store(false, Ordering::SeqCst);
                        info!("Relay redial to {} succeeded on attempt {}", url, attempt);
                        inner.push_join();
                        return;
                    }
                    Err(e) => warn!(
                        "Relay redial {}/{} to {} failed: {}",
                        attempt, REDIAL_ATTEMPTS, url, e
                    ),
                }
                drop(inner);
                sleep(REDIAL_DELAY).await;
            }
            if let Some(inner) = weak.upgrade() {
                inner.dialing.store(false, Ordering::SeqCst);
            }
        });
    }
}

/// Client side of the relay, usable as a [`Transport`]
///
/// A dropped socket is redialed in the background and the current room
/// rejoined under the same peer ID.
pub struct RelayTransport {
    inner: Arc<ClientInner>,
}

impl RelayTransport {
    /// Connect to a relay server (`ws://` or `wss://`)
    pub async fn connect(url: &str) -> Result<Arc<Self>, NetworkError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| NetworkError::Relay(format!("Connect failed: {}", e)))?;
        debug!("Connected to relay server: {}", url);

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(ClientInner {
            url: url.to_string(),
            peer_id: Uuid::new_v4(),
            events,
            room: Mutex::new(None),
            link: Mutex::new(None),
            generation: AtomicU64::new(0),
            dialing: AtomicBool::new(false),
        });
        inner.install(ws_stream);
        Ok(Arc::new(Self { inner }))
    }

    pub fn is_open(&self) -> bool {
        self.inner.link.lock().is_some()
    }

    /// Close the socket without leaving the room, as a network failure would
    pub fn drop_connection(&self) {
        if let Some(link) = self.inner.link.lock().as_ref() {
            let _ = link.outgoing.send(Outbound::Close);
        }
    }
}

impl Transport for RelayTransport {
    fn local_peer_id(&self) -> PeerId {
        self.inner.peer_id
    }

    fn join(&self, room_code: &RoomCode) -> Result<(), NetworkError> {
        *self.inner.room.lock() = Some(room_code.clone());
        if !self.is_open() {
            debug!("Relay link down, redialing before joining {}", room_code);
            self.inner.spawn_redial();
            return Ok(());
        }
        self.inner.push(RelayFrame::Join {
            room_code: room_code.clone(),
            peer_id: self.inner.peer_id,
        })
    }

    fn leave(&self) {
        if self.inner.room.lock().take().is_some() {
            let _ = self.inner.push(RelayFrame::Leave);
        }
    }

    fn send(&self, payload: &str, target: PeerId) -> Result<(), NetworkError> {
        self.inner.push(RelayFrame::Send {
            to: Some(target),
            payload: payload.to_string(),
        })
    }

    fn broadcast(&self, payload: &str) -> Result<(), NetworkError> {
        if self.inner.room.lock().is_none() {
            return Err(NetworkError::NotConnected);
        }
        self.inner.push(RelayFrame::Send {
            to: None,
            payload: payload.to_string(),
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }
}

impl Drop for RelayTransport {
    fn drop(&mut self) {
        self.inner.room.lock().take();
        if let Some(link) = self.inner.link.lock().take() {
            for handle in link.tasks {
                handle.abort();
            }
        }
    }
}
