//! Guest-side mirror of the host's world
//!
//! Host updates only ever set interpolation targets; `update` moves the
//! proxies toward them each frame. The guest never overrides host state.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::network::{
    pong_for, ConnectionLifecycle, ConnectionState, DisconnectCause, Inbound, LatencyTracker,
    ListenerId, MessageBus,
};
use crate::protocol::{EnemyState, PeerId, Role, SyncMessage};

use super::world::{Effect, GuestWorld, Overlay, ProxyView};
use super::{finite_or, SyncConfig};

/// Spawn room, always reachable
const SPAWN_ROOM: u32 = 0;

/// Move `current` toward `target` without overshooting
fn approach(current: f64, target: f64, alpha: f64) -> f64 {
    current + (target - current) * alpha
}

/// Interpolated view of the host's avatar
#[derive(Debug, Clone, Default)]
pub struct HostProxy {
    pub x: f64,
    pub y: f64,
    pub target_x: f64,
    pub target_y: f64,
    pub vx: f64,
    pub vy: f64,
    pub hp: f64,
    pub max_hp: f64,
    pub level: u32,
    pub gold: u64,
    pub anim: Option<String>,
    pub flip_x: bool,
    /// False until the first position arrives
    pub seen: bool,
}

/// Interpolated view of one host enemy
#[derive(Debug, Clone)]
pub struct EnemyProxy {
    pub x: f64,
    pub y: f64,
    pub target_x: f64,
    pub target_y: f64,
    pub hp: f64,
    pub max_hp: f64,
    pub texture: Option<String>,
    pub ai_state: Option<String>,
    /// Time since the host last reported this enemy
    pub since_update: Duration,
}

impl EnemyProxy {
    fn view(&self) -> ProxyView<'_> {
        ProxyView {
            x: self.x,
            y: self.y,
            hp: self.hp,
            max_hp: self.max_hp,
            texture: self.texture.as_deref(),
            anim: self.ai_state.as_deref(),
            flip_x: false,
        }
    }
}

/// Rooms the guest may occupy
#[derive(Debug, Clone)]
pub struct GuestTether {
    visited: HashSet<u32>,
    pub last_safe_x: f64,
    pub last_safe_y: f64,
}

impl Default for GuestTether {
    fn default() -> Self {
        Self {
            visited: HashSet::from([SPAWN_ROOM]),
            last_safe_x: 0.0,
            last_safe_y: 0.0,
        }
    }
}

impl GuestTether {
    pub fn is_visited(&self, room_id: u32) -> bool {
        self.visited.contains(&room_id)
    }

    /// Unlock a room and remember `(x, y)` as safe
    pub fn visit(&mut self, room_id: u32, x: f64, y: f64) {
        self.visited.insert(room_id);
        self.set_safe(x, y);
    }

    pub fn set_safe(&mut self, x: f64, y: f64) {
        self.last_safe_x = x;
        self.last_safe_y = y;
    }

    pub fn visited_count(&self) -> usize {
        self.visited.len()
    }

    /// Forget every room but the spawn room
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Guest-side controller
pub struct MirrorController<W: GuestWorld> {
    world: W,
    bus: Arc<MessageBus>,
    config: SyncConfig,
    local_peer_id: PeerId,
    host: HostProxy,
    enemies: HashMap<String, EnemyProxy>,
    loot: HashMap<String, String>,
    tether: GuestTether,
    spectating: bool,
    overlay: Overlay,
    last_state: ConnectionState,
    /// Countdown to the forced return to menu
    grace: Option<Duration>,
    inventory: Option<Value>,
    latency: LatencyTracker,
    position_elapsed: Duration,
    tether_corrections: u64,
    listener: Option<ListenerId>,
    hook: Option<(Arc<ConnectionLifecycle>, ListenerId)>,
}

impl<W: GuestWorld> MirrorController<W> {
    pub fn new(world: W, bus: Arc<MessageBus>, config: SyncConfig) -> Self {
        let local_peer_id = bus.local_peer_id();
        Self {
            world,
            bus,
            config: config.validated(),
            local_peer_id,
            host: HostProxy::default(),
            enemies: HashMap::new(),
            loot: HashMap::new(),
            tether: GuestTether::default(),
            spectating: false,
            overlay: Overlay::None,
            last_state: ConnectionState::Disconnected,
            grace: None,
            inventory: None,
            latency: LatencyTracker::new(),
            position_elapsed: Duration::ZERO,
            tether_corrections: 0,
            listener: None,
            hook: None,
        }
    }

    /// Route bus traffic into the controller
    pub fn attach(this: &Arc<Mutex<Self>>) -> ListenerId
    where
        W: 'static,
    {
        let weak: Weak<Mutex<Self>> = Arc::downgrade(this);
        let bus = this.lock().bus.clone();
        let id = bus.subscribe(move |inbound| {
            if let Some(controller) = weak.upgrade() {
                controller.lock().handle_inbound(inbound);
            }
            Ok(())
        });
        this.lock().listener = Some(id);
        id
    }

    /// Drive the reconnect overlay from lifecycle state
    pub fn attach_lifecycle(this: &Arc<Mutex<Self>>, lifecycle: Arc<ConnectionLifecycle>)
    where
        W: 'static,
    {
        let weak = Arc::downgrade(this);
        let id = lifecycle.subscribe(move |state| {
            if let Some(controller) = weak.upgrade() {
                controller.lock().on_connection_state(*state);
            }
            Ok(())
        });

        let mut controller = this.lock();
        controller.last_state = lifecycle.state();
        if let Some((old, old_id)) = controller.hook.replace((lifecycle, id)) {
            old.unsubscribe(old_id);
        }
    }

    pub fn destroy(&mut self) {
        if let Some(id) = self.listener.take() {
            self.bus.unsubscribe(id);
        }
        if let Some((lifecycle, id)) = self.hook.take() {
            lifecycle.unsubscribe(id);
        }
        self.enemies.clear();
        self.loot.clear();
        self.tether.reset();
        self.grace = None;
        debug!("Mirror controller destroyed");
    }

    pub fn world(&self) -> &W {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut W {
        &mut self.world
    }

    pub fn host_proxy(&self) -> &HostProxy {
        &self.host
    }

    pub fn enemy(&self, id: &str) -> Option<&EnemyProxy> {
        self.enemies.get(id)
    }

    pub fn enemy_count(&self) -> usize {
        self.enemies.len()
    }

    pub fn enemies(&self) -> impl Iterator<Item = (&str, &EnemyProxy)> {
        self.enemies.iter().map(|(id, proxy)| (id.as_str(), proxy))
    }

    pub fn tether(&self) -> &GuestTether {
        &self.tether
    }

    pub fn is_spectating(&self) -> bool {
        self.spectating
    }

    pub fn overlay(&self) -> Overlay {
        self.overlay
    }

    pub fn inventory(&self) -> Option<&Value> {
        self.inventory.as_ref()
    }

    pub fn latency(&self) -> &LatencyTracker {
        &self.latency
    }

    pub fn tether_corrections(&self) -> u64 {
        self.tether_corrections
    }

    pub fn visible_loot(&self) -> usize {
        self.loot.len()
    }

    /// Apply one message from the host
    pub fn handle_inbound(&mut self, inbound: &Inbound) {
        match &inbound.message {
            SyncMessage::Position {
                x,
                y,
                vx,
                vy,
                anim,
                flip_x,
            } => self.on_host_position(*x, *y, *vx, *vy, anim.clone(), *flip_x),
            SyncMessage::EnemyUpdate { enemies } => self.on_enemy_batch(enemies),
            SyncMessage::EnemyDeath {
                enemy_id,
                killer,
                enemy_type,
                x,
                y,
            } => {
                self.remove_enemy(enemy_id);
                self.world.spawn_effect(Effect::EnemyDeath {
                    enemy_type: enemy_type.clone(),
                    killer: *killer,
                    x: *x,
                    y: *y,
                });
            }
            SyncMessage::DamageNumber {
                x,
                y,
                damage,
                critical,
            } => self.world.spawn_effect(Effect::DamageNumber {
                x: *x,
                y: *y,
                damage: *damage,
                critical: *critical,
            }),
            SyncMessage::Attack {
                x,
                y,
                angle,
                weapon,
            } => self.world.spawn_effect(Effect::Attack {
                x: *x,
                y: *y,
                angle: *angle,
                weapon: weapon.clone(),
            }),
            SyncMessage::Projectile { x, y, vx, vy, kind } => {
                self.world.spawn_effect(Effect::Projectile {
                    x: *x,
                    y: *y,
                    vx: *vx,
                    vy: *vy,
                    kind: kind.clone(),
                })
            }
            SyncMessage::Effect { kind, x, y } => self.world.spawn_effect(Effect::Transient {
                kind: kind.clone(),
                x: *x,
                y: *y,
            }),
            SyncMessage::ComboUpdate { count, killer } => self.world.spawn_effect(Effect::Combo {
                count: *count,
                killer: *killer,
            }),
            SyncMessage::LevelUp { level } => {
                self.world.spawn_effect(Effect::LevelUp { level: *level })
            }
            SyncMessage::LootSpawn {
                loot_id,
                item,
                x,
                y,
            } => {
                self.loot.insert(loot_id.clone(), item.clone());
                self.world.spawn_effect(Effect::LootSpawned {
                    loot_id: loot_id.clone(),
                    item: item.clone(),
                    x: *x,
                    y: *y,
                });
            }
            SyncMessage::LootTaken { loot_id, taker } => {
                if self.loot.remove(loot_id).is_some() {
                    self.world.spawn_effect(Effect::LootRemoved {
                        loot_id: loot_id.clone(),
                        taker: *taker,
                    });
                }
            }
            SyncMessage::InventorySnapshot { data } => self.apply_inventory(data),
            SyncMessage::HostState {
                hp,
                max_hp,
                level,
                gold,
            } => {
                let max_hp = finite_or(*max_hp, 1.0).max(1.0);
                self.host.max_hp = max_hp;
                self.host.hp = finite_or(*hp, 0.0).clamp(0.0, max_hp);
                self.host.level = *level;
                self.host.gold = *gold;
                self.world
                    .update_host_stats(self.host.hp, max_hp, *level, *gold);
            }
            SyncMessage::RoomActivated { room_id, x, y } => self.on_room_activated(*room_id, *x, *y),
            SyncMessage::RoomClear { room_id } => {
                debug!("Room {} cleared", room_id);
                if self.spectating {
                    self.set_spectating(false);
                }
            }
            SyncMessage::PlayerDied { peer_id } => {
                if *peer_id == self.local_peer_id {
                    self.set_spectating(true);
                }
            }
            SyncMessage::PlayerRevive { peer_id, x, y, hp } => {
                if *peer_id == self.local_peer_id && x.is_finite() && y.is_finite() {
                    let hp = finite_or(*hp, 1.0).max(1.0);
                    info!("Revived with {} hp", hp);
                    self.world.teleport_avatar(*x, *y);
                    self.world.revive(hp);
                    self.set_spectating(false);
                }
            }
            SyncMessage::SceneChange { scene } => self.on_scene_change(scene),
            SyncMessage::FloorChange { floor, seed } => {
                info!("Descending to floor {}", floor);
                self.reset_run();
                self.world.spawn_effect(Effect::FloorChange {
                    floor: *floor,
                    seed: *seed,
                });
            }
            SyncMessage::Ping { sent_at_ms } => {
                self.send(&pong_for(*sent_at_ms), Some(inbound.from));
            }
            SyncMessage::Pong { sent_at_ms } => self.latency.process_pong(*sent_at_ms),
            SyncMessage::Hit { .. } | SyncMessage::GuestState { .. } => {
                debug!("Ignoring guest-only message {}", inbound.message.kind());
            }
        }
    }

    /// Retarget the host proxy; the first update or a long jump snaps
    pub fn on_host_position(
        &mut self,
        x: f64,
        y: f64,
        vx: f64,
        vy: f64,
        anim: Option<String>,
        flip_x: bool,
    ) {
        if !x.is_finite() || !y.is_finite() {
            warn!("Ignoring non-finite host position");
            return;
        }
        let host = &mut self.host;
        let jump = (x - host.x).hypot(y - host.y);
        if !host.seen || jump > self.config.snap_distance {
            host.x = x;
            host.y = y;
            host.seen = true;
        }
        host.target_x = x;
        host.target_y = y;
        host.vx = finite_or(vx, 0.0);
        host.vy = finite_or(vy, 0.0);
        host.anim = anim;
        host.flip_x = flip_x;
        self.tether.set_safe(x, y);
    }

    /// Retarget enemy proxies from one host batch
    ///
    /// An entry with `hp <= 0` removes that proxy even without a death event.
    pub fn on_enemy_batch(&mut self, batch: &[EnemyState]) {
        for state in batch {
            if !state.hp.is_finite() || state.hp <= 0.0 {
                self.remove_enemy(&state.id);
                continue;
            }

            let position = match (state.x, state.y) {
                (Some(x), Some(y)) if x.is_finite() && y.is_finite() => Some((x, y)),
                _ => None,
            };

            match self.enemies.get_mut(&state.id) {
                Some(proxy) => {
                    if let Some((x, y)) = position {
                        if (x - proxy.x).hypot(y - proxy.y) > self.config.snap_distance {
                            proxy.x = x;
                            proxy.y = y;
                        }
                        proxy.target_x = x;
                        proxy.target_y = y;
                    }
                    proxy.hp = state.hp;
                    if let Some(max_hp) = state.max_hp.filter(|m| m.is_finite()) {
                        proxy.max_hp = max_hp;
                    }
                    if state.texture.is_some() {
                        proxy.texture = state.texture.clone();
                    }
                    if state.ai_state.is_some() {
                        proxy.ai_state = state.ai_state.clone();
                    }
                    proxy.since_update = Duration::ZERO;
                }
                None => {
                    let Some((x, y)) = position else {
                        trace!("Skipping {} without a position", state.id);
                        continue;
                    };
                    self.enemies.insert(
                        state.id.clone(),
                        EnemyProxy {
                            x,
                            y,
                            target_x: x,
                            target_y: y,
                            hp: state.hp,
                            max_hp: state.max_hp.filter(|m| m.is_finite()).unwrap_or(state.hp),
                            texture: state.texture.clone(),
                            ai_state: state.ai_state.clone(),
                            since_update: Duration::ZERO,
                        },
                    );
                }
            }
        }
    }

    fn remove_enemy(&mut self, enemy_id: &str) {
        if self.enemies.remove(enemy_id).is_some() {
            self.world.fade_out_enemy(enemy_id, self.config.enemy_fade);
        }
    }

    fn on_room_activated(&mut self, room_id: u32, x: f64, y: f64) {
        if !x.is_finite() || !y.is_finite() {
            warn!("Ignoring room {} activation with bad position", room_id);
            return;
        }
        info!("Room {} unlocked", room_id);
        self.tether.visit(room_id, x, y);
        if !self.spectating {
            self.world.teleport_avatar(x, y);
        }
    }

    fn on_scene_change(&mut self, scene: &str) {
        if !self.config.scene_allowed(scene) {
            warn!("Ignoring scene change to unknown scene {:?}", scene);
            return;
        }
        info!("Host moved to scene {}", scene);
        self.reset_run();
        self.world.change_scene(scene);
    }

    /// Drop per-run state: tether, proxies and loot
    fn reset_run(&mut self) {
        self.tether.reset();
        self.enemies.clear();
        self.loot.clear();
        if self.spectating {
            self.set_spectating(false);
        }
    }

    /// Parse an inventory blob; a corrupt one leaves the current inventory in place
    fn apply_inventory(&mut self, data: &str) {
        match serde_json::from_str::<Value>(data) {
            Ok(inventory) => {
                self.inventory = Some(inventory.clone());
                self.world.apply_inventory(inventory);
            }
            Err(e) => warn!("Keeping previous inventory, snapshot is corrupt: {}", e),
        }
    }

    fn set_spectating(&mut self, spectating: bool) {
        if self.spectating == spectating {
            return;
        }
        self.spectating = spectating;
        info!(
            "{} spectate mode",
            if spectating { "Entering" } else { "Leaving" }
        );
        self.world.set_spectating(spectating);
    }

    /// Advance one frame
    pub fn update(&mut self, dt: Duration) {
        let alpha = (self.config.interpolation_rate * dt.as_secs_f64()).min(1.0);

        if self.host.seen {
            let host = &mut self.host;
            host.x = approach(host.x, host.target_x, alpha);
            host.y = approach(host.y, host.target_y, alpha);
            self.world.render_host(&ProxyView {
                x: host.x,
                y: host.y,
                hp: host.hp,
                max_hp: host.max_hp,
                texture: None,
                anim: host.anim.as_deref(),
                flip_x: host.flip_x,
            });
        }

        let stale_after = self.config.enemy_stale_timeout;
        let stale: Vec<String> = self
            .enemies
            .iter_mut()
            .filter_map(|(id, proxy)| {
                proxy.since_update += dt;
                (proxy.since_update > stale_after).then(|| id.clone())
            })
            .collect();
        for id in stale {
            debug!("Dropping stale enemy {}", id);
            self.remove_enemy(&id);
        }
        for (id, proxy) in self.enemies.iter_mut() {
            proxy.x = approach(proxy.x, proxy.target_x, alpha);
            proxy.y = approach(proxy.y, proxy.target_y, alpha);
            self.world.render_enemy(id, &proxy.view());
        }

        if self.spectating {
            if self.host.seen {
                self.world.follow_camera(self.host.x, self.host.y);
            }
        } else {
            self.enforce_tether();
        }

        if let Some(remaining) = self.grace {
            let remaining = remaining.saturating_sub(dt);
            if remaining.is_zero() {
                self.grace = None;
                info!("Returning to menu after connection loss");
                self.world.return_to_menu();
            } else {
                self.grace = Some(remaining);
            }
        }

        self.position_elapsed += dt;
        if self.position_elapsed >= self.config.guest_position_interval {
            self.position_elapsed = Duration::ZERO;
            if !self.spectating && self.last_state.is_connected() {
                self.send_position();
            }
        }
    }

    /// Pull the avatar back if it stands in a room the host has not unlocked
    pub fn enforce_tether(&mut self) -> bool {
        let avatar = self.world.avatar();
        let Some(room) = self.world.room_at(avatar.x, avatar.y) else {
            return false;
        };
        if self.tether.is_visited(room) {
            return false;
        }
        debug!(
            "Avatar entered locked room {}, returning to ({:.0}, {:.0})",
            room, self.tether.last_safe_x, self.tether.last_safe_y
        );
        self.world
            .teleport_avatar(self.tether.last_safe_x, self.tether.last_safe_y);
        self.tether_corrections += 1;
        true
    }

    /// Drive overlays from lifecycle state
    pub fn on_connection_state(&mut self, state: ConnectionState) {
        let previous = std::mem::replace(&mut self.last_state, state);
        match state {
            ConnectionState::Reconnecting => self.set_overlay(Overlay::Reconnecting),
            ConnectionState::Connected => {
                self.grace = None;
                self.set_overlay(Overlay::None);
            }
            ConnectionState::Disconnected if previous == ConnectionState::Reconnecting => {
                if self.left_on_purpose() {
                    debug!("Left while reconnecting");
                    self.grace = None;
                    self.set_overlay(Overlay::None);
                } else {
                    warn!("Connection to host lost");
                    self.set_overlay(Overlay::ConnectionLost);
                    self.grace = Some(self.config.disconnect_grace);
                }
            }
            _ => {}
        }
    }

    /// Whether the attached lifecycle ended because the player asked to leave
    fn left_on_purpose(&self) -> bool {
        self.hook.as_ref().is_some_and(|(lifecycle, _)| {
            lifecycle.disconnect_cause() == Some(DisconnectCause::Requested)
        })
    }

    fn set_overlay(&mut self, overlay: Overlay) {
        if self.overlay != overlay {
            self.overlay = overlay;
            self.world.set_overlay(overlay);
        }
    }

    pub fn send_position(&mut self) {
        let avatar = self.world.avatar();
        if !avatar.x.is_finite() || !avatar.y.is_finite() {
            return;
        }
        let vx = finite_or(avatar.vx, 0.0);
        self.send(
            &SyncMessage::Position {
                x: avatar.x,
                y: avatar.y,
                vx,
                vy: finite_or(avatar.vy, 0.0),
                anim: None,
                flip_x: vx < 0.0,
            },
            None,
        );
    }

    pub fn send_attack(&mut self, x: f64, y: f64, angle: f64, weapon: Option<String>) {
        self.send(
            &SyncMessage::Attack {
                x,
                y,
                angle,
                weapon,
            },
            None,
        );
    }

    /// Claim a hit; the host decides whether it counts
    pub fn send_hit(&mut self, enemy_id: &str, damage: f64, critical: bool) {
        self.send(
            &SyncMessage::Hit {
                enemy_id: enemy_id.to_string(),
                damage,
                critical,
            },
            None,
        );
    }

    pub fn send_stats(&mut self) {
        let avatar = self.world.avatar();
        let max_hp = finite_or(avatar.max_hp, 1.0).max(1.0);
        self.send(
            &SyncMessage::GuestState {
                hp: finite_or(avatar.hp, 0.0).clamp(0.0, max_hp),
                max_hp,
                level: finite_or(avatar.level, 1.0).max(1.0) as u32,
            },
            None,
        );
    }

    pub fn send_inventory(&mut self, inventory: &Value) {
        match serde_json::to_string(inventory) {
            Ok(data) => self.send(&SyncMessage::InventorySnapshot { data }, None),
            Err(e) => warn!("Failed to serialize inventory: {}", e),
        }
    }

    /// Tell the host we died and start spectating
    pub fn report_local_death(&mut self) {
        self.send(
            &SyncMessage::PlayerDied {
                peer_id: self.local_peer_id,
            },
            None,
        );
        self.set_spectating(true);
    }

    pub fn claim_loot(&mut self, loot_id: &str) {
        self.send(
            &SyncMessage::LootTaken {
                loot_id: loot_id.to_string(),
                taker: Role::Guest,
            },
            None,
        );
    }

    pub fn send_ping(&mut self) {
        let ping = self.latency.create_ping();
        self.send(&ping, None);
    }

    fn send(&self, message: &SyncMessage, target: Option<PeerId>) {
        if let Err(e) = self.bus.send(message, target) {
            trace!("Send of {} skipped: {}", message.kind(), e);
        }
    }
}

impl<W: GuestWorld> Drop for MirrorController<W> {
    fn drop(&mut self) {
        if let Some(id) = self.listener.take() {
            self.bus.unsubscribe(id);
        }
        if let Some((lifecycle, id)) = self.hook.take() {
            lifecycle.unsubscribe(id);
        }
    }
}
