//! Host-side authority over the shared world
//!
//! The host is the only peer allowed to mutate world state. Guest input goes
//! through the rate limiter and validator before it touches anything, and the
//! canonical state is pushed back out on fixed cadences driven by `tick`.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use crate::network::{
    pong_for, ConnectionLifecycle, ConnectionState, Inbound, LatencyTracker, ListenerId,
    MessageBus, PeerEvent,
};
use crate::protocol::{EnemyState, PeerId, Role, SyncMessage};

use super::combo::ComboWindow;
use super::registry::{EntityIdRegistry, LocalRef};
use super::validation::{MessageValidator, RateLimiter, ValidationLimits, ValidationResult};
use super::world::{Effect, HostWorld};
use super::{finite_or, SyncConfig};

/// Guest max HP assumed when it never reported its stats
const DEFAULT_GUEST_MAX_HP: f64 = 100.0;

/// Host counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorityStats {
    pub accepted: u64,
    /// Semantic or structural rejects
    pub rejected: u64,
    pub rate_limited: u64,
    /// Messages a guest has no business sending
    pub ignored: u64,
    pub enemy_broadcasts: u64,
    pub host_state_broadcasts: u64,
    pub host_kills: u64,
    pub guest_kills: u64,
    pub loot_spawned: u64,
    pub loot_claimed: u64,
}

/// What the host knows about the connected guest
#[derive(Debug, Clone)]
struct GuestRecord {
    peer_id: PeerId,
    /// Last accepted position, used for delta checks
    last_position: Option<(f64, f64)>,
    max_hp: Option<f64>,
    dead: bool,
}

impl GuestRecord {
    fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            last_position: None,
            max_hp: None,
            dead: false,
        }
    }
}

#[derive(Debug, Clone)]
struct LootEntry {
    item: String,
}

struct LifecycleHook {
    lifecycle: Arc<ConnectionLifecycle>,
    state_listener: ListenerId,
    peer_listener: ListenerId,
}

/// Canonical world owner for the host role
pub struct AuthorityController<W: HostWorld> {
    world: W,
    bus: Arc<MessageBus>,
    config: SyncConfig,
    validator: MessageValidator,
    registry: EntityIdRegistry,
    combo: ComboWindow,
    /// Enemy network ID -> role that last landed a validated hit
    last_hitter: HashMap<String, Role>,
    rate_limiters: HashMap<PeerId, RateLimiter>,
    guest: Option<GuestRecord>,
    loot: HashMap<String, LootEntry>,
    next_loot: u64,
    enemy_elapsed: Duration,
    host_state_elapsed: Duration,
    latency: LatencyTracker,
    waiting_for_guest: bool,
    stats: AuthorityStats,
    listener: Option<ListenerId>,
    hook: Option<LifecycleHook>,
}

impl<W: HostWorld> AuthorityController<W> {
    pub fn new(world: W, bus: Arc<MessageBus>, config: SyncConfig, limits: ValidationLimits) -> Self {
        let config = config.validated();
        Self {
            world,
            bus,
            combo: ComboWindow::new(config.combo_window),
            config,
            validator: MessageValidator::new(limits),
            registry: EntityIdRegistry::new("enemy"),
            last_hitter: HashMap::new(),
            rate_limiters: HashMap::new(),
            guest: None,
            loot: HashMap::new(),
            next_loot: 1,
            enemy_elapsed: Duration::ZERO,
            host_state_elapsed: Duration::ZERO,
            latency: LatencyTracker::new(),
            waiting_for_guest: false,
            stats: AuthorityStats::default(),
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
                controller.lock().handle_inbound(inbound, Instant::now());
            }
            Ok(())
        });
        this.lock().listener = Some(id);
        id
    }

    /// Follow connection state and guest presence
    pub fn attach_lifecycle(this: &Arc<Mutex<Self>>, lifecycle: Arc<ConnectionLifecycle>)
    where
        W: 'static,
    {
        let weak = Arc::downgrade(this);
        let state_listener = lifecycle.subscribe(move |state| {
            if let Some(controller) = weak.upgrade() {
                controller.lock().on_connection_state(*state);
            }
            Ok(())
        });
        let weak = Arc::downgrade(this);
        let peer_listener = lifecycle.subscribe_peers(move |event| {
            if let Some(controller) = weak.upgrade() {
                controller.lock().on_peer_event(*event);
            }
            Ok(())
        });

        let mut controller = this.lock();
        if let Some(old) = controller.hook.replace(LifecycleHook {
            lifecycle,
            state_listener,
            peer_listener,
        }) {
            old.lifecycle.unsubscribe(old.state_listener);
            old.lifecycle.unsubscribe_peers(old.peer_listener);
        }
    }

    /// Detach from the bus and lifecycle and drop all session state
    pub fn destroy(&mut self) {
        if let Some(id) = self.listener.take() {
            self.bus.unsubscribe(id);
        }
        if let Some(hook) = self.hook.take() {
            hook.lifecycle.unsubscribe(hook.state_listener);
            hook.lifecycle.unsubscribe_peers(hook.peer_listener);
        }
        self.combo.reset();
        self.rate_limiters.clear();
        self.registry.clear();
        self.last_hitter.clear();
        self.loot.clear();
        self.guest = None;
        self.enemy_elapsed = Duration::ZERO;
        self.host_state_elapsed = Duration::ZERO;
        debug!("Authority controller destroyed");
    }

    pub fn world(&self) -> &W {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut W {
        &mut self.world
    }

    pub fn stats(&self) -> &AuthorityStats {
        &self.stats
    }

    pub fn latency(&self) -> &LatencyTracker {
        &self.latency
    }

    pub fn registry(&self) -> &EntityIdRegistry {
        &self.registry
    }

    pub fn combo(&self) -> &ComboWindow {
        &self.combo
    }

    pub fn guest_peer(&self) -> Option<PeerId> {
        self.guest.as_ref().map(|g| g.peer_id)
    }

    pub fn is_guest_dead(&self) -> bool {
        self.guest.as_ref().is_some_and(|g| g.dead)
    }

    /// Host is simulating alone until the guest comes back
    pub fn is_waiting_for_guest(&self) -> bool {
        self.waiting_for_guest
    }

    pub fn live_loot(&self) -> usize {
        self.loot.len()
    }

    /// Validate and apply one guest message
    pub fn handle_inbound(&mut self, inbound: &Inbound, now: Instant) {
        let from = inbound.from;
        let max_rate = self.validator.limits().max_messages_per_second;
        let limiter = self
            .rate_limiters
            .entry(from)
            .or_insert_with(|| RateLimiter::new(max_rate));
        let verdict = limiter.check(now);
        if !verdict.is_valid() {
            self.stats.rate_limited += 1;
            debug!("Dropping {} from {}: {}", inbound.message.kind(), from, verdict.reason());
            return;
        }

        if self.guest.as_ref().map(|g| g.peer_id) != Some(from) {
            debug!("Tracking {} as guest", from);
            self.guest = Some(GuestRecord::new(from));
        }

        let verdict = match &inbound.message {
            SyncMessage::Position { x, y, vx, vy, .. } => self.apply_guest_position(*x, *y, *vx, *vy),
            SyncMessage::Hit {
                enemy_id,
                damage,
                critical,
            } => self.apply_guest_hit(enemy_id, *damage, *critical, from),
            SyncMessage::Attack {
                x,
                y,
                angle,
                weapon,
            } => self.with_position(*x, *y, |world| {
                world.spawn_effect(Effect::Attack {
                    x: *x,
                    y: *y,
                    angle: finite_or(*angle, 0.0),
                    weapon: weapon.clone(),
                })
            }),
            SyncMessage::Projectile { x, y, vx, vy, kind } => self.with_position(*x, *y, |world| {
                world.spawn_effect(Effect::Projectile {
                    x: *x,
                    y: *y,
                    vx: finite_or(*vx, 0.0),
                    vy: finite_or(*vy, 0.0),
                    kind: kind.clone(),
                })
            }),
            SyncMessage::Effect { kind, x, y } => self.with_position(*x, *y, |world| {
                world.spawn_effect(Effect::Transient {
                    kind: kind.clone(),
                    x: *x,
                    y: *y,
                })
            }),
            SyncMessage::LootTaken { loot_id, .. } => self.claim_loot(loot_id, Role::Guest),
            SyncMessage::InventorySnapshot { data } => match serde_json::from_str::<Value>(data) {
                Ok(inventory) => {
                    self.world.set_guest_inventory(inventory);
                    ValidationResult::ok()
                }
                Err(e) => ValidationResult::reject(format!("corrupt inventory snapshot: {}", e)),
            },
            SyncMessage::GuestState { hp, max_hp, level } => {
                if !hp.is_finite() || !max_hp.is_finite() {
                    ValidationResult::reject("guest stats are not numbers")
                } else {
                    if let Some(guest) = self.guest.as_mut() {
                        guest.max_hp = Some(*max_hp);
                    }
                    self.world.update_guest_stats(*hp, *max_hp, *level);
                    ValidationResult::ok()
                }
            }
            SyncMessage::PlayerDied { peer_id } if *peer_id == from => {
                if let Some(guest) = self.guest.as_mut() {
                    guest.dead = true;
                }
                info!("Guest {} died", from);
                ValidationResult::ok()
            }
            SyncMessage::Ping { sent_at_ms } => {
                self.send_to(&pong_for(*sent_at_ms), from);
                ValidationResult::ok()
            }
            SyncMessage::Pong { sent_at_ms } => {
                self.latency.process_pong(*sent_at_ms);
                ValidationResult::ok()
            }
            other => {
                self.stats.ignored += 1;
                debug!("Ignoring host-only message {} from guest", other.kind());
                return;
            }
        };

        if verdict.is_valid() {
            self.stats.accepted += 1;
        } else {
            self.stats.rejected += 1;
            warn!(
                "Rejected {} from {}: {}",
                inbound.message.kind(),
                from,
                verdict.reason()
            );
        }
    }

    fn with_position<F>(&mut self, x: f64, y: f64, apply: F) -> ValidationResult
    where
        F: FnOnce(&mut W),
    {
        let verdict = self.validator.validate_position(x, y);
        if verdict.is_valid() {
            apply(&mut self.world);
        }
        verdict
    }

    /// Move the host's copy of the guest avatar after bounds checks
    ///
    /// A jump larger than the delta limit is logged but still applied, since
    /// room activation legitimately teleports the guest.
    pub fn apply_guest_position(&mut self, x: f64, y: f64, vx: f64, vy: f64) -> ValidationResult {
        let verdict = self.validator.validate_position(x, y);
        if !verdict.is_valid() {
            return verdict;
        }

        if let Some(previous) = self.guest.as_ref().and_then(|g| g.last_position) {
            let delta = self.validator.validate_position_delta(previous, (x, y));
            if !delta.is_valid() {
                warn!("Suspicious guest movement: {}", delta.reason());
            }
        }

        self.world
            .move_guest_avatar(x, y, finite_or(vx, 0.0), finite_or(vy, 0.0));
        if let Some(guest) = self.guest.as_mut() {
            guest.last_position = Some((x, y));
        }
        ValidationResult::ok()
    }

    /// Apply a guest hit claim; rejections are never echoed back
    pub fn apply_guest_hit(
        &mut self,
        enemy_id: &str,
        damage: f64,
        critical: bool,
        from: PeerId,
    ) -> ValidationResult {
        let verdict = self.validator.validate_damage(damage);
        if !verdict.is_valid() {
            return verdict;
        }
        let registry = &self.registry;
        let verdict = self
            .validator
            .validate_enemy_id(enemy_id, |id| registry.lookup(id).is_some());
        if !verdict.is_valid() {
            return verdict;
        }
        let Some(local) = self.registry.lookup(enemy_id) else {
            return ValidationResult::reject(format!("unknown enemy {}", enemy_id));
        };

        let Some(outcome) = self.world.apply_damage(local, damage) else {
            // Gone from the world without a death event
            self.registry.release(local);
            self.last_hitter.remove(enemy_id);
            return ValidationResult::reject(format!("enemy {} no longer exists", enemy_id));
        };

        trace!("Guest {} hit {} for {}", from, enemy_id, damage);
        self.last_hitter.insert(enemy_id.to_string(), Role::Guest);
        self.world.spawn_effect(Effect::DamageNumber {
            x: outcome.x,
            y: outcome.y,
            damage,
            critical,
        });
        self.publish(&SyncMessage::DamageNumber {
            x: outcome.x,
            y: outcome.y,
            damage,
            critical,
        });

        if outcome.killed {
            self.on_enemy_death(local, &outcome.enemy_type, outcome.x, outcome.y);
        }
        ValidationResult::ok()
    }

    /// Attribute a hit by the host's own avatar
    pub fn record_host_hit(&mut self, enemy: LocalRef) {
        if let Some(id) = self.registry.network_id(enemy) {
            self.last_hitter.insert(id.to_string(), Role::Host);
        }
    }

    /// Report an enemy death to the guest and release its ID
    ///
    /// Enemies that were never broadcast, or were already released, are
    /// ignored, so calling this twice for one death is harmless.
    pub fn on_enemy_death(&mut self, enemy: LocalRef, enemy_type: &str, x: f64, y: f64) {
        let Some(enemy_id) = self.registry.release(enemy) else {
            debug!("Death of unregistered enemy {:?} ignored", enemy);
            return;
        };
        let killer = self.last_hitter.remove(&enemy_id).unwrap_or(Role::Host);
        let (x, y) = (finite_or(x, 0.0), finite_or(y, 0.0));

        match killer {
            Role::Host => self.stats.host_kills += 1,
            Role::Guest => self.stats.guest_kills += 1,
        }
        debug!("{} killed by {}", enemy_id, killer);

        self.world.spawn_effect(Effect::EnemyDeath {
            enemy_type: enemy_type.to_string(),
            killer,
            x,
            y,
        });
        self.publish(&SyncMessage::EnemyDeath {
            enemy_id,
            killer,
            enemy_type: enemy_type.to_string(),
            x,
            y,
        });

        if let Some(count) = self.combo.register_kill(killer) {
            self.world.spawn_effect(Effect::Combo { count, killer });
            self.publish(&SyncMessage::ComboUpdate { count, killer });
        }
    }

    /// Advance the broadcast cadences and the combo timer
    pub fn tick(&mut self, dt: Duration) {
        self.combo.tick(dt);

        self.enemy_elapsed += dt;
        if self.enemy_elapsed >= self.config.enemy_broadcast_interval {
            self.enemy_elapsed = Duration::ZERO;
            self.broadcast_host_position();
            self.broadcast_enemy_update();
        }

        self.host_state_elapsed += dt;
        if self.host_state_elapsed >= self.config.host_state_interval {
            self.host_state_elapsed = Duration::ZERO;
            self.broadcast_host_state();
        }
    }

    pub fn broadcast_host_position(&mut self) {
        let avatar = self.world.avatar();
        let vx = finite_or(avatar.vx, 0.0);
        self.publish(&SyncMessage::Position {
            x: finite_or(avatar.x, 0.0),
            y: finite_or(avatar.y, 0.0),
            vx,
            vy: finite_or(avatar.vy, 0.0),
            anim: None,
            flip_x: vx < 0.0,
        });
    }

    /// Send one batch with every live enemy
    ///
    /// New enemies get an ID here; IDs of enemies that vanished without a
    /// death event are released.
    pub fn broadcast_enemy_update(&mut self) {
        let enemies = self.world.live_enemies();

        let stale: Vec<LocalRef> = self
            .registry
            .refs()
            .filter(|r| !enemies.iter().any(|e| e.local_ref == *r))
            .collect();
        for local in stale {
            if let Some(id) = self.registry.release(local) {
                trace!("Released vanished enemy {}", id);
                self.last_hitter.remove(&id);
            }
        }

        let batch: Vec<EnemyState> = enemies
            .iter()
            .map(|enemy| {
                let max_hp = finite_or(enemy.max_hp, 1.0).max(1.0);
                EnemyState {
                    id: self.registry.id_for(enemy.local_ref),
                    x: Some(finite_or(enemy.x, 0.0)),
                    y: Some(finite_or(enemy.y, 0.0)),
                    hp: finite_or(enemy.hp, 0.0).clamp(0.0, max_hp),
                    max_hp: Some(max_hp),
                    texture: Some(enemy.texture.clone()),
                    ai_state: Some(enemy.ai_state.clone()),
                }
            })
            .collect();

        self.stats.enemy_broadcasts += 1;
        self.publish(&SyncMessage::EnemyUpdate { enemies: batch });
    }

    /// Send sanitized host stats, followed by a latency ping
    pub fn broadcast_host_state(&mut self) {
        let avatar = self.world.avatar();
        let max_hp = match avatar.max_hp {
            m if m.is_finite() && m > 0.0 => m,
            _ => 1.0,
        };
        let hp = finite_or(avatar.hp, 0.0).clamp(0.0, max_hp);
        let level = finite_or(avatar.level, 1.0).max(1.0) as u32;
        let gold = finite_or(avatar.gold, 0.0).max(0.0) as u64;

        self.stats.host_state_broadcasts += 1;
        self.publish(&SyncMessage::HostState {
            hp,
            max_hp,
            level,
            gold,
        });
        let ping = self.latency.create_ping();
        self.publish(&ping);
    }

    /// Mark a room safe; the guest teleports to the host
    pub fn broadcast_room_activated(&mut self, room_id: u32) {
        let avatar = self.world.avatar();
        let (x, y) = (finite_or(avatar.x, 0.0), finite_or(avatar.y, 0.0));
        // The guest is about to jump here
        if let Some(guest) = self.guest.as_mut() {
            guest.last_position = Some((x, y));
        }
        info!("Room {} activated", room_id);
        self.publish(&SyncMessage::RoomActivated { room_id, x, y });
    }

    /// Announce a cleared room and revive a dead guest
    pub fn broadcast_room_clear(&mut self, room_id: u32) {
        self.publish(&SyncMessage::RoomClear { room_id });

        let Some(guest) = self.guest.as_mut().filter(|g| g.dead) else {
            return;
        };
        guest.dead = false;
        let peer_id = guest.peer_id;
        let hp = (guest.max_hp.unwrap_or(DEFAULT_GUEST_MAX_HP) * 0.5).max(1.0);

        let avatar = self.world.avatar();
        info!("Reviving guest {} after room {} clear", peer_id, room_id);
        self.publish(&SyncMessage::PlayerRevive {
            peer_id,
            x: finite_or(avatar.x, 0.0),
            y: finite_or(avatar.y, 0.0),
            hp,
        });
    }

    /// Drop an item into the world; returns its loot ID
    pub fn spawn_loot(&mut self, item: &str, x: f64, y: f64) -> String {
        let loot_id = format!("loot_{}", self.next_loot);
        self.next_loot += 1;
        self.loot.insert(
            loot_id.clone(),
            LootEntry {
                item: item.to_string(),
            },
        );
        self.stats.loot_spawned += 1;

        let (x, y) = (finite_or(x, 0.0), finite_or(y, 0.0));
        self.world.spawn_effect(Effect::LootSpawned {
            loot_id: loot_id.clone(),
            item: item.to_string(),
            x,
            y,
        });
        self.publish(&SyncMessage::LootSpawn {
            loot_id: loot_id.clone(),
            item: item.to_string(),
            x,
            y,
        });
        loot_id
    }

    /// Hand a loot item to `taker` exactly once
    pub fn claim_loot(&mut self, loot_id: &str, taker: Role) -> ValidationResult {
        let Some(entry) = self.loot.remove(loot_id) else {
            return ValidationResult::reject(format!("unknown loot {}", loot_id));
        };
        self.stats.loot_claimed += 1;
        debug!("{} took {} ({})", taker, loot_id, entry.item);

        self.world.spawn_effect(Effect::LootRemoved {
            loot_id: loot_id.to_string(),
            taker,
        });
        self.publish(&SyncMessage::LootTaken {
            loot_id: loot_id.to_string(),
            taker,
        });
        ValidationResult::ok()
    }

    pub fn send_inventory(&mut self, inventory: &Value) {
        match serde_json::to_string(inventory) {
            Ok(data) => self.publish(&SyncMessage::InventorySnapshot { data }),
            Err(e) => warn!("Failed to serialize inventory: {}", e),
        }
    }

    /// Move both peers to another scene; refuses names the guest would reject
    pub fn broadcast_scene_change(&mut self, scene: &str) -> bool {
        if !self.config.scene_allowed(scene) {
            warn!("Refusing to broadcast unknown scene {}", scene);
            return false;
        }
        self.publish(&SyncMessage::SceneChange {
            scene: scene.to_string(),
        });
        true
    }

    pub fn broadcast_floor_change(&mut self, floor: u32, seed: u64) {
        self.publish(&SyncMessage::FloorChange { floor, seed });
    }

    pub fn broadcast_level_up(&mut self, level: u32) {
        self.publish(&SyncMessage::LevelUp { level });
    }

    pub fn broadcast_effect(&mut self, kind: &str, x: f64, y: f64) {
        self.publish(&SyncMessage::Effect {
            kind: kind.to_string(),
            x: finite_or(x, 0.0),
            y: finite_or(y, 0.0),
        });
    }

    /// React to lifecycle state changes
    pub fn on_connection_state(&mut self, state: ConnectionState) {
        match state {
            ConnectionState::Waiting => {
                if self.guest.is_some() {
                    info!("Guest gone, simulating alone until it returns");
                }
                self.drop_guest();
                self.waiting_for_guest = true;
            }
            ConnectionState::Connected => {
                self.waiting_for_guest = false;
                self.world.guest_presence_changed(true);
            }
            ConnectionState::Disconnected => {
                self.drop_guest();
                self.waiting_for_guest = false;
            }
            ConnectionState::Connecting | ConnectionState::Reconnecting => {}
        }
    }

    pub fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Joined(peer) => {
                if self.guest.as_ref().map(|g| g.peer_id) != Some(peer) {
                    self.guest = Some(GuestRecord::new(peer));
                }
            }
            PeerEvent::Left(peer) => {
                if self.guest.as_ref().map(|g| g.peer_id) == Some(peer) {
                    self.drop_guest();
                }
            }
        }
    }

    fn drop_guest(&mut self) {
        self.rate_limiters.clear();
        if self.guest.take().is_some() {
            self.world.guest_presence_changed(false);
        }
    }

    fn publish(&self, message: &SyncMessage) {
        if let Err(e) = self.bus.broadcast(message) {
            trace!("Broadcast of {} skipped: {}", message.kind(), e);
        }
    }

    fn send_to(&self, message: &SyncMessage, peer: PeerId) {
        if let Err(e) = self.bus.send(message, Some(peer)) {
            debug!("Send of {} to {} failed: {}", message.kind(), peer, e);
        }
    }
}

impl<W: HostWorld> Drop for AuthorityController<W> {
    fn drop(&mut self) {
        if let Some(id) = self.listener.take() {
            self.bus.unsubscribe(id);
        }
        if let Some(hook) = self.hook.take() {
            hook.lifecycle.unsubscribe(hook.state_listener);
            hook.lifecycle.unsubscribe_peers(hook.peer_listener);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{LoopbackHub, Transport};
    use crate::protocol::{decode, RoomCode};
    use crate::sync::world::{AvatarState, DamageOutcome, EnemySnapshot};
    use tokio::sync::broadcast;

    use crate::network::TransportEvent;

    #[derive(Default)]
    struct TestWorld {
        avatar: AvatarState,
        enemies: Vec<EnemySnapshot>,
        effects: Vec<Effect>,
        guest_moves: Vec<(f64, f64)>,
        damage_calls: usize,
    }

    impl HostWorld for TestWorld {
        fn avatar(&self) -> AvatarState {
            self.avatar
        }

        fn live_enemies(&self) -> Vec<EnemySnapshot> {
            self.enemies.clone()
        }

        fn apply_damage(&mut self, enemy: LocalRef, damage: f64) -> Option<DamageOutcome> {
            self.damage_calls += 1;
            let index = self.enemies.iter().position(|e| e.local_ref == enemy)?;
            let e = &mut self.enemies[index];
            e.hp -= damage;
            let outcome = DamageOutcome {
                x: e.x,
                y: e.y,
                hp_remaining: e.hp.max(0.0),
                killed: e.hp <= 0.0,
                enemy_type: e.enemy_type.clone(),
            };
            if outcome.killed {
                self.enemies.remove(index);
            }
            Some(outcome)
        }

        fn move_guest_avatar(&mut self, x: f64, y: f64, _vx: f64, _vy: f64) {
            self.guest_moves.push((x, y));
        }

        fn spawn_effect(&mut self, effect: Effect) {
            self.effects.push(effect);
        }
    }

    fn slime(id: u64, hp: f64) -> EnemySnapshot {
        EnemySnapshot {
            local_ref: LocalRef(id),
            enemy_type: "slime".to_string(),
            x: 100.0,
            y: 100.0,
            hp,
            max_hp: 30.0,
            texture: "slime".to_string(),
            ai_state: "idle".to_string(),
        }
    }

    struct Fixture {
        host: AuthorityController<TestWorld>,
        guest_id: PeerId,
        guest_rx: broadcast::Receiver<TransportEvent>,
        _guest: Arc<crate::network::LoopbackTransport>,
    }

    fn fixture() -> Fixture {
        let hub = LoopbackHub::new();
        let host_transport = hub.connect();
        let guest = hub.connect();
        let code = RoomCode::parse("ROOM").unwrap();
        host_transport.join(&code).unwrap();
        guest.join(&code).unwrap();
        let guest_rx = guest.subscribe();

        let bus = MessageBus::new(host_transport);
        let host = AuthorityController::new(
            TestWorld::default(),
            bus,
            SyncConfig::default(),
            ValidationLimits::default(),
        );
        Fixture {
            host,
            guest_id: guest.local_peer_id(),
            guest_rx,
            _guest: guest,
        }
    }

    fn received(rx: &mut broadcast::Receiver<TransportEvent>) -> Vec<SyncMessage> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let TransportEvent::Message { payload, .. } = event {
                out.push(decode(&payload).unwrap());
            }
        }
        out
    }

    #[test]
    fn test_unknown_enemy_hit_is_silent() {
        let mut f = fixture();
        f.host.world_mut().enemies.push(slime(1, 30.0));
        f.host.broadcast_enemy_update();
        received(&mut f.guest_rx);

        let inbound = Inbound {
            from: f.guest_id,
            message: SyncMessage::Hit {
                enemy_id: "enemy_9".to_string(),
                damage: 50.0,
                critical: false,
            },
        };
        f.host.handle_inbound(&inbound, Instant::now());

        assert_eq!(f.host.world().damage_calls, 0);
        assert_eq!(f.host.world().enemies[0].hp, 30.0);
        assert_eq!(f.host.stats().rejected, 1);
        assert!(received(&mut f.guest_rx).is_empty());
    }

    #[test]
    fn test_guest_kill_is_attributed() {
        let mut f = fixture();
        f.host.world_mut().enemies.push(slime(1, 30.0));
        f.host.broadcast_enemy_update();
        received(&mut f.guest_rx);

        let result = f.host.apply_guest_hit("enemy_1", 30.0, true, f.guest_id);
        assert!(result.is_valid());

        let messages = received(&mut f.guest_rx);
        assert!(matches!(
            messages[0],
            SyncMessage::DamageNumber { damage, critical: true, .. } if damage == 30.0
        ));
        match &messages[1] {
            SyncMessage::EnemyDeath {
                enemy_id, killer, ..
            } => {
                assert_eq!(enemy_id, "enemy_1");
                assert_eq!(*killer, Role::Guest);
            }
            other => panic!("Expected enemy death, got {:?}", other),
        }
        assert_eq!(f.host.registry().lookup("enemy_1"), None);
        assert_eq!(f.host.stats().guest_kills, 1);
        assert!(f.host.world().effects.iter().any(|e| matches!(
            e,
            Effect::EnemyDeath {
                killer: Role::Guest,
                ..
            }
        )));

        // Further claims against the released ID are invalid
        assert!(!f.host.apply_guest_hit("enemy_1", 1.0, false, f.guest_id).is_valid());
    }

    #[test]
    fn test_environmental_death_defaults_to_host() {
        let mut f = fixture();
        f.host.world_mut().enemies.push(slime(4, 30.0));
        f.host.broadcast_enemy_update();
        received(&mut f.guest_rx);

        f.host.on_enemy_death(LocalRef(4), "slime", 10.0, 20.0);
        f.host.on_enemy_death(LocalRef(4), "slime", 10.0, 20.0);

        let deaths: Vec<_> = received(&mut f.guest_rx)
            .into_iter()
            .filter(|m| matches!(m, SyncMessage::EnemyDeath { killer: Role::Host, .. }))
            .collect();
        assert_eq!(deaths.len(), 1);
    }

    #[test]
    fn test_combo_broadcast_from_second_kill() {
        let mut f = fixture();
        for id in 1..=3 {
            f.host.world_mut().enemies.push(slime(id, 30.0));
        }
        f.host.broadcast_enemy_update();
        received(&mut f.guest_rx);

        f.host.on_enemy_death(LocalRef(1), "slime", 0.0, 0.0);
        f.host.tick(Duration::from_millis(1000));
        f.host.on_enemy_death(LocalRef(2), "slime", 0.0, 0.0);
        f.host.tick(Duration::from_millis(1000));
        f.host.on_enemy_death(LocalRef(3), "slime", 0.0, 0.0);

        let combos: Vec<u32> = received(&mut f.guest_rx)
            .into_iter()
            .filter_map(|m| match m {
                SyncMessage::ComboUpdate { count, .. } => Some(count),
                _ => None,
            })
            .collect();
        assert_eq!(combos, vec![2, 3]);
    }

    #[test]
    fn test_host_state_is_sanitized() {
        let mut f = fixture();
        f.host.world_mut().avatar = AvatarState {
            hp: f64::NAN,
            max_hp: f64::INFINITY,
            level: f64::NAN,
            gold: -4.0,
            ..Default::default()
        };
        f.host.broadcast_host_state();

        let messages = received(&mut f.guest_rx);
        assert_eq!(
            messages[0],
            SyncMessage::HostState {
                hp: 0.0,
                max_hp: 1.0,
                level: 1,
                gold: 0
            }
        );
        assert!(matches!(messages[1], SyncMessage::Ping { .. }));
    }

    #[test]
    fn test_enemy_update_releases_vanished_enemies() {
        let mut f = fixture();
        f.host.world_mut().enemies.push(slime(1, 30.0));
        f.host.broadcast_enemy_update();
        assert_eq!(f.host.registry().len(), 1);

        f.host.world_mut().enemies.clear();
        f.host.world_mut().enemies.push(slime(2, 30.0));
        f.host.broadcast_enemy_update();

        assert_eq!(f.host.registry().lookup("enemy_1"), None);
        assert_eq!(f.host.registry().lookup("enemy_2"), Some(LocalRef(2)));
    }

    #[test]
    fn test_position_delta_is_soft() {
        let mut f = fixture();
        assert!(f.host.apply_guest_position(100.0, 100.0, 0.0, 0.0).is_valid());
        // Far jump: flagged in the log, still applied
        assert!(f.host.apply_guest_position(9000.0, 100.0, 0.0, 0.0).is_valid());
        assert!(!f.host.apply_guest_position(-5.0, 100.0, 0.0, 0.0).is_valid());
        assert_eq!(f.host.world().guest_moves, vec![(100.0, 100.0), (9000.0, 100.0)]);
    }

    #[test]
    fn test_rate_limit_runs_first() {
        let mut f = fixture();
        let now = Instant::now();
        let inbound = Inbound {
            from: f.guest_id,
            message: SyncMessage::Position {
                x: 10.0,
                y: 10.0,
                vx: 0.0,
                vy: 0.0,
                anim: None,
                flip_x: false,
            },
        };
        for _ in 0..101 {
            f.host.handle_inbound(&inbound, now);
        }
        assert_eq!(f.host.stats().accepted, 100);
        assert_eq!(f.host.stats().rate_limited, 1);
        assert_eq!(f.host.world().guest_moves.len(), 100);
    }

    #[test]
    fn test_loot_claimed_once() {
        let mut f = fixture();
        let loot_id = f.host.spawn_loot("potion", 5.0, 5.0);
        assert_eq!(loot_id, "loot_1");

        assert!(f.host.claim_loot(&loot_id, Role::Guest).is_valid());
        assert!(!f.host.claim_loot(&loot_id, Role::Host).is_valid());
        assert_eq!(f.host.stats().loot_claimed, 1);
        assert_eq!(f.host.live_loot(), 0);
    }

    #[test]
    fn test_room_clear_revives_dead_guest() {
        let mut f = fixture();
        let died = Inbound {
            from: f.guest_id,
            message: SyncMessage::PlayerDied {
                peer_id: f.guest_id,
            },
        };
        f.host.handle_inbound(&died, Instant::now());
        assert!(f.host.is_guest_dead());

        f.host.broadcast_room_clear(3);
        assert!(!f.host.is_guest_dead());
        let messages = received(&mut f.guest_rx);
        assert!(messages
            .iter()
            .any(|m| matches!(m, SyncMessage::PlayerRevive { peer_id, .. } if *peer_id == f.guest_id)));
    }

    #[test]
    fn test_guest_cannot_send_host_messages() {
        let mut f = fixture();
        let inbound = Inbound {
            from: f.guest_id,
            message: SyncMessage::SceneChange {
                scene: "victory".to_string(),
            },
        };
        f.host.handle_inbound(&inbound, Instant::now());
        assert_eq!(f.host.stats().ignored, 1);
        assert_eq!(f.host.stats().accepted, 0);
    }
}
