//! Host authority and guest mirror wired together over the in-memory transport

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use tandem::network::{
    ConnectionLifecycle, ConnectionState, LifecycleConfig, LoopbackHub, MessageBus, Transport,
};
use tandem::protocol::{PeerId, Role};
use tandem::sync::{
    AuthorityController, AvatarState, DamageOutcome, Effect, EnemySnapshot, GuestWorld, HostWorld,
    LocalRef, MirrorController, Overlay, ProxyView, SyncConfig, ValidationLimits,
};

#[derive(Default)]
struct HostSide {
    avatar: AvatarState,
    enemies: Vec<EnemySnapshot>,
    effects: Vec<Effect>,
    guest_present: Vec<bool>,
    guest_inventory: Option<serde_json::Value>,
}

impl HostWorld for HostSide {
    fn avatar(&self) -> AvatarState {
        self.avatar
    }

    fn live_enemies(&self) -> Vec<EnemySnapshot> {
        self.enemies.clone()
    }

    fn apply_damage(&mut self, enemy: LocalRef, damage: f64) -> Option<DamageOutcome> {
        let index = self.enemies.iter().position(|e| e.local_ref == enemy)?;
        let target = &mut self.enemies[index];
        target.hp -= damage;
        let outcome = DamageOutcome {
            x: target.x,
            y: target.y,
            hp_remaining: target.hp.max(0.0),
            killed: target.hp <= 0.0,
            enemy_type: target.enemy_type.clone(),
        };
        if outcome.killed {
            self.enemies.remove(index);
        }
        Some(outcome)
    }

    fn move_guest_avatar(&mut self, _x: f64, _y: f64, _vx: f64, _vy: f64) {}

    fn spawn_effect(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    fn guest_presence_changed(&mut self, present: bool) {
        self.guest_present.push(present);
    }

    fn set_guest_inventory(&mut self, inventory: serde_json::Value) {
        self.guest_inventory = Some(inventory);
    }
}

#[derive(Default)]
struct GuestSide {
    avatar: AvatarState,
    effects: Vec<Effect>,
    faded: Vec<String>,
    overlays: Vec<Overlay>,
    menu: bool,
    revived_hp: Option<f64>,
    host_stats: Option<(f64, f64, u32, u64)>,
}

impl GuestWorld for GuestSide {
    fn avatar(&self) -> AvatarState {
        self.avatar
    }

    fn teleport_avatar(&mut self, x: f64, y: f64) {
        self.avatar.x = x;
        self.avatar.y = y;
    }

    fn room_at(&self, x: f64, _y: f64) -> Option<u32> {
        Some((x / 500.0).floor().max(0.0) as u32)
    }

    fn render_host(&mut self, _view: &ProxyView<'_>) {}

    fn render_enemy(&mut self, _enemy_id: &str, _view: &ProxyView<'_>) {}

    fn fade_out_enemy(&mut self, enemy_id: &str, _fade: Duration) {
        self.faded.push(enemy_id.to_string());
    }

    fn spawn_effect(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    fn set_spectating(&mut self, _spectating: bool) {}

    fn follow_camera(&mut self, _x: f64, _y: f64) {}

    fn set_overlay(&mut self, overlay: Overlay) {
        self.overlays.push(overlay);
    }

    fn return_to_menu(&mut self) {
        self.menu = true;
    }

    fn revive(&mut self, hp: f64) {
        self.revived_hp = Some(hp);
    }

    fn change_scene(&mut self, _scene: &str) {}

    fn update_host_stats(&mut self, hp: f64, max_hp: f64, level: u32, gold: u64) {
        self.host_stats = Some((hp, max_hp, level, gold));
    }
}

fn slime(id: u64, x: f64) -> EnemySnapshot {
    EnemySnapshot {
        local_ref: LocalRef(id),
        enemy_type: "slime".to_string(),
        x,
        y: 100.0,
        hp: 30.0,
        max_hp: 30.0,
        texture: "slime_green".to_string(),
        ai_state: "idle".to_string(),
    }
}

struct Session {
    hub: Arc<LoopbackHub>,
    host: Arc<Mutex<AuthorityController<HostSide>>>,
    guest: Arc<Mutex<MirrorController<GuestSide>>>,
    host_lifecycle: Arc<ConnectionLifecycle>,
    guest_lifecycle: Arc<ConnectionLifecycle>,
    host_peer: PeerId,
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

async fn session() -> Session {
    let hub = LoopbackHub::new();
    let host_transport = hub.connect();
    let guest_transport = hub.connect();
    let host_peer = host_transport.local_peer_id();

    let host_lifecycle = Arc::new(ConnectionLifecycle::new(
        host_transport.clone(),
        LifecycleConfig::default(),
    ));
    let guest_lifecycle = Arc::new(ConnectionLifecycle::new(
        guest_transport.clone(),
        LifecycleConfig::default(),
    ));

    let host_bus = MessageBus::new(host_transport);
    host_bus.start_receive_loop();
    let guest_bus = MessageBus::new(guest_transport);
    guest_bus.start_receive_loop();

    let host = Arc::new(Mutex::new(AuthorityController::new(
        HostSide::default(),
        host_bus,
        SyncConfig::default(),
        ValidationLimits::default(),
    )));
    AuthorityController::attach(&host);
    AuthorityController::attach_lifecycle(&host, host_lifecycle.clone());

    let guest = Arc::new(Mutex::new(MirrorController::new(
        GuestSide::default(),
        guest_bus,
        SyncConfig::default(),
    )));
    MirrorController::attach(&guest);
    MirrorController::attach_lifecycle(&guest, guest_lifecycle.clone());

    let code = host_lifecycle.host_session().await.unwrap();
    guest_lifecycle.join_session(code.as_str()).await.unwrap();
    settle().await;

    Session {
        hub,
        host,
        guest,
        host_lifecycle,
        guest_lifecycle,
        host_peer,
    }
}

/// Test: Enemy batch reaches the guest and a guest kill comes back
/// Given a host with one enemy broadcast to the guest
/// When the guest lands a killing hit
/// Then the host credits the guest and the guest proxy disappears
#[tokio::test(start_paused = true)]
async fn test_guest_kill_round_trip() {
    let s = session().await;
    assert!(s.host.lock().guest_peer().is_some());

    s.host.lock().world_mut().enemies.push(slime(1, 100.0));
    s.host.lock().tick(Duration::from_millis(50));
    settle().await;
    assert_eq!(s.guest.lock().enemy_count(), 1);
    assert!(s.guest.lock().enemy("enemy_1").is_some());

    s.guest.lock().send_hit("enemy_1", 30.0, false);
    settle().await;

    let host = s.host.lock();
    assert_eq!(host.stats().guest_kills, 1);
    assert!(host.world().enemies.is_empty());
    drop(host);

    let guest = s.guest.lock();
    assert_eq!(guest.enemy_count(), 0);
    assert_eq!(guest.world().faded, vec!["enemy_1".to_string()]);
    assert!(guest.world().effects.iter().any(|e| matches!(
        e,
        Effect::EnemyDeath {
            killer: Role::Guest,
            ..
        }
    )));
    assert!(guest
        .world()
        .effects
        .iter()
        .any(|e| matches!(e, Effect::DamageNumber { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_hit_on_unknown_enemy_changes_nothing() {
    let s = session().await;
    s.host.lock().world_mut().enemies.push(slime(1, 100.0));
    s.host.lock().broadcast_enemy_update();
    settle().await;

    s.guest.lock().send_hit("enemy_9", 50.0, false);
    settle().await;

    let host = s.host.lock();
    assert_eq!(host.world().enemies[0].hp, 30.0);
    assert_eq!(host.stats().rejected, 1);
    assert!(host.world().effects.is_empty());
    drop(host);

    let guest = s.guest.lock();
    assert!(!guest
        .world()
        .effects
        .iter()
        .any(|e| matches!(e, Effect::DamageNumber { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_broadcast_cadences() {
    let s = session().await;
    s.host.lock().world_mut().avatar = AvatarState {
        x: 250.0,
        y: 250.0,
        hp: 80.0,
        max_hp: 100.0,
        level: 3.0,
        gold: 12.0,
        ..Default::default()
    };

    for _ in 0..60 {
        s.host.lock().tick(Duration::from_millis(17));
    }
    settle().await;

    let host = s.host.lock();
    // ~1020ms of frames: 20 enemy batches, one host-state
    assert_eq!(host.stats().enemy_broadcasts, 20);
    assert_eq!(host.stats().host_state_broadcasts, 1);
    drop(host);

    let guest = s.guest.lock();
    assert_eq!(guest.world().host_stats, Some((80.0, 100.0, 3, 12)));
    assert!(guest.host_proxy().seen);
    assert_eq!(guest.host_proxy().target_x, 250.0);
}

#[tokio::test(start_paused = true)]
async fn test_room_activation_grows_tether() {
    let s = session().await;
    s.host.lock().world_mut().avatar.x = 2600.0;
    s.host.lock().world_mut().avatar.y = 100.0;

    s.guest.lock().world_mut().avatar.x = 2600.0;
    s.guest.lock().update(Duration::from_millis(16));
    assert_eq!(s.guest.lock().tether_corrections(), 1);

    s.host.lock().broadcast_room_activated(5);
    settle().await;

    let mut guest = s.guest.lock();
    assert!(guest.tether().is_visited(5));
    assert_eq!(guest.world().avatar.x, 2600.0);
    guest.update(Duration::from_millis(16));
    assert_eq!(guest.tether_corrections(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_guest_death_revived_on_room_clear() {
    let s = session().await;
    s.guest.lock().report_local_death();
    settle().await;
    assert!(s.host.lock().is_guest_dead());
    assert!(s.guest.lock().is_spectating());

    s.host.lock().broadcast_room_clear(1);
    settle().await;
    assert!(!s.guest.lock().is_spectating());
    assert!(!s.host.lock().is_guest_dead());
    // Half of the default 100 max hp
    assert_eq!(s.guest.lock().world().revived_hp, Some(50.0));
}

#[tokio::test(start_paused = true)]
async fn test_loot_and_inventory() {
    let s = session().await;
    let loot_id = s.host.lock().spawn_loot("potion", 120.0, 80.0);
    settle().await;
    assert_eq!(s.guest.lock().visible_loot(), 1);

    s.guest.lock().claim_loot(&loot_id);
    s.guest.lock().claim_loot(&loot_id);
    settle().await;
    assert_eq!(s.host.lock().stats().loot_claimed, 1);
    assert_eq!(s.guest.lock().visible_loot(), 0);

    s.guest.lock().send_inventory(&json!({"slots": ["potion"]}));
    settle().await;
    assert_eq!(
        s.host.lock().world().guest_inventory,
        Some(json!({"slots": ["potion"]}))
    );

    s.host.lock().send_inventory(&json!({"gold": 40}));
    settle().await;
    assert_eq!(s.guest.lock().inventory(), Some(&json!({"gold": 40})));
}

#[tokio::test(start_paused = true)]
async fn test_guest_overlay_through_lost_host() {
    let s = session().await;
    s.hub.drop_peer(s.host_peer);
    settle().await;

    assert_eq!(s.guest_lifecycle.state(), ConnectionState::Reconnecting);
    assert_eq!(s.guest.lock().overlay(), Overlay::Reconnecting);
    assert!(s.host.lock().is_waiting_for_guest());
    assert_eq!(s.host.lock().world().guest_present, vec![true, false]);

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(s.guest_lifecycle.state(), ConnectionState::Disconnected);
    assert_eq!(s.guest.lock().overlay(), Overlay::ConnectionLost);
    assert_eq!(
        s.guest.lock().world().overlays,
        vec![Overlay::Reconnecting, Overlay::ConnectionLost]
    );

    s.guest.lock().update(Duration::from_secs(3));
    assert!(s.guest.lock().world().menu);
    assert_eq!(s.host_lifecycle.state(), ConnectionState::Waiting);
}

/// Test: Leaving during reconnection is not a connection loss
/// Given a guest reconnecting after its host vanished
/// When the player disconnects on purpose
/// Then the banner clears and the game never forces the menu
#[tokio::test(start_paused = true)]
async fn test_leaving_while_reconnecting_shows_no_loss() {
    let s = session().await;
    s.hub.drop_peer(s.host_peer);
    settle().await;
    assert_eq!(s.guest.lock().overlay(), Overlay::Reconnecting);

    s.guest_lifecycle.disconnect();
    assert_eq!(s.guest_lifecycle.state(), ConnectionState::Disconnected);
    assert_eq!(s.guest.lock().overlay(), Overlay::None);
    assert_eq!(
        s.guest.lock().world().overlays,
        vec![Overlay::Reconnecting, Overlay::None]
    );

    s.guest.lock().update(Duration::from_secs(10));
    assert!(!s.guest.lock().world().menu);
}

#[tokio::test(start_paused = true)]
async fn test_destroy_detaches_controllers() {
    let s = session().await;
    s.host.lock().destroy();
    s.host.lock().world_mut().enemies.push(slime(1, 100.0));

    s.guest.lock().send_hit("enemy_1", 10.0, false);
    settle().await;
    assert_eq!(s.host.lock().stats().accepted, 0);
    assert_eq!(s.host.lock().stats().rejected, 0);
}
