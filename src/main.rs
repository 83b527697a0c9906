//! tandem - Host-authoritative two-player session sync

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use tandem::network::{ConnectionLifecycle, LoopbackHub, MessageBus, RelayTransport, Transport};
use tandem::sync::{
    AuthorityController, AuthorityStats, AvatarState, DamageOutcome, Effect, EnemySnapshot,
    GuestWorld, HostWorld, LocalRef, MirrorController, Overlay, ProxyView,
};
use tandem::TandemConfig;

/// Simulation frame length
const FRAME: Duration = Duration::from_millis(16);

/// Width of one room strip in the demo dungeon
const ROOM_WIDTH: f64 = 500.0;

const MAX_DEMO_ENEMIES: usize = 5;

#[derive(Parser)]
#[command(name = "tandem")]
#[command(about = "Host-authoritative two-player session sync")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Host a room on a relay server
    Host {
        /// Relay server URL (e.g., ws://localhost:8080)
        #[arg(short, long, env = "TANDEM_SERVER")]
        server: String,
    },

    /// Join a room on a relay server
    Join {
        /// Relay server URL (e.g., ws://localhost:8080)
        #[arg(short, long, env = "TANDEM_SERVER")]
        server: String,

        /// Room code shown by the host
        code: String,
    },

    /// Run host and guest in one process over an in-memory transport
    Demo {
        /// How long to run
        #[arg(long, default_value = "10")]
        seconds: u64,
    },
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    // RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

fn load_config(path: Option<&PathBuf>) -> Result<TandemConfig> {
    match path {
        Some(path) => TandemConfig::load(path)
            .with_context(|| format!("Failed to load config from {:?}", path)),
        None => Ok(TandemConfig::default()),
    }
}

/// Toy host world: the host walks right through room strips while enemies
/// spawn around it and take hits
struct DemoHostWorld {
    rng: StdRng,
    avatar: AvatarState,
    enemies: Vec<EnemySnapshot>,
    next_ref: u64,
    spawn_timer: Duration,
    swing_timer: Duration,
}

impl DemoHostWorld {
    fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
            avatar: AvatarState {
                x: ROOM_WIDTH / 2.0,
                y: 250.0,
                vx: 40.0,
                vy: 0.0,
                hp: 100.0,
                max_hp: 100.0,
                level: 1.0,
                gold: 0.0,
            },
            enemies: Vec::new(),
            next_ref: 1,
            spawn_timer: Duration::ZERO,
            swing_timer: Duration::ZERO,
        }
    }

    fn current_room(&self) -> u32 {
        (self.avatar.x / ROOM_WIDTH).floor().max(0.0) as u32
    }

    /// Advance the world; returns the enemy the host struck, if any
    fn step(&mut self, dt: Duration) -> Option<LocalRef> {
        let secs = dt.as_secs_f64();
        self.avatar.x = (self.avatar.x + self.avatar.vx * secs).min(9_999.0);

        for enemy in &mut self.enemies {
            enemy.x = (enemy.x + self.rng.gen_range(-30.0..30.0) * secs).clamp(0.0, 10_000.0);
            enemy.y = (enemy.y + self.rng.gen_range(-30.0..30.0) * secs).clamp(0.0, 10_000.0);
        }

        self.spawn_timer += dt;
        if self.spawn_timer >= Duration::from_secs(2) && self.enemies.len() < MAX_DEMO_ENEMIES {
            self.spawn_timer = Duration::ZERO;
            let local_ref = LocalRef(self.next_ref);
            self.next_ref += 1;
            self.enemies.push(EnemySnapshot {
                local_ref,
                enemy_type: "slime".to_string(),
                x: self.avatar.x + self.rng.gen_range(-200.0..200.0),
                y: self.rng.gen_range(100.0..400.0),
                hp: 30.0,
                max_hp: 30.0,
                texture: "slime_green".to_string(),
                ai_state: "wander".to_string(),
            });
        }

        self.swing_timer += dt;
        if self.swing_timer >= Duration::from_secs(1) && !self.enemies.is_empty() {
            self.swing_timer = Duration::ZERO;
            let index = self.rng.gen_range(0..self.enemies.len());
            return Some(self.enemies[index].local_ref);
        }
        None
    }
}

impl HostWorld for DemoHostWorld {
    fn avatar(&self) -> AvatarState {
        self.avatar
    }

    fn live_enemies(&self) -> Vec<EnemySnapshot> {
        self.enemies.clone()
    }

    fn apply_damage(&mut self, enemy: LocalRef, damage: f64) -> Option<DamageOutcome> {
        let index = self.enemies.iter().position(|e| e.local_ref == enemy)?;
        let target = &mut self.enemies[index];
        target.hp = (target.hp - damage).max(0.0);
        let outcome = DamageOutcome {
            x: target.x,
            y: target.y,
            hp_remaining: target.hp,
            killed: target.hp <= 0.0,
            enemy_type: target.enemy_type.clone(),
        };
        if outcome.killed {
            self.enemies.remove(index);
            self.avatar.gold += 5.0;
        }
        Some(outcome)
    }

    fn move_guest_avatar(&mut self, x: f64, y: f64, _vx: f64, _vy: f64) {
        debug!("Guest at ({:.0}, {:.0})", x, y);
    }

    fn spawn_effect(&mut self, effect: Effect) {
        debug!("Host effect: {:?}", effect);
    }

    fn guest_presence_changed(&mut self, present: bool) {
        info!("Guest {}", if present { "joined" } else { "left" });
    }
}

/// Toy guest world: the guest trails the host proxy and tries to run ahead
struct DemoGuestWorld {
    rng: StdRng,
    avatar: AvatarState,
    goal: Option<(f64, f64)>,
}

impl DemoGuestWorld {
    fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
            avatar: AvatarState {
                x: ROOM_WIDTH / 2.0 - 60.0,
                y: 250.0,
                hp: 80.0,
                max_hp: 80.0,
                level: 1.0,
                ..Default::default()
            },
            goal: None,
        }
    }

    fn step(&mut self, dt: Duration) {
        let Some((gx, gy)) = self.goal else {
            return;
        };
        let secs = dt.as_secs_f64();
        // Overshoots on purpose now and then so the tether has work to do
        let ahead = self.rng.gen_range(-80.0..160.0);
        self.avatar.vx = (gx + ahead - self.avatar.x) * 2.0;
        self.avatar.vy = (gy - self.avatar.y) * 2.0;
        self.avatar.x += self.avatar.vx * secs;
        self.avatar.y += self.avatar.vy * secs;
    }
}

impl GuestWorld for DemoGuestWorld {
    fn avatar(&self) -> AvatarState {
        self.avatar
    }

    fn teleport_avatar(&mut self, x: f64, y: f64) {
        self.avatar.x = x;
        self.avatar.y = y;
        self.avatar.vx = 0.0;
        self.avatar.vy = 0.0;
    }

    fn room_at(&self, x: f64, _y: f64) -> Option<u32> {
        (x >= 0.0).then(|| (x / ROOM_WIDTH).floor() as u32)
    }

    fn render_host(&mut self, view: &ProxyView<'_>) {
        self.goal = Some((view.x, view.y));
    }

    fn render_enemy(&mut self, _enemy_id: &str, _view: &ProxyView<'_>) {}

    fn fade_out_enemy(&mut self, enemy_id: &str, fade: Duration) {
        debug!("Fading out {} over {:?}", enemy_id, fade);
    }

    fn spawn_effect(&mut self, effect: Effect) {
        match effect {
            Effect::Combo { count, killer } => info!("Combo x{} ({})", count, killer),
            Effect::EnemyDeath {
                enemy_type, killer, ..
            } => info!("{} killed by {}", enemy_type, killer),
            other => debug!("Guest effect: {:?}", other),
        }
    }

    fn set_spectating(&mut self, spectating: bool) {
        info!("Spectating: {}", spectating);
    }

    fn follow_camera(&mut self, _x: f64, _y: f64) {}

    fn set_overlay(&mut self, overlay: Overlay) {
        match overlay {
            Overlay::None => info!("Connection restored"),
            Overlay::Reconnecting => info!("Reconnecting to host..."),
            Overlay::ConnectionLost => info!("Connection lost"),
        }
    }

    fn return_to_menu(&mut self) {
        info!("Returning to title screen");
    }

    fn revive(&mut self, hp: f64) {
        self.avatar.hp = hp;
    }

    fn change_scene(&mut self, scene: &str) {
        info!("Scene -> {}", scene);
    }

    fn update_host_stats(&mut self, hp: f64, max_hp: f64, level: u32, gold: u64) {
        debug!("Host hp {}/{} level {} gold {}", hp, max_hp, level, gold);
    }
}

type HostController = Arc<Mutex<AuthorityController<DemoHostWorld>>>;
type GuestController = Arc<Mutex<MirrorController<DemoGuestWorld>>>;

fn start_host(
    transport: Arc<dyn Transport>,
    lifecycle: Arc<ConnectionLifecycle>,
    config: &TandemConfig,
) -> HostController {
    let bus = MessageBus::new(transport);
    bus.start_receive_loop();
    let controller = Arc::new(Mutex::new(AuthorityController::new(
        DemoHostWorld::new(),
        bus,
        config.sync.clone(),
        config.limits.clone(),
    )));
    AuthorityController::attach(&controller);
    AuthorityController::attach_lifecycle(&controller, lifecycle);
    controller
}

fn start_guest(
    transport: Arc<dyn Transport>,
    lifecycle: Arc<ConnectionLifecycle>,
    config: &TandemConfig,
) -> GuestController {
    let bus = MessageBus::new(transport);
    bus.start_receive_loop();
    let controller = Arc::new(Mutex::new(MirrorController::new(
        DemoGuestWorld::new(),
        bus,
        config.sync.clone(),
    )));
    MirrorController::attach(&controller);
    MirrorController::attach_lifecycle(&controller, lifecycle);
    controller
}

/// One host frame: world step, hits, deaths, room unlocks and broadcasts
fn host_frame(controller: &HostController, activated: &mut u32) {
    let mut host = controller.lock();
    if let Some(target) = host.world_mut().step(FRAME) {
        host.record_host_hit(target);
        if let Some(outcome) = host.world_mut().apply_damage(target, 12.0) {
            if outcome.killed {
                host.on_enemy_death(target, &outcome.enemy_type, outcome.x, outcome.y);
                host.spawn_loot("coin", outcome.x, outcome.y);
            }
        }
    }

    let room = host.world().current_room();
    if room > *activated {
        *activated = room;
        host.broadcast_room_activated(room);
    }
    host.tick(FRAME);
}

/// One guest frame: steer, mirror update and a hit on some visible enemy
fn guest_frame(controller: &GuestController, swing: &mut Duration, rng: &mut StdRng) {
    let mut guest = controller.lock();
    guest.world_mut().step(FRAME);
    guest.update(FRAME);

    *swing += FRAME;
    if *swing >= Duration::from_millis(700) {
        *swing = Duration::ZERO;
        let ids: Vec<String> = guest.enemies().map(|(id, _)| id.to_string()).collect();
        if !ids.is_empty() {
            let id = &ids[rng.gen_range(0..ids.len())];
            guest.send_hit(id, 9.0, rng.gen_bool(0.1));
        }
    }
}

fn print_host_stats(stats: &AuthorityStats) {
    println!("\n=== Session Statistics ===");
    println!("Guest messages accepted: {}", stats.accepted);
    println!("Guest messages rejected: {}", stats.rejected);
    println!("Rate limited:            {}", stats.rate_limited);
    println!("Kills (host/guest):      {}/{}", stats.host_kills, stats.guest_kills);
    println!(
        "Loot (spawned/claimed):  {}/{}",
        stats.loot_spawned, stats.loot_claimed
    );
    println!("Enemy broadcasts:        {}", stats.enemy_broadcasts);
}

async fn run_host(server: String, config: TandemConfig) -> Result<()> {
    info!("Connecting to relay {}", server);
    let transport = RelayTransport::connect(&server).await?;
    let lifecycle = Arc::new(ConnectionLifecycle::new(
        transport.clone(),
        config.lifecycle.clone(),
    ));
    let controller = start_host(transport, lifecycle.clone(), &config);

    let code = lifecycle.host_session().await?;
    println!("\nHosting room {}. Share this code with your guest.", code);
    println!("Press Ctrl+C to stop.\n");

    let mut interval = tokio::time::interval(FRAME);
    let mut activated = 0;
    loop {
        tokio::select! {
            _ = interval.tick() => host_frame(&controller, &mut activated),
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Shutting down...");
    lifecycle.disconnect();
    let mut host = controller.lock();
    print_host_stats(host.stats());
    host.destroy();
    Ok(())
}

async fn run_join(server: String, code: String, config: TandemConfig) -> Result<()> {
    info!("Connecting to relay {}", server);
    let transport = RelayTransport::connect(&server).await?;
    let lifecycle = Arc::new(ConnectionLifecycle::new(
        transport.clone(),
        config.lifecycle.clone(),
    ));
    let controller = start_guest(transport, lifecycle.clone(), &config);

    lifecycle.join_session(&code).await?;
    println!("\nJoined room {}. Press Ctrl+C to leave.\n", code.to_uppercase());

    let mut interval = tokio::time::interval(FRAME);
    let mut swing = Duration::ZERO;
    let mut rng = StdRng::from_entropy();
    let lost = loop {
        tokio::select! {
            _ = interval.tick() => {
                guest_frame(&controller, &mut swing, &mut rng);
                if let Some(e) = lifecycle.disconnect_cause().and_then(|c| c.error()) {
                    break Some(e);
                }
            }
            _ = tokio::signal::ctrl_c() => break None,
        }
    };

    info!("Leaving room...");
    lifecycle.disconnect();
    let mut guest = controller.lock();
    println!("\nTether corrections: {}", guest.tether_corrections());
    println!("RTT: {:.1}ms", guest.latency().rtt_ms());
    guest.destroy();
    match lost {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

async fn run_demo(seconds: u64, config: TandemConfig) -> Result<()> {
    let hub = LoopbackHub::new();
    let host_transport = hub.connect();
    let guest_transport = hub.connect();

    let host_lifecycle = Arc::new(ConnectionLifecycle::new(
        host_transport.clone(),
        config.lifecycle.clone(),
    ));
    let guest_lifecycle = Arc::new(ConnectionLifecycle::new(
        guest_transport.clone(),
        config.lifecycle.clone(),
    ));
    let host = start_host(host_transport, host_lifecycle.clone(), &config);
    let guest = start_guest(guest_transport, guest_lifecycle.clone(), &config);

    let code = host_lifecycle.host_session().await?;
    info!("Demo room {}", code);
    guest_lifecycle.join_session(code.as_str()).await?;

    let mut interval = tokio::time::interval(FRAME);
    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);
    let mut activated = 0;
    let mut swing = Duration::ZERO;
    let mut rng = StdRng::from_entropy();
    loop {
        tokio::select! {
            _ = interval.tick() => {
                host_frame(&host, &mut activated);
                guest_frame(&guest, &mut swing, &mut rng);
            }
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    guest_lifecycle.disconnect();
    host_lifecycle.disconnect();

    let host = host.lock();
    print_host_stats(host.stats());
    let guest = guest.lock();
    println!("Tether corrections:      {}", guest.tether_corrections());
    println!("Rooms unlocked:          {}", guest.tether().visited_count());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Host { server } => run_host(server, config).await?,
        Commands::Join { server, code } => run_join(server, code, config).await?,
        Commands::Demo { seconds } => run_demo(seconds, config).await?,
    }

    Ok(())
}
