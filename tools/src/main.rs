use std::collections::VecDeque;
use std::path::PathBuf;

use character_collision::RapierCollision;
use character_movement::{ConfigError, MovementConfig, MovementContext, MovementMode};
use clap::{Parser, Subcommand};
use client::{ClientError, ClientStats, PredictionClient};
use net_protocol::{NetConfig, ProtocolError};
use physics_rapier::PhysicsWorld;
use player_controller::{InputIntent, VrCharacter};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rapier3d::math::Vector;
use rapier3d::prelude::Real;
use server::{AuthorityServer, ServerError, SessionStats};
use test_map::{TestMap, TestMapError};
use thiserror::Error;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const EXIT_SUCCESS: i32 = 0;
const EXIT_USAGE: i32 = 2;
const EXIT_CONFIG: i32 = 10;
const EXIT_MAP: i32 = 11;
const EXIT_SIM: i32 = 12;

const CAPSULE_RADIUS: Real = 34.0;
const CAPSULE_HALF_HEIGHT: Real = 88.0;
const HEAD_HEIGHT: Real = 160.0;
const CONNECTION: server::ConnectionId = 1;

#[derive(Parser)]
#[command(name = "tools", version, about = "VR movement replication tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a predicting client against the server over a simulated link.
    Movesim(MovesimArgs),
    /// Validate movement and network config files.
    CheckConfig(CheckConfigArgs),
}

#[derive(Parser)]
struct MovesimArgs {
    #[arg(long, default_value_t = 600)]
    ticks: u32,

    #[arg(long, default_value_t = 90.0)]
    tick_rate: f32,

    /// One-way link latency.
    #[arg(long, default_value_t = 50)]
    latency_ms: u32,

    /// Packet loss probability per direction.
    #[arg(long, default_value_t = 0.0)]
    loss: f64,

    #[arg(long, default_value_t = 1)]
    seed: u64,

    #[arg(long, value_name = "PATH")]
    map: Option<PathBuf>,

    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "PATH")]
    net_config: Option<PathBuf>,
}

#[derive(Parser)]
struct CheckConfigArgs {
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "PATH")]
    net_config: Option<PathBuf>,
}

#[derive(Debug, Error)]
enum SimError {
    #[error(transparent)]
    Map(#[from] TestMapError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Server(#[from] ServerError),
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match cli.command {
        Commands::Movesim(args) => run_movesim(args),
        Commands::CheckConfig(args) => run_check_config(args),
    };
    std::process::exit(exit_code);
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

fn run_check_config(args: CheckConfigArgs) -> i32 {
    if args.config.is_none() && args.net_config.is_none() {
        eprintln!("nothing to check: pass --config and/or --net-config");
        return EXIT_USAGE;
    }
    if let Some(path) = args.config {
        match MovementConfig::load(&path) {
            Ok(config) => println!(
                "{}: ok (walkable angle {:.1} deg, step height {}, gravity {})",
                path.display(),
                config.walkable_floor_angle(),
                config.max_step_height,
                config.gravity_z()
            ),
            Err(err) => {
                eprintln!("{}: {}", path.display(), err);
                return EXIT_CONFIG;
            }
        }
    }
    if let Some(path) = args.net_config {
        match NetConfig::load(&path) {
            Ok(config) => println!(
                "{}: ok (send delta {:.4} s, {} saved moves)",
                path.display(),
                config.clamped_send_delta_time(),
                config.max_saved_moves
            ),
            Err(err) => {
                eprintln!("{}: {}", path.display(), err);
                return EXIT_CONFIG;
            }
        }
    }
    EXIT_SUCCESS
}

fn run_movesim(args: MovesimArgs) -> i32 {
    if !(0.0..=1.0).contains(&args.loss) {
        eprintln!("--loss must be between 0 and 1");
        return EXIT_USAGE;
    }
    if !args.tick_rate.is_finite() || args.tick_rate <= 0.0 {
        eprintln!("--tick-rate must be positive");
        return EXIT_USAGE;
    }
    match simulate(&args) {
        Ok(report) => {
            report.print();
            EXIT_SUCCESS
        }
        Err(SimError::Map(err)) => {
            eprintln!("{err}");
            EXIT_MAP
        }
        Err(SimError::Config(err)) => {
            eprintln!("{err}");
            EXIT_CONFIG
        }
        Err(err) => {
            eprintln!("movesim failed: {err}");
            EXIT_SIM
        }
    }
}

/// One direction of a link with fixed latency and random loss.
struct LinkSimulator {
    latency: f32,
    loss: f64,
    rng: ChaCha8Rng,
    in_flight: VecDeque<(f32, Vec<u8>)>,
    sent: u64,
    dropped: u64,
}

impl LinkSimulator {
    fn new(latency: f32, loss: f64, seed: u64) -> Self {
        Self {
            latency,
            loss,
            rng: ChaCha8Rng::seed_from_u64(seed),
            in_flight: VecDeque::new(),
            sent: 0,
            dropped: 0,
        }
    }

    fn send(&mut self, now: f32, packet: Vec<u8>) {
        self.sent += 1;
        if self.loss > 0.0 && self.rng.gen_bool(self.loss) {
            self.dropped += 1;
            return;
        }
        self.in_flight.push_back((now + self.latency, packet));
    }

    fn deliver(&mut self, now: f32) -> Vec<Vec<u8>> {
        let mut ready = Vec::new();
        while let Some((deliver_at, _)) = self.in_flight.front() {
            if *deliver_at > now {
                break;
            }
            if let Some((_, packet)) = self.in_flight.pop_front() {
                ready.push(packet);
            }
        }
        ready
    }
}

struct SimReport {
    ticks: u32,
    client: ClientStats,
    server: SessionStats,
    up_dropped: u64,
    up_sent: u64,
    down_dropped: u64,
    down_sent: u64,
    rejected_packets: u64,
    divergence: Real,
    final_location: Vector<Real>,
}

impl SimReport {
    fn print(&self) {
        println!("movesim: {} ticks", self.ticks);
        println!(
            "client: {} moves, {} combined, {} delayed, {} packets, {} old moves",
            self.client.moves,
            self.client.combined_moves,
            self.client.delayed_moves,
            self.client.packets_sent,
            self.client.old_moves_sent
        );
        println!(
            "client: {} acks, {} corrections, {} stale, {} replayed",
            self.client.acks,
            self.client.corrections,
            self.client.stale_adjustments,
            self.client.replayed_moves
        );
        println!(
            "server: {} moves, {} old moves, {} rejected, {} corrections ({} deferred)",
            self.server.moves,
            self.server.old_moves,
            self.server.rejected_moves,
            self.server.corrections,
            self.server.deferred_corrections
        );
        println!(
            "link: up {}/{} dropped, down {}/{} dropped, {} rejected packets",
            self.up_dropped, self.up_sent, self.down_dropped, self.down_sent, self.rejected_packets
        );
        println!(
            "final client location ({:.1}, {:.1}, {:.1}), divergence {:.2}",
            self.final_location.x, self.final_location.y, self.final_location.z, self.divergence
        );
    }
}

/// Walk forward, snap turn every few seconds, jump now and then and sway
/// the head.
fn scripted_intent(tick: u32, time: f32) -> InputIntent {
    InputIntent {
        move_axis: [0.0, 1.0],
        jump: tick % 150 == 75,
        snap_turn: (tick % 240 == 239).then_some(45.0),
        tracked_location: Vector::new(
            (time * 1.3).sin() * 8.0,
            (time * 0.7).cos() * 4.0,
            HEAD_HEIGHT,
        ),
        ..InputIntent::default()
    }
}

fn simulate(args: &MovesimArgs) -> Result<SimReport, SimError> {
    let map = match &args.map {
        Some(path) => TestMap::load(path)?,
        None => TestMap::proving_ground()?,
    };
    let movement_config = match &args.config {
        Some(path) => MovementConfig::load(path)?,
        None => MovementConfig::default(),
    };
    let net_config = match &args.net_config {
        Some(path) => NetConfig::load(path)?,
        None => NetConfig::default(),
    };

    let mut world = PhysicsWorld::z_up();
    let loaded = map.load_into(&mut world)?;
    info!(map = %map.name, ticks = args.ticks, latency_ms = args.latency_ms, loss = args.loss, "movesim starting");

    let dt = 1.0 / args.tick_rate;
    let latency = args.latency_ms as f32 / 1000.0;
    let mut up = LinkSimulator::new(latency, args.loss, args.seed);
    let mut down = LinkSimulator::new(latency, args.loss, args.seed.wrapping_add(1));

    let spawn_character = |ctx: &MovementContext<'_>| {
        let mut character = VrCharacter::new(
            movement_config.clone(),
            loaded.spawn_origin,
            loaded.spawn_yaw,
            CAPSULE_RADIUS,
            CAPSULE_HALF_HEIGHT,
        );
        character
            .movement_mut()
            .set_movement_mode(ctx, MovementMode::Falling);
        character
    };

    let mut server = AuthorityServer::new(net_config.clone());
    let mut client = {
        let collision = RapierCollision::new(&world);
        let ctx = MovementContext::new(&collision);
        server.connect(CONNECTION, spawn_character(&ctx))?;
        PredictionClient::new(spawn_character(&ctx), net_config)
    };

    let mut rejected_packets = 0;
    for tick in 0..args.ticks {
        let now = tick as f32 * dt;
        loaded.drive_platforms(&mut world, now, dt);
        world.step(dt);

        let collision = RapierCollision::new(&world);
        let ctx = MovementContext::new(&collision);

        client.tick(&ctx, &scripted_intent(tick, now), dt, now)?;
        for packet in client.drain_outgoing() {
            up.send(now, packet);
        }
        for packet in up.deliver(now) {
            if let Some(rejection) = server.receive(&ctx, CONNECTION, &packet, now)? {
                rejected_packets += 1;
                debug!(tick, ?rejection, "server rejected move");
            }
        }
        for packet in server.drain_replies(CONNECTION)? {
            down.send(now, packet);
        }
        for packet in down.deliver(now) {
            client.receive(&packet)?;
        }
    }

    let server_stats = server.stats();
    let final_location = client.character().movement().location();
    let divergence = server
        .session(CONNECTION)
        .map(|session| (session.character().movement().location() - final_location).norm())
        .unwrap_or(0.0);
    if server_stats.corrections > 0 {
        warn!(corrections = server_stats.corrections, "client needed corrections");
    }

    Ok(SimReport {
        ticks: args.ticks,
        client: client.stats(),
        server: server_stats,
        up_dropped: up.dropped,
        up_sent: up.sent,
        down_dropped: down.dropped,
        down_sent: down.sent,
        rejected_packets,
        divergence,
        final_location,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(loss: f64) -> MovesimArgs {
        MovesimArgs {
            ticks: 300,
            tick_rate: 90.0,
            latency_ms: 40,
            loss,
            seed: 7,
            map: None,
            config: None,
            net_config: None,
        }
    }

    #[test]
    fn link_delays_and_drops_deterministically() {
        let mut first = LinkSimulator::new(0.1, 0.5, 3);
        let mut second = LinkSimulator::new(0.1, 0.5, 3);
        for index in 0..64u8 {
            first.send(0.0, vec![index]);
            second.send(0.0, vec![index]);
        }
        assert!(first.deliver(0.05).is_empty());
        let delivered = first.deliver(0.1);
        assert_eq!(delivered, second.deliver(0.1));
        assert_eq!(delivered.len() as u64, 64 - first.dropped);
        assert!(first.dropped > 0 && first.dropped < 64);
    }

    #[test]
    fn lossless_run_moves_the_character() {
        let report = simulate(&args(0.0)).expect("simulate");
        assert!(report.client.moves > 0);
        assert_eq!(report.up_dropped, 0);
        assert!(report.server.moves > 0);
        assert!(report.final_location.norm() > 100.0);
    }

    #[test]
    fn lossy_run_completes() {
        let report = simulate(&args(0.2)).expect("simulate");
        assert!(report.up_dropped > 0);
        assert!(report.server.moves > 0);
    }
}
