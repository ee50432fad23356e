mod config;
mod server;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};

use config::RunnerConfig;
use glorps::{LoadoutCatalog, MovementAuthority, PacketLossSimulation, ReplicationConfig};
use server::SessionRunner;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Authority {
    Host,
    Owner,
}

impl From<Authority> for MovementAuthority {
    fn from(authority: Authority) -> Self {
        match authority {
            Authority::Host => MovementAuthority::HostSimulated,
            Authority::Owner => MovementAuthority::OwnerSimulated,
        }
    }
}

#[derive(Parser)]
#[command(name = "glorps-server")]
#[command(about = "Runs a host and scripted peers over the in-memory transport")]
struct Args {
    #[arg(short, long, default_value_t = 60)]
    tick_rate: u32,

    #[arg(short, long, default_value_t = 3)]
    peers: usize,

    #[arg(short, long, default_value_t = 30.0, help = "Seconds of play to simulate")]
    duration: f32,

    #[arg(short, long, default_value_t = 0)]
    seed: u64,

    #[arg(long, default_value = "res://maps/arena.tscn")]
    map: String,

    #[arg(long, help = "Pace ticks against the wall clock")]
    realtime: bool,

    #[arg(long, value_enum, default_value_t = Authority::Host)]
    authority: Authority,

    #[arg(long, help = "JSON file with the loadout catalog")]
    loadouts: Option<PathBuf>,

    #[arg(long, help = "JSON file with replication settings")]
    replication: Option<PathBuf>,

    #[arg(long, help = "Enable global packet loss simulation")]
    simulate_packet_loss: bool,

    #[arg(long, default_value_t = 0.0, help = "Packet loss percentage (0-100)")]
    loss_percent: f32,

    #[arg(long, default_value_t = 0, help = "Minimum latency in ms")]
    min_latency: u32,

    #[arg(long, default_value_t = 0, help = "Maximum latency in ms")]
    max_latency: u32,

    #[arg(long, default_value_t = 0, help = "Jitter in ms")]
    jitter: u32,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let global_packet_loss = if args.simulate_packet_loss {
        Some(PacketLossSimulation {
            enabled: true,
            loss_percent: (args.loss_percent / 100.0).clamp(0.0, 1.0),
            min_latency_ms: args.min_latency,
            max_latency_ms: args.max_latency.max(args.min_latency),
            jitter_ms: args.jitter,
        })
    } else {
        None
    };

    let mut replication = match &args.replication {
        Some(path) => ReplicationConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => ReplicationConfig::default(),
    };
    replication.movement_authority = args.authority.into();

    let catalog = match &args.loadouts {
        Some(path) => server::load_catalog(path)?,
        None => LoadoutCatalog::default(),
    };

    let config = RunnerConfig {
        tick_rate: args.tick_rate,
        peers: args.peers,
        duration_secs: args.duration,
        seed: args.seed,
        map_path: args.map,
        realtime: args.realtime,
        global_packet_loss,
        replication,
        catalog,
        ..Default::default()
    };

    log::info!(
        "starting session with {} peers at {} Hz ({:?})",
        config.peers,
        config.tick_rate,
        config.replication.movement_authority
    );
    let mut runner = SessionRunner::new(config)?;
    runner.run();
    log::info!("Session finished");

    Ok(())
}
