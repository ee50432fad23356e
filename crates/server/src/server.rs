use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use glam::Vec3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use glorps::{
    HOST_IDENTITY, LoadoutCatalog, LoopbackHub, LoopbackProvider, NetworkIdentity, NetworkStats,
    PlatformId, ReplicationEvent, ReplicationLoop, Role,
};

use crate::config::RunnerConfig;

const HOST_PLATFORM_ID: PlatformId = 76561190000000000;
const CONNECT_TIMEOUT_SECS: f32 = 5.0;
const ARENA_HALF_EXTENT: f32 = 12.0;

type Participant = ReplicationLoop<LoopbackProvider>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Lobby,
    Playing,
    Finished,
}

#[derive(Debug, Default)]
struct RunReport {
    events: HashMap<&'static str, u64>,
    actions: u64,
    refused_actions: u64,
}

impl RunReport {
    fn record(&mut self, event: &ReplicationEvent) {
        let name = match event {
            ReplicationEvent::LocalIdentityAssigned { .. } => "identity_assigned",
            ReplicationEvent::SessionJoined { .. } => "session_joined",
            ReplicationEvent::SessionLeft { .. } => "session_left",
            ReplicationEvent::LoadoutChanged { .. } => "loadout_changed",
            ReplicationEvent::ReadyChanged { .. } => "ready_changed",
            ReplicationEvent::SceneTransition { .. } => "scene_transition",
            ReplicationEvent::AbilityCast { .. } => "ability_cast",
            ReplicationEvent::DamageTaken { .. } => "damage_taken",
            ReplicationEvent::Died { .. } => "died",
            ReplicationEvent::PeerRejected { .. } => "peer_rejected",
            ReplicationEvent::ConnectionFailed { .. } => "connection_failed",
            ReplicationEvent::HostLost => "host_lost",
        };
        *self.events.entry(name).or_insert(0) += 1;
    }
}

/// Runs a host and a set of scripted peers over the loopback hub, driving
/// them through connect, lobby and play.
pub struct SessionRunner {
    hub: LoopbackHub,
    host: Participant,
    peers: Vec<Participant>,
    config: RunnerConfig,
    rng: StdRng,
    phase: Phase,
    tick: u64,
    phase_started: u64,
    tick_duration: Duration,
    last_tick_time: Instant,
    accumulator: Duration,
    running: bool,
    report: RunReport,
}

impl SessionRunner {
    pub fn new(config: RunnerConfig) -> Result<Self> {
        let hub = LoopbackHub::new(config.seed);
        if let Some(conditions) = &config.global_packet_loss {
            hub.set_default_conditions(conditions.clone());
        }

        let mut host = ReplicationLoop::on_loopback(
            &hub,
            HOST_PLATFORM_ID,
            "Host",
            config.replication.clone(),
            config.catalog.clone(),
        );
        host.host().context("failed to start hosting")?;

        let mut peers = Vec::with_capacity(config.peers);
        for index in 0..config.peers {
            let platform_id = HOST_PLATFORM_ID + 1 + index as u64;
            let mut peer = ReplicationLoop::on_loopback(
                &hub,
                platform_id,
                format!("Glorp {}", index + 1),
                config.replication.clone(),
                config.catalog.clone(),
            );
            peer.join(HOST_PLATFORM_ID)
                .with_context(|| format!("peer {platform_id} failed to connect"))?;
            peers.push(peer);
        }

        let tick_duration = Duration::from_secs_f32(config.tick_dt());
        Ok(Self {
            hub,
            host,
            peers,
            rng: StdRng::seed_from_u64(config.seed.wrapping_add(1)),
            phase: Phase::Connecting,
            tick: 0,
            phase_started: 0,
            tick_duration,
            last_tick_time: Instant::now(),
            accumulator: Duration::ZERO,
            running: true,
            report: RunReport::default(),
            config,
        })
    }

    pub fn run(&mut self) {
        while self.running {
            if self.config.realtime {
                self.tick_once();
                std::thread::sleep(Duration::from_millis(1));
            } else {
                self.tick();
            }
        }
        self.shutdown();
    }

    /// Runs as many fixed steps as wall-clock time allows.
    pub fn tick_once(&mut self) {
        let now = Instant::now();
        let delta = now - self.last_tick_time;
        self.last_tick_time = now;
        self.accumulator += delta;

        while self.accumulator >= self.tick_duration {
            self.accumulator -= self.tick_duration;
            self.tick();
        }
    }

    fn tick(&mut self) {
        if self.phase == Phase::Finished {
            self.running = false;
            return;
        }

        let dt = self.config.tick_dt();
        self.hub.advance(self.tick_duration);
        self.host.tick(dt);
        for peer in &mut self.peers {
            peer.tick(dt);
        }
        self.collect_events();

        self.tick += 1;
        self.step_script();
    }

    fn elapsed_in_phase(&self) -> f32 {
        (self.tick - self.phase_started) as f32 * self.config.tick_dt()
    }

    fn enter(&mut self, phase: Phase) {
        log::info!("{:?} -> {:?} at tick {}", self.phase, phase, self.tick);
        self.phase = phase;
        self.phase_started = self.tick;
    }

    fn step_script(&mut self) {
        match self.phase {
            Phase::Connecting => {
                let expected = self.peers.len() + 1;
                let joined = self
                    .peers
                    .iter()
                    .all(|p| p.dispatcher().sessions().len() == expected);
                if joined && self.host.dispatcher().sessions().len() == expected {
                    self.pick_loadouts();
                    self.enter(Phase::Lobby);
                } else if self.elapsed_in_phase() > CONNECT_TIMEOUT_SECS {
                    log::error!("peers did not connect within {CONNECT_TIMEOUT_SECS}s");
                    self.enter(Phase::Finished);
                }
            }
            Phase::Lobby => {
                if !self.host.dispatcher().directory().all_ready() {
                    return;
                }
                let map_path = self.config.map_path.clone();
                match self.host.dispatcher_mut().start_game(map_path) {
                    Ok(()) => self.enter(Phase::Playing),
                    Err(e) => {
                        log::error!("start refused: {e}");
                        self.enter(Phase::Finished);
                    }
                }
            }
            Phase::Playing => {
                self.play_actions();
                if self.elapsed_in_phase() >= self.config.duration_secs {
                    self.enter(Phase::Finished);
                }
            }
            Phase::Finished => {}
        }
    }

    fn pick_loadouts(&mut self) {
        let count = self.config.catalog.len() as i32;
        for participant in std::iter::once(&mut self.host).chain(self.peers.iter_mut()) {
            let loadout_index = self.rng.random_range(0..count);
            let dispatcher = participant.dispatcher_mut();
            let result = dispatcher
                .select_loadout(loadout_index)
                .and_then(|()| dispatcher.set_ready(true));
            if let Err(e) = result {
                log::warn!("lobby setup failed: {e}");
            }
        }
    }

    fn play_actions(&mut self) {
        let chance = (self.config.tick_dt() / self.config.action_interval_secs.max(0.01)) as f64;
        let chance = chance.clamp(0.0, 1.0);

        for index in 0..=self.peers.len() {
            if !self.rng.random_bool(chance) {
                continue;
            }
            let roll = self.rng.random_range(0..10);
            let target = Vec3::new(
                self.rng.random_range(-ARENA_HALF_EXTENT..ARENA_HALF_EXTENT),
                self.config.replication.spawn_height,
                self.rng.random_range(-ARENA_HALF_EXTENT..ARENA_HALF_EXTENT),
            );
            let slot = self.rng.random_range(0..2);

            let participant = if index == 0 {
                &mut self.host
            } else {
                &mut self.peers[index - 1]
            };
            let result = if roll < 7 {
                participant.dispatcher_mut().issue_move(target)
            } else {
                participant.dispatcher_mut().cast_ability(slot).map(|_| ())
            };

            self.report.actions += 1;
            if let Err(e) = result {
                self.report.refused_actions += 1;
                log::debug!("participant {index} action refused: {e}");
            }
        }

        if self.rng.random_bool(chance * 0.5) {
            self.host_attack();
        }
    }

    fn host_attack(&mut self) {
        let dispatcher = self.host.dispatcher_mut();
        let alive: Vec<NetworkIdentity> = dispatcher
            .entities()
            .iter()
            .filter(|e| e.vitals.alive && e.identity != HOST_IDENTITY)
            .map(|e| e.identity)
            .collect();
        if alive.is_empty() {
            return;
        }
        let target = alive[self.rng.random_range(0..alive.len())];
        let amount = self.rng.random_range(5..40);
        match dispatcher.apply_damage(HOST_IDENTITY, target, amount) {
            Ok(health) => log::debug!("host hit {target} for {amount}, {health} left"),
            Err(e) => log::debug!("host attack refused: {e}"),
        }
    }

    fn collect_events(&mut self) {
        for participant in std::iter::once(&mut self.host).chain(self.peers.iter_mut()) {
            for event in participant.drain_events() {
                match &event {
                    ReplicationEvent::HostLost | ReplicationEvent::ConnectionFailed { .. } => {
                        log::warn!("{event:?}")
                    }
                    _ => log::trace!("{event:?}"),
                }
                self.report.record(&event);
            }
        }
    }

    /// Largest distance between the host's authoritative position of an
    /// entity and any peer's view of it.
    fn max_divergence(&self) -> f32 {
        let mut worst = 0.0f32;
        for authoritative in self.host.dispatcher().entities().iter() {
            for peer in &self.peers {
                if let Some(view) = peer.dispatcher().entity(authoritative.identity) {
                    worst = worst.max(view.position.distance(authoritative.position));
                }
            }
        }
        worst
    }

    fn shutdown(&mut self) {
        self.log_summary();
        for peer in &mut self.peers {
            peer.leave();
        }
        self.host.leave();
    }

    fn log_summary(&self) {
        log::info!(
            "ran {} ticks ({:.1}s simulated), {} in flight, {} dropped by the hub",
            self.tick,
            self.hub.now().as_secs_f32(),
            self.hub.in_flight(),
            self.hub.dropped()
        );
        log::info!(
            "{} scripted actions, {} refused, max divergence {:.3}",
            self.report.actions,
            self.report.refused_actions,
            self.max_divergence()
        );

        let mut events: Vec<_> = self.report.events.iter().collect();
        events.sort();
        for (name, count) in events {
            log::info!("  {name}: {count}");
        }

        log_participant("host", self.host.dispatcher().role(), self.host.transport().stats());
        for (index, peer) in self.peers.iter().enumerate() {
            let label = format!("peer {}", index + 1);
            log_participant(&label, peer.dispatcher().role(), peer.transport().stats());
            let dispatch = peer.dispatcher().stats();
            if dispatch.violations > 0 || dispatch.decode_errors > 0 {
                log::warn!(
                    "{label}: {} violations, {} decode errors",
                    dispatch.violations,
                    dispatch.decode_errors
                );
            }
        }
        let host = self.host.dispatcher().stats();
        log::info!(
            "host handled {} packets, relayed {}, dropped {}",
            host.packets_handled,
            host.relayed,
            host.violations + host.decode_errors
        );
    }
}

fn log_participant(label: &str, role: Role, stats: &NetworkStats) {
    log::info!(
        "{label} ({role:?}): sent {} ({} reliable, {} unreliable, {} bytes), received {} ({} bytes), {} failed, {} deferred",
        stats.packets_sent,
        stats.reliable_sent,
        stats.unreliable_sent,
        stats.bytes_sent,
        stats.packets_received,
        stats.bytes_received,
        stats.send_failures,
        stats.deferred_messages
    );
}

pub fn load_catalog(path: &std::path::Path) -> Result<LoadoutCatalog> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    LoadoutCatalog::from_json(&json).with_context(|| format!("invalid loadouts in {}", path.display()))
}
