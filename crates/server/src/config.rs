use glorps::{LoadoutCatalog, PacketLossSimulation, ReplicationConfig};

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub tick_rate: u32,
    pub peers: usize,
    pub duration_secs: f32,
    pub seed: u64,
    pub map_path: String,
    pub realtime: bool,
    /// Mean seconds between scripted actions per participant.
    pub action_interval_secs: f32,
    pub global_packet_loss: Option<PacketLossSimulation>,
    pub replication: ReplicationConfig,
    pub catalog: LoadoutCatalog,
}

impl RunnerConfig {
    pub fn tick_dt(&self) -> f32 {
        1.0 / self.tick_rate.max(1) as f32
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            tick_rate: 60,
            peers: 3,
            duration_secs: 30.0,
            seed: 0,
            map_path: "res://maps/arena.tscn".to_string(),
            realtime: false,
            action_interval_secs: 1.5,
            global_packet_loss: None,
            replication: ReplicationConfig::default(),
            catalog: LoadoutCatalog::default(),
        }
    }
}
