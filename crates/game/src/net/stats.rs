use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::protocol::Reliability;

/// Artificial link conditions for the loopback network. Loss only ever
/// applies to unreliable traffic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PacketLossSimulation {
    pub enabled: bool,
    pub loss_percent: f32,
    pub min_latency_ms: u32,
    pub max_latency_ms: u32,
    pub jitter_ms: u32,
}

impl PacketLossSimulation {
    pub fn should_drop(&self, rng: &mut impl Rng) -> bool {
        if !self.enabled || self.loss_percent <= 0.0 {
            return false;
        }
        rng.random::<f32>() < self.loss_percent
    }

    pub fn delay(&self, rng: &mut impl Rng) -> Duration {
        if !self.enabled || self.max_latency_ms == 0 {
            return Duration::ZERO;
        }
        let base = self.min_latency_ms;
        let range = self.max_latency_ms.saturating_sub(self.min_latency_ms);
        let spread = if range > 0 { rng.random_range(0..=range) } else { 0 };
        let jitter = if self.jitter_ms > 0 {
            rng.random_range(0..=self.jitter_ms)
        } else {
            0
        };
        Duration::from_millis((base + spread + jitter) as u64)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub reliable_sent: u64,
    pub unreliable_sent: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_failures: u64,
    pub deferred_messages: u64,
}

impl NetworkStats {
    pub fn record_sent(&mut self, len: usize, reliability: Reliability) {
        self.packets_sent += 1;
        self.bytes_sent += len as u64;
        match reliability {
            Reliability::Reliable => self.reliable_sent += 1,
            Reliability::Unreliable => self.unreliable_sent += 1,
        }
    }

    pub fn record_received(&mut self, len: usize) {
        self.packets_received += 1;
        self.bytes_received += len as u64;
    }
}
