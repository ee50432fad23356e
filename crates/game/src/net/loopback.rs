use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use rand::SeedableRng;
use rand::rngs::StdRng;

use super::protocol::{PlatformId, Reliability};
use super::stats::PacketLossSimulation;
use super::transport::{
    EventInbox, EventSink, NetworkProvider, PeerHandle, ProviderEvent, TransportError,
    event_channel,
};

#[derive(Debug)]
struct InFlight {
    release_at: Duration,
    order: u64,
    to: PlatformId,
    peer: PeerHandle,
    data: Bytes,
}

impl PartialEq for InFlight {
    fn eq(&self, other: &Self) -> bool {
        self.release_at == other.release_at && self.order == other.order
    }
}

impl Eq for InFlight {}

impl PartialOrd for InFlight {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InFlight {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse order for min-heap
        other
            .release_at
            .cmp(&self.release_at)
            .then_with(|| other.order.cmp(&self.order))
    }
}

#[derive(Debug, Clone, Copy)]
struct LinkEnd {
    owner: PlatformId,
    remote: PlatformId,
    remote_peer: PeerHandle,
    open: bool,
}

struct HubState {
    sinks: HashMap<PlatformId, EventSink>,
    listening: HashSet<PlatformId>,
    links: HashMap<PeerHandle, LinkEnd>,
    default_conditions: PacketLossSimulation,
    conditions: HashMap<PlatformId, PacketLossSimulation>,
    in_flight: BinaryHeap<InFlight>,
    reliable_tail: HashMap<PeerHandle, Duration>,
    now: Duration,
    next_handle: u32,
    next_order: u64,
    dropped: u64,
    rng: StdRng,
}

impl HubState {
    fn allocate_handle(&mut self) -> PeerHandle {
        self.next_handle += 1;
        PeerHandle(self.next_handle)
    }

    fn notify(&self, platform_id: PlatformId, event: ProviderEvent) {
        if let Some(sink) = self.sinks.get(&platform_id) {
            if !sink.push(event) {
                log::debug!("loopback endpoint {platform_id} is gone");
            }
        }
    }

    fn close_link(&mut self, peer: PeerHandle) {
        let Some(end) = self.links.remove(&peer) else {
            return;
        };
        self.reliable_tail.remove(&peer);
        if self.links.remove(&end.remote_peer).is_some() {
            self.reliable_tail.remove(&end.remote_peer);
            self.notify(
                end.remote,
                ProviderEvent::Closed {
                    peer: end.remote_peer,
                    platform_id: end.owner,
                },
            );
        }
    }

    fn deliver_due(&mut self) {
        while self
            .in_flight
            .peek()
            .is_some_and(|next| next.release_at <= self.now)
        {
            let Some(message) = self.in_flight.pop() else {
                break;
            };
            if !self.links.contains_key(&message.peer) {
                continue;
            }
            self.notify(
                message.to,
                ProviderEvent::Message {
                    peer: message.peer,
                    data: message.data,
                },
            );
        }
    }
}

/// In-memory star network standing in for the platform relay. Every
/// registered endpoint gets a [`LoopbackProvider`]; time only moves when
/// [`advance`](Self::advance) is called, so delivery under simulated latency
/// is deterministic for a given seed.
#[derive(Clone)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    pub fn new(seed: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState {
                sinks: HashMap::new(),
                listening: HashSet::new(),
                links: HashMap::new(),
                default_conditions: PacketLossSimulation::default(),
                conditions: HashMap::new(),
                in_flight: BinaryHeap::new(),
                reliable_tail: HashMap::new(),
                now: Duration::ZERO,
                next_handle: 0,
                next_order: 0,
                dropped: 0,
                rng: StdRng::seed_from_u64(seed),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, platform_id: PlatformId) -> (LoopbackProvider, EventInbox) {
        let (sink, inbox) = event_channel();
        self.lock().sinks.insert(platform_id, sink);
        let provider = LoopbackProvider {
            platform_id,
            hub: self.clone(),
        };
        (provider, inbox)
    }

    /// Link conditions applied to traffic delivered to `platform_id`.
    pub fn set_conditions(&self, platform_id: PlatformId, conditions: PacketLossSimulation) {
        let mut state = self.lock();
        if conditions.enabled {
            state.conditions.insert(platform_id, conditions);
        } else {
            state.conditions.remove(&platform_id);
        }
    }

    pub fn set_default_conditions(&self, conditions: PacketLossSimulation) {
        self.lock().default_conditions = conditions;
    }

    pub fn advance(&self, dt: Duration) {
        let mut state = self.lock();
        state.now += dt;
        state.deliver_due();
    }

    /// Drops every connection of `platform_id` as if the process had died.
    pub fn sever(&self, platform_id: PlatformId) {
        let mut state = self.lock();
        let owned: Vec<PeerHandle> = state
            .links
            .iter()
            .filter(|(_, end)| end.owner == platform_id)
            .map(|(peer, _)| *peer)
            .collect();
        for peer in owned {
            state.close_link(peer);
        }
        state.listening.remove(&platform_id);
        state.sinks.remove(&platform_id);
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    pub fn now(&self) -> Duration {
        self.lock().now
    }
}

pub struct LoopbackProvider {
    platform_id: PlatformId,
    hub: LoopbackHub,
}

impl NetworkProvider for LoopbackProvider {
    fn local_platform_id(&self) -> PlatformId {
        self.platform_id
    }

    fn open_listen_socket(&mut self) -> Result<(), TransportError> {
        let mut state = self.hub.lock();
        if !state.sinks.contains_key(&self.platform_id) {
            return Err(TransportError::ProviderClosed);
        }
        state.listening.insert(self.platform_id);
        Ok(())
    }

    fn connect(&mut self, platform_id: PlatformId) -> Result<PeerHandle, TransportError> {
        let mut state = self.hub.lock();
        if !state.sinks.contains_key(&self.platform_id) {
            return Err(TransportError::ProviderClosed);
        }
        let local = state.allocate_handle();

        if !state.listening.contains(&platform_id) {
            state.notify(
                self.platform_id,
                ProviderEvent::Closed {
                    peer: local,
                    platform_id,
                },
            );
            return Ok(local);
        }

        let remote = state.allocate_handle();
        state.links.insert(
            local,
            LinkEnd {
                owner: self.platform_id,
                remote: platform_id,
                remote_peer: remote,
                open: false,
            },
        );
        state.links.insert(
            remote,
            LinkEnd {
                owner: platform_id,
                remote: self.platform_id,
                remote_peer: local,
                open: false,
            },
        );
        state.notify(
            platform_id,
            ProviderEvent::ConnectionRequested {
                peer: remote,
                platform_id: self.platform_id,
            },
        );
        Ok(local)
    }

    fn accept(&mut self, peer: PeerHandle) -> Result<(), TransportError> {
        let mut state = self.hub.lock();
        let end = state
            .links
            .get(&peer)
            .copied()
            .ok_or(TransportError::UnknownPeer(peer))?;
        for handle in [peer, end.remote_peer] {
            if let Some(link) = state.links.get_mut(&handle) {
                link.open = true;
            }
        }
        state.notify(
            end.owner,
            ProviderEvent::Connected {
                peer,
                platform_id: end.remote,
            },
        );
        state.notify(
            end.remote,
            ProviderEvent::Connected {
                peer: end.remote_peer,
                platform_id: end.owner,
            },
        );
        Ok(())
    }

    fn close(&mut self, peer: PeerHandle) {
        self.hub.lock().close_link(peer);
    }

    fn send(
        &mut self,
        peer: PeerHandle,
        data: &[u8],
        reliability: Reliability,
    ) -> Result<(), TransportError> {
        let mut state = self.hub.lock();
        let end = match state.links.get(&peer) {
            Some(end) if end.open => *end,
            _ => return Err(TransportError::UnknownPeer(peer)),
        };

        let conditions = state
            .conditions
            .get(&end.remote)
            .cloned()
            .unwrap_or_else(|| state.default_conditions.clone());

        if !reliability.is_reliable() && conditions.should_drop(&mut state.rng) {
            state.dropped += 1;
            return Ok(());
        }

        let delay = conditions.delay(&mut state.rng);
        let mut release_at = state.now + delay;
        if reliability.is_reliable() {
            if let Some(tail) = state.reliable_tail.get(&peer) {
                release_at = release_at.max(*tail);
            }
            state.reliable_tail.insert(peer, release_at);
        }

        state.next_order += 1;
        let order = state.next_order;
        state.in_flight.push(InFlight {
            release_at,
            order,
            to: end.remote,
            peer: end.remote_peer,
            data: Bytes::copy_from_slice(data),
        });
        state.deliver_due();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::transport::TransportAdapter;

    fn pair(hub: &LoopbackHub) -> (TransportAdapter<LoopbackProvider>, TransportAdapter<LoopbackProvider>) {
        let (host_provider, host_inbox) = hub.register(1);
        let (peer_provider, peer_inbox) = hub.register(2);
        let mut host = TransportAdapter::new(host_provider, host_inbox);
        let mut peer = TransportAdapter::new(peer_provider, peer_inbox);
        host.listen().unwrap();
        peer.connect(1).unwrap();
        host.drain(32);
        host.drain(32);
        peer.drain(32);
        (host, peer)
    }

    fn payloads(events: Vec<crate::net::TransportEvent>) -> Vec<u8> {
        events
            .into_iter()
            .filter_map(|e| match e {
                crate::net::TransportEvent::MessageReceived { data, .. } => Some(data[0]),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_connect_and_exchange() {
        let hub = LoopbackHub::new(1);
        let (mut host, mut peer) = pair(&hub);
        assert_eq!(host.connection_count(), 1);
        assert_eq!(peer.connection_count(), 1);

        peer.send_to_all(&[42], Reliability::Reliable);
        assert_eq!(payloads(host.drain(32)), vec![42]);
    }

    #[test]
    fn test_connect_to_non_listener_fails() {
        let hub = LoopbackHub::new(1);
        let (_host_provider, _host_inbox) = hub.register(1);
        let (peer_provider, peer_inbox) = hub.register(2);
        let mut peer = TransportAdapter::new(peer_provider, peer_inbox);
        peer.connect(1).unwrap();
        let events = peer.drain(32);
        assert!(matches!(
            events[0],
            crate::net::TransportEvent::PeerDisconnected { platform_id: 1, .. }
        ));
    }

    #[test]
    fn test_reliable_order_survives_latency() {
        let hub = LoopbackHub::new(99);
        let (mut host, mut peer) = pair(&hub);
        hub.set_conditions(
            1,
            PacketLossSimulation {
                enabled: true,
                loss_percent: 0.5,
                min_latency_ms: 10,
                max_latency_ms: 80,
                jitter_ms: 20,
            },
        );
        for i in 0..50 {
            peer.send_to_all(&[i], Reliability::Reliable);
        }
        hub.advance(Duration::from_secs(1));
        assert_eq!(payloads(host.drain(64)), (0..50).collect::<Vec<u8>>());
        assert_eq!(hub.dropped(), 0);
    }

    #[test]
    fn test_unreliable_loss_is_counted() {
        let hub = LoopbackHub::new(5);
        let (mut host, mut peer) = pair(&hub);
        hub.set_conditions(
            1,
            PacketLossSimulation {
                enabled: true,
                loss_percent: 1.0,
                ..Default::default()
            },
        );
        for i in 0..10 {
            peer.send_to_all(&[i], Reliability::Unreliable);
        }
        assert!(host.drain(32).is_empty());
        assert_eq!(hub.dropped(), 10);
    }

    #[test]
    fn test_latency_holds_messages_until_advanced() {
        let hub = LoopbackHub::new(2);
        let (mut host, mut peer) = pair(&hub);
        hub.set_conditions(
            1,
            PacketLossSimulation {
                enabled: true,
                loss_percent: 0.0,
                min_latency_ms: 50,
                max_latency_ms: 50,
                jitter_ms: 0,
            },
        );
        peer.send_to_all(&[1], Reliability::Reliable);
        assert!(host.drain(32).is_empty());
        hub.advance(Duration::from_millis(49));
        assert!(host.drain(32).is_empty());
        hub.advance(Duration::from_millis(1));
        assert_eq!(payloads(host.drain(32)), vec![1]);
    }

    #[test]
    fn test_sever_notifies_remote() {
        let hub = LoopbackHub::new(3);
        let (mut host, _peer) = pair(&hub);
        hub.sever(2);
        let events = host.drain(32);
        assert!(matches!(
            events[0],
            crate::net::TransportEvent::PeerDisconnected { platform_id: 2, .. }
        ));
        assert_eq!(host.connection_count(), 0);
    }
}
