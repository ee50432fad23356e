use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use super::protocol::{PlatformId, Reliability};
use super::stats::NetworkStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerHandle(pub u32);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("not accepting incoming connections")]
    NotListening,
    #[error("already connected to {0}")]
    AlreadyConnected(PlatformId),
    #[error("no route to platform id {0}")]
    Unreachable(PlatformId),
    #[error("unknown peer {0:?}")]
    UnknownPeer(PeerHandle),
    #[error("network provider is closed")]
    ProviderClosed,
}

/// Raw status and data callbacks raised by a [`NetworkProvider`].
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    ConnectionRequested {
        peer: PeerHandle,
        platform_id: PlatformId,
    },
    Connected {
        peer: PeerHandle,
        platform_id: PlatformId,
    },
    Closed {
        peer: PeerHandle,
        platform_id: PlatformId,
    },
    Message {
        peer: PeerHandle,
        data: Bytes,
    },
}

impl ProviderEvent {
    pub fn peer(&self) -> PeerHandle {
        match self {
            Self::ConnectionRequested { peer, .. }
            | Self::Connected { peer, .. }
            | Self::Closed { peer, .. }
            | Self::Message { peer, .. } => *peer,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    PeerConnected {
        peer: PeerHandle,
        platform_id: PlatformId,
    },
    PeerDisconnected {
        peer: PeerHandle,
        platform_id: PlatformId,
    },
    MessageReceived {
        peer: PeerHandle,
        data: Bytes,
    },
}

/// Write half of the provider callback queue. Providers may push from any
/// thread; the adapter drains on the replication loop's thread.
#[derive(Debug, Clone)]
pub struct EventSink(mpsc::UnboundedSender<ProviderEvent>);

impl EventSink {
    pub fn push(&self, event: ProviderEvent) -> bool {
        self.0.send(event).is_ok()
    }
}

#[derive(Debug)]
pub struct EventInbox(mpsc::UnboundedReceiver<ProviderEvent>);

pub fn event_channel() -> (EventSink, EventInbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink(tx), EventInbox(rx))
}

/// Connection-oriented messaging primitives supplied by the platform.
pub trait NetworkProvider {
    fn local_platform_id(&self) -> PlatformId;
    fn open_listen_socket(&mut self) -> Result<(), TransportError>;
    fn connect(&mut self, platform_id: PlatformId) -> Result<PeerHandle, TransportError>;
    fn accept(&mut self, peer: PeerHandle) -> Result<(), TransportError>;
    fn close(&mut self, peer: PeerHandle);
    fn send(
        &mut self,
        peer: PeerHandle,
        data: &[u8],
        reliability: Reliability,
    ) -> Result<(), TransportError>;
}

pub struct TransportAdapter<P: NetworkProvider> {
    provider: P,
    inbox: EventInbox,
    backlog: VecDeque<ProviderEvent>,
    connections: BTreeMap<PeerHandle, PlatformId>,
    listening: bool,
    stats: NetworkStats,
}

impl<P: NetworkProvider> TransportAdapter<P> {
    pub fn new(provider: P, inbox: EventInbox) -> Self {
        Self {
            provider,
            inbox,
            backlog: VecDeque::new(),
            connections: BTreeMap::new(),
            listening: false,
            stats: NetworkStats::default(),
        }
    }

    pub fn listen(&mut self) -> Result<(), TransportError> {
        self.provider.open_listen_socket()?;
        self.listening = true;
        log::info!(
            "listening for peers as platform id {}",
            self.provider.local_platform_id()
        );
        Ok(())
    }

    pub fn connect(&mut self, platform_id: PlatformId) -> Result<PeerHandle, TransportError> {
        if self.connections.values().any(|id| *id == platform_id) {
            return Err(TransportError::AlreadyConnected(platform_id));
        }
        let peer = self.provider.connect(platform_id)?;
        log::info!("connecting to platform id {platform_id} as {peer:?}");
        Ok(peer)
    }

    pub fn send_to(&mut self, peer: PeerHandle, data: &[u8], reliability: Reliability) {
        if !self.connections.contains_key(&peer) {
            log::debug!("dropping send to {peer:?}: not connected");
            self.stats.send_failures += 1;
            return;
        }
        match self.provider.send(peer, data, reliability) {
            Ok(()) => self.stats.record_sent(data.len(), reliability),
            Err(e) => {
                log::debug!("send to {peer:?} failed: {e}");
                self.stats.send_failures += 1;
            }
        }
    }

    pub fn send_to_all(&mut self, data: &[u8], reliability: Reliability) {
        let peers: Vec<PeerHandle> = self.connections.keys().copied().collect();
        for peer in peers {
            self.send_to(peer, data, reliability);
        }
    }

    /// Closes a connection from this side. The matching `PeerDisconnected`
    /// is surfaced by the next [`drain`](Self::drain).
    pub fn disconnect(&mut self, peer: PeerHandle) {
        self.provider.close(peer);
        if let Some(platform_id) = self.connections.remove(&peer) {
            log::info!("closed connection to {peer:?} ({platform_id})");
            self.backlog
                .push_back(ProviderEvent::Closed { peer, platform_id });
        }
    }

    pub fn shutdown(&mut self) {
        let peers: Vec<PeerHandle> = self.connections.keys().copied().collect();
        for peer in peers {
            self.disconnect(peer);
        }
        self.listening = false;
    }

    /// Delivers pending events in arrival order. At most `max_per_peer`
    /// messages are taken from any one peer; once a peer hits the cap every
    /// later event of that peer waits for the next call, so per-peer order
    /// is never broken.
    pub fn drain(&mut self, max_per_peer: usize) -> Vec<TransportEvent> {
        while let Ok(event) = self.inbox.0.try_recv() {
            self.backlog.push_back(event);
        }

        let pending = std::mem::take(&mut self.backlog);
        let mut delivered = Vec::new();
        let mut taken: HashMap<PeerHandle, usize> = HashMap::new();
        let mut capped: HashSet<PeerHandle> = HashSet::new();

        for event in pending {
            let peer = event.peer();
            if capped.contains(&peer) {
                self.backlog.push_back(event);
                continue;
            }
            if matches!(event, ProviderEvent::Message { .. }) {
                let count = taken.entry(peer).or_insert(0);
                if *count >= max_per_peer {
                    capped.insert(peer);
                    self.stats.deferred_messages += 1;
                    self.backlog.push_back(event);
                    continue;
                }
                *count += 1;
            }
            if let Some(event) = self.translate(event) {
                delivered.push(event);
            }
        }

        delivered
    }

    fn translate(&mut self, event: ProviderEvent) -> Option<TransportEvent> {
        match event {
            ProviderEvent::ConnectionRequested { peer, platform_id } => {
                if !self.listening {
                    log::debug!("refusing connection from {platform_id}: not listening");
                    self.provider.close(peer);
                    return None;
                }
                if let Err(e) = self.provider.accept(peer) {
                    log::warn!("failed to accept {platform_id}: {e}");
                }
                None
            }
            ProviderEvent::Connected { peer, platform_id } => {
                log::info!("peer {peer:?} connected ({platform_id})");
                self.connections.insert(peer, platform_id);
                Some(TransportEvent::PeerConnected { peer, platform_id })
            }
            ProviderEvent::Closed { peer, platform_id } => {
                if self.connections.remove(&peer).is_some() {
                    log::info!("peer {peer:?} disconnected ({platform_id})");
                } else {
                    log::debug!("connection {peer:?} to {platform_id} closed before it opened");
                }
                Some(TransportEvent::PeerDisconnected { peer, platform_id })
            }
            ProviderEvent::Message { peer, data } => {
                if !self.connections.contains_key(&peer) {
                    log::debug!("dropping message from unconnected {peer:?}");
                    return None;
                }
                self.stats.record_received(data.len());
                Some(TransportEvent::MessageReceived { peer, data })
            }
        }
    }

    pub fn is_connected(&self, peer: PeerHandle) -> bool {
        self.connections.contains_key(&peer)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn local_platform_id(&self) -> PlatformId {
        self.provider.local_platform_id()
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }
}
