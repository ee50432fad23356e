use super::dispatcher::{ReplicationDispatcher, Role};
use super::error::ReplicationError;
use super::events::{Destination, ReplicationEvent};
use crate::config::ReplicationConfig;
use crate::loadout::LoadoutCatalog;
use crate::net::{
    LoopbackHub, LoopbackProvider, NetworkProvider, PeerHandle, PlatformId, TransportAdapter,
};

/// One participant's replication loop. Nothing is shared between loops
/// except the provider's network.
pub struct ReplicationLoop<P: NetworkProvider> {
    transport: TransportAdapter<P>,
    dispatcher: ReplicationDispatcher,
}

impl<P: NetworkProvider> ReplicationLoop<P> {
    pub fn new(transport: TransportAdapter<P>, dispatcher: ReplicationDispatcher) -> Self {
        Self {
            transport,
            dispatcher,
        }
    }

    pub fn host(&mut self) -> Result<(), ReplicationError> {
        if self.dispatcher.role() != Role::Idle {
            return Err(ReplicationError::AlreadyInSession);
        }
        self.transport.listen()?;
        self.dispatcher.begin_hosting()
    }

    pub fn join(&mut self, host: PlatformId) -> Result<PeerHandle, ReplicationError> {
        self.dispatcher.begin_joining()?;
        match self.transport.connect(host) {
            Ok(peer) => Ok(peer),
            Err(e) => {
                self.dispatcher.end_session();
                Err(e.into())
            }
        }
    }

    pub fn leave(&mut self) {
        self.transport.shutdown();
        // Our own closes come back as disconnects; the session is gone anyway.
        self.transport.drain(usize::MAX);
        self.dispatcher.end_session();
    }

    pub fn tick(&mut self, dt: f32) {
        let max_per_peer = self.dispatcher.config().max_messages_per_peer_per_tick;
        for event in self.transport.drain(max_per_peer) {
            self.dispatcher.handle_transport_event(event);
        }
        self.dispatcher.tick(dt);
        self.flush();
    }

    /// Sends everything the dispatcher has queued. Local actions taken
    /// between ticks go out here or on the next tick.
    pub fn flush(&mut self) {
        for outbound in self.dispatcher.drain_outbox() {
            match outbound.destination {
                Destination::Peer(peer) => {
                    self.transport
                        .send_to(peer, &outbound.payload, outbound.reliability)
                }
                Destination::AllPeers => self
                    .transport
                    .send_to_all(&outbound.payload, outbound.reliability),
            }
        }
        for peer in self.dispatcher.drain_disconnects() {
            self.transport.disconnect(peer);
        }
    }

    pub fn drain_events(&mut self) -> Vec<ReplicationEvent> {
        self.dispatcher.drain_events()
    }

    pub fn dispatcher(&self) -> &ReplicationDispatcher {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut ReplicationDispatcher {
        &mut self.dispatcher
    }

    pub fn transport(&self) -> &TransportAdapter<P> {
        &self.transport
    }
}

impl ReplicationLoop<LoopbackProvider> {
    pub fn on_loopback(
        hub: &LoopbackHub,
        platform_id: PlatformId,
        name: impl Into<String>,
        config: ReplicationConfig,
        catalog: LoadoutCatalog,
    ) -> Self {
        let (provider, inbox) = hub.register(platform_id);
        let transport = TransportAdapter::new(provider, inbox);
        let dispatcher = ReplicationDispatcher::new(config, catalog, platform_id, name);
        Self::new(transport, dispatcher)
    }
}
