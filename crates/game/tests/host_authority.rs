use bytes::Bytes;
use glam::Vec3;
use glorps::replication::{Destination, Outbound};
use glorps::{
    LoadoutCatalog, MovementAuthority, NetworkIdentity, Packet, PeerHandle, ReplicationConfig,
    ReplicationDispatcher, TransportEvent,
};

const HOST_PLATFORM: u64 = 9000;

fn in_game_host(authority: MovementAuthority) -> ReplicationDispatcher {
    let config = ReplicationConfig {
        movement_authority: authority,
        ..Default::default()
    };
    let mut host = ReplicationDispatcher::new(config, LoadoutCatalog::default(), HOST_PLATFORM, "Host");
    host.begin_hosting().unwrap();

    for peer in [1u32, 2] {
        host.handle_transport_event(TransportEvent::PeerConnected {
            peer: PeerHandle(peer),
            platform_id: HOST_PLATFORM + peer as u64,
        });
        let identity = host.identity_of(PeerHandle(peer)).unwrap();
        deliver(&mut host, peer, &Packet::Handshake { identity });
        deliver(
            &mut host,
            peer,
            &Packet::ReadyStatus {
                identity,
                is_ready: true,
            },
        );
    }
    host.set_ready(true).unwrap();
    host.start_game("res://maps/arena.tscn").unwrap();
    host.drain_outbox();
    host.drain_events();
    host
}

fn deliver(host: &mut ReplicationDispatcher, peer: u32, packet: &Packet) -> Bytes {
    let raw = packet.encode().unwrap();
    host.handle_message(PeerHandle(peer), raw.clone());
    raw
}

fn broadcasts(outbox: &[Outbound]) -> Vec<&Bytes> {
    outbox
        .iter()
        .filter(|o| o.destination == Destination::AllPeers)
        .map(|o| &o.payload)
        .collect()
}

fn position_update(identity: NetworkIdentity, position: Vec3, yaw: f32) -> Packet {
    Packet::PositionUpdate {
        identity,
        position,
        rotation: Vec3::new(0.0, yaw, 0.0),
    }
}

#[test]
fn test_last_position_update_wins_and_relays_verbatim() {
    let mut host = in_game_host(MovementAuthority::OwnerSimulated);

    let first = deliver(&mut host, 2, &position_update(2, Vec3::new(1.0, 0.0, 1.0), 0.5));
    let second = deliver(&mut host, 2, &position_update(2, Vec3::new(2.0, 0.0, 2.0), 0.6));

    let entity = host.entity(2).unwrap();
    assert_eq!(entity.target_position, Vec3::new(2.0, 0.0, 2.0));
    assert!((entity.target_yaw - 0.6).abs() < 1e-6);

    let outbox = host.drain_outbox();
    assert_eq!(broadcasts(&outbox), vec![&first, &second]);
    assert_eq!(host.stats().relayed, 2);
}

#[test]
fn test_spoofed_position_update_is_not_relayed() {
    let mut host = in_game_host(MovementAuthority::OwnerSimulated);
    let before = host.entity(2).unwrap().target_position;

    deliver(&mut host, 1, &position_update(2, Vec3::new(8.0, 0.0, 8.0), 0.0));

    assert_eq!(host.entity(2).unwrap().target_position, before);
    assert!(host.drain_outbox().is_empty());
    assert_eq!(host.stats().violations, 1);
}

#[test]
fn test_host_simulated_entities_ignore_peer_positions() {
    let mut host = in_game_host(MovementAuthority::HostSimulated);
    let before = host.entity(1).unwrap().position;

    deliver(&mut host, 1, &position_update(1, Vec3::new(5.0, 1.0, 5.0), 0.0));
    host.tick(0.1);

    assert_eq!(host.entity(1).unwrap().position, before);
    assert!(broadcasts(&host.drain_outbox()).is_empty());
    assert_eq!(host.stats().violations, 1);
}

#[test]
fn test_move_command_drives_host_simulation() {
    let mut host = in_game_host(MovementAuthority::HostSimulated);
    let start = host.entity(1).unwrap().position;
    let target = Vec3::new(0.0, 1.0, 0.0);

    deliver(&mut host, 1, &Packet::MoveCommand { identity: 1, target });
    for _ in 0..10 {
        host.tick(0.05);
    }

    let entity = host.entity(1).unwrap();
    assert!(entity.position.distance(target) < start.distance(target));

    let updates: Vec<Packet> = host
        .drain_outbox()
        .iter()
        .filter(|o| o.destination == Destination::AllPeers)
        .map(|o| o.packet().unwrap())
        .collect();
    assert!(!updates.is_empty());
    assert!(updates
        .iter()
        .all(|p| matches!(p, Packet::PositionUpdate { identity: 1, .. })));
}

#[test]
fn test_move_command_refused_when_owners_simulate() {
    let mut host = in_game_host(MovementAuthority::OwnerSimulated);
    deliver(
        &mut host,
        1,
        &Packet::MoveCommand {
            identity: 1,
            target: Vec3::ZERO,
        },
    );
    assert!(host.entity(1).unwrap().locomotion.target.is_none());
    assert_eq!(host.stats().violations, 1);
}

#[test]
fn test_invalid_loadout_from_peer_is_dropped() {
    let mut host = in_game_host(MovementAuthority::HostSimulated);
    deliver(
        &mut host,
        1,
        &Packet::ClassSelected {
            identity: 1,
            loadout_index: 42,
        },
    );
    assert_eq!(host.directory().get(1).unwrap().loadout_index, 0);
    assert!(host.drain_outbox().is_empty());
}

#[test]
fn test_late_joiner_receives_roster_then_game_start() {
    let mut host = in_game_host(MovementAuthority::HostSimulated);
    host.handle_transport_event(TransportEvent::PeerConnected {
        peer: PeerHandle(3),
        platform_id: HOST_PLATFORM + 3,
    });

    let to_late: Vec<Packet> = host
        .drain_outbox()
        .iter()
        .filter(|o| o.destination == Destination::Peer(PeerHandle(3)))
        .map(|o| o.packet().unwrap())
        .collect();
    assert_eq!(to_late.first(), Some(&Packet::Handshake { identity: 3 }));
    let syncs = to_late
        .iter()
        .filter(|p| matches!(p, Packet::SessionSync { .. }))
        .count();
    assert_eq!(syncs, 3);
    assert_eq!(
        to_late.last(),
        Some(&Packet::GameStart {
            map_path: "res://maps/arena.tscn".into()
        })
    );
    assert!(host.entity(3).is_some());
}
