//! End-to-end: a client joins a QUIC server on loopback and downloads the world.

use isoworld_client::{ClientEvent, GameClient};
use isoworld_net::QuicServerTransport;
use isoworld_server::{GameServer, PlayerEvent, ServerSettings, UploadLimits};
use isoworld_world::{generate_terrain, GridDims, TerrainConfig};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

const DEADLINE: Duration = Duration::from_secs(20);

fn start_server(settings: ServerSettings) -> (GameServer, SocketAddr) {
    let dims = GridDims::new(100, 100, 3).unwrap();
    let grid = generate_terrain(dims, &TerrainConfig::default());
    let transport = QuicServerTransport::new("127.0.0.1:0".parse().unwrap());
    let mut server = GameServer::new(settings, grid, transport).unwrap();
    server.start().unwrap();
    let addr = server.local_addr().unwrap();
    (server, addr)
}

/// Tick both sides until `done` sees an event it wants.
fn run_until(
    server: &mut GameServer,
    client: &mut GameClient,
    mut done: impl FnMut(&ClientEvent) -> bool,
) -> Vec<ClientEvent> {
    let started = Instant::now();
    let mut seen = Vec::new();
    loop {
        server.update();
        for event in client.update() {
            let stop = done(&event);
            seen.push(event);
            if stop {
                return seen;
            }
        }
        assert!(started.elapsed() < DEADLINE, "timed out; saw {seen:?}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn client_downloads_identical_world() {
    let (mut server, addr) = start_server(ServerSettings {
        password: Some("hunter2".into()),
        ..ServerSettings::default()
    });
    let mut client = GameClient::quic().unwrap();
    client.connect(addr, " hunter2 ", "ann").unwrap();

    let events = run_until(&mut server, &mut client, |e| *e == ClientEvent::WorldReady);
    assert_eq!(events[0], ClientEvent::Connected);
    let info = events
        .iter()
        .find_map(|e| match e {
            ClientEvent::WorldInfo(info) => Some(info.clone()),
            _ => None,
        })
        .expect("world info event");
    assert_eq!(info.total_chunks, 59);
    assert_eq!(info.player_count, 1);

    assert_eq!(client.world(), Some(server.grid()));
    assert_eq!(server.player(0).unwrap().name, "ann");

    client.disconnect();
    let started = Instant::now();
    while server.players().count() > 0 {
        server.update();
        client.update();
        assert!(started.elapsed() < DEADLINE, "player never left");
        std::thread::sleep(Duration::from_millis(2));
    }
    let events = server.drain_player_events();
    assert!(matches!(events.last(), Some(PlayerEvent::Left(p)) if p.id == 0));

    client.shutdown("done");
    server.shutdown("done");
}

#[test]
fn wrong_password_is_refused_with_reason() {
    let (mut server, addr) = start_server(ServerSettings {
        password: Some("hunter2".into()),
        ..ServerSettings::default()
    });
    let mut client = GameClient::quic().unwrap();
    client.connect(addr, "guess", "bob").unwrap();

    let events = run_until(&mut server, &mut client, |e| {
        matches!(e, ClientEvent::Disconnected { .. })
    });
    assert_eq!(
        events.last(),
        Some(&ClientEvent::Disconnected {
            reason: "Incorrect password".into()
        })
    );
    assert_eq!(server.players().count(), 0);
    server.shutdown("done");
}

#[test]
fn uploads_stay_within_tick_budget() {
    let (mut server, addr) = start_server(ServerSettings {
        uploads: UploadLimits {
            max_concurrent_uploads: 1,
            max_chunks_per_tick: 2,
            chunk_size: 512,
        },
        ..ServerSettings::default()
    });
    let mut first = GameClient::quic().unwrap();
    let mut second = GameClient::quic().unwrap();
    first.connect(addr, "", "ann").unwrap();
    second.connect(addr, "", "bob").unwrap();

    let started = Instant::now();
    let mut ready = 0;
    while ready < 2 {
        let stats = server.update();
        assert!(stats.chunks_sent <= 2);
        for client in [&mut first, &mut second] {
            ready += client
                .update()
                .iter()
                .filter(|e| **e == ClientEvent::WorldReady)
                .count();
        }
        assert!(started.elapsed() < DEADLINE, "downloads did not finish");
        std::thread::sleep(Duration::from_millis(2));
    }
    assert_eq!(first.world(), Some(server.grid()));
    assert_eq!(second.world(), Some(server.grid()));
    server.shutdown("done");
}
