//! End-to-end tests: a running server, real room tasks, clients on each
//! transport.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use rally_config::{Config, RoomPreset, TransportKind};
use rally_net::messages::{ClientProfile, RegisterRequest, SpawnRequest};
use rally_net::{DeliveryMode, Envelope, MemoryClient, Message, UdpClient, UdpSettings};
use rally_room::RoomRequest;
use rally_server::RelayServer;

fn config() -> Config {
    let mut config = Config::default();
    config.server.bind_address = "127.0.0.1".to_string();
    config.server.tick_interval_ms = 5;
    config.websocket.enabled = false;
    config.websocket.port = 0;
    config.udp.enabled = false;
    config.udp.base_port = 0;
    config
}

fn preset(name: &str, transport: TransportKind) -> RoomPreset {
    RoomPreset {
        name: name.to_string(),
        transport,
        version: "1.0".to_string(),
        ..RoomPreset::default()
    }
}

fn register(name: &str) -> Message {
    Message::Register(RegisterRequest {
        profile: ClientProfile {
            name: name.to_string(),
            attributes: BTreeMap::new(),
        },
        version: "1.0".to_string(),
        password: None,
    })
}

fn encode(message: &Message) -> Vec<u8> {
    message.to_envelope().unwrap().to_bytes().unwrap()
}

fn decode(packet: &[u8]) -> Vec<Message> {
    Envelope::decode_all(packet)
        .unwrap()
        .iter()
        .map(|envelope| Message::from_envelope(envelope).unwrap())
        .collect()
}

async fn recv_until(client: &MemoryClient, want: impl Fn(&Message) -> bool) -> Vec<Message> {
    let mut seen = Vec::new();
    for _ in 0..400 {
        seen.extend(client.poll_messages());
        if seen.iter().any(&want) {
            return seen;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("expected message never arrived, got {seen:?}");
}

async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never held");
}

#[tokio::test]
async fn test_memory_room_late_joiner() {
    let mut config = config();
    config.presets.push(preset("Lobby", TransportKind::Memory));
    let server = RelayServer::start(config).await.unwrap();
    let room = server.registry().list()[0].id;

    let a = server.memory().connect("lobby").unwrap();
    a.send_message(&register("a"), DeliveryMode::ReliableOrdered).unwrap();
    recv_until(&a, |m| matches!(m, Message::RegisterAccepted(_))).await;
    a.send_message(&Message::Ready, DeliveryMode::ReliableOrdered).unwrap();
    recv_until(&a, |m| *m == Message::ReplayComplete).await;

    let spawn = Message::SpawnEntity(SpawnRequest {
        token: 5,
        type_tag: 1,
        persistent: false,
        behaviours: 1,
        payload: Vec::new(),
    });
    a.send_message(&spawn, DeliveryMode::ReliableOrdered).unwrap();
    recv_until(&a, |m| matches!(m, Message::EntitySpawned(s) if s.token == 5)).await;

    let b = server.memory().connect("lobby").unwrap();
    b.send_message(&register("b"), DeliveryMode::ReliableOrdered).unwrap();
    let messages = recv_until(&b, |m| matches!(m, Message::RegisterAccepted(_))).await;
    let Some(Message::RegisterAccepted(accepted)) = messages.first() else {
        panic!("expected acceptance, got {messages:?}");
    };
    assert_eq!(accepted.entities.len(), 1);
    assert_eq!(accepted.clients.len(), 2);
    recv_until(&a, |m| matches!(m, Message::ClientJoined(c) if c.profile.name == "b")).await;

    let registry = server.registry().clone();
    eventually(|| registry.get(room).is_some_and(|info| info.occupancy == 2)).await;

    server.shutdown().await;
    recv_until(&a, |m| *m == Message::RoomClosing).await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_websocket_room() {
    let mut config = config();
    config.websocket.enabled = true;
    config.presets.push(preset("Arena", TransportKind::WebSocket));
    let server = RelayServer::start(config).await.unwrap();
    let addr = server.websocket_addr().unwrap();

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/arena"))
        .await
        .unwrap();
    ws.send(WsMessage::Binary(encode(&register("web"))))
        .await
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let WsMessage::Binary(packet) = reply else {
        panic!("expected binary frame, got {reply:?}");
    };
    assert!(matches!(
        decode(&packet).first(),
        Some(Message::RegisterAccepted(accepted)) if accepted.room.name == "Arena"
    ));

    server.shutdown().await;
}

#[tokio::test]
async fn test_udp_room() {
    let mut config = config();
    config.udp.enabled = true;
    let server = RelayServer::start(config).await.unwrap();
    let handle = server
        .create_room(
            RoomRequest {
                name: "Raid".to_string(),
                version: "1.0".to_string(),
                capacity: 4,
                ..RoomRequest::default()
            },
            TransportKind::Udp,
        )
        .unwrap();
    let addr: SocketAddr = handle
        .address
        .strip_prefix("udp://")
        .unwrap()
        .parse()
        .unwrap();

    let mut client = UdpClient::connect(addr, UdpSettings::default()).await.unwrap();
    client
        .send_message(&register("udp"), DeliveryMode::ReliableOrdered)
        .await
        .unwrap();

    let mut accepted = None;
    for _ in 0..20 {
        for message in client.recv_messages(Duration::from_millis(100)).await {
            if let Message::RegisterAccepted(a) = message {
                accepted = Some(a);
            }
        }
        if accepted.is_some() {
            break;
        }
    }
    let accepted = accepted.expect("registration accepted over UDP");
    assert_eq!(accepted.room.capacity, 4);

    client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_empty_room_auto_closes() {
    let mut config = config();
    config.rooms.auto_close_ms = 30;
    let server = RelayServer::start(config).await.unwrap();
    server
        .create_room(
            RoomRequest {
                name: "Brief".to_string(),
                version: "1.0".to_string(),
                ..RoomRequest::default()
            },
            TransportKind::Memory,
        )
        .unwrap();
    assert_eq!(server.registry().len(), 1);

    let registry = server.registry().clone();
    eventually(|| registry.is_empty()).await;
    assert!(server.memory().connect("brief").is_err());
}

#[tokio::test]
async fn test_close_room() {
    let server = RelayServer::start(config()).await.unwrap();
    let handle = server
        .create_room(
            RoomRequest {
                name: "Doomed".to_string(),
                version: "1.0".to_string(),
                ..RoomRequest::default()
            },
            TransportKind::Memory,
        )
        .unwrap();

    let client = server.memory().connect("doomed").unwrap();
    assert!(server.close_room(handle.info.id));
    recv_until(&client, |m| *m == Message::RoomClosing).await;

    let registry = server.registry().clone();
    eventually(|| registry.is_empty()).await;
    assert!(!server.close_room(handle.info.id));
}
