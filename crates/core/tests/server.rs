//! End-to-end tests driving the pipe server through real client
//! connections.

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::{sleep, timeout};

use arcbridge_core::app::{ApplicationData, BridgeConfig};
use arcbridge_core::combat::CombatEvent;
use arcbridge_core::extras::UserInfo;
use arcbridge_core::msg::de::{self, DecodedBody, MessageHeader};
use arcbridge_core::msg::{timestamp_ms, Message, MessageProtocol, MessageType, ProtocolMask};
use arcbridge_core::pipe::PipeStream;
use arcbridge_core::squad::{DeltaSource, PlayerInfo, SquadDelta};
use arcbridge_core::PipeHandler;

fn init() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .is_test(true)
        .try_init();
}

fn sock_path(name: &str) -> String {
    let mut path = std::env::temp_dir();
    path.push(format!("arcbridge-{}-{}.sock", name, std::process::id()));
    path.to_string_lossy().into_owned()
}

fn app_with(config: BridgeConfig) -> Arc<ApplicationData> {
    Arc::new(ApplicationData::new(config))
}

/// Client side of the pipe with buffering: consecutive server writes may
/// arrive coalesced in one read on stream transports.
struct TestClient {
    stream: PipeStream,
    buf: Vec<u8>,
}

impl TestClient {
    async fn connect(addr: &str) -> TestClient {
        let stream = timeout(Duration::from_secs(2), PipeStream::connect(addr))
            .await
            .expect("connect timed out")
            .expect("connect failed");
        TestClient {
            stream,
            buf: Vec::new(),
        }
    }

    async fn subscribe(&mut self, mask: u8, protocol: &str) {
        let request = format!(r#"{{"subscribe":{},"protocol":"{}"}}"#, mask, protocol);
        self.stream
            .write_message(request.as_bytes())
            .await
            .expect("subscription write failed");
    }

    async fn fill(&mut self) {
        let chunk = timeout(Duration::from_secs(2), self.stream.read_message())
            .await
            .expect("read timed out")
            .expect("read failed");
        self.buf.extend_from_slice(&chunk);
    }

    /// Next text-protocol message as a parsed object.
    async fn next_text(&mut self) -> Value {
        for _ in 0..8 {
            if !self.buf.is_empty() {
                let mut iter =
                    serde_json::Deserializer::from_slice(&self.buf).into_iter::<Value>();
                if let Some(Ok(value)) = iter.next() {
                    let consumed = iter.byte_offset();
                    self.buf.drain(..consumed);
                    return value;
                }
            }
            self.fill().await;
        }
        panic!("no complete text message after several reads");
    }

    /// Next binary-protocol message.
    async fn next_binary(&mut self) -> (MessageHeader, DecodedBody) {
        for _ in 0..8 {
            if !self.buf.is_empty() {
                if let Some((consumed, header, body)) = split_binary(&self.buf) {
                    self.buf.drain(..consumed);
                    return (header, body);
                }
            }
            self.fill().await;
        }
        panic!("no complete binary message after several reads");
    }
}

/// Parse one binary frame off the front of `buf`, reporting how many
/// bytes it consumed.
fn split_binary(buf: &[u8]) -> Option<(usize, MessageHeader, DecodedBody)> {
    let (body, header) = de::message_header(buf).ok()?;

    let (rest, decoded) = match header.mtype {
        2 => {
            let (rest, (major, minor, info)) = de::bridge_info(body).ok()?;
            (rest, DecodedBody::BridgeInfo(major, minor, info))
        }
        4 => (body, DecodedBody::Closing),
        5 => {
            let (rest, event) = de::combat_event(body).ok()?;
            (rest, DecodedBody::CombatEvent(event))
        }
        10 => {
            let (rest, members) = de::squad_members(body).ok()?;
            (rest, DecodedBody::SquadStatus(members))
        }
        11 => {
            let (rest, (source, entry)) = de::squad_delta(body).ok()?;
            (rest, DecodedBody::SquadAdd(source, entry))
        }
        12 => {
            let (rest, (source, entry)) = de::squad_delta(body).ok()?;
            (rest, DecodedBody::SquadUpdate(source, entry))
        }
        _ => return None,
    };

    Some((buf.len() - rest.len(), header, decoded))
}

fn combat_message(app: &ApplicationData, protocols: ProtocolMask, id: u64) -> Message {
    let event = CombatEvent {
        id,
        revision: 1,
        skill_name: Some("Test Skill".to_owned()),
        ..Default::default()
    };
    Message::from_payload(
        MessageType::CombatEvent,
        app.next_id(),
        timestamp_ms(),
        protocols,
        &event,
    )
}

fn extras_message(app: &ApplicationData, protocols: ProtocolMask) -> Message {
    let info = UserInfo {
        account_name: Some(":Someone.1234".to_owned()),
        join_time: 5,
        role: 3,
        subgroup: 1,
        ready_status: false,
    };
    Message::from_payload(
        MessageType::ExtrasSquadUpdate,
        app.next_id(),
        timestamp_ms(),
        protocols,
        &info,
    )
}

#[tokio::test]
async fn text_client_receives_only_subscribed_categories() {
    init();
    let addr = sock_path("text-combat");
    let app = app_with(BridgeConfig::default());
    let handler = PipeHandler::new(addr.clone(), Arc::clone(&app));
    handler.start();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut client = TestClient::connect(&addr).await;

    let hello = client.next_text().await;
    assert_eq!(hello["type"], "ConnectionStatus");
    assert_eq!(hello["data"]["success"], true);
    assert_eq!(hello["data"]["majorApiVersion"], 2);
    assert_eq!(
        hello["data"]["types"].as_array().unwrap().len(),
        13,
        "closed set of type names"
    );

    client.subscribe(2, "Text").await;
    let status = client.next_text().await;
    assert_eq!(status["type"], "Status");
    assert_eq!(status["data"]["success"], true);

    // Give the handshake time to commit before producing.
    sleep(Duration::from_millis(50)).await;
    assert!(handler.tracking().using_protocol(MessageProtocol::Text));

    let protocols = handler.tracking().protocols();
    handler.send_messages(vec![
        extras_message(&app, protocols),
        combat_message(&app, protocols, 77),
    ]);

    // Only the combat message comes through.
    let combat = client.next_text().await;
    assert_eq!(combat["category"], "Combat");
    assert_eq!(combat["type"], "CombatEvent");
    assert_eq!(combat["data"]["id"], 77);

    handler.stop().await;
}

#[tokio::test]
async fn empty_subscription_is_rejected() {
    init();
    let addr = sock_path("reject-empty");
    let app = app_with(BridgeConfig::default());
    let handler = PipeHandler::new(addr.clone(), Arc::clone(&app));
    handler.start();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut client = TestClient::connect(&addr).await;
    let hello = client.next_text().await;
    assert_eq!(hello["type"], "ConnectionStatus");

    client.subscribe(0, "Text").await;
    let status = client.next_text().await;
    assert_eq!(status["type"], "Status");
    assert_eq!(status["data"]["success"], false);
    assert_eq!(status["data"]["error"], "no subscription");

    // The server closes the connection afterwards.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(handler.client_count(), 0);

    handler.stop().await;
}

#[tokio::test]
async fn binary_squad_client_gets_snapshot_then_binary_frames() {
    init();
    let addr = sock_path("binary-squad");
    let app = app_with(BridgeConfig::default());
    app.set_self_account("Me.1000");

    let mut roster = None;
    app.squad.add_player(
        PlayerInfo {
            account_name: "Alice.1234".to_owned(),
            subgroup: 1,
            ..Default::default()
        },
        |entry| roster = Some(entry.clone()),
        |_| {},
    );
    let roster = roster.unwrap();

    let handler = PipeHandler::new(addr.clone(), Arc::clone(&app));
    handler.start();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut client = TestClient::connect(&addr).await;

    // The handshake stays text even for binary subscribers.
    let hello = client.next_text().await;
    assert_eq!(hello["type"], "ConnectionStatus");
    client.subscribe(8, "Binary").await;
    let status = client.next_text().await;
    assert_eq!(status["data"]["success"], true);

    // Snapshot arrives in binary framing.
    let (header, body) = client.next_binary().await;
    assert_eq!(header.category, 8);
    assert_eq!(header.mtype, 10);
    match body {
        DecodedBody::SquadStatus(members) => {
            assert_eq!(members.len(), 1);
            assert_eq!(members[0].player.account_name, "Alice.1234");
        }
        other => panic!("expected snapshot, got {:?}", other),
    }

    sleep(Duration::from_millis(50)).await;
    let protocols = handler.tracking().protocols();
    assert!(protocols.contains(MessageProtocol::Binary));

    // A squad delta and a combat event; only the delta may arrive, and
    // with the binary category byte.
    let delta = Message::from_payload(
        MessageType::SquadAdd,
        app.next_id(),
        timestamp_ms(),
        protocols,
        &SquadDelta {
            source: DeltaSource::Combat,
            entry: &roster,
        },
    );
    handler.send_messages(vec![combat_message(&app, ProtocolMask::ALL, 5), delta]);

    let (header, body) = client.next_binary().await;
    assert_eq!(header.category, 8);
    match body {
        DecodedBody::SquadAdd(source, entry) => {
            assert_eq!(source, DeltaSource::Combat as u8);
            assert_eq!(entry.player.account_name, "Alice.1234");
        }
        other => panic!("expected squad add, got {:?}", other),
    }

    handler.stop().await;
}

#[tokio::test]
async fn excess_clients_are_rejected_with_connection_status() {
    init();
    let addr = sock_path("max-clients");
    let app = app_with(BridgeConfig {
        max_clients: 1,
        ..Default::default()
    });
    let handler = PipeHandler::new(addr.clone(), Arc::clone(&app));
    handler.start();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut first = TestClient::connect(&addr).await;
    let hello = first.next_text().await;
    assert_eq!(hello["data"]["success"], true);
    first.subscribe(2, "Text").await;
    let status = first.next_text().await;
    assert_eq!(status["data"]["success"], true);

    let mut second = TestClient::connect(&addr).await;
    let rejected = second.next_text().await;
    assert_eq!(rejected["type"], "ConnectionStatus");
    assert_eq!(rejected["data"]["success"], false);
    assert!(rejected["data"]["error"]
        .as_str()
        .unwrap()
        .contains("max"));

    // The first client is unaffected.
    sleep(Duration::from_millis(50)).await;
    let protocols = handler.tracking().protocols();
    handler.send_message(combat_message(&app, protocols, 3));
    let combat = first.next_text().await;
    assert_eq!(combat["category"], "Combat");
    assert_eq!(handler.client_count(), 1);

    handler.stop().await;
}

#[tokio::test]
async fn silent_disconnect_is_detected_by_the_idle_probe() {
    init();
    let addr = sock_path("idle-probe");
    let app = app_with(BridgeConfig {
        client_timeout: Duration::from_millis(100),
        ..Default::default()
    });
    let handler = PipeHandler::new(addr.clone(), Arc::clone(&app));
    handler.start();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut client = TestClient::connect(&addr).await;
    client.next_text().await;
    client.subscribe(2, "Text").await;
    client.next_text().await;

    sleep(Duration::from_millis(50)).await;
    assert_eq!(handler.client_count(), 1);

    drop(client);
    // No events flow; the next idle probe notices the hangup.
    sleep(Duration::from_millis(400)).await;
    assert_eq!(handler.client_count(), 0);
    assert!(!handler.tracking().using_protocol(MessageProtocol::Text));

    handler.stop().await;
}

#[tokio::test]
async fn bridge_info_revisions_are_delivered_once_in_order() {
    init();
    let addr = sock_path("bridge-info");
    let app = app_with(BridgeConfig::default());
    let handler = PipeHandler::new(addr.clone(), Arc::clone(&app));
    handler.start();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut client = TestClient::connect(&addr).await;
    client.next_text().await;
    client.subscribe(2, "Text").await;
    client.next_text().await;
    sleep(Duration::from_millis(50)).await;

    let (validator, info) = app.update_info(|info| info.arc_loaded = true).unwrap();
    assert_eq!(validator, 2);

    let make_msg = || {
        Message::from_payload(
            MessageType::BridgeInfo,
            app.next_id(),
            timestamp_ms(),
            ProtocolMask::ALL,
            &info,
        )
    };

    // Broadcasting the same revision twice only delivers it once.
    handler.send_bridge_info(make_msg(), validator);
    handler.send_bridge_info(make_msg(), validator);

    let update = client.next_text().await;
    assert_eq!(update["type"], "BridgeInfo");
    assert_eq!(update["data"]["validator"], 2);
    assert_eq!(update["data"]["arcLoaded"], true);

    // The next thing on the wire must be a newer revision, not a repeat.
    let (validator, info) = app
        .update_info(|info| info.extras_found = true)
        .unwrap();
    assert_eq!(validator, 3);
    let msg = Message::from_payload(
        MessageType::BridgeInfo,
        app.next_id(),
        timestamp_ms(),
        ProtocolMask::ALL,
        &info,
    );
    handler.send_bridge_info(msg, validator);

    let update = client.next_text().await;
    assert_eq!(update["data"]["validator"], 3);

    handler.stop().await;
}

#[tokio::test]
async fn clients_receive_closing_on_shutdown() {
    init();
    let addr = sock_path("closing");
    let app = app_with(BridgeConfig::default());
    let handler = PipeHandler::new(addr.clone(), Arc::clone(&app));
    handler.start();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut client = TestClient::connect(&addr).await;
    client.next_text().await;
    client.subscribe(2, "Text").await;
    client.next_text().await;
    sleep(Duration::from_millis(50)).await;

    handler.stop().await;

    let goodbye = client.next_text().await;
    assert_eq!(goodbye["type"], "Closing");
    assert_eq!(goodbye["category"], "Info");
}
