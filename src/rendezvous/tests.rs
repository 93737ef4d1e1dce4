//! Tests for the rendezvous wire format and the client/relay pair

use super::*;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

#[test]
fn test_offer_message_format() {
    let offer = SignalMessage::offer(
        &PeerIdentifier::from("alice"),
        &PeerIdentifier::from("bob"),
        SessionDescription::offer("v=0\r\no=- 123 456 IN IP4 127.0.0.1\r\n"),
    );
    let json = serde_json::to_string(&offer).unwrap();

    assert!(json.contains("\"type\":\"OFFER\""));
    assert!(json.contains("\"from\":\"alice\""));
    assert!(json.contains("\"to\":\"bob\""));
    assert!(json.contains("\"data\":{\"type\":\"offer\""));

    let parsed: SignalMessage = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.msg_type(), "OFFER");
    assert_eq!(parsed.recipient(), Some(&PeerIdentifier::from("bob")));
    assert_eq!(parsed.sender(), Some(&PeerIdentifier::from("alice")));
}

#[test]
fn test_parse_rtc_aliases() {
    let offer = r#"{"type":"RTC_OFFER","from":"a","to":"b","data":{"type":"offer","sdp":"x"}}"#;
    let answer = r#"{"type":"RTC_ANSWER","from":"b","to":"a","data":{"type":"answer","sdp":"y"}}"#;
    let ice = r#"{"type":"RTC_ICE","from":"b","to":"a","data":{"candidate":"candidate:1 1 UDP 2130706431 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}}"#;

    assert_eq!(serde_json::from_str::<SignalMessage>(offer).unwrap().msg_type(), "OFFER");
    assert_eq!(serde_json::from_str::<SignalMessage>(answer).unwrap().msg_type(), "ANSWER");

    match serde_json::from_str::<SignalMessage>(ice).unwrap() {
        SignalMessage::IceCandidate { data, .. } => {
            assert_eq!(data.sdp_mid.as_deref(), Some("0"));
            assert_eq!(data.sdp_mline_index, Some(0));
            assert!(data.username_fragment.is_none());
        }
        other => panic!("Expected ICE candidate, got {:?}", other),
    }
}

#[test]
fn test_fallback_payload_is_base64() {
    let msg = SignalMessage::fallback(
        &PeerIdentifier::from("alice"),
        &PeerIdentifier::from("bob"),
        Bytes::from_static(b"hi"),
    );
    let json = serde_json::to_string(&msg).unwrap();
    assert!(json.contains("\"type\":\"DATA_FALLBACK\""));
    assert!(json.contains("\"data\":\"aGk=\""));

    let parsed: SignalMessage = serde_json::from_str(&json).unwrap();
    match parsed {
        SignalMessage::DataFallback { data, .. } => assert_eq!(&data[..], b"hi"),
        other => panic!("Expected fallback, got {:?}", other),
    }
}

#[test]
fn test_welcome_and_presence_format() {
    let welcome: SignalMessage = serde_json::from_str(r#"{"type":"welcome","clientId":"abc"}"#).unwrap();
    assert_eq!(
        welcome,
        SignalMessage::Welcome {
            client_id: PeerIdentifier::from("abc")
        }
    );

    let presence: SignalMessage =
        serde_json::from_str(r#"{"type":"presence","id":"abc","joined":true}"#).unwrap();
    assert_eq!(
        presence,
        SignalMessage::Presence {
            id: PeerIdentifier::from("abc"),
            joined: true,
            room_id: None
        }
    );

    let register = SignalMessage::RegisterPublicKey {
        public_key: "02ab".to_string(),
    };
    let json = serde_json::to_string(&register).unwrap();
    assert_eq!(json, r#"{"type":"registerPublicKey","publicKey":"02ab"}"#);
}

#[test]
fn test_unknown_type_is_noop_variant() {
    let parsed: SignalMessage =
        serde_json::from_str(r#"{"type":"typing","from":"a","to":"b","data":1}"#).unwrap();
    assert_eq!(parsed, SignalMessage::Unknown);
    assert!(parsed.recipient().is_none());
}

#[test]
fn test_malformed_frames_fail_to_decode() {
    assert!(serde_json::from_str::<SignalMessage>("not json").is_err());
    assert!(serde_json::from_str::<SignalMessage>(r#"{"no_type":true}"#).is_err());
    // Addressed frame without recipient
    assert!(serde_json::from_str::<SignalMessage>(r#"{"type":"OFFER","data":{"type":"offer","sdp":""}}"#).is_err());
    // Fallback payload that is not base64
    assert!(serde_json::from_str::<SignalMessage>(r#"{"type":"DATA_FALLBACK","to":"b","data":"***"}"#).is_err());
}

#[test]
fn test_peer_identifier_format() {
    let id = PeerIdentifier::generate();
    assert_eq!(id.as_str().len(), 30);
    assert_eq!(id.short().len(), 8);
    assert_ne!(id, PeerIdentifier::generate());

    let json = serde_json::to_string(&PeerIdentifier::from("xyz")).unwrap();
    assert_eq!(json, "\"xyz\"");
}

#[test]
fn test_rendezvous_config_defaults() {
    let config = RendezvousConfig::default();
    assert!(config.url.starts_with("ws://"));
    assert!(config.auto_reconnect);
    assert!(config.max_pending > 0);
    assert!(config.retry_delay_ms <= config.max_retry_delay_ms);
}

async fn start_relay() -> RelayHandle {
    start_relay_server("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap()
}

fn client_for(relay: &RelayHandle) -> RendezvousClient {
    RendezvousClient::new(RendezvousConfig {
        url: relay.ws_url(),
        retry_delay_ms: 50,
        max_retry_delay_ms: 200,
        ..Default::default()
    })
}

fn collect(client: &RendezvousClient) -> (Subscription, mpsc::UnboundedReceiver<SignalMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sub = client.on(move |msg| {
        let _ = tx.send(msg.clone());
    });
    (sub, rx)
}

async fn next_matching<F>(rx: &mut mpsc::UnboundedReceiver<SignalMessage>, pred: F) -> Option<SignalMessage>
where
    F: Fn(&SignalMessage) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(msg) = rx.recv().await {
            if pred(&msg) {
                return Some(msg);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

#[tokio::test]
async fn test_welcome_assigns_id_and_registers_key() {
    let relay = start_relay().await;
    let client = RendezvousClient::new(RendezvousConfig {
        url: relay.ws_url(),
        public_key: Some("02deadbeef".to_string()),
        ..Default::default()
    });
    client.connect();

    let id = client.wait_for_id(Duration::from_secs(5)).await.expect("welcome");
    assert_eq!(client.status(), LinkStatus::Open);

    let mut registered = None;
    for _ in 0..50 {
        registered = relay.state.public_key(&id).await;
        if registered.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(registered.as_deref(), Some("02deadbeef"));

    client.shutdown();
    relay.shutdown();
}

#[tokio::test]
async fn test_wait_for_id_times_out_without_session() {
    let client = RendezvousClient::new(RendezvousConfig {
        url: "ws://127.0.0.1:9/".to_string(),
        auto_reconnect: false,
        ..Default::default()
    });
    assert_eq!(client.wait_for_id(Duration::from_millis(100)).await, None);
    client.shutdown();
}

#[tokio::test]
async fn test_connect_is_idempotent() {
    let relay = start_relay().await;
    let client = client_for(&relay);
    let (_sub, _rx) = collect(&client);

    client.connect();
    client.connect();
    let first = client.wait_for_id(Duration::from_secs(5)).await.unwrap();
    client.connect();
    client.connect();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(relay.state.stats().await.clients, 1);
    assert_eq!(client.local_id(), Some(first));
    assert_eq!(client.listener_count(), 1);

    client.shutdown();
    relay.shutdown();
}

#[tokio::test]
async fn test_send_before_connect_is_delivered() {
    let relay = start_relay().await;
    let bob = client_for(&relay);
    let (_sub, mut bob_rx) = collect(&bob);
    bob.connect();
    let bob_id = bob.wait_for_id(Duration::from_secs(5)).await.unwrap();

    // Alice never calls connect(); the send itself drives the reconnect
    let alice = client_for(&relay);
    alice
        .send(SignalMessage::fallback(
            &PeerIdentifier::default(),
            &bob_id,
            Bytes::from_static(b"early"),
        ))
        .unwrap();

    let msg = next_matching(&mut bob_rx, |m| matches!(m, SignalMessage::DataFallback { .. }))
        .await
        .expect("queued frame delivered");
    let alice_id = alice.wait_for_id(Duration::from_secs(5)).await.unwrap();
    match msg {
        SignalMessage::DataFallback { from, to, data } => {
            assert_eq!(from, alice_id);
            assert_eq!(to, bob_id);
            assert_eq!(&data[..], b"early");
        }
        other => panic!("unexpected {:?}", other),
    }

    alice.shutdown();
    bob.shutdown();
    relay.shutdown();
}

#[tokio::test]
async fn test_sender_cannot_spoof_from() {
    let relay = start_relay().await;
    let alice = client_for(&relay);
    let bob = client_for(&relay);
    let (_sub, mut bob_rx) = collect(&bob);
    alice.connect();
    bob.connect();
    let alice_id = alice.wait_for_id(Duration::from_secs(5)).await.unwrap();
    let bob_id = bob.wait_for_id(Duration::from_secs(5)).await.unwrap();

    alice
        .send(SignalMessage::fallback(
            &PeerIdentifier::from("mallory"),
            &bob_id,
            Bytes::from_static(b"x"),
        ))
        .unwrap();

    let msg = next_matching(&mut bob_rx, |m| matches!(m, SignalMessage::DataFallback { .. }))
        .await
        .unwrap();
    assert_eq!(msg.sender(), Some(&alice_id));

    alice.shutdown();
    bob.shutdown();
    relay.shutdown();
}

#[tokio::test]
async fn test_unsubscribe_removes_only_that_listener() {
    let relay = start_relay().await;
    let client = client_for(&relay);
    let (first, _rx1) = collect(&client);
    let (_second, _rx2) = collect(&client);
    assert_eq!(client.listener_count(), 2);

    first.unsubscribe();
    assert_eq!(client.listener_count(), 1);

    client.shutdown();
    relay.shutdown();
}

#[tokio::test]
async fn test_room_presence_and_relay() {
    let relay = start_relay().await;
    let alice = client_for(&relay);
    let bob = client_for(&relay);
    let (_a, mut alice_rx) = collect(&alice);
    let (_b, mut bob_rx) = collect(&bob);
    alice.connect();
    bob.connect();
    let alice_id = alice.wait_for_id(Duration::from_secs(5)).await.unwrap();
    let bob_id = bob.wait_for_id(Duration::from_secs(5)).await.unwrap();

    alice.join("lobby").unwrap();
    next_matching(&mut alice_rx, |m| matches!(m, SignalMessage::Presence { joined: true, .. }))
        .await
        .expect("own presence");

    bob.join("lobby").unwrap();
    let presence = next_matching(&mut alice_rx, |m| {
        matches!(m, SignalMessage::Presence { id, joined: true, .. } if *id == bob_id)
    })
    .await;
    assert!(presence.is_some());

    // Repeat join leaves membership unchanged
    bob.join("lobby").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(relay.state.room_members("lobby").await.len(), 2);

    bob.relay("lobby", serde_json::json!({"text": "hello room"})).unwrap();
    let relayed = next_matching(&mut alice_rx, |m| matches!(m, SignalMessage::Relay { .. }))
        .await
        .unwrap();
    match relayed {
        SignalMessage::Relay { from, payload, .. } => {
            assert_eq!(from, Some(bob_id.clone()));
            assert_eq!(payload["text"], "hello room");
        }
        other => panic!("unexpected {:?}", other),
    }
    // The sender does not get its own relay back
    assert!(
        tokio::time::timeout(Duration::from_millis(200), async {
            loop {
                match bob_rx.recv().await {
                    Some(SignalMessage::Relay { .. }) => return,
                    Some(_) => continue,
                    None => std::future::pending::<()>().await,
                }
            }
        })
        .await
        .is_err()
    );

    bob.shutdown();
    let left = next_matching(&mut alice_rx, |m| {
        matches!(m, SignalMessage::Presence { id, joined: false, .. } if *id == bob_id)
    })
    .await;
    assert!(left.is_some());
    assert_eq!(relay.state.room_members("lobby").await, vec![alice_id]);

    alice.shutdown();
    relay.shutdown();
}

/// Serve one WebSocket session that writes `frames` and then idles
async fn scripted_relay(frames: Vec<String>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        for frame in frames {
            ws.send(Message::Text(frame.into())).await.unwrap();
        }
        while let Some(Ok(_)) = ws.next().await {}
    });
    format!("ws://{}/", addr)
}

async fn wait_for_new_id(client: &RendezvousClient, previous: &PeerIdentifier) -> Option<PeerIdentifier> {
    for _ in 0..250 {
        match client.local_id() {
            Some(id) if id != *previous => return Some(id),
            _ => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    None
}

#[tokio::test]
async fn test_malformed_frame_reaches_no_listener() {
    let url = scripted_relay(vec![
        r#"{"type":"welcome","clientId":"s1"}"#.to_string(),
        "not json".to_string(),
        r#"{"type":"OFFER","data":{"type":"offer","sdp":""}}"#.to_string(),
        r#"{"type":"presence","id":"s2","joined":true}"#.to_string(),
    ])
    .await;
    let client = RendezvousClient::new(RendezvousConfig {
        url,
        ..Default::default()
    });
    let (_sub, mut rx) = collect(&client);
    client.connect();

    let first = next_matching(&mut rx, |_| true).await;
    assert!(matches!(first, Some(SignalMessage::Welcome { .. })));
    // The two bad frames are skipped; the next listener call is the presence
    let second = next_matching(&mut rx, |_| true).await;
    assert!(matches!(second, Some(SignalMessage::Presence { joined: true, .. })));
    assert_eq!(client.status(), LinkStatus::Open);
    assert_eq!(client.local_id(), Some(PeerIdentifier::from("s1")));

    client.shutdown();
}

#[tokio::test]
async fn test_reconnects_after_session_dropped() {
    let relay = start_relay().await;
    let client = client_for(&relay);
    let (_sub, mut rx) = collect(&client);
    client.connect();
    let first = client.wait_for_id(Duration::from_secs(5)).await.unwrap();
    next_matching(&mut rx, |m| matches!(m, SignalMessage::Welcome { .. }))
        .await
        .expect("first welcome");

    assert!(relay.state.close_session(&first).await);

    let welcome = next_matching(&mut rx, |m| matches!(m, SignalMessage::Welcome { .. }))
        .await
        .expect("welcome after reconnect");
    let second = wait_for_new_id(&client, &first).await.expect("new session id");
    assert_eq!(welcome, SignalMessage::Welcome { client_id: second.clone() });
    assert_ne!(first, second);
    assert_eq!(client.status(), LinkStatus::Open);
    assert_eq!(relay.state.stats().await.clients, 1);

    client.shutdown();
    relay.shutdown();
}

#[tokio::test]
async fn test_shutdown_closes_open_sessions() {
    let relay = start_relay().await;
    let client = client_for(&relay);
    let mut status = client.watch_status();
    client.connect();
    client.wait_for_id(Duration::from_secs(5)).await.unwrap();

    relay.shutdown();

    let dropped = tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| *s != LinkStatus::Open),
    )
    .await;
    assert!(matches!(dropped, Ok(Ok(_))));
    drop(dropped);
    assert_eq!(client.local_id(), None);

    client.shutdown();
}

#[tokio::test]
async fn test_slow_recipient_does_not_stall_sender() {
    let relay = start_relay().await;

    // A session that reads its welcome and then never reads again
    let (mut stalled, _) = tokio_tungstenite::connect_async(relay.ws_url()).await.unwrap();
    let welcome = match stalled.next().await {
        Some(Ok(Message::Text(text))) => serde_json::from_str::<SignalMessage>(&text).unwrap(),
        other => panic!("expected welcome, got {:?}", other),
    };
    let SignalMessage::Welcome { client_id: stalled_id } = welcome else {
        panic!("expected welcome");
    };

    let alice = client_for(&relay);
    let (_sub, mut alice_rx) = collect(&alice);
    alice.connect();
    let alice_id = alice.wait_for_id(Duration::from_secs(5)).await.unwrap();

    let chunk = Bytes::from(vec![7u8; 16 * 1024]);
    for _ in 0..2000 {
        alice
            .send(SignalMessage::fallback(&alice_id, &stalled_id, chunk.clone()))
            .unwrap();
    }
    alice.join("after-flood").unwrap();

    let presence = next_matching(&mut alice_rx, |m| {
        matches!(m, SignalMessage::Presence { id, joined: true, .. } if *id == alice_id)
    })
    .await;
    assert!(presence.is_some());

    alice.shutdown();
    relay.shutdown();
}
