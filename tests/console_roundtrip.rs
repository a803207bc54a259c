//! Exercises the console client against an in-process UDP server stub:
//! login, command execution, player-list parsing, and stream capture.

use std::{net::SocketAddr, time::Duration};

use regex::Regex;
use tokio::{net::UdpSocket, sync::mpsc, time::sleep};
use tokio_util::sync::CancellationToken;

use rollcall::rcon::{CaptureOutcome, CommandOutcome, ConnectionState, Format, RconClient};

const PLAYERS_JSON: &str =
    r#"[{"player_id": "76561198000000001", "name": "[A1] Sgt Smith"}]"#;

fn frame(payload: Vec<u8>) -> Vec<u8> {
    let crc = crc32fast::hash(&payload);
    let mut datagram = vec![b'B', b'E'];
    datagram.extend_from_slice(&crc.to_le_bytes());
    datagram.extend_from_slice(&payload);
    datagram
}

fn reply(type_byte: u8, body: &[u8]) -> Vec<u8> {
    let mut payload = vec![0xff, type_byte];
    payload.extend_from_slice(body);
    frame(payload)
}

/// Minimal console server: accepts one password, answers the players query,
/// and emits a stream line when poked with a `perf` command.
async fn run_stub(socket: UdpSocket, password: &str, greet: bool) {
    let mut buf = vec![0u8; 4096];
    let mut message_seq: u8 = 0;
    loop {
        let Ok((received, addr)) = socket.recv_from(&mut buf).await else {
            return;
        };
        let datagram = &buf[..received];
        if datagram.len() < 8 || &datagram[0..2] != b"BE" {
            continue;
        }
        let payload = &datagram[6..];
        match payload[1] {
            0x00 => {
                let ok = payload[2..] == *password.as_bytes();
                let _ = socket
                    .send_to(&reply(0x00, &[u8::from(ok)]), addr)
                    .await;
                if ok && greet {
                    let mut body = vec![message_seq];
                    body.extend_from_slice(b"RCon admin #0 logged in");
                    message_seq = message_seq.wrapping_add(1);
                    let _ = socket.send_to(&reply(0x02, &body), addr).await;
                }
            }
            0x01 => {
                let seq = payload[2];
                let command = String::from_utf8_lossy(&payload[3..]).to_string();
                match command.as_str() {
                    "players json" => {
                        let mut body = vec![seq];
                        body.extend_from_slice(PLAYERS_JSON.as_bytes());
                        let _ = socket.send_to(&reply(0x01, &body), addr).await;
                    }
                    "multi" => {
                        for (index, piece) in [b"AB", b"CD"].iter().enumerate() {
                            let mut body = vec![seq, 0x00, 2, index as u8];
                            body.extend_from_slice(*piece);
                            let _ = socket.send_to(&reply(0x01, &body), addr).await;
                        }
                    }
                    "perf" => {
                        // Ack the command, answer on the stream like the engine does.
                        let _ = socket.send_to(&reply(0x01, &[seq]), addr).await;
                        let mut body = vec![message_seq];
                        body.extend_from_slice(b"Server FPS: 47");
                        message_seq = message_seq.wrapping_add(1);
                        let _ = socket.send_to(&reply(0x02, &body), addr).await;
                    }
                    _ => {
                        let _ = socket.send_to(&reply(0x01, &[seq]), addr).await;
                    }
                }
            }
            // Message acks from the client.
            _ => {}
        }
    }
}

async fn start_stub(password: &'static str, greet: bool) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(run_stub(socket, password, greet));
    addr
}

async fn wait_for_auth(client: &RconClient) {
    for _ in 0..50 {
        if client.state() == ConnectionState::Authenticated {
            return;
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("client never authenticated, state {:?}", client.state());
}

#[tokio::test]
async fn login_execute_and_capture_flow() {
    let addr = start_stub("secret", true).await;
    let client = RconClient::new("127.0.0.1", addr.port(), Some("secret".to_string()));
    let (stream_tx, mut stream_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let task = client.start(stream_tx, cancel.clone()).expect("first start spawns");
    // A second start must not add another listener.
    let (dup_tx, _dup_rx) = mpsc::unbounded_channel();
    assert!(client.start(dup_tx, cancel.clone()).is_none());

    wait_for_auth(&client).await;

    // The login greeting arrives on the broadcast stream.
    let greeting = tokio::time::timeout(Duration::from_secs(2), stream_rx.recv())
        .await
        .expect("greeting within deadline")
        .expect("stream open");
    assert!(greeting.contains("logged in"));

    match client.execute("players", Format::Json).await {
        CommandOutcome::Done(text) => assert!(text.contains("76561198000000001")),
        other => panic!("expected Done, got {other:?}"),
    }

    let players = client.get_players().await;
    assert_eq!(players.len(), 1);
    assert_eq!(players[0].primary_id.as_deref(), Some("76561198000000001"));
    assert_eq!(players[0].name, "[A1] Sgt Smith");

    // Multi-part responses reassemble before resolving.
    match client.execute("multi", Format::Raw).await {
        CommandOutcome::Done(text) => assert_eq!(text, "ABCD"),
        other => panic!("expected Done, got {other:?}"),
    }

    // The perf reply arrives asynchronously on the stream, not as a response.
    let outcome = client
        .execute_and_capture(
            "perf",
            Regex::new(r"FPS:\s+\d+").unwrap(),
            Some(Duration::from_secs(2)),
        )
        .await;
    assert_eq!(outcome, CaptureOutcome::Matched("Server FPS: 47".to_string()));

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
}

#[tokio::test]
async fn capture_times_out_with_a_sentinel() {
    let addr = start_stub("secret", false).await;
    let client = RconClient::new("127.0.0.1", addr.port(), Some("secret".to_string()));
    let (stream_tx, _stream_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let _task = client.start(stream_tx, cancel.clone());

    wait_for_auth(&client).await;

    let outcome = client
        .execute_and_capture(
            "say -1 hello",
            Regex::new(r"never matches \d{9}").unwrap(),
            Some(Duration::from_millis(300)),
        )
        .await;
    assert_eq!(outcome, CaptureOutcome::TimedOut);

    // The listener slot was released; a fresh capture can still win.
    let outcome = client
        .execute_and_capture(
            "perf",
            Regex::new(r"FPS:\s+\d+").unwrap(),
            Some(Duration::from_secs(2)),
        )
        .await;
    assert_eq!(outcome, CaptureOutcome::Matched("Server FPS: 47".to_string()));

    cancel.cancel();
}

#[tokio::test]
async fn rejected_login_never_authenticates() {
    let addr = start_stub("other-password", false).await;
    let client = RconClient::new("127.0.0.1", addr.port(), Some("wrong".to_string()));
    let (stream_tx, _stream_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let _task = client.start(stream_tx, cancel.clone());

    sleep(Duration::from_millis(800)).await;
    assert_ne!(client.state(), ConnectionState::Authenticated);

    cancel.cancel();
}
