//! Persistent remote-console client.
//!
//! One authenticated UDP connection per process, owned by a supervisor task
//! that reconnects indefinitely: a game server restarting on its own schedule
//! must never take the daemon down with it. Callers get explicit outcome
//! values (timed out, no credential, failed) instead of errors.

pub mod protocol;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use regex::Regex;
use serde_json::Value;
use tokio::{
    net::UdpSocket,
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{interval, sleep, timeout, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::identity::{is_primary_id, is_secondary_id, PlayerSource};
use protocol::Packet;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Retry delay after a failed or rejected login.
const LOGIN_RETRY_DELAY: Duration = Duration::from_secs(10);
/// Retry delay after an established stream drops.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// The server drops silent clients at 45s; heartbeat well inside that.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(40);
/// Nothing inbound for this long means the server is gone.
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

const MAX_DATAGRAM: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticated,
    Reconnecting,
}

/// Output shape requested from the console. `Json` asks for the structured
/// payload the player-list query supports (sent as a `json` suffix token).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Raw,
    Json,
}

/// Result of a fire-and-forget command. Always a value, never an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Done(String),
    Timeout,
    NoCredential,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    Matched(String),
    TimedOut,
}

/// One entry of the console's player list, identifier classified by shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerRecord {
    pub raw_id: String,
    pub name: String,
    pub primary_id: Option<String>,
    pub secondary_id: Option<String>,
}

struct PendingResponse {
    tx: oneshot::Sender<String>,
    /// Populated once a multi-part header arrives.
    parts: Vec<Option<Vec<u8>>>,
}

struct Capture {
    pattern: Regex,
    tx: oneshot::Sender<String>,
}

struct Shared {
    state: Mutex<ConnectionState>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    pending: Mutex<HashMap<u8, PendingResponse>>,
    capture: Mutex<Option<Capture>>,
    seq: AtomicU8,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
            socket: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            capture: Mutex::new(None),
            seq: AtomicU8::new(0),
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.lock().unwrap().clone()
    }

    fn next_seq(&self) -> u8 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn register(&self, seq: u8) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(
            seq,
            PendingResponse {
                tx,
                parts: Vec::new(),
            },
        );
        rx
    }

    fn cancel_pending(&self, seq: u8) {
        self.pending.lock().unwrap().remove(&seq);
    }

    /// Dropping the senders wakes every waiter with a closed-channel error.
    fn fail_pending(&self) {
        self.pending.lock().unwrap().clear();
    }

    fn complete_command(&self, seq: u8, part: Option<(u8, u8)>, data: Vec<u8>) {
        let mut pending = self.pending.lock().unwrap();
        let Some(mut entry) = pending.remove(&seq) else {
            // Keep-alive replies and late responses land here.
            return;
        };
        match part {
            None => {
                let _ = entry
                    .tx
                    .send(String::from_utf8_lossy(&data).trim().to_string());
            }
            Some((index, total)) => {
                if entry.parts.is_empty() {
                    entry.parts = vec![None; total as usize];
                }
                if let Some(slot) = entry.parts.get_mut(index as usize) {
                    *slot = Some(data);
                }
                if entry.parts.iter().all(Option::is_some) {
                    let mut assembled = Vec::new();
                    for piece in entry.parts.drain(..) {
                        assembled.extend(piece.unwrap_or_default());
                    }
                    let _ = entry
                        .tx
                        .send(String::from_utf8_lossy(&assembled).trim().to_string());
                } else {
                    pending.insert(seq, entry);
                }
            }
        }
    }

    /// Offers a stream line to the active capture, consuming the slot on the
    /// first match so repeated captures never stack listeners.
    fn offer_capture(&self, text: &str) {
        let mut slot = self.capture.lock().unwrap();
        let matched = slot
            .as_ref()
            .map_or(false, |capture| capture.pattern.is_match(text));
        if matched {
            if let Some(capture) = slot.take() {
                let _ = capture.tx.send(text.to_string());
            }
        }
    }

    fn clear_capture(&self) {
        *self.capture.lock().unwrap() = None;
    }
}

pub struct RconClient {
    host: String,
    port: u16,
    password: Option<String>,
    shared: Arc<Shared>,
    /// Serializes captures so at most one listener is ever in flight.
    capture_gate: tokio::sync::Mutex<()>,
    started: AtomicBool,
}

impl RconClient {
    pub fn new(host: impl Into<String>, port: u16, password: Option<String>) -> Self {
        Self {
            host: host.into(),
            port,
            password,
            shared: Arc::new(Shared::new()),
            capture_gate: tokio::sync::Mutex::new(()),
            started: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Spawns the connection supervisor. Inbound broadcast lines are pushed
    /// to `stream_tx`; the task reconnects until `cancel` fires. Calling this
    /// a second time is a no-op so duplicate listeners cannot exist.
    pub fn start(
        &self,
        stream_tx: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        if self.started.swap(true, Ordering::SeqCst) {
            info!("console supervisor already running, ignoring start");
            return None;
        }
        let supervisor = Supervisor {
            host: self.host.clone(),
            port: self.port,
            password: self.password.clone(),
            shared: Arc::clone(&self.shared),
            stream_tx,
            cancel,
        };
        Some(tokio::spawn(supervisor.run()))
    }

    /// Sends a command and waits for its direct response. Bounded by a fixed
    /// timeout; every failure mode comes back as a `CommandOutcome`.
    pub async fn execute(&self, command: &str, format: Format) -> CommandOutcome {
        if self.password.is_none() {
            return CommandOutcome::NoCredential;
        }
        let Some(socket) = self.shared.socket() else {
            return CommandOutcome::Failed("console not connected".to_string());
        };
        let wire = match format {
            Format::Raw => command.to_string(),
            Format::Json => format!("{command} json"),
        };
        let seq = self.shared.next_seq();
        let rx = self.shared.register(seq);
        if let Err(err) = socket.send(&protocol::encode_command(seq, &wire)).await {
            self.shared.cancel_pending(seq);
            return CommandOutcome::Failed(format!("send failed: {err}"));
        }
        match timeout(COMMAND_TIMEOUT, rx).await {
            Ok(Ok(text)) => CommandOutcome::Done(text),
            Ok(Err(_)) => CommandOutcome::Failed("console disconnected while waiting".to_string()),
            Err(_) => {
                self.shared.cancel_pending(seq);
                CommandOutcome::Timeout
            }
        }
    }

    /// For commands whose reply arrives on the broadcast stream instead of as
    /// a direct response. Resolves with the first stream line matching
    /// `pattern`, or a timeout sentinel. The listener slot is cleared on both
    /// paths, so repeated calls cannot leak.
    pub async fn execute_and_capture(
        &self,
        command: &str,
        pattern: Regex,
        window: Option<Duration>,
    ) -> CaptureOutcome {
        let _gate = self.capture_gate.lock().await;
        let (tx, rx) = oneshot::channel();
        *self.shared.capture.lock().unwrap() = Some(Capture { pattern, tx });

        if let Some(socket) = self.shared.socket() {
            let seq = self.shared.next_seq();
            if let Err(err) = socket.send(&protocol::encode_command(seq, command)).await {
                warn!("capture command send failed: {err}");
            }
        } else {
            debug!("capture requested while console disconnected");
        }

        let outcome = match timeout(window.unwrap_or(DEFAULT_CAPTURE_TIMEOUT), rx).await {
            Ok(Ok(line)) => CaptureOutcome::Matched(line),
            Ok(Err(_)) | Err(_) => CaptureOutcome::TimedOut,
        };
        self.shared.clear_capture();
        outcome
    }

    /// Structured player-list query. Any malformed payload degrades to an
    /// empty list; a poll must never die on bad console output.
    pub async fn get_players(&self) -> Vec<PlayerRecord> {
        match self.execute("players", Format::Json).await {
            CommandOutcome::Done(text) => parse_players_payload(&text),
            other => {
                debug!("players query yielded {other:?}, treating as empty");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl PlayerSource for RconClient {
    async fn players(&self) -> Vec<PlayerRecord> {
        self.get_players().await
    }
}

enum SessionEnd {
    Disconnected,
    Shutdown,
}

struct Supervisor {
    host: String,
    port: u16,
    password: Option<String>,
    shared: Arc<Shared>,
    stream_tx: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.shared.set_state(ConnectionState::Connecting);
            let delay = match self.connect_session().await {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Disconnected) => {
                    warn!("console stream disconnected, reconnecting in {RECONNECT_DELAY:?}");
                    RECONNECT_DELAY
                }
                Err(err) => {
                    warn!("console connect failed ({err:#}), retrying in {LOGIN_RETRY_DELAY:?}");
                    LOGIN_RETRY_DELAY
                }
            };
            *self.shared.socket.lock().unwrap() = None;
            self.shared.fail_pending();
            self.shared.set_state(ConnectionState::Reconnecting);
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.cancel.cancelled() => break,
            }
        }
        *self.shared.socket.lock().unwrap() = None;
        self.shared.fail_pending();
        self.shared.set_state(ConnectionState::Disconnected);
    }

    async fn connect_session(&self) -> Result<SessionEnd> {
        let Some(password) = self.password.as_deref() else {
            bail!("no console credential configured");
        };
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("binding console socket")?;
        socket
            .connect((self.host.as_str(), self.port))
            .await
            .context("connecting console socket")?;
        socket
            .send(&protocol::encode_login(password))
            .await
            .context("sending login")?;

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let received = timeout(COMMAND_TIMEOUT, socket.recv(&mut buf))
            .await
            .context("login timed out")?
            .context("reading login reply")?;
        match protocol::decode(&buf[..received])? {
            Packet::LoginResult { ok: true } => {}
            Packet::LoginResult { ok: false } => bail!("login rejected"),
            other => bail!("unexpected reply to login: {other:?}"),
        }

        let socket = Arc::new(socket);
        *self.shared.socket.lock().unwrap() = Some(Arc::clone(&socket));
        self.shared.set_state(ConnectionState::Authenticated);
        info!("console stream established on {}:{}", self.host, self.port);
        self.pump(socket).await
    }

    /// Single read loop for the live stream: acks broadcast lines, feeds the
    /// capture slot and the stream channel, and correlates command responses.
    async fn pump(&self, socket: Arc<UdpSocket>) -> Result<SessionEnd> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut keepalive = interval(KEEPALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        keepalive.tick().await; // first tick fires immediately
        let mut last_rx = Instant::now();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(SessionEnd::Shutdown),
                _ = keepalive.tick() => {
                    if last_rx.elapsed() > IDLE_TIMEOUT {
                        warn!(
                            "console quiet for {}s, assuming dead connection",
                            last_rx.elapsed().as_secs()
                        );
                        return Ok(SessionEnd::Disconnected);
                    }
                    let seq = self.shared.next_seq();
                    if socket.send(&protocol::encode_keepalive(seq)).await.is_err() {
                        return Ok(SessionEnd::Disconnected);
                    }
                }
                received = socket.recv(&mut buf) => {
                    let len = match received {
                        Ok(len) => len,
                        Err(err) => {
                            warn!("console read error: {err}");
                            return Ok(SessionEnd::Disconnected);
                        }
                    };
                    last_rx = Instant::now();
                    match protocol::decode(&buf[..len]) {
                        Ok(Packet::Message { seq, text }) => {
                            let _ = socket.send(&protocol::encode_ack(seq)).await;
                            self.shared.offer_capture(&text);
                            if self.stream_tx.send(text).is_err() {
                                debug!("stream consumer dropped");
                            }
                        }
                        Ok(Packet::CommandResponse { seq, part, data }) => {
                            self.shared.complete_command(seq, part, data);
                        }
                        Ok(Packet::LoginResult { .. }) => {}
                        Err(err) => debug!("ignoring malformed datagram: {err}"),
                    }
                }
            }
        }
    }
}

fn parse_players_payload(text: &str) -> Vec<PlayerRecord> {
    let Ok(root) = serde_json::from_str::<Value>(text) else {
        warn!("players payload is not valid JSON, treating as empty");
        return Vec::new();
    };
    let Some(entries) = root.as_array() else {
        warn!("players payload is not an array, treating as empty");
        return Vec::new();
    };
    entries.iter().filter_map(parse_player_entry).collect()
}

fn parse_player_entry(entry: &Value) -> Option<PlayerRecord> {
    let object = entry.as_object()?;
    let raw_id = ["player_id", "id_string", "guid", "id"]
        .iter()
        .filter_map(|key| object.get(*key).and_then(value_to_string))
        .find(|value| !value.is_empty())
        .unwrap_or_default();
    let name = object
        .get("name")
        .and_then(value_to_string)
        .unwrap_or_else(|| "Unknown".to_string());
    let primary_id = is_primary_id(&raw_id).then(|| raw_id.clone());
    let secondary_id = is_secondary_id(&raw_id).then(|| raw_id.clone());
    Some(PlayerRecord {
        raw_id,
        name,
        primary_id,
        secondary_id,
    })
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn players_payload_classifies_identifier_shapes() {
        let payload = r#"[
            {"player_id": "76561198000000001", "name": "[A1] Sgt Smith"},
            {"guid": "0123456789abcdef0123456789abcdef", "name": "Jones"},
            {"id": 12, "name": "Raw"}
        ]"#;
        let players = parse_players_payload(payload);
        assert_eq!(players.len(), 3);

        assert_eq!(
            players[0].primary_id.as_deref(),
            Some("76561198000000001")
        );
        assert!(players[0].secondary_id.is_none());

        assert!(players[1].primary_id.is_none());
        assert_eq!(
            players[1].secondary_id.as_deref(),
            Some("0123456789abcdef0123456789abcdef")
        );

        assert_eq!(players[2].raw_id, "12");
        assert!(players[2].primary_id.is_none());
        assert!(players[2].secondary_id.is_none());
    }

    #[test]
    fn players_payload_prefers_richest_id_field() {
        let payload = r#"[{"id": "", "guid": "x", "player_id": "76561198000000001", "name": "A"}]"#;
        let players = parse_players_payload(payload);
        assert_eq!(players[0].raw_id, "76561198000000001");
    }

    #[test]
    fn malformed_players_payloads_become_empty_lists() {
        assert!(parse_players_payload("not json").is_empty());
        assert!(parse_players_payload(r#"{"players": []}"#).is_empty());
        assert!(parse_players_payload("\"just a string\"").is_empty());
        // Non-object entries are skipped rather than crashing the poll.
        assert!(parse_players_payload("[1, 2, 3]").is_empty());
    }

    #[test]
    fn missing_name_falls_back_to_unknown() {
        let players = parse_players_payload(r#"[{"guid": "abc"}]"#);
        assert_eq!(players[0].name, "Unknown");
    }

    #[test]
    fn capture_slot_resolves_once_and_clears() {
        let shared = Shared::new();
        let (tx, mut rx) = oneshot::channel();
        *shared.capture.lock().unwrap() = Some(Capture {
            pattern: Regex::new(r"FPS:\s+\d+").unwrap(),
            tx,
        });

        shared.offer_capture("Mission read.");
        assert!(rx.try_recv().is_err());

        shared.offer_capture("Server load: FPS: 45");
        assert_eq!(rx.try_recv().unwrap(), "Server load: FPS: 45");
        assert!(shared.capture.lock().unwrap().is_none());

        // A second matching line with no listener registered is a no-op.
        shared.offer_capture("FPS: 50");
    }

    #[test]
    fn multipart_responses_reassemble_in_order() {
        let shared = Shared::new();
        let mut rx = shared.register(9);

        shared.complete_command(9, Some((1, 3)), b"world".to_vec());
        assert!(rx.try_recv().is_err());
        shared.complete_command(9, Some((0, 3)), b"hello ".to_vec());
        shared.complete_command(9, Some((2, 3)), b"!".to_vec());

        assert_eq!(rx.try_recv().unwrap(), "hello world!");
    }

    #[test]
    fn single_part_response_resolves_directly() {
        let shared = Shared::new();
        let mut rx = shared.register(1);
        shared.complete_command(1, None, b"  OK  ".to_vec());
        assert_eq!(rx.try_recv().unwrap(), "OK");
    }

    #[test]
    fn unknown_sequence_is_ignored() {
        let shared = Shared::new();
        shared.complete_command(200, None, b"late".to_vec());
    }

    #[tokio::test]
    async fn execute_without_credential_is_a_sentinel() {
        let client = RconClient::new("127.0.0.1", 2302, None);
        assert_eq!(
            client.execute("players", Format::Json).await,
            CommandOutcome::NoCredential
        );
    }

    #[tokio::test]
    async fn execute_while_disconnected_fails_as_data() {
        let client = RconClient::new("127.0.0.1", 2302, Some("secret".to_string()));
        match client.execute("say -1 hi", Format::Raw).await {
            CommandOutcome::Failed(reason) => assert!(reason.contains("not connected")),
            other => panic!("expected Failed, got {other:?}"),
        }
    }
}
