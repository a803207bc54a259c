//! Read-only game-state query boundary.
//!
//! Best-effort and stateless: a failed query degrades the caller, it never
//! faults the poll loop. The bundled implementation speaks the Source-style
//! UDP query protocol (info + player list, with challenge handshakes).

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use log::debug;
use tokio::{net::UdpSocket, time::timeout};

const QUERY_TIMEOUT: Duration = Duration::from_secs(3);
const QUERY_PREFIX: [u8; 4] = [0xff, 0xff, 0xff, 0xff];

const KIND_INFO_REQUEST: u8 = 0x54;
const KIND_PLAYER_REQUEST: u8 = 0x55;
const KIND_CHALLENGE: u8 = 0x41;
const KIND_INFO_REPLY: u8 = 0x49;
const KIND_PLAYER_REPLY: u8 = 0x44;

#[derive(Debug, Clone, Default)]
pub struct ServerState {
    pub map: String,
    pub max_players: u32,
    pub players: Vec<QueriedPlayer>,
}

/// A player as seen by the query port. `candidates` holds whatever raw
/// identifier fields the reply carried, in richness order, unvalidated; the
/// resolver classifies them by shape.
#[derive(Debug, Clone, Default)]
pub struct QueriedPlayer {
    pub name: String,
    pub candidates: Vec<String>,
}

#[async_trait]
pub trait ServerQuery: Send + Sync {
    async fn query_state(&self) -> Result<ServerState>;
}

pub struct A2sQuery {
    host: String,
    port: u16,
}

impl A2sQuery {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    async fn exchange(socket: &UdpSocket, request: &[u8]) -> Result<Vec<u8>> {
        socket.send(request).await.context("sending query")?;
        let mut buf = vec![0u8; 4096];
        let received = timeout(QUERY_TIMEOUT, socket.recv(&mut buf))
            .await
            .map_err(|_| anyhow!("state query timed out"))?
            .context("reading query reply")?;
        buf.truncate(received);
        Ok(buf)
    }

    /// Runs one request, transparently answering a challenge reply.
    async fn request(socket: &UdpSocket, kind: u8, body: &[u8]) -> Result<(u8, Vec<u8>)> {
        let reply = Self::exchange(socket, &build_request(kind, body)).await?;
        let (reply_kind, payload) = split_reply(&reply)?;
        if reply_kind != KIND_CHALLENGE {
            return Ok((reply_kind, payload.to_vec()));
        }
        let challenged = match kind {
            // The player query replaces its placeholder with the challenge.
            KIND_PLAYER_REQUEST => build_request(kind, payload),
            // The info query appends it.
            _ => {
                let mut with_challenge = body.to_vec();
                with_challenge.extend_from_slice(payload);
                build_request(kind, &with_challenge)
            }
        };
        let reply = Self::exchange(socket, &challenged).await?;
        let (reply_kind, payload) = split_reply(&reply)?;
        Ok((reply_kind, payload.to_vec()))
    }
}

#[async_trait]
impl ServerQuery for A2sQuery {
    async fn query_state(&self) -> Result<ServerState> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("binding query socket")?;
        socket
            .connect((self.host.as_str(), self.port))
            .await
            .context("connecting query socket")?;

        let (map, max_players) =
            match Self::request(&socket, KIND_INFO_REQUEST, b"Source Engine Query\0").await {
                Ok((KIND_INFO_REPLY, payload)) => parse_info(&payload)?,
                Ok((kind, _)) => {
                    debug!("unexpected info reply kind 0x{kind:02x}");
                    ("UNKNOWN".to_string(), 0)
                }
                Err(err) => {
                    debug!("info query failed: {err:#}");
                    ("UNKNOWN".to_string(), 0)
                }
            };

        let (kind, payload) =
            Self::request(&socket, KIND_PLAYER_REQUEST, &[0xff, 0xff, 0xff, 0xff]).await?;
        if kind != KIND_PLAYER_REPLY {
            bail!("unexpected player reply kind 0x{kind:02x}");
        }
        let players = parse_players(&payload)?;

        Ok(ServerState {
            map,
            max_players,
            players,
        })
    }
}

fn build_request(kind: u8, body: &[u8]) -> Vec<u8> {
    let mut request = Vec::with_capacity(5 + body.len());
    request.extend_from_slice(&QUERY_PREFIX);
    request.push(kind);
    request.extend_from_slice(body);
    request
}

fn split_reply(reply: &[u8]) -> Result<(u8, &[u8])> {
    if reply.len() < 5 || reply[0..4] != QUERY_PREFIX {
        bail!("malformed query reply");
    }
    Ok((reply[4], &reply[5..]))
}

fn parse_info(payload: &[u8]) -> Result<(String, u32)> {
    let mut cursor = 1; // protocol version byte
    let _server_name = read_cstring(payload, &mut cursor)?;
    let map = read_cstring(payload, &mut cursor)?;
    let _folder = read_cstring(payload, &mut cursor)?;
    let _game = read_cstring(payload, &mut cursor)?;
    cursor += 2; // app id
    cursor += 1; // current player count
    let max_players = *payload
        .get(cursor)
        .context("info reply truncated before max players")? as u32;
    Ok((map, max_players))
}

fn parse_players(payload: &[u8]) -> Result<Vec<QueriedPlayer>> {
    let count = *payload.first().context("player reply missing count")? as usize;
    let mut cursor = 1;
    let mut players = Vec::with_capacity(count);
    for _ in 0..count {
        cursor += 1; // per-player index byte
        let name = read_cstring(payload, &mut cursor)?;
        cursor += 8; // score (i32) + connection duration (f32)
        if cursor > payload.len() {
            bail!("player reply truncated");
        }
        players.push(QueriedPlayer {
            name,
            candidates: Vec::new(),
        });
    }
    Ok(players)
}

fn read_cstring(bytes: &[u8], cursor: &mut usize) -> Result<String> {
    let tail = bytes
        .get(*cursor..)
        .context("query reply truncated mid-string")?;
    let terminator = tail
        .iter()
        .position(|&b| b == 0)
        .context("unterminated string in query reply")?;
    let text = String::from_utf8_lossy(&tail[..terminator]).into_owned();
    *cursor += terminator + 1;
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player_entry(name: &str) -> Vec<u8> {
        let mut entry = vec![0u8]; // index
        entry.extend_from_slice(name.as_bytes());
        entry.push(0);
        entry.extend_from_slice(&0i32.to_le_bytes());
        entry.extend_from_slice(&120.0f32.to_le_bytes());
        entry
    }

    #[test]
    fn player_reply_parses_names() {
        let mut payload = vec![2u8];
        payload.extend(player_entry("[A1] Sgt Smith"));
        payload.extend(player_entry("Jones"));

        let players = parse_players(&payload).unwrap();
        assert_eq!(players.len(), 2);
        assert_eq!(players[0].name, "[A1] Sgt Smith");
        assert_eq!(players[1].name, "Jones");
        assert!(players[0].candidates.is_empty());
    }

    #[test]
    fn truncated_player_reply_is_an_error() {
        let mut payload = vec![1u8, 0];
        payload.extend_from_slice(b"NoTerminator");
        assert!(parse_players(&payload).is_err());
    }

    #[test]
    fn info_reply_yields_map_and_capacity() {
        let mut payload = vec![17u8]; // protocol version
        for field in ["Server", "Altis", "arma3", "Arma 3"] {
            payload.extend_from_slice(field.as_bytes());
            payload.push(0);
        }
        payload.extend_from_slice(&[0x12, 0xa3]); // app id bytes
        payload.push(12); // players
        payload.push(64); // max players

        let (map, max_players) = parse_info(&payload).unwrap();
        assert_eq!(map, "Altis");
        assert_eq!(max_players, 64);
    }

    #[test]
    fn short_replies_are_rejected_not_panicking() {
        assert!(parse_info(&[]).is_err());
        assert!(split_reply(&[0xff, 0xff]).is_err());
        assert!(split_reply(b"xxxxx").is_err());
    }
}
