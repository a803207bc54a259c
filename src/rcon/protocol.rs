//! BattlEye remote-console wire format.
//!
//! Every datagram is `'B' 'E'`, a little-endian CRC32 of the rest, then a
//! `0xFF` marker, a packet type byte and the body. Command responses may be
//! split across datagrams; the split header carries the part count and index.

use anyhow::{bail, Result};

const HEADER: [u8; 2] = [b'B', b'E'];
const PAYLOAD_MARKER: u8 = 0xFF;

const TYPE_LOGIN: u8 = 0x00;
const TYPE_COMMAND: u8 = 0x01;
const TYPE_MESSAGE: u8 = 0x02;

const MULTIPART_MARKER: u8 = 0x00;

/// A decoded inbound datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    LoginResult {
        ok: bool,
    },
    CommandResponse {
        seq: u8,
        /// `(index, total)` when the response is split across datagrams.
        part: Option<(u8, u8)>,
        data: Vec<u8>,
    },
    /// Free-text broadcast line (chat or engine log). Must be acknowledged.
    Message {
        seq: u8,
        text: String,
    },
}

fn frame(payload: &[u8]) -> Vec<u8> {
    let crc = crc32fast::hash(payload);
    let mut datagram = Vec::with_capacity(HEADER.len() + 4 + payload.len());
    datagram.extend_from_slice(&HEADER);
    datagram.extend_from_slice(&crc.to_le_bytes());
    datagram.extend_from_slice(payload);
    datagram
}

pub fn encode_login(password: &str) -> Vec<u8> {
    let mut payload = vec![PAYLOAD_MARKER, TYPE_LOGIN];
    payload.extend_from_slice(password.as_bytes());
    frame(&payload)
}

pub fn encode_command(seq: u8, command: &str) -> Vec<u8> {
    let mut payload = vec![PAYLOAD_MARKER, TYPE_COMMAND, seq];
    payload.extend_from_slice(command.as_bytes());
    frame(&payload)
}

/// An empty command doubles as the keep-alive heartbeat.
pub fn encode_keepalive(seq: u8) -> Vec<u8> {
    encode_command(seq, "")
}

/// Acknowledges a server message so the server keeps the stream open.
pub fn encode_ack(seq: u8) -> Vec<u8> {
    frame(&[PAYLOAD_MARKER, TYPE_MESSAGE, seq])
}

pub fn decode(datagram: &[u8]) -> Result<Packet> {
    if datagram.len() < 8 {
        bail!("datagram too short: {} bytes", datagram.len());
    }
    if datagram[0..2] != HEADER {
        bail!("bad header bytes {:02x} {:02x}", datagram[0], datagram[1]);
    }
    let expected = u32::from_le_bytes([datagram[2], datagram[3], datagram[4], datagram[5]]);
    let payload = &datagram[6..];
    if crc32fast::hash(payload) != expected {
        bail!("checksum mismatch");
    }
    if payload[0] != PAYLOAD_MARKER {
        bail!("missing payload marker");
    }

    match payload[1] {
        TYPE_LOGIN => {
            let ok = payload.get(2) == Some(&0x01);
            Ok(Packet::LoginResult { ok })
        }
        TYPE_COMMAND => {
            let Some(&seq) = payload.get(2) else {
                bail!("command response missing sequence byte");
            };
            let body = &payload[3..];
            if body.len() >= 3 && body[0] == MULTIPART_MARKER {
                Ok(Packet::CommandResponse {
                    seq,
                    part: Some((body[2], body[1])),
                    data: body[3..].to_vec(),
                })
            } else {
                Ok(Packet::CommandResponse {
                    seq,
                    part: None,
                    data: body.to_vec(),
                })
            }
        }
        TYPE_MESSAGE => {
            let Some(&seq) = payload.get(2) else {
                bail!("server message missing sequence byte");
            };
            let text = String::from_utf8_lossy(&payload[3..]).into_owned();
            Ok(Packet::Message { seq, text })
        }
        other => bail!("unknown packet type 0x{other:02x}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_frame_matches_known_bytes() {
        let datagram = encode_login("secret");
        let mut expected = vec![b'B', b'E', 0xc9, 0x90, 0x09, 0xae, 0xff, 0x00];
        expected.extend_from_slice(b"secret");
        assert_eq!(datagram, expected);
    }

    #[test]
    fn command_frame_matches_known_bytes() {
        let datagram = encode_command(0, "players");
        let mut expected = vec![b'B', b'E', 0xf9, 0x37, 0x94, 0xae, 0xff, 0x01, 0x00];
        expected.extend_from_slice(b"players");
        assert_eq!(datagram, expected);
    }

    #[test]
    fn ack_frame_matches_known_bytes() {
        assert_eq!(
            encode_ack(7),
            vec![b'B', b'E', 0xde, 0x1a, 0x8b, 0xed, 0xff, 0x02, 0x07]
        );
    }

    #[test]
    fn login_results_round_trip() {
        let mut accepted = vec![PAYLOAD_MARKER, TYPE_LOGIN, 0x01];
        let decoded = decode(&frame(&accepted)).unwrap();
        assert_eq!(decoded, Packet::LoginResult { ok: true });

        accepted[2] = 0x00;
        let decoded = decode(&frame(&accepted)).unwrap();
        assert_eq!(decoded, Packet::LoginResult { ok: false });
    }

    #[test]
    fn message_round_trips_and_needs_ack_seq() {
        let mut payload = vec![PAYLOAD_MARKER, TYPE_MESSAGE, 42];
        payload.extend_from_slice("(Global) Smith: !status".as_bytes());
        let decoded = decode(&frame(&payload)).unwrap();
        assert_eq!(
            decoded,
            Packet::Message {
                seq: 42,
                text: "(Global) Smith: !status".to_string(),
            }
        );
    }

    #[test]
    fn multipart_header_is_parsed() {
        let mut payload = vec![PAYLOAD_MARKER, TYPE_COMMAND, 3, MULTIPART_MARKER, 2, 1];
        payload.extend_from_slice(b"tail");
        let decoded = decode(&frame(&payload)).unwrap();
        assert_eq!(
            decoded,
            Packet::CommandResponse {
                seq: 3,
                part: Some((1, 2)),
                data: b"tail".to_vec(),
            }
        );
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let mut datagram = encode_command(0, "players");
        datagram[2] ^= 0xff;
        assert!(decode(&datagram).is_err());
    }

    #[test]
    fn truncated_datagram_is_rejected() {
        assert!(decode(&[b'B', b'E', 0x00]).is_err());
    }
}
