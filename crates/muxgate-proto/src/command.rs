//! Gateway commands and their wire encoding
//!
//! Every frame on a physical link is exactly one command: a one byte tag
//! followed by the command's fields. Identifiers are big-endian `u64`,
//! strings and payloads are prefixed with a big-endian `u32` length, and
//! lists are prefixed with a big-endian `u32` item count.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Identity of one virtual connection, allocated by the backend
pub type ClientId = u64;

/// Provisional id a frontend uses to correlate NEW with CONFIRM
pub type WaitId = u64;

/// Command tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandTag {
    New = 1,
    Confirm = 2,
    Accept = 3,
    Delete = 4,
    Data = 5,
    Broadcast = 6,
    Ping = 7,
    Pong = 8,
}

impl TryFrom<u8> for CommandTag {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(CommandTag::New),
            2 => Ok(CommandTag::Confirm),
            3 => Ok(CommandTag::Accept),
            4 => Ok(CommandTag::Delete),
            5 => Ok(CommandTag::Data),
            6 => Ok(CommandTag::Broadcast),
            7 => Ok(CommandTag::Ping),
            8 => Ok(CommandTag::Pong),
            _ => Err(ProtoError::UnknownCommand(value)),
        }
    }
}

/// Protocol errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    #[error("Empty frame")]
    Empty,

    #[error("Unknown command tag: {0}")]
    UnknownCommand(u8),

    #[error("Truncated frame")]
    Truncated,

    #[error("Frame has {0} trailing bytes")]
    TrailingBytes(usize),

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

/// A single gateway command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Frontend asks the backend for a new virtual connection
    New { wait_id: WaitId, peer_addr: String },
    /// Backend allocated a client id for a pending request
    Confirm { wait_id: WaitId, client_id: ClientId },
    /// Frontend is pumping the client; backend may admit it
    Accept { client_id: ClientId },
    /// Tear down one virtual connection
    Delete { client_id: ClientId },
    /// One application payload for one virtual connection
    Data { client_id: ClientId, payload: Bytes },
    /// One payload shared by several virtual connections
    Broadcast {
        client_ids: Vec<ClientId>,
        payload: Bytes,
    },
    /// Liveness check
    Ping { timestamp: u64 },
    /// Liveness reply, echoes the PING's timestamp
    Pong { timestamp: u64 },
}

impl Command {
    pub fn tag(&self) -> CommandTag {
        match self {
            Command::New { .. } => CommandTag::New,
            Command::Confirm { .. } => CommandTag::Confirm,
            Command::Accept { .. } => CommandTag::Accept,
            Command::Delete { .. } => CommandTag::Delete,
            Command::Data { .. } => CommandTag::Data,
            Command::Broadcast { .. } => CommandTag::Broadcast,
            Command::Ping { .. } => CommandTag::Ping,
            Command::Pong { .. } => CommandTag::Pong,
        }
    }

    /// Short uppercase name, for logs
    pub fn name(&self) -> &'static str {
        match self.tag() {
            CommandTag::New => "NEW",
            CommandTag::Confirm => "CONFIRM",
            CommandTag::Accept => "ACCEPT",
            CommandTag::Delete => "DELETE",
            CommandTag::Data => "DATA",
            CommandTag::Broadcast => "BROADCAST",
            CommandTag::Ping => "PING",
            CommandTag::Pong => "PONG",
        }
    }

    /// The single client this command addresses, if any
    pub fn client_id(&self) -> Option<ClientId> {
        match self {
            Command::Confirm { client_id, .. }
            | Command::Accept { client_id }
            | Command::Delete { client_id }
            | Command::Data { client_id, .. } => Some(*client_id),
            _ => None,
        }
    }

    fn encoded_len(&self) -> usize {
        1 + match self {
            Command::New { peer_addr, .. } => 8 + 4 + peer_addr.len(),
            Command::Confirm { .. } => 16,
            Command::Accept { .. } | Command::Delete { .. } => 8,
            Command::Data { payload, .. } => 8 + 4 + payload.len(),
            Command::Broadcast {
                client_ids,
                payload,
            } => 4 + 8 * client_ids.len() + 4 + payload.len(),
            Command::Ping { .. } | Command::Pong { .. } => 8,
        }
    }

    /// Encode command to bytes
    pub fn encode(&self) -> Result<Bytes, ProtoError> {
        let len = self.encoded_len();
        if len > crate::MAX_FRAME_SIZE {
            return Err(ProtoError::PayloadTooLarge(len));
        }

        let mut buf = BytesMut::with_capacity(len);
        buf.put_u8(self.tag() as u8);

        match self {
            Command::New { wait_id, peer_addr } => {
                buf.put_u64(*wait_id);
                put_bytes(&mut buf, peer_addr.as_bytes());
            }
            Command::Confirm { wait_id, client_id } => {
                buf.put_u64(*wait_id);
                buf.put_u64(*client_id);
            }
            Command::Accept { client_id } | Command::Delete { client_id } => {
                buf.put_u64(*client_id);
            }
            Command::Data { client_id, payload } => {
                buf.put_u64(*client_id);
                put_bytes(&mut buf, payload);
            }
            Command::Broadcast {
                client_ids,
                payload,
            } => {
                buf.put_u32(client_ids.len() as u32);
                for id in client_ids {
                    buf.put_u64(*id);
                }
                put_bytes(&mut buf, payload);
            }
            Command::Ping { timestamp } | Command::Pong { timestamp } => {
                buf.put_u64(*timestamp);
            }
        }

        Ok(buf.freeze())
    }

    /// Decode command from one complete frame
    pub fn decode(mut buf: Bytes) -> Result<Self, ProtoError> {
        if !buf.has_remaining() {
            return Err(ProtoError::Empty);
        }

        let cmd = match CommandTag::try_from(buf.get_u8())? {
            CommandTag::New => {
                let wait_id = get_u64(&mut buf)?;
                // Not validated here; the backend falls back to the link address
                let peer_addr = String::from_utf8_lossy(&get_bytes(&mut buf)?).into_owned();
                Command::New { wait_id, peer_addr }
            }
            CommandTag::Confirm => Command::Confirm {
                wait_id: get_u64(&mut buf)?,
                client_id: get_u64(&mut buf)?,
            },
            CommandTag::Accept => Command::Accept {
                client_id: get_u64(&mut buf)?,
            },
            CommandTag::Delete => Command::Delete {
                client_id: get_u64(&mut buf)?,
            },
            CommandTag::Data => Command::Data {
                client_id: get_u64(&mut buf)?,
                payload: get_bytes(&mut buf)?,
            },
            CommandTag::Broadcast => {
                let count = get_u32(&mut buf)? as usize;
                // Reject absurd counts before allocating
                if buf.remaining() < count.saturating_mul(8) {
                    return Err(ProtoError::Truncated);
                }
                let mut client_ids = Vec::with_capacity(count);
                for _ in 0..count {
                    client_ids.push(buf.get_u64());
                }
                Command::Broadcast {
                    client_ids,
                    payload: get_bytes(&mut buf)?,
                }
            }
            CommandTag::Ping => Command::Ping {
                timestamp: get_u64(&mut buf)?,
            },
            CommandTag::Pong => Command::Pong {
                timestamp: get_u64(&mut buf)?,
            },
        };

        if buf.has_remaining() {
            return Err(ProtoError::TrailingBytes(buf.remaining()));
        }

        Ok(cmd)
    }
}

fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

fn get_u32(buf: &mut Bytes) -> Result<u32, ProtoError> {
    if buf.remaining() < 4 {
        return Err(ProtoError::Truncated);
    }
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut Bytes) -> Result<u64, ProtoError> {
    if buf.remaining() < 8 {
        return Err(ProtoError::Truncated);
    }
    Ok(buf.get_u64())
}

fn get_bytes(buf: &mut Bytes) -> Result<Bytes, ProtoError> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(ProtoError::Truncated);
    }
    Ok(buf.split_to(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_encode_decode() {
        let payload = Bytes::from("hello world");
        let cmd = Command::Data {
            client_id: 42,
            payload: payload.clone(),
        };

        let encoded = cmd.encode().unwrap();
        let decoded = Command::decode(encoded).unwrap();

        assert_eq!(decoded.client_id(), Some(42));
        assert_eq!(decoded, Command::Data { client_id: 42, payload });
    }

    #[test]
    fn test_accept_carries_client_id() {
        let encoded = Command::Accept { client_id: 7 }.encode().unwrap();

        assert_eq!(encoded.len(), 9);
        assert_eq!(encoded[0], CommandTag::Accept as u8);
        assert_eq!(&encoded[1..], &7u64.to_be_bytes());
    }

    #[test]
    fn test_new_layout_is_big_endian() {
        let cmd = Command::New {
            wait_id: 0x0102,
            peer_addr: "10.0.0.1:80".to_string(),
        };
        let encoded = cmd.encode().unwrap();

        assert_eq!(encoded[0], 1);
        assert_eq!(&encoded[1..9], &[0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(&encoded[9..13], &[0, 0, 0, 11]);
        assert_eq!(&encoded[13..], b"10.0.0.1:80");
        assert_eq!(Command::decode(encoded).unwrap(), cmd);
    }

    #[test]
    fn test_broadcast_encode_decode() {
        let cmd = Command::Broadcast {
            client_ids: vec![1, 5, 9],
            payload: Bytes::from_static(b"tick"),
        };

        let decoded = Command::decode(cmd.encode().unwrap()).unwrap();
        assert_eq!(decoded, cmd);
        assert_eq!(decoded.client_id(), None);
    }

    #[test]
    fn test_empty_broadcast() {
        let cmd = Command::Broadcast {
            client_ids: vec![],
            payload: Bytes::new(),
        };

        assert_eq!(Command::decode(cmd.encode().unwrap()).unwrap(), cmd);
    }

    #[test]
    fn test_unknown_tag() {
        let result = Command::decode(Bytes::from_static(&[0xEE, 0, 0]));
        assert_eq!(result, Err(ProtoError::UnknownCommand(0xEE)));
    }

    #[test]
    fn test_empty_frame() {
        assert_eq!(Command::decode(Bytes::new()), Err(ProtoError::Empty));
    }

    #[test]
    fn test_truncated_frames() {
        let encoded = Command::Confirm {
            wait_id: 1,
            client_id: 2,
        }
        .encode()
        .unwrap();
        assert_eq!(
            Command::decode(encoded.slice(..encoded.len() - 1)),
            Err(ProtoError::Truncated)
        );

        let encoded = Command::Data {
            client_id: 3,
            payload: Bytes::from_static(b"abcdef"),
        }
        .encode()
        .unwrap();
        assert_eq!(
            Command::decode(encoded.slice(..encoded.len() - 2)),
            Err(ProtoError::Truncated)
        );
    }

    #[test]
    fn test_broadcast_count_exceeds_frame() {
        let mut buf = BytesMut::new();
        buf.put_u8(CommandTag::Broadcast as u8);
        buf.put_u32(u32::MAX);
        buf.put_u64(1);

        assert_eq!(Command::decode(buf.freeze()), Err(ProtoError::Truncated));
    }

    #[test]
    fn test_trailing_bytes() {
        let mut buf = BytesMut::from(&Command::Delete { client_id: 4 }.encode().unwrap()[..]);
        buf.put_u16(0xFFFF);

        assert_eq!(
            Command::decode(buf.freeze()),
            Err(ProtoError::TrailingBytes(2))
        );
    }

    #[test]
    fn test_non_utf8_address_still_decodes() {
        let mut buf = BytesMut::new();
        buf.put_u8(CommandTag::New as u8);
        buf.put_u64(1);
        buf.put_u32(2);
        buf.put_slice(&[0xC3, 0x28]);

        match Command::decode(buf.freeze()).unwrap() {
            Command::New { wait_id, peer_addr } => {
                assert_eq!(wait_id, 1);
                assert!(peer_addr.parse::<std::net::SocketAddr>().is_err());
            }
            other => panic!("expected NEW, got {:?}", other),
        }
    }

    #[test]
    fn test_payload_too_large() {
        let cmd = Command::Data {
            client_id: 1,
            payload: Bytes::from(vec![0u8; crate::MAX_FRAME_SIZE]),
        };

        assert!(matches!(cmd.encode(), Err(ProtoError::PayloadTooLarge(_))));
    }

    #[test]
    fn test_names() {
        assert_eq!(Command::Ping { timestamp: 1 }.name(), "PING");
        assert_eq!(Command::Delete { client_id: 1 }.name(), "DELETE");
    }
}
