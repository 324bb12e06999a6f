//! Client-to-broker commands.
//!
//! Every command is a text line `NAME [params...]\n`. Commands that carry a
//! payload follow the line with a 4-byte big-endian length and the body.

use serde::Serialize;

use crate::ProtocolError;
use crate::constants::MESSAGE_ID_SIZE;

/// A command sent to a broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Feature negotiation; body is a JSON object.
    Identify(Vec<u8>),
    /// Subscribe to a topic through a channel.
    Sub { topic: String, channel: String },
    /// Update the in-flight message budget.
    Rdy(u32),
    /// Finish a message.
    Fin([u8; MESSAGE_ID_SIZE]),
    /// Re-queue a message with a delay in milliseconds.
    Req {
        id: [u8; MESSAGE_ID_SIZE],
        timeout_ms: u32,
    },
    /// Reset the timeout of an in-flight message.
    Touch([u8; MESSAGE_ID_SIZE]),
    /// No-op, used to answer heartbeats.
    Nop,
    /// Start a clean close of the connection.
    Cls,
    /// Publish one message.
    Pub { topic: String, body: Vec<u8> },
    /// Publish several messages atomically.
    Mpub { topic: String, bodies: Vec<Vec<u8>> },
}

impl Command {
    /// Builds an `IDENTIFY` command from any serializable feature set.
    pub fn identify<T: Serialize>(features: &T) -> Result<Self, ProtocolError> {
        Ok(Command::Identify(serde_json::to_vec(features)?))
    }

    /// Builds a `SUB` command, validating both names.
    pub fn sub(topic: &str, channel: &str) -> Result<Self, ProtocolError> {
        validate_name(topic)?;
        validate_name(channel)?;
        Ok(Command::Sub {
            topic: topic.to_string(),
            channel: channel.to_string(),
        })
    }

    /// Builds a `PUB` command, validating the topic name.
    pub fn publish(topic: &str, body: impl Into<Vec<u8>>) -> Result<Self, ProtocolError> {
        validate_name(topic)?;
        Ok(Command::Pub {
            topic: topic.to_string(),
            body: body.into(),
        })
    }

    /// Returns the command verb.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Identify(_) => "IDENTIFY",
            Command::Sub { .. } => "SUB",
            Command::Rdy(_) => "RDY",
            Command::Fin(_) => "FIN",
            Command::Req { .. } => "REQ",
            Command::Touch(_) => "TOUCH",
            Command::Nop => "NOP",
            Command::Cls => "CLS",
            Command::Pub { .. } => "PUB",
            Command::Mpub { .. } => "MPUB",
        }
    }

    /// Appends the wire encoding of this command to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.name().as_bytes());
        match self {
            Command::Identify(body) => {
                buf.push(b'\n');
                put_sized(buf, body);
            }
            Command::Sub { topic, channel } => {
                push_param(buf, topic.as_bytes());
                push_param(buf, channel.as_bytes());
                buf.push(b'\n');
            }
            Command::Rdy(count) => {
                push_param(buf, count.to_string().as_bytes());
                buf.push(b'\n');
            }
            Command::Fin(id) | Command::Touch(id) => {
                push_param(buf, id);
                buf.push(b'\n');
            }
            Command::Req { id, timeout_ms } => {
                push_param(buf, id);
                push_param(buf, timeout_ms.to_string().as_bytes());
                buf.push(b'\n');
            }
            Command::Nop | Command::Cls => buf.push(b'\n'),
            Command::Pub { topic, body } => {
                push_param(buf, topic.as_bytes());
                buf.push(b'\n');
                put_sized(buf, body);
            }
            Command::Mpub { topic, bodies } => {
                push_param(buf, topic.as_bytes());
                buf.push(b'\n');
                let total = 4 + bodies.iter().map(|b| 4 + b.len()).sum::<usize>();
                buf.extend_from_slice(&(total as u32).to_be_bytes());
                buf.extend_from_slice(&(bodies.len() as u32).to_be_bytes());
                for body in bodies {
                    put_sized(buf, body);
                }
            }
        }
    }

    /// Returns the wire encoding as a fresh buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }
}

fn push_param(buf: &mut Vec<u8>, param: &[u8]) {
    buf.push(b' ');
    buf.extend_from_slice(param);
}

fn put_sized(buf: &mut Vec<u8>, body: &[u8]) {
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(body);
}

/// Checks a topic or channel name: 1..=64 chars of `[.a-zA-Z0-9_-]`,
/// optionally ending in `#ephemeral`.
pub fn validate_name(name: &str) -> Result<(), ProtocolError> {
    let base = name.strip_suffix("#ephemeral").unwrap_or(name);
    let valid = !name.is_empty()
        && name.len() <= 64
        && !base.is_empty()
        && base
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(ProtocolError::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: [u8; MESSAGE_ID_SIZE] = *b"0123456789abcdef";

    #[test]
    fn sub_encodes_topic_and_channel() {
        let cmd = Command::sub("orders", "billing").unwrap();
        assert_eq!(cmd.to_bytes(), b"SUB orders billing\n");
    }

    #[test]
    fn bare_commands() {
        assert_eq!(Command::Nop.to_bytes(), b"NOP\n");
        assert_eq!(Command::Cls.to_bytes(), b"CLS\n");
        assert_eq!(Command::Rdy(25).to_bytes(), b"RDY 25\n");
    }

    #[test]
    fn message_id_commands() {
        assert_eq!(Command::Fin(ID).to_bytes(), b"FIN 0123456789abcdef\n");
        assert_eq!(Command::Touch(ID).to_bytes(), b"TOUCH 0123456789abcdef\n");
        let req = Command::Req {
            id: ID,
            timeout_ms: 1500,
        };
        assert_eq!(req.to_bytes(), b"REQ 0123456789abcdef 1500\n");
    }

    #[test]
    fn pub_carries_sized_body() {
        let cmd = Command::publish("orders", b"hello".to_vec()).unwrap();
        let mut expected = b"PUB orders\n".to_vec();
        expected.extend_from_slice(&5u32.to_be_bytes());
        expected.extend_from_slice(b"hello");
        assert_eq!(cmd.to_bytes(), expected);
    }

    #[test]
    fn mpub_prefixes_total_size_and_count() {
        let cmd = Command::Mpub {
            topic: "t".into(),
            bodies: vec![b"ab".to_vec(), b"c".to_vec()],
        };
        let bytes = cmd.to_bytes();
        let header = b"MPUB t\n".len();
        let total = u32::from_be_bytes(bytes[header..header + 4].try_into().unwrap());
        // count + (4 + 2) + (4 + 1)
        assert_eq!(total, 4 + 6 + 5);
        let count = u32::from_be_bytes(bytes[header + 4..header + 8].try_into().unwrap());
        assert_eq!(count, 2);
        assert_eq!(bytes.len(), header + 4 + total as usize);
    }

    #[test]
    fn identify_serializes_json_body() {
        let cmd = Command::identify(&serde_json::json!({"client_id": "tail"})).unwrap();
        let bytes = cmd.to_bytes();
        assert!(bytes.starts_with(b"IDENTIFY\n"));
        let len = u32::from_be_bytes(bytes[9..13].try_into().unwrap()) as usize;
        let body: serde_json::Value = serde_json::from_slice(&bytes[13..13 + len]).unwrap();
        assert_eq!(body["client_id"], "tail");
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("orders.v1_x-y").is_ok());
        assert!(validate_name("tail#ephemeral").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("#ephemeral").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name(&"a".repeat(65)).is_err());
        assert!(matches!(
            Command::sub("ok", "bad/channel"),
            Err(ProtocolError::InvalidName(n)) if n == "bad/channel"
        ));
    }
}
