//! Broker-to-client frames.
//!
//! Wire format: `[4 bytes BE size][4 bytes BE frame type][size - 4 bytes data]`.

use crate::ProtocolError;
use crate::constants::{
    FRAME_TYPE_ERROR, FRAME_TYPE_MESSAGE, FRAME_TYPE_RESPONSE, HEARTBEAT, MAX_FRAME_SIZE,
    MESSAGE_HEADER_SIZE, MESSAGE_ID_SIZE, OK,
};

/// A message delivered to a subscribed consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Publish time in nanoseconds since the Unix epoch.
    pub timestamp: i64,
    /// Delivery attempts so far, starting at 1.
    pub attempts: u16,
    pub id: [u8; MESSAGE_ID_SIZE],
    pub body: Vec<u8>,
}

impl Message {
    /// Returns the message id as text (ids are ASCII hex on the wire).
    pub fn id_str(&self) -> String {
        String::from_utf8_lossy(&self.id).into_owned()
    }

    fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < MESSAGE_HEADER_SIZE {
            return Err(ProtocolError::TruncatedMessage(data.len()));
        }
        let timestamp = i64::from_be_bytes(data[0..8].try_into().unwrap_or_default());
        let attempts = u16::from_be_bytes([data[8], data[9]]);
        let mut id = [0u8; MESSAGE_ID_SIZE];
        id.copy_from_slice(&data[10..MESSAGE_HEADER_SIZE]);
        Ok(Self {
            timestamp,
            attempts,
            id,
            body: data[MESSAGE_HEADER_SIZE..].to_vec(),
        })
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Response(Vec<u8>),
    Error(Vec<u8>),
    Message(Message),
}

impl Frame {
    /// True for the broker's `_heartbeat_` response.
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Frame::Response(body) if body.as_slice() == HEARTBEAT)
    }

    /// True for a plain `OK` response.
    pub fn is_ok(&self) -> bool {
        matches!(self, Frame::Response(body) if body.as_slice() == OK)
    }

    /// Decodes one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` does not yet hold a complete frame,
    /// otherwise the frame and the number of bytes it occupied.
    pub fn decode(buf: &[u8]) -> Result<Option<(Frame, usize)>, ProtocolError> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let size = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if size > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge { size });
        }
        if size < 4 {
            return Err(ProtocolError::TruncatedMessage(size));
        }
        if buf.len() < 4 + size {
            return Ok(None);
        }

        let frame_type = i32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let data = &buf[8..4 + size];
        let frame = match frame_type {
            FRAME_TYPE_RESPONSE => Frame::Response(data.to_vec()),
            FRAME_TYPE_ERROR => Frame::Error(data.to_vec()),
            FRAME_TYPE_MESSAGE => Frame::Message(Message::decode(data)?),
            other => return Err(ProtocolError::UnknownFrameType(other)),
        };
        Ok(Some((frame, 4 + size)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_frame(frame_type: i32, data: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((data.len() + 4) as u32).to_be_bytes());
        buf.extend_from_slice(&frame_type.to_be_bytes());
        buf.extend_from_slice(data);
        buf
    }

    #[test]
    fn decodes_ok_and_heartbeat() {
        let (frame, used) = Frame::decode(&raw_frame(FRAME_TYPE_RESPONSE, b"OK"))
            .unwrap()
            .unwrap();
        assert!(frame.is_ok());
        assert!(!frame.is_heartbeat());
        assert_eq!(used, 10);

        let (frame, _) = Frame::decode(&raw_frame(FRAME_TYPE_RESPONSE, b"_heartbeat_"))
            .unwrap()
            .unwrap();
        assert!(frame.is_heartbeat());
    }

    #[test]
    fn incomplete_frame_needs_more_bytes() {
        let full = raw_frame(FRAME_TYPE_ERROR, b"E_INVALID");
        assert!(Frame::decode(&full[..3]).unwrap().is_none());
        assert!(Frame::decode(&full[..full.len() - 1]).unwrap().is_none());
        let (frame, _) = Frame::decode(&full).unwrap().unwrap();
        assert_eq!(frame, Frame::Error(b"E_INVALID".to_vec()));
    }

    #[test]
    fn decodes_message_frame() {
        let mut data = Vec::new();
        data.extend_from_slice(&1_700_000_000_000_000_000i64.to_be_bytes());
        data.extend_from_slice(&3u16.to_be_bytes());
        data.extend_from_slice(b"0123456789abcdef");
        data.extend_from_slice(b"payload");

        let mut buf = raw_frame(FRAME_TYPE_MESSAGE, &data);
        buf.extend_from_slice(&raw_frame(FRAME_TYPE_RESPONSE, b"OK"));

        let (frame, used) = Frame::decode(&buf).unwrap().unwrap();
        let Frame::Message(msg) = frame else {
            panic!("expected message frame");
        };
        assert_eq!(msg.attempts, 3);
        assert_eq!(msg.id_str(), "0123456789abcdef");
        assert_eq!(msg.body, b"payload");

        // Second frame starts right after the first.
        let (next, _) = Frame::decode(&buf[used..]).unwrap().unwrap();
        assert!(next.is_ok());
    }

    #[test]
    fn rejects_bad_frames() {
        assert!(matches!(
            Frame::decode(&raw_frame(7, b"x")),
            Err(ProtocolError::UnknownFrameType(7))
        ));
        assert!(matches!(
            Frame::decode(&raw_frame(FRAME_TYPE_MESSAGE, b"short")),
            Err(ProtocolError::TruncatedMessage(5))
        ));
        let huge = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes();
        assert!(matches!(
            Frame::decode(&huge),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }
}
