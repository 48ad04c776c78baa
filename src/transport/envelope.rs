use crate::message::Message;
use crate::node::NodeId;
use crate::transport::error::{TransportError, TransportResult};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub const ENVELOPE_VERSION: u8 = 1;

/// Payloads above this are rejected before decoding
pub const MAX_ENVELOPE_BYTES: usize = 64 * 1024;

/// Framing carried between peers
#[derive(Serialize, Deserialize)]
struct Frame {
    version: u8,
    from_peer: NodeId,
    checksum: [u8; 32],
    body: Vec<u8>,
}

/// A message in transit between relays, tagged with the handing peer
#[derive(Debug, Clone, PartialEq)]
pub struct RelayEnvelope {
    pub message: Message,
    pub from_peer: NodeId,
}

impl RelayEnvelope {
    pub fn new(message: Message, from_peer: impl Into<NodeId>) -> Self {
        Self {
            message,
            from_peer: from_peer.into(),
        }
    }

    /// bincode frame with a BLAKE3 checksum over the message body
    pub fn encode(&self) -> TransportResult<Bytes> {
        let body = bincode::serialize(&self.message)?;
        let frame = Frame {
            version: ENVELOPE_VERSION,
            from_peer: self.from_peer.clone(),
            checksum: checksum(&body),
            body,
        };

        let bytes = bincode::serialize(&frame)?;
        if bytes.len() > MAX_ENVELOPE_BYTES {
            return Err(TransportError::TooLarge(bytes.len()));
        }
        Ok(Bytes::from(bytes))
    }

    pub fn decode(bytes: &[u8]) -> TransportResult<Self> {
        if bytes.len() > MAX_ENVELOPE_BYTES {
            return Err(TransportError::TooLarge(bytes.len()));
        }

        let frame: Frame = bincode::deserialize(bytes)?;
        if frame.version != ENVELOPE_VERSION {
            return Err(TransportError::UnsupportedVersion(frame.version));
        }
        if checksum(&frame.body) != frame.checksum {
            return Err(TransportError::ChecksumMismatch);
        }

        Ok(Self {
            message: bincode::deserialize(&frame.body)?,
            from_peer: frame.from_peer,
        })
    }
}

fn checksum(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{NewMessage, Priority};
    use chrono::Utc;

    fn envelope() -> RelayEnvelope {
        let now = Utc::now();
        let mut message = Message::new(
            "m-1".into(),
            NewMessage {
                sender_id: "alice".into(),
                recipient_id: "bob".into(),
                content: "water at the school".into(),
                priority: Priority::Emergency,
                ..Default::default()
            },
            15,
            now,
            now + chrono::Duration::days(7),
        );
        message.record_hop(&"r1".to_string()).unwrap();
        RelayEnvelope::new(message, "r1")
    }

    #[test]
    fn test_decode_preserves_hop_state() {
        let original = envelope();
        let decoded = RelayEnvelope::decode(&original.encode().unwrap()).unwrap();

        assert_eq!(decoded.from_peer, "r1");
        assert_eq!(decoded.message.route_path, vec!["r1"]);
        assert_eq!(decoded.message.ttl, 14);
        assert_eq!(decoded.message.priority, Priority::Emergency);
    }

    #[test]
    fn test_tampered_body_is_rejected() {
        let mut bytes = envelope().encode().unwrap().to_vec();
        // last byte belongs to the message body
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;

        assert!(matches!(
            RelayEnvelope::decode(&bytes),
            Err(TransportError::ChecksumMismatch)
        ));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(RelayEnvelope::decode(b"not an envelope").is_err());
        assert!(matches!(
            RelayEnvelope::decode(&vec![0u8; MAX_ENVELOPE_BYTES + 1]),
            Err(TransportError::TooLarge(_))
        ));
    }
}
