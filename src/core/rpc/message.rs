//! Wire types traded between the system processes (spec.md §3, §6).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::error::{Error, Result};
use crate::core::identity::NodeId;

/// Opaque application payload. The core only ever reads the three
/// recognized fields (`id`, `timestamp`, `senderId`); everything else
/// passes through untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Envelope(pub Value);

impl Envelope {
    pub fn new(value: Value) -> Self {
        Envelope(value)
    }

    /// The envelope's `id` field, if present and a valid UUID.
    pub fn id(&self) -> Option<Uuid> {
        self.0.get("id")?.as_str()?.parse().ok()
    }

    /// Sets the envelope's `id` field, generating a fresh UUID if
    /// `self.id()` is absent (spec.md §4.F `send_signaling`: "If
    /// `signaling.id` is missing, generate a UUID").
    pub fn ensure_id(&mut self) -> Uuid {
        if let Some(id) = self.id() {
            return id;
        }
        let fresh = Uuid::new_v4();
        if let Value::Object(map) = &mut self.0 {
            map.insert("id".into(), Value::String(fresh.to_string()));
        }
        fresh
    }

    /// The envelope's `timestamp` field (ms since epoch).
    pub fn timestamp(&self) -> Option<u64> {
        self.0.get("timestamp")?.as_u64()
    }

    /// The `senderId` field carried by user-message envelopes, used as
    /// the forwarding origin.
    pub fn sender_id(&self) -> Option<NodeId> {
        self.0.get("senderId")?.as_str()?.parse().ok()
    }
}

/// Tagged union of RPC messages exchanged over a per-peer stream
/// (spec.md §3, wire format in §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum RpcMessage {
    #[serde(rename = "ping")]
    Ping { id: Uuid, sender: NodeId },
    #[serde(rename = "pong")]
    Pong { id: Uuid, sender: NodeId },
    #[serde(rename = "message")]
    UserMessage {
        sender: NodeId,
        recipient: NodeId,
        message: Envelope,
        #[serde(rename = "signalingMessage", skip_serializing_if = "Option::is_none")]
        signaling_message: Option<Envelope>,
    },
    #[serde(rename = "signaling")]
    Signaling {
        sender: NodeId,
        recipient: NodeId,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<Envelope>,
        #[serde(rename = "signalingMessage")]
        signaling_message: Envelope,
    },
}

impl RpcMessage {
    pub fn sender(&self) -> NodeId {
        match self {
            RpcMessage::Ping { sender, .. }
            | RpcMessage::Pong { sender, .. }
            | RpcMessage::UserMessage { sender, .. }
            | RpcMessage::Signaling { sender, .. } => *sender,
        }
    }

    pub fn recipient(&self) -> Option<NodeId> {
        match self {
            RpcMessage::Ping { .. } | RpcMessage::Pong { .. } => None,
            RpcMessage::UserMessage { recipient, .. } => Some(*recipient),
            RpcMessage::Signaling { recipient, .. } => Some(*recipient),
        }
    }

    pub fn payload(&self) -> Option<&Envelope> {
        match self {
            RpcMessage::Ping { .. } | RpcMessage::Pong { .. } => None,
            RpcMessage::UserMessage { message, .. } => Some(message),
            RpcMessage::Signaling {
                signaling_message, ..
            } => Some(signaling_message),
        }
    }

    /// Serializes as a single UTF-8 JSON text frame.
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).expect("RpcMessage always serializes")
    }

    /// Parses a single UTF-8 JSON text frame.
    ///
    /// Discards malformed frames with [`Error::InvalidFrame`] — callers
    /// are expected to log at `warn` and continue, per spec.md §4.C.
    pub fn from_frame(frame: &str) -> Result<Self> {
        serde_json::from_str(frame).map_err(|e| Error::InvalidFrame(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn nid(b: u8) -> NodeId {
        let mut bytes = [0u8; 20];
        bytes[19] = b;
        NodeId::from_bytes(&bytes).unwrap()
    }

    #[test]
    fn ping_round_trips_over_json() {
        let msg = RpcMessage::Ping {
            id: Uuid::new_v4(),
            sender: nid(1),
        };
        let frame = msg.to_frame();
        let parsed = RpcMessage::from_frame(&frame).unwrap();
        assert_eq!(msg, parsed);
    }

    #[test]
    fn malformed_frame_is_rejected() {
        assert!(RpcMessage::from_frame("not json").is_err());
        assert!(RpcMessage::from_frame(r#"{"type":"bogus"}"#).is_err());
    }

    #[test]
    fn envelope_ensure_id_is_stable_once_set() {
        let mut env = Envelope::new(json!({ "timestamp": 1u64 }));
        let id = env.ensure_id();
        assert_eq!(env.ensure_id(), id);
    }

    #[test]
    fn envelope_reads_sender_id() {
        let env = Envelope::new(json!({ "senderId": nid(7).to_hex() }));
        assert_eq!(env.sender_id(), Some(nid(7)));
    }
}
