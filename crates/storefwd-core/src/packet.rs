//! Mesh packet model at the transport seam
//!
//! The engine never frames or encrypts packets itself; it consumes and
//! produces `MeshPacket` values through the transport. A packet arrives
//! either decoded (the transport could decrypt it) or as raw ciphertext.

use crate::types::{ChannelId, NodeId};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Maximum application payload carried by one mesh packet
pub const MAX_PAYLOAD_LEN: usize = 237;

// ----------------------------------------------------------------------------
// Port Numbers
// ----------------------------------------------------------------------------

/// Application port of a decoded payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortNum {
    /// Plain UTF-8 text message
    TextMessage,
    /// Link-layer routing/acknowledgment traffic
    Routing,
    /// Store & Forward protocol envelope
    StoreForward,
}

// ----------------------------------------------------------------------------
// Priority
// ----------------------------------------------------------------------------

/// Transmit priority hint passed to the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    /// Low priority, yields to interactive traffic
    Background,
    #[default]
    Default,
    /// Elevated priority for retried or critical frames
    Reliable,
}

// ----------------------------------------------------------------------------
// Payload
// ----------------------------------------------------------------------------

/// Decoded application payload of a mesh packet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedPayload {
    pub portnum: Option<PortNum>,
    pub payload: Vec<u8>,
    pub want_response: bool,
    /// ID of the message this one replies to, or 0
    pub reply_id: u32,
    pub emoji: bool,
    /// ID of the request this packet answers (used by routing ACKs), or 0
    pub request_id: u32,
}

/// Payload variant of a mesh packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadVariant {
    Decoded(DecodedPayload),
    /// Ciphertext the transport could not decrypt for us
    Encrypted(Vec<u8>),
}

// ----------------------------------------------------------------------------
// Mesh Packet
// ----------------------------------------------------------------------------

/// One packet as seen at the transport seam
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshPacket {
    pub from: NodeId,
    pub to: NodeId,
    pub id: u32,
    pub channel: ChannelId,
    /// Receive timestamp in seconds since epoch (0 if unknown)
    pub rx_time: u32,
    pub priority: Priority,
    pub want_ack: bool,
    pub payload: PayloadVariant,
}

impl MeshPacket {
    /// Access the decoded payload, if the transport decrypted this packet
    pub fn decoded(&self) -> Option<&DecodedPayload> {
        match &self.payload {
            PayloadVariant::Decoded(d) => Some(d),
            PayloadVariant::Encrypted(_) => None,
        }
    }

    /// Mutable access to the decoded payload
    pub fn decoded_mut(&mut self) -> Option<&mut DecodedPayload> {
        match &mut self.payload {
            PayloadVariant::Decoded(d) => Some(d),
            PayloadVariant::Encrypted(_) => None,
        }
    }

    /// Bytes of a decoded text-message payload, if this packet carries one
    pub fn text_payload(&self) -> Option<&[u8]> {
        match self.decoded() {
            Some(d) if d.portnum == Some(PortNum::TextMessage) && !d.payload.is_empty() => {
                Some(&d.payload)
            }
            _ => None,
        }
    }

    /// True when this packet is a link-layer acknowledgment for `id`
    pub fn acknowledges(&self, id: u32) -> bool {
        match self.decoded() {
            Some(d) => d.portnum == Some(PortNum::Routing) && d.request_id == id && id != 0,
            None => false,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
