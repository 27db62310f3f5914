//! Transport seam
//!
//! The engine talks to the radio through this trait only. Framing,
//! encryption, routing, and ACK generation all live on the other side;
//! the engine sees allocated packets going out and received packets
//! coming in through the role handlers.

use crate::errors::TransportError;
use crate::packet::MeshPacket;
use crate::types::{ChannelId, NodeId};

/// Mesh transport consumed by the Store & Forward roles
///
/// `allocate_packet` returns a packet pre-filled with a fresh unique ID and
/// `from` set to the local node; callers fill in destination and payload.
pub trait Transport {
    /// Allocate an outbound packet with a fresh ID
    fn allocate_packet(&mut self) -> Result<MeshPacket, TransportError>;

    /// Hand a packet to the mesh for transmission
    fn send(&mut self, packet: MeshPacket) -> Result<(), TransportError>;

    /// Whether the airtime governor currently permits a transmission
    fn is_tx_allowed(&self) -> bool;

    /// Current channel utilization, for diagnostics
    fn channel_utilization_percent(&self) -> f32;

    /// Whether `channel` is the default/public channel
    fn is_default_channel(&self, channel: ChannelId) -> bool;

    /// The local node's own ID
    fn local_node(&self) -> NodeId;
}
