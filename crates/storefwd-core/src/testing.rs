//! Mock seam implementations and test helpers
//!
//! Deterministic doubles for the transport, clock, and node-directory
//! seams, shared by unit tests, the integration suite, and downstream
//! harnesses.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::errors::TransportError;
use crate::nodedb::{NodeDirectory, NodeInfo};
use crate::packet::{DecodedPayload, MeshPacket, PayloadVariant, PortNum, Priority};
use crate::transport::Transport;
use crate::types::{ChannelId, Clock, NodeId};

// ----------------------------------------------------------------------------
// Mock Transport
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MockTransportShared {
    sent: RefCell<Vec<MeshPacket>>,
    tx_allowed: Cell<bool>,
    alloc_fails: Cell<bool>,
    send_fails: Cell<bool>,
    utilization: Cell<f32>,
    next_id: Cell<u32>,
}

/// Transport double that records every sent packet
///
/// Packet IDs are handed out sequentially from 0x1000 so tests can assert
/// on concrete values. Channel 0 is the default/public channel.
#[derive(Debug)]
pub struct MockTransport {
    local: NodeId,
    shared: Rc<MockTransportShared>,
}

impl MockTransport {
    pub fn new(local: NodeId) -> Self {
        let shared = MockTransportShared {
            tx_allowed: Cell::new(true),
            next_id: Cell::new(0x1000),
            ..MockTransportShared::default()
        };
        Self {
            local,
            shared: Rc::new(shared),
        }
    }

    /// Handle for inspecting and steering the transport from outside
    pub fn handle(&self) -> MockTransportHandle {
        MockTransportHandle {
            shared: Rc::clone(&self.shared),
        }
    }
}

/// Shared view into a [`MockTransport`]
#[derive(Debug, Clone)]
pub struct MockTransportHandle {
    shared: Rc<MockTransportShared>,
}

impl MockTransportHandle {
    /// All packets sent so far, in order
    pub fn sent(&self) -> Vec<MeshPacket> {
        self.shared.sent.borrow().clone()
    }

    /// Drop the recorded packets
    pub fn clear_sent(&self) {
        self.shared.sent.borrow_mut().clear();
    }

    /// Number of packets sent so far
    pub fn sent_count(&self) -> usize {
        self.shared.sent.borrow().len()
    }

    /// Gate or open the airtime governor
    pub fn set_tx_allowed(&self, allowed: bool) {
        self.shared.tx_allowed.set(allowed);
    }

    /// Make `allocate_packet` fail
    pub fn set_alloc_fails(&self, fails: bool) {
        self.shared.alloc_fails.set(fails);
    }

    /// Make `send` report dropped frames
    pub fn set_send_fails(&self, fails: bool) {
        self.shared.send_fails.set(fails);
    }

    pub fn set_utilization(&self, percent: f32) {
        self.shared.utilization.set(percent);
    }
}

impl Transport for MockTransport {
    fn allocate_packet(&mut self) -> Result<MeshPacket, TransportError> {
        if self.shared.alloc_fails.get() {
            return Err(TransportError::AllocFailed);
        }
        let id = self.shared.next_id.get();
        self.shared.next_id.set(id + 1);
        Ok(MeshPacket {
            from: self.local,
            to: NodeId::BROADCAST,
            id,
            channel: ChannelId::new(0),
            rx_time: 0,
            priority: Priority::default(),
            want_ack: false,
            payload: PayloadVariant::Decoded(DecodedPayload::default()),
        })
    }

    fn send(&mut self, packet: MeshPacket) -> Result<(), TransportError> {
        if self.shared.send_fails.get() {
            return Err(TransportError::SendFailed {
                reason: "simulated radio drop".into(),
            });
        }
        self.shared.sent.borrow_mut().push(packet);
        Ok(())
    }

    fn is_tx_allowed(&self) -> bool {
        self.shared.tx_allowed.get()
    }

    fn channel_utilization_percent(&self) -> f32 {
        self.shared.utilization.get()
    }

    fn is_default_channel(&self, channel: ChannelId) -> bool {
        channel.index() == 0
    }

    fn local_node(&self) -> NodeId {
        self.local
    }
}

// ----------------------------------------------------------------------------
// Manual Clock
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ManualClockShared {
    now_ms: Cell<u64>,
    unix: Cell<u32>,
}

/// Clock advanced by hand from tests
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    shared: Rc<ManualClockShared>,
}

impl ManualClock {
    pub fn new(now_ms: u64, unix: u32) -> Self {
        let clock = Self::default();
        clock.shared.now_ms.set(now_ms);
        clock.shared.unix.set(unix);
        clock
    }

    /// Advance both the monotonic and wall clocks by `ms`
    pub fn advance(&self, ms: u64) {
        self.shared.now_ms.set(self.shared.now_ms.get() + ms);
        self.shared
            .unix
            .set(self.shared.unix.get() + (ms / 1000) as u32);
    }

    pub fn set_unix(&self, unix: u32) {
        self.shared.unix.set(unix);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.shared.now_ms.get()
    }

    fn unix_time(&self) -> u32 {
        self.shared.unix.get()
    }
}

// ----------------------------------------------------------------------------
// Static Directory
// ----------------------------------------------------------------------------

/// Node directory backed by a fixed list
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    entries: Vec<(NodeId, NodeInfo)>,
}

impl StaticDirectory {
    pub fn with_node(mut self, node: NodeId, long_name: &str, short_name: &str) -> Self {
        self.entries.push((
            node,
            NodeInfo {
                long_name: long_name.to_string(),
                short_name: short_name.to_string(),
            },
        ));
        self
    }
}

impl NodeDirectory for StaticDirectory {
    fn lookup(&self, node: NodeId) -> Option<NodeInfo> {
        self.entries
            .iter()
            .find(|(id, _)| *id == node)
            .map(|(_, info)| info.clone())
    }
}

// ----------------------------------------------------------------------------
// Packet Builders
// ----------------------------------------------------------------------------

/// Decoded text-message packet, as the transport would deliver it
pub fn text_packet(from: NodeId, to: NodeId, channel: u8, id: u32, text: &str) -> MeshPacket {
    MeshPacket {
        from,
        to,
        id,
        channel: ChannelId::new(channel),
        rx_time: 0,
        priority: Priority::default(),
        want_ack: false,
        payload: PayloadVariant::Decoded(DecodedPayload {
            portnum: Some(PortNum::TextMessage),
            payload: text.as_bytes().to_vec(),
            ..DecodedPayload::default()
        }),
    }
}

/// Store & Forward protocol packet carrying an already-encoded envelope
pub fn protocol_packet(from: NodeId, to: NodeId, channel: u8, id: u32, bytes: Vec<u8>) -> MeshPacket {
    MeshPacket {
        from,
        to,
        id,
        channel: ChannelId::new(channel),
        rx_time: 0,
        priority: Priority::default(),
        want_ack: false,
        payload: PayloadVariant::Decoded(DecodedPayload {
            portnum: Some(PortNum::StoreForward),
            payload: bytes,
            ..DecodedPayload::default()
        }),
    }
}

/// Link-layer acknowledgment for packet `acked_id`
pub fn ack_packet(from: NodeId, to: NodeId, id: u32, acked_id: u32) -> MeshPacket {
    MeshPacket {
        from,
        to,
        id,
        channel: ChannelId::new(0),
        rx_time: 0,
        priority: Priority::default(),
        want_ack: false,
        payload: PayloadVariant::Decoded(DecodedPayload {
            portnum: Some(PortNum::Routing),
            request_id: acked_id,
            ..DecodedPayload::default()
        }),
    }
}
