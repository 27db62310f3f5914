//! Outbound message construction
//!
//! The messenger owns the transport handle and knows the packet policy:
//! protocol envelopes ride at background priority, only critical control
//! frames and replayed text request a link-layer acknowledgment, and
//! retried replays go out at elevated priority with `request_id` naming
//! the original record.
//!
//! A transport `send` failure on an ack-tracked frame is deliberately
//! surfaced through the ack timeout rather than the return value: the
//! caller still receives the allocated packet ID and the retry engine is
//! the recovery path.

use tracing::warn;

use crate::errors::{ProtocolError, Result, StoreForwardError, TransportError};
use crate::history::PacketRecord;
use crate::packet::{DecodedPayload, MeshPacket, PortNum, Priority, MAX_PAYLOAD_LEN};
use crate::proto::{HistoryPayload, RequestResponse, StatsPayload, StoreAndForward};
use crate::transport::Transport;
use crate::types::NodeId;

/// Builds and sends Store & Forward traffic through the transport seam
pub struct Messenger {
    transport: Box<dyn Transport>,
}

impl Messenger {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self { transport }
    }

    // ------------------------------------------------------------------
    // Transport queries
    // ------------------------------------------------------------------

    pub fn local_node(&self) -> NodeId {
        self.transport.local_node()
    }

    pub fn is_tx_allowed(&self) -> bool {
        self.transport.is_tx_allowed()
    }

    pub fn channel_utilization_percent(&self) -> f32 {
        self.transport.channel_utilization_percent()
    }

    pub fn is_default_channel(&self, channel: crate::types::ChannelId) -> bool {
        self.transport.is_default_channel(channel)
    }

    // ------------------------------------------------------------------
    // Protocol envelopes
    // ------------------------------------------------------------------

    /// Send a bare protocol envelope
    ///
    /// `ROUTER_ERROR` and `ROUTER_BUSY` are critical control frames and
    /// request an acknowledgment; everything else does not.
    pub fn send_control(&mut self, to: NodeId, rr: RequestResponse) -> Result<u32> {
        let want_ack = matches!(
            rr,
            RequestResponse::RouterError | RequestResponse::RouterBusy
        );
        self.send_envelope(to, &StoreAndForward::bare(rr), want_ack, Priority::Background)
    }

    /// Broadcast the server heartbeat beacon
    pub fn send_heartbeat(&mut self, period: u32) -> Result<u32> {
        self.send_envelope(
            NodeId::BROADCAST,
            &StoreAndForward::heartbeat(period, 0),
            false,
            Priority::Background,
        )
    }

    /// Announce an upcoming replay session
    pub fn send_history_response(
        &mut self,
        to: NodeId,
        history_messages: u32,
        window_ms: u32,
        last_request: u32,
    ) -> Result<u32> {
        let envelope = StoreAndForward::history(
            RequestResponse::RouterHistory,
            HistoryPayload {
                history_messages,
                window: window_ms,
                last_request,
            },
        );
        self.send_envelope(to, &envelope, true, Priority::Background)
    }

    /// Send the server statistics snapshot
    pub fn send_stats(&mut self, to: NodeId, stats: StatsPayload) -> Result<u32> {
        self.send_envelope(to, &StoreAndForward::stats(stats), false, Priority::Background)
    }

    /// Replay one stored record to `dest`
    ///
    /// Replays always request an acknowledgment; a retry goes out at
    /// elevated priority with `request_id` set to the original record ID.
    pub fn send_replay(
        &mut self,
        dest: NodeId,
        record: &PacketRecord,
        is_retry: bool,
    ) -> Result<u32> {
        let rr = if record.to == NodeId::BROADCAST {
            RequestResponse::RouterTextBroadcast
        } else {
            RequestResponse::RouterTextDirect
        };
        let envelope = StoreAndForward::text(rr, record.payload.clone());

        let mut packet = self.allocate(dest, PortNum::StoreForward)?;
        packet.want_ack = true;
        packet.priority = if is_retry {
            Priority::Reliable
        } else {
            Priority::Background
        };
        packet.rx_time = record.time;
        if let Some(decoded) = packet.decoded_mut() {
            decoded.payload = encode_checked(&envelope)?;
            decoded.reply_id = record.reply_id;
            decoded.emoji = record.emoji;
            if is_retry {
                decoded.request_id = record.id;
            }
        }

        self.dispatch(packet)
    }

    // ------------------------------------------------------------------
    // Client requests
    // ------------------------------------------------------------------

    /// Ask `server` for history; `minutes` of 0 lets the server pick its
    /// default window
    pub fn request_history(&mut self, server: NodeId, minutes: u32) -> Result<u32> {
        let envelope = StoreAndForward::history(
            RequestResponse::ClientHistory,
            HistoryPayload {
                window: minutes,
                ..HistoryPayload::default()
            },
        );
        self.send_envelope(server, &envelope, false, Priority::Background)
    }

    pub fn request_stats(&mut self, server: NodeId) -> Result<u32> {
        self.send_control(server, RequestResponse::ClientStats)
    }

    pub fn send_ping(&mut self, server: NodeId) -> Result<u32> {
        self.send_control(server, RequestResponse::ClientPing)
    }

    pub fn send_pong(&mut self, server: NodeId) -> Result<u32> {
        self.send_control(server, RequestResponse::ClientPong)
    }

    // ------------------------------------------------------------------
    // Text notifications
    // ------------------------------------------------------------------

    /// Send a plain text message to `to`
    pub fn send_text(
        &mut self,
        to: NodeId,
        text: &str,
        priority: Priority,
        want_ack: bool,
    ) -> Result<u32> {
        let mut packet = self.allocate(to, PortNum::TextMessage)?;
        packet.want_ack = want_ack;
        packet.priority = priority;
        if let Some(decoded) = packet.decoded_mut() {
            decoded.payload = text.as_bytes().to_vec();
        }
        self.dispatch(packet)
    }

    /// Re-inject a packet into the local delivery pipeline (client replay
    /// ingestion, phone delivery)
    pub fn send_raw(&mut self, packet: MeshPacket) -> Result<u32> {
        self.dispatch(packet)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn send_envelope(
        &mut self,
        to: NodeId,
        envelope: &StoreAndForward,
        want_ack: bool,
        priority: Priority,
    ) -> Result<u32> {
        let mut packet = self.allocate(to, PortNum::StoreForward)?;
        packet.want_ack = want_ack;
        packet.priority = priority;
        if let Some(decoded) = packet.decoded_mut() {
            decoded.payload = encode_checked(envelope)?;
        }
        self.dispatch(packet)
    }

    fn allocate(&mut self, to: NodeId, portnum: PortNum) -> Result<MeshPacket> {
        let mut packet = self.transport.allocate_packet()?;
        packet.to = to;
        // All module traffic rides the primary channel slot.
        packet.channel = crate::types::ChannelId::new(0);
        packet.payload = crate::packet::PayloadVariant::Decoded(DecodedPayload {
            portnum: Some(portnum),
            ..DecodedPayload::default()
        });
        Ok(packet)
    }

    fn dispatch(&mut self, packet: MeshPacket) -> Result<u32> {
        let id = packet.id;
        if let Err(err) = self.transport.send(packet) {
            match err {
                TransportError::SendFailed { ref reason } => {
                    // Dropped frame; the ack timeout is the recovery path.
                    warn!("S&F - Transport send failed for 0x{id:08x}: {reason}");
                }
                other => return Err(StoreForwardError::Transport(other)),
            }
        }
        Ok(id)
    }
}

/// Encode an envelope, rejecting anything too big for one mesh packet
fn encode_checked(envelope: &StoreAndForward) -> Result<Vec<u8>> {
    let bytes = envelope.encode();
    if bytes.len() > MAX_PAYLOAD_LEN {
        return Err(StoreForwardError::Protocol(ProtocolError::EncodeTooLarge {
            size: bytes.len(),
            max: MAX_PAYLOAD_LEN,
        }));
    }
    Ok(bytes)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Variant;
    use crate::testing::MockTransport;
    use crate::types::ChannelId;

    fn messenger() -> (Messenger, crate::testing::MockTransportHandle) {
        let transport = MockTransport::new(NodeId::new(0x10));
        let handle = transport.handle();
        (Messenger::new(Box::new(transport)), handle)
    }

    #[test]
    fn test_control_ack_policy() {
        let (mut messenger, handle) = messenger();
        messenger
            .send_control(NodeId::new(2), RequestResponse::RouterBusy)
            .unwrap();
        messenger
            .send_control(NodeId::new(2), RequestResponse::RouterPong)
            .unwrap();

        let sent = handle.sent();
        assert!(sent[0].want_ack);
        assert!(!sent[1].want_ack);
        assert_eq!(sent[0].priority, Priority::Background);
    }

    #[test]
    fn test_replay_retry_marks_request_id() {
        let (mut messenger, handle) = messenger();
        let record = PacketRecord {
            time: 9000,
            from: NodeId::new(0xA),
            to: NodeId::new(0xC),
            id: 77,
            channel: 1,
            reply_id: 0,
            emoji: false,
            payload: b"you".to_vec(),
        };

        messenger
            .send_replay(NodeId::new(0xC), &record, false)
            .unwrap();
        messenger
            .send_replay(NodeId::new(0xC), &record, true)
            .unwrap();

        let sent = handle.sent();
        let first = sent[0].decoded().unwrap();
        let retry = sent[1].decoded().unwrap();

        assert!(sent[0].want_ack && sent[1].want_ack);
        assert_eq!(sent[0].priority, Priority::Background);
        assert_eq!(sent[1].priority, Priority::Reliable);
        assert_eq!(first.request_id, 0);
        assert_eq!(retry.request_id, 77);
        // Fresh packet ID on retry.
        assert_ne!(sent[0].id, sent[1].id);

        let envelope = StoreAndForward::decode(&first.payload).unwrap();
        assert_eq!(envelope.rr, RequestResponse::RouterTextDirect);
        assert_eq!(envelope.variant, Variant::Text(b"you".to_vec()));
    }

    #[test]
    fn test_broadcast_record_uses_broadcast_kind() {
        let (mut messenger, handle) = messenger();
        let record = PacketRecord {
            time: 9000,
            from: NodeId::new(0xA),
            to: NodeId::BROADCAST,
            id: 5,
            channel: 1,
            reply_id: 0,
            emoji: false,
            payload: b"hi".to_vec(),
        };
        messenger
            .send_replay(NodeId::new(0xC), &record, false)
            .unwrap();

        let sent = handle.sent();
        let envelope = StoreAndForward::decode(&sent[0].decoded().unwrap().payload).unwrap();
        assert_eq!(envelope.rr, RequestResponse::RouterTextBroadcast);
        // Delivered to the requesting client, not re-broadcast.
        assert_eq!(sent[0].to, NodeId::new(0xC));
    }

    #[test]
    fn test_send_text() {
        let (mut messenger, handle) = messenger();
        messenger
            .send_text(NodeId::new(0xD), "S&F - Busy. Try again shortly.", Priority::Background, false)
            .unwrap();

        let sent = handle.sent();
        let decoded = sent[0].decoded().unwrap();
        assert_eq!(decoded.portnum, Some(PortNum::TextMessage));
        assert_eq!(decoded.payload, b"S&F - Busy. Try again shortly.");
        assert_eq!(sent[0].channel, ChannelId::new(0));
    }

    #[test]
    fn test_oversize_replay_rejected() {
        let (mut messenger, handle) = messenger();
        let record = PacketRecord {
            time: 9000,
            from: NodeId::new(0xA),
            to: NodeId::new(0xC),
            id: 5,
            channel: 1,
            reply_id: 0,
            emoji: false,
            payload: vec![b'x'; MAX_PAYLOAD_LEN], // envelope overhead pushes it over
        };
        let err = messenger
            .send_replay(NodeId::new(0xC), &record, false)
            .unwrap_err();
        assert!(matches!(
            err,
            StoreForwardError::Protocol(ProtocolError::EncodeTooLarge { .. })
        ));
        assert!(handle.sent().is_empty());
    }
}
