//! Store & Forward wire protocol
//!
//! The on-air envelope is the protobuf encoding of the `StoreAndForward`
//! message: field 1 carries the request/response kind, fields 2-5 form a
//! oneof of stats, history, heartbeat, or raw text bytes. The codec here is
//! hand-rolled (varints plus length-delimited submessages); unknown fields
//! are skipped on decode so newer peers stay interoperable.

use crate::errors::ProtocolError;

// ----------------------------------------------------------------------------
// Request/Response Kinds
// ----------------------------------------------------------------------------

/// Kind discriminator of a Store & Forward envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RequestResponse {
    Unset = 0,
    RouterError = 1,
    RouterHeartbeat = 2,
    RouterPing = 3,
    RouterPong = 4,
    RouterBusy = 5,
    RouterHistory = 6,
    RouterStats = 7,
    RouterTextDirect = 8,
    RouterTextBroadcast = 9,
    ClientError = 64,
    ClientHistory = 65,
    ClientStats = 66,
    ClientPing = 67,
    ClientPong = 68,
    ClientAbort = 106,
}

impl RequestResponse {
    pub fn from_u32(value: u32) -> Option<Self> {
        use RequestResponse::*;
        Some(match value {
            0 => Unset,
            1 => RouterError,
            2 => RouterHeartbeat,
            3 => RouterPing,
            4 => RouterPong,
            5 => RouterBusy,
            6 => RouterHistory,
            7 => RouterStats,
            8 => RouterTextDirect,
            9 => RouterTextBroadcast,
            64 => ClientError,
            65 => ClientHistory,
            66 => ClientStats,
            67 => ClientPing,
            68 => ClientPong,
            106 => ClientAbort,
            _ => return None,
        })
    }
}

// ----------------------------------------------------------------------------
// Variant Payloads
// ----------------------------------------------------------------------------

/// Server statistics snapshot carried by `ROUTER_STATS`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsPayload {
    /// Messages recorded over the server's lifetime
    pub messages_total: u32,
    /// Messages currently held in the ring
    pub messages_saved: u32,
    /// Ring capacity
    pub messages_max: u32,
    /// Seconds since the server role started
    pub up_time: u32,
    /// Protocol messages received
    pub requests: u32,
    /// History requests received
    pub requests_history: u32,
    pub heartbeat: bool,
    pub return_max: u32,
    pub return_window: u32,
}

/// Replay session announcement carried by `ROUTER_HISTORY`; a client's
/// `CLIENT_HISTORY` reuses `window` for the requested window in minutes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryPayload {
    pub history_messages: u32,
    /// Milliseconds in a router response, minutes in a client request
    pub window: u32,
    pub last_request: u32,
}

/// Server presence beacon carried by `ROUTER_HEARTBEAT`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatPayload {
    /// Beacon period in seconds
    pub period: u32,
    /// Address of a secondary server, 0 if none
    pub secondary: u32,
}

/// Oneof variant of the envelope
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Variant {
    #[default]
    None,
    Stats(StatsPayload),
    History(HistoryPayload),
    Heartbeat(HeartbeatPayload),
    Text(Vec<u8>),
}

// ----------------------------------------------------------------------------
// Envelope
// ----------------------------------------------------------------------------

/// A Store & Forward protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreAndForward {
    pub rr: RequestResponse,
    pub variant: Variant,
}

impl StoreAndForward {
    /// Envelope with no variant payload
    pub fn bare(rr: RequestResponse) -> Self {
        Self {
            rr,
            variant: Variant::None,
        }
    }

    pub fn heartbeat(period: u32, secondary: u32) -> Self {
        Self {
            rr: RequestResponse::RouterHeartbeat,
            variant: Variant::Heartbeat(HeartbeatPayload { period, secondary }),
        }
    }

    pub fn history(rr: RequestResponse, payload: HistoryPayload) -> Self {
        Self {
            rr,
            variant: Variant::History(payload),
        }
    }

    pub fn stats(payload: StatsPayload) -> Self {
        Self {
            rr: RequestResponse::RouterStats,
            variant: Variant::Stats(payload),
        }
    }

    pub fn text(rr: RequestResponse, bytes: Vec<u8>) -> Self {
        Self {
            rr,
            variant: Variant::Text(bytes),
        }
    }

    // ------------------------------------------------------------------
    // Encoding
    // ------------------------------------------------------------------

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        put_varint_field(&mut buf, 1, self.rr as u64);

        match &self.variant {
            Variant::None => {}
            Variant::Stats(s) => {
                let mut sub = Vec::with_capacity(32);
                put_varint_field(&mut sub, 1, s.messages_total as u64);
                put_varint_field(&mut sub, 2, s.messages_saved as u64);
                put_varint_field(&mut sub, 3, s.messages_max as u64);
                put_varint_field(&mut sub, 4, s.up_time as u64);
                put_varint_field(&mut sub, 5, s.requests as u64);
                put_varint_field(&mut sub, 6, s.requests_history as u64);
                put_varint_field(&mut sub, 7, s.heartbeat as u64);
                put_varint_field(&mut sub, 8, s.return_max as u64);
                put_varint_field(&mut sub, 9, s.return_window as u64);
                put_bytes_field(&mut buf, 2, &sub);
            }
            Variant::History(h) => {
                let mut sub = Vec::with_capacity(16);
                put_varint_field(&mut sub, 1, h.history_messages as u64);
                put_varint_field(&mut sub, 2, h.window as u64);
                put_varint_field(&mut sub, 3, h.last_request as u64);
                put_bytes_field(&mut buf, 3, &sub);
            }
            Variant::Heartbeat(h) => {
                let mut sub = Vec::with_capacity(8);
                put_varint_field(&mut sub, 1, h.period as u64);
                put_varint_field(&mut sub, 2, h.secondary as u64);
                put_bytes_field(&mut buf, 4, &sub);
            }
            Variant::Text(bytes) => {
                // The text oneof arm is encoded even when empty so the
                // receiver can tell it apart from an absent variant.
                put_tag(&mut buf, 5, WIRE_LEN);
                put_varint(&mut buf, bytes.len() as u64);
                buf.extend_from_slice(bytes);
            }
        }

        buf
    }

    // ------------------------------------------------------------------
    // Decoding
    // ------------------------------------------------------------------

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut rr = RequestResponse::Unset;
        let mut variant = Variant::None;

        let mut reader = FieldReader::new(bytes);
        while let Some((field, wire)) = reader.next_tag()? {
            match (field, wire) {
                (1, WIRE_VARINT) => {
                    let raw = reader.varint()? as u32;
                    // An unknown kind decodes as Unset; roles ignore it.
                    rr = RequestResponse::from_u32(raw).unwrap_or(RequestResponse::Unset);
                }
                (2, WIRE_LEN) => {
                    variant = Variant::Stats(decode_stats(reader.len_delimited()?)?);
                }
                (3, WIRE_LEN) => {
                    variant = Variant::History(decode_history(reader.len_delimited()?)?);
                }
                (4, WIRE_LEN) => {
                    variant = Variant::Heartbeat(decode_heartbeat(reader.len_delimited()?)?);
                }
                (5, WIRE_LEN) => {
                    variant = Variant::Text(reader.len_delimited()?.to_vec());
                }
                _ => reader.skip(wire)?,
            }
        }

        Ok(Self { rr, variant })
    }
}

fn decode_stats(bytes: &[u8]) -> Result<StatsPayload, ProtocolError> {
    let mut s = StatsPayload::default();
    let mut reader = FieldReader::new(bytes);
    while let Some((field, wire)) = reader.next_tag()? {
        match (field, wire) {
            (1, WIRE_VARINT) => s.messages_total = reader.varint()? as u32,
            (2, WIRE_VARINT) => s.messages_saved = reader.varint()? as u32,
            (3, WIRE_VARINT) => s.messages_max = reader.varint()? as u32,
            (4, WIRE_VARINT) => s.up_time = reader.varint()? as u32,
            (5, WIRE_VARINT) => s.requests = reader.varint()? as u32,
            (6, WIRE_VARINT) => s.requests_history = reader.varint()? as u32,
            (7, WIRE_VARINT) => s.heartbeat = reader.varint()? != 0,
            (8, WIRE_VARINT) => s.return_max = reader.varint()? as u32,
            (9, WIRE_VARINT) => s.return_window = reader.varint()? as u32,
            _ => reader.skip(wire)?,
        }
    }
    Ok(s)
}

fn decode_history(bytes: &[u8]) -> Result<HistoryPayload, ProtocolError> {
    let mut h = HistoryPayload::default();
    let mut reader = FieldReader::new(bytes);
    while let Some((field, wire)) = reader.next_tag()? {
        match (field, wire) {
            (1, WIRE_VARINT) => h.history_messages = reader.varint()? as u32,
            (2, WIRE_VARINT) => h.window = reader.varint()? as u32,
            (3, WIRE_VARINT) => h.last_request = reader.varint()? as u32,
            _ => reader.skip(wire)?,
        }
    }
    Ok(h)
}

fn decode_heartbeat(bytes: &[u8]) -> Result<HeartbeatPayload, ProtocolError> {
    let mut h = HeartbeatPayload::default();
    let mut reader = FieldReader::new(bytes);
    while let Some((field, wire)) = reader.next_tag()? {
        match (field, wire) {
            (1, WIRE_VARINT) => h.period = reader.varint()? as u32,
            (2, WIRE_VARINT) => h.secondary = reader.varint()? as u32,
            _ => reader.skip(wire)?,
        }
    }
    Ok(h)
}

// ----------------------------------------------------------------------------
// Protobuf Primitives
// ----------------------------------------------------------------------------

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_LEN: u8 = 2;
const WIRE_FIXED32: u8 = 5;

fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn put_tag(buf: &mut Vec<u8>, field: u32, wire: u8) {
    put_varint(buf, ((field as u64) << 3) | wire as u64);
}

/// Varint field; zero values are omitted per proto3 defaults
fn put_varint_field(buf: &mut Vec<u8>, field: u32, value: u64) {
    if value == 0 {
        return;
    }
    put_tag(buf, field, WIRE_VARINT);
    put_varint(buf, value);
}

fn put_bytes_field(buf: &mut Vec<u8>, field: u32, bytes: &[u8]) {
    put_tag(buf, field, WIRE_LEN);
    put_varint(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

struct FieldReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> FieldReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn next_tag(&mut self) -> Result<Option<(u32, u8)>, ProtocolError> {
        if self.offset >= self.bytes.len() {
            return Ok(None);
        }
        let key = self.varint()?;
        Ok(Some(((key >> 3) as u32, (key & 0x7) as u8)))
    }

    fn varint(&mut self) -> Result<u64, ProtocolError> {
        let mut value: u64 = 0;
        for shift in 0..10 {
            let byte = *self
                .bytes
                .get(self.offset)
                .ok_or(ProtocolError::Truncated { what: "varint" })?;
            self.offset += 1;
            value |= ((byte & 0x7F) as u64) << (shift * 7);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(ProtocolError::InvalidVarint)
    }

    fn len_delimited(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.varint()? as usize;
        // The declared length is peer-controlled; check against the bytes
        // actually present before any arithmetic can overflow.
        if len > self.bytes.len() - self.offset {
            return Err(ProtocolError::Truncated {
                what: "length-delimited field",
            });
        }
        let end = self.offset + len;
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn skip(&mut self, wire: u8) -> Result<(), ProtocolError> {
        match wire {
            WIRE_VARINT => {
                self.varint()?;
            }
            WIRE_LEN => {
                self.len_delimited()?;
            }
            WIRE_FIXED64 => self.advance(8)?,
            WIRE_FIXED32 => self.advance(4)?,
            other => return Err(ProtocolError::UnsupportedWireType(other)),
        }
        Ok(())
    }

    fn advance(&mut self, len: usize) -> Result<(), ProtocolError> {
        if self.offset + len > self.bytes.len() {
            return Err(ProtocolError::Truncated { what: "fixed field" });
        }
        self.offset += len;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
