//! Bounded packet history ring
//!
//! Records storable mesh traffic in a fixed-capacity ring, suppresses
//! duplicates by content, and tracks one replay cursor per client. When the
//! ring fills it wraps: the logical count resets to zero and every client
//! cursor is reset with it, accepting duplicate replays as the cost of
//! bounded storage.

use hashbrown::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::packet::{MeshPacket, PayloadVariant, MAX_PAYLOAD_LEN};
use crate::types::NodeId;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Upper bound on the seen-ID cache before pruning kicks in
pub const SEEN_IDS_MAX: usize = 1000;

/// Fraction of the seen-ID cache retained by a prune (largest IDs win)
const SEEN_IDS_KEEP_NUMERATOR: usize = 1;
const SEEN_IDS_KEEP_DENOMINATOR: usize = 4;

// ----------------------------------------------------------------------------
// Packet Record
// ----------------------------------------------------------------------------

/// One slot in the history ring; immutable once recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketRecord {
    /// Seconds since epoch at record time (0 if the clock was unsynchronized)
    pub time: u32,
    pub from: NodeId,
    pub to: NodeId,
    pub id: u32,
    pub channel: u8,
    pub reply_id: u32,
    pub emoji: bool,
    /// At most [`MAX_PAYLOAD_LEN`] bytes; ciphertext for encrypted packets
    pub payload: Vec<u8>,
}

impl PacketRecord {
    /// Build a record from a received packet, truncating oversize payloads
    ///
    /// Encrypted packets are kept with minimal metadata and the raw
    /// ciphertext in the payload slot so they still replay.
    pub fn from_packet(packet: &MeshPacket, time: u32) -> Self {
        let (payload_src, reply_id, emoji) = match &packet.payload {
            PayloadVariant::Decoded(d) => (&d.payload, d.reply_id, d.emoji),
            PayloadVariant::Encrypted(bytes) => (bytes, 0, false),
        };

        let mut payload = payload_src.clone();
        if payload.len() > MAX_PAYLOAD_LEN {
            warn!(
                "S&F - Payload too large, truncating: {} bytes",
                payload.len()
            );
            payload.truncate(MAX_PAYLOAD_LEN);
        }

        Self {
            time,
            from: packet.from,
            to: packet.to,
            id: packet.id,
            channel: packet.channel.index(),
            reply_id,
            emoji,
            payload,
        }
    }

    pub fn payload_size(&self) -> u16 {
        self.payload.len() as u16
    }
}

/// What a call to [`History::record`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordOutcome {
    /// Ring index the record landed at
    pub index: u32,
    /// Whether the ring wrapped (and all cursors were reset) first
    pub wrapped: bool,
}

// ----------------------------------------------------------------------------
// History Store
// ----------------------------------------------------------------------------

/// Fixed-capacity ring of recorded packets with per-client replay cursors
#[derive(Debug)]
pub struct History {
    records: Vec<PacketRecord>,
    records_max: u32,
    /// Non-authoritative cache of recently recorded packet IDs; dedup
    /// correctness rests on content comparison against the ring
    seen_ids: HashSet<u32>,
    max_seen_id: u32,
    /// dest node -> next ring index to consider for replay
    cursors: HashMap<NodeId, u32>,
}

impl History {
    pub fn new(records_max: u32) -> Self {
        Self {
            records: Vec::new(),
            records_max,
            seen_ids: HashSet::new(),
            max_seen_id: 0,
            cursors: HashMap::new(),
        }
    }

    // ------------------------------------------------------------------
    // Store predicate
    // ------------------------------------------------------------------

    /// Whether `packet` belongs in the history
    ///
    /// Decoded packets qualify when they carry a non-empty text payload
    /// that is not an `SF` command and not a content duplicate. Encrypted
    /// packets qualify on non-empty ciphertext and content alone.
    pub fn should_store(&self, packet: &MeshPacket) -> bool {
        match &packet.payload {
            PayloadVariant::Decoded(_) => match packet.text_payload() {
                Some(text) => !is_command_payload(text) && !self.is_duplicate(packet),
                None => false,
            },
            PayloadVariant::Encrypted(bytes) => !bytes.is_empty() && !self.is_duplicate(packet),
        }
    }

    /// Content-based duplicate check against the current ring
    ///
    /// Compares `(from, to, payload length, payload bytes)`; packet IDs are
    /// deliberately ignored because a re-flooded message arrives with a
    /// fresh ID.
    pub fn is_duplicate(&self, packet: &MeshPacket) -> bool {
        let content: &[u8] = match &packet.payload {
            PayloadVariant::Decoded(d) => &d.payload,
            PayloadVariant::Encrypted(bytes) => bytes,
        };

        self.records.iter().any(|r| {
            r.from == packet.from
                && r.to == packet.to
                && r.payload.len() == content.len()
                && r.payload == content
        })
    }

    // ------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------

    /// Record a packet, wrapping the ring if it is full
    ///
    /// A wrap resets the logical count to zero and every client cursor
    /// with it, atomically with respect to this call.
    pub fn record(&mut self, packet: &MeshPacket, time: u32) -> RecordOutcome {
        let wrapped = self.records.len() as u32 >= self.records_max;
        if wrapped {
            debug!(
                "S&F - History buffer full, wrapping around (total={}, max={})",
                self.records.len(),
                self.records_max
            );
            self.records.clear();
            for cursor in self.cursors.values_mut() {
                *cursor = 0;
            }
        }

        self.note_seen(packet.id);
        self.records.push(PacketRecord::from_packet(packet, time));

        RecordOutcome {
            index: (self.records.len() - 1) as u32,
            wrapped,
        }
    }

    fn note_seen(&mut self, id: u32) {
        self.seen_ids.insert(id);
        self.max_seen_id = self.max_seen_id.max(id);

        if self.seen_ids.len() > SEEN_IDS_MAX {
            // Memory bound only: keep the numerically largest quarter (IDs
            // trend upward in time), then make sure the maximum survives.
            let mut ids: Vec<u32> = self.seen_ids.drain().collect();
            ids.sort_unstable();
            let keep = ids.len() * SEEN_IDS_KEEP_NUMERATOR / SEEN_IDS_KEEP_DENOMINATOR;
            self.seen_ids.extend(ids.iter().rev().take(keep));
            self.seen_ids.insert(self.max_seen_id);
            debug!("S&F - Pruned seen-ID cache to {} entries", self.seen_ids.len());
        }
    }

    /// Whether a packet ID is in the seen cache (advisory only)
    pub fn has_seen(&self, id: u32) -> bool {
        self.seen_ids.contains(&id)
    }

    // ------------------------------------------------------------------
    // Replay queries
    // ------------------------------------------------------------------

    /// Records eligible for replay to `dest`, in storage order
    ///
    /// Starts at `dest`'s cursor and yields `(ring index, record)` for every
    /// record newer than `since_time` that is not from `dest` itself and is
    /// either addressed to `dest` or broadcast.
    pub fn messages_for(
        &self,
        dest: NodeId,
        since_time: u32,
    ) -> impl Iterator<Item = (u32, &PacketRecord)> + '_ {
        let start = self.cursor(dest) as usize;
        self.records
            .iter()
            .enumerate()
            .skip(start)
            .filter(move |(_, r)| {
                r.time > since_time
                    && r.from != dest
                    && (r.to == dest || r.to == NodeId::BROADCAST)
            })
            .map(|(i, r)| (i as u32, r))
    }

    /// Number of records [`Self::messages_for`] would yield
    pub fn num_available(&self, dest: NodeId, since_time: u32) -> u32 {
        self.messages_for(dest, since_time).count() as u32
    }

    // ------------------------------------------------------------------
    // Cursors
    // ------------------------------------------------------------------

    /// Replay cursor for `dest` (0 when no entry exists)
    pub fn cursor(&self, dest: NodeId) -> u32 {
        self.cursors.get(&dest).copied().unwrap_or(0)
    }

    /// Move `dest`'s cursor; an index beyond the current count is rejected
    pub fn update_cursor(&mut self, dest: NodeId, index: u32) -> bool {
        if index > self.count() {
            debug!(
                "S&F - Rejecting cursor {} for {} (count {})",
                index,
                dest,
                self.count()
            );
            return false;
        }
        self.cursors.insert(dest, index);
        true
    }

    /// Create a cursor entry for `dest` if absent; true when newly created
    pub fn ensure_cursor(&mut self, dest: NodeId) -> bool {
        if self.cursors.contains_key(&dest) {
            return false;
        }
        self.cursors.insert(dest, 0);
        true
    }

    /// Zero an existing cursor; false when `dest` had none to reset
    pub fn reset_cursor(&mut self, dest: NodeId) -> bool {
        match self.cursors.get_mut(&dest) {
            Some(cursor) => {
                *cursor = 0;
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Serializer surface (used by persistence only)
    // ------------------------------------------------------------------

    /// The stored prefix `[0..count)` in storage order
    pub fn records(&self) -> &[PacketRecord] {
        &self.records
    }

    /// The cursor map
    pub fn cursors(&self) -> &HashMap<NodeId, u32> {
        &self.cursors
    }

    /// Replace ring and cursors from loaded state
    ///
    /// Cursors beyond the loaded count are reset to 0; loaded records beyond
    /// capacity are dropped. The seen cache is rebuilt from the ring.
    pub fn restore(&mut self, mut records: Vec<PacketRecord>, cursors: HashMap<NodeId, u32>) {
        records.truncate(self.records_max as usize);
        self.records = records;
        let count = self.count();

        self.seen_ids.clear();
        self.max_seen_id = 0;
        let ids: Vec<u32> = self.records.iter().map(|r| r.id).collect();
        for id in ids {
            self.note_seen(id);
        }

        self.cursors = cursors
            .into_iter()
            .map(|(node, index)| {
                if index > count {
                    warn!(
                        "S&F - Client {} had invalid cursor {} (reset to 0)",
                        node, index
                    );
                    (node, 0)
                } else {
                    (node, index)
                }
            })
            .collect();
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn count(&self) -> u32 {
        self.records.len() as u32
    }

    pub fn records_max(&self) -> u32 {
        self.records_max
    }

    pub fn client_count(&self) -> usize {
        self.cursors.len()
    }

    /// Empty the ring, the seen cache, and all cursors
    pub fn clear(&mut self) {
        self.records.clear();
        self.seen_ids.clear();
        self.max_seen_id = 0;
        self.cursors.clear();
    }
}

/// True for payloads that start the `SF` command word
///
/// The command word is `SF` terminated by end-of-payload, a space, or NUL;
/// `SFX...` is ordinary text.
pub fn is_command_payload(payload: &[u8]) -> bool {
    payload.len() >= 2
        && payload[0] == b'S'
        && payload[1] == b'F'
        && (payload.len() == 2 || payload[2] == b' ' || payload[2] == 0)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
