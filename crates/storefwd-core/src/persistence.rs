//! Crash-consistent persistence of the history ring and cursor map
//!
//! Two files under `history/`, each replaced atomically with a
//! temp-file-plus-rename discipline:
//!
//! Ring file `history/sf`:
//!
//! ```text
//! version  : u8  = 1
//! count    : u32 little-endian
//! records  : count x fixed 261-byte record
//! ```
//!
//! Each record is `time(u32) to(u32) from(u32) id(u32) channel(u8)
//! reply_id(u32) emoji(u8) payload_size(u16) payload(237 bytes)`, multi-byte
//! fields little-endian, the payload slot always 237 bytes on disk.
//!
//! Cursor file `history/sf_users`:
//!
//! ```text
//! entries_count : u32
//! entries       : entries_count x { node_id: u32, index: u32 }
//! ```
//!
//! A ring file that fails the version check or comes up short yields an
//! empty ring, not an error; a corrupt cursor file alone never invalidates
//! the ring.

use std::io::{Read, Write};

use hashbrown::HashMap;
use tracing::{debug, info, warn};

use crate::errors::StorageError;
use crate::history::{History, PacketRecord};
use crate::packet::MAX_PAYLOAD_LEN;
use crate::storage::Storage;
use crate::types::NodeId;

// ----------------------------------------------------------------------------
// Layout Constants
// ----------------------------------------------------------------------------

pub const HISTORY_DIR: &str = "history";
pub const RING_FILE: &str = "history/sf";
pub const RING_TMP: &str = "history/sf.tmp";
pub const CURSOR_FILE: &str = "history/sf_users";
pub const CURSOR_TMP: &str = "history/sf_users.tmp";

const FORMAT_VERSION: u8 = 1;
/// On-disk size of one record: 4+4+4+4+1+4+1+2 header bytes + 237 payload
pub const RECORD_DISK_LEN: usize = 24 + MAX_PAYLOAD_LEN;

/// Ring saves happen every this many records during normal ingest
pub const SAVE_EVERY_RECORDS: u32 = 10;

// ----------------------------------------------------------------------------
// Persistence
// ----------------------------------------------------------------------------

/// Serializer between a [`History`] and the storage seam
pub struct Persistence {
    storage: Box<dyn Storage>,
}

impl Persistence {
    pub fn new(storage: Box<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Atomically replace both files from the history's current state
    ///
    /// In-memory state is never rolled back on failure; the next save
    /// attempt simply retries.
    pub fn save(&mut self, history: &History) -> Result<(), StorageError> {
        self.storage.mkdir(HISTORY_DIR)?;

        let ring = encode_ring(history.records());
        self.write_atomic(RING_TMP, RING_FILE, &ring)?;

        let cursors = encode_cursors(history.cursors());
        self.write_atomic(CURSOR_TMP, CURSOR_FILE, &cursors)?;

        debug!(
            "S&F - Saved {} records and {} cursors ({} bytes)",
            history.count(),
            history.client_count(),
            ring.len() + cursors.len()
        );
        Ok(())
    }

    fn write_atomic(&mut self, tmp: &str, dst: &str, bytes: &[u8]) -> Result<(), StorageError> {
        {
            let mut writer = self.storage.open_write(tmp)?;
            writer.write_all(bytes)?;
            writer.flush()?;
        }
        self.storage.rename(tmp, dst)?;
        Ok(())
    }

    /// Load both files into `history`
    ///
    /// Missing or corrupt files fall back to empty state; cursors beyond the
    /// loaded count are reset to 0 by [`History::restore`]. Only genuine I/O
    /// errors surface to the caller.
    pub fn load(&mut self, history: &mut History) -> Result<(), StorageError> {
        let records = if self.storage.exists(RING_FILE) {
            let bytes = self.read_all(RING_FILE)?;
            match decode_ring(&bytes) {
                Ok(records) => {
                    info!("S&F - Loaded {} records from storage", records.len());
                    for (index, record) in records.iter().take(3).enumerate() {
                        log_record_preview(index, record);
                    }
                    records
                }
                Err(err) => {
                    warn!("S&F - History file unusable ({err}), starting with empty ring");
                    Vec::new()
                }
            }
        } else {
            info!("S&F - No history file found, starting with empty history");
            Vec::new()
        };

        let cursors = if self.storage.exists(CURSOR_FILE) {
            let bytes = self.read_all(CURSOR_FILE)?;
            match decode_cursors(&bytes) {
                Ok(cursors) => cursors,
                Err(err) => {
                    warn!("S&F - Cursor file unusable ({err}), resetting cursors");
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        history.restore(records, cursors);
        Ok(())
    }

    fn read_all(&mut self, path: &str) -> Result<Vec<u8>, StorageError> {
        let mut reader = self.storage.open_read(path)?;
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

fn log_record_preview(index: usize, record: &PacketRecord) {
    let printable = record
        .payload
        .iter()
        .all(|&b| (32..=126).contains(&b) || matches!(b, b'\n' | b'\r' | b'\t'));

    if printable {
        debug!(
            "S&F - Record {index}: {} -> {} time={} text {:?}",
            record.from,
            record.to,
            record.time,
            String::from_utf8_lossy(&record.payload)
        );
    } else {
        let head = &record.payload[..record.payload.len().min(16)];
        debug!(
            "S&F - Record {index}: {} -> {} time={} binary {}{}",
            record.from,
            record.to,
            record.time,
            hex::encode(head),
            if record.payload.len() > 16 { "..." } else { "" }
        );
    }
}

// ----------------------------------------------------------------------------
// Ring Codec
// ----------------------------------------------------------------------------

fn encode_ring(records: &[PacketRecord]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 + records.len() * RECORD_DISK_LEN);
    buf.push(FORMAT_VERSION);
    buf.extend_from_slice(&(records.len() as u32).to_le_bytes());
    for record in records {
        encode_record(&mut buf, record);
    }
    buf
}

fn encode_record(buf: &mut Vec<u8>, record: &PacketRecord) {
    buf.extend_from_slice(&record.time.to_le_bytes());
    buf.extend_from_slice(&record.to.raw().to_le_bytes());
    buf.extend_from_slice(&record.from.raw().to_le_bytes());
    buf.extend_from_slice(&record.id.to_le_bytes());
    buf.push(record.channel);
    buf.extend_from_slice(&record.reply_id.to_le_bytes());
    buf.push(record.emoji as u8);
    buf.extend_from_slice(&record.payload_size().to_le_bytes());

    buf.extend_from_slice(&record.payload);
    buf.resize(buf.len() + (MAX_PAYLOAD_LEN - record.payload.len()), 0);
}

fn decode_ring(bytes: &[u8]) -> Result<Vec<PacketRecord>, StorageError> {
    let mut cursor = Cursor::new(bytes);

    let version = cursor.u8()?;
    if version != FORMAT_VERSION {
        return Err(StorageError::BadVersion { found: version });
    }

    let count = cursor.u32()? as usize;
    let mut records = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        records.push(decode_record(&mut cursor)?);
    }
    Ok(records)
}

fn decode_record(cursor: &mut Cursor<'_>) -> Result<PacketRecord, StorageError> {
    let time = cursor.u32()?;
    let to = NodeId::new(cursor.u32()?);
    let from = NodeId::new(cursor.u32()?);
    let id = cursor.u32()?;
    let channel = cursor.u8()?;
    let reply_id = cursor.u32()?;
    let emoji = cursor.u8()? != 0;
    let payload_size = cursor.u16()? as usize;
    let slot = cursor.take(MAX_PAYLOAD_LEN)?;

    Ok(PacketRecord {
        time,
        from,
        to,
        id,
        channel,
        reply_id,
        emoji,
        payload: slot[..payload_size.min(MAX_PAYLOAD_LEN)].to_vec(),
    })
}

// ----------------------------------------------------------------------------
// Cursor Codec
// ----------------------------------------------------------------------------

fn encode_cursors(cursors: &HashMap<NodeId, u32>) -> Vec<u8> {
    // Sorted for a deterministic file image
    let mut entries: Vec<(NodeId, u32)> = cursors.iter().map(|(n, i)| (*n, *i)).collect();
    entries.sort_by_key(|(n, _)| n.raw());

    let mut buf = Vec::with_capacity(4 + entries.len() * 8);
    buf.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for (node, index) in entries {
        buf.extend_from_slice(&node.raw().to_le_bytes());
        buf.extend_from_slice(&index.to_le_bytes());
    }
    buf
}

fn decode_cursors(bytes: &[u8]) -> Result<HashMap<NodeId, u32>, StorageError> {
    let mut cursor = Cursor::new(bytes);
    let count = cursor.u32()? as usize;

    let mut cursors = HashMap::with_capacity(count.min(1024));
    for _ in 0..count {
        let node = NodeId::new(cursor.u32()?);
        let index = cursor.u32()?;
        cursors.insert(node, index);
    }
    Ok(cursors)
}

// ----------------------------------------------------------------------------
// Byte Cursor
// ----------------------------------------------------------------------------

struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], StorageError> {
        let end = self.offset + len;
        if end > self.bytes.len() {
            return Err(StorageError::ShortRead {
                expected: end,
                actual: self.bytes.len(),
            });
        }
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, StorageError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, StorageError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, StorageError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
