//! Core types for the Store & Forward engine
//!
//! This module defines the fundamental identifiers used throughout the
//! subsystem, using newtype patterns for semantic validation and type safety,
//! plus the time seam the engine consumes.

use core::fmt;
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Node Identifier
// ----------------------------------------------------------------------------

/// Unique identifier for a mesh node (32-bit node number)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(u32);

impl NodeId {
    /// Create a new NodeId from a raw node number
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw node number
    pub const fn raw(&self) -> u32 {
        self.0
    }

    /// Special broadcast destination (all ones)
    pub const BROADCAST: Self = Self(0xFFFF_FFFF);

    /// Check whether this is the broadcast sentinel
    pub const fn is_broadcast(&self) -> bool {
        self.0 == Self::BROADCAST.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "!{:08x}", self.0)
    }
}

impl From<u32> for NodeId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

// ----------------------------------------------------------------------------
// Channel Identifier
// ----------------------------------------------------------------------------

/// Index of the radio channel a packet was heard on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ChannelId(u8);

impl ChannelId {
    pub const fn new(index: u8) -> Self {
        Self(index)
    }

    pub const fn index(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Clock Seam
// ----------------------------------------------------------------------------

/// Trait for providing time to the engine
///
/// `now_ms` is monotonic and only used for scheduling and timeouts.
/// `unix_time` may return 0 when the node has no synchronized wall clock;
/// callers treat 0 as "time floor already satisfied".
pub trait Clock {
    /// Monotonic milliseconds since an arbitrary origin
    fn now_ms(&self) -> u64;

    /// Seconds since the Unix epoch, or 0 if unsynchronized
    fn unix_time(&self) -> u32;
}

/// Standard library implementation of the Clock seam
#[derive(Debug)]
pub struct SystemClock {
    origin: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn unix_time(&self) -> u32 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
