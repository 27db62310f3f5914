//! Configuration for the Store & Forward module
//!
//! Mirrors the module options a node operator can set, with defaults chosen
//! for a typical router node carrying roughly 1 MiB of auxiliary memory.

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Module Configuration
// ----------------------------------------------------------------------------

/// Operator-facing configuration of the Store & Forward module
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreForwardConfig {
    /// Master switch for the whole module
    pub enabled: bool,
    /// Request the server role (subject to the memory budget)
    pub is_server: bool,
    /// Ring capacity override; 0 sizes the ring from auxiliary memory
    pub records: u32,
    /// Maximum replays delivered in one session
    pub history_return_max: u32,
    /// Default history window in minutes
    pub history_return_window: u32,
    /// Enable the periodic server heartbeat broadcast
    pub heartbeat: bool,
}

impl Default for StoreForwardConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            is_server: false,
            records: 0, // auto-size from auxiliary memory
            history_return_max: 25,
            history_return_window: 240, // 4 hours
            heartbeat: false,
        }
    }
}

impl StoreForwardConfig {
    /// Configuration for a node acting as an S&F server
    pub fn server() -> Self {
        Self {
            enabled: true,
            is_server: true,
            heartbeat: true,
            ..Self::default()
        }
    }

    /// Small limits suited to deterministic tests
    pub fn testing() -> Self {
        Self {
            enabled: true,
            is_server: true,
            records: 4,
            history_return_max: 3,
            history_return_window: 60,
            heartbeat: false,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
