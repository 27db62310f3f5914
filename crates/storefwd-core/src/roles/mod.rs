//! Store & Forward roles
//!
//! A node runs exactly one of three roles, chosen once at startup from
//! configuration and the memory budget. The scheduler branches on the
//! variant; there is no dynamic dispatch.

pub mod client;
pub mod server;

use tracing::{info, warn};

pub use client::{ClientRole, ClientState};
pub use server::{PendingNotice, ServerRole, ServerState};

use crate::config::StoreForwardConfig;
use crate::history::History;
use crate::messenger::Messenger;
use crate::nodedb::NodeDirectory;
use crate::packet::MeshPacket;
use crate::persistence::{Persistence, RECORD_DISK_LEN};
use crate::scheduler::IDLE_TICK_MS;
use crate::storage::Storage;
use crate::transport::Transport;
use crate::types::Clock;

// ----------------------------------------------------------------------------
// Role Sum Type
// ----------------------------------------------------------------------------

/// The role this node plays in the Store & Forward protocol
pub enum Role {
    /// Module disabled; nothing runs
    Inactive,
    Client(ClientRole),
    Server(ServerRole),
}

impl Role {
    /// Forward one received packet to the active role
    pub fn on_receive(&mut self, packet: &MeshPacket) {
        match self {
            Role::Inactive => {}
            Role::Client(client) => client.on_receive(packet),
            Role::Server(server) => server.on_receive(packet),
        }
    }

    /// One cooperative tick; returns the delay until the next one
    pub fn run_once(&mut self) -> u64 {
        match self {
            Role::Inactive => IDLE_TICK_MS,
            Role::Client(client) => client.run_once(),
            Role::Server(server) => server.run_once(),
        }
    }

    /// Next locally-deliverable stored packet (servers only)
    pub fn for_phone(&mut self) -> Option<MeshPacket> {
        match self {
            Role::Server(server) => server.for_phone(),
            _ => None,
        }
    }

    /// Orderly shutdown: flush persistent state
    pub fn shutdown(&mut self) {
        match self {
            Role::Inactive => {}
            Role::Client(client) => client.shutdown(),
            Role::Server(server) => server.shutdown(),
        }
    }

    pub fn is_server(&self) -> bool {
        matches!(self, Role::Server(_))
    }

    pub fn is_client(&self) -> bool {
        matches!(self, Role::Client(_))
    }
}

// ----------------------------------------------------------------------------
// Role Factory
// ----------------------------------------------------------------------------

/// Auxiliary memory a server role needs before it will allocate a ring
pub const MIN_SERVER_MEMORY_BYTES: usize = 1024 * 1024;

/// Ring capacity when not configured: three quarters of auxiliary memory
fn auto_records(aux_memory_bytes: usize) -> u32 {
    (aux_memory_bytes * 3 / 4 / RECORD_DISK_LEN) as u32
}

/// Build the role this node will run
///
/// A server request without enough auxiliary memory demotes to client with
/// a warning; it never fails startup.
pub fn build_role(
    config: StoreForwardConfig,
    aux_memory_bytes: usize,
    transport: Box<dyn Transport>,
    clock: Box<dyn Clock>,
    nodes: Box<dyn NodeDirectory>,
    storage: Box<dyn Storage>,
) -> Role {
    if !config.enabled {
        info!("S&F - Module disabled");
        return Role::Inactive;
    }

    let messenger = Messenger::new(transport);

    if config.is_server {
        if aux_memory_bytes >= MIN_SERVER_MEMORY_BYTES {
            let records = if config.records > 0 {
                config.records
            } else {
                auto_records(aux_memory_bytes)
            };

            let mut history = History::new(records);
            let mut persist = Persistence::new(storage);
            if let Err(err) = persist.load(&mut history) {
                warn!("S&F - Could not load history from storage: {err}");
            }

            return Role::Server(ServerRole::new(
                config, history, persist, messenger, clock, nodes,
            ));
        }
        warn!(
            "S&F - Not enough auxiliary memory for a server ({} < {} bytes), demoting to client",
            aux_memory_bytes, MIN_SERVER_MEMORY_BYTES
        );
    }

    Role::Client(ClientRole::new(config, messenger, clock, storage))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
