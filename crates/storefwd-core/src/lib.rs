//! Store & Forward engine for LoRa mesh nodes
//!
//! An opportunistic message-retention and replay service: a node configured
//! as an S&F *server* passively records mesh traffic in a bounded ring,
//! advertises its availability, and replays a per-client-tracked window of
//! history on request. A *client* discovers servers through heartbeats,
//! requests history or statistics, and feeds replayed messages back into
//! its local delivery pipeline.
//!
//! ## Architecture Overview
//!
//! The crate is a headless engine with no knowledge of the radio, the
//! filesystem, or the user interface. It consumes four seams as
//! construction-time dependencies:
//!
//! - [`transport::Transport`] — packet allocation, transmission, airtime
//!   gating, channel classification
//! - [`types::Clock`] — monotonic milliseconds plus optional wall time
//! - [`storage::Storage`] — block storage for crash-safe persistence
//! - [`nodedb::NodeDirectory`] — display names, diagnostics only
//!
//! Around those seams sit the engine's own components:
//!
//! - [`history`] — the bounded packet ring, content dedup, replay cursors
//! - [`persistence`] — bit-exact, crash-consistent save/load of ring and
//!   cursors
//! - [`proto`] / [`messenger`] — the wire envelope and outbound packet
//!   policy
//! - [`roles`] — the server and client engines plus the role factory
//! - [`scheduler`] — the cooperative tick driving `run_once`
//!
//! Everything runs single-threaded; handlers never block and long waits
//! are expressed as the delay returned by `run_once`.
//!
//! ## Usage
//!
//! ```rust
//! use storefwd_core::config::StoreForwardConfig;
//! use storefwd_core::nodedb::EmptyDirectory;
//! use storefwd_core::roles::build_role;
//! use storefwd_core::scheduler::Scheduler;
//! use storefwd_core::storage::MemoryStorage;
//! use storefwd_core::testing::{ManualClock, MockTransport};
//! use storefwd_core::types::NodeId;
//!
//! let transport = MockTransport::new(NodeId::new(0x10));
//! let role = build_role(
//!     StoreForwardConfig::server(),
//!     2 * 1024 * 1024,
//!     Box::new(transport),
//!     Box::new(ManualClock::new(0, 0)),
//!     Box::new(EmptyDirectory),
//!     Box::new(MemoryStorage::new()),
//! );
//! assert!(role.is_server());
//!
//! let mut scheduler = Scheduler::new(role);
//! scheduler.tick(0);
//! ```

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod errors;
pub mod history;
pub mod messenger;
pub mod nodedb;
pub mod packet;
pub mod persistence;
pub mod proto;
pub mod roles;
pub mod scheduler;
pub mod storage;
pub mod testing;
pub mod transport;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::StoreForwardConfig;
pub use errors::{Result, StoreForwardError};
pub use history::{History, PacketRecord};
pub use packet::{MeshPacket, PayloadVariant, PortNum, Priority, MAX_PAYLOAD_LEN};
pub use roles::{build_role, ClientRole, Role, ServerRole};
pub use scheduler::Scheduler;
pub use types::{ChannelId, Clock, NodeId};
