//! Node directory seam
//!
//! Name lookups are purely for log readability and never influence the
//! protocol.

use crate::types::NodeId;

/// Display names of a known mesh node
#[derive(Debug, Clone, Default)]
pub struct NodeInfo {
    pub long_name: String,
    pub short_name: String,
}

/// Node identity directory consumed for diagnostics
pub trait NodeDirectory {
    fn lookup(&self, node: NodeId) -> Option<NodeInfo>;
}

/// Best display label for a node: long name, short name, or "Unknown"
pub fn node_label(directory: &dyn NodeDirectory, node: NodeId) -> String {
    match directory.lookup(node) {
        Some(info) if !info.long_name.is_empty() => info.long_name,
        Some(info) if !info.short_name.is_empty() => info.short_name,
        _ => "Unknown".to_string(),
    }
}

/// Directory that knows nothing; every lookup yields "Unknown"
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyDirectory;

impl NodeDirectory for EmptyDirectory {
    fn lookup(&self, _node: NodeId) -> Option<NodeInfo> {
        None
    }
}
