//! Replica Nodes
//!
//! Identity and health of the repository stores behind the front end.

use std::fmt;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};

/// One replica node: the storage location of a full repository copy
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaNode {
    path: PathBuf,
}

impl ReplicaNode {
    /// Create a node rooted at the given repository directory
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Repository directory of this node
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stable identifier, also written into out-of-sync markers
    pub fn id(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }
}

impl fmt::Display for ReplicaNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Health of a node as derived from its persisted marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeHealth {
    /// No marker: the node is assumed current
    InSync,
    /// The node missed a write and should heal from `healthy_peer`
    OutOfSync {
        healthy_peer: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        since: Option<chrono::DateTime<chrono::Utc>>,
    },
}

impl NodeHealth {
    /// Whether the node needs healing
    pub fn is_out_of_sync(&self) -> bool {
        matches!(self, NodeHealth::OutOfSync { .. })
    }
}

impl fmt::Display for NodeHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeHealth::InSync => write!(f, "IN_SYNC"),
            NodeHealth::OutOfSync { healthy_peer, .. } => {
                write!(f, "OUT_OF_SYNC (heal from {})", healthy_peer)
            }
        }
    }
}

/// Health report for one node, as served by the admin API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeReport {
    pub node: ReplicaNode,
    #[serde(flatten)]
    pub health: NodeHealth,
}
