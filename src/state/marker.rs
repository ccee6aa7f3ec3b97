//! Out-of-Sync Markers
//!
//! A node that missed a replicated write gets a small marker file inside its
//! repository directory naming the peer it should heal from. The marker is
//! the only record of divergence: no marker means the node is assumed current.

use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;

use super::node::{NodeHealth, NodeReport, ReplicaNode};
use crate::error::{Error, Result};

/// Marker file name, relative to the node's repository directory
pub const MARKER_FILE: &str = "outofsync";

/// Reads and writes out-of-sync markers on node storage
#[derive(Debug, Clone, Default)]
pub struct MarkerStore;

impl MarkerStore {
    pub fn new() -> Self {
        Self
    }

    /// Location of the marker for a node
    pub fn marker_path(&self, node: &ReplicaNode) -> PathBuf {
        node.path().join(MARKER_FILE)
    }

    /// Persist a marker naming `healthy_peer`, replacing any previous one
    pub async fn try_mark(&self, node: &ReplicaNode, healthy_peer: &ReplicaNode) -> Result<()> {
        fs::write(self.marker_path(node), healthy_peer.id())
            .await
            .map_err(|e| marker_error(node, e))
    }

    /// Read the healthy peer recorded for a node, `None` when unmarked
    pub async fn try_read(&self, node: &ReplicaNode) -> Result<Option<String>> {
        match fs::read_to_string(self.marker_path(node)).await {
            Ok(content) => {
                let peer = content.trim();
                if peer.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(peer.to_string()))
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(marker_error(node, e)),
        }
    }

    /// Remove a node's marker; removing an absent marker succeeds
    pub async fn try_clear(&self, node: &ReplicaNode) -> Result<()> {
        match fs::remove_file(self.marker_path(node)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(marker_error(node, e)),
        }
    }

    /// Mark a node out of sync. Failures are logged, never propagated.
    pub async fn mark(&self, node: &ReplicaNode, healthy_peer: &ReplicaNode) -> bool {
        match self.try_mark(node, healthy_peer).await {
            Ok(()) => {
                tracing::warn!(node = %node, healthy_peer = %healthy_peer, "Node marked out of sync");
                true
            }
            Err(e) => {
                tracing::error!("Error creating out-of-sync marker: {}", e);
                false
            }
        }
    }

    /// Healthy peer for a node. Unreadable markers are logged and read as absent.
    pub async fn read(&self, node: &ReplicaNode) -> Option<String> {
        match self.try_read(node).await {
            Ok(peer) => peer,
            Err(e) => {
                tracing::warn!("Ignoring unreadable out-of-sync marker: {}", e);
                None
            }
        }
    }

    /// Clear a node's marker. Failures are logged and returned; the node
    /// stays flagged.
    pub async fn clear(&self, node: &ReplicaNode) -> Result<()> {
        self.try_clear(node).await.inspect_err(|e| {
            tracing::warn!("Failed to remove out-of-sync marker: {}", e);
        })
    }

    /// Current health of a node
    pub async fn health(&self, node: &ReplicaNode) -> NodeHealth {
        match self.read(node).await {
            None => NodeHealth::InSync,
            Some(healthy_peer) => {
                let since = fs::metadata(self.marker_path(node))
                    .await
                    .and_then(|meta| meta.modified())
                    .ok()
                    .map(chrono::DateTime::<chrono::Utc>::from);
                NodeHealth::OutOfSync { healthy_peer, since }
            }
        }
    }

    /// Health of every node, in the given order
    pub async fn snapshot(&self, nodes: &[ReplicaNode]) -> Vec<NodeReport> {
        let mut reports = Vec::with_capacity(nodes.len());
        for node in nodes {
            reports.push(NodeReport {
                node: node.clone(),
                health: self.health(node).await,
            });
        }
        reports
    }
}

fn marker_error(node: &ReplicaNode, e: std::io::Error) -> Error {
    Error::Marker {
        node: node.id(),
        reason: e.to_string(),
    }
}
