//! Resync Procedure
//!
//! Heals a node that missed a replicated write by pulling refs from the peer
//! named in its out-of-sync marker:
//!
//! ```text
//! read marker -> [compare refs] -> register remote -> fetch -> remove remote -> clear marker
//! ```
//!
//! Every step shares one time budget. Any failure stops the procedure and is
//! only logged; the marker stays in place so the next trigger retries.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::executor::{Invocation, RepositoryExecutor};
use crate::state::{MarkerStore, ReplicaNode};
use crate::error::{Error, Result};

/// Name of the temporary remote registered on the healing node
pub const SYNC_REMOTE: &str = "sync";

/// Refspecs that overwrite the node's branches and tags with the peer's
const SYNC_REFSPECS: [&str; 2] = ["+refs/heads/*:refs/heads/*", "+refs/tags/*:refs/tags/*"];

/// Step at which a resync stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResyncStage {
    RegisterRemote,
    Fetch,
    RemoveRemote,
    ClearMarker,
}

impl fmt::Display for ResyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResyncStage::RegisterRemote => write!(f, "REGISTER_REMOTE"),
            ResyncStage::Fetch => write!(f, "FETCH"),
            ResyncStage::RemoveRemote => write!(f, "REMOVE_REMOTE"),
            ResyncStage::ClearMarker => write!(f, "CLEAR_MARKER"),
        }
    }
}

/// Result of one resync attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResyncOutcome {
    /// No marker: nothing to do
    NotNeeded,
    /// Refs were fetched from `peer` and the marker cleared
    Healed { peer: String },
    /// Refs already matched `peer`; only the marker was cleared
    AlreadyCurrent { peer: String },
    /// The procedure stopped at `stage`; the marker is still present
    Failed { stage: ResyncStage, error: String },
}

impl ResyncOutcome {
    pub fn is_healed(&self) -> bool {
        matches!(self, ResyncOutcome::Healed { .. } | ResyncOutcome::AlreadyCurrent { .. })
    }
}

/// Outcome for one node of a healing pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResyncReport {
    pub node: ReplicaNode,
    #[serde(flatten)]
    pub outcome: ResyncOutcome,
}

/// Heals out-of-sync nodes from their recorded peers
#[derive(Clone)]
pub struct Resyncer {
    executor: Arc<dyn RepositoryExecutor>,
    markers: MarkerStore,
    timeout: Duration,
    reconcile: bool,
}

impl Resyncer {
    pub fn new(executor: Arc<dyn RepositoryExecutor>, markers: MarkerStore, timeout: Duration) -> Self {
        Self {
            executor,
            markers,
            timeout,
            reconcile: true,
        }
    }

    /// Compare refs with the peer before fetching
    pub fn with_reconcile(mut self, reconcile: bool) -> Self {
        self.reconcile = reconcile;
        self
    }

    /// Healing pass over every node, one at a time
    pub async fn resync_all(&self, nodes: &[ReplicaNode]) -> Vec<ResyncReport> {
        let mut reports = Vec::with_capacity(nodes.len());
        for node in nodes {
            reports.push(ResyncReport {
                node: node.clone(),
                outcome: self.resync(node).await,
            });
        }
        reports
    }

    /// Heal one node if it carries a marker
    pub async fn resync(&self, node: &ReplicaNode) -> ResyncOutcome {
        let Some(peer) = self.markers.read(node).await else {
            return ResyncOutcome::NotNeeded;
        };

        let deadline = Instant::now() + self.timeout;
        tracing::info!(node = %node, peer = %peer, "Resyncing out-of-sync node");

        if self.reconcile {
            match self.refs_match(node, &peer, deadline).await {
                Ok(true) => {
                    tracing::info!(node = %node, "Refs already match peer, clearing marker");
                    return match self.clear_marker(node).await {
                        Ok(()) => ResyncOutcome::AlreadyCurrent { peer },
                        Err(failed) => failed,
                    };
                }
                Ok(false) => {}
                Err(e) => tracing::debug!(node = %node, "Could not compare refs with peer: {}", e),
            }
        }

        if let Err(e) = self.register_remote(node, &peer, deadline).await {
            tracing::warn!("error setting remote for {}, err: {}", node, e);
            return failed(ResyncStage::RegisterRemote, e);
        }

        let fetch = Invocation::new(node.path())
            .args(["fetch", SYNC_REMOTE])
            .args(SYNC_REFSPECS);
        if let Err(e) = self.step(fetch, deadline).await {
            tracing::warn!("failed to fetch from {}, err: {}", peer, e);
            // Leave no stray remote behind; a failure here is harmless since
            // registration tolerates an existing remote.
            if let Err(e) = self.remove_remote(node, deadline).await {
                tracing::debug!("failed to drop remote {} for {}: {}", SYNC_REMOTE, node, e);
            }
            return failed(ResyncStage::Fetch, e);
        }

        if let Err(e) = self.remove_remote(node, deadline).await {
            tracing::warn!("failed to remove remote {} for {}, err: {}", SYNC_REMOTE, node, e);
            return failed(ResyncStage::RemoveRemote, e);
        }

        match self.clear_marker(node).await {
            Ok(()) => {
                tracing::info!(node = %node, peer = %peer, "Node healed");
                ResyncOutcome::Healed { peer }
            }
            Err(failed) => failed,
        }
    }

    async fn register_remote(&self, node: &ReplicaNode, peer: &str, deadline: Instant) -> Result<()> {
        let add = Invocation::new(node.path())
            .args(["remote", "add", SYNC_REMOTE])
            .checked_arg(peer)?;
        let Err(add_err) = self.step(add, deadline).await else {
            return Ok(());
        };

        // A remote left over from an interrupted run is simply repointed.
        let set_url = Invocation::new(node.path())
            .args(["remote", "set-url", SYNC_REMOTE])
            .checked_arg(peer)?;
        self.step(set_url, deadline).await.map_err(|e| {
            tracing::debug!("set-url fallback failed for {}: {}", node, e);
            add_err
        })
    }

    async fn remove_remote(&self, node: &ReplicaNode, deadline: Instant) -> Result<()> {
        let remove = Invocation::new(node.path()).args(["remote", "remove", SYNC_REMOTE]);
        self.step(remove, deadline).await
    }

    async fn clear_marker(&self, node: &ReplicaNode) -> std::result::Result<(), ResyncOutcome> {
        self.markers
            .clear(node)
            .await
            .map_err(|e| failed(ResyncStage::ClearMarker, e))
    }

    /// Whether the node's branches and tags already equal the peer's
    async fn refs_match(&self, node: &ReplicaNode, peer: &str, deadline: Instant) -> Result<bool> {
        let ls_remote = ["ls-remote", "--heads", "--tags"];
        let local = Invocation::new(node.path()).args(ls_remote).arg(".");
        let remote = Invocation::new(node.path()).args(ls_remote).checked_arg(peer)?;

        let local = self.output(local, deadline).await?;
        let remote = self.output(remote, deadline).await?;
        Ok(local == remote)
    }

    async fn step(&self, invocation: Invocation, deadline: Instant) -> Result<()> {
        self.output(invocation, deadline).await.map(|_| ())
    }

    /// Run one executor step within what is left of the shared budget
    async fn output(&self, invocation: Invocation, deadline: Instant) -> Result<Vec<u8>> {
        let description = invocation.description();
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::ExecutorTimeout {
                description,
                timeout: self.timeout,
            });
        }

        let invocation = invocation.timeout(remaining);
        match tokio::time::timeout_at(deadline, self.executor.output(invocation)).await {
            Ok(result) => result,
            Err(_) => Err(Error::ExecutorTimeout {
                description,
                timeout: self.timeout,
            }),
        }
    }
}

fn failed(stage: ResyncStage, error: Error) -> ResyncOutcome {
    ResyncOutcome::Failed {
        stage,
        error: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    use crate::executor::scripted::ScriptedExecutor;
    use crate::state::MARKER_FILE;

    const PEER: &str = "/srv/git/node1.git";

    fn marked_node() -> (TempDir, ReplicaNode) {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(MARKER_FILE), format!("{}\n", PEER)).unwrap();
        let node = ReplicaNode::new(dir.path());
        (dir, node)
    }

    fn resyncer(executor: &Arc<ScriptedExecutor>) -> Resyncer {
        let executor: Arc<dyn RepositoryExecutor> = executor.clone();
        Resyncer::new(executor, MarkerStore::new(), Duration::from_secs(30)).with_reconcile(false)
    }

    fn has_marker(node: &ReplicaNode) -> bool {
        node.path().join(MARKER_FILE).exists()
    }

    #[tokio::test]
    async fn test_unmarked_node_is_noop() {
        let dir = tempdir().unwrap();
        let node = ReplicaNode::new(dir.path());
        let executor = Arc::new(ScriptedExecutor::new());

        assert_eq!(resyncer(&executor).resync(&node).await, ResyncOutcome::NotNeeded);
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_heal_runs_steps_in_order() {
        let (_dir, node) = marked_node();
        let executor = Arc::new(ScriptedExecutor::new());

        let outcome = resyncer(&executor).resync(&node).await;
        assert_eq!(outcome, ResyncOutcome::Healed { peer: PEER.to_string() });
        assert_eq!(
            executor.commands_in(node.path()),
            vec![
                format!("remote add sync {}", PEER),
                "fetch sync +refs/heads/*:refs/heads/* +refs/tags/*:refs/tags/*".to_string(),
                "remote remove sync".to_string(),
            ]
        );
        assert!(!has_marker(&node));
    }

    #[tokio::test]
    async fn test_second_run_after_heal_is_noop() {
        let (_dir, node) = marked_node();
        let executor = Arc::new(ScriptedExecutor::new());
        let resyncer = resyncer(&executor);

        assert!(resyncer.resync(&node).await.is_healed());
        let calls = executor.calls().len();
        assert_eq!(resyncer.resync(&node).await, ResyncOutcome::NotNeeded);
        assert_eq!(executor.calls().len(), calls);
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_marker_and_retries() {
        let (_dir, node) = marked_node();
        let broken = Arc::new(ScriptedExecutor::new());
        broken.fail(node.path(), "fetch");

        let outcome = resyncer(&broken).resync(&node).await;
        assert!(matches!(outcome, ResyncOutcome::Failed { stage: ResyncStage::Fetch, .. }));
        assert!(has_marker(&node));
        // The temporary remote is dropped again
        assert_eq!(broken.commands_in(node.path()).last().unwrap(), "remote remove sync");

        // A later trigger starts over from the marker
        let healthy = Arc::new(ScriptedExecutor::new());
        let outcome = resyncer(&healthy).resync(&node).await;
        assert_eq!(outcome, ResyncOutcome::Healed { peer: PEER.to_string() });
        assert_eq!(healthy.commands_in(node.path())[0], format!("remote add sync {}", PEER));
        assert!(!has_marker(&node));
    }

    #[tokio::test]
    async fn test_remove_remote_failure_keeps_marker() {
        let (_dir, node) = marked_node();
        let broken = Arc::new(ScriptedExecutor::new());
        broken.fail(node.path(), "remote remove");

        let outcome = resyncer(&broken).resync(&node).await;
        assert!(matches!(outcome, ResyncOutcome::Failed { stage: ResyncStage::RemoveRemote, .. }));
        assert!(broken.commands_in(node.path()).iter().any(|c| c.starts_with("fetch sync")));
        assert!(has_marker(&node));

        // The next trigger runs the whole procedure again
        let retry = resyncer(&broken).resync(&node).await;
        assert!(matches!(retry, ResyncOutcome::Failed { stage: ResyncStage::RemoveRemote, .. }));
        let adds = broken
            .commands_in(node.path())
            .iter()
            .filter(|c| c.starts_with("remote add"))
            .count();
        assert_eq!(adds, 2);

        let healthy = Arc::new(ScriptedExecutor::new());
        assert_eq!(
            resyncer(&healthy).resync(&node).await,
            ResyncOutcome::Healed { peer: PEER.to_string() }
        );
        assert!(!has_marker(&node));
    }

    #[tokio::test]
    async fn test_clear_marker_failure_reports_stage() {
        let (_dir, node) = marked_node();
        let executor = Arc::new(ScriptedExecutor::new());
        executor.delay(node.path(), "fetch", Duration::from_millis(500));
        let task = {
            let resyncer = resyncer(&executor);
            let node = node.clone();
            tokio::spawn(async move { resyncer.resync(&node).await })
        };

        // While the fetch is held, swap the marker for a directory it cannot remove
        while !executor.commands_in(node.path()).iter().any(|c| c.starts_with("fetch")) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let marker = node.path().join(MARKER_FILE);
        std::fs::remove_file(&marker).unwrap();
        std::fs::create_dir(&marker).unwrap();
        std::fs::write(marker.join("peer"), PEER).unwrap();

        let outcome = task.await.unwrap();
        assert!(matches!(outcome, ResyncOutcome::Failed { stage: ResyncStage::ClearMarker, .. }));
        assert!(marker.exists());
        assert_eq!(executor.commands_in(node.path()).last().unwrap(), "remote remove sync");
    }

    #[tokio::test]
    async fn test_existing_remote_is_repointed() {
        let (_dir, node) = marked_node();
        let executor = Arc::new(ScriptedExecutor::new());
        executor.fail(node.path(), "remote add");

        let outcome = resyncer(&executor).resync(&node).await;
        assert!(outcome.is_healed());
        let commands = executor.commands_in(node.path());
        assert_eq!(commands[1], format!("remote set-url sync {}", PEER));
        assert!(commands[2].starts_with("fetch sync"));
    }

    #[tokio::test]
    async fn test_register_failure_stops_before_fetch() {
        let (_dir, node) = marked_node();
        let executor = Arc::new(ScriptedExecutor::new());
        executor.fail(node.path(), "remote");

        let outcome = resyncer(&executor).resync(&node).await;
        assert!(matches!(outcome, ResyncOutcome::Failed { stage: ResyncStage::RegisterRemote, .. }));
        assert!(executor.commands_in(node.path()).iter().all(|c| !c.starts_with("fetch")));
        assert!(has_marker(&node));
    }

    #[tokio::test]
    async fn test_option_like_peer_is_rejected() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(MARKER_FILE), "--upload-pack=touch /tmp/pwned").unwrap();
        let node = ReplicaNode::new(dir.path());
        let executor = Arc::new(ScriptedExecutor::new());

        let outcome = resyncer(&executor).resync(&node).await;
        assert!(matches!(outcome, ResyncOutcome::Failed { stage: ResyncStage::RegisterRemote, .. }));
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_marker_skips_resync() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join(MARKER_FILE)).unwrap();
        let node = ReplicaNode::new(dir.path());
        let executor = Arc::new(ScriptedExecutor::new());

        assert_eq!(resyncer(&executor).resync(&node).await, ResyncOutcome::NotNeeded);
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn test_step_timeout_fails_step() {
        let (_dir, node) = marked_node();
        let executor = Arc::new(ScriptedExecutor::new());
        executor.delay(node.path(), "fetch", Duration::from_secs(30));
        let resyncer = Resyncer::new(executor.clone(), MarkerStore::new(), Duration::from_millis(100))
            .with_reconcile(false);

        match resyncer.resync(&node).await {
            ResyncOutcome::Failed { stage, error } => {
                assert_eq!(stage, ResyncStage::Fetch);
                assert!(error.contains("timed out"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(has_marker(&node));
    }

    #[tokio::test]
    async fn test_reconcile_skips_fetch_when_current() {
        let (_dir, node) = marked_node();
        let executor = Arc::new(ScriptedExecutor::new());
        executor.respond(Some(node.path()), "ls-remote", "abc123\trefs/heads/main\n");
        let resyncer = Resyncer::new(executor.clone(), MarkerStore::new(), Duration::from_secs(30));

        let outcome = resyncer.resync(&node).await;
        assert_eq!(outcome, ResyncOutcome::AlreadyCurrent { peer: PEER.to_string() });
        assert!(!has_marker(&node));
        assert!(executor.commands_in(node.path()).iter().all(|c| c.starts_with("ls-remote")));
    }

    #[tokio::test]
    async fn test_reconcile_fetches_when_refs_differ() {
        let (_dir, node) = marked_node();
        let executor = Arc::new(ScriptedExecutor::new());
        executor.respond(Some(node.path()), "ls-remote --heads --tags .", "abc123\trefs/heads/main\n");
        executor.respond(Some(node.path()), "ls-remote", "def456\trefs/heads/main\n");
        let resyncer = Resyncer::new(executor.clone(), MarkerStore::new(), Duration::from_secs(30));

        let outcome = resyncer.resync(&node).await;
        assert_eq!(outcome, ResyncOutcome::Healed { peer: PEER.to_string() });
        assert!(executor.commands_in(node.path()).iter().any(|c| c.starts_with("fetch sync")));
    }

    #[tokio::test]
    async fn test_resync_all_reports_each_node() {
        let (_a, marked) = marked_node();
        let clean_dir = tempdir().unwrap();
        let clean = ReplicaNode::new(clean_dir.path());
        let executor = Arc::new(ScriptedExecutor::new());

        let reports = resyncer(&executor).resync_all(&[marked.clone(), clean.clone()]).await;
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].node, marked);
        assert!(reports[0].outcome.is_healed());
        assert_eq!(reports[1].outcome, ResyncOutcome::NotNeeded);

        let json = serde_json::to_value(&reports[1]).unwrap();
        assert_eq!(json["outcome"], "not_needed");
    }
}
