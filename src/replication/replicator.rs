//! Replication Orchestrator
//!
//! Fans one inbound write out to every replica node: the inbound stream is
//! broadcast into one in-process pipe per node, each node runs its write
//! against its pipe concurrently, and a collector gathers one result per node.
//! Nodes that fail are marked out of sync against a node that succeeded.

use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::broadcast::BroadcastWriter;
use crate::executor::{BoxedWriter, Invocation, RepositoryExecutor, RunIo};
use crate::state::{MarkerStore, ReplicaNode};
use crate::error::{Error, Result};

/// Capacity of each node's inbound pipe
const PIPE_CAPACITY: usize = 64 * 1024;
/// Read size for the inbound copy loop
const COPY_CHUNK: usize = 32 * 1024;

/// Outcome of one node's write
#[derive(Debug)]
pub struct ReplicationResult {
    pub node: ReplicaNode,
    pub error: Option<Error>,
}

impl ReplicationResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// How the inbound copy ended
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundOutcome {
    /// Bytes read from the inbound stream
    pub bytes: u64,
    /// Read error that ended the copy early
    pub error: Option<String>,
}

impl InboundOutcome {
    /// The copy failure as a request error
    pub fn to_error(&self) -> Option<Error> {
        self.error.as_ref().map(|reason| Error::InboundCopy {
            copied: self.bytes,
            reason: reason.clone(),
        })
    }
}

/// Summary of one replicated write
#[derive(Debug, Default)]
pub struct ReplicationReport {
    pub inbound: InboundOutcome,
    /// Results in arrival order
    pub results: Vec<ReplicationResult>,
    /// Peer recorded in the markers of failed nodes
    pub healthy_peer: Option<ReplicaNode>,
    /// Nodes whose marker was written
    pub marked: Vec<ReplicaNode>,
    /// Nodes whose result was never collected because of cancellation
    pub abandoned: usize,
}

impl ReplicationReport {
    pub fn failed_nodes(&self) -> Vec<&ReplicaNode> {
        self.results
            .iter()
            .filter(|r| !r.is_ok())
            .map(|r| &r.node)
            .collect()
    }
}

/// A replicated write in flight
pub struct ReplicationHandle {
    inbound: Option<oneshot::Receiver<InboundOutcome>>,
    task: JoinHandle<ReplicationReport>,
}

impl ReplicationHandle {
    /// Wait for the inbound copy to end. Resolves once; later calls yield `None`.
    pub async fn inbound_done(&mut self) -> Option<InboundOutcome> {
        let rx = self.inbound.take()?;
        rx.await.ok()
    }

    /// Wait for the copy, every node write and the collector to finish
    pub async fn finish(self) -> Result<ReplicationReport> {
        self.task
            .await
            .map_err(|e| Error::Internal(format!("replication task failed: {}", e)))
    }
}

/// Drives replicated writes across a fixed node set
#[derive(Clone)]
pub struct Replicator {
    nodes: Vec<ReplicaNode>,
    executor: Arc<dyn RepositoryExecutor>,
    markers: MarkerStore,
}

impl Replicator {
    pub fn new(nodes: Vec<ReplicaNode>, executor: Arc<dyn RepositoryExecutor>, markers: MarkerStore) -> Self {
        Self {
            nodes,
            executor,
            markers,
        }
    }

    /// Replicate `inbound` to every node and wait for the outcome
    pub async fn replicate<R, I, O>(
        &self,
        inbound: R,
        invocation_for: I,
        output_for: O,
        cancel: CancellationToken,
    ) -> Result<ReplicationReport>
    where
        R: AsyncRead + Send + Unpin + 'static,
        I: Fn(&ReplicaNode) -> Invocation,
        O: Fn(&ReplicaNode) -> BoxedWriter,
    {
        self.spawn(inbound, invocation_for, output_for, cancel)
            .finish()
            .await
    }

    /// Start replicating `inbound` to every node.
    ///
    /// `invocation_for` builds each node's write command and `output_for`
    /// supplies the writer receiving that node's stdout. Cancelling `cancel`
    /// stops result collection; node writes already started run to completion.
    pub fn spawn<R, I, O>(
        &self,
        inbound: R,
        invocation_for: I,
        output_for: O,
        cancel: CancellationToken,
    ) -> ReplicationHandle
    where
        R: AsyncRead + Send + Unpin + 'static,
        I: Fn(&ReplicaNode) -> Invocation,
        O: Fn(&ReplicaNode) -> BoxedWriter,
    {
        let expected = self.nodes.len();
        let mut pipe_writers = Vec::with_capacity(expected);
        let (result_tx, result_rx) = mpsc::channel(expected.max(1));

        for node in &self.nodes {
            let (pipe_w, pipe_r) = tokio::io::duplex(PIPE_CAPACITY);
            pipe_writers.push(pipe_w);

            let invocation = invocation_for(node);
            let io = RunIo::new(Box::new(pipe_r), output_for(node));
            let executor = Arc::clone(&self.executor);
            let result_tx = result_tx.clone();
            let node = node.clone();

            tokio::spawn(async move {
                let outcome = executor.run(invocation, io).await;
                if let Err(e) = &outcome {
                    tracing::error!(node = %node, "Replicated write failed: {}", e);
                }
                let _ = result_tx
                    .send(ReplicationResult {
                        node,
                        error: outcome.err(),
                    })
                    .await;
            });
        }
        drop(result_tx);

        let (inbound_tx, inbound_rx) = oneshot::channel();
        let broadcast = BroadcastWriter::from_writers(pipe_writers);
        let copy = tokio::spawn(copy_inbound(inbound, broadcast, self.nodes.clone(), inbound_tx));
        let collector = tokio::spawn(collect(expected, result_rx, cancel));

        let markers = self.markers.clone();
        let task = tokio::spawn(async move {
            let inbound = copy.await.unwrap_or_else(|e| InboundOutcome {
                bytes: 0,
                error: Some(format!("copy task failed: {}", e)),
            });
            let (results, abandoned) = collector.await.unwrap_or_else(|e| {
                tracing::error!("Result collector failed: {}", e);
                (Vec::new(), expected)
            });

            if abandoned > 0 {
                tracing::warn!("Stopped waiting for {} of {} node results", abandoned, expected);
            }

            let (healthy_peer, marked) = mark_failures(&markers, &results).await;
            ReplicationReport {
                inbound,
                results,
                healthy_peer,
                marked,
                abandoned,
            }
        });

        ReplicationHandle {
            inbound: Some(inbound_rx),
            task,
        }
    }
}

/// Copy the inbound stream into the broadcast writer, then close every pipe
async fn copy_inbound<R: AsyncRead + Unpin>(
    mut inbound: R,
    mut broadcast: BroadcastWriter,
    nodes: Vec<ReplicaNode>,
    done: oneshot::Sender<InboundOutcome>,
) -> InboundOutcome {
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut stalled = vec![false; nodes.len()];
    let mut outcome = InboundOutcome::default();

    loop {
        let n = match inbound.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::error!("Inbound copy failed after {} bytes: {}", outcome.bytes, e);
                outcome.error = Some(e.to_string());
                break;
            }
        };
        outcome.bytes += n as u64;

        // A node that stopped reading has failed on its own; the rest keep going.
        if let Err(e) = broadcast.write(&buf[..n]).await {
            for failure in e.failures {
                if !stalled[failure.index] {
                    stalled[failure.index] = true;
                    tracing::warn!(
                        node = %nodes[failure.index],
                        "Node stopped accepting replicated data: {}",
                        failure.kind
                    );
                }
            }
        }
    }

    if let Err(e) = broadcast.close().await {
        tracing::debug!("Closing node pipes: {}", e);
    }

    let _ = done.send(outcome.clone());
    outcome
}

/// Drain one result per node, or stop early on cancellation
async fn collect(
    expected: usize,
    mut results: mpsc::Receiver<ReplicationResult>,
    cancel: CancellationToken,
) -> (Vec<ReplicationResult>, usize) {
    let mut collected = Vec::with_capacity(expected);

    while collected.len() < expected {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = results.recv() => match result {
                Some(result) => collected.push(result),
                None => break,
            },
        }
    }

    let abandoned = expected - collected.len();
    (collected, abandoned)
}

/// Mark every failed node against the smallest identifier that succeeded
async fn mark_failures(
    markers: &MarkerStore,
    results: &[ReplicationResult],
) -> (Option<ReplicaNode>, Vec<ReplicaNode>) {
    let healthy = results
        .iter()
        .filter(|r| r.is_ok())
        .map(|r| &r.node)
        .min()
        .cloned();

    let failed: Vec<&ReplicaNode> = results.iter().filter(|r| !r.is_ok()).map(|r| &r.node).collect();
    if failed.is_empty() {
        return (healthy, Vec::new());
    }

    let Some(peer) = healthy else {
        tracing::error!(
            "All {} collected node writes failed; no healthy peer to record",
            failed.len()
        );
        return (None, Vec::new());
    };

    let mut marked = Vec::with_capacity(failed.len());
    for node in failed {
        if markers.mark(node, &peer).await {
            marked.push(node.clone());
        }
    }
    (Some(peer), marked)
}
