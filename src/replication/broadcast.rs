//! Broadcast Writer
//!
//! Duplicates every chunk written to it onto a set of sinks. Each sink is
//! driven concurrently, so a slow or stuck sink never delays delivery to the
//! others, and every sink is attempted on every call regardless of how the
//! rest fare. A call returns once all sinks are done with the chunk.

use std::fmt;
use futures::future::join_all;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Owned sink driven by a broadcast writer
pub type BoxedSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Why a single sink failed
#[derive(Debug, Error)]
pub enum SinkErrorKind {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("short write: accepted {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },
}

/// Failure of one sink, attributable by its position in the sink list
#[derive(Debug, Error)]
#[error("write error {kind} at index: {index}")]
pub struct SinkFailure {
    pub index: usize,
    #[source]
    pub kind: SinkErrorKind,
}

/// Aggregated failures of one broadcast call
#[derive(Debug)]
pub struct BroadcastError {
    /// Bytes reported as accepted: always the full chunk length
    pub accepted: usize,
    /// One entry per failing sink, in sink order
    pub failures: Vec<SinkFailure>,
}

impl BroadcastError {
    /// Indexes of the sinks that failed
    pub fn failed_indexes(&self) -> Vec<usize> {
        self.failures.iter().map(|f| f.index).collect()
    }
}

impl fmt::Display for BroadcastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.failures.iter().map(ToString::to_string).collect();
        write!(f, "{}", parts.join("\n"))
    }
}

impl std::error::Error for BroadcastError {}

/// A sink registered with a broadcast writer
pub enum Sink {
    /// A leaf writer
    Writer(BoxedSink),
    /// Another broadcast writer; its sinks are adopted directly
    Broadcast(BroadcastWriter),
}

impl Sink {
    pub fn writer<W: AsyncWrite + Send + Unpin + 'static>(writer: W) -> Self {
        Sink::Writer(Box::new(writer))
    }
}

impl From<BroadcastWriter> for Sink {
    fn from(broadcast: BroadcastWriter) -> Self {
        Sink::Broadcast(broadcast)
    }
}

/// Concurrent fan-out writer
pub struct BroadcastWriter {
    sinks: Vec<BoxedSink>,
}

impl BroadcastWriter {
    /// Create a writer over `sinks`, flattening nested broadcast writers
    pub fn new(sinks: impl IntoIterator<Item = Sink>) -> Self {
        let mut flat = Vec::new();
        for sink in sinks {
            match sink {
                Sink::Writer(writer) => flat.push(writer),
                Sink::Broadcast(inner) => flat.extend(inner.sinks),
            }
        }
        Self { sinks: flat }
    }

    /// Create a writer over plain writers
    pub fn from_writers<W>(writers: impl IntoIterator<Item = W>) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::new(writers.into_iter().map(Sink::writer))
    }

    /// Offer `buf` to every sink concurrently.
    ///
    /// Returns `buf.len()` when every sink accepted the whole chunk, otherwise
    /// a [`BroadcastError`] holding one failure per failing sink.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, BroadcastError> {
        let outcomes = join_all(
            self.sinks
                .iter_mut()
                .map(|sink| write_full(&mut **sink, buf)),
        )
        .await;

        Self::collect(buf.len(), outcomes)
    }

    /// Shut down every sink concurrently, signalling end-of-stream
    pub async fn shutdown(&mut self) -> Result<(), BroadcastError> {
        let outcomes = join_all(
            self.sinks
                .iter_mut()
                .map(|sink| async move { sink.shutdown().await.map_err(SinkErrorKind::from) }),
        )
        .await;

        Self::collect(0, outcomes).map(|_| ())
    }

    /// Shut down and release every sink. Each sink is closed exactly once.
    pub async fn close(mut self) -> Result<(), BroadcastError> {
        let result = self.shutdown().await;
        self.sinks.clear();
        result
    }

    fn collect(
        accepted: usize,
        outcomes: Vec<Result<(), SinkErrorKind>>,
    ) -> Result<usize, BroadcastError> {
        let failures: Vec<SinkFailure> = outcomes
            .into_iter()
            .enumerate()
            .filter_map(|(index, outcome)| outcome.err().map(|kind| SinkFailure { index, kind }))
            .collect();

        if failures.is_empty() {
            Ok(accepted)
        } else {
            Err(BroadcastError { accepted, failures })
        }
    }
}

/// Write all of `buf`, treating a sink that stops accepting bytes as a short write
async fn write_full(
    sink: &mut (dyn AsyncWrite + Send + Unpin),
    buf: &[u8],
) -> Result<(), SinkErrorKind> {
    let mut written = 0;
    while written < buf.len() {
        match sink.write(&buf[written..]).await {
            Ok(0) => {
                return Err(SinkErrorKind::ShortWrite {
                    written,
                    expected: buf.len(),
                })
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
