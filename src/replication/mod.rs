//! Replication Module
//!
//! Fans a single inbound write out to every replica node, records which
//! nodes fell behind, and heals them from a peer that kept up.

pub mod broadcast;
mod replicator;
mod resync;

pub use broadcast::{BroadcastError, BroadcastWriter, Sink, SinkErrorKind, SinkFailure};
pub use replicator::{
    InboundOutcome, ReplicationHandle, ReplicationReport, ReplicationResult, Replicator,
};
pub use resync::{ResyncOutcome, ResyncReport, ResyncStage, Resyncer, SYNC_REMOTE};
