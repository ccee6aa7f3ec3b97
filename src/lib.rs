//! GitScale - Replicating Git Smart-HTTP Front End
//!
//! Fronts a fixed set of independent Git repositories (replica nodes) with a
//! single smart-HTTP endpoint. Every push is replicated to all nodes at once;
//! nodes that fail are recorded as out of sync and healed later from a peer
//! that kept up.
//!
//! # Architecture
//!
//! ```text
//!                      +--> pipe --> receive-pack (node1) --+
//! push body --> copy --+--> pipe --> receive-pack (node2) --+--> response
//!                      +--> pipe --> receive-pack (node3) --+
//!                                          |
//!                              failure --> <node>/outofsync
//! ```
//!
//! # Features
//!
//! - Concurrent broadcast of the push body without buffering it whole
//! - Out-of-sync markers naming a verified healthy peer
//! - Resync with a shared time budget and compensating cleanup
//! - Configurable resync triggers per request kind
//! - Gzip request bodies and `Git-Protocol` forwarding

pub mod config;
pub mod error;
pub mod state;
pub mod replication;
pub mod executor;
pub mod api;

pub use config::GitScaleConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::GitScaleConfig;
    pub use crate::error::{Error, Result};
    pub use crate::executor::{GitExecutor, Invocation, RepositoryExecutor};
    pub use crate::replication::{BroadcastWriter, Replicator, Resyncer};
    pub use crate::state::{MarkerStore, NodeHealth, ReplicaNode};
}
