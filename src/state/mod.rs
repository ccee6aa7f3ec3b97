//! State Management Module
//!
//! Node identity and the on-disk out-of-sync markers that record which
//! nodes missed a write.

mod marker;
mod node;

pub use marker::{MarkerStore, MARKER_FILE};
pub use node::{NodeHealth, NodeReport, ReplicaNode};
