//! HTTP API Module
//!
//! Git smart-HTTP front end for the replica node set, plus node status and
//! admin routes.

mod http;
pub mod protocol;

pub use http::{router, AppState, HttpServer};
pub use protocol::GitService;
