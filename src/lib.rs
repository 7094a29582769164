//! Idlegate - a lazy-activation reverse proxy
//!
//! This library provides a supervisor that sits in front of one expensive,
//! slow-to-start backend server:
//! - Spawns the backend process on the first inbound request
//! - Holds requests until the backend accepts TCP connections
//! - Streams requests and responses to and from the backend unmodified
//! - Stops the backend after a configurable period without requests
//! - Serializes all start/stop decisions so only one backend ever runs

pub mod config;
pub mod coordinator;
pub mod error;
pub mod forwarder;
pub mod launcher;
pub mod server;
pub mod timer;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
