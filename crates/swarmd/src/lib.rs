//! swarmd - switchyard swarm daemon
//!
//! This daemon provides:
//! - TCP listening and dialing with optional secure channel
//! - mplex stream multiplexing and identify
//! - Circuit relay dialing and hop relaying
//! - An echo protocol for connectivity checks

pub mod config;
pub mod node;

pub use config::Config;
