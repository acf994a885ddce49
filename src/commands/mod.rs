//! Command implementations for the CLI
//!
//! - start: Start the relay server
//! - send: Deliver a single record to a relay
//! - config: Configuration display and validation

pub mod config;
pub mod send;
pub mod start;
