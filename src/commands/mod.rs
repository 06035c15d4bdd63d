//! Command implementations for the CLI
//!
//! - start: Run the telemetry server
//! - config: Configuration display and validation

pub mod config;
pub mod start;
