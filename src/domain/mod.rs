//! Tools and resources exposed over the MCP protocol
//!
//! Thin adapters between protocol payloads and the NRQL query service.

pub mod resources;
pub mod tools;
pub mod utils;
