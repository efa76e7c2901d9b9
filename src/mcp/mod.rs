//! Model Context Protocol server handling and JSON-RPC implementations
//!
//! Wire parsing and error mapping live in [`rpc`]; the lifecycle state machine
//! and method dispatch live in [`server`].

pub mod rpc;
pub mod server;
