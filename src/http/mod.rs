//! HTTP transport: one JSON-RPC frame per `POST /mcp`, plus health and
//! discovery endpoints. Shares the router and session with stdio.

pub mod handlers;
