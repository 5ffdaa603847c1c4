// =============================================================================
// Transport bridge — thin axum adapter over the core operations
// =============================================================================
//
// The user-facing UI, sessions, and auth system live outside this process;
// the bridge exposes the core's operations to any transport and the two
// WebSocket feeds (engine state push, market-data fan-out).

pub mod auth;
pub mod rest;
pub mod ws;
