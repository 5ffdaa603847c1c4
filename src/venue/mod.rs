// =============================================================================
// Venue module — typed client for the perpetuals exchange
// =============================================================================

pub mod client;
pub mod signer;
pub mod types;
