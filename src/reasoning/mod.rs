// =============================================================================
// Reasoning — structured-output providers behind one router
// =============================================================================

pub mod actions;
pub mod provider;
pub mod router;

pub use actions::{ActionKind, ReasoningOutcome, TradeAction};
pub use provider::{estimate_cost, ProviderKind, ProviderReply, ReasoningProvider};
pub use router::{InvokeRequest, ReasoningRouter, RouterConfig};
