// =============================================================================
// Market Data — upstream feed fan-out
// =============================================================================
//
// One persistent websocket to the venue's public feed, multiplexed to many
// in-process subscribers with reference-counted upstream subscriptions.

pub mod frames;
pub mod hub;

pub use frames::{
    normalize_symbol, BookFrame, BookLevel, CandleFrame, ChannelKey, ChannelKind, MarketFrame,
    TradeFrame,
};
pub use hub::{MarketDataHub, Subscription};
