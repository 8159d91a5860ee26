pub mod candle_cache;
pub mod live_close;
pub mod orderbook;
pub mod series;
pub mod trade_bar;

pub use candle_cache::CandleCache;
pub use live_close::{apply_minute_close, LiveCloseOutcome};
pub use orderbook::{OrderBookSnapshot, OrderBookTracker};
pub use series::CandleSeries;
pub use trade_bar::TradeBarAggregator;
