// =============================================================================
// Pipeline Events - one-way notifications from producer tasks to the consumer
// =============================================================================
//
// Every producer (historical fetch, candle / trade / depth streams) owns its
// own state and only ever *sends* on this channel. The consumer drains it in
// its own task and is the sole writer of the published view.
//
// The channel is unbounded: streams have no backpressure, the consumer must
// keep up with every emitted event.
// =============================================================================

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::fetcher::FetchRequest;
use crate::market_data::{CandleSeries, OrderBookSnapshot};
use crate::types::{Candle, Channel};

pub type EventSender = mpsc::UnboundedSender<PipelineEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<PipelineEvent>;

/// Create the pipeline's event channel.
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Page progress of a running backfill. `total` is unknown until paging ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FetchProgress {
    pub pages_done: u32,
    pub total: Option<u32>,
}

/// Lifecycle of one backfill job.
#[derive(Debug, Clone)]
pub enum FetchEvent {
    Progress {
        job: Uuid,
        progress: FetchProgress,
    },
    Finished {
        job: Uuid,
        request: FetchRequest,
        series: CandleSeries,
    },
    Failed {
        job: Uuid,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Fetch(FetchEvent),
    /// Latest close of the live one-minute candle.
    MinuteClose { ts: i64, close: f64 },
    /// A completed one-second bar built from trades.
    SecondBar(Candle),
    OrderBook(OrderBookSnapshot),
    /// A stream connection ended or failed; the supervisor will reconnect.
    StreamError { channel: Channel, message: String },
}
