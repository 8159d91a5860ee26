// =============================================================================
// OKX public WebSocket - subscribe + read loop shared by all streams
// =============================================================================

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::types::Channel;

/// Build the subscribe frame for a single channel on `inst_id`.
pub fn subscribe_frame(channel: Channel, inst_id: &str) -> String {
    json!({
        "op": "subscribe",
        "args": [{ "channel": channel.as_str(), "instId": inst_id }],
    })
    .to_string()
}

#[derive(Debug, Deserialize)]
struct FrameArg {
    channel: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Frame {
    event: Option<String>,
    code: Option<String>,
    msg: Option<String>,
    arg: Option<FrameArg>,
    data: Option<Vec<Value>>,
}

/// Result of classifying one text frame.
#[derive(Debug, PartialEq)]
pub enum FrameKind {
    /// Subscribe ack, error notice or other `event` frame.
    Control,
    /// Data for another channel, or a frame with no data.
    Other,
    /// Data rows for the requested channel.
    Data(Vec<Value>),
}

/// Classify a text frame against the channel a stream subscribed to.
pub fn classify_frame(text: &str, channel: Channel) -> Result<FrameKind> {
    let frame: Frame = serde_json::from_str(text).context("frame is not valid JSON")?;

    if let Some(event) = frame.event {
        if event == "error" {
            warn!(
                channel = %channel,
                code = frame.code.as_deref().unwrap_or(""),
                msg = frame.msg.as_deref().unwrap_or(""),
                "exchange reported a WebSocket error"
            );
        } else {
            debug!(channel = %channel, event = %event, "control frame");
        }
        return Ok(FrameKind::Control);
    }

    let on_channel = frame
        .arg
        .and_then(|a| a.channel)
        .is_some_and(|c| c == channel.as_str());

    match frame.data {
        Some(rows) if on_channel => Ok(FrameKind::Data(rows)),
        _ => Ok(FrameKind::Other),
    }
}

/// Connect to `ws_url`, subscribe to `channel` for `inst_id`, and feed every
/// data row batch into `on_rows`.
///
/// A batch that `on_rows` rejects is logged and skipped. Runs until the
/// socket ends or fails, then returns so the caller can reconnect.
pub async fn run_channel<F>(ws_url: &str, inst_id: &str, channel: Channel, mut on_rows: F) -> Result<()>
where
    F: FnMut(Vec<Value>) -> Result<()>,
{
    info!(url = %ws_url, inst_id = %inst_id, channel = %channel, "connecting to WebSocket");

    let (ws_stream, _response) = connect_async(ws_url)
        .await
        .with_context(|| format!("failed to connect {channel} WebSocket"))?;

    let (mut write, mut read) = ws_stream.split();
    write
        .send(Message::Text(subscribe_frame(channel, inst_id)))
        .await
        .with_context(|| format!("failed to subscribe {channel}"))?;
    info!(inst_id = %inst_id, channel = %channel, "WebSocket subscribed");

    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match classify_frame(&text, channel) {
                Ok(FrameKind::Data(rows)) => {
                    if let Err(e) = on_rows(rows) {
                        warn!(channel = %channel, error = %e, "failed to handle data frame");
                    }
                }
                Ok(FrameKind::Control | FrameKind::Other) => {}
                Err(e) => {
                    warn!(channel = %channel, error = %e, "failed to parse frame");
                }
            },
            // Ping/Pong are answered by tungstenite; binary frames are unused.
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(channel = %channel, error = %e, "WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(inst_id = %inst_id, channel = %channel, "WebSocket stream ended");
                return Ok(());
            }
        }
    }
}
