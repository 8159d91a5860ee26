// =============================================================================
// OKX v5 adapters - REST candles and public WebSocket channels
// =============================================================================
//
// The exchange sends every number as a JSON string. Everything in this module
// converts those strings into the fixed `types` schemas once, at the edge.
// =============================================================================

pub mod client;
pub mod ws;

use anyhow::{Context, Result};
use serde_json::Value;

use crate::types::Candle;

pub use client::OkxClient;

/// Parse a JSON value that may be either a numeric string or a number.
pub fn parse_f64(val: &Value, name: &str) -> Result<f64> {
    let parsed = match val {
        Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}"))?,
        Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64"))?,
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    };
    anyhow::ensure!(parsed.is_finite(), "field {name} is not finite: {parsed}");
    Ok(parsed)
}

/// Parse an epoch-millisecond timestamp sent as a string or a number.
pub fn parse_ts_ms(val: &Value, name: &str) -> Result<i64> {
    match val {
        Value::String(s) => s
            .parse::<i64>()
            .with_context(|| format!("failed to parse {name} as epoch ms: {s}")),
        Value::Number(n) => n
            .as_i64()
            .with_context(|| format!("field {name} is not an integer")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

/// Parse one candle row `[ts, o, h, l, c, vol, volCcy, ...]`.
///
/// `volCcy` is optional; trailing fields are ignored.
pub fn parse_candle_row(row: &Value) -> Result<Candle> {
    let arr = row.as_array().context("candle row is not an array")?;
    anyhow::ensure!(arr.len() >= 6, "candle row has {} fields, need at least 6", arr.len());

    let volume_ccy = match arr.get(6) {
        Some(v) => parse_f64(v, "volCcy")?,
        None => 0.0,
    };

    Ok(Candle {
        ts: parse_ts_ms(&arr[0], "ts")?,
        open: parse_f64(&arr[1], "open")?,
        high: parse_f64(&arr[2], "high")?,
        low: parse_f64(&arr[3], "low")?,
        close: parse_f64(&arr[4], "close")?,
        volume: parse_f64(&arr[5], "vol")?,
        volume_ccy,
    })
}
