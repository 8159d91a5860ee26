// =============================================================================
// OKX REST Client - public candle history
// =============================================================================
//
// Only the public candles endpoint is used, so there is no request signing.
// Each call is a single attempt bounded by the client timeout; retrying is the
// fetcher's job.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::error::FetchError;
use crate::fetcher::CandleSource;
use crate::okx::parse_candle_row;
use crate::runtime_config::RuntimeConfig;
use crate::types::Candle;

/// Response envelope shared by every OKX v5 REST endpoint.
#[derive(Debug, Deserialize)]
struct Envelope {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Vec<Value>,
}

#[derive(Clone)]
pub struct OkxClient {
    candles_url: String,
    client: reqwest::Client,
}

impl OkxClient {
    /// Build a client from the runtime config (endpoint, timeout, proxy).
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("candle-pipeline/", env!("CARGO_PKG_VERSION")));

        if let Some(proxy) = config.rest_proxy.as_deref() {
            builder = builder.proxy(
                reqwest::Proxy::all(proxy).with_context(|| format!("invalid REST proxy {proxy}"))?,
            );
        }

        let client = builder.build().context("failed to build reqwest client")?;
        debug!(candles_url = %config.rest_url, "OkxClient initialised");

        Ok(Self {
            candles_url: config.rest_url.clone(),
            client,
        })
    }

    /// GET the candles endpoint once. Rows come back newest-first.
    #[instrument(skip(self), name = "okx::get_candles")]
    pub async fn get_candles(
        &self,
        inst_id: &str,
        bar: &str,
        before: i64,
        limit: usize,
    ) -> Result<Vec<Candle>, FetchError> {
        let before = before.to_string();
        let limit = limit.to_string();
        let resp = self
            .client
            .get(&self.candles_url)
            .query(&[
                ("instId", inst_id),
                ("bar", bar),
                ("before", before.as_str()),
                ("limit", limit.as_str()),
            ])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Transport(format!(
                "GET {} returned {status}",
                self.candles_url
            )));
        }

        let body = resp.text().await?;
        let candles = parse_candles_body(&body)?;
        debug!(count = candles.len(), "candles fetched");
        Ok(candles)
    }
}

/// Decode a candles response body into candles, newest-first as sent.
fn parse_candles_body(body: &str) -> Result<Vec<Candle>, FetchError> {
    let envelope: Envelope =
        serde_json::from_str(body).map_err(|e| FetchError::InvalidPayload(e.to_string()))?;

    if envelope.code != "0" {
        let message = if envelope.msg.is_empty() {
            "OKX error".to_string()
        } else {
            envelope.msg
        };
        return Err(FetchError::Application {
            code: envelope.code,
            message,
        });
    }

    envelope
        .data
        .iter()
        .map(|row| {
            let arr_len = row.as_array().map_or(0, Vec::len);
            if arr_len < 7 {
                return Err(FetchError::InvalidPayload(format!(
                    "candle row has {arr_len} fields, need 7"
                )));
            }
            parse_candle_row(row).map_err(|e| FetchError::InvalidPayload(format!("{e:#}")))
        })
        .collect()
}

#[async_trait]
impl CandleSource for OkxClient {
    async fn fetch_page(
        &self,
        inst_id: &str,
        bar: &str,
        before: i64,
        limit: usize,
    ) -> Result<Vec<Candle>, FetchError> {
        self.get_candles(inst_id, bar, before, limit).await
    }
}

impl std::fmt::Debug for OkxClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OkxClient")
            .field("candles_url", &self.candles_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_success_envelope() {
        let body = r#"{"code":"0","msg":"","data":[
            ["1700000060000","2001","2003","2000","2002","5","10010","10010","1"],
            ["1700000000000","2000","2002","1999","2001","4","8004","8004","1"]
        ]}"#;
        let candles = parse_candles_body(body).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].ts, 1_700_000_060_000);
        assert_eq!(candles[1].close, 2001.0);
    }

    #[test]
    fn non_zero_code_is_application_error() {
        let body = r#"{"code":"51001","msg":"Instrument ID does not exist","data":[]}"#;
        match parse_candles_body(body) {
            Err(FetchError::Application { code, message }) => {
                assert_eq!(code, "51001");
                assert_eq!(message, "Instrument ID does not exist");
            }
            other => panic!("expected application error, got {other:?}"),
        }
    }

    #[test]
    fn bad_numbers_are_invalid_payload() {
        let body = r#"{"code":"0","data":[["1700000000000","x","2002","1999","2001","4","8004"]]}"#;
        assert!(matches!(parse_candles_body(body), Err(FetchError::InvalidPayload(_))));

        let short = r#"{"code":"0","data":[["1700000000000","2000","2002","1999","2001","4"]]}"#;
        assert!(matches!(parse_candles_body(short), Err(FetchError::InvalidPayload(_))));

        assert!(matches!(parse_candles_body("<html>"), Err(FetchError::InvalidPayload(_))));
    }

    #[test]
    fn builds_from_default_config() {
        let client = OkxClient::new(&RuntimeConfig::default()).unwrap();
        assert!(format!("{client:?}").contains("api/v5/market/candles"));
    }
}
