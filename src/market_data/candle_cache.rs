// =============================================================================
// Candle Cache - columnar on-disk store for one (instrument, bar) series
// =============================================================================
//
// One JSON file per (instrument, bar). The file holds one array per candle
// field, all of equal length, sorted ascending by `ts`:
//
//   { "ts": [...], "open": [...], "high": [...], "low": [...],
//     "close": [...], "volume": [...], "volumeCcy": [...] }
//
// Writes go to a `.tmp` sibling first and are renamed into place, so a crash
// mid-write never leaves a truncated cache behind.
// =============================================================================

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::CacheError;
use crate::market_data::CandleSeries;
use crate::types::Candle;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Columns {
    ts: Vec<i64>,
    open: Vec<f64>,
    high: Vec<f64>,
    low: Vec<f64>,
    close: Vec<f64>,
    volume: Vec<f64>,
    #[serde(rename = "volumeCcy")]
    volume_ccy: Vec<f64>,
}

impl Columns {
    fn from_series(series: &CandleSeries) -> Self {
        let n = series.len();
        let mut cols = Self {
            ts: Vec::with_capacity(n),
            open: Vec::with_capacity(n),
            high: Vec::with_capacity(n),
            low: Vec::with_capacity(n),
            close: Vec::with_capacity(n),
            volume: Vec::with_capacity(n),
            volume_ccy: Vec::with_capacity(n),
        };
        for c in series.as_slice() {
            cols.ts.push(c.ts);
            cols.open.push(c.open);
            cols.high.push(c.high);
            cols.low.push(c.low);
            cols.close.push(c.close);
            cols.volume.push(c.volume);
            cols.volume_ccy.push(c.volume_ccy);
        }
        cols
    }

    fn into_rows(self) -> Result<Vec<Candle>, CacheError> {
        let n = self.ts.len();
        let lengths = [
            self.open.len(),
            self.high.len(),
            self.low.len(),
            self.close.len(),
            self.volume.len(),
            self.volume_ccy.len(),
        ];
        if lengths.iter().any(|&len| len != n) {
            return Err(CacheError::Corrupt(format!(
                "column lengths differ: ts={n}, others={lengths:?}"
            )));
        }

        let rows = (0..n)
            .map(|i| Candle {
                ts: self.ts[i],
                open: self.open[i],
                high: self.high[i],
                low: self.low[i],
                close: self.close[i],
                volume: self.volume[i],
                volume_ccy: self.volume_ccy[i],
            })
            .collect();
        Ok(rows)
    }
}

/// Handle on the cache file of a single (instrument, bar) pair.
///
/// A handle is owned by one fetch at a time; concurrent fetches for the same
/// pair must be serialized by the caller.
#[derive(Debug, Clone)]
pub struct CandleCache {
    path: PathBuf,
}

impl CandleCache {
    /// Cache handle for `inst_id`/`bar` stored under `dir`.
    ///
    /// Both keys become part of a file name, so anything that could leave
    /// `dir` is rejected.
    pub fn new(dir: impl AsRef<Path>, inst_id: &str, bar: &str) -> Result<Self, CacheError> {
        for key in [inst_id, bar] {
            check_key(key)?;
        }
        let path = dir.as_ref().join(format!("{inst_id}_{bar}.json"));
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored series, or an empty one if nothing has been saved yet.
    ///
    /// Stored rows are re-sorted and deduplicated on the way in.
    pub fn load(&self) -> Result<CandleSeries, CacheError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no cache file yet");
                return Ok(CandleSeries::new());
            }
            Err(e) => return Err(e.into()),
        };

        let cols: Columns = serde_json::from_str(&content)?;
        let series = CandleSeries::from_rows(cols.into_rows()?);
        debug!(path = %self.path.display(), rows = series.len(), "cache loaded");
        Ok(series)
    }

    /// Load the stored series for a request starting at `start_ms`.
    ///
    /// When `start_ms` precedes the earliest cached candle the cache cannot
    /// vouch for the missing earlier range, so the stored rows are discarded
    /// and an empty series is returned.
    pub fn load_for(&self, start_ms: i64) -> Result<CandleSeries, CacheError> {
        let series = self.load()?;
        match series.first_ts() {
            Some(earliest) if start_ms < earliest => {
                info!(
                    path = %self.path.display(),
                    start_ms,
                    earliest,
                    "requested start precedes cache, discarding cache"
                );
                Ok(CandleSeries::new())
            }
            _ => Ok(series),
        }
    }

    /// Persist `series`, replacing the previous file atomically.
    pub fn save(&self, series: &CandleSeries) -> Result<(), CacheError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = serde_json::to_string(&Columns::from_series(series))?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content)?;
        std::fs::rename(&tmp_path, &self.path)?;

        debug!(path = %self.path.display(), rows = series.len(), "cache saved");
        Ok(())
    }
}

fn check_key(key: &str) -> Result<(), CacheError> {
    let valid = !key.is_empty()
        && !key.contains("..")
        && !key.chars().any(|ch| matches!(ch, '/' | '\\' | ':') || ch.is_control());
    if valid {
        Ok(())
    } else {
        Err(CacheError::InvalidKey(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(ts: i64, close: f64) -> Candle {
        Candle {
            ts,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 2.0,
            volume_ccy: 2.0 * close,
        }
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CandleCache::new(dir.path(), "ETH-USDT", "1m").unwrap();
        assert!(cache.load().unwrap().is_empty());
    }

    #[test]
    fn save_then_load_preserves_rows() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CandleCache::new(dir.path().join("nested"), "ETH-USDT", "1m").unwrap();
        let series = CandleSeries::from_rows(vec![c(120, 3.0), c(0, 1.0), c(60, 2.0)]);
        cache.save(&series).unwrap();

        assert!(cache.path().ends_with("ETH-USDT_1m.json"));
        assert!(!cache.path().with_extension("json.tmp").exists());
        assert_eq!(cache.load().unwrap(), series);
    }

    #[test]
    fn file_layout_is_columnar() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CandleCache::new(dir.path(), "BTC-USDT", "1H").unwrap();
        cache
            .save(&CandleSeries::from_rows(vec![c(0, 1.0), c(3_600_000, 2.0)]))
            .unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(cache.path()).unwrap()).unwrap();
        assert_eq!(raw["ts"], serde_json::json!([0, 3_600_000]));
        assert_eq!(raw["close"], serde_json::json!([1.0, 2.0]));
        assert!(raw["volumeCcy"].is_array());
    }

    #[test]
    fn unsorted_file_is_normalised_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CandleCache::new(dir.path(), "ETH-USDT", "1m").unwrap();
        let json = r#"{"ts":[60,0,60],"open":[2,1,9],"high":[2,1,9],"low":[2,1,9],
            "close":[2,1,9],"volume":[0,0,0],"volumeCcy":[0,0,0]}"#;
        std::fs::write(cache.path(), json).unwrap();

        let series = cache.load().unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(series.as_slice()[1].close, 2.0);
    }

    #[test]
    fn mismatched_columns_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CandleCache::new(dir.path(), "ETH-USDT", "1m").unwrap();
        let json = r#"{"ts":[0,60],"open":[1],"high":[1],"low":[1],
            "close":[1],"volume":[1],"volumeCcy":[1]}"#;
        std::fs::write(cache.path(), json).unwrap();

        assert!(matches!(cache.load(), Err(CacheError::Corrupt(_))));
    }

    #[test]
    fn load_for_discards_cache_when_start_is_earlier() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CandleCache::new(dir.path(), "ETH-USDT", "1m").unwrap();
        cache
            .save(&CandleSeries::from_rows(vec![c(600, 1.0), c(660, 2.0)]))
            .unwrap();

        assert!(cache.load_for(0).unwrap().is_empty());
        assert_eq!(cache.load_for(600).unwrap().len(), 2);
        assert_eq!(cache.load_for(630).unwrap().len(), 2);
    }

    #[test]
    fn keys_that_leave_the_cache_dir_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        for (inst, bar) in [
            ("ETH-USDT", "../../../escaped"),
            ("ETH-USDT", "1m/x"),
            ("..", "1m"),
            ("ETH\\USDT", "1m"),
            ("", "1m"),
        ] {
            assert!(
                matches!(CandleCache::new(dir.path(), inst, bar), Err(CacheError::InvalidKey(_))),
                "{inst:?}/{bar:?} should be rejected"
            );
        }
        assert!(CandleCache::new(dir.path(), "BTC-USDT-SWAP", "15m").is_ok());
    }
}
