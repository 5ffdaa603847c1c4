// =============================================================================
// Indicator Engine — per-series ring buffers and derived values
// =============================================================================
//
// A pure function of the candle stream. The market-data hub is the single
// writer (one call per candle frame); every reader takes an immutable copy of
// the ring contents at query time.
//
// The upstream feed re-sends the in-progress candle on every tick; a candle
// only enters the rings once a later open-time proves it closed.
//
// Periods are restricted to fixed allow-lists so the rings can be sized
// statically against the longest window in use.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::indicators::atr::current_atr;
use crate::indicators::bollinger::{current_bollinger, BollingerBands};
use crate::indicators::ema::current_ema;
use crate::indicators::macd::{current_macd, MacdValue};
use crate::indicators::ring::RingBuffer;
use crate::indicators::rsi::current_rsi;
use crate::indicators::sma::current_sma;
use crate::market_data::frames::CandleFrame;

/// Ring capacity; must cover the longest indicator window (SMA 200).
pub const RING_CAPACITY: usize = 500;

pub const RSI_PERIOD: usize = 14;
pub const ATR_PERIOD: usize = 14;
pub const BOLLINGER_PERIOD: usize = 20;
pub const BOLLINGER_STD: f64 = 2.0;
pub const VOLUME_SMA_PERIOD: usize = 20;
pub const MACD_FAST: usize = 12;
pub const MACD_SLOW: usize = 26;
pub const MACD_SIGNAL: usize = 9;

pub const SMA_PERIODS: [usize; 3] = [20, 50, 200];
pub const EMA_PERIODS: [usize; 5] = [9, 12, 20, 26, 50];

// ---------------------------------------------------------------------------
// Keys and snapshots
// ---------------------------------------------------------------------------

/// Identifies one candle series: canonical coin + interval.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SeriesKey {
    pub coin: String,
    pub interval: String,
}

impl SeriesKey {
    pub fn new(coin: impl Into<String>, interval: impl Into<String>) -> Self {
        Self {
            coin: coin.into(),
            interval: interval.into(),
        }
    }
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.coin, self.interval)
    }
}

/// Indicator selector used by trigger specs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorKind {
    Rsi,
    Sma,
    Ema,
    MacdHistogram,
    Atr,
    BollingerWidth,
    VolumeSma,
    Price,
}

/// All derived values for one series, assembled for prompts and snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub last_close: Option<f64>,
    pub rsi_14: Option<f64>,
    pub sma_20: Option<f64>,
    pub sma_50: Option<f64>,
    pub sma_200: Option<f64>,
    pub ema_12: Option<f64>,
    pub ema_26: Option<f64>,
    pub macd: Option<MacdValue>,
    pub atr_14: Option<f64>,
    pub bollinger: Option<BollingerBands>,
    pub volume_sma_20: Option<f64>,
    pub candle_count: usize,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct SeriesBuffers {
    close: RingBuffer,
    high: RingBuffer,
    low: RingBuffer,
    volume: RingBuffer,
    /// Latest in-progress candle; promoted into the rings when a frame with a
    /// later open time arrives.
    pending: Option<CandleFrame>,
}

impl SeriesBuffers {
    fn new() -> Self {
        Self {
            close: RingBuffer::new(RING_CAPACITY),
            high: RingBuffer::new(RING_CAPACITY),
            low: RingBuffer::new(RING_CAPACITY),
            volume: RingBuffer::new(RING_CAPACITY),
            pending: None,
        }
    }

    fn promote(&mut self, candle: &CandleFrame) {
        self.close.push(candle.close);
        self.high.push(candle.high);
        self.low.push(candle.low);
        self.volume.push(candle.volume);
    }
}

/// Thread-safe indicator state for every tracked series.
pub struct IndicatorEngine {
    buffers: RwLock<HashMap<SeriesKey, SeriesBuffers>>,
}

impl Default for IndicatorEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl IndicatorEngine {
    pub fn new() -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
        }
    }

    /// Ingest one candle frame. In-progress updates replace the pending
    /// candle; a later open time closes and promotes the previous one. Frames
    /// older than the pending candle are dropped as stale.
    pub fn on_candle(&self, frame: &CandleFrame) {
        let key = SeriesKey::new(frame.symbol.clone(), frame.interval.clone());
        let mut map = self.buffers.write();
        let series = map.entry(key.clone()).or_insert_with(SeriesBuffers::new);

        match &series.pending {
            Some(pending) if frame.open_time_ms > pending.open_time_ms => {
                let closed = pending.clone();
                series.promote(&closed);
                debug!(series = %key, close = closed.close, "candle closed");
                series.pending = Some(frame.clone());
            }
            Some(pending) if frame.open_time_ms < pending.open_time_ms => {
                debug!(series = %key, "stale candle frame dropped");
            }
            _ => {
                series.pending = Some(frame.clone());
            }
        }
    }

    /// Number of closed candles stored for a series.
    pub fn candle_count(&self, key: &SeriesKey) -> usize {
        self.buffers
            .read()
            .get(key)
            .map_or(0, |s| s.close.len())
    }

    /// Close of the most recent closed candle.
    pub fn last_close(&self, key: &SeriesKey) -> Option<f64> {
        self.buffers.read().get(key).and_then(|s| s.close.last())
    }

    /// The last `count` closes in chronological order.
    pub fn closes(&self, key: &SeriesKey, count: usize) -> Vec<f64> {
        let map = self.buffers.read();
        match map.get(key) {
            Some(series) => {
                let values = series.close.values();
                let start = values.len().saturating_sub(count);
                values[start..].to_vec()
            }
            None => Vec::new(),
        }
    }

    pub fn rsi(&self, key: &SeriesKey) -> Option<f64> {
        current_rsi(&self.closes_all(key)?, RSI_PERIOD)
    }

    /// SMA for a period in the configured allow-list; `None` otherwise.
    pub fn sma(&self, key: &SeriesKey, period: usize) -> Option<f64> {
        if !SMA_PERIODS.contains(&period) {
            return None;
        }
        current_sma(&self.closes_all(key)?, period)
    }

    /// EMA for a period in the configured allow-list; `None` otherwise.
    pub fn ema(&self, key: &SeriesKey, period: usize) -> Option<f64> {
        if !EMA_PERIODS.contains(&period) {
            return None;
        }
        current_ema(&self.closes_all(key)?, period)
    }

    pub fn macd(&self, key: &SeriesKey) -> Option<MacdValue> {
        current_macd(&self.closes_all(key)?, MACD_FAST, MACD_SLOW, MACD_SIGNAL)
    }

    pub fn atr(&self, key: &SeriesKey) -> Option<f64> {
        let map = self.buffers.read();
        let series = map.get(key)?;
        current_atr(
            &series.high.values(),
            &series.low.values(),
            &series.close.values(),
            ATR_PERIOD,
        )
    }

    pub fn bollinger(&self, key: &SeriesKey) -> Option<BollingerBands> {
        current_bollinger(&self.closes_all(key)?, BOLLINGER_PERIOD, BOLLINGER_STD)
    }

    pub fn volume_sma(&self, key: &SeriesKey) -> Option<f64> {
        let map = self.buffers.read();
        let series = map.get(key)?;
        current_sma(&series.volume.values(), VOLUME_SMA_PERIOD)
    }

    /// Generic accessor used by trigger supervisors.
    pub fn value(&self, key: &SeriesKey, kind: IndicatorKind, period: usize) -> Option<f64> {
        match kind {
            IndicatorKind::Rsi => self.rsi(key),
            IndicatorKind::Sma => self.sma(key, period),
            IndicatorKind::Ema => self.ema(key, period),
            IndicatorKind::MacdHistogram => self.macd(key).map(|m| m.histogram),
            IndicatorKind::Atr => self.atr(key),
            IndicatorKind::BollingerWidth => self.bollinger(key).map(|b| b.width),
            IndicatorKind::VolumeSma => self.volume_sma(key),
            IndicatorKind::Price => self.last_close(key),
        }
    }

    /// Full snapshot for prompt assembly and the state feed.
    pub fn snapshot(&self, key: &SeriesKey) -> IndicatorSnapshot {
        IndicatorSnapshot {
            last_close: self.last_close(key),
            rsi_14: self.rsi(key),
            sma_20: self.sma(key, 20),
            sma_50: self.sma(key, 50),
            sma_200: self.sma(key, 200),
            ema_12: self.ema(key, 12),
            ema_26: self.ema(key, 26),
            macd: self.macd(key),
            atr_14: self.atr(key),
            bollinger: self.bollinger(key),
            volume_sma_20: self.volume_sma(key),
            candle_count: self.candle_count(key),
        }
    }

    fn closes_all(&self, key: &SeriesKey) -> Option<Vec<f64>> {
        let map = self.buffers.read();
        Some(map.get(key)?.close.values())
    }
}
