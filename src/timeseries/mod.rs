//! In-memory time-series gateway (SPEC_FULL.md §4.11), standing in for the
//! out-of-scope external time-series store (spec.md §4.1, §9).
//!
//! `DataAggregator` is the streaming re-bucketer from spec.md §4.9: bars are
//! fed in ascending order, a slot function maps each instant onto its
//! bucket boundary, and same-bucket bars merge OHLC-wise. `BuildAggregates`
//! chains 5m -> 15m -> 60m -> 1440m, each level consuming the prior level's
//! output through a fresh aggregator.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Timelike, Utc};
use parking_lot::RwLock;

use crate::error::TimeSeriesError;
use crate::model::{Bar, Selector};

/// Timeframes the gateway stores (spec.md §4.1, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timeframe {
    OneMin,
    FiveMin,
    FifteenMin,
    SixtyMin,
    Daily1440,
}

impl Timeframe {
    pub fn minutes(self) -> i64 {
        match self {
            Timeframe::OneMin => 1,
            Timeframe::FiveMin => 5,
            Timeframe::FifteenMin => 15,
            Timeframe::SixtyMin => 60,
            Timeframe::Daily1440 => 1440,
        }
    }
}

type SlotFn = Arc<dyn Fn(DateTime<Utc>) -> DateTime<Utc> + Send + Sync>;

/// Rounds an instant up to the next multiple-of-`window_minutes` boundary;
/// an instant already sitting on a boundary maps to itself.
fn minute_window_slot(window_minutes: i64) -> SlotFn {
    Arc::new(move |t: DateTime<Utc>| {
        let base = t
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(t);
        if t.second() == 0 && t.nanosecond() == 0 && (t.minute() as i64) % window_minutes == 0 {
            return base;
        }
        let rem = (t.minute() as i64) % window_minutes;
        base + Duration::minutes(window_minutes - rem)
    })
}

/// Rounds an instant up to the next calendar-day boundary in a fixed
/// offset-from-UTC "product timezone" (spec.md §3 `exchange_timezone`).
/// A fixed offset, rather than a full tz database lookup, is the deliberate
/// simplification recorded in DESIGN.md — the teacher carries no
/// `chrono-tz` dependency.
fn daily_slot(tz_offset_minutes: i32) -> SlotFn {
    Arc::new(move |t: DateTime<Utc>| {
        let offset = Duration::minutes(tz_offset_minutes as i64);
        let local = t.naive_utc() + offset;
        let local_midnight = local.date().and_hms_opt(0, 0, 0).expect("midnight is valid");
        let slot_local = if local == local_midnight {
            local_midnight
        } else {
            local
                .date()
                .succ_opt()
                .expect("day after a valid date is valid")
                .and_hms_opt(0, 0, 0)
                .expect("midnight is valid")
        };
        DateTime::<Utc>::from_naive_utc_and_offset(slot_local - offset, Utc)
    })
}

/// Streaming re-bucketer (spec.md §4.9). Feed bars in ascending instant
/// order via [`DataAggregator::add`]; call [`DataAggregator::flush`] when
/// the source is exhausted to emit the trailing partial bucket.
pub struct DataAggregator {
    slot_fn: Option<SlotFn>,
    current: Option<Bar>,
    current_slot: Option<DateTime<Utc>>,
    out: Vec<Bar>,
}

impl DataAggregator {
    /// No bucketing: every input bar is emitted unchanged. Used when the
    /// source timeframe already matches the requested one.
    pub fn passthrough() -> Self {
        DataAggregator {
            slot_fn: None,
            current: None,
            current_slot: None,
            out: Vec::new(),
        }
    }

    pub fn for_timeframe(tf: Timeframe, tz_offset_minutes: i32) -> Self {
        let slot_fn = match tf {
            Timeframe::OneMin => None,
            Timeframe::FiveMin | Timeframe::FifteenMin | Timeframe::SixtyMin => {
                Some(minute_window_slot(tf.minutes()))
            }
            Timeframe::Daily1440 => Some(daily_slot(tz_offset_minutes)),
        };
        DataAggregator {
            slot_fn,
            current: None,
            current_slot: None,
            out: Vec::new(),
        }
    }

    pub fn add(&mut self, bar: Bar) {
        let Some(slot_fn) = self.slot_fn.clone() else {
            self.out.push(bar);
            return;
        };
        let slot = slot_fn(bar.instant);
        match (self.current.as_mut(), self.current_slot) {
            (Some(cur), Some(cur_slot)) if cur_slot == slot => {
                cur.high = cur.high.max(bar.high);
                cur.low = cur.low.min(bar.low);
                cur.close = bar.close;
                cur.up_volume += bar.up_volume;
                cur.down_volume += bar.down_volume;
                cur.up_ticks += bar.up_ticks;
                cur.down_ticks += bar.down_ticks;
                cur.open_interest = bar.open_interest;
            }
            _ => {
                self.flush();
                let mut seeded = bar;
                seeded.instant = slot;
                self.current = Some(seeded);
                self.current_slot = Some(slot);
            }
        }
    }

    /// Emits the in-progress bucket, if any.
    pub fn flush(&mut self) {
        if let Some(bar) = self.current.take() {
            self.out.push(bar);
        }
        self.current_slot = None;
    }

    pub fn data_points(&self) -> &[Bar] {
        &self.out
    }

    pub fn into_data_points(mut self) -> Vec<Bar> {
        self.flush();
        self.out
    }

    /// Feeds this aggregator's accumulated bars into `dst`, then flushes
    /// `dst` — the chaining step `BuildAggregates` repeats per level.
    pub fn aggregate(&mut self, dst: &mut DataAggregator) {
        self.flush();
        for bar in self.out.drain(..) {
            dst.add(bar);
        }
        dst.flush();
    }
}

type SeriesKey = (Selector, String, Timeframe);

const DEFAULT_BATCH_ROWS: usize = 8192;

/// In-memory stand-in for the external time-series store the Runner and
/// Query Planner read from and write to (spec.md §4.1). Keyed by selector,
/// instrument symbol, and timeframe; ordered by instant within a series so
/// range reads and virtual-instrument splicing stay cheap.
pub struct InMemoryTimeSeriesGateway {
    data: RwLock<HashMap<SeriesKey, BTreeMap<DateTime<Utc>, Bar>>>,
    batch_rows: usize,
}

impl Default for InMemoryTimeSeriesGateway {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_ROWS)
    }
}

impl InMemoryTimeSeriesGateway {
    /// `batch_rows` caps how many rows a single `set_bars` upsert writes at
    /// once (spec.md §5: "writes batch up to 8192 rows").
    pub fn new(batch_rows: usize) -> Self {
        InMemoryTimeSeriesGateway {
            data: RwLock::new(HashMap::new()),
            batch_rows: batch_rows.max(1),
        }
    }

    /// Upserts a batch atomically per chunk; an incoming bar overwrites
    /// whatever already occupied its instant (spec.md §4.1 `SetBars`).
    pub fn set_bars(
        &self,
        selector: &Selector,
        symbol: &str,
        tf: Timeframe,
        bars: &[Bar],
    ) -> Result<(), TimeSeriesError> {
        for chunk in bars.chunks(self.batch_rows) {
            let mut data = self.data.write();
            let key = (selector.clone(), symbol.to_string(), tf);
            let series = data.entry(key).or_default();
            for bar in chunk {
                series.insert(bar.instant, *bar);
            }
        }
        Ok(())
    }

    /// Returns bars in `[from, to]`, ascending (spec.md §4.1 `GetBars`).
    pub fn get_bars(
        &self,
        selector: &Selector,
        symbol: &str,
        tf: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<Bar> {
        let data = self.data.read();
        let key = (selector.clone(), symbol.to_string(), tf);
        data.get(&key)
            .map(|series| series.range(from..=to).map(|(_, b)| *b).collect())
            .unwrap_or_default()
    }

    /// Reads a range and streams it through `agg`, flushing at the end —
    /// the read-side counterpart of the write-side `Add` loop.
    pub fn get_bars_into(
        &self,
        selector: &Selector,
        symbol: &str,
        tf: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        agg: &mut DataAggregator,
    ) {
        for bar in self.get_bars(selector, symbol, tf, from, to) {
            agg.add(bar);
        }
        agg.flush();
    }

    /// Persists `five_min_bars` and cascades 15m/60m/1440m aggregates from
    /// them, persisting each level before deriving the next (spec.md §4.9).
    pub fn build_aggregates(
        &self,
        selector: &Selector,
        symbol: &str,
        tz_offset_minutes: i32,
        five_min_bars: &[Bar],
    ) -> Result<(), TimeSeriesError> {
        self.set_bars(selector, symbol, Timeframe::FiveMin, five_min_bars)?;

        let mut source = five_min_bars.to_vec();
        for tf in [Timeframe::FifteenMin, Timeframe::SixtyMin, Timeframe::Daily1440] {
            let mut agg = DataAggregator::for_timeframe(tf, tz_offset_minutes);
            for bar in &source {
                agg.add(*bar);
            }
            let derived = agg.into_data_points();
            self.set_bars(selector, symbol, tf, &derived)?;
            source = derived;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(instant: DateTime<Utc>, close: f64) -> Bar {
        Bar {
            instant,
            open: close,
            high: close,
            low: close,
            close,
            up_volume: 1.0,
            down_volume: 0.0,
            up_ticks: 1,
            down_ticks: 0,
            open_interest: 0.0,
        }
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        use chrono::NaiveDate;
        DateTime::<Utc>::from_naive_utc_and_offset(
            NaiveDate::from_ymd_opt(y, mo, d)
                .unwrap()
                .and_hms_opt(h, mi, 0)
                .unwrap(),
            Utc,
        )
    }

    #[test]
    fn five_minute_aggregation_merges_same_bucket_bars() {
        let mut agg = DataAggregator::for_timeframe(Timeframe::FiveMin, 0);
        agg.add(bar(at(2024, 1, 2, 9, 31), 100.0));
        agg.add(bar(at(2024, 1, 2, 9, 32), 101.0));
        agg.add(bar(at(2024, 1, 2, 9, 34), 99.0));
        agg.add(bar(at(2024, 1, 2, 9, 36), 102.0));
        let out = agg.into_data_points();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].instant, at(2024, 1, 2, 9, 35));
        assert_eq!(out[0].close, 99.0);
        assert_eq!(out[0].high, 101.0);
        assert_eq!(out[1].instant, at(2024, 1, 2, 9, 40));
    }

    #[test]
    fn minute_zero_on_boundary_is_identity() {
        let mut agg = DataAggregator::for_timeframe(Timeframe::FiveMin, 0);
        agg.add(bar(at(2024, 1, 2, 9, 30), 50.0));
        let out = agg.into_data_points();
        assert_eq!(out[0].instant, at(2024, 1, 2, 9, 30));
    }

    #[test]
    fn build_aggregates_persists_all_four_levels() {
        let gw = InMemoryTimeSeriesGateway::default();
        let selector = Selector::System("CME".to_string());
        let bars: Vec<Bar> = (0..24)
            .map(|i| bar(at(2024, 1, 2, 0, 0) + Duration::minutes(i * 5), i as f64))
            .collect();
        gw.build_aggregates(&selector, "ESH24", 0, &bars).unwrap();

        assert_eq!(gw.get_bars(&selector, "ESH24", Timeframe::FiveMin, at(2024, 1, 1, 0, 0), at(2024, 1, 3, 0, 0)).len(), 24);
        assert!(!gw.get_bars(&selector, "ESH24", Timeframe::SixtyMin, at(2024, 1, 1, 0, 0), at(2024, 1, 3, 0, 0)).is_empty());
        assert!(!gw.get_bars(&selector, "ESH24", Timeframe::Daily1440, at(2024, 1, 1, 0, 0), at(2024, 1, 3, 0, 0)).is_empty());
    }

    #[test]
    fn set_bars_upsert_overwrites_same_instant() {
        let gw = InMemoryTimeSeriesGateway::default();
        let selector = Selector::Product(7);
        gw.set_bars(&selector, "CLH24", Timeframe::OneMin, &[bar(at(2024, 1, 2, 9, 0), 10.0)])
            .unwrap();
        gw.set_bars(&selector, "CLH24", Timeframe::OneMin, &[bar(at(2024, 1, 2, 9, 0), 20.0)])
            .unwrap();
        let out = gw.get_bars(&selector, "CLH24", Timeframe::OneMin, at(2024, 1, 1, 0, 0), at(2024, 1, 3, 0, 0));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].close, 20.0);
    }
}
