//! Virtual-Instrument Query Planner (spec.md §4.8): splits a read over a
//! virtual instrument's time range across the chain of rolled contracts,
//! shifting each contract's bars by its cumulative roll delta.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::model::{Bar, DataInstrument, RolloverStatus, Selector};
use crate::store::SqliteMetadataStore;
use crate::timeseries::{DataAggregator, InMemoryTimeSeriesGateway, Timeframe};

/// One segment of the spliced read: a contract symbol, the instant its
/// coverage ends (or the query's `to` for the last chunk), and the price
/// offset to apply to its bars.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub symbol: String,
    pub rollover_date: DateTime<Utc>,
    pub delta: f64,
}

pub struct QueryPlanner {
    store: Arc<SqliteMetadataStore>,
    gateway: Arc<InMemoryTimeSeriesGateway>,
}

impl QueryPlanner {
    pub fn new(store: Arc<SqliteMetadataStore>, gateway: Arc<InMemoryTimeSeriesGateway>) -> Self {
        QueryPlanner { store, gateway }
    }

    /// Builds the chunk list for a product's rollover chain, already
    /// delta-cumulated, without touching the time-series gateway. Exposed
    /// separately from [`read_virtual`] so the cumulation property is
    /// cheap to test in isolation.
    pub fn build_chunks(chain: &[DataInstrument], from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<Chunk> {
        let mut chunks = Vec::new();

        for instrument in chain {
            match instrument.rollover_status {
                RolloverStatus::NoMatch | RolloverStatus::NoData => continue,
                RolloverStatus::Ready => {
                    let Some(rollover_date) = instrument.rollover_date else { continue };
                    if rollover_date < from {
                        continue;
                    }
                    chunks.push(Chunk {
                        symbol: instrument.symbol.clone(),
                        rollover_date,
                        delta: instrument.rollover_delta,
                    });
                    if to <= rollover_date {
                        break;
                    }
                }
                RolloverStatus::Waiting => {
                    let rollover_date = instrument.rollover_date.unwrap_or(to);
                    chunks.push(Chunk {
                        symbol: instrument.symbol.clone(),
                        rollover_date,
                        delta: 0.0,
                    });
                    break;
                }
            }
        }

        Self::cumulate(&mut chunks);
        chunks
    }

    /// `chunks[i].delta += chunks[i+1].delta`, from the tail backward; the
    /// last chunk's delta is left as stored (spec.md §4.8 step 3).
    fn cumulate(chunks: &mut [Chunk]) {
        if chunks.len() < 2 {
            return;
        }
        for i in (0..chunks.len() - 1).rev() {
            let next_delta = chunks[i + 1].delta;
            chunks[i].delta += next_delta;
        }
    }

    /// Reads `[from, to]` for a product's virtual instrument (spec.md §4.8).
    /// Returns `None` if the chain produced no chunks — "no data",
    /// distinguishable from an empty but successful read.
    pub async fn read_virtual(
        &self,
        product_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Option<Vec<Bar>>, crate::error::StoreError> {
        let product = self.store.get_product(product_id).await?;
        let all = self.store.list_instruments_for_product(product_id).await?;
        let mut chain: Vec<DataInstrument> = all
            .into_iter()
            .filter(|i| i.is_rollable())
            .filter(|i| i.month_code.map(|m| product.allows_month(m)).unwrap_or(false))
            .collect();
        chain.sort_by_key(|i| i.expiration_date);

        let chunks = Self::build_chunks(&chain, from, to);
        if chunks.is_empty() {
            return Ok(None);
        }

        // Bars were persisted under the block's system-code, global
        // selector (spec.md §4.5 step 4), not a per-product one — a
        // virtual instrument's chain may reference a DataBlock shared
        // across products, and reading it back must use the same key.
        let selector = Selector::System(product.system_code.clone());
        let mut out = DataAggregator::passthrough();
        let last_idx = chunks.len() - 1;
        let mut cursor = from;

        for (idx, chunk) in chunks.iter().enumerate() {
            let chunk_to = if idx == last_idx { to } else { chunk.rollover_date };
            let bars = self.gateway.get_bars(&selector, &chunk.symbol, Timeframe::OneMin, cursor, chunk_to);
            for mut bar in bars {
                bar.open += chunk.delta;
                bar.high += chunk.delta;
                bar.low += chunk.delta;
                bar.close += chunk.delta;
                out.add(bar);
            }
            cursor = chunk.rollover_date + Duration::seconds(30);
        }
        out.flush();

        Ok(Some(out.into_data_points()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32) -> DateTime<Utc> {
        use chrono::NaiveDate;
        DateTime::<Utc>::from_naive_utc_and_offset(
            NaiveDate::from_ymd_opt(y, mo, d).unwrap().and_hms_opt(0, 0, 0).unwrap(),
            Utc,
        )
    }

    fn instrument(symbol: &str, status: RolloverStatus, rollover_date: Option<DateTime<Utc>>, delta: f64) -> DataInstrument {
        DataInstrument {
            id: 0,
            product_id: 1,
            data_block_id: Some(1),
            symbol: symbol.to_string(),
            display_name: symbol.to_string(),
            expiration_date: None,
            rollover_date,
            continuous: false,
            virtual_instrument: false,
            month_code: Some('H'),
            rollover_delta: delta,
            rollover_status: status,
        }
    }

    #[test]
    fn virtual_read_spanning_two_contracts_matches_the_spec_scenario() {
        let chain = vec![
            instrument("A", RolloverStatus::Ready, Some(at(2024, 6, 14)), -2.5),
            instrument("B", RolloverStatus::Ready, Some(at(2024, 9, 13)), -3.0),
            instrument("C", RolloverStatus::Waiting, Some(at(2024, 12, 13)), 0.0),
        ];

        let chunks = QueryPlanner::build_chunks(&chain, at(2024, 5, 1), at(2024, 10, 1));

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].symbol, "A");
        assert!((chunks[0].delta - (-5.5)).abs() < 1e-9);
        assert!((chunks[1].delta - (-3.0)).abs() < 1e-9);
        assert!((chunks[2].delta - 0.0).abs() < 1e-9);
    }

    #[test]
    fn cumulation_holds_for_chain_lengths_one_through_four() {
        for n in 1..=4 {
            let mut chunks: Vec<Chunk> = (0..n)
                .map(|i| Chunk {
                    symbol: format!("S{i}"),
                    rollover_date: at(2024, 1, 1 + i as u32),
                    delta: (i + 1) as f64,
                })
                .collect();
            let original: Vec<f64> = chunks.iter().map(|c| c.delta).collect();
            QueryPlanner::cumulate(&mut chunks);
            for i in 0..n - 1 {
                let expected: f64 = original[i + 1..].iter().sum();
                assert!((chunks[i].delta - expected).abs() < 1e-9);
            }
            assert_eq!(chunks[n - 1].delta, original[n - 1]);
        }
    }

    #[test]
    fn no_match_and_no_data_instruments_are_skipped() {
        let chain = vec![
            instrument("A", RolloverStatus::NoMatch, None, 0.0),
            instrument("B", RolloverStatus::Ready, Some(at(2024, 9, 13)), -1.0),
        ];
        let chunks = QueryPlanner::build_chunks(&chain, at(2024, 1, 1), at(2024, 10, 1));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].symbol, "B");
    }
}
