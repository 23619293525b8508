//! Rollover Recalculator (spec.md §4.7, §4.7.1): listens for
//! `RecalcRollover` bus events and, for the affected product, recomputes
//! roll dates and price deltas across its chain of expiring contracts.
//!
//! Grounded on the teacher's subscriber-loop shape in `main.rs`
//! (`tokio::spawn` over `rx.recv().await` on a `broadcast::Receiver`).

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::bus::{BroadcastMessageBus, BusEvent};
use crate::model::{BlockStatus, DataInstrument, IntDate, RolloverStatus, Selector};
use crate::store::SqliteMetadataStore;
use crate::timeseries::{InMemoryTimeSeriesGateway, Timeframe};

pub struct RolloverRecalculator {
    store: Arc<SqliteMetadataStore>,
    gateway: Arc<InMemoryTimeSeriesGateway>,
    bus: BroadcastMessageBus,
    sleep_defer: Duration,
}

struct RollOutcome {
    to_update: bool,
    rollover_date: Option<DateTime<Utc>>,
    rollover_delta: f64,
    rollover_status: RolloverStatus,
}

fn intdate_midnight_utc(d: IntDate) -> DateTime<Utc> {
    let naive = d.to_naive_date().expect("valid IntDate").and_hms_opt(0, 0, 0).unwrap();
    DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc)
}

/// `rollDateFor` (spec.md §4.7.1): the start of the roll window.
fn roll_date_for(expiration: IntDate, trigger: crate::model::RollTrigger) -> IntDate {
    expiration.add_days(-trigger.days())
}

impl RolloverRecalculator {
    pub fn new(
        store: Arc<SqliteMetadataStore>,
        gateway: Arc<InMemoryTimeSeriesGateway>,
        bus: BroadcastMessageBus,
        sleep_defer_hours: i64,
    ) -> Self {
        RolloverRecalculator {
            store,
            gateway,
            bus,
            sleep_defer: Duration::hours(sleep_defer_hours),
        }
    }

    /// Subscribes to the bus and recalculates on every `RecalcRollover`
    /// event until the process shuts down.
    pub async fn run(&self) {
        let mut rx = self.bus.subscribe_rollover_recalc();
        loop {
            match rx.recv().await {
                Ok(BusEvent::RecalcRollover { data_product_id, data_block_id }) => {
                    if let Err(err) = self.handle(data_product_id, data_block_id).await {
                        warn!(error = %err, "rollover recalculation failed");
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "rollover recalculator lagged behind the bus");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn handle(
        &self,
        data_product_id: Option<i64>,
        data_block_id: Option<i64>,
    ) -> Result<(), crate::error::StoreError> {
        if let Some(product_id) = data_product_id {
            return self.recalculate_product(product_id).await;
        }
        if let Some(block_id) = data_block_id {
            for product in self.store.list_products().await? {
                let instruments = self.store.list_instruments_for_product(product.id).await?;
                if instruments.iter().any(|i| i.data_block_id == Some(block_id)) {
                    self.recalculate_product(product.id).await?;
                }
            }
        }
        Ok(())
    }

    /// The per-product scan (spec.md §4.7 steps 1-4).
    pub async fn recalculate_product(&self, product_id: i64) -> Result<(), crate::error::StoreError> {
        let product = self.store.get_product(product_id).await?;
        let all_instruments = self.store.list_instruments_for_product(product_id).await?;

        let mut chain: Vec<DataInstrument> = all_instruments
            .iter()
            .filter(|i| i.is_rollable())
            .filter(|i| i.month_code.map(|m| product.allows_month(m)).unwrap_or(false))
            .cloned()
            .collect();
        chain.sort_by_key(|i| i.expiration_date);

        let selector = Selector::Product(product_id);
        let now = Utc::now();

        for idx in 0..chain.len().saturating_sub(1) {
            let curr = chain[idx].clone();
            let next = chain[idx + 1].clone();

            let needs_recompute =
                curr.rollover_date.is_none() || matches!(curr.rollover_status, RolloverStatus::NoData | RolloverStatus::NoMatch);
            if !needs_recompute {
                continue;
            }

            let Some(curr_block_id) = curr.data_block_id else { continue };
            let curr_block = self.store.get_block(curr_block_id).await?;

            let outcome = match curr_block.status {
                BlockStatus::Ready => {
                    let Some(next_block_id) = next.data_block_id else { continue };
                    let next_block = self.store.get_block(next_block_id).await?;
                    match next_block.status {
                        BlockStatus::Ready | BlockStatus::Sleeping => {
                            let expiration = curr.expiration_date.expect("rollable instrument has expiration");
                            let start_roll_date = intdate_midnight_utc(roll_date_for(expiration, product.roll_trigger));
                            self.compute_roll_delta(&selector, &curr.symbol, &next.symbol, start_roll_date, next_block.status, now)
                        }
                        BlockStatus::Empty => self.fake_no_data(&curr, &product),
                        _ => continue,
                    }
                }
                BlockStatus::Empty => self.fake_no_data(&curr, &product),
                _ => continue,
            };

            if !outcome.to_update {
                continue;
            }

            let mut updated = curr.clone();
            updated.rollover_date = outcome.rollover_date;
            updated.rollover_delta = outcome.rollover_delta;
            updated.rollover_status = outcome.rollover_status;
            self.store.upsert_instrument(&updated).await?;
            chain[idx] = updated;
        }

        self.finalize_virtual_status(&product, &all_instruments, &chain).await
    }

    fn fake_no_data(&self, curr: &DataInstrument, product: &crate::model::DataProduct) -> RollOutcome {
        let expiration = curr.expiration_date.expect("rollable instrument has expiration");
        RollOutcome {
            to_update: true,
            rollover_date: Some(intdate_midnight_utc(roll_date_for(expiration, product.roll_trigger))),
            rollover_delta: 0.0,
            rollover_status: RolloverStatus::NoData,
        }
    }

    /// Walks aligned 60m bars for `curr` and `next` from `start_roll_date`
    /// for 5 days, matching instants and reading the roll row as the first
    /// `next` bar strictly after the alignment point (spec.md §4.7.1).
    fn compute_roll_delta(
        &self,
        selector: &Selector,
        curr_symbol: &str,
        next_symbol: &str,
        start_roll_date: DateTime<Utc>,
        next_block_status: BlockStatus,
        now: DateTime<Utc>,
    ) -> RollOutcome {
        if next_block_status == BlockStatus::Sleeping && now - start_roll_date < self.sleep_defer {
            return RollOutcome {
                to_update: false,
                rollover_date: None,
                rollover_delta: 0.0,
                rollover_status: RolloverStatus::Waiting,
            };
        }

        let window_end = start_roll_date + Duration::days(5);
        let curr_bars = self.gateway.get_bars(selector, curr_symbol, Timeframe::SixtyMin, start_roll_date, window_end);
        let next_bars = self.gateway.get_bars(selector, next_symbol, Timeframe::SixtyMin, start_roll_date, window_end);

        let mut i = 0usize;
        let mut j = 0usize;
        while i < curr_bars.len() && j < next_bars.len() {
            match curr_bars[i].instant.cmp(&next_bars[j].instant) {
                Ordering::Equal => {
                    if let Some(roll_bar) = next_bars.get(j + 1) {
                        return RollOutcome {
                            to_update: true,
                            rollover_date: Some(roll_bar.instant),
                            rollover_delta: roll_bar.open - curr_bars[i].close,
                            rollover_status: RolloverStatus::Ready,
                        };
                    }
                    break;
                }
                Ordering::Less => i += 1,
                Ordering::Greater => j += 1,
            }
        }

        RollOutcome {
            to_update: true,
            rollover_date: Some(start_roll_date),
            rollover_delta: 0.0,
            rollover_status: RolloverStatus::NoMatch,
        }
    }

    /// Once every block in the chain has settled, sets the virtual
    /// instrument's status and publishes the corresponding user event
    /// (spec.md §4.7 step 4).
    async fn finalize_virtual_status(
        &self,
        product: &crate::model::DataProduct,
        all_instruments: &[DataInstrument],
        chain: &[DataInstrument],
    ) -> Result<(), crate::error::StoreError> {
        let mut all_settled = true;
        let mut any_empty = false;
        let mut any_no_match = false;

        for instrument in chain {
            if let Some(block_id) = instrument.data_block_id {
                let block = self.store.get_block(block_id).await?;
                match block.status {
                    BlockStatus::Ready | BlockStatus::Sleeping => {}
                    BlockStatus::Empty => any_empty = true,
                    _ => all_settled = false,
                }
            }
            if instrument.rollover_status == RolloverStatus::NoMatch {
                any_no_match = true;
            }
        }

        if !all_settled {
            return Ok(());
        }

        let Some(virtual_instrument) = all_instruments.iter().find(|i| i.virtual_instrument) else {
            return Ok(());
        };

        let (status, event) = if any_empty {
            (RolloverStatus::NoData, BusEvent::DataProductReadyEmpty { product_id: product.id })
        } else if any_no_match {
            (RolloverStatus::NoMatch, BusEvent::DataProductReadyNoMatch { product_id: product.id })
        } else {
            (RolloverStatus::Ready, BusEvent::DataProductReady { product_id: product.id })
        };

        let mut updated = virtual_instrument.clone();
        updated.rollover_status = status;
        self.store.upsert_instrument(&updated).await?;
        info!(product_id = product.id, status = %status, "rollover chain settled");
        self.bus.publish(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Bar;

    fn bar(instant: DateTime<Utc>, open: f64, close: f64) -> Bar {
        Bar {
            instant,
            open,
            high: open.max(close),
            low: open.min(close),
            close,
            up_volume: 0.0,
            down_volume: 0.0,
            up_ticks: 0,
            down_ticks: 0,
            open_interest: 0.0,
        }
    }

    fn at(y: i32, mo: u32, d: u32, h: u32) -> DateTime<Utc> {
        use chrono::NaiveDate;
        DateTime::<Utc>::from_naive_utc_and_offset(
            NaiveDate::from_ymd_opt(y, mo, d).unwrap().and_hms_opt(h, 0, 0).unwrap(),
            Utc,
        )
    }

    #[tokio::test]
    async fn roll_delta_matches_the_spec_scenario() {
        let store = Arc::new(SqliteMetadataStore::open(":memory:").unwrap());
        let gateway = Arc::new(InMemoryTimeSeriesGateway::default());
        let bus = BroadcastMessageBus::new();
        let recalc = RolloverRecalculator::new(store, gateway.clone(), bus, 8);

        let selector = Selector::Product(1);
        gateway
            .set_bars(
                &selector,
                "curr",
                Timeframe::SixtyMin,
                &[bar(at(2024, 3, 10, 10), 100.0, 100.0), bar(at(2024, 3, 10, 11), 101.0, 101.0)],
            )
            .unwrap();
        gateway
            .set_bars(
                &selector,
                "next",
                Timeframe::SixtyMin,
                &[
                    bar(at(2024, 3, 10, 10), 200.0, 200.0),
                    bar(at(2024, 3, 10, 11), 210.0, 210.0),
                    bar(at(2024, 3, 10, 12), 215.0, 220.0),
                ],
            )
            .unwrap();

        let outcome = recalc.compute_roll_delta(
            &selector,
            "curr",
            "next",
            at(2024, 3, 10, 10),
            BlockStatus::Ready,
            at(2024, 3, 15, 0),
        );

        assert!(outcome.to_update);
        assert_eq!(outcome.rollover_status, RolloverStatus::Ready);
        assert_eq!(outcome.rollover_date.unwrap(), at(2024, 3, 10, 12));
        assert!((outcome.rollover_delta - 114.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn sleeping_within_defer_window_does_not_update() {
        let store = Arc::new(SqliteMetadataStore::open(":memory:").unwrap());
        let gateway = Arc::new(InMemoryTimeSeriesGateway::default());
        let bus = BroadcastMessageBus::new();
        let recalc = RolloverRecalculator::new(store, gateway, bus, 8);

        let selector = Selector::Product(1);
        let start = at(2024, 3, 10, 10);
        let outcome = recalc.compute_roll_delta(&selector, "curr", "next", start, BlockStatus::Sleeping, start + Duration::hours(2));
        assert!(!outcome.to_update);
    }
}
