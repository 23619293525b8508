//! Inventory Loader (spec.md §4.6): a 10s periodic control loop that
//! promotes a newly-connected product from `FetchingInventory` to
//! `FetchingData` by discovering its instrument set and materialising the
//! data-blocks and download jobs needed to fetch it.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{info, warn};

use crate::adapter::PlatformAdapterClient;
use crate::bus::{BroadcastMessageBus, BusEvent};
use crate::cache::{InventoryCache, ScheduledJob};
use crate::error::StoreError;
use crate::model::{BlockStatus, DataBlock, DataInstrument, DataProduct, DownloadJob, ProductStatus, RolloverStatus};
use crate::store::SqliteMetadataStore;

pub struct InventoryLoader<A: PlatformAdapterClient + 'static> {
    store: Arc<SqliteMetadataStore>,
    cache: Arc<InventoryCache>,
    bus: BroadcastMessageBus,
    adapter: Arc<A>,
    tick: Duration,
}

impl<A: PlatformAdapterClient + 'static> InventoryLoader<A> {
    pub fn new(
        store: Arc<SqliteMetadataStore>,
        cache: Arc<InventoryCache>,
        bus: BroadcastMessageBus,
        adapter: Arc<A>,
        tick: Duration,
    ) -> Self {
        InventoryLoader { store, cache, bus, adapter, tick }
    }

    pub async fn run(&self) {
        let mut ticker = interval(self.tick);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once().await {
                warn!(error = %err, "inventory loader pass failed");
            }
        }
    }

    /// One discovery pass: every product awaiting single-feed inventory
    /// discovery gets its instruments enumerated and materialised.
    /// Re-running for the same product MUST NOT duplicate anything.
    pub async fn run_once(&self) -> Result<(), StoreError> {
        let candidates: Vec<DataProduct> = self
            .store
            .list_products()
            .await?
            .into_iter()
            .filter(|p| !p.supports_multiple_data && p.connected && p.status == ProductStatus::FetchingInventory)
            .collect();

        for product in candidates {
            if let Err(err) = self.discover_product(&product).await {
                warn!(product_id = product.id, error = %err, "instrument discovery failed, will retry next tick");
            }
        }
        Ok(())
    }

    async fn discover_product(&self, product: &DataProduct) -> Result<(), StoreError> {
        let upstream = match self
            .adapter
            .list_instruments(&product.owner, &product.connection_code, &product.root_symbol)
            .await
        {
            Ok(instruments) => instruments,
            Err(err) => {
                warn!(product_id = product.id, error = %err, "ListInstruments failed");
                return Ok(());
            }
        };

        let mut any_new_job = false;
        let existing = self.store.list_instruments_for_product(product.id).await?;

        for upstream_instrument in &upstream {
            if existing.iter().any(|e| e.symbol == upstream_instrument.symbol) {
                continue;
            }

            let mut instrument = DataInstrument {
                id: 0,
                product_id: product.id,
                data_block_id: None,
                symbol: upstream_instrument.symbol.clone(),
                display_name: upstream_instrument.description.clone(),
                expiration_date: upstream_instrument.expiration_date,
                rollover_date: None,
                continuous: upstream_instrument.continuous,
                virtual_instrument: false,
                month_code: upstream_instrument.month_code,
                rollover_delta: 0.0,
                rollover_status: RolloverStatus::Waiting,
            };

            let is_rollable_candidate = !upstream_instrument.continuous
                && upstream_instrument
                    .month_code
                    .map(|m| product.allows_month(m))
                    .unwrap_or(false);

            if is_rollable_candidate {
                let block = self.get_or_create_global_block(product, &upstream_instrument.symbol).await?;
                instrument.data_block_id = Some(block.id);
                let instrument_id = self.store.upsert_instrument(&instrument).await?;

                let expiration = upstream_instrument
                    .expiration_date
                    .expect("non-continuous instrument has an expiration date");
                let load_from = expiration.add_days(-180);
                let job = DownloadJob::new_for_span(instrument_id, block.id, load_from, expiration, 0);
                let job_id = self.store.upsert_job(&job).await?;

                self.cache.add_data_block(&product.system_code, product.id, block.clone());
                self.cache.add_scheduled_job(
                    &product.system_code,
                    ScheduledJob {
                        job_id,
                        instrument_id,
                        block_id: block.id,
                        priority: 0,
                        curr_day: 0,
                        user_connection: String::new(),
                        last_error: None,
                    },
                );
                any_new_job = true;
            } else {
                self.store.upsert_instrument(&instrument).await?;
            }
        }

        self.ensure_virtual_instrument(product).await?;

        let mut updated = product.clone();
        updated.status = ProductStatus::FetchingData;
        self.store.upsert_product(&updated).await?;

        if !any_new_job {
            self.bus.publish(BusEvent::RecalcRollover {
                data_product_id: Some(product.id),
                data_block_id: None,
            });
        }

        info!(product_id = product.id, new_instruments = upstream.len(), "inventory discovery pass complete");
        Ok(())
    }

    async fn get_or_create_global_block(&self, product: &DataProduct, symbol: &str) -> Result<DataBlock, StoreError> {
        if let Some(block) = self
            .store
            .find_block(&product.system_code, &product.root_symbol, symbol, true)
            .await?
        {
            return Ok(block);
        }
        let block = DataBlock {
            id: 0,
            system_code: product.system_code.clone(),
            root: product.root_symbol.clone(),
            symbol: symbol.to_string(),
            status: BlockStatus::Waiting,
            global: true,
            data_from_day: None,
            data_to_day: None,
            progress: 0,
        };
        let id = self.store.upsert_block(&block).await?;
        Ok(DataBlock { id, ..block })
    }

    /// Creates the product's virtual continuous instrument iff it has any
    /// rollable instrument and none exists yet (spec.md §3 invariant: at
    /// most one virtual instrument per product).
    async fn ensure_virtual_instrument(&self, product: &DataProduct) -> Result<(), StoreError> {
        let refreshed = self.store.list_instruments_for_product(product.id).await?;
        if refreshed.iter().any(|i| i.virtual_instrument) {
            return Ok(());
        }
        if !refreshed.iter().any(|i| i.is_rollable()) {
            return Ok(());
        }

        let virtual_instrument = DataInstrument {
            id: 0,
            product_id: product.id,
            data_block_id: None,
            symbol: format!("#{}", product.root_symbol),
            display_name: format!("#{}", product.root_symbol),
            expiration_date: None,
            rollover_date: None,
            continuous: true,
            virtual_instrument: true,
            month_code: None,
            rollover_delta: 0.0,
            rollover_status: RolloverStatus::Waiting,
        };
        self.store.upsert_instrument(&virtual_instrument).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::FakeAdapterClient;
    use crate::model::{IntDate, RollTrigger, UpstreamInstrument};

    fn test_product() -> DataProduct {
        DataProduct {
            id: 0,
            owner: "acct-1".into(),
            system_code: "CME".into(),
            connection_code: "conn-1".into(),
            root_symbol: "ES".into(),
            supports_multiple_data: false,
            connected: true,
            exchange_timezone: "America/Chicago".into(),
            status: ProductStatus::FetchingInventory,
            allowed_months: "HMUZ".into(),
            roll_trigger: RollTrigger::SD4,
        }
    }

    #[tokio::test]
    async fn discovery_creates_block_job_and_virtual_instrument() {
        let store = Arc::new(SqliteMetadataStore::open(":memory:").unwrap());
        let cache = Arc::new(InventoryCache::new());
        let bus = BroadcastMessageBus::new();
        let adapter = Arc::new(FakeAdapterClient::new());
        adapter.seed_instruments(
            "ES",
            vec![UpstreamInstrument {
                symbol: "ESH24".into(),
                description: "E-mini S&P March 2024".into(),
                expiration_date: Some(IntDate(20240315)),
                point_value: 50.0,
                min_move: 0.25,
                continuous: false,
                month_code: Some('H'),
            }],
        );

        let mut product = test_product();
        let id = store.upsert_product(&product).await.unwrap();
        product.id = id;

        let loader = InventoryLoader::new(store.clone(), cache.clone(), bus, adapter, Duration::from_secs(10));
        loader.run_once().await.unwrap();

        let instruments = store.list_instruments_for_product(id).await.unwrap();
        assert_eq!(instruments.len(), 2);
        assert!(instruments.iter().any(|i| i.symbol == "ESH24"));
        assert!(instruments.iter().any(|i| i.virtual_instrument));

        let product_after = store.get_product(id).await.unwrap();
        assert_eq!(product_after.status, ProductStatus::FetchingData);

        let waiting = cache.waiting_jobs();
        assert_eq!(waiting.len(), 1);
    }

    #[tokio::test]
    async fn rerunning_discovery_does_not_duplicate_anything() {
        let store = Arc::new(SqliteMetadataStore::open(":memory:").unwrap());
        let cache = Arc::new(InventoryCache::new());
        let bus = BroadcastMessageBus::new();
        let adapter = Arc::new(FakeAdapterClient::new());
        adapter.seed_instruments(
            "ES",
            vec![UpstreamInstrument {
                symbol: "ESH24".into(),
                description: "E-mini S&P March 2024".into(),
                expiration_date: Some(IntDate(20240315)),
                point_value: 50.0,
                min_move: 0.25,
                continuous: false,
                month_code: Some('H'),
            }],
        );

        let mut product = test_product();
        let id = store.upsert_product(&product).await.unwrap();
        product.id = id;

        let loader = InventoryLoader::new(store.clone(), cache.clone(), bus, adapter, Duration::from_secs(10));
        loader.run_once().await.unwrap();
        // Status is now FetchingData, so a second pass must find nothing to do.
        loader.run_once().await.unwrap();

        let instruments = store.list_instruments_for_product(id).await.unwrap();
        assert_eq!(instruments.len(), 2);
        let jobs = store.list_jobs_by_status(crate::model::JobStatus::Waiting).await.unwrap();
        assert_eq!(jobs.len(), 1);
    }
}
