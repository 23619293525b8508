//! Download Job Runner (spec.md §4.5): once the scheduler matches a job to
//! a connection, the runner walks it day by day until it hits one of three
//! terminal transitions — `EndJob` (ranged finished), `AbortJob` (permanent
//! upstream error), or `SleepJob` (caught up to the live edge, deferred for
//! a later pass). Each transition frees the bound connection back to the
//! cache so the next scheduler tick can rematch it.
//!
//! Grounded on the teacher's `tokio::spawn` + `Semaphore` concurrency cap
//! around scraper tasks in `main.rs`, and on `scrapers/dome.rs`'s
//! transient/permanent error split feeding back into `execute_with_retry`.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::adapter::PlatformAdapterClient;
use crate::bus::{BroadcastMessageBus, BusEvent};
use crate::cache::{InventoryCache, ScheduledJob, UserConnection};
use crate::error::{AdapterError, RunnerError, SchedulerError};
use crate::model::{BlockStatus, IntDate, JobStatus, Selector};
use crate::scheduler::Executor;
use crate::store::SqliteMetadataStore;
use crate::timeseries::{DataAggregator, InMemoryTimeSeriesGateway, Timeframe};

const MAX_CONSECUTIVE_TRANSIENT_FAILURES: u32 = 3;

pub struct RunnerConfig {
    pub job_backoff_secs: i64,
    pub resume_warmup_secs: u64,
}

pub struct Runner<A: PlatformAdapterClient + 'static> {
    store: Arc<SqliteMetadataStore>,
    gateway: Arc<InMemoryTimeSeriesGateway>,
    bus: BroadcastMessageBus,
    cache: Arc<InventoryCache>,
    adapter: Arc<A>,
    semaphore: Arc<Semaphore>,
    config: RunnerConfig,
}

impl<A: PlatformAdapterClient + 'static> Runner<A> {
    pub fn new(
        store: Arc<SqliteMetadataStore>,
        gateway: Arc<InMemoryTimeSeriesGateway>,
        bus: BroadcastMessageBus,
        cache: Arc<InventoryCache>,
        adapter: Arc<A>,
        max_concurrent_jobs: usize,
        config: RunnerConfig,
    ) -> Self {
        Runner {
            store,
            gateway,
            bus,
            cache,
            adapter,
            semaphore: Arc::new(Semaphore::new(max_concurrent_jobs)),
            config,
        }
    }

    /// The day-by-day fetch loop for a single matched job. Returns once the
    /// job reaches a terminal transition; errors here are the ones that
    /// happened *around* the loop (store I/O), not upstream fetch failures,
    /// which are handled inline per spec.md §4.5.
    ///
    /// `resuming` is set only when this call is the boot-recovery Resumer
    /// re-entering a job that was already `Running` and bound when the
    /// process last exited — spec.md §4.5 "Resuming": no preamble state
    /// change, just continue from the persisted `LoadFrom`.
    async fn run_job(&self, scheduled: ScheduledJob, connection: UserConnection, resuming: bool) -> Result<(), RunnerError> {
        let mut job = self.store.get_job(scheduled.job_id).await?;
        if !resuming {
            job.status = JobStatus::Running;
            job.user_connection = connection.key();
            self.store.upsert_job(&job).await?;
        }

        let instrument = self.store.get_instrument(job.instrument_id).await?;
        let mut block = self.store.get_block(job.block_id).await?;
        let product = self.store.get_product(instrument.product_id).await?;
        // Bars are persisted under the block's own system-code, global
        // selector (spec.md §4.5 step 4) — a DataBlock may be `global=true`
        // and shared across products, so keying by product id here would
        // fragment that sharing into one copy per product.
        let selector = Selector::System(block.system_code.clone());
        let tz_offset_minutes = 0; // a fixed UTC offset stands in for exchange_timezone lookup.

        let mut day = job.load_from.add_days(job.curr_day as i64);
        let mut consecutive_failures = 0u32;

        while day <= job.load_to {
            match self
                .adapter
                .get_bars(&connection.username, &connection.connection_code, &instrument.symbol, day)
                .await
            {
                Ok(price_bars) => {
                    consecutive_failures = 0;
                    if !price_bars.no_data && !price_bars.bars.is_empty() {
                        let mut minute_agg = DataAggregator::passthrough();
                        for bar in price_bars.bars {
                            minute_agg.add(bar);
                        }
                        let minute_bars = minute_agg.into_data_points();
                        self.gateway
                            .set_bars(&selector, &instrument.symbol, Timeframe::OneMin, &minute_bars)
                            .map_err(RunnerError::TimeSeries)?;

                        let mut five_min_agg = DataAggregator::for_timeframe(Timeframe::FiveMin, tz_offset_minutes);
                        for bar in &minute_bars {
                            five_min_agg.add(*bar);
                        }
                        let five_min_bars = five_min_agg.into_data_points();
                        self.gateway
                            .build_aggregates(&selector, &instrument.symbol, tz_offset_minutes, &five_min_bars)
                            .map_err(RunnerError::TimeSeries)?;
                    }

                    block.extend_coverage(day);
                    block.status = BlockStatus::Loading;
                    self.store.upsert_block(&block).await?;

                    job.curr_day += 1;
                    self.store.upsert_job(&job).await?;
                }
                Err(AdapterError::Permanent(msg)) => {
                    return self.abort_job(job, block, &product.system_code, &connection, msg).await;
                }
                Err(AdapterError::Transient(msg)) => {
                    consecutive_failures += 1;
                    warn!(job_id = job.id, day = day.0, error = %msg, attempt = consecutive_failures, "transient fetch failure");
                    if consecutive_failures >= MAX_CONSECUTIVE_TRANSIENT_FAILURES {
                        return self.sleep_job(job, block, &product.system_code, &connection).await;
                    }
                    sleep(std::time::Duration::from_secs(self.config.job_backoff_secs as u64)).await;
                    continue;
                }
            }

            if day == IntDate::today_utc() {
                sleep(std::time::Duration::from_secs(self.config.resume_warmup_secs)).await;
                if IntDate::today_utc() == day {
                    return self.sleep_job(job, block, &product.system_code, &connection).await;
                }
            }

            day = day.add_days(1);
        }

        self.end_job(job, block, &product.system_code, &connection).await
    }

    async fn end_job(
        &self,
        job: crate::model::DownloadJob,
        mut block: crate::model::DataBlock,
        system_code: &str,
        connection: &UserConnection,
    ) -> Result<(), RunnerError> {
        info!(job_id = job.id, block_id = block.id, "download job reached its end day, completing");
        block.status = if block.data_from_day.is_none() || block.data_to_day.is_none() {
            BlockStatus::Empty
        } else {
            BlockStatus::Ready
        };
        self.store.upsert_block(&block).await?;
        self.store.delete_job(job.id).await?;
        self.cache.adapter(system_code).complete_job(job.id, &connection.key());
        self.bus.publish(BusEvent::RecalcRollover {
            data_product_id: None,
            data_block_id: Some(block.id),
        });
        Ok(())
    }

    async fn abort_job(
        &self,
        mut job: crate::model::DownloadJob,
        mut block: crate::model::DataBlock,
        system_code: &str,
        connection: &UserConnection,
        reason: String,
    ) -> Result<(), RunnerError> {
        error!(job_id = job.id, block_id = block.id, reason, "download job aborted on permanent upstream error");
        job.status = JobStatus::Error;
        job.error = Some(reason);
        job.user_connection.clear();
        self.store.upsert_job(&job).await?;
        block.status = BlockStatus::Error;
        self.store.upsert_block(&block).await?;

        self.cache.adapter(system_code).free_and_requeue(
            ScheduledJob {
                job_id: job.id,
                instrument_id: job.instrument_id,
                block_id: job.block_id,
                priority: job.priority,
                curr_day: job.curr_day,
                user_connection: connection.key(),
                last_error: None,
            },
            &connection.key(),
            true,
        );
        Ok(())
    }

    async fn sleep_job(
        &self,
        mut job: crate::model::DownloadJob,
        mut block: crate::model::DataBlock,
        system_code: &str,
        connection: &UserConnection,
    ) -> Result<(), RunnerError> {
        info!(job_id = job.id, block_id = block.id, curr_day = job.curr_day, "download job caught up to the live edge, deferring");
        job.status = JobStatus::Waiting;
        job.user_connection.clear();
        self.store.upsert_job(&job).await?;
        block.status = BlockStatus::Sleeping;
        self.store.upsert_block(&block).await?;

        self.cache.adapter(system_code).free_and_requeue(
            ScheduledJob {
                job_id: job.id,
                instrument_id: job.instrument_id,
                block_id: job.block_id,
                priority: job.priority,
                curr_day: job.curr_day,
                user_connection: connection.key(),
                last_error: None,
            },
            &connection.key(),
            false,
        );
        self.bus.publish(BusEvent::RecalcRollover {
            data_product_id: None,
            data_block_id: Some(block.id),
        });
        Ok(())
    }
}

#[async_trait::async_trait]
impl<A: PlatformAdapterClient + 'static> Executor for Runner<A> {
    /// Dispatch is fire-and-forget from the scheduler's point of view: a
    /// permit bounds how many jobs run concurrently (spec.md §5
    /// `max_concurrent_jobs`), and the day-by-day loop runs on its own task
    /// so one slow job never stalls the next tick's matching pass. When
    /// `resuming` is set, the spawned task first waits out the 5s warm-up
    /// delay spec.md §4.3's boot-recovery Resumer prescribes.
    async fn execute(&self, scheduled: ScheduledJob, connection: UserConnection, resuming: bool) -> Result<(), SchedulerError> {
        let permit = self
            .semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|_| SchedulerError::ExecutorFailed("no free job slots".to_string()))?;

        let store = self.store.clone();
        let gateway = self.gateway.clone();
        let bus = self.bus.clone();
        let cache = self.cache.clone();
        let adapter = self.adapter.clone();
        let semaphore = self.semaphore.clone();
        let job_backoff_secs = self.config.job_backoff_secs;
        let resume_warmup_secs = self.config.resume_warmup_secs;

        tokio::spawn(async move {
            let _permit = permit;
            if resuming {
                sleep(std::time::Duration::from_secs(resume_warmup_secs)).await;
            }
            let runner = Runner {
                store,
                gateway,
                bus,
                cache,
                adapter,
                semaphore,
                config: RunnerConfig {
                    job_backoff_secs,
                    resume_warmup_secs,
                },
            };
            if let Err(err) = runner.run_job(scheduled, connection, resuming).await {
                error!(error = %err, "download job runner task failed");
            }
        });

        Ok(())
    }
}
