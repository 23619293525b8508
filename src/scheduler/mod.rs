//! Download Job Scheduler (spec.md §4.3): a 1s tick that matches idle
//! [`UserConnection`]s against schedulable waiting jobs in the
//! [`InventoryCache`] and hands each match to an [`Executor`].
//!
//! Grounded on the teacher's ticker-driven background task shape in
//! `main.rs` (`tokio::time::interval` + `tokio::select!` loop spawned at
//! startup) and on its trait-seam-where-swappable-behavior-is-needed style
//! (`scrapers` implementations behind a shared trait).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::cache::{InventoryCache, ScheduledJob, UserConnection};
use crate::error::SchedulerError;
use crate::model::{ConnectionStatus, JobStatus};
use crate::store::SqliteMetadataStore;

/// Dispatches a matched job onto a connection. The Download Job Runner
/// (spec.md §4.5) implements this to spawn its day-by-day fetch loop.
/// `resuming` is set only for the boot-recovery Resumer path (spec.md
/// §4.3's "re-enters the Runner with resuming=true").
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, job: ScheduledJob, connection: UserConnection, resuming: bool) -> Result<(), SchedulerError>;
}

pub struct Scheduler<E: Executor> {
    cache: Arc<InventoryCache>,
    store: Arc<SqliteMetadataStore>,
    executor: Arc<E>,
    max_jobs: usize,
    tick: Duration,
}

impl<E: Executor> Scheduler<E> {
    pub fn new(
        cache: Arc<InventoryCache>,
        store: Arc<SqliteMetadataStore>,
        executor: Arc<E>,
        max_jobs: usize,
        tick: Duration,
    ) -> Self {
        Scheduler {
            cache,
            store,
            executor,
            max_jobs,
            tick,
        }
    }

    /// Boot recovery (spec.md §4.3):
    ///   1. Load every global DataBlock into the cache.
    ///   2. Seed a UserConnection per (system, user, connectionCode) for
    ///      every single-feed DataProduct, mirroring `dp.connected`.
    ///   3. For every persisted `Waiting` job, push it into `waitingJobs`.
    ///   4. For every persisted `Running` job, three-way branch: connection
    ///      present+connected -> bind and schedule a warm-up Resumer;
    ///      connection missing -> fatal-log and discard, no row mutation;
    ///      connection present but disconnected -> clear `user_connection`
    ///      and requeue as `Waiting`.
    pub async fn recover(&self) -> Result<(), SchedulerError> {
        for block in self.store.list_global_blocks().await? {
            self.cache.add_data_block(&block.system_code, 0, block);
        }

        for product in self.store.list_products().await? {
            if product.supports_multiple_data {
                continue;
            }
            let status = if product.connected {
                ConnectionStatus::Connected
            } else {
                ConnectionStatus::Disconnected
            };
            self.cache.set_connection(
                &product.system_code,
                UserConnection::new(&product.system_code, &product.owner, &product.connection_code, status),
            );
        }

        for job in self.store.list_jobs_by_status(JobStatus::Waiting).await? {
            let instrument = self.store.get_instrument(job.instrument_id).await?;
            let product = self.store.get_product(instrument.product_id).await?;
            self.cache.add_scheduled_job(
                &product.system_code,
                ScheduledJob {
                    job_id: job.id,
                    instrument_id: job.instrument_id,
                    block_id: job.block_id,
                    priority: job.priority,
                    curr_day: job.curr_day,
                    user_connection: job.user_connection,
                    last_error: None,
                },
            );
        }

        for job in self.store.list_jobs_by_status(JobStatus::Running).await? {
            self.recover_running_job(job).await?;
        }

        info!("scheduler boot recovery complete");
        Ok(())
    }

    async fn recover_running_job(&self, job: crate::model::DownloadJob) -> Result<(), SchedulerError> {
        let instrument = self.store.get_instrument(job.instrument_id).await?;
        let product = self.store.get_product(instrument.product_id).await?;
        let adapter = self.cache.adapter(&product.system_code);
        let connection_key = job.user_connection.clone();

        match adapter.connection(&connection_key) {
            Some(conn) if conn.status == ConnectionStatus::Connected => {
                let scheduled = ScheduledJob {
                    job_id: job.id,
                    instrument_id: job.instrument_id,
                    block_id: job.block_id,
                    priority: job.priority,
                    curr_day: job.curr_day,
                    user_connection: connection_key.clone(),
                    last_error: None,
                };
                adapter.bind_running_job(scheduled.clone(), &connection_key);
                if let Err(err) = self.executor.execute(scheduled, conn, true).await {
                    error!(job_id = job.id, error = %err, "resumer dispatch failed on boot recovery");
                    adapter.undo_match(job.id, &connection_key);
                }
            }
            Some(_) => {
                warn!(job_id = job.id, connection = %connection_key, "running job's connection is down on boot, requeuing");
                let mut requeued = job;
                requeued.status = JobStatus::Waiting;
                requeued.user_connection.clear();
                self.store.upsert_job(&requeued).await?;
                self.cache.add_scheduled_job(
                    &product.system_code,
                    ScheduledJob {
                        job_id: requeued.id,
                        instrument_id: requeued.instrument_id,
                        block_id: requeued.block_id,
                        priority: requeued.priority,
                        curr_day: requeued.curr_day,
                        user_connection: String::new(),
                        last_error: None,
                    },
                );
            }
            None => {
                error!(
                    job_id = job.id,
                    connection = %connection_key,
                    "orphaned running job: persisted user_connection not present in cache, discarding (operator must requeue)"
                );
            }
        }

        Ok(())
    }

    /// Runs the matching pass forever, once per tick, until the process
    /// shuts down (spec.md §5: the scheduler owns a 1s ticker).
    pub async fn run(&self) {
        let mut ticker = interval(self.tick);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once().await {
                warn!(error = %err, "scheduler tick failed");
            }
        }
    }

    /// A single matching pass (spec.md §4.3): iterates adapters in cache
    /// order, and within each adapter matches up to one job per idle
    /// connection, bounded globally by `max_jobs - running`. A failed
    /// dispatch aborts the *entire* tick (DB failure; retrying now would
    /// thrash).
    pub async fn run_once(&self) -> Result<(), SchedulerError> {
        let adapters = self.cache.adapters();
        let running: usize = adapters.iter().map(|a| a.running_count()).sum();
        let mut budget = self.max_jobs.saturating_sub(running);
        let now = Utc::now();

        for adapter in adapters {
            if budget == 0 {
                break;
            }
            let matches = adapter.match_jobs(budget, now);
            for (job, connection) in matches {
                let connection_key = connection.key();
                let job_id = job.job_id;
                if let Err(err) = self.executor.execute(job, connection, false).await {
                    warn!(job_id, error = %err, "executor failed to dispatch job, aborting tick");
                    adapter.undo_match(job_id, &connection_key);
                    return Ok(());
                }
                budget -= 1;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingExecutor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Executor for CountingExecutor {
        async fn execute(&self, _job: ScheduledJob, _connection: UserConnection, _resuming: bool) -> Result<(), SchedulerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn job(id: i64, priority: i32, curr_day: i32) -> ScheduledJob {
        ScheduledJob {
            job_id: id,
            instrument_id: id,
            block_id: id,
            priority,
            curr_day,
            user_connection: String::new(),
            last_error: None,
        }
    }

    #[tokio::test]
    async fn run_once_requeues_jobs_with_no_active_connection() {
        let cache = Arc::new(InventoryCache::new());
        let store = Arc::new(SqliteMetadataStore::open(":memory:").unwrap());
        let executor = Arc::new(CountingExecutor {
            calls: AtomicUsize::new(0),
        });
        cache.add_scheduled_job("CME", job(1, 10, 0));

        let scheduler = Scheduler::new(cache.clone(), store, executor.clone(), 4, Duration::from_millis(1));
        scheduler.run_once().await.unwrap();

        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(cache.waiting_jobs().len(), 1);
    }

    #[tokio::test]
    async fn run_once_dispatches_one_job_per_idle_connection() {
        let cache = Arc::new(InventoryCache::new());
        let store = Arc::new(SqliteMetadataStore::open(":memory:").unwrap());
        let executor = Arc::new(CountingExecutor {
            calls: AtomicUsize::new(0),
        });
        cache.add_scheduled_job("CME", job(1, 5, 0));
        cache.add_scheduled_job("CME", job(2, 10, 0));
        cache.set_connection(
            "CME",
            UserConnection::new("CME", "trader", "conn-1", crate::model::ConnectionStatus::Connected),
        );
        cache.set_connection(
            "CME",
            UserConnection::new("CME", "trader", "conn-2", crate::model::ConnectionStatus::Connected),
        );

        let scheduler = Scheduler::new(cache.clone(), store, executor.clone(), 4, Duration::from_millis(1));
        scheduler.run_once().await.unwrap();

        // two idle connections on the same system each got a job
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
        assert!(cache.waiting_jobs().is_empty());
    }

    #[tokio::test]
    async fn run_once_is_bounded_by_global_max_jobs() {
        let cache = Arc::new(InventoryCache::new());
        let store = Arc::new(SqliteMetadataStore::open(":memory:").unwrap());
        let executor = Arc::new(CountingExecutor {
            calls: AtomicUsize::new(0),
        });
        cache.add_scheduled_job("CME", job(1, 5, 0));
        cache.add_scheduled_job("CME", job(2, 10, 0));
        cache.set_connection(
            "CME",
            UserConnection::new("CME", "trader", "conn-1", crate::model::ConnectionStatus::Connected),
        );
        cache.set_connection(
            "CME",
            UserConnection::new("CME", "trader", "conn-2", crate::model::ConnectionStatus::Connected),
        );

        let scheduler = Scheduler::new(cache.clone(), store, executor.clone(), 1, Duration::from_millis(1));
        scheduler.run_once().await.unwrap();

        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.waiting_jobs().len(), 1);
    }
}
