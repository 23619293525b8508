//! In-memory inventory cache hierarchy (spec.md §4.4): `InventoryCache` ->
//! `AdapterCache` -> `ProductCache`. Scheduling reads go through this
//! hierarchy rather than the metadata store directly, so the 1s scheduler
//! tick never touches SQLite on the hot path.
//!
//! Grounded on the teacher's cache-per-shard pattern in
//! `middleware/rate_limit.rs` (one `RwLock`-guarded map per shard key) and
//! on `vault/pool.rs`'s layered `Arc<RwLock<_>>` ownership — adapted here
//! to a three-level hierarchy instead of a flat map, matching
//! `original_source/pkg/core/jobmanager/{adapter-cache,product-cache,
//! inventory-cache}.go`'s nesting. `waitingJobs`/`runningJobs` live on the
//! `AdapterCache`, not the `ProductCache` (spec.md §4.4): a job is matched
//! against any idle connection on its system, not just ones touching its
//! own product.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;

use crate::model::{ConnectionStatus, DataBlock};

/// Grace period after a job's `last_error` before `IsSchedulable()` makes
/// it eligible again (spec.md §4.3: "implementer chooses >= one tick...
/// MAY use a time-based backoff e.g. 60s to smooth hot-looping").
pub const SCHEDULE_BACKOFF: ChronoDuration = ChronoDuration::seconds(60);

/// A connection a user has open to an upstream system (spec.md §3, §4.4).
#[derive(Debug, Clone)]
pub struct UserConnection {
    pub system_code: String,
    pub username: String,
    pub connection_code: String,
    pub status: ConnectionStatus,
    /// The job currently bound to this connection, if any (spec.md §4.3's
    /// `uc.bound`/`uc.scheduledJob`). `None` means the connection is idle.
    pub bound_job: Option<i64>,
}

impl UserConnection {
    pub fn new(system_code: impl Into<String>, username: impl Into<String>, connection_code: impl Into<String>, status: ConnectionStatus) -> Self {
        UserConnection {
            system_code: system_code.into(),
            username: username.into(),
            connection_code: connection_code.into(),
            status,
            bound_job: None,
        }
    }

    /// `username + ":" + connectionCode` (spec.md §4.4 invariant).
    pub fn key(&self) -> String {
        format!("{}:{}", self.username, self.connection_code)
    }

    pub fn is_bound(&self) -> bool {
        self.bound_job.is_some()
    }
}

/// A job waiting for (or bound to) a connection (spec.md §4.3, §4.4).
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub job_id: i64,
    pub instrument_id: i64,
    pub block_id: i64,
    pub priority: i32,
    pub curr_day: i32,
    /// The connection this job is bound to (empty when unbound), used both
    /// to dispatch and, for a job that errored, to know which reconnect
    /// event should clear `last_error` (spec.md §4.4's `SetConnection`).
    pub user_connection: String,
    pub last_error: Option<DateTime<Utc>>,
}

impl ScheduledJob {
    /// spec.md §4.3 `IsSchedulable()`: true unless a backoff is in effect.
    pub fn is_schedulable(&self, now: DateTime<Utc>) -> bool {
        match self.last_error {
            Some(at) => now - at >= SCHEDULE_BACKOFF,
            None => true,
        }
    }
}

/// Picks, among schedulable jobs, the one to dispatch next: highest
/// `priority`, ties broken by highest `curr_day` (spec.md §4.3 — partially
/// downloaded jobs finish ahead of fresh ones at equal priority).
fn pick_best_schedulable(jobs: &[ScheduledJob], now: DateTime<Utc>) -> Option<usize> {
    jobs.iter()
        .enumerate()
        .filter(|(_, j)| j.is_schedulable(now))
        .max_by_key(|(_, j)| (j.priority, j.curr_day))
        .map(|(i, _)| i)
}

/// Per-product cache: the blocks currently known for a product.
pub struct ProductCache {
    pub product_id: i64,
    blocks: RwLock<HashMap<i64, DataBlock>>,
}

impl ProductCache {
    fn new(product_id: i64) -> Self {
        ProductCache {
            product_id,
            blocks: RwLock::new(HashMap::new()),
        }
    }

    pub fn get_data_block(&self, block_id: i64) -> Option<DataBlock> {
        self.blocks.read().get(&block_id).cloned()
    }

    pub fn add_data_block(&self, block: DataBlock) {
        self.blocks.write().insert(block.id, block);
    }

    pub fn all_blocks(&self) -> Vec<DataBlock> {
        self.blocks.read().values().cloned().collect()
    }
}

/// Per-upstream-system cache: products reachable through that system, the
/// connections users currently hold open to it, and the jobs waiting for
/// or bound to one of those connections (spec.md §4.4).
pub struct AdapterCache {
    pub system_code: String,
    products: RwLock<HashMap<i64, Arc<ProductCache>>>,
    connections: RwLock<HashMap<String, UserConnection>>,
    waiting_jobs: RwLock<Vec<ScheduledJob>>,
    running_jobs: RwLock<Vec<ScheduledJob>>,
}

impl AdapterCache {
    fn new(system_code: String) -> Self {
        AdapterCache {
            system_code,
            products: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
            waiting_jobs: RwLock::new(Vec::new()),
            running_jobs: RwLock::new(Vec::new()),
        }
    }

    pub fn product(&self, product_id: i64) -> Arc<ProductCache> {
        if let Some(p) = self.products.read().get(&product_id) {
            return p.clone();
        }
        self.products
            .write()
            .entry(product_id)
            .or_insert_with(|| Arc::new(ProductCache::new(product_id)))
            .clone()
    }

    /// Inserts or replaces a connection. Per spec.md §4.4, reconnecting
    /// also clears `last_error` on any waiting job still bound (by
    /// persisted key) to this connection, so it becomes immediately
    /// schedulable again.
    pub fn set_connection(&self, conn: UserConnection) {
        let key = conn.key();
        let became_connected = conn.status == ConnectionStatus::Connected;
        self.connections.write().insert(key.clone(), conn);

        if became_connected {
            for job in self.waiting_jobs.write().iter_mut() {
                if job.user_connection == key {
                    job.last_error = None;
                }
            }
        }
    }

    pub fn connection(&self, key: &str) -> Option<UserConnection> {
        self.connections.read().get(key).cloned()
    }

    pub fn connections(&self) -> Vec<UserConnection> {
        self.connections.read().values().cloned().collect()
    }

    pub fn active_connections(&self) -> Vec<UserConnection> {
        self.connections
            .read()
            .values()
            .filter(|c| c.status == ConnectionStatus::Connected)
            .cloned()
            .collect()
    }

    /// Marks every connection on this adapter as disconnected (spec.md §6:
    /// a `ConnectionChanged` broadcast with `connected = false` fans out to
    /// every job bound to that connection). Jobs are left bound — the
    /// scheduler skips disconnected connections, and the Runner already in
    /// flight will abort and free its own connection on its next failure.
    pub fn disconnect_all(&self) {
        for conn in self.connections.write().values_mut() {
            conn.status = ConnectionStatus::Disconnected;
        }
    }

    pub fn add_scheduled_job(&self, job: ScheduledJob) {
        self.waiting_jobs.write().push(job);
    }

    pub fn waiting_jobs(&self) -> Vec<ScheduledJob> {
        self.waiting_jobs.read().clone()
    }

    pub fn running_jobs(&self) -> Vec<ScheduledJob> {
        self.running_jobs.read().clone()
    }

    pub fn running_count(&self) -> usize {
        self.running_jobs.read().len()
    }

    /// Seeds a job directly into `runningJobs`, bound to `connection_key`,
    /// without going through the matching pass — used by boot recovery to
    /// resume a persisted `Running` job (spec.md §4.3).
    pub fn bind_running_job(&self, job: ScheduledJob, connection_key: &str) {
        if let Some(conn) = self.connections.write().get_mut(connection_key) {
            conn.bound_job = Some(job.job_id);
        }
        self.running_jobs.write().push(job);
    }

    /// spec.md §4.3's per-AdapterCache matching rule: for each idle,
    /// connected `UserConnection`, bind the best schedulable waiting job to
    /// it, up to `budget` total binds. Mutates `waitingJobs`/`runningJobs`
    /// and the connections' `bound_job` synchronously; the caller invokes
    /// the Executor for each match *after* this returns, since "no shared
    /// locks are held across I/O or network calls" (spec.md §4.3).
    pub fn match_jobs(&self, budget: usize, now: DateTime<Utc>) -> Vec<(ScheduledJob, UserConnection)> {
        if budget == 0 {
            return Vec::new();
        }
        let mut connections = self.connections.write();
        let mut waiting = self.waiting_jobs.write();
        let mut running = self.running_jobs.write();
        let mut matches = Vec::new();

        for conn in connections.values_mut() {
            if matches.len() >= budget {
                break;
            }
            if conn.is_bound() || conn.status != ConnectionStatus::Connected {
                continue;
            }
            let Some(idx) = pick_best_schedulable(&waiting, now) else {
                continue;
            };
            let mut job = waiting.remove(idx);
            job.user_connection = conn.key();
            job.last_error = None;
            conn.bound_job = Some(job.job_id);
            running.push(job.clone());
            matches.push((job, conn.clone()));
        }

        matches
    }

    /// Reverts a match the Executor failed to dispatch (spec.md §4.3: "if
    /// the Executor returns false the entire tick's dispatch aborts").
    pub fn undo_match(&self, job_id: i64, connection_key: &str) {
        let mut running = self.running_jobs.write();
        if let Some(pos) = running.iter().position(|j| j.job_id == job_id) {
            let job = running.remove(pos);
            self.waiting_jobs.write().push(job);
        }
        drop(running);
        if let Some(conn) = self.connections.write().get_mut(connection_key) {
            conn.bound_job = None;
        }
    }

    /// Frees a connection and removes its job from `runningJobs` without
    /// requeueing — the Runner's `EndJob` path (job finished, row deleted).
    pub fn complete_job(&self, job_id: i64, connection_key: &str) {
        self.running_jobs.write().retain(|j| j.job_id != job_id);
        if let Some(conn) = self.connections.write().get_mut(connection_key) {
            conn.bound_job = None;
        }
    }

    /// `freeConnection(uc, requeue=true)` (spec.md §4.5): frees the
    /// connection and moves the job back to `waitingJobs`, optionally
    /// stamping `last_error` so the backoff in `IsSchedulable()` applies.
    pub fn free_and_requeue(&self, mut job: ScheduledJob, connection_key: &str, mark_error: bool) {
        self.running_jobs.write().retain(|j| j.job_id != job.job_id);
        if let Some(conn) = self.connections.write().get_mut(connection_key) {
            conn.bound_job = None;
        }
        if mark_error {
            job.last_error = Some(Utc::now());
        }
        self.waiting_jobs.write().push(job);
    }
}

/// Root of the cache hierarchy, sharded by upstream system code so the
/// scheduler can fan its matching pass out per adapter.
#[derive(Default)]
pub struct InventoryCache {
    adapters: RwLock<HashMap<String, Arc<AdapterCache>>>,
}

impl InventoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn adapter(&self, system_code: &str) -> Arc<AdapterCache> {
        if let Some(a) = self.adapters.read().get(system_code) {
            return a.clone();
        }
        self.adapters
            .write()
            .entry(system_code.to_string())
            .or_insert_with(|| Arc::new(AdapterCache::new(system_code.to_string())))
            .clone()
    }

    pub fn adapters(&self) -> Vec<Arc<AdapterCache>> {
        self.adapters.read().values().cloned().collect()
    }

    pub fn get_data_block(&self, system_code: &str, product_id: i64, block_id: i64) -> Option<DataBlock> {
        self.adapter(system_code).product(product_id).get_data_block(block_id)
    }

    pub fn add_data_block(&self, system_code: &str, product_id: i64, block: DataBlock) {
        self.adapter(system_code).product(product_id).add_data_block(block);
    }

    pub fn add_scheduled_job(&self, system_code: &str, job: ScheduledJob) {
        self.adapter(system_code).add_scheduled_job(job);
    }

    pub fn set_connection(&self, system_code: &str, conn: UserConnection) {
        self.adapter(system_code).set_connection(conn);
    }

    pub fn disconnect_all(&self, system_code: &str) {
        self.adapter(system_code).disconnect_all();
    }

    /// Disconnects every connection on every adapter — the `restart`
    /// message's `InventoryCache.DisconnectAll()` (spec.md §6).
    pub fn disconnect_all_systems(&self) {
        for adapter in self.adapters.read().values() {
            adapter.disconnect_all();
        }
    }

    /// Every waiting job across every adapter, tagged with its system code
    /// — used for introspection/tests, not the hot scheduling path (which
    /// goes through [`AdapterCache::match_jobs`] per adapter).
    pub fn waiting_jobs(&self) -> Vec<(String, ScheduledJob)> {
        let mut out = Vec::new();
        for adapter in self.adapters.read().values() {
            for job in adapter.waiting_jobs() {
                out.push((adapter.system_code.clone(), job));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BlockStatus, IntDate};

    fn block(id: i64) -> DataBlock {
        DataBlock {
            id,
            system_code: "CME".into(),
            root: "ES".into(),
            symbol: "ESH24".into(),
            status: BlockStatus::Waiting,
            global: false,
            data_from_day: Some(IntDate(20240101)),
            data_to_day: Some(IntDate(20240101)),
            progress: 0,
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

    #[test]
    fn cache_hierarchy_creates_levels_lazily_and_reuses_them() {
        let inv = InventoryCache::new();
        inv.add_data_block("CME", 1, block(5));
        assert_eq!(inv.get_data_block("CME", 1, 5).unwrap().id, 5);
        assert_eq!(inv.adapters().len(), 1);
    }

    #[test]
    fn waiting_jobs_lists_jobs_across_adapters_without_draining() {
        let inv = InventoryCache::new();
        inv.add_scheduled_job("CME", job(1, 10, 0));
        inv.add_scheduled_job("ICE", job(2, 20, 0));
        let listed = inv.waiting_jobs();
        assert_eq!(listed.len(), 2);
        // listing does not drain — jobs remain for the next tick
        assert_eq!(inv.waiting_jobs().len(), 2);
    }

    #[test]
    fn disconnect_all_marks_every_connection_disconnected() {
        let inv = InventoryCache::new();
        inv.set_connection("CME", UserConnection::new("CME", "trader1", "conn-1", ConnectionStatus::Connected));
        inv.disconnect_all("CME");
        let conn = inv.adapter("CME").connection("trader1:conn-1").unwrap();
        assert_eq!(conn.status, ConnectionStatus::Disconnected);
    }

    #[test]
    fn match_jobs_binds_one_job_per_idle_connection() {
        let inv = InventoryCache::new();
        let adapter = inv.adapter("CME");
        adapter.add_scheduled_job(job(1, 5, 0));
        adapter.add_scheduled_job(job(2, 10, 0));
        adapter.add_scheduled_job(job(3, 1, 0));
        adapter.set_connection(UserConnection::new("CME", "trader", "conn-1", ConnectionStatus::Connected));
        adapter.set_connection(UserConnection::new("CME", "trader", "conn-2", ConnectionStatus::Connected));

        let matches = adapter.match_jobs(10, Utc::now());
        assert_eq!(matches.len(), 2);
        assert_eq!(adapter.waiting_jobs().len(), 1);
        assert_eq!(adapter.running_jobs().len(), 2);
        for (_, conn) in &matches {
            assert!(adapter.connection(&conn.key()).unwrap().is_bound());
        }
    }

    #[test]
    fn match_jobs_skips_bound_or_disconnected_connections() {
        let inv = InventoryCache::new();
        let adapter = inv.adapter("CME");
        adapter.add_scheduled_job(job(1, 5, 0));
        adapter.add_scheduled_job(job(2, 10, 0));
        adapter.set_connection(UserConnection::new("CME", "trader", "conn-1", ConnectionStatus::Disconnected));
        let mut bound = UserConnection::new("CME", "trader", "conn-2", ConnectionStatus::Connected);
        bound.bound_job = Some(99);
        adapter.set_connection(bound);

        let matches = adapter.match_jobs(10, Utc::now());
        assert!(matches.is_empty());
        assert_eq!(adapter.waiting_jobs().len(), 2);
    }

    #[test]
    fn match_jobs_respects_global_budget() {
        let inv = InventoryCache::new();
        let adapter = inv.adapter("CME");
        adapter.add_scheduled_job(job(1, 5, 0));
        adapter.add_scheduled_job(job(2, 10, 0));
        adapter.set_connection(UserConnection::new("CME", "trader", "conn-1", ConnectionStatus::Connected));
        adapter.set_connection(UserConnection::new("CME", "trader", "conn-2", ConnectionStatus::Connected));

        let matches = adapter.match_jobs(1, Utc::now());
        assert_eq!(matches.len(), 1);
        assert_eq!(adapter.waiting_jobs().len(), 1);
    }

    #[test]
    fn backoff_excludes_job_until_grace_period_elapses() {
        let inv = InventoryCache::new();
        let adapter = inv.adapter("CME");
        let mut errored = job(1, 10, 0);
        errored.last_error = Some(Utc::now());
        errored.user_connection = "trader:conn-1".into();
        adapter.add_scheduled_job(errored);
        adapter.set_connection(UserConnection::new("CME", "trader", "conn-1", ConnectionStatus::Connected));

        // still within the backoff window — no match
        assert!(adapter.match_jobs(10, Utc::now()).is_empty());

        // reconnecting clears last_error on the job bound to that connection
        adapter.set_connection(UserConnection::new("CME", "trader", "conn-1", ConnectionStatus::Connected));
        let matches = adapter.match_jobs(10, Utc::now());
        assert_eq!(matches.len(), 1);
    }
}
