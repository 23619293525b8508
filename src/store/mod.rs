//! SQLite-backed metadata store (spec.md §4.10, §6: "a transactional
//! interface over product/instrument/block/job rows").
//!
//! Grounded on the teacher's `VaultDb`/`DbSignalStorage` shape: one
//! `rusqlite::Connection` behind a lock, `PRAGMA journal_mode=WAL` at
//! startup, schema as a const `CREATE TABLE IF NOT EXISTS` string,
//! `prepare_cached` on the hot paths. The lock is `tokio::sync::Mutex`
//! rather than `parking_lot` here because `run_in_transaction` callers hold
//! it across the scheduler's and rollover recalculator's `.await` points.

use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::error::StoreError;
use crate::model::{
    BlockStatus, DataBlock, DataInstrument, DataProduct, DownloadJob, IntDate, JobStatus,
    ProductStatus, RollTrigger, RolloverStatus,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS data_products (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    owner                   TEXT NOT NULL,
    system_code             TEXT NOT NULL,
    connection_code         TEXT NOT NULL,
    root_symbol             TEXT NOT NULL,
    supports_multiple_data  INTEGER NOT NULL,
    connected               INTEGER NOT NULL,
    exchange_timezone       TEXT NOT NULL,
    status                  TEXT NOT NULL,
    allowed_months          TEXT NOT NULL,
    roll_trigger            TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS data_instruments (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    product_id        INTEGER NOT NULL REFERENCES data_products(id),
    data_block_id     INTEGER,
    symbol            TEXT NOT NULL,
    display_name      TEXT NOT NULL,
    expiration_date   INTEGER,
    rollover_date     TEXT,
    continuous        INTEGER NOT NULL,
    virtual_instrument INTEGER NOT NULL,
    month_code        TEXT,
    rollover_delta    REAL NOT NULL,
    rollover_status   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_instruments_product ON data_instruments(product_id);

CREATE TABLE IF NOT EXISTS data_blocks (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    system_code    TEXT NOT NULL,
    root           TEXT NOT NULL,
    symbol         TEXT NOT NULL,
    status         TEXT NOT NULL,
    global         INTEGER NOT NULL,
    data_from_day  INTEGER,
    data_to_day    INTEGER,
    progress       INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_blocks_identity
    ON data_blocks(system_code, root, symbol, global);

CREATE TABLE IF NOT EXISTS download_jobs (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    instrument_id   INTEGER NOT NULL REFERENCES data_instruments(id),
    block_id        INTEGER NOT NULL REFERENCES data_blocks(id),
    status          TEXT NOT NULL,
    load_from       INTEGER NOT NULL,
    load_to         INTEGER NOT NULL,
    priority        INTEGER NOT NULL,
    user_connection TEXT NOT NULL,
    curr_day        INTEGER NOT NULL,
    tot_days        INTEGER NOT NULL,
    error           TEXT
);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON download_jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_block ON download_jobs(block_id);
"#;

/// Metadata store: products, instruments, blocks, and jobs (spec.md §3).
pub struct SqliteMetadataStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMetadataStore {
    pub fn open(database_path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(database_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        info!(path = database_path, "metadata store opened");
        Ok(SqliteMetadataStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    /// Runs `f` against a single transaction, committing on `Ok` and rolling
    /// back on `Err` (spec.md §6: "a transactional interface").
    pub async fn run_in_transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.lock().await;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    // ---- DataProduct --------------------------------------------------

    pub async fn get_product(&self, id: i64) -> Result<DataProduct, StoreError> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, owner, system_code, connection_code, root_symbol, \
             supports_multiple_data, connected, exchange_timezone, status, \
             allowed_months, roll_trigger FROM data_products WHERE id = ?1",
        )?;
        stmt.query_row(params![id], row_to_product)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("data_product {id}")))
    }

    pub async fn list_products(&self) -> Result<Vec<DataProduct>, StoreError> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, owner, system_code, connection_code, root_symbol, \
             supports_multiple_data, connected, exchange_timezone, status, \
             allowed_months, roll_trigger FROM data_products",
        )?;
        let rows = stmt.query_map([], row_to_product)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    /// Inserts when `product.id == 0`, otherwise updates in place.
    pub async fn upsert_product(&self, product: &DataProduct) -> Result<i64, StoreError> {
        let conn = self.lock().await;
        if product.id == 0 {
            conn.execute(
                "INSERT INTO data_products \
                 (owner, system_code, connection_code, root_symbol, \
                  supports_multiple_data, connected, exchange_timezone, status, \
                  allowed_months, roll_trigger) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    product.owner,
                    product.system_code,
                    product.connection_code,
                    product.root_symbol,
                    product.supports_multiple_data,
                    product.connected,
                    product.exchange_timezone,
                    product.status.to_string(),
                    product.allowed_months,
                    product.roll_trigger.to_string(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        } else {
            conn.execute(
                "UPDATE data_products SET owner = ?2, system_code = ?3, \
                 connection_code = ?4, root_symbol = ?5, supports_multiple_data = ?6, \
                 connected = ?7, exchange_timezone = ?8, status = ?9, \
                 allowed_months = ?10, roll_trigger = ?11 WHERE id = ?1",
                params![
                    product.id,
                    product.owner,
                    product.system_code,
                    product.connection_code,
                    product.root_symbol,
                    product.supports_multiple_data,
                    product.connected,
                    product.exchange_timezone,
                    product.status.to_string(),
                    product.allowed_months,
                    product.roll_trigger.to_string(),
                ],
            )?;
            Ok(product.id)
        }
    }

    // ---- DataInstrument -------------------------------------------------

    pub async fn get_instrument(&self, id: i64) -> Result<DataInstrument, StoreError> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, product_id, data_block_id, symbol, display_name, \
             expiration_date, rollover_date, continuous, virtual_instrument, \
             month_code, rollover_delta, rollover_status FROM data_instruments WHERE id = ?1",
        )?;
        stmt.query_row(params![id], row_to_instrument)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("data_instrument {id}")))
    }

    pub async fn list_instruments_for_product(
        &self,
        product_id: i64,
    ) -> Result<Vec<DataInstrument>, StoreError> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, product_id, data_block_id, symbol, display_name, \
             expiration_date, rollover_date, continuous, virtual_instrument, \
             month_code, rollover_delta, rollover_status FROM data_instruments \
             WHERE product_id = ?1",
        )?;
        let rows = stmt.query_map(params![product_id], row_to_instrument)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    pub async fn upsert_instrument(
        &self,
        instrument: &DataInstrument,
    ) -> Result<i64, StoreError> {
        let conn = self.lock().await;
        let expiration_date = instrument.expiration_date.map(|d| d.0);
        let rollover_date = instrument.rollover_date.map(|d| d.to_rfc3339());
        let month_code = instrument.month_code.map(|c| c.to_string());
        if instrument.id == 0 {
            conn.execute(
                "INSERT INTO data_instruments \
                 (product_id, data_block_id, symbol, display_name, expiration_date, \
                  rollover_date, continuous, virtual_instrument, month_code, \
                  rollover_delta, rollover_status) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    instrument.product_id,
                    instrument.data_block_id,
                    instrument.symbol,
                    instrument.display_name,
                    expiration_date,
                    rollover_date,
                    instrument.continuous,
                    instrument.virtual_instrument,
                    month_code,
                    instrument.rollover_delta,
                    instrument.rollover_status.to_string(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        } else {
            conn.execute(
                "UPDATE data_instruments SET product_id = ?2, data_block_id = ?3, \
                 symbol = ?4, display_name = ?5, expiration_date = ?6, rollover_date = ?7, \
                 continuous = ?8, virtual_instrument = ?9, month_code = ?10, \
                 rollover_delta = ?11, rollover_status = ?12 WHERE id = ?1",
                params![
                    instrument.id,
                    instrument.product_id,
                    instrument.data_block_id,
                    instrument.symbol,
                    instrument.display_name,
                    expiration_date,
                    rollover_date,
                    instrument.continuous,
                    instrument.virtual_instrument,
                    month_code,
                    instrument.rollover_delta,
                    instrument.rollover_status.to_string(),
                ],
            )?;
            Ok(instrument.id)
        }
    }

    // ---- DataBlock ------------------------------------------------------

    pub async fn get_block(&self, id: i64) -> Result<DataBlock, StoreError> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, system_code, root, symbol, status, global, \
             data_from_day, data_to_day, progress FROM data_blocks WHERE id = ?1",
        )?;
        stmt.query_row(params![id], row_to_block)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("data_block {id}")))
    }

    pub async fn find_block(
        &self,
        system_code: &str,
        root: &str,
        symbol: &str,
        global: bool,
    ) -> Result<Option<DataBlock>, StoreError> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, system_code, root, symbol, status, global, \
             data_from_day, data_to_day, progress FROM data_blocks \
             WHERE system_code = ?1 AND root = ?2 AND symbol = ?3 AND global = ?4",
        )?;
        stmt.query_row(params![system_code, root, symbol, global], row_to_block)
            .optional()
            .map_err(StoreError::from)
    }

    pub async fn list_global_blocks(&self) -> Result<Vec<DataBlock>, StoreError> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, system_code, root, symbol, status, global, \
             data_from_day, data_to_day, progress FROM data_blocks WHERE global = 1",
        )?;
        let rows = stmt.query_map([], row_to_block)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    pub async fn upsert_block(&self, block: &DataBlock) -> Result<i64, StoreError> {
        let conn = self.lock().await;
        let from_day = block.data_from_day.map(|d| d.0);
        let to_day = block.data_to_day.map(|d| d.0);
        if block.id == 0 {
            conn.execute(
                "INSERT INTO data_blocks \
                 (system_code, root, symbol, status, global, data_from_day, data_to_day, progress) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    block.system_code,
                    block.root,
                    block.symbol,
                    block.status.to_string(),
                    block.global,
                    from_day,
                    to_day,
                    block.progress,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        } else {
            conn.execute(
                "UPDATE data_blocks SET system_code = ?2, root = ?3, symbol = ?4, \
                 status = ?5, global = ?6, data_from_day = ?7, data_to_day = ?8, \
                 progress = ?9 WHERE id = ?1",
                params![
                    block.id,
                    block.system_code,
                    block.root,
                    block.symbol,
                    block.status.to_string(),
                    block.global,
                    from_day,
                    to_day,
                    block.progress,
                ],
            )?;
            Ok(block.id)
        }
    }

    // ---- DownloadJob ----------------------------------------------------

    pub async fn get_job(&self, id: i64) -> Result<DownloadJob, StoreError> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, instrument_id, block_id, status, load_from, load_to, \
             priority, user_connection, curr_day, tot_days, error FROM download_jobs \
             WHERE id = ?1",
        )?;
        stmt.query_row(params![id], row_to_job)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("download_job {id}")))
    }

    pub async fn list_jobs_by_status(
        &self,
        status: JobStatus,
    ) -> Result<Vec<DownloadJob>, StoreError> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, instrument_id, block_id, status, load_from, load_to, \
             priority, user_connection, curr_day, tot_days, error FROM download_jobs \
             WHERE status = ?1",
        )?;
        let rows = stmt.query_map(params![status.to_string()], row_to_job)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    pub async fn list_jobs_for_block(&self, block_id: i64) -> Result<Vec<DownloadJob>, StoreError> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, instrument_id, block_id, status, load_from, load_to, \
             priority, user_connection, curr_day, tot_days, error FROM download_jobs \
             WHERE block_id = ?1",
        )?;
        let rows = stmt.query_map(params![block_id], row_to_job)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    pub async fn upsert_job(&self, job: &DownloadJob) -> Result<i64, StoreError> {
        let conn = self.lock().await;
        if job.id == 0 {
            conn.execute(
                "INSERT INTO download_jobs \
                 (instrument_id, block_id, status, load_from, load_to, priority, \
                  user_connection, curr_day, tot_days, error) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    job.instrument_id,
                    job.block_id,
                    job.status.to_string(),
                    job.load_from.0,
                    job.load_to.0,
                    job.priority,
                    job.user_connection,
                    job.curr_day,
                    job.tot_days,
                    job.error,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        } else {
            conn.execute(
                "UPDATE download_jobs SET instrument_id = ?2, block_id = ?3, \
                 status = ?4, load_from = ?5, load_to = ?6, priority = ?7, \
                 user_connection = ?8, curr_day = ?9, tot_days = ?10, error = ?11 \
                 WHERE id = ?1",
                params![
                    job.id,
                    job.instrument_id,
                    job.block_id,
                    job.status.to_string(),
                    job.load_from.0,
                    job.load_to.0,
                    job.priority,
                    job.user_connection,
                    job.curr_day,
                    job.tot_days,
                    job.error,
                ],
            )?;
            Ok(job.id)
        }
    }

    pub async fn delete_job(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.lock().await;
        conn.execute("DELETE FROM download_jobs WHERE id = ?1", params![id])?;
        Ok(())
    }
}

fn row_to_product(row: &rusqlite::Row) -> rusqlite::Result<DataProduct> {
    let status: String = row.get(8)?;
    let roll_trigger: String = row.get(10)?;
    Ok(DataProduct {
        id: row.get(0)?,
        owner: row.get(1)?,
        system_code: row.get(2)?,
        connection_code: row.get(3)?,
        root_symbol: row.get(4)?,
        supports_multiple_data: row.get(5)?,
        connected: row.get(6)?,
        exchange_timezone: row.get(7)?,
        status: status.parse().unwrap_or(ProductStatus::FetchingInventory),
        allowed_months: row.get(9)?,
        roll_trigger: roll_trigger.parse().unwrap_or(RollTrigger::SD4),
    })
}

fn row_to_instrument(row: &rusqlite::Row) -> rusqlite::Result<DataInstrument> {
    let expiration_date: Option<u32> = row.get(5)?;
    let rollover_date: Option<String> = row.get(6)?;
    let month_code: Option<String> = row.get(9)?;
    let rollover_status: String = row.get(11)?;
    Ok(DataInstrument {
        id: row.get(0)?,
        product_id: row.get(1)?,
        data_block_id: row.get(2)?,
        symbol: row.get(3)?,
        display_name: row.get(4)?,
        expiration_date: expiration_date.map(IntDate),
        rollover_date: rollover_date.and_then(|s| {
            chrono::DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|d| d.with_timezone(&chrono::Utc))
        }),
        continuous: row.get(7)?,
        virtual_instrument: row.get(8)?,
        month_code: month_code.and_then(|s| s.chars().next()),
        rollover_delta: row.get(10)?,
        rollover_status: rollover_status.parse().unwrap_or(RolloverStatus::Waiting),
    })
}

fn row_to_block(row: &rusqlite::Row) -> rusqlite::Result<DataBlock> {
    let status: String = row.get(4)?;
    let from_day: Option<u32> = row.get(6)?;
    let to_day: Option<u32> = row.get(7)?;
    Ok(DataBlock {
        id: row.get(0)?,
        system_code: row.get(1)?,
        root: row.get(2)?,
        symbol: row.get(3)?,
        status: status.parse().unwrap_or(BlockStatus::Waiting),
        global: row.get(5)?,
        data_from_day: from_day.map(IntDate),
        data_to_day: to_day.map(IntDate),
        progress: row.get(8)?,
    })
}

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<DownloadJob> {
    let status: String = row.get(3)?;
    let load_from: u32 = row.get(4)?;
    let load_to: u32 = row.get(5)?;
    Ok(DownloadJob {
        id: row.get(0)?,
        instrument_id: row.get(1)?,
        block_id: row.get(2)?,
        status: status.parse().unwrap_or(JobStatus::Waiting),
        load_from: IntDate(load_from),
        load_to: IntDate(load_to),
        priority: row.get(6)?,
        user_connection: row.get(7)?,
        curr_day: row.get(8)?,
        tot_days: row.get(9)?,
        error: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RollTrigger;

    async fn test_store() -> SqliteMetadataStore {
        SqliteMetadataStore::open(":memory:").unwrap()
    }

    #[tokio::test]
    async fn insert_then_get_product_round_trips() {
        let store = test_store().await;
        let product = DataProduct {
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
        };
        let id = store.upsert_product(&product).await.unwrap();
        let loaded = store.get_product(id).await.unwrap();
        assert_eq!(loaded.root_symbol, "ES");
        assert_eq!(loaded.roll_trigger, RollTrigger::SD4);
    }

    #[tokio::test]
    async fn get_missing_job_is_not_found() {
        let store = test_store().await;
        let err = store.get_job(999).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn upsert_job_updates_in_place() {
        let store = test_store().await;
        let mut job = DownloadJob::new_for_span(1, 1, IntDate(20240101), IntDate(20240105), 10);
        let id = store.upsert_job(&job).await.unwrap();
        job.id = id;
        job.status = JobStatus::Running;
        job.curr_day = 2;
        store.upsert_job(&job).await.unwrap();
        let loaded = store.get_job(id).await.unwrap();
        assert_eq!(loaded.status, JobStatus::Running);
        assert_eq!(loaded.curr_day, 2);
    }
}
