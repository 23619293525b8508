//! Application configuration (SPEC_FULL.md §2.3).
//!
//! Grounded on `betterbot-backend`'s `src/models.rs::Config::from_env`: plain
//! `env::var(...).unwrap_or_else(...)` chains behind `dotenvy`, no config
//! framework.

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub http_port: u16,
    pub scheduler_tick_ms: u64,
    pub inventory_loader_tick_secs: u64,
    pub max_concurrent_jobs: usize,
    pub job_backoff_secs: i64,
    pub resume_warmup_secs: u64,
    pub roll_sleep_defer_hours: i64,
    pub time_series_batch_rows: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let database_path = std::env::var("DATABASE_PATH")
            .unwrap_or_else(|_| "./collector.db".to_string());

        let http_port = std::env::var("HTTP_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let scheduler_tick_ms = std::env::var("SCHEDULER_TICK_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1000);

        let inventory_loader_tick_secs = std::env::var("INVENTORY_LOADER_TICK_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        let max_concurrent_jobs = std::env::var("MAX_CONCURRENT_JOBS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(4);

        let job_backoff_secs = std::env::var("JOB_BACKOFF_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);

        let resume_warmup_secs = std::env::var("RESUME_WARMUP_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);

        let roll_sleep_defer_hours = std::env::var("ROLL_SLEEP_DEFER_HOURS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8);

        let time_series_batch_rows = std::env::var("TIME_SERIES_BATCH_ROWS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8192);

        Ok(Self {
            database_path,
            http_port,
            scheduler_tick_ms,
            inventory_loader_tick_secs,
            max_concurrent_jobs,
            job_backoff_secs,
            resume_warmup_secs,
            roll_sleep_defer_hours,
            time_series_batch_rows,
        })
    }
}
