//! Data model (spec.md §3).
//!
//! Persisted row types mirror the teacher's `src/models.rs` derive style
//! (`serde` on everything, `#[serde(rename_all = "snake_case")]` on wire
//! enums). `id` fields are `i64` row identities (SQLite `INTEGER PRIMARY
//! KEY`), matching `original_source/pkg/db/model.go`'s RDBMS-style identity
//! columns rather than UUIDs.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{Display, EnumString};

/// A date packed as `yyyymmdd`, per the GLOSSARY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IntDate(pub u32);

impl IntDate {
    pub fn from_naive_date(d: NaiveDate) -> Self {
        IntDate(d.format("%Y%m%d").to_string().parse().expect("valid yyyymmdd"))
    }

    pub fn to_naive_date(self) -> Option<NaiveDate> {
        let y = (self.0 / 10_000) as i32;
        let m = (self.0 / 100) % 100;
        let d = self.0 % 100;
        NaiveDate::from_ymd_opt(y, m, d)
    }

    pub fn today_utc() -> Self {
        Self::from_naive_date(Utc::now().date_naive())
    }

    pub fn add_days(self, days: i64) -> Self {
        let d = self.to_naive_date().expect("valid IntDate");
        Self::from_naive_date(d + chrono::Duration::days(days))
    }

    /// Inclusive day count between `self` and `other` (`other >= self`).
    pub fn days_until(self, other: IntDate) -> i64 {
        let a = self.to_naive_date().expect("valid IntDate");
        let b = other.to_naive_date().expect("valid IntDate");
        (b - a).num_days()
    }
}

impl fmt::Display for IntDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single-character futures month code (GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MonthCode(pub char);

pub const MONTH_CODES: [char; 12] =
    ['F', 'G', 'H', 'J', 'K', 'M', 'N', 'Q', 'U', 'V', 'X', 'Z'];

impl MonthCode {
    pub fn is_valid(self) -> bool {
        MONTH_CODES.contains(&self.0)
    }
}

/// Roll trigger: days-before-expiration at which the roll window opens
/// (GLOSSARY, spec.md §4.7.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum RollTrigger {
    SD4,
    SD6,
    SD30,
}

impl RollTrigger {
    pub fn days(self) -> i64 {
        match self {
            RollTrigger::SD4 => 4,
            RollTrigger::SD6 => 6,
            RollTrigger::SD30 => 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProductStatus {
    FetchingInventory,
    FetchingData,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RolloverStatus {
    Waiting,
    Ready,
    NoMatch,
    NoData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BlockStatus {
    Waiting,
    Loading,
    Processing,
    Sleeping,
    Empty,
    Ready,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Running,
    Error,
}

/// spec.md §3: DataProduct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataProduct {
    pub id: i64,
    pub owner: String,
    pub system_code: String,
    pub connection_code: String,
    pub root_symbol: String,
    pub supports_multiple_data: bool,
    pub connected: bool,
    pub exchange_timezone: String,
    pub status: ProductStatus,
    /// 12-char subset of F,G,H,J,K,M,N,Q,U,V,X,Z.
    pub allowed_months: String,
    pub roll_trigger: RollTrigger,
}

impl DataProduct {
    pub fn allows_month(&self, month: char) -> bool {
        self.allowed_months.contains(month)
    }
}

/// spec.md §3: DataInstrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataInstrument {
    pub id: i64,
    pub product_id: i64,
    pub data_block_id: Option<i64>,
    pub symbol: String,
    pub display_name: String,
    pub expiration_date: Option<IntDate>,
    pub rollover_date: Option<DateTime<Utc>>,
    pub continuous: bool,
    pub virtual_instrument: bool,
    pub month_code: Option<char>,
    pub rollover_delta: f64,
    pub rollover_status: RolloverStatus,
}

impl DataInstrument {
    pub fn is_rollable(&self) -> bool {
        !self.continuous && !self.virtual_instrument && self.expiration_date.is_some()
    }
}

/// spec.md §3: DataBlock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataBlock {
    pub id: i64,
    pub system_code: String,
    pub root: String,
    pub symbol: String,
    pub status: BlockStatus,
    pub global: bool,
    pub data_from_day: Option<IntDate>,
    pub data_to_day: Option<IntDate>,
    pub progress: u8,
}

impl DataBlock {
    pub fn extend_coverage(&mut self, day: IntDate) {
        if self.data_from_day.is_none() {
            self.data_from_day = Some(day);
        }
        self.data_to_day = Some(day);
    }
}

/// spec.md §3: DownloadJob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadJob {
    pub id: i64,
    pub instrument_id: i64,
    pub block_id: i64,
    pub status: JobStatus,
    pub load_from: IntDate,
    pub load_to: IntDate,
    pub priority: i32,
    /// `"user:connCode"`, empty when unbound.
    pub user_connection: String,
    pub curr_day: i32,
    pub tot_days: i32,
    pub error: Option<String>,
}

impl DownloadJob {
    pub fn new_for_span(
        instrument_id: i64,
        block_id: i64,
        load_from: IntDate,
        load_to: IntDate,
        priority: i32,
    ) -> Self {
        let tot_days = (load_from.days_until(load_to) + 1) as i32;
        DownloadJob {
            id: 0,
            instrument_id,
            block_id,
            status: JobStatus::Waiting,
            load_from,
            load_to,
            priority,
            user_connection: String::new(),
            curr_day: 0,
            tot_days,
            error: None,
        }
    }
}

/// A single OHLCV(+ticks, OI) observation (GLOSSARY: Bar / DataPoint).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub instant: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub up_volume: f64,
    pub down_volume: f64,
    pub up_ticks: u64,
    pub down_ticks: u64,
    pub open_interest: f64,
}

/// A single contract or continuous series as reported by the upstream
/// platform's `ListInstruments` (spec.md §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamInstrument {
    pub symbol: String,
    pub description: String,
    pub expiration_date: Option<IntDate>,
    pub point_value: f64,
    pub min_move: f64,
    pub continuous: bool,
    pub month_code: Option<char>,
}

/// Result of `GetBars` (spec.md §4.2): `no_data` distinguishes "confirmed
/// empty for that day" from a transport error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceBars {
    pub symbol: String,
    pub date: IntDate,
    pub bars: Vec<Bar>,
    pub no_data: bool,
}

/// The time-series selector: a system-code (global feed) or a product id
/// (per-user feed) — spec.md §9's "any selector", expressed as a tagged
/// variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Selector {
    System(String),
    Product(i64),
}

/// Upstream connection-status transitions (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}
