//! Relational warehouse for price observations: the storage seam, its Postgres
//! and SQLite backends, the dimension resolver and the fact loader.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use nfw_core::{
    CellKey, CommodityRef, DimensionKind, MarketType, Price, ProvinceRef, ReportType,
    SurrogateKey,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod loader;
mod postgres;
mod resolver;
mod sqlite;

pub use loader::{LoadFailure, LoadReport, Loader, RejectedRow};
pub use postgres::PgWarehouse;
pub use resolver::{DimensionResolver, ResolvedKeys};
pub use sqlite::SqliteWarehouse;

pub const CRATE_NAME: &str = "nfw-warehouse";

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{kind} {natural_key:?} already exists")]
    UniqueViolation {
        kind: DimensionKind,
        natural_key: String,
    },
    #[error("could not settle {kind} {natural_key:?} after {attempts} attempts")]
    ResolveExhausted {
        kind: DimensionKind,
        natural_key: String,
        attempts: usize,
    },
    #[error("unsupported database url {0:?} (expected postgres:// or sqlite:)")]
    UnsupportedUrl(String),
    #[error("unexpected stored value: {0}")]
    Corrupt(String),
}

pub type Result<T, E = WarehouseError> = std::result::Result<T, E>;

/// A dimension row keyed by its natural key, ready for lookup or insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DimensionRow {
    Province(ProvinceRef),
    Commodity(CommodityRef),
    Subcategory {
        commodity_key: SurrogateKey,
        name: String,
    },
    MarketType(MarketType),
}

impl DimensionRow {
    pub fn kind(&self) -> DimensionKind {
        match self {
            DimensionRow::Province(_) => DimensionKind::Province,
            DimensionRow::Commodity(_) => DimensionKind::Commodity,
            DimensionRow::Subcategory { .. } => DimensionKind::Subcategory,
            DimensionRow::MarketType(_) => DimensionKind::MarketType,
        }
    }

    pub fn natural_key(&self) -> String {
        match self {
            DimensionRow::Province(p) => p.code.clone(),
            DimensionRow::Commodity(c) => c.code.clone(),
            DimensionRow::Subcategory {
                commodity_key,
                name,
            } => format!("{commodity_key}/{name}"),
            DimensionRow::MarketType(m) => m.code().to_string(),
        }
    }

    pub(crate) fn unique_violation(&self) -> WarehouseError {
        WarehouseError::UniqueViolation {
            kind: self.kind(),
            natural_key: self.natural_key(),
        }
    }
}

/// Stored form of a dimension row; `region` is only populated for provinces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimensionRecord {
    pub key: SurrogateKey,
    pub name: String,
    pub region: Option<String>,
}

/// Fact row with every dimension already resolved to a surrogate key.
#[derive(Debug, Clone, PartialEq)]
pub struct FactRow {
    pub province_key: SurrogateKey,
    pub commodity_key: SurrogateKey,
    pub subcategory_key: SurrogateKey,
    pub market_type_key: SurrogateKey,
    pub date: NaiveDate,
    pub report_type: ReportType,
    pub price: Price,
    pub scraped_at: DateTime<Utc>,
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// The stored row was scraped later than the incoming one and was kept.
    Stale,
}

impl UpsertOutcome {
    pub(crate) fn from_revision(revision: Option<i32>) -> Self {
        match revision {
            Some(1) => UpsertOutcome::Inserted,
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Stale,
        }
    }
}

/// A fact row read back under its natural keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObservation {
    pub key: CellKey,
    pub price: Price,
    pub scraped_at: DateTime<Utc>,
    pub revision: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Incremental,
    Backfill,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Incremental => "incremental",
            RunMode::Backfill => "backfill",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Partial,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Partial => "partial",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunStart {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub report_type: ReportType,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WarehouseStats {
    pub observations: i64,
    pub provinces: i64,
    pub commodities: i64,
    pub market_types: i64,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    pub min_price: Option<Price>,
    pub avg_price: Option<f64>,
    pub max_price: Option<Price>,
}

impl WarehouseStats {
    pub fn to_markdown(&self) -> String {
        let date = |d: Option<NaiveDate>| d.map_or_else(|| "-".to_string(), |d| d.to_string());
        let price = |p: Option<Price>| p.map_or_else(|| "-".to_string(), |p| p.to_string());
        format!(
            "# Warehouse Stats\n\n- observations: {}\n- provinces: {}\n- commodities: {}\n- market types: {}\n- date range: {} .. {}\n- price min/avg/max: {} / {} / {}\n",
            self.observations,
            self.provinces,
            self.commodities,
            self.market_types,
            date(self.first_date),
            date(self.last_date),
            price(self.min_price),
            self.avg_price
                .map_or_else(|| "-".to_string(), |avg| format!("{avg:.2}")),
            price(self.max_price),
        )
    }
}

/// Storage seam shared by the resolver, the loader and the orchestrator.
///
/// `insert_dimension` must surface a natural-key collision as
/// [`WarehouseError::UniqueViolation`]; the resolver relies on it to settle races.
#[async_trait]
pub trait Warehouse: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn migrate(&self) -> Result<()>;

    async fn find_dimension(&self, row: &DimensionRow) -> Result<Option<DimensionRecord>>;

    async fn insert_dimension(&self, row: &DimensionRow) -> Result<SurrogateKey>;

    async fn update_province(&self, key: SurrogateKey, province: &ProvinceRef) -> Result<()>;

    async fn count_dimension(&self, kind: DimensionKind) -> Result<i64>;

    /// Last-write-wins upsert on the cell key, compared by `scraped_at`.
    async fn upsert_fact(&self, row: &FactRow) -> Result<UpsertOutcome>;

    async fn observations(&self) -> Result<Vec<StoredObservation>>;

    async fn stats(&self) -> Result<WarehouseStats>;

    async fn record_run_started(&self, run: &RunStart) -> Result<()>;

    async fn record_run_finished(
        &self,
        run_id: Uuid,
        status: RunStatus,
        finished_at: DateTime<Utc>,
        report: &serde_json::Value,
    ) -> Result<()>;

    async fn last_successful_window_end(&self, report_type: ReportType)
        -> Result<Option<NaiveDate>>;
}

/// Open a warehouse for `database_url`: `postgres://…` or `sqlite:…`.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<Arc<dyn Warehouse>> {
    if database_url.starts_with("sqlite:") {
        Ok(Arc::new(SqliteWarehouse::connect(database_url).await?))
    } else if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://")
    {
        Ok(Arc::new(
            PgWarehouse::connect(database_url, max_connections).await?,
        ))
    } else {
        Err(WarehouseError::UnsupportedUrl(database_url.to_string()))
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

pub(crate) fn market_type_from_stored(code: i64) -> Result<MarketType> {
    u8::try_from(code)
        .ok()
        .and_then(MarketType::from_code)
        .ok_or_else(|| WarehouseError::Corrupt(format!("market type code {code}")))
}

pub(crate) fn report_type_from_stored(raw: &str) -> Result<ReportType> {
    raw.parse()
        .map_err(|_| WarehouseError::Corrupt(format!("report type {raw:?}")))
}

#[cfg(test)]
mod tests;
