use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use nfw_core::{CellKey, DimensionKind, Price, ProvinceRef, ReportType, SurrogateKey};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::info;
use uuid::Uuid;

use crate::{
    is_unique_violation, market_type_from_stored, report_type_from_stored, DimensionRecord,
    DimensionRow, FactRow, Result, RunStart, RunStatus, StoredObservation, UpsertOutcome,
    Warehouse, WarehouseError, WarehouseStats,
};

/// SQLite backend. Dates and timestamps are stored as fixed-width UTC text so
/// that string comparison orders them chronologically.
pub struct SqliteWarehouse {
    pool: Pool<Sqlite>,
}

impl SqliteWarehouse {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let mut opts = SqliteConnectOptions::from_str(database_url)?
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            opts = opts
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal);
        }

        // One connection: SQLite serializes writers anyway, and an in-memory
        // database lives exactly as long as its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        Ok(Self { pool })
    }

    /// Fresh, migrated in-memory warehouse.
    pub async fn open_in_memory() -> Result<Self> {
        let warehouse = Self::connect("sqlite::memory:").await?;
        warehouse.migrate().await?;
        Ok(warehouse)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

fn encode_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn decode_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|err| WarehouseError::Corrupt(format!("date {raw:?}: {err}")))
}

fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

fn decode_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| WarehouseError::Corrupt(format!("timestamp {raw:?}: {err}")))
}

#[async_trait]
impl Warehouse for SqliteWarehouse {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations/sqlite").run(&self.pool).await?;
        info!(backend = "sqlite", "migrations applied");
        Ok(())
    }

    async fn find_dimension(&self, row: &DimensionRow) -> Result<Option<DimensionRecord>> {
        let found: Option<(i64, String, Option<String>)> = match row {
            DimensionRow::Province(p) => {
                sqlx::query_as(
                    "SELECT province_id, province_name, region FROM dim_provinces WHERE province_code = ?",
                )
                .bind(&p.code)
                .fetch_optional(&self.pool)
                .await?
            }
            DimensionRow::Commodity(c) => {
                sqlx::query_as(
                    "SELECT commodity_id, commodity_name, NULL FROM dim_commodities WHERE category_code = ?",
                )
                .bind(&c.code)
                .fetch_optional(&self.pool)
                .await?
            }
            DimensionRow::Subcategory {
                commodity_key,
                name,
            } => {
                sqlx::query_as(
                    "SELECT subcategory_id, subcategory_name, NULL FROM dim_subcategories WHERE commodity_id = ? AND subcategory_name = ?",
                )
                .bind(commodity_key)
                .bind(name)
                .fetch_optional(&self.pool)
                .await?
            }
            DimensionRow::MarketType(m) => {
                sqlx::query_as(
                    "SELECT market_type_id, market_type_name, NULL FROM dim_market_types WHERE market_type_code = ?",
                )
                .bind(i64::from(m.code()))
                .fetch_optional(&self.pool)
                .await?
            }
        };
        Ok(found.map(|(key, name, region)| DimensionRecord { key, name, region }))
    }

    async fn insert_dimension(&self, row: &DimensionRow) -> Result<SurrogateKey> {
        let inserted: std::result::Result<i64, sqlx::Error> = match row {
            DimensionRow::Province(p) => {
                sqlx::query_scalar(
                    "INSERT INTO dim_provinces (province_code, province_name, region) VALUES (?, ?, ?) RETURNING province_id",
                )
                .bind(&p.code)
                .bind(&p.name)
                .bind(&p.region)
                .fetch_one(&self.pool)
                .await
            }
            DimensionRow::Commodity(c) => {
                sqlx::query_scalar(
                    "INSERT INTO dim_commodities (category_code, commodity_name, unit, is_staple) VALUES (?, ?, ?, ?) RETURNING commodity_id",
                )
                .bind(&c.code)
                .bind(&c.name)
                .bind(&c.unit)
                .bind(c.staple)
                .fetch_one(&self.pool)
                .await
            }
            DimensionRow::Subcategory {
                commodity_key,
                name,
            } => {
                sqlx::query_scalar(
                    "INSERT INTO dim_subcategories (commodity_id, subcategory_name) VALUES (?, ?) RETURNING subcategory_id",
                )
                .bind(commodity_key)
                .bind(name)
                .fetch_one(&self.pool)
                .await
            }
            DimensionRow::MarketType(m) => {
                sqlx::query_scalar(
                    "INSERT INTO dim_market_types (market_type_code, market_type_name) VALUES (?, ?) RETURNING market_type_id",
                )
                .bind(i64::from(m.code()))
                .bind(m.display_name())
                .fetch_one(&self.pool)
                .await
            }
        };
        match inserted {
            Ok(key) => Ok(key),
            Err(err) if is_unique_violation(&err) => Err(row.unique_violation()),
            Err(err) => Err(err.into()),
        }
    }

    async fn update_province(&self, key: SurrogateKey, province: &ProvinceRef) -> Result<()> {
        sqlx::query(
            "UPDATE dim_provinces SET province_name = ?, region = COALESCE(?, region), updated_at = ? WHERE province_id = ?",
        )
        .bind(&province.name)
        .bind(&province.region)
        .bind(encode_ts(Utc::now()))
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_dimension(&self, kind: DimensionKind) -> Result<i64> {
        let sql = match kind {
            DimensionKind::Province => "SELECT COUNT(*) FROM dim_provinces",
            DimensionKind::Commodity => "SELECT COUNT(*) FROM dim_commodities",
            DimensionKind::Subcategory => "SELECT COUNT(*) FROM dim_subcategories",
            DimensionKind::MarketType => "SELECT COUNT(*) FROM dim_market_types",
        };
        Ok(sqlx::query_scalar(sql).fetch_one(&self.pool).await?)
    }

    async fn upsert_fact(&self, row: &FactRow) -> Result<UpsertOutcome> {
        let revision: Option<i32> = sqlx::query_scalar(
            r#"
            INSERT INTO fact_prices (
                province_id, commodity_id, subcategory_id, market_type_id,
                observed_on, report_type, price_cents, scraped_at, source
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (province_id, commodity_id, subcategory_id, market_type_id, observed_on, report_type)
            DO UPDATE SET
                price_cents = excluded.price_cents,
                scraped_at = excluded.scraped_at,
                source = excluded.source,
                revision = fact_prices.revision + 1
            WHERE fact_prices.scraped_at <= excluded.scraped_at
            RETURNING revision
            "#,
        )
        .bind(row.province_key)
        .bind(row.commodity_key)
        .bind(row.subcategory_key)
        .bind(row.market_type_key)
        .bind(encode_date(row.date))
        .bind(row.report_type.as_str())
        .bind(row.price.cents())
        .bind(encode_ts(row.scraped_at))
        .bind(&row.source)
        .fetch_optional(&self.pool)
        .await?;
        Ok(UpsertOutcome::from_revision(revision))
    }

    async fn observations(&self) -> Result<Vec<StoredObservation>> {
        let rows: Vec<(String, String, String, i64, String, String, i64, String, i32)> =
            sqlx::query_as(
                r#"
                SELECT p.province_code, c.category_code, COALESCE(s.subcategory_name, ''),
                       m.market_type_code, f.observed_on, f.report_type,
                       f.price_cents, f.scraped_at, f.revision
                FROM fact_prices f
                JOIN dim_provinces p ON p.province_id = f.province_id
                JOIN dim_commodities c ON c.commodity_id = f.commodity_id
                LEFT JOIN dim_subcategories s ON s.subcategory_id = f.subcategory_id
                JOIN dim_market_types m ON m.market_type_id = f.market_type_id
                ORDER BY 1, 2, 3, 4, 5, 6
                "#,
            )
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(
                |(province, commodity, subcategory, market, date, report, cents, scraped_at, revision)| {
                    Ok(StoredObservation {
                        key: CellKey {
                            province_code: province,
                            commodity_code: commodity,
                            subcategory,
                            market_type: market_type_from_stored(market)?,
                            date: decode_date(&date)?,
                            report_type: report_type_from_stored(&report)?,
                        },
                        price: Price::from_cents(cents),
                        scraped_at: decode_ts(&scraped_at)?,
                        revision,
                    })
                },
            )
            .collect()
    }

    async fn stats(&self) -> Result<WarehouseStats> {
        let (observations, provinces, commodities, market_types, first, last, min, avg, max): (
            i64,
            i64,
            i64,
            i64,
            Option<String>,
            Option<String>,
            Option<i64>,
            Option<f64>,
            Option<i64>,
        ) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COUNT(DISTINCT province_id),
                   COUNT(DISTINCT commodity_id),
                   COUNT(DISTINCT market_type_id),
                   MIN(observed_on),
                   MAX(observed_on),
                   MIN(price_cents),
                   AVG(price_cents) / 100.0,
                   MAX(price_cents)
            FROM fact_prices
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(WarehouseStats {
            observations,
            provinces,
            commodities,
            market_types,
            first_date: first.as_deref().map(decode_date).transpose()?,
            last_date: last.as_deref().map(decode_date).transpose()?,
            min_price: min.map(Price::from_cents),
            avg_price: avg,
            max_price: max.map(Price::from_cents),
        })
    }

    async fn record_run_started(&self, run: &RunStart) -> Result<()> {
        sqlx::query(
            "INSERT INTO ingest_runs (run_id, mode, report_type, window_start, window_end, started_at, status) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(run.run_id.to_string())
        .bind(run.mode.as_str())
        .bind(run.report_type.as_str())
        .bind(encode_date(run.window_start))
        .bind(encode_date(run.window_end))
        .bind(encode_ts(run.started_at))
        .bind(RunStatus::Running.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_run_finished(
        &self,
        run_id: Uuid,
        status: RunStatus,
        finished_at: DateTime<Utc>,
        report: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query("UPDATE ingest_runs SET status = ?, finished_at = ?, report = ? WHERE run_id = ?")
            .bind(status.as_str())
            .bind(encode_ts(finished_at))
            .bind(serde_json::to_string(report)?)
            .bind(run_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn last_successful_window_end(
        &self,
        report_type: ReportType,
    ) -> Result<Option<NaiveDate>> {
        let raw: Option<String> = sqlx::query_scalar(
            "SELECT MAX(window_end) FROM ingest_runs WHERE report_type = ? AND status = ?",
        )
        .bind(report_type.as_str())
        .bind(RunStatus::Succeeded.as_str())
        .fetch_one(&self.pool)
        .await?;
        raw.as_deref().map(decode_date).transpose()
    }
}
