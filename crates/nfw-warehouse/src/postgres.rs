use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use nfw_core::{CellKey, DimensionKind, Price, ProvinceRef, ReportType, SurrogateKey};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::{
    is_unique_violation, market_type_from_stored, report_type_from_stored, DimensionRecord,
    DimensionRow, FactRow, Result, RunStart, RunStatus, StoredObservation, UpsertOutcome,
    Warehouse, WarehouseStats,
};

pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations/postgres").run(&self.pool).await?;
        info!(backend = "postgres", "migrations applied");
        Ok(())
    }

    async fn find_dimension(&self, row: &DimensionRow) -> Result<Option<DimensionRecord>> {
        let found: Option<(i64, String, Option<String>)> = match row {
            DimensionRow::Province(p) => {
                sqlx::query_as(
                    "SELECT province_id, province_name, region FROM dim_provinces WHERE province_code = $1",
                )
                .bind(&p.code)
                .fetch_optional(&self.pool)
                .await?
            }
            DimensionRow::Commodity(c) => {
                sqlx::query_as(
                    "SELECT commodity_id, commodity_name, NULL::TEXT FROM dim_commodities WHERE category_code = $1",
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
                    "SELECT subcategory_id, subcategory_name, NULL::TEXT FROM dim_subcategories WHERE commodity_id = $1 AND subcategory_name = $2",
                )
                .bind(commodity_key)
                .bind(name)
                .fetch_optional(&self.pool)
                .await?
            }
            DimensionRow::MarketType(m) => {
                sqlx::query_as(
                    "SELECT market_type_id, market_type_name, NULL::TEXT FROM dim_market_types WHERE market_type_code = $1",
                )
                .bind(i16::from(m.code()))
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
                    "INSERT INTO dim_provinces (province_code, province_name, region) VALUES ($1, $2, $3) RETURNING province_id",
                )
                .bind(&p.code)
                .bind(&p.name)
                .bind(&p.region)
                .fetch_one(&self.pool)
                .await
            }
            DimensionRow::Commodity(c) => {
                sqlx::query_scalar(
                    "INSERT INTO dim_commodities (category_code, commodity_name, unit, is_staple) VALUES ($1, $2, $3, $4) RETURNING commodity_id",
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
                    "INSERT INTO dim_subcategories (commodity_id, subcategory_name) VALUES ($1, $2) RETURNING subcategory_id",
                )
                .bind(commodity_key)
                .bind(name)
                .fetch_one(&self.pool)
                .await
            }
            DimensionRow::MarketType(m) => {
                sqlx::query_scalar(
                    "INSERT INTO dim_market_types (market_type_code, market_type_name) VALUES ($1, $2) RETURNING market_type_id",
                )
                .bind(i16::from(m.code()))
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
            "UPDATE dim_provinces SET province_name = $2, region = COALESCE($3, region), updated_at = now() WHERE province_id = $1",
        )
        .bind(key)
        .bind(&province.name)
        .bind(&province.region)
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT ON CONSTRAINT fact_prices_cell_key DO UPDATE SET
                price_cents = EXCLUDED.price_cents,
                scraped_at = EXCLUDED.scraped_at,
                source = EXCLUDED.source,
                revision = fact_prices.revision + 1
            WHERE fact_prices.scraped_at <= EXCLUDED.scraped_at
            RETURNING revision
            "#,
        )
        .bind(row.province_key)
        .bind(row.commodity_key)
        .bind(row.subcategory_key)
        .bind(row.market_type_key)
        .bind(row.date)
        .bind(row.report_type.as_str())
        .bind(row.price.cents())
        .bind(row.scraped_at)
        .bind(&row.source)
        .fetch_optional(&self.pool)
        .await?;
        Ok(UpsertOutcome::from_revision(revision))
    }

    async fn observations(&self) -> Result<Vec<StoredObservation>> {
        let rows: Vec<(String, String, String, i16, NaiveDate, String, i64, DateTime<Utc>, i32)> =
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
                            market_type: market_type_from_stored(i64::from(market))?,
                            date,
                            report_type: report_type_from_stored(&report)?,
                        },
                        price: Price::from_cents(cents),
                        scraped_at,
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
            Option<NaiveDate>,
            Option<NaiveDate>,
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
                   (AVG(price_cents) / 100)::DOUBLE PRECISION,
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
            first_date: first,
            last_date: last,
            min_price: min.map(Price::from_cents),
            avg_price: avg,
            max_price: max.map(Price::from_cents),
        })
    }

    async fn record_run_started(&self, run: &RunStart) -> Result<()> {
        sqlx::query(
            "INSERT INTO ingest_runs (run_id, mode, report_type, window_start, window_end, started_at, status) VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(run.run_id)
        .bind(run.mode.as_str())
        .bind(run.report_type.as_str())
        .bind(run.window_start)
        .bind(run.window_end)
        .bind(run.started_at)
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
        sqlx::query(
            "UPDATE ingest_runs SET status = $2, finished_at = $3, report = $4 WHERE run_id = $1",
        )
        .bind(run_id)
        .bind(status.as_str())
        .bind(finished_at)
        .bind(Json(report))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_successful_window_end(
        &self,
        report_type: ReportType,
    ) -> Result<Option<NaiveDate>> {
        Ok(sqlx::query_scalar(
            "SELECT MAX(window_end) FROM ingest_runs WHERE report_type = $1 AND status = $2",
        )
        .bind(report_type.as_str())
        .bind(RunStatus::Succeeded.as_str())
        .fetch_one(&self.pool)
        .await?)
    }
}
