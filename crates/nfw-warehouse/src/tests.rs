//! Warehouse, resolver and loader against an in-memory SQLite database.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use nfw_core::{
    CommodityRef, DimensionKind, MarketType, ObservationDraft, Price, ProvinceRef,
    RawIdentifier, ReportType, NO_SUBCATEGORY,
};
use uuid::Uuid;

use crate::{
    DimensionResolver, LoadFailure, Loader, RunMode, RunStart, RunStatus, SqliteWarehouse,
    Warehouse,
};

async fn warehouse() -> Arc<dyn Warehouse> {
    Arc::new(
        SqliteWarehouse::open_in_memory()
            .await
            .expect("in-memory warehouse"),
    )
}

fn loader(warehouse: &Arc<dyn Warehouse>) -> Loader {
    let resolver = Arc::new(DimensionResolver::new(warehouse.clone()));
    Loader::new(warehouse.clone(), resolver)
}

fn beras() -> CommodityRef {
    CommodityRef {
        code: "cat_1".into(),
        name: "Beras".into(),
        unit: "kg".into(),
        staple: true,
    }
}

fn province(code: &str, name: &str) -> ProvinceRef {
    ProvinceRef {
        code: code.into(),
        name: name.into(),
        region: Some("Jawa".into()),
    }
}

fn ts(hour: u32) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-11-20T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
        + Duration::hours(i64::from(hour))
}

fn draft(province_code: &str, day: u32, cents: i64, subcategory: Option<&str>) -> ObservationDraft {
    ObservationDraft {
        province: province(province_code, &format!("Provinsi {province_code}")),
        commodity: beras(),
        subcategory: subcategory.map(str::to_string),
        market_type: MarketType::Traditional,
        date: NaiveDate::from_ymd_opt(2025, 11, day).unwrap(),
        report_type: ReportType::Daily,
        price: Price::from_cents(cents),
        scraped_at: ts(1),
        source: "test".into(),
    }
}

// ─── Dimension resolver ──────────────────────────────────────────────────────

#[tokio::test]
async fn resolving_same_key_twice_returns_same_surrogate() {
    let wh = warehouse().await;
    let resolver = DimensionResolver::new(wh.clone());
    let id = RawIdentifier::Commodity(beras());

    let first = resolver.resolve(&id).await.unwrap();
    let second = DimensionResolver::new(wh.clone()).resolve(&id).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(wh.count_dimension(DimensionKind::Commodity).await.unwrap(), 1);
}

#[tokio::test]
async fn concurrent_resolution_creates_one_row() {
    let wh = warehouse().await;
    let mut handles = Vec::new();
    for _ in 0..8 {
        // Separate resolvers share nothing in-process; only the database arbitrates.
        let resolver = DimensionResolver::new(wh.clone());
        handles.push(tokio::spawn(async move {
            resolver
                .resolve(&RawIdentifier::Province(province("31", "DKI Jakarta")))
                .await
        }));
    }

    let mut keys = Vec::new();
    for handle in handles {
        keys.push(handle.await.unwrap().unwrap());
    }
    keys.dedup();
    assert_eq!(keys.len(), 1);
    assert_eq!(wh.count_dimension(DimensionKind::Province).await.unwrap(), 1);
}

#[tokio::test]
async fn unseen_subcategory_resolves_its_commodity_first() {
    let wh = warehouse().await;
    let resolver = DimensionResolver::new(wh.clone());

    let sub = resolver
        .resolve(&RawIdentifier::Subcategory {
            commodity: beras(),
            name: "Beras Kualitas Medium I".into(),
        })
        .await
        .unwrap();
    let commodity = resolver.resolve(&RawIdentifier::Commodity(beras())).await.unwrap();

    assert_ne!(sub, NO_SUBCATEGORY);
    assert_eq!(wh.count_dimension(DimensionKind::Commodity).await.unwrap(), 1);
    assert_eq!(wh.count_dimension(DimensionKind::Subcategory).await.unwrap(), 1);
    assert!(commodity > 0);
}

#[tokio::test]
async fn province_rename_updates_in_place() {
    let wh = warehouse().await;
    let original = DimensionResolver::new(wh.clone())
        .resolve(&RawIdentifier::Province(province("34", "D.I. Yogyakarta")))
        .await
        .unwrap();
    let renamed = DimensionResolver::new(wh.clone())
        .resolve(&RawIdentifier::Province(province("34", "DI Yogyakarta")))
        .await
        .unwrap();

    assert_eq!(original, renamed);
    let record = wh
        .find_dimension(&crate::DimensionRow::Province(province("34", "")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.name, "DI Yogyakarta");
    assert_eq!(wh.count_dimension(DimensionKind::Province).await.unwrap(), 1);
}

#[tokio::test]
async fn duplicate_insert_reports_unique_violation() {
    let wh = warehouse().await;
    let row = crate::DimensionRow::MarketType(MarketType::Producer);
    wh.insert_dimension(&row).await.unwrap();
    let err = wh.insert_dimension(&row).await.unwrap_err();
    assert!(matches!(err, crate::WarehouseError::UniqueViolation { .. }));
}

// ─── Loader ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn reloading_same_batch_is_idempotent() {
    let wh = warehouse().await;
    let loader = loader(&wh);
    let batch = vec![
        draft("31", 19, 1_450_000, None),
        draft("31", 20, 1_460_000, None),
        draft("32", 19, 1_390_050, Some("Beras Kualitas Medium I")),
    ];

    let first = loader.upsert(&batch).await;
    let after_first = wh.observations().await.unwrap();
    let second = loader.upsert(&batch).await;
    let after_second = wh.observations().await.unwrap();

    assert_eq!(first.inserted, 3);
    assert_eq!(second.inserted, 0);
    assert_eq!(second.updated, 3);
    assert_eq!(after_first.len(), 3);
    let strip = |rows: &[crate::StoredObservation]| {
        rows.iter()
            .map(|row| (row.key.clone(), row.price))
            .collect::<Vec<_>>()
    };
    assert_eq!(strip(&after_first), strip(&after_second));
}

#[tokio::test]
async fn no_subcategory_sentinel_participates_in_uniqueness() {
    let wh = warehouse().await;
    let loader = loader(&wh);

    loader.upsert(&[draft("31", 19, 1_000_000, None)]).await;
    let mut newer = draft("31", 19, 1_100_000, None);
    newer.scraped_at = ts(5);
    let report = loader.upsert(&[newer]).await;

    assert_eq!(report.updated, 1);
    let rows = wh.observations().await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].key.subcategory, "");
    assert_eq!(rows[0].price, Price::from_cents(1_100_000));
    assert_eq!(rows[0].revision, 2);
}

#[tokio::test]
async fn older_scrape_does_not_overwrite_newer_row() {
    let wh = warehouse().await;
    let loader = loader(&wh);

    let mut newer = draft("31", 19, 1_200_000, None);
    newer.scraped_at = ts(6);
    loader.upsert(&[newer]).await;

    let older = draft("31", 19, 1_000_000, None);
    let report = loader.upsert(&[older]).await;

    assert_eq!(report.unchanged, 1);
    assert_eq!(report.updated, 0);
    let rows = wh.observations().await.unwrap();
    assert_eq!(rows[0].price, Price::from_cents(1_200_000));
    assert_eq!(rows[0].scraped_at, ts(6));
}

#[tokio::test]
async fn one_bad_row_does_not_void_the_batch() {
    let wh = warehouse().await;
    let loader = loader(&wh);
    let mut batch = (1..=9)
        .map(|day| draft("31", day, 1_400_000 + i64::from(day), None))
        .collect::<Vec<_>>();
    batch.insert(4, draft("32", 5, -100, None));

    let report = loader.upsert(&batch).await;

    assert_eq!(report.inserted, 9);
    assert_eq!(report.rejected.len(), 1);
    assert!(matches!(report.rejected[0].reason, LoadFailure::Validation(_)));
    assert!(!report.failed_at_write_layer());
    assert_eq!(wh.observations().await.unwrap().len(), 9);
}

#[tokio::test]
async fn stats_summarize_loaded_facts() {
    let wh = warehouse().await;
    let loader = loader(&wh);
    loader
        .upsert(&[
            draft("31", 19, 1_000_000, None),
            draft("32", 20, 2_000_000, None),
        ])
        .await;

    let stats = wh.stats().await.unwrap();
    assert_eq!(stats.observations, 2);
    assert_eq!(stats.provinces, 2);
    assert_eq!(stats.commodities, 1);
    assert_eq!(stats.market_types, 1);
    assert_eq!(stats.first_date, NaiveDate::from_ymd_opt(2025, 11, 19));
    assert_eq!(stats.last_date, NaiveDate::from_ymd_opt(2025, 11, 20));
    assert_eq!(stats.min_price, Some(Price::from_cents(1_000_000)));
    assert_eq!(stats.max_price, Some(Price::from_cents(2_000_000)));
    assert_eq!(stats.avg_price, Some(15_000.0));
    assert!(stats.to_markdown().contains("observations: 2"));
}

// ─── Run ledger ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn only_succeeded_runs_count_as_last_success() {
    let wh = warehouse().await;
    let day = |d| NaiveDate::from_ymd_opt(2025, 11, d).unwrap();

    for (end, status) in [(10, RunStatus::Succeeded), (12, RunStatus::Partial)] {
        let run_id = Uuid::new_v4();
        wh.record_run_started(&RunStart {
            run_id,
            mode: RunMode::Incremental,
            report_type: ReportType::Daily,
            window_start: day(end - 1),
            window_end: day(end),
            started_at: ts(0),
        })
        .await
        .unwrap();
        wh.record_run_finished(run_id, status, ts(1), &serde_json::json!({"ok": true}))
            .await
            .unwrap();
    }

    assert_eq!(
        wh.last_successful_window_end(ReportType::Daily).await.unwrap(),
        Some(day(10))
    );
    assert_eq!(
        wh.last_successful_window_end(ReportType::Monthly).await.unwrap(),
        None
    );
}
