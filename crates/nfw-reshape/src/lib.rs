//! Wide-to-long pivot of PIHPS grid payloads into observation drafts.

use std::collections::HashMap;

use chrono::NaiveDate;
use nfw_core::{
    CellRef, MarketType, ObservationDraft, Price, PriceParseError, ProvinceRef, ReportType,
    SeriesTarget, ValidationError,
};
use nfw_upstream::RawResponse;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "nfw-reshape";

/// Row keys that describe the row rather than a reporting period.
const ROW_METADATA_KEYS: [&str; 3] = ["no", "name", "level"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ColumnError {
    #[error("expected DD/MM/YYYY, got {0:?}")]
    Daily(String),
    #[error("expected `Mon YYYY`, got {0:?}")]
    Monthly(String),
}

/// Classification of one grid column header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Column {
    Metadata,
    Date(NaiveDate),
    Invalid(ColumnError),
}

pub fn classify_column(key: &str, report_type: ReportType) -> Column {
    let trimmed = key.trim();
    if ROW_METADATA_KEYS
        .iter()
        .any(|meta| trimmed.eq_ignore_ascii_case(meta))
        || !trimmed.chars().any(|c| c.is_ascii_digit())
    {
        return Column::Metadata;
    }
    let parsed = match report_type {
        ReportType::Daily => parse_daily_column(trimmed),
        ReportType::Monthly => parse_monthly_column(trimmed),
    };
    match parsed {
        Ok(date) => Column::Date(date),
        Err(err) => Column::Invalid(err),
    }
}

fn parse_daily_column(raw: &str) -> Result<NaiveDate, ColumnError> {
    NaiveDate::parse_from_str(raw, "%d/%m/%Y").map_err(|_| ColumnError::Daily(raw.to_string()))
}

/// `Aug 2025` / `Agu 2025` → 2025-08-01.
fn parse_monthly_column(raw: &str) -> Result<NaiveDate, ColumnError> {
    let err = || ColumnError::Monthly(raw.to_string());
    let mut parts = raw.split_whitespace();
    let (Some(month), Some(year), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(err());
    };
    let month = month_number(month).ok_or_else(err)?;
    let year: i32 = year.parse().map_err(|_| err())?;
    NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(err)
}

fn month_number(abbr: &str) -> Option<u32> {
    let lower = abbr.to_ascii_lowercase();
    let prefix = lower.get(..3)?;
    let month = match prefix {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" | "mei" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" | "agu" => 8,
        "sep" => 9,
        "oct" | "okt" => 10,
        "nov" => 11,
        "dec" | "des" => 12,
        _ => return None,
    };
    Some(month)
}

/// Outcome of reading one price cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellValue {
    Missing,
    Price(Price),
    ExcessPrecision(String),
}

/// Grid cells arrive as `"14,500"`, `"14,500.50"`, bare numbers, `"-"` or null.
pub fn parse_cell(value: &Value) -> CellValue {
    let text = match value {
        Value::String(s) => s.trim().replace(',', ""),
        Value::Number(n) => n.to_string(),
        _ => return CellValue::Missing,
    };
    if text.is_empty() || text == "-" {
        return CellValue::Missing;
    }
    match text.parse::<Price>() {
        Ok(price) => CellValue::Price(price),
        Err(PriceParseError::ExcessPrecision(raw)) => CellValue::ExcessPrecision(raw),
        Err(PriceParseError::Empty | PriceParseError::NotNumeric(_)) => CellValue::Missing,
    }
}

/// Maps upstream province labels onto catalog entries by a punctuation-blind key.
#[derive(Debug, Clone, Default)]
pub struct ProvinceDirectory {
    by_key: HashMap<String, ProvinceRef>,
}

impl ProvinceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, province: ProvinceRef, aliases: &[String]) {
        for alias in aliases {
            self.by_key.insert(lookup_key(alias), province.clone());
        }
        self.by_key.insert(lookup_key(&province.name), province);
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Unlisted names still resolve, under a slug code and no region.
    pub fn resolve(&self, raw_name: &str) -> ProvinceRef {
        let name = raw_name.split_whitespace().collect::<Vec<_>>().join(" ");
        if let Some(known) = self.by_key.get(&lookup_key(&name)) {
            return known.clone();
        }
        ProvinceRef {
            code: slug(&name),
            name,
            region: None,
        }
    }
}

fn lookup_key(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn slug(name: &str) -> String {
    name.split(|c: char| !c.is_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("-")
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReshapeOutput {
    pub drafts: Vec<ObservationDraft>,
    pub rejected: Vec<ValidationError>,
    pub missing_cells: usize,
    pub skipped_rows: usize,
}

#[derive(Debug, Clone)]
pub struct Reshaper {
    provinces: ProvinceDirectory,
    source_tag: String,
}

impl Reshaper {
    pub fn new(provinces: ProvinceDirectory, source_tag: impl Into<String>) -> Self {
        Self {
            provinces,
            source_tag: source_tag.into(),
        }
    }

    pub fn provinces(&self) -> &ProvinceDirectory {
        &self.provinces
    }

    pub fn reshape(
        &self,
        raw: &RawResponse,
        target: &SeriesTarget,
        market_type: MarketType,
    ) -> ReshapeOutput {
        let report_type = raw.tuple.report_type;
        let subcategory = target.subcategory.as_ref().map(|s| s.name.clone());
        let mut out = ReshapeOutput::default();

        for row in &raw.rows {
            let Some(province_name) = province_row_name(row) else {
                out.skipped_rows += 1;
                continue;
            };
            let province = self.provinces.resolve(province_name);

            for (column, value) in row {
                let cell = || CellRef {
                    province: province.name.clone(),
                    column: column.clone(),
                    subcategory: subcategory.clone(),
                };

                let date = match classify_column(column, report_type) {
                    Column::Metadata => continue,
                    Column::Date(date) => date,
                    Column::Invalid(_) => {
                        if parse_cell(value) != CellValue::Missing {
                            out.rejected
                                .push(ValidationError::InvalidDateColumn { cell: cell() });
                        }
                        continue;
                    }
                };

                match parse_cell(value) {
                    CellValue::Missing => out.missing_cells += 1,
                    CellValue::ExcessPrecision(raw) => out
                        .rejected
                        .push(ValidationError::ExcessPrecision { cell: cell(), raw }),
                    CellValue::Price(price) if !price.is_positive() => out
                        .rejected
                        .push(ValidationError::NonPositivePrice { cell: cell(), price }),
                    CellValue::Price(price) => out.drafts.push(ObservationDraft {
                        province: province.clone(),
                        commodity: target.commodity.clone(),
                        subcategory: subcategory.clone(),
                        market_type,
                        date,
                        report_type,
                        price,
                        scraped_at: raw.fetched_at,
                        source: self.source_tag.clone(),
                    }),
                }
            }
        }

        debug!(
            tuple = %raw.tuple,
            drafts = out.drafts.len(),
            rejected = out.rejected.len(),
            missing = out.missing_cells,
            skipped_rows = out.skipped_rows,
            "reshaped grid"
        );
        out
    }
}

/// Province label of a row, or `None` for national aggregates and nameless rows.
fn province_row_name(row: &Map<String, Value>) -> Option<&str> {
    let name = row.get("name")?.as_str()?.trim();
    if name.is_empty() || name.to_ascii_lowercase().contains("semua") {
        return None;
    }
    let level = match row.get("level") {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    };
    if level == Some(0) {
        return None;
    }
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use nfw_core::{CommodityRef, DateWindow, IngestTuple, SubcategoryRef};
    use serde_json::json;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn target() -> SeriesTarget {
        SeriesTarget::category(CommodityRef {
            code: "cat_5".into(),
            name: "Bawang Merah".into(),
            unit: "kg".into(),
            staple: false,
        })
    }

    fn raw(report_type: ReportType, rows: Value) -> RawResponse {
        let rows = rows
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r.as_object().unwrap().clone())
            .collect();
        RawResponse {
            tuple: IngestTuple {
                target: target(),
                market_type: MarketType::Traditional,
                report_type,
                window: DateWindow::new(d(2025, 11, 19), d(2025, 11, 20)).unwrap(),
            },
            fetched_at: DateTime::parse_from_rfc3339("2025-11-20T03:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            status: 200,
            content_hash: "abc".into(),
            rows,
        }
    }

    fn directory() -> ProvinceDirectory {
        let mut dir = ProvinceDirectory::new();
        dir.insert(
            ProvinceRef {
                code: "11".into(),
                name: "Aceh".into(),
                region: Some("Sumatera".into()),
            },
            &[],
        );
        dir.insert(
            ProvinceRef {
                code: "34".into(),
                name: "DI Yogyakarta".into(),
                region: Some("Jawa".into()),
            },
            &["Daerah Istimewa Yogyakarta".to_string()],
        );
        dir
    }

    #[test]
    fn columns_are_classified_per_report_type() {
        assert_eq!(classify_column("name", ReportType::Daily), Column::Metadata);
        assert_eq!(
            classify_column("19/11/2025", ReportType::Daily),
            Column::Date(d(2025, 11, 19))
        );
        assert_eq!(
            classify_column("Agu 2025", ReportType::Monthly),
            Column::Date(d(2025, 8, 1))
        );
        assert_eq!(
            classify_column("Dec 2024", ReportType::Monthly),
            Column::Date(d(2024, 12, 1))
        );
        assert!(matches!(
            classify_column("31/02/2025", ReportType::Daily),
            Column::Invalid(ColumnError::Daily(_))
        ));
        assert!(matches!(
            classify_column("Foo 2025", ReportType::Monthly),
            Column::Invalid(ColumnError::Monthly(_))
        ));
    }

    #[test]
    fn cells_parse_thousands_separators_and_missing_markers() {
        assert_eq!(parse_cell(&json!("14,500")), CellValue::Price(Price::from_units(14_500)));
        assert_eq!(
            parse_cell(&json!("14,500.50")),
            CellValue::Price(Price::from_cents(1_450_050))
        );
        assert_eq!(parse_cell(&json!(12000)), CellValue::Price(Price::from_units(12_000)));
        assert_eq!(parse_cell(&json!("-")), CellValue::Missing);
        assert_eq!(parse_cell(&json!("")), CellValue::Missing);
        assert_eq!(parse_cell(&Value::Null), CellValue::Missing);
        assert_eq!(parse_cell(&json!("n/a")), CellValue::Missing);
        assert!(matches!(parse_cell(&json!("1.234")), CellValue::ExcessPrecision(_)));
    }

    #[test]
    fn sparse_cells_produce_no_drafts() {
        let raw = raw(
            ReportType::Daily,
            json!([
                {"no": "", "name": "Semua Provinsi", "level": 0, "19/11/2025": "40,000"},
                {"no": "1", "name": "Aceh", "level": 1, "19/11/2025": "38,750", "20/11/2025": "-"}
            ]),
        );
        let out = Reshaper::new(directory(), "test").reshape(&raw, &target(), MarketType::Traditional);

        assert_eq!(out.drafts.len(), 1);
        assert_eq!(out.missing_cells, 1);
        assert_eq!(out.skipped_rows, 1);
        let draft = &out.drafts[0];
        assert_eq!(draft.province.code, "11");
        assert_eq!(draft.date, d(2025, 11, 19));
        assert_eq!(draft.price, Price::from_units(38_750));
        assert_eq!(draft.subcategory, None);
        assert_eq!(draft.source, "test");
    }

    #[test]
    fn non_positive_prices_are_rejected_per_cell() {
        let raw = raw(
            ReportType::Daily,
            json!([
                {"name": "Aceh", "level": 1, "19/11/2025": "0", "20/11/2025": "-5"},
                {"name": "DI Yogyakarta", "level": 1, "19/11/2025": "31,000"}
            ]),
        );
        let out = Reshaper::new(directory(), "test").reshape(&raw, &target(), MarketType::Traditional);

        assert_eq!(out.drafts.len(), 1);
        assert_eq!(out.rejected.len(), 2);
        assert!(out
            .rejected
            .iter()
            .all(|err| matches!(err, ValidationError::NonPositivePrice { .. })
                && err.cell().province == "Aceh"));
    }

    #[test]
    fn subcategory_series_tags_every_draft() {
        let mut target = target();
        target.subcategory = Some(SubcategoryRef {
            code: "com_11".into(),
            name: "Bawang Merah Ukuran Sedang".into(),
        });
        let raw = raw(
            ReportType::Monthly,
            json!([{"name": "Daerah Istimewa Yogyakarta", "level": 1, "Okt 2025": "35,000", "Nov 2025": "36,500"}]),
        );
        let out = Reshaper::new(directory(), "test").reshape(&raw, &target, MarketType::Modern);

        assert_eq!(out.drafts.len(), 2);
        assert!(out.drafts.iter().all(|draft| {
            draft.subcategory.as_deref() == Some("Bawang Merah Ukuran Sedang")
                && draft.province.code == "34"
                && draft.market_type == MarketType::Modern
                && draft.report_type == ReportType::Monthly
        }));
    }

    #[test]
    fn unlisted_provinces_get_slug_codes() {
        let province = directory().resolve("  Papua   Selatan ");
        assert_eq!(province.code, "papua-selatan");
        assert_eq!(province.name, "Papua Selatan");
        assert_eq!(province.region, None);
    }
}
