//! Core domain model for the Nusantara Food Watch ingestion pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "nfw-core";

/// Surrogate key assigned by the warehouse to a dimension row.
pub type SurrogateKey = i64;

/// Canonical stand-in for "no subcategory" inside the fact uniqueness key.
pub const NO_SUBCATEGORY: SurrogateKey = 0;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("date window start {start} is after end {end}")]
    InvertedWindow { start: NaiveDate, end: NaiveDate },
    #[error("unknown market type {0:?} (expected 1-4 or a market name)")]
    UnknownMarketType(String),
    #[error("unknown report type {0:?} (expected daily or monthly)")]
    UnknownReportType(String),
}

/// Supply-chain tier, numbered the way the upstream `price_type_id` numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MarketType {
    Traditional,
    Modern,
    Wholesale,
    Producer,
}

impl MarketType {
    pub const ALL: [MarketType; 4] = [
        MarketType::Traditional,
        MarketType::Modern,
        MarketType::Wholesale,
        MarketType::Producer,
    ];

    pub fn code(self) -> u8 {
        match self {
            MarketType::Traditional => 1,
            MarketType::Modern => 2,
            MarketType::Wholesale => 3,
            MarketType::Producer => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.code() == code)
    }

    pub fn display_name(self) -> &'static str {
        match self {
            MarketType::Traditional => "Pasar Tradisional",
            MarketType::Modern => "Pasar Modern",
            MarketType::Wholesale => "Pedagang Besar",
            MarketType::Producer => "Produsen",
        }
    }
}

impl TryFrom<u8> for MarketType {
    type Error = CoreError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::from_code(code).ok_or_else(|| CoreError::UnknownMarketType(code.to_string()))
    }
}

impl From<MarketType> for u8 {
    fn from(value: MarketType) -> Self {
        value.code()
    }
}

impl FromStr for MarketType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(code) = trimmed.parse::<u8>() {
            return Self::try_from(code);
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "traditional" | "tradisional" => Ok(MarketType::Traditional),
            "modern" => Ok(MarketType::Modern),
            "wholesale" | "pedagang-besar" => Ok(MarketType::Wholesale),
            "producer" | "produsen" => Ok(MarketType::Producer),
            _ => Err(CoreError::UnknownMarketType(s.to_string())),
        }
    }
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mt{}", self.code())
    }
}

/// Report granularity requested from upstream (`tipe_laporan`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportType {
    Daily,
    Monthly,
}

impl ReportType {
    pub fn upstream_code(self) -> u8 {
        match self {
            ReportType::Daily => 1,
            ReportType::Monthly => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReportType::Daily => "daily",
            ReportType::Monthly => "monthly",
        }
    }
}

impl FromStr for ReportType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" | "harian" | "1" => Ok(ReportType::Daily),
            "monthly" | "bulanan" | "3" => Ok(ReportType::Monthly),
            _ => Err(CoreError::UnknownReportType(s.to_string())),
        }
    }
}

impl fmt::Display for ReportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DateWindow {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, CoreError> {
        if start > end {
            return Err(CoreError::InvertedWindow { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn single_day(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: day,
        }
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }

    /// Chunk into consecutive sub-windows of at most `max_days` days each.
    pub fn split(&self, max_days: u32) -> Vec<DateWindow> {
        let span = u64::from(max_days.max(1));
        let mut windows = Vec::new();
        let mut start = self.start;
        loop {
            let end = start
                .checked_add_days(Days::new(span - 1))
                .map_or(self.end, |d| d.min(self.end));
            windows.push(DateWindow { start, end });
            match end.succ_opt() {
                Some(next) if end < self.end => start = next,
                _ => break,
            }
        }
        windows
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PriceParseError {
    #[error("empty price")]
    Empty,
    #[error("not a decimal number: {0:?}")]
    NotNumeric(String),
    #[error("more than two decimal places: {0:?}")]
    ExcessPrecision(String),
}

/// Exact two-decimal price stored as integer hundredths (rupiah cents).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Price {
    cents: i64,
}

impl Price {
    pub fn from_cents(cents: i64) -> Self {
        Self { cents }
    }

    pub fn from_units(units: i64) -> Self {
        Self {
            cents: units.saturating_mul(100),
        }
    }

    pub fn cents(self) -> i64 {
        self.cents
    }

    pub fn is_positive(self) -> bool {
        self.cents > 0
    }
}

impl FromStr for Price {
    type Err = PriceParseError;

    /// Parses a plain decimal (`"14500"`, `"14500.5"`, `"-3.25"`) without rounding.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PriceParseError::Empty);
        }
        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        let (whole, frac) = match digits.split_once('.') {
            Some((whole, frac)) => (whole, frac),
            None => (digits, ""),
        };
        let all_digits = |part: &str| part.chars().all(|c| c.is_ascii_digit());
        if (whole.is_empty() && frac.is_empty()) || !all_digits(whole) || !all_digits(frac) {
            return Err(PriceParseError::NotNumeric(s.to_string()));
        }
        if frac.len() > 2 && frac[2..].chars().any(|c| c != '0') {
            return Err(PriceParseError::ExcessPrecision(s.to_string()));
        }

        let whole: i64 = if whole.is_empty() {
            0
        } else {
            whole
                .parse()
                .map_err(|_| PriceParseError::NotNumeric(s.to_string()))?
        };
        let frac_cents: i64 = match frac.len() {
            0 => 0,
            1 => i64::from(frac.as_bytes()[0] - b'0') * 10,
            _ => i64::from(frac.as_bytes()[0] - b'0') * 10 + i64::from(frac.as_bytes()[1] - b'0'),
        };
        let cents = whole
            .checked_mul(100)
            .and_then(|c| c.checked_add(frac_cents))
            .ok_or_else(|| PriceParseError::NotNumeric(s.to_string()))?;
        Ok(Self {
            cents: if negative { -cents } else { cents },
        })
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.cents < 0 { "-" } else { "" };
        let abs = self.cents.unsigned_abs();
        write!(f, "{sign}{}.{:02}", abs / 100, abs % 100)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProvinceRef {
    /// Stable external identifier (BPS province code, or a slug for unlisted names).
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub region: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommodityRef {
    /// Upstream category code, e.g. `cat_1`.
    pub code: String,
    pub name: String,
    pub unit: String,
    #[serde(default)]
    pub staple: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubcategoryRef {
    /// Upstream series code, e.g. `com_3`.
    pub code: String,
    pub name: String,
}

/// One upstream series: a whole category, or one subcategory of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeriesTarget {
    pub commodity: CommodityRef,
    #[serde(default)]
    pub subcategory: Option<SubcategoryRef>,
}

impl SeriesTarget {
    pub fn category(commodity: CommodityRef) -> Self {
        Self {
            commodity,
            subcategory: None,
        }
    }

    pub fn upstream_code(&self) -> &str {
        self.subcategory
            .as_ref()
            .map_or(self.commodity.code.as_str(), |s| s.code.as_str())
    }
}

/// The unit of orchestration: one series, one market tier, one window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IngestTuple {
    pub target: SeriesTarget,
    pub market_type: MarketType,
    pub report_type: ReportType,
    pub window: DateWindow,
}

impl fmt::Display for IngestTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.target.upstream_code(),
            self.market_type,
            self.report_type,
            self.window
        )
    }
}

/// Coordinates of a single wide-format cell, for operator-facing diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellRef {
    pub province: String,
    pub column: String,
    #[serde(default)]
    pub subcategory: Option<String>,
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.province, self.column)?;
        if let Some(sub) = &self.subcategory {
            write!(f, "[{sub}]")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("non-positive price {price} at {cell}")]
    NonPositivePrice { cell: CellRef, price: Price },
    #[error("price {raw:?} at {cell} has more than two decimal places")]
    ExcessPrecision { cell: CellRef, raw: String },
    #[error("unparseable date column at {cell}")]
    InvalidDateColumn { cell: CellRef },
}

impl ValidationError {
    pub fn cell(&self) -> &CellRef {
        match self {
            ValidationError::NonPositivePrice { cell, .. }
            | ValidationError::ExcessPrecision { cell, .. }
            | ValidationError::InvalidDateColumn { cell } => cell,
        }
    }
}

/// Long-format observation produced by the reshaper, keyed by natural identifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationDraft {
    pub province: ProvinceRef,
    pub commodity: CommodityRef,
    pub subcategory: Option<String>,
    pub market_type: MarketType,
    pub date: NaiveDate,
    pub report_type: ReportType,
    pub price: Price,
    pub scraped_at: DateTime<Utc>,
    pub source: String,
}

/// Natural-key form of the fact uniqueness tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellKey {
    pub province_code: String,
    pub commodity_code: String,
    /// Empty string when the cell carries no subcategory.
    pub subcategory: String,
    pub market_type: MarketType,
    pub date: NaiveDate,
    pub report_type: ReportType,
}

impl ObservationDraft {
    pub fn cell_key(&self) -> CellKey {
        CellKey {
            province_code: self.province.code.clone(),
            commodity_code: self.commodity.code.clone(),
            subcategory: self.subcategory.clone().unwrap_or_default(),
            market_type: self.market_type,
            date: self.date,
            report_type: self.report_type,
        }
    }

    pub fn cell_ref(&self) -> CellRef {
        CellRef {
            province: self.province.name.clone(),
            column: self.date.to_string(),
            subcategory: self.subcategory.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.price.is_positive() {
            Ok(())
        } else {
            Err(ValidationError::NonPositivePrice {
                cell: self.cell_ref(),
                price: self.price,
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionKind {
    Province,
    Commodity,
    Subcategory,
    MarketType,
}

impl DimensionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DimensionKind::Province => "province",
            DimensionKind::Commodity => "commodity",
            DimensionKind::Subcategory => "subcategory",
            DimensionKind::MarketType => "market_type",
        }
    }
}

impl fmt::Display for DimensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw upstream identifier handed to the dimension resolver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RawIdentifier {
    Province(ProvinceRef),
    Commodity(CommodityRef),
    Subcategory { commodity: CommodityRef, name: String },
    MarketType(MarketType),
}

impl RawIdentifier {
    pub fn kind(&self) -> DimensionKind {
        match self {
            RawIdentifier::Province(_) => DimensionKind::Province,
            RawIdentifier::Commodity(_) => DimensionKind::Commodity,
            RawIdentifier::Subcategory { .. } => DimensionKind::Subcategory,
            RawIdentifier::MarketType(_) => DimensionKind::MarketType,
        }
    }

    pub fn natural_key(&self) -> String {
        match self {
            RawIdentifier::Province(p) => p.code.clone(),
            RawIdentifier::Commodity(c) => c.code.clone(),
            RawIdentifier::Subcategory { commodity, name } => format!("{}/{}", commodity.code, name),
            RawIdentifier::MarketType(m) => m.code().to_string(),
        }
    }
}
