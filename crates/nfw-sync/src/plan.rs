use anyhow::{Context, Result};
use chrono::{Days, NaiveDate};
use nfw_core::{DateWindow, IngestTuple, MarketType, ReportType, SeriesTarget};

use crate::catalog::TargetFilter;

/// Parameters of a backfill invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillRequest {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub report_type: ReportType,
    pub filter: TargetFilter,
    /// Empty means every market type in the catalog.
    pub market_types: Vec<MarketType>,
}

impl BackfillRequest {
    pub fn window(&self) -> Result<DateWindow> {
        DateWindow::new(self.start, self.end).context("invalid backfill range")
    }
}

/// `[min(last successful end, yesterday), today]`, never reaching back more
/// than `max_lookback_days`.
pub fn incremental_window(
    today: NaiveDate,
    last_success_end: Option<NaiveDate>,
    max_lookback_days: u32,
) -> DateWindow {
    let yesterday = today.pred_opt().unwrap_or(today);
    let floor = today
        .checked_sub_days(Days::new(u64::from(max_lookback_days)))
        .unwrap_or(NaiveDate::MIN)
        .min(yesterday);
    let start = last_success_end
        .map_or(yesterday, |end| end.min(yesterday))
        .max(floor);
    DateWindow::new(start, today).unwrap_or_else(|_| DateWindow::single_day(today))
}

/// Cross-product of targets × market types × windows split to `max_days`.
pub fn plan_tuples(
    targets: &[SeriesTarget],
    market_types: &[MarketType],
    report_type: ReportType,
    window: DateWindow,
    max_days: u32,
) -> Vec<IngestTuple> {
    let windows = window.split(max_days);
    let mut tuples = Vec::with_capacity(windows.len() * targets.len() * market_types.len());
    for window in windows {
        for target in targets {
            for market_type in market_types {
                tuples.push(IngestTuple {
                    target: target.clone(),
                    market_type: *market_type,
                    report_type,
                    window,
                });
            }
        }
    }
    tuples
}

#[cfg(test)]
mod tests {
    use super::*;
    use nfw_core::CommodityRef;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn first_incremental_run_covers_yesterday_and_today() {
        let window = incremental_window(d(2025, 11, 20), None, 90);
        assert_eq!(window, DateWindow::new(d(2025, 11, 19), d(2025, 11, 20)).unwrap());
    }

    #[test]
    fn incremental_resumes_from_last_success() {
        let window = incremental_window(d(2025, 11, 20), Some(d(2025, 11, 14)), 90);
        assert_eq!(window.start(), d(2025, 11, 14));
        assert_eq!(window.end(), d(2025, 11, 20));

        // A success recorded for today still re-reads yesterday.
        let window = incremental_window(d(2025, 11, 20), Some(d(2025, 11, 20)), 90);
        assert_eq!(window.start(), d(2025, 11, 19));
    }

    #[test]
    fn incremental_lookback_is_clamped() {
        let window = incremental_window(d(2025, 11, 20), Some(d(2024, 1, 1)), 30);
        assert_eq!(window.start(), d(2025, 10, 21));
        assert_eq!(window.days(), 31);
    }

    #[test]
    fn tuples_cover_every_target_market_and_chunk() {
        let target = SeriesTarget::category(CommodityRef {
            code: "cat_1".into(),
            name: "Beras".into(),
            unit: "kg".into(),
            staple: true,
        });
        let window = DateWindow::new(d(2025, 1, 1), d(2025, 3, 31)).unwrap();
        let tuples = plan_tuples(
            &[target],
            &[MarketType::Traditional, MarketType::Modern],
            ReportType::Daily,
            window,
            31,
        );

        assert_eq!(tuples.len(), 3 * 2);
        assert!(tuples.iter().all(|t| t.window.days() <= 31));
        assert_eq!(tuples[0].window.start(), d(2025, 1, 1));
        assert_eq!(tuples.last().unwrap().window.end(), d(2025, 3, 31));
    }
}
