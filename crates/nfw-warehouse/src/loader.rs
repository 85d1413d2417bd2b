use std::sync::Arc;

use nfw_core::{CellRef, ObservationDraft, ValidationError};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::{DimensionResolver, FactRow, UpsertOutcome, Warehouse};

/// Why a single draft did not reach the fact table.
#[derive(Debug, Clone, Error, PartialEq, Serialize)]
#[serde(tag = "stage", content = "detail", rename_all = "snake_case")]
pub enum LoadFailure {
    #[error("validation: {0}")]
    Validation(ValidationError),
    #[error("dimension resolution: {0}")]
    Dimension(String),
    #[error("write: {0}")]
    Write(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectedRow {
    pub cell: CellRef,
    pub reason: LoadFailure,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadReport {
    pub inserted: usize,
    pub updated: usize,
    /// Rows kept because the stored copy was scraped later.
    pub unchanged: usize,
    pub rejected: Vec<RejectedRow>,
}

impl LoadReport {
    pub fn written(&self) -> usize {
        self.inserted + self.updated + self.unchanged
    }

    /// Every draft was turned away by the storage layer itself, not by validation.
    pub fn failed_at_write_layer(&self) -> bool {
        self.written() == 0
            && !self.rejected.is_empty()
            && self
                .rejected
                .iter()
                .all(|row| !matches!(row.reason, LoadFailure::Validation(_)))
    }
}

/// Sole writer of fact rows. Each draft is written on its own so one bad row
/// never takes the rest of the batch with it.
pub struct Loader {
    warehouse: Arc<dyn Warehouse>,
    resolver: Arc<DimensionResolver>,
}

impl Loader {
    pub fn new(warehouse: Arc<dyn Warehouse>, resolver: Arc<DimensionResolver>) -> Self {
        Self {
            warehouse,
            resolver,
        }
    }

    pub fn resolver(&self) -> &Arc<DimensionResolver> {
        &self.resolver
    }

    pub async fn upsert(&self, drafts: &[ObservationDraft]) -> LoadReport {
        let mut report = LoadReport::default();
        for draft in drafts {
            match self.upsert_one(draft).await {
                Ok(UpsertOutcome::Inserted) => report.inserted += 1,
                Ok(UpsertOutcome::Updated) => report.updated += 1,
                Ok(UpsertOutcome::Stale) => report.unchanged += 1,
                Err(reason) => {
                    warn!(cell = %draft.cell_ref(), error = %reason, "row rejected");
                    report.rejected.push(RejectedRow {
                        cell: draft.cell_ref(),
                        reason,
                    });
                }
            }
        }
        report
    }

    async fn upsert_one(&self, draft: &ObservationDraft) -> Result<UpsertOutcome, LoadFailure> {
        draft.validate().map_err(LoadFailure::Validation)?;
        let keys = self
            .resolver
            .resolve_draft(draft)
            .await
            .map_err(|err| LoadFailure::Dimension(err.to_string()))?;
        let row = FactRow {
            province_key: keys.province,
            commodity_key: keys.commodity,
            subcategory_key: keys.subcategory,
            market_type_key: keys.market_type,
            date: draft.date,
            report_type: draft.report_type,
            price: draft.price,
            scraped_at: draft.scraped_at,
            source: draft.source.clone(),
        };
        self.warehouse
            .upsert_fact(&row)
            .await
            .map_err(|err| LoadFailure::Write(err.to_string()))
    }
}
