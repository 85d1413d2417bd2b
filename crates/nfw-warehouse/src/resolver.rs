use std::collections::HashMap;
use std::sync::Arc;

use nfw_core::{
    DimensionKind, ObservationDraft, RawIdentifier, SurrogateKey, NO_SUBCATEGORY,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{DimensionRow, Result, Warehouse, WarehouseError};

const MAX_RESOLVE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedKeys {
    pub province: SurrogateKey,
    pub commodity: SurrogateKey,
    pub subcategory: SurrogateKey,
    pub market_type: SurrogateKey,
}

/// Lookup-or-create for the four dimension kinds.
///
/// Correctness under parallel workers comes from the natural-key uniqueness
/// constraints: an insert that loses a race reports a unique violation and the
/// winner's row is re-read. The memo only skips round-trips for keys this
/// resolver has already settled.
pub struct DimensionResolver {
    warehouse: Arc<dyn Warehouse>,
    memo: Mutex<HashMap<(DimensionKind, String), SurrogateKey>>,
}

impl DimensionResolver {
    pub fn new(warehouse: Arc<dyn Warehouse>) -> Self {
        Self {
            warehouse,
            memo: Mutex::new(HashMap::new()),
        }
    }

    pub async fn resolve(&self, id: &RawIdentifier) -> Result<SurrogateKey> {
        let row = match id {
            RawIdentifier::Province(p) => DimensionRow::Province(p.clone()),
            RawIdentifier::Commodity(c) => DimensionRow::Commodity(c.clone()),
            RawIdentifier::MarketType(m) => DimensionRow::MarketType(*m),
            RawIdentifier::Subcategory { commodity, name } => {
                // The owning commodity is settled first so the subcategory can point at it.
                let commodity_key = self
                    .memoized(
                        (DimensionKind::Commodity, commodity.code.clone()),
                        DimensionRow::Commodity(commodity.clone()),
                    )
                    .await?;
                DimensionRow::Subcategory {
                    commodity_key,
                    name: name.clone(),
                }
            }
        };
        self.memoized((id.kind(), id.natural_key()), row).await
    }

    pub async fn resolve_draft(&self, draft: &ObservationDraft) -> Result<ResolvedKeys> {
        let province = self
            .resolve(&RawIdentifier::Province(draft.province.clone()))
            .await?;
        let commodity = self
            .resolve(&RawIdentifier::Commodity(draft.commodity.clone()))
            .await?;
        let subcategory = match &draft.subcategory {
            Some(name) => {
                self.resolve(&RawIdentifier::Subcategory {
                    commodity: draft.commodity.clone(),
                    name: name.clone(),
                })
                .await?
            }
            None => NO_SUBCATEGORY,
        };
        let market_type = self
            .resolve(&RawIdentifier::MarketType(draft.market_type))
            .await?;
        Ok(ResolvedKeys {
            province,
            commodity,
            subcategory,
            market_type,
        })
    }

    async fn memoized(
        &self,
        memo_key: (DimensionKind, String),
        row: DimensionRow,
    ) -> Result<SurrogateKey> {
        if let Some(key) = self.memo.lock().await.get(&memo_key).copied() {
            return Ok(key);
        }
        let key = self.lookup_or_create(&row).await?;
        self.memo.lock().await.insert(memo_key, key);
        Ok(key)
    }

    async fn lookup_or_create(&self, row: &DimensionRow) -> Result<SurrogateKey> {
        for attempt in 1..=MAX_RESOLVE_ATTEMPTS {
            if let Some(existing) = self.warehouse.find_dimension(row).await? {
                if let DimensionRow::Province(province) = row {
                    let region_changed =
                        province.region.is_some() && province.region != existing.region;
                    if province.name != existing.name || region_changed {
                        self.warehouse
                            .update_province(existing.key, province)
                            .await?;
                        info!(
                            code = %province.code,
                            from = %existing.name,
                            to = %province.name,
                            "province renamed in place"
                        );
                    }
                }
                return Ok(existing.key);
            }

            match self.warehouse.insert_dimension(row).await {
                Ok(key) => {
                    debug!(kind = %row.kind(), natural_key = %row.natural_key(), key, "dimension created");
                    return Ok(key);
                }
                Err(WarehouseError::UniqueViolation { .. }) => {
                    debug!(
                        kind = %row.kind(),
                        natural_key = %row.natural_key(),
                        attempt,
                        "lost insert race, re-reading"
                    );
                }
                Err(err) => return Err(err),
            }
        }

        Err(WarehouseError::ResolveExhausted {
            kind: row.kind(),
            natural_key: row.natural_key(),
            attempts: MAX_RESOLVE_ATTEMPTS,
        })
    }
}
