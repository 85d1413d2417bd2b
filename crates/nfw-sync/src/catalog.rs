use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context, Result};
use nfw_core::{CommodityRef, MarketType, ProvinceRef, SeriesTarget, SubcategoryRef};
use nfw_reshape::ProvinceDirectory;
use serde::Deserialize;

/// Commodity, province and market-type catalog, loaded from `catalog.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct Catalog {
    #[allow(dead_code)]
    version: u32,
    pub source_tag: String,
    #[serde(default = "all_market_types")]
    pub market_types: Vec<MarketType>,
    pub commodities: Vec<CatalogCommodity>,
    #[serde(default)]
    pub provinces: Vec<CatalogProvince>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogCommodity {
    pub code: String,
    pub name: String,
    pub unit: String,
    #[serde(default)]
    pub staple: bool,
    #[serde(default)]
    pub subcategories: Vec<SubcategoryRef>,
}

impl CatalogCommodity {
    pub fn commodity_ref(&self) -> CommodityRef {
        CommodityRef {
            code: self.code.clone(),
            name: self.name.clone(),
            unit: self.unit.clone(),
            staple: self.staple,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogProvince {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl CatalogProvince {
    pub fn province_ref(&self) -> ProvinceRef {
        ProvinceRef {
            code: self.code.clone(),
            name: self.name.clone(),
            region: self.region.clone(),
        }
    }
}

fn all_market_types() -> Vec<MarketType> {
    MarketType::ALL.to_vec()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TargetScope {
    #[default]
    All,
    CategoriesOnly,
    SubcategoriesOnly,
}

/// Which series a run covers. No codes means the whole catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetFilter {
    pub codes: Vec<String>,
    pub scope: TargetScope,
}

impl Catalog {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let catalog: Catalog = serde_yaml::from_str(raw)?;
        catalog.check()?;
        Ok(catalog)
    }

    fn check(&self) -> Result<()> {
        let mut series = HashSet::new();
        for commodity in &self.commodities {
            if !series.insert(commodity.code.as_str()) {
                bail!("duplicate series code {}", commodity.code);
            }
            let mut names = HashSet::new();
            for sub in &commodity.subcategories {
                if !series.insert(sub.code.as_str()) {
                    bail!("duplicate series code {}", sub.code);
                }
                if !names.insert(sub.name.as_str()) {
                    bail!("duplicate subcategory {:?} under {}", sub.name, commodity.code);
                }
            }
        }
        let mut provinces = HashSet::new();
        for province in &self.provinces {
            if !provinces.insert(province.code.as_str()) {
                bail!("duplicate province code {}", province.code);
            }
        }
        if self.market_types.is_empty() {
            bail!("catalog lists no market types");
        }
        Ok(())
    }

    pub fn province_directory(&self) -> ProvinceDirectory {
        let mut directory = ProvinceDirectory::new();
        for province in &self.provinces {
            directory.insert(province.province_ref(), &province.aliases);
        }
        directory
    }

    /// Expand a filter into fetch targets: `cat_N` brings its subcategories
    /// along (scope permitting), `com_N` selects exactly one series.
    pub fn targets(&self, filter: &TargetFilter) -> Result<Vec<SeriesTarget>> {
        let mut targets = Vec::new();
        let push_commodity = |commodity: &CatalogCommodity, targets: &mut Vec<SeriesTarget>| {
            if filter.scope != TargetScope::SubcategoriesOnly {
                targets.push(SeriesTarget::category(commodity.commodity_ref()));
            }
            if filter.scope != TargetScope::CategoriesOnly {
                targets.extend(commodity.subcategories.iter().map(|sub| SeriesTarget {
                    commodity: commodity.commodity_ref(),
                    subcategory: Some(sub.clone()),
                }));
            }
        };

        if filter.codes.is_empty() {
            for commodity in &self.commodities {
                push_commodity(commodity, &mut targets);
            }
            return Ok(targets);
        }

        for code in &filter.codes {
            let code = code.trim();
            if let Some(commodity) = self.commodities.iter().find(|c| c.code == code) {
                push_commodity(commodity, &mut targets);
                continue;
            }
            let owner = self.commodities.iter().find_map(|c| {
                c.subcategories
                    .iter()
                    .find(|sub| sub.code == code)
                    .map(|sub| (c, sub))
            });
            match owner {
                Some((commodity, sub)) if filter.scope != TargetScope::CategoriesOnly => {
                    targets.push(SeriesTarget {
                        commodity: commodity.commodity_ref(),
                        subcategory: Some(sub.clone()),
                    });
                }
                Some(_) => bail!("{code} is a subcategory series but only categories were requested"),
                None => bail!("unknown commodity code {code}"),
            }
        }

        let mut seen = HashSet::new();
        targets.retain(|target| seen.insert(target.upstream_code().to_string()));
        Ok(targets)
    }
}
