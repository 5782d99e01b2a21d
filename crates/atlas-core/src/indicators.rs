//! Area-weighted indicator aggregation for sites.
//!
//! A site's indicators summarize its constituent catchments: for every
//! attribute, the mean of the catchments reporting it, weighted by catchment
//! area. Extraction is explicit; boundary edits never refresh indicators.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::catchments::CatchmentStore;
use crate::error::{AtlasError, Result};
use crate::sites::{Site, SiteStore};

/// Aggregation input: one catchment's area and its reference/current rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatchmentIndicators {
    pub id: i64,
    pub area_km2: f64,
    pub reference: BTreeMap<String, f64>,
    pub current: BTreeMap<String, f64>,
}

/// Aggregated indicators stored on a site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteIndicators {
    pub reference: BTreeMap<String, f64>,
    pub current: BTreeMap<String, f64>,
    /// User-editable targets, seeded from `reference` on first extraction.
    pub ideal: BTreeMap<String, f64>,
    pub extracted_at: DateTime<Utc>,
    pub catchment_count: usize,
    pub total_area_km2: f64,
    /// Catchment set the values were computed from.
    pub catchment_ids: Vec<String>,
}

impl SiteIndicators {
    /// Left-merge `partial` into `ideal`; keys absent from `partial` keep
    /// their value.
    pub fn merge_ideal(&mut self, partial: &BTreeMap<String, f64>) -> Result<()> {
        if let Some((name, v)) = partial.iter().find(|(_, v)| !v.is_finite()) {
            return Err(AtlasError::invalid(format!("ideal value for {name} is not finite: {v}")));
        }
        self.ideal.extend(partial.iter().map(|(k, v)| (k.clone(), *v)));
        Ok(())
    }

    pub fn reset_ideal(&mut self) {
        self.ideal = self.reference.clone();
    }
}

// ── Aggregation ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub reference: BTreeMap<String, f64>,
    pub current: BTreeMap<String, f64>,
    pub total_area_km2: f64,
    pub catchment_count: usize,
}

/// Area-weighted means over `rows`. When the total area is zero every row
/// weighs one. An attribute's denominator counts only the rows reporting it.
pub fn aggregate(rows: &[CatchmentIndicators]) -> Aggregate {
    let total_area_km2: f64 = rows.iter().map(|r| r.area_km2).sum();
    let weight = |r: &CatchmentIndicators| if total_area_km2 > 0.0 { r.area_km2 } else { 1.0 };

    Aggregate {
        reference: weighted_means(rows, weight, |r| &r.reference),
        current: weighted_means(rows, weight, |r| &r.current),
        total_area_km2,
        catchment_count: rows.len(),
    }
}

fn weighted_means(
    rows: &[CatchmentIndicators],
    weight: impl Fn(&CatchmentIndicators) -> f64,
    values: impl Fn(&CatchmentIndicators) -> &BTreeMap<String, f64>,
) -> BTreeMap<String, f64> {
    let mut sums: BTreeMap<&str, (f64, f64)> = BTreeMap::new();
    for row in rows {
        let w = weight(row);
        for (name, v) in values(row) {
            let (num, den) = sums.entry(name.as_str()).or_insert((0.0, 0.0));
            *num += v * w;
            *den += w;
        }
    }
    sums.into_iter()
        .filter(|(_, (_, den))| *den > 0.0)
        .map(|(name, (num, den))| (name.to_string(), num / den))
        .collect()
}

// ── Aggregator ────────────────────────────────────────────────────────────────

/// Extraction and ideal-value editing bound to one snapshot's stores.
pub struct IndicatorAggregator<'a> {
    catchments: &'a CatchmentStore,
    sites: &'a SiteStore,
}

impl<'a> IndicatorAggregator<'a> {
    pub fn new(catchments: &'a CatchmentStore, sites: &'a SiteStore) -> Self {
        Self { catchments, sites }
    }

    /// Indicators for a catchment set. `previous` supplies the ideal values
    /// to keep; without it `ideal` starts as a copy of `reference`.
    pub fn indicators_for(&self, catchment_ids: &[String], previous: Option<&SiteIndicators>) -> SiteIndicators {
        let mut ids = Vec::with_capacity(catchment_ids.len());
        for raw in catchment_ids {
            match raw.trim().parse::<i64>() {
                Ok(id) => ids.push(id),
                Err(_) => warn!(id = %raw, "Ignoring malformed catchment id"),
            }
        }

        let rows = self.catchments.catchment_indicators_by_ids(&ids);
        let agg = aggregate(&rows);
        let ideal = match previous {
            Some(prev) => prev.ideal.clone(),
            None => agg.reference.clone(),
        };

        SiteIndicators {
            reference: agg.reference,
            current: agg.current,
            ideal,
            extracted_at: Utc::now(),
            catchment_count: agg.catchment_count,
            total_area_km2: agg.total_area_km2,
            catchment_ids: catchment_ids.to_vec(),
        }
    }

    /// Recompute a site's indicators from its current catchment set.
    pub fn extract(&self, site_id: Uuid) -> Result<Site> {
        let mut site = self.sites.get(site_id)?;
        let indicators = self.indicators_for(&site.catchment_ids, site.indicators.as_ref());
        info!(
            site = %site_id,
            catchments = indicators.catchment_count,
            area_km2 = indicators.total_area_km2,
            attributes = indicators.reference.len(),
            "Site indicators extracted"
        );
        site.indicators = Some(indicators);
        site.touch();
        self.sites.save(&site)?;
        Ok(site)
    }

    pub fn update_ideal(&self, site_id: Uuid, partial: &BTreeMap<String, f64>) -> Result<Site> {
        let mut site = self.sites.get(site_id)?;
        extracted(&mut site)?.merge_ideal(partial)?;
        site.touch();
        self.sites.save(&site)?;
        info!(site = %site_id, updated = partial.len(), "Ideal values updated");
        Ok(site)
    }

    pub fn reset_ideal(&self, site_id: Uuid) -> Result<Site> {
        let mut site = self.sites.get(site_id)?;
        extracted(&mut site)?.reset_ideal();
        site.touch();
        self.sites.save(&site)?;
        info!(site = %site_id, "Ideal values reset to reference");
        Ok(site)
    }
}

fn extracted(site: &mut Site) -> Result<&mut SiteIndicators> {
    let id = site.id;
    site.indicators
        .as_mut()
        .ok_or_else(|| AtlasError::invalid(format!("site {id} has no extracted indicators")))
}
