//! Catchment attribute store: geometries, scenario tables and domain ranges
//! for one data pack, immutable once loaded.
//!
//! Layout inside the data directory:
//! - `catchments.geojson`: one Polygon/MultiPolygon feature per catchment,
//!   keyed by `HYBAS_ID`.
//! - `reference.csv`, `current.csv`, `future.csv`: scenario tables keyed by
//!   `catchID`; any subset may be present.
pub mod domain;
pub mod scenario;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Instant;

use geo::MultiPolygon;
use geojson::{feature::Id, Feature, FeatureCollection, GeoJson, Geometry, JsonObject, JsonValue};
use rstar::{RTree, RTreeObject, AABB};
use tracing::{info, warn};

use crate::bbox::BoundingBox;
use crate::error::{AtlasError, Result};
use crate::geometry::{spherical_area_km2, polygons_from_value};
use crate::indicators::CatchmentIndicators;
pub use domain::{compute_domain_ranges, DomainRange};
pub use scenario::{Scenario, ScenarioTable};

pub const CATCHMENTS_FILE: &str = "catchments.geojson";

const ID_PROPERTIES: [&str; 2] = ["HYBAS_ID", "catchID"];
const AREA_PROPERTIES: [&str; 2] = ["area_km2", "SUB_AREA"];

// ── Catchment ─────────────────────────────────────────────────────────────────

/// One drainage basin with everything queries need precomputed.
#[derive(Debug, Clone)]
pub struct Catchment {
    pub id: i64,
    pub polygons: MultiPolygon<f64>,
    /// GeoJSON geometry materialized once at load.
    pub geojson: Geometry,
    pub bbox: BoundingBox,
    pub area_km2: f64,
}

impl Catchment {
    /// `area_km2` falls back to the spherical area of `polygons` when absent.
    pub fn new(id: i64, geojson: Geometry, area_km2: Option<f64>) -> Result<Self> {
        let polygons = polygons_from_value(&geojson.value)?;
        let bbox = BoundingBox::of_value(&geojson.value)
            .ok_or_else(|| AtlasError::invalid(format!("catchment {id} has no coordinates")))?;
        let area_km2 = area_km2.unwrap_or_else(|| spherical_area_km2(&polygons));
        Ok(Self { id, polygons, geojson, bbox, area_km2 })
    }
}

/// R-tree entry: a catchment's envelope and its slot in the store.
struct CatchmentEnvelope {
    slot: usize,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for CatchmentEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

// ── Store ─────────────────────────────────────────────────────────────────────

pub struct CatchmentStore {
    catchments: Vec<Catchment>,
    by_id: HashMap<i64, usize>,
    index: RTree<CatchmentEnvelope>,
    scenarios: BTreeMap<Scenario, ScenarioTable>,
    domains: BTreeMap<String, DomainRange>,
}

impl CatchmentStore {
    /// Load catchments and every scenario table present in `data_dir`.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let started = Instant::now();

        let geojson_path = data_dir.join(CATCHMENTS_FILE);
        if !geojson_path.is_file() {
            return Err(AtlasError::unavailable(
                "catchment",
                format!("{} not found", geojson_path.display()),
            ));
        }
        let catchments = load_catchments(&geojson_path)?;

        let mut tables = Vec::new();
        for scenario in Scenario::ALL {
            let path = data_dir.join(scenario.file_name());
            if path.is_file() {
                tables.push(ScenarioTable::load(scenario, &path)?);
            }
        }
        if tables.is_empty() {
            return Err(AtlasError::unavailable(
                "catchment",
                format!("no scenario tables in {}", data_dir.display()),
            ));
        }

        let store = Self::from_parts(catchments, tables);
        info!(
            catchments = store.len(),
            scenarios = store.scenarios.len(),
            attributes = store.domains.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Catchment store loaded"
        );
        Ok(store)
    }

    /// Assemble a store from already-built parts. Duplicate catchment ids keep
    /// the first occurrence; a scenario given twice keeps the last table.
    pub fn from_parts(catchments: Vec<Catchment>, tables: Vec<ScenarioTable>) -> Self {
        let mut kept = Vec::with_capacity(catchments.len());
        let mut by_id = HashMap::with_capacity(catchments.len());
        let mut duplicates = 0usize;
        for c in catchments {
            if by_id.contains_key(&c.id) {
                duplicates += 1;
                continue;
            }
            by_id.insert(c.id, kept.len());
            kept.push(c);
        }
        if duplicates > 0 {
            warn!(count = duplicates, "Ignored duplicate catchment ids");
        }

        let entries = kept
            .iter()
            .enumerate()
            .map(|(slot, c)| CatchmentEnvelope {
                slot,
                envelope: AABB::from_corners([c.bbox.min_x, c.bbox.min_y], [c.bbox.max_x, c.bbox.max_y]),
            })
            .collect();

        let scenarios: BTreeMap<Scenario, ScenarioTable> =
            tables.into_iter().map(|t| (t.scenario(), t)).collect();
        let domains = compute_domain_ranges(scenarios.values());

        Self {
            catchments: kept,
            by_id,
            index: RTree::bulk_load(entries),
            scenarios,
            domains,
        }
    }

    pub fn len(&self) -> usize {
        self.catchments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.catchments.is_empty()
    }

    /// Loaded scenarios in canonical order.
    pub fn scenarios(&self) -> Vec<Scenario> {
        self.scenarios.keys().copied().collect()
    }

    pub fn catchment(&self, id: i64) -> Result<&Catchment> {
        self.by_id
            .get(&id)
            .map(|&slot| &self.catchments[slot])
            .ok_or_else(|| AtlasError::not_found("catchment", id))
    }

    pub fn scenario_table(&self, scenario: Scenario) -> Result<&ScenarioTable> {
        self.scenarios
            .get(&scenario)
            .ok_or_else(|| AtlasError::not_found("scenario", scenario))
    }

    /// Attribute names of one scenario, sorted.
    pub fn attributes(&self, scenario: Scenario) -> Result<Vec<&str>> {
        Ok(self.scenario_table(scenario)?.attributes().collect())
    }

    fn require_attribute(&self, scenario: Scenario, attribute: &str) -> Result<&ScenarioTable> {
        let table = self.scenario_table(scenario)?;
        if !table.has_attribute(attribute) {
            return Err(AtlasError::not_found("attribute", format!("{attribute} in {scenario}")));
        }
        Ok(table)
    }

    /// Every non-null value of `attribute` in `scenario`.
    pub fn scenario_data(&self, scenario: Scenario, attribute: &str) -> Result<BTreeMap<i64, f64>> {
        let table = self.require_attribute(scenario, attribute)?;
        Ok(table.values(attribute).into_iter().flatten().collect())
    }

    /// Paired values for catchments reporting `attribute` in both scenarios.
    /// Catchments missing either side are left out, never zero-filled.
    pub fn comparison_data(
        &self,
        left: Scenario,
        right: Scenario,
        attribute: &str,
    ) -> Result<BTreeMap<i64, (f64, f64)>> {
        let l = self.require_attribute(left, attribute)?;
        let r = self.require_attribute(right, attribute)?;
        Ok(l.values(attribute)
            .into_iter()
            .flatten()
            .filter_map(|(id, lv)| r.value(id, attribute).map(|rv| (id, (lv, rv))))
            .collect())
    }

    /// Catchments whose envelope intersects `bbox`, as a choropleth-ready
    /// feature collection. Catchments without a value carry `"value": null`.
    pub fn query_catchments(
        &self,
        scenario: Scenario,
        attribute: &str,
        bbox: &BoundingBox,
    ) -> Result<FeatureCollection> {
        bbox.validate()?;
        let table = self.require_attribute(scenario, attribute)?;

        let envelope = AABB::from_corners([bbox.min_x, bbox.min_y], [bbox.max_x, bbox.max_y]);
        let mut slots: Vec<usize> = self
            .index
            .locate_in_envelope_intersecting(&envelope)
            .map(|e| e.slot)
            .collect();
        slots.sort_unstable();

        let features = slots
            .into_iter()
            .map(|slot| {
                let c = &self.catchments[slot];
                let value = table.value(c.id, attribute);
                let mut properties = JsonObject::new();
                properties.insert("id".to_string(), JsonValue::from(c.id));
                properties.insert("value".to_string(), value.map_or(JsonValue::Null, JsonValue::from));
                Feature {
                    bbox: None,
                    geometry: Some(c.geojson.clone()),
                    id: Some(Id::Number(c.id.into())),
                    properties: Some(properties),
                    foreign_members: None,
                }
            })
            .collect();

        Ok(FeatureCollection { bbox: None, features, foreign_members: None })
    }

    /// Global range of `attribute` across every loaded scenario.
    pub fn domain_range(&self, attribute: &str) -> Result<DomainRange> {
        self.domains
            .get(attribute)
            .copied()
            .ok_or_else(|| AtlasError::not_found("attribute", attribute))
    }

    pub fn domain_ranges(&self) -> &BTreeMap<String, DomainRange> {
        &self.domains
    }

    /// Full cross-scenario record of one catchment. Scenarios without a row
    /// for it are omitted.
    pub fn catchment_attributes(&self, id: i64) -> Result<BTreeMap<Scenario, BTreeMap<String, f64>>> {
        let record: BTreeMap<Scenario, BTreeMap<String, f64>> = self
            .scenarios
            .iter()
            .filter_map(|(scenario, table)| table.row(id).map(|row| (*scenario, row)))
            .collect();
        if record.is_empty() && !self.by_id.contains_key(&id) {
            return Err(AtlasError::not_found("catchment", id));
        }
        Ok(record)
    }

    /// Aggregator input for `ids`, in request order. Ids without geometry
    /// are skipped since they have no area to weight by.
    pub fn catchment_indicators_by_ids(&self, ids: &[i64]) -> Vec<CatchmentIndicators> {
        let row = |scenario: Scenario, id: i64| {
            self.scenarios
                .get(&scenario)
                .and_then(|t| t.row(id))
                .unwrap_or_default()
        };

        let mut missing = Vec::new();
        let rows = ids
            .iter()
            .filter_map(|&id| match self.catchment(id) {
                Ok(c) => Some(CatchmentIndicators {
                    id,
                    area_km2: c.area_km2,
                    reference: row(Scenario::Reference, id),
                    current: row(Scenario::Current, id),
                }),
                Err(_) => {
                    missing.push(id);
                    None
                }
            })
            .collect();
        if !missing.is_empty() {
            warn!(count = missing.len(), ids = ?missing, "Unknown catchments skipped");
        }
        rows
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

fn load_catchments(path: &Path) -> Result<Vec<Catchment>> {
    let text = std::fs::read_to_string(path)?;
    let features = match text.parse::<GeoJson>()? {
        GeoJson::FeatureCollection(fc) => fc.features,
        GeoJson::Feature(f) => vec![f],
        GeoJson::Geometry(_) => {
            return Err(AtlasError::invalid(format!(
                "{} must contain features, found a bare geometry",
                path.display()
            )))
        }
    };

    let total = features.len();
    let built = build_catchments(features);
    let mut catchments = Vec::with_capacity(total);
    let mut skipped = 0usize;
    for (index, result) in built.into_iter().enumerate() {
        match result {
            Ok(c) => catchments.push(c),
            Err(e) => {
                skipped += 1;
                if skipped <= 10 {
                    warn!(feature = index, error = %e, "Skipping catchment feature");
                }
            }
        }
    }
    if skipped > 0 {
        warn!(skipped, total, "Some catchment features were unusable");
    }
    Ok(catchments)
}

#[cfg(feature = "threading")]
fn build_catchments(features: Vec<Feature>) -> Vec<Result<Catchment>> {
    use rayon::prelude::*;
    features.into_par_iter().map(catchment_from_feature).collect()
}

#[cfg(not(feature = "threading"))]
fn build_catchments(features: Vec<Feature>) -> Vec<Result<Catchment>> {
    features.into_iter().map(catchment_from_feature).collect()
}

fn catchment_from_feature(feature: Feature) -> Result<Catchment> {
    let id = feature_id(&feature).ok_or_else(|| AtlasError::invalid("feature has no catchment id"))?;
    let area = AREA_PROPERTIES
        .iter()
        .find_map(|key| feature.property(key).and_then(JsonValue::as_f64))
        .filter(|a| a.is_finite() && *a >= 0.0);
    let geometry = feature
        .geometry
        .ok_or_else(|| AtlasError::invalid(format!("catchment {id} has no geometry")))?;
    Catchment::new(id, geometry, area)
}

fn feature_id(feature: &Feature) -> Option<i64> {
    let from_json = |v: &JsonValue| match v {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    ID_PROPERTIES
        .iter()
        .find_map(|key| feature.property(key).and_then(from_json))
        .or_else(|| match &feature.id {
            Some(Id::Number(n)) => n.as_i64(),
            Some(Id::String(s)) => s.parse().ok(),
            None => None,
        })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::geometry::tests::square;
    use crate::geometry::value_from_polygons;

    pub(crate) fn square_catchment(id: i64, x0: f64, y0: f64, size: f64, area_km2: f64) -> Catchment {
        let geojson = Geometry::new(value_from_polygons(&square(x0, y0, size)));
        Catchment::new(id, geojson, Some(area_km2)).unwrap()
    }

    fn store() -> CatchmentStore {
        let catchments = vec![
            square_catchment(1, 0.0, 0.0, 1.0, 10.0),
            square_catchment(2, 2.0, 0.0, 1.0, 30.0),
            square_catchment(3, 10.0, 10.0, 1.0, 5.0),
            square_catchment(4, 20.0, 20.0, 1.0, 5.0),
        ];
        let reference = ScenarioTable::from_reader(
            Scenario::Reference,
            "catchID,rainfall,runoff\n1,5,0.1\n2,15,NA\n3,NA,0.3\n".as_bytes(),
        )
        .unwrap();
        let current = ScenarioTable::from_reader(
            Scenario::Current,
            "catchID,rainfall,runoff\n1,4,0.2\n2,25,0.4\n3,7,NA\n9,100,1\n".as_bytes(),
        )
        .unwrap();
        CatchmentStore::from_parts(catchments, vec![reference, current])
    }

    #[test]
    fn scenario_data_reports_only_non_null_values() {
        let s = store();
        let data = s.scenario_data(Scenario::Reference, "rainfall").unwrap();
        assert_eq!(data, BTreeMap::from([(1, 5.0), (2, 15.0)]));
    }

    #[test]
    fn unknown_scenario_or_attribute_is_not_found() {
        let s = store();
        assert!(matches!(
            s.scenario_data(Scenario::Future, "rainfall"),
            Err(AtlasError::NotFound { kind: "scenario", .. })
        ));
        assert!(matches!(
            s.scenario_data(Scenario::Current, "evaporation"),
            Err(AtlasError::NotFound { kind: "attribute", .. })
        ));
    }

    #[test]
    fn every_scenario_value_lies_within_its_domain() {
        let s = store();
        for scenario in s.scenarios() {
            for attribute in s.attributes(scenario).unwrap() {
                let domain = s.domain_range(attribute).unwrap();
                for v in s.scenario_data(scenario, attribute).unwrap().values() {
                    assert!((domain.min..=domain.max).contains(v), "{scenario}/{attribute}: {v} outside {domain:?}");
                }
            }
        }
        assert_eq!(s.domain_range("rainfall").unwrap(), DomainRange { min: 4.0, max: 100.0 });
    }

    #[test]
    fn comparison_excludes_catchments_missing_either_side() {
        let s = store();
        let cmp = s.comparison_data(Scenario::Reference, Scenario::Current, "runoff").unwrap();
        // 2 has no reference runoff, 3 has no current runoff.
        assert_eq!(cmp, BTreeMap::from([(1, (0.1, 0.2))]));

        let cmp = s.comparison_data(Scenario::Reference, Scenario::Current, "rainfall").unwrap();
        assert!(!cmp.contains_key(&3));
        assert!(!cmp.contains_key(&9));
        assert_eq!(cmp[&2], (15.0, 25.0));
    }

    #[test]
    fn query_filters_by_envelope_and_carries_values() {
        let s = store();
        let fc = s
            .query_catchments(Scenario::Reference, "rainfall", &BoundingBox::new(0.5, 0.5, 10.5, 10.5))
            .unwrap();
        let ids: Vec<i64> = fc
            .features
            .iter()
            .map(|f| f.property("id").and_then(JsonValue::as_i64).unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(fc.features[0].property("value"), Some(&JsonValue::from(5.0)));
        assert_eq!(fc.features[2].property("value"), Some(&JsonValue::Null));
        assert!(fc.features.iter().all(|f| f.geometry.is_some()));
    }

    #[test]
    fn query_rejects_bad_bbox_before_lookup() {
        let s = store();
        let inverted = BoundingBox::new(5.0, 0.0, 1.0, 1.0);
        assert!(matches!(
            s.query_catchments(Scenario::Future, "nope", &inverted),
            Err(AtlasError::InvalidInput(_))
        ));
    }

    #[test]
    fn catchment_attributes_span_scenarios() {
        let s = store();
        let record = s.catchment_attributes(3).unwrap();
        assert_eq!(record[&Scenario::Reference], BTreeMap::from([("runoff".to_string(), 0.3)]));
        assert_eq!(record[&Scenario::Current], BTreeMap::from([("rainfall".to_string(), 7.0)]));

        // Attribute rows without geometry are still inspectable.
        assert!(s.catchment_attributes(9).is_ok());
        // Geometry without attribute rows yields an empty record.
        assert!(s.catchment_attributes(4).unwrap().is_empty());
        assert!(s.catchment_attributes(404).unwrap_err().is_not_found());
    }

    #[test]
    fn indicator_rows_skip_catchments_without_geometry() {
        let s = store();
        let rows = s.catchment_indicators_by_ids(&[2, 9, 1]);
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2, 1]);
        assert_eq!(rows[0].area_km2, 30.0);
        assert_eq!(rows[0].current["runoff"], 0.4);
        assert!(!rows[0].reference.contains_key("runoff"));
    }

    #[test]
    fn load_reads_geojson_properties_and_csv_tables() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CATCHMENTS_FILE),
            r#"{"type":"FeatureCollection","features":[
                {"type":"Feature","properties":{"HYBAS_ID":1120000010,"SUB_AREA":42.5},
                 "geometry":{"type":"Polygon","coordinates":[[[30,0],[30.1,0],[30.1,0.1],[30,0.1],[30,0]]]}},
                {"type":"Feature","id":"1120000020","properties":{},
                 "geometry":{"type":"Polygon","coordinates":[[[31,0],[31.1,0],[31.1,0.1],[31,0.1],[31,0]]]}},
                {"type":"Feature","properties":{"HYBAS_ID":7},
                 "geometry":{"type":"Point","coordinates":[0,0]}}
            ]}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("current.csv"), "catchID,rainfall\n1120000010,3.5\n").unwrap();

        let s = CatchmentStore::load(dir.path()).unwrap();
        assert_eq!(s.len(), 2);
        assert_eq!(s.scenarios(), vec![Scenario::Current]);
        assert_eq!(s.catchment(1_120_000_010).unwrap().area_km2, 42.5);
        // No area property: spherical area of a 0.1° cell at the equator.
        let computed = s.catchment(1_120_000_020).unwrap().area_km2;
        assert!((120.0..126.0).contains(&computed), "got {computed}");
    }

    #[test]
    fn load_without_tables_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            CatchmentStore::load(dir.path()),
            Err(AtlasError::StoreUnavailable { store: "catchment", .. })
        ));
        std::fs::write(dir.path().join(CATCHMENTS_FILE), r#"{"type":"FeatureCollection","features":[]}"#).unwrap();
        assert!(matches!(
            CatchmentStore::load(dir.path()),
            Err(AtlasError::StoreUnavailable { store: "catchment", .. })
        ));
    }
}
