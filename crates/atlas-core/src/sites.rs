//! Sites: user-defined areas of interest and the engine that edits their
//! boundaries.
//!
//! A site is created by dissolving catchments or from a supplied geometry,
//! grown and shrunk one catchment at a time, and deleted explicitly. Every
//! edit is load → mutate → persist; a failed geometry operation aborts
//! before anything is written.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use geo::MultiPolygon;
use geojson::Geometry;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bbox::{for_each_coord, BoundingBox};
use crate::catchments::CatchmentStore;
use crate::error::{AtlasError, Result};
use crate::geometry::{polygons_from_value, Boundary, GeometryEngine};
use crate::indicators::SiteIndicators;

/// How a site's boundary was first produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreationMethod {
    Shapefile,
    Geojson,
    Drawn,
    Catchments,
}

impl CreationMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shapefile => "shapefile",
            Self::Geojson => "geojson",
            Self::Drawn => "drawn",
            Self::Catchments => "catchments",
        }
    }
}

impl fmt::Display for CreationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CreationMethod {
    type Err = AtlasError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shapefile" => Ok(Self::Shapefile),
            "geojson" => Ok(Self::Geojson),
            "drawn" => Ok(Self::Drawn),
            "catchments" => Ok(Self::Catchments),
            other => Err(AtlasError::invalid(format!("unknown creation method {other:?}"))),
        }
    }
}

// ── Site ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Site {
    pub id: Uuid,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub geometry: Geometry,
    pub bounding_box: BoundingBox,
    pub area_km2: f64,
    pub creation_method: CreationMethod,
    /// Constituent catchments; kept free of duplicates.
    #[serde(default)]
    pub catchment_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indicators: Option<SiteIndicators>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Site {
    fn new(title: &str, boundary: Boundary, method: CreationMethod, catchment_ids: Vec<String>) -> Result<Self> {
        let title = title.trim();
        if title.is_empty() {
            return Err(AtlasError::invalid("site title must not be empty"));
        }
        let geometry = boundary.to_geojson();
        let bounding_box = enclosing_box(&geometry)?;
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            title: title.to_string(),
            description: None,
            geometry,
            bounding_box,
            area_km2: boundary.area_km2,
            creation_method: method,
            catchment_ids,
            indicators: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn polygons(&self) -> Result<MultiPolygon<f64>> {
        polygons_from_value(&self.geometry.value)
    }

    /// Replace the boundary, keeping bbox and area in step with it.
    fn set_boundary(&mut self, boundary: Boundary) -> Result<()> {
        let geometry = boundary.to_geojson();
        self.bounding_box = enclosing_box(&geometry)?;
        self.geometry = geometry;
        self.area_km2 = boundary.area_km2;
        Ok(())
    }

    pub fn has_catchment(&self, id: &str) -> bool {
        self.catchment_ids.iter().any(|c| c == id)
    }

    /// Returns false if the id was already present.
    pub fn add_catchment(&mut self, id: String) -> bool {
        if self.has_catchment(&id) {
            return false;
        }
        self.catchment_ids.push(id);
        true
    }

    /// Returns false if the id was not present.
    pub fn remove_catchment(&mut self, id: &str) -> bool {
        let before = self.catchment_ids.len();
        self.catchment_ids.retain(|c| c != id);
        self.catchment_ids.len() != before
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

fn enclosing_box(geometry: &Geometry) -> Result<BoundingBox> {
    BoundingBox::of_value(&geometry.value)
        .ok_or_else(|| AtlasError::geometry("boundary has no coordinates"))
}

/// Reject positions outside WGS84 lon/lat ranges.
fn check_wgs84(geometry: &Geometry) -> Result<()> {
    let mut bad = None;
    for_each_coord(&geometry.value, &mut |x, y| {
        if bad.is_none() && !((-180.0..=180.0).contains(&x) && (-90.0..=90.0).contains(&y)) {
            bad = Some((x, y));
        }
    });
    match bad {
        Some((x, y)) => Err(AtlasError::invalid(format!(
            "position ({x}, {y}) is outside lon/lat range; geometry must be EPSG:4326"
        ))),
        None => Ok(()),
    }
}

// ── Store ─────────────────────────────────────────────────────────────────────

/// One JSON document per site under `<data>/sites/`.
#[derive(Debug, Clone)]
pub struct SiteStore {
    dir: PathBuf,
}

impl SiteStore {
    /// Open the store, creating its directory if needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        debug!(path = %dir.display(), "Site store opened");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub fn exists(&self, id: Uuid) -> bool {
        self.path_of(id).is_file()
    }

    pub fn get(&self, id: Uuid) -> Result<Site> {
        let path = self.path_of(id);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AtlasError::not_found("site", id))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&text)?)
    }

    /// Persist a new site; fails if a document with its id already exists.
    pub fn create(&self, site: &Site) -> Result<()> {
        if self.exists(site.id) {
            return Err(AtlasError::invalid(format!("site {} already exists", site.id)));
        }
        self.save(site)
    }

    /// Write through a uniquely named temporary sibling and rename it over
    /// the target. Readers never see a half-written document, and of two
    /// concurrent saves the later rename wins.
    pub fn save(&self, site: &Site) -> Result<()> {
        let path = self.path_of(site.id);
        let bytes = serde_json::to_vec_pretty(site)?;
        let mut tmp = tempfile::Builder::new()
            .prefix(&format!(".{}.", site.id))
            .suffix(".tmp")
            .tempfile_in(&self.dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn delete(&self, id: Uuid) -> Result<()> {
        match std::fs::remove_file(self.path_of(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(AtlasError::not_found("site", id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Every readable site, newest first. Unreadable documents are skipped.
    pub fn list(&self) -> Result<Vec<Site>> {
        let mut sites = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_doc = path.extension().is_some_and(|e| e == "json")
                && !path.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.starts_with('.'));
            if !is_doc {
                continue;
            }
            match std::fs::read_to_string(&path)
                .map_err(AtlasError::from)
                .and_then(|text| serde_json::from_str::<Site>(&text).map_err(AtlasError::from))
            {
                Ok(site) => sites.push(site),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable site"),
            }
        }
        sites.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sites)
    }
}

// ── Boundary engine ───────────────────────────────────────────────────────────

/// Site creation and boundary editing bound to one snapshot's stores.
pub struct BoundaryEngine<'a> {
    catchments: &'a CatchmentStore,
    sites: &'a SiteStore,
    geometry: &'a dyn GeometryEngine,
}

impl<'a> BoundaryEngine<'a> {
    pub fn new(catchments: &'a CatchmentStore, sites: &'a SiteStore, geometry: &'a dyn GeometryEngine) -> Self {
        Self { catchments, sites, geometry }
    }

    /// Create a site from the dissolved union of `catchment_ids`.
    pub fn dissolve(&self, title: &str, catchment_ids: &[i64]) -> Result<Site> {
        if catchment_ids.is_empty() {
            return Err(AtlasError::invalid("at least one catchment id is required"));
        }
        let mut ids: Vec<i64> = Vec::with_capacity(catchment_ids.len());
        for id in catchment_ids {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }
        let parts = ids
            .iter()
            .map(|id| self.catchments.catchment(*id).map(|c| &c.polygons))
            .collect::<Result<Vec<_>>>()?;

        let boundary = self.geometry.dissolve(&parts)?;
        let site = Site::new(
            title,
            boundary,
            CreationMethod::Catchments,
            ids.iter().map(i64::to_string).collect(),
        )?;
        self.sites.create(&site)?;
        info!(
            site = %site.id,
            catchments = ids.len(),
            area_km2 = site.area_km2,
            engine = self.geometry.name(),
            "Site dissolved from catchments"
        );
        Ok(site)
    }

    /// Create a site from a supplied boundary. The catchment set starts empty.
    pub fn create_from_geometry(
        &self,
        title: &str,
        description: Option<String>,
        geometry: Geometry,
        method: CreationMethod,
    ) -> Result<Site> {
        if method == CreationMethod::Catchments {
            return Err(AtlasError::invalid("catchment-based sites are created by dissolving catchments"));
        }
        check_wgs84(&geometry)?;
        let polygons = polygons_from_value(&geometry.value)?;
        let boundary = self.geometry.dissolve(&[&polygons])?;
        let mut site = Site::new(title, boundary, method, Vec::new())?;
        site.description = description.filter(|d| !d.trim().is_empty());
        self.sites.create(&site)?;
        info!(site = %site.id, method = %method, area_km2 = site.area_km2, "Site created from geometry");
        Ok(site)
    }

    /// Grow the site by one catchment. Adding a catchment already in the set
    /// leaves the id list unchanged.
    pub fn union(&self, site_id: Uuid, catchment_id: i64) -> Result<Site> {
        let mut site = self.sites.get(site_id)?;
        let catchment = self.catchments.catchment(catchment_id)?;
        let boundary = self.geometry.union(&site.polygons()?, &catchment.polygons)?;

        site.set_boundary(boundary)?;
        let added = site.add_catchment(catchment_id.to_string());
        site.touch();
        self.sites.save(&site)?;
        info!(site = %site_id, catchment = catchment_id, added, area_km2 = site.area_km2, "Catchment merged into site");
        Ok(site)
    }

    /// Shrink the site by one catchment. The id is dropped from the set even
    /// when the subtraction changed nothing visible.
    pub fn difference(&self, site_id: Uuid, catchment_id: i64) -> Result<Site> {
        let mut site = self.sites.get(site_id)?;
        let catchment = self.catchments.catchment(catchment_id)?;
        let boundary = self.geometry.difference(&site.polygons()?, &catchment.polygons)?;

        site.set_boundary(boundary)?;
        let removed = site.remove_catchment(&catchment_id.to_string());
        site.touch();
        self.sites.save(&site)?;
        info!(site = %site_id, catchment = catchment_id, removed, area_km2 = site.area_km2, "Catchment removed from site");
        Ok(site)
    }

    pub fn delete(&self, site_id: Uuid) -> Result<()> {
        self.sites.delete(site_id)?;
        info!(site = %site_id, "Site deleted");
        Ok(())
    }
}
