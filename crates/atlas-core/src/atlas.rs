//! The loaded stores of one data pack and the handle that swaps them.
//!
//! An [`Atlas`] is immutable once built. Callers capture one snapshot per
//! request with [`AtlasHandle::snapshot`] and use it throughout, so a reload
//! never changes the data under an operation in flight.

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use tracing::{info, warn};

use crate::catchments::CatchmentStore;
use crate::config::AtlasConfig;
use crate::error::{AtlasError, Result};
use crate::geometry::{GeoEngine, GeometryEngine};
use crate::indicators::IndicatorAggregator;
use crate::sites::{BoundaryEngine, SiteStore};
use crate::tiles::TileStore;

/// A store, or the reason it failed to load.
type Slot<T> = std::result::Result<T, String>;

fn slot<T>(store: &'static str, loaded: Result<T>) -> Slot<T> {
    loaded.map_err(|e| {
        warn!(store, error = %e, "Store unavailable");
        e.to_string()
    })
}

fn ready<'a, T>(store: &'static str, slot: &'a Slot<T>) -> Result<&'a T> {
    slot.as_ref().map_err(|reason| AtlasError::unavailable(store, reason))
}

pub struct Atlas {
    config: AtlasConfig,
    tiles: Slot<TileStore>,
    catchments: Slot<CatchmentStore>,
    sites: Slot<SiteStore>,
    geometry: Arc<dyn GeometryEngine>,
}

impl Atlas {
    /// Load every store with the default geometry engine. A store that fails
    /// is recorded as unavailable; the others keep working.
    pub fn load(config: AtlasConfig) -> Self {
        Self::load_with_engine(config, Arc::new(GeoEngine::new()))
    }

    pub fn load_with_engine(config: AtlasConfig, geometry: Arc<dyn GeometryEngine>) -> Self {
        let started = Instant::now();
        let tiles = slot("tile", TileStore::open(&config.mbtiles_dirs()));
        let catchments = slot("catchment", CatchmentStore::load(&config.data_dir));
        let sites = slot("site", SiteStore::open(config.sites_dir()));

        let atlas = Self { config, tiles, catchments, sites, geometry };
        info!(
            data_dir = %atlas.config.data_dir.display(),
            tiles = atlas.tiles.is_ok(),
            catchments = atlas.catchments.is_ok(),
            sites = atlas.sites.is_ok(),
            engine = atlas.geometry.name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Atlas loaded"
        );
        atlas
    }

    pub fn config(&self) -> &AtlasConfig {
        &self.config
    }

    pub fn tiles(&self) -> Result<&TileStore> {
        ready("tile", &self.tiles)
    }

    pub fn catchments(&self) -> Result<&CatchmentStore> {
        ready("catchment", &self.catchments)
    }

    pub fn sites(&self) -> Result<&SiteStore> {
        ready("site", &self.sites)
    }

    pub fn geometry(&self) -> &dyn GeometryEngine {
        self.geometry.as_ref()
    }

    /// `(store, reason)` for every store that failed to load.
    pub fn unavailable(&self) -> Vec<(&'static str, &str)> {
        let mut out = Vec::new();
        if let Err(r) = &self.tiles {
            out.push(("tile", r.as_str()));
        }
        if let Err(r) = &self.catchments {
            out.push(("catchment", r.as_str()));
        }
        if let Err(r) = &self.sites {
            out.push(("site", r.as_str()));
        }
        out
    }

    pub fn boundary_engine(&self) -> Result<BoundaryEngine<'_>> {
        Ok(BoundaryEngine::new(self.catchments()?, self.sites()?, self.geometry()))
    }

    pub fn indicator_aggregator(&self) -> Result<IndicatorAggregator<'_>> {
        Ok(IndicatorAggregator::new(self.catchments()?, self.sites()?))
    }
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Shared, atomically replaceable pointer to the current [`Atlas`].
pub struct AtlasHandle {
    current: ArcSwap<Atlas>,
}

impl AtlasHandle {
    pub fn new(atlas: Atlas) -> Self {
        Self { current: ArcSwap::from_pointee(atlas) }
    }

    pub fn load(config: AtlasConfig) -> Self {
        Self::new(Atlas::load(config))
    }

    /// The snapshot to use for one whole operation.
    pub fn snapshot(&self) -> Arc<Atlas> {
        self.current.load_full()
    }

    /// Load a fresh snapshot from `config` and swap it in. Holders of the
    /// previous snapshot keep it until they drop it.
    pub fn reload(&self, config: AtlasConfig) -> Arc<Atlas> {
        self.replace(Atlas::load(config))
    }

    pub fn replace(&self, atlas: Atlas) -> Arc<Atlas> {
        let atlas = Arc::new(atlas);
        let previous = self.current.swap(Arc::clone(&atlas));
        info!(
            from = %previous.config.data_dir.display(),
            to = %atlas.config.data_dir.display(),
            "Atlas snapshot swapped"
        );
        atlas
    }
}
