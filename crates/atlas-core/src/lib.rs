//! Spatial attribute and site boundary engine for African catchments.
//!
//! Serves vector tiles from MBTiles, answers scenario and comparison queries
//! over HydroBASINS catchment attributes, and maintains user sites whose
//! boundaries are built from catchment polygons and summarized by
//! area-weighted indicators.

pub mod atlas;
pub mod bbox;
pub mod catchments;
pub mod config;
pub mod coords;
pub mod error;
pub mod geometry;
pub mod indicators;
pub mod sites;
pub mod tiles;

pub use atlas::{Atlas, AtlasHandle};
pub use bbox::BoundingBox;
pub use catchments::{CatchmentStore, DomainRange, Scenario};
pub use config::{AtlasConfig, DataPack, Settings};
pub use error::{AtlasError, Result};
pub use geometry::{Boundary, GeoEngine, GeometryEngine};
pub use indicators::{IndicatorAggregator, SiteIndicators};
pub use sites::{BoundaryEngine, CreationMethod, Site, SiteStore};
pub use tiles::{TileMetadata, TileStore};
