//! Error taxonomy shared by every store and engine in the crate.
//!
//! Nothing here retries: each failure is returned synchronously to the caller.

use thiserror::Error;

/// Result alias used throughout `atlas-core`.
pub type Result<T> = std::result::Result<T, AtlasError>;

#[derive(Error, Debug)]
pub enum AtlasError {
    /// Unknown tileset, scenario, attribute, catchment or site.
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// Malformed bbox, tile address, geometry or missing parameter.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A spatial operation produced an empty or invalid result.
    #[error("geometry error: {0}")]
    Geometry(String),

    /// A store failed to load; the rest of the atlas keeps working.
    #[error("{store} store unavailable: {reason}")]
    StoreUnavailable { store: &'static str, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("tile database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("geojson error: {0}")]
    GeoJson(#[from] geojson::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}

impl AtlasError {
    pub fn not_found(kind: &'static str, name: impl ToString) -> Self {
        Self::NotFound { kind, name: name.to_string() }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn geometry(msg: impl Into<String>) -> Self {
        Self::Geometry(msg.into())
    }

    pub fn unavailable(store: &'static str, reason: impl ToString) -> Self {
        Self::StoreUnavailable { store, reason: reason.to_string() }
    }

    /// True for the `NotFound` family, which callers usually map to a 404.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
