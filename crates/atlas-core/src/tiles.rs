//! Read-only MBTiles tile store.
//!
//! Each `*.mbtiles` file found in the configured directories becomes a
//! tileset named after its file stem. Lookups translate XYZ rows to the TMS
//! rows MBTiles stores (`tmsY = 2^z - 1 - y`) and read the blob verbatim;
//! tiles are usually gzip-compressed protobuf and are never decoded here.
//!
//! Every tileset owns a small pool of read-only connections, so concurrent
//! requests against one file do not queue behind each other.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::coords::TileAddr;
use crate::error::{AtlasError, Result};

const TILE_SQL: &str =
    "SELECT tile_data FROM tiles WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3";

// Africa-wide catchment defaults used when a tileset's metadata is silent.
const DEFAULT_MINZOOM: u32 = 2;
const DEFAULT_MAXZOOM: u32 = 15;
const DEFAULT_BOUNDS: [f64; 4] = [-17.546539, -34.837477, 63.500977, 37.352693];
const DEFAULT_CENTER: [f64; 3] = [22.977, 1.258, 4.0];

const POOL_MAX_SIZE: u32 = 8;
const POOL_TIMEOUT: Duration = Duration::from_secs(5);

/// Parsed `metadata(name, value)` table of one tileset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TileMetadata {
    pub name: Option<String>,
    pub format: Option<String>,
    pub minzoom: Option<u32>,
    pub maxzoom: Option<u32>,
    /// `[west, south, east, north]`.
    pub bounds: Option<[f64; 4]>,
    /// `[lon, lat, zoom]`.
    pub center: Option<[f64; 3]>,
    /// Copied from the `vector_layers` key of the `json` metadata row.
    pub vector_layers: Option<serde_json::Value>,
}

/// Transfer encoding of a stored tile blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileEncoding {
    Gzip,
    Identity,
}

impl TileEncoding {
    /// Sniff the gzip magic bytes.
    pub fn detect(data: &[u8]) -> Self {
        if data.starts_with(&[0x1f, 0x8b]) {
            Self::Gzip
        } else {
            Self::Identity
        }
    }

    /// Value for a `Content-Encoding` header, if one is needed.
    pub fn content_encoding(self) -> Option<&'static str> {
        match self {
            Self::Gzip => Some("gzip"),
            Self::Identity => None,
        }
    }
}

struct Tileset {
    path: PathBuf,
    pool: Pool<SqliteConnectionManager>,
}

/// All tilesets of one data pack. Immutable after `open`.
pub struct TileStore {
    tilesets: BTreeMap<String, Tileset>,
}

impl TileStore {
    /// Scan `dirs` in order for `*.mbtiles` files. Earlier directories win on
    /// name clashes; missing directories are skipped.
    pub fn open(dirs: &[PathBuf]) -> Result<Self> {
        let mut tilesets: BTreeMap<String, Tileset> = BTreeMap::new();

        for dir in dirs {
            if !dir.is_dir() {
                debug!(dir = %dir.display(), "MBTiles directory missing, skipping");
                continue;
            }
            let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "mbtiles"))
                .collect();
            paths.sort();

            for path in paths {
                let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                    continue;
                };
                if let Some(existing) = tilesets.get(&name) {
                    warn!(
                        tileset = %name,
                        kept = %existing.path.display(),
                        ignored = %path.display(),
                        "Duplicate tileset name"
                    );
                    continue;
                }
                match open_pool(&path) {
                    Ok(pool) => {
                        debug!(tileset = %name, path = %path.display(), "Tileset opened");
                        tilesets.insert(name, Tileset { path, pool });
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable MBTiles file"),
                }
            }
        }

        if tilesets.is_empty() {
            let searched: Vec<String> = dirs.iter().map(|d| d.display().to_string()).collect();
            return Err(AtlasError::unavailable(
                "tile",
                format!("no MBTiles files found in [{}]", searched.join(", ")),
            ));
        }

        info!(count = tilesets.len(), "Tile store opened");
        Ok(Self { tilesets })
    }

    /// Sorted tileset names.
    pub fn tileset_names(&self) -> Vec<String> {
        self.tilesets.keys().cloned().collect()
    }

    fn tileset(&self, name: &str) -> Result<&Tileset> {
        self.tilesets.get(name).ok_or_else(|| AtlasError::not_found("tileset", name))
    }

    /// Fetch the blob stored for XYZ address `z/x/y`.
    pub fn get_tile(&self, tileset: &str, z: u32, x: u32, y: u32) -> Result<Vec<u8>> {
        let ts = self.tileset(tileset)?;
        let addr = TileAddr::new(z, x, y);
        addr.validate()?;

        let conn = ts.pool.get()?;
        let data: Option<Vec<u8>> = conn
            .prepare_cached(TILE_SQL)?
            .query_row(params![addr.zoom, addr.x, addr.tms_row()], |row| row.get(0))
            .optional()?;
        data.ok_or_else(|| AtlasError::not_found("tile", format!("{tileset}/{z}/{x}/{y}")))
    }

    pub fn get_metadata(&self, tileset: &str) -> Result<TileMetadata> {
        let ts = self.tileset(tileset)?;
        let conn = ts.pool.get()?;
        let mut stmt = conn.prepare("SELECT name, value FROM metadata")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

        let mut meta = TileMetadata::default();
        for row in rows {
            let (name, value) = row?;
            match name.as_str() {
                "name" => meta.name = Some(value),
                "format" => meta.format = Some(value),
                "minzoom" => meta.minzoom = value.trim().parse().ok(),
                "maxzoom" => meta.maxzoom = value.trim().parse().ok(),
                "bounds" => meta.bounds = parse_floats(&value),
                "center" => meta.center = parse_floats(&value),
                "json" => match serde_json::from_str::<serde_json::Value>(&value) {
                    Ok(doc) => meta.vector_layers = doc.get("vector_layers").cloned(),
                    Err(e) => warn!(tileset, error = %e, "Ignoring malformed metadata json"),
                },
                _ => {}
            }
        }
        Ok(meta)
    }

    /// TileJSON 2.2.0 document for `tileset`, served with `tiles_url` as
    /// its single tile template.
    pub fn tile_json(&self, tileset: &str, tiles_url: &str) -> Result<serde_json::Value> {
        let meta = self.get_metadata(tileset)?;
        let mut doc = json!({
            "tilejson": "2.2.0",
            "name": meta.name.as_deref().unwrap_or(tileset),
            "scheme": "xyz",
            "tiles": [tiles_url],
            "minzoom": meta.minzoom.unwrap_or(DEFAULT_MINZOOM),
            "maxzoom": meta.maxzoom.unwrap_or(DEFAULT_MAXZOOM),
            "bounds": meta.bounds.unwrap_or(DEFAULT_BOUNDS),
            "center": meta.center.unwrap_or(DEFAULT_CENTER),
        });
        if let Some(layers) = meta.vector_layers {
            doc["vector_layers"] = layers;
        }
        Ok(doc)
    }
}

const READ_ONLY: OpenFlags = OpenFlags::SQLITE_OPEN_READ_ONLY.union(OpenFlags::SQLITE_OPEN_NO_MUTEX);

fn open_pool(path: &Path) -> Result<Pool<SqliteConnectionManager>> {
    // Fail at load time rather than on the first request.
    let check = Connection::open_with_flags(path, READ_ONLY)?;
    check.query_row("SELECT count(*) FROM metadata", [], |row| row.get::<_, i64>(0))?;
    drop(check);

    let manager = SqliteConnectionManager::file(path).with_flags(READ_ONLY);
    let pool = Pool::builder()
        .max_size(POOL_MAX_SIZE)
        .min_idle(Some(1))
        .connection_timeout(POOL_TIMEOUT)
        .build(manager)?;
    Ok(pool)
}

/// Parse exactly `N` comma-separated floats.
fn parse_floats<const N: usize>(s: &str) -> Option<[f64; N]> {
    let values: Vec<f64> = s.split(',').map(|p| p.trim().parse().ok()).collect::<Option<_>>()?;
    values.try_into().ok()
}
